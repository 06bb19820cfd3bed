//! Editing operations: deletion with coincidence repair, point
//! replacement, forcing geometry to values and snapshots.

use glam::{DQuat, DVec3};

use super::{ConstraintKind, EntityKind, Param, Sketch, SketchError, SketchResult};
use crate::handle::{ConstraintId, EntityId, GroupId, ParamOwner, RequestId};

impl Sketch {
    /// Delete a constraint and its helper parameters
    pub fn delete_constraint(&mut self, id: ConstraintId) -> SketchResult<()> {
        let constraint = self
            .constraints
            .remove(id)
            .ok_or(SketchError::ConstraintNotFound(id))?;
        self.params
            .retain(|p| p.id.owner != ParamOwner::Constraint(id));
        self.mark_dirty(constraint.group);
        Ok(())
    }

    /// Delete a request with its entities and parameters
    ///
    /// Coincidences through each deleted point are repaired first, then
    /// constraints left referring to the request's entities are removed.
    pub fn delete_request(&mut self, id: RequestId) -> SketchResult<()> {
        let request = self.request(id)?.clone();

        let points: Vec<EntityId> = self
            .entities
            .iter()
            .filter(|e| e.id.request_id() == Some(id) && e.is_point())
            .map(|e| e.id)
            .collect();
        for point in points {
            self.fix_constraints_for_point_being_deleted(point);
        }

        let doomed: Vec<ConstraintId> = self
            .constraints
            .iter()
            .filter(|c| {
                c.kind
                    .referenced_entities()
                    .iter()
                    .chain(c.workplane.iter())
                    .any(|e| e.request_id() == Some(id))
            })
            .map(|c| c.id)
            .collect();
        for cid in doomed {
            tracing::debug!("Removing {} with deleted request {}", cid, id);
            self.delete_constraint(cid)?;
        }

        self.entities.retain(|e| e.id.request_id() != Some(id));
        self.params.retain(|p| p.id.owner != ParamOwner::Request(id));
        self.requests.remove(id);
        self.mark_dirty(request.group);
        Ok(())
    }

    /// Mark a request and its entities as construction geometry
    pub fn set_construction(&mut self, id: RequestId, construction: bool) -> SketchResult<()> {
        let request = self
            .requests
            .get_mut(id)
            .ok_or(SketchError::RequestNotFound(id))?;
        request.construction = construction;
        let group = request.group;
        for entity in self.entities.iter_mut() {
            if entity.id.request_id() == Some(id) {
                entity.construction = construction;
            }
        }
        self.mark_dirty(group);
        Ok(())
    }

    /// Point every constraint at `new` where it referred to `old`
    pub fn replace_point_in_constraints(&mut self, old: EntityId, new: EntityId) -> usize {
        let mut count = 0;
        let mut touched = Vec::new();
        for constraint in self.constraints.iter_mut() {
            for field in constraint.kind.point_fields_mut() {
                if *field == old {
                    *field = new;
                    count += 1;
                    touched.push(constraint.group);
                }
            }
        }
        for group in touched {
            self.mark_dirty(group);
        }
        count
    }

    /// Remove every constraint that refers to a point
    pub fn remove_constraints_for_point(&mut self, point: EntityId) -> usize {
        let doomed: Vec<ConstraintId> = self
            .constraints
            .iter()
            .filter(|c| c.kind.point_fields().contains(&point))
            .map(|c| c.id)
            .collect();
        let count = doomed.len();
        for cid in doomed {
            if let Err(e) = self.delete_constraint(cid) {
                tracing::warn!("Could not remove {} from {}: {}", cid, point, e);
            }
        }
        count
    }

    /// Replace the coincidences through a point with a chain between the
    /// points it was joined to, so that A=B, B=C becomes A=C
    pub fn fix_constraints_for_point_being_deleted(&mut self, point: EntityId) {
        let Ok(entity) = self.entity(point) else {
            return;
        };
        let group = entity.group;
        let workplane = entity.workplane;

        let mut others = Vec::new();
        let mut doomed = Vec::new();
        for c in self.constraints.iter() {
            if c.group != group {
                continue;
            }
            if let ConstraintKind::PointsCoincident { a, b } = c.kind {
                if a == point {
                    others.push(b);
                    doomed.push(c.id);
                } else if b == point {
                    others.push(a);
                    doomed.push(c.id);
                }
            }
        }
        for cid in doomed {
            if let Err(e) = self.delete_constraint(cid) {
                tracing::warn!("Could not remove {} through {}: {}", cid, point, e);
            }
        }
        for pair in others.windows(2) {
            if let Err(e) =
                self.add_constraint(group, workplane, ConstraintKind::coincident(pair[0], pair[1]))
            {
                tracing::warn!("Could not rejoin {} and {}: {}", pair[0], pair[1], e);
            }
        }
    }

    /// Delete constraints whose entities no longer exist
    pub fn prune_dangling_constraints(&mut self, group: GroupId) -> Vec<ConstraintId> {
        let dangling: Vec<ConstraintId> = self
            .constraints
            .iter()
            .filter(|c| c.group == group)
            .filter(|c| {
                c.kind
                    .referenced_entities()
                    .iter()
                    .chain(c.workplane.iter())
                    .any(|e| !self.entities.contains(*e))
            })
            .map(|c| c.id)
            .collect();
        for cid in &dangling {
            tracing::warn!("Pruning constraint {} with missing entities", cid);
            if let Err(e) = self.delete_constraint(*cid) {
                tracing::warn!("Could not prune {}: {}", cid, e);
            }
        }
        dangling
    }

    // ============== Forcing values ==============

    /// Move a point to a position in space
    ///
    /// Points in a workplane are projected into it.
    pub fn force_point_to(&mut self, point: EntityId, at: DVec3) -> SketchResult<()> {
        let entity = self.entity(point)?;
        match entity.kind.clone() {
            EntityKind::PointIn3d { params } => {
                for (param, value) in params.into_iter().zip(at.to_array()) {
                    self.set_param(param, value)?;
                }
            }
            EntityKind::PointIn2d { params } => {
                let wp = entity.workplane.ok_or(SketchError::MissingWorkplane(point))?;
                let uv = self.workplane_frame(wp)?.project(at);
                self.set_param(params[0], uv.x)?;
                self.set_param(params[1], uv.y)?;
            }
            EntityKind::PointCopy { .. } => return Err(SketchError::NotEditable(point)),
            _ => {
                return Err(SketchError::WrongEntityKind {
                    entity: point,
                    expected: "point",
                });
            }
        }
        Ok(())
    }

    /// Set a free normal's orientation
    pub fn force_normal_to(&mut self, normal: EntityId, orientation: DQuat) -> SketchResult<()> {
        match self.entity(normal)?.kind.clone() {
            EntityKind::NormalIn3d { params } => {
                let q = orientation.normalize();
                for (param, value) in params.into_iter().zip([q.w, q.x, q.y, q.z]) {
                    self.set_param(param, value)?;
                }
                Ok(())
            }
            EntityKind::NormalIn2d | EntityKind::NormalCopy { .. } => {
                Err(SketchError::NotEditable(normal))
            }
            _ => Err(SketchError::WrongEntityKind {
                entity: normal,
                expected: "normal",
            }),
        }
    }

    /// Set a distance entity's value
    pub fn force_distance_to(&mut self, distance: EntityId, value: f64) -> SketchResult<()> {
        match self.entity(distance)?.kind.clone() {
            EntityKind::Distance { param } => self.set_param(param, value),
            EntityKind::DistanceCopy { .. } => Err(SketchError::NotEditable(distance)),
            _ => Err(SketchError::WrongEntityKind {
                entity: distance,
                expected: "distance",
            }),
        }
    }

    /// Points in the same group and workplane that sit exactly where
    /// `point` is
    pub fn points_coincident_with(&self, point: EntityId) -> SketchResult<Vec<EntityId>> {
        let entity = self.entity(point)?;
        let at = self.point_position(point)?;
        Ok(self
            .entities
            .iter()
            .filter(|e| {
                e.id != point
                    && e.is_point()
                    && e.group == entity.group
                    && e.workplane == entity.workplane
            })
            .filter(|e| {
                self.point_position(e.id)
                    .map(|p| p.distance_squared(at) < 1e-18)
                    .unwrap_or(false)
            })
            .map(|e| e.id)
            .collect())
    }

    /// Add a coincidence to the first other point at the same position
    pub fn constrain_point_if_coincident(&mut self, point: EntityId) -> SketchResult<bool> {
        let Some(other) = self.points_coincident_with(point)?.into_iter().next() else {
            return Ok(false);
        };
        let entity = self.entity(point)?;
        let (group, workplane) = (entity.group, entity.workplane);
        self.add_constraint(group, workplane, ConstraintKind::coincident(point, other))
            .map_err(|e| SketchError::InvalidRequest(e.to_string()))?;
        Ok(true)
    }

    // ============== Snapshots ==============

    /// Copy of the whole sketch for later [`Sketch::restore`]
    pub fn snapshot(&self) -> Sketch {
        self.clone()
    }

    pub fn restore(&mut self, snapshot: Sketch) {
        *self = snapshot;
    }

    pub(crate) fn insert_param(&mut self, param: Param) {
        self.params.insert(param);
    }
}
