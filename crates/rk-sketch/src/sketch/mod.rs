//! Sketch Context
//!
//! The sketch owns every record of a model: groups, requests, constraints,
//! entities and parameters, each in a handle-indexed registry. Edits go
//! through the sketch so that the owning group is marked dirty.

mod compile;
pub mod constraint;
mod edit;
pub mod entity;
pub mod request;

pub use compile::{generate_equations, improve_initial_guess, modify_to_satisfy, tangent_between, validate};
pub use constraint::{
    ArcEnd, Constraint, ConstraintError, ConstraintKind, ConstraintResult, TangentEnds,
};
pub use entity::{ArcAngles, CopyTransform, Entity, EntityKind, FaceNormal, Frame};
pub use request::{Request, RequestExpansion, RequestKind};

use std::collections::HashMap;
use std::path::Path;

use glam::{DQuat, DVec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::expr::Expr;
use crate::group::{Group, GroupKind};
use crate::handle::{
    ConstraintId, EntityId, EquationId, GroupId, Keyed, ParamId, Registry, RequestId,
};

/// Sketch-related errors
#[derive(Debug, Clone, Error)]
pub enum SketchError {
    #[error("Group not found: {0}")]
    GroupNotFound(GroupId),

    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    #[error("Constraint not found: {0}")]
    ConstraintNotFound(ConstraintId),

    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("Parameter not found: {0}")]
    ParamNotFound(ParamId),

    #[error("Entity {entity} is not a {expected}")]
    WrongEntityKind {
        entity: EntityId,
        expected: &'static str,
    },

    #[error("Entity {0} has no workplane")]
    MissingWorkplane(EntityId),

    #[error("{0} must be drawn in a workplane")]
    WorkplaneRequired(&'static str),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid group: {0}")]
    InvalidGroup(String),

    #[error("Entity {0} cannot be edited directly")]
    NotEditable(EntityId),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Deserialization error: {0}")]
    Deserialize(String),
}

/// Result type for sketch operations
pub type SketchResult<T> = Result<T, SketchError>;

/// One real unknown
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub id: ParamId,
    /// Group whose solve owns this parameter
    pub group: GroupId,
    pub value: f64,
}

impl Keyed for Param {
    type Key = ParamId;

    fn key(&self) -> ParamId {
        self.id
    }
}

/// A residual that the solver drives to zero
#[derive(Debug, Clone, PartialEq)]
pub struct Equation {
    pub id: EquationId,
    pub expr: Expr,
}

impl Equation {
    pub fn new(id: EquationId, expr: Expr) -> Self {
        Self { id, expr }
    }
}

/// A complete parametric model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sketch {
    /// File format version
    #[serde(default = "default_version")]
    pub version: u32,
    pub(crate) groups: Registry<Group>,
    pub(crate) requests: Registry<Request>,
    pub(crate) constraints: Registry<Constraint>,
    pub(crate) entities: Registry<Entity>,
    pub(crate) params: Registry<Param>,
    next_group: u32,
    next_request: u32,
    next_constraint: u32,
}

fn default_version() -> u32 {
    1
}

impl Default for Sketch {
    fn default() -> Self {
        Self::new()
    }
}

impl Sketch {
    /// Create an empty sketch
    pub fn new() -> Self {
        Self {
            version: default_version(),
            groups: Registry::new(),
            requests: Registry::new(),
            constraints: Registry::new(),
            entities: Registry::new(),
            params: Registry::new(),
            next_group: 1,
            next_request: 1,
            next_constraint: 1,
        }
    }

    // ============== Groups ==============

    /// Add a group
    ///
    /// `op_a` is the group whose geometry a derived group copies. Drawing
    /// groups may name one to inherit its workplane.
    pub fn add_group(
        &mut self,
        name: impl Into<String>,
        kind: GroupKind,
        op_a: Option<GroupId>,
    ) -> SketchResult<GroupId> {
        if let Some(src) = op_a {
            if !self.groups.contains(src) {
                return Err(SketchError::GroupNotFound(src));
            }
        } else if kind.is_derived() {
            return Err(SketchError::InvalidGroup(format!(
                "{} group needs a source group",
                kind.type_name()
            )));
        }

        let id = GroupId(self.next_group);
        self.next_group += 1;

        let workplane = match &kind {
            GroupKind::DrawingWorkplane { .. } => Some(EntityId::predefined(id, 0)),
            _ => op_a.and_then(|src| self.groups.get(src)).and_then(|g| g.workplane),
        };

        let mut group = Group::new(id, name, kind);
        group.op_a = op_a;
        group.workplane = workplane;
        self.groups.insert(group);
        if let Err(e) = self.generate_group(id) {
            self.groups.remove(id);
            return Err(e);
        }

        tracing::debug!("Added group {}", id);
        Ok(id)
    }

    pub fn group(&self, id: GroupId) -> SketchResult<&Group> {
        self.groups.get(id).ok_or(SketchError::GroupNotFound(id))
    }

    pub fn group_mut(&mut self, id: GroupId) -> SketchResult<&mut Group> {
        self.groups.get_mut(id).ok_or(SketchError::GroupNotFound(id))
    }

    /// Groups in creation order
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter()
    }

    /// Clear a group's clean flag so the next pass regenerates it
    pub fn mark_dirty(&mut self, id: GroupId) {
        if let Some(group) = self.groups.get_mut(id) {
            group.clean = false;
        }
    }

    // ============== Lookups ==============

    pub fn request(&self, id: RequestId) -> SketchResult<&Request> {
        self.requests.get(id).ok_or(SketchError::RequestNotFound(id))
    }

    pub fn requests(&self) -> impl Iterator<Item = &Request> {
        self.requests.iter()
    }

    pub fn constraint(&self, id: ConstraintId) -> SketchResult<&Constraint> {
        self.constraints
            .get(id)
            .ok_or(SketchError::ConstraintNotFound(id))
    }

    pub fn constraints(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.iter()
    }

    pub fn entity(&self, id: EntityId) -> SketchResult<&Entity> {
        self.entities.get(id).ok_or(SketchError::EntityNotFound(id))
    }

    pub fn has_entity(&self, id: EntityId) -> bool {
        self.entities.contains(id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter()
    }

    pub fn params(&self) -> impl Iterator<Item = &Param> {
        self.params.iter()
    }

    /// Current value of a parameter, NaN if it does not exist
    pub fn value_of(&self, id: ParamId) -> f64 {
        self.params.get(id).map(|p| p.value).unwrap_or(f64::NAN)
    }

    pub fn param_value(&self, id: ParamId) -> SketchResult<f64> {
        self.params
            .get(id)
            .map(|p| p.value)
            .ok_or(SketchError::ParamNotFound(id))
    }

    /// Set a parameter's value directly
    pub fn set_param(&mut self, id: ParamId, value: f64) -> SketchResult<()> {
        let param = self
            .params
            .get_mut(id)
            .ok_or(SketchError::ParamNotFound(id))?;
        param.value = value;
        let group = param.group;
        self.mark_dirty(group);
        Ok(())
    }

    // ============== Requests ==============

    /// Add a request and expand it into entities and parameters
    pub fn add_request(
        &mut self,
        group: GroupId,
        kind: RequestKind,
        workplane: Option<EntityId>,
        construction: bool,
    ) -> SketchResult<RequestId> {
        self.group(group)?;
        if let Some(wp) = workplane {
            if !self.entity(wp)?.is_workplane() {
                return Err(SketchError::WrongEntityKind {
                    entity: wp,
                    expected: "workplane",
                });
            }
        }
        match kind {
            RequestKind::ArcOfCircle if workplane.is_none() => {
                return Err(SketchError::WorkplaneRequired(kind.type_name()));
            }
            RequestKind::Workplane if workplane.is_some() => {
                return Err(SketchError::InvalidRequest(
                    "a workplane cannot be drawn in another workplane".into(),
                ));
            }
            _ => {}
        }

        let id = RequestId(self.next_request);
        self.next_request += 1;
        let request = Request {
            id,
            group,
            workplane,
            kind,
            construction,
        };
        self.insert_expansion(&request, &HashMap::new());
        self.requests.insert(request);
        self.mark_dirty(group);
        Ok(id)
    }

    /// Insert a request's entities and parameters
    ///
    /// Values come from `carry`, then from an existing parameter, then from
    /// the request's defaults.
    pub(crate) fn insert_expansion(&mut self, request: &Request, carry: &HashMap<ParamId, f64>) {
        let expansion = request.expand();
        for (id, default) in expansion.params {
            let value = carry
                .get(&id)
                .copied()
                .or_else(|| self.params.get(id).map(|p| p.value))
                .unwrap_or(default);
            self.params.insert(Param {
                id,
                group: request.group,
                value,
            });
        }
        for entity in expansion.entities {
            self.entities.insert(entity);
        }
    }

    /// Add a datum point at a position
    pub fn add_point(
        &mut self,
        group: GroupId,
        workplane: Option<EntityId>,
        at: DVec3,
    ) -> SketchResult<RequestId> {
        let id = self.add_request(group, RequestKind::DatumPoint, workplane, false)?;
        let point = self.request(id)?.point(0);
        self.force_point_to(point, at)?;
        Ok(id)
    }

    /// Add a line segment between two positions
    pub fn add_line(
        &mut self,
        group: GroupId,
        workplane: Option<EntityId>,
        a: DVec3,
        b: DVec3,
    ) -> SketchResult<RequestId> {
        let id = self.add_request(group, RequestKind::LineSegment, workplane, false)?;
        let request = self.request(id)?.clone();
        self.force_point_to(request.point(0), a)?;
        self.force_point_to(request.point(1), b)?;
        Ok(id)
    }

    /// Add a circle; outside a workplane it lies in the XY plane
    pub fn add_circle(
        &mut self,
        group: GroupId,
        workplane: Option<EntityId>,
        center: DVec3,
        radius: f64,
    ) -> SketchResult<RequestId> {
        let id = self.add_request(group, RequestKind::Circle, workplane, false)?;
        let request = self.request(id)?.clone();
        self.force_point_to(request.point(0), center)?;
        self.force_distance_to(
            EntityId::request(id, request::DISTANCE_INDEX),
            radius,
        )?;
        Ok(id)
    }

    /// Add an arc, counter-clockwise from `start` to `finish`
    pub fn add_arc(
        &mut self,
        group: GroupId,
        workplane: EntityId,
        center: DVec3,
        start: DVec3,
        finish: DVec3,
    ) -> SketchResult<RequestId> {
        let id = self.add_request(group, RequestKind::ArcOfCircle, Some(workplane), false)?;
        let request = self.request(id)?.clone();
        self.force_point_to(request.point(0), center)?;
        self.force_point_to(request.point(1), start)?;
        self.force_point_to(request.point(2), finish)?;
        Ok(id)
    }

    /// Add a cubic Bezier through four control points
    pub fn add_cubic(
        &mut self,
        group: GroupId,
        workplane: Option<EntityId>,
        points: [DVec3; 4],
    ) -> SketchResult<RequestId> {
        let id = self.add_request(group, RequestKind::Cubic, workplane, false)?;
        let request = self.request(id)?.clone();
        for (n, p) in points.into_iter().enumerate() {
            self.force_point_to(request.point(n as u32), p)?;
        }
        Ok(id)
    }

    /// Add a free workplane
    pub fn add_workplane(
        &mut self,
        group: GroupId,
        origin: DVec3,
        orientation: DQuat,
    ) -> SketchResult<RequestId> {
        let id = self.add_request(group, RequestKind::Workplane, None, false)?;
        let request = self.request(id)?.clone();
        self.force_point_to(request.point(0), origin)?;
        self.force_normal_to(
            EntityId::request(id, request::NORMAL_INDEX),
            orientation,
        )?;
        Ok(id)
    }

    // ============== Constraints ==============

    /// Validate and add a constraint
    ///
    /// The sketch is left untouched when validation fails.
    pub fn add_constraint(
        &mut self,
        group: GroupId,
        workplane: Option<EntityId>,
        kind: ConstraintKind,
    ) -> ConstraintResult<ConstraintId> {
        self.insert_constraint(group, workplane, kind, false)
    }

    /// Add a reference dimension measured from the current geometry
    pub fn add_reference(
        &mut self,
        group: GroupId,
        workplane: Option<EntityId>,
        kind: ConstraintKind,
    ) -> ConstraintResult<ConstraintId> {
        self.insert_constraint(group, workplane, kind, true)
    }

    fn insert_constraint(
        &mut self,
        group: GroupId,
        workplane: Option<EntityId>,
        kind: ConstraintKind,
        reference: bool,
    ) -> ConstraintResult<ConstraintId> {
        self.group(group)?;
        validate(self, group, workplane, &kind)?;

        let id = ConstraintId(self.next_constraint);
        self.next_constraint += 1;
        let constraint = Constraint {
            id,
            group,
            workplane,
            kind,
            reference,
        };
        for param in constraint.helper_params() {
            self.params.insert(Param {
                id: param,
                group,
                value: 0.0,
            });
        }
        self.constraints.insert(constraint);

        let seeded = if reference {
            modify_to_satisfy(self, id)
        } else {
            Ok(())
        }
        .and_then(|_| improve_initial_guess(self, id));
        if let Err(e) = seeded {
            self.delete_constraint(id)?;
            return Err(e);
        }
        self.mark_dirty(group);
        Ok(id)
    }

    /// Change the value of a dimension
    pub fn set_constraint_value(&mut self, id: ConstraintId, value: f64) -> SketchResult<bool> {
        let constraint = self
            .constraints
            .get_mut(id)
            .ok_or(SketchError::ConstraintNotFound(id))?;
        let changed = constraint.kind.set_value(value);
        let group = constraint.group;
        self.mark_dirty(group);
        Ok(changed)
    }

    // ============== Persistence ==============

    /// Save the sketch to a file
    pub fn save(&self, path: impl AsRef<Path>) -> SketchResult<()> {
        let content = self.to_ron()?;
        std::fs::write(path.as_ref(), content).map_err(|e| SketchError::Io(e.to_string()))?;
        Ok(())
    }

    /// Load a sketch from a file
    pub fn load(path: impl AsRef<Path>) -> SketchResult<Self> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|e| SketchError::Io(e.to_string()))?;
        Self::from_ron(&content)
    }

    /// Serialize to pretty-printed RON
    pub fn to_ron(&self) -> SketchResult<String> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| SketchError::Serialize(e.to_string()))
    }

    /// Deserialize from RON; every group starts dirty
    pub fn from_ron(content: &str) -> SketchResult<Self> {
        let sketch: Sketch =
            ron::from_str(content).map_err(|e| SketchError::Deserialize(e.to_string()))?;
        Ok(sketch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn drawing() -> (Sketch, GroupId, EntityId) {
        let mut sketch = Sketch::new();
        let g = sketch
            .add_group("sketch", GroupKind::workplane_xy(), None)
            .unwrap();
        let wp = sketch.group(g).unwrap().workplane.unwrap();
        (sketch, g, wp)
    }

    #[test]
    fn test_drawing_group_has_workplane() {
        let (sketch, g, wp) = drawing();
        assert_eq!(wp, EntityId::predefined(g, 0));
        let frame = sketch.workplane_frame(wp).unwrap();
        assert_relative_eq!(frame.normal().z, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_add_line_in_workplane() {
        let (mut sketch, g, wp) = drawing();
        let r = sketch
            .add_line(g, Some(wp), DVec3::new(1.0, 2.0, 0.0), DVec3::new(4.0, 6.0, 0.0))
            .unwrap();
        let request = sketch.request(r).unwrap().clone();
        let b = sketch.point_position(request.point(1)).unwrap();
        assert_relative_eq!(b.x, 4.0);
        assert_relative_eq!(b.y, 6.0);
        assert!(sketch.entity(request.entity()).unwrap().is_line());
        assert!(!sketch.group(g).unwrap().clean);
    }

    #[test]
    fn test_arc_requires_workplane() {
        let mut sketch = Sketch::new();
        let g = sketch.add_group("3d", GroupKind::Drawing3d, None).unwrap();
        let err = sketch.add_request(g, RequestKind::ArcOfCircle, None, false);
        assert!(matches!(err, Err(SketchError::WorkplaneRequired(_))));
        assert_eq!(sketch.requests().count(), 0);
    }

    #[test]
    fn test_invalid_constraint_leaves_sketch_unchanged() {
        let (mut sketch, g, wp) = drawing();
        let p = sketch.add_point(g, Some(wp), DVec3::ZERO).unwrap();
        let point = sketch.request(p).unwrap().point(0);
        let before = sketch.constraints().count();
        let err = sketch.add_constraint(g, Some(wp), ConstraintKind::horizontal(point));
        assert!(err.is_err());
        assert_eq!(sketch.constraints().count(), before);
    }

    #[test]
    fn test_save_and_load() {
        let (mut sketch, g, wp) = drawing();
        let r = sketch
            .add_line(g, Some(wp), DVec3::ZERO, DVec3::new(3.0, 0.0, 0.0))
            .unwrap();
        let line = sketch.request(r).unwrap().entity();
        sketch
            .add_constraint(g, Some(wp), ConstraintKind::horizontal(line))
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ron");
        sketch.save(&path).unwrap();
        let loaded = Sketch::load(&path).unwrap();

        assert_eq!(loaded.requests().count(), 1);
        assert_eq!(loaded.constraints().count(), 1);
        let b = loaded
            .point_position(loaded.request(r).unwrap().point(1))
            .unwrap();
        assert_relative_eq!(b.x, 3.0);
    }
}
