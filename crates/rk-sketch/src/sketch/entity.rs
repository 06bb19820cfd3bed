//! Sketch Entities
//!
//! Points, normals, distances, workplanes, curves and faces. Every entity
//! evaluates symbolically (so constraints can be written against it) and
//! numerically through those same expressions.

use glam::{DQuat, DVec2, DVec3};
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

use super::{Equation, Sketch, SketchError, SketchResult};
use crate::expr::{Expr, ExprQuaternion, ExprVector};
use crate::handle::{EntityId, EquationId, GroupId, Keyed, ParamId};

/// How a derived entity is placed relative to the numeric base it was
/// copied from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CopyTransform {
    /// Copied as-is
    Identity,
    /// `base + times * delta`
    Translate { delta: [ParamId; 3], times: f64 },
    /// Rotated by `times * angle` about an axis through `center`
    Rotate {
        center: [ParamId; 3],
        axis: [ParamId; 3],
        angle: ParamId,
        times: f64,
    },
    /// Rotated by `angle` about a fixed axis
    Revolve {
        origin: DVec3,
        axis: DVec3,
        angle: ParamId,
    },
    /// Rigid motion of a linked part: `rotation * base + offset`
    Linked {
        offset: [ParamId; 3],
        rotation: [ParamId; 4],
    },
}

impl CopyTransform {
    fn rotation(&self) -> Option<ExprQuaternion> {
        match self {
            CopyTransform::Identity | CopyTransform::Translate { .. } => None,
            CopyTransform::Rotate {
                axis, angle, times, ..
            } => {
                let axis = ExprVector::from_params(*axis).with_magnitude(&Expr::constant(1.0));
                let angle = Expr::param(*angle).times(Expr::constant(*times));
                Some(ExprQuaternion::from_axis_angle(&axis, &angle))
            }
            CopyTransform::Revolve { axis, angle, .. } => Some(ExprQuaternion::from_axis_angle(
                &ExprVector::from_vec(axis.normalize_or_zero()),
                &Expr::param(*angle),
            )),
            CopyTransform::Linked { rotation, .. } => {
                Some(ExprQuaternion::from_params(*rotation))
            }
        }
    }

    /// Symbolic position of a copied point
    pub fn apply_to_point(&self, base: DVec3) -> ExprVector {
        match self {
            CopyTransform::Identity => ExprVector::from_vec(base),
            CopyTransform::Translate { delta, times } => ExprVector::from_vec(base)
                .plus(&ExprVector::from_params(*delta).scaled_by(&Expr::constant(*times))),
            CopyTransform::Rotate { center, .. } => {
                let center = ExprVector::from_params(*center);
                let q = self.rotation().unwrap_or_else(|| ExprQuaternion::from_quat(DQuat::IDENTITY));
                center.plus(&q.rotate(&ExprVector::from_vec(base).minus(&center)))
            }
            CopyTransform::Revolve { origin, .. } => {
                let origin = ExprVector::from_vec(*origin);
                let q = self.rotation().unwrap_or_else(|| ExprQuaternion::from_quat(DQuat::IDENTITY));
                origin.plus(&q.rotate(&ExprVector::from_vec(base).minus(&origin)))
            }
            CopyTransform::Linked { offset, rotation } => ExprQuaternion::from_params(*rotation)
                .rotate(&ExprVector::from_vec(base))
                .plus(&ExprVector::from_params(*offset)),
        }
    }

    /// Symbolic orientation of a copied normal
    pub fn apply_to_normal(&self, base: DQuat) -> ExprQuaternion {
        let base = ExprQuaternion::from_quat(base);
        match self.rotation() {
            Some(q) => q.times(&base),
            None => base,
        }
    }
}

/// How a face gets its normal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FaceNormal {
    /// The `n` axis of a normal entity
    Normal(EntityId),
    /// `(to - from) x direction`, the side face swept by a line
    Sweep {
        from: EntityId,
        to: EntityId,
        direction: [ParamId; 3],
    },
}

/// The kinds of entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntityKind {
    PointIn3d {
        params: [ParamId; 3],
    },
    /// `(u, v)` coordinates in the entity's workplane
    PointIn2d {
        params: [ParamId; 2],
    },
    PointCopy {
        base: DVec3,
        transform: CopyTransform,
    },
    /// Free orientation, `w, x, y, z`
    NormalIn3d {
        params: [ParamId; 4],
    },
    /// The normal of the entity's workplane
    NormalIn2d,
    NormalCopy {
        base: DQuat,
        transform: CopyTransform,
    },
    Workplane {
        origin: EntityId,
        normal: EntityId,
    },
    Distance {
        param: ParamId,
    },
    DistanceCopy {
        value: f64,
    },
    LineSegment {
        points: [EntityId; 2],
    },
    Circle {
        center: EntityId,
        normal: EntityId,
        radius: EntityId,
    },
    /// Counter-clockwise about `normal` from `start` to `finish`
    ArcOfCircle {
        center: EntityId,
        start: EntityId,
        finish: EntityId,
        normal: EntityId,
    },
    Cubic {
        points: [EntityId; 4],
    },
    Face {
        point: EntityId,
        normal: FaceNormal,
    },
}

/// A geometric entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub group: GroupId,
    pub workplane: Option<EntityId>,
    pub construction: bool,
    pub kind: EntityKind,
}

impl Keyed for Entity {
    type Key = EntityId;

    fn key(&self) -> EntityId {
        self.id
    }
}

impl Entity {
    pub fn new(id: EntityId, group: GroupId, kind: EntityKind) -> Self {
        Self {
            id,
            group,
            workplane: None,
            construction: false,
            kind,
        }
    }

    pub fn in_workplane(mut self, workplane: Option<EntityId>) -> Self {
        self.workplane = workplane;
        self
    }

    pub fn with_construction(mut self, construction: bool) -> Self {
        self.construction = construction;
        self
    }

    /// Get the type name for display
    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            EntityKind::PointIn3d { .. } => "Point (3D)",
            EntityKind::PointIn2d { .. } => "Point (2D)",
            EntityKind::PointCopy { .. } => "Point (copy)",
            EntityKind::NormalIn3d { .. } => "Normal (3D)",
            EntityKind::NormalIn2d => "Normal (2D)",
            EntityKind::NormalCopy { .. } => "Normal (copy)",
            EntityKind::Workplane { .. } => "Workplane",
            EntityKind::Distance { .. } => "Distance",
            EntityKind::DistanceCopy { .. } => "Distance (copy)",
            EntityKind::LineSegment { .. } => "Line Segment",
            EntityKind::Circle { .. } => "Circle",
            EntityKind::ArcOfCircle { .. } => "Arc of Circle",
            EntityKind::Cubic { .. } => "Cubic",
            EntityKind::Face { .. } => "Face",
        }
    }

    pub fn is_point(&self) -> bool {
        matches!(
            self.kind,
            EntityKind::PointIn3d { .. } | EntityKind::PointIn2d { .. } | EntityKind::PointCopy { .. }
        )
    }

    pub fn is_normal(&self) -> bool {
        matches!(
            self.kind,
            EntityKind::NormalIn3d { .. } | EntityKind::NormalIn2d | EntityKind::NormalCopy { .. }
        )
    }

    pub fn is_distance(&self) -> bool {
        matches!(
            self.kind,
            EntityKind::Distance { .. } | EntityKind::DistanceCopy { .. }
        )
    }

    pub fn is_workplane(&self) -> bool {
        matches!(self.kind, EntityKind::Workplane { .. })
    }

    pub fn is_line(&self) -> bool {
        matches!(self.kind, EntityKind::LineSegment { .. })
    }

    pub fn is_arc(&self) -> bool {
        matches!(self.kind, EntityKind::ArcOfCircle { .. })
    }

    pub fn is_circle_or_arc(&self) -> bool {
        matches!(
            self.kind,
            EntityKind::Circle { .. } | EntityKind::ArcOfCircle { .. }
        )
    }

    pub fn is_cubic(&self) -> bool {
        matches!(self.kind, EntityKind::Cubic { .. })
    }

    pub fn is_face(&self) -> bool {
        matches!(self.kind, EntityKind::Face { .. })
    }

    /// Lines, circles, arcs and cubics
    pub fn is_curve(&self) -> bool {
        self.is_line() || self.is_circle_or_arc() || self.is_cubic()
    }

    /// The points that define this entity
    pub fn point_entities(&self) -> Vec<EntityId> {
        match &self.kind {
            EntityKind::LineSegment { points } => points.to_vec(),
            EntityKind::Circle { center, .. } => vec![*center],
            EntityKind::ArcOfCircle {
                center,
                start,
                finish,
                ..
            } => vec![*center, *start, *finish],
            EntityKind::Cubic { points } => points.to_vec(),
            EntityKind::Workplane { origin, .. } => vec![*origin],
            EntityKind::Face { point, .. } => vec![*point],
            _ => Vec::new(),
        }
    }

    /// Start and finish points of an open curve
    pub fn endpoints(&self) -> Option<(EntityId, EntityId)> {
        match &self.kind {
            EntityKind::LineSegment { points } => Some((points[0], points[1])),
            EntityKind::ArcOfCircle { start, finish, .. } => Some((*start, *finish)),
            EntityKind::Cubic { points } => Some((points[0], points[3])),
            _ => None,
        }
    }

    /// Every entity this one is built from
    pub fn referenced_entities(&self) -> Vec<EntityId> {
        let mut refs = self.point_entities();
        match &self.kind {
            EntityKind::Workplane { normal, .. } => refs.push(*normal),
            EntityKind::Circle { normal, radius, .. } => {
                refs.push(*normal);
                refs.push(*radius);
            }
            EntityKind::ArcOfCircle { normal, .. } => refs.push(*normal),
            EntityKind::Face {
                normal: FaceNormal::Normal(n),
                ..
            } => refs.push(*n),
            EntityKind::Face {
                normal: FaceNormal::Sweep { from, to, .. },
                ..
            } => {
                refs.push(*from);
                refs.push(*to);
            }
            _ => {}
        }
        if let Some(wp) = self.workplane {
            refs.push(wp);
        }
        refs
    }

    /// Parameters stored directly on this entity
    pub fn own_params(&self) -> Vec<ParamId> {
        match &self.kind {
            EntityKind::PointIn3d { params } => params.to_vec(),
            EntityKind::PointIn2d { params } => params.to_vec(),
            EntityKind::NormalIn3d { params } => params.to_vec(),
            EntityKind::Distance { param } => vec![*param],
            _ => Vec::new(),
        }
    }
}

/// A numeric coordinate frame (a workplane's origin and orientation)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    pub origin: DVec3,
    pub orientation: DQuat,
}

impl Frame {
    pub fn u(&self) -> DVec3 {
        self.orientation * DVec3::X
    }

    pub fn v(&self) -> DVec3 {
        self.orientation * DVec3::Y
    }

    pub fn normal(&self) -> DVec3 {
        self.orientation * DVec3::Z
    }

    /// Coordinates of `p` in the plane
    pub fn project(&self, p: DVec3) -> DVec2 {
        let d = p - self.origin;
        DVec2::new(d.dot(self.u()), d.dot(self.v()))
    }

    /// Point in space for plane coordinates
    pub fn unproject(&self, p: DVec2) -> DVec3 {
        self.origin + self.u() * p.x + self.v() * p.y
    }

    /// Signed distance of `p` from the plane
    pub fn height(&self, p: DVec3) -> f64 {
        (p - self.origin).dot(self.normal())
    }
}

/// Numeric angles of an arc in its own plane
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArcAngles {
    pub theta0: f64,
    pub theta1: f64,
    /// Counter-clockwise sweep, in `(0, 2pi]`
    pub dtheta: f64,
}

impl Sketch {
    /// Symbolic position of a point entity
    pub fn point_expr(&self, id: EntityId) -> SketchResult<ExprVector> {
        let entity = self.entity(id)?;
        match &entity.kind {
            EntityKind::PointIn3d { params } => Ok(ExprVector::from_params(*params)),
            EntityKind::PointIn2d { params } => {
                let wp = entity.workplane.ok_or(SketchError::MissingWorkplane(id))?;
                let (origin, normal) = self.workplane_exprs(wp)?;
                Ok(origin
                    .plus(&normal.rotation_u().scaled_by(&Expr::param(params[0])))
                    .plus(&normal.rotation_v().scaled_by(&Expr::param(params[1]))))
            }
            EntityKind::PointCopy { base, transform } => Ok(transform.apply_to_point(*base)),
            _ => Err(SketchError::WrongEntityKind {
                entity: id,
                expected: "point",
            }),
        }
    }

    /// Symbolic orientation of a normal entity
    pub fn normal_expr(&self, id: EntityId) -> SketchResult<ExprQuaternion> {
        let entity = self.entity(id)?;
        match &entity.kind {
            EntityKind::NormalIn3d { params } => Ok(ExprQuaternion::from_params(*params)),
            EntityKind::NormalIn2d => {
                let wp = entity.workplane.ok_or(SketchError::MissingWorkplane(id))?;
                Ok(self.workplane_exprs(wp)?.1)
            }
            EntityKind::NormalCopy { base, transform } => Ok(transform.apply_to_normal(*base)),
            _ => Err(SketchError::WrongEntityKind {
                entity: id,
                expected: "normal",
            }),
        }
    }

    /// Symbolic value of a distance entity
    pub fn distance_expr(&self, id: EntityId) -> SketchResult<Expr> {
        match &self.entity(id)?.kind {
            EntityKind::Distance { param } => Ok(Expr::param(*param)),
            EntityKind::DistanceCopy { value } => Ok(Expr::constant(*value)),
            _ => Err(SketchError::WrongEntityKind {
                entity: id,
                expected: "distance",
            }),
        }
    }

    /// Symbolic origin and orientation of a workplane
    pub fn workplane_exprs(&self, id: EntityId) -> SketchResult<(ExprVector, ExprQuaternion)> {
        match &self.entity(id)?.kind {
            EntityKind::Workplane { origin, normal } => {
                Ok((self.point_expr(*origin)?, self.normal_expr(*normal)?))
            }
            _ => Err(SketchError::WrongEntityKind {
                entity: id,
                expected: "workplane",
            }),
        }
    }

    /// Symbolic unit normal of a face or workplane
    pub fn plane_normal_expr(&self, id: EntityId) -> SketchResult<ExprVector> {
        match &self.entity(id)?.kind {
            EntityKind::Workplane { normal, .. } => Ok(self.normal_expr(*normal)?.rotation_n()),
            EntityKind::Face {
                normal: FaceNormal::Normal(n),
                ..
            } => Ok(self.normal_expr(*n)?.rotation_n()),
            EntityKind::Face {
                normal: FaceNormal::Sweep {
                    from,
                    to,
                    direction,
                },
                ..
            } => {
                let along = self.point_expr(*to)?.minus(&self.point_expr(*from)?);
                Ok(along
                    .cross(&ExprVector::from_params(*direction))
                    .with_magnitude(&Expr::constant(1.0)))
            }
            _ => Err(SketchError::WrongEntityKind {
                entity: id,
                expected: "plane",
            }),
        }
    }

    /// Symbolic point on a face or workplane
    pub fn plane_point_expr(&self, id: EntityId) -> SketchResult<ExprVector> {
        match &self.entity(id)?.kind {
            EntityKind::Workplane { origin, .. } => self.point_expr(*origin),
            EntityKind::Face { point, .. } => self.point_expr(*point),
            _ => Err(SketchError::WrongEntityKind {
                entity: id,
                expected: "plane",
            }),
        }
    }

    // ============== Numeric evaluation ==============

    pub fn point_position(&self, id: EntityId) -> SketchResult<DVec3> {
        Ok(self.point_expr(id)?.eval(&|p| self.value_of(p)))
    }

    pub fn normal_orientation(&self, id: EntityId) -> SketchResult<DQuat> {
        Ok(self.normal_expr(id)?.eval(&|p| self.value_of(p)).normalize())
    }

    pub fn distance_value(&self, id: EntityId) -> SketchResult<f64> {
        Ok(self.distance_expr(id)?.eval(&|p| self.value_of(p)))
    }

    /// Numeric frame of a workplane
    pub fn workplane_frame(&self, id: EntityId) -> SketchResult<Frame> {
        let (origin, normal) = self.workplane_exprs(id)?;
        let lookup = |p: ParamId| self.value_of(p);
        Ok(Frame {
            origin: origin.eval(&lookup),
            orientation: normal.eval(&lookup).normalize(),
        })
    }

    /// Angles of an arc measured in the plane of its normal
    pub fn arc_angles(&self, id: EntityId) -> SketchResult<ArcAngles> {
        match &self.entity(id)?.kind {
            EntityKind::ArcOfCircle {
                center,
                start,
                finish,
                normal,
            } => {
                let frame = Frame {
                    origin: self.point_position(*center)?,
                    orientation: self.normal_orientation(*normal)?,
                };
                let s = frame.project(self.point_position(*start)?);
                let f = frame.project(self.point_position(*finish)?);
                let theta0 = s.y.atan2(s.x);
                let theta1 = f.y.atan2(f.x);
                let mut dtheta = (theta1 - theta0).rem_euclid(TAU);
                if dtheta < 1e-6 {
                    dtheta += TAU;
                }
                Ok(ArcAngles {
                    theta0,
                    theta1,
                    dtheta,
                })
            }
            _ => Err(SketchError::WrongEntityKind {
                entity: id,
                expected: "arc",
            }),
        }
    }

    /// Symbolic radius of a circle or arc
    pub fn radius_expr(&self, id: EntityId) -> SketchResult<Expr> {
        match &self.entity(id)?.kind {
            EntityKind::Circle { radius, .. } => self.distance_expr(*radius),
            EntityKind::ArcOfCircle { center, start, .. } => Ok(self
                .point_expr(*start)?
                .minus(&self.point_expr(*center)?)
                .magnitude()),
            _ => Err(SketchError::WrongEntityKind {
                entity: id,
                expected: "circle or arc",
            }),
        }
    }

    pub fn radius_value(&self, id: EntityId) -> SketchResult<f64> {
        Ok(self.radius_expr(id)?.eval(&|p| self.value_of(p)))
    }

    /// Center point entity of a circle or arc
    pub fn center_of(&self, id: EntityId) -> SketchResult<EntityId> {
        match &self.entity(id)?.kind {
            EntityKind::Circle { center, .. } | EntityKind::ArcOfCircle { center, .. } => {
                Ok(*center)
            }
            _ => Err(SketchError::WrongEntityKind {
                entity: id,
                expected: "circle or arc",
            }),
        }
    }

    /// Normal entity of a circle or arc
    pub fn normal_of(&self, id: EntityId) -> SketchResult<EntityId> {
        match &self.entity(id)?.kind {
            EntityKind::Circle { normal, .. } | EntityKind::ArcOfCircle { normal, .. } => {
                Ok(*normal)
            }
            _ => Err(SketchError::WrongEntityKind {
                entity: id,
                expected: "circle or arc",
            }),
        }
    }

    /// Equations an entity imposes on its own parameters
    ///
    /// Free 3D normals stay unit length; arcs drawn from requests keep
    /// both endpoints on the same circle.
    pub fn entity_equations(&self, group: GroupId) -> SketchResult<Vec<Equation>> {
        let mut equations = Vec::new();
        for entity in self.entities.iter() {
            if entity.group != group || !entity.id.is_from_request() {
                continue;
            }
            match &entity.kind {
                EntityKind::NormalIn3d { params } => {
                    let q = ExprQuaternion::from_params(*params);
                    equations.push(Equation::new(
                        EquationId::entity(entity.id, 0),
                        q.magnitude_squared().minus(Expr::constant(1.0)),
                    ));
                }
                EntityKind::ArcOfCircle {
                    center,
                    start,
                    finish,
                    ..
                } => {
                    let c = self.point_expr(*center)?;
                    let rs = self.point_expr(*start)?.minus(&c).magnitude();
                    let rf = self.point_expr(*finish)?.minus(&c).magnitude();
                    equations.push(Equation::new(EquationId::entity(entity.id, 0), rs.minus(rf)));
                }
                _ => {}
            }
        }
        Ok(equations)
    }
}
