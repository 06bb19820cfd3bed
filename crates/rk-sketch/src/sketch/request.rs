//! Requests
//!
//! A request is what the user draws. Each one expands into the entities
//! and parameters that describe it: the main entity at index 0, its
//! points from index 1, its normal at 32 and its distance at 64.

use glam::DQuat;
use serde::{Deserialize, Serialize};

use super::entity::{Entity, EntityKind};
use crate::handle::{EntityId, GroupId, Keyed, ParamId, RequestId};

/// Index of the first point entity of a request
pub const POINT_INDEX: u32 = 1;
/// Index of the normal entity of a request
pub const NORMAL_INDEX: u32 = 32;
/// Index of the distance entity of a request
pub const DISTANCE_INDEX: u32 = 64;

/// The kinds of request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    DatumPoint,
    Workplane,
    LineSegment,
    Circle,
    ArcOfCircle,
    Cubic,
}

impl RequestKind {
    /// Get the type name for display
    pub fn type_name(&self) -> &'static str {
        match self {
            RequestKind::DatumPoint => "Datum Point",
            RequestKind::Workplane => "Workplane",
            RequestKind::LineSegment => "Line Segment",
            RequestKind::Circle => "Circle",
            RequestKind::ArcOfCircle => "Arc of Circle",
            RequestKind::Cubic => "Cubic",
        }
    }
}

/// A user-authored drawing request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub group: GroupId,
    /// Workplane the request is drawn in (`None` for free 3D)
    pub workplane: Option<EntityId>,
    pub kind: RequestKind,
    /// Construction geometry is solved but not part of loops or solids
    #[serde(default)]
    pub construction: bool,
}

impl Keyed for Request {
    type Key = RequestId;

    fn key(&self) -> RequestId {
        self.id
    }
}

/// Entities and parameters produced by a request
#[derive(Debug, Clone, Default)]
pub struct RequestExpansion {
    pub entities: Vec<Entity>,
    /// Parameters with the value they take when first created
    pub params: Vec<(ParamId, f64)>,
}

struct Expander<'a> {
    request: &'a Request,
    out: RequestExpansion,
    next_param: u32,
}

impl Expander<'_> {
    fn param(&mut self, default: f64) -> ParamId {
        let id = ParamId::request(self.request.id, self.next_param);
        self.next_param += 1;
        self.out.params.push((id, default));
        id
    }

    fn push(&mut self, index: u32, kind: EntityKind) -> EntityId {
        let id = EntityId::request(self.request.id, index);
        self.out.entities.push(
            Entity::new(id, self.request.group, kind)
                .in_workplane(self.request.workplane)
                .with_construction(self.request.construction),
        );
        id
    }

    fn point(&mut self, index: u32) -> EntityId {
        let kind = if self.request.workplane.is_some() {
            EntityKind::PointIn2d {
                params: [self.param(0.0), self.param(0.0)],
            }
        } else {
            EntityKind::PointIn3d {
                params: [self.param(0.0), self.param(0.0), self.param(0.0)],
            }
        };
        self.push(index, kind)
    }

    fn normal(&mut self) -> EntityId {
        let kind = if self.request.workplane.is_some() {
            EntityKind::NormalIn2d
        } else {
            let q = DQuat::IDENTITY;
            EntityKind::NormalIn3d {
                params: [
                    self.param(q.w),
                    self.param(q.x),
                    self.param(q.y),
                    self.param(q.z),
                ],
            }
        };
        self.push(NORMAL_INDEX, kind)
    }
}

impl Request {
    /// The main entity of this request
    pub fn entity(&self) -> EntityId {
        EntityId::request(self.id, 0)
    }

    /// Point entity `n` (0-based) of this request
    pub fn point(&self, n: u32) -> EntityId {
        if self.kind == RequestKind::DatumPoint {
            self.entity()
        } else {
            EntityId::request(self.id, POINT_INDEX + n)
        }
    }

    /// Expand into entities and parameters
    pub fn expand(&self) -> RequestExpansion {
        let mut ex = Expander {
            request: self,
            out: RequestExpansion::default(),
            next_param: 0,
        };

        match self.kind {
            RequestKind::DatumPoint => {
                ex.point(0);
            }
            RequestKind::Workplane => {
                let origin = ex.point(POINT_INDEX);
                let normal = ex.normal();
                ex.push(0, EntityKind::Workplane { origin, normal });
            }
            RequestKind::LineSegment => {
                let a = ex.point(POINT_INDEX);
                let b = ex.point(POINT_INDEX + 1);
                ex.push(0, EntityKind::LineSegment { points: [a, b] });
            }
            RequestKind::Circle => {
                let center = ex.point(POINT_INDEX);
                let normal = ex.normal();
                let param = ex.param(0.0);
                let radius = ex.push(DISTANCE_INDEX, EntityKind::Distance { param });
                ex.push(
                    0,
                    EntityKind::Circle {
                        center,
                        normal,
                        radius,
                    },
                );
            }
            RequestKind::ArcOfCircle => {
                let center = ex.point(POINT_INDEX);
                let start = ex.point(POINT_INDEX + 1);
                let finish = ex.point(POINT_INDEX + 2);
                let normal = ex.normal();
                ex.push(
                    0,
                    EntityKind::ArcOfCircle {
                        center,
                        start,
                        finish,
                        normal,
                    },
                );
            }
            RequestKind::Cubic => {
                let points = [
                    ex.point(POINT_INDEX),
                    ex.point(POINT_INDEX + 1),
                    ex.point(POINT_INDEX + 2),
                    ex.point(POINT_INDEX + 3),
                ];
                ex.push(0, EntityKind::Cubic { points });
            }
        }

        ex.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: RequestKind, workplane: Option<EntityId>) -> Request {
        Request {
            id: RequestId(3),
            group: GroupId(1),
            workplane,
            kind,
            construction: false,
        }
    }

    #[test]
    fn test_line_in_workplane() {
        let wp = EntityId::predefined(GroupId(1), 0);
        let ex = request(RequestKind::LineSegment, Some(wp)).expand();
        assert_eq!(ex.entities.len(), 3);
        assert_eq!(ex.params.len(), 4);
        let line = ex.entities.last().unwrap();
        assert_eq!(line.id, EntityId::request(RequestId(3), 0));
        assert!(line.is_line());
        assert!(ex.entities.iter().all(|e| e.workplane == Some(wp)));
    }

    #[test]
    fn test_circle_in_3d() {
        let ex = request(RequestKind::Circle, None).expand();
        // center (3) + normal (4) + radius (1)
        assert_eq!(ex.params.len(), 8);
        assert!(
            ex.entities
                .iter()
                .any(|e| e.id.index == NORMAL_INDEX && matches!(e.kind, EntityKind::NormalIn3d { .. }))
        );
        assert!(ex.entities.iter().any(|e| e.id.index == DISTANCE_INDEX));
        // Identity quaternion by default
        assert_eq!(ex.params[3].1, 1.0);
    }

    #[test]
    fn test_datum_point_is_entity_zero() {
        let r = request(RequestKind::DatumPoint, None);
        let ex = r.expand();
        assert_eq!(ex.entities.len(), 1);
        assert_eq!(ex.entities[0].id, r.entity());
        assert_eq!(r.point(0), r.entity());
    }
}
