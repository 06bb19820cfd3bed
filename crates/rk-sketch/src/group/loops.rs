//! Closed loops of a workplane sketch
//!
//! The non-construction curves a group draws in its workplane are sampled
//! into polylines and chained end to end. Each closed chain becomes a loop
//! of the profile that extrude, lathe and revolve groups sweep.

use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::curve::bezier::curves_for_entity;
use crate::handle::{EntityId, GroupId};
use crate::kernel::Profile;
use crate::sketch::{Frame, Sketch};

/// Why a group's curves do not form closed planar loops
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolyError {
    #[error("Curves do not close at {at}")]
    NotClosed { at: DVec3 },

    #[error("Curve {entity} leaves the workplane")]
    NotCoplanar { entity: EntityId },

    #[error("Curve {entity} has zero length")]
    ZeroLengthEdge { entity: EntityId },

    #[error("Curve {entity} cannot be sampled: {reason}")]
    NotSampled { entity: EntityId, reason: String },
}

/// Loop assembly settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Largest distance between a curve and its polyline
    pub chord_tolerance: f64,
    /// Segment cap per Bézier piece
    pub max_segments: usize,
    /// End points closer than this are joined
    pub join_tolerance: f64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            chord_tolerance: 0.01,
            max_segments: 64,
            join_tolerance: 1e-6,
        }
    }
}

impl LoopConfig {
    pub fn with_chord_tolerance(mut self, tolerance: f64) -> Self {
        self.chord_tolerance = tolerance.max(1e-9);
        self
    }

    pub fn with_max_segments(mut self, segments: usize) -> Self {
        self.max_segments = segments.max(1);
        self
    }

    pub fn with_join_tolerance(mut self, tolerance: f64) -> Self {
        self.join_tolerance = tolerance;
        self
    }
}

/// One closed loop in plane coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct Loop {
    /// Vertices without a repeated end point
    pub points: Vec<DVec2>,
    /// Curves in chain order
    pub curves: Vec<EntityId>,
}

impl Loop {
    /// Signed area, positive when counter-clockwise
    pub fn area(&self) -> f64 {
        let n = self.points.len();
        (0..n)
            .map(|i| self.points[i].perp_dot(self.points[(i + 1) % n]))
            .sum::<f64>()
            / 2.0
    }
}

/// Every loop of a group with the frame they are measured in
#[derive(Debug, Clone, PartialEq)]
pub struct LoopSet {
    pub frame: Frame,
    pub loops: Vec<Loop>,
}

impl LoopSet {
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn to_profile(&self) -> Profile {
        Profile {
            origin: self.frame.origin,
            u: self.frame.u(),
            v: self.frame.v(),
            loops: self.loops.iter().map(|l| l.points.clone()).collect(),
        }
    }
}

struct Edge {
    entity: EntityId,
    points: Vec<DVec3>,
}

impl Edge {
    fn start(&self) -> DVec3 {
        self.points[0]
    }

    fn finish(&self) -> DVec3 {
        self.points[self.points.len() - 1]
    }
}

fn sample(sketch: &Sketch, entity: EntityId, config: &LoopConfig) -> Result<Vec<DVec3>, PolyError> {
    let pieces = curves_for_entity(sketch, entity).map_err(|e| PolyError::NotSampled {
        entity,
        reason: e.to_string(),
    })?;
    let mut points: Vec<DVec3> = Vec::new();
    for piece in pieces {
        let poly = piece.polyline(config.chord_tolerance, config.max_segments);
        let skip = usize::from(!points.is_empty());
        points.extend(poly.into_iter().skip(skip));
    }
    Ok(points)
}

/// Chain a group's curves into closed loops in `frame`
pub fn assemble_loops(
    sketch: &Sketch,
    group: GroupId,
    frame: Frame,
    config: &LoopConfig,
) -> Result<LoopSet, PolyError> {
    let tol = config.join_tolerance;
    let mut loops = Vec::new();
    let mut open: Vec<Edge> = Vec::new();

    let curves = sketch
        .entities()
        .filter(|e| e.group == group && e.id.is_from_request() && !e.construction && e.is_curve());
    for entity in curves {
        let points = sample(sketch, entity.id, config)?;
        if points.iter().any(|p| frame.height(*p).abs() > tol.max(1e-9)) {
            return Err(PolyError::NotCoplanar { entity: entity.id });
        }
        let length: f64 = points.windows(2).map(|w| w[0].distance(w[1])).sum();
        if length <= tol {
            return Err(PolyError::ZeroLengthEdge { entity: entity.id });
        }
        let edge = Edge {
            entity: entity.id,
            points,
        };
        if edge.start().distance(edge.finish()) <= tol {
            let mut points = edge.points;
            points.pop();
            loops.push(Loop {
                points: points.iter().map(|p| frame.project(*p)).collect(),
                curves: vec![edge.entity],
            });
        } else {
            open.push(edge);
        }
    }

    while !open.is_empty() {
        let first = open.remove(0);
        let origin = first.start();
        let mut end = first.finish();
        let mut points = first.points;
        let mut chain = vec![first.entity];

        while end.distance(origin) > tol {
            let next = open.iter().position(|e| {
                e.start().distance(end) <= tol || e.finish().distance(end) <= tol
            });
            let Some(index) = next else {
                return Err(PolyError::NotClosed { at: end });
            };
            let mut edge = open.remove(index);
            if edge.start().distance(end) > tol {
                edge.points.reverse();
            }
            end = edge.finish();
            points.extend(edge.points.into_iter().skip(1));
            chain.push(edge.entity);
        }
        points.pop();
        loops.push(Loop {
            points: points.iter().map(|p| frame.project(*p)).collect(),
            curves: chain,
        });
    }

    tracing::debug!("{}: {} loops", group, loops.len());
    Ok(LoopSet { frame, loops })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupKind;
    use approx::assert_relative_eq;

    fn drawing() -> (Sketch, GroupId, EntityId, Frame) {
        let mut sketch = Sketch::new();
        let g = sketch
            .add_group("sketch", GroupKind::workplane_xy(), None)
            .unwrap();
        let wp = sketch.group(g).unwrap().workplane.unwrap();
        let frame = sketch.workplane_frame(wp).unwrap();
        (sketch, g, wp, frame)
    }

    #[test]
    fn test_square_with_reversed_edge() {
        let (mut sketch, g, wp, frame) = drawing();
        let c = [
            DVec3::new(0.0, 0.0, 0.0),
            DVec3::new(2.0, 0.0, 0.0),
            DVec3::new(2.0, 2.0, 0.0),
            DVec3::new(0.0, 2.0, 0.0),
        ];
        sketch.add_line(g, Some(wp), c[0], c[1]).unwrap();
        sketch.add_line(g, Some(wp), c[1], c[2]).unwrap();
        // Drawn backwards
        sketch.add_line(g, Some(wp), c[0], c[3]).unwrap();
        sketch.add_line(g, Some(wp), c[2], c[3]).unwrap();

        let set = assemble_loops(&sketch, g, frame, &LoopConfig::default()).unwrap();
        assert_eq!(set.loops.len(), 1);
        assert_eq!(set.loops[0].points.len(), 4);
        assert_eq!(set.loops[0].curves.len(), 4);
        assert_relative_eq!(set.loops[0].area().abs(), 4.0, epsilon = 1e-12);
        assert_eq!(set.to_profile().normal(), DVec3::Z);
    }

    #[test]
    fn test_circle_is_its_own_loop() {
        let (mut sketch, g, wp, frame) = drawing();
        sketch
            .add_circle(g, Some(wp), DVec3::new(1.0, 1.0, 0.0), 1.0)
            .unwrap();
        let config = LoopConfig::default().with_chord_tolerance(0.001);
        let set = assemble_loops(&sketch, g, frame, &config).unwrap();
        assert_eq!(set.loops.len(), 1);
        assert_relative_eq!(
            set.loops[0].area().abs(),
            std::f64::consts::PI,
            epsilon = 0.01
        );
    }

    #[test]
    fn test_open_chain_fails() {
        let (mut sketch, g, wp, frame) = drawing();
        sketch
            .add_line(g, Some(wp), DVec3::ZERO, DVec3::X)
            .unwrap();
        sketch
            .add_line(g, Some(wp), DVec3::X, DVec3::new(1.0, 1.0, 0.0))
            .unwrap();
        let err = assemble_loops(&sketch, g, frame, &LoopConfig::default()).unwrap_err();
        assert!(matches!(err, PolyError::NotClosed { .. }));
    }

    #[test]
    fn test_zero_length_edge() {
        let (mut sketch, g, wp, frame) = drawing();
        let r = sketch
            .add_line(g, Some(wp), DVec3::X, DVec3::X)
            .unwrap();
        let line = sketch.request(r).unwrap().entity();
        assert_eq!(
            assemble_loops(&sketch, g, frame, &LoopConfig::default()),
            Err(PolyError::ZeroLengthEdge { entity: line })
        );
    }

    #[test]
    fn test_construction_is_ignored() {
        let (mut sketch, g, wp, frame) = drawing();
        sketch
            .add_request(g, crate::sketch::RequestKind::LineSegment, Some(wp), true)
            .unwrap();
        let set = assemble_loops(&sketch, g, frame, &LoopConfig::default()).unwrap();
        assert!(set.is_empty());
    }
}
