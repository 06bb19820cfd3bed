//! Splitting curves where they meet

use glam::DVec3;

use super::bezier::{LENGTH_EPSILON, curves_for_entity, intersections};
use super::{CurveError, CurveResult};
use crate::handle::{ConstraintId, EntityId, RequestId};
use crate::sketch::{ConstraintKind, EntityKind, Request, RequestKind, Sketch};

/// Largest distance between a split point and the curve being split
const ON_CURVE_TOLERANCE: f64 = 1e-4;

/// What to split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitSelection {
    /// A curve and a point constrained onto it
    AtPoint { entity: EntityId, point: EntityId },
    /// Two curves, split where they cross
    Pair { a: EntityId, b: EntityId },
}

/// Split the selected curves, returning the new split points
///
/// For a pair, the crossing nearest `hint` is used. The sketch is unchanged
/// on error.
pub fn split_entities(
    sketch: &mut Sketch,
    selection: SplitSelection,
    hint: DVec3,
) -> CurveResult<Vec<EntityId>> {
    let (a, other) = match selection {
        SplitSelection::AtPoint { entity, point } => (entity, point),
        SplitSelection::Pair { a, b } => (a, b),
    };
    for id in [a, other] {
        if sketch.entity(id)?.workplane.is_none() {
            return Err(CurveError::NotInWorkplane(id));
        }
    }

    let (at, on_curve) = match selection {
        SplitSelection::AtPoint { entity, point } => {
            let (at, constraint) = on_curve_constraint(sketch, entity, point)?;
            (at, Some(constraint))
        }
        SplitSelection::Pair { a, b } => {
            let crossings = intersections(&curves_for_entity(sketch, a)?, &curves_for_entity(sketch, b)?);
            let nearest = crossings
                .into_iter()
                .min_by(|p, q| p.distance(hint).total_cmp(&q.distance(hint)))
                .ok_or(CurveError::NoIntersection)?;
            (nearest, None)
        }
    };

    let snapshot = sketch.snapshot();
    let result = (|| -> CurveResult<Vec<EntityId>> {
        if let Some(constraint) = on_curve {
            sketch.delete_constraint(constraint)?;
        }
        let split_a = split_entity(sketch, a, at)?;
        match selection {
            SplitSelection::AtPoint { point, .. } => {
                let datum = match point.request_id() {
                    Some(r) if sketch.request(r)?.kind == RequestKind::DatumPoint => Some(r),
                    _ => None,
                };
                match datum {
                    // The split point takes over from the datum
                    Some(r) => sketch.delete_request(r)?,
                    None => join(sketch, split_a, point)?,
                }
                Ok(vec![split_a])
            }
            SplitSelection::Pair { b, .. } => {
                let split_b = split_entity(sketch, b, at)?;
                join(sketch, split_a, split_b)?;
                Ok(vec![split_a, split_b])
            }
        }
    })();

    match result {
        Ok(points) => {
            tracing::debug!("Split at {:?} into {} points", at, points.len());
            Ok(points)
        }
        Err(e) => {
            tracing::warn!("Split failed: {}", e);
            sketch.restore(snapshot);
            Err(e)
        }
    }
}

/// The constraint putting `point` on `entity`, with the point's position
fn on_curve_constraint(
    sketch: &Sketch,
    entity: EntityId,
    point: EntityId,
) -> CurveResult<(DVec3, ConstraintId)> {
    let curve = sketch.entity(entity)?;
    let segment = match &curve.kind {
        EntityKind::LineSegment { points } => Some((
            sketch.point_position(points[0])?,
            sketch.point_position(points[1])?,
        )),
        _ => None,
    };

    for c in sketch.constraints() {
        let (p, on) = match c.kind {
            ConstraintKind::PtOnLine { point, line } => (point, line),
            ConstraintKind::PtOnCircle { point, circle } => (point, circle),
            _ => continue,
        };
        if p.request_id() != point.request_id() || on.request_id() != entity.request_id() {
            continue;
        }
        let at = sketch.point_position(p)?;
        if let Some((p0, p1)) = segment {
            if !on_segment(at, p0, p1) {
                continue;
            }
        }
        return Ok((at, c.id));
    }
    Err(CurveError::PointNotOnEntity { point, entity })
}

fn on_segment(p: DVec3, p0: DVec3, p1: DVec3) -> bool {
    let d = p1 - p0;
    let length = d.length();
    if length < LENGTH_EPSILON {
        return false;
    }
    let t = (p - p0).dot(d) / (length * length);
    let off = (p0 + d * t).distance(p);
    off < LENGTH_EPSILON && t * length > -LENGTH_EPSILON && (1.0 - t) * length > -LENGTH_EPSILON
}

fn join(sketch: &mut Sketch, a: EntityId, b: EntityId) -> CurveResult<()> {
    let entity = sketch.entity(a)?;
    let (group, workplane) = (entity.group, entity.workplane);
    sketch.add_constraint(group, workplane, ConstraintKind::coincident(a, b))?;
    Ok(())
}

/// Split one curve at `at`, returning the point where the halves meet
fn split_entity(sketch: &mut Sketch, id: EntityId, at: DVec3) -> CurveResult<EntityId> {
    let entity = sketch.entity(id)?.clone();
    let request_id = id.request_id().ok_or(CurveError::NotSplittable(id))?;
    let construction = sketch.request(request_id)?.construction;
    let group = entity.group;
    let workplane = entity.workplane.ok_or(CurveError::NotInWorkplane(id))?;
    let wp = Some(workplane);

    let split = match entity.kind {
        EntityKind::LineSegment { points } => {
            let p0 = sketch.point_position(points[0])?;
            let p1 = sketch.point_position(points[1])?;
            let first = sketch.add_line(group, wp, p0, at)?;
            let first = added(sketch, first)?;
            let second = sketch.add_line(group, wp, at, p1)?;
            let second = added(sketch, second)?;

            sketch.replace_point_in_constraints(points[0], first.point(0));
            sketch.replace_point_in_constraints(points[1], second.point(1));
            join(sketch, first.point(1), second.point(0))?;
            first.point(1)
        }
        EntityKind::Circle { center, .. } => {
            let c = sketch.point_position(center)?;
            let arc = sketch.add_arc(group, workplane, c, at, at)?;
            let arc = added(sketch, arc)?;

            sketch.replace_point_in_constraints(center, arc.point(0));
            join(sketch, arc.point(1), arc.point(2))?;
            arc.point(1)
        }
        EntityKind::ArcOfCircle {
            center,
            start,
            finish,
            ..
        } => {
            let c = sketch.point_position(center)?;
            let s = sketch.point_position(start)?;
            let f = sketch.point_position(finish)?;
            let first = sketch.add_arc(group, workplane, c, s, at)?;
            let first = added(sketch, first)?;
            let second = sketch.add_arc(group, workplane, c, at, f)?;
            let second = added(sketch, second)?;

            sketch.replace_point_in_constraints(center, first.point(0));
            sketch.replace_point_in_constraints(start, first.point(1));
            sketch.replace_point_in_constraints(finish, second.point(2));
            join(sketch, first.point(0), second.point(0))?;
            join(sketch, first.point(2), second.point(1))?;
            first.point(2)
        }
        EntityKind::Cubic { points } => {
            let pieces = curves_for_entity(sketch, id)?;
            let [piece] = pieces.as_slice() else {
                return Err(CurveError::NotSplittable(id));
            };
            let t = piece.closest_point(at);
            if piece.point_at(t).distance(at) > ON_CURVE_TOLERANCE || t <= 0.0 || t >= 1.0 {
                return Err(CurveError::NoIntersection);
            }
            let (left, right) = piece.split_at(t);
            let ctrl = |b: &super::bezier::RationalBezier| -> [DVec3; 4] {
                let c = b.ctrl();
                [c[0], c[1], c[2], c[3]]
            };
            let first = sketch.add_cubic(group, wp, ctrl(&left))?;
            let first = added(sketch, first)?;
            let second = sketch.add_cubic(group, wp, ctrl(&right))?;
            let second = added(sketch, second)?;

            sketch.replace_point_in_constraints(points[0], first.point(0));
            sketch.replace_point_in_constraints(points[3], second.point(3));
            join(sketch, first.point(3), second.point(0))?;
            first.point(3)
        }
        _ => return Err(CurveError::NotSplittable(id)),
    };

    if !construction {
        sketch.delete_request(request_id)?;
    }
    Ok(split)
}

fn added(sketch: &Sketch, id: RequestId) -> CurveResult<Request> {
    Ok(sketch.request(id)?.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupKind;
    use crate::handle::GroupId;
    use approx::assert_relative_eq;

    fn drawing() -> (Sketch, GroupId, EntityId) {
        let mut sketch = Sketch::new();
        let g = sketch
            .add_group("sketch", GroupKind::workplane_xy(), None)
            .unwrap();
        let wp = sketch.group(g).unwrap().workplane.unwrap();
        (sketch, g, wp)
    }

    fn line(sketch: &mut Sketch, g: GroupId, wp: EntityId, a: DVec3, b: DVec3) -> (EntityId, [EntityId; 2]) {
        let r = sketch.add_line(g, Some(wp), a, b).unwrap();
        let r = sketch.request(r).unwrap();
        (r.entity(), [r.point(0), r.point(1)])
    }

    fn line_ends(sketch: &Sketch) -> Vec<(DVec3, DVec3)> {
        sketch
            .entities()
            .filter(|e| e.is_line())
            .map(|e| {
                let (a, b) = e.endpoints().unwrap();
                (sketch.point_position(a).unwrap(), sketch.point_position(b).unwrap())
            })
            .collect()
    }

    #[test]
    fn test_split_crossing_lines() {
        let (mut sketch, g, wp) = drawing();
        let (a, [a0, _]) = line(&mut sketch, g, wp, DVec3::new(-1.0, 0.0, 0.0), DVec3::new(1.0, 0.0, 0.0));
        let (b, _) = line(&mut sketch, g, wp, DVec3::new(0.0, -1.0, 0.0), DVec3::new(0.0, 1.0, 0.0));
        let datum = sketch.add_point(g, Some(wp), DVec3::new(-1.0, 0.0, 0.0)).unwrap();
        let datum = sketch.request(datum).unwrap().entity();
        sketch
            .add_constraint(g, Some(wp), ConstraintKind::coincident(datum, a0))
            .unwrap();

        let points = split_entities(&mut sketch, SplitSelection::Pair { a, b }, DVec3::ZERO).unwrap();
        assert_eq!(points.len(), 2);
        for p in &points {
            assert_relative_eq!(sketch.point_position(*p).unwrap().length(), 0.0, epsilon = 1e-6);
        }

        assert!(!sketch.has_entity(a));
        assert!(!sketch.has_entity(b));
        let ends = line_ends(&sketch);
        assert_eq!(ends.len(), 4);
        assert!(ends.iter().all(|(p, q)| p.distance(*q) > 0.5));

        // The datum coincidence moved to the new segment's endpoint
        let moved = sketch
            .constraints()
            .find_map(|c| match c.kind {
                ConstraintKind::PointsCoincident { a, b } if a == datum => Some(b),
                _ => None,
            })
            .unwrap();
        assert_ne!(moved, a0);
        assert_relative_eq!(
            sketch.point_position(moved).unwrap().distance(DVec3::new(-1.0, 0.0, 0.0)),
            0.0,
            epsilon = 1e-12
        );
        // Two halves joined per line, plus the lines joined to each other
        let coincident = sketch
            .constraints()
            .filter(|c| matches!(c.kind, ConstraintKind::PointsCoincident { .. }))
            .count();
        assert_eq!(coincident, 4);
    }

    #[test]
    fn test_split_at_datum_point() {
        let (mut sketch, g, wp) = drawing();
        let (a, _) = line(&mut sketch, g, wp, DVec3::ZERO, DVec3::new(4.0, 0.0, 0.0));
        let datum = sketch.add_point(g, Some(wp), DVec3::new(1.0, 0.0, 0.0)).unwrap();
        let point = sketch.request(datum).unwrap().entity();
        sketch
            .add_constraint(g, Some(wp), ConstraintKind::point_on_line(point, a))
            .unwrap();

        let points = split_entities(
            &mut sketch,
            SplitSelection::AtPoint { entity: a, point },
            DVec3::ZERO,
        )
        .unwrap();
        assert_eq!(points.len(), 1);
        assert!(!sketch.has_entity(point));
        assert_eq!(sketch.requests().count(), 2);

        let mut ends = line_ends(&sketch);
        ends.sort_by(|p, q| p.0.x.total_cmp(&q.0.x));
        assert_relative_eq!(ends[0].1.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(ends[1].0.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(ends[1].1.x, 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_point_must_be_constrained_on() {
        let (mut sketch, g, wp) = drawing();
        let (a, _) = line(&mut sketch, g, wp, DVec3::ZERO, DVec3::new(4.0, 0.0, 0.0));
        let datum = sketch.add_point(g, Some(wp), DVec3::new(1.0, 0.0, 0.0)).unwrap();
        let point = sketch.request(datum).unwrap().entity();

        assert!(matches!(
            split_entities(&mut sketch, SplitSelection::AtPoint { entity: a, point }, DVec3::ZERO),
            Err(CurveError::PointNotOnEntity { .. })
        ));
    }

    #[test]
    fn test_parallel_lines_do_not_split() {
        let (mut sketch, g, wp) = drawing();
        let (a, _) = line(&mut sketch, g, wp, DVec3::ZERO, DVec3::X);
        let (b, _) = line(&mut sketch, g, wp, DVec3::Y, DVec3::new(1.0, 1.0, 0.0));
        let before = sketch.to_ron().unwrap();
        assert!(matches!(
            split_entities(&mut sketch, SplitSelection::Pair { a, b }, DVec3::ZERO),
            Err(CurveError::NoIntersection)
        ));
        assert_eq!(sketch.to_ron().unwrap(), before);
    }

    #[test]
    fn test_split_circle_by_line() {
        let (mut sketch, g, wp) = drawing();
        let circle = sketch.add_circle(g, Some(wp), DVec3::ZERO, 1.0).unwrap();
        let circle = sketch.request(circle).unwrap().entity();
        let (l, _) = line(&mut sketch, g, wp, DVec3::new(-2.0, 0.0, 0.0), DVec3::new(2.0, 0.0, 0.0));

        let hint = DVec3::new(1.0, 0.1, 0.0);
        let points = split_entities(&mut sketch, SplitSelection::Pair { a: circle, b: l }, hint).unwrap();
        assert_relative_eq!(
            sketch.point_position(points[0]).unwrap().distance(DVec3::X),
            0.0,
            epsilon = 1e-6
        );

        assert!(!sketch.has_entity(circle));
        let arc = sketch.entities().find(|e| e.is_arc()).unwrap();
        assert_relative_eq!(
            sketch.arc_angles(arc.id).unwrap().dtheta,
            std::f64::consts::TAU,
            epsilon = 1e-9
        );
        assert_eq!(line_ends(&sketch).len(), 2);
    }

    /// A datum coincident with `point`, returning the datum entity
    fn pin(sketch: &mut Sketch, g: GroupId, wp: EntityId, point: EntityId) -> EntityId {
        let at = sketch.point_position(point).unwrap();
        let datum = sketch.add_point(g, Some(wp), at).unwrap();
        let datum = sketch.request(datum).unwrap().entity();
        sketch
            .add_constraint(g, Some(wp), ConstraintKind::coincident(datum, point))
            .unwrap();
        datum
    }

    /// The point a datum's coincidence now refers to
    fn pinned(sketch: &Sketch, datum: EntityId) -> EntityId {
        sketch
            .constraints()
            .find_map(|c| match c.kind {
                ConstraintKind::PointsCoincident { a, b } if a == datum => Some(b),
                _ => None,
            })
            .unwrap()
    }

    fn joined(sketch: &Sketch, p: EntityId, q: EntityId) -> bool {
        sketch.constraints().any(|c| {
            c.kind == ConstraintKind::coincident(p, q) || c.kind == ConstraintKind::coincident(q, p)
        })
    }

    #[test]
    fn test_split_arc_by_line() {
        let (mut sketch, g, wp) = drawing();
        let r = sketch
            .add_arc(g, wp, DVec3::ZERO, DVec3::new(2.0, 0.0, 0.0), DVec3::new(-2.0, 0.0, 0.0))
            .unwrap();
        let original = sketch.request(r).unwrap().clone();
        let start_pin = pin(&mut sketch, g, wp, original.point(1));
        let finish_pin = pin(&mut sketch, g, wp, original.point(2));
        let (l, _) = line(&mut sketch, g, wp, DVec3::new(0.0, -1.0, 0.0), DVec3::new(0.0, 3.0, 0.0));

        let hint = DVec3::new(0.0, 2.0, 0.0);
        let points = split_entities(
            &mut sketch,
            SplitSelection::Pair {
                a: original.entity(),
                b: l,
            },
            hint,
        )
        .unwrap();
        assert_eq!(points.len(), 2);
        assert_relative_eq!(sketch.point_position(points[0]).unwrap().distance(hint), 0.0, epsilon = 1e-6);
        assert!(!sketch.has_entity(original.entity()));

        let arcs: Vec<_> = sketch.entities().filter(|e| e.is_arc()).cloned().collect();
        assert_eq!(arcs.len(), 2);
        for arc in &arcs {
            assert_relative_eq!(
                sketch.arc_angles(arc.id).unwrap().dtheta,
                std::f64::consts::FRAC_PI_2,
                epsilon = 1e-6
            );
        }

        // Both halves keep one center
        let centers: Vec<EntityId> = arcs.iter().map(|a| sketch.center_of(a.id).unwrap()).collect();
        assert!(joined(&sketch, centers[0], centers[1]));

        // The pinned ends moved onto the pieces
        let starts: Vec<EntityId> = arcs.iter().map(|a| a.endpoints().unwrap().0).collect();
        let finishes: Vec<EntityId> = arcs.iter().map(|a| a.endpoints().unwrap().1).collect();
        let start = pinned(&sketch, start_pin);
        let finish = pinned(&sketch, finish_pin);
        assert!(starts.contains(&start));
        assert!(finishes.contains(&finish));
        assert_relative_eq!(sketch.point_position(start).unwrap().x, 2.0, epsilon = 1e-12);
        assert_relative_eq!(sketch.point_position(finish).unwrap().x, -2.0, epsilon = 1e-12);

        // The pieces meet at the crossing
        let junction = finishes.iter().find(|f| **f != finish).unwrap();
        let next = starts.iter().find(|s| **s != start).unwrap();
        assert!(joined(&sketch, *junction, *next));
        assert_relative_eq!(sketch.point_position(*next).unwrap().distance(hint), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_split_cubic_by_line() {
        let (mut sketch, g, wp) = drawing();
        let r = sketch
            .add_cubic(
                g,
                Some(wp),
                [
                    DVec3::new(-3.0, 0.0, 0.0),
                    DVec3::new(-1.0, 4.0, 0.0),
                    DVec3::new(1.0, -4.0, 0.0),
                    DVec3::new(3.0, 0.0, 0.0),
                ],
            )
            .unwrap();
        let original = sketch.request(r).unwrap().clone();
        let start_pin = pin(&mut sketch, g, wp, original.point(0));
        let finish_pin = pin(&mut sketch, g, wp, original.point(3));
        let (l, _) = line(&mut sketch, g, wp, DVec3::new(0.0, -5.0, 0.0), DVec3::new(0.0, 5.0, 0.0));

        let points = split_entities(
            &mut sketch,
            SplitSelection::Pair {
                a: original.entity(),
                b: l,
            },
            DVec3::ZERO,
        )
        .unwrap();
        assert_relative_eq!(sketch.point_position(points[0]).unwrap().length(), 0.0, epsilon = 1e-6);
        assert!(!sketch.has_entity(original.entity()));

        let cubics: Vec<_> = sketch.entities().filter(|e| e.is_cubic()).cloned().collect();
        assert_eq!(cubics.len(), 2);
        let ends: Vec<(EntityId, EntityId)> = cubics.iter().map(|c| c.endpoints().unwrap()).collect();

        let start = pinned(&sketch, start_pin);
        let finish = pinned(&sketch, finish_pin);
        let first = ends.iter().find(|(s, _)| *s == start).unwrap();
        let second = ends.iter().find(|(_, f)| *f == finish).unwrap();
        assert_ne!(first, second);
        assert_relative_eq!(sketch.point_position(start).unwrap().x, -3.0, epsilon = 1e-12);
        assert_relative_eq!(sketch.point_position(finish).unwrap().x, 3.0, epsilon = 1e-12);

        assert!(joined(&sketch, first.1, second.0));
        assert_relative_eq!(sketch.point_position(first.1).unwrap().length(), 0.0, epsilon = 1e-6);
        assert_relative_eq!(sketch.point_position(second.0).unwrap().length(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_cubic_is_not_split_at_its_end() {
        let (mut sketch, g, wp) = drawing();
        let r = sketch
            .add_cubic(
                g,
                Some(wp),
                [
                    DVec3::new(-3.0, 0.0, 0.0),
                    DVec3::new(-1.0, 4.0, 0.0),
                    DVec3::new(1.0, -4.0, 0.0),
                    DVec3::new(3.0, 0.0, 0.0),
                ],
            )
            .unwrap();
        let cubic = sketch.request(r).unwrap().entity();
        let (l, _) = line(&mut sketch, g, wp, DVec3::new(-3.0, -1.0, 0.0), DVec3::new(-3.0, 1.0, 0.0));
        let before = sketch.to_ron().unwrap();

        assert!(matches!(
            split_entities(
                &mut sketch,
                SplitSelection::Pair { a: cubic, b: l },
                DVec3::new(-3.0, 0.0, 0.0)
            ),
            Err(CurveError::NoIntersection)
        ));
        assert_eq!(sketch.to_ron().unwrap(), before);
    }
}
