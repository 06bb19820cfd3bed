//! Rational Bézier pieces
//!
//! Lines, arcs, circles and cubics are all expressed as rational Bézier
//! pieces of degree one to three so that intersection, splitting and
//! polyline sampling share one evaluator.

use std::f64::consts::{FRAC_PI_2, TAU};

use glam::{DVec3, DVec4};

use crate::handle::EntityId;
use crate::sketch::{EntityKind, Sketch, SketchError, SketchResult};

/// Two points closer than this are the same point
pub const LENGTH_EPSILON: f64 = 1e-6;

const SAMPLES: usize = 64;
const PROJECT_ITERATIONS: usize = 24;
const STEP_HALVINGS: usize = 30;
const REFINE_ITERATIONS: usize = 100;

/// A rational Bézier curve of degree 1 to 3
#[derive(Debug, Clone, PartialEq)]
pub struct RationalBezier {
    ctrl: Vec<DVec3>,
    weights: Vec<f64>,
}

impl RationalBezier {
    pub fn line(a: DVec3, b: DVec3) -> Self {
        Self {
            ctrl: vec![a, b],
            weights: vec![1.0, 1.0],
        }
    }

    /// Conic through `p0` and `p2` pulled toward `p1` by `w1`
    pub fn conic(p0: DVec3, p1: DVec3, w1: f64, p2: DVec3) -> Self {
        Self {
            ctrl: vec![p0, p1, p2],
            weights: vec![1.0, w1, 1.0],
        }
    }

    pub fn cubic(points: [DVec3; 4]) -> Self {
        Self {
            ctrl: points.to_vec(),
            weights: vec![1.0; 4],
        }
    }

    /// Exact circular arc as conic pieces of at most a quarter turn
    ///
    /// `u` and `v` span the plane of the arc; angles are measured from `u`
    /// toward `v`.
    pub fn arc(center: DVec3, u: DVec3, v: DVec3, radius: f64, theta0: f64, dtheta: f64) -> Vec<Self> {
        let pieces = ((dtheta.abs() / FRAC_PI_2).ceil() as usize).max(1);
        let step = dtheta / pieces as f64;
        let at = |theta: f64, r: f64| center + (u * theta.cos() + v * theta.sin()) * r;
        let w = (step / 2.0).cos();
        (0..pieces)
            .map(|i| {
                let a = theta0 + step * i as f64;
                Self::conic(at(a, radius), at(a + step / 2.0, radius / w), w, at(a + step, radius))
            })
            .collect()
    }

    pub fn degree(&self) -> usize {
        self.ctrl.len() - 1
    }

    pub fn ctrl(&self) -> &[DVec3] {
        &self.ctrl
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn start(&self) -> DVec3 {
        self.ctrl[0]
    }

    pub fn finish(&self) -> DVec3 {
        self.ctrl[self.degree()]
    }

    pub fn is_rational(&self) -> bool {
        self.weights.iter().any(|w| (w - 1.0).abs() > 1e-12)
    }

    fn homogeneous(&self) -> Vec<DVec4> {
        self.ctrl
            .iter()
            .zip(&self.weights)
            .map(|(p, w)| (*p * *w).extend(*w))
            .collect()
    }

    fn from_homogeneous(points: &[DVec4]) -> Self {
        Self {
            ctrl: points.iter().map(|h| h.truncate() / h.w).collect(),
            weights: points.iter().map(|h| h.w).collect(),
        }
    }

    /// Evaluate with de Casteljau in homogeneous coordinates
    pub fn point_at(&self, t: f64) -> DVec3 {
        let mut tmp = self.homogeneous();
        let n = tmp.len();
        for k in 1..n {
            for i in 0..(n - k) {
                tmp[i] = tmp[i] * (1.0 - t) + tmp[i + 1] * t;
            }
        }
        tmp[0].truncate() / tmp[0].w
    }

    /// Derivative with respect to `t`
    pub fn tangent_at(&self, t: f64) -> DVec3 {
        let h = 1e-7;
        let (a, b) = ((t - h).max(0.0), (t + h).min(1.0));
        (self.point_at(b) - self.point_at(a)) / (b - a)
    }

    fn second_derivative_at(&self, t: f64) -> DVec3 {
        let h = 1e-4;
        let a = (t - h).clamp(0.0, 1.0 - 2.0 * h);
        (self.point_at(a) - self.point_at(a + h) * 2.0 + self.point_at(a + 2.0 * h)) / (h * h)
    }

    /// Split at `t` into the pieces before and after it
    pub fn split_at(&self, t: f64) -> (Self, Self) {
        let mut tmp = self.homogeneous();
        let n = tmp.len();
        let mut left = vec![tmp[0]];
        let mut right = vec![tmp[n - 1]];
        for k in 1..n {
            for i in 0..(n - k) {
                tmp[i] = tmp[i] * (1.0 - t) + tmp[i + 1] * t;
            }
            left.push(tmp[0]);
            right.push(tmp[n - k - 1]);
        }
        right.reverse();
        (Self::from_homogeneous(&left), Self::from_homogeneous(&right))
    }

    /// Parameter of the point nearest `p`, searching from `t`
    ///
    /// Each step is halved until it brings the curve closer to `p`, so the
    /// result is never farther away than the starting parameter.
    pub fn project_from(&self, p: DVec3, mut t: f64) -> f64 {
        let mut best = self.point_at(t).distance_squared(p);
        for _ in 0..PROJECT_ITERATIONS {
            let d = self.tangent_at(t);
            let len2 = d.length_squared();
            if len2 < 1e-30 {
                break;
            }
            let offset = self.point_at(t) - p;
            // Newton on the squared distance, Gauss-Newton where it is not convex
            let hessian = len2 + offset.dot(self.second_derivative_at(t));
            let mut step = offset.dot(d) / if hessian > 0.0 { hessian } else { len2 };
            if step.abs() < 1e-14 {
                break;
            }
            let mut improved = false;
            for _ in 0..STEP_HALVINGS {
                let next = (t - step).clamp(0.0, 1.0);
                let distance = self.point_at(next).distance_squared(p);
                if distance < best {
                    t = next;
                    best = distance;
                    improved = true;
                    break;
                }
                step *= 0.5;
            }
            if !improved {
                break;
            }
        }
        t
    }

    /// Parameter of the point nearest `p`
    pub fn closest_point(&self, p: DVec3) -> f64 {
        let start = (0..=SAMPLES)
            .map(|i| i as f64 / SAMPLES as f64)
            .min_by(|a, b| {
                let da = self.point_at(*a).distance_squared(p);
                let db = self.point_at(*b).distance_squared(p);
                da.total_cmp(&db)
            })
            .unwrap_or(0.0);
        self.project_from(p, start)
    }

    /// Polyline within `chord_tolerance` of the curve, end points included
    pub fn polyline(&self, chord_tolerance: f64, max_segments: usize) -> Vec<DVec3> {
        let d = self.degree();
        let segments = if d == 1 {
            1
        } else {
            // Bound on the polynomial's second differences
            let bend = self
                .ctrl
                .windows(3)
                .map(|w| (w[0] - w[1] * 2.0 + w[2]).length())
                .fold(0.0, f64::max);
            let spread = self.weights.iter().fold(1.0, |m: f64, w| m.max(1.0 / w));
            let n = ((d * (d - 1)) as f64 * bend * spread / (8.0 * chord_tolerance.max(1e-12))).sqrt();
            (n.ceil() as usize).clamp(1, max_segments.max(1))
        };
        (0..=segments)
            .map(|i| self.point_at(i as f64 / segments as f64))
            .collect()
    }

    /// Closest points between two pieces, refined by alternating projection
    fn refine(&self, other: &Self, mut ta: f64, mut tb: f64) -> Option<(f64, f64, DVec3)> {
        for _ in 0..REFINE_ITERATIONS {
            let pb = other.point_at(tb);
            ta = self.project_from(pb, ta);
            let pa = self.point_at(ta);
            tb = other.project_from(pa, tb);
            if pa.distance(other.point_at(tb)) < LENGTH_EPSILON * 1e-3 {
                break;
            }
        }
        let (pa, pb) = (self.point_at(ta), other.point_at(tb));
        (pa.distance(pb) < LENGTH_EPSILON).then_some((ta, tb, (pa + pb) / 2.0))
    }
}

/// Closest parameters between segments `p0p1` and `q0q1`
fn segment_params(p0: DVec3, p1: DVec3, q0: DVec3, q1: DVec3) -> (f64, f64) {
    let (d1, d2, r) = (p1 - p0, q1 - q0, p0 - q0);
    let (a, e, f) = (d1.length_squared(), d2.length_squared(), d2.dot(r));
    if a < 1e-30 && e < 1e-30 {
        return (0.0, 0.0);
    }
    if a < 1e-30 {
        return (0.0, (f / e).clamp(0.0, 1.0));
    }
    let c = d1.dot(r);
    if e < 1e-30 {
        return ((-c / a).clamp(0.0, 1.0), 0.0);
    }
    let b = d1.dot(d2);
    let denom = a * e - b * b;
    let mut s = if denom > 1e-30 {
        ((b * f - c * e) / denom).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let mut t = (b * s + f) / e;
    if t < 0.0 {
        t = 0.0;
        s = (-c / a).clamp(0.0, 1.0);
    } else if t > 1.0 {
        t = 1.0;
        s = ((b - c) / a).clamp(0.0, 1.0);
    }
    (s, t)
}

/// All points where two piece lists meet
pub fn intersections(a: &[RationalBezier], b: &[RationalBezier]) -> Vec<DVec3> {
    let mut found: Vec<DVec3> = Vec::new();
    for pa in a {
        for pb in b {
            let sa: Vec<DVec3> = (0..=SAMPLES).map(|i| pa.point_at(i as f64 / SAMPLES as f64)).collect();
            let sb: Vec<DVec3> = (0..=SAMPLES).map(|i| pb.point_at(i as f64 / SAMPLES as f64)).collect();
            for i in 0..SAMPLES {
                for j in 0..SAMPLES {
                    let (s, t) = segment_params(sa[i], sa[i + 1], sb[j], sb[j + 1]);
                    let ca = sa[i].lerp(sa[i + 1], s);
                    let cb = sb[j].lerp(sb[j + 1], t);
                    let reach = sa[i].distance(sa[i + 1]).max(sb[j].distance(sb[j + 1]));
                    if ca.distance(cb) > reach.max(LENGTH_EPSILON) {
                        continue;
                    }
                    let ta = (i as f64 + s) / SAMPLES as f64;
                    let tb = (j as f64 + t) / SAMPLES as f64;
                    if let Some((_, _, p)) = pa.refine(pb, ta, tb) {
                        if !found.iter().any(|q| q.distance(p) < LENGTH_EPSILON * 10.0) {
                            found.push(p);
                        }
                    }
                }
            }
        }
    }
    found
}

/// Bézier pieces for a curve entity
pub fn curves_for_entity(sketch: &Sketch, id: EntityId) -> SketchResult<Vec<RationalBezier>> {
    let entity = sketch.entity(id)?;
    match &entity.kind {
        EntityKind::LineSegment { points } => Ok(vec![RationalBezier::line(
            sketch.point_position(points[0])?,
            sketch.point_position(points[1])?,
        )]),
        EntityKind::Cubic { points } => {
            let mut p = [DVec3::ZERO; 4];
            for (slot, id) in p.iter_mut().zip(points) {
                *slot = sketch.point_position(*id)?;
            }
            Ok(vec![RationalBezier::cubic(p)])
        }
        EntityKind::Circle { center, normal, .. } => {
            let q = sketch.normal_orientation(*normal)?;
            Ok(RationalBezier::arc(
                sketch.point_position(*center)?,
                q * DVec3::X,
                q * DVec3::Y,
                sketch.radius_value(id)?,
                0.0,
                TAU,
            ))
        }
        EntityKind::ArcOfCircle { center, normal, .. } => {
            let q = sketch.normal_orientation(*normal)?;
            let angles = sketch.arc_angles(id)?;
            Ok(RationalBezier::arc(
                sketch.point_position(*center)?,
                q * DVec3::X,
                q * DVec3::Y,
                sketch.radius_value(id)?,
                angles.theta0,
                angles.dtheta,
            ))
        }
        _ => Err(SketchError::WrongEntityKind {
            entity: id,
            expected: "line, circle, arc or cubic",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn quarter() -> RationalBezier {
        RationalBezier::arc(DVec3::ZERO, DVec3::X, DVec3::Y, 2.0, 0.0, FRAC_PI_2)
            .pop()
            .unwrap()
    }

    #[test]
    fn test_arc_is_exact() {
        let arc = quarter();
        assert!(arc.is_rational());
        for i in 0..=10 {
            let p = arc.point_at(i as f64 / 10.0);
            assert_relative_eq!(p.length(), 2.0, epsilon = 1e-12);
        }
        assert_relative_eq!(arc.finish().y, 2.0, epsilon = 1e-12);
        assert_eq!(
            RationalBezier::arc(DVec3::ZERO, DVec3::X, DVec3::Y, 1.0, 0.0, TAU).len(),
            4
        );
    }

    #[test]
    fn test_split_keeps_shape() {
        let cubic = RationalBezier::cubic([
            DVec3::ZERO,
            DVec3::new(1.0, 2.0, 0.0),
            DVec3::new(3.0, 2.0, 0.0),
            DVec3::new(4.0, 0.0, 0.0),
        ]);
        let (left, right) = cubic.split_at(0.3);
        assert_relative_eq!(left.finish().distance(cubic.point_at(0.3)), 0.0, epsilon = 1e-12);
        assert_relative_eq!(right.start().distance(cubic.point_at(0.3)), 0.0, epsilon = 1e-12);
        assert_relative_eq!(
            right.point_at(0.5).distance(cubic.point_at(0.65)),
            0.0,
            epsilon = 1e-12
        );

        let arc = quarter();
        let (a, b) = arc.split_at(0.5);
        assert_relative_eq!(a.point_at(0.3).length(), 2.0, epsilon = 1e-12);
        assert_relative_eq!(b.point_at(0.7).length(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_line_crosses_circle_twice() {
        let circle = RationalBezier::arc(DVec3::ZERO, DVec3::X, DVec3::Y, 1.0, 0.0, TAU);
        let line = [RationalBezier::line(DVec3::new(-2.0, 0.5, 0.0), DVec3::new(2.0, 0.5, 0.0))];
        let mut hits = intersections(&line, &circle);
        hits.sort_by(|a, b| a.x.total_cmp(&b.x));
        assert_eq!(hits.len(), 2);
        let x = (1.0f64 - 0.25).sqrt();
        assert_relative_eq!(hits[0].x, -x, epsilon = 1e-6);
        assert_relative_eq!(hits[1].x, x, epsilon = 1e-6);
        assert_relative_eq!(hits[1].y, 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_parallel_lines_do_not_meet() {
        let a = [RationalBezier::line(DVec3::ZERO, DVec3::X)];
        let b = [RationalBezier::line(DVec3::Y, DVec3::new(1.0, 1.0, 0.0))];
        assert!(intersections(&a, &b).is_empty());
    }

    #[test]
    fn test_closest_point_and_polyline() {
        let arc = quarter();
        let t = arc.closest_point(DVec3::new(5.0, 5.0, 0.0));
        let p = arc.point_at(t);
        assert_relative_eq!(p.x, p.y, epsilon = 1e-8);

        assert_relative_eq!(p.x, 2f64.sqrt(), epsilon = 1e-8);

        let coarse = arc.polyline(0.1, 64);
        let fine = arc.polyline(0.001, 64);
        assert!(fine.len() > coarse.len());
        assert_eq!(RationalBezier::line(DVec3::ZERO, DVec3::X).polyline(0.001, 64).len(), 2);
    }

    #[test]
    fn test_closest_point_far_from_arc() {
        let arc = quarter();
        for q in [
            DVec3::new(10.0, 3.0, 0.0),
            DVec3::new(4.0, 30.0, 0.0),
            DVec3::new(50.0, 49.0, 0.0),
        ] {
            let p = arc.point_at(arc.closest_point(q));
            let expected = q.normalize() * 2.0;
            assert_relative_eq!(p.distance(expected), 0.0, epsilon = 1e-7);
        }

        // Beyond the end the nearest point is the end itself
        let q = DVec3::new(-10.0, 1.0, 0.0);
        let p = arc.point_at(arc.closest_point(q));
        assert_relative_eq!(p.distance(DVec3::new(0.0, 2.0, 0.0)), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_projection_never_moves_away() {
        let cubic = RationalBezier::cubic([
            DVec3::ZERO,
            DVec3::new(0.0, 5.0, 0.0),
            DVec3::new(5.0, 5.0, 0.0),
            DVec3::new(5.0, 0.0, 0.0),
        ]);
        let q = DVec3::new(2.5, 40.0, 0.0);
        for i in 0..=10 {
            let start = i as f64 / 10.0;
            let t = cubic.project_from(q, start);
            assert!(
                cubic.point_at(t).distance(q) <= cubic.point_at(start).distance(q) + 1e-12,
                "projection from {start} moved away"
            );
        }
        let t = cubic.closest_point(q);
        assert_relative_eq!(t, 0.5, epsilon = 1e-6);
    }
}
