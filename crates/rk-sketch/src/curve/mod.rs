//! Curve Utilities
//!
//! Numeric editing of sketch curves: rounding a corner with a tangent arc
//! and splitting curves where they meet.

pub mod bezier;
mod split;

pub use split::{SplitSelection, split_entities};

use glam::DVec3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::handle::{EntityId, RequestId};
use crate::sketch::{
    ArcEnd, ConstraintError, ConstraintKind, EntityKind, RequestKind, Sketch, SketchError,
    SketchResult, TangentEnds,
};
use bezier::LENGTH_EPSILON;

/// Error type for curve edits
#[derive(Debug, Clone, Error)]
pub enum CurveError {
    #[error("Sketch error: {0}")]
    Sketch(#[from] SketchError),

    #[error("Constraint error: {0}")]
    Constraint(#[from] ConstraintError),

    #[error("{0} is not in a workplane")]
    NotInWorkplane(EntityId),

    #[error("Expected two lines or arcs joining at {point}, found {found}")]
    NoCorner { point: EntityId, found: usize },

    #[error("Couldn't round this corner; try a smaller radius")]
    NoFit,

    #[error("No intersection found")]
    NoIntersection,

    #[error("{0} cannot be split; lines, circles, arcs or cubics only")]
    NotSplittable(EntityId),

    #[error("{point} is not constrained onto {entity}")]
    PointNotOnEntity { point: EntityId, entity: EntityId },
}

/// Result type for curve edits
pub type CurveResult<T> = Result<T, CurveError>;

/// Iteration settings for the tangent arc fit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TangentArcConfig {
    /// Steps while the radius ramps up to its final value
    pub iterations: usize,
    /// Steps at the final radius
    pub polish_iterations: usize,
    /// Largest parameter change in the last step of a converged fit
    pub convergence: f64,
    /// Trim parameters must stay inside `min_t..=max_t`
    pub min_t: f64,
    pub max_t: f64,
}

impl Default for TangentArcConfig {
    fn default() -> Self {
        Self {
            iterations: 1000,
            polish_iterations: 20,
            convergence: 1e-3,
            min_t: 0.01,
            max_t: 0.99,
        }
    }
}

impl TangentArcConfig {
    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations.max(1);
        self
    }

    pub fn with_polish_iterations(mut self, polish_iterations: usize) -> Self {
        self.polish_iterations = polish_iterations;
        self
    }
}

/// What happens to the curves being rounded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TangentArcMode {
    /// Trim the originals in place
    #[default]
    Modify,
    /// Keep the originals as construction and add trimmed copies
    Duplicate,
}

/// How the arc radius is chosen
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RadiusPolicy {
    Fixed(f64),
    /// Sized from the view scale, limited by the curve lengths
    Auto { view_scale: f64 },
}

impl Default for RadiusPolicy {
    fn default() -> Self {
        RadiusPolicy::Auto { view_scale: 1.0 }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TangentArcOptions {
    pub mode: TangentArcMode,
    pub radius: RadiusPolicy,
    pub config: TangentArcConfig,
}

impl TangentArcOptions {
    pub fn with_mode(mut self, mode: TangentArcMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_radius(mut self, radius: RadiusPolicy) -> Self {
        self.radius = radius;
        self
    }

    pub fn with_config(mut self, config: TangentArcConfig) -> Self {
        self.config = config;
        self
    }
}

/// A line or arc by its parametric equation, `t` in `0..=1`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParametricCurve {
    Line {
        p0: DVec3,
        p1: DVec3,
    },
    Arc {
        center: DVec3,
        radius: f64,
        theta0: f64,
        dtheta: f64,
        u: DVec3,
        v: DVec3,
    },
}

impl ParametricCurve {
    /// Build from a line or arc entity, `reverse` running it finish to start
    pub fn from_entity(sketch: &Sketch, id: EntityId, reverse: bool) -> SketchResult<Self> {
        match &sketch.entity(id)?.kind {
            EntityKind::LineSegment { points } => {
                let (mut p0, mut p1) = (
                    sketch.point_position(points[0])?,
                    sketch.point_position(points[1])?,
                );
                if reverse {
                    std::mem::swap(&mut p0, &mut p1);
                }
                Ok(ParametricCurve::Line { p0, p1 })
            }
            EntityKind::ArcOfCircle { center, normal, .. } => {
                let q = sketch.normal_orientation(*normal)?;
                let angles = sketch.arc_angles(id)?;
                let (theta0, dtheta) = if reverse {
                    (angles.theta1, -angles.dtheta)
                } else {
                    (angles.theta0, angles.dtheta)
                };
                Ok(ParametricCurve::Arc {
                    center: sketch.point_position(*center)?,
                    radius: sketch.radius_value(id)?,
                    theta0,
                    dtheta,
                    u: q * DVec3::X,
                    v: q * DVec3::Y,
                })
            }
            _ => Err(SketchError::WrongEntityKind {
                entity: id,
                expected: "line or arc",
            }),
        }
    }

    pub fn point_at(&self, t: f64) -> DVec3 {
        match *self {
            ParametricCurve::Line { p0, p1 } => p0 + (p1 - p0) * t,
            ParametricCurve::Arc {
                center,
                radius,
                theta0,
                dtheta,
                u,
                v,
            } => {
                let theta = theta0 + dtheta * t;
                center + (u * theta.cos() + v * theta.sin()) * radius
            }
        }
    }

    pub fn tangent_at(&self, t: f64) -> DVec3 {
        match *self {
            ParametricCurve::Line { p0, p1 } => p1 - p0,
            ParametricCurve::Arc {
                radius,
                theta0,
                dtheta,
                u,
                v,
                ..
            } => {
                let theta = theta0 + dtheta * t;
                (u * -theta.sin() + v * theta.cos()) * (radius * dtheta)
            }
        }
    }

    /// Length an automatic radius may eat into
    ///
    /// A third of a line, but only a twentieth of an arc, which is more
    /// nearly straight over short sections.
    pub fn length_for_auto(&self) -> f64 {
        match *self {
            ParametricCurve::Line { p0, p1 } => p0.distance(p1) / 3.0,
            ParametricCurve::Arc { radius, dtheta, .. } => dtheta.abs() * radius / 20.0,
        }
    }
}

/// Closest point of the line through `a0` along `da` to the line through
/// `b0` along `db`
fn intersect_lines(a0: DVec3, da: DVec3, b0: DVec3, db: DVec3) -> DVec3 {
    let w = a0 - b0;
    let (a, b, c) = (da.dot(da), da.dot(db), db.dot(db));
    let (d, e) = (da.dot(w), db.dot(w));
    let s = (b * e - c * d) / (a * c - b * b);
    a0 + da * s
}

fn with_magnitude(v: DVec3, length: f64) -> DVec3 {
    v.normalize_or_zero() * length
}

/// One of the two curves meeting at the corner
#[derive(Debug, Clone, Copy)]
struct Corner {
    request: RequestId,
    entity: EntityId,
    /// The corner is at this curve's finish
    at_finish: bool,
}

/// Result of the numeric fit
struct ArcFit {
    t: [f64; 2],
    radius: f64,
    intersection: DVec3,
    /// Sign of the turn from the first curve to the second
    turn: f64,
}

fn fit(curves: &[ParametricCurve; 2], normal: DVec3, options: &TangentArcOptions) -> Option<ArcFit> {
    let config = &options.config;
    let mut t = [0.0f64; 2];
    let mut previous = t;
    let (mut radius, mut intersection, mut turn) = (0.0, DVec3::ZERO, 0.0);

    for i in 0..config.iterations + config.polish_iterations {
        let p = [curves[0].point_at(t[0]), curves[1].point_at(t[1])];
        let d = [curves[0].tangent_at(t[0]), curves[1].tangent_at(t[1])];

        intersection = intersect_lines(p[0], d[0], p[1], d[1]);
        turn = d[1].dot(normal.cross(d[0]).normalize_or_zero());
        let theta = d[0]
            .normalize_or_zero()
            .dot(d[1].normalize_or_zero())
            .clamp(-1.0, 1.0)
            .acos();

        radius = match options.radius {
            RadiusPolicy::Fixed(r) => r,
            RadiusPolicy::Auto { view_scale } => (200.0 / view_scale)
                .min(curves[0].length_for_auto() * (theta / 2.0).tan())
                .min(curves[1].length_for_auto() * (theta / 2.0).tan()),
        };
        // Ramp the radius up for better convergence
        if i < config.iterations {
            radius *= 0.1 + 0.9 * i as f64 / config.iterations as f64;
        }

        let el = radius / (theta / 2.0).tan();
        previous = t;
        for k in 0..2 {
            let end = intersection + with_magnitude(d[k], el);
            t[k] += (end - p[k]).dot(d[k]) / d[k].length_squared();
        }
    }

    let converged = (0..2).all(|k| {
        t[k].is_finite()
            && (previous[k] - t[k]).abs() <= config.convergence
            && t[k] >= config.min_t
            && t[k] <= config.max_t
    });
    converged.then_some(ArcFit {
        t,
        radius,
        intersection,
        turn,
    })
}

/// Round the corner at `point` with a tangent arc
///
/// The two non-construction lines or arcs of the point's group and
/// workplane that end at the point are trimmed back and joined by a new
/// arc with tangency constraints. The sketch is unchanged on error.
pub fn fit_tangent_arc(
    sketch: &mut Sketch,
    point: EntityId,
    options: &TangentArcOptions,
) -> CurveResult<EntityId> {
    let entity = sketch.entity(point)?;
    let group = entity.group;
    let workplane = entity.workplane.ok_or(CurveError::NotInWorkplane(point))?;
    let shared = sketch.point_position(point)?;

    let mut corners = Vec::new();
    for r in sketch.requests() {
        if r.group != group
            || r.workplane != Some(workplane)
            || r.construction
            || !matches!(r.kind, RequestKind::LineSegment | RequestKind::ArcOfCircle)
        {
            continue;
        }
        let Some((s, f)) = sketch.entity(r.entity())?.endpoints() else {
            continue;
        };
        let at_start = sketch.point_position(s)?.distance(shared) < LENGTH_EPSILON;
        let at_finish = sketch.point_position(f)?.distance(shared) < LENGTH_EPSILON;
        if at_start || at_finish {
            corners.push(Corner {
                request: r.id,
                entity: r.entity(),
                at_finish,
            });
        }
    }
    let corners: [Corner; 2] = corners
        .try_into()
        .map_err(|found: Vec<Corner>| CurveError::NoCorner {
            point,
            found: found.len(),
        })?;

    let normal = sketch.workplane_frame(workplane)?.normal();
    let curves = [
        ParametricCurve::from_entity(sketch, corners[0].entity, corners[0].at_finish)?,
        ParametricCurve::from_entity(sketch, corners[1].entity, corners[1].at_finish)?,
    ];
    let fit = fit(&curves, normal, options).ok_or(CurveError::NoFit)?;

    let ends = [curves[0].point_at(fit.t[0]), curves[1].point_at(fit.t[1])];
    let toward = (fit.intersection - ends[0]).cross(normal);
    // Which arc end meets the first curve
    let (center, first_end) = if fit.turn < 0.0 {
        (ends[0] - with_magnitude(toward, fit.radius), ArcEnd::Start)
    } else {
        (ends[0] + with_magnitude(toward, fit.radius), ArcEnd::Finish)
    };

    let snapshot = sketch.snapshot();
    let result = (|| -> CurveResult<EntityId> {
        match options.mode {
            TangentArcMode::Modify => {
                let doomed: Vec<_> = sketch
                    .constraints()
                    .filter(|c| c.group == group && c.workplane == Some(workplane))
                    .filter(|c| match c.kind {
                        ConstraintKind::PointsCoincident { a, .. } => sketch
                            .point_position(a)
                            .is_ok_and(|p| p.distance(shared) < LENGTH_EPSILON),
                        _ => false,
                    })
                    .map(|c| c.id)
                    .collect();
                for cid in doomed {
                    sketch.delete_constraint(cid)?;
                }
            }
            TangentArcMode::Duplicate => {
                for corner in &corners {
                    sketch.set_construction(corner.request, true)?;
                }
            }
        }

        let (start, finish) = match first_end {
            ArcEnd::Start => (ends[0], ends[1]),
            ArcEnd::Finish => (ends[1], ends[0]),
        };
        let arc_request = sketch.add_arc(group, workplane, center, start, finish)?;
        let arc = sketch.request(arc_request)?.entity();

        let second_end = match first_end {
            ArcEnd::Start => ArcEnd::Finish,
            ArcEnd::Finish => ArcEnd::Start,
        };
        for (k, arc_end) in [(0, first_end), (1, second_end)] {
            trim(sketch, &curves[k], fit.t[k], options.mode, &corners[k], arc, arc_end)?;
        }
        Ok(arc)
    })();

    match result {
        Ok(arc) => {
            tracing::debug!("Rounded {} with arc {} of radius {}", point, arc, fit.radius);
            Ok(arc)
        }
        Err(e) => {
            tracing::warn!("Tangent arc at {} failed: {}", point, e);
            sketch.restore(snapshot);
            Err(e)
        }
    }
}

/// Trim or copy one rounded curve back to `t` and make it tangent to `arc`
fn trim(
    sketch: &mut Sketch,
    curve: &ParametricCurve,
    t: f64,
    mode: TangentArcMode,
    corner: &Corner,
    arc: EntityId,
    arc_end: ArcEnd,
) -> CurveResult<()> {
    let original = sketch.entity(corner.entity)?.clone();
    let (group, workplane) = (original.group, original.workplane);
    let Some((start, finish)) = original.endpoints() else {
        return Err(CurveError::NotSplittable(corner.entity));
    };

    let target = match mode {
        TangentArcMode::Modify => {
            let moved = if corner.at_finish { finish } else { start };
            sketch.force_point_to(moved, curve.point_at(t))?;
            sketch.constrain_point_if_coincident(moved)?;
            corner.entity
        }
        TangentArcMode::Duplicate => {
            let wp = workplane.ok_or(CurveError::NotInWorkplane(corner.entity))?;
            let request = match *curve {
                ParametricCurve::Line { .. } => {
                    let r = sketch.add_line(group, workplane, curve.point_at(t), curve.point_at(1.0))?;
                    let copy = sketch.request(r)?.clone();
                    for p in [copy.point(0), copy.point(1)] {
                        sketch.constrain_point_if_coincident(p)?;
                    }
                    sketch.add_constraint(
                        group,
                        workplane,
                        ConstraintKind::point_on_line(copy.point(0), corner.entity),
                    )?;
                    copy
                }
                ParametricCurve::Arc { center, dtheta, .. } => {
                    let (s, f) = if dtheta > 0.0 {
                        (curve.point_at(t), curve.point_at(1.0))
                    } else {
                        (curve.point_at(1.0), curve.point_at(t))
                    };
                    let r = sketch.add_arc(group, wp, center, s, f)?;
                    let copy = sketch.request(r)?.clone();
                    for p in [copy.point(0), copy.point(1), copy.point(2)] {
                        sketch.constrain_point_if_coincident(p)?;
                    }
                    copy
                }
            };
            request.entity()
        }
    };

    let tangency = match *curve {
        ParametricCurve::Line { .. } => ConstraintKind::ArcLineTangent {
            arc,
            line: target,
            end: arc_end,
        },
        ParametricCurve::Arc { dtheta, .. } => {
            let other_end = if dtheta < 0.0 {
                ArcEnd::Finish
            } else {
                ArcEnd::Start
            };
            ConstraintKind::CurveCurveTangent {
                a: arc,
                b: target,
                ends: TangentEnds::from_ends(arc_end, other_end),
            }
        }
    };
    sketch.add_constraint(group, workplane, tangency)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupKind;
    use crate::handle::GroupId;
    use crate::solver::{SolverConfig, solve_group};
    use approx::assert_relative_eq;

    /// Two perpendicular lines of length 10 meeting at the origin
    fn corner() -> (Sketch, GroupId, EntityId, [EntityId; 2]) {
        let mut sketch = Sketch::new();
        let g = sketch
            .add_group("sketch", GroupKind::workplane_xy(), None)
            .unwrap();
        let wp = sketch.group(g).unwrap().workplane.unwrap();
        let a = sketch
            .add_line(g, Some(wp), DVec3::ZERO, DVec3::new(10.0, 0.0, 0.0))
            .unwrap();
        let b = sketch
            .add_line(g, Some(wp), DVec3::ZERO, DVec3::new(0.0, 10.0, 0.0))
            .unwrap();
        let (a, b) = (
            sketch.request(a).unwrap().clone(),
            sketch.request(b).unwrap().clone(),
        );
        sketch
            .add_constraint(g, Some(wp), ConstraintKind::coincident(a.point(0), b.point(0)))
            .unwrap();
        (sketch, g, a.point(0), [a.entity(), b.entity()])
    }

    #[test]
    fn test_parametric_line_and_arc() {
        let line = ParametricCurve::Line {
            p0: DVec3::ZERO,
            p1: DVec3::new(3.0, 0.0, 0.0),
        };
        assert_eq!(line.point_at(0.5), DVec3::new(1.5, 0.0, 0.0));
        assert_relative_eq!(line.length_for_auto(), 1.0);

        let arc = ParametricCurve::Arc {
            center: DVec3::ZERO,
            radius: 2.0,
            theta0: 0.0,
            dtheta: std::f64::consts::PI,
            u: DVec3::X,
            v: DVec3::Y,
        };
        assert_relative_eq!(arc.point_at(0.5).y, 2.0, epsilon = 1e-12);
        assert_relative_eq!(arc.tangent_at(0.0).y, 2.0 * std::f64::consts::PI, epsilon = 1e-12);
    }

    #[test]
    fn test_round_perpendicular_corner() {
        let (mut sketch, g, corner_point, [a, b]) = corner();
        let options = TangentArcOptions::default().with_radius(RadiusPolicy::Fixed(2.0));
        let arc = fit_tangent_arc(&mut sketch, corner_point, &options).unwrap();

        assert_relative_eq!(sketch.radius_value(arc).unwrap(), 2.0, epsilon = 1e-6);
        let center = sketch.point_position(sketch.center_of(arc).unwrap()).unwrap();
        assert_relative_eq!(center.distance(DVec3::new(2.0, 2.0, 0.0)), 0.0, epsilon = 1e-6);

        // Both lines trimmed to distance r from the corner
        let (a0, _) = sketch.entity(a).unwrap().endpoints().unwrap();
        let (b0, _) = sketch.entity(b).unwrap().endpoints().unwrap();
        let pa = sketch.point_position(a0).unwrap();
        let pb = sketch.point_position(b0).unwrap();
        assert_relative_eq!(pa.distance(DVec3::new(2.0, 0.0, 0.0)), 0.0, epsilon = 1e-6);
        assert_relative_eq!(pb.distance(DVec3::new(0.0, 2.0, 0.0)), 0.0, epsilon = 1e-6);

        // Tangents at each junction are parallel
        for (end, dir) in [(pa, DVec3::X), (pb, DVec3::Y)] {
            let radial = (end - center).normalize();
            assert_relative_eq!(radial.dot(dir), 0.0, epsilon = 1e-6);
        }

        // Old corner coincidence replaced by two junctions and two tangencies
        let kinds: Vec<_> = sketch.constraints().map(|c| c.type_name()).collect();
        assert_eq!(kinds.len(), 4);
        assert_eq!(kinds.iter().filter(|k| **k == "Arc-Line Tangent").count(), 2);

        let outcome = solve_group(&mut sketch, g, &SolverConfig::default());
        assert!(outcome.status.is_acceptable());
        assert_relative_eq!(sketch.radius_value(arc).unwrap(), 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_duplicate_keeps_originals() {
        let (mut sketch, _, corner_point, [a, b]) = corner();
        let options = TangentArcOptions::default()
            .with_mode(TangentArcMode::Duplicate)
            .with_radius(RadiusPolicy::Fixed(1.0));
        fit_tangent_arc(&mut sketch, corner_point, &options).unwrap();

        assert_eq!(sketch.requests().count(), 5);
        assert!(sketch.entity(a).unwrap().construction);
        assert!(sketch.entity(b).unwrap().construction);
        assert_eq!(sketch.requests().filter(|r| !r.construction).count(), 3);
    }

    #[test]
    fn test_auto_radius() {
        let (mut sketch, _, corner_point, _) = corner();
        let options = TangentArcOptions::default().with_radius(RadiusPolicy::Auto { view_scale: 1.0 });
        let arc = fit_tangent_arc(&mut sketch, corner_point, &options).unwrap();
        // A third of the line at a right angle
        assert_relative_eq!(sketch.radius_value(arc).unwrap(), 10.0 / 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_radius_too_large_leaves_sketch_alone() {
        let (mut sketch, _, corner_point, _) = corner();
        let before = sketch.to_ron().unwrap();
        let options = TangentArcOptions::default().with_radius(RadiusPolicy::Fixed(20.0));
        assert!(matches!(
            fit_tangent_arc(&mut sketch, corner_point, &options),
            Err(CurveError::NoFit)
        ));
        assert_eq!(sketch.to_ron().unwrap(), before);
    }

    #[test]
    fn test_needs_two_curves() {
        let (mut sketch, _, _, [a, _]) = corner();
        let (_, far) = sketch.entity(a).unwrap().endpoints().unwrap();
        assert!(matches!(
            fit_tangent_arc(&mut sketch, far, &TangentArcOptions::default()),
            Err(CurveError::NoCorner { found: 1, .. })
        ));
    }
}
