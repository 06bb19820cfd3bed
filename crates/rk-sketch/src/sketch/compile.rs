//! Constraint compilation
//!
//! Turns each constraint into residual equations over parameters. When a
//! constraint has a workplane, vectors are projected into it first.

use std::f64::consts::{PI, TAU};

use super::{
    ArcEnd, Constraint, ConstraintError, ConstraintKind, ConstraintResult, Entity, EntityKind,
    Equation, Sketch, TangentEnds,
};
use crate::expr::{Expr, ExprVector};
use crate::handle::{ConstraintId, EntityId, EquationId, GroupId, ParamId};

/// Below this a length or radius counts as zero
const DEGENERATE_EPSILON: f64 = 1e-9;
/// Endpoints closer than this are treated as shared
const SHARED_ENDPOINT_EPSILON: f64 = 1e-6;

struct Basis {
    origin: ExprVector,
    u: ExprVector,
    v: ExprVector,
}

struct Compiler<'a> {
    sketch: &'a Sketch,
    id: ConstraintId,
    name: &'static str,
    basis: Option<Basis>,
    equations: Vec<Equation>,
}

impl<'a> Compiler<'a> {
    fn new(sketch: &'a Sketch, constraint: &Constraint) -> ConstraintResult<Self> {
        let basis = match constraint.workplane {
            Some(wp) => {
                let (origin, normal) = sketch.workplane_exprs(wp)?;
                Some(Basis {
                    origin,
                    u: normal.rotation_u(),
                    v: normal.rotation_v(),
                })
            }
            None => None,
        };
        Ok(Self {
            sketch,
            id: constraint.id,
            name: constraint.kind.type_name(),
            basis,
            equations: Vec::new(),
        })
    }

    fn add(&mut self, expr: Expr) {
        let index = self.equations.len() as u32;
        self.equations
            .push(Equation::new(EquationId::constraint(self.id, index), expr));
    }

    fn helper(&self, index: u32) -> Expr {
        Expr::param(ParamId::constraint(self.id, index))
    }

    fn numeric(&self, expr: &Expr) -> f64 {
        expr.eval(&|p| self.sketch.value_of(p))
    }

    fn wrong(&self, entity: EntityId, expected: &'static str) -> ConstraintError {
        ConstraintError::WrongEntity {
            constraint: self.name,
            entity,
            expected,
        }
    }

    fn point(&self, id: EntityId) -> ConstraintResult<ExprVector> {
        Ok(self.sketch.point_expr(id)?)
    }

    /// Project a vector into the workplane as `(u, v, 0)`
    fn project(&self, v: &ExprVector) -> ExprVector {
        match &self.basis {
            Some(b) => ExprVector::new(v.dot(&b.u), v.dot(&b.v), Expr::constant(0.0)),
            None => v.clone(),
        }
    }

    fn line(&self, id: EntityId) -> ConstraintResult<(ExprVector, ExprVector)> {
        match &self.sketch.entity(id)?.kind {
            EntityKind::LineSegment { points } => Ok((self.point(points[0])?, self.point(points[1])?)),
            _ => Err(self.wrong(id, "line segment")),
        }
    }

    fn line_dir(&self, id: EntityId) -> ConstraintResult<ExprVector> {
        let (a, b) = self.line(id)?;
        Ok(self.project(&b.minus(&a)))
    }

    fn line_length(&self, id: EntityId) -> ConstraintResult<Expr> {
        Ok(self.line_dir(id)?.magnitude())
    }

    /// Distance from a point to a line; signed inside a workplane
    fn point_line_distance(&self, point: EntityId, line: EntityId) -> ConstraintResult<Expr> {
        let (a, b) = self.line(line)?;
        let p = self.point(point)?;
        let d = self.project(&b.minus(&a));
        let w = self.project(&p.minus(&a));
        if self.basis.is_some() {
            Ok(cross2d(&d, &w).div(d.magnitude()))
        } else {
            Ok(w.cross(&d).magnitude().div(d.magnitude()))
        }
    }

    /// Flip an expression so it is non-negative at the current values
    fn positive_now(&self, expr: Expr) -> Expr {
        if self.numeric(&expr) < 0.0 {
            expr.negate()
        } else {
            expr
        }
    }

    fn arc_parts(&self, id: EntityId) -> ConstraintResult<(EntityId, EntityId, EntityId, EntityId)> {
        match &self.sketch.entity(id)?.kind {
            EntityKind::ArcOfCircle {
                center,
                start,
                finish,
                normal,
            } => Ok((*center, *start, *finish, *normal)),
            _ => Err(self.wrong(id, "arc")),
        }
    }

    /// Arc length; the sweep side is chosen from the current geometry
    fn arc_length(&self, id: EntityId) -> ConstraintResult<Expr> {
        let (center, start, finish, _) = self.arc_parts(id)?;
        let c = self.point(center)?;
        let rs = self.point(start)?.minus(&c);
        let rf = self.point(finish)?.minus(&c);
        let r = rs.magnitude();
        let cos = rs.dot(&rf).div(r.clone().times(rf.magnitude()));
        let mut theta = cos.acos();
        if self.sketch.arc_angles(id)?.dtheta > PI {
            theta = Expr::constant(TAU).minus(theta);
        }
        Ok(r.times(theta))
    }

    /// Direction of a curve at one of its ends, in space
    fn end_tangent(&self, curve: EntityId, end: ArcEnd) -> ConstraintResult<ExprVector> {
        match &self.sketch.entity(curve)?.kind {
            EntityKind::ArcOfCircle {
                center,
                start,
                finish,
                normal,
            } => {
                let at = match end {
                    ArcEnd::Start => start,
                    ArcEnd::Finish => finish,
                };
                let n = self.sketch.normal_expr(*normal)?.rotation_n();
                let radial = self.point(*at)?.minus(&self.point(*center)?);
                Ok(n.cross(&radial))
            }
            EntityKind::Cubic { points } => Ok(match end {
                ArcEnd::Start => self.point(points[1])?.minus(&self.point(points[0])?),
                ArcEnd::Finish => self.point(points[3])?.minus(&self.point(points[2])?),
            }),
            EntityKind::LineSegment { points } => {
                Ok(self.point(points[1])?.minus(&self.point(points[0])?))
            }
            _ => Err(self.wrong(curve, "curve")),
        }
    }

    /// Workplane coordinates of a point
    fn in_plane_coords(&self, point: EntityId) -> ConstraintResult<(Expr, Expr)> {
        let p = self.point(point)?;
        let v = match &self.basis {
            Some(b) => self.project(&p.minus(&b.origin)),
            None => p,
        };
        Ok((v.x, v.y))
    }

    fn coordinate_differences(&mut self, d: ExprVector) {
        let d = self.project(&d);
        self.add(d.x);
        self.add(d.y);
        if self.basis.is_none() {
            self.add(d.z);
        }
    }

    fn compile(&mut self, kind: &ConstraintKind) -> ConstraintResult<()> {
        use ConstraintKind::*;
        match kind {
            PointsCoincident { a, b } => {
                let d = self.point(*a)?.minus(&self.point(*b)?);
                self.coordinate_differences(d);
            }
            PtPtDistance { a, b, distance } => {
                let d = self.project(&self.point(*a)?.minus(&self.point(*b)?));
                self.add(d.magnitude().minus(Expr::constant(*distance)));
            }
            ProjPtDistance {
                a,
                b,
                along,
                distance,
            } => {
                let (la, lb) = self.line(*along)?;
                let unit = lb.minus(&la).with_magnitude(&Expr::constant(1.0));
                let d = self.point(*b)?.minus(&self.point(*a)?);
                self.add(d.dot(&unit).minus(Expr::constant(*distance)));
            }
            PtPlaneDistance {
                point,
                plane,
                distance,
            }
            | PtFaceDistance {
                point,
                face: plane,
                distance,
            } => {
                let h = self.plane_height(*point, *plane)?;
                self.add(h.minus(Expr::constant(*distance)));
            }
            PtInPlane { point, plane } | PtOnFace { point, face: plane } => {
                let h = self.plane_height(*point, *plane)?;
                self.add(h);
            }
            PtLineDistance {
                point,
                line,
                distance,
            } => {
                let d = self.point_line_distance(*point, *line)?;
                self.add(d.minus(Expr::constant(*distance)));
            }
            PtOnLine { point, line } => {
                if self.basis.is_some() {
                    let d = self.point_line_distance(*point, *line)?;
                    self.add(d);
                } else {
                    let (a, b) = self.line(*line)?;
                    let t = self.helper(0);
                    let on = a.plus(&b.minus(&a).scaled_by(&t));
                    let d = on.minus(&self.point(*point)?);
                    self.add(d.x);
                    self.add(d.y);
                    self.add(d.z);
                }
            }
            PtOnCircle { point, circle } => {
                let normal = self.sketch.normal_expr(self.sketch.normal_of(*circle)?)?;
                let c = self.point(self.sketch.center_of(*circle)?)?;
                let d = self.point(*point)?.minus(&c);
                let du = d.dot(&normal.rotation_u());
                let dv = d.dot(&normal.rotation_v());
                let r = self.sketch.radius_expr(*circle)?;
                self.add(du.square().plus(dv.square()).sqrt().minus(r));
            }
            EqualLengthLines { a, b } => {
                let e = self.line_length(*a)?.minus(self.line_length(*b)?);
                self.add(e);
            }
            LengthRatio { a, b, ratio } => {
                let e = self
                    .line_length(*a)?
                    .div(self.line_length(*b)?)
                    .minus(Expr::constant(*ratio));
                self.add(e);
            }
            LengthDifference { a, b, difference } => {
                let e = self
                    .line_length(*a)?
                    .minus(self.line_length(*b)?)
                    .minus(Expr::constant(*difference));
                self.add(e);
            }
            EqualLengthPointLineDistance {
                line,
                point,
                other_line,
            } => {
                let d = self.point_line_distance(*point, *other_line)?;
                let d = self.positive_now(d);
                let e = self.line_length(*line)?.minus(d);
                self.add(e);
            }
            EqualPointLineDistances {
                point_a,
                line_a,
                point_b,
                line_b,
            } => {
                let da = self.point_line_distance(*point_a, *line_a)?;
                let da = self.positive_now(da);
                let db = self.point_line_distance(*point_b, *line_b)?;
                let db = self.positive_now(db);
                self.add(da.minus(db));
            }
            EqualLineArcLen { line, arc } => {
                let e = self.line_length(*line)?.minus(self.arc_length(*arc)?);
                self.add(e);
            }
            ArcArcLenRatio { a, b, ratio } => {
                let e = self
                    .arc_length(*a)?
                    .div(self.arc_length(*b)?)
                    .minus(Expr::constant(*ratio));
                self.add(e);
            }
            ArcLineLenRatio { arc, line, ratio } => {
                let e = self
                    .arc_length(*arc)?
                    .div(self.line_length(*line)?)
                    .minus(Expr::constant(*ratio));
                self.add(e);
            }
            ArcArcDifference { a, b, difference } => {
                let e = self
                    .arc_length(*a)?
                    .minus(self.arc_length(*b)?)
                    .minus(Expr::constant(*difference));
                self.add(e);
            }
            ArcLineDifference {
                arc,
                line,
                difference,
            } => {
                let e = self
                    .arc_length(*arc)?
                    .minus(self.line_length(*line)?)
                    .minus(Expr::constant(*difference));
                self.add(e);
            }
            EqualRadius { a, b } => {
                let e = self
                    .sketch
                    .radius_expr(*a)?
                    .minus(self.sketch.radius_expr(*b)?);
                self.add(e);
            }
            Diameter { circle, diameter } => {
                let e = Expr::constant(2.0)
                    .times(self.sketch.radius_expr(*circle)?)
                    .minus(Expr::constant(*diameter));
                self.add(e);
            }
            Symmetric { a, b, plane } => {
                let pa = self.point(*a)?;
                let pb = self.point(*b)?;
                let origin = self.sketch.plane_point_expr(*plane)?;
                let n = self.sketch.plane_normal_expr(*plane)?;
                let mid = pa.plus(&pb).scaled_by(&Expr::constant(0.5));
                self.add(mid.minus(&origin).dot(&n));
                let d = pa.minus(&pb);
                if self.basis.is_some() {
                    let e = cross2d(&self.project(&d), &self.project(&n));
                    self.add(e);
                } else {
                    let (u, v) = self.plane_axes(*plane, &n)?;
                    self.add(d.dot(&u));
                    self.add(d.dot(&v));
                }
            }
            SymmetricHoriz { a, b } => {
                let (au, av) = self.in_plane_coords(*a)?;
                let (bu, bv) = self.in_plane_coords(*b)?;
                self.add(au.plus(bu));
                self.add(av.minus(bv));
            }
            SymmetricVert { a, b } => {
                let (au, av) = self.in_plane_coords(*a)?;
                let (bu, bv) = self.in_plane_coords(*b)?;
                self.add(av.plus(bv));
                self.add(au.minus(bu));
            }
            SymmetricLine { a, b, line } => {
                let (la, lb) = self.line(*line)?;
                let dl = self.project(&lb.minus(&la));
                let pa = self.point(*a)?;
                let pb = self.point(*b)?;
                let mid = pa.plus(&pb).scaled_by(&Expr::constant(0.5));
                let on_line = cross2d(&dl, &self.project(&mid.minus(&la)));
                let across = self.project(&pa.minus(&pb)).dot(&dl);
                self.add(on_line);
                self.add(across);
            }
            AtMidpoint { point, line } => {
                let (a, b) = self.line(*line)?;
                let mid = a.plus(&b).scaled_by(&Expr::constant(0.5));
                let d = self.point(*point)?.minus(&mid);
                self.coordinate_differences(d);
            }
            Horizontal { line } => {
                let d = self.line_dir(*line)?;
                self.add(d.y);
            }
            Vertical { line } => {
                let d = self.line_dir(*line)?;
                self.add(d.x);
            }
            SameOrientation { a, b } => {
                let qa = self.sketch.normal_expr(*a)?;
                let qb = self.sketch.normal_expr(*b)?;
                let s = self.helper(0);
                let d = qa.rotation_n().minus(&qb.rotation_n().scaled_by(&s));
                self.add(d.x);
                self.add(d.y);
                self.add(d.z);
                let ua = qa.rotation_u();
                let twist_v = ua.dot(&qb.rotation_v());
                let twist_u = ua.dot(&qb.rotation_u());
                if self.numeric(&twist_v).abs() < self.numeric(&twist_u).abs() {
                    self.add(twist_v);
                } else {
                    self.add(twist_u);
                }
            }
            Angle {
                a,
                b,
                degrees,
                supplementary,
            } => {
                let mut da = self.line_dir(*a)?;
                if *supplementary {
                    da = da.negated();
                }
                let db = self.line_dir(*b)?;
                let e = direction_cosine(&da, &db).minus(Expr::constant(degrees.to_radians().cos()));
                self.add(e);
            }
            EqualAngle {
                a,
                b,
                c,
                d,
                supplementary,
            } => {
                let mut da = self.line_dir(*a)?;
                if *supplementary {
                    da = da.negated();
                }
                let first = direction_cosine(&da, &self.line_dir(*b)?);
                let second = direction_cosine(&self.line_dir(*c)?, &self.line_dir(*d)?);
                self.add(first.minus(second));
            }
            Parallel { a, b } => {
                let da = self.line_dir(*a)?;
                let db = self.line_dir(*b)?;
                if self.basis.is_some() {
                    self.add(cross2d(&da, &db));
                } else {
                    let d = da.minus(&db.scaled_by(&self.helper(0)));
                    self.add(d.x);
                    self.add(d.y);
                    self.add(d.z);
                }
            }
            Perpendicular { a, b } => {
                let e = direction_cosine(&self.line_dir(*a)?, &self.line_dir(*b)?);
                self.add(e);
            }
            ArcLineTangent { arc, line, end } => {
                let (center, start, finish, _) = self.arc_parts(*arc)?;
                let at = match end {
                    ArcEnd::Start => start,
                    ArcEnd::Finish => finish,
                };
                let radial = self.project(&self.point(at)?.minus(&self.point(center)?));
                let e = direction_cosine(&radial, &self.line_dir(*line)?);
                self.add(e);
            }
            CubicLineTangent { cubic, line, end } => {
                if !self.sketch.entity(*cubic)?.is_cubic() {
                    return Err(self.wrong(*cubic, "cubic"));
                }
                let t = self.project(&self.end_tangent(*cubic, *end)?);
                let e = cross2d(&t, &self.line_dir(*line)?);
                self.add(e);
            }
            CurveCurveTangent { a, b, ends } => {
                let ta = self.project(&self.end_tangent(*a, ends.first())?);
                let tb = self.project(&self.end_tangent(*b, ends.second())?);
                self.add(cross2d(&ta, &tb));
            }
            WhereDragged { point } => {
                for param in self.sketch.entity(*point)?.own_params() {
                    let e = Expr::param(param).minus(Expr::constant(self.sketch.value_of(param)));
                    self.add(e);
                }
            }
            Comment { .. } => {}
        }
        Ok(())
    }

    /// Signed height of a point above a workplane or face
    fn plane_height(&self, point: EntityId, plane: EntityId) -> ConstraintResult<Expr> {
        let origin = self.sketch.plane_point_expr(plane)?;
        let n = self.sketch.plane_normal_expr(plane)?;
        Ok(self.point(point)?.minus(&origin).dot(&n))
    }

    /// Two directions spanning a plane with normal `n`
    fn plane_axes(&self, plane: EntityId, n: &ExprVector) -> ConstraintResult<(ExprVector, ExprVector)> {
        match &self.sketch.entity(plane)?.kind {
            EntityKind::Workplane { normal, .. }
            | EntityKind::Face {
                normal: super::FaceNormal::Normal(normal),
                ..
            } => {
                let q = self.sketch.normal_expr(*normal)?;
                Ok((q.rotation_u(), q.rotation_v()))
            }
            EntityKind::Face {
                normal: super::FaceNormal::Sweep { from, to, .. },
                ..
            } => {
                let u = self
                    .point(*to)?
                    .minus(&self.point(*from)?)
                    .with_magnitude(&Expr::constant(1.0));
                let v = n.cross(&u);
                Ok((u, v))
            }
            _ => Err(self.wrong(plane, "plane")),
        }
    }
}

fn cross2d(a: &ExprVector, b: &ExprVector) -> Expr {
    a.x.clone()
        .times(b.y.clone())
        .minus(a.y.clone().times(b.x.clone()))
}

fn direction_cosine(a: &ExprVector, b: &ExprVector) -> Expr {
    a.dot(b).div(a.magnitude().times(b.magnitude()))
}

/// Residual equations of a constraint
///
/// Reference constraints produce nothing unless `for_reference` is set.
pub fn generate_equations(
    sketch: &Sketch,
    constraint: &Constraint,
    for_reference: bool,
) -> ConstraintResult<Vec<Equation>> {
    if constraint.reference && !for_reference {
        return Ok(Vec::new());
    }
    let mut compiler = Compiler::new(sketch, constraint)?;
    compiler.compile(&constraint.kind)?;
    Ok(compiler.equations)
}

// ============== Validation ==============

fn expect<'s>(
    sketch: &'s Sketch,
    name: &'static str,
    id: EntityId,
    ok: fn(&Entity) -> bool,
    expected: &'static str,
) -> ConstraintResult<&'s Entity> {
    let entity = sketch.entity(id)?;
    if ok(entity) {
        Ok(entity)
    } else {
        Err(ConstraintError::WrongEntity {
            constraint: name,
            entity: id,
            expected,
        })
    }
}

fn is_plane(e: &Entity) -> bool {
    e.is_workplane() || e.is_face()
}

fn is_smooth_curve(e: &Entity) -> bool {
    e.is_arc() || e.is_cubic()
}

/// Lines whose direction a constraint divides by
fn direction_lines(kind: &ConstraintKind) -> Vec<EntityId> {
    use ConstraintKind::*;
    match kind {
        ProjPtDistance { along, .. } => vec![*along],
        PtLineDistance { line, .. } | PtOnLine { line, .. } | SymmetricLine { line, .. } => {
            vec![*line]
        }
        LengthRatio { b, .. } => vec![*b],
        EqualLengthPointLineDistance { other_line, .. } => vec![*other_line],
        EqualPointLineDistances { line_a, line_b, .. } => vec![*line_a, *line_b],
        ArcLineLenRatio { line, .. } | ArcLineTangent { line, .. } | CubicLineTangent { line, .. } => {
            vec![*line]
        }
        Angle { a, b, .. } | Parallel { a, b } | Perpendicular { a, b } => vec![*a, *b],
        EqualAngle { a, b, c, d, .. } => vec![*a, *b, *c, *d],
        _ => Vec::new(),
    }
}

/// Arcs whose radius must not vanish
fn radius_arcs(kind: &ConstraintKind) -> Vec<EntityId> {
    use ConstraintKind::*;
    match kind {
        EqualLineArcLen { arc, .. }
        | ArcLineLenRatio { arc, .. }
        | ArcLineDifference { arc, .. }
        | ArcLineTangent { arc, .. } => vec![*arc],
        ArcArcLenRatio { a, b, .. } | ArcArcDifference { a, b, .. } => vec![*a, *b],
        _ => Vec::new(),
    }
}

/// Check a constraint before it is added
pub fn validate(
    sketch: &Sketch,
    group: GroupId,
    workplane: Option<EntityId>,
    kind: &ConstraintKind,
) -> ConstraintResult<()> {
    use ConstraintKind::*;
    let name = kind.type_name();
    sketch.group(group)?;

    if let Some(wp) = workplane {
        expect(sketch, name, wp, Entity::is_workplane, "workplane")?;
    } else if kind.requires_workplane() {
        return Err(ConstraintError::WorkplaneRequired(name));
    }

    let point = |id: EntityId| expect(sketch, name, id, Entity::is_point, "point").map(|_| ());
    let line = |id: EntityId| expect(sketch, name, id, Entity::is_line, "line segment").map(|_| ());
    let arc = |id: EntityId| expect(sketch, name, id, Entity::is_arc, "arc").map(|_| ());
    let round = |id: EntityId| expect(sketch, name, id, Entity::is_circle_or_arc, "circle or arc").map(|_| ());
    let plane = |id: EntityId| expect(sketch, name, id, is_plane, "plane").map(|_| ());

    match kind {
        PointsCoincident { a, b } | PtPtDistance { a, b, .. } => {
            point(*a)?;
            point(*b)?;
        }
        ProjPtDistance { a, b, along, .. } => {
            point(*a)?;
            point(*b)?;
            line(*along)?;
        }
        PtPlaneDistance { point: p, plane: pl, .. } | PtInPlane { point: p, plane: pl } => {
            point(*p)?;
            plane(*pl)?;
        }
        PtFaceDistance { point: p, face, .. } | PtOnFace { point: p, face } => {
            point(*p)?;
            expect(sketch, name, *face, Entity::is_face, "face")?;
        }
        PtLineDistance { point: p, line: l, .. }
        | PtOnLine { point: p, line: l }
        | AtMidpoint { point: p, line: l } => {
            point(*p)?;
            line(*l)?;
        }
        PtOnCircle { point: p, circle } => {
            point(*p)?;
            round(*circle)?;
        }
        EqualLengthLines { a, b }
        | LengthRatio { a, b, .. }
        | LengthDifference { a, b, .. }
        | Angle { a, b, .. }
        | Parallel { a, b }
        | Perpendicular { a, b } => {
            line(*a)?;
            line(*b)?;
        }
        EqualLengthPointLineDistance {
            line: l,
            point: p,
            other_line,
        } => {
            line(*l)?;
            point(*p)?;
            line(*other_line)?;
        }
        EqualPointLineDistances {
            point_a,
            line_a,
            point_b,
            line_b,
        } => {
            point(*point_a)?;
            line(*line_a)?;
            point(*point_b)?;
            line(*line_b)?;
        }
        EqualLineArcLen { line: l, arc: a }
        | ArcLineLenRatio { arc: a, line: l, .. }
        | ArcLineDifference { arc: a, line: l, .. }
        | ArcLineTangent { arc: a, line: l, .. } => {
            line(*l)?;
            arc(*a)?;
        }
        ArcArcLenRatio { a, b, .. } | ArcArcDifference { a, b, .. } => {
            arc(*a)?;
            arc(*b)?;
        }
        EqualRadius { a, b } => {
            round(*a)?;
            round(*b)?;
        }
        Diameter { circle, .. } => round(*circle)?,
        Symmetric { a, b, plane: pl } => {
            point(*a)?;
            point(*b)?;
            plane(*pl)?;
        }
        SymmetricHoriz { a, b } | SymmetricVert { a, b } => {
            point(*a)?;
            point(*b)?;
        }
        SymmetricLine { a, b, line: l } => {
            point(*a)?;
            point(*b)?;
            line(*l)?;
        }
        Horizontal { line: l } | Vertical { line: l } => line(*l)?,
        SameOrientation { a, b } => {
            expect(sketch, name, *a, Entity::is_normal, "normal")?;
            expect(sketch, name, *b, Entity::is_normal, "normal")?;
        }
        EqualAngle { a, b, c, d, .. } => {
            for l in [a, b, c, d] {
                line(*l)?;
            }
        }
        CubicLineTangent { cubic, line: l, .. } => {
            expect(sketch, name, *cubic, Entity::is_cubic, "cubic")?;
            line(*l)?;
        }
        CurveCurveTangent { a, b, .. } => {
            expect(sketch, name, *a, is_smooth_curve, "arc or cubic")?;
            expect(sketch, name, *b, is_smooth_curve, "arc or cubic")?;
        }
        WhereDragged { point: p } => {
            point(*p)?;
            if sketch.entity(*p)?.own_params().is_empty() {
                return Err(ConstraintError::Invalid(format!(
                    "{} cannot be dragged",
                    p
                )));
            }
        }
        Comment { .. } => {}
    }

    // Degenerate geometry, measured in the constraint's workplane
    let probe = Constraint {
        id: ConstraintId(0),
        group,
        workplane,
        kind: kind.clone(),
        reference: true,
    };
    let compiler = Compiler::new(sketch, &probe)?;
    for l in direction_lines(kind) {
        let length = compiler.numeric(&compiler.line_length(l)?);
        if !(length > DEGENERATE_EPSILON) {
            return Err(ConstraintError::Degenerate(format!("line {} has zero length", l)));
        }
    }
    for a in radius_arcs(kind) {
        if !(sketch.radius_value(a)? > DEGENERATE_EPSILON) {
            return Err(ConstraintError::Degenerate(format!("arc {} has zero radius", a)));
        }
    }
    let tangents: Vec<(EntityId, ArcEnd)> = match kind {
        CubicLineTangent { cubic, end, .. } => vec![(*cubic, *end)],
        CurveCurveTangent { a, b, ends } => vec![(*a, ends.first()), (*b, ends.second())],
        _ => Vec::new(),
    };
    for (curve, end) in tangents {
        let t = compiler.project(&compiler.end_tangent(curve, end)?);
        let t = t.eval(&|p| sketch.value_of(p));
        if !(t.length() > DEGENERATE_EPSILON) {
            return Err(ConstraintError::Degenerate(format!(
                "{} has no direction at its {:?}",
                curve, end
            )));
        }
    }
    Ok(())
}

// ============== Measurement and initial guesses ==============

/// Set a dimension to what the geometry currently measures
///
/// Angles also pick whichever of the two supplementary readings is acute.
pub fn modify_to_satisfy(sketch: &mut Sketch, id: ConstraintId) -> ConstraintResult<()> {
    let mut constraint = sketch.constraint(id)?.clone();

    if let ConstraintKind::Angle { a, b, .. } = constraint.kind {
        let compiler = Compiler::new(sketch, &constraint)?;
        let cos = compiler.numeric(&direction_cosine(&compiler.line_dir(a)?, &compiler.line_dir(b)?));
        let theta = cos.clamp(-1.0, 1.0).acos().to_degrees();
        let (degrees, supplementary) = if theta > 90.0 {
            (180.0 - theta, true)
        } else {
            (theta, false)
        };
        constraint.kind = ConstraintKind::Angle {
            a,
            b,
            degrees,
            supplementary,
        };
    } else if constraint.kind.is_dimensional() {
        let mut probe = constraint.clone();
        probe.kind.set_value(0.0);
        let equations = generate_equations(sketch, &probe, true)?;
        let Some(first) = equations.first() else {
            return Ok(());
        };
        let measured = first.expr.eval(&|p| sketch.value_of(p));
        constraint.kind.set_value(measured);
    } else {
        return Ok(());
    }

    if let Some(slot) = sketch.constraints.get_mut(id) {
        *slot = constraint;
    }
    Ok(())
}

/// Seed a constraint's helper parameters from the current geometry
pub fn improve_initial_guess(sketch: &mut Sketch, id: ConstraintId) -> ConstraintResult<()> {
    let constraint = sketch.constraint(id)?.clone();
    let helpers = constraint.helper_params();
    let Some(&helper) = helpers.first() else {
        return Ok(());
    };

    let value = match constraint.kind {
        ConstraintKind::PtOnLine { point, line } => {
            let (a, b) = line_positions(sketch, line)?;
            let p = sketch.point_position(point)?;
            let d = b - a;
            let len2 = d.length_squared();
            if len2 > 0.0 { (p - a).dot(d) / len2 } else { 0.0 }
        }
        ConstraintKind::Parallel { a, b } => {
            let (a0, a1) = line_positions(sketch, a)?;
            let (b0, b1) = line_positions(sketch, b)?;
            let (da, db) = (a1 - a0, b1 - b0);
            let len2 = db.length_squared();
            if len2 > 0.0 { da.dot(db) / len2 } else { 1.0 }
        }
        ConstraintKind::SameOrientation { a, b } => {
            let na = sketch.normal_orientation(a)? * glam::DVec3::Z;
            let nb = sketch.normal_orientation(b)? * glam::DVec3::Z;
            na.dot(nb)
        }
        _ => return Ok(()),
    };
    sketch.set_param(helper, value)?;
    Ok(())
}

fn line_positions(sketch: &Sketch, line: EntityId) -> ConstraintResult<(glam::DVec3, glam::DVec3)> {
    match &sketch.entity(line)?.kind {
        EntityKind::LineSegment { points } => Ok((
            sketch.point_position(points[0])?,
            sketch.point_position(points[1])?,
        )),
        _ => Err(ConstraintError::WrongEntity {
            constraint: "Initial guess",
            entity: line,
            expected: "line segment",
        }),
    }
}

/// The tangency constraint between two curves that share an endpoint
pub fn tangent_between(sketch: &Sketch, a: EntityId, b: EntityId) -> ConstraintResult<ConstraintKind> {
    let ea = sketch.entity(a)?;
    let eb = sketch.entity(b)?;
    let (a0, a1) = ea.endpoints().ok_or(ConstraintError::NoSharedEndpoint)?;
    let (b0, b1) = eb.endpoints().ok_or(ConstraintError::NoSharedEndpoint)?;

    let same = |p: EntityId, q: EntityId| -> ConstraintResult<bool> {
        Ok(sketch
            .point_position(p)?
            .distance(sketch.point_position(q)?)
            < SHARED_ENDPOINT_EPSILON)
    };
    let mut shared = None;
    for (pa, end_a) in [(a0, ArcEnd::Start), (a1, ArcEnd::Finish)] {
        for (pb, end_b) in [(b0, ArcEnd::Start), (b1, ArcEnd::Finish)] {
            if shared.is_none() && same(pa, pb)? {
                shared = Some((end_a, end_b));
            }
        }
    }
    let (end_a, end_b) = shared.ok_or(ConstraintError::NoSharedEndpoint)?;

    match (ea.is_line(), eb.is_line()) {
        (true, true) => Err(ConstraintError::Invalid(
            "two lines cannot be tangent".into(),
        )),
        (false, true) if ea.is_arc() => Ok(ConstraintKind::ArcLineTangent {
            arc: a,
            line: b,
            end: end_a,
        }),
        (true, false) if eb.is_arc() => Ok(ConstraintKind::ArcLineTangent {
            arc: b,
            line: a,
            end: end_b,
        }),
        (false, true) => Ok(ConstraintKind::CubicLineTangent {
            cubic: a,
            line: b,
            end: end_a,
        }),
        (true, false) => Ok(ConstraintKind::CubicLineTangent {
            cubic: b,
            line: a,
            end: end_b,
        }),
        (false, false) => Ok(ConstraintKind::CurveCurveTangent {
            a,
            b,
            ends: TangentEnds::from_ends(end_a, end_b),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupKind;
    use approx::assert_relative_eq;
    use glam::DVec3;

    struct Fixture {
        sketch: Sketch,
        g: GroupId,
        wp: EntityId,
    }

    impl Fixture {
        fn new() -> Self {
            let mut sketch = Sketch::new();
            let g = sketch
                .add_group("sketch", GroupKind::workplane_xy(), None)
                .unwrap();
            let wp = sketch.group(g).unwrap().workplane.unwrap();
            Self { sketch, g, wp }
        }

        fn line(&mut self, a: (f64, f64), b: (f64, f64)) -> EntityId {
            let r = self
                .sketch
                .add_line(
                    self.g,
                    Some(self.wp),
                    DVec3::new(a.0, a.1, 0.0),
                    DVec3::new(b.0, b.1, 0.0),
                )
                .unwrap();
            self.sketch.request(r).unwrap().entity()
        }

        fn residuals(&self, id: ConstraintId) -> Vec<f64> {
            let c = self.sketch.constraint(id).unwrap();
            generate_equations(&self.sketch, c, true)
                .unwrap()
                .iter()
                .map(|e| e.expr.eval(&|p| self.sketch.value_of(p)))
                .collect()
        }
    }

    #[test]
    fn test_coincident_in_workplane_has_two_equations() {
        let mut f = Fixture::new();
        let l1 = f.line((0.0, 0.0), (1.0, 0.0));
        let l2 = f.line((1.0, 0.0), (1.0, 1.0));
        let a = f.sketch.entity(l1).unwrap().endpoints().unwrap().1;
        let b = f.sketch.entity(l2).unwrap().endpoints().unwrap().0;
        let c = f
            .sketch
            .add_constraint(f.g, Some(f.wp), ConstraintKind::coincident(a, b))
            .unwrap();
        let residuals = f.residuals(c);
        assert_eq!(residuals.len(), 2);
        assert!(residuals.iter().all(|r| r.abs() < 1e-12));
    }

    #[test]
    fn test_distance_and_perpendicular_residuals() {
        let mut f = Fixture::new();
        let l1 = f.line((0.0, 0.0), (3.0, 4.0));
        let l2 = f.line((0.0, 0.0), (-4.0, 3.0));
        let (a, b) = f.sketch.entity(l1).unwrap().endpoints().unwrap();
        let d = f
            .sketch
            .add_constraint(f.g, Some(f.wp), ConstraintKind::distance(a, b, 4.0))
            .unwrap();
        assert_relative_eq!(f.residuals(d)[0], 1.0, epsilon = 1e-12);

        let p = f
            .sketch
            .add_constraint(f.g, Some(f.wp), ConstraintKind::perpendicular(l1, l2))
            .unwrap();
        assert_relative_eq!(f.residuals(p)[0], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_reference_produces_no_equations() {
        let mut f = Fixture::new();
        let l1 = f.line((0.0, 0.0), (2.0, 0.0));
        let (a, b) = f.sketch.entity(l1).unwrap().endpoints().unwrap();
        let c = f
            .sketch
            .add_reference(f.g, Some(f.wp), ConstraintKind::distance(a, b, 0.0))
            .unwrap();
        let constraint = f.sketch.constraint(c).unwrap();
        assert!(generate_equations(&f.sketch, constraint, false).unwrap().is_empty());
        assert_relative_eq!(constraint.kind.value().unwrap(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_horizontal_requires_workplane() {
        let mut f = Fixture::new();
        let l = f.line((0.0, 0.0), (2.0, 1.0));
        let err = f.sketch.add_constraint(f.g, None, ConstraintKind::horizontal(l));
        assert!(matches!(err, Err(ConstraintError::WorkplaneRequired(_))));
    }

    #[test]
    fn test_zero_length_line_is_degenerate() {
        let mut f = Fixture::new();
        let l1 = f.line((1.0, 1.0), (1.0, 1.0));
        let l2 = f.line((0.0, 0.0), (1.0, 0.0));
        let err = f
            .sketch
            .add_constraint(f.g, Some(f.wp), ConstraintKind::parallel(l1, l2));
        assert!(matches!(err, Err(ConstraintError::Degenerate(_))));
    }

    #[test]
    fn test_measured_angle_picks_supplement() {
        let mut f = Fixture::new();
        let l1 = f.line((0.0, 0.0), (1.0, 0.0));
        let l2 = f.line((0.0, 0.0), (-1.0, 1.0));
        let c = f
            .sketch
            .add_reference(f.g, Some(f.wp), ConstraintKind::angle(l1, l2, 0.0))
            .unwrap();
        match f.sketch.constraint(c).unwrap().kind {
            ConstraintKind::Angle {
                degrees,
                supplementary,
                ..
            } => {
                assert_relative_eq!(degrees, 45.0, epsilon = 1e-9);
                assert!(supplementary);
            }
            _ => unreachable!(),
        }
        assert_relative_eq!(f.residuals(c)[0], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_point_on_line_in_3d_seeds_helper() {
        let mut sketch = Sketch::new();
        let g = sketch.add_group("3d", GroupKind::Drawing3d, None).unwrap();
        let r = sketch
            .add_line(g, None, DVec3::ZERO, DVec3::new(10.0, 0.0, 0.0))
            .unwrap();
        let line = sketch.request(r).unwrap().entity();
        let p = sketch.add_point(g, None, DVec3::new(4.0, 0.0, 0.0)).unwrap();
        let point = sketch.request(p).unwrap().point(0);
        let c = sketch
            .add_constraint(g, None, ConstraintKind::point_on_line(point, line))
            .unwrap();
        let t = sketch.value_of(ParamId::constraint(c, 0));
        assert_relative_eq!(t, 0.4, epsilon = 1e-12);

        let constraint = sketch.constraint(c).unwrap();
        let eqs = generate_equations(&sketch, constraint, false).unwrap();
        assert_eq!(eqs.len(), 3);
        for e in eqs {
            assert_relative_eq!(e.expr.eval(&|p| sketch.value_of(p)), 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_tangent_between_picks_shared_ends() {
        let mut f = Fixture::new();
        let line = f.line((0.0, 0.0), (5.0, 0.0));
        let r = f
            .sketch
            .add_arc(
                f.g,
                f.wp,
                DVec3::new(5.0, 2.0, 0.0),
                DVec3::new(5.0, 0.0, 0.0),
                DVec3::new(7.0, 2.0, 0.0),
            )
            .unwrap();
        let arc = f.sketch.request(r).unwrap().entity();
        let kind = tangent_between(&f.sketch, line, arc).unwrap();
        assert_eq!(
            kind,
            ConstraintKind::ArcLineTangent {
                arc,
                line,
                end: ArcEnd::Start
            }
        );
        let c = f.sketch.add_constraint(f.g, Some(f.wp), kind).unwrap();
        assert_relative_eq!(f.residuals(c)[0], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_arc_length() {
        let mut f = Fixture::new();
        let r = f
            .sketch
            .add_arc(
                f.g,
                f.wp,
                DVec3::ZERO,
                DVec3::new(2.0, 0.0, 0.0),
                DVec3::new(0.0, -2.0, 0.0),
            )
            .unwrap();
        let arc = f.sketch.request(r).unwrap().entity();
        let line = f.line((0.0, 0.0), (1.0, 0.0));
        let c = f
            .sketch
            .add_reference(
                f.g,
                Some(f.wp),
                ConstraintKind::ArcLineDifference {
                    arc,
                    line,
                    difference: 0.0,
                },
            )
            .unwrap();
        // Three quarters of a circle of radius 2, minus 1
        let expected = 1.5 * PI * 2.0 - 1.0;
        assert_relative_eq!(
            f.sketch.constraint(c).unwrap().kind.value().unwrap(),
            expected,
            epsilon = 1e-9
        );
    }
}
