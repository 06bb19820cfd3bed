//! Constraint Solver
//!
//! Newton iteration over the parameters of one group. Each step takes the
//! minimum-norm correction `dx = J^T (J J^T)^-1 f`; the inner linear solve
//! is banded with a dense fallback. Rank tests on the Jacobian give the
//! degrees of freedom and find redundant constraints.

pub mod banded;

pub use banded::{BandedError, BandedMatrix, PIVOT_EPSILON, dense_solve, solve_linear};

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::expr::Expr;
use crate::handle::{ConstraintId, GroupId, ParamId};
use crate::sketch::{Equation, Sketch, SketchResult, generate_equations};

/// Outcome of solving a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SolveStatus {
    /// Not solved yet
    #[default]
    Unsolved,
    /// All equations satisfied, no degrees of freedom left
    Converged,
    /// All equations satisfied, some degrees of freedom left
    Underconstrained,
    /// Satisfied, but some constraints are redundant
    Overconstrained,
    /// Redundant constraints that cannot all be satisfied
    Inconsistent,
    /// Newton iteration did not reach the tolerance
    NotConverged,
    /// Wall-clock limit reached
    TimedOut,
    /// More unknowns than the solver accepts
    TooManyUnknowns,
    /// The group asked not to be solved
    Skipped,
}

impl SolveStatus {
    /// Whether the group's geometry can be used downstream
    pub fn is_acceptable(&self) -> bool {
        matches!(
            self,
            SolveStatus::Converged | SolveStatus::Underconstrained | SolveStatus::Skipped
        )
    }
}

/// Result of solving a group
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SolveOutcome {
    pub status: SolveStatus,
    /// Unknowns minus the rank of the Jacobian
    pub dof: usize,
    /// Constraints that can be removed without losing rank, or the ones
    /// left unsatisfied when the iteration failed
    pub redundant: Vec<ConstraintId>,
    pub iterations: usize,
}

impl SolveOutcome {
    fn with_status(status: SolveStatus) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }
}

/// Solver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Every residual must fall below this
    pub convergence_tolerance: f64,
    pub max_iterations: usize,
    /// Fraction of the Newton step taken (0.1 to 1)
    pub damping: f64,
    /// Relative size below which a Jacobian row counts as dependent
    pub rank_tolerance: f64,
    /// Added to the diagonal of `J J^T`
    pub regularization: f64,
    pub max_unknowns: usize,
    /// Wall-clock limit per group solve
    pub timeout_ms: Option<u64>,
    pub band_left: usize,
    pub band_right: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            convergence_tolerance: 1e-10,
            max_iterations: 50,
            damping: 1.0,
            rank_tolerance: 1e-8,
            regularization: 1e-10,
            max_unknowns: 2048,
            timeout_ms: None,
            band_left: 8,
            band_right: 8,
        }
    }
}

impl SolverConfig {
    /// Set the convergence tolerance
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.convergence_tolerance = tolerance;
        self
    }

    /// Set the maximum iterations
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the damping factor (0-1)
    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping.clamp(0.1, 1.0);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_band(mut self, left: usize, right: usize) -> Self {
        self.band_left = left;
        self.band_right = right;
        self
    }

    pub fn with_max_unknowns(mut self, max_unknowns: usize) -> Self {
        self.max_unknowns = max_unknowns;
        self
    }
}

/// The equations and unknowns of one group
pub struct System {
    unknowns: Vec<ParamId>,
    index: HashMap<ParamId, usize>,
    equations: Vec<Equation>,
    /// Sparse symbolic Jacobian, one row per equation
    jacobian: Vec<Vec<(usize, Expr)>>,
}

impl System {
    /// Collect a group's unknowns and equations
    ///
    /// Parameters of other groups are substituted as constants. A
    /// constraint that no longer compiles is left out of the system.
    pub fn build(sketch: &Sketch, group: GroupId, all_dims_reference: bool) -> SketchResult<Self> {
        let unknowns: Vec<ParamId> = sketch
            .params()
            .filter(|p| p.group == group)
            .map(|p| p.id)
            .collect();
        let index: HashMap<ParamId, usize> =
            unknowns.iter().enumerate().map(|(i, p)| (*p, i)).collect();

        let mut raw = Vec::new();
        for constraint in sketch.constraints().filter(|c| c.group == group) {
            if all_dims_reference && constraint.kind.is_dimensional() {
                continue;
            }
            match generate_equations(sketch, constraint, false) {
                Ok(eqs) => raw.extend(eqs),
                Err(e) => tracing::warn!(
                    "Leaving {} ({}) out of the solve: {}",
                    constraint.id,
                    constraint.type_name(),
                    e
                ),
            }
        }
        raw.extend(sketch.entity_equations(group)?);
        raw.extend(sketch.group_equations(group)?);

        let known = |p: ParamId| {
            if index.contains_key(&p) {
                None
            } else {
                Some(sketch.value_of(p))
            }
        };
        let equations: Vec<Equation> = raw
            .into_iter()
            .map(|eq| Equation::new(eq.id, eq.expr.substitute(&known)))
            .collect();

        let jacobian = equations
            .iter()
            .map(|eq| {
                eq.expr
                    .params()
                    .into_iter()
                    .filter_map(|p| index.get(&p).map(|&col| (col, eq.expr.partial(p))))
                    .collect()
            })
            .collect();

        Ok(Self {
            unknowns,
            index,
            equations,
            jacobian,
        })
    }

    pub fn unknown_count(&self) -> usize {
        self.unknowns.len()
    }

    pub fn equation_count(&self) -> usize {
        self.equations.len()
    }

    fn lookup<'x>(&'x self, x: &'x [f64]) -> impl Fn(ParamId) -> f64 + 'x {
        move |p| self.index.get(&p).map(|&i| x[i]).unwrap_or(f64::NAN)
    }

    pub fn residuals(&self, x: &[f64]) -> Vec<f64> {
        let lookup = self.lookup(x);
        self.equations.iter().map(|eq| eq.expr.eval(&lookup)).collect()
    }

    /// Numeric Jacobian rows in sparse form
    fn jacobian_at(&self, x: &[f64]) -> Vec<Vec<(usize, f64)>> {
        let lookup = self.lookup(x);
        self.jacobian
            .iter()
            .map(|row| row.iter().map(|(col, d)| (*col, d.eval(&lookup))).collect())
            .collect()
    }

    fn dense_rows(&self, sparse: &[Vec<(usize, f64)>]) -> Vec<Vec<f64>> {
        sparse
            .iter()
            .map(|row| {
                let mut dense = vec![0.0; self.unknowns.len()];
                for (col, v) in row {
                    dense[*col] += v;
                }
                dense
            })
            .collect()
    }

    /// One minimum-norm Newton correction
    fn newton_step(&self, x: &[f64], f: &[f64], config: &SolverConfig) -> Option<Vec<f64>> {
        let j = self.jacobian_at(x);
        let m = f.len();
        let dense = self.dense_rows(&j);

        let mut a = vec![vec![0.0; m]; m];
        for r in 0..m {
            for (c, row_c) in dense.iter().enumerate().skip(r) {
                let v: f64 = j[r].iter().map(|(col, d)| d * row_c[*col]).sum();
                a[r][c] = v;
                a[c][r] = v;
            }
            a[r][r] += config.regularization;
        }

        let z = solve_linear(a, f.to_vec(), config.band_left, config.band_right)?;
        let mut dx = vec![0.0; self.unknowns.len()];
        for (row, zr) in j.iter().zip(&z) {
            for (col, d) in row {
                dx[*col] += d * zr;
            }
        }
        Some(dx)
    }

    /// Rank of a set of Jacobian rows
    fn rank(rows: &[&Vec<f64>], tolerance: f64) -> usize {
        let mut basis: Vec<Vec<f64>> = Vec::new();
        for row in rows {
            let scale = norm(row);
            if scale == 0.0 || !scale.is_finite() {
                continue;
            }
            let mut v = (*row).clone();
            // Two passes keep the projection accurate
            for _ in 0..2 {
                for b in &basis {
                    let d = dot(&v, b);
                    for (vi, bi) in v.iter_mut().zip(b) {
                        *vi -= d * bi;
                    }
                }
            }
            let remaining = norm(&v);
            if remaining > tolerance * scale && remaining > 1e-14 {
                basis.push(v.iter().map(|vi| vi / remaining).collect());
            }
        }
        basis.len()
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

/// Solve one group and record the outcome on it
pub fn solve_group(sketch: &mut Sketch, group: GroupId, config: &SolverConfig) -> SolveOutcome {
    let Ok(g) = sketch.group(group) else {
        tracing::warn!("Cannot solve missing group {}", group);
        return SolveOutcome::default();
    };
    let (relax, allow_redundant, all_dims_reference) =
        (g.relax_constraints, g.allow_redundant, g.all_dims_reference);

    let outcome = if relax {
        SolveOutcome::with_status(SolveStatus::Skipped)
    } else {
        sketch.prune_dangling_constraints(group);
        match System::build(sketch, group, all_dims_reference) {
            Ok(system) => run(sketch, &system, allow_redundant, config),
            Err(e) => {
                tracing::warn!("Cannot build equations of {}: {}", group, e);
                SolveOutcome::with_status(SolveStatus::NotConverged)
            }
        }
    };

    match outcome.status {
        SolveStatus::Converged | SolveStatus::Underconstrained | SolveStatus::Skipped => {
            tracing::debug!(
                "Solved {}: {:?}, {} dof in {} iterations",
                group,
                outcome.status,
                outcome.dof,
                outcome.iterations
            );
        }
        status => tracing::warn!(
            "Solving {} failed: {:?} ({} constraints flagged)",
            group,
            status,
            outcome.redundant.len()
        ),
    }

    if let Ok(g) = sketch.group_mut(group) {
        g.solved = outcome.clone();
    }
    outcome
}

fn run(sketch: &mut Sketch, system: &System, allow_redundant: bool, config: &SolverConfig) -> SolveOutcome {
    let n = system.unknown_count();
    let m = system.equation_count();
    if n > config.max_unknowns {
        return SolveOutcome {
            dof: n,
            ..SolveOutcome::with_status(SolveStatus::TooManyUnknowns)
        };
    }

    let start = Instant::now();
    let deadline = config
        .timeout_ms
        .map(|ms| start + Duration::from_millis(ms));
    let timed_out = || deadline.is_some_and(|d| Instant::now() > d);

    let mut x: Vec<f64> = system.unknowns.iter().map(|p| sketch.value_of(*p)).collect();
    let mut last_good = x.clone();
    let mut converged = false;
    let mut timeout = false;
    let mut iterations = 0;

    loop {
        let f = system.residuals(&x);
        if f.iter().any(|v| !v.is_finite()) {
            tracing::debug!("Residuals became non-finite after {} iterations", iterations);
            x = last_good.clone();
            break;
        }
        last_good = x.clone();
        if f.iter().all(|v| v.abs() < config.convergence_tolerance) {
            converged = true;
            break;
        }
        if iterations >= config.max_iterations {
            break;
        }
        if timed_out() {
            timeout = true;
            break;
        }
        let Some(dx) = system.newton_step(&x, &f, config) else {
            tracing::debug!("Newton step singular after {} iterations", iterations);
            break;
        };
        for (xi, di) in x.iter_mut().zip(&dx) {
            *xi -= config.damping * di;
        }
        iterations += 1;
    }

    for (p, v) in system.unknowns.iter().zip(&x) {
        if let Err(e) = sketch.set_param(*p, *v) {
            tracing::warn!("Could not store solved value of {}: {}", p, e);
        }
    }

    let rows = system.dense_rows(&system.jacobian_at(&x));
    let all: Vec<&Vec<f64>> = rows.iter().collect();
    let rank = System::rank(&all, config.rank_tolerance);
    let dof = n - rank.min(n);

    let mut outcome = SolveOutcome {
        status: SolveStatus::Unsolved,
        dof,
        redundant: Vec::new(),
        iterations,
    };

    if timeout {
        outcome.status = SolveStatus::TimedOut;
        return outcome;
    }

    let deficient = rank < m;
    if deficient && !(converged && allow_redundant) {
        outcome.redundant = find_redundant(system, &rows, rank, config, &timed_out);
    }

    outcome.status = match (converged, deficient) {
        (true, true) if !allow_redundant => SolveStatus::Overconstrained,
        (true, _) if dof > 0 => SolveStatus::Underconstrained,
        (true, _) => SolveStatus::Converged,
        (false, true) => SolveStatus::Inconsistent,
        (false, false) => {
            let f = system.residuals(&x);
            outcome.redundant = unsatisfied(system, &f, config.convergence_tolerance);
            SolveStatus::NotConverged
        }
    };
    outcome
}

/// Rows of the Jacobian grouped by the constraint that produced them
fn rows_by_constraint(system: &System) -> Vec<(ConstraintId, Vec<usize>)> {
    let mut out: Vec<(ConstraintId, Vec<usize>)> = Vec::new();
    for (row, eq) in system.equations.iter().enumerate() {
        let Some(c) = eq.id.constraint_id() else {
            continue;
        };
        match out.last_mut() {
            Some((last, rows)) if *last == c => rows.push(row),
            _ => out.push((c, vec![row])),
        }
    }
    out
}

/// Constraints whose removal keeps the rank unchanged
fn find_redundant(
    system: &System,
    rows: &[Vec<f64>],
    rank: usize,
    config: &SolverConfig,
    timed_out: &impl Fn() -> bool,
) -> Vec<ConstraintId> {
    let mut redundant = Vec::new();
    for (constraint, own) in rows_by_constraint(system) {
        if timed_out() {
            tracing::warn!("Redundancy search stopped by timeout");
            break;
        }
        let rest: Vec<&Vec<f64>> = rows
            .iter()
            .enumerate()
            .filter(|(i, _)| !own.contains(i))
            .map(|(_, r)| r)
            .collect();
        if System::rank(&rest, config.rank_tolerance) == rank {
            redundant.push(constraint);
        }
    }
    redundant
}

/// Constraints with a residual above the tolerance
fn unsatisfied(system: &System, f: &[f64], tolerance: f64) -> Vec<ConstraintId> {
    rows_by_constraint(system)
        .into_iter()
        .filter(|(_, rows)| rows.iter().any(|&r| !(f[r].abs() < tolerance)))
        .map(|(c, _)| c)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupKind;
    use crate::handle::EntityId;
    use crate::sketch::ConstraintKind;
    use approx::assert_relative_eq;
    use glam::DVec3;

    fn drawing(sketch: &mut Sketch, op_a: Option<GroupId>) -> (GroupId, EntityId) {
        let g = sketch
            .add_group("sketch", GroupKind::workplane_xy(), op_a)
            .unwrap();
        let wp = sketch.group(g).unwrap().workplane.unwrap();
        (g, wp)
    }

    fn v(x: f64, y: f64) -> DVec3 {
        DVec3::new(x, y, 0.0)
    }

    #[test]
    fn test_horizontal_line() {
        let mut sketch = Sketch::new();
        let (g, wp) = drawing(&mut sketch, None);
        let r = sketch.add_line(g, Some(wp), v(0.0, 0.0), v(10.0, 5.0)).unwrap();
        let line = sketch.request(r).unwrap().entity();
        sketch
            .add_constraint(g, Some(wp), ConstraintKind::horizontal(line))
            .unwrap();

        let outcome = solve_group(&mut sketch, g, &SolverConfig::default());
        assert_eq!(outcome.status, SolveStatus::Underconstrained);
        assert_eq!(outcome.dof, 3);

        let request = sketch.request(r).unwrap().clone();
        let a = sketch.point_position(request.point(0)).unwrap();
        let b = sketch.point_position(request.point(1)).unwrap();
        assert_relative_eq!(a.y, b.y, epsilon = 1e-9);
    }

    #[test]
    fn test_fully_constrained_sketch_has_zero_dof() {
        let mut sketch = Sketch::new();
        let (g, wp) = drawing(&mut sketch, None);
        let r1 = sketch.add_line(g, Some(wp), v(0.5, 0.2), v(9.0, 1.0)).unwrap();
        let r2 = sketch.add_line(g, Some(wp), v(9.0, 1.0), v(8.0, 6.0)).unwrap();
        let l1 = sketch.request(r1).unwrap().clone();
        let l2 = sketch.request(r2).unwrap().clone();
        let origin = EntityId::predefined(g, 1);

        let add = |sketch: &mut Sketch, kind| sketch.add_constraint(g, Some(wp), kind).unwrap();
        add(&mut sketch, ConstraintKind::coincident(l1.point(0), origin));
        add(&mut sketch, ConstraintKind::coincident(l1.point(1), l2.point(0)));
        add(&mut sketch, ConstraintKind::horizontal(l1.entity()));
        add(&mut sketch, ConstraintKind::perpendicular(l1.entity(), l2.entity()));
        add(&mut sketch, ConstraintKind::distance(l1.point(0), l1.point(1), 10.0));
        add(&mut sketch, ConstraintKind::distance(l2.point(0), l2.point(1), 5.0));

        let outcome = solve_group(&mut sketch, g, &SolverConfig::default());
        assert_eq!(outcome.status, SolveStatus::Converged);
        assert_eq!(outcome.dof, 0);
        assert!(outcome.redundant.is_empty());

        let corner = sketch.point_position(l1.point(1)).unwrap();
        assert_relative_eq!(corner.x, 10.0, epsilon = 1e-8);
        assert_relative_eq!(corner.y, 0.0, epsilon = 1e-8);
        let top = sketch.point_position(l2.point(1)).unwrap();
        assert_relative_eq!(top.x, 10.0, epsilon = 1e-8);
        assert_relative_eq!(top.y, 5.0, epsilon = 1e-8);
        assert!(sketch.group(g).unwrap().solved.status.is_acceptable());
    }

    struct Redundant {
        sketch: Sketch,
        g2: GroupId,
        distances: Vec<ConstraintId>,
        point: EntityId,
    }

    /// A point on a fixed line with three consistent distances to points
    /// on that line
    fn redundant_fixture() -> Redundant {
        let mut sketch = Sketch::new();
        let (g1, wp) = drawing(&mut sketch, None);
        let line = sketch.add_line(g1, Some(wp), v(0.0, 0.0), v(20.0, 0.0)).unwrap();
        let mid = sketch.add_point(g1, Some(wp), v(10.0, 0.0)).unwrap();
        let line = sketch.request(line).unwrap().clone();
        let b = sketch.request(mid).unwrap().point(0);
        let (a, c) = (line.point(0), line.point(1));

        let g2 = sketch
            .add_group("second", GroupKind::Drawing3d, Some(g1))
            .unwrap();
        let p = sketch.add_point(g2, Some(wp), v(3.0, 1.0)).unwrap();
        let point = sketch.request(p).unwrap().point(0);
        sketch
            .add_constraint(g2, Some(wp), ConstraintKind::point_on_line(point, line.entity()))
            .unwrap();
        let distances = [(a, 4.0), (b, 6.0), (c, 16.0)]
            .into_iter()
            .map(|(q, d)| {
                sketch
                    .add_constraint(g2, Some(wp), ConstraintKind::distance(point, q, d))
                    .unwrap()
            })
            .collect();
        Redundant {
            sketch,
            g2,
            distances,
            point,
        }
    }

    #[test]
    fn test_redundant_distances_are_reported() {
        let mut f = redundant_fixture();
        let outcome = solve_group(&mut f.sketch, f.g2, &SolverConfig::default());
        assert_eq!(outcome.status, SolveStatus::Overconstrained);
        assert_eq!(outcome.redundant, f.distances);

        let p = f.sketch.point_position(f.point).unwrap();
        assert_relative_eq!(p.x, 4.0, epsilon = 1e-8);
        assert_relative_eq!(p.y, 0.0, epsilon = 1e-8);
    }

    #[test]
    fn test_removing_a_redundant_constraint_still_solves() {
        for i in 0..3 {
            let mut f = redundant_fixture();
            f.sketch.delete_constraint(f.distances[i]).unwrap();
            let outcome = solve_group(&mut f.sketch, f.g2, &SolverConfig::default());
            assert!(
                matches!(
                    outcome.status,
                    SolveStatus::Converged | SolveStatus::Overconstrained
                ),
                "status {:?}",
                outcome.status
            );
            let p = f.sketch.point_position(f.point).unwrap();
            assert_relative_eq!(p.x, 4.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_dropping_the_reported_redundancy_converges() {
        let mut f = redundant_fixture();
        f.sketch.delete_constraint(f.distances[1]).unwrap();

        let outcome = solve_group(&mut f.sketch, f.g2, &SolverConfig::default());
        assert_eq!(outcome.status, SolveStatus::Overconstrained);
        assert_eq!(outcome.redundant, vec![f.distances[0], f.distances[2]]);

        f.sketch.delete_constraint(outcome.redundant[1]).unwrap();
        let outcome = solve_group(&mut f.sketch, f.g2, &SolverConfig::default());
        assert_eq!(outcome.status, SolveStatus::Converged);
        assert_eq!(outcome.dof, 0);
        assert!(outcome.redundant.is_empty());

        let p = f.sketch.point_position(f.point).unwrap();
        assert_relative_eq!(p.x, 4.0, epsilon = 1e-8);
        assert_relative_eq!(p.y, 0.0, epsilon = 1e-8);
    }

    #[test]
    fn test_inconsistent_distances() {
        let mut f = redundant_fixture();
        f.sketch.set_constraint_value(f.distances[2], 30.0).unwrap();
        let outcome = solve_group(&mut f.sketch, f.g2, &SolverConfig::default());
        assert_eq!(outcome.status, SolveStatus::Inconsistent);
        assert!(!outcome.redundant.is_empty());
        assert!(f.sketch.point_position(f.point).unwrap().is_finite());
    }

    #[test]
    fn test_relaxed_group_is_skipped() {
        let mut sketch = Sketch::new();
        let (g, _) = drawing(&mut sketch, None);
        sketch.group_mut(g).unwrap().relax_constraints = true;
        let outcome = solve_group(&mut sketch, g, &SolverConfig::default());
        assert_eq!(outcome.status, SolveStatus::Skipped);
    }

    #[test]
    fn test_too_many_unknowns() {
        let mut sketch = Sketch::new();
        let (g, wp) = drawing(&mut sketch, None);
        sketch.add_line(g, Some(wp), v(0.0, 0.0), v(1.0, 1.0)).unwrap();
        let config = SolverConfig::default().with_max_unknowns(2);
        let outcome = solve_group(&mut sketch, g, &config);
        assert_eq!(outcome.status, SolveStatus::TooManyUnknowns);
    }

    #[test]
    fn test_config_builder() {
        let config = SolverConfig::default()
            .with_tolerance(1e-6)
            .with_damping(5.0)
            .with_band(3, 4);
        assert_eq!(config.convergence_tolerance, 1e-6);
        assert_eq!(config.damping, 1.0);
        assert_eq!((config.band_left, config.band_right), (3, 4));
    }
}
