//! Regeneration
//!
//! Walks the groups in dependency order and rebuilds the ones that are
//! dirty or whose inputs changed: parameters and entities, the solve, the
//! loops of workplane sketches and the shells of solid groups. Failures
//! are recorded on the group and the pass moves on, the way a feature
//! history rebuild keeps going past a failed feature.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::f64::consts::TAU;

use glam::{DQuat, DVec3};
use serde::Serialize;
use thiserror::Error;

use crate::config::EngineConfig;
use crate::group::{Group, GroupFailure, GroupKind, Sides, assemble_loops};
use crate::handle::{EntityId, GroupId, ParamId};
use crate::kernel::{BooleanType, CadError, CadResult, Shell, SolidKernel};
use crate::sketch::{Sketch, SketchError};
use crate::solver::{SolveOutcome, solve_group};

/// Error type for a regeneration pass
#[derive(Debug, Error)]
pub enum RegenError {
    #[error("Sketch error: {0}")]
    Sketch(#[from] SketchError),

    #[error("Groups depend on each other in a cycle through {0}")]
    Cycle(GroupId),

    #[error("Group not found: {0}")]
    GroupNotFound(GroupId),
}

/// Result type for regeneration
pub type RegenResult<T> = Result<T, RegenError>;

/// What happened to one group during a pass
#[derive(Debug, Clone, Serialize)]
pub struct GroupReport {
    pub group: GroupId,
    /// False when the group was clean and its inputs unchanged
    pub regenerated: bool,
    pub outcome: SolveOutcome,
    #[serde(skip)]
    pub failures: Vec<GroupFailure>,
}

/// Per-group results of a pass, in regeneration order
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegenReport {
    pub groups: Vec<GroupReport>,
}

impl RegenReport {
    pub fn get(&self, group: GroupId) -> Option<&GroupReport> {
        self.groups.iter().find(|r| r.group == group)
    }

    /// Groups rebuilt by the pass
    pub fn regenerated(&self) -> Vec<GroupId> {
        self.groups
            .iter()
            .filter(|r| r.regenerated)
            .map(|r| r.group)
            .collect()
    }

    /// Every failure with the group it was recorded on
    pub fn failures(&self) -> impl Iterator<Item = (GroupId, &GroupFailure)> {
        self.groups
            .iter()
            .flat_map(|r| r.failures.iter().map(move |f| (r.group, f)))
    }

    /// True when no group failed
    pub fn is_ok(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Groups whose output `group` reads
fn upstream(sketch: &Sketch, group: &Group) -> BTreeSet<GroupId> {
    let mut deps: BTreeSet<GroupId> = group.predecessors().into_iter().collect();
    let entity_group = |id: EntityId| sketch.entity(id).ok().map(|e| e.group);
    deps.extend(group.workplane.and_then(entity_group));
    for c in sketch.constraints().filter(|c| c.group == group.id) {
        deps.extend(c.kind.referenced_entities().into_iter().filter_map(entity_group));
        deps.extend(c.workplane.and_then(entity_group));
    }
    for r in sketch.requests().filter(|r| r.group == group.id) {
        deps.extend(r.workplane.and_then(entity_group));
    }
    deps.remove(&group.id);
    deps
}

/// Dependency order, lowest id first among ready groups
fn topological_order(sketch: &Sketch) -> RegenResult<Vec<GroupId>> {
    let mut deps: HashMap<GroupId, BTreeSet<GroupId>> = HashMap::new();
    for group in sketch.groups() {
        for pred in group.predecessors() {
            if sketch.group(pred).is_err() {
                return Err(RegenError::GroupNotFound(pred));
            }
        }
        deps.insert(group.id, upstream(sketch, group));
    }

    let mut order = Vec::with_capacity(deps.len());
    let mut done: HashSet<GroupId> = HashSet::new();
    let mut pending: BTreeSet<GroupId> = deps.keys().copied().collect();
    while !pending.is_empty() {
        let ready = pending
            .iter()
            .copied()
            .find(|g| deps[g].iter().all(|d| done.contains(d)));
        let Some(next) = ready else {
            let stuck = pending.iter().next().copied().unwrap_or(GroupId(0));
            return Err(RegenError::Cycle(stuck));
        };
        pending.remove(&next);
        done.insert(next);
        order.push(next);
    }
    Ok(order)
}

/// Drives regeneration against one solid kernel
pub struct Regenerator {
    kernel: Box<dyn SolidKernel>,
    config: EngineConfig,
}

impl Default for Regenerator {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Regenerator {
    /// Create a regenerator with the kernel the config names
    pub fn new(config: EngineConfig) -> Self {
        Self {
            kernel: config.kernel.build(),
            config,
        }
    }

    pub fn with_kernel(mut self, kernel: Box<dyn SolidKernel>) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn kernel(&self) -> &dyn SolidKernel {
        self.kernel.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Regenerate every group
    pub fn regenerate_all(&self, sketch: &mut Sketch) -> RegenResult<RegenReport> {
        let ids: Vec<GroupId> = sketch.groups().map(|g| g.id).collect();
        for id in ids {
            sketch.mark_dirty(id);
        }
        self.pass(sketch)
    }

    /// Regenerate `group` and everything its change reaches
    pub fn regenerate_from(&self, sketch: &mut Sketch, group: GroupId) -> RegenResult<RegenReport> {
        if sketch.group(group).is_err() {
            return Err(RegenError::GroupNotFound(group));
        }
        sketch.mark_dirty(group);
        self.pass(sketch)
    }

    fn pass(&self, sketch: &mut Sketch) -> RegenResult<RegenReport> {
        let order = topological_order(sketch)?;
        let mut report = RegenReport::default();
        let mut changed: HashSet<GroupId> = HashSet::new();
        // Running shell of the last solid group and who made it
        let mut previous: Option<(GroupId, Option<Shell>)> = None;

        for gid in order {
            let group = sketch.group(gid)?;
            let solid = group.kind.is_solid();
            let previous_changed = solid && previous.as_ref().is_some_and(|(g, _)| changed.contains(g));
            let needed = !group.clean
                || previous_changed
                || upstream(sketch, group).iter().any(|d| changed.contains(d));

            if needed {
                let before = group.fingerprint;
                let prior = previous.as_ref().and_then(|(_, s)| s.clone());
                self.regenerate_group(sketch, gid, prior)?;
                let group = sketch.group(gid)?;
                if solid || before != group.fingerprint {
                    changed.insert(gid);
                }
            }

            let group = sketch.group(gid)?;
            if solid {
                previous = Some((gid, group.running_shell.clone()));
            }
            report.groups.push(GroupReport {
                group: gid,
                regenerated: needed,
                outcome: group.solved.clone(),
                failures: group.failures.clone(),
            });
        }

        tracing::info!(
            "Regenerated {} of {} groups",
            report.regenerated().len(),
            report.groups.len()
        );
        Ok(report)
    }

    fn regenerate_group(&self, sketch: &mut Sketch, gid: GroupId, prior: Option<Shell>) -> RegenResult<()> {
        sketch.generate_group(gid)?;
        let outcome = solve_group(sketch, gid, &self.config.solver);

        let mut failures = Vec::new();
        if !outcome.status.is_acceptable() {
            failures.push(GroupFailure::Solve(outcome.status));
        }

        let group = sketch.group(gid)?.clone();
        let loops = match group.workplane {
            Some(wp) if !group.kind.is_solid() => {
                let frame = sketch.workplane_frame(wp)?;
                match assemble_loops(sketch, gid, frame, &self.config.loops) {
                    Ok(set) => Some(set),
                    Err(e) => {
                        tracing::warn!("Group {} has no usable loops: {}", group.name, e);
                        failures.push(e.into());
                        None
                    }
                }
            }
            _ => None,
        };

        let shell = if group.kind.is_solid() && !group.suppress {
            match self.build_shell(sketch, &group) {
                Ok(shell) => Some(shell),
                Err(e) => {
                    tracing::warn!("Group {} failed: {}", group.name, e);
                    failures.push(e.into());
                    None
                }
            }
        } else {
            None
        };

        let running = if group.kind.is_solid() {
            match (&prior, &shell) {
                (Some(prev), Some(new)) => match self.combine(prev, new, group.combine.boolean()) {
                    Ok(combined) => Some(combined),
                    Err(e) => {
                        tracing::warn!("Group {} failed to combine: {}", group.name, e);
                        failures.push(e.into());
                        prior.clone()
                    }
                },
                (None, Some(new)) => Some(new.clone()),
                (_, None) => prior.clone(),
            }
        } else {
            None
        };

        let fingerprint = sketch.fingerprint(gid);
        let clean = outcome.status.is_acceptable() && failures.is_empty();
        let g = sketch.group_mut(gid)?;
        let replaced: Vec<Shell> = g.shell.iter().chain(g.running_shell.iter()).cloned().collect();
        g.loops = loops;
        g.shell = shell;
        g.running_shell = running;
        g.failures = failures;
        g.fingerprint = Some(fingerprint);
        g.clean = clean;

        for old in replaced {
            let in_use = sketch
                .groups()
                .any(|g| g.shell.as_ref() == Some(&old) || g.running_shell.as_ref() == Some(&old));
            if !in_use {
                self.kernel.discard(&old);
            }
        }
        Ok(())
    }

    fn combine(&self, prev: &Shell, new: &Shell, op: Option<BooleanType>) -> CadResult<Shell> {
        match op {
            Some(op) => self.kernel.combine(prev, new, op),
            None => self.kernel.assemble(prev, new),
        }
    }

    fn source<'a>(&self, sketch: &'a Sketch, group: &Group) -> CadResult<&'a Group> {
        group
            .op_a
            .and_then(|id| sketch.group(id).ok())
            .ok_or_else(|| CadError::OperationFailed(format!("{} has no source group", group.id)))
    }

    fn build_shell(&self, sketch: &Sketch, group: &Group) -> CadResult<Shell> {
        let value = |p: ParamId| sketch.value_of(p);
        let vector = |ps: [ParamId; 3]| DVec3::new(value(ps[0]), value(ps[1]), value(ps[2]));

        let profile = || -> CadResult<_> {
            let src = self.source(sketch, group)?;
            match &src.loops {
                Some(loops) if !loops.is_empty() => Ok(loops.to_profile()),
                _ => Err(CadError::InvalidProfile(format!(
                    "{} has no closed loops",
                    src.name
                ))),
            }
        };
        let source_shell = || -> CadResult<Shell> {
            let src = self.source(sketch, group)?;
            src.shell
                .clone()
                .ok_or_else(|| CadError::InvalidProfile(format!("{} has no solid", src.name)))
        };

        match &group.kind {
            GroupKind::Extrude { sides, .. } => {
                let delta = vector(group.delta_params());
                let bottom = match sides {
                    Sides::OneSided => DVec3::ZERO,
                    Sides::TwoSided => -delta,
                };
                self.kernel.extrude(&profile()?, bottom, delta)
            }
            GroupKind::Lathe { axis } => self.kernel.revolve(&profile()?, axis, TAU),
            GroupKind::Revolve { axis } => {
                let angle = group.angle_param().map(value).unwrap_or(0.0);
                self.kernel.revolve(&profile()?, axis, angle)
            }
            GroupKind::Translate {
                copies,
                sides,
                skip_first,
            } => {
                let src = source_shell()?;
                let delta = vector(group.delta_params());
                let placements = Group::copy_times(*copies, *sides, *skip_first)
                    .into_iter()
                    .map(|times| (DQuat::IDENTITY, delta * times))
                    .collect();
                self.repeat(&src, placements)
            }
            GroupKind::Rotate {
                copies,
                sides,
                skip_first,
                ..
            } => {
                let src = source_shell()?;
                let (center, axis, angle) = group.rotate_params();
                let (center, axis, angle) = (vector(center), vector(axis).normalize_or_zero(), value(angle));
                let placements = Group::copy_times(*copies, *sides, *skip_first)
                    .into_iter()
                    .map(|times| {
                        let q = DQuat::from_axis_angle(axis, angle * times);
                        (q, center - q * center)
                    })
                    .collect();
                self.repeat(&src, placements)
            }
            GroupKind::Linked { shell, .. } => {
                let Some(id) = shell else {
                    return Err(CadError::InvalidProfile(format!("{} links no part", group.name)));
                };
                let (offset, rotation) = group.link_params();
                let q = DQuat::from_xyzw(
                    value(rotation[1]),
                    value(rotation[2]),
                    value(rotation[3]),
                    value(rotation[0]),
                );
                self.kernel
                    .transform(&Shell::new(*id), q.normalize(), vector(offset))
            }
            GroupKind::Drawing3d | GroupKind::DrawingWorkplane { .. } => Err(CadError::OperationFailed(
                format!("{} is not a solid group", group.name),
            )),
        }
    }

    /// Union of transformed copies of `src`
    fn repeat(&self, src: &Shell, placements: Vec<(DQuat, DVec3)>) -> CadResult<Shell> {
        let mut result: Option<Shell> = None;
        for (rotation, offset) in placements {
            let copy = self.kernel.transform(src, rotation, offset)?;
            result = Some(match result {
                None => copy,
                Some(acc) => {
                    let merged = self.kernel.combine(&acc, &copy, BooleanType::Union);
                    self.kernel.discard(&acc);
                    self.kernel.discard(&copy);
                    merged?
                }
            });
        }
        result.ok_or_else(|| CadError::OperationFailed("no copies to make".into()))
    }
}
