//! Groups
//!
//! A group is one step of the model: a sketch, or an operation that
//! copies the geometry of an earlier group (extrude, lathe, revolve,
//! step and repeat) or links in an external part. Each group owns the
//! parameters and entities it generates; derived entity handles come
//! from a persistent remap table so that they survive regeneration.

pub mod loops;

pub use loops::{Loop, LoopConfig, LoopSet, PolyError, assemble_loops};

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::f64::consts::{FRAC_PI_2, FRAC_PI_6};
use std::hash::{Hash, Hasher};

use glam::{DQuat, DVec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::expr::{Expr, ExprQuaternion, ExprVector};
use crate::handle::{EntityId, EquationId, GroupId, Keyed, ParamId};
use crate::kernel::{Axis3D, BooleanType, CadError, Shell};
use crate::sketch::{
    CopyTransform, Entity, EntityKind, Equation, FaceNormal, Frame, Param, Request, Sketch,
    SketchError, SketchResult,
};
use crate::solver::{SolveOutcome, SolveStatus};

// Group parameter layout
const DELTA: u32 = 0;
const ROTATE_CENTER: u32 = 0;
const ROTATE_AXIS: u32 = 3;
const ROTATE_ANGLE: u32 = 6;
const REVOLVE_ANGLE: u32 = 0;
const LINK_OFFSET: u32 = 0;
const LINK_ROTATION: u32 = 3;

/// Points closer than this to a lathe axis get no circle
const ON_AXIS_EPSILON: f64 = 1e-9;

/// Whether an operation goes one way or both ways from its source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Sides {
    #[default]
    OneSided,
    TwoSided,
}

/// How a solid group's shell joins the shells before it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CombineAs {
    #[default]
    Union,
    Difference,
    Assemble,
    Intersection,
}

impl CombineAs {
    /// The kernel boolean, `None` for an assembly
    pub fn boolean(&self) -> Option<BooleanType> {
        match self {
            CombineAs::Union => Some(BooleanType::Union),
            CombineAs::Difference => Some(BooleanType::Subtract),
            CombineAs::Intersection => Some(BooleanType::Intersect),
            CombineAs::Assemble => None,
        }
    }
}

/// The kinds of group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GroupKind {
    /// Free drawing in 3D
    Drawing3d,
    /// Drawing in the group's own workplane
    DrawingWorkplane { origin: DVec3, orientation: DQuat },
    /// Sweep of the source group along a solved vector
    Extrude { sides: Sides, lock_to_workplane: bool },
    /// Full turn of the source group about a fixed axis
    Lathe { axis: Axis3D },
    /// Partial turn about a fixed axis by a solved angle
    Revolve { axis: Axis3D },
    /// Rotated copies of the source group
    Rotate {
        center: DVec3,
        axis: DVec3,
        copies: u32,
        sides: Sides,
        skip_first: bool,
    },
    /// Translated copies of the source group
    Translate {
        copies: u32,
        sides: Sides,
        skip_first: bool,
    },
    /// An external part placed by a solved rigid motion
    Linked {
        points: Vec<DVec3>,
        shell: Option<Uuid>,
    },
}

impl GroupKind {
    /// A drawing group in the XY plane
    pub fn workplane_xy() -> Self {
        Self::workplane(DVec3::ZERO, DQuat::IDENTITY)
    }

    pub fn workplane(origin: DVec3, orientation: DQuat) -> Self {
        GroupKind::DrawingWorkplane {
            origin,
            orientation: orientation.normalize(),
        }
    }

    /// A one-sided extrusion kept normal to the source workplane
    pub fn extrude() -> Self {
        GroupKind::Extrude {
            sides: Sides::OneSided,
            lock_to_workplane: true,
        }
    }

    pub fn translate(copies: u32) -> Self {
        GroupKind::Translate {
            copies,
            sides: Sides::OneSided,
            skip_first: true,
        }
    }

    /// Get the type name for display
    pub fn type_name(&self) -> &'static str {
        match self {
            GroupKind::Drawing3d => "Sketch (3D)",
            GroupKind::DrawingWorkplane { .. } => "Sketch in Workplane",
            GroupKind::Extrude { .. } => "Extrude",
            GroupKind::Lathe { .. } => "Lathe",
            GroupKind::Revolve { .. } => "Revolve",
            GroupKind::Rotate { .. } => "Rotate",
            GroupKind::Translate { .. } => "Translate",
            GroupKind::Linked { .. } => "Linked Part",
        }
    }

    /// Groups that copy the geometry of a source group
    pub fn is_derived(&self) -> bool {
        matches!(
            self,
            GroupKind::Extrude { .. }
                | GroupKind::Lathe { .. }
                | GroupKind::Revolve { .. }
                | GroupKind::Rotate { .. }
                | GroupKind::Translate { .. }
        )
    }

    /// Groups that produce a shell
    pub fn is_solid(&self) -> bool {
        self.is_derived() || matches!(self, GroupKind::Linked { .. })
    }

    pub fn is_step_and_repeat(&self) -> bool {
        matches!(self, GroupKind::Rotate { .. } | GroupKind::Translate { .. })
    }
}

/// What a derived entity was made for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemapRole {
    Copy,
    Top,
    Bottom,
    PtToLine,
    LineToFace,
    LatheStart,
    LatheEnd,
    PtToArc,
    PtToNormal,
    LatheArcCenter,
    LatheRadius,
}

/// What a derived entity was made from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemapSource {
    Entity(EntityId),
    /// Point `n` of a linked part
    Imported(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemapKey {
    pub source: RemapSource,
    pub role: RemapRole,
    pub copy: u32,
}

impl RemapKey {
    pub fn new(source: EntityId, role: RemapRole, copy: u32) -> Self {
        Self {
            source: RemapSource::Entity(source),
            role,
            copy,
        }
    }
}

/// Persistent mapping from `(source, role, copy)` to a derived slot
///
/// Slots are never reused, so a derived handle means the same thing for
/// as long as the group exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<(RemapKey, u32)>", into = "Vec<(RemapKey, u32)>")]
pub struct RemapTable {
    slots: HashMap<RemapKey, u32>,
    next: u32,
}

impl RemapTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot for a key, allocating a new one the first time
    pub fn slot(&mut self, key: RemapKey) -> u32 {
        if let Some(slot) = self.slots.get(&key) {
            return *slot;
        }
        let slot = self.next;
        self.next += 1;
        self.slots.insert(key, slot);
        slot
    }

    pub fn get(&self, key: &RemapKey) -> Option<u32> {
        self.slots.get(key).copied()
    }

    /// Reverse lookup of a slot
    pub fn key_of(&self, slot: u32) -> Option<RemapKey> {
        self.slots
            .iter()
            .find(|(_, s)| **s == slot)
            .map(|(k, _)| *k)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl From<Vec<(RemapKey, u32)>> for RemapTable {
    fn from(entries: Vec<(RemapKey, u32)>) -> Self {
        let next = entries.iter().map(|(_, s)| s + 1).max().unwrap_or(0);
        Self {
            slots: entries.into_iter().collect(),
            next,
        }
    }
}

impl From<RemapTable> for Vec<(RemapKey, u32)> {
    fn from(table: RemapTable) -> Self {
        let mut entries: Vec<_> = table.slots.into_iter().collect();
        entries.sort_by_key(|(_, slot)| *slot);
        entries
    }
}

/// Something that went wrong while regenerating a group
#[derive(Debug, Clone, Error)]
pub enum GroupFailure {
    #[error("Solve failed: {0:?}")]
    Solve(SolveStatus),

    #[error("Bad loops: {0}")]
    Loops(#[from] PolyError),

    #[error("Kernel: {0}")]
    Kernel(#[from] CadError),
}

fn default_visible() -> bool {
    true
}

/// A group of the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub kind: GroupKind,
    /// Source group for derived kinds
    pub op_a: Option<GroupId>,
    /// Extra predecessor, ordering only
    #[serde(default)]
    pub op_b: Option<GroupId>,
    pub workplane: Option<EntityId>,
    #[serde(default)]
    pub combine: CombineAs,
    #[serde(default = "default_visible")]
    pub visible: bool,
    /// Suppressed groups contribute no shell
    #[serde(default)]
    pub suppress: bool,
    #[serde(default)]
    pub relax_constraints: bool,
    #[serde(default)]
    pub allow_redundant: bool,
    #[serde(default)]
    pub all_dims_reference: bool,
    #[serde(default)]
    pub remap: RemapTable,

    // Runtime state, rebuilt by regeneration
    #[serde(skip)]
    pub clean: bool,
    #[serde(skip)]
    pub solved: SolveOutcome,
    #[serde(skip)]
    pub loops: Option<LoopSet>,
    #[serde(skip)]
    pub shell: Option<Shell>,
    /// This shell combined with every solid group before it
    #[serde(skip)]
    pub running_shell: Option<Shell>,
    #[serde(skip)]
    pub failures: Vec<GroupFailure>,
    #[serde(skip)]
    pub(crate) fingerprint: Option<u64>,
}

impl Keyed for Group {
    type Key = GroupId;

    fn key(&self) -> GroupId {
        self.id
    }
}

impl Group {
    pub fn new(id: GroupId, name: impl Into<String>, kind: GroupKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            op_a: None,
            op_b: None,
            workplane: None,
            combine: CombineAs::default(),
            visible: true,
            suppress: false,
            relax_constraints: false,
            allow_redundant: false,
            all_dims_reference: false,
            remap: RemapTable::new(),
            clean: false,
            solved: SolveOutcome::default(),
            loops: None,
            shell: None,
            running_shell: None,
            failures: Vec::new(),
            fingerprint: None,
        }
    }

    /// Groups this one reads from directly
    pub fn predecessors(&self) -> Vec<GroupId> {
        self.op_a.iter().chain(self.op_b.iter()).copied().collect()
    }

    /// Translation vector parameters (extrude, translate)
    pub fn delta_params(&self) -> [ParamId; 3] {
        [0, 1, 2].map(|i| ParamId::group(self.id, DELTA + i))
    }

    pub fn angle_param(&self) -> Option<ParamId> {
        match self.kind {
            GroupKind::Rotate { .. } => Some(ParamId::group(self.id, ROTATE_ANGLE)),
            GroupKind::Revolve { .. } => Some(ParamId::group(self.id, REVOLVE_ANGLE)),
            _ => None,
        }
    }

    pub(crate) fn rotate_params(&self) -> ([ParamId; 3], [ParamId; 3], ParamId) {
        (
            [0, 1, 2].map(|i| ParamId::group(self.id, ROTATE_CENTER + i)),
            [0, 1, 2].map(|i| ParamId::group(self.id, ROTATE_AXIS + i)),
            ParamId::group(self.id, ROTATE_ANGLE),
        )
    }

    pub(crate) fn link_params(&self) -> ([ParamId; 3], [ParamId; 4]) {
        (
            [0, 1, 2].map(|i| ParamId::group(self.id, LINK_OFFSET + i)),
            [0, 1, 2, 3].map(|i| ParamId::group(self.id, LINK_ROTATION + i)),
        )
    }

    /// `times` for each step-and-repeat copy
    pub(crate) fn copy_times(copies: u32, sides: Sides, skip_first: bool) -> Vec<f64> {
        let n = copies.max(1);
        (0..n)
            .map(|k| match sides {
                Sides::OneSided => (k + u32::from(skip_first)) as f64,
                Sides::TwoSided => k as f64 - (n - 1) as f64 / 2.0,
            })
            .collect()
    }
}

/// Orientation whose `n` axis is `direction`
fn orientation_along(direction: DVec3) -> DQuat {
    DQuat::from_rotation_arc(DVec3::Z, direction.normalize_or_zero())
}

/// Accumulates the entities a derived group produces
struct Copier<'a> {
    sketch: &'a Sketch,
    group: GroupId,
    remap: &'a mut RemapTable,
    out: Vec<Entity>,
}

impl Copier<'_> {
    fn id(&mut self, key: RemapKey) -> EntityId {
        EntityId::derived(self.group, self.remap.slot(key))
    }

    fn remapped(&mut self, source: EntityId, role: RemapRole, copy: u32) -> EntityId {
        self.id(RemapKey::new(source, role, copy))
    }

    fn push(&mut self, id: EntityId, kind: EntityKind, construction: bool) {
        self.out
            .push(Entity::new(id, self.group, kind).with_construction(construction));
    }

    /// Copy an entity; numeric leaves get `transform`, composite entities
    /// point at the copies of their parts
    fn copy(
        &mut self,
        e: &Entity,
        role: RemapRole,
        copy: u32,
        transform: &CopyTransform,
    ) -> SketchResult<EntityId> {
        let group = self.group;
        let remap = &mut *self.remap;
        let mut map = |id: EntityId| EntityId::derived(group, remap.slot(RemapKey::new(id, role, copy)));
        let kind = match &e.kind {
            EntityKind::PointIn3d { .. } | EntityKind::PointIn2d { .. } | EntityKind::PointCopy { .. } => {
                EntityKind::PointCopy {
                    base: self.sketch.point_position(e.id)?,
                    transform: transform.clone(),
                }
            }
            EntityKind::NormalIn3d { .. } | EntityKind::NormalIn2d | EntityKind::NormalCopy { .. } => {
                EntityKind::NormalCopy {
                    base: self.sketch.normal_orientation(e.id)?,
                    transform: transform.clone(),
                }
            }
            EntityKind::Distance { .. } | EntityKind::DistanceCopy { .. } => {
                EntityKind::DistanceCopy {
                    value: self.sketch.distance_value(e.id)?,
                }
            }
            EntityKind::Workplane { origin, normal } => EntityKind::Workplane {
                origin: map(*origin),
                normal: map(*normal),
            },
            EntityKind::LineSegment { points } => EntityKind::LineSegment {
                points: points.map(&mut map),
            },
            EntityKind::Circle {
                center,
                normal,
                radius,
            } => EntityKind::Circle {
                center: map(*center),
                normal: map(*normal),
                radius: map(*radius),
            },
            EntityKind::ArcOfCircle {
                center,
                start,
                finish,
                normal,
            } => EntityKind::ArcOfCircle {
                center: map(*center),
                start: map(*start),
                finish: map(*finish),
                normal: map(*normal),
            },
            EntityKind::Cubic { points } => EntityKind::Cubic {
                points: points.map(&mut map),
            },
            EntityKind::Face { .. } => {
                return Err(SketchError::WrongEntityKind {
                    entity: e.id,
                    expected: "copyable entity",
                });
            }
        };
        let id = self.remapped(e.id, role, copy);
        self.push(id, kind, e.construction);
        Ok(id)
    }

    /// Circle or arc traced by a point turning about an axis
    fn lathe_curve(
        &mut self,
        point: &Entity,
        axis: &Axis3D,
        ends: Option<(EntityId, EntityId)>,
    ) -> SketchResult<()> {
        let p = self.sketch.point_position(point.id)?;
        let c = axis.project(p);
        let r = p.distance(c);
        if r < ON_AXIS_EPSILON {
            return Ok(());
        }
        let center = self.remapped(point.id, RemapRole::LatheArcCenter, 0);
        self.push(
            center,
            EntityKind::PointCopy {
                base: c,
                transform: CopyTransform::Identity,
            },
            point.construction,
        );
        let normal = self.remapped(point.id, RemapRole::PtToNormal, 0);
        self.push(
            normal,
            EntityKind::NormalCopy {
                base: orientation_along(axis.direction),
                transform: CopyTransform::Identity,
            },
            point.construction,
        );
        let curve = self.remapped(point.id, RemapRole::PtToArc, 0);
        let kind = match ends {
            Some((start, finish)) => EntityKind::ArcOfCircle {
                center,
                start,
                finish,
                normal,
            },
            None => {
                let radius = self.remapped(point.id, RemapRole::LatheRadius, 0);
                self.push(radius, EntityKind::DistanceCopy { value: r }, point.construction);
                EntityKind::Circle {
                    center,
                    normal,
                    radius,
                }
            }
        };
        self.push(curve, kind, point.construction);
        Ok(())
    }
}

impl Sketch {
    /// Rebuild a group's parameters and entities
    ///
    /// Parameter values are carried over by handle; derived entities take
    /// their handles from the group's remap table.
    pub(crate) fn generate_group(&mut self, gid: GroupId) -> SketchResult<()> {
        let group = self.group(gid)?.clone();
        let carry: HashMap<ParamId, f64> = self
            .params
            .iter()
            .filter(|p| p.group == gid)
            .map(|p| (p.id, p.value))
            .collect();
        let defaults = self.transform_defaults(&group)?;

        self.entities.retain(|e| e.group != gid);
        self.params.retain(|p| p.group != gid);

        for (index, default) in defaults {
            let id = ParamId::group(gid, index);
            self.insert_param(Param {
                id,
                group: gid,
                value: carry.get(&id).copied().unwrap_or(default),
            });
        }

        if let GroupKind::DrawingWorkplane {
            origin,
            orientation,
        } = group.kind
        {
            let o = EntityId::predefined(gid, 1);
            let n = EntityId::predefined(gid, 2);
            self.entities.insert(Entity::new(
                o,
                gid,
                EntityKind::PointCopy {
                    base: origin,
                    transform: CopyTransform::Identity,
                },
            ));
            self.entities.insert(Entity::new(
                n,
                gid,
                EntityKind::NormalCopy {
                    base: orientation.normalize(),
                    transform: CopyTransform::Identity,
                },
            ));
            self.entities.insert(Entity::new(
                EntityId::predefined(gid, 0),
                gid,
                EntityKind::Workplane {
                    origin: o,
                    normal: n,
                },
            ));
        }

        let requests: Vec<Request> = self
            .requests
            .iter()
            .filter(|r| r.group == gid)
            .cloned()
            .collect();
        for request in &requests {
            self.insert_expansion(request, &carry);
        }

        if group.kind.is_solid() {
            let mut remap = group.remap.clone();
            let copies = self.copies_for(&group, &mut remap)?;
            for entity in copies {
                self.entities.insert(entity);
            }
            self.group_mut(gid)?.remap = remap;
        }

        let helpers: Vec<ParamId> = self
            .constraints
            .iter()
            .filter(|c| c.group == gid)
            .flat_map(|c| c.helper_params())
            .collect();
        for id in helpers {
            self.insert_param(Param {
                id,
                group: gid,
                value: carry.get(&id).copied().unwrap_or(0.0),
            });
        }

        tracing::debug!(
            "Generated {} ({}): {} entities",
            gid,
            group.kind.type_name(),
            self.entities.iter().filter(|e| e.group == gid).count()
        );
        Ok(())
    }

    /// Initial values of a group's transform parameters
    fn transform_defaults(&self, group: &Group) -> SketchResult<Vec<(u32, f64)>> {
        let plane_axis = |pick: fn(&Frame) -> DVec3, fallback: DVec3| {
            group
                .workplane
                .and_then(|wp| self.workplane_frame(wp).ok())
                .map(|f| pick(&f))
                .unwrap_or(fallback)
        };
        let vector = |base: u32, v: DVec3| (0..3).map(move |i| (base + i, v[i as usize]));

        Ok(match &group.kind {
            GroupKind::Drawing3d | GroupKind::DrawingWorkplane { .. } | GroupKind::Lathe { .. } => {
                Vec::new()
            }
            GroupKind::Extrude { .. } => {
                vector(DELTA, plane_axis(Frame::normal, DVec3::Z) * 10.0).collect()
            }
            GroupKind::Translate { .. } => {
                vector(DELTA, plane_axis(Frame::u, DVec3::X) * 10.0).collect()
            }
            GroupKind::Rotate { center, axis, .. } => vector(ROTATE_CENTER, *center)
                .chain(vector(ROTATE_AXIS, axis.normalize_or_zero()))
                .chain([(ROTATE_ANGLE, FRAC_PI_6)])
                .collect(),
            GroupKind::Revolve { .. } => vec![(REVOLVE_ANGLE, FRAC_PI_2)],
            GroupKind::Linked { .. } => vector(LINK_OFFSET, DVec3::ZERO)
                .chain([
                    (LINK_ROTATION, 1.0),
                    (LINK_ROTATION + 1, 0.0),
                    (LINK_ROTATION + 2, 0.0),
                    (LINK_ROTATION + 3, 0.0),
                ])
                .collect(),
        })
    }

    /// Entities a derived or linked group produces
    fn copies_for(&self, group: &Group, remap: &mut RemapTable) -> SketchResult<Vec<Entity>> {
        let sources: Vec<Entity> = match group.op_a {
            Some(src) if group.kind.is_derived() => self
                .entities
                .iter()
                .filter(|e| e.group == src && !e.is_face())
                .cloned()
                .collect(),
            None if group.kind.is_derived() => {
                return Err(SketchError::InvalidGroup(format!(
                    "{} has no source group",
                    group.id
                )));
            }
            _ => Vec::new(),
        };
        let mut copier = Copier {
            sketch: self,
            group: group.id,
            remap,
            out: Vec::new(),
        };

        match &group.kind {
            GroupKind::Extrude { sides, .. } => {
                let delta = group.delta_params();
                let top = CopyTransform::Translate { delta, times: 1.0 };
                let bottom = match sides {
                    Sides::OneSided => CopyTransform::Identity,
                    Sides::TwoSided => CopyTransform::Translate { delta, times: -1.0 },
                };
                for e in &sources {
                    let b = copier.copy(e, RemapRole::Bottom, 0, &bottom)?;
                    let t = copier.copy(e, RemapRole::Top, 0, &top)?;
                    if e.is_point() {
                        let line = copier.remapped(e.id, RemapRole::PtToLine, 0);
                        copier.push(line, EntityKind::LineSegment { points: [b, t] }, e.construction);
                    }
                    if let EntityKind::LineSegment { points } = e.kind {
                        let from = copier.remapped(points[0], RemapRole::Bottom, 0);
                        let to = copier.remapped(points[1], RemapRole::Bottom, 0);
                        let face = copier.remapped(e.id, RemapRole::LineToFace, 0);
                        copier.push(
                            face,
                            EntityKind::Face {
                                point: from,
                                normal: FaceNormal::Sweep {
                                    from,
                                    to,
                                    direction: delta,
                                },
                            },
                            e.construction,
                        );
                    }
                }
            }
            GroupKind::Lathe { axis } => {
                for e in &sources {
                    copier.copy(e, RemapRole::Copy, 0, &CopyTransform::Identity)?;
                    if e.is_point() {
                        copier.lathe_curve(e, axis, None)?;
                    }
                }
            }
            GroupKind::Revolve { axis } => {
                let end = CopyTransform::Revolve {
                    origin: axis.origin,
                    axis: axis.direction,
                    angle: ParamId::group(group.id, REVOLVE_ANGLE),
                };
                for e in &sources {
                    let s = copier.copy(e, RemapRole::LatheStart, 0, &CopyTransform::Identity)?;
                    let f = copier.copy(e, RemapRole::LatheEnd, 0, &end)?;
                    if e.is_point() {
                        copier.lathe_curve(e, axis, Some((s, f)))?;
                    }
                }
            }
            GroupKind::Translate {
                copies,
                sides,
                skip_first,
            } => {
                let delta = group.delta_params();
                for (k, times) in Group::copy_times(*copies, *sides, *skip_first).into_iter().enumerate() {
                    let transform = CopyTransform::Translate { delta, times };
                    for e in &sources {
                        copier.copy(e, RemapRole::Copy, k as u32, &transform)?;
                    }
                }
            }
            GroupKind::Rotate {
                copies,
                sides,
                skip_first,
                ..
            } => {
                let (center, axis, angle) = group.rotate_params();
                for (k, times) in Group::copy_times(*copies, *sides, *skip_first).into_iter().enumerate() {
                    let transform = CopyTransform::Rotate {
                        center,
                        axis,
                        angle,
                        times,
                    };
                    for e in &sources {
                        copier.copy(e, RemapRole::Copy, k as u32, &transform)?;
                    }
                }
            }
            GroupKind::Linked { points, .. } => {
                let (offset, rotation) = group.link_params();
                for (i, p) in points.iter().enumerate() {
                    let id = copier.id(RemapKey {
                        source: RemapSource::Imported(i as u32),
                        role: RemapRole::Copy,
                        copy: 0,
                    });
                    copier.push(
                        id,
                        EntityKind::PointCopy {
                            base: *p,
                            transform: CopyTransform::Linked { offset, rotation },
                        },
                        false,
                    );
                }
            }
            GroupKind::Drawing3d | GroupKind::DrawingWorkplane { .. } => {}
        }
        Ok(copier.out)
    }

    /// Equations a group imposes on its transform parameters
    pub fn group_equations(&self, gid: GroupId) -> SketchResult<Vec<Equation>> {
        let group = self.group(gid)?;
        let mut exprs: Vec<Expr> = Vec::new();
        let plane = match group.workplane {
            Some(wp) => Some(self.workplane_exprs(wp)?),
            None => None,
        };

        match &group.kind {
            GroupKind::Extrude {
                lock_to_workplane: true,
                ..
            } => {
                if let Some((_, q)) = &plane {
                    let d = ExprVector::from_params(group.delta_params());
                    exprs.push(d.dot(&q.rotation_u()));
                    exprs.push(d.dot(&q.rotation_v()));
                }
            }
            GroupKind::Translate { .. } => {
                if let Some((_, q)) = &plane {
                    let d = ExprVector::from_params(group.delta_params());
                    exprs.push(d.dot(&q.rotation_n()));
                }
            }
            GroupKind::Rotate { .. } => {
                let (center, axis, _) = group.rotate_params();
                let axis = ExprVector::from_params(axis);
                if let Some((origin, q)) = &plane {
                    exprs.push(axis.dot(&q.rotation_u()));
                    exprs.push(axis.dot(&q.rotation_v()));
                    exprs.push(
                        ExprVector::from_params(center)
                            .minus(origin)
                            .dot(&q.rotation_n()),
                    );
                }
                exprs.push(axis.dot(&axis).minus(Expr::constant(1.0)));
            }
            GroupKind::Linked { .. } => {
                let (_, rotation) = group.link_params();
                exprs.push(
                    ExprQuaternion::from_params(rotation)
                        .magnitude_squared()
                        .minus(Expr::constant(1.0)),
                );
            }
            _ => {}
        }

        Ok(exprs
            .into_iter()
            .enumerate()
            .map(|(i, expr)| Equation::new(EquationId::group(gid, i as u32), expr))
            .collect())
    }

    /// Derived entity made from `source` for `role`, if it exists
    pub fn derived_entity(
        &self,
        gid: GroupId,
        source: EntityId,
        role: RemapRole,
        copy: u32,
    ) -> Option<EntityId> {
        let slot = self
            .groups
            .get(gid)?
            .remap
            .get(&RemapKey::new(source, role, copy))?;
        let id = EntityId::derived(gid, slot);
        self.entities.contains(id).then_some(id)
    }

    /// Hash of a group's entity set and parameter values
    pub fn fingerprint(&self, gid: GroupId) -> u64 {
        let mut hasher = DefaultHasher::new();
        for e in self.entities.iter().filter(|e| e.group == gid) {
            e.id.hash(&mut hasher);
            e.construction.hash(&mut hasher);
        }
        for p in self.params.iter().filter(|p| p.group == gid) {
            p.id.hash(&mut hasher);
            p.value.to_bits().hash(&mut hasher);
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn square_sketch() -> (Sketch, GroupId, EntityId) {
        let mut sketch = Sketch::new();
        let g = sketch
            .add_group("sketch", GroupKind::workplane_xy(), None)
            .unwrap();
        let wp = sketch.group(g).unwrap().workplane.unwrap();
        let corners = [
            DVec3::new(0.0, 0.0, 0.0),
            DVec3::new(4.0, 0.0, 0.0),
            DVec3::new(4.0, 4.0, 0.0),
            DVec3::new(0.0, 4.0, 0.0),
        ];
        for i in 0..4 {
            sketch
                .add_line(g, Some(wp), corners[i], corners[(i + 1) % 4])
                .unwrap();
        }
        (sketch, g, wp)
    }

    #[test]
    fn test_extrude_copies_and_equations() {
        let (mut sketch, g, _) = square_sketch();
        let e = sketch.add_group("extrude", GroupKind::extrude(), Some(g)).unwrap();

        let first = sketch.requests().next().unwrap().clone();
        let a = first.point(0);
        let top = sketch.derived_entity(e, a, RemapRole::Top, 0).unwrap();
        let bottom = sketch.derived_entity(e, a, RemapRole::Bottom, 0).unwrap();
        assert_relative_eq!(sketch.point_position(top).unwrap().z, 10.0);
        assert_relative_eq!(sketch.point_position(bottom).unwrap().z, 0.0);

        let edge = sketch.derived_entity(e, a, RemapRole::PtToLine, 0).unwrap();
        assert!(sketch.entity(edge).unwrap().is_line());
        let face = sketch
            .derived_entity(e, first.entity(), RemapRole::LineToFace, 0)
            .unwrap();
        assert!(sketch.entity(face).unwrap().is_face());

        // Locked to the workplane normal: two equations on three params
        assert_eq!(sketch.group_equations(e).unwrap().len(), 2);
        assert_eq!(sketch.params().filter(|p| p.group == e).count(), 3);
    }

    #[test]
    fn test_remap_is_stable_across_regeneration() {
        let (mut sketch, g, wp) = square_sketch();
        let e = sketch.add_group("extrude", GroupKind::extrude(), Some(g)).unwrap();
        let a = sketch.requests().next().unwrap().point(0);
        let top = sketch.derived_entity(e, a, RemapRole::Top, 0).unwrap();

        sketch
            .add_point(g, Some(wp), DVec3::new(9.0, 9.0, 0.0))
            .unwrap();
        sketch.generate_group(e).unwrap();

        assert_eq!(sketch.derived_entity(e, a, RemapRole::Top, 0), Some(top));
        let slots = sketch.group(e).unwrap().remap.len();
        sketch.generate_group(e).unwrap();
        assert_eq!(sketch.group(e).unwrap().remap.len(), slots);
    }

    #[test]
    fn test_params_carry_over() {
        let (mut sketch, g, _) = square_sketch();
        let e = sketch.add_group("extrude", GroupKind::extrude(), Some(g)).unwrap();
        let dz = sketch.group(e).unwrap().delta_params()[2];
        sketch.set_param(dz, 3.5).unwrap();
        sketch.generate_group(e).unwrap();
        assert_eq!(sketch.param_value(dz).unwrap(), 3.5);
    }

    #[test]
    fn test_lathe_makes_circles() {
        let mut sketch = Sketch::new();
        let g = sketch
            .add_group("sketch", GroupKind::workplane_xy(), None)
            .unwrap();
        let wp = sketch.group(g).unwrap().workplane.unwrap();
        let r = sketch
            .add_point(g, Some(wp), DVec3::new(3.0, 1.0, 0.0))
            .unwrap();
        let point = sketch.request(r).unwrap().point(0);

        let lathe = sketch
            .add_group("lathe", GroupKind::Lathe { axis: Axis3D::y() }, Some(g))
            .unwrap();
        let circle = sketch
            .derived_entity(lathe, point, RemapRole::PtToArc, 0)
            .unwrap();
        assert_relative_eq!(sketch.radius_value(circle).unwrap(), 3.0, epsilon = 1e-12);
        let center = sketch.center_of(circle).unwrap();
        let c = sketch.point_position(center).unwrap();
        assert_relative_eq!(c.y, 1.0, epsilon = 1e-12);
        assert_relative_eq!(c.x, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_translate_copies() {
        let (mut sketch, g, _) = square_sketch();
        let t = sketch.add_group("repeat", GroupKind::translate(3), Some(g)).unwrap();
        let a = sketch.requests().next().unwrap().point(0);
        for k in 0..3 {
            let copy = sketch.derived_entity(t, a, RemapRole::Copy, k).unwrap();
            let p = sketch.point_position(copy).unwrap();
            assert_relative_eq!(p.x, 10.0 * (k + 1) as f64, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_derived_group_needs_source() {
        let mut sketch = Sketch::new();
        assert!(sketch.add_group("bad", GroupKind::extrude(), None).is_err());
        assert_eq!(sketch.groups().count(), 0);
    }

    #[test]
    fn test_remap_table_serde() {
        let mut table = RemapTable::new();
        let a = RemapKey::new(EntityId::predefined(GroupId(1), 1), RemapRole::Top, 0);
        let b = RemapKey::new(EntityId::predefined(GroupId(1), 1), RemapRole::Bottom, 0);
        assert_eq!(table.slot(a), 0);
        assert_eq!(table.slot(b), 1);
        assert_eq!(table.slot(a), 0);

        let text = ron::to_string(&table).unwrap();
        let mut back: RemapTable = ron::from_str(&text).unwrap();
        assert_eq!(back, table);
        assert_eq!(back.key_of(1), Some(b));
        let c = RemapKey::new(EntityId::predefined(GroupId(2), 1), RemapRole::Copy, 3);
        assert_eq!(back.slot(c), 2);
    }
}
