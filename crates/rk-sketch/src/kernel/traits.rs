//! Solid kernel trait definitions
//!
//! The regeneration pipeline builds and combines shells through this
//! interface; the payload behind a [`Shell`] handle lives in the kernel.

use glam::{DQuat, DVec2, DVec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Error type for kernel operations
#[derive(Debug, Clone, Error)]
pub enum CadError {
    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    #[error("Boolean operation failed: {0}")]
    BooleanFailed(String),

    #[error("Tessellation failed: {0}")]
    TessellationFailed(String),

    #[error("Kernel not available: {0}")]
    KernelNotAvailable(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Shell not found: {0}")]
    ShellNotFound(Uuid),
}

/// Result type for kernel operations
pub type CadResult<T> = Result<T, CadError>;

/// A triangle mesh
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TessellatedMesh {
    pub vertices: Vec<DVec3>,
    pub normals: Vec<DVec3>,
    /// Triangle indices (3 per triangle)
    pub indices: Vec<u32>,
}

impl TessellatedMesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Axis-aligned bounds, `None` for an empty mesh
    pub fn bounds(&self) -> Option<(DVec3, DVec3)> {
        let first = *self.vertices.first()?;
        Some(
            self.vertices
                .iter()
                .fold((first, first), |(lo, hi), v| (lo.min(*v), hi.max(*v))),
        )
    }

    /// Add a flat-shaded triangle
    pub fn push_triangle(&mut self, a: DVec3, b: DVec3, c: DVec3) {
        let normal = (b - a).cross(c - a).normalize_or_zero();
        let base = self.vertices.len() as u32;
        self.vertices.extend([a, b, c]);
        self.normals.extend([normal; 3]);
        self.indices.extend([base, base + 1, base + 2]);
    }

    /// Append another mesh
    pub fn append(&mut self, other: &TessellatedMesh) {
        let base = self.vertices.len() as u32;
        self.vertices.extend_from_slice(&other.vertices);
        self.normals.extend_from_slice(&other.normals);
        self.indices.extend(other.indices.iter().map(|i| i + base));
    }
}

/// Closed planar loops in a plane, the input to extrude and revolve
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub origin: DVec3,
    pub u: DVec3,
    pub v: DVec3,
    /// Loops in plane coordinates, each without a repeated end point
    pub loops: Vec<Vec<DVec2>>,
}

impl Profile {
    pub fn normal(&self) -> DVec3 {
        self.u.cross(self.v)
    }

    /// Point in space for plane coordinates
    pub fn to_world(&self, p: DVec2) -> DVec3 {
        self.origin + self.u * p.x + self.v * p.y
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }
}

/// Handle to a shell stored in a kernel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shell {
    pub id: Uuid,
}

impl Shell {
    pub fn new(id: Uuid) -> Self {
        Self { id }
    }
}

/// Axis definition for lathe and revolve operations
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Axis3D {
    pub origin: DVec3,
    /// Direction of the axis (normalized)
    pub direction: DVec3,
}

impl Axis3D {
    /// Create an axis from origin and direction
    pub fn new(origin: DVec3, direction: DVec3) -> Self {
        Self {
            origin,
            direction: direction.normalize_or_zero(),
        }
    }

    /// X axis at origin
    pub fn x() -> Self {
        Self::new(DVec3::ZERO, DVec3::X)
    }

    /// Y axis at origin
    pub fn y() -> Self {
        Self::new(DVec3::ZERO, DVec3::Y)
    }

    /// Z axis at origin
    pub fn z() -> Self {
        Self::new(DVec3::ZERO, DVec3::Z)
    }

    /// Closest point on the axis
    pub fn project(&self, p: DVec3) -> DVec3 {
        self.origin + self.direction * (p - self.origin).dot(self.direction)
    }
}

/// Boolean operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BooleanType {
    /// Union (add)
    Union,
    /// Subtraction (cut)
    Subtract,
    /// Intersection (common)
    Intersect,
}

/// The solid kernel trait
///
/// Implementations provide the shell operations the regeneration
/// pipeline needs. Shell payloads stay inside the kernel.
pub trait SolidKernel: Send + Sync {
    /// Get the name of this kernel
    fn name(&self) -> &str;

    /// Check if the kernel is available
    fn is_available(&self) -> bool;

    /// Sweep a profile between two offsets from its plane
    fn extrude(&self, profile: &Profile, bottom: DVec3, top: DVec3) -> CadResult<Shell>;

    /// Revolve a profile about an axis by `angle` radians
    fn revolve(&self, profile: &Profile, axis: &Axis3D, angle: f64) -> CadResult<Shell>;

    /// Copy of a shell moved by `rotation * p + offset`
    fn transform(&self, shell: &Shell, rotation: DQuat, offset: DVec3) -> CadResult<Shell>;

    /// Boolean combination of two shells
    fn combine(&self, a: &Shell, b: &Shell, op: BooleanType) -> CadResult<Shell>;

    /// Both shells together without merging
    fn assemble(&self, a: &Shell, b: &Shell) -> CadResult<Shell>;

    /// Store a ready-made mesh as a shell (linked parts)
    fn import_mesh(&self, mesh: TessellatedMesh) -> CadResult<Shell>;

    /// Tessellate a shell into triangles
    fn tessellate(&self, shell: &Shell, tolerance: f64) -> CadResult<TessellatedMesh>;

    /// Release a shell that is no longer referenced
    fn discard(&self, _shell: &Shell) {}
}

/// A null kernel that always returns errors (used when no kernel is available)
#[derive(Debug, Default)]
pub struct NullKernel;

impl NullKernel {
    fn unavailable<T>() -> CadResult<T> {
        Err(CadError::KernelNotAvailable("No solid kernel available".into()))
    }
}

impl SolidKernel for NullKernel {
    fn name(&self) -> &str {
        "null"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn extrude(&self, _profile: &Profile, _bottom: DVec3, _top: DVec3) -> CadResult<Shell> {
        Self::unavailable()
    }

    fn revolve(&self, _profile: &Profile, _axis: &Axis3D, _angle: f64) -> CadResult<Shell> {
        Self::unavailable()
    }

    fn transform(&self, _shell: &Shell, _rotation: DQuat, _offset: DVec3) -> CadResult<Shell> {
        Self::unavailable()
    }

    fn combine(&self, _a: &Shell, _b: &Shell, _op: BooleanType) -> CadResult<Shell> {
        Self::unavailable()
    }

    fn assemble(&self, _a: &Shell, _b: &Shell) -> CadResult<Shell> {
        Self::unavailable()
    }

    fn import_mesh(&self, _mesh: TessellatedMesh) -> CadResult<Shell> {
        Self::unavailable()
    }

    fn tessellate(&self, _shell: &Shell, _tolerance: f64) -> CadResult<TessellatedMesh> {
        Self::unavailable()
    }
}
