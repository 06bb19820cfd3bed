//! Mesh Kernel
//!
//! A small pure-Rust kernel that represents shells as triangle meshes.
//! It can sweep and revolve profiles, move shells and assemble them, but
//! it has no B-rep booleans: a boolean between overlapping shells fails.

use glam::{DQuat, DVec2, DVec3};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::f64::consts::TAU;
use uuid::Uuid;

use super::{
    Axis3D, BooleanType, CadError, CadResult, Profile, Shell, SolidKernel, TessellatedMesh,
};

/// Gap below which two bounding boxes count as touching
const OVERLAP_EPSILON: f64 = 1e-9;

/// Mesh-based solid kernel
pub struct MeshKernel {
    /// Storage for shell meshes (keyed by UUID)
    shells: Mutex<HashMap<Uuid, TessellatedMesh>>,
    /// Segments used for a full turn when revolving
    revolve_segments: u32,
}

impl MeshKernel {
    /// Create a new mesh kernel
    pub fn new() -> Self {
        Self::with_segments(32)
    }

    pub fn with_segments(revolve_segments: u32) -> Self {
        Self {
            shells: Mutex::new(HashMap::new()),
            revolve_segments: revolve_segments.max(3),
        }
    }

    /// Store a mesh and return a shell handle
    fn store_shell(&self, mesh: TessellatedMesh) -> Shell {
        let id = Uuid::new_v4();
        self.shells.lock().insert(id, mesh);
        Shell::new(id)
    }

    fn mesh(&self, shell: &Shell) -> CadResult<TessellatedMesh> {
        self.shells
            .lock()
            .get(&shell.id)
            .cloned()
            .ok_or(CadError::ShellNotFound(shell.id))
    }

    /// Number of stored shells
    pub fn len(&self) -> usize {
        self.shells.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shells.lock().is_empty()
    }
}

impl Default for MeshKernel {
    fn default() -> Self {
        Self::new()
    }
}

/// Twice the signed area of a polygon (positive when counter-clockwise)
fn signed_area(points: &[DVec2]) -> f64 {
    let n = points.len();
    (0..n)
        .map(|i| points[i].perp_dot(points[(i + 1) % n]))
        .sum()
}

fn inside_triangle(p: DVec2, a: DVec2, b: DVec2, c: DVec2) -> bool {
    (b - a).perp_dot(p - a) >= 0.0 && (c - b).perp_dot(p - b) >= 0.0 && (a - c).perp_dot(p - c) >= 0.0
}

/// Triangulate a simple counter-clockwise polygon by ear clipping
fn triangulate(points: &[DVec2]) -> CadResult<Vec<[usize; 3]>> {
    let mut remaining: Vec<usize> = (0..points.len()).collect();
    let mut triangles = Vec::with_capacity(points.len().saturating_sub(2));

    while remaining.len() > 3 {
        let n = remaining.len();
        let ear = (0..n).find(|&i| {
            let (ia, ib, ic) = (remaining[(i + n - 1) % n], remaining[i], remaining[(i + 1) % n]);
            let (a, b, c) = (points[ia], points[ib], points[ic]);
            if (b - a).perp_dot(c - b) <= 0.0 {
                return false;
            }
            remaining
                .iter()
                .filter(|&&j| j != ia && j != ib && j != ic)
                .all(|&j| !inside_triangle(points[j], a, b, c))
        });
        let Some(i) = ear else {
            return Err(CadError::InvalidProfile(
                "loop is self-intersecting".into(),
            ));
        };
        triangles.push([remaining[(i + n - 1) % n], remaining[i], remaining[(i + 1) % n]]);
        remaining.remove(i);
    }
    if remaining.len() == 3 {
        triangles.push([remaining[0], remaining[1], remaining[2]]);
    }
    Ok(triangles)
}

fn point_in_polygon(p: DVec2, polygon: &[DVec2]) -> bool {
    let n = polygon.len();
    let mut inside = false;
    for i in 0..n {
        let (a, b) = (polygon[i], polygon[(i + 1) % n]);
        if (a.y > p.y) != (b.y > p.y) && p.x < a.x + (p.y - a.y) / (b.y - a.y) * (b.x - a.x) {
            inside = !inside;
        }
    }
    inside
}

/// Loops of a profile, counter-clockwise, rejecting nested loops
fn outer_loops(profile: &Profile) -> CadResult<Vec<Vec<DVec2>>> {
    if profile.is_empty() {
        return Err(CadError::InvalidProfile("profile has no loops".into()));
    }
    let mut loops = Vec::with_capacity(profile.loops.len());
    for l in &profile.loops {
        if l.len() < 3 {
            return Err(CadError::InvalidProfile(
                "loop must have at least 3 points".into(),
            ));
        }
        let mut l = l.clone();
        if signed_area(&l) < 0.0 {
            l.reverse();
        }
        loops.push(l);
    }
    for (i, a) in loops.iter().enumerate() {
        for (j, b) in loops.iter().enumerate() {
            if i != j && point_in_polygon(a[0], b) {
                return Err(CadError::InvalidProfile(
                    "holes are not supported by the mesh kernel".into(),
                ));
            }
        }
    }
    Ok(loops)
}

fn push_oriented(mesh: &mut TessellatedMesh, [a, b, c]: [DVec3; 3], flip: bool) {
    if flip {
        mesh.push_triangle(a, c, b);
    } else {
        mesh.push_triangle(a, b, c);
    }
}

impl SolidKernel for MeshKernel {
    fn name(&self) -> &str {
        "mesh"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn extrude(&self, profile: &Profile, bottom: DVec3, top: DVec3) -> CadResult<Shell> {
        let direction = top - bottom;
        if direction.length_squared() < OVERLAP_EPSILON * OVERLAP_EPSILON {
            return Err(CadError::OperationFailed("zero-length extrusion".into()));
        }
        // Winding follows the sweep direction so that faces point outward
        let flip = direction.dot(profile.normal()) < 0.0;

        let mut mesh = TessellatedMesh::new();
        for l in outer_loops(profile)? {
            let lower: Vec<DVec3> = l.iter().map(|p| profile.to_world(*p) + bottom).collect();
            let upper: Vec<DVec3> = l.iter().map(|p| profile.to_world(*p) + top).collect();

            for [i, j, k] in triangulate(&l)? {
                push_oriented(&mut mesh, [upper[i], upper[j], upper[k]], flip);
                push_oriented(&mut mesh, [lower[i], lower[k], lower[j]], flip);
            }
            let n = l.len();
            for i in 0..n {
                let j = (i + 1) % n;
                push_oriented(&mut mesh, [lower[i], lower[j], upper[j]], flip);
                push_oriented(&mut mesh, [lower[i], upper[j], upper[i]], flip);
            }
        }
        Ok(self.store_shell(mesh))
    }

    fn revolve(&self, profile: &Profile, axis: &Axis3D, angle: f64) -> CadResult<Shell> {
        if angle.abs() < 1e-9 || axis.direction == DVec3::ZERO {
            return Err(CadError::OperationFailed("degenerate revolve".into()));
        }
        let full = angle.abs() >= TAU - 1e-9;
        let steps = ((self.revolve_segments as f64 * angle.abs() / TAU).ceil() as usize).max(3);
        let rotate = |p: DVec3, s: usize| {
            let q = DQuat::from_axis_angle(axis.direction, angle * s as f64 / steps as f64);
            axis.origin + q * (p - axis.origin)
        };

        let mut mesh = TessellatedMesh::new();
        for l in outer_loops(profile)? {
            let ring: Vec<DVec3> = l.iter().map(|p| profile.to_world(*p)).collect();
            let rings: Vec<Vec<DVec3>> = (0..=steps)
                .map(|s| ring.iter().map(|p| rotate(*p, s)).collect())
                .collect();
            let n = ring.len();
            for s in 0..steps {
                let (a, b) = (&rings[s], &rings[s + 1]);
                for i in 0..n {
                    let j = (i + 1) % n;
                    mesh.push_triangle(a[i], a[j], b[j]);
                    mesh.push_triangle(a[i], b[j], b[i]);
                }
            }
            if !full {
                let last = &rings[steps];
                for [i, j, k] in triangulate(&l)? {
                    mesh.push_triangle(ring[i], ring[k], ring[j]);
                    mesh.push_triangle(last[i], last[j], last[k]);
                }
            }
        }
        Ok(self.store_shell(mesh))
    }

    fn transform(&self, shell: &Shell, rotation: DQuat, offset: DVec3) -> CadResult<Shell> {
        let mut mesh = self.mesh(shell)?;
        let rotation = rotation.normalize();
        for v in &mut mesh.vertices {
            *v = rotation * *v + offset;
        }
        for n in &mut mesh.normals {
            *n = rotation * *n;
        }
        Ok(self.store_shell(mesh))
    }

    fn combine(&self, a: &Shell, b: &Shell, op: BooleanType) -> CadResult<Shell> {
        let ma = self.mesh(a)?;
        let mb = self.mesh(b)?;
        let overlap = match (ma.bounds(), mb.bounds()) {
            (Some((alo, ahi)), Some((blo, bhi))) => {
                (alo - OVERLAP_EPSILON).cmplt(bhi).all() && (blo - OVERLAP_EPSILON).cmplt(ahi).all()
            }
            _ => false,
        };
        if overlap {
            return Err(CadError::BooleanFailed(format!(
                "{:?} of overlapping shells needs a B-rep kernel",
                op
            )));
        }
        let mesh = match op {
            BooleanType::Union => {
                let mut mesh = ma;
                mesh.append(&mb);
                mesh
            }
            BooleanType::Subtract => ma,
            BooleanType::Intersect => TessellatedMesh::new(),
        };
        Ok(self.store_shell(mesh))
    }

    fn assemble(&self, a: &Shell, b: &Shell) -> CadResult<Shell> {
        let mut mesh = self.mesh(a)?;
        mesh.append(&self.mesh(b)?);
        Ok(self.store_shell(mesh))
    }

    fn import_mesh(&self, mesh: TessellatedMesh) -> CadResult<Shell> {
        Ok(self.store_shell(mesh))
    }

    fn tessellate(&self, shell: &Shell, _tolerance: f64) -> CadResult<TessellatedMesh> {
        self.mesh(shell)
            .map_err(|_| CadError::TessellationFailed("Shell not found".into()))
    }

    fn discard(&self, shell: &Shell) {
        self.shells.lock().remove(&shell.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn square(origin: DVec3, size: f64) -> Profile {
        Profile {
            origin,
            u: DVec3::X,
            v: DVec3::Y,
            loops: vec![vec![
                DVec2::new(0.0, 0.0),
                DVec2::new(size, 0.0),
                DVec2::new(size, size),
                DVec2::new(0.0, size),
            ]],
        }
    }

    #[test]
    fn test_triangulate_concave() {
        // L shape
        let l = vec![
            DVec2::new(0.0, 0.0),
            DVec2::new(2.0, 0.0),
            DVec2::new(2.0, 1.0),
            DVec2::new(1.0, 1.0),
            DVec2::new(1.0, 2.0),
            DVec2::new(0.0, 2.0),
        ];
        let triangles = triangulate(&l).unwrap();
        assert_eq!(triangles.len(), 4);
        let area: f64 = triangles
            .iter()
            .map(|[a, b, c]| (l[*b] - l[*a]).perp_dot(l[*c] - l[*a]) / 2.0)
            .sum();
        assert_relative_eq!(area, 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_extrude_box() {
        let kernel = MeshKernel::new();
        let shell = kernel
            .extrude(&square(DVec3::ZERO, 1.0), DVec3::ZERO, DVec3::new(0.0, 0.0, 2.0))
            .unwrap();
        let mesh = kernel.tessellate(&shell, 0.1).unwrap();
        // 2 caps of 2 triangles + 4 sides of 2 triangles
        assert_eq!(mesh.triangle_count(), 12);
        let (lo, hi) = mesh.bounds().unwrap();
        assert_eq!(lo, DVec3::ZERO);
        assert_eq!(hi, DVec3::new(1.0, 1.0, 2.0));

        // Top cap faces up
        let top = mesh
            .vertices
            .chunks(3)
            .zip(mesh.normals.chunks(3))
            .find(|(v, _)| v.iter().all(|p| p.z == 2.0))
            .unwrap();
        assert_relative_eq!(top.1[0].z, 1.0);
    }

    #[test]
    fn test_overlapping_union_fails() {
        let kernel = MeshKernel::new();
        let a = kernel
            .extrude(&square(DVec3::ZERO, 2.0), DVec3::ZERO, DVec3::Z)
            .unwrap();
        let b = kernel
            .extrude(&square(DVec3::new(1.0, 1.0, 0.0), 2.0), DVec3::ZERO, DVec3::Z)
            .unwrap();
        assert!(matches!(
            kernel.combine(&a, &b, BooleanType::Union),
            Err(CadError::BooleanFailed(_))
        ));

        let far = kernel
            .extrude(&square(DVec3::new(5.0, 0.0, 0.0), 1.0), DVec3::ZERO, DVec3::Z)
            .unwrap();
        let joined = kernel.combine(&a, &far, BooleanType::Union).unwrap();
        assert_eq!(kernel.tessellate(&joined, 0.1).unwrap().triangle_count(), 24);
    }

    #[test]
    fn test_revolve_and_transform() {
        let kernel = MeshKernel::with_segments(16);
        let profile = Profile {
            origin: DVec3::ZERO,
            u: DVec3::X,
            v: DVec3::Z,
            loops: vec![vec![
                DVec2::new(1.0, 0.0),
                DVec2::new(2.0, 0.0),
                DVec2::new(2.0, 1.0),
                DVec2::new(1.0, 1.0),
            ]],
        };
        let shell = kernel.revolve(&profile, &Axis3D::z(), TAU).unwrap();
        let mesh = kernel.tessellate(&shell, 0.1).unwrap();
        assert_eq!(mesh.triangle_count(), 16 * 4 * 2);
        for v in &mesh.vertices {
            let r = v.truncate().length();
            assert!((1.0 - 1e-9..=2.0 + 1e-9).contains(&r));
        }

        let moved = kernel
            .transform(&shell, DQuat::IDENTITY, DVec3::new(0.0, 0.0, 10.0))
            .unwrap();
        let (lo, _) = kernel.tessellate(&moved, 0.1).unwrap().bounds().unwrap();
        assert_relative_eq!(lo.z, 10.0);

        kernel.discard(&moved);
        assert!(kernel.tessellate(&moved, 0.1).is_err());
    }

    #[test]
    fn test_nested_loops_rejected() {
        let kernel = MeshKernel::new();
        let mut profile = square(DVec3::ZERO, 4.0);
        profile.loops.push(vec![
            DVec2::new(1.0, 1.0),
            DVec2::new(2.0, 1.0),
            DVec2::new(2.0, 2.0),
        ]);
        assert!(matches!(
            kernel.extrude(&profile, DVec3::ZERO, DVec3::Z),
            Err(CadError::InvalidProfile(_))
        ));
    }
}
