//! Solid kernels
//!
//! The pipeline only talks to [`SolidKernel`]. [`MeshKernel`] is the
//! built-in implementation; [`NullKernel`] refuses every operation.

mod mesh;
mod traits;

pub use mesh::MeshKernel;
pub use traits::{
    Axis3D, BooleanType, CadError, CadResult, NullKernel, Profile, Shell, SolidKernel,
    TessellatedMesh,
};

use serde::{Deserialize, Serialize};

/// Which kernel to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KernelBackend {
    #[default]
    Mesh,
    Null,
}

/// Kernel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub backend: KernelBackend,
    /// Segments for a full turn of a lathe or revolve
    pub revolve_segments: u32,
    /// Tessellation tolerance passed to the kernel
    pub tessellation_tolerance: f64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            backend: KernelBackend::Mesh,
            revolve_segments: 32,
            tessellation_tolerance: 0.1,
        }
    }
}

impl KernelConfig {
    pub fn with_backend(mut self, backend: KernelBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_revolve_segments(mut self, segments: u32) -> Self {
        self.revolve_segments = segments.max(3);
        self
    }

    /// Build the configured kernel
    pub fn build(&self) -> Box<dyn SolidKernel> {
        match self.backend {
            KernelBackend::Mesh => Box::new(MeshKernel::with_segments(self.revolve_segments)),
            KernelBackend::Null => Box::new(NullKernel),
        }
    }
}

/// Get the default solid kernel
pub fn default_kernel() -> Box<dyn SolidKernel> {
    KernelConfig::default().build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_backends() {
        assert_eq!(default_kernel().name(), "mesh");
        let null = KernelConfig::default()
            .with_backend(KernelBackend::Null)
            .build();
        assert!(!null.is_available());
    }
}
