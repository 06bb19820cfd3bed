//! Engine configuration
//!
//! One serializable bundle for every tunable of the engine. Missing
//! fields take their defaults, so a RON file only names what it changes.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::curve::TangentArcConfig;
use crate::group::LoopConfig;
use crate::kernel::KernelConfig;
use crate::solver::SolverConfig;

/// Error type for configuration files
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Deserialization error: {0}")]
    Deserialize(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub solver: SolverConfig,
    pub tangent_arc: TangentArcConfig,
    pub loops: LoopConfig,
    pub kernel: KernelConfig,
}

impl EngineConfig {
    pub fn with_solver(mut self, solver: SolverConfig) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_tangent_arc(mut self, tangent_arc: TangentArcConfig) -> Self {
        self.tangent_arc = tangent_arc;
        self
    }

    pub fn with_loops(mut self, loops: LoopConfig) -> Self {
        self.loops = loops;
        self
    }

    pub fn with_kernel(mut self, kernel: KernelConfig) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn to_ron(&self) -> Result<String, ConfigError> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    pub fn from_ron(content: &str) -> Result<Self, ConfigError> {
        ron::from_str(content).map_err(|e| ConfigError::Deserialize(e.to_string()))
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_ron(&content)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        std::fs::write(path.as_ref(), self.to_ron()?).map_err(|e| ConfigError::Io(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelBackend;

    #[test]
    fn test_ron_round_trip() {
        let config = EngineConfig::default()
            .with_solver(SolverConfig::default().with_max_iterations(12))
            .with_loops(LoopConfig::default().with_chord_tolerance(0.5))
            .with_kernel(KernelConfig::default().with_backend(KernelBackend::Null));
        let text = config.to_ron().unwrap();
        assert_eq!(EngineConfig::from_ron(&text).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = EngineConfig::from_ron("(solver: (max_iterations: 7))").unwrap();
        assert_eq!(config.solver.max_iterations, 7);
        assert_eq!(config.solver.damping, SolverConfig::default().damping);
        assert_eq!(config.loops, LoopConfig::default());
        assert!(EngineConfig::from_ron("(solver: 3)").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.ron");
        let config = EngineConfig::default()
            .with_tangent_arc(TangentArcConfig::default().with_iterations(200));
        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
        assert!(matches!(
            EngineConfig::load(dir.path().join("missing.ron")),
            Err(ConfigError::Io(_))
        ));
    }
}
