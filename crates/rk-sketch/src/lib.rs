//! Parametric Sketch Constraint Engine
//!
//! This crate provides:
//! - Typed handles for groups, requests, entities, params and equations
//! - Symbolic expressions with partial derivatives
//! - Constraint compilation into residual equations
//! - Newton-Raphson solver with banded and dense linear solves
//! - Group regeneration: derived geometry, closed loops and solids
//! - Curve edits (tangent arcs, splitting)

pub mod config;
pub mod curve;
pub mod expr;
pub mod group;
pub mod handle;
pub mod kernel;
pub mod regen;
pub mod sketch;
pub mod solver;

// Re-exports for convenience
pub use config::{ConfigError, EngineConfig};
pub use curve::{
    CurveError, CurveResult, ParametricCurve, RadiusPolicy, SplitSelection, TangentArcConfig,
    TangentArcMode, TangentArcOptions, fit_tangent_arc, split_entities,
};
pub use expr::{Expr, ExprQuaternion, ExprVector};
pub use group::{CombineAs, Group, GroupFailure, GroupKind, LoopConfig, PolyError, Sides};
pub use handle::{ConstraintId, EntityId, EquationId, GroupId, ParamId, RequestId};
pub use kernel::{CadError, CadResult, KernelConfig, MeshKernel, NullKernel, SolidKernel};
pub use regen::{RegenError, RegenReport, RegenResult, Regenerator};
pub use sketch::{
    Constraint, ConstraintError, ConstraintKind, Entity, EntityKind, Request, RequestKind, Sketch,
    SketchError, SketchResult,
};
pub use solver::{SolveOutcome, SolveStatus, SolverConfig, solve_group};
