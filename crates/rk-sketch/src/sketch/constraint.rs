//! Sketch Constraints
//!
//! Defines geometric and dimensional constraints that can be applied
//! to sketch entities. Constraints refer to entities only by handle.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::SketchError;
use crate::handle::{ConstraintId, EntityId, GroupId, Keyed, ParamId};

/// Constraint-related errors
#[derive(Debug, Clone, Error)]
pub enum ConstraintError {
    #[error("Sketch error: {0}")]
    Sketch(#[from] SketchError),

    #[error("{constraint}: entity {entity} must be a {expected}")]
    WrongEntity {
        constraint: &'static str,
        entity: EntityId,
        expected: &'static str,
    },

    #[error("{0} constraint requires a workplane")]
    WorkplaneRequired(&'static str),

    #[error("Degenerate geometry: {0}")]
    Degenerate(String),

    #[error("Curves do not share an endpoint")]
    NoSharedEndpoint,

    #[error("Constraint not found: {0}")]
    NotFound(ConstraintId),

    #[error("Invalid constraint: {0}")]
    Invalid(String),
}

/// Result type for constraint operations
pub type ConstraintResult<T> = Result<T, ConstraintError>;

/// Which end of an arc or cubic a tangency applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ArcEnd {
    #[default]
    Start,
    Finish,
}

/// Which ends of two curves meet in a curve-curve tangency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TangentEnds {
    #[default]
    StartToStart,
    StartToFinish,
    FinishToStart,
    FinishToFinish,
}

impl TangentEnds {
    pub fn from_ends(first: ArcEnd, second: ArcEnd) -> Self {
        match (first, second) {
            (ArcEnd::Start, ArcEnd::Start) => TangentEnds::StartToStart,
            (ArcEnd::Start, ArcEnd::Finish) => TangentEnds::StartToFinish,
            (ArcEnd::Finish, ArcEnd::Start) => TangentEnds::FinishToStart,
            (ArcEnd::Finish, ArcEnd::Finish) => TangentEnds::FinishToFinish,
        }
    }

    /// End of the first curve
    pub fn first(&self) -> ArcEnd {
        match self {
            TangentEnds::StartToStart | TangentEnds::StartToFinish => ArcEnd::Start,
            TangentEnds::FinishToStart | TangentEnds::FinishToFinish => ArcEnd::Finish,
        }
    }

    /// End of the second curve
    pub fn second(&self) -> ArcEnd {
        match self {
            TangentEnds::StartToStart | TangentEnds::FinishToStart => ArcEnd::Start,
            TangentEnds::StartToFinish | TangentEnds::FinishToFinish => ArcEnd::Finish,
        }
    }
}

/// The kinds of constraint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstraintKind {
    // ============== Points ==============
    /// Two points are at the same location
    PointsCoincident { a: EntityId, b: EntityId },
    /// Distance between two points
    PtPtDistance {
        a: EntityId,
        b: EntityId,
        distance: f64,
    },
    /// Distance between two points measured along a line
    ProjPtDistance {
        a: EntityId,
        b: EntityId,
        along: EntityId,
        distance: f64,
    },
    /// Signed distance of a point from a workplane
    PtPlaneDistance {
        point: EntityId,
        plane: EntityId,
        distance: f64,
    },
    /// Signed distance of a point from a face
    PtFaceDistance {
        point: EntityId,
        face: EntityId,
        distance: f64,
    },
    /// Distance of a point from a line (signed within a workplane)
    PtLineDistance {
        point: EntityId,
        line: EntityId,
        distance: f64,
    },
    PtInPlane { point: EntityId, plane: EntityId },
    PtOnFace { point: EntityId, face: EntityId },
    PtOnLine { point: EntityId, line: EntityId },
    PtOnCircle { point: EntityId, circle: EntityId },

    // ============== Lengths ==============
    EqualLengthLines { a: EntityId, b: EntityId },
    LengthRatio {
        a: EntityId,
        b: EntityId,
        ratio: f64,
    },
    LengthDifference {
        a: EntityId,
        b: EntityId,
        difference: f64,
    },
    /// Line length equals the distance from a point to another line
    EqualLengthPointLineDistance {
        line: EntityId,
        point: EntityId,
        other_line: EntityId,
    },
    EqualPointLineDistances {
        point_a: EntityId,
        line_a: EntityId,
        point_b: EntityId,
        line_b: EntityId,
    },
    EqualLineArcLen { line: EntityId, arc: EntityId },
    ArcArcLenRatio {
        a: EntityId,
        b: EntityId,
        ratio: f64,
    },
    ArcLineLenRatio {
        arc: EntityId,
        line: EntityId,
        ratio: f64,
    },
    ArcArcDifference {
        a: EntityId,
        b: EntityId,
        difference: f64,
    },
    ArcLineDifference {
        arc: EntityId,
        line: EntityId,
        difference: f64,
    },
    EqualRadius { a: EntityId, b: EntityId },
    Diameter { circle: EntityId, diameter: f64 },

    // ============== Symmetry ==============
    /// Points mirrored about a plane
    Symmetric {
        a: EntityId,
        b: EntityId,
        plane: EntityId,
    },
    /// Points mirrored about the workplane's vertical axis
    SymmetricHoriz { a: EntityId, b: EntityId },
    /// Points mirrored about the workplane's horizontal axis
    SymmetricVert { a: EntityId, b: EntityId },
    /// Points mirrored about a line
    SymmetricLine {
        a: EntityId,
        b: EntityId,
        line: EntityId,
    },
    AtMidpoint { point: EntityId, line: EntityId },

    // ============== Orientation ==============
    Horizontal { line: EntityId },
    Vertical { line: EntityId },
    /// Two normals describe the same orientation
    SameOrientation { a: EntityId, b: EntityId },
    /// Angle between two lines, in degrees
    Angle {
        a: EntityId,
        b: EntityId,
        degrees: f64,
        supplementary: bool,
    },
    /// Angle a-b equals angle c-d
    EqualAngle {
        a: EntityId,
        b: EntityId,
        c: EntityId,
        d: EntityId,
        supplementary: bool,
    },
    Parallel { a: EntityId, b: EntityId },
    Perpendicular { a: EntityId, b: EntityId },

    // ============== Tangency ==============
    ArcLineTangent {
        arc: EntityId,
        line: EntityId,
        end: ArcEnd,
    },
    CubicLineTangent {
        cubic: EntityId,
        line: EntityId,
        end: ArcEnd,
    },
    CurveCurveTangent {
        a: EntityId,
        b: EntityId,
        ends: TangentEnds,
    },

    // ============== Other ==============
    /// Pin a point where it currently is
    WhereDragged { point: EntityId },
    /// Annotation only
    Comment { text: String },
}

impl ConstraintKind {
    // ============== Factory functions ==============

    pub fn coincident(a: EntityId, b: EntityId) -> Self {
        ConstraintKind::PointsCoincident { a, b }
    }

    pub fn distance(a: EntityId, b: EntityId, distance: f64) -> Self {
        ConstraintKind::PtPtDistance { a, b, distance }
    }

    pub fn horizontal(line: EntityId) -> Self {
        ConstraintKind::Horizontal { line }
    }

    pub fn vertical(line: EntityId) -> Self {
        ConstraintKind::Vertical { line }
    }

    pub fn parallel(a: EntityId, b: EntityId) -> Self {
        ConstraintKind::Parallel { a, b }
    }

    pub fn perpendicular(a: EntityId, b: EntityId) -> Self {
        ConstraintKind::Perpendicular { a, b }
    }

    pub fn point_on_line(point: EntityId, line: EntityId) -> Self {
        ConstraintKind::PtOnLine { point, line }
    }

    pub fn point_on_circle(point: EntityId, circle: EntityId) -> Self {
        ConstraintKind::PtOnCircle { point, circle }
    }

    pub fn equal_length(a: EntityId, b: EntityId) -> Self {
        ConstraintKind::EqualLengthLines { a, b }
    }

    pub fn equal_radius(a: EntityId, b: EntityId) -> Self {
        ConstraintKind::EqualRadius { a, b }
    }

    pub fn diameter(circle: EntityId, diameter: f64) -> Self {
        ConstraintKind::Diameter { circle, diameter }
    }

    pub fn angle(a: EntityId, b: EntityId, degrees: f64) -> Self {
        ConstraintKind::Angle {
            a,
            b,
            degrees,
            supplementary: false,
        }
    }

    pub fn midpoint(point: EntityId, line: EntityId) -> Self {
        ConstraintKind::AtMidpoint { point, line }
    }

    pub fn where_dragged(point: EntityId) -> Self {
        ConstraintKind::WhereDragged { point }
    }

    pub fn comment(text: impl Into<String>) -> Self {
        ConstraintKind::Comment { text: text.into() }
    }

    // ============== Queries ==============

    /// Get the type name for display
    pub fn type_name(&self) -> &'static str {
        match self {
            ConstraintKind::PointsCoincident { .. } => "Coincident",
            ConstraintKind::PtPtDistance { .. } => "Distance",
            ConstraintKind::ProjPtDistance { .. } => "Projected Distance",
            ConstraintKind::PtPlaneDistance { .. } => "Point-Plane Distance",
            ConstraintKind::PtFaceDistance { .. } => "Point-Face Distance",
            ConstraintKind::PtLineDistance { .. } => "Point-Line Distance",
            ConstraintKind::PtInPlane { .. } => "Point in Plane",
            ConstraintKind::PtOnFace { .. } => "Point on Face",
            ConstraintKind::PtOnLine { .. } => "Point on Line",
            ConstraintKind::PtOnCircle { .. } => "Point on Circle",
            ConstraintKind::EqualLengthLines { .. } => "Equal Length",
            ConstraintKind::LengthRatio { .. } => "Length Ratio",
            ConstraintKind::LengthDifference { .. } => "Length Difference",
            ConstraintKind::EqualLengthPointLineDistance { .. } => "Equal Length and Distance",
            ConstraintKind::EqualPointLineDistances { .. } => "Equal Point-Line Distances",
            ConstraintKind::EqualLineArcLen { .. } => "Equal Line and Arc Length",
            ConstraintKind::ArcArcLenRatio { .. } => "Arc Length Ratio",
            ConstraintKind::ArcLineLenRatio { .. } => "Arc-Line Length Ratio",
            ConstraintKind::ArcArcDifference { .. } => "Arc Length Difference",
            ConstraintKind::ArcLineDifference { .. } => "Arc-Line Length Difference",
            ConstraintKind::EqualRadius { .. } => "Equal Radius",
            ConstraintKind::Diameter { .. } => "Diameter",
            ConstraintKind::Symmetric { .. } => "Symmetric",
            ConstraintKind::SymmetricHoriz { .. } => "Symmetric Horizontal",
            ConstraintKind::SymmetricVert { .. } => "Symmetric Vertical",
            ConstraintKind::SymmetricLine { .. } => "Symmetric about Line",
            ConstraintKind::AtMidpoint { .. } => "Midpoint",
            ConstraintKind::Horizontal { .. } => "Horizontal",
            ConstraintKind::Vertical { .. } => "Vertical",
            ConstraintKind::SameOrientation { .. } => "Same Orientation",
            ConstraintKind::Angle { .. } => "Angle",
            ConstraintKind::EqualAngle { .. } => "Equal Angle",
            ConstraintKind::Parallel { .. } => "Parallel",
            ConstraintKind::Perpendicular { .. } => "Perpendicular",
            ConstraintKind::ArcLineTangent { .. } => "Arc-Line Tangent",
            ConstraintKind::CubicLineTangent { .. } => "Cubic-Line Tangent",
            ConstraintKind::CurveCurveTangent { .. } => "Curve-Curve Tangent",
            ConstraintKind::WhereDragged { .. } => "Where Dragged",
            ConstraintKind::Comment { .. } => "Comment",
        }
    }

    /// Get all entity IDs referenced by this constraint
    pub fn referenced_entities(&self) -> Vec<EntityId> {
        use ConstraintKind::*;
        match self {
            PointsCoincident { a, b }
            | EqualLengthLines { a, b }
            | LengthRatio { a, b, .. }
            | LengthDifference { a, b, .. }
            | ArcArcLenRatio { a, b, .. }
            | ArcArcDifference { a, b, .. }
            | EqualRadius { a, b }
            | SymmetricHoriz { a, b }
            | SymmetricVert { a, b }
            | SameOrientation { a, b }
            | Angle { a, b, .. }
            | Parallel { a, b }
            | Perpendicular { a, b }
            | CurveCurveTangent { a, b, .. }
            | PtPtDistance { a, b, .. } => vec![*a, *b],
            ProjPtDistance { a, b, along, .. } => vec![*a, *b, *along],
            PtPlaneDistance { point, plane, .. } | PtInPlane { point, plane } => {
                vec![*point, *plane]
            }
            PtFaceDistance { point, face, .. } | PtOnFace { point, face } => vec![*point, *face],
            PtLineDistance { point, line, .. }
            | PtOnLine { point, line }
            | AtMidpoint { point, line } => vec![*point, *line],
            PtOnCircle { point, circle } => vec![*point, *circle],
            EqualLengthPointLineDistance {
                line,
                point,
                other_line,
            } => vec![*line, *point, *other_line],
            EqualPointLineDistances {
                point_a,
                line_a,
                point_b,
                line_b,
            } => vec![*point_a, *line_a, *point_b, *line_b],
            EqualLineArcLen { line, arc }
            | ArcLineLenRatio { arc, line, .. }
            | ArcLineDifference { arc, line, .. }
            | ArcLineTangent { arc, line, .. } => vec![*line, *arc],
            CubicLineTangent { cubic, line, .. } => vec![*cubic, *line],
            Diameter { circle, .. } => vec![*circle],
            Symmetric { a, b, plane } => vec![*a, *b, *plane],
            SymmetricLine { a, b, line } => vec![*a, *b, *line],
            Horizontal { line } | Vertical { line } => vec![*line],
            EqualAngle { a, b, c, d, .. } => vec![*a, *b, *c, *d],
            WhereDragged { point } => vec![*point],
            Comment { .. } => Vec::new(),
        }
    }

    /// Check if this constraint references an entity
    pub fn references_entity(&self, entity: EntityId) -> bool {
        self.referenced_entities().contains(&entity)
    }

    /// Mutable access to the fields that hold points
    pub fn point_fields_mut(&mut self) -> Vec<&mut EntityId> {
        use ConstraintKind::*;
        match self {
            PointsCoincident { a, b }
            | PtPtDistance { a, b, .. }
            | ProjPtDistance { a, b, .. }
            | Symmetric { a, b, .. }
            | SymmetricHoriz { a, b }
            | SymmetricVert { a, b }
            | SymmetricLine { a, b, .. } => vec![a, b],
            PtPlaneDistance { point, .. }
            | PtFaceDistance { point, .. }
            | PtLineDistance { point, .. }
            | PtInPlane { point, .. }
            | PtOnFace { point, .. }
            | PtOnLine { point, .. }
            | PtOnCircle { point, .. }
            | EqualLengthPointLineDistance { point, .. }
            | AtMidpoint { point, .. }
            | WhereDragged { point } => vec![point],
            EqualPointLineDistances {
                point_a, point_b, ..
            } => vec![point_a, point_b],
            _ => Vec::new(),
        }
    }

    /// The fields that hold points
    pub fn point_fields(&self) -> Vec<EntityId> {
        let mut copy = self.clone();
        copy.point_fields_mut().into_iter().map(|p| *p).collect()
    }

    /// Check if this is a dimensional constraint (has a value)
    pub fn is_dimensional(&self) -> bool {
        self.value().is_some()
    }

    /// Get the value of a dimensional constraint
    pub fn value(&self) -> Option<f64> {
        use ConstraintKind::*;
        match self {
            PtPtDistance { distance, .. }
            | ProjPtDistance { distance, .. }
            | PtPlaneDistance { distance, .. }
            | PtFaceDistance { distance, .. }
            | PtLineDistance { distance, .. } => Some(*distance),
            LengthRatio { ratio, .. }
            | ArcArcLenRatio { ratio, .. }
            | ArcLineLenRatio { ratio, .. } => Some(*ratio),
            LengthDifference { difference, .. }
            | ArcArcDifference { difference, .. }
            | ArcLineDifference { difference, .. } => Some(*difference),
            Diameter { diameter, .. } => Some(*diameter),
            Angle { degrees, .. } => Some(*degrees),
            _ => None,
        }
    }

    /// Set the value of a dimensional constraint
    pub fn set_value(&mut self, new_value: f64) -> bool {
        use ConstraintKind::*;
        match self {
            PtPtDistance { distance, .. }
            | ProjPtDistance { distance, .. }
            | PtPlaneDistance { distance, .. }
            | PtFaceDistance { distance, .. }
            | PtLineDistance { distance, .. } => *distance = new_value,
            LengthRatio { ratio, .. }
            | ArcArcLenRatio { ratio, .. }
            | ArcLineLenRatio { ratio, .. } => *ratio = new_value,
            LengthDifference { difference, .. }
            | ArcArcDifference { difference, .. }
            | ArcLineDifference { difference, .. } => *difference = new_value,
            Diameter { diameter, .. } => *diameter = new_value,
            Angle { degrees, .. } => *degrees = new_value,
            _ => return false,
        }
        true
    }

    /// Constraints that only make sense inside a workplane
    pub fn requires_workplane(&self) -> bool {
        matches!(
            self,
            ConstraintKind::Horizontal { .. }
                | ConstraintKind::Vertical { .. }
                | ConstraintKind::SymmetricHoriz { .. }
                | ConstraintKind::SymmetricVert { .. }
                | ConstraintKind::SymmetricLine { .. }
                | ConstraintKind::ArcLineTangent { .. }
                | ConstraintKind::CubicLineTangent { .. }
                | ConstraintKind::CurveCurveTangent { .. }
        )
    }

    /// Number of helper parameters the equations need
    pub fn helper_param_count(&self, workplane: Option<EntityId>) -> u32 {
        match self {
            ConstraintKind::PtOnLine { .. } | ConstraintKind::Parallel { .. }
                if workplane.is_none() =>
            {
                1
            }
            ConstraintKind::SameOrientation { .. } => 1,
            _ => 0,
        }
    }
}

/// A constraint between sketch entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub id: ConstraintId,
    pub group: GroupId,
    /// Workplane the constraint is projected into
    pub workplane: Option<EntityId>,
    pub kind: ConstraintKind,
    /// Reference dimensions are measured, never enforced
    #[serde(default)]
    pub reference: bool,
}

impl Keyed for Constraint {
    type Key = ConstraintId;

    fn key(&self) -> ConstraintId {
        self.id
    }
}

impl Constraint {
    /// Helper parameters owned by this constraint
    pub fn helper_params(&self) -> Vec<ParamId> {
        (0..self.kind.helper_param_count(self.workplane))
            .map(|i| ParamId::constraint(self.id, i))
            .collect()
    }

    /// Get the type name for display
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}
