//! Symbolic vectors and quaternions built from [`Expr`] components.

use glam::{DQuat, DVec3};

use super::Expr;
use crate::handle::ParamId;

/// A 3-vector of expressions
#[derive(Debug, Clone, PartialEq)]
pub struct ExprVector {
    pub x: Expr,
    pub y: Expr,
    pub z: Expr,
}

impl ExprVector {
    pub fn new(x: Expr, y: Expr, z: Expr) -> Self {
        Self { x, y, z }
    }

    pub fn from_params(params: [ParamId; 3]) -> Self {
        Self::new(
            Expr::param(params[0]),
            Expr::param(params[1]),
            Expr::param(params[2]),
        )
    }

    pub fn from_vec(v: DVec3) -> Self {
        Self::new(Expr::constant(v.x), Expr::constant(v.y), Expr::constant(v.z))
    }

    pub fn zero() -> Self {
        Self::from_vec(DVec3::ZERO)
    }

    pub fn plus(&self, other: &ExprVector) -> ExprVector {
        ExprVector::new(
            self.x.clone().plus(other.x.clone()),
            self.y.clone().plus(other.y.clone()),
            self.z.clone().plus(other.z.clone()),
        )
    }

    pub fn minus(&self, other: &ExprVector) -> ExprVector {
        ExprVector::new(
            self.x.clone().minus(other.x.clone()),
            self.y.clone().minus(other.y.clone()),
            self.z.clone().minus(other.z.clone()),
        )
    }

    pub fn scaled_by(&self, s: &Expr) -> ExprVector {
        ExprVector::new(
            self.x.clone().times(s.clone()),
            self.y.clone().times(s.clone()),
            self.z.clone().times(s.clone()),
        )
    }

    pub fn negated(&self) -> ExprVector {
        ExprVector::new(
            self.x.clone().negate(),
            self.y.clone().negate(),
            self.z.clone().negate(),
        )
    }

    pub fn dot(&self, other: &ExprVector) -> Expr {
        self.x
            .clone()
            .times(other.x.clone())
            .plus(self.y.clone().times(other.y.clone()))
            .plus(self.z.clone().times(other.z.clone()))
    }

    pub fn cross(&self, other: &ExprVector) -> ExprVector {
        ExprVector::new(
            self.y
                .clone()
                .times(other.z.clone())
                .minus(self.z.clone().times(other.y.clone())),
            self.z
                .clone()
                .times(other.x.clone())
                .minus(self.x.clone().times(other.z.clone())),
            self.x
                .clone()
                .times(other.y.clone())
                .minus(self.y.clone().times(other.x.clone())),
        )
    }

    pub fn magnitude(&self) -> Expr {
        self.x
            .clone()
            .square()
            .plus(self.y.clone().square())
            .plus(self.z.clone().square())
            .sqrt()
    }

    /// Same direction, given length
    pub fn with_magnitude(&self, length: &Expr) -> ExprVector {
        let scale = length.clone().div(self.magnitude());
        self.scaled_by(&scale)
    }

    pub fn eval(&self, lookup: &impl Fn(ParamId) -> f64) -> DVec3 {
        DVec3::new(self.x.eval(lookup), self.y.eval(lookup), self.z.eval(lookup))
    }
}

/// A quaternion of expressions, `w + xi + yj + zk`
///
/// Normals are stored as rotations; their `u`, `v` and `n` basis vectors
/// are the images of the X, Y and Z axes.
#[derive(Debug, Clone, PartialEq)]
pub struct ExprQuaternion {
    pub w: Expr,
    pub x: Expr,
    pub y: Expr,
    pub z: Expr,
}

impl ExprQuaternion {
    /// Build from parameters in `w, x, y, z` order
    pub fn from_params(params: [ParamId; 4]) -> Self {
        Self {
            w: Expr::param(params[0]),
            x: Expr::param(params[1]),
            y: Expr::param(params[2]),
            z: Expr::param(params[3]),
        }
    }

    pub fn from_quat(q: DQuat) -> Self {
        Self {
            w: Expr::constant(q.w),
            x: Expr::constant(q.x),
            y: Expr::constant(q.y),
            z: Expr::constant(q.z),
        }
    }

    /// Rotation by `angle` about a unit `axis`
    pub fn from_axis_angle(axis: &ExprVector, angle: &Expr) -> Self {
        let half = angle.clone().div(Expr::constant(2.0));
        let s = half.clone().sin();
        Self {
            w: half.cos(),
            x: axis.x.clone().times(s.clone()),
            y: axis.y.clone().times(s.clone()),
            z: axis.z.clone().times(s),
        }
    }

    fn two(a: &Expr, b: &Expr) -> Expr {
        Expr::constant(2.0).times(a.clone().times(b.clone()))
    }

    pub fn rotation_u(&self) -> ExprVector {
        let (w, x, y, z) = (&self.w, &self.x, &self.y, &self.z);
        ExprVector::new(
            w.clone()
                .square()
                .plus(x.clone().square())
                .minus(y.clone().square())
                .minus(z.clone().square()),
            Self::two(w, z).plus(Self::two(x, y)),
            Self::two(x, z).minus(Self::two(w, y)),
        )
    }

    pub fn rotation_v(&self) -> ExprVector {
        let (w, x, y, z) = (&self.w, &self.x, &self.y, &self.z);
        ExprVector::new(
            Self::two(x, y).minus(Self::two(w, z)),
            w.clone()
                .square()
                .minus(x.clone().square())
                .plus(y.clone().square())
                .minus(z.clone().square()),
            Self::two(w, x).plus(Self::two(y, z)),
        )
    }

    pub fn rotation_n(&self) -> ExprVector {
        let (w, x, y, z) = (&self.w, &self.x, &self.y, &self.z);
        ExprVector::new(
            Self::two(w, y).plus(Self::two(x, z)),
            Self::two(y, z).minus(Self::two(w, x)),
            w.clone()
                .square()
                .minus(x.clone().square())
                .minus(y.clone().square())
                .plus(z.clone().square()),
        )
    }

    /// Rotate a vector; assumes a unit quaternion
    pub fn rotate(&self, p: &ExprVector) -> ExprVector {
        self.rotation_u()
            .scaled_by(&p.x)
            .plus(&self.rotation_v().scaled_by(&p.y))
            .plus(&self.rotation_n().scaled_by(&p.z))
    }

    /// Hamilton product `self * other`
    pub fn times(&self, other: &ExprQuaternion) -> ExprQuaternion {
        let (w1, x1, y1, z1) = (&self.w, &self.x, &self.y, &self.z);
        let (w2, x2, y2, z2) = (&other.w, &other.x, &other.y, &other.z);
        let m = |a: &Expr, b: &Expr| a.clone().times(b.clone());
        ExprQuaternion {
            w: m(w1, w2).minus(m(x1, x2)).minus(m(y1, y2)).minus(m(z1, z2)),
            x: m(w1, x2).plus(m(x1, w2)).plus(m(y1, z2)).minus(m(z1, y2)),
            y: m(w1, y2).minus(m(x1, z2)).plus(m(y1, w2)).plus(m(z1, x2)),
            z: m(w1, z2).plus(m(x1, y2)).minus(m(y1, x2)).plus(m(z1, w2)),
        }
    }

    pub fn magnitude_squared(&self) -> Expr {
        self.w
            .clone()
            .square()
            .plus(self.x.clone().square())
            .plus(self.y.clone().square())
            .plus(self.z.clone().square())
    }

    pub fn eval(&self, lookup: &impl Fn(ParamId) -> f64) -> DQuat {
        DQuat::from_xyzw(
            self.x.eval(lookup),
            self.y.eval(lookup),
            self.z.eval(lookup),
            self.w.eval(lookup),
        )
    }
}
