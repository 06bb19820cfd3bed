//! Expression Engine
//!
//! Symbolic expression trees over sketch parameters. Constraints compile
//! into residual expressions; the solver evaluates them and their exact
//! partial derivatives.

mod vector;

pub use vector::{ExprQuaternion, ExprVector};

use std::ops;

use crate::handle::ParamId;

/// A symbolic expression over parameters
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(f64),
    Param(ParamId),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Sqrt(Box<Expr>),
    Square(Box<Expr>),
    Sin(Box<Expr>),
    Cos(Box<Expr>),
    ASin(Box<Expr>),
    ACos(Box<Expr>),
}

impl Expr {
    /// A constant
    pub fn constant(value: f64) -> Self {
        Expr::Const(value)
    }

    /// A reference to a parameter
    pub fn param(param: ParamId) -> Self {
        Expr::Param(param)
    }

    /// The value of a constant expression
    pub fn as_const(&self) -> Option<f64> {
        match self {
            Expr::Const(v) => Some(*v),
            _ => None,
        }
    }

    // ============== Construction with folding ==============

    pub fn plus(self, rhs: Expr) -> Expr {
        match (self.as_const(), rhs.as_const()) {
            (Some(a), Some(b)) => Expr::Const(a + b),
            (Some(a), _) if a == 0.0 => rhs,
            (_, Some(b)) if b == 0.0 => self,
            _ => Expr::Add(Box::new(self), Box::new(rhs)),
        }
    }

    pub fn minus(self, rhs: Expr) -> Expr {
        match (self.as_const(), rhs.as_const()) {
            (Some(a), Some(b)) => Expr::Const(a - b),
            (_, Some(b)) if b == 0.0 => self,
            (Some(a), _) if a == 0.0 => rhs.negate(),
            _ => Expr::Sub(Box::new(self), Box::new(rhs)),
        }
    }

    pub fn times(self, rhs: Expr) -> Expr {
        match (self.as_const(), rhs.as_const()) {
            (Some(a), Some(b)) => Expr::Const(a * b),
            (Some(a), _) | (_, Some(a)) if a == 0.0 => Expr::Const(0.0),
            (Some(a), _) if a == 1.0 => rhs,
            (_, Some(b)) if b == 1.0 => self,
            (Some(a), _) if a == -1.0 => rhs.negate(),
            (_, Some(b)) if b == -1.0 => self.negate(),
            _ => Expr::Mul(Box::new(self), Box::new(rhs)),
        }
    }

    pub fn div(self, rhs: Expr) -> Expr {
        match (self.as_const(), rhs.as_const()) {
            (Some(a), Some(b)) => Expr::Const(a / b),
            (_, Some(b)) if b == 1.0 => self,
            (Some(a), _) if a == 0.0 => Expr::Const(0.0),
            _ => Expr::Div(Box::new(self), Box::new(rhs)),
        }
    }

    pub fn negate(self) -> Expr {
        match self {
            Expr::Const(v) => Expr::Const(-v),
            Expr::Neg(inner) => *inner,
            other => Expr::Neg(Box::new(other)),
        }
    }

    pub fn sqrt(self) -> Expr {
        match self.as_const() {
            Some(v) => Expr::Const(v.sqrt()),
            None => Expr::Sqrt(Box::new(self)),
        }
    }

    pub fn square(self) -> Expr {
        match self.as_const() {
            Some(v) => Expr::Const(v * v),
            None => Expr::Square(Box::new(self)),
        }
    }

    pub fn sin(self) -> Expr {
        match self.as_const() {
            Some(v) => Expr::Const(v.sin()),
            None => Expr::Sin(Box::new(self)),
        }
    }

    pub fn cos(self) -> Expr {
        match self.as_const() {
            Some(v) => Expr::Const(v.cos()),
            None => Expr::Cos(Box::new(self)),
        }
    }

    pub fn asin(self) -> Expr {
        match self.as_const() {
            Some(v) => Expr::Const(v.asin()),
            None => Expr::ASin(Box::new(self)),
        }
    }

    pub fn acos(self) -> Expr {
        match self.as_const() {
            Some(v) => Expr::Const(v.acos()),
            None => Expr::ACos(Box::new(self)),
        }
    }

    // ============== Evaluation ==============

    /// Evaluate numerically, looking parameters up through `lookup`
    pub fn eval(&self, lookup: &impl Fn(ParamId) -> f64) -> f64 {
        match self {
            Expr::Const(v) => *v,
            Expr::Param(p) => lookup(*p),
            Expr::Add(a, b) => a.eval(lookup) + b.eval(lookup),
            Expr::Sub(a, b) => a.eval(lookup) - b.eval(lookup),
            Expr::Mul(a, b) => a.eval(lookup) * b.eval(lookup),
            Expr::Div(a, b) => a.eval(lookup) / b.eval(lookup),
            Expr::Neg(a) => -a.eval(lookup),
            Expr::Sqrt(a) => a.eval(lookup).sqrt(),
            Expr::Square(a) => {
                let v = a.eval(lookup);
                v * v
            }
            Expr::Sin(a) => a.eval(lookup).sin(),
            Expr::Cos(a) => a.eval(lookup).cos(),
            Expr::ASin(a) => a.eval(lookup).asin(),
            Expr::ACos(a) => a.eval(lookup).acos(),
        }
    }

    /// Check whether the expression mentions a parameter
    pub fn depends_on(&self, param: ParamId) -> bool {
        match self {
            Expr::Const(_) => false,
            Expr::Param(p) => *p == param,
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) => {
                a.depends_on(param) || b.depends_on(param)
            }
            Expr::Neg(a)
            | Expr::Sqrt(a)
            | Expr::Square(a)
            | Expr::Sin(a)
            | Expr::Cos(a)
            | Expr::ASin(a)
            | Expr::ACos(a) => a.depends_on(param),
        }
    }

    /// All parameters mentioned, in first-seen order
    pub fn params(&self) -> Vec<ParamId> {
        let mut out = Vec::new();
        self.collect_params(&mut out);
        out
    }

    fn collect_params(&self, out: &mut Vec<ParamId>) {
        match self {
            Expr::Const(_) => {}
            Expr::Param(p) => {
                if !out.contains(p) {
                    out.push(*p);
                }
            }
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) => {
                a.collect_params(out);
                b.collect_params(out);
            }
            Expr::Neg(a)
            | Expr::Sqrt(a)
            | Expr::Square(a)
            | Expr::Sin(a)
            | Expr::Cos(a)
            | Expr::ASin(a)
            | Expr::ACos(a) => a.collect_params(out),
        }
    }

    /// Partial derivative with respect to one parameter, constant folded
    pub fn partial(&self, param: ParamId) -> Expr {
        if !self.depends_on(param) {
            return Expr::Const(0.0);
        }
        match self {
            Expr::Const(_) => Expr::Const(0.0),
            Expr::Param(p) => Expr::Const(if *p == param { 1.0 } else { 0.0 }),
            Expr::Add(a, b) => a.partial(param).plus(b.partial(param)),
            Expr::Sub(a, b) => a.partial(param).minus(b.partial(param)),
            Expr::Mul(a, b) => {
                let da = a.partial(param).times((**b).clone());
                let db = (**a).clone().times(b.partial(param));
                da.plus(db)
            }
            Expr::Div(a, b) => {
                let num = a
                    .partial(param)
                    .times((**b).clone())
                    .minus((**a).clone().times(b.partial(param)));
                num.div((**b).clone().square())
            }
            Expr::Neg(a) => a.partial(param).negate(),
            Expr::Sqrt(a) => a
                .partial(param)
                .div(Expr::Const(2.0).times(self.clone())),
            Expr::Square(a) => Expr::Const(2.0)
                .times((**a).clone())
                .times(a.partial(param)),
            Expr::Sin(a) => (**a).clone().cos().times(a.partial(param)),
            Expr::Cos(a) => (**a).clone().sin().times(a.partial(param)).negate(),
            Expr::ASin(a) => a
                .partial(param)
                .div(Expr::Const(1.0).minus((**a).clone().square()).sqrt()),
            Expr::ACos(a) => a
                .partial(param)
                .div(Expr::Const(1.0).minus((**a).clone().square()).sqrt())
                .negate(),
        }
    }

    /// Replace parameters for which `known` returns a value by constants
    pub fn substitute(&self, known: &impl Fn(ParamId) -> Option<f64>) -> Expr {
        match self {
            Expr::Const(v) => Expr::Const(*v),
            Expr::Param(p) => match known(*p) {
                Some(v) => Expr::Const(v),
                None => Expr::Param(*p),
            },
            Expr::Add(a, b) => a.substitute(known).plus(b.substitute(known)),
            Expr::Sub(a, b) => a.substitute(known).minus(b.substitute(known)),
            Expr::Mul(a, b) => a.substitute(known).times(b.substitute(known)),
            Expr::Div(a, b) => a.substitute(known).div(b.substitute(known)),
            Expr::Neg(a) => a.substitute(known).negate(),
            Expr::Sqrt(a) => a.substitute(known).sqrt(),
            Expr::Square(a) => a.substitute(known).square(),
            Expr::Sin(a) => a.substitute(known).sin(),
            Expr::Cos(a) => a.substitute(known).cos(),
            Expr::ASin(a) => a.substitute(known).asin(),
            Expr::ACos(a) => a.substitute(known).acos(),
        }
    }

    /// Rebuild the tree, folding constant subtrees
    pub fn fold_constants(&self) -> Expr {
        self.substitute(&|_| None)
    }

    /// Number of nodes in the tree
    pub fn node_count(&self) -> usize {
        match self {
            Expr::Const(_) | Expr::Param(_) => 1,
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) => {
                1 + a.node_count() + b.node_count()
            }
            Expr::Neg(a)
            | Expr::Sqrt(a)
            | Expr::Square(a)
            | Expr::Sin(a)
            | Expr::Cos(a)
            | Expr::ASin(a)
            | Expr::ACos(a) => 1 + a.node_count(),
        }
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::Const(value)
    }
}

impl From<ParamId> for Expr {
    fn from(param: ParamId) -> Self {
        Expr::Param(param)
    }
}

impl ops::Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        self.plus(rhs)
    }
}

impl ops::Sub for Expr {
    type Output = Expr;

    fn sub(self, rhs: Expr) -> Expr {
        self.minus(rhs)
    }
}

impl ops::Mul for Expr {
    type Output = Expr;

    fn mul(self, rhs: Expr) -> Expr {
        self.times(rhs)
    }
}

impl ops::Div for Expr {
    type Output = Expr;

    fn div(self, rhs: Expr) -> Expr {
        Expr::div(self, rhs)
    }
}

impl ops::Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        self.negate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::RequestId;
    use approx::assert_relative_eq;

    fn p(i: u32) -> ParamId {
        ParamId::request(RequestId(1), i)
    }

    fn lookup(values: &[f64]) -> impl Fn(ParamId) -> f64 + '_ {
        move |param: ParamId| values[param.index as usize]
    }

    #[test]
    fn test_constant_folding() {
        let e = Expr::constant(2.0).times(Expr::constant(3.0)).plus(Expr::constant(1.0));
        assert_eq!(e, Expr::Const(7.0));

        let x = Expr::param(p(0));
        assert_eq!(x.clone().times(Expr::constant(1.0)), x);
        assert_eq!(x.clone().plus(Expr::constant(0.0)), x);
        assert_eq!(x.clone().times(Expr::constant(0.0)), Expr::Const(0.0));
        assert_eq!(x.clone().negate().negate(), x);
    }

    #[test]
    fn test_eval() {
        let x = Expr::param(p(0));
        let y = Expr::param(p(1));
        let e = (x.clone() * x + y.square()).sqrt();
        let values = [3.0, 4.0];
        assert_relative_eq!(e.eval(&lookup(&values)), 5.0);
    }

    #[test]
    fn test_partial_matches_finite_difference() {
        let x = Expr::param(p(0));
        let y = Expr::param(p(1));
        let e = (x.clone().sin() * y.clone()) / (Expr::constant(1.0) + y.clone().square())
            - (x.clone() * Expr::constant(0.3)).acos()
            + (y.clone() * Expr::constant(0.2)).asin() * x.clone().cos();

        let values = [0.7, 1.3];
        let h = 1e-6;
        for i in 0..2 {
            let analytic = e.partial(p(i as u32)).eval(&lookup(&values));
            let mut plus = values;
            let mut minus = values;
            plus[i] += h;
            minus[i] -= h;
            let numeric = (e.eval(&lookup(&plus)) - e.eval(&lookup(&minus))) / (2.0 * h);
            assert_relative_eq!(analytic, numeric, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_partial_of_independent_is_zero() {
        let e = Expr::param(p(0)).square();
        assert_eq!(e.partial(p(1)), Expr::Const(0.0));
    }

    #[test]
    fn test_substitute_and_params() {
        let e = Expr::param(p(0)) * Expr::param(p(1)) + Expr::param(p(0));
        assert_eq!(e.params(), vec![p(0), p(1)]);

        let s = e.substitute(&|param| (param == p(1)).then_some(2.0));
        assert_eq!(s.params(), vec![p(0)]);
        assert_relative_eq!(s.eval(&lookup(&[5.0, 0.0])), 15.0);
    }

    #[test]
    fn test_division_by_zero_is_not_finite() {
        let e = Expr::constant(1.0) / (Expr::param(p(0)) - Expr::param(p(0)));
        assert!(!e.eval(&lookup(&[2.0])).is_finite());
    }
}
