//! The [`Number`] contract the evaluator is written against, with two
//! implementations: plain `f64` for value passes and [`Dual2`] for passes that
//! carry first and second derivatives with respect to one variable.
//!
//! Operator and density code is written once, generic over `Number`, and
//! instantiated at whichever type the current pass needs.

use statrs::function::gamma::{digamma, ln_gamma};
use std::fmt::Debug;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// A numeric type the graph can be evaluated over.
///
/// `is_definitely_zero` / `is_definitely_one` are conservative: they may
/// answer `false` for an actual zero or one, never `true` for anything else.
/// Callers only use them to skip work.
pub trait Number:
    Copy
    + Debug
    + From<f64>
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
{
    /// The primal value.
    fn value(&self) -> f64;

    fn pow(self, exponent: Self) -> Self;

    fn exp(self) -> Self;

    fn log(self) -> Self;

    fn atan(self) -> Self;

    /// Log-gamma. Not part of the arithmetic core, but every density with a
    /// shape parameter needs it.
    fn lgamma(self) -> Self;

    fn is_definitely_zero(&self) -> bool;

    fn is_definitely_one(&self) -> bool;
}

impl Number for f64 {
    #[inline]
    fn value(&self) -> f64 {
        *self
    }

    #[inline]
    fn pow(self, exponent: Self) -> Self {
        self.powf(exponent)
    }

    #[inline]
    fn exp(self) -> Self {
        f64::exp(self)
    }

    #[inline]
    fn log(self) -> Self {
        f64::ln(self)
    }

    #[inline]
    fn atan(self) -> Self {
        f64::atan(self)
    }

    #[inline]
    fn lgamma(self) -> Self {
        ln_gamma(self)
    }

    #[inline]
    fn is_definitely_zero(&self) -> bool {
        *self == 0.0
    }

    #[inline]
    fn is_definitely_one(&self) -> bool {
        *self == 1.0
    }
}

/// Value with first and second derivative with respect to a single variable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dual2 {
    pub val: f64,
    pub d1: f64,
    pub d2: f64,
}

impl Dual2 {
    #[inline]
    pub fn new(val: f64, d1: f64, d2: f64) -> Self {
        Self { val, d1, d2 }
    }

    /// The variable being differentiated against: d1 = 1, d2 = 0.
    #[inline]
    pub fn var(val: f64) -> Self {
        Self { val, d1: 1.0, d2: 0.0 }
    }

    #[inline]
    fn is_constant(&self) -> bool {
        self.d1 == 0.0 && self.d2 == 0.0
    }

    /// Apply a scalar function given f(v), f'(v), f''(v).
    #[inline]
    fn chain(self, f: f64, df: f64, ddf: f64) -> Self {
        Self {
            val: f,
            d1: df * self.d1,
            d2: ddf * self.d1 * self.d1 + df * self.d2,
        }
    }

    fn recip(self) -> Self {
        let v = self.val;
        self.chain(1.0 / v, -1.0 / (v * v), 2.0 / (v * v * v))
    }
}

impl From<f64> for Dual2 {
    #[inline]
    fn from(val: f64) -> Self {
        Self { val, d1: 0.0, d2: 0.0 }
    }
}

impl Add for Dual2 {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self::new(self.val + rhs.val, self.d1 + rhs.d1, self.d2 + rhs.d2)
    }
}

impl Sub for Dual2 {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.val - rhs.val, self.d1 - rhs.d1, self.d2 - rhs.d2)
    }
}

impl Mul for Dual2 {
    type Output = Self;
    #[inline]
    fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.val * rhs.val,
            self.d1 * rhs.val + self.val * rhs.d1,
            self.d2 * rhs.val + 2.0 * self.d1 * rhs.d1 + self.val * rhs.d2,
        )
    }
}

impl Div for Dual2 {
    type Output = Self;
    #[inline]
    fn div(self, rhs: Self) -> Self {
        if rhs.is_constant() {
            return Self::new(self.val / rhs.val, self.d1 / rhs.val, self.d2 / rhs.val);
        }
        self * rhs.recip()
    }
}

impl Neg for Dual2 {
    type Output = Self;
    #[inline]
    fn neg(self) -> Self {
        Self::new(-self.val, -self.d1, -self.d2)
    }
}

impl Number for Dual2 {
    #[inline]
    fn value(&self) -> f64 {
        self.val
    }

    fn pow(self, exponent: Self) -> Self {
        if exponent.is_constant() {
            // x^p keeps working for negative bases with integral p
            let p = exponent.val;
            let v = self.val;
            return self.chain(
                v.powf(p),
                p * v.powf(p - 1.0),
                p * (p - 1.0) * v.powf(p - 2.0),
            );
        }
        (exponent * self.log()).exp()
    }

    fn exp(self) -> Self {
        let e = self.val.exp();
        self.chain(e, e, e)
    }

    fn log(self) -> Self {
        let v = self.val;
        self.chain(v.ln(), 1.0 / v, -1.0 / (v * v))
    }

    fn atan(self) -> Self {
        let v = self.val;
        let q = 1.0 + v * v;
        self.chain(v.atan(), 1.0 / q, -2.0 * v / (q * q))
    }

    fn lgamma(self) -> Self {
        let v = self.val;
        if self.is_constant() {
            return Self::from(ln_gamma(v));
        }
        self.chain(ln_gamma(v), digamma(v), trigamma(v))
    }

    #[inline]
    fn is_definitely_zero(&self) -> bool {
        self.val == 0.0 && self.is_constant()
    }

    #[inline]
    fn is_definitely_one(&self) -> bool {
        self.val == 1.0 && self.is_constant()
    }
}

/// Second derivative of ln Γ, by recurrence up to x ≥ 10 and the asymptotic
/// series from there.
pub fn trigamma(x: f64) -> f64 {
    if x <= 0.0 && x == x.floor() {
        return f64::NAN;
    }
    let mut x = x;
    let mut acc = 0.0;
    while x < 10.0 {
        acc += 1.0 / (x * x);
        x += 1.0;
    }
    let x2 = 1.0 / (x * x);
    acc + 1.0 / x
        + x2 / 2.0
        + x2 / x * (1.0 / 6.0 - x2 * (1.0 / 30.0 - x2 * (1.0 / 42.0 - x2 * (1.0 / 30.0 - x2 * 5.0 / 66.0))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn check<F>(f: F, x: f64)
    where
        F: Fn(Dual2) -> Dual2,
    {
        let h = 1e-4;
        let at = |v: f64| f(Dual2::from(v)).val;
        let d = f(Dual2::var(x));
        let fd1 = (at(x + h) - at(x - h)) / (2.0 * h);
        let fd2 = (at(x + h) - 2.0 * at(x) + at(x - h)) / (h * h);
        assert_relative_eq!(d.d1, fd1, epsilon = 1e-5, max_relative = 1e-5);
        assert_relative_eq!(d.d2, fd2, epsilon = 1e-4, max_relative = 1e-3);
    }

    #[test]
    fn test_arithmetic_derivatives() {
        check(|x| x * x * x - Dual2::from(2.0) * x, 1.3);
        check(|x| Dual2::from(1.0) / (x + Dual2::from(0.5)), 0.7);
        check(|x| (x * x) / x.exp(), 2.1);
        check(|x| -x / (x * x + Dual2::from(1.0)), -0.4);
    }

    #[test]
    fn test_transcendental_derivatives() {
        check(|x| x.log() * x, 1.7);
        check(|x| x.atan(), 0.3);
        check(|x| x.lgamma(), 2.5);
        check(|x| x.lgamma(), 0.3);
        check(|x| x.pow(Dual2::from(2.5)), 1.1);
        check(|x| x.pow(x), 1.4);
        check(|x| Dual2::from(3.0).pow(x), 0.8);
    }

    #[test]
    fn test_integral_power_of_negative_base() {
        let d = Dual2::var(-2.0).pow(Dual2::from(2.0));
        assert_relative_eq!(d.val, 4.0);
        assert_relative_eq!(d.d1, -4.0);
        assert_relative_eq!(d.d2, 2.0);
    }

    #[test]
    fn test_trigamma_known_values() {
        // ψ1(1) = π²/6, ψ1(1/2) = π²/2
        let pi2 = std::f64::consts::PI * std::f64::consts::PI;
        assert_relative_eq!(trigamma(1.0), pi2 / 6.0, epsilon = 1e-10);
        assert_relative_eq!(trigamma(0.5), pi2 / 2.0, epsilon = 1e-10);
        assert_relative_eq!(trigamma(20.0), 0.051_270_822_935_203_12, epsilon = 1e-12);
    }

    #[test]
    fn test_conservative_predicates() {
        assert!(Dual2::from(0.0).is_definitely_zero());
        assert!(!Dual2::var(0.0).is_definitely_zero());
        assert!(Dual2::from(1.0).is_definitely_one());
        assert!(!Dual2::new(1.0, 0.0, 1.0).is_definitely_one());
        assert!(0.0f64.is_definitely_zero());
        assert!(!1e-300f64.is_definitely_zero());
    }
}
