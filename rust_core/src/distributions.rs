use crate::error::{NmcError, Result};
use crate::graph::ValueType;
use crate::number::Number;
use std::f64::consts::{PI, TAU};

/// Distribution families a stochastic node can follow. Parameters are the
/// node's parents, in the order listed on each variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Dist {
    /// Improper uniform density over a type; log-density 0.
    Flat(ValueType),
    /// (mu: real, sigma: positive real)
    Normal,
    /// (scale: positive real)
    HalfCauchy,
    /// (shape: positive real, rate: positive real)
    Gamma,
    /// (a: positive real, b: positive real)
    Beta,
    /// (p: probability)
    Bernoulli,
    /// (alpha: positive vector of length k), sampled on the k-simplex.
    Dirichlet,
}

impl Dist {
    /// Type of the values this distribution produces, given parameter types.
    pub fn sample_type(&self, params: &[ValueType]) -> Result<ValueType> {
        use ValueType::*;
        let (wanted, out): (&[ValueType], ValueType) = match self {
            Dist::Flat(ty) => (&[], *ty),
            Dist::Normal => (&[Real, PosReal], Real),
            Dist::HalfCauchy => (&[PosReal], PosReal),
            Dist::Gamma => (&[PosReal, PosReal], PosReal),
            Dist::Beta => (&[PosReal, PosReal], Probability),
            Dist::Bernoulli => (&[Probability], Boolean),
            Dist::Dirichlet => {
                return match params {
                    [Vector(k)] | [Simplex(k)] if *k >= 2 => Ok(Simplex(*k)),
                    _ => Err(NmcError::InvalidGraph(format!(
                        "Dirichlet expects one concentration vector of length >= 2, got {:?}",
                        params
                    ))),
                };
            }
        };
        if params == wanted {
            Ok(out)
        } else {
            Err(NmcError::InvalidGraph(format!(
                "{:?} expects parameters {:?}, got {:?}",
                self, wanted, params
            )))
        }
    }

    /// Log-density of `x` given parameter values, generic over the number
    /// type so the same code yields values or derivatives.
    pub fn log_prob<N: Number>(&self, x: &[N], params: &[Vec<N>]) -> N {
        let p = |i: usize| params[i][0];
        match self {
            Dist::Flat(_) => N::from(0.0),
            Dist::Normal => normal_log_prob(x[0], p(0), p(1)),
            Dist::HalfCauchy => half_cauchy_log_prob(x[0], p(0)),
            Dist::Gamma => gamma_log_prob(x[0], p(0), p(1)),
            Dist::Beta => beta_log_prob(x[0], p(0), p(1)),
            Dist::Bernoulli => bernoulli_log_prob(x[0], p(0)),
            Dist::Dirichlet => dirichlet_log_prob(x, &params[0]),
        }
    }
}

fn neg_inf<N: Number>() -> N {
    N::from(f64::NEG_INFINITY)
}

/// (k - 1) * log(x), skipping the log when the coefficient is exactly zero.
fn shape_term<N: Number>(k: N, x: N) -> N {
    let c = k - N::from(1.0);
    if c.is_definitely_zero() {
        N::from(0.0)
    } else {
        c * x.log()
    }
}

pub fn normal_log_prob<N: Number>(x: N, mu: N, sigma: N) -> N {
    let z = (x - mu) / sigma;
    N::from(-0.5) * z * z - sigma.log() - N::from(0.5 * TAU.ln())
}

pub fn half_cauchy_log_prob<N: Number>(x: N, scale: N) -> N {
    if x.value() < 0.0 {
        return neg_inf();
    }
    let z = x / scale;
    N::from((2.0 / PI).ln()) - scale.log() - (N::from(1.0) + z * z).log()
}

pub fn gamma_log_prob<N: Number>(x: N, shape: N, rate: N) -> N {
    if x.value() <= 0.0 {
        return neg_inf();
    }
    let norm = if rate.is_definitely_one() {
        -shape.lgamma()
    } else {
        shape * rate.log() - shape.lgamma()
    };
    norm + shape_term(shape, x) - rate * x
}

pub fn beta_log_prob<N: Number>(x: N, a: N, b: N) -> N {
    let v = x.value();
    if v <= 0.0 || v >= 1.0 {
        return neg_inf();
    }
    let y = N::from(1.0) - x;
    (a + b).lgamma() - a.lgamma() - b.lgamma() + shape_term(a, x) + shape_term(b, y)
}

pub fn bernoulli_log_prob<N: Number>(x: N, p: N) -> N {
    if x.value() > 0.5 {
        p.log()
    } else {
        (N::from(1.0) - p).log()
    }
}

pub fn dirichlet_log_prob<N: Number>(x: &[N], alpha: &[N]) -> N {
    if x.len() != alpha.len() || x.iter().any(|v| v.value() <= 0.0) {
        return neg_inf();
    }
    let mut total = N::from(0.0);
    let mut acc = N::from(0.0);
    for (&xi, &ai) in x.iter().zip(alpha.iter()) {
        total = total + ai;
        acc = acc + shape_term(ai, xi) - ai.lgamma();
    }
    acc + total.lgamma()
}
