//! Proposal distributions built from local gradient and curvature.
//!
//! Every proposer is a small mixture: a component fitted to the local
//! quadratic (in value or transformed space) plus a broad fallback that keeps
//! the proposal's support equal to the variable's domain. When the fit is not
//! usable (wrong curvature sign, non-finite derivatives) only the fallback is
//! used.

use crate::distributions::{beta_log_prob, gamma_log_prob, normal_log_prob};
use crate::graph::ValueType;
use crate::number::Dual2;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Beta, Distribution, Exp, Gamma, Normal};

/// Mixture weight of the fallback relative to a fitted component.
const FALLBACK_WEIGHT: f64 = 0.05;

/// Step scale of the fallback random walks.
const RANDOM_WALK_SCALE: f64 = 1.0;

#[derive(Debug, Clone)]
pub enum Component {
    Normal {
        mu: f64,
        sigma: f64,
        dist: Normal<f64>,
    },
    Gamma {
        shape: f64,
        rate: f64,
        dist: Gamma<f64>,
    },
    Beta {
        a: f64,
        b: f64,
        dist: Beta<f64>,
    },
    Exponential {
        rate: f64,
        dist: Exp<f64>,
    },
    /// Uniform on (0, 1).
    Uniform,
    /// Normal in log space, mapped back through `exp`.
    LogNormal {
        mu: f64,
        sigma: f64,
        dist: Normal<f64>,
    },
    /// Normal in logit space, mapped back through the logistic function.
    LogitNormal {
        mu: f64,
        sigma: f64,
        dist: Normal<f64>,
    },
}

fn finite_positive(x: f64) -> bool {
    x.is_finite() && x > 0.0
}

impl Component {
    pub fn normal(mu: f64, sigma: f64) -> Option<Self> {
        if !mu.is_finite() || !finite_positive(sigma) {
            return None;
        }
        let dist = Normal::new(mu, sigma).ok()?;
        Some(Component::Normal { mu, sigma, dist })
    }

    pub fn gamma(shape: f64, rate: f64) -> Option<Self> {
        if !finite_positive(shape) || !finite_positive(rate) {
            return None;
        }
        let dist = Gamma::new(shape, 1.0 / rate).ok()?;
        Some(Component::Gamma { shape, rate, dist })
    }

    pub fn beta(a: f64, b: f64) -> Option<Self> {
        if !finite_positive(a) || !finite_positive(b) {
            return None;
        }
        let dist = Beta::new(a, b).ok()?;
        Some(Component::Beta { a, b, dist })
    }

    pub fn exponential(rate: f64) -> Option<Self> {
        if !finite_positive(rate) {
            return None;
        }
        let dist = Exp::new(rate).ok()?;
        Some(Component::Exponential { rate, dist })
    }

    pub fn log_normal(mu: f64, sigma: f64) -> Option<Self> {
        match Self::normal(mu, sigma)? {
            Component::Normal { mu, sigma, dist } => Some(Component::LogNormal { mu, sigma, dist }),
            _ => None,
        }
    }

    pub fn logit_normal(mu: f64, sigma: f64) -> Option<Self> {
        match Self::normal(mu, sigma)? {
            Component::Normal { mu, sigma, dist } => {
                Some(Component::LogitNormal { mu, sigma, dist })
            }
            _ => None,
        }
    }

    pub fn sample(&self, rng: &mut ChaCha8Rng) -> f64 {
        match self {
            Component::Normal { dist, .. } => dist.sample(rng),
            Component::Gamma { dist, .. } => dist.sample(rng),
            Component::Beta { dist, .. } => dist.sample(rng),
            Component::Exponential { dist, .. } => dist.sample(rng),
            Component::Uniform => rng.gen::<f64>(),
            Component::LogNormal { dist, .. } => dist.sample(rng).exp(),
            Component::LogitNormal { dist, .. } => 1.0 / (1.0 + (-dist.sample(rng)).exp()),
        }
    }

    pub fn log_prob(&self, x: f64) -> f64 {
        match self {
            Component::Normal { mu, sigma, .. } => normal_log_prob(x, *mu, *sigma),
            Component::Gamma { shape, rate, .. } => gamma_log_prob(x, *shape, *rate),
            Component::Beta { a, b, .. } => beta_log_prob(x, *a, *b),
            Component::Exponential { rate, .. } => gamma_log_prob(x, 1.0, *rate),
            Component::Uniform => {
                if x > 0.0 && x < 1.0 {
                    0.0
                } else {
                    f64::NEG_INFINITY
                }
            }
            Component::LogNormal { mu, sigma, .. } => {
                if x <= 0.0 {
                    return f64::NEG_INFINITY;
                }
                let y = x.ln();
                normal_log_prob(y, *mu, *sigma) - y
            }
            Component::LogitNormal { mu, sigma, .. } => {
                if x <= 0.0 || x >= 1.0 {
                    return f64::NEG_INFINITY;
                }
                let jacobian = x * (1.0 - x);
                normal_log_prob((x / (1.0 - x)).ln(), *mu, *sigma) - jacobian.ln()
            }
        }
    }
}

/// Weighted mixture of components; weights sum to one.
#[derive(Debug, Clone)]
pub struct Mixture {
    parts: Vec<(f64, Component)>,
}

impl Mixture {
    fn new(fitted: Option<Component>, fallback: Component) -> Self {
        let parts = match fitted {
            Some(c) => {
                let total = 1.0 + FALLBACK_WEIGHT;
                vec![(1.0 / total, c), (FALLBACK_WEIGHT / total, fallback)]
            }
            None => vec![(1.0, fallback)],
        };
        Self { parts }
    }

    /// Whether the local fit succeeded.
    pub fn is_fitted(&self) -> bool {
        self.parts.len() > 1
    }

    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.parts.iter().map(|(_, c)| c)
    }

    pub fn sample(&self, rng: &mut ChaCha8Rng) -> f64 {
        let mut u = rng.gen::<f64>();
        for (w, c) in &self.parts {
            if u < *w {
                return c.sample(rng);
            }
            u -= w;
        }
        // rounding left u just past the last weight
        self.parts[self.parts.len() - 1].1.sample(rng)
    }

    pub fn log_prob(&self, x: f64) -> f64 {
        let terms: Vec<f64> = self
            .parts
            .iter()
            .map(|(w, c)| w.ln() + c.log_prob(x))
            .collect();
        log_sum_exp(&terms)
    }
}

fn log_sum_exp(terms: &[f64]) -> f64 {
    let max = terms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY || max.is_nan() {
        return max;
    }
    max + terms.iter().map(|t| (t - max).exp()).sum::<f64>().ln()
}

/// A proposal distribution over one scalar coordinate.
#[derive(Debug, Clone)]
pub enum Proposer {
    /// Fitted to the target's own value, first and second derivative.
    Gradient(Mixture),
    /// Proposes the unnormalized Gamma coordinate `component` of a Dirichlet
    /// variable.
    DirichletGamma { component: usize, inner: Mixture },
    /// Proposes the first coordinate of a two-component Dirichlet variable.
    DirichletBeta(Mixture),
}

impl Proposer {
    fn mixture(&self) -> &Mixture {
        match self {
            Proposer::Gradient(m) | Proposer::DirichletBeta(m) => m,
            Proposer::DirichletGamma { inner, .. } => inner,
        }
    }

    pub fn sample(&self, rng: &mut ChaCha8Rng) -> f64 {
        self.mixture().sample(rng)
    }

    pub fn log_prob(&self, x: f64) -> f64 {
        self.mixture().log_prob(x)
    }

    pub fn is_fitted(&self) -> bool {
        self.mixture().is_fitted()
    }
}

/// A conjugate proposer with the closed-form log joint of its coordinate.
#[derive(Debug, Clone)]
pub struct Weighted {
    pub proposer: Proposer,
    pub log_weight: f64,
}

/// Newton-style fit of a mixture to the log-density around `x`.
///
/// With `transform` set, positive reals and probabilities are fitted as a
/// Normal in log / logit space; otherwise as a Gamma / Beta in value space.
pub fn nmc_proposer(ty: ValueType, x: f64, grad1: f64, grad2: f64, transform: bool) -> Mixture {
    let usable = grad1.is_finite() && grad2.is_finite();
    match (ty, transform) {
        (ValueType::PosReal, false) => {
            let fitted = usable
                .then(|| Component::gamma(1.0 - x * x * grad2, -grad1 - x * grad2))
                .flatten();
            let fallback = Component::exponential(1.0 / x)
                .or_else(|| Component::exponential(1.0))
                .unwrap_or(Component::Uniform);
            Mixture::new(fitted, fallback)
        }
        (ValueType::PosReal, true) => {
            let y = x.ln();
            let g1 = x * grad1 + 1.0;
            let g2 = x * x * grad2 + x * grad1;
            let fitted = newton_normal(y, g1, g2).and_then(|(m, s)| Component::log_normal(m, s));
            Mixture::new(fitted, random_walk(y, Component::log_normal))
        }
        (ValueType::Probability, false) => {
            let y = 1.0 - x;
            let fitted = usable
                .then(|| {
                    Component::beta(
                        1.0 + x * x * (grad1 - y * grad2),
                        1.0 - y * y * (grad1 + x * grad2),
                    )
                })
                .flatten();
            Mixture::new(fitted, Component::Uniform)
        }
        (ValueType::Probability, true) => {
            let s = x * (1.0 - x);
            let y = (x / (1.0 - x)).ln();
            let g1 = grad1 * s + (1.0 - 2.0 * x);
            let g2 = grad2 * s * s + grad1 * s * (1.0 - 2.0 * x) - 2.0 * s;
            let fitted =
                newton_normal(y, g1, g2).and_then(|(m, s)| Component::logit_normal(m, s));
            Mixture::new(fitted, random_walk(y, Component::logit_normal))
        }
        _ => {
            let fitted = newton_normal(x, grad1, grad2).and_then(|(m, s)| Component::normal(m, s));
            Mixture::new(fitted, random_walk(x, Component::normal))
        }
    }
}

/// Mean and scale of the Normal matching a concave local quadratic.
fn newton_normal(x: f64, grad1: f64, grad2: f64) -> Option<(f64, f64)> {
    if !grad1.is_finite() || !grad2.is_finite() || grad2 >= 0.0 {
        return None;
    }
    Some((x - grad1 / grad2, (-1.0 / grad2).sqrt()))
}

/// Random walk around `center` in whatever space `build` works in.
fn random_walk(center: f64, build: fn(f64, f64) -> Option<Component>) -> Component {
    let center = if center.is_finite() { center } else { 0.0 };
    build(center, RANDOM_WALK_SCALE).unwrap_or(Component::Uniform)
}

/// Gradient proposer for a scalar latent.
pub fn gradient(ty: ValueType, x: f64, grad1: f64, grad2: f64, transform: bool) -> Proposer {
    Proposer::Gradient(nmc_proposer(ty, x, grad1, grad2, transform))
}

/// Proposer for coordinate `component` of a Dirichlet variable written as
/// normalized independent Gamma(alpha_k, 1) draws.
///
/// `rest` is the log-density of the other affected stochastic nodes with its
/// derivatives with respect to the coordinate `x_k`.
pub fn dirichlet_gamma(component: usize, alpha_k: f64, x_k: f64, rest: Dual2) -> Weighted {
    let prior = gamma_log_prob(Dual2::var(x_k), Dual2::from(alpha_k), Dual2::from(1.0));
    let total = prior + rest;
    Weighted {
        proposer: Proposer::DirichletGamma {
            component,
            inner: nmc_proposer(ValueType::PosReal, x_k, total.d1, total.d2, false),
        },
        log_weight: total.val,
    }
}

/// Proposer for the first coordinate `x` of a Dirichlet(a, b) variable,
/// which is Beta(a, b) distributed.
pub fn dirichlet_beta(a: f64, b: f64, x: f64, rest: Dual2) -> Weighted {
    let prior = beta_log_prob(Dual2::var(x), Dual2::from(a), Dual2::from(b));
    let total = prior + rest;
    Weighted {
        proposer: Proposer::DirichletBeta(nmc_proposer(
            ValueType::Probability,
            x,
            total.d1,
            total.d2,
            false,
        )),
        log_weight: total.val,
    }
}
