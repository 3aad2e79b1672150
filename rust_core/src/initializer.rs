use crate::distributions::Dist;
use crate::graph::{NodeValue, ValueType};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Beta, Cauchy, Dirichlet, Distribution, Gamma, Normal};
use serde::{Deserialize, Serialize};

/// Smallest distance kept from the edge of a constrained domain.
const EDGE: f64 = 1e-10;

/// Produces the starting value of a latent variable.
pub trait Initializer {
    /// `params` are the current values of the node's parameters.
    fn initial_value(
        &self,
        dist: &Dist,
        params: &[NodeValue],
        value_type: &ValueType,
        rng: &mut ChaCha8Rng,
    ) -> NodeValue;
}

/// How [`DefaultInitializer`] picks starting values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitStrategy {
    /// Draw from the node's prior, given its parents' current values.
    #[default]
    Prior,
    /// The image of zero in unconstrained space: 0, 1, 0.5, uniform simplex.
    Zero,
    /// Uniform(-2, 2) in unconstrained space, mapped back.
    Random,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultInitializer {
    pub strategy: InitStrategy,
}

impl DefaultInitializer {
    pub fn new(strategy: InitStrategy) -> Self {
        Self { strategy }
    }
}

impl Initializer for DefaultInitializer {
    fn initial_value(
        &self,
        dist: &Dist,
        params: &[NodeValue],
        value_type: &ValueType,
        rng: &mut ChaCha8Rng,
    ) -> NodeValue {
        let value = match self.strategy {
            InitStrategy::Zero => None,
            InitStrategy::Random => Some(random_unconstrained(value_type, rng)),
            InitStrategy::Prior => sample_prior(dist, params, rng),
        };
        match value {
            Some(v) if v.value_type() == *value_type => interior(v),
            _ => NodeValue::default_for(value_type),
        }
    }
}

fn scalar(params: &[NodeValue], i: usize) -> f64 {
    params
        .get(i)
        .and_then(|p| p.elements().first().copied())
        .unwrap_or(f64::NAN)
}

fn sample_prior(dist: &Dist, params: &[NodeValue], rng: &mut ChaCha8Rng) -> Option<NodeValue> {
    let p = |i| scalar(params, i);
    match dist {
        Dist::Normal => Normal::new(p(0), p(1))
            .ok()
            .map(|d| NodeValue::Real(d.sample(rng))),
        Dist::HalfCauchy => Cauchy::new(0.0, p(0))
            .ok()
            .map(|d| NodeValue::PosReal(d.sample(rng).abs())),
        Dist::Gamma => Gamma::new(p(0), 1.0 / p(1))
            .ok()
            .map(|d| NodeValue::PosReal(d.sample(rng))),
        Dist::Beta => Beta::new(p(0), p(1))
            .ok()
            .map(|d| NodeValue::Probability(d.sample(rng))),
        Dist::Dirichlet => {
            let alpha = params.first()?.elements();
            Dirichlet::new(&alpha)
                .ok()
                .map(|d| NodeValue::Simplex(d.sample(rng)))
        }
        Dist::Flat(_) | Dist::Bernoulli => None,
    }
}

fn random_unconstrained(ty: &ValueType, rng: &mut ChaCha8Rng) -> NodeValue {
    let mut u = || rng.gen_range(-2.0..2.0);
    match *ty {
        ValueType::Real => NodeValue::Real(u()),
        ValueType::PosReal => NodeValue::PosReal(u().exp()),
        ValueType::Probability => NodeValue::Probability(1.0 / (1.0 + (-u()).exp())),
        ValueType::Simplex(k) => {
            let w: Vec<f64> = (0..k).map(|_| u().exp()).collect();
            let total: f64 = w.iter().sum();
            NodeValue::Simplex(w.into_iter().map(|x| x / total).collect())
        }
        _ => NodeValue::default_for(ty),
    }
}

/// Pull a value off the boundary of its domain, or replace it with the
/// canonical default when it is not usable at all.
fn interior(value: NodeValue) -> NodeValue {
    let ty = value.value_type();
    match value {
        NodeValue::Real(x) if !x.is_finite() => NodeValue::default_for(&ty),
        NodeValue::PosReal(x) if !x.is_finite() => NodeValue::default_for(&ty),
        NodeValue::PosReal(x) => NodeValue::PosReal(x.max(EDGE)),
        NodeValue::Probability(x) if !x.is_finite() => NodeValue::default_for(&ty),
        NodeValue::Probability(x) => NodeValue::Probability(x.clamp(EDGE, 1.0 - EDGE)),
        NodeValue::Simplex(v) => {
            if v.iter().any(|x| !x.is_finite()) {
                return NodeValue::default_for(&ty);
            }
            let floored: Vec<f64> = v.iter().map(|x| x.max(EDGE)).collect();
            let total: f64 = floored.iter().sum();
            NodeValue::Simplex(floored.into_iter().map(|x| x / total).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_prior_draws_respect_domain() {
        let init = DefaultInitializer::default();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let pos = [NodeValue::PosReal(0.5), NodeValue::PosReal(2.0)];
        for _ in 0..200 {
            let g = init.initial_value(&Dist::Gamma, &pos, &ValueType::PosReal, &mut rng);
            assert!(g.as_scalar().unwrap() > 0.0);
            let b = init.initial_value(&Dist::Beta, &pos, &ValueType::Probability, &mut rng);
            let b = b.as_scalar().unwrap();
            assert!(b > 0.0 && b < 1.0);
        }
        let alpha = [NodeValue::Vector(vec![0.1, 0.1, 0.1])];
        let d = init.initial_value(&Dist::Dirichlet, &alpha, &ValueType::Simplex(3), &mut rng);
        let v = d.elements();
        assert!(v.iter().all(|x| *x > 0.0));
        assert!((v.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_strategy_and_flat_prior_use_defaults() {
        let zero = DefaultInitializer::new(InitStrategy::Zero);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let params = [NodeValue::Real(5.0), NodeValue::PosReal(1.0)];
        let v = zero.initial_value(&Dist::Normal, &params, &ValueType::Real, &mut rng);
        assert_eq!(v, NodeValue::Real(0.0));

        let prior = DefaultInitializer::default();
        let v = prior.initial_value(
            &Dist::Flat(ValueType::Probability),
            &[],
            &ValueType::Probability,
            &mut rng,
        );
        assert_eq!(v, NodeValue::Probability(0.5));
    }

    #[test]
    fn test_initial_values_are_reproducible() {
        let init = DefaultInitializer::new(InitStrategy::Random);
        let draw = |seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            init.initial_value(&Dist::Flat(ValueType::Simplex(4)), &[], &ValueType::Simplex(4), &mut rng)
        };
        assert_eq!(draw(11), draw(11));
        assert_ne!(draw(11), draw(12));
    }
}
