use crate::error::Result;
use crate::graph::{Graph, NodeId, NodeValue};
use crate::initializer::{DefaultInitializer, InitStrategy};
use crate::nmc::Nmc;
use serde::{Deserialize, Serialize};

/// Configuration for an NMC run. Every field has a default, so a partial
/// JSON/TOML document is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NmcConfig {
    pub num_samples: usize,
    pub num_warmup: usize,
    pub seed: u64,
    /// Fit positive reals and probabilities in log / logit space.
    pub transform_constrained: bool,
    /// Record warm-up sweeps as draws too.
    pub keep_warmup: bool,
    /// Record the log joint of the support with every draw.
    pub keep_log_prob: bool,
    pub init: InitStrategy,
}

impl Default for NmcConfig {
    fn default() -> Self {
        Self {
            num_samples: 1000,
            num_warmup: 500,
            seed: 42,
            transform_constrained: false,
            keep_warmup: false,
            keep_log_prob: false,
            init: InitStrategy::default(),
        }
    }
}

/// Acceptance counters for one latent variable. Simplex variables with more
/// than two components count one proposal per component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acceptance {
    pub node: NodeId,
    pub accepted: u64,
    pub proposed: u64,
}

impl Acceptance {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            accepted: 0,
            proposed: 0,
        }
    }

    pub fn rate(&self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }
}

/// Raw output of [`Nmc::infer`], in generation order.
#[derive(Debug, Clone, Default)]
pub struct Samples {
    pub queries: Vec<NodeId>,
    /// draws[sweep][query]
    pub draws: Vec<Vec<NodeValue>>,
    /// Log joint of the support per draw; empty unless requested.
    pub log_probs: Vec<f64>,
    pub acceptance: Vec<Acceptance>,
}

impl Samples {
    pub fn new(queries: Vec<NodeId>) -> Self {
        Self {
            queries,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.draws.len()
    }

    pub fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    /// Trace of the `query`-th queried node, if it is scalar-valued.
    pub fn scalar_trace(&self, query: usize) -> Option<Vec<f64>> {
        self.draws
            .iter()
            .map(|row| row.get(query).and_then(NodeValue::as_scalar))
            .collect()
    }
}

/// Flattened draws with per-parameter summaries.
#[derive(Debug, Clone)]
pub struct SampleResult {
    /// samples[draw][param]
    pub samples: Vec<Vec<f64>>,
    pub param_names: Vec<String>,
    pub accept_rates: Vec<f64>,
    pub log_probs: Vec<f64>,
}

impl SampleResult {
    fn from_samples(samples: Samples, param_names: Vec<String>) -> Self {
        let flat = samples
            .draws
            .iter()
            .map(|row| row.iter().flat_map(NodeValue::elements).collect())
            .collect();
        Self {
            samples: flat,
            param_names,
            accept_rates: samples.acceptance.iter().map(Acceptance::rate).collect(),
            log_probs: samples.log_probs,
        }
    }

    /// Get posterior mean for each parameter.
    pub fn mean(&self) -> Vec<f64> {
        let n_params = self.param_names.len();
        let mut sums = vec![0.0; n_params];
        for draw in &self.samples {
            for (i, v) in draw.iter().enumerate() {
                sums[i] += v;
            }
        }
        let count = self.samples.len().max(1) as f64;
        sums.iter().map(|s| s / count).collect()
    }

    /// Get posterior standard deviation for each parameter.
    pub fn std(&self) -> Vec<f64> {
        let means = self.mean();
        let mut sum_sq = vec![0.0; means.len()];
        for draw in &self.samples {
            for (i, v) in draw.iter().enumerate() {
                let diff = v - means[i];
                sum_sq[i] += diff * diff;
            }
        }
        let count = self.samples.len().max(1) as f64;
        sum_sq.iter().map(|s| (s / count).sqrt()).collect()
    }
}

/// Column names for the flattened query values: the node's name (or id),
/// suffixed with the element index for multi-element values.
fn param_names(graph: &Graph) -> Vec<String> {
    let mut names = Vec::new();
    for &q in graph.queries() {
        let node = graph.node(q);
        let base = node.name.clone().unwrap_or_else(|| q.to_string());
        match node.value_type.len() {
            1 => names.push(base),
            n => names.extend((0..n).map(|i| format!("{}[{}]", base, i))),
        }
    }
    names
}

/// Run one NMC chain on the given graph.
///
/// The sampler takes ownership of the graph: node values are chain state.
/// Independent chains are independent `sample` calls with different seeds.
pub fn sample(graph: Graph, config: &NmcConfig) -> Result<SampleResult> {
    let names = param_names(&graph);
    let mut nmc = Nmc::new(graph, config.seed)
        .with_initializer(Box::new(DefaultInitializer::new(config.init)));
    let samples = nmc.infer(config.num_samples, config)?;
    Ok(SampleResult::from_samples(samples, names))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ValueType;
    use approx::assert_relative_eq;

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: NmcConfig =
            serde_json::from_str(r#"{"num_samples": 20, "init": "random"}"#).unwrap();
        assert_eq!(config.num_samples, 20);
        assert_eq!(config.init, InitStrategy::Random);
        assert_eq!(config.num_warmup, NmcConfig::default().num_warmup);
        assert!(!config.keep_warmup);

        let round: NmcConfig =
            serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(round, config);
    }

    #[test]
    fn test_sample_flattens_simplex_queries() {
        let mut g = Graph::new();
        let alpha = g.add_constant_vector(vec![1.0, 1.0, 1.0]);
        let theta = g.dirichlet(alpha).unwrap();
        g.set_name(theta, "theta");
        let zero = g.add_constant_real(0.0);
        let one = g.add_constant_pos_real(1.0).unwrap();
        let x = g.normal(zero, one).unwrap();
        g.query(theta).unwrap();
        g.query(x).unwrap();

        let config = NmcConfig {
            num_samples: 200,
            num_warmup: 50,
            keep_log_prob: true,
            ..NmcConfig::default()
        };
        let result = sample(g, &config).unwrap();
        assert_eq!(
            result.param_names,
            vec!["theta[0]", "theta[1]", "theta[2]", "#4"]
        );
        assert_eq!(result.samples.len(), 200);
        assert_eq!(result.log_probs.len(), 200);
        assert_eq!(result.accept_rates.len(), 2);
        for draw in &result.samples {
            assert_relative_eq!(draw[..3].iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        }
        let mean = result.mean();
        assert_relative_eq!(mean[..3].iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        assert!(result.std().iter().all(|s| *s > 0.0));
    }

    #[test]
    fn test_sample_reports_unsupported_latent() {
        let mut g = Graph::new();
        let n = g.flat(ValueType::Natural).unwrap();
        g.query(n).unwrap();
        assert!(sample(g, &NmcConfig::default()).is_err());
    }

    #[test]
    fn test_acceptance_rate_without_proposals() {
        let a = Acceptance::new(NodeId(3));
        assert_eq!(a.rate(), 0.0);
    }
}
