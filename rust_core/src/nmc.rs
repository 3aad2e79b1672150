//! Newtonian Monte Carlo: Metropolis-within-Gibbs over the latent variables
//! of a graph, every move proposed from a second-order fit to the local
//! log-density.

use crate::autodiff;
use crate::error::{NmcError, Result};
use crate::graph::{Graph, NodeId, NodeValue, ValueType};
use crate::initializer::{DefaultInitializer, Initializer};
use crate::number::Dual2;
use crate::proposer::{self, Proposer, Weighted};
use crate::sampler::{Acceptance, NmcConfig, Samples};
use crate::snapshot::ValueStore;
use crate::support::{self, AffectedNodes, Support};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use tracing::{debug, info, trace, warn};

/// Where a single-variable step is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Initial,
    Snapshotted,
    Proposed,
    Scored,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Accepted,
    Rejected,
}

/// Metropolis-Hastings log acceptance ratio for a non-symmetric proposal.
///
/// `forward` is log q(new | old), `reverse` is log q(old | new). A move out
/// of a zero-density state into a finite one is always accepted.
pub fn log_acceptance_ratio(old_joint: f64, new_joint: f64, forward: f64, reverse: f64) -> f64 {
    if old_joint == f64::NEG_INFINITY {
        return if new_joint > f64::NEG_INFINITY {
            f64::INFINITY
        } else {
            f64::NEG_INFINITY
        };
    }
    (new_joint + reverse) - (old_joint + forward)
}

/// Single-chain NMC sampler. Owns its graph, whose node values are the chain
/// state, and its random stream.
pub struct Nmc {
    graph: Graph,
    rng: ChaCha8Rng,
    initializer: Box<dyn Initializer>,
    support: Support,
    /// Indexed like `support.latents`.
    affected: Vec<AffectedNodes>,
    store: ValueStore,
    /// Unnormalized Gamma coordinates of simplex latents with K > 2.
    gamma_coords: HashMap<NodeId, Vec<f64>>,
    acceptance: Vec<Acceptance>,
    values_assigned: bool,
    transform_constrained: bool,
    samples: Samples,
}

impl Nmc {
    pub fn new(graph: Graph, seed: u64) -> Self {
        Self {
            graph,
            rng: ChaCha8Rng::seed_from_u64(seed),
            initializer: Box::new(DefaultInitializer::default()),
            support: Support::default(),
            affected: Vec::new(),
            store: ValueStore::new(),
            gamma_coords: HashMap::new(),
            acceptance: Vec::new(),
            values_assigned: false,
            transform_constrained: false,
            samples: Samples::default(),
        }
    }

    pub fn with_initializer(mut self, initializer: Box<dyn Initializer>) -> Self {
        self.initializer = initializer;
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn support(&self) -> &Support {
        &self.support
    }

    pub fn affected(&self) -> &[AffectedNodes] {
        &self.affected
    }

    pub fn acceptance(&self) -> &[Acceptance] {
        &self.acceptance
    }

    /// Compute the support, check every latent can be moved, assign initial
    /// values (first call only) and build the affected-node cache.
    pub fn initialize(&mut self) -> Result<()> {
        let support = support::compute_support(&self.graph)?;
        support::ensure_continuous(&self.graph, &support)?;
        if !self.values_assigned {
            self.assign_initial_values(&support);
            self.values_assigned = true;
        }
        self.affected = support::compute_affected_nodes(&self.graph, &support);
        self.acceptance = support.latents.iter().map(|&id| Acceptance::new(id)).collect();
        info!(
            support = support.nodes.len(),
            unobserved = support.unobserved.len(),
            latents = support.latents.len(),
            "initialized NMC"
        );
        self.support = support;
        Ok(())
    }

    /// Ascending pass over the unobserved support: latents get a value from
    /// the initializer, operators are evaluated from their parents.
    fn assign_initial_values(&mut self, support: &Support) {
        for &id in &support.unobserved {
            if self.graph.node(id).is_operator() {
                autodiff::eval_node(&mut self.graph, id);
                continue;
            }
            let node = self.graph.node(id);
            let Some(dist) = node.dist() else {
                continue;
            };
            let params: Vec<NodeValue> = node
                .parents
                .iter()
                .map(|p| self.graph.node(*p).value.clone())
                .collect();
            let value =
                self.initializer
                    .initial_value(dist, &params, &node.value_type, &mut self.rng);
            if let NodeValue::Simplex(x) = &value {
                if x.len() > 2 {
                    self.gamma_coords.insert(id, x.clone());
                }
            }
            trace!(node = %id, ?value, "initial value");
            self.graph.node_mut(id).value = value;
        }
    }

    fn save(&mut self, target: NodeId, det: &[NodeId]) {
        self.store.save(&self.graph, &[target]);
        self.store.push(&self.graph, det);
    }

    fn restore(&mut self) {
        self.store.restore(&mut self.graph);
    }

    fn eval(&mut self, det: &[NodeId]) {
        for &id in det {
            autodiff::eval_node(&mut self.graph, id);
        }
    }

    fn clear_gradients(&mut self, nodes: &[NodeId]) {
        for &id in nodes {
            self.graph.node_mut(id).clear_gradients();
        }
    }

    fn compute_gradients(&mut self, det: &[NodeId]) {
        for &id in det {
            autodiff::differentiate_node(&mut self.graph, id);
        }
    }

    /// Sum of log-densities of `nodes` at their current values.
    pub fn log_prob_of(&self, nodes: &[NodeId]) -> f64 {
        nodes.iter().map(|&id| autodiff::log_prob(&self.graph, id)).sum()
    }

    /// Sum of log-densities of `sto` with first and second derivatives with
    /// respect to the currently seeded variable.
    fn gradient_log_prob(&self, sto: &[NodeId]) -> Dual2 {
        sto.iter().fold(Dual2::from(0.0), |acc, &id| {
            acc + autodiff::gradient_log_prob(&self.graph, id)
        })
    }

    /// Seed the target's scratch derivatives, push them through the
    /// deterministic nodes and accumulate the affected log-densities. The
    /// target's own density is left out when `skip_target` is set.
    fn seed_and_score(
        &mut self,
        target: NodeId,
        affected: &AffectedNodes,
        grad1: &[f64],
        grad2: &[f64],
        skip_target: bool,
    ) -> Dual2 {
        self.clear_gradients(&affected.det);
        let node = self.graph.node_mut(target);
        node.grad1.copy_from_slice(grad1);
        node.grad2.copy_from_slice(grad2);
        self.compute_gradients(&affected.det);
        let sto = if skip_target {
            &affected.sto[1..]
        } else {
            &affected.sto[..]
        };
        self.gradient_log_prob(sto)
    }

    /// The candidate's log joint, or -inf when its log-density or derivatives
    /// are not finite.
    fn candidate_joint(&self, target: NodeId, joint: f64, grads: Dual2) -> f64 {
        let degenerate = if !joint.is_finite() {
            Some("log joint")
        } else if !grads.d1.is_finite() || !grads.d2.is_finite() {
            Some("gradient")
        } else {
            None
        };
        match degenerate {
            Some(quantity) => {
                let err = NmcError::NumericDegeneracy {
                    node: target,
                    quantity,
                };
                warn!(%err, "rejecting candidate");
                f64::NEG_INFINITY
            }
            None => joint,
        }
    }

    /// The current state's log joint, or -inf when it is not finite, so the
    /// chain can leave a state outside the support.
    fn current_joint(&self, target: NodeId, joint: f64) -> f64 {
        if joint.is_finite() {
            joint
        } else {
            debug!(node = %target, joint, "current state has no finite log joint");
            f64::NEG_INFINITY
        }
    }

    /// NMC proposer for a scalar latent fitted at value `x`.
    fn get_proposal_distribution(&self, target: NodeId, ty: ValueType, x: f64, d: Dual2) -> Proposer {
        let proposer = proposer::gradient(ty, x, d.d1, d.d2, self.transform_constrained);
        if !proposer.is_fitted() {
            debug!(node = %target, x, grad1 = d.d1, grad2 = d.d2, "no local fit, random-walk proposal");
        }
        proposer
    }

    fn dirichlet_alpha(&self, target: NodeId) -> Vec<f64> {
        self.graph
            .node(target)
            .parents
            .first()
            .map(|p| self.graph.node(*p).value.elements())
            .unwrap_or_default()
    }

    /// Proposer for Gamma coordinate `k` of a simplex latent at coordinates
    /// `coords`, which must match the target's current value.
    fn create_proposer_dirichlet_gamma(
        &mut self,
        target: NodeId,
        affected: &AffectedNodes,
        alpha: &[f64],
        coords: &[f64],
        k: usize,
    ) -> (Weighted, Dual2) {
        let total: f64 = coords.iter().sum();
        let (grad1, grad2): (Vec<f64>, Vec<f64>) = coords
            .iter()
            .enumerate()
            .map(|(j, xj)| {
                let delta = if j == k { 1.0 } else { 0.0 };
                let d = delta - xj / total;
                (d / total, -2.0 * d / (total * total))
            })
            .unzip();
        let rest = self.seed_and_score(target, affected, &grad1, &grad2, true);
        (proposer::dirichlet_gamma(k, alpha[k], coords[k], rest), rest)
    }

    /// Proposer for the first coordinate of a two-component simplex latent.
    fn create_proposer_dirichlet_beta(
        &mut self,
        target: NodeId,
        affected: &AffectedNodes,
        alpha: &[f64],
        x: f64,
    ) -> (Weighted, Dual2) {
        let rest = self.seed_and_score(target, affected, &[1.0, -1.0], &[0.0, 0.0], true);
        (proposer::dirichlet_beta(alpha[0], alpha[1], x, rest), rest)
    }

    fn phase(&self, target: NodeId, phase: StepPhase) {
        trace!(node = %target, ?phase, "nmc step");
    }

    /// Accept or reject on `log_alpha`, rolling back on rejection. Scratch
    /// derivatives are cleared either way.
    fn finish(
        &mut self,
        pos: usize,
        target: NodeId,
        affected: &AffectedNodes,
        log_alpha: f64,
    ) -> StepOutcome {
        let accept = !log_alpha.is_nan()
            && log_alpha > f64::NEG_INFINITY
            && self.rng.gen::<f64>().ln() <= log_alpha;
        let outcome = if accept {
            StepOutcome::Accepted
        } else {
            self.restore();
            StepOutcome::Rejected
        };
        self.clear_gradients(&[target]);
        self.clear_gradients(&affected.det);

        let stats = &mut self.acceptance[pos];
        stats.proposed += 1;
        if accept {
            stats.accepted += 1;
        }
        self.phase(
            target,
            match outcome {
                StepOutcome::Accepted => StepPhase::Accepted,
                StepOutcome::Rejected => StepPhase::Rejected,
            },
        );
        outcome
    }

    /// General NMC step for a continuous scalar latent.
    fn mh_step(&mut self, pos: usize, target: NodeId, affected: &AffectedNodes) -> StepOutcome {
        self.phase(target, StepPhase::Initial);
        let ty = self.graph.node(target).value_type;
        self.save(target, &affected.det);
        self.phase(target, StepPhase::Snapshotted);

        let old_x = self.graph.node(target).value.as_scalar().unwrap_or(f64::NAN);
        let old = self.seed_and_score(target, affected, &[1.0], &[0.0], false);
        let forward = self.get_proposal_distribution(target, ty, old_x, old);

        let new_x = forward.sample(&mut self.rng);
        self.graph.node_mut(target).value = NodeValue::from_elements(&ty, &[new_x]);
        self.eval(&affected.det);
        self.phase(target, StepPhase::Proposed);

        let new = self.seed_and_score(target, affected, &[1.0], &[0.0], false);
        let new_joint = self.candidate_joint(target, new.val, new);
        let reverse = self.get_proposal_distribution(target, ty, new_x, new);
        self.phase(target, StepPhase::Scored);

        let old_joint = self.current_joint(target, old.val);
        let log_alpha = log_acceptance_ratio(
            old_joint,
            new_joint,
            forward.log_prob(new_x),
            reverse.log_prob(old_x),
        );
        self.finish(pos, target, affected, log_alpha)
    }

    /// Two-component simplex step: propose the first coordinate from a Beta
    /// fit and move both components together.
    fn dirichlet_beta_step(&mut self, pos: usize, target: NodeId, affected: &AffectedNodes) -> StepOutcome {
        self.phase(target, StepPhase::Initial);
        let alpha = self.dirichlet_alpha(target);
        self.save(target, &affected.det);
        self.phase(target, StepPhase::Snapshotted);

        let old_x = self.graph.node(target).value.elements()[0];
        let (old, _) = self.create_proposer_dirichlet_beta(target, affected, &alpha, old_x);

        let new_x = old.proposer.sample(&mut self.rng);
        self.graph.node_mut(target).value = NodeValue::Simplex(vec![new_x, 1.0 - new_x]);
        self.eval(&affected.det);
        self.phase(target, StepPhase::Proposed);

        let (new, rest) = self.create_proposer_dirichlet_beta(target, affected, &alpha, new_x);
        let new_joint = self.candidate_joint(target, new.log_weight, rest);
        self.phase(target, StepPhase::Scored);

        let old_joint = self.current_joint(target, old.log_weight);
        let log_alpha = log_acceptance_ratio(
            old_joint,
            new_joint,
            old.proposer.log_prob(new_x),
            new.proposer.log_prob(old_x),
        );
        self.finish(pos, target, affected, log_alpha)
    }

    /// K-component simplex step: one Metropolis-Hastings sub-step per Gamma
    /// coordinate, each renormalizing the whole simplex.
    fn dirichlet_gamma_step(
        &mut self,
        pos: usize,
        target: NodeId,
        affected: &AffectedNodes,
    ) -> Vec<StepOutcome> {
        let alpha = self.dirichlet_alpha(target);
        let mut coords = match self.gamma_coords.remove(&target) {
            Some(c) => c,
            None => self.graph.node(target).value.elements(),
        };
        let mut outcomes = Vec::with_capacity(coords.len());
        for k in 0..coords.len() {
            self.phase(target, StepPhase::Initial);
            self.save(target, &affected.det);
            self.phase(target, StepPhase::Snapshotted);

            let (old, _) = self.create_proposer_dirichlet_gamma(target, affected, &alpha, &coords, k);

            let mut proposed = coords.clone();
            proposed[k] = old.proposer.sample(&mut self.rng);
            let total: f64 = proposed.iter().sum();
            self.graph.node_mut(target).value =
                NodeValue::Simplex(proposed.iter().map(|x| x / total).collect());
            self.eval(&affected.det);
            self.phase(target, StepPhase::Proposed);

            let (new, rest) =
                self.create_proposer_dirichlet_gamma(target, affected, &alpha, &proposed, k);
            let new_joint = self.candidate_joint(target, new.log_weight, rest);
            self.phase(target, StepPhase::Scored);

            let old_joint = self.current_joint(target, old.log_weight);
            let log_alpha = log_acceptance_ratio(
                old_joint,
                new_joint,
                old.proposer.log_prob(proposed[k]),
                new.proposer.log_prob(coords[k]),
            );
            let outcome = self.finish(pos, target, affected, log_alpha);
            if outcome == StepOutcome::Accepted {
                coords = proposed;
            }
            outcomes.push(outcome);
        }
        self.gamma_coords.insert(target, coords);
        outcomes
    }

    /// One sweep: a step for every latent in ascending id order.
    pub fn generate_sample(&mut self) {
        for pos in 0..self.support.latents.len() {
            let target = self.support.latents[pos];
            let affected = std::mem::take(&mut self.affected[pos]);
            let ty = self.graph.node(target).value_type;
            match ty {
                ValueType::Simplex(2) => {
                    self.dirichlet_beta_step(pos, target, &affected);
                }
                ValueType::Simplex(k) if k > 2 => {
                    self.dirichlet_gamma_step(pos, target, &affected);
                }
                // a one-point simplex has nowhere to go
                ValueType::Simplex(_) => {}
                _ => {
                    self.mh_step(pos, target, &affected);
                }
            }
            self.affected[pos] = affected;
        }
    }

    /// Record the current values of the queried nodes as one draw.
    pub fn collect_sample(&mut self, config: &NmcConfig) {
        let row = self
            .graph
            .queries()
            .iter()
            .map(|&q| self.graph.node(q).value.clone())
            .collect();
        self.samples.draws.push(row);
        if config.keep_log_prob {
            let lp = self.log_prob_of(&self.support.nodes);
            self.samples.log_probs.push(lp);
        }
    }

    /// Run `config.num_warmup` warm-up sweeps, then `num_samples` collected
    /// sweeps.
    pub fn collect_samples(&mut self, num_samples: usize, config: &NmcConfig) {
        for _ in 0..config.num_warmup {
            self.generate_sample();
            if config.keep_warmup {
                self.collect_sample(config);
            }
        }
        debug!(sweeps = config.num_warmup, "warm-up finished");
        for _ in 0..num_samples {
            self.generate_sample();
            self.collect_sample(config);
        }
        debug!(sweeps = num_samples, "sampling finished");
    }

    /// Initialize (if needed) and draw `num_samples` samples of the queried
    /// nodes. A chain continues from its current state on repeated calls.
    pub fn infer(&mut self, num_samples: usize, config: &NmcConfig) -> Result<Samples> {
        self.transform_constrained = config.transform_constrained;
        self.initialize()?;
        self.samples = Samples::new(self.graph.queries().to_vec());
        self.collect_samples(num_samples, config);
        self.samples.acceptance = self.acceptance.clone();

        let proposed: u64 = self.acceptance.iter().map(|a| a.proposed).sum();
        let accepted: u64 = self.acceptance.iter().map(|a| a.accepted).sum();
        info!(
            draws = self.samples.len(),
            accepted,
            proposed,
            "NMC inference finished"
        );
        Ok(std::mem::take(&mut self.samples))
    }
}
