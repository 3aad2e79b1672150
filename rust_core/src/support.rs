//! Support analysis: which nodes matter for inference, which of them are
//! latent, and which nodes each latent variable's moves touch.

use crate::distributions::Dist;
use crate::error::{NmcError, Result};
use crate::graph::{Graph, NodeId, NodeKind, ValueType};

/// Nodes relevant to the observed and queried quantities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Support {
    /// Every ancestor of an observed or queried node (inclusive), ascending.
    pub nodes: Vec<NodeId>,
    /// `nodes` minus observed nodes, ascending.
    pub unobserved: Vec<NodeId>,
    /// Stochastic members of `unobserved`: the chain state, ascending. The
    /// sweep order follows this list.
    pub latents: Vec<NodeId>,
    in_support: Vec<bool>,
}

impl Support {
    pub fn contains(&self, id: NodeId) -> bool {
        self.in_support.get(id.0).copied().unwrap_or(false)
    }
}

/// Nodes touched when one latent variable moves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AffectedNodes {
    /// Intervening deterministic nodes, in evaluation order.
    pub det: Vec<NodeId>,
    /// The latent itself followed by its immediate stochastic descendants.
    pub sto: Vec<NodeId>,
}

/// Collect the ancestor closure of all observed and queried nodes.
///
/// Fails if any member carries a value the evaluator cannot push through the
/// number contract; today that means matrix-valued non-constant nodes.
pub fn compute_support(graph: &Graph) -> Result<Support> {
    let mut in_support = vec![false; graph.len()];
    let mut stack: Vec<NodeId> = graph
        .nodes()
        .iter()
        .filter(|n| n.observed)
        .map(|n| n.id)
        .chain(graph.queries().iter().copied())
        .collect();
    while let Some(id) = stack.pop() {
        if in_support[id.0] {
            continue;
        }
        in_support[id.0] = true;
        stack.extend(graph.node(id).parents.iter().filter(|p| !in_support[p.0]));
    }

    let nodes: Vec<NodeId> = (0..graph.len())
        .filter(|&i| in_support[i])
        .map(NodeId)
        .collect();

    for &id in &nodes {
        let node = graph.node(id);
        if matches!(node.value_type, ValueType::Matrix(..))
            && !matches!(node.kind, NodeKind::Constant)
        {
            return Err(NmcError::GraphIncompatible {
                node: id,
                reason: format!("{} values cannot be differentiated", node.value_type),
            });
        }
    }

    let unobserved: Vec<NodeId> = nodes
        .iter()
        .copied()
        .filter(|id| !graph.node(*id).observed)
        .collect();
    let latents = unobserved
        .iter()
        .copied()
        .filter(|id| graph.node(*id).is_stochastic())
        .collect();

    Ok(Support {
        nodes,
        unobserved,
        latents,
        in_support,
    })
}

/// Every latent variable must be something the proposers can move: a
/// continuous scalar, or a Dirichlet-distributed simplex.
pub fn ensure_continuous(graph: &Graph, support: &Support) -> Result<()> {
    for &id in &support.latents {
        let node = graph.node(id);
        let ok = match node.value_type {
            ty if ty.is_continuous_scalar() => true,
            ValueType::Simplex(_) => node.dist() == Some(&Dist::Dirichlet),
            _ => false,
        };
        if !ok {
            return Err(NmcError::UnsupportedVariable {
                node: id,
                value_type: node.value_type,
            });
        }
    }
    Ok(())
}

/// Affected nodes for every latent, indexed like `support.latents`.
pub fn compute_affected_nodes(graph: &Graph, support: &Support) -> Vec<AffectedNodes> {
    support
        .latents
        .iter()
        .map(|&id| {
            let (det, sto) = graph.compute_affected_nodes(id, |n| support.contains(n));
            AffectedNodes { det, sto }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeValue;
    use proptest::prelude::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    /// Random layered model: real-valued stochastic and operator nodes over
    /// earlier nodes, some observed, some queried.
    fn random_graph(seed: u64, size: usize) -> Graph {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut g = Graph::new();
        let sigma = g.add_constant_pos_real(1.0).unwrap();
        let mut reals = vec![g.add_constant_real(0.0)];
        for _ in 0..size {
            let a = reals[rng.gen_range(0..reals.len())];
            let b = reals[rng.gen_range(0..reals.len())];
            let id = match rng.gen_range(0..4) {
                0 | 1 => g.normal(a, sigma).unwrap(),
                2 => g.add(a, b).unwrap(),
                _ => g.neg(a).unwrap(),
            };
            reals.push(id);
            if g.node(id).is_stochastic() && rng.gen_bool(0.3) {
                g.observe(id, NodeValue::Real(rng.gen_range(-1.0..1.0))).unwrap();
            } else if rng.gen_bool(0.15) {
                g.query(id).unwrap();
            }
        }
        g
    }

    /// Brute-force ancestor closure by repeated relaxation.
    fn brute_support(g: &Graph) -> Vec<NodeId> {
        let mut keep: Vec<bool> = g.nodes().iter().map(|n| n.observed || n.queried).collect();
        loop {
            let mut changed = false;
            for n in g.nodes().iter().rev() {
                if keep[n.id.0] {
                    for p in &n.parents {
                        if !keep[p.0] {
                            keep[p.0] = true;
                            changed = true;
                        }
                    }
                }
            }
            if !changed {
                break;
            }
        }
        (0..g.len()).filter(|&i| keep[i]).map(NodeId).collect()
    }

    /// Brute-force affected sets: a node depends on `root` if it is `root`
    /// or an operator with a dependent parent; a stochastic node is affected
    /// if any parent depends on `root`.
    fn brute_affected(g: &Graph, support: &Support, root: NodeId) -> AffectedNodes {
        let mut depends = vec![false; g.len()];
        depends[root.0] = true;
        let mut out = AffectedNodes {
            det: Vec::new(),
            sto: vec![root],
        };
        for &id in support.nodes.iter().filter(|id| **id > root) {
            let node = g.node(id);
            let hit = node.parents.iter().any(|p| depends[p.0]);
            if !hit {
                continue;
            }
            if node.is_operator() {
                depends[id.0] = true;
                out.det.push(id);
            } else if node.is_stochastic() {
                out.sto.push(id);
            }
        }
        out
    }

    proptest! {
        #[test]
        fn support_is_exact_ancestor_closure(seed in 0u64..10_000, size in 1usize..40) {
            let g = random_graph(seed, size);
            let support = compute_support(&g).unwrap();
            prop_assert_eq!(&support.nodes, &brute_support(&g));
            for id in &support.latents {
                prop_assert!(!g.node(*id).observed);
                prop_assert!(g.node(*id).is_stochastic());
            }
            prop_assert!(support.unobserved.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(support.latents.windows(2).all(|w| w[0] < w[1]));
        }

        #[test]
        fn affected_nodes_are_exhaustive(seed in 0u64..10_000, size in 1usize..40) {
            let g = random_graph(seed, size);
            let support = compute_support(&g).unwrap();
            let affected = compute_affected_nodes(&g, &support);
            prop_assert_eq!(affected.len(), support.latents.len());
            for (i, &latent) in support.latents.iter().enumerate() {
                prop_assert_eq!(&affected[i], &brute_affected(&g, &support, latent));
            }
        }
    }

    #[test]
    fn test_disconnected_nodes_are_excluded() {
        let mut g = Graph::new();
        let zero = g.add_constant_real(0.0);
        let one = g.add_constant_pos_real(1.0).unwrap();
        let x = g.normal(zero, one).unwrap();
        let y = g.normal(x, one).unwrap();
        let stray = g.normal(zero, one).unwrap();
        let _stray_child = g.normal(stray, one).unwrap();
        g.observe(y, NodeValue::Real(1.0)).unwrap();

        let support = compute_support(&g).unwrap();
        assert_eq!(support.nodes, vec![zero, one, x, y]);
        assert_eq!(support.unobserved, vec![zero, one, x]);
        assert_eq!(support.latents, vec![x]);
        assert!(!support.contains(stray));
    }

    #[test]
    fn test_matrix_valued_variable_is_incompatible() {
        let mut g = Graph::new();
        let m = g.flat(ValueType::Matrix(2, 2)).unwrap();
        g.query(m).unwrap();
        let err = compute_support(&g).unwrap_err();
        assert!(matches!(err, NmcError::GraphIncompatible { node, .. } if node == m));
    }

    #[test]
    fn test_matrix_outside_support_is_ignored() {
        let mut g = Graph::new();
        let _m = g.flat(ValueType::Matrix(2, 2)).unwrap();
        let x = g.flat(ValueType::Real).unwrap();
        g.query(x).unwrap();
        assert!(compute_support(&g).is_ok());
    }

    #[test]
    fn test_discrete_latent_is_unsupported() {
        let mut g = Graph::new();
        let p = g.add_constant_probability(0.5).unwrap();
        let b = g.bernoulli(p).unwrap();
        g.query(b).unwrap();
        let support = compute_support(&g).unwrap();
        let err = ensure_continuous(&g, &support).unwrap_err();
        assert!(matches!(
            err,
            NmcError::UnsupportedVariable { node, value_type: ValueType::Boolean } if node == b
        ));

        let mut g = Graph::new();
        let n = g.flat(ValueType::Natural).unwrap();
        g.query(n).unwrap();
        let support = compute_support(&g).unwrap();
        assert!(matches!(
            ensure_continuous(&g, &support),
            Err(NmcError::UnsupportedVariable { value_type: ValueType::Natural, .. })
        ));
    }

    #[test]
    fn test_simplex_latent_needs_dirichlet_prior() {
        let mut g = Graph::new();
        let s = g.flat(ValueType::Simplex(3)).unwrap();
        g.query(s).unwrap();
        let support = compute_support(&g).unwrap();
        assert!(ensure_continuous(&g, &support).is_err());

        let mut g = Graph::new();
        let alpha = g.add_constant_vector(vec![1.0, 2.0, 3.0]);
        let s = g.dirichlet(alpha).unwrap();
        g.query(s).unwrap();
        let support = compute_support(&g).unwrap();
        assert!(ensure_continuous(&g, &support).is_ok());
    }
}
