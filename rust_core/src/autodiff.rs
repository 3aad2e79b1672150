use crate::graph::{Graph, Node, NodeId, NodeKind, NodeValue, Op};
use crate::number::{Dual2, Number};

/// Apply a deterministic operator to its operands' elements.
///
/// Generic over the number type: the value pass runs it at `f64`, the
/// derivative pass at `Dual2`, so both always agree on what an operator does.
pub fn apply_op<N: Number>(op: &Op, args: &[Vec<N>]) -> Vec<N> {
    let one = N::from(1.0);
    let x = |i: usize| args[i][0];
    let out = match op {
        Op::Add => args
            .iter()
            .map(|a| a[0])
            .filter(|a| !a.is_definitely_zero())
            .fold(N::from(0.0), |acc, a| acc + a),
        Op::Multiply => {
            if args.iter().any(|a| a[0].is_definitely_zero())
                && args.iter().all(|a| a[0].value().is_finite())
            {
                N::from(0.0)
            } else {
                args.iter()
                    .map(|a| a[0])
                    .filter(|a| !a.is_definitely_one())
                    .fold(one, |acc, a| acc * a)
            }
        }
        Op::Negate => -x(0),
        Op::Exp => x(0).exp(),
        Op::Log => x(0).log(),
        Op::Pow => x(0).pow(x(1)),
        Op::Complement => one - x(0),
        Op::Logistic => one / (one + (-x(0)).exp()),
        Op::ToReal | Op::ToPosReal => x(0),
        Op::Index(i) => args[0][*i],
    };
    vec![out]
}

/// Lift a node's value and scratch derivatives into dual numbers.
pub fn duals(node: &Node) -> Vec<Dual2> {
    node.value
        .elements()
        .into_iter()
        .zip(node.grad1.iter().zip(node.grad2.iter()))
        .map(|(v, (&d1, &d2))| Dual2::new(v, d1, d2))
        .collect()
}

fn operand_values(graph: &Graph, node: &Node) -> Vec<Vec<f64>> {
    node.parents
        .iter()
        .map(|p| graph.node(*p).value.elements())
        .collect()
}

fn operand_duals(graph: &Graph, node: &Node) -> Vec<Vec<Dual2>> {
    node.parents.iter().map(|p| duals(graph.node(*p))).collect()
}

/// Recompute an operator node's value from its parents' current values.
/// Constants and stochastic nodes are left alone.
pub fn eval_node(graph: &mut Graph, id: NodeId) {
    let node = graph.node(id);
    let NodeKind::Operator(op) = &node.kind else {
        return;
    };
    let out = apply_op(op, &operand_values(graph, node));
    let value = NodeValue::from_elements(&node.value_type, &out);
    graph.node_mut(id).value = value;
}

/// Recompute an operator node's first and second derivatives from its
/// parents' values and derivatives. The node's value is not touched.
pub fn differentiate_node(graph: &mut Graph, id: NodeId) {
    let node = graph.node(id);
    let NodeKind::Operator(op) = &node.kind else {
        return;
    };
    let out = apply_op(op, &operand_duals(graph, node));
    let node = graph.node_mut(id);
    for (i, d) in out.into_iter().enumerate() {
        node.grad1[i] = d.d1;
        node.grad2[i] = d.d2;
    }
}

/// Log-density of a stochastic node at the current values; 0 for anything
/// else.
pub fn log_prob(graph: &Graph, id: NodeId) -> f64 {
    let node = graph.node(id);
    match &node.kind {
        NodeKind::Stochastic(dist) => {
            dist.log_prob(&node.value.elements(), &operand_values(graph, node))
        }
        _ => 0.0,
    }
}

/// Log-density of a stochastic node together with its first and second
/// derivative with respect to the variable whose scratch derivatives are
/// currently seeded. Derivatives flow in through the node's own value (when it
/// is the target) and through its parameters.
pub fn gradient_log_prob(graph: &Graph, id: NodeId) -> Dual2 {
    let node = graph.node(id);
    match &node.kind {
        NodeKind::Stochastic(dist) => dist.log_prob(&duals(node), &operand_duals(graph, node)),
        _ => Dual2::from(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use approx::assert_relative_eq;

    /// x ~ Normal(0, 1); m = exp(x) * c; y ~ Normal(log(m), 1) observed.
    fn chain_graph() -> (Graph, NodeId, Vec<NodeId>, NodeId) {
        let mut g = Graph::new();
        let zero = g.add_constant_real(0.0);
        let one = g.add_constant_pos_real(1.0).unwrap();
        let c = g.add_constant_pos_real(2.5).unwrap();
        let x = g.normal(zero, one).unwrap();
        let e = g.exp(x).unwrap();
        let m = g.mul(e, c).unwrap();
        let l = g.log(m).unwrap();
        let y = g.normal(l, one).unwrap();
        g.observe(y, NodeValue::Real(0.7)).unwrap();
        (g, x, vec![e, m, l], y)
    }

    fn log_prob_at(g: &mut Graph, x: NodeId, det: &[NodeId], y: NodeId, v: f64) -> f64 {
        g.node_mut(x).value = NodeValue::Real(v);
        for &d in det {
            eval_node(g, d);
        }
        log_prob(g, y)
    }

    #[test]
    fn test_gradient_finite_diff() {
        let (mut g, x, det, y) = chain_graph();
        let v = 0.4;
        let lp = log_prob_at(&mut g, x, &det, y, v);

        g.node_mut(x).grad1[0] = 1.0;
        for &d in &det {
            differentiate_node(&mut g, d);
        }
        let grad = gradient_log_prob(&g, y);
        assert_relative_eq!(grad.val, lp, epsilon = 1e-12);

        let eps = 1e-4;
        let plus = log_prob_at(&mut g, x, &det, y, v + eps);
        let minus = log_prob_at(&mut g, x, &det, y, v - eps);
        assert_relative_eq!(grad.d1, (plus - minus) / (2.0 * eps), epsilon = 1e-6);
        assert_relative_eq!(grad.d2, (plus - 2.0 * lp + minus) / (eps * eps), epsilon = 1e-4);
    }

    #[test]
    fn test_apply_op_shortcuts_agree_with_plain_arithmetic() {
        let args = vec![vec![0.0], vec![3.0]];
        assert_eq!(apply_op(&Op::Multiply, &args), vec![0.0]);
        assert_eq!(apply_op(&Op::Add, &args), vec![3.0]);
        let args = vec![vec![1.0], vec![3.0], vec![0.5]];
        assert_eq!(apply_op(&Op::Multiply, &args), vec![1.5]);
        assert_eq!(apply_op(&Op::Index(1), &[vec![0.2, 0.8]]), vec![0.8]);
        assert_relative_eq!(apply_op(&Op::Logistic, &[vec![0.0]])[0], 0.5);
    }

    #[test]
    fn test_multiply_by_zero_keeps_non_finite_operands() {
        let values = apply_op(&Op::Multiply, &[vec![0.0], vec![f64::INFINITY]]);
        assert!(values[0].is_nan());
        let duals = apply_op(
            &Op::Multiply,
            &[vec![Dual2::from(0.0)], vec![Dual2::new(f64::INFINITY, 1.0, 0.0)]],
        );
        assert!(duals[0].val.is_nan());
        let values = apply_op(&Op::Multiply, &[vec![0.0], vec![f64::NAN]]);
        assert!(values[0].is_nan());
    }

    #[test]
    fn test_derivative_through_index_of_simplex() {
        let mut g = Graph::new();
        let alpha = g.add_constant_vector(vec![1.0, 1.0]);
        let theta = g.dirichlet(alpha).unwrap();
        let p = g.index(theta, 1).unwrap();
        let q = g.complement(p).unwrap();
        let node = g.node_mut(theta);
        node.grad1 = vec![1.0, -1.0];
        differentiate_node(&mut g, p);
        differentiate_node(&mut g, q);
        assert_eq!(g.node(p).grad1, vec![-1.0]);
        assert_eq!(g.node(q).grad1, vec![1.0]);
    }
}
