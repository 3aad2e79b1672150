use crate::autodiff;
use crate::distributions::Dist;
use crate::error::{NmcError, Result};
use std::collections::BTreeSet;
use std::fmt;

/// Unique identifier for a node in the graph. Ids are arena indices, so they
/// are stable for the life of the graph and ascending id order is a valid
/// topological order (a node only ever references earlier nodes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Static type of a node's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Boolean,
    Natural,
    Real,
    PosReal,
    Probability,
    Vector(usize),
    /// Column simplex: non-negative entries summing to one.
    Simplex(usize),
    Matrix(usize, usize),
}

impl ValueType {
    /// Number of scalar elements a value of this type carries.
    pub fn len(&self) -> usize {
        match self {
            ValueType::Vector(n) | ValueType::Simplex(n) => *n,
            ValueType::Matrix(r, c) => r * c,
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scalar continuous types the gradient proposer can move.
    pub fn is_continuous_scalar(&self) -> bool {
        matches!(
            self,
            ValueType::Real | ValueType::PosReal | ValueType::Probability
        )
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Boolean => write!(f, "boolean"),
            ValueType::Natural => write!(f, "natural"),
            ValueType::Real => write!(f, "real"),
            ValueType::PosReal => write!(f, "positive real"),
            ValueType::Probability => write!(f, "probability"),
            ValueType::Vector(n) => write!(f, "vector[{}]", n),
            ValueType::Simplex(n) => write!(f, "simplex[{}]", n),
            ValueType::Matrix(r, c) => write!(f, "matrix[{}x{}]", r, c),
        }
    }
}

/// The current value of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    Boolean(bool),
    Natural(u64),
    Real(f64),
    PosReal(f64),
    Probability(f64),
    Vector(Vec<f64>),
    Simplex(Vec<f64>),
    Matrix {
        rows: usize,
        cols: usize,
        data: Vec<f64>,
    },
}

impl NodeValue {
    /// Canonical starting value for a type.
    pub fn default_for(ty: &ValueType) -> Self {
        match *ty {
            ValueType::Boolean => NodeValue::Boolean(false),
            ValueType::Natural => NodeValue::Natural(0),
            ValueType::Real => NodeValue::Real(0.0),
            ValueType::PosReal => NodeValue::PosReal(1.0),
            ValueType::Probability => NodeValue::Probability(0.5),
            ValueType::Vector(n) => NodeValue::Vector(vec![0.0; n]),
            ValueType::Simplex(n) => NodeValue::Simplex(vec![1.0 / n as f64; n]),
            ValueType::Matrix(rows, cols) => NodeValue::Matrix {
                rows,
                cols,
                data: vec![0.0; rows * cols],
            },
        }
    }

    /// Re-tag scalar elements as a value of the given type.
    pub fn from_elements(ty: &ValueType, elements: &[f64]) -> Self {
        let first = elements.first().copied().unwrap_or(0.0);
        match *ty {
            ValueType::Boolean => NodeValue::Boolean(first != 0.0),
            ValueType::Natural => NodeValue::Natural(first.max(0.0).round() as u64),
            ValueType::Real => NodeValue::Real(first),
            ValueType::PosReal => NodeValue::PosReal(first),
            ValueType::Probability => NodeValue::Probability(first),
            ValueType::Vector(_) => NodeValue::Vector(elements.to_vec()),
            ValueType::Simplex(_) => NodeValue::Simplex(elements.to_vec()),
            ValueType::Matrix(rows, cols) => NodeValue::Matrix {
                rows,
                cols,
                data: elements.to_vec(),
            },
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            NodeValue::Boolean(_) => ValueType::Boolean,
            NodeValue::Natural(_) => ValueType::Natural,
            NodeValue::Real(_) => ValueType::Real,
            NodeValue::PosReal(_) => ValueType::PosReal,
            NodeValue::Probability(_) => ValueType::Probability,
            NodeValue::Vector(v) => ValueType::Vector(v.len()),
            NodeValue::Simplex(v) => ValueType::Simplex(v.len()),
            NodeValue::Matrix { rows, cols, .. } => ValueType::Matrix(*rows, *cols),
        }
    }

    /// The value's scalar elements; booleans and naturals are widened.
    pub fn elements(&self) -> Vec<f64> {
        match self {
            NodeValue::Boolean(b) => vec![if *b { 1.0 } else { 0.0 }],
            NodeValue::Natural(n) => vec![*n as f64],
            NodeValue::Real(x) | NodeValue::PosReal(x) | NodeValue::Probability(x) => vec![*x],
            NodeValue::Vector(v) | NodeValue::Simplex(v) => v.clone(),
            NodeValue::Matrix { data, .. } => data.clone(),
        }
    }

    /// The scalar payload of a real, positive-real or probability value.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            NodeValue::Real(x) | NodeValue::PosReal(x) | NodeValue::Probability(x) => Some(*x),
            _ => None,
        }
    }
}

/// Deterministic operators. Operands are the node's parents, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Sum of two or more scalars.
    Add,
    /// Product of two or more scalars.
    Multiply,
    Negate,
    Exp,
    Log,
    /// parents[0] ^ parents[1]
    Pow,
    /// 1 - p
    Complement,
    Logistic,
    ToReal,
    ToPosReal,
    /// Element of a vector or simplex.
    Index(usize),
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Constant,
    Operator(Op),
    Stochastic(Dist),
}

/// A single node in the graph.
///
/// `grad1` / `grad2` hold one derivative per scalar element of the value,
/// with respect to whichever variable is currently being proposed. They are
/// scratch state, zeroed between passes.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub value_type: ValueType,
    pub value: NodeValue,
    pub observed: bool,
    pub queried: bool,
    pub parents: Vec<NodeId>,
    pub children: Vec<NodeId>,
    pub grad1: Vec<f64>,
    pub grad2: Vec<f64>,
    pub name: Option<String>,
}

impl Node {
    pub fn is_stochastic(&self) -> bool {
        matches!(self.kind, NodeKind::Stochastic(_))
    }

    pub fn is_operator(&self) -> bool {
        matches!(self.kind, NodeKind::Operator(_))
    }

    pub fn dist(&self) -> Option<&Dist> {
        match &self.kind {
            NodeKind::Stochastic(d) => Some(d),
            _ => None,
        }
    }

    pub fn clear_gradients(&mut self) {
        self.grad1.iter_mut().for_each(|g| *g = 0.0);
        self.grad2.iter_mut().for_each(|g| *g = 0.0);
    }
}

/// Append-only arena of nodes forming a probabilistic graphical model.
///
/// Every relation (parents, children, queries) is stored as an index into the
/// arena, so nodes are never invalidated while the graph lives.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    queries: Vec<NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn queries(&self) -> &[NodeId] {
        &self.queries
    }

    pub fn set_name(&mut self, id: NodeId, name: &str) {
        self.nodes[id.0].name = Some(name.to_string());
    }

    fn check_parents(&self, parents: &[NodeId]) -> Result<()> {
        match parents.iter().find(|p| p.0 >= self.nodes.len()) {
            Some(p) => Err(NmcError::InvalidGraph(format!("unknown parent node {}", p))),
            None => Ok(()),
        }
    }

    fn add_node(&mut self, kind: NodeKind, value_type: ValueType, parents: Vec<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        for p in &parents {
            let children = &mut self.nodes[p.0].children;
            if children.last() != Some(&id) {
                children.push(id);
            }
        }
        let n = value_type.len();
        self.nodes.push(Node {
            id,
            kind,
            value_type,
            value: NodeValue::default_for(&value_type),
            observed: false,
            queried: false,
            parents,
            children: Vec::new(),
            grad1: vec![0.0; n],
            grad2: vec![0.0; n],
            name: None,
        });
        id
    }

    pub fn add_constant(&mut self, value: NodeValue) -> NodeId {
        let ty = value.value_type();
        let id = self.add_node(NodeKind::Constant, ty, Vec::new());
        self.nodes[id.0].value = value;
        id
    }

    pub fn add_constant_real(&mut self, value: f64) -> NodeId {
        self.add_constant(NodeValue::Real(value))
    }

    pub fn add_constant_pos_real(&mut self, value: f64) -> Result<NodeId> {
        if !(value > 0.0) {
            return Err(NmcError::InvalidGraph(format!(
                "positive real constant must be > 0, got {}",
                value
            )));
        }
        Ok(self.add_constant(NodeValue::PosReal(value)))
    }

    pub fn add_constant_probability(&mut self, value: f64) -> Result<NodeId> {
        if !(0.0..=1.0).contains(&value) {
            return Err(NmcError::InvalidGraph(format!(
                "probability constant must be in [0, 1], got {}",
                value
            )));
        }
        Ok(self.add_constant(NodeValue::Probability(value)))
    }

    pub fn add_constant_vector(&mut self, values: Vec<f64>) -> NodeId {
        self.add_constant(NodeValue::Vector(values))
    }

    /// Add a deterministic node. Its value is computed from the parents'
    /// current values right away.
    pub fn add_operator(&mut self, op: Op, parents: Vec<NodeId>) -> Result<NodeId> {
        self.check_parents(&parents)?;
        let types: Vec<ValueType> = parents.iter().map(|p| self.node(*p).value_type).collect();
        let ty = operator_type(&op, &types)?;
        let id = self.add_node(NodeKind::Operator(op), ty, parents);
        autodiff::eval_node(self, id);
        Ok(id)
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.add_operator(Op::Add, vec![a, b])
    }

    pub fn mul(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.add_operator(Op::Multiply, vec![a, b])
    }

    pub fn neg(&mut self, a: NodeId) -> Result<NodeId> {
        self.add_operator(Op::Negate, vec![a])
    }

    pub fn exp(&mut self, a: NodeId) -> Result<NodeId> {
        self.add_operator(Op::Exp, vec![a])
    }

    pub fn log(&mut self, a: NodeId) -> Result<NodeId> {
        self.add_operator(Op::Log, vec![a])
    }

    pub fn pow(&mut self, base: NodeId, exponent: NodeId) -> Result<NodeId> {
        self.add_operator(Op::Pow, vec![base, exponent])
    }

    pub fn complement(&mut self, p: NodeId) -> Result<NodeId> {
        self.add_operator(Op::Complement, vec![p])
    }

    pub fn logistic(&mut self, x: NodeId) -> Result<NodeId> {
        self.add_operator(Op::Logistic, vec![x])
    }

    pub fn to_real(&mut self, x: NodeId) -> Result<NodeId> {
        self.add_operator(Op::ToReal, vec![x])
    }

    pub fn to_pos_real(&mut self, x: NodeId) -> Result<NodeId> {
        self.add_operator(Op::ToPosReal, vec![x])
    }

    pub fn index(&mut self, vector: NodeId, i: usize) -> Result<NodeId> {
        self.add_operator(Op::Index(i), vec![vector])
    }

    /// Add a random variable drawn from `dist`, parameterized by `parents`.
    pub fn add_stochastic(&mut self, dist: Dist, parents: Vec<NodeId>) -> Result<NodeId> {
        self.check_parents(&parents)?;
        let types: Vec<ValueType> = parents.iter().map(|p| self.node(*p).value_type).collect();
        let ty = dist.sample_type(&types)?;
        Ok(self.add_node(NodeKind::Stochastic(dist), ty, parents))
    }

    pub fn normal(&mut self, mu: NodeId, sigma: NodeId) -> Result<NodeId> {
        self.add_stochastic(Dist::Normal, vec![mu, sigma])
    }

    pub fn half_cauchy(&mut self, scale: NodeId) -> Result<NodeId> {
        self.add_stochastic(Dist::HalfCauchy, vec![scale])
    }

    pub fn gamma(&mut self, shape: NodeId, rate: NodeId) -> Result<NodeId> {
        self.add_stochastic(Dist::Gamma, vec![shape, rate])
    }

    pub fn beta(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.add_stochastic(Dist::Beta, vec![a, b])
    }

    pub fn bernoulli(&mut self, p: NodeId) -> Result<NodeId> {
        self.add_stochastic(Dist::Bernoulli, vec![p])
    }

    /// Dirichlet over a simplex. A constant concentration must be strictly
    /// positive and finite.
    pub fn dirichlet(&mut self, alpha: NodeId) -> Result<NodeId> {
        self.check_parents(&[alpha])?;
        let node = self.node(alpha);
        if matches!(node.kind, NodeKind::Constant)
            && node.value.elements().iter().any(|a| !(a.is_finite() && *a > 0.0))
        {
            return Err(NmcError::InvalidGraph(format!(
                "Dirichlet concentration {} must be positive, got {:?}",
                alpha,
                node.value.elements()
            )));
        }
        self.add_stochastic(Dist::Dirichlet, vec![alpha])
    }

    pub fn flat(&mut self, ty: ValueType) -> Result<NodeId> {
        self.add_stochastic(Dist::Flat(ty), Vec::new())
    }

    /// Fix a stochastic node to an observed value.
    pub fn observe(&mut self, id: NodeId, value: NodeValue) -> Result<()> {
        self.check_parents(&[id])?;
        let node = &mut self.nodes[id.0];
        if !node.is_stochastic() {
            return Err(NmcError::InvalidGraph(format!(
                "only stochastic nodes can be observed, {} is not",
                id
            )));
        }
        if value.value_type() != node.value_type {
            return Err(NmcError::InvalidGraph(format!(
                "observation of type {} does not match {} of type {}",
                value.value_type(),
                id,
                node.value_type
            )));
        }
        node.value = value;
        node.observed = true;
        Ok(())
    }

    /// Mark a node as queried; returns its position in the output rows.
    pub fn query(&mut self, id: NodeId) -> Result<usize> {
        self.check_parents(&[id])?;
        if let Some(pos) = self.queries.iter().position(|q| *q == id) {
            return Ok(pos);
        }
        self.nodes[id.0].queried = true;
        self.queries.push(id);
        Ok(self.queries.len() - 1)
    }

    /// Nodes whose value or log-probability changes when `root` changes.
    ///
    /// Walks children from `root`, restricted to nodes for which `in_scope`
    /// holds. Deterministic nodes are collected and walked through; stochastic
    /// nodes are collected and not walked through, since their own value does
    /// not move. `root` itself is the first stochastic entry. Both lists come
    /// back in ascending id order, which is also evaluation order.
    pub fn compute_affected_nodes<F>(&self, root: NodeId, in_scope: F) -> (Vec<NodeId>, Vec<NodeId>)
    where
        F: Fn(NodeId) -> bool,
    {
        let mut det = BTreeSet::new();
        let mut sto = BTreeSet::new();
        sto.insert(root);
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            for &child in &self.node(id).children {
                if !in_scope(child) || det.contains(&child) || sto.contains(&child) {
                    continue;
                }
                match self.node(child).kind {
                    NodeKind::Stochastic(_) => {
                        sto.insert(child);
                    }
                    NodeKind::Operator(_) => {
                        det.insert(child);
                        stack.push(child);
                    }
                    NodeKind::Constant => {}
                }
            }
        }
        (det.into_iter().collect(), sto.into_iter().collect())
    }
}

fn operator_type(op: &Op, parents: &[ValueType]) -> Result<ValueType> {
    let invalid = |msg: &str| Err(NmcError::InvalidGraph(format!("{:?}: {}", op, msg)));
    let arity = |n: usize| parents.len() == n;
    match op {
        Op::Add | Op::Multiply => {
            if parents.len() < 2 {
                return invalid("needs at least two operands");
            }
            let first = parents[0];
            if !first.is_continuous_scalar() || parents.iter().any(|t| *t != first) {
                return invalid("operands must share one continuous scalar type");
            }
            match (op, first) {
                (Op::Add, ValueType::Probability) => invalid("sum of probabilities is not a probability"),
                _ => Ok(first),
            }
        }
        Op::Negate if arity(1) && parents[0] == ValueType::Real => Ok(ValueType::Real),
        Op::Exp if arity(1) && parents[0] == ValueType::Real => Ok(ValueType::PosReal),
        Op::Log if arity(1) && parents[0] == ValueType::PosReal => Ok(ValueType::Real),
        Op::Pow if arity(2) && parents.iter().all(|t| t.is_continuous_scalar()) => {
            match parents[0] {
                ValueType::Real => Ok(ValueType::Real),
                _ => Ok(ValueType::PosReal),
            }
        }
        Op::Complement if arity(1) && parents[0] == ValueType::Probability => {
            Ok(ValueType::Probability)
        }
        Op::Logistic if arity(1) && parents[0] == ValueType::Real => Ok(ValueType::Probability),
        Op::ToReal if arity(1) && parents[0].is_continuous_scalar() => Ok(ValueType::Real),
        Op::ToPosReal
            if arity(1) && matches!(parents[0], ValueType::PosReal | ValueType::Probability) =>
        {
            Ok(ValueType::PosReal)
        }
        Op::Index(i) if arity(1) => match parents[0] {
            ValueType::Simplex(n) if *i < n => Ok(ValueType::Probability),
            ValueType::Vector(n) if *i < n => Ok(ValueType::Real),
            _ => invalid("index out of range or operand is not a vector"),
        },
        _ => invalid("operand types do not match the operator"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_values_computed_on_construction() {
        let mut g = Graph::new();
        let a = g.add_constant_real(1.5);
        let b = g.add_constant_real(2.0);
        let s = g.add(a, b).unwrap();
        let e = g.exp(s).unwrap();
        assert_eq!(g.node(s).value, NodeValue::Real(3.5));
        assert_eq!(g.node(e).value_type, ValueType::PosReal);
        assert!((g.node(e).value.as_scalar().unwrap() - 3.5f64.exp()).abs() < 1e-12);
        assert_eq!(g.node(a).children, vec![s]);
    }

    #[test]
    fn test_operator_type_errors() {
        let mut g = Graph::new();
        let r = g.add_constant_real(1.0);
        let p = g.add_constant_probability(0.3).unwrap();
        assert!(g.log(r).is_err());
        assert!(g.add(r, p).is_err());
        assert!(g.add(p, p).is_err());
        assert!(g.index(r, 0).is_err());
        assert!(g.add(r, NodeId(99)).is_err());
        assert!(g.add_constant_pos_real(0.0).is_err());
    }

    #[test]
    fn test_dirichlet_rejects_non_positive_concentration() {
        let mut g = Graph::new();
        for alpha in [vec![1.0, 0.0, 2.0], vec![1.0, -0.5], vec![f64::NAN, 1.0]] {
            let a = g.add_constant_vector(alpha);
            assert!(matches!(g.dirichlet(a), Err(NmcError::InvalidGraph(_))));
        }
        let a = g.add_constant_vector(vec![0.5, 2.0]);
        let theta = g.dirichlet(a).unwrap();
        assert_eq!(g.node(theta).value_type, ValueType::Simplex(2));
    }

    #[test]
    fn test_observe_checks_kind_and_type() {
        let mut g = Graph::new();
        let mu = g.add_constant_real(0.0);
        let sigma = g.add_constant_pos_real(1.0).unwrap();
        let x = g.normal(mu, sigma).unwrap();
        assert!(g.observe(mu, NodeValue::Real(1.0)).is_err());
        assert!(g.observe(x, NodeValue::PosReal(1.0)).is_err());
        g.observe(x, NodeValue::Real(0.25)).unwrap();
        assert!(g.node(x).observed);
        assert_eq!(g.node(x).value, NodeValue::Real(0.25));
    }

    #[test]
    fn test_query_positions_are_stable() {
        let mut g = Graph::new();
        let a = g.add_constant_real(0.0);
        let b = g.add_constant_real(1.0);
        assert_eq!(g.query(a).unwrap(), 0);
        assert_eq!(g.query(b).unwrap(), 1);
        assert_eq!(g.query(a).unwrap(), 0);
        assert_eq!(g.queries(), &[a, b]);
    }

    #[test]
    fn test_affected_nodes_stop_at_stochastic_boundary() {
        let mut g = Graph::new();
        let zero = g.add_constant_real(0.0);
        let one = g.add_constant_pos_real(1.0).unwrap();
        let x = g.normal(zero, one).unwrap();
        let shifted = g.add(x, zero).unwrap();
        let y = g.normal(shifted, one).unwrap();
        let z = g.normal(y, one).unwrap();
        let (det, sto) = g.compute_affected_nodes(x, |_| true);
        assert_eq!(det, vec![shifted]);
        assert_eq!(sto, vec![x, y]);
        let (det, sto) = g.compute_affected_nodes(y, |_| true);
        assert!(det.is_empty());
        assert_eq!(sto, vec![y, z]);
        let (_, sto) = g.compute_affected_nodes(x, |id| id != y);
        assert_eq!(sto, vec![x]);
    }
}
