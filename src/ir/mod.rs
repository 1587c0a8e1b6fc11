//! # Intermediate Representation
//!
//! The typed DAG produced from a checked program and consumed by the
//! DAG compiler. Nodes are keyed by UUID; `topological_order` is a valid
//! linear extension of the dependency graph, sources first.
//!
//! Lambda bodies are small IR sub-graphs with their own node table and
//! output node. Outer-scope names referenced inside a lambda resolve to
//! auxiliary parameter nodes recorded in `captured_bindings`; the
//! enclosing higher-order node wires each captured name to the outer
//! node computing it.

pub mod generate;
pub mod optimize;

pub use generate::generate_ir;
pub use optimize::Optimizer;

use crate::error::CompileError;
use crate::value::{CType, CValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Node identifier, unique within one program (or one lambda body).
pub type NodeId = Uuid;

// ============================================================================
// Module-call options
// ============================================================================

/// Retry delay growth per attempt.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
pub enum BackoffStrategy {
    /// `delay`
    #[default]
    Fixed,
    /// `delay * attempt`
    Linear,
    /// `delay * 2^(attempt-1)`
    Exponential,
}

impl BackoffStrategy {
    /// Delay multiplier for a 1-based attempt number.
    pub fn factor(self, attempt: u32) -> u64 {
        match self {
            BackoffStrategy::Fixed => 1,
            BackoffStrategy::Linear => u64::from(attempt),
            BackoffStrategy::Exponential => 1u64 << attempt.saturating_sub(1).min(62),
        }
    }
}

/// Policy when a module fails with no fallback configured.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
pub enum ErrorStrategy {
    /// Propagate the failure downstream
    #[default]
    Fail,
    /// Produce the zero value of the output type
    Skip,
    /// Emit a diagnostic, then produce the zero value
    Log,
    /// Wrap the error into the output union type when possible
    Wrap,
}

/// Named scheduler priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PriorityLevel {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

impl PriorityLevel {
    pub fn value(self) -> u8 {
        match self {
            PriorityLevel::Critical => 95,
            PriorityLevel::High => 80,
            PriorityLevel::Normal => 50,
            PriorityLevel::Low => 30,
            PriorityLevel::Background => 10,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "critical" => Some(PriorityLevel::Critical),
            "high" => Some(PriorityLevel::High),
            "normal" => Some(PriorityLevel::Normal),
            "low" => Some(PriorityLevel::Low),
            "background" => Some(PriorityLevel::Background),
            _ => None,
        }
    }
}

/// Streaming option image. Validated by the analyzer; evaluated by the
/// streaming engine, which is a downstream consumer of the spec.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamingOptions {
    pub batch: Option<u64>,
    pub window_ms: Option<u64>,
    pub join: Option<String>,
    pub checkpoint_ms: Option<u64>,
}

impl StreamingOptions {
    pub fn is_empty(&self) -> bool {
        self.batch.is_none()
            && self.window_ms.is_none()
            && self.join.is_none()
            && self.checkpoint_ms.is_none()
    }
}

/// Normalized per-call resilience options. Durations are milliseconds;
/// priority is on the 0..=100 scale.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IRModuleCallOptions {
    pub retry: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub delay_ms: Option<u64>,
    pub backoff: BackoffStrategy,
    /// Data node whose value is used when all retries fail
    pub fallback: Option<NodeId>,
    pub cache_ttl_ms: Option<u64>,
    pub cache_backend: Option<String>,
    /// `(count, window_ms)` token-bucket rate
    pub throttle: Option<(u32, u64)>,
    pub concurrency: Option<u32>,
    pub on_error: ErrorStrategy,
    pub lazy: bool,
    pub priority: Option<u8>,
    pub streaming: StreamingOptions,
}

// ============================================================================
// Nodes
// ============================================================================

/// Arithmetic and comparison operators over scalars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl ScalarOp {
    /// Evaluate over two values. `None` when the operand types do not
    /// support the operation (the type checker rules those out; the
    /// optimizer also declines to fold overflowing integer arithmetic).
    pub fn eval(self, left: &CValue, right: &CValue) -> Option<CValue> {
        use CValue::{Boolean, Float, Int, String};
        let value = match (self, left, right) {
            (ScalarOp::Add, Int(l), Int(r)) => Int(l.checked_add(*r)?),
            (ScalarOp::Sub, Int(l), Int(r)) => Int(l.checked_sub(*r)?),
            (ScalarOp::Mul, Int(l), Int(r)) => Int(l.checked_mul(*r)?),
            (ScalarOp::Div, Int(l), Int(r)) => Int(l.checked_div(*r)?),
            (ScalarOp::Add, Float(l), Float(r)) => Float(l + r),
            (ScalarOp::Sub, Float(l), Float(r)) => Float(l - r),
            (ScalarOp::Mul, Float(l), Float(r)) => Float(l * r),
            (ScalarOp::Div, Float(l), Float(r)) => Float(l / r),
            (ScalarOp::Add, String(l), String(r)) => String(format!("{l}{r}")),
            (ScalarOp::Eq, l, r) => Boolean(l == r),
            (ScalarOp::Ne, l, r) => Boolean(l != r),
            (ScalarOp::Lt, Int(l), Int(r)) => Boolean(l < r),
            (ScalarOp::Le, Int(l), Int(r)) => Boolean(l <= r),
            (ScalarOp::Gt, Int(l), Int(r)) => Boolean(l > r),
            (ScalarOp::Ge, Int(l), Int(r)) => Boolean(l >= r),
            (ScalarOp::Lt, Float(l), Float(r)) => Boolean(l < r),
            (ScalarOp::Le, Float(l), Float(r)) => Boolean(l <= r),
            (ScalarOp::Gt, Float(l), Float(r)) => Boolean(l > r),
            (ScalarOp::Ge, Float(l), Float(r)) => Boolean(l >= r),
            (ScalarOp::Lt, String(l), String(r)) => Boolean(l < r),
            (ScalarOp::Le, String(l), String(r)) => Boolean(l <= r),
            (ScalarOp::Gt, String(l), String(r)) => Boolean(l > r),
            (ScalarOp::Ge, String(l), String(r)) => Boolean(l >= r),
            _ => return None,
        };
        Some(value)
    }
}

/// Higher-order list operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HigherOrderOp {
    Filter,
    Map,
    All,
    Any,
}

impl HigherOrderOp {
    pub fn name(self) -> &'static str {
        match self {
            HigherOrderOp::Filter => "filter",
            HigherOrderOp::Map => "map",
            HigherOrderOp::All => "all",
            HigherOrderOp::Any => "any",
        }
    }
}

/// A compiled lambda: an IR sub-graph invoked per element (or per match
/// arm) with a fresh scope seeded from the parameters and captures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedLambda {
    pub param_names: Vec<String>,
    /// Internal node table; ids are scoped to this lambda
    pub body_nodes: BTreeMap<NodeId, IRNode>,
    pub body_output: NodeId,
    /// Captured outer name -> auxiliary parameter node inside the body
    pub captured_bindings: BTreeMap<String, NodeId>,
}

/// One IR node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IRNode {
    /// Top-level input slot
    Input { name: String, output_type: CType },
    /// External module invocation
    ModuleCall {
        module_name: String,
        function_name: String,
        inputs: BTreeMap<String, NodeId>,
        output_type: CType,
        options: IRModuleCallOptions,
    },
    Literal { value: CValue, output_type: CType },
    /// List constructor from element nodes
    MakeList {
        items: Vec<NodeId>,
        elem_type: CType,
    },
    /// Record constructor from field nodes
    MakeRecord {
        fields: BTreeMap<String, NodeId>,
        output_type: CType,
    },
    /// Right-biased record merge
    Merge {
        left: NodeId,
        right: NodeId,
        output_type: CType,
    },
    /// Record field selection
    Project {
        source: NodeId,
        fields: Vec<String>,
        output_type: CType,
    },
    FieldAccess {
        source: NodeId,
        field: String,
        output_type: CType,
    },
    /// Ternary selection
    Conditional {
        cond: NodeId,
        then_node: NodeId,
        else_node: NodeId,
        output_type: CType,
    },
    And { left: NodeId, right: NodeId },
    Or { left: NodeId, right: NodeId },
    Not { operand: NodeId },
    /// Arithmetic or comparison
    Scalar {
        op: ScalarOp,
        left: NodeId,
        right: NodeId,
        output_type: CType,
    },
    /// `expr when cond` -> Optional<inner>
    Guard {
        expr: NodeId,
        cond: NodeId,
        inner_type: CType,
    },
    /// `a ?? b`
    Coalesce {
        left: NodeId,
        right: NodeId,
        result_type: CType,
    },
    /// Ordered cases with short-circuit; `otherwise` is mandatory
    Branch {
        cases: Vec<(NodeId, NodeId)>,
        otherwise: NodeId,
        result_type: CType,
    },
    /// Template; `parts.len() == expressions.len() + 1`
    StringInterpolation {
        parts: Vec<String>,
        expressions: Vec<NodeId>,
    },
    /// Union discrimination; each arm covers a set of variant tags and
    /// its lambda receives the narrowed value
    Match {
        scrutinee: NodeId,
        arms: Vec<(Vec<String>, TypedLambda)>,
        default: Option<TypedLambda>,
        output_type: CType,
        /// Captured outer name -> outer node, shared across arm lambdas
        captured_inputs: BTreeMap<String, NodeId>,
    },
    /// filter/map/all/any over a list
    HigherOrder {
        op: HigherOrderOp,
        source: NodeId,
        lambda: TypedLambda,
        output_type: CType,
        /// Captured outer name -> outer node computing it
        captured_inputs: BTreeMap<String, NodeId>,
    },
}

impl IRNode {
    /// The type of the value this node produces.
    pub fn output_type(&self) -> CType {
        match self {
            IRNode::Input { output_type, .. }
            | IRNode::ModuleCall { output_type, .. }
            | IRNode::Literal { output_type, .. }
            | IRNode::Merge { output_type, .. }
            | IRNode::Project { output_type, .. }
            | IRNode::FieldAccess { output_type, .. }
            | IRNode::Conditional { output_type, .. }
            | IRNode::Scalar { output_type, .. }
            | IRNode::Match { output_type, .. }
            | IRNode::MakeRecord { output_type, .. }
            | IRNode::HigherOrder { output_type, .. } => output_type.clone(),
            IRNode::MakeList { elem_type, .. } => {
                CType::List(Box::new(elem_type.clone()))
            }
            IRNode::And { .. } | IRNode::Or { .. } | IRNode::Not { .. } => CType::Boolean,
            IRNode::Guard { inner_type, .. } => {
                CType::Optional(Box::new(inner_type.clone()))
            }
            IRNode::Coalesce { result_type, .. }
            | IRNode::Branch { result_type, .. } => result_type.clone(),
            IRNode::StringInterpolation { .. } => CType::String,
        }
    }

    /// Node ids this node reads, in a fixed order. Lambda bodies are
    /// internal and do not appear; captured inputs do.
    pub fn dependencies(&self) -> Vec<NodeId> {
        match self {
            IRNode::Input { .. } | IRNode::Literal { .. } => vec![],
            IRNode::MakeList { items, .. } => items.clone(),
            IRNode::MakeRecord { fields, .. } => fields.values().copied().collect(),
            IRNode::ModuleCall { inputs, options, .. } => {
                let mut deps: Vec<NodeId> = inputs.values().copied().collect();
                if let Some(fallback) = options.fallback {
                    deps.push(fallback);
                }
                deps
            }
            IRNode::Merge { left, right, .. }
            | IRNode::Coalesce { left, right, .. }
            | IRNode::And { left, right }
            | IRNode::Or { left, right }
            | IRNode::Scalar { left, right, .. } => vec![*left, *right],
            IRNode::Project { source, .. } | IRNode::FieldAccess { source, .. } => {
                vec![*source]
            }
            IRNode::Conditional {
                cond,
                then_node,
                else_node,
                ..
            } => vec![*cond, *then_node, *else_node],
            IRNode::Not { operand } => vec![*operand],
            IRNode::Guard { expr, cond, .. } => vec![*expr, *cond],
            IRNode::Branch {
                cases, otherwise, ..
            } => {
                let mut deps = Vec::with_capacity(cases.len() * 2 + 1);
                for (cond, value) in cases {
                    deps.push(*cond);
                    deps.push(*value);
                }
                deps.push(*otherwise);
                deps
            }
            IRNode::StringInterpolation { expressions, .. } => expressions.clone(),
            IRNode::Match {
                scrutinee,
                captured_inputs,
                ..
            } => {
                let mut deps = vec![*scrutinee];
                deps.extend(captured_inputs.values().copied());
                deps
            }
            IRNode::HigherOrder {
                source,
                captured_inputs,
                ..
            } => {
                let mut deps = vec![*source];
                deps.extend(captured_inputs.values().copied());
                deps
            }
        }
    }
}

// ============================================================================
// Programs
// ============================================================================

/// A complete IR program.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IRProgram {
    pub nodes: BTreeMap<NodeId, IRNode>,
    /// Sources first; consistent with `dependencies()`
    pub topological_order: Vec<NodeId>,
    /// Variable name -> node computing it
    pub variable_bindings: BTreeMap<String, NodeId>,
    /// Output names in declaration order
    pub declared_outputs: Vec<String>,
}

impl IRProgram {
    /// Check the structural invariants: all referenced ids exist, the
    /// topological order covers every node exactly once and respects
    /// dependencies, bindings and outputs resolve.
    pub fn validate(&self) -> Result<(), CompileError> {
        let internal = |message: String| CompileError::InternalError { message };

        if self.topological_order.len() != self.nodes.len() {
            return Err(internal(format!(
                "topological order covers {} of {} nodes",
                self.topological_order.len(),
                self.nodes.len()
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for id in &self.topological_order {
            let node = self
                .nodes
                .get(id)
                .ok_or_else(|| internal(format!("order references unknown node {id}")))?;
            for dep in node.dependencies() {
                if !self.nodes.contains_key(&dep) {
                    return Err(internal(format!("node {id} references unknown node {dep}")));
                }
                if !seen.contains(&dep) {
                    return Err(internal(format!(
                        "node {id} appears before its dependency {dep}"
                    )));
                }
            }
            if !seen.insert(*id) {
                return Err(internal(format!("node {id} appears twice in order")));
            }
        }

        for (name, id) in &self.variable_bindings {
            if !self.nodes.contains_key(id) {
                return Err(internal(format!(
                    "binding '{name}' references unknown node {id}"
                )));
            }
        }
        for name in &self.declared_outputs {
            if !self.variable_bindings.contains_key(name) {
                return Err(internal(format!("output '{name}' has no binding")));
            }
        }
        Ok(())
    }

    /// Node ids reachable from the declared outputs (reverse dependency
    /// closure). Used by dead-code elimination and the DAG compiler.
    pub fn live_nodes(&self) -> std::collections::HashSet<NodeId> {
        let mut live = std::collections::HashSet::new();
        let mut stack: Vec<NodeId> = self
            .declared_outputs
            .iter()
            .filter_map(|name| self.variable_bindings.get(name).copied())
            .collect();
        while let Some(id) = stack.pop() {
            if !live.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                stack.extend(node.dependencies());
            }
        }
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_factors() {
        assert_eq!(BackoffStrategy::Fixed.factor(1), 1);
        assert_eq!(BackoffStrategy::Fixed.factor(5), 1);
        assert_eq!(BackoffStrategy::Linear.factor(3), 3);
        assert_eq!(BackoffStrategy::Exponential.factor(1), 1);
        assert_eq!(BackoffStrategy::Exponential.factor(2), 2);
        assert_eq!(BackoffStrategy::Exponential.factor(4), 8);
    }

    #[test]
    fn test_priority_levels() {
        assert_eq!(PriorityLevel::parse("critical").map(PriorityLevel::value), Some(95));
        assert_eq!(PriorityLevel::parse("high").map(PriorityLevel::value), Some(80));
        assert_eq!(PriorityLevel::parse("normal").map(PriorityLevel::value), Some(50));
        assert_eq!(PriorityLevel::parse("low").map(PriorityLevel::value), Some(30));
        assert_eq!(PriorityLevel::parse("background").map(PriorityLevel::value), Some(10));
        assert_eq!(PriorityLevel::parse("urgent"), None);
    }

    #[test]
    fn test_validate_accepts_well_formed_program() {
        let input_id = Uuid::new_v4();
        let not_id = Uuid::new_v4();
        let mut nodes = BTreeMap::new();
        nodes.insert(
            input_id,
            IRNode::Input {
                name: "flag".to_string(),
                output_type: CType::Boolean,
            },
        );
        nodes.insert(not_id, IRNode::Not { operand: input_id });

        let program = IRProgram {
            nodes,
            topological_order: vec![input_id, not_id],
            variable_bindings: [("negated".to_string(), not_id)].into_iter().collect(),
            declared_outputs: vec!["negated".to_string()],
        };
        program.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_order_violation() {
        let input_id = Uuid::new_v4();
        let not_id = Uuid::new_v4();
        let mut nodes = BTreeMap::new();
        nodes.insert(
            input_id,
            IRNode::Input {
                name: "flag".to_string(),
                output_type: CType::Boolean,
            },
        );
        nodes.insert(not_id, IRNode::Not { operand: input_id });

        let program = IRProgram {
            nodes,
            topological_order: vec![not_id, input_id],
            variable_bindings: BTreeMap::new(),
            declared_outputs: vec![],
        };
        assert!(program.validate().is_err());
    }

    #[test]
    fn test_live_nodes_excludes_unreachable() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut nodes = BTreeMap::new();
        nodes.insert(
            a,
            IRNode::Input {
                name: "a".to_string(),
                output_type: CType::Int,
            },
        );
        nodes.insert(
            b,
            IRNode::Input {
                name: "b".to_string(),
                output_type: CType::Int,
            },
        );
        let program = IRProgram {
            nodes,
            topological_order: vec![a, b],
            variable_bindings: [("a".to_string(), a), ("b".to_string(), b)]
                .into_iter()
                .collect(),
            declared_outputs: vec!["a".to_string()],
        };
        let live = program.live_nodes();
        assert!(live.contains(&a));
        assert!(!live.contains(&b));
    }
}
