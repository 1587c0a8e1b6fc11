//! # IR Optimizer
//!
//! Optional passes over an [`IRProgram`], applied to fixpoint:
//!
//! - Constant folding: literal-only boolean, arithmetic, comparison,
//!   conditional, and string-interpolation nodes collapse to literals.
//! - Dead code elimination: nodes unreachable from the declared outputs
//!   (via the reverse dependency closure) are removed.
//! - Common subexpression elimination: pure inline nodes with the same
//!   operation and the same inputs are merged; bindings are rewritten.
//!
//! The output set, node types, and topological-order consistency are
//! preserved. Module calls are never folded or merged; their options
//! (cache, retry, throttle) make them observably distinct.

use super::{IRNode, IRProgram, NodeId};
use crate::value::CValue;
use std::collections::HashMap;

/// Fixpoint optimizer.
pub struct Optimizer {
    max_iterations: usize,
}

impl Default for Optimizer {
    fn default() -> Self {
        Optimizer { max_iterations: 10 }
    }
}

impl Optimizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(max_iterations: usize) -> Self {
        Optimizer { max_iterations }
    }

    /// Optimize to fixpoint or until `max_iterations` passes ran.
    pub fn optimize(&self, ir: IRProgram) -> IRProgram {
        let mut current = ir;
        for _ in 0..self.max_iterations {
            let folded = fold_constants(current.clone());
            let eliminated = eliminate_dead_code(folded);
            let shared = share_subexpressions(eliminated);
            if shared == current {
                break;
            }
            current = shared;
        }
        current
    }
}

// ============================================================================
// Constant folding
// ============================================================================

fn literal_of(
    ir: &IRProgram,
    replacements: &HashMap<NodeId, NodeId>,
    target: NodeId,
) -> Option<CValue> {
    match ir.nodes.get(&resolve(replacements, target)) {
        Some(IRNode::Literal { value, .. }) => Some(value.clone()),
        _ => None,
    }
}

fn fold_constants(mut ir: IRProgram) -> IRProgram {
    // Conditionals with a literal condition alias to the taken branch
    let mut replacements: HashMap<NodeId, NodeId> = HashMap::new();

    for id in ir.topological_order.clone() {
        let node = ir.nodes[&id].clone();

        let folded: Option<CValue> = match &node {
            IRNode::And { left, right } => {
                match (
                    literal_of(&ir, &replacements, *left),
                    literal_of(&ir, &replacements, *right),
                ) {
                    (Some(CValue::Boolean(l)), Some(CValue::Boolean(r))) => {
                        Some(CValue::Boolean(l && r))
                    }
                    _ => None,
                }
            }
            IRNode::Or { left, right } => {
                match (
                    literal_of(&ir, &replacements, *left),
                    literal_of(&ir, &replacements, *right),
                ) {
                    (Some(CValue::Boolean(l)), Some(CValue::Boolean(r))) => {
                        Some(CValue::Boolean(l || r))
                    }
                    _ => None,
                }
            }
            IRNode::Not { operand } => {
                match literal_of(&ir, &replacements, *operand) {
                    Some(CValue::Boolean(b)) => Some(CValue::Boolean(!b)),
                    _ => None,
                }
            }
            IRNode::Scalar { op, left, right, .. } => {
                match (
                    literal_of(&ir, &replacements, *left),
                    literal_of(&ir, &replacements, *right),
                ) {
                    (Some(l), Some(r)) => op.eval(&l, &r),
                    _ => None,
                }
            }
            IRNode::StringInterpolation { parts, expressions } => {
                let values: Option<Vec<CValue>> = expressions
                    .iter()
                    .map(|e| literal_of(&ir, &replacements, *e))
                    .collect();
                values.map(|values| {
                    let mut text = String::new();
                    for (part, value) in parts.iter().zip(values.iter()) {
                        text.push_str(part);
                        text.push_str(&value.render_raw());
                    }
                    if let Some(last) = parts.last() {
                        text.push_str(last);
                    }
                    CValue::String(text)
                })
            }
            IRNode::Conditional {
                cond,
                then_node,
                else_node,
                ..
            } => {
                if let Some(CValue::Boolean(taken)) =
                    literal_of(&ir, &replacements, *cond)
                {
                    let target = if taken { *then_node } else { *else_node };
                    let target = resolve(&replacements, target);
                    replacements.insert(id, target);
                }
                None
            }
            _ => None,
        };

        if let Some(value) = folded {
            let output_type = value.ctype();
            ir.nodes.insert(id, IRNode::Literal { value, output_type });
        }
    }

    if !replacements.is_empty() {
        apply_replacements(&mut ir, &replacements);
    }
    ir
}

fn resolve(replacements: &HashMap<NodeId, NodeId>, mut id: NodeId) -> NodeId {
    while let Some(next) = replacements.get(&id) {
        id = *next;
    }
    id
}


// ============================================================================
// Dead code elimination
// ============================================================================

fn eliminate_dead_code(mut ir: IRProgram) -> IRProgram {
    let live = ir.live_nodes();
    ir.nodes.retain(|id, _| live.contains(id));
    ir.topological_order.retain(|id| live.contains(id));
    ir.variable_bindings.retain(|_, id| live.contains(id));
    ir
}

// ============================================================================
// Common subexpression elimination
// ============================================================================

/// Pure inline nodes are mergeable; module calls and input slots never
/// are. Lambda-carrying nodes merge only when their whole body tables
/// match, which the structural key covers.
fn mergeable(node: &IRNode) -> bool {
    !matches!(node, IRNode::Input { .. } | IRNode::ModuleCall { .. })
}

fn share_subexpressions(mut ir: IRProgram) -> IRProgram {
    let mut replacements: HashMap<NodeId, NodeId> = HashMap::new();
    let mut seen: HashMap<String, NodeId> = HashMap::new();

    for id in ir.topological_order.clone() {
        // Canonicalize inputs against earlier merges before keying
        let mut node = ir.nodes[&id].clone();
        rewrite_node(&mut node, &replacements);
        ir.nodes.insert(id, node.clone());

        if !mergeable(&node) {
            continue;
        }
        let key = format!("{node:?}");
        match seen.get(&key) {
            Some(first) => {
                replacements.insert(id, *first);
            }
            None => {
                seen.insert(key, id);
            }
        }
    }

    if replacements.is_empty() {
        return ir;
    }
    for id in replacements.keys() {
        ir.nodes.remove(id);
    }
    ir.topological_order
        .retain(|id| !replacements.contains_key(id));
    apply_replacements(&mut ir, &replacements);
    ir
}

fn apply_replacements(ir: &mut IRProgram, replacements: &HashMap<NodeId, NodeId>) {
    for node in ir.nodes.values_mut() {
        rewrite_node(node, replacements);
    }
    for id in ir.variable_bindings.values_mut() {
        *id = resolve(replacements, *id);
    }
    // Drop replaced nodes that are no longer referenced
    let live = ir.live_nodes();
    ir.nodes
        .retain(|id, _| live.contains(id) || !replacements.contains_key(id));
    ir.topological_order
        .retain(|id| ir.nodes.contains_key(id));
}

fn rewrite_node(node: &mut IRNode, replacements: &HashMap<NodeId, NodeId>) {
    let fix = |id: &mut NodeId| *id = resolve(replacements, *id);
    match node {
        IRNode::Input { .. } | IRNode::Literal { .. } => {}
        IRNode::ModuleCall { inputs, options, .. } => {
            for id in inputs.values_mut() {
                fix(id);
            }
            if let Some(fallback) = &mut options.fallback {
                fix(fallback);
            }
        }
        IRNode::MakeList { items, .. } => {
            for id in items {
                fix(id);
            }
        }
        IRNode::MakeRecord { fields, .. } => {
            for id in fields.values_mut() {
                fix(id);
            }
        }
        IRNode::Merge { left, right, .. }
        | IRNode::Coalesce { left, right, .. }
        | IRNode::And { left, right }
        | IRNode::Or { left, right }
        | IRNode::Scalar { left, right, .. } => {
            fix(left);
            fix(right);
        }
        IRNode::Project { source, .. } | IRNode::FieldAccess { source, .. } => fix(source),
        IRNode::Conditional {
            cond,
            then_node,
            else_node,
            ..
        } => {
            fix(cond);
            fix(then_node);
            fix(else_node);
        }
        IRNode::Not { operand } => fix(operand),
        IRNode::Guard { expr, cond, .. } => {
            fix(expr);
            fix(cond);
        }
        IRNode::Branch {
            cases, otherwise, ..
        } => {
            for (cond, value) in cases {
                fix(cond);
                fix(value);
            }
            fix(otherwise);
        }
        IRNode::StringInterpolation { expressions, .. } => {
            for id in expressions {
                fix(id);
            }
        }
        IRNode::Match {
            scrutinee,
            captured_inputs,
            ..
        } => {
            fix(scrutinee);
            for id in captured_inputs.values_mut() {
                fix(id);
            }
        }
        IRNode::HigherOrder {
            source,
            captured_inputs,
            ..
        } => {
            fix(source);
            for id in captured_inputs.values_mut() {
                fix(id);
            }
        }
    }
}
