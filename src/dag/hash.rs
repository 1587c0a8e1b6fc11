//! Canonical encoding and structural hashing.
//!
//! The structural hash is SHA-256 over a canonical byte encoding of a
//! [`DagSpec`]: nodes are emitted in a deterministic traversal order,
//! UUIDs are replaced by monotonically-assigned indices in emission
//! order, map fields iterate sorted, and numeric values encode through
//! the canonical value encoding (so `2` and `2.0` stay distinct). Two
//! compilations of the same program hash identically even though every
//! run draws fresh UUIDs.
//!
//! The syntactic hash is SHA-256 over the raw source text.

use super::{DagSpec, DataId, InlineTransform, ModuleId, ModuleKind};
use crate::ir::{IRModuleCallOptions, IRNode, NodeId, TypedLambda};
use crate::value::hash::encode_value;
use crate::value::CType;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};

/// SHA-256 of the source text, hex-encoded.
pub fn syntactic_hash(source: &str) -> String {
    hex(&Sha256::digest(source.as_bytes()))
}

/// SHA-256 over the canonical encoding of a spec, hex-encoded.
pub fn structural_hash(spec: &DagSpec) -> String {
    let mut buf = Vec::with_capacity(1024);
    encode_spec(&mut buf, spec);
    hex(&Sha256::digest(&buf))
}

fn hex(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

// ============================================================================
// Canonical node order
// ============================================================================

struct Indices {
    data: HashMap<DataId, u64>,
    modules: HashMap<ModuleId, u64>,
    data_order: Vec<DataId>,
    module_order: Vec<ModuleId>,
}

/// Deterministic traversal: depth-first from the declared outputs,
/// producers before their products, transform inputs in parameter-name
/// order. Stragglers (possible only in un-optimized specs) follow,
/// ordered by node name.
fn canonical_order(spec: &DagSpec) -> Indices {
    let mut indices = Indices {
        data: HashMap::new(),
        modules: HashMap::new(),
        data_order: Vec::new(),
        module_order: Vec::new(),
    };
    let mut visiting: HashSet<DataId> = HashSet::new();

    for name in &spec.declared_outputs {
        if let Some(data_id) = spec.output_bindings.get(name) {
            visit_data(spec, *data_id, &mut indices, &mut visiting);
        }
    }

    let mut leftover_data: Vec<DataId> = spec
        .data
        .keys()
        .filter(|id| !indices.data.contains_key(id))
        .copied()
        .collect();
    leftover_data.sort_by_key(|id| spec.data[id].name.clone());
    for id in leftover_data {
        visit_data(spec, id, &mut indices, &mut visiting);
    }

    let mut leftover_modules: Vec<ModuleId> = spec
        .modules
        .keys()
        .filter(|id| !indices.modules.contains_key(id))
        .copied()
        .collect();
    leftover_modules.sort_by_key(|id| spec.modules[id].metadata.name.clone());
    for id in leftover_modules {
        visit_module(spec, id, &mut indices, &mut visiting);
    }

    indices
}

fn visit_data(
    spec: &DagSpec,
    id: DataId,
    indices: &mut Indices,
    visiting: &mut HashSet<DataId>,
) {
    if indices.data.contains_key(&id) || !visiting.insert(id) {
        return;
    }
    if let Some(module) = spec.producer(id) {
        visit_module(spec, module, indices, visiting);
    } else if let Some(node) = spec.data.get(&id) {
        for input in node.transform_inputs.values() {
            visit_data(spec, *input, indices, visiting);
        }
    }
    if !indices.data.contains_key(&id) {
        indices.data.insert(id, indices.data_order.len() as u64);
        indices.data_order.push(id);
    }
}

fn visit_module(
    spec: &DagSpec,
    id: ModuleId,
    indices: &mut Indices,
    visiting: &mut HashSet<DataId>,
) {
    if indices.modules.contains_key(&id) {
        return;
    }
    // Inputs in parameter-name order
    let mut consumed: Vec<(String, DataId)> = spec
        .consumed_by(id)
        .into_iter()
        .map(|(data, nickname)| (nickname, data))
        .collect();
    consumed.sort();
    for (_, data) in consumed {
        visit_data(spec, data, indices, visiting);
    }
    if let Some(options) = spec.module_options.get(&id) {
        if let Some(fallback) = options.fallback {
            visit_data(spec, fallback, indices, visiting);
        }
    }
    if !indices.modules.contains_key(&id) {
        indices
            .modules
            .insert(id, indices.module_order.len() as u64);
        indices.module_order.push(id);
    }
}

// ============================================================================
// Encoding
// ============================================================================

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u64).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn put_u64(buf: &mut Vec<u8>, n: u64) {
    buf.extend_from_slice(&n.to_be_bytes());
}

fn put_opt_u64(buf: &mut Vec<u8>, n: Option<u64>) {
    match n {
        Some(n) => {
            buf.push(1);
            put_u64(buf, n);
        }
        None => buf.push(0),
    }
}

fn put_ctype(buf: &mut Vec<u8>, ctype: &CType) {
    // CType contains only BTreeMaps, so JSON is canonical
    let json = serde_json::to_vec(ctype).expect("ctype serializes");
    put_u64(buf, json.len() as u64);
    buf.extend_from_slice(&json);
}

fn encode_spec(buf: &mut Vec<u8>, spec: &DagSpec) {
    let indices = canonical_order(spec);

    buf.extend_from_slice(b"constellation-dag-v1");

    put_u64(buf, indices.data_order.len() as u64);
    for data_id in &indices.data_order {
        let node = &spec.data[data_id];
        put_str(buf, &node.name);
        put_ctype(buf, &node.ctype);

        let mut nicknames: Vec<(u64, &String)> = node
            .nicknames
            .iter()
            .filter_map(|(module, name)| indices.modules.get(module).map(|i| (*i, name)))
            .collect();
        nicknames.sort();
        put_u64(buf, nicknames.len() as u64);
        for (module_idx, name) in nicknames {
            put_u64(buf, module_idx);
            put_str(buf, name);
        }

        match &node.inline {
            Some(inline) => {
                buf.push(1);
                encode_inline(buf, inline);
            }
            None => buf.push(0),
        }
        put_u64(buf, node.transform_inputs.len() as u64);
        for (param, input) in &node.transform_inputs {
            put_str(buf, param);
            put_u64(buf, indices.data[input]);
        }
    }

    put_u64(buf, indices.module_order.len() as u64);
    for module_id in &indices.module_order {
        let module = &spec.modules[module_id];
        put_str(buf, &module.metadata.name);
        put_str(buf, &module.metadata.function);
        match &module.metadata.kind {
            ModuleKind::User => buf.push(0),
            ModuleKind::SyntheticBranch { case_count } => {
                buf.push(1);
                put_u64(buf, *case_count as u64);
            }
        }
        match &module.metadata.version {
            Some(version) => {
                buf.push(1);
                put_str(buf, version);
            }
            None => buf.push(0),
        }
        put_u64(buf, module.consumes.len() as u64);
        for (param, ctype) in &module.consumes {
            put_str(buf, param);
            put_ctype(buf, ctype);
        }
        put_u64(buf, module.produces.len() as u64);
        for (name, ctype) in &module.produces {
            put_str(buf, name);
            put_ctype(buf, ctype);
        }
    }

    let mut in_edges: Vec<(u64, u64)> = spec
        .in_edges
        .iter()
        .map(|(d, m)| (indices.data[d], indices.modules[m]))
        .collect();
    in_edges.sort_unstable();
    put_u64(buf, in_edges.len() as u64);
    for (d, m) in in_edges {
        put_u64(buf, d);
        put_u64(buf, m);
    }

    let mut out_edges: Vec<(u64, u64)> = spec
        .out_edges
        .iter()
        .map(|(m, d)| (indices.modules[m], indices.data[d]))
        .collect();
    out_edges.sort_unstable();
    put_u64(buf, out_edges.len() as u64);
    for (m, d) in out_edges {
        put_u64(buf, m);
        put_u64(buf, d);
    }

    put_u64(buf, spec.declared_outputs.len() as u64);
    for name in &spec.declared_outputs {
        put_str(buf, name);
    }
    put_u64(buf, spec.output_bindings.len() as u64);
    for (name, data) in &spec.output_bindings {
        put_str(buf, name);
        put_u64(buf, indices.data[data]);
    }

    let mut options: Vec<(u64, &IRModuleCallOptions)> = spec
        .module_options
        .iter()
        .map(|(m, o)| (indices.modules[m], o))
        .collect();
    options.sort_by_key(|(idx, _)| *idx);
    put_u64(buf, options.len() as u64);
    for (module_idx, opts) in options {
        put_u64(buf, module_idx);
        encode_options(buf, opts, &indices);
    }
}

/// Options serialize in a fixed field order; the fallback reference is
/// emitted as a data index.
fn encode_options(buf: &mut Vec<u8>, options: &IRModuleCallOptions, indices: &Indices) {
    put_opt_u64(buf, options.retry.map(u64::from));
    put_opt_u64(buf, options.timeout_ms);
    put_opt_u64(buf, options.delay_ms);
    buf.push(options.backoff as u8);
    match options.fallback {
        Some(fallback) => {
            buf.push(1);
            put_u64(buf, indices.data[&fallback]);
        }
        None => buf.push(0),
    }
    put_opt_u64(buf, options.cache_ttl_ms);
    match &options.cache_backend {
        Some(backend) => {
            buf.push(1);
            put_str(buf, backend);
        }
        None => buf.push(0),
    }
    match options.throttle {
        Some((count, window_ms)) => {
            buf.push(1);
            put_u64(buf, u64::from(count));
            put_u64(buf, window_ms);
        }
        None => buf.push(0),
    }
    put_opt_u64(buf, options.concurrency.map(u64::from));
    buf.push(options.on_error as u8);
    buf.push(u8::from(options.lazy));
    put_opt_u64(buf, options.priority.map(u64::from));
    put_opt_u64(buf, options.streaming.batch);
    put_opt_u64(buf, options.streaming.window_ms);
    match &options.streaming.join {
        Some(join) => {
            buf.push(1);
            put_str(buf, join);
        }
        None => buf.push(0),
    }
    put_opt_u64(buf, options.streaming.checkpoint_ms);
}

fn encode_inline(buf: &mut Vec<u8>, inline: &InlineTransform) {
    match inline {
        InlineTransform::Literal { value } => {
            buf.push(0);
            encode_value(buf, value);
        }
        InlineTransform::Merge => buf.push(1),
        InlineTransform::Project { fields } => {
            buf.push(2);
            put_u64(buf, fields.len() as u64);
            for field in fields {
                put_str(buf, field);
            }
        }
        InlineTransform::FieldAccess { field } => {
            buf.push(3);
            put_str(buf, field);
        }
        InlineTransform::Conditional => buf.push(4),
        InlineTransform::And => buf.push(5),
        InlineTransform::Or => buf.push(6),
        InlineTransform::Not => buf.push(7),
        InlineTransform::Scalar { op } => {
            buf.push(8);
            buf.push(*op as u8);
        }
        InlineTransform::Guard { inner_type } => {
            buf.push(9);
            put_ctype(buf, inner_type);
        }
        InlineTransform::Coalesce => buf.push(10),
        InlineTransform::Interpolate { parts } => {
            buf.push(11);
            put_u64(buf, parts.len() as u64);
            for part in parts {
                put_str(buf, part);
            }
        }
        InlineTransform::MakeList { elem_type } => {
            buf.push(12);
            put_ctype(buf, elem_type);
        }
        InlineTransform::MakeRecord { fields } => {
            buf.push(13);
            put_u64(buf, fields.len() as u64);
            for field in fields {
                put_str(buf, field);
            }
        }
        InlineTransform::Filter { lambda } => {
            buf.push(14);
            encode_lambda(buf, lambda);
        }
        InlineTransform::Map { lambda } => {
            buf.push(15);
            encode_lambda(buf, lambda);
        }
        InlineTransform::All { lambda } => {
            buf.push(16);
            encode_lambda(buf, lambda);
        }
        InlineTransform::Any { lambda } => {
            buf.push(17);
            encode_lambda(buf, lambda);
        }
        InlineTransform::MatchUnion { arms, default } => {
            buf.push(18);
            put_u64(buf, arms.len() as u64);
            for (tags, lambda) in arms {
                put_u64(buf, tags.len() as u64);
                for tag in tags {
                    put_str(buf, tag);
                }
                encode_lambda(buf, lambda);
            }
            match default {
                Some(lambda) => {
                    buf.push(1);
                    encode_lambda(buf, lambda);
                }
                None => buf.push(0),
            }
        }
    }
}

// ============================================================================
// Lambda encoding
// ============================================================================

/// Lambda body node ids are re-indexed locally: parameter nodes first
/// (declaration order), captures next (name order), then a depth-first
/// walk from the body output. Unreachable body nodes are dead code and
/// do not contribute.
fn encode_lambda(buf: &mut Vec<u8>, lambda: &TypedLambda) {
    let mut local: HashMap<NodeId, u64> = HashMap::new();
    let mut order: Vec<NodeId> = Vec::new();

    let param_node = |name: &str| -> Option<NodeId> {
        lambda.body_nodes.iter().find_map(|(id, node)| match node {
            IRNode::Input { name: n, .. } if n == name => Some(*id),
            _ => None,
        })
    };
    for name in &lambda.param_names {
        if let Some(id) = param_node(name) {
            if !local.contains_key(&id) {
                local.insert(id, order.len() as u64);
                order.push(id);
            }
        }
    }
    for id in lambda.captured_bindings.values() {
        if !local.contains_key(id) {
            local.insert(*id, order.len() as u64);
            order.push(*id);
        }
    }

    fn visit(
        id: NodeId,
        nodes: &BTreeMap<NodeId, IRNode>,
        local: &mut HashMap<NodeId, u64>,
        order: &mut Vec<NodeId>,
    ) {
        if local.contains_key(&id) {
            return;
        }
        if let Some(node) = nodes.get(&id) {
            for dep in node.dependencies() {
                visit(dep, nodes, local, order);
            }
        }
        if !local.contains_key(&id) {
            local.insert(id, order.len() as u64);
            order.push(id);
        }
    }
    visit(lambda.body_output, &lambda.body_nodes, &mut local, &mut order);

    put_u64(buf, lambda.param_names.len() as u64);
    for name in &lambda.param_names {
        put_str(buf, name);
    }
    put_u64(buf, lambda.captured_bindings.len() as u64);
    for (name, id) in &lambda.captured_bindings {
        put_str(buf, name);
        put_u64(buf, local[id]);
    }
    put_u64(buf, order.len() as u64);
    for id in &order {
        encode_ir_node(buf, &lambda.body_nodes[id], &local);
    }
    put_u64(buf, local[&lambda.body_output]);
}

fn encode_ir_node(buf: &mut Vec<u8>, node: &IRNode, local: &HashMap<NodeId, u64>) {
    let idx = |id: &NodeId| local[id];
    match node {
        IRNode::Input { name, output_type } => {
            buf.push(0);
            put_str(buf, name);
            put_ctype(buf, output_type);
        }
        IRNode::Literal { value, output_type } => {
            buf.push(1);
            encode_value(buf, value);
            put_ctype(buf, output_type);
        }
        IRNode::ModuleCall {
            module_name,
            function_name,
            inputs,
            output_type,
            options: _,
        } => {
            // Module calls cannot appear inside lambda bodies today;
            // encode defensively without the option image.
            buf.push(2);
            put_str(buf, module_name);
            put_str(buf, function_name);
            put_u64(buf, inputs.len() as u64);
            for (param, id) in inputs {
                put_str(buf, param);
                put_u64(buf, idx(id));
            }
            put_ctype(buf, output_type);
        }
        IRNode::MakeList { items, elem_type } => {
            buf.push(3);
            put_u64(buf, items.len() as u64);
            for id in items {
                put_u64(buf, idx(id));
            }
            put_ctype(buf, elem_type);
        }
        IRNode::MakeRecord {
            fields,
            output_type,
        } => {
            buf.push(4);
            put_u64(buf, fields.len() as u64);
            for (name, id) in fields {
                put_str(buf, name);
                put_u64(buf, idx(id));
            }
            put_ctype(buf, output_type);
        }
        IRNode::Merge {
            left,
            right,
            output_type,
        } => {
            buf.push(5);
            put_u64(buf, idx(left));
            put_u64(buf, idx(right));
            put_ctype(buf, output_type);
        }
        IRNode::Project {
            source,
            fields,
            output_type,
        } => {
            buf.push(6);
            put_u64(buf, idx(source));
            put_u64(buf, fields.len() as u64);
            for field in fields {
                put_str(buf, field);
            }
            put_ctype(buf, output_type);
        }
        IRNode::FieldAccess {
            source,
            field,
            output_type,
        } => {
            buf.push(7);
            put_u64(buf, idx(source));
            put_str(buf, field);
            put_ctype(buf, output_type);
        }
        IRNode::Conditional {
            cond,
            then_node,
            else_node,
            output_type,
        } => {
            buf.push(8);
            put_u64(buf, idx(cond));
            put_u64(buf, idx(then_node));
            put_u64(buf, idx(else_node));
            put_ctype(buf, output_type);
        }
        IRNode::And { left, right } => {
            buf.push(9);
            put_u64(buf, idx(left));
            put_u64(buf, idx(right));
        }
        IRNode::Or { left, right } => {
            buf.push(10);
            put_u64(buf, idx(left));
            put_u64(buf, idx(right));
        }
        IRNode::Not { operand } => {
            buf.push(11);
            put_u64(buf, idx(operand));
        }
        IRNode::Scalar {
            op,
            left,
            right,
            output_type,
        } => {
            buf.push(12);
            buf.push(*op as u8);
            put_u64(buf, idx(left));
            put_u64(buf, idx(right));
            put_ctype(buf, output_type);
        }
        IRNode::Guard {
            expr,
            cond,
            inner_type,
        } => {
            buf.push(13);
            put_u64(buf, idx(expr));
            put_u64(buf, idx(cond));
            put_ctype(buf, inner_type);
        }
        IRNode::Coalesce {
            left,
            right,
            result_type,
        } => {
            buf.push(14);
            put_u64(buf, idx(left));
            put_u64(buf, idx(right));
            put_ctype(buf, result_type);
        }
        IRNode::Branch {
            cases,
            otherwise,
            result_type,
        } => {
            buf.push(15);
            put_u64(buf, cases.len() as u64);
            for (cond, value) in cases {
                put_u64(buf, idx(cond));
                put_u64(buf, idx(value));
            }
            put_u64(buf, idx(otherwise));
            put_ctype(buf, result_type);
        }
        IRNode::StringInterpolation { parts, expressions } => {
            buf.push(16);
            put_u64(buf, parts.len() as u64);
            for part in parts {
                put_str(buf, part);
            }
            put_u64(buf, expressions.len() as u64);
            for id in expressions {
                put_u64(buf, idx(id));
            }
        }
        IRNode::Match {
            scrutinee,
            arms,
            default,
            output_type,
            captured_inputs,
        } => {
            buf.push(17);
            put_u64(buf, idx(scrutinee));
            put_u64(buf, arms.len() as u64);
            for (tags, lambda) in arms {
                put_u64(buf, tags.len() as u64);
                for tag in tags {
                    put_str(buf, tag);
                }
                encode_lambda(buf, lambda);
            }
            match default {
                Some(lambda) => {
                    buf.push(1);
                    encode_lambda(buf, lambda);
                }
                None => buf.push(0),
            }
            put_ctype(buf, output_type);
            put_u64(buf, captured_inputs.len() as u64);
            for (name, id) in captured_inputs {
                put_str(buf, name);
                put_u64(buf, idx(id));
            }
        }
        IRNode::HigherOrder {
            op,
            source,
            lambda,
            output_type,
            captured_inputs,
        } => {
            buf.push(18);
            buf.push(*op as u8);
            put_u64(buf, idx(source));
            encode_lambda(buf, lambda);
            put_ctype(buf, output_type);
            put_u64(buf, captured_inputs.len() as u64);
            for (name, id) in captured_inputs {
                put_str(buf, name);
                put_u64(buf, idx(id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::compile_dag;
    use crate::ir::generate_ir;
    use crate::parser::parse_program;
    use crate::registry::FunctionRegistry;
    use crate::typecheck::check_program;

    fn hash_of(source: &str) -> String {
        let registry = FunctionRegistry::new();
        let program = parse_program(source).expect("parse");
        let typed = check_program(&program, &registry).expect("check");
        let ir = generate_ir(&typed).expect("generate");
        let spec = compile_dag(&ir, None).expect("dag");
        structural_hash(&spec)
    }

    #[test]
    fn test_recompilation_hashes_identically() {
        let source = "in items: List<Int>\nin t: Int\n\
                      big = filter(items, (x) => x > t)\n\
                      msg = \"found ${t}\"\n\
                      out big\nout msg";
        // Fresh UUIDs every compile; the canonical encoding erases them
        assert_eq!(hash_of(source), hash_of(source));
    }

    #[test]
    fn test_different_programs_hash_differently() {
        assert_ne!(hash_of("x = 1\nout x"), hash_of("x = 2\nout x"));
        // Int vs Float literals are distinct
        assert_ne!(hash_of("x = 2\nout x"), hash_of("x = 2.0\nout x"));
    }

    #[test]
    fn test_branch_programs_hash_deterministically() {
        let source = "in s: Int\n\
                      g = branch { s >= 90 -> \"A\", s >= 80 -> \"B\", otherwise -> \"F\" }\n\
                      out g";
        assert_eq!(hash_of(source), hash_of(source));
    }

    #[test]
    fn test_option_changes_change_the_hash() {
        let a = "in s: Int\ng = branch { s >= 1 -> 1, otherwise -> 0 }\nout g";
        let b = "in s: Int\ng = branch { s >= 2 -> 1, otherwise -> 0 }\nout g";
        assert_ne!(hash_of(a), hash_of(b));
    }

    #[test]
    fn test_syntactic_hash() {
        assert_eq!(syntactic_hash("abc"), syntactic_hash("abc"));
        assert_ne!(syntactic_hash("abc"), syntactic_hash("abd"));
        assert_eq!(syntactic_hash("abc").len(), 64);
    }
}
