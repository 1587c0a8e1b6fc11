//! Typed AST -> IR lowering.
//!
//! Emits nodes bottom-up, so the emission order is already a valid
//! topological order. Variable references reuse the node bound to the
//! variable; aliases (`y = x`) bind without emitting.
//!
//! Lambdas lower into self-contained sub-graphs: formal parameters and
//! captured names become parameter nodes inside the body table, and the
//! enclosing node records which outer nodes feed each capture.

use super::{
    HigherOrderOp, IRModuleCallOptions, IRNode, IRProgram, NodeId, TypedLambda,
};
use crate::error::CompileError;
use crate::typecheck::{
    TypedAssignment, TypedExpr, TypedExprKind, TypedLambdaExpr, TypedOptions, TypedProgram,
};
use crate::types::SemanticType;
use crate::value::{CType, CValue};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Lower a checked program into IR.
pub fn generate_ir(program: &TypedProgram) -> Result<IRProgram, CompileError> {
    let mut generator = IrGenerator::default();

    for (name, ty) in &program.inputs {
        let id = generator.emit(IRNode::Input {
            name: name.clone(),
            output_type: lower(ty)?,
        });
        generator.bindings.insert(name.clone(), id);
    }

    for TypedAssignment { name, expr } in &program.assignments {
        let id = generator.gen_expr(expr)?;
        generator.bindings.insert(name.clone(), id);
    }

    let ir = IRProgram {
        nodes: generator.nodes,
        topological_order: generator.order,
        variable_bindings: generator.bindings,
        declared_outputs: program.outputs.clone(),
    };
    ir.validate()?;
    Ok(ir)
}

fn lower(ty: &SemanticType) -> Result<CType, CompileError> {
    ty.to_ctype().map_err(|e| CompileError::InternalError {
        message: format!("unloweable type reached IR generation: {e}"),
    })
}

#[derive(Default)]
struct IrGenerator {
    nodes: BTreeMap<NodeId, IRNode>,
    order: Vec<NodeId>,
    bindings: BTreeMap<String, NodeId>,
}

impl IrGenerator {
    fn emit(&mut self, node: IRNode) -> NodeId {
        let id = Uuid::new_v4();
        self.nodes.insert(id, node);
        self.order.push(id);
        id
    }

    fn gen_expr(&mut self, expr: &TypedExpr) -> Result<NodeId, CompileError> {
        match &expr.kind {
            TypedExprKind::StringLit(s) => Ok(self.emit(IRNode::Literal {
                value: CValue::String(s.clone()),
                output_type: CType::String,
            })),
            TypedExprKind::IntLit(n) => Ok(self.emit(IRNode::Literal {
                value: CValue::Int(*n),
                output_type: CType::Int,
            })),
            TypedExprKind::FloatLit(x) => Ok(self.emit(IRNode::Literal {
                value: CValue::Float(*x),
                output_type: CType::Float,
            })),
            TypedExprKind::BoolLit(b) => Ok(self.emit(IRNode::Literal {
                value: CValue::Boolean(*b),
                output_type: CType::Boolean,
            })),
            TypedExprKind::ListLit(items) => {
                let elem_type = match lower(&expr.ty)? {
                    CType::List(elem) => *elem,
                    other => {
                        return Err(CompileError::InternalError {
                            message: format!("list literal typed as {other}"),
                        })
                    }
                };
                let item_ids = items
                    .iter()
                    .map(|item| self.gen_expr(item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.emit(IRNode::MakeList {
                    items: item_ids,
                    elem_type,
                }))
            }
            TypedExprKind::RecordLit(fields) => {
                let mut field_ids = BTreeMap::new();
                for (name, value) in fields {
                    field_ids.insert(name.clone(), self.gen_expr(value)?);
                }
                Ok(self.emit(IRNode::MakeRecord {
                    fields: field_ids,
                    output_type: lower(&expr.ty)?,
                }))
            }
            TypedExprKind::Var(name) => {
                self.bindings
                    .get(name)
                    .copied()
                    .ok_or_else(|| CompileError::InternalError {
                        message: format!("unbound variable '{name}' reached IR generation"),
                    })
            }
            TypedExprKind::FieldAccess { base, field } => {
                let source = self.gen_expr(base)?;
                Ok(self.emit(IRNode::FieldAccess {
                    source,
                    field: field.clone(),
                    output_type: lower(&expr.ty)?,
                }))
            }
            TypedExprKind::Projection { base, fields } => {
                let source = self.gen_expr(base)?;
                Ok(self.emit(IRNode::Project {
                    source,
                    fields: fields.clone(),
                    output_type: lower(&expr.ty)?,
                }))
            }
            TypedExprKind::ModuleCall {
                signature,
                args,
                options,
            } => {
                let mut inputs = BTreeMap::new();
                for ((param, _), arg) in signature.params.iter().zip(args.iter()) {
                    inputs.insert(param.clone(), self.gen_expr(arg)?);
                }
                let options = self.gen_options(options)?;
                Ok(self.emit(IRNode::ModuleCall {
                    module_name: signature.module_name.clone(),
                    function_name: signature.qualified_name(),
                    inputs,
                    output_type: lower(&expr.ty)?,
                    options,
                }))
            }
            TypedExprKind::HigherOrder { op, source, lambda } => {
                let source_id = self.gen_expr(source)?;
                let (typed_lambda, captured_inputs) = self.gen_lambda(lambda)?;
                Ok(self.emit(IRNode::HigherOrder {
                    op: *op,
                    source: source_id,
                    lambda: typed_lambda,
                    output_type: lower(&expr.ty)?,
                    captured_inputs,
                }))
            }
            TypedExprKind::Merge { left, right } => {
                let left = self.gen_expr(left)?;
                let right = self.gen_expr(right)?;
                Ok(self.emit(IRNode::Merge {
                    left,
                    right,
                    output_type: lower(&expr.ty)?,
                }))
            }
            TypedExprKind::Scalar { op, left, right } => {
                let left = self.gen_expr(left)?;
                let right = self.gen_expr(right)?;
                Ok(self.emit(IRNode::Scalar {
                    op: *op,
                    left,
                    right,
                    output_type: lower(&expr.ty)?,
                }))
            }
            TypedExprKind::And { left, right } => {
                let left = self.gen_expr(left)?;
                let right = self.gen_expr(right)?;
                Ok(self.emit(IRNode::And { left, right }))
            }
            TypedExprKind::Or { left, right } => {
                let left = self.gen_expr(left)?;
                let right = self.gen_expr(right)?;
                Ok(self.emit(IRNode::Or { left, right }))
            }
            TypedExprKind::Not { operand } => {
                let operand = self.gen_expr(operand)?;
                Ok(self.emit(IRNode::Not { operand }))
            }
            TypedExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = self.gen_expr(cond)?;
                let then_node = self.gen_expr(then_branch)?;
                let else_node = self.gen_expr(else_branch)?;
                Ok(self.emit(IRNode::Conditional {
                    cond,
                    then_node,
                    else_node,
                    output_type: lower(&expr.ty)?,
                }))
            }
            TypedExprKind::Branch { arms, otherwise } => {
                let mut cases = Vec::with_capacity(arms.len());
                for (cond, value) in arms {
                    let cond_id = self.gen_expr(cond)?;
                    let value_id = self.gen_expr(value)?;
                    cases.push((cond_id, value_id));
                }
                let otherwise = self.gen_expr(otherwise)?;
                Ok(self.emit(IRNode::Branch {
                    cases,
                    otherwise,
                    result_type: lower(&expr.ty)?,
                }))
            }
            TypedExprKind::Guard { expr: value, cond } => {
                let inner_type = lower(&value.ty)?;
                let value = self.gen_expr(value)?;
                let cond = self.gen_expr(cond)?;
                Ok(self.emit(IRNode::Guard {
                    expr: value,
                    cond,
                    inner_type,
                }))
            }
            TypedExprKind::Coalesce { left, right } => {
                let left = self.gen_expr(left)?;
                let right = self.gen_expr(right)?;
                Ok(self.emit(IRNode::Coalesce {
                    left,
                    right,
                    result_type: lower(&expr.ty)?,
                }))
            }
            TypedExprKind::Match {
                scrutinee,
                arms,
                default,
            } => {
                let scrutinee_id = self.gen_expr(scrutinee)?;
                let mut ir_arms = Vec::with_capacity(arms.len());
                let mut captured_inputs = BTreeMap::new();
                for arm in arms {
                    let lambda_expr = TypedLambdaExpr {
                        params: vec![(arm.binding.clone(), arm.member.clone())],
                        body: Box::new(arm.body.clone()),
                        captures: outer_captures(&arm.body, &[arm.binding.clone()], self),
                    };
                    let (lambda, captures) = self.gen_lambda(&lambda_expr)?;
                    captured_inputs.extend(captures);
                    ir_arms.push((vec![arm.member.render()], lambda));
                }
                let default_lambda = match default {
                    Some(body) => {
                        // The wildcard arm receives the raw scrutinee
                        let lambda_expr = TypedLambdaExpr {
                            params: vec![("_".to_string(), scrutinee.ty.clone())],
                            body: Box::new((**body).clone()),
                            captures: outer_captures(body, &["_".to_string()], self),
                        };
                        let (lambda, captures) = self.gen_lambda(&lambda_expr)?;
                        captured_inputs.extend(captures);
                        Some(lambda)
                    }
                    None => None,
                };
                Ok(self.emit(IRNode::Match {
                    scrutinee: scrutinee_id,
                    arms: ir_arms,
                    default: default_lambda,
                    output_type: lower(&expr.ty)?,
                    captured_inputs,
                }))
            }
            TypedExprKind::Interpolation { parts, exprs } => {
                let expressions = exprs
                    .iter()
                    .map(|e| self.gen_expr(e))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.emit(IRNode::StringInterpolation {
                    parts: parts.clone(),
                    expressions,
                }))
            }
            TypedExprKind::Error => Err(CompileError::InternalError {
                message: "error placeholder reached IR generation".to_string(),
            }),
        }
    }

    fn gen_options(
        &mut self,
        options: &TypedOptions,
    ) -> Result<IRModuleCallOptions, CompileError> {
        let fallback = match &options.fallback {
            Some(expr) => Some(self.gen_expr(expr)?),
            None => None,
        };
        Ok(IRModuleCallOptions {
            retry: options.retry,
            timeout_ms: options.timeout_ms,
            delay_ms: options.delay_ms,
            backoff: options.backoff,
            fallback,
            cache_ttl_ms: options.cache_ttl_ms,
            cache_backend: options.cache_backend.clone(),
            throttle: options.throttle,
            concurrency: options.concurrency,
            on_error: options.on_error,
            lazy: options.lazy,
            priority: options.priority,
            streaming: options.streaming.clone(),
        })
    }

    /// Lower a lambda into its own node table. Parameters and captures
    /// become parameter nodes; the returned map wires each captured name
    /// to the outer node computing it.
    fn gen_lambda(
        &mut self,
        lambda: &TypedLambdaExpr,
    ) -> Result<(TypedLambda, BTreeMap<String, NodeId>), CompileError> {
        let mut body_gen = IrGenerator::default();
        let mut captured_bindings = BTreeMap::new();
        let mut captured_inputs = BTreeMap::new();

        for (name, ty) in &lambda.params {
            let id = body_gen.emit(IRNode::Input {
                name: name.clone(),
                output_type: lower(ty)?,
            });
            body_gen.bindings.insert(name.clone(), id);
        }
        for name in &lambda.captures {
            let outer_id = self.bindings.get(name).copied().ok_or_else(|| {
                CompileError::InternalError {
                    message: format!("capture '{name}' is not bound in the outer scope"),
                }
            })?;
            let outer_type = self
                .nodes
                .get(&outer_id)
                .map(IRNode::output_type)
                .ok_or_else(|| CompileError::InternalError {
                    message: format!("capture '{name}' references a missing node"),
                })?;
            let inner_id = body_gen.emit(IRNode::Input {
                name: name.clone(),
                output_type: outer_type,
            });
            body_gen.bindings.insert(name.clone(), inner_id);
            captured_bindings.insert(name.clone(), inner_id);
            captured_inputs.insert(name.clone(), outer_id);
        }

        let body_output = body_gen.gen_expr(&lambda.body)?;
        Ok((
            TypedLambda {
                param_names: lambda.params.iter().map(|(n, _)| n.clone()).collect(),
                body_nodes: body_gen.nodes,
                body_output,
                captured_bindings,
            },
            captured_inputs,
        ))
    }
}

/// Free variables of a typed expression that resolve in the generator's
/// outer bindings, minus the given binders.
fn outer_captures(
    expr: &TypedExpr,
    binders: &[String],
    generator: &IrGenerator,
) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    let mut bound: Vec<String> = binders.to_vec();
    collect_typed_free(expr, &mut bound, &mut seen, &mut out);
    out.retain(|name| generator.bindings.contains_key(name));
    out
}

fn collect_typed_free(
    expr: &TypedExpr,
    bound: &mut Vec<String>,
    seen: &mut BTreeSet<String>,
    out: &mut Vec<String>,
) {
    match &expr.kind {
        TypedExprKind::Var(name) => {
            if !bound.iter().any(|b| b == name) && seen.insert(name.clone()) {
                out.push(name.clone());
            }
        }
        TypedExprKind::StringLit(_)
        | TypedExprKind::IntLit(_)
        | TypedExprKind::FloatLit(_)
        | TypedExprKind::BoolLit(_)
        | TypedExprKind::Error => {}
        TypedExprKind::ListLit(items) => {
            for item in items {
                collect_typed_free(item, bound, seen, out);
            }
        }
        TypedExprKind::RecordLit(fields) => {
            for (_, value) in fields {
                collect_typed_free(value, bound, seen, out);
            }
        }
        TypedExprKind::FieldAccess { base, .. } | TypedExprKind::Projection { base, .. } => {
            collect_typed_free(base, bound, seen, out);
        }
        TypedExprKind::ModuleCall { args, options, .. } => {
            for arg in args {
                collect_typed_free(arg, bound, seen, out);
            }
            if let Some(fallback) = &options.fallback {
                collect_typed_free(fallback, bound, seen, out);
            }
        }
        TypedExprKind::HigherOrder { source, lambda, .. } => {
            collect_typed_free(source, bound, seen, out);
            for (param, _) in &lambda.params {
                bound.push(param.clone());
            }
            collect_typed_free(&lambda.body, bound, seen, out);
            for _ in &lambda.params {
                bound.pop();
            }
        }
        TypedExprKind::Merge { left, right }
        | TypedExprKind::Scalar { left, right, .. }
        | TypedExprKind::And { left, right }
        | TypedExprKind::Or { left, right }
        | TypedExprKind::Coalesce { left, right } => {
            collect_typed_free(left, bound, seen, out);
            collect_typed_free(right, bound, seen, out);
        }
        TypedExprKind::Not { operand } => collect_typed_free(operand, bound, seen, out),
        TypedExprKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            collect_typed_free(cond, bound, seen, out);
            collect_typed_free(then_branch, bound, seen, out);
            collect_typed_free(else_branch, bound, seen, out);
        }
        TypedExprKind::Branch { arms, otherwise } => {
            for (cond, value) in arms {
                collect_typed_free(cond, bound, seen, out);
                collect_typed_free(value, bound, seen, out);
            }
            collect_typed_free(otherwise, bound, seen, out);
        }
        TypedExprKind::Guard { expr, cond } => {
            collect_typed_free(expr, bound, seen, out);
            collect_typed_free(cond, bound, seen, out);
        }
        TypedExprKind::Match {
            scrutinee,
            arms,
            default,
        } => {
            collect_typed_free(scrutinee, bound, seen, out);
            for arm in arms {
                bound.push(arm.binding.clone());
                collect_typed_free(&arm.body, bound, seen, out);
                bound.pop();
            }
            if let Some(default) = default {
                collect_typed_free(default, bound, seen, out);
            }
        }
        TypedExprKind::Interpolation { exprs, .. } => {
            for expr in exprs {
                collect_typed_free(expr, bound, seen, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;
    use crate::registry::{FunctionRegistry, ModuleFailure, ModuleImpl, ModuleSignature};
    use crate::typecheck::check_program;
    use futures_util::FutureExt;
    use std::sync::Arc;

    fn registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        let noop: Arc<dyn ModuleImpl> = Arc::new(|_inputs: BTreeMap<String, CValue>| {
            async move {
                Err::<CValue, _>(ModuleFailure::new("noop", "not invoked"))
            }
            .boxed()
        });
        registry.register(
            ModuleSignature {
                name: "concat".to_string(),
                module_name: "concat-module".to_string(),
                namespace: None,
                version: "1.0.0".to_string(),
                params: vec![
                    ("left".to_string(), SemanticType::String),
                    ("right".to_string(), SemanticType::String),
                ],
                returns: SemanticType::String,
            },
            noop,
        );
        registry
    }

    fn generate(source: &str) -> IRProgram {
        let program = parse_program(source).expect("parse");
        let typed = check_program(&program, &registry()).expect("check");
        generate_ir(&typed).expect("generate")
    }

    #[test]
    fn test_hello_ir_shape() {
        let ir = generate(
            "in name: String\ngreeting = concat(\"Hello, \", name)\nout greeting",
        );
        assert_eq!(ir.declared_outputs, vec!["greeting".to_string()]);
        let greeting = ir.variable_bindings["greeting"];
        match &ir.nodes[&greeting] {
            IRNode::ModuleCall {
                module_name,
                inputs,
                ..
            } => {
                assert_eq!(module_name, "concat-module");
                assert_eq!(inputs.len(), 2);
                assert!(inputs.contains_key("left"));
                assert!(inputs.contains_key("right"));
            }
            other => panic!("expected module call, got {other:?}"),
        }
    }

    #[test]
    fn test_alias_binds_without_new_node() {
        let ir = generate("in x: Int\ny = x\nout y");
        assert_eq!(ir.variable_bindings["x"], ir.variable_bindings["y"]);
        assert_eq!(ir.nodes.len(), 1);
    }

    #[test]
    fn test_lambda_captures_are_wired() {
        let ir = generate(
            "in items: List<Int>\nin threshold: Int\n\
             big = filter(items, (x) => x > threshold)\nout big",
        );
        let big = ir.variable_bindings["big"];
        match &ir.nodes[&big] {
            IRNode::HigherOrder {
                lambda,
                captured_inputs,
                ..
            } => {
                assert_eq!(
                    captured_inputs.get("threshold"),
                    Some(&ir.variable_bindings["threshold"])
                );
                assert!(lambda.captured_bindings.contains_key("threshold"));
                assert_eq!(lambda.param_names, vec!["x".to_string()]);
                // The capture's inner parameter node lives in the body
                let inner = lambda.captured_bindings["threshold"];
                assert!(lambda.body_nodes.contains_key(&inner));
            }
            other => panic!("expected higher-order node, got {other:?}"),
        }
    }

    #[test]
    fn test_fallback_becomes_a_node() {
        let ir = generate(
            "x = concat(\"a\", \"b\") with retry: 2, fallback: \"dflt\"\nout x",
        );
        let x = ir.variable_bindings["x"];
        match &ir.nodes[&x] {
            IRNode::ModuleCall { options, .. } => {
                let fallback = options.fallback.expect("fallback node");
                match &ir.nodes[&fallback] {
                    IRNode::Literal { value, .. } => {
                        assert_eq!(value, &CValue::String("dflt".to_string()));
                    }
                    other => panic!("expected literal fallback, got {other:?}"),
                }
            }
            other => panic!("expected module call, got {other:?}"),
        }
    }

    #[test]
    fn test_branch_lowering() {
        let ir = generate(
            "in score: Int\n\
             grade = branch { score >= 90 -> \"A\", score >= 80 -> \"B\", otherwise -> \"F\" }\n\
             out grade",
        );
        let grade = ir.variable_bindings["grade"];
        match &ir.nodes[&grade] {
            IRNode::Branch { cases, .. } => assert_eq!(cases.len(), 2),
            other => panic!("expected branch node, got {other:?}"),
        }
        ir.validate().unwrap();
    }

    #[test]
    fn test_generated_order_is_topological() {
        let ir = generate(
            "in a: Int\nb = a + 1\nc = b * 2\nd = if c > 10 { c } else { b }\nout d",
        );
        ir.validate().unwrap();
    }
}
