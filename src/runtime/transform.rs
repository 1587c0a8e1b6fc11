//! Inline-transform evaluation.
//!
//! The scheduler calls [`evaluate_transform`] once every input of an
//! inline-computed data node is ready. Lambda bodies evaluate as small
//! IR interpreters with a fresh scope per invocation, seeded from the
//! element value and the captured values. Boolean operators, branch
//! cases, and the higher-order predicates short-circuit.
//!
//! Type errors here are internal errors: the type checker has already
//! ruled them out for any program that compiled.

use super::RuntimeError;
use crate::dag::InlineTransform;
use crate::ir::{HigherOrderOp, IRNode, NodeId, TypedLambda};
use crate::value::{CType, CValue};
use std::collections::{BTreeMap, HashMap};

/// Evaluate an inline transform over its named inputs.
pub fn evaluate_transform(
    transform: &InlineTransform,
    inputs: &BTreeMap<String, CValue>,
) -> Result<CValue, RuntimeError> {
    let input = |name: &str| -> Result<&CValue, RuntimeError> {
        inputs.get(name).ok_or_else(|| {
            RuntimeError::Internal(format!("inline transform missing input '{name}'"))
        })
    };
    let boolean = |name: &str| -> Result<bool, RuntimeError> {
        input(name)?.as_bool().ok_or_else(|| {
            RuntimeError::Internal(format!("inline transform input '{name}' is not boolean"))
        })
    };

    match transform {
        InlineTransform::Literal { value } => Ok(value.clone()),

        InlineTransform::Merge => merge_values(input("left")?, input("right")?),

        InlineTransform::Project { fields } => project(input("source")?, fields),

        InlineTransform::FieldAccess { field } => {
            input("source")?.field(field).cloned().ok_or_else(|| {
                RuntimeError::Internal(format!("field '{field}' missing at runtime"))
            })
        }

        InlineTransform::Conditional => {
            if boolean("cond")? {
                Ok(input("then")?.clone())
            } else {
                Ok(input("else")?.clone())
            }
        }

        InlineTransform::And => Ok(CValue::Boolean(boolean("left")? && boolean("right")?)),
        InlineTransform::Or => Ok(CValue::Boolean(boolean("left")? || boolean("right")?)),
        InlineTransform::Not => Ok(CValue::Boolean(!boolean("operand")?)),

        InlineTransform::Scalar { op } => {
            let left = input("left")?;
            let right = input("right")?;
            op.eval(left, right).ok_or_else(|| {
                RuntimeError::Internal(format!(
                    "scalar op {op:?} undefined for {} and {}",
                    left.ctype(),
                    right.ctype()
                ))
            })
        }

        InlineTransform::Guard { inner_type } => {
            if boolean("cond")? {
                Ok(CValue::some(input("expr")?.clone()))
            } else {
                Ok(CValue::none(inner_type.clone()))
            }
        }

        InlineTransform::Coalesce => match input("left")? {
            CValue::Optional { value: Some(v), .. } => Ok((**v).clone()),
            CValue::Optional { value: None, .. } => Ok(input("right")?.clone()),
            other => Err(RuntimeError::Internal(format!(
                "coalesce left operand is not optional: {}",
                other.ctype()
            ))),
        },

        InlineTransform::Interpolate { parts } => {
            let mut text = String::new();
            for (index, part) in parts.iter().enumerate() {
                text.push_str(part);
                if index + 1 < parts.len() {
                    text.push_str(&input(&format!("expr{index}"))?.render_raw());
                }
            }
            Ok(CValue::String(text))
        }

        InlineTransform::MakeList { elem_type } => {
            let mut items = Vec::with_capacity(inputs.len());
            for index in 0..inputs.len() {
                items.push(input(&format!("item{index}"))?.clone());
            }
            Ok(CValue::list(elem_type.clone(), items))
        }

        InlineTransform::MakeRecord { fields } => {
            let mut record = Vec::with_capacity(fields.len());
            for field in fields {
                record.push((field.clone(), input(field)?.clone()));
            }
            Ok(CValue::record(record))
        }

        InlineTransform::Filter { lambda } => {
            let (elem, items) = as_list(input("source")?)?;
            let captures = capture_values(lambda, inputs);
            let mut kept = Vec::new();
            for item in items {
                if lambda_boolean(lambda, &[item.clone()], &captures)? {
                    kept.push(item.clone());
                }
            }
            Ok(CValue::list(elem.clone(), kept))
        }

        InlineTransform::Map { lambda } => {
            let (_, items) = as_list(input("source")?)?;
            let captures = capture_values(lambda, inputs);
            let mut mapped = Vec::with_capacity(items.len());
            for item in items {
                mapped.push(evaluate_lambda(lambda, &[item.clone()], &captures)?);
            }
            let elem = lambda_output_type(lambda)?;
            Ok(CValue::list(elem, mapped))
        }

        InlineTransform::All { lambda } => {
            let (_, items) = as_list(input("source")?)?;
            let captures = capture_values(lambda, inputs);
            for item in items {
                if !lambda_boolean(lambda, &[item.clone()], &captures)? {
                    return Ok(CValue::Boolean(false));
                }
            }
            Ok(CValue::Boolean(true))
        }

        InlineTransform::Any { lambda } => {
            let (_, items) = as_list(input("source")?)?;
            let captures = capture_values(lambda, inputs);
            for item in items {
                if lambda_boolean(lambda, &[item.clone()], &captures)? {
                    return Ok(CValue::Boolean(true));
                }
            }
            Ok(CValue::Boolean(false))
        }

        InlineTransform::MatchUnion { arms, default } => {
            let scrutinee = input("scrutinee")?;
            let CValue::Union { tag, value, .. } = scrutinee else {
                return Err(RuntimeError::Internal(format!(
                    "match scrutinee is not a union: {}",
                    scrutinee.ctype()
                )));
            };
            for (tags, lambda) in arms {
                if tags.iter().any(|t| t == tag) {
                    let captures = capture_values(lambda, inputs);
                    return evaluate_lambda(lambda, &[(**value).clone()], &captures);
                }
            }
            match default {
                Some(lambda) => {
                    let captures = capture_values(lambda, inputs);
                    evaluate_lambda(lambda, &[scrutinee.clone()], &captures)
                }
                None => Err(RuntimeError::Internal(format!(
                    "no match arm covers variant '{tag}'"
                ))),
            }
        }
    }
}

fn as_list(value: &CValue) -> Result<(&CType, &[CValue]), RuntimeError> {
    match value {
        CValue::List { elem, items } => Ok((elem, items)),
        other => Err(RuntimeError::Internal(format!(
            "expected a list, found {}",
            other.ctype()
        ))),
    }
}

/// Pull the lambda's captured values out of the transform inputs.
fn capture_values(
    lambda: &TypedLambda,
    inputs: &BTreeMap<String, CValue>,
) -> BTreeMap<String, CValue> {
    lambda
        .captured_bindings
        .keys()
        .filter_map(|name| inputs.get(name).map(|v| (name.clone(), v.clone())))
        .collect()
}

fn lambda_boolean(
    lambda: &TypedLambda,
    args: &[CValue],
    captures: &BTreeMap<String, CValue>,
) -> Result<bool, RuntimeError> {
    evaluate_lambda(lambda, args, captures)?
        .as_bool()
        .ok_or_else(|| RuntimeError::Internal("predicate lambda returned non-boolean".into()))
}

fn lambda_output_type(lambda: &TypedLambda) -> Result<CType, RuntimeError> {
    lambda
        .body_nodes
        .get(&lambda.body_output)
        .map(IRNode::output_type)
        .ok_or_else(|| RuntimeError::Internal("lambda body output node missing".into()))
}

// ============================================================================
// Lambda interpreter
// ============================================================================

/// Invoke a compiled lambda with positional arguments and captured
/// values. Each invocation gets a fresh scope.
pub fn evaluate_lambda(
    lambda: &TypedLambda,
    args: &[CValue],
    captures: &BTreeMap<String, CValue>,
) -> Result<CValue, RuntimeError> {
    if args.len() != lambda.param_names.len() {
        return Err(RuntimeError::Internal(format!(
            "lambda expected {} argument(s), got {}",
            lambda.param_names.len(),
            args.len()
        )));
    }

    let mut env: HashMap<NodeId, CValue> = HashMap::new();
    for (name, value) in lambda.param_names.iter().zip(args.iter()) {
        let id = find_param_node(lambda, name)?;
        env.insert(id, value.clone());
    }
    for (name, id) in &lambda.captured_bindings {
        let value = captures.get(name).ok_or_else(|| {
            RuntimeError::Internal(format!("capture '{name}' was not supplied"))
        })?;
        env.insert(*id, value.clone());
    }

    eval_node(lambda.body_output, &lambda.body_nodes, &mut env)
}

fn find_param_node(lambda: &TypedLambda, name: &str) -> Result<NodeId, RuntimeError> {
    lambda
        .body_nodes
        .iter()
        .find_map(|(id, node)| match node {
            IRNode::Input { name: n, .. } if n == name => Some(*id),
            _ => None,
        })
        .ok_or_else(|| {
            RuntimeError::Internal(format!("lambda parameter '{name}' has no body node"))
        })
}

fn eval_node(
    id: NodeId,
    nodes: &BTreeMap<NodeId, IRNode>,
    env: &mut HashMap<NodeId, CValue>,
) -> Result<CValue, RuntimeError> {
    if let Some(value) = env.get(&id) {
        return Ok(value.clone());
    }
    let node = nodes
        .get(&id)
        .ok_or_else(|| RuntimeError::Internal(format!("lambda body node {id} missing")))?;

    let value = match node {
        IRNode::Input { name, .. } => {
            return Err(RuntimeError::Internal(format!(
                "lambda parameter '{name}' was not seeded"
            )))
        }
        IRNode::Literal { value, .. } => value.clone(),
        IRNode::MakeList { items, elem_type } => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_node(*item, nodes, env)?);
            }
            CValue::list(elem_type.clone(), out)
        }
        IRNode::MakeRecord { fields, .. } => {
            let mut out = Vec::with_capacity(fields.len());
            for (name, node) in fields {
                out.push((name.clone(), eval_node(*node, nodes, env)?));
            }
            CValue::record(out)
        }
        IRNode::Merge { left, right, .. } => {
            let left = eval_node(*left, nodes, env)?;
            let right = eval_node(*right, nodes, env)?;
            merge_values(&left, &right)?
        }
        IRNode::Project { source, fields, .. } => {
            let source = eval_node(*source, nodes, env)?;
            project(&source, fields)?
        }
        IRNode::FieldAccess { source, field, .. } => {
            let source = eval_node(*source, nodes, env)?;
            source.field(field).cloned().ok_or_else(|| {
                RuntimeError::Internal(format!("field '{field}' missing at runtime"))
            })?
        }
        IRNode::Conditional {
            cond,
            then_node,
            else_node,
            ..
        } => {
            if eval_bool(*cond, nodes, env)? {
                eval_node(*then_node, nodes, env)?
            } else {
                eval_node(*else_node, nodes, env)?
            }
        }
        IRNode::And { left, right } => {
            // Short-circuit
            CValue::Boolean(eval_bool(*left, nodes, env)? && eval_bool(*right, nodes, env)?)
        }
        IRNode::Or { left, right } => {
            CValue::Boolean(eval_bool(*left, nodes, env)? || eval_bool(*right, nodes, env)?)
        }
        IRNode::Not { operand } => CValue::Boolean(!eval_bool(*operand, nodes, env)?),
        IRNode::Scalar { op, left, right, .. } => {
            let left = eval_node(*left, nodes, env)?;
            let right = eval_node(*right, nodes, env)?;
            op.eval(&left, &right).ok_or_else(|| {
                RuntimeError::Internal(format!(
                    "scalar op {op:?} undefined for {} and {}",
                    left.ctype(),
                    right.ctype()
                ))
            })?
        }
        IRNode::Guard {
            expr,
            cond,
            inner_type,
        } => {
            if eval_bool(*cond, nodes, env)? {
                CValue::some(eval_node(*expr, nodes, env)?)
            } else {
                CValue::none(inner_type.clone())
            }
        }
        IRNode::Coalesce { left, right, .. } => {
            match eval_node(*left, nodes, env)? {
                CValue::Optional { value: Some(v), .. } => *v,
                CValue::Optional { value: None, .. } => eval_node(*right, nodes, env)?,
                other => {
                    return Err(RuntimeError::Internal(format!(
                        "coalesce left operand is not optional: {}",
                        other.ctype()
                    )))
                }
            }
        }
        IRNode::Branch {
            cases, otherwise, ..
        } => {
            // Conditions evaluate in declaration order, first true wins
            let mut chosen = None;
            for (cond, value) in cases {
                if eval_bool(*cond, nodes, env)? {
                    chosen = Some(*value);
                    break;
                }
            }
            let target = chosen.unwrap_or(*otherwise);
            eval_node(target, nodes, env)?
        }
        IRNode::StringInterpolation { parts, expressions } => {
            let mut text = String::new();
            for (index, part) in parts.iter().enumerate() {
                text.push_str(part);
                if let Some(expr) = expressions.get(index) {
                    text.push_str(&eval_node(*expr, nodes, env)?.render_raw());
                }
            }
            CValue::String(text)
        }
        IRNode::Match {
            scrutinee,
            arms,
            default,
            captured_inputs,
            ..
        } => {
            let scrutinee = eval_node(*scrutinee, nodes, env)?;
            let mut captures = BTreeMap::new();
            for (name, node) in captured_inputs {
                captures.insert(name.clone(), eval_node(*node, nodes, env)?);
            }
            let CValue::Union { tag, value, .. } = &scrutinee else {
                return Err(RuntimeError::Internal(format!(
                    "match scrutinee is not a union: {}",
                    scrutinee.ctype()
                )));
            };
            let mut result = None;
            for (tags, lambda) in arms {
                if tags.iter().any(|t| t == tag) {
                    result = Some(evaluate_lambda(lambda, &[(**value).clone()], &captures)?);
                    break;
                }
            }
            match (result, default) {
                (Some(value), _) => value,
                (None, Some(lambda)) => {
                    evaluate_lambda(lambda, &[scrutinee.clone()], &captures)?
                }
                (None, None) => {
                    return Err(RuntimeError::Internal(format!(
                        "no match arm covers variant '{tag}'"
                    )))
                }
            }
        }
        IRNode::HigherOrder {
            op,
            source,
            lambda,
            captured_inputs,
            ..
        } => {
            let source = eval_node(*source, nodes, env)?;
            let mut captures = BTreeMap::new();
            for (name, node) in captured_inputs {
                captures.insert(name.clone(), eval_node(*node, nodes, env)?);
            }
            let (elem, items) = as_list(&source)?;
            match op {
                HigherOrderOp::Filter => {
                    let mut kept = Vec::new();
                    for item in items {
                        if lambda_boolean(lambda, &[item.clone()], &captures)? {
                            kept.push(item.clone());
                        }
                    }
                    CValue::list(elem.clone(), kept)
                }
                HigherOrderOp::Map => {
                    let mut mapped = Vec::with_capacity(items.len());
                    for item in items {
                        mapped.push(evaluate_lambda(lambda, &[item.clone()], &captures)?);
                    }
                    CValue::list(lambda_output_type(lambda)?, mapped)
                }
                HigherOrderOp::All => {
                    let mut all = true;
                    for item in items {
                        if !lambda_boolean(lambda, &[item.clone()], &captures)? {
                            all = false;
                            break;
                        }
                    }
                    CValue::Boolean(all)
                }
                HigherOrderOp::Any => {
                    let mut any = false;
                    for item in items {
                        if lambda_boolean(lambda, &[item.clone()], &captures)? {
                            any = true;
                            break;
                        }
                    }
                    CValue::Boolean(any)
                }
            }
        }
        IRNode::ModuleCall { module_name, .. } => {
            return Err(RuntimeError::Internal(format!(
                "module call '{module_name}' inside a lambda body"
            )))
        }
    };

    env.insert(id, value.clone());
    Ok(value)
}

fn eval_bool(
    id: NodeId,
    nodes: &BTreeMap<NodeId, IRNode>,
    env: &mut HashMap<NodeId, CValue>,
) -> Result<bool, RuntimeError> {
    eval_node(id, nodes, env)?
        .as_bool()
        .ok_or_else(|| RuntimeError::Internal("expected a boolean value".into()))
}

// ============================================================================
// Structural value operations
// ============================================================================

/// Right-biased merge; a record broadcast across a list of records keeps
/// the same bias per element.
pub fn merge_values(left: &CValue, right: &CValue) -> Result<CValue, RuntimeError> {
    match (left, right) {
        (CValue::Record(l), CValue::Record(r)) => {
            let mut merged = l.clone();
            for (name, value) in r {
                merged.insert(name.clone(), value.clone());
            }
            Ok(CValue::Record(merged))
        }
        (CValue::List { elem, items }, CValue::Record(_)) => {
            let merged: Result<Vec<CValue>, RuntimeError> =
                items.iter().map(|item| merge_values(item, right)).collect();
            let merged = merged?;
            let elem = merged
                .first()
                .map(CValue::ctype)
                .unwrap_or_else(|| merge_ctype(elem, &right.ctype()));
            Ok(CValue::list(elem, merged))
        }
        (CValue::Record(_), CValue::List { elem, items }) => {
            let merged: Result<Vec<CValue>, RuntimeError> =
                items.iter().map(|item| merge_values(left, item)).collect();
            let merged = merged?;
            let elem = merged
                .first()
                .map(CValue::ctype)
                .unwrap_or_else(|| merge_ctype(&left.ctype(), elem));
            Ok(CValue::list(elem, merged))
        }
        _ => Err(RuntimeError::Internal(format!(
            "cannot merge {} with {}",
            left.ctype(),
            right.ctype()
        ))),
    }
}

fn merge_ctype(left: &CType, right: &CType) -> CType {
    match (left, right) {
        (CType::Product(l), CType::Product(r)) => {
            let mut merged = l.clone();
            for (name, ty) in r {
                merged.insert(name.clone(), ty.clone());
            }
            CType::Product(merged)
        }
        _ => right.clone(),
    }
}

fn project(source: &CValue, fields: &[String]) -> Result<CValue, RuntimeError> {
    let CValue::Record(available) = source else {
        return Err(RuntimeError::Internal(format!(
            "projection source is not a record: {}",
            source.ctype()
        )));
    };
    let mut projected = Vec::with_capacity(fields.len());
    for field in fields {
        let value = available.get(field).ok_or_else(|| {
            RuntimeError::Internal(format!("projected field '{field}' missing at runtime"))
        })?;
        projected.push((field.clone(), value.clone()));
    }
    Ok(CValue::record(projected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ScalarOp;
    use uuid::Uuid;

    fn record(fields: &[(&str, CValue)]) -> CValue {
        CValue::record(
            fields
                .iter()
                .map(|(n, v)| ((*n).to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn test_merge_right_bias() {
        let base = record(&[
            ("id", CValue::Int(1)),
            ("name", CValue::String("Alice".to_string())),
        ]);
        let extra = record(&[
            ("name", CValue::String("Alice Smith".to_string())),
            ("score", CValue::Float(95.5)),
        ]);
        let merged = merge_values(&base, &extra).unwrap();
        assert_eq!(
            merged,
            record(&[
                ("id", CValue::Int(1)),
                ("name", CValue::String("Alice Smith".to_string())),
                ("score", CValue::Float(95.5)),
            ])
        );
    }

    #[test]
    fn test_merge_broadcasts_through_lists() {
        let rows = CValue::list(
            record(&[("id", CValue::Int(0))]).ctype(),
            vec![
                record(&[("id", CValue::Int(1))]),
                record(&[("id", CValue::Int(2))]),
            ],
        );
        let tag = record(&[("tagged", CValue::Boolean(true))]);
        let merged = merge_values(&rows, &tag).unwrap();
        let CValue::List { items, .. } = merged else {
            panic!("expected list");
        };
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].field("tagged"), Some(&CValue::Boolean(true)));
        assert_eq!(items[0].field("id"), Some(&CValue::Int(1)));
    }

    #[test]
    fn test_projection() {
        let merged = record(&[
            ("id", CValue::Int(1)),
            ("name", CValue::String("A".to_string())),
            ("score", CValue::Float(9.5)),
        ]);
        let summary = project(&merged, &["id".to_string(), "score".to_string()]).unwrap();
        assert_eq!(
            summary,
            record(&[("id", CValue::Int(1)), ("score", CValue::Float(9.5))])
        );
    }

    #[test]
    fn test_guard_transform() {
        let mut inputs = BTreeMap::new();
        inputs.insert("expr".to_string(), CValue::String("yes".to_string()));
        inputs.insert("cond".to_string(), CValue::Boolean(true));
        let out = evaluate_transform(
            &InlineTransform::Guard {
                inner_type: CType::String,
            },
            &inputs,
        )
        .unwrap();
        assert_eq!(out, CValue::some(CValue::String("yes".to_string())));

        inputs.insert("cond".to_string(), CValue::Boolean(false));
        let out = evaluate_transform(
            &InlineTransform::Guard {
                inner_type: CType::String,
            },
            &inputs,
        )
        .unwrap();
        assert_eq!(out, CValue::none(CType::String));
    }

    #[test]
    fn test_coalesce_transform() {
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "left".to_string(),
            CValue::some(CValue::String("high".to_string())),
        );
        inputs.insert("right".to_string(), CValue::String("low".to_string()));
        let out = evaluate_transform(&InlineTransform::Coalesce, &inputs).unwrap();
        assert_eq!(out, CValue::String("high".to_string()));

        inputs.insert("left".to_string(), CValue::none(CType::String));
        let out = evaluate_transform(&InlineTransform::Coalesce, &inputs).unwrap();
        assert_eq!(out, CValue::String("low".to_string()));
    }

    #[test]
    fn test_interpolation_transform() {
        let mut inputs = BTreeMap::new();
        inputs.insert("expr0".to_string(), CValue::String("Bob".to_string()));
        inputs.insert("expr1".to_string(), CValue::Int(3));
        let out = evaluate_transform(
            &InlineTransform::Interpolate {
                parts: vec![
                    "Hello ".to_string(),
                    ", you have ".to_string(),
                    " messages".to_string(),
                ],
            },
            &inputs,
        )
        .unwrap();
        assert_eq!(
            out,
            CValue::String("Hello Bob, you have 3 messages".to_string())
        );
    }

    /// Builds the lambda for `(x) => x > threshold` by hand.
    fn threshold_lambda() -> TypedLambda {
        let param = Uuid::new_v4();
        let capture = Uuid::new_v4();
        let cmp = Uuid::new_v4();
        let mut body_nodes = BTreeMap::new();
        body_nodes.insert(
            param,
            IRNode::Input {
                name: "x".to_string(),
                output_type: CType::Int,
            },
        );
        body_nodes.insert(
            capture,
            IRNode::Input {
                name: "threshold".to_string(),
                output_type: CType::Int,
            },
        );
        body_nodes.insert(
            cmp,
            IRNode::Scalar {
                op: ScalarOp::Gt,
                left: param,
                right: capture,
                output_type: CType::Boolean,
            },
        );
        TypedLambda {
            param_names: vec!["x".to_string()],
            body_nodes,
            body_output: cmp,
            captured_bindings: [("threshold".to_string(), capture)].into_iter().collect(),
        }
    }

    #[test]
    fn test_filter_with_capture() {
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "source".to_string(),
            CValue::list(
                CType::Int,
                vec![
                    CValue::Int(5),
                    CValue::Int(15),
                    CValue::Int(8),
                    CValue::Int(42),
                ],
            ),
        );
        inputs.insert("threshold".to_string(), CValue::Int(10));
        let out = evaluate_transform(
            &InlineTransform::Filter {
                lambda: threshold_lambda(),
            },
            &inputs,
        )
        .unwrap();
        assert_eq!(
            out,
            CValue::list(CType::Int, vec![CValue::Int(15), CValue::Int(42)])
        );
    }

    #[test]
    fn test_any_short_circuits() {
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "source".to_string(),
            CValue::list(CType::Int, vec![CValue::Int(100), CValue::Int(1)]),
        );
        inputs.insert("threshold".to_string(), CValue::Int(10));
        let out = evaluate_transform(
            &InlineTransform::Any {
                lambda: threshold_lambda(),
            },
            &inputs,
        )
        .unwrap();
        assert_eq!(out, CValue::Boolean(true));
    }
}
