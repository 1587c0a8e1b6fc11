//! Expression inference.
//!
//! Synthesis walks the expression bottom-up; checking mode threads an
//! expected type down where the context knows more than the expression
//! (empty list literals, lambda parameters). Every failure records a
//! diagnostic and yields the `Nothing` placeholder so unrelated errors
//! still surface.

use super::{Checker, TypedExpr, TypedExprKind, TypedLambdaExpr, TypedMatchArm};
use crate::ast::{BinaryOp, Expr, ExprKind, Pattern, UnaryOp};
use crate::error::{CompileError, SourceLocation};
use crate::ir::{HigherOrderOp, ScalarOp};
use crate::registry::ModuleSignature;
use crate::types::{is_subtype, join, RowVarId, SemanticType};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Free variable names of an expression, in first-use order. Lambda
/// parameters and match bindings shadow.
pub fn free_variables(expr: &Expr) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    collect_free(expr, &mut vec![], &mut seen, &mut out);
    out
}

fn collect_free(
    expr: &Expr,
    bound: &mut Vec<String>,
    seen: &mut BTreeSet<String>,
    out: &mut Vec<String>,
) {
    match &expr.kind {
        ExprKind::Var(name) => {
            if !bound.iter().any(|b| b == name) && seen.insert(name.clone()) {
                out.push(name.clone());
            }
        }
        ExprKind::StringLit(_)
        | ExprKind::IntLit(_)
        | ExprKind::FloatLit(_)
        | ExprKind::BoolLit(_) => {}
        ExprKind::ListLit(items) => {
            for item in items {
                collect_free(item, bound, seen, out);
            }
        }
        ExprKind::RecordLit(fields) => {
            for (_, value) in fields {
                collect_free(value, bound, seen, out);
            }
        }
        ExprKind::FieldAccess { base, .. } | ExprKind::Projection { base, .. } => {
            collect_free(base, bound, seen, out);
        }
        ExprKind::Call { args, options, .. } => {
            for arg in args {
                collect_free(arg, bound, seen, out);
            }
            for option in options {
                if let crate::ast::OptionValue::Expr(expr) = &option.value {
                    collect_free(expr, bound, seen, out);
                }
            }
        }
        ExprKind::Binary { left, right, .. } | ExprKind::Coalesce { left, right } => {
            collect_free(left, bound, seen, out);
            collect_free(right, bound, seen, out);
        }
        ExprKind::Unary { operand, .. } => collect_free(operand, bound, seen, out),
        ExprKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            collect_free(cond, bound, seen, out);
            collect_free(then_branch, bound, seen, out);
            collect_free(else_branch, bound, seen, out);
        }
        ExprKind::Branch { arms, otherwise } => {
            for (cond, value) in arms {
                collect_free(cond, bound, seen, out);
                collect_free(value, bound, seen, out);
            }
            collect_free(otherwise, bound, seen, out);
        }
        ExprKind::Guard { expr, cond } => {
            collect_free(expr, bound, seen, out);
            collect_free(cond, bound, seen, out);
        }
        ExprKind::Match { scrutinee, arms } => {
            collect_free(scrutinee, bound, seen, out);
            for arm in arms {
                match &arm.pattern {
                    Pattern::Typed { binding, .. } => {
                        bound.push(binding.clone());
                        collect_free(&arm.body, bound, seen, out);
                        bound.pop();
                    }
                    Pattern::Wildcard => collect_free(&arm.body, bound, seen, out),
                }
            }
        }
        ExprKind::Lambda { params, body } => {
            for param in params {
                bound.push(param.clone());
            }
            collect_free(body, bound, seen, out);
            for _ in params {
                bound.pop();
            }
        }
        ExprKind::Interpolation { exprs, .. } => {
            for expr in exprs {
                collect_free(expr, bound, seen, out);
            }
        }
    }
}

impl Checker<'_> {
    pub(crate) fn err(&mut self, error: CompileError) {
        self.errors.push(error);
    }

    /// Infer an expression's type. `expected` is contextual information
    /// only; mismatches against it are reported by callers.
    pub(crate) fn infer(&mut self, expr: &Expr, expected: Option<&SemanticType>) -> TypedExpr {
        let span = expr.span;
        match &expr.kind {
            ExprKind::StringLit(s) => TypedExpr {
                kind: TypedExprKind::StringLit(s.clone()),
                ty: SemanticType::String,
                span,
            },
            ExprKind::IntLit(n) => TypedExpr {
                kind: TypedExprKind::IntLit(*n),
                ty: SemanticType::Int,
                span,
            },
            ExprKind::FloatLit(x) => TypedExpr {
                kind: TypedExprKind::FloatLit(*x),
                ty: SemanticType::Float,
                span,
            },
            ExprKind::BoolLit(b) => TypedExpr {
                kind: TypedExprKind::BoolLit(*b),
                ty: SemanticType::Boolean,
                span,
            },
            ExprKind::ListLit(items) => self.infer_list(items, expected, span),
            ExprKind::RecordLit(fields) => {
                let typed: Vec<(String, TypedExpr)> = fields
                    .iter()
                    .map(|(name, value)| (name.clone(), self.infer(value, None)))
                    .collect();
                let ty = SemanticType::Record(
                    typed
                        .iter()
                        .map(|(name, v)| (name.clone(), v.ty.clone()))
                        .collect(),
                );
                TypedExpr {
                    kind: TypedExprKind::RecordLit(typed),
                    ty,
                    span,
                }
            }
            ExprKind::Var(name) => match self.scope.get(name) {
                Some(ty) => TypedExpr {
                    kind: TypedExprKind::Var(name.clone()),
                    ty: ty.clone(),
                    span,
                },
                None => {
                    self.err(CompileError::UndefinedVariable {
                        name: name.clone(),
                        location: Some(span),
                    });
                    TypedExpr::error(span)
                }
            },
            ExprKind::FieldAccess { base, field } => self.infer_field_access(base, field, span),
            ExprKind::Projection { base, fields } => self.infer_projection(base, fields, span),
            ExprKind::Call {
                path,
                args,
                options,
            } => self.infer_call(path, args, options, span),
            ExprKind::Binary { op, left, right } => self.infer_binary(*op, left, right, span),
            ExprKind::Unary { op, operand } => self.infer_unary(*op, operand, span),
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = self.check_boolean(cond, "condition");
                let then_branch = self.infer(then_branch, expected);
                let else_branch = self.infer(else_branch, expected);
                let ty = join(&then_branch.ty, &else_branch.ty);
                TypedExpr {
                    kind: TypedExprKind::If {
                        cond: Box::new(cond),
                        then_branch: Box::new(then_branch),
                        else_branch: Box::new(else_branch),
                    },
                    ty,
                    span,
                }
            }
            ExprKind::Branch { arms, otherwise } => {
                let typed_arms: Vec<(TypedExpr, TypedExpr)> = arms
                    .iter()
                    .map(|(cond, value)| {
                        (
                            self.check_boolean(cond, "branch condition"),
                            self.infer(value, expected),
                        )
                    })
                    .collect();
                let otherwise = self.infer(otherwise, expected);
                let mut ty = otherwise.ty.clone();
                for (_, value) in &typed_arms {
                    ty = join(&ty, &value.ty);
                }
                TypedExpr {
                    kind: TypedExprKind::Branch {
                        arms: typed_arms,
                        otherwise: Box::new(otherwise),
                    },
                    ty,
                    span,
                }
            }
            ExprKind::Guard { expr, cond } => {
                let value = self.infer(expr, None);
                let cond = self.check_boolean(cond, "guard condition");
                let ty = SemanticType::optional(value.ty.clone());
                TypedExpr {
                    kind: TypedExprKind::Guard {
                        expr: Box::new(value),
                        cond: Box::new(cond),
                    },
                    ty,
                    span,
                }
            }
            ExprKind::Coalesce { left, right } => {
                let left = self.infer(left, None);
                let right = self.infer(right, None);
                let ty = match &left.ty {
                    SemanticType::Optional(inner) => join(inner, &right.ty),
                    SemanticType::Nothing => SemanticType::Nothing,
                    other => {
                        self.err(CompileError::TypeMismatch {
                            expected: "an optional value on the left of '??'".to_string(),
                            found: other.render(),
                            location: Some(left.span),
                        });
                        SemanticType::Nothing
                    }
                };
                TypedExpr {
                    kind: TypedExprKind::Coalesce {
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    ty,
                    span,
                }
            }
            ExprKind::Match { scrutinee, arms } => self.infer_match(scrutinee, arms, span),
            ExprKind::Lambda { .. } => {
                self.err(CompileError::Unsupported {
                    construct: "lambda outside a higher-order call".to_string(),
                    location: Some(span),
                });
                TypedExpr::error(span)
            }
            ExprKind::Interpolation { parts, exprs } => {
                let typed: Vec<TypedExpr> = exprs
                    .iter()
                    .map(|e| {
                        let typed = self.infer(e, None);
                        if !matches!(
                            typed.ty,
                            SemanticType::String
                                | SemanticType::Int
                                | SemanticType::Float
                                | SemanticType::Boolean
                                | SemanticType::Nothing
                        ) {
                            self.err(CompileError::TypeMismatch {
                                expected: "a printable value (String, Int, Float, Boolean)"
                                    .to_string(),
                                found: typed.ty.render(),
                                location: Some(typed.span),
                            });
                        }
                        typed
                    })
                    .collect();
                TypedExpr {
                    kind: TypedExprKind::Interpolation {
                        parts: parts.clone(),
                        exprs: typed,
                    },
                    ty: SemanticType::String,
                    span,
                }
            }
        }
    }

    fn check_boolean(&mut self, expr: &Expr, context: &str) -> TypedExpr {
        let typed = self.infer(expr, Some(&SemanticType::Boolean));
        if !is_subtype(&typed.ty, &SemanticType::Boolean) {
            self.err(CompileError::TypeMismatch {
                expected: format!("Boolean {context}"),
                found: typed.ty.render(),
                location: Some(typed.span),
            });
        }
        typed
    }

    fn infer_list(
        &mut self,
        items: &[Expr],
        expected: Option<&SemanticType>,
        span: SourceLocation,
    ) -> TypedExpr {
        let elem_hint = match expected {
            Some(SemanticType::List(elem)) => Some((**elem).clone()),
            _ => None,
        };
        let typed: Vec<TypedExpr> = items
            .iter()
            .map(|item| self.infer(item, elem_hint.as_ref()))
            .collect();
        // Empty lists infer List<Nothing> and widen by context
        let mut elem = elem_hint.unwrap_or(SemanticType::Nothing);
        for item in &typed {
            elem = join(&elem, &item.ty);
        }
        TypedExpr {
            kind: TypedExprKind::ListLit(typed),
            ty: SemanticType::list(elem),
            span,
        }
    }

    fn infer_field_access(
        &mut self,
        base: &Expr,
        field: &str,
        span: SourceLocation,
    ) -> TypedExpr {
        let base = self.infer(base, None);
        let ty = match &base.ty {
            SemanticType::Record(fields) => match fields.get(field) {
                Some(ty) => ty.clone(),
                None => {
                    self.err(CompileError::InvalidFieldAccess {
                        field: field.to_string(),
                        ty: base.ty.render(),
                        location: Some(span),
                    });
                    SemanticType::Nothing
                }
            },
            SemanticType::OpenRecord { known, .. } => match known.get(field) {
                Some(ty) => ty.clone(),
                None => {
                    self.err(CompileError::InvalidFieldAccess {
                        field: field.to_string(),
                        ty: base.ty.render(),
                        location: Some(span),
                    });
                    SemanticType::Nothing
                }
            },
            SemanticType::Nothing => SemanticType::Nothing,
            other => {
                self.err(CompileError::InvalidFieldAccess {
                    field: field.to_string(),
                    ty: other.render(),
                    location: Some(span),
                });
                SemanticType::Nothing
            }
        };
        TypedExpr {
            kind: TypedExprKind::FieldAccess {
                base: Box::new(base),
                field: field.to_string(),
            },
            ty,
            span,
        }
    }

    fn infer_projection(
        &mut self,
        base: &Expr,
        fields: &[String],
        span: SourceLocation,
    ) -> TypedExpr {
        let base = self.infer(base, None);
        let ty = match &base.ty {
            SemanticType::Record(available) => {
                let mut projected = BTreeMap::new();
                for field in fields {
                    match available.get(field) {
                        Some(ty) => {
                            projected.insert(field.clone(), ty.clone());
                        }
                        None => self.err(CompileError::InvalidProjection {
                            field: field.clone(),
                            ty: base.ty.render(),
                            location: Some(span),
                        }),
                    }
                }
                SemanticType::Record(projected)
            }
            SemanticType::Nothing => SemanticType::Nothing,
            other => {
                self.err(CompileError::InvalidProjection {
                    field: fields.first().cloned().unwrap_or_default(),
                    ty: other.render(),
                    location: Some(span),
                });
                SemanticType::Nothing
            }
        };
        TypedExpr {
            kind: TypedExprKind::Projection {
                base: Box::new(base),
                fields: fields.to_vec(),
            },
            ty,
            span,
        }
    }

    // ------------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------------

    fn infer_call(
        &mut self,
        path: &[String],
        args: &[Expr],
        options: &[crate::ast::CallOption],
        span: SourceLocation,
    ) -> TypedExpr {
        // Higher-order builtins take priority over registry names
        if path.len() == 1 {
            let name = path[0].as_str();
            if name == "sort_by" || name == "sortBy" {
                self.err(CompileError::Unsupported {
                    construct: format!("higher-order operation '{name}'"),
                    location: Some(span),
                });
                return TypedExpr::error(span);
            }
            let hof = match name {
                "filter" => Some(HigherOrderOp::Filter),
                "map" => Some(HigherOrderOp::Map),
                "all" => Some(HigherOrderOp::All),
                "any" => Some(HigherOrderOp::Any),
                _ => None,
            };
            if let Some(op) = hof {
                if !options.is_empty() {
                    self.err(CompileError::InvalidOptionValue {
                        option: options[0].name.clone(),
                        reason: format!("'{name}' does not accept call options"),
                        location: Some(options[0].span),
                    });
                }
                return self.infer_higher_order(op, args, span);
            }
        }

        // Resolve through imports, then the registry
        let joined = path.join(".");
        let qualified = if path.len() == 1 {
            self.imports.get(&joined).cloned().unwrap_or(joined.clone())
        } else {
            joined.clone()
        };
        let Some(signature) = self.registry.lookup(&qualified).cloned() else {
            if path.len() > 1 && !self.registry.has_namespace(&path[0]) {
                self.err(CompileError::UndefinedNamespace {
                    name: path[0].clone(),
                    location: Some(span),
                });
            } else {
                self.err(CompileError::UndefinedFunction {
                    name: joined,
                    location: Some(span),
                });
            }
            return TypedExpr::error(span);
        };

        // Lambda bodies evaluate as pure interpreters per element;
        // module dispatch is not available inside them
        if self.lambda_depth > 0 {
            self.err(CompileError::Unsupported {
                construct: format!(
                    "module call '{}' inside a lambda body",
                    signature.qualified_name()
                ),
                location: Some(span),
            });
            return TypedExpr::error(span);
        }

        if args.len() != signature.params.len() {
            self.err(CompileError::TypeMismatch {
                expected: format!(
                    "{} argument(s) to '{}'",
                    signature.params.len(),
                    signature.qualified_name()
                ),
                found: format!("{}", args.len()),
                location: Some(span),
            });
            return TypedExpr::error(span);
        }

        // Instantiate row variables fresh per call site, so one call
        // closing a row does not constrain another.
        let (params, returns) = self.instantiate_signature(&signature);

        let mut typed_args = Vec::with_capacity(args.len());
        for (arg, (param_name, param_ty)) in args.iter().zip(params.iter()) {
            let typed = self.infer(arg, Some(param_ty));
            match param_ty {
                SemanticType::OpenRecord { known: _, row } => {
                    match &typed.ty {
                        SemanticType::Record(fields) => {
                            if is_subtype(&typed.ty, param_ty) {
                                if let Err(e) = self.rows.close(*row, fields) {
                                    self.err(CompileError::TypeMismatch {
                                        expected: param_ty.render(),
                                        found: e.to_string(),
                                        location: Some(typed.span),
                                    });
                                }
                            } else {
                                self.err(CompileError::TypeMismatch {
                                    expected: param_ty.render(),
                                    found: typed.ty.render(),
                                    location: Some(typed.span),
                                });
                            }
                        }
                        SemanticType::Nothing => {}
                        other => {
                            self.err(CompileError::TypeMismatch {
                                expected: param_ty.render(),
                                found: other.render(),
                                location: Some(typed.span),
                            });
                        }
                    }
                }
                _ => {
                    if !is_subtype(&typed.ty, param_ty) {
                        self.err(CompileError::TypeMismatch {
                            expected: format!(
                                "{} for parameter '{}'",
                                param_ty.render(),
                                param_name
                            ),
                            found: typed.ty.render(),
                            location: Some(typed.span),
                        });
                    }
                }
            }
            typed_args.push(typed);
        }

        let return_ty = self.rows.resolve(&returns);
        let options = self.validate_options(options, &return_ty);

        TypedExpr {
            kind: TypedExprKind::ModuleCall {
                signature,
                args: typed_args,
                options,
            },
            ty: return_ty,
            span,
        }
    }

    /// Alpha-rename the row variables of a signature into fresh unifier
    /// rows.
    fn instantiate_signature(
        &mut self,
        signature: &ModuleSignature,
    ) -> (Vec<(String, SemanticType)>, SemanticType) {
        let mut mapping: HashMap<RowVarId, RowVarId> = HashMap::new();
        let params = signature
            .params
            .iter()
            .map(|(name, ty)| (name.clone(), self.instantiate(ty, &mut mapping)))
            .collect();
        let returns = self.instantiate(&signature.returns, &mut mapping);
        (params, returns)
    }

    fn instantiate(
        &mut self,
        ty: &SemanticType,
        mapping: &mut HashMap<RowVarId, RowVarId>,
    ) -> SemanticType {
        match ty {
            SemanticType::RowVar(id) => {
                let fresh = *mapping.entry(*id).or_insert_with(|| self.rows.fresh());
                SemanticType::RowVar(fresh)
            }
            SemanticType::OpenRecord { known, row } => {
                let fresh = *mapping.entry(*row).or_insert_with(|| self.rows.fresh());
                SemanticType::OpenRecord {
                    known: known
                        .iter()
                        .map(|(n, t)| (n.clone(), self.instantiate(t, mapping)))
                        .collect(),
                    row: fresh,
                }
            }
            SemanticType::Record(fields) => SemanticType::Record(
                fields
                    .iter()
                    .map(|(n, t)| (n.clone(), self.instantiate(t, mapping)))
                    .collect(),
            ),
            SemanticType::List(elem) => {
                SemanticType::list(self.instantiate(elem, mapping))
            }
            SemanticType::Map(k, v) => SemanticType::Map(
                Box::new(self.instantiate(k, mapping)),
                Box::new(self.instantiate(v, mapping)),
            ),
            SemanticType::Optional(inner) => {
                SemanticType::optional(self.instantiate(inner, mapping))
            }
            SemanticType::Function { params, ret } => SemanticType::Function {
                params: params.iter().map(|p| self.instantiate(p, mapping)).collect(),
                ret: Box::new(self.instantiate(ret, mapping)),
            },
            SemanticType::Union(members) => SemanticType::union(
                members
                    .iter()
                    .map(|m| self.instantiate(m, mapping))
                    .collect::<Vec<_>>(),
            ),
            other => other.clone(),
        }
    }

    fn infer_higher_order(
        &mut self,
        op: HigherOrderOp,
        args: &[Expr],
        span: SourceLocation,
    ) -> TypedExpr {
        if args.len() != 2 {
            self.err(CompileError::TypeMismatch {
                expected: format!("2 arguments to '{}'", op.name()),
                found: format!("{}", args.len()),
                location: Some(span),
            });
            return TypedExpr::error(span);
        }

        let source = self.infer(&args[0], None);
        let elem = match &source.ty {
            SemanticType::List(elem) => (**elem).clone(),
            SemanticType::Nothing => SemanticType::Nothing,
            other => {
                self.err(CompileError::TypeMismatch {
                    expected: format!("a list as the first argument to '{}'", op.name()),
                    found: other.render(),
                    location: Some(source.span),
                });
                SemanticType::Nothing
            }
        };

        let ExprKind::Lambda { params, body } = &args[1].kind else {
            self.err(CompileError::TypeMismatch {
                expected: format!("a lambda as the second argument to '{}'", op.name()),
                found: "expression".to_string(),
                location: Some(args[1].span),
            });
            return TypedExpr::error(span);
        };
        if params.len() != 1 {
            self.err(CompileError::TypeMismatch {
                expected: format!("a single-parameter lambda for '{}'", op.name()),
                found: format!("{} parameters", params.len()),
                location: Some(args[1].span),
            });
            return TypedExpr::error(span);
        }

        // Lambda parameter type propagates from the list element type
        let param_name = params[0].clone();
        let shadowed = self.scope.insert(param_name.clone(), elem.clone());
        self.lambda_depth += 1;
        let typed_body = self.infer(body, None);
        self.lambda_depth -= 1;
        match shadowed {
            Some(prev) => {
                self.scope.insert(param_name.clone(), prev);
            }
            None => {
                self.scope.remove(&param_name);
            }
        }

        // Captures: free names of the body, minus the parameter,
        // resolved in the enclosing scope
        let captures: Vec<String> = free_variables(&args[1])
            .into_iter()
            .filter(|name| self.scope.contains_key(name))
            .collect();

        let result_ty = match op {
            HigherOrderOp::Filter => {
                if !is_subtype(&typed_body.ty, &SemanticType::Boolean) {
                    self.err(CompileError::TypeMismatch {
                        expected: "Boolean lambda body for 'filter'".to_string(),
                        found: typed_body.ty.render(),
                        location: Some(typed_body.span),
                    });
                }
                source.ty.clone()
            }
            HigherOrderOp::Map => SemanticType::list(typed_body.ty.clone()),
            HigherOrderOp::All | HigherOrderOp::Any => {
                if !is_subtype(&typed_body.ty, &SemanticType::Boolean) {
                    self.err(CompileError::TypeMismatch {
                        expected: format!("Boolean lambda body for '{}'", op.name()),
                        found: typed_body.ty.render(),
                        location: Some(typed_body.span),
                    });
                }
                SemanticType::Boolean
            }
        };

        TypedExpr {
            kind: TypedExprKind::HigherOrder {
                op,
                source: Box::new(source),
                lambda: TypedLambdaExpr {
                    params: vec![(param_name, elem)],
                    body: Box::new(typed_body),
                    captures,
                },
            },
            ty: result_ty,
            span,
        }
    }

    // ------------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------------

    fn infer_binary(
        &mut self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        span: SourceLocation,
    ) -> TypedExpr {
        use SemanticType::*;

        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            let left = self.check_boolean(left, "operand");
            let right = self.check_boolean(right, "operand");
            let kind = if op == BinaryOp::And {
                TypedExprKind::And {
                    left: Box::new(left),
                    right: Box::new(right),
                }
            } else {
                TypedExprKind::Or {
                    left: Box::new(left),
                    right: Box::new(right),
                }
            };
            return TypedExpr {
                kind,
                ty: Boolean,
                span,
            };
        }

        let left = self.infer(left, None);
        let right = self.infer(right, None);

        if op == BinaryOp::Add && is_merge_operand(&left.ty, &right.ty) {
            return self.infer_merge(left, right, span);
        }

        let scalar_op = match op {
            BinaryOp::Add => ScalarOp::Add,
            BinaryOp::Sub => ScalarOp::Sub,
            BinaryOp::Mul => ScalarOp::Mul,
            BinaryOp::Div => ScalarOp::Div,
            BinaryOp::Eq => ScalarOp::Eq,
            BinaryOp::Ne => ScalarOp::Ne,
            BinaryOp::Lt => ScalarOp::Lt,
            BinaryOp::Le => ScalarOp::Le,
            BinaryOp::Gt => ScalarOp::Gt,
            BinaryOp::Ge => ScalarOp::Ge,
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        };

        let ty = if op.is_comparison() {
            let comparable = match op {
                BinaryOp::Eq | BinaryOp::Ne => {
                    is_subtype(&left.ty, &right.ty) || is_subtype(&right.ty, &left.ty)
                }
                _ => matches!(
                    (&left.ty, &right.ty),
                    (Int, Int) | (Float, Float) | (String, String)
                ),
            };
            if !comparable && left.ty != Nothing && right.ty != Nothing {
                self.err(CompileError::UnsupportedComparison {
                    left: left.ty.render(),
                    right: right.ty.render(),
                    location: Some(span),
                });
            }
            Boolean
        } else {
            match (&left.ty, &right.ty) {
                (Int, Int) => Int,
                (Float, Float) => Float,
                (String, String) if op == BinaryOp::Add => String,
                (Nothing, _) | (_, Nothing) => Nothing,
                _ => {
                    self.err(CompileError::UnsupportedArithmetic {
                        left: left.ty.render(),
                        right: right.ty.render(),
                        location: Some(span),
                    });
                    Nothing
                }
            }
        };

        TypedExpr {
            kind: TypedExprKind::Scalar {
                op: scalar_op,
                left: Box::new(left),
                right: Box::new(right),
            },
            ty,
            span,
        }
    }

    /// Right-biased merge. Records merge field maps; a list of records
    /// merged with a record broadcasts element-wise, keeping the same
    /// right bias.
    fn infer_merge(
        &mut self,
        left: TypedExpr,
        right: TypedExpr,
        span: SourceLocation,
    ) -> TypedExpr {
        let ty = self.merge_type(&left.ty, &right.ty, span);
        TypedExpr {
            kind: TypedExprKind::Merge {
                left: Box::new(left),
                right: Box::new(right),
            },
            ty,
            span,
        }
    }

    fn merge_type(
        &mut self,
        left: &SemanticType,
        right: &SemanticType,
        span: SourceLocation,
    ) -> SemanticType {
        use SemanticType::*;
        match (left, right) {
            (Record(lf), Record(rf)) => {
                let mut merged = lf.clone();
                for (name, rt) in rf {
                    if let Some(lt) = lf.get(name) {
                        let compatible = is_subtype(lt, rt) || is_subtype(rt, lt);
                        if !compatible {
                            self.err(CompileError::IncompatibleMerge {
                                left: left.render(),
                                right: right.render(),
                                field: name.clone(),
                                left_field: lt.render(),
                                right_field: rt.render(),
                                location: Some(span),
                            });
                        }
                    }
                    // Right wins on conflicts
                    merged.insert(name.clone(), rt.clone());
                }
                Record(merged)
            }
            (List(elem), Record(_)) => {
                let merged = self.merge_type(elem, right, span);
                SemanticType::list(merged)
            }
            (Record(_), List(elem)) => {
                let merged = self.merge_type(left, elem, span);
                SemanticType::list(merged)
            }
            (Nothing, _) | (_, Nothing) => Nothing,
            _ => {
                self.err(CompileError::IncompatibleOperator {
                    op: "+".to_string(),
                    left: left.render(),
                    right: right.render(),
                    location: Some(span),
                });
                Nothing
            }
        }
    }

    fn infer_unary(&mut self, op: UnaryOp, operand: &Expr, span: SourceLocation) -> TypedExpr {
        match op {
            UnaryOp::Not => {
                let operand = self.check_boolean(operand, "operand of '!'");
                TypedExpr {
                    kind: TypedExprKind::Not {
                        operand: Box::new(operand),
                    },
                    ty: SemanticType::Boolean,
                    span,
                }
            }
            UnaryOp::Neg => {
                let operand = self.infer(operand, None);
                // Negation desugars to subtraction from zero
                let (zero, ty) = match &operand.ty {
                    SemanticType::Int => (TypedExprKind::IntLit(0), SemanticType::Int),
                    SemanticType::Float => {
                        (TypedExprKind::FloatLit(0.0), SemanticType::Float)
                    }
                    SemanticType::Nothing => {
                        return TypedExpr::error(span);
                    }
                    other => {
                        self.err(CompileError::TypeMismatch {
                            expected: "Int or Float after unary '-'".to_string(),
                            found: other.render(),
                            location: Some(span),
                        });
                        return TypedExpr::error(span);
                    }
                };
                TypedExpr {
                    kind: TypedExprKind::Scalar {
                        op: ScalarOp::Sub,
                        left: Box::new(TypedExpr {
                            kind: zero,
                            ty: ty.clone(),
                            span,
                        }),
                        right: Box::new(operand),
                    },
                    ty,
                    span,
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Match
    // ------------------------------------------------------------------------

    fn infer_match(
        &mut self,
        scrutinee: &Expr,
        arms: &[crate::ast::MatchArm],
        span: SourceLocation,
    ) -> TypedExpr {
        let scrutinee = self.infer(scrutinee, None);
        let members: BTreeSet<SemanticType> = match &scrutinee.ty {
            SemanticType::Union(members) => members.clone(),
            SemanticType::Nothing => BTreeSet::new(),
            other => {
                self.err(CompileError::InvalidPattern {
                    reason: format!(
                        "match requires a union scrutinee, found {}",
                        other.render()
                    ),
                    location: Some(span),
                });
                BTreeSet::new()
            }
        };

        let mut covered: BTreeSet<SemanticType> = BTreeSet::new();
        let mut typed_arms = Vec::new();
        let mut default = None;
        let mut result_ty: Option<SemanticType> = None;

        for arm in arms {
            match &arm.pattern {
                Pattern::Wildcard => {
                    if default.is_some() {
                        self.err(CompileError::InvalidPattern {
                            reason: "duplicate wildcard arm".to_string(),
                            location: Some(arm.span),
                        });
                        continue;
                    }
                    self.lambda_depth += 1;
                    let body = self.infer(&arm.body, None);
                    self.lambda_depth -= 1;
                    result_ty = Some(match result_ty {
                        Some(ty) => join(&ty, &body.ty),
                        None => body.ty.clone(),
                    });
                    default = Some(Box::new(body));
                }
                Pattern::Typed { binding, ty } => {
                    let member = self.resolve_type(ty, arm.span);
                    if !members.is_empty() && !members.contains(&member) {
                        self.err(CompileError::PatternTypeMismatch {
                            expected: scrutinee.ty.render(),
                            found: member.render(),
                            location: Some(arm.span),
                        });
                    } else if !covered.insert(member.clone()) {
                        self.err(CompileError::InvalidPattern {
                            reason: format!("variant {} already matched", member.render()),
                            location: Some(arm.span),
                        });
                    }

                    // Pattern binding is visible in the arm body at the
                    // narrowed type; arm bodies lower to lambdas, so
                    // module calls are off-limits inside them too
                    let shadowed = self.scope.insert(binding.clone(), member.clone());
                    self.lambda_depth += 1;
                    let body = self.infer(&arm.body, None);
                    self.lambda_depth -= 1;
                    match shadowed {
                        Some(prev) => {
                            self.scope.insert(binding.clone(), prev);
                        }
                        None => {
                            self.scope.remove(binding);
                        }
                    }

                    result_ty = Some(match result_ty {
                        Some(ty) => join(&ty, &body.ty),
                        None => body.ty.clone(),
                    });
                    typed_arms.push(TypedMatchArm {
                        binding: binding.clone(),
                        member,
                        body,
                    });
                }
            }
        }

        if default.is_none() {
            let missing: Vec<String> = members
                .iter()
                .filter(|m| !covered.contains(*m))
                .map(SemanticType::render)
                .collect();
            if !missing.is_empty() {
                self.err(CompileError::NonExhaustiveMatch {
                    missing: missing.join(", "),
                    location: Some(span),
                });
            }
        }

        TypedExpr {
            kind: TypedExprKind::Match {
                scrutinee: Box::new(scrutinee),
                arms: typed_arms,
                default,
            },
            ty: result_ty.unwrap_or(SemanticType::Nothing),
            span,
        }
    }
}

/// `+` is a merge when either side is record-shaped (or a list of
/// records being broadcast against a record).
fn is_merge_operand(left: &SemanticType, right: &SemanticType) -> bool {
    use SemanticType::*;
    match (left, right) {
        (Record(_), Record(_)) => true,
        (List(elem), Record(_)) => matches!(**elem, Record(_)),
        (Record(_), List(elem)) => matches!(**elem, Record(_)),
        _ => false,
    }
}
