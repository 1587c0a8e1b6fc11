//! # Semantic Analyzer
//!
//! Checks a parsed program against a [`FunctionRegistry`] and produces a
//! typed AST. Responsibilities:
//!
//! - scope and namespace resolution (`use` imports, aliases)
//! - bidirectional type inference over expressions
//! - union/optional discipline (guards, coalesce, match exhaustiveness)
//! - module-call option validation
//! - duplicate-definition and circular-dependency detection
//!
//! Diagnostics accumulate; each declaration is checked even when a
//! previous one failed, so as many errors as possible surface per pass.
//! Failed expressions carry the `Nothing` placeholder type, which keeps
//! follow-on errors from cascading.

mod expr;
mod options;

pub use expr::free_variables;

use crate::ast::{Declaration, Expr, Program, TypeExpr};
use crate::error::{CompileError, SourceLocation};
use crate::ir::{HigherOrderOp, ScalarOp, StreamingOptions};
use crate::ir::{BackoffStrategy, ErrorStrategy};
use crate::registry::{FunctionRegistry, ModuleSignature};
use crate::types::{RowUnifier, SemanticType};
use std::collections::{BTreeMap, HashMap, HashSet};

// ============================================================================
// Typed AST
// ============================================================================

/// A fully checked program, assignments in dependency order.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedProgram {
    /// Declared inputs in source order
    pub inputs: Vec<(String, SemanticType)>,
    /// Assignments in topological order
    pub assignments: Vec<TypedAssignment>,
    /// Declared outputs in source order
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypedAssignment {
    pub name: String,
    pub expr: TypedExpr,
}

/// An expression with its inferred type.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedExpr {
    pub kind: TypedExprKind,
    pub ty: SemanticType,
    pub span: SourceLocation,
}

/// Checked and normalized module-call options. Durations are in
/// milliseconds, priority is on the 0..=100 scale.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TypedOptions {
    pub retry: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub delay_ms: Option<u64>,
    pub backoff: BackoffStrategy,
    pub fallback: Option<Box<TypedExpr>>,
    pub cache_ttl_ms: Option<u64>,
    pub cache_backend: Option<String>,
    pub throttle: Option<(u32, u64)>,
    pub concurrency: Option<u32>,
    pub on_error: ErrorStrategy,
    pub lazy: bool,
    pub priority: Option<u8>,
    pub streaming: StreamingOptions,
}

/// A checked lambda: parameters with inferred types, plus the outer
/// names its body captures.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedLambdaExpr {
    pub params: Vec<(String, SemanticType)>,
    pub body: Box<TypedExpr>,
    /// Outer-scope names referenced by the body, in first-use order
    pub captures: Vec<String>,
}

/// One checked match arm. The binding is visible in the body at the
/// narrowed member type.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedMatchArm {
    pub binding: String,
    pub member: SemanticType,
    pub body: TypedExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypedExprKind {
    StringLit(String),
    IntLit(i64),
    FloatLit(f64),
    BoolLit(bool),
    ListLit(Vec<TypedExpr>),
    RecordLit(Vec<(String, TypedExpr)>),
    Var(String),
    FieldAccess {
        base: Box<TypedExpr>,
        field: String,
    },
    Projection {
        base: Box<TypedExpr>,
        fields: Vec<String>,
    },
    ModuleCall {
        signature: ModuleSignature,
        args: Vec<TypedExpr>,
        options: TypedOptions,
    },
    HigherOrder {
        op: HigherOrderOp,
        source: Box<TypedExpr>,
        lambda: TypedLambdaExpr,
    },
    Merge {
        left: Box<TypedExpr>,
        right: Box<TypedExpr>,
    },
    Scalar {
        op: ScalarOp,
        left: Box<TypedExpr>,
        right: Box<TypedExpr>,
    },
    And {
        left: Box<TypedExpr>,
        right: Box<TypedExpr>,
    },
    Or {
        left: Box<TypedExpr>,
        right: Box<TypedExpr>,
    },
    Not {
        operand: Box<TypedExpr>,
    },
    If {
        cond: Box<TypedExpr>,
        then_branch: Box<TypedExpr>,
        else_branch: Box<TypedExpr>,
    },
    Branch {
        arms: Vec<(TypedExpr, TypedExpr)>,
        otherwise: Box<TypedExpr>,
    },
    Guard {
        expr: Box<TypedExpr>,
        cond: Box<TypedExpr>,
    },
    Coalesce {
        left: Box<TypedExpr>,
        right: Box<TypedExpr>,
    },
    Match {
        scrutinee: Box<TypedExpr>,
        arms: Vec<TypedMatchArm>,
        /// Wildcard arm body, if present
        default: Option<Box<TypedExpr>>,
    },
    Interpolation {
        parts: Vec<String>,
        exprs: Vec<TypedExpr>,
    },
    /// Placeholder for an expression that failed to check
    Error,
}

impl TypedExpr {
    pub(crate) fn error(span: SourceLocation) -> Self {
        TypedExpr {
            kind: TypedExprKind::Error,
            ty: SemanticType::Nothing,
            span,
        }
    }
}

// ============================================================================
// Checker
// ============================================================================

/// Check a program against a registry, producing the typed AST or every
/// diagnostic found.
pub fn check_program(
    program: &Program,
    registry: &FunctionRegistry,
) -> Result<TypedProgram, Vec<CompileError>> {
    Checker::new(registry).run(program)
}

pub(crate) struct Checker<'a> {
    pub(crate) registry: &'a FunctionRegistry,
    pub(crate) errors: Vec<CompileError>,
    /// Variable name -> type (inputs + checked assignments)
    pub(crate) scope: HashMap<String, SemanticType>,
    /// Type alias name -> resolved type
    pub(crate) type_env: HashMap<String, SemanticType>,
    /// Import alias -> qualified registry name
    pub(crate) imports: HashMap<String, String>,
    pub(crate) rows: RowUnifier,
    /// Nonzero while checking a lambda or match-arm body; module calls
    /// are pure-code-only there
    pub(crate) lambda_depth: u32,
}

impl<'a> Checker<'a> {
    fn new(registry: &'a FunctionRegistry) -> Self {
        Checker {
            registry,
            errors: Vec::new(),
            scope: HashMap::new(),
            type_env: HashMap::new(),
            imports: HashMap::new(),
            rows: RowUnifier::new(),
            lambda_depth: 0,
        }
    }

    fn run(mut self, program: &Program) -> Result<TypedProgram, Vec<CompileError>> {
        self.check_duplicates(program);
        self.resolve_uses(program);
        self.resolve_typedefs(program);

        let mut inputs = Vec::new();
        for decl in &program.declarations {
            if let Declaration::Input { name, ty, span } = decl {
                let resolved = self.resolve_type(ty, *span);
                self.scope.insert(name.clone(), resolved.clone());
                inputs.push((name.clone(), resolved));
            }
        }

        let order = self.assignment_order(program);
        let assignment_map: HashMap<&str, (&Expr, SourceLocation)> = program
            .declarations
            .iter()
            .filter_map(|d| match d {
                Declaration::Assignment { name, expr, span } => {
                    Some((name.as_str(), (expr, *span)))
                }
                _ => None,
            })
            .collect();

        let mut assignments = Vec::new();
        for name in order {
            let Some(&(expr, _span)) = assignment_map.get(name.as_str()) else {
                continue;
            };
            let typed = self.infer(expr, None);
            self.scope.insert(name.clone(), typed.ty.clone());
            assignments.push(TypedAssignment {
                name: name.clone(),
                expr: typed,
            });
        }

        let mut outputs = Vec::new();
        for decl in &program.declarations {
            if let Declaration::Output { name, span } = decl {
                if !self.scope.contains_key(name) {
                    self.errors.push(CompileError::UndefinedVariable {
                        name: name.clone(),
                        location: Some(*span),
                    });
                    continue;
                }
                outputs.push(name.clone());
            }
        }

        if self.errors.is_empty() {
            Ok(TypedProgram {
                inputs,
                assignments,
                outputs,
            })
        } else {
            Err(self.errors)
        }
    }

    // ------------------------------------------------------------------------
    // Declaration-level passes
    // ------------------------------------------------------------------------

    fn check_duplicates(&mut self, program: &Program) {
        let mut variables: HashSet<&str> = HashSet::new();
        let mut types: HashSet<&str> = HashSet::new();
        for decl in &program.declarations {
            match decl {
                Declaration::Input { name, span, .. }
                | Declaration::Assignment { name, span, .. } => {
                    if !variables.insert(name) {
                        self.errors.push(CompileError::DuplicateDefinition {
                            name: name.clone(),
                            location: Some(*span),
                        });
                    }
                }
                Declaration::TypeDef { name, span, .. } => {
                    if !types.insert(name) {
                        self.errors.push(CompileError::DuplicateDefinition {
                            name: name.clone(),
                            location: Some(*span),
                        });
                    }
                }
                Declaration::Output { .. } | Declaration::Use { .. } => {}
            }
        }
    }

    fn resolve_uses(&mut self, program: &Program) {
        for decl in &program.declarations {
            let Declaration::Use { path, alias, span } = decl else {
                continue;
            };
            let qualified = path.join(".");
            if self.registry.lookup(&qualified).is_none() {
                // Distinguish a bad namespace from a bad function name
                if path.len() > 1 && !self.registry.has_namespace(&path[0]) {
                    self.errors.push(CompileError::UndefinedNamespace {
                        name: path[0].clone(),
                        location: Some(*span),
                    });
                } else {
                    self.errors.push(CompileError::UndefinedFunction {
                        name: qualified.clone(),
                        location: Some(*span),
                    });
                }
                continue;
            }
            let local = alias
                .clone()
                .unwrap_or_else(|| path.last().expect("non-empty path").clone());
            if let Some(existing) = self.imports.get(&local) {
                self.errors.push(CompileError::AmbiguousFunction {
                    name: local.clone(),
                    first: existing.clone(),
                    second: qualified.clone(),
                    location: Some(*span),
                });
                continue;
            }
            self.imports.insert(local, qualified);
        }
    }

    fn resolve_typedefs(&mut self, program: &Program) {
        for decl in &program.declarations {
            if let Declaration::TypeDef { name, ty, span } = decl {
                let resolved = self.resolve_type(ty, *span);
                self.type_env.insert(name.clone(), resolved);
            }
        }
    }

    /// Resolve a surface type expression, reporting unknown names.
    pub(crate) fn resolve_type(&mut self, ty: &TypeExpr, span: SourceLocation) -> SemanticType {
        match ty {
            TypeExpr::Named(name) => match name.as_str() {
                "String" => SemanticType::String,
                "Int" => SemanticType::Int,
                "Float" => SemanticType::Float,
                "Boolean" => SemanticType::Boolean,
                "Nothing" => SemanticType::Nothing,
                other => {
                    if let Some(resolved) = self.type_env.get(other) {
                        resolved.clone()
                    } else {
                        self.errors.push(CompileError::UndefinedType {
                            name: other.to_string(),
                            location: Some(span),
                        });
                        SemanticType::Nothing
                    }
                }
            },
            TypeExpr::List(elem) => SemanticType::list(self.resolve_type(elem, span)),
            TypeExpr::Map(k, v) => SemanticType::Map(
                Box::new(self.resolve_type(k, span)),
                Box::new(self.resolve_type(v, span)),
            ),
            TypeExpr::Record(fields) => SemanticType::Record(
                fields
                    .iter()
                    .map(|(name, ty)| (name.clone(), self.resolve_type(ty, span)))
                    .collect(),
            ),
            TypeExpr::Optional(inner) => {
                SemanticType::optional(self.resolve_type(inner, span))
            }
            TypeExpr::Union(members) => SemanticType::union(
                members
                    .iter()
                    .map(|m| self.resolve_type(m, span))
                    .collect::<Vec<_>>(),
            ),
        }
    }

    /// Topologically order assignments by their variable dependencies.
    /// A cycle is reported and its members are dropped from the order.
    fn assignment_order(&mut self, program: &Program) -> Vec<String> {
        let mut deps: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut spans: HashMap<String, SourceLocation> = HashMap::new();
        let assignment_names: HashSet<String> = program
            .declarations
            .iter()
            .filter_map(|d| match d {
                Declaration::Assignment { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect();

        let mut source_order = Vec::new();
        for decl in &program.declarations {
            if let Declaration::Assignment { name, expr, span } = decl {
                // Duplicates are already reported; order by the first
                if deps.contains_key(name) {
                    continue;
                }
                let free = free_variables(expr);
                deps.insert(
                    name.clone(),
                    free.into_iter()
                        .filter(|v| assignment_names.contains(v) && v != name)
                        .collect(),
                );
                spans.insert(name.clone(), *span);
                source_order.push(name.clone());
            }
        }

        // Kahn's algorithm, preferring source order for stable output
        let mut in_degree: BTreeMap<String, usize> = source_order
            .iter()
            .map(|name| (name.clone(), deps[name].len()))
            .collect();
        let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, requires) in &deps {
            for req in requires {
                dependents
                    .entry(req.clone())
                    .or_default()
                    .push(name.clone());
            }
        }

        let mut order = Vec::with_capacity(source_order.len());
        let mut ready: Vec<String> = source_order
            .iter()
            .filter(|name| in_degree[*name] == 0)
            .cloned()
            .collect();
        let mut ready_idx = 0;
        while ready_idx < ready.len() {
            let name = ready[ready_idx].clone();
            ready_idx += 1;
            order.push(name.clone());
            for dependent in dependents.get(&name).cloned().unwrap_or_default() {
                let degree = in_degree.get_mut(&dependent).expect("known assignment");
                *degree -= 1;
                if *degree == 0 {
                    ready.push(dependent);
                }
            }
        }

        if order.len() != source_order.len() {
            let cycle: Vec<String> = source_order
                .iter()
                .filter(|name| !order.contains(name))
                .cloned()
                .collect();
            let location = cycle.first().and_then(|n| spans.get(n)).copied();
            self.errors.push(CompileError::CircularDependency {
                cycle: cycle.join(" -> "),
                location,
            });
        }
        order
    }
}

#[cfg(test)]
mod tests;
