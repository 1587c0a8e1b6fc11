//! # Abstract Syntax Tree
//!
//! Declarations, expressions, and type expressions produced by the
//! parser. The AST is untyped; the semantic analyzer attaches types and
//! produces the typed tree consumed by IR generation.
//!
//! Note: expression nodes carry `f64` literals, so the tree implements
//! `PartialEq` but not `Eq`/`Hash`.

use crate::error::SourceLocation;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Programs and declarations
// ============================================================================

/// A parsed pipeline source file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Program {
    pub declarations: Vec<Declaration>,
}

impl Program {
    pub fn new() -> Self {
        Program::default()
    }
}

/// Top-level declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Declaration {
    /// `in name: Type`
    Input {
        name: String,
        ty: TypeExpr,
        span: SourceLocation,
    },
    /// `out name`
    Output { name: String, span: SourceLocation },
    /// `name = expr`
    Assignment {
        name: String,
        expr: Expr,
        span: SourceLocation,
    },
    /// `type Name = Type`
    TypeDef {
        name: String,
        ty: TypeExpr,
        span: SourceLocation,
    },
    /// `use ns.func [as alias]`
    Use {
        path: Vec<String>,
        alias: Option<String>,
        span: SourceLocation,
    },
}

// ============================================================================
// Type expressions
// ============================================================================

/// Surface syntax for types: `String`, `List<Int>`, `{id: Int}`,
/// `Int | String`, `Float?`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TypeExpr {
    /// Primitive or user-defined type name
    Named(String),
    List(Box<TypeExpr>),
    Map(Box<TypeExpr>, Box<TypeExpr>),
    Record(Vec<(String, TypeExpr)>),
    Optional(Box<TypeExpr>),
    Union(Vec<TypeExpr>),
}

// ============================================================================
// Expressions
// ============================================================================

/// An expression with its source position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: SourceLocation,
}

impl Expr {
    pub fn new(kind: ExprKind, span: SourceLocation) -> Self {
        Expr { kind, span }
    }
}

/// Binary operators. `Add` doubles as record merge; the type checker
/// disambiguates from the operand types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
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
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge
        )
    }

    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div
        )
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    /// `!expr`
    Not,
    /// `-expr`
    Neg,
}

/// Expression node kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    StringLit(String),
    IntLit(i64),
    FloatLit(f64),
    BoolLit(bool),
    /// `[a, b, c]`
    ListLit(Vec<Expr>),
    /// `{field: expr, ...}`
    RecordLit(Vec<(String, Expr)>),
    Var(String),
    /// `base.field`
    FieldAccess { base: Box<Expr>, field: String },
    /// `base[f1, f2]` — record projection
    Projection { base: Box<Expr>, fields: Vec<String> },
    /// `ns.func(args) with options`
    Call {
        path: Vec<String>,
        args: Vec<Expr>,
        options: Vec<CallOption>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary { op: UnaryOp, operand: Box<Expr> },
    /// `if cond { a } else { b }`
    If {
        cond: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
    /// `branch { c1 -> e1, ..., otherwise -> e }`
    Branch {
        arms: Vec<(Expr, Expr)>,
        otherwise: Box<Expr>,
    },
    /// `expr when cond` — evaluates to `Some(expr)` or `None`
    Guard { expr: Box<Expr>, cond: Box<Expr> },
    /// `a ?? b`
    Coalesce { left: Box<Expr>, right: Box<Expr> },
    /// `match scrutinee { arms }`
    Match {
        scrutinee: Box<Expr>,
        arms: Vec<MatchArm>,
    },
    /// `(x, y) => body`
    Lambda { params: Vec<String>, body: Box<Expr> },
    /// `"prefix ${expr} suffix"` — `parts.len() == exprs.len() + 1`
    Interpolation {
        parts: Vec<String>,
        exprs: Vec<Expr>,
    },
}

/// One arm of a `match` expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchArm {
    pub pattern: Pattern,
    pub body: Expr,
    pub span: SourceLocation,
}

/// Match patterns over union scrutinees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Pattern {
    /// `name: Type` — matches the union member `Type`, binding `name`
    /// to the narrowed value in the arm body.
    Typed { binding: String, ty: TypeExpr },
    /// `_` — matches anything.
    Wildcard,
}

// ============================================================================
// Module-call options
// ============================================================================

/// One `with` option on a module call, e.g. `retry: 3`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOption {
    pub name: String,
    pub value: OptionValue,
    pub span: SourceLocation,
}

/// Option values the surface syntax can express.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptionValue {
    Int(i64),
    Bool(bool),
    String(String),
    /// `500ms`, `2s`, `1min`, `1h`, `1d` — normalized to milliseconds
    Duration { ms: u64 },
    /// `5/1s` — count per window
    Rate { count: u32, window_ms: u64 },
    /// Bare identifiers: `exponential`, `skip`, `high`, ...
    Ident(String),
    /// Arbitrary expression (fallback values)
    Expr(Box<Expr>),
}

impl OptionValue {
    /// Describe the value shape for option-validation diagnostics.
    pub fn describe(&self) -> String {
        match self {
            OptionValue::Int(n) => format!("integer {n}"),
            OptionValue::Bool(b) => format!("boolean {b}"),
            OptionValue::String(s) => format!("string {s:?}"),
            OptionValue::Duration { ms } => format!("duration {ms}ms"),
            OptionValue::Rate { count, window_ms } => {
                format!("rate {count}/{window_ms}ms")
            }
            OptionValue::Ident(name) => format!("identifier '{name}'"),
            OptionValue::Expr(_) => "expression".to_string(),
        }
    }
}
