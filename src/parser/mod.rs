//! # Pipeline Source Parser
//!
//! Lexes and parses pipeline source into the AST. Handles declarations
//! (`in`, `out`, `type`, `use`, assignments), the full expression
//! grammar (calls with options, merges, conditionals, branch, guards,
//! coalesce, lambdas, match, interpolation), and type expressions.
//!
//! The parser does not type-check. Errors carry line/column; after an
//! error the parser skips to the next declaration boundary so several
//! diagnostics can surface in one pass.

pub mod lexer;

use crate::ast::{
    BinaryOp, CallOption, Declaration, Expr, ExprKind, MatchArm, OptionValue, Pattern,
    Program, TypeExpr, UnaryOp,
};
use crate::error::{CompileError, SourceLocation};
use lexer::{lex, Token, TokenKind};

/// Option names accepted in a `with` clause. Used to decide whether a
/// comma continues the option list or belongs to an enclosing context.
const OPTION_NAMES: &[&str] = &[
    "retry",
    "timeout",
    "delay",
    "backoff",
    "fallback",
    "cache",
    "cache_backend",
    "throttle",
    "concurrency",
    "on_error",
    "lazy",
    "priority",
    "batch",
    "window",
    "join",
    "checkpoint",
];

/// Parse a full program. Returns the AST if no diagnostics were
/// produced, otherwise every parse error found.
pub fn parse_program(source: &str) -> Result<Program, Vec<CompileError>> {
    let tokens = lex(source).map_err(|e| vec![e])?;
    let mut parser = Parser::new(tokens);
    let mut program = Program::new();
    let mut errors = Vec::new();

    while !parser.is_at_end() {
        parser.skip_separators();
        if parser.is_at_end() {
            break;
        }
        match parser.parse_declaration() {
            Ok(decl) => program.declarations.push(decl),
            Err(e) => {
                errors.push(e);
                parser.recover_to_next_declaration();
            }
        }
    }

    if errors.is_empty() {
        Ok(program)
    } else {
        Err(errors)
    }
}

/// Parse a single expression (used by interpolation holes and tests).
pub fn parse_expression(source: &str) -> Result<Expr, CompileError> {
    let tokens = lex(source)?;
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expr()?;
    parser.expect_end()?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0 }
    }

    // ========================================================================
    // Cursor helpers
    // ========================================================================

    fn is_at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|t| &t.kind)
    }

    fn peek_at(&self, offset: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos + offset).map(|t| &t.kind)
    }

    fn location(&self) -> SourceLocation {
        self.peek()
            .map(|t| t.location)
            .or_else(|| self.tokens.last().map(|t| t.location))
            .unwrap_or(SourceLocation::new(1, 1))
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == Some(kind)
    }

    fn check_ident(&self, name: &str) -> bool {
        matches!(self.peek_kind(), Some(TokenKind::Ident(n)) if n == name)
    }

    fn consume(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, context: &str) -> Result<Token, CompileError> {
        if self.check(kind) {
            Ok(self.advance().expect("checked token"))
        } else {
            Err(self.unexpected(&format!("{} in {}", kind.describe(), context)))
        }
    }

    fn expect_ident(&mut self, context: &str) -> Result<(String, SourceLocation), CompileError> {
        match self.peek() {
            Some(Token {
                kind: TokenKind::Ident(name),
                location,
            }) => {
                let result = (name.clone(), *location);
                self.pos += 1;
                Ok(result)
            }
            _ => Err(self.unexpected(&format!("identifier in {context}"))),
        }
    }

    fn expect_end(&mut self) -> Result<(), CompileError> {
        self.skip_separators();
        if self.is_at_end() {
            Ok(())
        } else {
            Err(self.unexpected("end of expression"))
        }
    }

    fn unexpected(&self, expected: &str) -> CompileError {
        match self.peek() {
            Some(token) => CompileError::UnexpectedToken {
                expected: expected.to_string(),
                found: token.kind.describe(),
                location: token.location,
            },
            None => CompileError::ParseError {
                message: format!("unexpected end of input, expected {expected}"),
                location: self.location(),
            },
        }
    }

    fn skip_separators(&mut self) {
        while matches!(
            self.peek_kind(),
            Some(TokenKind::Newline | TokenKind::Semicolon)
        ) {
            self.pos += 1;
        }
    }

    fn recover_to_next_declaration(&mut self) {
        while let Some(kind) = self.peek_kind() {
            if matches!(kind, TokenKind::Newline | TokenKind::Semicolon) {
                break;
            }
            self.pos += 1;
        }
    }

    // ========================================================================
    // Declarations
    // ========================================================================

    fn parse_declaration(&mut self) -> Result<Declaration, CompileError> {
        let span = self.location();
        if self.check_ident("in") && matches!(self.peek_at(1), Some(TokenKind::Ident(_))) {
            self.pos += 1;
            let (name, _) = self.expect_ident("input declaration")?;
            self.expect(&TokenKind::Colon, "input declaration")?;
            let ty = self.parse_type()?;
            return Ok(Declaration::Input { name, ty, span });
        }
        if self.check_ident("out") && matches!(self.peek_at(1), Some(TokenKind::Ident(_))) {
            self.pos += 1;
            let (name, _) = self.expect_ident("output declaration")?;
            return Ok(Declaration::Output { name, span });
        }
        if self.check_ident("type") && matches!(self.peek_at(1), Some(TokenKind::Ident(_))) {
            self.pos += 1;
            let (name, _) = self.expect_ident("type definition")?;
            self.expect(&TokenKind::Assign, "type definition")?;
            let ty = self.parse_type()?;
            return Ok(Declaration::TypeDef { name, ty, span });
        }
        if self.check_ident("use") && matches!(self.peek_at(1), Some(TokenKind::Ident(_))) {
            self.pos += 1;
            let mut path = vec![self.expect_ident("use declaration")?.0];
            while self.consume(&TokenKind::Dot) {
                path.push(self.expect_ident("use declaration")?.0);
            }
            let alias = if self.check_ident("as") {
                self.pos += 1;
                Some(self.expect_ident("use alias")?.0)
            } else {
                None
            };
            return Ok(Declaration::Use { path, alias, span });
        }

        // Assignment: Ident = expr
        let (name, _) = self.expect_ident("declaration")?;
        self.expect(&TokenKind::Assign, "assignment")?;
        let expr = self.parse_expr()?;
        Ok(Declaration::Assignment { name, expr, span })
    }

    // ========================================================================
    // Expressions (loosest to tightest)
    // ========================================================================

    fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        self.parse_guard()
    }

    /// `expr when cond`
    fn parse_guard(&mut self) -> Result<Expr, CompileError> {
        let expr = self.parse_coalesce()?;
        if self.check_ident("when") {
            let span = self.location();
            self.pos += 1;
            let cond = self.parse_coalesce()?;
            return Ok(Expr::new(
                ExprKind::Guard {
                    expr: Box::new(expr),
                    cond: Box::new(cond),
                },
                span,
            ));
        }
        Ok(expr)
    }

    /// `a ?? b` (right associative)
    fn parse_coalesce(&mut self) -> Result<Expr, CompileError> {
        let left = self.parse_or()?;
        if self.check(&TokenKind::Coalesce) {
            let span = self.location();
            self.pos += 1;
            let right = self.parse_coalesce()?;
            return Ok(Expr::new(
                ExprKind::Coalesce {
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            ));
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_and()?;
        while self.check(&TokenKind::OrOr) {
            let span = self.location();
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::new(
                ExprKind::Binary {
                    op: BinaryOp::Or,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_comparison()?;
        while self.check(&TokenKind::AndAnd) {
            let span = self.location();
            self.pos += 1;
            let right = self.parse_comparison()?;
            left = Expr::new(
                ExprKind::Binary {
                    op: BinaryOp::And,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, CompileError> {
        let left = self.parse_additive()?;
        let op = match self.peek_kind() {
            Some(TokenKind::EqEq) => Some(BinaryOp::Eq),
            Some(TokenKind::NotEq) => Some(BinaryOp::Ne),
            Some(TokenKind::Lt) => Some(BinaryOp::Lt),
            Some(TokenKind::Le) => Some(BinaryOp::Le),
            Some(TokenKind::Gt) => Some(BinaryOp::Gt),
            Some(TokenKind::Ge) => Some(BinaryOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            let span = self.location();
            self.pos += 1;
            let right = self.parse_additive()?;
            return Ok(Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            ));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Plus) => BinaryOp::Add,
                Some(TokenKind::Minus) => BinaryOp::Sub,
                _ => break,
            };
            let span = self.location();
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Star) => BinaryOp::Mul,
                Some(TokenKind::Slash) => BinaryOp::Div,
                _ => break,
            };
            let span = self.location();
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        let span = self.location();
        if self.consume(&TokenKind::Bang) {
            let operand = self.parse_unary()?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                span,
            ));
        }
        if self.consume(&TokenKind::Minus) {
            let operand = self.parse_unary()?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                },
                span,
            ));
        }
        self.parse_postfix()
    }

    /// Field access and projection chains.
    fn parse_postfix(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.check(&TokenKind::Dot) {
                let span = self.location();
                self.pos += 1;
                let (field, _) = self.expect_ident("field access")?;
                expr = Expr::new(
                    ExprKind::FieldAccess {
                        base: Box::new(expr),
                        field,
                    },
                    span,
                );
            } else if self.check(&TokenKind::LBracket) {
                let span = self.location();
                self.pos += 1;
                let mut fields = vec![self.expect_ident("projection")?.0];
                while self.consume(&TokenKind::Comma) {
                    fields.push(self.expect_ident("projection")?.0);
                }
                self.expect(&TokenKind::RBracket, "projection")?;
                expr = Expr::new(
                    ExprKind::Projection {
                        base: Box::new(expr),
                        fields,
                    },
                    span,
                );
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let span = self.location();
        match self.peek_kind() {
            Some(TokenKind::Int(n)) => {
                let n = *n;
                self.pos += 1;
                Ok(Expr::new(ExprKind::IntLit(n), span))
            }
            Some(TokenKind::Float(x)) => {
                let x = *x;
                self.pos += 1;
                Ok(Expr::new(ExprKind::FloatLit(x), span))
            }
            Some(TokenKind::Str(s)) => {
                let s = s.clone();
                self.pos += 1;
                Ok(Expr::new(ExprKind::StringLit(s), span))
            }
            Some(TokenKind::InterpStr { .. }) => self.parse_interpolation(),
            Some(TokenKind::LBracket) => self.parse_list_literal(),
            Some(TokenKind::LBrace) => self.parse_record_literal(),
            Some(TokenKind::LParen) => {
                if self.looks_like_lambda() {
                    self.parse_lambda()
                } else {
                    self.pos += 1;
                    let expr = self.parse_expr()?;
                    self.expect(&TokenKind::RParen, "parenthesized expression")?;
                    Ok(expr)
                }
            }
            Some(TokenKind::Ident(name)) => match name.as_str() {
                "true" => {
                    self.pos += 1;
                    Ok(Expr::new(ExprKind::BoolLit(true), span))
                }
                "false" => {
                    self.pos += 1;
                    Ok(Expr::new(ExprKind::BoolLit(false), span))
                }
                "if" => self.parse_if(),
                "branch" => self.parse_branch(),
                "match" => self.parse_match(),
                _ => self.parse_var_or_call(),
            },
            _ => Err(self.unexpected("expression")),
        }
    }

    fn parse_interpolation(&mut self) -> Result<Expr, CompileError> {
        let span = self.location();
        let token = self.advance().expect("interpolation token");
        let TokenKind::InterpStr { parts, exprs } = token.kind else {
            unreachable!("caller checked the token kind");
        };
        let mut parsed = Vec::with_capacity(exprs.len());
        for tokens in exprs {
            let mut sub = Parser::new(tokens);
            let expr = sub.parse_expr()?;
            sub.expect_end()?;
            parsed.push(expr);
        }
        Ok(Expr::new(
            ExprKind::Interpolation {
                parts,
                exprs: parsed,
            },
            span,
        ))
    }

    fn parse_list_literal(&mut self) -> Result<Expr, CompileError> {
        let span = self.location();
        self.expect(&TokenKind::LBracket, "list literal")?;
        let mut items = Vec::new();
        if !self.check(&TokenKind::RBracket) {
            items.push(self.parse_expr()?);
            while self.consume(&TokenKind::Comma) {
                items.push(self.parse_expr()?);
            }
        }
        self.expect(&TokenKind::RBracket, "list literal")?;
        Ok(Expr::new(ExprKind::ListLit(items), span))
    }

    fn parse_record_literal(&mut self) -> Result<Expr, CompileError> {
        let span = self.location();
        self.expect(&TokenKind::LBrace, "record literal")?;
        let mut fields = Vec::new();
        if !self.check(&TokenKind::RBrace) {
            loop {
                let (name, _) = self.expect_ident("record literal")?;
                self.expect(&TokenKind::Colon, "record literal")?;
                let value = self.parse_expr()?;
                fields.push((name, value));
                if !self.consume(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RBrace, "record literal")?;
        Ok(Expr::new(ExprKind::RecordLit(fields), span))
    }

    /// Lookahead: `(` [Ident {`,` Ident}] `)` `=>`.
    fn looks_like_lambda(&self) -> bool {
        let mut offset = 1;
        loop {
            match self.peek_at(offset) {
                Some(TokenKind::RParen) => {
                    return matches!(self.peek_at(offset + 1), Some(TokenKind::FatArrow));
                }
                Some(TokenKind::Ident(_)) => {
                    offset += 1;
                    match self.peek_at(offset) {
                        Some(TokenKind::Comma) => offset += 1,
                        Some(TokenKind::RParen) => {}
                        _ => return false,
                    }
                }
                _ => return false,
            }
        }
    }

    fn parse_lambda(&mut self) -> Result<Expr, CompileError> {
        let span = self.location();
        self.expect(&TokenKind::LParen, "lambda")?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            params.push(self.expect_ident("lambda parameter")?.0);
            while self.consume(&TokenKind::Comma) {
                params.push(self.expect_ident("lambda parameter")?.0);
            }
        }
        self.expect(&TokenKind::RParen, "lambda")?;
        self.expect(&TokenKind::FatArrow, "lambda")?;
        let body = self.parse_expr()?;
        Ok(Expr::new(
            ExprKind::Lambda {
                params,
                body: Box::new(body),
            },
            span,
        ))
    }

    fn parse_if(&mut self) -> Result<Expr, CompileError> {
        let span = self.location();
        self.pos += 1; // `if`
        let cond = self.parse_expr()?;
        self.expect(&TokenKind::LBrace, "if expression")?;
        let then_branch = self.parse_expr()?;
        self.expect(&TokenKind::RBrace, "if expression")?;
        if !self.check_ident("else") {
            return Err(self.unexpected("'else' (conditionals always have both branches)"));
        }
        self.pos += 1;
        let else_branch = if self.check_ident("if") {
            self.parse_if()?
        } else {
            self.expect(&TokenKind::LBrace, "else branch")?;
            let expr = self.parse_expr()?;
            self.expect(&TokenKind::RBrace, "else branch")?;
            expr
        };
        Ok(Expr::new(
            ExprKind::If {
                cond: Box::new(cond),
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
            },
            span,
        ))
    }

    /// `branch { c1 -> e1, ..., otherwise -> e }`
    fn parse_branch(&mut self) -> Result<Expr, CompileError> {
        let span = self.location();
        self.pos += 1; // `branch`
        self.expect(&TokenKind::LBrace, "branch expression")?;
        let mut arms = Vec::new();
        let mut otherwise = None;
        loop {
            if self.check_ident("otherwise") {
                self.pos += 1;
                self.expect(&TokenKind::Arrow, "branch otherwise arm")?;
                otherwise = Some(self.parse_expr()?);
            } else {
                let cond = self.parse_expr()?;
                self.expect(&TokenKind::Arrow, "branch arm")?;
                let value = self.parse_expr()?;
                arms.push((cond, value));
            }
            if !self.consume(&TokenKind::Comma) {
                break;
            }
            if self.check(&TokenKind::RBrace) {
                break; // trailing comma
            }
        }
        self.expect(&TokenKind::RBrace, "branch expression")?;
        let otherwise = otherwise.ok_or_else(|| CompileError::ParseError {
            message: "branch requires an 'otherwise' arm".to_string(),
            location: span,
        })?;
        Ok(Expr::new(
            ExprKind::Branch {
                arms,
                otherwise: Box::new(otherwise),
            },
            span,
        ))
    }

    /// `match x { name: Type -> expr, ..., _ -> expr }`
    fn parse_match(&mut self) -> Result<Expr, CompileError> {
        let span = self.location();
        self.pos += 1; // `match`
        let scrutinee = self.parse_expr()?;
        self.expect(&TokenKind::LBrace, "match expression")?;
        let mut arms = Vec::new();
        loop {
            let arm_span = self.location();
            let pattern = if self.check_ident("_") {
                self.pos += 1;
                Pattern::Wildcard
            } else {
                let (binding, _) = self.expect_ident("match pattern")?;
                self.expect(&TokenKind::Colon, "match pattern")?;
                let ty = self.parse_type()?;
                Pattern::Typed { binding, ty }
            };
            self.expect(&TokenKind::Arrow, "match arm")?;
            let body = self.parse_expr()?;
            arms.push(MatchArm {
                pattern,
                body,
                span: arm_span,
            });
            if !self.consume(&TokenKind::Comma) {
                break;
            }
            if self.check(&TokenKind::RBrace) {
                break;
            }
        }
        self.expect(&TokenKind::RBrace, "match expression")?;
        Ok(Expr::new(
            ExprKind::Match {
                scrutinee: Box::new(scrutinee),
                arms,
            },
            span,
        ))
    }

    /// Variable reference or (qualified) call with options.
    fn parse_var_or_call(&mut self) -> Result<Expr, CompileError> {
        let span = self.location();
        let (first, _) = self.expect_ident("expression")?;

        // Collect a dotted path while it could still be a qualified call
        let mut path = vec![first];
        let mut lookahead = 0;
        while matches!(self.peek_at(lookahead), Some(TokenKind::Dot))
            && matches!(self.peek_at(lookahead + 1), Some(TokenKind::Ident(_)))
        {
            lookahead += 2;
        }
        let is_call = matches!(self.peek_at(lookahead), Some(TokenKind::LParen));

        if is_call {
            while self.consume(&TokenKind::Dot) {
                path.push(self.expect_ident("qualified name")?.0);
            }
            self.expect(&TokenKind::LParen, "call")?;
            let mut args = Vec::new();
            if !self.check(&TokenKind::RParen) {
                args.push(self.parse_expr()?);
                while self.consume(&TokenKind::Comma) {
                    args.push(self.parse_expr()?);
                }
            }
            self.expect(&TokenKind::RParen, "call")?;
            let options = if self.check_ident("with") {
                self.pos += 1;
                self.parse_options()?
            } else {
                Vec::new()
            };
            return Ok(Expr::new(ExprKind::Call { path, args, options }, span));
        }

        // Plain variable; any dots are field accesses handled by postfix
        Ok(Expr::new(
            ExprKind::Var(path.remove(0)),
            span,
        ))
    }

    // ========================================================================
    // Call options
    // ========================================================================

    fn parse_options(&mut self) -> Result<Vec<CallOption>, CompileError> {
        let mut options = vec![self.parse_option_entry()?];
        // A comma continues the list only when followed by `name:` for a
        // known option name; otherwise it belongs to the caller.
        while self.check(&TokenKind::Comma) {
            let next_is_option = matches!(
                (self.peek_at(1), self.peek_at(2)),
                (Some(TokenKind::Ident(name)), Some(TokenKind::Colon))
                    if OPTION_NAMES.contains(&name.as_str())
            );
            if !next_is_option {
                break;
            }
            self.pos += 1;
            options.push(self.parse_option_entry()?);
        }
        Ok(options)
    }

    fn parse_option_entry(&mut self) -> Result<CallOption, CompileError> {
        let (name, span) = self.expect_ident("option name")?;
        self.expect(&TokenKind::Colon, "option")?;
        let value = self.parse_option_value(&name)?;
        Ok(CallOption { name, value, span })
    }

    fn parse_option_value(&mut self, option: &str) -> Result<OptionValue, CompileError> {
        // Fallback takes a full expression
        if option == "fallback" {
            let expr = self.parse_expr()?;
            return Ok(OptionValue::Expr(Box::new(expr)));
        }

        match self.peek_kind() {
            Some(TokenKind::Int(n)) => {
                let n = *n;
                // `5/1s` rate form
                if matches!(self.peek_at(1), Some(TokenKind::Slash))
                    && matches!(self.peek_at(2), Some(TokenKind::Duration(_)))
                {
                    self.pos += 2;
                    let Some(TokenKind::Duration(window_ms)) = self.peek_kind().cloned()
                    else {
                        unreachable!("lookahead checked duration");
                    };
                    self.pos += 1;
                    let count = u32::try_from(n).map_err(|_| CompileError::ParseError {
                        message: format!("rate count {n} out of range"),
                        location: self.location(),
                    })?;
                    return Ok(OptionValue::Rate { count, window_ms });
                }
                self.pos += 1;
                Ok(OptionValue::Int(n))
            }
            Some(TokenKind::Duration(ms)) => {
                let ms = *ms;
                self.pos += 1;
                Ok(OptionValue::Duration { ms })
            }
            Some(TokenKind::Str(s)) => {
                let s = s.clone();
                self.pos += 1;
                Ok(OptionValue::String(s))
            }
            Some(TokenKind::Ident(name)) if name == "true" || name == "false" => {
                let value = name == "true";
                self.pos += 1;
                Ok(OptionValue::Bool(value))
            }
            Some(TokenKind::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(OptionValue::Ident(name))
            }
            _ => Err(self.unexpected("option value")),
        }
    }

    // ========================================================================
    // Type expressions
    // ========================================================================

    fn parse_type(&mut self) -> Result<TypeExpr, CompileError> {
        let first = self.parse_optional_type()?;
        if !self.check(&TokenKind::Pipe) {
            return Ok(first);
        }
        let mut members = vec![first];
        while self.consume(&TokenKind::Pipe) {
            members.push(self.parse_optional_type()?);
        }
        Ok(TypeExpr::Union(members))
    }

    fn parse_optional_type(&mut self) -> Result<TypeExpr, CompileError> {
        let mut ty = self.parse_base_type()?;
        while self.consume(&TokenKind::Question) {
            ty = TypeExpr::Optional(Box::new(ty));
        }
        Ok(ty)
    }

    fn parse_base_type(&mut self) -> Result<TypeExpr, CompileError> {
        if self.check(&TokenKind::LBrace) {
            self.pos += 1;
            let mut fields = Vec::new();
            if !self.check(&TokenKind::RBrace) {
                loop {
                    let (name, _) = self.expect_ident("record type")?;
                    self.expect(&TokenKind::Colon, "record type")?;
                    let ty = self.parse_type()?;
                    fields.push((name, ty));
                    if !self.consume(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(&TokenKind::RBrace, "record type")?;
            return Ok(TypeExpr::Record(fields));
        }

        let (name, _) = self.expect_ident("type")?;
        match name.as_str() {
            "List" => {
                self.expect(&TokenKind::Lt, "List type")?;
                let elem = self.parse_type()?;
                self.expect(&TokenKind::Gt, "List type")?;
                Ok(TypeExpr::List(Box::new(elem)))
            }
            "Map" => {
                self.expect(&TokenKind::Lt, "Map type")?;
                let key = self.parse_type()?;
                self.expect(&TokenKind::Comma, "Map type")?;
                let value = self.parse_type()?;
                self.expect(&TokenKind::Gt, "Map type")?;
                Ok(TypeExpr::Map(Box::new(key), Box::new(value)))
            }
            _ => Ok(TypeExpr::Named(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(source: &str) -> Declaration {
        let program = parse_program(source).unwrap();
        assert_eq!(program.declarations.len(), 1, "expected one declaration");
        program.declarations.into_iter().next().expect("declaration")
    }

    #[test]
    fn test_input_declaration() {
        let decl = parse_one("in name: String");
        match decl {
            Declaration::Input { name, ty, .. } => {
                assert_eq!(name, "name");
                assert_eq!(ty, TypeExpr::Named("String".to_string()));
            }
            other => panic!("expected input, got {other:?}"),
        }
    }

    #[test]
    fn test_record_type_with_union_and_optional() {
        let decl = parse_one("type T = {id: Int, tag: String | Int, note: String?}");
        match decl {
            Declaration::TypeDef { ty: TypeExpr::Record(fields), .. } => {
                assert_eq!(fields.len(), 3);
                assert!(matches!(fields[1].1, TypeExpr::Union(_)));
                assert!(matches!(fields[2].1, TypeExpr::Optional(_)));
            }
            other => panic!("expected record typedef, got {other:?}"),
        }
    }

    #[test]
    fn test_call_with_options() {
        let decl = parse_one(
            "x = fetch(url) with retry: 3, timeout: 5s, backoff: exponential, fallback: \"d\"",
        );
        match decl {
            Declaration::Assignment { expr, .. } => match expr.kind {
                ExprKind::Call { path, args, options } => {
                    assert_eq!(path, vec!["fetch".to_string()]);
                    assert_eq!(args.len(), 1);
                    assert_eq!(options.len(), 4);
                    assert_eq!(options[0].name, "retry");
                    assert_eq!(options[0].value, OptionValue::Int(3));
                    assert_eq!(options[1].value, OptionValue::Duration { ms: 5_000 });
                    assert_eq!(
                        options[2].value,
                        OptionValue::Ident("exponential".to_string())
                    );
                    assert!(matches!(options[3].value, OptionValue::Expr(_)));
                }
                other => panic!("expected call, got {other:?}"),
            },
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn test_throttle_rate_option() {
        let decl = parse_one("x = fetch(u) with throttle: 5/1s");
        match decl {
            Declaration::Assignment { expr, .. } => match expr.kind {
                ExprKind::Call { options, .. } => {
                    assert_eq!(
                        options[0].value,
                        OptionValue::Rate { count: 5, window_ms: 1_000 }
                    );
                }
                other => panic!("expected call, got {other:?}"),
            },
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn test_branch_expression() {
        let decl = parse_one(
            "grade = branch { score >= 90 -> \"A\", score >= 80 -> \"B\", otherwise -> \"F\" }",
        );
        match decl {
            Declaration::Assignment { expr, .. } => match expr.kind {
                ExprKind::Branch { arms, otherwise } => {
                    assert_eq!(arms.len(), 2);
                    assert_eq!(otherwise.kind, ExprKind::StringLit("F".to_string()));
                }
                other => panic!("expected branch, got {other:?}"),
            },
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn test_branch_requires_otherwise() {
        let errors = parse_program("g = branch { a -> 1 }").unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.to_string().contains("otherwise")));
    }

    #[test]
    fn test_guard_and_coalesce() {
        let decl = parse_one("msg = high ?? \"low\" when score > t");
        match decl {
            Declaration::Assignment { expr, .. } => match expr.kind {
                ExprKind::Guard { expr, cond } => {
                    assert!(matches!(expr.kind, ExprKind::Coalesce { .. }));
                    assert!(matches!(cond.kind, ExprKind::Binary { op: BinaryOp::Gt, .. }));
                }
                other => panic!("expected guard, got {other:?}"),
            },
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn test_lambda_and_projection() {
        let decl = parse_one("adults = filter(people, (p) => p.age >= 18)[name, age]");
        match decl {
            Declaration::Assignment { expr, .. } => match expr.kind {
                ExprKind::Projection { base, fields } => {
                    assert_eq!(fields, vec!["name".to_string(), "age".to_string()]);
                    match base.kind {
                        ExprKind::Call { path, args, .. } => {
                            assert_eq!(path, vec!["filter".to_string()]);
                            assert!(matches!(args[1].kind, ExprKind::Lambda { .. }));
                        }
                        other => panic!("expected call, got {other:?}"),
                    }
                }
                other => panic!("expected projection, got {other:?}"),
            },
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn test_interpolation() {
        let decl = parse_one("msg = \"Hi ${user.name}, you scored ${score}\"");
        match decl {
            Declaration::Assignment { expr, .. } => match expr.kind {
                ExprKind::Interpolation { parts, exprs } => {
                    assert_eq!(parts.len(), 3);
                    assert_eq!(exprs.len(), 2);
                }
                other => panic!("expected interpolation, got {other:?}"),
            },
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn test_match_expression() {
        let decl = parse_one("r = match v { s: String -> s, n: Int -> \"int\", _ -> \"other\" }");
        match decl {
            Declaration::Assignment { expr, .. } => match expr.kind {
                ExprKind::Match { arms, .. } => {
                    assert_eq!(arms.len(), 3);
                    assert!(matches!(arms[2].pattern, Pattern::Wildcard));
                }
                other => panic!("expected match, got {other:?}"),
            },
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn test_multiple_declarations_with_semicolons() {
        let program =
            parse_program("in name: String; greeting = concat(\"Hello, \", name); out greeting")
                .unwrap();
        assert_eq!(program.declarations.len(), 3);
    }

    #[test]
    fn test_use_with_alias() {
        let decl = parse_one("use text.concat as join");
        match decl {
            Declaration::Use { path, alias, .. } => {
                assert_eq!(path, vec!["text".to_string(), "concat".to_string()]);
                assert_eq!(alias, Some("join".to_string()));
            }
            other => panic!("expected use, got {other:?}"),
        }
    }

    #[test]
    fn test_error_recovery_reports_multiple_errors() {
        let errors = parse_program("x = ]\ny = )\nz = 5").unwrap_err();
        assert!(errors.len() >= 2, "expected several diagnostics: {errors:?}");
    }

    #[test]
    fn test_merge_and_field_access() {
        let decl = parse_one("merged = base + extra");
        match decl {
            Declaration::Assignment { expr, .. } => {
                assert!(matches!(
                    expr.kind,
                    ExprKind::Binary { op: BinaryOp::Add, .. }
                ));
            }
            other => panic!("expected assignment, got {other:?}"),
        }
    }
}
