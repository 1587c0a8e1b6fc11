//! Hand-rolled lexer.
//!
//! Produces a flat token stream with source positions. String literals
//! are scanned with interpolation awareness: `"a ${x} b"` lexes into
//! literal parts plus one recursively-lexed token stream per `${...}`
//! hole. Newlines act as declaration terminators, so they are emitted as
//! tokens, except inside brackets or directly after a token that cannot
//! end a declaration.

use crate::error::{CompileError, SourceLocation};

/// One lexed token.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Int(i64),
    Float(f64),
    /// `500ms`, `2s`, `1min`, `1h`, `1d` — normalized to milliseconds
    Duration(u64),
    /// Plain string literal (no interpolation holes)
    Str(String),
    /// Interpolated string: `parts.len() == exprs.len() + 1`
    InterpStr {
        parts: Vec<String>,
        exprs: Vec<Vec<Token>>,
    },
    // Punctuation / operators
    Assign,    // =
    Plus,      // +
    Minus,     // -
    Star,      // *
    Slash,     // /
    EqEq,      // ==
    NotEq,     // !=
    Lt,        // <
    Le,        // <=
    Gt,        // >
    Ge,        // >=
    AndAnd,    // &&
    OrOr,      // ||
    Bang,      // !
    Coalesce,  // ??
    Question,  // ?
    Arrow,     // ->
    FatArrow,  // =>
    LParen,    // (
    RParen,    // )
    LBracket,  // [
    RBracket,  // ]
    LBrace,    // {
    RBrace,    // }
    Comma,     // ,
    Colon,     // :
    Dot,       // .
    Pipe,      // |
    Newline,
    Semicolon, // ;
}

impl TokenKind {
    /// Tokens after which a newline cannot terminate a declaration.
    fn suppresses_newline(&self) -> bool {
        matches!(
            self,
            TokenKind::Assign
                | TokenKind::Plus
                | TokenKind::Minus
                | TokenKind::Star
                | TokenKind::Slash
                | TokenKind::EqEq
                | TokenKind::NotEq
                | TokenKind::Lt
                | TokenKind::Le
                | TokenKind::Gt
                | TokenKind::Ge
                | TokenKind::AndAnd
                | TokenKind::OrOr
                | TokenKind::Bang
                | TokenKind::Coalesce
                | TokenKind::Arrow
                | TokenKind::FatArrow
                | TokenKind::Comma
                | TokenKind::Colon
                | TokenKind::Dot
                | TokenKind::Pipe
                | TokenKind::LParen
                | TokenKind::LBracket
                | TokenKind::LBrace
                | TokenKind::Newline
                | TokenKind::Semicolon
        )
    }

    /// Human-readable token name for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Ident(name) => format!("'{name}'"),
            TokenKind::Int(n) => format!("'{n}'"),
            TokenKind::Float(x) => format!("'{x}'"),
            TokenKind::Duration(ms) => format!("'{ms}ms'"),
            TokenKind::Str(_) | TokenKind::InterpStr { .. } => "string literal".to_string(),
            TokenKind::Assign => "'='".to_string(),
            TokenKind::Plus => "'+'".to_string(),
            TokenKind::Minus => "'-'".to_string(),
            TokenKind::Star => "'*'".to_string(),
            TokenKind::Slash => "'/'".to_string(),
            TokenKind::EqEq => "'=='".to_string(),
            TokenKind::NotEq => "'!='".to_string(),
            TokenKind::Lt => "'<'".to_string(),
            TokenKind::Le => "'<='".to_string(),
            TokenKind::Gt => "'>'".to_string(),
            TokenKind::Ge => "'>='".to_string(),
            TokenKind::AndAnd => "'&&'".to_string(),
            TokenKind::OrOr => "'||'".to_string(),
            TokenKind::Bang => "'!'".to_string(),
            TokenKind::Coalesce => "'??'".to_string(),
            TokenKind::Question => "'?'".to_string(),
            TokenKind::Arrow => "'->'".to_string(),
            TokenKind::FatArrow => "'=>'".to_string(),
            TokenKind::LParen => "'('".to_string(),
            TokenKind::RParen => "')'".to_string(),
            TokenKind::LBracket => "'['".to_string(),
            TokenKind::RBracket => "']'".to_string(),
            TokenKind::LBrace => "'{'".to_string(),
            TokenKind::RBrace => "'}'".to_string(),
            TokenKind::Comma => "','".to_string(),
            TokenKind::Colon => "':'".to_string(),
            TokenKind::Dot => "'.'".to_string(),
            TokenKind::Pipe => "'|'".to_string(),
            TokenKind::Newline => "newline".to_string(),
            TokenKind::Semicolon => "';'".to_string(),
        }
    }
}

/// Lex a full source file.
pub fn lex(source: &str) -> Result<Vec<Token>, CompileError> {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
    bracket_depth: u32,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Lexer {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            bracket_depth: 0,
        }
    }

    fn run(mut self) -> Result<Vec<Token>, CompileError> {
        let mut tokens: Vec<Token> = Vec::new();
        while let Some(c) = self.peek() {
            let location = SourceLocation::new(self.line, self.column);
            match c {
                ' ' | '\t' | '\r' => {
                    self.bump();
                }
                '\n' => {
                    self.bump();
                    let suppress = self.bracket_depth > 0
                        || tokens
                            .last()
                            .is_none_or(|t| t.kind.suppresses_newline());
                    if !suppress {
                        tokens.push(Token {
                            kind: TokenKind::Newline,
                            location,
                        });
                    }
                }
                '/' if self.peek_at(1) == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                '/' if self.peek_at(1) == Some('*') => {
                    self.skip_block_comment(location)?;
                }
                '"' => {
                    let token = self.lex_string(location)?;
                    tokens.push(token);
                }
                c if c.is_ascii_digit() => {
                    let token = self.lex_number(location)?;
                    tokens.push(token);
                }
                c if c.is_alphabetic() || c == '_' => {
                    let token = self.lex_ident(location);
                    tokens.push(token);
                }
                _ => {
                    let token = self.lex_symbol(location)?;
                    tokens.push(token);
                }
            }
        }
        Ok(tokens)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied();
        if let Some(c) = c {
            self.pos += 1;
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        c
    }

    fn skip_block_comment(&mut self, start: SourceLocation) -> Result<(), CompileError> {
        self.bump();
        self.bump();
        let mut depth = 1u32;
        while depth > 0 {
            match (self.peek(), self.peek_at(1)) {
                (Some('/'), Some('*')) => {
                    self.bump();
                    self.bump();
                    depth += 1;
                }
                (Some('*'), Some('/')) => {
                    self.bump();
                    self.bump();
                    depth -= 1;
                }
                (Some(_), _) => {
                    self.bump();
                }
                (None, _) => {
                    return Err(CompileError::ParseError {
                        message: "unterminated block comment".to_string(),
                        location: start,
                    })
                }
            }
        }
        Ok(())
    }

    fn lex_string(&mut self, start: SourceLocation) -> Result<Token, CompileError> {
        self.bump(); // opening quote
        let mut parts: Vec<String> = Vec::new();
        let mut exprs: Vec<Vec<Token>> = Vec::new();
        let mut current = String::new();

        loop {
            match self.peek() {
                None => {
                    return Err(CompileError::ParseError {
                        message: "unterminated string literal".to_string(),
                        location: start,
                    })
                }
                Some('"') => {
                    self.bump();
                    break;
                }
                Some('\\') => {
                    self.bump();
                    let escaped = self.bump().ok_or(CompileError::ParseError {
                        message: "unterminated escape sequence".to_string(),
                        location: start,
                    })?;
                    match escaped {
                        'n' => current.push('\n'),
                        't' => current.push('\t'),
                        '\\' => current.push('\\'),
                        '"' => current.push('"'),
                        '$' => current.push('$'),
                        other => {
                            return Err(CompileError::ParseError {
                                message: format!("unknown escape '\\{other}'"),
                                location: SourceLocation::new(self.line, self.column),
                            })
                        }
                    }
                }
                Some('$') if self.peek_at(1) == Some('{') => {
                    self.bump();
                    self.bump();
                    parts.push(std::mem::take(&mut current));
                    exprs.push(self.lex_interpolation_hole(start)?);
                }
                Some(c) => {
                    self.bump();
                    current.push(c);
                }
            }
        }
        parts.push(current);

        if exprs.is_empty() {
            Ok(Token {
                kind: TokenKind::Str(parts.remove(0)),
                location: start,
            })
        } else {
            Ok(Token {
                kind: TokenKind::InterpStr { parts, exprs },
                location: start,
            })
        }
    }

    /// Lex the inside of a `${...}` hole up to the matching `}`.
    fn lex_interpolation_hole(
        &mut self,
        start: SourceLocation,
    ) -> Result<Vec<Token>, CompileError> {
        let mut depth = 1u32;
        let mut inner = String::new();
        loop {
            match self.peek() {
                None => {
                    return Err(CompileError::ParseError {
                        message: "unterminated interpolation".to_string(),
                        location: start,
                    })
                }
                Some('{') => {
                    depth += 1;
                    inner.push('{');
                    self.bump();
                }
                Some('}') => {
                    depth -= 1;
                    self.bump();
                    if depth == 0 {
                        break;
                    }
                    inner.push('}');
                }
                Some(c) => {
                    inner.push(c);
                    self.bump();
                }
            }
        }
        // Positions inside holes are relative to the hole text
        lex(&inner)
    }

    fn lex_number(&mut self, start: SourceLocation) -> Result<Token, CompileError> {
        let mut digits = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                digits.push(c);
                self.bump();
            } else {
                break;
            }
        }

        let mut is_float = false;
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            digits.push('.');
            self.bump();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    digits.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
        }

        // Duration suffix: ms | s | min | h | d
        if !is_float {
            if let Some(multiplier) = self.try_duration_suffix() {
                let base: u64 = digits.parse().map_err(|_| CompileError::ParseError {
                    message: format!("invalid duration literal '{digits}'"),
                    location: start,
                })?;
                return Ok(Token {
                    kind: TokenKind::Duration(base * multiplier),
                    location: start,
                });
            }
        }

        if is_float {
            let value: f64 = digits.parse().map_err(|_| CompileError::ParseError {
                message: format!("invalid float literal '{digits}'"),
                location: start,
            })?;
            Ok(Token {
                kind: TokenKind::Float(value),
                location: start,
            })
        } else {
            let value: i64 = digits.parse().map_err(|_| CompileError::ParseError {
                message: format!("invalid integer literal '{digits}'"),
                location: start,
            })?;
            Ok(Token {
                kind: TokenKind::Int(value),
                location: start,
            })
        }
    }

    /// Consume a duration suffix if one follows, returning its
    /// milliseconds multiplier. `min` must be checked before `m`-leading
    /// identifiers; a suffix only counts when the following char is not
    /// part of an identifier.
    fn try_duration_suffix(&mut self) -> Option<u64> {
        let suffixes: [(&str, u64); 5] = [
            ("ms", 1),
            ("min", 60_000),
            ("s", 1_000),
            ("h", 3_600_000),
            ("d", 86_400_000),
        ];
        for (suffix, multiplier) in suffixes {
            let len = suffix.len();
            let matches = (0..len).all(|i| self.peek_at(i) == suffix.chars().nth(i));
            if matches {
                let next = self.peek_at(len);
                if next.is_none_or(|c| !c.is_alphanumeric() && c != '_') {
                    for _ in 0..len {
                        self.bump();
                    }
                    return Some(multiplier);
                }
            }
        }
        None
    }

    fn lex_ident(&mut self, start: SourceLocation) -> Token {
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                name.push(c);
                self.bump();
            } else {
                break;
            }
        }
        Token {
            kind: TokenKind::Ident(name),
            location: start,
        }
    }

    fn lex_symbol(&mut self, start: SourceLocation) -> Result<Token, CompileError> {
        let c = self.bump().expect("symbol start");
        let kind = match c {
            '=' => match self.peek() {
                Some('=') => {
                    self.bump();
                    TokenKind::EqEq
                }
                Some('>') => {
                    self.bump();
                    TokenKind::FatArrow
                }
                _ => TokenKind::Assign,
            },
            '!' => {
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::NotEq
                } else {
                    TokenKind::Bang
                }
            }
            '<' => {
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::Le
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            '&' => {
                if self.peek() == Some('&') {
                    self.bump();
                    TokenKind::AndAnd
                } else {
                    return Err(CompileError::ParseError {
                        message: "expected '&&'".to_string(),
                        location: start,
                    });
                }
            }
            '|' => {
                if self.peek() == Some('|') {
                    self.bump();
                    TokenKind::OrOr
                } else {
                    TokenKind::Pipe
                }
            }
            '?' => {
                if self.peek() == Some('?') {
                    self.bump();
                    TokenKind::Coalesce
                } else {
                    TokenKind::Question
                }
            }
            '-' => {
                if self.peek() == Some('>') {
                    self.bump();
                    TokenKind::Arrow
                } else {
                    TokenKind::Minus
                }
            }
            '+' => TokenKind::Plus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '(' => {
                self.bracket_depth += 1;
                TokenKind::LParen
            }
            ')' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                TokenKind::RParen
            }
            '[' => {
                self.bracket_depth += 1;
                TokenKind::LBracket
            }
            ']' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                TokenKind::RBracket
            }
            '{' => {
                self.bracket_depth += 1;
                TokenKind::LBrace
            }
            '}' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                TokenKind::RBrace
            }
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            '.' => TokenKind::Dot,
            ';' => TokenKind::Semicolon,
            other => {
                return Err(CompileError::ParseError {
                    message: format!("unexpected character '{other}'"),
                    location: start,
                })
            }
        };
        Ok(Token { kind, location: start })
    }
}
