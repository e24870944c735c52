//! Recursive-descent parser for Ember syntax
//!
//! Syntax:
//! ```text
//! name Counter;
//!
//! storage {
//!   total: uint256;
//!   balances: mapping<address, uint256>;
//! }
//!
//! code -> uint256 {
//!   let x = 42;
//!   balances[msg.sender] = msg.value;
//!   return x;
//! }
//! ```
//!
//! The parser accumulates diagnostics and recovers at statement and
//! declaration boundaries, so one run surfaces as many syntax errors as
//! possible. A partial `Program` is returned whenever the `name`
//! declaration parsed.

use crate::ast::{
    BinOp, Block, CodeBlock, EnvField, Expr, ExprKind, Program, Statement, StorageDecl, StructDef,
    TypeExpr, UnOp,
};
use crate::diagnostics::{codes, Diagnostic, SourceLocation};
use crate::lexer::{tokenize, Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    diagnostics: Vec<Diagnostic>,
}

impl Parser {
    pub fn new(source: &str) -> Self {
        let (tokens, diagnostics) = tokenize(source);
        Parser {
            tokens,
            pos: 0,
            diagnostics,
        }
    }

    /// Parse a whole program. Returns `(program, diagnostics)`; the program
    /// is `None` only when not even the `name` header could be parsed.
    pub fn parse(mut self) -> (Option<Program>, Vec<Diagnostic>) {
        let program = self.parse_program();
        (program, self.diagnostics)
    }

    fn parse_program(&mut self) -> Option<Program> {
        // name X;
        if !self.eat(&TokenKind::Name) {
            self.error_here(codes::EXPECTED_DECLARATION, "expected `name` declaration");
            return None;
        }
        let name = self.expect_ident("program name")?;
        self.expect(&TokenKind::Semi, "`;` after program name");

        let mut program = Program::new(name);
        let mut next_slot = 0usize;

        while !self.is_at_end() {
            let loc = self.here();
            match self.peek_kind() {
                Some(TokenKind::Struct) => {
                    if let Some(def) = self.parse_struct_def() {
                        program.structs.push(def);
                    }
                }
                Some(TokenKind::Storage) => {
                    self.advance();
                    self.expect(&TokenKind::LBrace, "`{` after `storage`");
                    while !self.check(&TokenKind::RBrace) && !self.is_at_end() {
                        let loc = self.here();
                        let Some(name) = self.expect_ident("storage field name") else {
                            self.recover_to_semi_or_brace();
                            continue;
                        };
                        self.expect(&TokenKind::Colon, "`:` after storage field name");
                        let Some(ty) = self.parse_type() else {
                            self.recover_to_semi_or_brace();
                            continue;
                        };
                        self.expect(&TokenKind::Semi, "`;` after storage declaration");
                        program.storage.push(StorageDecl {
                            slot: next_slot,
                            name,
                            ty,
                            location: loc,
                        });
                        next_slot += 1;
                    }
                    self.expect(&TokenKind::RBrace, "`}` closing `storage` block");
                }
                Some(TokenKind::Create) => {
                    self.advance();
                    if let Some(body) = self.parse_block() {
                        if program.create.is_some() {
                            self.diagnostics.push(
                                Diagnostic::error(
                                    codes::DUPLICATE_DEFINITION,
                                    "duplicate `create` block",
                                )
                                .at(loc),
                            );
                        }
                        program.create = Some(body);
                    }
                }
                Some(TokenKind::Code) => {
                    self.advance();
                    let returns = if self.eat(&TokenKind::Arrow) {
                        self.parse_type()
                    } else {
                        None
                    };
                    if let Some(body) = self.parse_block() {
                        if program.code.is_some() {
                            self.diagnostics.push(
                                Diagnostic::error(
                                    codes::DUPLICATE_DEFINITION,
                                    "duplicate `code` block",
                                )
                                .at(loc),
                            );
                        }
                        program.code = Some(CodeBlock { returns, body });
                    }
                }
                _ => {
                    self.error_here(
                        codes::EXPECTED_DECLARATION,
                        "expected `struct`, `storage`, `create` or `code`",
                    );
                    self.advance();
                }
            }
        }
        Some(program)
    }

    fn parse_struct_def(&mut self) -> Option<StructDef> {
        let location = self.here();
        self.expect(&TokenKind::Struct, "`struct`");
        let name = self.expect_ident("struct name")?;
        self.expect(&TokenKind::LBrace, "`{` after struct name");
        let mut fields = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.is_at_end() {
            let Some(field) = self.expect_ident("field name") else {
                self.recover_to_semi_or_brace();
                continue;
            };
            self.expect(&TokenKind::Colon, "`:` after field name");
            let Some(ty) = self.parse_type() else {
                self.recover_to_semi_or_brace();
                continue;
            };
            self.expect(&TokenKind::Semi, "`;` after struct field");
            fields.push((field, ty));
        }
        self.expect(&TokenKind::RBrace, "`}` closing struct definition");
        Some(StructDef {
            name,
            fields,
            location,
        })
    }

    // ------------------------------------------------------------------
    // Types
    // ------------------------------------------------------------------

    /// Parse a type expression, including array suffixes.
    fn parse_type(&mut self) -> Option<TypeExpr> {
        let mut base = self.parse_base_type()?;
        // Array suffixes bind left to right: uint256[3][] is an array of
        // fixed arrays.
        while self.eat(&TokenKind::LBracket) {
            let size = match self.peek_kind() {
                Some(TokenKind::Number(n)) => {
                    let n = n.saturating_to::<u64>() as usize;
                    self.advance();
                    Some(n)
                }
                _ => None,
            };
            self.expect(&TokenKind::RBracket, "`]` closing array type");
            base = TypeExpr::Array(Box::new(base), size);
        }
        Some(base)
    }

    fn parse_base_type(&mut self) -> Option<TypeExpr> {
        if self.eat(&TokenKind::Mapping) {
            self.expect(&TokenKind::Lt, "`<` after `mapping`");
            let key = self.parse_type()?;
            self.expect(&TokenKind::Comma, "`,` between mapping key and value");
            let value = self.parse_type()?;
            self.expect_type_gt();
            return Some(TypeExpr::Mapping(Box::new(key), Box::new(value)));
        }
        let loc = self.here();
        let name = self.expect_ident("type name")?;
        match type_from_name(&name) {
            Some(ty) => Some(ty),
            None => {
                if name.chars().next().is_some_and(char::is_uppercase) {
                    Some(TypeExpr::Named(name))
                } else {
                    self.diagnostics.push(
                        Diagnostic::error(codes::UNKNOWN_TYPE, format!("unknown type `{}`", name))
                            .at(loc),
                    );
                    None
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_block(&mut self) -> Option<Block> {
        self.expect(&TokenKind::LBrace, "`{`")?;
        let mut statements = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.is_at_end() {
            match self.parse_statement() {
                Some(stmt) => statements.push(stmt),
                None => self.recover_to_semi_or_brace(),
            }
        }
        self.expect(&TokenKind::RBrace, "`}` closing block");
        Some(Block { statements })
    }

    fn parse_statement(&mut self) -> Option<Statement> {
        let location = self.here();
        match self.peek_kind() {
            Some(TokenKind::Let) => {
                let stmt = self.parse_let(location)?;
                self.expect(&TokenKind::Semi, "`;` after `let` statement");
                Some(stmt)
            }
            Some(TokenKind::If) => self.parse_if(location),
            Some(TokenKind::While) => {
                self.advance();
                self.expect(&TokenKind::LParen, "`(` after `while`");
                let condition = self.parse_expr()?;
                self.expect(&TokenKind::RParen, "`)` after loop condition");
                let body = self.parse_block()?;
                Some(Statement::While {
                    condition,
                    body,
                    location,
                })
            }
            Some(TokenKind::For) => {
                self.advance();
                self.expect(&TokenKind::LParen, "`(` after `for`");
                let init = self.parse_simple_statement()?;
                self.expect(&TokenKind::Semi, "`;` after `for` initializer");
                let condition = self.parse_expr()?;
                self.expect(&TokenKind::Semi, "`;` after `for` condition");
                let update = self.parse_simple_statement()?;
                self.expect(&TokenKind::RParen, "`)` after `for` header");
                let body = self.parse_block()?;
                Some(Statement::For {
                    init: Box::new(init),
                    condition,
                    update: Box::new(update),
                    body,
                    location,
                })
            }
            Some(TokenKind::Break) => {
                self.advance();
                self.expect(&TokenKind::Semi, "`;` after `break`");
                Some(Statement::Break { location })
            }
            Some(TokenKind::Continue) => {
                self.advance();
                self.expect(&TokenKind::Semi, "`;` after `continue`");
                Some(Statement::Continue { location })
            }
            Some(TokenKind::Return) => {
                self.advance();
                let value = if self.check(&TokenKind::Semi) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.expect(&TokenKind::Semi, "`;` after `return`");
                Some(Statement::Return { value, location })
            }
            _ => {
                let stmt = self.parse_simple_statement()?;
                self.expect(&TokenKind::Semi, "`;` after statement");
                Some(stmt)
            }
        }
    }

    /// A statement without its trailing `;`: `let`, assignment, or a bare
    /// expression. Used directly in `for` headers.
    fn parse_simple_statement(&mut self) -> Option<Statement> {
        let location = self.here();
        if self.check(&TokenKind::Let) {
            return self.parse_let(location);
        }
        let expr = self.parse_expr()?;
        if self.eat(&TokenKind::Assign) {
            let value = self.parse_expr()?;
            return Some(Statement::Assign {
                target: expr,
                value,
                location,
            });
        }
        Some(Statement::Expr { expr })
    }

    fn parse_let(&mut self, location: SourceLocation) -> Option<Statement> {
        self.expect(&TokenKind::Let, "`let`");
        let name = self.expect_ident("variable name")?;
        let ty = if self.eat(&TokenKind::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };
        self.expect(&TokenKind::Assign, "`=` in `let` statement");
        let value = self.parse_expr()?;
        Some(Statement::Let {
            name,
            ty,
            value,
            location,
        })
    }

    fn parse_if(&mut self, location: SourceLocation) -> Option<Statement> {
        self.expect(&TokenKind::If, "`if`");
        self.expect(&TokenKind::LParen, "`(` after `if`");
        let condition = self.parse_expr()?;
        self.expect(&TokenKind::RParen, "`)` after condition");
        let then_branch = self.parse_block()?;
        let else_branch = if self.eat(&TokenKind::Else) {
            if self.check(&TokenKind::If) {
                // `else if` chains become a nested block
                let loc = self.here();
                let nested = self.parse_if(loc)?;
                Some(Block {
                    statements: vec![nested],
                })
            } else {
                Some(self.parse_block()?)
            }
        } else {
            None
        };
        Some(Statement::If {
            condition,
            then_branch,
            else_branch,
            location,
        })
    }

    // ------------------------------------------------------------------
    // Expressions (precedence climbing)
    // ------------------------------------------------------------------

    fn parse_expr(&mut self) -> Option<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_and()?;
        while self.check(&TokenKind::OrOr) {
            let loc = self.here();
            self.advance();
            let rhs = self.parse_and()?;
            lhs = binary(BinOp::Or, lhs, rhs, loc);
        }
        Some(lhs)
    }

    fn parse_and(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_equality()?;
        while self.check(&TokenKind::AndAnd) {
            let loc = self.here();
            self.advance();
            let rhs = self.parse_equality()?;
            lhs = binary(BinOp::And, lhs, rhs, loc);
        }
        Some(lhs)
    }

    fn parse_equality(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::EqEq) => BinOp::Eq,
                Some(TokenKind::NotEq) => BinOp::Ne,
                _ => break,
            };
            let loc = self.here();
            self.advance();
            let rhs = self.parse_comparison()?;
            lhs = binary(op, lhs, rhs, loc);
        }
        Some(lhs)
    }

    fn parse_comparison(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_bitor()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Lt) => BinOp::Lt,
                Some(TokenKind::Gt) => BinOp::Gt,
                Some(TokenKind::Le) => BinOp::Le,
                Some(TokenKind::Ge) => BinOp::Ge,
                _ => break,
            };
            let loc = self.here();
            self.advance();
            let rhs = self.parse_bitor()?;
            lhs = binary(op, lhs, rhs, loc);
        }
        Some(lhs)
    }

    fn parse_bitor(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_bitxor()?;
        while self.check(&TokenKind::Pipe) {
            let loc = self.here();
            self.advance();
            let rhs = self.parse_bitxor()?;
            lhs = binary(BinOp::BitOr, lhs, rhs, loc);
        }
        Some(lhs)
    }

    fn parse_bitxor(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_bitand()?;
        while self.check(&TokenKind::Caret) {
            let loc = self.here();
            self.advance();
            let rhs = self.parse_bitand()?;
            lhs = binary(BinOp::BitXor, lhs, rhs, loc);
        }
        Some(lhs)
    }

    fn parse_bitand(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_shift()?;
        while self.check(&TokenKind::Amp) {
            let loc = self.here();
            self.advance();
            let rhs = self.parse_shift()?;
            lhs = binary(BinOp::BitAnd, lhs, rhs, loc);
        }
        Some(lhs)
    }

    fn parse_shift(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Shl) => BinOp::Shl,
                Some(TokenKind::Shr) => BinOp::Shr,
                _ => break,
            };
            let loc = self.here();
            self.advance();
            let rhs = self.parse_additive()?;
            lhs = binary(op, lhs, rhs, loc);
        }
        Some(lhs)
    }

    fn parse_additive(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Plus) => BinOp::Add,
                Some(TokenKind::Minus) => BinOp::Sub,
                _ => break,
            };
            let loc = self.here();
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = binary(op, lhs, rhs, loc);
        }
        Some(lhs)
    }

    fn parse_multiplicative(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Star) => BinOp::Mul,
                Some(TokenKind::Slash) => BinOp::Div,
                Some(TokenKind::Percent) => BinOp::Mod,
                _ => break,
            };
            let loc = self.here();
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = binary(op, lhs, rhs, loc);
        }
        Some(lhs)
    }

    fn parse_unary(&mut self) -> Option<Expr> {
        let loc = self.here();
        let op = match self.peek_kind() {
            Some(TokenKind::Bang) => Some(UnOp::Not),
            Some(TokenKind::Minus) => Some(UnOp::Neg),
            Some(TokenKind::Tilde) => Some(UnOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            return Some(Expr::new(
                ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                loc,
            ));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Option<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            let loc = self.here();
            if self.eat(&TokenKind::LBracket) {
                let first = self.parse_expr()?;
                if self.eat(&TokenKind::Colon) {
                    let end = self.parse_expr()?;
                    self.expect(&TokenKind::RBracket, "`]` closing slice");
                    expr = Expr::new(
                        ExprKind::Slice {
                            base: Box::new(expr),
                            start: Box::new(first),
                            end: Box::new(end),
                        },
                        loc,
                    );
                } else {
                    self.expect(&TokenKind::RBracket, "`]` closing index");
                    expr = Expr::new(
                        ExprKind::Index {
                            base: Box::new(expr),
                            index: Box::new(first),
                        },
                        loc,
                    );
                }
            } else if self.eat(&TokenKind::Dot) {
                let field = self.expect_ident("member name")?;
                // msg.* and block.* resolve to environment queries here so
                // the rest of the pipeline sees explicit markers.
                expr = match (&expr.kind, field.as_str()) {
                    (ExprKind::Ident(base), _) if base == "msg" || base == "block" => {
                        let env = match (base.as_str(), field.as_str()) {
                            ("msg", "sender") => Some(EnvField::MsgSender),
                            ("msg", "value") => Some(EnvField::MsgValue),
                            ("msg", "data") => Some(EnvField::MsgData),
                            ("block", "number") => Some(EnvField::BlockNumber),
                            ("block", "timestamp") => Some(EnvField::BlockTimestamp),
                            _ => None,
                        };
                        match env {
                            Some(env) => Expr::new(ExprKind::Env(env), loc),
                            None => {
                                self.diagnostics.push(
                                    Diagnostic::error(
                                        codes::UNKNOWN_MEMBER,
                                        format!("unknown builtin `{}.{}`", expr_name(&expr), field),
                                    )
                                    .at(loc),
                                );
                                return None;
                            }
                        }
                    }
                    _ => Expr::new(
                        ExprKind::Member {
                            base: Box::new(expr),
                            field,
                        },
                        loc,
                    ),
                };
            } else {
                break;
            }
        }
        Some(expr)
    }

    fn parse_primary(&mut self) -> Option<Expr> {
        let loc = self.here();
        let kind = self.peek_kind().cloned();
        match kind {
            Some(TokenKind::Number(n)) => {
                self.advance();
                Some(Expr::new(ExprKind::Number(n), loc))
            }
            Some(TokenKind::True) => {
                self.advance();
                Some(Expr::new(ExprKind::Bool(true), loc))
            }
            Some(TokenKind::False) => {
                self.advance();
                Some(Expr::new(ExprKind::Bool(false), loc))
            }
            Some(TokenKind::Str(s)) => {
                self.advance();
                Some(Expr::new(ExprKind::Str(s), loc))
            }
            Some(TokenKind::HexBytes(b)) => {
                self.advance();
                Some(Expr::new(ExprKind::HexBytes(b), loc))
            }
            Some(TokenKind::Ident(name)) => {
                self.advance();
                if self.eat(&TokenKind::LParen) {
                    let mut args = Vec::new();
                    if !self.check(&TokenKind::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if !self.eat(&TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(&TokenKind::RParen, "`)` closing call");
                    // Type-named callees are casts: uint128(x), address(x).
                    if let Some(target) = type_from_name(&name) {
                        if args.len() == 1 {
                            return Some(Expr::new(
                                ExprKind::Cast {
                                    target,
                                    operand: Box::new(args.remove(0)),
                                },
                                loc,
                            ));
                        }
                        self.diagnostics.push(
                            Diagnostic::error(
                                codes::BAD_BUILTIN,
                                format!("cast to `{}` takes exactly one argument", name),
                            )
                            .at(loc),
                        );
                        return None;
                    }
                    return Some(Expr::new(ExprKind::Call { callee: name, args }, loc));
                }
                Some(Expr::new(ExprKind::Ident(name), loc))
            }
            Some(TokenKind::LParen) => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(&TokenKind::RParen, "`)`");
                Some(inner)
            }
            _ => {
                self.error_here(codes::UNEXPECTED_TOKEN, "expected expression");
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Token helpers
    // ------------------------------------------------------------------

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == Some(kind)
    }

    fn advance(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Option<()> {
        if self.eat(kind) {
            Some(())
        } else {
            self.error_here(codes::UNEXPECTED_TOKEN, format!("expected {}", what));
            None
        }
    }

    /// Consume the `>` closing a mapping type. Nested mappings end with
    /// `>>`, which the lexer reads as a shift; split it into two `>`s and
    /// consume the first.
    fn expect_type_gt(&mut self) {
        match self.peek_kind() {
            Some(TokenKind::Gt) => {
                self.pos += 1;
            }
            Some(TokenKind::Shr) => {
                let token = &mut self.tokens[self.pos];
                token.kind = TokenKind::Gt;
                token.column += 1;
                token.length = 1;
            }
            _ => {
                self.error_here(codes::UNEXPECTED_TOKEN, "expected `>` closing mapping type");
            }
        }
    }

    fn expect_ident(&mut self, what: &str) -> Option<String> {
        match self.peek_kind() {
            Some(TokenKind::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Some(name)
            }
            _ => {
                self.error_here(codes::UNEXPECTED_TOKEN, format!("expected {}", what));
                None
            }
        }
    }

    fn here(&self) -> SourceLocation {
        match self.tokens.get(self.pos) {
            Some(t) => t.location(),
            None => self
                .tokens
                .last()
                .map(Token::location)
                .unwrap_or(SourceLocation::new(0, 0)),
        }
    }

    fn is_at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn error_here(&mut self, code: &'static str, message: impl Into<String>) {
        let loc = self.here();
        self.diagnostics
            .push(Diagnostic::error(code, message).at(loc));
    }

    /// Skip tokens until just past the next `;`, or until a `}` (left for
    /// the caller), so one syntax error doesn't cascade.
    fn recover_to_semi_or_brace(&mut self) {
        while let Some(kind) = self.peek_kind() {
            match kind {
                TokenKind::Semi => {
                    self.pos += 1;
                    return;
                }
                TokenKind::RBrace => return,
                _ => self.pos += 1,
            }
        }
    }
}

fn binary(op: BinOp, lhs: Expr, rhs: Expr, loc: SourceLocation) -> Expr {
    Expr::new(
        ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        loc,
    )
}

fn expr_name(expr: &Expr) -> &str {
    match &expr.kind {
        ExprKind::Ident(name) => name,
        _ => "<expr>",
    }
}

/// Builtin type names: `uint`/`uintN`, `int`/`intN`, `bytes`/`bytesN`,
/// `address`, `bool`, `string`.
fn type_from_name(name: &str) -> Option<TypeExpr> {
    match name {
        "address" => return Some(TypeExpr::Address),
        "bool" => return Some(TypeExpr::Bool),
        "string" => return Some(TypeExpr::String),
        "bytes" => return Some(TypeExpr::Bytes(None)),
        "uint" => return Some(TypeExpr::Uint(256)),
        "int" => return Some(TypeExpr::Int(256)),
        _ => {}
    }
    if let Some(bits) = name.strip_prefix("uint").and_then(|s| s.parse().ok()) {
        if valid_bits(bits) {
            return Some(TypeExpr::Uint(bits));
        }
    }
    if let Some(bits) = name.strip_prefix("int").and_then(|s| s.parse().ok()) {
        if valid_bits(bits) {
            return Some(TypeExpr::Int(bits));
        }
    }
    if let Some(n) = name.strip_prefix("bytes").and_then(|s| s.parse().ok()) {
        if (1..=32).contains(&n) {
            return Some(TypeExpr::Bytes(Some(n)));
        }
    }
    None
}

fn valid_bits(bits: u16) -> bool {
    bits >= 8 && bits <= 256 && bits % 8 == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;

    fn parse_ok(source: &str) -> Program {
        let (program, diags) = Parser::new(source).parse();
        assert!(diags.is_empty(), "unexpected diagnostics: {:?}", diags);
        program.expect("program should parse")
    }

    #[test]
    fn minimal_program() {
        let p = parse_ok("name X; code {}");
        assert_eq!(p.name, "X");
        assert!(p.code.is_some());
        assert!(p.code.unwrap().body.statements.is_empty());
    }

    #[test]
    fn storage_slots_in_order() {
        let p = parse_ok(
            "name T;\nstorage {\n  balances: mapping<address, uint256>;\n  owner: address;\n}\ncode {}",
        );
        assert_eq!(p.storage.len(), 2);
        assert_eq!(p.storage[0].slot, 0);
        assert_eq!(p.storage[0].name, "balances");
        assert_eq!(p.storage[1].slot, 1);
        assert!(matches!(p.storage[1].ty, TypeExpr::Address));
    }

    #[test]
    fn nested_mapping_type_splits_shift_token() {
        let p = parse_ok(
            "name T;\nstorage { allowance: mapping<address, mapping<address, uint256>>; }\ncode {}",
        );
        let TypeExpr::Mapping(_, value) = &p.storage[0].ty else {
            panic!("expected mapping type");
        };
        assert!(matches!(**value, TypeExpr::Mapping(_, _)));
    }

    #[test]
    fn let_and_return() {
        let p = parse_ok("name T; code -> uint256 { let x = 42; return x; }");
        let code = p.code.unwrap();
        assert!(matches!(code.returns, Some(TypeExpr::Uint(256))));
        assert_eq!(code.body.statements.len(), 2);
        match &code.body.statements[0] {
            Statement::Let { name, value, .. } => {
                assert_eq!(name, "x");
                assert!(matches!(value.kind, ExprKind::Number(n) if n == U256::from(42)));
            }
            other => panic!("expected let, got {:?}", other),
        }
    }

    #[test]
    fn precedence_mul_over_add() {
        let p = parse_ok("name T; code { let x = 1 + 2 * 3; }");
        let Statement::Let { value, .. } = &p.code.unwrap().body.statements[0] else {
            panic!()
        };
        let ExprKind::Binary { op: BinOp::Add, rhs, .. } = &value.kind else {
            panic!("expected + at the top")
        };
        assert!(matches!(
            rhs.kind,
            ExprKind::Binary { op: BinOp::Mul, .. }
        ));
    }

    #[test]
    fn env_fields_resolved() {
        let p = parse_ok("name T; code { balances[msg.sender] = msg.value; }");
        let Statement::Assign { target, value, .. } = &p.code.unwrap().body.statements[0] else {
            panic!()
        };
        let ExprKind::Index { index, .. } = &target.kind else {
            panic!()
        };
        assert!(matches!(index.kind, ExprKind::Env(EnvField::MsgSender)));
        assert!(matches!(value.kind, ExprKind::Env(EnvField::MsgValue)));
    }

    #[test]
    fn if_else_chain() {
        let p = parse_ok("name T; code { if (1) { } else if (2) { } else { } }");
        let Statement::If { else_branch, .. } = &p.code.unwrap().body.statements[0] else {
            panic!()
        };
        let nested = else_branch.as_ref().unwrap();
        assert!(matches!(nested.statements[0], Statement::If { .. }));
    }

    #[test]
    fn for_loop_header() {
        let p = parse_ok("name T; code { for (let i = 0; i < 10; i = i + 1) { } }");
        assert!(matches!(
            p.code.unwrap().body.statements[0],
            Statement::For { .. }
        ));
    }

    #[test]
    fn slice_and_index() {
        let p = parse_ok("name T; code { let a = b[1]; let c = d[1:3]; }");
        let stmts = p.code.unwrap().body.statements;
        let Statement::Let { value, .. } = &stmts[0] else {
            panic!()
        };
        assert!(matches!(value.kind, ExprKind::Index { .. }));
        let Statement::Let { value, .. } = &stmts[1] else {
            panic!()
        };
        assert!(matches!(value.kind, ExprKind::Slice { .. }));
    }

    #[test]
    fn casts_parse_as_cast_nodes() {
        let p = parse_ok("name T; code { let a = uint128(x); let b = address(y); }");
        let stmts = p.code.unwrap().body.statements;
        let Statement::Let { value, .. } = &stmts[0] else {
            panic!()
        };
        assert!(matches!(
            value.kind,
            ExprKind::Cast {
                target: TypeExpr::Uint(128),
                ..
            }
        ));
    }

    #[test]
    fn keccak_call() {
        let p = parse_ok("name T; code { let h = keccak256(x); }");
        let Statement::Let { value, .. } = &p.code.unwrap().body.statements[0] else {
            panic!()
        };
        let ExprKind::Call { callee, args } = &value.kind else {
            panic!()
        };
        assert_eq!(callee, "keccak256");
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn error_recovery_surfaces_multiple() {
        let (program, diags) = Parser::new("name T; code { let = 1; let y = 2; }").parse();
        assert!(program.is_some());
        assert!(!diags.is_empty());
        // The second statement still parses.
        let p = program.unwrap();
        assert!(p
            .code
            .unwrap()
            .body
            .statements
            .iter()
            .any(|s| matches!(s, Statement::Let { name, .. } if name == "y")));
    }

    #[test]
    fn missing_name_is_fatal() {
        let (program, diags) = Parser::new("code {}").parse();
        assert!(program.is_none());
        assert_eq!(diags[0].code, codes::EXPECTED_DECLARATION);
    }
}
