//! Recursive-descent parser for the workspace description language.

use super::{
    ast::{BinaryOp, Expr, ExprKind, File, Stmt, UnaryOp},
    token::{lex, Spanned, Token},
};
use crate::error::{BuildError, Result, SourcePos};
use std::path::{Path, PathBuf};

/// Parses one workspace file.
pub fn parse_file(input: &str, file: &Path) -> Result<File> {
    let tokens = lex(input, file)?;
    let mut parser = Parser { tokens, index: 0, file: file.to_path_buf() };
    let mut items = Vec::new();
    while !parser.at(&Token::Eof) {
        items.push(parser.statement()?);
    }
    Ok(File { items })
}

struct Parser {
    tokens: Vec<Spanned>,
    index: usize,
    file: PathBuf,
}

impl Parser {
    fn current(&self) -> &Spanned {
        &self.tokens[self.index.min(self.tokens.len() - 1)]
    }

    fn pos(&self) -> SourcePos {
        self.current().pos
    }

    fn at(&self, token: &Token) -> bool {
        &self.current().token == token
    }

    fn bump(&mut self) -> Spanned {
        let spanned = self.current().clone();
        if self.index < self.tokens.len() - 1 {
            self.index += 1;
        }
        spanned
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.at(token) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<Spanned> {
        if self.at(&token) {
            Ok(self.bump())
        } else {
            Err(self.error(format!("expected {token}, found {}", self.current().token)))
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match &self.current().token {
            Token::Ident(name) => {
                let name = name.clone();
                self.bump();
                Ok(name)
            }
            other => Err(self.error(format!("expected identifier, found {other}"))),
        }
    }

    fn error(&self, message: impl Into<String>) -> BuildError {
        BuildError::Syntax { file: self.file.clone(), pos: self.pos(), message: message.into() }
    }

    // ---- statements ----

    fn statement(&mut self) -> Result<Stmt> {
        match &self.current().token {
            Token::Target => self.target_decl(),
            Token::Let | Token::Const => self.let_stmt(),
            Token::Fn | Token::Macro => self.func_stmt(),
            Token::If => self.if_stmt(),
            Token::For => self.for_stmt(),
            Token::Return => {
                let pos = self.pos();
                self.bump();
                let value =
                    if self.at(&Token::Semi) { None } else { Some(self.expr()?) };
                self.eat(&Token::Semi);
                Ok(Stmt::Return { value, pos })
            }
            Token::Ident(name) if self.peek_is(&Token::Assign) => {
                let pos = self.pos();
                let name = name.clone();
                self.bump();
                self.bump();
                let value = self.expr()?;
                self.eat(&Token::Semi);
                Ok(Stmt::Assign { name, value, pos })
            }
            _ => {
                let expr = self.expr()?;
                self.eat(&Token::Semi);
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn peek_is(&self, token: &Token) -> bool {
        self.tokens.get(self.index + 1).map(|s| &s.token == token).unwrap_or(false)
    }

    fn target_decl(&mut self) -> Result<Stmt> {
        let pos = self.pos();
        self.bump();
        self.expect(Token::LParen)?;
        let name = self.expr()?;
        self.expect(Token::RParen)?;
        self.expect(Token::LBrace)?;
        let mut fields = Vec::new();
        while !self.eat(&Token::RBrace) {
            let field = self.expect_ident()?;
            self.expect(Token::Colon)?;
            let value = self.expr()?;
            self.eat(&Token::Semi);
            fields.push((field, value));
        }
        Ok(Stmt::Target { name, fields, pos })
    }

    fn let_stmt(&mut self) -> Result<Stmt> {
        let mutable = self.at(&Token::Let);
        self.bump();
        let name = self.expect_ident()?;
        self.expect(Token::Assign)?;
        let value = self.expr()?;
        self.eat(&Token::Semi);
        Ok(Stmt::Let { name, value, mutable })
    }

    fn func_stmt(&mut self) -> Result<Stmt> {
        let is_macro = self.at(&Token::Macro);
        self.bump();
        let name = self.expect_ident()?;
        self.expect(Token::LParen)?;
        let params = self.param_list(&Token::RParen)?;
        let body = self.block()?;
        Ok(Stmt::Func { name, params, body, is_macro })
    }

    fn if_stmt(&mut self) -> Result<Stmt> {
        self.bump();
        let cond = self.expr()?;
        let then = self.block()?;
        let otherwise = if self.eat(&Token::Else) {
            if self.at(&Token::If) {
                vec![self.if_stmt()?]
            } else {
                self.block()?
            }
        } else {
            Vec::new()
        };
        Ok(Stmt::If { cond, then, otherwise })
    }

    fn for_stmt(&mut self) -> Result<Stmt> {
        self.bump();
        let var = self.expect_ident()?;
        self.expect(Token::In)?;
        let iter = self.expr()?;
        let body = self.block()?;
        Ok(Stmt::For { var, iter, body })
    }

    fn block(&mut self) -> Result<Vec<Stmt>> {
        self.expect(Token::LBrace)?;
        let mut stmts = Vec::new();
        while !self.eat(&Token::RBrace) {
            if self.at(&Token::Eof) {
                return Err(self.error("unclosed block"));
            }
            stmts.push(self.statement()?);
        }
        Ok(stmts)
    }

    fn param_list(&mut self, close: &Token) -> Result<Vec<String>> {
        let mut params = Vec::new();
        if self.eat(close) {
            return Ok(params);
        }
        loop {
            params.push(self.expect_ident()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(close.clone())?;
        Ok(params)
    }

    // ---- expressions ----

    fn expr(&mut self) -> Result<Expr> {
        self.ternary()
    }

    fn ternary(&mut self) -> Result<Expr> {
        let cond = self.binary(0)?;
        if self.eat(&Token::Question) {
            let pos = cond.pos;
            let then = self.expr()?;
            self.expect(Token::Colon)?;
            let otherwise = self.expr()?;
            return Ok(Expr {
                kind: ExprKind::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise)),
                pos,
            });
        }
        Ok(cond)
    }

    fn binary(&mut self, min_prec: u8) -> Result<Expr> {
        let mut lhs = self.unary()?;
        while let Some(op) = self.binary_op() {
            let prec = op.precedence();
            if prec <= min_prec {
                break;
            }
            self.bump();
            let rhs = self.binary(prec)?;
            let pos = lhs.pos;
            lhs = Expr { kind: ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)), pos };
        }
        Ok(lhs)
    }

    fn binary_op(&self) -> Option<BinaryOp> {
        Some(match self.current().token {
            Token::OrOr => BinaryOp::Or,
            Token::AndAnd => BinaryOp::And,
            Token::Eq => BinaryOp::Eq,
            Token::NotEq => BinaryOp::NotEq,
            Token::Lt => BinaryOp::Lt,
            Token::LtEq => BinaryOp::LtEq,
            Token::Gt => BinaryOp::Gt,
            Token::GtEq => BinaryOp::GtEq,
            Token::Plus => BinaryOp::Add,
            Token::Minus => BinaryOp::Sub,
            Token::Star => BinaryOp::Mul,
            Token::Slash => BinaryOp::Div,
            Token::Percent => BinaryOp::Rem,
            _ => return None,
        })
    }

    fn unary(&mut self) -> Result<Expr> {
        let pos = self.pos();
        if self.eat(&Token::Minus) {
            let operand = self.unary()?;
            return Ok(Expr { kind: ExprKind::Unary(UnaryOp::Neg, Box::new(operand)), pos });
        }
        if self.eat(&Token::Not) {
            let operand = self.unary()?;
            return Ok(Expr { kind: ExprKind::Unary(UnaryOp::Not, Box::new(operand)), pos });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            let pos = expr.pos;
            if self.eat(&Token::LParen) {
                let mut args = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.expr()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(Token::RParen)?;
                }
                expr = Expr { kind: ExprKind::Call { callee: Box::new(expr), args }, pos };
            } else if self.eat(&Token::LBracket) {
                let index = self.expr()?;
                self.expect(Token::RBracket)?;
                expr = Expr {
                    kind: ExprKind::Index { base: Box::new(expr), index: Box::new(index) },
                    pos,
                };
            } else if self.eat(&Token::Dot) {
                let field = self.expect_ident()?;
                expr = Expr { kind: ExprKind::Member { base: Box::new(expr), field }, pos };
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        let pos = self.pos();
        let kind = match self.current().token.clone() {
            Token::Null => {
                self.bump();
                ExprKind::Null
            }
            Token::True => {
                self.bump();
                ExprKind::Bool(true)
            }
            Token::False => {
                self.bump();
                ExprKind::Bool(false)
            }
            Token::Int(value) => {
                self.bump();
                ExprKind::Int(value)
            }
            Token::Float(value) => {
                self.bump();
                ExprKind::Float(value)
            }
            Token::Str(value) => {
                self.bump();
                ExprKind::Str(value)
            }
            Token::Ident(name) => {
                self.bump();
                ExprKind::Ident(name)
            }
            Token::LParen => {
                self.bump();
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                return Ok(inner);
            }
            Token::LBracket => {
                self.bump();
                let mut items = Vec::new();
                while !self.eat(&Token::RBracket) {
                    items.push(self.expr()?);
                    if !self.eat(&Token::Comma) {
                        self.expect(Token::RBracket)?;
                        break;
                    }
                }
                ExprKind::Array(items)
            }
            Token::LBrace => {
                self.bump();
                let mut entries = Vec::new();
                while !self.eat(&Token::RBrace) {
                    let key = match self.current().token.clone() {
                        Token::Ident(key) => {
                            self.bump();
                            key
                        }
                        Token::Str(key) => {
                            self.bump();
                            key
                        }
                        other => {
                            return Err(
                                self.error(format!("expected map key, found {other}"))
                            )
                        }
                    };
                    self.expect(Token::Colon)?;
                    entries.push((key, self.expr()?));
                    if !self.eat(&Token::Comma) {
                        self.expect(Token::RBrace)?;
                        break;
                    }
                }
                ExprKind::Map(entries)
            }
            Token::Pipe => {
                self.bump();
                let params = self.param_list(&Token::Pipe)?;
                let body = self.expr()?;
                ExprKind::Lambda { params, body: Box::new(body) }
            }
            // `||` lexes as one token, so a parameterless lambda shows up here
            Token::OrOr => {
                self.bump();
                let body = self.expr()?;
                ExprKind::Lambda { params: Vec::new(), body: Box::new(body) }
            }
            other => return Err(self.error(format!("expected expression, found {other}"))),
        };
        Ok(Expr { kind, pos })
    }
}
