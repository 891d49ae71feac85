//! Recursive-descent parser. Reports the first error encountered, with
//! path/line/column, and bounds expression and block nesting so hostile
//! input cannot exhaust the native stack during compilation.

use crate::ast::{BinOp, Expr, ExprKind, Stmt, UnOp};
use crate::error::SyntaxError;
use crate::lexer::{Lexer, Tok, Token};

const MAX_NESTING: u32 = 128;

pub fn parse(path: &str, text: &str) -> Result<Vec<Stmt>, SyntaxError> {
    let tokens = Lexer::new(path, text).tokenize()?;
    Parser {
        path,
        tokens,
        pos: 0,
        depth: 0,
    }
    .program()
}

struct Parser<'a> {
    path: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    depth: u32,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek2(&self) -> &Tok {
        let i = (self.pos + 1).min(self.tokens.len() - 1);
        &self.tokens[i].tok
    }

    fn bump(&mut self) -> Token {
        let t = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn error(&self, token: &Token, message: impl Into<String>) -> SyntaxError {
        SyntaxError {
            path: self.path.to_string(),
            line: token.line,
            column: token.col,
            message: message.into(),
        }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<Token, SyntaxError> {
        if self.peek().tok == tok {
            Ok(self.bump())
        } else {
            let t = self.peek().clone();
            Err(self.error(&t, format!("expected {}, found {:?}", what, t.tok)))
        }
    }

    fn skip_separators(&mut self) {
        while self.peek().tok == Tok::Newline {
            self.bump();
        }
    }

    /// Newline or `then`/`do` after a condition.
    fn expect_body_start(&mut self, soft: Tok) -> Result<(), SyntaxError> {
        if self.peek().tok == soft {
            self.bump();
        }
        self.skip_separators();
        Ok(())
    }

    fn enter(&mut self, token: &Token) -> Result<(), SyntaxError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error(token, "nesting is too deep"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    // ---- grammar ----

    fn program(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        let body = self.stmt_list(&[Tok::Eof])?;
        self.expect(Tok::Eof, "end of input")?;
        Ok(body)
    }

    /// Parse statements until one of `until` is the current token.
    fn stmt_list(&mut self, until: &[Tok]) -> Result<Vec<Stmt>, SyntaxError> {
        let mut body = Vec::new();
        loop {
            self.skip_separators();
            if until.contains(&self.peek().tok) {
                return Ok(body);
            }
            body.push(self.stmt()?);
            match &self.peek().tok {
                Tok::Newline => {
                    self.bump();
                }
                tok if until.contains(tok) => return Ok(body),
                _ => {
                    let t = self.peek().clone();
                    return Err(self.error(&t, format!("unexpected {:?}", t.tok)));
                }
            }
        }
    }

    fn stmt(&mut self) -> Result<Stmt, SyntaxError> {
        let token = self.peek().clone();
        match token.tok {
            // Block statements recurse through stmt_list, so they count
            // against the same depth budget as expressions.
            Tok::KwIf => {
                self.enter(&token)?;
                let result = self.if_stmt();
                self.leave();
                result
            }
            Tok::KwWhile => {
                self.enter(&token)?;
                let result = self.while_stmt();
                self.leave();
                result
            }
            Tok::KwDef => {
                self.enter(&token)?;
                let result = self.def_stmt();
                self.leave();
                result
            }
            Tok::KwReturn => {
                self.bump();
                let value = if matches!(self.peek().tok, Tok::Newline | Tok::KwEnd | Tok::Eof) {
                    None
                } else {
                    Some(self.expr()?)
                };
                Ok(Stmt::Return {
                    value,
                    line: token.line,
                    col: token.col,
                })
            }
            Tok::KwRaise => {
                self.bump();
                let value = self.expr()?;
                Ok(Stmt::Raise {
                    value,
                    line: token.line,
                    col: token.col,
                })
            }
            Tok::KwBreak => {
                self.bump();
                Ok(Stmt::Break {
                    line: token.line,
                    col: token.col,
                })
            }
            _ => Ok(Stmt::Expr(self.expr()?)),
        }
    }

    fn if_stmt(&mut self) -> Result<Stmt, SyntaxError> {
        self.expect(Tok::KwIf, "'if'")?;
        let mut arms = Vec::new();
        let cond = self.expr()?;
        self.expect_body_start(Tok::KwThen)?;
        let body = self.stmt_list(&[Tok::KwElsif, Tok::KwElse, Tok::KwEnd])?;
        arms.push((cond, body));
        let mut else_body = None;
        loop {
            match self.peek().tok {
                Tok::KwElsif => {
                    self.bump();
                    let cond = self.expr()?;
                    self.expect_body_start(Tok::KwThen)?;
                    let body = self.stmt_list(&[Tok::KwElsif, Tok::KwElse, Tok::KwEnd])?;
                    arms.push((cond, body));
                }
                Tok::KwElse => {
                    self.bump();
                    self.skip_separators();
                    else_body = Some(self.stmt_list(&[Tok::KwEnd])?);
                    break;
                }
                _ => break,
            }
        }
        self.expect(Tok::KwEnd, "'end'")?;
        Ok(Stmt::If { arms, else_body })
    }

    fn while_stmt(&mut self) -> Result<Stmt, SyntaxError> {
        self.expect(Tok::KwWhile, "'while'")?;
        let cond = self.expr()?;
        self.expect_body_start(Tok::KwDo)?;
        let body = self.stmt_list(&[Tok::KwEnd])?;
        self.expect(Tok::KwEnd, "'end'")?;
        Ok(Stmt::While { cond, body })
    }

    fn def_stmt(&mut self) -> Result<Stmt, SyntaxError> {
        let def_token = self.expect(Tok::KwDef, "'def'")?;
        let name = match self.bump() {
            Token {
                tok: Tok::Ident(name),
                ..
            } => name,
            t => return Err(self.error(&t, "expected method name after 'def'")),
        };
        let mut params = Vec::new();
        if self.peek().tok == Tok::LParen {
            self.bump();
            if self.peek().tok != Tok::RParen {
                loop {
                    match self.bump() {
                        Token {
                            tok: Tok::Ident(p), ..
                        } => params.push(p),
                        t => return Err(self.error(&t, "expected parameter name")),
                    }
                    if self.peek().tok == Tok::Comma {
                        self.bump();
                    } else {
                        break;
                    }
                }
            }
            self.expect(Tok::RParen, "')'")?;
        }
        self.skip_separators();
        let body = self.stmt_list(&[Tok::KwEnd])?;
        self.expect(Tok::KwEnd, "'end'")?;
        Ok(Stmt::Def {
            name,
            params,
            body,
            line: def_token.line,
            col: def_token.col,
        })
    }

    fn expr(&mut self) -> Result<Expr, SyntaxError> {
        let token = self.peek().clone();
        self.enter(&token)?;
        let result = self.assignment();
        self.leave();
        result
    }

    fn assignment(&mut self) -> Result<Expr, SyntaxError> {
        let token = self.peek().clone();
        match (&token.tok, self.peek2()) {
            (Tok::Ident(name), Tok::Assign) => {
                let name = name.clone();
                self.bump();
                self.bump();
                let value = self.expr()?;
                Ok(Expr {
                    kind: ExprKind::Assign(name, Box::new(value)),
                    line: token.line,
                    col: token.col,
                })
            }
            (Tok::Slot(name), Tok::Assign) => {
                let name = name.clone();
                self.bump();
                self.bump();
                let value = self.expr()?;
                Ok(Expr {
                    kind: ExprKind::SlotAssign(name, Box::new(value)),
                    line: token.line,
                    col: token.col,
                })
            }
            _ => self.or_expr(),
        }
    }

    fn or_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut lhs = self.and_expr()?;
        while self.peek().tok == Tok::OrOr {
            let op = self.bump();
            let rhs = self.and_expr()?;
            lhs = Expr {
                kind: ExprKind::Or(Box::new(lhs), Box::new(rhs)),
                line: op.line,
                col: op.col,
            };
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut lhs = self.equality()?;
        while self.peek().tok == Tok::AndAnd {
            let op = self.bump();
            let rhs = self.equality()?;
            lhs = Expr {
                kind: ExprKind::And(Box::new(lhs), Box::new(rhs)),
                line: op.line,
                col: op.col,
            };
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, SyntaxError> {
        let mut lhs = self.comparison()?;
        loop {
            let op = match self.peek().tok {
                Tok::EqEq => BinOp::Eq,
                Tok::NotEq => BinOp::Ne,
                _ => return Ok(lhs),
            };
            let token = self.bump();
            let rhs = self.comparison()?;
            lhs = binary(op, lhs, rhs, &token);
        }
    }

    fn comparison(&mut self) -> Result<Expr, SyntaxError> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek().tok {
                Tok::Lt => BinOp::Lt,
                Tok::Le => BinOp::Le,
                Tok::Gt => BinOp::Gt,
                Tok::Ge => BinOp::Ge,
                _ => return Ok(lhs),
            };
            let token = self.bump();
            let rhs = self.additive()?;
            lhs = binary(op, lhs, rhs, &token);
        }
    }

    fn additive(&mut self) -> Result<Expr, SyntaxError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek().tok {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => return Ok(lhs),
            };
            let token = self.bump();
            let rhs = self.multiplicative()?;
            lhs = binary(op, lhs, rhs, &token);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, SyntaxError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek().tok {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::Percent => BinOp::Mod,
                _ => return Ok(lhs),
            };
            let token = self.bump();
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs, &token);
        }
    }

    fn unary(&mut self) -> Result<Expr, SyntaxError> {
        let token = self.peek().clone();
        match token.tok {
            Tok::Minus => {
                self.bump();
                self.enter(&token)?;
                let operand = self.unary();
                self.leave();
                Ok(Expr {
                    kind: ExprKind::Unary(UnOp::Neg, Box::new(operand?)),
                    line: token.line,
                    col: token.col,
                })
            }
            Tok::Bang => {
                self.bump();
                self.enter(&token)?;
                let operand = self.unary();
                self.leave();
                Ok(Expr {
                    kind: ExprKind::Unary(UnOp::Not, Box::new(operand?)),
                    line: token.line,
                    col: token.col,
                })
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.primary()?;
        while self.peek().tok == Tok::LBracket {
            let token = self.bump();
            let index = self.expr()?;
            self.expect(Tok::RBracket, "']'")?;
            expr = Expr {
                kind: ExprKind::Index(Box::new(expr), Box::new(index)),
                line: token.line,
                col: token.col,
            };
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, SyntaxError> {
        let token = self.bump();
        let kind = match token.tok.clone() {
            Tok::KwNil => ExprKind::Nil,
            Tok::KwTrue => ExprKind::True,
            Tok::KwFalse => ExprKind::False,
            Tok::Int(i) => ExprKind::Int(i),
            Tok::Str(s) => ExprKind::Str(s),
            Tok::Sym(s) => ExprKind::Sym(s),
            Tok::Slot(name) => ExprKind::Slot(name),
            Tok::Ident(name) => {
                if self.peek().tok == Tok::LParen {
                    self.bump();
                    let args = self.arg_list(Tok::RParen)?;
                    ExprKind::Call(name, args)
                } else {
                    ExprKind::Local(name)
                }
            }
            Tok::LParen => {
                let inner = self.expr()?;
                self.expect(Tok::RParen, "')'")?;
                return Ok(inner);
            }
            Tok::LBracket => {
                self.enter(&token)?;
                let items = self.arg_list(Tok::RBracket);
                self.leave();
                ExprKind::Array(items?)
            }
            Tok::LBrace => {
                self.enter(&token)?;
                let pairs = self.map_body();
                self.leave();
                ExprKind::Map(pairs?)
            }
            tok => return Err(self.error(&token, format!("unexpected {:?}", tok))),
        };
        Ok(Expr {
            kind,
            line: token.line,
            col: token.col,
        })
    }

    fn arg_list(&mut self, close: Tok) -> Result<Vec<Expr>, SyntaxError> {
        let mut args = Vec::new();
        self.skip_separators();
        if self.peek().tok == close {
            self.bump();
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            self.skip_separators();
            if self.peek().tok == Tok::Comma {
                self.bump();
                self.skip_separators();
            } else {
                break;
            }
        }
        self.expect(close.clone(), "closing delimiter")?;
        Ok(args)
    }

    fn map_body(&mut self) -> Result<Vec<(Expr, Expr)>, SyntaxError> {
        let mut pairs = Vec::new();
        self.skip_separators();
        if self.peek().tok == Tok::RBrace {
            self.bump();
            return Ok(pairs);
        }
        loop {
            let key = self.expr()?;
            self.expect(Tok::FatArrow, "'=>'")?;
            let value = self.expr()?;
            pairs.push((key, value));
            self.skip_separators();
            if self.peek().tok == Tok::Comma {
                self.bump();
                self.skip_separators();
            } else {
                break;
            }
        }
        self.expect(Tok::RBrace, "'}'")?;
        Ok(pairs)
    }
}

fn binary(op: BinOp, lhs: Expr, rhs: Expr, token: &Token) -> Expr {
    Expr {
        kind: ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)),
        line: token.line,
        col: token.col,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_precedence() {
        let stmts = parse("test.rb", "1 + 2 * 3").unwrap();
        match &stmts[0] {
            Stmt::Expr(Expr {
                kind: ExprKind::Binary(BinOp::Add, _, rhs),
                ..
            }) => {
                assert!(matches!(rhs.kind, ExprKind::Binary(BinOp::Mul, _, _)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parses_control_flow() {
        let src = "x = 0\nwhile x < 10\n  x = x + 1\nend\nif x == 10 then x else 0 end";
        let stmts = parse("test.rb", src).unwrap();
        assert_eq!(stmts.len(), 3);
        assert!(matches!(stmts[1], Stmt::While { .. }));
        assert!(matches!(stmts[2], Stmt::If { .. }));
    }

    #[test]
    fn parses_def_and_call() {
        let src = "def add(a, b)\n  a + b\nend\nadd(1, 2)";
        let stmts = parse("test.rb", src).unwrap();
        assert!(matches!(&stmts[0], Stmt::Def { name, params, .. }
            if name == "add" && params.len() == 2));
        assert!(
            matches!(&stmts[1], Stmt::Expr(Expr { kind: ExprKind::Call(name, args), .. })
            if name == "add" && args.len() == 2)
        );
    }

    #[test]
    fn parses_collections() {
        let stmts = parse("test.rb", "@out = {:a => [1, 2], \"k\" => nil}").unwrap();
        assert!(matches!(&stmts[0], Stmt::Expr(Expr {
            kind: ExprKind::SlotAssign(name, _),
            ..
        }) if name == "out"));
    }

    #[test]
    fn first_error_is_reported_with_position() {
        let err = parse("bad.rb", "x = (1 +\n2").unwrap_err();
        assert_eq!(err.path, "bad.rb");
        assert!(err.line >= 1);
    }

    #[test]
    fn nesting_is_bounded() {
        let mut src = String::new();
        for _ in 0..300 {
            src.push('(');
        }
        src.push('1');
        for _ in 0..300 {
            src.push(')');
        }
        let err = parse("deep.rb", &src).unwrap_err();
        assert!(err.message.contains("nesting"));
    }

    #[test]
    fn block_nesting_is_bounded() {
        // Nested blocks recurse through the statement parser, so they must
        // hit the depth limit instead of the native stack.
        let mut src = String::new();
        for _ in 0..100_000 {
            src.push_str("if true\n");
        }
        src.push('1');
        for _ in 0..100_000 {
            src.push_str("\nend");
        }
        let err = parse("deep.rb", &src).unwrap_err();
        assert!(err.message.contains("nesting"));
    }
}
