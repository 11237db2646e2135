//! Recursive-descent parser: tokens to [`MethodAst`], one precedence tier
//! per function.

use crate::ast::{Block, Expr, Literal, Message, MethodAst, Statement};
use crate::compiler::CompileError;
use crate::lexer::{Token, TokenKind, tokenize};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn peek_at(&self, ahead: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos + ahead).map(|t| &t.kind)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |t| t.line)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == Some(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<(), CompileError> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn error(&self, msg: impl Into<String>) -> CompileError {
        CompileError::Syntax {
            line: self.line(),
            msg: msg.into(),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    // ── method structure ──────────────────────────────────────────────

    /// `selector-pattern [| temps |] statements`
    pub fn parse_method(&mut self) -> Result<MethodAst, CompileError> {
        let (selector, parameters) = self.parse_pattern()?;
        let temporaries = self.parse_temporaries()?;
        let body = self.parse_statements(true)?;
        if !self.at_end() {
            return Err(self.error("text after method body"));
        }
        Ok(MethodAst {
            selector,
            parameters,
            temporaries,
            body,
        })
    }

    /// A bare body (temporaries + statements) wrapped as `selector`.
    pub fn parse_body(&mut self, selector: &str) -> Result<MethodAst, CompileError> {
        let temporaries = self.parse_temporaries()?;
        let body = self.parse_statements(true)?;
        if !self.at_end() {
            return Err(self.error("text after statements"));
        }
        Ok(MethodAst {
            selector: selector.to_string(),
            parameters: Vec::new(),
            temporaries,
            body,
        })
    }

    fn parse_pattern(&mut self) -> Result<(String, Vec<String>), CompileError> {
        match self.advance().map(|t| t.kind) {
            Some(TokenKind::Name(sel)) => Ok((sel, Vec::new())),
            Some(TokenKind::Binary(sel)) => {
                let arg = self.expect_name("binary pattern argument")?;
                Ok((sel, vec![arg]))
            }
            Some(TokenKind::Keyword(first)) => {
                let mut selector = first;
                let mut params = vec![self.expect_name("keyword pattern argument")?];
                while let Some(TokenKind::Keyword(k)) = self.peek() {
                    selector.push_str(&k.clone());
                    self.pos += 1;
                    params.push(self.expect_name("keyword pattern argument")?);
                }
                Ok((selector, params))
            }
            _ => Err(self.error("expected method pattern")),
        }
    }

    fn expect_name(&mut self, what: &str) -> Result<String, CompileError> {
        match self.peek() {
            Some(TokenKind::Name(n)) => {
                let n = n.clone();
                self.pos += 1;
                Ok(n)
            }
            _ => Err(self.error(format!("expected {what}"))),
        }
    }

    fn parse_temporaries(&mut self) -> Result<Vec<String>, CompileError> {
        let mut temps = Vec::new();
        if self.eat(&TokenKind::Bar) {
            while let Some(TokenKind::Name(n)) = self.peek() {
                temps.push(n.clone());
                self.pos += 1;
            }
            self.expect(&TokenKind::Bar, "| after temporaries")?;
        }
        Ok(temps)
    }

    /// Statements up to end of input or the closing `]` of a block.
    fn parse_statements(&mut self, top: bool) -> Result<Vec<Statement>, CompileError> {
        let mut out = Vec::new();
        loop {
            if self.at_end() {
                if top {
                    return Ok(out);
                }
                return Err(self.error("unterminated block"));
            }
            if !top && self.peek() == Some(&TokenKind::RBracket) {
                return Ok(out);
            }
            let line = self.line();
            if self.eat(&TokenKind::Caret) {
                let value = self.parse_expression()?;
                out.push(Statement::Return { value, line });
            } else {
                out.push(Statement::Expr(self.parse_expression()?));
            }
            if !self.eat(&TokenKind::Period) {
                if self.at_end() {
                    if top {
                        return Ok(out);
                    }
                    return Err(self.error("unterminated block"));
                }
                if !top && self.peek() == Some(&TokenKind::RBracket) {
                    return Ok(out);
                }
                return Err(self.error("expected . between statements"));
            }
        }
    }

    // ── expressions, one tier per level ───────────────────────────────

    pub fn parse_expression(&mut self) -> Result<Expr, CompileError> {
        if let (Some(TokenKind::Name(n)), Some(TokenKind::Assign)) =
            (self.peek(), self.peek_at(1))
        {
            let name = n.clone();
            let line = self.line();
            self.pos += 2;
            let value = Box::new(self.parse_expression()?);
            return Ok(Expr::Assign { name, value, line });
        }
        let expr = self.parse_keyword_level()?;
        if self.peek() != Some(&TokenKind::Semi) {
            return Ok(expr);
        }
        // Cascade: peel the outermost message off as the first part.
        let (receiver, first) = split_message(expr)
            .ok_or_else(|| self.error("cascade requires a message to repeat"))?;
        let mut messages = vec![first];
        while self.eat(&TokenKind::Semi) {
            messages.push(self.parse_cascade_message()?);
        }
        Ok(Expr::Cascade {
            receiver: Box::new(receiver),
            messages,
        })
    }

    fn parse_cascade_message(&mut self) -> Result<Message, CompileError> {
        let line = self.line();
        match self.peek().cloned() {
            Some(TokenKind::Keyword(_)) => {
                let (selector, arguments) = self.parse_keyword_tail()?;
                Ok(Message {
                    selector,
                    arguments,
                    line,
                })
            }
            Some(TokenKind::Binary(op)) => {
                self.pos += 1;
                let arg = self.parse_unary_level()?;
                Ok(Message {
                    selector: op,
                    arguments: vec![arg],
                    line,
                })
            }
            Some(TokenKind::Name(sel)) => {
                self.pos += 1;
                Ok(Message {
                    selector: sel,
                    arguments: Vec::new(),
                    line,
                })
            }
            _ => Err(self.error("expected message after ;")),
        }
    }

    fn parse_keyword_level(&mut self) -> Result<Expr, CompileError> {
        let receiver = self.parse_binary_level()?;
        if !matches!(self.peek(), Some(TokenKind::Keyword(_))) {
            return Ok(receiver);
        }
        let line = self.line();
        let (selector, arguments) = self.parse_keyword_tail()?;
        Ok(Expr::Keyword {
            receiver: Box::new(receiver),
            selector,
            arguments,
            line,
        })
    }

    fn parse_keyword_tail(&mut self) -> Result<(String, Vec<Expr>), CompileError> {
        let mut selector = String::new();
        let mut arguments = Vec::new();
        while let Some(TokenKind::Keyword(k)) = self.peek() {
            selector.push_str(&k.clone());
            self.pos += 1;
            arguments.push(self.parse_binary_level()?);
        }
        Ok((selector, arguments))
    }

    fn parse_binary_level(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_unary_level()?;
        while let Some(TokenKind::Binary(op)) = self.peek() {
            let selector = op.clone();
            let line = self.line();
            self.pos += 1;
            let argument = self.parse_unary_level()?;
            left = Expr::Binary {
                receiver: Box::new(left),
                selector,
                argument: Box::new(argument),
                line,
            };
        }
        Ok(left)
    }

    fn parse_unary_level(&mut self) -> Result<Expr, CompileError> {
        let mut receiver = self.parse_primary()?;
        while let Some(TokenKind::Name(sel)) = self.peek() {
            let selector = sel.clone();
            let line = self.line();
            self.pos += 1;
            receiver = Expr::Unary {
                receiver: Box::new(receiver),
                selector,
                line,
            };
        }
        Ok(receiver)
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let line = self.line();
        let Some(kind) = self.peek().cloned() else {
            return Err(self.error("unexpected end of method"));
        };
        match kind {
            TokenKind::Name(n) => {
                self.pos += 1;
                Ok(Expr::Name { name: n, line })
            }
            TokenKind::Int(v) => {
                self.pos += 1;
                Ok(Expr::Literal {
                    value: Literal::Int(v),
                    line,
                })
            }
            TokenKind::Float(v) => {
                self.pos += 1;
                Ok(Expr::Literal {
                    value: Literal::Float(v),
                    line,
                })
            }
            TokenKind::Char(c) => {
                self.pos += 1;
                Ok(Expr::Literal {
                    value: Literal::Char(c),
                    line,
                })
            }
            TokenKind::Str(s) => {
                self.pos += 1;
                Ok(Expr::Literal {
                    value: Literal::Str(s),
                    line,
                })
            }
            TokenKind::Sym(s) => {
                self.pos += 1;
                Ok(Expr::Literal {
                    value: Literal::Sym(s),
                    line,
                })
            }
            TokenKind::ArrayBegin => {
                self.pos += 1;
                let value = Literal::Array(self.parse_literal_array()?);
                Ok(Expr::Literal { value, line })
            }
            TokenKind::LParen => {
                self.pos += 1;
                let e = self.parse_expression()?;
                self.expect(&TokenKind::RParen, ")")?;
                Ok(e)
            }
            TokenKind::LBracket => {
                self.pos += 1;
                self.parse_block(line)
            }
            TokenKind::Binary(op) if op == "-" => {
                // Negative literal.
                self.pos += 1;
                match self.peek().cloned() {
                    Some(TokenKind::Int(v)) => {
                        self.pos += 1;
                        Ok(Expr::Literal {
                            value: Literal::Int(-v),
                            line,
                        })
                    }
                    Some(TokenKind::Float(v)) => {
                        self.pos += 1;
                        Ok(Expr::Literal {
                            value: Literal::Float(-v),
                            line,
                        })
                    }
                    _ => Err(self.error("expected number after -")),
                }
            }
            TokenKind::Binary(op) if op == "<" => {
                self.pos += 1;
                self.parse_primitive(line)
            }
            _ => Err(self.error("expected expression")),
        }
    }

    /// `<number arg...>` with bare terms as arguments, closed by `>`.
    fn parse_primitive(&mut self, line: usize) -> Result<Expr, CompileError> {
        let number = match self.advance().map(|t| t.kind) {
            Some(TokenKind::Int(v)) if (0..=255).contains(&v) => v as u8,
            _ => return Err(self.error("expected primitive number")),
        };
        let mut arguments = Vec::new();
        loop {
            match self.peek() {
                Some(TokenKind::Binary(op)) if op == ">" => {
                    self.pos += 1;
                    return Ok(Expr::Primitive {
                        number,
                        arguments,
                        line,
                    });
                }
                // Arguments are bare terms so `<17 self x>` stays three
                // tokens rather than a unary send.
                Some(_) => arguments.push(self.parse_primary()?),
                None => return Err(self.error("unterminated primitive")),
            }
        }
    }

    fn parse_block(&mut self, line: usize) -> Result<Expr, CompileError> {
        let mut parameters = Vec::new();
        while self.eat(&TokenKind::Colon) {
            parameters.push(self.expect_name("block argument")?);
        }
        if !parameters.is_empty() {
            self.expect(&TokenKind::Bar, "| after block arguments")?;
        }
        let body = self.parse_statements(false)?;
        self.expect(&TokenKind::RBracket, "]")?;
        Ok(Expr::Block(Block {
            parameters,
            body,
            line,
        }))
    }

    fn parse_literal_array(&mut self) -> Result<Vec<Literal>, CompileError> {
        let mut out = Vec::new();
        loop {
            match self.peek().cloned() {
                Some(TokenKind::RParen) => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(TokenKind::Int(v)) => {
                    self.pos += 1;
                    out.push(Literal::Int(v));
                }
                Some(TokenKind::Float(v)) => {
                    self.pos += 1;
                    out.push(Literal::Float(v));
                }
                Some(TokenKind::Binary(op)) if op == "-" => {
                    self.pos += 1;
                    match self.advance().map(|t| t.kind) {
                        Some(TokenKind::Int(v)) => out.push(Literal::Int(-v)),
                        Some(TokenKind::Float(v)) => out.push(Literal::Float(-v)),
                        _ => return Err(self.error("expected number after - in array")),
                    }
                }
                Some(TokenKind::Char(c)) => {
                    self.pos += 1;
                    out.push(Literal::Char(c));
                }
                Some(TokenKind::Str(s)) => {
                    self.pos += 1;
                    out.push(Literal::Str(s));
                }
                Some(TokenKind::Sym(s)) => {
                    self.pos += 1;
                    out.push(Literal::Sym(s));
                }
                // Bare names and keywords inside literal arrays are symbols.
                Some(TokenKind::Name(n)) => {
                    self.pos += 1;
                    out.push(Literal::Sym(n));
                }
                Some(TokenKind::Keyword(k)) => {
                    self.pos += 1;
                    // Consecutive parts form one selector, as in #at:put:.
                    let mut sym = k;
                    while let Some(TokenKind::Keyword(next)) = self.peek().cloned() {
                        self.pos += 1;
                        sym.push_str(&next);
                    }
                    out.push(Literal::Sym(sym));
                }
                Some(TokenKind::ArrayBegin) => {
                    self.pos += 1;
                    out.push(Literal::Array(self.parse_literal_array()?));
                }
                _ => return Err(self.error("bad literal array element")),
            }
        }
    }
}

fn split_message(expr: Expr) -> Option<(Expr, Message)> {
    match expr {
        Expr::Unary {
            receiver,
            selector,
            line,
        } => Some((
            *receiver,
            Message {
                selector,
                arguments: Vec::new(),
                line,
            },
        )),
        Expr::Binary {
            receiver,
            selector,
            argument,
            line,
        } => Some((
            *receiver,
            Message {
                selector,
                arguments: vec![*argument],
                line,
            },
        )),
        Expr::Keyword {
            receiver,
            selector,
            arguments,
            line,
        } => Some((
            *receiver,
            Message {
                selector,
                arguments,
                line,
            },
        )),
        _ => None,
    }
}

/// Parse one complete method source.
pub fn parse_method(src: &str) -> Result<MethodAst, CompileError> {
    Parser::new(tokenize(src)?).parse_method()
}

/// Parse a bare statement sequence as the body of `selector`.
pub fn parse_body(src: &str, selector: &str) -> Result<MethodAst, CompileError> {
    Parser::new(tokenize(src)?).parse_body(selector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unary_binds_tighter_than_binary() {
        let m = parse_method("test ^ 1 + 2 factorial").unwrap();
        let Statement::Return { value, .. } = &m.body[0] else {
            panic!("expected return");
        };
        let Expr::Binary {
            selector, argument, ..
        } = value
        else {
            panic!("expected binary send");
        };
        assert_eq!(selector, "+");
        assert!(matches!(&**argument, Expr::Unary { selector, .. } if selector == "factorial"));
    }

    #[test]
    fn test_keyword_parts_collect_into_one_selector() {
        let m = parse_method("test a at: 1 put: 2 + 3").unwrap();
        let Statement::Expr(Expr::Keyword {
            selector,
            arguments,
            ..
        }) = &m.body[0]
        else {
            panic!("expected keyword send");
        };
        assert_eq!(selector, "at:put:");
        assert_eq!(arguments.len(), 2);
        assert!(matches!(&arguments[1], Expr::Binary { .. }));
    }

    #[test]
    fn test_keyword_pattern_with_temporaries() {
        let m = parse_method("at: key put: val | tmp | tmp <- key").unwrap();
        assert_eq!(m.selector, "at:put:");
        assert_eq!(m.parameters, vec!["key", "val"]);
        assert_eq!(m.temporaries, vec!["tmp"]);
    }

    #[test]
    fn test_cascade_splits_first_message() {
        let m = parse_method("test x foo: 1; bar; baz: 2").unwrap();
        let Statement::Expr(Expr::Cascade { receiver, messages }) = &m.body[0] else {
            panic!("expected cascade");
        };
        assert!(matches!(&**receiver, Expr::Name { name, .. } if name == "x"));
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].selector, "foo:");
        assert_eq!(messages[1].selector, "bar");
        assert_eq!(messages[2].selector, "baz:");
    }

    #[test]
    fn test_block_with_parameters() {
        let m = parse_method("test ^ [ :a :b | a + b ]").unwrap();
        let Statement::Return { value, .. } = &m.body[0] else {
            panic!("expected return");
        };
        let Expr::Block(b) = value else {
            panic!("expected block");
        };
        assert_eq!(b.parameters, vec!["a", "b"]);
        assert_eq!(b.body.len(), 1);
    }

    #[test]
    fn test_literal_array_with_negatives_and_symbols() {
        let m = parse_method("test ^ #( 1 -2 $a foo at:put: #( 3 ) )").unwrap();
        let Statement::Return {
            value: Expr::Literal {
                value: Literal::Array(elems),
                ..
            },
            ..
        } = &m.body[0]
        else {
            panic!("expected literal array");
        };
        assert_eq!(elems[0], Literal::Int(1));
        assert_eq!(elems[1], Literal::Int(-2));
        assert_eq!(elems[2], Literal::Char('a'));
        assert_eq!(elems[3], Literal::Sym("foo".into()));
        assert_eq!(elems[4], Literal::Sym("at:put:".into()));
        assert_eq!(elems[5], Literal::Array(vec![Literal::Int(3)]));
    }

    #[test]
    fn test_inline_primitive() {
        let m = parse_method("test ^ <11 self>").unwrap();
        let Statement::Return {
            value: Expr::Primitive {
                number, arguments, ..
            },
            ..
        } = &m.body[0]
        else {
            panic!("expected primitive");
        };
        assert_eq!(*number, 11);
        assert_eq!(arguments.len(), 1);
    }

    #[test]
    fn test_assignment_chains_right() {
        let m = parse_method("test a <- b <- 3").unwrap();
        let Statement::Expr(Expr::Assign { name, value, .. }) = &m.body[0] else {
            panic!("expected assignment");
        };
        assert_eq!(name, "a");
        assert!(matches!(&**value, Expr::Assign { name, .. } if name == "b"));
    }
}
