//! Byte-walking lexer for method source.

use crate::compiler::CompileError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Identifier: variable, unary selector, or global name.
    Name(String),
    /// Keyword selector part, colon included (`at:`).
    Keyword(String),
    Int(i64),
    Float(f64),
    Char(char),
    Str(String),
    /// `#name`, `#at:put:`, `#+`.
    Sym(String),
    /// `#(`
    ArrayBegin,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Semi,
    Period,
    Caret,
    Bar,
    Colon,
    /// `<-`
    Assign,
    /// Operator character run (`+`, `<=`, `~=`).
    Binary(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

fn is_binary_char(b: u8) -> bool {
    matches!(
        b,
        b'+' | b'-' | b'*' | b'/' | b'~' | b'<' | b'>' | b'=' | b'&' | b'@' | b'%' | b',' | b'?'
    )
}

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
        }
    }

    #[inline]
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    #[inline]
    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.src.get(self.pos + ahead).copied()
    }

    #[inline]
    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
        }
        Some(b)
    }

    fn error(&self, msg: impl Into<String>) -> CompileError {
        CompileError::Syntax {
            line: self.line,
            msg: msg.into(),
        }
    }

    fn skip_blank(&mut self) -> Result<(), CompileError> {
        loop {
            match self.peek() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'"') => {
                    let start = self.line;
                    self.bump();
                    loop {
                        match self.bump() {
                            Some(b'"') => break,
                            Some(_) => {}
                            None => {
                                return Err(CompileError::Syntax {
                                    line: start,
                                    msg: "unterminated comment".into(),
                                });
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn lex_name(&mut self) -> String {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() {
                self.bump();
            } else {
                break;
            }
        }
        String::from_utf8_lossy(&self.src[start..self.pos]).into_owned()
    }

    fn lex_number(&mut self) -> Result<TokenKind, CompileError> {
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.bump();
        }
        let mut is_float = false;
        if self.peek() == Some(b'.') && self.peek_at(1).is_some_and(|b| b.is_ascii_digit()) {
            is_float = true;
            self.bump();
            while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                self.bump();
            }
        }
        if self.peek() == Some(b'e') {
            let mut ahead = 1;
            if matches!(self.peek_at(1), Some(b'+') | Some(b'-')) {
                ahead = 2;
            }
            if self.peek_at(ahead).is_some_and(|b| b.is_ascii_digit()) {
                is_float = true;
                for _ in 0..=ahead {
                    self.bump();
                }
                while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                    self.bump();
                }
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.error("bad number"))?;
        if is_float {
            text.parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| self.error(format!("bad float literal {text}")))
        } else {
            text.parse::<i64>()
                .map(TokenKind::Int)
                .map_err(|_| self.error(format!("integer literal {text} too large")))
        }
    }

    fn lex_string(&mut self) -> Result<TokenKind, CompileError> {
        let start = self.line;
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(b'\'') => {
                    // Doubled quote is a literal quote.
                    if self.peek() == Some(b'\'') {
                        self.bump();
                        out.push('\'');
                    } else {
                        return Ok(TokenKind::Str(out));
                    }
                }
                Some(b) => out.push(b as char),
                None => {
                    return Err(CompileError::Syntax {
                        line: start,
                        msg: "unterminated string".into(),
                    });
                }
            }
        }
    }

    fn lex_symbol(&mut self) -> Result<TokenKind, CompileError> {
        match self.peek() {
            Some(b'(') => {
                self.bump();
                Ok(TokenKind::ArrayBegin)
            }
            Some(b) if is_binary_char(b) => {
                let mut sel = String::new();
                while let Some(c) = self.peek() {
                    if is_binary_char(c) {
                        self.bump();
                        sel.push(c as char);
                    } else {
                        break;
                    }
                }
                Ok(TokenKind::Sym(sel))
            }
            Some(b) if b.is_ascii_alphabetic() => {
                let mut sel = String::new();
                while self.peek().is_some_and(|c| c.is_ascii_alphanumeric()) {
                    sel.push_str(&self.lex_name());
                    if self.peek() == Some(b':') {
                        self.bump();
                        sel.push(':');
                    } else {
                        break;
                    }
                }
                Ok(TokenKind::Sym(sel))
            }
            _ => Err(self.error("bad symbol literal")),
        }
    }

    pub fn next_token(&mut self) -> Result<Option<Token>, CompileError> {
        self.skip_blank()?;
        let line = self.line;
        let Some(b) = self.peek() else {
            return Ok(None);
        };
        let kind = match b {
            b'0'..=b'9' => self.lex_number()?,
            c if c.is_ascii_alphabetic() => {
                let name = self.lex_name();
                if self.peek() == Some(b':') {
                    self.bump();
                    TokenKind::Keyword(format!("{name}:"))
                } else {
                    TokenKind::Name(name)
                }
            }
            b'\'' => {
                self.bump();
                self.lex_string()?
            }
            b'$' => {
                self.bump();
                let c = self.bump().ok_or_else(|| self.error("bad character literal"))?;
                if !c.is_ascii() {
                    return Err(self.error("non-ascii character literal"));
                }
                TokenKind::Char(c as char)
            }
            b'#' => {
                self.bump();
                self.lex_symbol()?
            }
            b'(' => {
                self.bump();
                TokenKind::LParen
            }
            b')' => {
                self.bump();
                TokenKind::RParen
            }
            b'[' => {
                self.bump();
                TokenKind::LBracket
            }
            b']' => {
                self.bump();
                TokenKind::RBracket
            }
            b';' => {
                self.bump();
                TokenKind::Semi
            }
            b'.' => {
                self.bump();
                TokenKind::Period
            }
            b'^' => {
                self.bump();
                TokenKind::Caret
            }
            b'|' => {
                self.bump();
                TokenKind::Bar
            }
            b':' => {
                self.bump();
                TokenKind::Colon
            }
            b'<' if self.peek_at(1) == Some(b'-') => {
                self.bump();
                self.bump();
                TokenKind::Assign
            }
            c if is_binary_char(c) => {
                let mut op = String::new();
                op.push(self.bump().unwrap() as char);
                if self.peek().is_some_and(is_binary_char) && op.len() < 2 {
                    op.push(self.bump().unwrap() as char);
                }
                TokenKind::Binary(op)
            }
            other => return Err(self.error(format!("unexpected character {:?}", other as char))),
        };
        Ok(Some(Token { kind, line }))
    }
}

pub fn tokenize(src: &str) -> Result<Vec<Token>, CompileError> {
    let mut lexer = Lexer::new(src);
    let mut out = Vec::new();
    while let Some(t) = lexer.next_token()? {
        out.push(t);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::TokenKind::*;
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_keyword_message_stream() {
        assert_eq!(
            kinds("foo at: 3 put: x"),
            vec![
                Name("foo".into()),
                Keyword("at:".into()),
                Int(3),
                Keyword("put:".into()),
                Name("x".into()),
            ]
        );
    }

    #[test]
    fn test_assignment_is_not_two_binaries() {
        assert_eq!(
            kinds("x <- y < -2"),
            vec![
                Name("x".into()),
                Assign,
                Name("y".into()),
                Binary("<".into()),
                Binary("-".into()),
                Int(2),
            ]
        );
    }

    #[test]
    fn test_block_with_argument() {
        assert_eq!(
            kinds("[ :x | x + 1 ]"),
            vec![
                LBracket,
                Colon,
                Name("x".into()),
                Bar,
                Name("x".into()),
                Binary("+".into()),
                Int(1),
                RBracket,
            ]
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            kinds("3.25 $a 'don''t' #at:put: #+ #( 1 2 )"),
            vec![
                Float(3.25),
                Char('a'),
                Str("don't".into()),
                Sym("at:put:".into()),
                Sym("+".into()),
                ArrayBegin,
                Int(1),
                Int(2),
                RParen,
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped_and_lines_counted() {
        let toks = tokenize("a \"note\nspanning\" b").unwrap();
        assert_eq!(toks[0].line, 1);
        assert_eq!(toks[1].kind, Name("b".into()));
        assert_eq!(toks[1].line, 2);
    }

    #[test]
    fn test_unterminated_string_errors() {
        assert!(tokenize("'oops").is_err());
    }

    #[test]
    fn test_non_ascii_character_literal_errors() {
        assert!(tokenize("$é").is_err());
        assert_eq!(kinds("$~"), vec![Char('~')]);
    }
}
