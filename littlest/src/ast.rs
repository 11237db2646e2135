//! Method syntax trees produced by the parser and walked by the code
//! generator.

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Char(char),
    Str(String),
    Sym(String),
    Array(Vec<Literal>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub parameters: Vec<String>,
    pub body: Vec<Statement>,
    pub line: usize,
}

/// One message of a cascade: selector plus arguments, any arity.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub selector: String,
    pub arguments: Vec<Expr>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Unresolved name: variable, built-in, or global.
    Name { name: String, line: usize },
    Literal { value: Literal, line: usize },
    Block(Block),
    /// `<number arg...>` inline primitive call.
    Primitive {
        number: u8,
        arguments: Vec<Expr>,
        line: usize,
    },
    Assign {
        name: String,
        value: Box<Expr>,
        line: usize,
    },
    Unary {
        receiver: Box<Expr>,
        selector: String,
        line: usize,
    },
    Binary {
        receiver: Box<Expr>,
        selector: String,
        argument: Box<Expr>,
        line: usize,
    },
    Keyword {
        receiver: Box<Expr>,
        selector: String,
        arguments: Vec<Expr>,
        line: usize,
    },
    /// `recv msg; msg2; msg3`: every message goes to `receiver`.
    Cascade {
        receiver: Box<Expr>,
        messages: Vec<Message>,
    },
}

impl Expr {
    pub fn line(&self) -> usize {
        match self {
            Expr::Name { line, .. }
            | Expr::Literal { line, .. }
            | Expr::Primitive { line, .. }
            | Expr::Assign { line, .. }
            | Expr::Unary { line, .. }
            | Expr::Binary { line, .. }
            | Expr::Keyword { line, .. } => *line,
            Expr::Block(b) => b.line,
            Expr::Cascade { receiver, .. } => receiver.line(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Expr(Expr),
    /// `^ expr`
    Return { value: Expr, line: usize },
}

/// A parsed method: pattern, temporaries, statements.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodAst {
    pub selector: String,
    pub parameters: Vec<String>,
    pub temporaries: Vec<String>,
    pub body: Vec<Statement>,
}
