mod ast;
mod builder;
mod bytecode;
mod compiler;
mod image;
mod interpreter;
mod lexer;
mod memory;
mod objects;
mod oop;
mod parser;
mod primitives;
mod signal;
mod vm;

pub use ast::*;
pub use builder::*;
pub use bytecode::*;
pub use compiler::{CompileError, compile, compile_body};
pub use image::*;
pub use interpreter::{DEFAULT_STEP_SLICE, execute};
pub use lexer::*;
pub use memory::*;
pub use objects::*;
pub use oop::*;
pub use parser::{parse_body, parse_method};
pub use primitives::{dispatch, install_method, integer_binary};
pub use signal::*;
pub use vm::*;
