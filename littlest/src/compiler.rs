//! Code generation: a parsed method to a populated `Method` object.

use log::warn;
use thiserror::Error;

use crate::ast::{Block, Expr, Literal, Message, MethodAst, Statement};
use crate::bytecode::{
    CONST_CONTEXT, CONST_FALSE, CONST_MINUS_ONE, CONST_NIL, CONST_TRUE, Instruction,
};
use crate::objects::{
    self, BLOCK_ARG_COUNT, BLOCK_ARG_LOCATION, BLOCK_BYTE_POSITION, BLOCK_SLOTS, CLASS_SUPERCLASS,
    CLASS_VARIABLES, METHOD_BYTECODES, METHOD_CLASS, METHOD_LITERALS, METHOD_MESSAGE,
    METHOD_SLOTS, METHOD_STACK_SIZE, METHOD_TEMP_SIZE, METHOD_TEXT,
};
use crate::oop::{NIL, Oop};
use crate::parser;
use crate::vm::{BINARY_SELECTORS, UNARY_SELECTORS, Vm};

pub const MAX_CODE_BYTES: usize = 256;
pub const MAX_LITERALS: usize = 128;
pub const MAX_TEMPORARIES: usize = 32;
pub const MAX_ARGUMENTS: usize = 16;
pub const MAX_BLOCK_ARGUMENTS: usize = 16;

/// Primitive the interpreter treats as a non-local block return.
pub const PRIM_BLOCK_RETURN: u8 = 18;
/// Primitive that copies a block and binds it to a context.
pub const PRIM_BLOCK_COPY: u8 = 28;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("line {line}: {msg}")]
    Syntax { line: usize, msg: String },
    #[error("line {line}: {what} limit exceeded")]
    TooLarge { line: usize, what: &'static str },
}

struct Compiler<'a> {
    vm: &'a mut Vm,
    method_class: Oop,
    instance_vars: Vec<String>,
    parameters: Vec<String>,
    temporaries: Vec<String>,
    max_temps: usize,
    literals: Vec<Oop>,
    code: Vec<u8>,
    depth: usize,
    max_depth: usize,
}

/// Compile `text` as a method of `class` (nil for a classless doIt).
/// The result is a fresh `Method` with refcount 0; the caller stores it.
pub fn compile(vm: &mut Vm, class: Oop, text: &str) -> Result<Oop, CompileError> {
    let ast = parser::parse_method(text)?;
    compile_ast(vm, class, text, &ast)
}

/// Compile a bare statement sequence as `selector` (used for `!` lines
/// and eval-string).
pub fn compile_body(
    vm: &mut Vm,
    class: Oop,
    text: &str,
    selector: &str,
) -> Result<Oop, CompileError> {
    let ast = parser::parse_body(text, selector)?;
    compile_ast(vm, class, text, &ast)
}

fn compile_ast(vm: &mut Vm, class: Oop, text: &str, ast: &MethodAst) -> Result<Oop, CompileError> {
    if ast.parameters.len() > MAX_ARGUMENTS {
        return Err(CompileError::TooLarge {
            line: 1,
            what: "argument",
        });
    }
    if ast.temporaries.len() > MAX_TEMPORARIES {
        return Err(CompileError::TooLarge {
            line: 1,
            what: "temporary",
        });
    }
    let instance_vars = collect_instance_vars(vm, class);
    for t in &ast.temporaries {
        if ast.parameters.contains(t) || instance_vars.contains(t) {
            warn!("{}: temporary {t} shadows an argument or instance variable", ast.selector);
        }
    }
    let mut c = Compiler {
        vm,
        method_class: class,
        instance_vars,
        parameters: ast.parameters.clone(),
        temporaries: ast.temporaries.clone(),
        max_temps: ast.temporaries.len(),
        literals: Vec::new(),
        code: Vec::new(),
        depth: 0,
        max_depth: 0,
    };
    c.gen_method_body(&ast.body)?;
    if c.code.len() > MAX_CODE_BYTES {
        return Err(CompileError::TooLarge {
            line: 1,
            what: "bytecode",
        });
    }
    c.build_method(&ast.selector, text)
}

/// Instance variables visible in `class`, inherited first so indexes
/// line up with allocated slots.
fn collect_instance_vars(vm: &Vm, class: Oop) -> Vec<String> {
    let mut chain = Vec::new();
    let mut probe = class;
    while probe.is_object() {
        chain.push(probe);
        probe = vm.mem.basic_at(probe, CLASS_SUPERCLASS);
    }
    let mut out = Vec::new();
    for cls in chain.iter().rev() {
        let vars = vm.mem.basic_at(*cls, CLASS_VARIABLES);
        if vars.is_nil() {
            continue;
        }
        let n = vm.mem.size_of(vars) as usize;
        for i in 1..=n {
            let sym = vm.mem.basic_at(vars, i);
            out.push(String::from_utf8_lossy(objects::text_of(&vm.mem, sym)).into_owned());
        }
    }
    out
}

impl Compiler<'_> {
    // ── emission helpers ──────────────────────────────────────────────

    fn emit(&mut self, i: Instruction) {
        i.encode(&mut self.code);
    }

    fn flow(&mut self, pops: usize, pushes: usize) {
        self.depth = self.depth.saturating_sub(pops) + pushes;
        self.max_depth = self.max_depth.max(self.depth);
    }

    /// Emit a branch with a placeholder target; answer the byte to patch.
    fn emit_open_branch(&mut self, make: fn(u8) -> Instruction) -> usize {
        self.emit(make(0));
        self.code.len() - 1
    }

    /// Point an open branch at the next instruction (1-based target).
    fn patch(&mut self, at: usize, line: usize) -> Result<(), CompileError> {
        let target = self.code.len() + 1;
        if target > u8::MAX as usize {
            return Err(CompileError::TooLarge {
                line,
                what: "bytecode",
            });
        }
        self.code[at] = target as u8;
        Ok(())
    }

    fn here(&self) -> usize {
        self.code.len() + 1
    }

    fn add_literal(&mut self, value: Oop, line: usize) -> Result<u8, CompileError> {
        // Interned symbols and integers repeat; one frame slot each.
        if let Some(i) = self.literals.iter().position(|&l| l == value) {
            return Ok(i as u8);
        }
        if self.literals.len() >= MAX_LITERALS {
            return Err(CompileError::TooLarge {
                line,
                what: "literal",
            });
        }
        self.literals.push(value);
        Ok((self.literals.len() - 1) as u8)
    }

    fn selector_literal(&mut self, selector: &str, line: usize) -> Result<u8, CompileError> {
        let sym = self.vm.intern(selector);
        self.add_literal(sym, line)
    }

    // ── statements ────────────────────────────────────────────────────

    fn gen_method_body(&mut self, body: &[Statement]) -> Result<(), CompileError> {
        for stmt in body {
            match stmt {
                Statement::Expr(e) => {
                    self.gen_expr(e)?;
                    self.emit(Instruction::PopTop);
                    self.flow(1, 0);
                }
                Statement::Return { value, .. } => {
                    self.gen_expr(value)?;
                    self.emit(Instruction::StackReturn);
                    self.flow(1, 0);
                }
            }
        }
        self.emit(Instruction::SelfReturn);
        Ok(())
    }

    /// A block body: value of the last statement, closed by StackReturn.
    /// `^` here is a non-local return through the creating frame.
    fn gen_block_tail(&mut self, body: &[Statement], line: usize) -> Result<(), CompileError> {
        if body.is_empty() {
            self.emit(Instruction::PushConstant(CONST_NIL));
            self.flow(0, 1);
            self.emit(Instruction::StackReturn);
            self.flow(1, 0);
            return Ok(());
        }
        for (i, stmt) in body.iter().enumerate() {
            let last = i + 1 == body.len();
            match stmt {
                Statement::Return { value, .. } => {
                    self.gen_expr(value)?;
                    self.emit(Instruction::DoPrimitive {
                        argc: 1,
                        number: PRIM_BLOCK_RETURN,
                    });
                    self.flow(1, 1);
                    if !last {
                        self.emit(Instruction::PopTop);
                        self.flow(1, 0);
                    }
                }
                Statement::Expr(e) => {
                    self.gen_expr(e)?;
                    if last {
                        self.emit(Instruction::StackReturn);
                        self.flow(1, 0);
                    } else {
                        self.emit(Instruction::PopTop);
                        self.flow(1, 0);
                    }
                }
            }
        }
        let _ = line;
        Ok(())
    }

    /// Inline block value for the optimized control-flow selectors: the
    /// statements run in the enclosing frame, no context, no send.
    fn gen_inline_value(&mut self, block: &Block) -> Result<(), CompileError> {
        if block.body.is_empty() {
            self.emit(Instruction::PushConstant(CONST_NIL));
            self.flow(0, 1);
            return Ok(());
        }
        for (i, stmt) in block.body.iter().enumerate() {
            let last = i + 1 == block.body.len();
            match stmt {
                Statement::Return { value, line } => {
                    // Inline body, so this is a plain method return.
                    self.gen_expr(value)?;
                    self.emit(Instruction::StackReturn);
                    self.flow(1, 0);
                    if last {
                        // Unreachable, but the expression needs a value.
                        self.emit(Instruction::PushConstant(CONST_NIL));
                        self.flow(0, 1);
                    }
                    let _ = line;
                }
                Statement::Expr(e) => {
                    self.gen_expr(e)?;
                    if !last {
                        self.emit(Instruction::PopTop);
                        self.flow(1, 0);
                    }
                }
            }
        }
        Ok(())
    }

    // ── expressions ───────────────────────────────────────────────────

    fn gen_expr(&mut self, e: &Expr) -> Result<(), CompileError> {
        match e {
            Expr::Name { name, line } => self.gen_name(name, *line),
            Expr::Literal { value, line } => {
                if let Literal::Int(v) = value {
                    let small = match v {
                        0 => Some(0),
                        1 => Some(1),
                        2 => Some(2),
                        -1 => Some(CONST_MINUS_ONE),
                        _ => None,
                    };
                    if let Some(c) = small {
                        self.emit(Instruction::PushConstant(c));
                        self.flow(0, 1);
                        return Ok(());
                    }
                }
                let oop = self.make_literal(value, *line)?;
                let idx = self.add_literal(oop, *line)?;
                self.emit(Instruction::PushLiteral(idx));
                self.flow(0, 1);
                Ok(())
            }
            Expr::Block(b) => self.gen_block(b),
            Expr::Primitive {
                number,
                arguments,
                line,
            } => {
                if arguments.len() > u8::MAX as usize {
                    return Err(CompileError::TooLarge {
                        line: *line,
                        what: "argument",
                    });
                }
                for a in arguments {
                    self.gen_expr(a)?;
                }
                self.emit(Instruction::DoPrimitive {
                    argc: arguments.len() as u8,
                    number: *number,
                });
                self.flow(arguments.len(), 1);
                Ok(())
            }
            Expr::Assign { name, value, line } => {
                self.gen_expr(value)?;
                self.gen_assign(name, *line)
            }
            Expr::Unary {
                receiver,
                selector,
                line,
            } => {
                if is_super(receiver) {
                    self.emit(Instruction::PushArgument(0));
                    self.flow(0, 1);
                    return self.gen_super_send(selector, 1, *line);
                }
                self.gen_expr(receiver)?;
                self.gen_message(selector, 1, *line)
            }
            Expr::Binary {
                receiver,
                selector,
                argument,
                line,
            } => {
                if is_super(receiver) {
                    self.emit(Instruction::PushArgument(0));
                    self.flow(0, 1);
                    self.gen_expr(argument)?;
                    return self.gen_super_send(selector, 2, *line);
                }
                self.gen_expr(receiver)?;
                self.gen_expr(argument)?;
                self.gen_message(selector, 2, *line)
            }
            Expr::Keyword {
                receiver,
                selector,
                arguments,
                line,
            } => self.gen_keyword(receiver, selector, arguments, *line),
            Expr::Cascade { receiver, messages } => self.gen_cascade(receiver, messages),
        }
    }

    fn gen_name(&mut self, name: &str, line: usize) -> Result<(), CompileError> {
        if name == "self" || name == "super" {
            self.emit(Instruction::PushArgument(0));
            self.flow(0, 1);
            return Ok(());
        }
        if let Some(i) = self.temporaries.iter().rposition(|t| t == name) {
            self.emit(Instruction::PushTemporary(i as u8));
            self.flow(0, 1);
            return Ok(());
        }
        if let Some(i) = self.parameters.iter().position(|p| p == name) {
            self.emit(Instruction::PushArgument(i as u8 + 1));
            self.flow(0, 1);
            return Ok(());
        }
        if let Some(i) = self.instance_vars.iter().position(|v| v == name) {
            self.emit(Instruction::PushInstance(i as u8));
            self.flow(0, 1);
            return Ok(());
        }
        let builtin = match name {
            "nil" => Some(CONST_NIL),
            "true" => Some(CONST_TRUE),
            "false" => Some(CONST_FALSE),
            "currentInterpreter" => Some(CONST_CONTEXT),
            _ => None,
        };
        if let Some(c) = builtin {
            self.emit(Instruction::PushConstant(c));
            self.flow(0, 1);
            return Ok(());
        }
        // Deferred global: push the symbol, send it value.
        let sym = self.vm.intern(name);
        let idx = self.add_literal(sym, line)?;
        self.emit(Instruction::PushLiteral(idx));
        self.flow(0, 1);
        let value_idx = self.selector_literal("value", line)?;
        self.emit(Instruction::MarkArguments(1));
        self.emit(Instruction::SendMessage(value_idx));
        self.flow(1, 1);
        Ok(())
    }

    fn gen_assign(&mut self, name: &str, line: usize) -> Result<(), CompileError> {
        if let Some(i) = self.temporaries.iter().rposition(|t| t == name) {
            self.emit(Instruction::AssignTemporary(i as u8));
            return Ok(());
        }
        if self.parameters.iter().any(|p| p == name) {
            return Err(CompileError::Syntax {
                line,
                msg: format!("cannot assign to argument {name}"),
            });
        }
        if let Some(i) = self.instance_vars.iter().position(|v| v == name) {
            self.emit(Instruction::AssignInstance(i as u8));
            return Ok(());
        }
        Err(CompileError::Syntax {
            line,
            msg: format!("cannot assign to {name}"),
        })
    }

    /// A send to the value(s) already on the stack. `argc` counts the
    /// receiver.
    fn gen_message(&mut self, selector: &str, argc: usize, line: usize) -> Result<(), CompileError> {
        if argc == 1 {
            if let Some(i) = UNARY_SELECTORS.iter().position(|s| *s == selector) {
                self.emit(Instruction::SendUnary(i as u8));
                self.flow(1, 1);
                return Ok(());
            }
        }
        if argc == 2 {
            if let Some(i) = BINARY_SELECTORS.iter().position(|s| *s == selector) {
                self.emit(Instruction::SendBinary(i as u8));
                self.flow(2, 1);
                return Ok(());
            }
        }
        let idx = self.selector_literal(selector, line)?;
        self.emit(Instruction::MarkArguments(argc as u8));
        self.emit(Instruction::SendMessage(idx));
        self.flow(argc, 1);
        Ok(())
    }

    fn gen_super_send(
        &mut self,
        selector: &str,
        argc: usize,
        line: usize,
    ) -> Result<(), CompileError> {
        let idx = self.selector_literal(selector, line)?;
        self.emit(Instruction::MarkArguments(argc as u8));
        self.emit(Instruction::SendToSuper(idx));
        self.flow(argc, 1);
        Ok(())
    }

    fn gen_keyword(
        &mut self,
        receiver: &Expr,
        selector: &str,
        arguments: &[Expr],
        line: usize,
    ) -> Result<(), CompileError> {
        if !is_super(receiver) {
            if let Some(done) = self.try_optimized(receiver, selector, arguments, line)? {
                return Ok(done);
            }
        }
        if is_super(receiver) {
            self.emit(Instruction::PushArgument(0));
            self.flow(0, 1);
            for a in arguments {
                self.gen_expr(a)?;
            }
            return self.gen_super_send(selector, arguments.len() + 1, line);
        }
        self.gen_expr(receiver)?;
        for a in arguments {
            self.gen_expr(a)?;
        }
        self.gen_message(selector, arguments.len() + 1, line)
    }

    /// The control-flow selectors compile to branches when their block
    /// arguments are literal and parameterless; answers None when the
    /// shape does not apply and a plain send is needed.
    fn try_optimized(
        &mut self,
        receiver: &Expr,
        selector: &str,
        arguments: &[Expr],
        line: usize,
    ) -> Result<Option<()>, CompileError> {
        let arg_block = |e: &Expr| match e {
            Expr::Block(b) if b.parameters.is_empty() => Some(b.clone()),
            _ => None,
        };
        match selector {
            "ifTrue:" | "ifFalse:" => {
                let Some(body) = arg_block(&arguments[0]) else {
                    return Ok(None);
                };
                self.gen_expr(receiver)?;
                let make = if selector == "ifTrue:" {
                    Instruction::BranchIfFalse
                } else {
                    Instruction::BranchIfTrue
                };
                let skip = self.emit_open_branch(make);
                self.flow(1, 0);
                self.gen_inline_value(&body)?;
                let done = self.emit_open_branch(Instruction::Branch);
                self.patch(skip, line)?;
                self.emit(Instruction::PushConstant(CONST_NIL));
                self.patch(done, line)?;
                Ok(Some(()))
            }
            "ifTrue:ifFalse:" => {
                let (Some(when_true), Some(when_false)) =
                    (arg_block(&arguments[0]), arg_block(&arguments[1]))
                else {
                    return Ok(None);
                };
                self.gen_expr(receiver)?;
                let to_false = self.emit_open_branch(Instruction::BranchIfFalse);
                self.flow(1, 0);
                self.gen_inline_value(&when_true)?;
                let done = self.emit_open_branch(Instruction::Branch);
                self.patch(to_false, line)?;
                self.depth = self.depth.saturating_sub(1);
                self.gen_inline_value(&when_false)?;
                self.patch(done, line)?;
                Ok(Some(()))
            }
            "whileTrue:" => {
                let (Some(cond), Some(body)) = (arg_block(receiver), arg_block(&arguments[0]))
                else {
                    return Ok(None);
                };
                let top = self.here();
                if top > u8::MAX as usize {
                    return Err(CompileError::TooLarge {
                        line,
                        what: "bytecode",
                    });
                }
                self.gen_inline_value(&cond)?;
                let out = self.emit_open_branch(Instruction::BranchIfFalse);
                self.flow(1, 0);
                self.gen_inline_value(&body)?;
                self.emit(Instruction::PopTop);
                self.flow(1, 0);
                self.emit(Instruction::Branch(top as u8));
                self.patch(out, line)?;
                self.emit(Instruction::PushConstant(CONST_NIL));
                self.flow(0, 1);
                Ok(Some(()))
            }
            "and:" | "or:" => {
                let Some(body) = arg_block(&arguments[0]) else {
                    return Ok(None);
                };
                self.gen_expr(receiver)?;
                let make = if selector == "and:" {
                    Instruction::AndBranch
                } else {
                    Instruction::OrBranch
                };
                let out = self.emit_open_branch(make);
                self.flow(1, 0);
                self.gen_inline_value(&body)?;
                self.patch(out, line)?;
                Ok(Some(()))
            }
            _ => Ok(None),
        }
    }

    fn gen_cascade(&mut self, receiver: &Expr, messages: &[Message]) -> Result<(), CompileError> {
        self.gen_expr(receiver)?;
        let last = messages.len() - 1;
        for (i, m) in messages.iter().enumerate() {
            if i != last {
                self.emit(Instruction::Duplicate);
                self.flow(0, 1);
            }
            for a in &m.arguments {
                self.gen_expr(a)?;
            }
            self.gen_message(&m.selector, m.arguments.len() + 1, m.line)?;
            if i != last {
                self.emit(Instruction::PopTop);
                self.flow(1, 0);
            }
        }
        Ok(())
    }

    /// Compile a literal block: the object goes in the literal table,
    /// runtime binds it to a context (primitive 28), and a branch skips
    /// the inline body.
    fn gen_block(&mut self, b: &Block) -> Result<(), CompileError> {
        if b.parameters.len() > MAX_BLOCK_ARGUMENTS {
            return Err(CompileError::TooLarge {
                line: b.line,
                what: "block argument",
            });
        }
        let arg_location = self.temporaries.len();
        self.temporaries.extend(b.parameters.iter().cloned());
        if self.temporaries.len() > MAX_TEMPORARIES {
            return Err(CompileError::TooLarge {
                line: b.line,
                what: "temporary",
            });
        }
        self.max_temps = self.max_temps.max(self.temporaries.len());

        let block_class = self.vm.global("Block");
        let block_obj = self.vm.mem.alloc_word(BLOCK_SLOTS);
        self.vm.mem.set_class_field(block_obj, block_class);
        self.vm.mem.field_at_put(
            block_obj,
            BLOCK_ARG_COUNT,
            Oop::new_integer(b.parameters.len() as i32),
        );
        self.vm.mem.field_at_put(
            block_obj,
            BLOCK_ARG_LOCATION,
            Oop::new_integer(arg_location as i32),
        );
        let idx = self.add_literal(block_obj, b.line)?;
        self.emit(Instruction::PushLiteral(idx));
        self.flow(0, 1);
        self.emit(Instruction::PushConstant(CONST_CONTEXT));
        self.flow(0, 1);
        self.emit(Instruction::DoPrimitive {
            argc: 2,
            number: PRIM_BLOCK_COPY,
        });
        self.flow(2, 1);
        let skip = self.emit_open_branch(Instruction::Branch);

        let body_start = self.here();
        if body_start > u8::MAX as usize {
            return Err(CompileError::TooLarge {
                line: b.line,
                what: "bytecode",
            });
        }
        self.vm.mem.field_at_put(
            block_obj,
            BLOCK_BYTE_POSITION,
            Oop::new_integer(body_start as i32),
        );
        self.gen_block_tail(&b.body, b.line)?;
        self.patch(skip, b.line)?;

        self.temporaries.truncate(arg_location);
        Ok(())
    }

    // ── literals ──────────────────────────────────────────────────────

    fn make_literal(&mut self, lit: &Literal, line: usize) -> Result<Oop, CompileError> {
        match lit {
            Literal::Int(v) => {
                if *v < i32::MIN as i64 || *v > (i32::MAX >> 1) as i64 {
                    return Err(CompileError::Syntax {
                        line,
                        msg: format!("integer literal {v} out of range"),
                    });
                }
                Ok(Oop::new_integer(*v as i32))
            }
            Literal::Float(v) => {
                let class = self.vm.global("Float");
                Ok(objects::new_float(&mut self.vm.mem, class, *v))
            }
            Literal::Str(s) => {
                let class = self.vm.global("String");
                Ok(objects::new_string(&mut self.vm.mem, class, s))
            }
            Literal::Sym(s) => Ok(self.vm.intern(s)),
            Literal::Char(c) => {
                let class = self.vm.global("Char");
                Ok(objects::new_char(&mut self.vm.mem, class, *c as i32))
            }
            Literal::Array(elems) => {
                let mut oops = Vec::with_capacity(elems.len());
                for e in elems {
                    oops.push(self.make_literal(e, line)?);
                }
                let class = self.vm.global("Array");
                Ok(objects::new_array(&mut self.vm.mem, class, &oops))
            }
        }
    }

    // ── output ────────────────────────────────────────────────────────

    fn build_method(self, selector: &str, text: &str) -> Result<Oop, CompileError> {
        let Compiler {
            vm,
            method_class,
            literals,
            code,
            max_depth,
            max_temps,
            ..
        } = self;
        let method_cls = vm.global("Method");
        let method = vm.mem.alloc_word(METHOD_SLOTS);
        vm.mem.set_class_field(method, method_cls);

        let string_class = vm.global("String");
        let source = objects::new_string(&mut vm.mem, string_class, text);
        vm.mem.field_at_put(method, METHOD_TEXT, source);

        let message = vm.intern(selector);
        vm.mem.field_at_put(method, METHOD_MESSAGE, message);

        let bytes_class = vm.global("ByteArray");
        let bytecodes = vm.mem.alloc_byte(code.len());
        vm.mem.set_class_field(bytecodes, bytes_class);
        for (i, b) in code.iter().enumerate() {
            vm.mem.byte_at_put(bytecodes, i + 1, *b);
        }
        vm.mem.field_at_put(method, METHOD_BYTECODES, bytecodes);

        let array_class = vm.global("Array");
        let frame = objects::new_array(&mut vm.mem, array_class, &literals);
        vm.mem.field_at_put(method, METHOD_LITERALS, frame);

        // Headroom for the linkage slots a primitive activation needs.
        vm.mem.field_at_put(
            method,
            METHOD_STACK_SIZE,
            Oop::new_integer(max_depth as i32 + 4),
        );
        vm.mem
            .field_at_put(method, METHOD_TEMP_SIZE, Oop::new_integer(max_temps as i32));
        vm.mem.field_at_put(method, METHOD_CLASS, method_class);
        Ok(method)
    }
}

fn is_super(e: &Expr) -> bool {
    matches!(e, Expr::Name { name, .. } if name == "super")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Instruction as I, decode_all};
    use crate::objects::text_of;

    fn method_code(vm: &mut Vm, src: &str) -> Vec<I> {
        let m = compile(vm, NIL, src).unwrap();
        let bytes = vm.mem.basic_at(m, METHOD_BYTECODES);
        decode_all(vm.mem.bytes_of(bytes))
    }

    #[test]
    fn test_if_true_if_false_compiles_to_branches() {
        let mut vm = Vm::new();
        let code = method_code(&mut vm, "test ^ 1 < 2 ifTrue: [3] ifFalse: [4]");
        assert!(code.iter().any(|i| matches!(i, I::BranchIfFalse(_))));
        assert!(code.iter().any(|i| matches!(i, I::Branch(_))));
        assert!(
            !code.iter().any(|i| matches!(i, I::SendMessage(_))),
            "optimized selector must not dispatch: {code:?}"
        );
    }

    #[test]
    fn test_while_true_branches_backward() {
        let mut vm = Vm::new();
        let code = method_code(&mut vm, "test [ 1 < 2 ] whileTrue: [ 3 ]");
        let back = code.iter().find_map(|i| match i {
            I::Branch(t) => Some(*t),
            _ => None,
        });
        assert_eq!(back, Some(1), "loop re-enters at the condition");
        assert!(code.iter().any(|i| matches!(i, I::BranchIfFalse(_))));
    }

    #[test]
    fn test_binary_selector_uses_send_binary() {
        let mut vm = Vm::new();
        let code = method_code(&mut vm, "test ^ 3 + 4");
        assert!(code.contains(&I::SendBinary(0)));
    }

    #[test]
    fn test_quo_is_binary_despite_keyword_shape() {
        let mut vm = Vm::new();
        let code = method_code(&mut vm, "test ^ 7 quo: 2");
        assert!(code.contains(&I::SendBinary(9)));
    }

    #[test]
    fn test_unknown_global_defers_through_value() {
        let mut vm = Vm::new();
        let code = method_code(&mut vm, "test ^ Transcript");
        assert_eq!(code[0], I::PushLiteral(0));
        assert_eq!(code[1], I::MarkArguments(1));
        assert!(matches!(code[2], I::SendMessage(_)));
    }

    #[test]
    fn test_block_literal_binds_context_and_skips_body() {
        let mut vm = Vm::new();
        let m = compile(&mut vm, NIL, "test ^ [ :x | x ]").unwrap();
        let bytes = vm.mem.basic_at(m, METHOD_BYTECODES);
        let code = decode_all(vm.mem.bytes_of(bytes));
        assert_eq!(code[0], I::PushLiteral(0));
        assert_eq!(code[1], I::PushConstant(CONST_CONTEXT));
        assert_eq!(
            code[2],
            I::DoPrimitive {
                argc: 2,
                number: PRIM_BLOCK_COPY
            }
        );
        assert!(matches!(code[3], I::Branch(_)));
        let lits = vm.mem.basic_at(m, METHOD_LITERALS);
        let block = vm.mem.basic_at(lits, 1);
        assert_eq!(
            vm.mem.basic_at(block, BLOCK_ARG_COUNT),
            Oop::new_integer(1)
        );
        let pos = vm.mem.basic_at(block, BLOCK_BYTE_POSITION).int_value();
        assert!(pos > 1);
    }

    #[test]
    fn test_repeated_literals_share_one_frame_slot() {
        let mut vm = Vm::new();
        let m = compile(&mut vm, NIL, "test self foo: 40. self foo: 40").unwrap();
        let lits = vm.mem.basic_at(m, METHOD_LITERALS);
        // One slot for 40 and one for #foo:.
        assert_eq!(vm.mem.size_of(lits), 2);
        let bytes = vm.mem.basic_at(m, METHOD_BYTECODES);
        let code = decode_all(vm.mem.bytes_of(bytes));
        let pushes = code.iter().filter(|i| **i == I::PushLiteral(0)).count();
        assert_eq!(pushes, 2);
        assert!(code.contains(&I::SendMessage(1)));
    }

    #[test]
    fn test_cascade_duplicates_receiver() {
        let mut vm = Vm::new();
        let code = method_code(&mut vm, "test x foo; bar");
        assert!(code.contains(&I::Duplicate));
        assert!(code.contains(&I::PopTop));
    }

    #[test]
    fn test_method_records_selector_and_temp_count() {
        let mut vm = Vm::new();
        let m = compile(&mut vm, NIL, "at: k | a b | a <- k. ^ a").unwrap();
        let sel = vm.mem.basic_at(m, METHOD_MESSAGE);
        assert_eq!(text_of(&vm.mem, sel), b"at:");
        assert_eq!(
            vm.mem.basic_at(m, METHOD_TEMP_SIZE),
            Oop::new_integer(2)
        );
    }

    #[test]
    fn test_assignment_to_argument_is_rejected() {
        let mut vm = Vm::new();
        assert!(compile(&mut vm, NIL, "at: k k <- 3").is_err());
    }

    #[test]
    fn test_super_send_uses_send_to_super() {
        let mut vm = Vm::new();
        let code = method_code(&mut vm, "test ^ super size");
        assert_eq!(code[0], I::PushArgument(0));
        assert_eq!(code[1], I::MarkArguments(1));
        assert!(matches!(code[2], I::SendToSuper(_)));
    }
}
