//! The bytecode interpreter: one large fetch-dispatch loop over the
//! current process, with linkage frames kept on the process stack.
//!
//! Frame layout at `link..link+4`: previous link, context or nil,
//! return point, method, saved bytecode offset. Temporaries sit above
//! the frame; arguments below it at `returnPoint..link-1`, receiver
//! first. The return value replaces the receiver slot.

use log::warn;

use crate::bytecode::{
    CONST_CONTEXT, CONST_FALSE, CONST_MINUS_ONE, CONST_NIL, CONST_TRUE, Opcode, Special,
};
use crate::compiler;
use crate::objects::{
    BLOCK_ARG_COUNT, BLOCK_ARG_LOCATION, BLOCK_BYTE_POSITION, BLOCK_CONTEXT, CLASS_SUPERCLASS,
    CONTEXT_ARGUMENTS, CONTEXT_LINK, CONTEXT_METHOD, CONTEXT_SLOTS, CONTEXT_TEMPORARIES,
    METHOD_BYTECODES, METHOD_CLASS, METHOD_LITERALS, METHOD_STACK_SIZE, METHOD_TEMP_SIZE,
    METHOD_WATCH, PROCESS_LINK, PROCESS_STACK, PROCESS_STACK_TOP, text_of,
};
use crate::oop::{NIL, Oop, fatal};
use crate::primitives;
use crate::vm::Vm;

const LINK_PREV: usize = 0;
const LINK_CONTEXT: usize = 1;
const LINK_RETURN_POINT: usize = 2;
const LINK_METHOD: usize = 3;
const LINK_PC: usize = 4;

/// Minimum number of slots a stack grows by.
const STACK_GROWTH_STEP: usize = 32;

pub const DEFAULT_STEP_SLICE: usize = 15000;

/// Run `process` for at most `max_steps` bytecodes. Answers true when
/// the process was suspended (slice spent or interrupt observed) and
/// false when its top-level method returned.
pub fn execute(vm: &mut Vm, process: Oop, max_steps: usize) -> bool {
    vm.mem.incr(process);
    let mut ex = Exec::load(vm, process);
    let live = ex.run(max_steps);
    vm.mem.decr(process);
    live
}

struct Exec<'a> {
    vm: &'a mut Vm,
    process: Oop,
    stack: Oop,
    top: usize,
    link: usize,
    method: Oop,
    context: Oop,
    literals: Oop,
    code: Vec<u8>,
    pc: usize,
}

impl<'a> Exec<'a> {
    fn load(vm: &'a mut Vm, process: Oop) -> Self {
        let stack = vm.mem.basic_at(process, PROCESS_STACK);
        let top = vm.mem.basic_at(process, PROCESS_STACK_TOP).int_value() as usize;
        let link = vm.mem.basic_at(process, PROCESS_LINK).int_value() as usize;
        let mut ex = Exec {
            vm,
            process,
            stack,
            top,
            link,
            method: NIL,
            context: NIL,
            literals: NIL,
            code: Vec::new(),
            pc: 1,
        };
        ex.reload_frame();
        ex
    }

    // ── stack primitives ──────────────────────────────────────────────

    #[inline]
    fn slot(&self, i: usize) -> Oop {
        self.vm.mem.basic_at(self.stack, i)
    }

    #[inline]
    fn set_slot(&mut self, i: usize, v: Oop) {
        self.vm.mem.basic_at_put(self.stack, i, v);
    }

    fn push(&mut self, v: Oop) {
        if self.top >= self.vm.mem.size_of(self.stack) as usize {
            self.grow(STACK_GROWTH_STEP);
        }
        self.top += 1;
        self.vm.mem.incr(v);
        self.set_slot(self.top, v);
    }

    /// Pop, transferring the slot's reference count to the caller.
    fn pop(&mut self) -> Oop {
        let v = self.slot(self.top);
        self.set_slot(self.top, NIL);
        self.top -= 1;
        v
    }

    fn drop_tos(&mut self) {
        let v = self.pop();
        self.vm.mem.decr(v);
    }

    fn grow(&mut self, needed: usize) {
        let len = self.vm.mem.size_of(self.stack) as usize;
        let new_len = len + needed.max(STACK_GROWTH_STEP);
        let class = self.vm.mem.class_of(self.stack);
        let bigger = self.vm.mem.alloc_word(new_len);
        self.vm.mem.set_class_field(bigger, class);
        for i in 1..=self.top {
            let v = self.slot(i);
            self.vm.mem.incr(v);
            self.vm.mem.basic_at_put(bigger, i, v);
        }
        self.vm.mem.field_at_put(self.process, PROCESS_STACK, bigger);
        self.stack = bigger;
    }

    // ── frame access ──────────────────────────────────────────────────

    fn frame_at(&self, off: usize) -> Oop {
        self.slot(self.link + off)
    }

    fn reload_frame(&mut self) {
        self.method = self.frame_at(LINK_METHOD);
        self.context = self.frame_at(LINK_CONTEXT);
        self.pc = self.frame_at(LINK_PC).int_value() as usize;
        self.literals = self.vm.mem.basic_at(self.method, METHOD_LITERALS);
        let bytes = self.vm.mem.basic_at(self.method, METHOD_BYTECODES);
        if bytes.is_nil() {
            fatal("method without bytecodes");
        }
        self.code = self.vm.mem.bytes_of(bytes).to_vec();
    }

    fn return_point(&self) -> usize {
        self.frame_at(LINK_RETURN_POINT).int_value() as usize
    }

    fn argument(&self, n: usize) -> Oop {
        if self.context.is_object() {
            let args = self.vm.mem.basic_at(self.context, CONTEXT_ARGUMENTS);
            self.vm.mem.basic_at(args, n + 1)
        } else {
            self.slot(self.return_point() + n)
        }
    }

    fn temporary(&self, n: usize) -> Oop {
        if self.context.is_object() {
            let temps = self.vm.mem.basic_at(self.context, CONTEXT_TEMPORARIES);
            self.vm.mem.basic_at(temps, n + 1)
        } else {
            self.slot(self.link + 5 + n)
        }
    }

    fn set_temporary(&mut self, n: usize, v: Oop) {
        if self.context.is_object() {
            let temps = self.vm.mem.basic_at(self.context, CONTEXT_TEMPORARIES);
            self.vm.mem.field_at_put(temps, n + 1, v);
        } else {
            let i = self.link + 5 + n;
            self.vm.mem.field_at_put(self.stack, i, v);
        }
    }

    fn suspend(&mut self) {
        let pc = self.pc;
        let i = self.link + LINK_PC;
        self.set_slot(i, Oop::new_integer(pc as i32));
        self.save_process();
    }

    fn save_process(&mut self) {
        let top = Oop::new_integer(self.top as i32);
        let link = Oop::new_integer(self.link as i32);
        self.vm.mem.basic_at_put(self.process, PROCESS_STACK_TOP, top);
        self.vm.mem.basic_at_put(self.process, PROCESS_LINK, link);
    }

    // ── the loop ──────────────────────────────────────────────────────

    fn fetch(&mut self) -> u8 {
        if self.pc == 0 || self.pc > self.code.len() {
            fatal("bytecode pointer out of range");
        }
        let b = self.code[self.pc - 1];
        self.pc += 1;
        b
    }

    fn run(&mut self, max_steps: usize) -> bool {
        let mut steps = max_steps as i64;
        let mut pending_rp: usize = 0;
        let mut just_marked = false;
        loop {
            if !just_marked {
                if steps <= 0 || self.vm.interrupt.observe_and_clear() {
                    self.suspend();
                    return true;
                }
            }
            just_marked = false;
            steps -= 1;

            let b = self.fetch();
            let (op, operand) = if b >> 4 == 0 {
                (Opcode::from_u8(b & 0x0f), self.fetch())
            } else {
                (Opcode::from_u8(b >> 4), b & 0x0f)
            };
            match op {
                Opcode::Extended => fatal("nested extended opcode"),
                Opcode::PushInstance => {
                    let recv = self.argument(0);
                    let v = self.vm.mem.basic_at(recv, operand as usize + 1);
                    self.push(v);
                }
                Opcode::PushArgument => {
                    let v = self.argument(operand as usize);
                    self.push(v);
                }
                Opcode::PushTemporary => {
                    let v = self.temporary(operand as usize);
                    self.push(v);
                }
                Opcode::PushLiteral => {
                    let v = self.vm.mem.basic_at(self.literals, operand as usize + 1);
                    self.push(v);
                }
                Opcode::PushConstant => {
                    let v = match operand {
                        0..=2 => Oop::new_integer(operand as i32),
                        CONST_MINUS_ONE => Oop::new_integer(-1),
                        CONST_NIL => NIL,
                        CONST_TRUE => self.vm.true_obj,
                        CONST_FALSE => self.vm.false_obj,
                        CONST_CONTEXT => self.materialize_context(),
                        _ => fatal("unknown push constant"),
                    };
                    self.push(v);
                }
                Opcode::AssignInstance => {
                    let v = self.slot(self.top);
                    let recv = self.argument(0);
                    self.vm.mem.field_at_put(recv, operand as usize + 1, v);
                }
                Opcode::AssignTemporary => {
                    let v = self.slot(self.top);
                    self.set_temporary(operand as usize, v);
                }
                Opcode::MarkArguments => {
                    pending_rp = self.top - operand as usize + 1;
                    // The send that follows must run in this slice.
                    steps += 1;
                    just_marked = true;
                }
                Opcode::SendMessage => {
                    let sel = self.vm.mem.basic_at(self.literals, operand as usize + 1);
                    self.send(sel, pending_rp, None);
                }
                Opcode::SendUnary => {
                    let receiver = self.slot(self.top);
                    if receiver.is_nil() {
                        self.drop_tos();
                        let v = self.vm.bool_oop(operand == 0);
                        self.push(v);
                    } else {
                        let sel = self.vm.unary_selectors[operand as usize];
                        self.send(sel, self.top, None);
                    }
                }
                Opcode::SendBinary => {
                    let idx = operand as usize;
                    let a = self.slot(self.top - 1);
                    let b = self.slot(self.top);
                    if idx < 13 && a.is_integer() && b.is_integer() {
                        let r = primitives::integer_binary(self.vm, 60 + idx as u8, a, b);
                        if !r.is_nil() {
                            self.drop_tos();
                            self.drop_tos();
                            self.push(r);
                            continue;
                        }
                    }
                    let sel = self.vm.binary_selectors[idx];
                    self.send(sel, self.top - 1, None);
                }
                Opcode::DoPrimitive => {
                    let argc = operand as usize;
                    let number = self.fetch();
                    match number {
                        16 => self.prim_eval_string(argc),
                        17 => self.prim_run_block(argc),
                        18 => {
                            if !self.prim_block_return() {
                                self.save_process();
                                return false;
                            }
                        }
                        19 => self.prim_run_process(argc, steps),
                        _ => {
                            let base = self.top - argc + 1;
                            let args: Vec<Oop> = (base..=self.top).map(|i| self.slot(i)).collect();
                            let r = primitives::dispatch(self.vm, number, &args);
                            self.vm.mem.incr(r);
                            for _ in 0..argc {
                                self.drop_tos();
                            }
                            self.push(r);
                            self.vm.mem.decr(r);
                        }
                    }
                }
                Opcode::DoSpecial => match Special::from_u8(operand) {
                    Special::SelfReturn => {
                        let v = self.argument(0);
                        self.vm.mem.incr(v);
                        if !self.do_return(v) {
                            self.save_process();
                            return false;
                        }
                    }
                    Special::StackReturn => {
                        let v = self.pop();
                        if !self.do_return(v) {
                            self.save_process();
                            return false;
                        }
                    }
                    Special::Duplicate => {
                        let v = self.slot(self.top);
                        self.push(v);
                    }
                    Special::PopTop => self.drop_tos(),
                    Special::Branch => {
                        let t = self.fetch();
                        self.pc = t as usize;
                    }
                    Special::BranchIfTrue => {
                        let t = self.fetch();
                        let v = self.pop();
                        if v == self.vm.true_obj {
                            self.pc = t as usize;
                        }
                        self.vm.mem.decr(v);
                    }
                    Special::BranchIfFalse => {
                        let t = self.fetch();
                        let v = self.pop();
                        if v == self.vm.false_obj {
                            self.pc = t as usize;
                        }
                        self.vm.mem.decr(v);
                    }
                    Special::AndBranch => {
                        let t = self.fetch();
                        let v = self.pop();
                        if v == self.vm.false_obj {
                            self.push(v);
                            self.pc = t as usize;
                        }
                        self.vm.mem.decr(v);
                    }
                    Special::OrBranch => {
                        let t = self.fetch();
                        let v = self.pop();
                        if v == self.vm.true_obj {
                            self.push(v);
                            self.pc = t as usize;
                        }
                        self.vm.mem.decr(v);
                    }
                    Special::SendToSuper => {
                        let lit = self.fetch();
                        let sel = self.vm.mem.basic_at(self.literals, lit as usize + 1);
                        let defining = self.vm.mem.basic_at(self.method, METHOD_CLASS);
                        let mut start = self.vm.mem.basic_at(defining, CLASS_SUPERCLASS);
                        if start.is_nil() {
                            start = defining;
                        }
                        self.send(sel, pending_rp, Some(start));
                    }
                },
            }
        }
    }

    // ── sends and returns ─────────────────────────────────────────────

    fn send(&mut self, selector: Oop, rp: usize, explicit_start: Option<Oop>) {
        let receiver = self.slot(rp);
        let lookup_class = explicit_start.unwrap_or_else(|| self.vm.mem.class_of(receiver));
        let (mut method, found_class) = match self.vm.find_method(lookup_class, selector) {
            Some(hit) => hit,
            None => self.send_not_recognized(selector, rp, receiver),
        };
        if self.vm.watching && !self.vm.mem.basic_at(method, METHOD_WATCH).is_nil() {
            method = self.substitute_watch(method, found_class, rp);
        }
        self.activate(method, rp);
    }

    /// Rewrite the send into `message:notRecognizedWithArguments:`.
    fn send_not_recognized(&mut self, selector: Oop, rp: usize, receiver: Oop) -> (Oop, Oop) {
        let argc = self.top - rp;
        let array = self.collect_args(rp, argc);
        for _ in 0..argc {
            self.drop_tos();
        }
        self.push(selector);
        self.push(array);
        let recovery = self.vm.intern("message:notRecognizedWithArguments:");
        let class = self.vm.mem.class_of(receiver);
        match self.vm.find_method(class, recovery) {
            Some(hit) => hit,
            None => {
                let name = String::from_utf8_lossy(text_of(&self.vm.mem, selector)).into_owned();
                fatal(&format!("message {name} not recognized, and no recovery method"));
            }
        }
    }

    /// Watch hook: divert to `watchWith:` on the defining class with the
    /// method and the original arguments.
    fn substitute_watch(&mut self, method: Oop, found_class: Oop, rp: usize) -> Oop {
        let argc = self.top - rp;
        let array = self.collect_args(rp, argc);
        for _ in 0..argc {
            self.drop_tos();
        }
        self.push(method);
        self.push(array);
        let selector = self.vm.intern("watchWith:");
        match self.vm.find_method(found_class, selector) {
            Some((m, _)) => m,
            None => fatal("watched method without watchWith: handler"),
        }
    }

    /// Fresh Array of the `argc` slots above `rp`.
    fn collect_args(&mut self, rp: usize, argc: usize) -> Oop {
        let class = self.vm.global("Array");
        let array = self.vm.mem.alloc_word(argc);
        self.vm.mem.set_class_field(array, class);
        for i in 0..argc {
            let v = self.slot(rp + 1 + i);
            self.vm.mem.field_at_put(array, i + 1, v);
        }
        array
    }

    fn activate(&mut self, method: Oop, rp: usize) {
        let pc = self.pc;
        let i = self.link + LINK_PC;
        self.set_slot(i, Oop::new_integer(pc as i32));

        let temp_size = self.vm.mem.basic_at(method, METHOD_TEMP_SIZE).int_value() as usize;
        let stack_size = self.vm.mem.basic_at(method, METHOD_STACK_SIZE).int_value() as usize;
        let needed = 6 + temp_size + stack_size;
        let free = self.vm.mem.size_of(self.stack) as usize - self.top;
        if free < needed {
            self.grow(needed);
        }

        let new_link = self.top + 1;
        let prev = Oop::new_integer(self.link as i32);
        self.push(prev);
        self.push(NIL);
        self.push(Oop::new_integer(rp as i32));
        self.push(method);
        self.push(Oop::new_integer(1));
        for _ in 0..temp_size {
            self.push(NIL);
        }
        self.link = new_link;
        self.reload_frame();
    }

    /// Unwind the current frame, leaving `value` (one owned count) at
    /// the return point. Answers false when the process is finished.
    fn do_return(&mut self, value: Oop) -> bool {
        let rp = self.return_point();
        let prev = self.frame_at(LINK_PREV);
        while self.top >= rp {
            self.drop_tos();
        }
        self.push(value);
        self.vm.mem.decr(value);
        if prev.is_nil() {
            return false;
        }
        self.link = prev.int_value() as usize;
        self.reload_frame();
        true
    }

    /// `PushConstant contextConst`: the current frame's context object,
    /// materialized once per activation with copies of the arguments and
    /// temporaries.
    fn materialize_context(&mut self) -> Oop {
        if self.context.is_object() {
            return self.context;
        }
        let class = self.vm.global("Context");
        let array_class = self.vm.global("Array");
        let rp = self.return_point();
        let argc = self.link - rp;
        let temp_size = self.vm.mem.basic_at(self.method, METHOD_TEMP_SIZE).int_value() as usize;

        let args = self.vm.mem.alloc_word(argc);
        self.vm.mem.set_class_field(args, array_class);
        for i in 0..argc {
            let v = self.slot(rp + i);
            self.vm.mem.field_at_put(args, i + 1, v);
        }
        let temps = self.vm.mem.alloc_word(temp_size);
        self.vm.mem.set_class_field(temps, array_class);
        for i in 0..temp_size {
            let v = self.slot(self.link + 5 + i);
            self.vm.mem.field_at_put(temps, i + 1, v);
        }

        let ctx = self.vm.mem.alloc_word(CONTEXT_SLOTS);
        self.vm.mem.set_class_field(ctx, class);
        self.vm
            .mem
            .basic_at_put(ctx, CONTEXT_LINK, Oop::new_integer(self.link as i32));
        self.vm.mem.field_at_put(ctx, CONTEXT_METHOD, self.method);
        self.vm.mem.field_at_put(ctx, CONTEXT_ARGUMENTS, args);
        self.vm.mem.field_at_put(ctx, CONTEXT_TEMPORARIES, temps);

        let i = self.link + LINK_CONTEXT;
        self.vm.mem.field_at_put(self.stack, i, ctx);
        self.context = ctx;
        ctx
    }

    // ── in-loop primitives (16..19) ───────────────────────────────────

    /// Primitive 16: compile the argument string as a doIt and activate
    /// it with the string as receiver.
    fn prim_eval_string(&mut self, argc: usize) {
        let rp = self.top - argc + 1;
        let receiver = self.slot(rp);
        let text = String::from_utf8_lossy(text_of(&self.vm.mem, receiver)).into_owned();
        let class = self.vm.mem.class_of(receiver);
        match compiler::compile_body(self.vm, class, &text, "doIt") {
            Ok(method) => self.activate(method, rp),
            Err(e) => {
                warn!("eval failed: {e}");
                for _ in 0..argc {
                    self.drop_tos();
                }
                self.push(NIL);
            }
        }
    }

    /// Primitive 17: run a bound block. Arguments land in the creator
    /// context's temporaries at the block's argument location.
    fn prim_run_block(&mut self, argc: usize) {
        let rp = self.top - argc + 1;
        let block = self.slot(rp);
        let ctx = self.vm.mem.basic_at(block, BLOCK_CONTEXT);
        if !ctx.is_object() {
            fatal("run of a block without a context");
        }
        let expected = self.vm.mem.basic_at(block, BLOCK_ARG_COUNT).int_value() as usize;
        let supplied = argc - 1;
        if supplied != expected {
            warn!("block expected {expected} arguments, got {supplied}");
            for _ in 0..argc {
                self.drop_tos();
            }
            self.push(NIL);
            return;
        }
        let arg_location = self.vm.mem.basic_at(block, BLOCK_ARG_LOCATION).int_value() as usize;
        let temps = self.vm.mem.basic_at(ctx, CONTEXT_TEMPORARIES);
        for i in 0..supplied {
            let v = self.slot(rp + 1 + i);
            self.vm.mem.field_at_put(temps, arg_location + i + 1, v);
        }

        let pc = self.pc;
        let i = self.link + LINK_PC;
        self.set_slot(i, Oop::new_integer(pc as i32));

        let method = self.vm.mem.basic_at(ctx, CONTEXT_METHOD);
        let stack_size = self.vm.mem.basic_at(method, METHOD_STACK_SIZE).int_value() as usize;
        let free = self.vm.mem.size_of(self.stack) as usize - self.top;
        if free < 6 + stack_size {
            self.grow(6 + stack_size);
        }

        let start = self.vm.mem.basic_at(block, BLOCK_BYTE_POSITION).int_value();
        let new_link = self.top + 1;
        let prev = Oop::new_integer(self.link as i32);
        self.push(prev);
        self.push(ctx);
        self.push(Oop::new_integer(rp as i32));
        self.push(method);
        self.push(Oop::new_integer(start));
        self.link = new_link;
        self.reload_frame();
    }

    /// Primitive 18: non-local return. Adopt the creating frame's
    /// previous link and return point, then return `value` through it.
    fn prim_block_return(&mut self) -> bool {
        let value = self.pop();
        if !self.context.is_object() {
            fatal("block return outside a block");
        }
        let creator = self.vm.mem.basic_at(self.context, CONTEXT_LINK).int_value() as usize;
        let creator_method = self.vm.mem.basic_at(self.context, CONTEXT_METHOD);
        if creator == 0
            || creator + LINK_PC > self.top
            || self.slot(creator + LINK_METHOD) != creator_method
        {
            fatal("block return after its method already returned");
        }
        let prev = self.slot(creator + LINK_PREV);
        let rp = self.slot(creator + LINK_RETURN_POINT);
        let i = self.link + LINK_PREV;
        self.vm.mem.field_at_put(self.stack, i, prev);
        let i = self.link + LINK_RETURN_POINT;
        self.vm.mem.basic_at_put(self.stack, i, rp);
        self.do_return(value)
    }

    /// Primitive 19: run another process inside the remaining slice.
    /// Answers whether it is still runnable.
    fn prim_run_process(&mut self, argc: usize, steps_left: i64) {
        let rp = self.top - argc + 1;
        let proc = self.slot(rp);
        let budget = steps_left.max(1) as usize;
        let live = execute(self.vm, proc, budget);
        for _ in 0..argc {
            self.drop_tos();
        }
        let v = self.vm.bool_oop(live);
        self.push(v);
    }
}
