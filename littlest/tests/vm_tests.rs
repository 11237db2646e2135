//! End-to-end scenarios: compile real method source, run it on a
//! process, and look at what comes back.

use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use littlest::{
    Instruction, METHOD_BYTECODES, NIL, ObjectMemory, Oop, PROCESS_STACK, Vm, add_method,
    bootstrap_classes, compile, decode_all, dispatch, execute, install_method, new_class,
    new_process, read_image, text_of, write_image,
};

/// Console sink the test can read back after the VM wrote to it.
#[derive(Clone, Default)]
struct Sink(Arc<Mutex<Vec<u8>>>);

impl Sink {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn boot() -> Vm {
    let mut vm = Vm::new();
    bootstrap_classes(&mut vm);
    vm
}

/// Run a no-argument method to completion and answer its result. The
/// process is kept alive so the answer stays valid.
fn run_selector(vm: &mut Vm, class: Oop, receiver: Oop, selector: &str) -> Oop {
    let sel = vm.intern(selector);
    let (method, _) = vm.find_method(class, sel).expect("selector not found");
    let process = new_process(vm, method, receiver);
    vm.mem.incr(process);
    while execute(vm, process, 200_000) {}
    let stack = vm.mem.basic_at(process, PROCESS_STACK);
    vm.mem.basic_at(stack, 1)
}

#[test]
fn test_arithmetic_with_overflow_fallback() {
    let mut vm = boot();
    let object = vm.global("Object");
    let integer = vm.global("Integer");
    add_method(&mut vm, object, "go ^ 3 + 4").unwrap();
    add_method(&mut vm, object, "big ^ 16383 + 1").unwrap();
    add_method(&mut vm, integer, "+ aNumber ^ 'overflow'").unwrap();

    let undefined = vm.global("UndefinedObject");
    assert_eq!(
        run_selector(&mut vm, undefined, NIL, "go"),
        Oop::new_integer(7)
    );

    // Past the small-integer range the fast path declines and the send
    // reaches the method on Integer.
    let fallback = run_selector(&mut vm, undefined, NIL, "big");
    assert_eq!(vm.mem.class_of(fallback), vm.global("String"));
    assert_eq!(text_of(&vm.mem, fallback), b"overflow");
}

#[test]
fn test_hierarchy_dispatch_and_cache_invalidation() {
    let mut vm = boot();
    let animal = new_class(&mut vm, "Animal", "Object", &[]);
    add_method(&mut vm, animal, "speak ^ 1").unwrap();
    let dog = new_class(&mut vm, "Dog", "Animal", &[]);

    let rex = vm.mem.alloc_word(0);
    vm.mem.set_class_field(rex, dog);
    vm.mem.incr(rex);

    // Inherited lookup walks to Animal and lands in the cache.
    assert_eq!(
        run_selector(&mut vm, dog, rex, "speak"),
        Oop::new_integer(1)
    );

    // An override on Dog must flush that cache line.
    add_method(&mut vm, dog, "speak ^ 2").unwrap();
    assert_eq!(
        run_selector(&mut vm, dog, rex, "speak"),
        Oop::new_integer(2)
    );
}

#[test]
fn test_block_captures_its_temporaries() {
    let mut vm = boot();
    let block_class = vm.global("Block");
    add_method(&mut vm, block_class, "value ^ <17 self>").unwrap();
    let object = vm.global("Object");
    add_method(
        &mut vm,
        object,
        "run | c b | c <- 0. b <- [ c <- c + 1 ]. b value. b value. b value. ^ c",
    )
    .unwrap();

    let undefined = vm.global("UndefinedObject");
    assert_eq!(
        run_selector(&mut vm, undefined, NIL, "run"),
        Oop::new_integer(3)
    );
}

#[test]
fn test_conditionals_compile_to_branches() {
    let mut vm = boot();
    let object = vm.global("Object");
    let method = compile(
        &mut vm,
        object,
        "sign: x x < 0 ifTrue: [^ 1] ifFalse: [^ 0]",
    )
    .unwrap();
    vm.mem.incr(method);
    install_method(&mut vm, object, method);
    let bytes = vm.mem.basic_at(method, METHOD_BYTECODES);
    let instructions = decode_all(vm.mem.bytes_of(bytes));
    assert!(
        instructions
            .iter()
            .any(|i| matches!(i, Instruction::BranchIfFalse(_)))
    );
    assert!(instructions.contains(&Instruction::SendBinary(2)));
    assert!(
        !instructions
            .iter()
            .any(|i| matches!(i, Instruction::SendMessage(_)))
    );

    add_method(&mut vm, object, "goNeg ^ self sign: -2").unwrap();
    add_method(&mut vm, object, "goPos ^ self sign: 5").unwrap();
    let undefined = vm.global("UndefinedObject");
    assert_eq!(
        run_selector(&mut vm, undefined, NIL, "goNeg"),
        Oop::new_integer(1)
    );
    assert_eq!(
        run_selector(&mut vm, undefined, NIL, "goPos"),
        Oop::new_integer(0)
    );
}

#[test]
fn test_eval_string_primitive() {
    let mut vm = boot();
    let object = vm.global("Object");
    add_method(&mut vm, object, "eval ^ <16 '^ 2 * 3'>").unwrap();
    let undefined = vm.global("UndefinedObject");
    assert_eq!(
        run_selector(&mut vm, undefined, NIL, "eval"),
        Oop::new_integer(6)
    );
}

#[test]
fn test_image_round_trip_runs_the_saved_process() {
    let mut vm = boot();
    let object = vm.global("Object");
    add_method(&mut vm, object, "greet <14 'hello'>").unwrap();
    let sel = vm.intern("greet");
    let (method, _) = vm.find_method(object, sel).unwrap();
    let process = new_process(&mut vm, method, NIL);
    vm.set_global("systemProcess", process);
    let live_before = vm.mem.object_count();

    let mut buf = Vec::new();
    write_image(&vm.mem, vm.symbols, &[], &mut buf).unwrap();

    let mut mem = ObjectMemory::new();
    let symbols = read_image(&mut mem, &mut buf.as_slice()).unwrap();
    assert_eq!(mem.object_count(), live_before);

    let sink = Sink::default();
    let mut vm2 = Vm::new();
    vm2.adopt(mem, symbols);
    vm2.console = Box::new(sink.clone());

    let proc2 = vm2.global("systemProcess");
    assert!(proc2.is_object());
    while execute(&mut vm2, proc2, 200_000) {}
    assert_eq!(sink.text(), "hello\n");
}

#[test]
fn test_reload_folds_unreachable_objects() {
    let mut vm = boot();
    let live_before = vm.mem.object_count();

    // Positive counts with no path from the symbols root.
    let garbage = vm.mem.alloc_word(2);
    vm.mem.incr(garbage);
    let child = vm.mem.alloc_string("orphan");
    vm.mem.field_at_put(garbage, 1, child);
    assert_eq!(vm.mem.object_count(), live_before + 2);

    let mut buf = Vec::new();
    write_image(&vm.mem, vm.symbols, &[], &mut buf).unwrap();

    let mut mem = ObjectMemory::new();
    let symbols = read_image(&mut mem, &mut buf.as_slice()).unwrap();
    assert_eq!(mem.object_count(), live_before);

    let mut vm2 = Vm::new();
    vm2.adopt(mem, symbols);
    assert!(vm2.global("Object").is_object());
    assert!(vm2.global("true").is_object());
}

#[test]
fn test_queued_block_comes_back_through_the_primitive() {
    let mut vm = boot();
    let block = vm.mem.alloc_word(4);
    vm.mem.incr(block);
    vm.run_queue.enqueue(block);
    assert_eq!(dispatch(&mut vm, 6, &[]), block);
    assert_eq!(dispatch(&mut vm, 6, &[]), NIL);
}
