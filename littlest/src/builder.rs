//! Bootstrap and source loading: grow an empty memory into a working
//! class hierarchy, compile method definitions from a source file, and
//! wrap methods in runnable processes.

use log::{debug, info};
use thiserror::Error;

use crate::compiler::{self, CompileError};
use crate::interpreter::{self, DEFAULT_STEP_SLICE};
use crate::objects::{
    self, CLASS_METHODS, CLASS_NAME, CLASS_SIZE, CLASS_SLOTS, CLASS_SUPERCLASS, CLASS_VARIABLES,
    METHOD_TEMP_SIZE, PROCESS_LINK, PROCESS_SLOTS, PROCESS_STACK, PROCESS_STACK_TOP,
};
use crate::oop::{NIL, Oop};
use crate::primitives::install_method;
use crate::vm::Vm;

const METHOD_DICT_BUCKETS: usize = 39;
const INITIAL_STACK_SLOTS: usize = 50;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("line {line}: unknown class {name}")]
    UnknownClass { line: usize, name: String },
    #[error("line {line}: unrecognized directive: {text}")]
    BadDirective { line: usize, text: String },
    #[error("unterminated Methods section for {name}")]
    Unterminated { name: String },
}

/// Name, named instance variable count, superclass. Order matters: a
/// superclass precedes its subclasses so `CLASS_SIZE` chains resolve.
const BOOT_CLASSES: [(&str, usize, Option<&str>); 19] = [
    ("Object", 0, None),
    ("Class", CLASS_SLOTS, Some("Object")),
    ("UndefinedObject", 0, Some("Object")),
    ("Boolean", 0, Some("Object")),
    ("True", 0, Some("Boolean")),
    ("False", 0, Some("Boolean")),
    ("Integer", 0, Some("Object")),
    ("Float", 0, Some("Object")),
    ("Char", 1, Some("Object")),
    ("String", 0, Some("Object")),
    ("Symbol", 0, Some("String")),
    ("ByteArray", 0, Some("Object")),
    ("Array", 0, Some("Object")),
    ("Link", 3, Some("Object")),
    ("Dictionary", 1, Some("Object")),
    ("Block", 4, Some("Object")),
    ("Method", 8, Some("Object")),
    ("Context", 4, Some("Object")),
    ("Process", PROCESS_SLOTS, Some("Object")),
];

/// Build the core hierarchy in a fresh VM. The symbols dictionary (and
/// its bucket table) exist before any class does, so a patch pass gives
/// them their classes afterwards.
pub fn bootstrap_classes(vm: &mut Vm) {
    let mut classes: Vec<(&str, Oop)> = Vec::with_capacity(BOOT_CLASSES.len());
    for (name, _, _) in BOOT_CLASSES {
        let c = vm.mem.alloc_word(CLASS_SLOTS);
        vm.mem.incr(c);
        classes.push((name, c));
    }
    let find = |classes: &[(&str, Oop)], name: &str| -> Oop {
        classes
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, c)| *c)
            .unwrap_or(NIL)
    };
    let class_class = find(&classes, "Class");
    for (_, c) in &classes {
        vm.mem.set_class_field(*c, class_class);
    }

    let symbol_class = find(&classes, "Symbol");
    let link_class = find(&classes, "Link");
    let dict_class = find(&classes, "Dictionary");
    let array_class = find(&classes, "Array");

    // The symbols dictionary predates its own class.
    let symbols = vm.symbols;
    vm.mem.set_class_field(symbols, dict_class);
    let table = vm.mem.basic_at(symbols, objects::DICT_TABLE);
    vm.mem.set_class_field(table, array_class);

    for (name, ivars, superclass) in BOOT_CLASSES {
        let c = find(&classes, name);
        let sym =
            objects::intern_symbol(&mut vm.mem, symbols, name, symbol_class, link_class);
        vm.mem.field_at_put(c, CLASS_NAME, sym);
        let super_oop = superclass.map(|s| find(&classes, s)).unwrap_or(NIL);
        let inherited = if super_oop.is_nil() {
            0
        } else {
            vm.mem.basic_at(super_oop, CLASS_SIZE).int_value().max(0) as usize
        };
        vm.mem
            .field_at_put(c, CLASS_SIZE, Oop::new_integer((inherited + ivars) as i32));
        let methods =
            objects::dictionary_new(&mut vm.mem, METHOD_DICT_BUCKETS, dict_class, array_class);
        vm.mem.field_at_put(c, CLASS_METHODS, methods);
        vm.mem.field_at_put(c, CLASS_SUPERCLASS, super_oop);
        objects::dict_set(&mut vm.mem, symbols, sym, c, link_class);
    }
    for (_, c) in &classes {
        vm.mem.decr(*c);
    }

    // nil's class; the entry is pinned so this edge survives every load.
    let undefined = find(&classes, "UndefinedObject");
    vm.mem.set_class_field(NIL, undefined);

    let true_class = find(&classes, "True");
    let t = vm.mem.alloc_word(0);
    vm.mem.set_class_field(t, true_class);
    vm.set_global("true", t);
    let false_class = find(&classes, "False");
    let f = vm.mem.alloc_word(0);
    vm.mem.set_class_field(f, false_class);
    vm.set_global("false", f);

    vm.init_specials();
    debug!("bootstrap: {} objects live", vm.mem.object_count());
}

/// Define a class, bind it as a global, and answer it.
pub fn new_class(vm: &mut Vm, name: &str, superclass_name: &str, ivars: &[&str]) -> Oop {
    let class_class = vm.global("Class");
    let dict_class = vm.global("Dictionary");
    let array_class = vm.global("Array");
    let super_oop = vm.global(superclass_name);

    let c = vm.mem.alloc_word(CLASS_SLOTS);
    vm.mem.set_class_field(c, class_class);
    vm.mem.incr(c);
    let sym = vm.intern(name);
    vm.mem.field_at_put(c, CLASS_NAME, sym);
    let inherited = if super_oop.is_nil() {
        0
    } else {
        vm.mem.basic_at(super_oop, CLASS_SIZE).int_value().max(0) as usize
    };
    vm.mem.field_at_put(
        c,
        CLASS_SIZE,
        Oop::new_integer((inherited + ivars.len()) as i32),
    );
    let methods = objects::dictionary_new(&mut vm.mem, METHOD_DICT_BUCKETS, dict_class, array_class);
    vm.mem.field_at_put(c, CLASS_METHODS, methods);
    vm.mem.field_at_put(c, CLASS_SUPERCLASS, super_oop);
    if !ivars.is_empty() {
        let syms: Vec<Oop> = ivars.iter().map(|v| vm.intern(v)).collect();
        let vars = objects::new_array(&mut vm.mem, array_class, &syms);
        vm.mem.field_at_put(c, CLASS_VARIABLES, vars);
    }
    vm.set_global(name, c);
    vm.mem.decr(c);
    c
}

/// Compile `source` as a method of `class` and install it.
pub fn add_method(vm: &mut Vm, class: Oop, source: &str) -> Result<(), CompileError> {
    let method = compiler::compile(vm, class, source)?;
    install_method(vm, class, method);
    Ok(())
}

/// A runnable process whose first activation is `method` with the given
/// receiver and no arguments.
pub fn new_process(vm: &mut Vm, method: Oop, receiver: Oop) -> Oop {
    let array_class = vm.global("Array");
    let process_class = vm.global("Process");
    let temp_size = vm.mem.basic_at(method, METHOD_TEMP_SIZE).int_value().max(0) as usize;

    let stack = vm.mem.alloc_word(INITIAL_STACK_SLOTS.max(8 + temp_size));
    vm.mem.set_class_field(stack, array_class);
    // Receiver at the return point, frame at slot 2.
    vm.mem.field_at_put(stack, 1, receiver);
    vm.mem.field_at_put(stack, 2, NIL);
    vm.mem.field_at_put(stack, 3, NIL);
    vm.mem.field_at_put(stack, 4, Oop::new_integer(1));
    vm.mem.field_at_put(stack, 5, method);
    vm.mem.field_at_put(stack, 6, Oop::new_integer(1));

    let p = vm.mem.alloc_word(PROCESS_SLOTS);
    vm.mem.set_class_field(p, process_class);
    vm.mem.field_at_put(p, PROCESS_STACK, stack);
    vm.mem
        .field_at_put(p, PROCESS_STACK_TOP, Oop::new_integer((6 + temp_size) as i32));
    vm.mem.field_at_put(p, PROCESS_LINK, Oop::new_integer(2));
    p
}

/// Compile a statement line and run it to completion on a scratch
/// process.
pub fn run_line(vm: &mut Vm, text: &str) -> Result<(), CompileError> {
    let undefined = vm.global("UndefinedObject");
    let method = compiler::compile_body(vm, undefined, text, "doIt")?;
    vm.mem.incr(method);
    let p = new_process(vm, method, NIL);
    vm.mem.incr(p);
    while interpreter::execute(vm, p, DEFAULT_STEP_SLICE) {}
    vm.mem.decr(p);
    vm.mem.decr(method);
    Ok(())
}

/// Load a class-and-method source file.
///
/// Line directives:
///   `*` comment
///   `Class Name Superclass var...`    define a class
///   `Methods Name`                    start a method section; methods
///                                     are separated by a bare `|` line
///                                     and the section ends with `]`
///   `! statements`                    compile and run immediately
pub fn load_source(vm: &mut Vm, text: &str) -> Result<(), BuildError> {
    let mut lines = text.lines().enumerate();
    while let Some((idx, raw)) = lines.next() {
        let line = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('*') {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix('!') {
            run_line(vm, rest)?;
            continue;
        }
        let mut words = trimmed.split_whitespace();
        match words.next() {
            Some("Class") => {
                let name = words.next().ok_or_else(|| BuildError::BadDirective {
                    line,
                    text: trimmed.into(),
                })?;
                let superclass = words.next().unwrap_or("Object");
                let ivars: Vec<&str> = words.collect();
                new_class(vm, name, superclass, &ivars);
                debug!("class {name} ({superclass})");
            }
            Some("Methods") => {
                let name = words.next().ok_or_else(|| BuildError::BadDirective {
                    line,
                    text: trimmed.into(),
                })?;
                let class = vm.global(name);
                if class.is_nil() {
                    return Err(BuildError::UnknownClass {
                        line,
                        name: name.into(),
                    });
                }
                let mut body = String::new();
                let mut closed = false;
                let mut count = 0;
                for (_, method_line) in lines.by_ref() {
                    let t = method_line.trim();
                    if t == "]" || t == "|" {
                        if !body.trim().is_empty() {
                            add_method(vm, class, &body)?;
                            count += 1;
                        }
                        body.clear();
                        if t == "]" {
                            closed = true;
                            break;
                        }
                    } else {
                        body.push_str(method_line);
                        body.push('\n');
                    }
                }
                if !closed {
                    return Err(BuildError::Unterminated { name: name.into() });
                }
                info!("{count} methods on {name}");
            }
            _ => {
                return Err(BuildError::BadDirective {
                    line,
                    text: trimmed.into(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::text_of;

    #[test]
    fn test_bootstrap_wires_the_hierarchy() {
        let mut vm = Vm::new();
        bootstrap_classes(&mut vm);
        let integer = vm.global("Integer");
        assert!(integer.is_object());
        assert_eq!(vm.mem.class_of(Oop::new_integer(3)), integer);
        let symbol = vm.global("Symbol");
        let string = vm.global("String");
        assert_eq!(vm.mem.basic_at(symbol, CLASS_SUPERCLASS), string);
        let name = vm.mem.basic_at(symbol, CLASS_NAME);
        assert_eq!(text_of(&vm.mem, name), b"Symbol");
        assert_eq!(vm.mem.class_of(NIL), vm.global("UndefinedObject"));
        assert!(vm.true_obj.is_object());
        assert_ne!(vm.true_obj, vm.false_obj);
    }

    #[test]
    fn test_new_class_inherits_slot_count() {
        let mut vm = Vm::new();
        bootstrap_classes(&mut vm);
        let point = new_class(&mut vm, "Point", "Object", &["x", "y"]);
        assert_eq!(vm.mem.basic_at(point, CLASS_SIZE), Oop::new_integer(2));
        let point3 = new_class(&mut vm, "Point3", "Point", &["z"]);
        assert_eq!(vm.mem.basic_at(point3, CLASS_SIZE), Oop::new_integer(3));
        assert_eq!(vm.global("Point3"), point3);
    }

    #[test]
    fn test_method_install_and_dispatch() {
        let mut vm = Vm::new();
        bootstrap_classes(&mut vm);
        let object = vm.global("Object");
        add_method(&mut vm, object, "double: x ^ x + x").unwrap();
        let selector = vm.intern("double:");
        let (method, found) = vm.find_method(object, selector).unwrap();
        assert!(method.is_object());
        assert_eq!(found, object);
        // A second lookup comes from the cache and agrees.
        assert_eq!(vm.find_method(object, selector).unwrap().0, method);
    }

    #[test]
    fn test_load_source_defines_and_runs() {
        let mut vm = Vm::new();
        bootstrap_classes(&mut vm);
        let src = "\
* a comment line
Class Counter Object count
Methods Counter
  bump ^ 3 + 4
|
  reset ^ 0
]
";
        load_source(&mut vm, src).unwrap();
        let counter = vm.global("Counter");
        assert!(counter.is_object());
        let selector = vm.intern("bump");
        assert!(vm.find_method(counter, selector).is_some());
    }

    #[test]
    fn test_unknown_class_is_reported() {
        let mut vm = Vm::new();
        bootstrap_classes(&mut vm);
        let err = load_source(&mut vm, "Methods Nowhere\n]\n").unwrap_err();
        assert!(matches!(err, BuildError::UnknownClass { .. }));
    }
}
