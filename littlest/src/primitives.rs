//! Numbered primitives. Primitives never fail: anything out of range,
//! mistyped, or overflowing answers nil and lets the image decide what
//! that means.
//!
//! Numbers 16..19 touch linkage frames and live in the interpreter
//! loop; everything else dispatches here.

use std::io::Write;
use std::process::Command;

use log::warn;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

use crate::compiler;
use crate::memory::FREE_LIST_MAX;
use crate::objects::{
    self, BLOCK_ARG_COUNT, BLOCK_ARG_LOCATION, BLOCK_BYTE_POSITION, BLOCK_CONTEXT, BLOCK_SLOTS,
    CLASS_METHODS, METHOD_MESSAGE, text_of,
};
use crate::oop::{NIL, Oop, fatal, long_can_be_int};
use crate::vm::Vm;

fn arg(args: &[Oop], i: usize) -> Oop {
    args.get(i).copied().unwrap_or(NIL)
}

fn int_of(o: Oop) -> Option<i32> {
    if o.is_integer() { Some(o.int_value()) } else { None }
}

fn float_of(vm: &Vm, o: Oop) -> Option<f64> {
    if o.is_object() && vm.mem.size_of(o) == -8 {
        Some(objects::float_value(&vm.mem, o))
    } else {
        None
    }
}

fn text_arg(vm: &Vm, o: Oop) -> Option<Vec<u8>> {
    if o.is_object() && vm.mem.size_of(o) < 0 {
        Some(text_of(&vm.mem, o).to_vec())
    } else {
        None
    }
}

fn int_or_nil(v: i64) -> Oop {
    if long_can_be_int(v) {
        Oop::new_integer(v as i32)
    } else {
        NIL
    }
}

pub fn dispatch(vm: &mut Vm, number: u8, args: &[Oop]) -> Oop {
    match number {
        // ── nullary ───────────────────────────────────────────────────
        1 => Oop::new_integer(vm.mem.object_count() as i32),
        2 => Oop::new_integer(vm.mem.free_count() as i32),
        3 => Oop::new_integer(vm.rng.gen_range(0..=crate::oop::INT_LIMIT as i32)),
        4 => int_or_nil(vm.started.elapsed().as_secs() as i64),
        5 => vm.false_obj,
        6 => vm.run_queue.try_dequeue().unwrap_or(NIL),
        7 => std::process::exit(0),

        // ── unary object ──────────────────────────────────────────────
        10 => {
            let class = arg(args, 0);
            let mut count = 0;
            for idx in 0..crate::memory::OBJECT_TABLE_SIZE {
                let e = vm.mem.entry_at(idx);
                if e.refcount != 0 && e.class == class {
                    count += 1;
                }
            }
            Oop::new_integer(count)
        }
        11 => vm.mem.class_of(arg(args, 0)),
        12 => {
            let o = arg(args, 0);
            if o.is_integer() {
                Oop::new_integer(0)
            } else {
                Oop::new_integer(vm.mem.size_of(o).unsigned_abs() as i32)
            }
        }
        13 => {
            let o = arg(args, 0);
            if o.is_integer() {
                o
            } else if vm.mem.size_of(o) < 0 {
                int_or_nil(objects::string_hash(text_of(&vm.mem, o)) as i64)
            } else {
                Oop::new_integer(o.ref_index() as i32)
            }
        }
        14 => {
            let o = arg(args, 0);
            if let Some(text) = text_arg(vm, o) {
                let _ = vm.console.write_all(&text);
                let _ = vm.console.write_all(b"\n");
                let _ = vm.console.flush();
            }
            o
        }
        15 => match int_of(arg(args, 0)) {
            Some(v) => {
                let class = vm.global("Char");
                objects::new_char(&mut vm.mem, class, v)
            }
            None => NIL,
        },

        // ── binary object ─────────────────────────────────────────────
        20 | 30 => NIL,
        21 | 73 => vm.bool_oop(arg(args, 0) == arg(args, 1)),
        22 => {
            let o = arg(args, 0);
            let class = arg(args, 1);
            if o.is_object() {
                vm.mem.set_class_field(o, class);
                o
            } else {
                NIL
            }
        }
        23 => {
            let (Some(a), Some(b)) = (text_arg(vm, arg(args, 0)), text_arg(vm, arg(args, 1)))
            else {
                return NIL;
            };
            let mut joined = String::from_utf8_lossy(&a).into_owned();
            joined.push_str(&String::from_utf8_lossy(&b));
            let class = vm.mem.class_of(arg(args, 0));
            objects::new_string(&mut vm.mem, class, &joined)
        }
        24 => {
            let o = arg(args, 0);
            match int_of(arg(args, 1)) {
                Some(i) if o.is_object() && i >= 1 && i <= vm.mem.size_of(o) as i32 => {
                    vm.mem.basic_at(o, i as usize)
                }
                _ => NIL,
            }
        }
        25 => {
            let o = arg(args, 0);
            match int_of(arg(args, 1)) {
                Some(i) if o.is_object() && vm.mem.size_of(o) < 0 => {
                    let len = (-vm.mem.size_of(o)) as i32;
                    if i >= 1 && i <= len {
                        Oop::new_integer(vm.mem.byte_at(o, i as usize) as i32)
                    } else {
                        NIL
                    }
                }
                _ => NIL,
            }
        }
        26 => {
            let key = arg(args, 0);
            let value = arg(args, 1);
            // Dictionary keys hash by text, so only byte objects qualify.
            if !key.is_object() || vm.mem.size_of(key) >= 0 {
                return NIL;
            }
            let link_class = vm.global("Link");
            let symbols = vm.symbols;
            objects::dict_set(&mut vm.mem, symbols, key, value, link_class);
            value
        }
        27 => {
            let block = arg(args, 0);
            match int_of(arg(args, 1)) {
                Some(pos) if block.is_object() => {
                    vm.mem
                        .basic_at_put(block, BLOCK_BYTE_POSITION, Oop::new_integer(pos));
                    block
                }
                _ => NIL,
            }
        }
        28 => {
            let block = arg(args, 0);
            let context = arg(args, 1);
            if !block.is_object() {
                return NIL;
            }
            let class = vm.mem.class_of(block);
            let bound = vm.mem.alloc_word(BLOCK_SLOTS);
            vm.mem.set_class_field(bound, class);
            for slot in [BLOCK_BYTE_POSITION, BLOCK_ARG_COUNT, BLOCK_ARG_LOCATION] {
                let v = vm.mem.basic_at(block, slot);
                vm.mem.field_at_put(bound, slot, v);
            }
            vm.mem.field_at_put(bound, BLOCK_CONTEXT, context);
            bound
        }

        // ── ternary object ────────────────────────────────────────────
        31 => {
            let o = arg(args, 0);
            let v = arg(args, 2);
            match int_of(arg(args, 1)) {
                Some(i) if o.is_object() && i >= 1 && i <= vm.mem.size_of(o) as i32 => {
                    vm.mem.field_at_put(o, i as usize, v);
                    v
                }
                _ => NIL,
            }
        }
        32 => {
            let o = arg(args, 0);
            match (int_of(arg(args, 1)), int_of(arg(args, 2))) {
                (Some(i), Some(b)) if o.is_object() && vm.mem.size_of(o) < 0 => {
                    let len = (-vm.mem.size_of(o)) as i32;
                    if i >= 1 && i <= len && (0..=255).contains(&b) {
                        vm.mem.byte_at_put(o, i as usize, b as u8);
                        Oop::new_integer(b)
                    } else {
                        NIL
                    }
                }
                _ => NIL,
            }
        }
        33 => {
            let Some(text) = text_arg(vm, arg(args, 0)) else {
                return NIL;
            };
            match (int_of(arg(args, 1)), int_of(arg(args, 2))) {
                (Some(from), Some(to))
                    if from >= 1 && to <= text.len() as i32 && from <= to + 1 =>
                {
                    let slice = &text[(from - 1) as usize..to as usize];
                    let class = vm.mem.class_of(arg(args, 0));
                    objects::new_string(&mut vm.mem, class, &String::from_utf8_lossy(slice))
                }
                _ => NIL,
            }
        }
        34 => {
            let class = arg(args, 0);
            let Some(text) = text_arg(vm, arg(args, 1)) else {
                return vm.false_obj;
            };
            let source = String::from_utf8_lossy(&text).into_owned();
            match compiler::compile(vm, class, &source) {
                Ok(method) => {
                    install_method(vm, class, method);
                    vm.true_obj
                }
                Err(e) => {
                    warn!("compile failed: {e}");
                    vm.false_obj
                }
            }
        }

        // ── conversion / allocation ───────────────────────────────────
        50 => match int_of(arg(args, 0)) {
            Some(v) => {
                let class = vm.global("Float");
                objects::new_float(&mut vm.mem, class, v as f64)
            }
            None => NIL,
        },
        51 => match int_of(arg(args, 0)) {
            Some(v) => {
                vm.rng = StdRng::seed_from_u64(v as u64);
                arg(args, 0)
            }
            None => NIL,
        },
        52 => match int_of(arg(args, 1)) {
            Some(n) if (0..=FREE_LIST_MAX as i32).contains(&n) => {
                let o = vm.mem.alloc_word(n as usize);
                let class = arg(args, 0);
                vm.mem.set_class_field(o, class);
                o
            }
            _ => NIL,
        },
        53 => match int_of(arg(args, 1)) {
            Some(n) if n >= 0 && (n as usize).div_ceil(4) <= FREE_LIST_MAX => {
                let o = vm.mem.alloc_byte(n as usize);
                let class = arg(args, 0);
                vm.mem.set_class_field(o, class);
                o
            }
            _ => NIL,
        },

        // ── integer binary ────────────────────────────────────────────
        60..=72 => {
            let (Some(_), Some(_)) = (int_of(arg(args, 0)), int_of(arg(args, 1))) else {
                return NIL;
            };
            integer_binary(vm, number, arg(args, 0), arg(args, 1))
        }
        79 => {
            let (Some(a), Some(b)) = (int_of(arg(args, 0)), int_of(arg(args, 1))) else {
                return NIL;
            };
            if b >= 0 {
                if b > 30 {
                    NIL
                } else {
                    int_or_nil((a as i64) << b)
                }
            } else if b < -30 {
                int_or_nil(if a < 0 { -1 } else { 0 })
            } else {
                int_or_nil((a >> (-b)) as i64)
            }
        }

        // ── string unary ──────────────────────────────────────────────
        80 => match text_arg(vm, arg(args, 0)) {
            Some(t) => int_or_nil(t.len() as i64),
            None => NIL,
        },
        81 => match text_arg(vm, arg(args, 0)) {
            Some(t) => int_or_nil(objects::string_hash(&t) as i64),
            None => NIL,
        },
        82 => match text_arg(vm, arg(args, 0)) {
            Some(t) => {
                let text = String::from_utf8_lossy(&t).into_owned();
                vm.intern(&text)
            }
            None => NIL,
        },
        83 => {
            let key = arg(args, 0);
            if key.is_object() && vm.mem.size_of(key) < 0 {
                objects::dict_value(&vm.mem, vm.symbols, key)
            } else {
                NIL
            }
        }
        84 => match text_arg(vm, arg(args, 0)) {
            Some(t) => {
                let cmd = String::from_utf8_lossy(&t).into_owned();
                match Command::new("sh").arg("-c").arg(&cmd).status() {
                    Ok(status) => int_or_nil(status.code().unwrap_or(-1) as i64),
                    Err(e) => {
                        warn!("system call failed: {e}");
                        NIL
                    }
                }
            }
            None => NIL,
        },
        85 => fatal("abort requested"),

        // ── float unary ───────────────────────────────────────────────
        100 => match float_of(vm, arg(args, 0)) {
            Some(f) => {
                let class = vm.global("String");
                objects::new_string(&mut vm.mem, class, &format!("{f}"))
            }
            None => NIL,
        },
        101 => float_unary(vm, args, f64::ln),
        102 => float_unary(vm, args, f64::exp),
        103 => match float_of(vm, arg(args, 0)) {
            Some(f) => {
                let (mantissa, exponent) = frexp(f);
                let float_class = vm.global("Float");
                let array_class = vm.global("Array");
                let m = objects::new_float(&mut vm.mem, float_class, mantissa);
                let e = Oop::new_integer(exponent);
                objects::new_array(&mut vm.mem, array_class, &[m, e])
            }
            None => NIL,
        },

        // ── float binary ──────────────────────────────────────────────
        110..=119 => {
            let (Some(a), Some(b)) = (float_of(vm, arg(args, 0)), float_of(vm, arg(args, 1)))
            else {
                return NIL;
            };
            match number {
                110 => new_float_result(vm, a + b),
                111 => new_float_result(vm, a - b),
                112 => new_float_result(vm, a * b),
                113 => {
                    if b == 0.0 {
                        NIL
                    } else {
                        new_float_result(vm, a / b)
                    }
                }
                114 => vm.bool_oop(a < b),
                115 => vm.bool_oop(a > b),
                116 => vm.bool_oop(a <= b),
                117 => vm.bool_oop(a >= b),
                118 => vm.bool_oop(a == b),
                _ => vm.bool_oop(a != b),
            }
        }

        // ── external collaborators ────────────────────────────────────
        120.. => {
            let hook = vm.external_primitive;
            hook(vm, number, args)
        }

        _ => {
            warn!("primitive {number} not implemented");
            NIL
        }
    }
}

/// Primitives 60..72 on two integer oops. Answers nil on overflow or a
/// zero divisor; the interpreter's SendBinary fast path comes through
/// here before falling back to a real send.
pub fn integer_binary(vm: &mut Vm, number: u8, a: Oop, b: Oop) -> Oop {
    let x = a.int_value() as i64;
    let y = b.int_value() as i64;
    match number {
        60 => int_or_nil(x + y),
        61 => int_or_nil(x - y),
        62 => vm.bool_oop(x < y),
        63 => vm.bool_oop(x > y),
        64 => vm.bool_oop(x <= y),
        65 => vm.bool_oop(x >= y),
        66 => vm.bool_oop(x == y),
        67 => vm.bool_oop(x != y),
        68 => int_or_nil(x * y),
        69 => {
            if y == 0 {
                NIL
            } else {
                int_or_nil(x / y)
            }
        }
        70 => {
            if y == 0 {
                NIL
            } else {
                int_or_nil(x % y)
            }
        }
        71 => int_or_nil(x & y),
        72 => int_or_nil(x ^ y),
        _ => NIL,
    }
}

/// Add a compiled method to its class dictionary and drop any stale
/// cache line.
pub fn install_method(vm: &mut Vm, class: Oop, method: Oop) {
    let selector = vm.mem.basic_at(method, METHOD_MESSAGE);
    let mut methods = vm.mem.basic_at(class, CLASS_METHODS);
    if methods.is_nil() {
        let dict_class = vm.global("Dictionary");
        let array_class = vm.global("Array");
        methods = objects::dictionary_new(&mut vm.mem, 39, dict_class, array_class);
        vm.mem.field_at_put(class, CLASS_METHODS, methods);
    }
    let link_class = vm.global("Link");
    objects::dict_set(&mut vm.mem, methods, selector, method, link_class);
    vm.cache_flush(selector, class);
}

fn float_unary(vm: &mut Vm, args: &[Oop], f: fn(f64) -> f64) -> Oop {
    match float_of(vm, arg(args, 0)) {
        Some(v) => new_float_result(vm, f(v)),
        None => NIL,
    }
}

fn new_float_result(vm: &mut Vm, v: f64) -> Oop {
    let class = vm.global("Float");
    objects::new_float(&mut vm.mem, class, v)
}

/// Split into mantissa in [0.5, 1) and a power-of-two exponent.
fn frexp(f: f64) -> (f64, i32) {
    if f == 0.0 || !f.is_finite() {
        return (f, 0);
    }
    let mut exponent = f.abs().log2().floor() as i32 + 1;
    let mut mantissa = f / f64::powi(2.0, exponent);
    // log2 rounding can land one off at power-of-two boundaries.
    if mantissa.abs() >= 1.0 {
        mantissa /= 2.0;
        exponent += 1;
    } else if mantissa.abs() < 0.5 {
        mantissa *= 2.0;
        exponent -= 1;
    }
    (mantissa, exponent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oop::INT_LIMIT;

    fn vm_with_bools() -> Vm {
        let mut vm = Vm::new();
        let t = vm.mem.alloc_word(0);
        vm.mem.incr(t);
        let f = vm.mem.alloc_word(0);
        vm.mem.incr(f);
        vm.true_obj = t;
        vm.false_obj = f;
        vm
    }

    #[test]
    fn test_integer_add_overflow_answers_nil() {
        let mut vm = vm_with_bools();
        let limit = Oop::new_integer(INT_LIMIT as i32);
        let one = Oop::new_integer(1);
        assert_eq!(integer_binary(&mut vm, 60, limit, one), NIL);
        assert_eq!(
            integer_binary(&mut vm, 60, Oop::new_integer(40), Oop::new_integer(2)),
            Oop::new_integer(42)
        );
    }

    #[test]
    fn test_division_by_zero_answers_nil() {
        let mut vm = vm_with_bools();
        let z = Oop::new_integer(0);
        let seven = Oop::new_integer(7);
        assert_eq!(integer_binary(&mut vm, 69, seven, z), NIL);
        assert_eq!(integer_binary(&mut vm, 70, seven, z), NIL);
        assert_eq!(
            integer_binary(&mut vm, 69, seven, Oop::new_integer(2)),
            Oop::new_integer(3)
        );
    }

    #[test]
    fn test_comparisons_answer_booleans() {
        let mut vm = vm_with_bools();
        let a = Oop::new_integer(3);
        let b = Oop::new_integer(5);
        assert_eq!(integer_binary(&mut vm, 62, a, b), vm.true_obj);
        assert_eq!(integer_binary(&mut vm, 63, a, b), vm.false_obj);
    }

    #[test]
    fn test_shift_both_directions() {
        let mut vm = vm_with_bools();
        let v = Oop::new_integer(6);
        assert_eq!(
            dispatch(&mut vm, 79, &[v, Oop::new_integer(2)]),
            Oop::new_integer(24)
        );
        assert_eq!(
            dispatch(&mut vm, 79, &[v, Oop::new_integer(-1)]),
            Oop::new_integer(3)
        );
        assert_eq!(
            dispatch(&mut vm, 79, &[Oop::new_integer(16000), Oop::new_integer(10)]),
            NIL
        );
    }

    #[test]
    fn test_basic_at_out_of_range_answers_nil() {
        let mut vm = vm_with_bools();
        let a = vm.mem.alloc_word(2);
        vm.mem.incr(a);
        vm.mem.field_at_put(a, 1, Oop::new_integer(9));
        assert_eq!(
            dispatch(&mut vm, 24, &[a, Oop::new_integer(1)]),
            Oop::new_integer(9)
        );
        assert_eq!(dispatch(&mut vm, 24, &[a, Oop::new_integer(3)]), NIL);
        assert_eq!(dispatch(&mut vm, 24, &[a, Oop::new_integer(0)]), NIL);
    }

    #[test]
    fn test_string_concat_and_copy() {
        let mut vm = vm_with_bools();
        let a = vm.mem.alloc_string("fork");
        vm.mem.incr(a);
        let b = vm.mem.alloc_string("lift");
        vm.mem.incr(b);
        let joined = dispatch(&mut vm, 23, &[a, b]);
        assert_eq!(text_of(&vm.mem, joined), b"forklift");
        let part = dispatch(
            &mut vm,
            33,
            &[joined, Oop::new_integer(5), Oop::new_integer(8)],
        );
        assert_eq!(text_of(&vm.mem, part), b"lift");
    }

    #[test]
    fn test_frexp_halves() {
        let (m, e) = frexp(8.0);
        assert_eq!((m, e), (0.5, 4));
        let (m, e) = frexp(0.75);
        assert_eq!((m, e), (0.75, 0));
        let (m, e) = frexp(-3.0);
        assert_eq!((m, e), (-0.75, 2));
    }

    #[test]
    fn test_global_primitives_decline_word_keys() {
        let mut vm = vm_with_bools();
        let key = vm.mem.alloc_word(2);
        vm.mem.incr(key);
        assert_eq!(dispatch(&mut vm, 83, &[key]), NIL);
        assert_eq!(dispatch(&mut vm, 26, &[key, Oop::new_integer(1)]), NIL);
    }

    #[test]
    fn test_unknown_primitive_answers_nil() {
        let mut vm = vm_with_bools();
        assert_eq!(dispatch(&mut vm, 45, &[]), NIL);
    }
}
