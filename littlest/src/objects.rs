//! Object layouts the VM knows by offset, plus the dictionary and symbol
//! machinery built on them.
//!
//! Offsets are 1-based, matching the bytecode view of instance variables.

use crate::memory::ObjectMemory;
use crate::oop::{NIL, Oop};

// Class
pub const CLASS_NAME: usize = 1;
pub const CLASS_SIZE: usize = 2;
pub const CLASS_METHODS: usize = 3;
pub const CLASS_SUPERCLASS: usize = 4;
pub const CLASS_VARIABLES: usize = 5;
pub const CLASS_SLOTS: usize = 5;

// Method
pub const METHOD_TEXT: usize = 1;
pub const METHOD_MESSAGE: usize = 2;
pub const METHOD_BYTECODES: usize = 3;
pub const METHOD_LITERALS: usize = 4;
pub const METHOD_STACK_SIZE: usize = 5;
pub const METHOD_TEMP_SIZE: usize = 6;
pub const METHOD_CLASS: usize = 7;
pub const METHOD_WATCH: usize = 8;
pub const METHOD_SLOTS: usize = 8;

// Block
pub const BLOCK_BYTE_POSITION: usize = 1;
pub const BLOCK_ARG_COUNT: usize = 2;
pub const BLOCK_ARG_LOCATION: usize = 3;
pub const BLOCK_CONTEXT: usize = 4;
pub const BLOCK_SLOTS: usize = 4;

// Context
pub const CONTEXT_LINK: usize = 1;
pub const CONTEXT_METHOD: usize = 2;
pub const CONTEXT_ARGUMENTS: usize = 3;
pub const CONTEXT_TEMPORARIES: usize = 4;
pub const CONTEXT_SLOTS: usize = 4;

// Process
pub const PROCESS_STACK: usize = 1;
pub const PROCESS_STACK_TOP: usize = 2;
pub const PROCESS_LINK: usize = 3;
pub const PROCESS_SLOTS: usize = 3;

// Dictionary is one slot (the bucket array); buckets chain Link objects.
pub const DICT_TABLE: usize = 1;
pub const DICT_SLOTS: usize = 1;
pub const LINK_KEY: usize = 1;
pub const LINK_VALUE: usize = 2;
pub const LINK_NEXT: usize = 3;
pub const LINK_SLOTS: usize = 3;

/// Byte-sum string hash. Serialized bucket structure depends on it, so it
/// never changes.
pub fn string_hash(text: &[u8]) -> usize {
    let mut h: u32 = 0;
    for &b in text {
        h = h.wrapping_add(b as u32);
    }
    h as usize
}

/// Text bytes of a string or symbol, terminator excluded.
pub fn text_of(mem: &ObjectMemory, o: Oop) -> &[u8] {
    let b = mem.bytes_of(o);
    match b.iter().position(|&c| c == 0) {
        Some(p) => &b[..p],
        None => b,
    }
}

pub fn new_array(mem: &mut ObjectMemory, class: Oop, elems: &[Oop]) -> Oop {
    let a = mem.alloc_word(elems.len());
    mem.set_class_field(a, class);
    for (i, &e) in elems.iter().enumerate() {
        mem.field_at_put(a, i + 1, e);
    }
    a
}

pub fn new_string(mem: &mut ObjectMemory, class: Oop, text: &str) -> Oop {
    let s = mem.alloc_string(text);
    mem.set_class_field(s, class);
    s
}

/// Floats are byte objects holding one host-endian f64.
pub fn new_float(mem: &mut ObjectMemory, class: Oop, value: f64) -> Oop {
    let f = mem.alloc_byte(8);
    mem.set_class_field(f, class);
    for (i, b) in value.to_ne_bytes().iter().enumerate() {
        mem.byte_at_put(f, i + 1, *b);
    }
    f
}

pub fn float_value(mem: &ObjectMemory, o: Oop) -> f64 {
    let b = mem.bytes_of(o);
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[..8]);
    f64::from_ne_bytes(raw)
}

/// Characters are one-slot objects holding their code point as an integer.
pub fn new_char(mem: &mut ObjectMemory, class: Oop, code: i32) -> Oop {
    let c = mem.alloc_word(1);
    mem.set_class_field(c, class);
    mem.field_at_put(c, 1, Oop::new_integer(code));
    c
}

// ── dictionaries ──────────────────────────────────────────────────────

pub fn dictionary_new(
    mem: &mut ObjectMemory,
    buckets: usize,
    dict_class: Oop,
    array_class: Oop,
) -> Oop {
    let table = mem.alloc_word(buckets);
    mem.set_class_field(table, array_class);
    let d = mem.alloc_word(DICT_SLOTS);
    mem.set_class_field(d, dict_class);
    mem.field_at_put(d, DICT_TABLE, table);
    d
}

fn bucket_slot(mem: &ObjectMemory, dict: Oop, text: &[u8]) -> usize {
    let table = mem.basic_at(dict, DICT_TABLE);
    let len = mem.size_of(table) as usize;
    string_hash(text) % len + 1
}

/// The Link whose key has the given text, or nil.
pub fn dict_find_by_text(mem: &ObjectMemory, dict: Oop, text: &[u8]) -> Oop {
    let table = mem.basic_at(dict, DICT_TABLE);
    let mut link = mem.basic_at(table, bucket_slot(mem, dict, text));
    while !link.is_nil() {
        let key = mem.basic_at(link, LINK_KEY);
        if text_of(mem, key) == text {
            return link;
        }
        link = mem.basic_at(link, LINK_NEXT);
    }
    NIL
}

/// The Link whose key is identical to `key`, or nil.
pub fn dict_find(mem: &ObjectMemory, dict: Oop, key: Oop) -> Oop {
    let text = text_of(mem, key).to_vec();
    let table = mem.basic_at(dict, DICT_TABLE);
    let mut link = mem.basic_at(table, bucket_slot(mem, dict, &text));
    while !link.is_nil() {
        if mem.basic_at(link, LINK_KEY) == key {
            return link;
        }
        link = mem.basic_at(link, LINK_NEXT);
    }
    NIL
}

/// Prepend a fresh Link to the key's bucket. Does not check for an
/// existing entry; use [`dict_set`] for assignment semantics.
pub fn dict_insert(
    mem: &mut ObjectMemory,
    dict: Oop,
    key: Oop,
    value: Oop,
    link_class: Oop,
) {
    let slot = {
        let text = text_of(mem, key).to_vec();
        bucket_slot(mem, dict, &text)
    };
    let table = mem.basic_at(dict, DICT_TABLE);
    let head = mem.basic_at(table, slot);
    let link = mem.alloc_word(LINK_SLOTS);
    mem.set_class_field(link, link_class);
    mem.field_at_put(link, LINK_KEY, key);
    mem.field_at_put(link, LINK_VALUE, value);
    mem.field_at_put(link, LINK_NEXT, head);
    mem.field_at_put(table, slot, link);
}

/// Bind `key` to `value`, replacing an existing binding in place.
pub fn dict_set(
    mem: &mut ObjectMemory,
    dict: Oop,
    key: Oop,
    value: Oop,
    link_class: Oop,
) {
    let link = dict_find(mem, dict, key);
    if link.is_nil() {
        dict_insert(mem, dict, key, value, link_class);
    } else {
        mem.field_at_put(link, LINK_VALUE, value);
    }
}

/// The value bound to `key`, or nil.
pub fn dict_value(mem: &ObjectMemory, dict: Oop, key: Oop) -> Oop {
    let link = dict_find(mem, dict, key);
    if link.is_nil() {
        NIL
    } else {
        mem.basic_at(link, LINK_VALUE)
    }
}

/// Intern `text` against the symbols dictionary: answer the existing
/// symbol or create one bound to nil. Identity equality for equal text
/// follows from going through here.
pub fn intern_symbol(
    mem: &mut ObjectMemory,
    symbols: Oop,
    text: &str,
    symbol_class: Oop,
    link_class: Oop,
) -> Oop {
    let link = dict_find_by_text(mem, symbols, text.as_bytes());
    if !link.is_nil() {
        return mem.basic_at(link, LINK_KEY);
    }
    let sym = mem.alloc_string(text);
    mem.set_class_field(sym, symbol_class);
    dict_insert(mem, symbols, sym, NIL, link_class);
    sym
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_hash_is_byte_sum() {
        assert_eq!(string_hash(b""), 0);
        assert_eq!(string_hash(b"A"), 65);
        assert_eq!(string_hash(b"AB"), 131);
        assert_eq!(string_hash(b"BA"), 131);
    }

    #[test]
    fn test_text_of_strips_terminator() {
        let mut mem = ObjectMemory::new();
        let s = mem.alloc_string("abc");
        assert_eq!(text_of(&mem, s), b"abc");
    }

    #[test]
    fn test_dict_set_and_lookup() {
        let mut mem = ObjectMemory::new();
        let dict = dictionary_new(&mut mem, 7, NIL, NIL);
        mem.incr(dict);
        let k = mem.alloc_string("size");
        mem.incr(k);
        dict_set(&mut mem, dict, k, Oop::new_integer(3), NIL);
        assert_eq!(dict_value(&mem, dict, k), Oop::new_integer(3));
        dict_set(&mut mem, dict, k, Oop::new_integer(9), NIL);
        assert_eq!(dict_value(&mem, dict, k), Oop::new_integer(9));
    }

    #[test]
    fn test_colliding_keys_chain_in_one_bucket() {
        let mut mem = ObjectMemory::new();
        // One bucket forces every key onto the same chain.
        let dict = dictionary_new(&mut mem, 1, NIL, NIL);
        mem.incr(dict);
        let a = mem.alloc_string("at:");
        mem.incr(a);
        let b = mem.alloc_string("do:");
        mem.incr(b);
        dict_set(&mut mem, dict, a, Oop::new_integer(1), NIL);
        dict_set(&mut mem, dict, b, Oop::new_integer(2), NIL);
        assert_eq!(dict_value(&mem, dict, a), Oop::new_integer(1));
        assert_eq!(dict_value(&mem, dict, b), Oop::new_integer(2));
    }

    #[test]
    fn test_interning_is_identity_stable() {
        let mut mem = ObjectMemory::new();
        let symbols = dictionary_new(&mut mem, 31, NIL, NIL);
        mem.incr(symbols);
        let s1 = intern_symbol(&mut mem, symbols, "printString", NIL, NIL);
        let s2 = intern_symbol(&mut mem, symbols, "printString", NIL, NIL);
        let other = intern_symbol(&mut mem, symbols, "printNl", NIL, NIL);
        assert_eq!(s1, s2);
        assert_ne!(s1, other);
    }

    #[test]
    fn test_float_round_trip() {
        let mut mem = ObjectMemory::new();
        let f = new_float(&mut mem, NIL, 2.5);
        assert_eq!(float_value(&mem, f), 2.5);
        let g = new_float(&mut mem, NIL, -0.125);
        assert_eq!(float_value(&mem, g), -0.125);
    }
}
