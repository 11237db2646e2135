//! The `Vm` struct: object memory plus every piece of state the original
//! interpreter kept global: the symbols root, memoized booleans, the
//! canonical selector tables, the method cache, and the collaborator
//! hooks.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Instant;

use log::warn;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::memory::ObjectMemory;
use crate::objects::{
    self, CLASS_METHODS, CLASS_SUPERCLASS, METHOD_MESSAGE,
};
use crate::oop::{NIL, Oop};
use crate::signal::{BlockQueue, DEFAULT_QUEUE_DEPTH, InterruptFlag};

/// Selectors `SendUnary` indexes.
pub const UNARY_SELECTORS: [&str; 2] = ["isNil", "notNil"];

/// Selectors `SendBinary` indexes. The first 13 pair with primitives
/// 60..72; the 14th is identity. Spellings are part of the image
/// contract.
pub const BINARY_SELECTORS: [&str; 14] = [
    "+", "-", "<", ">", "<=", ">=", "=", "~=", "*", "quo:", "rem:", "bitAnd:", "bitXor:", "==",
];

pub const METHOD_CACHE_SIZE: usize = 211;

#[derive(Debug, Copy, Clone)]
pub struct CacheEntry {
    pub message: Oop,
    pub lookup_class: Oop,
    pub method: Oop,
    pub found_class: Oop,
}

impl CacheEntry {
    const EMPTY: CacheEntry = CacheEntry {
        message: NIL,
        lookup_class: NIL,
        method: NIL,
        found_class: NIL,
    };
}

/// Hook for primitives 120 and up.
pub type ExtPrimitiveFn = fn(&mut Vm, u8, &[Oop]) -> Oop;

fn default_external(_vm: &mut Vm, number: u8, _args: &[Oop]) -> Oop {
    warn!("external primitive {number} has no handler");
    NIL
}

pub struct Vm {
    pub mem: ObjectMemory,
    /// The symbols dictionary: interning table and global namespace.
    pub symbols: Oop,
    pub true_obj: Oop,
    pub false_obj: Oop,
    pub unary_selectors: [Oop; 2],
    pub binary_selectors: [Oop; 14],
    pub cache: [CacheEntry; METHOD_CACHE_SIZE],
    pub watching: bool,
    pub interrupt: Arc<InterruptFlag>,
    pub run_queue: Arc<BlockQueue>,
    pub console: Box<dyn Write + Send>,
    pub external_primitive: ExtPrimitiveFn,
    pub rng: StdRng,
    pub started: Instant,
}

impl Vm {
    /// A VM with a fresh memory holding only nil and an empty symbols
    /// dictionary. The bootstrap in `builder` fills in the classes.
    pub fn new() -> Self {
        let mut mem = ObjectMemory::new();
        let symbols = objects::dictionary_new(&mut mem, 53, NIL, NIL);
        mem.incr(symbols);
        Self {
            mem,
            symbols,
            true_obj: NIL,
            false_obj: NIL,
            unary_selectors: [NIL; 2],
            binary_selectors: [NIL; 14],
            cache: [CacheEntry::EMPTY; METHOD_CACHE_SIZE],
            watching: false,
            interrupt: Arc::new(InterruptFlag::new()),
            run_queue: Arc::new(BlockQueue::new(DEFAULT_QUEUE_DEPTH)),
            console: Box::new(io::stdout()),
            external_primitive: default_external,
            rng: StdRng::seed_from_u64(0x0005_15f1),
            started: Instant::now(),
        }
    }

    /// Adopt a memory loaded from an image, then memoize the booleans
    /// and selector tables it carries.
    pub fn adopt(&mut self, mem: ObjectMemory, symbols: Oop) {
        self.mem = mem;
        self.symbols = symbols;
        self.cache_flush_all();
        self.init_specials();
    }

    /// Resolve `true`, `false`, the integer class, and the canonical
    /// selector symbols. Call after bootstrap or image load.
    pub fn init_specials(&mut self) {
        self.true_obj = self.global("true");
        self.false_obj = self.global("false");
        self.mem.integer_class = self.global("Integer");
        for (i, s) in UNARY_SELECTORS.iter().enumerate() {
            self.unary_selectors[i] = self.intern(s);
        }
        for (i, s) in BINARY_SELECTORS.iter().enumerate() {
            self.binary_selectors[i] = self.intern(s);
        }
    }

    pub fn bool_oop(&self, b: bool) -> Oop {
        if b { self.true_obj } else { self.false_obj }
    }

    // ── globals and symbols ───────────────────────────────────────────

    pub fn intern(&mut self, text: &str) -> Oop {
        let symbol_class = self.global("Symbol");
        let link_class = self.global("Link");
        objects::intern_symbol(&mut self.mem, self.symbols, text, symbol_class, link_class)
    }

    /// The value bound to a global name, or nil.
    pub fn global(&self, name: &str) -> Oop {
        let link = objects::dict_find_by_text(&self.mem, self.symbols, name.as_bytes());
        if link.is_nil() {
            NIL
        } else {
            self.mem.basic_at(link, objects::LINK_VALUE)
        }
    }

    pub fn set_global(&mut self, name: &str, value: Oop) {
        let key = self.intern(name);
        let link_class = self.global("Link");
        objects::dict_set(&mut self.mem, self.symbols, key, value, link_class);
    }

    // ── method lookup ─────────────────────────────────────────────────

    #[inline]
    fn cache_slot(selector: Oop, class: Oop) -> usize {
        ((selector.raw() ^ class.raw()) as usize) % METHOD_CACHE_SIZE
    }

    /// Find `selector` starting at `class`, walking the superclass
    /// chain, through the cache. Answers (method, defining class).
    pub fn find_method(&mut self, class: Oop, selector: Oop) -> Option<(Oop, Oop)> {
        let slot = Self::cache_slot(selector, class);
        let e = self.cache[slot];
        if e.message == selector && e.lookup_class == class {
            return Some((e.method, e.found_class));
        }
        let mut probe = class;
        while !probe.is_nil() {
            let methods = self.mem.basic_at(probe, CLASS_METHODS);
            if !methods.is_nil() {
                let found = objects::dict_find(&self.mem, methods, selector);
                if !found.is_nil() {
                    let method = self.mem.basic_at(found, objects::LINK_VALUE);
                    self.cache[slot] = CacheEntry {
                        message: selector,
                        lookup_class: class,
                        method,
                        found_class: probe,
                    };
                    return Some((method, probe));
                }
            }
            probe = self.mem.basic_at(probe, CLASS_SUPERCLASS);
        }
        None
    }

    /// Invalidate the cache line a recompiled method may occupy.
    pub fn cache_flush(&mut self, selector: Oop, class: Oop) {
        for entry in self.cache.iter_mut() {
            if entry.message == selector
                && (entry.lookup_class == class || entry.found_class == class)
            {
                entry.message = NIL;
            }
        }
    }

    pub fn cache_flush_all(&mut self) {
        self.cache = [CacheEntry::EMPTY; METHOD_CACHE_SIZE];
    }

    /// Selector symbol of a method, for diagnostics.
    pub fn method_selector_text(&self, method: Oop) -> String {
        let sym = self.mem.basic_at(method, METHOD_MESSAGE);
        if sym.is_object() {
            String::from_utf8_lossy(objects::text_of(&self.mem, sym)).into_owned()
        } else {
            "?".into()
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
