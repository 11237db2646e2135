//! Object memory: the object table, size-indexed free lists, and the
//! reference-counting allocator.
//!
//! Every non-integer oop indexes an [`Entry`]. An entry holds the class
//! reference, a signed refcount, a signed size (positive = oop slots,
//! negative = byte count), and the payload. Free entries have refcount 0
//! and reuse the class field as the next-free link of their size class.

use crate::oop::{NIL, Oop, fatal};

/// Fixed capacity of the object table.
pub const OBJECT_TABLE_SIZE: usize = 6000;

/// Largest individual object, in oop slots; also the top free-list index.
pub const FREE_LIST_MAX: usize = 2048;

/// Refcount sentinel marking an entry immortal (image-ROM objects).
pub const PIN_REFCOUNT: i16 = 0x7f;

/// Bytes per oop slot; byte payloads round up to a whole number of these.
pub const WORD_SIZE: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Empty,
    Words(Vec<Oop>),
    Bytes(Vec<u8>),
}

#[derive(Debug)]
pub struct Entry {
    /// Class reference while live; next-free link while free.
    pub class: Oop,
    pub refcount: i16,
    pub size: i16,
    pub payload: Payload,
}

impl Entry {
    fn empty() -> Self {
        Self {
            class: NIL,
            refcount: 0,
            size: 0,
            payload: Payload::Empty,
        }
    }

    /// Payload capacity in whole oop slots.
    pub fn word_capacity(&self) -> usize {
        match &self.payload {
            Payload::Empty => 0,
            Payload::Words(w) => w.len(),
            Payload::Bytes(b) => b.len() / WORD_SIZE,
        }
    }

    pub fn is_byte_object(&self) -> bool {
        self.size < 0
    }
}

pub struct ObjectMemory {
    table: Vec<Entry>,
    /// Heads of the per-size free lists, nil-terminated intrusive chains.
    free_lists: Vec<Oop>,
    /// Canonical class of small integers, resolved lazily after load.
    pub integer_class: Oop,
}

impl ObjectMemory {
    pub fn new() -> Self {
        let mut table = Vec::with_capacity(OBJECT_TABLE_SIZE);
        for _ in 0..OBJECT_TABLE_SIZE {
            table.push(Entry::empty());
        }
        let mut mem = Self {
            table,
            free_lists: vec![NIL; FREE_LIST_MAX + 1],
            integer_class: NIL,
        };
        // Chain everything except the nil slot into the size-0 list.
        for idx in (1..OBJECT_TABLE_SIZE).rev() {
            mem.table[idx].class = mem.free_lists[0];
            mem.free_lists[0] = Oop::reference(idx);
        }
        // The nil slot is live from the start.
        mem.table[0].refcount = 1;
        mem
    }

    /// Drop all entries and free lists; used before an image load.
    pub fn clear_for_load(&mut self) {
        for e in &mut self.table {
            *e = Entry::empty();
        }
        for head in &mut self.free_lists {
            *head = NIL;
        }
        self.integer_class = NIL;
    }

    #[inline]
    pub fn entry(&self, o: Oop) -> &Entry {
        if !o.is_reference() {
            fatal("object table access with integer oop");
        }
        let idx = o.ref_index();
        if idx >= OBJECT_TABLE_SIZE {
            fatal("object table index out of range");
        }
        &self.table[idx]
    }

    #[inline]
    pub fn entry_mut(&mut self, o: Oop) -> &mut Entry {
        if !o.is_reference() {
            fatal("object table access with integer oop");
        }
        let idx = o.ref_index();
        if idx >= OBJECT_TABLE_SIZE {
            fatal("object table index out of range");
        }
        &mut self.table[idx]
    }

    pub fn entry_at(&self, idx: usize) -> &Entry {
        &self.table[idx]
    }

    pub fn entry_at_mut(&mut self, idx: usize) -> &mut Entry {
        &mut self.table[idx]
    }

    pub fn class_of(&self, o: Oop) -> Oop {
        if o.is_integer() {
            self.integer_class
        } else {
            self.entry(o).class
        }
    }

    /// The raw size field: slot count, or negated byte count.
    pub fn size_of(&self, o: Oop) -> i16 {
        if o.is_integer() { 0 } else { self.entry(o).size }
    }

    pub fn object_count(&self) -> usize {
        self.table.iter().filter(|e| e.refcount != 0).count()
    }

    pub fn free_count(&self) -> usize {
        self.table.iter().filter(|e| e.refcount == 0).count()
    }

    // ── reference counting ────────────────────────────────────────────

    #[inline]
    pub fn incr(&mut self, o: Oop) {
        if !o.is_object() {
            return;
        }
        let e = &mut self.table[o.ref_index()];
        if e.refcount == PIN_REFCOUNT {
            return;
        }
        e.refcount += 1;
    }

    #[inline]
    pub fn decr(&mut self, o: Oop) {
        if !o.is_object() {
            return;
        }
        let idx = o.ref_index();
        let e = &mut self.table[idx];
        if e.refcount == PIN_REFCOUNT {
            return;
        }
        e.refcount -= 1;
        if e.refcount < 0 {
            fatal("negative reference count");
        }
        if e.refcount == 0 {
            self.free_on_zero(idx);
        }
    }

    fn free_on_zero(&mut self, idx: usize) {
        let class = std::mem::replace(&mut self.table[idx].class, NIL);
        self.decr(class);
        let size = self.table[idx].size;
        if size > 0 {
            for i in 0..size as usize {
                let child = match &mut self.table[idx].payload {
                    Payload::Words(w) => std::mem::replace(&mut w[i], NIL),
                    _ => fatal("word object without word payload"),
                };
                self.decr(child);
            }
        }
        self.push_free(idx);
    }

    /// Link a dead entry into the free list of its payload capacity. The
    /// word payload is nil-filled here so reuse hands out clean slots.
    pub fn push_free(&mut self, idx: usize) {
        let cap = self.table[idx].word_capacity();
        let e = &mut self.table[idx];
        match &mut e.payload {
            Payload::Words(w) => w.fill(NIL),
            _ => e.payload = Payload::Words(vec![NIL; cap]),
        }
        e.size = cap as i16;
        e.refcount = 0;
        e.class = self.free_lists[cap];
        self.free_lists[cap] = Oop::reference(idx);
    }

    // ── allocation ────────────────────────────────────────────────────

    fn pop_free(&mut self, cap: usize) -> Option<usize> {
        let head = self.free_lists[cap];
        if head.is_nil() {
            return None;
        }
        let idx = head.ref_index();
        self.free_lists[cap] = self.table[idx].class;
        self.table[idx].class = NIL;
        Some(idx)
    }

    /// Allocation strategy: exact size, then empty, then oversized
    /// (slack kept), then undersized (payload replaced), then give up.
    fn alloc_entry(&mut self, words: usize) -> usize {
        if words > FREE_LIST_MAX {
            fatal("allocation larger than maximum object size");
        }
        if let Some(idx) = self.pop_free(words) {
            return idx;
        }
        if let Some(idx) = self.pop_free(0) {
            return idx;
        }
        for cap in words + 1..=FREE_LIST_MAX {
            if let Some(idx) = self.pop_free(cap) {
                return idx;
            }
        }
        for cap in 1..words {
            if let Some(idx) = self.pop_free(cap) {
                return idx;
            }
        }
        fatal("out of objects");
    }

    /// A fresh word object of `slots` nil slots, refcount 0, class nil.
    /// The caller is expected to set the class.
    pub fn alloc_word(&mut self, slots: usize) -> Oop {
        let idx = self.alloc_entry(slots);
        let e = &mut self.table[idx];
        match &e.payload {
            Payload::Words(w) if w.len() >= slots => {}
            _ => e.payload = Payload::Words(vec![NIL; slots]),
        }
        e.size = slots as i16;
        e.refcount = 0;
        Oop::reference(idx)
    }

    /// A fresh byte object of `len` bytes, zeroed, storage rounded up to
    /// whole words.
    pub fn alloc_byte(&mut self, len: usize) -> Oop {
        let words = len.div_ceil(WORD_SIZE);
        let idx = self.alloc_entry(words);
        let e = &mut self.table[idx];
        e.payload = Payload::Bytes(vec![0u8; words * WORD_SIZE]);
        e.size = -(len as i16);
        e.refcount = 0;
        Oop::reference(idx)
    }

    /// A byte object holding `text` plus a terminating zero byte.
    pub fn alloc_string(&mut self, text: &str) -> Oop {
        let o = self.alloc_byte(text.len() + 1);
        if let Payload::Bytes(b) = &mut self.entry_mut(o).payload {
            b[..text.len()].copy_from_slice(text.as_bytes());
        }
        o
    }

    // ── field access (1-indexed, as the bytecodes see it) ─────────────

    pub fn basic_at(&self, o: Oop, i: usize) -> Oop {
        let e = self.entry(o);
        if e.size <= 0 || i == 0 || i > e.size as usize {
            fatal("word slot index out of range");
        }
        match &e.payload {
            Payload::Words(w) => w[i - 1],
            _ => fatal("word access on byte object"),
        }
    }

    /// Raw store; only correct when the slot currently holds nil or the
    /// slot's refcounts are managed by the caller.
    pub fn basic_at_put(&mut self, o: Oop, i: usize, v: Oop) {
        let e = self.entry_mut(o);
        if e.size <= 0 || i == 0 || i > e.size as usize {
            fatal("word slot index out of range");
        }
        match &mut e.payload {
            Payload::Words(w) => w[i - 1] = v,
            _ => fatal("word access on byte object"),
        }
    }

    /// Counted store: releases the old occupant, stores, retains the new.
    pub fn field_at_put(&mut self, o: Oop, i: usize, v: Oop) {
        let old = self.basic_at(o, i);
        if old == v {
            return;
        }
        self.incr(v);
        self.basic_at_put(o, i, v);
        self.decr(old);
    }

    pub fn byte_at(&self, o: Oop, i: usize) -> u8 {
        let e = self.entry(o);
        if e.size >= 0 || i == 0 || i > (-e.size) as usize {
            fatal("byte index out of range");
        }
        match &e.payload {
            Payload::Bytes(b) => b[i - 1],
            _ => fatal("byte access on word object"),
        }
    }

    pub fn byte_at_put(&mut self, o: Oop, i: usize, v: u8) {
        let e = self.entry_mut(o);
        if e.size >= 0 || i == 0 || i > (-e.size) as usize {
            fatal("byte index out of range");
        }
        match &mut e.payload {
            Payload::Bytes(b) => b[i - 1] = v,
            _ => fatal("byte access on word object"),
        }
    }

    /// The byte payload of a byte object, terminator included.
    pub fn bytes_of(&self, o: Oop) -> &[u8] {
        let e = self.entry(o);
        if e.size >= 0 {
            fatal("byte payload of a word object");
        }
        match &e.payload {
            Payload::Bytes(b) => &b[..(-e.size) as usize],
            _ => fatal("byte access on word object"),
        }
    }

    /// Counted class store.
    pub fn set_class_field(&mut self, o: Oop, class: Oop) {
        let old = self.entry(o).class;
        if old == class {
            return;
        }
        self.incr(class);
        self.entry_mut(o).class = class;
        self.decr(old);
    }

    pub fn pin(&mut self, idx: usize) {
        self.table[idx].refcount = PIN_REFCOUNT;
    }

    pub fn free_list_head(&self, cap: usize) -> Oop {
        self.free_lists[cap]
    }

    pub fn clear_free_lists(&mut self) {
        for head in &mut self.free_lists {
            *head = NIL;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_word_is_nil_filled() {
        let mut mem = ObjectMemory::new();
        let o = mem.alloc_word(3);
        assert_eq!(mem.size_of(o), 3);
        for i in 1..=3 {
            assert_eq!(mem.basic_at(o, i), NIL);
        }
    }

    #[test]
    fn test_byte_payload_rounds_to_words() {
        let mut mem = ObjectMemory::new();
        for len in [1usize, 4, 5, 8, 9] {
            let o = mem.alloc_byte(len);
            assert_eq!(mem.size_of(o), -(len as i16));
            let cap = mem.entry(o).word_capacity() * WORD_SIZE;
            assert_eq!(cap, len.div_ceil(WORD_SIZE) * WORD_SIZE);
        }
    }

    #[test]
    fn test_alloc_string_terminated() {
        let mut mem = ObjectMemory::new();
        let o = mem.alloc_string("hi");
        assert_eq!(mem.size_of(o), -3);
        assert_eq!(mem.byte_at(o, 1), b'h');
        assert_eq!(mem.byte_at(o, 2), b'i');
        assert_eq!(mem.byte_at(o, 3), 0);
    }

    #[test]
    fn test_incr_decr_is_a_no_op() {
        let mut mem = ObjectMemory::new();
        let o = mem.alloc_word(2);
        mem.incr(o);
        let before = mem.entry(o).refcount;
        mem.incr(o);
        mem.decr(o);
        assert_eq!(mem.entry(o).refcount, before);
    }

    #[test]
    fn test_free_on_zero_releases_children() {
        let mut mem = ObjectMemory::new();
        let child = mem.alloc_word(0);
        let parent = mem.alloc_word(1);
        mem.incr(parent);
        mem.field_at_put(parent, 1, child);
        assert_eq!(mem.entry(child).refcount, 1);
        let child_idx = child.ref_index();
        mem.decr(parent);
        // Parent freed, so the child went with it.
        assert_eq!(mem.entry_at(child_idx).refcount, 0);
    }

    #[test]
    fn test_freed_entry_is_reused_by_size() {
        let mut mem = ObjectMemory::new();
        let o = mem.alloc_word(4);
        let idx = o.ref_index();
        mem.incr(o);
        mem.decr(o);
        let again = mem.alloc_word(4);
        assert_eq!(again.ref_index(), idx);
    }

    #[test]
    fn test_oversized_entry_keeps_slack() {
        let mut mem = ObjectMemory::new();
        let big = mem.alloc_word(10);
        let idx = big.ref_index();
        mem.incr(big);
        mem.decr(big);
        // Drain the empty list so the oversized scan has to fire.
        let mut held = Vec::new();
        while let Some(free_idx) = {
            let head = mem.free_list_head(0);
            if head.is_nil() { None } else { Some(head.ref_index()) }
        } {
            let o = mem.alloc_word(0);
            assert_eq!(o.ref_index(), free_idx);
            mem.incr(o);
            held.push(o);
        }
        let small = mem.alloc_word(6);
        assert_eq!(small.ref_index(), idx);
        assert_eq!(mem.size_of(small), 6);
        assert!(mem.entry(small).word_capacity() >= 10);
    }

    #[test]
    fn test_folded_entry_is_reused_with_clean_slots() {
        let mut mem = ObjectMemory::new();
        let stale = mem.alloc_word(3);
        mem.incr(stale);
        let target = mem.alloc_word(0);
        mem.incr(target);
        mem.basic_at_put(stale, 1, Oop::new_integer(42));
        mem.basic_at_put(stale, 2, target);
        // Fold it free without the counted teardown, as an image load does.
        let idx = stale.ref_index();
        mem.entry_at_mut(idx).refcount = 0;
        mem.push_free(idx);
        let fresh = mem.alloc_word(3);
        assert_eq!(fresh.ref_index(), idx);
        mem.incr(fresh);
        for i in 1..=3 {
            assert_eq!(mem.basic_at(fresh, i), NIL);
        }
        // Storing over the slot must not release anything it never held.
        mem.field_at_put(fresh, 2, Oop::new_integer(7));
        assert_eq!(mem.entry(target).refcount, 1);
    }

    #[test]
    #[should_panic]
    fn test_over_limit_allocation_is_fatal() {
        let mut mem = ObjectMemory::new();
        mem.alloc_word(FREE_LIST_MAX + 1);
    }

    #[test]
    fn test_pinned_entries_ignore_counting() {
        let mut mem = ObjectMemory::new();
        let o = mem.alloc_word(1);
        mem.pin(o.ref_index());
        mem.decr(o);
        mem.decr(o);
        assert_eq!(mem.entry(o).refcount, PIN_REFCOUNT);
    }
}
