//! Image codec: serializing the object table and rebuilding a live
//! memory from the stream.
//!
//! Stream layout: one `i32` holding the symbols root, then header records
//! `{index: i32, class: i32, size: i16, flags: i16}` in host endianness.
//! In the single-file layout each header is followed by its payload; in
//! the split layout the headers form one stream and the payloads are
//! concatenated in header order in a second.

use std::io::{self, Read, Write};

use bitflags::bitflags;
use log::debug;
use thiserror::Error;

use crate::memory::{OBJECT_TABLE_SIZE, ObjectMemory, PIN_REFCOUNT, Payload, WORD_SIZE};
use crate::oop::{NIL, Oop};

bitflags! {
    pub struct EntryFlags: i16 {
        /// Payload may live in read-only storage.
        const ROM = 0b1;
    }
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image i/o: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt image: {0}")]
    Corrupt(&'static str),
}

fn write_i32(out: &mut dyn Write, v: i32) -> io::Result<()> {
    out.write_all(&v.to_ne_bytes())
}

fn write_i16(out: &mut dyn Write, v: i16) -> io::Result<()> {
    out.write_all(&v.to_ne_bytes())
}

fn read_i32(input: &mut dyn Read) -> Result<i32, ImageError> {
    let mut b = [0u8; 4];
    input.read_exact(&mut b).map_err(eof_is_corrupt)?;
    Ok(i32::from_ne_bytes(b))
}

fn read_i16(input: &mut dyn Read) -> Result<i16, ImageError> {
    let mut b = [0u8; 2];
    input.read_exact(&mut b).map_err(eof_is_corrupt)?;
    Ok(i16::from_ne_bytes(b))
}

fn eof_is_corrupt(e: io::Error) -> ImageError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ImageError::Corrupt("truncated stream")
    } else {
        ImageError::Io(e)
    }
}

/// Reads the leading index field of the next header, or None on a clean
/// end of stream.
fn read_next_index(input: &mut dyn Read) -> Result<Option<i32>, ImageError> {
    let mut b = [0u8; 4];
    let mut got = 0;
    while got < 4 {
        let n = input.read(&mut b[got..])?;
        if n == 0 {
            return if got == 0 {
                Ok(None)
            } else {
                Err(ImageError::Corrupt("truncated header"))
            };
        }
        got += n;
    }
    Ok(Some(i32::from_ne_bytes(b)))
}

struct HeaderRecord {
    index: usize,
    class: Oop,
    size: i16,
    flags: EntryFlags,
}

fn read_header_tail(input: &mut dyn Read, index: i32) -> Result<HeaderRecord, ImageError> {
    if index < 0 || index as usize >= OBJECT_TABLE_SIZE {
        return Err(ImageError::Corrupt("object index out of range"));
    }
    let class = Oop::from_raw(read_i32(input)?);
    if class.is_integer() {
        return Err(ImageError::Corrupt("integer oop in class field"));
    }
    let size = read_i16(input)?;
    let flags = EntryFlags::from_bits_truncate(read_i16(input)?);
    Ok(HeaderRecord {
        index: index as usize,
        class,
        size,
        flags,
    })
}

fn payload_words(size: i16) -> usize {
    if size >= 0 {
        size as usize
    } else {
        ((-size) as usize).div_ceil(WORD_SIZE)
    }
}

fn read_payload(input: &mut dyn Read, size: i16) -> Result<Payload, ImageError> {
    if size == 0 {
        return Ok(Payload::Empty);
    }
    if size > 0 {
        let mut words = Vec::with_capacity(size as usize);
        for _ in 0..size {
            words.push(Oop::from_raw(read_i32(input)?));
        }
        Ok(Payload::Words(words))
    } else {
        let mut bytes = vec![0u8; payload_words(size) * WORD_SIZE];
        input.read_exact(&mut bytes).map_err(eof_is_corrupt)?;
        Ok(Payload::Bytes(bytes))
    }
}

fn install(mem: &mut ObjectMemory, rec: &HeaderRecord, payload: Payload, pin: bool) {
    let e = mem.entry_at_mut(rec.index);
    e.class = rec.class;
    e.size = rec.size;
    e.payload = payload;
    e.refcount = if pin { PIN_REFCOUNT } else { 0 };
}

fn write_header(
    mem: &ObjectMemory,
    rom_classes: &[Oop],
    out: &mut dyn Write,
    idx: usize,
) -> io::Result<()> {
    let e = mem.entry_at(idx);
    let mut flags = EntryFlags::empty();
    if rom_classes.contains(&e.class) {
        flags |= EntryFlags::ROM;
    }
    write_i32(out, idx as i32)?;
    write_i32(out, e.class.raw())?;
    write_i16(out, e.size)?;
    write_i16(out, flags.bits())
}

fn write_payload(mem: &ObjectMemory, out: &mut dyn Write, idx: usize) -> io::Result<()> {
    let e = mem.entry_at(idx);
    match (&e.payload, e.size) {
        (_, 0) => Ok(()),
        (Payload::Words(w), s) if s > 0 => {
            for slot in &w[..s as usize] {
                write_i32(out, slot.raw())?;
            }
            Ok(())
        }
        (Payload::Bytes(b), s) if s < 0 => out.write_all(&b[..payload_words(s) * WORD_SIZE]),
        _ => Err(io::Error::other("entry size disagrees with payload")),
    }
}

/// Single-file layout: root word, then header+payload per live entry in
/// index order.
pub fn write_image(
    mem: &ObjectMemory,
    symbols: Oop,
    rom_classes: &[Oop],
    out: &mut dyn Write,
) -> Result<(), ImageError> {
    write_i32(out, symbols.raw())?;
    let mut written = 0usize;
    for idx in 0..OBJECT_TABLE_SIZE {
        if mem.entry_at(idx).refcount == 0 {
            continue;
        }
        write_header(mem, rom_classes, out, idx)?;
        write_payload(mem, out, idx)?;
        written += 1;
    }
    debug!("image write: {written} entries");
    Ok(())
}

/// Split layout: headers to `table_out`, payloads concatenated in header
/// order to `data_out`.
pub fn write_split_image(
    mem: &ObjectMemory,
    symbols: Oop,
    rom_classes: &[Oop],
    table_out: &mut dyn Write,
    data_out: &mut dyn Write,
) -> Result<(), ImageError> {
    write_i32(table_out, symbols.raw())?;
    for idx in 0..OBJECT_TABLE_SIZE {
        if mem.entry_at(idx).refcount == 0 {
            continue;
        }
        write_header(mem, rom_classes, table_out, idx)?;
        write_payload(mem, data_out, idx)?;
    }
    Ok(())
}

/// Load a single-file image into `mem`, replacing its contents, and
/// answer the symbols root.
pub fn read_image(mem: &mut ObjectMemory, input: &mut dyn Read) -> Result<Oop, ImageError> {
    mem.clear_for_load();
    let symbols = Oop::from_raw(read_i32(input)?);
    if !symbols.is_object() {
        return Err(ImageError::Corrupt("bad symbols root"));
    }
    let mut loaded = 0usize;
    while let Some(index) = read_next_index(input)? {
        let rec = read_header_tail(input, index)?;
        let payload = read_payload(input, rec.size)?;
        install(mem, &rec, payload, false);
        loaded += 1;
    }
    debug!("image read: {loaded} entries");
    reconstruct(mem, symbols);
    Ok(symbols)
}

/// Load a split image. ROM-flagged entries come back pinned.
pub fn read_split_image(
    mem: &mut ObjectMemory,
    table_in: &mut dyn Read,
    data_in: &mut dyn Read,
) -> Result<Oop, ImageError> {
    mem.clear_for_load();
    let symbols = Oop::from_raw(read_i32(table_in)?);
    if !symbols.is_object() {
        return Err(ImageError::Corrupt("bad symbols root"));
    }
    let mut records = Vec::new();
    while let Some(index) = read_next_index(table_in)? {
        records.push(read_header_tail(table_in, index)?);
    }
    for rec in &records {
        let payload = read_payload(data_in, rec.size)?;
        let pin = rec.flags.contains(EntryFlags::ROM);
        install(mem, rec, payload, pin);
    }
    debug!("image read (split): {} entries", records.len());
    reconstruct(mem, symbols);
    Ok(symbols)
}

/// Rebuild reference counts by traversal from the symbols root, then fold
/// everything unreachable into the free lists. Pinned entries keep their
/// sentinel count either way.
pub fn reconstruct(mem: &mut ObjectMemory, symbols: Oop) {
    for idx in 0..OBJECT_TABLE_SIZE {
        let e = mem.entry_at_mut(idx);
        if e.refcount != PIN_REFCOUNT {
            e.refcount = 0;
        }
    }
    let mut visited = vec![false; OBJECT_TABLE_SIZE];
    // The nil entry is live by definition; count its class edge too.
    let nil_class = mem.entry_at(0).class;
    let mut stack = vec![symbols, nil_class];
    while let Some(o) = stack.pop() {
        if !o.is_object() {
            continue;
        }
        let idx = o.ref_index();
        {
            let e = mem.entry_at_mut(idx);
            if e.refcount != PIN_REFCOUNT {
                e.refcount += 1;
            }
        }
        if visited[idx] {
            continue;
        }
        visited[idx] = true;
        let e = mem.entry_at(idx);
        stack.push(e.class);
        if e.size > 0 {
            if let Payload::Words(w) = &e.payload {
                stack.extend_from_slice(&w[..e.size as usize]);
            }
        }
    }
    if mem.entry_at(0).refcount == 0 {
        mem.entry_at_mut(0).refcount = 1;
    }
    mem.clear_free_lists();
    let mut folded = 0usize;
    for idx in 1..OBJECT_TABLE_SIZE {
        if !visited[idx] && mem.entry_at(idx).refcount == 0 {
            mem.push_free(idx);
            folded += 1;
        }
    }
    debug!("reconstruct: {} live, {folded} folded", mem.object_count());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{dict_set, dictionary_new};

    fn small_world() -> (ObjectMemory, Oop) {
        let mut mem = ObjectMemory::new();
        let symbols = dictionary_new(&mut mem, 5, NIL, NIL);
        mem.incr(symbols);
        let name = mem.alloc_string("Object");
        mem.incr(name);
        let value = mem.alloc_word(2);
        mem.incr(value);
        dict_set(&mut mem, symbols, name, value, NIL);
        mem.decr(name);
        mem.decr(value);
        (mem, symbols)
    }

    #[test]
    fn test_single_file_round_trip_preserves_object_count() {
        let (mem, symbols) = small_world();
        let before = mem.object_count();
        let mut buf = Vec::new();
        write_image(&mem, symbols, &[], &mut buf).unwrap();

        let mut fresh = ObjectMemory::new();
        let root = read_image(&mut fresh, &mut buf.as_slice()).unwrap();
        assert_eq!(root, symbols);
        assert_eq!(fresh.object_count(), before);
    }

    #[test]
    fn test_split_round_trip_pins_rom_entries() {
        let (mut mem, symbols) = small_world();
        let string_class = mem.alloc_word(0);
        mem.incr(string_class);
        let s = mem.alloc_string("rom text");
        mem.set_class_field(s, string_class);
        mem.incr(s);
        // Reachable via symbols so it survives reconstruction.
        let key = mem.alloc_string("motd");
        mem.incr(key);
        dict_set(&mut mem, symbols, key, s, NIL);

        let mut table = Vec::new();
        let mut data = Vec::new();
        write_split_image(&mem, symbols, &[string_class], &mut table, &mut data).unwrap();

        let mut fresh = ObjectMemory::new();
        read_split_image(&mut fresh, &mut table.as_slice(), &mut data.as_slice()).unwrap();
        assert_eq!(fresh.entry(s).refcount, PIN_REFCOUNT);
        assert_eq!(crate::objects::text_of(&fresh, s), b"rom text");
    }

    #[test]
    fn test_reconstruct_folds_unreachable_entries() {
        let (mut mem, symbols) = small_world();
        // Unreachable garbage: refcount forced to 0, junk payload.
        let junk = mem.alloc_word(3);
        let junk_idx = junk.ref_index();
        mem.basic_at_put(junk, 1, Oop::new_integer(42));

        reconstruct(&mut mem, symbols);
        assert_eq!(mem.entry_at(junk_idx).refcount, 0);
        // It went back to a free list and comes out of the allocator.
        let again = mem.alloc_word(3);
        assert_eq!(again.ref_index(), junk_idx);
    }

    #[test]
    fn test_reconstruct_counts_match_hand_count() {
        let (mut mem, symbols) = small_world();
        reconstruct(&mut mem, symbols);
        // Bucket table of the symbols dictionary: referenced once.
        let table = mem.basic_at(symbols, crate::objects::DICT_TABLE);
        assert_eq!(mem.entry(table).refcount, 1);
        assert_eq!(mem.entry(symbols).refcount, 1);
    }

    #[test]
    fn test_truncated_stream_is_corrupt() {
        let (mem, symbols) = small_world();
        let mut buf = Vec::new();
        write_image(&mem, symbols, &[], &mut buf).unwrap();
        buf.truncate(buf.len() - 3);
        let mut fresh = ObjectMemory::new();
        let err = read_image(&mut fresh, &mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, ImageError::Corrupt(_)));
    }

    #[test]
    fn test_out_of_range_index_is_corrupt() {
        let mut buf = Vec::new();
        write_i32(&mut buf, Oop::reference(2).raw()).unwrap();
        write_i32(&mut buf, OBJECT_TABLE_SIZE as i32 + 7).unwrap();
        write_i32(&mut buf, 0).unwrap();
        write_i16(&mut buf, 0).unwrap();
        write_i16(&mut buf, 0).unwrap();
        let mut fresh = ObjectMemory::new();
        let err = read_image(&mut fresh, &mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, ImageError::Corrupt(_)));
    }
}
