//! Oop: a tagged object reference, either a small integer or an index
//! into the object table.
//!
//! Encoding: 0 is nil (table index 0). Negative values are small integers
//! mapped to themselves. Odd positive values are small integers shifted
//! left one bit. Even positive values are table references, index in the
//! upper bits.

/// A tagged object reference.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Oop(i32);

/// The nil reference: table index 0.
pub const NIL: Oop = Oop(0);

/// Integers representable by arithmetic primitive results. Narrower than
/// what the encoding itself can hold; image-compiled constants depend on
/// it, so it stays at +/-16383.
pub const INT_LIMIT: i64 = 16383;

impl Oop {
    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }

    #[inline]
    pub const fn is_nil(self) -> bool {
        self.0 == 0
    }

    /// True for small integers (negative, or odd positive).
    #[inline]
    pub const fn is_integer(self) -> bool {
        self.0 < 0 || self.0 & 1 == 1
    }

    /// True for object-table references, nil included.
    #[inline]
    pub const fn is_reference(self) -> bool {
        !self.is_integer()
    }

    /// True for table references other than nil.
    #[inline]
    pub const fn is_object(self) -> bool {
        self.0 > 0 && self.0 & 1 == 0
    }

    #[inline]
    pub const fn new_integer(value: i32) -> Self {
        if value < 0 {
            Self(value)
        } else {
            debug_assert!(value <= i32::MAX >> 1);
            Self((value << 1) | 1)
        }
    }

    /// The integer a small-integer oop encodes.
    #[inline]
    pub const fn int_value(self) -> i32 {
        debug_assert!(self.is_integer());
        if self.0 < 0 { self.0 } else { self.0 >> 1 }
    }

    #[inline]
    pub const fn reference(index: usize) -> Self {
        Self((index as i32) << 1)
    }

    /// The object-table index a reference oop encodes.
    #[inline]
    pub const fn ref_index(self) -> usize {
        debug_assert!(self.is_reference());
        (self.0 >> 1) as usize
    }
}

/// Whether `value` fits the integer range arithmetic primitives may
/// produce. Out-of-range results are reported as nil (overflow).
#[inline]
pub const fn long_can_be_int(value: i64) -> bool {
    -INT_LIMIT <= value && value <= INT_LIMIT
}

/// Unrecoverable VM failure: diagnostic on the error stream, then stop.
pub fn fatal(msg: &str) -> ! {
    log::error!("{msg}");
    panic!("littlest: {msg}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nil_is_reference_zero() {
        assert!(NIL.is_nil());
        assert!(!NIL.is_integer());
        assert!(NIL.is_reference());
        assert!(!NIL.is_object());
        assert_eq!(NIL.ref_index(), 0);
    }

    #[test]
    fn test_integer_round_trip() {
        for v in [-16383, -1, 0, 1, 2, 40, 16383, 20000] {
            let o = Oop::new_integer(v);
            assert!(o.is_integer(), "{v} should tag as integer");
            assert_eq!(o.int_value(), v);
        }
    }

    #[test]
    fn test_negative_integers_map_to_themselves() {
        assert_eq!(Oop::new_integer(-7).raw(), -7);
        assert_eq!(Oop::new_integer(7).raw(), 15);
    }

    #[test]
    fn test_reference_round_trip() {
        for idx in [1usize, 2, 5999] {
            let o = Oop::reference(idx);
            assert!(o.is_object());
            assert!(!o.is_integer());
            assert_eq!(o.ref_index(), idx);
        }
    }

    #[test]
    fn test_long_can_be_int_boundary() {
        assert!(long_can_be_int(16383));
        assert!(long_can_be_int(-16383));
        assert!(!long_can_be_int(16384));
        assert!(!long_can_be_int(-16384));
        assert!(!long_can_be_int(40000));
    }
}
