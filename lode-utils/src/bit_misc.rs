use std::ops::Range;

pub trait BitExtraction {
    /// Extract the bits [`range.start`, `range.end`) from `self`.
    #[must_use]
    fn extract_bit_range(self, range: Range<u32>) -> u64;

    /// Extract the low `num_bits` bits from `self`.
    #[must_use]
    fn low_bits(self, num_bits: u32) -> u64;

    /// Whether `self`, interpreted as an i64, fits in a signed field of
    /// `num_bits` bits.
    #[must_use]
    fn fits_signed(self, num_bits: u32) -> bool;
}

impl BitExtraction for u64 {
    fn extract_bit_range(self, range: Range<u32>) -> u64 {
        if range.start == 0 && range.end == u64::BITS {
            return self;
        }
        debug_assert!(range.start < range.end);
        (self >> range.start) & ((1 << range.len()) - 1)
    }

    fn low_bits(self, num_bits: u32) -> u64 {
        self & ((1 << num_bits) - 1)
    }

    fn fits_signed(self, num_bits: u32) -> bool {
        let value = self as i64;
        let limit = 1_i64 << (num_bits - 1);
        (-limit..limit).contains(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_operations() {
        assert_eq!(0b11000, 0b1100_0000u64.extract_bit_range(3..8));
        assert_eq!(
            0b1010_1010_0000,
            0b10101010_00001111u64.extract_bit_range(4..16)
        );
        assert_eq!(u32::MAX, u64::MAX.extract_bit_range(0..32) as u32);
        assert_eq!(0xfff, 0x1fffu64.low_bits(12));
    }

    #[test]
    fn test_range_checks() {
        assert!(127u64.fits_signed(8));
        assert!(!128u64.fits_signed(8));
        assert!((-128_i64 as u64).fits_signed(8));
        assert!(!(-129_i64 as u64).fits_signed(8));
    }
}
