use std::fmt;

use crate::error::TypeError;

/// Codec for unsigned integers packed into a fixed-width big-endian field.
///
/// A width of `n` bytes holds values in `0..=2^(8n)-1`. Big-endian packing
/// means the byte-wise ordering of encoded values matches their numeric
/// ordering, which is what the store's key layouts rely on.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnsignedBytes {
    width: usize,
}

impl UnsignedBytes {
    pub const ONE: Self = Self { width: 1 };
    pub const TWO: Self = Self { width: 2 };
    pub const THREE: Self = Self { width: 3 };
    pub const FOUR: Self = Self { width: 4 };
    pub const FIVE: Self = Self { width: 5 };
    pub const SIX: Self = Self { width: 6 };
    pub const SEVEN: Self = Self { width: 7 };
    pub const EIGHT: Self = Self { width: 8 };

    /// Codec for the given width in bytes (1 to 8 inclusive).
    pub fn of_width(width: usize) -> Result<Self, TypeError> {
        if (1..=8).contains(&width) {
            Ok(Self { width })
        } else {
            Err(TypeError::InvalidWidth(width))
        }
    }

    /// Smallest codec able to hold `value`.
    pub fn required_for(value: u64) -> Self {
        let significant_bits = 64 - value.leading_zeros() as usize;
        let width = significant_bits.div_ceil(8).max(1);
        Self { width }
    }

    /// Number of bytes in the field.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Largest value representable in this width.
    pub fn max_value(&self) -> u64 {
        if self.width == 8 {
            u64::MAX
        } else {
            (1u64 << (self.width * 8)) - 1
        }
    }

    /// Write `value` into the first `width` bytes of `buf`.
    pub fn put(&self, buf: &mut [u8], value: u64) -> Result<(), TypeError> {
        if value > self.max_value() {
            return Err(TypeError::ValueOutOfRange {
                value,
                width: self.width,
            });
        }
        let len = buf.len();
        let field = buf.get_mut(..self.width).ok_or(TypeError::InvalidLength {
            expected: self.width,
            actual: len,
        })?;
        let be = value.to_be_bytes();
        field.copy_from_slice(&be[8 - self.width..]);
        Ok(())
    }

    /// Read a value from the first `width` bytes of `bytes`.
    pub fn get(&self, bytes: &[u8]) -> Result<u64, TypeError> {
        let field = bytes.get(..self.width).ok_or(TypeError::InvalidLength {
            expected: self.width,
            actual: bytes.len(),
        })?;
        let mut be = [0u8; 8];
        be[8 - self.width..].copy_from_slice(field);
        Ok(u64::from_be_bytes(be))
    }

    /// Encode `value` into a freshly allocated field.
    pub fn to_bytes(&self, value: u64) -> Result<Vec<u8>, TypeError> {
        let mut buf = vec![0u8; self.width];
        self.put(&mut buf, value)?;
        Ok(buf)
    }

    /// Add one to the field in place, failing if it is already at the maximum.
    pub fn increment(&self, buf: &mut [u8]) -> Result<u64, TypeError> {
        let current = self.get(buf)?;
        let next = current
            .checked_add(1)
            .filter(|v| *v <= self.max_value())
            .ok_or(TypeError::ValueOutOfRange {
                value: current,
                width: self.width,
            })?;
        self.put(buf, next)?;
        Ok(next)
    }

    /// Subtract one from the field in place, saturating at zero.
    pub fn decrement(&self, buf: &mut [u8]) -> Result<u64, TypeError> {
        let next = self.get(buf)?.saturating_sub(1);
        self.put(buf, next)?;
        Ok(next)
    }
}

impl fmt::Debug for UnsignedBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnsignedBytes({})", self.width)
    }
}
