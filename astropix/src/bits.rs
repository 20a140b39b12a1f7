/*!
Bit-level helpers shared by the configuration and readout paths.

The chip's shift register is loaded bit by bit, its timestamp counters are
Gray coded, and the readout link may deliver every byte with its bit order
reversed. Everything here is pure and allocation-light.
*/

use bitvec::prelude::*;
use num_traits::{PrimInt, Unsigned};

use crate::error::{Error, Result};

/// Bit sequence in shift order: index 0 is shifted into the chip first.
pub type BitVector = BitVec<u8, Msb0>;

/// Decode a Gray coded value.
///
/// XORs the value with successively larger right shifts of itself until the
/// shift runs out of bits, so the same routine serves any counter width.
pub fn gray_to_binary<T: PrimInt + Unsigned>(gray: T) -> T {
    let mut value = gray;
    let mut shifted = gray >> 1;
    while !shifted.is_zero() {
        value = value ^ shifted;
        shifted = shifted >> 1;
    }
    value
}

/// Encode a value in Gray code
pub fn binary_to_gray<T: PrimInt + Unsigned>(value: T) -> T {
    value ^ (value >> 1)
}

/// Reverse the bit order of a single byte
#[inline]
pub fn reverse_byte(byte: u8) -> u8 {
    byte.reverse_bits()
}

/// Copy a byte slice with every byte individually bit-reversed
pub fn reverse_bytes(data: &[u8]) -> Vec<u8> {
    data.iter().map(|&b| reverse_byte(b)).collect()
}

/// Append `value` as an unsigned, MSB-first slice of exactly `width` bits.
///
/// `name` only labels the error when the value does not fit.
pub fn push_uint(bits: &mut BitVector, name: &str, value: u64, width: u32) -> Result<()> {
    if !fits_width(value, width) {
        return Err(Error::out_of_range(name, value, width));
    }
    for shift in (0..width).rev() {
        bits.push((value >> shift) & 1 == 1);
    }
    Ok(())
}

/// Read `width` bits starting at `offset` as an MSB-first unsigned value
pub fn read_uint(bits: &BitSlice<u8, Msb0>, offset: usize, width: usize) -> u64 {
    bits[offset..offset + width]
        .iter()
        .by_vals()
        .fold(0u64, |acc, bit| (acc << 1) | u64::from(bit))
}

/// Whether `value` is representable in `width` unsigned bits
pub fn fits_width(value: u64, width: u32) -> bool {
    width >= 64 || value >> width == 0
}
