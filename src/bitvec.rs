// Copyright 2023 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! Explicit-length bit vectors used for every scan chain transfer.
//!
//! Bits are stored least-significant-bit first: index 0 is the first bit
//! appended, and the first bit shifted into TDI (or out of TDO) during a scan.
//! The same ordering is used for transmit and receive, so a vector captured
//! from TDO can be sliced with the same offsets used to build the TDI vector.

use std::fmt;
use std::iter::FromIterator;
use jtagdap::bitvec::{self as bits, Error as BitsError};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Not enough bits: requested {requested} but only {available} available.")]
    NotEnoughBits { requested: usize, available: usize },
    #[error("Field widths sum to {requested} bits but vector is only {available} bits long.")]
    MalformedFieldWidths { requested: usize, available: usize },
    #[error("Unsupported word size of {0} bits.")]
    InvalidWordSize(usize),
    #[error("Value 0x{value:X} does not fit in {width} bits.")]
    ValueTooWide { width: usize, value: u64 },
    #[error("Bit conversion error")]
    Conversion(#[from] BitsError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// An ordered sequence of bits with a definite length.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct BitVec {
    bits: Vec<bool>,
}

impl BitVec {
    /// Create an empty vector.
    pub fn new() -> Self {
        BitVec { bits: Vec::new() }
    }

    /// Create a vector of `n` zero bits.
    pub fn zeros(n: usize) -> Self {
        BitVec { bits: vec![false; n] }
    }

    /// Create a vector of `n` one bits.
    pub fn ones(n: usize) -> Self {
        BitVec { bits: vec![true; n] }
    }

    /// Create a `width`-bit vector holding `value`, least significant bit first.
    ///
    /// Returns an error if `value` does not fit in `width` bits, or `width > 64`.
    pub fn from_word(width: usize, value: u64) -> Result<Self> {
        if width > 64 {
            return Err(Error::InvalidWordSize(width));
        }
        if width < 64 && value >> width != 0 {
            return Err(Error::ValueTooWide { width, value });
        }
        let mut bv = BitVec::new();
        bv.append_word(width, value);
        Ok(bv)
    }

    /// Create a vector from the first `n` bits of `bytes`, least significant bit first.
    pub fn from_bytes(bytes: &[u8], n: usize) -> Result<Self> {
        if n > bytes.len() * 8 {
            return Err(Error::NotEnoughBits { requested: n, available: bytes.len() * 8 });
        }
        Ok(BitVec { bits: bits::bytes_to_bits(bytes, n)? })
    }

    /// Pack the vector into bytes, least significant bit first.
    ///
    /// If the length is not a multiple of 8, the final byte has its
    /// higher-order bits set to 0.
    pub fn to_bytes(&self) -> Vec<u8> {
        bits::bits_to_bytes(&self.bits)
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<bool> {
        self.bits.get(idx).copied()
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.bits[..]
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        self.bits.iter().copied()
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    /// Index of the first set bit, if any.
    pub fn first_one(&self) -> Option<usize> {
        self.bits.iter().position(|b| *b)
    }

    /// Append all bits of `other` after the current bits.
    pub fn append(&mut self, other: &BitVec) {
        self.bits.extend_from_slice(&other.bits);
    }

    pub fn append_ones(&mut self, n: usize) {
        self.bits.resize(self.bits.len() + n, true);
    }

    pub fn append_zeros(&mut self, n: usize) {
        self.bits.resize(self.bits.len() + n, false);
    }

    /// Append the low `width` bits of `word`, least significant bit first.
    ///
    /// Any bits of `word` above `width` are ignored; use `from_word` where
    /// the value must be checked.
    pub fn append_word(&mut self, width: usize, word: u64) {
        bits::append_word(&mut self.bits, word, width.min(64));
        self.append_zeros(width.saturating_sub(64));
    }

    /// Remove the `n` most recently appended bits.
    pub fn drop_msb(&mut self, n: usize) -> Result<()> {
        if n > self.bits.len() {
            return Err(Error::NotEnoughBits { requested: n, available: self.bits.len() });
        }
        self.bits.truncate(self.bits.len() - n);
        Ok(())
    }

    /// Remove the `n` first appended bits.
    pub fn drop_lsb(&mut self, n: usize) -> Result<()> {
        if n > self.bits.len() {
            return Err(Error::NotEnoughBits { requested: n, available: self.bits.len() });
        }
        self.bits.drain(..n);
        Ok(())
    }

    /// Split the vector into consecutive fields of the given widths, starting
    /// from the first bit, and decode each as an unsigned integer.
    ///
    /// Bits beyond the sum of `widths` are ignored.
    pub fn to_uint(&self, widths: &[usize]) -> Result<Vec<u64>> {
        let requested = widths.iter().sum();
        if requested > self.bits.len() {
            return Err(Error::MalformedFieldWidths { requested, available: self.bits.len() });
        }
        if let Some(&width) = widths.iter().find(|&&w| w > 64) {
            return Err(Error::InvalidWordSize(width));
        }
        let mut fields = Vec::with_capacity(widths.len());
        let mut rest = &self.bits[..];
        for &width in widths {
            let (word, remaining) = bits::drain_word(rest, width)?;
            fields.push(word);
            rest = remaining;
        }
        Ok(fields)
    }

    /// Decode the entire vector as a single unsigned integer.
    pub fn to_word(&self) -> Result<u64> {
        if self.bits.len() > 64 {
            return Err(Error::InvalidWordSize(self.bits.len()));
        }
        let (word, _) = bits::drain_word(&self.bits, self.bits.len())?;
        Ok(word)
    }
}

impl From<&[bool]> for BitVec {
    fn from(bits: &[bool]) -> Self {
        BitVec { bits: bits.to_vec() }
    }
}

impl From<Vec<bool>> for BitVec {
    fn from(bits: Vec<bool>) -> Self {
        BitVec { bits }
    }
}

impl FromIterator<bool> for BitVec {
    fn from_iter<I: IntoIterator<Item = bool>>(iter: I) -> Self {
        BitVec { bits: iter.into_iter().collect() }
    }
}

/// Formats as a bit string with the most recently appended bit on the left,
/// so a vector built from a word reads like its binary representation.
impl fmt::Display for BitVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for bit in self.bits.iter().rev() {
            f.write_str(if *bit { "1" } else { "0" })?;
        }
        Ok(())
    }
}

impl fmt::Debug for BitVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BitVec({}: {})", self.bits.len(), self)
    }
}

/// Convenience macro for creating a `BitVec` from 0/1 literals,
/// first-shifted bit first.
#[macro_export]
macro_rules! bv {
    ($($x:expr),* $(,)?) => {
        $crate::bitvec::BitVec::from(&[ $(($x != 0),)* ] as &[bool])
    }
}

#[test]
fn test_to_bytes() {
    assert_eq!(bv![].to_bytes(),                                     Vec::<u8>::new());
    assert_eq!(bv![1, 1, 1, 0].to_bytes(),                           vec![0x07]);
    assert_eq!(bv![1, 1, 1, 0, 0, 1, 0, 0].to_bytes(),               vec![0x27]);
    assert_eq!(bv![1, 1, 1, 0, 0, 1, 0, 0, 0, 0, 0, 1].to_bytes(),   vec![0x27, 0x08]);
}

#[test]
fn test_from_bytes() {
    assert_eq!(BitVec::from_bytes(&[0xFF], 1).unwrap(), bv![1]);
    assert_eq!(BitVec::from_bytes(&[0xFF], 8).unwrap(), bv![1, 1, 1, 1, 1, 1, 1, 1]);
    assert_eq!(BitVec::from_bytes(&[0xFF, 0x01], 10).unwrap(), bv![1, 1, 1, 1, 1, 1, 1, 1, 1, 0]);
    assert!(BitVec::from_bytes(&[0xFF], 9).is_err());
}

#[test]
fn test_from_word() {
    assert_eq!(BitVec::from_word(5, 0x1C).unwrap(), bv![0, 0, 1, 1, 1]);
    assert_eq!(BitVec::from_word(0, 0).unwrap(), bv![]);
    assert_eq!(BitVec::from_word(64, u64::MAX).unwrap(), BitVec::ones(64));
    assert!(matches!(BitVec::from_word(4, 0x10), Err(Error::ValueTooWide { width: 4, .. })));
    assert!(matches!(BitVec::from_word(65, 0), Err(Error::InvalidWordSize(65))));
}

#[test]
fn test_from_word_round_trip() {
    for width in 0..=64usize {
        let max = if width == 64 { u64::MAX } else { (1u64 << width).wrapping_sub(1) };
        for &value in &[0, 1, max / 3, max / 2, max] {
            let value = value & max;
            let bv = BitVec::from_word(width, value).unwrap();
            assert_eq!(bv.len(), width);
            assert_eq!(bv.to_uint(&[width]).unwrap(), vec![value]);
        }
    }
}

#[test]
fn test_append() {
    let mut bits = bv![1, 0];
    bits.append(&bv![0, 1, 1]);
    bits.append_ones(2);
    bits.append_zeros(1);
    assert_eq!(bits, bv![1, 0, 0, 1, 1, 1, 1, 0]);
    assert_eq!(bits.len(), 8);
}

#[test]
fn test_append_word() {
    let mut bits = bv![1, 1, 1, 1];
    bits.append_word(4, 0b1101);
    assert_eq!(bits, bv![1, 1, 1, 1, 1, 0, 1, 1]);
}

#[test]
fn test_drop() {
    let mut bits = bv![1, 0, 0, 1, 1, 0];
    bits.drop_lsb(2).unwrap();
    assert_eq!(bits, bv![0, 1, 1, 0]);
    bits.drop_msb(1).unwrap();
    assert_eq!(bits, bv![0, 1, 1]);
    assert!(bits.drop_msb(4).is_err());
    assert!(bits.drop_lsb(4).is_err());
    bits.drop_lsb(3).unwrap();
    assert!(bits.is_empty());
}

#[test]
fn test_to_uint() {
    let bits = bv![1, 0, 0, 0, 1, 0, 1, 0, 1, 1, 0, 0, 0, 0, 1, 0];
    assert_eq!(bits.to_uint(&[8, 8]).unwrap(), vec![0x51, 0x43]);
    assert_eq!(bits.to_uint(&[4, 4, 8]).unwrap(), vec![0x1, 0x5, 0x43]);
    assert_eq!(bits.to_uint(&[3]).unwrap(), vec![0x1]);
    assert!(matches!(bits.to_uint(&[8, 9]),
                     Err(Error::MalformedFieldWidths { requested: 17, available: 16 })));
}

#[test]
fn test_to_word() {
    let mut bits = BitVec::new();
    bits.append_word(32, 0xBCAE4351);
    assert_eq!(bits.to_word().unwrap(), 0xBCAE4351);
    assert!(matches!(BitVec::zeros(65).to_word(), Err(Error::InvalidWordSize(65))));
    assert!(matches!(BitVec::zeros(70).to_uint(&[2, 66]), Err(Error::InvalidWordSize(66))));
}

#[test]
fn test_append_wide_word() {
    let mut bits = BitVec::new();
    bits.append_word(66, u64::MAX);
    assert_eq!(bits.len(), 66);
    assert_eq!(bits.count_ones(), 64);
    assert_eq!(bits.get(65), Some(false));
}

#[test]
fn test_display() {
    assert_eq!(BitVec::from_word(5, 0x1C).unwrap().to_string(), "11100");
    assert_eq!(format!("{:?}", bv![1, 0]), "BitVec(2: 01)");
}

#[test]
fn test_first_one() {
    assert_eq!(bv![0, 0, 1, 0, 1].first_one(), Some(2));
    assert_eq!(bv![0, 0].first_one(), None);
    assert_eq!(bv![0, 0, 1, 0, 1].count_ones(), 2);
}
