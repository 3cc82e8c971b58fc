use std::fmt;
use std::ops::{BitAnd, BitOr};

use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use thiserror::Error;

/// Byte significance of a fetched buffer; `Big` puts the first byte in the
/// most significant position, which is the decoder's default orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Endian {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("bit range {lo}..{hi} out of bounds for {len}-bit buffer")]
pub struct RangeError {
    pub lo: usize,
    pub hi: usize,
    pub len: usize,
}

/// Fixed-length bit vector with LSB at index 0, backed by 64-bit limbs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Bits {
    len: usize,
    limbs: SmallVec<[u64; 2]>,
}

fn limbs_for(len: usize) -> usize {
    (len + 63) / 64
}

impl Bits {
    pub fn zero(len: usize) -> Bits {
        Bits {
            len,
            limbs: smallvec![0u64; limbs_for(len)],
        }
    }

    pub fn ones(len: usize) -> Bits {
        let mut b = Bits::zero(len);
        for i in 0..b.limbs.len() {
            b.limbs[i] = !0u64;
        }
        b.trim();
        b
    }

    /// Low `len` bits of `val`.
    pub fn new(val: u128, len: usize) -> Bits {
        let mut b = Bits::zero(len);
        if !b.limbs.is_empty() {
            b.limbs[0] = val as u64;
        }
        if b.limbs.len() > 1 {
            b.limbs[1] = (val >> 64) as u64;
        }
        b.trim();
        b
    }

    pub fn from_bytes(bytes: &[u8], endian: Endian) -> Bits {
        let mut b = Bits::zero(bytes.len() * 8);
        match endian {
            Endian::Little => {
                for (i, byte) in bytes.iter().enumerate() {
                    b.limbs[i / 8] |= (*byte as u64) << ((i % 8) * 8);
                }
            }
            Endian::Big => {
                for (i, byte) in bytes.iter().rev().enumerate() {
                    b.limbs[i / 8] |= (*byte as u64) << ((i % 8) * 8);
                }
            }
        }
        b
    }

    fn trim(&mut self) {
        let spare = self.limbs.len() * 64 - self.len;
        if spare > 0 {
            if let Some(last) = self.limbs.last_mut() {
                *last &= !0u64 >> spare;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bit(&self, i: usize) -> bool {
        assert!(i < self.len);
        self.limbs[i / 64] >> (i % 64) & 1 == 1
    }

    pub fn set_bit(&mut self, i: usize, v: bool) {
        assert!(i < self.len);
        if v {
            self.limbs[i / 64] |= 1 << (i % 64);
        } else {
            self.limbs[i / 64] &= !(1 << (i % 64));
        }
    }

    /// Low 128 bits as an unsigned integer.
    pub fn int(&self) -> u128 {
        let lo = self.limbs.first().copied().unwrap_or(0) as u128;
        let hi = self.limbs.get(1).copied().unwrap_or(0) as u128;
        hi << 64 | lo
    }

    /// Sign-extended value (the MSB of the buffer is the sign bit).
    pub fn sint(&self) -> i128 {
        let v = self.int();
        if self.len == 0 || self.len >= 128 || !self.bit(self.len - 1) {
            v as i128
        } else {
            (v | (!0u128 << self.len)) as i128
        }
    }

    pub fn hw(&self) -> u32 {
        self.limbs.iter().map(|l| l.count_ones()).sum()
    }

    pub fn is_zero(&self) -> bool {
        self.limbs.iter().all(|l| *l == 0)
    }

    pub fn slice(&self, lo: usize, hi: usize) -> Result<Bits, RangeError> {
        if lo > hi || hi > self.len {
            return Err(RangeError {
                lo,
                hi,
                len: self.len,
            });
        }
        let mut out = Bits::zero(hi - lo);
        for i in lo..hi {
            if self.bit(i) {
                out.set_bit(i - lo, true);
            }
        }
        Ok(out)
    }

    /// Concatenation with `self` in the low bits.
    pub fn concat(&self, high: &Bits) -> Bits {
        let mut out = Bits::zero(self.len + high.len);
        for i in 0..self.len {
            if self.bit(i) {
                out.set_bit(i, true);
            }
        }
        for i in 0..high.len {
            if high.bit(i) {
                out.set_bit(self.len + i, true);
            }
        }
        out
    }

    /// `(self & mask) == fix` over equal lengths.
    pub fn masked_eq(&self, mask: &Bits, fix: &Bits) -> bool {
        assert_eq!(self.len, mask.len);
        assert_eq!(self.len, fix.len);
        self.limbs
            .iter()
            .zip(mask.limbs.iter())
            .zip(fix.limbs.iter())
            .all(|((b, m), f)| b & m == *f)
    }

    /// '0'/'1' characters from bit 0 upward.
    pub fn to_bin_string(&self) -> String {
        (0..self.len)
            .map(|i| if self.bit(i) { '1' } else { '0' })
            .collect()
    }
}

impl BitAnd for &'_ Bits {
    type Output = Bits;

    fn bitand(self, rhs: Self) -> Bits {
        assert_eq!(self.len, rhs.len);
        let mut out = self.clone();
        for (l, r) in out.limbs.iter_mut().zip(rhs.limbs.iter()) {
            *l &= r;
        }
        out
    }
}

impl BitOr for &'_ Bits {
    type Output = Bits;

    fn bitor(self, rhs: Self) -> Bits {
        assert_eq!(self.len, rhs.len);
        let mut out = self.clone();
        for (l, r) in out.limbs.iter_mut().zip(rhs.limbs.iter()) {
            *l |= r;
        }
        out
    }
}

impl fmt::Display for Bits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.len <= 128 {
            write!(f, "{:#x}:{}", self.int(), self.len)
        } else {
            let msb_first: String = self.to_bin_string().chars().rev().collect();
            write!(f, "0b{}:{}", msb_first, self.len)
        }
    }
}
