//! Proof-of-work targets.
//!
//! The `bits` field of a block header encodes a 256-bit difficulty target
//! in the compact floating-point form: one exponent byte followed by a
//! three-byte mantissa, `target = mantissa × 256^(exponent − 3)`. A header
//! satisfies proof of work when its hash, read as a 256-bit little-endian
//! integer, is less than or equal to the decoded target.
//!
//! Difficulty *adjustment* is not re-derived here: the queue checks only
//! that a header's stated target is well-formed, within the network's PoW
//! limit, and actually met by the header's hash.

use crate::error::TargetError;
use crate::types::Hash256;
use std::cmp::Ordering;
use std::fmt;

/// A 256-bit proof-of-work target, stored big-endian.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Target([u8; 32]);

impl Target {
    /// Decode a compact (`nBits`) target.
    ///
    /// Rejects the sign bit, zero targets (including mantissas shifted
    /// entirely below the ones place), and encodings whose value exceeds
    /// 256 bits.
    pub fn from_compact(bits: u32) -> Result<Self, TargetError> {
        let exponent = (bits >> 24) as i64;
        let mantissa = bits & 0x007f_ffff;
        if bits & 0x0080_0000 != 0 {
            return Err(TargetError::Negative(bits));
        }
        if mantissa == 0 {
            return Err(TargetError::Zero(bits));
        }
        if exponent > 34
            || (exponent > 33 && mantissa > 0xff)
            || (exponent > 32 && mantissa > 0xffff)
        {
            return Err(TargetError::Overflow(bits));
        }

        let mut out = [0u8; 32];
        let mantissa_bytes = [(mantissa >> 16) as u8, (mantissa >> 8) as u8, mantissa as u8];
        for (i, byte) in mantissa_bytes.iter().enumerate() {
            // Mantissa byte i sits at power-of-256 position exponent - 1 - i.
            let position = exponent - 1 - i as i64;
            if (0..32).contains(&position) {
                out[31 - position as usize] = *byte;
            }
        }
        if out == [0u8; 32] {
            // Small exponent shifted every mantissa byte out.
            return Err(TargetError::Zero(bits));
        }
        Ok(Self(out))
    }

    /// True iff `hash`, as a 256-bit little-endian integer, is ≤ this target.
    pub fn is_met_by(&self, hash: &Hash256) -> bool {
        // Compare big-endian target bytes against the reversed hash.
        for (t, h) in self.0.iter().zip(hash.as_bytes().iter().rev()) {
            match h.cmp(t) {
                Ordering::Less => return true,
                Ordering::Greater => return false,
                Ordering::Equal => {}
            }
        }
        true
    }

    /// True iff this target is no easier than `limit` (the network PoW bound).
    pub fn within_limit(&self, limit: &Target) -> bool {
        self <= limit
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target({})", hex::encode(self.0))
    }
}
