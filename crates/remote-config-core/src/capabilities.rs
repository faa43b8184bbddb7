//! Capability bits a client advertises to the backend.
//!
//! The backend receives the set as the shortest big-endian byte string
//! holding every set bit, base64-encoded. An empty set still encodes one
//! zero byte.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use serde::{Serialize, Serializer};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(u64);

impl Capabilities {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Single capability at bit `index`.
    pub const fn bit(index: u32) -> Self {
        Self(1 << index)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Big-endian bytes with leading zero bytes stripped.
    pub fn to_bytes(self) -> Vec<u8> {
        let bytes = self.0.to_be_bytes();
        let first = bytes
            .iter()
            .position(|byte| *byte != 0)
            .unwrap_or(bytes.len() - 1);
        bytes[first..].to_vec()
    }

    pub fn to_base64(self) -> String {
        BASE64_STANDARD.encode(self.to_bytes())
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for Capabilities {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

impl FromIterator<Capabilities> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capabilities>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::union)
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Capabilities({:#x})", self.0)
    }
}

impl Serialize for Capabilities {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}
