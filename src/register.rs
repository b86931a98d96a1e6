//! Tagged operator value, ported from
//! `examples/original_source/algebraic-operators/src/algebra.cc`'s
//! `Register`. Cross-type comparison is a contract violation there
//! (`assert(r1.get_type() == r2.get_type())`); this version asserts the
//! same way rather than returning a `Result` for what spec.md §7 calls a
//! programming error, not a recoverable one.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// A 16-byte fixed-width string register value.
pub type Char16 = [u8; 16];

#[derive(Debug, Clone, Copy, Eq)]
pub enum Register {
    Int64(i64),
    Char16(Char16),
}

impl Register {
    pub fn from_int(value: i64) -> Self {
        Register::Int64(value)
    }

    /// Pads or truncates `value` to 16 bytes, mirroring the source's
    /// `value_string.resize(16)`.
    pub fn from_string(value: &str) -> Self {
        let mut buf = [0u8; 16];
        let bytes = value.as_bytes();
        let n = bytes.len().min(16);
        buf[..n].copy_from_slice(&bytes[..n]);
        Register::Char16(buf)
    }

    pub fn as_int(&self) -> i64 {
        match self {
            Register::Int64(v) => *v,
            Register::Char16(_) => panic!("as_int on a Char16 register"),
        }
    }

    pub fn as_char16(&self) -> Char16 {
        match self {
            Register::Char16(v) => *v,
            Register::Int64(_) => panic!("as_char16 on an Int64 register"),
        }
    }

    /// Adds `val` in place; only defined for `Int64`, matching the
    /// source's `add_int`.
    pub fn add_int(&mut self, val: i64) {
        match self {
            Register::Int64(v) => *v += val,
            Register::Char16(_) => panic!("add_int on a Char16 register"),
        }
    }

    fn same_type(&self, other: &Register) -> bool {
        matches!(
            (self, other),
            (Register::Int64(_), Register::Int64(_)) | (Register::Char16(_), Register::Char16(_))
        )
    }
}

impl PartialEq for Register {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Register::Int64(a), Register::Int64(b)) => a == b,
            (Register::Char16(a), Register::Char16(b)) => a == b,
            _ => false,
        }
    }
}

impl Hash for Register {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Register::Int64(v) => v.hash(state),
            Register::Char16(v) => v.hash(state),
        }
    }
}

impl PartialOrd for Register {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Register {
    fn cmp(&self, other: &Self) -> Ordering {
        assert!(self.same_type(other), "cross-type Register comparison");
        match (self, other) {
            (Register::Int64(a), Register::Int64(b)) => a.cmp(b),
            (Register::Char16(a), Register::Char16(b)) => a.cmp(b),
            _ => unreachable!(),
        }
    }
}
