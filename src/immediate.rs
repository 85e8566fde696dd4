//! Tagged numeric widths shared by registers, memory, and operand encoding.

use std::cmp::Ordering;
use std::fmt;

use strum::{Display, EnumString};

/// One of the six operand widths the instruction set knows about.
///
/// The byte-ordinal mapping (`byte=0 .. double=5`) is part of the wire
/// contract (§6): it is how a `S` operand byte is encoded and decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum DataSize {
    Byte,
    Word,
    Dword,
    Qword,
    Float,
    Double,
}

impl DataSize {
    /// Size in bytes of this width on the wire and in memory.
    pub const fn bytes(self) -> usize {
        match self {
            DataSize::Byte => 1,
            DataSize::Word => 2,
            DataSize::Dword => 4,
            DataSize::Qword => 8,
            DataSize::Float => 4,
            DataSize::Double => 8,
        }
    }

    /// Decode the wire ordinal of §6's `S` operand.
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(DataSize::Byte),
            1 => Some(DataSize::Word),
            2 => Some(DataSize::Dword),
            3 => Some(DataSize::Qword),
            4 => Some(DataSize::Float),
            5 => Some(DataSize::Double),
            _ => None,
        }
    }

    pub const fn ordinal(self) -> u8 {
        match self {
            DataSize::Byte => 0,
            DataSize::Word => 1,
            DataSize::Dword => 2,
            DataSize::Qword => 3,
            DataSize::Float => 4,
            DataSize::Double => 5,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, DataSize::Float | DataSize::Double)
    }
}

/// A tagged numeric value of one of the six [`DataSize`] widths.
///
/// Equality and ordering are defined only when both tags match (§3); a tag
/// mismatch is unequal and unordered, never a panic.
#[derive(Debug, Clone, Copy)]
pub enum Immediate {
    Byte(u8),
    Word(u16),
    Dword(u32),
    Qword(u64),
    Float(f32),
    Double(f64),
}

impl Immediate {
    pub const fn tag(&self) -> DataSize {
        match self {
            Immediate::Byte(_) => DataSize::Byte,
            Immediate::Word(_) => DataSize::Word,
            Immediate::Dword(_) => DataSize::Dword,
            Immediate::Qword(_) => DataSize::Qword,
            Immediate::Float(_) => DataSize::Float,
            Immediate::Double(_) => DataSize::Double,
        }
    }

    /// Raw value as an unsigned 64-bit integer, zero-extending integer
    /// widths and bit-casting float widths. Used for non-tag-sensitive
    /// contexts such as address arithmetic and syscall argument passing.
    pub fn as_u64(&self) -> u64 {
        match *self {
            Immediate::Byte(v) => v as u64,
            Immediate::Word(v) => v as u64,
            Immediate::Dword(v) => v as u64,
            Immediate::Qword(v) => v,
            Immediate::Float(v) => v.to_bits() as u64,
            Immediate::Double(v) => v.to_bits(),
        }
    }

    /// Coerce to an integer of the given width by truncation/zero-extension
    /// (integer source) or truncation-toward-zero (float source), per §3.
    pub fn coerce(&self, to: DataSize) -> Immediate {
        let bits = match *self {
            Immediate::Byte(v) => v as u64,
            Immediate::Word(v) => v as u64,
            Immediate::Dword(v) => v as u64,
            Immediate::Qword(v) => v,
            Immediate::Float(v) if to.is_float() => {
                return coerce_float(v as f64, to);
            }
            Immediate::Double(v) if to.is_float() => {
                return coerce_float(v, to);
            }
            Immediate::Float(v) => v as i64 as u64,
            Immediate::Double(v) => v as i64 as u64,
        };

        match to {
            DataSize::Byte => Immediate::Byte(bits as u8),
            DataSize::Word => Immediate::Word(bits as u16),
            DataSize::Dword => Immediate::Dword(bits as u32),
            DataSize::Qword => Immediate::Qword(bits),
            DataSize::Float => Immediate::Float(bits as u32 as f32),
            DataSize::Double => Immediate::Double(bits as f64),
        }
    }

    pub fn bytes(&self) -> usize {
        self.tag().bytes()
    }

    /// Encode little-endian (integer widths) or as the IEEE bit pattern of
    /// the native type (float widths), per §4.5.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match *self {
            Immediate::Byte(v) => v.to_le_bytes().to_vec(),
            Immediate::Word(v) => v.to_le_bytes().to_vec(),
            Immediate::Dword(v) => v.to_le_bytes().to_vec(),
            Immediate::Qword(v) => v.to_le_bytes().to_vec(),
            Immediate::Float(v) => v.to_bits().to_le_bytes().to_vec(),
            Immediate::Double(v) => v.to_bits().to_le_bytes().to_vec(),
        }
    }

    pub fn from_le_bytes(size: DataSize, bytes: &[u8]) -> Immediate {
        match size {
            DataSize::Byte => Immediate::Byte(bytes[0]),
            DataSize::Word => Immediate::Word(u16::from_le_bytes(bytes.try_into().unwrap())),
            DataSize::Dword => Immediate::Dword(u32::from_le_bytes(bytes.try_into().unwrap())),
            DataSize::Qword => Immediate::Qword(u64::from_le_bytes(bytes.try_into().unwrap())),
            DataSize::Float => Immediate::Float(f32::from_bits(u32::from_le_bytes(bytes.try_into().unwrap()))),
            DataSize::Double => Immediate::Double(f64::from_bits(u64::from_le_bytes(bytes.try_into().unwrap()))),
        }
    }
}

fn coerce_float(v: f64, to: DataSize) -> Immediate {
    match to {
        DataSize::Float => Immediate::Float(v as f32),
        DataSize::Double => Immediate::Double(v),
        _ => unreachable!("caller guarantees `to` is a float width"),
    }
}

impl PartialEq for Immediate {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Immediate::Byte(a), Immediate::Byte(b)) => a == b,
            (Immediate::Word(a), Immediate::Word(b)) => a == b,
            (Immediate::Dword(a), Immediate::Dword(b)) => a == b,
            (Immediate::Qword(a), Immediate::Qword(b)) => a == b,
            (Immediate::Float(a), Immediate::Float(b)) => a == b,
            (Immediate::Double(a), Immediate::Double(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialOrd for Immediate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Immediate::Byte(a), Immediate::Byte(b)) => a.partial_cmp(b),
            (Immediate::Word(a), Immediate::Word(b)) => a.partial_cmp(b),
            (Immediate::Dword(a), Immediate::Dword(b)) => a.partial_cmp(b),
            (Immediate::Qword(a), Immediate::Qword(b)) => a.partial_cmp(b),
            (Immediate::Float(a), Immediate::Float(b)) => a.partial_cmp(b),
            (Immediate::Double(a), Immediate::Double(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl fmt::Display for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Immediate::Byte(v) => write!(f, "{v}"),
            Immediate::Word(v) => write!(f, "{v}"),
            Immediate::Dword(v) => write!(f, "{v}"),
            Immediate::Qword(v) => write!(f, "{v}"),
            Immediate::Float(v) => write!(f, "{v}"),
            Immediate::Double(v) => write!(f, "{v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_mismatch_is_unequal_and_unordered() {
        let a = Immediate::Qword(5);
        let b = Immediate::Byte(5);
        assert_ne!(a, b);
        assert_eq!(a.partial_cmp(&b), None);
    }

    #[test]
    fn integer_coercion_truncates() {
        let v = Immediate::Qword(0x1_0203_0405);
        assert_eq!(v.coerce(DataSize::Byte), Immediate::Byte(0x05));
        assert_eq!(v.coerce(DataSize::Word), Immediate::Word(0x0405));
        assert_eq!(v.coerce(DataSize::Dword), Immediate::Dword(0x0203_0405));
    }

    #[test]
    fn float_to_integer_truncates_toward_zero() {
        let v = Immediate::Double(-3.9);
        assert_eq!(v.coerce(DataSize::Qword), Immediate::Qword((-3i64) as u64));
    }

    #[test]
    fn integer_to_float_converts_by_value() {
        let v = Immediate::Qword(42);
        assert_eq!(v.coerce(DataSize::Double), Immediate::Double(42.0));
    }

    #[quickcheck_macros::quickcheck]
    fn le_byte_round_trip_qword(v: u64) -> bool {
        let imm = Immediate::Qword(v);
        Immediate::from_le_bytes(DataSize::Qword, &imm.to_le_bytes()) == imm
    }
}
