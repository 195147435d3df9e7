//! Kinds: the 32-bit tags that classify types.

use std::fmt;

use crate::error::{Error, Result};

/// Bits of an AnyType: a reference plus a kind word.
pub const ANY_TYPE_BITS: u32 = 256 + 32;
/// Bits of an AnyValue: a reference plus an AnyType.
pub const ANY_VALUE_BITS: u32 = 256 + ANY_TYPE_BITS;
/// Bits of a `(Ref, Size)` pair as used by lists, lazies, lambdas and programs.
pub const REF_SIZE_BITS: u32 = 256 + 32;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum KindTag {
    Kind = 0,
    Bit = 1,
    Array = 2,
    Prog = 3,
    Ref = 4,
    Sum = 5,
    Product = 6,
    List = 7,
    Lazy = 8,
    Lambda = 9,
    Fractal = 10,
    Port = 11,
    Distinct = 12,
    AnyProg = 13,
    AnyType = 14,
    AnyValue = 15,
}

impl KindTag {
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => KindTag::Kind,
            1 => KindTag::Bit,
            2 => KindTag::Array,
            3 => KindTag::Prog,
            4 => KindTag::Ref,
            5 => KindTag::Sum,
            6 => KindTag::Product,
            7 => KindTag::List,
            8 => KindTag::Lazy,
            9 => KindTag::Lambda,
            10 => KindTag::Fractal,
            11 => KindTag::Port,
            12 => KindTag::Distinct,
            13 => KindTag::AnyProg,
            14 => KindTag::AnyType,
            15 => KindTag::AnyValue,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            KindTag::Kind => "Kind",
            KindTag::Bit => "Bit",
            KindTag::Array => "Array",
            KindTag::Prog => "Prog",
            KindTag::Ref => "Ref",
            KindTag::Sum => "Sum",
            KindTag::Product => "Product",
            KindTag::List => "List",
            KindTag::Lazy => "Lazy",
            KindTag::Lambda => "Lambda",
            KindTag::Fractal => "Fractal",
            KindTag::Port => "Port",
            KindTag::Distinct => "Distinct",
            KindTag::AnyProg => "AnyProg",
            KindTag::AnyType => "AnyType",
            KindTag::AnyValue => "AnyValue",
        }
    }
}

/// A kind word: the tag in the low 8 bits, kind-specific data (the arity of
/// sums and products) in the high 24 bits.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Kind(u32);

impl Kind {
    pub const KIND: Kind = Kind(KindTag::Kind as u32);
    pub const BIT: Kind = Kind(KindTag::Bit as u32);
    pub const ARRAY: Kind = Kind(KindTag::Array as u32);
    pub const PROG: Kind = Kind(KindTag::Prog as u32);
    pub const REF: Kind = Kind(KindTag::Ref as u32);
    pub const LIST: Kind = Kind(KindTag::List as u32);
    pub const LAZY: Kind = Kind(KindTag::Lazy as u32);
    pub const LAMBDA: Kind = Kind(KindTag::Lambda as u32);
    pub const FRACTAL: Kind = Kind(KindTag::Fractal as u32);
    pub const PORT: Kind = Kind(KindTag::Port as u32);
    pub const DISTINCT: Kind = Kind(KindTag::Distinct as u32);
    pub const ANY_PROG: Kind = Kind(KindTag::AnyProg as u32);
    pub const ANY_TYPE: Kind = Kind(KindTag::AnyType as u32);
    pub const ANY_VALUE: Kind = Kind(KindTag::AnyValue as u32);

    pub const MAX_ARITY: u32 = (1 << 24) - 1;

    pub fn sum(arity: u32) -> Result<Kind> {
        Self::with_arity(KindTag::Sum, arity)
    }

    pub fn product(arity: u32) -> Result<Kind> {
        Self::with_arity(KindTag::Product, arity)
    }

    fn with_arity(tag: KindTag, arity: u32) -> Result<Kind> {
        if arity > Self::MAX_ARITY {
            return Err(Error::Size(format!("arity {arity} does not fit in a kind word")));
        }
        Ok(Kind((arity << 8) | tag as u32))
    }

    /// Validate a raw kind word read from a buffer or the stack.
    pub fn from_word(word: u32) -> Result<Kind> {
        let tag = KindTag::from_u8((word & 0xff) as u8)
            .ok_or_else(|| Error::Malformed(format!("unknown kind tag {}", word & 0xff)))?;
        if !matches!(tag, KindTag::Sum | KindTag::Product) && word >> 8 != 0 {
            return Err(Error::Malformed(format!(
                "kind {} carries unexpected data {:#x}",
                tag.name(),
                word >> 8
            )));
        }
        Ok(Kind(word))
    }

    pub fn word(self) -> u32 {
        self.0
    }

    pub fn tag(self) -> KindTag {
        // Constructors only admit valid tags.
        KindTag::from_u8((self.0 & 0xff) as u8).unwrap_or(KindTag::Kind)
    }

    pub fn arity(self) -> u32 {
        self.0 >> 8
    }

    /// Bits in the encoding of a type of this kind.
    pub fn data_bits(self) -> u32 {
        match self.tag() {
            KindTag::Kind => 32,
            KindTag::Bit | KindTag::AnyProg | KindTag::AnyType | KindTag::AnyValue => 0,
            KindTag::Array => ANY_TYPE_BITS + 32,
            KindTag::Prog => 32,
            KindTag::Ref | KindTag::List | KindTag::Lazy => ANY_TYPE_BITS,
            KindTag::Sum | KindTag::Product => ANY_TYPE_BITS * self.arity(),
            KindTag::Lambda => ANY_TYPE_BITS * 2,
            KindTag::Fractal => REF_SIZE_BITS,
            KindTag::Port => ANY_TYPE_BITS * 4,
            KindTag::Distinct => ANY_TYPE_BITS + ANY_VALUE_BITS,
        }
    }
}

impl fmt::Debug for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag() {
            KindTag::Sum | KindTag::Product => write!(f, "{}/{}", self.tag().name(), self.arity()),
            tag => f.write_str(tag.name()),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_lives_in_high_bits() -> Result<()> {
        let kind = Kind::sum(3)?;
        assert_eq!(kind.word(), (3 << 8) | 5);
        assert_eq!(kind.tag(), KindTag::Sum);
        assert_eq!(kind.arity(), 3);
        assert_eq!(kind.data_bits(), 3 * ANY_TYPE_BITS);
        assert_eq!(Kind::from_word(kind.word())?, kind);
        Ok(())
    }

    #[test]
    fn rejects_bad_words() {
        assert!(Kind::from_word(16).is_err());
        assert!(Kind::from_word((1 << 8) | KindTag::Ref as u32).is_err());
        assert!(Kind::product(Kind::MAX_ARITY + 1).is_err());
    }

    #[test]
    fn data_sizes() {
        assert_eq!(Kind::KIND.data_bits(), 32);
        assert_eq!(Kind::ARRAY.data_bits(), 320);
        assert_eq!(Kind::PORT.data_bits(), 1152);
        assert_eq!(Kind::DISTINCT.data_bits(), 832);
        assert_eq!(Kind::ANY_VALUE.data_bits(), 0);
        assert_eq!(format!("{:?}", Kind::product(2).map(|k| k.word()).ok()), "Some(518)");
    }
}
