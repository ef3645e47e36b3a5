//! Hex serializers for human-readable target descriptions.
//!
//! Addresses are written as `0x…` strings when the output format is human
//! readable (YAML, JSON) and as plain integers otherwise.

use serde::{ser::SerializeSeq, ser::SerializeStruct, Serializer};
use std::ops::Range;

/// Unsigned integers which can be written either as hex strings or as numbers.
pub(crate) trait HexInt: Copy + std::fmt::LowerHex {
    fn serialize_plain<S: Serializer>(self, serializer: S) -> Result<S::Ok, S::Error>;
}

macro_rules! impl_hex_int {
    ($($ty:ty => $method:ident),*) => {
        $(
            impl HexInt for $ty {
                fn serialize_plain<S: Serializer>(self, serializer: S) -> Result<S::Ok, S::Error> {
                    serializer.$method(self)
                }
            }
        )*
    };
}

impl_hex_int!(u8 => serialize_u8, u32 => serialize_u32, u64 => serialize_u64);

pub(crate) fn hex_u_int<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: HexInt,
    S: Serializer,
{
    if serializer.is_human_readable() {
        serializer.serialize_str(&format!("{value:#x}"))
    } else {
        value.serialize_plain(serializer)
    }
}

pub(crate) fn hex_option<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
where
    T: HexInt + serde::Serialize,
    S: Serializer,
{
    match value {
        Some(value) if serializer.is_human_readable() => {
            serializer.serialize_some(&format!("{value:#x}"))
        }
        Some(value) => serializer.serialize_some(value),
        None => serializer.serialize_none(),
    }
}

pub(crate) fn hex_words<S>(words: &[u32], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let human_readable = serializer.is_human_readable();
    let mut seq = serializer.serialize_seq(Some(words.len()))?;
    for word in words {
        if human_readable {
            seq.serialize_element(&format!("{word:#010x}"))?;
        } else {
            seq.serialize_element(word)?;
        }
    }
    seq.end()
}

pub(crate) fn hex_range<S>(range: &Range<u64>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let human_readable = serializer.is_human_readable();
    let mut state = serializer.serialize_struct("Range", 2)?;
    if human_readable {
        state.serialize_field("start", &format!("{:#x}", range.start))?;
        state.serialize_field("end", &format!("{:#x}", range.end))?;
    } else {
        state.serialize_field("start", &range.start)?;
        state.serialize_field("end", &range.end)?;
    }
    state.end()
}
