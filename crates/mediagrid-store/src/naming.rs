//! Identifier encoding for the resources hash tree.
//!
//! A 64-bit resource identifier maps to a three-level directory path: the
//! high 16 bits name the first hash level (4 hex chars), the next 16 bits
//! the second level (4 hex chars), and the low 32 bits the resource
//! directory itself (8 hex chars).  Parsing is deliberately strict:
//! lower-case hex only, exact length.  Case-insensitive filesystems would
//! otherwise route `AB12` and `ab12` to the same directory while the
//! engine treats them as distinct identifiers.

use std::fmt;
use std::str::FromStr;

use crate::{CdnError, Result, EXTENSION_SEPARATOR, NEW_EXTENSION};

pub(crate) const BITS_PER_HEX_CHAR: u32 = 4;

/// Hex chars in each of the two hash directory levels.
pub(crate) const HASH_CHARS: usize = 4;

/// Hex chars in the resource directory name.
pub(crate) const RESOURCE_HEX_CHARS: usize =
    u64::BITS as usize / BITS_PER_HEX_CHAR as usize - HASH_CHARS * 2;

/// Parses a single lower-case hex character.
fn parse_hex_char(ch: char) -> Result<u64> {
    match ch {
        '0'..='9' => Ok(ch as u64 - '0' as u64),
        'a'..='f' => Ok(10 + ch as u64 - 'a' as u64),
        _ => Err(CdnError::BadArgument(format!("invalid hex character: {ch:?}"))),
    }
}

/// Parses a hash directory name of exactly `num_chars` lower-case hex chars.
pub(crate) fn parse_hash_name(name: &str, num_chars: usize) -> Result<u64> {
    if name.chars().count() != num_chars {
        return Err(CdnError::BadArgument(format!(
            "unexpected number of characters in hash directory name: expected {num_chars}, got {} in {name:?}",
            name.chars().count()
        )));
    }
    let mut value = 0u64;
    for ch in name.chars() {
        value = (value << BITS_PER_HEX_CHAR) | parse_hex_char(ch)?;
    }
    Ok(value)
}

/// Parses a hash1 directory name into the high-order bits of an identifier.
///
/// The result may be bitwise-ORed with [`parse_hash2_name`] and
/// [`parse_resource_name`] to reassemble the full identifier.
pub(crate) fn parse_hash1_name(name: &str) -> Result<u64> {
    Ok(parse_hash_name(name, HASH_CHARS)?
        << (u64::BITS - HASH_CHARS as u32 * BITS_PER_HEX_CHAR))
}

/// Parses a hash2 directory name into the next-high-order bits.
pub(crate) fn parse_hash2_name(name: &str) -> Result<u64> {
    Ok(parse_hash_name(name, HASH_CHARS)? << (RESOURCE_HEX_CHARS as u32 * BITS_PER_HEX_CHAR))
}

/// Parses a resource directory name into the low-order bits.
pub(crate) fn parse_resource_name(name: &str) -> Result<u64> {
    parse_hash_name(name, RESOURCE_HEX_CHARS)
}

/// Does this directory name match the pattern for a staged new resource,
/// `<8 lower hex>.new`?
pub(crate) fn is_new_resource_dir(name: &str) -> bool {
    let expected_len = RESOURCE_HEX_CHARS + 1 + NEW_EXTENSION.len();
    if name.len() != expected_len {
        return false;
    }
    let Some(stem) = name.strip_suffix(NEW_EXTENSION) else {
        return false;
    };
    let Some(stem) = stem.strip_suffix(EXTENSION_SEPARATOR) else {
        return false;
    };
    parse_resource_name(stem).is_ok()
}

/// Renders the low-order bits of `value` as `num_chars` lower-case hex chars.
fn hash_name(value: u64, num_chars: usize) -> String {
    let mut chars = vec![0u8; num_chars];
    let mut remaining = value;
    for slot in chars.iter_mut().rev() {
        let v = (remaining & 0xf) as u8;
        *slot = if v < 10 { b'0' + v } else { b'a' + v - 10 };
        remaining >>= BITS_PER_HEX_CHAR;
    }
    // Only ASCII hex digits were written
    String::from_utf8(chars).unwrap()
}

/// Unique identifier of one committed resource.
///
/// Rendered as 16 lower-case hex characters; the three directory-name
/// slices are available through [`hash1_name`](Self::hash1_name),
/// [`hash2_name`](Self::hash2_name) and
/// [`resource_name`](Self::resource_name).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

impl ResourceId {
    /// First hash directory level: bits 63..48 as 4 hex chars.
    pub fn hash1_name(self) -> String {
        hash_name(
            self.0 >> (BITS_PER_HEX_CHAR * (HASH_CHARS + RESOURCE_HEX_CHARS) as u32),
            HASH_CHARS,
        )
    }

    /// Second hash directory level: bits 47..32 as 4 hex chars.
    pub fn hash2_name(self) -> String {
        hash_name(
            self.0 >> (BITS_PER_HEX_CHAR * RESOURCE_HEX_CHARS as u32),
            HASH_CHARS,
        )
    }

    /// Resource directory name: bits 31..0 as 8 hex chars.
    pub fn resource_name(self) -> String {
        hash_name(self.0, RESOURCE_HEX_CHARS)
    }

    /// Reassembles an identifier from the three parsed field values.
    pub(crate) fn from_fields(hash1: u64, hash2: u64, resource: u64) -> Self {
        ResourceId(hash1 | hash2 | resource)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for ResourceId {
    type Err = CdnError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(ResourceId(parse_hash_name(
            s,
            HASH_CHARS * 2 + RESOURCE_HEX_CHARS,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_hex_chars_cover_u64() {
        assert_eq!(
            u64::BITS as usize / BITS_PER_HEX_CHAR as usize,
            HASH_CHARS + HASH_CHARS + RESOURCE_HEX_CHARS
        );
    }

    #[test]
    fn parse_hex_char_bounds() {
        assert_eq!(parse_hex_char('0').unwrap(), 0);
        assert_eq!(parse_hex_char('9').unwrap(), 9);
        assert_eq!(parse_hex_char('a').unwrap(), 10);
        assert_eq!(parse_hex_char('f').unwrap(), 15);
        assert!(parse_hex_char('/').is_err());
        assert!(parse_hex_char(':').is_err());
        assert!(parse_hex_char('`').is_err());
        assert!(parse_hex_char('g').is_err());
        assert!(parse_hex_char('A').is_err());
        assert!(parse_hex_char('F').is_err());
    }

    #[test]
    fn parse_hash_name_strict() {
        assert!(parse_hash_name("", HASH_CHARS).is_err());
        assert!(parse_hash_name("    ", HASH_CHARS).is_err());
        assert_eq!(parse_hash_name("0123", HASH_CHARS).unwrap(), 0x0123);
        assert_eq!(parse_hash_name("f123", HASH_CHARS).unwrap(), 0xf123);
        assert!(parse_hash_name("g123", HASH_CHARS).is_err());
        assert!(parse_hash_name("F123", HASH_CHARS).is_err());
    }

    #[test]
    fn parse_hash1_field_position() {
        assert_eq!(parse_hash1_name("0123").unwrap(), 0x0123_0000_0000_0000);
        assert_eq!(parse_hash1_name("f123").unwrap(), 0xf123_0000_0000_0000);
        assert!(parse_hash1_name("").is_err());
        assert!(parse_hash1_name("F123").is_err());
    }

    #[test]
    fn parse_hash2_field_position() {
        assert_eq!(parse_hash2_name("0123").unwrap(), 0x0000_0123_0000_0000);
        assert_eq!(parse_hash2_name("f123").unwrap(), 0x0000_f123_0000_0000);
        assert!(parse_hash2_name("01234").is_err());
    }

    #[test]
    fn parse_resource_field_position() {
        assert_eq!(parse_resource_name("01234567").unwrap(), 0x0000_0000_0123_4567);
        assert_eq!(parse_resource_name("f1234567").unwrap(), 0x0000_0000_f123_4567);
        assert!(parse_resource_name("0123456").is_err());
        assert!(parse_resource_name("F1234567").is_err());
    }

    #[test]
    fn new_resource_dir_pattern() {
        assert!(is_new_resource_dir("01234567.new"));
        assert!(is_new_resource_dir("f1234567.new"));
        assert!(!is_new_resource_dir("0123456.new"));
        assert!(!is_new_resource_dir("012345678.new"));
        assert!(!is_new_resource_dir("F1234567.new"));
        assert!(!is_new_resource_dir("01234567.NEW"));
        assert!(!is_new_resource_dir("f1234567"));
    }

    #[test]
    fn fields_reassemble_by_or() {
        for id in [0u64, 1, 0xdead_beef_cafe_f00d, u64::MAX] {
            let id = ResourceId(id);
            let reassembled = ResourceId::from_fields(
                parse_hash1_name(&id.hash1_name()).unwrap(),
                parse_hash2_name(&id.hash2_name()).unwrap(),
                parse_resource_name(&id.resource_name()).unwrap(),
            );
            assert_eq!(reassembled, id);
        }
    }

    #[test]
    fn display_from_str_round_trip() {
        for value in [0u64, 42, 0x0123_4567_89ab_cdef, u64::MAX] {
            let id = ResourceId(value);
            let rendered = id.to_string();
            assert_eq!(rendered.len(), 16);
            assert_eq!(rendered.parse::<ResourceId>().unwrap(), id);
        }
        assert!("0123456789ABCDEF".parse::<ResourceId>().is_err());
        assert!("0123".parse::<ResourceId>().is_err());
    }
}
