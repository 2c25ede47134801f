//! Length-prefixed strings in modified UTF-8.
//!
//! Strings on the wire carry a two-byte big-endian byte count followed by the
//! string in modified UTF-8: `U+0000` is encoded as the two-byte form
//! `C0 80`, characters above `U+FFFF` are split into a UTF-16 surrogate pair
//! with each surrogate written in the three-byte form. Streams written by any
//! conforming implementation store record keys and string primitives this way,
//! so the encoding has to match byte for byte.

use crate::{Error, Result};

/// The largest encoded string the two-byte length prefix can describe.
pub(crate) const MAX_ENCODED_LEN: usize = u16::MAX as usize;

/// Returns the number of modified UTF-8 bytes `s` encodes to, excluding the
/// length prefix.
pub(crate) fn encoded_len(s: &str) -> usize {
    s.chars()
        .map(|c| match u32::from(c) {
            0x01..=0x7f => 1,
            0x00 | 0x80..=0x7ff => 2,
            0x800..=0xffff => 3,
            // surrogate pair, three bytes per surrogate
            _ => 6,
        })
        .sum()
}

/// Encodes `s` as a length-prefixed modified UTF-8 string.
///
/// # Errors
/// Returns [`Error::Encode`] if the encoded form exceeds 65535 bytes, which
/// the two-byte length prefix cannot represent.
pub(crate) fn encode(s: &str) -> Result<Vec<u8>> {
    let len = encoded_len(s);
    if len > MAX_ENCODED_LEN {
        return Err(Error::encode(format!(
            "string of {len} encoded bytes exceeds the {MAX_ENCODED_LEN} byte limit"
        )));
    }
    let mut buf = Vec::with_capacity(2 + len);
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    for c in s.chars() {
        let code = u32::from(c);
        match code {
            0x01..=0x7f => buf.push(code as u8),
            0x00 | 0x80..=0x7ff => {
                buf.push(0xc0 | (code >> 6) as u8);
                buf.push(0x80 | (code & 0x3f) as u8);
            }
            0x800..=0xffff => push_three_byte(&mut buf, code as u16),
            _ => {
                let offset = code - 0x1_0000;
                push_three_byte(&mut buf, 0xd800 | (offset >> 10) as u16);
                push_three_byte(&mut buf, 0xdc00 | (offset & 0x3ff) as u16);
            }
        }
    }
    Ok(buf)
}

fn push_three_byte(buf: &mut Vec<u8>, unit: u16) {
    buf.push(0xe0 | (unit >> 12) as u8);
    buf.push(0x80 | ((unit >> 6) & 0x3f) as u8);
    buf.push(0x80 | (unit & 0x3f) as u8);
}

/// Decodes the body of a modified UTF-8 string, after the caller has consumed
/// the length prefix.
///
/// # Errors
/// Returns [`Error::Decode`] on malformed byte groups or unpaired surrogates.
pub(crate) fn decode(bytes: &[u8]) -> Result<String> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let first = bytes[i];
        let unit = match first {
            0x00..=0x7f => {
                i += 1;
                u16::from(first)
            }
            0xc0..=0xdf => {
                let second = continuation(bytes, i + 1)?;
                i += 2;
                (u16::from(first & 0x1f) << 6) | u16::from(second)
            }
            0xe0..=0xef => {
                let second = continuation(bytes, i + 1)?;
                let third = continuation(bytes, i + 2)?;
                i += 3;
                (u16::from(first & 0x0f) << 12) | (u16::from(second) << 6) | u16::from(third)
            }
            _ => {
                return Err(Error::decode(format!(
                    "malformed modified UTF-8 lead byte 0x{first:02x}"
                )))
            }
        };
        units.push(unit);
    }
    String::from_utf16(&units)
        .map_err(|_| Error::decode("unpaired surrogate in modified UTF-8 string"))
}

fn continuation(bytes: &[u8], index: usize) -> Result<u8> {
    match bytes.get(index) {
        Some(b) if b & 0xc0 == 0x80 => Ok(b & 0x3f),
        Some(b) => Err(Error::decode(format!(
            "malformed modified UTF-8 continuation byte 0x{b:02x}"
        ))),
        None => Err(Error::decode("modified UTF-8 group ends past the string")),
    }
}
