//! The fixed-tag primitive codecs.
//!
//! Each primitive type owns a single-byte tag that is part of the wire
//! contract. Multi-byte payloads are big-endian. Chars are a single UTF-16
//! code unit, so values outside the basic multilingual plane cannot be stored
//! as a char primitive (store them in a string instead).

use std::io::{self, Write};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    io_utils::{read_exact_or_truncated, read_u16_be},
    mutf8,
    value::Value,
    Error, Result,
};

/// The wire tag of a primitive value, written directly after the
/// [`ValueTag::Primitive`](crate::encode::ValueTag) byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PrimitiveTag {
    /// A boolean, one byte, 0 or 1.
    Bool = 0x00,
    /// A signed byte, two's complement.
    I8 = 0x01,
    /// A single UTF-16 code unit.
    Char = 0x02,
    /// A signed 16-bit integer.
    I16 = 0x03,
    /// A signed 32-bit integer.
    I32 = 0x04,
    /// A signed 64-bit integer.
    I64 = 0x05,
    /// An IEEE-754 single-precision float.
    F32 = 0x06,
    /// An IEEE-754 double-precision float.
    F64 = 0x07,
    /// A length-prefixed modified UTF-8 string.
    Str = 0x08,
}

/// Returns the primitive tag for `value`, or `None` if it is not a primitive.
pub(crate) fn tag_of(value: &Value) -> Option<PrimitiveTag> {
    Some(match value {
        Value::Bool(_) => PrimitiveTag::Bool,
        Value::I8(_) => PrimitiveTag::I8,
        Value::Char(_) => PrimitiveTag::Char,
        Value::I16(_) => PrimitiveTag::I16,
        Value::I32(_) => PrimitiveTag::I32,
        Value::I64(_) => PrimitiveTag::I64,
        Value::F32(_) => PrimitiveTag::F32,
        Value::F64(_) => PrimitiveTag::F64,
        Value::Str(_) => PrimitiveTag::Str,
        _ => return None,
    })
}

/// Writes the primitive tag and payload of `value`.
///
/// # Errors
/// Returns an error if `value` is not a primitive, cannot be represented on
/// the wire, or the underlying writer fails.
pub(crate) fn write<W: Write>(writer: &mut W, value: &Value) -> Result<()> {
    let io_err = |e: io::Error| Error::io(e, "writing primitive value");
    let Some(tag) = tag_of(value) else {
        return Err(Error::encode(format!(
            "{} value is not a primitive",
            value.kind()
        )));
    };
    writer.write_all(&[u8::from(tag)]).map_err(io_err)?;
    match value {
        Value::Bool(v) => writer.write_all(&[u8::from(*v)]),
        Value::I8(v) => writer.write_all(&v.to_be_bytes()),
        Value::Char(c) => {
            let code = u32::from(*c);
            if code > u32::from(u16::MAX) {
                return Err(Error::encode(format!(
                    "char U+{code:04X} is outside the basic multilingual plane"
                )));
            }
            writer.write_all(&(code as u16).to_be_bytes())
        }
        Value::I16(v) => writer.write_all(&v.to_be_bytes()),
        Value::I32(v) => writer.write_all(&v.to_be_bytes()),
        Value::I64(v) => writer.write_all(&v.to_be_bytes()),
        Value::F32(v) => writer.write_all(&v.to_be_bytes()),
        Value::F64(v) => writer.write_all(&v.to_be_bytes()),
        Value::Str(s) => writer.write_all(&mutf8::encode(s)?),
        _ => unreachable!("tag_of only matches primitives"),
    }
    .map_err(io_err)
}

/// Reads the payload of a primitive with the given `tag`.
///
/// # Errors
/// Returns an error if the stream ends mid-payload or the payload is not a
/// valid value of the tagged type.
pub(crate) fn read<R: io::Read>(reader: &mut R, tag: PrimitiveTag) -> Result<Value> {
    const CONTEXT: &str = "reading primitive value";
    Ok(match tag {
        PrimitiveTag::Bool => {
            let [byte] = read_array(reader)?;
            Value::Bool(byte != 0)
        }
        PrimitiveTag::I8 => Value::I8(i8::from_be_bytes(read_array(reader)?)),
        PrimitiveTag::Char => {
            let unit = u16::from_be_bytes(read_array(reader)?);
            let c = char::from_u32(u32::from(unit)).ok_or_else(|| {
                Error::decode(format!("char code unit 0x{unit:04x} is a surrogate"))
            })?;
            Value::Char(c)
        }
        PrimitiveTag::I16 => Value::I16(i16::from_be_bytes(read_array(reader)?)),
        PrimitiveTag::I32 => Value::I32(i32::from_be_bytes(read_array(reader)?)),
        PrimitiveTag::I64 => Value::I64(i64::from_be_bytes(read_array(reader)?)),
        PrimitiveTag::F32 => Value::F32(f32::from_be_bytes(read_array(reader)?)),
        PrimitiveTag::F64 => Value::F64(f64::from_be_bytes(read_array(reader)?)),
        PrimitiveTag::Str => {
            let len = read_u16_be(reader, CONTEXT)? as usize;
            let mut buf = vec![0; len];
            read_exact_or_truncated(reader, &mut buf, CONTEXT)?;
            Value::Str(mutf8::decode(&buf)?)
        }
    })
}

fn read_array<const N: usize, R: io::Read>(reader: &mut R) -> Result<[u8; N]> {
    let mut buf = [0; N];
    read_exact_or_truncated(reader, &mut buf, "reading primitive value")?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn round_trip(value: Value) -> Value {
        let mut buf = Vec::new();
        write(&mut buf, &value).unwrap();
        let tag = PrimitiveTag::try_from(buf[0]).unwrap();
        read(&mut &buf[1..], tag).unwrap()
    }

    #[rstest]
    #[case::bool(Value::Bool(true), 2)]
    #[case::i8(Value::I8(0x05), 2)]
    #[case::char(Value::Char('ö'), 3)]
    #[case::i16(Value::I16(13), 3)]
    #[case::i32(Value::I32(67_567), 5)]
    #[case::i64(Value::I64(786_783_647_846_876_879), 9)]
    #[case::f32(Value::F32(42.24), 5)]
    #[case::f64(Value::F64(std::f64::consts::PI), 9)]
    #[case::str(Value::Str("abc".to_owned()), 1 + 2 + 3)]
    fn test_round_trip(#[case] value: Value, #[case] encoded_len: usize) {
        let mut buf = Vec::new();
        write(&mut buf, &value).unwrap();
        assert_eq!(buf.len(), encoded_len);
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn test_big_endian_layout() {
        let mut buf = Vec::new();
        write(&mut buf, &Value::I32(0x0102_0304)).unwrap();
        assert_eq!(buf, vec![0x04, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_astral_char_is_rejected() {
        let mut buf = Vec::new();
        let res = write(&mut buf, &Value::Char('𝄞'));
        assert!(matches!(res, Err(Error::Encode(_))));
    }

    #[test]
    fn test_surrogate_code_unit_is_rejected() {
        let res = read(&mut &[0xd8, 0x00][..], PrimitiveTag::Char);
        assert!(matches!(res, Err(Error::Decode(_))));
    }

    #[test]
    fn test_truncated_payload() {
        let res = read(&mut &[0x01, 0x02][..], PrimitiveTag::I64);
        assert!(matches!(res, Err(Error::TruncatedStream(_))));
    }

    #[test]
    fn test_unknown_tag_byte() {
        assert!(PrimitiveTag::try_from(0x09).is_err());
    }
}
