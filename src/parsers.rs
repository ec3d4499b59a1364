use std::str::Utf8Error;

use nom::{
    combinator::*, error as ne, multi::length_data, number::complete::*, IResult,
};
use num_bigint::BigInt;

use crate::ops::ArgKind;

#[derive(Debug, Clone, PartialEq)]
/// A decoded opcode argument. Strings and bytes still point into the input.
pub enum Arg<'a> {
    None,
    UInt(u64),
    Int(i64),
    Float(f64),
    Bytes(&'a [u8]),
    Unicode(&'a str),
    /// Raw little endian two's complement bytes from `LONG1`/`LONG4`.
    Long(&'a [u8]),
}

impl Arg<'_> {
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Arg::UInt(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Why an argument could not be decoded.
pub enum ArgError {
    /// Ran out of input.
    Truncated,
    /// A unicode argument was not valid UTF-8.
    InvalidUtf8,
    /// One of the newline terminated textual encodings.
    Unsupported,
}

/// Parse the argument for an opcode with the given argument kind. It's a nom parser.
/// Textual encodings always fail.
pub fn parse_arg_with<'a, E>(kind: ArgKind, i: &'a [u8]) -> IResult<&'a [u8], Arg<'a>, E>
where
    E: ne::ParseError<&'a [u8]> + ne::FromExternalError<&'a [u8], Utf8Error>,
{
    use ArgKind as A;
    match kind {
        A::None => Ok((i, Arg::None)),
        A::UInt1 => map(u8, |v| Arg::UInt(v.into()))(i),
        A::UInt2 => map(le_u16, |v| Arg::UInt(v.into()))(i),
        A::UInt4 => map(le_u32, |v| Arg::UInt(v.into()))(i),
        A::UInt8 => map(le_u64, Arg::UInt)(i),
        A::Int4 => map(le_i32, |v| Arg::Int(v.into()))(i),
        // Integers are little endian but BINFLOAT is big endian. Really.
        A::Float8 => map(be_f64, Arg::Float)(i),
        A::Long1 => map(length_data(u8), Arg::Long)(i),
        A::Long4 => map(length_data(le_u32), Arg::Long)(i),
        A::Bytes1 | A::String1 => map(length_data(u8), Arg::Bytes)(i),
        A::Bytes4 | A::String4 => map(length_data(le_u32), Arg::Bytes)(i),
        A::Bytes8 => map(length_data(le_u64), Arg::Bytes)(i),
        A::UnicodeString1 => map(
            map_res(length_data(u8), std::str::from_utf8),
            Arg::Unicode,
        )(i),
        A::UnicodeString4 => map(
            map_res(length_data(le_u32), std::str::from_utf8),
            Arg::Unicode,
        )(i),
        A::UnicodeString8 => map(
            map_res(length_data(le_u64), std::str::from_utf8),
            Arg::Unicode,
        )(i),
        A::DecimalNlLong
        | A::DecimalNlShort
        | A::FloatNl
        | A::StringNl
        | A::StringNlNoEscape
        | A::StringNlNoEscapePair
        | A::UnicodeStringNl => fail(i),
    }
}

/// Decode one argument, returning the remaining input and the argument.
pub fn parse_arg(kind: ArgKind, i: &[u8]) -> Result<(&[u8], Arg<'_>), ArgError> {
    if kind.is_textual() {
        return Err(ArgError::Unsupported);
    }
    parse_arg_with::<ne::Error<&[u8]>>(kind, i).map_err(|e| match e {
        nom::Err::Error(e) | nom::Err::Failure(e) if e.code == ne::ErrorKind::MapRes => {
            ArgError::InvalidUtf8
        }
        _ => ArgError::Truncated,
    })
}

/// Decode a `LONG1`/`LONG4` payload. Python writes these as little endian
/// two's complement of whatever width it needs; an empty payload is zero.
/// Returns `None` when the value does not fit in an `i64`.
pub fn decode_long(b: &[u8]) -> Option<i64> {
    if b.is_empty() {
        return Some(0);
    }
    i64::try_from(&BigInt::from_signed_bytes_le(b)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_little_endian() {
        let (rest, arg) = parse_arg(ArgKind::Int4, b"\x00\x00\x80\x3f").unwrap();
        assert!(rest.is_empty());
        assert_eq!(arg, Arg::Int(0x3f80_0000));

        let (_, arg) = parse_arg(ArgKind::Int4, b"\xff\xff\xff\xff").unwrap();
        assert_eq!(arg, Arg::Int(-1));

        let (rest, arg) = parse_arg(ArgKind::UInt2, b"\x01\x02\x03").unwrap();
        assert_eq!(rest, b"\x03");
        assert_eq!(arg, Arg::UInt(0x0201));
    }

    #[test]
    fn floats_are_big_endian() {
        let one = 1.0f64.to_be_bytes();
        let (_, arg) = parse_arg(ArgKind::Float8, &one).unwrap();
        assert_eq!(arg, Arg::Float(1.0));

        let (_, arg) = parse_arg(ArgKind::Float8, b"\xc0\x09\x21\xfb\x54\x44\x2d\x18").unwrap();
        assert_eq!(arg, Arg::Float(-std::f64::consts::PI));
    }

    #[test]
    fn truncated_arguments() {
        assert_eq!(parse_arg(ArgKind::UInt1, b""), Err(ArgError::Truncated));
        assert_eq!(parse_arg(ArgKind::UInt8, b"\x01\x02\x03"), Err(ArgError::Truncated));
        assert_eq!(parse_arg(ArgKind::Float8, b"\x3f\xf0"), Err(ArgError::Truncated));
        // Length prefix promises more than there is.
        assert_eq!(parse_arg(ArgKind::Bytes1, b"\x05abc"), Err(ArgError::Truncated));
        assert_eq!(
            parse_arg(ArgKind::UnicodeString4, b"\x10\x00\x00\x00abc"),
            Err(ArgError::Truncated)
        );
        assert_eq!(
            parse_arg(ArgKind::Bytes8, b"\xff\xff\xff\xff\xff\xff\xff\xffabc"),
            Err(ArgError::Truncated)
        );
    }

    #[test]
    fn strings_and_bytes() {
        let (rest, arg) = parse_arg(ArgKind::UnicodeString1, b"\x05numpy.").unwrap();
        assert_eq!(rest, b".");
        assert_eq!(arg, Arg::Unicode("numpy"));

        let (_, arg) = parse_arg(ArgKind::Bytes4, b"\x02\x00\x00\x00\x00\xff").unwrap();
        assert_eq!(arg, Arg::Bytes(b"\x00\xff"));

        assert_eq!(
            parse_arg(ArgKind::UnicodeString1, b"\x02\xc3\x28"),
            Err(ArgError::InvalidUtf8)
        );
    }

    #[test]
    fn textual_is_unsupported() {
        assert_eq!(parse_arg(ArgKind::DecimalNlShort, b"12\n"), Err(ArgError::Unsupported));
        assert_eq!(parse_arg(ArgKind::FloatNl, b"1.5\n"), Err(ArgError::Unsupported));
    }

    #[test]
    fn longs() {
        assert_eq!(decode_long(b""), Some(0));
        assert_eq!(decode_long(b"\xff"), Some(-1));
        assert_eq!(decode_long(b"\x80"), Some(-128));
        assert_eq!(decode_long(b"\xff\x00"), Some(255));
        assert_eq!(decode_long(b"\x00\x00\x00\x00\x00\x00\x00\x80"), Some(i64::MIN));
        assert_eq!(decode_long(b"\x00\x00\x00\x00\x00\x00\x00\x00\x01"), None);
        // Redundant sign extension still fits.
        assert_eq!(decode_long(b"\xfe\xff\xff\xff\xff\xff\xff\xff\xff\xff"), Some(-2));
    }
}
