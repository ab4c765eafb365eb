//! Conversion between Unicode strings and the legacy codepages the client
//! speaks on the wire.
//!
//! CP-1252 is one byte per code point; CP-932 is a multi-byte format in the
//! Shift-JIS family whose double-byte sequences start with a byte with the
//! high bit set and are emitted high-byte-first. Conversion is strict: any
//! malformed or unrepresentable input is an error. The packet string
//! readers and writers collapse these errors back to the empty string,
//! which is the wire-level convention; call this module directly when the
//! distinction matters.

use encoding_rs::{SHIFT_JIS, WINDOWS_1252};

use crate::error::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    /// Japanese, Shift-JIS family.
    Cp932,
    /// Western European single-byte codepage.
    Cp1252,
}

pub fn from_encoding(encoding: Encoding, bytes: &[u8]) -> Result<String, CodecError> {
    match encoding {
        Encoding::Utf8 => std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::Malformed(encoding)),
        Encoding::Cp932 => decode(SHIFT_JIS, encoding, bytes),
        Encoding::Cp1252 => decode(WINDOWS_1252, encoding, bytes),
    }
}

pub fn to_encoding(
    encoding: Encoding,
    string: &str,
    null_terminate: bool,
) -> Result<Vec<u8>, CodecError> {
    let mut out = match encoding {
        Encoding::Utf8 => string.as_bytes().to_vec(),
        Encoding::Cp932 => encode(SHIFT_JIS, encoding, string)?,
        Encoding::Cp1252 => encode(WINDOWS_1252, encoding, string)?,
    };

    if null_terminate {
        out.push(0);
    }

    Ok(out)
}

/// Length of the encoded form of `string`, without a null terminator,
/// rounded up to a multiple of `align` when `align` is nonzero.
pub fn size_encoded(encoding: Encoding, string: &str, align: usize) -> Result<usize, CodecError> {
    let size = to_encoding(encoding, string, false)?.len();

    if align > 0 {
        Ok((size + align - 1) / align * align)
    } else {
        Ok(size)
    }
}

fn decode(
    table: &'static encoding_rs::Encoding,
    encoding: Encoding,
    bytes: &[u8],
) -> Result<String, CodecError> {
    match table.decode_without_bom_handling_and_without_replacement(bytes) {
        Some(decoded) => Ok(decoded.into_owned()),
        None => Err(CodecError::Malformed(encoding)),
    }
}

fn encode(
    table: &'static encoding_rs::Encoding,
    encoding: Encoding,
    string: &str,
) -> Result<Vec<u8>, CodecError> {
    let (encoded, _, had_errors) = table.encode(string);

    if had_errors {
        return Err(CodecError::Unmappable(encoding));
    }

    Ok(encoded.into_owned())
}
