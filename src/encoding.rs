//! The frozen wire encoding for chunk payloads.
//!
//! Chunk bytes travel as text: a byte-literal of the form `b'\x00\x01...'`
//! with two lowercase hex digits per byte. Every party that touches a chunk
//! (generator, prover `store`, auditor compare, file sharder) hashes THIS
//! text form, never the decoded bytes. Changing the encoding invalidates
//! every stored hash on the network, so it is fixed here and nowhere else.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors produced while decoding chunk text back into bytes.
#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("chunk text is not a quoted byte literal")]
    NotByteLiteral,

    #[error("chunk text contains a partial hex byte")]
    PartialByte,

    #[error("invalid hex in chunk text: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Encode raw chunk bytes into the wire text form.
///
/// Output is `b'` followed by `\xNN` per byte and a closing `'`. A 4 MiB
/// chunk encodes to a little over 16 MiB of text.
pub fn encode_chunk(bytes: &[u8]) -> String {
    let mut out = Vec::with_capacity(bytes.len() * 4 + 3);
    out.extend_from_slice(b"b'");
    for &b in bytes {
        out.push(b'\\');
        out.push(b'x');
        out.push(HEX_DIGITS[(b >> 4) as usize]);
        out.push(HEX_DIGITS[(b & 0x0f) as usize]);
    }
    out.push(b'\'');
    // Only ASCII was pushed.
    String::from_utf8(out).expect("encoded chunk is ASCII")
}

/// Decode wire text back into raw bytes.
///
/// Tolerant on purpose: takes the span between the first and last quote and
/// keeps only hex digits, so escape backslashes and stray whitespace are
/// ignored. An odd number of surviving digits is an error.
pub fn decode_chunk(text: &str) -> Result<Vec<u8>, EncodingError> {
    let first = text.find('\'').ok_or(EncodingError::NotByteLiteral)?;
    let last = text.rfind('\'').ok_or(EncodingError::NotByteLiteral)?;
    if last <= first {
        return Err(EncodingError::NotByteLiteral);
    }

    let inner = &text[first + 1..last];
    let digits: String = inner.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if digits.len() % 2 != 0 {
        return Err(EncodingError::PartialByte);
    }

    Ok(hex::decode(digits)?)
}

/// SHA-256 of the text form, as lowercase hex.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}
