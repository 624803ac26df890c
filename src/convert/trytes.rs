// Trytes - balanced ternary identifiers
//
// A tryte is one of 27 symbols encoding three balanced trits (-1, 0, 1).
// Identifiers are 81 trytes (243 trits). They are packed five trits per byte,
// which fits because 3^5 = 243 <= 256, giving a 49 byte key:
// 48 full bytes plus a final byte carrying the last three trits.

use std::fmt;
use thiserror::Error;

/// Symbols in order of their value 0..=13, then -13..=-1
pub const TRYTE_ALPHABET: &str = "9ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Number of trytes in a hash, address, bundle or tag identifier
pub const HASH_TRYTES: usize = 81;

/// Packed width of an identifier in bytes
pub const PACKED_LEN: usize = 49;

const TRITS_PER_TRYTE: usize = 3;
const TRITS_PER_BYTE: usize = 5;
const HASH_TRITS: usize = HASH_TRYTES * TRITS_PER_TRYTE;

/// Errors from tryte conversion
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("Invalid tryte character {0:?}")]
    InvalidCharacter(char),

    #[error("Invalid tryte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid packed length: expected {expected}, got {actual}")]
    InvalidPackedLength { expected: usize, actual: usize },
}

fn tryte_value(c: char) -> Result<i8, ConvertError> {
    let index = TRYTE_ALPHABET
        .find(c)
        .ok_or(ConvertError::InvalidCharacter(c))? as i8;
    Ok(if index <= 13 { index } else { index - 27 })
}

fn value_tryte(value: i8) -> char {
    let index = if value < 0 { value + 27 } else { value } as usize;
    TRYTE_ALPHABET.as_bytes()[index] as char
}

/// Split a signed value into `count` balanced trits, least significant first
fn balanced_trits(mut value: i32, count: usize, out: &mut Vec<i8>) {
    for _ in 0..count {
        let mut rem = value.rem_euclid(3);
        if rem == 2 {
            rem = -1;
        }
        out.push(rem as i8);
        value = (value - rem) / 3;
    }
}

/// Check that `s` is exactly `len` trytes long and uses only tryte symbols
pub fn is_trytes(s: &str, len: usize) -> bool {
    s.len() == len && s.chars().all(|c| TRYTE_ALPHABET.contains(c))
}

/// Convert trytes into trits
pub fn trytes_to_trits(trytes: &str) -> Result<Vec<i8>, ConvertError> {
    let mut trits = Vec::with_capacity(trytes.len() * TRITS_PER_TRYTE);
    for c in trytes.chars() {
        balanced_trits(tryte_value(c)? as i32, TRITS_PER_TRYTE, &mut trits);
    }
    Ok(trits)
}

/// Convert trits into trytes, zero-padding a trailing partial tryte
pub fn trits_to_trytes(trits: &[i8]) -> String {
    trits
        .chunks(TRITS_PER_TRYTE)
        .map(|chunk| {
            let value = chunk
                .iter()
                .rev()
                .fold(0i8, |acc, &t| acc * 3 + t);
            value_tryte(value)
        })
        .collect()
}

/// Pack trits five per byte
pub fn trits_to_bytes(trits: &[i8]) -> Vec<u8> {
    trits
        .chunks(TRITS_PER_BYTE)
        .map(|chunk| {
            let value = chunk
                .iter()
                .rev()
                .fold(0i32, |acc, &t| acc * 3 + t as i32);
            value as i8 as u8
        })
        .collect()
}

/// Unpack `trit_count` trits from bytes produced by [`trits_to_bytes`]
pub fn bytes_to_trits(bytes: &[u8], trit_count: usize) -> Vec<i8> {
    let mut trits = Vec::with_capacity(bytes.len() * TRITS_PER_BYTE);
    for &byte in bytes {
        balanced_trits(byte as i8 as i32, TRITS_PER_BYTE, &mut trits);
    }
    trits.truncate(trit_count);
    trits
}

/// An 81-tryte identifier packed into 49 bytes
///
/// Used for transaction hashes, addresses, bundles and tags alike.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; PACKED_LEN]);

impl Hash {
    /// The all-nines identifier (the genesis reference)
    pub const NULL: Hash = Hash([0u8; PACKED_LEN]);

    /// Parse and pack an 81-tryte string
    pub fn from_trytes(trytes: &str) -> Result<Self, ConvertError> {
        if trytes.len() != HASH_TRYTES {
            return Err(ConvertError::InvalidLength {
                expected: HASH_TRYTES,
                actual: trytes.len(),
            });
        }
        let packed = trits_to_bytes(&trytes_to_trits(trytes)?);
        let mut bytes = [0u8; PACKED_LEN];
        bytes.copy_from_slice(&packed);
        Ok(Self(bytes))
    }

    /// Create from packed bytes read back from storage
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ConvertError> {
        if bytes.len() != PACKED_LEN {
            return Err(ConvertError::InvalidPackedLength {
                expected: PACKED_LEN,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; PACKED_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Create from raw packed bytes
    pub fn from_bytes(bytes: [u8; PACKED_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the packed bytes
    pub fn as_bytes(&self) -> &[u8; PACKED_LEN] {
        &self.0
    }

    /// Unpack back into the 81-tryte form
    pub fn to_trytes(&self) -> String {
        trits_to_trytes(&bytes_to_trits(&self.0, HASH_TRITS))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_trytes())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let trytes = self.to_trytes();
        write!(f, "Hash({}..)", &trytes[..16])
    }
}
