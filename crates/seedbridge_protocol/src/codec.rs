//! Metainfo (torrent file) payload handling for `torrent-add`.
//!
//! Validation is structural only: the payload must be a well-formed bencoded
//! dictionary carrying an `info` dictionary. Nothing inside `info` is parsed.

use base64::{
    alphabet,
    engine::{general_purpose::GeneralPurpose, DecodePaddingMode, GeneralPurposeConfig},
    Engine,
};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const DEFAULT_MAX_METAINFO_BYTES: usize = 10 * 1024 * 1024;

const REQUIRED_KEY: &[u8] = b"info";
const MAX_NESTING: usize = 64;

const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("invalid metainfo encoding: {0}")]
    InvalidEncoding(#[source] base64::DecodeError),
    #[error("metainfo too large: {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("invalid torrent structure: {0}")]
    InvalidStructure(String),
}

/// A decoded, structurally valid torrent file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    bytes: Vec<u8>,
}

impl Metainfo {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Content-addressed upload name: hex SHA-256 of the payload with a
    /// `.torrent` extension so the remote side knows what it receives.
    pub fn filename(&self) -> String {
        format!("{}.torrent", hex::encode(Sha256::digest(&self.bytes)))
    }
}

/// Decodes a base64 `metainfo` field, bounding memory before and after
/// decoding, then checks the bencode structure.
pub fn decode_metainfo(encoded: &str, max_bytes: usize) -> Result<Metainfo, MetainfoError> {
    let compact: String = encoded
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();

    let estimate = base64::decoded_len_estimate(compact.len());
    if estimate.saturating_sub(2) > max_bytes {
        return Err(MetainfoError::TooLarge {
            size: estimate,
            max: max_bytes,
        });
    }

    let bytes = PAYLOAD_ENGINE
        .decode(compact.as_bytes())
        .map_err(MetainfoError::InvalidEncoding)?;
    if bytes.len() > max_bytes {
        return Err(MetainfoError::TooLarge {
            size: bytes.len(),
            max: max_bytes,
        });
    }

    validate_structure(&bytes)?;
    Ok(Metainfo { bytes })
}

/// Checks that `bytes` is exactly one bencoded dictionary containing an
/// `info` dictionary.
pub fn validate_structure(bytes: &[u8]) -> Result<(), MetainfoError> {
    let mut scanner = Scanner { bytes, pos: 0 };
    if scanner.peek() != Some(b'd') {
        return Err(MetainfoError::InvalidStructure(
            "payload is not a bencoded dictionary".to_string(),
        ));
    }
    scanner.pos += 1;

    let mut has_info = false;
    loop {
        match scanner.peek() {
            Some(b'e') => {
                scanner.pos += 1;
                break;
            }
            Some(_) => {
                let key = scanner.byte_string().map_err(MetainfoError::InvalidStructure)?;
                let kind = scanner.skip_value(1).map_err(MetainfoError::InvalidStructure)?;
                if key == REQUIRED_KEY {
                    if kind != Kind::Dict {
                        return Err(MetainfoError::InvalidStructure(
                            "`info` is not a dictionary".to_string(),
                        ));
                    }
                    has_info = true;
                }
            }
            None => {
                return Err(MetainfoError::InvalidStructure(
                    "unterminated top-level dictionary".to_string(),
                ))
            }
        }
    }

    if scanner.pos != bytes.len() {
        return Err(MetainfoError::InvalidStructure(format!(
            "trailing data after offset {}",
            scanner.pos
        )));
    }
    if !has_info {
        return Err(MetainfoError::InvalidStructure(
            "missing required `info` dictionary".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Integer,
    Bytes,
    List,
    Dict,
}

struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_value(&mut self, depth: usize) -> Result<Kind, String> {
        if depth > MAX_NESTING {
            return Err(format!("nesting deeper than {MAX_NESTING} at offset {}", self.pos));
        }
        match self.peek() {
            Some(b'i') => {
                self.integer()?;
                Ok(Kind::Integer)
            }
            Some(b'l') => {
                self.pos += 1;
                while self.peek() != Some(b'e') {
                    if self.peek().is_none() {
                        return Err("unterminated list".to_string());
                    }
                    self.skip_value(depth + 1)?;
                }
                self.pos += 1;
                Ok(Kind::List)
            }
            Some(b'd') => {
                self.pos += 1;
                while self.peek() != Some(b'e') {
                    if self.peek().is_none() {
                        return Err("unterminated dictionary".to_string());
                    }
                    self.byte_string()?;
                    self.skip_value(depth + 1)?;
                }
                self.pos += 1;
                Ok(Kind::Dict)
            }
            Some(b'0'..=b'9') => {
                self.byte_string()?;
                Ok(Kind::Bytes)
            }
            Some(other) => Err(format!(
                "unexpected byte 0x{other:02x} at offset {}",
                self.pos
            )),
            None => Err("unexpected end of payload".to_string()),
        }
    }

    fn integer(&mut self) -> Result<(), String> {
        let start = self.pos;
        self.pos += 1;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        let digits = self.digits();
        if digits == 0 || self.peek() != Some(b'e') {
            return Err(format!("malformed integer at offset {start}"));
        }
        self.pos += 1;
        Ok(())
    }

    fn byte_string(&mut self) -> Result<&'a [u8], String> {
        let start = self.pos;
        let mut len: usize = 0;
        let mut digits = 0;
        while let Some(byte @ b'0'..=b'9') = self.peek() {
            len = len
                .checked_mul(10)
                .and_then(|v| v.checked_add(usize::from(byte - b'0')))
                .ok_or_else(|| format!("string length overflow at offset {start}"))?;
            digits += 1;
            self.pos += 1;
        }
        if digits == 0 || self.peek() != Some(b':') {
            return Err(format!("malformed string at offset {start}"));
        }
        self.pos += 1;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| format!("string at offset {start} runs past end of payload"))?;
        let value = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(value)
    }

    fn digits(&mut self) -> usize {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        self.pos - start
    }
}
