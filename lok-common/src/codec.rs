// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Wire encoding shared by REST calls and socket events.
//!
//! Protected payloads are `base64(xor(json))`. Bulk socket events wrap that
//! text once more in gzip and ship it as a byte attachment.

use std::io::{Read, Write};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid gzip payload: {0}")]
    Gzip(#[from] std::io::Error),
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected payload shape")]
    Shape,
}

/// Repeating-key XOR cipher bound to one session's password.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireCodec {
    key: Vec<u8>,
}

impl WireCodec {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    /// XOR is its own inverse. An empty key leaves the input untouched.
    pub fn xor(&self, data: &[u8]) -> Vec<u8> {
        if self.key.is_empty() {
            return data.to_vec();
        }
        data.iter()
            .zip(self.key.iter().cycle())
            .map(|(byte, key)| byte ^ key)
            .collect()
    }

    pub fn encode(&self, payload: &[u8]) -> String {
        STANDARD.encode(self.xor(payload))
    }

    pub fn decode(&self, text: &[u8]) -> Result<Vec<u8>, CodecError> {
        let trimmed = trim_ascii(text);
        let raw = STANDARD.decode(trimmed)?;
        Ok(self.xor(&raw))
    }

    pub fn encode_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<String, CodecError> {
        let bytes = serde_json::to_vec(value)?;
        Ok(self.encode(&bytes))
    }

    pub fn decode_json(&self, text: &[u8]) -> Result<Value, CodecError> {
        let bytes = self.decode(text)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Decodes a `packs` attachment: gunzip, then base64, then XOR.
    pub fn decode_packed(&self, packed: &[u8]) -> Result<Value, CodecError> {
        let text = gunzip(packed)?;
        self.decode_json(&text)
    }

    pub fn pack(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        let text = self.encode_json(value)?;
        gzip(text.as_bytes())
    }
}

pub fn gzip(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Reads a JSON value that may be a plain object, a base64 text or a byte
/// array, returning the decoded object.
pub fn decode_flexible(codec: &WireCodec, value: &Value) -> Result<Value, CodecError> {
    match value {
        Value::String(text) => codec.decode_json(text.as_bytes()),
        Value::Array(_) => {
            let bytes = value_to_bytes(value).ok_or(CodecError::Shape)?;
            codec.decode_packed(&bytes)
        }
        other => Ok(other.clone()),
    }
}

/// Converts a JSON array of numbers (how attachments arrive after JSON
/// transport) back into bytes.
pub fn value_to_bytes(value: &Value) -> Option<Vec<u8>> {
    value
        .as_array()?
        .iter()
        .map(|entry| entry.as_u64().and_then(|byte| u8::try_from(byte).ok()))
        .collect()
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|byte| !byte.is_ascii_whitespace())
        .map_or(start, |index| index + 1);
    &bytes[start..end]
}
