//! Shareable 1:1 call invites.
//!
//! An invite is JSON, gzipped, then base64 encoded so it fits in a link or
//! a QR code. Decoding is bounded to keep a hostile token from inflating
//! without limit.

use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::error::{CallError, Result};
use crate::signaling::CallKind;

pub const MAX_DECOMPRESSED_SIZE: u64 = 256 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallInvite {
    pub call_id: String,
    pub kind: CallKind,
    pub initiator_id: String,
    pub ts: i64,
}

impl CallInvite {
    pub fn new(call_id: &str, kind: CallKind, initiator_id: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            kind,
            initiator_id: initiator_id.to_string(),
            ts: chrono::Utc::now().timestamp(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)
            .map_err(|e| CallError::InvalidInvite(format!("serialize: {}", e)))?;
        let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
        gz.write_all(&json)
            .map_err(|e| CallError::InvalidInvite(format!("compress: {}", e)))?;
        let compressed = gz
            .finish()
            .map_err(|e| CallError::InvalidInvite(format!("compress: {}", e)))?;
        Ok(general_purpose::STANDARD.encode(compressed))
    }

    pub fn decode(token: &str) -> Result<Self> {
        let compressed = general_purpose::STANDARD
            .decode(token.trim())
            .map_err(|e| CallError::InvalidInvite(format!("base64: {}", e)))?;

        let mut json = Vec::new();
        GzDecoder::new(&compressed[..])
            .take(MAX_DECOMPRESSED_SIZE + 1)
            .read_to_end(&mut json)
            .map_err(|e| CallError::InvalidInvite(format!("gzip: {}", e)))?;
        if json.len() as u64 > MAX_DECOMPRESSED_SIZE {
            return Err(CallError::InvalidInvite("invite exceeds 256 KiB".into()));
        }

        serde_json::from_slice(&json).map_err(|e| CallError::InvalidInvite(format!("json: {}", e)))
    }
}
