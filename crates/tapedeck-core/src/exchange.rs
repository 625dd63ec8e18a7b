//! Exchange model
//!
//! One captured request paired with the response it produced. The same
//! types are used in memory, in the captured log handed to assertions, and
//! in the snapshot file, so the serde representation is the persisted form.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// A body as stored in a snapshot
///
/// Request bodies are kept structured when they parse as JSON so snapshots
/// diff cleanly. Response bodies are kept verbatim (text or base64) so replay
/// is byte-identical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "lowercase")]
pub enum Payload {
    Json(serde_json::Value),
    Text(String),
    Base64(String),
}

impl Payload {
    /// Parse as JSON when possible, otherwise fall back to verbatim storage.
    /// Empty input yields `None`.
    pub fn structured(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() {
            return None;
        }
        match serde_json::from_slice::<serde_json::Value>(bytes) {
            Ok(value) => Some(Payload::Json(value)),
            Err(_) => Some(Self::verbatim(bytes)),
        }
    }

    /// Store the exact bytes: UTF-8 as text, anything else as base64
    pub fn verbatim(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Payload::Text(text.to_string()),
            Err(_) => Payload::Base64(BASE64.encode(bytes)),
        }
    }

    /// Reconstruct the wire bytes
    pub fn to_bytes(&self) -> Result<Bytes> {
        match self {
            Payload::Json(value) => Ok(Bytes::from(serde_json::to_vec(value)?)),
            Payload::Text(text) => Ok(Bytes::from(text.clone())),
            Payload::Base64(data) => BASE64
                .decode(data)
                .map(Bytes::from)
                .map_err(|e| Error::Serialization(format!("Invalid base64 payload: {e}"))),
        }
    }

    /// Lossy text view, handy in assertions
    pub fn text_lossy(&self) -> String {
        match self {
            Payload::Json(value) => value.to_string(),
            Payload::Text(text) => text.clone(),
            Payload::Base64(_) => self
                .to_bytes()
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default(),
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// Request half of an exchange, in its normalized (stored) form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRequest {
    pub method: String,
    /// Path and query, relative to the upstream base URL
    pub path: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Payload>,
}

/// Response body: nothing, one body, or the chunks of a streamed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "content", rename_all = "lowercase")]
pub enum ResponseBody {
    Empty,
    Full(Payload),
    Chunked(Vec<Payload>),
}

impl ResponseBody {
    pub fn is_streamed(&self) -> bool {
        matches!(self, ResponseBody::Chunked(_))
    }

    /// Number of chunks the body is emitted in
    pub fn chunk_count(&self) -> usize {
        match self {
            ResponseBody::Empty => 0,
            ResponseBody::Full(_) => 1,
            ResponseBody::Chunked(chunks) => chunks.len(),
        }
    }

    /// All body bytes concatenated
    pub fn to_bytes(&self) -> Result<Bytes> {
        match self {
            ResponseBody::Empty => Ok(Bytes::new()),
            ResponseBody::Full(payload) => payload.to_bytes(),
            ResponseBody::Chunked(chunks) => {
                let mut out = Vec::new();
                for chunk in chunks {
                    out.extend_from_slice(&chunk.to_bytes()?);
                }
                Ok(Bytes::from(out))
            }
        }
    }
}

/// Response half of an exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    pub body: ResponseBody,
}

/// One captured request/response unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    /// Position within the snapshot or captured log
    pub sequence_index: usize,
    pub request: ExchangeRequest,
    pub response: ExchangeResponse,
}
