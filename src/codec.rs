//! Payload decoding shared by the socket and polling channels.

use crate::error::Error;
use serde::{Deserialize, Serialize};

/// Wire format of inbound payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// Parse as JSON
    #[default]
    Json,
    /// Deliver as UTF-8 text
    Text,
    /// Deliver raw bytes
    Binary,
}

/// A decoded payload, before validation and transform
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Parsed JSON document
    Json(serde_json::Value),
    /// UTF-8 text, delivered as received
    Text(String),
    /// Raw bytes
    Binary(Vec<u8>),
}

impl Payload {
    /// The JSON document, if this payload was decoded as JSON
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    /// The text, if this payload was decoded as text
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    /// The raw bytes, if this payload was decoded as binary
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }
}

impl PayloadFormat {
    /// Decode a text frame or body.
    pub fn decode_text(self, text: &str) -> Result<Payload, Error> {
        match self {
            PayloadFormat::Json => serde_json::from_str(text)
                .map(Payload::Json)
                .map_err(|e| Error::Decode(e.to_string())),
            PayloadFormat::Text => Ok(Payload::Text(text.to_owned())),
            PayloadFormat::Binary => Ok(Payload::Binary(text.as_bytes().to_vec())),
        }
    }

    /// Decode a binary frame or raw response body.
    pub fn decode_bytes(self, bytes: &[u8]) -> Result<Payload, Error> {
        match self {
            PayloadFormat::Json => serde_json::from_slice(bytes)
                .map(Payload::Json)
                .map_err(|e| Error::Decode(e.to_string())),
            PayloadFormat::Text => String::from_utf8(bytes.to_vec())
                .map(Payload::Text)
                .map_err(|e| Error::Decode(e.to_string())),
            PayloadFormat::Binary => Ok(Payload::Binary(bytes.to_vec())),
        }
    }
}
