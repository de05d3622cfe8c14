//! Wire codec for protocol messages.
//!
//! # Wire formats
//!
//! A connection speaks one of two formats, chosen when it is opened:
//! - [`WireFormat::Json`]: UTF-8 JSON, carried in WebSocket text frames.
//!   Byte payloads are base64 strings.
//! - [`WireFormat::MessagePack`]: MessagePack with named fields, carried in
//!   binary frames. Byte payloads are native `bin` values.
//!
//! Inbound frames are decoded by their own frame type, so a JSON connection
//! may still send MessagePack frames and vice versa.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ProtocolError, Result};

/// Maximum accepted size of a single encoded message (4 MB).
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Encoding used for a connection's outbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// JSON text frames.
    #[default]
    Json,
    /// MessagePack binary frames.
    MessagePack,
}

/// An encoded message ready to be placed in a transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    /// Text frame payload.
    Text(String),
    /// Binary frame payload.
    Binary(Vec<u8>),
}

impl WireFormat {
    /// Parse a format name as used in the connection query string.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "json" => Some(WireFormat::Json),
            "msgpack" | "messagepack" => Some(WireFormat::MessagePack),
            _ => None,
        }
    }

    /// Pick the format from a URI query string such as `format=msgpack&x=1`.
    ///
    /// Unknown or missing values fall back to JSON.
    pub fn from_query(query: Option<&str>) -> Self {
        query
            .into_iter()
            .flat_map(|q| q.split('&'))
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "format")
            .and_then(|(_, value)| Self::from_name(value))
            .unwrap_or_default()
    }

    /// Encode a message in this format.
    pub fn encode<T: Serialize>(&self, message: &T) -> Result<Encoded> {
        let encoded = match self {
            WireFormat::Json => Encoded::Text(serde_json::to_string(message)?),
            WireFormat::MessagePack => Encoded::Binary(rmp_serde::to_vec_named(message)?),
        };

        if encoded.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: encoded.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        Ok(encoded)
    }
}

impl Encoded {
    /// Length of the encoded payload in bytes.
    pub fn len(&self) -> usize {
        match self {
            Encoded::Text(text) => text.len(),
            Encoded::Binary(bytes) => bytes.len(),
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decode a JSON text frame.
pub fn decode_text<T: DeserializeOwned>(text: &str) -> Result<T> {
    check_size(text.len())?;
    Ok(serde_json::from_str(text)?)
}

/// Decode a MessagePack binary frame.
pub fn decode_binary<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    check_size(bytes.len())?;
    Ok(rmp_serde::from_slice(bytes)?)
}

fn check_size(size: usize) -> Result<()> {
    if size > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

/// Serde helper for byte payloads.
///
/// Human-readable formats (JSON) carry base64 strings, compact formats
/// (MessagePack) carry raw bytes.
pub mod payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&STANDARD.encode(data))
        } else {
            serde_bytes::serialize(data, serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        if deserializer.is_human_readable() {
            let encoded = String::deserialize(deserializer)?;
            STANDARD
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom)
        } else {
            serde_bytes::deserialize(deserializer)
        }
    }
}
