//! Client-facing error envelope and its wire encodings.

use http::HeaderMap;
use http::header::{ACCEPT, HeaderValue};
use prost::Message;
use serde::{Deserialize, Serialize};

const JSON: &str = "application/json";
const OCTET_STREAM: &str = "application/octet-stream";
const PROTOBUF: &str = "application/x-protobuf";

/// Error body returned to clients.
#[derive(Clone, PartialEq, Serialize, Deserialize, Message)]
pub struct ErrorEnvelope {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, repeated, tag = "3")]
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
}

/// One flattened cause.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Message)]
pub struct ErrorEntry {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub message: String,
}

impl ErrorEntry {
    #[must_use]
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Response body encoding picked from the `Accept` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Marshaler {
    #[default]
    Json,
    Binary,
}

impl Marshaler {
    /// Binary when any accepted media type is protobuf or an octet stream.
    #[must_use]
    pub fn from_accept(headers: &HeaderMap) -> Self {
        let binary = headers
            .get_all(ACCEPT)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(|media| media.split(';').next().unwrap_or_default().trim())
            .any(|media| {
                media.eq_ignore_ascii_case(OCTET_STREAM) || media.eq_ignore_ascii_case(PROTOBUF)
            });

        if binary { Self::Binary } else { Self::Json }
    }

    #[must_use]
    pub fn content_type(self) -> HeaderValue {
        match self {
            Self::Json => HeaderValue::from_static(JSON),
            Self::Binary => HeaderValue::from_static(OCTET_STREAM),
        }
    }

    /// Encode `envelope` for the wire.
    ///
    /// # Errors
    /// Returns the JSON serializer error; binary encoding cannot fail.
    pub fn encode(self, envelope: &ErrorEnvelope) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::Json => serde_json::to_vec(envelope),
            Self::Binary => Ok(envelope.encode_to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> ErrorEnvelope {
        ErrorEnvelope {
            code: 11,
            message: "application identify invalid".to_string(),
            errors: vec![ErrorEntry::new(1, "internal error")],
        }
    }

    #[test]
    fn accept_header_selects_marshaler() {
        let mut headers = HeaderMap::new();
        assert_eq!(Marshaler::from_accept(&headers), Marshaler::Json);

        headers.insert(ACCEPT, HeaderValue::from_static("text/html, application/x-protobuf;q=0.9"));
        assert_eq!(Marshaler::from_accept(&headers), Marshaler::Binary);

        headers.insert(ACCEPT, HeaderValue::from_static("application/octet-stream"));
        assert_eq!(Marshaler::from_accept(&headers), Marshaler::Binary);
    }

    #[test]
    fn json_shape() {
        let bytes = Marshaler::Json.encode(&envelope()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "code": 11,
                "message": "application identify invalid",
                "errors": [{"code": 1, "message": "internal error"}]
            })
        );
    }

    #[test]
    fn binary_decodes_as_protobuf() {
        let bytes = Marshaler::Binary.encode(&envelope()).unwrap();
        assert_eq!(ErrorEnvelope::decode(bytes.as_slice()).unwrap(), envelope());
    }
}
