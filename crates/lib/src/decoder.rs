//! Inbound payload decoding: raw transport bytes to a canonical [`InboundMessage`].
//!
//! Payloads are JSON envelopes, either `{"sender", "body"}` or, for messages that arrive
//! split into several parts, `{"sender", "parts": [..]}`. Decoding is a pure function of
//! the raw bytes and the transport metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("message body is empty")]
    Empty,
}

/// A decoded inbound message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub sender: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    /// Dedup key: the transport's message id, or a hash of the raw payload.
    pub raw_id: String,
}

/// What the inbound transport knows about a payload besides its bytes.
#[derive(Debug, Clone)]
pub struct TransportMeta {
    pub received_at: DateTime<Utc>,
    /// Transport-assigned id (e.g. a carrier or webhook delivery id). Used as the dedup key when present.
    pub message_id: Option<String>,
}

impl TransportMeta {
    /// Metadata stamped with the current time and no transport id.
    pub fn now() -> Self {
        Self {
            received_at: Utc::now(),
            message_id: None,
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    sender: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    parts: Option<Vec<String>>,
}

/// Decode a raw payload. Fails with `Malformed` when sender or body cannot be read and with `Empty` for a zero-length body.
pub fn decode(raw: &[u8], meta: &TransportMeta) -> Result<InboundMessage, DecodeError> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| DecodeError::Malformed(format!("payload is not utf-8: {}", e)))?;
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|e| DecodeError::Malformed(format!("invalid envelope: {}", e)))?;

    let sender = envelope
        .sender
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DecodeError::Malformed("missing sender".to_string()))?
        .to_string();

    let body = match (envelope.body, envelope.parts) {
        (Some(body), _) => body,
        (None, Some(parts)) => parts.concat(),
        (None, None) => return Err(DecodeError::Malformed("missing body".to_string())),
    };
    if body.is_empty() {
        return Err(DecodeError::Empty);
    }

    let raw_id = meta
        .message_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| payload_hash(raw));

    Ok(InboundMessage {
        sender,
        body,
        received_at: meta.received_at,
        raw_id,
    })
}

/// Hex SHA-256 of the raw payload.
pub fn payload_hash(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn meta() -> TransportMeta {
        TransportMeta {
            received_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            message_id: None,
        }
    }

    #[test]
    fn decodes_sender_and_body() {
        let msg = decode(br#"{"sender": " +15559999 ", "body": "hello"}"#, &meta()).unwrap();
        assert_eq!(msg.sender, "+15559999");
        assert_eq!(msg.body, "hello");
        assert_eq!(msg.received_at, meta().received_at);
        assert_eq!(msg.raw_id.len(), 64);
    }

    #[test]
    fn same_bytes_same_message() {
        let raw = br#"{"sender": "+1", "body": "x"}"#;
        assert_eq!(decode(raw, &meta()).unwrap(), decode(raw, &meta()).unwrap());
    }

    #[test]
    fn transport_id_wins_over_hash() {
        let msg = decode(
            br#"{"sender": "+1", "body": "x"}"#,
            &meta().with_message_id("pdu-42"),
        )
        .unwrap();
        assert_eq!(msg.raw_id, "pdu-42");
    }

    #[test]
    fn parts_are_concatenated_in_order() {
        let msg = decode(
            br#"{"sender": "+1", "parts": ["long mess", "age in ", "parts"]}"#,
            &meta(),
        )
        .unwrap();
        assert_eq!(msg.body, "long message in parts");
    }

    #[test]
    fn empty_body_is_empty_error() {
        assert_eq!(
            decode(br#"{"sender": "+1", "body": ""}"#, &meta()),
            Err(DecodeError::Empty)
        );
        assert_eq!(
            decode(br#"{"sender": "+1", "parts": []}"#, &meta()),
            Err(DecodeError::Empty)
        );
    }

    #[test]
    fn payload_hash_is_lowercase_hex_sha256() {
        assert_eq!(
            payload_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn malformed_inputs() {
        for raw in [
            &b"not json"[..],
            &br#"{"body": "x"}"#[..],
            &br#"{"sender": "  ", "body": "x"}"#[..],
            &br#"{"sender": "+1"}"#[..],
            &[0xff, 0xfe, 0x00][..],
        ] {
            assert!(
                matches!(decode(raw, &meta()), Err(DecodeError::Malformed(_))),
                "expected malformed for {:?}",
                raw
            );
        }
    }
}
