use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Ceiling for one inbound JSON frame. A connection sending more is closed.
pub const MAX_INBOUND_FRAME_LEN: usize = 1024 * 1024;
/// Ceiling for a single ciphertext entry inside a frame.
pub const MAX_CIPHERTEXT_LEN: usize = 512 * 1024;
/// Wildcard device id: the envelope fans out to every device of the recipient.
pub const GROUP_WIDE_DEVICE: i64 = 0;

#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    InvalidJson,
    UnknownType,
    InvalidField(&'static str),
    MissingField(&'static str),
    FrameTooLarge,
    CiphertextTooLarge,
}

impl Display for FrameError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJson => write!(f, "invalid frame json"),
            Self::UnknownType => write!(f, "unknown frame type"),
            Self::InvalidField(field) => write!(f, "invalid field: {}", field),
            Self::MissingField(field) => write!(f, "missing field: {}", field),
            Self::FrameTooLarge => write!(f, "frame exceeds limits"),
            Self::CiphertextTooLarge => write!(f, "ciphertext exceeds limits"),
        }
    }
}

impl Error for FrameError {}

/// One inbound unit from a connected device. Frames carry a `type` tag;
/// an untagged frame is treated as a message envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Message(MessageFrame),
    Edit(EditFrame),
    Delete(DeleteFrame),
    Status(StatusFrame),
    Typing(TypingFrame),
    Presence,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageFrame {
    pub recipient_id: Option<i64>,
    pub recipient_group_id: Option<i64>,
    /// Per-device ciphertext map for direct envelopes, keyed by device id.
    pub ciphers: Option<BTreeMap<String, String>>,
    /// Uniform ciphertext for group envelopes.
    pub ciphertext: Option<String>,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    /// Seconds until the message expires on the relay.
    pub expiration_duration: Option<i64>,
    pub parent_id: Option<i64>,
}

fn default_message_type() -> String {
    "message".to_string()
}

impl MessageFrame {
    /// Resolves the ciphers map into `(device_id, ciphertext)` pairs.
    pub fn device_ciphers(&self) -> Result<Vec<(i64, String)>, FrameError> {
        let map = self
            .ciphers
            .as_ref()
            .ok_or(FrameError::MissingField("ciphers"))?;
        if map.is_empty() {
            return Err(FrameError::MissingField("ciphers"));
        }
        let mut pairs = Vec::with_capacity(map.len());
        for (key, ciphertext) in map {
            let device_id = key
                .parse::<i64>()
                .map_err(|_| FrameError::InvalidField("ciphers"))?;
            if device_id <= 0 {
                return Err(FrameError::InvalidField("ciphers"));
            }
            pairs.push((device_id, ciphertext.clone()));
        }
        Ok(pairs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EditFrame {
    pub message_id: i64,
    pub ciphertext: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeleteFrame {
    pub message_id: i64,
    #[serde(default)]
    pub for_everyone: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusFrame {
    pub message_id: i64,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TypingFrame {
    pub recipient_id: Option<i64>,
    pub recipient_group_id: Option<i64>,
}

/// Decodes one inbound frame. The frame ceiling is enforced before parsing,
/// the per-ciphertext ceiling right after.
pub fn decode_client_frame(text: &str) -> Result<ClientFrame, FrameError> {
    if text.len() > MAX_INBOUND_FRAME_LEN {
        return Err(FrameError::FrameTooLarge);
    }
    let value: Value = serde_json::from_str(text).map_err(|_| FrameError::InvalidJson)?;
    let tag = value
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("message")
        .to_string();
    match tag.as_str() {
        "message" => {
            let frame = serde_json::from_value::<MessageFrame>(value)
                .map_err(|_| FrameError::InvalidJson)?;
            let oversized = frame
                .ciphers
                .as_ref()
                .is_some_and(|map| map.values().any(|ct| ct.len() > MAX_CIPHERTEXT_LEN))
                || frame
                    .ciphertext
                    .as_ref()
                    .is_some_and(|ct| ct.len() > MAX_CIPHERTEXT_LEN);
            if oversized {
                return Err(FrameError::CiphertextTooLarge);
            }
            Ok(ClientFrame::Message(frame))
        }
        "edit" => {
            let frame = serde_json::from_value::<EditFrame>(value)
                .map_err(|_| FrameError::InvalidJson)?;
            if frame.ciphertext.len() > MAX_CIPHERTEXT_LEN {
                return Err(FrameError::CiphertextTooLarge);
            }
            Ok(ClientFrame::Edit(frame))
        }
        "delete" => serde_json::from_value::<DeleteFrame>(value)
            .map(ClientFrame::Delete)
            .map_err(|_| FrameError::InvalidJson),
        "status" => serde_json::from_value::<StatusFrame>(value)
            .map(ClientFrame::Status)
            .map_err(|_| FrameError::InvalidJson),
        "typing" => serde_json::from_value::<TypingFrame>(value)
            .map(ClientFrame::Typing)
            .map_err(|_| FrameError::InvalidJson),
        "presence" => Ok(ClientFrame::Presence),
        _ => Err(FrameError::UnknownType),
    }
}

/// Delivery payload relayed to a recipient device. Serialized without a
/// `type` tag: its shape alone identifies it on the client side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliverFrame {
    pub message_id: i64,
    pub sender_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
    pub ciphertext: String,
    pub message_type: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_edited: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AckFrame {
    pub status: String,
    pub message_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceiptFrame {
    pub message_id: i64,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypingNotice {
    pub sender_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorFrame {
    pub code: String,
    pub detail: String,
}

/// One outbound unit from the relay to a connected device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Deliver(DeliverFrame),
    Ack(AckFrame),
    Receipt(ReceiptFrame),
    Typing(TypingNotice),
    Error(ErrorFrame),
}

impl ServerFrame {
    fn tag(&self) -> Option<&'static str> {
        match self {
            Self::Deliver(_) => None,
            Self::Ack(_) => Some("ack"),
            Self::Receipt(_) => Some("receipt"),
            Self::Typing(_) => Some("typing"),
            Self::Error(_) => Some("error"),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut value = match self {
            Self::Deliver(frame) => serde_json::to_value(frame),
            Self::Ack(frame) => serde_json::to_value(frame),
            Self::Receipt(frame) => serde_json::to_value(frame),
            Self::Typing(frame) => serde_json::to_value(frame),
            Self::Error(frame) => serde_json::to_value(frame),
        }
        .unwrap_or_else(|_| json!({}));
        if let Some(tag) = self.tag() {
            if let Some(obj) = value.as_object_mut() {
                obj.insert("type".to_string(), json!(tag));
            }
        }
        value
    }

    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_frame_is_a_message() {
        let frame = decode_client_frame(
            r#"{"recipient_id": 7, "ciphers": {"1": "ctA", "2": "ctB"}, "message_type": "cipher"}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::Message(msg) => {
                assert_eq!(msg.recipient_id, Some(7));
                assert_eq!(msg.message_type, "cipher");
                let pairs = msg.device_ciphers().unwrap();
                assert_eq!(pairs, vec![(1, "ctA".to_string()), (2, "ctB".to_string())]);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn message_type_defaults() {
        let frame = decode_client_frame(r#"{"recipient_id": 3, "ciphers": {"1": "ct"}}"#).unwrap();
        match frame {
            ClientFrame::Message(msg) => assert_eq!(msg.message_type, "message"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn tagged_variants_decode() {
        assert_eq!(
            decode_client_frame(r#"{"type": "status", "message_id": 5, "status": "read"}"#),
            Ok(ClientFrame::Status(StatusFrame {
                message_id: 5,
                status: "read".to_string(),
            }))
        );
        assert_eq!(
            decode_client_frame(r#"{"type": "delete", "message_id": 9, "for_everyone": true}"#),
            Ok(ClientFrame::Delete(DeleteFrame {
                message_id: 9,
                for_everyone: true,
            }))
        );
        assert_eq!(
            decode_client_frame(r#"{"type": "presence"}"#),
            Ok(ClientFrame::Presence)
        );
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert_eq!(
            decode_client_frame(r#"{"type": "teleport"}"#),
            Err(FrameError::UnknownType)
        );
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let padding = "x".repeat(MAX_INBOUND_FRAME_LEN);
        let raw = format!(r#"{{"recipient_id": 1, "ciphers": {{"1": "{}"}}}}"#, padding);
        assert_eq!(decode_client_frame(&raw), Err(FrameError::FrameTooLarge));
    }

    #[test]
    fn oversized_ciphertext_is_rejected_at_decode() {
        let ciphertext = "x".repeat(MAX_CIPHERTEXT_LEN + 1);
        let raw = format!(r#"{{"recipient_id": 1, "ciphers": {{"1": "{}"}}}}"#, ciphertext);
        assert_eq!(decode_client_frame(&raw), Err(FrameError::CiphertextTooLarge));
        let raw = format!(
            r#"{{"recipient_group_id": 4, "ciphertext": "{}"}}"#,
            ciphertext
        );
        assert_eq!(decode_client_frame(&raw), Err(FrameError::CiphertextTooLarge));
        let raw = format!(
            r#"{{"type": "edit", "message_id": 5, "ciphertext": "{}"}}"#,
            ciphertext
        );
        assert_eq!(decode_client_frame(&raw), Err(FrameError::CiphertextTooLarge));
    }

    #[test]
    fn device_ciphers_reject_bad_keys() {
        let msg = MessageFrame {
            recipient_id: Some(1),
            recipient_group_id: None,
            ciphers: Some(BTreeMap::from([("zero".to_string(), "ct".to_string())])),
            ciphertext: None,
            message_type: "message".to_string(),
            expiration_duration: None,
            parent_id: None,
        };
        assert_eq!(
            msg.device_ciphers(),
            Err(FrameError::InvalidField("ciphers"))
        );
        let wildcard = MessageFrame {
            ciphers: Some(BTreeMap::from([("0".to_string(), "ct".to_string())])),
            ..msg
        };
        assert_eq!(
            wildcard.device_ciphers(),
            Err(FrameError::InvalidField("ciphers"))
        );
    }

    #[test]
    fn ack_frame_carries_type_tag() {
        let frame = ServerFrame::Ack(AckFrame {
            status: "sent_to_relay".to_string(),
            message_ids: vec![42],
        });
        let value = frame.to_value();
        assert_eq!(value["type"], json!("ack"));
        assert_eq!(value["status"], json!("sent_to_relay"));
    }

    #[test]
    fn deliver_frame_is_untagged() {
        let frame = ServerFrame::Deliver(DeliverFrame {
            message_id: 11,
            sender_id: 2,
            group_id: None,
            ciphertext: "ct".to_string(),
            message_type: "message".to_string(),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            expires_at: None,
            parent_id: None,
            is_edited: false,
            is_deleted: false,
        });
        let value = frame.to_value();
        assert!(value.get("type").is_none());
        assert!(value.get("expires_at").is_none());
        assert!(value.get("is_edited").is_none());
        assert_eq!(value["message_id"], json!(11));
    }
}
