//! Event-hub wire messages.
//!
//! Outbound frames are [`SignedEnvelope`]s whose `event_bytes` decode to a
//! [`ControlMessage`]. Inbound frames are bare [`ControlMessage`]s.

use serde::{Deserialize, Serialize};

/// Category of events an [`Interest`] subscribes to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Block,
    FilteredBlock,
    Chaincode,
    Rejection,
}

/// Chaincode event selector carried by chaincode interests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChaincodeRegInfo {
    pub chaincode_id: String,
    pub event_name: String,
}

/// Topic descriptor registered with the event hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Interest {
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chaincode_reg_info: Option<ChaincodeRegInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

impl Interest {
    /// Interest in every event of `event_type`.
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            chaincode_reg_info: None,
            channel_id: None,
        }
    }

    /// Interest in a single named chaincode event.
    pub fn chaincode(chaincode_id: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Chaincode,
            chaincode_reg_info: Some(ChaincodeRegInfo {
                chaincode_id: chaincode_id.into(),
                event_name: event_name.into(),
            }),
            channel_id: None,
        }
    }

    /// Restricts the interest to one channel.
    pub fn on_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }
}

/// Payload variants of a [`ControlMessage`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    Register { events: Vec<Interest> },
    Unregister { events: Vec<Interest> },
    Event { payload: serde_json::Value },
}

/// Acknowledgement kinds awaited by the registration handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Register,
    Unregister,
}

impl AckKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Unregister => "unregister",
        }
    }
}

impl std::fmt::Display for AckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control unit exchanged with the event hub.
///
/// `event` is optional so that a frame carrying no object decodes instead of
/// failing; the handshake reports it as a protocol error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<EventBody>,
    #[serde(default, with = "base64_bytes")]
    pub creator: Vec<u8>,
    #[serde(default, with = "base64_bytes")]
    pub tls_cert_hash: Vec<u8>,
    #[serde(default)]
    pub timestamp_ms: u64,
}

impl ControlMessage {
    /// Builds an unsigned message around `body`.
    pub fn new(
        body: EventBody,
        creator: Vec<u8>,
        tls_cert_hash: Vec<u8>,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            event: Some(body),
            creator,
            tls_cert_hash,
            timestamp_ms,
        }
    }

    /// Returns the acknowledgement kind this message represents, if any.
    pub fn ack_kind(&self) -> Option<AckKind> {
        match self.event {
            Some(EventBody::Register { .. }) => Some(AckKind::Register),
            Some(EventBody::Unregister { .. }) => Some(AckKind::Unregister),
            Some(EventBody::Event { .. }) | None => None,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serializes with a fixed field order, so equal messages yield equal bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Serialized control message plus detached signature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedEnvelope {
    #[serde(with = "base64_bytes")]
    pub event_bytes: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

impl SignedEnvelope {
    /// Decodes the enclosed control message.
    pub fn message(&self) -> Result<ControlMessage, serde_json::Error> {
        ControlMessage::from_slice(&self.event_bytes)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn register_message_uses_tagged_body_and_base64_bytes() {
        let msg = ControlMessage::new(
            EventBody::Register {
                events: vec![Interest::new(EventType::Block)],
            },
            b"creator".to_vec(),
            vec![1, 2, 3],
            1_700_000_000_000,
        );

        let value: serde_json::Value =
            serde_json::from_slice(&msg.to_bytes().expect("encode")).expect("json");
        assert_eq!(value["event"]["type"], "register");
        assert_eq!(value["event"]["events"][0]["event_type"], "block");
        assert_eq!(value["creator"], "Y3JlYXRvcg==");
        assert_eq!(value["tls_cert_hash"], "AQID");
        assert_eq!(value["timestamp_ms"], 1_700_000_000_000u64);
    }

    #[test]
    fn serialization_is_deterministic() {
        let msg = ControlMessage::new(
            EventBody::Event {
                payload: json!({"b": 2, "a": 1}),
            },
            vec![9],
            Vec::new(),
            5,
        );
        assert_eq!(msg.to_bytes().expect("first"), msg.to_bytes().expect("second"));
    }

    #[test]
    fn frame_without_object_decodes_to_none() {
        let msg = ControlMessage::from_text(r#"{"timestamp_ms": 3}"#).expect("decode");
        assert_eq!(msg.event, None);
        assert_eq!(msg.ack_kind(), None);
        assert!(msg.creator.is_empty());
    }

    #[test]
    fn ack_kind_classifies_variants() {
        let unregister = ControlMessage::from_text(r#"{"event":{"type":"unregister","events":[]}}"#)
            .expect("decode");
        assert_eq!(unregister.ack_kind(), Some(AckKind::Unregister));

        let event = ControlMessage::from_text(r#"{"event":{"type":"event","payload":{"n":1}}}"#)
            .expect("decode");
        assert_eq!(event.ack_kind(), None);
    }

    #[test]
    fn chaincode_interest_carries_reg_info() {
        let interest = Interest::chaincode("mycc", "transfer").on_channel("orgchannel");
        let value = serde_json::to_value(&interest).expect("encode");
        assert_eq!(value["event_type"], "chaincode");
        assert_eq!(value["chaincode_reg_info"]["event_name"], "transfer");
        assert_eq!(value["channel_id"], "orgchannel");
    }

    #[test]
    fn envelope_exposes_inner_message() {
        let msg = ControlMessage::new(
            EventBody::Unregister { events: Vec::new() },
            vec![1],
            vec![2],
            3,
        );
        let envelope = SignedEnvelope {
            event_bytes: msg.to_bytes().expect("encode"),
            signature: vec![4, 5],
        };
        let decoded =
            SignedEnvelope::from_text(&envelope.to_text().expect("text")).expect("decode");
        assert_eq!(decoded.message().expect("inner"), msg);
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let err = SignedEnvelope::from_text(r#"{"event_bytes":"!!","signature":""}"#);
        assert!(err.is_err());
    }
}
