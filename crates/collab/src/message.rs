//! Wire protocol shared by server and client.
//!
//! Every frame is a JSON object `{ "type", "sessionId", "payload" }`. The
//! `type` tag selects the payload shape; unknown tags and payloads that do
//! not match their tag are rejected when decoding.

use crate::error::{CollabError, CollabResult, ErrorCode};
use crate::ids::{ClientId, OperationId, SessionId, UserId};
use crate::operation::Operation;
use crate::presence::PresenceState;
use serde::{Deserialize, Serialize, Serializer};

/// Message type tag as it appears on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Operation,
    Ack,
    Presence,
    UserJoin,
    UserLeave,
    ResyncRequest,
    ResyncResponse,
    Error,
}

/// Operation submitted by a client, or broadcast by the server with the
/// version it produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationPayload {
    #[serde(flatten)]
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub operation_id: OperationId,
    pub version: u64,
}

/// Announces a participant. Clients send it to join; the server relays it
/// to everyone else in the session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJoinPayload {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeavePayload {
    pub user_id: UserId,
}

/// Sent on (re)connect. `version` is the last version the client applied,
/// absent when it has never synced; `operations` is its pending queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncRequestPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default)]
    pub operations: Vec<Operation>,
}

/// Full snapshot for a client that cannot be caught up incrementally.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncResponsePayload {
    pub version: u64,
    pub content: String,
    /// Ids from the client's queue that the snapshot already contains.
    #[serde(default)]
    pub applied_operation_ids: Vec<OperationId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    /// The rejected operation, when the error is about one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
}

impl ErrorPayload {
    pub fn from_error(err: &CollabError, operation_id: Option<OperationId>) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            operation_id,
        }
    }
}

/// A decoded message body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Operation(OperationPayload),
    Ack(AckPayload),
    Presence(PresenceState),
    UserJoin(UserJoinPayload),
    UserLeave(UserLeavePayload),
    ResyncRequest(ResyncRequestPayload),
    ResyncResponse(ResyncResponsePayload),
    Error(ErrorPayload),
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::Operation(_) => MessageType::Operation,
            Message::Ack(_) => MessageType::Ack,
            Message::Presence(_) => MessageType::Presence,
            Message::UserJoin(_) => MessageType::UserJoin,
            Message::UserLeave(_) => MessageType::UserLeave,
            Message::ResyncRequest(_) => MessageType::ResyncRequest,
            Message::ResyncResponse(_) => MessageType::ResyncResponse,
            Message::Error(_) => MessageType::Error,
        }
    }

    /// Client submission of a local operation.
    pub fn submit(operation: Operation) -> Self {
        Message::Operation(OperationPayload {
            operation,
            version: None,
        })
    }

    /// Server broadcast of an accepted operation.
    pub fn broadcast(operation: Operation, version: u64) -> Self {
        Message::Operation(OperationPayload {
            operation,
            version: Some(version),
        })
    }

    pub fn ack(operation_id: OperationId, version: u64) -> Self {
        Message::Ack(AckPayload {
            operation_id,
            version,
        })
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Message::Error(ErrorPayload {
            code,
            message: message.into(),
            operation_id: None,
        })
    }

    fn payload(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Message::Operation(p) => serde_json::to_value(p),
            Message::Ack(p) => serde_json::to_value(p),
            Message::Presence(p) => serde_json::to_value(p),
            Message::UserJoin(p) => serde_json::to_value(p),
            Message::UserLeave(p) => serde_json::to_value(p),
            Message::ResyncRequest(p) => serde_json::to_value(p),
            Message::ResyncResponse(p) => serde_json::to_value(p),
            Message::Error(p) => serde_json::to_value(p),
        }
    }

    fn from_payload(kind: MessageType, payload: serde_json::Value) -> serde_json::Result<Self> {
        let message = match kind {
            MessageType::Operation => Message::Operation(serde_json::from_value(payload)?),
            MessageType::Ack => Message::Ack(serde_json::from_value(payload)?),
            MessageType::Presence => Message::Presence(serde_json::from_value(payload)?),
            MessageType::UserJoin => Message::UserJoin(serde_json::from_value(payload)?),
            MessageType::UserLeave => Message::UserLeave(serde_json::from_value(payload)?),
            MessageType::ResyncRequest => Message::ResyncRequest(serde_json::from_value(payload)?),
            MessageType::ResyncResponse => {
                Message::ResyncResponse(serde_json::from_value(payload)?)
            }
            MessageType::Error => Message::Error(serde_json::from_value(payload)?),
        };
        Ok(message)
    }
}

/// A message addressed to a session.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawEnvelope")]
pub struct Envelope {
    pub session_id: SessionId,
    pub message: Message,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: MessageType,
    session_id: SessionId,
    payload: serde_json::Value,
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = serde_json::Error;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        Ok(Self {
            session_id: raw.session_id,
            message: Message::from_payload(raw.kind, raw.payload)?,
        })
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let payload = self.message.payload().map_err(serde::ser::Error::custom)?;
        RawEnvelope {
            kind: self.kind(),
            session_id: self.session_id.clone(),
            payload,
        }
        .serialize(serializer)
    }
}

impl Envelope {
    pub fn new(session_id: SessionId, message: Message) -> Self {
        Self {
            session_id,
            message,
        }
    }

    pub fn kind(&self) -> MessageType {
        self.message.kind()
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> CollabResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode one frame.
    pub fn from_json(text: &str) -> CollabResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::TextOperation;

    fn sample_operation() -> Operation {
        let mut ops = TextOperation::new();
        ops.retain(2).insert("hi");
        Operation::new(ClientId::new("c1"), UserId::new("u1"), 4, ops)
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = Envelope::new(SessionId::new("room"), Message::ack(OperationId::generate(), 9));
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["type"], "ack");
        assert_eq!(value["sessionId"], "room");
        assert_eq!(value["payload"]["version"], 9);
        assert!(value["payload"].get("operationId").is_some());
    }

    #[test]
    fn test_operation_payload_is_flat() {
        let op = sample_operation();
        let envelope = Envelope::new(SessionId::new("room"), Message::broadcast(op.clone(), 5));
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["type"], "operation");
        assert_eq!(value["payload"]["baseVersion"], 4);
        assert_eq!(value["payload"]["clientId"], "c1");
        assert_eq!(value["payload"]["version"], 5);
        assert_eq!(value["payload"]["ops"][0]["retain"], 2);

        let decoded = Envelope::from_json(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_kebab_case_types() {
        let json = r#"{"type":"resync-request","sessionId":"s","payload":{"version":3}}"#;
        let envelope = Envelope::from_json(json).unwrap();
        assert_eq!(envelope.kind(), MessageType::ResyncRequest);
        match envelope.message {
            Message::ResyncRequest(p) => {
                assert_eq!(p.version, Some(3));
                assert!(p.operations.is_empty());
            }
            other => panic!("Wrong message type: {other:?}"),
        }
    }

    #[test]
    fn test_user_join_from_client() {
        let json = r#"{"type":"user-join","sessionId":"s","payload":{"userId":"u","displayName":"Ada","clientId":"c9"}}"#;
        match Envelope::from_json(json).unwrap().message {
            Message::UserJoin(p) => {
                assert_eq!(p.user_id, UserId::new("u"));
                assert_eq!(p.client_id, Some(ClientId::new("c9")));
                assert!(p.color.is_none());
                assert!(p.token.is_none());
            }
            other => panic!("Wrong message type: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_unknown_type_and_bad_payload() {
        assert!(Envelope::from_json(r#"{"type":"nope","sessionId":"s","payload":{}}"#).is_err());
        assert!(Envelope::from_json(r#"{"type":"ack","sessionId":"s","payload":{"version":1}}"#).is_err());
        let bad_ops = r#"{"type":"operation","sessionId":"s","payload":{"id":"6c1f3f59-8d4e-4f7a-9a51-0d3e8c8b2a10","clientId":"c","userId":"u","baseVersion":0,"ops":[{"retain":0}],"timestamp":"2024-01-01T00:00:00Z"}}"#;
        assert!(Envelope::from_json(bad_ops).is_err());
    }

    #[test]
    fn test_operation_without_timestamp_decodes() {
        let json = r#"{"type":"operation","sessionId":"s","payload":{"id":"6c1f3f59-8d4e-4f7a-9a51-0d3e8c8b2a10","clientId":"c","userId":"u","baseVersion":0,"ops":[{"insert":"hi"}]}}"#;
        match Envelope::from_json(json).unwrap().message {
            Message::Operation(p) => {
                assert_eq!(p.operation.client_id, ClientId::new("c"));
                assert_eq!(p.operation.ops.target_len(), 2);
                assert!(p.version.is_none());
            }
            other => panic!("Wrong message type: {other:?}"),
        }
    }

    #[test]
    fn test_decode_error_message_has_single_prefix() {
        let err = Envelope::from_json(r#"{"type":"ack","sessionId":"s","payload":{"version":1}}"#).unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("Serialization error: "));
        assert_eq!(text.matches("Serialization error").count(), 1, "{text}");
    }

    #[test]
    fn test_error_payload() {
        let err = CollabError::StaleClient {
            base_version: 1,
            oldest_available: 7,
        };
        let payload = ErrorPayload::from_error(&err, None);
        assert_eq!(payload.code, ErrorCode::StaleClient);
        let value = serde_json::to_value(Envelope::new(SessionId::new("s"), Message::Error(payload))).unwrap();
        assert_eq!(value["payload"]["code"], "stale_client");
    }
}
