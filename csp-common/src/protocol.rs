//! Binary WebSocket protocol exchanged between IDEs, sidecars and the proxy.
//!
//! Every frame is one protobuf-encoded [`WebsocketMessage`]: an explicit
//! `message_type` discriminator plus exactly one populated payload. The raw
//! message is converted into the typed [`Envelope`] right after decoding so
//! the rest of the proxy never sees a discriminator that disagrees with its
//! payload.

use prost::Message;
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Top-level frame on both WebSocket endpoints.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WebsocketMessage {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub message_type: i32,
    #[prost(oneof = "Payload", tags = "2, 3, 4, 5")]
    pub payload: ::core::option::Option<Payload>,
}

/// The `message` oneof of [`WebsocketMessage`].
#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum Payload {
    #[prost(message, tag = "2")]
    PushMessage(PushMessage),
    #[prost(message, tag = "3")]
    PushResponse(PushResponse),
    #[prost(message, tag = "4")]
    VerificationRequest(VerificationRequest),
    #[prost(message, tag = "5")]
    VerificationResponse(VerificationResponse),
}

impl Payload {
    fn variant_name(&self) -> &'static str {
        match self {
            Self::PushMessage(_) => "push_message",
            Self::PushResponse(_) => "push_response",
            Self::VerificationRequest(_) => "verification_request",
            Self::VerificationResponse(_) => "verification_response",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Unspecified = 0,
    PushRequest = 1,
    PushResponse = 2,
    VerificationRequest = 3,
    VerificationResponse = 4,
}

impl MessageType {
    /// Name as it appears in the protobuf schema.
    pub fn as_str_name(self) -> &'static str {
        match self {
            Self::Unspecified => "MESSAGE_TYPE_UNSPECIFIED",
            Self::PushRequest => "PUSH_REQUEST",
            Self::PushResponse => "PUSH_RESPONSE",
            Self::VerificationRequest => "VERIFICATION_REQUEST",
            Self::VerificationResponse => "VERIFICATION_RESPONSE",
        }
    }
}

/// Code change sent by an IDE and forwarded to the sidecar.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushMessage {
    #[prost(string, tag = "1")]
    pub push_id: String,
    /// rsync batch applied by the sidecar.
    #[prost(bytes = "vec", tag = "2")]
    pub batch_file: Vec<u8>,
    #[prost(string, tag = "3")]
    pub code_diff: String,
    #[prost(string, tag = "4")]
    pub change_description: String,
    #[prost(message, repeated, tag = "5")]
    pub database_branch_updates: Vec<DatabaseBranchUpdate>,
}

/// Database branch switch carried along with a push; opaque to the proxy.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DatabaseBranchUpdate {
    #[prost(string, tag = "1")]
    pub database_name: String,
    #[prost(string, tag = "2")]
    pub previous_branch_id: String,
    #[prost(string, tag = "3")]
    pub new_branch_id: String,
    #[prost(bool, tag = "4")]
    pub branch_created: bool,
    #[prost(string, tag = "5")]
    pub parent_branch_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushResponse {
    #[prost(enumeration = "PushResponseStatus", tag = "1")]
    pub status: i32,
    #[prost(string, tag = "2")]
    pub error_message: String,
    #[prost(string, tag = "3")]
    pub push_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PushResponseStatus {
    Pending = 0,
    Pushing = 1,
    Pushed = 2,
    Completed = 3,
    Failed = 4,
}

impl PushResponseStatus {
    pub fn as_str_name(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Pushing => "PUSHING",
            Self::Pushed => "PUSHED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VerificationRequest {
    #[prost(string, tag = "1")]
    pub push_id: String,
    #[prost(message, optional, tag = "2")]
    pub tests: ::core::option::Option<::prost_types::Struct>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VerificationResponse {
    #[prost(enumeration = "VerificationStatus", tag = "1")]
    pub status: i32,
    #[prost(string, tag = "2")]
    pub error_message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum VerificationStatus {
    InProgress = 0,
    Completed = 1,
    Failed = 2,
}

/// Reasons a frame cannot be turned into an [`Envelope`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The bytes do not parse against the schema at all.
    #[error("failed to decode websocket message: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The discriminator is not a known message type.
    #[error("unknown message type {0}")]
    UnknownMessageType(i32),

    /// The discriminator is known but the matching payload is absent.
    #[error("message type {expected} carries payload '{found}'")]
    PayloadMismatch {
        expected: &'static str,
        found: &'static str,
    },
}

/// A decoded frame whose discriminator and payload agree.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    PushRequest(PushMessage),
    PushResponse(PushResponse),
    VerificationRequest(VerificationRequest),
    VerificationResponse(VerificationResponse),
}

impl Envelope {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::PushRequest(_) => MessageType::PushRequest,
            Self::PushResponse(_) => MessageType::PushResponse,
            Self::VerificationRequest(_) => MessageType::VerificationRequest,
            Self::VerificationResponse(_) => MessageType::VerificationResponse,
        }
    }

    /// Decode one binary frame.
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let message = WebsocketMessage::decode(frame)?;
        Self::try_from(message)
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        self.clone().into_wire().encode_to_vec()
    }

    pub fn into_wire(self) -> WebsocketMessage {
        let message_type = self.message_type() as i32;
        let payload = match self {
            Self::PushRequest(m) => Payload::PushMessage(m),
            Self::PushResponse(m) => Payload::PushResponse(m),
            Self::VerificationRequest(m) => Payload::VerificationRequest(m),
            Self::VerificationResponse(m) => Payload::VerificationResponse(m),
        };
        WebsocketMessage {
            message_type,
            payload: Some(payload),
        }
    }
}

impl TryFrom<WebsocketMessage> for Envelope {
    type Error = ProtocolError;

    fn try_from(message: WebsocketMessage) -> Result<Self, Self::Error> {
        let raw = message.message_type;
        let message_type = match MessageType::try_from(raw) {
            Ok(MessageType::Unspecified) | Err(_) => {
                return Err(ProtocolError::UnknownMessageType(raw));
            }
            Ok(t) => t,
        };

        match (message_type, message.payload) {
            (MessageType::PushRequest, Some(Payload::PushMessage(m))) => Ok(Self::PushRequest(m)),
            (MessageType::PushResponse, Some(Payload::PushResponse(m))) => {
                Ok(Self::PushResponse(m))
            }
            (MessageType::VerificationRequest, Some(Payload::VerificationRequest(m))) => {
                Ok(Self::VerificationRequest(m))
            }
            (MessageType::VerificationResponse, Some(Payload::VerificationResponse(m))) => {
                Ok(Self::VerificationResponse(m))
            }
            (expected, payload) => Err(ProtocolError::PayloadMismatch {
                expected: expected.as_str_name(),
                found: payload.as_ref().map_or("none", Payload::variant_name),
            }),
        }
    }
}

/// Human-readable name for a raw discriminator, known or not.
pub fn message_type_name(raw: i32) -> String {
    match MessageType::try_from(raw) {
        Ok(t) => t.as_str_name().to_string(),
        Err(_) => format!("UNKNOWN({raw})"),
    }
}

/// Convert a protobuf `Struct` into a JSON object.
pub fn struct_to_json(value: &prost_types::Struct) -> Map<String, Value> {
    value
        .fields
        .iter()
        .map(|(k, v)| (k.clone(), value_to_json(v)))
        .collect()
}

fn value_to_json(value: &prost_types::Value) -> Value {
    use prost_types::value::Kind;

    match &value.kind {
        None | Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::NumberValue(n)) => Number::from_f64(*n).map_or(Value::Null, Value::Number),
        Some(Kind::StringValue(s)) => Value::String(s.clone()),
        Some(Kind::BoolValue(b)) => Value::Bool(*b),
        Some(Kind::StructValue(s)) => Value::Object(struct_to_json(s)),
        Some(Kind::ListValue(list)) => Value::Array(list.values.iter().map(value_to_json).collect()),
    }
}

/// Convert a JSON object into a protobuf `Struct`.
pub fn json_to_struct(map: &Map<String, Value>) -> prost_types::Struct {
    prost_types::Struct {
        fields: map
            .iter()
            .map(|(k, v)| (k.clone(), json_to_value(v)))
            .collect(),
    }
}

fn json_to_value(value: &Value) -> prost_types::Value {
    use prost_types::value::Kind;

    let kind = match value {
        Value::Null => Kind::NullValue(prost_types::NullValue::NullValue as i32),
        Value::Bool(b) => Kind::BoolValue(*b),
        Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or_default()),
        Value::String(s) => Kind::StringValue(s.clone()),
        Value::Array(items) => Kind::ListValue(prost_types::ListValue {
            values: items.iter().map(json_to_value).collect(),
        }),
        Value::Object(map) => Kind::StructValue(json_to_struct(map)),
    };
    prost_types::Value { kind: Some(kind) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn sample_push() -> PushMessage {
        PushMessage {
            push_id: "p1".to_string(),
            batch_file: b"data".to_vec(),
            code_diff: "diff".to_string(),
            change_description: "desc".to_string(),
            database_branch_updates: vec![DatabaseBranchUpdate {
                database_name: "main".to_string(),
                previous_branch_id: "br-1".to_string(),
                new_branch_id: "br-2".to_string(),
                branch_created: true,
                parent_branch_id: "br-0".to_string(),
            }],
        }
    }

    #[test]
    fn test_push_request_round_trip() {
        let envelope = Envelope::PushRequest(sample_push());
        let bytes = envelope.encode_to_vec();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.message_type(), MessageType::PushRequest);
    }

    #[test]
    fn test_verification_request_preserves_struct_payload() {
        let tests = json!({"suite": "smoke", "cases": [1.0, "two", null], "nested": {"ok": true}});
        let envelope = Envelope::VerificationRequest(VerificationRequest {
            push_id: "p9".to_string(),
            tests: Some(json_to_struct(tests.as_object().unwrap())),
        });

        let decoded = Envelope::decode(&envelope.encode_to_vec()).unwrap();
        let Envelope::VerificationRequest(request) = decoded else {
            panic!("expected verification request");
        };
        let map = struct_to_json(request.tests.as_ref().unwrap());
        assert_eq!(Value::Object(map), tests);
    }

    #[test]
    fn test_garbage_bytes_are_a_decode_error() {
        let err = Envelope::decode(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[test]
    fn test_unknown_discriminator_is_distinct_from_decode_error() {
        let raw = WebsocketMessage {
            message_type: 42,
            payload: None,
        }
        .encode_to_vec();
        let err = Envelope::decode(&raw).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessageType(42)));
    }

    #[test]
    fn test_empty_frame_is_unspecified_type() {
        let err = Envelope::decode(&[]).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessageType(0)));
    }

    #[test]
    fn test_payload_mismatch_rejected() {
        let raw = WebsocketMessage {
            message_type: MessageType::PushRequest as i32,
            payload: Some(Payload::PushResponse(PushResponse::default())),
        }
        .encode_to_vec();
        match Envelope::decode(&raw).unwrap_err() {
            ProtocolError::PayloadMismatch { expected, found } => {
                assert_eq!(expected, "PUSH_REQUEST");
                assert_eq!(found, "push_response");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_message_type_name() {
        assert_eq!(message_type_name(2), "PUSH_RESPONSE");
        assert_eq!(message_type_name(77), "UNKNOWN(77)");
    }

    proptest! {
        #[test]
        fn prop_envelope_round_trip(
            push_id in "[a-z0-9-]{0,24}",
            diff in ".{0,64}",
            description in ".{0,64}",
            batch in proptest::collection::vec(any::<u8>(), 0..256),
            status in 0i32..5,
            error_message in ".{0,32}",
            which in 0u8..3,
        ) {
            let envelope = match which {
                0 => Envelope::PushRequest(PushMessage {
                    push_id,
                    batch_file: batch,
                    code_diff: diff,
                    change_description: description,
                    database_branch_updates: Vec::new(),
                }),
                1 => Envelope::PushResponse(PushResponse { status, error_message, push_id }),
                _ => Envelope::VerificationResponse(VerificationResponse {
                    status: status % 3,
                    error_message,
                }),
            };
            let decoded = Envelope::decode(&envelope.encode_to_vec()).unwrap();
            prop_assert_eq!(decoded, envelope);
        }
    }
}
