//! JSON codec for envelopes and control frames.
//!
//! Decoding is done against a `serde_json::Value` first so each rejection can be
//! reported with its specific error kind: shape problems are `MalformedEnvelope`,
//! a missing or unknown `type` is `UnknownMessageType`, and a target that is not
//! exactly one of `recipient` / `room` is `AmbiguousTarget`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::control::{ClientControl, OutboundFrame, ServerEvent};
use crate::envelope::{EncryptionMeta, Envelope, MessageType, Target};
use crate::error::{CodecError, CodecResult};
use crate::ids::{RoomId, UserId};

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(ClientControl),
    Envelope(Envelope),
}

#[derive(Serialize)]
struct WireEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    sender: Option<&'a UserId>,
    recipient: Option<&'a UserId>,
    room: Option<&'a RoomId>,
    content: &'a str,
    timestamp: String,
    encryption: Option<WireEncryption>,
}

#[derive(Serialize, Deserialize)]
struct WireEncryption {
    alg: String,
    nonce: String,
}

/// Decode a single envelope.
pub fn decode(raw: &str) -> CodecResult<Envelope> {
    decode_object(parse_object(raw)?)
}

/// Decode either a control frame (an object carrying `action`) or an envelope.
pub fn decode_frame(raw: &str) -> CodecResult<Frame> {
    let object = parse_object(raw)?;

    if object.contains_key("action") {
        let control = serde_json::from_value::<ClientControl>(Value::Object(object))?;
        return Ok(Frame::Control(control));
    }

    decode_object(object).map(Frame::Envelope)
}

pub fn encode(envelope: &Envelope) -> String {
    let wire = WireEnvelope {
        kind: envelope.kind.as_str(),
        sender: envelope.sender.as_ref(),
        recipient: envelope.target.recipient(),
        room: envelope.target.room(),
        content: &envelope.content,
        timestamp: envelope
            .timestamp
            .to_rfc3339_opts(SecondsFormat::AutoSi, true),
        encryption: envelope.encryption.as_ref().map(|meta| WireEncryption {
            alg: meta.alg.clone(),
            nonce: STANDARD.encode(&meta.nonce),
        }),
    };

    // Every field is a string or an option of one; serialization cannot fail.
    serde_json::to_string(&wire).unwrap_or_default()
}

pub fn encode_event(event: &ServerEvent) -> String {
    serde_json::to_string(event).unwrap_or_default()
}

/// Encode a control frame as a client would send it.
pub fn encode_control(control: &ClientControl) -> String {
    serde_json::to_string(control).unwrap_or_default()
}

/// Decode a frame received from the relay: a server event (an object carrying
/// `event`) or an envelope.
pub fn decode_outbound(raw: &str) -> CodecResult<OutboundFrame> {
    let object = parse_object(raw)?;

    if object.contains_key("event") {
        let event = serde_json::from_value::<ServerEvent>(Value::Object(object))?;
        return Ok(OutboundFrame::Event(event));
    }

    decode_object(object).map(OutboundFrame::envelope)
}

fn parse_object(raw: &str) -> CodecResult<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(object) => Ok(object),
        other => Err(CodecError::malformed(format!(
            "expected a JSON object, found {}",
            json_kind(&other)
        ))),
    }
}

fn decode_object(object: Map<String, Value>) -> CodecResult<Envelope> {
    let kind = match object.get("type") {
        None | Some(Value::Null) => {
            return Err(CodecError::UnknownMessageType("missing".to_string()))
        }
        Some(Value::String(name)) => name.parse::<MessageType>()?,
        Some(other) => return Err(CodecError::UnknownMessageType(other.to_string())),
    };

    let recipient = optional_id(&object, "recipient")?;
    let room = optional_id(&object, "room")?;
    let target = match (recipient, room) {
        (Some(user), None) => Target::Direct(UserId::new(user)),
        (None, Some(room)) => Target::Room(RoomId::new(room)),
        _ => return Err(CodecError::AmbiguousTarget),
    };

    let sender = optional_id(&object, "sender")?.map(UserId::new);

    let content = match object.get("content") {
        None | Some(Value::Null) if kind == MessageType::Chat => {
            return Err(CodecError::malformed("chat envelope requires content"))
        }
        None | Some(Value::Null) => String::new(),
        Some(Value::String(content)) => content.clone(),
        Some(_) => return Err(CodecError::malformed("content must be a string")),
    };

    let timestamp = match object.get("timestamp") {
        None | Some(Value::Null) => Utc::now(),
        Some(Value::String(raw)) => parse_timestamp(raw)?,
        Some(_) => return Err(CodecError::malformed("timestamp must be a string")),
    };

    let encryption = match object.get("encryption") {
        None | Some(Value::Null) => None,
        Some(value) => Some(parse_encryption(value)?),
    };

    Ok(Envelope {
        kind,
        sender,
        target,
        content,
        timestamp,
        encryption,
    })
}

fn optional_id(object: &Map<String, Value>, field: &str) -> CodecResult<Option<String>> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) if id.is_empty() => {
            Err(CodecError::malformed(format!("{field} must not be empty")))
        }
        Some(Value::String(id)) => Ok(Some(id.clone())),
        Some(_) => Err(CodecError::malformed(format!("{field} must be a string"))),
    }
}

/// RFC 3339 with any offset, or a naive ISO-8601 timestamp taken as UTC.
fn parse_timestamp(raw: &str) -> CodecResult<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|err| CodecError::malformed(format!("invalid timestamp {raw:?}: {err}")))
}

fn parse_encryption(value: &Value) -> CodecResult<EncryptionMeta> {
    let wire = serde_json::from_value::<WireEncryption>(value.clone())
        .map_err(|err| CodecError::malformed(format!("invalid encryption metadata: {err}")))?;

    if wire.alg.is_empty() {
        return Err(CodecError::malformed("encryption.alg must not be empty"));
    }

    let nonce = STANDARD
        .decode(wire.nonce.as_bytes())
        .map_err(|err| CodecError::malformed(format!("encryption.nonce is not base64: {err}")))?;

    Ok(EncryptionMeta {
        alg: wire.alg,
        nonce,
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_timestamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 10, 12, 11, 2).unwrap()
    }

    #[test]
    fn decode_accepts_minimal_room_chat() {
        let envelope = decode(r#"{"type":"chat","room":"R","content":"hi"}"#).unwrap();

        assert_eq!(envelope.kind, MessageType::Chat);
        assert_eq!(envelope.target, Target::Room(RoomId::from("R")));
        assert_eq!(envelope.content, "hi");
        assert!(envelope.sender.is_none());
        assert!(envelope.encryption.is_none());
    }

    #[test]
    fn encoded_envelopes_decode_to_the_same_value() {
        let plain = Envelope::chat(Target::Direct(UserId::from("bob")), "hello bob")
            .with_sender(UserId::from("alice"))
            .with_timestamp(sample_timestamp());

        let encrypted = Envelope::chat(Target::Room(RoomId::from("ops")), "q83v")
            .with_sender(UserId::from("carol"))
            .with_encryption(EncryptionMeta {
                alg: "chacha20poly1305".to_string(),
                nonce: vec![7; 12],
            });

        let typing = Envelope::new(MessageType::Typing, Target::Room(RoomId::from("ops")), "");

        for envelope in [plain, encrypted, typing] {
            assert_eq!(decode(&encode(&envelope)).unwrap(), envelope);
        }
    }

    #[test]
    fn decode_rejects_non_json_and_non_objects() {
        assert!(matches!(
            decode("{not json"),
            Err(CodecError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            decode(r#"["chat"]"#),
            Err(CodecError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn decode_rejects_missing_or_unknown_type() {
        assert_eq!(
            decode(r#"{"room":"R","content":"hi"}"#),
            Err(CodecError::UnknownMessageType("missing".to_string()))
        );
        assert_eq!(
            decode(r#"{"type":"shout","room":"R","content":"hi"}"#),
            Err(CodecError::UnknownMessageType("shout".to_string()))
        );
        assert!(matches!(
            decode(r#"{"type":3,"room":"R"}"#),
            Err(CodecError::UnknownMessageType(_))
        ));
    }

    #[test]
    fn decode_rejects_both_or_neither_target() {
        assert_eq!(
            decode(r#"{"type":"chat","recipient":"bob","room":"R","content":"x"}"#),
            Err(CodecError::AmbiguousTarget)
        );
        assert_eq!(
            decode(r#"{"type":"chat","content":"x"}"#),
            Err(CodecError::AmbiguousTarget)
        );
        assert_eq!(
            decode(r#"{"type":"chat","recipient":null,"room":null,"content":"x"}"#),
            Err(CodecError::AmbiguousTarget)
        );
    }

    #[test]
    fn decode_rejects_chat_without_content_and_bad_nonce() {
        assert!(matches!(
            decode(r#"{"type":"chat","room":"R"}"#),
            Err(CodecError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            decode(r#"{"type":"chat","room":"R","content":"x","encryption":{"alg":"chacha20poly1305","nonce":"***"}}"#),
            Err(CodecError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn decode_accepts_naive_iso_timestamps_as_utc() {
        let envelope = decode(
            r#"{"type":"chat","room":"R","content":"x","timestamp":"2024-07-10T12:11:02.000000"}"#,
        )
        .unwrap();
        assert_eq!(envelope.timestamp, sample_timestamp());
    }

    #[test]
    fn decode_frame_separates_control_from_envelopes() {
        assert_eq!(
            decode_frame(r#"{"action":"join","room":"R"}"#).unwrap(),
            Frame::Control(ClientControl::Join {
                room: RoomId::from("R")
            })
        );
        assert_eq!(
            decode_frame(r#"{"action":"ping"}"#).unwrap(),
            Frame::Control(ClientControl::Ping)
        );
        assert!(matches!(
            decode_frame(r#"{"action":"teleport"}"#),
            Err(CodecError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            decode_frame(r#"{"type":"typing","recipient":"bob","content":"started"}"#),
            Ok(Frame::Envelope(_))
        ));
    }

    #[test]
    fn server_events_are_tagged_by_event() {
        let text = encode_event(&ServerEvent::Joined {
            room: RoomId::from("R"),
        });
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "joined");
        assert_eq!(value["room"], "R");
    }

    #[test]
    fn client_side_decoding_understands_both_frame_kinds() {
        let hello = decode_outbound(r#"{"event":"hello","connection_id":"c-1"}"#).unwrap();
        assert_eq!(
            hello,
            OutboundFrame::Event(ServerEvent::Hello {
                connection_id: "c-1".to_string()
            })
        );

        let relayed = Envelope::chat(Target::Room(RoomId::from("R")), "hi")
            .with_sender(UserId::from("alice"))
            .with_timestamp(sample_timestamp());
        let frame = decode_outbound(&encode(&relayed)).unwrap();
        assert_eq!(frame.as_envelope(), Some(&relayed));

        assert_eq!(
            encode_control(&ClientControl::Auth {
                token: "t".to_string()
            }),
            r#"{"action":"auth","token":"t"}"#
        );
    }
}
