//! Reflective marshalling for dynamically loaded message types.
//!
//! Payloads cross the bridge as JSON trees and the backend as protobuf, so
//! this module owns both directions: a [`tonic::codec::Codec`] that moves
//! [`DynamicMessage`] values over the wire, and the JSON conversion rules
//! the browser clients rely on:
//!
//! - 64-bit integers are decimal strings in JSON (no precision loss);
//!   decoding accepts numbers or strings.
//! - Enums are symbolic names (number fallback for values missing from the
//!   descriptor); decoding accepts names or numbers.
//! - Every non-oneof field is materialized on encode, defaults included.
//! - A `oneof` with a selected case adds a discriminator field named after
//!   the oneof, holding the selected field's JSON name.
//! - `bytes` fields are base64 strings at any nesting depth, repeated and
//!   map values included.

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use prost::bytes::Bytes;
use prost::Message;
use prost_reflect::{DynamicMessage, FieldDescriptor, Kind, MapKey, MessageDescriptor, ReflectMessage};
use serde_json::{json, Map, Value as JsonValue};
use std::collections::HashMap;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;

/// Codec for encoding/decoding dynamic protobuf messages over tonic.
#[derive(Clone)]
pub struct DynamicCodec {
    response: MessageDescriptor,
}

impl DynamicCodec {
    pub fn new(response: MessageDescriptor) -> Self {
        Self { response }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder {
            descriptor: self.response.clone(),
        }
    }
}

pub struct DynamicEncoder;

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(
        &mut self,
        item: Self::Item,
        dst: &mut EncodeBuf<'_>,
    ) -> std::result::Result<(), Self::Error> {
        item.encode(dst)
            .map_err(|e| Status::internal(format!("request encode error: {e}")))
    }
}

pub struct DynamicDecoder {
    descriptor: MessageDescriptor,
}

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(
        &mut self,
        src: &mut DecodeBuf<'_>,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        let message = DynamicMessage::decode(self.descriptor.clone(), &mut *src)
            .map_err(|e| Status::internal(format!("response decode error: {e}")))?;
        Ok(Some(message))
    }
}

/// Build the request message for a call; an absent payload is the empty
/// message.
pub fn message_from_json(
    descriptor: &MessageDescriptor,
    json: Option<&JsonValue>,
) -> Result<DynamicMessage> {
    match json {
        None | Some(JsonValue::Null) => Ok(DynamicMessage::new(descriptor.clone())),
        Some(value) => json_to_message(descriptor, value),
    }
}

fn json_to_message(descriptor: &MessageDescriptor, json: &JsonValue) -> Result<DynamicMessage> {
    let Some(obj) = json.as_object() else {
        return Err(Error::Marshal(format!(
            "expected a JSON object for message {}",
            descriptor.full_name()
        )));
    };

    let mut message = DynamicMessage::new(descriptor.clone());
    for (key, value) in obj {
        // Unknown keys (including oneof discriminators echoed back by a
        // client) are ignored; fields match by JSON name first.
        let Some(field) = descriptor
            .get_field_by_json_name(key)
            .or_else(|| descriptor.get_field_by_name(key))
        else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        let converted = json_to_field(value, &field)?;
        message.set_field(&field, converted);
    }
    Ok(message)
}

fn json_to_field(json: &JsonValue, field: &FieldDescriptor) -> Result<prost_reflect::Value> {
    if field.is_map() {
        return json_to_map(json, field);
    }
    if field.is_list() {
        let Some(items) = json.as_array() else {
            return Err(Error::Marshal(format!(
                "expected a JSON array for repeated field {}",
                field.name()
            )));
        };
        let values = items
            .iter()
            .map(|item| json_to_scalar(item, &field.kind(), field))
            .collect::<Result<Vec<_>>>()?;
        return Ok(prost_reflect::Value::List(values));
    }
    json_to_scalar(json, &field.kind(), field)
}

fn json_to_map(json: &JsonValue, field: &FieldDescriptor) -> Result<prost_reflect::Value> {
    let Some(obj) = json.as_object() else {
        return Err(Error::Marshal(format!(
            "expected a JSON object for map field {}",
            field.name()
        )));
    };
    let Kind::Message(entry) = field.kind() else {
        return Err(Error::Internal(format!(
            "map field {} has no entry descriptor",
            field.name()
        )));
    };
    let key_field = entry.map_entry_key_field();
    let value_field = entry.map_entry_value_field();

    let mut map = HashMap::new();
    for (key, value) in obj {
        let map_key = parse_map_key(key, &key_field.kind(), field)?;
        let map_value = json_to_scalar(value, &value_field.kind(), &value_field)?;
        map.insert(map_key, map_value);
    }
    Ok(prost_reflect::Value::Map(map))
}

fn parse_map_key(key: &str, kind: &Kind, field: &FieldDescriptor) -> Result<MapKey> {
    let parsed = match kind {
        Kind::String => Some(MapKey::String(key.to_string())),
        Kind::Bool => key.parse().ok().map(MapKey::Bool),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => key.parse().ok().map(MapKey::I32),
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => key.parse().ok().map(MapKey::I64),
        Kind::Uint32 | Kind::Fixed32 => key.parse().ok().map(MapKey::U32),
        Kind::Uint64 | Kind::Fixed64 => key.parse().ok().map(MapKey::U64),
        _ => None,
    };
    parsed.ok_or_else(|| {
        Error::Marshal(format!(
            "invalid map key \"{key}\" for field {}",
            field.name()
        ))
    })
}

fn json_to_scalar(
    json: &JsonValue,
    kind: &Kind,
    field: &FieldDescriptor,
) -> Result<prost_reflect::Value> {
    use prost_reflect::Value;

    let mismatch = || {
        Error::Marshal(format!(
            "cannot convert {json} to {kind:?} for field {}",
            field.name()
        ))
    };

    match (json, kind) {
        (JsonValue::Null, _) => Ok(Value::default_value(kind)),
        (JsonValue::Bool(b), Kind::Bool) => Ok(Value::Bool(*b)),

        (value, Kind::Int32 | Kind::Sint32 | Kind::Sfixed32) => as_i64(value)
            .and_then(|n| i32::try_from(n).ok())
            .map(Value::I32)
            .ok_or_else(mismatch),
        (value, Kind::Uint32 | Kind::Fixed32) => as_u64(value)
            .and_then(|n| u32::try_from(n).ok())
            .map(Value::U32)
            .ok_or_else(mismatch),
        (value, Kind::Int64 | Kind::Sint64 | Kind::Sfixed64) => {
            as_i64(value).map(Value::I64).ok_or_else(mismatch)
        }
        (value, Kind::Uint64 | Kind::Fixed64) => {
            as_u64(value).map(Value::U64).ok_or_else(mismatch)
        }

        (JsonValue::Number(n), Kind::Float) => Ok(Value::F32(n.as_f64().unwrap_or(0.0) as f32)),
        (JsonValue::Number(n), Kind::Double) => Ok(Value::F64(n.as_f64().unwrap_or(0.0))),

        (JsonValue::String(s), Kind::String) => Ok(Value::String(s.clone())),
        (JsonValue::String(s), Kind::Bytes) => BASE64
            .decode(s)
            .map(|bytes| Value::Bytes(Bytes::from(bytes)))
            .map_err(|e| Error::Marshal(format!("invalid base64 in field {}: {e}", field.name()))),

        (JsonValue::String(s), Kind::Enum(descriptor)) => descriptor
            .get_value_by_name(s)
            .map(|v| Value::EnumNumber(v.number()))
            .ok_or_else(|| {
                Error::Marshal(format!(
                    "unknown value \"{s}\" for enum {}",
                    descriptor.full_name()
                ))
            }),
        (JsonValue::Number(n), Kind::Enum(_)) => n
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .map(Value::EnumNumber)
            .ok_or_else(mismatch),

        (obj @ JsonValue::Object(_), Kind::Message(descriptor)) => {
            json_to_message(descriptor, obj).map(Value::Message)
        }

        _ => Err(mismatch()),
    }
}

fn as_i64(json: &JsonValue) -> Option<i64> {
    match json {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_u64(json: &JsonValue) -> Option<u64> {
    match json {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Render a response message as the JSON payload of a `data` frame.
pub fn message_to_json(message: &DynamicMessage) -> JsonValue {
    let descriptor = message.descriptor();
    let mut obj = Map::new();

    for field in descriptor.fields() {
        // Only the selected member of a oneof is rendered. This also keeps
        // unset proto3 optionals (synthetic oneofs) out of the output.
        if field.containing_oneof().is_some() && !message.has_field(&field) {
            continue;
        }
        let value = message.get_field(&field);
        obj.insert(
            field.json_name().to_string(),
            field_to_json(value.as_ref(), &field),
        );
    }

    for oneof in descriptor.oneofs() {
        if oneof.name().starts_with('_') {
            continue;
        }
        if let Some(selected) = oneof.fields().find(|f| message.has_field(f)) {
            obj.insert(
                oneof.name().to_string(),
                JsonValue::String(selected.json_name().to_string()),
            );
        }
    }

    JsonValue::Object(obj)
}

fn field_to_json(value: &prost_reflect::Value, field: &FieldDescriptor) -> JsonValue {
    use prost_reflect::Value;

    match value {
        Value::List(items) => JsonValue::Array(
            items
                .iter()
                .map(|item| scalar_to_json(item, &field.kind()))
                .collect(),
        ),
        Value::Map(entries) => {
            let value_kind = match field.kind() {
                Kind::Message(entry) => entry.map_entry_value_field().kind(),
                _ => return JsonValue::Null,
            };
            let mut obj = Map::new();
            for (key, item) in entries {
                obj.insert(map_key_to_string(key), scalar_to_json(item, &value_kind));
            }
            JsonValue::Object(obj)
        }
        other => scalar_to_json(other, &field.kind()),
    }
}

fn scalar_to_json(value: &prost_reflect::Value, kind: &Kind) -> JsonValue {
    use prost_reflect::Value;

    match value {
        Value::Bool(b) => json!(*b),
        Value::I32(n) => json!(*n),
        Value::U32(n) => json!(*n),
        Value::I64(n) => JsonValue::String(n.to_string()),
        Value::U64(n) => JsonValue::String(n.to_string()),
        Value::F32(n) => json!(*n),
        Value::F64(n) => json!(*n),
        Value::String(s) => JsonValue::String(s.clone()),
        Value::Bytes(bytes) => JsonValue::String(BASE64.encode(bytes)),
        Value::EnumNumber(n) => match kind {
            Kind::Enum(descriptor) => descriptor
                .get_value(*n)
                .map(|v| JsonValue::String(v.name().to_string()))
                .unwrap_or_else(|| json!(*n)),
            _ => json!(*n),
        },
        Value::Message(message) => message_to_json(message),
        Value::List(items) => JsonValue::Array(
            items
                .iter()
                .map(|item| scalar_to_json(item, kind))
                .collect(),
        ),
        Value::Map(_) => JsonValue::Null,
    }
}

fn map_key_to_string(key: &MapKey) -> String {
    match key {
        MapKey::Bool(b) => b.to_string(),
        MapKey::I32(n) => n.to_string(),
        MapKey::I64(n) => n.to_string(),
        MapKey::U32(n) => n.to_string(),
        MapKey::U64(n) => n.to_string(),
        MapKey::String(s) => s.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_pool;

    fn request_descriptor() -> MessageDescriptor {
        test_pool()
            .get_message_by_name("demo.HelloRequest")
            .unwrap()
    }

    #[test]
    fn test_empty_payload_is_default_message() {
        let message = message_from_json(&request_descriptor(), None).unwrap();
        assert_eq!(message.descriptor().full_name(), "demo.HelloRequest");

        let message = message_from_json(&request_descriptor(), Some(&JsonValue::Null)).unwrap();
        assert_eq!(message.descriptor().full_name(), "demo.HelloRequest");
    }

    #[test]
    fn test_round_trip_scalars_and_strings() {
        let payload = json!({
            "name": "Alice",
            "big": "-9007199254740993",
            "ubig": "18446744073709551615",
            "flag": true,
            "score": 1.5,
        });
        let message = message_from_json(&request_descriptor(), Some(&payload)).unwrap();
        let back = message_to_json(&message);

        assert_eq!(back["name"], "Alice");
        assert_eq!(back["big"], "-9007199254740993");
        assert_eq!(back["ubig"], "18446744073709551615");
        assert_eq!(back["flag"], true);
        assert_eq!(back["score"], 1.5);
    }

    #[test]
    fn test_64_bit_accepts_numbers() {
        let payload = json!({"big": 42, "ubig": 7});
        let message = message_from_json(&request_descriptor(), Some(&payload)).unwrap();
        let back = message_to_json(&message);
        assert_eq!(back["big"], "42");
        assert_eq!(back["ubig"], "7");
    }

    #[test]
    fn test_defaults_materialized() {
        let message = message_from_json(&request_descriptor(), Some(&json!({}))).unwrap();
        let back = message_to_json(&message);

        assert_eq!(back["name"], "");
        assert_eq!(back["big"], "0");
        assert_eq!(back["flag"], false);
        assert_eq!(back["mood"], "MOOD_UNSPECIFIED");
        assert_eq!(back["tags"], json!([]));
        assert_eq!(back["counts"], json!({}));
        // Unset oneof members stay out entirely.
        assert!(back.get("text").is_none());
        assert!(back.get("raw").is_none());
        assert!(back.get("choice").is_none());
    }

    #[test]
    fn test_enum_by_name_and_number() {
        let descriptor = request_descriptor();

        let message = message_from_json(&descriptor, Some(&json!({"mood": "GRUMPY"}))).unwrap();
        assert_eq!(message_to_json(&message)["mood"], "GRUMPY");

        let message = message_from_json(&descriptor, Some(&json!({"mood": 1}))).unwrap();
        assert_eq!(message_to_json(&message)["mood"], "HAPPY");

        let err = message_from_json(&descriptor, Some(&json!({"mood": "ECSTATIC"}))).unwrap_err();
        assert!(matches!(err, Error::Marshal(_)));
    }

    #[test]
    fn test_bytes_base64_round_trip() {
        let raw: &[u8] = b"\x00\x01\xfe\xff";
        let payload = json!({"blob": BASE64.encode(raw)});
        let message = message_from_json(&request_descriptor(), Some(&payload)).unwrap();
        let back = message_to_json(&message);
        assert_eq!(back["blob"], BASE64.encode(raw));

        let err =
            message_from_json(&request_descriptor(), Some(&json!({"blob": "//not-b64//"})))
                .unwrap_err();
        assert!(matches!(err, Error::Marshal(_)));
    }

    #[test]
    fn test_oneof_discriminator() {
        let payload = json!({"text": "hello"});
        let message = message_from_json(&request_descriptor(), Some(&payload)).unwrap();
        let back = message_to_json(&message);

        assert_eq!(back["text"], "hello");
        assert_eq!(back["choice"], "text");
        assert!(back.get("raw").is_none());
    }

    #[test]
    fn test_nested_and_repeated() {
        let payload = json!({
            "nested": {"id": "n1"},
            "tags": ["a", "b"],
        });
        let message = message_from_json(&request_descriptor(), Some(&payload)).unwrap();
        let back = message_to_json(&message);

        assert_eq!(back["nested"]["id"], "n1");
        assert_eq!(back["tags"], json!(["a", "b"]));
    }

    #[test]
    fn test_map_field() {
        let payload = json!({"counts": {"a": 1, "b": 2}});
        let message = message_from_json(&request_descriptor(), Some(&payload)).unwrap();
        let back = message_to_json(&message);

        assert_eq!(back["counts"]["a"], 1);
        assert_eq!(back["counts"]["b"], 2);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let payload = json!({"name": "ok", "bogus": 1, "choice": "text"});
        let message = message_from_json(&request_descriptor(), Some(&payload)).unwrap();
        assert_eq!(message_to_json(&message)["name"], "ok");
    }

    #[test]
    fn test_type_mismatch_is_marshal_error() {
        let err = message_from_json(&request_descriptor(), Some(&json!({"name": 5}))).unwrap_err();
        assert!(matches!(err, Error::Marshal(_)));

        let err = message_from_json(&request_descriptor(), Some(&json!(["not", "object"])))
            .unwrap_err();
        assert!(matches!(err, Error::Marshal(_)));

        let err =
            message_from_json(&request_descriptor(), Some(&json!({"tags": "not-array"})))
                .unwrap_err();
        assert!(matches!(err, Error::Marshal(_)));
    }
}
