//! Metadata codec: JSON metadata objects to and from gRPC metadata.
//!
//! The JSON shape maps each lowercase key to a string or an ordered list of
//! strings. Keys ending in `-bin` carry binary values, base64-encoded on the
//! JSON side. Invalid keys or values are skipped with a debug log; a bad
//! header never fails the call.

use crate::frame::JsonMetadata;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use tonic::metadata::{
    Ascii, Binary, KeyAndValueRef, MetadataKey, MetadataMap, MetadataValue,
};
use tracing::debug;

/// Build a gRPC [`MetadataMap`] from the JSON metadata object of a `start`
/// frame.
///
/// Null values are skipped; list values are appended individually in order;
/// `-bin` keys are base64-decoded to binary values; everything else is
/// stringified as ASCII text. Keys are normalized to lowercase.
pub fn metadata_from_json(json: Option<&Value>) -> MetadataMap {
    let mut metadata = MetadataMap::new();

    let Some(value) = json else {
        return metadata;
    };
    let Some(obj) = value.as_object() else {
        debug!("metadata is not a JSON object, ignoring");
        return metadata;
    };

    for (name, value) in obj {
        let name = name.to_lowercase();
        let values: Vec<&Value> = match value {
            Value::Null => continue,
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };

        for item in values {
            if item.is_null() {
                continue;
            }
            if name.ends_with("-bin") {
                append_binary(&mut metadata, &name, item);
            } else {
                append_ascii(&mut metadata, &name, item);
            }
        }
    }

    metadata
}

fn append_ascii(metadata: &mut MetadataMap, name: &str, value: &Value) {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let Ok(key) = MetadataKey::<Ascii>::from_bytes(name.as_bytes()) else {
        debug!(key = %name, "skipping metadata entry: invalid key");
        return;
    };
    let Ok(value) = MetadataValue::try_from(text.as_str()) else {
        debug!(key = %name, "skipping metadata entry: invalid ASCII value");
        return;
    };
    metadata.append(key, value);
}

fn append_binary(metadata: &mut MetadataMap, name: &str, value: &Value) {
    let Some(encoded) = value.as_str() else {
        debug!(key = %name, "skipping binary metadata entry: value is not a string");
        return;
    };
    let Ok(bytes) = BASE64.decode(encoded) else {
        debug!(key = %name, "skipping binary metadata entry: invalid base64");
        return;
    };
    let Ok(key) = MetadataKey::<Binary>::from_bytes(name.as_bytes()) else {
        debug!(key = %name, "skipping binary metadata entry: invalid key");
        return;
    };
    metadata.append_bin(key, MetadataValue::from_bytes(&bytes));
}

/// Render a gRPC [`MetadataMap`] as the JSON metadata object carried by
/// `headers`, `status`, and `error` frames.
///
/// Multi-value keys keep their order; binary values are re-encoded as
/// base64. A key with a single value becomes a scalar, otherwise a list.
pub fn metadata_to_json(metadata: &MetadataMap) -> JsonMetadata {
    let mut entries: Vec<(String, Vec<Value>)> = Vec::new();

    for entry in metadata.iter() {
        let (name, value) = match entry {
            KeyAndValueRef::Ascii(key, value) => match value.to_str() {
                Ok(text) => (key.as_str().to_string(), Value::String(text.to_string())),
                Err(_) => {
                    debug!(key = %key, "skipping non-ASCII metadata value");
                    continue;
                }
            },
            KeyAndValueRef::Binary(key, value) => match value.to_bytes() {
                Ok(bytes) => (
                    key.as_str().to_string(),
                    Value::String(BASE64.encode(bytes)),
                ),
                Err(_) => {
                    debug!(key = %key, "skipping undecodable binary metadata value");
                    continue;
                }
            },
        };

        match entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, list)) => list.push(value),
            None => entries.push((name, vec![value])),
        }
    }

    let mut obj = JsonMetadata::new();
    for (name, mut values) in entries {
        let value = if values.len() == 1 {
            values.remove(0)
        } else {
            Value::Array(values)
        };
        obj.insert(name, value);
    }
    obj
}
