//! JSON rendering of decoded messages
//!
//! Used by the `decode` command and by log output. Field names come from the
//! descriptor; unknown fields are keyed by number and shown as hex.

use serde_json::{json, Map, Value};

use super::{FieldKind, Message, MessageDescriptor, WireValue};

/// Render a decoded message as a JSON object
pub fn message_to_json(message: &Message, descriptor: &MessageDescriptor) -> Value {
    let mut object = Map::new();

    for number in message.field_numbers() {
        let field = descriptor.get(number);
        let key = field.map(|f| f.name.clone()).unwrap_or_else(|| number.to_string());
        let nested = match field.map(|f| &f.kind) {
            Some(FieldKind::Message(nested)) => Some(nested.as_ref()),
            _ => None,
        };

        let mut values: Vec<Value> = message
            .get_all(number)
            .iter()
            .map(|value| value_to_json(value, nested))
            .collect();

        let rendered = if values.len() == 1 {
            values.remove(0)
        } else {
            Value::Array(values)
        };
        object.insert(key, rendered);
    }

    Value::Object(object)
}

fn value_to_json(value: &WireValue, nested: Option<&MessageDescriptor>) -> Value {
    match value {
        WireValue::UInt(v) => json!(v),
        WireValue::SInt(v) => json!(v),
        WireValue::Bool(v) => json!(v),
        WireValue::String(s) => json!(s),
        WireValue::Bytes(b) => json!(hex(b)),
        WireValue::Message(m) => match nested {
            Some(descriptor) => message_to_json(m, descriptor),
            None => message_to_json(m, &MessageDescriptor::default()),
        },
        WireValue::Unknown { wire_type, raw } => json!({
            "wire_type": wire_type.to_string(),
            "raw": hex(raw),
        }),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::schema::{self, midi_event_descriptor, EventKind, MidiEvent};
    use bytes::Bytes;

    #[test]
    fn test_named_fields() {
        let message = MidiEvent::new(EventKind::Cc {
            controller_number: 1,
            controller_value: 64,
        })
        .on_channel(2)
        .to_message();

        let value = message_to_json(&message, &midi_event_descriptor());
        assert_eq!(
            value,
            json!({
                "channel": 2,
                "cc": { "controller_number": 1, "controller_value": 64 }
            })
        );
    }

    #[test]
    fn test_unknown_and_repeated() {
        let message = Message::new()
            .with(schema::CHANNEL, WireValue::UInt(1))
            .with(schema::CHANNEL, WireValue::UInt(2))
            .with(
                99,
                WireValue::Unknown {
                    wire_type: crate::protocol::WireType::LengthDelimited,
                    raw: Bytes::from_static(&[0xAB, 0x01]),
                },
            );

        let value = message_to_json(&message, &midi_event_descriptor());
        assert_eq!(value["channel"], json!([1, 2]));
        assert_eq!(value["99"]["raw"], json!("ab01"));
        assert_eq!(value["99"]["wire_type"], json!("length-delimited"));
    }
}
