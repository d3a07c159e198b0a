//! Built-in `MidiEvent` schema
//!
//! Field layout of the event message sent by the performance host plugin.
//! The metadata fields may accompany any event; exactly one of the event
//! kind fields is expected per message.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;

use super::{FieldKind, Message, MessageDescriptor, WireValue};

pub const TIMESTAMP_SAMPLES: u32 = 1;
pub const CHANNEL: u32 = 2;
pub const PORT: u32 = 3;
pub const LOAD_CONFIG: u32 = 4;
pub const NOTE_ON: u32 = 5;
pub const NOTE_OFF: u32 = 6;
pub const CC: u32 = 7;
pub const PROGRAM_CHANGE: u32 = 8;
pub const PITCH_BEND: u32 = 9;
pub const AFTERTOUCH: u32 = 10;
pub const TRANSPORT: u32 = 11;
pub const OTHER: u32 = 12;
pub const HOST_SAMPLE_POSITION: u32 = 13;
pub const CHANNEL_PRESSURE: u32 = 14;
pub const SYS_EX: u32 = 15;

/// Transport state change carried by [`EventKind::Transport`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Stop = 0,
    Start = 1,
    Continue = 2,
}

impl TransportType {
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(TransportType::Stop),
            1 => Some(TransportType::Start),
            2 => Some(TransportType::Continue),
            _ => None,
        }
    }
}

/// The populated event kind of a [`MidiEvent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    LoadConfig { config_path: String },
    NoteOn { note_number: u32, velocity: u32 },
    NoteOff { note_number: u32, velocity: u32 },
    Cc { controller_number: u32, controller_value: u32 },
    ProgramChange { program_number: u32 },
    /// Raw 14-bit wheel position, 8192 is centre
    PitchBend { value: u32 },
    /// Polyphonic key pressure
    Aftertouch { note_number: u32, value: u32 },
    Transport { transport_type: TransportType, host_sample_position: u64 },
    Other { description: String },
    ChannelPressure { value: u32 },
    /// System exclusive body without the F0/F7 framing bytes
    SysEx { data: Bytes },
}

impl EventKind {
    /// Field number this kind occupies in the event message
    pub fn field_number(&self) -> u32 {
        match self {
            EventKind::LoadConfig { .. } => LOAD_CONFIG,
            EventKind::NoteOn { .. } => NOTE_ON,
            EventKind::NoteOff { .. } => NOTE_OFF,
            EventKind::Cc { .. } => CC,
            EventKind::ProgramChange { .. } => PROGRAM_CHANGE,
            EventKind::PitchBend { .. } => PITCH_BEND,
            EventKind::Aftertouch { .. } => AFTERTOUCH,
            EventKind::Transport { .. } => TRANSPORT,
            EventKind::Other { .. } => OTHER,
            EventKind::ChannelPressure { .. } => CHANNEL_PRESSURE,
            EventKind::SysEx { .. } => SYS_EX,
        }
    }

    fn to_message(&self) -> Message {
        let uint = |v: u32| WireValue::UInt(u64::from(v));
        match self {
            EventKind::LoadConfig { config_path } => Message::new().with(1, WireValue::String(config_path.clone())),
            EventKind::NoteOn { note_number, velocity } | EventKind::NoteOff { note_number, velocity } => {
                Message::new().with(1, uint(*note_number)).with(2, uint(*velocity))
            }
            EventKind::Cc {
                controller_number,
                controller_value,
            } => Message::new()
                .with(1, uint(*controller_number))
                .with(2, uint(*controller_value)),
            EventKind::ProgramChange { program_number } => Message::new().with(1, uint(*program_number)),
            EventKind::PitchBend { value } | EventKind::ChannelPressure { value } => Message::new().with(1, uint(*value)),
            EventKind::Aftertouch { note_number, value } => {
                Message::new().with(1, uint(*note_number)).with(2, uint(*value))
            }
            EventKind::Transport {
                transport_type,
                host_sample_position,
            } => Message::new()
                .with(1, WireValue::UInt(*transport_type as u64))
                .with(2, WireValue::UInt(*host_sample_position)),
            EventKind::Other { description } => Message::new().with(1, WireValue::String(description.clone())),
            EventKind::SysEx { data } => Message::new().with(1, WireValue::Bytes(data.clone())),
        }
    }

    /// Read the kind stored under `field` of a decoded event message.
    /// Proto3 semantics: absent scalars read as their zero value. Values
    /// too wide for the typed field yield None.
    pub fn from_field(field: u32, value: &WireValue) -> Option<Self> {
        let inner = value.as_message()?;
        let uint = |n: u32| narrow(inner.get_u64(n));

        let kind = match field {
            LOAD_CONFIG => EventKind::LoadConfig {
                config_path: inner.get_str(1).unwrap_or_default().to_string(),
            },
            NOTE_ON => EventKind::NoteOn {
                note_number: uint(1)?,
                velocity: uint(2)?,
            },
            NOTE_OFF => EventKind::NoteOff {
                note_number: uint(1)?,
                velocity: uint(2)?,
            },
            CC => EventKind::Cc {
                controller_number: uint(1)?,
                controller_value: uint(2)?,
            },
            PROGRAM_CHANGE => EventKind::ProgramChange { program_number: uint(1)? },
            PITCH_BEND => EventKind::PitchBend { value: uint(1)? },
            AFTERTOUCH => EventKind::Aftertouch {
                note_number: uint(1)?,
                value: uint(2)?,
            },
            TRANSPORT => EventKind::Transport {
                transport_type: TransportType::from_raw(inner.get_u64(1).unwrap_or(0))?,
                host_sample_position: inner.get_u64(2).unwrap_or(0),
            },
            OTHER => EventKind::Other {
                description: inner.get_str(1).unwrap_or_default().to_string(),
            },
            CHANNEL_PRESSURE => EventKind::ChannelPressure { value: uint(1)? },
            SYS_EX => EventKind::SysEx {
                data: match inner.get(1) {
                    Some(WireValue::Bytes(data)) => data.clone(),
                    _ => Bytes::new(),
                },
            },
            _ => return None,
        };
        Some(kind)
    }
}

/// Absent reads as zero; a value that does not fit is rejected
fn narrow(value: Option<u64>) -> Option<u32> {
    match value {
        Some(v) => u32::try_from(v).ok(),
        None => Some(0),
    }
}

/// Typed view of the top-level event message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiEvent {
    pub timestamp_samples: u64,
    pub channel: u32,
    pub port: u32,
    pub host_sample_position: Option<u64>,
    pub kind: EventKind,
}

impl MidiEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            timestamp_samples: 0,
            channel: 0,
            port: 0,
            host_sample_position: None,
            kind,
        }
    }

    pub fn load_config(config_path: impl Into<String>) -> Self {
        Self::new(EventKind::LoadConfig {
            config_path: config_path.into(),
        })
    }

    pub fn on_channel(mut self, channel: u32) -> Self {
        self.channel = channel;
        self
    }

    /// Build the generic message tree. Zero-valued metadata is omitted, as a
    /// proto3 encoder would.
    pub fn to_message(&self) -> Message {
        let mut message = Message::new();
        if self.timestamp_samples != 0 {
            message.push(TIMESTAMP_SAMPLES, WireValue::UInt(self.timestamp_samples));
        }
        if self.channel != 0 {
            message.push(CHANNEL, WireValue::UInt(u64::from(self.channel)));
        }
        if self.port != 0 {
            message.push(PORT, WireValue::UInt(u64::from(self.port)));
        }
        message.push(self.kind.field_number(), WireValue::Message(self.kind.to_message()));
        if let Some(position) = self.host_sample_position {
            message.push(HOST_SAMPLE_POSITION, WireValue::UInt(position));
        }
        message
    }

    /// Typed view of a decoded message, using its lowest populated kind.
    /// Returns None when no event kind is populated or a value is out of
    /// range for its typed field.
    pub fn from_message(message: &Message) -> Option<Self> {
        let discriminants = midi_event_descriptor().discriminants();
        let (field, value) = message.iter().find(|(field, _)| discriminants.contains(field))?;

        Some(Self {
            timestamp_samples: message.get_u64(TIMESTAMP_SAMPLES).unwrap_or(0),
            channel: narrow(message.get_u64(CHANNEL))?,
            port: narrow(message.get_u64(PORT))?,
            host_sample_position: message.get_u64(HOST_SAMPLE_POSITION),
            kind: EventKind::from_field(field, value)?,
        })
    }
}

fn pair(name: &str, first: &str, second: &str) -> Arc<MessageDescriptor> {
    Arc::new(
        MessageDescriptor::new(name)
            .field(1, first, FieldKind::UInt)
            .field(2, second, FieldKind::UInt),
    )
}

fn build_descriptor() -> MessageDescriptor {
    let load_config = Arc::new(MessageDescriptor::new("LoadConfigEvent").field(1, "config_path", FieldKind::String));
    let note = pair("NoteEvent", "note_number", "velocity");
    let cc = pair("ControlChangeEvent", "controller_number", "controller_value");
    let program_change =
        Arc::new(MessageDescriptor::new("ProgramChangeEvent").field(1, "program_number", FieldKind::UInt));
    let pitch_bend = Arc::new(MessageDescriptor::new("PitchBendEvent").field(1, "value", FieldKind::UInt));
    let aftertouch = pair("AftertouchEvent", "note_number", "value");
    let channel_pressure =
        Arc::new(MessageDescriptor::new("ChannelPressureEvent").field(1, "value", FieldKind::UInt));
    let sys_ex = Arc::new(MessageDescriptor::new("SysExEvent").field(1, "data", FieldKind::Bytes));
    let transport = pair("TransportEvent", "type", "host_sample_position");
    let other = Arc::new(MessageDescriptor::new("OtherEvent").field(1, "description", FieldKind::String));

    MessageDescriptor::new("MidiEvent")
        .field(TIMESTAMP_SAMPLES, "timestamp_samples", FieldKind::UInt)
        .field(CHANNEL, "channel", FieldKind::UInt)
        .field(PORT, "port", FieldKind::UInt)
        .discriminant(LOAD_CONFIG, "load_config", FieldKind::Message(load_config))
        .discriminant(NOTE_ON, "note_on", FieldKind::Message(note.clone()))
        .discriminant(NOTE_OFF, "note_off", FieldKind::Message(note))
        .discriminant(CC, "cc", FieldKind::Message(cc))
        .discriminant(PROGRAM_CHANGE, "program_change", FieldKind::Message(program_change))
        .discriminant(PITCH_BEND, "pitch_bend", FieldKind::Message(pitch_bend))
        .discriminant(AFTERTOUCH, "aftertouch", FieldKind::Message(aftertouch))
        .discriminant(TRANSPORT, "transport", FieldKind::Message(transport))
        .discriminant(OTHER, "other", FieldKind::Message(other))
        .field(HOST_SAMPLE_POSITION, "host_sample_position", FieldKind::UInt)
        .discriminant(CHANNEL_PRESSURE, "channel_pressure", FieldKind::Message(channel_pressure))
        .discriminant(SYS_EX, "sys_ex", FieldKind::Message(sys_ex))
}

/// Shared descriptor of the top-level `MidiEvent` message
pub fn midi_event_descriptor() -> Arc<MessageDescriptor> {
    static DESCRIPTOR: OnceLock<Arc<MessageDescriptor>> = OnceLock::new();
    DESCRIPTOR.get_or_init(|| Arc::new(build_descriptor())).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_message, encode_message};

    const TEMPLATE_PATH: &str = "/Users/mhc/fiddle/Orchestra_Template.yaml";

    /// Nested load_config bytes with lengths taken from the path
    fn load_config_payload(path: &str) -> Vec<u8> {
        let mut inner = vec![0x0A, path.len() as u8];
        inner.extend_from_slice(path.as_bytes());

        let mut payload = vec![0x22, inner.len() as u8];
        payload.extend_from_slice(&inner);
        payload
    }

    fn decode(payload: &[u8]) -> Message {
        decode_message(&Bytes::copy_from_slice(payload), &midi_event_descriptor()).unwrap()
    }

    #[test]
    fn test_load_config_sample_prefix() {
        let payload = load_config_payload(TEMPLATE_PATH);
        assert_eq!(&payload[..4], &[0x22, 0x2B, 0x0A, 0x29]);
        assert_eq!(payload.len(), 0x2D);
    }

    #[test]
    fn test_decode_load_config_sample() {
        let message = decode(&load_config_payload(TEMPLATE_PATH));

        assert_eq!(message.field_numbers().collect::<Vec<_>>(), vec![LOAD_CONFIG]);
        let inner = message.get_message(LOAD_CONFIG).unwrap();
        assert_eq!(inner.get_str(1), Some(TEMPLATE_PATH));
    }

    #[test]
    fn test_typed_encoder_matches_sample_bytes() {
        let event = MidiEvent::load_config(TEMPLATE_PATH);
        assert_eq!(
            encode_message(&event.to_message()).as_ref(),
            load_config_payload(TEMPLATE_PATH).as_slice()
        );
    }

    #[test]
    fn test_pitch_bend_is_plain_varint() {
        // pitch_bend { value: 8192 } as the plugin writes it
        let message = decode(&[0x4A, 0x03, 0x08, 0x80, 0x40]);
        assert_eq!(
            MidiEvent::from_message(&message).map(|e| e.kind),
            Some(EventKind::PitchBend { value: 8192 })
        );
    }

    #[test]
    fn test_channel_pressure_and_sys_ex() {
        let message = decode(&[0x72, 0x02, 0x08, 0x40]);
        assert_eq!(
            MidiEvent::from_message(&message).map(|e| e.kind),
            Some(EventKind::ChannelPressure { value: 64 })
        );

        let message = decode(&[0x7A, 0x05, 0x0A, 0x03, 0x7E, 0x7F, 0x09]);
        assert_eq!(
            MidiEvent::from_message(&message).map(|e| e.kind),
            Some(EventKind::SysEx {
                data: Bytes::from_static(&[0x7E, 0x7F, 0x09])
            })
        );
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let wide = WireValue::UInt(u64::from(u32::MAX) + 1);

        let note = Message::new().with(1, wide.clone()).with(2, WireValue::UInt(1));
        let message = Message::new().with(NOTE_ON, WireValue::Message(note));
        assert_eq!(MidiEvent::from_message(&message), None);

        let message = MidiEvent::load_config("/a.yaml").to_message().with(CHANNEL, wide);
        assert_eq!(MidiEvent::from_message(&message), None);
    }

    #[test]
    fn test_typed_round_trip() {
        let events = vec![
            MidiEvent {
                timestamp_samples: 480,
                channel: 3,
                port: 1,
                host_sample_position: Some(96_000),
                kind: EventKind::NoteOn {
                    note_number: 60,
                    velocity: 100,
                },
            },
            MidiEvent::new(EventKind::PitchBend { value: 16_383 }).on_channel(9),
            MidiEvent::new(EventKind::Aftertouch {
                note_number: 64,
                value: 20,
            }),
            MidiEvent::new(EventKind::Transport {
                transport_type: TransportType::Start,
                host_sample_position: 44_100,
            }),
            MidiEvent::new(EventKind::Other {
                description: "Heartbeat".to_string(),
            }),
            MidiEvent::new(EventKind::SysEx {
                data: Bytes::from_static(&[0x43, 0x10, 0x4C]),
            }),
        ];

        let descriptor = midi_event_descriptor();
        for event in events {
            let bytes = encode_message(&event.to_message());
            let decoded = decode_message(&bytes, &descriptor).unwrap();
            assert_eq!(MidiEvent::from_message(&decoded), Some(event));
        }
    }

    #[test]
    fn test_discriminants() {
        let mut expected: Vec<u32> = (LOAD_CONFIG..=OTHER).collect();
        expected.extend([CHANNEL_PRESSURE, SYS_EX]);
        assert_eq!(midi_event_descriptor().discriminants(), expected);
    }

    #[test]
    fn test_no_event_kind() {
        let message = Message::new().with(CHANNEL, WireValue::UInt(1));
        assert_eq!(MidiEvent::from_message(&message), None);
    }
}
