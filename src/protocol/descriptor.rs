//! Message descriptors
//!
//! A descriptor is the read-only lookup table the decoder consults to type
//! each field: field number → name, kind and (for embedded messages) the
//! nested descriptor. Descriptors are built once at startup and shared
//! behind `Arc`.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::WireType;

/// Value kind of a single field
#[derive(Debug, Clone)]
pub enum FieldKind {
    /// Unsigned varint (uint32/uint64)
    UInt,
    /// Zig-zag encoded signed varint (sint32/sint64)
    SInt,
    /// Varint restricted to 0/1
    Bool,
    /// Length-delimited UTF-8 text
    String,
    /// Length-delimited opaque bytes
    Bytes,
    /// Length-delimited embedded message
    Message(Arc<MessageDescriptor>),
}

impl FieldKind {
    /// Wire type a field of this kind is encoded with
    pub fn wire_type(&self) -> WireType {
        match self {
            FieldKind::UInt | FieldKind::SInt | FieldKind::Bool => WireType::Varint,
            FieldKind::String | FieldKind::Bytes | FieldKind::Message(_) => WireType::LengthDelimited,
        }
    }
}

/// Schema entry for one field
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub number: u32,
    pub name: String,
    pub kind: FieldKind,
    /// Member of the top-level event-kind oneof
    pub discriminant: bool,
}

/// Schema for one message type
#[derive(Debug, Clone, Default)]
pub struct MessageDescriptor {
    name: String,
    fields: BTreeMap<u32, FieldDescriptor>,
}

impl MessageDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Add a plain field
    pub fn field(mut self, number: u32, name: impl Into<String>, kind: FieldKind) -> Self {
        self.insert(number, name.into(), kind, false);
        self
    }

    /// Add a field that identifies the event kind of the message
    pub fn discriminant(mut self, number: u32, name: impl Into<String>, kind: FieldKind) -> Self {
        self.insert(number, name.into(), kind, true);
        self
    }

    fn insert(&mut self, number: u32, name: String, kind: FieldKind, discriminant: bool) {
        debug_assert!(number > 0, "field numbers start at 1");
        self.fields.insert(
            number,
            FieldDescriptor {
                number,
                name,
                kind,
                discriminant,
            },
        );
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, number: u32) -> Option<&FieldDescriptor> {
        self.fields.get(&number)
    }

    pub fn by_name(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.values().find(|f| f.name == name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.values()
    }

    /// Field numbers marked as event-kind discriminants, ascending
    pub fn discriminants(&self) -> Vec<u32> {
        self.fields
            .values()
            .filter(|f| f.discriminant)
            .map(|f| f.number)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discriminants_sorted() {
        let inner = Arc::new(MessageDescriptor::new("Inner").field(1, "x", FieldKind::UInt));
        let desc = MessageDescriptor::new("Outer")
            .discriminant(9, "late", FieldKind::Message(inner.clone()))
            .field(1, "meta", FieldKind::UInt)
            .discriminant(3, "early", FieldKind::Message(inner));

        assert_eq!(desc.discriminants(), vec![3, 9]);
        assert_eq!(desc.by_name("meta").map(|f| f.number), Some(1));
        assert_eq!(desc.get(3).unwrap().kind.wire_type(), WireType::LengthDelimited);
    }
}
