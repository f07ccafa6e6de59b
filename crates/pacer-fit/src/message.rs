//! Data messages and their field values

use crate::definition::{FieldDefinition, MessageDefinition};
use crate::profile::BaseType;
use bytes::{BufMut, BytesMut};

/// One encoded field, little-endian
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub number: u8,
    pub base_type: BaseType,
    pub data: Vec<u8>,
}

impl Field {
    fn new(number: u8, base_type: BaseType, data: Vec<u8>) -> Self {
        Self {
            number,
            base_type,
            data,
        }
    }

    pub fn enumeration(number: u8, value: u8) -> Self {
        Self::new(number, BaseType::Enum, vec![value])
    }

    pub fn uint8(number: u8, value: u8) -> Self {
        Self::new(number, BaseType::Uint8, vec![value])
    }

    pub fn sint8(number: u8, value: i8) -> Self {
        Self::new(number, BaseType::Sint8, value.to_le_bytes().to_vec())
    }

    pub fn uint16(number: u8, value: u16) -> Self {
        Self::new(number, BaseType::Uint16, value.to_le_bytes().to_vec())
    }

    pub fn sint32(number: u8, value: i32) -> Self {
        Self::new(number, BaseType::Sint32, value.to_le_bytes().to_vec())
    }

    pub fn uint32(number: u8, value: u32) -> Self {
        Self::new(number, BaseType::Uint32, value.to_le_bytes().to_vec())
    }

    pub fn uint32z(number: u8, value: u32) -> Self {
        Self::new(number, BaseType::Uint32z, value.to_le_bytes().to_vec())
    }

    /// Array field; a field holds at most 255 bytes so longer input is cut
    pub fn uint32_array(number: u8, values: &[u32]) -> Self {
        let data = values
            .iter()
            .take(u8::MAX as usize / 4)
            .flat_map(|v| v.to_le_bytes())
            .collect();
        Self::new(number, BaseType::Uint32, data)
    }

    pub fn size(&self) -> u8 {
        self.data.len() as u8
    }
}

/// A data message before it is bound to a local slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub global: u16,
    pub fields: Vec<Field>,
}

impl Message {
    pub fn new(global: u16) -> Self {
        Self {
            global,
            fields: Vec::new(),
        }
    }

    pub fn with(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Add a field only when the value is known
    pub fn with_opt<T>(mut self, value: Option<T>, field: impl FnOnce(T) -> Field) -> Self {
        if let Some(value) = value {
            self.fields.push(field(value));
        }
        self
    }

    /// The definition describing this message's shape
    pub fn definition(&self) -> MessageDefinition {
        MessageDefinition {
            global: self.global,
            fields: self
                .fields
                .iter()
                .map(|f| FieldDefinition {
                    number: f.number,
                    size: f.size(),
                    base_type: f.base_type.id(),
                })
                .collect(),
        }
    }

    pub fn write_data(&self, local: u8, buf: &mut BytesMut) {
        buf.put_u8(local & crate::profile::LOCAL_MESSAGE_MASK);
        for field in &self.fields {
            buf.put_slice(&field.data);
        }
    }
}
