//! Definition messages and the local slot table
//!
//! A data message refers to its layout by local slot (0..16). The encoder
//! only writes a definition when a message's shape is not bound to any slot;
//! when every slot is taken the least recently used one is rebound.

use bytes::{BufMut, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldDefinition {
    pub number: u8,
    pub size: u8,
    pub base_type: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageDefinition {
    pub global: u16,
    pub fields: Vec<FieldDefinition>,
}

impl MessageDefinition {
    /// Bytes of a data message body, excluding its header byte
    pub fn data_size(&self) -> usize {
        self.fields.iter().map(|f| f.size as usize).sum()
    }

    /// Write as a little-endian definition message for `local`
    pub fn write(&self, local: u8, buf: &mut BytesMut) {
        buf.put_u8(crate::profile::DEFINITION_FLAG | (local & crate::profile::LOCAL_MESSAGE_MASK));
        buf.put_u8(0); // reserved
        buf.put_u8(0); // little-endian
        buf.put_u16_le(self.global);
        buf.put_u8(self.fields.len() as u8);
        for field in &self.fields {
            buf.put_u8(field.number);
            buf.put_u8(field.size);
            buf.put_u8(field.base_type);
        }
    }
}

/// Result of binding a definition to a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Already bound; only the data message is needed
    Bound(u8),
    /// Newly bound; the definition must be written first
    New { local: u8, evicted: bool },
}

impl Binding {
    pub fn local(self) -> u8 {
        match self {
            Binding::Bound(local) | Binding::New { local, .. } => local,
        }
    }
}

#[derive(Debug)]
struct Slot {
    definition: MessageDefinition,
    last_used: u64,
}

#[derive(Debug)]
pub struct DefinitionTable {
    slots: Vec<Option<Slot>>,
    tick: u64,
}

impl DefinitionTable {
    pub fn new(capacity: u8) -> Self {
        let capacity = capacity.clamp(1, crate::profile::MAX_LOCAL_MESSAGES);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            tick: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn bind(&mut self, definition: &MessageDefinition) -> Binding {
        self.tick += 1;

        if let Some(local) = self.slots.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|slot| &slot.definition == definition)
        }) {
            if let Some(slot) = self.slots[local].as_mut() {
                slot.last_used = self.tick;
            }
            return Binding::Bound(local as u8);
        }

        let (local, evicted) = match self.slots.iter().position(Option::is_none) {
            Some(free) => (free, false),
            None => {
                let lru = self
                    .slots
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, slot)| slot.as_ref().map_or(0, |s| s.last_used))
                    .map_or(0, |(index, _)| index);
                (lru, true)
            }
        };

        self.slots[local] = Some(Slot {
            definition: definition.clone(),
            last_used: self.tick,
        });
        Binding::New {
            local: local as u8,
            evicted,
        }
    }
}
