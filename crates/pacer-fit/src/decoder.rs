//! Verifying FIT reader
//!
//! Reads the files this crate writes (and plain activity files from other
//! writers): normal record headers, either architecture, developer fields
//! skipped. Compressed timestamp headers are rejected.

use crate::crc::crc16;
use crate::error::{DecodeError, DecodeResult};
use crate::profile::{
    BaseType, COMPRESSED_TIMESTAMP_FLAG, DATA_TYPE, DEFINITION_FLAG, DEVELOPER_DATA_FLAG,
    LOCAL_MESSAGE_MASK, MAX_LOCAL_MESSAGES, TIMESTAMP,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitHeader {
    pub header_size: u8,
    pub protocol_version: u8,
    pub profile_version: u16,
    pub data_size: u32,
    /// Absent for 12-byte headers or when stored as zero
    pub header_crc: Option<u16>,
}

impl FitHeader {
    /// Offset of the trailing file CRC
    pub fn data_end(&self) -> usize {
        self.header_size as usize + self.data_size as usize
    }
}

/// A field value, normalized to little-endian
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedField {
    pub number: u8,
    pub base_type: u8,
    pub data: Vec<u8>,
}

impl DecodedField {
    fn element_size(&self) -> usize {
        BaseType::from_id(self.base_type).map_or(1, BaseType::size)
    }

    fn raw(bytes: &[u8]) -> u64 {
        bytes
            .iter()
            .rev()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
    }

    fn is_invalid(&self, raw: u64) -> bool {
        BaseType::from_id(self.base_type).is_some_and(|base| raw == base.invalid())
    }

    /// First element as unsigned, `None` when it holds the invalid sentinel
    pub fn as_u64(&self) -> Option<u64> {
        let size = self.element_size();
        let raw = Self::raw(self.data.get(..size)?);
        (!self.is_invalid(raw)).then_some(raw)
    }

    /// First element sign-extended, `None` when it holds the invalid sentinel
    pub fn as_i64(&self) -> Option<i64> {
        let size = self.element_size();
        let raw = Self::raw(self.data.get(..size)?);
        if self.is_invalid(raw) {
            return None;
        }
        let shift = 64 - size as u32 * 8;
        Some(((raw << shift) as i64) >> shift)
    }

    /// Every element as unsigned, invalid sentinels included
    pub fn as_u64_array(&self) -> Vec<u64> {
        self.data
            .chunks_exact(self.element_size())
            .map(Self::raw)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub global: u16,
    pub local: u8,
    pub fields: Vec<DecodedField>,
}

impl DecodedMessage {
    pub fn field(&self, number: u8) -> Option<&DecodedField> {
        self.fields.iter().find(|f| f.number == number)
    }

    pub fn uint(&self, number: u8) -> Option<u64> {
        self.field(number).and_then(DecodedField::as_u64)
    }

    pub fn sint(&self, number: u8) -> Option<i64> {
        self.field(number).and_then(DecodedField::as_i64)
    }

    pub fn timestamp(&self) -> Option<u32> {
        self.uint(TIMESTAMP).map(|ts| ts as u32)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitFile {
    pub header: FitHeader,
    pub messages: Vec<DecodedMessage>,
    /// Definition messages encountered
    pub definitions: usize,
    pub crc: u16,
}

impl FitFile {
    pub fn messages_of(&self, global: u16) -> impl Iterator<Item = &DecodedMessage> {
        self.messages.iter().filter(move |m| m.global == global)
    }

    pub fn count(&self, global: u16) -> usize {
        self.messages_of(global).count()
    }

    pub fn first(&self, global: u16) -> Option<&DecodedMessage> {
        self.messages_of(global).next()
    }
}

fn read_header(bytes: &[u8]) -> DecodeResult<FitHeader> {
    let header_size = *bytes.first().ok_or(DecodeError::TooShort(0))?;
    if header_size != 12 && header_size != 14 {
        return Err(DecodeError::BadHeader(format!("header size {}", header_size)));
    }
    if bytes.len() < header_size as usize {
        return Err(DecodeError::TooShort(bytes.len()));
    }
    if &bytes[8..12] != DATA_TYPE {
        return Err(DecodeError::BadHeader("missing .FIT signature".to_string()));
    }

    let header_crc = if header_size == 14 {
        let stored = u16::from_le_bytes([bytes[12], bytes[13]]);
        if stored != 0 {
            let computed = crc16(&bytes[..12]);
            if stored != computed {
                return Err(DecodeError::HeaderCrc { stored, computed });
            }
            Some(stored)
        } else {
            None
        }
    } else {
        None
    };

    Ok(FitHeader {
        header_size,
        protocol_version: bytes[1],
        profile_version: u16::from_le_bytes([bytes[2], bytes[3]]),
        data_size: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        header_crc,
    })
}

/// Check the header, the size and the file CRC without parsing messages
pub fn validate(bytes: &[u8]) -> DecodeResult<FitHeader> {
    let header = read_header(bytes)?;
    let end = header.data_end();
    if bytes.len() < end + 2 {
        return Err(DecodeError::Truncated {
            offset: bytes.len(),
        });
    }
    if bytes.len() > end + 2 {
        return Err(DecodeError::TrailingData(bytes.len() - end - 2));
    }

    let stored = u16::from_le_bytes([bytes[end], bytes[end + 1]]);
    let computed = crc16(&bytes[..end]);
    if stored != computed {
        return Err(DecodeError::FileCrc { stored, computed });
    }
    Ok(header)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> DecodeResult<&'a [u8]> {
        if self.pos + n > self.end {
            return Err(DecodeError::Truncated { offset: self.pos });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> DecodeResult<u8> {
        Ok(self.take(1)?[0])
    }
}

#[derive(Debug, Clone)]
struct LocalDefinition {
    global: u16,
    big_endian: bool,
    fields: Vec<(u8, u8, u8)>,
    developer_bytes: usize,
}

fn to_little_endian(data: &[u8], base_type: u8) -> Vec<u8> {
    let size = BaseType::from_id(base_type).map_or(1, BaseType::size);
    if size == 1 || data.len() % size != 0 {
        return data.to_vec();
    }
    data.chunks_exact(size)
        .flat_map(|element| element.iter().rev().copied())
        .collect()
}

/// Parse and verify a whole file
pub fn decode(bytes: &[u8]) -> DecodeResult<FitFile> {
    let header = validate(bytes)?;
    let end = header.data_end();
    let mut cursor = Cursor {
        bytes,
        pos: header.header_size as usize,
        end,
    };

    let mut locals: Vec<Option<LocalDefinition>> = vec![None; MAX_LOCAL_MESSAGES as usize];
    let mut messages = Vec::new();
    let mut definitions = 0;

    while cursor.pos < end {
        let offset = cursor.pos;
        let record_header = cursor.u8()?;
        if record_header & COMPRESSED_TIMESTAMP_FLAG != 0 {
            return Err(DecodeError::Unsupported(format!(
                "compressed timestamp header at offset {}",
                offset
            )));
        }
        let local = record_header & LOCAL_MESSAGE_MASK;

        if record_header & DEFINITION_FLAG != 0 {
            let _reserved = cursor.u8()?;
            let big_endian = match cursor.u8()? {
                0 => false,
                1 => true,
                other => {
                    return Err(DecodeError::Unsupported(format!(
                        "architecture {} at offset {}",
                        other, offset
                    )));
                }
            };
            let global_bytes = cursor.take(2)?;
            let global = if big_endian {
                u16::from_be_bytes([global_bytes[0], global_bytes[1]])
            } else {
                u16::from_le_bytes([global_bytes[0], global_bytes[1]])
            };
            let field_count = cursor.u8()?;
            let mut fields = Vec::with_capacity(field_count as usize);
            for _ in 0..field_count {
                let spec = cursor.take(3)?;
                fields.push((spec[0], spec[1], spec[2]));
            }
            let mut developer_bytes = 0;
            if record_header & DEVELOPER_DATA_FLAG != 0 {
                let developer_count = cursor.u8()?;
                for _ in 0..developer_count {
                    developer_bytes += cursor.take(3)?[1] as usize;
                }
            }

            locals[local as usize] = Some(LocalDefinition {
                global,
                big_endian,
                fields,
                developer_bytes,
            });
            definitions += 1;
        } else {
            let definition = locals[local as usize]
                .as_ref()
                .ok_or(DecodeError::UndefinedLocal { local, offset })?;

            let mut fields = Vec::with_capacity(definition.fields.len());
            for &(number, size, base_type) in &definition.fields {
                let raw = cursor.take(size as usize)?;
                let data = if definition.big_endian {
                    to_little_endian(raw, base_type)
                } else {
                    raw.to_vec()
                };
                fields.push(DecodedField {
                    number,
                    base_type,
                    data,
                });
            }
            cursor.take(definition.developer_bytes)?;

            messages.push(DecodedMessage {
                global: definition.global,
                local,
                fields,
            });
        }
    }

    Ok(FitFile {
        header,
        messages,
        definitions,
        crc: u16::from_le_bytes([bytes[end], bytes[end + 1]]),
    })
}
