//! ISO 9660 directory records.
//!
//! A record is variable length: a fixed 33-byte head followed by the
//! identifier. Numeric fields are stored in both byte orders; the
//! little-endian copy is read here. Records never straddle a logical
//! block; a zero length byte means the rest of the block is padding.

use alloc::vec::Vec;

use crate::datetime::DateTime;
use crate::{read_le_u32, Error, Result};

pub const DR_LENGTH: usize = 0;
pub const DR_ATTRIBUTE_RECORD_LENGTH: usize = 1;
pub const DR_LOCATION: usize = 2;
pub const DR_DATA_LENGTH: usize = 10;
pub const DR_RECORDING_DATE_AND_TIME: usize = 18;
pub const DR_FILE_FLAGS: usize = 25;
pub const DR_FILE_UNIT_SIZE: usize = 26;
pub const DR_INTERLEAVE_GAP_SIZE: usize = 27;
pub const DR_VOLUME_SEQUENCE_NUMBER: usize = 28;
pub const DR_FILE_IDENTIFIER_LENGTH: usize = 32;
pub const DR_FILE_IDENTIFIER: usize = 33;

pub const FF_EXISTENCE: u8 = 0x01;
pub const FF_DIRECTORY: u8 = 0x02;
pub const FF_ASSOCIATED: u8 = 0x04;
pub const FF_RECORD: u8 = 0x08;
pub const FF_PROTECTION: u8 = 0x10;
pub const FF_MULTI_EXTENT: u8 = 0x80;

#[derive(Debug, Clone)]
pub struct DirRecord {
    pub len: u8,
    pub ext_attr_len: u8,
    /// Extent location in logical blocks, little-endian copy.
    pub location: u32,
    pub data_length: u32,
    pub datetime: DateTime,
    pub flags: u8,
    pub identifier: Vec<u8>,
}

impl DirRecord {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let len = buf[DR_LENGTH];
        if (len as usize) < DR_FILE_IDENTIFIER || buf.len() < len as usize {
            return Err(Error::InvalidArgument);
        }
        let id_len = buf[DR_FILE_IDENTIFIER_LENGTH] as usize;
        if (len as usize) < DR_FILE_IDENTIFIER + id_len {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            len,
            ext_attr_len: buf[DR_ATTRIBUTE_RECORD_LENGTH],
            location: read_le_u32(&buf[DR_LOCATION..]),
            data_length: read_le_u32(&buf[DR_DATA_LENGTH..]),
            datetime: DateTime::from_iso_record(&buf[DR_RECORDING_DATE_AND_TIME..]),
            flags: buf[DR_FILE_FLAGS],
            identifier: buf[DR_FILE_IDENTIFIER..DR_FILE_IDENTIFIER + id_len].to_vec(),
        })
    }

    pub fn is_directory(&self) -> bool {
        self.flags & FF_DIRECTORY != 0
    }

    pub fn is_hidden(&self) -> bool {
        self.flags & FF_EXISTENCE != 0
    }

    /// The special self/parent records carry a one-byte identifier of
    /// 0x00 or 0x01.
    pub fn is_dot_or_dotdot(&self) -> bool {
        self.identifier.len() == 1 && self.identifier[0] <= 1
    }

    /// The identifier decoded as big-endian UCS-2 units, with the `;`
    /// version separator and everything after it hidden.
    pub fn identifier_ucs2(&self) -> Vec<u16> {
        let mut units = Vec::with_capacity(self.identifier.len() / 2);
        for pair in self.identifier.chunks_exact(2) {
            let u = u16::from_be_bytes([pair[0], pair[1]]);
            units.push(if u == b';' as u16 { 0 } else { u });
        }
        units
    }

    /// The ASCII identifier truncated at the `;` version separator.
    pub fn identifier_ascii(&self) -> &[u8] {
        let end = self
            .identifier
            .iter()
            .position(|&b| b == b';')
            .unwrap_or(self.identifier.len());
        &self.identifier[..end]
    }
}
