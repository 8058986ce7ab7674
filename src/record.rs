use std::io::{Error, ErrorKind};

use crate::error::Result;
use crate::mapper::FileMapper;

/// Bytes occupied by the fixed fields: hash (8) + next (8) + two length
/// prefixes (4 each).
pub(crate) const RECORD_FIXED_LEN: u64 = 24;

/// One node of a bucket's collision chain, decoded into owned buffers.
///
/// On-disk layout at `pos`:
///
/// ```text
/// hash:u64 | next:u64 | keyLen:u32 | key | valLen:u32 | val
/// ```
///
/// Records are written once at an allocated position and never moved; the
/// next pointer at `pos + 8` is the only field mutated in place.
pub(crate) struct RecordNode {
    pub hash: u64,
    pub next: u64,
    pub key: Vec<u8>,
    pub val: Vec<u8>,
    /// Offset of this node in the secondary file; 0 for nodes not yet written.
    pub pos: u64,
}

impl RecordNode {
    pub fn new(hash: u64, key: Vec<u8>, val: Vec<u8>) -> Self {
        RecordNode {
            hash,
            next: 0,
            key,
            val,
            pos: 0,
        }
    }

    /// On-disk size in bytes.
    pub fn size(&self) -> u64 {
        RECORD_FIXED_LEN + self.key.len() as u64 + self.val.len() as u64
    }

    /// Decodes the node stored at `pos`.
    pub fn read(mapper: &FileMapper, pos: u64) -> Result<Self> {
        let head = mapper.get_bytes(pos, 20)?;
        let hash = u64::from_le_bytes(head[0..8].try_into().unwrap());
        let next = u64::from_le_bytes(head[8..16].try_into().unwrap());
        let key_len = u32::from_le_bytes(head[16..20].try_into().unwrap());

        let key = mapper.get_bytes(pos + 20, key_len as usize)?;
        let val_off = pos + 20 + key_len as u64;
        let val_len =
            u32::from_le_bytes(mapper.get_bytes(val_off, 4)?.as_slice().try_into().unwrap());
        let val = mapper.get_bytes(val_off + 4, val_len as usize)?;

        Ok(RecordNode {
            hash,
            next,
            key,
            val,
            pos,
        })
    }

    /// Writes every field at `pos`. The caller must have reserved `size()`
    /// bytes there; nothing may point at `pos` until this returns.
    pub fn write(&mut self, mapper: &FileMapper, pos: u64) -> Result<()> {
        let key_len = u32::try_from(self.key.len())
            .map_err(|_| Error::new(ErrorKind::InvalidInput, "key longer than u32::MAX"))?;
        let val_len = u32::try_from(self.val.len())
            .map_err(|_| Error::new(ErrorKind::InvalidInput, "value longer than u32::MAX"))?;

        let mut buf = Vec::with_capacity(self.size() as usize);
        buf.extend_from_slice(&self.hash.to_le_bytes());
        buf.extend_from_slice(&self.next.to_le_bytes());
        buf.extend_from_slice(&key_len.to_le_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&val_len.to_le_bytes());
        buf.extend_from_slice(&self.val);
        mapper.put_bytes(pos, &buf)?;
        self.pos = pos;
        Ok(())
    }

    /// Redirects this node's on-disk next pointer.
    pub fn set_next(&mut self, mapper: &FileMapper, next: u64) -> Result<()> {
        mapper.put_u64(self.pos + 8, next)?;
        self.next = next;
        Ok(())
    }

    /// True when the stored hash and key both match. The hash comparison
    /// short-circuits most mismatches without touching the key bytes.
    pub fn key_equals(&self, hash: u64, key: &[u8]) -> bool {
        self.hash == hash && self.key == key
    }
}
