//! Metadata area management
//!
//! The metadata area is an array of fixed-size clean entry records, one
//! per data block (entry index == block index), grouped into metadata
//! blocks. A zero-filled record means "no clean entry". Records carry the
//! object id, version, two presence bitmaps (internal and the externally
//! visible one), optional per-sub-block checksums and a CRC32C.
//!
//! With `inmemory_meta` the whole area is mirrored in memory, which also
//! enables the zero-entry corruption check performed when a data block is
//! allocated. The per-entry dynamic data (bitmaps + checksums) of live
//! clean entries is always kept in memory regardless, so the read path
//! never touches the metadata device.

use crate::layout::DiskLayout;
use blockio_common::{compute_crc32c, Error, Oid, Result};
use bytes::{Buf, BufMut};

/// A decoded clean entry record
#[derive(Debug)]
pub struct CleanRecord {
    pub oid: Oid,
    pub version: u64,
    /// Both bitmaps and the checksums, as stored
    pub dyn_data: Vec<u8>,
}

/// Metadata area state
pub struct MetaArea {
    entry_size: usize,
    dyn_size: usize,
    bitmap_size: usize,
    entries_per_block: usize,
    meta_block_size: usize,
    block_count: u64,
    /// Mirror of the entry records region (without the superblock),
    /// laid out exactly as on disk: one `meta_block_size` stride per
    /// metadata block
    mirror: Option<Vec<u8>>,
    /// Always-in-memory dynamic data per block: presence bitmap,
    /// external bitmap, checksums
    clean_dyn: Vec<u8>,
}

impl MetaArea {
    /// Create the in-memory state for a layout
    #[must_use]
    pub fn new(layout: &DiskLayout, inmemory: bool) -> Self {
        let entries_region =
            (layout.meta_len - u64::from(layout.meta_block_size)) as usize;
        Self {
            entry_size: layout.clean_entry_size as usize,
            dyn_size: layout.clean_dyn_size as usize,
            bitmap_size: layout.clean_entry_bitmap_size as usize,
            entries_per_block: layout.entries_per_meta_block as usize,
            meta_block_size: layout.meta_block_size as usize,
            block_count: layout.block_count,
            mirror: inmemory.then(|| vec![0u8; entries_region]),
            clean_dyn: vec![0u8; layout.block_count as usize * layout.clean_dyn_size as usize],
        }
    }

    /// Whether the area mirror is kept
    #[must_use]
    pub fn inmemory(&self) -> bool {
        self.mirror.is_some()
    }

    /// Install the mirror contents read from disk at open
    pub fn load_mirror(&mut self, data: Vec<u8>) {
        if let Some(mirror) = self.mirror.as_mut() {
            let n = mirror.len().min(data.len());
            mirror[..n].copy_from_slice(&data[..n]);
        }
    }

    /// Offset of entry `block` within the mirrored entries region
    fn mirror_offset(&self, block: u64) -> usize {
        let meta_block = (block / self.entries_per_block as u64) as usize;
        let slot = (block % self.entries_per_block as u64) as usize;
        meta_block * self.meta_block_size + slot * self.entry_size
    }

    /// Whether the mirrored record for `block` is zero (no clean entry).
    /// Always true without a mirror; the check is only possible in
    /// `inmemory_meta` mode.
    #[must_use]
    pub fn entry_is_zero(&self, block: u64) -> bool {
        match &self.mirror {
            Some(mirror) => {
                let off = self.mirror_offset(block);
                mirror[off..off + self.entry_size].iter().all(|&b| b == 0)
            }
            None => true,
        }
    }

    /// Encode a clean entry record
    #[must_use]
    pub fn encode_entry(&self, oid: Oid, version: u64, dyn_data: &[u8]) -> Vec<u8> {
        debug_assert_eq!(dyn_data.len(), self.dyn_size);
        let mut buf = Vec::with_capacity(self.entry_size);
        buf.put_u64_le(oid.inode);
        buf.put_u64_le(oid.stripe);
        buf.put_u64_le(version);
        buf.put_slice(dyn_data);
        let crc = compute_crc32c(&buf);
        buf.put_u32_le(crc);
        debug_assert_eq!(buf.len(), self.entry_size);
        buf
    }

    /// Decode a record; `Ok(None)` for a zero record
    pub fn decode_entry(&self, data: &[u8]) -> Result<Option<CleanRecord>> {
        if data.len() < self.entry_size {
            return Err(Error::corruption("truncated clean entry"));
        }
        let record = &data[..self.entry_size];
        if record.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        let crc_expect =
            u32::from_le_bytes(record[self.entry_size - 4..].try_into().unwrap());
        if compute_crc32c(&record[..self.entry_size - 4]) != crc_expect {
            return Err(Error::corruption("clean entry checksum mismatch"));
        }
        let mut buf = record;
        let oid = Oid::new(buf.get_u64_le(), buf.get_u64_le());
        let version = buf.get_u64_le();
        let dyn_data = record[24..24 + self.dyn_size].to_vec();
        Ok(Some(CleanRecord {
            oid,
            version,
            dyn_data,
        }))
    }

    /// Patch entry `block` in the mirror (zeroing when `entry` is None)
    /// and return the updated metadata block image to write out, if
    /// mirrored. Without a mirror the caller read-modifies the on-disk
    /// block itself via [`Self::patch_block_buf`].
    pub fn mirror_patch(&mut self, block: u64, entry: Option<&[u8]>) -> Option<Vec<u8>> {
        let entry_size = self.entry_size;
        let per_block = self.entries_per_block;
        let block_size = self.meta_block_size;
        let mirror = self.mirror.as_mut()?;
        let meta_block = (block / per_block as u64) as usize;
        let slot = (block % per_block as u64) as usize;
        let block_start = meta_block * block_size;
        let off = block_start + slot * entry_size;
        match entry {
            Some(bytes) => mirror[off..off + entry_size].copy_from_slice(bytes),
            None => mirror[off..off + entry_size].fill(0),
        }
        Some(mirror[block_start..block_start + block_size].to_vec())
    }

    /// Patch one entry inside a metadata block buffer read from disk
    pub fn patch_block_buf(&self, buf: &mut [u8], block: u64, entry: Option<&[u8]>) {
        let slot = (block % self.entries_per_block as u64) as usize;
        let off = slot * self.entry_size;
        match entry {
            Some(bytes) => buf[off..off + self.entry_size].copy_from_slice(bytes),
            None => buf[off..off + self.entry_size].fill(0),
        }
    }

    // Per-block dynamic data (always in memory)

    /// Store the dynamic data of block's clean entry
    pub fn set_dyn(&mut self, block: u64, dyn_data: &[u8]) {
        let off = block as usize * self.dyn_size;
        self.clean_dyn[off..off + self.dyn_size].copy_from_slice(dyn_data);
    }

    /// Zero the dynamic data of a removed clean entry
    pub fn clear_dyn(&mut self, block: u64) {
        let off = block as usize * self.dyn_size;
        self.clean_dyn[off..off + self.dyn_size].fill(0);
    }

    /// Full dynamic region of a block's clean entry
    #[must_use]
    pub fn dyn_data(&self, block: u64) -> &[u8] {
        let off = block as usize * self.dyn_size;
        &self.clean_dyn[off..off + self.dyn_size]
    }

    /// Internal presence bitmap of a block's clean entry
    #[must_use]
    pub fn presence(&self, block: u64) -> &[u8] {
        &self.dyn_data(block)[..self.bitmap_size]
    }

    /// External bitmap of a block's clean entry
    #[must_use]
    pub fn ext_bitmap(&self, block: u64) -> &[u8] {
        &self.dyn_data(block)[self.bitmap_size..2 * self.bitmap_size]
    }

    /// Stored checksums of a block's clean entry
    #[must_use]
    pub fn csums(&self, block: u64) -> &[u8] {
        &self.dyn_data(block)[2 * self.bitmap_size..]
    }

    /// Number of data blocks covered
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.block_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn area() -> (DiskLayout, MetaArea) {
        let cfg = Config {
            direct_io: false,
            ..Config::default()
        };
        let layout = DiskLayout::compute(&cfg, 16 << 20, 1 << 20, 1 << 20).unwrap();
        let meta = MetaArea::new(&layout, true);
        (layout, meta)
    }

    #[test]
    fn test_entry_roundtrip() {
        let (_, meta) = area();
        let oid = Oid::new(7, 3);
        let dyn_data = vec![0xF0, 0x0F, 0xAA, 0x55, 1, 2, 3, 4];
        let bytes = meta.encode_entry(oid, 12, &dyn_data);
        let rec = meta.decode_entry(&bytes).unwrap().unwrap();
        assert_eq!(rec.oid, oid);
        assert_eq!(rec.version, 12);
        assert_eq!(rec.dyn_data, dyn_data);
    }

    #[test]
    fn test_zero_record_is_absent() {
        let (layout, meta) = area();
        let zero = vec![0u8; layout.clean_entry_size as usize];
        assert!(meta.decode_entry(&zero).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_record_rejected() {
        let (_, meta) = area();
        let mut bytes = meta.encode_entry(Oid::new(1, 1), 1, &[0u8; 8]);
        bytes[3] ^= 0x80;
        assert!(meta.decode_entry(&bytes).is_err());
    }

    #[test]
    fn test_mirror_patch_and_zero_check() {
        let (_, mut meta) = area();
        assert!(meta.entry_is_zero(5));
        let entry = meta.encode_entry(Oid::new(1, 1), 1, &[0u8; 8]);
        meta.mirror_patch(5, Some(&entry)).unwrap();
        assert!(!meta.entry_is_zero(5));
        assert!(meta.entry_is_zero(4));
        meta.mirror_patch(5, None).unwrap();
        assert!(meta.entry_is_zero(5));
    }

    #[test]
    fn test_dyn_accessors() {
        let (_, mut meta) = area();
        // bitmap_size = 4: presence | ext | csums(empty)
        meta.set_dyn(2, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(meta.presence(2), &[1, 2, 3, 4]);
        assert_eq!(meta.ext_bitmap(2), &[5, 6, 7, 8]);
        assert!(meta.csums(2).is_empty());
        meta.clear_dyn(2);
        assert_eq!(meta.presence(2), &[0, 0, 0, 0]);
    }
}
