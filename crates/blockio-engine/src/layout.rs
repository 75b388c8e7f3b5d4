//! Disk layout descriptor
//!
//! Layout of the three areas:
//! ```text
//! meta device:    +------------+----------------------------------+
//!                 | superblock |  clean entry records, one per    |
//!                 | (1 block)  |  data block, grouped into blocks |
//!                 +------------+----------------------------------+
//! journal device: +------------+----------------------------------+
//!                 | START blk  |  circular ring of entry sectors  |
//!                 | (block 0)  |  and small-write payloads        |
//!                 +------------+----------------------------------+
//! data device:    +---------------------------------------------+
//!                 |  data_block_size blocks, one object version  |
//!                 +---------------------------------------------+
//! ```
//!
//! All sizes are fixed at format time and recorded in the superblock;
//! open refuses a configuration that disagrees with it.

use crate::config::Config;
use blockio_common::{compute_crc32c, Error, Result};
use bytes::{Buf, BufMut, BytesMut};

/// Magic number of the metadata superblock
pub const SUPERBLOCK_MAGIC: u64 = 0x424C_4B49_4F53_4231; // "BLKIOSB1"

/// On-disk format version
pub const FORMAT_VERSION: u32 = 1;

/// Fixed part of a clean entry record: oid (16) + version (8)
pub const CLEAN_ENTRY_HEADER_SIZE: u32 = 24;

/// Minimum journal length, in journal blocks
pub const MIN_JOURNAL_BLOCKS: u64 = 16;

/// Computed disk layout parameters
#[derive(Clone, Debug)]
pub struct DiskLayout {
    pub data_block_size: u32,
    pub bitmap_granularity: u32,
    pub meta_block_size: u32,
    pub journal_block_size: u32,
    /// 0 when data checksums are disabled
    pub csum_block_size: u32,

    pub data_offset: u64,
    pub meta_offset: u64,
    pub journal_offset: u64,

    /// Number of data blocks (= number of clean entry slots)
    pub block_count: u64,
    /// Journal ring length in bytes
    pub journal_len: u64,
    /// Metadata area length including the superblock
    pub meta_len: u64,

    /// Bytes of one presence bitmap (one bit per granularity unit)
    pub clean_entry_bitmap_size: u32,
    /// Full clean entry record size incl. header, bitmaps, csums, crc
    pub clean_entry_size: u32,
    /// Dynamic part of a clean entry: both bitmaps plus full-block csums
    pub clean_dyn_size: u32,
    /// Clean entry records per metadata block
    pub entries_per_meta_block: u32,
}

impl DiskLayout {
    /// Derive the layout from a validated config and the device sizes
    pub fn compute(
        cfg: &Config,
        data_size: u64,
        meta_size: u64,
        journal_size: u64,
    ) -> Result<Self> {
        cfg.validate()?;

        let bitmap_bits = cfg.data_block_size / cfg.bitmap_granularity;
        let clean_entry_bitmap_size = bitmap_bits.div_ceil(8);
        let csum_count = if cfg.csum_block_size != 0 {
            cfg.data_block_size / cfg.csum_block_size
        } else {
            0
        };
        let clean_dyn_size = 2 * clean_entry_bitmap_size + csum_count * 4;
        let clean_entry_size = CLEAN_ENTRY_HEADER_SIZE + clean_dyn_size + 4;
        if clean_entry_size > cfg.meta_block_size {
            return Err(Error::Configuration(format!(
                "clean entry ({} bytes) does not fit a metadata block ({} bytes)",
                clean_entry_size, cfg.meta_block_size
            )));
        }
        let entries_per_meta_block = cfg.meta_block_size / clean_entry_size;

        let journal_len = if cfg.journal_len != 0 {
            cfg.journal_len
        } else {
            journal_size.saturating_sub(cfg.journal_offset)
        };
        if journal_len % u64::from(cfg.journal_block_size) != 0
            || journal_len < MIN_JOURNAL_BLOCKS * u64::from(cfg.journal_block_size)
        {
            return Err(Error::Configuration(format!(
                "journal length {} must be a multiple of {} and at least {} blocks",
                journal_len, cfg.journal_block_size, MIN_JOURNAL_BLOCKS
            )));
        }

        let data_blocks = data_size.saturating_sub(cfg.data_offset) / u64::from(cfg.data_block_size);
        let meta_capacity_blocks =
            meta_size.saturating_sub(cfg.meta_offset + u64::from(cfg.meta_block_size))
                / u64::from(cfg.meta_block_size);
        let meta_capacity = meta_capacity_blocks * u64::from(entries_per_meta_block);
        let block_count = data_blocks.min(meta_capacity);
        if block_count == 0 {
            return Err(Error::Configuration(
                "devices too small for even one data block".into(),
            ));
        }

        let meta_len = u64::from(cfg.meta_block_size)
            + block_count.div_ceil(u64::from(entries_per_meta_block))
                * u64::from(cfg.meta_block_size);

        Ok(Self {
            data_block_size: cfg.data_block_size,
            bitmap_granularity: cfg.bitmap_granularity,
            meta_block_size: cfg.meta_block_size,
            journal_block_size: cfg.journal_block_size,
            csum_block_size: cfg.csum_block_size,
            data_offset: cfg.data_offset,
            meta_offset: cfg.meta_offset,
            journal_offset: cfg.journal_offset,
            block_count,
            journal_len,
            meta_len,
            clean_entry_bitmap_size,
            clean_entry_size,
            clean_dyn_size,
            entries_per_meta_block,
        })
    }

    /// Bytes of dynamic region a dirty entry needs to cover
    /// `[offset, offset + len)`: the presence bitmap plus one CRC32C per
    /// touched checksum block.
    #[must_use]
    pub fn dirty_dyn_size(&self, offset: u32, len: u32) -> u32 {
        let mut size = self.clean_entry_bitmap_size;
        if self.csum_block_size != 0 && len > 0 {
            let first = offset / self.csum_block_size;
            let last = (offset + len - 1) / self.csum_block_size;
            size += (last - first + 1) * 4;
        }
        size
    }

    /// Number of per-block checksum slots (0 when checksums are off)
    #[must_use]
    pub fn csum_count(&self) -> u32 {
        if self.csum_block_size != 0 {
            self.data_block_size / self.csum_block_size
        } else {
            0
        }
    }

    /// Byte position of data block `block` on the data device
    #[must_use]
    pub fn data_block_pos(&self, block: u64) -> u64 {
        self.data_offset + block * u64::from(self.data_block_size)
    }

    /// Byte position of the metadata block holding entry `block`
    #[must_use]
    pub fn meta_block_pos(&self, block: u64) -> u64 {
        self.meta_offset
            + u64::from(self.meta_block_size)
            + block / u64::from(self.entries_per_meta_block) * u64::from(self.meta_block_size)
    }

    /// Byte offset of entry `block` within its metadata block
    #[must_use]
    pub fn meta_entry_offset(&self, block: u64) -> usize {
        (block % u64::from(self.entries_per_meta_block)) as usize
            * self.clean_entry_size as usize
    }

    /// Byte position of journal ring offset `pos` on the journal device
    #[must_use]
    pub fn journal_pos(&self, pos: u64) -> u64 {
        self.journal_offset + pos
    }
}

/// Superblock stored in the first metadata block
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u64,
    pub version: u32,
    pub data_block_size: u32,
    pub bitmap_granularity: u32,
    pub meta_block_size: u32,
    pub journal_block_size: u32,
    pub csum_block_size: u32,
    pub journal_len: u64,
    pub block_count: u64,
}

impl Superblock {
    /// Serialized size before padding
    pub const WIRE_SIZE: usize = 8 + 4 + 5 * 4 + 2 * 8 + 4;

    /// Build the superblock describing a layout
    #[must_use]
    pub fn for_layout(layout: &DiskLayout) -> Self {
        Self {
            magic: SUPERBLOCK_MAGIC,
            version: FORMAT_VERSION,
            data_block_size: layout.data_block_size,
            bitmap_granularity: layout.bitmap_granularity,
            meta_block_size: layout.meta_block_size,
            journal_block_size: layout.journal_block_size,
            csum_block_size: layout.csum_block_size,
            journal_len: layout.journal_len,
            block_count: layout.block_count,
        }
    }

    /// Serialize into a zero-padded metadata block
    #[must_use]
    pub fn to_bytes(&self, meta_block_size: usize) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(meta_block_size);
        buf.put_u64_le(self.magic);
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.data_block_size);
        buf.put_u32_le(self.bitmap_granularity);
        buf.put_u32_le(self.meta_block_size);
        buf.put_u32_le(self.journal_block_size);
        buf.put_u32_le(self.csum_block_size);
        buf.put_u64_le(self.journal_len);
        buf.put_u64_le(self.block_count);
        let crc = compute_crc32c(&buf);
        buf.put_u32_le(crc);
        buf.resize(meta_block_size, 0);
        buf.to_vec()
    }

    /// Parse and verify a superblock
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::WIRE_SIZE {
            return Err(Error::corruption("superblock too small"));
        }
        let crc_expect = u32::from_le_bytes(
            data[Self::WIRE_SIZE - 4..Self::WIRE_SIZE].try_into().unwrap(),
        );
        if compute_crc32c(&data[..Self::WIRE_SIZE - 4]) != crc_expect {
            return Err(Error::corruption("superblock checksum mismatch"));
        }

        let mut buf = &data[..];
        let magic = buf.get_u64_le();
        if magic != SUPERBLOCK_MAGIC {
            return Err(Error::corruption("bad superblock magic"));
        }
        let version = buf.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(Error::corruption(format!(
                "unsupported format version {}",
                version
            )));
        }
        Ok(Self {
            magic,
            version,
            data_block_size: buf.get_u32_le(),
            bitmap_granularity: buf.get_u32_le(),
            meta_block_size: buf.get_u32_le(),
            journal_block_size: buf.get_u32_le(),
            csum_block_size: buf.get_u32_le(),
            journal_len: buf.get_u64_le(),
            block_count: buf.get_u64_le(),
        })
    }

    /// Check the configured layout against this superblock
    pub fn check_layout(&self, layout: &DiskLayout) -> Result<()> {
        if self.data_block_size != layout.data_block_size
            || self.bitmap_granularity != layout.bitmap_granularity
            || self.meta_block_size != layout.meta_block_size
            || self.journal_block_size != layout.journal_block_size
            || self.csum_block_size != layout.csum_block_size
            || self.journal_len != layout.journal_len
            || self.block_count != layout.block_count
        {
            return Err(Error::Configuration(format!(
                "on-disk layout disagrees with configuration: disk {:?}",
                self
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_layout() -> DiskLayout {
        let cfg = Config {
            direct_io: false,
            ..Config::default()
        };
        DiskLayout::compute(&cfg, 16 << 20, 1 << 20, 1 << 20).unwrap()
    }

    #[test]
    fn test_derived_sizes() {
        let layout = test_layout();
        // 128K block / 4K granularity = 32 bits = 4 bytes
        assert_eq!(layout.clean_entry_bitmap_size, 4);
        assert_eq!(layout.clean_dyn_size, 8);
        assert_eq!(layout.clean_entry_size, 24 + 8 + 4);
        assert_eq!(layout.block_count, 16 << 20 >> 17);
    }

    #[test]
    fn test_dirty_dyn_size_with_checksums() {
        let cfg = Config {
            data_csum_type: crate::config::CsumType::Crc32c,
            csum_block_size: 4096,
            direct_io: false,
            ..Config::default()
        };
        let layout = DiskLayout::compute(&cfg, 16 << 20, 1 << 20, 1 << 20).unwrap();
        // A 4K write inside one csum block: bitmap + 1 crc
        assert_eq!(layout.dirty_dyn_size(4096, 4096), 4 + 4);
        // Crossing two csum blocks
        assert_eq!(layout.dirty_dyn_size(4000, 4096), 4 + 8);
        // Zero-length: bitmap only
        assert_eq!(layout.dirty_dyn_size(0, 0), 4);
    }

    #[test]
    fn test_superblock_roundtrip() {
        let layout = test_layout();
        let sb = Superblock::for_layout(&layout);
        let bytes = sb.to_bytes(4096);
        assert_eq!(bytes.len(), 4096);
        let parsed = Superblock::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, sb);
        parsed.check_layout(&layout).unwrap();
    }

    #[test]
    fn test_superblock_rejects_corruption() {
        let layout = test_layout();
        let mut bytes = Superblock::for_layout(&layout).to_bytes(4096);
        bytes[12] ^= 0xFF;
        assert!(Superblock::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_meta_positions() {
        let layout = test_layout();
        let epb = u64::from(layout.entries_per_meta_block);
        assert_eq!(layout.meta_block_pos(0), 4096);
        assert_eq!(layout.meta_block_pos(epb), 8192);
        assert_eq!(layout.meta_entry_offset(1), layout.clean_entry_size as usize);
    }
}
