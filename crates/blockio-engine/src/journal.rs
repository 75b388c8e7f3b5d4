//! Circular write-ahead journal
//!
//! The journal is a fixed ring of `journal_block_size` sectors. Block 0
//! permanently holds a START entry pointing at the replay position; the
//! ring body begins at block 1. Entries are tightly packed into sectors:
//!
//! ```text
//! +--------+-------+------+------+------------+-------------+
//! | CRC32C | magic | type | size | chain CRC  | type body   |
//! | 4B     | 2B    | 2B   | 4B   | 4B         | var         |
//! +--------+-------+------+------+------------+-------------+
//! ```
//!
//! The chain CRC links every entry to its predecessor, which makes a torn
//! tail detectable on recovery. Small-write payloads are placed byte-
//! packed into the ring after their entry's sector; `used_start` and
//! `next_free` delimit the live region. Each sector carries a reference
//! count of the dirty entries whose records live in it; a sector becomes
//! reclaimable only at refcount zero.

use crate::index::DynData;
use crate::layout::DiskLayout;
use blockio_common::{compute_crc32c, Error, Oid, Result};
use bytes::{Buf, BufMut};
use std::collections::BTreeMap;
use std::collections::VecDeque;
use tracing::error;

/// Entry magic
pub const ENTRY_MAGIC: u16 = 0x4A45; // "JE"

/// Common entry header size
pub const ENTRY_HEADER_SIZE: usize = 16;

/// Number of in-memory sector staging buffers
pub const SECTOR_BUFFERS: usize = 32;

const TYPE_START: u16 = 1;
const TYPE_SMALL_WRITE: u16 = 2;
const TYPE_SMALL_WRITE_INSTANT: u16 = 3;
const TYPE_BIG_WRITE: u16 = 4;
const TYPE_BIG_WRITE_INSTANT: u16 = 5;
const TYPE_DELETE: u16 = 6;
const TYPE_STABLE: u16 = 7;
const TYPE_ROLLBACK: u16 = 8;

/// A typed journal entry
#[derive(Clone, Debug)]
pub enum JournalEntry {
    /// Ring start marker: where replay begins
    Start { journal_start: u64 },
    /// Sub-block write whose payload lives in the ring at `data_offset`
    SmallWrite {
        oid: Oid,
        version: u64,
        offset: u32,
        len: u32,
        data_offset: u64,
        /// CRC32C of the payload; 0 when per-sub-block checksums are on
        crc32_data: u32,
        instant: bool,
        dyn_data: DynData,
    },
    /// Block write whose payload lives in the data area at `location`
    BigWrite {
        oid: Oid,
        version: u64,
        offset: u32,
        len: u32,
        location: u64,
        instant: bool,
        dyn_data: DynData,
    },
    Delete { oid: Oid, version: u64 },
    /// Commits `(oid, version)` as stable
    Stable { oid: Oid, version: u64 },
    /// Discards versions above `(oid, version)` that never became stable
    Rollback { oid: Oid, version: u64 },
}

impl JournalEntry {
    /// Serialized size in bytes
    #[must_use]
    pub fn wire_size(&self) -> usize {
        ENTRY_HEADER_SIZE
            + match self {
                Self::Start { .. } => 16,
                Self::SmallWrite { dyn_data, .. } => 44 + dyn_data.len(),
                Self::BigWrite { dyn_data, .. } => 40 + dyn_data.len(),
                Self::Delete { .. } | Self::Stable { .. } | Self::Rollback { .. } => 24,
            }
    }

    fn type_tag(&self) -> u16 {
        match self {
            Self::Start { .. } => TYPE_START,
            Self::SmallWrite { instant: false, .. } => TYPE_SMALL_WRITE,
            Self::SmallWrite { instant: true, .. } => TYPE_SMALL_WRITE_INSTANT,
            Self::BigWrite { instant: false, .. } => TYPE_BIG_WRITE,
            Self::BigWrite { instant: true, .. } => TYPE_BIG_WRITE_INSTANT,
            Self::Delete { .. } => TYPE_DELETE,
            Self::Stable { .. } => TYPE_STABLE,
            Self::Rollback { .. } => TYPE_ROLLBACK,
        }
    }

    /// Serialize with the chain CRC sealed in; returns the wire bytes and
    /// this entry's own CRC (the next entry's chain value).
    #[must_use]
    pub fn serialize(&self, crc32_prev: u32) -> (Vec<u8>, u32) {
        let size = self.wire_size();
        let mut buf = Vec::with_capacity(size);
        buf.put_u32_le(0); // CRC placeholder
        buf.put_u16_le(ENTRY_MAGIC);
        buf.put_u16_le(self.type_tag());
        buf.put_u32_le(size as u32);
        buf.put_u32_le(crc32_prev);
        match self {
            Self::Start { journal_start } => {
                buf.put_u64_le(*journal_start);
                buf.put_u64_le(crate::layout::FORMAT_VERSION.into());
            }
            Self::SmallWrite {
                oid,
                version,
                offset,
                len,
                data_offset,
                crc32_data,
                dyn_data,
                ..
            } => {
                buf.put_u64_le(oid.inode);
                buf.put_u64_le(oid.stripe);
                buf.put_u64_le(*version);
                buf.put_u32_le(*offset);
                buf.put_u32_le(*len);
                buf.put_u64_le(*data_offset);
                buf.put_u32_le(*crc32_data);
                buf.put_slice(dyn_data.as_slice());
            }
            Self::BigWrite {
                oid,
                version,
                offset,
                len,
                location,
                dyn_data,
                ..
            } => {
                buf.put_u64_le(oid.inode);
                buf.put_u64_le(oid.stripe);
                buf.put_u64_le(*version);
                buf.put_u32_le(*offset);
                buf.put_u32_le(*len);
                buf.put_u64_le(*location);
                buf.put_slice(dyn_data.as_slice());
            }
            Self::Delete { oid, version }
            | Self::Stable { oid, version }
            | Self::Rollback { oid, version } => {
                buf.put_u64_le(oid.inode);
                buf.put_u64_le(oid.stripe);
                buf.put_u64_le(*version);
            }
        }
        debug_assert_eq!(buf.len(), size);
        let crc = compute_crc32c(&buf[4..]);
        buf[0..4].copy_from_slice(&crc.to_le_bytes());
        (buf, crc)
    }
}

/// An entry parsed from a sector, with its chain linkage
#[derive(Debug)]
pub struct ParsedEntry {
    pub entry: JournalEntry,
    pub size: usize,
    pub crc32: u32,
    pub crc32_prev: u32,
}

impl ParsedEntry {
    /// Parse the entry starting at `buf[0]`.
    ///
    /// Returns `Ok(None)` for a zeroed region (end of packed entries in a
    /// sector) and an error for a present-but-corrupt entry.
    pub fn parse(buf: &[u8]) -> Result<Option<ParsedEntry>> {
        if buf.len() < ENTRY_HEADER_SIZE {
            return Ok(None);
        }
        let mut hdr = &buf[..];
        let crc32 = hdr.get_u32_le();
        let magic = hdr.get_u16_le();
        let type_tag = hdr.get_u16_le();
        let size = hdr.get_u32_le() as usize;
        let crc32_prev = hdr.get_u32_le();
        if magic == 0 && type_tag == 0 && size == 0 {
            return Ok(None);
        }
        if magic != ENTRY_MAGIC {
            return Err(Error::corruption("bad journal entry magic"));
        }
        if size < ENTRY_HEADER_SIZE || size > buf.len() {
            return Err(Error::corruption("bad journal entry size"));
        }
        if compute_crc32c(&buf[4..size]) != crc32 {
            return Err(Error::corruption("journal entry checksum mismatch"));
        }

        let mut body = &buf[ENTRY_HEADER_SIZE..size];
        let entry = match type_tag {
            TYPE_START => {
                let journal_start = body.get_u64_le();
                let _format = body.get_u64_le();
                JournalEntry::Start { journal_start }
            }
            TYPE_SMALL_WRITE | TYPE_SMALL_WRITE_INSTANT => {
                let oid = Oid::new(body.get_u64_le(), body.get_u64_le());
                let version = body.get_u64_le();
                let offset = body.get_u32_le();
                let len = body.get_u32_le();
                let data_offset = body.get_u64_le();
                let crc32_data = body.get_u32_le();
                JournalEntry::SmallWrite {
                    oid,
                    version,
                    offset,
                    len,
                    data_offset,
                    crc32_data,
                    instant: type_tag == TYPE_SMALL_WRITE_INSTANT,
                    dyn_data: DynData::from_vec(body.to_vec()),
                }
            }
            TYPE_BIG_WRITE | TYPE_BIG_WRITE_INSTANT => {
                let oid = Oid::new(body.get_u64_le(), body.get_u64_le());
                let version = body.get_u64_le();
                let offset = body.get_u32_le();
                let len = body.get_u32_le();
                let location = body.get_u64_le();
                JournalEntry::BigWrite {
                    oid,
                    version,
                    offset,
                    len,
                    location,
                    instant: type_tag == TYPE_BIG_WRITE_INSTANT,
                    dyn_data: DynData::from_vec(body.to_vec()),
                }
            }
            TYPE_DELETE | TYPE_STABLE | TYPE_ROLLBACK => {
                let oid = Oid::new(body.get_u64_le(), body.get_u64_le());
                let version = body.get_u64_le();
                match type_tag {
                    TYPE_DELETE => JournalEntry::Delete { oid, version },
                    TYPE_STABLE => JournalEntry::Stable { oid, version },
                    _ => JournalEntry::Rollback { oid, version },
                }
            }
            other => {
                return Err(Error::corruption(format!(
                    "unknown journal entry type {}",
                    other
                )))
            }
        };
        Ok(Some(ParsedEntry {
            entry,
            size,
            crc32,
            crc32_prev,
        }))
    }
}

/// In-memory staging buffer for one journal sector
pub struct Sector {
    /// Ring offset this buffer is bound to; `u64::MAX` when unallocated
    pub offset: u64,
    pub buf: Vec<u8>,
    /// Has unwritten entries
    pub dirty: bool,
    /// Outstanding writes of this buffer
    pub flush_count: u32,
    /// Ops waiting on the next write of this sector
    pub waiters: Vec<usize>,
    /// Waiter groups of the in-flight writes, oldest first. Completions
    /// arrive in submission order, so each write releases exactly the
    /// ops that were waiting on its snapshot.
    pub inflight_groups: VecDeque<Vec<usize>>,
}

/// A sector write held back until outstanding payload writes complete
pub struct DeferredSector {
    pub sector: usize,
    pub offset: u64,
    pub buf: Vec<u8>,
}

/// Journal ring state
pub struct Journal {
    pub block_size: u64,
    pub len: u64,
    /// Next free ring offset
    pub next_free: u64,
    /// Start of the live region
    pub used_start: u64,
    /// Chain CRC of the last appended entry
    pub crc32_last: u32,
    pub sectors: Vec<Sector>,
    pub cur_sector: usize,
    pub in_sector_pos: usize,
    /// Sector ring offset -> count of dirty entries referencing it
    pub used_sectors: BTreeMap<u64, u64>,
    /// Full ring mirror for payload reads without disk I/O
    pub mirror: Option<Vec<u8>>,
    /// Outstanding small-write payload writes; sector writes queue behind
    pub data_pending: u32,
    pub deferred_sectors: Vec<DeferredSector>,
}

impl Journal {
    /// Create the in-memory state of a fresh (or just-replayed) journal
    #[must_use]
    pub fn new(layout: &DiskLayout, inmemory: bool) -> Self {
        let block_size = u64::from(layout.journal_block_size);
        let sectors = (0..SECTOR_BUFFERS)
            .map(|_| Sector {
                offset: u64::MAX,
                buf: vec![0u8; block_size as usize],
                dirty: false,
                flush_count: 0,
                waiters: Vec::new(),
                inflight_groups: VecDeque::new(),
            })
            .collect();
        Self {
            block_size,
            len: layout.journal_len,
            next_free: block_size,
            used_start: block_size,
            crc32_last: 0,
            sectors,
            cur_sector: SECTOR_BUFFERS - 1,
            in_sector_pos: block_size as usize,
            used_sectors: BTreeMap::new(),
            mirror: inmemory.then(|| vec![0u8; layout.journal_len as usize]),
            data_pending: 0,
            deferred_sectors: Vec::new(),
        }
    }

    /// Whether any journaled state is still live
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.used_sectors.is_empty()
            || self.sectors.iter().any(|s| s.dirty || s.flush_count > 0)
    }

    /// Free ring bytes between `next_free` and `used_start`
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        if self.next_free == self.used_start {
            if self.is_live() {
                0
            } else {
                self.len - self.block_size
            }
        } else if self.next_free > self.used_start {
            (self.len - self.next_free) + (self.used_start - self.block_size)
        } else {
            self.used_start - self.next_free
        }
    }

    /// Whether an entry of `size` bytes fits the current sector
    #[must_use]
    pub fn entry_fits(&self, size: usize) -> bool {
        self.sectors[self.cur_sector].offset != u64::MAX
            && self.in_sector_pos + size <= self.block_size as usize
    }

    /// Count of idle staging buffers
    #[must_use]
    pub fn idle_buffers(&self) -> usize {
        self.sectors
            .iter()
            .filter(|s| !s.dirty && s.flush_count == 0)
            .count()
    }

    /// Preflight check: would `entries` records of `entry_size` bytes each,
    /// `data_len` payload bytes, and `reserve` extra bytes all fit?
    #[must_use]
    pub fn check_available(
        &self,
        entries: u64,
        entry_size: usize,
        data_len: u64,
        reserve: u64,
    ) -> bool {
        let mut budget = self.free_bytes();
        let mut nf = self.next_free;
        let mut pos = if self.sectors[self.cur_sector].offset != u64::MAX {
            self.in_sector_pos as u64
        } else {
            self.block_size
        };
        let mut new_sectors = 0u64;
        for _ in 0..entries {
            if pos + entry_size as u64 > self.block_size {
                // Tail waste if the next sector would cross the ring end
                if nf + self.block_size > self.len {
                    let waste = self.len - nf;
                    if budget < waste {
                        return false;
                    }
                    budget -= waste;
                    nf = self.block_size;
                }
                if budget < self.block_size {
                    return false;
                }
                budget -= self.block_size;
                nf += self.block_size;
                pos = 0;
                new_sectors += 1;
            }
            pos += entry_size as u64;
        }
        if new_sectors as usize > self.idle_buffers() {
            return false;
        }
        if data_len > 0 {
            if nf + data_len > self.len {
                let waste = self.len - nf;
                if budget < waste {
                    return false;
                }
                budget -= waste;
                nf = self.block_size;
            }
            if budget < data_len {
                return false;
            }
            budget -= data_len;
        }
        budget >= reserve
    }

    /// Append an entry into the current (or a new) sector buffer.
    ///
    /// The caller must have verified space with [`Self::check_available`]
    /// and written out the previous sector if it wants it flushed before
    /// the switch. Returns the ring offset of the sector holding the
    /// entry.
    pub fn append_entry(&mut self, entry: &JournalEntry) -> u64 {
        let size = entry.wire_size();
        assert!(size <= self.block_size as usize, "entry larger than sector");
        if !self.entry_fits(size) {
            self.start_new_sector();
        }
        let (bytes, crc) = entry.serialize(self.crc32_last);
        let pos = self.in_sector_pos;
        let sector = &mut self.sectors[self.cur_sector];
        sector.buf[pos..pos + size].copy_from_slice(&bytes);
        sector.dirty = true;
        self.in_sector_pos = pos + size;
        self.crc32_last = crc;
        sector.offset
    }

    fn start_new_sector(&mut self) {
        let next = (1..SECTOR_BUFFERS)
            .map(|i| (self.cur_sector + i) % SECTOR_BUFFERS)
            .find(|&i| !self.sectors[i].dirty && self.sectors[i].flush_count == 0);
        let next = match next {
            Some(idx) => idx,
            None => {
                // check_available guarantees an idle buffer; this is a bug
                error!("all journal sector buffers busy");
                std::process::abort();
            }
        };
        let offset = self.alloc_ring(self.block_size);
        let sector = &mut self.sectors[next];
        sector.offset = offset;
        sector.buf.fill(0);
        sector.waiters.clear();
        self.cur_sector = next;
        self.in_sector_pos = 0;
    }

    /// Allocate `bytes` contiguous ring bytes at `next_free`, wrapping to
    /// the first ring block when the tail does not fit. Aborts on overrun
    /// (impossible when preflight checks are honored).
    pub fn alloc_ring(&mut self, bytes: u64) -> u64 {
        let mut start = self.next_free;
        let mut wrapped = false;
        if start + bytes > self.len {
            start = self.block_size;
            wrapped = true;
        }
        let end = start + bytes;
        let crossed = if self.next_free >= self.used_start {
            // Free region is [next_free, len) then [block_size, used_start)
            wrapped && end > self.used_start
        } else {
            // Free region is [next_free, used_start)
            wrapped || end > self.used_start
        };
        if crossed && self.is_live() {
            error!(
                "journal overrun: alloc {} bytes at {:#x}, used_start={:#x} next_free={:#x}",
                bytes, start, self.used_start, self.next_free
            );
            std::process::abort();
        }
        self.next_free = end;
        if self.next_free >= self.len {
            self.next_free = self.block_size;
        }
        start
    }

    /// Take a refcount on the sector at ring offset `offset`
    pub fn ref_sector(&mut self, offset: u64) {
        *self.used_sectors.entry(offset).or_insert(0) += 1;
    }

    /// Drop a refcount; returns true when the sector became unreferenced
    pub fn unref_sector(&mut self, offset: u64) -> bool {
        match self.used_sectors.get_mut(&offset) {
            Some(refs) if *refs > 1 => {
                *refs -= 1;
                false
            }
            Some(_) => {
                self.used_sectors.remove(&offset);
                true
            }
            None => {
                error!("unref of unreferenced journal sector {:#x}", offset);
                std::process::abort();
            }
        }
    }

    /// Snapshot a dirty sector buffer for writing; marks it clean and in
    /// flight, moving the registered waiters into this write's group.
    /// Returns `None` when the sector has nothing new.
    pub fn prepare_sector_write(&mut self, idx: usize) -> Option<DeferredSector> {
        let sector = &mut self.sectors[idx];
        if !sector.dirty || sector.offset == u64::MAX {
            return None;
        }
        sector.dirty = false;
        sector.flush_count += 1;
        let group = std::mem::take(&mut sector.waiters);
        sector.inflight_groups.push_back(group);
        Some(DeferredSector {
            sector: idx,
            offset: sector.offset,
            buf: sector.buf.clone(),
        })
    }

    /// Where the live region could start after a full flush: the first
    /// still-referenced sector, else the current sector, else `next_free`.
    #[must_use]
    pub fn trim_pos(&self) -> u64 {
        if let Some(&pos) = self
            .used_sectors
            .range(self.used_start..)
            .map(|(k, _)| k)
            .next()
            .or_else(|| self.used_sectors.keys().next())
        {
            return pos;
        }
        let cur = &self.sectors[self.cur_sector];
        if cur.offset != u64::MAX && (cur.dirty || self.in_sector_pos < self.block_size as usize) {
            cur.offset
        } else {
            self.next_free
        }
    }

    /// Copy a payload into the ring mirror
    pub fn mirror_write(&mut self, offset: u64, data: &[u8]) {
        if let Some(mirror) = self.mirror.as_mut() {
            mirror[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        }
    }

    /// Read a payload from the ring mirror, if mirrored
    #[must_use]
    pub fn mirror_read(&self, offset: u64, len: usize) -> Option<&[u8]> {
        self.mirror
            .as_ref()
            .map(|m| &m[offset as usize..offset as usize + len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn layout() -> DiskLayout {
        let cfg = Config {
            journal_len: 64 * 4096,
            direct_io: false,
            ..Config::default()
        };
        DiskLayout::compute(&cfg, 16 << 20, 1 << 20, 64 * 4096).unwrap()
    }

    #[test]
    fn test_entry_roundtrip() {
        let entry = JournalEntry::SmallWrite {
            oid: Oid::new(0x10, 0x20),
            version: 3,
            offset: 4096,
            len: 512,
            data_offset: 8192,
            crc32_data: 0xDEAD_BEEF,
            instant: true,
            dyn_data: DynData::from_vec(vec![0xAA, 0xBB, 0xCC, 0xDD]),
        };
        let (bytes, crc) = entry.serialize(0x1234_5678);
        let parsed = ParsedEntry::parse(&bytes).unwrap().unwrap();
        assert_eq!(parsed.crc32, crc);
        assert_eq!(parsed.crc32_prev, 0x1234_5678);
        match parsed.entry {
            JournalEntry::SmallWrite {
                oid,
                version,
                offset,
                len,
                data_offset,
                instant,
                ref dyn_data,
                ..
            } => {
                assert_eq!(oid, Oid::new(0x10, 0x20));
                assert_eq!(version, 3);
                assert_eq!(offset, 4096);
                assert_eq!(len, 512);
                assert_eq!(data_offset, 8192);
                assert!(instant);
                assert_eq!(dyn_data.as_slice(), &[0xAA, 0xBB, 0xCC, 0xDD]);
            }
            other => panic!("wrong entry type: {:?}", other),
        }
    }

    #[test]
    fn test_parse_zero_region_is_end() {
        let buf = vec![0u8; 64];
        assert!(ParsedEntry::parse(&buf).unwrap().is_none());
    }

    #[test]
    fn test_parse_rejects_bitflip() {
        let entry = JournalEntry::Delete {
            oid: Oid::new(1, 2),
            version: 9,
        };
        let (mut bytes, _) = entry.serialize(0);
        bytes[20] ^= 1;
        assert!(ParsedEntry::parse(&bytes).is_err());
    }

    #[test]
    fn test_append_packs_entries() {
        let layout = layout();
        let mut journal = Journal::new(&layout, true);
        let e = JournalEntry::Stable {
            oid: Oid::new(1, 1),
            version: 1,
        };
        let first = journal.append_entry(&e);
        let second = journal.append_entry(&e);
        // Two 40-byte entries share the first ring sector
        assert_eq!(first, journal.block_size);
        assert_eq!(second, first);
        assert_eq!(journal.in_sector_pos, 2 * e.wire_size());
        // Chain CRC advanced
        assert_ne!(journal.crc32_last, 0);
    }

    #[test]
    fn test_sector_switch_on_full() {
        let layout = layout();
        let mut journal = Journal::new(&layout, false);
        let e = JournalEntry::Stable {
            oid: Oid::new(1, 1),
            version: 1,
        };
        let per_sector = 4096 / e.wire_size();
        let first = journal.append_entry(&e);
        for _ in 1..per_sector {
            assert_eq!(journal.append_entry(&e), first);
        }
        let next = journal.append_entry(&e);
        assert_eq!(next, first + journal.block_size);
    }

    #[test]
    fn test_check_available_honors_used_start() {
        let layout = layout();
        let mut journal = Journal::new(&layout, false);
        // Pretend almost the whole ring is live
        journal.used_start = 2 * journal.block_size;
        journal.next_free = journal.block_size;
        journal.ref_sector(2 * journal.block_size);
        assert!(journal.check_available(1, 40, 0, 0));
        assert!(!journal.check_available(1, 40, 8192, 0));
    }

    #[test]
    fn test_free_bytes_wrap() {
        let layout = layout();
        let mut journal = Journal::new(&layout, false);
        assert_eq!(journal.free_bytes(), journal.len - journal.block_size);
        journal.used_start = 10 * journal.block_size;
        journal.next_free = 12 * journal.block_size;
        journal.ref_sector(journal.used_start);
        let expect = (journal.len - journal.next_free) + 9 * journal.block_size;
        assert_eq!(journal.free_bytes(), expect);
    }

    #[test]
    fn test_sector_refcounts() {
        let layout = layout();
        let mut journal = Journal::new(&layout, false);
        journal.ref_sector(4096);
        journal.ref_sector(4096);
        assert!(!journal.unref_sector(4096));
        assert!(journal.unref_sector(4096));
        assert!(journal.used_sectors.is_empty());
    }
}
