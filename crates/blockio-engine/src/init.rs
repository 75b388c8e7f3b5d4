//! Format and open-time recovery
//!
//! `format` stamps the superblock, zeroes the metadata area and writes
//! the initial journal START block. `open` verifies the superblock
//! against the configuration, rebuilds the clean index and allocator
//! from the metadata area, then replays the journal: entries are walked
//! from the START position, each verified by its own CRC and the chain
//! CRC to its predecessor, so a torn tail is detected and truncated.
//! Replayed writes are SYNCED (their records are on disk); instant
//! writes and deletes are STABLE; STABLE and ROLLBACK markers are
//! re-applied.

use crate::allocator::Allocator;
use crate::config::Config;
use crate::engine::BlockStore;
use crate::flusher::Flusher;
use crate::index::{CleanEntry, CleanIndex, DirtyEntry, DirtyIndex, DynData, Stage, WriteKind};
use crate::journal::{Journal, JournalEntry, ParsedEntry};
use crate::layout::{DiskLayout, Superblock};
use crate::meta::MetaArea;
use crate::raw_io::DirectFile;
use crate::ring::{FileId, Ring, TimerEvent};
use blockio_common::{crc32c_pad, verify_crc32c, Error, ObjVer, Result};
use std::collections::{HashMap, VecDeque};
use tracing::{info, warn};

/// Chunk size for zeroing and bulk reads at format/open
const INIT_CHUNK: usize = 1 << 20;

impl BlockStore {
    /// Initialize fresh on-disk state. Creates regular files of the
    /// required sizes; `data_size` is the data area length in bytes and
    /// `journal_len` must be set in the configuration.
    pub fn format(cfg: &Config, data_size: u64) -> Result<()> {
        cfg.validate()?;
        if cfg.journal_len == 0 {
            return Err(Error::Configuration(
                "journal_len must be set to format".into(),
            ));
        }
        // Provisional layout against an unbounded metadata device, to
        // learn how large the metadata file has to be
        let probe = DiskLayout::compute(cfg, cfg.data_offset + data_size, u64::MAX / 4, cfg.journal_offset + cfg.journal_len)?;
        let meta_size = cfg.meta_offset + probe.meta_len;

        let data = DirectFile::create(&cfg.data_path, cfg.data_offset + data_size, cfg.direct_io)?;
        let meta = DirectFile::create(&cfg.meta_path, meta_size, cfg.direct_io)?;
        let journal = DirectFile::create(
            &cfg.journal_path,
            cfg.journal_offset + cfg.journal_len,
            cfg.direct_io,
        )?;
        let layout = DiskLayout::compute(cfg, data.size(), meta.size(), journal.size())?;

        // Superblock, zeroed entry records
        let sb = Superblock::for_layout(&layout);
        meta.write_at(layout.meta_offset, &sb.to_bytes(layout.meta_block_size as usize))?;
        let zeros = vec![0u8; INIT_CHUNK];
        let mut off = layout.meta_offset + u64::from(layout.meta_block_size);
        let meta_end = layout.meta_offset + layout.meta_len;
        while off < meta_end {
            let n = ((meta_end - off) as usize).min(INIT_CHUNK);
            meta.write_at(off, &zeros[..n])?;
            off += n as u64;
        }

        // Journal: START block, zeroed ring body
        let start = JournalEntry::Start {
            journal_start: u64::from(layout.journal_block_size),
        };
        let (bytes, _) = start.serialize(0);
        let mut block0 = vec![0u8; layout.journal_block_size as usize];
        block0[..bytes.len()].copy_from_slice(&bytes);
        journal.write_at(layout.journal_offset, &block0)?;
        let mut off = layout.journal_offset + u64::from(layout.journal_block_size);
        let journal_end = layout.journal_offset + layout.journal_len;
        while off < journal_end {
            let n = ((journal_end - off) as usize).min(INIT_CHUNK);
            journal.write_at(off, &zeros[..n])?;
            off += n as u64;
        }

        data.fsync()?;
        meta.fsync()?;
        journal.fsync()?;
        info!(
            "formatted block store: {} blocks of {} bytes, {} byte journal",
            layout.block_count, layout.data_block_size, layout.journal_len
        );
        Ok(())
    }

    /// Open the store: verify the superblock, load the metadata area and
    /// replay the journal.
    pub fn open(cfg: Config) -> Result<Self> {
        cfg.validate()?;
        let data = DirectFile::open(&cfg.data_path, cfg.direct_io, cfg.read_only)?;
        let meta = DirectFile::open(&cfg.meta_path, cfg.direct_io, cfg.read_only)?;
        let journal_file = DirectFile::open(&cfg.journal_path, cfg.direct_io, cfg.read_only)?;
        let layout = DiskLayout::compute(&cfg, data.size(), meta.size(), journal_file.size())?;

        let mut sb_buf = vec![0u8; layout.meta_block_size as usize];
        meta.read_at(layout.meta_offset, &mut sb_buf)?;
        Superblock::from_bytes(&sb_buf)?.check_layout(&layout)?;

        let ring = Ring::new(data, meta, journal_file);
        let journal = Journal::new(&layout, cfg.inmemory_journal);
        let meta_area = MetaArea::new(&layout, cfg.inmemory_meta);
        let alloc = Allocator::new(layout.block_count);
        let zero_block = vec![0u8; layout.data_block_size as usize];

        let mut store = BlockStore {
            cfg,
            ring,
            alloc,
            clean: CleanIndex::new(),
            dirty: DirtyIndex::new(),
            journal,
            meta: meta_area,
            flusher: Flusher::new(),
            ops: Vec::new(),
            free_ops: Vec::new(),
            submit_queue: VecDeque::new(),
            unsynced_big_writes: Vec::new(),
            unsynced_small_writes: Vec::new(),
            unstable_writes: HashMap::new(),
            unstable_unsynced: 0,
            unsynced_big_write_count: 0,
            unsynced_queued_ops: 0,
            write_iodepth: 0,
            cur_sync: None,
            shutting_down: false,
            zero_block,
            layout,
        };

        store.load_metadata()?;
        store.replay_journal()?;

        if store.journal.mirror.is_some() {
            store.load_journal_mirror()?;
        }
        if !store.cfg.autosync_interval.is_zero() && !store.cfg.read_only {
            store
                .ring
                .set_timer(store.cfg.autosync_interval, TimerEvent::Autosync);
        }
        info!(
            "opened block store: {} clean objects, {} journaled entries, journal [{:#x}, {:#x})",
            store.clean.len(),
            store.dirty.len(),
            store.journal.used_start,
            store.journal.next_free
        );
        Ok(store)
    }

    /// Scan the metadata area into the clean index and allocator
    fn load_metadata(&mut self) -> Result<()> {
        let entry_size = self.layout.clean_entry_size as usize;
        let per_block = self.layout.entries_per_meta_block as u64;
        let region_start = self.layout.meta_offset + u64::from(self.layout.meta_block_size);
        let region_len = (self.layout.meta_len - u64::from(self.layout.meta_block_size)) as usize;

        let mut region = vec![0u8; region_len];
        let mut off = 0usize;
        while off < region_len {
            let n = (region_len - off).min(INIT_CHUNK);
            self.ring
                .read_now(FileId::Meta, region_start + off as u64, &mut region[off..off + n])?;
            off += n;
        }
        if self.meta.inmemory() {
            self.meta.load_mirror(region.clone());
        }

        let mut stale_zeroed = false;
        for block in 0..self.layout.block_count {
            let meta_block = (block / per_block) as usize;
            let slot = (block % per_block) as usize;
            let pos = meta_block * self.layout.meta_block_size as usize + slot * entry_size;
            let record = match self.meta.decode_entry(&region[pos..pos + entry_size])? {
                Some(r) => r,
                None => continue,
            };
            if let Some(existing) = self.clean.get(record.oid) {
                // Two entries for one object: a crash between the new
                // entry write and the old entry zeroing. Keep the newer
                // and zero the stale record so the slot can be reused.
                warn!(
                    "duplicate clean entry for {}: v{} and v{}",
                    record.oid, existing.version, record.version
                );
                if existing.version >= record.version {
                    if !self.cfg.read_only {
                        self.write_meta_entry(block, None);
                        stale_zeroed = true;
                    }
                    continue;
                }
                let old_block = existing.location / u64::from(self.layout.data_block_size);
                self.alloc.set(old_block, false);
                self.meta.clear_dyn(old_block);
                if !self.cfg.read_only {
                    self.write_meta_entry(old_block, None);
                    stale_zeroed = true;
                }
            }
            self.alloc.set(block, true);
            self.clean.insert(
                record.oid,
                CleanEntry {
                    version: record.version,
                    location: block * u64::from(self.layout.data_block_size),
                },
            );
            self.meta.set_dyn(block, &record.dyn_data);
        }
        if stale_zeroed {
            self.ring.fsync_now(FileId::Meta)?;
        }
        Ok(())
    }

    /// Walk the journal ring from the START position, re-applying every
    /// entry that passes its CRC and the chain CRC. Stops at the first
    /// torn or chain-broken entry and truncates the tail in place.
    fn replay_journal(&mut self) -> Result<()> {
        let jbs = self.journal.block_size;
        let jlen = self.journal.len;

        let mut block0 = vec![0u8; jbs as usize];
        self.ring
            .read_now(FileId::Journal, self.layout.journal_pos(0), &mut block0)?;
        let start = match ParsedEntry::parse(&block0)? {
            Some(p) => match p.entry {
                JournalEntry::Start { journal_start } => journal_start,
                _ => return Err(Error::corruption("journal block 0 is not a START entry")),
            },
            None => return Err(Error::corruption("missing journal START entry")),
        };
        if start < jbs || start >= jlen {
            return Err(Error::corruption("journal START position out of range"));
        }
        self.journal.used_start = start;
        self.journal.next_free = start;

        let mut pos = start;
        let mut nf = start;
        let mut expected_prev: Option<u32> = None;
        let mut total = 0u64;
        let mut truncate_at: Option<(u64, usize)> = None;

        'walk: loop {
            // The start position can sit unaligned near the ring end
            // after a trim; read what fits and parse a zero-padded image
            let read_len = jbs.min(jlen - pos) as usize;
            let mut sector = vec![0u8; jbs as usize];
            self.ring.read_now(
                FileId::Journal,
                self.layout.journal_pos(pos),
                &mut sector[..read_len],
            )?;
            let sector_frontier = if pos + jbs >= jlen { jbs } else { pos + jbs };
            let mut in_pos = 0usize;
            let mut applied_any = false;
            loop {
                let parsed = match ParsedEntry::parse(&sector[in_pos..]) {
                    Ok(Some(p)) => p,
                    Ok(None) => break,
                    Err(_) => {
                        truncate_at = Some((pos, in_pos));
                        break 'walk;
                    }
                };
                if let Some(prev) = expected_prev {
                    if parsed.crc32_prev != prev {
                        truncate_at = Some((pos, in_pos));
                        break 'walk;
                    }
                }
                if !applied_any {
                    nf = sector_frontier;
                    applied_any = true;
                }
                if !self.replay_apply(&parsed.entry, pos, &mut nf)? {
                    // Torn payload: the entry is on disk but its data is not
                    truncate_at = Some((pos, in_pos));
                    break 'walk;
                }
                expected_prev = Some(parsed.crc32);
                in_pos += parsed.size;
                total += 1;
            }
            if !applied_any {
                break;
            }
            if nf == start {
                break; // full circle
            }
            pos = if nf + jbs > jlen { jbs } else { nf };
            if pos == start {
                break;
            }
        }

        if let Some((sector_pos, valid_len)) = truncate_at {
            warn!(
                "journal tail truncated at {:#x}+{} after {} entries",
                sector_pos, valid_len, total
            );
            if !self.cfg.read_only {
                let read_len = jbs.min(jlen - sector_pos) as usize;
                let mut sector = vec![0u8; read_len];
                self.ring.read_now(
                    FileId::Journal,
                    self.layout.journal_pos(sector_pos),
                    &mut sector,
                )?;
                sector[valid_len..].fill(0);
                self.ring.write_now(
                    FileId::Journal,
                    self.layout.journal_pos(sector_pos),
                    &sector,
                )?;
                self.ring.fsync_now(FileId::Journal)?;
            }
        }

        self.journal.next_free = nf;
        self.journal.crc32_last = expected_prev.unwrap_or(0);
        info!(
            "journal replay: {} entries, {} dirty objects rebuilt",
            total,
            self.dirty.len()
        );
        Ok(())
    }

    /// Re-apply one replayed entry. Returns false when a small write's
    /// payload fails verification (torn tail).
    fn replay_apply(
        &mut self,
        entry: &JournalEntry,
        sector_pos: u64,
        nf: &mut u64,
    ) -> Result<bool> {
        match entry {
            JournalEntry::Start { .. } => {}
            JournalEntry::SmallWrite {
                oid,
                version,
                offset,
                len,
                data_offset,
                crc32_data,
                instant,
                dyn_data,
            } => {
                if *len > 0 {
                    let mut payload = vec![0u8; *len as usize];
                    self.ring.read_now(
                        FileId::Journal,
                        self.layout.journal_pos(*data_offset),
                        &mut payload,
                    )?;
                    if !self.verify_replayed_payload(
                        *offset,
                        &payload,
                        *crc32_data,
                        dyn_data.as_slice(),
                    ) {
                        return Ok(false);
                    }
                    *nf = *data_offset + u64::from(*len);
                }
                let ov = ObjVer::new(*oid, *version);
                self.dirty.insert(
                    ov,
                    DirtyEntry {
                        kind: WriteKind::Small,
                        stage: Stage::Synced,
                        instant: *instant,
                        offset: *offset,
                        len: *len,
                        location: *data_offset,
                        journal_sector: sector_pos,
                        dyn_data: dyn_data.clone(),
                    },
                );
                self.journal.ref_sector(sector_pos);
                self.replay_finish_entry(ov, *instant);
            }
            JournalEntry::BigWrite {
                oid,
                version,
                offset,
                len,
                location,
                instant,
                dyn_data,
            } => {
                let ov = ObjVer::new(*oid, *version);
                self.dirty.insert(
                    ov,
                    DirtyEntry {
                        kind: WriteKind::Big,
                        stage: Stage::Synced,
                        instant: *instant,
                        offset: *offset,
                        len: *len,
                        location: *location,
                        journal_sector: sector_pos,
                        dyn_data: dyn_data.clone(),
                    },
                );
                self.alloc
                    .set(*location / u64::from(self.layout.data_block_size), true);
                self.journal.ref_sector(sector_pos);
                self.replay_finish_entry(ov, *instant);
            }
            JournalEntry::Delete { oid, version } => {
                let ov = ObjVer::new(*oid, *version);
                self.dirty.insert(
                    ov,
                    DirtyEntry {
                        kind: WriteKind::Delete,
                        stage: Stage::Synced,
                        instant: true,
                        offset: 0,
                        len: 0,
                        location: 0,
                        journal_sector: sector_pos,
                        dyn_data: DynData::from_vec(Vec::new()),
                    },
                );
                self.journal.ref_sector(sector_pos);
                self.replay_finish_entry(ov, true);
            }
            JournalEntry::Stable { oid, version } => {
                self.mark_stable(ObjVer::new(*oid, *version));
            }
            JournalEntry::Rollback { oid, version } => {
                let doomed: Vec<ObjVer> = self
                    .dirty
                    .versions_of(*oid)
                    .filter(|(k, _)| k.version > *version)
                    .map(|(k, _)| *k)
                    .collect();
                for key in doomed {
                    if let Some(e) = self.dirty.remove(&key) {
                        if e.journalled() {
                            self.journal.unref_sector(e.journal_sector);
                        }
                        if e.kind == WriteKind::Big {
                            self.alloc
                                .set(e.location / u64::from(self.layout.data_block_size), false);
                        }
                    }
                }
            }
        }
        Ok(true)
    }

    /// Replayed entries are durable by definition; instant entries (and
    /// deletes) go straight to STABLE, the rest stay SYNCED and owe a
    /// stabilize marker.
    fn replay_finish_entry(&mut self, ov: ObjVer, instant: bool) {
        if instant {
            self.mark_stable(ov);
        } else {
            let latest = self.unstable_writes.entry(ov.oid).or_insert(0);
            *latest = (*latest).max(ov.version);
        }
    }

    /// Verify a replayed small-write payload: whole-payload CRC when
    /// checksums are off, per-checksum-block CRCs otherwise
    fn verify_replayed_payload(
        &self,
        offset: u32,
        payload: &[u8],
        crc32_data: u32,
        dyn_data: &[u8],
    ) -> bool {
        if self.layout.csum_block_size == 0 {
            return verify_crc32c(payload, crc32_data);
        }
        let cbs = self.layout.csum_block_size;
        let len = payload.len() as u32;
        let bmp = self.layout.clean_entry_bitmap_size as usize;
        let first = offset / cbs;
        let last = (offset + len - 1) / cbs;
        for i in first..=last {
            let block_start = i * cbs;
            let block_end = block_start + cbs;
            let from = block_start.max(offset);
            let to = block_end.min(offset + len);
            let portion = &payload[(from - offset) as usize..(to - offset) as usize];
            let stored_at = bmp + ((i - first) * 4) as usize;
            let stored = u32::from_le_bytes(dyn_data[stored_at..stored_at + 4].try_into().unwrap());
            // Small-write checksums cover just the written portion
            if crc32c_pad(0, portion, 0, 0) != stored {
                return false;
            }
        }
        true
    }

    /// Load the whole ring into the in-memory mirror
    fn load_journal_mirror(&mut self) -> Result<()> {
        let jlen = self.journal.len as usize;
        let mut buf = vec![0u8; jlen];
        let mut off = 0usize;
        while off < jlen {
            let n = (jlen - off).min(INIT_CHUNK);
            self.ring.read_now(
                FileId::Journal,
                self.layout.journal_pos(off as u64),
                &mut buf[off..off + n],
            )?;
            off += n;
        }
        self.journal.mirror = Some(buf);
        Ok(())
    }
}
