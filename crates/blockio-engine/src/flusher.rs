//! The flusher
//!
//! Moves stable dirty entries into the permanent area: composes data
//! blocks from journaled small writes, rewrites metadata entries, frees
//! superseded blocks, applies deletes, and reclaims journal space by
//! advancing `used_start` past unreferenced sectors. Multiple versions
//! of one object collapse into a single metadata rewrite.
//!
//! The flusher runs inside the cooperative loop; its I/O goes straight
//! through the ring's files within one loop step, so every flush is
//! ordered data-then-metadata-then-trim. An allocator- or journal-
//! exhausted submission path calls [`Flusher::request_trim`] to force a
//! wave; the version-restore path uses [`Flusher::unshift`] to flush one
//! specific delete with priority.

use crate::engine::BlockStore;
use crate::index::{CleanEntry, Stage, WriteKind};
use crate::journal::JournalEntry;
use crate::ring::FileId;
use blockio_common::{compute_crc32c, ObjVer, Result};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, error, info, warn};

/// Flush queue and trim state
pub struct Flusher {
    queue: VecDeque<ObjVer>,
    queued: HashSet<ObjVer>,
    trim_wanted: bool,
}

impl Default for Flusher {
    fn default() -> Self {
        Self::new()
    }
}

impl Flusher {
    /// Create an empty flusher
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            queued: HashSet::new(),
            trim_wanted: false,
        }
    }

    /// Queue a stable version for flushing
    pub fn enqueue(&mut self, ov: ObjVer) {
        if self.queued.insert(ov) {
            self.queue.push_back(ov);
        }
    }

    /// Put a specific version at the head of the queue
    pub fn unshift(&mut self, ov: ObjVer) {
        if self.queued.insert(ov) {
            self.queue.push_front(ov);
        } else if self.queue.front() != Some(&ov) {
            self.queue.retain(|v| v != &ov);
            self.queue.push_front(ov);
        }
    }

    /// Force a flush-and-trim wave (allocator or journal exhausted)
    pub fn request_trim(&mut self) {
        self.trim_wanted = true;
    }

    pub(crate) fn take_trim_wanted(&mut self) -> bool {
        std::mem::take(&mut self.trim_wanted)
    }

    pub(crate) fn pop(&mut self) -> Option<ObjVer> {
        let ov = self.queue.pop_front()?;
        self.queued.remove(&ov);
        Some(ov)
    }

    /// Stable entries waiting to be flushed
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

fn must<T>(result: Result<T>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => {
            // Same fail-stop policy as the ring: a failed flush write
            // leaves disk state inconsistent with memory
            error!("fatal flusher I/O error: {}", e);
            std::process::abort();
        }
    }
}

impl BlockStore {
    /// Run the flusher until its queue drains, then reclaim journal
    /// space. Returns whether anything happened.
    pub(crate) fn flusher_run(&mut self) -> bool {
        if self.cfg.read_only {
            return false;
        }
        let mut progress = false;
        // Bounded pass: a flush that re-queues itself (e.g. waiting for
        // a free block) runs again next iteration, not in a tight loop
        let mut budget = self.flusher.queue_len();
        while budget > 0 {
            budget -= 1;
            let Some(ov) = self.flusher.pop() else { break };
            if self.flush_object(ov) {
                progress = true;
            }
        }
        if (progress || self.flusher.take_trim_wanted()) && self.journal_trim() {
            progress = true;
        }
        progress
    }

    /// Collapse and flush every stable version of `ov.oid` up to
    /// `ov.version`. Returns false when there is nothing to do yet.
    fn flush_object(&mut self, ov: ObjVer) -> bool {
        let versions: Vec<ObjVer> = self
            .dirty
            .versions_of(ov.oid)
            .filter(|(k, _)| k.version <= ov.version)
            .map(|(k, _)| *k)
            .collect();
        if versions.is_empty() {
            return false;
        }
        if versions
            .iter()
            .any(|k| self.dirty.get(k).map(|e| e.stage) != Some(Stage::Stable))
        {
            // A lower version is not stable yet; this target comes back
            // once it stabilizes
            return false;
        }

        let newest = *versions.last().unwrap();
        let already_flushed = self
            .clean
            .get(ov.oid)
            .map(|c| c.version >= newest.version)
            .unwrap_or(false);
        let is_delete = self.dirty.get(&newest).map(|e| e.kind) == Some(WriteKind::Delete);
        if already_flushed {
            // Replayed entries the clean index already covers (journal
            // was not trimmed past them); free stray big-write blocks
            let block_size = u64::from(self.layout.data_block_size);
            let clean_block = self.clean.get(ov.oid).unwrap().location / block_size;
            for key in &versions {
                if let Some(entry) = self.dirty.get(key) {
                    if entry.kind == WriteKind::Big {
                        let block = entry.location / block_size;
                        if block != clean_block && self.alloc.get(block) {
                            self.alloc.set(block, false);
                        }
                    }
                }
            }
        } else if is_delete {
            self.flush_delete(&versions, newest);
        } else {
            self.flush_write(&versions, newest);
        }

        // Release journal references and drop the flushed chain
        for key in &versions {
            if let Some(entry) = self.dirty.remove(key) {
                if entry.journalled() {
                    self.journal.unref_sector(entry.journal_sector);
                }
            }
        }
        self.ring.wakeup();
        true
    }

    fn flush_delete(&mut self, versions: &[ObjVer], target: ObjVer) {
        debug!("flushing delete {}", target);
        let block_size = u64::from(self.layout.data_block_size);
        if let Some(clean) = self.clean.get(target.oid) {
            let block = clean.location / block_size;
            self.write_meta_entry(block, None);
            self.fsync_meta();
            self.clean.remove(target.oid);
            self.meta.clear_dyn(block);
            self.alloc.set(block, false);
        }
        // Big writes that never became clean still own their blocks
        for key in versions {
            if let Some(entry) = self.dirty.get(key) {
                if entry.kind == WriteKind::Big {
                    let block = entry.location / block_size;
                    if self.alloc.get(block) {
                        self.alloc.set(block, false);
                    }
                }
            }
        }
        self.unblock_wait_del(target);
    }

    fn flush_write(&mut self, versions: &[ObjVer], target: ObjVer) {
        let block_size = u64::from(self.layout.data_block_size);
        let old_clean = self.clean.get(target.oid);

        // The newest big write (if any) carries the data block; smalls
        // after it overlay, smalls before it are superseded
        let last_big = versions
            .iter()
            .rev()
            .find(|k| self.dirty.get(k).map(|e| e.kind) == Some(WriteKind::Big))
            .copied();
        let big_version = last_big.map(|k| k.version).unwrap_or(0);
        let smalls_after: Vec<ObjVer> = versions
            .iter()
            .filter(|k| {
                k.version > big_version
                    && self
                        .dirty
                        .get(k)
                        .map(|e| e.kind == WriteKind::Small && e.len > 0)
                        .unwrap_or(false)
            })
            .copied()
            .collect();

        let target_block = if let Some(big) = last_big {
            self.dirty.get(&big).unwrap().location / block_size
        } else if let Some(clean) = old_clean {
            clean.location / block_size
        } else {
            // Object born from small writes alone: allocate its block now
            match self.alloc.find_free() {
                Some(block) => {
                    if self.meta.inmemory() && !self.meta.entry_is_zero(block) {
                        error!(
                            "fatal: flush of {} targets non-zero metadata entry {}",
                            target, block
                        );
                        std::process::abort();
                    }
                    self.alloc.set(block, true);
                    block
                }
                None => {
                    warn!("flush of {} delayed: no free data blocks", target);
                    self.flusher.enqueue(target);
                    return;
                }
            }
        };

        // Final presence bitmap is cumulative in the newest entry
        let bmp_size = self.layout.clean_entry_bitmap_size as usize;
        let newest_entry = self.dirty.get(&target).unwrap();
        let presence: Vec<u8> = newest_entry.bitmap(bmp_size).to_vec();
        let mut csums = vec![0u8; (self.layout.csum_count() * 4) as usize];

        let mut wrote_data = false;
        if !smalls_after.is_empty() {
            // Compose the full block: base content, zeros where nothing
            // was ever written, then the journaled overlays
            let mut buf = vec![0u8; block_size as usize];
            let base = last_big
                .map(|k| self.dirty.get(&k).unwrap().location)
                .or(old_clean.map(|c| c.location));
            if let Some(base_loc) = base {
                must(self.ring.read_now(
                    FileId::Data,
                    self.layout.data_offset + base_loc,
                    &mut buf,
                ));
            }
            self.zero_unwritten(&mut buf, &presence);
            for key in &smalls_after {
                let entry = self.dirty.get(key).unwrap();
                let (off, len, loc) = (entry.offset as usize, entry.len as usize, entry.location);
                if len == 0 {
                    continue;
                }
                if let Some(payload) = self.journal.mirror_read(loc, len) {
                    buf[off..off + len].copy_from_slice(payload);
                } else {
                    let mut payload = vec![0u8; len];
                    must(self.ring.read_now(
                        FileId::Journal,
                        self.layout.journal_pos(loc),
                        &mut payload,
                    ));
                    buf[off..off + len].copy_from_slice(&payload);
                }
            }
            if self.layout.csum_block_size != 0 {
                let cbs = self.layout.csum_block_size as usize;
                for (i, chunk) in buf.chunks(cbs).enumerate() {
                    let crc = compute_crc32c(chunk);
                    csums[i * 4..i * 4 + 4].copy_from_slice(&crc.to_le_bytes());
                }
            }
            must(self.ring.write_now(
                FileId::Data,
                self.layout.data_block_pos(target_block),
                &buf,
            ));
            wrote_data = true;
        } else if let Some(big) = last_big {
            // Data already in place; only carry the big write's checksums
            if self.layout.csum_block_size != 0 {
                let entry = self.dirty.get(&big).unwrap();
                let cbs = self.layout.csum_block_size;
                let first = (entry.offset / cbs) as usize;
                let entry_csums = entry.csums(bmp_size);
                csums[first * 4..first * 4 + entry_csums.len()].copy_from_slice(entry_csums);
            }
        } else if self.layout.csum_block_size != 0 {
            // Bitmap-only update over the clean block keeps its checksums
            if let Some(clean) = old_clean {
                let block = clean.location / block_size;
                csums.copy_from_slice(self.meta.csums(block));
            }
        }

        // Metadata rewrite: new entry at the target block, old entry
        // zeroed if the object moved
        let mut dyn_data = Vec::with_capacity(self.layout.clean_dyn_size as usize);
        dyn_data.extend_from_slice(&presence);
        dyn_data.extend_from_slice(&presence); // external bitmap mirrors presence
        dyn_data.extend_from_slice(&csums);
        let entry_bytes = self.meta.encode_entry(target.oid, target.version, &dyn_data);
        self.write_meta_entry(target_block, Some(&entry_bytes));
        let old_block = old_clean.map(|c| c.location / block_size);
        if let Some(old) = old_block {
            if old != target_block {
                self.write_meta_entry(old, None);
            }
        }
        if wrote_data && !self.cfg.disable_data_fsync {
            must(self.ring.fsync_now(FileId::Data));
        }
        self.fsync_meta();

        // Indices and block ownership
        self.clean.insert(
            target.oid,
            CleanEntry {
                version: target.version,
                location: target_block * block_size,
            },
        );
        self.meta.set_dyn(target_block, &dyn_data);
        if let Some(old) = old_block {
            if old != target_block {
                self.alloc.set(old, false);
                self.meta.clear_dyn(old);
            }
        }
        // Superseded big writes give their blocks back
        for key in versions {
            if Some(*key) == last_big {
                continue;
            }
            if let Some(entry) = self.dirty.get(key) {
                if entry.kind == WriteKind::Big {
                    let block = entry.location / block_size;
                    if block != target_block && Some(block) != old_block {
                        self.alloc.set(block, false);
                    }
                }
            }
        }
        debug!("flushed {} into block {}", target, target_block);
    }

    fn zero_unwritten(&self, buf: &mut [u8], presence: &[u8]) {
        let gran = self.layout.bitmap_granularity as usize;
        let bits = (self.layout.data_block_size / self.layout.bitmap_granularity) as u64;
        for bit in 0..bits {
            if !blockio_common::bitmap::bit_test(presence, bit) {
                let start = bit as usize * gran;
                buf[start..start + gran].fill(0);
            }
        }
    }

    /// Rewrite one clean entry record (or zero it) and write its
    /// metadata block out
    pub(crate) fn write_meta_entry(&mut self, block: u64, entry_bytes: Option<&[u8]>) {
        let pos = self.layout.meta_block_pos(block);
        let image = if self.meta.inmemory() {
            self.meta
                .mirror_patch(block, entry_bytes)
                .expect("metadata mirror present")
        } else {
            let mut buf = vec![0u8; self.layout.meta_block_size as usize];
            must(self.ring.read_now(FileId::Meta, pos, &mut buf));
            self.meta.patch_block_buf(&mut buf, block, entry_bytes);
            buf
        };
        must(self.ring.write_now(FileId::Meta, pos, &image));
    }

    fn fsync_meta(&mut self) {
        if !self.cfg.disable_journal_fsync {
            must(self.ring.fsync_now(FileId::Meta));
        }
    }

    /// Advance `used_start` past fully flushed sectors and persist the
    /// new replay position in the START block
    pub(crate) fn journal_trim(&mut self) -> bool {
        // A fully flushed current sector would pin `used_start` (and the
        // payload bytes allocated after it) forever; abandon it so the
        // next entry starts a fresh sector and the region reclaims
        {
            let journal = &mut self.journal;
            let cur = &mut journal.sectors[journal.cur_sector];
            if cur.offset != u64::MAX
                && !cur.dirty
                && cur.flush_count == 0
                && !journal.used_sectors.contains_key(&cur.offset)
            {
                cur.offset = u64::MAX;
                journal.in_sector_pos = journal.block_size as usize;
            }
        }
        let new_start = self.journal.trim_pos();
        if new_start == self.journal.used_start {
            return false;
        }
        info!(
            "journal trim: used_start {:#x} -> {:#x}",
            self.journal.used_start, new_start
        );
        self.journal.used_start = new_start;
        // When the trim target is a fresh allocation point (no live
        // sector there), zero it: replay checks the chain CRC only from
        // the second entry on, so stale bytes of a previous ring lap
        // must not be parseable at the start position.
        if self.journal.used_sectors.is_empty() {
            let cur = &self.journal.sectors[self.journal.cur_sector];
            if cur.offset == u64::MAX || new_start != cur.offset {
                let n = (self.journal.len - new_start).min(self.journal.block_size) as usize;
                let zeros = vec![0u8; n];
                must(self
                    .ring
                    .write_now(FileId::Journal, self.layout.journal_pos(new_start), &zeros));
                if let Some(mirror) = self.journal.mirror.as_mut() {
                    mirror[new_start as usize..new_start as usize + n].fill(0);
                }
            }
        }
        let start = JournalEntry::Start {
            journal_start: new_start,
        };
        let (bytes, _) = start.serialize(0);
        let mut block = vec![0u8; self.journal.block_size as usize];
        block[..bytes.len()].copy_from_slice(&bytes);
        must(self
            .ring
            .write_now(FileId::Journal, self.layout.journal_pos(0), &block));
        if !self.cfg.disable_journal_fsync {
            must(self.ring.fsync_now(FileId::Journal));
        }
        self.ring.wakeup();
        true
    }
}
