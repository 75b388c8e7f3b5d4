//! Write and delete state machines
//!
//! Enqueue assigns the version, classifies the write (big/small/delete),
//! inherits the presence bitmap, computes checksums and inserts the
//! dirty entry. Submission reserves journal space, allocates blocks for
//! big writes, appends journal records and issues the data I/O. An
//! operation resumes from its state label whenever an I/O completes, a
//! sector is fsynced, space frees up or its predecessor advances.
//!
//! Version-restore: a write with a caller version lower than the next
//! expected one is accepted over a delete. It parks in WAIT_DEL under a
//! temporary high version until the delete is flushed, then re-keys to
//! the caller's version right before submission.

use crate::config::ImmediateCommit;
use crate::engine::{BlockStore, InternalAction, Op, OpKind, OpProgress, WaitFor};
use crate::index::{DirtyEntry, DynData, Stage, WriteKind};
use crate::journal::{JournalEntry, ENTRY_HEADER_SIZE};
use crate::ring::{FileId, IoTag, OpId, SubmitKind, TimerEvent};
use blockio_common::bitmap::fill_range;
use blockio_common::{compute_crc32c, crc32c_pad, Error, ObjVer};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

// Resume labels of the write state machine
pub(crate) const WS_QUEUED: u8 = 0;
/// Big write data submitted under IMMEDIATE_ALL; fsync + journal entry owed
pub(crate) const WS_BIG_DATA: u8 = 1;
/// Append the big write's journal entry now
pub(crate) const WS_BIG_JOURNAL: u8 = 2;
/// All I/O issued; waiting for completions
pub(crate) const WS_WAIT_IO: u8 = 3;
/// Completions arrived; transition the dirty entry and maybe throttle
pub(crate) const WS_ACK: u8 = 4;
/// Waiting out the throttling delay
pub(crate) const WS_THROTTLE: u8 = 5;
/// Acknowledge to the caller
pub(crate) const WS_DONE_ACK: u8 = 6;

impl BlockStore {
    /// Size of a big-write journal record, reserved with the full clean
    /// dynamic region as an upper bound
    fn big_entry_size(&self) -> usize {
        ENTRY_HEADER_SIZE + 40 + self.layout.clean_dyn_size as usize
    }

    fn small_entry_size(&self, dyn_size: u32) -> usize {
        ENTRY_HEADER_SIZE + 44 + dyn_size as usize
    }

    fn del_entry_size(&self) -> usize {
        ENTRY_HEADER_SIZE + 24
    }

    /// Version assignment and dirty entry creation. Returns false when
    /// the operation completed (or failed) at the boundary; `retval` is
    /// already set in that case.
    pub(crate) fn enqueue_write(&mut self, id: OpId) -> bool {
        let (kind, oid, req_version, offset) = {
            let slot = self.slot(id);
            (slot.kind, slot.oid, slot.version, slot.offset)
        };
        let is_del = kind == OpKind::Delete;
        if is_del {
            self.slot_mut(id).len = 0;
        }
        let len = self.slot(id).len;

        let bmp_size = self.layout.clean_entry_bitmap_size as usize;
        let dyn_size = self.layout.dirty_dyn_size(offset, len) as usize;
        let mut dyn_buf = vec![0u8; dyn_size];

        // Find the predecessor and the next version
        let mut version = 1u64;
        let mut deleted = false;
        let mut unsynced = false;
        let mut wait_del = false;
        let mut wait_big = false;
        if let Some((latest, entry)) = self.dirty.latest(oid) {
            version = latest.version + 1;
            deleted = entry.kind == WriteKind::Delete;
            unsynced = entry.stage < Stage::Synced;
            wait_del = entry.stage == Stage::WaitDel;
            wait_big = if entry.kind == WriteKind::Big {
                entry.stage < Stage::Synced
            } else {
                entry.stage == Stage::WaitBig
            };
            if !is_del && !deleted {
                dyn_buf[..bmp_size].copy_from_slice(entry.bitmap(bmp_size));
            }
        } else if let Some(clean) = self.clean.get(oid) {
            version = clean.version + 1;
            if !is_del {
                let block = clean.location / u64::from(self.layout.data_block_size);
                dyn_buf[..bmp_size].copy_from_slice(self.meta.presence(block));
            }
        } else {
            deleted = true;
        }

        if deleted && is_del {
            // Idempotent: already deleted (or never existed)
            self.slot_mut(id).retval = 0;
            return false;
        }

        self.slot_mut(id).real_version = 0;
        if req_version == 0 {
            self.slot_mut(id).version = version;
        } else if req_version < version {
            if deleted || wait_del {
                // Low version numbers are valid over deletes, but the
                // delete must reach the clean index first: the dirty
                // index orders by version
                debug!(
                    "write {} v{} over delete (temporary v{})",
                    oid, req_version, version
                );
                wait_del = true;
                let slot = self.slot_mut(id);
                slot.real_version = req_version;
                slot.version = version;
                let del_ov = ObjVer::new(oid, version - 1);
                if unsynced {
                    // The delete has not reached the journal yet: sync
                    // first, then flush it with priority
                    self.enqueue_internal(Op::sync(), InternalAction::UnshiftFlush(del_ov));
                } else {
                    self.flusher.unshift(del_ov);
                }
            } else {
                debug!(
                    "write {} v{} rejected, already have v{}",
                    oid,
                    req_version,
                    version - 1
                );
                self.slot_mut(id).retval = Error::VersionExists.to_retval();
                return false;
            }
        }
        let version = self.slot_mut(id).version;

        // Pre-sync: let a blocking big write (or the autosync threshold)
        // reach the journal before this one piles up behind it. The two
        // branches are mutually exclusive with the unsynced counter.
        let block_size = self.layout.data_block_size;
        let imm = if len < block_size {
            self.cfg.immediate_commit != ImmediateCommit::None
        } else {
            self.cfg.immediate_commit == ImmediateCommit::All
        };
        let small = !is_del && len < block_size && !deleted;
        if (wait_big && small && !imm)
            || (!imm
                && self.cfg.autosync_writes > 0
                && self.unsynced_queued_ops >= self.cfg.autosync_writes)
        {
            self.enqueue_internal(Op::sync(), InternalAction::None);
        } else if !imm {
            self.unsynced_queued_ops += 1;
        }

        // Classify and stage
        let (entry_kind, stage, instant) = if is_del {
            (WriteKind::Delete, Stage::InFlight, true)
        } else {
            let k = if len == block_size || deleted {
                WriteKind::Big
            } else {
                WriteKind::Small
            };
            let stage = if wait_del {
                Stage::WaitDel
            } else if k == WriteKind::Small && wait_big {
                Stage::WaitBig
            } else {
                Stage::InFlight
            };
            (k, stage, kind == OpKind::WriteStable)
        };

        if !is_del {
            if let Some(bitmap) = self.slot(id).bitmap.clone() {
                dyn_buf[..bmp_size].copy_from_slice(&bitmap);
            }
            if len > 0 {
                let gran = u64::from(self.layout.bitmap_granularity);
                let first = u64::from(offset) / gran;
                let last = (u64::from(offset) + u64::from(len)).div_ceil(gran);
                fill_range(&mut dyn_buf[..bmp_size], first, last);
            }
            if self.layout.csum_block_size != 0 && len > 0 {
                let data = self.slot(id).data.clone();
                self.fill_csums(
                    &mut dyn_buf[bmp_size..],
                    offset,
                    len,
                    &data,
                    entry_kind == WriteKind::Big,
                );
            }
            if entry_kind == WriteKind::Small && self.cfg.throttle.enabled {
                self.slot_mut(id).begin = Some(Instant::now());
            }
        }

        self.dirty.insert(
            ObjVer::new(oid, version),
            DirtyEntry {
                kind: entry_kind,
                stage,
                instant,
                offset: if is_del { 0 } else { offset },
                len: if is_del { 0 } else { len },
                location: 0,
                journal_sector: u64::MAX,
                dyn_data: DynData::from_vec(dyn_buf),
            },
        );
        true
    }

    /// Per-csum-block CRC32C over the write range. Big writes use padded
    /// semantics (the device pads partial granules with zeros); small
    /// writes checksum just the covered portion.
    fn fill_csums(&self, out: &mut [u8], offset: u32, len: u32, data: &[u8], padded: bool) {
        let cbs = self.layout.csum_block_size;
        let first = offset / cbs;
        let last = (offset + len - 1) / cbs;
        for i in first..=last {
            let block_start = i * cbs;
            let block_end = block_start + cbs;
            let from = block_start.max(offset);
            let to = block_end.min(offset + len);
            let portion = &data[(from - offset) as usize..(to - offset) as usize];
            let crc = if padded {
                crc32c_pad(
                    0,
                    portion,
                    (from - block_start) as usize,
                    (block_end - to) as usize,
                )
            } else {
                compute_crc32c(portion)
            };
            let slot = ((i - first) * 4) as usize;
            out[slot..slot + 4].copy_from_slice(&crc.to_le_bytes());
        }
    }

    /// Dispatch of a queued write
    pub(crate) fn dequeue_write(&mut self, id: OpId) -> OpProgress {
        if self.slot(id).state != WS_QUEUED {
            return self.continue_write(id);
        }
        if self.slot(id).real_version == u64::MAX {
            // Cancelled while queued; retval carries the cause
            self.finish_op(id);
            return OpProgress::Done;
        }
        let (oid, version) = {
            let slot = self.slot(id);
            (slot.oid, slot.version)
        };
        let mut ov = ObjVer::new(oid, version);
        match self.dirty.get(&ov) {
            Some(entry) if entry.stage < Stage::InFlight => return OpProgress::Parked,
            Some(_) => {}
            None => {
                // The dirty entry vanished (cancelled chain)
                self.slot_mut(id).retval = Error::VersionExists.to_retval();
                self.finish_op(id);
                return OpProgress::Done;
            }
        }

        // Restore the caller's version for writes that waited out a delete
        if self.slot(id).real_version != 0 {
            let real_version = self.slot(id).real_version;
            if let Some((prev, _)) = self.dirty.predecessor(&ov) {
                if prev.version >= real_version {
                    warn!(
                        "write {} v{} after delete conflicts with existing v{}",
                        oid, real_version, prev.version
                    );
                    self.cancel_all_writes(id, ov, &Error::VersionExists);
                    return OpProgress::Done;
                }
            }
            let entry = self.dirty.remove(&ov).expect("restored entry present");
            ov = ObjVer::new(oid, real_version);
            self.dirty.insert(ov, entry);
            let slot = self.slot_mut(id);
            slot.version = real_version;
            slot.real_version = 0;
            debug!("restored {} to caller version v{}", oid, real_version);
        }

        if self.write_iodepth >= self.cfg.max_write_iodepth {
            return OpProgress::Parked;
        }

        match self.dirty.get(&ov).map(|e| e.kind) {
            Some(WriteKind::Big) => self.submit_big(id, ov),
            Some(WriteKind::Small) => self.submit_small(id, ov),
            _ => unreachable!("write op over non-write dirty entry"),
        }
    }

    fn submit_big(&mut self, id: OpId, ov: ObjVer) -> OpProgress {
        let (offset, len, instant) = {
            let entry = self.dirty.get(&ov).unwrap();
            (entry.offset, entry.len, entry.instant)
        };

        // Reserve journal room for the deferred big-write records and the
        // stabilize entries that will follow
        let reserve = self.stabilize_reserve(if instant { 0 } else { 1 });
        if !self.journal.check_available(
            self.unsynced_big_write_count + 1,
            self.big_entry_size(),
            0,
            reserve,
        ) {
            self.flusher.request_trim();
            self.slot_mut(id).wait_for = WaitFor::Journal;
            return OpProgress::Parked;
        }

        let loc = match self.alloc.find_free() {
            Some(loc) => loc,
            None => {
                if self.flusher.queue_len() > 0 {
                    // Space frees up once the flusher collapses entries
                    self.flusher.request_trim();
                    self.slot_mut(id).wait_for = WaitFor::Free;
                    return OpProgress::Parked;
                }
                self.cancel_all_writes(id, ov, &Error::NoSpace);
                return OpProgress::Done;
            }
        };
        if self.meta.inmemory() && !self.meta.entry_is_zero(loc) {
            error!(
                "fatal: new write {} targets non-zero metadata entry {}",
                ov, loc
            );
            std::process::abort();
        }

        self.write_iodepth += 1;
        self.alloc.set(loc, true);
        let location = loc * u64::from(self.layout.data_block_size);
        {
            let entry = self.dirty.get_mut(&ov).unwrap();
            entry.location = location;
            entry.stage = Stage::Submitted;
        }
        debug!("allocated block {} for {}", loc, ov);

        if len > 0 {
            // Pad the partial head/tail to bitmap granularity with zeros
            let gran = self.layout.bitmap_granularity;
            let head = offset % gran;
            let tail = (gran - (offset + len) % gran) % gran;
            let mut buf = Vec::with_capacity((head + len + tail) as usize);
            buf.extend_from_slice(&self.zero_block[..head as usize]);
            buf.extend_from_slice(&self.slot(id).data.clone());
            buf.extend_from_slice(&self.zero_block[..tail as usize]);
            let write_off = self.layout.data_block_pos(loc) + u64::from(offset - head);
            self.ring.submit(
                FileId::Data,
                SubmitKind::Write {
                    offset: write_off,
                    data: buf,
                },
                IoTag::WriteData { op: id },
            );
            self.slot_mut(id).pending = 1;
        }

        if !instant {
            self.unstable_unsynced += 1;
        }
        if self.cfg.immediate_commit != ImmediateCommit::All {
            // The journal record is owed later, at sync time
            self.unsynced_big_write_count += 1;
            self.slot_mut(id).state = WS_WAIT_IO;
        } else {
            self.slot_mut(id).state = WS_BIG_DATA;
        }
        if self.slot(id).pending == 0 {
            return self.continue_write(id);
        }
        OpProgress::InProgress
    }

    fn submit_small(&mut self, id: OpId, ov: ObjVer) -> OpProgress {
        let (offset, len, instant) = {
            let entry = self.dirty.get(&ov).unwrap();
            (entry.offset, entry.len, entry.instant)
        };
        let dyn_size = self.layout.dirty_dyn_size(offset, len);
        let entry_size = self.small_entry_size(dyn_size);

        // Journal space: room for the owed big-write records, then this
        // record, its payload and the future stabilize entries
        let reserve = self.stabilize_reserve(if instant { 0 } else { 1 });
        let big_room = self.unsynced_big_write_count == 0
            || self
                .journal
                .check_available(self.unsynced_big_write_count, self.big_entry_size(), 0, 0);
        if !big_room
            || !self
                .journal
                .check_available(1, entry_size, u64::from(len), reserve)
        {
            self.flusher.request_trim();
            self.slot_mut(id).wait_for = WaitFor::Journal;
            return OpProgress::Parked;
        }

        self.write_iodepth += 1;

        // Predict where the record and its payload land
        let block_size = self.journal.block_size;
        let switching = !self.journal.entry_fits(entry_size);
        let prev_sector = self.journal.cur_sector;
        let mut predicted = self.journal.next_free;
        if switching {
            if predicted + block_size > self.journal.len {
                predicted = block_size;
            }
            predicted += block_size;
        }
        let mut data_offset = predicted;
        if len > 0 && data_offset + u64::from(len) > self.journal.len {
            data_offset = block_size;
        }

        let payload = self.slot(id).data.clone();
        let crc32_data = if self.layout.csum_block_size != 0 || len == 0 {
            0
        } else {
            compute_crc32c(&payload)
        };
        let record = JournalEntry::SmallWrite {
            oid: ov.oid,
            version: ov.version,
            offset,
            len,
            data_offset,
            crc32_data,
            instant,
            dyn_data: self.dirty.get(&ov).unwrap().dyn_data.clone(),
        };
        let sector_off = self.journal.append_entry(&record);
        self.journal.ref_sector(sector_off);
        {
            let entry = self.dirty.get_mut(&ov).unwrap();
            entry.journal_sector = sector_off;
            entry.location = data_offset;
            entry.stage = Stage::Submitted;
        }

        // A full previous sector is written out as soon as we leave it
        if switching && self.cfg.immediate_commit == ImmediateCommit::None {
            self.submit_sector_write(prev_sector, Some(id));
        }

        if len > 0 {
            let got = self.journal.alloc_ring(u64::from(len));
            debug_assert_eq!(got, data_offset);
            self.journal.mirror_write(data_offset, &payload);
            let pos = self.layout.journal_pos(data_offset);
            self.ring.submit(
                FileId::Journal,
                SubmitKind::Write {
                    offset: pos,
                    data: payload.to_vec(),
                },
                IoTag::JournalData { op: id },
            );
            self.journal.data_pending += 1;
            self.slot_mut(id).pending += 1;
        }

        if self.cfg.immediate_commit != ImmediateCommit::None {
            let cur = self.journal.cur_sector;
            self.submit_sector_write(cur, Some(id));
        }

        if !instant {
            self.unstable_unsynced += 1;
        }
        self.slot_mut(id).state = WS_WAIT_IO;
        if self.slot(id).pending == 0 {
            return self.continue_write(id);
        }
        OpProgress::InProgress
    }

    /// Dispatch of a queued delete
    pub(crate) fn dequeue_del(&mut self, id: OpId) -> OpProgress {
        if self.slot(id).state != WS_QUEUED {
            return self.continue_write(id);
        }
        let ov = {
            let slot = self.slot(id);
            ObjVer::new(slot.oid, slot.version)
        };
        match self.dirty.get(&ov) {
            Some(entry) if entry.stage < Stage::InFlight => return OpProgress::Parked,
            Some(_) => {}
            None => {
                self.slot_mut(id).retval = Error::VersionExists.to_retval();
                self.finish_op(id);
                return OpProgress::Done;
            }
        }
        if !self
            .journal
            .check_available(1, self.del_entry_size(), 0, self.stabilize_reserve(0))
        {
            self.flusher.request_trim();
            self.slot_mut(id).wait_for = WaitFor::Journal;
            return OpProgress::Parked;
        }
        if self.write_iodepth >= self.cfg.max_write_iodepth {
            return OpProgress::Parked;
        }
        self.write_iodepth += 1;

        let switching = !self.journal.entry_fits(self.del_entry_size());
        let prev_sector = self.journal.cur_sector;
        let record = JournalEntry::Delete {
            oid: ov.oid,
            version: ov.version,
        };
        let sector_off = self.journal.append_entry(&record);
        self.journal.ref_sector(sector_off);
        {
            let entry = self.dirty.get_mut(&ov).unwrap();
            entry.journal_sector = sector_off;
            entry.stage = Stage::Submitted;
        }
        if switching && self.cfg.immediate_commit == ImmediateCommit::None {
            self.submit_sector_write(prev_sector, Some(id));
        }
        if self.cfg.immediate_commit != ImmediateCommit::None {
            let cur = self.journal.cur_sector;
            self.submit_sector_write(cur, Some(id));
        }
        self.slot_mut(id).state = WS_WAIT_IO;
        if self.slot(id).pending == 0 {
            return self.continue_write(id);
        }
        OpProgress::InProgress
    }

    /// Resume a write/delete from its state label
    pub(crate) fn continue_write(&mut self, id: OpId) -> OpProgress {
        loop {
            match self.slot(id).state {
                WS_BIG_DATA => {
                    if self.slot(id).pending > 0 {
                        return OpProgress::InProgress;
                    }
                    if !self.cfg.disable_data_fsync && !self.slot(id).data_fsynced {
                        self.slot_mut(id).pending = 1;
                        self.ring
                            .submit(FileId::Data, SubmitKind::Fsync, IoTag::DataFsync { op: id });
                        return OpProgress::InProgress;
                    }
                    self.slot_mut(id).state = WS_BIG_JOURNAL;
                }
                WS_BIG_JOURNAL => match self.submit_big_journal_record(id) {
                    OpProgress::InProgress => return OpProgress::InProgress,
                    other => return other,
                },
                WS_WAIT_IO => {
                    if self.slot(id).pending > 0 {
                        return OpProgress::InProgress;
                    }
                    self.slot_mut(id).state = WS_ACK;
                }
                WS_ACK => match self.ack_write(id) {
                    Some(progress) => return progress,
                    None => continue,
                },
                WS_THROTTLE => return OpProgress::InProgress,
                WS_DONE_ACK => {
                    let len = self.slot(id).len;
                    let slot = self.slot_mut(id);
                    slot.retval = i64::from(len);
                    self.write_iodepth -= 1;
                    self.finish_op(id);
                    return OpProgress::Done;
                }
                other => {
                    debug_assert!(other == WS_QUEUED, "bad write state {}", other);
                    return OpProgress::InProgress;
                }
            }
        }
    }

    /// Immediate-commit-ALL path: the big write's journal record follows
    /// the data write instead of waiting for a sync
    fn submit_big_journal_record(&mut self, id: OpId) -> OpProgress {
        let ov = {
            let slot = self.slot(id);
            ObjVer::new(slot.oid, slot.version)
        };
        let (offset, len, instant, location, dyn_data) = {
            let entry = self.dirty.get(&ov).unwrap();
            (
                entry.offset,
                entry.len,
                entry.instant,
                entry.location,
                entry.dyn_data.clone(),
            )
        };
        let dyn_size = self.layout.dirty_dyn_size(offset, len) as usize;
        let reserve = self.stabilize_reserve(if instant { 0 } else { 1 });
        if !self
            .journal
            .check_available(1, ENTRY_HEADER_SIZE + 40 + dyn_size, 0, reserve)
        {
            self.flusher.request_trim();
            self.slot_mut(id).wait_for = WaitFor::Journal;
            return OpProgress::Parked;
        }
        let record = JournalEntry::BigWrite {
            oid: ov.oid,
            version: ov.version,
            offset,
            len,
            location,
            instant,
            dyn_data,
        };
        let sector_off = self.journal.append_entry(&record);
        self.journal.ref_sector(sector_off);
        self.dirty.get_mut(&ov).unwrap().journal_sector = sector_off;
        let cur = self.journal.cur_sector;
        self.submit_sector_write(cur, Some(id));
        self.slot_mut(id).state = WS_WAIT_IO;
        if self.slot(id).pending == 0 {
            return self.continue_write(id);
        }
        OpProgress::InProgress
    }

    /// The ack stage: move the dirty entry forward, apply throttling,
    /// then complete. Returns None to loop back into `continue_write`.
    fn ack_write(&mut self, id: OpId) -> Option<OpProgress> {
        let ov = {
            let slot = self.slot(id);
            ObjVer::new(slot.oid, slot.version)
        };
        let (is_big, len) = {
            let entry = self.dirty.get(&ov).expect("acked entry present");
            (entry.kind == WriteKind::Big, entry.len)
        };
        let imm = if is_big {
            self.cfg.immediate_commit == ImmediateCommit::All
        } else {
            self.cfg.immediate_commit != ImmediateCommit::None
        };
        if imm {
            self.mark_synced(ov);
        } else {
            self.dirty.get_mut(&ov).unwrap().stage = Stage::Written;
            if is_big {
                self.unsynced_big_writes.push(ov);
            } else {
                self.unsynced_small_writes.push(ov);
            }
        }

        // Pace journaled writes so the journal does not fill faster than
        // the flusher can drain it
        if !is_big && self.cfg.throttle.enabled {
            if let Some(begin) = self.slot(id).begin {
                let exec_us = begin.elapsed().as_micros() as u64;
                let t = &self.cfg.throttle;
                let depth = u64::from(self.write_iodepth.max(1));
                let scale = if depth <= t.target_parallelism {
                    100
                } else {
                    100 * depth / t.target_parallelism
                };
                let mut ref_us = scale
                    * (1_000_000 / t.target_iops
                        + u64::from(len) * 1_000_000 / t.target_mbs / 1024 / 1024)
                    / 100;
                ref_us -= ref_us * self.journal.free_bytes() / self.journal.len;
                if ref_us > exec_us + t.threshold_us {
                    self.slot_mut(id).state = WS_THROTTLE;
                    self.ring.set_timer(
                        Duration::from_micros(ref_us - exec_us),
                        TimerEvent::ThrottleDone(id),
                    );
                    return Some(OpProgress::InProgress);
                }
            }
        }
        self.slot_mut(id).state = WS_DONE_ACK;
        None
    }

    /// Fail `id` and every write queued behind it for the same object
    pub(crate) fn cancel_all_writes(&mut self, id: OpId, from: ObjVer, err: &Error) {
        // Drop the version chain from the failing version on
        let keys: Vec<ObjVer> = self
            .dirty
            .versions_of(from.oid)
            .filter(|(k, _)| k.version >= from.version)
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            match self.dirty.get(&key).map(|e| e.stage) {
                Some(stage) if stage >= Stage::Submitted => {
                    // An already-submitted successor cannot be unwound
                    warn!("leaving submitted entry {} during cancel", key);
                }
                Some(_) => {
                    self.dirty.remove(&key);
                }
                None => {}
            }
        }
        // Cancel queued writes behind this one
        let retval = err.to_retval();
        let mut found = false;
        let queue: Vec<OpId> = self.submit_queue.iter().copied().collect();
        for other in queue {
            if other == id {
                found = true;
            } else if found {
                if self.ops[other].is_none() {
                    continue;
                }
                let slot = self.slot(other);
                if slot.oid == from.oid
                    && matches!(slot.kind, OpKind::Write | OpKind::WriteStable)
                {
                    let slot = self.slot_mut(other);
                    slot.real_version = u64::MAX;
                    slot.retval = retval;
                }
            }
        }
        self.slot_mut(id).retval = retval;
        self.finish_op(id);
    }

    /// ROLLBACK: discard synced-but-unstable versions above the target.
    /// Stable or still-in-flight versions cannot be rolled back.
    pub(crate) fn dequeue_rollback(&mut self, id: OpId) -> OpProgress {
        if self.slot(id).state != WS_QUEUED {
            if self.slot(id).pending > 0 {
                return OpProgress::InProgress;
            }
            self.slot_mut(id).retval = 0;
            self.finish_op(id);
            return OpProgress::Done;
        }
        let (oid, version) = {
            let slot = self.slot(id);
            (slot.oid, slot.version)
        };
        let doomed: Vec<ObjVer> = self
            .dirty
            .versions_of(oid)
            .filter(|(k, _)| k.version > version)
            .map(|(k, _)| *k)
            .collect();
        if doomed.is_empty() {
            self.slot_mut(id).retval = 0;
            self.finish_op(id);
            return OpProgress::Done;
        }
        if doomed
            .iter()
            .any(|k| self.dirty.get(k).map(|e| e.stage) != Some(Stage::Synced))
        {
            self.fail_op(id, &Error::invalid_argument("version not rollbackable"));
            return OpProgress::Done;
        }
        if !self
            .journal
            .check_available(1, ENTRY_HEADER_SIZE + 24, 0, 0)
        {
            self.flusher.request_trim();
            self.slot_mut(id).wait_for = WaitFor::Journal;
            return OpProgress::Parked;
        }

        let block_size = u64::from(self.layout.data_block_size);
        for key in &doomed {
            if let Some(entry) = self.dirty.remove(key) {
                if entry.journalled() {
                    self.journal.unref_sector(entry.journal_sector);
                }
                if entry.kind == WriteKind::Big {
                    self.alloc.set(entry.location / block_size, false);
                }
            }
        }
        // Recompute the unstable high-water mark for this object
        let remaining = self
            .dirty
            .versions_of(oid)
            .filter(|(_, e)| e.stage == Stage::Synced)
            .map(|(k, _)| k.version)
            .max();
        match remaining {
            Some(v) => {
                self.unstable_writes.insert(oid, v);
            }
            None => {
                self.unstable_writes.remove(&oid);
            }
        }

        let record = JournalEntry::Rollback { oid, version };
        self.journal.append_entry(&record);
        self.slot_mut(id).state = WS_WAIT_IO;
        if self.cfg.immediate_commit != ImmediateCommit::None {
            let cur = self.journal.cur_sector;
            self.submit_sector_write(cur, Some(id));
        }
        if self.slot(id).pending == 0 {
            self.slot_mut(id).retval = 0;
            self.finish_op(id);
            return OpProgress::Done;
        }
        OpProgress::InProgress
    }

    /// Promote same-object writes parked behind a delete once the delete
    /// has been flushed (called by the flusher)
    pub(crate) fn unblock_wait_del(&mut self, ov: ObjVer) {
        let keys: Vec<ObjVer> = self
            .dirty
            .versions_of(ov.oid)
            .filter(|(_, e)| e.stage == Stage::WaitDel)
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            if let Some(entry) = self.dirty.get_mut(&key) {
                entry.stage = Stage::InFlight;
            }
        }
        self.ring.wakeup();
    }
}
