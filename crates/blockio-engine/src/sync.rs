//! The sync engine
//!
//! A SYNC makes every completed write durable and stable. The machine:
//!
//! 1. fsync the data device if unsynced big writes exist
//! 2. append the deferred BIG_WRITE journal records owed by them
//! 3. write out dirty journal sectors and fsync the journal; everything
//!    WRITTEN becomes SYNCED (INSTANT entries continue to STABLE)
//! 4. append STABLE records for every synced-but-unstable entry
//! 5. write + fsync again, then promote the batch to STABLE
//!
//! At most one SYNC is in flight; stabilize markers merge across the
//! batch. Writes parked in WAIT_BIG/WAIT_DEL are not covered; they leave
//! that state first and a later sync picks them up.

use crate::config::ImmediateCommit;
use crate::engine::{BlockStore, OpProgress, WaitFor};
use crate::index::Stage;
use crate::journal::{JournalEntry, ENTRY_HEADER_SIZE};
use crate::ring::{FileId, IoTag, OpId, SubmitKind};
use blockio_common::ObjVer;
use tracing::debug;

// Resume labels of the sync state machine
const SY_BEGIN: u8 = 0;
const SY_DATA_FSYNC: u8 = 11;
const SY_BIG_RECORDS: u8 = 12;
const SY_SECTOR_WAIT: u8 = 13;
const SY_FSYNC_WAIT: u8 = 14;
const SY_MARK: u8 = 15;
const SY_STAB_RECORDS: u8 = 16;
const SY_STAB_SECTOR_WAIT: u8 = 17;
const SY_STAB_FSYNC_WAIT: u8 = 18;
const SY_PROMOTE: u8 = 19;

impl BlockStore {
    /// Drive a SYNC operation from its current state
    pub(crate) fn continue_sync(&mut self, id: OpId) -> OpProgress {
        loop {
            match self.slot(id).state {
                SY_BEGIN => {
                    match self.cur_sync {
                        Some(active) if active != id => return OpProgress::Parked,
                        _ => self.cur_sync = Some(id),
                    }
                    if self.dirty.has_submitted() {
                        // Preceding writes still have I/O in flight
                        self.slot_mut(id).wait_for = WaitFor::InFlight;
                        return OpProgress::Parked;
                    }
                    let big = std::mem::take(&mut self.unsynced_big_writes);
                    let small = std::mem::take(&mut self.unsynced_small_writes);
                    let nothing_synced_unstable = self.unstable_writes.is_empty()
                        && !self.dirty.iter().any(|(_, e)| e.stage == Stage::Synced);
                    if big.is_empty() && small.is_empty() && nothing_synced_unstable {
                        self.cur_sync = None;
                        self.unsynced_queued_ops = 0;
                        self.slot_mut(id).retval = 0;
                        self.finish_op(id);
                        return OpProgress::Done;
                    }
                    let need_data_fsync = !big.is_empty()
                        && !self.cfg.disable_data_fsync
                        && self.cfg.immediate_commit != ImmediateCommit::All;
                    {
                        let slot = self.slot_mut(id);
                        slot.sync_big = big;
                        slot.sync_small = small;
                    }
                    if need_data_fsync {
                        self.slot_mut(id).pending = 1;
                        self.ring.submit(
                            FileId::Data,
                            SubmitKind::Fsync,
                            IoTag::SyncDataFsync { op: id },
                        );
                        self.slot_mut(id).state = SY_DATA_FSYNC;
                        return OpProgress::InProgress;
                    }
                    self.slot_mut(id).state = SY_BIG_RECORDS;
                }
                SY_DATA_FSYNC => {
                    if self.slot(id).pending > 0 {
                        return OpProgress::InProgress;
                    }
                    self.slot_mut(id).state = SY_BIG_RECORDS;
                }
                SY_BIG_RECORDS => {
                    let owed: Vec<ObjVer> = self
                        .slot(id)
                        .sync_big
                        .iter()
                        .copied()
                        .filter(|ov| {
                            self.dirty
                                .get(ov)
                                .map(|e| !e.journalled())
                                .unwrap_or(false)
                        })
                        .collect();
                    if !owed.is_empty() {
                        let entry_size =
                            ENTRY_HEADER_SIZE + 40 + self.layout.clean_dyn_size as usize;
                        if !self
                            .journal
                            .check_available(owed.len() as u64, entry_size, 0, 0)
                        {
                            self.flusher.request_trim();
                            self.slot_mut(id).wait_for = WaitFor::Journal;
                            return OpProgress::Parked;
                        }
                        for ov in owed {
                            let entry = self.dirty.get(&ov).unwrap();
                            let record = JournalEntry::BigWrite {
                                oid: ov.oid,
                                version: ov.version,
                                offset: entry.offset,
                                len: entry.len,
                                location: entry.location,
                                instant: entry.instant,
                                dyn_data: entry.dyn_data.clone(),
                            };
                            let sector_off = self.journal.append_entry(&record);
                            self.journal.ref_sector(sector_off);
                            self.dirty.get_mut(&ov).unwrap().journal_sector = sector_off;
                            self.unsynced_big_write_count =
                                self.unsynced_big_write_count.saturating_sub(1);
                        }
                    }
                    self.submit_all_dirty_sectors(Some(id));
                    self.slot_mut(id).state = SY_SECTOR_WAIT;
                }
                SY_SECTOR_WAIT => {
                    if self.slot(id).pending > 0 {
                        return OpProgress::InProgress;
                    }
                    if !self.cfg.disable_journal_fsync {
                        self.slot_mut(id).pending = 1;
                        self.ring.submit(
                            FileId::Journal,
                            SubmitKind::Fsync,
                            IoTag::SyncJournalFsync { op: id },
                        );
                        self.slot_mut(id).state = SY_FSYNC_WAIT;
                        return OpProgress::InProgress;
                    }
                    self.slot_mut(id).state = SY_MARK;
                }
                SY_FSYNC_WAIT => {
                    if self.slot(id).pending > 0 {
                        return OpProgress::InProgress;
                    }
                    self.slot_mut(id).state = SY_MARK;
                }
                SY_MARK => {
                    let batch: Vec<ObjVer> = self
                        .slot(id)
                        .sync_big
                        .iter()
                        .chain(self.slot(id).sync_small.iter())
                        .copied()
                        .collect();
                    for ov in batch {
                        self.mark_synced(ov);
                    }
                    // Everything synced but unstable joins the stabilize
                    // batch, including leftovers of earlier syncs
                    let stab: Vec<ObjVer> = self
                        .dirty
                        .iter()
                        .filter(|(_, e)| e.stage == Stage::Synced)
                        .map(|(k, _)| *k)
                        .collect();
                    debug!("sync stabilizing {} entries", stab.len());
                    self.slot_mut(id).sync_stab = stab;
                    if self.slot(id).sync_stab.is_empty() {
                        self.slot_mut(id).state = SY_PROMOTE;
                    } else {
                        self.slot_mut(id).state = SY_STAB_RECORDS;
                    }
                }
                SY_STAB_RECORDS => {
                    let count = self.slot(id).sync_stab.len() as u64;
                    let entry_size = ENTRY_HEADER_SIZE + 24;
                    if !self.journal.check_available(count, entry_size, 0, 0) {
                        self.flusher.request_trim();
                        self.slot_mut(id).wait_for = WaitFor::Journal;
                        return OpProgress::Parked;
                    }
                    let batch = self.slot(id).sync_stab.clone();
                    for ov in batch {
                        let record = JournalEntry::Stable {
                            oid: ov.oid,
                            version: ov.version,
                        };
                        self.journal.append_entry(&record);
                    }
                    self.submit_all_dirty_sectors(Some(id));
                    self.slot_mut(id).state = SY_STAB_SECTOR_WAIT;
                }
                SY_STAB_SECTOR_WAIT => {
                    if self.slot(id).pending > 0 {
                        return OpProgress::InProgress;
                    }
                    if !self.cfg.disable_journal_fsync {
                        self.slot_mut(id).pending = 1;
                        self.ring.submit(
                            FileId::Journal,
                            SubmitKind::Fsync,
                            IoTag::SyncJournalFsync { op: id },
                        );
                        self.slot_mut(id).state = SY_STAB_FSYNC_WAIT;
                        return OpProgress::InProgress;
                    }
                    self.slot_mut(id).state = SY_PROMOTE;
                }
                SY_STAB_FSYNC_WAIT => {
                    if self.slot(id).pending > 0 {
                        return OpProgress::InProgress;
                    }
                    self.slot_mut(id).state = SY_PROMOTE;
                }
                SY_PROMOTE => {
                    let batch = std::mem::take(&mut self.slot_mut(id).sync_stab);
                    for ov in batch {
                        self.mark_stable(ov);
                    }
                    self.unsynced_queued_ops = 0;
                    self.cur_sync = None;
                    self.slot_mut(id).retval = 0;
                    self.finish_op(id);
                    return OpProgress::Done;
                }
                other => {
                    debug_assert!(false, "bad sync state {}", other);
                    return OpProgress::InProgress;
                }
            }
        }
    }
}
