//! The block store engine object
//!
//! [`BlockStore`] owns every piece of state: the ring loop and its three
//! files, the allocator, the journal, the clean/dirty indices, the
//! metadata area and the flusher. All state transitions happen on one
//! cooperative loop; operations are small state machines resumed by I/O
//! completions, freed space, unblocked predecessors or timers.
//!
//! Operation intake assigns versions and inserts dirty entries
//! immediately (see `write.rs`); the submission pass walks the queue in
//! order, so same-object completion order matches enqueue order.

use crate::allocator::Allocator;
use crate::config::{Config, ImmediateCommit};
use crate::flusher::Flusher;
use crate::index::{CleanIndex, DirtyIndex, Stage, WriteKind};
use crate::journal::Journal;
use crate::layout::DiskLayout;
use crate::meta::MetaArea;
use crate::ring::{Completion, FileId, IoTag, OpId, Ring, SubmitKind, TimerEvent};
use blockio_common::{Error, Oid, ObjVer};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Operation kinds accepted by the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
    WriteStable,
    Delete,
    Sync,
    List,
    Rollback,
}

/// Filter of a LIST operation
#[derive(Clone, Copy, Debug, Default)]
pub struct ListFilter {
    /// Lowest inode to include
    pub min_inode: u64,
    /// Highest inode to include; 0 means unbounded
    pub max_inode: u64,
    /// Number of placement groups; 0 disables PG filtering
    pub pg_count: u64,
    /// Placement group to select
    pub pg_number: u64,
    /// Stripe size used for PG mapping; 0 means the data block size
    pub pg_stripe_size: u64,
}

/// One entry of a LIST result
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectListing {
    pub oid: Oid,
    pub version: u64,
}

/// An operation descriptor
#[derive(Clone, Debug)]
pub struct Op {
    pub kind: OpKind,
    pub oid: Oid,
    /// Requested version; 0 means auto-assign
    pub version: u64,
    pub offset: u32,
    pub len: u32,
    pub data: Bytes,
    /// Caller-supplied external bitmap
    pub bitmap: Option<Vec<u8>>,
    pub filter: Option<ListFilter>,
}

impl Op {
    /// A WRITE of `data` at `offset`
    #[must_use]
    pub fn write(oid: Oid, version: u64, offset: u32, data: Bytes) -> Self {
        Self {
            kind: OpKind::Write,
            oid,
            version,
            offset,
            len: data.len() as u32,
            data,
            bitmap: None,
            filter: None,
        }
    }

    /// A WRITE_STABLE of `data` at `offset`
    #[must_use]
    pub fn write_stable(oid: Oid, version: u64, offset: u32, data: Bytes) -> Self {
        Self {
            kind: OpKind::WriteStable,
            ..Self::write(oid, version, offset, data)
        }
    }

    /// A DELETE
    #[must_use]
    pub fn delete(oid: Oid, version: u64) -> Self {
        Self {
            kind: OpKind::Delete,
            oid,
            version,
            offset: 0,
            len: 0,
            data: Bytes::new(),
            bitmap: None,
            filter: None,
        }
    }

    /// A SYNC
    #[must_use]
    pub fn sync() -> Self {
        Self {
            kind: OpKind::Sync,
            oid: Oid::new(0, 0),
            version: 0,
            offset: 0,
            len: 0,
            data: Bytes::new(),
            bitmap: None,
            filter: None,
        }
    }

    /// A READ of `len` bytes at `offset`
    #[must_use]
    pub fn read(oid: Oid, offset: u32, len: u32) -> Self {
        Self {
            kind: OpKind::Read,
            oid,
            version: 0,
            offset,
            len,
            data: Bytes::new(),
            bitmap: None,
            filter: None,
        }
    }

    /// A LIST with the given filter
    #[must_use]
    pub fn list(filter: ListFilter) -> Self {
        Self {
            kind: OpKind::List,
            oid: Oid::new(0, 0),
            version: 0,
            offset: 0,
            len: 0,
            data: Bytes::new(),
            bitmap: None,
            filter: Some(filter),
        }
    }

    /// A ROLLBACK discarding unstable versions above `version`
    #[must_use]
    pub fn rollback(oid: Oid, version: u64) -> Self {
        Self {
            kind: OpKind::Rollback,
            oid,
            version,
            offset: 0,
            len: 0,
            data: Bytes::new(),
            bitmap: None,
            filter: None,
        }
    }
}

/// Completion payload handed to the operation callback
#[derive(Debug, Default)]
pub struct OpResult {
    /// Bytes read/written on success, negative errno on failure
    pub retval: i64,
    /// Version the operation observed or created
    pub version: u64,
    /// Read payload
    pub data: Option<Bytes>,
    /// External bitmap of the object (reads)
    pub bitmap: Option<Vec<u8>>,
    /// LIST results
    pub objects: Option<Vec<ObjectListing>>,
}

/// Operation completion callback
pub type OpCallback = Box<dyn FnOnce(OpResult)>;

/// Work an internal operation performs at completion
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum InternalAction {
    None,
    /// Put a flush request for this version at the head of the queue
    UnshiftFlush(ObjVer),
}

/// What an operation is parked on (diagnostics)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitFor {
    None,
    /// Journal space or sector buffers
    Journal,
    /// A free data block
    Free,
    /// Preceding in-flight writes (sync)
    InFlight,
}

/// Slot of a live operation
pub(crate) struct OpSlot {
    pub kind: OpKind,
    pub oid: Oid,
    pub version: u64,
    pub offset: u32,
    pub len: u32,
    pub data: Bytes,
    pub bitmap: Option<Vec<u8>>,
    pub filter: Option<ListFilter>,
    pub callback: Option<OpCallback>,

    /// Resume label of the operation state machine
    pub state: u8,
    /// Outstanding I/Os
    pub pending: u32,
    /// Deferred caller version under a pending delete; `u64::MAX` marks a
    /// cancelled operation
    pub real_version: u64,
    pub retval: i64,
    pub data_fsynced: bool,
    pub begin: Option<Instant>,
    pub wait_for: WaitFor,
    pub internal: InternalAction,

    // SYNC batches
    pub sync_big: Vec<ObjVer>,
    pub sync_small: Vec<ObjVer>,
    pub sync_stab: Vec<ObjVer>,
}

impl OpSlot {
    fn new(op: Op, callback: Option<OpCallback>, internal: InternalAction) -> Self {
        Self {
            kind: op.kind,
            oid: op.oid,
            version: op.version,
            offset: op.offset,
            len: op.len,
            data: op.data,
            bitmap: op.bitmap,
            filter: op.filter,
            callback,
            state: 0,
            pending: 0,
            real_version: 0,
            retval: 0,
            data_fsynced: false,
            begin: None,
            wait_for: WaitFor::None,
            internal,
            sync_big: Vec::new(),
            sync_small: Vec::new(),
            sync_stab: Vec::new(),
        }
    }
}

/// Outcome of one dispatch of an operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OpProgress {
    /// Could not advance; retry next iteration
    Parked,
    /// Advancing; completions will wake it
    InProgress,
    /// Finished and freed
    Done,
}

/// The single-node block storage engine
pub struct BlockStore {
    pub(crate) cfg: Config,
    pub(crate) layout: DiskLayout,
    pub(crate) ring: Ring,
    pub(crate) alloc: Allocator,
    pub(crate) clean: CleanIndex,
    pub(crate) dirty: DirtyIndex,
    pub(crate) journal: Journal,
    pub(crate) meta: MetaArea,
    pub(crate) flusher: Flusher,

    pub(crate) ops: Vec<Option<OpSlot>>,
    pub(crate) free_ops: Vec<OpId>,
    pub(crate) submit_queue: VecDeque<OpId>,

    /// `(oid, version)` of completed-but-unsynced big/small writes
    pub(crate) unsynced_big_writes: Vec<ObjVer>,
    pub(crate) unsynced_small_writes: Vec<ObjVer>,
    /// Highest synced-but-unstable version per object
    pub(crate) unstable_writes: HashMap<Oid, u64>,
    /// Non-instant writes submitted but not yet synced
    pub(crate) unstable_unsynced: u64,
    /// Big writes whose deferred journal entry is still owed
    pub(crate) unsynced_big_write_count: u64,
    /// Writes since the last sync, for the autosync threshold
    pub(crate) unsynced_queued_ops: u64,

    pub(crate) write_iodepth: u32,
    /// The single in-flight SYNC; later syncs queue behind it
    pub(crate) cur_sync: Option<OpId>,
    pub(crate) shutting_down: bool,
    pub(crate) zero_block: Vec<u8>,
}

impl BlockStore {
    // Construction lives in init.rs (format/open)

    /// Engine layout parameters
    #[must_use]
    pub fn layout(&self) -> &DiskLayout {
        &self.layout
    }

    /// Enqueue an operation; its callback fires from a later loop
    /// iteration (or immediately for boundary rejections).
    pub fn enqueue(&mut self, op: Op, callback: OpCallback) {
        self.enqueue_inner(op, Some(callback), InternalAction::None);
    }

    pub(crate) fn enqueue_internal(&mut self, op: Op, internal: InternalAction) {
        self.enqueue_inner(op, None, internal);
    }

    fn enqueue_inner(
        &mut self,
        op: Op,
        callback: Option<OpCallback>,
        internal: InternalAction,
    ) {
        if let Err(e) = self.check_boundary(&op, callback.is_some()) {
            if let Some(cb) = callback {
                cb(OpResult {
                    retval: e.to_retval(),
                    version: 0,
                    ..OpResult::default()
                });
            }
            return;
        }

        let id = self.alloc_op(OpSlot::new(op, callback, internal));
        match self.ops[id].as_ref().map(|s| s.kind) {
            Some(OpKind::Write | OpKind::WriteStable | OpKind::Delete) => {
                if self.enqueue_write(id) {
                    self.submit_queue.push_back(id);
                } else {
                    // Completed (or rejected) at the boundary
                    self.finish_op(id);
                }
            }
            Some(_) => self.submit_queue.push_back(id),
            None => unreachable!(),
        }
        self.ring.wakeup();
    }

    fn check_boundary(&self, op: &Op, external: bool) -> Result<(), Error> {
        if self.shutting_down && external {
            return Err(Error::ShuttingDown);
        }
        let is_mutation = matches!(
            op.kind,
            OpKind::Write | OpKind::WriteStable | OpKind::Delete | OpKind::Rollback
        );
        if is_mutation && self.cfg.read_only {
            return Err(Error::ReadOnly);
        }
        match op.kind {
            OpKind::Write | OpKind::WriteStable => {
                if u64::from(op.offset) + u64::from(op.len)
                    > u64::from(self.layout.data_block_size)
                {
                    return Err(Error::invalid_argument("write beyond object block"));
                }
                if op.data.len() != op.len as usize {
                    return Err(Error::invalid_argument("buffer length mismatch"));
                }
                if let Some(bitmap) = &op.bitmap {
                    if bitmap.len() != self.layout.clean_entry_bitmap_size as usize {
                        return Err(Error::invalid_argument("bad bitmap length"));
                    }
                }
            }
            OpKind::Read => {
                if op.len == 0
                    || u64::from(op.offset) + u64::from(op.len)
                        > u64::from(self.layout.data_block_size)
                {
                    return Err(Error::invalid_argument("read beyond object block"));
                }
            }
            OpKind::List => {
                if op.filter.is_none() {
                    return Err(Error::invalid_argument("LIST without a filter"));
                }
                if let Some(f) = &op.filter {
                    if f.pg_count > 0 && f.pg_number >= f.pg_count {
                        return Err(Error::invalid_argument("pg_number out of range"));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn alloc_op(&mut self, slot: OpSlot) -> OpId {
        if let Some(id) = self.free_ops.pop() {
            self.ops[id] = Some(slot);
            id
        } else {
            self.ops.push(Some(slot));
            self.ops.len() - 1
        }
    }

    pub(crate) fn slot(&self, id: OpId) -> &OpSlot {
        self.ops[id].as_ref().expect("operation slot gone")
    }

    pub(crate) fn slot_mut(&mut self, id: OpId) -> &mut OpSlot {
        self.ops[id].as_mut().expect("operation slot gone")
    }

    /// Complete an operation: run its callback and free the slot
    pub(crate) fn finish_op(&mut self, id: OpId) {
        let slot = self.ops[id].take().expect("double finish");
        self.free_ops.push(id);
        if let Some(cb) = slot.callback {
            cb(OpResult {
                retval: slot.retval,
                version: slot.version,
                ..OpResult::default()
            });
        }
        match slot.internal {
            InternalAction::None => {}
            InternalAction::UnshiftFlush(ov) => {
                self.flusher.unshift(ov);
            }
        }
        self.ring.wakeup();
    }

    /// Complete an operation carrying a payload (reads, lists)
    pub(crate) fn finish_op_with(&mut self, id: OpId, result: OpResult) {
        let slot = self.ops[id].take().expect("double finish");
        self.free_ops.push(id);
        if let Some(cb) = slot.callback {
            cb(result);
        }
        self.ring.wakeup();
    }

    /// Fail an operation with an error retval
    pub(crate) fn fail_op(&mut self, id: OpId, err: &Error) {
        self.slot_mut(id).retval = err.to_retval();
        self.finish_op(id);
    }

    // Loop

    /// One pass of the cooperative loop. Returns whether any work was
    /// performed.
    pub fn loop_iteration(&mut self) -> bool {
        let mut progress = false;

        for event in self.ring.poll_timers() {
            progress = true;
            self.handle_timer(event);
        }

        let mut i = 0;
        while i < self.submit_queue.len() {
            let id = self.submit_queue[i];
            match self.dispatch_op(id) {
                OpProgress::Done => {
                    let _ = self.submit_queue.remove(i);
                    progress = true;
                }
                OpProgress::InProgress | OpProgress::Parked => i += 1,
            }
        }

        if self.flusher_run() {
            progress = true;
        }

        if self.ring.queued() > 0 {
            progress = true;
        }
        self.ring.submit_queued();
        while let Some(completion) = self.ring.pop_completion() {
            progress = true;
            self.handle_completion(completion);
        }

        progress
    }

    /// Drive the loop until nothing can move anymore. Sleeps through
    /// pending timers (throttle delays, autosync) while operations are
    /// outstanding.
    pub fn run_until_idle(&mut self) {
        loop {
            let progress = self.loop_iteration();
            let woken = self.ring.take_wakeup();
            if progress || woken {
                continue;
            }
            if !self.submit_queue.is_empty() {
                if let Some(deadline) = self.ring.next_timer() {
                    let now = Instant::now();
                    if deadline > now {
                        std::thread::sleep(deadline - now);
                    }
                    continue;
                }
            }
            break;
        }
    }

    fn dispatch_op(&mut self, id: OpId) -> OpProgress {
        match self.slot(id).kind {
            OpKind::Write | OpKind::WriteStable => self.dequeue_write(id),
            OpKind::Delete => self.dequeue_del(id),
            OpKind::Sync => self.continue_sync(id),
            OpKind::Read => self.dequeue_read(id),
            OpKind::List => self.dequeue_list(id),
            OpKind::Rollback => self.dequeue_rollback(id),
        }
    }

    fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::ThrottleDone(id) => {
                if let Some(slot) = self.ops.get_mut(id).and_then(Option::as_mut) {
                    if slot.state == crate::write::WS_THROTTLE {
                        slot.state = crate::write::WS_DONE_ACK;
                        self.ring.wakeup();
                    }
                }
            }
            TimerEvent::Autosync => {
                if !self.shutting_down
                    && (self.unsynced_queued_ops > 0
                        || !self.unsynced_big_writes.is_empty()
                        || !self.unsynced_small_writes.is_empty())
                {
                    debug!("autosync interval fired, forcing a sync");
                    self.enqueue_internal(Op::sync(), InternalAction::None);
                }
                if !self.shutting_down && !self.cfg.autosync_interval.is_zero() {
                    self.ring
                        .set_timer(self.cfg.autosync_interval, TimerEvent::Autosync);
                }
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion.tag {
            IoTag::WriteData { op } => self.dec_pending(op),
            IoTag::DataFsync { op } => {
                if let Some(slot) = self.ops.get_mut(op).and_then(Option::as_mut) {
                    slot.data_fsynced = true;
                }
                self.dec_pending(op);
            }
            IoTag::JournalData { op } => {
                self.journal.data_pending -= 1;
                if self.journal.data_pending == 0 {
                    let deferred = std::mem::take(&mut self.journal.deferred_sectors);
                    for ds in deferred {
                        let pos = self.layout.journal_pos(ds.offset);
                        self.ring.submit(
                            FileId::Journal,
                            SubmitKind::Write {
                                offset: pos,
                                data: ds.buf,
                            },
                            IoTag::JournalSector { sector: ds.sector },
                        );
                    }
                }
                self.dec_pending(op);
            }
            IoTag::JournalSector { sector } => {
                let s = &mut self.journal.sectors[sector];
                s.flush_count -= 1;
                let waiters = s.inflight_groups.pop_front().unwrap_or_default();
                let inline_fsync = self.cfg.immediate_commit != ImmediateCommit::None
                    && !self.cfg.disable_journal_fsync
                    && !waiters.is_empty();
                if inline_fsync {
                    self.ring.submit(
                        FileId::Journal,
                        SubmitKind::Fsync,
                        IoTag::JournalInlineFsync { waiters },
                    );
                } else {
                    for op in waiters {
                        self.dec_pending(op);
                    }
                }
            }
            IoTag::JournalInlineFsync { waiters } => {
                for op in waiters {
                    self.dec_pending(op);
                }
            }
            IoTag::SyncDataFsync { op } | IoTag::SyncJournalFsync { op } => self.dec_pending(op),
        }
    }

    fn dec_pending(&mut self, id: OpId) {
        if let Some(slot) = self.ops.get_mut(id).and_then(Option::as_mut) {
            debug_assert!(slot.pending > 0);
            slot.pending -= 1;
            if slot.pending == 0 {
                self.ring.wakeup();
            }
        }
    }

    // Shared state transitions

    /// Move an entry to SYNCED; instant entries continue to STABLE, big
    /// writes unblock same-object small writes parked in WAIT_BIG.
    pub(crate) fn mark_synced(&mut self, ov: ObjVer) {
        let (kind, instant) = {
            let entry = match self.dirty.get_mut(&ov) {
                Some(e) => e,
                None => return,
            };
            if entry.stage >= Stage::Synced {
                return;
            }
            entry.stage = Stage::Synced;
            (entry.kind, entry.instant)
        };
        if instant {
            self.mark_stable(ov);
        } else {
            let latest = self.unstable_writes.entry(ov.oid).or_insert(0);
            *latest = (*latest).max(ov.version);
            self.unstable_unsynced = self.unstable_unsynced.saturating_sub(1);
        }
        if kind == WriteKind::Big {
            self.unblock_wait_big(ov);
        }
    }

    /// Promote every synced version of the object up to `ov` to STABLE
    /// and queue it for flushing.
    pub(crate) fn mark_stable(&mut self, ov: ObjVer) {
        let keys: Vec<ObjVer> = self
            .dirty
            .versions_of(ov.oid)
            .filter(|(k, e)| k.version <= ov.version && e.stage == Stage::Synced)
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            if let Some(entry) = self.dirty.get_mut(&key) {
                entry.stage = Stage::Stable;
            }
            self.flusher.enqueue(key);
        }
        if let Some(&latest) = self.unstable_writes.get(&ov.oid) {
            if latest <= ov.version {
                self.unstable_writes.remove(&ov.oid);
            }
        }
        self.ring.wakeup();
    }

    /// Promote same-object small writes out of WAIT_BIG once the big
    /// write that blocked them is synced.
    pub(crate) fn unblock_wait_big(&mut self, ov: ObjVer) {
        let keys: Vec<ObjVer> = self
            .dirty
            .versions_of(ov.oid)
            .filter(|(k, e)| k.version > ov.version && e.stage == Stage::WaitBig)
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            if let Some(entry) = self.dirty.get_mut(&key) {
                entry.stage = Stage::InFlight;
            }
        }
        self.ring.wakeup();
    }

    /// Prepare and submit a journal sector write. `waiter` is charged one
    /// pending I/O that is released when the sector (and, in immediate
    /// modes, its inline fsync) reaches the device.
    pub(crate) fn submit_sector_write(&mut self, idx: usize, waiter: Option<OpId>) {
        if let Some(op) = waiter {
            let attached = {
                let sector = &mut self.journal.sectors[idx];
                if sector.dirty {
                    // The write prepared below carries this waiter
                    sector.waiters.push(op);
                    true
                } else if let Some(group) = sector.inflight_groups.back_mut() {
                    // The newest in-flight snapshot already contains every
                    // appended entry; ride on its completion
                    group.push(op);
                    true
                } else {
                    false
                }
            };
            if attached {
                self.slot_mut(op).pending += 1;
            }
        }
        let prepared = self.journal.prepare_sector_write(idx);
        if let Some(ds) = prepared {
            if self.journal.data_pending > 0 {
                // Keep the sector write ordered after its payload writes
                self.journal.deferred_sectors.push(ds);
            } else {
                let pos = self.layout.journal_pos(ds.offset);
                self.ring.submit(
                    FileId::Journal,
                    SubmitKind::Write {
                        offset: pos,
                        data: ds.buf,
                    },
                    IoTag::JournalSector { sector: ds.sector },
                );
            }
        }
    }

    /// Write every dirty sector out, charging `waiter` for each
    pub(crate) fn submit_all_dirty_sectors(&mut self, waiter: Option<OpId>) {
        for idx in 0..self.journal.sectors.len() {
            if self.journal.sectors[idx].dirty {
                self.submit_sector_write(idx, waiter);
            }
        }
    }

    /// Journal byte reserve that future stabilize entries will need
    pub(crate) fn stabilize_reserve(&self, extra: u64) -> u64 {
        (self.unstable_writes.len() as u64 + self.unstable_unsynced + extra)
            * self.journal.block_size
    }

    // Shutdown

    /// Drain in-flight operations, perform a final sync and close.
    /// Operations that cannot finish (parked forever) fail with EPIPE.
    pub fn close(mut self) -> Result<(), Error> {
        info!("closing block store");
        self.shutting_down = true;
        if !self.cfg.read_only {
            self.enqueue_internal(Op::sync(), InternalAction::None);
        }
        self.run_until_idle();

        let leftovers: Vec<OpId> = self.submit_queue.drain(..).collect();
        if !leftovers.is_empty() {
            warn!("{} operations cancelled at shutdown", leftovers.len());
        }
        for id in leftovers {
            if self.ops[id].is_some() {
                self.fail_op(id, &Error::ShuttingDown);
            }
        }

        self.ring.fsync_now(FileId::Data)?;
        self.ring.fsync_now(FileId::Meta)?;
        self.ring.fsync_now(FileId::Journal)?;
        Ok(())
    }

    // Introspection used by tests and the layer above

    /// Clean (flushed) version of an object, if any
    #[must_use]
    pub fn clean_version(&self, oid: Oid) -> Option<u64> {
        self.clean.get(oid).map(|e| e.version)
    }

    /// Number of dirty entries
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Number of allocated data blocks
    #[must_use]
    pub fn allocated_blocks(&self) -> u64 {
        self.alloc.used_count()
    }

    /// Journal live-region start
    #[must_use]
    pub fn journal_used_start(&self) -> u64 {
        self.journal.used_start
    }

    /// Journal allocation position
    #[must_use]
    pub fn journal_next_free(&self) -> u64 {
        self.journal.next_free
    }

    /// Free journal bytes
    #[must_use]
    pub fn journal_free_bytes(&self) -> u64 {
        self.journal.free_bytes()
    }

    /// Queued operations (parked or in progress)
    #[must_use]
    pub fn queued_ops(&self) -> usize {
        self.submit_queue.len()
    }
}
