//! Cooperative I/O submission loop
//!
//! The ring owns the engine's three file descriptors. Writes and fsyncs
//! are queued with a typed completion tag, executed in submission order
//! by [`Ring::submit_queued`], and their completions are dispatched by
//! the engine through a single tagged match. Reads used to compose
//! results (flusher, read path) are immediate. A small single-shot timer
//! heap drives throttling delays and the autosync cadence. Handlers that
//! enqueue further work call [`Ring::wakeup`] so another loop iteration
//! runs.
//!
//! A failed write or fsync is a fail-stop condition: the engine's state
//! is no longer trustworthy, so the process aborts with diagnostics and
//! leaves recovery to the cluster layer.

use crate::raw_io::DirectFile;
use blockio_common::Result;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::error;

/// Index of an operation slot
pub type OpId = usize;

/// Which of the engine's files an I/O targets
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileId {
    Data,
    Meta,
    Journal,
}

/// Completion token carried by a submission
#[derive(Debug)]
pub enum IoTag {
    /// Big-write payload reached the data area
    WriteData { op: OpId },
    /// Inline data fsync of a big write under immediate commit
    DataFsync { op: OpId },
    /// Small-write payload reached the journal
    JournalData { op: OpId },
    /// A journal sector image reached the journal device
    JournalSector { sector: usize },
    /// Inline journal fsync covering the given waiters
    JournalInlineFsync { waiters: Vec<OpId> },
    /// Data device fsync issued by a SYNC operation
    SyncDataFsync { op: OpId },
    /// Journal device fsync issued by a SYNC operation
    SyncJournalFsync { op: OpId },
}

/// What a queued submission does
pub enum SubmitKind {
    Write { offset: u64, data: Vec<u8> },
    Fsync,
}

/// A queued I/O with its completion tag
pub struct Submission {
    pub file: FileId,
    pub kind: SubmitKind,
    pub tag: IoTag,
}

/// A finished I/O
pub struct Completion {
    pub tag: IoTag,
}

/// Timer payloads
#[derive(Clone, Copy, Debug)]
pub enum TimerEvent {
    /// Throttled small write may complete now
    ThrottleDone(OpId),
    /// Autosync cadence fired
    Autosync,
}

/// The submission loop state
pub struct Ring {
    data: DirectFile,
    meta: DirectFile,
    journal: DirectFile,
    queue: VecDeque<Submission>,
    completions: VecDeque<Completion>,
    timers: BinaryHeap<Reverse<(Instant, u64)>>,
    timer_events: HashMap<u64, TimerEvent>,
    next_timer_id: u64,
    wakeup: bool,
}

impl Ring {
    /// Take ownership of the three opened files
    #[must_use]
    pub fn new(data: DirectFile, meta: DirectFile, journal: DirectFile) -> Self {
        Self {
            data,
            meta,
            journal,
            queue: VecDeque::new(),
            completions: VecDeque::new(),
            timers: BinaryHeap::new(),
            timer_events: HashMap::new(),
            next_timer_id: 0,
            wakeup: false,
        }
    }

    fn file(&self, id: FileId) -> &DirectFile {
        match id {
            FileId::Data => &self.data,
            FileId::Meta => &self.meta,
            FileId::Journal => &self.journal,
        }
    }

    /// Queue an I/O for the next submission batch
    pub fn submit(&mut self, file: FileId, kind: SubmitKind, tag: IoTag) {
        self.queue.push_back(Submission { file, kind, tag });
    }

    /// Number of queued-but-unsubmitted I/Os
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Execute every queued I/O in order and queue its completion
    pub fn submit_queued(&mut self) {
        while let Some(sub) = self.queue.pop_front() {
            let result = match &sub.kind {
                SubmitKind::Write { offset, data } => self.file(sub.file).write_at(*offset, data),
                SubmitKind::Fsync => self.file(sub.file).fsync(),
            };
            if let Err(e) = result {
                // Fail-stop: a lost write leaves the on-disk state behind
                // the in-memory state with no way to reconcile
                error!(
                    "fatal I/O error on {:?} ({:?}): {}",
                    sub.file, sub.tag, e
                );
                std::process::abort();
            }
            self.completions.push_back(Completion { tag: sub.tag });
            self.wakeup = true;
        }
    }

    /// Pop the next completion
    pub fn pop_completion(&mut self) -> Option<Completion> {
        self.completions.pop_front()
    }

    // Immediate I/O used to compose results in the same loop step

    /// Read into `buf` right now
    pub fn read_now(&self, file: FileId, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file(file).read_at(offset, buf)
    }

    /// Write right now, bypassing the queue (flusher path)
    pub fn write_now(&self, file: FileId, offset: u64, data: &[u8]) -> Result<()> {
        self.file(file).write_at(offset, data)
    }

    /// Fsync right now, bypassing the queue (flusher path)
    pub fn fsync_now(&self, file: FileId) -> Result<()> {
        self.file(file).fsync()
    }

    /// Size of one of the files
    #[must_use]
    pub fn file_size(&self, file: FileId) -> u64 {
        self.file(file).size()
    }

    // Timers

    /// Arm a single-shot timer
    pub fn set_timer(&mut self, after: Duration, event: TimerEvent) {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timer_events.insert(id, event);
        self.timers.push(Reverse((Instant::now() + after, id)));
    }

    /// Collect every timer that has fired
    pub fn poll_timers(&mut self) -> Vec<TimerEvent> {
        let now = Instant::now();
        let mut fired = Vec::new();
        while let Some(Reverse((deadline, id))) = self.timers.peek().copied() {
            if deadline > now {
                break;
            }
            self.timers.pop();
            if let Some(event) = self.timer_events.remove(&id) {
                fired.push(event);
            }
        }
        if !fired.is_empty() {
            self.wakeup = true;
        }
        fired
    }

    /// Deadline of the nearest armed timer
    #[must_use]
    pub fn next_timer(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse((t, _))| *t)
    }

    /// Whether any timer is armed
    #[must_use]
    pub fn has_timers(&self) -> bool {
        !self.timers.is_empty()
    }

    // Wakeup flag

    /// Request another loop iteration
    pub fn wakeup(&mut self) {
        self.wakeup = true;
    }

    /// Consume the wakeup flag
    pub fn take_wakeup(&mut self) -> bool {
        std::mem::take(&mut self.wakeup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw_io::DirectFile;
    use tempfile::tempdir;

    fn ring() -> (tempfile::TempDir, Ring) {
        let dir = tempdir().unwrap();
        let data = DirectFile::create(dir.path().join("data"), 1 << 20, false).unwrap();
        let meta = DirectFile::create(dir.path().join("meta"), 1 << 20, false).unwrap();
        let journal = DirectFile::create(dir.path().join("journal"), 1 << 20, false).unwrap();
        (dir, Ring::new(data, meta, journal))
    }

    #[test]
    fn test_submit_and_complete_in_order() {
        let (_dir, mut ring) = ring();
        ring.submit(
            FileId::Journal,
            SubmitKind::Write {
                offset: 0,
                data: vec![1u8; 512],
            },
            IoTag::JournalSector { sector: 0 },
        );
        ring.submit(
            FileId::Journal,
            SubmitKind::Fsync,
            IoTag::SyncJournalFsync { op: 7 },
        );
        ring.submit_queued();

        assert!(matches!(
            ring.pop_completion().unwrap().tag,
            IoTag::JournalSector { sector: 0 }
        ));
        assert!(matches!(
            ring.pop_completion().unwrap().tag,
            IoTag::SyncJournalFsync { op: 7 }
        ));
        assert!(ring.pop_completion().is_none());
        assert!(ring.take_wakeup());
    }

    #[test]
    fn test_written_data_is_readable() {
        let (_dir, mut ring) = ring();
        ring.submit(
            FileId::Data,
            SubmitKind::Write {
                offset: 4096,
                data: vec![0xCD; 4096],
            },
            IoTag::WriteData { op: 0 },
        );
        ring.submit_queued();
        let mut buf = vec![0u8; 4096];
        ring.read_now(FileId::Data, 4096, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xCD));
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let (_dir, mut ring) = ring();
        ring.set_timer(Duration::from_millis(0), TimerEvent::Autosync);
        ring.set_timer(Duration::from_secs(3600), TimerEvent::ThrottleDone(1));
        std::thread::sleep(Duration::from_millis(5));
        let fired = ring.poll_timers();
        assert_eq!(fired.len(), 1);
        assert!(matches!(fired[0], TimerEvent::Autosync));
        assert!(ring.has_timers());
    }
}
