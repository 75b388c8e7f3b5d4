//! Shared fixtures for the engine integration tests
#![allow(dead_code)]

use blockio_engine::{BlockStore, Config, Op, OpResult};
use bytes::Bytes;
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

/// Small geometry so tests exercise wraps and exhaustion quickly
pub const BLOCK: u32 = 32 * 1024;
pub const GRAN: u32 = 4096;

pub fn test_config(dir: &Path) -> Config {
    Config {
        data_path: dir.join("data"),
        meta_path: dir.join("meta"),
        journal_path: dir.join("journal"),
        journal_len: 64 * 4096,
        data_block_size: BLOCK,
        bitmap_granularity: GRAN,
        direct_io: false,
        autosync_interval: Duration::ZERO,
        ..Config::default()
    }
}

pub fn format_and_open(cfg: &Config, data_blocks: u64) -> BlockStore {
    BlockStore::format(cfg, data_blocks * u64::from(BLOCK)).unwrap();
    BlockStore::open(cfg.clone()).unwrap()
}

/// Run one operation to completion and return its result
pub fn run_op(bs: &mut BlockStore, op: Op) -> OpResult {
    let slot = Rc::new(RefCell::new(None));
    let captured = slot.clone();
    bs.enqueue(
        op,
        Box::new(move |result| {
            *captured.borrow_mut() = Some(result);
        }),
    );
    bs.run_until_idle();
    let result = slot.borrow_mut().take().expect("operation did not complete");
    result
}

/// Enqueue without driving the loop; the result arrives whenever the
/// operation manages to finish
pub fn enqueue_capture(bs: &mut BlockStore, op: Op) -> Rc<RefCell<Option<OpResult>>> {
    let slot = Rc::new(RefCell::new(None));
    let captured = slot.clone();
    bs.enqueue(
        op,
        Box::new(move |result| {
            *captured.borrow_mut() = Some(result);
        }),
    );
    slot
}

pub fn pattern(byte: u8, len: usize) -> Bytes {
    Bytes::from(vec![byte; len])
}
