//! Versioning, space management and queueing behavior

mod common;

use blockio_engine::{BlockStore, Config, ImmediateCommit, Op};
use blockio_common::Oid;
use common::*;
use tempfile::tempdir;

#[test]
fn versions_increase_monotonically() {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path());
    let mut bs = format_and_open(&cfg, 16);

    let oid = Oid::new(1, 0);
    let mut seen = Vec::new();
    for i in 0..5u8 {
        let w = run_op(&mut bs, Op::write(oid, 0, 0, pattern(i, 4096)));
        assert!(w.retval >= 0);
        seen.push(w.version);
    }
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);
}

#[test]
fn lower_version_is_rejected_with_eexist() {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path());
    let mut bs = format_and_open(&cfg, 16);

    let oid = Oid::new(1, 0);
    run_op(&mut bs, Op::write(oid, 0, 0, pattern(0x01, 4096)));
    run_op(&mut bs, Op::write(oid, 0, 0, pattern(0x02, 4096)));
    let stale = run_op(&mut bs, Op::write(oid, 1, 0, pattern(0x03, 4096)));
    assert_eq!(stale.retval, -i64::from(libc::EEXIST));
}

#[test]
fn exact_next_version_is_accepted() {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path());
    let mut bs = format_and_open(&cfg, 16);

    let oid = Oid::new(1, 0);
    let w1 = run_op(&mut bs, Op::write(oid, 1, 0, pattern(0x01, 4096)));
    assert_eq!(w1.version, 1);
    let w2 = run_op(&mut bs, Op::write(oid, 2, 0, pattern(0x02, 4096)));
    assert_eq!(w2.version, 2);
}

#[test]
fn delete_of_absent_object_is_idempotent() {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path());
    let mut bs = format_and_open(&cfg, 16);

    let oid = Oid::new(2, 0);
    let d = run_op(&mut bs, Op::delete(oid, 0));
    assert_eq!(d.retval, 0);
    assert_eq!(bs.dirty_count(), 0);

    // Real delete, then delete again after it is flushed
    run_op(&mut bs, Op::write(oid, 0, 0, pattern(0x10, 4096)));
    run_op(&mut bs, Op::sync());
    let d = run_op(&mut bs, Op::delete(oid, 0));
    assert_eq!(d.retval, 0);
    run_op(&mut bs, Op::sync());
    assert_eq!(bs.dirty_count(), 0);

    let again = run_op(&mut bs, Op::delete(oid, 0));
    assert_eq!(again.retval, 0);
    assert_eq!(bs.dirty_count(), 0);
}

#[test]
fn low_version_write_over_delete_is_restored() {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path());
    let mut bs = format_and_open(&cfg, 16);
    let oid = Oid::new(3, 0);

    // Push the object to a high version, then delete it
    for _ in 0..4 {
        run_op(&mut bs, Op::write(oid, 0, 0, pattern(0x20, 4096)));
    }
    run_op(&mut bs, Op::sync());
    run_op(&mut bs, Op::delete(oid, 0));

    // Writing v1 right after the (not yet flushed) delete must work:
    // the delete is forced through the journal and flushed first
    let w = run_op(&mut bs, Op::write(oid, 1, 0, pattern(0x21, 4096)));
    assert_eq!(w.retval, 4096);
    run_op(&mut bs, Op::sync());

    let read = run_op(&mut bs, Op::read(oid, 0, 4096));
    assert_eq!(read.version, 1);
    assert!(read.data.unwrap().iter().all(|&b| b == 0x21));

    // The same version again is now a conflict
    let dup = run_op(&mut bs, Op::write(oid, 1, 0, pattern(0x22, 4096)));
    assert_eq!(dup.retval, -i64::from(libc::EEXIST));
}

#[test]
fn allocator_tracks_live_objects() {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path());
    let mut bs = format_and_open(&cfg, 16);

    for stripe in 0..6u64 {
        run_op(
            &mut bs,
            Op::write(Oid::new(1, stripe), 0, 0, pattern(0x30, BLOCK as usize)),
        );
    }
    run_op(&mut bs, Op::sync());
    assert_eq!(bs.allocated_blocks(), 6);

    for stripe in 0..2u64 {
        run_op(&mut bs, Op::delete(Oid::new(1, stripe), 0));
    }
    run_op(&mut bs, Op::sync());
    assert_eq!(bs.allocated_blocks(), 4);

    // Overwriting reuses the object's block count
    run_op(
        &mut bs,
        Op::write(Oid::new(1, 3), 0, 0, pattern(0x31, BLOCK as usize)),
    );
    run_op(&mut bs, Op::sync());
    assert_eq!(bs.allocated_blocks(), 4);
}

#[test]
fn data_area_exhaustion_fails_with_enospc() {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path());
    let mut bs = format_and_open(&cfg, 4);

    for stripe in 0..4u64 {
        let w = run_op(
            &mut bs,
            Op::write(Oid::new(1, stripe), 0, 0, pattern(0x40, BLOCK as usize)),
        );
        assert_eq!(w.retval, i64::from(BLOCK));
        run_op(&mut bs, Op::sync());
    }
    let full = run_op(
        &mut bs,
        Op::write(Oid::new(1, 99), 0, 0, pattern(0x41, BLOCK as usize)),
    );
    assert_eq!(full.retval, -i64::from(libc::ENOSPC));

    // Deleting one object frees its block for the next write
    run_op(&mut bs, Op::delete(Oid::new(1, 0), 0));
    run_op(&mut bs, Op::sync());
    let w = run_op(
        &mut bs,
        Op::write(Oid::new(1, 99), 0, 0, pattern(0x42, BLOCK as usize)),
    );
    assert_eq!(w.retval, i64::from(BLOCK));
}

#[test]
fn journal_exhaustion_parks_until_flush_frees_space() {
    let dir = tempdir().unwrap();
    let cfg = Config {
        journal_len: 16 * 4096,
        ..test_config(dir.path())
    };
    let mut bs = format_and_open(&cfg, 16);
    let oid = Oid::new(1, 0);

    // First write allocates the block and is made stable so the later
    // small writes pile up in the journal without implicit syncs
    run_op(&mut bs, Op::write(oid, 0, 0, pattern(0x50, BLOCK as usize)));
    run_op(&mut bs, Op::sync());

    let captures: Vec<_> = (0..20u32)
        .map(|i| {
            enqueue_capture(
                &mut bs,
                Op::write(oid, 0, (i % 8) * 4096, pattern(0x51, 4096)),
            )
        })
        .collect();
    bs.run_until_idle();

    let done = captures.iter().filter(|c| c.borrow().is_some()).count();
    assert!(done < 20, "journal too large to exercise the preflight");
    assert!(bs.queued_ops() > 0, "some writes must be parked");
    let used_start_before = bs.journal_used_start();

    // A sync stabilizes what is journaled; the flusher then reclaims
    // space and the parked writes resume
    let sync = enqueue_capture(&mut bs, Op::sync());
    bs.run_until_idle();
    while captures.iter().any(|c| c.borrow().is_none()) {
        let again = enqueue_capture(&mut bs, Op::sync());
        bs.run_until_idle();
        assert!(again.borrow().is_some());
    }
    assert!(sync.borrow().is_some());
    for c in &captures {
        assert_eq!(c.borrow().as_ref().unwrap().retval, 4096);
    }
    assert_ne!(bs.journal_used_start(), used_start_before);
    assert_eq!(bs.queued_ops(), 0);
}

#[test]
fn autosync_threshold_forces_periodic_stability() {
    let dir = tempdir().unwrap();
    let cfg = Config {
        autosync_writes: 2,
        ..test_config(dir.path())
    };
    let mut bs = format_and_open(&cfg, 16);

    for stripe in 0..5u64 {
        run_op(
            &mut bs,
            Op::write(Oid::new(1, stripe), 0, 0, pattern(0x60, BLOCK as usize)),
        );
    }
    bs.run_until_idle();
    // The threshold syncs kept the backlog bounded: the early writes
    // are flushed without any explicit SYNC
    assert!(bs.dirty_count() < 5, "dirty backlog: {}", bs.dirty_count());
    assert_eq!(bs.clean_version(Oid::new(1, 0)), Some(1));
    assert_eq!(bs.clean_version(Oid::new(1, 1)), Some(1));
}

#[test]
fn rollback_discards_unstable_versions() {
    let dir = tempdir().unwrap();
    let cfg = Config {
        immediate_commit: ImmediateCommit::All,
        ..test_config(dir.path())
    };
    let mut bs = format_and_open(&cfg, 16);
    let oid = Oid::new(4, 0);

    // Plain writes under IMMEDIATE_ALL are synced but not stable until
    // a SYNC stabilizes them: exactly the rollbackable window
    let w = run_op(&mut bs, Op::write(oid, 0, 0, pattern(0x70, BLOCK as usize)));
    assert_eq!(w.version, 1);
    assert_eq!(bs.allocated_blocks(), 1);

    let r = run_op(&mut bs, Op::rollback(oid, 0));
    assert_eq!(r.retval, 0);
    assert_eq!(bs.allocated_blocks(), 0);
    assert_eq!(bs.dirty_count(), 0);

    let read = run_op(&mut bs, Op::read(oid, 0, 4096));
    assert_eq!(read.version, 0);

    // Rolling back a stable version is refused
    run_op(&mut bs, Op::write(oid, 0, 0, pattern(0x71, BLOCK as usize)));
    run_op(&mut bs, Op::sync());
    let refused = run_op(&mut bs, Op::rollback(oid, 0));
    assert_eq!(refused.retval, 0, "flushed versions are simply gone");
}

#[test]
fn big_write_then_small_write_completes_in_order() {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path());
    let mut bs = format_and_open(&cfg, 16);
    let oid = Oid::new(5, 0);

    let big = enqueue_capture(&mut bs, Op::write(oid, 0, 0, pattern(0x80, BLOCK as usize)));
    let small = enqueue_capture(&mut bs, Op::write(oid, 0, 4096, pattern(0x81, 4096)));
    bs.run_until_idle();

    // The small write had to wait for the big write's journal entry, so
    // both are complete only after the implicit sync ran
    assert_eq!(big.borrow().as_ref().unwrap().retval, i64::from(BLOCK));
    assert_eq!(small.borrow().as_ref().unwrap().retval, 4096);
    assert_eq!(small.borrow().as_ref().unwrap().version, 2);

    run_op(&mut bs, Op::sync());
    let read = run_op(&mut bs, Op::read(oid, 0, 8192));
    let data = read.data.unwrap();
    assert!(data[..4096].iter().all(|&b| b == 0x80));
    assert!(data[4096..].iter().all(|&b| b == 0x81));
}

#[test]
fn shutdown_close_is_clean() {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path());
    let mut bs = format_and_open(&cfg, 16);
    run_op(&mut bs, Op::write(Oid::new(1, 0), 0, 0, pattern(0x90, 4096)));
    // close performs a final sync and drains everything
    bs.close().unwrap();

    let mut bs = BlockStore::open(test_config(dir.path())).unwrap();
    let read = run_op(&mut bs, Op::read(Oid::new(1, 0), 0, 4096));
    assert_eq!(read.version, 1);
    assert!(read.data.unwrap().iter().all(|&b| b == 0x90));
}

#[test]
fn throttled_small_writes_still_complete() {
    let dir = tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.throttle.enabled = true;
    cfg.throttle.target_iops = 10_000;
    cfg.throttle.target_mbs = 1000;
    cfg.throttle.target_parallelism = 1;
    cfg.throttle.threshold_us = 10;
    let mut bs = format_and_open(&cfg, 16);
    let oid = Oid::new(6, 0);

    run_op(&mut bs, Op::write(oid, 0, 0, pattern(0xA0, BLOCK as usize)));
    for i in 0..4u32 {
        let w = run_op(&mut bs, Op::write(oid, 0, i * 4096, pattern(0xA1, 4096)));
        assert_eq!(w.retval, 4096);
    }
}
