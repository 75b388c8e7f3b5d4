//! Crash recovery: journal replay, torn tails, checksum verification

mod common;

use blockio_engine::{BlockStore, Config, ImmediateCommit, Op};
use blockio_common::Oid;
use common::*;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use tempfile::tempdir;

#[test]
fn synced_data_survives_reopen() {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path());
    let oid = Oid::new(1, 0);
    {
        let mut bs = format_and_open(&cfg, 16);
        run_op(&mut bs, Op::write(oid, 0, 0, pattern(0xB0, BLOCK as usize)));
        run_op(&mut bs, Op::write(oid, 0, 4096, pattern(0xC1, 4096)));
        run_op(&mut bs, Op::sync());
        // Dropped without close: simulated crash after the sync
    }
    let mut bs = BlockStore::open(cfg).unwrap();
    let read = run_op(&mut bs, Op::read(oid, 0, BLOCK));
    assert_eq!(read.version, 2);
    let data = read.data.unwrap();
    assert!(data[..4096].iter().all(|&b| b == 0xB0));
    assert!(data[4096..8192].iter().all(|&b| b == 0xC1));
    assert!(data[8192..].iter().all(|&b| b == 0xB0));
}

#[test]
fn journal_replay_restores_unflushed_small_write() {
    let dir = tempdir().unwrap();
    // Under immediate-commit-small the record and payload are on the
    // journal device as soon as the write completes
    let cfg = Config {
        immediate_commit: ImmediateCommit::Small,
        ..test_config(dir.path())
    };
    let oid = Oid::new(1, 0);
    {
        let mut bs = format_and_open(&cfg, 16);
        run_op(&mut bs, Op::write(oid, 0, 0, pattern(0xB0, BLOCK as usize)));
        run_op(&mut bs, Op::sync());
        // The small write is journaled and synced but never stabilized,
        // so it is still in the journal, not the clean area
        run_op(&mut bs, Op::write(oid, 0, 8192, pattern(0xC1, 4096)));
    }
    let mut bs = BlockStore::open(cfg).unwrap();
    let read = run_op(&mut bs, Op::read(oid, 0, BLOCK));
    // The journaled record was intact, so the write is visible
    assert_eq!(read.version, 2);
    let data = read.data.unwrap();
    assert!(data[8192..12288].iter().all(|&b| b == 0xC1));
    assert!(data[..8192].iter().all(|&b| b == 0xB0));
}

#[test]
fn torn_payload_truncates_journal_tail() {
    let dir = tempdir().unwrap();
    let cfg = Config {
        immediate_commit: ImmediateCommit::Small,
        ..test_config(dir.path())
    };
    let oid = Oid::new(1, 0);
    {
        let mut bs = format_and_open(&cfg, 16);
        run_op(&mut bs, Op::write(oid, 0, 0, pattern(0xB0, BLOCK as usize)));
        run_op(&mut bs, Op::sync());
        run_op(&mut bs, Op::write(oid, 0, 8192, pattern(0xC1, 4096)));
    }
    // Flip one byte of the journaled payload (a run of 0xC1 bytes)
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(dir.path().join("journal"))
        .unwrap();
    let mut contents = Vec::new();
    file.read_to_end(&mut contents).unwrap();
    let run = contents
        .windows(4096)
        .position(|w| w.iter().all(|&b| b == 0xC1))
        .expect("journaled payload present");
    file.seek(SeekFrom::Start(run as u64 + 100)).unwrap();
    file.write_all(&[0x00]).unwrap();
    file.sync_all().unwrap();
    drop(file);

    let mut bs = BlockStore::open(cfg).unwrap();
    // The torn write is discarded; the object reads at its synced state
    let read = run_op(&mut bs, Op::read(oid, 0, BLOCK));
    assert_eq!(read.version, 1);
    assert!(read.data.unwrap().iter().all(|&b| b == 0xB0));
}

#[test]
fn zeroed_journal_ring_loses_only_unsynced_writes() {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path());
    let oid = Oid::new(1, 0);
    {
        let mut bs = format_and_open(&cfg, 16);
        run_op(&mut bs, Op::write(oid, 0, 0, pattern(0xB0, BLOCK as usize)));
        run_op(&mut bs, Op::sync());
        run_op(&mut bs, Op::write(oid, 0, 8192, pattern(0xC1, 4096)));
    }
    // Wipe the whole ring body, keeping only the START block: everything
    // journaled after the last trim is gone
    let mut file = OpenOptions::new()
        .write(true)
        .open(dir.path().join("journal"))
        .unwrap();
    let zeros = vec![0u8; 63 * 4096];
    file.seek(SeekFrom::Start(4096)).unwrap();
    file.write_all(&zeros).unwrap();
    file.sync_all().unwrap();
    drop(file);

    let mut bs = BlockStore::open(cfg).unwrap();
    let read = run_op(&mut bs, Op::read(oid, 0, BLOCK));
    // The synced big write was flushed to the clean area before the
    // crash; only the unsynced small write is lost
    assert_eq!(read.version, 1);
    assert!(read.data.unwrap().iter().all(|&b| b == 0xB0));
}

#[test]
fn write_stable_immediate_all_survives_crash() {
    let dir = tempdir().unwrap();
    let cfg = Config {
        immediate_commit: ImmediateCommit::All,
        ..test_config(dir.path())
    };
    let oid = Oid::new(1, 0);
    {
        let mut bs = format_and_open(&cfg, 16);
        let w = run_op(
            &mut bs,
            Op::write_stable(oid, 0, 0, pattern(0xD2, BLOCK as usize)),
        );
        assert_eq!(w.retval, i64::from(BLOCK));
        let w2 = run_op(&mut bs, Op::write_stable(oid, 0, 4096, pattern(0xE3, 4096)));
        assert_eq!(w2.retval, 4096);
        // No explicit sync, no close: the acks already implied stability
    }
    let mut bs = BlockStore::open(cfg).unwrap();
    let read = run_op(&mut bs, Op::read(oid, 0, BLOCK));
    assert_eq!(read.version, 2);
    let data = read.data.unwrap();
    assert!(data[..4096].iter().all(|&b| b == 0xD2));
    assert!(data[4096..8192].iter().all(|&b| b == 0xE3));
    assert!(data[8192..].iter().all(|&b| b == 0xD2));
}

#[test]
fn checksum_mismatch_is_reported_as_edom() {
    let dir = tempdir().unwrap();
    let cfg = Config {
        data_csum_type: blockio_engine::CsumType::Crc32c,
        csum_block_size: 4096,
        ..test_config(dir.path())
    };
    let oid = Oid::new(1, 0);
    let mut bs = format_and_open(&cfg, 16);
    run_op(&mut bs, Op::write(oid, 0, 0, pattern(0xAB, BLOCK as usize)));
    run_op(&mut bs, Op::sync());
    assert_eq!(bs.dirty_count(), 0, "write must be flushed to clean");

    // Corrupt the second checksum block of the object's data block
    let location = 0u64; // first allocated block
    let mut file = OpenOptions::new()
        .write(true)
        .open(dir.path().join("data"))
        .unwrap();
    file.seek(SeekFrom::Start(location + 4096)).unwrap();
    file.write_all(&[0x5A; 16]).unwrap();
    file.sync_all().unwrap();
    drop(file);

    let bad = run_op(&mut bs, Op::read(oid, 4096, 4096));
    assert_eq!(bad.retval, -i64::from(libc::EDOM));
    let good = run_op(&mut bs, Op::read(oid, 8192, 4096));
    assert_eq!(good.retval, 4096);
    assert!(good.data.unwrap().iter().all(|&b| b == 0xAB));
}

#[test]
fn reformat_resets_state() {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path());
    {
        let mut bs = format_and_open(&cfg, 16);
        run_op(&mut bs, Op::write(Oid::new(1, 0), 0, 0, pattern(0x77, 4096)));
        run_op(&mut bs, Op::sync());
    }
    // Format again: everything is gone
    let mut bs = format_and_open(&cfg, 16);
    assert_eq!(bs.allocated_blocks(), 0);
    let read = run_op(&mut bs, Op::read(Oid::new(1, 0), 0, 4096));
    assert_eq!(read.version, 0);
}
