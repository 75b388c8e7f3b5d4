//! Round-trip behavior: writes, overlays, reads, listings

mod common;

use blockio_engine::{ListFilter, Op};
use blockio_common::Oid;
use common::*;
use tempfile::tempdir;

#[test]
fn write_sync_read_roundtrip() {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path());
    let mut bs = format_and_open(&cfg, 16);

    let oid = Oid::new(1, 0);
    let write = run_op(&mut bs, Op::write(oid, 0, 0, pattern(0xA1, 4096)));
    assert_eq!(write.retval, 4096);
    assert_eq!(write.version, 1);

    let sync = run_op(&mut bs, Op::sync());
    assert_eq!(sync.retval, 0);

    let read = run_op(&mut bs, Op::read(oid, 0, 4096));
    assert_eq!(read.retval, 4096);
    assert_eq!(read.version, 1);
    assert!(read.data.unwrap().iter().all(|&b| b == 0xA1));
}

#[test]
fn unwritten_regions_read_as_zero() {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path());
    let mut bs = format_and_open(&cfg, 16);

    let oid = Oid::new(1, 0);
    run_op(&mut bs, Op::write(oid, 0, 0, pattern(0xA1, 4096)));
    run_op(&mut bs, Op::sync());

    let read = run_op(&mut bs, Op::read(oid, 0, 8192));
    assert_eq!(read.retval, 8192);
    let data = read.data.unwrap();
    assert!(data[..4096].iter().all(|&b| b == 0xA1));
    assert!(data[4096..].iter().all(|&b| b == 0));
}

#[test]
fn small_write_overlays_big_write() {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path());
    let mut bs = format_and_open(&cfg, 16);

    let oid = Oid::new(1, 0);
    let big = run_op(&mut bs, Op::write(oid, 0, 0, pattern(0xB2, BLOCK as usize)));
    assert_eq!(big.retval, i64::from(BLOCK));
    let small = run_op(&mut bs, Op::write(oid, 0, 4096, pattern(0xC3, 4096)));
    assert_eq!(small.retval, 4096);
    run_op(&mut bs, Op::sync());

    let read = run_op(&mut bs, Op::read(oid, 0, BLOCK));
    let data = read.data.unwrap();
    assert!(data[..4096].iter().all(|&b| b == 0xB2));
    assert!(data[4096..8192].iter().all(|&b| b == 0xC3));
    assert!(data[8192..].iter().all(|&b| b == 0xB2));
    assert_eq!(read.version, 2);
}

#[test]
fn unaligned_write_roundtrip() {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path());
    let mut bs = format_and_open(&cfg, 16);

    let oid = Oid::new(1, 7);
    // Spans a granularity boundary at an odd offset
    run_op(&mut bs, Op::write(oid, 0, 0, pattern(0xD4, 8192)));
    run_op(&mut bs, Op::sync());
    let w = run_op(&mut bs, Op::write(oid, 0, 3000, pattern(0xE5, 2500)));
    assert_eq!(w.retval, 2500);
    run_op(&mut bs, Op::sync());

    let read = run_op(&mut bs, Op::read(oid, 0, 8192));
    let data = read.data.unwrap();
    assert!(data[..3000].iter().all(|&b| b == 0xD4));
    assert!(data[3000..5500].iter().all(|&b| b == 0xE5));
    assert!(data[5500..8192].iter().all(|&b| b == 0xD4));
}

#[test]
fn read_of_nonexistent_object_is_zero_version() {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path());
    let mut bs = format_and_open(&cfg, 16);

    let read = run_op(&mut bs, Op::read(Oid::new(9, 9), 0, 4096));
    assert_eq!(read.retval, 4096);
    assert_eq!(read.version, 0);
    assert!(read.data.unwrap().iter().all(|&b| b == 0));
}

#[test]
fn write_beyond_block_is_invalid() {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path());
    let mut bs = format_and_open(&cfg, 16);

    let result = run_op(
        &mut bs,
        Op::write(Oid::new(1, 0), 0, BLOCK - 2048, pattern(0xFF, 4096)),
    );
    assert_eq!(result.retval, -i64::from(libc::EINVAL));
}

#[test]
fn read_only_store_rejects_writes() {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path());
    {
        let bs = format_and_open(&cfg, 16);
        bs.close().unwrap();
    }
    let ro = blockio_engine::Config {
        read_only: true,
        ..cfg
    };
    let mut bs = blockio_engine::BlockStore::open(ro).unwrap();
    let result = run_op(&mut bs, Op::write(Oid::new(1, 0), 0, 0, pattern(1, 4096)));
    assert_eq!(result.retval, -i64::from(libc::EROFS));
}

#[test]
fn list_enumerates_stable_objects() {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path());
    let mut bs = format_and_open(&cfg, 16);

    for stripe in 0..4u64 {
        run_op(
            &mut bs,
            Op::write(Oid::new(1, stripe * u64::from(BLOCK)), 0, 0, pattern(0x11, 4096)),
        );
    }
    run_op(&mut bs, Op::write(Oid::new(2, 0), 0, 0, pattern(0x22, 4096)));
    run_op(&mut bs, Op::sync());

    let all = run_op(
        &mut bs,
        Op::list(ListFilter {
            min_inode: 0,
            max_inode: 0,
            ..ListFilter::default()
        }),
    );
    assert_eq!(all.retval, 5);
    let objects = all.objects.unwrap();
    assert_eq!(objects.len(), 5);
    assert!(objects.windows(2).all(|w| w[0].oid < w[1].oid));

    // Only inode 1, PG 1 of 2 over block-sized stripes
    let filtered = run_op(
        &mut bs,
        Op::list(ListFilter {
            min_inode: 1,
            max_inode: 1,
            pg_count: 2,
            pg_number: 1,
            pg_stripe_size: u64::from(BLOCK),
        }),
    );
    let objects = filtered.objects.unwrap();
    assert_eq!(objects.len(), 2);
    for o in &objects {
        assert_eq!((o.oid.stripe / u64::from(BLOCK)) % 2, 1);
    }
}

#[test]
fn deleted_objects_disappear_from_listings() {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path());
    let mut bs = format_and_open(&cfg, 16);

    run_op(&mut bs, Op::write(Oid::new(1, 0), 0, 0, pattern(0x33, 4096)));
    run_op(&mut bs, Op::write(Oid::new(1, 1), 0, 0, pattern(0x44, 4096)));
    run_op(&mut bs, Op::sync());
    run_op(&mut bs, Op::delete(Oid::new(1, 0), 0));
    run_op(&mut bs, Op::sync());

    let listing = run_op(&mut bs, Op::list(ListFilter::default()));
    let objects = listing.objects.unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].oid, Oid::new(1, 1));
}
