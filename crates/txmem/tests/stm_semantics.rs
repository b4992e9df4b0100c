//! End-to-end transactional semantics: commit visibility, abort
//! restoration, allocation/free lifecycle, and the failure contract.

use txmem::{Addr, Mode, Region, TmError};

#[test]
fn fresh_region_reads_zero() {
    let region = Region::new(1024, 8).expect("region");
    let mut tx = region.begin(Mode::ReadOnly);
    let mut out = [0xFF_u8; 8];
    tx.read(region.start(), &mut out).expect("read");
    assert_eq!(out, [0_u8; 8]);
    tx.commit().expect("read-only commit");
}

#[test]
fn committed_writes_are_visible_to_later_transactions() {
    let region = Region::new(1024, 8).expect("region");
    let start = region.start();

    let mut writer = region.begin(Mode::ReadWrite);
    writer
        .write(&[1, 2, 3, 4, 5, 6, 7, 8], start)
        .expect("write");
    writer.commit().expect("commit");

    let mut reader = region.begin(Mode::ReadOnly);
    let mut out = [0_u8; 8];
    reader.read(start, &mut out).expect("read");
    assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn overlapping_writers_cannot_both_proceed() {
    let region = Region::new(1024, 8).expect("region");
    let start = region.start();

    let mut first = region.begin(Mode::ReadWrite);
    first.write(&[9_u8; 8], start).expect("first writer");

    // The exclusive hold of the first writer excludes the second.
    let mut second = region.begin(Mode::ReadWrite);
    let err = second
        .write(&[7_u8; 8], start)
        .expect_err("second writer must abort");
    assert!(matches!(err, TmError::Contention { .. }));
    assert!(!second.is_live());

    first.commit().expect("commit");

    let mut reader = region.begin(Mode::ReadOnly);
    let mut out = [0_u8; 8];
    reader.read(start, &mut out).expect("read");
    assert_eq!(out, [9_u8; 8]);
}

#[test]
fn writers_exclude_readers_until_commit() {
    let region = Region::new(1024, 8).expect("region");
    let start = region.start();

    let mut writer = region.begin(Mode::ReadWrite);
    writer.write(&[3_u8; 8], start).expect("write");

    let mut reader = region.begin(Mode::ReadOnly);
    let err = reader
        .read(start, &mut [0_u8; 8])
        .expect_err("reader must abort while the writer holds the segment");
    assert!(matches!(err, TmError::Contention { .. }));

    writer.commit().expect("commit");
}

#[test]
fn aborted_alloc_leaves_no_segment_behind() {
    let region = Region::new(1024, 8).expect("region");
    let start = region.start();

    let mut blocker = region.begin(Mode::ReadWrite);
    blocker.write(&[0_u8; 8], start).expect("hold the root");

    let mut tx = region.begin(Mode::ReadWrite);
    let addr = tx.alloc(16).expect("alloc");
    assert_eq!(region.segment_count(), 2);
    // Contention on the root aborts the allocating transaction.
    let err = tx.write(&[1_u8; 8], start).expect_err("contention");
    assert!(matches!(err, TmError::Contention { .. }));
    assert_eq!(region.segment_count(), 1);

    blocker.commit().expect("commit");

    let mut probe = region.begin(Mode::ReadWrite);
    let err = probe
        .read(addr, &mut [0_u8; 8])
        .expect_err("segment must be gone");
    assert!(matches!(err, TmError::Unmapped { .. }));
}

#[test]
fn alloc_write_commit_then_free_lifecycle() {
    let region = Region::new(1024, 8).expect("region");

    let mut creator = region.begin(Mode::ReadWrite);
    let addr = creator.alloc(32).expect("alloc");
    creator.write(&[0xAB_u8; 32], addr).expect("write");
    creator.commit().expect("commit");
    assert_eq!(region.segment_count(), 2);

    let mut user = region.begin(Mode::ReadWrite);
    let mut out = [0_u8; 32];
    user.read(addr, &mut out).expect("read");
    assert_eq!(out, [0xAB_u8; 32]);
    user.free(addr).expect("free");
    user.commit().expect("commit");
    assert_eq!(region.segment_count(), 1);

    let mut probe = region.begin(Mode::ReadWrite);
    let err = probe
        .read(addr, &mut [0_u8; 8])
        .expect_err("freed segment must be unmapped");
    assert!(matches!(err, TmError::Unmapped { .. }));
}

#[test]
fn aborted_free_keeps_the_segment_alive() {
    let region = Region::new(1024, 8).expect("region");
    let start = region.start();

    let mut creator = region.begin(Mode::ReadWrite);
    let addr = creator.alloc(16).expect("alloc");
    creator.write(&[0x5A_u8; 16], addr).expect("write");
    creator.commit().expect("commit");

    let mut blocker = region.begin(Mode::ReadWrite);
    blocker.write(&[0_u8; 8], start).expect("hold the root");

    let mut tx = region.begin(Mode::ReadWrite);
    tx.free(addr).expect("free");
    let err = tx.write(&[1_u8; 8], start).expect_err("contention");
    assert!(matches!(err, TmError::Contention { .. }));

    blocker.commit().expect("commit");

    // The abort flipped the tombstone back: contents are intact.
    let mut reader = region.begin(Mode::ReadOnly);
    let mut out = [0_u8; 16];
    reader.read(addr, &mut out).expect("read");
    assert_eq!(out, [0x5A_u8; 16]);
}

#[test]
fn rollback_restores_pre_transaction_bytes() {
    let region = Region::new(1024, 8).expect("region");
    let start = region.start();

    let mut seed = region.begin(Mode::ReadWrite);
    seed.write(&[0xEE_u8; 8], start).expect("seed");
    seed.commit().expect("commit");

    let mut creator = region.begin(Mode::ReadWrite);
    let side = creator.alloc(16).expect("alloc");
    creator.commit().expect("commit");

    let mut holder = region.begin(Mode::ReadWrite);
    holder.write(&[0_u8; 16], side).expect("hold the side segment");

    let mut tx = region.begin(Mode::ReadWrite);
    tx.write(&[1_u8; 8], start).expect("first write");
    tx.write(&[2_u8; 8], start).expect("second write");
    let err = tx.write(&[3_u8; 16], side).expect_err("contention");
    assert!(matches!(err, TmError::Contention { .. }));

    holder.commit().expect("commit");

    let mut reader = region.begin(Mode::ReadOnly);
    let mut out = [0_u8; 8];
    reader.read(start, &mut out).expect("read");
    assert_eq!(out, [0xEE_u8; 8]);
}

#[test]
fn alloc_then_free_in_one_transaction_commits_clean() {
    let region = Region::new(1024, 8).expect("region");
    let mut tx = region.begin(Mode::ReadWrite);
    let addr = tx.alloc(64).expect("alloc");
    tx.write(&[1_u8; 64], addr).expect("write");
    tx.free(addr).expect("free");
    tx.commit().expect("commit");
    assert_eq!(region.segment_count(), 1);
}

#[test]
fn read_only_transactions_share_segments() {
    let region = Region::new(1024, 8).expect("region");
    let start = region.start();

    let mut first = region.begin(Mode::ReadOnly);
    let mut second = region.begin(Mode::ReadOnly);
    first.read(start, &mut [0_u8; 8]).expect("first reader");
    second.read(start, &mut [0_u8; 8]).expect("second reader");
    first.commit().expect("commit");
    second.commit().expect("commit");
}

#[test]
fn misaligned_address_and_size_abort() {
    let region = Region::new(1024, 8).expect("region");
    let start = region.start();

    let mut tx = region.begin(Mode::ReadOnly);
    let off = start.checked_add(3).expect("addr");
    assert!(matches!(
        tx.read(off, &mut [0_u8; 8]),
        Err(TmError::Misaligned { .. })
    ));

    let mut tx = region.begin(Mode::ReadOnly);
    assert!(matches!(
        tx.read(start, &mut [0_u8; 5]),
        Err(TmError::Misaligned { .. })
    ));

    let mut tx = region.begin(Mode::ReadWrite);
    assert!(matches!(tx.alloc(12), Err(TmError::Misaligned { .. })));
}

#[test]
fn unmapped_address_aborts() {
    let region = Region::new(1024, 8).expect("region");
    let mut tx = region.begin(Mode::ReadOnly);
    assert!(matches!(
        tx.read(Addr(8), &mut [0_u8; 8]),
        Err(TmError::Unmapped { .. })
    ));
    assert!(!tx.is_live());
}

#[test]
fn free_of_a_non_base_address_aborts() {
    let region = Region::new(1024, 8).expect("region");

    let mut creator = region.begin(Mode::ReadWrite);
    let addr = creator.alloc(32).expect("alloc");
    creator.commit().expect("commit");

    let interior = addr.checked_add(8).expect("addr");
    let mut tx = region.begin(Mode::ReadWrite);
    assert!(matches!(tx.free(interior), Err(TmError::Unmapped { .. })));
}

#[test]
fn atomically_retries_past_contention() {
    let region = Region::new(1024, 8).expect("region");
    let start = region.start();

    let mut blocker = Some(region.begin(Mode::ReadWrite));
    blocker
        .as_mut()
        .expect("blocker")
        .write(&[0xCC_u8; 8], start)
        .expect("hold the root");

    let mut attempts = 0_u32;
    let result = region.atomically(Mode::ReadWrite, |tx| {
        attempts += 1;
        let outcome = tx.write(&[1_u8; 8], start);
        if outcome.is_err() {
            // Release the conflicting writer so the retry can succeed.
            blocker.take();
        }
        outcome
    });
    result.expect("retry must succeed once the blocker is gone");
    assert_eq!(attempts, 2);

    let mut out = [0_u8; 8];
    region
        .atomically(Mode::ReadOnly, |tx| tx.read(start, &mut out))
        .expect("read");
    assert_eq!(out, [1_u8; 8]);
}

#[test]
fn atomically_propagates_permanent_errors() {
    let region = Region::new(1024, 8).expect("region");
    let err = region
        .atomically(Mode::ReadOnly, |tx| tx.write(&[0_u8; 8], region.start()))
        .expect_err("read-only write is permanent");
    assert!(matches!(err, TmError::ReadOnly));
}
