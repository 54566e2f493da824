//! Circular log behavior: wraparound appends with atomic head publication,
//! tail consumption at zone granularity, multi-reader reads and pointer
//! recovery.

mod common;

use common::{cyclic_pattern, setup_device, LBA_SIZE, ZONE_CAP};
use zns_engine::{
    logs::{CircularLog, ZnsLog},
    Status,
};

#[test]
fn append_read_and_space_accounting() {
    let (_dev, factory, _info) = setup_device("circ-basic", 10, 15, 4);
    let mut log = CircularLog::new(&factory, 10, 15, 1).unwrap();
    log.reset_all().unwrap();
    let capacity = 5 * ZONE_CAP * LBA_SIZE;
    assert!(log.empty());
    assert_eq!(log.space_available(), capacity);

    let payload = cyclic_pattern((10 * LBA_SIZE) as usize, 1);
    let blocks = log.append(&payload, true).unwrap();
    assert_eq!(blocks, 10);
    assert_eq!(log.space_available(), capacity - 10 * LBA_SIZE);
    assert_eq!(log.write_head(), 10 * ZONE_CAP + 10);
    assert_eq!(log.write_tail(), 10 * ZONE_CAP);

    let mut readback = vec![0u8; payload.len()];
    log.read(10 * ZONE_CAP, &mut readback, true, 0).unwrap();
    assert_eq!(readback, payload);
}

#[test]
fn consume_then_wrapping_append() {
    let (_dev, factory, _info) = setup_device("circ-wrap", 10, 15, 4);
    let mut log = CircularLog::new(&factory, 10, 15, 1).unwrap();
    log.reset_all().unwrap();

    // Fill to three blocks short of the window end.
    let fill =
        cyclic_pattern(((5 * ZONE_CAP - 3) * LBA_SIZE) as usize, 2);
    log.append(&fill, true).unwrap();
    assert_eq!(log.space_available(), 3 * LBA_SIZE);

    // Consuming three blocks does not cross a zone boundary, so nothing is
    // reclaimed yet.
    log.consume_tail(10 * ZONE_CAP, 10 * ZONE_CAP + 3).unwrap();
    assert_eq!(log.space_available(), 3 * LBA_SIZE);
    assert_eq!(log.write_tail(), 10 * ZONE_CAP + 3);

    // Consuming up to the first zone boundary resets zone 10.
    log.consume_tail(10 * ZONE_CAP + 3, 11 * ZONE_CAP).unwrap();
    assert_eq!(
        log.space_available(),
        (3 + ZONE_CAP) * LBA_SIZE
    );
    assert_eq!(log.write_tail(), 11 * ZONE_CAP);
    assert_eq!(log.zone_tail(), 11 * ZONE_CAP);

    // A nine-block append now wraps: three blocks to the window end, six
    // from its start.
    let wrapped = cyclic_pattern((9 * LBA_SIZE) as usize, 3);
    log.append(&wrapped, true).unwrap();
    assert_eq!(log.write_head(), 10 * ZONE_CAP + 6);
    assert_eq!(
        log.space_available(),
        (3 + ZONE_CAP - 9) * LBA_SIZE
    );

    // The wrapped region reads back in one call.
    let mut readback = vec![0u8; wrapped.len()];
    log.read(15 * ZONE_CAP - 3, &mut readback, true, 0).unwrap();
    assert_eq!(readback, wrapped);
}

#[test]
fn buffered_appends_wrap_like_direct_ones() {
    let (_dev, factory, _info) = setup_device("circ-buffered", 10, 15, 4);
    let mut log = CircularLog::new(&factory, 10, 15, 1).unwrap();
    log.reset_all().unwrap();

    let fill =
        cyclic_pattern(((5 * ZONE_CAP - 2) * LBA_SIZE) as usize, 14);
    log.append(&fill, true).unwrap();
    log.consume_tail(10 * ZONE_CAP, 11 * ZONE_CAP).unwrap();

    // Five buffered blocks: two to the window end, three after the wrap.
    let payload = cyclic_pattern((5 * LBA_SIZE) as usize, 15);
    let mut buf =
        zns_engine::DmaBuf::new(5 * LBA_SIZE, LBA_SIZE).unwrap();
    buf.write_at(&payload, 0).unwrap();
    let blocks = log
        .append_buffer_section(&buf, 0, 5 * LBA_SIZE, true)
        .unwrap();
    assert_eq!(blocks, 5);
    assert_eq!(log.write_head(), 10 * ZONE_CAP + 3);

    let mut out = zns_engine::DmaBuf::new(5 * LBA_SIZE, LBA_SIZE).unwrap();
    log.read_into_buffer(
        15 * ZONE_CAP - 2,
        &mut out,
        0,
        5 * LBA_SIZE,
        true,
        0,
    )
    .unwrap();
    assert_eq!(out.as_slice(), &payload[..]);
}

#[test]
fn consume_must_start_at_the_tail() {
    let (_dev, factory, _info) = setup_device("circ-tail", 10, 15, 4);
    let mut log = CircularLog::new(&factory, 10, 15, 1).unwrap();
    log.reset_all().unwrap();
    let payload = cyclic_pattern((4 * LBA_SIZE) as usize, 4);
    log.append(&payload, true).unwrap();

    let err = log
        .consume_tail(10 * ZONE_CAP + 1, 10 * ZONE_CAP + 2)
        .unwrap_err();
    assert_eq!(err.status(), Status::InvalidArguments);
    // consuming past the head is invalid too
    let err = log
        .consume_tail(10 * ZONE_CAP, 10 * ZONE_CAP + 5)
        .unwrap_err();
    assert_eq!(err.status(), Status::InvalidArguments);
}

#[test]
fn appends_past_the_space_budget_fail() {
    let (_dev, factory, _info) = setup_device("circ-full", 10, 12, 4);
    let mut log = CircularLog::new(&factory, 10, 12, 1).unwrap();
    log.reset_all().unwrap();
    let fill = cyclic_pattern((2 * ZONE_CAP * LBA_SIZE) as usize, 5);
    log.append(&fill, true).unwrap();
    let err = log.append(b"one more", false).unwrap_err();
    assert_eq!(err.status(), Status::IOError);
    // nothing moved
    assert_eq!(log.write_head(), 12 * ZONE_CAP);
    assert_eq!(log.space_available(), 0);
}

#[test]
fn independent_readers_observe_the_same_bytes() {
    let (_dev, factory, _info) = setup_device("circ-readers", 10, 15, 5);
    let mut log = CircularLog::new(&factory, 10, 15, 2).unwrap();
    log.reset_all().unwrap();
    assert_eq!(log.readers(), 2);

    let payload = cyclic_pattern((3 * LBA_SIZE) as usize, 6);
    log.append(&payload, true).unwrap();

    let mut first = vec![0u8; (2 * LBA_SIZE) as usize];
    log.read(10 * ZONE_CAP, &mut first, true, 0).unwrap();
    let mut second = vec![0u8; LBA_SIZE as usize];
    log.read(10 * ZONE_CAP, &mut second, true, 1).unwrap();
    assert_eq!(&first[.. LBA_SIZE as usize], &second[..]);
    assert_eq!(&first[..], &payload[.. first.len()]);

    let mut readback = vec![0u8; LBA_SIZE as usize];
    let err = log
        .read(10 * ZONE_CAP, &mut readback, true, 2)
        .unwrap_err();
    assert_eq!(err.status(), Status::InvalidArguments);
}

#[test]
fn reads_inside_the_hole_are_rejected() {
    let (_dev, factory, _info) = setup_device("circ-hole", 10, 15, 4);
    let mut log = CircularLog::new(&factory, 10, 15, 1).unwrap();
    log.reset_all().unwrap();

    let payload = cyclic_pattern((2 * ZONE_CAP * LBA_SIZE) as usize, 7);
    log.append(&payload, true).unwrap();
    log.consume_tail(10 * ZONE_CAP, 11 * ZONE_CAP).unwrap();

    // below the tail
    let mut readback = vec![0u8; LBA_SIZE as usize];
    let err = log
        .read(10 * ZONE_CAP, &mut readback, true, 0)
        .unwrap_err();
    assert_eq!(err.status(), Status::InvalidArguments);
    // beyond the head
    let err = log
        .read(12 * ZONE_CAP, &mut readback, true, 0)
        .unwrap_err();
    assert_eq!(err.status(), Status::InvalidArguments);
    // at the tail is fine
    log.read(11 * ZONE_CAP, &mut readback, true, 0).unwrap();
    assert_eq!(&readback[..], &payload[(ZONE_CAP * LBA_SIZE) as usize ..][.. LBA_SIZE as usize]);
}

#[test]
fn recovery_rebuilds_linear_pointers() {
    let (_dev, factory, _info) = setup_device("circ-rec-lin", 10, 15, 8);
    let payload =
        cyclic_pattern(((ZONE_CAP + 10) * LBA_SIZE) as usize, 8);
    {
        let mut log = CircularLog::new(&factory, 10, 15, 1).unwrap();
        log.reset_all().unwrap();
        log.append(&payload, true).unwrap();
    }
    let mut log = CircularLog::new(&factory, 10, 15, 1).unwrap();
    log.recover_pointers().unwrap();
    assert_eq!(log.write_head(), 10 * ZONE_CAP + ZONE_CAP + 10);
    assert_eq!(log.write_tail(), 10 * ZONE_CAP);
    assert_eq!(log.space_available(), (4 * ZONE_CAP - 10) * LBA_SIZE);

    let mut readback = vec![0u8; payload.len()];
    log.read(10 * ZONE_CAP, &mut readback, true, 0).unwrap();
    assert_eq!(readback, payload);
}

#[test]
fn recovery_rebuilds_wrapped_pointers() {
    let (_dev, factory, _info) = setup_device("circ-rec-wrap", 10, 15, 8);
    let (head, tail, space) = {
        let mut log = CircularLog::new(&factory, 10, 15, 1).unwrap();
        log.reset_all().unwrap();
        // Fill four zones, consume two, then wrap with one and a half
        // zones so the head ends up below the tail.
        let fill =
            cyclic_pattern((4 * ZONE_CAP * LBA_SIZE) as usize, 9);
        log.append(&fill, true).unwrap();
        log.consume_tail(10 * ZONE_CAP, 12 * ZONE_CAP).unwrap();
        let wrap = cyclic_pattern(
            ((ZONE_CAP + ZONE_CAP / 2) * LBA_SIZE) as usize,
            10,
        );
        log.append(&wrap, true).unwrap();
        assert!(log.write_head() < log.write_tail());
        (log.write_head(), log.write_tail(), log.space_available())
    };

    let mut log = CircularLog::new(&factory, 10, 15, 1).unwrap();
    log.recover_pointers().unwrap();
    assert_eq!(log.write_head(), head);
    assert_eq!(log.write_tail(), tail);
    assert_eq!(log.space_available(), space);
}

#[test]
fn reset_all_restores_the_empty_state() {
    let (_dev, factory, _info) = setup_device("circ-reset", 10, 15, 4);
    let mut log = CircularLog::new(&factory, 10, 15, 1).unwrap();
    log.reset_all().unwrap();
    log.append(&cyclic_pattern((8 * LBA_SIZE) as usize, 11), true)
        .unwrap();
    log.reset_all().unwrap();
    assert!(log.empty());
    assert_eq!(log.write_head(), log.write_tail());
    assert_eq!(log.space_available(), 5 * ZONE_CAP * LBA_SIZE);
}
