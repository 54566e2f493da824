//! Once-log behavior: sequential appends, pipelined appends with sync,
//! space accounting, mark-inactive and pointer recovery.

mod common;

use common::{cyclic_pattern, setup_device, LBA_SIZE, ZONE_CAP};
use zns_engine::{
    logs::{OnceLog, WriterConfig, ZnsLog},
    Status,
};

#[test]
fn small_unaligned_append_and_read_back() {
    let (_dev, factory, _info) = setup_device("once-small", 10, 15, 2);
    let mut log =
        OnceLog::new(&factory, 10, 15, WriterConfig::QueueDepth(1)).unwrap();
    log.reset_all().unwrap();
    assert!(log.empty());
    let capacity = 5 * ZONE_CAP * LBA_SIZE;
    assert_eq!(log.space_available(), capacity);

    let blocks = log.append(b"TEST\0", false).unwrap();
    assert_eq!(blocks, 1);
    assert_eq!(log.space_available(), capacity - LBA_SIZE);
    assert_eq!(log.write_head(), 10 * ZONE_CAP + 1);
    assert!(!log.empty());

    let mut readback = vec![0u8; LBA_SIZE as usize];
    log.read(10 * ZONE_CAP, &mut readback, true, 0).unwrap();
    assert_eq!(&readback[.. 5], b"TEST\0");
    assert!(readback[5 ..].iter().all(|b| *b == 0));

    let all = log.read_all().unwrap();
    assert_eq!(all.len(), LBA_SIZE as usize);
    assert_eq!(&all[.. 5], b"TEST\0");
}

#[test]
fn fill_to_capacity_and_reset() {
    let (_dev, factory, _info) = setup_device("once-fill", 10, 13, 2);
    let mut log =
        OnceLog::new(&factory, 10, 13, WriterConfig::QueueDepth(1)).unwrap();
    log.reset_all().unwrap();

    let slab = cyclic_pattern((ZONE_CAP * LBA_SIZE) as usize, 7);
    for _ in 0 .. 3 {
        log.append(&slab, true).unwrap();
    }
    assert_eq!(log.space_available(), 0);
    assert!(!log.space_left(1, false));
    assert_eq!(log.write_head(), 13 * ZONE_CAP);

    let err = log.append(&slab[.. LBA_SIZE as usize], true).unwrap_err();
    assert_eq!(err.status(), Status::IOError);

    log.reset_all().unwrap();
    assert!(log.empty());
    assert_eq!(log.space_available(), 3 * ZONE_CAP * LBA_SIZE);
    assert_eq!(log.write_head(), 10 * ZONE_CAP);
}

#[test]
fn pipelined_appends_sync_to_durability() {
    let (_dev, factory, _info) = setup_device("once-async", 10, 15, 2);
    let mut log =
        OnceLog::new(&factory, 10, 15, WriterConfig::QueueDepth(4)).unwrap();
    log.reset_all().unwrap();
    assert_eq!(log.max_write_depth(), 4);

    // Four appends of three blocks with queue depth four; sync makes them
    // durable and the head advanced by twelve blocks.
    let mut payloads = Vec::new();
    for i in 0 .. 4 {
        let data = cyclic_pattern((3 * LBA_SIZE) as usize, i as u8);
        let blocks = log.async_append(&data, true).unwrap();
        assert_eq!(blocks, 3);
        payloads.push(data);
    }
    log.sync().unwrap();
    assert_eq!(log.write_head(), 10 * ZONE_CAP + 12);

    for (i, payload) in payloads.iter().enumerate() {
        let mut readback = vec![0u8; payload.len()];
        log.read(
            10 * ZONE_CAP + 3 * i as u64,
            &mut readback,
            true,
            0,
        )
        .unwrap();
        assert_eq!(&readback, payload);
    }
}

#[test]
fn oversized_async_append_falls_back_to_sync() {
    let (_dev, factory, info) = setup_device("once-async-big", 10, 15, 2);
    let mut log =
        OnceLog::new(&factory, 10, 15, WriterConfig::QueueDepth(2)).unwrap();
    log.reset_all().unwrap();

    // Larger than one append command: drained and appended synchronously.
    let big = cyclic_pattern((info.zasl + LBA_SIZE) as usize, 9);
    let blocks = log.async_append(&big, true).unwrap();
    assert_eq!(blocks, info.zasl / LBA_SIZE + 1);
    // Crossing a zone boundary takes the same path.
    let filler = cyclic_pattern(
        ((ZONE_CAP - blocks % ZONE_CAP - 1) * LBA_SIZE) as usize,
        10,
    );
    log.append(&filler, true).unwrap();
    let crossing = cyclic_pattern((2 * LBA_SIZE) as usize, 11);
    log.async_append(&crossing, true).unwrap();
    log.sync().unwrap();

    let mut readback = vec![0u8; big.len()];
    log.read(10 * ZONE_CAP, &mut readback, true, 0).unwrap();
    assert_eq!(readback, big);
}

#[test]
fn buffered_appends_avoid_the_staging_copy() {
    let (_dev, factory, _info) = setup_device("once-buffered", 10, 15, 2);
    let mut log =
        OnceLog::new(&factory, 10, 15, WriterConfig::QueueDepth(1)).unwrap();
    log.reset_all().unwrap();

    let size = (3 * LBA_SIZE + 50) as usize;
    let payload = cyclic_pattern(size, 13);
    let mut buf =
        zns_engine::DmaBuf::new(4 * LBA_SIZE, LBA_SIZE).unwrap();
    buf.write_at(&payload, 0).unwrap();

    let blocks = log
        .append_buffer_section(&buf, 0, size as u64, false)
        .unwrap();
    assert_eq!(blocks, 4);
    assert_eq!(log.write_head(), 10 * ZONE_CAP + 4);

    let mut out = zns_engine::DmaBuf::new(4 * LBA_SIZE, LBA_SIZE).unwrap();
    log.read_into_buffer(10 * ZONE_CAP, &mut out, 0, size as u64, false, 0)
        .unwrap();
    assert_eq!(&out.as_slice()[.. size], &payload[..]);

    // whole-buffer variant appends the padded length
    let blocks = log.append_buffer(&buf).unwrap();
    assert_eq!(blocks, 4);
    assert_eq!(log.write_head(), 10 * ZONE_CAP + 8);
}

#[test]
fn mark_inactive_finishes_the_tail_zone() {
    let (_dev, factory, _info) = setup_device("once-inactive", 10, 15, 2);
    let mut log =
        OnceLog::new(&factory, 10, 15, WriterConfig::QueueDepth(1)).unwrap();
    log.reset_all().unwrap();

    log.append(b"inactive", false).unwrap();
    let capacity = 5 * ZONE_CAP * LBA_SIZE;
    assert_eq!(log.space_available(), capacity - LBA_SIZE);

    log.mark_inactive().unwrap();
    assert_eq!(log.write_head(), 11 * ZONE_CAP);
    assert_eq!(log.space_available(), capacity - ZONE_CAP * LBA_SIZE);
    // the head is zone aligned again; appending continues in the next zone
    log.append(b"next zone", false).unwrap();
    assert_eq!(log.write_head(), 11 * ZONE_CAP + 1);
}

#[test]
fn reads_beyond_the_head_are_rejected() {
    let (_dev, factory, _info) = setup_device("once-bounds", 10, 15, 2);
    let mut log =
        OnceLog::new(&factory, 10, 15, WriterConfig::QueueDepth(1)).unwrap();
    log.reset_all().unwrap();
    log.append(b"bounded", false).unwrap();

    let mut readback = vec![0u8; (2 * LBA_SIZE) as usize];
    let err = log
        .read(10 * ZONE_CAP, &mut readback, true, 0)
        .unwrap_err();
    assert_eq!(err.status(), Status::InvalidArguments);
    let err = log
        .read(9 * ZONE_CAP, &mut readback[.. LBA_SIZE as usize], true, 0)
        .unwrap_err();
    assert_eq!(err.status(), Status::InvalidArguments);
}

#[test]
fn recovery_restores_the_write_head() {
    let (_dev, factory, _info) = setup_device("once-recover", 10, 15, 4);
    let payload =
        cyclic_pattern(((2 * ZONE_CAP + 5) * LBA_SIZE) as usize, 12);
    let (head, space) = {
        let mut log =
            OnceLog::new(&factory, 10, 15, WriterConfig::QueueDepth(1))
                .unwrap();
        log.reset_all().unwrap();
        log.append(&payload, true).unwrap();
        (log.write_head(), log.space_available())
    };

    // A freshly constructed log sees the device state of the previous
    // instance.
    let mut log =
        OnceLog::new(&factory, 10, 15, WriterConfig::QueueDepth(1)).unwrap();
    log.recover_pointers().unwrap();
    assert_eq!(log.write_head(), head);
    assert_eq!(log.space_available(), space);

    // and recovery is idempotent
    log.recover_pointers().unwrap();
    assert_eq!(log.write_head(), head);

    let mut readback = vec![0u8; payload.len()];
    log.read(10 * ZONE_CAP, &mut readback, true, 0).unwrap();
    assert_eq!(readback, payload);
}

#[test]
fn external_write_channel_keeps_its_queue_depth() {
    let (_dev, factory, _info) = setup_device("once-extern", 10, 15, 2);
    let channel = factory
        .register_channel(zns_engine::ChannelOptions {
            min_zone: Some(10),
            max_zone: Some(15),
            preserve_async_buffer: true,
            queue_depth: 2,
        })
        .unwrap();
    let mut log =
        OnceLog::new(&factory, 10, 15, WriterConfig::Channel(channel))
            .unwrap();
    assert_eq!(log.max_write_depth(), 2);
    log.reset_all().unwrap();
    log.async_append(b"through the handed-in channel", false)
        .unwrap();
    log.sync().unwrap();
    assert_eq!(log.write_head(), 10 * ZONE_CAP + 1);
}

#[test]
fn force_reset_clears_zones_past_the_head() {
    let (_dev, factory, _info) = setup_device("once-force", 10, 15, 2);
    let mut log =
        OnceLog::new(&factory, 10, 15, WriterConfig::QueueDepth(1)).unwrap();
    log.reset_all().unwrap();
    log.append(b"force", false).unwrap();
    log.reset_all_force().unwrap();
    assert!(log.empty());
    assert_eq!(log.space_available(), 5 * ZONE_CAP * LBA_SIZE);
}
