//! Channel-level behavior against the emulated engine: zone walks,
//! logical/physical translation, sub-block tails and the factory capacity
//! accounting.

mod common;

use assert_matches::assert_matches;
use common::{cyclic_pattern, setup_device, LBA_SIZE, ZONE_CAP};
use zns_engine::{ChannelOptions, DmaBuf, Status, ZnsError};

#[test]
fn multi_zone_append_walks_zones() {
    let (_dev, factory, _info) = setup_device("chan-walk", 10, 15, 2);
    let mut channel =
        factory.register_channel(ChannelOptions::default()).unwrap();
    channel.reset_all_zones().unwrap();

    // One zone plus two blocks; the append must continue transparently in
    // the next zone.
    let payload =
        cyclic_pattern(((ZONE_CAP + 2) * LBA_SIZE) as usize, 1);
    let mut lba = 10 * ZONE_CAP;
    channel.direct_append(&mut lba, &payload, true).unwrap();
    assert_eq!(lba, 10 * ZONE_CAP + ZONE_CAP + 2);
    assert_eq!(
        channel.cached_zone_head(10 * ZONE_CAP).unwrap(),
        11 * ZONE_CAP
    );
    assert_eq!(
        channel.cached_zone_head(11 * ZONE_CAP).unwrap(),
        11 * ZONE_CAP + 2
    );

    // Round-trip.
    let mut readback = vec![0u8; payload.len()];
    channel.direct_read(10 * ZONE_CAP, &mut readback, true).unwrap();
    assert_eq!(readback, payload);
}

#[test]
fn zone_walk_fills_zones_to_capacity() {
    let (_dev, factory, info) = setup_device("chan-fill", 10, 15, 1);
    let mut channel =
        factory.register_channel(ChannelOptions::default()).unwrap();
    channel.reset_all_zones().unwrap();

    // Appending n * zone_cap blocks spans exactly n zones, each filled to
    // its capacity.
    let payload = cyclic_pattern((3 * ZONE_CAP * LBA_SIZE) as usize, 2);
    let mut lba = 10 * info.zone_cap;
    channel.direct_append(&mut lba, &payload, true).unwrap();
    assert_eq!(lba, 13 * ZONE_CAP);
    for zone in 10 .. 13 {
        assert_eq!(
            channel.cached_zone_head(zone * ZONE_CAP).unwrap(),
            (zone + 1) * ZONE_CAP
        );
    }
    assert_eq!(
        channel.cached_zone_head(13 * ZONE_CAP).unwrap(),
        13 * ZONE_CAP
    );
}

#[test]
fn random_payloads_round_trip() {
    use rand::{Rng, SeedableRng};
    let (_dev, factory, _info) = setup_device("chan-random", 10, 15, 1);
    let mut channel =
        factory.register_channel(ChannelOptions::default()).unwrap();
    channel.reset_all_zones().unwrap();

    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
    let mut lba = 10 * ZONE_CAP;
    for size in [5usize, 4096, 4100, 70_000, 300_000] {
        let mut payload = vec![0u8; size];
        rng.fill(payload.as_mut_slice());
        let start = lba;
        channel.direct_append(&mut lba, &payload, false).unwrap();
        let mut readback = vec![0u8; size];
        channel.direct_read(start, &mut readback, false).unwrap();
        assert_eq!(readback, payload);
    }
}

#[test]
fn sub_block_tail_is_zero_padded() {
    let (_dev, factory, _info) = setup_device("chan-tail", 10, 15, 1);
    let mut channel =
        factory.register_channel(ChannelOptions::default()).unwrap();
    channel.reset_all_zones().unwrap();

    let size = (LBA_SIZE + LBA_SIZE - 7) as usize;
    let payload = cyclic_pattern(size, 3);
    let mut lba = 10 * ZONE_CAP;
    channel.direct_append(&mut lba, &payload, false).unwrap();
    assert_eq!(lba, 10 * ZONE_CAP + 2);

    let mut readback = vec![0u8; 2 * LBA_SIZE as usize];
    channel.direct_read(10 * ZONE_CAP, &mut readback, true).unwrap();
    assert_eq!(&readback[.. size], &payload[..]);
    assert!(readback[size ..].iter().all(|b| *b == 0));
}

#[test]
fn buffered_path_uses_the_spill_buffer() {
    let (_dev, factory, _info) = setup_device("chan-spill", 10, 15, 1);
    let mut channel =
        factory.register_channel(ChannelOptions::default()).unwrap();
    channel.reset_all_zones().unwrap();

    let size = (2 * LBA_SIZE + 100) as usize;
    let payload = cyclic_pattern(size, 4);
    let mut buf = DmaBuf::new(3 * LBA_SIZE, LBA_SIZE).unwrap();
    buf.write_at(&payload, 0).unwrap();

    let mut lba = 10 * ZONE_CAP;
    channel
        .flush_buffer_section(&mut lba, &buf, 0, size as u64, false)
        .unwrap();
    assert_eq!(lba, 10 * ZONE_CAP + 3);

    let mut readback = DmaBuf::new(3 * LBA_SIZE, LBA_SIZE).unwrap();
    channel
        .read_into_buffer(
            10 * ZONE_CAP,
            &mut readback,
            0,
            size as u64,
            false,
        )
        .unwrap();
    assert_eq!(&readback.as_slice()[.. size], &payload[..]);
}

#[test]
fn aligned_flag_rejects_unaligned_sizes() {
    let (_dev, factory, _info) = setup_device("chan-align", 10, 15, 1);
    let mut channel =
        factory.register_channel(ChannelOptions::default()).unwrap();
    channel.reset_all_zones().unwrap();

    let payload = vec![0xabu8; 100];
    let mut lba = 10 * ZONE_CAP;
    let err = channel.direct_append(&mut lba, &payload, true).unwrap_err();
    assert_eq!(err.status(), Status::InvalidArguments);
    assert_eq!(lba, 10 * ZONE_CAP);
}

#[test]
fn out_of_window_addresses_are_rejected_without_io() {
    let (_dev, factory, _info) = setup_device("chan-window", 10, 15, 1);
    let mut channel =
        factory.register_channel(ChannelOptions::default()).unwrap();
    channel.reset_all_zones().unwrap();

    let payload = vec![0u8; LBA_SIZE as usize];
    // before the window
    let mut lba = 9 * ZONE_CAP;
    assert_matches!(
        channel.direct_append(&mut lba, &payload, true),
        Err(ZnsError::InvalidArguments { .. })
    );
    // at the window end
    let mut lba = 15 * ZONE_CAP;
    assert_matches!(
        channel.direct_append(&mut lba, &payload, true),
        Err(ZnsError::InvalidArguments { .. })
    );
    let mut readback = vec![0u8; LBA_SIZE as usize];
    assert_matches!(
        channel.direct_read(15 * ZONE_CAP, &mut readback, true),
        Err(ZnsError::InvalidArguments { .. })
    );
}

#[test]
fn walking_into_a_dirty_zone_fails() {
    let (_dev, factory, _info) = setup_device("chan-dirty", 10, 15, 1);
    let mut channel =
        factory.register_channel(ChannelOptions::default()).unwrap();
    channel.reset_all_zones().unwrap();

    // Zone 11 already holds data, so a multi-zone append from zone 10 must
    // stop at the boundary instead of walking into it.
    let block = vec![0x11u8; LBA_SIZE as usize];
    let mut lba = 11 * ZONE_CAP;
    channel.direct_append(&mut lba, &block, true).unwrap();

    let payload =
        cyclic_pattern(((ZONE_CAP + 1) * LBA_SIZE) as usize, 5);
    let mut lba = 10 * ZONE_CAP;
    let err = channel.direct_append(&mut lba, &payload, true).unwrap_err();
    assert_eq!(err.status(), Status::InvalidArguments);
    // the write pointer observed the partial progress
    assert_eq!(lba, 11 * ZONE_CAP);
}

#[test]
fn large_transfers_are_chunked_by_zasl_and_mdts() {
    let (_dev, factory, info) = setup_device("chan-chunk", 10, 15, 1);
    let mut channel =
        factory.register_channel(ChannelOptions::default()).unwrap();
    channel.reset_all_zones().unwrap();

    // 40 blocks with zasl = 16 blocks: 3 append commands.
    let zasl_blocks = info.zasl / info.lba_size;
    assert_eq!(zasl_blocks, 16);
    let payload = cyclic_pattern((40 * LBA_SIZE) as usize, 6);
    let mut lba = 10 * ZONE_CAP;
    let ops_before = channel.append_operations();
    channel.direct_append(&mut lba, &payload, true).unwrap();
    assert_eq!(channel.append_operations() - ops_before, 3);
    assert_eq!(channel.bytes_written(), payload.len() as u64);

    // 40 blocks with mdts = 32 blocks: 2 read commands.
    let mut readback = vec![0u8; payload.len()];
    let ops_before = channel.read_operations();
    channel.direct_read(10 * ZONE_CAP, &mut readback, true).unwrap();
    assert_eq!(channel.read_operations() - ops_before, 2);
    assert_eq!(readback, payload);
}

#[test]
fn raw_qpair_speaks_the_engine_contract() {
    let (_dev, factory, info) = setup_device("chan-raw", 10, 15, 2);
    let mut channel =
        factory.register_channel(ChannelOptions::default()).unwrap();
    channel.reset_all_zones().unwrap();

    let mut qpair = factory.register_raw_qpair().unwrap();
    let mut buf = DmaBuf::new(LBA_SIZE, LBA_SIZE).unwrap();
    buf.write_at(b"raw qpair write", 0).unwrap();
    // physical addressing at the engine boundary
    let phys_slba = 10 * info.zone_size;
    qpair.queue().write(phys_slba, &buf, 0, 1).unwrap();
    assert_eq!(qpair.queue().zone_head(phys_slba).unwrap(), phys_slba + 1);

    let mut readback = vec![0u8; LBA_SIZE as usize];
    channel.direct_read(10 * ZONE_CAP, &mut readback, true).unwrap();
    assert_eq!(&readback[.. 15], b"raw qpair write");
}

#[test]
fn factory_enforces_its_channel_capacity() {
    let (_dev, factory, _info) = setup_device("chan-cap", 10, 15, 2);
    let a = factory.register_channel(ChannelOptions::default()).unwrap();
    let _b = factory.register_channel(ChannelOptions::default()).unwrap();
    let err = factory
        .register_channel(ChannelOptions::default())
        .unwrap_err();
    assert_eq!(err.status(), Status::InvalidArguments);
    assert_eq!(factory.channel_count(), 2);

    // retiring a channel frees its slot
    factory.unregister_channel(a);
    assert_eq!(factory.channel_count(), 1);
    assert!(factory.register_channel(ChannelOptions::default()).is_ok());
}

#[test]
fn finish_zone_makes_the_zone_unwritable() {
    let (_dev, factory, _info) = setup_device("chan-finish", 10, 15, 2);
    let mut channel =
        factory.register_channel(ChannelOptions::default()).unwrap();
    channel.reset_all_zones().unwrap();

    let block = vec![0x42u8; LBA_SIZE as usize];
    let mut lba = 10 * ZONE_CAP;
    channel.direct_append(&mut lba, &block, true).unwrap();
    channel.finish_zone(10 * ZONE_CAP).unwrap();
    // the device now reports the zone as closed out
    assert_eq!(
        channel.zone_head(10 * ZONE_CAP).unwrap(),
        11 * ZONE_CAP
    );
    // resetting brings it back
    channel.reset_zone(10 * ZONE_CAP).unwrap();
    assert_eq!(channel.zone_head(10 * ZONE_CAP).unwrap(), 10 * ZONE_CAP);
    assert_eq!(channel.zones_reset(), 5 + 1);
}
