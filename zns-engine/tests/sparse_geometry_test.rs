//! Devices where the usable zone capacity is smaller than the addressable
//! zone size. Callers address a dense logical space (every zone exactly
//! `zone_cap` blocks); the channel translates to the sparse physical
//! layout and never touches the unmapped block range of a zone.

mod common;

use common::cyclic_pattern;
use zns_engine::{
    logs::{OnceLog, WriterConfig, ZnsLog},
    BackendKind,
    ChannelFactory,
    ChannelOptions,
    OpenOptions,
    ZnsDevice,
};

const LBA_SIZE: u64 = 4096;
const ZONE_SIZE: u64 = 64;
const ZONE_CAP: u64 = 56;

fn sparse_device(
    name: &str,
    max_channels: usize,
) -> (ZnsDevice, ChannelFactory) {
    let mut dev = ZnsDevice::new(name, BackendKind::Emulated);
    let traddr = format!(
        "emu://{name}?zones=16&zone_size={ZONE_SIZE}&zone_cap={ZONE_CAP}\
         &lba_size={LBA_SIZE}&mdts=131072&zasl=65536"
    );
    dev.open(
        &traddr,
        &OpenOptions {
            min_zone: 2,
            max_zone: 6,
        },
    )
    .unwrap();
    let factory = ChannelFactory::new(&dev, max_channels).unwrap();
    (dev, factory)
}

#[test]
fn translation_is_a_bijection_on_the_window() {
    let (_dev, factory) = sparse_device("sparse-xlat", 1);
    let channel =
        factory.register_channel(ChannelOptions::default()).unwrap();
    for lba in (2 * ZONE_CAP .. 6 * ZONE_CAP).step_by(7) {
        let pba = channel.lba_to_pba(lba);
        // never inside the unmapped tail of a zone
        assert!(pba % ZONE_SIZE < ZONE_CAP);
        assert_eq!(channel.pba_to_lba(pba), lba);
    }
    // a full zone's head lands on the next zone's logical start
    assert_eq!(channel.pba_to_lba(2 * ZONE_SIZE + ZONE_CAP), 3 * ZONE_CAP);
    assert_eq!(channel.lba_to_pba(3 * ZONE_CAP), 3 * ZONE_SIZE);
}

#[test]
fn appends_skip_the_unmapped_blocks() {
    let (_dev, factory) = sparse_device("sparse-append", 1);
    let mut channel =
        factory.register_channel(ChannelOptions::default()).unwrap();
    channel.reset_all_zones().unwrap();

    // One zone capacity plus four blocks: the append crosses into the
    // next zone even though the physical zone has unmapped room left.
    let payload =
        cyclic_pattern(((ZONE_CAP + 4) * LBA_SIZE) as usize, 21);
    let mut lba = 2 * ZONE_CAP;
    channel.direct_append(&mut lba, &payload, true).unwrap();
    assert_eq!(lba, 3 * ZONE_CAP + 4);
    assert_eq!(
        channel.cached_zone_head(2 * ZONE_CAP).unwrap(),
        3 * ZONE_CAP
    );
    assert_eq!(
        channel.cached_zone_head(3 * ZONE_CAP).unwrap(),
        3 * ZONE_CAP + 4
    );

    let mut readback = vec![0u8; payload.len()];
    channel.direct_read(2 * ZONE_CAP, &mut readback, true).unwrap();
    assert_eq!(readback, payload);
}

#[test]
fn logs_stay_dense_over_sparse_zones() {
    let (_dev, factory) = sparse_device("sparse-log", 2);
    let mut log =
        OnceLog::new(&factory, 2, 6, WriterConfig::QueueDepth(1)).unwrap();
    log.reset_all().unwrap();
    assert_eq!(log.space_available(), 4 * ZONE_CAP * LBA_SIZE);

    let payload =
        cyclic_pattern(((2 * ZONE_CAP + 9) * LBA_SIZE) as usize, 22);
    let blocks = log.append(&payload, true).unwrap();
    assert_eq!(blocks, 2 * ZONE_CAP + 9);
    assert_eq!(log.write_head(), 2 * ZONE_CAP + blocks);

    let mut readback = vec![0u8; payload.len()];
    log.read(2 * ZONE_CAP, &mut readback, true, 0).unwrap();
    assert_eq!(readback, payload);

    // recovery sees the same dense pointers
    drop(log);
    let mut log =
        OnceLog::new(&factory, 2, 6, WriterConfig::QueueDepth(1)).unwrap();
    log.recover_pointers().unwrap();
    assert_eq!(log.write_head(), 2 * ZONE_CAP + 2 * ZONE_CAP + 9);
}
