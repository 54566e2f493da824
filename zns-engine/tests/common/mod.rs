use zns_engine::{
    BackendKind,
    ChannelFactory,
    DeviceInfo,
    OpenOptions,
    ZnsDevice,
};

pub const LBA_SIZE: u64 = 4096;
pub const ZONE_CAP: u64 = 64;

/// Open an emulated 40-zone namespace (4 KiB blocks, 64-block zones) with
/// the given allowed window and mint a channel factory for it.
pub fn setup_device(
    name: &str,
    min_zone: u64,
    max_zone: u64,
    max_channels: usize,
) -> (ZnsDevice, ChannelFactory, DeviceInfo) {
    let mut dev = ZnsDevice::new(name, BackendKind::Emulated);
    let traddr = format!(
        "emu://{name}?zones=40&zone_size={ZONE_CAP}&zone_cap={ZONE_CAP}\
         &lba_size={LBA_SIZE}&mdts=131072&zasl=65536"
    );
    dev.open(
        &traddr,
        &OpenOptions {
            min_zone,
            max_zone,
        },
    )
    .expect("open emulated device");
    let factory =
        ChannelFactory::new(&dev, max_channels).expect("channel factory");
    let info = dev.info().unwrap();
    (dev, factory, info)
}

/// Deterministic cyclic byte pattern, offset by a seed so concurrent
/// regions differ.
pub fn cyclic_pattern(len: usize, seed: u8) -> Vec<u8> {
    (0 .. len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
