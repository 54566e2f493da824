//! zns-engine is a user-space access library for NVMe Zoned Namespace (ZNS)
//! devices. A ZNS device splits its LBA space into fixed-size zones that must
//! be written sequentially and reclaimed by resetting the whole zone. This
//! crate wraps that model in safe, composable primitives:
//!
//! - [`core`] holds the primary abstractions: the device manager, DMA
//!   buffers, per-queue-pair I/O channels and the channel factory.
//! - [`backend`] holds the pluggable I/O engines: a user-space PCIe NVMe
//!   driver, a kernel passthrough engine driven over io_uring and a
//!   RAM-backed emulation used for testing.
//! - [`logs`] holds log datastructures layered on channels: a write-once
//!   log, a circular log with a tail consumer and a fragmented log backed by
//!   a whole-zone free-list allocator.

#[macro_use]
extern crate ioctl_gen;

pub mod backend;
pub mod core;
pub mod logs;

pub use crate::core::{
    BackendKind,
    Channel,
    ChannelFactory,
    ChannelOptions,
    DeviceInfo,
    DmaBuf,
    DmaError,
    EngineError,
    OpenOptions,
    Result,
    Status,
    StatusCode,
    VerboseError,
    ZnsDevice,
    ZnsError,
};
