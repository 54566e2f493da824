//! Pluggable I/O engines. An engine is selected once when the device
//! manager is initialized and stays frozen for its lifetime; everything
//! above talks through the [`IoEngine`] / [`IoQueue`] trait pair.
//!
//! Three engines are provided:
//! - [`pcie`]: a user-space NVMe driver that maps the controller BAR and
//!   drives submission/completion queues directly.
//! - [`uring`]: NVMe passthrough against a kernel `/dev/ngXnY` char device,
//!   submitted over io_uring; management commands go through ioctls.
//! - [`emu`]: a RAM-backed ZNS emulation honoring the same contracts, used
//!   by the test suite.

pub mod emu;
pub mod pcie;
pub mod uring;

use std::sync::{
    atomic::{AtomicBool, AtomicI32, Ordering},
    Arc,
};

use crate::core::{DeviceInfo, DmaBuf, DmaError, EngineError};

/// Which I/O engine a device manager drives.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BackendKind {
    /// User-space PCIe NVMe driver.
    Pcie,
    /// Kernel NVMe passthrough over an io_uring submission ring.
    Uring,
    /// In-memory device emulation.
    Emulated,
}

/// Completion slot for asynchronous submissions. Flipped exactly once by a
/// poll entry point on the owning queue pair; `code` holds the device
/// status (0 on success).
#[derive(Debug, Default)]
pub struct Completion {
    done: AtomicBool,
    code: AtomicI32,
}

impl Completion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn code(&self) -> i32 {
        self.code.load(Ordering::Acquire)
    }

    pub fn complete(&self, code: i32) {
        self.code.store(code, Ordering::Release);
        self.done.store(true, Ordering::Release);
    }

    /// Rearm the slot for reuse.
    pub fn rearm(&self) {
        self.code.store(0, Ordering::Release);
        self.done.store(false, Ordering::Release);
    }
}

/// Device-level capability set of an engine: geometry reporting, queue-pair
/// minting and DMA allocation. One instance per opened namespace.
pub trait IoEngine: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Base geometry of the namespace. The allowed-window fields are filled
    /// in by the device manager after clamping.
    fn device_info(&self) -> DeviceInfo;

    fn create_qpair(&self) -> Result<Box<dyn IoQueue>, EngineError>;

    /// Allocate a buffer the engine can perform I/O against.
    fn dma_alloc(&self, size: u64) -> Result<DmaBuf, DmaError>;
}

/// Per-queue-pair I/O contract. All addresses are physical; callers ensure
/// transfers respect MDTS/ZASL and do not cross zone boundaries (reads may
/// cross, but the channel layer splits them anyway). Not thread-safe; a
/// queue pair belongs to exactly one channel.
pub trait IoQueue: Send {
    /// Read `blocks` blocks starting at `phys_lba` into `buf` at byte
    /// `offset`. Single command, no chunking.
    fn read(
        &mut self,
        phys_lba: u64,
        buf: &mut DmaBuf,
        offset: u64,
        blocks: u64,
    ) -> Result<(), EngineError>;

    /// Plain sequential write at the zone write pointer.
    fn write(
        &mut self,
        phys_lba: u64,
        buf: &DmaBuf,
        offset: u64,
        blocks: u64,
    ) -> Result<(), EngineError>;

    /// Zone append: the device assigns the write offset within the zone
    /// starting at `phys_zslba`. Returns only once the command completed.
    fn append(
        &mut self,
        phys_zslba: u64,
        buf: &DmaBuf,
        offset: u64,
        blocks: u64,
    ) -> Result<(), EngineError>;

    /// Enqueue a zone append; completion is flagged by a later poll.
    fn append_async(
        &mut self,
        phys_zslba: u64,
        buf: &DmaBuf,
        offset: u64,
        blocks: u64,
        completion: &Arc<Completion>,
    ) -> Result<(), EngineError>;

    /// Block until `completion` is done, reaping the queue meanwhile.
    fn poll_async(
        &mut self,
        completion: &Completion,
    ) -> Result<(), EngineError>;

    /// Non-blocking reap attempt; no-op if `completion` is already done.
    fn poll_once(&mut self, completion: &Completion)
        -> Result<(), EngineError>;

    /// Rawest poll: reap at most one completion, no error handling.
    fn poll_once_raw(&mut self);

    fn reset_zone(&mut self, phys_slba: u64) -> Result<(), EngineError>;

    /// Reset every zone of the namespace in one command. Only valid when
    /// the caller owns the whole device.
    fn reset_all(&mut self) -> Result<(), EngineError>;

    /// Transition the zone to Full regardless of remaining capacity.
    fn finish_zone(&mut self, phys_slba: u64) -> Result<(), EngineError>;

    /// The zone's physical write pointer. Devices report finished zones
    /// with a pointer past `slba + zone_cap`; those are clamped to
    /// `slba + zone_size`.
    fn zone_head(&mut self, phys_slba: u64) -> Result<u64, EngineError>;

    /// Batched write pointers for the zones in `[phys_slba, phys_eslba]`
    /// (inclusive of both zones).
    fn zone_heads(
        &mut self,
        phys_slba: u64,
        phys_eslba: u64,
    ) -> Result<Vec<u64>, EngineError>;

    /// Usable capacity in blocks of the zone starting at `phys_slba`.
    fn zone_cap(&mut self, phys_slba: u64) -> Result<u64, EngineError>;
}
