//!
//! Log datastructures layered on channels: a write-once log, a circular
//! (FIFO) log with in-place wraparound and a fragmented log backed by a
//! whole-zone free-list allocator.

pub use circular_log::CircularLog;
pub use fragmented_log::{FragmentedLog, ZoneRegion};
pub use free_list::{Extent, FreeList};
pub use once_log::{OnceLog, WriterConfig};

mod circular_log;
mod fragmented_log;
mod free_list;
mod once_log;

use crate::core::{DmaBuf, Result};

/// Capability set shared by the once and circular logs. The fragmented log
/// exposes the same capabilities with region-based signatures.
pub trait ZnsLog {
    /// Append caller memory to the log; returns the number of blocks the
    /// write head advanced by.
    fn append(&mut self, data: &[u8], aligned: bool) -> Result<u64>;

    /// Append a whole caller-supplied DMA buffer.
    fn append_buffer(&mut self, buffer: &DmaBuf) -> Result<u64>;

    /// Append a section of a caller-supplied DMA buffer.
    fn append_buffer_section(
        &mut self,
        buffer: &DmaBuf,
        addr: u64,
        size: u64,
        aligned: bool,
    ) -> Result<u64>;

    /// Read `data.len()` bytes starting at the logical address `lba`.
    /// `reader` selects the read channel on logs that hold several.
    fn read(
        &mut self,
        lba: u64,
        data: &mut [u8],
        aligned: bool,
        reader: u8,
    ) -> Result<()>;

    /// Read into a caller-supplied DMA buffer.
    fn read_into_buffer(
        &mut self,
        lba: u64,
        buffer: &mut DmaBuf,
        addr: u64,
        size: u64,
        aligned: bool,
        reader: u8,
    ) -> Result<()>;

    /// Reset the whole log.
    fn reset_all(&mut self) -> Result<()>;

    /// Rebuild the log pointers from the on-device zone state.
    fn recover_pointers(&mut self) -> Result<()>;

    fn empty(&self) -> bool;

    /// Bytes that can still be appended.
    fn space_available(&self) -> u64;

    /// Whether `size` more bytes fit.
    fn space_left(&self, size: u64, aligned: bool) -> bool;

    /// Current logical write head.
    fn write_head(&self) -> u64;

    /// Current logical write tail (the oldest readable address).
    fn write_tail(&self) -> u64;

    // diagnostics, meant to be read at the end of a run
    fn bytes_written(&self) -> u64;
    fn bytes_read(&self) -> u64;
    fn zones_reset(&self) -> u64;
}
