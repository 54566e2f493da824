//! Submission/completion queue rings in pinned memory, with their BAR
//! doorbells. One pair per channel plus the admin pair.

use crate::{
    backend::pcie::cmd::NvmeCommand,
    core::{DmaBuf, EngineError},
};

const SQ_ENTRY_SIZE: usize = 64;
const CQ_ENTRY_SIZE: usize = 16;

/// One 16-byte completion queue entry.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C, packed)]
pub(crate) struct CompletionEntry {
    pub command_specific: u32,
    pub _reserved: u32,
    pub sq_head: u16,
    pub sq_id: u16,
    pub command_id: u16,
    /// Phase bit (bit 0) plus status field (bits 1..).
    pub status: u16,
}

impl CompletionEntry {
    /// The status field; non-zero means the command failed.
    pub fn code(&self) -> i32 {
        (self.status >> 1) as i32
    }
}

pub(crate) struct SubQueue {
    mem: DmaBuf,
    slots: usize,
    tail: usize,
    doorbell: *mut u32,
}

// The doorbell pointer aims into the BAR mapping owned by the engine; the
// queue never outlives it.
unsafe impl Send for SubQueue {}

impl SubQueue {
    pub fn new(slots: usize, doorbell: *mut u32) -> Result<Self, EngineError> {
        let mem = DmaBuf::pinned((slots * SQ_ENTRY_SIZE) as u64, 4096)
            .map_err(|_| EngineError::DmaAllocFailed {
                size: (slots * SQ_ENTRY_SIZE) as u64,
            })?;
        Ok(SubQueue {
            mem,
            slots,
            tail: 0,
            doorbell,
        })
    }

    pub fn phys(&self) -> u64 {
        self.mem.phys_addr().unwrap_or(0)
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Place one entry and ring the tail doorbell.
    pub fn submit(&mut self, entry: NvmeCommand) {
        unsafe {
            let base =
                self.mem.as_mut_slice().as_mut_ptr() as *mut NvmeCommand;
            std::ptr::write_volatile(base.add(self.tail), entry);
        }
        self.tail = (self.tail + 1) % self.slots;
        unsafe {
            std::ptr::write_volatile(self.doorbell, self.tail as u32);
        }
    }
}

pub(crate) struct CompQueue {
    mem: DmaBuf,
    slots: usize,
    head: usize,
    phase: bool,
    doorbell: *mut u32,
}

unsafe impl Send for CompQueue {}

impl CompQueue {
    pub fn new(slots: usize, doorbell: *mut u32) -> Result<Self, EngineError> {
        let mem = DmaBuf::pinned((slots * CQ_ENTRY_SIZE) as u64, 4096)
            .map_err(|_| EngineError::DmaAllocFailed {
                size: (slots * CQ_ENTRY_SIZE) as u64,
            })?;
        Ok(CompQueue {
            mem,
            slots,
            head: 0,
            phase: true,
            doorbell,
        })
    }

    pub fn phys(&self) -> u64 {
        self.mem.phys_addr().unwrap_or(0)
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Reap one completion if the device posted one, advancing the head
    /// doorbell.
    pub fn reap(&mut self) -> Option<CompletionEntry> {
        let entry = unsafe {
            let base =
                self.mem.as_slice().as_ptr() as *const CompletionEntry;
            std::ptr::read_volatile(base.add(self.head))
        };
        if (entry.status & 1 == 1) != self.phase {
            return None;
        }
        self.head += 1;
        if self.head == self.slots {
            self.head = 0;
            self.phase = !self.phase;
        }
        unsafe {
            std::ptr::write_volatile(self.doorbell, self.head as u32);
        }
        Some(entry)
    }
}
