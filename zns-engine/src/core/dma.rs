//! Buffers handed to the I/O engines must be allocated through the engine's
//! allocator so the device can reach them. For the heap-backed engines this
//! means block-aligned (zeroed) allocations; the user-space PCIe driver
//! additionally needs pinned pages with a resolved physical address for PRP
//! entries.

use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    fs::File,
    os::unix::fs::FileExt,
    ptr::NonNull,
    slice::{from_raw_parts, from_raw_parts_mut},
};

use snafu::Snafu;
use tracing::trace;

use crate::core::ZnsError;

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum DmaError {
    #[snafu(display("Failed to allocate DMA buffer"))]
    Alloc {},
    #[snafu(display("Failed to resolve physical address: {reason}"))]
    PhysTranslation {
        reason: String,
    },
}

/// How the region behind a [`DmaBuf`] was obtained, which also dictates how
/// it is released and whether a physical address is known.
#[derive(Debug)]
enum Region {
    Heap {
        layout: Layout,
    },
    Pinned {
        map_len: usize,
        phys: u64,
    },
}

/// An owned, block-aligned DMA-capable buffer. The allocation is always a
/// multiple of the alignment it was created with and is zeroed on creation.
#[derive(Debug)]
pub struct DmaBuf {
    buf: NonNull<u8>,
    length: usize,
    align: usize,
    region: Region,
}

// The buffer is plain owned memory; the pointer is not shared.
unsafe impl Send for DmaBuf {}

impl DmaBuf {
    /// Allocate a zeroed buffer of at least `size` bytes, rounded up to a
    /// multiple of `align` (the device block size).
    pub fn new(size: u64, align: u64) -> Result<Self, DmaError> {
        let align = align.max(1) as usize;
        let length = round_up(size as usize, align);
        let layout = Layout::from_size_align(length.max(align), align)
            .map_err(|_| DmaError::Alloc {})?;
        let buf = unsafe { alloc_zeroed(layout) };
        match NonNull::new(buf) {
            Some(buf) => Ok(DmaBuf {
                buf,
                length: layout.size(),
                align,
                region: Region::Heap {
                    layout,
                },
            }),
            None => Err(DmaError::Alloc {}),
        }
    }

    /// Allocate a pinned, physically resolved buffer for engines that issue
    /// PRP-based transfers. Backed by huge pages when available, falling
    /// back to locked anonymous pages.
    pub(crate) fn pinned(size: u64, align: u64) -> Result<Self, DmaError> {
        let align = align.max(1) as usize;
        let length = round_up(size.max(1) as usize, align);
        let map_len = round_up(length, HUGE_PAGE_SIZE);

        let mut ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE
                    | libc::MAP_ANONYMOUS
                    | libc::MAP_HUGETLB
                    | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            // No huge pages configured; locked small pages still work for
            // transfers that fit a single page run.
            ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    map_len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE
                        | libc::MAP_ANONYMOUS
                        | libc::MAP_POPULATE,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(DmaError::Alloc {});
            }
            unsafe {
                libc::mlock(ptr, map_len);
            }
        }
        let phys = virt_to_phys(ptr as usize)?;
        Ok(DmaBuf {
            buf: NonNull::new(ptr as *mut u8).ok_or(DmaError::Alloc {})?,
            length,
            align,
            region: Region::Pinned {
                map_len,
                phys,
            },
        })
    }

    /// convert the buffer to a slice
    pub fn as_slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.buf.as_ptr(), self.length) }
    }

    /// convert the buffer to a mutable slice
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.buf.as_ptr(), self.length) }
    }

    /// fill the buffer with the given value
    pub fn fill(&mut self, val: u8) {
        unsafe {
            std::ptr::write_bytes(self.buf.as_ptr(), val, self.length);
        }
    }

    /// Return length of the allocated buffer.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The physical address of the region, when the region is pinned.
    pub(crate) fn phys_addr(&self) -> Option<u64> {
        match self.region {
            Region::Heap { .. } => None,
            Region::Pinned { phys, .. } => Some(phys),
        }
    }

    /// Copy `data` into the buffer at `*write_head`, advancing the head.
    pub fn append_at(
        &mut self,
        data: &[u8],
        write_head: &mut usize,
    ) -> Result<(), ZnsError> {
        if *write_head + data.len() > self.length {
            return Err(ZnsError::invalid("append beyond buffer end"));
        }
        self.as_mut_slice()[*write_head .. *write_head + data.len()]
            .copy_from_slice(data);
        *write_head += data.len();
        Ok(())
    }

    /// Copy `data` into the buffer at `offset`.
    pub fn write_at(
        &mut self,
        data: &[u8],
        offset: usize,
    ) -> Result<(), ZnsError> {
        if offset + data.len() > self.length {
            return Err(ZnsError::invalid("write beyond buffer end"));
        }
        self.as_mut_slice()[offset .. offset + data.len()]
            .copy_from_slice(data);
        Ok(())
    }

    /// Copy bytes out of the buffer at `offset` into `dst`.
    pub fn read_from(
        &self,
        dst: &mut [u8],
        offset: usize,
    ) -> Result<(), ZnsError> {
        if offset + dst.len() > self.length {
            return Err(ZnsError::invalid("read beyond buffer end"));
        }
        dst.copy_from_slice(&self.as_slice()[offset .. offset + dst.len()]);
        Ok(())
    }

    /// Grow the buffer to at least `new_size` bytes, preserving contents.
    /// Shrinking is a no-op; free the buffer instead.
    pub fn realloc(&mut self, new_size: u64) -> Result<(), DmaError> {
        let wanted = round_up(new_size as usize, self.align);
        if wanted <= self.length {
            return Ok(());
        }
        let mut grown = match self.region {
            Region::Heap { .. } => {
                DmaBuf::new(wanted as u64, self.align as u64)?
            }
            Region::Pinned { .. } => {
                DmaBuf::pinned(wanted as u64, self.align as u64)?
            }
        };
        grown.as_mut_slice()[.. self.length]
            .copy_from_slice(self.as_slice());
        *self = grown;
        Ok(())
    }
}

impl Drop for DmaBuf {
    fn drop(&mut self) {
        if cfg!(debug_assertions) {
            trace!("dropping DmaBuf of {} bytes", self.length);
        }
        match self.region {
            Region::Heap {
                layout,
            } => unsafe { dealloc(self.buf.as_ptr(), layout) },
            Region::Pinned {
                map_len, ..
            } => unsafe {
                libc::munmap(self.buf.as_ptr() as *mut libc::c_void, map_len);
            },
        }
    }
}

const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;
const PAGE_SIZE: usize = 4096;

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

/// Resolve the physical address of a virtual address through the kernel
/// pagemap. Requires the page to be present (MAP_POPULATE above).
pub(crate) fn virt_to_phys(vaddr: usize) -> Result<u64, DmaError> {
    let file = File::open("/proc/self/pagemap").map_err(|e| {
        DmaError::PhysTranslation {
            reason: format!("pagemap: {e}"),
        }
    })?;
    let mut entry = [0u8; 8];
    let offset = (vaddr / PAGE_SIZE * 8) as u64;
    file.read_exact_at(&mut entry, offset).map_err(|e| {
        DmaError::PhysTranslation {
            reason: format!("pagemap read: {e}"),
        }
    })?;
    let entry = u64::from_ne_bytes(entry);
    if entry & (1 << 63) == 0 {
        return Err(DmaError::PhysTranslation {
            reason: "page not present".into(),
        });
    }
    let pfn = entry & ((1u64 << 55) - 1);
    if pfn == 0 {
        return Err(DmaError::PhysTranslation {
            reason: "pagemap requires CAP_SYS_ADMIN".into(),
        });
    }
    Ok(pfn * PAGE_SIZE as u64 + (vaddr % PAGE_SIZE) as u64)
}
