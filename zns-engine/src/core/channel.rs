//! One queue-pair worth of I/O against a bounded window of zones. The
//! channel hides the difference between the addressable zone size and the
//! usable zone capacity: callers address a dense logical space in which
//! every zone is exactly `zone_cap` blocks long, and the channel translates
//! to the device's sparse physical space. Large transfers are chunked to
//! respect MDTS/ZASL and zone boundaries; sub-block tails go through a
//! reusable one-block spill buffer.

use std::sync::Arc;

use tracing::error;

use crate::{
    backend::{Completion, IoQueue},
    core::{ChannelFactory, DeviceInfo, DmaBuf, Result, ZnsError},
};

/// Cached state of one owned zone, in physical addressing.
#[derive(Debug, Clone, Copy)]
pub struct ZoneState {
    pub slba: u64,
    pub wp: u64,
    pub zone_cap: u64,
}

/// One pipelined append slot.
struct AsyncWriter {
    buf: Option<DmaBuf>,
    completion: Arc<Completion>,
    busy: bool,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

pub struct Channel {
    factory: ChannelFactory,
    qpair: Box<dyn IoQueue>,
    info: DeviceInfo,
    /// Physical bounds of the owned window, zone aligned.
    min_lba: u64,
    max_lba: u64,
    /// Logical bounds of the owned window (dense addressing).
    min_logical: u64,
    max_logical: u64,
    /// Whether the window covers the whole device, enabling the single
    /// command reset-all fast path.
    can_access_all: bool,
    zones: Vec<ZoneState>,
    spill: Option<DmaBuf>,
    writers: Vec<AsyncWriter>,
    preserve_async_buffer: bool,
    async_error: Option<ZnsError>,
    // diagnostics
    bytes_written: u64,
    bytes_read: u64,
    append_operations: u64,
    read_operations: u64,
    zones_reset: u64,
}

impl Channel {
    pub(crate) fn new(
        factory: ChannelFactory,
        mut qpair: Box<dyn IoQueue>,
        info: DeviceInfo,
        min_zone: u64,
        max_zone: u64,
        queue_depth: u32,
        preserve_async_buffer: bool,
    ) -> Result<Self> {
        if min_zone > max_zone || max_zone > info.lba_cap / info.zone_size {
            return Err(ZnsError::invalid("channel window out of bounds"));
        }
        let min_lba = min_zone * info.zone_size;
        let max_lba = max_zone * info.zone_size;
        let can_access_all = min_lba == 0 && max_lba == info.lba_cap;

        // Prime the zone cache from a device report.
        let mut zones = Vec::with_capacity((max_zone - min_zone) as usize);
        if max_zone > min_zone {
            let heads =
                qpair.zone_heads(min_lba, max_lba - info.zone_size)?;
            for (i, wp) in heads.into_iter().enumerate() {
                let slba = min_lba + i as u64 * info.zone_size;
                let zone_cap = qpair.zone_cap(slba)?;
                zones.push(ZoneState {
                    slba,
                    wp,
                    zone_cap,
                });
            }
        }

        let spill = factory.engine().dma_alloc(info.lba_size)?;
        let writers = (0 .. queue_depth.max(1))
            .map(|_| AsyncWriter {
                buf: None,
                completion: Completion::new(),
                busy: false,
            })
            .collect();

        Ok(Channel {
            factory,
            qpair,
            info,
            min_lba,
            max_lba,
            min_logical: min_zone * info.zone_cap,
            max_logical: max_zone * info.zone_cap,
            can_access_all,
            zones,
            spill: Some(spill),
            writers,
            preserve_async_buffer,
            async_error: None,
            bytes_written: 0,
            bytes_read: 0,
            append_operations: 0,
            read_operations: 0,
            zones_reset: 0,
        })
    }

    /// Smallest multiple of the block size at least `size`.
    pub fn align_size(&self, size: u64) -> u64 {
        let mask = self.info.lba_size - 1;
        (size + mask) & !mask
    }

    /// Map a dense logical address to the device's sparse physical space.
    pub fn lba_to_pba(&self, lba: u64) -> u64 {
        (lba / self.info.zone_cap) * self.info.zone_size
            + lba % self.info.zone_cap
    }

    /// Inverse of [`Channel::lba_to_pba`].
    pub fn pba_to_lba(&self, pba: u64) -> u64 {
        (pba / self.info.zone_size) * self.info.zone_cap
            + pba % self.info.zone_size
    }

    pub fn queue_depth(&self) -> u32 {
        self.writers.len() as u32
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Logical write pointer of a zone as cached by this channel.
    pub fn cached_zone_head(&self, logical_slba: u64) -> Result<u64> {
        let idx = self.zone_index_of(self.lba_to_pba(logical_slba))?;
        Ok(self.pba_to_lba(self.zones[idx].wp))
    }

    fn zone_index_of(&self, phys: u64) -> Result<usize> {
        if phys < self.min_lba || phys >= self.max_lba {
            return Err(ZnsError::invalid("address outside channel window"));
        }
        Ok(((phys - self.min_lba) / self.info.zone_size) as usize)
    }

    /// Validate a logical transfer and return its aligned byte size.
    fn checked_size(
        &self,
        lba: u64,
        size: u64,
        aligned: bool,
    ) -> Result<u64> {
        let aligned_size = self.align_size(size);
        if aligned && aligned_size != size {
            return Err(ZnsError::invalid("size is not block aligned"));
        }
        let blocks = aligned_size / self.info.lba_size;
        if lba < self.min_logical || lba + blocks > self.max_logical {
            return Err(ZnsError::invalid("transfer outside channel window"));
        }
        Ok(aligned_size)
    }

    /// Chunked append walk. `phys` tracks the physical write position and
    /// is left at the point of failure on error. `size` is block aligned.
    fn append_walk(
        &mut self,
        phys: &mut u64,
        buf: &DmaBuf,
        addr: u64,
        size: u64,
    ) -> Result<()> {
        let lba_size = self.info.lba_size;
        let mut zone_index = self.zone_index_of(*phys)?;
        if self.zones[zone_index].wp != *phys {
            error!(
                lba = *phys,
                wp = self.zones[zone_index].wp,
                "append does not start at the zone write pointer"
            );
            return Err(ZnsError::invalid(
                "append does not start at the zone write pointer",
            ));
        }
        let mut left = size;
        let mut written = 0u64;
        while left > 0 {
            let zone = self.zones[zone_index];
            let avail = (zone.slba + zone.zone_cap - zone.wp) * lba_size;
            if avail == 0 {
                // Walk into the next zone, which must still be empty.
                zone_index += 1;
                if zone_index >= self.zones.len() {
                    return Err(ZnsError::invalid(
                        "append ran past the channel window",
                    ));
                }
                let next = self.zones[zone_index];
                if next.wp != next.slba {
                    error!(
                        slba = next.slba,
                        wp = next.wp,
                        "zone walk hit a non-empty zone"
                    );
                    return Err(ZnsError::invalid(
                        "zone walk hit a non-empty zone",
                    ));
                }
                *phys = next.slba;
                continue;
            }
            let step = left.min(avail).min(self.info.zasl);
            let blocks = step / lba_size;
            self.qpair
                .append(zone.slba, buf, addr + written, blocks)
                .map_err(ZnsError::from)?;
            self.append_operations += 1;
            self.bytes_written += step;
            self.zones[zone_index].wp += blocks;
            *phys += blocks;
            written += step;
            left -= step;
        }
        Ok(())
    }

    /// Chunked read walk; `size` is block aligned.
    fn read_walk(
        &mut self,
        mut phys: u64,
        buf: &mut DmaBuf,
        addr: u64,
        size: u64,
    ) -> Result<()> {
        let lba_size = self.info.lba_size;
        let mut zone_index = self.zone_index_of(phys)?;
        let mut left = size;
        let mut read = 0u64;
        while left > 0 {
            let zone = self.zones[zone_index];
            let to_end = (zone.slba + zone.zone_cap - phys) * lba_size;
            if to_end == 0 {
                zone_index += 1;
                if zone_index >= self.zones.len() {
                    return Err(ZnsError::invalid(
                        "read ran past the channel window",
                    ));
                }
                phys = self.zones[zone_index].slba;
                continue;
            }
            let step = left.min(to_end).min(self.info.mdts);
            let blocks = step / lba_size;
            self.qpair
                .read(phys, buf, addr + read, blocks)
                .map_err(ZnsError::from)?;
            self.read_operations += 1;
            self.bytes_read += step;
            phys += blocks;
            read += step;
            left -= step;
        }
        Ok(())
    }

    /// Append caller memory. The data is staged in a freshly allocated DMA
    /// buffer rounded up to the block size (so unaligned tails are zero
    /// padded), then appended in chunks. `lba` is advanced to the new
    /// logical write position, also on partial failure.
    pub fn direct_append(
        &mut self,
        lba: &mut u64,
        data: &[u8],
        aligned: bool,
    ) -> Result<()> {
        let size = data.len() as u64;
        let aligned_size = self.checked_size(*lba, size, aligned)?;
        let mut staging = self
            .factory
            .engine()
            .dma_alloc(aligned_size)
            .map_err(ZnsError::from)?;
        staging.as_mut_slice()[.. data.len()].copy_from_slice(data);

        let mut phys = self.lba_to_pba(*lba);
        let res = self.append_walk(&mut phys, &staging, 0, aligned_size);
        *lba = self.pba_to_lba(phys);
        res
    }

    /// Read into caller memory through a DMA staging buffer.
    pub fn direct_read(
        &mut self,
        lba: u64,
        data: &mut [u8],
        aligned: bool,
    ) -> Result<()> {
        let size = data.len() as u64;
        let aligned_size = self.checked_size(lba, size, aligned)?;
        let mut staging = self
            .factory
            .engine()
            .dma_alloc(aligned_size)
            .map_err(ZnsError::from)?;
        self.read_walk(self.lba_to_pba(lba), &mut staging, 0, aligned_size)?;
        data.copy_from_slice(&staging.as_slice()[.. data.len()]);
        Ok(())
    }

    /// Append the whole caller-supplied DMA buffer.
    pub fn flush_buffer(&mut self, lba: &mut u64, buf: &DmaBuf) -> Result<()> {
        self.flush_buffer_section(lba, buf, 0, buf.len() as u64, true)
    }

    /// Append a section of a caller-supplied DMA buffer, without copying.
    /// An unaligned tail is emitted through the spill buffer, zero padded.
    pub fn flush_buffer_section(
        &mut self,
        lba: &mut u64,
        buf: &DmaBuf,
        addr: u64,
        size: u64,
        aligned: bool,
    ) -> Result<()> {
        let aligned_size = self.checked_size(*lba, size, aligned)?;
        if addr + aligned_size > buf.len() as u64 {
            return Err(ZnsError::invalid("section outside the buffer"));
        }
        if aligned_size != size {
            let lba_size = self.info.lba_size;
            let prefix = aligned_size - lba_size;
            let postfix = size - prefix;
            if prefix > 0 {
                self.flush_buffer_section(lba, buf, addr, prefix, true)?;
            }
            let mut spill = self
                .spill
                .take()
                .ok_or_else(|| ZnsError::invalid("spill buffer missing"))?;
            spill.fill(0);
            spill.as_mut_slice()[.. postfix as usize].copy_from_slice(
                &buf.as_slice()[(addr + prefix) as usize ..][.. postfix as usize],
            );
            let mut phys = self.lba_to_pba(*lba);
            let res = self.append_walk(&mut phys, &spill, 0, lba_size);
            self.spill = Some(spill);
            *lba = self.pba_to_lba(phys);
            res
        } else {
            let mut phys = self.lba_to_pba(*lba);
            let res = self.append_walk(&mut phys, buf, addr, aligned_size);
            *lba = self.pba_to_lba(phys);
            res
        }
    }

    /// Read into a caller-supplied DMA buffer, without copying. A sub-block
    /// tail is read through the spill buffer and partially copied out.
    pub fn read_into_buffer(
        &mut self,
        lba: u64,
        buf: &mut DmaBuf,
        addr: u64,
        size: u64,
        aligned: bool,
    ) -> Result<()> {
        let aligned_size = self.checked_size(lba, size, aligned)?;
        if addr + aligned_size > buf.len() as u64 {
            return Err(ZnsError::invalid("section outside the buffer"));
        }
        if aligned_size != size {
            let lba_size = self.info.lba_size;
            let prefix = aligned_size - lba_size;
            let postfix = size - prefix;
            if prefix > 0 {
                self.read_into_buffer(lba, buf, addr, prefix, true)?;
            }
            let mut spill = self
                .spill
                .take()
                .ok_or_else(|| ZnsError::invalid("spill buffer missing"))?;
            let tail_lba = lba + prefix / lba_size;
            let res = self.read_walk(
                self.lba_to_pba(tail_lba),
                &mut spill,
                0,
                lba_size,
            );
            if res.is_ok() {
                buf.as_mut_slice()[(addr + prefix) as usize ..]
                    [.. postfix as usize]
                    .copy_from_slice(&spill.as_slice()[.. postfix as usize]);
            }
            self.spill = Some(spill);
            res
        } else {
            self.read_walk(self.lba_to_pba(lba), buf, addr, aligned_size)
        }
    }

    /// Reset one zone, identified by its logical start address.
    pub fn reset_zone(&mut self, logical_slba: u64) -> Result<()> {
        if logical_slba % self.info.zone_cap != 0 {
            return Err(ZnsError::invalid("not a zone start"));
        }
        let phys = self.lba_to_pba(logical_slba);
        let idx = self.zone_index_of(phys)?;
        self.qpair.reset_zone(phys).map_err(ZnsError::from)?;
        self.zones[idx].wp = self.zones[idx].slba;
        self.zones_reset += 1;
        Ok(())
    }

    /// Reset every owned zone. Uses the device-wide reset when the window
    /// covers the whole device, per-zone resets otherwise.
    pub fn reset_all_zones(&mut self) -> Result<()> {
        if self.can_access_all {
            self.qpair.reset_all().map_err(ZnsError::from)?;
            for zone in self.zones.iter_mut() {
                zone.wp = zone.slba;
            }
            self.zones_reset += self.zones.len() as u64;
            Ok(())
        } else {
            for idx in 0 .. self.zones.len() {
                let phys = self.zones[idx].slba;
                self.qpair.reset_zone(phys).map_err(ZnsError::from)?;
                self.zones[idx].wp = phys;
                self.zones_reset += 1;
            }
            Ok(())
        }
    }

    /// Transition a zone to Full. The cache entry is left untouched: the
    /// next append on the zone fails at the device either way.
    pub fn finish_zone(&mut self, logical_slba: u64) -> Result<()> {
        if logical_slba % self.info.zone_cap != 0 {
            return Err(ZnsError::invalid("not a zone start"));
        }
        let phys = self.lba_to_pba(logical_slba);
        self.zone_index_of(phys)?;
        self.qpair.finish_zone(phys).map_err(ZnsError::from)
    }

    /// The logical write pointer of one zone, from a device report.
    pub fn zone_head(&mut self, logical_slba: u64) -> Result<u64> {
        let phys = self.lba_to_pba(logical_slba);
        self.zone_index_of(phys)?;
        let head = self.qpair.zone_head(phys).map_err(ZnsError::from)?;
        Ok(self.pba_to_lba(head))
    }

    /// Batched logical write pointers for the zones in
    /// `[first_slba, last_slba]` (both logical zone starts, inclusive).
    pub fn zone_heads(
        &mut self,
        first_slba: u64,
        last_slba: u64,
    ) -> Result<Vec<u64>> {
        let first = self.lba_to_pba(first_slba);
        let last = self.lba_to_pba(last_slba);
        self.zone_index_of(first)?;
        self.zone_index_of(last)?;
        let heads = self
            .qpair
            .zone_heads(first, last)
            .map_err(ZnsError::from)?;
        Ok(heads.into_iter().map(|h| self.pba_to_lba(h)).collect())
    }

    /// Re-read one cached write pointer from the device. Needed when a
    /// different channel reset zones inside this channel's window.
    pub fn refresh_zone_head(&mut self, logical_slba: u64) -> Result<()> {
        let phys = self.lba_to_pba(logical_slba);
        let idx = self.zone_index_of(phys)?;
        let head = self.qpair.zone_head(phys).map_err(ZnsError::from)?;
        self.zones[idx].wp = head;
        Ok(())
    }

    /// Re-read every cached write pointer from a batched device report.
    pub fn refresh_zone_heads(&mut self) -> Result<()> {
        if self.zones.is_empty() {
            return Ok(());
        }
        let heads = self
            .qpair
            .zone_heads(self.min_lba, self.max_lba - self.info.zone_size)
            .map_err(ZnsError::from)?;
        for (zone, head) in self.zones.iter_mut().zip(heads) {
            zone.wp = head;
        }
        Ok(())
    }

    /// Reap finished async writers and return a free slot, if any.
    pub fn find_free_writer(&mut self) -> Option<u32> {
        self.qpair.poll_once_raw();
        for writer in self.writers.iter_mut() {
            if writer.busy && writer.completion.is_done() {
                if writer.completion.code() != 0 {
                    self.async_error = Some(ZnsError::invalid(format!(
                        "async append completed with status {:#x}",
                        writer.completion.code()
                    )));
                }
                writer.busy = false;
            }
        }
        self.writers
            .iter()
            .position(|w| !w.busy)
            .map(|idx| idx as u32)
    }

    /// Pipelined append through the given writer slot. The payload must fit
    /// one append command and may not cross a zone boundary; the cached
    /// write pointer and `lba` advance optimistically at submission.
    /// Durability requires a later [`Channel::sync`].
    pub fn async_append(
        &mut self,
        lba: &mut u64,
        data: &[u8],
        writer: u32,
    ) -> Result<()> {
        let size = data.len() as u64;
        let aligned_size = self.checked_size(*lba, size, false)?;
        let blocks = aligned_size / self.info.lba_size;
        if aligned_size > self.info.zasl {
            return Err(ZnsError::invalid("async append larger than zasl"));
        }
        if *lba % self.info.zone_cap + blocks > self.info.zone_cap {
            return Err(ZnsError::invalid(
                "async append would cross a zone boundary",
            ));
        }
        let idx = writer as usize;
        if idx >= self.writers.len() || self.writers[idx].busy {
            return Err(ZnsError::invalid("writer slot unavailable"));
        }

        let phys = self.lba_to_pba(*lba);
        let zone_index = self.zone_index_of(phys)?;
        if self.zones[zone_index].wp != phys {
            return Err(ZnsError::invalid(
                "append does not start at the zone write pointer",
            ));
        }

        // Stage the payload in the slot's buffer; grown once, reused after.
        let engine = self.factory.engine();
        if self.writers[idx].buf.is_none() {
            self.writers[idx].buf =
                Some(engine.dma_alloc(aligned_size).map_err(ZnsError::from)?);
        }
        let buf = self.writers[idx].buf.as_mut().unwrap();
        buf.realloc(aligned_size).map_err(ZnsError::from)?;
        buf.as_mut_slice()[.. data.len()].copy_from_slice(data);
        buf.as_mut_slice()[data.len() .. aligned_size as usize].fill(0);

        self.writers[idx].completion.rearm();
        let zslba = self.zones[zone_index].slba;
        self.qpair
            .append_async(
                zslba,
                self.writers[idx].buf.as_ref().unwrap(),
                0,
                blocks,
                &self.writers[idx].completion,
            )
            .map_err(ZnsError::from)?;
        self.writers[idx].busy = true;
        self.zones[zone_index].wp += blocks;
        self.append_operations += 1;
        self.bytes_written += aligned_size;
        *lba += blocks;
        Ok(())
    }

    /// Drain every in-flight async writer on this channel and surface the
    /// first error observed since the previous sync.
    pub fn sync(&mut self) -> Result<()> {
        for writer in self.writers.iter_mut() {
            if writer.busy {
                if let Err(e) = self.qpair.poll_async(&writer.completion) {
                    self.async_error = Some(ZnsError::from(e));
                }
                writer.busy = false;
            }
            if !self.preserve_async_buffer {
                writer.buf = None;
            }
        }
        match self.async_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // diagnostics
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn append_operations(&self) -> u64 {
        self.append_operations
    }

    pub fn read_operations(&self) -> u64 {
        self.read_operations
    }

    pub fn zones_reset(&self) -> u64 {
        self.zones_reset
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // Outstanding appends keep referencing the slot buffers; reap them
        // before the buffers go away.
        for writer in self.writers.iter_mut() {
            if writer.busy {
                let _ = self.qpair.poll_async(&writer.completion);
                writer.busy = false;
            }
        }
        self.factory.release_slot();
    }
}
