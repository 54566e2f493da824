//! Write-once, read-many, reset-all log over a range of zones. Appends are
//! strictly sequential; pipelined appends are available through the write
//! channel's async writer slots.

use tracing::{error, warn};

use crate::{
    core::{
        Channel,
        ChannelFactory,
        ChannelOptions,
        DeviceInfo,
        DmaBuf,
        Result,
        ZnsError,
    },
    logs::ZnsLog,
};

/// How the once-log obtains its write channel: minted internally with the
/// given queue depth, or handed in by the caller (for sharing a preserved
/// async buffer configuration between log generations).
pub enum WriterConfig {
    QueueDepth(u32),
    Channel(Channel),
}

pub struct OnceLog {
    #[allow(dead_code)]
    factory: ChannelFactory,
    info: DeviceInfo,
    /// Logical bounds of the log.
    min_zone_head: u64,
    max_zone_head: u64,
    /// Blocks in the log when empty.
    block_range: u64,
    /// Bytes that can still be appended.
    space_left: u64,
    /// Logical write head; monotonically non-decreasing between resets.
    write_head: u64,
    zasl: u64,
    max_write_depth: u32,
    write_channel: Channel,
    read_reset_channel: Channel,
}

impl OnceLog {
    pub fn new(
        factory: &ChannelFactory,
        min_zone: u64,
        max_zone: u64,
        writer: WriterConfig,
    ) -> Result<Self> {
        let info = factory.device_info();
        let min_zone = min_zone.max(info.min_zone());
        let max_zone = max_zone.min(info.max_zone());
        if min_zone >= max_zone {
            return Err(ZnsError::invalid("empty zone range"));
        }
        let (write_channel, max_write_depth) = match writer {
            WriterConfig::QueueDepth(depth) => {
                let depth = if depth == 0 {
                    warn!("queue depth 0 requested, using 1");
                    1
                } else {
                    depth
                };
                let channel = factory.register_channel(ChannelOptions {
                    min_zone: Some(min_zone),
                    max_zone: Some(max_zone),
                    preserve_async_buffer: true,
                    queue_depth: depth,
                })?;
                (channel, depth)
            }
            WriterConfig::Channel(channel) => {
                let depth = channel.queue_depth();
                (channel, depth)
            }
        };
        let read_reset_channel = factory.register_channel(ChannelOptions {
            min_zone: Some(min_zone),
            max_zone: Some(max_zone),
            ..Default::default()
        })?;
        let block_range = (max_zone - min_zone) * info.zone_cap;
        Ok(OnceLog {
            factory: factory.clone(),
            info,
            min_zone_head: min_zone * info.zone_cap,
            max_zone_head: max_zone * info.zone_cap,
            block_range,
            space_left: block_range * info.lba_size,
            write_head: min_zone * info.zone_cap,
            zasl: info.zasl,
            max_write_depth,
            write_channel,
            read_reset_channel,
        })
    }

    pub fn max_write_depth(&self) -> u32 {
        self.max_write_depth
    }

    /// A borrow of the write channel, e.g. to inspect its zone cache.
    pub fn write_channel(&self) -> &Channel {
        &self.write_channel
    }

    fn is_valid_address(&self, lba: u64, blocks: u64) -> bool {
        lba >= self.min_zone_head && lba + blocks <= self.write_head
    }

    /// Pipelined append. Payloads that exceed one append command or would
    /// cross a zone boundary fall back to draining the writers and
    /// appending synchronously. Durability requires [`OnceLog::sync`].
    pub fn async_append(
        &mut self,
        data: &[u8],
        aligned: bool,
    ) -> Result<u64> {
        let size = data.len() as u64;
        if !self.space_left(size, aligned) {
            error!("async append of {size} bytes: no space left");
            return Err(ZnsError::out_of_space("once log is full"));
        }
        let aligned_size = self.write_channel.align_size(size);
        let blocks_needed = aligned_size / self.info.lba_size;
        let zone_end = (self.write_head / self.info.zone_cap)
            * self.info.zone_cap
            + self.info.zone_cap;
        let can_do_async = blocks_needed <= self.zasl / self.info.lba_size
            && self.write_head + blocks_needed < zone_end;

        if !can_do_async {
            self.sync()?;
            let old = self.write_head;
            let res = self.write_channel.direct_append(
                &mut self.write_head,
                data,
                aligned,
            );
            let blocks = self.write_head - old;
            self.space_left -= blocks * self.info.lba_size;
            return res.map(|_| blocks);
        }

        // Spin until one of the writer slots frees up.
        let slot = loop {
            if let Some(slot) = self.write_channel.find_free_writer() {
                break slot;
            }
        };
        self.write_channel
            .async_append(&mut self.write_head, data, slot)?;
        self.space_left -= blocks_needed * self.info.lba_size;
        Ok(blocks_needed)
    }

    /// Drain all in-flight appends on the write channel.
    pub fn sync(&mut self) -> Result<()> {
        self.write_channel.sync()
    }

    /// The bytes in `[write_tail, write_head)` as a freshly allocated
    /// sequence.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let size = (self.write_head - self.min_zone_head) * self.info.lba_size;
        if size == 0 {
            return Ok(Vec::new());
        }
        let mut data = vec![0u8; size as usize];
        self.read_reset_channel.direct_read(
            self.min_zone_head,
            &mut data,
            true,
        )?;
        Ok(data)
    }

    /// Reset the entire window, also past the write head.
    pub fn reset_all_force(&mut self) -> Result<()> {
        self.read_reset_channel.reset_all_zones()?;
        self.write_channel.refresh_zone_heads()?;
        self.write_head = self.min_zone_head;
        self.space_left = self.block_range * self.info.lba_size;
        Ok(())
    }

    /// Finish the zone under the write head so it stops counting against
    /// the active-zone limit; the head moves to the next zone start and
    /// the skipped blocks are gone.
    pub fn mark_inactive(&mut self) -> Result<()> {
        if self.write_head % self.info.zone_cap != 0 {
            let zone_start =
                (self.write_head / self.info.zone_cap) * self.info.zone_cap;
            let wasted = zone_start + self.info.zone_cap - self.write_head;
            self.read_reset_channel.finish_zone(zone_start)?;
            self.space_left -= wasted * self.info.lba_size;
            self.write_head += wasted;
        }
        Ok(())
    }
}

impl ZnsLog for OnceLog {
    fn append(&mut self, data: &[u8], aligned: bool) -> Result<u64> {
        if !self.space_left(data.len() as u64, aligned) {
            error!("append of {} bytes: no space left", data.len());
            return Err(ZnsError::out_of_space("once log is full"));
        }
        let old = self.write_head;
        let res =
            self.write_channel
                .direct_append(&mut self.write_head, data, aligned);
        let blocks = self.write_head - old;
        self.space_left -= blocks * self.info.lba_size;
        res.map(|_| blocks)
    }

    fn append_buffer(&mut self, buffer: &DmaBuf) -> Result<u64> {
        self.append_buffer_section(buffer, 0, buffer.len() as u64, true)
    }

    fn append_buffer_section(
        &mut self,
        buffer: &DmaBuf,
        addr: u64,
        size: u64,
        aligned: bool,
    ) -> Result<u64> {
        if !self.space_left(size, aligned) {
            error!("buffered append of {size} bytes: no space left");
            return Err(ZnsError::out_of_space("once log is full"));
        }
        let old = self.write_head;
        let res = self.write_channel.flush_buffer_section(
            &mut self.write_head,
            buffer,
            addr,
            size,
            aligned,
        );
        let blocks = self.write_head - old;
        self.space_left -= blocks * self.info.lba_size;
        res.map(|_| blocks)
    }

    fn read(
        &mut self,
        lba: u64,
        data: &mut [u8],
        aligned: bool,
        _reader: u8,
    ) -> Result<()> {
        let blocks = self.read_reset_channel.align_size(data.len() as u64)
            / self.info.lba_size;
        if !self.is_valid_address(lba, blocks) {
            return Err(ZnsError::invalid("read beyond the write head"));
        }
        self.read_reset_channel.direct_read(lba, data, aligned)
    }

    fn read_into_buffer(
        &mut self,
        lba: u64,
        buffer: &mut DmaBuf,
        addr: u64,
        size: u64,
        aligned: bool,
        _reader: u8,
    ) -> Result<()> {
        let blocks =
            self.read_reset_channel.align_size(size) / self.info.lba_size;
        if !self.is_valid_address(lba, blocks) {
            return Err(ZnsError::invalid("read beyond the write head"));
        }
        self.read_reset_channel
            .read_into_buffer(lba, buffer, addr, size, aligned)
    }

    fn reset_all(&mut self) -> Result<()> {
        let mut slba = self.min_zone_head;
        while slba < self.max_zone_head && slba < self.write_head {
            self.read_reset_channel.reset_zone(slba)?;
            slba += self.info.zone_cap;
        }
        self.write_channel.refresh_zone_heads()?;
        self.write_head = self.min_zone_head;
        self.space_left = self.block_range * self.info.lba_size;
        Ok(())
    }

    fn recover_pointers(&mut self) -> Result<()> {
        let mut write_head = self.min_zone_head;
        let mut slba = self.min_zone_head;
        while slba < self.max_zone_head {
            let zone_head = self.read_reset_channel.zone_head(slba)?;
            // the head is in the last zone that is not empty
            if zone_head > slba {
                write_head = zone_head;
            }
            // the end of the written run has been reached
            if zone_head == slba {
                break;
            }
            slba += self.info.zone_cap;
        }
        self.write_channel.refresh_zone_heads()?;
        self.write_head = write_head;
        self.space_left =
            (self.max_zone_head - write_head) * self.info.lba_size;
        Ok(())
    }

    fn empty(&self) -> bool {
        self.write_head == self.min_zone_head
    }

    fn space_available(&self) -> u64 {
        self.space_left
    }

    fn space_left(&self, size: u64, aligned: bool) -> bool {
        let bytes = if aligned {
            size
        } else {
            self.write_channel.align_size(size)
        };
        bytes <= self.space_left
    }

    fn write_head(&self) -> u64 {
        self.write_head
    }

    fn write_tail(&self) -> u64 {
        self.min_zone_head
    }

    fn bytes_written(&self) -> u64 {
        self.write_channel.bytes_written()
            + self.read_reset_channel.bytes_written()
    }

    fn bytes_read(&self) -> u64 {
        self.write_channel.bytes_read()
            + self.read_reset_channel.bytes_read()
    }

    fn zones_reset(&self) -> u64 {
        self.write_channel.zones_reset()
            + self.read_reset_channel.zones_reset()
    }
}

impl Drop for OnceLog {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            use crate::core::VerboseError;
            error!("dropping once log with failed appends: {}", e.verbose());
        }
    }
}
