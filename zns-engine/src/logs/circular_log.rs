//! FIFO log with in-place wraparound. The readable region is the interval
//! from the write tail to the write head modulo the window; consuming the
//! tail reclaims whole zones. Multiple readers are supported, each with an
//! independent read channel.

use tracing::error;

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

pub struct CircularLog {
    #[allow(dead_code)]
    factory: ChannelFactory,
    info: DeviceInfo,
    /// Logical bounds of the log.
    min_zone_head: u64,
    max_zone_head: u64,
    /// Logical head and tail; both wrap within the bounds. The readable
    /// region is `[write_tail, write_head)` in the non-wrapped regime, and
    /// everything outside `(write_head, write_tail)` when wrapped.
    write_head: u64,
    write_tail: u64,
    /// Start of the oldest zone that has not been reset yet;
    /// `zone_tail <= write_tail`.
    zone_tail: u64,
    space_left: u64,
    read_channels: Vec<Channel>,
    write_channel: Channel,
    reset_channel: Channel,
}

impl CircularLog {
    pub fn new(
        factory: &ChannelFactory,
        min_zone: u64,
        max_zone: u64,
        readers: u8,
    ) -> Result<Self> {
        let info = factory.device_info();
        let min_zone = min_zone.max(info.min_zone());
        let max_zone = max_zone.min(info.max_zone());
        if min_zone >= max_zone {
            return Err(ZnsError::invalid("empty zone range"));
        }
        if readers == 0 {
            return Err(ZnsError::invalid("at least one reader is required"));
        }
        let bounded = ChannelOptions {
            min_zone: Some(min_zone),
            max_zone: Some(max_zone),
            ..Default::default()
        };
        let read_channels = (0 .. readers)
            .map(|_| factory.register_channel(bounded))
            .collect::<Result<Vec<_>>>()?;
        let write_channel = factory.register_channel(bounded)?;
        let reset_channel = factory.register_channel(bounded)?;
        let min_zone_head = min_zone * info.zone_cap;
        let max_zone_head = max_zone * info.zone_cap;
        Ok(CircularLog {
            factory: factory.clone(),
            info,
            min_zone_head,
            max_zone_head,
            write_head: min_zone_head,
            write_tail: min_zone_head,
            zone_tail: min_zone_head,
            space_left: (max_zone_head - min_zone_head) * info.lba_size,
            read_channels,
            write_channel,
            reset_channel,
        })
    }

    pub fn readers(&self) -> u8 {
        self.read_channels.len() as u8
    }

    pub fn zone_tail(&self) -> u64 {
        self.zone_tail
    }

    /// Whether `[addr, addr + blocks)` lies in the readable region of the
    /// current head/tail snapshot.
    fn is_valid_read_address(&self, addr: u64, blocks: u64) -> bool {
        let head = self.write_head;
        let tail = self.write_tail;
        if head >= tail {
            // [---------------T^^^^H--]
            if addr < tail || addr + blocks > head {
                return false;
            }
        } else {
            // [^^^^^^^^^^^^^^^H---T^^]
            if (addr > head && addr < tail)
                || (addr + blocks > head && addr + blocks < tail)
            {
                return false;
            }
        }
        true
    }

    /// Reclaim `[begin_lba, end_lba)`, which must start at the current
    /// write tail. `end_lba < begin_lba` is a wrapping consume. Zones whose
    /// blocks are entirely consumed are reset and their space returns to
    /// the writer.
    pub fn consume_tail(
        &mut self,
        begin_lba: u64,
        mut end_lba: u64,
    ) -> Result<()> {
        if begin_lba != self.write_tail || end_lba < self.min_zone_head {
            return Err(ZnsError::invalid(
                "consume must start at the write tail",
            ));
        }
        // A consume across the window end is forced to wrap; unfold it and
        // handle the wrap manually below.
        if end_lba < begin_lba {
            end_lba = end_lba - self.min_zone_head + self.max_zone_head;
        }
        if end_lba > self.max_zone_head {
            self.consume_tail(begin_lba, self.max_zone_head)?;
            end_lba = end_lba - self.max_zone_head + self.min_zone_head;
            return self.consume_tail(self.min_zone_head, end_lba);
        }

        // The consumed range may not run past the head.
        let head = self.write_head;
        let tail = self.write_tail;
        if (tail <= head && end_lba > head)
            || (tail > head && end_lba > head && end_lba < tail)
        {
            return Err(ZnsError::invalid("consume beyond the write head"));
        }

        let cur_zone = (end_lba / self.info.zone_cap) * self.info.zone_cap;
        let mut slba = self.zone_tail;
        while slba != cur_zone {
            self.reset_channel.reset_zone(slba)?;
            // the writer appends into reclaimed zones after wrapping, so
            // its cached write pointer must follow the reset
            self.write_channel.refresh_zone_head(slba)?;
            self.space_left += self.info.zone_cap * self.info.lba_size;
            slba += self.info.zone_cap;
        }
        self.zone_tail = cur_zone;

        let mut new_tail = end_lba;
        if new_tail == self.max_zone_head {
            self.zone_tail = self.min_zone_head;
            new_tail = self.min_zone_head;
        }
        self.write_tail = new_tail;
        Ok(())
    }

    fn recalculate_space_left(&mut self) {
        let space = if self.write_head >= self.write_tail {
            // [^^^^ZT--WT----------WH^^^^]
            let space_end = self.max_zone_head - self.write_head;
            let space_begin = self.zone_tail - self.min_zone_head;
            space_begin + space_end
        } else {
            // [---WH^^^^^^^^ZT----WT---]
            self.zone_tail - self.write_head
        };
        self.space_left = space * self.info.lba_size;
    }

    fn append_phases<F>(&mut self, size: u64, aligned: bool, mut phase: F) -> Result<u64>
    where
        F: FnMut(&mut Channel, &mut u64, u64, u64, bool) -> Result<()>,
    {
        let aligned_size = if aligned {
            size
        } else {
            self.write_channel.align_size(size)
        };
        if !ZnsLog::space_left(self, aligned_size, true) {
            error!("circular append of {size} bytes: out of space");
            return Err(ZnsError::out_of_space("circular log is full"));
        }
        let lbas = aligned_size / self.info.lba_size;
        let mut new_write_head = self.write_head;
        if new_write_head + lbas > self.max_zone_head
            && self.write_tail > self.min_zone_head
        {
            // Two phases: up to the window end, then wrap to its start.
            // The head is only published after both phases succeeded.
            let first_phase =
                (self.max_zone_head - new_write_head) * self.info.lba_size;
            phase(
                &mut self.write_channel,
                &mut new_write_head,
                0,
                first_phase,
                true,
            )?;
            new_write_head = self.min_zone_head;
            phase(
                &mut self.write_channel,
                &mut new_write_head,
                first_phase,
                size - first_phase,
                aligned,
            )?;
        } else {
            phase(&mut self.write_channel, &mut new_write_head, 0, size, aligned)?;
        }
        self.space_left -= lbas * self.info.lba_size;
        self.write_head = new_write_head;
        Ok(lbas)
    }
}

impl ZnsLog for CircularLog {
    fn append(&mut self, data: &[u8], aligned: bool) -> Result<u64> {
        self.append_phases(
            data.len() as u64,
            aligned,
            |channel, head, offset, size, aligned| {
                channel.direct_append(
                    head,
                    &data[offset as usize .. (offset + size) as usize],
                    aligned,
                )
            },
        )
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
        self.append_phases(
            size,
            aligned,
            |channel, head, offset, size, aligned| {
                channel.flush_buffer_section(
                    head,
                    buffer,
                    addr + offset,
                    size,
                    aligned,
                )
            },
        )
    }

    fn read(
        &mut self,
        lba: u64,
        data: &mut [u8],
        aligned: bool,
        reader: u8,
    ) -> Result<()> {
        if reader as usize >= self.read_channels.len() {
            return Err(ZnsError::invalid("no such reader"));
        }
        // Wrapped callers may address past the window end.
        if lba > self.max_zone_head {
            return self.read(
                lba - self.max_zone_head + self.min_zone_head,
                data,
                aligned,
                reader,
            );
        }
        let channel = &mut self.read_channels[reader as usize];
        let aligned_size = if aligned {
            data.len() as u64
        } else {
            channel.align_size(data.len() as u64)
        };
        let lbas = aligned_size / self.info.lba_size;
        if !self.is_valid_read_address(lba, lbas) {
            return Err(ZnsError::invalid("address not readable"));
        }
        if self.write_head < self.write_tail && lba + lbas > self.max_zone_head
        {
            // Wrapped read: split at the window boundary.
            let first_phase =
                ((self.max_zone_head - lba) * self.info.lba_size) as usize;
            let channel = &mut self.read_channels[reader as usize];
            channel.direct_read(lba, &mut data[.. first_phase], true)?;
            channel.direct_read(
                self.min_zone_head,
                &mut data[first_phase ..],
                aligned,
            )
        } else {
            let channel = &mut self.read_channels[reader as usize];
            channel.direct_read(lba, data, aligned)
        }
    }

    fn read_into_buffer(
        &mut self,
        lba: u64,
        buffer: &mut DmaBuf,
        addr: u64,
        size: u64,
        aligned: bool,
        reader: u8,
    ) -> Result<()> {
        if reader as usize >= self.read_channels.len() {
            return Err(ZnsError::invalid("no such reader"));
        }
        if lba > self.max_zone_head {
            return self.read_into_buffer(
                lba - self.max_zone_head + self.min_zone_head,
                buffer,
                addr,
                size,
                aligned,
                reader,
            );
        }
        let channel = &mut self.read_channels[reader as usize];
        let aligned_size = if aligned {
            size
        } else {
            channel.align_size(size)
        };
        let lbas = aligned_size / self.info.lba_size;
        if !self.is_valid_read_address(lba, lbas) {
            return Err(ZnsError::invalid("address not readable"));
        }
        if self.write_head < self.write_tail && lba + lbas > self.max_zone_head
        {
            let first_phase = (self.max_zone_head - lba) * self.info.lba_size;
            let channel = &mut self.read_channels[reader as usize];
            channel.read_into_buffer(lba, buffer, addr, first_phase, true)?;
            channel.read_into_buffer(
                self.min_zone_head,
                buffer,
                addr + first_phase,
                size - first_phase,
                aligned,
            )
        } else {
            let channel = &mut self.read_channels[reader as usize];
            channel.read_into_buffer(lba, buffer, addr, size, aligned)
        }
    }

    fn reset_all(&mut self) -> Result<()> {
        // The window rarely covers the whole device; reset zone by zone.
        let mut slba = self.min_zone_head;
        while slba < self.max_zone_head {
            self.reset_channel.reset_zone(slba)?;
            slba += self.info.zone_cap;
        }
        self.write_channel.refresh_zone_heads()?;
        self.write_head = self.min_zone_head;
        self.write_tail = self.min_zone_head;
        self.zone_tail = self.min_zone_head;
        self.space_left =
            (self.max_zone_head - self.min_zone_head) * self.info.lba_size;
        Ok(())
    }

    fn recover_pointers(&mut self) -> Result<()> {
        let zone_cap = self.info.zone_cap;
        let heads = self.reset_channel.zone_heads(
            self.min_zone_head,
            self.max_zone_head - zone_cap,
        )?;
        let expected =
            ((self.max_zone_head - self.min_zone_head) / zone_cap) as usize;
        if heads.len() != expected {
            error!(
                got = heads.len(),
                expected, "zone report did not return all heads"
            );
            return Err(ZnsError::Unknown {});
        }
        let head_of =
            |slba: u64| heads[((slba - self.min_zone_head) / zone_cap) as usize];

        let mut log_tail = self.min_zone_head;
        let mut log_head = self.min_zone_head;

        // The tail is at the first zone that is not empty.
        let mut slba = self.min_zone_head;
        let mut old_zone_head = self.min_zone_head;
        while slba < self.max_zone_head {
            let zone_head = head_of(slba);
            old_zone_head = zone_head;
            if zone_head > slba {
                log_tail = slba;
                // The head might live here too if exactly one zone holds
                // data.
                log_head = zone_head;
                break;
            }
            slba += zone_cap;
        }
        // The head is at the first zone after the tail that is neither
        // empty nor filled to its end, or at the first empty zone after a
        // run of full ones.
        while slba < self.max_zone_head {
            let zone_head = head_of(slba);
            if zone_head > slba && zone_head < slba + zone_cap {
                log_head = zone_head;
                break;
            }
            if zone_head == slba && old_zone_head == slba {
                log_head = slba;
                break;
            }
            old_zone_head = zone_head;
            slba += zone_cap;
        }
        // In the wrapped regime the first non-empty zone found above was
        // the head area, not the tail; the real tail starts after the
        // hole.
        if log_head > self.min_zone_head && log_tail == self.min_zone_head {
            slba += zone_cap;
            while slba < self.max_zone_head {
                if head_of(slba) > slba {
                    log_tail = slba;
                    break;
                }
                slba += zone_cap;
            }
        }
        self.write_channel.refresh_zone_heads()?;
        self.write_head = log_head;
        self.write_tail = log_tail;
        self.zone_tail = log_tail;
        self.recalculate_space_left();
        Ok(())
    }

    fn empty(&self) -> bool {
        self.write_head == self.write_tail
            && self.space_left
                == (self.max_zone_head - self.min_zone_head)
                    * self.info.lba_size
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
        self.write_tail
    }

    fn bytes_written(&self) -> u64 {
        self.write_channel.bytes_written()
    }

    fn bytes_read(&self) -> u64 {
        self.read_channels.iter().map(|c| c.bytes_read()).sum()
    }

    fn zones_reset(&self) -> u64 {
        self.reset_channel.zones_reset()
    }
}
