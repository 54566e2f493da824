//! Arena of whole zones with a free-list allocator. An append claims as
//! many zones as the payload needs (possibly scattered over several
//! regions) and writes each region from its zone start; resetting a set of
//! regions returns their zones to the allocator.

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
    logs::free_list::FreeList,
};

/// One claimed region: `(begin_zone, zone_count)`.
pub type ZoneRegion = (u64, u64);

pub struct FragmentedLog {
    #[allow(dead_code)]
    factory: ChannelFactory,
    info: DeviceInfo,
    min_zone: u64,
    max_zone: u64,
    /// Usable bytes of one zone.
    zone_bytes: u64,
    freelist: FreeList,
    write_channel: Channel,
    read_channel: Channel,
}

impl FragmentedLog {
    pub fn new(
        factory: &ChannelFactory,
        min_zone: u64,
        max_zone: u64,
    ) -> Result<Self> {
        let info = factory.device_info();
        let min_zone = min_zone.max(info.min_zone());
        let max_zone = max_zone.min(info.max_zone());
        if min_zone >= max_zone {
            return Err(ZnsError::invalid("empty zone range"));
        }
        let bounded = ChannelOptions {
            min_zone: Some(min_zone),
            max_zone: Some(max_zone),
            ..Default::default()
        };
        Ok(FragmentedLog {
            factory: factory.clone(),
            info,
            min_zone,
            max_zone,
            zone_bytes: info.zone_cap * info.lba_size,
            freelist: FreeList::new(min_zone, max_zone),
            write_channel: factory.register_channel(bounded)?,
            read_channel: factory.register_channel(bounded)?,
        })
    }

    fn zones_needed(&self, aligned_size: u64) -> u64 {
        (aligned_size + self.zone_bytes - 1) / self.zone_bytes
    }

    /// Append caller memory, claiming zones from the allocator. Returns
    /// the claimed regions; the caller needs them to read the data back
    /// and to reset it later.
    pub fn append(
        &mut self,
        data: &[u8],
        aligned: bool,
    ) -> Result<Vec<ZoneRegion>> {
        let size = data.len() as u64;
        let aligned_size = if aligned {
            size
        } else {
            self.write_channel.align_size(size)
        };
        let zones_needed = self.zones_needed(aligned_size);
        if zones_needed > self.freelist.zones_left() {
            error!(
                zones_needed,
                left = self.freelist.zones_left(),
                "fragmented append does not fit"
            );
            return Err(ZnsError::invalid("not enough zones left"));
        }
        let regions = self.freelist.alloc_zones(zones_needed)?;

        let mut offset = 0u64;
        for (begin_zone, zone_count) in &regions {
            let mut slba = begin_zone * self.info.zone_cap;
            let mut bytes = zone_count * self.zone_bytes;
            let mut write_aligned = true;
            if bytes > size - offset {
                bytes = size - offset;
                write_aligned = aligned;
            }
            self.write_channel.direct_append(
                &mut slba,
                &data[offset as usize .. (offset + bytes) as usize],
                write_aligned,
            )?;
            offset += bytes;
        }
        Ok(regions)
    }

    /// Buffered variant of [`FragmentedLog::append`].
    pub fn append_buffer(
        &mut self,
        buffer: &DmaBuf,
        addr: u64,
        size: u64,
        aligned: bool,
    ) -> Result<Vec<ZoneRegion>> {
        if addr + size > buffer.len() as u64 {
            return Err(ZnsError::invalid("section outside the buffer"));
        }
        let aligned_size = if aligned {
            size
        } else {
            self.write_channel.align_size(size)
        };
        let zones_needed = self.zones_needed(aligned_size);
        if zones_needed > self.freelist.zones_left() {
            return Err(ZnsError::invalid("not enough zones left"));
        }
        let regions = self.freelist.alloc_zones(zones_needed)?;

        let mut offset = 0u64;
        for (begin_zone, zone_count) in &regions {
            let mut slba = begin_zone * self.info.zone_cap;
            let mut bytes = zone_count * self.zone_bytes;
            let mut write_aligned = true;
            if bytes > size - offset {
                bytes = size - offset;
                write_aligned = aligned;
            }
            self.write_channel.flush_buffer_section(
                &mut slba,
                buffer,
                addr + offset,
                bytes,
                write_aligned,
            )?;
            offset += bytes;
        }
        Ok(regions)
    }

    /// Read the contents of `regions` back into `data`, in region order.
    /// The last region carries the (possibly unaligned) tail.
    pub fn read(
        &mut self,
        regions: &[ZoneRegion],
        data: &mut [u8],
        aligned: bool,
    ) -> Result<()> {
        let size = data.len() as u64;
        let mut read = 0u64;
        for (begin_zone, zone_count) in regions {
            let mut bytes = zone_count * self.zone_bytes;
            let mut read_aligned = true;
            if size - read < bytes {
                bytes = size - read;
                read_aligned = aligned;
            }
            self.read_channel.direct_read(
                begin_zone * self.info.zone_cap,
                &mut data[read as usize .. (read + bytes) as usize],
                read_aligned,
            )?;
            read += bytes;
        }
        Ok(())
    }

    /// Reset every zone of each region and return the zones to the
    /// allocator.
    pub fn reset(&mut self, regions: &[ZoneRegion]) -> Result<()> {
        for (begin_zone, zone_count) in regions {
            let begin = begin_zone * self.info.zone_cap;
            let end = begin + zone_count * self.info.zone_cap;
            let mut slba = begin;
            while slba < end {
                self.write_channel.reset_zone(slba)?;
                slba += self.info.zone_cap;
            }
            let idx = self.freelist.find_region(*begin_zone)?;
            self.freelist.free_zones(idx)?;
        }
        Ok(())
    }

    /// Reset the whole window and reinitialize the allocator.
    pub fn reset_all(&mut self) -> Result<()> {
        let mut slba = self.min_zone * self.info.zone_cap;
        let end = self.max_zone * self.info.zone_cap;
        while slba < end {
            self.write_channel.reset_zone(slba)?;
            slba += self.info.zone_cap;
        }
        self.freelist = FreeList::new(self.min_zone, self.max_zone);
        Ok(())
    }

    /// Nothing to recover from the device: the allocator state is
    /// persisted through [`FragmentedLog::encode`] by the caller.
    pub fn recover(&mut self) -> Result<()> {
        Ok(())
    }

    pub fn empty(&self) -> bool {
        self.freelist.zones_left() == self.max_zone - self.min_zone
    }

    pub fn space_available(&self) -> u64 {
        self.freelist.zones_left() * self.zone_bytes
    }

    pub fn space_left(&self, size: u64, aligned: bool) -> bool {
        let aligned_size = if aligned {
            size
        } else {
            self.write_channel.align_size(size)
        };
        self.zones_needed(aligned_size) <= self.freelist.zones_left()
    }

    pub fn zones_left(&self) -> u64 {
        self.freelist.zones_left()
    }

    /// Serialize the allocator state.
    pub fn encode(&self) -> Vec<u8> {
        self.freelist.encode()
    }

    /// Replace the allocator state with a previously encoded one.
    pub fn decode_from(&mut self, data: &[u8]) -> Result<()> {
        self.freelist = FreeList::decode(data)?;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.write_channel.bytes_written()
    }

    pub fn bytes_read(&self) -> u64 {
        self.read_channel.bytes_read()
    }

    pub fn zones_reset(&self) -> u64 {
        self.write_channel.zones_reset()
    }
}
