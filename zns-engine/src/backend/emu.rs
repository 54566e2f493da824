//! RAM-backed ZNS device emulation. Behaves like a real zoned namespace at
//! the engine boundary: sequential-only appends, per-zone write pointers
//! and conditions, MDTS/ZASL transfer caps and poll-reaped completions.
//! The whole test suite runs against this engine; it is also handy as a
//! stand-in device for consumers that want the semantics without hardware.
//!
//! The device is selected with an `emu://` transport address whose query
//! string overrides the default geometry, e.g.
//! `emu://mem0?zones=40&zone_size=64&zone_cap=64&lba_size=4096`.

use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use tracing::debug;
use url::Url;

use crate::{
    backend::{BackendKind, Completion, IoEngine, IoQueue},
    core::{DeviceInfo, DmaBuf, DmaError, EngineError},
};

/// NVMe ZNS command-specific status codes surfaced by the emulation.
const SC_ZONE_BOUNDARY: i32 = 0xb8;
const SC_ZONE_FULL: i32 = 0xb9;
const SC_ZONE_INVALID_WRITE: i32 = 0xbc;

#[derive(Debug, Clone, Copy)]
struct EmuGeometry {
    lba_size: u64,
    zone_size: u64,
    zone_cap: u64,
    num_zones: u64,
    mdts: u64,
    zasl: u64,
}

impl Default for EmuGeometry {
    fn default() -> Self {
        EmuGeometry {
            lba_size: 4096,
            zone_size: 64,
            zone_cap: 64,
            num_zones: 64,
            mdts: 128 * 1024,
            zasl: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ZoneCond {
    Empty,
    Open,
    Full,
    /// Finished before the write pointer reached the zone capacity.
    Finished,
}

struct EmuZone {
    slba: u64,
    wp: u64,
    cond: ZoneCond,
    data: Box<[u8]>,
}

impl EmuZone {
    fn reset(&mut self) {
        self.wp = self.slba;
        self.cond = ZoneCond::Empty;
        self.data.fill(0);
    }
}

struct EmuState {
    geo: EmuGeometry,
    zones: Vec<EmuZone>,
}

impl EmuState {
    fn new(geo: EmuGeometry) -> Self {
        let zone_bytes = (geo.zone_cap * geo.lba_size) as usize;
        let zones = (0 .. geo.num_zones)
            .map(|z| EmuZone {
                slba: z * geo.zone_size,
                wp: z * geo.zone_size,
                cond: ZoneCond::Empty,
                data: vec![0u8; zone_bytes].into_boxed_slice(),
            })
            .collect();
        EmuState {
            geo,
            zones,
        }
    }

    fn zone_index(&self, phys_lba: u64) -> Result<usize, EngineError> {
        let idx = phys_lba / self.geo.zone_size;
        if idx >= self.geo.num_zones {
            return Err(EngineError::ReadFailed {
                lba: phys_lba,
                code: SC_ZONE_BOUNDARY,
            });
        }
        Ok(idx as usize)
    }

    /// Execute one append against the zone starting at `zslba`, returning
    /// the NVMe status code the device would post.
    fn do_append(&mut self, zslba: u64, blocks: u64, src: &[u8]) -> i32 {
        let geo = self.geo;
        if zslba % geo.zone_size != 0 || zslba / geo.zone_size >= geo.num_zones
        {
            return SC_ZONE_INVALID_WRITE;
        }
        if blocks * geo.lba_size > geo.zasl {
            return SC_ZONE_INVALID_WRITE;
        }
        let zone = &mut self.zones[(zslba / geo.zone_size) as usize];
        match zone.cond {
            ZoneCond::Full | ZoneCond::Finished => return SC_ZONE_FULL,
            _ => {}
        }
        if zone.wp + blocks > zone.slba + geo.zone_cap {
            return SC_ZONE_BOUNDARY;
        }
        let at = ((zone.wp - zone.slba) * geo.lba_size) as usize;
        let bytes = (blocks * geo.lba_size) as usize;
        zone.data[at .. at + bytes].copy_from_slice(&src[.. bytes]);
        zone.wp += blocks;
        zone.cond = if zone.wp == zone.slba + geo.zone_cap {
            ZoneCond::Full
        } else {
            ZoneCond::Open
        };
        0
    }

    /// What a zone report descriptor would carry as the write pointer.
    fn reported_head(&self, idx: usize) -> u64 {
        let zone = &self.zones[idx];
        match zone.cond {
            // A finished zone reports an invalid pointer; mirror the
            // clamped form the report path would produce.
            ZoneCond::Finished => zone.slba + self.geo.zone_size,
            _ => zone.wp,
        }
    }
}

/// The emulated engine: geometry plus zone state shared by every minted
/// queue pair.
pub struct EmuEngine {
    state: Arc<Mutex<EmuState>>,
    geo: EmuGeometry,
}

impl EmuEngine {
    pub fn open(traddr: &str) -> Result<Self, EngineError> {
        let url = Url::parse(traddr).map_err(|e| EngineError::OpenFailed {
            name: traddr.to_string(),
            reason: format!("invalid transport address: {e}"),
        })?;
        if url.scheme() != "emu" {
            return Err(EngineError::OpenFailed {
                name: traddr.to_string(),
                reason: "expected an emu:// transport address".into(),
            });
        }
        let mut geo = EmuGeometry::default();
        for (key, value) in url.query_pairs() {
            let value: u64 =
                value.parse().map_err(|_| EngineError::OpenFailed {
                    name: traddr.to_string(),
                    reason: format!("parameter {key} is not a number"),
                })?;
            match key.as_ref() {
                "lba_size" => geo.lba_size = value,
                "zone_size" => geo.zone_size = value,
                "zone_cap" => geo.zone_cap = value,
                "zones" => geo.num_zones = value,
                "mdts" => geo.mdts = value,
                "zasl" => geo.zasl = value,
                other => {
                    return Err(EngineError::OpenFailed {
                        name: traddr.to_string(),
                        reason: format!("unknown parameter {other}"),
                    })
                }
            }
        }
        if geo.lba_size == 0
            || !geo.lba_size.is_power_of_two()
            || geo.zone_cap == 0
            || geo.zone_cap > geo.zone_size
            || geo.num_zones == 0
        {
            return Err(EngineError::OpenFailed {
                name: traddr.to_string(),
                reason: "inconsistent geometry".into(),
            });
        }
        debug!(?traddr, "opening emulated zoned namespace");
        Ok(EmuEngine {
            state: Arc::new(Mutex::new(EmuState::new(geo))),
            geo,
        })
    }
}

impl IoEngine for EmuEngine {
    fn kind(&self) -> BackendKind {
        BackendKind::Emulated
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            lba_size: self.geo.lba_size,
            zone_size: self.geo.zone_size,
            zone_cap: self.geo.zone_cap,
            mdts: self.geo.mdts,
            zasl: self.geo.zasl,
            lba_cap: self.geo.num_zones * self.geo.zone_size,
            min_lba: 0,
            max_lba: self.geo.num_zones * self.geo.zone_size,
            nsid: 1,
            min_page_size: 4096,
        }
    }

    fn create_qpair(&self) -> Result<Box<dyn IoQueue>, EngineError> {
        Ok(Box::new(EmuQueue {
            state: self.state.clone(),
            geo: self.geo,
            pending: VecDeque::new(),
        }))
    }

    fn dma_alloc(&self, size: u64) -> Result<DmaBuf, DmaError> {
        DmaBuf::new(size, self.geo.lba_size)
    }
}

/// One emulated queue pair: a handle on the shared zone state plus the
/// completion queue of its in-flight submissions.
struct EmuQueue {
    state: Arc<Mutex<EmuState>>,
    geo: EmuGeometry,
    pending: VecDeque<(Arc<Completion>, i32)>,
}

impl EmuQueue {
    fn reap_one(&mut self) -> bool {
        match self.pending.pop_front() {
            Some((completion, code)) => {
                completion.complete(code);
                true
            }
            None => false,
        }
    }
}

impl IoQueue for EmuQueue {
    fn read(
        &mut self,
        phys_lba: u64,
        buf: &mut DmaBuf,
        offset: u64,
        blocks: u64,
    ) -> Result<(), EngineError> {
        let state = self.state.lock();
        let geo = state.geo;
        let bytes = (blocks * geo.lba_size) as usize;
        if blocks * geo.lba_size > geo.mdts
            || offset as usize + bytes > buf.len()
        {
            return Err(EngineError::ReadFailed {
                lba: phys_lba,
                code: SC_ZONE_INVALID_WRITE,
            });
        }
        let idx = state.zone_index(phys_lba)?;
        let zone = &state.zones[idx];
        let in_zone = phys_lba - zone.slba;
        if in_zone + blocks > geo.zone_cap {
            return Err(EngineError::ReadFailed {
                lba: phys_lba,
                code: SC_ZONE_BOUNDARY,
            });
        }
        let at = (in_zone * geo.lba_size) as usize;
        buf.as_mut_slice()[offset as usize .. offset as usize + bytes]
            .copy_from_slice(&zone.data[at .. at + bytes]);
        Ok(())
    }

    fn write(
        &mut self,
        phys_lba: u64,
        buf: &DmaBuf,
        offset: u64,
        blocks: u64,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let geo = state.geo;
        let idx = state.zone_index(phys_lba)?;
        // Writes must land exactly on the write pointer; everything else is
        // an invalid write on a zoned namespace.
        if state.zones[idx].wp != phys_lba {
            return Err(EngineError::AppendFailed {
                lba: phys_lba,
                code: SC_ZONE_INVALID_WRITE,
            });
        }
        let zslba = state.zones[idx].slba;
        let bytes = (blocks * geo.lba_size) as usize;
        let code = state.do_append(
            zslba,
            blocks,
            &buf.as_slice()[offset as usize .. offset as usize + bytes],
        );
        if code != 0 {
            return Err(EngineError::AppendFailed {
                lba: phys_lba,
                code,
            });
        }
        Ok(())
    }

    fn append(
        &mut self,
        phys_zslba: u64,
        buf: &DmaBuf,
        offset: u64,
        blocks: u64,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let bytes = (blocks * self.geo.lba_size) as usize;
        if offset as usize + bytes > buf.len() {
            return Err(EngineError::AppendFailed {
                lba: phys_zslba,
                code: SC_ZONE_INVALID_WRITE,
            });
        }
        let code = state.do_append(
            phys_zslba,
            blocks,
            &buf.as_slice()[offset as usize .. offset as usize + bytes],
        );
        if code != 0 {
            return Err(EngineError::AppendFailed {
                lba: phys_zslba,
                code,
            });
        }
        Ok(())
    }

    fn append_async(
        &mut self,
        phys_zslba: u64,
        buf: &DmaBuf,
        offset: u64,
        blocks: u64,
        completion: &Arc<Completion>,
    ) -> Result<(), EngineError> {
        let bytes = (blocks * self.geo.lba_size) as usize;
        if offset as usize + bytes > buf.len() {
            return Err(EngineError::AppendFailed {
                lba: phys_zslba,
                code: SC_ZONE_INVALID_WRITE,
            });
        }
        // The emulated device "executes" at submission; the completion is
        // still only observable through a poll, as on hardware.
        let code = self.state.lock().do_append(
            phys_zslba,
            blocks,
            &buf.as_slice()[offset as usize .. offset as usize + bytes],
        );
        self.pending.push_back((completion.clone(), code));
        Ok(())
    }

    fn poll_async(
        &mut self,
        completion: &Completion,
    ) -> Result<(), EngineError> {
        while !completion.is_done() {
            if !self.reap_one() {
                return Err(EngineError::PollFailed {
                    code: -1,
                });
            }
        }
        if completion.code() != 0 {
            return Err(EngineError::PollFailed {
                code: completion.code(),
            });
        }
        Ok(())
    }

    fn poll_once(
        &mut self,
        completion: &Completion,
    ) -> Result<(), EngineError> {
        if !completion.is_done() {
            self.reap_one();
        }
        if completion.is_done() && completion.code() != 0 {
            return Err(EngineError::PollFailed {
                code: completion.code(),
            });
        }
        Ok(())
    }

    fn poll_once_raw(&mut self) {
        self.reap_one();
    }

    fn reset_zone(&mut self, phys_slba: u64) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if phys_slba % state.geo.zone_size != 0 {
            return Err(EngineError::ResetFailed {
                slba: phys_slba,
                code: SC_ZONE_INVALID_WRITE,
            });
        }
        let idx = state.zone_index(phys_slba).map_err(|_| {
            EngineError::ResetFailed {
                slba: phys_slba,
                code: SC_ZONE_BOUNDARY,
            }
        })?;
        state.zones[idx].reset();
        Ok(())
    }

    fn reset_all(&mut self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        for zone in state.zones.iter_mut() {
            zone.reset();
        }
        Ok(())
    }

    fn finish_zone(&mut self, phys_slba: u64) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let idx = state.zone_index(phys_slba).map_err(|_| {
            EngineError::FinishFailed {
                slba: phys_slba,
                code: SC_ZONE_BOUNDARY,
            }
        })?;
        let full = state.zones[idx].wp
            == state.zones[idx].slba + state.geo.zone_cap;
        state.zones[idx].cond = if full {
            ZoneCond::Full
        } else {
            ZoneCond::Finished
        };
        Ok(())
    }

    fn zone_head(&mut self, phys_slba: u64) -> Result<u64, EngineError> {
        let state = self.state.lock();
        let idx = state.zone_index(phys_slba).map_err(|_| {
            EngineError::ReportFailed {
                slba: phys_slba,
                code: SC_ZONE_BOUNDARY,
            }
        })?;
        Ok(state.reported_head(idx))
    }

    fn zone_heads(
        &mut self,
        phys_slba: u64,
        phys_eslba: u64,
    ) -> Result<Vec<u64>, EngineError> {
        let state = self.state.lock();
        if phys_slba > phys_eslba
            || phys_slba % state.geo.zone_size != 0
            || phys_eslba % state.geo.zone_size != 0
        {
            return Err(EngineError::ReportFailed {
                slba: phys_slba,
                code: SC_ZONE_INVALID_WRITE,
            });
        }
        let first = state.zone_index(phys_slba)?;
        let last = state.zone_index(phys_eslba)?;
        Ok((first ..= last).map(|i| state.reported_head(i)).collect())
    }

    fn zone_cap(&mut self, phys_slba: u64) -> Result<u64, EngineError> {
        let state = self.state.lock();
        state.zone_index(phys_slba).map_err(|_| {
            EngineError::ReportFailed {
                slba: phys_slba,
                code: SC_ZONE_BOUNDARY,
            }
        })?;
        Ok(state.geo.zone_cap)
    }
}
