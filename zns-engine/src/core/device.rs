//! Device manager: opens one zoned namespace through the engine selected at
//! init time and owns the window of zones the rest of the library is
//! allowed to touch.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    backend::{emu::EmuEngine, pcie, pcie::PcieEngine, uring, uring::UringEngine, IoEngine},
    core::{EngineError, Result, ZnsError},
};

pub use crate::backend::BackendKind;

/// Transport addresses are opaque byte strings of bounded length, compared
/// byte-wise.
pub const MAX_TRADDR_LENGTH: usize = 0x100;

/// General information about one zoned namespace. Read-only after open.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceInfo {
    /// Size of one block (logical block address unit) in bytes.
    pub lba_size: u64,
    /// Size of one zone in blocks.
    pub zone_size: u64,
    /// User-writable space of one zone in blocks, `zone_cap <= zone_size`.
    /// Blocks between the capacity and the zone size are unmapped.
    pub zone_cap: u64,
    /// Maximum data transfer size of one command in bytes.
    pub mdts: u64,
    /// Maximum size of one zone append command in bytes.
    pub zasl: u64,
    /// Total number of blocks in the namespace.
    pub lba_cap: u64,
    /// First physical block the library may touch (zone aligned).
    pub min_lba: u64,
    /// One past the last physical block the library may touch (zone
    /// aligned).
    pub max_lba: u64,
    /// Namespace identifier.
    pub nsid: u32,
    /// Minimum controller memory page size in bytes.
    pub min_page_size: u64,
}

impl DeviceInfo {
    /// Number of zones in the allowed window.
    pub fn zones_in_window(&self) -> u64 {
        (self.max_lba - self.min_lba) / self.zone_size
    }

    /// First zone index of the allowed window.
    pub fn min_zone(&self) -> u64 {
        self.min_lba / self.zone_size
    }

    /// One past the last zone index of the allowed window.
    pub fn max_zone(&self) -> u64 {
        self.max_lba / self.zone_size
    }
}

/// Options picked when opening a device.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    /// First zone available to the library.
    pub min_zone: u64,
    /// One past the last zone available to the library; 0 means the device
    /// maximum.
    pub max_zone: u64,
}

/// One probed controller.
#[derive(Debug, Clone)]
pub struct ProbeInfo {
    pub traddr: String,
    pub is_zns: bool,
}

// Devices seen before, by transport address. Driver reattachment does not
// always surface a device a second time, so remember every address we ever
// probed or opened for the lifetime of the process.
static FOUND_DEVICES: Lazy<Mutex<Vec<String>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

/// Record a transport address in the process-wide device cache.
pub fn remember_device(traddr: &str) {
    let mut found = FOUND_DEVICES.lock();
    if !found.iter().any(|t| t.as_bytes() == traddr.as_bytes()) {
        found.push(traddr.to_string());
    }
}

/// Whether the transport address was seen before in this process.
pub fn found_device(traddr: &str) -> bool {
    FOUND_DEVICES
        .lock()
        .iter()
        .any(|t| t.as_bytes() == traddr.as_bytes())
}

/// Manages one ZNS namespace through the engine chosen at construction.
/// The engine choice is frozen for the lifetime of the manager.
pub struct ZnsDevice {
    name: String,
    kind: BackendKind,
    engine: Option<Arc<dyn IoEngine>>,
    info: Option<DeviceInfo>,
}

impl ZnsDevice {
    /// Create a manager for the given engine kind. Call once before any
    /// other operation.
    pub fn new(name: &str, kind: BackendKind) -> Self {
        debug!(name, ?kind, "initializing device manager");
        ZnsDevice {
            name: name.to_string(),
            kind,
            engine: None,
            info: None,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// List controllers reachable through this manager's engine kind.
    pub fn probe(&mut self) -> Result<Vec<ProbeInfo>> {
        if self.engine.is_some() {
            return Err(ZnsError::invalid("probe with a device open"));
        }
        let probed = match self.kind {
            BackendKind::Pcie => pcie::probe().map_err(ZnsError::from)?,
            BackendKind::Uring => uring::probe().map_err(ZnsError::from)?,
            BackendKind::Emulated => Vec::new(),
        };
        for dev in &probed {
            remember_device(&dev.traddr);
        }
        Ok(probed)
    }

    /// Open the namespace at `traddr` and clamp the zone window to
    /// `options`.
    pub fn open(&mut self, traddr: &str, options: &OpenOptions) -> Result<()> {
        if self.engine.is_some() {
            return Err(ZnsError::invalid("device already open"));
        }
        if traddr.len() > MAX_TRADDR_LENGTH {
            return Err(ZnsError::invalid("transport address too long"));
        }
        if found_device(traddr) {
            // Reattachment quirk: the address was seen before, so skip
            // rediscovery and trust it directly.
            debug!(traddr, "reopening a previously seen device");
        }
        let engine: Arc<dyn IoEngine> = match self.kind {
            BackendKind::Pcie => Arc::new(PcieEngine::open(traddr)?),
            BackendKind::Uring => Arc::new(UringEngine::open(traddr)?),
            BackendKind::Emulated => Arc::new(EmuEngine::open(traddr)?),
        };
        let mut info = engine.device_info();
        let (min_zone, max_zone) = clamp_window(&info, options)?;
        info.min_lba = min_zone * info.zone_size;
        info.max_lba = max_zone * info.zone_size;
        remember_device(traddr);
        debug!(
            traddr,
            min_zone, max_zone, "opened zoned namespace"
        );
        self.engine = Some(engine);
        self.info = Some(info);
        Ok(())
    }

    /// Shut the device down, releasing the engine.
    pub fn close(&mut self) -> Result<()> {
        if self.engine.is_none() {
            return Err(ZnsError::NotAllocatedError {});
        }
        self.engine = None;
        self.info = None;
        Ok(())
    }

    /// Recreate the manager context, closing any open device.
    pub fn reinit(&mut self) -> Result<()> {
        if self.engine.is_some() {
            self.close()?;
        }
        Ok(())
    }

    /// Information of the opened namespace.
    pub fn info(&self) -> Result<DeviceInfo> {
        self.info.ok_or(ZnsError::NotAllocatedError {})
    }

    pub(crate) fn engine(&self) -> Result<Arc<dyn IoEngine>> {
        self.engine.clone().ok_or(ZnsError::NotAllocatedError {})
    }
}

impl Drop for ZnsDevice {
    fn drop(&mut self) {
        if self.engine.is_some() {
            debug!(name = %self.name, "destroying device manager");
            self.engine = None;
        }
    }
}

/// Clamp the requested zone window against the device capacity.
fn clamp_window(
    info: &DeviceInfo,
    options: &OpenOptions,
) -> Result<(u64, u64), ZnsError> {
    let zone_max_allowed = info.lba_cap / info.zone_size;
    let min_zone = options.min_zone;
    if min_zone != 0 && min_zone > zone_max_allowed {
        return Err(ZnsError::from(EngineError::OpenFailed {
            name: String::new(),
            reason: "window starts past the device capacity".into(),
        }));
    }
    let max_zone = if options.max_zone == 0 {
        zone_max_allowed
    } else {
        options.max_zone.min(zone_max_allowed)
    };
    if min_zone > max_zone {
        return Err(ZnsError::from(EngineError::OpenFailed {
            name: String::new(),
            reason: "window is empty after clamping".into(),
        }));
    }
    if max_zone == min_zone {
        warn!("opened a zero-zone window, all I/O will be rejected");
    }
    Ok((min_zone, max_zone))
}
