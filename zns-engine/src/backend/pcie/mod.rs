//! User-space PCIe NVMe driver engine. Talks to the controller directly:
//! the BAR is mapped through the PCI sysfs `resource0` file, admin and I/O
//! queues live in pinned memory, submissions ring the BAR doorbells and
//! completions are busy-polled. No kernel driver may be bound to the
//! device.

mod cmd;
mod queues;

use std::{
    fs::OpenOptions,
    os::fd::AsRawFd,
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    backend::{BackendKind, Completion, IoEngine, IoQueue},
    core::{DeviceInfo, DmaBuf, DmaError, EngineError, ProbeInfo},
};

use cmd::NvmeCommand;
use queues::{CompQueue, CompletionEntry, SubQueue};

const PAGE_SIZE: u64 = 4096;
const ADMIN_QUEUE_DEPTH: usize = 32;
const IO_QUEUE_DEPTH: usize = 64;
/// Upper bound on busy-poll iterations before a stuck queue pair is
/// declared dead.
const SPIN_LIMIT: u64 = 1 << 28;

// Controller registers.
const REG_CAP: usize = 0x0;
const REG_CC: usize = 0x14;
const REG_CSTS: usize = 0x1c;
const REG_AQA: usize = 0x24;
const REG_ASQ: usize = 0x28;
const REG_ACQ: usize = 0x30;
const DOORBELL_BASE: usize = 0x1000;

const NVME_IDENTIFY_DATA_SIZE: u64 = 4096;
const CNS_NS: u32 = 0x00;
const CNS_CTRL: u32 = 0x01;
const CNS_ACTIVE_NS_LIST: u32 = 0x02;
const CNS_CSI_NS: u32 = 0x05;
const CNS_CSI_CTRL: u32 = 0x06;
const CSI_NVM: u32 = 0x0;
const CSI_ZNS: u32 = 0x2;

const ZONE_REPORT_HEADER: usize = 64;
const ZONE_DESC_SIZE: usize = 64;
const ZONES_PER_REPORT: u64 = 256;

/// The mapped controller BAR.
struct Bar {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for Bar {}
unsafe impl Sync for Bar {}

impl Bar {
    fn map(traddr: &str) -> Result<Self, EngineError> {
        let path = format!("/sys/bus/pci/devices/{traddr}/resource0");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| EngineError::OpenFailed {
                name: traddr.to_string(),
                reason: format!("{path}: {e}"),
            })?;
        let len = file
            .metadata()
            .map_err(|e| EngineError::OpenFailed {
                name: traddr.to_string(),
                reason: e.to_string(),
            })?
            .len() as usize;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(EngineError::OpenFailed {
                name: traddr.to_string(),
                reason: "failed to map the controller BAR".into(),
            });
        }
        Ok(Bar {
            ptr: ptr as *mut u8,
            len,
        })
    }

    fn read32(&self, reg: usize) -> u32 {
        debug_assert!(reg + 4 <= self.len);
        unsafe { std::ptr::read_volatile(self.ptr.add(reg) as *const u32) }
    }

    fn write32(&self, reg: usize, value: u32) {
        debug_assert!(reg + 4 <= self.len);
        unsafe {
            std::ptr::write_volatile(self.ptr.add(reg) as *mut u32, value)
        }
    }

    fn read64(&self, reg: usize) -> u64 {
        debug_assert!(reg + 8 <= self.len);
        unsafe { std::ptr::read_volatile(self.ptr.add(reg) as *const u64) }
    }

    fn write64(&self, reg: usize, value: u64) {
        debug_assert!(reg + 8 <= self.len);
        unsafe {
            std::ptr::write_volatile(self.ptr.add(reg) as *mut u64, value)
        }
    }
}

impl Drop for Bar {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// List NVMe-class PCI functions. Whether they expose a zoned namespace is
/// only known after an open.
pub fn probe() -> Result<Vec<ProbeInfo>, EngineError> {
    let entries = std::fs::read_dir("/sys/bus/pci/devices").map_err(|e| {
        EngineError::ProbeFailed {
            reason: format!("pci sysfs: {e}"),
        }
    })?;
    let mut probed = Vec::new();
    for entry in entries.flatten() {
        let class_path = entry.path().join("class");
        let Ok(class) = std::fs::read_to_string(&class_path) else {
            continue;
        };
        // 0x0108xx: mass storage, NVM subclass
        if class.trim_start_matches("0x").starts_with("0108") {
            probed.push(ProbeInfo {
                traddr: entry.file_name().to_string_lossy().into_owned(),
                is_zns: false,
            });
        }
    }
    Ok(probed)
}

/// Set the memory-space and bus-master bits in the PCI command register so
/// the controller may DMA.
fn enable_bus_master(traddr: &str) -> Result<(), EngineError> {
    use std::os::unix::fs::FileExt;
    let path = format!("/sys/bus/pci/devices/{traddr}/config");
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| EngineError::OpenFailed {
            name: traddr.to_string(),
            reason: format!("{path}: {e}"),
        })?;
    let mut command = [0u8; 2];
    file.read_exact_at(&mut command, 4).map_err(|e| {
        EngineError::OpenFailed {
            name: traddr.to_string(),
            reason: e.to_string(),
        }
    })?;
    let value = u16::from_le_bytes(command) | 0x2 | 0x4;
    file.write_all_at(&value.to_le_bytes(), 4).map_err(|e| {
        EngineError::OpenFailed {
            name: traddr.to_string(),
            reason: e.to_string(),
        }
    })?;
    Ok(())
}

struct PcieController {
    bar: Bar,
    dstrd: u16,
    mqes: usize,
    admin_sq: SubQueue,
    admin_cq: CompQueue,
    admin_cid: u16,
    io_queue_ids: Vec<u16>,
}

impl PcieController {
    fn doorbell(&self, qid: u16, completion: bool) -> *mut u32 {
        let index = 2 * qid as usize + completion as usize;
        let offset = DOORBELL_BASE + index * (4 << self.dstrd);
        unsafe { self.bar.ptr.add(offset) as *mut u32 }
    }

    /// Run one admin command to completion.
    fn admin_command(
        &mut self,
        build: impl FnOnce(u16) -> NvmeCommand,
    ) -> Result<CompletionEntry, EngineError> {
        let cid = self.admin_cid;
        self.admin_cid = self.admin_cid.wrapping_add(1);
        self.admin_sq.submit(build(cid));
        let mut spins = 0u64;
        loop {
            if let Some(entry) = self.admin_cq.reap() {
                if entry.code() != 0 {
                    return Err(EngineError::QpairFailed {
                        reason: format!(
                            "admin command failed with status {:#x}",
                            entry.code()
                        ),
                    });
                }
                return Ok(entry);
            }
            spins += 1;
            if spins > SPIN_LIMIT {
                return Err(EngineError::PollFailed {
                    code: -1,
                });
            }
            std::hint::spin_loop();
        }
    }

    fn identify(
        &mut self,
        buf: &mut DmaBuf,
        nsid: u32,
        cns: u32,
        csi: u32,
    ) -> Result<(), EngineError> {
        buf.fill(0);
        let prp1 = buf.phys_addr().ok_or(EngineError::DmaAllocFailed {
            size: NVME_IDENTIFY_DATA_SIZE,
        })?;
        self.admin_command(|cid| {
            NvmeCommand::identify(cid, nsid, prp1, cns, csi)
        })?;
        Ok(())
    }

    fn create_io_queue_pair(
        &mut self,
        depth: usize,
    ) -> Result<(u16, SubQueue, CompQueue), EngineError> {
        let mut qid = 1u16;
        while self.io_queue_ids.contains(&qid) {
            qid += 1;
        }
        let depth = depth.min(self.mqes);
        let cq = CompQueue::new(depth, self.doorbell(qid, true))?;
        self.admin_command(|cid| {
            NvmeCommand::create_io_completion_queue(
                cid,
                qid,
                cq.phys(),
                depth as u16 - 1,
            )
        })?;
        let sq = SubQueue::new(depth, self.doorbell(qid, false))?;
        self.admin_command(|cid| {
            NvmeCommand::create_io_submission_queue(
                cid,
                qid,
                sq.phys(),
                depth as u16 - 1,
                qid,
            )
        })?;
        self.io_queue_ids.push(qid);
        debug!(qid, depth, "created I/O queue pair");
        Ok((qid, sq, cq))
    }

    fn delete_io_queue_pair(&mut self, qid: u16) {
        let _ = self.admin_command(|cid| {
            NvmeCommand::delete_io_submission_queue(cid, qid)
        });
        let _ = self.admin_command(|cid| {
            NvmeCommand::delete_io_completion_queue(cid, qid)
        });
        self.io_queue_ids.retain(|id| *id != qid);
    }
}

/// User-space driver engine for one controller with one zoned namespace.
pub struct PcieEngine {
    ctrl: Arc<Mutex<PcieController>>,
    info: DeviceInfo,
}

impl PcieEngine {
    pub fn open(traddr: &str) -> Result<Self, EngineError> {
        enable_bus_master(traddr)?;
        let bar = Bar::map(traddr)?;

        let cap = bar.read64(REG_CAP);
        let mqes = (cap & 0xffff) as usize + 1;
        let dstrd = ((cap >> 32) & 0xf) as u16;
        let mpsmin = 1u64 << (12 + ((cap >> 48) & 0xf));
        let iocss = (cap >> 43) & 1 == 1;
        if (cap >> 37) & 1 == 0 {
            return Err(EngineError::OpenFailed {
                name: traddr.to_string(),
                reason: "NVM command set not supported".into(),
            });
        }

        // Disable, program the admin queues, re-enable.
        let cc = bar.read32(REG_CC);
        bar.write32(REG_CC, cc & !1);
        wait_ready(&bar, false, traddr)?;

        let depth = ADMIN_QUEUE_DEPTH.min(mqes);
        let mut ctrl = PcieController {
            dstrd,
            mqes,
            admin_sq: SubQueue::new(depth, std::ptr::null_mut())?,
            admin_cq: CompQueue::new(depth, std::ptr::null_mut())?,
            admin_cid: 0,
            io_queue_ids: Vec::new(),
            bar,
        };
        // Doorbells depend on the stride read above; rebuild the queues
        // with the real pointers.
        ctrl.admin_sq = SubQueue::new(depth, ctrl.doorbell(0, false))?;
        ctrl.admin_cq = CompQueue::new(depth, ctrl.doorbell(0, true))?;
        ctrl.bar.write64(REG_ASQ, ctrl.admin_sq.phys());
        ctrl.bar.write64(REG_ACQ, ctrl.admin_cq.phys());
        ctrl.bar.write32(
            REG_AQA,
            ((depth as u32 - 1) << 16) | (depth as u32 - 1),
        );
        // CSS 110b exposes all I/O command sets (required for ZNS).
        let css: u32 = if iocss { 0b110 } else { 0b000 };
        let cc = 1 | (css << 4) | (6 << 16) | (4 << 20);
        ctrl.bar.write32(REG_CC, cc);
        wait_ready(&ctrl.bar, true, traddr)?;

        // Controller geometry.
        let mut buf = DmaBuf::pinned(NVME_IDENTIFY_DATA_SIZE, PAGE_SIZE)
            .map_err(|_| EngineError::DmaAllocFailed {
                size: NVME_IDENTIFY_DATA_SIZE,
            })?;
        ctrl.identify(&mut buf, 0, CNS_CTRL, CSI_NVM)?;
        let mdts_exp = buf.as_slice()[77];
        let mdts = if mdts_exp > 0 {
            mpsmin << mdts_exp
        } else {
            128 * 1024
        };

        // Take any zoned namespace, we do not care which.
        ctrl.identify(&mut buf, 0, CNS_ACTIVE_NS_LIST, CSI_NVM)?;
        let nsids: Vec<u32> = buf.as_slice()[.. 4096]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .take_while(|id| *id != 0)
            .collect();
        let mut selected = None;
        for nsid in nsids {
            ctrl.identify(&mut buf, nsid, CNS_NS, CSI_NVM)?;
            let lba_cap = u64_at(buf.as_slice(), 0);
            let flbas = (buf.as_slice()[26] & 0xf) as usize;
            let ds = buf.as_slice()[128 + 4 * flbas + 2];
            ctrl.identify(&mut buf, nsid, CNS_CSI_NS, CSI_ZNS)?;
            let zone_size = u64_at(buf.as_slice(), 2816 + 16 * flbas);
            if zone_size != 0 {
                selected = Some((nsid, lba_cap, 1u64 << ds, zone_size));
                break;
            }
        }
        let Some((nsid, lba_cap, lba_size, zone_size)) = selected else {
            return Err(EngineError::OpenFailed {
                name: traddr.to_string(),
                reason: "no zoned namespace on the controller".into(),
            });
        };

        ctrl.identify(&mut buf, 0, CNS_CSI_CTRL, CSI_ZNS)?;
        let zasl_exp = buf.as_slice()[0];
        let zasl = if zasl_exp > 0 {
            mpsmin << zasl_exp
        } else {
            mdts
        };

        let mut info = DeviceInfo {
            lba_size,
            zone_size,
            zone_cap: zone_size,
            mdts,
            zasl,
            lba_cap,
            min_lba: 0,
            max_lba: lba_cap,
            nsid,
            min_page_size: mpsmin,
        };

        let ctrl = Arc::new(Mutex::new(ctrl));
        // The zone capacity comes from a report, which needs a transient
        // I/O queue pair.
        {
            let mut queue = PcieQueue::create(&ctrl, info)?;
            info.zone_cap = queue.zone_cap(0)?;
        }
        debug!(
            traddr,
            nsid,
            zone_size = info.zone_size,
            zone_cap = info.zone_cap,
            "initialized user-space NVMe controller"
        );
        Ok(PcieEngine {
            ctrl,
            info,
        })
    }
}

fn wait_ready(
    bar: &Bar,
    ready: bool,
    traddr: &str,
) -> Result<(), EngineError> {
    let mut spins = 0u64;
    while (bar.read32(REG_CSTS) & 1 == 1) != ready {
        spins += 1;
        if spins > SPIN_LIMIT {
            return Err(EngineError::InitFailed {
                reason: format!("controller {traddr} stuck in reset"),
            });
        }
        std::hint::spin_loop();
    }
    Ok(())
}

fn u64_at(data: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(data[at .. at + 8].try_into().unwrap())
}

impl IoEngine for PcieEngine {
    fn kind(&self) -> BackendKind {
        BackendKind::Pcie
    }

    fn device_info(&self) -> DeviceInfo {
        self.info
    }

    fn create_qpair(&self) -> Result<Box<dyn IoQueue>, EngineError> {
        Ok(Box::new(PcieQueue::create(&self.ctrl, self.info)?))
    }

    fn dma_alloc(&self, size: u64) -> Result<DmaBuf, DmaError> {
        DmaBuf::pinned(size, self.info.lba_size)
    }
}

struct PcieQueue {
    ctrl: Arc<Mutex<PcieController>>,
    qid: u16,
    sq: SubQueue,
    cq: CompQueue,
    info: DeviceInfo,
    cid: u16,
    /// In-flight completions by `command_id % depth`.
    slots: Vec<Option<Arc<Completion>>>,
    /// One PRP list page per slot, for transfers past two pages.
    prp_lists: Vec<Option<DmaBuf>>,
}

impl PcieQueue {
    fn create(
        ctrl: &Arc<Mutex<PcieController>>,
        info: DeviceInfo,
    ) -> Result<Self, EngineError> {
        let (qid, sq, cq) = ctrl.lock().create_io_queue_pair(IO_QUEUE_DEPTH)?;
        let depth = sq.slots();
        Ok(PcieQueue {
            ctrl: ctrl.clone(),
            qid,
            sq,
            cq,
            info,
            cid: 0,
            slots: (0 .. depth).map(|_| None).collect(),
            prp_lists: (0 .. depth).map(|_| None).collect(),
        })
    }

    fn next_cid(&mut self) -> Result<(u16, usize), EngineError> {
        let cid = self.cid;
        let slot = cid as usize % self.slots.len();
        if self.slots[slot].is_some() {
            return Err(EngineError::QpairFailed {
                reason: "queue pair is saturated".into(),
            });
        }
        self.cid = self.cid.wrapping_add(1);
        Ok((cid, slot))
    }

    /// Build the PRP entries for a transfer. Pinned buffers are physically
    /// contiguous, so list entries are derived from the base address.
    fn build_prps(
        &mut self,
        slot: usize,
        buf: &DmaBuf,
        offset: u64,
        bytes: u64,
    ) -> Result<(u64, u64), EngineError> {
        let base = buf.phys_addr().ok_or(EngineError::DmaAllocFailed {
            size: bytes,
        })? + offset;
        let first_page = PAGE_SIZE - base % PAGE_SIZE;
        if bytes <= first_page {
            return Ok((base, 0));
        }
        let rest = bytes - first_page;
        let second = (base / PAGE_SIZE + 1) * PAGE_SIZE;
        if rest <= PAGE_SIZE {
            return Ok((base, second));
        }
        let pages = (rest + PAGE_SIZE - 1) / PAGE_SIZE;
        if self.prp_lists[slot].is_none() {
            let list = DmaBuf::pinned(PAGE_SIZE, PAGE_SIZE).map_err(|_| {
                EngineError::DmaAllocFailed {
                    size: PAGE_SIZE,
                }
            })?;
            self.prp_lists[slot] = Some(list);
        }
        let list = self.prp_lists[slot].as_mut().unwrap();
        for page in 0 .. pages {
            let entry = (second + page * PAGE_SIZE).to_le_bytes();
            list.write_at(&entry, page as usize * 8).map_err(|_| {
                EngineError::DmaAllocFailed {
                    size: bytes,
                }
            })?;
        }
        let list_phys = list.phys_addr().ok_or(EngineError::DmaAllocFailed {
            size: bytes,
        })?;
        Ok((base, list_phys))
    }

    /// Drain posted completions, flagging their slots.
    fn reap_ready(&mut self) {
        while let Some(entry) = self.cq.reap() {
            let command_id = entry.command_id;
            let slot = command_id as usize % self.slots.len();
            match self.slots[slot].take() {
                Some(completion) => completion.complete(entry.code()),
                None => warn!(
                    cid = command_id,
                    "completion for an unknown command"
                ),
            }
        }
    }

    fn wait_for(
        &mut self,
        completion: &Completion,
    ) -> Result<(), EngineError> {
        let mut spins = 0u64;
        while !completion.is_done() {
            self.reap_ready();
            spins += 1;
            if spins > SPIN_LIMIT {
                return Err(EngineError::PollFailed {
                    code: -1,
                });
            }
            std::hint::spin_loop();
        }
        Ok(())
    }

    fn sync_command(
        &mut self,
        build: impl FnOnce(u16, u64, u64) -> NvmeCommand,
        buf_phys: (u64, u64),
    ) -> Result<i32, EngineError> {
        let completion = Completion::new();
        let (cid, slot) = self.next_cid()?;
        self.slots[slot] = Some(completion.clone());
        self.sq.submit(build(cid, buf_phys.0, buf_phys.1));
        self.wait_for(&completion)?;
        Ok(completion.code())
    }

    fn mgmt_send(&mut self, zslba: u64, action: u32) -> Result<i32, EngineError> {
        let nsid = self.info.nsid;
        self.sync_command(
            |cid, _, _| NvmeCommand::zone_mgmt_send(cid, nsid, zslba, action),
            (0, 0),
        )
    }

    /// Report `(zcap, wp)` for up to [`ZONES_PER_REPORT`] zones at `slba`.
    fn report_zones(
        &mut self,
        slba: u64,
        zones: u64,
    ) -> Result<Vec<(u64, u64)>, EngineError> {
        let zones = zones.min(ZONES_PER_REPORT) as usize;
        let len = (ZONE_REPORT_HEADER + zones * ZONE_DESC_SIZE) as u64;
        let mut data = DmaBuf::pinned(len, PAGE_SIZE).map_err(|_| {
            EngineError::DmaAllocFailed {
                size: len,
            }
        })?;
        let prps = self.build_prps(0, &data, 0, len)?;
        // slot 0's PRP list is only safe here because the report is
        // synchronous and nothing else is in flight on this queue when the
        // channel issues reports
        let nsid = self.info.nsid;
        let code = self.sync_command(
            |cid, prp1, prp2| {
                let mut command = NvmeCommand::zone_mgmt_recv(
                    cid,
                    nsid,
                    slba,
                    prp1,
                    len as u32,
                );
                command.data_pointer[1] = prp2;
                command
            },
            prps,
        )?;
        if code != 0 {
            return Err(EngineError::ReportFailed {
                slba,
                code,
            });
        }
        let raw = data.as_slice();
        let reported = u64_at(raw, 0).min(zones as u64) as usize;
        if reported == 0 {
            return Err(EngineError::ReportFailed {
                slba,
                code: -1,
            });
        }
        Ok((0 .. reported)
            .map(|i| {
                let at = ZONE_REPORT_HEADER + i * ZONE_DESC_SIZE;
                (u64_at(raw, at + 8), u64_at(raw, at + 24))
            })
            .collect())
    }
}

impl IoQueue for PcieQueue {
    fn read(
        &mut self,
        phys_lba: u64,
        buf: &mut DmaBuf,
        offset: u64,
        blocks: u64,
    ) -> Result<(), EngineError> {
        let bytes = blocks * self.info.lba_size;
        let (cid, slot) = self.next_cid()?;
        let prps = self.build_prps(slot, buf, offset, bytes)?;
        let completion = Completion::new();
        self.slots[slot] = Some(completion.clone());
        self.sq.submit(NvmeCommand::io_read(
            cid,
            self.info.nsid,
            phys_lba,
            blocks as u16 - 1,
            prps.0,
            prps.1,
        ));
        self.wait_for(&completion)?;
        if completion.code() != 0 {
            return Err(EngineError::ReadFailed {
                lba: phys_lba,
                code: completion.code(),
            });
        }
        Ok(())
    }

    fn write(
        &mut self,
        phys_lba: u64,
        buf: &DmaBuf,
        offset: u64,
        blocks: u64,
    ) -> Result<(), EngineError> {
        let bytes = blocks * self.info.lba_size;
        let (cid, slot) = self.next_cid()?;
        let prps = self.build_prps(slot, buf, offset, bytes)?;
        let completion = Completion::new();
        self.slots[slot] = Some(completion.clone());
        self.sq.submit(NvmeCommand::io_write(
            cid,
            self.info.nsid,
            phys_lba,
            blocks as u16 - 1,
            prps.0,
            prps.1,
        ));
        self.wait_for(&completion)?;
        if completion.code() != 0 {
            return Err(EngineError::AppendFailed {
                lba: phys_lba,
                code: completion.code(),
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
        let completion = Completion::new();
        self.append_async(phys_zslba, buf, offset, blocks, &completion)?;
        self.wait_for(&completion)?;
        if completion.code() != 0 {
            return Err(EngineError::AppendFailed {
                lba: phys_zslba,
                code: completion.code(),
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
        let bytes = blocks * self.info.lba_size;
        let (cid, slot) = self.next_cid()?;
        let prps = self.build_prps(slot, buf, offset, bytes)?;
        self.slots[slot] = Some(completion.clone());
        self.sq.submit(NvmeCommand::zone_append(
            cid,
            self.info.nsid,
            phys_zslba,
            blocks as u16 - 1,
            prps.0,
            prps.1,
        ));
        Ok(())
    }

    fn poll_async(
        &mut self,
        completion: &Completion,
    ) -> Result<(), EngineError> {
        self.wait_for(completion)?;
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
            self.reap_ready();
        }
        if completion.is_done() && completion.code() != 0 {
            return Err(EngineError::PollFailed {
                code: completion.code(),
            });
        }
        Ok(())
    }

    fn poll_once_raw(&mut self) {
        self.reap_ready();
    }

    fn reset_zone(&mut self, phys_slba: u64) -> Result<(), EngineError> {
        let code = self.mgmt_send(phys_slba, cmd::ZNS_ZSA_RESET)?;
        if code != 0 {
            return Err(EngineError::ResetFailed {
                slba: phys_slba,
                code,
            });
        }
        Ok(())
    }

    fn reset_all(&mut self) -> Result<(), EngineError> {
        let code =
            self.mgmt_send(0, cmd::ZNS_ZSA_RESET | cmd::ZNS_SELECT_ALL)?;
        if code != 0 {
            return Err(EngineError::ResetFailed {
                slba: 0,
                code,
            });
        }
        Ok(())
    }

    fn finish_zone(&mut self, phys_slba: u64) -> Result<(), EngineError> {
        let code = self.mgmt_send(phys_slba, cmd::ZNS_ZSA_FINISH)?;
        if code != 0 {
            return Err(EngineError::FinishFailed {
                slba: phys_slba,
                code,
            });
        }
        Ok(())
    }

    fn zone_head(&mut self, phys_slba: u64) -> Result<u64, EngineError> {
        let heads = self.zone_heads(phys_slba, phys_slba)?;
        Ok(heads[0])
    }

    fn zone_heads(
        &mut self,
        phys_slba: u64,
        phys_eslba: u64,
    ) -> Result<Vec<u64>, EngineError> {
        let zone_size = self.info.zone_size;
        let zones_to_report = (phys_eslba - phys_slba) / zone_size + 1;
        let mut heads = Vec::new();
        let mut slba = phys_slba;
        while (heads.len() as u64) < zones_to_report {
            let left = zones_to_report - heads.len() as u64;
            let descs = self.report_zones(slba, left)?;
            for (zcap, wp) in descs {
                let head = if wp > slba + zcap {
                    slba + zone_size
                } else {
                    wp
                };
                heads.push(head);
                slba += zone_size;
                if heads.len() as u64 == zones_to_report {
                    break;
                }
            }
        }
        Ok(heads)
    }

    fn zone_cap(&mut self, phys_slba: u64) -> Result<u64, EngineError> {
        let descs = self.report_zones(phys_slba, 1)?;
        Ok(descs[0].0)
    }
}

impl Drop for PcieQueue {
    fn drop(&mut self) {
        // Reap whatever is still in flight so no completion lands after
        // the queues are deleted.
        let mut spins = 0u64;
        while self.slots.iter().any(Option::is_some) && spins < SPIN_LIMIT {
            self.reap_ready();
            spins += 1;
        }
        self.ctrl.lock().delete_io_queue_pair(self.qid);
    }
}
