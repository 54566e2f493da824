//! Kernel NVMe passthrough engine. Data-path commands (read, write, zone
//! append) are `nvme_uring_cmd` submissions on a per-queue-pair io_uring
//! with 128-byte SQEs and 32-byte CQEs; management commands go through the
//! NVMe ioctls in [`ioctl`]. The target is the NVMe generic char device,
//! `/dev/ngXnY`.

mod ioctl;

use std::{
    fs::{File, OpenOptions},
    os::fd::{AsRawFd, RawFd},
    os::unix::fs::FileTypeExt,
    sync::Arc,
};

use io_uring::{cqueue, opcode, squeue, types, IoUring};
use tracing::{debug, warn};

use crate::{
    backend::{BackendKind, Completion, IoEngine, IoQueue},
    core::{DeviceInfo, DmaBuf, DmaError, EngineError, ProbeInfo},
};

/// Ring and queue-pair depth, which also bounds in-flight submissions.
const QUEUE_DEPTH: u32 = 64;

/// In-kernel passthrough command layout carried inside the 80-byte SQE
/// command area.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct NvmeUringCmd {
    opcode: u8,
    flags: u8,
    rsvd1: u16,
    nsid: u32,
    cdw2: u32,
    cdw3: u32,
    metadata: u64,
    addr: u64,
    metadata_len: u32,
    data_len: u32,
    cdw10: u32,
    cdw11: u32,
    cdw12: u32,
    cdw13: u32,
    cdw14: u32,
    cdw15: u32,
    timeout_ms: u32,
    rsvd2: u32,
}

// NVME_URING_CMD_IO from the kernel uapi: _IOWR('N', 0x80, nvme_uring_cmd).
const NVME_URING_CMD_IO: u32 =
    iowr!(b'N' as u32, 0x80, std::mem::size_of::<NvmeUringCmd>());

/// List NVMe generic char devices. A device counts as ZNS when its zoned
/// identify page carries a zone size.
pub fn probe() -> Result<Vec<ProbeInfo>, EngineError> {
    let entries = std::fs::read_dir("/dev").map_err(|e| {
        EngineError::ProbeFailed {
            reason: format!("/dev: {e}"),
        }
    })?;
    let mut probed = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("ng") {
            continue;
        }
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_char_device() {
            continue;
        }
        let path = format!("/dev/{name}");
        let is_zns = OpenOptions::new()
            .read(true)
            .open(&path)
            .ok()
            .map(|f| ioctl::get_nvme_info(f.as_raw_fd()).is_ok())
            .unwrap_or(false);
        probed.push(ProbeInfo {
            traddr: path,
            is_zns,
        });
    }
    Ok(probed)
}

/// Passthrough engine for one opened namespace.
pub struct UringEngine {
    file: Arc<File>,
    info: DeviceInfo,
}

impl UringEngine {
    pub fn open(traddr: &str) -> Result<Self, EngineError> {
        let meta =
            std::fs::metadata(traddr).map_err(|e| EngineError::OpenFailed {
                name: traddr.to_string(),
                reason: e.to_string(),
            })?;
        if !meta.file_type().is_char_device() {
            return Err(EngineError::OpenFailed {
                name: traddr.to_string(),
                reason: "only NVMe generic char devices are supported".into(),
            });
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(traddr)
            .map_err(|e| EngineError::OpenFailed {
                name: traddr.to_string(),
                reason: e.to_string(),
            })?;
        let info = ioctl::get_nvme_info(file.as_raw_fd()).map_err(|e| {
            EngineError::OpenFailed {
                name: traddr.to_string(),
                reason: format!("geometry probe failed: {e}"),
            }
        })?;
        debug!(
            traddr,
            nsid = info.nsid,
            zone_size = info.zone_size,
            zone_cap = info.zone_cap,
            "opened passthrough namespace"
        );
        Ok(UringEngine {
            file: Arc::new(file),
            info,
        })
    }
}

impl IoEngine for UringEngine {
    fn kind(&self) -> BackendKind {
        BackendKind::Uring
    }

    fn device_info(&self) -> DeviceInfo {
        self.info
    }

    fn create_qpair(&self) -> Result<Box<dyn IoQueue>, EngineError> {
        // Entry128/Entry32 select the SQE128/CQE32 ring layout required
        // for NVMe passthrough commands.
        let ring = IoUring::<squeue::Entry128, cqueue::Entry32>::builder()
            .build(QUEUE_DEPTH)
            .map_err(|e| EngineError::QpairFailed {
            reason: format!("io_uring setup: {e}"),
        })?;
        Ok(Box::new(UringQueue {
            ring,
            file: self.file.clone(),
            info: self.info,
            slots: (0 .. QUEUE_DEPTH as usize).map(|_| None).collect(),
        }))
    }

    fn dma_alloc(&self, size: u64) -> Result<DmaBuf, DmaError> {
        DmaBuf::new(size, self.info.lba_size)
    }
}

struct UringQueue {
    ring: IoUring<squeue::Entry128, cqueue::Entry32>,
    file: Arc<File>,
    info: DeviceInfo,
    /// In-flight completions by SQE user data.
    slots: Vec<Option<Arc<Completion>>>,
}

impl UringQueue {
    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn claim_slot(
        &mut self,
        completion: &Arc<Completion>,
    ) -> Result<usize, EngineError> {
        match self.slots.iter().position(|s| s.is_none()) {
            Some(idx) => {
                self.slots[idx] = Some(completion.clone());
                Ok(idx)
            }
            None => Err(EngineError::QpairFailed {
                reason: "queue pair is saturated".into(),
            }),
        }
    }

    /// Submit one passthrough command tracked by `completion`.
    fn submit(
        &mut self,
        op: u8,
        slba: u64,
        blocks: u64,
        buf_addr: u64,
        bytes: u64,
        completion: &Arc<Completion>,
    ) -> Result<(), EngineError> {
        let slot = self.claim_slot(completion)?;
        let cmd = NvmeUringCmd {
            opcode: op,
            nsid: self.info.nsid,
            addr: buf_addr,
            data_len: bytes as u32,
            cdw10: (slba & 0xffff_ffff) as u32,
            cdw11: (slba >> 32) as u32,
            cdw12: blocks as u32 - 1,
            ..Default::default()
        };
        let mut cmd_bytes = [0u8; 80];
        unsafe {
            std::ptr::copy_nonoverlapping(
                &cmd as *const NvmeUringCmd as *const u8,
                cmd_bytes.as_mut_ptr(),
                std::mem::size_of::<NvmeUringCmd>(),
            );
        }
        let sqe = opcode::UringCmd80::new(types::Fd(self.fd()), NVME_URING_CMD_IO)
            .cmd(cmd_bytes)
            .build()
            .user_data(slot as u64);
        let pushed = unsafe { self.ring.submission().push(&sqe) };
        if pushed.is_err() {
            self.slots[slot] = None;
            return Err(EngineError::QpairFailed {
                reason: "submission queue full".into(),
            });
        }
        if let Err(e) = self.ring.submit() {
            self.slots[slot] = None;
            return Err(EngineError::QpairFailed {
                reason: format!("io_uring submit: {e}"),
            });
        }
        Ok(())
    }

    /// Drain whatever completions have landed, flagging their slots.
    fn reap_ready(&mut self) {
        while let Some(cqe) = self.ring.completion().next() {
            let slot = cqe.user_data() as usize;
            match self.slots.get_mut(slot).and_then(Option::take) {
                Some(completion) => completion.complete(cqe.result()),
                None => warn!(slot, "completion for an unknown slot"),
            }
        }
    }

    fn in_flight(&self) -> bool {
        self.slots.iter().any(Option::is_some)
    }

    /// Busy-wait until `completion` flips; the kernel wait suspends until
    /// at least one CQE lands.
    fn wait_for(
        &mut self,
        completion: &Completion,
    ) -> Result<(), EngineError> {
        loop {
            self.reap_ready();
            if completion.is_done() {
                break;
            }
            if !self.in_flight() {
                return Err(EngineError::PollFailed {
                    code: -1,
                });
            }
            self.ring.submit_and_wait(1).map_err(|e| {
                EngineError::PollFailed {
                    code: -e.raw_os_error().unwrap_or(1),
                }
            })?;
        }
        Ok(())
    }

    fn sync_command(
        &mut self,
        op: u8,
        slba: u64,
        blocks: u64,
        buf_addr: u64,
        bytes: u64,
    ) -> Result<i32, EngineError> {
        let completion = Completion::new();
        self.submit(op, slba, blocks, buf_addr, bytes, &completion)?;
        self.wait_for(&completion)?;
        Ok(completion.code())
    }
}

impl IoQueue for UringQueue {
    fn read(
        &mut self,
        phys_lba: u64,
        buf: &mut DmaBuf,
        offset: u64,
        blocks: u64,
    ) -> Result<(), EngineError> {
        let bytes = blocks * self.info.lba_size;
        let addr = buf.as_mut_slice()[offset as usize ..].as_mut_ptr() as u64;
        let code = self.sync_command(
            ioctl::NVME_CMD_READ,
            phys_lba,
            blocks,
            addr,
            bytes,
        )?;
        if code != 0 {
            return Err(EngineError::ReadFailed {
                lba: phys_lba,
                code,
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
        let addr = buf.as_slice()[offset as usize ..].as_ptr() as u64;
        let code = self.sync_command(
            ioctl::NVME_CMD_WRITE,
            phys_lba,
            blocks,
            addr,
            bytes,
        )?;
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
        let bytes = blocks * self.info.lba_size;
        let addr = buf.as_slice()[offset as usize ..].as_ptr() as u64;
        let code = self.sync_command(
            ioctl::NVME_ZNS_CMD_APPEND,
            phys_zslba,
            blocks,
            addr,
            bytes,
        )?;
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
        let bytes = blocks * self.info.lba_size;
        let addr = buf.as_slice()[offset as usize ..].as_ptr() as u64;
        self.submit(
            ioctl::NVME_ZNS_CMD_APPEND,
            phys_zslba,
            blocks,
            addr,
            bytes,
            completion,
        )
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
        ioctl::reset_zone(self.fd(), self.info.nsid, phys_slba)
    }

    fn reset_all(&mut self) -> Result<(), EngineError> {
        ioctl::reset_all_zones(self.fd(), self.info.nsid)
    }

    fn finish_zone(&mut self, phys_slba: u64) -> Result<(), EngineError> {
        ioctl::finish_zone(self.fd(), self.info.nsid, phys_slba)
    }

    fn zone_head(&mut self, phys_slba: u64) -> Result<u64, EngineError> {
        let heads = ioctl::get_zone_heads(
            self.fd(),
            self.info.nsid,
            self.info.zone_size,
            phys_slba,
            phys_slba,
        )?;
        Ok(heads[0])
    }

    fn zone_heads(
        &mut self,
        phys_slba: u64,
        phys_eslba: u64,
    ) -> Result<Vec<u64>, EngineError> {
        ioctl::get_zone_heads(
            self.fd(),
            self.info.nsid,
            self.info.zone_size,
            phys_slba,
            phys_eslba,
        )
    }

    fn zone_cap(&mut self, phys_slba: u64) -> Result<u64, EngineError> {
        ioctl::get_zone_cap(self.fd(), self.info.nsid, phys_slba)
    }
}
