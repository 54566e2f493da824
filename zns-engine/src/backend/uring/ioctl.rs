//! NVMe ioctls against the kernel generic char device (`/dev/ngXnY`).
//! Management and identify commands travel this path; data-path commands
//! use the io_uring passthrough ring instead.

use std::os::fd::RawFd;

use nix::errno::Errno;

use crate::core::{DeviceInfo, EngineError};

// NVMe opcodes used over the passthrough interfaces.
pub(crate) const NVME_CMD_WRITE: u8 = 0x01;
pub(crate) const NVME_CMD_READ: u8 = 0x02;
pub(crate) const NVME_ZNS_CMD_MGMT_SEND: u8 = 0x79;
pub(crate) const NVME_ZNS_CMD_MGMT_RECV: u8 = 0x7a;
pub(crate) const NVME_ZNS_CMD_APPEND: u8 = 0x7d;
const NVME_ADMIN_IDENTIFY: u8 = 0x06;

// Zone send actions (cdw13); bit 8 selects all zones.
const NVME_ZNS_ZSA_FINISH: u32 = 0x02;
const NVME_ZNS_ZSA_RESET: u32 = 0x04;
const NVME_ZNS_SEND_SELECT_ALL: u32 = 1 << 8;
// Zone receive action: report zones, listing all.
const NVME_ZNS_ZRA_REPORT_ZONES: u32 = 0x00;

const NVME_IDENTIFY_DATA_SIZE: usize = 4096;
const NVME_CSI_NVM: u32 = 0x0;
const NVME_CSI_ZNS: u32 = 0x2;
const NVME_IDENTIFY_CNS_NS: u32 = 0x00;
const NVME_IDENTIFY_CNS_CTRL: u32 = 0x01;
const NVME_IDENTIFY_CNS_CSI_NS: u32 = 0x05;
const NVME_IDENTIFY_CNS_CSI_CTRL: u32 = 0x06;

// A transfer larger than this is never issued through the kernel path.
const MAX_TRANSFER_SIZE: u64 = 1 << 16;
// Zone report descriptors fetched per management-receive command.
const ZONES_PER_REPORT: u64 = 256;
const ZONE_DESC_SIZE: usize = 64;
const ZONE_REPORT_HEADER: usize = 64;

/// Kernel passthrough command block, shared by the admin and I/O ioctls.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct NvmePassthruCmd {
    pub opcode: u8,
    pub flags: u8,
    pub rsvd1: u16,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub metadata: u64,
    pub addr: u64,
    pub metadata_len: u32,
    pub data_len: u32,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
    pub timeout_ms: u32,
    pub result: u32,
}

const NVME_IOCTL_ID: u32 = io!(b'N' as u32, 0x40);
const NVME_IOCTL_ADMIN_CMD: u32 =
    iowr!(b'N' as u32, 0x41, std::mem::size_of::<NvmePassthruCmd>());
const NVME_IOCTL_IO_CMD: u32 =
    iowr!(b'N' as u32, 0x43, std::mem::size_of::<NvmePassthruCmd>());

/// Issue one passthrough ioctl; the return value is the NVMe status (0 on
/// success) or the negated errno on transport failure.
fn passthru(fd: RawFd, request: u32, cmd: &mut NvmePassthruCmd) -> i32 {
    let ret = unsafe {
        libc::ioctl(fd, request as libc::c_ulong, cmd as *mut NvmePassthruCmd)
    };
    if ret < 0 {
        -(Errno::last() as i32)
    } else {
        ret as i32
    }
}

fn mgmt_command(
    fd: RawFd,
    nsid: u32,
    opcode: u8,
    action: u32,
    zslba: u64,
    data: &mut [u8],
) -> i32 {
    let mut cmd = NvmePassthruCmd {
        opcode,
        nsid,
        addr: if data.is_empty() {
            0
        } else {
            data.as_mut_ptr() as u64
        },
        data_len: data.len() as u32,
        cdw10: (zslba & 0xffff_ffff) as u32,
        cdw11: (zslba >> 32) as u32,
        cdw12: if data.is_empty() {
            0
        } else {
            (data.len() as u32 >> 2) - 1
        },
        cdw13: action,
        ..Default::default()
    };
    passthru(fd, NVME_IOCTL_IO_CMD, &mut cmd)
}

pub(crate) fn reset_zone(
    fd: RawFd,
    nsid: u32,
    zslba: u64,
) -> Result<(), EngineError> {
    let code = mgmt_command(
        fd,
        nsid,
        NVME_ZNS_CMD_MGMT_SEND,
        NVME_ZNS_ZSA_RESET,
        zslba,
        &mut [],
    );
    if code != 0 {
        return Err(EngineError::ResetFailed {
            slba: zslba,
            code,
        });
    }
    Ok(())
}

pub(crate) fn reset_all_zones(
    fd: RawFd,
    nsid: u32,
) -> Result<(), EngineError> {
    let code = mgmt_command(
        fd,
        nsid,
        NVME_ZNS_CMD_MGMT_SEND,
        NVME_ZNS_ZSA_RESET | NVME_ZNS_SEND_SELECT_ALL,
        0,
        &mut [],
    );
    if code != 0 {
        return Err(EngineError::ResetFailed {
            slba: 0,
            code,
        });
    }
    Ok(())
}

pub(crate) fn finish_zone(
    fd: RawFd,
    nsid: u32,
    zslba: u64,
) -> Result<(), EngineError> {
    let code = mgmt_command(
        fd,
        nsid,
        NVME_ZNS_CMD_MGMT_SEND,
        NVME_ZNS_ZSA_FINISH,
        zslba,
        &mut [],
    );
    if code != 0 {
        return Err(EngineError::FinishFailed {
            slba: zslba,
            code,
        });
    }
    Ok(())
}

/// Fetch the report descriptor fields `(zcap, wp)` for a run of zones
/// starting at `slba`, at most [`ZONES_PER_REPORT`] at a time.
fn report_zones(
    fd: RawFd,
    nsid: u32,
    slba: u64,
    zones: u64,
) -> Result<Vec<(u64, u64)>, EngineError> {
    let zones = zones.min(ZONES_PER_REPORT) as usize;
    let mut data =
        vec![0u8; ZONE_REPORT_HEADER + zones * ZONE_DESC_SIZE];
    let code = mgmt_command(
        fd,
        nsid,
        NVME_ZNS_CMD_MGMT_RECV,
        NVME_ZNS_ZRA_REPORT_ZONES,
        slba,
        &mut data,
    );
    if code != 0 {
        return Err(EngineError::ReportFailed {
            slba,
            code,
        });
    }
    let reported = u64_at(&data, 0).min(zones as u64) as usize;
    if reported == 0 {
        return Err(EngineError::ReportFailed {
            slba,
            code: -1,
        });
    }
    Ok((0 .. reported)
        .map(|i| {
            let at = ZONE_REPORT_HEADER + i * ZONE_DESC_SIZE;
            (u64_at(&data, at + 8), u64_at(&data, at + 24))
        })
        .collect())
}

/// Write pointers for `[zslba, zeslba]`, clamped to the zone end for
/// finished zones. Performs as many report commands as needed.
pub(crate) fn get_zone_heads(
    fd: RawFd,
    nsid: u32,
    zone_size: u64,
    zslba: u64,
    zeslba: u64,
) -> Result<Vec<u64>, EngineError> {
    let mut heads = Vec::new();
    let mut slba = zslba;
    let zones_to_report = (zeslba - zslba) / zone_size + 1;
    while (heads.len() as u64) < zones_to_report {
        let left = zones_to_report - heads.len() as u64;
        let descs = report_zones(fd, nsid, slba, left)?;
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

pub(crate) fn get_zone_cap(
    fd: RawFd,
    nsid: u32,
    zslba: u64,
) -> Result<u64, EngineError> {
    let descs = report_zones(fd, nsid, zslba, 1)?;
    Ok(descs[0].0)
}

pub(crate) fn get_nsid(fd: RawFd) -> Result<u32, EngineError> {
    let ret = unsafe { libc::ioctl(fd, NVME_IOCTL_ID as libc::c_ulong) };
    if ret <= 0 {
        return Err(EngineError::OpenFailed {
            name: String::new(),
            reason: format!("NVME_IOCTL_ID failed: {}", Errno::last()),
        });
    }
    Ok(ret as u32)
}

fn identify(
    fd: RawFd,
    nsid: u32,
    cns: u32,
    csi: u32,
) -> Result<Vec<u8>, EngineError> {
    let mut data = vec![0u8; NVME_IDENTIFY_DATA_SIZE];
    let mut cmd = NvmePassthruCmd {
        opcode: NVME_ADMIN_IDENTIFY,
        nsid,
        addr: data.as_mut_ptr() as u64,
        data_len: NVME_IDENTIFY_DATA_SIZE as u32,
        cdw10: cns,
        cdw11: csi << 24,
        ..Default::default()
    };
    let code = passthru(fd, NVME_IOCTL_ADMIN_CMD, &mut cmd);
    if code != 0 {
        return Err(EngineError::OpenFailed {
            name: String::new(),
            reason: format!("identify cns={cns} csi={csi} failed: {code}"),
        });
    }
    Ok(data)
}

fn u64_at(data: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(data[at .. at + 8].try_into().unwrap())
}

/// Derive the namespace geometry from the identify pages and a first zone
/// report, the way the kernel path allows it (no register access, so the
/// minimum page size is assumed 4 KiB and transfers are capped).
pub(crate) fn get_nvme_info(fd: RawFd) -> Result<DeviceInfo, EngineError> {
    let nsid = get_nsid(fd)?;
    let id_ns = identify(fd, nsid, NVME_IDENTIFY_CNS_NS, NVME_CSI_NVM)?;
    let id_ns_zns = identify(fd, nsid, NVME_IDENTIFY_CNS_CSI_NS, NVME_CSI_ZNS)?;
    let id_ctrl = identify(fd, nsid, NVME_IDENTIFY_CNS_CTRL, NVME_CSI_NVM)?;
    let id_ctrl_zns =
        identify(fd, nsid, NVME_IDENTIFY_CNS_CSI_CTRL, NVME_CSI_ZNS)?;

    let lba_cap = u64_at(&id_ns, 0); // NSZE
    let flbas = (id_ns[26] & 0xf) as usize;
    let ds = id_ns[128 + 4 * flbas + 2]; // LBAF.LBADS
    let lba_size = 1u64 << ds;

    // No register window over the char device; CAP.MPSMIN defaults to 0.
    let min_page_size = 1u64 << 12;
    let mdts_exp = id_ctrl[77];
    let mdts = if mdts_exp > 0 {
        (min_page_size << mdts_exp).min(MAX_TRANSFER_SIZE)
    } else {
        MAX_TRANSFER_SIZE
    };
    let zasl_exp = id_ctrl_zns[0];
    let zasl = if zasl_exp > 0 {
        (min_page_size << zasl_exp).min(MAX_TRANSFER_SIZE)
    } else {
        mdts
    };
    // ZNS LBA format extension: zone size in blocks.
    let zone_size = u64_at(&id_ns_zns, 2816 + 16 * flbas);
    if zone_size == 0 || lba_size == 0 {
        return Err(EngineError::OpenFailed {
            name: String::new(),
            reason: "not a zoned namespace".into(),
        });
    }
    let zone_cap = get_zone_cap(fd, nsid, 0)?;

    Ok(DeviceInfo {
        lba_size,
        zone_size,
        zone_cap,
        mdts,
        zasl,
        lba_cap,
        min_lba: 0,
        max_lba: lba_cap,
        nsid,
        min_page_size,
    })
}
