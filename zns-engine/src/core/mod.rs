//!
//! core contains the primary abstractions around ZNS devices: the error and
//! status model, the device manager, DMA buffers, I/O channels and the
//! channel factory.

use snafu::Snafu;

pub use channel::{Channel, ZoneState};
pub use device::{
    found_device,
    remember_device,
    BackendKind,
    DeviceInfo,
    OpenOptions,
    ProbeInfo,
    ZnsDevice,
    MAX_TRADDR_LENGTH,
};
pub use dma::{DmaBuf, DmaError};
pub use factory::{ChannelFactory, ChannelOptions, RawQpair};

mod channel;
mod device;
mod dma;
mod factory;

/// Obtain the full error chain.
pub trait VerboseError {
    fn verbose(&self) -> String;
}

impl<T> VerboseError for T
where
    T: std::error::Error,
{
    /// loops through the error chain and formats into a single string
    /// containing all the lower level errors
    fn verbose(&self) -> String {
        let mut msg = format!("{self}");
        let mut opt_source = self.source();
        while let Some(source) = opt_source {
            msg = format!("{msg}: {source}");
            opt_source = source.source();
        }
        msg
    }
}

/// Numeric status codes of the engine layer, one per backend failure kind.
/// The discriminants are part of the wire-level diagnostics contract and
/// must not be reordered.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u32)]
pub enum StatusCode {
    Success = 0,
    NotAllocated = 1,
    InitError = 2,
    OpenError = 3,
    CloseError = 4,
    ProbeError = 5,
    AppendError = 6,
    ReadError = 7,
    ResetError = 8,
    ReportError = 9,
    DmaAllocError = 10,
    QpairError = 11,
    FinishError = 12,
    PollError = 13,
    Unknown = 14,
}

/// Failures surfaced by the I/O engines. Variants carry the device status
/// code (`code`, an NVMe status or negated errno depending on the engine)
/// where one exists.
#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum EngineError {
    #[snafu(display("required structure was not allocated"))]
    NotAllocated {},
    #[snafu(display("failed to initialize engine: {reason}"))]
    InitFailed {
        reason: String,
    },
    #[snafu(display("failed to open device {name}: {reason}"))]
    OpenFailed {
        name: String,
        reason: String,
    },
    #[snafu(display("failed to close device: {reason}"))]
    CloseFailed {
        reason: String,
    },
    #[snafu(display("failed to probe devices: {reason}"))]
    ProbeFailed {
        reason: String,
    },
    #[snafu(display("append at lba {lba} failed with status {code:#x}"))]
    AppendFailed {
        lba: u64,
        code: i32,
    },
    #[snafu(display("read at lba {lba} failed with status {code:#x}"))]
    ReadFailed {
        lba: u64,
        code: i32,
    },
    #[snafu(display("reset of zone {slba} failed with status {code:#x}"))]
    ResetFailed {
        slba: u64,
        code: i32,
    },
    #[snafu(display("zone report at {slba} failed with status {code:#x}"))]
    ReportFailed {
        slba: u64,
        code: i32,
    },
    #[snafu(display("finish of zone {slba} failed with status {code:#x}"))]
    FinishFailed {
        slba: u64,
        code: i32,
    },
    #[snafu(display("failed to allocate {size} bytes of DMA memory"))]
    DmaAllocFailed {
        size: u64,
    },
    #[snafu(display("queue pair failure: {reason}"))]
    QpairFailed {
        reason: String,
    },
    #[snafu(display("polling completions failed with status {code:#x}"))]
    PollFailed {
        code: i32,
    },
    #[snafu(display("unknown engine failure"))]
    UnknownFailure {},
}

impl EngineError {
    /// Map the failure to its numeric status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotAllocated {} => StatusCode::NotAllocated,
            Self::InitFailed { .. } => StatusCode::InitError,
            Self::OpenFailed { .. } => StatusCode::OpenError,
            Self::CloseFailed { .. } => StatusCode::CloseError,
            Self::ProbeFailed { .. } => StatusCode::ProbeError,
            Self::AppendFailed { .. } => StatusCode::AppendError,
            Self::ReadFailed { .. } => StatusCode::ReadError,
            Self::ResetFailed { .. } => StatusCode::ResetError,
            Self::ReportFailed { .. } => StatusCode::ReportError,
            Self::FinishFailed { .. } => StatusCode::FinishError,
            Self::DmaAllocFailed { .. } => StatusCode::DmaAllocError,
            Self::QpairFailed { .. } => StatusCode::QpairError,
            Self::PollFailed { .. } => StatusCode::PollError,
            Self::UnknownFailure {} => StatusCode::Unknown,
        }
    }
}

/// The compressed public status families. Every [`ZnsError`] maps onto one
/// of these; `Success` is the absence of an error.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Status {
    Success,
    InvalidArguments,
    IOError,
    DeviceError,
    MemoryError,
    NotAllocated,
    Unknown,
}

/// Public error type of the library. The fourteen engine failure kinds
/// compress into families; `ReportFailed` lands in the I/O family together
/// with the other command completions.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum ZnsError {
    #[snafu(display("invalid arguments: {reason}"))]
    InvalidArguments {
        reason: String,
    },
    #[snafu(display("I/O error: {source}"))]
    Io {
        source: EngineError,
    },
    #[snafu(display("out of space: {reason}"))]
    OutOfSpace {
        reason: String,
    },
    #[snafu(display("device error: {source}"))]
    Device {
        source: EngineError,
    },
    #[snafu(display("memory error: {source}"))]
    Memory {
        source: DmaError,
    },
    #[snafu(display("required structure was not allocated"))]
    #[snafu(context(name(NotAllocatedErrorCtx)))]
    NotAllocatedError {},
    #[snafu(display("unknown error"))]
    Unknown {},
}

impl ZnsError {
    pub(crate) fn invalid<R: Into<String>>(reason: R) -> Self {
        ZnsError::InvalidArguments {
            reason: reason.into(),
        }
    }

    pub(crate) fn out_of_space<R: Into<String>>(reason: R) -> Self {
        ZnsError::OutOfSpace {
            reason: reason.into(),
        }
    }

    /// The status family this error belongs to.
    pub fn status(&self) -> Status {
        match self {
            Self::InvalidArguments { .. } => Status::InvalidArguments,
            Self::Io { .. } | Self::OutOfSpace { .. } => Status::IOError,
            Self::Device { .. } => Status::DeviceError,
            Self::Memory { .. } => Status::MemoryError,
            Self::NotAllocatedError {} => Status::NotAllocated,
            Self::Unknown {} => Status::Unknown,
        }
    }

    /// The numeric status code of the underlying engine failure, if any.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidArguments { .. } => StatusCode::Unknown,
            Self::Io { source } | Self::Device { source } => {
                source.status_code()
            }
            Self::OutOfSpace { .. } => StatusCode::AppendError,
            Self::Memory { .. } => StatusCode::DmaAllocError,
            Self::NotAllocatedError {} => StatusCode::NotAllocated,
            Self::Unknown {} => StatusCode::Unknown,
        }
    }
}

impl From<EngineError> for ZnsError {
    fn from(e: EngineError) -> Self {
        match e.status_code() {
            StatusCode::NotAllocated => ZnsError::NotAllocatedError {},
            StatusCode::InitError
            | StatusCode::OpenError
            | StatusCode::CloseError
            | StatusCode::ProbeError
            | StatusCode::QpairError => ZnsError::Device { source: e },
            StatusCode::AppendError
            | StatusCode::ReadError
            | StatusCode::ResetError
            | StatusCode::ReportError
            | StatusCode::FinishError
            | StatusCode::PollError => ZnsError::Io { source: e },
            StatusCode::DmaAllocError => ZnsError::Memory {
                source: DmaError::Alloc {},
            },
            StatusCode::Success | StatusCode::Unknown => ZnsError::Unknown {},
        }
    }
}

impl From<DmaError> for ZnsError {
    fn from(e: DmaError) -> Self {
        ZnsError::Memory { source: e }
    }
}

pub type Result<T, E = ZnsError> = std::result::Result<T, E>;
