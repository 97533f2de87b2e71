use core::fmt;

use onlyerror::Error;

use crate::flash::FlashError;

pub type TfsResult<T> = Result<T, TfsError>;

/// Numbered internal steps of a defrag pass, reported when one fails.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefragStep {
    Plan = 1,
    RestageDsiSector = 2,
    WriteDsiTables = 3,
    WriteDsiTrailer = 4,
    EraseSpare = 5,
    CopyToSpare = 6,
    EraseActive = 7,
    RestoreDsi = 8,
    RefillActive = 9,
    EraseTrailing = 10,
    CleanupDsiSector = 11,
    FinalVerify = 12,
}

impl fmt::Display for DefragStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DefragStep::Plan => "plan",
            DefragStep::RestageDsiSector => "restage dsi sector",
            DefragStep::WriteDsiTables => "write dsi tables",
            DefragStep::WriteDsiTrailer => "write dsi trailer",
            DefragStep::EraseSpare => "erase spare",
            DefragStep::CopyToSpare => "copy to spare",
            DefragStep::EraseActive => "erase active sector",
            DefragStep::RestoreDsi => "restore dsi",
            DefragStep::RefillActive => "refill active sector",
            DefragStep::EraseTrailing => "erase trailing sectors",
            DefragStep::CleanupDsiSector => "cleanup dsi sector",
            DefragStep::FinalVerify => "final verify",
        };
        write!(f, "{} ({})", *self as u8, name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TfsError {
    #[error("file not found")]
    NoSuchFile,
    #[error("no file slot available")]
    NoFreeSlot,
    #[error("end of file reached")]
    EndOfFile,
    #[error("bad argument")]
    BadArgument,
    #[error("not executable")]
    NotExecutable,
    #[error("bad header or data crc")]
    BadHeaderOrDataCrc,
    #[error("file already exists")]
    AlreadyExists,
    #[error("flash operation failed: {0}")]
    FlashOperationFailed(FlashError),
    #[error("write exceeds file size")]
    WriteExceedsFile,
    #[error("file is read-only")]
    ReadOnly,
    #[error("invalid file descriptor")]
    InvalidDescriptor,
    #[error("corrupt file chain")]
    CorruptChain,
    #[error("memory allocation failed")]
    AllocationFailed,
    #[error("file is not in-place-modifiable")]
    NotInPlaceModifiable,
    #[error("out of flash space")]
    FlashFull,
    #[error("access denied")]
    AccessDenied,
    #[error("name or info field too long")]
    NameTooLong,
    #[error("file in use")]
    FileInUse,
    #[error("feature not available")]
    FeatureUnavailable,
    #[error("invalid flag string")]
    InvalidFlagString,
    #[error("defragmentation disabled")]
    DefragDisabled,
    #[error("source data changed during write")]
    SourceChangedDuringWrite,
    #[error("symbolic link error")]
    LinkError,
    #[error("unknown device prefix")]
    UnknownDevicePrefix,
    #[error("alternate device configuration in use")]
    AlternateConfigInUse,
    #[error("cannot run from startup script")]
    CannotRunFromStartupScript,
    #[error("defrag state table overflow")]
    DsiTableOverflow,
    #[error("partition too small")]
    PartitionTooSmall,
    #[error("defrag failed at step {step}: {cause}")]
    DefragFailed { step: DefragStep, cause: FlashError },
}

impl TfsError {
    /// Stable numeric code, as reported by the monitor command layer.
    pub fn code(&self) -> i32 {
        match self {
            TfsError::NoSuchFile => -1,
            TfsError::NoFreeSlot => -2,
            TfsError::EndOfFile => -3,
            TfsError::BadArgument => -4,
            TfsError::NotExecutable => -5,
            TfsError::BadHeaderOrDataCrc => -6,
            TfsError::AlreadyExists => -7,
            TfsError::FlashOperationFailed(_) => -8,
            TfsError::WriteExceedsFile => -9,
            TfsError::ReadOnly => -10,
            TfsError::InvalidDescriptor => -11,
            TfsError::CorruptChain => -12,
            TfsError::AllocationFailed => -13,
            TfsError::NotInPlaceModifiable => -14,
            TfsError::FlashFull => -15,
            TfsError::AccessDenied => -16,
            TfsError::NameTooLong => -17,
            TfsError::FileInUse => -18,
            TfsError::FeatureUnavailable => -19,
            TfsError::InvalidFlagString => -20,
            TfsError::DefragDisabled => -21,
            TfsError::SourceChangedDuringWrite => -22,
            TfsError::LinkError => -23,
            TfsError::UnknownDevicePrefix => -24,
            TfsError::AlternateConfigInUse => -25,
            TfsError::CannotRunFromStartupScript => -26,
            TfsError::DsiTableOverflow => -27,
            TfsError::PartitionTooSmall => -28,
            TfsError::DefragFailed { .. } => -29,
        }
    }

    /// Static message for a numeric code, for callers that only kept the code.
    pub fn message(code: i32) -> &'static str {
        match code {
            0 => "no error",
            -1 => "file not found",
            -2 => "no file slot available",
            -3 => "end of file reached",
            -4 => "bad argument",
            -5 => "not executable",
            -6 => "bad header or data crc",
            -7 => "file already exists",
            -8 => "flash operation failed",
            -9 => "write exceeds file size",
            -10 => "file is read-only",
            -11 => "invalid file descriptor",
            -12 => "corrupt file chain",
            -13 => "memory allocation failed",
            -14 => "file is not in-place-modifiable",
            -15 => "out of flash space",
            -16 => "access denied",
            -17 => "name or info field too long",
            -18 => "file in use",
            -19 => "feature not available",
            -20 => "invalid flag string",
            -21 => "defragmentation disabled",
            -22 => "source data changed during write",
            -23 => "symbolic link error",
            -24 => "unknown device prefix",
            -25 => "alternate device configuration in use",
            -26 => "cannot run from startup script",
            -27 => "defrag state table overflow",
            -28 => "partition too small",
            -29 => "defrag failed",
            _ => "unknown error",
        }
    }
}

impl From<FlashError> for TfsError {
    fn from(e: FlashError) -> Self {
        TfsError::FlashOperationFailed(e)
    }
}

/// Tag flash failures inside a defrag pass with the step they happened in.
pub(crate) trait AtStep<T> {
    fn at(self, step: DefragStep) -> TfsResult<T>;
}

impl<T> AtStep<T> for Result<T, FlashError> {
    fn at(self, step: DefragStep) -> TfsResult<T> {
        self.map_err(|cause| TfsError::DefragFailed { step, cause })
    }
}

impl<T> AtStep<T> for TfsResult<T> {
    fn at(self, step: DefragStep) -> TfsResult<T> {
        self.map_err(|e| match e {
            TfsError::FlashOperationFailed(cause) => TfsError::DefragFailed { step, cause },
            other => other,
        })
    }
}
