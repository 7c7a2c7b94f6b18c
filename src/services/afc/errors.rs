//! Status codes the AFC daemon returns

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum AfcError {
    #[error("success")]
    Success,
    #[error("operation header invalid")]
    OpHeaderInvalid,
    #[error("no resources available")]
    NoResources,
    #[error("read error")]
    ReadError,
    #[error("write error")]
    WriteError,
    #[error("unknown packet type")]
    UnknownPacketType,
    #[error("invalid argument")]
    InvalidArg,
    #[error("object not found")]
    ObjectNotFound,
    #[error("object is a directory")]
    ObjectIsDir,
    #[error("permission denied")]
    PermDenied,
    #[error("service not connected")]
    ServiceNotConnected,
    #[error("operation timed out")]
    OpTimeout,
    #[error("too much data")]
    TooMuchData,
    #[error("end of data")]
    EndOfData,
    #[error("operation not supported")]
    OpNotSupported,
    #[error("object already exists")]
    ObjectExists,
    #[error("object is busy")]
    ObjectBusy,
    #[error("no space left")]
    NoSpaceLeft,
    #[error("operation would block")]
    OpWouldBlock,
    #[error("i/o error")]
    IoError,
    #[error("operation interrupted")]
    OpInterrupted,
    #[error("operation in progress")]
    OpInProgress,
    #[error("internal error")]
    InternalError,
    #[error("multiplexer error")]
    MuxError,
    #[error("out of memory")]
    NoMem,
    #[error("not enough data")]
    NotEnoughData,
    #[error("directory not empty")]
    DirNotEmpty,
    #[error("unknown afc status code {0}")]
    Unknown(u64),
}

impl From<u64> for AfcError {
    fn from(value: u64) -> Self {
        match value {
            0 => Self::Success,
            2 => Self::OpHeaderInvalid,
            3 => Self::NoResources,
            4 => Self::ReadError,
            5 => Self::WriteError,
            6 => Self::UnknownPacketType,
            7 => Self::InvalidArg,
            8 => Self::ObjectNotFound,
            9 => Self::ObjectIsDir,
            10 => Self::PermDenied,
            11 => Self::ServiceNotConnected,
            12 => Self::OpTimeout,
            13 => Self::TooMuchData,
            14 => Self::EndOfData,
            15 => Self::OpNotSupported,
            16 => Self::ObjectExists,
            17 => Self::ObjectBusy,
            18 => Self::NoSpaceLeft,
            19 => Self::OpWouldBlock,
            20 => Self::IoError,
            21 => Self::OpInterrupted,
            22 => Self::OpInProgress,
            23 => Self::InternalError,
            30 => Self::MuxError,
            31 => Self::NoMem,
            32 => Self::NotEnoughData,
            33 => Self::DirNotEmpty,
            other => Self::Unknown(other),
        }
    }
}
