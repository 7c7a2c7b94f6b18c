//! AFC operation codes and file open modes

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum AfcOpcode {
    Status = 0x01,
    Data = 0x02,
    ReadDir = 0x03,
    RemovePath = 0x08,
    MakeDir = 0x09,
    GetFileInfo = 0x0A,
    GetDevInfo = 0x0B,
    FileOpen = 0x0D,
    FileOpenRes = 0x0E,
    FileRead = 0x0F,
    FileWrite = 0x10,
    FileSeek = 0x11,
    FileTell = 0x12,
    FileTellRes = 0x13,
    FileClose = 0x14,
    RenamePath = 0x18,
}

impl TryFrom<u64> for AfcOpcode {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => Self::Status,
            0x02 => Self::Data,
            0x03 => Self::ReadDir,
            0x08 => Self::RemovePath,
            0x09 => Self::MakeDir,
            0x0A => Self::GetFileInfo,
            0x0B => Self::GetDevInfo,
            0x0D => Self::FileOpen,
            0x0E => Self::FileOpenRes,
            0x0F => Self::FileRead,
            0x10 => Self::FileWrite,
            0x11 => Self::FileSeek,
            0x12 => Self::FileTell,
            0x13 => Self::FileTellRes,
            0x14 => Self::FileClose,
            0x18 => Self::RenamePath,
            _ => return Err(value),
        })
    }
}

/// How to open a file on the device, mirroring fopen modes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum OpenMode {
    /// `r` - O_RDONLY
    ReadOnly = 1,
    /// `r+` - O_RDWR | O_CREAT
    ReadWrite = 2,
    /// `w` - O_WRONLY | O_CREAT | O_TRUNC
    WriteOnly = 3,
    /// `w+` - O_RDWR | O_CREAT | O_TRUNC
    WriteRead = 4,
    /// `a` - O_WRONLY | O_APPEND | O_CREAT
    Append = 5,
    /// `a+` - O_RDWR | O_APPEND | O_CREAT
    AppendRead = 6,
}
