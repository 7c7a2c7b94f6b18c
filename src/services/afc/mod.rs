//! AFC (Apple File Conduit) client
//!
//! File access on the device over a binary, sequence-numbered packet
//! protocol. The same framing serves `com.apple.afc` and the crash report
//! copy service; the stream underneath may be plain TCP or TLS.

use std::collections::{HashMap, VecDeque};

use log::warn;

use crate::{DeviceConnection, DeviceService, MuxdevError};

pub mod errors;
pub mod file;
pub mod opcode;
pub mod packet;

use errors::AfcError;
use file::FileDescriptor;
use opcode::{AfcOpcode, OpenMode};
use packet::{AfcPacket, AfcPacketHeader};

/// `CFA6LPAA` as it appears on the wire
pub const MAGIC: u64 = 0x4141504c36414643;

/// Client for the AFC service
///
/// The protocol is strictly synchronous on one connection: nothing ties a
/// reply to its request, so requests are serialized and the sequence
/// number only ever counts up.
pub struct AfcClient {
    /// The underlying device connection
    pub connection: DeviceConnection,
    sequence_number: u64,
}

/// Information about a file on the device
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// Size of the file in bytes
    pub size: usize,
    /// Number of blocks allocated for the file
    pub blocks: usize,
    /// Creation timestamp (st_birthtime, reported in nanoseconds)
    pub created: chrono::NaiveDateTime,
    /// Last modification timestamp (st_mtime, reported in nanoseconds)
    pub modified: chrono::NaiveDateTime,
    /// Number of hard links
    pub nlinks: usize,
    /// What the entry is
    pub kind: FileKind,
    /// Target path if this is a symbolic link
    pub link_target: Option<String>,
}

/// File kind as reported in `st_ifmt`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Other(String),
}

impl FileKind {
    fn from_ifmt(ifmt: &str) -> Self {
        match ifmt {
            "S_IFREG" => Self::Regular,
            "S_IFDIR" => Self::Directory,
            "S_IFLNK" => Self::Symlink,
            other => Self::Other(other.to_owned()),
        }
    }

    pub fn is_dir(&self) -> bool {
        *self == Self::Directory
    }
}

/// Information about the device's filesystem
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    /// Device model identifier
    pub model: String,
    /// Total storage capacity in bytes
    pub total_bytes: usize,
    /// Free storage space in bytes
    pub free_bytes: usize,
    /// Filesystem block size in bytes
    pub block_size: usize,
}

impl DeviceService for AfcClient {
    fn service_name() -> &'static str {
        "com.apple.afc"
    }

    async fn from_stream(connection: DeviceConnection) -> Result<Self, MuxdevError> {
        Ok(Self::new(connection))
    }
}

impl AfcClient {
    /// Creates a new AFC client from an existing device connection
    pub fn new(connection: DeviceConnection) -> Self {
        Self {
            connection,
            sequence_number: 0,
        }
    }

    /// Lists the contents of a directory, without `.` and `..`
    pub async fn list_dir(&mut self, path: &str) -> Result<Vec<String>, MuxdevError> {
        let res = self
            .request(AfcOpcode::ReadDir, path.as_bytes().to_vec(), Vec::new())
            .await?;

        let entries = res
            .payload
            .split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .filter(|s| s != "." && s != "..")
            .collect();
        Ok(entries)
    }

    /// Creates a directory on the device
    pub async fn mk_dir(&mut self, path: &str) -> Result<(), MuxdevError> {
        self.request(AfcOpcode::MakeDir, path.as_bytes().to_vec(), Vec::new())
            .await?;
        Ok(())
    }

    /// Retrieves information about a file or directory
    pub async fn get_file_info(&mut self, path: &str) -> Result<FileInfo, MuxdevError> {
        let res = self
            .request(AfcOpcode::GetFileInfo, path.as_bytes().to_vec(), Vec::new())
            .await?;

        let mut kvs = parse_kv_payload(&res.payload);

        let take_number = |kvs: &mut HashMap<String, String>, key: &str| {
            kvs.remove(key)
                .and_then(|x| x.parse::<usize>().ok())
                .ok_or(MuxdevError::AfcMissingAttribute)
        };

        let size = take_number(&mut kvs, "st_size")?;
        let blocks = take_number(&mut kvs, "st_blocks")?;
        let nlinks = take_number(&mut kvs, "st_nlink")?;

        let take_nanos = |kvs: &mut HashMap<String, String>, key: &str| {
            kvs.remove(key)
                .and_then(|x| x.parse::<i64>().ok())
                .ok_or(MuxdevError::AfcMissingAttribute)
                .map(|nanos| chrono::DateTime::from_timestamp_nanos(nanos).naive_utc())
        };

        let created = take_nanos(&mut kvs, "st_birthtime")?;
        let modified = take_nanos(&mut kvs, "st_mtime")?;

        let kind = kvs
            .remove("st_ifmt")
            .map(|x| FileKind::from_ifmt(&x))
            .ok_or(MuxdevError::AfcMissingAttribute)?;
        let link_target = kvs.remove("st_link_target");

        if !kvs.is_empty() {
            warn!("File info kvs not empty: {kvs:?}");
        }

        Ok(FileInfo {
            size,
            blocks,
            created,
            modified,
            nlinks,
            kind,
            link_target,
        })
    }

    /// Retrieves information about the device's filesystem
    pub async fn get_device_info(&mut self) -> Result<DeviceInfo, MuxdevError> {
        let res = self
            .request(AfcOpcode::GetDevInfo, Vec::new(), Vec::new())
            .await?;

        let mut kvs = parse_kv_payload(&res.payload);

        let model = kvs
            .remove("Model")
            .ok_or(MuxdevError::AfcMissingAttribute)?;
        let mut take_number = |key: &str| {
            kvs.remove(key)
                .and_then(|x| x.parse::<usize>().ok())
                .ok_or(MuxdevError::AfcMissingAttribute)
        };
        let total_bytes = take_number("FSTotalBytes")?;
        let free_bytes = take_number("FSFreeBytes")?;
        let block_size = take_number("FSBlockSize")?;

        Ok(DeviceInfo {
            model,
            total_bytes,
            free_bytes,
            block_size,
        })
    }

    /// Removes a file or an empty directory
    ///
    /// Removing `/` succeeds as a local no-op; the conduit root is never
    /// deleted and no request is sent.
    pub async fn remove(&mut self, path: &str) -> Result<(), MuxdevError> {
        if path == "/" {
            return Ok(());
        }
        self.request(AfcOpcode::RemovePath, path.as_bytes().to_vec(), Vec::new())
            .await?;
        Ok(())
    }

    /// Recursively removes a directory and all its contents
    ///
    /// Deletion is post-order: the files of a directory go first, the
    /// directory itself after. `/` itself is skipped.
    pub async fn remove_all(&mut self, path: &str) -> Result<(), MuxdevError> {
        if !self.get_file_info(path).await?.kind.is_dir() {
            return self.remove(path).await;
        }

        // Walk breadth-first collecting directories, deleting files as
        // they are found, then unwind the directories deepest-first
        let mut dirs = vec![path.to_owned()];
        let mut next = 0;
        while next < dirs.len() {
            let dir = dirs[next].clone();
            next += 1;
            for entry in self.list_dir(&dir).await? {
                let full = join_path(&dir, &entry);
                if self.get_file_info(&full).await?.kind.is_dir() {
                    dirs.push(full);
                } else {
                    self.remove(&full).await?;
                }
            }
        }
        for dir in dirs.iter().rev() {
            self.remove(dir).await?;
        }
        Ok(())
    }

    /// Walks a directory tree breadth-first
    ///
    /// # Returns
    /// The full paths of all regular files under `path`, sorted
    pub async fn walk(&mut self, path: &str) -> Result<Vec<String>, MuxdevError> {
        let mut files = Vec::new();
        let mut queue = VecDeque::from([path.to_owned()]);

        while let Some(dir) = queue.pop_front() {
            for entry in self.list_dir(&dir).await? {
                let full = join_path(&dir, &entry);
                match self.get_file_info(&full).await?.kind {
                    FileKind::Directory => queue.push_back(full),
                    FileKind::Regular => files.push(full),
                    _ => {}
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// Renames a file or directory
    pub async fn rename(&mut self, source: &str, target: &str) -> Result<(), MuxdevError> {
        let mut header_payload = source.as_bytes().to_vec();
        header_payload.push(0);
        header_payload.extend_from_slice(target.as_bytes());
        header_payload.push(0);

        self.request(AfcOpcode::RenamePath, header_payload, Vec::new())
            .await?;
        Ok(())
    }

    /// Opens a file on the device
    ///
    /// # Returns
    /// A descriptor borrowing this client; close it before opening the next
    pub async fn open<'a>(
        &'a mut self,
        path: &str,
        mode: OpenMode,
    ) -> Result<FileDescriptor<'a>, MuxdevError> {
        let mut header_payload = (mode as u64).to_le_bytes().to_vec();
        header_payload.extend_from_slice(path.as_bytes());

        let res = self
            .request(AfcOpcode::FileOpen, header_payload, Vec::new())
            .await?;
        if res.header_payload.len() < 8 {
            warn!("FileOpen reply did not carry a file handle");
            return Err(MuxdevError::UnexpectedResponse);
        }
        let fd = u64::from_le_bytes(res.header_payload[..8].try_into().expect("sliced to 8"));
        Ok(FileDescriptor {
            client: self,
            fd,
            path: path.to_owned(),
        })
    }

    /// Builds, numbers and sends one packet, then reads the reply
    ///
    /// A `Status` reply is checked for success and surfaced as a typed
    /// error otherwise.
    pub(crate) async fn request(
        &mut self,
        op: AfcOpcode,
        header_payload: Vec<u8>,
        payload: Vec<u8>,
    ) -> Result<AfcPacket, MuxdevError> {
        let this_len = AfcPacketHeader::LEN + header_payload.len() as u64;
        let total_len = this_len + payload.len() as u64;

        let header = AfcPacketHeader {
            magic: MAGIC,
            total_len,
            this_len,
            sequence_number: self.sequence_number,
            op,
        };
        self.sequence_number += 1;

        let packet = AfcPacket {
            header,
            header_payload,
            payload,
        };

        self.connection.send_raw(&packet.serialize()).await?;
        self.read_reply().await
    }

    async fn read_reply(&mut self) -> Result<AfcPacket, MuxdevError> {
        let res = AfcPacket::read(&mut self.connection).await?;
        if res.header.op == AfcOpcode::Status {
            if res.header_payload.len() < 8 {
                warn!("AFC returned a status packet without a code");
                return Err(MuxdevError::UnexpectedResponse);
            }
            let code =
                u64::from_le_bytes(res.header_payload[..8].try_into().expect("sliced to 8"));
            let e = AfcError::from(code);
            if e != AfcError::Success {
                return Err(MuxdevError::Afc(e));
            }
        }
        Ok(res)
    }
}

impl std::fmt::Debug for AfcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AfcClient")
            .field("connection", &self.connection)
            .field("sequence_number", &self.sequence_number)
            .finish()
    }
}

/// AFC info payloads are `key\0value\0...` lists
fn parse_kv_payload(payload: &[u8]) -> HashMap<String, String> {
    let strings: Vec<String> = payload
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();

    strings
        .chunks_exact(2)
        .map(|chunk| (chunk[0].clone(), chunk[1].clone()))
        .collect()
}

fn join_path(dir: &str, entry: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{entry}")
    } else {
        format!("{dir}/{entry}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_payload_parses_pairs() {
        let payload = b"st_size\03\0st_ifmt\0S_IFREG\0";
        let kvs = parse_kv_payload(payload);
        assert_eq!(kvs.get("st_size").map(String::as_str), Some("3"));
        assert_eq!(kvs.get("st_ifmt").map(String::as_str), Some("S_IFREG"));
    }

    #[test]
    fn joining_handles_the_root() {
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a", "b"), "/a/b");
    }
}
