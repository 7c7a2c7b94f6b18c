//! AFC operations against a stub file conduit
//!
//! The stub implements the packet protocol over an in-memory filesystem
//! and asserts the wire invariants on every request: magic, strictly
//! incrementing sequence numbers, and the split-length rule for writes.

mod common;

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use muxdev::{
    afc::{errors::AfcError, opcode::OpenMode, AfcClient, FileKind},
    DeviceConnection, MuxdevError,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

const MAGIC: u64 = 0x4141504c36414643;

const OP_STATUS: u64 = 0x01;
const OP_DATA: u64 = 0x02;
const OP_READ_DIR: u64 = 0x03;
const OP_REMOVE_PATH: u64 = 0x08;
const OP_GET_FILE_INFO: u64 = 0x0A;
const OP_FILE_OPEN: u64 = 0x0D;
const OP_FILE_OPEN_RES: u64 = 0x0E;
const OP_FILE_READ: u64 = 0x0F;
const OP_FILE_WRITE: u64 = 0x10;
const OP_FILE_TELL: u64 = 0x12;
const OP_FILE_TELL_RES: u64 = 0x13;
const OP_FILE_CLOSE: u64 = 0x14;

const STATUS_OK: u64 = 0;
const STATUS_NOT_FOUND: u64 = 8;
const STATUS_DIR_NOT_EMPTY: u64 = 33;

#[derive(Default, Clone)]
struct StubFs {
    files: HashMap<String, Vec<u8>>,
    dirs: HashSet<String>,
}

impl StubFs {
    fn children(&self, dir: &str) -> Vec<String> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{dir}/")
        };
        let mut names: Vec<String> = self
            .files
            .keys()
            .chain(self.dirs.iter())
            .filter_map(|path| {
                let rest = path.strip_prefix(&prefix)?;
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect();
        names.sort();
        names
    }
}

struct Request {
    this_len: u64,
    total_len: u64,
    sequence_number: u64,
    op: u64,
    header_payload: Vec<u8>,
    payload: Vec<u8>,
}

async fn read_request(sock: &mut TcpStream) -> Option<Request> {
    let mut header = [0u8; 40];
    match sock.read_exact(&mut header).await {
        Ok(_) => {}
        Err(_) => return None, // client went away
    }
    let field = |i: usize| u64::from_le_bytes(header[i * 8..(i + 1) * 8].try_into().unwrap());
    assert_eq!(field(0), MAGIC, "bad magic from client");
    let total_len = field(1);
    let this_len = field(2);
    let sequence_number = field(3);
    let op = field(4);

    let mut header_payload = vec![0u8; (this_len - 40) as usize];
    sock.read_exact(&mut header_payload).await.unwrap();
    let mut payload = vec![0u8; (total_len - this_len) as usize];
    sock.read_exact(&mut payload).await.unwrap();

    Some(Request {
        this_len,
        total_len,
        sequence_number,
        op,
        header_payload,
        payload,
    })
}

async fn write_reply(sock: &mut TcpStream, op: u64, header_payload: &[u8], payload: &[u8]) {
    let this_len = 40 + header_payload.len() as u64;
    let total_len = this_len + payload.len() as u64;
    let mut frame = Vec::new();
    frame.extend_from_slice(&MAGIC.to_le_bytes());
    frame.extend_from_slice(&total_len.to_le_bytes());
    frame.extend_from_slice(&this_len.to_le_bytes());
    frame.extend_from_slice(&0u64.to_le_bytes());
    frame.extend_from_slice(&op.to_le_bytes());
    frame.extend_from_slice(header_payload);
    frame.extend_from_slice(payload);
    sock.write_all(&frame).await.unwrap();
}

async fn write_status(sock: &mut TcpStream, code: u64) {
    write_reply(sock, OP_STATUS, &code.to_le_bytes(), &[]).await;
}

fn kv_payload(pairs: &[(&str, String)]) -> Vec<u8> {
    let mut payload = Vec::new();
    for (key, value) in pairs {
        payload.extend_from_slice(key.as_bytes());
        payload.push(0);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
    }
    payload
}

/// Serves AFC on one connection until the client hangs up
async fn serve_afc(
    listener: TcpListener,
    mut fs: StubFs,
    read_sizes: Arc<Mutex<Vec<u64>>>,
) {
    let (mut sock, _) = listener.accept().await.unwrap();
    let mut expected_seq = 0u64;
    let mut next_fd = 1u64;
    let mut open_files: HashMap<u64, (String, usize)> = HashMap::new();

    while let Some(req) = read_request(&mut sock).await {
        assert_eq!(
            req.sequence_number, expected_seq,
            "sequence numbers must count up without gaps"
        );
        expected_seq += 1;

        match req.op {
            OP_READ_DIR => {
                let path = String::from_utf8(req.header_payload).unwrap();
                if fs.dirs.contains(&path) {
                    let mut listing = b".\0..\0".to_vec();
                    for name in fs.children(&path) {
                        listing.extend_from_slice(name.as_bytes());
                        listing.push(0);
                    }
                    write_reply(&mut sock, OP_DATA, &[], &listing).await;
                } else {
                    write_status(&mut sock, STATUS_NOT_FOUND).await;
                }
            }
            OP_GET_FILE_INFO => {
                let path = String::from_utf8(req.header_payload).unwrap();
                if let Some(contents) = fs.files.get(&path) {
                    let payload = kv_payload(&[
                        ("st_size", contents.len().to_string()),
                        ("st_blocks", "8".to_string()),
                        ("st_nlink", "1".to_string()),
                        ("st_ifmt", "S_IFREG".to_string()),
                        ("st_birthtime", "1700000000000000000".to_string()),
                        ("st_mtime", "1700000001000000000".to_string()),
                    ]);
                    write_reply(&mut sock, OP_DATA, &[], &payload).await;
                } else if fs.dirs.contains(&path) {
                    let payload = kv_payload(&[
                        ("st_size", "64".to_string()),
                        ("st_blocks", "0".to_string()),
                        ("st_nlink", "2".to_string()),
                        ("st_ifmt", "S_IFDIR".to_string()),
                        ("st_birthtime", "1700000000000000000".to_string()),
                        ("st_mtime", "1700000001000000000".to_string()),
                    ]);
                    write_reply(&mut sock, OP_DATA, &[], &payload).await;
                } else {
                    write_status(&mut sock, STATUS_NOT_FOUND).await;
                }
            }
            OP_FILE_OPEN => {
                let mode = u64::from_le_bytes(req.header_payload[..8].try_into().unwrap());
                let path = String::from_utf8(req.header_payload[8..].to_vec()).unwrap();
                let exists = fs.files.contains_key(&path);
                if !exists && mode == OpenMode::ReadOnly as u64 {
                    write_status(&mut sock, STATUS_NOT_FOUND).await;
                    continue;
                }
                if !exists {
                    fs.files.insert(path.clone(), Vec::new());
                }
                let fd = next_fd;
                next_fd += 1;
                open_files.insert(fd, (path, 0));
                write_reply(&mut sock, OP_FILE_OPEN_RES, &fd.to_le_bytes(), &[]).await;
            }
            OP_FILE_READ => {
                let fd = u64::from_le_bytes(req.header_payload[..8].try_into().unwrap());
                let size = u64::from_le_bytes(req.header_payload[8..16].try_into().unwrap());
                read_sizes.lock().unwrap().push(size);
                let (path, cursor) = open_files.get_mut(&fd).unwrap();
                let contents = &fs.files[path];
                let end = (*cursor + size as usize).min(contents.len());
                let chunk = contents[*cursor..end].to_vec();
                *cursor = end;
                write_reply(&mut sock, OP_DATA, &[], &chunk).await;
            }
            OP_FILE_WRITE => {
                // The handle rides in the header segment, the data after it
                assert_eq!(req.this_len, 48, "write must split header and bulk");
                assert_eq!(req.total_len, 48 + req.payload.len() as u64);
                let fd = u64::from_le_bytes(req.header_payload[..8].try_into().unwrap());
                let (path, cursor) = open_files.get_mut(&fd).unwrap();
                let contents = fs.files.get_mut(path).unwrap();
                contents.truncate(*cursor);
                contents.extend_from_slice(&req.payload);
                *cursor = contents.len();
                write_status(&mut sock, STATUS_OK).await;
            }
            OP_FILE_TELL => {
                let fd = u64::from_le_bytes(req.header_payload[..8].try_into().unwrap());
                let (_, cursor) = open_files.get(&fd).unwrap();
                write_reply(
                    &mut sock,
                    OP_FILE_TELL_RES,
                    &(*cursor as u64).to_le_bytes(),
                    &[],
                )
                .await;
            }
            OP_FILE_CLOSE => {
                let fd = u64::from_le_bytes(req.header_payload[..8].try_into().unwrap());
                open_files.remove(&fd);
                write_status(&mut sock, STATUS_OK).await;
            }
            OP_REMOVE_PATH => {
                let path = String::from_utf8(req.header_payload).unwrap();
                if fs.files.remove(&path).is_some() {
                    write_status(&mut sock, STATUS_OK).await;
                } else if fs.dirs.contains(&path) {
                    if fs.children(&path).is_empty() {
                        fs.dirs.remove(&path);
                        write_status(&mut sock, STATUS_OK).await;
                    } else {
                        write_status(&mut sock, STATUS_DIR_NOT_EMPTY).await;
                    }
                } else {
                    write_status(&mut sock, STATUS_NOT_FOUND).await;
                }
            }
            other => panic!("stub got unexpected op {other:#x}"),
        }
    }
}

async fn afc_client(addr: std::net::SocketAddr) -> AfcClient {
    let sock = TcpStream::connect(addr).await.unwrap();
    AfcClient::new(DeviceConnection::new(Box::new(sock), "afc-test"))
}

fn scenario_fs() -> StubFs {
    let mut fs = StubFs::default();
    fs.dirs.insert("/".into());
    fs.dirs.insert("/a".into());
    fs.dirs.insert("/a/c".into());
    fs.files.insert("/a/b".into(), b"abc".to_vec());
    fs.files.insert("/a/c/d".into(), Vec::new());
    fs
}

#[tokio::test]
async fn walk_then_remove_all() {
    let (listener, addr) = common::listener().await;
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let stub = tokio::spawn(serve_afc(listener, scenario_fs(), sizes));

    let mut afc = afc_client(addr).await;

    let files = afc.walk("/a").await.unwrap();
    assert_eq!(files, vec!["/a/b".to_string(), "/a/c/d".to_string()]);

    let info = afc.get_file_info("/a/b").await.unwrap();
    assert_eq!(info.size, 3);
    assert_eq!(info.nlinks, 1);
    assert_eq!(info.kind, FileKind::Regular);
    assert!(afc.get_file_info("/a/c").await.unwrap().kind.is_dir());

    afc.remove_all("/a").await.unwrap();
    match afc.list_dir("/a").await {
        Err(MuxdevError::Afc(AfcError::ObjectNotFound)) => {}
        other => panic!("expected ObjectNotFound, got {other:?}"),
    }

    drop(afc);
    stub.await.unwrap();
}

#[tokio::test]
async fn listing_drops_dot_entries() {
    let (listener, addr) = common::listener().await;
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let stub = tokio::spawn(serve_afc(listener, scenario_fs(), sizes));

    let mut afc = afc_client(addr).await;
    let entries = afc.list_dir("/a").await.unwrap();
    assert_eq!(entries, vec!["b".to_string(), "c".to_string()]);

    drop(afc);
    stub.await.unwrap();
}

#[tokio::test]
async fn reads_are_capped_at_four_mebibytes() {
    let mut fs = StubFs::default();
    fs.dirs.insert("/".into());
    fs.files.insert("/big".into(), b"0123456789".to_vec());

    let (listener, addr) = common::listener().await;
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let stub = tokio::spawn(serve_afc(listener, fs, Arc::clone(&sizes)));

    let mut afc = afc_client(addr).await;
    let mut f = afc.open("/big", OpenMode::ReadOnly).await.unwrap();
    let contents = f.read(10 * 1024 * 1024).await.unwrap();
    assert_eq!(contents, b"0123456789");
    f.close().await.unwrap();

    assert_eq!(sizes.lock().unwrap().as_slice(), &[4 * 1024 * 1024]);

    drop(afc);
    stub.await.unwrap();
}

#[tokio::test]
async fn write_then_read_back() {
    let mut fs = StubFs::default();
    fs.dirs.insert("/".into());

    let (listener, addr) = common::listener().await;
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let stub = tokio::spawn(serve_afc(listener, fs, sizes));

    let mut afc = afc_client(addr).await;
    {
        let mut f = afc.open("/report.ips", OpenMode::WriteOnly).await.unwrap();
        f.write(b"crash goes here").await.unwrap();
        f.close().await.unwrap();
    }
    {
        let mut f = afc.open("/report.ips", OpenMode::ReadOnly).await.unwrap();
        assert_eq!(f.read_all().await.unwrap(), b"crash goes here");
        f.close().await.unwrap();
    }

    drop(afc);
    stub.await.unwrap();
}

#[tokio::test]
async fn removing_the_root_is_a_local_noop() {
    let mut fs = StubFs::default();
    fs.dirs.insert("/".into());

    let (listener, addr) = common::listener().await;
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let stub = tokio::spawn(serve_afc(listener, fs, sizes));

    let mut afc = afc_client(addr).await;
    // No round trip happens here; the stub would fail the sequence
    // assertion below if it did
    afc.remove("/").await.unwrap();

    // The first packet the stub sees must still carry sequence number 0
    let entries = afc.list_dir("/").await.unwrap();
    assert!(entries.is_empty());

    drop(afc);
    stub.await.unwrap();
}
