//! Filesystem driver: a fixed-layout request/response wire protocol meant
//! to travel over [`talon_ipc`](../talon_ipc), dispatching onto
//! [`talon_vfs`].
//!
//! Grounded on `original_source/fusion_os/dolphin/fs_driver.h`'s
//! `fs_operation_t`/`fs_request_t`/`fs_response_t`. The original's
//! `fs_driver_process` switches on `operation` over a function-pointer-free
//! big match; [`process`] here does the same over [`FsOperation`]. Buffer
//! sizes (`MAX_BUFFER_BYTES`, `MAX_PATH_BYTES`) are carried over unchanged
//! since they define the wire format callers on the other end of an IPC
//! queue must agree on.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::string::ToString;
use heapless::{String as HString, Vec as HVec};
use spin::Mutex;
use talon_log::{log, Level};
use talon_vfs::{VfsError, VfsOpenFlags};

pub const MAX_BUFFER_BYTES: usize = 4096;
pub const MAX_PATH_BYTES: usize = 256;
pub const MAX_FILENAME_BYTES: usize = 64;
pub const MAX_OPEN_FILES: usize = 128;
pub const MAX_INDEX_ENTRIES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsOperation {
    Open = 1,
    Read = 2,
    Write = 3,
    Close = 4,
    Mkdir = 5,
    Rmdir = 6,
    Unlink = 7,
    Stat = 8,
    List = 9,
    Seek = 10,
    Create = 11,
}

impl FsOperation {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => FsOperation::Open,
            2 => FsOperation::Read,
            3 => FsOperation::Write,
            4 => FsOperation::Close,
            5 => FsOperation::Mkdir,
            6 => FsOperation::Rmdir,
            7 => FsOperation::Unlink,
            8 => FsOperation::Stat,
            9 => FsOperation::List,
            10 => FsOperation::Seek,
            11 => FsOperation::Create,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FsRequest {
    pub operation: FsOperation,
    pub file_id: u32,
    pub flags: u32,
    pub permissions: u32,
    pub offset: u32,
    pub whence: u32,
    pub path: HString<MAX_PATH_BYTES>,
    pub buffer: HVec<u8, MAX_BUFFER_BYTES>,
}

#[derive(Debug, Clone)]
pub struct FsResponse {
    pub status: i32,
    pub file_id: u32,
    pub bytes_read: u32,
    pub bytes_written: u32,
    pub file_size: u32,
    pub file_type: u32,
    pub permissions: u32,
    pub result_buffer: HVec<u8, MAX_BUFFER_BYTES>,
}

impl FsResponse {
    fn error(status: i32) -> Self {
        FsResponse {
            status,
            file_id: 0,
            bytes_read: 0,
            bytes_written: 0,
            file_size: 0,
            file_type: 0,
            permissions: 0,
            result_buffer: HVec::new(),
        }
    }

    fn ok() -> Self {
        FsResponse::error(0)
    }
}

const FILE_TYPE_REGULAR: u32 = 1;
const FILE_TYPE_DIRECTORY: u32 = 2;

fn status_of(err: VfsError) -> i32 {
    match err {
        VfsError::NotFound => -2,
        VfsError::AlreadyExists => -3,
        VfsError::NotADirectory => -4,
        VfsError::IsADirectory => -5,
        VfsError::DirectoryNotEmpty => -6,
        VfsError::NameTooLong => -7,
        VfsError::TooManyFds | VfsError::BadFd => -8,
        _ => -1,
    }
}

/// Cheap STAT/LIST answers without round-tripping through the VFS mount
/// table, kept in step with every mutating operation this driver itself
/// performs (a file created, deleted, or moved outside this driver's view
/// goes stale until the next operation that touches it).
#[derive(Debug, Clone)]
struct IndexEntry {
    path: HString<MAX_PATH_BYTES>,
    is_dir: bool,
    size: u32,
    permissions: u32,
}

struct OpenEntry {
    file_id: u32,
    vfs_fd: u64,
}

struct FsdState {
    index: HVec<IndexEntry, MAX_INDEX_ENTRIES>,
    open_files: HVec<OpenEntry, MAX_OPEN_FILES>,
    next_file_id: u32,
}

impl FsdState {
    fn new() -> Self {
        FsdState { index: HVec::new(), open_files: HVec::new(), next_file_id: 1 }
    }

    fn index_put(&mut self, path: &str, is_dir: bool, size: u32, permissions: u32) {
        let entry_path = match HString::try_from(path) {
            Ok(p) => p,
            Err(_) => return,
        };
        if let Some(existing) = self.index.iter_mut().find(|e| e.path == entry_path) {
            existing.is_dir = is_dir;
            existing.size = size;
            existing.permissions = permissions;
            return;
        }
        let _ = self.index.push(IndexEntry { path: entry_path, is_dir, size, permissions });
    }

    fn index_remove(&mut self, path: &str) {
        if let Some(i) = self.index.iter().position(|e| e.path.as_str() == path) {
            self.index.swap_remove(i);
        }
    }

    fn vfs_fd_of(&self, file_id: u32) -> Option<u64> {
        self.open_files.iter().find(|o| o.file_id == file_id).map(|o| o.vfs_fd)
    }
}

lazy_static::lazy_static! {
    static ref FSD: Mutex<FsdState> = Mutex::new(FsdState::new());
}

pub fn init() {
    *FSD.lock() = FsdState::new();
    log!(Level::Info, "fsd", "driver initialized");
}

/// Dispatches one request, mirroring `fs_driver_process`'s big switch on
/// `operation`.
pub fn process(req: &FsRequest) -> FsResponse {
    match req.operation {
        FsOperation::Open | FsOperation::Create => handle_open(req),
        FsOperation::Read => handle_read(req),
        FsOperation::Write => handle_write(req),
        FsOperation::Close => handle_close(req),
        FsOperation::Mkdir => handle_mkdir(req),
        FsOperation::Rmdir => handle_rmdir(req),
        FsOperation::Unlink => handle_unlink(req),
        FsOperation::Stat => handle_stat(req),
        FsOperation::List => handle_list(req),
        FsOperation::Seek => handle_seek(req),
    }
}

fn handle_open(req: &FsRequest) -> FsResponse {
    let mut s = FSD.lock();
    let create = req.operation == FsOperation::Create || req.flags & 0x1 != 0;
    let flags = if create { VfsOpenFlags::create_write() } else { VfsOpenFlags::read_write() };
    match talon_vfs::open(req.path.as_str(), flags) {
        Ok(vfs_fd) => {
            let file_id = s.next_file_id;
            s.next_file_id += 1;
            if s.open_files.push(OpenEntry { file_id, vfs_fd }).is_err() {
                let _ = talon_vfs::close(vfs_fd);
                return FsResponse::error(-9);
            }
            let st = talon_vfs::stat(req.path.as_str()).ok();
            if let Some(st) = st {
                s.index_put(
                    req.path.as_str(),
                    st.is_dir,
                    st.size,
                    (req.permissions & 0o777).max(0o644),
                );
            }
            let mut resp = FsResponse::ok();
            resp.file_id = file_id;
            resp
        }
        Err(e) => FsResponse::error(status_of(e)),
    }
}

fn handle_read(req: &FsRequest) -> FsResponse {
    let s = FSD.lock();
    let vfs_fd = match s.vfs_fd_of(req.file_id) {
        Some(fd) => fd,
        None => return FsResponse::error(-8),
    };
    drop(s);
    let mut buf = [0u8; MAX_BUFFER_BYTES];
    let want = req.buffer.len().max(1).min(MAX_BUFFER_BYTES);
    match talon_vfs::read(vfs_fd, &mut buf[..want]) {
        Ok(n) => {
            let mut resp = FsResponse::ok();
            resp.bytes_read = n as u32;
            resp.file_id = req.file_id;
            let _ = resp.result_buffer.extend_from_slice(&buf[..n]);
            resp
        }
        Err(e) => FsResponse::error(status_of(e)),
    }
}

fn handle_write(req: &FsRequest) -> FsResponse {
    let s = FSD.lock();
    let vfs_fd = match s.vfs_fd_of(req.file_id) {
        Some(fd) => fd,
        None => return FsResponse::error(-8),
    };
    drop(s);
    match talon_vfs::write(vfs_fd, &req.buffer) {
        Ok(n) => {
            let mut resp = FsResponse::ok();
            resp.bytes_written = n as u32;
            resp.file_id = req.file_id;
            resp
        }
        Err(e) => FsResponse::error(status_of(e)),
    }
}

fn handle_close(req: &FsRequest) -> FsResponse {
    let mut s = FSD.lock();
    let idx = match s.open_files.iter().position(|o| o.file_id == req.file_id) {
        Some(i) => i,
        None => return FsResponse::error(-8),
    };
    let entry = s.open_files.swap_remove(idx);
    match talon_vfs::close(entry.vfs_fd) {
        Ok(()) => FsResponse::ok(),
        Err(e) => FsResponse::error(status_of(e)),
    }
}

fn handle_mkdir(req: &FsRequest) -> FsResponse {
    let mut s = FSD.lock();
    match talon_vfs::mkdir(req.path.as_str()) {
        Ok(()) => {
            s.index_put(req.path.as_str(), true, 0, req.permissions & 0o777);
            FsResponse::ok()
        }
        Err(e) => FsResponse::error(status_of(e)),
    }
}

fn handle_rmdir(req: &FsRequest) -> FsResponse {
    let mut s = FSD.lock();
    match talon_vfs::rmdir(req.path.as_str()) {
        Ok(()) => {
            s.index_remove(req.path.as_str());
            FsResponse::ok()
        }
        Err(e) => FsResponse::error(status_of(e)),
    }
}

fn handle_unlink(req: &FsRequest) -> FsResponse {
    let mut s = FSD.lock();
    match talon_vfs::unlink(req.path.as_str()) {
        Ok(()) => {
            s.index_remove(req.path.as_str());
            FsResponse::ok()
        }
        Err(e) => FsResponse::error(status_of(e)),
    }
}

fn handle_stat(req: &FsRequest) -> FsResponse {
    {
        let s = FSD.lock();
        if let Some(entry) = s.index.iter().find(|e| e.path.as_str() == req.path.as_str()) {
            let mut resp = FsResponse::ok();
            resp.file_size = entry.size;
            resp.file_type = if entry.is_dir { FILE_TYPE_DIRECTORY } else { FILE_TYPE_REGULAR };
            resp.permissions = entry.permissions;
            return resp;
        }
    }
    match talon_vfs::stat(req.path.as_str()) {
        Ok(st) => {
            let mut resp = FsResponse::ok();
            resp.file_size = st.size;
            resp.file_type = if st.is_dir { FILE_TYPE_DIRECTORY } else { FILE_TYPE_REGULAR };
            FSD.lock().index_put(req.path.as_str(), st.is_dir, st.size, 0o644);
            resp
        }
        Err(e) => FsResponse::error(status_of(e)),
    }
}

fn handle_list(req: &FsRequest) -> FsResponse {
    match talon_vfs::getdents(req.path.as_str()) {
        Ok(names) => {
            let mut resp = FsResponse::ok();
            let joined = names.join("\n");
            let bytes = joined.as_bytes();
            let n = bytes.len().min(MAX_BUFFER_BYTES);
            let _ = resp.result_buffer.extend_from_slice(&bytes[..n]);
            resp.bytes_read = n as u32;
            resp
        }
        Err(e) => FsResponse::error(status_of(e)),
    }
}

fn handle_seek(req: &FsRequest) -> FsResponse {
    let s = FSD.lock();
    let vfs_fd = match s.vfs_fd_of(req.file_id) {
        Some(fd) => fd,
        None => return FsResponse::error(-8),
    };
    drop(s);
    let whence = match req.whence {
        0 => talon_vfs::SeekWhence::Set,
        1 => talon_vfs::SeekWhence::Cur,
        2 => talon_vfs::SeekWhence::End,
        _ => return FsResponse::error(-22),
    };
    match talon_vfs::seek(vfs_fd, req.offset as i64, whence) {
        Ok(pos) => {
            let mut resp = FsResponse::ok();
            resp.bytes_read = pos;
            resp
        }
        Err(e) => FsResponse::error(status_of(e)),
    }
}

/// Encodes a response into the fixed layout an IPC message payload
/// carries: a small header of little-endian integers followed by the
/// result buffer, truncated to whatever the caller's buffer can hold.
pub fn encode_response(resp: &FsResponse, out: &mut [u8]) -> usize {
    let header = [
        resp.status.to_le_bytes(),
        (resp.file_id as i32).to_le_bytes(),
        (resp.bytes_read as i32).to_le_bytes(),
        (resp.bytes_written as i32).to_le_bytes(),
        (resp.file_size as i32).to_le_bytes(),
    ];
    let mut off = 0;
    for field in header.iter() {
        if off + 4 > out.len() {
            return off;
        }
        out[off..off + 4].copy_from_slice(field);
        off += 4;
    }
    let n = resp.result_buffer.len().min(out.len().saturating_sub(off));
    out[off..off + n].copy_from_slice(&resp.result_buffer[..n]);
    off + n
}

pub fn make_request(operation: FsOperation, path: &str) -> Result<FsRequest, ()> {
    Ok(FsRequest {
        operation,
        file_id: 0,
        flags: 0,
        permissions: 0o644,
        offset: 0,
        whence: 0,
        path: HString::try_from(path).map_err(|_| ())?,
        buffer: HVec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() {
        talon_vfs::init();
        talon_vfs::mount_memory("/").unwrap();
        init();
    }

    #[test]
    fn create_write_read_close_round_trip() {
        fresh();
        let mut req = make_request(FsOperation::Create, "/greeting").unwrap();
        let resp = process(&req);
        assert_eq!(resp.status, 0);
        let file_id = resp.file_id;

        req.operation = FsOperation::Write;
        req.file_id = file_id;
        req.buffer.extend_from_slice(b"hello fsd").unwrap();
        let resp = process(&req);
        assert_eq!(resp.status, 0);
        assert_eq!(resp.bytes_written, 9);

        req.operation = FsOperation::Seek;
        req.offset = 0;
        let resp = process(&req);
        assert_eq!(resp.status, 0);

        req.operation = FsOperation::Read;
        req.buffer = HVec::new();
        req.buffer.resize(32, 0).unwrap();
        let resp = process(&req);
        assert_eq!(&resp.result_buffer[..resp.bytes_read as usize], b"hello fsd");

        req.operation = FsOperation::Close;
        let resp = process(&req);
        assert_eq!(resp.status, 0);
    }

    #[test]
    fn stat_served_from_index_after_create() {
        fresh();
        let req = make_request(FsOperation::Create, "/a").unwrap();
        let resp = process(&req);
        assert_eq!(resp.status, 0);
        let close_req = FsRequest { operation: FsOperation::Close, file_id: resp.file_id, ..make_request(FsOperation::Close, "/a").unwrap() };
        process(&close_req);

        let stat_req = make_request(FsOperation::Stat, "/a").unwrap();
        let resp = process(&stat_req);
        assert_eq!(resp.status, 0);
        assert_eq!(resp.file_type, FILE_TYPE_REGULAR);
    }

    #[test]
    fn mkdir_then_list_then_rmdir() {
        fresh();
        let req = make_request(FsOperation::Mkdir, "/dir").unwrap();
        assert_eq!(process(&req).status, 0);

        let create = make_request(FsOperation::Create, "/dir/f").unwrap();
        let resp = process(&create);
        let close = FsRequest { file_id: resp.file_id, ..make_request(FsOperation::Close, "/dir/f").unwrap() };
        process(&close);

        let list = make_request(FsOperation::List, "/dir").unwrap();
        let resp = process(&list);
        assert_eq!(resp.status, 0);
        assert_eq!(core::str::from_utf8(&resp.result_buffer[..resp.bytes_read as usize]).unwrap(), "f");

        let rmdir = make_request(FsOperation::Rmdir, "/dir").unwrap();
        assert_ne!(process(&rmdir).status, 0); // not empty yet

        let unlink = make_request(FsOperation::Unlink, "/dir/f").unwrap();
        assert_eq!(process(&unlink).status, 0);
        assert_eq!(process(&rmdir).status, 0);
    }

    #[test]
    fn read_on_unknown_file_id_errors() {
        fresh();
        let req = make_request(FsOperation::Read, "/nope").unwrap();
        assert_eq!(process(&req).status, -8);
    }

    #[test]
    fn encode_response_truncates_to_output_buffer() {
        fresh();
        let mut resp = FsResponse::ok();
        resp.result_buffer.extend_from_slice(b"0123456789").unwrap();
        let mut small = [0u8; 22];
        let n = encode_response(&resp, &mut small);
        assert_eq!(n, 22);
    }
}
