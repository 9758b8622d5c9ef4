//! Virtual filesystem: a mount table over heterogeneous backends, a file
//! descriptor table, and path resolution by longest mount-point prefix.
//!
//! Grounded on `original_source/fusion_os/common/vfs.h`'s `vfs_mount`/
//! `vfs_lookup`/`vfs_open`/... contract. The original dispatches per
//! mount through a `filesystem_driver_t` of function pointers; here that
//! collapses to [`FsBackend`], a sum type over the two backends this
//! kernel actually has (`Memory`, a tiny in-RAM tree for things like a
//! boot-time scratch mount, and [`talon_ext2`]'s on-disk driver) per the
//! redesign note against function-pointer tables over a fixed, known set
//! of implementations.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use spin::Mutex;
use talon_ext2::{BlockDevice, Ext2Config, Ext2Error};
use talon_log::{log, Level};

pub const MAX_MOUNTS: usize = 32;
pub const MAX_FDS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfsError {
    NoSuchMount,
    MountPointTaken,
    TooManyMounts,
    Ext2AlreadyMounted,
    TooManyFds,
    BadFd,
    NotFound,
    AlreadyExists,
    NotADirectory,
    IsADirectory,
    DirectoryNotEmpty,
    NameTooLong,
    Backend(Ext2Error),
}

impl From<Ext2Error> for VfsError {
    fn from(e: Ext2Error) -> Self {
        match e {
            Ext2Error::NotFound => VfsError::NotFound,
            Ext2Error::AlreadyExists => VfsError::AlreadyExists,
            Ext2Error::NotADirectory => VfsError::NotADirectory,
            Ext2Error::IsADirectory => VfsError::IsADirectory,
            Ext2Error::DirectoryNotEmpty => VfsError::DirectoryNotEmpty,
            Ext2Error::NameTooLong => VfsError::NameTooLong,
            other => VfsError::Backend(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    Memory,
    Ext2,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VfsOpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub append: bool,
}

impl VfsOpenFlags {
    pub const fn read_only() -> Self {
        VfsOpenFlags { read: true, write: false, create: false, append: false }
    }
    pub const fn read_write() -> Self {
        VfsOpenFlags { read: true, write: true, create: false, append: false }
    }
    pub const fn create_write() -> Self {
        VfsOpenFlags { read: true, write: true, create: true, append: false }
    }
}

#[derive(Debug, Clone)]
enum MemNode {
    Dir,
    File(Vec<u8>),
}

/// Tiny flat in-RAM tree: entries are keyed by their full path relative to
/// the mount's root ("" is that root and always implicitly a directory).
/// Adequate for scratch/boot-time mounts; the real persistent filesystem
/// is [`talon_ext2`].
struct MemoryFs {
    entries: Vec<(String, MemNode)>,
}

impl MemoryFs {
    fn new() -> Self {
        MemoryFs { entries: Vec::new() }
    }

    fn parent_of(path: &str) -> String {
        match path.rfind('/') {
            Some(idx) => path[..idx].to_string(),
            None => String::new(),
        }
    }

    fn parent_exists_and_is_dir(&self, path: &str) -> bool {
        let parent = Self::parent_of(path);
        if parent.is_empty() {
            return true;
        }
        matches!(self.find(&parent), Some(MemNode::Dir))
    }

    fn find(&self, path: &str) -> Option<&MemNode> {
        if path.is_empty() {
            return Some(&MemNode::Dir);
        }
        self.entries.iter().find(|(p, _)| p == path).map(|(_, n)| n)
    }

    fn find_mut(&mut self, path: &str) -> Option<&mut MemNode> {
        self.entries.iter_mut().find(|(p, _)| p == path).map(|(_, n)| n)
    }

    fn create(&mut self, path: &str, node: MemNode) -> Result<(), VfsError> {
        if path.len() > 255 {
            return Err(VfsError::NameTooLong);
        }
        if !self.parent_exists_and_is_dir(path) {
            return Err(VfsError::NotFound);
        }
        if self.find(path).is_some() {
            return Err(VfsError::AlreadyExists);
        }
        self.entries.push((path.to_string(), node));
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<MemNode, VfsError> {
        let idx = self.entries.iter().position(|(p, _)| p == path).ok_or(VfsError::NotFound)?;
        Ok(self.entries.remove(idx).1)
    }

    fn children(&self, dir: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter_map(|(p, _)| {
                let rest = if dir.is_empty() { p.as_str() } else { p.strip_prefix(dir)?.strip_prefix('/')? };
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect()
    }

    fn is_empty_dir(&self, dir: &str) -> bool {
        self.children(dir).is_empty()
    }
}

enum FsBackend {
    Memory(MemoryFs),
    Ext2,
}

struct Mount {
    id: u64,
    prefix: String,
    backend: FsBackend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendHandle {
    MemoryFile,
    MemoryDir,
    Ext2(u32),
}

struct OpenFile {
    mount_id: u64,
    rel_path: String,
    handle: BackendHandle,
    offset: u32,
    flags: VfsOpenFlags,
}

struct VfsState {
    mounts: Vec<Mount>,
    next_mount_id: u64,
    ext2_mounted: bool,
    fds: [Option<OpenFile>; MAX_FDS],
}

const NONE_FD: Option<OpenFile> = None;

impl VfsState {
    fn new() -> Self {
        VfsState { mounts: Vec::new(), next_mount_id: 1, ext2_mounted: false, fds: [NONE_FD; MAX_FDS] }
    }

    /// Longest mount-point prefix that is itself `/` or an exact
    /// path-segment boundary of `path`.
    fn resolve_mount<'p>(&self, path: &'p str) -> Option<(usize, &'p str)> {
        self.mounts
            .iter()
            .enumerate()
            .filter(|(_, m)| {
                path == m.prefix
                    || (m.prefix == "/" && path.starts_with('/'))
                    || path.starts_with(&(m.prefix.clone() + "/"))
            })
            .max_by_key(|(_, m)| m.prefix.len())
            .map(|(i, m)| {
                let rel = if m.prefix == "/" {
                    path.trim_start_matches('/')
                } else {
                    path[m.prefix.len()..].trim_start_matches('/')
                };
                (i, rel)
            })
    }

    fn free_fd_slot(&self) -> Option<usize> {
        self.fds.iter().position(|f| f.is_none())
    }
}

lazy_static::lazy_static! {
    static ref VFS: Mutex<VfsState> = Mutex::new(VfsState::new());
}

pub fn init() {
    let mut s = VFS.lock();
    *s = VfsState::new();
    log!(Level::Info, "vfs", "mount table initialized");
}

pub fn mount_memory(prefix: &str) -> Result<u64, VfsError> {
    let mut s = VFS.lock();
    if s.mounts.iter().any(|m| m.prefix == prefix) {
        return Err(VfsError::MountPointTaken);
    }
    if s.mounts.len() >= MAX_MOUNTS {
        return Err(VfsError::TooManyMounts);
    }
    let id = s.next_mount_id;
    s.next_mount_id += 1;
    s.mounts.push(Mount { id, prefix: prefix.to_string(), backend: FsBackend::Memory(MemoryFs::new()) });
    log!(Level::Debug, "vfs", "mounted memfs at {}", prefix);
    Ok(id)
}

/// Formats `device` as ext2 (via [`talon_ext2::mount`]) and mounts it at
/// `prefix`. Only one ext2 mount may exist at a time, matching the
/// single-block-device driver underneath.
pub fn mount_ext2(prefix: &str, device: Box<dyn BlockDevice>, config: Ext2Config) -> Result<u64, VfsError> {
    let mut s = VFS.lock();
    if s.ext2_mounted {
        return Err(VfsError::Ext2AlreadyMounted);
    }
    if s.mounts.iter().any(|m| m.prefix == prefix) {
        return Err(VfsError::MountPointTaken);
    }
    if s.mounts.len() >= MAX_MOUNTS {
        return Err(VfsError::TooManyMounts);
    }
    talon_ext2::mount(device, config)?;
    let id = s.next_mount_id;
    s.next_mount_id += 1;
    s.mounts.push(Mount { id, prefix: prefix.to_string(), backend: FsBackend::Ext2 });
    s.ext2_mounted = true;
    log!(Level::Info, "vfs", "mounted ext2 at {}", prefix);
    Ok(id)
}

pub fn umount(mount_id: u64) -> Result<(), VfsError> {
    let mut s = VFS.lock();
    let idx = s.mounts.iter().position(|m| m.id == mount_id).ok_or(VfsError::NoSuchMount)?;
    if s.fds.iter().flatten().any(|f| f.mount_id == mount_id) {
        return Err(VfsError::DirectoryNotEmpty);
    }
    let mount = s.mounts.remove(idx);
    if matches!(mount.backend, FsBackend::Ext2) {
        let _ = talon_ext2::umount();
        s.ext2_mounted = false;
    }
    Ok(())
}

fn ext2_path(rel: &str) -> String {
    if rel.is_empty() {
        "/".to_string()
    } else {
        alloc::format!("/{}", rel)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VfsStat {
    pub size: u32,
    pub is_dir: bool,
    pub links_count: u16,
}

pub fn stat(path: &str) -> Result<VfsStat, VfsError> {
    let s = VFS.lock();
    let (idx, rel) = s.resolve_mount(path).ok_or(VfsError::NoSuchMount)?;
    match &s.mounts[idx].backend {
        FsBackend::Memory(fs) => match fs.find(rel).ok_or(VfsError::NotFound)? {
            MemNode::Dir => Ok(VfsStat { size: 0, is_dir: true, links_count: 1 }),
            MemNode::File(data) => Ok(VfsStat { size: data.len() as u32, is_dir: false, links_count: 1 }),
        },
        FsBackend::Ext2 => {
            let inode = talon_ext2::find_inode(&ext2_path(rel))?;
            let st = talon_ext2::stat(inode)?;
            Ok(VfsStat { size: st.size, is_dir: st.is_dir, links_count: st.links_count })
        }
    }
}

pub fn mkdir(path: &str) -> Result<(), VfsError> {
    let mut s = VFS.lock();
    let (idx, rel) = s.resolve_mount(path).ok_or(VfsError::NoSuchMount)?;
    match &mut s.mounts[idx].backend {
        FsBackend::Memory(fs) => fs.create(rel, MemNode::Dir),
        FsBackend::Ext2 => {
            let parent_rel = MemoryFs::parent_of(rel);
            let name = rel.rsplit('/').next().unwrap_or(rel);
            let parent = talon_ext2::find_inode(&ext2_path(&parent_rel))?;
            talon_ext2::mkdir(parent, name, 0o755)?;
            Ok(())
        }
    }
}

pub fn rmdir(path: &str) -> Result<(), VfsError> {
    let mut s = VFS.lock();
    let (idx, rel) = s.resolve_mount(path).ok_or(VfsError::NoSuchMount)?;
    match &mut s.mounts[idx].backend {
        FsBackend::Memory(fs) => {
            match fs.find(rel).ok_or(VfsError::NotFound)? {
                MemNode::Dir => {}
                MemNode::File(_) => return Err(VfsError::NotADirectory),
            }
            if !fs.is_empty_dir(rel) {
                return Err(VfsError::DirectoryNotEmpty);
            }
            fs.remove(rel).map(|_| ())
        }
        FsBackend::Ext2 => {
            let parent_rel = MemoryFs::parent_of(rel);
            let name = rel.rsplit('/').next().unwrap_or(rel);
            let parent = talon_ext2::find_inode(&ext2_path(&parent_rel))?;
            talon_ext2::rmdir(parent, name)?;
            Ok(())
        }
    }
}

pub fn unlink(path: &str) -> Result<(), VfsError> {
    let mut s = VFS.lock();
    let (idx, rel) = s.resolve_mount(path).ok_or(VfsError::NoSuchMount)?;
    match &mut s.mounts[idx].backend {
        FsBackend::Memory(fs) => {
            match fs.find(rel).ok_or(VfsError::NotFound)? {
                MemNode::File(_) => {}
                MemNode::Dir => return Err(VfsError::IsADirectory),
            }
            fs.remove(rel).map(|_| ())
        }
        FsBackend::Ext2 => {
            let parent_rel = MemoryFs::parent_of(rel);
            let name = rel.rsplit('/').next().unwrap_or(rel);
            let parent = talon_ext2::find_inode(&ext2_path(&parent_rel))?;
            talon_ext2::unlink(parent, name)?;
            Ok(())
        }
    }
}

pub fn getdents(path: &str) -> Result<Vec<String>, VfsError> {
    let s = VFS.lock();
    let (idx, rel) = s.resolve_mount(path).ok_or(VfsError::NoSuchMount)?;
    match &s.mounts[idx].backend {
        FsBackend::Memory(fs) => Ok(fs.children(rel)),
        FsBackend::Ext2 => {
            let inode = talon_ext2::find_inode(&ext2_path(rel))?;
            Ok(talon_ext2::read_directory(inode)?.into_iter().map(|e| e.name.to_string()).collect())
        }
    }
}

pub fn open(path: &str, flags: VfsOpenFlags) -> Result<u64, VfsError> {
    let mut s = VFS.lock();
    let (idx, rel) = s.resolve_mount(path).ok_or(VfsError::NoSuchMount)?;
    let mount_id = s.mounts[idx].id;
    let handle = match &mut s.mounts[idx].backend {
        FsBackend::Memory(fs) => {
            let exists = fs.find(rel).is_some();
            if !exists {
                if flags.create {
                    fs.create(rel, MemNode::File(Vec::new()))?;
                } else {
                    return Err(VfsError::NotFound);
                }
            }
            match fs.find(rel).unwrap() {
                MemNode::Dir => BackendHandle::MemoryDir,
                MemNode::File(_) => BackendHandle::MemoryFile,
            }
        }
        FsBackend::Ext2 => {
            let full = ext2_path(rel);
            let inode_num = match talon_ext2::find_inode(&full) {
                Ok(n) => n,
                Err(Ext2Error::NotFound) if flags.create => {
                    let parent_rel = MemoryFs::parent_of(rel);
                    let name = rel.rsplit('/').next().unwrap_or(rel);
                    let parent = talon_ext2::find_inode(&ext2_path(&parent_rel))?;
                    talon_ext2::create_file(parent, name, 0o644)?
                }
                Err(e) => return Err(e.into()),
            };
            BackendHandle::Ext2(inode_num)
        }
    };
    let slot = s.free_fd_slot().ok_or(VfsError::TooManyFds)?;
    let offset = if flags.append {
        match stat_handle(&s.mounts[idx], rel) {
            Ok(st) => st.size,
            Err(_) => 0,
        }
    } else {
        0
    };
    s.fds[slot] = Some(OpenFile { mount_id, rel_path: rel.to_string(), handle, offset, flags });
    Ok(slot as u64)
}

fn stat_handle(mount: &Mount, rel: &str) -> Result<VfsStat, VfsError> {
    match &mount.backend {
        FsBackend::Memory(fs) => match fs.find(rel).ok_or(VfsError::NotFound)? {
            MemNode::Dir => Ok(VfsStat { size: 0, is_dir: true, links_count: 1 }),
            MemNode::File(data) => Ok(VfsStat { size: data.len() as u32, is_dir: false, links_count: 1 }),
        },
        FsBackend::Ext2 => {
            let inode = talon_ext2::find_inode(&ext2_path(rel))?;
            let st = talon_ext2::stat(inode)?;
            Ok(VfsStat { size: st.size, is_dir: st.is_dir, links_count: st.links_count })
        }
    }
}

pub fn close(fd: u64) -> Result<(), VfsError> {
    let mut s = VFS.lock();
    let slot = s.fds.get_mut(fd as usize).ok_or(VfsError::BadFd)?;
    if slot.is_none() {
        return Err(VfsError::BadFd);
    }
    *slot = None;
    Ok(())
}

pub fn read(fd: u64, buf: &mut [u8]) -> Result<usize, VfsError> {
    let mut s = VFS.lock();
    let file = s.fds.get_mut(fd as usize).and_then(|f| f.as_mut()).ok_or(VfsError::BadFd)?;
    if !file.flags.read {
        return Err(VfsError::BadFd);
    }
    let mount_id = file.mount_id;
    let rel_path = file.rel_path.clone();
    let offset = file.offset;
    let mount = s.mounts.iter().find(|m| m.id == mount_id).ok_or(VfsError::NoSuchMount)?;
    let n = match &mount.backend {
        FsBackend::Memory(fs) => match fs.find(&rel_path).ok_or(VfsError::NotFound)? {
            MemNode::Dir => return Err(VfsError::IsADirectory),
            MemNode::File(data) => {
                let start = (offset as usize).min(data.len());
                let n = buf.len().min(data.len() - start);
                buf[..n].copy_from_slice(&data[start..start + n]);
                n
            }
        },
        FsBackend::Ext2 => {
            let inode = talon_ext2::find_inode(&ext2_path(&rel_path))?;
            talon_ext2::read_data(inode, offset, buf)?
        }
    };
    let file = s.fds.get_mut(fd as usize).and_then(|f| f.as_mut()).unwrap();
    file.offset += n as u32;
    Ok(n)
}

pub fn write(fd: u64, buf: &[u8]) -> Result<usize, VfsError> {
    let mut s = VFS.lock();
    let (mount_id, rel_path, offset) = {
        let file = s.fds.get_mut(fd as usize).and_then(|f| f.as_mut()).ok_or(VfsError::BadFd)?;
        if !file.flags.write {
            return Err(VfsError::BadFd);
        }
        (file.mount_id, file.rel_path.clone(), file.offset)
    };
    let idx = s.mounts.iter().position(|m| m.id == mount_id).ok_or(VfsError::NoSuchMount)?;
    let n = match &mut s.mounts[idx].backend {
        FsBackend::Memory(fs) => match fs.find_mut(&rel_path).ok_or(VfsError::NotFound)? {
            MemNode::Dir => return Err(VfsError::IsADirectory),
            MemNode::File(data) => {
                let end = offset as usize + buf.len();
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[offset as usize..end].copy_from_slice(buf);
                buf.len()
            }
        },
        FsBackend::Ext2 => {
            let inode = talon_ext2::find_inode(&ext2_path(&rel_path))?;
            talon_ext2::write_data(inode, offset, buf)?
        }
    };
    let file = s.fds.get_mut(fd as usize).and_then(|f| f.as_mut()).unwrap();
    file.offset += n as u32;
    Ok(n)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Cur,
    End,
}

/// Computes the new position per `whence` and clamps it to `[0, size]`,
/// per spec.md §4.G.
pub fn seek(fd: u64, offset: i64, whence: SeekWhence) -> Result<u32, VfsError> {
    let mut s = VFS.lock();
    let (mount_id, rel_path, current) = {
        let file = s.fds.get(fd as usize).and_then(|f| f.as_ref()).ok_or(VfsError::BadFd)?;
        (file.mount_id, file.rel_path.clone(), file.offset)
    };
    let mount = s.mounts.iter().find(|m| m.id == mount_id).ok_or(VfsError::NoSuchMount)?;
    let size = stat_handle(mount, &rel_path)?.size;

    let base: i64 = match whence {
        SeekWhence::Set => 0,
        SeekWhence::Cur => current as i64,
        SeekWhence::End => size as i64,
    };
    let target = base.saturating_add(offset).clamp(0, size as i64) as u32;

    let file = s.fds.get_mut(fd as usize).and_then(|f| f.as_mut()).unwrap();
    file.offset = target;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use talon_ext2::MemoryBlockDevice;

    fn fresh() {
        init();
    }

    #[test]
    fn mkdir_open_close_double_close_fails() {
        fresh();
        mount_memory("/").unwrap();
        mkdir("/etc").unwrap();
        let fd = open("/etc/motd", VfsOpenFlags::create_write()).unwrap();
        close(fd).unwrap();
        assert_eq!(close(fd).unwrap_err(), VfsError::BadFd);
    }

    #[test]
    fn write_then_read_round_trips() {
        fresh();
        mount_memory("/").unwrap();
        let fd = open("/greeting", VfsOpenFlags::create_write()).unwrap();
        write(fd, b"hello").unwrap();
        close(fd).unwrap();
        let fd = open("/greeting", VfsOpenFlags::read_only()).unwrap();
        let mut buf = [0u8; 16];
        let n = read(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn longest_prefix_mount_wins() {
        fresh();
        mount_memory("/").unwrap();
        mount_memory("/mnt").unwrap();
        let fd = open("/mnt/data", VfsOpenFlags::create_write()).unwrap();
        close(fd).unwrap();
        assert!(stat("/mnt/data").unwrap().size == 0);
        assert_eq!(stat("/data").unwrap_err(), VfsError::NotFound);
    }

    #[test]
    fn rmdir_requires_empty() {
        fresh();
        mount_memory("/").unwrap();
        mkdir("/a").unwrap();
        let fd = open("/a/f", VfsOpenFlags::create_write()).unwrap();
        close(fd).unwrap();
        assert_eq!(rmdir("/a").unwrap_err(), VfsError::DirectoryNotEmpty);
        unlink("/a/f").unwrap();
        rmdir("/a").unwrap();
    }

    #[test]
    fn ext2_backend_mounts_and_serves_files() {
        fresh();
        mount_ext2("/disk", Box::new(MemoryBlockDevice::new(8192)), Ext2Config::default()).unwrap();
        let fd = open("/disk/readme.txt", VfsOpenFlags::create_write()).unwrap();
        write(fd, b"on disk").unwrap();
        close(fd).unwrap();
        let fd = open("/disk/readme.txt", VfsOpenFlags::read_only()).unwrap();
        let mut buf = [0u8; 16];
        let n = read(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"on disk");
        close(fd).unwrap();
    }

    #[test]
    fn only_one_ext2_mount_allowed() {
        fresh();
        mount_ext2("/a", Box::new(MemoryBlockDevice::new(8192)), Ext2Config::default()).unwrap();
        assert_eq!(
            mount_ext2("/b", Box::new(MemoryBlockDevice::new(8192)), Ext2Config::default()).unwrap_err(),
            VfsError::Ext2AlreadyMounted
        );
    }

    #[test]
    fn getdents_lists_children() {
        fresh();
        mount_memory("/").unwrap();
        mkdir("/dir").unwrap();
        close(open("/dir/a", VfsOpenFlags::create_write()).unwrap()).unwrap();
        close(open("/dir/b", VfsOpenFlags::create_write()).unwrap()).unwrap();
        let mut names = getdents("/dir").unwrap();
        names.sort();
        assert_eq!(names, alloc::vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn seek_write_seek_read_round_trips() {
        fresh();
        mount_memory("/").unwrap();
        let fd = open("/log", VfsOpenFlags::create_write()).unwrap();
        let buf = b"0123456789";
        write(fd, buf).unwrap();
        seek(fd, -(buf.len() as i64), SeekWhence::Cur).unwrap();
        let mut tmp = [0u8; 10];
        read(fd, &mut tmp).unwrap();
        assert_eq!(&tmp, buf);
        close(fd).unwrap();
    }

    #[test]
    fn seek_clamps_to_file_bounds() {
        fresh();
        mount_memory("/").unwrap();
        let fd = open("/log", VfsOpenFlags::create_write()).unwrap();
        write(fd, b"abc").unwrap();
        assert_eq!(seek(fd, -100, SeekWhence::Cur).unwrap(), 0);
        assert_eq!(seek(fd, 0, SeekWhence::End).unwrap(), 3);
        assert_eq!(seek(fd, 100, SeekWhence::End).unwrap(), 3);
    }
}
