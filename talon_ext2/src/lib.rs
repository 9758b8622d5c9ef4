//! ext2-style single-group on-disk filesystem.
//!
//! Grounded on `original_source/fusion_os/common/ext2.c`: `ext2_mount`
//! always formats fresh rather than reading an existing superblock, so
//! `mount` here does the same — this driver's only entry point into
//! persistent state is a [`BlockDevice`], and "mounting" it means laying
//! down a brand new filesystem on it.
//!
//! Two behaviors of the original were judged unreasonable and resolved
//! explicitly rather than carried over: `allocate_inode` returning
//! `bg_inode_table + index` (off by the inode table's own block address,
//! not a 1-based inode number) is kept ONLY under
//! [`Ext2Config::legacy_inode_numbering`]; by default inodes are numbered
//! conventionally. `ext2_write_data` silently allocating a block past the
//! 12th direct pointer without ever recording it anywhere is replaced with
//! an explicit [`Ext2Error::NoIndirectBlocks`].
#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod bitmap;
mod inode;
mod superblock;

pub use inode::{DirEntry, Inode, DIRECT_BLOCKS, S_IFDIR, S_IFREG};
pub use superblock::{GroupDesc, SuperBlock, BLOCKS_PER_GROUP, BLOCK_SIZE, EXT2_MAGIC, ROOT_INODE};

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use inode::INODE_ON_DISK_BYTES;
use spin::Mutex;
use superblock::{GROUP_DESC_BYTES, SUPERBLOCK_BYTES};
use talon_log::{log, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ext2Error {
    NotMounted,
    AlreadyMounted,
    InvalidInode,
    NoSpace,
    Io,
    NotFound,
    NotADirectory,
    IsADirectory,
    NoIndirectBlocks,
    NameTooLong,
    AlreadyExists,
    DirectoryNotEmpty,
}

/// Storage backing a mounted filesystem. A real boot wires in a driver for
/// actual disk hardware (out of scope here); [`MemoryBlockDevice`] is the
/// in-memory stand-in used both by hosted tests and as a ramdisk.
pub trait BlockDevice: Send {
    fn block_count(&self) -> u32;
    fn read_block(&self, block_num: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), Ext2Error>;
    fn write_block(&mut self, block_num: u32, buf: &[u8; BLOCK_SIZE]) -> Result<(), Ext2Error>;
}

pub struct MemoryBlockDevice {
    blocks: Vec<[u8; BLOCK_SIZE]>,
}

impl MemoryBlockDevice {
    pub fn new(block_count: u32) -> Self {
        MemoryBlockDevice { blocks: vec![[0u8; BLOCK_SIZE]; block_count as usize] }
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn block_count(&self) -> u32 {
        self.blocks.len() as u32
    }

    fn read_block(&self, block_num: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), Ext2Error> {
        let block = self.blocks.get(block_num as usize).ok_or(Ext2Error::Io)?;
        buf.copy_from_slice(block);
        Ok(())
    }

    fn write_block(&mut self, block_num: u32, buf: &[u8; BLOCK_SIZE]) -> Result<(), Ext2Error> {
        let block = self.blocks.get_mut(block_num as usize).ok_or(Ext2Error::Io)?;
        block.copy_from_slice(buf);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Ext2Config {
    pub legacy_inode_numbering: bool,
}

const BLOCK_BITMAP_BLOCK: u32 = 3;
const INODE_BITMAP_BLOCK: u32 = 4;
const INODE_TABLE_START: u32 = 5;
const INODE_TABLE_BLOCKS: u32 = 100;
const DATA_BLOCK_START: u32 = INODE_TABLE_START + INODE_TABLE_BLOCKS;
const INODES_COUNT: u32 = 1000;

struct Ext2Fs {
    device: Box<dyn BlockDevice>,
    superblock: SuperBlock,
    group_desc: GroupDesc,
    config: Ext2Config,
}

impl Ext2Fs {
    fn read_block_raw(&self, block_num: u32) -> Result<[u8; BLOCK_SIZE], Ext2Error> {
        if block_num >= self.superblock.blocks_count {
            return Err(Ext2Error::Io);
        }
        let mut buf = [0u8; BLOCK_SIZE];
        self.device.read_block(block_num, &mut buf)?;
        Ok(buf)
    }

    fn write_block_raw(&mut self, block_num: u32, buf: &[u8; BLOCK_SIZE]) -> Result<(), Ext2Error> {
        if block_num >= self.superblock.blocks_count {
            return Err(Ext2Error::Io);
        }
        self.device.write_block(block_num, buf)
    }

    fn read_inode(&self, inode_num: u32) -> Result<Inode, Ext2Error> {
        if inode_num == 0 || inode_num > self.superblock.inodes_count {
            return Err(Ext2Error::InvalidInode);
        }
        let index = (inode_num - 1) as usize;
        let byte_offset = index * INODE_ON_DISK_BYTES;
        let block = self.group_desc.inode_table + (byte_offset / BLOCK_SIZE) as u32;
        let within = byte_offset % BLOCK_SIZE;
        let buf = self.read_block_raw(block)?;
        let raw: [u8; INODE_ON_DISK_BYTES] = buf[within..within + INODE_ON_DISK_BYTES].try_into().unwrap();
        Ok(Inode::from_bytes(&raw))
    }

    fn write_inode(&mut self, inode_num: u32, inode: &Inode) -> Result<(), Ext2Error> {
        if inode_num == 0 || inode_num > self.superblock.inodes_count {
            return Err(Ext2Error::InvalidInode);
        }
        let index = (inode_num - 1) as usize;
        let byte_offset = index * INODE_ON_DISK_BYTES;
        let block = self.group_desc.inode_table + (byte_offset / BLOCK_SIZE) as u32;
        let within = byte_offset % BLOCK_SIZE;
        let mut buf = self.read_block_raw(block)?;
        buf[within..within + INODE_ON_DISK_BYTES].copy_from_slice(&inode.to_bytes());
        self.write_block_raw(block, &buf)
    }

    /// `bg_block_bitmap + 1 + index` in the original collides with the
    /// inode bitmap/table region; `data_block_start` is the field the
    /// original computes for exactly this purpose but never uses.
    fn allocate_block(&mut self) -> Result<u32, Ext2Error> {
        let mut bitmap = self.read_block_raw(self.group_desc.block_bitmap)?;
        let free = bitmap::find_free_bit(&bitmap).ok_or(Ext2Error::NoSpace)?;
        bitmap::set_bit(&mut bitmap, free);
        self.write_block_raw(self.group_desc.block_bitmap, &bitmap)?;
        self.group_desc.free_blocks_count = self.group_desc.free_blocks_count.saturating_sub(1);
        self.superblock.free_blocks_count = self.superblock.free_blocks_count.saturating_sub(1);
        Ok(DATA_BLOCK_START + free)
    }

    fn free_block(&mut self, block_num: u32) -> Result<(), Ext2Error> {
        if block_num < DATA_BLOCK_START {
            return Ok(());
        }
        let bit = block_num - DATA_BLOCK_START;
        let mut bitmap = self.read_block_raw(self.group_desc.block_bitmap)?;
        bitmap::clear_bit(&mut bitmap, bit);
        self.write_block_raw(self.group_desc.block_bitmap, &bitmap)?;
        self.group_desc.free_blocks_count += 1;
        self.superblock.free_blocks_count += 1;
        Ok(())
    }

    fn allocate_inode(&mut self) -> Result<u32, Ext2Error> {
        let mut bitmap = self.read_block_raw(self.group_desc.inode_bitmap)?;
        let free = bitmap::find_free_bit(&bitmap).ok_or(Ext2Error::NoSpace)?;
        bitmap::set_bit(&mut bitmap, free);
        self.write_block_raw(self.group_desc.inode_bitmap, &bitmap)?;
        self.group_desc.free_inodes_count = self.group_desc.free_inodes_count.saturating_sub(1);
        self.superblock.free_inodes_count = self.superblock.free_inodes_count.saturating_sub(1);
        if self.config.legacy_inode_numbering {
            Ok(self.group_desc.inode_table + free)
        } else {
            Ok(free + 1)
        }
    }

    fn find_in_directory(&self, dir_inode_num: u32, name: &str) -> Result<Option<(u32, u32, u16)>, Ext2Error> {
        let dir = self.read_inode(dir_inode_num)?;
        if !dir.is_dir() {
            return Err(Ext2Error::NotADirectory);
        }
        let block_num = dir.direct_blocks[0];
        if block_num == 0 {
            return Ok(None);
        }
        let buf = self.read_block_raw(block_num)?;
        let mut offset = 0usize;
        while offset < dir.size as usize && offset < BLOCK_SIZE {
            let (entry, rec_len) = match DirEntry::decode(&buf[offset..]) {
                Some(v) => v,
                None => break,
            };
            if entry.name == name {
                return Ok(Some((entry.inode, block_num, offset as u16)));
            }
            offset += rec_len;
        }
        Ok(None)
    }

    fn list_directory(&self, dir_inode_num: u32) -> Result<Vec<DirEntry>, Ext2Error> {
        let dir = self.read_inode(dir_inode_num)?;
        if !dir.is_dir() {
            return Err(Ext2Error::NotADirectory);
        }
        let mut out = Vec::new();
        let block_num = dir.direct_blocks[0];
        if block_num == 0 {
            return Ok(out);
        }
        let buf = self.read_block_raw(block_num)?;
        let mut offset = 0usize;
        while offset < dir.size as usize && offset < BLOCK_SIZE {
            let (entry, rec_len) = match DirEntry::decode(&buf[offset..]) {
                Some(v) => v,
                None => break,
            };
            out.push(entry);
            offset += rec_len;
        }
        Ok(out)
    }

    fn append_dir_entry(&mut self, dir_inode_num: u32, entry: &DirEntry) -> Result<(), Ext2Error> {
        let mut dir = self.read_inode(dir_inode_num)?;
        if dir.direct_blocks[0] == 0 {
            let block = self.allocate_block()?;
            dir.direct_blocks[0] = block;
            dir.blocks += (BLOCK_SIZE / 512) as u32;
        }
        let block_num = dir.direct_blocks[0];
        let mut buf = self.read_block_raw(block_num)?;
        let mut encoded = heapless::Vec::<u8, 1024>::new();
        if !entry.encode(&mut encoded) {
            return Err(Ext2Error::NameTooLong);
        }
        let offset = dir.size as usize;
        if offset + encoded.len() > BLOCK_SIZE {
            return Err(Ext2Error::NoSpace);
        }
        buf[offset..offset + encoded.len()].copy_from_slice(&encoded);
        self.write_block_raw(block_num, &buf)?;
        dir.size += encoded.len() as u32;
        self.write_inode(dir_inode_num, &dir)
    }

    fn find_inode(&self, path: &str) -> Result<u32, Ext2Error> {
        if path == "/" {
            return Ok(ROOT_INODE);
        }
        let mut current = ROOT_INODE;
        for segment in path.trim_start_matches('/').split('/') {
            if segment.is_empty() {
                continue;
            }
            match self.find_in_directory(current, segment)? {
                Some((inode_num, _, _)) => current = inode_num,
                None => return Err(Ext2Error::NotFound),
            }
        }
        Ok(current)
    }

    fn create_entry(&mut self, parent_inode: u32, name: &str, mode: u16) -> Result<u32, Ext2Error> {
        if name.len() > 64 {
            return Err(Ext2Error::NameTooLong);
        }
        let parent = self.read_inode(parent_inode)?;
        if !parent.is_dir() {
            return Err(Ext2Error::NotADirectory);
        }
        if self.find_in_directory(parent_inode, name)?.is_some() {
            return Err(Ext2Error::AlreadyExists);
        }
        let new_inode_num = self.allocate_inode()?;
        let mut new_inode = Inode::zeroed();
        new_inode.mode = mode;
        new_inode.links_count = 1;
        self.write_inode(new_inode_num, &new_inode)?;

        let mut name_buf = heapless::String::<64>::new();
        name_buf.push_str(name).map_err(|_| Ext2Error::NameTooLong)?;
        self.append_dir_entry(parent_inode, &DirEntry { inode: new_inode_num, name: name_buf })?;
        Ok(new_inode_num)
    }

    fn write_data(&mut self, inode_num: u32, offset: u32, data: &[u8]) -> Result<usize, Ext2Error> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut inode = self.read_inode(inode_num)?;
        let start_block = offset as usize / BLOCK_SIZE;
        let end_block = (offset as usize + data.len() - 1) / BLOCK_SIZE;
        if end_block >= DIRECT_BLOCKS {
            return Err(Ext2Error::NoIndirectBlocks);
        }

        for block in start_block..=end_block {
            let mut physical = inode.direct_blocks[block];
            if physical == 0 {
                physical = self.allocate_block()?;
                inode.direct_blocks[block] = physical;
                inode.blocks += (BLOCK_SIZE / 512) as u32;
            }
            let mut buf = self.read_block_raw(physical)?;
            let block_offset = if block == start_block { offset as usize % BLOCK_SIZE } else { 0 };
            let remaining_in_block = BLOCK_SIZE - block_offset;
            let src_start = if block == start_block {
                0
            } else {
                (block - start_block) * BLOCK_SIZE - (offset as usize % BLOCK_SIZE)
            };
            let copy_len = remaining_in_block.min(data.len().saturating_sub(src_start));
            if copy_len == 0 {
                continue;
            }
            buf[block_offset..block_offset + copy_len].copy_from_slice(&data[src_start..src_start + copy_len]);
            self.write_block_raw(physical, &buf)?;
        }

        let new_end = offset + data.len() as u32;
        if new_end > inode.size {
            inode.size = new_end;
        }
        self.write_inode(inode_num, &inode)?;
        Ok(data.len())
    }

    fn read_data(&self, inode_num: u32, offset: u32, buf: &mut [u8]) -> Result<usize, Ext2Error> {
        let inode = self.read_inode(inode_num)?;
        if offset >= inode.size {
            return Ok(0);
        }
        let size = buf.len().min((inode.size - offset) as usize);
        let start_block = offset as usize / BLOCK_SIZE;
        let end_block = (offset as usize + size.max(1) - 1) / BLOCK_SIZE;

        for block in start_block..=end_block.min(DIRECT_BLOCKS - 1) {
            let physical = inode.direct_blocks[block];
            let block_offset = if block == start_block { offset as usize % BLOCK_SIZE } else { 0 };
            let dst_start = if block == start_block {
                0
            } else {
                (block - start_block) * BLOCK_SIZE - (offset as usize % BLOCK_SIZE)
            };
            let copy_len = (BLOCK_SIZE - block_offset).min(size.saturating_sub(dst_start));
            if copy_len == 0 {
                continue;
            }
            if physical == 0 {
                buf[dst_start..dst_start + copy_len].fill(0);
                continue;
            }
            let src = self.read_block_raw(physical)?;
            buf[dst_start..dst_start + copy_len].copy_from_slice(&src[block_offset..block_offset + copy_len]);
        }
        Ok(size)
    }

    fn delete_entry(&mut self, parent_inode: u32, name: &str) -> Result<(), Ext2Error> {
        let (target_inode, block_num, entry_offset) =
            self.find_in_directory(parent_inode, name)?.ok_or(Ext2Error::NotFound)?;
        let mut buf = self.read_block_raw(block_num)?;
        let (entry, rec_len) = DirEntry::decode(&buf[entry_offset as usize..]).ok_or(Ext2Error::NotFound)?;
        let _ = entry;
        for b in buf[entry_offset as usize..entry_offset as usize + rec_len].iter_mut() {
            *b = 0;
        }
        self.write_block_raw(block_num, &buf)?;

        let mut parent = self.read_inode(parent_inode)?;
        parent.size = parent.size.saturating_sub(rec_len as u32);
        self.write_inode(parent_inode, &parent)?;

        let mut target = self.read_inode(target_inode)?;
        target.links_count = target.links_count.saturating_sub(1);
        if target.links_count == 0 {
            for &block in target.direct_blocks.iter() {
                if block != 0 {
                    self.free_block(block)?;
                }
            }
            self.write_inode(target_inode, &Inode::zeroed())?;
        } else {
            self.write_inode(target_inode, &target)?;
        }
        Ok(())
    }
}

lazy_static::lazy_static! {
    static ref FS: Mutex<Option<Ext2Fs>> = Mutex::new(None);
}

/// Formats `device` fresh and mounts it — matching the original, which
/// never attempts to read an existing superblock off the device.
pub fn mount(device: Box<dyn BlockDevice>, config: Ext2Config) -> Result<(), Ext2Error> {
    let mut guard = FS.lock();
    if guard.is_some() {
        return Err(Ext2Error::AlreadyMounted);
    }
    let blocks_count = device.block_count();
    let superblock = SuperBlock::fresh(INODES_COUNT, blocks_count);
    let group_desc = GroupDesc {
        block_bitmap: BLOCK_BITMAP_BLOCK,
        inode_bitmap: INODE_BITMAP_BLOCK,
        inode_table: INODE_TABLE_START,
        free_blocks_count: superblock.free_blocks_count as u16,
        free_inodes_count: superblock.free_inodes_count as u16,
    };
    let mut fs = Ext2Fs { device, superblock, group_desc, config };

    let mut root = Inode::zeroed();
    root.mode = S_IFDIR | 0o755;
    root.size = 0;
    root.links_count = 2;
    fs.write_inode(ROOT_INODE, &root)?;
    fs.superblock.free_inodes_count = fs.superblock.free_inodes_count.saturating_sub(1);

    log!(Level::Info, "ext2", "mounted fresh filesystem, {} blocks", blocks_count);
    *guard = Some(fs);
    Ok(())
}

pub fn umount() -> Result<(), Ext2Error> {
    let mut guard = FS.lock();
    if guard.take().is_none() {
        return Err(Ext2Error::NotMounted);
    }
    Ok(())
}

fn with_fs<T>(f: impl FnOnce(&mut Ext2Fs) -> Result<T, Ext2Error>) -> Result<T, Ext2Error> {
    let mut guard = FS.lock();
    let fs = guard.as_mut().ok_or(Ext2Error::NotMounted)?;
    f(fs)
}

pub fn read_inode(inode_num: u32) -> Result<Inode, Ext2Error> {
    with_fs(|fs| fs.read_inode(inode_num))
}

pub fn write_inode(inode_num: u32, inode: &Inode) -> Result<(), Ext2Error> {
    with_fs(|fs| fs.write_inode(inode_num, inode))
}

pub fn find_inode(path: &str) -> Result<u32, Ext2Error> {
    with_fs(|fs| fs.find_inode(path))
}

pub fn read_directory(inode_num: u32) -> Result<Vec<DirEntry>, Ext2Error> {
    with_fs(|fs| fs.list_directory(inode_num))
}

pub fn create_file(parent_inode: u32, name: &str, permissions: u16) -> Result<u32, Ext2Error> {
    with_fs(|fs| fs.create_entry(parent_inode, name, S_IFREG | (permissions & 0o777)))
}

pub fn mkdir(parent_inode: u32, name: &str, permissions: u16) -> Result<u32, Ext2Error> {
    with_fs(|fs| {
        let new_inode = fs.create_entry(parent_inode, name, S_IFDIR | (permissions & 0o777))?;
        let mut inode = fs.read_inode(new_inode)?;
        inode.links_count = 2;
        fs.write_inode(new_inode, &inode)
    })
}

pub fn unlink(parent_inode: u32, name: &str) -> Result<(), Ext2Error> {
    with_fs(|fs| {
        let (target, _, _) = fs.find_in_directory(parent_inode, name)?.ok_or(Ext2Error::NotFound)?;
        let inode = fs.read_inode(target)?;
        if inode.is_dir() {
            return Err(Ext2Error::IsADirectory);
        }
        fs.delete_entry(parent_inode, name)
    })
}

pub fn rmdir(parent_inode: u32, name: &str) -> Result<(), Ext2Error> {
    with_fs(|fs| {
        let (target, _, _) = fs.find_in_directory(parent_inode, name)?.ok_or(Ext2Error::NotFound)?;
        let inode = fs.read_inode(target)?;
        if !inode.is_dir() {
            return Err(Ext2Error::NotADirectory);
        }
        if !fs.list_directory(target)?.is_empty() {
            return Err(Ext2Error::DirectoryNotEmpty);
        }
        fs.delete_entry(parent_inode, name)
    })
}

pub fn write_data(inode_num: u32, offset: u32, data: &[u8]) -> Result<usize, Ext2Error> {
    with_fs(|fs| fs.write_data(inode_num, offset, data))
}

pub fn read_data(inode_num: u32, offset: u32, buf: &mut [u8]) -> Result<usize, Ext2Error> {
    with_fs(|fs| fs.read_data(inode_num, offset, buf))
}

#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub inode: u32,
    pub size: u32,
    pub is_dir: bool,
    pub links_count: u16,
}

pub fn stat(inode_num: u32) -> Result<Stat, Ext2Error> {
    with_fs(|fs| {
        let inode = fs.read_inode(inode_num)?;
        Ok(Stat { inode: inode_num, size: inode.size, is_dir: inode.is_dir(), links_count: inode.links_count })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_mount() {
        let _ = umount();
        mount(Box::new(MemoryBlockDevice::new(8192)), Ext2Config::default()).unwrap();
    }

    #[test]
    fn root_exists_and_is_a_directory() {
        fresh_mount();
        let root = find_inode("/").unwrap();
        assert_eq!(root, ROOT_INODE);
        let st = stat(root).unwrap();
        assert!(st.is_dir);
    }

    #[test]
    fn default_inode_numbering_is_conventional() {
        fresh_mount();
        let id = create_file(ROOT_INODE, "a.txt", 0o644).unwrap();
        // first free inode bit is 0 (root took inode 2, whose bit was never
        // marked since mount() doesn't allocate root through allocate_inode)
        assert_eq!(id, 1);
    }

    #[test]
    fn legacy_inode_numbering_reproduces_original_offset() {
        let _ = umount();
        mount(Box::new(MemoryBlockDevice::new(8192)), Ext2Config { legacy_inode_numbering: true }).unwrap();
        let id = create_file(ROOT_INODE, "a.txt", 0o644).unwrap();
        assert_eq!(id, INODE_TABLE_START + 0);
    }

    #[test]
    fn create_write_read_round_trips() {
        fresh_mount();
        let file = create_file(ROOT_INODE, "hello.txt", 0o644).unwrap();
        let written = write_data(file, 0, b"hello world").unwrap();
        assert_eq!(written, 11);
        let mut buf = [0u8; 32];
        let read = read_data(file, 0, &mut buf).unwrap();
        assert_eq!(&buf[..read], b"hello world");
    }

    #[test]
    fn multi_block_write_read_round_trips() {
        fresh_mount();
        let file = create_file(ROOT_INODE, "big.txt", 0o644).unwrap();
        let mut data = [0u8; 2000];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let written = write_data(file, 0, &data).unwrap();
        assert_eq!(written, data.len());
        let mut buf = [0u8; 2000];
        let read = read_data(file, 0, &mut buf).unwrap();
        assert_eq!(read, data.len());
        assert_eq!(&buf[..], &data[..]);
    }

    #[test]
    fn unaligned_multi_block_write_read_round_trips() {
        fresh_mount();
        let file = create_file(ROOT_INODE, "odd.txt", 0o644).unwrap();
        let data: alloc::vec::Vec<u8> = (0u8..=255).cycle().take(2500).collect();
        write_data(file, 100, &data).unwrap();
        let mut buf = alloc::vec![0u8; data.len()];
        let read = read_data(file, 100, &mut buf).unwrap();
        assert_eq!(read, data.len());
        assert_eq!(buf, data);
    }

    #[test]
    fn write_past_twelfth_direct_block_errors_instead_of_leaking() {
        fresh_mount();
        let file = create_file(ROOT_INODE, "big.bin", 0o644).unwrap();
        let offset = (DIRECT_BLOCKS as u32) * BLOCK_SIZE as u32;
        let err = write_data(file, offset, b"x").unwrap_err();
        assert_eq!(err, Ext2Error::NoIndirectBlocks);
    }

    #[test]
    fn duplicate_create_rejected() {
        fresh_mount();
        create_file(ROOT_INODE, "dup.txt", 0o644).unwrap();
        let err = create_file(ROOT_INODE, "dup.txt", 0o644).unwrap_err();
        assert_eq!(err, Ext2Error::AlreadyExists);
    }

    #[test]
    fn mkdir_then_rmdir_requires_empty() {
        fresh_mount();
        let dir = mkdir(ROOT_INODE, "sub", 0o755).unwrap();
        create_file(dir, "f.txt", 0o644).unwrap();
        assert_eq!(rmdir(ROOT_INODE, "sub").unwrap_err(), Ext2Error::DirectoryNotEmpty);
        unlink(dir, "f.txt").unwrap();
        rmdir(ROOT_INODE, "sub").unwrap();
        assert_eq!(find_inode("/sub").unwrap_err(), Ext2Error::NotFound);
    }

    #[test]
    fn unlink_removes_from_directory_listing() {
        fresh_mount();
        create_file(ROOT_INODE, "a.txt", 0o644).unwrap();
        create_file(ROOT_INODE, "b.txt", 0o644).unwrap();
        unlink(ROOT_INODE, "a.txt").unwrap();
        let entries = read_directory(ROOT_INODE).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name.as_str(), "b.txt");
    }

    #[test]
    fn nested_path_lookup() {
        fresh_mount();
        let dir = mkdir(ROOT_INODE, "docs", 0o755).unwrap();
        let file = create_file(dir, "readme.txt", 0o644).unwrap();
        assert_eq!(find_inode("/docs/readme.txt").unwrap(), file);
    }
}
