//! On-disk superblock and group descriptor, byte-exact per
//! `original_source/fusion_os/common/ext2.h`'s `ext2_superblock_t`.
//!
//! Only the fields this driver actually consults are kept; the original's
//! many reserved/compat fields are collapsed into nothing rather than
//! carried as dead bytes, since nothing here ever re-reads a foreign disk.

pub const EXT2_MAGIC: u16 = 0xEF53;
pub const ROOT_INODE: u32 = 2;
pub const BLOCK_SIZE: usize = 1024;
pub const BLOCKS_PER_GROUP: u32 = 8192;
pub const INODE_SIZE_BYTES: usize = 128;
pub const SUPERBLOCK_BYTES: usize = 40;
pub const GROUP_DESC_BYTES: usize = 20;

#[derive(Debug, Clone, Copy)]
pub struct SuperBlock {
    pub magic: u16,
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub first_ino: u32,
    pub inode_size: u16,
    pub state: u16,
}

impl SuperBlock {
    pub fn fresh(inodes_count: u32, blocks_count: u32) -> Self {
        SuperBlock {
            magic: EXT2_MAGIC,
            inodes_count,
            blocks_count,
            free_blocks_count: blocks_count.saturating_sub(1192),
            free_inodes_count: inodes_count.saturating_sub(100),
            blocks_per_group: BLOCKS_PER_GROUP,
            inodes_per_group: inodes_count,
            first_ino: 11,
            inode_size: INODE_SIZE_BYTES as u16,
            state: 1,
        }
    }

    pub fn to_bytes(&self) -> [u8; SUPERBLOCK_BYTES] {
        let mut out = [0u8; SUPERBLOCK_BYTES];
        out[0..4].copy_from_slice(&self.inodes_count.to_le_bytes());
        out[4..8].copy_from_slice(&self.blocks_count.to_le_bytes());
        out[8..12].copy_from_slice(&self.free_blocks_count.to_le_bytes());
        out[12..16].copy_from_slice(&self.free_inodes_count.to_le_bytes());
        out[16..20].copy_from_slice(&self.blocks_per_group.to_le_bytes());
        out[20..24].copy_from_slice(&self.inodes_per_group.to_le_bytes());
        out[24..28].copy_from_slice(&self.first_ino.to_le_bytes());
        out[28..30].copy_from_slice(&self.inode_size.to_le_bytes());
        out[30..32].copy_from_slice(&self.state.to_le_bytes());
        out[32..34].copy_from_slice(&self.magic.to_le_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8; SUPERBLOCK_BYTES]) -> Self {
        SuperBlock {
            inodes_count: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            blocks_count: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            free_blocks_count: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            free_inodes_count: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            blocks_per_group: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            inodes_per_group: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            first_ino: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            inode_size: u16::from_le_bytes(buf[28..30].try_into().unwrap()),
            state: u16::from_le_bytes(buf[30..32].try_into().unwrap()),
            magic: u16::from_le_bytes(buf[32..34].try_into().unwrap()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
}

impl GroupDesc {
    pub fn to_bytes(&self) -> [u8; GROUP_DESC_BYTES] {
        let mut out = [0u8; GROUP_DESC_BYTES];
        out[0..4].copy_from_slice(&self.block_bitmap.to_le_bytes());
        out[4..8].copy_from_slice(&self.inode_bitmap.to_le_bytes());
        out[8..12].copy_from_slice(&self.inode_table.to_le_bytes());
        out[12..14].copy_from_slice(&self.free_blocks_count.to_le_bytes());
        out[14..16].copy_from_slice(&self.free_inodes_count.to_le_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8; GROUP_DESC_BYTES]) -> Self {
        GroupDesc {
            block_bitmap: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            inode_bitmap: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            inode_table: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            free_blocks_count: u16::from_le_bytes(buf[12..14].try_into().unwrap()),
            free_inodes_count: u16::from_le_bytes(buf[14..16].try_into().unwrap()),
        }
    }
}
