//! On-disk inode, byte-exact per `ext2_inode_t` with the reserved tail
//! dropped. Direct-blocks-only: `i_block[12..15]` (single/double/triple
//! indirect in the original) collapse to one `indirect_block` field kept
//! only so [`Ext2Error::NoIndirectBlocks`] has something concrete to name.

pub const DIRECT_BLOCKS: usize = 12;
pub const INODE_ON_DISK_BYTES: usize = 84;

pub const S_IFDIR: u16 = 0x4000;
pub const S_IFREG: u16 = 0x8000;

#[derive(Debug, Clone, Copy)]
pub struct Inode {
    pub mode: u16,
    pub uid: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub gid: u16,
    pub links_count: u16,
    pub blocks: u32,
    pub flags: u32,
    pub direct_blocks: [u32; DIRECT_BLOCKS],
    pub indirect_block: u32,
}

impl Inode {
    pub fn zeroed() -> Self {
        Inode {
            mode: 0,
            uid: 0,
            size: 0,
            atime: 0,
            ctime: 0,
            mtime: 0,
            dtime: 0,
            gid: 0,
            links_count: 0,
            blocks: 0,
            flags: 0,
            direct_blocks: [0; DIRECT_BLOCKS],
            indirect_block: 0,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFDIR != 0
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFREG != 0
    }

    pub fn to_bytes(&self) -> [u8; INODE_ON_DISK_BYTES] {
        let mut out = [0u8; INODE_ON_DISK_BYTES];
        out[0..2].copy_from_slice(&self.mode.to_le_bytes());
        out[2..4].copy_from_slice(&self.uid.to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..12].copy_from_slice(&self.atime.to_le_bytes());
        out[12..16].copy_from_slice(&self.ctime.to_le_bytes());
        out[16..20].copy_from_slice(&self.mtime.to_le_bytes());
        out[20..24].copy_from_slice(&self.dtime.to_le_bytes());
        out[24..26].copy_from_slice(&self.gid.to_le_bytes());
        out[26..28].copy_from_slice(&self.links_count.to_le_bytes());
        out[28..32].copy_from_slice(&self.blocks.to_le_bytes());
        out[32..36].copy_from_slice(&self.flags.to_le_bytes());
        for (i, block) in self.direct_blocks.iter().enumerate() {
            let base = 36 + i * 4;
            out[base..base + 4].copy_from_slice(&block.to_le_bytes());
        }
        out[84 - 4..84].copy_from_slice(&self.indirect_block.to_le_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8; INODE_ON_DISK_BYTES]) -> Self {
        let mut direct_blocks = [0u32; DIRECT_BLOCKS];
        for (i, slot) in direct_blocks.iter_mut().enumerate() {
            let base = 36 + i * 4;
            *slot = u32::from_le_bytes(buf[base..base + 4].try_into().unwrap());
        }
        Inode {
            mode: u16::from_le_bytes(buf[0..2].try_into().unwrap()),
            uid: u16::from_le_bytes(buf[2..4].try_into().unwrap()),
            size: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            atime: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            ctime: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            mtime: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            dtime: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            gid: u16::from_le_bytes(buf[24..26].try_into().unwrap()),
            links_count: u16::from_le_bytes(buf[26..28].try_into().unwrap()),
            blocks: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
            flags: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            direct_blocks,
            indirect_block: u32::from_le_bytes(buf[80..84].try_into().unwrap()),
        }
    }
}

/// Directory entry: `inode(4) | rec_len(2) | name_len(1) | name bytes`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub inode: u32,
    pub name: heapless::String<64>,
}

impl DirEntry {
    pub fn rec_len(&self) -> u16 {
        (7 + self.name.len()) as u16
    }

    pub fn encode(&self, out: &mut heapless::Vec<u8, 1024>) -> bool {
        let rec_len = self.rec_len();
        if out.extend_from_slice(&self.inode.to_le_bytes()).is_err() {
            return false;
        }
        if out.extend_from_slice(&rec_len.to_le_bytes()).is_err() {
            return false;
        }
        if out.push(self.name.len() as u8).is_err() {
            return false;
        }
        out.extend_from_slice(self.name.as_bytes()).is_ok()
    }

    pub fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < 7 {
            return None;
        }
        let inode = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        let rec_len = u16::from_le_bytes(buf[4..6].try_into().ok()?) as usize;
        let name_len = buf[6] as usize;
        if buf.len() < 7 + name_len || rec_len < 7 + name_len {
            return None;
        }
        let name_str = core::str::from_utf8(&buf[7..7 + name_len]).ok()?;
        let mut name = heapless::String::new();
        name.push_str(name_str).ok()?;
        Some((DirEntry { inode, name }, rec_len))
    }
}
