//! A small inode/bitmap file system served over a block-device
//! abstraction, in the shape FUSE expects (getattr/readdir/mkdir/create/
//! read/write/unlink), but with an in-memory backing store rather than a
//! disk image.

use std::sync::Mutex;

use crate::error::{Error, Result};

pub const BLOCK_SIZE: usize = 4096;
pub const MAX_INUM: usize = 1024;
pub const MAX_DNUM: usize = 16384;

const INODE_SIZE: usize = 256;
const DIRENT_SIZE: usize = 256;
const DP_ENTRIES: usize = 16;
const IP_ENTRIES: usize = 8;
const POINTER_SIZE: usize = 4;
const INDIRECT_ENTRIES: usize = BLOCK_SIZE / POINTER_SIZE;
const INODE_ENTRIES: usize = BLOCK_SIZE / INODE_SIZE;
const DIR_ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / DIRENT_SIZE;
const INODE_BLOCKS: usize = MAX_INUM / INODE_ENTRIES;
const MAX_NAME_LEN: usize = 247;

const ROOT_INO: u32 = 0;

pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;

/// A fixed-size-block storage device. `MemBlockDevice` is the only
/// implementation here; a real disk-file-backed one is a straightforward
/// addition that doesn't change anything above this trait.
pub trait BlockDevice: Send {
    fn read_block(&self, blkno: u32, buf: &mut [u8]);
    fn write_block(&mut self, blkno: u32, buf: &[u8]);
    fn num_blocks(&self) -> u32;
}

pub struct MemBlockDevice {
    blocks: Vec<Vec<u8>>,
}

impl MemBlockDevice {
    pub fn new(num_blocks: u32) -> Self {
        MemBlockDevice {
            blocks: vec![vec![0u8; BLOCK_SIZE]; num_blocks as usize],
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, blkno: u32, buf: &mut [u8]) {
        buf.copy_from_slice(&self.blocks[blkno as usize]);
    }

    fn write_block(&mut self, blkno: u32, buf: &[u8]) {
        self.blocks[blkno as usize].copy_from_slice(buf);
    }

    fn num_blocks(&self) -> u32 {
        self.blocks.len() as u32
    }
}

#[derive(Debug, Clone, Copy)]
struct Superblock {
    max_inum: u32,
    max_dnum: u32,
    i_bitmap_blk: u32,
    d_bitmap_blk: u32,
    i_start_blk: u32,
    d_start_blk: u32,
}

impl Superblock {
    fn to_bytes(self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.max_inum.to_le_bytes());
        buf[4..8].copy_from_slice(&self.max_dnum.to_le_bytes());
        buf[8..12].copy_from_slice(&self.i_bitmap_blk.to_le_bytes());
        buf[12..16].copy_from_slice(&self.d_bitmap_blk.to_le_bytes());
        buf[16..20].copy_from_slice(&self.i_start_blk.to_le_bytes());
        buf[20..24].copy_from_slice(&self.d_start_blk.to_le_bytes());
    }

    fn from_bytes(buf: &[u8]) -> Self {
        let u32_at = |o: usize| u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
        Superblock {
            max_inum: u32_at(0),
            max_dnum: u32_at(4),
            i_bitmap_blk: u32_at(8),
            d_bitmap_blk: u32_at(12),
            i_start_blk: u32_at(16),
            d_start_blk: u32_at(20),
        }
    }
}

/// On-disk inode. `indirect_ptr[0]` is a single indirect block (a page
/// of data-block pointers); `indirect_ptr[1]` is double indirect (a page
/// of pointers to second-level pages, each itself a page of data-block
/// pointers). The remaining `indirect_ptr` slots stay unused.
#[derive(Debug, Clone, Copy)]
pub struct Inode {
    pub ino: u32,
    pub valid: bool,
    pub size: u64,
    pub link: u32,
    pub mode: u32,
    pub atime: u64,
    pub mtime: u64,
    pub direct_ptr: [u32; DP_ENTRIES],
    pub indirect_ptr: [u32; IP_ENTRIES],
}

impl Inode {
    fn empty() -> Self {
        Inode {
            ino: 0,
            valid: false,
            size: 0,
            link: 0,
            mode: 0,
            atime: 0,
            mtime: 0,
            direct_ptr: [0; DP_ENTRIES],
            indirect_ptr: [0; IP_ENTRIES],
        }
    }

    fn is_dir(&self) -> bool {
        self.mode & S_IFDIR != 0
    }

    fn to_bytes(self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.ino.to_le_bytes());
        buf[4] = self.valid as u8;
        buf[8..16].copy_from_slice(&self.size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.link.to_le_bytes());
        buf[20..24].copy_from_slice(&self.mode.to_le_bytes());
        buf[24..32].copy_from_slice(&self.atime.to_le_bytes());
        buf[32..40].copy_from_slice(&self.mtime.to_le_bytes());
        for (i, p) in self.direct_ptr.iter().enumerate() {
            let o = 40 + i * 4;
            buf[o..o + 4].copy_from_slice(&p.to_le_bytes());
        }
        let base = 40 + DP_ENTRIES * 4;
        for (i, p) in self.indirect_ptr.iter().enumerate() {
            let o = base + i * 4;
            buf[o..o + 4].copy_from_slice(&p.to_le_bytes());
        }
    }

    fn from_bytes(buf: &[u8]) -> Self {
        let u32_at = |o: usize| u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
        let u64_at = |o: usize| u64::from_le_bytes(buf[o..o + 8].try_into().unwrap());
        let mut direct_ptr = [0u32; DP_ENTRIES];
        for (i, slot) in direct_ptr.iter_mut().enumerate() {
            *slot = u32_at(40 + i * 4);
        }
        let base = 40 + DP_ENTRIES * 4;
        let mut indirect_ptr = [0u32; IP_ENTRIES];
        for (i, slot) in indirect_ptr.iter_mut().enumerate() {
            *slot = u32_at(base + i * 4);
        }
        Inode {
            ino: u32_at(0),
            valid: buf[4] != 0,
            size: u64_at(8),
            link: u32_at(16),
            mode: u32_at(20),
            atime: u64_at(24),
            mtime: u64_at(32),
            direct_ptr,
            indirect_ptr,
        }
    }
}

#[derive(Debug, Clone)]
struct DirEntry {
    ino: u32,
    valid: bool,
    name: String,
}

impl DirEntry {
    fn to_bytes(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.ino.to_le_bytes());
        buf[4] = self.valid as u8;
        let name_bytes = self.name.as_bytes();
        buf[5] = name_bytes.len() as u8;
        buf[6..6 + name_bytes.len()].copy_from_slice(name_bytes);
    }

    fn from_bytes(buf: &[u8]) -> Self {
        let ino = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let valid = buf[4] != 0;
        let len = buf[5] as usize;
        let name = String::from_utf8_lossy(&buf[6..6 + len]).into_owned();
        DirEntry { ino, valid, name }
    }

    fn empty() -> Self {
        DirEntry {
            ino: 0,
            valid: false,
            name: String::new(),
        }
    }
}

pub struct Attr {
    pub ino: u32,
    pub size: u64,
    pub links: u32,
    pub is_dir: bool,
    pub mtime: u64,
}

struct Inner {
    device: Box<dyn BlockDevice>,
    superblock: Superblock,
    inode_bitmap: Vec<u8>,
    data_bitmap: Vec<u8>,
}

impl Inner {
    fn read_block(&self, blkno: u32) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.device.read_block(blkno, &mut buf);
        buf
    }

    fn write_block(&mut self, blkno: u32, buf: &[u8]) {
        self.device.write_block(blkno, buf);
    }

    fn get_bit(bitmap: &[u8], idx: u32) -> bool {
        bitmap[idx as usize / 8] & (1 << (idx % 8)) != 0
    }

    fn set_bit(bitmap: &mut [u8], idx: u32) {
        bitmap[idx as usize / 8] |= 1 << (idx % 8);
    }

    fn clear_bit(bitmap: &mut [u8], idx: u32) {
        bitmap[idx as usize / 8] &= !(1 << (idx % 8));
    }

    fn alloc_inode(&mut self) -> Option<u32> {
        for i in 0..self.superblock.max_inum {
            if !Self::get_bit(&self.inode_bitmap, i) {
                Self::set_bit(&mut self.inode_bitmap, i);
                let sb = self.superblock;
                self.write_block(sb.i_bitmap_blk, &self.inode_bitmap.clone());
                return Some(i);
            }
        }
        None
    }

    fn free_inode(&mut self, ino: u32) {
        Self::clear_bit(&mut self.inode_bitmap, ino);
        let sb = self.superblock;
        self.write_block(sb.i_bitmap_blk, &self.inode_bitmap.clone());
    }

    fn alloc_data_block(&mut self) -> Option<u32> {
        for i in 0..self.superblock.max_dnum {
            if !Self::get_bit(&self.data_bitmap, i) {
                Self::set_bit(&mut self.data_bitmap, i);
                let sb = self.superblock;
                self.write_block(sb.d_bitmap_blk, &self.data_bitmap.clone());
                return Some(sb.d_start_blk + i);
            }
        }
        None
    }

    fn free_data_block(&mut self, blkno: u32) {
        let idx = blkno - self.superblock.d_start_blk;
        Self::clear_bit(&mut self.data_bitmap, idx);
        let sb = self.superblock;
        self.write_block(sb.d_bitmap_blk, &self.data_bitmap.clone());
    }

    fn read_inode(&self, ino: u32) -> Inode {
        let ino_blk = self.superblock.i_start_blk + ino / INODE_ENTRIES as u32;
        let ino_ofs = (ino % INODE_ENTRIES as u32) as usize;
        let block = self.read_block(ino_blk);
        Inode::from_bytes(&block[ino_ofs * INODE_SIZE..(ino_ofs + 1) * INODE_SIZE])
    }

    fn write_inode(&mut self, inode: &Inode) {
        let ino_blk = self.superblock.i_start_blk + inode.ino / INODE_ENTRIES as u32;
        let ino_ofs = (inode.ino % INODE_ENTRIES as u32) as usize;
        let mut block = self.read_block(ino_blk);
        inode.to_bytes(&mut block[ino_ofs * INODE_SIZE..(ino_ofs + 1) * INODE_SIZE]);
        self.write_block(ino_blk, &block);
    }

    /// All data-block pointers that currently back `inode`'s content:
    /// direct, then the single indirect block, then the double indirect
    /// tree once the single indirect block is completely full.
    fn data_blocks(&self, inode: &Inode) -> Vec<u32> {
        let mut out: Vec<u32> = inode
            .direct_ptr
            .iter()
            .copied()
            .take_while(|&b| b != 0)
            .collect();
        let mut single_full = false;
        if inode.indirect_ptr[0] != 0 {
            let ip_block = self.read_block(inode.indirect_ptr[0]);
            single_full = true;
            for chunk in ip_block.chunks(POINTER_SIZE).take(INDIRECT_ENTRIES) {
                let b = u32::from_le_bytes(chunk.try_into().unwrap());
                if b == 0 {
                    single_full = false;
                    break;
                }
                out.push(b);
            }
        }
        if single_full && inode.indirect_ptr[1] != 0 {
            let dip_block = self.read_block(inode.indirect_ptr[1]);
            'outer: for chunk in dip_block.chunks(POINTER_SIZE).take(INDIRECT_ENTRIES) {
                let sip_blkno = u32::from_le_bytes(chunk.try_into().unwrap());
                if sip_blkno == 0 {
                    break;
                }
                let sip_block = self.read_block(sip_blkno);
                for inner in sip_block.chunks(POINTER_SIZE).take(INDIRECT_ENTRIES) {
                    let b = u32::from_le_bytes(inner.try_into().unwrap());
                    if b == 0 {
                        break 'outer;
                    }
                    out.push(b);
                }
            }
        }
        out
    }

    /// Appends a freshly allocated data block to `inode`, growing into
    /// the single indirect block once the direct pointers are exhausted,
    /// then into the double indirect tree once the single indirect
    /// block's `INDIRECT_ENTRIES` slots are exhausted too.
    fn append_data_block(&mut self, inode: &mut Inode) -> Option<u32> {
        let blkno = self.alloc_data_block()?;
        if let Some(slot) = inode.direct_ptr.iter_mut().find(|p| **p == 0) {
            *slot = blkno;
            return Some(blkno);
        }
        if inode.indirect_ptr[0] == 0 {
            inode.indirect_ptr[0] = self.alloc_data_block()?;
            self.write_block(inode.indirect_ptr[0], &vec![0u8; BLOCK_SIZE]);
        }
        let mut ip_block = self.read_block(inode.indirect_ptr[0]);
        for chunk in ip_block.chunks_mut(POINTER_SIZE).take(INDIRECT_ENTRIES) {
            let existing = u32::from_le_bytes(chunk.try_into().unwrap());
            if existing == 0 {
                chunk.copy_from_slice(&blkno.to_le_bytes());
                self.write_block(inode.indirect_ptr[0], &ip_block);
                return Some(blkno);
            }
        }
        self.append_via_double_indirect(inode, blkno)
    }

    /// Second tier of `append_data_block`: a page of pointers to
    /// second-level pages, each holding `INDIRECT_ENTRIES` data-block
    /// pointers, mirroring the single indirect scheme one level deeper.
    fn append_via_double_indirect(&mut self, inode: &mut Inode, blkno: u32) -> Option<u32> {
        if inode.indirect_ptr[1] == 0 {
            inode.indirect_ptr[1] = self.alloc_data_block()?;
            self.write_block(inode.indirect_ptr[1], &vec![0u8; BLOCK_SIZE]);
        }
        let dip_blkno = inode.indirect_ptr[1];
        let mut dip_block = self.read_block(dip_blkno);
        for i in 0..INDIRECT_ENTRIES {
            let o = i * POINTER_SIZE;
            let mut sip_blkno = u32::from_le_bytes(dip_block[o..o + POINTER_SIZE].try_into().unwrap());
            let sip_is_new = sip_blkno == 0;
            if sip_is_new {
                sip_blkno = self.alloc_data_block()?;
                self.write_block(sip_blkno, &vec![0u8; BLOCK_SIZE]);
            }
            let mut sip_block = self.read_block(sip_blkno);
            for j in 0..INDIRECT_ENTRIES {
                let jo = j * POINTER_SIZE;
                let existing = u32::from_le_bytes(sip_block[jo..jo + POINTER_SIZE].try_into().unwrap());
                if existing == 0 {
                    sip_block[jo..jo + POINTER_SIZE].copy_from_slice(&blkno.to_le_bytes());
                    self.write_block(sip_blkno, &sip_block);
                    if sip_is_new {
                        dip_block[o..o + POINTER_SIZE].copy_from_slice(&sip_blkno.to_le_bytes());
                        self.write_block(dip_blkno, &dip_block);
                    }
                    return Some(blkno);
                }
            }
        }
        None
    }

    fn dir_entries(&self, dir_inode: &Inode) -> Vec<DirEntry> {
        let mut out = Vec::new();
        for blkno in self.data_blocks(dir_inode) {
            let block = self.read_block(blkno);
            for chunk in block.chunks(DIRENT_SIZE).take(DIR_ENTRIES_PER_BLOCK) {
                let entry = DirEntry::from_bytes(chunk);
                if entry.valid {
                    out.push(entry);
                }
            }
        }
        out
    }

    fn dir_find(&self, dir_ino: u32, name: &str) -> Option<DirEntry> {
        let dir_inode = self.read_inode(dir_ino);
        self.dir_entries(&dir_inode).into_iter().find(|e| e.name == name)
    }

    fn dir_add(&mut self, dir_inode: &mut Inode, f_ino: u32, name: &str) -> Result<()> {
        if self.dir_find(dir_inode.ino, name).is_some() {
            return Err(Error::InvalidArgument("name already exists in directory"));
        }
        let entry = DirEntry {
            ino: f_ino,
            valid: true,
            name: name.to_string(),
        };
        for blkno in self.data_blocks(dir_inode) {
            let mut block = self.read_block(blkno);
            for chunk in block.chunks_mut(DIRENT_SIZE).take(DIR_ENTRIES_PER_BLOCK) {
                if !DirEntry::from_bytes(chunk).valid {
                    entry.to_bytes(chunk);
                    self.write_block(blkno, &block);
                    dir_inode.size += DIRENT_SIZE as u64;
                    dir_inode.link += 1;
                    self.write_inode(dir_inode);
                    return Ok(());
                }
            }
        }
        let blkno = self
            .append_data_block(dir_inode)
            .ok_or(Error::OutOfMemory)?;
        let mut block = vec![0u8; BLOCK_SIZE];
        entry.to_bytes(&mut block[0..DIRENT_SIZE]);
        self.write_block(blkno, &block);
        dir_inode.size += DIRENT_SIZE as u64;
        dir_inode.link += 1;
        self.write_inode(dir_inode);
        Ok(())
    }

    fn dir_remove(&mut self, dir_inode: &mut Inode, name: &str) -> Result<()> {
        for blkno in self.data_blocks(dir_inode) {
            let mut block = self.read_block(blkno);
            for chunk in block.chunks_mut(DIRENT_SIZE).take(DIR_ENTRIES_PER_BLOCK) {
                let entry = DirEntry::from_bytes(chunk);
                if entry.valid && entry.name == name {
                    DirEntry::empty().to_bytes(chunk);
                    self.write_block(blkno, &block);
                    dir_inode.size -= DIRENT_SIZE as u64;
                    dir_inode.link -= 1;
                    self.write_inode(dir_inode);
                    return Ok(());
                }
            }
        }
        Err(Error::InvalidArgument("name not found in directory"))
    }

    /// Resolves `path` to an inode starting from `root_ino`. Takes `path`
    /// by shared reference and walks it with `split('/')` over an owned
    /// copy, rather than tokenizing (and mutating) the caller's buffer.
    fn get_node_by_path(&self, path: &str, root_ino: u32) -> Option<Inode> {
        let mut ino = root_ino;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let entry = self.dir_find(ino, component)?;
            ino = entry.ino;
        }
        Some(self.read_inode(ino))
    }
}

/// A mounted file system instance. All operations take `&self` and lock
/// one internal mutex, matching the "one coarse lock" concurrency model
/// this is built on.
pub struct Filesystem {
    inner: Mutex<Inner>,
}

impl Filesystem {
    /// Formats a fresh file system over `device` and mounts it.
    pub fn mkfs(device: Box<dyn BlockDevice>) -> Result<Self> {
        let total_blocks = device.num_blocks();
        let max_dnum = (total_blocks as usize)
            .saturating_sub(3 + INODE_BLOCKS)
            .min(MAX_DNUM);
        if max_dnum == 0 {
            return Err(Error::InvalidArgument("device too small to hold a file system"));
        }
        let superblock = Superblock {
            max_inum: MAX_INUM as u32,
            max_dnum: max_dnum as u32,
            i_bitmap_blk: 1,
            d_bitmap_blk: 2,
            i_start_blk: 3,
            d_start_blk: 3 + INODE_BLOCKS as u32,
        };
        let mut inner = Inner {
            device,
            superblock,
            inode_bitmap: vec![0u8; BLOCK_SIZE],
            data_bitmap: vec![0u8; BLOCK_SIZE],
        };

        let mut sb_block = vec![0u8; BLOCK_SIZE];
        superblock.to_bytes(&mut sb_block);
        inner.write_block(0, &sb_block);
        inner.write_block(superblock.i_bitmap_blk, &inner.inode_bitmap.clone());
        inner.write_block(superblock.d_bitmap_blk, &inner.data_bitmap.clone());
        for b in 0..INODE_BLOCKS as u32 {
            inner.write_block(superblock.i_start_blk + b, &vec![0u8; BLOCK_SIZE]);
        }

        let ino = inner.alloc_inode().expect("fresh file system has free inodes");
        debug_assert_eq!(ino, ROOT_INO);
        let mut root = Inode::empty();
        root.ino = ino;
        root.valid = true;
        root.mode = S_IFDIR | 0o755;
        root.link = 0;
        inner.write_inode(&root);
        inner
            .dir_add(&mut root, ino, ".")
            .expect("root directory entry always fits in a fresh file system");

        log::info!("formatted file system: {} inodes, {} data blocks", MAX_INUM, max_dnum);
        Ok(Filesystem {
            inner: Mutex::new(inner),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("file system mutex poisoned")
    }

    pub fn getattr(&self, path: &str) -> Option<Attr> {
        let inner = self.lock();
        let inode = inner.get_node_by_path(path, ROOT_INO)?;
        Some(Attr {
            ino: inode.ino,
            size: inode.size,
            links: inode.link,
            is_dir: inode.is_dir(),
            mtime: inode.mtime,
        })
    }

    pub fn readdir(&self, path: &str) -> Option<Vec<String>> {
        let inner = self.lock();
        let inode = inner.get_node_by_path(path, ROOT_INO)?;
        if !inode.is_dir() {
            return None;
        }
        Some(inner.dir_entries(&inode).into_iter().map(|e| e.name).collect())
    }

    pub fn mkdir(&self, path: &str) -> Result<u32> {
        self.create_node(path, S_IFDIR | 0o755)
    }

    pub fn create(&self, path: &str) -> Result<u32> {
        self.create_node(path, S_IFREG | 0o644)
    }

    fn create_node(&self, path: &str, mode: u32) -> Result<u32> {
        let (parent, name) = split_path(path)?;
        let mut inner = self.lock();
        let mut parent_inode = inner
            .get_node_by_path(parent, ROOT_INO)
            .ok_or(Error::InvalidAddress)?;
        if !parent_inode.is_dir() {
            return Err(Error::InvalidArgument("parent is not a directory"));
        }
        let ino = inner.alloc_inode().ok_or(Error::OutOfMemory)?;
        let mut node = Inode::empty();
        node.ino = ino;
        node.valid = true;
        node.mode = mode;
        inner.write_inode(&node);
        if let Err(e) = inner.dir_add(&mut parent_inode, ino, name) {
            inner.free_inode(ino);
            return Err(e);
        }
        if mode & S_IFDIR != 0 {
            inner.dir_add(&mut node, ino, ".").ok();
        }
        Ok(ino)
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let (parent, name) = split_path(path)?;
        let mut inner = self.lock();
        let mut parent_inode = inner
            .get_node_by_path(parent, ROOT_INO)
            .ok_or(Error::InvalidAddress)?;
        let target = inner
            .get_node_by_path(path, ROOT_INO)
            .ok_or(Error::InvalidAddress)?;
        if !target.is_dir() {
            return Err(Error::InvalidArgument("not a directory"));
        }
        if inner.dir_entries(&target).into_iter().any(|e| e.name != ".") {
            return Err(Error::InvalidArgument("directory not empty"));
        }
        inner.dir_remove(&mut parent_inode, name)?;
        self.reclaim(&mut inner, target.ino);
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let (parent, name) = split_path(path)?;
        let mut inner = self.lock();
        let mut parent_inode = inner
            .get_node_by_path(parent, ROOT_INO)
            .ok_or(Error::InvalidAddress)?;
        let target = inner
            .get_node_by_path(path, ROOT_INO)
            .ok_or(Error::InvalidAddress)?;
        if target.is_dir() {
            return Err(Error::InvalidArgument("is a directory"));
        }
        inner.dir_remove(&mut parent_inode, name)?;
        self.reclaim(&mut inner, target.ino);
        Ok(())
    }

    fn reclaim(&self, inner: &mut Inner, ino: u32) {
        let inode = inner.read_inode(ino);
        for blkno in inner.data_blocks(&inode) {
            inner.free_data_block(blkno);
        }
        if inode.indirect_ptr[0] != 0 {
            inner.free_data_block(inode.indirect_ptr[0]);
        }
        if inode.indirect_ptr[1] != 0 {
            let dip_block = inner.read_block(inode.indirect_ptr[1]);
            for chunk in dip_block.chunks(POINTER_SIZE).take(INDIRECT_ENTRIES) {
                let sip_blkno = u32::from_le_bytes(chunk.try_into().unwrap());
                if sip_blkno == 0 {
                    break;
                }
                inner.free_data_block(sip_blkno);
            }
            inner.free_data_block(inode.indirect_ptr[1]);
        }
        inner.free_inode(ino);
    }

    pub fn read(&self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let inner = self.lock();
        let inode = inner.get_node_by_path(path, ROOT_INO).ok_or(Error::InvalidAddress)?;
        if inode.is_dir() {
            return Err(Error::InvalidArgument("is a directory"));
        }
        if offset >= inode.size {
            return Ok(0);
        }
        let blocks = inner.data_blocks(&inode);
        let mut total = 0usize;
        let mut pos = offset;
        let end = inode.size.min(offset + buf.len() as u64);
        while pos < end {
            let block_idx = (pos as usize) / BLOCK_SIZE;
            let block_off = (pos as usize) % BLOCK_SIZE;
            let Some(&blkno) = blocks.get(block_idx) else { break };
            let block = inner.read_block(blkno);
            let n = (BLOCK_SIZE - block_off).min((end - pos) as usize);
            buf[total..total + n].copy_from_slice(&block[block_off..block_off + n]);
            total += n;
            pos += n as u64;
        }
        Ok(total)
    }

    pub fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<usize> {
        let mut inner = self.lock();
        let mut inode = inner.get_node_by_path(path, ROOT_INO).ok_or(Error::InvalidAddress)?;
        if inode.is_dir() {
            return Err(Error::InvalidArgument("is a directory"));
        }
        let mut total = 0usize;
        let mut pos = offset;
        while total < data.len() {
            let block_idx = pos as usize / BLOCK_SIZE;
            let block_off = pos as usize % BLOCK_SIZE;
            let mut blocks = inner.data_blocks(&inode);
            while blocks.len() <= block_idx {
                let blkno = inner.append_data_block(&mut inode).ok_or(Error::OutOfMemory)?;
                blocks.push(blkno);
            }
            let blkno = blocks[block_idx];
            let mut block = inner.read_block(blkno);
            let n = (BLOCK_SIZE - block_off).min(data.len() - total);
            block[block_off..block_off + n].copy_from_slice(&data[total..total + n]);
            inner.write_block(blkno, &block);
            total += n;
            pos += n as u64;
        }
        if pos > inode.size {
            inode.size = pos;
        }
        inner.write_inode(&inode);
        Ok(total)
    }
}

fn split_path(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => Ok((&trimmed[..idx], &trimmed[idx + 1..])),
        None => Err(Error::InvalidArgument("path has no parent component")),
    }
}

#[cfg(feature = "fuse")]
mod fuse_adapter;
#[cfg(feature = "fuse")]
pub use fuse_adapter::mount;

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_fs() -> Filesystem {
        let dev = MemBlockDevice::new(256);
        Filesystem::mkfs(Box::new(dev)).unwrap()
    }

    #[test]
    fn fresh_filesystem_has_empty_root_directory() {
        let fs = fresh_fs();
        let entries = fs.readdir("/").unwrap();
        assert_eq!(entries, vec!["."]);
    }

    #[test]
    fn mkdir_then_readdir_shows_new_directory() {
        let fs = fresh_fs();
        fs.mkdir("/docs").unwrap();
        let mut entries = fs.readdir("/").unwrap();
        entries.sort();
        assert_eq!(entries, vec![".", "docs"]);
        let attr = fs.getattr("/docs").unwrap();
        assert!(attr.is_dir);
    }

    #[test]
    fn create_duplicate_name_fails() {
        let fs = fresh_fs();
        fs.create("/a").unwrap();
        assert!(fs.create("/a").is_err());
    }

    #[test]
    fn write_then_read_round_trips() {
        let fs = fresh_fs();
        fs.create("/hello").unwrap();
        let data = b"hello, file system";
        let written = fs.write("/hello", 0, data).unwrap();
        assert_eq!(written, data.len());
        let mut buf = vec![0u8; data.len()];
        let read = fs.read("/hello", 0, &mut buf).unwrap();
        assert_eq!(read, data.len());
        assert_eq!(&buf, data);
    }

    #[test]
    fn write_spanning_multiple_blocks_round_trips() {
        let fs = fresh_fs();
        fs.create("/big").unwrap();
        let data = vec![0xABu8; BLOCK_SIZE * 3 + 17];
        fs.write("/big", 0, &data).unwrap();
        let mut buf = vec![0u8; data.len()];
        fs.read("/big", 0, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn write_spanning_into_double_indirect_block_round_trips() {
        // 16 direct + 1024 single-indirect blocks exhausts indirect_ptr[0];
        // one block past that forces append_data_block into indirect_ptr[1].
        let dev = MemBlockDevice::new(1200);
        let fs = Filesystem::mkfs(Box::new(dev)).unwrap();
        fs.create("/huge").unwrap();
        let data = vec![0x5Au8; (DP_ENTRIES + INDIRECT_ENTRIES) * BLOCK_SIZE + 123];
        let written = fs.write("/huge", 0, &data).unwrap();
        assert_eq!(written, data.len());
        let mut buf = vec![0u8; data.len()];
        let read = fs.read("/huge", 0, &mut buf).unwrap();
        assert_eq!(read, data.len());
        assert_eq!(buf, data);
    }

    #[test]
    fn unlink_reclaims_double_indirect_blocks() {
        let dev = MemBlockDevice::new(1200);
        let fs = Filesystem::mkfs(Box::new(dev)).unwrap();
        let data = vec![0x7Bu8; (DP_ENTRIES + INDIRECT_ENTRIES) * BLOCK_SIZE + 500];
        fs.create("/a").unwrap();
        fs.write("/a", 0, &data).unwrap();
        fs.unlink("/a").unwrap();
        // If reclaim had leaked the indirect_ptr[1] tree, the data bitmap
        // would be exhausted and this second write of the same size would
        // fail with OutOfMemory.
        fs.create("/b").unwrap();
        fs.write("/b", 0, &data).unwrap();
    }

    #[test]
    fn unlink_removes_file_from_directory() {
        let fs = fresh_fs();
        fs.create("/gone").unwrap();
        fs.unlink("/gone").unwrap();
        assert!(fs.getattr("/gone").is_none());
        assert_eq!(fs.readdir("/").unwrap(), vec!["."]);
    }

    #[test]
    fn rmdir_refuses_non_empty_directory() {
        let fs = fresh_fs();
        fs.mkdir("/d").unwrap();
        fs.create("/d/child").unwrap();
        assert!(fs.rmdir("/d").is_err());
        fs.unlink("/d/child").unwrap();
        assert!(fs.rmdir("/d").is_ok());
    }

    #[test]
    fn nested_path_resolution_walks_multiple_components() {
        let fs = fresh_fs();
        fs.mkdir("/a").unwrap();
        fs.mkdir("/a/b").unwrap();
        fs.create("/a/b/c").unwrap();
        assert!(fs.getattr("/a/b/c").is_some());
    }
}
