//! Bridges `Filesystem`'s path-based API to the `fuser` crate's
//! inode-based one. FUSE identifies files by an opaque `u64` inode
//! number handed out via `lookup`; this adapter just remembers the
//! absolute path behind each inode it has handed out.
//!
//! This is a thin demonstration binding, not a production FUSE driver:
//! it does not track hard links, renames invalidate nothing, and every
//! call re-resolves the path from scratch through `Filesystem`'s own
//! coarse lock.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem as FuseFilesystem, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, Request,
};

use super::Filesystem;

const TTL: Duration = Duration::from_secs(1);
const ROOT_FUSE_INO: u64 = 1;

struct InoTable {
    path_of: HashMap<u64, String>,
    next: u64,
}

impl InoTable {
    fn new() -> Self {
        let mut path_of = HashMap::new();
        path_of.insert(ROOT_FUSE_INO, "/".to_string());
        InoTable { path_of, next: 2 }
    }

    fn path(&self, ino: u64) -> Option<&str> {
        self.path_of.get(&ino).map(|s| s.as_str())
    }

    fn intern(&mut self, path: String) -> u64 {
        if let Some((&ino, _)) = self.path_of.iter().find(|(_, p)| **p == path) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.path_of.insert(ino, path);
        ino
    }
}

pub struct FuseAdapter {
    fs: Filesystem,
    inos: Mutex<InoTable>,
}

impl FuseAdapter {
    pub fn new(fs: Filesystem) -> Self {
        FuseAdapter {
            fs,
            inos: Mutex::new(InoTable::new()),
        }
    }

    fn join(parent_path: &str, name: &str) -> String {
        if parent_path == "/" {
            format!("/{name}")
        } else {
            format!("{parent_path}/{name}")
        }
    }

    fn attr_for(&self, ino: u64, path: &str) -> Option<FileAttr> {
        let attr = self.fs.getattr(path)?;
        let kind = if attr.is_dir { FileType::Directory } else { FileType::RegularFile };
        let mtime = UNIX_EPOCH + Duration::from_secs(attr.mtime);
        Some(FileAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(super::BLOCK_SIZE as u64).max(1),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm: if attr.is_dir { 0o755 } else { 0o644 },
            nlink: attr.links.max(1),
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: super::BLOCK_SIZE as u32,
            flags: 0,
        })
    }
}

impl FuseFilesystem for FuseAdapter {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.inos.lock().unwrap().path(parent).map(String::from) else {
            reply.error(libc::ENOENT);
            return;
        };
        let name = name.to_string_lossy().into_owned();
        let path = Self::join(&parent_path, &name);
        match self.fs.getattr(&path) {
            Some(_) => {
                let ino = self.inos.lock().unwrap().intern(path.clone());
                match self.attr_for(ino, &path) {
                    Some(attr) => reply.entry(&TTL, &attr, 0),
                    None => reply.error(libc::ENOENT),
                }
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.inos.lock().unwrap().path(ino).map(String::from) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.attr_for(ino, &path) {
            Some(attr) => reply.attr(&TTL, &attr),
            None => reply.error(libc::ENOENT),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.inos.lock().unwrap().path(ino).map(String::from) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(entries) = self.fs.readdir(&path) else {
            reply.error(libc::ENOENT);
            return;
        };
        for (i, name) in entries.into_iter().enumerate().skip(offset as usize) {
            let child_path = if name == "." {
                path.clone()
            } else {
                Self::join(&path, &name)
            };
            let child_ino = self.inos.lock().unwrap().intern(child_path.clone());
            let kind = match self.fs.getattr(&child_path) {
                Some(a) if a.is_dir => FileType::Directory,
                _ => FileType::RegularFile,
            };
            if reply.add(child_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.inos.lock().unwrap().path(parent).map(String::from) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = Self::join(&parent_path, &name.to_string_lossy());
        match self.fs.mkdir(&path) {
            Ok(_) => {
                let ino = self.inos.lock().unwrap().intern(path.clone());
                match self.attr_for(ino, &path) {
                    Some(attr) => reply.entry(&TTL, &attr, 0),
                    None => reply.error(libc::EIO),
                }
            }
            Err(_) => reply.error(libc::EEXIST),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.inos.lock().unwrap().path(parent).map(String::from) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = Self::join(&parent_path, &name.to_string_lossy());
        match self.fs.rmdir(&path) {
            Ok(()) => reply.ok(),
            Err(_) => reply.error(libc::ENOTEMPTY),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(parent_path) = self.inos.lock().unwrap().path(parent).map(String::from) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = Self::join(&parent_path, &name.to_string_lossy());
        match self.fs.create(&path) {
            Ok(_) => {
                let ino = self.inos.lock().unwrap().intern(path.clone());
                match self.attr_for(ino, &path) {
                    Some(attr) => reply.created(&TTL, &attr, 0, 0, 0),
                    None => reply.error(libc::EIO),
                }
            }
            Err(_) => reply.error(libc::EEXIST),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.inos.lock().unwrap().path(parent).map(String::from) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = Self::join(&parent_path, &name.to_string_lossy());
        match self.fs.unlink(&path) {
            Ok(()) => reply.ok(),
            Err(_) => reply.error(libc::ENOENT),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.inos.lock().unwrap().path(ino).map(String::from) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut buf = vec![0u8; size as usize];
        match self.fs.read(&path, offset as u64, &mut buf) {
            Ok(n) => reply.data(&buf[..n]),
            Err(_) => reply.error(libc::EIO),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        let Some(path) = self.inos.lock().unwrap().path(ino).map(String::from) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.write(&path, offset as u64, data) {
            Ok(n) => reply.written(n as u32),
            Err(_) => reply.error(libc::EIO),
        }
    }
}

/// Formats (if `format` is true) or mounts an existing file system at
/// `mountpoint`, blocking until the mount is unmounted.
pub fn mount(fs: Filesystem, mountpoint: &Path) -> std::io::Result<()> {
    let options = vec![fuser::MountOption::FSName("rufs".to_string())];
    fuser::mount2(FuseAdapter::new(fs), mountpoint, &options)
}
