//! Thin `fuser::Filesystem` binding. Translates inode-based FUSE callbacks
//! into calls on `cauchyraid::fsops`'s vpath-based contract and maps the
//! core error taxonomy to real `libc::c_int` errno values. No filesystem
//! business logic lives here — only the ino<->vpath table FUSE needs and
//! the callback-to-function wiring.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cauchyraid::core::Core;
use cauchyraid::error::{libc_errno::Errno, Error};
use cauchyraid::fsops::{self, Attr, EntryKind, OpenHandle, RenameFlags};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite,
    Request, TimeOrNow,
};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

fn errno_to_c_int(e: Errno) -> i32 {
    match e {
        Errno::ENOENT => libc::ENOENT,
        Errno::EEXIST => libc::EEXIST,
        Errno::ENOSPC => libc::ENOSPC,
        Errno::EIO => libc::EIO,
        Errno::EINVAL => libc::EINVAL,
        Errno::ENOTEMPTY => libc::ENOTEMPTY,
        Errno::EXDEV => libc::EXDEV,
    }
}

fn reply_err(e: &Error) -> i32 {
    errno_to_c_int(e.to_errno())
}

/// Maps FUSE's opaque inode numbers onto cauchyraid's virtual paths. The
/// root directory is always ino 1; every other path is assigned an ino on
/// first `lookup`/`readdir` and kept until `forget`.
struct InodeTable {
    path_to_ino: HashMap<String, u64>,
    ino_to_path: HashMap<u64, String>,
    next_ino: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut path_to_ino = HashMap::new();
        let mut ino_to_path = HashMap::new();
        path_to_ino.insert(String::from("/"), ROOT_INO);
        ino_to_path.insert(ROOT_INO, String::from("/"));
        Self { path_to_ino, ino_to_path, next_ino: ROOT_INO + 1 }
    }

    fn vpath(&self, ino: u64) -> Option<String> {
        self.ino_to_path.get(&ino).cloned()
    }

    fn ino_for(&mut self, vpath: &str) -> u64 {
        if let Some(&ino) = self.path_to_ino.get(vpath) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.path_to_ino.insert(vpath.to_string(), ino);
        self.ino_to_path.insert(ino, vpath.to_string());
        ino
    }

    fn rekey(&mut self, old: &str, new: &str) {
        if let Some(ino) = self.path_to_ino.remove(old) {
            self.path_to_ino.insert(new.to_string(), ino);
            self.ino_to_path.insert(ino, new.to_string());
        }
    }

    fn forget(&mut self, ino: u64) {
        if ino == ROOT_INO {
            return;
        }
        if let Some(vpath) = self.ino_to_path.remove(&ino) {
            self.path_to_ino.remove(&vpath);
        }
    }
}

fn join_vpath(parent: &str, name: &OsStr) -> String {
    let name = name.to_string_lossy();
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn to_file_attr(ino: u64, attr: &Attr) -> FileAttr {
    let kind = match attr.kind {
        EntryKind::File => FileType::RegularFile,
        EntryKind::Dir => FileType::Directory,
        EntryKind::Symlink => FileType::Symlink,
    };
    let mtime = UNIX_EPOCH + Duration::new(attr.mtime_s.max(0) as u64, attr.mtime_ns);
    let block_size = 512u32;
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.size.div_ceil(block_size as u64),
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind,
        perm: (attr.mode & 0o7777) as u16,
        nlink: if attr.kind == EntryKind::Dir { 2 } else { 1 },
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: block_size,
        flags: 0,
    }
}

/// Handle table keyed by the `fh` FUSE hands back on every subsequent call
/// for that open file.
struct HandleTable {
    handles: HashMap<u64, OpenHandle>,
    next_fh: u64,
}

impl HandleTable {
    fn new() -> Self {
        Self { handles: HashMap::new(), next_fh: 1 }
    }

    fn insert(&mut self, handle: OpenHandle) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, handle);
        fh
    }

    fn get(&self, fh: u64) -> Option<&OpenHandle> {
        self.handles.get(&fh)
    }

    fn remove(&mut self, fh: u64) -> Option<OpenHandle> {
        self.handles.remove(&fh)
    }
}

pub struct CauchyRaidFs {
    core: Arc<Core>,
    inodes: InodeTable,
    handles: HandleTable,
}

impl CauchyRaidFs {
    pub fn new(core: Arc<Core>) -> Self {
        Self { core, inodes: InodeTable::new(), handles: HandleTable::new() }
    }
}

impl Filesystem for CauchyRaidFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_vpath) = self.inodes.vpath(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let vpath = join_vpath(&parent_vpath, name);
        match fsops::getattr(&self.core, &vpath) {
            Ok(attr) => {
                let ino = self.inodes.ino_for(&vpath);
                reply.entry(&TTL, &to_file_attr(ino, &attr), 0);
            }
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, _nlookup: u64) {
        self.inodes.forget(ino);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(vpath) = self.inodes.vpath(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match fsops::getattr(&self.core, &vpath) {
            Ok(attr) => reply.attr(&TTL, &to_file_attr(ino, &attr)),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(vpath) = self.inodes.vpath(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        if let Some(mode) = mode {
            if let Err(e) = fsops::chmod(&self.core, &vpath, mode) {
                reply.error(reply_err(&e));
                return;
            }
        }
        if uid.is_some() || gid.is_some() {
            if let Err(e) = fsops::chown(&self.core, &vpath, uid, gid) {
                reply.error(reply_err(&e));
                return;
            }
        }
        if let Some(size) = size {
            if let Err(e) = fsops::truncate(&self.core, &vpath, size) {
                reply.error(reply_err(&e));
                return;
            }
        }
        if let Some(mtime) = mtime {
            let (s, ns) = match mtime {
                TimeOrNow::SpecificTime(t) => {
                    let dur = t.duration_since(UNIX_EPOCH).unwrap_or_default();
                    (dur.as_secs() as i64, dur.subsec_nanos())
                }
                TimeOrNow::Now => {
                    let dur = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
                    (dur.as_secs() as i64, dur.subsec_nanos())
                }
            };
            if let Err(e) = fsops::utimens(&self.core, &vpath, s, ns) {
                reply.error(reply_err(&e));
                return;
            }
        }

        match fsops::getattr(&self.core, &vpath) {
            Ok(attr) => reply.attr(&TTL, &to_file_attr(ino, &attr)),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(vpath) = self.inodes.vpath(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match fsops::readlink(&self.core, &vpath) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn mkdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let Some(parent_vpath) = self.inodes.vpath(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let vpath = join_vpath(&parent_vpath, name);
        match fsops::mkdir(&self.core, &vpath, mode | libc::S_IFDIR as u32, req.uid(), req.gid()) {
            Ok(()) => match fsops::getattr(&self.core, &vpath) {
                Ok(attr) => {
                    let ino = self.inodes.ino_for(&vpath);
                    reply.entry(&TTL, &to_file_attr(ino, &attr), 0);
                }
                Err(e) => reply.error(reply_err(&e)),
            },
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_vpath) = self.inodes.vpath(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let vpath = join_vpath(&parent_vpath, name);
        match fsops::unlink(&self.core, &vpath) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_vpath) = self.inodes.vpath(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let vpath = join_vpath(&parent_vpath, name);
        match fsops::rmdir(&self.core, &vpath) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn symlink(&mut self, req: &Request<'_>, parent: u64, link_name: &OsStr, target: &std::path::Path, reply: ReplyEntry) {
        let Some(parent_vpath) = self.inodes.vpath(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let vpath = join_vpath(&parent_vpath, link_name);
        let target = target.to_string_lossy().to_string();
        match fsops::symlink(&self.core, &vpath, &target, req.uid(), req.gid()) {
            Ok(()) => match fsops::getattr(&self.core, &vpath) {
                Ok(attr) => {
                    let ino = self.inodes.ino_for(&vpath);
                    reply.entry(&TTL, &to_file_attr(ino, &attr), 0);
                }
                Err(e) => reply.error(reply_err(&e)),
            },
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn rename(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, newparent: u64, newname: &OsStr, flags: u32, reply: ReplyEmpty) {
        let (Some(parent_vpath), Some(newparent_vpath)) = (self.inodes.vpath(parent), self.inodes.vpath(newparent)) else {
            reply.error(libc::ENOENT);
            return;
        };
        let from = join_vpath(&parent_vpath, name);
        let to = join_vpath(&newparent_vpath, newname);
        let rename_flags = RenameFlags { exchange: flags & libc::RENAME_EXCHANGE != 0, noreplace: flags & libc::RENAME_NOREPLACE != 0 };
        match fsops::rename(&self.core, &from, &to, rename_flags) {
            Ok(()) => {
                self.inodes.rekey(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(vpath) = self.inodes.vpath(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let write = flags & libc::O_ACCMODE != libc::O_RDONLY;
        match fsops::open(&self.core, &vpath, write) {
            Ok(handle) => {
                let fh = self.handles.insert(handle);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn read(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, offset: i64, size: u32, _flags: i32, _lock_owner: Option<u64>, reply: ReplyData) {
        let Some(handle) = self.handles.get(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match fsops::read(&self.core, handle, offset.max(0) as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn write(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, offset: i64, data: &[u8], _write_flags: u32, _flags: i32, _lock_owner: Option<u64>, reply: ReplyWrite) {
        let Some(handle) = self.handles.get(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match fsops::write(&self.core, handle, offset.max(0) as u64, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.handles.get(fh) {
            Some(handle) => match fsops::fsync(&self.core, handle) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(reply_err(&e)),
            },
            None => reply.error(libc::EBADF),
        }
    }

    fn release(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, _lock_owner: Option<u64>, _flush: bool, reply: ReplyEmpty) {
        if let Some(handle) = self.handles.remove(fh) {
            fsops::release(&self.core, handle);
        }
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.handles.get(fh) {
            Some(handle) => match fsops::fsync(&self.core, handle) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(reply_err(&e)),
            },
            None => reply.error(libc::EBADF),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(vpath) = self.inodes.vpath(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let entries = match fsops::readdir(&self.core, &vpath) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(reply_err(&e));
                return;
            }
        };

        let mut all: Vec<(u64, FileType, String)> = vec![(ino, FileType::Directory, ".".to_string())];
        all.push((ROOT_INO, FileType::Directory, "..".to_string()));
        for (name, kind) in entries {
            let child_vpath = join_vpath(&vpath, OsStr::new(&name));
            let child_ino = self.inodes.ino_for(&child_vpath);
            let file_type = match kind {
                EntryKind::File => FileType::RegularFile,
                EntryKind::Dir => FileType::Directory,
                EntryKind::Symlink => FileType::Symlink,
            };
            all.push((child_ino, file_type, name));
        }

        for (i, (ino, kind, name)) in all.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match fsops::statfs(&self.core) {
            Ok(info) => reply.statfs(info.blocks, info.blocks_free, info.blocks_avail, 0, 0, info.frag_size, 255, info.frag_size),
            Err(e) => reply.error(reply_err(&e)),
        }
    }

    fn create(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, flags: i32, reply: ReplyCreate) {
        let Some(parent_vpath) = self.inodes.vpath(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let vpath = join_vpath(&parent_vpath, name);
        let _ = flags;
        match fsops::create(&self.core, &vpath, mode | libc::S_IFREG as u32, req.uid(), req.gid()) {
            Ok(handle) => match fsops::getattr(&self.core, &vpath) {
                Ok(attr) => {
                    let ino = self.inodes.ino_for(&vpath);
                    let fh = self.handles.insert(handle);
                    reply.created(&TTL, &to_file_attr(ino, &attr), 0, fh, 0);
                }
                Err(e) => reply.error(reply_err(&e)),
            },
            Err(e) => reply.error(reply_err(&e)),
        }
    }
}
