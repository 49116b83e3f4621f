//! The adapter-facing contract (§4.6): plain functions over the shared
//! `Core` handle implementing file-op semantics, with no dependency on any
//! particular kernel-filesystem binding crate. A thin binding layer (see
//! the CLI crate) translates a real FUSE trait's callbacks into calls on
//! these functions and maps `Error` to OS errno.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::core::Core;
use crate::error::{Error, Result};
use crate::parity::blocks_for_size;
use crate::state::{DirRecord, FileRecord, SymlinkRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

#[derive(Debug, Clone)]
pub struct Attr {
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_s: i64,
    pub mtime_ns: u32,
}

/// An open file handle. Carries the vpath captured at `open` time so
/// `release` can find the right open-count entry even if the file was
/// renamed in between.
pub struct OpenHandle {
    pub vpath: String,
    pub drive: usize,
    pub real: Option<File>,
    pub dead_drive: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RenameFlags {
    pub exchange: bool,
    pub noreplace: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatfsInfo {
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_avail: u64,
    pub frag_size: u32,
}

fn now_parts() -> (i64, u32) {
    let now = chrono::Utc::now();
    (now.timestamp(), now.timestamp_subsec_nanos())
}

fn split_parent(vpath: &str) -> (&str, &str) {
    match vpath.trim_end_matches('/').rfind('/') {
        Some(0) => ("/", &vpath[1..]),
        Some(i) => (&vpath[..i], &vpath[i + 1..]),
        None => ("/", vpath),
    }
}

/// `mkdir -p` the parent chain of `vpath` on `drive`'s backing directory,
/// inheriting mode from the first peer drive that already has it
/// (falling back to 0755 if none do).
fn mkdir_p_on_drive(core: &Core, drive: usize, vpath: &str) -> std::io::Result<()> {
    let (parent, _) = split_parent(vpath);
    if parent == "/" {
        return Ok(());
    }
    let mut built = PathBuf::new();
    for component in parent.trim_start_matches('/').split('/') {
        if component.is_empty() {
            continue;
        }
        built.push(component);
        let target_dir = {
            let state = core.state.read().unwrap();
            state.drives[drive].dir.join(&built)
        };
        if target_dir.exists() {
            continue;
        }
        let mode = peer_dir_mode(core, &built).unwrap_or(0o755);
        fs::create_dir(&target_dir)?;
        set_unix_mode(&target_dir, mode);
    }
    Ok(())
}

fn peer_dir_mode(core: &Core, rel: &std::path::Path) -> Option<u32> {
    let state = core.state.read().unwrap();
    for d in &state.drives {
        let candidate = d.dir.join(rel);
        if let Ok(meta) = fs::metadata(&candidate) {
            return Some(unix_mode(&meta));
        }
    }
    None
}

#[cfg(unix)]
fn unix_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}
#[cfg(not(unix))]
fn unix_mode(_meta: &fs::Metadata) -> u32 {
    0o755
}

#[cfg(unix)]
pub(crate) fn set_unix_mode(path: &std::path::Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
}
#[cfg(not(unix))]
pub(crate) fn set_unix_mode(_path: &std::path::Path, _mode: u32) {}

// -- getattr ----------------------------------------------------------------

pub fn getattr(core: &Core, vpath: &str) -> Result<Attr> {
    let state = core.state.read().unwrap();
    if let Some(f) = state.find_file(vpath) {
        let real = state.real_path(f.drive, vpath);
        if let Ok(meta) = fs::metadata(&real) {
            return Ok(Attr {
                kind: EntryKind::File,
                size: meta.len(),
                mode: f.mode,
                uid: f.uid,
                gid: f.gid,
                mtime_s: f.mtime_s,
                mtime_ns: f.mtime_ns,
            });
        }
        // Backing file missing (e.g. dead drive) — fall back to stored
        // metadata so the pool still answers getattr during recovery.
        return Ok(Attr { kind: EntryKind::File, size: f.size, mode: f.mode, uid: f.uid, gid: f.gid, mtime_s: f.mtime_s, mtime_ns: f.mtime_ns });
    }
    if let Some(d) = state.find_dir(vpath) {
        return Ok(Attr { kind: EntryKind::Dir, size: 0, mode: d.mode, uid: d.uid, gid: d.gid, mtime_s: d.mtime_s, mtime_ns: d.mtime_ns });
    }
    if let Some(s) = state.find_symlink(vpath) {
        return Ok(Attr {
            kind: EntryKind::Symlink,
            size: s.target.len() as u64,
            mode: s.mode,
            uid: s.uid,
            gid: s.gid,
            mtime_s: s.mtime_s,
            mtime_ns: s.mtime_ns,
        });
    }
    if vpath == "/" {
        return Ok(Attr { kind: EntryKind::Dir, size: 0, mode: 0o755, uid: 0, gid: 0, mtime_s: 0, mtime_ns: 0 });
    }
    Err(Error::NotFound(vpath.to_string()))
}

// -- readdir ------------------------------------------------------------

pub fn readdir(core: &Core, vpath: &str) -> Result<Vec<(String, EntryKind)>> {
    let state = core.state.read().unwrap();
    let prefix = if vpath == "/" { String::new() } else { vpath.to_string() };
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    let direct_child = |child: &str| -> Option<String> {
        let rest = child.strip_prefix(prefix.as_str())?.strip_prefix('/')?;
        if rest.is_empty() || rest.contains('/') {
            None
        } else {
            Some(rest.to_string())
        }
    };

    for f in state.files.keys() {
        if let Some(name) = direct_child(f) {
            if seen.insert(name.clone()) {
                out.push((name, EntryKind::File));
            }
        }
    }
    for d in state.dirs.keys() {
        if let Some(name) = direct_child(d) {
            if seen.insert(name.clone()) {
                out.push((name, EntryKind::Dir));
            }
        }
    }
    for s in state.symlinks.keys() {
        if let Some(name) = direct_child(s) {
            if seen.insert(name.clone()) {
                out.push((name, EntryKind::Symlink));
            }
        }
    }

    for drive in &state.drives {
        let real_dir = drive.dir.join(prefix.trim_start_matches('/'));
        let Ok(entries) = fs::read_dir(&real_dir) else { continue };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if seen.insert(name.clone()) {
                let kind = if entry.path().is_dir() { EntryKind::Dir } else { EntryKind::File };
                out.push((name, kind));
            }
        }
    }

    Ok(out)
}

// -- open / release -------------------------------------------------------

pub fn open(core: &Core, vpath: &str, write: bool) -> Result<OpenHandle> {
    let mut state = core.state.write().unwrap();
    let file = state.find_file_mut(vpath).ok_or_else(|| Error::NotFound(vpath.to_string()))?;
    file.open_count += 1;
    let drive = file.drive;
    let real_path = state.real_path(drive, vpath);
    drop(state);

    let mut opts = OpenOptions::new();
    opts.read(true);
    if write {
        opts.write(true);
    }
    match opts.open(&real_path) {
        Ok(f) => Ok(OpenHandle { vpath: vpath.to_string(), drive, real: Some(f), dead_drive: false }),
        Err(e) if !write && core.parity.is_some() && matches!(e.raw_os_error(), Some(2) | Some(5) | Some(6)) => {
            log::warn!("open '{vpath}': backing unavailable ({e}), serving as dead-drive");
            Ok(OpenHandle { vpath: vpath.to_string(), drive, real: None, dead_drive: true })
        }
        Err(source) => {
            let mut state = core.state.write().unwrap();
            if let Some(file) = state.find_file_mut(vpath) {
                file.open_count = file.open_count.saturating_sub(1);
            }
            Err(Error::ReadError { path: real_path, source })
        }
    }
}

pub fn release(core: &Core, handle: OpenHandle) {
    let mut state = core.state.write().unwrap();
    if let Some(file) = state.find_file_mut(&handle.vpath) {
        file.open_count = file.open_count.saturating_sub(1);
    }
    // `handle.real` (if any) is closed by Drop.
}

// -- read -----------------------------------------------------------------

pub fn read(core: &Core, handle: &OpenHandle, offset: u64, size: usize) -> Result<Vec<u8>> {
    if !handle.dead_drive {
        if let Some(f) = &handle.real {
            let mut buf = vec![0u8; size];
            #[cfg(unix)]
            {
                use std::os::unix::fs::FileExt;
                match f.read_at(&mut buf, offset) {
                    Ok(n) => {
                        buf.truncate(n);
                        return Ok(buf);
                    }
                    Err(source) => {
                        if core.parity.is_none() {
                            return Err(Error::ReadError { path: PathBuf::from(&handle.vpath), source });
                        }
                        log::warn!("read '{}' hit I/O error, falling back to parity recovery: {source}", handle.vpath);
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let mut f = f.try_clone().map_err(|source| Error::ReadError { path: PathBuf::from(&handle.vpath), source })?;
                f.seek(SeekFrom::Start(offset)).map_err(|source| Error::ReadError { path: PathBuf::from(&handle.vpath), source })?;
                let n = f.read(&mut buf).map_err(|source| Error::ReadError { path: PathBuf::from(&handle.vpath), source })?;
                buf.truncate(n);
                return Ok(buf);
            }
        }
    }
    read_via_recovery(core, handle, offset, size)
}

fn read_via_recovery(core: &Core, handle: &OpenHandle, offset: u64, size: usize) -> Result<Vec<u8>> {
    let parity = core.parity.as_ref().ok_or(Error::ParityUnavailable)?;
    let state = core.state.read().unwrap();
    let file = state.find_file(&handle.vpath).ok_or_else(|| Error::NotFound(handle.vpath.clone()))?;
    let block_size = state.block_size as u64;
    let end = (offset + size as u64).min(file.size);
    if offset >= end {
        return Ok(Vec::new());
    }

    let mut out = Vec::with_capacity((end - offset) as usize);
    let mut pos_in_file = offset;
    while pos_in_file < end {
        let block_idx = (pos_in_file / block_size) as u32;
        let pos = file.pos_start + block_idx;
        let block = parity.recover_block(&state, handle.drive, pos)?;
        let block_off = (pos_in_file % block_size) as usize;
        let take = ((end - pos_in_file).min(block_size - block_off as u64)) as usize;
        out.extend_from_slice(&block[block_off..block_off + take]);
        pos_in_file += take as u64;
    }
    Ok(out)
}

// -- write ------------------------------------------------------------------

pub fn write(core: &Core, handle: &OpenHandle, offset: u64, data: &[u8]) -> Result<usize> {
    let f = handle.real.as_ref().ok_or_else(|| Error::WriteError {
        path: PathBuf::from(&handle.vpath),
        source: std::io::Error::new(std::io::ErrorKind::Other, "no backing file open for write (dead drive)"),
    })?;

    let written;
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        written = f.write_at(data, offset).map_err(|source| Error::WriteError { path: PathBuf::from(&handle.vpath), source })?;
    }
    #[cfg(not(unix))]
    {
        let mut f = f.try_clone().map_err(|source| Error::WriteError { path: PathBuf::from(&handle.vpath), source })?;
        f.seek(SeekFrom::Start(offset)).map_err(|source| Error::WriteError { path: PathBuf::from(&handle.vpath), source })?;
        written = f.write(data).map_err(|source| Error::WriteError { path: PathBuf::from(&handle.vpath), source })?;
    }

    let new_size = offset + written as u64;
    let (mtime_s, mtime_ns) = now_parts();
    let mut state = core.state.write().unwrap();
    let cur_size = state.find_file(&handle.vpath).map(|f| f.size).unwrap_or(0);
    if new_size > cur_size {
        state.resize_file(&handle.vpath, new_size)?;
    }
    if let Some(file) = state.find_file_mut(&handle.vpath) {
        file.mtime_s = mtime_s;
        file.mtime_ns = mtime_ns;
        let pos_start = file.pos_start;
        let first_block = (offset / state.block_size as u64) as u32;
        let last_block = ((offset + written as u64).saturating_sub(1) / state.block_size as u64) as u32;
        let dirty_start = pos_start + first_block;
        let dirty_count = last_block - first_block + 1;
        drop(state);
        core.journal.mark_dirty(dirty_start, dirty_count);
    }
    Ok(written)
}

// -- create -----------------------------------------------------------------

pub fn create(core: &Core, vpath: &str, mode: u32, uid: u32, gid: u32) -> Result<OpenHandle> {
    {
        let state = core.state.read().unwrap();
        if state.find_file(vpath).is_some() || state.find_dir(vpath).is_some() || state.find_symlink(vpath).is_some() {
            return Err(Error::Exists(vpath.to_string()));
        }
    }

    let mut state = core.state.write().unwrap();
    let drive = state.pick_drive(core.free_space.as_ref())?;
    drop(state);

    mkdir_p_on_drive(core, drive, vpath).map_err(|source| Error::WriteError { path: PathBuf::from(vpath), source })?;

    let real_path = {
        let state = core.state.read().unwrap();
        state.real_path(drive, vpath)
    };
    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&real_path)
        .map_err(|source| Error::WriteError { path: real_path.clone(), source })?;
    set_unix_mode(&real_path, mode);

    let (mtime_s, mtime_ns) = now_parts();
    let mut state = core.state.write().unwrap();
    let pos_start = state.drives[drive].alloc.allocate(0)?;
    state.insert_file(FileRecord {
        vpath: vpath.to_string(),
        drive,
        size: 0,
        pos_start,
        blocks: 0,
        mode,
        uid,
        gid,
        mtime_s,
        mtime_ns,
        open_count: 1,
    });

    Ok(OpenHandle { vpath: vpath.to_string(), drive, real: Some(f), dead_drive: false })
}

// -- unlink -----------------------------------------------------------------

pub fn unlink(core: &Core, vpath: &str) -> Result<()> {
    let real_path = {
        let mut state = core.state.write().unwrap();
        let file = state.find_file(vpath).ok_or_else(|| Error::NotFound(vpath.to_string()))?.clone();
        let real_path = state.real_path(file.drive, vpath);
        state.remove_file(vpath);
        state.drives[file.drive].alloc.free(file.pos_start, file.blocks);
        real_path
    };
    fs::remove_file(&real_path).map_err(|source| Error::WriteError { path: real_path, source })
}

// -- rename -----------------------------------------------------------------

pub fn rename(core: &Core, from: &str, to: &str, flags: RenameFlags) -> Result<()> {
    if flags.exchange {
        return Err(Error::Invalid("RENAME_EXCHANGE is not supported".into()));
    }

    let mut state = core.state.write().unwrap();
    let dest_exists = state.find_file(to).is_some() || state.find_dir(to).is_some() || state.find_symlink(to).is_some();
    if flags.noreplace && dest_exists {
        return Err(Error::Exists(to.to_string()));
    }

    if let Some(file) = state.find_file(from).cloned() {
        let old_real = state.real_path(file.drive, from);
        let new_real = state.real_path(file.drive, to);
        if let Some(parent) = new_real.parent() {
            let _ = fs::create_dir_all(parent);
        }
        fs::rename(&old_real, &new_real).map_err(|source| Error::WriteError { path: new_real, source })?;
        state.remove_file(from);
        let mut renamed = file;
        renamed.vpath = to.to_string();
        state.insert_file(renamed);
        return Ok(());
    }

    if state.find_dir(from).is_some() {
        for d in 0..state.drives.len() {
            let old_real = state.real_path(d, from);
            if old_real.exists() {
                let new_real = state.real_path(d, to);
                if let Some(parent) = new_real.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                if let Err(source) = fs::rename(&old_real, &new_real) {
                    return Err(Error::WriteError { path: new_real, source });
                }
            }
        }
        let prefix = format!("{}/", from.trim_end_matches('/'));
        let rekey = |vpath: &str| -> Option<String> {
            if vpath == from {
                Some(to.to_string())
            } else {
                vpath.strip_prefix(prefix.as_str()).map(|rest| format!("{}/{rest}", to.trim_end_matches('/')))
            }
        };
        let file_keys: Vec<(String, String)> = state.files.keys().filter_map(|k| rekey(k).map(|new_k| (k.clone(), new_k))).collect();
        for (old_k, new_k) in file_keys {
            if let Some(mut f) = state.remove_file(&old_k) {
                f.vpath = new_k;
                state.insert_file(f);
            }
        }
        let dir_keys: Vec<(String, String)> = state.dirs.keys().filter_map(|k| rekey(k).map(|new_k| (k.clone(), new_k))).collect();
        for (old_k, new_k) in dir_keys {
            if let Some(mut d) = state.remove_dir(&old_k) {
                d.vpath = new_k;
                state.insert_dir(d);
            }
        }
        return Ok(());
    }

    if let Some(link) = state.find_symlink(from).cloned() {
        state.remove_symlink(from);
        let mut renamed = link;
        renamed.vpath = to.to_string();
        state.insert_symlink(renamed);
        return Ok(());
    }

    Err(Error::NotFound(from.to_string()))
}

// -- mkdir / rmdir ------------------------------------------------------

pub fn mkdir(core: &Core, vpath: &str, mode: u32, uid: u32, gid: u32) -> Result<()> {
    let drive = {
        let mut state = core.state.write().unwrap();
        state.pick_drive(core.free_space.as_ref())?
    };
    mkdir_p_on_drive(core, drive, vpath).map_err(|source| Error::WriteError { path: PathBuf::from(vpath), source })?;
    let real = { core.state.read().unwrap().real_path(drive, vpath) };
    fs::create_dir(&real).map_err(|source| Error::WriteError { path: real.clone(), source })?;
    set_unix_mode(&real, mode);

    let (mtime_s, mtime_ns) = now_parts();
    core.state.write().unwrap().insert_dir(DirRecord { vpath: vpath.to_string(), mode, uid, gid, mtime_s, mtime_ns });
    Ok(())
}

pub fn rmdir(core: &Core, vpath: &str) -> Result<()> {
    let drives: Vec<PathBuf> = {
        let state = core.state.read().unwrap();
        (0..state.drives.len()).map(|d| state.real_path(d, vpath)).collect()
    };
    for real in &drives {
        if real.exists() {
            fs::remove_dir(real).map_err(|source| Error::WriteError { path: real.clone(), source })?;
        }
    }
    core.state.write().unwrap().remove_dir(vpath);
    Ok(())
}

// -- truncate ---------------------------------------------------------------

pub fn truncate(core: &Core, vpath: &str, size: u64) -> Result<()> {
    let real_path = {
        let state = core.state.read().unwrap();
        let file = state.find_file(vpath).ok_or_else(|| Error::NotFound(vpath.to_string()))?;
        state.real_path(file.drive, vpath)
    };
    let f = OpenOptions::new().write(true).open(&real_path).map_err(|source| Error::WriteError { path: real_path.clone(), source })?;
    f.set_len(size).map_err(|source| Error::WriteError { path: real_path.clone(), source })?;

    let (mtime_s, mtime_ns) = now_parts();
    let mut state = core.state.write().unwrap();
    let old_blocks = state.find_file(vpath).map(|f| f.blocks).unwrap_or(0);
    state.resize_file(vpath, size)?;
    let new_blocks = blocks_for_size(size, state.block_size);
    let pos_start = match state.find_file_mut(vpath) {
        Some(f) => {
            f.mtime_s = mtime_s;
            f.mtime_ns = mtime_ns;
            f.pos_start
        }
        None => return Ok(()),
    };
    drop(state);
    core.journal.mark_dirty(pos_start, old_blocks.max(new_blocks).max(1));
    Ok(())
}

// -- symlink / readlink ---------------------------------------------------

pub fn symlink(core: &Core, vpath: &str, target: &str, uid: u32, gid: u32) -> Result<()> {
    let mut state = core.state.write().unwrap();
    if state.find_file(vpath).is_some() || state.find_dir(vpath).is_some() || state.find_symlink(vpath).is_some() {
        return Err(Error::Exists(vpath.to_string()));
    }
    let (mtime_s, mtime_ns) = now_parts();
    state.insert_symlink(SymlinkRecord { vpath: vpath.to_string(), target: target.to_string(), mode: 0o120777, uid, gid, mtime_s, mtime_ns });
    Ok(())
}

pub fn readlink(core: &Core, vpath: &str) -> Result<String> {
    let state = core.state.read().unwrap();
    state.find_symlink(vpath).map(|s| s.target.clone()).ok_or_else(|| Error::NotFound(vpath.to_string()))
}

// -- chmod / chown / utimens ------------------------------------------------

pub fn chmod(core: &Core, vpath: &str, mode: u32) -> Result<()> {
    let mut state = core.state.write().unwrap();
    if let Some(f) = state.find_file_mut(vpath) {
        f.mode = mode;
        let drive = f.drive;
        let real = state.real_path(drive, vpath);
        if real.exists() {
            set_unix_mode(&real, mode);
        }
        return Ok(());
    }
    if let Some(d) = state.dirs.get_mut(vpath) {
        d.mode = mode;
        for drive in 0..state.drives.len() {
            let real = state.real_path(drive, vpath);
            if real.exists() {
                set_unix_mode(&real, mode);
            }
        }
        return Ok(());
    }
    if let Some(s) = state.symlinks.get_mut(vpath) {
        // Symlinks are purely virtual: never chmod a real backing inode.
        s.mode = mode;
        return Ok(());
    }
    Err(Error::NotFound(vpath.to_string()))
}

pub fn chown(core: &Core, vpath: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
    let mut state = core.state.write().unwrap();
    if let Some(f) = state.files.get_mut(vpath) {
        if let Some(uid) = uid {
            f.uid = uid;
        }
        if let Some(gid) = gid {
            f.gid = gid;
        }
        return Ok(());
    }
    if let Some(d) = state.dirs.get_mut(vpath) {
        if let Some(uid) = uid {
            d.uid = uid;
        }
        if let Some(gid) = gid {
            d.gid = gid;
        }
        return Ok(());
    }
    if let Some(s) = state.symlinks.get_mut(vpath) {
        // Never calls lchown on a real backing inode: symlinks have no
        // real backing of their own to update.
        if let Some(uid) = uid {
            s.uid = uid;
        }
        if let Some(gid) = gid {
            s.gid = gid;
        }
        return Ok(());
    }
    Err(Error::NotFound(vpath.to_string()))
}

pub fn utimens(core: &Core, vpath: &str, mtime_s: i64, mtime_ns: u32) -> Result<()> {
    let mut state = core.state.write().unwrap();
    if let Some(f) = state.files.get_mut(vpath) {
        f.mtime_s = mtime_s;
        f.mtime_ns = mtime_ns;
        return Ok(());
    }
    if let Some(d) = state.dirs.get_mut(vpath) {
        d.mtime_s = mtime_s;
        d.mtime_ns = mtime_ns;
        return Ok(());
    }
    if let Some(s) = state.symlinks.get_mut(vpath) {
        s.mtime_s = mtime_s;
        s.mtime_ns = mtime_ns;
        return Ok(());
    }
    Err(Error::NotFound(vpath.to_string()))
}

// -- fsync / statfs -----------------------------------------------------

pub fn fsync(core: &Core, handle: &OpenHandle) -> Result<()> {
    if let Some(f) = &handle.real {
        f.sync_data().map_err(|source| Error::WriteError { path: PathBuf::from(&handle.vpath), source })?;
    }
    let (pos_start, blocks) = {
        let state = core.state.read().unwrap();
        state.find_file(&handle.vpath).map(|f| (f.pos_start, f.blocks.max(1))).unwrap_or((0, 0))
    };
    if blocks > 0 {
        core.journal.mark_dirty(pos_start, blocks);
    }
    core.journal.flush();
    Ok(())
}

/// Sum blocks/free/avail across every drive's backing filesystem,
/// normalized by the largest `frsize` seen among them (per §4.6: drives can
/// sit on backing filesystems with different fragment sizes).
pub fn statfs(core: &Core) -> Result<StatfsInfo> {
    let state = core.state.read().unwrap();
    let mut total_bytes = 0u64;
    let mut free_bytes = 0u64;
    let mut avail_bytes = 0u64;
    let mut frsize_max: u32 = 1;

    for d in &state.drives {
        match core.free_space.fs_stats(&d.dir) {
            Ok(s) => {
                frsize_max = frsize_max.max(s.frsize.max(1));
                total_bytes += s.blocks * s.frsize as u64;
                free_bytes += s.bfree * s.frsize as u64;
                avail_bytes += s.bavail * s.frsize as u64;
            }
            Err(e) => log::warn!("statvfs failed for drive '{}': {e}", d.name),
        }
    }

    Ok(StatfsInfo {
        blocks: total_bytes / frsize_max as u64,
        blocks_free: free_bytes / frsize_max as u64,
        blocks_avail: avail_bytes / frsize_max as u64,
        frag_size: frsize_max,
    })
}
