//! The in-memory source of truth: file/dir/symlink tables, per-drive
//! position index, placement policy, and the backing allocator state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::alloc::PositionAllocator;
use crate::config::Placement;
use crate::error::{Error, Result};
use crate::parity::blocks_for_size;

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub vpath: String,
    pub drive: usize,
    pub size: u64,
    pub pos_start: u32,
    pub blocks: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_s: i64,
    pub mtime_ns: u32,
    pub open_count: u32,
}

#[derive(Debug, Clone)]
pub struct DirRecord {
    pub vpath: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_s: i64,
    pub mtime_ns: u32,
}

#[derive(Debug, Clone)]
pub struct SymlinkRecord {
    pub vpath: String,
    pub target: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_s: i64,
    pub mtime_ns: u32,
}

/// One entry of a drive's sorted position index.
#[derive(Debug, Clone)]
pub struct PosEntry {
    pub pos_start: u32,
    pub blocks: u32,
    pub vpath: String,
}

pub struct DriveHandle {
    pub name: String,
    pub dir: PathBuf,
    pub alloc: PositionAllocator,
}

/// All mutable filesystem state. Callers are expected to hold it behind an
/// `RwLock` (read lock for lookups, write lock for mutations) — this type
/// itself performs no locking.
pub struct State {
    pub drives: Vec<DriveHandle>,
    pub files: HashMap<String, FileRecord>,
    pub dirs: HashMap<String, DirRecord>,
    pub symlinks: HashMap<String, SymlinkRecord>,
    pub pos_index: Vec<Vec<PosEntry>>,
    pub block_size: u32,
    pub placement: Placement,
    rr_counter: u64,
}

/// Raw `statvfs`-style counts for one backing filesystem, in units of
/// `frsize`-sized fragments. Used by `statfs` to sum total/free/available
/// space across every drive's backing filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub frsize: u32,
}

/// Abstraction over "how much free space does this backing directory have",
/// so placement policies are unit-testable without touching a real statvfs.
pub trait FreeSpaceSource: Send + Sync {
    fn free_bytes(&self, dir: &Path) -> std::io::Result<u64>;

    /// Full statvfs-style info for `statfs`. Defaults to reporting
    /// `free_bytes` as both the total and the free/available count, which is
    /// good enough for the placement-policy test fakes that never exercise
    /// `statfs`; the real `StatvfsFreeSpace` source overrides it properly.
    fn fs_stats(&self, dir: &Path) -> std::io::Result<FsStats> {
        let free = self.free_bytes(dir)?;
        Ok(FsStats { blocks: free, bfree: free, bavail: free, frsize: 1 })
    }
}

/// Real free-space source, backed by the host's statvfs.
pub struct StatvfsFreeSpace;

impl FreeSpaceSource for StatvfsFreeSpace {
    fn free_bytes(&self, dir: &Path) -> std::io::Result<u64> {
        self.fs_stats(dir).map(|s| s.bavail * s.frsize as u64)
    }

    #[cfg(unix)]
    fn fs_stats(&self, dir: &Path) -> std::io::Result<FsStats> {
        use std::ffi::CString;
        use std::mem::MaybeUninit;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(dir.as_os_str().as_bytes())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains NUL"))?;
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let stat = unsafe { stat.assume_init() };
        Ok(FsStats { blocks: stat.f_blocks as u64, bfree: stat.f_bfree as u64, bavail: stat.f_bavail as u64, frsize: stat.f_frsize as u32 })
    }

    #[cfg(not(unix))]
    fn fs_stats(&self, _dir: &Path) -> std::io::Result<FsStats> {
        Ok(FsStats { blocks: u64::MAX, bfree: u64::MAX, bavail: u64::MAX, frsize: 1 })
    }
}

impl State {
    pub fn new(drives: Vec<DriveHandle>, block_size: u32, placement: Placement) -> Self {
        let n = drives.len();
        Self {
            drives,
            files: HashMap::new(),
            dirs: HashMap::new(),
            symlinks: HashMap::new(),
            pos_index: vec![Vec::new(); n],
            block_size,
            placement,
            rr_counter: 0,
        }
    }

    pub fn drive_count(&self) -> usize {
        self.drives.len()
    }

    pub fn real_path(&self, drive: usize, vpath: &str) -> PathBuf {
        self.drives[drive].dir.join(vpath.trim_start_matches('/'))
    }

    // -- file table -----------------------------------------------------

    pub fn find_file(&self, vpath: &str) -> Option<&FileRecord> {
        self.files.get(vpath)
    }

    pub fn find_file_mut(&mut self, vpath: &str) -> Option<&mut FileRecord> {
        self.files.get_mut(vpath)
    }

    pub fn insert_file(&mut self, record: FileRecord) {
        let drive = record.drive;
        self.files.insert(record.vpath.clone(), record);
        self.rebuild_pos_index(drive);
    }

    pub fn remove_file(&mut self, vpath: &str) -> Option<FileRecord> {
        let removed = self.files.remove(vpath);
        if let Some(ref f) = removed {
            self.rebuild_pos_index(f.drive);
        }
        removed
    }

    // -- directory table --------------------------------------------------

    pub fn find_dir(&self, vpath: &str) -> Option<&DirRecord> {
        self.dirs.get(vpath)
    }

    pub fn insert_dir(&mut self, record: DirRecord) {
        self.dirs.insert(record.vpath.clone(), record);
    }

    pub fn remove_dir(&mut self, vpath: &str) -> Option<DirRecord> {
        self.dirs.remove(vpath)
    }

    // -- symlink table ----------------------------------------------------

    pub fn find_symlink(&self, vpath: &str) -> Option<&SymlinkRecord> {
        self.symlinks.get(vpath)
    }

    pub fn insert_symlink(&mut self, record: SymlinkRecord) {
        self.symlinks.insert(record.vpath.clone(), record);
    }

    pub fn remove_symlink(&mut self, vpath: &str) -> Option<SymlinkRecord> {
        self.symlinks.remove(vpath)
    }

    // -- position index ---------------------------------------------------

    /// Regenerate `drive`'s sorted position index from the live file table.
    pub fn rebuild_pos_index(&mut self, drive: usize) {
        let mut entries: Vec<PosEntry> = self
            .files
            .values()
            .filter(|f| f.drive == drive)
            .map(|f| PosEntry { pos_start: f.pos_start, blocks: f.blocks, vpath: f.vpath.clone() })
            .collect();
        entries.sort_by_key(|e| e.pos_start);
        for w in entries.windows(2) {
            if w[0].pos_start + w[0].blocks > w[1].pos_start {
                log::warn!(
                    "drive {drive}: overlapping position ranges for '{}' and '{}' — possible corruption",
                    w[0].vpath,
                    w[1].vpath
                );
            }
        }
        self.pos_index[drive] = entries;
    }

    /// Binary search for the file occupying `pos` on `drive`.
    pub fn find_file_at_pos(&self, drive: usize, pos: u32) -> Option<&FileRecord> {
        let index = self.pos_index.get(drive)?;
        let i = index.partition_point(|e| e.pos_start + e.blocks <= pos);
        let entry = index.get(i)?;
        if entry.pos_start <= pos && pos < entry.pos_start + entry.blocks {
            self.files.get(&entry.vpath)
        } else {
            None
        }
    }

    pub fn max_next_free(&self) -> u32 {
        self.drives.iter().map(|d| d.alloc.next_free()).max().unwrap_or(0)
    }

    // -- placement policy --------------------------------------------------

    /// Select a drive for a new file per the configured placement policy.
    pub fn pick_drive(&mut self, probe: &dyn FreeSpaceSource) -> Result<usize> {
        let n = self.drives.len();
        if n == 0 {
            return Err(Error::NoSpace);
        }
        match self.placement {
            Placement::RoundRobin => {
                let idx = (self.rr_counter % n as u64) as usize;
                self.rr_counter = self.rr_counter.wrapping_add(1);
                Ok(idx)
            }
            Placement::MostFree => self.pick_by_free_space(probe, true),
            Placement::Lfs => self.pick_by_free_space(probe, false),
            Placement::Pfrd => self.pick_weighted_random(probe),
        }
    }

    fn free_space_table(&self, probe: &dyn FreeSpaceSource) -> Vec<u64> {
        self.drives
            .iter()
            .map(|d| {
                probe.free_bytes(&d.dir).unwrap_or_else(|e| {
                    log::warn!("statvfs failed for drive '{}': {e}", d.name);
                    0
                })
            })
            .collect()
    }

    fn pick_by_free_space(&self, probe: &dyn FreeSpaceSource, most: bool) -> Result<usize> {
        let free = self.free_space_table(probe);
        let pick = if most {
            free.iter().enumerate().max_by_key(|(_, &b)| b)
        } else {
            free.iter().enumerate().min_by_key(|(_, &b)| b)
        };
        pick.map(|(i, _)| i).ok_or(Error::NoSpace)
    }

    fn pick_weighted_random(&self, probe: &dyn FreeSpaceSource) -> Result<usize> {
        let free = self.free_space_table(probe);
        let total: u64 = free.iter().sum();
        if total == 0 {
            // Every drive reports zero free space (or probing failed
            // everywhere); fall back to uniform choice so creation can
            // still proceed rather than always picking drive 0.
            use rand::Rng;
            return Ok(rand::thread_rng().gen_range(0..free.len()));
        }
        use rand::Rng;
        let mut threshold = rand::thread_rng().gen_range(0..total);
        for (i, &bytes) in free.iter().enumerate() {
            if threshold < bytes {
                return Ok(i);
            }
            threshold -= bytes;
        }
        Ok(free.len() - 1)
    }

    /// Apply a file's new size, recomputing its block count and position
    /// allocation per the grow/shrink rules shared by `write`/`truncate`.
    pub fn resize_file(&mut self, vpath: &str, new_size: u64) -> Result<()> {
        let (drive, old_blocks, pos_start) = {
            let f = self.files.get(vpath).ok_or_else(|| Error::NotFound(vpath.to_string()))?;
            (f.drive, f.blocks, f.pos_start)
        };
        let new_blocks = blocks_for_size(new_size, self.block_size);

        if new_blocks != old_blocks {
            if new_blocks > old_blocks {
                let extra = new_blocks - old_blocks;
                let is_tail = pos_start + old_blocks == self.drives[drive].alloc.next_free();
                if is_tail {
                    self.drives[drive].alloc.allocate(extra)?;
                } else {
                    self.drives[drive].alloc.free(pos_start, old_blocks);
                    let new_start = self.drives[drive].alloc.allocate(new_blocks)?;
                    if let Some(f) = self.files.get_mut(vpath) {
                        f.pos_start = new_start;
                    }
                }
            } else {
                let shrink = old_blocks - new_blocks;
                self.drives[drive].alloc.free(pos_start + new_blocks, shrink);
            }
        }

        if let Some(f) = self.files.get_mut(vpath) {
            f.size = new_size;
            f.blocks = new_blocks;
        }
        self.rebuild_pos_index(drive);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(name: &str) -> DriveHandle {
        DriveHandle { name: name.into(), dir: PathBuf::from(format!("/tmp/{name}")), alloc: PositionAllocator::new() }
    }

    fn sample_file(vpath: &str, drive: usize, pos_start: u32, blocks: u32) -> FileRecord {
        FileRecord {
            vpath: vpath.into(),
            drive,
            size: blocks as u64 * 4096,
            pos_start,
            blocks,
            mode: 0o100644,
            uid: 0,
            gid: 0,
            mtime_s: 0,
            mtime_ns: 0,
            open_count: 0,
        }
    }

    #[test]
    fn position_index_law_finds_exact_owner() {
        let mut st = State::new(vec![drive("a")], 4096, Placement::MostFree);
        st.insert_file(sample_file("/x", 0, 0, 3));
        st.insert_file(sample_file("/y", 0, 3, 2));

        assert!(st.find_file_at_pos(0, 0).is_some());
        assert_eq!(st.find_file_at_pos(0, 0).unwrap().vpath, "/x");
        assert_eq!(st.find_file_at_pos(0, 2).unwrap().vpath, "/x");
        assert_eq!(st.find_file_at_pos(0, 3).unwrap().vpath, "/y");
        assert_eq!(st.find_file_at_pos(0, 4).unwrap().vpath, "/y");
        assert!(st.find_file_at_pos(0, 5).is_none());
        assert!(st.find_file_at_pos(0, 100).is_none());
    }

    #[test]
    fn remove_file_updates_index() {
        let mut st = State::new(vec![drive("a")], 4096, Placement::MostFree);
        st.insert_file(sample_file("/x", 0, 0, 3));
        st.remove_file("/x");
        assert!(st.find_file_at_pos(0, 0).is_none());
        assert!(st.pos_index[0].is_empty());
    }

    #[test]
    fn round_robin_cycles_through_drives() {
        let mut st = State::new(vec![drive("a"), drive("b"), drive("c")], 4096, Placement::RoundRobin);
        let probe = StatvfsFreeSpace;
        let picks: Vec<usize> = (0..6).map(|_| st.pick_drive(&probe).unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn pick_drive_fails_with_no_drives() {
        let mut st = State::new(vec![], 4096, Placement::RoundRobin);
        assert!(matches!(st.pick_drive(&StatvfsFreeSpace), Err(Error::NoSpace)));
    }

    struct FakeFreeSpace(Vec<u64>);
    impl FreeSpaceSource for FakeFreeSpace {
        fn free_bytes(&self, dir: &Path) -> std::io::Result<u64> {
            let idx: usize = dir.to_string_lossy().chars().last().unwrap().to_digit(10).unwrap() as usize;
            Ok(self.0[idx])
        }
    }

    #[test]
    fn mostfree_picks_max() {
        let drives = vec![
            DriveHandle { name: "0".into(), dir: PathBuf::from("/tmp/d0"), alloc: PositionAllocator::new() },
            DriveHandle { name: "1".into(), dir: PathBuf::from("/tmp/d1"), alloc: PositionAllocator::new() },
        ];
        let mut st = State::new(drives, 4096, Placement::MostFree);
        let probe = FakeFreeSpace(vec![10, 90]);
        assert_eq!(st.pick_drive(&probe).unwrap(), 1);
    }

    #[test]
    fn lfs_picks_min() {
        let drives = vec![
            DriveHandle { name: "0".into(), dir: PathBuf::from("/tmp/d0"), alloc: PositionAllocator::new() },
            DriveHandle { name: "1".into(), dir: PathBuf::from("/tmp/d1"), alloc: PositionAllocator::new() },
        ];
        let mut st = State::new(drives, 4096, Placement::Lfs);
        let probe = FakeFreeSpace(vec![10, 90]);
        assert_eq!(st.pick_drive(&probe).unwrap(), 0);
    }

    #[test]
    fn resize_file_grows_tail_contiguous_by_bumping_watermark() {
        let mut st = State::new(vec![drive("a")], 4096, Placement::MostFree);
        st.drives[0].alloc.allocate(2).unwrap();
        st.insert_file(sample_file("/x", 0, 0, 2));
        st.resize_file("/x", 4096 * 5).unwrap();
        assert_eq!(st.files["/x"].blocks, 5);
        assert_eq!(st.files["/x"].pos_start, 0);
        assert_eq!(st.drives[0].alloc.next_free(), 5);
    }

    #[test]
    fn resize_file_shrink_frees_tail_positions() {
        let mut st = State::new(vec![drive("a")], 4096, Placement::MostFree);
        st.drives[0].alloc.allocate(5).unwrap();
        st.insert_file(sample_file("/x", 0, 0, 5));
        st.resize_file("/x", 4096 * 2).unwrap();
        assert_eq!(st.files["/x"].blocks, 2);
        // positions [2,5) freed and abut next_free, so the watermark drops.
        assert_eq!(st.drives[0].alloc.next_free(), 2);
    }
}
