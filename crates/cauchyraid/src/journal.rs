//! Crash-consistent journal: a dirty-position bitmap plus the durable
//! snapshot format used to recover it after an unclean shutdown. The
//! background drain loop itself lives in `core`, since draining needs both
//! the bitmap (here) and the parity engine/state (there).

use std::path::Path;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

const MAGIC: &[u8; 4] = b"LRBM";
/// ~64M positions — a generous sanity bound for rejecting a corrupt file.
const MAX_WORDS: u32 = 64 * 1024 * 1024 / 64;

struct Inner {
    bits: Vec<u64>,
    processing: bool,
    running: bool,
    scrub_pending: bool,
    repair_pending: bool,
}

/// Dirty-position bitmap with the wake/drain signalling the background
/// worker needs. `mark_dirty` never wakes the worker; only `flush` and
/// `stop` do, so the periodic save in the worker loop always sees the
/// bitmap as it stood before a drain, never a half-drained one.
pub struct Journal {
    inner: Mutex<Inner>,
    wake_cv: Condvar,
    drain_cv: Condvar,
}

impl Journal {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { bits: Vec::new(), processing: false, running: true, scrub_pending: false, repair_pending: false }),
            wake_cv: Condvar::new(),
            drain_cv: Condvar::new(),
        }
    }

    pub fn mark_dirty(&self, start: u32, count: u32) {
        if count == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        for pos in start..start.saturating_add(count) {
            set_bit(&mut inner.bits, pos);
        }
    }

    pub fn request_scrub(&self) {
        self.inner.lock().unwrap().scrub_pending = true;
        self.wake_cv.notify_all();
    }

    pub fn request_repair(&self) {
        self.inner.lock().unwrap().repair_pending = true;
        self.wake_cv.notify_all();
    }

    pub fn take_pending_scrub_repair(&self) -> (bool, bool) {
        let mut inner = self.inner.lock().unwrap();
        let scrub = std::mem::take(&mut inner.scrub_pending);
        let repair = std::mem::take(&mut inner.repair_pending);
        (scrub, repair)
    }

    /// Block waking signal until either an explicit wake (flush/stop) or
    /// `timeout` elapses. Returns whether the worker should keep running.
    pub fn wait_for_wake(&self, timeout: Duration) -> bool {
        let guard = self.inner.lock().unwrap();
        if !guard.running {
            return false;
        }
        let (guard, _) = self.wake_cv.wait_timeout(guard, timeout).unwrap();
        guard.running
    }

    /// Snapshot the bitmap's raw words for a durable save — call this
    /// *before* `snapshot_and_clear` so the on-disk copy always covers at
    /// least the positions about to be drained.
    pub fn snapshot_words(&self) -> Vec<u64> {
        self.inner.lock().unwrap().bits.clone()
    }

    /// Atomically swap the bitmap out for an empty one under the bitmap
    /// mutex, marking `processing` before releasing it, and return the set
    /// positions that were dirty.
    pub fn snapshot_and_clear(&self) -> Vec<u32> {
        let mut inner = self.inner.lock().unwrap();
        let positions = bits_to_positions(&inner.bits);
        inner.bits = Vec::new();
        inner.processing = true;
        positions
    }

    /// Re-merge positions whose parity write failed during drain back into
    /// the bitmap, so they are retried on the next drain instead of being
    /// silently lost.
    pub fn reinject(&self, positions: &[u32]) {
        if positions.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        for &p in positions {
            set_bit(&mut inner.bits, p);
        }
    }

    pub fn finish_drain(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.processing = false;
        self.drain_cv.notify_all();
    }

    /// Signal the worker to drain now, then block until the drain
    /// completes and the bitmap is empty.
    pub fn flush(&self) {
        self.wake_cv.notify_all();
        let guard = self.inner.lock().unwrap();
        let _ = self.drain_cv.wait_while(guard, |s| s.processing || !bitmap_is_empty(&s.bits)).unwrap();
    }

    pub fn stop(&self) {
        self.inner.lock().unwrap().running = false;
        self.wake_cv.notify_all();
    }

    pub fn is_empty(&self) -> bool {
        bitmap_is_empty(&self.inner.lock().unwrap().bits)
    }

    /// Merge a bitmap loaded from disk into the in-memory one (bitwise OR).
    pub fn merge_words(&self, words: &[u64]) {
        let mut inner = self.inner.lock().unwrap();
        if inner.bits.len() < words.len() {
            inner.bits.resize(words.len(), 0);
        }
        for (i, &w) in words.iter().enumerate() {
            inner.bits[i] |= w;
        }
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

fn word_index(pos: u32) -> usize {
    (pos / 64) as usize
}

fn set_bit(bits: &mut Vec<u64>, pos: u32) {
    let idx = word_index(pos);
    if idx >= bits.len() {
        bits.resize(idx + 1, 0);
    }
    bits[idx] |= 1u64 << (pos % 64);
}

fn bitmap_is_empty(bits: &[u64]) -> bool {
    bits.iter().all(|&w| w == 0)
}

fn bits_to_positions(bits: &[u64]) -> Vec<u32> {
    let mut out = Vec::new();
    for (i, &word) in bits.iter().enumerate() {
        let mut w = word;
        while w != 0 {
            let bit = w.trailing_zeros();
            out.push(i as u32 * 64 + bit);
            w &= w - 1;
        }
    }
    out
}

/// Write the persistent bitmap file: `"LRBM"` + little-endian word count +
/// little-endian words. Written via temp + rename.
pub fn write_bitmap_file(path: &Path, words: &[u64]) -> std::io::Result<()> {
    use std::io::Write;
    let mut buf = Vec::with_capacity(4 + 4 + words.len() * 8);
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&(words.len() as u32).to_le_bytes());
    for w in words {
        buf.extend_from_slice(&w.to_le_bytes());
    }
    let tmp = path.with_extension("bitmap.tmp");
    let mut f = std::fs::File::create(&tmp)?;
    f.write_all(&buf)?;
    f.sync_all()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read and validate a persisted bitmap file. Returns `None` (not an
/// error) if the file doesn't exist; rejects malformed files by returning
/// `Ok(None)` with a warning rather than failing startup.
pub fn read_bitmap_file(path: &Path) -> std::io::Result<Option<Vec<u64>>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(path)?;
    if data.len() < 8 || &data[0..4] != MAGIC {
        log::warn!("bitmap file '{}': bad magic, ignoring", path.display());
        return Ok(None);
    }
    let word_count = u32::from_le_bytes(data[4..8].try_into().unwrap());
    if word_count == 0 || word_count > MAX_WORDS {
        log::warn!("bitmap file '{}': word_count {word_count} out of sane range, ignoring", path.display());
        return Ok(None);
    }
    let expected_len = 8 + word_count as usize * 8;
    if data.len() < expected_len {
        log::warn!("bitmap file '{}': truncated, ignoring", path.display());
        return Ok(None);
    }
    let mut words = Vec::with_capacity(word_count as usize);
    for i in 0..word_count as usize {
        let off = 8 + i * 8;
        words.push(u64::from_le_bytes(data[off..off + 8].try_into().unwrap()));
    }
    Ok(Some(words))
}

pub fn remove_bitmap_file(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            log::warn!("failed to remove bitmap file '{}' on clean shutdown: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_dirty_then_snapshot_returns_positions() {
        let j = Journal::new();
        j.mark_dirty(3, 1);
        j.mark_dirty(7, 1);
        j.mark_dirty(42, 1);
        let mut positions = j.snapshot_and_clear();
        positions.sort_unstable();
        assert_eq!(positions, vec![3, 7, 42]);
        assert!(j.is_empty());
    }

    #[test]
    fn bitmap_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.bitmap");
        write_bitmap_file(&path, &[0b1010, 0, u64::MAX]).unwrap();
        let loaded = read_bitmap_file(&path).unwrap().unwrap();
        assert_eq!(loaded, vec![0b1010, 0, u64::MAX]);
    }

    #[test]
    fn bad_magic_is_rejected_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bitmap");
        std::fs::write(&path, b"XXXX\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00").unwrap();
        assert!(read_bitmap_file(&path).unwrap().is_none());
    }

    #[test]
    fn merge_words_ors_into_existing_bitmap() {
        let j = Journal::new();
        j.mark_dirty(1, 1);
        j.merge_words(&[0b100]);
        let mut positions = j.snapshot_and_clear();
        positions.sort_unstable();
        assert_eq!(positions, vec![1, 2]);
    }

    #[test]
    fn reinject_restores_failed_positions() {
        let j = Journal::new();
        j.mark_dirty(5, 1);
        let positions = j.snapshot_and_clear();
        assert_eq!(positions, vec![5]);
        j.reinject(&positions);
        assert!(!j.is_empty());
        j.finish_drain();
        let again = j.snapshot_and_clear();
        assert_eq!(again, vec![5]);
    }
}
