//! Ties config, state, the parity engine and the journal together into one
//! shared handle (`Core`), and runs the journal's background drain loop.
//!
//! Per the cyclic-reference note in the design: the worker thread is handed
//! its own `Arc<Core>` clone at spawn time rather than `Core` holding a
//! back-reference to the thread; `Core` only keeps the `JoinHandle`.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::alloc::PositionAllocator;
use crate::codec;
use crate::config::Config;
use crate::control;
use crate::error::Result;
use crate::journal::{self, Journal};
use crate::parity::{ParityEngine, Scratch};
use crate::state::{DriveHandle, FreeSpaceSource, StatvfsFreeSpace, State};

pub struct Core {
    pub config: Config,
    pub state: RwLock<State>,
    pub parity: Option<ParityEngine>,
    pub journal: Journal,
    pub free_space: Box<dyn FreeSpaceSource>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Core {
    fn bitmap_path(config: &Config) -> PathBuf {
        let mut p = config.content_paths[0].clone();
        let mut name = p.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".bitmap");
        p.set_file_name(name);
        p
    }

    pub fn ctrl_path(config: &Config) -> PathBuf {
        let mut p = config.content_paths[0].clone();
        let mut name = p.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".ctrl");
        p.set_file_name(name);
        p
    }

    /// Mount: build state from config, load any existing content file and
    /// bitmap, open parity, and spawn the background drain worker.
    pub fn mount(config: Config) -> Result<Arc<Core>> {
        let drives = config
            .drives
            .iter()
            .map(|d| DriveHandle { name: d.name.clone(), dir: d.dir.clone(), alloc: PositionAllocator::new() })
            .collect();
        let mut state = State::new(drives, config.block_size, config.placement);
        codec::load(&mut state, &config.content_paths)?;

        let parity = if config.parity_levels() > 0 {
            Some(ParityEngine::open(state.drive_count(), &config.parity_paths, config.block_size as usize)?)
        } else {
            None
        };

        let journal = Journal::new();
        let bitmap_path = Self::bitmap_path(&config);
        if let Ok(Some(words)) = journal::read_bitmap_file(&bitmap_path) {
            log::warn!("restoring dirty bitmap from '{}' — pool was not shut down cleanly", bitmap_path.display());
            journal.merge_words(&words);
        }

        let core = Arc::new(Core {
            config,
            state: RwLock::new(state),
            parity,
            journal,
            free_space: Box::new(StatvfsFreeSpace),
            worker: Mutex::new(None),
        });

        let worker_handle = {
            let core = Arc::clone(&core);
            std::thread::spawn(move || core.worker_loop())
        };
        *core.worker.lock().unwrap() = Some(worker_handle);

        let ctrl_path = Self::ctrl_path(&core.config);
        match control::spawn_server(Arc::clone(&core), &ctrl_path) {
            Ok(_handle) => {
                // The accept loop blocks in `accept()` for the life of the
                // process; it is not joined on unmount, only starved by the
                // removal of its socket file below.
            }
            Err(e) => log::error!("failed to start control socket at '{}': {e}", ctrl_path.display()),
        }

        log::info!("pool mounted: {} data drive(s), {} parity level(s)", core.state.read().unwrap().drive_count(), core.config.parity_levels());
        Ok(core)
    }

    /// Stop the worker, run one last flush, persist state, and remove the
    /// dirty bitmap file (clean shutdown per invariant 5).
    pub fn unmount(&self) {
        self.journal.flush();
        self.journal.stop();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        let state = self.state.read().unwrap();
        if let Err(e) = codec::save(&state, &self.config.content_paths) {
            log::error!("final content save on unmount failed: {e}");
        }
        journal::remove_bitmap_file(&Self::bitmap_path(&self.config));

        let ctrl_path = Self::ctrl_path(&self.config);
        if ctrl_path.exists() {
            if let Err(e) = std::fs::remove_file(&ctrl_path) {
                log::warn!("failed to remove control socket '{}' on unmount: {e}", ctrl_path.display());
            }
        }
        log::info!("pool unmounted cleanly");
    }

    fn drain_interval(&self) -> Duration {
        Duration::from_millis(1000)
    }

    fn save_interval(&self) -> Duration {
        Duration::from_secs(self.config.bitmap_interval_s.max(1))
    }

    fn worker_loop(self: Arc<Core>) {
        let mut last_save = Instant::now() - self.save_interval();
        loop {
            let sleep_for = self.drain_interval().min(self.save_interval());
            if !self.journal.wait_for_wake(sleep_for) {
                break;
            }

            if last_save.elapsed() >= self.save_interval() {
                self.save_checkpoint();
                last_save = Instant::now();
            }

            let positions = self.journal.snapshot_and_clear();
            if !positions.is_empty() {
                let failed = self.drain_positions(&positions);
                if !failed.is_empty() {
                    log::warn!("drain: {} position(s) failed to encode, re-marking dirty", failed.len());
                }
                self.journal.reinject(&failed);
            }
            self.journal.finish_drain();

            let (scrub, repair) = self.journal.take_pending_scrub_repair();
            if scrub || repair {
                self.run_scrub(repair);
            }
        }
    }

    fn save_checkpoint(&self) {
        let words = self.journal.snapshot_words();
        {
            let state = self.state.read().unwrap();
            if let Err(e) = codec::save(&state, &self.config.content_paths) {
                log::error!("periodic content save failed: {e}");
            }
        }
        if let Err(e) = journal::write_bitmap_file(&Self::bitmap_path(&self.config), &words) {
            log::error!("periodic bitmap snapshot failed: {e}");
        }
    }

    /// Recompute parity for every position in `positions`, optionally
    /// partitioned across `parity_threads` worker threads. Returns the
    /// positions whose encode failed.
    fn drain_positions(&self, positions: &[u32]) -> Vec<u32> {
        let Some(parity) = &self.parity else {
            return Vec::new();
        };
        let nthreads = self.config.parity_threads.max(1) as usize;
        let block_count = parity.data_drives() + parity.parity_levels();

        if nthreads <= 1 || positions.len() < 2 {
            let state = self.state.read().unwrap();
            let mut scratch = Scratch::new(block_count, parity.block_size());
            return positions
                .iter()
                .filter_map(|&pos| match parity.encode(&state, pos, &mut scratch) {
                    Ok(()) => None,
                    Err(e) => {
                        log::error!("encode failed at pos {pos}: {e}");
                        Some(pos)
                    }
                })
                .collect();
        }

        let chunks: Vec<&[u32]> = positions.chunks(positions.len().div_ceil(nthreads)).collect();
        let mut failed = Vec::new();
        let state = self.state.read().unwrap();
        let state_ref = &*state;
        std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for chunk in &chunks[1..] {
                let chunk = *chunk;
                handles.push(scope.spawn(move || {
                    let mut scratch = Scratch::new(block_count, parity.block_size());
                    let mut local_failed = Vec::new();
                    for &pos in chunk {
                        if let Err(e) = parity.encode(state_ref, pos, &mut scratch) {
                            log::error!("encode failed at pos {pos}: {e}");
                            local_failed.push(pos);
                        }
                    }
                    local_failed
                }));
            }

            if let Some(main_chunk) = chunks.first() {
                let mut scratch = Scratch::new(block_count, parity.block_size());
                for &pos in *main_chunk {
                    if let Err(e) = parity.encode(state_ref, pos, &mut scratch) {
                        log::error!("encode failed at pos {pos}: {e}");
                        failed.push(pos);
                    }
                }
            }
            for h in handles {
                match h.join() {
                    Ok(mut v) => failed.append(&mut v),
                    Err(_) => log::error!("parity worker thread panicked; its positions are dropped from this drain"),
                }
            }
        });
        failed
    }

    pub fn run_scrub(&self, repair: bool) -> Option<crate::parity::ScrubReport> {
        let parity = self.parity.as_ref()?;
        let state = self.state.read().unwrap();
        let report = parity.scrub(&state, repair);
        log::info!(
            "scrub{}: checked={} mismatches={} fixed={} errors={}",
            if repair { " (repair)" } else { "" },
            report.positions_checked,
            report.parity_mismatches,
            report.parity_fixed,
            report.read_errors
        );
        Some(report)
    }
}
