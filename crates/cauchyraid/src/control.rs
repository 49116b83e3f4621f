//! Live rebuild / scrub control protocol (§4.7): a local Unix-domain-socket
//! server accepting one newline-terminated text command per connection, plus
//! the client-side helper used by the `rebuild` CLI subcommand (live first,
//! falling back to an offline reconstruction when no listener answers).

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::Config;
use crate::core::Core;
use crate::error::{Error, Result};
use crate::fsops::set_unix_mode;
use crate::parity::ParityEngine;
use crate::state::{DriveHandle, FileRecord, State};
use crate::{alloc::PositionAllocator, codec};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RebuildSummary {
    pub rebuilt: u32,
    pub failed: u32,
    pub skipped: u32,
}

/// Bind the control socket (removing any stale file first) and run the
/// accept loop on a dedicated thread. Each connection is handled
/// synchronously before accepting the next.
pub fn spawn_server(core: Arc<Core>, ctrl_path: &Path) -> std::io::Result<JoinHandle<()>> {
    if ctrl_path.exists() {
        std::fs::remove_file(ctrl_path)?;
    }
    let listener = UnixListener::bind(ctrl_path)?;
    log::info!("control socket listening at '{}'", ctrl_path.display());

    Ok(std::thread::spawn(move || {
        for conn in listener.incoming() {
            match conn {
                Ok(stream) => {
                    if let Err(e) = handle_connection(&core, stream) {
                        log::warn!("control connection error: {e}");
                    }
                }
                Err(e) => {
                    use std::io::ErrorKind::*;
                    if matches!(e.kind(), InvalidInput | NotConnected | Other) {
                        log::info!("control accept loop stopping: {e}");
                        break;
                    }
                    log::warn!("control accept error: {e}");
                }
            }
        }
    }))
}

fn handle_connection(core: &Core, stream: UnixStream) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let mut out = stream;

    let line = line.trim();
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("rebuild") => match parts.next() {
            Some(drive_name) => do_rebuild(core, drive_name, &mut out)?,
            None => writeln!(out, "error rebuild requires a drive name")?,
        },
        Some("scrub") => {
            let repair = parts.next() == Some("repair");
            match core.run_scrub(repair) {
                Some(report) if repair => writeln!(
                    out,
                    "done {} {} fixed={} errors={}",
                    report.positions_checked, report.parity_mismatches, report.parity_fixed, report.read_errors
                )?,
                Some(report) => writeln!(out, "done {} {} errors={}", report.positions_checked, report.parity_mismatches, report.read_errors)?,
                None => writeln!(out, "error no parity configured")?,
            }
        }
        Some(other) => writeln!(out, "error unknown command '{other}'")?,
        None => writeln!(out, "error empty command")?,
    }
    Ok(())
}

fn do_rebuild(core: &Core, drive_name: &str, out: &mut dyn Write) -> std::io::Result<()> {
    let Some(parity) = core.parity.as_ref() else {
        return writeln!(out, "error no parity configured");
    };

    let drive = {
        let state = core.state.read().unwrap();
        state.drives.iter().position(|d| d.name == drive_name)
    };
    let Some(drive) = drive else {
        return writeln!(out, "error unknown drive '{drive_name}'");
    };

    let vpaths: Vec<String> = {
        let state = core.state.read().unwrap();
        state.files.values().filter(|f| f.drive == drive).map(|f| f.vpath.clone()).collect()
    };
    let total = vpaths.len();
    let mut summary = RebuildSummary::default();

    for (i, vpath) in vpaths.iter().enumerate() {
        let snapshot = {
            let state = core.state.read().unwrap();
            state.find_file(vpath).cloned()
        };
        let Some(file) = snapshot else { continue };
        if file.open_count != 0 {
            writeln!(out, "skip {vpath} busy")?;
            summary.skipped += 1;
            continue;
        }
        let result = {
            let state = core.state.read().unwrap();
            reconstruct_one_file(&state, parity, &file)
        };
        match result {
            Ok(()) => {
                writeln!(out, "progress {} {total} {vpath}", i + 1)?;
                summary.rebuilt += 1;
            }
            Err(e) => {
                writeln!(out, "fail {vpath} {e}")?;
                summary.failed += 1;
            }
        }
    }
    writeln!(out, "done {} {} skipped={}", summary.rebuilt, summary.failed, summary.skipped)
}

fn reconstruct_one_file(state: &State, parity: &ParityEngine, file: &FileRecord) -> Result<()> {
    let real_path = state.real_path(file.drive, &file.vpath);
    if let Some(parent) = real_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let mut out_file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&real_path)
        .map_err(|source| Error::WriteError { path: real_path.clone(), source })?;

    for b in 0..file.blocks {
        let pos = file.pos_start + b;
        let block = parity.recover_block(state, file.drive, pos)?;
        let remaining = file.size.saturating_sub(b as u64 * state.block_size as u64);
        let want = (remaining as usize).min(state.block_size as usize);
        out_file
            .write_all(&block[..want])
            .map_err(|source| Error::WriteError { path: real_path.clone(), source })?;
    }
    out_file.set_len(file.size).map_err(|source| Error::WriteError { path: real_path.clone(), source })?;
    set_unix_mode(&real_path, file.mode);
    restore_ownership_and_mtime(&real_path, file)?;
    log::info!("rebuilt '{}' on drive {}", file.vpath, file.drive);
    Ok(())
}

/// Restore `uid`/`gid`/`mtime` on a freshly-reconstructed backing file,
/// matching the original rebuild tool's `chmod` + `lchown` + `utimensat`
/// sequence so a rebuilt file doesn't end up owned by the mounting process
/// with the reconstruction time as its mtime.
#[cfg(unix)]
fn restore_ownership_and_mtime(real_path: &std::path::Path, file: &FileRecord) -> Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(real_path.as_os_str().as_bytes())
        .map_err(|_| Error::Invalid(format!("path '{}' contains NUL", real_path.display())))?;

    let rc = unsafe { libc::lchown(c_path.as_ptr(), file.uid, file.gid) };
    if rc != 0 {
        return Err(Error::WriteError { path: real_path.to_path_buf(), source: std::io::Error::last_os_error() });
    }

    let times = [
        libc::timespec { tv_sec: file.mtime_s as libc::time_t, tv_nsec: libc::UTIME_OMIT as _ },
        libc::timespec { tv_sec: file.mtime_s as libc::time_t, tv_nsec: file.mtime_ns as _ },
    ];
    let rc = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0) };
    if rc != 0 {
        return Err(Error::WriteError { path: real_path.to_path_buf(), source: std::io::Error::last_os_error() });
    }
    Ok(())
}

#[cfg(not(unix))]
fn restore_ownership_and_mtime(_real_path: &std::path::Path, _file: &FileRecord) -> Result<()> {
    Ok(())
}

/// Attempt a live rebuild via the control socket; on no listener, fall back
/// to an offline reconstruction directly against the content file.
pub fn rebuild(config: &Config, drive_name: &str) -> Result<RebuildSummary> {
    let ctrl_path = Core::ctrl_path(config);
    match UnixStream::connect(&ctrl_path) {
        Ok(stream) => rebuild_live(stream, drive_name),
        Err(e) => {
            log::warn!("no live control listener at '{}' ({e}); falling back to offline rebuild", ctrl_path.display());
            rebuild_offline(config, drive_name)
        }
    }
}

fn rebuild_live(mut stream: UnixStream, drive_name: &str) -> Result<RebuildSummary> {
    writeln!(stream, "rebuild {drive_name}").map_err(Error::Io)?;
    let reader = BufReader::new(stream);
    let mut summary = RebuildSummary::default();
    for line in reader.lines() {
        let line = line.map_err(Error::Io)?;
        if let Some(rest) = line.strip_prefix("progress ") {
            log::info!("rebuild: {rest}");
        } else if let Some(rest) = line.strip_prefix("skip ") {
            log::warn!("rebuild: skip {rest}");
            summary.skipped += 1;
        } else if let Some(rest) = line.strip_prefix("fail ") {
            log::error!("rebuild: fail {rest}");
            summary.failed += 1;
        } else if let Some(rest) = line.strip_prefix("done ") {
            return parse_done_line(rest).or(Ok(summary));
        } else if let Some(rest) = line.strip_prefix("error ") {
            return Err(Error::Invalid(rest.to_string()));
        }
    }
    Ok(summary)
}

fn parse_done_line(rest: &str) -> Result<RebuildSummary> {
    // "<rebuilt> <failed> skipped=<n>"
    let mut fields = rest.split_whitespace();
    let rebuilt: u32 = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let failed: u32 = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let skipped: u32 = fields
        .next()
        .and_then(|s| s.strip_prefix("skipped="))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    Ok(RebuildSummary { rebuilt, failed, skipped })
}

/// Reconstruct a drive's files with no locking and no live core, loading
/// state straight from the content file. Used when no control-channel
/// listener can be reached (the pool is unmounted or unreachable).
fn rebuild_offline(config: &Config, drive_name: &str) -> Result<RebuildSummary> {
    let drives = config
        .drives
        .iter()
        .map(|d| DriveHandle { name: d.name.clone(), dir: d.dir.clone(), alloc: PositionAllocator::new() })
        .collect();
    let mut state = State::new(drives, config.block_size, config.placement);
    codec::load(&mut state, &config.content_paths)?;

    if config.parity_levels() == 0 {
        return Err(Error::ParityUnavailable);
    }
    let parity = ParityEngine::open(state.drive_count(), &config.parity_paths, config.block_size as usize)?;

    let drive = state
        .drives
        .iter()
        .position(|d| d.name == drive_name)
        .ok_or_else(|| Error::NotFound(drive_name.to_string()))?;

    let files: Vec<FileRecord> = state.files.values().filter(|f| f.drive == drive).cloned().collect();
    let mut summary = RebuildSummary::default();
    for file in &files {
        match reconstruct_one_file(&state, &parity, file) {
            Ok(()) => summary.rebuilt += 1,
            Err(e) => {
                log::error!("offline rebuild: {} failed: {e}", file.vpath);
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}
