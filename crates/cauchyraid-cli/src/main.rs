mod binding;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use cauchyraid::{Config, Core};

#[derive(Debug, Parser)]
#[command(name = "cauchyraid", version, about = "Mount and administer a cauchyraid pool")]
struct Arguments {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Mount a pool and serve it until interrupted.
    Run {
        #[arg(short, long, value_name = "CONFIG")]
        config: PathBuf,
        mountpoint: PathBuf,
        /// Run in the foreground instead of detaching.
        #[arg(short, long)]
        foreground: bool,
        /// Auto-unmount on process exit.
        #[arg(long)]
        auto_unmount: bool,
    },
    /// Rebuild a replaced drive's contents from parity.
    Rebuild {
        #[arg(short, long, value_name = "CONFIG")]
        config: PathBuf,
        #[arg(short, long, value_name = "DRIVE_NAME")]
        drive: String,
    },
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .with_target(false)
        .init();
    tracing_log::LogTracer::init().expect("LogTracer can only be installed once");
}

static SCRUB_REQUESTED: AtomicBool = AtomicBool::new(false);
static REPAIR_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Register SIGUSR1 (scrub) / SIGUSR2 (repair) handlers that only flip an
/// atomic flag; the watcher thread spawned alongside does the actual work
/// on its own stack, never inside the signal handler.
fn install_signal_handlers(core: Arc<Core>) -> std::io::Result<()> {
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGUSR1, || {
            SCRUB_REQUESTED.store(true, Ordering::SeqCst);
        })?;
        signal_hook::low_level::register(signal_hook::consts::SIGUSR2, || {
            REPAIR_REQUESTED.store(true, Ordering::SeqCst);
        })?;
    }

    std::thread::spawn(move || loop {
        std::thread::sleep(std::time::Duration::from_millis(500));
        if SCRUB_REQUESTED.swap(false, Ordering::SeqCst) {
            core.journal.request_scrub();
        }
        if REPAIR_REQUESTED.swap(false, Ordering::SeqCst) {
            core.journal.request_repair();
        }
    });
    Ok(())
}

fn run(config_path: PathBuf, mountpoint: PathBuf, foreground: bool, auto_unmount: bool) -> anyhow::Result<()> {
    let mut config = Config::load(&config_path)?;
    config.mountpoint = mountpoint.clone();

    let core = Core::mount(config)?;

    if let Err(e) = install_signal_handlers(Arc::clone(&core)) {
        log::warn!("failed to install signal handlers: {e}");
    }

    // `mount2` always blocks the calling thread; `--foreground` only
    // controls whether the low-level fuse channel logs each request, since
    // this binary has no daemonizing path of its own.
    let mut options = vec![fuser::MountOption::FSName("cauchyraid".to_string())];
    if auto_unmount {
        options.push(fuser::MountOption::AutoUnmount);
    }
    if foreground {
        options.push(fuser::MountOption::Debug);
    }

    let fs = binding::CauchyRaidFs::new(Arc::clone(&core));
    log::info!("mounting at '{}'", mountpoint.display());
    let result = fuser::mount2(fs, &mountpoint, &options);
    core.unmount();
    result.map_err(anyhow::Error::from)
}

fn rebuild(config_path: PathBuf, drive: String) -> anyhow::Result<bool> {
    let config = Config::load(&config_path)?;
    let summary = cauchyraid::control::rebuild(&config, &drive)?;
    log::info!("rebuild of '{drive}' done: rebuilt={} failed={} skipped={}", summary.rebuilt, summary.failed, summary.skipped);
    Ok(summary.failed == 0)
}

fn main() -> ExitCode {
    init_logging();
    let args = Arguments::parse();

    let result = match args.command {
        Command::Run { config, mountpoint, foreground, auto_unmount } => run(config, mountpoint, foreground, auto_unmount).map(|_| true),
        Command::Rebuild { config, drive } => rebuild(config, drive),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
