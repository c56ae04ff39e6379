//! # mpu_relay entry point
//!
//! Opens the MPU-9250 IIO device, binds the relay port and serves clients until
//! SIGINT/SIGTERM.
//!
//! ## Shutdown
//! The signal handler only flips an atomic flag. A watcher thread turns it into
//! `ServerHandle::shutdown()`, and `SensorServer::run` then stops the broadcast
//! loop, the reader thread and the sockets in order.

use std::{
    path::PathBuf,
    process::ExitCode,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use clap::Parser;
use log::{error, info};

use mpu_relay::{
    sensor::{
        buffer::SensorBuffer,
        device::{DEFAULT_DEVICE_LINK, DEFAULT_SYSFS_ROOT, SysfsDevice},
        queue::DEFAULT_QUEUE_CAPACITY,
    },
    server::{SensorServer, ServerHandle},
    utils::{
        config::{BufferConfig, DEFAULT_HOST, DEFAULT_MAX_CLIENTS, DEFAULT_PORT, ServerConfig},
        error::Result,
        metrics::RelayMetrics,
    },
};

const SIGNAL_POLL: Duration = Duration::from_millis(200);

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(
    name = "mpu_relay",
    version,
    about = "Relay MPU-9250 IIO samples to TCP clients as JSON lines"
)]
struct Cli {
    /// Device symlink resolving to the IIO character node
    #[arg(long, default_value = DEFAULT_DEVICE_LINK)]
    device: PathBuf,

    /// Directory holding IIO device attribute trees
    #[arg(long, default_value = DEFAULT_SYSFS_ROOT)]
    sysfs_root: PathBuf,

    /// Address to listen on
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Connections beyond this are closed immediately
    #[arg(long, default_value_t = DEFAULT_MAX_CLIENTS)]
    max_clients: usize,

    /// Sample queue capacity (oldest samples are dropped when full)
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_size: usize,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

extern "C" fn on_signal(_signum: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int);
    // SAFETY: the handler only performs an atomic store, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

fn spawn_signal_watcher(handle: ServerHandle) {
    thread::spawn(move || {
        while handle.is_running() {
            if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
                info!("[Main] signal received, shutting down");
                handle.shutdown();
                break;
            }
            thread::sleep(SIGNAL_POLL);
        }
    });
}

fn run(cli: Cli) -> Result<()> {
    let metrics = RelayMetrics::shared();

    let device = SysfsDevice::from_symlink(&cli.device, &cli.sysfs_root)?;
    info!(
        "[Main] device {} (attributes in {})",
        device.char_dev().display(),
        device.attr_dir().display()
    );

    let buffer = SensorBuffer::new(
        device,
        BufferConfig {
            queue_capacity: cli.queue_size,
            ..BufferConfig::default()
        },
        metrics.clone(),
    );

    let server = SensorServer::bind(
        buffer,
        ServerConfig {
            host: cli.host,
            port: cli.port,
            max_clients: cli.max_clients,
            ..ServerConfig::default()
        },
        metrics,
    )?;

    install_signal_handlers();
    spawn_signal_watcher(server.handle());
    server.run()
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    info!("=== MPU RELAY START ===");
    match run(cli) {
        Ok(()) => {
            info!("=== MPU RELAY STOPPED ===");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("[Main] {}", e);
            ExitCode::FAILURE
        }
    }
}
