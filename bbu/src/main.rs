//! Baseband Unit Main Application
//!
//! Entry point for the massive-MIMO baseband processor: parses the
//! command line, loads and validates the JSON configuration, starts the
//! runtime, and shuts it down cleanly on SIGINT/SIGTERM or once the
//! configured frame count has been processed.
//!
//! Exit codes: 0 normal, 1 configuration error, 2 runtime error.

use anyhow::Context;
use baseband::Runtime;
use clap::Parser;
use common::config::Config;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Massive-MIMO baseband processing unit
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: String,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
}

fn load_config(path: &str) -> anyhow::Result<Arc<Config>> {
    let json = std::fs::read_to_string(path).with_context(|| format!("cannot read {path}"))?;
    let cfg = Config::from_json_str(&json).with_context(|| format!("invalid config {path}"))?;
    Ok(Arc::new(cfg))
}

fn main() {
    let args = Args::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("loading configuration from {}", args.config);
    let cfg = match load_config(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    info!("cell configuration:");
    info!("  antennas: {}, users: {}", cfg.antennas, cfg.ues);
    info!(
        "  ofdm: {} subcarriers ({} data from {}), cp {}",
        cfg.ofdm_ca, cfg.ofdm_data_num, cfg.ofdm_data_start, cfg.cp_len
    );
    info!(
        "  frame \"{}\": {} pilot, {} uplink, {} downlink symbols",
        cfg.frame.template(),
        cfg.frame.num_pilot_symbols(),
        cfg.frame.num_ul_symbols(),
        cfg.frame.num_dl_symbols()
    );
    info!(
        "  modulation {:?}, ldpc bg{} z{}",
        cfg.modulation, cfg.ldpc.base_graph, cfg.ldpc.lifting_size
    );
    info!(
        "  window {} frames, {} workers ({}), {} rx threads",
        cfg.frame_window,
        cfg.worker_threads,
        if cfg.bigstation_mode { "big-station" } else { "dynamic" },
        cfg.rx_threads
    );

    install_signal_handlers();

    let runtime = match Runtime::start(cfg) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("startup failed: {e}");
            std::process::exit(2);
        }
    };
    info!("baseband unit running on {:?}", runtime.rx_addrs());

    // Drain the decoded-frame sink; a real deployment forwards this to
    // the MAC, here it only keeps the channel from backing up
    while runtime.is_running() && !SHUTDOWN.load(Ordering::Relaxed) {
        while runtime.decoded().try_recv().is_ok() {}
        std::thread::sleep(Duration::from_millis(10));
    }
    if SHUTDOWN.load(Ordering::Relaxed) {
        info!("received shutdown signal");
    }
    runtime.stop();

    match runtime.join() {
        Ok(summary) => {
            info!(
                "shutdown complete: {} frames retired, {} malformed packets, {} tx packets",
                summary.frames_retired, summary.malformed_packets, summary.tx_packets
            );
            info!("timestamps written to {}", summary.timestamp_file.display());
        }
        Err(e) => {
            error!("runtime error: {e}");
            std::process::exit(2);
        }
    }
}
