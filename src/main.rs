// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Sentinel NVR — RTSP ingest to segmented MP4 and live HLS.
//!
//! Usage:
//!   sentinel-nvr run    --config config.toml
//!   sentinel-nvr status --config config.toml
//!   sentinel-nvr list   --config config.toml --stream cam1

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sentinel_nvr::api;
use sentinel_nvr::config::{Config, TriggerType};
use sentinel_nvr::events::JsonlEventSink;
use sentinel_nvr::hls::writer::GstTsEncoderFactory;
use sentinel_nvr::ingest::rtsp::GstSourceFactory;
use sentinel_nvr::manager::StreamManager;
use sentinel_nvr::mp4::writer::GstMuxerFactory;
use sentinel_nvr::shutdown::ShutdownCoordinator;
use sentinel_nvr::storage::paths::StorageLayout;
use sentinel_nvr::storage::{recordings, usage};

#[derive(Parser)]
#[command(name = "sentinel-nvr", about = "Network Video Recorder", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start recording all scheduled streams and serve the API.
    Run {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Print a brief status snapshot and exit.
    Status {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// List finished recordings for a stream.
    List {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Stream name to list recordings for.
        #[arg(long)]
        stream: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => {
            run(config).await;
        }
        Command::Status { config } => {
            run_status(config);
        }
        Command::List { config, stream } => {
            run_list(config, &stream);
        }
    }
}

async fn run(config_path: PathBuf) {
    let cfg = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        streams = cfg.streams.len(),
        storage = ?cfg.storage.storage_path,
        record_mp4 = cfg.storage.record_mp4_directly,
        "Starting NVR"
    );

    let coordinator = ShutdownCoordinator::new();
    let layout = StorageLayout::from_config(&cfg.storage);
    let events = Arc::new(JsonlEventSink::new(layout.event_log_path()));

    let manager = match StreamManager::new(
        cfg.clone(),
        coordinator.clone(),
        Arc::new(GstSourceFactory),
        Arc::new(GstMuxerFactory),
        Arc::new(GstTsEncoderFactory),
        events,
        None,
    ) {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "Failed to start stream manager");
            std::process::exit(1);
        }
    };

    // Scheduled streams record from boot; motion/event streams wait for a
    // start_recording request.
    for stream in &cfg.streams {
        if stream.trigger != TriggerType::Scheduled {
            continue;
        }
        if let Err(e) = manager.start(&stream.name) {
            error!(stream = stream.name, error = %e, "Failed to start stream");
        }
    }

    if cfg.api.enabled {
        let state = Arc::new(api::AppState { manager: manager.clone() });
        let port = cfg.api.port;
        tokio::spawn(async move {
            api::start_server(state, port).await;
        });
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Received CTRL+C, shutting down…");
        }
        Err(e) => {
            error!(error = %e, "Signal error");
        }
    }

    let manager_for_shutdown = manager.clone();
    let _ = tokio::task::spawn_blocking(move || manager_for_shutdown.shutdown()).await;
}

fn run_status(config_path: PathBuf) {
    let cfg = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            std::process::exit(1);
        }
    };

    let layout = StorageLayout::from_config(&cfg.storage);
    let report = usage::scan(layout.mp4_base()).unwrap_or_default();
    let hls_report = usage::scan(layout.hls_base()).unwrap_or_default();

    println!("=== NVR Status ===");
    println!("Storage root : {}", layout.root().display());
    println!(
        "Recordings   : {} files, {:.1} MB",
        report.mp4_count,
        report.total_bytes as f64 / 1_048_576.0
    );
    println!(
        "HLS output   : {} files, {:.1} MB",
        hls_report.file_count,
        hls_report.total_bytes as f64 / 1_048_576.0
    );
    println!("Streams      : {}", cfg.streams.len());
    for stream in &cfg.streams {
        let dir = layout.stream_mp4_dir(&stream.name);
        let count = recordings::list_recordings(&dir).map(|r| r.len()).unwrap_or(0);
        println!(
            "  {} ({:?}): {} — {} recordings",
            stream.name, stream.trigger, stream.url, count
        );
    }
}

fn run_list(config_path: PathBuf, stream: &str) {
    let cfg = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            std::process::exit(1);
        }
    };

    let layout = StorageLayout::from_config(&cfg.storage);
    let dir = layout.stream_mp4_dir(stream);
    let list = match recordings::list_recordings(&dir) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    if list.is_empty() {
        println!("No recordings found for stream '{}'", stream);
        return;
    }

    println!("=== Recordings for stream '{}' ===", stream);
    println!("{:<40} {:<20} {:<12}", "File", "Started", "Size");
    println!("{}", "-".repeat(74));
    for rec in &list {
        println!(
            "{:<40} {:<20} {} KB",
            rec.file_name,
            rec.started_at.format("%Y-%m-%d %H:%M:%S"),
            rec.size_bytes / 1024,
        );
    }
    println!("\nTotal: {} recordings", list.len());
}
