//! selkies-stream - main entry point
//!
//! WebSocket remote-desktop streaming server for X11: striped H.264/JPEG
//! video and Opus audio out, input/clipboard/gamepad/microphone/file
//! transfers in, all over one data WebSocket per client.

mod args;
mod backpressure;
mod broadcaster;
mod capture;
mod clipboard;
mod config;
mod cursor;
mod gamepad;
mod input;
mod mic;
mod pipeline;
mod protocol;
mod session;
mod stats;
mod upload;
mod x11;

use args::Args;
use broadcaster::Broadcaster;
use capture::CaptureLibs;
use clap::Parser;
use clipboard::ClipboardSync;
use config::Config;
use gamepad::GamepadHub;
use log::{error, info, warn};
use session::StreamingCore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use x11::X11Input;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::new()
        .parse_filters(&format!("selkies_stream={},tungstenite=warn", log_level))
        .init();

    info!("selkies-stream v{} starting", env!("CARGO_PKG_VERSION"));

    let config = match Config::from_args(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {}", err);
            error!("Invalid configuration: {}", err);
            std::process::exit(1);
        }
    };
    info!(
        "Initial encoder: {}, framerate: {}, bitrate: {}kbps, port: {}",
        config.initial_encoder(),
        config.framerate.value,
        config.video_bitrate_kbps,
        config.port
    );
    info!(
        "File transfers: upload={}, download={}",
        config.allow_upload, config.allow_download
    );
    stats::log_host_summary();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to create runtime: {}", err);
            std::process::exit(1);
        }
    };
    if let Err(err) = runtime.block_on(run(config)) {
        eprintln!("Fatal error: {}", err);
        error!("Fatal error: {}", err);
        std::process::exit(1);
    }
    info!("selkies-stream stopped");
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let libs = CaptureLibs::probe();
    let broadcaster = Arc::new(Broadcaster::new());
    let clipboard_sync = Arc::new(ClipboardSync::new(config.enable_binary_clipboard.value));

    let x11 = match X11Input::connect() {
        Ok(input) => Some(Arc::new(input)),
        Err(err) => {
            warn!("Failed to connect to X display: {}", err);
            None
        }
    };

    let gamepads = Arc::new(
        GamepadHub::start(&config.js_socket_prefix)
            .await
            .map_err(|err| format!("Failed to start gamepad hub: {}", err))?,
    );

    let running = Arc::new(AtomicBool::new(true));

    // Cursor watcher on its own blocking thread; it owns an X connection.
    if let Some(x11_ref) = &x11 {
        let size_cap = (32.0 * x11_ref.system_dpi() / 96.0).round() as u32;
        let watcher_broadcaster = broadcaster.clone();
        let watcher_running = running.clone();
        tokio::task::spawn_blocking(move || {
            cursor::run_cursor_watcher(watcher_broadcaster, size_cap.max(1), watcher_running)
        });
    }

    if config.enable_clipboard {
        tokio::spawn(clipboard::run_clipboard_monitor(
            clipboard_sync.clone(),
            broadcaster.clone(),
            running.clone(),
        ));
    }

    let core = StreamingCore::new(
        config,
        libs,
        broadcaster,
        gamepads.clone(),
        clipboard_sync,
        x11,
    );

    tokio::select! {
        result = session::run_server(core.clone()) => {
            result.map_err(|err| format!("Cannot bind data WebSocket listener: {}", err))?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    running.store(false, Ordering::Relaxed);
    core.shutdown_pipelines().await;
    gamepads.shutdown().await;
    Ok(())
}
