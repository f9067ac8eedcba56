//! mx4hapticd - Haptic feedback daemon for the Logitech MX Master 4
//!
//! Listens for Hyprland desktop events and manual IPC triggers, and plays
//! the mapped haptic effect on the mouse via the Bolt receiver or a direct
//! Bluetooth hidraw node.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use mx4hapticd::{
    config::{load_shared_config, new_shared_config, AppConfig},
    device::Device,
    dispatch::HapticDispatcher,
    ipc::{default_socket_path, IpcServer},
    listener::HyprlandListener,
};

/// mx4hapticd - Haptic feedback for the MX Master 4 on Hyprland
#[derive(Parser, Debug)]
#[command(name = "mx4hapticd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/mx4hapticd/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("mx4hapticd starting...");

    // Load shared configuration (reloadable via SIGHUP)
    let shared_config = match load_shared_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load config, using defaults: {}", e);
            new_shared_config()
        }
    };

    let (preferred, explicit_path) = {
        let config = shared_config.read().unwrap();
        (config.preferred_connection(), config.device_path.clone())
    };

    // Discovery failure is fatal at startup: without a mouse there is
    // nothing for this daemon to do.
    let device = match Device::find(preferred, explicit_path) {
        Some(device) => {
            info!(
                connection = %device.connection_type(),
                path = %device.path().display(),
                "MX Master 4 found"
            );
            device
        }
        None => {
            error!("MX Master 4 not found on any transport");
            std::process::exit(1);
        }
    };

    let dispatcher = Arc::new(HapticDispatcher::new(device));
    dispatcher.start();

    // Manual trigger socket
    let socket_path = default_socket_path();
    let ipc_server = IpcServer::new(Arc::clone(&dispatcher), socket_path.clone());
    let ipc_handle = tokio::spawn(async move {
        if let Err(e) = ipc_server.run().await {
            error!("IPC server failed: {}", e);
        }
    });

    // Hyprland event listener
    let listener = HyprlandListener::new(Arc::clone(&dispatcher), Arc::clone(&shared_config));
    let listener_handle = tokio::spawn(listener.run());

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    info!("mx4hapticd ready");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
                break;
            }
            _ = sighup.recv() => {
                match AppConfig::load_default(args.config.as_deref()) {
                    Ok(new_config) => {
                        *shared_config.write().unwrap() = new_config;
                        info!("Configuration reloaded");
                    }
                    Err(e) => {
                        warn!("Config reload failed, keeping previous config: {}", e);
                    }
                }
            }
        }
    }

    listener_handle.abort();
    ipc_handle.abort();

    // Joins the worker and releases the device before we return
    dispatcher.stop();
    std::fs::remove_file(&socket_path).ok();

    info!("mx4hapticd stopped");
    Ok(())
}
