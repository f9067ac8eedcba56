//! mx4hapticd Library
//!
//! Public API for testing and integration.

pub mod config;
pub mod device;
pub mod dispatch;
pub mod ipc;
pub mod listener;

/// Re-export commonly used types
pub use config::{
    load_shared_config, new_shared_config, AppConfig, ConfigError, SharedConfig, APP_NAME,
};
pub use device::{ConnectionType, Device, DeviceError, EFFECT_MAX, EFFECT_MIN, LOGITECH_VENDOR_ID};
pub use dispatch::{EffectSink, HapticDispatcher, MAX_QUEUE_SIZE};
pub use ipc::{default_socket_path, IpcError, IpcServer};
pub use listener::HyprlandListener;
