//! MX Master 4 device abstraction: discovery, protocol encoding, transport I/O
//!
//! The mouse is reachable over two physically different channels:
//!
//! - **Bolt**: commands relayed through the Bolt receiver dongle, addressed
//!   with the HID++ feature-id protocol (blocking write + ack read).
//! - **Bluetooth**: commands written directly to the radio-paired hidraw
//!   node as fixed long reports, fire-and-forget.
//!
//! Discovery prefers Bolt (lower latency, richer addressing) and falls back
//! to Bluetooth. Device node paths are not stable across reconnects, so both
//! transports are located by enumeration, never by a fixed path.
//!
//! SPDX-License-Identifier: GPL-3.0

use std::ffi::CString;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use hidapi::HidApi;

// ============================================================================
// Constants
// ============================================================================

/// Logitech vendor ID
pub const LOGITECH_VENDOR_ID: u16 = 0x046D;

/// MX Master 4 product ID when paired over Bluetooth
pub const MX_MASTER_4_BLUETOOTH_PID: u16 = 0xB042;

/// Product name reported by the Bluetooth HID parent
pub const MX_MASTER_4_BLUETOOTH_NAME: &str = "MX Master 4";

/// Usage page of Logitech's proprietary HID++ protocol interface
pub const HIDPP_USAGE_PAGE: u16 = 0xFF00;

/// HID++ 2.0 feature ID for the MX Master 4 haptic motor
pub const HAPTIC_FEATURE: u16 = 0x0B4E;

/// HID++ long report size (both transports use 20-byte frames)
pub const HID_LONG_REPORT_SIZE: usize = 20;

/// Valid haptic effect ID range (0 = off)
pub const EFFECT_MIN: u8 = 0;
pub const EFFECT_MAX: u8 = 15;

/// HID++ report type markers
pub mod report_type {
    /// Short HID++ report selector
    pub const SHORT: u8 = 0x10;
    /// Long HID++ report selector
    pub const LONG: u8 = 0x11;
}

/// Timeout for draining the Bolt acknowledgement read (milliseconds)
const ACK_TIMEOUT_MS: i32 = 100;

// ============================================================================
// Connection Type
// ============================================================================

/// Transport the device was discovered on. Fixed for the life of a `Device`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    /// Via the Bolt receiver dongle (HID++ relay)
    Bolt,
    /// Direct Bluetooth hidraw node
    Bluetooth,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::Bolt => write!(f, "Bolt"),
            ConnectionType::Bluetooth => write!(f, "Bluetooth"),
        }
    }
}

// ============================================================================
// Binding
// ============================================================================

/// The device's open channel, if any.
///
/// Exactly one variant is live at a time; `Closed` is the only variant
/// holding no OS resource. The transport kind determines which non-Closed
/// variant is legal, so a mismatched binding is a programming error rather
/// than a runtime condition.
enum Binding {
    /// No open handle
    Closed,
    /// Exclusive hidapi handle to the Bolt receiver's HID++ interface
    Bolt(hidapi::HidDevice),
    /// Write-only non-blocking fd on the Bluetooth hidraw node
    Bluetooth(File),
}

// ============================================================================
// Device
// ============================================================================

/// A discovered MX Master 4 plus its (lazily opened) transport binding.
///
/// Constructed only by [`Device::find`]; the binding opens on first send
/// and closes on explicit `close`, on drop, or after a disconnect failure.
pub struct Device {
    connection_type: ConnectionType,
    path: PathBuf,
    /// Bolt multiplexing index (the dongle's per-paired-device slot)
    device_index: Option<i32>,
    binding: Binding,
}

impl Device {
    fn new(connection_type: ConnectionType, path: PathBuf, device_index: Option<i32>) -> Self {
        Self {
            connection_type,
            path,
            device_index,
            binding: Binding::Closed,
        }
    }

    /// Discover an MX Master 4 on either transport.
    ///
    /// Bolt is tried first unless `preferred` restricts discovery to
    /// Bluetooth; Bluetooth is the fallback. An `explicit_path` overrides
    /// the discovered hidraw node, Bluetooth only.
    ///
    /// Returns `None` when nothing is found - a caller-visible condition,
    /// not an error.
    pub fn find(
        preferred: Option<ConnectionType>,
        explicit_path: Option<PathBuf>,
    ) -> Option<Device> {
        let bolt = if preferred == Some(ConnectionType::Bluetooth) {
            None
        } else {
            Self::find_bolt_device()
        };

        // The sysfs scan only runs when it can still matter: Bolt has not
        // already won and no explicit path supersedes it.
        let bluetooth = if bolt.is_some()
            || explicit_path.is_some()
            || preferred == Some(ConnectionType::Bolt)
        {
            None
        } else {
            Self::find_bluetooth_path()
        };

        Self::select_device(bolt, bluetooth, preferred, explicit_path)
    }

    /// Pick the device from the discovered candidates.
    ///
    /// Bolt wins whenever it is allowed; the explicit path replaces only
    /// the discovered Bluetooth node, never the Bolt candidate.
    fn select_device(
        bolt: Option<Device>,
        bluetooth: Option<PathBuf>,
        preferred: Option<ConnectionType>,
        explicit_path: Option<PathBuf>,
    ) -> Option<Device> {
        if preferred != Some(ConnectionType::Bluetooth) {
            if let Some(device) = bolt {
                return Some(device);
            }
        }

        if preferred != Some(ConnectionType::Bolt) {
            let path = explicit_path.or(bluetooth);
            if let Some(path) = path {
                if path.exists() {
                    return Some(Device::new(ConnectionType::Bluetooth, path, None));
                }
                tracing::warn!(path = %path.display(), "Bluetooth device path does not exist");
            }
        }

        None
    }

    /// Enumerate HID devices and pick the Bolt receiver's HID++ interface.
    ///
    /// The first Logitech device whose usage page is the proprietary HID++
    /// page wins; its interface number becomes the multiplexing index.
    fn find_bolt_device() -> Option<Device> {
        let api = match HidApi::new() {
            Ok(api) => api,
            Err(e) => {
                tracing::debug!(error = %e, "hidapi initialization failed");
                return None;
            }
        };

        for info in api.device_list() {
            if info.vendor_id() != LOGITECH_VENDOR_ID {
                continue;
            }
            if info.usage_page() != HIDPP_USAGE_PAGE {
                continue;
            }

            let path = PathBuf::from(std::ffi::OsStr::from_bytes(info.path().to_bytes()));
            tracing::debug!(
                path = %path.display(),
                interface = info.interface_number(),
                "Found Bolt HID++ interface"
            );
            return Some(Device::new(
                ConnectionType::Bolt,
                path,
                Some(info.interface_number()),
            ));
        }

        None
    }

    /// Locate the Bluetooth hidraw node by scanning sysfs.
    ///
    /// Walks `/sys/class/hidraw/*/device/uevent` (the HID parent's uevent)
    /// and matches on the reported name, falling back to the HID_ID
    /// vendor/product string, confirmed by HID_ID or MODALIAS.
    fn find_bluetooth_path() -> Option<PathBuf> {
        let hidraw_dir = PathBuf::from("/sys/class/hidraw");
        if !hidraw_dir.exists() {
            tracing::debug!("/sys/class/hidraw not found");
            return None;
        }

        let entries = match std::fs::read_dir(&hidraw_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(error = %e, "Failed to read /sys/class/hidraw");
                return None;
            }
        };

        for entry in entries.flatten() {
            let syspath = entry.path();
            let uevent_path = syspath.join("device/uevent");

            let uevent = match std::fs::read_to_string(&uevent_path) {
                Ok(contents) => contents,
                Err(_) => continue,
            };

            if !uevent_matches_bluetooth(&uevent) {
                continue;
            }

            if let Some(name) = syspath.file_name() {
                let devnode = PathBuf::from("/dev").join(name);
                tracing::info!(path = %devnode.display(), "Found Bluetooth device");
                return Some(devnode);
            }
        }

        tracing::debug!("Bluetooth device not found in /sys/class/hidraw");
        None
    }

    /// Transport this device was discovered on
    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    /// Transport-specific device locator
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Whether a transport binding is currently open
    pub fn is_open(&self) -> bool {
        !matches!(self.binding, Binding::Closed)
    }

    /// Open the transport binding for this device's connection type.
    ///
    /// A no-op when already open. Either open failing is classified as
    /// `Disconnected` - the device node exists only while the mouse does.
    pub fn open(&mut self) -> Result<(), DeviceError> {
        if self.is_open() {
            return Ok(());
        }

        match self.connection_type {
            ConnectionType::Bolt => {
                let api = HidApi::new_without_enumerate().map_err(|e| {
                    DeviceError::Disconnected(format!("hidapi initialization failed: {}", e))
                })?;
                let cpath = CString::new(self.path.as_os_str().as_bytes()).map_err(|_| {
                    DeviceError::Disconnected("device path contains NUL byte".to_string())
                })?;
                let handle = api.open_path(&cpath).map_err(|e| {
                    DeviceError::Disconnected(format!("failed to open Bolt device: {}", e))
                })?;
                self.binding = Binding::Bolt(handle);
                tracing::info!(path = %self.path.display(), "Connected via Bolt");
            }
            ConnectionType::Bluetooth => {
                let file = OpenOptions::new()
                    .write(true)
                    .custom_flags(libc::O_NONBLOCK)
                    .open(&self.path)
                    .map_err(|e| {
                        DeviceError::Disconnected(format!(
                            "failed to open Bluetooth device {}: {}",
                            self.path.display(),
                            e
                        ))
                    })?;
                self.binding = Binding::Bluetooth(file);
                tracing::info!(path = %self.path.display(), "Connected via Bluetooth");
            }
        }

        Ok(())
    }

    /// Release the transport binding. Idempotent.
    pub fn close(&mut self) {
        self.binding = Binding::Closed;
    }

    /// Trigger a haptic effect on the device.
    ///
    /// Validates the effect ID before any transport I/O, opens the binding
    /// lazily, then transmits through the bound transport. A `Disconnected`
    /// failure leaves the binding closed so the next attempt reopens.
    pub fn send_effect(&mut self, effect_id: u8) -> Result<(), DeviceError> {
        if effect_id > EFFECT_MAX {
            return Err(DeviceError::InvalidEffect(effect_id));
        }

        if !self.is_open() {
            self.open()?;
        }

        let result = match self.connection_type {
            ConnectionType::Bolt => self.send_bolt_hidpp(HAPTIC_FEATURE, &[effect_id]),
            ConnectionType::Bluetooth => {
                let frame = encode_bluetooth_frame(effect_id);
                self.write_bluetooth(&frame)
            }
        };

        if matches!(result, Err(DeviceError::Disconnected(_))) {
            self.close();
        }

        result
    }

    /// Send a HID++ feature command through the Bolt receiver and drain the
    /// device's acknowledgement.
    fn send_bolt_hidpp(&mut self, feature_id: u16, args: &[u8]) -> Result<(), DeviceError> {
        let device_index = self.device_index.unwrap_or(0) as u8;
        let frame = encode_bolt_frame(device_index, feature_id, args);

        let handle = match &self.binding {
            Binding::Bolt(handle) => handle,
            _ => return Err(DeviceError::Disconnected("Bolt device is not open".to_string())),
        };

        handle
            .write(&frame)
            .map_err(|e| DeviceError::Disconnected(format!("HID write failed: {}", e)))?;

        let mut response = [0u8; HID_LONG_REPORT_SIZE];
        let read = handle
            .read_timeout(&mut response, ACK_TIMEOUT_MS)
            .map_err(|e| DeviceError::Disconnected(format!("HID read failed: {}", e)))?;

        if read == 0 {
            return Err(DeviceError::Transport(
                "acknowledgement read timed out".to_string(),
            ));
        }

        Ok(())
    }

    /// Fire-and-forget write of one frame to the Bluetooth hidraw node.
    ///
    /// ENODEV and EIO mean the mouse is gone; anything else (including a
    /// short write) is a transient transport failure.
    fn write_bluetooth(&mut self, frame: &[u8]) -> Result<(), DeviceError> {
        let file = match &mut self.binding {
            Binding::Bluetooth(file) => file,
            _ => {
                return Err(DeviceError::Disconnected(
                    "Bluetooth device is not open".to_string(),
                ))
            }
        };

        match file.write(frame) {
            Ok(written) if written == frame.len() => Ok(()),
            Ok(written) => Err(DeviceError::Transport(format!(
                "short write: {} of {} bytes",
                written,
                frame.len()
            ))),
            Err(e) => match e.raw_os_error() {
                Some(libc::ENODEV) | Some(libc::EIO) => {
                    Err(DeviceError::Disconnected(format!("device removed: {}", e)))
                }
                _ => Err(DeviceError::Transport(format!("write failed: {}", e))),
            },
        }
    }
}

// ============================================================================
// Frame Encoding
// ============================================================================

/// Build a 20-byte HID++ frame for the Bolt receiver.
///
/// Layout: byte0 = report selector (short when the payload fits 3 bytes,
/// long otherwise), byte1 = multiplexing index, bytes2-3 = big-endian
/// feature ID, payload from byte4, zero padded.
pub fn encode_bolt_frame(
    device_index: u8,
    feature_id: u16,
    args: &[u8],
) -> [u8; HID_LONG_REPORT_SIZE] {
    let mut frame = [0u8; HID_LONG_REPORT_SIZE];
    frame[0] = if args.len() <= 3 {
        report_type::SHORT
    } else {
        report_type::LONG
    };
    frame[1] = device_index;
    frame[2] = (feature_id >> 8) as u8;
    frame[3] = (feature_id & 0xFF) as u8;

    let len = args.len().min(HID_LONG_REPORT_SIZE - 4);
    frame[4..4 + len].copy_from_slice(&args[..len]);
    frame
}

/// Build a 20-byte long report for the direct Bluetooth channel.
///
/// Layout: `[0x11, 0xFF, 0x0B, 0x4E, effect_id, 0, ...]` - constant long
/// marker, broadcast index, the haptic feature's code bytes, then the
/// effect ID.
pub fn encode_bluetooth_frame(effect_id: u8) -> [u8; HID_LONG_REPORT_SIZE] {
    let mut frame = [0u8; HID_LONG_REPORT_SIZE];
    frame[0] = report_type::LONG;
    frame[1] = 0xFF;
    frame[2] = (HAPTIC_FEATURE >> 8) as u8;
    frame[3] = (HAPTIC_FEATURE & 0xFF) as u8;
    frame[4] = effect_id;
    frame
}

// ============================================================================
// Uevent Matching
// ============================================================================

/// Extract a `KEY=value` field from a uevent blob.
fn uevent_field<'a>(uevent: &'a str, key: &str) -> Option<&'a str> {
    uevent
        .lines()
        .find_map(|line| line.strip_prefix(key).and_then(|rest| rest.strip_prefix('=')))
}

/// Zero-padded bus/vendor/product pattern, e.g. `0005:0000046D:0000B042`
fn padded_id_pattern() -> String {
    format!(
        "0005:0000{:04X}:0000{:04X}",
        LOGITECH_VENDOR_ID, MX_MASTER_4_BLUETOOTH_PID
    )
}

/// Unpadded bus/vendor/product pattern, e.g. `0005:046D:B042`
fn unpadded_id_pattern() -> String {
    format!(
        "0005:{:04X}:{:04X}",
        LOGITECH_VENDOR_ID, MX_MASTER_4_BLUETOOTH_PID
    )
}

/// Decide whether a HID parent uevent describes the Bluetooth-paired mouse.
///
/// The name check accepts either the product name or - when the parent
/// exposes no name - a HID_ID containing both the vendor and product hex.
/// The match is then confirmed against HID_ID (padded or unpadded) or
/// MODALIAS, case-insensitively.
pub fn uevent_matches_bluetooth(uevent: &str) -> bool {
    let vid_hex = format!("{:04X}", LOGITECH_VENDOR_ID);
    let pid_hex = format!("{:04X}", MX_MASTER_4_BLUETOOTH_PID);

    let hid_id = uevent_field(uevent, "HID_ID").map(str::to_uppercase);
    let modalias = uevent_field(uevent, "MODALIAS").map(str::to_uppercase);

    let name_matches = match uevent_field(uevent, "HID_NAME") {
        Some(name) => name.contains(MX_MASTER_4_BLUETOOTH_NAME),
        None => false,
    };

    let id_names_device = hid_id
        .as_deref()
        .map(|id| id.contains(&vid_hex) && id.contains(&pid_hex))
        .unwrap_or(false);

    if !name_matches && !id_names_device {
        return false;
    }

    let padded = padded_id_pattern();
    let unpadded = unpadded_id_pattern();

    if let Some(id) = hid_id.as_deref() {
        if id.contains(&padded) || id.contains(&unpadded) {
            return true;
        }
    }

    if let Some(modalias) = modalias.as_deref() {
        if modalias.contains(&padded) {
            return true;
        }
    }

    false
}

// ============================================================================
// Error Types
// ============================================================================

/// Device error type
#[derive(Debug)]
pub enum DeviceError {
    /// Effect ID outside the valid 0-15 range (caller error, no I/O done)
    InvalidEffect(u8),
    /// No device discoverable on either transport
    NotFound,
    /// Open or transmit failed in a way that means the mouse is gone
    Disconnected(String),
    /// Transmission failed but the device is presumed still present
    Transport(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::InvalidEffect(id) => {
                write!(f, "effect id {} outside valid range {}-{}", id, EFFECT_MIN, EFFECT_MAX)
            }
            DeviceError::NotFound => write!(f, "MX Master 4 not found"),
            DeviceError::Disconnected(msg) => write!(f, "device disconnected: {}", msg),
            DeviceError::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for DeviceError {}
