//! Hyprland event listener
//!
//! Subscribes to Hyprland's event socket (`.socket2.sock`), parses the
//! `event>>args` line protocol, and turns matching events into haptic
//! triggers via the configured event mapping. Some Hyprland events repeat
//! with identical payloads (focus churn); those are deduplicated so the
//! mouse does not buzz on every refocus of the same window.
//!
//! SPDX-License-Identifier: GPL-3.0

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{sleep, Duration};

use crate::config::{runtime_dir, SharedConfig};
use crate::dispatch::{EffectSink, HapticDispatcher};
use crate::device::Device;

/// Delay before retrying when the Hyprland socket is absent or unreachable
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Delay before reconnecting after a dropped connection
const SHORT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Events whose consecutive identical payloads are suppressed
const DEDUP_EVENTS: &[&str] = &["workspace", "activewindow", "focusedmon", "activewindowv2"];

/// Listener task connecting Hyprland events to the haptic dispatcher
pub struct HyprlandListener<S: EffectSink = Device> {
    dispatcher: Arc<HapticDispatcher<S>>,
    config: SharedConfig,
    /// Last seen args per deduplicated event name
    event_cache: HashMap<String, String>,
}

impl<S: EffectSink> HyprlandListener<S> {
    /// Create a listener for the given dispatcher and shared config
    pub fn new(dispatcher: Arc<HapticDispatcher<S>>, config: SharedConfig) -> Self {
        Self {
            dispatcher,
            config,
            event_cache: HashMap::new(),
        }
    }

    /// Path of the Hyprland event socket for the current session
    fn socket_path() -> Option<PathBuf> {
        let signature = std::env::var("HYPRLAND_INSTANCE_SIGNATURE").ok()?;
        Some(runtime_dir().join("hypr").join(signature).join(".socket2.sock"))
    }

    /// Connect-and-read loop. Reconnects forever; never returns.
    pub async fn run(mut self) {
        loop {
            let socket_path = match Self::socket_path() {
                Some(path) => path,
                None => {
                    tracing::error!("HYPRLAND_INSTANCE_SIGNATURE not set, is Hyprland running?");
                    sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };

            let stream = match UnixStream::connect(&socket_path).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(
                        path = %socket_path.display(),
                        error = %e,
                        "Hyprland socket unreachable, retrying..."
                    );
                    sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };

            tracing::info!(path = %socket_path.display(), "Listening for Hyprland events");

            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => self.process_event(&line),
                    Ok(None) => {
                        tracing::warn!("Hyprland connection closed, reconnecting...");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Hyprland socket read error");
                        break;
                    }
                }
            }

            sleep(SHORT_RECONNECT_DELAY).await;
        }
    }

    /// Handle one raw event line: dedup, config lookup, trigger.
    fn process_event(&mut self, raw_line: &str) {
        let (event, args) = match parse_event_line(raw_line) {
            Some(parts) => parts,
            None => return,
        };

        if DEDUP_EVENTS.contains(&event) {
            if self.event_cache.get(event).map(String::as_str) == Some(args) {
                return;
            }
            self.event_cache.insert(event.to_string(), args.to_string());
        }

        let effect = self.config.read().unwrap().get_effect(event, args);
        if let Some(effect_id) = effect {
            tracing::debug!(event, args, effect_id, "Desktop event mapped to haptic effect");
            self.dispatcher.trigger(effect_id);
        }
    }
}

/// Split a raw `event>>args` line. Lines without the separator are noise.
fn parse_event_line(raw_line: &str) -> Option<(&str, &str)> {
    let separator = raw_line.find(">>")?;
    Some((&raw_line[..separator], &raw_line[separator + 2..]))
}
