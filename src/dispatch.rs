//! Serialized haptic dispatch queue
//!
//! All device writes funnel through a single background worker thread
//! draining a bounded FIFO. Any number of producer threads (the Hyprland
//! listener, the IPC server) enqueue effect IDs without ever blocking;
//! the worker is the only code that touches the device after `start()`,
//! so transport I/O itself needs no locking discipline beyond the queue.
//!
//! Device I/O is blocking (the Bolt ack read waits up to 100 ms), which is
//! why this runs on a dedicated OS thread rather than the tokio executor.
//!
//! SPDX-License-Identifier: GPL-3.0

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::device::{Device, DeviceError, EFFECT_MAX};

/// Maximum number of pending effects before new triggers are dropped
pub const MAX_QUEUE_SIZE: usize = 10;

// ============================================================================
// Effect Sink
// ============================================================================

/// The dispatcher's view of a haptic device.
///
/// `Device` is the production implementation; tests substitute a recording
/// mock to exercise the retry policy without hardware.
pub trait EffectSink: Send {
    /// Transmit one effect through the currently bound transport
    fn send_effect(&mut self, effect_id: u8) -> Result<(), DeviceError>;
    /// Close and reopen the transport binding
    fn reopen(&mut self) -> Result<(), DeviceError>;
    /// Release the transport binding
    fn close(&mut self);
}

impl EffectSink for Device {
    fn send_effect(&mut self, effect_id: u8) -> Result<(), DeviceError> {
        Device::send_effect(self, effect_id)
    }

    fn reopen(&mut self) -> Result<(), DeviceError> {
        Device::close(self);
        self.open()
    }

    fn close(&mut self) {
        Device::close(self)
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Queue contents plus the stop request, under one mutex.
///
/// The stop flag lives inside the wait predicate so `stop()` cannot race a
/// lost wakeup against a worker that is already parked.
struct QueueState {
    pending: VecDeque<u8>,
    stop: bool,
}

struct Shared<S: EffectSink> {
    state: Mutex<QueueState>,
    wakeup: Condvar,
    sink: Mutex<S>,
}

/// Single-writer haptic dispatcher.
///
/// Owns the device for its whole lifetime. `trigger` is safe to call from
/// any thread and never blocks; effects are transmitted strictly in enqueue
/// order. A disconnect mid-send gets exactly one close/reopen/retry cycle,
/// after which the effect is dropped - the worker itself never dies on a
/// send failure.
pub struct HapticDispatcher<S: EffectSink = Device> {
    shared: Arc<Shared<S>>,
    /// Worker handle; its mutex also serializes start/stop transitions
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: EffectSink> HapticDispatcher<S> {
    /// Create a dispatcher owning the given device. The worker is not
    /// started yet; call [`start`](Self::start).
    pub fn new(sink: S) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    pending: VecDeque::with_capacity(MAX_QUEUE_SIZE),
                    stop: false,
                }),
                wakeup: Condvar::new(),
                sink: Mutex::new(sink),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Enqueue a haptic effect for transmission.
    ///
    /// Never blocks the caller. Out-of-range IDs are rejected here, before
    /// they ever reach the queue; a full queue drops the newest trigger
    /// (the already-accepted backlog keeps its latency ordering).
    pub fn trigger(&self, effect_id: u8) {
        if effect_id > EFFECT_MAX {
            tracing::warn!(effect_id, "Ignoring out-of-range effect id");
            return;
        }

        {
            let mut state = self.shared.state.lock().unwrap();
            if state.pending.len() >= MAX_QUEUE_SIZE {
                tracing::warn!(effect_id, "Haptic queue full, dropping event");
                return;
            }
            state.pending.push_back(effect_id);
        }

        self.shared.wakeup.notify_one();
    }

    /// Signal the worker to finish, join it, then close the device.
    ///
    /// Wakes a parked worker immediately; any backlog still queued is
    /// drained before the thread exits. Idempotent, and safe to race
    /// against `start` from another thread: the worker handle's mutex is
    /// held for the whole transition. When this returns the device handle
    /// is released.
    pub fn stop(&self) {
        let mut worker = self.worker.lock().unwrap();
        let handle = match worker.take() {
            Some(handle) => handle,
            None => return,
        };

        {
            let mut state = self.shared.state.lock().unwrap();
            state.stop = true;
        }
        self.shared.wakeup.notify_all();

        if handle.join().is_err() {
            tracing::error!("Haptic worker thread panicked");
        }

        self.shared.sink.lock().unwrap().close();
        tracing::info!("Haptic dispatcher stopped");
    }

    /// Snapshot of the pending queue, for assertions in unit tests
    #[cfg(test)]
    pub(crate) fn pending_for_test(&self) -> Vec<u8> {
        self.shared.state.lock().unwrap().pending.iter().copied().collect()
    }
}

impl<S: EffectSink + 'static> HapticDispatcher<S> {
    /// Spawn the single worker thread. Idempotent - a second `start` on a
    /// running dispatcher spawns nothing, and a `start` racing a `stop`
    /// from another thread serializes on the worker handle's mutex.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }

        {
            let mut state = self.shared.state.lock().unwrap();
            state.stop = false;
        }

        let shared = Arc::clone(&self.shared);
        *worker = Some(std::thread::spawn(move || worker_loop(&shared)));

        tracing::info!("Haptic dispatcher started");
    }
}

impl<S: EffectSink> Drop for HapticDispatcher<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker loop: park on the empty queue, drain one effect at a time.
fn worker_loop<S: EffectSink>(shared: &Shared<S>) {
    loop {
        let effect_id = {
            let mut state = shared.state.lock().unwrap();
            while state.pending.is_empty() && !state.stop {
                state = shared.wakeup.wait(state).unwrap();
            }
            if state.stop && state.pending.is_empty() {
                break;
            }
            state.pending.pop_front()
        };

        if let Some(effect_id) = effect_id {
            let mut sink = shared.sink.lock().unwrap();
            safe_send(&mut *sink, effect_id);
        }
    }
}

/// Send one effect, applying the disconnect recovery policy.
///
/// Disconnect: close, reopen, retry once, then give the effect up. The
/// effect is not requeued after a failed retry - a haptic pulse delivered
/// seconds late is worse than a missed one. Transient failures drop the
/// effect with no reopen, since the device is presumed still present.
fn safe_send<S: EffectSink>(sink: &mut S, effect_id: u8) {
    match sink.send_effect(effect_id) {
        Ok(()) => {
            tracing::trace!(effect_id, "Haptic effect sent");
        }
        Err(DeviceError::Disconnected(msg)) => {
            tracing::warn!(effect_id, error = %msg, "Device disconnected, attempting reconnect");
            sink.close();
            match sink.reopen() {
                Ok(()) => {
                    if let Err(e) = sink.send_effect(effect_id) {
                        tracing::error!(
                            effect_id,
                            error = %e,
                            "Retry after reconnect failed, dropping effect"
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(effect_id, error = %e, "Reconnect failed, dropping effect");
                }
            }
        }
        Err(e) => {
            tracing::error!(effect_id, error = %e, "Haptic send failed, dropping effect");
        }
    }
}

/// Recording mock sink shared by the dispatcher, listener, and IPC tests.
#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    #[derive(Default)]
    pub(crate) struct MockState {
        pub(crate) sent: Vec<u8>,
        pub(crate) reopens: usize,
        pub(crate) closes: usize,
        /// Errors returned by successive send_effect calls, in order
        pub(crate) send_failures: VecDeque<DeviceError>,
        pub(crate) reopen_fails: bool,
    }

    #[derive(Clone, Default)]
    pub(crate) struct MockSink(Arc<Mutex<MockState>>);

    impl MockSink {
        pub(crate) fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
            self.0.lock().unwrap()
        }
    }

    impl EffectSink for MockSink {
        fn send_effect(&mut self, effect_id: u8) -> Result<(), DeviceError> {
            let mut state = self.0.lock().unwrap();
            if let Some(err) = state.send_failures.pop_front() {
                return Err(err);
            }
            state.sent.push(effect_id);
            Ok(())
        }

        fn reopen(&mut self) -> Result<(), DeviceError> {
            let mut state = self.0.lock().unwrap();
            state.reopens += 1;
            if state.reopen_fails {
                Err(DeviceError::Disconnected("no device".to_string()))
            } else {
                Ok(())
            }
        }

        fn close(&mut self) {
            self.0.lock().unwrap().closes += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::MockSink;
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_fifo_order_and_drop_newest() {
        let mock = MockSink::default();
        let dispatcher = HapticDispatcher::new(mock.clone());

        // Worker not running yet: queue fills to capacity, 11 and 12 drop
        for id in 1..=12u8 {
            dispatcher.trigger(id);
        }

        dispatcher.start();
        dispatcher.stop(); // drains the backlog before joining

        let state = mock.state();
        assert_eq!(state.sent, (1..=10).collect::<Vec<u8>>());
    }

    #[test]
    fn test_end_to_end_single_effect() {
        let mock = MockSink::default();
        let dispatcher = HapticDispatcher::new(mock.clone());

        dispatcher.trigger(5);
        dispatcher.start();
        dispatcher.stop();

        let state = mock.state();
        assert_eq!(state.sent, vec![5]);
    }

    #[test]
    fn test_disconnect_triggers_one_reopen_and_retry() {
        let mock = MockSink::default();
        mock.state()
            .send_failures
            .push_back(DeviceError::Disconnected("unplugged".to_string()));

        let dispatcher = HapticDispatcher::new(mock.clone());
        dispatcher.trigger(7);
        dispatcher.start();
        dispatcher.stop();

        let state = mock.state();
        assert_eq!(state.reopens, 1);
        assert_eq!(state.sent, vec![7]); // retry succeeded
    }

    #[test]
    fn test_failed_retry_drops_effect_without_requeue() {
        let mock = MockSink::default();
        {
            let mut state = mock.state();
            state
                .send_failures
                .push_back(DeviceError::Disconnected("unplugged".to_string()));
            state
                .send_failures
                .push_back(DeviceError::Disconnected("still gone".to_string()));
        }

        let dispatcher = HapticDispatcher::new(mock.clone());
        dispatcher.trigger(4);
        dispatcher.start();
        dispatcher.stop();

        let state = mock.state();
        assert_eq!(state.reopens, 1); // exactly one cycle, no requeue
        assert!(state.sent.is_empty());
    }

    #[test]
    fn test_failed_reopen_drops_effect() {
        let mock = MockSink::default();
        {
            let mut state = mock.state();
            state
                .send_failures
                .push_back(DeviceError::Disconnected("unplugged".to_string()));
            state.reopen_fails = true;
        }

        let dispatcher = HapticDispatcher::new(mock.clone());
        dispatcher.trigger(3);
        dispatcher.start();
        dispatcher.stop();

        let state = mock.state();
        assert_eq!(state.reopens, 1);
        assert!(state.sent.is_empty());
    }

    #[test]
    fn test_transient_failure_causes_no_reopen() {
        let mock = MockSink::default();
        mock.state()
            .send_failures
            .push_back(DeviceError::Transport("ack timeout".to_string()));

        let dispatcher = HapticDispatcher::new(mock.clone());
        dispatcher.trigger(2);
        dispatcher.start();
        dispatcher.stop();

        let state = mock.state();
        assert_eq!(state.reopens, 0);
        assert!(state.sent.is_empty());
    }

    #[test]
    fn test_worker_survives_failures() {
        let mock = MockSink::default();
        mock.state()
            .send_failures
            .push_back(DeviceError::Transport("ack timeout".to_string()));

        let dispatcher = HapticDispatcher::new(mock.clone());
        dispatcher.trigger(1); // fails
        dispatcher.trigger(2); // must still go through
        dispatcher.start();
        dispatcher.stop();

        let state = mock.state();
        assert_eq!(state.sent, vec![2]);
    }

    #[test]
    fn test_stop_unblocks_parked_worker() {
        let mock = MockSink::default();
        let dispatcher = HapticDispatcher::new(mock.clone());

        dispatcher.start();
        // Give the worker time to park on the empty queue
        std::thread::sleep(Duration::from_millis(50));

        let begin = Instant::now();
        dispatcher.stop();
        assert!(begin.elapsed() < Duration::from_secs(1));

        // Device released synchronously before stop() returned
        assert!(mock.state().closes >= 1);
    }

    #[test]
    fn test_start_stop_idempotent() {
        let mock = MockSink::default();
        let dispatcher = HapticDispatcher::new(mock.clone());

        dispatcher.start();
        dispatcher.start(); // no second worker
        assert!(dispatcher.worker.lock().unwrap().is_some());

        dispatcher.stop();
        dispatcher.stop(); // no-op

        let closes = mock.state().closes;
        assert_eq!(closes, 1);
    }

    #[test]
    fn test_start_stop_race_from_multiple_threads() {
        let mock = MockSink::default();
        let dispatcher = Arc::new(HapticDispatcher::new(mock.clone()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let dispatcher = Arc::clone(&dispatcher);
            handles.push(std::thread::spawn(move || {
                for _ in 0..10 {
                    dispatcher.start();
                    dispatcher.stop();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Every start was matched by a stop; no worker left behind
        assert!(dispatcher.worker.lock().unwrap().is_none());

        // And the dispatcher still works afterwards
        dispatcher.trigger(6);
        dispatcher.start();
        dispatcher.stop();
        assert_eq!(mock.state().sent.last(), Some(&6));
    }

    #[test]
    fn test_restart_after_stop() {
        let mock = MockSink::default();
        let dispatcher = HapticDispatcher::new(mock.clone());

        dispatcher.start();
        dispatcher.stop();

        dispatcher.trigger(9);
        dispatcher.start();
        dispatcher.stop();

        assert_eq!(mock.state().sent, vec![9]);
    }

    #[test]
    fn test_out_of_range_id_never_enqueued() {
        let mock = MockSink::default();
        let dispatcher = HapticDispatcher::new(mock.clone());

        dispatcher.trigger(16);
        dispatcher.trigger(255);
        assert!(dispatcher.shared.state.lock().unwrap().pending.is_empty());

        dispatcher.start();
        dispatcher.stop();
        assert!(mock.state().sent.is_empty());
    }

    #[test]
    fn test_concurrent_triggers() {
        let mock = MockSink::default();
        let dispatcher = Arc::new(HapticDispatcher::new(mock.clone()));
        dispatcher.start();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let dispatcher = Arc::clone(&dispatcher);
            handles.push(std::thread::spawn(move || {
                for _ in 0..5 {
                    dispatcher.trigger(1);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        dispatcher.stop();

        // Drops are allowed under burst, but nothing invalid ever sends
        let state = mock.state();
        assert!(state.sent.len() <= 20);
        assert!(state.sent.iter().all(|&id| id == 1));
    }
}
