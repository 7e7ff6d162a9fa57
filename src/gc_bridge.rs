//! Collection notification plumbing between the host heap and the
//! engine.
//!
//! A background monitor thread periodically drains every subscribed
//! instance's identity table for collected handles and forwards them to
//! the engine. An optional memory watcher samples a [`MemoryProbe`] and
//! requests full sweeps under memory pressure. Both threads stop on
//! their own once the last instance unsubscribes and restart with the
//! next subscription.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::BridgeConfig;
use crate::instance::{EngineInstance, InstanceId};

/// Source of process heap statistics for the memory watcher.
pub trait MemoryProbe: Send + Sync {
    /// Upper bound the heap may grow to, in bytes.
    fn max_bytes(&self) -> u64;
    /// Bytes currently committed to the heap.
    fn total_bytes(&self) -> u64;
    /// Committed bytes not currently in use.
    fn free_bytes(&self) -> u64;
}

struct GcState {
    subscribers: HashMap<InstanceId, Arc<EngineInstance>>,
    monitor_running: bool,
    watcher_running: bool,
}

/// Fan-out point for collection notifications.
pub struct GcBridge {
    state: Mutex<GcState>,
    gc_interval: Duration,
    memory_check_interval: Option<Duration>,
    free_memory_ratio: f64,
    probe: Option<Arc<dyn MemoryProbe>>,
}

impl GcBridge {
    pub(crate) fn new(config: &BridgeConfig, probe: Option<Arc<dyn MemoryProbe>>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GcState {
                subscribers: HashMap::new(),
                monitor_running: false,
                watcher_running: false,
            }),
            gc_interval: config.gc_interval,
            memory_check_interval: config.memory_check_interval,
            free_memory_ratio: config.free_memory_ratio,
            probe,
        })
    }

    /// Start delivering collection notifications for `instance`,
    /// spawning the background threads if they are not running.
    pub fn subscribe(self: &Arc<Self>, instance: Arc<EngineInstance>) {
        let mut state = self.state.lock().unwrap();
        state.subscribers.insert(instance.id(), instance);

        if !state.monitor_running {
            state.monitor_running = true;
            let gc = Arc::clone(self);
            std::thread::Builder::new()
                .name("hostbridge-gc".to_string())
                .spawn(move || gc.monitor_loop())
                .expect("failed to spawn gc monitor thread");
        }

        if let (Some(interval), Some(probe)) = (self.memory_check_interval, self.probe.as_ref()) {
            if !state.watcher_running {
                state.watcher_running = true;
                let gc = Arc::clone(self);
                let probe = Arc::clone(probe);
                std::thread::Builder::new()
                    .name("hostbridge-memwatch".to_string())
                    .spawn(move || gc.watcher_loop(interval, probe))
                    .expect("failed to spawn memory watcher thread");
            }
        }
    }

    pub fn unsubscribe(&self, instance: InstanceId) {
        self.state.lock().unwrap().subscribers.remove(&instance);
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().unwrap().subscribers.len()
    }

    fn monitor_loop(&self) {
        log::debug!("gc monitor started");
        let mut guard = RunningFlagGuard {
            gc: self,
            thread: GcThread::Monitor,
            armed: true,
        };
        loop {
            let Some(subscribers) = self.snapshot_or_stop(GcThread::Monitor) else {
                guard.armed = false;
                break;
            };

            for instance in &subscribers {
                let collected = instance.identity().drain_collected();
                if !collected.is_empty() {
                    instance.notify_collected(&collected);
                }
            }

            std::thread::sleep(self.gc_interval);
        }
        log::debug!("gc monitor stopped");
    }

    fn watcher_loop(&self, interval: Duration, probe: Arc<dyn MemoryProbe>) {
        log::debug!("memory watcher started");
        let mut guard = RunningFlagGuard {
            gc: self,
            thread: GcThread::Watcher,
            armed: true,
        };
        loop {
            let Some(subscribers) = self.snapshot_or_stop(GcThread::Watcher) else {
                guard.armed = false;
                break;
            };

            let max = probe.max_bytes();
            if max > 0 {
                // Signed arithmetic: a probe may momentarily report
                // total_bytes above max_bytes, making headroom negative.
                let unused =
                    max as i128 - probe.total_bytes() as i128 + probe.free_bytes() as i128;
                let ratio = unused as f64 / max as f64;
                if ratio < self.free_memory_ratio {
                    log::info!(
                        "memory watcher: free ratio {:.3} below {:.3}, requesting full sweep",
                        ratio,
                        self.free_memory_ratio
                    );
                    for instance in &subscribers {
                        instance.notify_collected(&[]);
                    }
                }
            }

            std::thread::sleep(interval);
        }
        log::debug!("memory watcher stopped");
    }

    /// Subscriber snapshot, or `None` after flipping the caller's
    /// running flag off because no subscribers remain. The flag is read
    /// and written under the same lock as the subscriber map, so a
    /// concurrent subscribe either sees the thread still running or
    /// starts a fresh one.
    fn snapshot_or_stop(&self, thread: GcThread) -> Option<Vec<Arc<EngineInstance>>> {
        let mut state = self.state.lock().unwrap();
        if state.subscribers.is_empty() {
            match thread {
                GcThread::Monitor => state.monitor_running = false,
                GcThread::Watcher => state.watcher_running = false,
            }
            return None;
        }
        Some(state.subscribers.values().cloned().collect())
    }
}

#[derive(Clone, Copy)]
enum GcThread {
    Monitor,
    Watcher,
}

/// Clears the owning thread's running flag if the loop unwinds, so a
/// later subscribe can spawn a replacement. Disarmed on normal exit
/// because `snapshot_or_stop` has already cleared the flag by then.
struct RunningFlagGuard<'a> {
    gc: &'a GcBridge,
    thread: GcThread,
    armed: bool,
}

impl Drop for RunningFlagGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut state) = self.gc.state.lock() {
            match self.thread {
                GcThread::Monitor => state.monitor_running = false,
                GcThread::Watcher => state.watcher_running = false,
            }
        }
    }
}
