// src/hotplug.rs
//
// Hotplug monitor registry.
//
// Same slot-table and handshake discipline as the listener registry,
// specialized to device arrival/removal. Each monitor thread periodically
// consumes an injected device enumerator, filters on vid/pid and an
// optional case-insensitive serial number, and diffs consecutive
// snapshots into arrived/removed callbacks. Discovery itself is a
// collaborator: this module never scans buses on its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use serde::Serialize;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};

/// Default cap on concurrently registered monitors.
const DEFAULT_CAPACITY: usize = 1024;

/// Default rescan period in milliseconds.
const DEFAULT_POLL_MS: u16 = 500;

// ============================================================================
// Collaborator surface
// ============================================================================

/// What the discovery collaborator reports about one attached device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
    pub product: Option<String>,
    pub manufacturer: Option<String>,
    /// Bus location or device node, when the enumerator knows it.
    pub location: Option<String>,
}

impl DeviceInfo {
    /// Stable identity for snapshot diffing. Serial numbers compare
    /// case-insensitively, matching the filter semantics.
    fn key(&self) -> String {
        format!(
            "{:04x}:{:04x}:{}:{}",
            self.vid,
            self.pid,
            self.serial_number
                .as_deref()
                .map(|s| s.to_ascii_lowercase())
                .unwrap_or_default(),
            self.location.as_deref().unwrap_or_default(),
        )
    }
}

/// Device-enumeration service this registry consumes. Implementations
/// typically wrap a platform subsystem scan; tests script one by hand.
pub trait DeviceEnumerator: Send + Sync {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>>;
}

/// Receives arrival/removal notifications on the monitor thread.
/// Callbacks must not block; they share the thread with the rescan loop.
pub trait HotplugListener: Send + Sync {
    fn on_device_arrived(&self, device: &DeviceInfo);
    fn on_device_removed(&self, device: &DeviceInfo);
}

/// Which devices a monitor reports. A `None` serial matches any device
/// with the right vid/pid; a `Some` serial must match case-insensitively.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HotplugFilter {
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
}

impl HotplugFilter {
    pub fn matches(&self, device: &DeviceInfo) -> bool {
        if device.vid != self.vid || device.pid != self.pid {
            return false;
        }
        match &self.serial_number {
            None => true,
            Some(wanted) => device
                .serial_number
                .as_deref()
                .map_or(false, |have| have.eq_ignore_ascii_case(wanted)),
        }
    }
}

/// Identifies one registered monitor for later unregistration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MonitorId(u32);

// ============================================================================
// Registry
// ============================================================================

struct MonitorHandle {
    thread: JoinHandle<()>,
    exit: Arc<AtomicBool>,
    wake: Arc<CancelToken>,
}

#[derive(Default)]
struct MonitorTable {
    monitors: HashMap<MonitorId, MonitorHandle>,
    /// Monotonic append cursor for monitor ids.
    next_id: u32,
}

pub struct HotplugRegistry {
    table: Mutex<MonitorTable>,
    capacity: usize,
    poll_ms: u16,
}

impl Default for HotplugRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HotplugRegistry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        HotplugRegistry {
            table: Mutex::new(MonitorTable::default()),
            capacity,
            poll_ms: DEFAULT_POLL_MS,
        }
    }

    /// Override the rescan period; tests use a short one.
    pub fn with_poll_interval(mut self, milliseconds: u16) -> Self {
        self.poll_ms = milliseconds;
        self
    }

    /// Number of monitors currently registered.
    pub fn active_monitors(&self) -> usize {
        self.lock_table().monitors.len()
    }

    /// Start a monitor thread for devices matching `filter`.
    ///
    /// Registration is synchronous: the monitor takes its baseline
    /// snapshot from the enumerator before reporting ready, so a failing
    /// enumerator fails the registration rather than a background thread.
    /// Devices already attached at registration time are part of the
    /// baseline and are not reported as arrivals.
    pub fn register_monitor(
        &self,
        filter: HotplugFilter,
        enumerator: Arc<dyn DeviceEnumerator>,
        listener: Arc<dyn HotplugListener>,
    ) -> Result<MonitorId> {
        let mut table = self.lock_table();

        if table.monitors.len() >= self.capacity {
            return Err(Error::Resource(format!(
                "hotplug monitor table is full ({} monitors)",
                self.capacity
            )));
        }

        let id = MonitorId(table.next_id);
        let exit = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::sync_channel(1);

        let worker_exit = exit.clone();
        let poll_ms = self.poll_ms;
        let thread = std::thread::Builder::new()
            .name(format!("portlink-hotplug-{}", id.0))
            .spawn(move || monitor_worker(filter, enumerator, listener, worker_exit, poll_ms, tx))
            .map_err(|e| Error::Thread(format!("failed to spawn monitor: {}", e)))?;

        match rx.recv() {
            Ok(Ok(wake)) => {
                table.next_id += 1;
                table
                    .monitors
                    .insert(id, MonitorHandle { thread, exit, wake });
                tlog!("[hotplug] Registered monitor {:?}", id);
                Ok(id)
            }
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Thread(
                    "monitor exited before reporting initialization".to_string(),
                ))
            }
        }
    }

    /// Stop a monitor thread and release its slot.
    pub fn unregister_monitor(&self, id: MonitorId) -> Result<()> {
        let handle = {
            let mut table = self.lock_table();
            table
                .monitors
                .remove(&id)
                .ok_or_else(|| Error::Resource(format!("no monitor registered under {:?}", id)))?
        };

        handle.exit.store(true, Ordering::Release);
        if let Err(e) = handle.wake.cancel() {
            tlog!("[hotplug] Wake for {:?} failed during unregister: {}", id, e);
        }
        let join_result = handle.thread.join();
        tlog!("[hotplug] Unregistered monitor {:?}", id);
        join_result.map_err(|_| Error::Thread("hotplug monitor panicked".to_string()))
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, MonitorTable> {
        match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn shutdown(&self) {
        let handles: Vec<MonitorHandle> = {
            let mut table = self.lock_table();
            table.monitors.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.exit.store(true, Ordering::Release);
            let _ = handle.wake.cancel();
            let _ = handle.thread.join();
        }
    }
}

impl Drop for HotplugRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Monitor worker
// ============================================================================

fn matching_snapshot(
    filter: &HotplugFilter,
    enumerator: &Arc<dyn DeviceEnumerator>,
) -> Result<HashMap<String, DeviceInfo>> {
    let devices = enumerator.enumerate()?;
    Ok(devices
        .into_iter()
        .filter(|d| filter.matches(d))
        .map(|d| (d.key(), d))
        .collect())
}

fn monitor_worker(
    filter: HotplugFilter,
    enumerator: Arc<dyn DeviceEnumerator>,
    listener: Arc<dyn HotplugListener>,
    exit: Arc<AtomicBool>,
    poll_ms: u16,
    init_tx: SyncSender<Result<Arc<CancelToken>>>,
) {
    let wake = match CancelToken::new() {
        Ok(token) => Arc::new(token),
        Err(err) => {
            let _ = init_tx.send(Err(err));
            return;
        }
    };

    // The baseline snapshot doubles as the init check: a broken enumerator
    // fails the registration handshake instead of a running thread.
    let mut known = match matching_snapshot(&filter, &enumerator) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            let _ = init_tx.send(Err(err));
            return;
        }
    };

    if init_tx.send(Ok(wake.clone())).is_err() {
        return;
    }

    loop {
        if exit.load(Ordering::Acquire) {
            break;
        }

        // Sleep on the wake descriptor with the rescan period as timeout.
        let mut fds = [PollFd::new(wake.wait_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(poll_ms)) {
            Ok(n) if n > 0 => {
                wake.drain();
                continue;
            }
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                tlog!("[hotplug] Monitor wait failed: {}", errno);
                break;
            }
        }

        let current = match matching_snapshot(&filter, &enumerator) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                // Transient enumeration hiccups should not kill the
                // monitor; keep the last good snapshot and retry.
                tlog!("[hotplug] Enumeration failed, keeping last snapshot: {}", err);
                continue;
            }
        };

        for (key, device) in &current {
            if !known.contains_key(key) {
                listener.on_device_arrived(device);
            }
        }
        for (key, device) in &known {
            if !current.contains_key(key) {
                listener.on_device_removed(device);
            }
        }
        known = current;
    }
}

// ============================================================================
// Tests
// ============================================================================
