// src/listener.rs
//
// Listener thread registry.
//
// One dedicated thread per notification role per open port — a data thread
// that multiplexes on the port and a private cancellation descriptor, and
// an event thread that watches the modem status lines. Registration is
// synchronous: the caller blocks until the spawned worker reports its
// initialization outcome exactly once, so success means the thread is
// running and failure means it is not and nothing was leaked.
//
// The registry is an explicit object. Multiple independent instances can
// coexist, and tests inject a small capacity to exercise the table-full
// path deterministically.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::cancel::CancelToken;
use crate::error::{is_benign_teardown_errno, Error, Result};
use crate::io::{self, WaitOutcome, LISTENER_CHUNK_BYTES};
use crate::port::{read_line_status, LineStatus, SerialPort};

/// Default cap on the total number of listener threads a registry manages.
const DEFAULT_CAPACITY: usize = 1024;

/// Sampling period of the event thread, in milliseconds.
const LINE_STATUS_POLL_MS: u16 = 100;

// ============================================================================
// Callback traits
// ============================================================================

/// Receives bytes read by a port's data thread. Callbacks run on that
/// thread and must not block: a stalled callback stalls the readability
/// loop for its port (and only its port).
pub trait DataListener: Send + Sync {
    fn on_data(&self, bytes: &[u8]);

    /// A read failure on the listener thread. Fatal device-gone errors
    /// also terminate the thread after this call.
    fn on_error(&self, _errno: Errno) {}
}

/// Receives modem line status snapshots from a port's event thread.
pub trait EventListener: Send + Sync {
    fn on_line_status(&self, status: LineStatus);

    /// A status sampling failure; the event thread terminates after this.
    fn on_error(&self, _errno: Errno) {}
}

// ============================================================================
// Registry internals
// ============================================================================

struct WorkerHandle {
    thread: JoinHandle<()>,
    exit: Arc<AtomicBool>,
    wake: Arc<CancelToken>,
}

/// Lifecycle of one (port, kind) worker. `Stopping` tombstones the slot
/// between the moment unregister takes the handle and the join completing,
/// so a concurrent register cannot double-spawn.
enum KindState {
    Idle,
    Running(WorkerHandle),
    Stopping,
}

impl KindState {
    fn is_idle(&self) -> bool {
        matches!(self, KindState::Idle)
    }
}

struct PortSlot {
    data: KindState,
    event: KindState,
}

impl Default for PortSlot {
    fn default() -> Self {
        PortSlot {
            data: KindState::Idle,
            event: KindState::Idle,
        }
    }
}

#[derive(Default)]
struct ListenerTable {
    slots: HashMap<RawFd, PortSlot>,
    active_threads: usize,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Data,
    Event,
}

impl Kind {
    fn label(self) -> &'static str {
        match self {
            Kind::Data => "data",
            Kind::Event => "event",
        }
    }
}

/// Registry of per-port notification threads.
pub struct ListenerRegistry {
    table: Mutex<ListenerTable>,
    capacity: usize,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// A registry bounded to `capacity` total worker threads across all
    /// ports and kinds.
    pub fn with_capacity(capacity: usize) -> Self {
        ListenerRegistry {
            table: Mutex::new(ListenerTable::default()),
            capacity,
        }
    }

    /// Number of worker threads currently registered.
    pub fn active_threads(&self) -> usize {
        self.lock_table().active_threads
    }

    /// Start a data listener thread for the port. Returns only once the
    /// worker reported readiness; on failure no thread is left behind.
    pub fn register_data_listener(
        &self,
        port: &SerialPort,
        listener: Arc<dyn DataListener>,
    ) -> Result<()> {
        let fd = port.as_raw_fd();
        self.register(fd, Kind::Data, move |fd, exit, wake_tx| {
            std::thread::Builder::new()
                .name(format!("portlink-data-{}", fd))
                .spawn(move || data_worker(fd, exit, listener, wake_tx))
        })
    }

    /// Start an event (line status) listener thread for the port.
    pub fn register_event_listener(
        &self,
        port: &SerialPort,
        listener: Arc<dyn EventListener>,
    ) -> Result<()> {
        let fd = port.as_raw_fd();
        self.register(fd, Kind::Event, move |fd, exit, wake_tx| {
            std::thread::Builder::new()
                .name(format!("portlink-event-{}", fd))
                .spawn(move || event_worker(fd, exit, listener, wake_tx))
        })
    }

    /// Stop the port's data thread and reclaim its slot entry once both
    /// kinds are gone.
    pub fn unregister_data_listener(&self, port: &SerialPort) -> Result<()> {
        self.unregister(port.as_raw_fd(), Kind::Data)
    }

    /// Stop the port's event thread.
    pub fn unregister_event_listener(&self, port: &SerialPort) -> Result<()> {
        self.unregister(port.as_raw_fd(), Kind::Event)
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, ListenerTable> {
        match self.table.lock() {
            Ok(guard) => guard,
            // A worker cannot poison this mutex (workers never touch the
            // table); a poisoned lock means a caller panicked mid-update,
            // and the bookkeeping itself is still consistent.
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn register<S>(&self, fd: RawFd, kind: Kind, spawn: S) -> Result<()>
    where
        S: FnOnce(
            RawFd,
            Arc<AtomicBool>,
            SyncSender<Result<Arc<CancelToken>>>,
        ) -> std::io::Result<JoinHandle<()>>,
    {
        // The table lock is held across the handshake. Worker init never
        // touches the table, so the wait is short and bounded, and holding
        // the lock makes registration atomic to every other caller.
        let mut table = self.lock_table();

        let occupied = {
            let slot = table.slots.entry(fd).or_default();
            match slot_kind(slot, kind) {
                KindState::Running(_) => Some("already registered"),
                KindState::Stopping => Some("still stopping"),
                KindState::Idle => None,
            }
        };
        if let Some(why) = occupied {
            remove_if_empty(&mut table, fd);
            return Err(Error::Resource(format!(
                "a {} listener is {} for this port",
                kind.label(),
                why
            )));
        }

        if table.active_threads >= self.capacity {
            remove_if_empty(&mut table, fd);
            return Err(Error::Resource(format!(
                "listener table is full ({} threads)",
                self.capacity
            )));
        }

        let exit = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::sync_channel(1);

        let thread = match spawn(fd, exit.clone(), tx) {
            Ok(handle) => handle,
            Err(e) => {
                remove_if_empty(&mut table, fd);
                return Err(Error::Thread(format!("failed to spawn worker: {}", e)));
            }
        };

        // Block until the worker reports init success or failure, exactly
        // once. Failure means the worker already returned; reap it so no
        // partial state survives.
        match rx.recv() {
            Ok(Ok(wake)) => {
                let slot = table.slots.entry(fd).or_default();
                *slot_kind(slot, kind) = KindState::Running(WorkerHandle { thread, exit, wake });
                table.active_threads += 1;
                tlog!("[listener] Registered {} listener on fd {}", kind.label(), fd);
                Ok(())
            }
            Ok(Err(err)) => {
                let _ = thread.join();
                remove_if_empty(&mut table, fd);
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                remove_if_empty(&mut table, fd);
                Err(Error::Thread(
                    "worker exited before reporting initialization".to_string(),
                ))
            }
        }
    }

    fn unregister(&self, fd: RawFd, kind: Kind) -> Result<()> {
        let handle = {
            let mut table = self.lock_table();
            let slot = table.slots.get_mut(&fd).ok_or_else(|| {
                Error::Resource("no listeners registered for this port".to_string())
            })?;
            let state = slot_kind(slot, kind);
            match std::mem::replace(state, KindState::Stopping) {
                KindState::Running(handle) => handle,
                previous => {
                    *state = previous;
                    return Err(Error::Resource(format!(
                        "no {} listener registered for this port",
                        kind.label()
                    )));
                }
            }
        };

        // Exit flag first, then the wake: the worker re-checks the flag
        // after every wakeup.
        handle.exit.store(true, Ordering::Release);
        if let Err(e) = handle.wake.cancel() {
            // The worker may already have exited on its own (device gone);
            // the join below settles it either way.
            tlog!("[listener] Wake on fd {} failed during unregister: {}", fd, e);
        }

        // Join outside the table lock; a blocked join must never stall
        // other registrations.
        let join_result = handle.thread.join();

        let mut table = self.lock_table();
        if let Some(slot) = table.slots.get_mut(&fd) {
            *slot_kind(slot, kind) = KindState::Idle;
        }
        table.active_threads = table.active_threads.saturating_sub(1);
        remove_if_empty(&mut table, fd);
        tlog!("[listener] Unregistered {} listener on fd {}", kind.label(), fd);

        join_result.map_err(|_| Error::Thread(format!("{} worker panicked", kind.label())))
    }

    /// Stop every worker: used on drop so no thread outlives the registry.
    fn shutdown(&self) {
        let handles: Vec<(RawFd, WorkerHandle)> = {
            let mut table = self.lock_table();
            let mut taken = Vec::new();
            for (fd, slot) in table.slots.iter_mut() {
                for state in [&mut slot.data, &mut slot.event] {
                    if let KindState::Running(handle) =
                        std::mem::replace(state, KindState::Idle)
                    {
                        taken.push((*fd, handle));
                    }
                }
            }
            table.slots.clear();
            table.active_threads = 0;
            taken
        };

        for (fd, handle) in handles {
            handle.exit.store(true, Ordering::Release);
            let _ = handle.wake.cancel();
            if handle.thread.join().is_err() {
                tlog!("[listener] Worker on fd {} panicked during shutdown", fd);
            }
        }
    }
}

impl Drop for ListenerRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn slot_kind(slot: &mut PortSlot, kind: Kind) -> &mut KindState {
    match kind {
        Kind::Data => &mut slot.data,
        Kind::Event => &mut slot.event,
    }
}

fn remove_if_empty(table: &mut ListenerTable, fd: RawFd) {
    if let Some(slot) = table.slots.get(&fd) {
        if slot.data.is_idle() && slot.event.is_idle() {
            table.slots.remove(&fd);
        }
    }
}

// ============================================================================
// Worker bodies
// ============================================================================

/// Errors that mean the device is gone and the worker should stop rather
/// than spin reporting the same failure.
fn is_fatal_worker_errno(errno: Errno) -> bool {
    errno == Errno::EIO || is_benign_teardown_errno(errno)
}

fn data_worker(
    fd: RawFd,
    exit: Arc<AtomicBool>,
    listener: Arc<dyn DataListener>,
    init_tx: SyncSender<Result<Arc<CancelToken>>>,
) {
    // The private cancellation descriptor is what makes the wait below
    // stoppable from outside; without it the poll would be indefinite.
    let wake = match CancelToken::new() {
        Ok(token) => Arc::new(token),
        Err(err) => {
            let _ = init_tx.send(Err(err));
            return;
        }
    };
    if init_tx.send(Ok(wake.clone())).is_err() {
        return;
    }

    // The registrar guarantees the port outlives this worker: unregister
    // joins the thread before the port may be closed.
    let port_fd = unsafe { BorrowedFd::borrow_raw(fd) };

    loop {
        if exit.load(Ordering::Acquire) {
            break;
        }
        match io::wait_readable(port_fd, wake.wait_fd()) {
            Ok(WaitOutcome::Cancelled) => {
                wake.drain();
                if exit.load(Ordering::Acquire) {
                    break;
                }
            }
            Ok(WaitOutcome::PortReady { hangup }) => {
                match io::read_available(port_fd, LISTENER_CHUNK_BYTES) {
                    Ok(data) if !data.is_empty() => listener.on_data(&data),
                    Ok(_) => {
                        if hangup {
                            // Readable-with-hangup and nothing left to read:
                            // the other end is gone.
                            listener.on_error(Errno::EIO);
                            break;
                        }
                    }
                    Err(errno) => {
                        listener.on_error(errno);
                        if is_fatal_worker_errno(errno) {
                            break;
                        }
                    }
                }
            }
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                listener.on_error(errno);
                break;
            }
        }
    }
}

fn event_worker(
    fd: RawFd,
    exit: Arc<AtomicBool>,
    listener: Arc<dyn EventListener>,
    init_tx: SyncSender<Result<Arc<CancelToken>>>,
) {
    let wake = match CancelToken::new() {
        Ok(token) => Arc::new(token),
        Err(err) => {
            let _ = init_tx.send(Err(err));
            return;
        }
    };
    if init_tx.send(Ok(wake.clone())).is_err() {
        return;
    }

    let mut last: Option<LineStatus> = None;
    loop {
        if exit.load(Ordering::Acquire) {
            break;
        }

        // Sleep on the wake descriptor with a sampling timeout. A wake
        // means exit (re-checked at the top); a timeout means sample.
        let mut fds = [PollFd::new(wake.wait_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(LINE_STATUS_POLL_MS)) {
            Ok(n) if n > 0 => {
                wake.drain();
                continue;
            }
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                listener.on_error(errno);
                break;
            }
        }

        match read_line_status(fd) {
            Ok(now) => {
                if let Some(prev) = last {
                    if prev != now {
                        listener.on_line_status(now);
                    }
                }
                last = Some(now);
            }
            Err(errno) => {
                listener.on_error(errno);
                break;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
