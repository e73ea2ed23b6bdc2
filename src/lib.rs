// src/lib.rs
//
// portlink: POSIX serial transport core.
//
// Opens and configures tty-style devices, performs robust blocking and
// non-blocking I/O with transparent retry on signal interruption, and runs
// per-port background threads that deliver data and line-status
// notifications to registered listeners. Blocking waits are cancellable
// from another thread through a CancelToken.
//
// Device discovery is a collaborator, not a concern of this crate: the
// hotplug registry consumes a DeviceEnumerator implementation and only
// applies vid/pid/serial filtering to whatever it yields.

#[macro_use]
mod logging;

mod cancel;
mod config;
mod error;
mod hotplug;
mod io;
mod listener;
mod port;

pub use cancel::CancelToken;
pub use config::{Baud, ControlConfig, DataConfig, FlowControl, Parity, RawTermios};
pub use error::{ConfigError, Error, Result};
pub use hotplug::{
    DeviceEnumerator, DeviceInfo, HotplugFilter, HotplugListener, HotplugRegistry, MonitorId,
};
pub use listener::{DataListener, EventListener, ListenerRegistry};
pub use logging::{init_file_logging, stop_file_logging};
#[cfg(target_os = "linux")]
pub use port::InterruptCounts;
pub use port::{Access, LineStatus, QueuedBytes, SerialPort};
