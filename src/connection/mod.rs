//! Serial connection lifecycle: state, console buffer and the monitor task.

pub mod console;
pub mod monitor;
pub mod state;

pub use console::{ConsoleBuffer, ConsoleLine};
pub use monitor::{ConnectionMonitor, MonitorHandle, MonitorSettings, PortRequest};
pub use state::ConnectionState;
