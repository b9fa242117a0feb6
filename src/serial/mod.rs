//! Serial port access.
//!
//! The connection monitor never names a concrete port type. It asks a
//! [`PortOpener`] for a fresh [`DynSerial`] every time it (re)enters
//! `Connecting`, so the same monitor drives a real UART through
//! [`SerialPortOpener`] and an in-memory device through [`mock::MockPortOpener`].

pub mod mock;

use crate::config::SerialConfig;
use crate::error::{HarnessError, HarnessResult};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Trait alias for anything usable as a serial link.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Boxed serial link handed to the monitor.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Source of serial links.
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Open a new link to the device.
    ///
    /// # Errors
    ///
    /// [`HarnessError::Connection`] when the device cannot be opened. The
    /// monitor treats this as a failed connection attempt and retries.
    async fn open(&self) -> HarnessResult<DynSerial>;

    /// Human-readable name of the link (port path, `mock`, ...).
    fn describe(&self) -> String;
}

/// Opens a real UART through `tokio-serial` (8N1, no flow control).
#[derive(Debug, Clone)]
pub struct SerialPortOpener {
    port: String,
    baud_rate: u32,
}

impl SerialPortOpener {
    /// Create an opener for `port` at `baud_rate`.
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
        }
    }

    /// Create an opener from the `[serial]` config section.
    pub fn from_config(config: &SerialConfig) -> Self {
        Self::new(config.port.clone(), config.baud_rate)
    }
}

#[async_trait]
impl PortOpener for SerialPortOpener {
    #[cfg(feature = "serial")]
    async fn open(&self) -> HarnessResult<DynSerial> {
        use tokio_serial::SerialPortBuilderExt;

        let port = self.port.clone();
        let baud_rate = self.baud_rate;

        // Opening can block on some USB adapters
        let stream = tokio::task::spawn_blocking(move || {
            tokio_serial::new(&port, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .map_err(|e| HarnessError::Connection(format!("Failed to open {port}: {e}")))
        })
        .await
        .map_err(|e| HarnessError::Connection(format!("Serial open task failed: {e}")))??;

        Ok(Box::new(stream))
    }

    #[cfg(not(feature = "serial"))]
    async fn open(&self) -> HarnessResult<DynSerial> {
        Err(HarnessError::SerialFeatureDisabled)
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.port, self.baud_rate)
    }
}
