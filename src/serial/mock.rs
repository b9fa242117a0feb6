//! In-memory serial device for tests.
//!
//! [`new`] returns a connected pair: a [`MockSerialPort`] that implements
//! `AsyncRead`/`AsyncWrite` and goes to the code under test, and a
//! [`MockDeviceHarness`] the test keeps to assert on writes and push replies.
//!
//! For monitor and runner tests, [`MockPortOpener`] plays a whole ventilator
//! from a [`ScriptedDevice`]: every open spawns a fresh device task that
//! answers command lines from the script, so reconnect cycles behave like a
//! real re-plugged UART.
//!
//! ```rust,ignore
//! let device = ScriptedDevice::new()
//!     .respond("time_tick", ["[time_tick+ok]"])
//!     .respond("sn_get", ["[sn_get+ok] 1212324500026"]);
//! let opener = MockPortOpener::new(device);
//! ```

use super::{DynSerial, PortOpener};
use crate::error::{HarnessError, HarnessResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// Application side of the mock link.
#[derive(Debug)]
pub struct MockSerialPort {
    writes_tx: UnboundedSender<Vec<u8>>,
    reads_rx: UnboundedReceiver<Vec<u8>>,
    read_buffer: VecDeque<u8>,
}

/// Device side of the mock link.
#[derive(Debug)]
pub struct MockDeviceHarness {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: UnboundedSender<Vec<u8>>,
    write_buffer: Vec<u8>,
}

/// Create a connected port/harness pair.
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (app_to_device_tx, app_to_device_rx) = mpsc::unbounded_channel();
    let (device_to_app_tx, device_to_app_rx) = mpsc::unbounded_channel();

    let port = MockSerialPort {
        writes_tx: app_to_device_tx,
        reads_rx: device_to_app_rx,
        read_buffer: VecDeque::new(),
    };
    let harness = MockDeviceHarness {
        writes_rx: app_to_device_rx,
        reads_tx: device_to_app_tx,
        write_buffer: Vec::new(),
    };
    (port, harness)
}

impl MockSerialPort {
    fn drain_into(&mut self, buf: &mut ReadBuf<'_>) {
        let to_read = std::cmp::min(buf.remaining(), self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..to_read).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buffer.is_empty() {
            self.drain_into(buf);
            return Poll::Ready(Ok(()));
        }

        match self.reads_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                self.read_buffer.extend(chunk);
                self.drain_into(buf);
                Poll::Ready(Ok(()))
            }
            // Device hung up: end-of-file
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl MockDeviceHarness {
    /// Push raw bytes to the application side.
    ///
    /// # Errors
    /// Fails once the application has dropped its port.
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        self.reads_tx
            .send(data.to_vec())
            .map_err(|_| "Failed to send response: client port disconnected")
    }

    /// Push one newline-terminated line.
    ///
    /// # Errors
    /// Fails once the application has dropped its port.
    pub fn send_line(&self, line: &str) -> Result<(), &'static str> {
        self.send_response(format!("{line}\n").as_bytes())
    }

    /// Wait for the application to write `expected` and assert on it.
    ///
    /// # Panics
    /// Panics if the bytes differ or do not arrive within 2 seconds.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        let timeout_duration = Duration::from_secs(2);

        while self.write_buffer.len() < expected.len() {
            match tokio::time::timeout(timeout_duration, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("Client-side port closed while expecting a write."),
                Err(_) => panic!(
                    "Timeout waiting for write. Expected `{:?}`, received `{:?}`.",
                    String::from_utf8_lossy(expected),
                    String::from_utf8_lossy(&self.write_buffer),
                ),
            }
        }

        let actual = &self.write_buffer[..expected.len()];
        assert_eq!(
            actual,
            expected,
            "Mismatch in expected write. Expected `{:?}`, got `{:?}`.",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(actual)
        );
        self.write_buffer.drain(..expected.len());
    }

    /// Expect a write, then answer it.
    ///
    /// # Panics
    /// Same as [`expect_write`](Self::expect_write), or if the port is gone.
    pub async fn expect_and_respond(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_write(expected).await;
        if let Err(e) = self.send_response(response) {
            panic!("{e}");
        }
    }

    /// Next complete command line written by the application, without terminator.
    ///
    /// Returns `None` once the application has dropped its port.
    pub async fn next_command(&mut self) -> Option<String> {
        loop {
            if let Some(pos) = self.write_buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.write_buffer.drain(..=pos).collect();
                return Some(String::from_utf8_lossy(&line).trim().to_string());
            }
            let chunk = self.writes_rx.recv().await?;
            self.write_buffer.extend_from_slice(&chunk);
        }
    }
}

/// How the scripted device reacts to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Send these lines back, in order
    Lines(Vec<String>),
    /// Swallow the command
    Silent,
    /// Drop the link (the application sees end-of-file)
    HangUp,
}

/// Behaviour script for a simulated device.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDevice {
    greeting: Vec<String>,
    replies: HashMap<String, Reply>,
    one_shot: HashMap<String, VecDeque<Reply>>,
    failed_opens: usize,
}

impl ScriptedDevice {
    /// Empty script: every command is silently ignored.
    pub fn new() -> Self {
        Self::default()
    }

    /// Device that answers the default liveness probe.
    pub fn responsive() -> Self {
        Self::new().respond("time_tick", ["[time_tick+ok]"])
    }

    /// Always answer `command` with `lines`.
    pub fn respond<I, S>(mut self, command: &str, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.replies.insert(
            command.to_string(),
            Reply::Lines(lines.into_iter().map(Into::into).collect()),
        );
        self
    }

    /// Never answer `command`.
    pub fn silent(mut self, command: &str) -> Self {
        self.replies.insert(command.to_string(), Reply::Silent);
        self
    }

    /// Use `reply` for the next occurrence of `command` only.
    ///
    /// One-shot replies queue up and take precedence over [`respond`](Self::respond).
    pub fn once(mut self, command: &str, reply: Reply) -> Self {
        self.one_shot
            .entry(command.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Lines the device prints as soon as a link is opened.
    pub fn greeting<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.greeting = lines.into_iter().map(Into::into).collect();
        self
    }

    /// Make the first `count` open attempts fail.
    pub fn fail_opens(mut self, count: usize) -> Self {
        self.failed_opens = count;
        self
    }

    fn reply_for(&mut self, command: &str) -> Reply {
        if let Some(reply) = self.one_shot.get_mut(command).and_then(VecDeque::pop_front) {
            return reply;
        }
        self.replies.get(command).cloned().unwrap_or(Reply::Silent)
    }
}

#[derive(Debug, Default)]
struct DeviceLog {
    written: Vec<String>,
}

/// [`PortOpener`] backed by a [`ScriptedDevice`].
///
/// Clones share the script, the open counter and the command log.
#[derive(Debug, Clone)]
pub struct MockPortOpener {
    script: Arc<Mutex<ScriptedDevice>>,
    log: Arc<Mutex<DeviceLog>>,
    opens: Arc<AtomicUsize>,
}

impl MockPortOpener {
    /// Wrap a script.
    pub fn new(script: ScriptedDevice) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            log: Arc::new(Mutex::new(DeviceLog::default())),
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of successful and failed open attempts so far.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Every command line the device has received, across all links.
    pub fn written(&self) -> Vec<String> {
        lock(&self.log).written.clone()
    }

    /// How many times `command` was received.
    pub fn count_of(&self, command: &str) -> usize {
        lock(&self.log).written.iter().filter(|c| *c == command).count()
    }
}

#[async_trait]
impl PortOpener for MockPortOpener {
    async fn open(&self) -> HarnessResult<DynSerial> {
        let attempt = self.opens.fetch_add(1, Ordering::SeqCst);
        let greeting = {
            let script = lock(&self.script);
            if attempt < script.failed_opens {
                return Err(HarnessError::Connection(format!(
                    "mock open attempt {} refused",
                    attempt + 1
                )));
            }
            script.greeting.clone()
        };

        let (port, harness) = new();
        for line in &greeting {
            // The port was just created, so the receiver is alive
            let _ = harness.send_line(line);
        }
        tokio::spawn(run_device(harness, self.script.clone(), self.log.clone()));
        Ok(Box::new(port))
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

async fn run_device(
    mut harness: MockDeviceHarness,
    script: Arc<Mutex<ScriptedDevice>>,
    log: Arc<Mutex<DeviceLog>>,
) {
    while let Some(command) = harness.next_command().await {
        if command.is_empty() {
            continue;
        }
        lock(&log).written.push(command.clone());
        let reply = lock(&script).reply_for(&command);
        debug!(%command, ?reply, "mock device received command");
        match reply {
            Reply::Lines(lines) => {
                for line in lines {
                    if harness.send_line(&line).is_err() {
                        return;
                    }
                }
            }
            Reply::Silent => {}
            Reply::HangUp => return,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_command_response() {
        let (port, mut harness) = new();
        let mut port = BufReader::new(port);

        let app_task = tokio::spawn(async move {
            port.write_all(b"sn_get\n").await.unwrap();
            let mut response = String::new();
            port.read_line(&mut response).await.unwrap();
            response
        });

        harness
            .expect_and_respond(b"sn_get\n", b"[sn_get+ok] 1212324500026\n")
            .await;
        assert_eq!(app_task.await.unwrap(), "[sn_get+ok] 1212324500026\n");
    }

    #[tokio::test]
    async fn test_read_times_out_without_reply() {
        let (port, mut harness) = new();
        let mut port = BufReader::new(port);

        let app_task = tokio::spawn(async move {
            port.write_all(b"fw_get\n").await.unwrap();
            let mut response = String::new();
            timeout(Duration::from_millis(100), port.read_line(&mut response)).await
        });

        harness.expect_write(b"fw_get\n").await;
        assert!(app_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_scripted_device_answers_and_logs() {
        let opener = MockPortOpener::new(
            ScriptedDevice::responsive()
                .greeting(["booting"])
                .once("time_tick", Reply::Silent),
        );
        let port = opener.open().await.unwrap();
        let mut port = BufReader::new(port);

        let mut line = String::new();
        port.read_line(&mut line).await.unwrap();
        assert_eq!(line, "booting\n");

        // First probe is swallowed, second is answered
        port.write_all(b"time_tick\ntime_tick\n").await.unwrap();
        line.clear();
        port.read_line(&mut line).await.unwrap();
        assert_eq!(line, "[time_tick+ok]\n");

        assert_eq!(opener.count_of("time_tick"), 2);
        assert_eq!(opener.open_count(), 1);
    }

    #[tokio::test]
    async fn test_hang_up_reads_eof() {
        let opener = MockPortOpener::new(ScriptedDevice::new().once("reset", Reply::HangUp));
        let mut port = BufReader::new(opener.open().await.unwrap());
        port.write_all(b"reset\n").await.unwrap();

        let mut line = String::new();
        let n = port.read_line(&mut line).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_failed_opens() {
        let opener = MockPortOpener::new(ScriptedDevice::responsive().fail_opens(2));
        assert!(opener.open().await.is_err());
        assert!(opener.open().await.is_err());
        assert!(opener.open().await.is_ok());
        assert_eq!(opener.open_count(), 3);
    }
}
