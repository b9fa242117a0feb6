//! Connection monitor task.
//!
//! The monitor is the only owner of the serial link. It runs as its own tokio
//! task and cycles through [`ConnectionState`]:
//!
//! 1. `Connecting`: open the port, send the liveness probe, wait for the
//!    expected reply. Retries are bounded by the probe budget.
//! 2. `Connected`: read lines continuously into the [`ConsoleBuffer`], log
//!    device reboots, clear the console on a fixed interval and serve
//!    [`PortRequest`]s one at a time.
//! 3. `Reconnecting`: the link is dropped (I/O error, EOF or an explicit
//!    request), then after the reconnect delay the cycle starts over.
//!
//! Everyone else talks to it through a cloneable [`MonitorHandle`]: state is
//! published on a `watch` channel, commands go over an `mpsc` channel and are
//! answered on a `oneshot`. Stop is cooperative and checked at every loop
//! boundary.

use super::console::ConsoleBuffer;
use super::state::ConnectionState;
use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::serial::{DynSerial, PortOpener};
use regex::Regex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const REQUEST_QUEUE_DEPTH: usize = 16;
const LINE_QUEUE_DEPTH: usize = 256;

/// Request served by the monitor while `Connected`.
#[derive(Debug)]
pub enum PortRequest {
    /// Write `line` and answer with the first non-prompt line received.
    Command {
        /// Command text without terminator
        line: String,
        /// Give up at this instant
        deadline: Instant,
        /// Original timeout, for the error value
        timeout: Duration,
        /// Reply channel
        response: oneshot::Sender<HarnessResult<String>>,
    },
    /// Drop the link and run a fresh connection cycle.
    Reconnect,
}

/// Monitor tuning, usually taken from [`HarnessConfig`].
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Liveness probe command
    pub probe_command: String,
    /// Pattern a probe reply must match
    pub probe_pattern: Regex,
    /// Text that marks a finished device reboot
    pub reboot_marker: String,
    /// Probe attempts per connection cycle
    pub retry_budget: u32,
    /// Wait for one probe reply
    pub response_window: Duration,
    /// Backoff between probe attempts and between cycles
    pub reconnect_delay: Duration,
    /// Console clear interval
    pub clear_interval: Duration,
    /// Console buffer size in lines
    pub console_capacity: usize,
    /// Appended to every outgoing line
    pub line_terminator: String,
}

impl MonitorSettings {
    /// Build settings from the `[probe]` and `[serial]` config sections.
    pub fn from_config(config: &HarnessConfig) -> HarnessResult<Self> {
        let probe = &config.probe;
        let probe_pattern = Regex::new(&probe.response_pattern).map_err(|e| {
            HarnessError::Configuration(format!(
                "Invalid probe.response_pattern '{}': {}",
                probe.response_pattern, e
            ))
        })?;
        Ok(Self {
            probe_command: probe.command.clone(),
            probe_pattern,
            reboot_marker: probe.reboot_marker.clone(),
            retry_budget: probe.retry_budget.max(1),
            response_window: probe.response_window,
            reconnect_delay: probe.reconnect_delay,
            clear_interval: probe.clear_interval,
            console_capacity: probe.console_capacity,
            line_terminator: config.serial.line_terminator.clone(),
        })
    }

    /// Whether `line` answers the liveness probe. The pattern must match at
    /// the start of the line.
    pub fn is_live_reply(&self, line: &str) -> bool {
        self.probe_pattern.find(line).is_some_and(|m| m.start() == 0)
    }
}

/// Open serial link: write half plus a reader task feeding a line queue.
///
/// Dropping the link aborts the reader, which releases the read half; the
/// port is closed once both halves are gone.
struct Link {
    writer: WriteHalf<DynSerial>,
    lines: mpsc::Receiver<io::Result<String>>,
    reader: JoinHandle<()>,
}

impl Link {
    fn new(port: DynSerial) -> Self {
        let (read_half, writer) = tokio::io::split(port);
        let (tx, lines) = mpsc::channel(LINE_QUEUE_DEPTH);
        let reader = tokio::spawn(read_lines(read_half, tx));
        Self {
            writer,
            lines,
            reader,
        }
    }

    async fn write_line(&mut self, line: &str, terminator: &str, limit: Duration) -> io::Result<()> {
        let frame = format!("{line}{terminator}");
        let write = async {
            self.writer.write_all(frame.as_bytes()).await?;
            self.writer.flush().await
        };
        match tokio::time::timeout(limit, write).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "serial write timed out")),
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_lines(read_half: ReadHalf<DynSerial>, tx: mpsc::Sender<io::Result<String>>) {
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            // EOF: dropping tx closes the queue
            Ok(0) => break,
            Ok(_) => {
                // Boot noise is not always valid UTF-8
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                if tx.send(Ok(line)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
}

/// Why the connected loop ended.
enum Exit {
    Stop,
    Lost(String),
}

struct Pending {
    deadline: Instant,
    timeout: Duration,
    response: oneshot::Sender<HarnessResult<String>>,
}

/// The monitor task itself. Create one with [`ConnectionMonitor::spawn`].
pub struct ConnectionMonitor {
    opener: Arc<dyn PortOpener>,
    settings: MonitorSettings,
    state_tx: watch::Sender<ConnectionState>,
    stop_rx: watch::Receiver<bool>,
    request_rx: mpsc::Receiver<PortRequest>,
    console: ConsoleBuffer,
}

impl ConnectionMonitor {
    /// Start the monitor task and return a handle to it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(opener: Arc<dyn PortOpener>, settings: MonitorSettings) -> MonitorHandle {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let console = ConsoleBuffer::new(settings.console_capacity);

        info!(port = %opener.describe(), "Starting connection monitor");
        let monitor = ConnectionMonitor {
            opener,
            settings,
            state_tx,
            stop_rx,
            request_rx,
            console: console.clone(),
        };
        let task = tokio::spawn(monitor.run());

        MonitorHandle {
            state_rx,
            stop_tx: Arc::new(stop_tx),
            requests: request_tx,
            console,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    async fn run(mut self) {
        loop {
            if self.stop_requested() {
                break;
            }
            self.transition(ConnectionState::Connecting);

            match self.connect().await {
                Ok(Some(link)) => {
                    self.transition(ConnectionState::Connected);
                    match self.serve(link).await {
                        Exit::Stop => break,
                        Exit::Lost(reason) => {
                            self.transition(ConnectionState::Reconnecting);
                            warn!(%reason, "Serial link lost, reconnecting");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(category = e.category(), error = %e, "Connection attempt failed");
                    self.transition(ConnectionState::Disconnected);
                }
            }

            if !self.pause(self.settings.reconnect_delay).await {
                break;
            }
        }
        self.transition(ConnectionState::Stopped);
        info!("Connection monitor stopped");
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    fn transition(&self, next: ConnectionState) {
        let current = *self.state_tx.borrow();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "Unexpected connection state transition");
        }
        debug!(from = %current, to = %next, "Connection state change");
        self.state_tx.send_replace(next);
    }

    /// Sleep for `delay` unless stop is requested first. Returns `false` on stop.
    async fn pause(&self, delay: Duration) -> bool {
        let mut stop_rx = self.stop_rx.clone();
        tokio::select! {
            _ = wait_for_stop(&mut stop_rx) => false,
            _ = sleep(delay) => true,
        }
    }

    fn observe(&self, line: &str) {
        self.console.push(line);
        if line.contains(&self.settings.reboot_marker) {
            info!(line, "Device reboot detected");
        }
    }

    /// Open the port and run the liveness probe.
    ///
    /// `Ok(None)` means stop was requested mid-probe.
    async fn connect(&self) -> HarnessResult<Option<Link>> {
        let port = self.opener.open().await?;
        let mut link = Link::new(port);
        let mut stop_rx = self.stop_rx.clone();
        let budget = self.settings.retry_budget;
        let window = self.settings.response_window;

        for attempt in 1..=budget {
            if self.stop_requested() {
                return Ok(None);
            }
            debug!(attempt, budget, command = %self.settings.probe_command, "Sending liveness probe");
            link.write_line(
                &self.settings.probe_command,
                &self.settings.line_terminator,
                window,
            )
            .await
            .map_err(|e| HarnessError::Connection(format!("Probe write failed: {e}")))?;

            let deadline = Instant::now() + window;
            loop {
                tokio::select! {
                    _ = wait_for_stop(&mut stop_rx) => return Ok(None),
                    _ = sleep_until(deadline) => break,
                    line = link.lines.recv() => match line {
                        Some(Ok(line)) => {
                            let text = line.trim();
                            if is_prompt_noise(text) {
                                continue;
                            }
                            self.observe(text);
                            if self.settings.is_live_reply(text) {
                                info!(attempt, "Device answered liveness probe");
                                return Ok(Some(link));
                            }
                        }
                        Some(Err(e)) => {
                            return Err(HarnessError::Connection(format!(
                                "Read failed during probe: {e}"
                            )))
                        }
                        None => {
                            return Err(HarnessError::Connection(
                                "Port closed during probe".to_string(),
                            ))
                        }
                    },
                }
            }

            warn!(attempt, budget, "No liveness response within {:?}", window);
            if attempt < budget && !self.pause(self.settings.reconnect_delay).await {
                return Ok(None);
            }
        }

        Err(HarnessError::Connection(format!(
            "No liveness response after {budget} attempts"
        )))
    }

    /// Connected loop: read lines, serve requests, clear the console.
    async fn serve(&mut self, mut link: Link) -> Exit {
        let mut stop_rx = self.stop_rx.clone();
        let period = self.settings.clear_interval;
        let mut clear_tick = tokio::time::interval_at(Instant::now() + period, period);
        clear_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending: Option<Pending> = None;

        loop {
            if self.stop_requested() {
                return Exit::Stop;
            }
            let deadline = pending.as_ref().map(|p| p.deadline);

            tokio::select! {
                _ = wait_for_stop(&mut stop_rx) => return Exit::Stop,

                line = link.lines.recv() => match line {
                    Some(Ok(line)) => {
                        let text = line.trim();
                        if is_prompt_noise(text) {
                            continue;
                        }
                        self.observe(text);
                        if let Some(p) = pending.take() {
                            debug!(line = text, "<- response");
                            let _ = p.response.send(Ok(text.to_string()));
                        }
                    }
                    Some(Err(e)) => return Exit::Lost(format!("read error: {e}")),
                    None => return Exit::Lost("end of file".to_string()),
                },

                request = self.request_rx.recv(), if pending.is_none() => match request {
                    Some(PortRequest::Command { line, deadline, timeout, response }) => {
                        if response.is_closed() {
                            continue;
                        }
                        if Instant::now() >= deadline {
                            let _ = response.send(Err(HarnessError::Timeout(timeout)));
                            continue;
                        }
                        debug!(%line, "-> command");
                        let limit = deadline.saturating_duration_since(Instant::now());
                        if let Err(e) = link
                            .write_line(&line, &self.settings.line_terminator, limit)
                            .await
                        {
                            let _ = response.send(Err(HarnessError::Connection(format!(
                                "write failed: {e}"
                            ))));
                            return Exit::Lost(format!("write error: {e}"));
                        }
                        pending = Some(Pending { deadline, timeout, response });
                    }
                    Some(PortRequest::Reconnect) => {
                        return Exit::Lost("reconnect requested".to_string());
                    }
                    // Every handle is gone
                    None => return Exit::Stop,
                },

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(p) = pending.take() {
                        debug!("Command response timed out after {:?}", p.timeout);
                        let _ = p.response.send(Err(HarnessError::Timeout(p.timeout)));
                    }
                }

                _ = clear_tick.tick() => {
                    debug!(lines = self.console.len(), "Clearing console buffer");
                    self.console.clear();
                }
            }
        }
    }
}

fn is_prompt_noise(line: &str) -> bool {
    line.is_empty() || line == ">"
}

/// Resolves once stop is requested or every stop sender is gone.
async fn wait_for_stop(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

/// Resolves with the first state that is `Connected` or `Stopped`.
async fn wait_for_settled(
    state_rx: &mut watch::Receiver<ConnectionState>,
) -> Option<ConnectionState> {
    state_rx
        .wait_for(|s| s.is_connected() || s.is_terminal())
        .await
        .map(|s| *s)
        .ok()
}

async fn wait_for_not_connected(state_rx: &mut watch::Receiver<ConnectionState>) {
    let _ = state_rx.wait_for(|s| !s.is_connected()).await;
}

/// Cloneable handle to a running [`ConnectionMonitor`].
#[derive(Clone)]
pub struct MonitorHandle {
    state_rx: watch::Receiver<ConnectionState>,
    stop_tx: Arc<watch::Sender<bool>>,
    requests: mpsc::Sender<PortRequest>,
    console: ConsoleBuffer,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MonitorHandle {
    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Receiver for state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Recently received device lines.
    pub fn console(&self) -> &ConsoleBuffer {
        &self.console
    }

    /// Wait until the monitor reports `Connected`.
    ///
    /// # Errors
    ///
    /// [`HarnessError::Timeout`] if `limit` passes first,
    /// [`HarnessError::MonitorStopped`] if the monitor exits.
    pub async fn wait_connected(&self, limit: Duration) -> HarnessResult<()> {
        let mut state_rx = self.state_rx.clone();
        match tokio::time::timeout(limit, wait_for_settled(&mut state_rx)).await {
            Ok(Some(ConnectionState::Connected)) => Ok(()),
            Ok(_) => Err(HarnessError::MonitorStopped),
            Err(_) => Err(HarnessError::Timeout(limit)),
        }
    }

    /// Send one command line and wait for the single response line.
    ///
    /// The request queues until the monitor is connected; `timeout` covers
    /// queueing and the device reply together.
    pub async fn send_line(&self, line: &str, timeout: Duration) -> HarnessResult<String> {
        let deadline = Instant::now() + timeout;
        let (response, reply) = oneshot::channel();
        self.requests
            .send(PortRequest::Command {
                line: line.to_string(),
                deadline,
                timeout,
                response,
            })
            .await
            .map_err(|_| HarnessError::MonitorStopped)?;

        match tokio::time::timeout_at(deadline, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HarnessError::Connection(
                "Link lost before a response arrived".to_string(),
            )),
            Err(_) => Err(HarnessError::Timeout(timeout)),
        }
    }

    /// Ask the monitor to drop the link and run a fresh connection cycle.
    ///
    /// Returns once the monitor has left `Connected`. A no-op when it is not
    /// connected, since a cycle is already under way.
    pub async fn request_reconnect(&self) -> HarnessResult<()> {
        if !self.state().is_connected() {
            return Ok(());
        }
        self.requests
            .send(PortRequest::Reconnect)
            .await
            .map_err(|_| HarnessError::MonitorStopped)?;
        let mut state_rx = self.state_rx.clone();
        wait_for_not_connected(&mut state_rx).await;
        Ok(())
    }

    /// Signal the monitor to stop. Does not wait.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Stop the monitor and wait for its task to finish.
    pub async fn shutdown(&self) {
        self.stop();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Connection monitor task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_lines_are_noise() {
        assert!(is_prompt_noise(""));
        assert!(is_prompt_noise(">"));
        assert!(!is_prompt_noise("[time_tick+ok]"));
    }

    #[test]
    fn settings_from_default_config() {
        let settings = MonitorSettings::from_config(&HarnessConfig::default()).unwrap();
        assert!(settings.probe_pattern.is_match("[time_tick+ok] "));
        assert!(!settings.probe_pattern.is_match("[time_tick+err]"));
        assert_eq!(settings.retry_budget, 5);
    }

    #[test]
    fn live_reply_must_start_the_line() {
        let settings = MonitorSettings::from_config(&HarnessConfig::default()).unwrap();
        assert!(settings.is_live_reply("[time_tick+ok]"));
        assert!(settings.is_live_reply("[time_tick+ok] 1715000000"));
        assert!(!settings.is_live_reply("nack: expected [time_tick+ok]"));
        assert!(!settings.is_live_reply("echo [time_tick+ok]"));
    }
}
