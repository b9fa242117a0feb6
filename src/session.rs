//! Run session: device identity, step results and summary markers.
//!
//! A [`RunSession`] is created when a plan starts, filled append-only by the
//! runner and finalized when the last step completes. It is the only input of
//! the report generator and can be saved as JSON next to the report.

use crate::error::{HarnessError, HarnessResult};
use crate::validation::Parameters;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Pass or fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Judgement passed
    Pass,
    /// Judgement failed
    Fail,
}

impl Outcome {
    /// `Pass` when `ok`, else `Fail`.
    pub fn from_bool(ok: bool) -> Self {
        if ok {
            Outcome::Pass
        } else {
            Outcome::Fail
        }
    }

    /// Whether this is `Pass`.
    pub fn is_pass(&self) -> bool {
        matches!(self, Outcome::Pass)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Pass => write!(f, "PASS"),
            Outcome::Fail => write!(f, "FAIL"),
        }
    }
}

/// What a result judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Judgement {
    /// Response prefix against the expected prefix
    Prefix,
    /// Response value against the command's condition
    Value,
    /// Last observed value against a plan condition step
    Condition,
    /// The command could not be exchanged at all (timeout, lookup miss, link down)
    Transport,
}

/// One recorded judgement. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Step name from the plan
    pub step: String,
    /// Human-readable title
    pub title: String,
    /// Command text sent, if any
    pub command: Option<String>,
    /// Expected prefix, value or condition
    pub expected: String,
    /// What was observed
    pub actual: String,
    /// Verdict
    pub outcome: Outcome,
    /// What was judged
    pub judgement: Judgement,
    /// Plan repetition this result belongs to, starting at 1
    pub cycle: u32,
    /// When the step started
    pub timestamp: DateTime<Local>,
    /// How long the step took
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Diagnostic for failures that did not come from a comparison
    pub note: Option<String>,
}

/// Position of a summary step within the result list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryMarker {
    /// Marker text
    pub label: String,
    /// Number of results recorded before the marker
    pub position: usize,
    /// Plan repetition
    pub cycle: u32,
    /// When the marker was reached
    pub timestamp: DateTime<Local>,
}

/// Identity of the unit under test, as entered by the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device serial number
    pub serial_number: String,
    /// Firmware version
    pub fw_version: String,
    /// Software (LCM) version
    pub sw_version: String,
    /// Wi-Fi module version
    pub wifi_version: String,
    /// Additional condition parameters
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl DeviceInfo {
    /// All four identity fields must be filled in.
    pub fn validate(&self) -> HarnessResult<()> {
        for (field, value) in [
            ("device serial number", &self.serial_number),
            ("firmware version", &self.fw_version),
            ("software version", &self.sw_version),
            ("Wi-Fi version", &self.wifi_version),
        ] {
            if value.trim().is_empty() {
                return Err(HarnessError::Configuration(format!("{field} is required")));
            }
        }
        Ok(())
    }

    /// Condition parameters: `device_sn`, `fw_version`, `sw_version`,
    /// `wifi_version`, then the extras (which may override them).
    pub fn parameters(&self) -> Parameters {
        let mut params = Parameters::new();
        params.insert("device_sn".into(), self.serial_number.clone());
        params.insert("fw_version".into(), self.fw_version.clone());
        params.insert("sw_version".into(), self.sw_version.clone());
        params.insert("wifi_version".into(), self.wifi_version.clone());
        params.extend(self.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        params
    }
}

/// Everything recorded during one plan run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSession {
    /// Unique run id
    pub run_id: Uuid,
    /// Host the harness ran on
    pub host: String,
    /// Serial link description
    pub port: String,
    /// Plan name
    pub plan: String,
    /// Unit under test
    pub device: DeviceInfo,
    /// Number of plan repetitions
    pub cycles: u32,
    /// Results in execution order
    pub results: Vec<StepResult>,
    /// Summary markers in execution order
    pub markers: Vec<SummaryMarker>,
    /// Run start
    pub started: DateTime<Local>,
    /// Run end, set by [`finish`](Self::finish)
    pub finished: Option<DateTime<Local>>,
}

impl RunSession {
    /// Start a new session now.
    pub fn new(
        plan: impl Into<String>,
        device: DeviceInfo,
        port: impl Into<String>,
        cycles: u32,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            host: local_host_name(),
            port: port.into(),
            plan: plan.into(),
            device,
            cycles,
            results: Vec::new(),
            markers: Vec::new(),
            started: Local::now(),
            finished: None,
        }
    }

    /// Append a result.
    pub fn record(&mut self, result: StepResult) {
        self.results.push(result);
    }

    /// Append a summary marker at the current position.
    pub fn mark(&mut self, label: impl Into<String>, cycle: u32) {
        self.markers.push(SummaryMarker {
            label: label.into(),
            position: self.results.len(),
            cycle,
            timestamp: Local::now(),
        });
    }

    /// Stamp the finish time.
    pub fn finish(&mut self) {
        self.finished = Some(Local::now());
    }

    /// Number of recorded results.
    pub fn total(&self) -> usize {
        self.results.len()
    }

    /// Number of passing results.
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_pass()).count()
    }

    /// Number of failing results.
    pub fn failed(&self) -> usize {
        self.total() - self.passed()
    }

    /// Passed over total, in percent. Zero when nothing was recorded.
    pub fn pass_rate(&self) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        self.passed() as f64 / self.total() as f64 * 100.0
    }

    /// Finish minus start; zero while the run is in progress.
    pub fn duration(&self) -> chrono::Duration {
        self.finished
            .map(|end| end - self.started)
            .unwrap_or_else(chrono::Duration::zero)
    }

    /// Write the session as pretty JSON into `dir`.
    ///
    /// File name: `Test_Session_<plan>_<YYYYmmdd_HHMMSS>.json`, with a
    /// `_2`, `_3`, ... suffix when that name is taken.
    pub fn save_json(&self, dir: &Path) -> HarnessResult<PathBuf> {
        let stamp = self.finished.unwrap_or(self.started).format("%Y%m%d_%H%M%S");
        let stem = format!("Test_Session_{}_{}", file_safe(&self.plan), stamp);
        let json = serde_json::to_string_pretty(self)?;
        write_new_file(dir, &stem, "json", json.as_bytes())
    }

    /// Read a session written by [`save_json`](Self::save_json).
    pub fn load_json(path: &Path) -> HarnessResult<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Replace anything that is awkward in a file name.
pub(crate) fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Highest numeric suffix tried before giving up on a free file name.
const MAX_NAME_SUFFIX: u32 = 99;

/// Create `<stem>.<ext>` in `dir`, or `<stem>_<n>.<ext>` if taken, and write
/// `contents`. Existing files are never touched.
pub(crate) fn write_new_file(
    dir: &Path,
    stem: &str,
    ext: &str,
    contents: &[u8],
) -> HarnessResult<PathBuf> {
    fs::create_dir_all(dir)?;
    for n in 1..=MAX_NAME_SUFFIX {
        let name = if n == 1 {
            format!("{stem}.{ext}")
        } else {
            format!("{stem}_{n}.{ext}")
        };
        let path = dir.join(name);
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(contents)?;
                return Ok(path);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(HarnessError::Io(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("No free file name for {stem}.{ext} in {}", dir.display()),
    )))
}

fn local_host_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}
