//! Plain-text test report.
//!
//! [`Report::generate`] snapshots a finished [`RunSession`]; [`Report::render`]
//! turns it into text with three sections:
//!
//! - **Environment**: unit identity, plan, port, host, run id, start/finish
//! - **Part A: Summary**: counts, pass probability, cycles, duration
//! - **Part B: Detail**: passed items, then failed items, each in execution
//!   order, followed by the summary markers
//!
//! Rendering is deterministic for a given session.

use crate::error::HarnessResult;
use crate::session::{file_safe, write_new_file, RunSession, StepResult, SummaryMarker};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

const RULE: &str = "============================================================";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Report built from one session.
#[derive(Debug, Clone)]
pub struct Report {
    session: RunSession,
}

impl Report {
    /// Build a report for `session`.
    pub fn generate(session: &RunSession) -> Self {
        Self {
            session: session.clone(),
        }
    }

    /// Session the report describes.
    pub fn session(&self) -> &RunSession {
        &self.session
    }

    /// Report file name: `Test_Report_<plan>_<YYYYmmdd_HHMMSS>.txt`.
    pub fn file_name(&self) -> String {
        format!("{}.txt", self.file_stem())
    }

    fn file_stem(&self) -> String {
        let stamp = self
            .session
            .finished
            .unwrap_or(self.session.started)
            .format("%Y%m%d_%H%M%S");
        format!("Test_Report_{}_{}", file_safe(&self.session.plan), stamp)
    }

    /// Render the full report text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail
        let _ = self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) -> std::fmt::Result {
        let s = &self.session;

        writeln!(out, "{RULE}")?;
        writeln!(out, "Ventilator UART Test Report")?;
        writeln!(out, "{RULE}")?;
        writeln!(out)?;

        writeln!(out, "Environment")?;
        writeln!(out, "  Test Plan:      {}", s.plan)?;
        writeln!(out, "  Device SN:      {}", s.device.serial_number)?;
        writeln!(out, "  FW Version:     {}", s.device.fw_version)?;
        writeln!(out, "  SW Version:     {}", s.device.sw_version)?;
        writeln!(out, "  WiFi Version:   {}", s.device.wifi_version)?;
        for (key, value) in &s.device.extra {
            writeln!(out, "  {:<15} {}", format!("{key}:"), value)?;
        }
        writeln!(out, "  Serial Port:    {}", s.port)?;
        writeln!(out, "  Host:           {}", s.host)?;
        writeln!(out, "  Run ID:         {}", s.run_id)?;
        writeln!(out, "  Started:        {}", s.started.format(TIME_FORMAT))?;
        match s.finished {
            Some(finished) => writeln!(out, "  Finished:       {}", finished.format(TIME_FORMAT))?,
            None => writeln!(out, "  Finished:       -")?,
        }
        writeln!(out)?;

        writeln!(out, "Part A: Summary")?;
        writeln!(out, "  Total Items:      {}", s.total())?;
        writeln!(out, "  Passed Items:     {}", s.passed())?;
        writeln!(out, "  Failed Items:     {}", s.failed())?;
        writeln!(out, "  Pass Probability: {:.2}%", s.pass_rate())?;
        writeln!(out, "  Test Cycle:       {}", s.cycles)?;
        writeln!(out, "  Duration:         {}", format_duration(s.duration()))?;
        writeln!(out)?;

        writeln!(out, "Part B: Detail")?;
        writeln!(out, "Passed Items:")?;
        let passed: Vec<&StepResult> = s.results.iter().filter(|r| r.outcome.is_pass()).collect();
        write_items(out, &passed)?;
        writeln!(out)?;

        writeln!(out, "Failed Items:")?;
        let failed: Vec<&StepResult> = s.results.iter().filter(|r| !r.outcome.is_pass()).collect();
        write_items(out, &failed)?;

        if !s.markers.is_empty() {
            writeln!(out)?;
            writeln!(out, "Summary Markers:")?;
            for marker in &s.markers {
                write_marker(out, marker)?;
            }
        }
        writeln!(out, "{RULE}")
    }

    /// Write the report into `dir` as a new file and return its path.
    ///
    /// An existing report is never appended to or replaced; a taken name
    /// gets a `_2`, `_3`, ... suffix instead.
    pub fn write_to(&self, dir: &Path) -> HarnessResult<PathBuf> {
        let path = write_new_file(dir, &self.file_stem(), "txt", self.render().as_bytes())?;
        info!(path = %path.display(), "Test report written");
        Ok(path)
    }
}

fn write_items(out: &mut String, items: &[&StepResult]) -> std::fmt::Result {
    if items.is_empty() {
        return writeln!(out, "  (none)");
    }
    for result in items {
        writeln!(out, "  - Item Name:  {} [{}]", result.title, result.step)?;
        if let Some(command) = &result.command {
            writeln!(out, "    Command:    {command}")?;
        }
        writeln!(out, "    Expected:   {}", result.expected)?;
        writeln!(out, "    Actual:     {}", result.actual)?;
        writeln!(
            out,
            "    Result:     {} ({:?}, cycle {})",
            result.outcome, result.judgement, result.cycle
        )?;
        writeln!(out, "    Test Time:  {}", result.timestamp.format(TIME_FORMAT))?;
        if let Some(note) = &result.note {
            writeln!(out, "    Note:       {note}")?;
        }
    }
    Ok(())
}

fn write_marker(out: &mut String, marker: &SummaryMarker) -> std::fmt::Result {
    writeln!(
        out,
        "  - {} (cycle {}, after {} items, {})",
        marker.label,
        marker.cycle,
        marker.position,
        marker.timestamp.format(TIME_FORMAT)
    )
}

/// `H:MM:SS`, hours unpadded. Negative durations render as zero.
pub fn format_duration(duration: chrono::Duration) -> String {
    let total = duration.num_seconds().max(0);
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_format() {
        assert_eq!(format_duration(chrono::Duration::zero()), "0:00:00");
        assert_eq!(format_duration(chrono::Duration::seconds(3)), "0:00:03");
        assert_eq!(format_duration(chrono::Duration::seconds(3725)), "1:02:05");
        assert_eq!(format_duration(chrono::Duration::seconds(-5)), "0:00:00");
    }
}
