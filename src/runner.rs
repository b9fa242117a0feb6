//! Test runner: executes a plan step by step and records the results.
//!
//! Steps run strictly in order. Nothing that happens on the wire aborts a
//! run: timeouts, lookup misses and link failures all become failed results,
//! and a timeout additionally asks the monitor for a fresh connection cycle.
//! Only configuration problems (unknown or empty plan) are returned as errors,
//! and those are raised before any device I/O.

use crate::catalog::{Catalog, TestPlan, TestStep};
use crate::config::HarnessConfig;
use crate::connection::MonitorHandle;
use crate::error::{HarnessError, HarnessResult};
use crate::session::{DeviceInfo, Judgement, Outcome, RunSession, StepResult};
use crate::transport::{judge, CommandOutcome, CommandTransport, ValueCheck, Verdict};
use crate::validation::{self, Parameters};
use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};

/// Runner pacing.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Plan repetitions, at least 1
    pub cycles: u32,
    /// Pause after every step
    pub settle_delay: Duration,
    /// Wait for one response line
    pub command_timeout: Duration,
    /// Wait for the monitor to be connected
    pub connect_timeout: Duration,
}

impl RunnerSettings {
    /// Take the timing section of the config and a cycle count.
    pub fn from_config(config: &HarnessConfig, cycles: u32) -> Self {
        Self {
            cycles: cycles.max(1),
            settle_delay: config.timing.settle_delay,
            command_timeout: config.timing.command_timeout,
            connect_timeout: config.timing.connect_timeout,
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from_config(&HarnessConfig::default(), 1)
    }
}

/// Step context shared by every result a step produces.
struct StepContext<'a> {
    step: &'a str,
    title: &'a str,
    command: Option<&'a str>,
    cycle: u32,
    timestamp: DateTime<Local>,
    started: Instant,
}

impl StepContext<'_> {
    fn result(&self, verdict: Verdict) -> StepResult {
        StepResult {
            step: self.step.to_string(),
            title: self.title.to_string(),
            command: self.command.map(str::to_string),
            expected: verdict.expected,
            actual: verdict.actual,
            outcome: verdict.outcome,
            judgement: verdict.judgement,
            cycle: self.cycle,
            timestamp: self.timestamp,
            duration: self.started.elapsed(),
            note: verdict.note,
        }
    }

    fn failure(&self, judgement: Judgement, expected: &str, actual: &str, note: String) -> StepResult {
        self.result(Verdict {
            judgement,
            expected: expected.to_string(),
            actual: actual.to_string(),
            outcome: Outcome::Fail,
            note: Some(note),
        })
    }
}

/// Runs plans against one device.
pub struct TestRunner {
    catalog: Arc<Catalog>,
    transport: CommandTransport,
    device: DeviceInfo,
    params: Parameters,
    settings: RunnerSettings,
    port: String,
}

impl TestRunner {
    /// Create a runner talking through `monitor`.
    ///
    /// `port` is only used to label the session.
    pub fn new(
        catalog: Arc<Catalog>,
        monitor: MonitorHandle,
        device: DeviceInfo,
        settings: RunnerSettings,
        port: impl Into<String>,
    ) -> Self {
        let transport = CommandTransport::new(
            catalog.clone(),
            monitor,
            settings.command_timeout,
            settings.connect_timeout,
        );
        let params = device.parameters();
        Self {
            catalog,
            transport,
            device,
            params,
            settings,
            port: port.into(),
        }
    }

    /// Look up a plan by name and run it.
    ///
    /// # Errors
    ///
    /// [`HarnessError::Configuration`] when the plan is unknown or empty.
    pub async fn run_named_plan(&self, name: &str) -> HarnessResult<RunSession> {
        let plan = self.catalog.plan(name)?.clone();
        Ok(self.run_plan(&plan).await)
    }

    /// Run every step of `plan`, `cycles` times, and return the finished session.
    pub async fn run_plan(&self, plan: &TestPlan) -> RunSession {
        let mut session = RunSession::new(
            plan.name.clone(),
            self.device.clone(),
            self.port.clone(),
            self.settings.cycles,
        );
        info!(
            plan = %plan.name,
            steps = plan.steps.len(),
            cycles = self.settings.cycles,
            run_id = %session.run_id,
            "Starting test plan"
        );

        for cycle in 1..=self.settings.cycles {
            // Last response value, for condition steps
            let mut last_value: Option<String> = None;
            for step in &plan.steps {
                let span = info_span!("step", name = step.name(), cycle);
                self.run_step(step, cycle, &mut last_value, &mut session)
                    .instrument(span)
                    .await;
                if !self.settings.settle_delay.is_zero() {
                    tokio::time::sleep(self.settings.settle_delay).await;
                }
            }
        }

        session.finish();
        info!(
            plan = %plan.name,
            total = session.total(),
            passed = session.passed(),
            failed = session.failed(),
            "Test plan finished"
        );
        session
    }

    async fn run_step(
        &self,
        step: &TestStep,
        cycle: u32,
        last_value: &mut Option<String>,
        session: &mut RunSession,
    ) {
        match step {
            TestStep::Command { name, command } => {
                self.run_command(name, command, cycle, last_value, session)
                    .await
            }
            TestStep::ConditionCheck { name, condition } => {
                let result = self.run_condition(name, condition, cycle, last_value.as_deref());
                log_result(&result);
                session.record(result);
            }
            TestStep::Summary { label } => {
                info!(%label, "Summary");
                session.mark(label.clone(), cycle);
            }
        }
    }

    async fn run_command(
        &self,
        name: &str,
        key: &str,
        cycle: u32,
        last_value: &mut Option<String>,
        session: &mut RunSession,
    ) {
        let spec = self.catalog.commands.get(key);
        let ctx = StepContext {
            step: name,
            title: spec.map_or(name, |s| s.title.as_str()),
            command: spec.map(|s| s.send.as_str()),
            cycle,
            timestamp: Local::now(),
            started: Instant::now(),
        };

        let results = match self.transport.send_command(key).await {
            CommandOutcome::Response(response) => match spec {
                Some(spec) => {
                    *last_value =
                        (!response.remainder.is_empty()).then(|| response.remainder.clone());
                    let check =
                        ValueCheck::for_command(spec, &self.catalog.conditions, &self.params);
                    judge(spec, &response, &check)
                        .into_iter()
                        .map(|verdict| ctx.result(verdict))
                        .collect()
                }
                None => vec![ctx.failure(
                    Judgement::Transport,
                    "",
                    &response.line,
                    HarnessError::UnknownCommand(key.to_string()).to_string(),
                )],
            },
            CommandOutcome::Timeout(limit) => {
                *last_value = None;
                let expected = spec.map_or("", |s| s.expect.as_str());
                let result = ctx.failure(
                    Judgement::Transport,
                    expected,
                    "<no response>",
                    HarnessError::Timeout(limit).to_string(),
                );
                if let Err(e) = self.transport.monitor().request_reconnect().await {
                    warn!(error = %e, "Could not request reconnect");
                }
                vec![result]
            }
            CommandOutcome::NotFound => vec![ctx.failure(
                Judgement::Transport,
                "",
                "",
                HarnessError::UnknownCommand(key.to_string()).to_string(),
            )],
            CommandOutcome::Unavailable(reason) => {
                *last_value = None;
                let expected = spec.map_or("", |s| s.expect.as_str());
                vec![ctx.failure(Judgement::Transport, expected, "<no response>", reason)]
            }
        };

        for result in results {
            log_result(&result);
            session.record(result);
        }
    }

    fn run_condition(
        &self,
        name: &str,
        key: &str,
        cycle: u32,
        last_value: Option<&str>,
    ) -> StepResult {
        let ctx = StepContext {
            step: name,
            title: name,
            command: None,
            cycle,
            timestamp: Local::now(),
            started: Instant::now(),
        };
        let actual = last_value.unwrap_or("");

        let Some(condition) = self.catalog.conditions.get(key) else {
            return ctx.failure(
                Judgement::Condition,
                key,
                actual,
                HarnessError::UnknownCondition(key.to_string()).to_string(),
            );
        };
        let condition = match condition.resolve(&self.params) {
            Ok(condition) => condition,
            Err(e) => return ctx.failure(Judgement::Condition, key, actual, e.to_string()),
        };
        let Some(value) = last_value else {
            return ctx.failure(
                Judgement::Condition,
                &condition.to_string(),
                "",
                "No value observed before this check".to_string(),
            );
        };

        ctx.result(Verdict {
            judgement: Judgement::Condition,
            expected: condition.to_string(),
            actual: value.to_string(),
            outcome: Outcome::from_bool(validation::validate(value, &condition)),
            note: None,
        })
    }
}

fn log_result(result: &StepResult) {
    match result.outcome {
        Outcome::Pass => info!(
            title = %result.title,
            judgement = ?result.judgement,
            actual = %result.actual,
            "PASS"
        ),
        Outcome::Fail => warn!(
            title = %result.title,
            judgement = ?result.judgement,
            expected = %result.expected,
            actual = %result.actual,
            note = result.note.as_deref().unwrap_or(""),
            "FAIL"
        ),
    }
}
