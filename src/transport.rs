//! Command transport: one command out, one response line back.
//!
//! [`CommandTransport::send_command`] looks the command up, hands it to the
//! connection monitor and classifies what came back. [`judge`] then turns a
//! response into one or two verdicts: the prefix first, and the value only if
//! the prefix matched and the command carries a condition.

use crate::catalog::{Catalog, CommandSpec, ConditionTable};
use crate::connection::MonitorHandle;
use crate::error::HarnessError;
use crate::session::{Judgement, Outcome};
use crate::validation::{self, Condition, Parameters};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A response line split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedResponse {
    /// Full line as received
    pub line: String,
    /// First whitespace-delimited token
    pub prefix: String,
    /// Everything after the prefix, trimmed
    pub remainder: String,
    /// Time from send to response
    pub elapsed: Duration,
}

impl ObservedResponse {
    /// Split `line` and record how long it took.
    pub fn new(line: impl Into<String>, elapsed: Duration) -> Self {
        let line = line.into();
        let (prefix, remainder) = split_response(&line);
        Self {
            prefix: prefix.to_string(),
            remainder: remainder.to_string(),
            line,
            elapsed,
        }
    }
}

/// Split at the first whitespace. Without whitespace the prefix is the whole line.
pub fn split_response(line: &str) -> (&str, &str) {
    let line = line.trim();
    match line.split_once(char::is_whitespace) {
        Some((prefix, rest)) => (prefix, rest.trim()),
        None => (line, ""),
    }
}

/// Result of sending one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The device answered
    Response(ObservedResponse),
    /// No line arrived in time
    Timeout(Duration),
    /// The key is not in the command table; nothing was sent
    NotFound,
    /// The monitor could not serve the request
    Unavailable(String),
}

/// How the value part of a response will be judged.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueCheck {
    /// Command has no condition
    None,
    /// Resolved condition
    Condition(Condition),
    /// Condition configured but unusable; the value judgement fails with this note
    Unresolved(String),
}

impl ValueCheck {
    /// Look up and resolve the condition a command refers to.
    pub fn for_command(spec: &CommandSpec, conditions: &ConditionTable, params: &Parameters) -> Self {
        let Some(key) = &spec.condition else {
            return ValueCheck::None;
        };
        match conditions.get(key) {
            None => ValueCheck::Unresolved(HarnessError::UnknownCondition(key.clone()).to_string()),
            Some(condition) => match condition.resolve(params) {
                Ok(resolved) => ValueCheck::Condition(resolved),
                Err(e) => ValueCheck::Unresolved(e.to_string()),
            },
        }
    }
}

/// One judgement on a response, before step context is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// What was judged
    pub judgement: Judgement,
    /// Expected prefix or condition
    pub expected: String,
    /// Observed prefix or value
    pub actual: String,
    /// Verdict
    pub outcome: Outcome,
    /// Diagnostic for non-comparison failures
    pub note: Option<String>,
}

/// Judge a response: prefix first, then the value if there is one to check.
///
/// A prefix mismatch short-circuits, so the result holds one or two verdicts.
pub fn judge(spec: &CommandSpec, response: &ObservedResponse, check: &ValueCheck) -> Vec<Verdict> {
    let prefix_ok = response.prefix == spec.expect;
    let mut verdicts = vec![Verdict {
        judgement: Judgement::Prefix,
        expected: spec.expect.clone(),
        actual: response.prefix.clone(),
        outcome: Outcome::from_bool(prefix_ok),
        note: (!prefix_ok).then(|| {
            HarnessError::ProtocolMismatch {
                expected: spec.expect.clone(),
                actual: response.prefix.clone(),
            }
            .to_string()
        }),
    }];
    if !prefix_ok || response.remainder.is_empty() {
        return verdicts;
    }

    match check {
        ValueCheck::None => {}
        ValueCheck::Condition(condition) => verdicts.push(Verdict {
            judgement: Judgement::Value,
            expected: condition.to_string(),
            actual: response.remainder.clone(),
            outcome: Outcome::from_bool(validation::validate(&response.remainder, condition)),
            note: None,
        }),
        ValueCheck::Unresolved(reason) => verdicts.push(Verdict {
            judgement: Judgement::Value,
            expected: spec.condition.clone().unwrap_or_default(),
            actual: response.remainder.clone(),
            outcome: Outcome::Fail,
            note: Some(reason.clone()),
        }),
    }
    verdicts
}

/// Sends catalog commands through the connection monitor.
#[derive(Clone)]
pub struct CommandTransport {
    catalog: Arc<Catalog>,
    monitor: MonitorHandle,
    command_timeout: Duration,
    connect_timeout: Duration,
}

impl CommandTransport {
    /// Create a transport.
    ///
    /// `command_timeout` bounds the wait for a response line,
    /// `connect_timeout` the wait for the monitor to be `Connected`.
    pub fn new(
        catalog: Arc<Catalog>,
        monitor: MonitorHandle,
        command_timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            monitor,
            command_timeout,
            connect_timeout,
        }
    }

    /// Send the command stored under `key` and wait for its response.
    pub async fn send_command(&self, key: &str) -> CommandOutcome {
        let Some(spec) = self.catalog.commands.get(key) else {
            warn!(key, "Command not found in command table");
            return CommandOutcome::NotFound;
        };

        if let Err(e) = self.monitor.wait_connected(self.connect_timeout).await {
            warn!(command = spec.label(), error = %e, "Device not connected");
            return CommandOutcome::Unavailable(format!("Device not connected: {e}"));
        }

        let started = Instant::now();
        match self.monitor.send_line(&spec.send, self.command_timeout).await {
            Ok(line) => {
                let response = ObservedResponse::new(line, started.elapsed());
                debug!(
                    command = spec.label(),
                    prefix = %response.prefix,
                    value = %response.remainder,
                    "Command answered"
                );
                CommandOutcome::Response(response)
            }
            Err(HarnessError::Timeout(limit)) => {
                warn!(command = spec.label(), "No response within {:?}", limit);
                CommandOutcome::Timeout(limit)
            }
            Err(e) => {
                warn!(
                    command = spec.label(),
                    category = e.category(),
                    error = %e,
                    "Command could not be exchanged"
                );
                CommandOutcome::Unavailable(e.to_string())
            }
        }
    }

    /// Monitor this transport talks through.
    pub fn monitor(&self) -> &MonitorHandle {
        &self.monitor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(condition: Option<&str>) -> CommandSpec {
        CommandSpec {
            id: Some("Get_SN_Number".into()),
            send: "sn_get".into(),
            expect: "[sn_get+ok]".into(),
            title: "Serial number".into(),
            condition: condition.map(Into::into),
        }
    }

    fn response(line: &str) -> ObservedResponse {
        ObservedResponse::new(line, Duration::from_millis(5))
    }

    #[test]
    fn split_at_first_whitespace() {
        assert_eq!(split_response("[a+ok] 1 2 3"), ("[a+ok]", "1 2 3"));
        assert_eq!(split_response("[a+ok]"), ("[a+ok]", ""));
        assert_eq!(split_response("[a+ok]\t 42 \r"), ("[a+ok]", "42"));
    }

    #[test]
    fn prefix_match_is_case_sensitive() {
        let verdicts = judge(&spec(None), &response("[SN_GET+OK] 123"), &ValueCheck::None);
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].outcome, Outcome::Fail);
        assert!(verdicts[0].note.as_deref().unwrap().contains("[SN_GET+OK]"));
    }

    #[test]
    fn prefix_mismatch_skips_value_check() {
        let check = ValueCheck::Condition(Condition::TextEqual {
            expected: "123".into(),
        });
        let verdicts = judge(&spec(Some("sn")), &response("[sn_get+err] 123"), &check);
        assert_eq!(verdicts.len(), 1);
    }

    #[test]
    fn matching_prefix_and_value_yield_two_verdicts() {
        let check = ValueCheck::Condition(Condition::TextEqual {
            expected: "1212324500026".into(),
        });
        let verdicts = judge(
            &spec(Some("device_sn")),
            &response("[sn_get+ok] 1212324500026"),
            &check,
        );
        assert_eq!(verdicts.len(), 2);
        assert_eq!(verdicts[0].judgement, Judgement::Prefix);
        assert_eq!(verdicts[1].judgement, Judgement::Value);
        assert!(verdicts.iter().all(|v| v.outcome == Outcome::Pass));
    }

    #[test]
    fn empty_remainder_is_not_judged() {
        let check = ValueCheck::Condition(Condition::Equal {
            expected: "1".into(),
        });
        let verdicts = judge(&spec(Some("x")), &response("[sn_get+ok]"), &check);
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].outcome, Outcome::Pass);
    }

    #[test]
    fn unknown_condition_fails_the_value() {
        let conditions = ConditionTable::default();
        let check = ValueCheck::for_command(&spec(Some("ghost")), &conditions, &Parameters::new());
        let verdicts = judge(&spec(Some("ghost")), &response("[sn_get+ok] 1"), &check);
        assert_eq!(verdicts.len(), 2);
        assert_eq!(verdicts[1].outcome, Outcome::Fail);
        assert!(verdicts[1].note.as_deref().unwrap().contains("ghost"));
    }

    #[test]
    fn value_check_resolves_device_parameters() {
        let mut conditions = ConditionTable::default();
        conditions.insert(
            "device_sn",
            Condition::TextEqual {
                expected: "${device_sn}".into(),
            },
        );
        let mut params = Parameters::new();
        params.insert("device_sn".into(), "42".into());

        let check = ValueCheck::for_command(&spec(Some("device_sn")), &conditions, &params);
        assert_eq!(
            check,
            ValueCheck::Condition(Condition::TextEqual {
                expected: "42".into()
            })
        );

        let missing = ValueCheck::for_command(&spec(Some("device_sn")), &conditions, &Parameters::new());
        assert!(matches!(missing, ValueCheck::Unresolved(_)));
    }
}
