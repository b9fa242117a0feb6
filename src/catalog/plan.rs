//! Test plans: ordered sequences of steps.

use crate::error::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One step of a plan. The kind is fixed at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TestStep {
    /// Send a command from the command table and judge the response.
    Command {
        /// Step name shown in the report
        name: String,
        /// Key into the command table
        command: String,
    },
    /// Check the last observed value against a condition.
    ConditionCheck {
        /// Step name shown in the report
        name: String,
        /// Key into the condition table
        condition: String,
    },
    /// Informational marker; nothing is sent or scored.
    Summary {
        /// Marker text
        label: String,
    },
}

impl TestStep {
    /// Step name (the label for summaries).
    pub fn name(&self) -> &str {
        match self {
            TestStep::Command { name, .. } | TestStep::ConditionCheck { name, .. } => name,
            TestStep::Summary { label } => label,
        }
    }

    /// Whether the step talks to the device.
    pub fn uses_device(&self) -> bool {
        matches!(self, TestStep::Command { .. })
    }
}

impl fmt::Display for TestStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestStep::Command { name, command } => write!(f, "{name} (command {command})"),
            TestStep::ConditionCheck { name, condition } => {
                write!(f, "{name} (condition {condition})")
            }
            TestStep::Summary { label } => write!(f, "summary: {label}"),
        }
    }
}

/// Step as written in `plans.yml`: exactly one of `command`, `condition`, `summary`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawStep {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    summary: Option<String>,
}

impl RawStep {
    /// Convert to a typed step. `index` is zero-based.
    pub(crate) fn into_step(self, plan: &str, index: usize) -> HarnessResult<TestStep> {
        let name = self
            .name
            .unwrap_or_else(|| format!("Step_{}", index + 1));
        match (self.command, self.condition, self.summary) {
            (Some(command), None, None) => Ok(TestStep::Command { name, command }),
            (None, Some(condition), None) => Ok(TestStep::ConditionCheck { name, condition }),
            (None, None, Some(label)) => Ok(TestStep::Summary { label }),
            _ => Err(HarnessError::Configuration(format!(
                "Plan '{plan}' step {}: expected exactly one of command, condition or summary",
                index + 1
            ))),
        }
    }
}

/// Named, ordered list of steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestPlan {
    /// Plan name, as selected on the command line
    pub name: String,
    /// Steps in execution order
    pub steps: Vec<TestStep>,
}

impl TestPlan {
    /// Build a plan from typed steps.
    pub fn new(name: impl Into<String>, steps: Vec<TestStep>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    pub(crate) fn from_raw(name: String, raw: Vec<RawStep>) -> HarnessResult<Self> {
        let steps = raw
            .into_iter()
            .enumerate()
            .map(|(i, step)| step.into_step(&name, i))
            .collect::<HarnessResult<Vec<_>>>()?;
        Ok(Self { name, steps })
    }

    /// Number of steps that send a command.
    pub fn command_count(&self) -> usize {
        self.steps.iter().filter(|s| s.uses_device()).count()
    }

    /// Whether the plan has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
