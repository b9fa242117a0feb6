//! Command table: what to send and what prefix to expect back.

use crate::validation::Condition;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One UART command definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Symbolic name (e.g. `Get_SN_Number`), used in logs only
    #[serde(default)]
    pub id: Option<String>,
    /// Raw command text, written without terminator
    pub send: String,
    /// Exact prefix the first response token must equal
    pub expect: String,
    /// Human-readable title for the report
    pub title: String,
    /// Key into the condition table for the response value
    #[serde(default)]
    pub condition: Option<String>,
}

impl CommandSpec {
    /// Name used in log lines: the symbolic id if present, else the raw command.
    pub fn label(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.send)
    }
}

/// Command specs keyed by their number (`"001"`, `"002"`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTable(BTreeMap<String, CommandSpec>);

impl CommandTable {
    /// Look up a command by key.
    pub fn get(&self, key: &str) -> Option<&CommandSpec> {
        self.0.get(key)
    }

    /// Add or replace a command.
    pub fn insert(&mut self, key: impl Into<String>, spec: CommandSpec) {
        self.0.insert(key.into(), spec);
    }

    /// Number of commands.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the table has no commands.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &CommandSpec)> {
        self.0.iter()
    }
}

impl FromIterator<(String, CommandSpec)> for CommandTable {
    fn from_iter<I: IntoIterator<Item = (String, CommandSpec)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Conditions keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionTable(BTreeMap<String, Condition>);

impl ConditionTable {
    /// Look up a condition by key.
    pub fn get(&self, key: &str) -> Option<&Condition> {
        self.0.get(key)
    }

    /// Add or replace a condition.
    pub fn insert(&mut self, key: impl Into<String>, condition: Condition) {
        self.0.insert(key.into(), condition);
    }

    /// Whether `key` is defined.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of conditions.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the table has no conditions.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Condition)> for ConditionTable {
    fn from_iter<I: IntoIterator<Item = (String, Condition)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
