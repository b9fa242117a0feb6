//! Declarative test material: commands, conditions and plans.
//!
//! All three tables are loaded once before a run and are read-only while it
//! executes. Steps reference commands and conditions by key; a dangling key is
//! not a load error, it becomes a failed step at run time. [`Catalog::dangling_references`]
//! lists them up front for the `check` subcommand.

pub mod command;
pub mod loader;
pub mod plan;

pub use command::{CommandSpec, CommandTable, ConditionTable};
pub use plan::{TestPlan, TestStep};

use crate::config::CatalogPaths;
use crate::error::{HarnessError, HarnessResult};
use std::collections::BTreeMap;

/// Everything a run needs from configuration files.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    /// Command table
    pub commands: CommandTable,
    /// Condition table
    pub conditions: ConditionTable,
    /// Test plans by name
    pub plans: BTreeMap<String, TestPlan>,
}

impl Catalog {
    /// Load all three catalog files.
    pub fn load(paths: &CatalogPaths) -> HarnessResult<Self> {
        Ok(Self {
            commands: loader::load_commands(&paths.commands)?,
            conditions: loader::load_conditions(&paths.conditions)?,
            plans: loader::load_plans(&paths.plans)?,
        })
    }

    /// Look up a plan that can actually be run.
    ///
    /// # Errors
    ///
    /// [`HarnessError::Configuration`] if the plan is unknown or has no steps.
    pub fn plan(&self, name: &str) -> HarnessResult<&TestPlan> {
        let plan = self.plans.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.plans.keys().map(String::as_str).collect();
            HarnessError::Configuration(format!(
                "Test plan '{name}' not found. Available: {}",
                known.join(", ")
            ))
        })?;
        if plan.is_empty() {
            return Err(HarnessError::Configuration(format!(
                "Test plan '{name}' has no steps"
            )));
        }
        Ok(plan)
    }

    /// Plan names in sorted order.
    pub fn plan_names(&self) -> impl Iterator<Item = &str> {
        self.plans.keys().map(String::as_str)
    }

    /// Human-readable list of keys referenced by a plan or command but not defined.
    pub fn dangling_references(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (key, spec) in self.commands.iter() {
            if let Some(condition) = &spec.condition {
                if !self.conditions.contains(condition) {
                    problems.push(format!(
                        "command {key} references unknown condition '{condition}'"
                    ));
                }
            }
        }
        for plan in self.plans.values() {
            for step in &plan.steps {
                match step {
                    TestStep::Command { name, command } if self.commands.get(command).is_none() => {
                        problems.push(format!(
                            "plan '{}' step {name} references unknown command '{command}'",
                            plan.name
                        ));
                    }
                    TestStep::ConditionCheck { name, condition }
                        if !self.conditions.contains(condition) =>
                    {
                        problems.push(format!(
                            "plan '{}' step {name} references unknown condition '{condition}'",
                            plan.name
                        ));
                    }
                    _ => {}
                }
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::Condition;

    fn catalog() -> Catalog {
        let mut catalog = Catalog::default();
        catalog.commands.insert(
            "001",
            CommandSpec {
                id: None,
                send: "sn_get".into(),
                expect: "[sn_get+ok]".into(),
                title: "Serial number".into(),
                condition: Some("device_sn".into()),
            },
        );
        catalog.conditions.insert(
            "battery",
            Condition::Between {
                low: 10.0.into(),
                high: 100.0.into(),
            },
        );
        catalog.plans.insert(
            "smoke".into(),
            TestPlan::new(
                "smoke",
                vec![
                    TestStep::Command {
                        name: "Step_1".into(),
                        command: "001".into(),
                    },
                    TestStep::Command {
                        name: "Step_2".into(),
                        command: "099".into(),
                    },
                ],
            ),
        );
        catalog.plans.insert("empty".into(), TestPlan::new("empty", vec![]));
        catalog
    }

    #[test]
    fn plan_lookup_rejects_missing_and_empty() {
        let catalog = catalog();
        assert!(catalog.plan("smoke").is_ok());
        assert!(catalog.plan("empty").unwrap_err().is_fatal());
        let err = catalog.plan("nightly").unwrap_err();
        assert!(err.to_string().contains("smoke"));
    }

    #[test]
    fn dangling_references_are_listed() {
        let problems = catalog().dangling_references();
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("device_sn"));
        assert!(problems[1].contains("'099'"));
    }
}
