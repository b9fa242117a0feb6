//! YAML loading for the command table, condition table and test plans.
//!
//! ```rust,ignore
//! use vent_harness::catalog::loader::load_plans;
//! use std::path::Path;
//!
//! let plans = load_plans(Path::new("config/plans.yml"))?;
//! ```

use super::command::{CommandTable, ConditionTable};
use super::plan::{RawStep, TestPlan};
use crate::error::{HarnessError, HarnessResult};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

#[derive(Deserialize)]
struct CommandFile {
    commands: CommandTable,
}

#[derive(Deserialize)]
struct ConditionFile {
    #[serde(default)]
    conditions: ConditionTable,
}

#[derive(Deserialize)]
struct PlanFile {
    plans: BTreeMap<String, Vec<RawStep>>,
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> HarnessResult<T> {
    if !path.exists() {
        return Err(HarnessError::Configuration(format!(
            "Catalog file not found: {}",
            path.display()
        )));
    }
    debug!("Loading catalog file: {}", path.display());

    let text = std::fs::read_to_string(path).map_err(|e| {
        HarnessError::Configuration(format!("Failed to read {}: {}", path.display(), e))
    })?;
    serde_yaml::from_str(&text).map_err(|source| HarnessError::Yaml {
        path: path.display().to_string(),
        source,
    })
}

/// Load the `commands:` mapping.
pub fn load_commands(path: &Path) -> HarnessResult<CommandTable> {
    let table = read_yaml::<CommandFile>(path)?.commands;
    info!("Loaded {} commands from {}", table.len(), path.display());
    Ok(table)
}

/// Load the `conditions:` mapping.
pub fn load_conditions(path: &Path) -> HarnessResult<ConditionTable> {
    let table = read_yaml::<ConditionFile>(path)?.conditions;
    info!("Loaded {} conditions from {}", table.len(), path.display());
    Ok(table)
}

/// Load every plan in the `plans:` mapping.
///
/// A step that names more or less than one of `command`, `condition` and
/// `summary` fails the whole load.
pub fn load_plans(path: &Path) -> HarnessResult<BTreeMap<String, TestPlan>> {
    let file: PlanFile = read_yaml(path)?;
    let plans = file
        .plans
        .into_iter()
        .map(|(name, raw)| Ok((name.clone(), TestPlan::from_raw(name, raw)?)))
        .collect::<HarnessResult<BTreeMap<_, _>>>()?;
    info!("Loaded {} test plans from {}", plans.len(), path.display());
    Ok(plans)
}
