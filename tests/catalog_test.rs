use std::fs;
use std::path::{Path, PathBuf};
use vent_harness::catalog::{loader, Catalog, TestStep};
use vent_harness::config::{CatalogPaths, HarnessConfig};
use vent_harness::error::HarnessError;
use vent_harness::validation::{validate, Condition};

fn shipped(file: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("config").join(file)
}

fn shipped_paths() -> CatalogPaths {
    CatalogPaths {
        commands: shipped("commands.yml"),
        conditions: shipped("conditions.yml"),
        plans: shipped("plans.yml"),
    }
}

#[test]
fn test_shipped_catalog_is_consistent() {
    let catalog = Catalog::load(&shipped_paths()).unwrap();
    assert!(catalog.plans.contains_key("Full Function"));
    assert!(catalog.plan("Identity").is_ok());
    assert!(
        catalog.dangling_references().is_empty(),
        "{:?}",
        catalog.dangling_references()
    );
}

#[test]
fn test_shipped_config_is_valid() {
    let config = HarnessConfig::load_from(shipped("harness.toml")).unwrap();
    config.validate().unwrap();
    assert_eq!(config.serial.baud_rate, 115_200);
    assert_eq!(config.probe.reboot_marker, "POST Check - Coin Bat.");
}

#[test]
fn test_plan_steps_from_yaml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plans.yml");
    fs::write(
        &path,
        r#"
plans:
  smoke:
    - command: "001"
    - condition: battery_level
      name: Battery in range
    - summary: Done
    - command: "002"
"#,
    )
    .unwrap();

    let plans = loader::load_plans(&path).unwrap();
    let smoke = &plans["smoke"];
    assert_eq!(
        smoke.steps,
        vec![
            TestStep::Command {
                name: "Step_1".into(),
                command: "001".into()
            },
            TestStep::ConditionCheck {
                name: "Battery in range".into(),
                condition: "battery_level".into()
            },
            TestStep::Summary {
                label: "Done".into()
            },
            TestStep::Command {
                name: "Step_4".into(),
                command: "002".into()
            },
        ]
    );
}

#[test]
fn test_step_with_two_kinds_fails_the_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plans.yml");
    fs::write(
        &path,
        "plans:\n  bad:\n    - command: \"001\"\n      summary: oops\n",
    )
    .unwrap();

    let err = loader::load_plans(&path).unwrap_err();
    assert!(matches!(err, HarnessError::Configuration(_)));
}

#[test]
fn test_conditions_from_yaml_validate_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conditions.yml");
    fs::write(
        &path,
        r#"
conditions:
  battery_level:
    condition: between
    low: 20
    high: 100
  wifi_mac:
    condition: mac_address
    valid_prefixes: ["9C:65"]
  fw:
    condition: text_equal
    expected: 1.0.236
"#,
    )
    .unwrap();

    let conditions = loader::load_conditions(&path).unwrap();
    let battery = conditions.get("battery_level").unwrap();
    assert!(validate("20", battery));
    assert!(!validate("19.9", battery));

    let mac = conditions.get("wifi_mac").unwrap();
    assert!(validate("9C:65:F9:3C:A1:9B", mac));
    assert!(!validate("00:1A:F9:3C:A1:9B", mac));

    assert_eq!(
        conditions.get("fw"),
        Some(&Condition::TextEqual {
            expected: "1.0.236".into()
        })
    );
}
