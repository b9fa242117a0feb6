//! CLI entry point for the ventilator UART test harness.
//!
//! # Usage
//!
//! Run a plan against a unit:
//! ```bash
//! vent_harness run --plan "Full Function" --sn 1212324500026 \
//!     --fw 1.0.236 --sw 2.1.0 --wifi 0.9.7
//! ```
//!
//! Check the catalogs without touching the device:
//! ```bash
//! vent_harness check
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use vent_harness::catalog::Catalog;
use vent_harness::config::{HarnessConfig, DEFAULT_CONFIG_PATH};
use vent_harness::connection::{ConnectionMonitor, MonitorSettings};
use vent_harness::report::Report;
use vent_harness::runner::{RunnerSettings, TestRunner};
use vent_harness::serial::{PortOpener, SerialPortOpener};
use vent_harness::session::DeviceInfo;
use vent_harness::tracing_setup::{self, TracingConfig};

#[derive(Parser)]
#[command(name = "vent_harness")]
#[command(about = "Automated UART test harness for ventilator units", long_about = None)]
struct Cli {
    /// Harness configuration file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the serial port from the config file
    #[arg(long, global = true)]
    port: Option<String>,

    /// Override the log format (pretty, compact, json)
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// Log how long each plan step took
    #[arg(long, global = true)]
    step_timing: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a test plan against the connected unit
    Run {
        /// Plan name from the plans catalog
        #[arg(long)]
        plan: String,

        /// Device serial number
        #[arg(long)]
        sn: String,

        /// Firmware version
        #[arg(long)]
        fw: String,

        /// Software (LCM) version
        #[arg(long)]
        sw: String,

        /// Wi-Fi module version
        #[arg(long)]
        wifi: String,

        /// Extra condition parameter, `key=value` (repeatable)
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,

        /// Number of times to run the plan
        #[arg(long, default_value = "1")]
        cycles: u32,

        /// Report directory (defaults to the config value)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Load config and catalogs and report problems, without device I/O
    Check,

    /// List the available test plans
    ListPlans,

    /// Connect to the unit and run the liveness probe only
    Probe,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=value: no `=` found in `{s}`"))?;
    if key.trim().is_empty() {
        return Err(format!("invalid KEY=value: empty key in `{s}`"));
    }
    Ok((key.trim().to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = HarnessConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(port) = &cli.port {
        config.serial.port = port.clone();
    }
    if let Some(format) = &cli.log_format {
        config.application.log_format = format.to_lowercase();
    }
    config.validate()?;
    tracing_setup::init(
        TracingConfig::from_harness_config(&config)?.with_step_timing(cli.step_timing),
    )?;

    match cli.command {
        Commands::Run {
            plan,
            sn,
            fw,
            sw,
            wifi,
            params,
            cycles,
            output,
        } => {
            let device = DeviceInfo {
                serial_number: sn,
                fw_version: fw,
                sw_version: sw,
                wifi_version: wifi,
                extra: params.into_iter().collect::<BTreeMap<_, _>>(),
            };
            run_plan(config, &plan, device, cycles, output).await
        }
        Commands::Check => check(&config),
        Commands::ListPlans => list_plans(&config),
        Commands::Probe => probe(&config).await,
    }
}

async fn run_plan(
    config: HarnessConfig,
    plan: &str,
    device: DeviceInfo,
    cycles: u32,
    output: Option<PathBuf>,
) -> Result<ExitCode> {
    device.validate()?;
    let catalog = Arc::new(Catalog::load(&config.catalog)?);
    // Fail on a bad plan before opening the port
    catalog.plan(plan)?;

    let opener = SerialPortOpener::from_config(&config.serial);
    let port_name = opener.describe();
    let monitor = ConnectionMonitor::spawn(Arc::new(opener), MonitorSettings::from_config(&config)?);
    let runner = TestRunner::new(
        catalog,
        monitor.clone(),
        device,
        RunnerSettings::from_config(&config, cycles),
        port_name,
    );

    let session = tokio::select! {
        session = runner.run_named_plan(plan) => session,
        _ = signal::ctrl_c() => {
            warn!("Interrupted, stopping connection monitor");
            monitor.shutdown().await;
            bail!("Run interrupted before completion");
        }
    };
    monitor.shutdown().await;
    let session = session?;

    let dir = output.unwrap_or_else(|| config.report.output_dir.clone());
    if config.report.save_session_json {
        let json = session.save_json(&dir)?;
        info!(path = %json.display(), "Session saved");
    }
    let report = Report::generate(&session);
    let path = report.write_to(&dir)?;

    println!("{}", report.render());
    println!("Report written to {}", path.display());

    Ok(if session.failed() == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn check(config: &HarnessConfig) -> Result<ExitCode> {
    let catalog = Catalog::load(&config.catalog)?;
    println!(
        "{} commands, {} conditions, {} plans",
        catalog.commands.len(),
        catalog.conditions.len(),
        catalog.plans.len()
    );

    let problems = catalog.dangling_references();
    if problems.is_empty() {
        println!("No problems found");
        return Ok(ExitCode::SUCCESS);
    }
    for problem in &problems {
        println!("  - {problem}");
    }
    Ok(ExitCode::FAILURE)
}

fn list_plans(config: &HarnessConfig) -> Result<ExitCode> {
    let catalog = Catalog::load(&config.catalog)?;
    for plan in catalog.plans.values() {
        println!(
            "{:<30} {:>3} steps, {:>3} commands",
            plan.name,
            plan.steps.len(),
            plan.command_count()
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn probe(config: &HarnessConfig) -> Result<ExitCode> {
    let opener = SerialPortOpener::from_config(&config.serial);
    println!("Probing {}", opener.describe());
    let monitor = ConnectionMonitor::spawn(Arc::new(opener), MonitorSettings::from_config(config)?);

    let result = monitor.wait_connected(config.timing.connect_timeout).await;
    monitor.shutdown().await;
    match result {
        Ok(()) => {
            println!("Device is alive");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("Device did not answer: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_parsing() {
        assert_eq!(
            parse_key_val("mac_prefix=9C:65").unwrap(),
            ("mac_prefix".to_string(), "9C:65".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn cli_parses_run() {
        let cli = Cli::try_parse_from([
            "vent_harness",
            "run",
            "--plan",
            "Full Function",
            "--sn",
            "1",
            "--fw",
            "2",
            "--sw",
            "3",
            "--wifi",
            "4",
            "--param",
            "a=b",
            "--cycles",
            "3",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { plan, cycles, params, .. } => {
                assert_eq!(plan, "Full Function");
                assert_eq!(cycles, 3);
                assert_eq!(params, vec![("a".to_string(), "b".to_string())]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn cli_parses_logging_flags_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "vent_harness",
            "check",
            "--log-format",
            "json",
            "--step-timing",
        ])
        .unwrap();
        assert_eq!(cli.log_format.as_deref(), Some("json"));
        assert!(cli.step_timing);
        assert!(matches!(cli.command, Commands::Check));
    }
}
