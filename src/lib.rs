//! # Ventilator UART Test Harness
//!
//! This crate drives scripted test plans against a ventilator unit over its
//! serial console, checks every response and writes a pass/fail report. The
//! `vent_harness` binary (`main.rs`) is a thin CLI over this library.
//!
//! ## Crate Structure
//!
//! - **`validation`**: the `Condition` enum and `validate()`: range, equality,
//!   length, timestamp and MAC-address checks on device values.
//! - **`catalog`**: command table, condition table and test plans, loaded from YAML.
//! - **`serial`**: the `PortOpener` seam, with a `tokio-serial` implementation
//!   and an in-memory scripted device for tests.
//! - **`connection`**: the connection monitor task. It owns the port, runs the
//!   liveness probe, reconnects and serves command requests.
//! - **`transport`**: one command out, one response line back, prefix and value
//!   judgement.
//! - **`runner`**: executes a plan and records `StepResult`s into a `RunSession`.
//! - **`session`**: run session, step results, device identity, JSON dump.
//! - **`report`**: the plain-text report.
//! - **`config`**: layered `figment` configuration.
//! - **`error`**: the `HarnessError` enum.
//! - **`tracing_setup`**: `tracing-subscriber` initialisation.

pub mod catalog;
pub mod config;
pub mod connection;
pub mod error;
pub mod report;
pub mod runner;
pub mod serial;
pub mod session;
pub mod tracing_setup;
pub mod transport;
pub mod validation;

pub use error::{HarnessError, HarnessResult};
