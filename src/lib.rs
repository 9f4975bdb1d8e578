//! verdict: canonical test result reconciliation.
//!
//! Runs third-party test frameworks, reconciles what they report into one
//! canonical outcome per test, retries failures within a bounded budget and
//! splits suites across parallel agents by historical duration.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Model**: Canonical identifiers, raw statuses, attempts and outcomes
//! - **Framework**: Adapters for RSpec, Cucumber, Playwright, Cypress and
//!   generic command-driven frameworks
//! - **Classify**: Folds a test's attempts into its final outcome
//! - **Orchestrator**: Discovery, sharding and the retry loop
//! - **Partition**: Duration-balanced sharding
//! - **Provider**: How framework processes are launched
//! - **Report**: Console, JUnit XML and JSON output
//!
//! # Example
//!
//! ```no_run
//! use verdict::config::load_config;
//! use verdict::orchestrator::Coordinator;
//! use verdict::provider::local::LocalLauncher;
//! use verdict::report::NullReporter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("verdict.toml"))?;
//!     let launcher = LocalLauncher::new(config.launcher.clone());
//!     let report = Coordinator::new(&config, &launcher, &NullReporter).run().await?;
//!     println!("{} failure(s)", report.failure_count);
//!     Ok(())
//! }
//! ```

pub mod classify;
pub mod config;
pub mod framework;
pub mod history;
pub mod model;
pub mod orchestrator;
pub mod partition;
pub mod provider;
pub mod report;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use framework::{Adapter, TestFramework};
pub use model::{ClassifiedResult, Outcome, RawStatus, TestId};
pub use orchestrator::{Coordinator, RunReport};
pub use provider::Launcher;
pub use report::Reporter;
