//! conductor: a test run orchestrator.
//!
//! Runs declared test modules one at a time, reruns only what failed, merges
//! the partial JUnit results into one canonical result per module and one
//! combined archive per run, and manages the emulator and UI-automation
//! bridge server that device tests need.
//!
//! # Architecture
//!
//! - **Supervisor**: port cleanup, bridge server and emulator lifecycle
//! - **Executor**: bounded failures-only reruns of one module
//! - **Report**: JUnit parsing, attempt merging, combined archive, HTML
//! - **Orchestrator**: sequences the above over the selected modules
//!
//! # Example
//!
//! ```no_run
//! use conductor::config::load_config;
//! use conductor::executor::CommandSuiteRunner;
//! use conductor::modules::{discover_modules, select_modules};
//! use conductor::orchestrator::{Orchestrator, RunOptions};
//! use conductor::supervisor::Supervisor;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("conductor.toml"))?;
//!     let modules = select_modules(
//!         &discover_modules(&config.conductor.test_root)?,
//!         &["all".to_string()],
//!     );
//!
//!     let supervisor = Supervisor::from_config(&config);
//!     let runner = CommandSuiteRunner::new(supervisor.control(), config.runner.clone());
//!     let mut orchestrator = Orchestrator::new(config, supervisor, runner);
//!
//!     let summary = orchestrator.run(&modules, RunOptions::default()).await?;
//!     std::process::exit(summary.exit_code(false));
//! }
//! ```

pub mod config;
pub mod executor;
pub mod layout;
pub mod modules;
pub mod orchestrator;
pub mod ports;
pub mod report;
pub mod supervisor;
pub mod wait;

pub use config::{Config, load_config};
pub use orchestrator::{Orchestrator, RunOptions, RunSummary};
pub use report::{ResultDocument, TestItem};
pub use supervisor::{Supervisor, SupervisorError};
