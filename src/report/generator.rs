//! External report generator (Allure-style CLI).
//!
//! Generation is invoked as `{generator} generate <results> --output <report> --clean`
//! and awaited. Its exit status is logged, never escalated.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::supervisor::{LaunchSpec, ProcessControl, ProcessHandle, SupervisorResult};
use crate::wait::{WaitOutcome, Waiter};

/// Upper bound on one report generation.
const GENERATE_TIMEOUT: Duration = Duration::from_secs(600);

/// How a generation attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerateOutcome {
    Succeeded,
    Failed(Option<i32>),
    /// The generator could not be started or did not finish in time.
    Unavailable,
}

pub struct ReportGenerator {
    program: String,
    control: Arc<dyn ProcessControl>,
    timeout: Duration,
}

impl ReportGenerator {
    pub fn new(program: impl Into<String>, control: Arc<dyn ProcessControl>) -> Self {
        Self {
            program: program.into(),
            control,
            timeout: GENERATE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Generates a report from `results_dir` into `report_dir`.
    pub async fn generate(&self, results_dir: &Path, report_dir: &Path) -> GenerateOutcome {
        let mut command = self.control.command(&self.program);
        command
            .arg("generate")
            .arg(results_dir)
            .arg("--output")
            .arg(report_dir)
            .arg("--clean")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Report generator `{}` could not be started: {}", self.program, e);
                return GenerateOutcome::Unavailable;
            }
        };

        let outcome = Waiter::new(self.timeout)
            .with_progress("Generating report")
            .within(child.wait())
            .await;

        match outcome {
            WaitOutcome::Ready(Ok(status)) if status.success() => {
                info!("Report generated at {}", report_dir.display());
                GenerateOutcome::Succeeded
            }
            WaitOutcome::Ready(Ok(status)) => {
                warn!("Report generator exited with {}", status);
                GenerateOutcome::Failed(status.code())
            }
            WaitOutcome::Ready(Err(e)) => {
                warn!("Failed to wait for report generator: {}", e);
                GenerateOutcome::Unavailable
            }
            WaitOutcome::TimedOut | WaitOutcome::Cancelled => {
                warn!("Report generator did not finish within {:?}", self.timeout);
                GenerateOutcome::Unavailable
            }
        }
    }

    /// Starts the generator's report viewer for `report_dir`.
    pub fn open(&self, report_dir: &Path) -> SupervisorResult<ProcessHandle> {
        let spec = LaunchSpec::new(self.program.clone())
            .args(["open".to_string(), report_dir.display().to_string()]);
        self.control.spawn(spec)
    }
}
