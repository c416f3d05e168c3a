//! On-disk layout of one orchestrator run.
//!
//! ```text
//! {log_root}/
//! ├── 2026-10-16/
//! │   └── mobile/
//! │       └── 14-03-59/
//! │           ├── output-0.xml        attempt 0, kept as baseline
//! │           ├── output.xml          canonical result
//! │           ├── report-final.html
//! │           ├── execution.log
//! │           ├── syslog.txt
//! │           ├── bridge-4723.log
//! │           └── artifacts/
//! └── latest/
//!     ├── output.xml                  combined result
//!     ├── report.html
//!     ├── bridge-4723.log
//!     ├── artifacts/                  flattened, last write wins
//!     └── report/                     external generator output
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};

use crate::modules::TestModule;

pub const CANONICAL_FILE: &str = "output.xml";
pub const LATEST_DIR: &str = "latest";

/// Directories for every selected module plus the shared `latest` directory.
#[derive(Debug, Clone)]
pub struct RunLayout {
    pub modules: Vec<ModuleLayout>,
    pub latest: LatestLayout,
}

impl RunLayout {
    /// Creates the run directories stamped with `now`.
    pub fn create(log_root: &Path, now: DateTime<Local>, modules: &[TestModule]) -> Result<Self> {
        let date = now.format("%Y-%m-%d").to_string();
        let time = now.format("%H-%M-%S").to_string();

        let mut layouts = Vec::with_capacity(modules.len());
        for module in modules {
            let dir = log_root.join(&date).join(&module.name).join(&time);
            let layout = ModuleLayout {
                module: module.name.clone(),
                dir,
            };
            std::fs::create_dir_all(layout.artifacts_dir()).with_context(|| {
                format!("Failed to create log directory: {}", layout.dir.display())
            })?;
            layouts.push(layout);
        }

        let latest = LatestLayout {
            dir: log_root.join(LATEST_DIR),
        };
        std::fs::create_dir_all(&latest.dir)
            .with_context(|| format!("Failed to create {}", latest.dir.display()))?;

        Ok(Self {
            modules: layouts,
            latest,
        })
    }

    pub fn module(&self, name: &str) -> Option<&ModuleLayout> {
        self.modules.iter().find(|m| m.module == name)
    }
}

/// Files of one module within one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleLayout {
    pub module: String,
    pub dir: PathBuf,
}

impl ModuleLayout {
    pub fn attempt_file(&self, index: usize) -> PathBuf {
        self.dir.join(format!("output-{index}.xml"))
    }

    pub fn canonical_file(&self) -> PathBuf {
        self.dir.join(CANONICAL_FILE)
    }

    pub fn report_file(&self) -> PathBuf {
        self.dir.join("report-final.html")
    }

    pub fn execution_log(&self) -> PathBuf {
        self.dir.join("execution.log")
    }

    pub fn syslog_file(&self) -> PathBuf {
        self.dir.join("syslog.txt")
    }

    pub fn bridge_log(&self, port: u16) -> PathBuf {
        self.dir.join(format!("bridge-{port}.log"))
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.dir.join("artifacts")
    }

    /// List of runner ids to rerun in attempt `index`.
    pub fn failed_list(&self, index: usize) -> PathBuf {
        self.dir.join(format!("failed-{index}.txt"))
    }
}

/// The `latest` directory holding the combined archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestLayout {
    pub dir: PathBuf,
}

impl LatestLayout {
    pub fn combined_file(&self) -> PathBuf {
        self.dir.join(CANONICAL_FILE)
    }

    pub fn report_file(&self) -> PathBuf {
        self.dir.join("report.html")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.dir.join("artifacts")
    }

    pub fn generated_report_dir(&self) -> PathBuf {
        self.dir.join("report")
    }
}
