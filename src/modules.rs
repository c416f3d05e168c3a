//! Test module discovery and selection.
//!
//! Every sub-directory of the configured test root is one module; its name
//! is the directory name and its suite is the directory itself.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Selector that picks every discovered module.
pub const ALL_MODULES: &str = "all";

/// A named directory of suite definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestModule {
    pub name: String,
    pub suite_dir: PathBuf,
}

/// Lists the modules under `test_root`, sorted by name.
///
/// Hidden directories (starting with `.`) and plain files are ignored.
pub fn discover_modules(test_root: &Path) -> Result<Vec<TestModule>> {
    let entries = std::fs::read_dir(test_root)
        .with_context(|| format!("Failed to read test root: {}", test_root.display()))?;

    let mut modules = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        modules.push(TestModule {
            name,
            suite_dir: entry.path(),
        });
    }

    modules.sort_by(|a, b| a.name.cmp(&b.name));
    debug!("Discovered {} modules under {}", modules.len(), test_root.display());
    Ok(modules)
}

/// Resolves requested module names against the discovered modules.
///
/// Names are matched case-insensitively and de-duplicated, keeping request
/// order. `all` selects every discovered module in discovery order. Unknown
/// names are logged and skipped.
pub fn select_modules(discovered: &[TestModule], requested: &[String]) -> Vec<TestModule> {
    let mut selected: Vec<TestModule> = Vec::new();

    for request in requested {
        let wanted = request.trim().to_lowercase();
        if wanted.is_empty() {
            continue;
        }

        if wanted == ALL_MODULES {
            for module in discovered {
                if !selected.iter().any(|m| m.name == module.name) {
                    selected.push(module.clone());
                }
            }
            continue;
        }

        match discovered.iter().find(|m| m.name.to_lowercase() == wanted) {
            Some(module) => {
                if !selected.iter().any(|m| m.name == module.name) {
                    selected.push(module.clone());
                }
            }
            None => warn!("Unknown test module '{}', skipping", request),
        }
    }

    selected
}
