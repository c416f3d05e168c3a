//! Attempt and cross-module merging.
//!
//! A module's attempts are merged into its canonical `output.xml` so that
//! each item keeps the status from the last attempt that covered it. The
//! canonical results of every module are then combined into `latest/`,
//! together with a flattened copy of every module's artifact files.
//!
//! Missing inputs never stop a merge: they are logged and skipped.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::junit::{ResultCounts, ResultDocument};
use super::ReportResult;
use crate::layout::LatestLayout;

/// Outcome of merging one module's attempts.
#[derive(Debug, Clone)]
pub struct MergedModule {
    pub module: String,
    pub canonical: PathBuf,
    pub counts: ResultCounts,
}

/// Everything `combine_modules` needs from one module.
#[derive(Debug, Clone)]
pub struct ModuleArchive {
    pub module: String,
    pub canonical: PathBuf,
    pub artifacts_dir: PathBuf,
    /// Extra files copied into the top of `latest/` (bridge-server logs).
    pub extra_files: Vec<PathBuf>,
}

/// The combined archive for one run.
#[derive(Debug, Clone)]
pub struct CombinedArchive {
    pub combined: PathBuf,
    pub artifacts_dir: PathBuf,
    pub document: ResultDocument,
    pub artifacts_copied: usize,
}

impl CombinedArchive {
    pub fn counts(&self) -> ResultCounts {
        self.document.counts()
    }
}

/// Merges `attempt_files` (ordered by attempt index) into `canonical`.
///
/// Later attempts override earlier ones item by item; items that were never
/// rerun keep their attempt-0 status. After the canonical file is written,
/// every attempt file except attempt 0 is deleted.
///
/// Passing the canonical file as the only input rewrites it unchanged.
pub fn merge_attempts(
    module: &str,
    attempt_files: &[PathBuf],
    canonical: &Path,
) -> ReportResult<MergedModule> {
    let mut merged = ResultDocument::new();

    for (index, path) in attempt_files.iter().enumerate() {
        if !path.exists() {
            warn!("[{}] Attempt file missing, skipping: {}", module, path.display());
            continue;
        }
        match ResultDocument::load(path) {
            Ok(document) => {
                debug!(
                    "[{}] Merging attempt {} ({} items) from {}",
                    module,
                    index,
                    document.len(),
                    path.display()
                );
                merged.overlay(&document);
            }
            Err(e) => warn!("[{}] Unreadable attempt file {}, skipping: {}", module, path.display(), e),
        }
    }

    merged.write(canonical)?;

    for path in attempt_files.iter().skip(1) {
        if path.as_path() == canonical || !path.exists() {
            continue;
        }
        if let Err(e) = std::fs::remove_file(path) {
            warn!("[{}] Failed to remove {}: {}", module, path.display(), e);
        }
    }

    let counts = merged.counts();
    info!(
        "[{}] Canonical result: {} tests, {} failed, {} errors",
        module, counts.total, counts.failed, counts.errors
    );

    Ok(MergedModule {
        module: module.to_string(),
        canonical: canonical.to_path_buf(),
        counts,
    })
}

/// Combines every module's canonical result and artifacts into `latest`.
///
/// The `latest` artifact directory is cleared first. Artifact files are
/// copied flat, so a file name seen in two modules keeps the later copy.
pub fn combine_modules(modules: &[ModuleArchive], latest: &LatestLayout) -> ReportResult<CombinedArchive> {
    std::fs::create_dir_all(&latest.dir)?;

    let mut combined = ResultDocument::new();
    for module in modules {
        if !module.canonical.exists() {
            warn!("[{}] Canonical result missing, skipping: {}", module.module, module.canonical.display());
            continue;
        }
        match ResultDocument::load(&module.canonical) {
            Ok(document) => {
                for item in document.items() {
                    let mut item = item.clone();
                    item.suite = namespaced_suite(&module.module, &item.suite);
                    combined.upsert(item);
                }
            }
            Err(e) => warn!("[{}] Unreadable canonical result, skipping: {}", module.module, e),
        }
    }
    let combined_file = latest.combined_file();
    combined.write(&combined_file)?;

    let artifacts_dir = latest.artifacts_dir();
    if artifacts_dir.exists() {
        std::fs::remove_dir_all(&artifacts_dir)?;
    }
    std::fs::create_dir_all(&artifacts_dir)?;

    let mut artifacts_copied = 0;
    for module in modules {
        artifacts_copied += copy_flat(&module.module, &module.artifacts_dir, &artifacts_dir)?;

        for extra in &module.extra_files {
            let Some(name) = extra.file_name() else {
                continue;
            };
            if !extra.is_file() {
                warn!("[{}] Missing file, skipping: {}", module.module, extra.display());
                continue;
            }
            std::fs::copy(extra, latest.dir.join(name))?;
        }
    }

    info!(
        "Combined {} modules into {} ({} artifacts)",
        modules.len(),
        combined_file.display(),
        artifacts_copied
    );

    Ok(CombinedArchive {
        combined: combined_file,
        artifacts_dir,
        document: combined,
        artifacts_copied,
    })
}

/// Suite name of a module's items in the combined archive.
///
/// Modules may report identical keys, so every suite is prefixed with its
/// module to keep each module's items apart.
fn namespaced_suite(module: &str, suite: &str) -> String {
    if suite.is_empty() {
        module.to_string()
    } else {
        format!("{module}.{suite}")
    }
}

/// Copies the regular files directly inside `source` into `target`.
fn copy_flat(module: &str, source: &Path, target: &Path) -> ReportResult<usize> {
    let entries = match std::fs::read_dir(source) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("[{}] Artifacts directory unavailable, skipping: {}: {}", module, source.display(), e);
            return Ok(0);
        }
    };

    let mut copied = 0;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let destination = target.join(entry.file_name());
        if destination.exists() {
            debug!("[{}] Overwriting artifact {}", module, destination.display());
        }
        std::fs::copy(entry.path(), &destination)?;
        copied += 1;
    }
    Ok(copied)
}
