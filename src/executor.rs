//! Bounded "rerun only failures" execution of one module.
//!
//! # Protocol
//!
//! ```text
//! attempt 0   full suite                       -> output-0.xml  (baseline, kept)
//! attempt 1   items failed in output-0.xml     -> output-1.xml
//! ...
//! attempt N   items failed in output-(N-1).xml -> output-N.xml
//! ```
//!
//! `N` is the retry budget, or 0 in debug and stop-on-failure modes. The
//! loop always consumes the full budget: an attempt whose predecessor had
//! no failures writes an empty result without running anything, so attempt
//! files stay gapless. A rerun's result is filtered to the items it was
//! asked to rerun. A rerun that leaves no result file carries its input
//! failures forward unchanged.

pub mod attempt;
pub mod runner;

pub use attempt::{ExecutionAttempt, RetryPolicy};
pub use runner::{
    AttemptOutcome, AttemptRequest, CommandSuiteRunner, OutputCallback, OutputLine, SuiteRunner,
};

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::layout::ModuleLayout;
use crate::modules::TestModule;
use crate::report::junit::{ResultDocument, TestItem};

/// Drives a module's attempts through a [`SuiteRunner`].
pub struct ExecutionController<'a, R: SuiteRunner + ?Sized> {
    runner: &'a R,
    policy: RetryPolicy,
}

impl<'a, R: SuiteRunner + ?Sized> ExecutionController<'a, R> {
    pub fn new(runner: &'a R, policy: RetryPolicy) -> Self {
        Self { runner, policy }
    }

    /// Runs attempt 0 and every rerun the policy allows.
    ///
    /// Returns the attempts in index order. Test failures are not errors;
    /// an error means an attempt could not be started or its result could
    /// not be written.
    pub async fn run(
        &self,
        module: &TestModule,
        layout: &ModuleLayout,
        env: &[(String, String)],
    ) -> Result<Vec<ExecutionAttempt>> {
        let first = ExecutionAttempt::full(&module.name, layout.attempt_file(0));
        self.execute(module, layout, &first, &[], env).await?;
        let mut attempts = vec![first];

        let reruns = self.policy.reruns();
        if reruns == 0 && self.policy.retry_times > 0 {
            info!("[{}] Retries disabled in debug/stop-on-failure mode", module.name);
        }

        for index in 1..=reruns {
            let previous = &attempts[index - 1];
            let failed = failed_items(&previous.result_file);
            let attempt = ExecutionAttempt::rerun(previous, layout.attempt_file(index));

            if failed.is_empty() {
                info!("[{}] Attempt {}: nothing to rerun", module.name, index);
                ResultDocument::new()
                    .write(&attempt.result_file)
                    .with_context(|| format!("Failed to write {}", attempt.result_file.display()))?;
            } else {
                info!("[{}] Attempt {}: rerunning {} failed items", module.name, index, failed.len());
                self.execute(module, layout, &attempt, &failed, env).await?;
                restrict_to_rerun(&attempt.result_file, &failed)?;
            }

            attempts.push(attempt);
        }

        Ok(attempts)
    }

    async fn execute(
        &self,
        module: &TestModule,
        layout: &ModuleLayout,
        attempt: &ExecutionAttempt,
        failed: &[TestItem],
        env: &[(String, String)],
    ) -> Result<()> {
        let request = AttemptRequest {
            module,
            attempt,
            failed,
            layout,
            env,
        };
        let outcome = self.runner.run_attempt(&request).await?;

        if outcome.timed_out {
            warn!("[{}] Attempt {} timed out", module.name, attempt.index);
        }
        info!(
            "[{}] Attempt {} finished in {:.1}s (exit code {:?})",
            module.name,
            attempt.index,
            outcome.duration.as_secs_f64(),
            outcome.exit_code
        );
        if !attempt.result_file.exists() {
            warn!(
                "[{}] Attempt {} wrote no result file at {}",
                module.name,
                attempt.index,
                attempt.result_file.display()
            );
        }
        Ok(())
    }
}

/// Failed items of a result file; an unreadable file has none.
fn failed_items(path: &Path) -> Vec<TestItem> {
    if !path.exists() {
        return Vec::new();
    }
    match ResultDocument::load(path) {
        Ok(document) => document.failed().cloned().collect(),
        Err(e) => {
            warn!("Unreadable result file {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

/// Keeps only the rerun items in a rerun's result file.
///
/// Rerun items the runner did not report, or all of them when it produced
/// nothing usable, are written back with their previous status so later
/// attempts retry them.
fn restrict_to_rerun(path: &Path, failed: &[TestItem]) -> Result<()> {
    let wanted: HashSet<String> = failed.iter().map(TestItem::key).collect();

    let loaded = if path.exists() {
        ResultDocument::load(path)
            .map_err(|e| warn!("Unreadable rerun result {}: {}", path.display(), e))
            .ok()
    } else {
        None
    };

    let (mut document, dropped) = match loaded {
        Some(mut document) => {
            let dropped = document.retain(|item| wanted.contains(&item.key()));
            if dropped > 0 {
                warn!(
                    "Dropped {} items from {} that were not part of the rerun",
                    dropped,
                    path.display()
                );
            }
            (document, dropped)
        }
        None => (ResultDocument::new(), 0),
    };

    let missing: Vec<&TestItem> = failed
        .iter()
        .filter(|item| document.get(&item.key()).is_none())
        .collect();
    if missing.is_empty() && dropped == 0 && path.exists() {
        return Ok(());
    }
    if !missing.is_empty() && !document.is_empty() {
        warn!(
            "{} rerun items missing from {}, keeping their previous status",
            missing.len(),
            path.display()
        );
    }
    for item in missing {
        document.upsert(item.clone());
    }

    document
        .write(path)
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::report::junit::ItemStatus;

    type Script = Box<dyn Fn(usize, &[TestItem]) -> Option<Vec<TestItem>> + Send + Sync>;

    /// Writes whatever the script returns for each attempt.
    struct ScriptedRunner {
        script: Script,
        invocations: Mutex<Vec<(usize, Vec<String>)>>,
    }

    impl ScriptedRunner {
        fn new(script: Script) -> Self {
            Self {
                script,
                invocations: Mutex::new(Vec::new()),
            }
        }

        fn invocations(&self) -> Vec<(usize, Vec<String>)> {
            self.invocations.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SuiteRunner for ScriptedRunner {
        async fn run_attempt(&self, request: &AttemptRequest<'_>) -> Result<AttemptOutcome> {
            let names = request.failed.iter().map(|i| i.name.clone()).collect();
            self.invocations
                .lock()
                .unwrap()
                .push((request.attempt.index, names));

            if let Some(items) = (self.script)(request.attempt.index, request.failed) {
                let mut document = ResultDocument::new();
                for item in items {
                    document.upsert(item);
                }
                document.write(&request.attempt.result_file)?;
            }
            Ok(AttemptOutcome {
                exit_code: Some(1),
                timed_out: false,
                duration: Duration::from_millis(1),
            })
        }
    }

    fn item(name: &str, status: ItemStatus) -> TestItem {
        TestItem::new("suite", "cls", name).with_status(status)
    }

    fn fixture(dir: &Path) -> (TestModule, ModuleLayout) {
        let module = TestModule {
            name: "web".to_string(),
            suite_dir: PathBuf::from("test_cases/web"),
        };
        let layout = ModuleLayout {
            module: "web".to_string(),
            dir: dir.to_path_buf(),
        };
        (module, layout)
    }

    fn names(path: &Path) -> Vec<String> {
        ResultDocument::load(path)
            .unwrap()
            .items()
            .iter()
            .map(|i| i.name.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_reruns_only_previous_failures() {
        use ItemStatus::*;
        let dir = tempfile::tempdir().unwrap();
        let (module, layout) = fixture(dir.path());

        let failing = ["f1", "f2", "f3", "f4", "f5"];
        let runner = ScriptedRunner::new(Box::new(move |index: usize, failed: &[TestItem]| {
            Some(match index {
                0 => {
                    let mut all = vec![item("p1", Passed), item("p2", Passed)];
                    all.extend(failing.iter().map(|n| item(n, Failed)));
                    all
                }
                1 => failed.iter().map(|i| i.clone().with_status(Failed)).collect(),
                _ => failed
                    .iter()
                    .map(|i| {
                        let status = if i.name == "f3" { Failed } else { Passed };
                        i.clone().with_status(status)
                    })
                    .collect(),
            })
        }));

        let controller = ExecutionController::new(&runner, RetryPolicy::new(2, false, false));
        let attempts = controller.run(&module, &layout, &[]).await.unwrap();

        let indices: Vec<usize> = attempts.iter().map(|a| a.index).collect();
        assert_eq!(indices, [0, 1, 2]);
        assert_eq!(attempts[2].rerun_source.as_deref(), Some(layout.attempt_file(1).as_path()));

        let invocations = runner.invocations();
        assert_eq!(invocations.len(), 3);
        assert!(invocations[0].1.is_empty());
        assert_eq!(invocations[1].1, failing);
        assert_eq!(invocations[2].1, failing);

        assert_eq!(names(&layout.attempt_file(2)), failing);
    }

    #[tokio::test]
    async fn test_debug_mode_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let (module, layout) = fixture(dir.path());
        let runner = ScriptedRunner::new(Box::new(|_: usize, _: &[TestItem]| Some(vec![item("a", ItemStatus::Failed)])));

        let controller = ExecutionController::new(&runner, RetryPolicy::new(3, true, false));
        let attempts = controller.run(&module, &layout, &[]).await.unwrap();

        assert_eq!(attempts.len(), 1);
        assert_eq!(runner.invocations().len(), 1);
    }

    #[tokio::test]
    async fn test_budget_consumed_without_running_when_all_pass() {
        let dir = tempfile::tempdir().unwrap();
        let (module, layout) = fixture(dir.path());
        let runner = ScriptedRunner::new(Box::new(|_: usize, _: &[TestItem]| Some(vec![item("a", ItemStatus::Passed)])));

        let controller = ExecutionController::new(&runner, RetryPolicy::new(2, false, false));
        let attempts = controller.run(&module, &layout, &[]).await.unwrap();

        assert_eq!(attempts.len(), 3);
        assert_eq!(runner.invocations().len(), 1);
        assert!(ResultDocument::load(&layout.attempt_file(1)).unwrap().is_empty());
        assert!(ResultDocument::load(&layout.attempt_file(2)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rerun_result_is_restricted_to_failed_items() {
        let dir = tempfile::tempdir().unwrap();
        let (module, layout) = fixture(dir.path());
        let runner = ScriptedRunner::new(Box::new(|index: usize, _: &[TestItem]| {
            Some(match index {
                0 => vec![item("a", ItemStatus::Passed), item("b", ItemStatus::Failed)],
                // The runner ignored the selection and ran everything.
                _ => vec![item("a", ItemStatus::Failed), item("b", ItemStatus::Passed)],
            })
        }));

        let controller = ExecutionController::new(&runner, RetryPolicy::new(1, false, false));
        controller.run(&module, &layout, &[]).await.unwrap();

        assert_eq!(names(&layout.attempt_file(1)), ["b"]);
    }

    #[tokio::test]
    async fn test_missing_rerun_result_carries_failures_forward() {
        let dir = tempfile::tempdir().unwrap();
        let (module, layout) = fixture(dir.path());
        let runner = ScriptedRunner::new(Box::new(|index: usize, failed: &[TestItem]| match index {
            0 => Some(vec![item("a", ItemStatus::Passed), item("b", ItemStatus::Error)]),
            1 => None,
            _ => Some(failed.iter().map(|i| i.clone().with_status(ItemStatus::Passed)).collect()),
        }));

        let controller = ExecutionController::new(&runner, RetryPolicy::new(2, false, false));
        controller.run(&module, &layout, &[]).await.unwrap();

        let carried = ResultDocument::load(&layout.attempt_file(1)).unwrap();
        assert_eq!(carried.get("suite::cls::b").unwrap().status, ItemStatus::Error);

        let invocations: HashMap<usize, Vec<String>> = runner.invocations().into_iter().collect();
        assert_eq!(invocations[&2], ["b"]);
        assert_eq!(
            ResultDocument::load(&layout.attempt_file(2)).unwrap().get("suite::cls::b").unwrap().status,
            ItemStatus::Passed
        );
    }

    #[tokio::test]
    async fn test_unreported_rerun_items_stay_in_later_reruns() {
        let dir = tempfile::tempdir().unwrap();
        let (module, layout) = fixture(dir.path());
        let runner = ScriptedRunner::new(Box::new(|index: usize, failed: &[TestItem]| match index {
            0 => Some(vec![
                item("a", ItemStatus::Passed),
                item("b", ItemStatus::Failed),
                item("c", ItemStatus::Failed),
            ]),
            // Only "b" is reported; "c" went missing.
            1 => Some(vec![item("b", ItemStatus::Failed)]),
            _ => Some(failed.iter().map(|i| i.clone().with_status(ItemStatus::Passed)).collect()),
        }));

        let controller = ExecutionController::new(&runner, RetryPolicy::new(2, false, false));
        controller.run(&module, &layout, &[]).await.unwrap();

        let first_rerun = ResultDocument::load(&layout.attempt_file(1)).unwrap();
        assert_eq!(first_rerun.get("suite::cls::c").unwrap().status, ItemStatus::Failed);

        let invocations: HashMap<usize, Vec<String>> = runner.invocations().into_iter().collect();
        assert_eq!(invocations[&2], ["b", "c"]);
    }
}
