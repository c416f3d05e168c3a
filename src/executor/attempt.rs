//! Attempts and the retry policy.

use std::path::PathBuf;

use crate::config::ConductorConfig;

/// One execution pass over a module's suite.
///
/// Attempt 0 runs the full suite. Attempt `i > 0` reruns only the items
/// that failed in attempt `i - 1`, whose result file is its `rerun_source`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionAttempt {
    pub module: String,
    pub index: usize,
    pub result_file: PathBuf,
    pub rerun_source: Option<PathBuf>,
}

impl ExecutionAttempt {
    /// The full-suite attempt.
    pub fn full(module: impl Into<String>, result_file: PathBuf) -> Self {
        Self {
            module: module.into(),
            index: 0,
            result_file,
            rerun_source: None,
        }
    }

    /// A failures-only rerun of `previous`.
    pub fn rerun(previous: &ExecutionAttempt, result_file: PathBuf) -> Self {
        Self {
            module: previous.module.clone(),
            index: previous.index + 1,
            result_file,
            rerun_source: Some(previous.result_file.clone()),
        }
    }

    pub fn is_rerun(&self) -> bool {
        self.rerun_source.is_some()
    }
}

/// How many reruns follow attempt 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_times: usize,
    pub debug: bool,
    pub stop_on_failure: bool,
}

impl RetryPolicy {
    pub fn new(retry_times: usize, debug: bool, stop_on_failure: bool) -> Self {
        Self {
            retry_times,
            debug,
            stop_on_failure,
        }
    }

    pub fn from_config(config: &ConductorConfig, debug: bool, stop_on_failure: bool) -> Self {
        Self::new(config.retry_times, debug, stop_on_failure)
    }

    /// Number of reruns; debug and stop-on-failure runs never rerun.
    pub fn reruns(&self) -> usize {
        if self.debug || self.stop_on_failure {
            0
        } else {
            self.retry_times
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rerun_chains_from_previous() {
        let first = ExecutionAttempt::full("web", PathBuf::from("output-0.xml"));
        let second = ExecutionAttempt::rerun(&first, PathBuf::from("output-1.xml"));
        assert!(!first.is_rerun());
        assert_eq!(second.index, 1);
        assert_eq!(second.rerun_source, Some(PathBuf::from("output-0.xml")));
        assert_eq!(second.module, "web");
    }

    #[test]
    fn test_reruns_suppressed_by_debug_or_stop_on_failure() {
        assert_eq!(RetryPolicy::new(3, false, false).reruns(), 3);
        assert_eq!(RetryPolicy::new(3, true, false).reruns(), 0);
        assert_eq!(RetryPolicy::new(3, false, true).reruns(), 0);
        assert_eq!(RetryPolicy::new(0, false, false).reruns(), 0);
    }
}
