//! Running one attempt of a module's suite.
//!
//! [`CommandSuiteRunner`] expands the configured command template for an
//! attempt, runs it through the platform shell, and streams its output to
//! the console callback and the module's `execution.log`.
//!
//! # Placeholders
//!
//! | Placeholder | Expands to |
//! |-------------|------------|
//! | `{module}` | module name |
//! | `{suite}` | suite directory |
//! | `{output}` | result file of this attempt |
//! | `{source}` | result file of the previous attempt (empty for attempt 0) |
//! | `{failed}` | runner ids to rerun, shell-quoted |
//! | `{failed_file}` | file listing those ids, one per line |
//! | `{artifacts}` | module artifact directory |

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, info, warn};

use super::attempt::ExecutionAttempt;
use crate::config::RunnerConfig;
use crate::layout::ModuleLayout;
use crate::modules::TestModule;
use crate::report::JunitFormat;
use crate::report::junit::TestItem;
use crate::supervisor::ProcessControl;
use crate::wait::{WaitOutcome, Waiter};

/// A line of runner output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    pub fn text(&self) -> &str {
        match self {
            OutputLine::Stdout(s) | OutputLine::Stderr(s) => s,
        }
    }
}

/// Receives every output line with the module name.
pub type OutputCallback = Arc<dyn Fn(&str, &OutputLine) + Send + Sync>;

/// Everything a runner needs for one attempt.
pub struct AttemptRequest<'a> {
    pub module: &'a TestModule,
    pub attempt: &'a ExecutionAttempt,
    /// Items to rerun; empty for attempt 0.
    pub failed: &'a [TestItem],
    pub layout: &'a ModuleLayout,
    /// Extra environment (bridge ports, device serial).
    pub env: &'a [(String, String)],
}

/// How an attempt's process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration: Duration,
}

/// Runs one attempt and leaves its result file at `attempt.result_file`.
///
/// A non-zero exit is not an error: test failures are read from the result
/// file. Errors mean the attempt could not be run at all.
#[async_trait]
pub trait SuiteRunner: Send + Sync {
    async fn run_attempt(&self, request: &AttemptRequest<'_>) -> Result<AttemptOutcome>;
}

/// Runs the configured command templates through the platform shell.
pub struct CommandSuiteRunner {
    control: Arc<dyn ProcessControl>,
    config: RunnerConfig,
    debug: bool,
    stop_on_failure: bool,
    output: Option<OutputCallback>,
}

impl CommandSuiteRunner {
    pub fn new(control: Arc<dyn ProcessControl>, config: RunnerConfig) -> Self {
        Self {
            control,
            config,
            debug: false,
            stop_on_failure: false,
            output: None,
        }
    }

    /// Appends the configured debug or stop-on-failure arguments.
    pub fn with_modes(mut self, debug: bool, stop_on_failure: bool) -> Self {
        self.debug = debug;
        self.stop_on_failure = stop_on_failure;
        self
    }

    pub fn with_output_callback(mut self, callback: OutputCallback) -> Self {
        self.output = Some(callback);
        self
    }

    pub fn junit_format(&self) -> JunitFormat {
        self.config.junit_format
    }

    /// Builds the shell command line for `request`.
    pub fn command_line(&self, request: &AttemptRequest<'_>) -> Result<String> {
        let template = if request.attempt.is_rerun() {
            &self.config.rerun_command
        } else {
            &self.config.command
        };

        let ids: Vec<String> = request
            .failed
            .iter()
            .map(|item| self.config.junit_format.item_id(item))
            .collect();

        let mut cmdline = template
            .replace("{module}", &request.module.name)
            .replace("{suite}", &quote_path(&request.module.suite_dir))
            .replace("{output}", &quote_path(&request.attempt.result_file))
            .replace(
                "{source}",
                &request
                    .attempt
                    .rerun_source
                    .as_deref()
                    .map(quote_path)
                    .unwrap_or_default(),
            )
            .replace("{failed}", &shell_words::join(&ids))
            .replace("{artifacts}", &quote_path(&request.layout.artifacts_dir()));

        if cmdline.contains("{failed_file}") {
            let list = request.layout.failed_list(request.attempt.index);
            let mut content = ids.join("\n");
            content.push('\n');
            std::fs::write(&list, content)
                .with_context(|| format!("Failed to write {}", list.display()))?;
            cmdline = cmdline.replace("{failed_file}", &quote_path(&list));
        }

        let mut extra: Vec<&str> = Vec::new();
        if self.debug {
            extra.extend(self.config.debug_args.iter().map(String::as_str));
        }
        if self.stop_on_failure {
            extra.extend(self.config.stop_on_failure_args.iter().map(String::as_str));
        }
        if !extra.is_empty() {
            cmdline.push(' ');
            cmdline.push_str(&shell_words::join(extra));
        }

        Ok(cmdline)
    }

    fn attempt_env(&self, request: &AttemptRequest<'_>) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();
        env.push(("CONDUCTOR_MODULE".to_string(), request.module.name.clone()));
        env.push(("CONDUCTOR_ATTEMPT".to_string(), request.attempt.index.to_string()));
        env.push((
            "CONDUCTOR_ARTIFACTS_DIR".to_string(),
            request.layout.artifacts_dir().display().to_string(),
        ));
        env.push((
            "CONDUCTOR_SYSLOG_FILE".to_string(),
            request.layout.syslog_file().display().to_string(),
        ));
        env.extend(request.env.iter().cloned());
        env
    }
}

#[async_trait]
impl SuiteRunner for CommandSuiteRunner {
    async fn run_attempt(&self, request: &AttemptRequest<'_>) -> Result<AttemptOutcome> {
        let module = request.module.name.as_str();
        let cmdline = self.command_line(request)?;
        info!("[{}] Attempt {}: {}", module, request.attempt.index, cmdline);

        let mut command = self.control.shell(&cmdline);
        command
            .envs(self.attempt_env(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to start attempt {} of {}", request.attempt.index, module))?;

        let stdout = child.stdout.take().context("stdout not captured")?;
        let stderr = child.stderr.take().context("stderr not captured")?;
        let stdout = LinesStream::new(BufReader::new(stdout).lines())
            .map(|line| OutputLine::Stdout(line.unwrap_or_default()));
        let stderr = LinesStream::new(BufReader::new(stderr).lines())
            .map(|line| OutputLine::Stderr(line.unwrap_or_default()));
        let mut lines = Box::pin(stream::select(stdout, stderr));

        let log_path = request.layout.execution_log();
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .with_context(|| format!("Failed to open {}", log_path.display()))?;
        log.write_all(format!("$ {cmdline}\n").as_bytes()).await?;

        let timeout = Duration::from_secs(self.config.attempt_timeout_secs);
        let drive = async {
            while let Some(line) = lines.next().await {
                log.write_all(line.text().as_bytes()).await?;
                log.write_all(b"\n").await?;
                if let Some(callback) = &self.output {
                    callback(module, &line);
                }
            }
            log.flush().await?;
            child.wait().await
        };

        let outcome = Waiter::new(timeout).within(drive).await;
        let (exit_code, timed_out) = match outcome {
            WaitOutcome::Ready(status) => {
                let status = status.with_context(|| format!("Attempt {} of {} failed", request.attempt.index, module))?;
                debug!("[{}] Attempt {} exited with {}", module, request.attempt.index, status);
                (status.code(), false)
            }
            WaitOutcome::TimedOut | WaitOutcome::Cancelled => {
                warn!(
                    "[{}] Attempt {} exceeded {:?}, killing it",
                    module, request.attempt.index, timeout
                );
                if let Err(e) = child.kill().await {
                    warn!("[{}] Failed to kill attempt {}: {}", module, request.attempt.index, e);
                }
                (None, true)
            }
        };

        Ok(AttemptOutcome {
            exit_code,
            timed_out,
            duration: start.elapsed(),
        })
    }
}

fn quote_path(path: &Path) -> String {
    shell_words::quote(&path.display().to_string()).into_owned()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::load_config_str;
    use crate::supervisor::UnixControl;

    fn runner(command: &str, rerun: &str) -> CommandSuiteRunner {
        let config = load_config_str(&format!(
            r#"
            [runner]
            command = {command:?}
            rerun_command = {rerun:?}
            junit_format = "pytest"
            debug_args = ["-vv", "--log-level", "DEBUG"]
            stop_on_failure_args = ["-x"]
            [runner.env]
            APP_ENV = "test"
            "#
        ))
        .unwrap();
        CommandSuiteRunner::new(Arc::new(UnixControl), config.runner)
    }

    fn fixture(dir: &Path) -> (TestModule, ModuleLayout) {
        let module = TestModule {
            name: "api".to_string(),
            suite_dir: dir.join("suites/api"),
        };
        let layout = ModuleLayout {
            module: "api".to_string(),
            dir: dir.join("logs"),
        };
        std::fs::create_dir_all(layout.artifacts_dir()).unwrap();
        (module, layout)
    }

    #[test]
    fn test_full_attempt_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let (module, layout) = fixture(dir.path());
        let attempt = ExecutionAttempt::full("api", layout.attempt_file(0));
        let request = AttemptRequest {
            module: &module,
            attempt: &attempt,
            failed: &[],
            layout: &layout,
            env: &[],
        };

        let cmdline = runner("pytest {suite} --junitxml={output}", "unused")
            .with_modes(true, false)
            .command_line(&request)
            .unwrap();
        assert_eq!(
            cmdline,
            format!(
                "pytest {} --junitxml={} -vv --log-level DEBUG",
                module.suite_dir.display(),
                layout.attempt_file(0).display()
            )
        );
    }

    #[test]
    fn test_rerun_command_line_lists_failed_ids() {
        let dir = tempfile::tempdir().unwrap();
        let (module, layout) = fixture(dir.path());
        let first = ExecutionAttempt::full("api", layout.attempt_file(0));
        let rerun = ExecutionAttempt::rerun(&first, layout.attempt_file(1));
        let failed = vec![
            TestItem::new("pytest", "tests.test_api", "test_get"),
            TestItem::new("pytest", "tests.test_api", "test_post[a b]"),
        ];
        let request = AttemptRequest {
            module: &module,
            attempt: &rerun,
            failed: &failed,
            layout: &layout,
            env: &[],
        };

        let cmdline = runner("unused", "pytest {failed} --junitxml={output} @{failed_file} {source}")
            .with_modes(false, true)
            .command_line(&request)
            .unwrap();

        assert!(cmdline.starts_with("pytest tests/test_api.py::test_get 'tests/test_api.py::test_post[a b]'"));
        assert!(cmdline.contains(&layout.failed_list(1).display().to_string()));
        assert!(cmdline.contains(&layout.attempt_file(0).display().to_string()));
        assert!(cmdline.ends_with(" -x"));

        let listed = std::fs::read_to_string(layout.failed_list(1)).unwrap();
        assert_eq!(listed, "tests/test_api.py::test_get\ntests/test_api.py::test_post[a b]\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_attempt_streams_output_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let (module, layout) = fixture(dir.path());
        let attempt = ExecutionAttempt::full("api", layout.attempt_file(0));
        let request = AttemptRequest {
            module: &module,
            attempt: &attempt,
            failed: &[],
            layout: &layout,
            env: &[("CONDUCTOR_BRIDGE_PORT".to_string(), "4723".to_string())],
        };

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let runner = runner(
            "echo $APP_ENV $CONDUCTOR_MODULE $CONDUCTOR_ATTEMPT $CONDUCTOR_BRIDGE_PORT; echo oops >&2; touch {output}; exit 3",
            "unused",
        )
        .with_output_callback(Arc::new(move |module, line| {
            sink.lock().unwrap().push(format!("{module}: {}", line.text()));
        }));

        let outcome = runner.run_attempt(&request).await.unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.timed_out);
        assert!(layout.attempt_file(0).exists());

        let seen = seen.lock().unwrap();
        assert!(seen.contains(&"api: test api 0 4723".to_string()));
        assert!(seen.contains(&"api: oops".to_string()));

        let log = std::fs::read_to_string(layout.execution_log()).unwrap();
        assert!(log.contains("test api 0 4723"));
        assert!(log.contains("oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_attempt_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let (module, layout) = fixture(dir.path());
        let attempt = ExecutionAttempt::full("api", PathBuf::from("unused.xml"));
        let request = AttemptRequest {
            module: &module,
            attempt: &attempt,
            failed: &[],
            layout: &layout,
            env: &[],
        };

        let mut runner = runner("sleep 30", "unused");
        runner.config.attempt_timeout_secs = 0;
        let outcome = runner.run_attempt(&request).await.unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, None);
    }
}
