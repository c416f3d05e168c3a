//! Sequential orchestration of a test run.
//!
//! ```text
//!   for each selected module, in order:
//!       device module?  ensure_emulator ─► ensure_bridge_server ─► ports + serial
//!       ExecutionController::run        ─► output-0.xml .. output-N.xml
//!       merge_attempts                  ─► output.xml + report-final.html
//!       tear down bridge, then emulator
//!   merge_all                           ─► latest/output.xml, latest/artifacts, report
//! ```
//!
//! Exactly one module runs at a time. Infrastructure acquired for a module is
//! released before the next module starts, including when the module fails.
//! Test failures never abort the run; infrastructure errors do.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::executor::{ExecutionController, RetryPolicy, SuiteRunner};
use crate::layout::{LATEST_DIR, ModuleLayout, RunLayout};
use crate::modules::TestModule;
use crate::report::{
    self, GenerateOutcome, ModuleArchive, ReportGenerator, ResultCounts, ResultDocument, merge_attempts,
    write_html_report,
};
use crate::supervisor::{BridgeDisposition, BridgeServer, ProcessHandle, Supervisor};

/// Per-run switches that do not live in the configuration file.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Run each module once with the runner's debug arguments.
    pub debug: bool,
    /// Run each module once, stopping at the first failing test.
    pub stop_on_failure: bool,
}

/// Outcome of one module.
#[derive(Debug, Clone)]
pub struct ModuleSummary {
    pub name: String,
    pub counts: ResultCounts,
    /// Attempts made, including reruns that had nothing to run.
    pub attempts: usize,
    pub canonical: PathBuf,
    /// How the bridge server was obtained, for device modules.
    pub bridge: Option<BridgeDisposition>,
}

/// Aggregated results of an entire run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub modules: Vec<ModuleSummary>,
    pub combined: ResultCounts,
    pub duration: Duration,
    pub latest_dir: PathBuf,
    /// `None` when report generation is disabled or nothing ran.
    pub report: Option<GenerateOutcome>,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        !self.combined.has_failures()
    }

    /// Process exit code for this run.
    ///
    /// Test failures only fail the process in stop-on-failure mode.
    pub fn exit_code(&self, stop_on_failure: bool) -> i32 {
        if stop_on_failure && !self.success() { 1 } else { 0 }
    }
}

/// Runs selected modules one after another and merges their results.
pub struct Orchestrator<R> {
    config: Config,
    supervisor: Supervisor,
    runner: R,
    generator: Option<ReportGenerator>,
    cancel: CancellationToken,
}

impl<R: SuiteRunner> Orchestrator<R> {
    pub fn new(config: Config, supervisor: Supervisor, runner: R) -> Self {
        let generator = config
            .report
            .enabled
            .then(|| ReportGenerator::new(config.report.generator.clone(), supervisor.control()));
        Self {
            config,
            supervisor,
            runner,
            generator,
            cancel: CancellationToken::new(),
        }
    }

    /// Stops before the next module once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.supervisor = self.supervisor.with_cancellation(token.clone());
        self.cancel = token;
        self
    }

    pub fn generator(&self) -> Option<&ReportGenerator> {
        self.generator.as_ref()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Runs `modules` in order and builds the combined archive.
    pub async fn run(&mut self, modules: &[TestModule], options: RunOptions) -> Result<RunSummary> {
        let start = Instant::now();
        let log_root = self.config.conductor.log_root.clone();

        if modules.is_empty() {
            warn!("No test modules selected");
            return Ok(RunSummary {
                modules: Vec::new(),
                combined: ResultCounts::default(),
                duration: start.elapsed(),
                latest_dir: log_root.join(LATEST_DIR),
                report: None,
            });
        }

        let layout = RunLayout::create(&log_root, Local::now(), modules)?;
        let policy = RetryPolicy::from_config(&self.config.conductor, options.debug, options.stop_on_failure);

        let mut summaries = Vec::with_capacity(modules.len());
        let mut archives = Vec::with_capacity(modules.len());
        let mut fatal = None;
        for module in modules {
            if self.cancel.is_cancelled() {
                warn!("Run cancelled, skipping remaining modules");
                break;
            }
            let module_layout = layout
                .module(&module.name)
                .with_context(|| format!("No log directory for module {}", module.name))?
                .clone();

            info!("[{}] Starting module", module.name);
            match self.run_module(module, &module_layout, policy).await {
                Ok((summary, archive)) => {
                    summaries.push(summary);
                    archives.push(archive);
                }
                Err(e) => {
                    fatal = Some(e);
                    break;
                }
            }
        }

        let merged = report::merge_all(&archives, &layout.latest, self.generator.as_ref())
            .await
            .context("Failed to build combined results");

        // Modules that finished are still combined before a fatal error surfaces.
        if let Some(e) = fatal {
            if let Err(merge_error) = merged {
                warn!("{:#}", merge_error);
            }
            return Err(e);
        }
        let (combined, report) = merged?;

        Ok(RunSummary {
            modules: summaries,
            combined: combined.counts(),
            duration: start.elapsed(),
            latest_dir: layout.latest.dir.clone(),
            report,
        })
    }

    /// Whether `module` needs an emulator and a bridge server.
    pub fn is_device_module(&self, module: &TestModule) -> bool {
        self.config
            .conductor
            .device_modules
            .iter()
            .any(|name| name.eq_ignore_ascii_case(&module.name))
    }

    async fn run_module(
        &mut self,
        module: &TestModule,
        layout: &ModuleLayout,
        policy: RetryPolicy,
    ) -> Result<(ModuleSummary, ModuleArchive)> {
        let mut env = Vec::new();
        let mut emulator: Option<ProcessHandle> = None;
        let mut bridge: Option<BridgeServer> = None;

        if self.is_device_module(module) {
            let (started, server) = self.acquire_device(module, layout).await?;
            emulator = started;
            env.extend(server.ports.env());
            if let Some(serial) = self.supervisor.device_serial() {
                env.push(("CONDUCTOR_DEVICE_SERIAL".to_string(), serial.to_string()));
            }
            bridge = Some(server);
        }

        let result = self.execute_module(module, layout, policy, &env).await;

        let grace = self.supervisor.grace_period();
        if let Some(server) = bridge.as_mut() {
            server.teardown(grace).await;
        }
        if let Some(process) = emulator.as_mut() {
            process.teardown(grace).await;
        }

        let (counts, attempts) = result?;

        let mut extra_files = Vec::new();
        if let Some(log) = bridge.as_ref().and_then(|server| server.log_path.clone()) {
            if log.exists() {
                extra_files.push(log);
            }
        }

        let summary = ModuleSummary {
            name: module.name.clone(),
            counts,
            attempts,
            canonical: layout.canonical_file(),
            bridge: bridge.map(|server| server.disposition),
        };
        let archive = ModuleArchive {
            module: module.name.clone(),
            canonical: layout.canonical_file(),
            artifacts_dir: layout.artifacts_dir(),
            extra_files,
        };
        Ok((summary, archive))
    }

    /// Brings up the emulator (when a device is configured) and the bridge server.
    ///
    /// If the bridge server cannot be made ready, an emulator started here is
    /// torn down before the error is returned.
    async fn acquire_device(
        &mut self,
        module: &TestModule,
        layout: &ModuleLayout,
    ) -> Result<(Option<ProcessHandle>, BridgeServer)> {
        let mut emulator = match self.config.conductor.device_name.clone() {
            Some(device) => self
                .supervisor
                .ensure_emulator(&device)
                .await
                .with_context(|| format!("[{}] Failed to prepare device '{}'", module.name, device))?,
            None => {
                warn!("[{}] No device name configured, using whatever is attached", module.name);
                None
            }
        };

        let base_port = self.config.bridge.base_port;
        match self
            .supervisor
            .ensure_bridge_server(&module.name, base_port, &layout.bridge_log(base_port))
            .await
        {
            Ok(server) => Ok((emulator, server)),
            Err(e) => {
                if let Some(process) = emulator.as_mut() {
                    process.teardown(self.supervisor.grace_period()).await;
                }
                Err(e).with_context(|| format!("[{}] Bridge server unavailable", module.name))
            }
        }
    }

    async fn execute_module(
        &self,
        module: &TestModule,
        layout: &ModuleLayout,
        policy: RetryPolicy,
        env: &[(String, String)],
    ) -> Result<(ResultCounts, usize)> {
        let controller = ExecutionController::new(&self.runner, policy);
        let attempts = controller.run(module, layout, env).await?;

        let files: Vec<PathBuf> = attempts.iter().map(|a| a.result_file.clone()).collect();
        let merged = merge_attempts(&module.name, &files, &layout.canonical_file())
            .with_context(|| format!("[{}] Failed to merge attempt results", module.name))?;

        let document = ResultDocument::load(&merged.canonical)?;
        write_html_report(&format!("{} results", module.name), &document, &layout.report_file())
            .with_context(|| format!("[{}] Failed to write HTML report", module.name))?;

        Ok((merged.counts, attempts.len()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::executor::{AttemptOutcome, AttemptRequest};
    use crate::report::{ItemStatus, TestItem};
    use crate::supervisor::SessionProbe;
    use crate::supervisor::testing::{FakeControl, FakeDevices, supervisor, test_config};

    /// Fails `flaky` on attempt 0 and passes everything on reruns.
    #[derive(Default)]
    struct FlakyRunner {
        envs: Mutex<Vec<Vec<(String, String)>>>,
    }

    #[async_trait]
    impl SuiteRunner for FlakyRunner {
        async fn run_attempt(&self, request: &AttemptRequest<'_>) -> Result<AttemptOutcome> {
            self.envs.lock().unwrap().push(request.env.to_vec());

            let mut document = ResultDocument::new();
            if request.attempt.is_rerun() {
                for item in request.failed {
                    document.upsert(item.clone().with_status(ItemStatus::Passed));
                }
            } else {
                let suite = request.module.name.as_str();
                document.upsert(TestItem::new(suite, "cls", "stable"));
                document.upsert(TestItem::new(suite, "cls", "flaky").with_status(ItemStatus::Failed));
            }
            std::fs::write(request.layout.artifacts_dir().join(format!("{}.png", request.module.name)), "png")?;
            document.write(&request.attempt.result_file)?;

            Ok(AttemptOutcome {
                exit_code: Some(0),
                timed_out: false,
                duration: Duration::from_millis(1),
            })
        }
    }

    fn module(name: &str) -> TestModule {
        TestModule {
            name: name.to_string(),
            suite_dir: PathBuf::from("test_cases").join(name),
        }
    }

    fn orchestrator(
        log_root: &std::path::Path,
        control: Arc<FakeControl>,
        probe: SessionProbe,
        devices: Arc<FakeDevices>,
        device_name: Option<&str>,
    ) -> Orchestrator<FlakyRunner> {
        let mut config = test_config();
        config.conductor.log_root = log_root.to_path_buf();
        config.conductor.device_name = device_name.map(str::to_string);
        config.report.enabled = false;
        Orchestrator::new(config, supervisor(control, probe, devices), FlakyRunner::default())
    }

    #[tokio::test]
    async fn test_run_retries_and_combines_modules() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(
            dir.path(),
            Arc::default(),
            SessionProbe::down(),
            Arc::default(),
            None,
        );

        let summary = orch
            .run(&[module("api"), module("web")], RunOptions::default())
            .await
            .unwrap();

        assert_eq!(summary.modules.len(), 2);
        for module in &summary.modules {
            assert_eq!(module.attempts, 2);
            assert_eq!(module.counts.total, 2);
            assert_eq!(module.counts.passed, 2);
            assert!(module.canonical.exists());
            assert!(module.canonical.with_file_name("report-final.html").exists());
            assert!(module.bridge.is_none());
        }
        assert_eq!(summary.combined.total, 4);
        assert!(summary.success());
        assert_eq!(summary.exit_code(true), 0);

        assert!(summary.latest_dir.join("output.xml").exists());
        assert!(summary.latest_dir.join("report.html").exists());
        assert!(summary.latest_dir.join("artifacts").join("api.png").exists());
        assert!(summary.latest_dir.join("artifacts").join("web.png").exists());
    }

    #[tokio::test]
    async fn test_stop_on_failure_runs_once_and_fails_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(
            dir.path(),
            Arc::default(),
            SessionProbe::down(),
            Arc::default(),
            None,
        );

        let options = RunOptions {
            stop_on_failure: true,
            ..Default::default()
        };
        let summary = orch.run(&[module("api")], options).await.unwrap();

        assert_eq!(summary.modules[0].attempts, 1);
        assert_eq!(summary.combined.failed, 1);
        assert_eq!(summary.exit_code(true), 1);
        assert_eq!(summary.exit_code(false), 0);
    }

    #[tokio::test]
    async fn test_device_module_gets_ports_and_serial() {
        let dir = tempfile::tempdir().unwrap();
        let devices = Arc::new(FakeDevices::default());
        devices
            .attached
            .lock()
            .unwrap()
            .push(("emulator-5554".to_string(), Some("Pixel_7".to_string())));
        let control = Arc::new(FakeControl::default());

        let mut orch = orchestrator(
            dir.path(),
            control.clone(),
            SessionProbe::up(vec!["s1".to_string()]),
            devices,
            Some("Pixel_7"),
        );
        let summary = orch.run(&[module("mobile")], RunOptions::default()).await.unwrap();

        assert_eq!(control.spawn_count(), 0);
        assert!(matches!(
            summary.modules[0].bridge,
            Some(BridgeDisposition::Shared { .. })
        ));

        let envs = orch.runner.envs.lock().unwrap().clone();
        let env = &envs[0];
        assert!(env.contains(&("CONDUCTOR_BRIDGE_PORT".to_string(), "4723".to_string())));
        assert!(env.contains(&("CONDUCTOR_CHROMEDRIVER_PORT".to_string(), "8723".to_string())));
        assert!(env.contains(&("CONDUCTOR_DEVICE_SERIAL".to_string(), "emulator-5554".to_string())));
    }

    #[tokio::test]
    async fn test_unknown_device_aborts_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let control = Arc::new(FakeControl::default());
        let mut orch = orchestrator(
            dir.path(),
            control.clone(),
            SessionProbe::down(),
            Arc::default(),
            Some("Nexus_1"),
        );

        let err = orch.run(&[module("mobile")], RunOptions::default()).await.unwrap_err();

        assert!(format!("{:#}", err).contains("Unknown device 'Nexus_1'"));
        assert_eq!(control.spawn_count(), 0);
        assert!(orch.runner.envs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_module_error_still_combines_finished_modules() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(
            dir.path(),
            Arc::default(),
            SessionProbe::down(),
            Arc::default(),
            Some("Nexus_1"),
        );

        let err = orch
            .run(&[module("api"), module("mobile")], RunOptions::default())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("Unknown device 'Nexus_1'"));

        let latest = dir.path().join("latest");
        let combined = ResultDocument::load(&latest.join("output.xml")).unwrap();
        assert_eq!(combined.counts().total, 2);
        assert!(combined.get("api.api::cls::stable").is_some());
        assert!(latest.join("report.html").exists());
        assert!(latest.join("artifacts").join("api.png").exists());
    }

    #[tokio::test]
    async fn test_bridge_not_ready_aborts_module() {
        let dir = tempfile::tempdir().unwrap();
        let control = Arc::new(FakeControl::default());
        let mut orch = orchestrator(
            dir.path(),
            control.clone(),
            SessionProbe::down(),
            Arc::default(),
            None,
        );

        let err = orch.run(&[module("mobile")], RunOptions::default()).await.unwrap_err();

        assert!(format!("{:#}", err).contains("not ready"));
        assert_eq!(control.spawn_count(), 1);
        assert!(orch.runner.envs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_modules() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let mut orch = orchestrator(
            dir.path(),
            Arc::default(),
            SessionProbe::down(),
            Arc::default(),
            None,
        )
        .with_cancellation(token);

        let summary = orch.run(&[module("api")], RunOptions::default()).await.unwrap();
        assert!(summary.modules.is_empty());
        assert_eq!(summary.combined.total, 0);
    }

    #[tokio::test]
    async fn test_no_modules_is_empty_summary() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(
            dir.path(),
            Arc::default(),
            SessionProbe::down(),
            Arc::default(),
            None,
        );
        let summary = orch.run(&[], RunOptions::default()).await.unwrap();
        assert!(summary.modules.is_empty());
        assert_eq!(summary.exit_code(true), 0);
    }
}
