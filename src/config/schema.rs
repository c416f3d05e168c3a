//! Configuration schema definitions for conductor.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── ConductorConfig   - Paths, retry budget, device selection
//! ├── RunnerConfig      - How to run a suite and rerun its failures
//! ├── BridgeConfig      - Automation bridge server and its port bundle
//! ├── EmulatorConfig    - Device bridge CLIs and boot detection
//! └── ReportConfig      - External report generator
//! ```
//!
//! Only `[runner]` is required; every other section has defaults.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ports::{DEFAULT_PORT_OFFSETS, DEFAULT_REBASE_STRIDE, PortLayout};
use crate::report::JunitFormat;

/// Root configuration structure for conductor.
///
/// # Example
///
/// ```
/// use conductor::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [conductor]
///     retry_times = 2
///
///     [runner]
///     command = "pytest {suite} --junitxml={output}"
///     rerun_command = "pytest {failed} --junitxml={output}"
/// "#).unwrap();
/// assert_eq!(config.conductor.retry_times, 2);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Core settings (paths, retries, device selection).
    #[serde(default)]
    pub conductor: ConductorConfig,

    /// Suite runner command templates.
    pub runner: RunnerConfig,

    /// Automation bridge server settings.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Emulator and device bridge settings.
    #[serde(default)]
    pub emulator: EmulatorConfig,

    /// Report generation settings.
    #[serde(default)]
    pub report: ReportConfig,
}

/// Core orchestration settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `test_root` | `"test_cases"` |
/// | `log_root` | `"logs"` |
/// | `retry_times` | 1 |
/// | `device_name` | None |
/// | `device_modules` | `["mobile"]` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConductorConfig {
    /// Directory whose sub-directories are the test modules.
    #[serde(default = "default_test_root")]
    pub test_root: PathBuf,

    /// Root directory for per-run logs and the `latest` archive.
    #[serde(default = "default_log_root")]
    pub log_root: PathBuf,

    /// Number of failures-only reruns after the first full attempt.
    ///
    /// Ignored in debug and stop-on-failure modes.
    #[serde(default = "default_retry_times")]
    pub retry_times: usize,

    /// Human-readable device name (an emulator image or a device serial).
    pub device_name: Option<String>,

    /// Modules that need an emulator and a bridge server before they run.
    #[serde(default = "default_device_modules")]
    pub device_modules: Vec<String>,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            test_root: default_test_root(),
            log_root: default_log_root(),
            retry_times: default_retry_times(),
            device_name: None,
            device_modules: default_device_modules(),
        }
    }
}

fn default_test_root() -> PathBuf {
    PathBuf::from("test_cases")
}

fn default_log_root() -> PathBuf {
    PathBuf::from("logs")
}

fn default_retry_times() -> usize {
    1
}

fn default_device_modules() -> Vec<String> {
    vec!["mobile".to_string()]
}

/// How to run a module's suite.
///
/// Commands are templates. Placeholders are substituted per attempt:
///
/// | Placeholder | Value |
/// |-------------|-------|
/// | `{module}` | Module name |
/// | `{suite}` | Module suite directory |
/// | `{output}` | Result file this attempt must write (JUnit XML) |
/// | `{source}` | Previous attempt's result file (reruns only) |
/// | `{failed}` | Shell-quoted runner ids of the items to rerun |
/// | `{failed_file}` | File listing those ids, one per line |
/// | `{artifacts}` | Directory for auxiliary artifacts |
///
/// # Example
///
/// ```toml
/// [runner]
/// command = "pytest {suite} --junitxml={output}"
/// rerun_command = "pytest {failed} --junitxml={output}"
/// junit_format = "pytest"
/// stop_on_failure_args = ["-x"]
///
/// [runner.env]
/// PYTHONPATH = "."
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Template for the full-suite attempt.
    pub command: String,

    /// Template for failures-only reruns.
    pub rerun_command: String,

    /// How result-file items map back to runner-native ids.
    #[serde(default)]
    pub junit_format: JunitFormat,

    /// Extra arguments appended in debug mode.
    #[serde(default)]
    pub debug_args: Vec<String>,

    /// Extra arguments appended in stop-on-failure mode.
    #[serde(default)]
    pub stop_on_failure_args: Vec<String>,

    /// Upper bound on one attempt's wall-clock time.
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,

    /// Environment variables for every attempt.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_attempt_timeout() -> u64 {
    3600
}

/// Automation bridge server settings.
///
/// # Example
///
/// ```toml
/// [bridge]
/// host = "127.0.0.1"
/// base_port = 4723
/// command = "appium --port {port} --allow-insecure chromedriver_autodownload"
/// ready_marker = "Appium REST http interface listener started"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Path of the active-sessions endpoint.
    #[serde(default = "default_session_path")]
    pub session_path: String,

    /// Template for launching the server; `{port}` is the base port.
    #[serde(default = "default_bridge_command")]
    pub command: String,

    /// Log line that means the server accepts connections.
    #[serde(default = "default_ready_marker")]
    pub ready_marker: String,

    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Offsets of the chromedriver, MJPEG and system ports.
    #[serde(default = "default_port_offsets")]
    pub port_offsets: [u16; 3],

    /// Shift per foreign session when sharing a server.
    #[serde(default = "default_rebase_stride")]
    pub rebase_stride: u16,

    /// Time a child process gets to exit after SIGTERM before it is killed.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            base_port: default_base_port(),
            session_path: default_session_path(),
            command: default_bridge_command(),
            ready_marker: default_ready_marker(),
            startup_timeout_secs: default_startup_timeout(),
            probe_timeout_ms: default_probe_timeout(),
            port_offsets: default_port_offsets(),
            rebase_stride: default_rebase_stride(),
            grace_period_secs: default_grace_period(),
        }
    }
}

impl BridgeConfig {
    pub fn port_layout(&self) -> PortLayout {
        PortLayout {
            offsets: self.port_offsets,
            rebase_stride: self.rebase_stride,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_base_port() -> u16 {
    4723
}

fn default_session_path() -> String {
    "/wd/hub/sessions".to_string()
}

fn default_bridge_command() -> String {
    "appium --port {port} --allow-insecure chromedriver_autodownload".to_string()
}

fn default_ready_marker() -> String {
    "Appium REST http interface listener started".to_string()
}

fn default_startup_timeout() -> u64 {
    60
}

fn default_probe_timeout() -> u64 {
    1000
}

fn default_port_offsets() -> [u16; 3] {
    DEFAULT_PORT_OFFSETS
}

fn default_rebase_stride() -> u16 {
    DEFAULT_REBASE_STRIDE
}

fn default_grace_period() -> u64 {
    10
}

/// Device bridge and emulator settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmulatorConfig {
    /// Device bridge CLI.
    #[serde(default = "default_adb")]
    pub adb: String,

    /// Emulator launcher CLI.
    #[serde(default = "default_emulator")]
    pub emulator: String,

    /// Standard-output line that means the device finished booting.
    #[serde(default = "default_boot_marker")]
    pub boot_marker: String,

    /// Best-effort boot wait; the run proceeds when it elapses.
    #[serde(default = "default_boot_timeout")]
    pub boot_timeout_secs: u64,

    /// Extra arguments for the emulator launcher (e.g. `-no-window`).
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            adb: default_adb(),
            emulator: default_emulator(),
            boot_marker: default_boot_marker(),
            boot_timeout_secs: default_boot_timeout(),
            extra_args: Vec::new(),
        }
    }
}

fn default_adb() -> String {
    "adb".to_string()
}

fn default_emulator() -> String {
    "emulator".to_string()
}

fn default_boot_marker() -> String {
    "emulator: INFO: boot completed".to_string()
}

fn default_boot_timeout() -> u64 {
    10
}

/// External report generator settings.
///
/// The generator is invoked as
/// `{generator} generate <artifacts> --output <report> --clean`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    #[serde(default = "default_generator")]
    pub generator: String,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            generator: default_generator(),
            enabled: true,
        }
    }
}

fn default_generator() -> String {
    "allure".to_string()
}

fn default_true() -> bool {
    true
}
