//! Platform-specific process control.
//!
//! Command construction, line splitting, port-owner lookup and process
//! termination differ between Unix and Windows. Everything above this module
//! talks to a [`ProcessControl`] and stays platform-agnostic.
//!
//! | Operation | Unix | Windows |
//! |-----------|------|---------|
//! | Program wrapping | none | `cmd /c <program>` |
//! | Shell | `sh -c` | `cmd /C` |
//! | Line split | `\n` | `\r\n` |
//! | Port owner | `lsof -t -iTCP:<port> -sTCP:LISTEN` | `netstat -ano` |
//! | Terminate | `SIGTERM` | `taskkill /F /PID` |

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::process::ProcessHandle;
use super::{SupervisorError, SupervisorResult};

/// Where a spawned process writes its standard output and error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Discard both streams.
    Null,
    /// Pipe stdout back to the supervisor; stderr is discarded.
    Piped,
    /// Append both streams to a log file.
    File(PathBuf),
}

/// Everything needed to launch a long-lived child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub output: OutputTarget,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            output: OutputTarget::Null,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn output(mut self, output: OutputTarget) -> Self {
        self.output = output;
        self
    }

    /// Parses a shell-style command line into a spec.
    pub fn parse(cmdline: &str) -> SupervisorResult<Self> {
        let mut words = shell_words::split(cmdline)
            .map_err(|e| SupervisorError::Spawn {
                program: cmdline.to_string(),
                reason: e.to_string(),
            })?
            .into_iter();
        let program = words.next().ok_or_else(|| SupervisorError::Spawn {
            program: cmdline.to_string(),
            reason: "empty command".to_string(),
        })?;
        Ok(Self::new(program).args(words))
    }

    /// Human-readable command line for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Process operations that differ by platform.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    fn name(&self) -> &'static str;

    /// Builds a command for `program`, wrapped as the platform requires.
    fn command(&self, program: &str) -> Command;

    /// Builds a command that runs `cmdline` through the platform shell.
    fn shell(&self, cmdline: &str) -> Command;

    /// Splits captured CLI output into lines, dropping empty ones.
    fn split_lines<'a>(&self, output: &'a str) -> Vec<&'a str>;

    /// Returns the pid listening on `port`, or `None` if the port is free.
    ///
    /// Lookup output of an unexpected shape is an error.
    async fn port_owner(&self, port: u16) -> SupervisorResult<Option<u32>>;

    /// Asks `pid` to terminate.
    async fn terminate_pid(&self, pid: u32) -> std::io::Result<()>;

    /// Runs `program` to completion and returns its standard output.
    ///
    /// A non-zero exit that printed to stderr is an error. A quiet non-zero
    /// exit is not: `lsof` exits 1 with no output when nothing listens.
    async fn capture(&self, program: &str, args: &[String]) -> SupervisorResult<String> {
        let output = self
            .command(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SupervisorError::Spawn {
                program: program.to_string(),
                reason: e.to_string(),
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() && !stderr.trim().is_empty() {
            return Err(SupervisorError::CommandFailed {
                program: program.to_string(),
                code: output.status.code(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Spawns a long-lived child process.
    fn spawn(&self, spec: LaunchSpec) -> SupervisorResult<ProcessHandle> {
        let mut command = self.command(&spec.program);
        command.args(&spec.args).stdin(Stdio::null()).kill_on_drop(true);
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        match &spec.output {
            OutputTarget::Null => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
            OutputTarget::Piped => {
                command.stdout(Stdio::piped()).stderr(Stdio::null());
            }
            OutputTarget::File(path) => {
                let log = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                let err = log.try_clone()?;
                command.stdout(Stdio::from(log)).stderr(Stdio::from(err));
            }
        }

        let child = command.spawn().map_err(|e| SupervisorError::Spawn {
            program: spec.program.clone(),
            reason: e.to_string(),
        })?;
        debug!("Spawned `{}` (pid {:?})", spec.display(), child.id());
        Ok(ProcessHandle::new(spec.program, child))
    }
}

/// Selects the process control for the running platform.
pub fn platform_control() -> Arc<dyn ProcessControl> {
    #[cfg(windows)]
    {
        Arc::new(WindowsControl)
    }
    #[cfg(not(windows))]
    {
        Arc::new(UnixControl)
    }
}

/// Process control over POSIX tools and signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixControl;

#[async_trait]
impl ProcessControl for UnixControl {
    fn name(&self) -> &'static str {
        "unix"
    }

    fn command(&self, program: &str) -> Command {
        Command::new(program)
    }

    fn shell(&self, cmdline: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmdline);
        command
    }

    fn split_lines<'a>(&self, output: &'a str) -> Vec<&'a str> {
        output
            .split('\n')
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .collect()
    }

    async fn port_owner(&self, port: u16) -> SupervisorResult<Option<u32>> {
        let args = vec![
            "-t".to_string(),
            format!("-iTCP:{port}"),
            "-sTCP:LISTEN".to_string(),
        ];
        let output = self
            .capture("lsof", &args)
            .await
            .map_err(|e| SupervisorError::PortLookup {
                port,
                reason: e.to_string(),
            })?;
        parse_lsof(&self.split_lines(&output), port)
    }

    async fn terminate_pid(&self, pid: u32) -> std::io::Result<()> {
        send_sigterm(pid)
    }
}

/// Process control over `cmd`, `netstat` and `taskkill`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsControl;

#[async_trait]
impl ProcessControl for WindowsControl {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn command(&self, program: &str) -> Command {
        let mut command = Command::new("cmd");
        command.arg("/c").arg(program);
        command
    }

    fn shell(&self, cmdline: &str) -> Command {
        let mut command = Command::new("cmd");
        command.arg("/C").arg(cmdline);
        command
    }

    fn split_lines<'a>(&self, output: &'a str) -> Vec<&'a str> {
        output
            .split("\r\n")
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .collect()
    }

    async fn port_owner(&self, port: u16) -> SupervisorResult<Option<u32>> {
        let output = self
            .capture("netstat", &["-ano".to_string()])
            .await
            .map_err(|e| SupervisorError::PortLookup {
                port,
                reason: e.to_string(),
            })?;
        parse_netstat(&self.split_lines(&output), port)
    }

    async fn terminate_pid(&self, pid: u32) -> std::io::Result<()> {
        let status = Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(format!("taskkill exited with {status}")))
        }
    }
}

#[cfg(unix)]
pub(crate) fn send_sigterm(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
pub(crate) fn send_sigterm(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "signals are not available on this platform",
    ))
}

/// Parses `lsof -t` output: one pid per line, nothing when the port is free.
fn parse_lsof(lines: &[&str], port: u16) -> SupervisorResult<Option<u32>> {
    let mut pids = Vec::with_capacity(lines.len());
    for line in lines {
        let pid = line.trim().parse::<u32>().map_err(|_| SupervisorError::PortLookup {
            port,
            reason: format!("unexpected lsof output: {line:?}"),
        })?;
        pids.push(pid);
    }
    if pids.len() > 1 {
        debug!("Port {} has {} listeners, using pid {}", port, pids.len(), pids[0]);
    }
    Ok(pids.first().copied())
}

/// Parses `netstat -ano` output for a TCP listener on `port`.
fn parse_netstat(lines: &[&str], port: u16) -> SupervisorResult<Option<u32>> {
    let pattern = regex::Regex::new(&format!(r"^\s*TCP\s+\S+:{port}\s+\S+\s+LISTENING\s+(\S+)\s*$"))
        .map_err(|e| SupervisorError::PortLookup {
            port,
            reason: e.to_string(),
        })?;

    for line in lines {
        if let Some(captures) = pattern.captures(line) {
            let pid = captures[1].parse::<u32>().map_err(|_| SupervisorError::PortLookup {
                port,
                reason: format!("unexpected netstat output: {line:?}"),
            })?;
            return Ok(Some(pid));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsof() {
        assert_eq!(parse_lsof(&[], 4723).unwrap(), None);
        assert_eq!(parse_lsof(&["1234"], 4723).unwrap(), Some(1234));
        assert_eq!(parse_lsof(&["1234", "99"], 4723).unwrap(), Some(1234));
    }

    #[test]
    fn test_parse_lsof_unexpected_shape_is_fatal() {
        let err = parse_lsof(&["lsof: WARNING: can't stat()"], 4723).unwrap_err();
        assert!(matches!(err, SupervisorError::PortLookup { port: 4723, .. }));
    }

    #[test]
    fn test_parse_netstat() {
        let output = "\r\nActive Connections\r\n\r\n  Proto  Local Address          Foreign Address        State           PID\r\n  TCP    0.0.0.0:135            0.0.0.0:0              LISTENING       1012\r\n  TCP    0.0.0.0:4723           0.0.0.0:0              LISTENING       5520\r\n  TCP    127.0.0.1:47230        127.0.0.1:4723         ESTABLISHED     7000\r\n";
        let lines = WindowsControl.split_lines(output);
        assert_eq!(parse_netstat(&lines, 4723).unwrap(), Some(5520));
        assert_eq!(parse_netstat(&lines, 8080).unwrap(), None);
    }

    #[test]
    fn test_parse_netstat_bad_pid_is_fatal() {
        let lines = ["  TCP    0.0.0.0:4723    0.0.0.0:0    LISTENING    n/a"];
        assert!(parse_netstat(&lines, 4723).is_err());
    }

    #[test]
    fn test_split_lines() {
        assert_eq!(UnixControl.split_lines("a\nb\n\n"), ["a", "b"]);
        assert_eq!(WindowsControl.split_lines("a\r\nb\r\n"), ["a", "b"]);
    }

    #[test]
    fn test_launch_spec_parse() {
        let spec = LaunchSpec::parse("appium --port 4723 --base-path '/wd/hub'").unwrap();
        assert_eq!(spec.program, "appium");
        assert_eq!(spec.args, ["--port", "4723", "--base-path", "/wd/hub"]);
        assert_eq!(spec.display(), "appium --port 4723 --base-path /wd/hub");
        assert!(LaunchSpec::parse("   ").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capture_runs_program() {
        let output = UnixControl
            .capture("echo", &["hello".to_string()])
            .await
            .unwrap();
        assert_eq!(UnixControl.split_lines(&output), ["hello"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capture_failure_with_stderr_is_an_error() {
        let args = ["-c".to_string(), "echo 'lsof: unsupported option' >&2; exit 2".to_string()];
        let err = UnixControl.capture("sh", &args).await.unwrap_err();
        match err {
            SupervisorError::CommandFailed { program, code, stderr } => {
                assert_eq!(program, "sh");
                assert_eq!(code, Some(2));
                assert_eq!(stderr, "lsof: unsupported option");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capture_quiet_failure_is_empty_output() {
        let args = ["-c".to_string(), "exit 1".to_string()];
        assert_eq!(UnixControl.capture("sh", &args).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_capture_missing_program_is_spawn_error() {
        let err = UnixControl
            .capture("conductor-no-such-program", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
    }
}
