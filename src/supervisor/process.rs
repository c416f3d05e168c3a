//! Owned child processes.

use std::time::Duration;

use tokio::process::{Child, ChildStdout};
use tracing::{debug, warn};

/// A child process owned by this run.
///
/// Dropping the handle kills the process; [`ProcessHandle::teardown`] stops
/// it gracefully first.
#[derive(Debug)]
pub struct ProcessHandle {
    label: String,
    pid: Option<u32>,
    child: Option<Child>,
}

impl ProcessHandle {
    pub fn new(label: impl Into<String>, child: Child) -> Self {
        Self {
            label: label.into(),
            pid: child.id(),
            child: Some(child),
        }
    }

    /// A handle whose process has already been reaped.
    pub fn exited(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            pid: None,
            child: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Takes the piped standard output, if any.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.as_mut()?.stdout.take()
    }

    /// Terminates the process: polite signal, bounded wait, then kill.
    ///
    /// Calling this on a handle that was already torn down does nothing.
    pub async fn teardown(&mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!("{} already exited ({})", self.label, status);
            return;
        }

        if let Err(e) = request_terminate(&mut child) {
            debug!("Failed to signal {}: {}", self.label, e);
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => debug!("{} exited ({})", self.label, status),
            Ok(Err(e)) => warn!("Failed to wait for {}: {}", self.label, e),
            Err(_) => {
                warn!("{} did not exit within {:?}, killing", self.label, grace);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill {}: {}", self.label, e);
                }
            }
        }
    }
}

#[cfg(unix)]
fn request_terminate(child: &mut Child) -> std::io::Result<()> {
    match child.id() {
        Some(pid) => super::control::send_sigterm(pid),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn request_terminate(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;

    fn sleeper(script: &str) -> ProcessHandle {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        ProcessHandle::new("sleeper", child)
    }

    #[tokio::test]
    async fn test_teardown_terminates_and_is_idempotent() {
        let mut handle = sleeper("sleep 30");
        assert!(handle.pid().is_some());
        assert!(handle.is_running());

        handle.teardown(Duration::from_secs(5)).await;
        assert!(!handle.is_running());

        handle.teardown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_teardown_kills_after_grace() {
        let mut handle = sleeper("trap '' TERM; sleep 30");
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.teardown(Duration::from_millis(200)).await;
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_teardown_of_exited_handle_is_noop() {
        let mut handle = ProcessHandle::exited("gone");
        assert!(!handle.is_running());
        handle.teardown(Duration::from_millis(10)).await;
        assert_eq!(handle.label(), "gone");
    }
}
