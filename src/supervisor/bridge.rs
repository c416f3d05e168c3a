//! Automation bridge server lifecycle.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use super::control::{LaunchSpec, OutputTarget};
use super::process::ProcessHandle;
use super::{Supervisor, SupervisorError, SupervisorResult};
use crate::ports::PortAssignment;
use crate::wait::WaitOutcome;

/// How this run came to use its bridge server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeDisposition {
    /// Started by this run; torn down when the module finishes.
    Spawned,
    /// Already running with no sessions; used as if it were ours.
    Adopted,
    /// Already serving the listed sessions; shared with rebased ports.
    Shared { sessions: Vec<String> },
}

/// A bridge server ready for one module's tests.
#[derive(Debug)]
pub struct BridgeServer {
    /// Present only when this run spawned the server.
    pub process: Option<ProcessHandle>,
    /// Log file of a spawned server.
    pub log_path: Option<PathBuf>,
    /// Ports the tests must use.
    pub ports: PortAssignment,
    pub disposition: BridgeDisposition,
}

impl BridgeServer {
    /// Stops the server if this run started it.
    pub async fn teardown(&mut self, grace: Duration) {
        if let Some(process) = self.process.as_mut() {
            process.teardown(grace).await;
        }
    }
}

impl Supervisor {
    /// Makes a bridge server available on `base_port`.
    ///
    /// * Server down: the port is freed, a new server is started with its
    ///   output in `log_path`, and the log is polled for the ready marker.
    /// * Server up and idle: it is adopted; nothing is spawned or killed.
    /// * Server up with sessions: the derived ports are rebased past those
    ///   sessions; nothing is spawned or killed.
    pub async fn ensure_bridge_server(
        &self,
        module: &str,
        base_port: u16,
        log_path: &Path,
    ) -> SupervisorResult<BridgeServer> {
        let ports = self.bridge.port_layout().assign(base_port);
        let probe = self.probe_session(base_port).await;

        if probe.server_up {
            if probe.active_sessions.is_empty() {
                info!("[{}] Adopting idle bridge server on port {}", module, base_port);
                return Ok(BridgeServer {
                    process: None,
                    log_path: None,
                    ports,
                    disposition: BridgeDisposition::Adopted,
                });
            }

            let rebased = ports.rebase(probe.active_sessions.len());
            warn!(
                "[{}] Bridge server on port {} has {} active sessions, sharing it with ports {:?}",
                module,
                base_port,
                probe.active_sessions.len(),
                rebased.ports()
            );
            return Ok(BridgeServer {
                process: None,
                log_path: None,
                ports: rebased,
                disposition: BridgeDisposition::Shared {
                    sessions: probe.active_sessions,
                },
            });
        }

        self.free_port(base_port).await?;

        let spec = self.bridge_launch_spec(base_port, log_path)?;
        info!("[{}] Starting bridge server: {}", module, spec.display());
        let mut process = self.control.spawn(spec)?;

        let timeout = Duration::from_secs(self.bridge.startup_timeout_secs);
        let marker = self.bridge.ready_marker.clone();
        let log = log_path.to_path_buf();
        let outcome = self
            .waiter(timeout, format!("Waiting for bridge server on port {base_port}"))
            .with_interval(Duration::from_millis(500))
            .until(|| {
                let log = log.clone();
                let marker = marker.clone();
                async move {
                    let content = tokio::fs::read_to_string(&log).await.ok()?;
                    content.contains(&marker).then_some(())
                }
            })
            .await;

        match outcome {
            WaitOutcome::Ready(()) => {
                info!("[{}] Bridge server ready on port {}", module, base_port);
                Ok(BridgeServer {
                    process: Some(process),
                    log_path: Some(log),
                    ports,
                    disposition: BridgeDisposition::Spawned,
                })
            }
            WaitOutcome::TimedOut | WaitOutcome::Cancelled => {
                process.teardown(self.grace_period()).await;
                Err(SupervisorError::ServerNotReady {
                    port: base_port,
                    timeout,
                })
            }
        }
    }

    /// Probes the bridge server on `base_port` with the configured timeout.
    pub async fn probe_session(&self, base_port: u16) -> super::SessionProbe {
        let timeout = Duration::from_millis(self.bridge.probe_timeout_ms);
        self.prober.probe(&self.bridge.host, base_port, timeout).await
    }

    fn bridge_launch_spec(&self, base_port: u16, log_path: &Path) -> SupervisorResult<LaunchSpec> {
        let cmdline = self.bridge.command.replace("{port}", &base_port.to_string());
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(LaunchSpec::parse(&cmdline)?.output(OutputTarget::File(log_path.to_path_buf())))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::SessionProbe;
    use super::super::testing::*;
    use super::*;

    const READY: &str = "Appium REST http interface listener started on 0.0.0.0:4723\n";

    #[tokio::test]
    async fn test_server_down_frees_port_then_spawns() {
        let control = Arc::new(FakeControl {
            on_spawn_write: Some(READY.to_string()),
            ..Default::default()
        });
        control.owners.lock().unwrap().insert(4723, 99);
        let supervisor = supervisor(control.clone(), SessionProbe::down(), Arc::default());
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("bridge-4723.log");

        let server = supervisor.ensure_bridge_server("mobile", 4723, &log).await.unwrap();

        assert_eq!(server.disposition, BridgeDisposition::Spawned);
        assert_eq!(server.ports.ports(), [4723, 6723, 7723, 8723]);
        assert_eq!(server.log_path.as_deref(), Some(log.as_path()));

        let calls = control.calls();
        let kill = calls.iter().position(|c| c == "terminate 99").unwrap();
        let spawn = calls.iter().position(|c| c == "spawn appium").unwrap();
        assert!(kill < spawn, "port must be freed before spawning: {calls:?}");

        let spec = control.spawned.lock().unwrap()[0].clone();
        assert!(spec.args.contains(&"4723".to_string()));
        assert_eq!(spec.output, OutputTarget::File(log));
    }

    #[tokio::test]
    async fn test_idle_server_is_adopted() {
        let control = Arc::new(FakeControl::default());
        let supervisor = supervisor(control.clone(), SessionProbe::up(vec![]), Arc::default());
        let dir = tempfile::tempdir().unwrap();

        let server = supervisor
            .ensure_bridge_server("mobile", 4723, &dir.path().join("b.log"))
            .await
            .unwrap();

        assert_eq!(server.disposition, BridgeDisposition::Adopted);
        assert!(server.process.is_none());
        assert_eq!(server.ports.chromedriver_port, 6723);
        assert!(control.calls().is_empty(), "no spawn, no kill");
    }

    #[tokio::test]
    async fn test_busy_server_is_shared_with_rebased_ports() {
        let control = Arc::new(FakeControl::default());
        let probe = SessionProbe::up(vec!["a".into(), "b".into()]);
        let supervisor = supervisor(control.clone(), probe, Arc::default());
        let dir = tempfile::tempdir().unwrap();

        let server = supervisor
            .ensure_bridge_server("mobile", 4723, &dir.path().join("b.log"))
            .await
            .unwrap();

        assert_eq!(server.ports.ports(), [4723, 10723, 11723, 12723]);
        assert_eq!(
            server.disposition,
            BridgeDisposition::Shared {
                sessions: vec!["a".into(), "b".into()]
            }
        );
        assert_eq!(control.spawn_count(), 0);
        assert!(control.killed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_ready_marker_is_fatal() {
        let control = Arc::new(FakeControl {
            on_spawn_write: Some("starting...\n".to_string()),
            ..Default::default()
        });
        let supervisor = supervisor(control.clone(), SessionProbe::down(), Arc::default());
        let dir = tempfile::tempdir().unwrap();

        let err = supervisor
            .ensure_bridge_server("mobile", 4723, &dir.path().join("b.log"))
            .await
            .unwrap_err();

        assert!(matches!(err, SupervisorError::ServerNotReady { port: 4723, .. }));
        assert_eq!(control.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_kill_failure_prevents_spawn() {
        let control = Arc::new(FakeControl {
            kill_fails: true,
            ..Default::default()
        });
        control.owners.lock().unwrap().insert(4723, 7);
        let supervisor = supervisor(control.clone(), SessionProbe::down(), Arc::default());
        let dir = tempfile::tempdir().unwrap();

        let err = supervisor
            .ensure_bridge_server("mobile", 4723, &dir.path().join("b.log"))
            .await
            .unwrap_err();

        assert!(matches!(err, SupervisorError::KillFailed { .. }));
        assert_eq!(control.spawn_count(), 0);
    }
}
