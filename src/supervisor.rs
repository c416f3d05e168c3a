//! Lifecycle of the infrastructure tests depend on.
//!
//! The supervisor owns two kinds of child processes: a virtual-device
//! emulator and a UI-automation bridge server. It probes before it acquires
//! anything. A bridge server that is already serving other sessions is shared
//! (with rebased ports), an idle one is adopted, and only a missing one is
//! started, after forcibly freeing its port.
//!
//! # Error policy
//!
//! | Condition | Outcome |
//! |-----------|---------|
//! | Probe fails or times out | Server treated as down |
//! | Port lookup fails or its output is unrecognized | [`SupervisorError::PortLookup`] |
//! | Found port owner cannot be killed | [`SupervisorError::KillFailed`] |
//! | Device neither attached nor launchable | [`SupervisorError::DeviceUnknown`] |
//! | Bridge log never shows the ready marker | [`SupervisorError::ServerNotReady`] |
//! | Emulator never prints its boot marker | Warning, run continues |

pub mod bridge;
pub mod control;
pub mod emulator;
pub mod probe;
pub mod process;

pub use bridge::{BridgeDisposition, BridgeServer};
pub use control::{LaunchSpec, OutputTarget, ProcessControl, UnixControl, WindowsControl, platform_control};
pub use emulator::{AdbBridge, BootState, DeviceBridge};
pub use probe::{HttpSessionProber, SessionProbe, SessionProber};
pub use process::ProcessHandle;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, Config, EmulatorConfig};
use crate::wait::Waiter;

/// Errors that can occur while acquiring infrastructure.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The platform port lookup failed or printed something unexpected.
    #[error("Failed to look up the owner of port {port}: {reason}")]
    PortLookup { port: u16, reason: String },

    /// A process holding a required port could not be terminated.
    #[error("Failed to kill pid {pid} holding port {port}: {reason}")]
    KillFailed { pid: u32, port: u16, reason: String },

    /// The requested device is neither attached nor a launchable image.
    #[error("Unknown device '{name}' (attached: [{attached}], images: [{images}])")]
    DeviceUnknown {
        name: String,
        attached: String,
        images: String,
    },

    #[error("Bridge server on port {port} not ready after {timeout:?}")]
    ServerNotReady { port: u16, timeout: Duration },

    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    /// A captured command exited non-zero and reported an error.
    #[error("{program} exited with {code:?}: {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The device bridge CLI could not be used.
    #[error("Device bridge error: {0}")]
    DeviceBridge(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Acquires and releases emulators and bridge servers.
pub struct Supervisor {
    control: Arc<dyn ProcessControl>,
    prober: Arc<dyn SessionProber>,
    devices: Arc<dyn DeviceBridge>,
    bridge: BridgeConfig,
    emulator: EmulatorConfig,
    device_serial: Option<String>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(
        config: &Config,
        control: Arc<dyn ProcessControl>,
        prober: Arc<dyn SessionProber>,
        devices: Arc<dyn DeviceBridge>,
    ) -> Self {
        Self {
            control,
            prober,
            devices,
            bridge: config.bridge.clone(),
            emulator: config.emulator.clone(),
            device_serial: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Builds a supervisor over the real platform tools.
    pub fn from_config(config: &Config) -> Self {
        let control = platform_control();
        debug!("Using {} process control", control.name());
        let prober = Arc::new(HttpSessionProber::new(config.bridge.session_path.clone()));
        let devices = Arc::new(AdbBridge::new(control.clone(), config.emulator.clone()));
        Self::new(config, control, prober, devices)
    }

    /// Aborts readiness waits when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn control(&self) -> Arc<dyn ProcessControl> {
        self.control.clone()
    }

    /// Serial of the device resolved by the last `ensure_emulator`.
    pub fn device_serial(&self) -> Option<&str> {
        self.device_serial.as_deref()
    }

    /// Time a child gets between terminate and kill.
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.bridge.grace_period_secs)
    }

    /// Kills whatever process is listening on `port`.
    ///
    /// A free port is not an error. A lookup that cannot be interpreted, or a
    /// found process that cannot be signalled, is.
    pub async fn free_port(&self, port: u16) -> SupervisorResult<()> {
        let Some(pid) = self.control.port_owner(port).await? else {
            debug!("Port {} is free", port);
            return Ok(());
        };

        info!("Killing pid {} holding port {}", pid, port);
        self.control
            .terminate_pid(pid)
            .await
            .map_err(|e| SupervisorError::KillFailed {
                pid,
                port,
                reason: e.to_string(),
            })?;

        let released = Waiter::new(self.grace_period())
            .with_interval(Duration::from_millis(250))
            .until(move || async move {
                match self.control.port_owner(port).await {
                    Ok(None) => Some(()),
                    _ => None,
                }
            })
            .await;
        if !released.is_ready() {
            warn!("Port {} still held after terminating pid {}", port, pid);
        }
        Ok(())
    }

    fn waiter(&self, timeout: Duration, message: String) -> Waiter {
        Waiter::new(timeout)
            .with_cancellation(self.cancel.clone())
            .with_progress(message)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_free_port_not_found_is_ok() {
        let control = Arc::new(FakeControl::default());
        let supervisor = supervisor(control.clone(), SessionProbe::down(), Arc::default());
        supervisor.free_port(4723).await.unwrap();
        assert!(control.killed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_free_port_kills_owner() {
        let control = Arc::new(FakeControl::default());
        control.owners.lock().unwrap().insert(4723, 321);
        let supervisor = supervisor(control.clone(), SessionProbe::down(), Arc::default());
        supervisor.free_port(4723).await.unwrap();
        assert_eq!(*control.killed.lock().unwrap(), vec![321]);
    }

    #[tokio::test]
    async fn test_free_port_kill_failure_is_fatal() {
        let control = Arc::new(FakeControl {
            kill_fails: true,
            ..Default::default()
        });
        control.owners.lock().unwrap().insert(4723, 321);
        let supervisor = supervisor(control, SessionProbe::down(), Arc::default());
        let err = supervisor.free_port(4723).await.unwrap_err();
        assert!(matches!(err, SupervisorError::KillFailed { pid: 321, port: 4723, .. }));
    }

    #[tokio::test]
    async fn test_free_port_lookup_failure_is_fatal() {
        let control = Arc::new(FakeControl {
            lookup_fails: true,
            ..Default::default()
        });
        let supervisor = supervisor(control, SessionProbe::down(), Arc::default());
        let err = supervisor.free_port(4723).await.unwrap_err();
        assert!(matches!(err, SupervisorError::PortLookup { port: 4723, .. }));
    }
}
