//! Emulator lifecycle over a device-bridge CLI.
//!
//! The device bridge (`adb`) lists attached devices and resolves an
//! emulator's image name; the emulator launcher lists launchable images and
//! boots one. A device is requested by a human name, which may be either an
//! attached serial or an image name.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::control::{LaunchSpec, OutputTarget, ProcessControl};
use super::process::ProcessHandle;
use super::{Supervisor, SupervisorError, SupervisorResult};
use crate::config::EmulatorConfig;
use crate::wait::WaitOutcome;

/// Device enumeration and launch commands.
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    /// Serials of attached physical and virtual devices.
    async fn attached_devices(&self) -> SupervisorResult<Vec<String>>;

    /// Names of launchable emulator images.
    async fn available_images(&self) -> SupervisorResult<Vec<String>>;

    /// Image name of a running emulator; `None` for physical devices.
    async fn image_name(&self, serial: &str) -> SupervisorResult<Option<String>>;

    /// Command that boots `image`.
    fn launch_spec(&self, image: &str) -> LaunchSpec;
}

/// [`DeviceBridge`] over the Android `adb` and `emulator` CLIs.
pub struct AdbBridge {
    control: Arc<dyn ProcessControl>,
    config: EmulatorConfig,
}

impl AdbBridge {
    pub fn new(control: Arc<dyn ProcessControl>, config: EmulatorConfig) -> Self {
        Self { control, config }
    }

    async fn run(&self, program: &str, args: &[&str]) -> SupervisorResult<String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.control
            .capture(program, &args)
            .await
            .map_err(|e| SupervisorError::DeviceBridge(e.to_string()))
    }
}

#[async_trait]
impl DeviceBridge for AdbBridge {
    async fn attached_devices(&self) -> SupervisorResult<Vec<String>> {
        let output = self.run(&self.config.adb, &["devices"]).await?;
        Ok(parse_device_list(&self.control.split_lines(&output)))
    }

    async fn available_images(&self) -> SupervisorResult<Vec<String>> {
        let output = self.run(&self.config.emulator, &["-list-avds"]).await?;
        Ok(self
            .control
            .split_lines(&output)
            .into_iter()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("INFO"))
            .map(str::to_string)
            .collect())
    }

    async fn image_name(&self, serial: &str) -> SupervisorResult<Option<String>> {
        let output = self
            .run(&self.config.adb, &["-s", serial, "emu", "avd", "name"])
            .await?;
        Ok(self
            .control
            .split_lines(&output)
            .first()
            .map(|line| line.trim().to_string())
            .filter(|name| !name.is_empty() && name != "OK"))
    }

    fn launch_spec(&self, image: &str) -> LaunchSpec {
        LaunchSpec::new(self.config.emulator.clone())
            .args(["-avd", image])
            .args(self.config.extra_args.iter().cloned())
    }
}

/// Parses `adb devices` output: a header line, then `serial<TAB>state`.
///
/// A cold-started daemon prints `* daemon ...` lines before the header, so
/// everything up to and including the header is dropped.
fn parse_device_list(lines: &[&str]) -> Vec<String> {
    let start = lines
        .iter()
        .position(|line| line.trim_start().starts_with("List of devices"))
        .map_or(0, |header| header + 1);

    lines[start..]
        .iter()
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter_map(|line| line.split(['\t', ' ']).next())
        .map(str::trim)
        .filter(|serial| !serial.is_empty())
        .map(str::to_string)
        .collect()
}

/// Boot progress observed on the emulator's standard output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Booting,
    Booted,
    /// Output ended before the boot marker appeared.
    StreamClosed,
}

/// Reads `output` line by line in the background, publishing boot progress.
///
/// The reader keeps draining after the marker so the child never blocks on a
/// full pipe.
pub fn watch_boot<R>(output: R, marker: String) -> watch::Receiver<BootState>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = watch::channel(BootState::Booting);
    tokio::spawn(async move {
        let mut lines = BufReader::new(output).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(target: "emulator", "{}", line);
                    if line.contains(&marker) {
                        tx.send_replace(BootState::Booted);
                    }
                }
                Ok(None) | Err(_) => {
                    tx.send_if_modified(|state| {
                        if *state == BootState::Booting {
                            *state = BootState::StreamClosed;
                            true
                        } else {
                            false
                        }
                    });
                    break;
                }
            }
        }
    });
    rx
}

impl Supervisor {
    /// Makes the device called `device_name` available.
    ///
    /// Returns `None` when it is already running, or the emulator process
    /// this call started. Boot is best-effort: if the marker never appears
    /// within the timeout, a warning is logged and the process is returned
    /// anyway. A name that is neither attached nor launchable fails without
    /// spawning anything.
    pub async fn ensure_emulator(&mut self, device_name: &str) -> SupervisorResult<Option<ProcessHandle>> {
        if let Some(serial) = self.find_running(device_name).await? {
            info!("Device '{}' already running as {}", device_name, serial);
            self.device_serial = Some(serial);
            return Ok(None);
        }

        let images = self.devices.available_images().await?;
        if !images.iter().any(|image| image == device_name) {
            let attached = self.devices.attached_devices().await.unwrap_or_default();
            return Err(SupervisorError::DeviceUnknown {
                name: device_name.to_string(),
                attached: attached.join(", "),
                images: images.join(", "),
            });
        }

        let spec = self.devices.launch_spec(device_name).output(OutputTarget::Piped);
        info!("Starting emulator: {}", spec.display());
        let mut process = self.control.spawn(spec)?;

        let timeout = Duration::from_secs(self.emulator.boot_timeout_secs);
        match process.take_stdout() {
            Some(stdout) => {
                let rx = watch_boot(stdout, self.emulator.boot_marker.clone());
                let outcome = self
                    .waiter(timeout, format!("Booting {device_name}"))
                    .with_interval(Duration::from_millis(250))
                    .until(|| {
                        let state = *rx.borrow();
                        async move { (state != BootState::Booting).then_some(state) }
                    })
                    .await;
                match outcome {
                    WaitOutcome::Ready(BootState::Booted) => info!("Device '{}' booted", device_name),
                    WaitOutcome::Ready(_) => {
                        warn!("Emulator output closed before boot completed, continuing")
                    }
                    WaitOutcome::TimedOut => {
                        warn!("Device '{}' not booted after {:?}, continuing", device_name, timeout)
                    }
                    WaitOutcome::Cancelled => warn!("Boot wait for '{}' cancelled", device_name),
                }
            }
            None => warn!("Emulator output not captured, skipping boot wait"),
        }

        self.device_serial = self.find_running(device_name).await.unwrap_or_else(|e| {
            warn!("Failed to resolve serial for '{}': {}", device_name, e);
            None
        });
        if self.device_serial.is_none() {
            warn!("Device '{}' not visible to the device bridge yet", device_name);
        }

        Ok(Some(process))
    }

    /// Serial of the attached device whose serial or image name matches.
    async fn find_running(&self, device_name: &str) -> SupervisorResult<Option<String>> {
        for serial in self.devices.attached_devices().await? {
            if serial == device_name {
                return Ok(Some(serial));
            }
            match self.devices.image_name(&serial).await {
                Ok(Some(name)) if name == device_name => return Ok(Some(serial)),
                Ok(_) => {}
                Err(e) => debug!("Failed to resolve image name of {}: {}", serial, e),
            }
        }
        Ok(None)
    }
}
