//! Port bundles for automation bridge sessions.
//!
//! A bridge server listens on a base port and hands its drivers three
//! derived ports (chromedriver, MJPEG screen stream, on-device system
//! server). Every derived port sits at a fixed offset from the base.
//!
//! When another run already owns a bridge server with live sessions on the
//! base port, this run shares that server and shifts its derived ports out
//! of the way instead of binding a fresh server:
//!
//! ```text
//! base 4723  chromedriver 6723  mjpeg 7723  system 8723
//!    rebase(2 sessions, stride 2000)
//! base 4723  chromedriver 10723 mjpeg 11723 system 12723
//! ```

use serde::{Deserialize, Serialize};

/// Default offsets of the derived ports from the base port.
pub const DEFAULT_PORT_OFFSETS: [u16; 3] = [2000, 3000, 4000];

/// Default shift applied per active foreign session when rebasing.
pub const DEFAULT_REBASE_STRIDE: u16 = 2000;

/// Offsets used to derive a [`PortAssignment`] from a base port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortLayout {
    /// Offsets of the chromedriver, MJPEG and system ports, in that order.
    pub offsets: [u16; 3],

    /// Shift applied to each derived port per foreign session.
    pub rebase_stride: u16,
}

impl Default for PortLayout {
    fn default() -> Self {
        Self {
            offsets: DEFAULT_PORT_OFFSETS,
            rebase_stride: DEFAULT_REBASE_STRIDE,
        }
    }
}

impl PortLayout {
    /// Derives the port bundle for `base_port`.
    pub fn assign(&self, base_port: u16) -> PortAssignment {
        let [chromedriver, mjpeg, system] = self.offsets;
        PortAssignment {
            base_port,
            chromedriver_port: base_port.saturating_add(chromedriver),
            mjpeg_port: base_port.saturating_add(mjpeg),
            system_port: base_port.saturating_add(system),
            rebase_stride: self.rebase_stride,
        }
    }
}

/// The ports one bridge session uses.
///
/// Valid only for the lifetime of the bridge server it was computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAssignment {
    pub base_port: u16,
    pub chromedriver_port: u16,
    pub mjpeg_port: u16,
    pub system_port: u16,
    rebase_stride: u16,
}

impl PortAssignment {
    /// Shifts every derived port by `stride * active_sessions`.
    ///
    /// The base port stays put: the shared server keeps listening where it
    /// already is.
    pub fn rebase(&self, active_sessions: usize) -> PortAssignment {
        let shift = u32::from(self.rebase_stride).saturating_mul(active_sessions as u32);
        let shifted = |port: u16| u16::try_from(u32::from(port) + shift).unwrap_or(u16::MAX);

        PortAssignment {
            base_port: self.base_port,
            chromedriver_port: shifted(self.chromedriver_port),
            mjpeg_port: shifted(self.mjpeg_port),
            system_port: shifted(self.system_port),
            rebase_stride: self.rebase_stride,
        }
    }

    /// All four ports, base first.
    pub fn ports(&self) -> [u16; 4] {
        [
            self.base_port,
            self.chromedriver_port,
            self.mjpeg_port,
            self.system_port,
        ]
    }

    /// Environment variables handed to test runs so they bind the right ports.
    pub fn env(&self) -> Vec<(String, String)> {
        vec![
            ("CONDUCTOR_BRIDGE_PORT".to_string(), self.base_port.to_string()),
            (
                "CONDUCTOR_CHROMEDRIVER_PORT".to_string(),
                self.chromedriver_port.to_string(),
            ),
            ("CONDUCTOR_MJPEG_PORT".to_string(), self.mjpeg_port.to_string()),
            ("CONDUCTOR_SYSTEM_PORT".to_string(), self.system_port.to_string()),
        ]
    }
}

/// Computes the port bundle for `base_port` with the default offsets.
pub fn compute_assignment(base_port: u16) -> PortAssignment {
    PortLayout::default().assign(base_port)
}

/// Rebases `assignment` past `active_sessions` foreign sessions.
pub fn rebase(assignment: &PortAssignment, active_sessions: usize) -> PortAssignment {
    assignment.rebase(active_sessions)
}
