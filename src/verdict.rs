use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEVICE_NOT_CONNECTED: i64 = 10;
pub const APP_INSTALL_FAILED: i64 = 20;
pub const PROXY_START_FAILED: i64 = 30;
pub const SERVER_CONNECTION_FAILED: i64 = 40;

/// Cause attached to a hard failure. Carried for observability only: every
/// cause gets the same queue treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HardCause {
    DeviceNotConnected,
    AppInstallFailed,
    ProxyStartFailed,
    ServerConnectionFailed,
    Unknown,
}

impl HardCause {
    pub fn code(self) -> Option<i64> {
        match self {
            HardCause::DeviceNotConnected => Some(DEVICE_NOT_CONNECTED),
            HardCause::AppInstallFailed => Some(APP_INSTALL_FAILED),
            HardCause::ProxyStartFailed => Some(PROXY_START_FAILED),
            HardCause::ServerConnectionFailed => Some(SERVER_CONNECTION_FAILED),
            HardCause::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Success,
    SoftFail,
    HardFail(HardCause),
}

impl Verdict {
    pub fn hard(cause: HardCause) -> Self {
        Verdict::HardFail(cause)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::Success)
    }

    pub fn is_soft(&self) -> bool {
        matches!(self, Verdict::SoftFail)
    }

    pub fn is_hard(&self) -> bool {
        matches!(self, Verdict::HardFail(_))
    }

    pub fn code(&self) -> Option<i64> {
        match self {
            Verdict::HardFail(cause) => cause.code(),
            _ => None,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Success => f.write_str("SUCCESS"),
            Verdict::SoftFail => f.write_str("SOFT_FAIL"),
            Verdict::HardFail(cause) => match cause.code() {
                Some(code) => write!(f, "HARD_FAIL({code})"),
                None => f.write_str("HARD_FAIL"),
            },
        }
    }
}

/// Outcome of a failed phase-one capture.
///
/// Device, proxy and appliance-connection problems are hard failures; any
/// other code (install failures included) is treated as a soft failure of
/// this particular app.
pub fn classify_phase_one(code: Option<i64>) -> (Verdict, &'static str) {
    match code {
        Some(DEVICE_NOT_CONNECTED) => (
            Verdict::hard(HardCause::DeviceNotConnected),
            "Device is not connected",
        ),
        Some(PROXY_START_FAILED) => (
            Verdict::hard(HardCause::ProxyStartFailed),
            "Mitm proxy start failed",
        ),
        Some(SERVER_CONNECTION_FAILED) => (
            Verdict::hard(HardCause::ServerConnectionFailed),
            "Connection to REST server failed",
        ),
        Some(APP_INSTALL_FAILED) => (Verdict::SoftFail, "App installation failed"),
        _ => (
            Verdict::SoftFail,
            "Unknown failure during idle traffic capture",
        ),
    }
}

