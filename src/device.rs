use crate::{
    apk::ApkInspector,
    config,
    executor::{CommandExecutor, CommandOutcome},
};
use anyhow::{Result, bail};
use serde::Serialize;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Device operations the dispatcher and orchestrator need. Implemented by
/// [`DeviceController`]; tests substitute their own.
pub trait DeviceOps: Send + Sync {
    fn serial(&self) -> &str;
    fn is_connected(&self) -> bool;
    /// Best-effort reboot issued when the fleet deadline has passed.
    fn scheduled_reboot(&self, unlock: bool) -> bool;
}

/// The device this process is bound to. Resolved once at start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSession {
    serial: String,
}

impl DeviceSession {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.trim().to_lowercase(),
        }
    }

    /// Uses the configured serial, otherwise asks the only attached device.
    pub fn resolve(cfg: &config::Device) -> Result<Self> {
        if !cfg.serial.trim().is_empty() {
            return Ok(Self::new(&cfg.serial));
        }
        let exec = tool_executor(cfg);
        let out = run_with_retries(
            &exec,
            "shell",
            &["getprop", "ro.serialno"],
            cfg.command_timeout(),
            cfg.shell_retries,
            false,
        );
        if !out.success {
            bail!("unable to read device serial through getprop ro.serialno");
        }
        let session = Self::new(out.text());
        if session.serial.is_empty() {
            bail!("device reported an empty serial number");
        }
        Ok(session)
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InstallReport {
    pub package: String,
    pub installed: bool,
    pub output: Option<String>,
    pub permissions: Vec<String>,
    pub not_granted: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub serial: String,
    pub connected: bool,
    pub booted: bool,
    pub screen_on: bool,
    pub wifi_connected: bool,
}

fn tool_executor(cfg: &config::Device) -> CommandExecutor {
    CommandExecutor::new(&cfg.tool_path).with_base_args(&cfg.tool_args)
}

fn run_with_retries(
    exec: &CommandExecutor,
    command: &str,
    args: &[&str],
    timeout: Duration,
    retries: u32,
    quit_on_fail: bool,
) -> CommandOutcome {
    let mut attempt = 0;
    loop {
        let last = attempt >= retries;
        let out = if last && quit_on_fail {
            exec.execute_or_exit(command, args, timeout)
        } else {
            exec.execute(command, args, timeout)
        };
        if out.success || last {
            return out;
        }
        attempt += 1;
        debug!(command, ?args, attempt, "retrying device command");
    }
}

pub struct DeviceController {
    cfg: config::Device,
    exec: CommandExecutor,
    apk: ApkInspector,
}

impl DeviceController {
    pub fn new(cfg: &config::Device, session: &DeviceSession) -> Self {
        let exec = tool_executor(cfg).with_serial(session.serial());
        let aapt = CommandExecutor::new(&cfg.aapt_path).with_base_args(&cfg.aapt_args);
        Self {
            cfg: cfg.clone(),
            exec,
            apk: ApkInspector::new(aapt),
        }
    }

    pub fn inspector(&self) -> &ApkInspector {
        &self.apk
    }

    /// `shell` with the configured timeout and retry ceiling.
    pub fn shell(&self, args: &[&str]) -> CommandOutcome {
        self.shell_with(args, self.cfg.command_timeout(), self.cfg.shell_retries)
    }

    pub fn shell_once(&self, args: &[&str]) -> CommandOutcome {
        self.shell_with(args, self.cfg.command_timeout(), 0)
    }

    pub fn shell_with(&self, args: &[&str], timeout: Duration, retries: u32) -> CommandOutcome {
        run_with_retries(&self.exec, "shell", args, timeout, retries, false)
    }

    /// Probes the transport. With `quit_on_unrecoverable` set, a probe that
    /// still times out after every retry ends the process.
    pub fn ensure_reachable(&self) -> bool {
        let out = run_with_retries(
            &self.exec,
            "get-state",
            &[],
            self.cfg.command_timeout(),
            self.cfg.shell_retries,
            self.cfg.quit_on_unrecoverable,
        );
        out.success && out.text().trim() == "device"
    }

    pub fn is_connected(&self) -> bool {
        let out = self
            .exec
            .execute("devices", &[], self.cfg.command_timeout());
        match out.output {
            Some(text) => listed_in_devices(&text, self.serial()),
            None => false,
        }
    }

    pub fn is_booted(&self) -> bool {
        let out = self.shell(&["getprop", "sys.boot_completed"]);
        out.success && out.text().trim() == "1"
    }

    /// Polls until the device is connected and reports boot completion,
    /// re-issuing the reboot each time a boot window elapses. Gives up after
    /// `boot_reissue_limit` windows.
    pub fn wait_boot(&self) -> bool {
        let window = Duration::from_secs(self.cfg.boot_timeout_seconds);
        let mut deadline = Instant::now() + window;
        let mut reissued = 0;

        info!(device = self.serial(), "checking if device is booted");
        while !(self.is_connected() && self.is_booted()) {
            if Instant::now() > deadline {
                if reissued >= self.cfg.boot_reissue_limit {
                    warn!(device = self.serial(), reissued, "device did not finish booting");
                    return false;
                }
                if self.is_connected() {
                    warn!(
                        device = self.serial(),
                        window_secs = window.as_secs(),
                        "retrying reboot after boot window elapsed"
                    );
                    self.shell_once(&["reboot"]);
                }
                reissued += 1;
                deadline = Instant::now() + window;
            }
            std::thread::sleep(self.cfg.poll_interval());
        }
        info!(device = self.serial(), "device is booted");
        true
    }

    /// Issues a single, never retried, reboot. With `wait` it blocks until
    /// the device is back and unlocks it when asked to and a credential is set.
    pub fn reboot(&self, wait: bool, unlock: bool) -> bool {
        info!(device = self.serial(), wait, unlock, "rebooting device");
        let out = self.shell_once(&["reboot"]);
        if !wait {
            return out.success;
        }
        let booted = self.wait_boot();
        if booted && unlock {
            if let Some(password) = self.cfg.password() {
                self.unlock(password);
            }
        }
        booted
    }

    pub fn package_installed(&self, package: &str) -> bool {
        let out = self.shell(&["pm", "list", "packages", package]);
        out.success
            && out
                .text()
                .lines()
                .any(|l| l.trim().strip_prefix("package:") == Some(package))
    }

    /// Installs (never retried) and then checks the package list: a clean
    /// transport exit does not mean the package landed.
    pub fn install(&self, apk: &Path, grant: bool) -> Result<InstallReport> {
        let package = self.apk.package(apk)?;
        let apk_arg = apk.display().to_string();
        info!(device = self.serial(), package = %package, "installing");
        let out = self.exec.execute(
            "install",
            &["-r", &apk_arg],
            Duration::from_secs(self.cfg.install_timeout_seconds),
        );

        let mut report = InstallReport {
            installed: self.package_installed(&package),
            package,
            output: out.output,
            ..Default::default()
        };
        if !report.installed {
            warn!(device = self.serial(), package = %report.package, "package missing after install");
            return Ok(report);
        }
        if grant {
            let (permissions, not_granted) = self.grant_permissions(apk)?;
            report.permissions = permissions;
            report.not_granted = not_granted;
        }
        Ok(report)
    }

    /// Grants every declared permission. Non-toggleable permissions fail
    /// individually and are reported, not fatal.
    pub fn grant_permissions(&self, apk: &Path) -> Result<(Vec<String>, Vec<String>)> {
        let badging = self.apk.badging(apk)?;
        info!(package = %badging.package, count = badging.permissions.len(), "granting permissions");
        let mut not_granted = Vec::new();
        for perm in &badging.permissions {
            let out = self.shell_once(&["pm", "grant", &badging.package, perm]);
            if !out.success {
                debug!(permission = %perm, output = out.text(), "permission not granted");
                not_granted.push(perm.clone());
            }
        }
        Ok((badging.permissions, not_granted))
    }

    pub fn is_screen_on(&self) -> bool {
        let out = self.shell(&["dumpsys", "power"]);
        out.success && display_power_on(out.text())
    }

    pub fn screen_on(&self) {
        if !self.is_screen_on() {
            self.shell(&["input", "keyevent", "26"]);
        }
    }

    pub fn is_wifi_connected(&self) -> bool {
        let out = self.shell(&["dumpsys", "wifi"]);
        out.success && wifi_connected(out.text())
    }

    /// Scripted unlock gesture: swipe up, type the credential, confirm.
    pub fn unlock(&self, password: &str) {
        self.screen_on();
        self.shell_once(&["input", "touchscreen", "swipe", "930", "880", "930", "380"]);
        self.shell_once(&["input", "text", password]);
        self.shell_once(&["input", "tap", "855", "988"]);
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            serial: self.serial().to_string(),
            connected: self.is_connected(),
            booted: self.is_booted(),
            screen_on: self.is_screen_on(),
            wifi_connected: self.is_wifi_connected(),
        }
    }
}

impl DeviceOps for DeviceController {
    fn serial(&self) -> &str {
        self.exec.serial().unwrap_or("")
    }

    fn is_connected(&self) -> bool {
        DeviceController::is_connected(self)
    }

    fn scheduled_reboot(&self, unlock: bool) -> bool {
        let unlock = unlock && self.cfg.password().is_some();
        self.reboot(unlock, unlock)
    }
}

/// True when a line of `adb devices` output starts with exactly `serial`.
pub fn listed_in_devices(output: &str, serial: &str) -> bool {
    !serial.is_empty()
        && output
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .any(|first| first.eq_ignore_ascii_case(serial))
}

pub fn display_power_on(dumpsys: &str) -> bool {
    dumpsys
        .lines()
        .find(|l| l.contains("Display Power"))
        .and_then(|l| l.split('=').nth(1))
        .is_some_and(|v| v.trim() == "ON")
}

pub fn wifi_connected(dumpsys: &str) -> bool {
    dumpsys
        .lines()
        .find(|l| l.contains("mNetworkInfo"))
        .and_then(|l| l.split(',').nth(1))
        .and_then(|f| f.split('/').nth(1))
        .is_some_and(|v| v.trim() == "CONNECTED")
}
