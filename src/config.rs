use anyhow::{Context, Result, anyhow};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: Broker,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub appliance: Appliance,
    #[serde(default)]
    pub testing: Testing,
    #[serde(default)]
    pub device: Device,
    #[serde(default)]
    pub fleet: Fleet,
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        Ok(cfg)
    }

    /// Position of this worker inside the fleet.
    ///
    /// Falls back to the last digit of the appliance port, which is how
    /// co-located workers have historically been numbered (4000, 4001, ...).
    pub fn fleet_position(&self) -> u32 {
        if let Some(pos) = self.fleet.position {
            return pos;
        }
        self.appliance
            .base_url
            .trim_end_matches('/')
            .rsplit(':')
            .next()
            .and_then(|port| port.chars().last())
            .and_then(|c| c.to_digit(10))
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Broker {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    pub exchange: String,
    pub queue: String,
    pub queue_type: String,
    pub heartbeat_seconds: u16,
    pub poll_interval_ms: u64,
}
impl Default for Broker {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5672,
            username: "guest".into(),
            password: "guest".into(),
            vhost: "/".into(),
            exchange: "privapp".into(),
            queue: "traffic".into(),
            queue_type: "quorum".into(),
            heartbeat_seconds: 5,
            poll_interval_ms: 500,
        }
    }
}

impl Broker {
    /// AMQP URI with credentials and vhost percent-encoded. The default vhost
    /// `/` is written `%2f`.
    pub fn url(&self) -> Result<String> {
        let mut url = Url::parse(&format!("amqp://{}:{}", self.host, self.port))
            .with_context(|| format!("broker address {}:{}", self.host, self.port))?;
        url.set_username(&self.username)
            .map_err(|_| anyhow!("broker username cannot be set on {url}"))?;
        url.set_password(Some(&self.password))
            .map_err(|_| anyhow!("broker password cannot be set on {url}"))?;
        if self.vhost == "/" {
            url.set_path("/%2f");
        } else {
            url.path_segments_mut()
                .map_err(|_| anyhow!("broker url cannot carry a vhost"))?
                .clear()
                .push(self.vhost.trim_start_matches('/'));
        }
        url.set_query(Some(&format!("heartbeat={}", self.heartbeat_seconds)));
        Ok(url.into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Storage {
    pub base_url: String,
    pub request_timeout_seconds: u64,
    pub staging_dir: String,
}
impl Default for Storage {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:30500".into(),
            request_timeout_seconds: 300,
            staging_dir: ".traffic-worker-staging".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Appliance {
    pub base_url: String,
    pub request_timeout_seconds: u64,
    pub testing_label: String,
}
impl Default for Appliance {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4000".into(),
            request_timeout_seconds: 120,
            testing_label: "default".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Testing {
    pub phase_one_timeout_seconds: u64,
    pub phase_two_timeout_seconds: u64,
    pub permissions: bool,
    pub reboot: bool,
    pub monkey: bool,
    pub quiescence_seconds: u64,
    pub job_budget_seconds: u64,
    pub preflight_device_check: bool,
}
impl Default for Testing {
    fn default() -> Self {
        Self {
            phase_one_timeout_seconds: 10,
            phase_two_timeout_seconds: 10,
            permissions: true,
            reboot: false,
            monkey: true,
            quiescence_seconds: 20,
            job_budget_seconds: 0,
            preflight_device_check: false,
        }
    }
}

impl Testing {
    pub fn quiescence(&self) -> Duration {
        Duration::from_secs(self.quiescence_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Device {
    pub tool_path: String,
    pub tool_args: Vec<String>,
    pub serial: String,
    pub aapt_path: String,
    pub aapt_args: Vec<String>,
    pub command_timeout_seconds: u64,
    pub shell_retries: u32,
    pub install_timeout_seconds: u64,
    pub boot_timeout_seconds: u64,
    pub boot_reissue_limit: u32,
    pub poll_interval_ms: u64,
    pub unlock_password: String,
    pub quit_on_unrecoverable: bool,
}
impl Default for Device {
    fn default() -> Self {
        Self {
            tool_path: "adb".into(),
            tool_args: Vec::new(),
            serial: "".into(),
            aapt_path: "aapt".into(),
            aapt_args: Vec::new(),
            command_timeout_seconds: 10,
            shell_retries: 3,
            install_timeout_seconds: 60,
            boot_timeout_seconds: 240,
            boot_reissue_limit: 5,
            poll_interval_ms: 2000,
            unlock_password: "".into(),
            quit_on_unrecoverable: true,
        }
    }
}

impl Device {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn password(&self) -> Option<&str> {
        let p = self.unlock_password.trim();
        if p.is_empty() { None } else { Some(p) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Fleet {
    pub position: Option<u32>,
    pub size: u32,
    pub force_reboot: bool,
    pub reboot_timeout_seconds: u64,
    pub unlock_after_reboot: bool,
    pub soft_fail_threshold: u32,
}
impl Default for Fleet {
    fn default() -> Self {
        Self {
            position: None,
            size: 5,
            force_reboot: true,
            reboot_timeout_seconds: 3600,
            unlock_after_reboot: false,
            soft_fail_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: true,
            write_to_file: false,
            file_path: "".into(),
        }
    }
}
