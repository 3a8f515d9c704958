use crate::{config, verdict::SERVER_CONNECTION_FAILED};
use anyhow::Context;
use reqwest::blocking::{Client, multipart};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// `{Ok, Msg, Code}` envelope returned by every appliance endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplianceReply {
    #[serde(rename = "Ok")]
    pub ok: bool,
    #[serde(rename = "Msg", default)]
    pub msg: serde_json::Value,
    #[serde(rename = "Code", default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

impl ApplianceReply {
    pub fn success(msg: impl Into<String>) -> Self {
        Self {
            ok: true,
            msg: serde_json::Value::String(msg.into()),
            code: None,
        }
    }

    pub fn failure(msg: impl Into<String>, code: Option<i64>) -> Self {
        Self {
            ok: false,
            msg: serde_json::Value::String(msg.into()),
            code,
        }
    }

    pub fn message(&self) -> String {
        match &self.msg {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// The remote test protocol. Calls never fail: transport and decode errors
/// come back as `ok == false` replies.
pub trait Appliance: Send + Sync {
    fn configure(&self, device: &str, version: &str, app: &str) -> ApplianceReply;
    fn upload(&self, artifact: &Path) -> ApplianceReply;
    fn phase_one(&self, timeout_secs: u64, permissions: bool, reboot: bool) -> ApplianceReply;
    fn phase_two(&self, timeout_secs: u64, monkey: bool) -> ApplianceReply;
    fn analysis(&self) -> ApplianceReply;
    fn result(&self) -> ApplianceReply;
    /// Only the HTTP status is checked; the body is not an envelope.
    fn sanitize(&self) -> ApplianceReply;
}

pub struct HttpAppliance {
    base_url: String,
    testing_label: String,
    request_timeout: Duration,
    client: Client,
}

impl HttpAppliance {
    pub fn new(cfg: &config::Appliance) -> anyhow::Result<Self> {
        let client = Client::builder()
            .build()
            .with_context(|| "building appliance HTTP client")?;
        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            testing_label: cfg.testing_label.clone(),
            request_timeout: Duration::from_secs(cfg.request_timeout_seconds),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn envelope(
        &self,
        path: &str,
        query: &[(&str, String)],
        timeout: Duration,
        failure_code: Option<i64>,
    ) -> ApplianceReply {
        debug!(path, ?query, "appliance request");
        let reply = self
            .client
            .get(self.url(path))
            .query(query)
            .timeout(timeout)
            .send()
            .and_then(|r| r.json::<ApplianceReply>());
        match reply {
            Ok(reply) => reply,
            Err(err) => {
                warn!(path, error = %err, "appliance request failed");
                ApplianceReply::failure(err.to_string(), failure_code)
            }
        }
    }

    /// Capture calls block for the whole capture window.
    fn phase_timeout(&self, phase_secs: u64) -> Duration {
        self.request_timeout + Duration::from_secs(phase_secs)
    }
}

/// The appliance parses flags the way its Python client sends them.
fn flag(value: bool) -> String {
    if value { "True".into() } else { "False".into() }
}

impl Appliance for HttpAppliance {
    fn configure(&self, device: &str, version: &str, app: &str) -> ApplianceReply {
        self.envelope(
            "config",
            &[
                ("ip", device.to_string()),
                ("testing_label", self.testing_label.clone()),
                ("version", version.to_string()),
                ("app", app.to_string()),
            ],
            self.request_timeout,
            None,
        )
    }

    fn upload(&self, artifact: &Path) -> ApplianceReply {
        let form = match multipart::Form::new().file("apk", artifact) {
            Ok(form) => form,
            Err(err) => {
                return ApplianceReply::failure(
                    format!("reading {}: {err}", artifact.display()),
                    None,
                );
            }
        };
        let reply = self
            .client
            .post(self.url("upload"))
            .multipart(form)
            .timeout(self.request_timeout)
            .send()
            .and_then(|r| r.json::<ApplianceReply>());
        match reply {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = %err, "appliance upload failed");
                ApplianceReply::failure(err.to_string(), None)
            }
        }
    }

    fn phase_one(&self, timeout_secs: u64, permissions: bool, reboot: bool) -> ApplianceReply {
        self.envelope(
            "phase-one",
            &[
                ("timeout", timeout_secs.to_string()),
                ("permissions", flag(permissions)),
                ("reboot", flag(reboot)),
            ],
            self.phase_timeout(timeout_secs),
            Some(SERVER_CONNECTION_FAILED),
        )
    }

    fn phase_two(&self, timeout_secs: u64, monkey: bool) -> ApplianceReply {
        self.envelope(
            "phase-two",
            &[
                ("timeout", timeout_secs.to_string()),
                ("monkey", flag(monkey)),
            ],
            self.phase_timeout(timeout_secs),
            Some(SERVER_CONNECTION_FAILED),
        )
    }

    fn analysis(&self) -> ApplianceReply {
        self.envelope("analysis", &[], self.request_timeout, None)
    }

    /// The result endpoint answers with the report itself, not an envelope.
    fn result(&self) -> ApplianceReply {
        let body = self
            .client
            .get(self.url("result"))
            .timeout(self.request_timeout)
            .send()
            .and_then(|r| r.text());
        match body {
            Ok(text) => ApplianceReply::success(text),
            Err(err) => ApplianceReply::failure(err.to_string(), None),
        }
    }

    fn sanitize(&self) -> ApplianceReply {
        let res = self
            .client
            .get(self.url("sanitize"))
            .timeout(self.request_timeout)
            .send()
            .and_then(|r| r.error_for_status());
        match res {
            Ok(_) => ApplianceReply::success(""),
            Err(err) => {
                warn!(error = %err, "sanitize request failed");
                ApplianceReply::failure(err.to_string(), None)
            }
        }
    }
}
