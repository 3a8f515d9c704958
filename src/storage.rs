use crate::{
    config,
    verdict::{HardCause, Verdict},
};
use anyhow::Context;
use reqwest::Url;
use reqwest::blocking::{Client, Response};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Body the storage server sends instead of a missing resource.
const NULL_SENTINEL: &[u8] = b"null\n";

/// Why an artifact could not be staged locally.
///
/// * storage unreachable: `HardFail(ServerConnectionFailed)`
/// * artifact missing or job identifiers unusable: `SoftFail`
/// * staging directory not writable: `HardFail(Unknown)`
#[derive(Debug, Clone, thiserror::Error)]
#[error("{verdict}: {detail}")]
pub struct StorageFailure {
    pub verdict: Verdict,
    pub detail: String,
}

impl StorageFailure {
    pub fn unreachable(detail: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::hard(HardCause::ServerConnectionFailed),
            detail: detail.into(),
        }
    }

    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::SoftFail,
            detail: detail.into(),
        }
    }

    pub fn local(detail: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::hard(HardCause::Unknown),
            detail: detail.into(),
        }
    }
}

/// Where the dispatcher gets APKs from.
pub trait ArtifactSource: Send + Sync {
    fn fetch_apk(&self, app: &str, version: &str, dir: &Path) -> Result<PathBuf, StorageFailure>;
}

pub struct StorageClient {
    base_url: Url,
    client: Client,
}

impl StorageClient {
    pub fn new(cfg: &config::Storage) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_seconds))
            .build()
            .with_context(|| "building storage HTTP client")?;
        let base_url = Url::parse(&cfg.base_url)
            .with_context(|| format!("parsing storage base_url {}", cfg.base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("storage base_url cannot carry a path: {}", cfg.base_url);
        }
        Ok(Self { base_url, client })
    }

    /// Appends each segment percent-encoded, so `/` inside an identifier
    /// stays part of that segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, StorageFailure> {
        if let Some(bad) = segments.iter().find(|s| !usable_segment(s)) {
            return Err(StorageFailure::unavailable(format!(
                "unusable identifier {bad:?} in job"
            )));
        }
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StorageFailure::local(format!("{} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Latest version code known to storage, or `None` when it cannot be
    /// determined (the server answers `-1` for that case too).
    pub fn resolve_version(&self, app: &str) -> Option<String> {
        let url = self.endpoint(&["app", "versioncode", app]).ok()?;
        let body = match self.client.get(url).send().and_then(|r| r.text()) {
            Ok(body) => body,
            Err(err) => {
                warn!(app, error = %err, "version lookup failed");
                return None;
            }
        };
        parse_version_code(&body)
    }

    pub fn fetch_apk(&self, app: &str, version: &str, dir: &Path) -> Result<PathBuf, StorageFailure> {
        let url = self.endpoint(&["app", "apk", app, version])?;
        let dest = dir.join(staging_name(app, version, "apk"));
        self.download(url, &dest, "APK")
    }

    pub fn fetch_policy(
        &self,
        app: &str,
        version: &str,
        dir: &Path,
    ) -> Result<PathBuf, StorageFailure> {
        let url = self.endpoint(&["app", "privacypolicy", app, version, "txt"])?;
        let dest = dir.join(staging_name(app, version, "txt"));
        self.download(url, &dest, "privacy policy")
    }

    fn download(&self, url: Url, dest: &Path, what: &str) -> Result<PathBuf, StorageFailure> {
        debug!(url = %url, dest = %dest.display(), "downloading");
        let resp = self
            .client
            .get(url)
            .send()
            .map_err(|e| StorageFailure::unreachable(e.to_string()))?;
        let mut resp = resp
            .error_for_status()
            .map_err(|e| StorageFailure::unavailable(e.to_string()))?;

        // Read one byte past the sentinel so a longer body is never mistaken for it.
        let mut head = Vec::with_capacity(NULL_SENTINEL.len() + 1);
        resp.by_ref()
            .take(NULL_SENTINEL.len() as u64 + 1)
            .read_to_end(&mut head)
            .map_err(|e| StorageFailure::unreachable(e.to_string()))?;
        if is_null_sentinel(&head) {
            return Err(StorageFailure::unavailable(format!(
                "Unavailable {what}, \"null\" returned"
            )));
        }

        if let Err(failure) = stream_to_file(&head, &mut resp, dest) {
            let _ = std::fs::remove_file(dest);
            return Err(failure);
        }
        Ok(dest.to_path_buf())
    }
}

impl ArtifactSource for StorageClient {
    fn fetch_apk(&self, app: &str, version: &str, dir: &Path) -> Result<PathBuf, StorageFailure> {
        StorageClient::fetch_apk(self, app, version, dir)
    }
}

/// Write errors are local; read errors mean the transfer broke.
fn stream_to_file(head: &[u8], rest: &mut Response, dest: &Path) -> Result<(), StorageFailure> {
    let local = |e: std::io::Error| StorageFailure::local(format!("writing {}: {e}", dest.display()));
    let mut f = File::create(dest).map_err(local)?;
    f.write_all(head).map_err(local)?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = rest
            .read(&mut buf)
            .map_err(|e| StorageFailure::unreachable(format!("streaming body: {e}")))?;
        if n == 0 {
            break;
        }
        f.write_all(&buf[..n]).map_err(local)?;
    }
    f.flush().map_err(local)
}

fn usable_segment(s: &str) -> bool {
    !s.is_empty() && s != "." && s != ".." && !s.chars().any(char::is_control)
}

/// `<app>-<version>.<ext>` with anything outside `[A-Za-z0-9._-]` replaced,
/// so the name is always a single component inside the staging dir.
pub fn staging_name(app: &str, version: &str, ext: &str) -> String {
    let clean = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    };
    format!("{}-{}.{ext}", clean(app), clean(version))
}

fn is_null_sentinel(head: &[u8]) -> bool {
    head == NULL_SENTINEL || head.trim_ascii() == b"null"
}

/// Extracts the code from a `[<code>]` body.
pub fn parse_version_code(body: &str) -> Option<String> {
    let start = body.find('[')?;
    let end = start + body[start..].find(']')?;
    let code = body[start + 1..end].trim().trim_matches('"').trim();
    if code.is_empty() || code == "-1" {
        None
    } else {
        Some(code.to_string())
    }
}
