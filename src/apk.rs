use crate::executor::CommandExecutor;
use anyhow::{Result, anyhow};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

static PACKAGE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^package: name='([^']+)'(?: versionCode='([^']*)')?").expect("valid regex")
});
static PERMISSION_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^uses-permission: name='([^']+)'").expect("valid regex"));

const BADGING_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Badging {
    pub package: String,
    pub version_code: Option<String>,
    pub permissions: Vec<String>,
}

impl Badging {
    pub fn parse(output: &str) -> Result<Self> {
        let mut packages = PACKAGE_LINE.captures_iter(output);
        let caps = packages
            .next()
            .ok_or_else(|| anyhow!("no package line in badging output"))?;
        if packages.next().is_some() {
            return Err(anyhow!("more than one package line in badging output"));
        }
        let package = caps[1].to_string();
        let version_code = caps.get(2).map(|m| m.as_str().to_string());
        let permissions = PERMISSION_LINE
            .captures_iter(output)
            .map(|c| c[1].to_string())
            .collect();
        Ok(Self {
            package,
            version_code,
            permissions,
        })
    }
}

/// Reads package metadata out of an APK with the packaging tool
/// (`aapt dump badging`). The last result is cached since install and
/// permission granting ask about the same file back to back.
pub struct ApkInspector {
    exec: CommandExecutor,
    last: Mutex<Option<(PathBuf, Badging)>>,
}

impl ApkInspector {
    pub fn new(exec: CommandExecutor) -> Self {
        Self {
            exec,
            last: Mutex::new(None),
        }
    }

    pub fn badging(&self, apk: &Path) -> Result<Badging> {
        if !apk.is_file() {
            return Err(anyhow!("{} is not a valid APK path", apk.display()));
        }
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((path, badging)) = last.as_ref() {
            if path == apk {
                return Ok(badging.clone());
            }
        }

        let apk_arg = apk.display().to_string();
        debug!(apk = %apk_arg, "reading badging");
        let out = self
            .exec
            .execute("dump", &["badging", &apk_arg], BADGING_TIMEOUT);
        if !out.success {
            warn!(apk = %apk_arg, output = out.text(), "badging failed");
            return Err(anyhow!("badging failed for {apk_arg}: {}", out.text().trim()));
        }
        let badging = Badging::parse(out.text())?;
        *last = Some((apk.to_path_buf(), badging.clone()));
        Ok(badging)
    }

    pub fn package(&self, apk: &Path) -> Result<String> {
        Ok(self.badging(apk)?.package)
    }

    pub fn permissions(&self, apk: &Path) -> Result<Vec<String>> {
        Ok(self.badging(apk)?.permissions)
    }

    pub fn version_code(&self, apk: &Path) -> Result<Option<String>> {
        Ok(self.badging(apk)?.version_code)
    }
}
