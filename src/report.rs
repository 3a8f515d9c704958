use crate::{orchestrator::Phase, verdict::Verdict};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub app: String,
    pub version: String,
    pub device: String,
    pub verdict: Verdict,
    pub reason: Option<String>,
    /// Last phase reached before the run ended.
    pub phase: Phase,
    pub steps: Vec<StepReport>,
    pub started: String,
    pub elapsed_ms: u64,
    pub artifact_sha256: Option<String>,
    /// Raw body of the appliance result endpoint, when it answered.
    pub result: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub step: String,
    pub ok: bool,
    pub code: Option<i64>,
    pub message: String,
}

impl JobReport {
    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step == name)
    }

    pub fn called(&self, name: &str) -> bool {
        self.step(name).is_some()
    }
}
