use crate::{
    appliance::{Appliance, ApplianceReply},
    config,
    device::DeviceOps,
    dispatcher::JobDescriptor,
    report::{JobReport, StepReport},
    util::{now_rfc3339, sha256_file},
    verdict::{HardCause, Verdict, classify_phase_one},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    ArtifactReady,
    Configured,
    Uploaded,
    PhaseOneDone,
    PhaseTwoDone,
    Analyzed,
    ResultRead,
    Sanitized,
}

/// Per-job progress. Lives for one orchestrator run.
#[derive(Debug)]
pub struct WorkerState {
    pub phase: Phase,
    pub started: Instant,
    pub budget: Option<Duration>,
    pub artifact: PathBuf,
}

impl WorkerState {
    pub fn new(artifact: &Path, budget: Option<Duration>) -> Self {
        Self {
            phase: Phase::ArtifactReady,
            started: Instant::now(),
            budget,
            artifact: artifact.to_path_buf(),
        }
    }

    fn advance(&mut self, phase: Phase) {
        debug!(from = ?self.phase, to = ?phase, "phase transition");
        self.phase = phase;
    }

    pub fn over_budget(&self) -> bool {
        self.budget.is_some_and(|b| self.started.elapsed() > b)
    }
}

/// Runs one job against its staged artifact.
pub trait JobExecutor: Send + Sync {
    fn execute(&self, job: &JobDescriptor, artifact: &Path) -> JobReport;
}

pub struct PhaseOrchestrator {
    testing: config::Testing,
    device: String,
    appliance: Arc<dyn Appliance>,
    preflight: Option<Arc<dyn DeviceOps>>,
}

struct Run {
    state: WorkerState,
    steps: Vec<StepReport>,
    result: Option<String>,
}

impl Run {
    fn record(&mut self, step: &str, reply: &ApplianceReply) {
        self.steps.push(StepReport {
            step: step.to_string(),
            ok: reply.ok,
            code: reply.code,
            message: reply.message(),
        });
    }
}

impl PhaseOrchestrator {
    pub fn new(testing: &config::Testing, device: &str, appliance: Arc<dyn Appliance>) -> Self {
        Self {
            testing: testing.clone(),
            device: device.to_string(),
            appliance,
            preflight: None,
        }
    }

    /// Device consulted before configure when `preflight_device_check` is on.
    pub fn with_preflight(mut self, device: Arc<dyn DeviceOps>) -> Self {
        self.preflight = Some(device);
        self
    }

    pub fn run(&self, job: &JobDescriptor, artifact: &Path) -> JobReport {
        let budget = (self.testing.job_budget_seconds > 0)
            .then(|| Duration::from_secs(self.testing.job_budget_seconds));
        let mut run = Run {
            state: WorkerState::new(artifact, budget),
            steps: Vec::new(),
            result: None,
        };
        let started = now_rfc3339();

        let (verdict, reason) = self.drive(job, &mut run);

        if run.state.over_budget() {
            warn!(
                app = %job.app,
                budget_secs = self.testing.job_budget_seconds,
                elapsed_secs = run.state.started.elapsed().as_secs(),
                "job exceeded its time budget"
            );
        }
        info!(
            app = %job.app,
            version = %job.version,
            phase = ?run.state.phase,
            verdict = %verdict,
            "job finished"
        );

        JobReport {
            app: job.app.clone(),
            version: job.version.clone(),
            device: self.device.clone(),
            verdict,
            reason,
            phase: run.state.phase,
            steps: run.steps,
            started,
            elapsed_ms: run.state.started.elapsed().as_millis() as u64,
            artifact_sha256: artifact.is_file().then(|| sha256_file(artifact).ok()).flatten(),
            result: run.result,
        }
    }

    fn drive(&self, job: &JobDescriptor, run: &mut Run) -> (Verdict, Option<String>) {
        let api = self.appliance.as_ref();

        if !run.state.artifact.is_file() {
            error!(artifact = %run.state.artifact.display(), "artifact is not a file");
            return (
                Verdict::hard(HardCause::Unknown),
                Some(format!("artifact missing: {}", run.state.artifact.display())),
            );
        }

        if self.testing.preflight_device_check {
            if let Some(device) = &self.preflight {
                if !device.is_connected() {
                    error!(device = device.serial(), "device not connected before configure");
                    return (
                        Verdict::hard(HardCause::DeviceNotConnected),
                        Some("Device is not connected".into()),
                    );
                }
            }
        }

        let reply = api.configure(&self.device, &job.version, &job.app);
        run.record("configure", &reply);
        if !reply.ok {
            error!(msg = %reply.message(), "appliance configuration failed");
            return (
                Verdict::hard(HardCause::Unknown),
                Some(format!("configuration failed: {}", reply.message())),
            );
        }
        run.state.advance(Phase::Configured);

        let reply = api.upload(&run.state.artifact);
        run.record("upload", &reply);
        if !reply.ok {
            error!(msg = %reply.message(), "APK upload failed");
            return (
                Verdict::hard(HardCause::Unknown),
                Some(format!("upload failed: {}", reply.message())),
            );
        }
        run.state.advance(Phase::Uploaded);

        info!(
            timeout_secs = self.testing.phase_one_timeout_seconds,
            permissions = self.testing.permissions,
            reboot = self.testing.reboot,
            "starting phase one"
        );
        let reply = api.phase_one(
            self.testing.phase_one_timeout_seconds,
            self.testing.permissions,
            self.testing.reboot,
        );
        run.record("phase_one", &reply);
        if !reply.ok {
            let (verdict, reason) = classify_phase_one(reply.code);
            error!(code = ?reply.code, reason, msg = %reply.message(), "phase one failed");
            return (verdict, Some(reason.to_string()));
        }
        run.state.advance(Phase::PhaseOneDone);

        info!(
            timeout_secs = self.testing.phase_two_timeout_seconds,
            monkey = self.testing.monkey,
            "starting phase two"
        );
        let reply = api.phase_two(self.testing.phase_two_timeout_seconds, self.testing.monkey);
        run.record("phase_two", &reply);
        if !reply.ok {
            warn!(code = ?reply.code, msg = %reply.message(), "phase two failed, continuing");
        }
        run.state.advance(Phase::PhaseTwoDone);

        let reply = api.analysis();
        run.record("analysis", &reply);
        if !reply.ok {
            warn!(msg = %reply.message(), "analysis failed, continuing");
        }
        run.state.advance(Phase::Analyzed);

        let reply = api.result();
        run.record("result", &reply);
        if reply.ok {
            run.result = Some(reply.message());
        } else {
            warn!(msg = %reply.message(), "reading result failed, continuing");
        }
        run.state.advance(Phase::ResultRead);

        let quiet = self.testing.quiescence();
        debug!(secs = quiet.as_secs(), "waiting before sanitization");
        std::thread::sleep(quiet);
        let reply = api.sanitize();
        run.record("sanitize", &reply);
        if !reply.ok {
            warn!(msg = %reply.message(), "sanitization failed, device may keep test state");
        }
        run.state.advance(Phase::Sanitized);

        (Verdict::Success, None)
    }
}

impl JobExecutor for PhaseOrchestrator {
    fn execute(&self, job: &JobDescriptor, artifact: &Path) -> JobReport {
        self.run(job, artifact)
    }
}
