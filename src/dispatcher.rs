use crate::{
    config::Config,
    device::DeviceOps,
    orchestrator::JobExecutor,
    policy::{AckDecision, FleetState, Stage},
    storage::ArtifactSource,
    util::{ensure_dir, remove_artifact},
    verdict::{HardCause, Verdict},
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

/// One unit of work taken from the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobDescriptor {
    pub app: String,
    pub version: String,
}

#[derive(Deserialize)]
struct WireJob {
    apk: String,
    version: WireVersion,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireVersion {
    Text(String),
    Number(serde_json::Number),
}

impl JobDescriptor {
    pub fn new(app: &str, version: &str) -> Self {
        Self {
            app: app.to_string(),
            version: version.to_string(),
        }
    }

    /// Decodes `{"apk": .., "version": ..}`; the version may be a string or a number.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let wire: WireJob = serde_json::from_slice(body).with_context(|| "decoding job body")?;
        let version = match wire.version {
            WireVersion::Text(s) => s,
            WireVersion::Number(n) => n.to_string(),
        };
        Ok(Self {
            app: wire.apk,
            version,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub tag: u64,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub enum Poll {
    Message(Message),
    Idle,
    Closed,
}

/// A queue connection. Only ever used from the thread running
/// [`Dispatcher::run`].
pub trait Broker {
    fn next_message(&mut self, timeout: Duration) -> Result<Poll>;
    fn ack(&mut self, tag: u64) -> Result<()>;
}

/// Requests posted by workers back to the broker-owning thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Ack(u64),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub received: u64,
    pub acked: u64,
}

struct Shared {
    storage: Arc<dyn ArtifactSource>,
    executor: Arc<dyn JobExecutor>,
    device: Option<Arc<dyn DeviceOps>>,
    fleet: Mutex<FleetState>,
    staging_dir: PathBuf,
    force_reboot: bool,
    unlock_after_reboot: bool,
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    poll_interval: Duration,
}

/// Deletes the staged artifact when the job is done with it, panics included.
struct StagedArtifact(PathBuf);

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        if let Err(err) = remove_artifact(&self.0) {
            warn!(error = %format!("{err:#}"), "artifact cleanup failed");
        }
    }
}

struct Outcome {
    stage: Stage,
    verdict: Verdict,
}

impl Dispatcher {
    pub fn new(
        cfg: &Config,
        storage: Arc<dyn ArtifactSource>,
        executor: Arc<dyn JobExecutor>,
        device: Option<Arc<dyn DeviceOps>>,
    ) -> Result<Self> {
        let staging_dir = PathBuf::from(&cfg.storage.staging_dir);
        ensure_dir(&staging_dir)?;
        let position = cfg.fleet_position();
        let fleet = FleetState::new(&cfg.fleet, position, Instant::now());
        info!(
            position,
            fleet_size = cfg.fleet.size,
            reboot_in_secs = fleet
                .reboot_deadline
                .saturating_duration_since(Instant::now())
                .as_secs(),
            "fleet state initialised"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                storage,
                executor,
                device,
                fleet: Mutex::new(fleet),
                staging_dir,
                force_reboot: cfg.fleet.force_reboot,
                unlock_after_reboot: cfg.fleet.unlock_after_reboot,
            }),
            poll_interval: Duration::from_millis(cfg.broker.poll_interval_ms.max(1)),
        })
    }

    pub fn fleet(&self) -> FleetState {
        self.shared
            .fleet
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Consumes until the broker closes, then waits for in-flight workers and
    /// delivers their acknowledgements. A broker error stops consumption but
    /// in-flight workers are still joined before it is returned.
    pub fn run<B: Broker + ?Sized>(&self, broker: &mut B) -> Result<RunSummary> {
        let (tx, rx) = mpsc::channel::<Control>();
        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        let mut summary = RunSummary::default();

        let consumed = self.consume(broker, &tx, &rx, &mut workers, &mut summary);
        match &consumed {
            Ok(()) => info!(in_flight = workers.len(), "broker closed, waiting for workers"),
            Err(err) => error!(
                error = %format!("{err:#}"),
                in_flight = workers.len(),
                "consumption stopped, waiting for workers"
            ),
        }
        for handle in workers {
            let _ = handle.join();
        }
        drop(tx);
        consumed?;

        match drain(&rx, broker) {
            Ok(n) => summary.acked += n,
            Err(err) => error!(error = %format!("{err:#}"), "acknowledgements lost at shutdown"),
        }
        Ok(summary)
    }

    fn consume<B: Broker + ?Sized>(
        &self,
        broker: &mut B,
        tx: &Sender<Control>,
        rx: &Receiver<Control>,
        workers: &mut Vec<JoinHandle<()>>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        loop {
            summary.acked += drain(rx, broker)?;
            reap(workers);

            match broker.next_message(self.poll_interval)? {
                Poll::Message(msg) => {
                    summary.received += 1;
                    debug!(tag = msg.tag, bytes = msg.body.len(), "message received");
                    let shared = Arc::clone(&self.shared);
                    let tx = tx.clone();
                    let handle = std::thread::Builder::new()
                        .name(format!("job-{}", msg.tag))
                        .spawn(move || shared.work(msg, tx))
                        .with_context(|| "spawning job worker")?;
                    workers.push(handle);
                }
                Poll::Idle => {}
                Poll::Closed => return Ok(()),
            }
        }
    }
}

fn drain<B: Broker + ?Sized>(rx: &Receiver<Control>, broker: &mut B) -> Result<u64> {
    let mut acked = 0;
    while let Ok(ctrl) = rx.try_recv() {
        match ctrl {
            Control::Ack(tag) => {
                broker
                    .ack(tag)
                    .with_context(|| format!("acknowledging delivery {tag}"))?;
                acked += 1;
            }
        }
    }
    Ok(acked)
}

fn reap(workers: &mut Vec<JoinHandle<()>>) {
    let (done, live): (Vec<_>, Vec<_>) = std::mem::take(workers)
        .into_iter()
        .partition(|h| h.is_finished());
    for handle in done {
        let _ = handle.join();
    }
    *workers = live;
}

impl Shared {
    fn work(&self, msg: Message, tx: Sender<Control>) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.process(&msg.body)))
            .unwrap_or_else(|_| {
                error!(tag = msg.tag, "job worker panicked");
                Outcome {
                    stage: Stage::Testing,
                    verdict: Verdict::hard(HardCause::Unknown),
                }
            });

        let now = Instant::now();
        let (decision, reboot, soft_failures) = {
            let mut fleet = self.fleet.lock().unwrap_or_else(|e| e.into_inner());
            let decision = fleet.record(outcome.stage, outcome.verdict);
            let reboot =
                decision == AckDecision::Ack && self.force_reboot && fleet.reboot_due(now);
            if reboot {
                fleet.reschedule(now);
            }
            (decision, reboot, fleet.soft_failures)
        };

        match decision {
            AckDecision::Ack => {
                if tx.send(Control::Ack(msg.tag)).is_err() {
                    error!(tag = msg.tag, "ack cannot be delivered");
                } else {
                    debug!(tag = msg.tag, verdict = %outcome.verdict, "app removed from queue");
                }
            }
            AckDecision::Withhold => {
                error!(
                    tag = msg.tag,
                    verdict = %outcome.verdict,
                    soft_failures,
                    "critical state, withholding acknowledgement"
                );
            }
        }

        if reboot {
            if let Some(device) = &self.device {
                info!(device = device.serial(), reason = "scheduled device reboot", "rebooting device");
                if !device.scheduled_reboot(self.unlock_after_reboot) {
                    warn!(device = device.serial(), "scheduled reboot did not complete");
                }
            }
        }
    }

    fn process(&self, body: &[u8]) -> Outcome {
        let job = match JobDescriptor::decode(body) {
            Ok(job) => job,
            Err(err) => {
                error!(error = %format!("{err:#}"), "undecodable job body");
                return Outcome {
                    stage: Stage::Storage,
                    verdict: Verdict::hard(HardCause::Unknown),
                };
            }
        };

        let span = info_span!("job", app = %job.app, version = %job.version);
        let _enter = span.enter();
        info!("started app analysis");

        let artifact = match self.storage.fetch_apk(&job.app, &job.version, &self.staging_dir) {
            Ok(path) => StagedArtifact(path),
            Err(failure) => {
                match failure.verdict {
                    Verdict::HardFail(HardCause::ServerConnectionFailed) => {
                        error!(detail = %failure.detail, "storage server is not responding")
                    }
                    Verdict::HardFail(_) => {
                        error!(detail = %failure.detail, "couldn't stage the apk locally")
                    }
                    _ => error!(detail = %failure.detail, "couldn't get the apk from the storage server"),
                }
                return Outcome {
                    stage: Stage::Storage,
                    verdict: failure.verdict,
                };
            }
        };
        debug!(artifact = %artifact.0.display(), "apk recovered from the storage server");

        let report = self.executor.execute(&job, &artifact.0);
        Outcome {
            stage: Stage::Testing,
            verdict: report.verdict,
        }
    }
}

/// Runs a single job outside the queue: fetch, orchestrate, clean up.
pub fn run_once(
    storage: &dyn ArtifactSource,
    executor: &dyn JobExecutor,
    job: &JobDescriptor,
    staging_dir: &Path,
) -> Result<crate::report::JobReport, crate::storage::StorageFailure> {
    let artifact = StagedArtifact(storage.fetch_apk(&job.app, &job.version, staging_dir)?);
    Ok(executor.execute(job, &artifact.0))
}
