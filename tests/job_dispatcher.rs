mod common;

use common::{Canned, FixtureServer};
use serde_json::json;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use traffic_worker::appliance::HttpAppliance;
use traffic_worker::config::Config;
use traffic_worker::device::DeviceOps;
use traffic_worker::dispatcher::{Broker, Dispatcher, JobDescriptor, Message, Poll};
use traffic_worker::orchestrator::{JobExecutor, Phase, PhaseOrchestrator};
use traffic_worker::report::JobReport;
use traffic_worker::storage::{ArtifactSource, StorageClient, StorageFailure};
use traffic_worker::verdict::{HardCause, Verdict};

/// Delivers its messages, then reports the broker as closed.
#[derive(Default)]
struct MemoryBroker {
    queue: VecDeque<Message>,
    acked: Vec<u64>,
}

impl MemoryBroker {
    fn with(bodies: &[&str]) -> Self {
        Self {
            queue: bodies
                .iter()
                .enumerate()
                .map(|(i, b)| Message {
                    tag: i as u64 + 1,
                    body: b.as_bytes().to_vec(),
                })
                .collect(),
            acked: Vec::new(),
        }
    }
}

impl Broker for MemoryBroker {
    fn next_message(&mut self, _timeout: Duration) -> anyhow::Result<Poll> {
        Ok(match self.queue.pop_front() {
            Some(msg) => Poll::Message(msg),
            None => Poll::Closed,
        })
    }

    fn ack(&mut self, tag: u64) -> anyhow::Result<()> {
        self.acked.push(tag);
        Ok(())
    }
}

/// Stages a file for every app except `hard.*` and `soft.*`.
struct StubStorage;

impl ArtifactSource for StubStorage {
    fn fetch_apk(&self, app: &str, version: &str, dir: &Path) -> Result<PathBuf, StorageFailure> {
        if app.starts_with("hard.") {
            return Err(StorageFailure {
                verdict: Verdict::hard(HardCause::ServerConnectionFailed),
                detail: "connection refused".into(),
            });
        }
        if app.starts_with("soft.") {
            return Err(StorageFailure {
                verdict: Verdict::SoftFail,
                detail: "Unavailable APK, \"null\" returned".into(),
            });
        }
        let path = dir.join(format!("{app}-{version}.apk"));
        std::fs::write(&path, b"PK").unwrap();
        Ok(path)
    }
}

/// Verdict chosen by the app name prefix.
struct ByName;

impl JobExecutor for ByName {
    fn execute(&self, job: &JobDescriptor, artifact: &Path) -> JobReport {
        assert!(artifact.is_file());
        let verdict = match job.app.split('.').next().unwrap_or("") {
            "ok" => Verdict::Success,
            "flaky" => Verdict::SoftFail,
            "broken" => Verdict::hard(HardCause::DeviceNotConnected),
            "crash" => panic!("executor blew up"),
            other => panic!("unexpected app {other}"),
        };
        JobReport {
            app: job.app.clone(),
            version: job.version.clone(),
            device: "emulator-5554".into(),
            verdict,
            reason: None,
            phase: Phase::Sanitized,
            steps: Vec::new(),
            started: String::new(),
            elapsed_ms: 0,
            artifact_sha256: None,
            result: None,
        }
    }
}

/// Delivers its messages, then stays idle; every ack fails.
struct BrokenAckBroker {
    queue: VecDeque<Message>,
    ack_attempts: usize,
}

impl Broker for BrokenAckBroker {
    fn next_message(&mut self, timeout: Duration) -> anyhow::Result<Poll> {
        match self.queue.pop_front() {
            Some(msg) => Ok(Poll::Message(msg)),
            None => {
                std::thread::sleep(timeout);
                Ok(Poll::Idle)
            }
        }
    }

    fn ack(&mut self, _tag: u64) -> anyhow::Result<()> {
        self.ack_attempts += 1;
        anyhow::bail!("channel closed")
    }
}

/// Succeeds on every job; `slow.*` apps take a while. Counts finished runs.
#[derive(Default)]
struct Timed {
    finished: AtomicUsize,
}

impl JobExecutor for Timed {
    fn execute(&self, job: &JobDescriptor, artifact: &Path) -> JobReport {
        if job.app.starts_with("slow.") {
            std::thread::sleep(Duration::from_millis(300));
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        ByName.execute(&JobDescriptor::new("ok.app", &job.version), artifact)
    }
}

#[derive(Default)]
struct CountingDevice {
    reboots: AtomicUsize,
}

impl DeviceOps for CountingDevice {
    fn serial(&self) -> &str {
        "emulator-5554"
    }
    fn is_connected(&self) -> bool {
        true
    }
    fn scheduled_reboot(&self, _unlock: bool) -> bool {
        self.reboots.fetch_add(1, Ordering::SeqCst);
        true
    }
}

fn config(staging: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.storage.staging_dir = staging.display().to_string();
    cfg.broker.poll_interval_ms = 10;
    cfg.fleet.position = Some(0);
    cfg
}

fn dispatcher(cfg: &Config, device: Option<Arc<dyn DeviceOps>>) -> Dispatcher {
    Dispatcher::new(cfg, Arc::new(StubStorage), Arc::new(ByName), device).unwrap()
}

fn job(app: &str) -> String {
    json!({"apk": app, "version": "1"}).to_string()
}

/// Runs one message to completion and reports whether it was acknowledged.
fn deliver(d: &Dispatcher, body: &str) -> bool {
    let mut broker = MemoryBroker::with(&[body]);
    d.run(&mut broker).unwrap();
    broker.acked == vec![1]
}

#[test]
fn decodes_string_and_numeric_versions() {
    let a = JobDescriptor::decode(br#"{"apk": "demo.app", "version": "3"}"#).unwrap();
    let b = JobDescriptor::decode(br#"{"apk": "demo.app", "version": 3}"#).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.version, "3");
    assert!(JobDescriptor::decode(br#"{"version": 3}"#).is_err());
    assert!(JobDescriptor::decode(b"not json").is_err());
}

#[test]
fn acknowledges_per_verdict_and_counter() {
    let staging = tempfile::tempdir().unwrap();
    let d = dispatcher(&config(staging.path()), None);

    assert!(deliver(&d, &job("flaky.one")));
    assert!(deliver(&d, &job("flaky.two")));
    assert_eq!(d.fleet().soft_failures, 2);
    assert!(!deliver(&d, &job("flaky.three")), "threshold reached");
    assert_eq!(d.fleet().soft_failures, 3);

    assert!(deliver(&d, &job("ok.app")));
    assert_eq!(d.fleet().soft_failures, 0);

    assert!(!deliver(&d, &job("broken.app")));
    assert_eq!(d.fleet().soft_failures, 0);
    assert!(deliver(&d, &job("flaky.four")));
    assert_eq!(d.fleet().soft_failures, 1);
}

#[test]
fn storage_failures() {
    let staging = tempfile::tempdir().unwrap();
    let d = dispatcher(&config(staging.path()), None);

    assert!(!deliver(&d, &job("hard.app")), "storage outage stays queued");
    assert!(deliver(&d, &job("soft.app")), "missing APK is dropped");
    assert_eq!(d.fleet().soft_failures, 0);
}

#[test]
fn worker_panic_and_bad_body_are_hard_failures() {
    let staging = tempfile::tempdir().unwrap();
    let d = dispatcher(&config(staging.path()), None);

    assert!(!deliver(&d, &job("crash.app")));
    assert!(!deliver(&d, "{\"apk\": 42}"));
    assert!(deliver(&d, &job("ok.after")), "consumption continues");
}

#[test]
fn artifacts_are_removed_whatever_the_verdict() {
    let staging = tempfile::tempdir().unwrap();
    let d = dispatcher(&config(staging.path()), None);
    for app in ["ok.app", "flaky.app", "broken.app", "crash.app"] {
        deliver(&d, &job(app));
    }
    let left: Vec<_> = std::fs::read_dir(staging.path()).unwrap().collect();
    assert!(left.is_empty(), "staging dir not empty: {left:?}");
}

#[test]
fn drains_all_messages_in_one_run() {
    let staging = tempfile::tempdir().unwrap();
    let d = dispatcher(&config(staging.path()), None);
    let bodies = [job("ok.a"), job("ok.b"), job("ok.c")];
    let refs: Vec<&str> = bodies.iter().map(String::as_str).collect();
    let mut broker = MemoryBroker::with(&refs);

    let summary = d.run(&mut broker).unwrap();
    assert_eq!(summary.received, 3);
    assert_eq!(summary.acked, 3);
    let mut acked = broker.acked.clone();
    acked.sort();
    assert_eq!(acked, vec![1, 2, 3]);
}

#[test]
fn ack_failure_still_waits_for_in_flight_workers() {
    let staging = tempfile::tempdir().unwrap();
    let executor = Arc::new(Timed::default());
    let d = Dispatcher::new(
        &config(staging.path()),
        Arc::new(StubStorage),
        executor.clone(),
        None,
    )
    .unwrap();
    let mut broker = BrokenAckBroker {
        queue: [job("fast.app"), job("slow.app")]
            .iter()
            .enumerate()
            .map(|(i, b)| Message {
                tag: i as u64 + 1,
                body: b.as_bytes().to_vec(),
            })
            .collect(),
        ack_attempts: 0,
    };

    let err = d.run(&mut broker).unwrap_err();
    assert!(format!("{err:#}").contains("channel closed"), "{err:#}");
    assert_eq!(broker.ack_attempts, 1);
    assert_eq!(executor.finished.load(Ordering::SeqCst), 2, "slow worker was joined");
    let left: Vec<_> = std::fs::read_dir(staging.path()).unwrap().collect();
    assert!(left.is_empty(), "staging dir not empty: {left:?}");
}

#[test]
fn scheduled_reboot_after_deadline_on_acked_jobs() {
    let staging = tempfile::tempdir().unwrap();
    let mut cfg = config(staging.path());
    cfg.fleet.reboot_timeout_seconds = 0;
    let device = Arc::new(CountingDevice::default());
    let d = dispatcher(&cfg, Some(device.clone()));

    std::thread::sleep(Duration::from_millis(5));
    assert!(deliver(&d, &job("ok.app")));
    assert_eq!(device.reboots.load(Ordering::SeqCst), 1);

    assert!(!deliver(&d, &job("broken.app")));
    assert_eq!(device.reboots.load(Ordering::SeqCst), 1, "no reboot on withheld jobs");
}

#[test]
fn reboot_is_skipped_when_disabled_or_not_due() {
    let staging = tempfile::tempdir().unwrap();
    let mut cfg = config(staging.path());
    cfg.fleet.reboot_timeout_seconds = 0;
    cfg.fleet.force_reboot = false;
    let device = Arc::new(CountingDevice::default());
    let d = dispatcher(&cfg, Some(device.clone()));
    assert!(deliver(&d, &job("ok.app")));
    assert_eq!(device.reboots.load(Ordering::SeqCst), 0);

    let cfg = config(staging.path());
    let d = dispatcher(&cfg, Some(device.clone()));
    assert!(deliver(&d, &job("ok.app")));
    assert_eq!(device.reboots.load(Ordering::SeqCst), 0);
}

#[test]
fn end_to_end_over_http() {
    let apk = b"PK\x03\x04 demo apk";
    let storage = FixtureServer::start(vec![("/app/apk/demo.app/3", Canned::bytes(apk))]);
    let ok = || Canned::json(json!({"Ok": true, "Msg": "ok"}));
    let appliance = FixtureServer::start(vec![
        ("/config", ok()),
        ("/upload", ok()),
        ("/phase-one", ok()),
        ("/phase-two", ok()),
        ("/analysis", ok()),
        ("/result", Canned::text(200, "{}")),
        ("/sanitize", ok()),
    ]);

    let staging = tempfile::tempdir().unwrap();
    let mut cfg = config(staging.path());
    cfg.storage.base_url = storage.url();
    cfg.appliance.base_url = appliance.url();
    cfg.testing.quiescence_seconds = 0;

    let orchestrator = PhaseOrchestrator::new(
        &cfg.testing,
        "emulator-5554",
        Arc::new(HttpAppliance::new(&cfg.appliance).unwrap()),
    );
    let d = Dispatcher::new(
        &cfg,
        Arc::new(StorageClient::new(&cfg.storage).unwrap()),
        Arc::new(orchestrator),
        None,
    )
    .unwrap();

    let mut broker = MemoryBroker::with(&[r#"{"apk": "demo.app", "version": 3}"#]);
    d.run(&mut broker).unwrap();

    assert_eq!(broker.acked, vec![1]);
    assert_eq!(storage.paths(), vec!["/app/apk/demo.app/3"]);
    let upload = appliance.find("/upload").unwrap();
    assert!(
        upload
            .body
            .windows(apk.len())
            .any(|w| w == apk.as_slice())
    );
    assert!(!staging.path().join("demo.app-3.apk").exists());
}
