use crate::{config, verdict::Verdict};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Where a verdict came from. Only testing verdicts move the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Storage,
    Testing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckDecision {
    Ack,
    Withhold,
}

/// Stagger applied to the first reboot: `position / (size + 1)` of the timeout.
pub fn reboot_jitter(position: u32, fleet_size: u32, reboot_timeout: Duration) -> Duration {
    reboot_timeout * position / (fleet_size + 1)
}

pub fn reboot_deadline(
    start: Instant,
    position: u32,
    fleet_size: u32,
    reboot_timeout: Duration,
) -> Instant {
    start + reboot_timeout + reboot_jitter(position, fleet_size, reboot_timeout)
}

/// Process-wide health tracking for one device.
#[derive(Debug, Clone)]
pub struct FleetState {
    pub soft_failures: u32,
    pub reboot_deadline: Instant,
    threshold: u32,
    reboot_timeout: Duration,
}

impl FleetState {
    pub fn new(fleet: &config::Fleet, position: u32, start: Instant) -> Self {
        let reboot_timeout = Duration::from_secs(fleet.reboot_timeout_seconds);
        Self {
            soft_failures: 0,
            reboot_deadline: reboot_deadline(start, position, fleet.size, reboot_timeout),
            threshold: fleet.soft_fail_threshold,
            reboot_timeout,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Updates the counter with a finished job and decides its acknowledgement.
    ///
    /// The counter is updated first, so the SOFT_FAIL that reaches the
    /// threshold is already withheld.
    pub fn record(&mut self, stage: Stage, verdict: Verdict) -> AckDecision {
        if stage == Stage::Testing {
            match verdict {
                Verdict::Success => self.soft_failures = 0,
                Verdict::SoftFail => self.soft_failures = self.soft_failures.saturating_add(1),
                Verdict::HardFail(_) => {}
            }
        }
        match verdict {
            Verdict::Success => AckDecision::Ack,
            Verdict::SoftFail if self.soft_failures < self.threshold => AckDecision::Ack,
            _ => AckDecision::Withhold,
        }
    }

    pub fn reboot_due(&self, now: Instant) -> bool {
        now > self.reboot_deadline
    }

    pub fn reschedule(&mut self, now: Instant) {
        self.reboot_deadline = now + self.reboot_timeout;
    }
}
