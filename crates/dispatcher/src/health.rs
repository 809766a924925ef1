//! Destination health state machine
//!
//! `Configured -> Active -> Degraded -> Failed -> Recovering -> {Active | Inactive}`
//!
//! The state itself is an atomic shared with dispatch workers (who skip
//! destinations that cannot take batches). Transitions are decided by the
//! destination's own worker through [`HealthTracker`].

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use contracts::HealthPolicy;

/// Destination states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationState {
    /// Settings accepted, resource not yet acquired
    Configured = 0,
    Active = 1,
    /// Recent transient failures, still accepting batches
    Degraded = 2,
    /// Resource released, waiting for the next recovery attempt
    Failed = 3,
    /// Reacquisition in progress
    Recovering = 4,
    /// Recovery budget exhausted; excluded until the next reconfigure
    Inactive = 5,
}

impl From<u8> for DestinationState {
    fn from(value: u8) -> Self {
        match value {
            0 => DestinationState::Configured,
            1 => DestinationState::Active,
            2 => DestinationState::Degraded,
            3 => DestinationState::Failed,
            4 => DestinationState::Recovering,
            _ => DestinationState::Inactive,
        }
    }
}

impl DestinationState {
    pub fn as_str(self) -> &'static str {
        match self {
            DestinationState::Configured => "configured",
            DestinationState::Active => "active",
            DestinationState::Degraded => "degraded",
            DestinationState::Failed => "failed",
            DestinationState::Recovering => "recovering",
            DestinationState::Inactive => "inactive",
        }
    }

    /// Whether dispatch should hand batches to this destination
    #[inline]
    pub fn accepts_batches(self) -> bool {
        matches!(
            self,
            DestinationState::Configured | DestinationState::Active | DestinationState::Degraded
        )
    }
}

impl fmt::Display for DestinationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a failed delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Keep accepting batches
    Degraded,
    /// Release the resource and retry acquisition after `retry_in`
    Failed { retry_in: Duration },
}

/// Outcome of a failed recovery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    RetryIn(Duration),
    GiveUp,
}

/// Per-destination failure bookkeeping, owned by the destination worker
#[derive(Debug)]
pub struct HealthTracker {
    policy: HealthPolicy,
    consecutive_failures: u32,
    recovery_attempts: u32,
}

impl HealthTracker {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            consecutive_failures: 0,
            recovery_attempts: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delivery succeeded
    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Delivery failed; fatal errors skip the degraded stage
    pub fn on_failure(&mut self, transient: bool) -> FailureOutcome {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if transient && self.consecutive_failures < self.policy.failure_threshold {
            FailureOutcome::Degraded
        } else {
            FailureOutcome::Failed {
                retry_in: self.backoff(),
            }
        }
    }

    /// Initial resource acquisition failed
    pub fn on_open_failure(&mut self) -> Duration {
        self.backoff()
    }

    /// Resource reacquired
    pub fn on_recovered(&mut self) {
        self.consecutive_failures = 0;
        self.recovery_attempts = 0;
    }

    /// Recovery attempt failed
    pub fn on_recovery_failure(&mut self) -> RecoveryOutcome {
        self.recovery_attempts = self.recovery_attempts.saturating_add(1);
        if self.recovery_attempts >= self.policy.max_recovery_attempts {
            RecoveryOutcome::GiveUp
        } else {
            RecoveryOutcome::RetryIn(self.backoff())
        }
    }

    /// Exponential backoff: initial * 2^attempts, capped
    fn backoff(&self) -> Duration {
        let factor = 1u64.checked_shl(self.recovery_attempts.min(32)).unwrap_or(u64::MAX);
        let millis = self
            .policy
            .backoff_initial_ms
            .saturating_mul(factor)
            .min(self.policy.backoff_max_ms);
        Duration::from_millis(millis)
    }
}
