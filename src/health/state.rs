// ABOUTME: Health classifications and the signals that produced them.
// ABOUTME: States are ordered by severity so the worst candidate can be picked with max().

use serde::{Deserialize, Serialize};

/// Health classification of a resource, least to most severe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    #[default]
    Healthy,
    /// A failure streak suggests the platform is throttling the account.
    RateLimited,
    /// Low success or stale engagement suggests the account is being hidden.
    ShadowRestricted,
    /// Terminal until the resource is reactivated externally.
    Suspended,
}

impl HealthState {
    /// Whether a resource in `self` may move to `next`.
    pub fn can_transition_to(self, next: HealthState) -> bool {
        match self {
            HealthState::Healthy => true,
            HealthState::RateLimited => true,
            HealthState::ShadowRestricted => {
                matches!(next, HealthState::ShadowRestricted | HealthState::Suspended)
            }
            HealthState::Suspended => next == HealthState::Suspended,
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::RateLimited => write!(f, "rate_limited"),
            HealthState::ShadowRestricted => write!(f, "shadow_restricted"),
            HealthState::Suspended => write!(f, "suspended"),
        }
    }
}

/// Which signals fired on the most recent check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthFlags {
    pub low_success_rate: bool,
    pub critical_success_rate: bool,
    pub failure_streak: bool,
    pub stale_engagement: bool,
}

impl HealthFlags {
    pub fn any(&self) -> bool {
        self.low_success_rate || self.critical_success_rate || self.failure_streak || self.stale_engagement
    }
}

/// Snapshot of a resource's health record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub resource_id: String,
    pub state: HealthState,
    pub samples: usize,
    /// `None` until enough samples exist.
    pub success_rate: Option<f64>,
    pub consecutive_failures: usize,
    pub flags: HealthFlags,
}
