//! policy.rs
//! The transmission policy ("controls") currently governing flush cadence.
//!
//! A policy is plain data: interval, batch size, TTL, displacement hint,
//! where it came from, and when it was recorded. Precedence between policies
//! lives in the resolver; this module only answers questions about one policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyOrigin {
    /// Locally computed passive policy (battery saving).
    Default,
    /// Locally computed short-interval policy (good power/network).
    Aggressive,
    /// Pushed by the server.
    Server,
    /// Installed explicitly by the host; resists weaker candidates until its TTL lapses.
    Forced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPolicy {
    pub batch_interval_secs: u64,
    pub batch_size: usize,
    /// 0 means the policy never expires.
    pub ttl_secs: u64,
    pub minimum_displacement_m: f64,
    pub origin: PolicyOrigin,
    pub forced: bool,
    pub recorded_at: DateTime<Utc>,
}

impl ControlPolicy {
    #[inline]
    pub fn batch_interval(&self) -> Duration {
        Duration::from_secs(self.batch_interval_secs.max(1))
    }

    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.ttl_secs == 0 {
            return None;
        }
        let ttl = chrono::Duration::try_seconds(i64::try_from(self.ttl_secs).ok()?)?;
        self.recorded_at.checked_add_signed(ttl)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }

    /// Time left before expiry; `None` for policies without a TTL.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        let at = self.expires_at()?;
        Some((at - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Same effective settings, ignoring when it was recorded.
    pub fn same_settings(&self, other: &ControlPolicy) -> bool {
        self.batch_interval_secs == other.batch_interval_secs
            && self.batch_size == other.batch_size
            && self.ttl_secs == other.ttl_secs
            && self.origin == other.origin
            && self.forced == other.forced
            && (self.minimum_displacement_m - other.minimum_displacement_m).abs() < f64::EPSILON
    }
}

/// Locally computed presets the resolver chooses between.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyPresets {
    pub aggressive_interval_secs: u64,
    pub aggressive_ttl_secs: u64,
    pub aggressive_displacement_m: f64,
    pub passive_interval_secs: u64,
    pub passive_ttl_secs: u64,
    pub passive_displacement_m: f64,
    pub batch_size: usize,
}

impl Default for PolicyPresets {
    fn default() -> Self {
        Self {
            aggressive_interval_secs: 5,
            aggressive_ttl_secs: 600,
            aggressive_displacement_m: 10.0,
            passive_interval_secs: 300,
            passive_ttl_secs: 0,
            passive_displacement_m: 50.0,
            batch_size: 50,
        }
    }
}

impl PolicyPresets {
    pub fn aggressive(&self, now: DateTime<Utc>) -> ControlPolicy {
        ControlPolicy {
            batch_interval_secs: self.aggressive_interval_secs,
            batch_size: self.batch_size,
            ttl_secs: self.aggressive_ttl_secs,
            minimum_displacement_m: self.aggressive_displacement_m,
            origin: PolicyOrigin::Aggressive,
            forced: false,
            recorded_at: now,
        }
    }

    pub fn passive(&self, now: DateTime<Utc>) -> ControlPolicy {
        ControlPolicy {
            batch_interval_secs: self.passive_interval_secs,
            batch_size: self.batch_size,
            ttl_secs: self.passive_ttl_secs,
            minimum_displacement_m: self.passive_displacement_m,
            origin: PolicyOrigin::Default,
            forced: false,
            recorded_at: now,
        }
    }
}

/// Durable home of the current policy so it survives restarts.
pub trait PolicyStore: Send + Sync {
    fn load_policy(&self) -> StoreResult<Option<ControlPolicy>>;
    fn save_policy(&self, policy: &ControlPolicy) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(ttl_secs: u64, recorded_at: DateTime<Utc>) -> ControlPolicy {
        ControlPolicy {
            batch_interval_secs: 60,
            batch_size: 50,
            ttl_secs,
            minimum_displacement_m: 25.0,
            origin: PolicyOrigin::Server,
            forced: false,
            recorded_at,
        }
    }

    #[test]
    fn zero_ttl_never_expires() {
        let p = policy(0, Utc::now() - chrono::Duration::days(365));
        assert!(p.ttl().is_none());
        assert!(!p.is_expired(Utc::now()));
        assert!(p.remaining_ttl(Utc::now()).is_none());
    }

    #[test]
    fn ttl_expiry_is_relative_to_recorded_at() {
        let t0 = Utc::now();
        let p = policy(120, t0);
        assert!(!p.is_expired(t0 + chrono::Duration::seconds(119)));
        assert!(p.is_expired(t0 + chrono::Duration::seconds(120)));
        assert_eq!(
            p.remaining_ttl(t0 + chrono::Duration::seconds(20)),
            Some(Duration::from_secs(100))
        );
        assert_eq!(p.remaining_ttl(t0 + chrono::Duration::seconds(500)), Some(Duration::ZERO));
    }

    #[test]
    fn presets_differ_in_interval_and_origin() {
        let presets = PolicyPresets::default();
        let now = Utc::now();
        let a = presets.aggressive(now);
        let p = presets.passive(now);
        assert!(a.batch_interval_secs < p.batch_interval_secs);
        assert_eq!(a.origin, PolicyOrigin::Aggressive);
        assert_eq!(p.origin, PolicyOrigin::Default);
        assert!(!a.same_settings(&p));
        assert!(a.same_settings(&presets.aggressive(now + chrono::Duration::seconds(3))));
    }

    #[test]
    fn interval_is_never_zero() {
        let mut p = policy(0, Utc::now());
        p.batch_interval_secs = 0;
        assert_eq!(p.batch_interval(), Duration::from_secs(1));
    }
}
