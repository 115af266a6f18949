/// Account lockout policy
///
/// Pure evaluation of an account's lock state. The verifier applies the
/// resulting transitions to the store.
use crate::{config::LockoutConfig, db::account::Account};
use chrono::{DateTime, Duration, Utc};

/// Lock state of an account at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    /// Locked; `None` means until an admin unlocks it
    Locked(Option<DateTime<Utc>>),
    /// Lock flag still set but its expiry has passed
    Expired,
}

#[derive(Debug, Clone)]
pub struct LockoutPolicy {
    pub max_failed_attempts: i64,
    pub window: Duration,
    pub lock_duration: Duration,
}

impl From<&LockoutConfig> for LockoutPolicy {
    fn from(config: &LockoutConfig) -> Self {
        Self {
            max_failed_attempts: config.max_failed_attempts,
            window: Duration::seconds(config.window_secs),
            lock_duration: Duration::seconds(config.lock_duration_secs),
        }
    }
}

impl LockoutPolicy {
    pub fn evaluate(account: &Account, now: DateTime<Utc>) -> LockState {
        if !account.is_locked {
            return LockState::Unlocked;
        }

        match account.locked_until {
            Some(until) if until <= now => LockState::Expired,
            until => LockState::Locked(until),
        }
    }

    /// Failures older than this no longer count toward the threshold
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.window
    }

    pub fn should_lock(&self, failed_count: i64) -> bool {
        failed_count >= self.max_failed_attempts
    }

    pub fn lock_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.lock_duration
    }
}
