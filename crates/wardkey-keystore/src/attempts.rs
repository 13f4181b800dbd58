//! Failed-login tracking with a sliding-window lockout.
//!
//! Held in memory only. Each identity keeps at most `max_attempts`
//! timestamps; entries older than the window are pruned on every check.
//! The number of tracked identities is capped: when the cap is reached,
//! identities with nothing left in the window go first, then the one
//! whose last failure is oldest.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::config::KeystoreConfig;
use crate::events::{SecurityEventKind, SecurityLog};

type History = HashMap<String, VecDeque<DateTime<Utc>>>;

/// Sliding-window failed-attempt limiter.
pub struct LoginAttempts {
    max_attempts: usize,
    window: TimeDelta,
    max_identities: usize,
    clock: Arc<dyn Clock>,
    log: SecurityLog,
    history: Mutex<History>,
}

impl LoginAttempts {
    /// Limiter using the attempt policy from `config`.
    #[must_use]
    pub fn new(config: &KeystoreConfig, clock: Arc<dyn Clock>, log: SecurityLog) -> Self {
        Self {
            max_attempts: usize::try_from(config.max_failed_attempts).unwrap_or(usize::MAX).max(1),
            window: config.lockout_window(),
            max_identities: usize::try_from(config.max_tracked_identities)
                .unwrap_or(usize::MAX)
                .max(1),
            clock,
            log,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Record one failed attempt. Returns `true` if `identity` is now locked out.
    ///
    /// The lockout is a sliding window, not a fixed term: a failure recorded
    /// while locked out replaces the oldest one in the ring, so the lockout
    /// lifts one window after the oldest of the last `max_attempts`
    /// failures. Continued attempts keep the identity locked.
    pub fn record_failed_attempt(&self, identity: &str) -> bool {
        let now = self.clock.now();
        let (locked, newly_locked) = {
            let mut history = self.history.lock();
            if !history.contains_key(identity) && history.len() >= self.max_identities {
                self.evict(&mut history, now);
            }
            let ring = history.entry(identity.to_owned()).or_default();
            self.prune(ring, now);
            let was_locked = ring.len() >= self.max_attempts;
            if was_locked {
                ring.pop_front();
            }
            ring.push_back(now);
            let locked = ring.len() >= self.max_attempts;
            (locked, locked && !was_locked)
        };

        if newly_locked {
            self.log.user_event(
                SecurityEventKind::AccountLockedOut,
                identity,
                &format!(
                    "{} failed attempts within {} minutes",
                    self.max_attempts,
                    self.window.num_minutes()
                ),
            );
        }
        locked
    }

    /// `true` while `identity` has `max_attempts` failures inside the window.
    pub fn is_locked_out(&self, identity: &str) -> bool {
        self.lockout_remaining(identity).is_some()
    }

    /// Time until the lockout on `identity` lifts, if it is locked out.
    pub fn lockout_remaining(&self, identity: &str) -> Option<TimeDelta> {
        let now = self.clock.now();
        let mut history = self.history.lock();
        let ring = history.get_mut(identity)?;
        self.prune(ring, now);
        if ring.is_empty() {
            history.remove(identity);
            return None;
        }
        if ring.len() < self.max_attempts {
            return None;
        }
        let oldest = *ring.front()?;
        oldest
            .checked_add_signed(self.window)
            .map(|lifts_at| lifts_at.signed_duration_since(now))
            .filter(|remaining| *remaining > TimeDelta::zero())
    }

    /// Forget all failures for `identity`, e.g. after a successful login.
    pub fn reset_attempts(&self, identity: &str) {
        self.history.lock().remove(identity);
    }

    /// Number of identities currently tracked.
    pub fn tracked_identities(&self) -> usize {
        self.history.lock().len()
    }

    fn prune(&self, ring: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
        while ring
            .front()
            .is_some_and(|at| now.signed_duration_since(*at) >= self.window)
        {
            ring.pop_front();
        }
    }

    fn evict(&self, history: &mut History, now: DateTime<Utc>) {
        history.retain(|_, ring| {
            self.prune(ring, now);
            !ring.is_empty()
        });
        if history.len() < self.max_identities {
            return;
        }
        let stalest = history
            .iter()
            .min_by_key(|(_, ring)| ring.back().copied())
            .map(|(identity, _)| identity.clone());
        if let Some(identity) = stalest {
            tracing::debug!("attempt limiter full, evicting stalest identity");
            history.remove(&identity);
        }
    }
}

impl std::fmt::Debug for LoginAttempts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginAttempts")
            .field("max_attempts", &self.max_attempts)
            .field("window", &self.window)
            .field("tracked", &self.tracked_identities())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::MemorySink;

    fn limiter(max_identities: u32) -> (LoginAttempts, Arc<ManualClock>, Arc<MemorySink>) {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
        ));
        let sink = Arc::new(MemorySink::new());
        let config = KeystoreConfig {
            max_tracked_identities: max_identities,
            ..KeystoreConfig::default()
        };
        let log = SecurityLog::new(sink.clone(), clock.clone());
        (LoginAttempts::new(&config, clock.clone(), log), clock, sink)
    }

    #[test]
    fn five_failures_lock_out() {
        let (limiter, clock, sink) = limiter(16);
        for i in 0..4 {
            assert!(!limiter.record_failed_attempt("alice"), "attempt {i}");
            clock.advance(TimeDelta::seconds(30));
        }
        assert!(!limiter.is_locked_out("alice"));
        assert!(limiter.record_failed_attempt("alice"));
        assert!(limiter.is_locked_out("alice"));
        assert!(!limiter.is_locked_out("bob"));
        assert_eq!(sink.count(SecurityEventKind::AccountLockedOut), 1);
    }

    #[test]
    fn lockout_lifts_after_window() {
        let (limiter, clock, _) = limiter(16);
        for _ in 0..5 {
            limiter.record_failed_attempt("alice");
        }
        assert!(limiter.is_locked_out("alice"));
        assert_eq!(limiter.lockout_remaining("alice"), Some(TimeDelta::minutes(15)));

        clock.advance(TimeDelta::minutes(10));
        assert_eq!(limiter.lockout_remaining("alice"), Some(TimeDelta::minutes(5)));

        clock.advance(TimeDelta::minutes(5));
        assert!(!limiter.is_locked_out("alice"));
        assert_eq!(limiter.tracked_identities(), 0, "expired identity is pruned");
    }

    #[test]
    fn spread_out_failures_do_not_lock() {
        let (limiter, clock, _) = limiter(16);
        for _ in 0..10 {
            limiter.record_failed_attempt("alice");
            clock.advance(TimeDelta::minutes(4));
        }
        assert!(!limiter.is_locked_out("alice"));
    }

    #[test]
    fn ring_is_bounded_and_lock_event_fires_once() {
        let (limiter, _, sink) = limiter(16);
        for _ in 0..50 {
            limiter.record_failed_attempt("alice");
        }
        assert!(limiter.is_locked_out("alice"));
        assert_eq!(limiter.history.lock()["alice"].len(), 5);
        assert_eq!(sink.count(SecurityEventKind::AccountLockedOut), 1);
    }

    #[test]
    fn failures_while_locked_push_the_lockout_back() {
        let (limiter, clock, _) = limiter(16);
        for _ in 0..5 {
            limiter.record_failed_attempt("alice");
            clock.advance(TimeDelta::minutes(1));
        }
        // Failures at 0..=4 minutes, now at 5 minutes.
        assert_eq!(limiter.lockout_remaining("alice"), Some(TimeDelta::minutes(10)));

        assert!(limiter.record_failed_attempt("alice"));
        // Oldest counted failure is now the one at 1 minute.
        assert_eq!(limiter.lockout_remaining("alice"), Some(TimeDelta::minutes(11)));

        clock.advance(TimeDelta::minutes(11));
        assert!(!limiter.is_locked_out("alice"));
    }

    #[test]
    fn reset_clears_identity() {
        let (limiter, _, _) = limiter(16);
        for _ in 0..5 {
            limiter.record_failed_attempt("alice");
        }
        limiter.reset_attempts("alice");
        assert!(!limiter.is_locked_out("alice"));
    }

    #[test]
    fn identity_cap_evicts_expired_first() {
        let (limiter, clock, _) = limiter(2);
        limiter.record_failed_attempt("old");
        clock.advance(TimeDelta::minutes(20));
        limiter.record_failed_attempt("recent");
        limiter.record_failed_attempt("new");
        assert_eq!(limiter.tracked_identities(), 2);
        let history = limiter.history.lock();
        assert!(!history.contains_key("old"));
        assert!(history.contains_key("recent"));
        assert!(history.contains_key("new"));
    }

    #[test]
    fn identity_cap_evicts_stalest_when_all_live() {
        let (limiter, clock, _) = limiter(2);
        limiter.record_failed_attempt("a");
        clock.advance(TimeDelta::seconds(1));
        limiter.record_failed_attempt("b");
        clock.advance(TimeDelta::seconds(1));
        limiter.record_failed_attempt("c");
        let history = limiter.history.lock();
        assert_eq!(history.len(), 2);
        assert!(!history.contains_key("a"));
    }
}
