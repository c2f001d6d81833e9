//! Failed-login lockout keyed by normalized email.

use std::{collections::VecDeque, sync::Arc};

use dashmap::DashMap;
use time::{Duration, OffsetDateTime};
use tracing::warn;

use crate::{clock::Clock, error::AuthError};

#[derive(Debug, Default)]
struct FailureEntry {
    failures: VecDeque<OffsetDateTime>,
    in_flight: usize,
    locked_until: Option<OffsetDateTime>,
}

impl FailureEntry {
    fn prune(&mut self, cutoff: OffsetDateTime) {
        while self.failures.front().is_some_and(|ts| *ts <= cutoff) {
            self.failures.pop_front();
        }
    }

    fn is_locked(&self, now: OffsetDateTime) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }
}

/// Unknown emails are tracked exactly like real ones.
pub struct LoginGuard {
    entries: DashMap<String, FailureEntry>,
    max_failures: usize,
    lock_for: Duration,
    clock: Arc<dyn Clock>,
}

impl LoginGuard {
    /// `lock_for` doubles as the failure-counting window.
    pub fn new(max_failures: usize, lock_for: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            max_failures: max_failures.max(1),
            lock_for,
            clock,
        }
    }

    /// Admits one login attempt for `email`. Attempts still in flight count
    /// against the cap alongside recorded failures, so a concurrent burst
    /// cannot get more than `max_failures` password checks per window.
    pub fn begin(&self, email: &str) -> Result<LoginAttempt<'_>, AuthError> {
        let now = self.clock.now();
        let mut entry = self.entries.entry(email.to_string()).or_default();
        if entry.is_locked(now) {
            return Err(AuthError::AccountLocked);
        }
        entry.locked_until = None;
        entry.prune(now - self.lock_for);
        if entry.failures.len() + entry.in_flight >= self.max_failures {
            return Err(AuthError::AccountLocked);
        }
        entry.in_flight += 1;

        Ok(LoginAttempt {
            guard: self,
            email: email.to_string(),
            settled: false,
        })
    }

    fn record_failure(&self, email: &str) {
        let now = self.clock.now();
        let mut entry = self.entries.entry(email.to_string()).or_default();
        entry.in_flight = entry.in_flight.saturating_sub(1);
        entry.prune(now - self.lock_for);
        entry.failures.push_back(now);

        if entry.failures.len() >= self.max_failures {
            entry.locked_until = Some(now + self.lock_for);
            entry.failures.clear();
            warn!(email = %email, minutes = self.lock_for.whole_minutes(), "login lockout engaged");
        }
    }

    fn release(&self, email: &str) {
        if let Some(mut entry) = self.entries.get_mut(email) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
    }

    /// Forgets every failure and lock for `email`.
    pub fn record_success(&self, email: &str) {
        self.entries.remove(email);
    }

    /// Drops entries with no live lock, no recent failures and nothing in flight.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let cutoff = now - self.lock_for;
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            entry.prune(cutoff);
            entry.is_locked(now) || !entry.failures.is_empty() || entry.in_flight > 0
        });
        before.saturating_sub(self.entries.len())
    }
}

/// An admitted login. Dropping it unsettled frees its slot without
/// counting a failure.
pub struct LoginAttempt<'a> {
    guard: &'a LoginGuard,
    email: String,
    settled: bool,
}

impl LoginAttempt<'_> {
    pub fn failed(mut self) {
        self.settled = true;
        self.guard.record_failure(&self.email);
    }

    pub fn succeeded(mut self) {
        self.settled = true;
        self.guard.record_success(&self.email);
    }
}

impl Drop for LoginAttempt<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.guard.release(&self.email);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn guard() -> (LoginGuard, ManualClock) {
        let clock = ManualClock::starting_now();
        (
            LoginGuard::new(5, Duration::minutes(15), Arc::new(clock.clone())),
            clock,
        )
    }

    fn fail(guard: &LoginGuard, email: &str) {
        guard.begin(email).expect("attempt admitted").failed();
    }

    fn is_locked(guard: &LoginGuard, email: &str) -> bool {
        matches!(guard.begin(email), Err(AuthError::AccountLocked))
    }

    #[test]
    fn locks_after_max_failures_and_unlocks_after_cooldown() {
        let (guard, clock) = guard();
        for _ in 0..4 {
            fail(&guard, "a@b.com");
            assert!(!is_locked(&guard, "a@b.com"));
        }
        fail(&guard, "a@b.com");
        assert!(is_locked(&guard, "a@b.com"));
        assert!(!is_locked(&guard, "other@b.com"));

        clock.advance(Duration::minutes(15));
        assert!(!is_locked(&guard, "a@b.com"));
    }

    #[test]
    fn old_failures_fall_out_of_the_window() {
        let (guard, clock) = guard();
        for _ in 0..4 {
            fail(&guard, "a@b.com");
        }
        clock.advance(Duration::minutes(16));
        fail(&guard, "a@b.com");
        assert!(!is_locked(&guard, "a@b.com"));
    }

    #[test]
    fn success_clears_the_counter() {
        let (guard, _) = guard();
        for _ in 0..4 {
            fail(&guard, "a@b.com");
        }
        guard.begin("a@b.com").expect("admitted").succeeded();
        fail(&guard, "a@b.com");
        assert!(!is_locked(&guard, "a@b.com"));
    }

    #[test]
    fn attempts_in_flight_count_against_the_cap() {
        let (guard, _) = guard();
        let mut pending: Vec<_> = (0..5)
            .map(|_| guard.begin("burst@b.com").expect("admitted"))
            .collect();
        assert!(is_locked(&guard, "burst@b.com"));

        // An abandoned attempt gives its slot back.
        pending.pop();
        pending.push(guard.begin("burst@b.com").expect("slot freed"));

        for attempt in pending {
            attempt.failed();
        }
        assert!(is_locked(&guard, "burst@b.com"));
    }

    #[test]
    fn concurrent_failures_are_capped() {
        let (guard, _) = guard();
        let admitted = std::sync::atomic::AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..16 {
                scope.spawn(|| {
                    for _ in 0..4 {
                        if let Ok(attempt) = guard.begin("race@b.com") {
                            admitted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            attempt.failed();
                        }
                    }
                });
            }
        });
        assert_eq!(admitted.into_inner(), 5);
        assert!(is_locked(&guard, "race@b.com"));
    }

    #[test]
    fn sweep_keeps_live_locks() {
        let (guard, clock) = guard();
        for _ in 0..5 {
            fail(&guard, "locked@b.com");
        }
        fail(&guard, "once@b.com");
        clock.advance(Duration::minutes(15) - Duration::seconds(1));
        fail(&guard, "fresh@b.com");

        clock.advance(Duration::seconds(2));
        // once@ expired; locked@ lock ended; fresh@ still counting.
        assert_eq!(guard.sweep(), 2);
        assert!(!is_locked(&guard, "locked@b.com"));
    }
}
