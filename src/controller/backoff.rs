//! Per-object requeue delays
//!
//! Two independent counters are kept per object: one for reconciles that
//! ended waiting on the platform (`poll`) and one for reconciles that
//! failed (`failure`). Both grow `floor * 2^n` up to the ceiling, both
//! reset when the object's generation changes, and both reset once the
//! object converges.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Exponent cap; keeps the multiplication far from overflow
const MAX_EXPONENT: u32 = 16;

/// `floor * 2^attempt`, capped at `ceiling`
pub fn calculate_backoff(attempt: u32, floor: Duration, ceiling: Duration) -> Duration {
    let factor = 1u32 << attempt.min(MAX_EXPONENT);
    floor.saturating_mul(factor).min(ceiling)
}

#[derive(Clone, Debug, Default)]
struct Attempts {
    generation: Option<i64>,
    polls: u32,
    failures: u32,
    conflict_retried: bool,
}

#[derive(Debug)]
pub struct RequeueBackoff {
    floor: Duration,
    ceiling: Duration,
    objects: Mutex<HashMap<String, Attempts>>,
}

impl RequeueBackoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling: ceiling.max(floor),
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    fn with_entry<T>(&self, key: &str, generation: Option<i64>, f: impl FnOnce(&mut Attempts) -> T) -> T {
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = objects.entry(key.to_string()).or_default();
        if entry.generation != generation {
            *entry = Attempts {
                generation,
                ..Default::default()
            };
        }
        f(entry)
    }

    /// Delay before re-checking an object still waiting on the platform
    ///
    /// A successful pass clears the failure streak.
    pub fn next_poll(&self, key: &str, generation: Option<i64>) -> Duration {
        self.with_entry(key, generation, |a| {
            a.failures = 0;
            a.conflict_retried = false;
            let delay = calculate_backoff(a.polls, self.floor, self.ceiling);
            a.polls = a.polls.saturating_add(1);
            delay
        })
    }

    /// Delay after a failed reconcile
    pub fn next_failure(&self, key: &str, generation: Option<i64>) -> Duration {
        self.with_entry(key, generation, |a| {
            let delay = calculate_backoff(a.failures, self.floor, self.ceiling);
            a.failures = a.failures.saturating_add(1);
            delay
        })
    }

    /// The first conflict in a streak retries at once; later ones back off
    pub fn next_conflict(&self, key: &str, generation: Option<i64>) -> Duration {
        let immediate = self.with_entry(key, generation, |a| {
            if a.conflict_retried {
                false
            } else {
                a.conflict_retried = true;
                true
            }
        });
        if immediate {
            Duration::ZERO
        } else {
            self.next_failure(key, generation)
        }
    }

    /// Object converged or gone; start over next time
    pub fn reset(&self, key: &str) {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Keep only the objects `live` still accepts
    pub fn retain(&self, live: impl Fn(&str) -> bool) {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|key, _| live(key));
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLOOR: Duration = Duration::from_secs(5);
    const CEILING: Duration = Duration::from_secs(60);

    #[test]
    fn test_backoff_calculation() {
        assert_eq!(calculate_backoff(0, FLOOR, CEILING), Duration::from_secs(5));
        assert_eq!(calculate_backoff(1, FLOOR, CEILING), Duration::from_secs(10));
        assert_eq!(calculate_backoff(3, FLOOR, CEILING), Duration::from_secs(40));
        // capped at the ceiling
        assert_eq!(calculate_backoff(4, FLOOR, CEILING), CEILING);
        assert_eq!(calculate_backoff(u32::MAX, FLOOR, CEILING), CEILING);
    }

    #[test]
    fn test_failures_grow_monotonically_until_ceiling() {
        let backoff = RequeueBackoff::new(FLOOR, CEILING);
        let delays: Vec<_> = (0..8).map(|_| backoff.next_failure("ns/c1", Some(1))).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays[0], FLOOR);
        assert_eq!(*delays.last().unwrap(), CEILING);
    }

    #[test]
    fn test_generation_change_resets() {
        let backoff = RequeueBackoff::new(FLOOR, CEILING);
        backoff.next_failure("ns/c1", Some(1));
        backoff.next_failure("ns/c1", Some(1));
        assert_eq!(backoff.next_failure("ns/c1", Some(2)), FLOOR);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let backoff = RequeueBackoff::new(FLOOR, CEILING);
        backoff.next_failure("ns/m1", Some(1));
        backoff.next_failure("ns/m1", Some(1));
        backoff.next_poll("ns/m1", Some(1));
        assert_eq!(backoff.next_failure("ns/m1", Some(1)), FLOOR);

        backoff.reset("ns/m1");
        assert_eq!(backoff.next_poll("ns/m1", Some(1)), FLOOR);
    }

    #[test]
    fn test_first_conflict_is_immediate() {
        let backoff = RequeueBackoff::new(FLOOR, CEILING);
        assert_eq!(backoff.next_conflict("ns/m1", Some(1)), Duration::ZERO);
        assert_eq!(backoff.next_conflict("ns/m1", Some(1)), FLOOR);
        assert_eq!(backoff.next_conflict("ns/m1", Some(1)), FLOOR * 2);
    }

    #[test]
    fn test_departed_objects_are_dropped() {
        let backoff = RequeueBackoff::new(FLOOR, CEILING);
        backoff.next_failure("VCDMachine/ns/gone", Some(1));
        backoff.next_poll("VCDMachine/ns/kept", Some(1));
        assert_eq!(backoff.len(), 2);

        backoff.retain(|key| key == "VCDMachine/ns/kept");
        assert_eq!(backoff.len(), 1);
        assert_eq!(backoff.next_failure("VCDMachine/ns/gone", Some(1)), FLOOR);

        backoff.reset("VCDMachine/ns/kept");
        backoff.reset("VCDMachine/ns/gone");
        assert!(backoff.is_empty());
    }

    #[test]
    fn test_objects_are_independent() {
        let backoff = RequeueBackoff::new(FLOOR, CEILING);
        backoff.next_failure("ns/a", None);
        backoff.next_failure("ns/a", None);
        assert_eq!(backoff.next_failure("ns/b", None), FLOOR);
    }
}
