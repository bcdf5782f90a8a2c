//! Shared bookkeeping for the cluster and machine reconcilers
//!
//! A reconcile pass walks a fixed sequence of steps. Each step either
//! finishes, is still running on the platform, or fails. Terminal and
//! timeout failures are written into status here. Transient ones count
//! as waiting while provisioning is underway, so they run into the
//! provisioning deadline; otherwise they are returned as errors and the
//! scheduler backs off without touching status.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use super::conditions::{find_condition, mark_false, set_summary, READY};
use crate::config::ReconcileConfig;
use crate::crd::{Condition, ConditionSeverity};
use crate::error::{Error, ErrorClass, Result};
use crate::vcd::Progress;

pub const REASON_PROVISIONING_TIMEOUT: &str = "ProvisioningTimeout";

/// What the scheduler should do after a pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Next {
    /// Converged; look again at the resync interval
    Resync,
    /// Waiting on the platform or on another object; requeue with backoff
    Poll,
    /// Nothing to do until the object changes
    AwaitChange,
    After(Duration),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Outcome<S> {
    pub status: S,
    pub next: Next,
    /// Teardown finished; the finalizer may go
    pub release_finalizer: bool,
}

impl<S> Outcome<S> {
    pub fn new(status: S, next: Next) -> Self {
        Self {
            status,
            next,
            release_finalizer: false,
        }
    }

    pub fn released(status: S) -> Self {
        Self {
            status,
            next: Next::AwaitChange,
            release_finalizer: true,
        }
    }
}

pub enum Step<T> {
    Done(T),
    Waiting(String),
    Failed(Error),
}

/// Sort an adapter result into done, waiting or failed
///
/// Transient and conflict errors pass through as `Err`.
pub fn step<T>(result: Result<Progress<T>>) -> Result<Step<T>> {
    match result {
        Ok(Progress::Ready(value)) => Ok(Step::Done(value)),
        Ok(Progress::InProgress(what)) => Ok(Step::Waiting(what)),
        Err(e) => match e.class() {
            ErrorClass::Terminal => Ok(Step::Failed(e)),
            ErrorClass::Timeout => Ok(Step::Waiting(e.to_string())),
            ErrorClass::Transient | ErrorClass::Conflict => Err(e),
        },
    }
}

/// `step` for a pass that may be provisioning
///
/// Once a provisioning start time is recorded, a transient error is
/// reported as waiting so status is kept and the deadline applies.
pub fn provisioning_step<S: LifecycleStatus, T>(status: &S, result: Result<Progress<T>>) -> Result<Step<T>> {
    match result {
        Err(e) if e.class() == ErrorClass::Transient && status.provisioning_started_at().is_some() => {
            warn!(error = %e, "Platform call failed while provisioning; will retry");
            Ok(Step::Waiting(e.to_string()))
        }
        other => step(other),
    }
}

/// Status fields both reconcilers manage the same way
pub trait LifecycleStatus {
    fn conditions(&self) -> &[Condition];
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
    fn provisioning_started_at(&self) -> Option<&str>;
    fn set_ready(&mut self, ready: bool);
    fn record_failure(&mut self, reason: &str, message: &str);
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn elapsed_since(raw: &str, now: DateTime<Utc>) -> Option<Duration> {
    parse_time(raw).and_then(|t| (now - t).to_std().ok())
}

pub fn provisioning_expired(started_at: Option<&str>, now: DateTime<Utc>, timeout: Duration) -> bool {
    started_at
        .and_then(|raw| elapsed_since(raw, now))
        .map(|elapsed| elapsed > timeout)
        .unwrap_or(false)
}

/// Remaining cool-down before a timed-out object may be retried
///
/// Measured from the last `Ready` transition; `None` means retry now.
pub fn retry_cooldown(conditions: &[Condition], now: DateTime<Utc>, ceiling: Duration) -> Option<Duration> {
    let failed_at = find_condition(conditions, READY)?;
    let elapsed = elapsed_since(&failed_at.last_transition_time, now)?;
    ceiling.checked_sub(elapsed).filter(|d| !d.is_zero())
}

/// Record a step that is still running, or a timeout if it has run too long
pub fn waiting<S: LifecycleStatus>(
    mut status: S,
    dependencies: &[&str],
    condition: &str,
    reason: &str,
    what: String,
    now: DateTime<Utc>,
    config: &ReconcileConfig,
) -> Outcome<S> {
    if provisioning_expired(status.provisioning_started_at(), now, config.provision_timeout()) {
        let message = format!(
            "not ready after {}s: {what}",
            config.provision_timeout().as_secs()
        );
        return failed(
            status,
            dependencies,
            condition,
            REASON_PROVISIONING_TIMEOUT,
            &message,
            ErrorClass::Timeout,
            config,
        );
    }

    mark_false(status.conditions_mut(), condition, reason, ConditionSeverity::Info, what);
    let ready = set_summary(status.conditions_mut(), dependencies);
    status.set_ready(ready);
    Outcome::new(status, Next::Poll)
}

/// Record a failure; timeouts come back after the ceiling, the rest wait for a spec change
pub fn failed<S: LifecycleStatus>(
    mut status: S,
    dependencies: &[&str],
    condition: &str,
    reason: &str,
    message: &str,
    class: ErrorClass,
    config: &ReconcileConfig,
) -> Outcome<S> {
    mark_false(status.conditions_mut(), condition, reason, ConditionSeverity::Error, message);
    let ready = set_summary(status.conditions_mut(), dependencies);
    status.set_ready(ready);
    status.record_failure(reason, message);

    let next = if class == ErrorClass::Timeout {
        Next::After(config.requeue_ceiling())
    } else {
        Next::AwaitChange
    };
    Outcome::new(status, next)
}

/// `failed` for an error value
pub fn failed_with<S: LifecycleStatus>(
    status: S,
    dependencies: &[&str],
    condition: &str,
    error: &Error,
    config: &ReconcileConfig,
) -> Outcome<S> {
    failed(
        status,
        dependencies,
        condition,
        error.reason(),
        &error.to_string(),
        error.class(),
        config,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_step_classification() {
        assert!(matches!(step::<()>(Ok(Progress::Ready(()))).unwrap(), Step::Done(())));
        assert!(matches!(
            step::<()>(Err(Error::platform(400, "", "quota exceeded"))).unwrap(),
            Step::Failed(_)
        ));
        assert!(matches!(
            step::<()>(Err(Error::TaskTimeout {
                operation: "create vm".to_string(),
                elapsed: Duration::from_secs(20),
            }))
            .unwrap(),
            Step::Waiting(_)
        ));
        assert!(step::<()>(Err(Error::platform(503, "", "down"))).is_err());
    }

    struct TestStatus {
        conditions: Vec<Condition>,
        started_at: Option<String>,
    }

    impl LifecycleStatus for TestStatus {
        fn conditions(&self) -> &[Condition] {
            &self.conditions
        }
        fn conditions_mut(&mut self) -> &mut Vec<Condition> {
            &mut self.conditions
        }
        fn provisioning_started_at(&self) -> Option<&str> {
            self.started_at.as_deref()
        }
        fn set_ready(&mut self, _ready: bool) {}
        fn record_failure(&mut self, _reason: &str, _message: &str) {}
    }

    #[test]
    fn test_transient_error_while_provisioning_is_waiting() {
        let provisioning = TestStatus {
            conditions: vec![],
            started_at: Some(Utc::now().to_rfc3339()),
        };
        let settled = TestStatus {
            conditions: vec![],
            started_at: None,
        };

        let outage = || Err::<Progress<()>, _>(Error::platform(503, "", "down"));
        assert!(matches!(
            provisioning_step(&provisioning, outage()).unwrap(),
            Step::Waiting(_)
        ));
        assert!(provisioning_step(&settled, outage()).is_err());
        assert!(matches!(
            provisioning_step(&provisioning, Err::<Progress<()>, _>(Error::platform(400, "", "quota exceeded")))
                .unwrap(),
            Step::Failed(_)
        ));
    }

    #[test]
    fn test_provisioning_expired() {
        let now = Utc::now();
        let started = (now - ChronoDuration::seconds(120)).to_rfc3339();
        assert!(provisioning_expired(Some(&started), now, Duration::from_secs(60)));
        assert!(!provisioning_expired(Some(&started), now, Duration::from_secs(600)));
        assert!(!provisioning_expired(None, now, Duration::from_secs(1)));
    }

    #[test]
    fn test_retry_cooldown() {
        let now = Utc::now();
        let mut ready = Condition::new_false(READY, REASON_PROVISIONING_TIMEOUT, ConditionSeverity::Error, "");
        ready.last_transition_time = (now - ChronoDuration::seconds(100)).to_rfc3339();
        let conditions = vec![ready];

        let remaining = retry_cooldown(&conditions, now, Duration::from_secs(300)).unwrap();
        assert!(remaining <= Duration::from_secs(200) && remaining > Duration::from_secs(199));
        assert!(retry_cooldown(&conditions, now, Duration::from_secs(60)).is_none());
    }
}
