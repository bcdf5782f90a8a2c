//! Bounded polling of platform tasks and transitional object states

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::api::CloudDirectorApi;
use super::types::{TaskHandle, TaskStatus};
use crate::config::TaskPollConfig;
use crate::error::{Error, Result};

/// Polls with exponentially growing intervals, never past a deadline
#[derive(Clone, Debug)]
pub struct TaskPoller {
    min_interval: Duration,
    max_interval: Duration,
}

impl TaskPoller {
    pub fn new(min_interval: Duration, max_interval: Duration) -> Self {
        Self {
            min_interval,
            max_interval: max_interval.max(min_interval),
        }
    }

    pub fn from_config(config: &TaskPollConfig) -> Self {
        Self::new(config.min_interval(), config.max_interval())
    }

    /// Successive sleep intervals: min, 2*min, 4*min, ... capped at max
    pub fn intervals(&self) -> impl Iterator<Item = Duration> {
        let max = self.max_interval;
        std::iter::successors(Some(self.min_interval), move |prev| {
            Some(prev.saturating_mul(2).min(max))
        })
    }

    /// Re-run `check` until it yields a value or the deadline passes
    ///
    /// Errors from `check` are returned immediately. Running out of time
    /// yields `Error::TaskTimeout` naming `operation`.
    pub async fn poll_until<T, F, Fut>(
        &self,
        operation: &str,
        deadline: Instant,
        mut check: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let started = Instant::now();
        let mut intervals = self.intervals();

        loop {
            if let Some(value) = check().await? {
                return Ok(value);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::TaskTimeout {
                    operation: operation.to_string(),
                    elapsed: now.duration_since(started),
                });
            }

            let interval = intervals.next().unwrap_or(self.max_interval);
            let sleep_for = interval.min(deadline.duration_since(now));
            debug!(operation, ?sleep_for, "still in progress");
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Wait for a task to reach a terminal state
    pub async fn wait(
        &self,
        api: &dyn CloudDirectorApi,
        handle: &TaskHandle,
        deadline: Instant,
    ) -> Result<()> {
        self.poll_until(&handle.operation, deadline, move || async move {
            let task = api.task(handle).await?;
            match task.status {
                TaskStatus::Success => Ok(Some(())),
                TaskStatus::Error => Err(Error::TaskFailed {
                    task: handle.operation.clone(),
                    message: task
                        .message
                        .unwrap_or_else(|| "no error detail reported".to_string()),
                }),
                TaskStatus::Queued | TaskStatus::Running => Ok(None),
            }
        })
        .await
    }
}
