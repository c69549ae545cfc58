//! Decision model: what the retry sweep does with one pending delivery.
//!
//! Deciders are pure functions over the delivery's idle time and the decoded
//! task. Carrying out the decision (ack + re-append) is the sweeper's job.

use std::time::Duration;

use super::task::HarvestTask;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepDecision {
    /// Still within its idle budget; a live worker may own it.
    Fresh,

    /// Ack the stale delivery and re-append a copy with `retry_count + 1`.
    Requeue { next_retry_count: u32 },

    /// Out of retries. Left pending for operator attention.
    Stuck { retry_count: u32, max_retries: u32 },
}

pub trait RetryDecider: Send + Sync {
    fn decide(&self, idle: Duration, task: &HarvestTask) -> SweepDecision;
}

/// Requeues deliveries idle longer than `stale_after` while retries remain.
#[derive(Debug, Clone)]
pub struct DefaultRetryDecider {
    stale_after: Duration,
}

impl DefaultRetryDecider {
    pub fn new(stale_after: Duration) -> Self {
        Self { stale_after }
    }
}

impl Default for DefaultRetryDecider {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

impl RetryDecider for DefaultRetryDecider {
    fn decide(&self, idle: Duration, task: &HarvestTask) -> SweepDecision {
        if idle <= self.stale_after {
            SweepDecision::Fresh
        } else if task.can_retry() {
            SweepDecision::Requeue {
                next_retry_count: task.retry_count + 1,
            }
        } else {
            SweepDecision::Stuck {
                retry_count: task.retry_count,
                max_retries: task.max_retries,
            }
        }
    }
}
