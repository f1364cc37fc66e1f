//! Periodic refetch used while the real-time channel is down.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{error::ClientResult, transport::RealtimeChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Wait before the first check, giving the channel time to connect.
    pub grace: Duration,
    pub interval: Duration,
}

impl PollPolicy {
    pub const fn messages() -> Self {
        Self {
            grace: Duration::from_secs(3),
            interval: Duration::from_secs(5),
        }
    }

    pub const fn conversation_list() -> Self {
        Self {
            grace: Duration::from_secs(5),
            interval: Duration::from_secs(10),
        }
    }
}

#[async_trait]
pub trait PollTarget: Send + Sync {
    fn label(&self) -> &'static str;

    /// A user-initiated fetch is running; the tick is skipped.
    fn fetch_in_flight(&self) -> bool {
        false
    }

    /// Refetches the latest state and returns how many entries were new.
    async fn poll_once(&self) -> ClientResult<usize>;
}

/// Owns the polling task. Stopping or dropping it cancels the task.
#[derive(Debug, Default)]
pub struct FallbackPoller {
    task: Option<JoinHandle<()>>,
}

impl FallbackPoller {
    pub fn start(
        channel: Arc<dyn RealtimeChannel>,
        policy: PollPolicy,
        target: Arc<dyn PollTarget>,
    ) -> Self {
        let task = tokio::spawn(async move {
            tokio::time::sleep(policy.grace).await;
            if !channel.is_connected() {
                info!(
                    target_label = target.label(),
                    interval_ms = policy.interval.as_millis() as u64,
                    "poller: channel still down after grace period; polling"
                );
            }

            let mut ticker = tokio::time::interval(policy.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if channel.is_connected() {
                    continue;
                }
                if target.fetch_in_flight() {
                    debug!(target_label = target.label(), "poller: fetch in flight; tick skipped");
                    continue;
                }
                match target.poll_once().await {
                    Ok(0) => {}
                    Ok(added) => {
                        debug!(target_label = target.label(), added, "poller: merged new entries")
                    }
                    Err(err) if err.is_decode() => warn!(
                        target_label = target.label(),
                        error = %err,
                        "poller: malformed response treated as empty"
                    ),
                    Err(err) => {
                        warn!(target_label = target.label(), error = %err, "poller: refetch failed")
                    }
                }
            }
        });
        Self { task: Some(task) }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for FallbackPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[path = "tests/poller_tests.rs"]
mod tests;
