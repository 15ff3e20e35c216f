use crate::classify::{Classification, FailureCategory, classify};
use crate::models::{JobStatus, ScrapingJob};
use crate::notify::{Notification, Notifier};
use crate::ports::JobStore;
use crate::status::{JobSnapshot, StatusBoard};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval_at, timeout};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    Completed,
    Failed(Classification),
    /// The poll window closed before the job reached a terminal state.
    Abandoned { last_status: Option<JobStatus> },
}

/// Polls job rows until they finish. Read-only towards the store.
#[derive(Clone)]
pub struct JobMonitor {
    jobs: Arc<dyn JobStore>,
    notifier: Arc<dyn Notifier>,
    board: StatusBoard,
    check_interval: Duration,
    max_wait: Duration,
}

impl JobMonitor {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        notifier: Arc<dyn Notifier>,
        board: StatusBoard,
        check_interval: Duration,
        max_wait: Duration,
    ) -> Self {
        Self {
            jobs,
            notifier,
            board,
            check_interval,
            max_wait,
        }
    }

    /// Spawns a poll loop for `job_id`. Duplicate monitors for one job are
    /// not deduplicated here.
    pub fn start_monitoring(&self, job_id: String, provider_id: String) -> JoinHandle<MonitorOutcome> {
        let monitor = self.clone();
        tokio::spawn(async move { monitor.watch(&job_id, &provider_id).await })
    }

    pub async fn watch(&self, job_id: &str, provider_id: &str) -> MonitorOutcome {
        info!(target: "scrape.monitor", job_id, provider_id, "monitoring job");
        let mut last_status = None;
        let polled = timeout(
            self.max_wait,
            self.poll_until_terminal(job_id, provider_id, &mut last_status),
        )
        .await;

        match polled {
            Ok(outcome) => outcome,
            Err(_) => {
                // no notification: the job may still finish out-of-band
                warn!(
                    target: "scrape.monitor",
                    job_id,
                    provider_id,
                    last_status = ?last_status,
                    max_wait_ms = self.max_wait.as_millis() as u64,
                    "job did not finish within the poll window, abandoning"
                );
                crate::metrics::job_abandoned();
                MonitorOutcome::Abandoned { last_status }
            }
        }
    }

    async fn poll_until_terminal(
        &self,
        job_id: &str,
        provider_id: &str,
        last_status: &mut Option<JobStatus>,
    ) -> MonitorOutcome {
        let start = tokio::time::Instant::now() + self.check_interval;
        let mut ticker = interval_at(start, self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let job = match self.jobs.fetch_job(job_id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    debug!(target: "scrape.monitor", job_id, "job row not visible yet");
                    continue;
                }
                Err(err) => {
                    warn!(target: "scrape.monitor", job_id, error = %err, "job poll failed");
                    continue;
                }
            };

            if let Some(previous) = *last_status
                && previous.regresses_to(job.status)
            {
                warn!(
                    target: "scrape.monitor",
                    job_id,
                    previous = %previous,
                    observed = %job.status,
                    "ignoring regressed job status"
                );
                continue;
            }
            *last_status = Some(job.status);
            self.board
                .record_job(provider_id, JobSnapshot::from_job(&job))
                .await;

            match job.status {
                JobStatus::Completed => {
                    crate::metrics::job_terminal(JobStatus::Completed);
                    self.notifier
                        .notify(Notification::success(provider_id, job_id, &job.provider));
                    return MonitorOutcome::Completed;
                }
                JobStatus::Failed => {
                    crate::metrics::job_terminal(JobStatus::Failed);
                    let classification = classify_job_failure(&job);
                    self.notifier.notify(Notification::failure(
                        provider_id,
                        Some(job_id),
                        classification,
                    ));
                    return MonitorOutcome::Failed(classification);
                }
                JobStatus::Pending | JobStatus::InProgress => {
                    debug!(target: "scrape.monitor", job_id, status = %job.status, "job still running");
                }
            }
        }
    }
}

fn classify_job_failure(job: &ScrapingJob) -> Classification {
    match job.error_message.as_deref().map(str::trim) {
        Some(message) if !message.is_empty() => classify(message),
        _ => Classification::of(FailureCategory::Unknown),
    }
}
