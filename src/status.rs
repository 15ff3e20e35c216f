use crate::models::{JobStatus, ScrapingJob};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_with::skip_serializing_none;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::debug;

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub job_id: Option<String>,
    pub status: JobStatus,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl JobSnapshot {
    pub fn from_job(job: &ScrapingJob) -> Self {
        Self {
            job_id: Some(job.id.clone()),
            status: job.status,
            updated_at: job
                .updated_at
                .or(job.completed_at)
                .unwrap_or(job.created_at),
            error: job.error_message.clone(),
        }
    }
}

/// UI feedback for one provider. Derived; the job row is authoritative.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScrapingState {
    pub attempting: bool,
    pub last_job: Option<JobSnapshot>,
}

#[derive(Clone, Default)]
pub struct StatusBoard {
    states: Arc<Mutex<HashMap<String, ScrapingState>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, provider_id: &str) -> ScrapingState {
        let guard = self.states.lock().await;
        guard.get(provider_id).cloned().unwrap_or_default()
    }

    pub async fn set_attempting(&self, provider_id: &str, attempting: bool) {
        let mut guard = self.states.lock().await;
        guard.entry(provider_id.to_string()).or_default().attempting = attempting;
    }

    /// Records a snapshot unless it would move the same job backwards.
    pub async fn record_job(&self, provider_id: &str, snapshot: JobSnapshot) -> bool {
        let mut guard = self.states.lock().await;
        let state = guard.entry(provider_id.to_string()).or_default();
        if let Some(previous) = &state.last_job
            && previous.job_id.is_some()
            && previous.job_id == snapshot.job_id
            && previous.status.regresses_to(snapshot.status)
        {
            debug!(
                target: "scrape.status",
                provider_id,
                previous = %previous.status,
                observed = %snapshot.status,
                "ignoring regressed snapshot"
            );
            return false;
        }
        state.last_job = Some(snapshot);
        true
    }

    pub async fn record_failure(&self, provider_id: &str, job_id: Option<&str>, message: &str) {
        let snapshot = JobSnapshot {
            job_id: job_id.map(str::to_string),
            status: JobStatus::Failed,
            updated_at: Utc::now(),
            error: Some(message.to_string()),
        };
        let mut guard = self.states.lock().await;
        guard.entry(provider_id.to_string()).or_default().last_job = Some(snapshot);
    }
}
