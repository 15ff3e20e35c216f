//! Process-local backend used in demo mode and by tests.

use crate::models::{
    Credentials, JobStatus, NewScrapingJob, ScrapeRequest, ScrapingJob, SubmissionResponse,
    UtilityProvider,
};
use crate::ports::{AutomationService, BackendError, JobStore, ProviderDirectory, SecretStore};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {job_id} cannot move from {from} to {to}")]
    NotAllowed {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },
}

#[derive(Default)]
struct MemoryState {
    providers: HashMap<String, UtilityProvider>,
    credentials: HashMap<String, Credentials>,
    jobs: Vec<ScrapingJob>,
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend seeded with two providers for one demo property.
    pub fn demo() -> Self {
        let backend = Self::new();
        backend.add_provider(
            UtilityProvider {
                id: "demo-electric".to_string(),
                provider_name: "Seattle City Light".to_string(),
                utility_type: "electricity".to_string(),
                property_id: "demo-property".to_string(),
                location: "1200 Pine St, Unit 4B".to_string(),
                username: "landlord@example.com".to_string(),
            },
            Some(Credentials {
                username: "landlord@example.com".to_string(),
                password: "demo-password".to_string(),
            }),
        );
        backend.add_provider(
            UtilityProvider {
                id: "demo-water".to_string(),
                provider_name: "Seattle Public Utilities".to_string(),
                utility_type: "water".to_string(),
                property_id: "demo-property".to_string(),
                location: "1200 Pine St, Unit 4B".to_string(),
                username: "landlord@example.com".to_string(),
            },
            Some(Credentials {
                username: "landlord@example.com".to_string(),
                password: "demo-password".to_string(),
            }),
        );
        backend
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_provider(&self, provider: UtilityProvider, credentials: Option<Credentials>) {
        let mut state = self.lock();
        if let Some(credentials) = credentials {
            state.credentials.insert(provider.id.clone(), credentials);
        }
        state.providers.insert(provider.id.clone(), provider);
    }

    pub fn provider(&self, provider_id: &str) -> Option<UtilityProvider> {
        self.lock().providers.get(provider_id).cloned()
    }

    pub fn jobs_for(&self, provider_id: &str) -> Vec<ScrapingJob> {
        self.lock()
            .jobs
            .iter()
            .filter(|job| job.utility_provider_id == provider_id)
            .cloned()
            .collect()
    }

    fn insert_job(&self, job: NewScrapingJob) -> ScrapingJob {
        let now = Utc::now();
        let row = ScrapingJob {
            id: Uuid::new_v4().to_string(),
            utility_provider_id: job.utility_provider_id,
            status: job.status,
            error_message: job.error_message,
            provider: job.provider,
            utility_type: job.utility_type,
            location: job.location,
            created_at: now,
            completed_at: job.status.is_terminal().then_some(now),
            updated_at: Some(now),
        };
        self.lock().jobs.push(row.clone());
        row
    }

    /// Moves a job forward. Regressions and moves out of a terminal state
    /// are rejected.
    pub fn advance_job(
        &self,
        job_id: &str,
        status: JobStatus,
        error_message: Option<String>,
    ) -> Result<ScrapingJob, TransitionError> {
        let mut state = self.lock();
        let job = state
            .jobs
            .iter_mut()
            .find(|job| job.id == job_id)
            .ok_or_else(|| TransitionError::NotFound(job_id.to_string()))?;
        if !job.status.can_advance_to(status) {
            return Err(TransitionError::NotAllowed {
                job_id: job_id.to_string(),
                from: job.status,
                to: status,
            });
        }
        let now = Utc::now();
        job.status = status;
        job.updated_at = Some(now);
        if status.is_terminal() {
            job.completed_at = Some(now);
        }
        if error_message.is_some() {
            job.error_message = error_message;
        }
        Ok(job.clone())
    }
}

#[async_trait]
impl JobStore for MemoryBackend {
    async fn fetch_job(&self, job_id: &str) -> Result<Option<ScrapingJob>, BackendError> {
        Ok(self.lock().jobs.iter().find(|job| job.id == job_id).cloned())
    }

    async fn create_job(&self, job: NewScrapingJob) -> Result<ScrapingJob, BackendError> {
        Ok(self.insert_job(job))
    }

    async fn latest_job_for_provider(
        &self,
        provider_id: &str,
    ) -> Result<Option<ScrapingJob>, BackendError> {
        Ok(self
            .lock()
            .jobs
            .iter()
            .rev()
            .find(|job| job.utility_provider_id == provider_id)
            .cloned())
    }
}

#[async_trait]
impl ProviderDirectory for MemoryBackend {
    async fn fetch_provider(
        &self,
        provider_id: &str,
    ) -> Result<Option<UtilityProvider>, BackendError> {
        Ok(self.provider(provider_id))
    }
}

#[async_trait]
impl SecretStore for MemoryBackend {
    async fn decrypt_credentials(
        &self,
        provider_id: &str,
        property_id: &str,
    ) -> Result<Option<Credentials>, BackendError> {
        let state = self.lock();
        let belongs = state
            .providers
            .get(provider_id)
            .is_some_and(|provider| provider.property_id == property_id);
        if !belongs {
            return Ok(None);
        }
        Ok(state.credentials.get(provider_id).cloned())
    }
}

/// Stands in for the browser-automation service: accepts every request,
/// then walks the job through `in_progress` to `completed`.
#[derive(Clone)]
pub struct SimulatedAutomation {
    backend: MemoryBackend,
    step: Duration,
}

impl SimulatedAutomation {
    pub fn new(backend: MemoryBackend, step: Duration) -> Self {
        Self { backend, step }
    }
}

#[async_trait]
impl AutomationService for SimulatedAutomation {
    async fn submit(&self, request: &ScrapeRequest) -> Result<SubmissionResponse, BackendError> {
        debug!(target: "scrape.simulated", request = %request.sanitized(), "simulated submission");
        let job = self.backend.insert_job(NewScrapingJob {
            utility_provider_id: request.utility_id.clone(),
            status: JobStatus::Pending,
            error_message: None,
            provider: request.provider_name.clone(),
            utility_type: request.utility_type.clone(),
            location: request.location.clone(),
        });

        let backend = self.backend.clone();
        let step = self.step;
        let job_id = job.id.clone();
        tokio::spawn(async move {
            for status in [JobStatus::InProgress, JobStatus::Completed] {
                sleep(step).await;
                if let Err(err) = backend.advance_job(&job_id, status, None) {
                    warn!(target: "scrape.simulated", job_id = %job_id, error = %err, "simulated transition rejected");
                    return;
                }
            }
            info!(target: "scrape.simulated", job_id = %job_id, "simulated scrape finished");
        });

        Ok(SubmissionResponse {
            success: true,
            job_id: Some(job.id),
            error: None,
        })
    }
}
