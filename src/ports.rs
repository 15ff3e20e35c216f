//! Seams to the hosted backend. The Supabase adapter and the in-memory
//! backend both implement these; the pipeline only sees the traits.

use crate::models::{
    Credentials, NewScrapingJob, ScrapeRequest, ScrapingJob, SubmissionResponse, UtilityProvider,
};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
}

/// Job records, owned by the backing store.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn fetch_job(&self, job_id: &str) -> Result<Option<ScrapingJob>, BackendError>;
    async fn create_job(&self, job: NewScrapingJob) -> Result<ScrapingJob, BackendError>;
    async fn latest_job_for_provider(
        &self,
        provider_id: &str,
    ) -> Result<Option<ScrapingJob>, BackendError>;
}

/// Read-only view of configured utility providers.
#[async_trait]
pub trait ProviderDirectory: Send + Sync {
    async fn fetch_provider(
        &self,
        provider_id: &str,
    ) -> Result<Option<UtilityProvider>, BackendError>;
}

/// Opaque secret-decryption call.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn decrypt_credentials(
        &self,
        provider_id: &str,
        property_id: &str,
    ) -> Result<Option<Credentials>, BackendError>;
}

/// Remote browser-automation service; accepts a job descriptor.
#[async_trait]
pub trait AutomationService: Send + Sync {
    async fn submit(&self, request: &ScrapeRequest) -> Result<SubmissionResponse, BackendError>;
}
