use crate::classify::{Classification, Classified, FailureCategory, classify};
use crate::models::{
    CompatibilityFlags, Credentials, JobReference, JobStatus, NewScrapingJob, ScrapeRequest,
    UtilityProvider,
};
use crate::ports::{AutomationService, JobStore};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const FALLBACK_ANNOTATION: &str = "Job created as fallback due to remote service failure";

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("{0}")]
    Remote(String),
    #[error("no job id returned")]
    NoJobId,
    #[error("service temporarily unavailable: {0}")]
    ServiceUnavailable(String),
}

impl Classified for InvokeError {
    fn classification(&self) -> Classification {
        match self {
            InvokeError::Remote(text) => classify(text),
            InvokeError::NoJobId => Classification::of(FailureCategory::Unknown),
            InvokeError::ServiceUnavailable(_) => {
                Classification::of(FailureCategory::TransportFailure)
            }
        }
    }
}

/// Submits scrape requests to the automation service. When the service is
/// unreachable, a pending job row is written directly so the monitor still
/// has something to observe.
#[derive(Clone)]
pub struct AutomationInvoker {
    automation: Arc<dyn AutomationService>,
    jobs: Arc<dyn JobStore>,
    flags: CompatibilityFlags,
}

impl AutomationInvoker {
    pub fn new(automation: Arc<dyn AutomationService>, jobs: Arc<dyn JobStore>) -> Self {
        Self {
            automation,
            jobs,
            flags: CompatibilityFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: CompatibilityFlags) -> Self {
        self.flags = flags;
        self
    }

    pub async fn invoke(
        &self,
        provider: &UtilityProvider,
        credentials: Credentials,
    ) -> Result<JobReference, InvokeError> {
        let request = ScrapeRequest::new(provider, credentials, self.flags.clone());
        debug!(
            target: "scrape.invoker",
            request = %request.sanitized(),
            "submitting scrape request"
        );

        let failure = match self.automation.submit(&request).await {
            Ok(response) if response.success => {
                let job_id = response
                    .job_id
                    .filter(|id| !id.trim().is_empty())
                    .ok_or(InvokeError::NoJobId)?;
                info!(target: "scrape.invoker", provider_id = %provider.id, job_id = %job_id, "scrape job accepted");
                return Ok(JobReference::remote(job_id));
            }
            Ok(response) => response
                .error
                .unwrap_or_else(|| "automation service reported failure".to_string()),
            Err(err) => err.to_string(),
        };

        let classified = classify(&failure);
        if classified.category != FailureCategory::TransportFailure {
            return Err(InvokeError::Remote(failure));
        }

        warn!(
            target: "scrape.invoker",
            provider_id = %provider.id,
            category = %classified.category,
            error = %failure,
            "automation service unavailable, creating fallback job"
        );
        self.create_fallback_job(provider, &failure).await
    }

    async fn create_fallback_job(
        &self,
        provider: &UtilityProvider,
        failure: &str,
    ) -> Result<JobReference, InvokeError> {
        let job = NewScrapingJob {
            utility_provider_id: provider.id.clone(),
            status: JobStatus::Pending,
            error_message: Some(format!("{FALLBACK_ANNOTATION}: {failure}")),
            provider: provider.provider_name.clone(),
            utility_type: provider.utility_type.clone(),
            location: provider.location.clone(),
        };
        match self.jobs.create_job(job).await {
            Ok(created) => {
                crate::metrics::fallback_job_created();
                info!(target: "scrape.invoker", provider_id = %provider.id, job_id = %created.id, "fallback job created");
                Ok(JobReference::fallback(created.id))
            }
            Err(err) => {
                error!(target: "scrape.invoker", provider_id = %provider.id, error = %err, "fallback job creation failed");
                Err(InvokeError::ServiceUnavailable(err.to_string()))
            }
        }
    }
}
