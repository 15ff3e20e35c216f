use crate::classify::{Classification, Classified, FailureCategory, classify};
use crate::config::ScrapeSettings;
use crate::credentials::{CredentialsError, CredentialsGateway};
use crate::invoker::{AutomationInvoker, InvokeError};
use crate::memory::{MemoryBackend, SimulatedAutomation};
use crate::models::{JobReference, JobStatus};
use crate::monitor::{JobMonitor, MonitorOutcome};
use crate::notify::{Notification, Notifier};
use crate::ports::{AutomationService, BackendError, JobStore, ProviderDirectory, SecretStore};
use crate::queue::AttemptRunner;
use crate::retry::{RetryController, RetryFailure};
use crate::status::{JobSnapshot, StatusBoard};
use crate::supabase::SupabaseClient;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("utility provider {0} not found")]
    ProviderNotFound(String),
    #[error("provider lookup failed: {0}")]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Credentials(#[from] CredentialsError),
    #[error(transparent)]
    Invoke(#[from] InvokeError),
}

impl Classified for ScrapeError {
    fn classification(&self) -> Classification {
        match self {
            ScrapeError::ProviderNotFound(_) => Classification {
                category: FailureCategory::UnsupportedProvider,
                message: "This utility provider could not be found. It may have been removed.",
            },
            ScrapeError::Backend(err) => classify(&err.to_string()),
            ScrapeError::Credentials(err) => err.classification(),
            ScrapeError::Invoke(err) => err.classification(),
        }
    }
}

/// The collaborators the pipeline talks to.
#[derive(Clone)]
pub struct Backends {
    pub providers: Arc<dyn ProviderDirectory>,
    pub secrets: Arc<dyn SecretStore>,
    pub jobs: Arc<dyn JobStore>,
    pub automation: Arc<dyn AutomationService>,
}

impl Backends {
    pub fn supabase(client: SupabaseClient) -> Self {
        let client = Arc::new(client);
        Self {
            providers: client.clone(),
            secrets: client.clone(),
            jobs: client.clone(),
            automation: client,
        }
    }

    pub fn memory(backend: MemoryBackend, automation: SimulatedAutomation) -> Self {
        let backend = Arc::new(backend);
        Self {
            providers: backend.clone(),
            secrets: backend.clone(),
            jobs: backend,
            automation: Arc::new(automation),
        }
    }
}

/// A scrape that reached the automation service. The monitor keeps
/// running after this is dropped.
pub struct StartedScrape {
    pub job: JobReference,
    pub monitor: JoinHandle<MonitorOutcome>,
}

#[derive(Clone)]
pub struct ScrapePipeline {
    providers: Arc<dyn ProviderDirectory>,
    credentials: CredentialsGateway,
    invoker: AutomationInvoker,
    retry: RetryController,
    monitor: JobMonitor,
    board: StatusBoard,
    notifier: Arc<dyn Notifier>,
}

impl ScrapePipeline {
    pub fn new(
        backends: Backends,
        settings: &ScrapeSettings,
        board: StatusBoard,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let invoker = AutomationInvoker::new(backends.automation, backends.jobs.clone())
            .with_flags(settings.flags.clone());
        let monitor = JobMonitor::new(
            backends.jobs,
            notifier.clone(),
            board.clone(),
            settings.job_check_interval,
            settings.job_check_max_time,
        );
        Self {
            providers: backends.providers,
            credentials: CredentialsGateway::new(backends.secrets),
            invoker,
            retry: RetryController::new(settings.retry_policy()),
            monitor,
            board,
            notifier,
        }
    }

    /// One scrape attempt: provider lookup, credentials, submission.
    pub async fn attempt(&self, provider_id: &str) -> Result<JobReference, ScrapeError> {
        let provider = self
            .providers
            .fetch_provider(provider_id)
            .await?
            .ok_or_else(|| ScrapeError::ProviderNotFound(provider_id.to_string()))?;
        let credentials = self
            .credentials
            .get_credentials(&provider.id, &provider.property_id)
            .await?;
        Ok(self.invoker.invoke(&provider, credentials).await?)
    }

    /// Retried attempt followed by monitoring. Failures are recorded on the
    /// board and notified before being returned.
    pub async fn run(&self, provider_id: &str) -> Result<StartedScrape, RetryFailure<ScrapeError>> {
        self.board.set_attempting(provider_id, true).await;
        let result = self
            .retry
            .attempt_with_retry(provider_id, |_| self.attempt(provider_id))
            .await;

        let outcome = match result {
            Ok(job) => {
                info!(
                    target: "scrape.pipeline",
                    provider_id,
                    job_id = %job.job_id,
                    origin = ?job.origin,
                    "scrape submitted, monitoring job"
                );
                self.board
                    .record_job(
                        provider_id,
                        JobSnapshot {
                            job_id: Some(job.job_id.clone()),
                            status: JobStatus::Pending,
                            updated_at: Utc::now(),
                            error: None,
                        },
                    )
                    .await;
                let monitor = self
                    .monitor
                    .start_monitoring(job.job_id.clone(), provider_id.to_string());
                Ok(StartedScrape { job, monitor })
            }
            Err(failure) => {
                self.board
                    .record_failure(provider_id, None, failure.user_message())
                    .await;
                self.notifier.notify(Notification::failure(
                    provider_id,
                    None,
                    failure.classification,
                ));
                Err(failure)
            }
        };
        self.board.set_attempting(provider_id, false).await;
        outcome
    }
}

#[async_trait]
impl AttemptRunner for ScrapePipeline {
    async fn run_attempt(&self, provider_id: &str) {
        if let Err(failure) = self.run(provider_id).await {
            warn!(
                target: "scrape.pipeline",
                provider_id,
                attempts = failure.attempts,
                category = %failure.classification.category,
                "scrape failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::PGCRYPTO_MESSAGE;
    use crate::models::{
        Credentials, JobOrigin, NewScrapingJob, ScrapeRequest, ScrapingJob, SubmissionResponse,
    };
    use crate::notify::{NotificationFeed, NotificationLevel};
    use crate::retry::GiveUpReason;
    use std::sync::Mutex;
    use tokio::time::Duration;

    /// Replies from a script, repeating the last entry.
    struct ScriptedAutomation {
        replies: Vec<Result<SubmissionResponse, BackendError>>,
        calls: Mutex<usize>,
    }

    impl ScriptedAutomation {
        fn new(replies: Vec<Result<SubmissionResponse, BackendError>>) -> Arc<Self> {
            Arc::new(Self {
                replies,
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl AutomationService for ScriptedAutomation {
        async fn submit(&self, _request: &ScrapeRequest) -> Result<SubmissionResponse, BackendError> {
            let index = {
                let mut calls = self.calls.lock().unwrap();
                let index = (*calls).min(self.replies.len() - 1);
                *calls += 1;
                index
            };
            self.replies[index].clone()
        }
    }

    /// Job store whose inserts always fail, so no fallback row can be written.
    struct ReadOnlyJobs(MemoryBackend);

    #[async_trait]
    impl JobStore for ReadOnlyJobs {
        async fn fetch_job(&self, job_id: &str) -> Result<Option<ScrapingJob>, BackendError> {
            self.0.fetch_job(job_id).await
        }
        async fn create_job(&self, _job: NewScrapingJob) -> Result<ScrapingJob, BackendError> {
            Err(BackendError::Request("HTTP 503: database unavailable".into()))
        }
        async fn latest_job_for_provider(
            &self,
            provider_id: &str,
        ) -> Result<Option<ScrapingJob>, BackendError> {
            self.0.latest_job_for_provider(provider_id).await
        }
    }

    struct MissingExtension;

    #[async_trait]
    impl SecretStore for MissingExtension {
        async fn decrypt_credentials(
            &self,
            _provider_id: &str,
            _property_id: &str,
        ) -> Result<Option<Credentials>, BackendError> {
            Err(BackendError::Request(
                "HTTP 404: function pgp_sym_decrypt(bytea, text) does not exist; is pgcrypto installed?"
                    .into(),
            ))
        }
    }

    fn settings() -> ScrapeSettings {
        ScrapeSettings::default()
    }

    fn pipeline(backends: Backends, feed: &NotificationFeed, board: &StatusBoard) -> ScrapePipeline {
        ScrapePipeline::new(backends, &settings(), board.clone(), Arc::new(feed.clone()))
    }

    fn scripted_backends(
        backend: &MemoryBackend,
        automation: Arc<ScriptedAutomation>,
        jobs: Arc<dyn JobStore>,
    ) -> Backends {
        Backends {
            providers: Arc::new(backend.clone()),
            secrets: Arc::new(backend.clone()),
            jobs,
            automation,
        }
    }

    fn transport_500() -> Result<SubmissionResponse, BackendError> {
        Err(BackendError::Request("Request failed with status code 500".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_500_fast_fails_after_two_attempts() {
        let backend = MemoryBackend::demo();
        let automation = ScriptedAutomation::new(vec![transport_500()]);
        let feed = NotificationFeed::new(10);
        let board = StatusBoard::new();
        let pipeline = pipeline(
            scripted_backends(
                &backend,
                automation.clone(),
                Arc::new(ReadOnlyJobs(backend.clone())),
            ),
            &feed,
            &board,
        );

        let failure = match pipeline.run("demo-electric").await {
            Ok(_) => panic!("expected failure"),
            Err(failure) => failure,
        };

        assert_eq!(automation.calls(), 2);
        assert_eq!(failure.attempts, 2);
        assert_eq!(failure.reason, GiveUpReason::InfrastructureRepeated);
        assert!(
            failure
                .user_message()
                .contains("utility provider service is currently unavailable")
        );

        let notes = feed.recent();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].level, NotificationLevel::Error);
        let state = board.get("demo-electric").await;
        assert!(!state.attempting);
        assert_eq!(
            state.last_job.map(|snapshot| snapshot.status),
            Some(JobStatus::Failed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_job_is_still_monitored_to_a_notification() {
        let backend = MemoryBackend::demo();
        let automation = ScriptedAutomation::new(vec![transport_500()]);
        let feed = NotificationFeed::new(10);
        let board = StatusBoard::new();
        let pipeline = pipeline(
            scripted_backends(&backend, automation.clone(), Arc::new(backend.clone())),
            &feed,
            &board,
        );

        let started = pipeline.run("demo-electric").await.expect("fallback job");
        assert_eq!(automation.calls(), 1);
        assert_eq!(started.job.origin, JobOrigin::Fallback);
        assert_eq!(backend.jobs_for("demo-electric").len(), 1);

        backend
            .advance_job(
                &started.job.job_id,
                JobStatus::Failed,
                Some("Login failed: invalid credentials".into()),
            )
            .expect("pending -> failed");
        let outcome = started.monitor.await.expect("monitor task");

        let MonitorOutcome::Failed(classification) = outcome else {
            panic!("expected failed outcome, got {outcome:?}");
        };
        assert_eq!(classification.category, FailureCategory::AuthenticationFailed);
        let notes = feed.recent();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].level, NotificationLevel::Error);
        assert_eq!(notes[0].job_id.as_deref(), Some(started.job.job_id.as_str()));
        assert_eq!(notes[0].category, Some(FailureCategory::AuthenticationFailed));
        assert_eq!(
            board.get("demo-electric").await.last_job.map(|s| s.status),
            Some(JobStatus::Failed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_pgcrypto_is_not_retried() {
        let backend = MemoryBackend::demo();
        let automation = ScriptedAutomation::new(vec![transport_500()]);
        let feed = NotificationFeed::new(10);
        let board = StatusBoard::new();
        let backends = Backends {
            providers: Arc::new(backend.clone()),
            secrets: Arc::new(MissingExtension),
            jobs: Arc::new(backend.clone()),
            automation: automation.clone(),
        };

        let failure = match pipeline(backends, &feed, &board).run("demo-electric").await {
            Ok(_) => panic!("expected failure"),
            Err(failure) => failure,
        };

        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.reason, GiveUpReason::Fatal);
        assert_eq!(failure.user_message(), PGCRYPTO_MESSAGE);
        assert!(matches!(
            failure.error,
            ScrapeError::Credentials(CredentialsError::DecryptionUnavailable(_))
        ));
        assert_eq!(automation.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_provider_fails_once() {
        let backend = MemoryBackend::demo();
        let automation = ScriptedAutomation::new(vec![transport_500()]);
        let feed = NotificationFeed::new(10);
        let board = StatusBoard::new();
        let pipeline = pipeline(
            scripted_backends(&backend, automation.clone(), Arc::new(backend.clone())),
            &feed,
            &board,
        );

        let failure = match pipeline.run("nope").await {
            Ok(_) => panic!("expected failure"),
            Err(failure) => failure,
        };
        assert_eq!(failure.attempts, 1);
        assert!(matches!(failure.error, ScrapeError::ProviderNotFound(_)));
        assert_eq!(automation.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_then_accepted() {
        let backend = MemoryBackend::demo();
        let automation = ScriptedAutomation::new(vec![
            Ok(SubmissionResponse {
                success: false,
                job_id: None,
                error: Some("Navigation timeout of 30000 ms exceeded".into()),
            }),
            Ok(SubmissionResponse {
                success: true,
                job_id: Some("remote-1".into()),
                error: None,
            }),
        ]);
        let feed = NotificationFeed::new(10);
        let board = StatusBoard::new();
        let pipeline = pipeline(
            scripted_backends(&backend, automation.clone(), Arc::new(backend.clone())),
            &feed,
            &board,
        );

        let started = pipeline.run("demo-electric").await.expect("second attempt");
        assert_eq!(started.job, JobReference::remote("remote-1"));
        assert_eq!(automation.calls(), 2);
        started.monitor.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_job_is_monitored_to_completion() {
        let backend = MemoryBackend::demo();
        let automation = SimulatedAutomation::new(backend.clone(), Duration::from_secs(2));
        let feed = NotificationFeed::new(10);
        let board = StatusBoard::new();
        let pipeline = pipeline(Backends::memory(backend.clone(), automation), &feed, &board);

        let started = pipeline.run("demo-water").await.expect("submitted");
        assert!(!board.get("demo-water").await.attempting);
        let outcome = started.monitor.await.expect("monitor task");

        assert_eq!(outcome, MonitorOutcome::Completed);
        let notes = feed.recent();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].level, NotificationLevel::Success);
        assert_eq!(
            board.get("demo-water").await.last_job.map(|s| s.status),
            Some(JobStatus::Completed)
        );
        assert_eq!(backend.jobs_for("demo-water").len(), 1);
    }
}
