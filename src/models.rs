use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use serde_with::skip_serializing_none;
use std::fmt;

/// Lifecycle of a scraping job record. Transitions only move forward:
/// `pending -> in_progress -> {completed, failed}`, skipping is allowed,
/// regressing is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::InProgress => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether a record currently in `self` may move to `next`.
    pub fn can_advance_to(self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// Whether observing `next` after `self` would be a regression.
    pub fn regresses_to(self, next: JobStatus) -> bool {
        next.rank() < self.rank() || (self.is_terminal() && next != self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row of the `scraping_jobs` table. Owned by the backing store; this service
/// only creates fallback rows and reads.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapingJob {
    pub id: String,
    pub utility_provider_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    pub provider: String,
    #[serde(rename = "type")]
    pub utility_type: String,
    pub location: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Insert payload for a job row created directly by this service.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewScrapingJob {
    pub utility_provider_id: String,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub provider: String,
    #[serde(rename = "type")]
    pub utility_type: String,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilityProvider {
    pub id: String,
    pub provider_name: String,
    pub utility_type: String,
    pub property_id: String,
    pub location: String,
    pub username: String,
}

/// Decrypted provider login. Lives only for the duration of one submission.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .finish()
    }
}

/// Flags forwarded to the automation function so older and newer
/// deployments of it accept the same payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilityFlags {
    pub headless: bool,
    pub capture_screenshots: bool,
    pub legacy_field_names: bool,
}

impl Default for CompatibilityFlags {
    fn default() -> Self {
        Self {
            headless: true,
            capture_screenshots: false,
            legacy_field_names: true,
        }
    }
}

/// Body of the job submission call.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeRequest {
    pub username: String,
    pub password: String,
    pub utility_id: String,
    pub provider_name: String,
    #[serde(rename = "type")]
    pub utility_type: String,
    pub location: String,
    #[serde(flatten)]
    pub flags: CompatibilityFlags,
}

impl ScrapeRequest {
    pub fn new(
        provider: &UtilityProvider,
        credentials: Credentials,
        flags: CompatibilityFlags,
    ) -> Self {
        Self {
            username: credentials.username,
            password: credentials.password,
            utility_id: provider.id.clone(),
            provider_name: provider.provider_name.clone(),
            utility_type: provider.utility_type.clone(),
            location: provider.location.clone(),
            flags,
        }
    }

    /// JSON body as sent, minus the password. Safe to log.
    pub fn sanitized(&self) -> Value {
        json!({
            "username": self.username,
            "utilityId": self.utility_id,
            "providerName": self.provider_name,
            "type": self.utility_type,
            "location": self.location,
            "flags": self.flags,
        })
    }
}

impl fmt::Debug for ScrapeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScrapeRequest({})", self.sanitized())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmissionResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, rename = "jobId", alias = "job_id")]
    pub job_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOrigin {
    Remote,
    Fallback,
}

/// Handle to a job the rest of the pipeline can observe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReference {
    pub job_id: String,
    pub origin: JobOrigin,
}

impl JobReference {
    pub fn remote(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            origin: JobOrigin::Remote,
        }
    }

    pub fn fallback(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            origin: JobOrigin::Fallback,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
