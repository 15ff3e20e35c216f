use crate::config::RemoteNames;
use crate::http::build_client;
use crate::models::{
    Credentials, NewScrapingJob, ScrapeRequest, ScrapingJob, SubmissionResponse, UtilityProvider,
};
use crate::ports::{AutomationService, BackendError, JobStore, ProviderDirectory, SecretStore};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};
use urlencoding::encode;

/// PostgREST, RPC and Edge Function access to the hosted backend.
#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    names: RemoteNames,
    http: Client,
}

impl SupabaseClient {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self::new(base_url, service_key, RemoteNames::from_env()))
    }

    pub fn new(base_url: String, service_key: String, names: RemoteNames) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            names,
            http: build_client(),
        }
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    fn table_url(&self, table: &str, query: &str) -> String {
        format!("{}/rest/v1/{}?{}", self.base_url, encode(table), query)
    }

    async fn select_one<T: DeserializeOwned>(&self, url: String) -> Result<Option<T>, BackendError> {
        let response = self
            .authorized(self.http.get(url))
            .send()
            .await
            .map_err(request_error)?;
        let response = ensure_success(response).await?;
        let mut rows: Vec<T> = response
            .json()
            .await
            .map_err(|err| BackendError::Deserialize(err.to_string()))?;
        Ok(rows.pop())
    }
}

/// Transport errors; a timeout keeps its cause in the text so it classifies as one.
fn request_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Request(format!("request timed out: {err}"))
    } else {
        BackendError::Request(err.to_string())
    }
}

/// Non-2xx responses keep their body so the failure text can be classified.
async fn ensure_success(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Request(format!("HTTP {}: {}", status, body.trim())))
}

fn function_error(status: u16, body: &str) -> String {
    format!(
        "Edge Function returned a non-2xx status code (HTTP {}): {}",
        status,
        body.trim()
    )
}

/// The RPC answers with a row, a one-row array, or null.
fn parse_credentials(payload: Value) -> Result<Option<Credentials>, BackendError> {
    let row = match payload {
        Value::Null => return Ok(None),
        Value::Array(mut rows) => {
            if rows.is_empty() {
                return Ok(None);
            }
            rows.swap_remove(0)
        }
        other => other,
    };
    if row.is_null() {
        return Ok(None);
    }
    serde_json::from_value(row)
        .map(Some)
        .map_err(|err| BackendError::Deserialize(err.to_string()))
}

#[async_trait]
impl ProviderDirectory for SupabaseClient {
    async fn fetch_provider(
        &self,
        provider_id: &str,
    ) -> Result<Option<UtilityProvider>, BackendError> {
        let url = self.table_url(
            &self.names.providers_table,
            &format!("id=eq.{}&select=*&limit=1", encode(provider_id)),
        );
        self.select_one(url).await
    }
}

#[async_trait]
impl JobStore for SupabaseClient {
    async fn fetch_job(&self, job_id: &str) -> Result<Option<ScrapingJob>, BackendError> {
        let url = self.table_url(
            &self.names.jobs_table,
            &format!("id=eq.{}&select=*&limit=1", encode(job_id)),
        );
        self.select_one(url).await
    }

    async fn create_job(&self, job: NewScrapingJob) -> Result<ScrapingJob, BackendError> {
        let url = format!("{}/rest/v1/{}", self.base_url, encode(&self.names.jobs_table));
        let response = self
            .authorized(self.http.post(url))
            .header("Prefer", "return=representation")
            .json(&job)
            .send()
            .await
            .map_err(request_error)?;
        let response = ensure_success(response).await?;
        let mut rows: Vec<ScrapingJob> = response
            .json()
            .await
            .map_err(|err| BackendError::Deserialize(err.to_string()))?;
        rows.pop()
            .ok_or_else(|| BackendError::Deserialize("insert returned no rows".into()))
    }

    async fn latest_job_for_provider(
        &self,
        provider_id: &str,
    ) -> Result<Option<ScrapingJob>, BackendError> {
        let url = self.table_url(
            &self.names.jobs_table,
            &format!(
                "utility_provider_id=eq.{}&select=*&order=created_at.desc&limit=1",
                encode(provider_id)
            ),
        );
        self.select_one(url).await
    }
}

#[async_trait]
impl SecretStore for SupabaseClient {
    async fn decrypt_credentials(
        &self,
        provider_id: &str,
        property_id: &str,
    ) -> Result<Option<Credentials>, BackendError> {
        let url = format!(
            "{}/rest/v1/rpc/{}",
            self.base_url,
            encode(&self.names.credentials_rpc)
        );
        let response = self
            .authorized(self.http.post(url))
            .json(&json!({
                "p_property_id": property_id,
                "p_provider_id": provider_id,
            }))
            .send()
            .await
            .map_err(request_error)?;
        let response = ensure_success(response).await?;
        let payload: Value = response
            .json()
            .await
            .map_err(|err| BackendError::Deserialize(err.to_string()))?;
        parse_credentials(payload)
    }
}

#[async_trait]
impl AutomationService for SupabaseClient {
    async fn submit(&self, request: &ScrapeRequest) -> Result<SubmissionResponse, BackendError> {
        let url = format!(
            "{}/functions/v1/{}",
            self.base_url,
            encode(&self.names.scrape_function)
        );
        debug!(target: "scrape.supabase", function = %self.names.scrape_function, request = %request.sanitized(), "invoking automation function");
        let response = self
            .authorized(self.http.post(url))
            .json(request)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(target: "scrape.supabase", status = status.as_u16(), "automation function failed");
            return Err(BackendError::Request(function_error(status.as_u16(), &body)));
        }

        response
            .json()
            .await
            .map_err(|err| BackendError::Deserialize(err.to_string()))
    }
}
