use crate::classify::{Classification, Classified, FailureCategory, classify};
use crate::models::Credentials;
use crate::ports::{BackendError, SecretStore};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("no credentials stored for provider {provider_id}")]
    CredentialsNotFound { provider_id: String },
    #[error("credential decryption unavailable: {0}")]
    DecryptionUnavailable(String),
    #[error("credential lookup failed: {0}")]
    Backend(#[from] BackendError),
}

impl Classified for CredentialsError {
    fn classification(&self) -> Classification {
        match self {
            CredentialsError::CredentialsNotFound { .. } => Classification {
                category: FailureCategory::AuthenticationFailed,
                message: "No login details are stored for this provider. Please add them and try again.",
            },
            CredentialsError::DecryptionUnavailable(detail) => {
                let classified = classify(detail);
                if classified.category == FailureCategory::ConfigurationError {
                    classified
                } else {
                    Classification::of(FailureCategory::ConfigurationError)
                }
            }
            CredentialsError::Backend(err) => classify(&err.to_string()),
        }
    }
}

/// Fetches decrypted provider credentials. Nothing is cached: every call
/// goes to the secret store and the caller owns the only copy.
#[derive(Clone)]
pub struct CredentialsGateway {
    secrets: Arc<dyn SecretStore>,
}

impl CredentialsGateway {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self { secrets }
    }

    pub async fn get_credentials(
        &self,
        provider_id: &str,
        property_id: &str,
    ) -> Result<Credentials, CredentialsError> {
        match self.secrets.decrypt_credentials(provider_id, property_id).await {
            Ok(Some(credentials))
                if !credentials.username.trim().is_empty() && !credentials.password.is_empty() =>
            {
                debug!(target: "scrape.credentials", provider_id, "credentials decrypted");
                Ok(credentials)
            }
            Ok(_) => Err(CredentialsError::CredentialsNotFound {
                provider_id: provider_id.to_string(),
            }),
            Err(err) if decryption_unavailable(&err) => {
                warn!(target: "scrape.credentials", provider_id, error = %err, "decryption_unavailable");
                Err(CredentialsError::DecryptionUnavailable(err.to_string()))
            }
            Err(err) => Err(CredentialsError::Backend(err)),
        }
    }
}

fn decryption_unavailable(err: &BackendError) -> bool {
    let text = err.to_string().to_lowercase();
    text.contains("pgcrypto")
        || text.contains("pgp_sym_decrypt")
        || (text.contains("decrypt") && text.contains("does not exist"))
        || text.contains("encryption key is not configured")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    enum Reply {
        Found(&'static str, &'static str),
        Missing,
        Fail(&'static str),
    }

    struct FixedSecrets(Reply);

    #[async_trait]
    impl SecretStore for FixedSecrets {
        async fn decrypt_credentials(
            &self,
            _provider_id: &str,
            _property_id: &str,
        ) -> Result<Option<Credentials>, BackendError> {
            match &self.0 {
                Reply::Found(user, pass) => Ok(Some(Credentials {
                    username: user.to_string(),
                    password: pass.to_string(),
                })),
                Reply::Missing => Ok(None),
                Reply::Fail(text) => Err(BackendError::Request(text.to_string())),
            }
        }
    }

    fn gateway(reply: Reply) -> CredentialsGateway {
        CredentialsGateway::new(Arc::new(FixedSecrets(reply)))
    }

    #[tokio::test]
    async fn returns_decrypted_credentials() {
        let creds = gateway(Reply::Found("owner", "s3cret"))
            .get_credentials("prov-1", "prop-1")
            .await
            .expect("credentials");
        assert_eq!(creds.username, "owner");
        assert_eq!(creds.password, "s3cret");
    }

    #[tokio::test]
    async fn missing_or_blank_credentials_are_not_found() {
        for reply in [Reply::Missing, Reply::Found("owner", "")] {
            let err = gateway(reply)
                .get_credentials("prov-1", "prop-1")
                .await
                .expect_err("should fail");
            assert!(matches!(err, CredentialsError::CredentialsNotFound { .. }));
            assert!(err.classification().category.is_fatal());
        }
    }

    #[tokio::test]
    async fn pgcrypto_failure_is_decryption_unavailable() {
        let err = gateway(Reply::Fail(
            "HTTP 404: function pgp_sym_decrypt(bytea, text) does not exist (pgcrypto)",
        ))
        .get_credentials("prov-1", "prop-1")
        .await
        .expect_err("should fail");
        assert!(matches!(err, CredentialsError::DecryptionUnavailable(_)));
        let classified = err.classification();
        assert_eq!(classified.category, FailureCategory::ConfigurationError);
        assert!(classified.message.contains("pgcrypto"));
    }

    #[tokio::test]
    async fn transport_failures_pass_through() {
        let err = gateway(Reply::Fail("HTTP 503 Service Unavailable"))
            .get_credentials("prov-1", "prop-1")
            .await
            .expect_err("should fail");
        assert!(matches!(err, CredentialsError::Backend(_)));
        assert_eq!(
            err.classification().category,
            FailureCategory::TransportFailure
        );
    }
}
