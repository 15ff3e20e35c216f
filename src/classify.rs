use once_cell::sync::Lazy;
use serde::Serialize;
use std::fmt;

/// User-facing buckets for scrape failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    ConfigurationError,
    CaptchaRequired,
    AuthenticationFailed,
    RateLimited,
    Timeout,
    TransportFailure,
    UnsupportedProvider,
    Unknown,
}

impl FailureCategory {
    /// Failures attributed to the automation service or network being down.
    pub fn is_infrastructure(self) -> bool {
        matches!(
            self,
            FailureCategory::TransportFailure | FailureCategory::ConfigurationError
        )
    }

    /// Failures no amount of retrying within a session can fix.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            FailureCategory::ConfigurationError
                | FailureCategory::CaptchaRequired
                | FailureCategory::AuthenticationFailed
                | FailureCategory::UnsupportedProvider
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            FailureCategory::ConfigurationError => "configuration_error",
            FailureCategory::CaptchaRequired => "captcha_required",
            FailureCategory::AuthenticationFailed => "authentication_failed",
            FailureCategory::RateLimited => "rate_limited",
            FailureCategory::Timeout => "timeout",
            FailureCategory::TransportFailure => "transport_failure",
            FailureCategory::UnsupportedProvider => "unsupported_provider",
            FailureCategory::Unknown => "unknown",
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            FailureCategory::ConfigurationError => {
                "The bill scraping service is not configured correctly. Please contact an administrator."
            }
            FailureCategory::CaptchaRequired => {
                "This provider requires a CAPTCHA that cannot be automated. Please sign in on the provider's website and download your bills manually."
            }
            FailureCategory::AuthenticationFailed => {
                "The provider rejected the stored username or password. Please update the login details for this provider."
            }
            FailureCategory::RateLimited => {
                "The bill scraping service is busy right now. Please try again later."
            }
            FailureCategory::Timeout => {
                "The provider's website took too long to respond. Please try again."
            }
            FailureCategory::TransportFailure => {
                "The utility provider service is currently unavailable. Please try again later."
            }
            FailureCategory::UnsupportedProvider => {
                "This utility provider is not supported for automatic bill retrieval yet."
            }
            FailureCategory::Unknown => {
                "Something went wrong while fetching bills. Please try again."
            }
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Category plus the message shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub category: FailureCategory,
    pub message: &'static str,
}

impl Classification {
    pub fn of(category: FailureCategory) -> Self {
        Self {
            category,
            message: category.default_message(),
        }
    }
}

/// Implemented by every error the retry loop and notifications see.
pub trait Classified {
    fn classification(&self) -> Classification;
}

pub const PGCRYPTO_MESSAGE: &str = "The database is missing the pgcrypto extension required to decrypt provider credentials. Please contact an administrator.";

/// One entry of the prioritized rule table.
#[derive(Clone, Copy)]
pub struct Rule {
    pub category: FailureCategory,
    pub message: Option<&'static str>,
    pub matches: fn(&str) -> bool,
}

impl Rule {
    fn classification(&self) -> Classification {
        Classification {
            category: self.category,
            message: self.message.unwrap_or(self.category.default_message()),
        }
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Ordered rules over lowercased error text. First match wins.
pub struct Classifier {
    rules: Vec<Rule>,
}

impl Classifier {
    pub fn standard() -> Self {
        Self {
            rules: vec![
                Rule {
                    category: FailureCategory::ConfigurationError,
                    message: Some(PGCRYPTO_MESSAGE),
                    matches: |text| contains_any(text, &["pgcrypto", "pgp_sym_decrypt"]),
                },
                Rule {
                    category: FailureCategory::ConfigurationError,
                    message: None,
                    matches: |text| {
                        contains_any(
                            text,
                            &[
                                "api key not configured",
                                "missing api key",
                                "api_key is not set",
                                "browserbase_api_key",
                                "automation api key",
                                "missing automation credentials",
                            ],
                        )
                    },
                },
                Rule {
                    category: FailureCategory::CaptchaRequired,
                    message: None,
                    matches: |text| {
                        contains_any(
                            text,
                            &["captcha", "verify you are human", "interactive verification"],
                        )
                    },
                },
                Rule {
                    category: FailureCategory::AuthenticationFailed,
                    message: None,
                    matches: |text| {
                        contains_any(
                            text,
                            &[
                                "invalid credentials",
                                "invalid username",
                                "invalid password",
                                "incorrect username",
                                "incorrect password",
                                "wrong password",
                                "login failed",
                                "authentication failed",
                            ],
                        )
                    },
                },
                Rule {
                    category: FailureCategory::RateLimited,
                    message: None,
                    matches: |text| {
                        contains_any(
                            text,
                            &["rate limit", "too many requests", "quota", "status code 429", "http 429"],
                        )
                    },
                },
                Rule {
                    category: FailureCategory::Timeout,
                    message: None,
                    matches: |text| {
                        contains_any(text, &["timeout", "timed out", "deadline exceeded"])
                    },
                },
                Rule {
                    category: FailureCategory::TransportFailure,
                    message: None,
                    matches: |text| {
                        contains_any(
                            text,
                            &[
                                "non-2xx",
                                "status code 5",
                                "http 5",
                                "internal server error",
                                "bad gateway",
                                "service unavailable",
                                "temporarily unavailable",
                                "failed to send a request",
                                "error sending request",
                                "failed to fetch",
                                "connection refused",
                                "connection reset",
                                "network error",
                            ],
                        )
                    },
                },
                Rule {
                    category: FailureCategory::UnsupportedProvider,
                    message: None,
                    matches: |text| {
                        contains_any(
                            text,
                            &[
                                "unsupported provider",
                                "provider not supported",
                                "not yet supported",
                                "no scraper available",
                            ],
                        )
                    },
                },
            ],
        }
    }

    pub fn classify(&self, raw: &str) -> Classification {
        let text = raw.to_lowercase();
        self.rules
            .iter()
            .find(|rule| (rule.matches)(&text))
            .map(Rule::classification)
            .unwrap_or_else(|| Classification::of(FailureCategory::Unknown))
    }
}

static STANDARD: Lazy<Classifier> = Lazy::new(Classifier::standard);

/// Classify raw failure text with the standard rule table.
pub fn classify(raw: &str) -> Classification {
    STANDARD.classify(raw)
}
