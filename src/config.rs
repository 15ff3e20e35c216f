use crate::models::CompatibilityFlags;
use crate::retry::RetryPolicy;
use std::env;
use tokio::time::Duration;
use tracing::warn;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;
const DEFAULT_JOB_CHECK_INTERVAL_MS: u64 = 5_000;
const DEFAULT_JOB_CHECK_MAX_TIME_MS: u64 = 300_000;
const DEFAULT_SIMULATED_STEP_MS: u64 = 3_000;

/// Tunables of the scrape pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeSettings {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub job_check_interval: Duration,
    pub job_check_max_time: Duration,
    pub flags: CompatibilityFlags,
    /// Delay between status steps of the simulated automation (demo mode).
    pub simulated_step: Duration,
}

impl Default for ScrapeSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            job_check_interval: Duration::from_millis(DEFAULT_JOB_CHECK_INTERVAL_MS),
            job_check_max_time: Duration::from_millis(DEFAULT_JOB_CHECK_MAX_TIME_MS),
            flags: CompatibilityFlags::default(),
            simulated_step: Duration::from_millis(DEFAULT_SIMULATED_STEP_MS),
        }
    }
}

impl ScrapeSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let max_retries = parse_number(&lookup, "SCRAPE_MAX_RETRIES")
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(DEFAULT_MAX_RETRIES);
        let retry_delay = parse_number(&lookup, "SCRAPE_RETRY_DELAY_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_delay);
        let job_check_interval = parse_number(&lookup, "SCRAPE_JOB_CHECK_INTERVAL_MS")
            .filter(|value| *value > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.job_check_interval);
        let mut job_check_max_time = parse_number(&lookup, "SCRAPE_JOB_CHECK_MAX_TIME_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.job_check_max_time);
        if job_check_max_time < job_check_interval {
            warn!(
                target: "scrape.config",
                interval_ms = job_check_interval.as_millis() as u64,
                max_time_ms = job_check_max_time.as_millis() as u64,
                "job check window shorter than poll interval, using default"
            );
            // a long interval can outgrow the default window too
            job_check_max_time = defaults.job_check_max_time.max(job_check_interval);
        }
        let simulated_step = parse_number(&lookup, "SIMULATED_STEP_MS")
            .filter(|value| *value > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.simulated_step);

        let flags = CompatibilityFlags {
            headless: parse_bool(&lookup, "SCRAPE_HEADLESS").unwrap_or(defaults.flags.headless),
            capture_screenshots: parse_bool(&lookup, "SCRAPE_CAPTURE_SCREENSHOTS")
                .unwrap_or(defaults.flags.capture_screenshots),
            legacy_field_names: parse_bool(&lookup, "SCRAPE_LEGACY_FIELD_NAMES")
                .unwrap_or(defaults.flags.legacy_field_names),
        };

        Self {
            max_retries,
            retry_delay,
            job_check_interval,
            job_check_max_time,
            flags,
            simulated_step,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
        }
    }
}

/// Names of the remote objects the hosted backend exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteNames {
    pub scrape_function: String,
    pub credentials_rpc: String,
    pub jobs_table: String,
    pub providers_table: String,
}

impl Default for RemoteNames {
    fn default() -> Self {
        Self {
            scrape_function: "scrape-utility-bills".to_string(),
            credentials_rpc: "get_decrypted_credentials".to_string(),
            jobs_table: "scraping_jobs".to_string(),
            providers_table: "utility_credentials".to_string(),
        }
    }
}

impl RemoteNames {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let name = |key: &str, fallback: String| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or(fallback)
        };
        Self {
            scrape_function: name("SCRAPE_FUNCTION_NAME", defaults.scrape_function),
            credentials_rpc: name("CREDENTIALS_RPC_NAME", defaults.credentials_rpc),
            jobs_table: name("SCRAPING_JOBS_TABLE", defaults.jobs_table),
            providers_table: name("UTILITY_PROVIDERS_TABLE", defaults.providers_table),
        }
    }
}

pub fn notification_history_from_env() -> usize {
    env::var("NOTIFICATION_HISTORY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(100)
}

fn parse_number(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(target: "scrape.config", key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::{EnvFilter, fmt};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn logs_with_filter(directive: &str, run: impl FnOnce()) -> String {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = fmt()
            .with_env_filter(EnvFilter::new(directive))
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, run);
        let bytes = captured.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let settings = ScrapeSettings::from_lookup(|_| None);
        assert_eq!(settings, ScrapeSettings::default());
        assert_eq!(settings.retry_policy(), RetryPolicy::default());
        assert_eq!(settings.job_check_interval, Duration::from_secs(5));
        assert_eq!(settings.job_check_max_time, Duration::from_secs(300));
    }

    #[test]
    fn overrides_and_fallbacks() {
        let settings = ScrapeSettings::from_lookup(lookup(&[
            ("SCRAPE_MAX_RETRIES", "5"),
            ("SCRAPE_RETRY_DELAY_MS", "abc"),
            ("SCRAPE_JOB_CHECK_INTERVAL_MS", "0"),
            ("SCRAPE_CAPTURE_SCREENSHOTS", "yes"),
        ]));
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.retry_delay, Duration::from_millis(2_000));
        assert_eq!(settings.job_check_interval, Duration::from_millis(5_000));
        assert!(settings.flags.capture_screenshots);
        assert!(settings.flags.headless);
    }

    #[test]
    fn max_time_below_interval_falls_back_to_default() {
        let settings = ScrapeSettings::from_lookup(lookup(&[
            ("SCRAPE_JOB_CHECK_INTERVAL_MS", "10000"),
            ("SCRAPE_JOB_CHECK_MAX_TIME_MS", "1000"),
        ]));
        assert_eq!(settings.job_check_max_time, Duration::from_secs(300));
    }

    #[test]
    fn max_time_never_below_interval() {
        let settings = ScrapeSettings::from_lookup(lookup(&[
            ("SCRAPE_JOB_CHECK_INTERVAL_MS", "600000"),
            ("SCRAPE_JOB_CHECK_MAX_TIME_MS", "1000"),
        ]));
        assert_eq!(settings.job_check_max_time, Duration::from_secs(600));
    }

    #[test]
    fn warnings_are_filterable_by_component_target() {
        let unparsable = || {
            ScrapeSettings::from_lookup(lookup(&[("SCRAPE_MAX_RETRIES", "many")]));
        };
        let shown = logs_with_filter("scrape.config=warn", unparsable);
        assert!(shown.contains("scrape.config"));
        assert!(shown.contains("ignoring unparsable setting"));

        let hidden = logs_with_filter("scrape.queue=warn", unparsable);
        assert!(hidden.is_empty());
    }

    #[test]
    fn remote_names_ignore_blank_values() {
        let names = RemoteNames::from_lookup(lookup(&[
            ("SCRAPE_FUNCTION_NAME", "  "),
            ("SCRAPING_JOBS_TABLE", "jobs_v2"),
        ]));
        assert_eq!(names.scrape_function, "scrape-utility-bills");
        assert_eq!(names.jobs_table, "jobs_v2");
        assert_eq!(names.providers_table, "utility_credentials");
    }
}
