use crate::classify::{Classification, FailureCategory};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_with::skip_serializing_none;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Success,
    Error,
}

/// Toast-style message surfaced to whoever triggered the scrape.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: Uuid,
    pub provider_id: String,
    pub job_id: Option<String>,
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
    pub category: Option<FailureCategory>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn success(provider_id: &str, job_id: &str, provider_label: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider_id: provider_id.to_string(),
            job_id: Some(job_id.to_string()),
            level: NotificationLevel::Success,
            title: "Bills retrieved".to_string(),
            message: format!("Utility bills from {provider_label} were fetched successfully."),
            category: None,
            created_at: Utc::now(),
        }
    }

    pub fn failure(
        provider_id: &str,
        job_id: Option<&str>,
        classification: Classification,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider_id: provider_id.to_string(),
            job_id: job_id.map(str::to_string),
            level: NotificationLevel::Error,
            title: "Bill scraping failed".to_string(),
            message: classification.message.to_string(),
            category: Some(classification.category),
            created_at: Utc::now(),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Bounded in-process history of notifications, newest last.
#[derive(Clone)]
pub struct NotificationFeed {
    history: Arc<Mutex<VecDeque<Notification>>>,
    capacity: usize,
}

impl NotificationFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn recent(&self) -> Vec<Notification> {
        let guard = self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.iter().cloned().collect()
    }

    pub fn for_provider(&self, provider_id: &str) -> Vec<Notification> {
        self.recent()
            .into_iter()
            .filter(|notification| notification.provider_id == provider_id)
            .collect()
    }
}

impl Notifier for NotificationFeed {
    fn notify(&self, notification: Notification) {
        match notification.level {
            NotificationLevel::Success => info!(
                target: "scrape.notify",
                provider_id = %notification.provider_id,
                job_id = ?notification.job_id,
                "{}",
                notification.message
            ),
            NotificationLevel::Error => error!(
                target: "scrape.notify",
                provider_id = %notification.provider_id,
                job_id = ?notification.job_id,
                category = ?notification.category,
                "{}",
                notification.message
            ),
        }
        let mut guard = self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.len() == self.capacity {
            guard.pop_front();
        }
        guard.push_back(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_keeps_newest_within_capacity() {
        let feed = NotificationFeed::new(2);
        feed.notify(Notification::success("a", "job-1", "City Light"));
        feed.notify(Notification::success("b", "job-2", "City Water"));
        feed.notify(Notification::failure(
            "a",
            None,
            Classification::of(FailureCategory::Timeout),
        ));

        let recent = feed.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].provider_id, "b");
        assert_eq!(recent[1].level, NotificationLevel::Error);
        assert_eq!(feed.for_provider("a").len(), 1);
    }

    #[test]
    fn failure_carries_classified_message() {
        let n = Notification::failure(
            "a",
            Some("job-9"),
            Classification::of(FailureCategory::CaptchaRequired),
        );
        assert_eq!(n.category, Some(FailureCategory::CaptchaRequired));
        assert!(n.message.contains("CAPTCHA"));
        assert_eq!(n.job_id.as_deref(), Some("job-9"));
    }
}
