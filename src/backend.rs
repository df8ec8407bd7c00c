//! Event senders.
//!
//! A [`Backend`] takes events that are ready to leave the collector. Sending
//! is fire-and-forget: whatever goes wrong on the way out is the backend's
//! business, never the dispatcher's.
//!
//! Error details go to an endpoint of their own, see
//! [`ErrorDetailBackend`](crate::error_details::ErrorDetailBackend).
//!
//! Two backends are provided:
//! * [`LogBackend`] - writes every event as JSON to the log
//! * [`MemoryBackend`] - keeps every event in memory, in send order

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use url::Url;

use crate::{
    config::Config,
    error_details::ErrorDetail,
    events::{AdEventData, EventData},
};

/// Sender for events that passed the dispatcher.
///
/// Implementations must be safe to call from several threads at once.
pub trait Backend: Send + Sync {
    fn send(&self, event: EventData);
    fn send_ad(&self, event: AdEventData);
    fn send_error_detail(&self, detail: ErrorDetail);
}

/// Creates the backend of a dispatcher, once, at construction.
pub trait BackendFactory {
    fn create_backend(&self, config: &Config) -> Arc<dyn Backend>;
}

/// Any closure from configuration to backend is a factory.
impl<F> BackendFactory for F
where
    F: Fn(&Config) -> Arc<dyn Backend>,
{
    fn create_backend(&self, config: &Config) -> Arc<dyn Backend> {
        self(config)
    }
}

/// Backend that logs events as JSON at `info` level.
#[derive(Clone, Debug)]
pub struct LogBackend {
    url: Url,
    ad_url: Url,
    error_url: Url,
}

impl LogBackend {
    #[must_use]
    pub fn new(backend_url: &Url) -> Self {
        let url = backend_url.clone();

        let mut ad_url = backend_url.clone();
        if let Ok(mut segments) = ad_url.path_segments_mut() {
            segments.pop_if_empty().push("a");
        }

        let mut error_url = backend_url.clone();
        if let Ok(mut segments) = error_url.path_segments_mut() {
            segments.pop_if_empty().extend(["insights", "error"]);
        }

        Self {
            url,
            ad_url,
            error_url,
        }
    }

    /// Factory for use with the dispatcher.
    #[must_use]
    pub fn factory() -> impl BackendFactory {
        |config: &Config| -> Arc<dyn Backend> { Arc::new(Self::new(&config.backend_url)) }
    }

    fn post<T: Serialize>(url: &Url, event: &T) {
        match serde_json::to_string(event) {
            Ok(json) => info!("POST {url} {json}"),
            Err(e) => error!("could not serialize event for {url}: {e}"),
        }
    }
}

impl Backend for LogBackend {
    fn send(&self, event: EventData) {
        Self::post(&self.url, &event);
    }

    fn send_ad(&self, event: AdEventData) {
        Self::post(&self.ad_url, &event);
    }

    fn send_error_detail(&self, detail: ErrorDetail) {
        Self::post(&self.error_url, &detail);
    }
}

/// Backend that records every event, in the order it was sent.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    events: Mutex<Vec<EventData>>,
    ad_events: Mutex<Vec<AdEventData>>,
    error_details: Mutex<Vec<ErrorDetail>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Regular events sent so far.
    #[must_use]
    pub fn events(&self) -> Vec<EventData> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Ad events sent so far.
    #[must_use]
    pub fn ad_events(&self) -> Vec<AdEventData> {
        self.ad_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Error details sent so far.
    #[must_use]
    pub fn error_details(&self) -> Vec<ErrorDetail> {
        self.error_details
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Sequence numbers of the regular events sent so far.
    #[must_use]
    pub fn sequence_numbers(&self) -> Vec<u64> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|event| event.sequence_number)
            .collect()
    }
}

impl Backend for MemoryBackend {
    fn send(&self, event: EventData) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    fn send_ad(&self, event: AdEventData) {
        self.ad_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    fn send_error_detail(&self, detail: ErrorDetail) {
        self.error_details
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(detail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ad_events_go_to_ad_endpoint() {
        let backend = LogBackend::new(&Url::parse("https://collector.example/analytics/").unwrap());
        assert_eq!(backend.url.as_str(), "https://collector.example/analytics/");
        assert_eq!(backend.ad_url.as_str(), "https://collector.example/analytics/a");
        assert_eq!(
            backend.error_url.as_str(),
            "https://collector.example/analytics/insights/error"
        );
    }

    #[test]
    fn factory_uses_configured_url() {
        let mut config = Config::with_license_key("license").unwrap();
        config.backend_url = Url::parse("http://localhost:9000/collect").unwrap();

        // Sending must not panic, whatever the logger does with the output.
        let backend = LogBackend::factory().create_backend(&config);
        backend.send_ad(AdEventData::new(uuid::Uuid::nil()));
    }

    #[test]
    fn memory_backend_keeps_send_order() {
        let backend = MemoryBackend::new();
        for seq in [4, 2, 9] {
            let mut event =
                EventData::new(uuid::Uuid::nil(), crate::events::PlayerState::Playing);
            event.sequence_number = seq;
            backend.send(event);
        }

        assert_eq!(backend.sequence_numbers(), vec![4, 2, 9]);
        assert!(backend.ad_events().is_empty());
    }
}
