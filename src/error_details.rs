//! Detailed error reports.
//!
//! Besides the error code on a regular sample, a playback error can be
//! reported as an [`ErrorDetail`]: the message, diagnostic data and the
//! HTTP requests that led up to it. Error details are a licensed feature,
//! configured through the `errorDetails` entry of the feature settings:
//!
//! ```toml
//! [feature_config.errorDetails]
//! enabled = true
//! numberOfHttpRequests = 10
//! ```
//!
//! Until the feature is known to be enabled, [`ErrorDetailBackend`] queues
//! every detail. Enabling the feature flushes the queue, disabling it
//! discards the queue.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none, DurationMilliSeconds, TimestampMilliSeconds};
use uuid::Uuid;

use crate::{
    backend::Backend,
    events::{truncate, ErrorCode, ErrorData},
    license::{FeatureConfigContainer, LicenseCallback},
    queue::PendingQueue,
};

/// One HTTP request made on behalf of the player.
#[serde_as]
#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    pub timestamp: SystemTime,

    pub url: Option<String>,
    pub last_redirect_location: Option<String>,
    pub status_code: Option<u16>,

    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub download_time: Option<Duration>,

    pub size: Option<u64>,

    #[serde(default)]
    pub success: bool,
}

impl HttpRequest {
    #[must_use]
    pub fn new(url: impl Into<String>, status_code: u16) -> Self {
        Self {
            timestamp: SystemTime::now(),
            url: Some(url.into()),
            last_redirect_location: None,
            status_code: Some(status_code),
            download_time: None,
            size: None,
            success: (200..400).contains(&status_code),
        }
    }

    fn truncated(&self, max_url_length: usize) -> Self {
        Self {
            url: self.url.as_deref().map(|url| truncate(url, max_url_length)),
            last_redirect_location: self
                .last_redirect_location
                .as_deref()
                .map(|url| truncate(url, max_url_length)),
            ..self.clone()
        }
    }
}

/// Detailed report of one playback error.
#[serde_as]
#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    pub timestamp: SystemTime,

    pub impression_id: Uuid,
    pub code: Option<i32>,
    pub message: Option<String>,

    #[serde(default)]
    pub data: ErrorData,

    pub http_requests: Option<Vec<HttpRequest>>,
}

impl ErrorDetail {
    #[must_use]
    pub fn new(impression_id: Uuid, error: &ErrorCode) -> Self {
        Self {
            timestamp: SystemTime::now(),
            impression_id,
            code: Some(error.code),
            message: Some(error.message.clone()),
            data: error.data.clone().unwrap_or_default(),
            http_requests: None,
        }
    }

    #[must_use]
    pub fn with_http_requests(mut self, requests: Vec<HttpRequest>) -> Self {
        self.http_requests = Some(requests);
        self
    }

    /// Returns a copy with free-form strings cut to `max_string_length`
    /// characters and request URLs cut to `max_url_length` characters.
    #[must_use]
    pub fn truncated(&self, max_string_length: usize, max_url_length: usize) -> Self {
        Self {
            timestamp: self.timestamp,
            impression_id: self.impression_id,
            code: self.code,
            message: self
                .message
                .as_deref()
                .map(|message| truncate(message, max_string_length)),
            data: self.data.truncated(),
            http_requests: self.http_requests.as_ref().map(|requests| {
                requests
                    .iter()
                    .map(|request| request.truncated(max_url_length))
                    .collect()
            }),
        }
    }

    /// Keeps only the first `max` HTTP requests.
    pub fn limit_http_requests(&mut self, max: usize) {
        if let Some(requests) = &mut self.http_requests {
            requests.truncate(max);
        }
    }
}

/// Settings of the `errorDetails` feature.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetailsSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Most HTTP requests reported per error; unlimited when absent.
    pub number_of_http_requests: Option<usize>,
}

impl ErrorDetailsSettings {
    /// Name of the feature in the feature settings.
    pub const FEATURE: &'static str = "errorDetails";

    /// Reads the settings from the feature settings, if present and well
    /// formed.
    #[must_use]
    pub fn from_features(feature_config: &FeatureConfigContainer) -> Option<Self> {
        let settings = feature_config.get(Self::FEATURE)?;
        match Self::deserialize(settings) {
            Ok(settings) => Some(settings),
            Err(e) => {
                warn!("ignoring malformed {} settings: {e}", Self::FEATURE);
                None
            }
        }
    }
}

/// Sender of error details, gated by the `errorDetails` feature.
pub struct ErrorDetailBackend {
    backend: Arc<dyn Backend>,
    queue: PendingQueue<ErrorDetail>,

    /// Only written while the queue is locked.
    enabled: AtomicBool,
    max_http_requests: AtomicUsize,
}

impl ErrorDetailBackend {
    /// Longest URL that is put on the wire.
    pub const MAX_URL_LENGTH: usize = 200;

    /// Longest free-form string that is put on the wire.
    pub const MAX_STRING_LENGTH: usize = ErrorData::MAX_STRING_LENGTH;

    /// Creates a disabled backend with an empty queue.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            queue: PendingQueue::new(),
            enabled: AtomicBool::new(false),
            max_http_requests: AtomicUsize::new(usize::MAX),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enables or disables sending.
    ///
    /// Enabling sends whatever was queued before anything sent later.
    pub fn set_enabled(&self, enabled: bool) {
        let mut queue = self.queue.lock();
        self.enabled.store(enabled, Ordering::Release);
        if enabled {
            let sent = queue.drain(|detail| self.backend.send_error_detail(detail));
            if sent > 0 {
                debug!("flushed {sent} error details");
            }
        }
    }

    /// Truncates `detail` and sends it, or queues it while disabled.
    pub fn send(&self, detail: ErrorDetail) {
        let mut detail = detail.truncated(Self::MAX_STRING_LENGTH, Self::MAX_URL_LENGTH);
        detail.limit_http_requests(self.max_http_requests.load(Ordering::Acquire));

        let mut queue = self.queue.lock();
        if self.is_enabled() {
            drop(queue);
            self.backend.send_error_detail(detail);
        } else {
            trace!("queueing error detail");
            queue.push(detail);
        }
    }

    /// Sends everything queued, if enabled, and returns how many were sent.
    pub fn flush(&self) -> usize {
        let mut queue = self.queue.lock();
        if !self.is_enabled() {
            return 0;
        }
        queue.drain(|detail| self.backend.send_error_detail(detail))
    }

    /// Discards everything queued.
    pub fn clear(&self) {
        self.queue.clear();
    }

    /// Caps the HTTP requests of queued and future details at `max`.
    pub fn limit_http_requests_in_queue(&self, max: usize) {
        let mut queue = self.queue.lock();
        self.max_http_requests.store(max, Ordering::Release);
        for detail in queue.iter_mut() {
            detail.limit_http_requests(max);
        }
    }

    /// Number of queued details.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Copies of the queued details, oldest first.
    #[must_use]
    pub fn buffered(&self) -> Vec<ErrorDetail> {
        self.queue.snapshot()
    }
}

/// Follows the `errorDetails` feature of each licensing result.
///
/// A failed authentication or a missing or disabled feature disables the
/// backend and discards its queue.
impl LicenseCallback for ErrorDetailBackend {
    fn configure_features(&self, success: bool, feature_config: &FeatureConfigContainer) {
        let settings = if success {
            ErrorDetailsSettings::from_features(feature_config)
        } else {
            None
        };

        match settings {
            Some(settings) if settings.enabled => {
                if let Some(max) = settings.number_of_http_requests {
                    self.limit_http_requests_in_queue(max);
                }
                self.set_enabled(true);
            }
            _ => {
                debug!("error details disabled");
                self.set_enabled(false);
                self.clear();
            }
        }
    }

    fn authentication_completed(&self, _success: bool) {}
}

impl fmt::Debug for ErrorDetailBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorDetailBackend")
            .field("enabled", &self.is_enabled())
            .field("queue", &self.queue)
            .field(
                "max_http_requests",
                &self.max_http_requests.load(Ordering::Acquire),
            )
            .finish_non_exhaustive()
    }
}
