//! Analytics event records.
//!
//! Two kinds of records travel to the backend:
//! * [`EventData`] - one sample of regular playback, numbered per source
//! * [`AdEventData`] - one ad playback record, not numbered
//!
//! Both serialize to the JSON shape the collector endpoint expects, with
//! durations as integer milliseconds and camel-cased field names.
//!
//! # Example
//!
//! ```rust
//! use fcanalytics::events::{EventData, PlayerState};
//! use std::time::Duration;
//!
//! let mut sample = EventData::new(impression_id, PlayerState::Playing);
//! sample.duration = Some(Duration::from_secs(10));
//! ```

use std::{
    fmt,
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none, DurationMilliSeconds, TimestampMilliSeconds};
use uuid::Uuid;

/// Player states a sample can describe.
///
/// Serialized as the lowercase names the collector uses.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    Ready,
    #[serde(rename = "source_changed")]
    SourceChanged,
    Startup,
    Ad,
    AdFinished,
    Buffering,
    Error,
    ExitBeforeVideoStart,
    Playing,
    Pause,
    QualityChange,
    CustomDataChange,
    AudioTrackChange,
    SubtitleChange,
    Seeking,
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ready => "ready",
            Self::SourceChanged => "source_changed",
            Self::Startup => "startup",
            Self::Ad => "ad",
            Self::AdFinished => "adfinished",
            Self::Buffering => "buffering",
            Self::Error => "error",
            Self::ExitBeforeVideoStart => "exitbeforevideostart",
            Self::Playing => "playing",
            Self::Pause => "pause",
            Self::QualityChange => "qualitychange",
            Self::CustomDataChange => "customdatachange",
            Self::AudioTrackChange => "audiotrackchange",
            Self::SubtitleChange => "subtitlechange",
            Self::Seeking => "seeking",
        };
        write!(f, "{name}")
    }
}

/// Diagnostic details attached to an error.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    pub exception_message: Option<String>,
    #[serde(default)]
    pub exception_stacktrace: Vec<String>,
    pub additional_data: Option<String>,
}

impl ErrorData {
    /// Longest string that is put on the wire.
    pub const MAX_STRING_LENGTH: usize = 400;

    #[must_use]
    pub fn from_error(error: &dyn std::error::Error, additional_data: Option<String>) -> Self {
        let mut exception_stacktrace = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            exception_stacktrace.push(cause.to_string());
            source = cause.source();
        }

        Self {
            exception_message: Some(error.to_string()),
            exception_stacktrace,
            additional_data,
        }
    }

    /// Returns a copy with every free-form string cut to
    /// [`MAX_STRING_LENGTH`](Self::MAX_STRING_LENGTH) characters.
    #[must_use]
    pub fn truncated(&self) -> Self {
        Self {
            exception_message: self
                .exception_message
                .as_deref()
                .map(|s| truncate(s, Self::MAX_STRING_LENGTH)),
            exception_stacktrace: self.exception_stacktrace.clone(),
            additional_data: self
                .additional_data
                .as_deref()
                .map(|s| truncate(s, Self::MAX_STRING_LENGTH)),
        }
    }
}

/// Cuts `s` to at most `max` characters, never splitting a character.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Classification of a playback error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCode {
    pub code: i32,
    pub message: String,
    pub data: Option<ErrorData>,
}

impl ErrorCode {
    /// Reported instead of a quality change when the player changes quality
    /// more often than the collector accepts.
    pub const QUALITY_CHANGE_THRESHOLD_EXCEEDED: i32 = 10_000;

    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn quality_change_threshold_exceeded() -> Self {
        Self::new(
            Self::QUALITY_CHANGE_THRESHOLD_EXCEEDED,
            "ANALYTICS_QUALITY_CHANGE_THRESHOLD_EXCEEDED",
        )
    }

    #[must_use]
    pub fn with_data(mut self, data: ErrorData) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// One sample of regular playback.
///
/// The sequence number is owned by the dispatcher: whatever the producer
/// sets is overwritten when the sample is added.
#[serde_as]
#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    pub impression_id: Uuid,

    #[serde(default)]
    pub sequence_number: u64,

    pub state: PlayerState,

    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub duration: Option<Duration>,

    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub video_startup_time: Option<Duration>,

    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub player_startup_time: Option<Duration>,

    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub seeked: Option<Duration>,

    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub buffered: Option<Duration>,

    pub error_code: Option<i32>,
    pub error_message: Option<String>,
    pub error_data: Option<ErrorData>,

    #[serde(default)]
    pub muted: bool,

    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    pub time: SystemTime,
}

impl EventData {
    #[must_use]
    pub fn new(impression_id: Uuid, state: PlayerState) -> Self {
        Self {
            impression_id,
            sequence_number: 0,
            state,
            duration: None,
            video_startup_time: None,
            player_startup_time: None,
            seeked: None,
            buffered: None,
            error_code: None,
            error_message: None,
            error_data: None,
            muted: false,
            time: SystemTime::now(),
        }
    }

    /// Attaches an error classification; error details are truncated.
    pub fn set_error(&mut self, error: &ErrorCode) {
        self.error_code = Some(error.code);
        self.error_message = Some(truncate(&error.message, ErrorData::MAX_STRING_LENGTH));
        self.error_data = error.data.as_ref().map(ErrorData::truncated);
    }
}

/// One ad playback record.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdEventData {
    pub impression_id: Uuid,

    #[serde_as(as = "TimestampMilliSeconds<i64>")]
    pub time: SystemTime,
}

impl AdEventData {
    #[must_use]
    pub fn new(impression_id: Uuid) -> Self {
        Self {
            impression_id,
            time: SystemTime::now(),
        }
    }
}
