//! Playback lifecycle notifications.
//!
//! A player state machine reports what happened through
//! [`StateMachineListener`]. Every call stands for one discrete playback
//! event that has completed or is in progress; the listener imposes no
//! ordering of its own.
//!
//! [`EventCollector`] is the listener that turns these notifications into
//! analytics records for an [`EventDataDispatcher`]. Given an
//! [`ErrorDetailBackend`], it also reports every error in detail.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use uuid::Uuid;

use crate::{
    dispatcher::EventDataDispatcher,
    error_details::{ErrorDetail, ErrorDetailBackend},
    events::{AdEventData, ErrorCode, EventData, PlayerState},
};

/// Notifications sent by a player state machine.
///
/// Durations are the time spent in the state being left.
pub trait StateMachineListener {
    fn on_startup(&self, video_startup_time: Duration, player_startup_time: Duration);
    fn on_pause_exit(&self, duration: Duration);
    fn on_play_exit(&self, duration: Duration);
    fn on_heartbeat(&self, duration: Duration);
    fn on_rebuffering(&self, duration: Duration);
    fn on_error(&self, error: &ErrorCode);
    fn on_seek_complete(&self, duration: Duration);
    fn on_ad(&self);
    fn on_mute(&self);
    fn on_unmute(&self);
    fn on_update_sample(&self);
    fn on_quality_change(&self);
    fn on_video_change(&self);
    fn on_subtitle_change(&self);
    fn on_audio_track_change(&self);
    fn on_video_start_failed(&self);
}

#[derive(Debug)]
struct Impression {
    id: Uuid,
    muted: bool,
}

/// Builds analytics records from playback notifications and adds them to a
/// dispatcher.
#[derive(Debug)]
pub struct EventCollector {
    dispatcher: Arc<EventDataDispatcher>,
    error_details: Option<Arc<ErrorDetailBackend>>,
    impression: Mutex<Impression>,
}

impl EventCollector {
    #[must_use]
    pub fn new(dispatcher: Arc<EventDataDispatcher>) -> Self {
        Self {
            dispatcher,
            error_details: None,
            impression: Mutex::new(Impression {
                id: Uuid::new_v4(),
                muted: false,
            }),
        }
    }

    /// Sets where errors are reported in detail.
    #[must_use]
    pub fn with_error_details(mut self, error_details: Arc<ErrorDetailBackend>) -> Self {
        self.error_details = Some(error_details);
        self
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<EventDataDispatcher> {
        &self.dispatcher
    }

    /// Identifier of the playback session samples are reported for.
    #[must_use]
    pub fn impression_id(&self) -> Uuid {
        self.with_impression(|impression| impression.id)
    }

    fn with_impression<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Impression) -> R,
    {
        let mut impression = self
            .impression
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut impression)
    }

    fn sample(&self, state: PlayerState) -> EventData {
        let (id, muted) = self.with_impression(|impression| (impression.id, impression.muted));
        let mut sample = EventData::new(id, state);
        sample.muted = muted;
        sample
    }

    fn report(&self, state: PlayerState, duration: Option<Duration>) {
        let mut sample = self.sample(state);
        sample.duration = duration;
        self.dispatcher.add(sample);
    }
}

impl StateMachineListener for EventCollector {
    fn on_startup(&self, video_startup_time: Duration, player_startup_time: Duration) {
        let mut sample = self.sample(PlayerState::Startup);
        sample.duration = Some(video_startup_time + player_startup_time);
        sample.video_startup_time = Some(video_startup_time);
        sample.player_startup_time = Some(player_startup_time);
        self.dispatcher.add(sample);
    }

    fn on_pause_exit(&self, duration: Duration) {
        self.report(PlayerState::Pause, Some(duration));
    }

    fn on_play_exit(&self, duration: Duration) {
        self.report(PlayerState::Playing, Some(duration));
    }

    fn on_heartbeat(&self, duration: Duration) {
        self.report(PlayerState::Playing, Some(duration));
    }

    fn on_rebuffering(&self, duration: Duration) {
        let mut sample = self.sample(PlayerState::Buffering);
        sample.duration = Some(duration);
        sample.buffered = Some(duration);
        self.dispatcher.add(sample);
    }

    fn on_error(&self, error: &ErrorCode) {
        debug!("playback error {error}");
        let mut sample = self.sample(PlayerState::Error);
        sample.set_error(error);
        let impression_id = sample.impression_id;
        self.dispatcher.add(sample);

        if let Some(error_details) = &self.error_details {
            error_details.send(ErrorDetail::new(impression_id, error));
        }
    }

    fn on_seek_complete(&self, duration: Duration) {
        let mut sample = self.sample(PlayerState::Seeking);
        sample.duration = Some(duration);
        sample.seeked = Some(duration);
        self.dispatcher.add(sample);
    }

    fn on_ad(&self) {
        self.dispatcher.add_ad(AdEventData::new(self.impression_id()));
    }

    fn on_mute(&self) {
        self.with_impression(|impression| impression.muted = true);
        self.report(PlayerState::Playing, None);
    }

    fn on_unmute(&self) {
        self.with_impression(|impression| impression.muted = false);
        self.report(PlayerState::Playing, None);
    }

    fn on_update_sample(&self) {
        self.report(PlayerState::Playing, None);
    }

    fn on_quality_change(&self) {
        self.report(PlayerState::QualityChange, None);
    }

    /// Starts a new impression: numbering restarts, the license stays valid.
    fn on_video_change(&self) {
        let id = Uuid::new_v4();
        self.with_impression(|impression| impression.id = id);
        self.dispatcher.reset_source_related_state();
        debug!("new impression {id}");
        self.report(PlayerState::SourceChanged, None);
    }

    fn on_subtitle_change(&self) {
        self.report(PlayerState::SubtitleChange, None);
    }

    fn on_audio_track_change(&self) {
        self.report(PlayerState::AudioTrackChange, None);
    }

    fn on_video_start_failed(&self) {
        self.report(PlayerState::ExitBeforeVideoStart, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{Backend, MemoryBackend},
        config::Config,
        license::{AuthenticationCallback, FeatureConfigContainer},
    };
    use pretty_assertions::assert_eq;

    fn collector() -> (EventCollector, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let shared = Arc::clone(&backend);
        let factory = move |_: &Config| -> Arc<dyn Backend> { shared.clone() };
        let config = Config::with_license_key("license").unwrap();
        let dispatcher = Arc::new(EventDataDispatcher::new(config, &factory));
        (EventCollector::new(dispatcher), backend)
    }

    #[test]
    fn notifications_map_to_states() {
        let (collector, backend) = collector();
        collector.on_startup(Duration::from_millis(800), Duration::from_millis(200));
        collector.on_play_exit(Duration::from_secs(5));
        collector.on_rebuffering(Duration::from_millis(1200));
        collector.on_seek_complete(Duration::from_millis(300));
        collector.on_pause_exit(Duration::from_secs(2));
        collector.on_quality_change();
        collector.on_subtitle_change();
        collector.on_audio_track_change();
        collector.on_video_start_failed();

        collector
            .dispatcher()
            .authentication_completed(true, FeatureConfigContainer::new());

        let events = backend.events();
        let states: Vec<_> = events.iter().map(|event| event.state).collect();
        assert_eq!(
            states,
            vec![
                PlayerState::Startup,
                PlayerState::Playing,
                PlayerState::Buffering,
                PlayerState::Seeking,
                PlayerState::Pause,
                PlayerState::QualityChange,
                PlayerState::SubtitleChange,
                PlayerState::AudioTrackChange,
                PlayerState::ExitBeforeVideoStart,
            ]
        );

        assert_eq!(events[0].duration, Some(Duration::from_secs(1)));
        assert_eq!(events[0].video_startup_time, Some(Duration::from_millis(800)));
        assert_eq!(events[2].buffered, Some(Duration::from_millis(1200)));
        assert_eq!(events[3].seeked, Some(Duration::from_millis(300)));
        assert!(events
            .iter()
            .all(|event| event.impression_id == collector.impression_id()));
    }

    #[test]
    fn ads_are_routed_separately() {
        let (collector, backend) = collector();
        collector.on_ad();
        collector
            .dispatcher()
            .authentication_completed(true, FeatureConfigContainer::new());

        assert!(backend.events().is_empty());
        let ads = backend.ad_events();
        assert_eq!(ads.len(), 1);
        assert_eq!(ads[0].impression_id, collector.impression_id());
    }

    #[test]
    fn errors_carry_code() {
        let (collector, backend) = collector();
        collector
            .dispatcher()
            .authentication_completed(true, FeatureConfigContainer::new());
        collector.on_error(&ErrorCode::quality_change_threshold_exceeded());

        let events = backend.events();
        assert_eq!(events[0].state, PlayerState::Error);
        assert_eq!(
            events[0].error_code,
            Some(ErrorCode::QUALITY_CHANGE_THRESHOLD_EXCEEDED)
        );
    }

    #[test]
    fn errors_are_reported_in_detail() {
        let (collector, backend) = collector();
        let error_details = Arc::new(ErrorDetailBackend::new(backend.clone()));
        let collector = collector.with_error_details(error_details.clone());

        collector.on_error(&ErrorCode::new(2001, "manifest unreachable"));
        assert_eq!(error_details.pending(), 1);

        error_details.set_enabled(true);
        let details = backend.error_details();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].code, Some(2001));
        assert_eq!(details[0].impression_id, collector.impression_id());
        assert_eq!(details[0].message.as_deref(), Some("manifest unreachable"));
    }

    #[test]
    fn mute_is_reported_on_later_samples() {
        let (collector, backend) = collector();
        collector
            .dispatcher()
            .authentication_completed(true, FeatureConfigContainer::new());

        collector.on_mute();
        collector.on_heartbeat(Duration::from_secs(10));
        collector.on_unmute();
        collector.on_update_sample();

        let muted: Vec<_> = backend.events().iter().map(|event| event.muted).collect();
        assert_eq!(muted, vec![true, true, false, false]);
    }

    #[test]
    fn video_change_starts_new_impression() {
        let (collector, backend) = collector();
        collector
            .dispatcher()
            .authentication_completed(true, FeatureConfigContainer::new());

        collector.on_update_sample();
        collector.on_update_sample();
        let first = collector.impression_id();
        collector.on_video_change();
        collector.on_update_sample();

        let events = backend.events();
        assert_ne!(collector.impression_id(), first);
        assert_eq!(backend.sequence_numbers(), vec![0, 1, 0, 1]);
        assert_eq!(events[2].state, PlayerState::SourceChanged);
        assert_eq!(events[3].impression_id, collector.impression_id());
    }
}
