//! Authenticate-then-flush event dispatcher.
//!
//! The dispatcher holds back every event until the license has been
//! authenticated. On the first successful authentication it flushes what it
//! buffered to the backend, in order, and from then on passes events straight
//! through.
//!
//! # State
//!
//! A dispatcher is either [`Disabled`](DispatcherState::Disabled), buffering
//! everything, or [`Enabled`](DispatcherState::Enabled), buffering nothing.
//! Only two things change the state:
//! * a successful authentication enables it and flushes the buffers
//! * [`disable`](EventDataDispatcher::disable) disables it and discards the
//!   buffers
//!
//! # Sequence numbers
//!
//! Regular events are numbered 0, 1, 2, ... as they are added. Numbering
//! restarts at 0 on [`disable`](EventDataDispatcher::disable) and
//! [`reset_source_related_state`](EventDataDispatcher::reset_source_related_state),
//! but not on authentication. Ad events are not numbered.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use fcanalytics::{backend::LogBackend, config::Config, dispatcher::EventDataDispatcher};
//!
//! let config = Config::with_license_key("my-license")?;
//! let dispatcher = Arc::new(
//!     EventDataDispatcher::new(config, &LogBackend::factory()).with_authenticator(authenticator),
//! );
//!
//! dispatcher.add(sample); // buffered
//! dispatcher.enable(); // flushes once the license is authenticated
//! ```

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use crate::{
    backend::{Backend, BackendFactory},
    config::Config,
    events::{AdEventData, EventData},
    license::{AuthenticationCallback, Authenticator, FeatureConfigContainer, LicenseCallback},
    queue::PendingQueue,
};

/// Whether events are buffered or passed through.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DispatcherState {
    /// Events are buffered until authentication succeeds.
    #[default]
    Disabled = 0,
    /// Events go to the backend immediately.
    Enabled = 1,
}

impl From<u8> for DispatcherState {
    fn from(value: u8) -> Self {
        if value == Self::Enabled as u8 {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}

impl fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Enabled => write!(f, "enabled"),
        }
    }
}

pub struct EventDataDispatcher {
    config: Config,
    backend: Arc<dyn Backend>,

    events: PendingQueue<EventData>,
    ad_events: PendingQueue<AdEventData>,

    /// A [`DispatcherState`]; only written while both queues are locked.
    state: AtomicU8,
    sequence_number: AtomicU64,

    /// Serializes authentication completions.
    completion: Mutex<()>,
    authenticating: AtomicBool,

    authenticator: Option<Arc<dyn Authenticator>>,
    license_callback: Option<Arc<dyn LicenseCallback>>,
}

impl EventDataDispatcher {
    /// Creates a disabled dispatcher with empty buffers.
    ///
    /// The backend is created here, once, by `backend_factory`.
    #[must_use]
    pub fn new<F>(config: Config, backend_factory: &F) -> Self
    where
        F: BackendFactory + ?Sized,
    {
        let backend = backend_factory.create_backend(&config);

        Self {
            config,
            backend,
            events: PendingQueue::new(),
            ad_events: PendingQueue::new(),
            state: AtomicU8::new(DispatcherState::Disabled as u8),
            sequence_number: AtomicU64::new(0),
            completion: Mutex::new(()),
            authenticating: AtomicBool::new(false),
            authenticator: None,
            license_callback: None,
        }
    }

    /// Sets the licensing service that [`enable`](Self::enable) starts.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Sets the observer of licensing results.
    #[must_use]
    pub fn with_license_callback(mut self, callback: Arc<dyn LicenseCallback>) -> Self {
        self.license_callback = Some(callback);
        self
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The backend created at construction.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    #[must_use]
    pub fn state(&self) -> DispatcherState {
        DispatcherState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: DispatcherState) {
        let previous = DispatcherState::from(self.state.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            debug!("dispatcher {previous} -> {state}");
        }
    }

    /// Adds a regular event.
    ///
    /// The event gets the next sequence number, then goes to the backend if
    /// the dispatcher is enabled or to the back of the buffer if not.
    pub fn add(&self, mut event: EventData) {
        let mut pending = self.events.lock();
        event.sequence_number = self.sequence_number.fetch_add(1, Ordering::AcqRel);

        if self.state() == DispatcherState::Enabled {
            drop(pending);
            trace!("sending event {}", event.sequence_number);
            self.backend.send(event);
        } else {
            trace!("buffering event {}", event.sequence_number);
            pending.push(event);
        }
    }

    /// Adds an ad event, which is sent or buffered like a regular event but
    /// not numbered.
    pub fn add_ad(&self, event: AdEventData) {
        let mut pending = self.ad_events.lock();

        if self.state() == DispatcherState::Enabled {
            drop(pending);
            trace!("sending ad event");
            self.backend.send_ad(event);
        } else {
            trace!("buffering ad event");
            pending.push(event);
        }
    }

    /// Starts authenticating the license.
    ///
    /// The outcome arrives later through
    /// [`AuthenticationCallback::authentication_completed`]. Does nothing
    /// when the dispatcher is already enabled, when a request is still
    /// outstanding, or when no authenticator is set.
    pub fn enable(self: &Arc<Self>) {
        if self.state() == DispatcherState::Enabled {
            debug!("dispatcher already enabled");
            return;
        }

        let Some(authenticator) = &self.authenticator else {
            warn!("no authenticator set; events stay buffered");
            return;
        };

        if self.authenticating.swap(true, Ordering::AcqRel) {
            debug!("license authentication already in progress");
            return;
        }

        info!("authenticating license");
        let callback: Arc<dyn AuthenticationCallback> = Arc::clone(self) as _;
        authenticator.authenticate(&self.config, callback);
    }

    /// Disables the dispatcher, discards all buffered events and restarts
    /// numbering at 0.
    ///
    /// Use when the source changes, so that nothing buffered for the old
    /// source is sent under the new one.
    ///
    /// Takes the queue locks in the same order as the flush, so it runs
    /// either wholly before or wholly after one. May be called from a
    /// [`LicenseCallback`].
    pub fn disable(&self) {
        let mut events = self.events.lock();
        let mut ad_events = self.ad_events.lock();

        let discarded = events.len() + ad_events.len();
        events.clear();
        ad_events.clear();
        self.set_state(DispatcherState::Disabled);
        self.sequence_number.store(0, Ordering::Release);

        if discarded > 0 {
            debug!("discarded {discarded} buffered events");
        }
    }

    /// Restarts numbering at 0 without touching buffers or state.
    ///
    /// Use when the source changes but the license stays valid.
    pub fn reset_source_related_state(&self) {
        let _pending = self.events.lock();
        self.sequence_number.store(0, Ordering::Release);
    }

    /// Whether an authentication request is outstanding.
    ///
    /// Stays set until the buffers of a successful completion have been
    /// flushed.
    #[must_use]
    pub fn is_authenticating(&self) -> bool {
        self.authenticating.load(Ordering::Acquire)
    }

    /// Number of regular events waiting for authentication.
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Number of ad events waiting for authentication.
    #[must_use]
    pub fn pending_ad_events(&self) -> usize {
        self.ad_events.len()
    }

    /// Copies of the regular events waiting for authentication, oldest first.
    #[must_use]
    pub fn buffered_events(&self) -> Vec<EventData> {
        self.events.snapshot()
    }

    /// Copies of the ad events waiting for authentication, oldest first.
    #[must_use]
    pub fn buffered_ad_events(&self) -> Vec<AdEventData> {
        self.ad_events.snapshot()
    }

    /// Enables the dispatcher and sends everything buffered.
    ///
    /// Both queues stay locked until their buffers are empty, so producers
    /// that see the enabled state always send after the flushed events.
    fn flush(&self) {
        let mut events = self.events.lock();
        let mut ad_events = self.ad_events.lock();
        self.set_state(DispatcherState::Enabled);

        let sent = events.drain(|event| self.backend.send(event));
        drop(events);
        let sent_ads = ad_events.drain(|event| self.backend.send_ad(event));
        drop(ad_events);

        debug!("flushed {sent} events and {sent_ads} ad events");
    }
}

/// Receives the licensing outcome.
///
/// Runs under the completion lock, so completions never overlap each other.
/// The license callback is called with no queue lock held.
impl AuthenticationCallback for EventDataDispatcher {
    fn authentication_completed(&self, success: bool, feature_config: FeatureConfigContainer) {
        let _completion = self
            .completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(callback) = &self.license_callback {
            callback.configure_features(success, &feature_config);
        }

        if success {
            info!("license authenticated");
            self.flush();
        } else {
            warn!(
                "license authentication failed; {} events stay buffered",
                self.pending_events() + self.pending_ad_events()
            );
        }
        self.authenticating.store(false, Ordering::Release);

        if let Some(callback) = &self.license_callback {
            callback.authentication_completed(success);
        }
    }
}

impl fmt::Debug for EventDataDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDataDispatcher")
            .field("config", &self.config)
            .field("state", &self.state())
            .field(
                "sequence_number",
                &self.sequence_number.load(Ordering::Acquire),
            )
            .field("events", &self.events)
            .field("ad_events", &self.ad_events)
            .field("authenticating", &self.authenticating.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::MemoryBackend, events::PlayerState};
    use pretty_assertions::assert_eq;
    use std::{
        sync::{mpsc, Weak},
        thread,
        time::Duration,
    };
    use uuid::Uuid;

    fn dispatcher() -> (EventDataDispatcher, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let shared = Arc::clone(&backend);
        let factory = move |_: &Config| -> Arc<dyn Backend> { shared.clone() };
        let config = Config::with_license_key("license").unwrap();
        (EventDataDispatcher::new(config, &factory), backend)
    }

    /// Drops everything buffered once the license turns out to be invalid.
    struct DisableOnFailure {
        dispatcher: Mutex<Weak<EventDataDispatcher>>,
    }

    impl LicenseCallback for DisableOnFailure {
        fn configure_features(&self, _success: bool, _feature_config: &FeatureConfigContainer) {}

        fn authentication_completed(&self, success: bool) {
            let dispatcher = self.dispatcher.lock().unwrap().upgrade();
            if let (false, Some(dispatcher)) = (success, dispatcher) {
                dispatcher.disable();
            }
        }
    }

    fn sample(state: PlayerState) -> EventData {
        EventData::new(Uuid::nil(), state)
    }

    fn states(events: &[EventData]) -> Vec<(u64, PlayerState)> {
        events
            .iter()
            .map(|event| (event.sequence_number, event.state))
            .collect()
    }

    #[test]
    fn flushes_buffer_in_order_on_success() {
        let (dispatcher, backend) = dispatcher();
        dispatcher.add(sample(PlayerState::Startup));
        dispatcher.add(sample(PlayerState::Playing));
        dispatcher.add_ad(AdEventData::new(Uuid::nil()));
        assert!(backend.events().is_empty());

        dispatcher.authentication_completed(true, FeatureConfigContainer::new());

        assert_eq!(
            states(&backend.events()),
            vec![(0, PlayerState::Startup), (1, PlayerState::Playing)]
        );
        assert_eq!(backend.ad_events().len(), 1);
        assert_eq!(dispatcher.pending_events(), 0);
        assert_eq!(dispatcher.pending_ad_events(), 0);
        assert_eq!(dispatcher.state(), DispatcherState::Enabled);
    }

    #[test]
    fn keeps_buffer_on_failure() {
        let (dispatcher, backend) = dispatcher();
        dispatcher.add(sample(PlayerState::Startup));
        dispatcher.add(sample(PlayerState::Playing));
        dispatcher.add_ad(AdEventData::new(Uuid::nil()));

        dispatcher.authentication_completed(false, FeatureConfigContainer::new());

        assert!(backend.events().is_empty());
        assert!(backend.ad_events().is_empty());
        assert_eq!(dispatcher.state(), DispatcherState::Disabled);
        assert_eq!(dispatcher.pending_ad_events(), 1);

        dispatcher.add(sample(PlayerState::Pause));
        assert_eq!(
            states(&dispatcher.buffered_events()),
            vec![
                (0, PlayerState::Startup),
                (1, PlayerState::Playing),
                (2, PlayerState::Pause)
            ]
        );
    }

    #[test]
    fn later_success_flushes_what_failure_kept() {
        let (dispatcher, backend) = dispatcher();
        dispatcher.add(sample(PlayerState::Startup));
        dispatcher.authentication_completed(false, FeatureConfigContainer::new());
        dispatcher.add(sample(PlayerState::Playing));
        dispatcher.authentication_completed(true, FeatureConfigContainer::new());

        assert_eq!(backend.sequence_numbers(), vec![0, 1]);
    }

    #[test]
    fn sends_immediately_once_enabled() {
        let (dispatcher, backend) = dispatcher();
        dispatcher.add(sample(PlayerState::Startup));
        dispatcher.add(sample(PlayerState::Playing));
        dispatcher.authentication_completed(true, FeatureConfigContainer::new());

        dispatcher.add(sample(PlayerState::Seeking));
        dispatcher.add_ad(AdEventData::new(Uuid::nil()));

        assert_eq!(backend.sequence_numbers(), vec![0, 1, 2]);
        assert_eq!(backend.ad_events().len(), 1);
        assert_eq!(dispatcher.pending_events(), 0);
        assert_eq!(dispatcher.pending_ad_events(), 0);
    }

    #[test]
    fn disable_discards_and_renumbers() {
        let (dispatcher, backend) = dispatcher();
        dispatcher.add(sample(PlayerState::Startup));
        dispatcher.add(sample(PlayerState::Playing));
        dispatcher.add_ad(AdEventData::new(Uuid::nil()));

        dispatcher.disable();
        dispatcher.add(sample(PlayerState::Pause));

        assert_eq!(states(&dispatcher.buffered_events()), vec![(0, PlayerState::Pause)]);
        assert_eq!(dispatcher.pending_ad_events(), 0);
        assert!(backend.events().is_empty());
    }

    #[test]
    fn disable_after_enable_buffers_again() {
        let (dispatcher, backend) = dispatcher();
        dispatcher.authentication_completed(true, FeatureConfigContainer::new());
        dispatcher.add(sample(PlayerState::Playing));

        dispatcher.disable();
        assert_eq!(dispatcher.state(), DispatcherState::Disabled);

        dispatcher.add(sample(PlayerState::Playing));
        assert_eq!(backend.sequence_numbers(), vec![0]);
        assert_eq!(dispatcher.pending_events(), 1);
    }

    #[test]
    fn disable_is_idempotent() {
        let (dispatcher, _) = dispatcher();
        dispatcher.add(sample(PlayerState::Playing));
        dispatcher.add_ad(AdEventData::new(Uuid::nil()));

        dispatcher.disable();
        dispatcher.disable();

        assert_eq!(dispatcher.state(), DispatcherState::Disabled);
        assert_eq!(dispatcher.pending_events(), 0);
        assert_eq!(dispatcher.pending_ad_events(), 0);
        dispatcher.add(sample(PlayerState::Playing));
        assert_eq!(dispatcher.buffered_events()[0].sequence_number, 0);
    }

    #[test]
    fn license_callback_may_disable() {
        let (dispatcher, _) = dispatcher();
        let callback = Arc::new(DisableOnFailure {
            dispatcher: Mutex::new(Weak::new()),
        });
        let dispatcher = Arc::new(dispatcher.with_license_callback(callback.clone()));
        *callback.dispatcher.lock().unwrap() = Arc::downgrade(&dispatcher);

        dispatcher.add(sample(PlayerState::Startup));
        dispatcher.add_ad(AdEventData::new(Uuid::nil()));

        let (tx, rx) = mpsc::channel();
        let completer = {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || {
                dispatcher.authentication_completed(false, FeatureConfigContainer::new());
                let _ = tx.send(());
            })
        };
        rx.recv_timeout(Duration::from_secs(5))
            .expect("completion deadlocked on disable");
        completer.join().unwrap();

        assert_eq!(dispatcher.state(), DispatcherState::Disabled);
        assert_eq!(dispatcher.pending_events(), 0);
        assert_eq!(dispatcher.pending_ad_events(), 0);
        assert!(!dispatcher.is_authenticating());

        dispatcher.add(sample(PlayerState::Playing));
        assert_eq!(dispatcher.buffered_events()[0].sequence_number, 0);
    }

    #[test]
    fn reset_source_related_state_only_renumbers() {
        let (dispatcher, _) = dispatcher();
        dispatcher.add(sample(PlayerState::Startup));
        dispatcher.add(sample(PlayerState::Playing));

        dispatcher.reset_source_related_state();
        dispatcher.add(sample(PlayerState::Pause));

        assert_eq!(
            states(&dispatcher.buffered_events()),
            vec![
                (0, PlayerState::Startup),
                (1, PlayerState::Playing),
                (0, PlayerState::Pause)
            ]
        );
        assert_eq!(dispatcher.state(), DispatcherState::Disabled);
    }

    #[test]
    fn reset_source_related_state_keeps_enabled() {
        let (dispatcher, backend) = dispatcher();
        dispatcher.authentication_completed(true, FeatureConfigContainer::new());
        dispatcher.add(sample(PlayerState::Playing));
        dispatcher.reset_source_related_state();
        dispatcher.add(sample(PlayerState::Playing));

        assert_eq!(dispatcher.state(), DispatcherState::Enabled);
        assert_eq!(backend.sequence_numbers(), vec![0, 0]);
    }

    #[test]
    fn concurrent_adds_are_numbered_without_gaps() {
        let (dispatcher, backend) = dispatcher();
        let dispatcher = Arc::new(dispatcher);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dispatcher = Arc::clone(&dispatcher);
                thread::spawn(move || {
                    for _ in 0..250 {
                        dispatcher.add(sample(PlayerState::Playing));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        dispatcher.authentication_completed(true, FeatureConfigContainer::new());
        assert_eq!(backend.sequence_numbers(), (0..2000).collect::<Vec<_>>());
    }

    #[test]
    fn adds_racing_the_flush_are_sent_exactly_once() {
        let (dispatcher, backend) = dispatcher();
        let dispatcher = Arc::new(dispatcher);

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let dispatcher = Arc::clone(&dispatcher);
                thread::spawn(move || {
                    for _ in 0..500 {
                        dispatcher.add(sample(PlayerState::Playing));
                        dispatcher.add_ad(AdEventData::new(Uuid::nil()));
                    }
                })
            })
            .collect();

        let completer = {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || {
                dispatcher.authentication_completed(true, FeatureConfigContainer::new());
            })
        };

        for handle in producers {
            handle.join().unwrap();
        }
        completer.join().unwrap();

        let mut sequence_numbers = backend.sequence_numbers();
        sequence_numbers.sort_unstable();
        assert_eq!(sequence_numbers, (0..2000).collect::<Vec<_>>());
        assert_eq!(backend.ad_events().len(), 2000);
        assert_eq!(dispatcher.pending_events(), 0);
        assert_eq!(dispatcher.pending_ad_events(), 0);
    }
}
