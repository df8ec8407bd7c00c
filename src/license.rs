//! Licensing collaborators.
//!
//! Events are only delivered once the license key has been authenticated.
//! The licensing service is modelled by three traits:
//!
//! * [`Authenticator`] starts an authentication request
//! * [`AuthenticationCallback`] receives its outcome (implemented by the
//!   dispatcher)
//! * [`LicenseCallback`] is told about feature settings and the outcome
//!   (implemented by whoever embeds the collector)
//!
//! [`TimedAuthenticator`] answers every request after a fixed delay with a
//! fixed outcome, which is what the command line tool and tests use.

use std::{
    collections::BTreeMap,
    ops::{Deref, DerefMut},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use crate::config::Config;

/// Feature settings delivered with an authentication result, by feature
/// name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureConfigContainer(BTreeMap<String, serde_json::Value>);

impl FeatureConfigContainer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Deref for FeatureConfigContainer {
    type Target = BTreeMap<String, serde_json::Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for FeatureConfigContainer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Receives the outcome of an authentication request.
pub trait AuthenticationCallback: Send + Sync {
    fn authentication_completed(&self, success: bool, feature_config: FeatureConfigContainer);
}

/// Observer of licensing results.
///
/// Both methods are called from within the authentication completion, in
/// order: `configure_features` before buffered events are flushed,
/// `authentication_completed` after. Neither is called with a queue lock
/// held, so both may add events or
/// [`disable`](crate::dispatcher::EventDataDispatcher::disable) the
/// dispatcher. `authentication_completed` may also call `enable` again, as
/// long as the authenticator answers on another thread: completions are
/// serialized and do not nest.
pub trait LicenseCallback: Send + Sync {
    fn configure_features(&self, success: bool, feature_config: &FeatureConfigContainer);
    fn authentication_completed(&self, success: bool);
}

/// Licensing service.
///
/// `authenticate` must return without waiting for the outcome and deliver
/// it later through `callback`, exactly once per call.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, config: &Config, callback: Arc<dyn AuthenticationCallback>);
}

/// Authenticator that answers after a fixed delay with a fixed outcome.
#[derive(Debug)]
pub struct TimedAuthenticator {
    runtime: Handle,
    delay: Duration,
    success: bool,
}

impl TimedAuthenticator {
    #[must_use]
    pub fn new(runtime: Handle, delay: Duration, success: bool) -> Self {
        Self {
            runtime,
            delay,
            success,
        }
    }

    /// Takes the delay and outcome from the configuration.
    #[must_use]
    pub fn from_config(runtime: Handle, config: &Config) -> Self {
        Self::new(runtime, config.auth_delay, config.auth_success)
    }
}

impl Authenticator for TimedAuthenticator {
    fn authenticate(&self, config: &Config, callback: Arc<dyn AuthenticationCallback>) {
        let delay = self.delay;
        let success = self.success;
        let feature_config = if success {
            config.feature_config.clone()
        } else {
            FeatureConfigContainer::default()
        };

        debug!("authenticating license in {:.1}s", delay.as_secs_f32());
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            callback.authentication_completed(success, feature_config);
        });
    }
}
