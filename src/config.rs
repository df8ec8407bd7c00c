//! Collector configuration.
//!
//! Configuration is read from a TOML file:
//!
//! ```toml
//! license_key = "0f6c6d5e-4f9b-4b5c-9a47-2c3b1a0d9e8f"
//! backend_url = "https://analytics.5centscdn.net/analytics"
//! auth_delay = 250
//! auth_success = true
//!
//! [feature_config.errorDetails]
//! enabled = true
//! numberOfHttpRequests = 10
//! ```
//!
//! Only `license_key` is required.

use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use serde_with::{serde_as, DurationMilliSeconds};
use url::Url;
use veil::Redact;

use crate::{
    error::{Error, Result},
    license::FeatureConfigContainer,
};

#[serde_as]
#[derive(Clone, PartialEq, Eq, Deserialize, Redact)]
pub struct Config {
    /// License key that the licensing service authenticates.
    #[redact(partial)]
    pub license_key: String,

    #[serde(default = "Config::default_backend_url")]
    pub backend_url: Url,

    /// How long the simulated licensing service takes to answer.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default)]
    pub auth_delay: Duration,

    /// Outcome the simulated licensing service reports.
    #[serde(default = "Config::default_auth_success")]
    pub auth_success: bool,

    /// Feature settings handed out on authentication.
    #[serde(default)]
    pub feature_config: FeatureConfigContainer,
}

impl Config {
    /// Upper bound for configuration files; anything larger is not ours.
    const MAX_FILE_SIZE: u64 = 64 * 1024;

    const DEFAULT_BACKEND_URL: &'static str = "https://analytics.5centscdn.net/analytics";

    /// # Panics
    ///
    /// Will panic if the built-in URL is invalid.
    fn default_backend_url() -> Url {
        Url::parse(Self::DEFAULT_BACKEND_URL).expect("invalid default backend url")
    }

    fn default_auth_success() -> bool {
        true
    }

    /// Creates a configuration with the given license key and defaults for
    /// everything else.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the license key is empty.
    pub fn with_license_key(license_key: impl Into<String>) -> Result<Self> {
        let config = Self {
            license_key: license_key.into(),
            backend_url: Self::default_backend_url(),
            auth_delay: Duration::ZERO,
            auth_success: Self::default_auth_success(),
            feature_config: FeatureConfigContainer::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Will return `Err` if:
    /// - the file cannot be read or is too large
    /// - the contents are not valid TOML or miss required fields
    /// - the license key is empty
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Prevent out-of-memory condition: configuration files are small.
        let file_size = fs::metadata(path)?.len();
        if file_size > Self::MAX_FILE_SIZE {
            return Err(Error::resource_exhausted(format!(
                "{} is too large ({file_size} bytes)",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        contents.parse()
    }

    fn validate(&self) -> Result<()> {
        if self.license_key.trim().is_empty() {
            return Err(Error::invalid_argument("license key is empty"));
        }

        match self.backend_url.scheme() {
            "http" | "https" => Ok(()),
            scheme => Err(Error::invalid_argument(format!(
                "backend url scheme {scheme} is not supported"
            ))),
        }
    }
}

impl std::str::FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;

        trace!("backend url: {}", config.backend_url);
        Ok(config)
    }
}
