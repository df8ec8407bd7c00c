use std::{process, sync::Arc};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, trace, warn, LevelFilter};
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    runtime::Handle,
    sync::watch,
};

use fcanalytics::{
    backend::LogBackend,
    config::Config,
    dispatcher::{DispatcherState, EventDataDispatcher},
    error::Result,
    error_details::{ErrorDetail, ErrorDetailBackend},
    events::{AdEventData, EventData},
    license::{FeatureConfigContainer, LicenseCallback, TimedAuthenticator},
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    ///
    /// Holds the license key, so keep it private.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("analytics.toml"), env = "FCANALYTICS_CONFIG")]
    config_file: String,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// One line of input.
///
/// ```json
/// {"type": "event", "impressionId": "…", "state": "playing", "duration": 5000, "time": 0}
/// {"type": "ad", "impressionId": "…", "time": 0}
/// {"type": "error", "impressionId": "…", "code": 2001, "message": "…", "timestamp": 0}
/// {"type": "reset"}
/// {"type": "disable"}
/// ```
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Record {
    Event(EventData),
    Ad(AdEventData),
    Error(ErrorDetail),
    Reset,
    Disable,
}

/// Configures features and publishes licensing outcomes to the main loop.
struct LicenseWatch {
    error_details: Arc<ErrorDetailBackend>,
    outcome: watch::Sender<Option<bool>>,
}

impl LicenseCallback for LicenseWatch {
    fn configure_features(&self, success: bool, feature_config: &FeatureConfigContainer) {
        if success {
            for (feature, settings) in feature_config.iter() {
                debug!("feature {feature}: {settings}");
            }
        }
        self.error_details.configure_features(success, feature_config);
    }

    fn authentication_completed(&self, success: bool) {
        self.outcome.send_replace(Some(success));
    }
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

fn dispatch(
    dispatcher: &Arc<EventDataDispatcher>,
    error_details: &ErrorDetailBackend,
    line: &str,
) -> Result<()> {
    match serde_json::from_str::<Record>(line)? {
        Record::Event(event) => dispatcher.add(event),
        Record::Ad(event) => dispatcher.add_ad(event),
        Record::Error(detail) => error_details.send(detail),
        Record::Reset => dispatcher.reset_source_related_state(),
        Record::Disable => {
            dispatcher.disable();
            dispatcher.enable();
        }
    }

    Ok(())
}

/// Waits until no authentication request is outstanding.
///
/// Outcomes of earlier requests do not count: after a `disable` record the
/// dispatcher authenticates again, and only that request's completion ends
/// the wait.
async fn await_authentication(
    dispatcher: &EventDataDispatcher,
    outcome_rx: &mut watch::Receiver<Option<bool>>,
) {
    loop {
        // Mark the current outcome seen before looking at the dispatcher,
        // so a completion in between still wakes `changed`.
        let last_outcome = *outcome_rx.borrow_and_update();
        trace!("last license outcome: {last_outcome:?}");
        if dispatcher.state() == DispatcherState::Enabled || !dispatcher.is_authenticating() {
            return;
        }

        info!("waiting for license authentication");
        if outcome_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Main application loop.
///
/// Reads records from standard input until it closes, then waits for an
/// outstanding authentication so buffered events get their chance.
async fn run(args: Args) -> Result<()> {
    let config = Config::from_file(&args.config_file)?;
    let (outcome_tx, mut outcome_rx) = watch::channel(None);

    let authenticator = TimedAuthenticator::from_config(Handle::current(), &config);
    let dispatcher = EventDataDispatcher::new(config, &LogBackend::factory());
    let error_details = Arc::new(ErrorDetailBackend::new(Arc::clone(dispatcher.backend())));
    let dispatcher = Arc::new(
        dispatcher
            .with_authenticator(Arc::new(authenticator))
            .with_license_callback(Arc::new(LicenseWatch {
                error_details: Arc::clone(&error_details),
                outcome: outcome_tx,
            })),
    );
    dispatcher.enable();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            // Prioritize shutdown signals.
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down gracefully");
                break;
            }

            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };

                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                if let Err(e) = dispatch(&dispatcher, &error_details, line) {
                    error!("skipping record: {e}");
                }
            }
        }
    }

    tokio::select! {
        () = await_authentication(&dispatcher, &mut outcome_rx) => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    let unsent =
        dispatcher.pending_events() + dispatcher.pending_ad_events() + error_details.pending();
    if unsent > 0 {
        warn!("{unsent} events were never sent");
    }

    Ok(())
}

/// Main entry point of the application.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
