//! Playback analytics collector.
//!
//! Events reported by a player are held back until the license key has been
//! authenticated, then flushed to a backend in the order they were reported.
//! After that, events pass straight through.
//!
//! * [`listener`] - playback notifications and the collector that records them
//! * [`dispatcher`] - buffering and flushing of records
//! * [`backend`] - where records go once released
//! * [`license`] - the licensing service the dispatcher waits for
//! * [`error_details`] - detailed error reports, a licensed feature
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod error_details;
pub mod events;
pub mod license;
pub mod listener;
pub mod queue;
