//! device-telemetry library crate.
//!
//! Virtual devices tick on their own intervals and publish measurements to a
//! topic exchange; a single consumer drains the bound queue and a writer
//! persists each reading as a time-series point.
//!
//! ```text
//! TickerCoordinator -> DeviceEmitter* -> Publisher -> [exchange] -> [queue]
//!     -> MeasurementConsumer -> BatchWriter -> TimeSeriesStore
//! ```

pub mod broker;
pub mod config;
pub mod consumer;
pub mod domain;
pub mod emitter;
pub mod error;
pub mod logging;
pub mod registry;
pub mod service;
pub mod utils;
pub mod writer;

pub use error::{Error, Result};
