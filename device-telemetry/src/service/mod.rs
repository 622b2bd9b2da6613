//! Service layer: the controller that owns the pipeline lifecycle.

pub mod measurement;

pub use measurement::{MeasurementService, ShutdownReport};
