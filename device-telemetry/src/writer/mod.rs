//! Persistence side of the pipeline: points, the store seam, and the
//! batch writer that drains decoded measurements into the store.

mod batch;
mod point;
mod store;

pub use batch::{BatchWriter, WriterReport};
pub use point::{DEVICE_ID_TAG, DEVICE_VALUES, FieldValue, Point, VALUE_FIELD};
pub use store::{InfluxStore, TimeSeriesStore};
