//! Drain loop turning measurements into store writes.
//!
//! By default every measurement becomes one point written on its own. With a
//! [`BatchWindow`] configured, points are buffered and flushed when the buffer
//! is full, when the flush interval elapses, or when the input closes.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::point::Point;
use super::store::TimeSeriesStore;
use crate::config::{BatchWindow, WriterConfig};
use crate::domain::Measurement;
use crate::{Error, Result};

/// Counters reported when the writer stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterReport {
    pub points_written: u64,
    pub points_dropped: u64,
    pub failed_writes: u64,
}

/// Persists measurements to a [`TimeSeriesStore`].
pub struct BatchWriter<S: ?Sized> {
    store: Arc<S>,
    config: WriterConfig,
}

impl<S> BatchWriter<S>
where
    S: TimeSeriesStore + ?Sized + 'static,
{
    pub fn new(store: Arc<S>, config: WriterConfig) -> Self {
        Self { store, config }
    }

    /// Spawn the drain loop.
    ///
    /// The loop runs until `measurements` closes or `cancel` fires. The store
    /// is closed afterwards in every case, including when the loop panics.
    pub fn start(
        self,
        measurements: mpsc::Receiver<Measurement>,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<WriterReport>> {
        tokio::spawn(self.run(measurements, cancel))
    }

    async fn run(
        self,
        measurements: mpsc::Receiver<Measurement>,
        cancel: CancellationToken,
    ) -> Result<WriterReport> {
        info!(window = ?self.config.window, "Batch writer started");

        let drained = AssertUnwindSafe(drain(
            self.store.as_ref(),
            self.config.window,
            measurements,
            cancel,
        ))
        .catch_unwind()
        .await;

        if let Err(e) = self.store.close().await {
            warn!(error = %e, "Failed to close time-series store");
        }

        match drained {
            Ok(report) => {
                info!(
                    written = report.points_written,
                    dropped = report.points_dropped,
                    failed_writes = report.failed_writes,
                    "Batch writer stopped"
                );
                Ok(report)
            }
            Err(_) => {
                error!("Batch writer loop panicked");
                Err(Error::Other("batch writer loop panicked".to_string()))
            }
        }
    }
}

async fn drain<S>(
    store: &S,
    window: Option<BatchWindow>,
    mut measurements: mpsc::Receiver<Measurement>,
    cancel: CancellationToken,
) -> WriterReport
where
    S: TimeSeriesStore + ?Sized,
{
    let max_points = window.map_or(1, |w| w.max_points.max(1));
    let mut flush_timer = window.map(|w| {
        let mut timer = interval(w.flush_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        timer
    });

    let mut report = WriterReport::default();
    let mut buffer: Vec<Point> = Vec::with_capacity(max_points);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(buffered = buffer.len(), "Batch writer cancelled");
                break;
            }
            received = measurements.recv() => {
                let Some(measurement) = received else {
                    debug!("Measurement channel closed");
                    break;
                };
                buffer.push(Point::from_measurement(&measurement, Utc::now()));
                if buffer.len() >= max_points
                    && !flush(store, &mut buffer, &mut report, &cancel).await
                {
                    break;
                }
            }
            _ = tick(&mut flush_timer) => {
                if !buffer.is_empty()
                    && !flush(store, &mut buffer, &mut report, &cancel).await
                {
                    break;
                }
            }
        }
    }

    if !buffer.is_empty() {
        if cancel.is_cancelled() {
            report.points_dropped += buffer.len() as u64;
            warn!(points = buffer.len(), "Buffered points dropped on cancel");
        } else {
            flush(store, &mut buffer, &mut report, &cancel).await;
        }
    }
    report
}

/// Tick the flush timer, or never resolve when batching is off.
async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Write the buffered points. Returns `false` when `cancel` fired while the
/// write was pending; the abandoned points count as dropped.
async fn flush<S>(
    store: &S,
    buffer: &mut Vec<Point>,
    report: &mut WriterReport,
    cancel: &CancellationToken,
) -> bool
where
    S: TimeSeriesStore + ?Sized,
{
    let points = std::mem::take(buffer);
    let count = points.len() as u64;

    let written = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            report.points_dropped += count;
            warn!(points = count, "Time-series write abandoned on cancel");
            return false;
        }
        written = store.write(&points) => written,
    };

    match written {
        Ok(()) => report.points_written += count,
        Err(e) => {
            report.failed_writes += 1;
            report.points_dropped += count;
            error!(points = count, error = %e, "Time-series write failed");
        }
    }
    true
}
