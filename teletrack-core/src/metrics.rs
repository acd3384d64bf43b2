//! Metrics sink capability.
//!
//! Processing stages report diagnostic quantities (residuals, pulls, fit
//! probabilities, ...) through a sink handed to them by the caller instead of
//! writing into shared histograms.

/// Receiver for named diagnostic values.
pub trait MetricsSink: Send + Sync {
    /// Records one or more values under `name`.
    fn record(&self, name: &str, values: &[f64]);
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    #[inline]
    fn record(&self, _name: &str, _values: &[f64]) {}
}

impl<S: MetricsSink + ?Sized> MetricsSink for &S {
    fn record(&self, name: &str, values: &[f64]) {
        (**self).record(name, values);
    }
}
