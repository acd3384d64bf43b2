//! Metric summaries.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use teletrack_core::MetricsSink;

/// Running summary of one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Number of values.
    pub count: u64,
    /// Arithmetic mean.
    pub mean: f64,
    /// Root mean square.
    pub rms: f64,
    /// Smallest value.
    pub min: f64,
    /// Largest value.
    pub max: f64,
}

#[derive(Debug, Clone, Copy)]
struct Accumulator {
    count: u64,
    sum: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
}

impl Default for Accumulator {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            sum_sq: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl Accumulator {
    fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    #[allow(clippy::cast_precision_loss)]
    fn summary(&self) -> Summary {
        let n = self.count.max(1) as f64;
        Summary {
            count: self.count,
            mean: self.sum / n,
            rms: (self.sum_sq / n).sqrt(),
            min: self.min,
            max: self.max,
        }
    }
}

/// Metrics sink keeping count, mean, rms and extrema per metric name.
///
/// Non-finite values are counted separately and left out of the summary.
#[derive(Debug, Default)]
pub struct SummarySink {
    metrics: Mutex<BTreeMap<String, Accumulator>>,
    non_finite: Mutex<BTreeMap<String, u64>>,
}

impl SummarySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Summaries of all metrics seen so far, by name.
    #[must_use]
    pub fn summaries(&self) -> BTreeMap<String, Summary> {
        self.metrics
            .lock()
            .map(|m| m.iter().map(|(k, a)| (k.clone(), a.summary())).collect())
            .unwrap_or_default()
    }

    /// Summary of one metric.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Summary> {
        self.metrics
            .lock()
            .ok()
            .and_then(|m| m.get(name).map(Accumulator::summary))
    }

    /// Number of non-finite values dropped for `name`.
    #[must_use]
    pub fn non_finite(&self, name: &str) -> u64 {
        self.non_finite
            .lock()
            .ok()
            .and_then(|m| m.get(name).copied())
            .unwrap_or(0)
    }

    /// Writes all summaries as a JSON object keyed by metric name.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, &self.summaries())?;
        writer.flush()?;
        Ok(())
    }
}

impl MetricsSink for SummarySink {
    fn record(&self, name: &str, values: &[f64]) {
        let (finite, dropped) = values.iter().fold((Vec::new(), 0u64), |(mut f, d), &v| {
            if v.is_finite() {
                f.push(v);
                (f, d)
            } else {
                (f, d + 1)
            }
        });
        if !finite.is_empty() {
            if let Ok(mut metrics) = self.metrics.lock() {
                let acc = metrics.entry(name.to_string()).or_default();
                for v in finite {
                    acc.push(v);
                }
            }
        }
        if dropped > 0 {
            if let Ok(mut counts) = self.non_finite.lock() {
                *counts.entry(name.to_string()).or_default() += dropped;
            }
        }
    }
}
