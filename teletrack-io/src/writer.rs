//! Alignment record writers.
//!
//! Records are written either as Millepede-II binary records or as CSV with
//! one row per global label. Both writers serialise each record under a
//! lock, so records emitted from several threads never interleave.

use crate::Result;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use teletrack_algorithms::{AlignmentRecord, Axis, RecordSink};

fn poisoned() -> std::io::Error {
    std::io::Error::other("record writer poisoned")
}

struct Locked {
    writer: BufWriter<File>,
    records: usize,
}

impl Locked {
    fn create(path: &Path) -> Result<Mutex<Self>> {
        let file = File::create(path)?;
        Ok(Mutex::new(Self {
            writer: BufWriter::new(file),
            records: 0,
        }))
    }
}

fn lock(inner: &Mutex<Locked>) -> std::io::Result<MutexGuard<'_, Locked>> {
    inner.lock().map_err(|_| poisoned())
}

/// Writer for Millepede-II binary records.
///
/// Each record is `n: i32`, then `n / 2` f32 values, then `n / 2` i32
/// values. The arrays start with a `(0.0, 0)` pair; every measured axis then
/// adds `(residual, 0)`, `(sigma, 0)` and one `(derivative, label)` pair per
/// non-zero derivative.
pub struct MilleWriter {
    inner: Mutex<Locked>,
}

impl MilleWriter {
    /// Creates a new binary file, truncating an existing one.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            inner: Locked::create(path.as_ref())?,
        })
    }

    /// Number of records written so far.
    #[must_use]
    pub fn records(&self) -> usize {
        self.inner.lock().map_or(0, |l| l.records)
    }

    /// Flushes the writer.
    ///
    /// # Errors
    /// Returns an error if the flush fails.
    pub fn flush(&self) -> Result<()> {
        lock(&self.inner)?.writer.flush()?;
        Ok(())
    }
}

/// Float and integer arrays of one binary record.
#[allow(clippy::cast_possible_truncation)]
fn mille_arrays(record: &AlignmentRecord) -> (Vec<f32>, Vec<i32>) {
    let mut floats = vec![0.0f32];
    let mut labels = vec![0i32];
    for block in &record.blocks {
        floats.push(block.residual as f32);
        labels.push(0);
        floats.push(block.sigma() as f32);
        labels.push(0);
        for (&derivative, &label) in block.derivatives.iter().zip(&block.labels) {
            if derivative != 0.0 {
                floats.push(derivative as f32);
                labels.push(label);
            }
        }
    }
    (floats, labels)
}

impl RecordSink for MilleWriter {
    fn emit(&self, record: &AlignmentRecord) -> std::io::Result<()> {
        if record.is_empty() {
            return Ok(());
        }
        let (floats, labels) = mille_arrays(record);
        let words = i32::try_from(2 * floats.len())
            .map_err(|_| std::io::Error::other("alignment record too large"))?;

        let mut guard = lock(&self.inner)?;
        let w = &mut guard.writer;
        w.write_all(&words.to_le_bytes())?;
        for v in &floats {
            w.write_all(&v.to_le_bytes())?;
        }
        for v in &labels {
            w.write_all(&v.to_le_bytes())?;
        }
        guard.records += 1;
        Ok(())
    }
}

/// Writer for alignment records as CSV, one row per label.
pub struct CsvRecordWriter {
    inner: Mutex<Locked>,
}

impl CsvRecordWriter {
    /// Column names.
    pub const HEADER: &'static str = "event,chi2,ndf,layer,axis,residual,sigma,label,derivative";

    /// Creates a new CSV file and writes the header.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let inner = Locked::create(path.as_ref())?;
        writeln!(lock(&inner)?.writer, "{}", Self::HEADER)?;
        Ok(Self { inner })
    }

    /// Number of records written so far.
    #[must_use]
    pub fn records(&self) -> usize {
        self.inner.lock().map_or(0, |l| l.records)
    }

    /// Flushes the writer.
    ///
    /// # Errors
    /// Returns an error if the flush fails.
    pub fn flush(&self) -> Result<()> {
        lock(&self.inner)?.writer.flush()?;
        Ok(())
    }
}

impl RecordSink for CsvRecordWriter {
    fn emit(&self, record: &AlignmentRecord) -> std::io::Result<()> {
        if record.is_empty() {
            return Ok(());
        }
        let mut guard = lock(&self.inner)?;
        for block in &record.blocks {
            let axis = match block.axis {
                Axis::X => "x",
                Axis::Y => "y",
            };
            for (label, derivative) in block.labels.iter().zip(&block.derivatives) {
                writeln!(
                    guard.writer,
                    "{},{},{},{},{},{},{},{},{}",
                    record.event,
                    record.chi2,
                    record.ndf,
                    block.layer,
                    axis,
                    block.residual,
                    block.sigma(),
                    label,
                    derivative
                )?;
            }
        }
        guard.records += 1;
        Ok(())
    }
}

/// Record writer chosen from the output file extension.
pub enum RecordWriter {
    /// Millepede-II binary output.
    Mille(MilleWriter),
    /// CSV output.
    Csv(CsvRecordWriter),
}

impl RecordWriter {
    /// Creates a CSV writer for `.csv` paths and a binary writer otherwise.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let is_csv = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        if is_csv {
            Ok(Self::Csv(CsvRecordWriter::create(path)?))
        } else {
            Ok(Self::Mille(MilleWriter::create(path)?))
        }
    }

    /// Number of records written so far.
    #[must_use]
    pub fn records(&self) -> usize {
        match self {
            Self::Mille(w) => w.records(),
            Self::Csv(w) => w.records(),
        }
    }

    /// Flushes the writer.
    ///
    /// # Errors
    /// Returns an error if the flush fails.
    pub fn flush(&self) -> Result<()> {
        match self {
            Self::Mille(w) => w.flush(),
            Self::Csv(w) => w.flush(),
        }
    }
}

impl RecordSink for RecordWriter {
    fn emit(&self, record: &AlignmentRecord) -> std::io::Result<()> {
        match self {
            Self::Mille(w) => w.emit(record),
            Self::Csv(w) => w.emit(record),
        }
    }
}
