//! teletrack-io: Run configuration and file I/O for teletrack.
//!
//! This crate provides the JSON run configuration, memory-mapped hit file
//! reading via memmap2, hit file writing, alignment record writers and a
//! summarising metrics sink.
//!

pub mod config;
mod error;
mod metrics;
mod reader;
mod writer;

pub use config::{AlignmentArrays, RunConfig, RunFile};
pub use error::{Error, Result};
pub use metrics::{Summary, SummarySink};
pub use reader::{EventRecords, HitFileReader, HitFileWriter, MappedFileReader, HIT_RECORD_SIZE};
pub use writer::{CsvRecordWriter, MilleWriter, RecordWriter};
