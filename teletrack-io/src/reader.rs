//! Memory-mapped hit file reading and writing.
//!
//! A hit file is a flat sequence of little-endian 56-byte records:
//!
//! | offset | type  | field            |
//! |--------|-------|------------------|
//! | 0      | u32   | event number     |
//! | 4      | u32   | layer id         |
//! | 8      | f64   | global x (mm)    |
//! | 16     | f64   | global y (mm)    |
//! | 24     | f64   | global z (mm)    |
//! | 32     | f64   | local x (mm)     |
//! | 40     | f64   | local y (mm)     |
//! | 48     | u16   | footprint x      |
//! | 50     | u16   | footprint y      |
//! | 52     | u16   | footprint total  |
//! | 54     | u16   | reserved         |
//!
//! Records of one event are stored consecutively.

use crate::{Error, Result};
use memmap2::Mmap;
use nalgebra::{Point2, Point3};
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use teletrack_core::{Footprint, Geometry, HitRecord, HitTable};

/// Size of one hit record in bytes.
pub const HIT_RECORD_SIZE: usize = 56;

/// A memory-mapped file reader.
///
/// Uses memmap2 to access file contents without loading the entire file
/// into memory.
pub struct MappedFileReader {
    mmap: Mmap,
    path: PathBuf,
}

impl MappedFileReader {
    /// Opens a file for memory-mapped reading.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or memory-mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        // SAFETY: The file is opened read-only and we assume it is not modified concurrently.
        // This is the standard safety contract for memory mapping.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self {
            mmap,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Returns the file contents as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap[..]
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Returns true if the file is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Path the file was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Hits of one event as stored in a hit file.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecords {
    /// Event number.
    pub event: u64,
    /// Hits in file order.
    pub hits: Vec<HitRecord>,
}

/// Reader for hit files.
pub struct HitFileReader {
    reader: MappedFileReader,
}

impl HitFileReader {
    /// Opens a hit file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be mapped or its size is not a
    /// whole number of records.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = MappedFileReader::open(path)?;
        if reader.len() % HIT_RECORD_SIZE != 0 {
            return Err(Error::InvalidFormat(format!(
                "file size {} is not a multiple of {HIT_RECORD_SIZE} (file: {})",
                reader.len(),
                reader.path().display()
            )));
        }
        Ok(Self { reader })
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn file_size(&self) -> usize {
        self.reader.len()
    }

    /// Number of hit records in the file.
    #[must_use]
    pub fn hit_count(&self) -> usize {
        self.reader.len() / HIT_RECORD_SIZE
    }

    /// Iterates over `(event, hit)` pairs in file order.
    pub fn iter_hits(&self) -> impl Iterator<Item = (u64, HitRecord)> + '_ {
        self.reader
            .as_bytes()
            .chunks_exact(HIT_RECORD_SIZE)
            .map(decode_record)
    }

    /// Groups the hits into events.
    ///
    /// A new event starts whenever the event number changes, so an event
    /// number that reappears later in the file starts a second event.
    #[must_use]
    pub fn read_events(&self) -> Vec<EventRecords> {
        let mut events: Vec<EventRecords> = Vec::new();
        for (event, hit) in self.iter_hits() {
            match events.last_mut() {
                Some(current) if current.event == event => current.hits.push(hit),
                _ => events.push(EventRecords {
                    event,
                    hits: vec![hit],
                }),
            }
        }
        events
    }

    /// Reads all events and builds their hit tables.
    #[must_use]
    pub fn read_tables(&self, geometry: &Geometry) -> Vec<HitTable> {
        self.read_events()
            .par_iter()
            .map(|e| HitTable::from_records(e.event, &e.hits, geometry))
            .collect()
    }
}

fn le<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

fn decode_record(bytes: &[u8]) -> (u64, HitRecord) {
    let f = |offset| f64::from_le_bytes(le(bytes, offset));
    let h = |offset| u16::from_le_bytes(le(bytes, offset));
    let event = u64::from(u32::from_le_bytes(le(bytes, 0)));
    let record = HitRecord {
        layer: u32::from_le_bytes(le(bytes, 4)),
        position: Point3::new(f(8), f(16), f(24)),
        local: Point2::new(f(32), f(40)),
        footprint: Footprint::new(h(48), h(50), h(52)),
    };
    (event, record)
}

/// Writer for hit files.
pub struct HitFileWriter {
    writer: BufWriter<File>,
    records: usize,
}

impl HitFileWriter {
    /// Creates a new hit file, truncating an existing one.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            records: 0,
        })
    }

    /// Appends the hits of one event.
    ///
    /// # Errors
    /// Returns an error if the event number does not fit the file format or
    /// the write fails.
    pub fn write_event(&mut self, event: u64, hits: &[HitRecord]) -> Result<()> {
        let event = u32::try_from(event)
            .map_err(|_| Error::InvalidFormat(format!("event number {event} exceeds u32")))?;
        for hit in hits {
            self.writer.write_all(&event.to_le_bytes())?;
            self.writer.write_all(&hit.layer.to_le_bytes())?;
            for v in [
                hit.position.x,
                hit.position.y,
                hit.position.z,
                hit.local.x,
                hit.local.y,
            ] {
                self.writer.write_all(&v.to_le_bytes())?;
            }
            for v in [hit.footprint.x, hit.footprint.y, hit.footprint.total, 0] {
                self.writer.write_all(&v.to_le_bytes())?;
            }
            self.records += 1;
        }
        Ok(())
    }

    /// Number of hit records written so far.
    #[must_use]
    pub fn records(&self) -> usize {
        self.records
    }

    /// Flushes the writer.
    ///
    /// # Errors
    /// Returns an error if the flush fails.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
