//! teletrack-core: Core types for beam-telescope track reconstruction.
//!
//! This crate provides the data model shared by the tracking algorithms:
//! hits and per-event hit tables, cluster shapes, detector geometry with
//! footprint-dependent resolutions, alignment constants and policy, the
//! tracking configuration and the metrics-sink capability.
//!

pub mod alignment;
pub mod cluster;
pub mod config;
pub mod error;
pub mod geometry;
pub mod hit;
pub mod metrics;

pub use alignment::{AlignmentConstant, AlignmentConstants, AlignmentPolicy, Dof};
pub use cluster::{ClusterShape, GeometricPixel, Pixel};
pub use config::{LayerTriple, TrackingConfig};
pub use error::{Error, Result};
pub use geometry::{Geometry, Layer, LayerId, ResolutionTable, SensorGeometry, MAX_LAYER_ID};
pub use hit::{Footprint, Hit, HitId, HitRecord, HitTable};
pub use metrics::{MetricsSink, NullSink};
