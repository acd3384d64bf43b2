//! teletrack-algorithms: Track finding, fitting and alignment input.
//!
//! This crate provides the reconstruction chain of a beam telescope:
//! - **Triplets** - three-hit segments on each telescope arm
//! - **Matching** - upstream/downstream pairing at a common plane
//! - **Trajectories** - node sequences with thin scatterers for the fit
//! - **Broken lines** - banded global least-squares fit with kinks
//! - **Alignment** - residual derivatives for a global alignment solver
//!
#![warn(missing_docs)]

mod alignment;
mod band;
mod error;
mod fitter;
mod matching;
mod processing;
mod scattering;
pub mod simulation;
mod trajectory;
mod triplet;

pub use alignment::{
    residual_derivatives, AlignmentAccumulator, AlignmentRecord, Axis, MeasurementBlock,
    RecordSink,
};
pub use band::{BandInverse, BorderedBandMatrix};
pub use error::FitError;
pub use fitter::{chi2_probability, FitResult, FittedMeasurement, FittedNode, FittedResidual, Fitter};
pub use matching::{SegmentMatcher, StraightLine, TrackCandidate};
pub use processing::{
    process_event, process_events, AcceptedTrack, EventResult, Rejection, RunStatistics,
    TrackOutcome, TrackingContext,
};
pub use scattering::{
    GapScattering, LayerScattering, ScatteringModel, AIR_RADIATION_LENGTH_MM,
    AIR_SCATTERER_POSITIONS,
};
pub use simulation::{SimulationConfig, Simulator};
pub use trajectory::{
    straight_jacobian, Measurement, Node, NodeKind, NodeSequence, TrajectoryBuilder,
};
pub use triplet::{Triplet, TripletFinder};
