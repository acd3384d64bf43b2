//! Per-event track reconstruction pipeline.
//!
//! An event goes through triplet search on both arms, segment matching,
//! interior-hit association and, per candidate, trajectory building, fitting,
//! selection and alignment accumulation. Nothing is kept between events; the
//! run-wide state lives in a read-only [`TrackingContext`].

use crate::alignment::{AlignmentAccumulator, AlignmentRecord, RecordSink};
use crate::error::FitError;
use crate::fitter::{FitResult, Fitter};
use crate::matching::{SegmentMatcher, TrackCandidate};
use crate::scattering::ScatteringModel;
use crate::trajectory::TrajectoryBuilder;
use crate::triplet::{Triplet, TripletFinder};
use rayon::prelude::*;
use teletrack_core::alignment::{AlignmentConstants, AlignmentPolicy};
use teletrack_core::config::TrackingConfig;
use teletrack_core::error::{Error, Result};
use teletrack_core::geometry::{Geometry, LayerId};
use teletrack_core::hit::HitTable;
use teletrack_core::metrics::MetricsSink;
use tracing::{debug, warn};

/// Run-wide, read-only reconstruction state.
#[derive(Debug, Clone)]
pub struct TrackingContext {
    geometry: Geometry,
    config: TrackingConfig,
    policy: AlignmentPolicy,
    alignment: AlignmentConstants,
    scattering: ScatteringModel,
    reference_z: f64,
    interior: Vec<(LayerId, f64)>,
}

impl TrackingContext {
    /// Validates the configuration and derives the scattering weights.
    ///
    /// Policy entries for unknown layers are dropped with a warning.
    ///
    /// # Errors
    /// Returns an error if the configuration does not fit the geometry.
    pub fn new(geometry: Geometry, config: TrackingConfig, mut policy: AlignmentPolicy) -> Result<Self> {
        config.validate(&geometry)?;
        policy.retain_known(&geometry);

        let scattering = ScatteringModel::new(&geometry, config.beam_energy, config.highland_scale);
        let reference_z = config.matching_plane(&geometry);
        let interior = geometry
            .layers()
            .iter()
            .filter(|layer| !config.is_telescope_layer(layer.id))
            .map(|layer| (layer.id, layer.z))
            .collect();

        Ok(Self {
            geometry,
            config,
            policy,
            alignment: AlignmentConstants::new(),
            scattering,
            reference_z,
            interior,
        })
    }

    /// Detector geometry.
    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Tracking configuration.
    #[must_use]
    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    /// Alignment policy.
    #[must_use]
    pub fn policy(&self) -> &AlignmentPolicy {
        &self.policy
    }

    /// Sets the alignment constants the hits were placed with.
    ///
    /// Constants for unknown layers are dropped with a warning.
    #[must_use]
    pub fn with_alignment(mut self, mut alignment: AlignmentConstants) -> Self {
        alignment.retain_known(&self.geometry);
        self.alignment = alignment;
        self
    }

    /// Alignment constants.
    #[must_use]
    pub fn alignment(&self) -> &AlignmentConstants {
        &self.alignment
    }

    /// Scattering weights.
    #[must_use]
    pub fn scattering(&self) -> &ScatteringModel {
        &self.scattering
    }

    /// Matching plane (mm).
    #[must_use]
    pub fn reference_z(&self) -> f64 {
        self.reference_z
    }

    /// Layers outside both triples, with their z.
    #[must_use]
    pub fn interior_layers(&self) -> &[(LayerId, f64)] {
        &self.interior
    }

    fn finder(&self) -> TripletFinder {
        TripletFinder::new(self.config.triplet_residual_cut, self.config.triplet_slope_cut)
    }

    fn matcher(&self) -> SegmentMatcher {
        SegmentMatcher::new(self.reference_z, self.config.match_cut, self.config.interior_cut)
    }
}

/// Why a candidate did not make it into the alignment input.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// The fit failed.
    Fit(FitError),
    /// Fit probability below the threshold.
    Probability(f64),
    /// chi2 / ndf above the threshold.
    Chi2Ndf(f64),
}

/// An accepted track.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedTrack {
    /// The matched segments.
    pub candidate: TrackCandidate,
    /// The fit.
    pub fit: FitResult,
    /// Alignment input built from the fit.
    pub record: AlignmentRecord,
}

/// Fate of one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackOutcome {
    /// Fitted and selected.
    Accepted(Box<AcceptedTrack>),
    /// Rejected, with the reason.
    Rejected(Rejection),
}

impl TrackOutcome {
    /// The accepted track, if any.
    #[must_use]
    pub fn accepted(&self) -> Option<&AcceptedTrack> {
        match self {
            TrackOutcome::Accepted(track) => Some(track),
            TrackOutcome::Rejected(_) => None,
        }
    }
}

/// Output of one event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventResult {
    /// Event number.
    pub event: u64,
    /// Upstream triplets found.
    pub upstream: Vec<Triplet>,
    /// Downstream triplets found.
    pub downstream: Vec<Triplet>,
    /// One outcome per matched candidate.
    pub tracks: Vec<TrackOutcome>,
}

impl EventResult {
    /// Accepted tracks.
    pub fn accepted(&self) -> impl Iterator<Item = &AcceptedTrack> {
        self.tracks.iter().filter_map(TrackOutcome::accepted)
    }
}

/// Counters over many events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStatistics {
    /// Events processed.
    pub events: u64,
    /// Events skipped for lack of hits.
    pub skipped: u64,
    /// Upstream triplets.
    pub upstream_triplets: u64,
    /// Downstream triplets.
    pub downstream_triplets: u64,
    /// Matched candidates.
    pub candidates: u64,
    /// Tracks that passed the selection.
    pub accepted: u64,
    /// Candidates whose fit failed.
    pub failed_fits: u64,
    /// Fitted candidates rejected by the quality cuts.
    pub rejected: u64,
    /// Records handed to the sink.
    pub records: u64,
}

impl RunStatistics {
    /// Counters of one event.
    #[must_use]
    pub fn from_event(result: &EventResult) -> Self {
        let mut stats = Self {
            events: 1,
            upstream_triplets: result.upstream.len() as u64,
            downstream_triplets: result.downstream.len() as u64,
            candidates: result.tracks.len() as u64,
            ..Self::default()
        };
        for outcome in &result.tracks {
            match outcome {
                TrackOutcome::Accepted(_) => stats.accepted += 1,
                TrackOutcome::Rejected(Rejection::Fit(_)) => stats.failed_fits += 1,
                TrackOutcome::Rejected(_) => stats.rejected += 1,
            }
        }
        stats
    }

    /// Adds another set of counters.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            events: self.events + other.events,
            skipped: self.skipped + other.skipped,
            upstream_triplets: self.upstream_triplets + other.upstream_triplets,
            downstream_triplets: self.downstream_triplets + other.downstream_triplets,
            candidates: self.candidates + other.candidates,
            accepted: self.accepted + other.accepted,
            failed_fits: self.failed_fits + other.failed_fits,
            rejected: self.rejected + other.rejected,
            records: self.records + other.records,
        }
    }
}

/// Reconstructs one event.
///
/// # Errors
/// Returns [`Error::DataUnavailable`] if the event holds no hits.
pub fn process_event(
    ctx: &TrackingContext,
    hits: &HitTable,
    metrics: &dyn MetricsSink,
) -> Result<EventResult> {
    let event = hits.event();
    if hits.is_empty() {
        return Err(Error::DataUnavailable { event });
    }

    let finder = ctx.finder();
    let (upstream, downstream) = rayon::join(
        || finder.find(hits, ctx.config.upstream),
        || finder.find(hits, ctx.config.downstream),
    );
    for (name, triplets) in [("triplet/upstream", &upstream), ("triplet/downstream", &downstream)] {
        for t in triplets {
            metrics.record(name, &[t.residual.x, t.residual.y]);
        }
    }

    let matcher = ctx.matcher();
    let mut candidates = matcher.match_segments(&upstream, &downstream);
    for candidate in &mut candidates {
        matcher.associate_interior(candidate, hits, &ctx.interior);
        metrics.record("match/mismatch", &[candidate.mismatch]);
        metrics.record("match/kink", &[candidate.kink.x, candidate.kink.y]);
    }
    debug!(
        event,
        upstream = upstream.len(),
        downstream = downstream.len(),
        candidates = candidates.len(),
        "candidates matched"
    );

    let tracks = candidates
        .into_par_iter()
        .map(|candidate| process_candidate(ctx, hits, candidate, metrics))
        .collect();

    Ok(EventResult {
        event,
        upstream,
        downstream,
        tracks,
    })
}

fn process_candidate(
    ctx: &TrackingContext,
    hits: &HitTable,
    candidate: TrackCandidate,
    metrics: &dyn MetricsSink,
) -> TrackOutcome {
    let event = hits.event();
    let nodes = TrajectoryBuilder::new(&ctx.geometry, &ctx.scattering, &ctx.policy).build(&candidate, hits);
    let fit = match Fitter::new().fit(nodes) {
        Ok(fit) => fit,
        Err(err) => {
            debug!(event, %err, "fit failed");
            return TrackOutcome::Rejected(Rejection::Fit(err));
        }
    };

    metrics.record("fit/chi2_ndf", &[fit.chi2_ndf()]);
    metrics.record("fit/probability", &[fit.probability]);

    if fit.probability < ctx.config.min_probability {
        debug!(event, probability = fit.probability, "track rejected");
        return TrackOutcome::Rejected(Rejection::Probability(fit.probability));
    }
    let chi2_ndf = fit.chi2_ndf();
    if fit.ndf > 0 && chi2_ndf > ctx.config.max_chi2_ndf {
        debug!(event, chi2_ndf, "track rejected");
        return TrackOutcome::Rejected(Rejection::Chi2Ndf(chi2_ndf));
    }

    for (node, measurement) in fit.measured() {
        if let Some(layer) = node.layer() {
            let r = measurement.residual;
            metrics.record(&format!("layer{layer}/residual"), &[r.residual.x, r.residual.y]);
            metrics.record(&format!("layer{layer}/pull"), &[r.pull.x, r.pull.y]);
        }
    }
    for kink in fit.nodes.iter().filter_map(|n| n.kink) {
        metrics.record("fit/kink_pull", &[kink.pull.x, kink.pull.y]);
    }

    let record = AlignmentAccumulator::new(&ctx.policy)
        .with_alignment(&ctx.alignment)
        .accumulate(event, &fit);
    TrackOutcome::Accepted(Box::new(AcceptedTrack {
        candidate,
        fit,
        record,
    }))
}

/// Reconstructs many events in parallel and hands every non-empty record
/// of an accepted track to `sink`.
///
/// Events without hits are counted as skipped.
///
/// # Errors
/// Returns the first error reported by the sink.
pub fn process_events(
    ctx: &TrackingContext,
    events: &[HitTable],
    sink: &dyn RecordSink,
    metrics: &dyn MetricsSink,
) -> std::io::Result<RunStatistics> {
    events
        .par_iter()
        .map(|hits| match process_event(ctx, hits, metrics) {
            Ok(result) => {
                let mut stats = RunStatistics::from_event(&result);
                for track in result.accepted() {
                    if !track.record.is_empty() {
                        sink.emit(&track.record)?;
                        stats.records += 1;
                    }
                }
                Ok(stats)
            }
            Err(err) => {
                warn!(event = hits.event(), %err, "event skipped");
                Ok(RunStatistics {
                    events: 1,
                    skipped: 1,
                    ..RunStatistics::default()
                })
            }
        })
        .try_reduce(RunStatistics::default, |a, b| Ok(a.merge(b)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use teletrack_core::config::LayerTriple;
    use teletrack_core::geometry::{Layer, ResolutionTable};
    use teletrack_core::hit::HitRecord;
    use teletrack_core::metrics::NullSink;

    fn geometry() -> Geometry {
        let z = [0.0, 150.0, 300.0, 450.0, 600.0, 750.0, 900.0];
        let layers = z.iter().zip(0..).map(|(&z, id)| Layer::new(id, z, 5.5e-4)).collect();
        let mut tables = BTreeMap::new();
        tables.insert(0, ResolutionTable::uniform(4e-3));
        Geometry::new(layers, tables).unwrap()
    }

    fn context() -> TrackingContext {
        let config = TrackingConfig::new()
            .with_triples(LayerTriple::new(0, 1, 2), LayerTriple::new(4, 5, 6))
            .with_beam_energy(120.0);
        TrackingContext::new(geometry(), config, AlignmentPolicy::new()).unwrap()
    }

    fn straight_event(event: u64, x0: f64) -> HitTable {
        let geometry = geometry();
        let records: Vec<HitRecord> = geometry
            .layers()
            .iter()
            .map(|l| HitRecord::at(l.id, x0 + 1e-3 * l.z, -5e-4 * l.z, l.z))
            .collect();
        HitTable::from_records(event, &records, &geometry)
    }

    #[test]
    fn test_context_interior_layers() {
        let ctx = context();
        assert_eq!(ctx.interior_layers(), &[(3, 450.0)]);
        assert!((ctx.reference_z() - 450.0).abs() < 1e-12);
    }

    #[test]
    fn test_single_track_event() {
        let ctx = context();
        let result = process_event(&ctx, &straight_event(3, 0.5), &NullSink).unwrap();
        assert_eq!(result.upstream.len(), 1);
        assert_eq!(result.downstream.len(), 1);
        assert_eq!(result.tracks.len(), 1);
        let track = result.accepted().next().unwrap();
        assert_eq!(track.candidate.interior.get(&3), Some(&3));
        // 7 measured layers with 3 free parameters each, two axes.
        assert_eq!(track.record.blocks.len(), 14);
        assert_eq!(track.fit.ndf, 9);
    }

    #[test]
    fn test_empty_event_is_unavailable() {
        let ctx = context();
        let empty = HitTable::from_records(9, &[], ctx.geometry());
        assert!(matches!(
            process_event(&ctx, &empty, &NullSink),
            Err(Error::DataUnavailable { event: 9 })
        ));
    }

    #[test]
    fn test_process_events_counts() {
        let ctx = context();
        let events = vec![
            straight_event(0, 0.0),
            HitTable::from_records(1, &[], ctx.geometry()),
            straight_event(2, 1.0),
        ];
        let sink = Mutex::new(Vec::new());
        let stats = process_events(&ctx, &events, &sink, &NullSink).unwrap();
        assert_eq!(stats.events, 3);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.records, 2);
        assert_eq!(sink.lock().unwrap().len(), 2);
    }
}
