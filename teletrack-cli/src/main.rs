//! teletrack command-line interface.
//!
//! Reconstructs tracks from hit files and writes alignment records, prints
//! hit file summaries and generates toy Monte Carlo hit files.
#![allow(
    clippy::uninlined_format_args,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

use clap::{Args, Parser, Subcommand};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;
use teletrack_algorithms::{
    process_events, RunStatistics, SimulationConfig, Simulator, TrackingContext,
};
use teletrack_core::{HitTable, MetricsSink, NullSink};
use teletrack_io::{HitFileReader, HitFileWriter, RecordWriter, RunConfig, SummarySink};
use thiserror::Error;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    TeletrackIo(#[from] teletrack_io::Error),

    #[error("Core error: {0}")]
    Core(#[from] teletrack_core::Error),
}

/// Beam-telescope track reconstruction and alignment input.
#[derive(Parser)]
#[command(name = "teletrack")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbose output (debug logging unless RUST_LOG is set)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Command-line overrides of the run file's tracking section.
#[derive(Args, Debug)]
struct Overrides {
    /// Beam energy (GeV)
    #[arg(long)]
    beam_energy: Option<f64>,

    /// Triplet middle-hit residual cut (mm)
    #[arg(long)]
    residual_cut: Option<f64>,

    /// Triplet slope cut (rad)
    #[arg(long)]
    slope_cut: Option<f64>,

    /// Segment match cut at the reference plane (mm)
    #[arg(long)]
    match_cut: Option<f64>,

    /// Minimum fit probability
    #[arg(long)]
    min_probability: Option<f64>,

    /// Maximum chi2 / ndf
    #[arg(long)]
    max_chi2_ndf: Option<f64>,

    /// Layers excluded from the fit and the alignment
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<u32>,
}

impl Overrides {
    fn apply(&self, run: &mut RunConfig) {
        let tracking = &mut run.tracking;
        if let Some(v) = self.beam_energy {
            tracking.beam_energy = v;
        }
        if let Some(v) = self.residual_cut {
            tracking.triplet_residual_cut = v;
        }
        if let Some(v) = self.slope_cut {
            tracking.triplet_slope_cut = v;
        }
        if let Some(v) = self.match_cut {
            tracking.match_cut = v;
        }
        if let Some(v) = self.min_probability {
            tracking.min_probability = v;
        }
        if let Some(v) = self.max_chi2_ndf {
            tracking.max_chi2_ndf = v;
        }
        for &layer in &self.exclude {
            if run.geometry.contains(layer) {
                run.policy.excluded.insert(layer);
            } else {
                warn!(layer, "exclusion of unknown layer ignored");
            }
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Reconstruct tracks and write alignment records
    Process {
        /// Input hit file(s)
        #[arg(required = true)]
        input: Vec<PathBuf>,

        /// JSON run file
        #[arg(short, long)]
        config: PathBuf,

        /// Output file (.csv for text, binary Millepede records otherwise)
        #[arg(short, long)]
        output: PathBuf,

        /// Write metric summaries as JSON
        #[arg(long)]
        metrics: Option<PathBuf>,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Show information about a hit file
    Info {
        /// Input hit file
        input: PathBuf,
    },

    /// Generate a toy Monte Carlo hit file
    Simulate {
        /// JSON run file providing the geometry
        #[arg(short, long)]
        config: PathBuf,

        /// Output hit file
        #[arg(short, long)]
        output: PathBuf,

        /// Number of events
        #[arg(long, default_value = "1000")]
        events: usize,

        /// Tracks per event
        #[arg(long, default_value = "1")]
        tracks: usize,

        /// Mean noise hits per layer and event
        #[arg(long, default_value = "0.0")]
        noise_rate: f64,

        /// Beam energy (GeV); defaults to the run file's
        #[arg(long)]
        beam_energy: Option<f64>,

        /// Random seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Disable multiple scattering
        #[arg(long)]
        no_scattering: bool,

        /// Misalign the sensors by the run file's alignment constants
        #[arg(long)]
        misaligned: bool,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Process {
            input,
            config,
            output,
            metrics,
            overrides,
        } => {
            let mut run = RunConfig::load(&config)?;
            overrides.apply(&mut run);
            debug!(tracking = ?run.tracking, "tracking configuration");

            let ctx = TrackingContext::new(
                run.geometry.clone(),
                run.tracking.clone(),
                run.policy.clone(),
            )?
            .with_alignment(run.alignment.clone());
            info!(
                layers = ctx.geometry().len(),
                reference_z = ctx.reference_z(),
                "tracking context ready"
            );

            let writer = RecordWriter::create(&output)?;
            let summary = SummarySink::new();
            let sink: &dyn MetricsSink = if metrics.is_some() { &summary } else { &NullSink };

            let start = Instant::now();
            let mut total = RunStatistics::default();
            for path in &input {
                let reader = HitFileReader::open(path)?;
                let tables: Vec<HitTable> = reader
                    .read_events()
                    .into_par_iter()
                    .map(|mut e| {
                        run.apply_alignment(&mut e.hits);
                        HitTable::from_records(e.event, &e.hits, ctx.geometry())
                    })
                    .collect();

                let stats = process_events(&ctx, &tables, &writer, sink)?;
                writer.flush()?;
                info!(
                    file = %path.display(),
                    events = stats.events,
                    skipped = stats.skipped,
                    candidates = stats.candidates,
                    accepted = stats.accepted,
                    records = stats.records,
                    "file processed"
                );
                total = total.merge(stats);
            }

            if let Some(path) = &metrics {
                summary.write_json(path)?;
                info!(path = %path.display(), "metrics written");
            }

            let elapsed = start.elapsed();
            println!(
                "Processed {} files in {:.2}s",
                input.len(),
                elapsed.as_secs_f64()
            );
            println!("Events: {} ({} skipped)", total.events, total.skipped);
            println!(
                "Triplets: {} upstream, {} downstream",
                total.upstream_triplets, total.downstream_triplets
            );
            println!("Candidates: {}", total.candidates);
            println!(
                "Tracks: {} accepted, {} rejected, {} failed fits",
                total.accepted, total.rejected, total.failed_fits
            );
            println!("Alignment records: {} -> {}", total.records, output.display());
        }

        Commands::Info { input } => {
            let reader = HitFileReader::open(&input)?;
            let file_size = reader.file_size();
            println!("File: {}", input.display());
            println!(
                "Size: {} bytes ({:.2} MB)",
                file_size,
                file_size as f64 / 1_000_000.0
            );
            println!("Hits: {}", reader.hit_count());

            let events = reader.read_events();
            println!("Events: {}", events.len());
            if let (Some(first), Some(last)) = (
                events.iter().map(|e| e.event).min(),
                events.iter().map(|e| e.event).max(),
            ) {
                println!("Event range: {} - {}", first, last);
            }

            let mut per_layer: BTreeMap<u32, usize> = BTreeMap::new();
            for (_, hit) in reader.iter_hits() {
                *per_layer.entry(hit.layer).or_default() += 1;
            }
            for (layer, count) in &per_layer {
                let mean = *count as f64 / events.len().max(1) as f64;
                println!("Layer {}: {} hits ({:.2} per event)", layer, count, mean);
            }
        }

        Commands::Simulate {
            config,
            output,
            events,
            tracks,
            noise_rate,
            beam_energy,
            seed,
            no_scattering,
            misaligned,
        } => {
            let run = RunConfig::load(&config)?;
            let sim = SimulationConfig::default()
                .with_events(events)
                .with_tracks_per_event(tracks)
                .with_noise_rate(noise_rate)
                .with_beam_energy(beam_energy.unwrap_or(run.tracking.beam_energy))
                .with_scattering(!no_scattering)
                .with_seed(seed);
            let mut simulator = Simulator::new(&run.geometry, sim)?;
            if misaligned {
                simulator = simulator.with_misalignment(run.alignment.clone());
            }

            let start = Instant::now();
            let mut writer = HitFileWriter::create(&output)?;
            for (event, hits) in (0u64..).zip(simulator.run()) {
                writer.write_event(event, &hits)?;
            }
            writer.flush()?;

            println!(
                "Simulated {} events ({} hits) in {:.2}s -> {}",
                events,
                writer.records(),
                start.elapsed().as_secs_f64(),
                output.display()
            );
        }
    }

    Ok(())
}
