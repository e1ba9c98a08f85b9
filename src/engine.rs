//! Variant generation engine
//!
//! The input package is loaded and parsed once. Every variant then runs on
//! the rayon pool with its own copy of the parsed layers and its own RNG,
//! so the only shared mutable state is the set of fingerprints accepted in
//! this batch.

use crate::{
    archive::{base_name, output_path, prepare_output_dir, Archive, ArchiveReader, ArchiveWriter, Fingerprint},
    cam::LayerFile,
    config::{ObfuscateOptions, ProcessRequest},
    error::{classify, GhostPcbError, Result, ResultExt},
    parser::{detect, parse_layer},
    progress::ProgressTracker,
    report::{ProcessResult, ReportBuilder, VariantOutcome},
    serializer::serialize,
    strategies::{Pipeline, PerturbationParams},
};
use anyhow::anyhow;
use chrono::{Local, NaiveDateTime, Utc};
use indicatif::ProgressBar;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Seeds tried per variant before giving up on a distinct result
pub const MAX_ATTEMPTS: u32 = 8;

/// Lifecycle of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Parsing,
    Generating,
    Reporting,
    Done,
    Aborted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::Parsing => "parsing",
            Stage::Generating => "generating",
            Stage::Reporting => "reporting",
            Stage::Done => "done",
            Stage::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Parsed input shared read-only by every variant
struct Batch<'a> {
    archive: &'a Archive,
    /// Parsed CAM members with their position in the archive
    layers: Vec<(usize, LayerFile)>,
    pipeline: Pipeline,
    options: ObfuscateOptions,
    output_dir: PathBuf,
    base: String,
    base_seed: u64,
    reference: NaiveDateTime,
    accepted: Mutex<HashSet<Fingerprint>>,
}

/// The obfuscation engine
pub struct Engine {
    seed: Option<u64>,
    reference_time: Option<NaiveDateTime>,
    progress_tracker: ProgressTracker,
    cancel: Arc<AtomicBool>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            seed: None,
            reference_time: None,
            progress_tracker: ProgressTracker::new(false),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Derive every variant seed from `seed` instead of the clock
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Anchor replacement dates to `time` instead of now
    pub fn with_reference_time(mut self, time: NaiveDateTime) -> Self {
        self.reference_time = Some(time);
        self
    }

    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress_tracker = ProgressTracker::new(enabled);
        self
    }

    /// Flag that stops the batch once in-flight variants are written
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn enter(stage: Stage) {
        info!("Stage: {}", stage);
    }

    /// Serve one request. Never panics on bad input; every failure ends up
    /// in the returned message.
    pub fn process(&self, request: &ProcessRequest) -> ProcessResult {
        let start = std::time::Instant::now();
        Self::enter(Stage::Init);

        match self.run(request) {
            Ok(result) => {
                Self::enter(Stage::Done);
                info!(
                    "Request finished in {} ms: {}",
                    start.elapsed().as_millis(),
                    result.message
                );
                result
            }
            Err(e) => {
                Self::enter(Stage::Aborted);
                error!("Request aborted: {:#}", e);
                ProcessResult::failure(format!("{:#}", e))
            }
        }
    }

    fn run(&self, request: &ProcessRequest) -> Result<ProcessResult> {
        Self::validate(request)?;
        let input = PathBuf::from(&request.input_path);

        Self::enter(Stage::Parsing);
        let spinner = self.progress_tracker.create_spinner("Parsing package...");
        let mut report = ReportBuilder::new(request.count);
        let archive = match ArchiveReader::load(&input) {
            Ok(archive) => archive,
            Err(e) => {
                ProgressTracker::finish_with_error(spinner, "Unreadable package");
                return Err(e);
            }
        };
        let layers = Self::parse_members(&archive, &mut report)?;
        ProgressTracker::finish_progress(spinner, "Package parsed");

        let output_dir = prepare_output_dir(&input, request.output_dir.as_deref().map(Path::new))?;
        let pipeline = Pipeline::from_options(&request.options);
        info!(
            "Strategies: {}; writing to {}",
            pipeline.names().join(", "),
            output_dir.display()
        );

        let batch = Batch {
            archive: &archive,
            layers,
            pipeline,
            options: request.options,
            output_dir,
            base: base_name(&input),
            base_seed: self.seed.unwrap_or_else(clock_seed),
            reference: self
                .reference_time
                .unwrap_or_else(|| Local::now().naive_local()),
            accepted: Mutex::new(HashSet::from([archive.fingerprint()])),
        };

        Self::enter(Stage::Generating);
        let pb = self
            .progress_tracker
            .create_variant_progress(request.count as usize);
        let outcomes: Vec<VariantOutcome> = (1..=request.count)
            .into_par_iter()
            .map(|index| self.variant(&batch, index, &pb))
            .collect();
        ProgressTracker::finish_progress(pb, "Variants generated");

        Self::enter(Stage::Reporting);
        for outcome in outcomes {
            report.record(outcome);
        }
        info!("{} of {} variants generated", report.generated(), request.count);
        Ok(report.build())
    }

    fn validate(request: &ProcessRequest) -> Result<()> {
        let reason = if request.input_path.trim().is_empty() {
            "input path is empty"
        } else if request.count == 0 {
            "count must be at least 1"
        } else if !request.options.any_enabled() {
            "all obfuscation options are disabled"
        } else {
            return Ok(());
        };
        Err(GhostPcbError::InvalidRequest {
            reason: reason.to_string(),
        }
        .into())
    }

    /// Parse every CAM member. Members that fail are left out of the
    /// perturbation and travel unmodified.
    fn parse_members(archive: &Archive, report: &mut ReportBuilder) -> Result<Vec<(usize, LayerFile)>> {
        let mut layers = Vec::new();
        for (index, entry) in archive.entries().iter().enumerate() {
            let Some(kind) = detect(&entry.path, &entry.data).format() else {
                debug!("Passing through {}", entry.path);
                continue;
            };

            let parsed = std::str::from_utf8(&entry.data)
                .map_err(|e| anyhow::Error::from(GhostPcbError::parse(&entry.path, e.to_string())))
                .and_then(|text| parse_layer(&entry.path, text, kind))
                .with_member_context(&entry.path);
            match parsed {
                Ok(layer) => layers.push((index, layer)),
                Err(e) => {
                    warn!("{:#}; copying it unmodified", e);
                    let reason = match classify(&e) {
                        Some(GhostPcbError::Parse { reason, .. }) => reason.clone(),
                        _ => format!("{:#}", e),
                    };
                    report.unparsed_member(&entry.path, reason);
                }
            }
        }

        if layers.is_empty() {
            return Err(GhostPcbError::archive("no Gerber or Excellon member could be parsed").into());
        }
        info!("Parsed {} CAM members", layers.len());
        Ok(layers)
    }

    fn variant(&self, batch: &Batch<'_>, index: u32, pb: &Option<ProgressBar>) -> VariantOutcome {
        if self.cancelled() {
            return VariantOutcome::Cancelled { index };
        }

        let outcome = match self.generate(batch, index).with_variant_context(index) {
            Ok(Some(path)) => {
                info!("Variant {} written to {}", index, path.display());
                VariantOutcome::Generated { index, path }
            }
            Ok(None) => VariantOutcome::Cancelled { index },
            Err(e) => {
                warn!("{:#}", e);
                VariantOutcome::Failed {
                    index,
                    reason: format!("{:#}", e),
                }
            }
        };
        ProgressTracker::update_progress(pb, 1, Some(&format!("variant {}", index)));
        outcome
    }

    /// Produce and write one distinct variant, retrying on fingerprint
    /// collisions. `None` when cancelled first.
    fn generate(&self, batch: &Batch<'_>, index: u32) -> Result<Option<PathBuf>> {
        for attempt in 0..MAX_ATTEMPTS {
            if self.cancelled() {
                return Ok(None);
            }

            let mut rng = StdRng::seed_from_u64(variant_seed(batch.base_seed, index, attempt));
            let params = PerturbationParams::draw(&mut rng, batch.reference);
            params.validate()?;

            let candidate = Self::perturb(batch, &params, &mut rng)?;
            let fingerprint = candidate.fingerprint();
            let fresh = batch
                .accepted
                .lock()
                .map_err(|_| anyhow!("fingerprint set lock poisoned"))?
                .insert(fingerprint);
            if !fresh {
                debug!(
                    "Variant {} attempt {} collided ({}), reseeding",
                    index, attempt, fingerprint
                );
                continue;
            }

            let path = output_path(&batch.output_dir, &batch.base, index);
            let stamp = batch.options.timestamp.then_some(params.timestamp);
            ArchiveWriter::write(&candidate, &path, stamp)?;
            return Ok(Some(fs::canonicalize(&path).unwrap_or(path)));
        }

        Err(anyhow!(
            "could not produce a distinct variant after {} attempts",
            MAX_ATTEMPTS
        ))
    }

    /// Apply the pipeline to a copy of every parsed layer
    fn perturb(batch: &Batch<'_>, params: &PerturbationParams, rng: &mut StdRng) -> Result<Archive> {
        let mut entries = batch.archive.entries().to_vec();
        for (entry_index, source) in &batch.layers {
            let mut layer = source.clone();
            batch.pipeline.apply(&mut layer, params, rng)?;

            let text = serialize(&layer);
            // Output must stay readable by our own parser
            parse_layer(&layer.path, &text, layer.kind).with_member_context(&layer.path)?;
            debug!("{}: {} nodes moved", layer.path, layer.modified_nodes());
            entries[*entry_index].data = text.into_bytes();
        }
        Archive::new(entries)
    }
}

fn clock_seed() -> u64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64
}

/// Mix the batch seed with the variant index and attempt (splitmix64)
pub fn variant_seed(base: u64, index: u32, attempt: u32) -> u64 {
    let lane = ((index as u64) << 32) | attempt as u64;
    let mut z = base ^ lane.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
