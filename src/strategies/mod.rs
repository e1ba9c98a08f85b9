//! Perturbation strategies
//!
//! Each strategy mutates one parsed layer in place. All randomness comes
//! from the per-variant RNG and the [`PerturbationParams`] drawn once per
//! variant, so two layers that must move together (every outline layer of
//! a board) see the same values.

pub mod geometry;
pub mod physical;
pub mod silkscreen;
pub mod structure;
pub mod timestamp;

use crate::cam::{Coord, LayerFile, Position};
use crate::config::ObfuscateOptions;
use crate::error::{GhostPcbError, Result};
use anyhow::Context;
use chrono::{Duration, NaiveDateTime, NaiveTime};
use rand::rngs::StdRng;
use rand::Rng;
use tracing::debug;

/// Largest silkscreen jitter per axis, in millimetres
pub const SILKSCREEN_EPSILON_MAX_MM: f64 = 0.05;

/// Largest drill hit offset per axis, in millimetres
pub const DRILL_EPSILON_MAX_MM: f64 = 0.02;

/// Largest outline shift per axis, in millimetres
pub const OUTLINE_DELTA_MAX_MM: f64 = 0.01;

/// Share of a hole's diameter a drill offset may use
pub const ANNULAR_FRACTION: f64 = 0.1;

/// Structure noise insertions per file
pub const NOISE_MIN: usize = 2;
pub const NOISE_MAX: usize = 6;

const FLOAT_SLACK: f64 = 1e-9;

/// Random values shared by every layer of one variant
#[derive(Debug, Clone, PartialEq)]
pub struct PerturbationParams {
    /// Replacement for dates found in headers and comments
    pub timestamp: NaiveDateTime,
    /// Nonzero change applied to the last component of generator versions
    pub generator_bump: i64,
    pub silkscreen_epsilon_mm: f64,
    pub drill_epsilon_mm: f64,
    pub outline_delta_mm: f64,
    /// Rigid shift of every outline layer
    pub outline_shift_mm: (f64, f64),
    /// Inclusive range of structure insertions per file
    pub noise_density: (usize, usize),
}

impl PerturbationParams {
    /// Draw a fresh parameter set. `reference` anchors the replacement date.
    pub fn draw(rng: &mut StdRng, reference: NaiveDateTime) -> Self {
        let days_ago = rng.gen_range(1..30);
        let time = NaiveTime::from_hms_opt(
            rng.gen_range(8..18),
            rng.gen_range(0..60),
            rng.gen_range(0..60),
        )
        .unwrap_or(NaiveTime::MIN);
        let timestamp = (reference.date() - Duration::days(days_ago)).and_time(time);

        let generator_bump = match rng.gen_range(0..4) {
            0 => -1,
            1 => 1,
            2 => 2,
            _ => 3,
        };

        let mut shift_axis = || {
            let magnitude = rng.gen_range(OUTLINE_DELTA_MAX_MM / 2.0..=OUTLINE_DELTA_MAX_MM);
            if rng.gen_bool(0.5) {
                magnitude
            } else {
                -magnitude
            }
        };
        let outline_shift_mm = (shift_axis(), shift_axis());

        Self {
            timestamp,
            generator_bump,
            silkscreen_epsilon_mm: rng
                .gen_range(SILKSCREEN_EPSILON_MAX_MM / 2.0..=SILKSCREEN_EPSILON_MAX_MM),
            drill_epsilon_mm: rng.gen_range(DRILL_EPSILON_MAX_MM / 2.0..=DRILL_EPSILON_MAX_MM),
            outline_delta_mm: OUTLINE_DELTA_MAX_MM,
            outline_shift_mm,
            noise_density: (NOISE_MIN, NOISE_MAX),
        }
    }

    /// Reject parameter sets that exceed the compile-time maxima
    pub fn validate(&self) -> Result<()> {
        check_bound("silkscreen", self.silkscreen_epsilon_mm, SILKSCREEN_EPSILON_MAX_MM)?;
        check_bound("geometry", self.drill_epsilon_mm, DRILL_EPSILON_MAX_MM)?;
        check_bound("physical", self.outline_delta_mm, OUTLINE_DELTA_MAX_MM)?;
        check_bound("physical", self.outline_shift_mm.0.abs(), self.outline_delta_mm)?;
        check_bound("physical", self.outline_shift_mm.1.abs(), self.outline_delta_mm)?;
        Ok(())
    }
}

/// Fail with a tolerance violation when `value_mm` exceeds `bound_mm`
pub fn check_bound(strategy: &'static str, value_mm: f64, bound_mm: f64) -> Result<()> {
    if value_mm > bound_mm + FLOAT_SLACK || value_mm.is_nan() {
        return Err(GhostPcbError::ToleranceViolation {
            strategy,
            value_mm,
            bound_mm,
        }
        .into());
    }
    Ok(())
}

/// Whole coordinate steps that fit inside `bound_mm` on this layer
pub fn max_steps(layer: &LayerFile, bound_mm: f64, step: i64) -> i64 {
    if step <= 0 {
        return 0;
    }
    (layer.mm_to_internal(bound_mm) / step as f64 + FLOAT_SLACK).floor() as i64
}

/// Coarsest resolution among the layer's positional coordinates.
///
/// Offsets that are multiples of this step render without adding digits to
/// any coordinate of the layer.
pub fn coarsest_step(layer: &LayerFile) -> i64 {
    layer
        .nodes
        .iter()
        .filter_map(|node| node.command.word())
        .flat_map(|word| [&word.x, &word.y])
        .filter_map(|coord| coord.as_ref().map(|c: &Coord| c.step(&layer.format)))
        .max()
        .unwrap_or_else(|| layer.step())
}

/// Largest per-axis distance between two positions, in millimetres
pub fn displacement_mm(layer: &LayerFile, from: Position, to: Position) -> f64 {
    let dx = layer.internal_to_mm(to.0 - from.0).abs();
    let dy = layer.internal_to_mm(to.1 - from.1).abs();
    dx.max(dy)
}

pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this strategy has anything to do on `layer`
    fn applies_to(&self, layer: &LayerFile) -> bool;

    fn apply(&self, layer: &mut LayerFile, params: &PerturbationParams, rng: &mut StdRng)
        -> Result<()>;
}

/// The strategies enabled for one request, in application order
pub struct Pipeline {
    strategies: Vec<Box<dyn Strategy>>,
}

impl Pipeline {
    pub fn from_options(options: &ObfuscateOptions) -> Self {
        let mut strategies: Vec<Box<dyn Strategy>> = Vec::new();
        if options.timestamp {
            strategies.push(Box::new(timestamp::TimestampStrategy));
        }
        if options.silkscreen {
            strategies.push(Box::new(silkscreen::SilkscreenStrategy));
        }
        if options.geometry {
            strategies.push(Box::new(geometry::GeometryStrategy));
        }
        if options.physical {
            strategies.push(Box::new(physical::PhysicalStrategy));
        }
        // Inserts nodes, so it runs after everything that indexes them
        if options.structure {
            strategies.push(Box::new(structure::StructureStrategy));
        }
        Self { strategies }
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Run every applicable strategy over one layer
    pub fn apply(
        &self,
        layer: &mut LayerFile,
        params: &PerturbationParams,
        rng: &mut StdRng,
    ) -> Result<()> {
        for strategy in &self.strategies {
            if !strategy.applies_to(layer) {
                continue;
            }
            debug!("Applying {} to {}", strategy.name(), layer.path);
            strategy
                .apply(layer, params, rng)
                .with_context(|| format!("Strategy {} failed on {}", strategy.name(), layer.path))?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_drawn_params_stay_in_bounds() {
        let reference = chrono::NaiveDate::from_ymd_opt(2025, 1, 31)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .unwrap();
        for seed in 0..64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let params = PerturbationParams::draw(&mut rng, reference);
            params.validate().unwrap();
            assert_ne!(params.generator_bump, 0);
            assert!(params.timestamp < reference);
            assert!(reference - params.timestamp <= Duration::days(30));
        }
    }

    #[test]
    fn test_oversized_params_are_rejected() {
        let mut params = test_support::params();
        params.drill_epsilon_mm = 0.5;
        let err = params.validate().unwrap_err();
        assert!(matches!(
            crate::error::classify(&err),
            Some(GhostPcbError::ToleranceViolation {
                strategy: "geometry",
                ..
            })
        ));
    }

    #[test]
    fn test_pipeline_order() {
        let pipeline = Pipeline::from_options(&ObfuscateOptions::default());
        assert_eq!(
            pipeline.names(),
            vec!["timestamp", "silkscreen", "geometry", "physical", "structure"]
        );

        let none = ObfuscateOptions {
            timestamp: false,
            silkscreen: false,
            geometry: false,
            structure: false,
            physical: false,
        };
        assert!(Pipeline::from_options(&none).is_empty());
    }
}
