//! Rigid shift of the board outline
//!
//! The shift comes from the variant parameters, never from the RNG, so
//! every outline layer of one variant moves by the same amount.

use super::{
    check_bound, coarsest_step, displacement_mm, max_steps, PerturbationParams, Strategy,
};
use crate::cam::{FileFormat, LayerFile, Position};
use crate::error::Result;
use rand::rngs::StdRng;
use tracing::debug;

pub struct PhysicalStrategy;

impl PhysicalStrategy {
    /// The variant shift in this layer's units, truncated to whole steps
    pub fn quantized_shift(layer: &LayerFile, params: &PerturbationParams) -> Position {
        let step = coarsest_step(layer);
        let axis = |mm: f64| {
            let steps = max_steps(layer, mm.abs(), step);
            if mm < 0.0 {
                -steps * step
            } else {
                steps * step
            }
        };
        (axis(params.outline_shift_mm.0), axis(params.outline_shift_mm.1))
    }
}

impl Strategy for PhysicalStrategy {
    fn name(&self) -> &'static str {
        "physical"
    }

    fn applies_to(&self, layer: &LayerFile) -> bool {
        layer.kind == FileFormat::Gerber && layer.layer.is_outline()
    }

    fn apply(
        &self,
        layer: &mut LayerFile,
        params: &PerturbationParams,
        _rng: &mut StdRng,
    ) -> Result<()> {
        check_bound(self.name(), params.outline_delta_mm, super::OUTLINE_DELTA_MAX_MM)?;

        let shift = Self::quantized_shift(layer, params);
        check_bound(
            self.name(),
            displacement_mm(layer, (0, 0), shift),
            params.outline_delta_mm,
        )?;
        if shift == (0, 0) {
            debug!("{}: outline shift below coordinate resolution", layer.path);
            return Ok(());
        }

        let targets: Vec<Option<Position>> = layer
            .locate()
            .into_iter()
            .map(|loc| loc.map(|l| (l.at.0 + shift.0, l.at.1 + shift.1)))
            .collect();
        layer.reposition(&targets);

        debug!(
            "Shifted outline {} by ({:.4}, {:.4}) mm",
            layer.path,
            layer.internal_to_mm(shift.0),
            layer.internal_to_mm(shift.1)
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_layer;
    use crate::serializer::serialize;
    use crate::strategies::test_support::params;
    use rand::SeedableRng;

    const MM_OUTLINE: &str = "%FSLAX46Y46*%\n%MOMM*%\n%ADD10C,0.100000*%\nD10*\nX0Y0D02*\nX50000000Y0D01*\nX50000000Y30000000D01*\nX0Y30000000D01*\nX0Y0D01*\nM02*\n";
    const INCH_OUTLINE: &str = "%FSLAX24Y24*%\n%MOIN*%\n%ADD10C,0.0040*%\nD10*\nX0Y0D02*\nX20000Y0D01*\nX20000Y10000D01*\nX0Y10000D01*\nX0Y0D01*\nM02*\n";

    #[test]
    fn test_outline_moves_as_one_piece() {
        let source = parse_layer("board-Edge_Cuts.gbr", MM_OUTLINE, FileFormat::Gerber).unwrap();
        let mut layer = source.clone();
        let mut rng = StdRng::seed_from_u64(1);
        PhysicalStrategy
            .apply(&mut layer, &params(), &mut rng)
            .unwrap();

        let moved: Vec<Position> = source
            .locate()
            .iter()
            .zip(layer.locate())
            .filter_map(|(b, a)| Some((a?.at.0 - b.as_ref()?.at.0, a?.at.1 - b.as_ref()?.at.1)))
            .collect();
        assert_eq!(moved.len(), 5);
        assert!(moved.iter().all(|d| *d == (8_000, -6_000)));
    }

    #[test]
    fn test_shift_is_shared_across_units() {
        let mm = parse_layer("a.gko", MM_OUTLINE, FileFormat::Gerber).unwrap();
        let inch = parse_layer("b.gko", INCH_OUTLINE, FileFormat::Gerber).unwrap();
        let p = params();

        let mm_shift = PhysicalStrategy::quantized_shift(&mm, &p);
        let inch_shift = PhysicalStrategy::quantized_shift(&inch, &p);
        // 0.008 mm is three 0.0001 inch steps, -0.006 mm two
        assert_eq!(inch_shift, (300, -200));
        assert!((mm.internal_to_mm(mm_shift.0) - inch.internal_to_mm(inch_shift.0)).abs() < 0.003);

        let mut layer = inch.clone();
        let mut rng = StdRng::seed_from_u64(1);
        PhysicalStrategy.apply(&mut layer, &p, &mut rng).unwrap();
        assert!(serialize(&layer).contains("X20003Y-2D01*"));
    }
}
