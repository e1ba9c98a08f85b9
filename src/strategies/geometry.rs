//! Per-hole offsets on Excellon drill hits

use super::{
    check_bound, coarsest_step, displacement_mm, max_steps, PerturbationParams, Strategy,
    ANNULAR_FRACTION, DRILL_EPSILON_MAX_MM,
};
use crate::cam::{Command, FileFormat, LayerFile, Position};
use crate::error::Result;
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::HashMap;
use tracing::debug;

pub struct GeometryStrategy;

impl GeometryStrategy {
    /// Tool diameters of the layer, in millimetres
    fn tool_diameters(layer: &LayerFile) -> HashMap<u32, f64> {
        let mm_per_unit = layer.unit.mm_per_unit();
        layer
            .nodes
            .iter()
            .filter_map(|node| match node.command {
                Command::ToolDefinition { code, diameter } => Some((code, diameter * mm_per_unit)),
                _ => None,
            })
            .collect()
    }
}

impl Strategy for GeometryStrategy {
    fn name(&self) -> &'static str {
        "geometry"
    }

    fn applies_to(&self, layer: &LayerFile) -> bool {
        layer.kind == FileFormat::Excellon
            && layer
                .nodes
                .iter()
                .any(|n| matches!(n.command, Command::DrillHit { .. }))
    }

    fn apply(
        &self,
        layer: &mut LayerFile,
        params: &PerturbationParams,
        rng: &mut StdRng,
    ) -> Result<()> {
        check_bound(self.name(), params.drill_epsilon_mm, DRILL_EPSILON_MAX_MM)?;

        let diameters = Self::tool_diameters(layer);
        let step = coarsest_step(layer);
        let located = layer.locate();
        let pinned = layer.pinned();
        let mut targets: Vec<Option<Position>> = vec![None; layer.nodes.len()];
        let mut moved = 0usize;

        for (index, node) in layer.nodes.iter().enumerate() {
            let (Command::DrillHit { tool, .. }, Some(loc)) = (&node.command, located[index]) else {
                continue;
            };

            if pinned[index] {
                continue;
            }

            let bound_mm = match tool.and_then(|t| diameters.get(&t)) {
                Some(diameter) => params.drill_epsilon_mm.min(diameter * ANNULAR_FRACTION),
                None => params.drill_epsilon_mm,
            };
            let limit = max_steps(layer, bound_mm, step);
            if limit == 0 {
                continue;
            }

            let target = (
                loc.at.0 + rng.gen_range(-limit..=limit) * step,
                loc.at.1 + rng.gen_range(-limit..=limit) * step,
            );
            check_bound(self.name(), displacement_mm(layer, loc.at, target), bound_mm)?;
            if target != loc.at {
                moved += 1;
            }
            targets[index] = Some(target);
        }

        layer.reposition(&targets);
        debug!("Offset {} drill hits in {}", moved, layer.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_layer;
    use crate::strategies::test_support::params;
    use rand::SeedableRng;

    const DRILL: &str = "M48\nMETRIC,TZ,000.000\nT1C0.100\nT2C3.000\n%\nG05\nT1\nX010000Y010000\nX020000Y010000\nT2\nX030000Y030000\nY040000\nM30\n";

    #[test]
    fn test_hits_move_within_their_bound() {
        let source = parse_layer("board.drl", DRILL, FileFormat::Excellon).unwrap();
        let mut best = 0;
        for seed in 0..16 {
            let mut layer = source.clone();
            let mut rng = StdRng::seed_from_u64(seed);
            GeometryStrategy
                .apply(&mut layer, &params(), &mut rng)
                .unwrap();

            let before = source.locate();
            let after = layer.locate();
            let hits: Vec<(i64, i64)> = before
                .iter()
                .zip(&after)
                .filter_map(|(b, a)| Some((b.as_ref()?.at, a.as_ref()?.at)))
                .map(|(b, a)| ((a.0 - b.0).abs(), (a.1 - b.1).abs()))
                .collect();

            // 0.1 mm tool caps the offset at 0.01 mm
            assert!(hits[0].0 <= 10_000 && hits[0].1 <= 10_000);
            assert!(hits[1].0 <= 10_000 && hits[1].1 <= 10_000);
            // 3 mm tool is capped by the drill tolerance
            assert!(hits[2].0 <= 20_000 && hits[2].1 <= 20_000);
            assert!(hits[3].0 <= 20_000 && hits[3].1 <= 20_000);
            best = best.max(hits[2].0.max(hits[2].1));
        }
        assert!(best > 10_000);
    }

    #[test]
    fn test_hits_stay_in_file_format() {
        let mut layer = parse_layer("board.drl", DRILL, FileFormat::Excellon).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        GeometryStrategy
            .apply(&mut layer, &params(), &mut rng)
            .unwrap();

        let reparsed = parse_layer(
            "board.drl",
            &crate::serializer::serialize(&layer),
            FileFormat::Excellon,
        )
        .unwrap();
        assert_eq!(reparsed.locate(), layer.locate());
    }

    #[test]
    fn test_hits_after_slots_keep_their_modal_axis() {
        let text = "M48\nMETRIC\nT01C0.800\n%\nT01\nX1.000Y1.000\nX5.000Y5.000G85X6.000Y6.000\nY7.000\nX8.000Y8.000\nR2X0.500\nM30\n";
        let source = parse_layer("board.drl", text, FileFormat::Excellon).unwrap();
        for seed in 0..16 {
            let mut layer = source.clone();
            let mut rng = StdRng::seed_from_u64(seed);
            GeometryStrategy
                .apply(&mut layer, &params(), &mut rng)
                .unwrap();

            let out = crate::serializer::serialize(&layer);
            assert!(out.contains("\nX5.000Y5.000G85X6.000Y6.000\n"));
            // the repeat steps from this hit, so it cannot move
            assert!(out.contains("\nX8.000Y8.000\nR2X0.500\n"));

            let reparsed = parse_layer("board.drl", &out, FileFormat::Excellon).unwrap();
            let hits = |layer: &LayerFile| -> Vec<Position> {
                layer
                    .nodes
                    .iter()
                    .zip(layer.locate())
                    .filter_map(|(node, loc)| match node.command {
                        Command::DrillHit { .. } => Some(loc?.at),
                        _ => None,
                    })
                    .collect()
            };
            let before = hits(&source);
            let after = hits(&reparsed);
            assert_eq!(before[1], (6_000_000, 7_000_000));
            for (b, a) in before.iter().zip(&after) {
                assert!((a.0 - b.0).abs() <= 20_000 && (a.1 - b.1).abs() <= 20_000);
            }
        }
    }
}
