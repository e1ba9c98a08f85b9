//! Jitter of silkscreen artwork
//!
//! A stroke is a `D02` move (or a flash) and the draws that follow it.
//! Strokes that share any vertex form one connected figure, and every
//! vertex of a figure moves by the same offset, so lines that met in the
//! source still meet in the variant.

use super::{check_bound, coarsest_step, displacement_mm, max_steps, PerturbationParams, Strategy};
use crate::cam::{Command, DrawOp, FileFormat, LayerFile, Position};
use crate::error::Result;
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::debug;

pub struct SilkscreenStrategy;

/// Union-find over stroke ids
struct Figures {
    parent: Vec<usize>,
}

impl Figures {
    fn new() -> Self {
        Self { parent: Vec::new() }
    }

    fn add(&mut self) -> usize {
        self.parent.push(self.parent.len());
        self.parent.len() - 1
    }

    fn root(&mut self, mut id: usize) -> usize {
        while self.parent[id] != id {
            self.parent[id] = self.parent[self.parent[id]];
            id = self.parent[id];
        }
        id
    }

    fn join(&mut self, a: usize, b: usize) {
        let (a, b) = (self.root(a), self.root(b));
        if a != b {
            self.parent[b.max(a)] = a.min(b);
        }
    }
}

impl SilkscreenStrategy {
    /// Stroke id of every positional node, with strokes sharing a vertex merged
    fn strokes(layer: &LayerFile) -> (Vec<Option<usize>>, Figures) {
        let located = layer.locate();
        let mut figures = Figures::new();
        let mut owners: HashMap<Position, usize> = HashMap::new();
        let mut stroke_of = vec![None; layer.nodes.len()];
        let mut current: Option<usize> = None;

        let mut touch = |figures: &mut Figures, stroke: usize, at: Position| match owners.entry(at) {
            Entry::Occupied(owner) => figures.join(stroke, *owner.get()),
            Entry::Vacant(slot) => {
                slot.insert(stroke);
            }
        };

        for (index, node) in layer.nodes.iter().enumerate() {
            let Some(loc) = located[index] else {
                continue;
            };
            let stroke = match &node.command {
                Command::Move { .. }
                | Command::FlashOrDraw {
                    op: DrawOp::Flash, ..
                } => {
                    let stroke = figures.add();
                    touch(&mut figures, stroke, loc.at);
                    stroke
                }
                Command::FlashOrDraw {
                    op: DrawOp::Draw, ..
                } => {
                    let stroke = match current {
                        Some(stroke) => stroke,
                        None => {
                            let stroke = figures.add();
                            touch(&mut figures, stroke, loc.from);
                            stroke
                        }
                    };
                    touch(&mut figures, stroke, loc.at);
                    stroke
                }
                _ => continue,
            };
            current = Some(stroke);
            stroke_of[index] = Some(stroke);
        }

        (stroke_of, figures)
    }
}

impl Strategy for SilkscreenStrategy {
    fn name(&self) -> &'static str {
        "silkscreen"
    }

    fn applies_to(&self, layer: &LayerFile) -> bool {
        layer.kind == FileFormat::Gerber && layer.layer.is_silkscreen()
    }

    fn apply(
        &self,
        layer: &mut LayerFile,
        params: &PerturbationParams,
        rng: &mut StdRng,
    ) -> Result<()> {
        check_bound(
            self.name(),
            params.silkscreen_epsilon_mm,
            super::SILKSCREEN_EPSILON_MAX_MM,
        )?;

        let step = coarsest_step(layer);
        let limit = max_steps(layer, params.silkscreen_epsilon_mm, step);
        if limit == 0 {
            debug!(
                "{}: coordinate resolution coarser than silkscreen tolerance, left as is",
                layer.path
            );
            return Ok(());
        }

        let (stroke_of, mut figures) = Self::strokes(layer);
        let located = layer.locate();
        let mut offsets: HashMap<usize, Position> = HashMap::new();
        let mut targets: Vec<Option<Position>> = vec![None; layer.nodes.len()];

        for (index, stroke) in stroke_of.iter().enumerate() {
            let (Some(stroke), Some(loc)) = (stroke, located[index]) else {
                continue;
            };
            let figure = figures.root(*stroke);
            let offset = *offsets.entry(figure).or_insert_with(|| {
                (
                    rng.gen_range(-limit..=limit) * step,
                    rng.gen_range(-limit..=limit) * step,
                )
            });
            let target = (loc.at.0 + offset.0, loc.at.1 + offset.1);
            check_bound(
                self.name(),
                displacement_mm(layer, loc.at, target),
                params.silkscreen_epsilon_mm,
            )?;
            targets[index] = Some(target);
        }

        layer.reposition(&targets);
        debug!(
            "Jittered {} silkscreen figures in {}",
            offsets.len(),
            layer.path
        );
        Ok(())
    }
}
