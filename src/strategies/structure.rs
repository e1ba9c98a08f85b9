//! Structural noise: comments and redundant tool re-selections
//!
//! Insertions only go into gaps where they cannot change interpreter state:
//! never inside a region, never after the end-of-file marker, and a
//! re-selection is always a verbatim copy of the selection already active
//! at that point.

use super::{PerturbationParams, Strategy};
use crate::cam::{Command, FileFormat, LayerFile, Node};
use crate::error::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

const LABELS: [&str; 6] = ["Build ID", "Job ID", "Revision", "Batch", "Session", "Ref"];

pub struct StructureStrategy;

/// Interpreter state in front of one node
#[derive(Debug, Clone, Copy)]
struct Gap {
    /// Insert before this node
    index: usize,
    /// Node holding the active selection, if any
    selection: Option<usize>,
    comment_ok: bool,
    reselect_ok: bool,
}

impl StructureStrategy {
    fn gaps(layer: &LayerFile) -> Vec<Gap> {
        let excellon = layer.kind == FileFormat::Excellon;
        // A bare coordinate block relies on the modal D code, which some
        // readers reset on aperture selection
        let implicit_ops = layer.nodes.iter().any(|n| match &n.command {
            Command::Move { word, .. } | Command::FlashOrDraw { word, .. } => {
                !word.suffix.contains('D')
            }
            _ => false,
        });

        let end = layer
            .nodes
            .iter()
            .position(|n| matches!(n.command, Command::EndOfFile))
            .unwrap_or(layer.nodes.len());

        let mut gaps = Vec::new();
        let mut region = false;
        let mut header = false;
        let mut rout = false;
        let mut selection: Option<usize> = None;

        for index in 1..=end {
            let previous = &layer.nodes[index - 1];
            let body = previous.raw.trim();
            match &previous.command {
                Command::Region(on) => region = *on,
                Command::ToolSelect(code) if *code != 0 && !(excellon && header) => {
                    selection = Some(index - 1)
                }
                Command::ToolSelect(_) => selection = None,
                // A body tool definition also selects that tool
                Command::ToolDefinition { .. } if excellon && !header => selection = None,
                Command::Passthrough | Command::ToolPath { .. } if excellon => match body {
                    "M48" => header = true,
                    "%" | "M95" => header = false,
                    "G05" | "G81" => rout = false,
                    _ if body.starts_with("G00") || body.starts_with("G01") => rout = true,
                    _ if body.starts_with("G02") || body.starts_with("G03") => rout = true,
                    _ => {}
                },
                _ => {}
            }

            // Appending past the last node needs a line break to attach to
            if index == layer.nodes.len() && !previous.trailer.contains('\n') {
                continue;
            }
            if region {
                continue;
            }

            let (comment_ok, reselect_ok) = if excellon {
                (header, !header && !rout && selection.is_some())
            } else {
                (true, !implicit_ops && selection.is_some())
            };
            if comment_ok || reselect_ok {
                gaps.push(Gap {
                    index,
                    selection,
                    comment_ok,
                    reselect_ok,
                });
            }
        }
        gaps
    }

    fn noise_comment(layer: &LayerFile, rng: &mut StdRng) -> Node {
        let label = LABELS.choose(rng).copied().unwrap_or("Build ID");
        let digits = rng.gen_range(6..=12);
        let id: String = (0..digits)
            .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
            .collect::<String>()
            .to_ascii_uppercase();
        match layer.kind {
            FileFormat::Gerber => {
                let raw = format!("G04 {}: {}*", label, id);
                Node::new(Command::Comment(format!("{}: {}", label, id)), raw, "")
            }
            FileFormat::Excellon => {
                let raw = format!(";{}: {}", label, id);
                Node::new(Command::Comment(format!("{}: {}", label, id)), raw, "")
            }
        }
    }
}

impl Strategy for StructureStrategy {
    fn name(&self) -> &'static str {
        "structure"
    }

    fn applies_to(&self, layer: &LayerFile) -> bool {
        !layer.nodes.is_empty()
    }

    fn apply(
        &self,
        layer: &mut LayerFile,
        params: &PerturbationParams,
        rng: &mut StdRng,
    ) -> Result<()> {
        let gaps = Self::gaps(layer);
        if gaps.is_empty() {
            debug!("{}: no safe insertion points", layer.path);
            return Ok(());
        }

        let (low, high) = params.noise_density;
        let count = rng.gen_range(low..=high.max(low));
        let mut chosen: Vec<Gap> = gaps.choose_multiple(rng, count.min(gaps.len())).copied().collect();
        chosen.sort_by(|a, b| b.index.cmp(&a.index));

        for gap in &chosen {
            let reselect = gap.reselect_ok && (!gap.comment_ok || rng.gen_bool(0.5));
            let mut node = match (reselect, gap.selection) {
                (true, Some(selection)) => {
                    let source = &layer.nodes[selection];
                    Node::new(source.command.clone(), source.raw.clone(), "")
                }
                _ => Self::noise_comment(layer, rng),
            };

            let previous = &layer.nodes[gap.index - 1];
            if previous.trailer.contains('\n') {
                node.trailer = layer.line_ending.to_string();
            }
            layer.nodes.insert(gap.index, node);
        }

        debug!("Inserted {} noise nodes into {}", chosen.len(), layer.path);
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

    const GERBER: &str = "G04 header*\r\n%FSLAX46Y46*%\r\n%MOMM*%\r\n%ADD10C,0.1*%\r\nG54D10*\r\nX0Y0D02*\r\nG36*\r\nX1000Y0D01*\r\nX1000Y1000D01*\r\nX0Y0D01*\r\nG37*\r\nM02*\r\n";
    const DRILL: &str = "M48\nMETRIC\nT01C0.300\n%\nG05\nT01\nX1.0Y1.0\nX2.0Y1.0\nX3.0Y1.0\nM30\n";

    fn stripped(layer: &LayerFile) -> Vec<String> {
        layer
            .nodes
            .iter()
            .filter(|n| !LABELS.iter().any(|l| n.raw.contains(l)))
            .map(|n| n.raw.clone())
            .collect()
    }

    #[test]
    fn test_gerber_noise_stays_outside_regions() {
        let source = parse_layer("top.gtl", GERBER, FileFormat::Gerber).unwrap();
        for seed in 0..32 {
            let mut layer = source.clone();
            let mut rng = StdRng::seed_from_u64(seed);
            StructureStrategy.apply(&mut layer, &params(), &mut rng).unwrap();

            let added = layer.nodes.len() - source.nodes.len();
            assert!((2..=6).contains(&added));

            let text = serialize(&layer);
            let region = &text[text.find("G36*").unwrap()..text.find("G37*").unwrap()];
            assert!(!region.contains("G04"));
            assert!(!region.contains("G54D10"));
            assert!(text.ends_with("M02*\r\n"));

            let reparsed = parse_layer("top.gtl", &text, FileFormat::Gerber).unwrap();
            assert_eq!(reparsed.nodes.len(), layer.nodes.len());
        }
    }

    #[test]
    fn test_excellon_noise_keeps_tool_state() {
        let source = parse_layer("board.drl", DRILL, FileFormat::Excellon).unwrap();
        for seed in 0..32 {
            let mut layer = source.clone();
            let mut rng = StdRng::seed_from_u64(seed);
            StructureStrategy.apply(&mut layer, &params(), &mut rng).unwrap();

            for node in &layer.nodes {
                if let Command::ToolSelect(code) = node.command {
                    assert_eq!(code, 1);
                }
            }
            let text = serialize(&layer);
            let header_end = text.find("\n%\n").unwrap();
            assert!(!text[header_end..].contains(';'));
            assert_eq!(
                stripped(&layer)
                    .into_iter()
                    .filter(|raw| raw != "T01")
                    .collect::<Vec<_>>(),
                stripped(&source)
                    .into_iter()
                    .filter(|raw| raw != "T01")
                    .collect::<Vec<_>>()
            );
            assert!(text.ends_with("M30\n"));
        }
    }

    #[test]
    fn test_inline_tool_change_is_never_undone() {
        let text = "M48\nMETRIC\nT01C0.300\n%\nG05\nT01\nX1.0Y1.0\nT02C0.800\nX2.0Y2.0\nX3.0Y3.0\nX4.0Y4.0\nX5.0Y5.0\nM30\n";
        let source = parse_layer("board.drl", text, FileFormat::Excellon).unwrap();
        for seed in 0..64 {
            let mut layer = source.clone();
            let mut rng = StdRng::seed_from_u64(seed);
            StructureStrategy.apply(&mut layer, &params(), &mut rng).unwrap();

            let change = layer
                .nodes
                .iter()
                .position(|n| n.raw == "T02C0.800")
                .unwrap();
            assert!(layer.nodes[change..]
                .iter()
                .all(|n| !matches!(n.command, Command::ToolSelect(_))));

            let reparsed = parse_layer("board.drl", &serialize(&layer), FileFormat::Excellon).unwrap();
            for node in &reparsed.nodes {
                if let Command::DrillHit { word, tool } = &node.command {
                    let x = word.x.as_ref().unwrap().value();
                    assert_eq!(*tool, Some(if x == 1_000_000 { 1 } else { 2 }));
                }
            }
        }
    }
}
