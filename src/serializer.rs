//! Re-emission of parsed layers
//!
//! Untouched nodes are written from their source text. Nodes whose
//! coordinates changed are rendered in the layer's own numeric format and
//! keep the whitespace that followed them.

use crate::cam::LayerFile;

/// Render a layer back to text
pub fn serialize(layer: &LayerFile) -> String {
    let capacity = layer.preamble.len()
        + layer.epilogue.len()
        + layer
            .nodes
            .iter()
            .map(|n| n.raw.len() + n.trailer.len() + 4)
            .sum::<usize>();

    let mut out = String::with_capacity(capacity);
    out.push_str(&layer.preamble);
    for node in &layer.nodes {
        out.push_str(&node.render(&layer.format));
        out.push_str(&node.trailer);
    }
    out.push_str(&layer.epilogue);
    out
}
