//! In-memory model of a parsed CAM file
//!
//! A [`LayerFile`] is an ordered list of [`Node`]s. Every node keeps the exact
//! source text it was parsed from plus the whitespace that followed it, so a
//! file that no strategy touched serializes back byte for byte. Coordinates
//! are stored as fixed-point integers in millionths of the file unit and only
//! re-rendered when their value changes.

use crate::patterns::LayerType;
use std::borrow::Cow;

/// Fractional digits of the internal fixed-point representation
pub const INTERNAL_DECIMALS: u32 = 6;

/// Internal units per file unit
pub const INTERNAL_SCALE: i64 = 1_000_000;

/// Absolute position in internal units
pub type Position = (i64, i64);

/// CAM dialect of a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileFormat {
    Gerber,
    Excellon,
}

/// Coordinate unit declared by a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    Millimeters,
    Inches,
}

impl Unit {
    pub fn mm_per_unit(self) -> f64 {
        match self {
            Unit::Millimeters => 1.0,
            Unit::Inches => 25.4,
        }
    }
}

/// Which zeros are omitted from fixed-point coordinate digits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZeroSuppression {
    Leading,
    Trailing,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Notation {
    Absolute,
    Incremental,
}

/// Numeric coordinate format of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoordinateFormat {
    pub integer: u8,
    pub decimal: u8,
    pub zeros: ZeroSuppression,
    pub notation: Notation,
}

impl CoordinateFormat {
    /// Format assumed for Gerber files without `%FS`
    pub fn gerber_default() -> Self {
        Self {
            integer: 2,
            decimal: 4,
            zeros: ZeroSuppression::Leading,
            notation: Notation::Absolute,
        }
    }

    /// Format assumed for Excellon files without an explicit one
    pub fn excellon_default(unit: Unit) -> Self {
        let (integer, decimal) = match unit {
            Unit::Millimeters => (3, 3),
            Unit::Inches => (2, 4),
        };
        Self {
            integer,
            decimal,
            zeros: ZeroSuppression::Trailing,
            notation: Notation::Absolute,
        }
    }

    /// Resolution of implied-decimal coordinates in internal units
    pub fn step(&self) -> i64 {
        pow10(INTERNAL_DECIMALS.saturating_sub(self.decimal as u32))
    }

    fn total_digits(&self) -> usize {
        (self.integer + self.decimal) as usize
    }
}

pub(crate) fn pow10(exp: u32) -> i64 {
    10i64.pow(exp)
}

/// Integer division rounding half away from zero
fn round_div(value: i64, divisor: i64) -> i64 {
    let half = divisor / 2;
    if value >= 0 {
        (value + half) / divisor
    } else {
        (value - half) / divisor
    }
}

/// How a coordinate was written in the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordStyle {
    /// Fixed-point digits whose decimal point is implied by the file format.
    /// `width` is set when the source padded the suppressed side.
    Implied { width: Option<usize>, plus: bool },
    /// Explicit decimal point with at least `places` fractional digits
    Decimal {
        places: usize,
        int_width: usize,
        plus: bool,
    },
}

/// One coordinate value, remembering its source spelling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coord {
    value: i64,
    original: Option<i64>,
    text: String,
    style: CoordStyle,
}

impl Coord {
    /// Parse the numeric part of a coordinate word (`-12345`, `+25.24994`, ...)
    pub fn parse(text: &str, format: &CoordinateFormat) -> Option<Coord> {
        let (negative, plus, digits) = match text.as_bytes().first()? {
            b'-' => (true, false, &text[1..]),
            b'+' => (false, true, &text[1..]),
            _ => (false, false, text),
        };

        let (magnitude, style) = if let Some((int_part, frac_part)) = digits.split_once('.') {
            if int_part.is_empty() && frac_part.is_empty() {
                return None;
            }
            if !int_part.bytes().all(|b| b.is_ascii_digit())
                || !frac_part.bytes().all(|b| b.is_ascii_digit())
                || int_part.len() > 12
            {
                return None;
            }
            let int_value: i64 = if int_part.is_empty() {
                0
            } else {
                int_part.parse().ok()?
            };
            let mut frac = frac_part.to_string();
            frac.truncate(INTERNAL_DECIMALS as usize);
            while frac.len() < INTERNAL_DECIMALS as usize {
                frac.push('0');
            }
            let frac_value: i64 = frac.parse().ok()?;
            (
                int_value * INTERNAL_SCALE + frac_value,
                CoordStyle::Decimal {
                    places: frac_part.len(),
                    int_width: int_part.len(),
                    plus,
                },
            )
        } else {
            if digits.is_empty() || digits.len() > 15 || !digits.bytes().all(|b| b.is_ascii_digit())
            {
                return None;
            }
            let mut number: i64 = digits.parse().ok()?;
            let total = format.total_digits();
            if format.zeros == ZeroSuppression::Trailing && digits.len() < total {
                number *= pow10((total - digits.len()) as u32);
            }
            let padded = match format.zeros {
                ZeroSuppression::Leading => digits.len() > 1 && digits.starts_with('0'),
                ZeroSuppression::Trailing => digits.len() > 1 && digits.ends_with('0'),
                ZeroSuppression::None => false,
            };
            (
                number * format.step(),
                CoordStyle::Implied {
                    width: padded.then_some(digits.len()),
                    plus,
                },
            )
        };

        let value = if negative { -magnitude } else { magnitude };
        Some(Coord {
            value,
            original: Some(value),
            text: text.to_string(),
            style,
        })
    }

    /// A coordinate that did not exist in the source, spelled like `donor`
    pub fn synthesize(value: i64, donor: Option<&Coord>) -> Coord {
        let style = match donor.map(|c| c.style) {
            Some(CoordStyle::Decimal {
                places, int_width, ..
            }) => CoordStyle::Decimal {
                places,
                int_width: int_width.max(1),
                plus: false,
            },
            _ => CoordStyle::Implied {
                width: None,
                plus: false,
            },
        };
        Coord {
            value,
            original: None,
            text: String::new(),
            style,
        }
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn set_value(&mut self, value: i64) {
        self.value = value;
    }

    pub fn style(&self) -> CoordStyle {
        self.style
    }

    pub fn is_modified(&self) -> bool {
        self.original != Some(self.value)
    }

    /// Smallest change this coordinate can carry without changing its spelling class
    pub fn step(&self, format: &CoordinateFormat) -> i64 {
        match self.style {
            CoordStyle::Implied { .. } => format.step(),
            CoordStyle::Decimal { places, .. } => {
                let digits = (places as u32).max(format.decimal as u32);
                pow10(INTERNAL_DECIMALS.saturating_sub(digits))
            }
        }
    }

    pub fn render(&self, format: &CoordinateFormat) -> Cow<'_, str> {
        if !self.is_modified() {
            return Cow::Borrowed(&self.text);
        }

        let negative = self.value < 0;
        let (body, plus) = match self.style {
            CoordStyle::Implied { width, plus } => {
                let magnitude = round_div(self.value, format.step()).unsigned_abs();
                let total = format.total_digits();
                let mut digits = match format.zeros {
                    ZeroSuppression::Leading => magnitude.to_string(),
                    ZeroSuppression::None => format!("{:0width$}", magnitude, width = total),
                    ZeroSuppression::Trailing => {
                        let full = format!("{:0width$}", magnitude, width = total);
                        let trimmed = full.trim_end_matches('0');
                        if trimmed.is_empty() {
                            "0".to_string()
                        } else {
                            trimmed.to_string()
                        }
                    }
                };
                if let Some(width) = width {
                    while digits.len() < width {
                        match format.zeros {
                            ZeroSuppression::Trailing => digits.push('0'),
                            _ => digits.insert(0, '0'),
                        }
                    }
                }
                (digits, plus)
            }
            CoordStyle::Decimal {
                places,
                int_width,
                plus,
            } => {
                let magnitude = self.value.unsigned_abs();
                let int_value = magnitude / INTERNAL_SCALE as u64;
                let frac_full = format!("{:06}", magnitude % INTERNAL_SCALE as u64);
                let mut frac = frac_full.trim_end_matches('0').to_string();
                while frac.len() < places {
                    frac.push('0');
                }
                let int_digits = if int_value == 0 && int_width == 0 {
                    String::new()
                } else {
                    format!("{:0width$}", int_value, width = int_width.max(1))
                };
                (format!("{}.{}", int_digits, frac), plus)
            }
        };

        let sign = if negative {
            "-"
        } else if plus {
            "+"
        } else {
            ""
        };
        Cow::Owned(format!("{}{}", sign, body))
    }
}

/// A data block carrying coordinates: `prefix X.. Y.. I.. J.. suffix`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordWord {
    pub prefix: String,
    pub x: Option<Coord>,
    pub y: Option<Coord>,
    pub i: Option<Coord>,
    pub j: Option<Coord>,
    pub suffix: String,
}

impl CoordWord {
    pub fn is_modified(&self) -> bool {
        [&self.x, &self.y, &self.i, &self.j]
            .iter()
            .any(|c| c.as_ref().is_some_and(Coord::is_modified))
    }

    pub fn render(&self, format: &CoordinateFormat) -> String {
        let mut out = self.prefix.clone();
        for (letter, coord) in [('X', &self.x), ('Y', &self.y), ('I', &self.i), ('J', &self.j)] {
            if let Some(coord) = coord {
                out.push(letter);
                out.push_str(&coord.render(format));
            }
        }
        out.push_str(&self.suffix);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Linear,
    Clockwise,
    CounterClockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuadrantMode {
    Single,
    Multi,
}

/// Gerber operation of a draw/flash block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawOp {
    Draw,
    Flash,
}

/// Typed meaning of one node
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `G04 ...*` or `;...`
    Comment(String),
    /// Header attribute such as `%TF.CreationDate,...*%`
    HeaderDirective { key: String, value: String },
    FormatSpec(CoordinateFormat),
    Units(Unit),
    Notation(Notation),
    ApertureDefinition {
        code: u32,
        shape: String,
        params: Vec<f64>,
    },
    /// Excellon tool table entry
    ToolDefinition { code: u32, diameter: f64 },
    /// Aperture (Gerber) or tool (Excellon) selection
    ToolSelect(u32),
    Interpolation(Interpolation),
    ArcParams(QuadrantMode),
    Region(bool),
    /// `D02`
    Move {
        word: CoordWord,
        mode: Option<Interpolation>,
    },
    /// `D01` / `D03`
    FlashOrDraw {
        word: CoordWord,
        op: DrawOp,
        mode: Option<Interpolation>,
    },
    DrillHit { word: CoordWord, tool: Option<u32> },
    /// Excellon statement that moves the tool without a plain hit: a `G85`
    /// slot, a rout move or an `R` repeat. Only its end point is tracked and
    /// it is never moved itself.
    ToolPath {
        x: Option<i64>,
        y: Option<i64>,
        /// Repeat count of an `R` code; `x`/`y` are then per-step offsets
        repeat: u32,
        /// The end point depends on the position before this statement
        modal: bool,
    },
    EndOfFile,
    /// Anything the parser does not model; re-emitted verbatim
    Passthrough,
}

impl Command {
    pub fn word(&self) -> Option<&CoordWord> {
        match self {
            Command::Move { word, .. }
            | Command::FlashOrDraw { word, .. }
            | Command::DrillHit { word, .. } => Some(word),
            _ => None,
        }
    }

    pub fn word_mut(&mut self) -> Option<&mut CoordWord> {
        match self {
            Command::Move { word, .. }
            | Command::FlashOrDraw { word, .. }
            | Command::DrillHit { word, .. } => Some(word),
            _ => None,
        }
    }
}

/// One parsed statement with its source spelling
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub command: Command,
    pub raw: String,
    /// Whitespace between this statement and the next
    pub trailer: String,
}

impl Node {
    pub fn new(command: Command, raw: impl Into<String>, trailer: impl Into<String>) -> Self {
        Self {
            command,
            raw: raw.into(),
            trailer: trailer.into(),
        }
    }

    pub fn render(&self, format: &CoordinateFormat) -> Cow<'_, str> {
        match self.command.word() {
            Some(word) if word.is_modified() => Cow::Owned(word.render(format)),
            _ => Cow::Borrowed(&self.raw),
        }
    }

    /// Rewrite the free text of comments and header directives
    pub fn rewrite_text<F: Fn(&str) -> String>(&mut self, rewrite: F) -> bool {
        let changed = match &mut self.command {
            Command::Comment(text) => {
                *text = rewrite(text);
                true
            }
            Command::HeaderDirective { value, .. } => {
                *value = rewrite(value);
                true
            }
            _ => false,
        };
        if changed {
            self.raw = rewrite(&self.raw);
        }
        changed
    }
}

/// Where a positional node starts and ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located {
    pub from: Position,
    pub at: Position,
    pub incremental: bool,
}

/// One parsed Gerber or Excellon member
#[derive(Debug, Clone, PartialEq)]
pub struct LayerFile {
    pub path: String,
    pub kind: FileFormat,
    pub layer: LayerType,
    pub unit: Unit,
    pub format: CoordinateFormat,
    pub preamble: String,
    pub nodes: Vec<Node>,
    pub epilogue: String,
    pub line_ending: &'static str,
}

impl LayerFile {
    pub fn mm_to_internal(&self, mm: f64) -> f64 {
        mm / self.unit.mm_per_unit() * INTERNAL_SCALE as f64
    }

    pub fn internal_to_mm(&self, value: i64) -> f64 {
        value as f64 / INTERNAL_SCALE as f64 * self.unit.mm_per_unit()
    }

    /// Resolution of this layer's implied coordinates in internal units
    pub fn step(&self) -> i64 {
        self.format.step()
    }

    /// Absolute start and end of every positional node, `None` elsewhere
    pub fn locate(&self) -> Vec<Option<Located>> {
        self.walk()
            .into_iter()
            .zip(&self.nodes)
            .map(|(loc, node)| match node.command {
                Command::ToolPath { .. } => None,
                _ => loc,
            })
            .collect()
    }

    /// Positional nodes that must stay put because a following tool path
    /// takes its start from them
    pub fn pinned(&self) -> Vec<bool> {
        let mut pinned = vec![false; self.nodes.len()];
        let mut last: Option<usize> = None;
        for (index, loc) in self.walk().into_iter().enumerate() {
            let Some(loc) = loc else {
                continue;
            };
            if let Command::ToolPath { modal, .. } = self.nodes[index].command {
                if modal || loc.incremental {
                    if let Some(anchor) = last {
                        pinned[anchor] = true;
                    }
                }
            }
            last = Some(index);
        }
        pinned
    }

    /// Like `locate`, but tool paths report where they leave the tool
    fn walk(&self) -> Vec<Option<Located>> {
        let mut notation = self.format.notation;
        let mut current: Position = (0, 0);

        self.nodes
            .iter()
            .map(|node| match &node.command {
                Command::Notation(n) => {
                    notation = *n;
                    None
                }
                Command::FormatSpec(f) => {
                    notation = f.notation;
                    None
                }
                Command::ToolPath { x, y, repeat, .. } => {
                    let incremental = notation == Notation::Incremental;
                    let at = if *repeat > 0 {
                        let steps = *repeat as i64;
                        (
                            current.0 + x.unwrap_or(0) * steps,
                            current.1 + y.unwrap_or(0) * steps,
                        )
                    } else if incremental {
                        (current.0 + x.unwrap_or(0), current.1 + y.unwrap_or(0))
                    } else {
                        (x.unwrap_or(current.0), y.unwrap_or(current.1))
                    };
                    let located = Located {
                        from: current,
                        at,
                        incremental,
                    };
                    current = at;
                    Some(located)
                }
                command => command.word().map(|word| {
                    let incremental = notation == Notation::Incremental;
                    let axis = |coord: &Option<Coord>, cur: i64| match coord {
                        Some(c) if incremental => cur + c.value(),
                        Some(c) => c.value(),
                        None => cur,
                    };
                    let at = (axis(&word.x, current.0), axis(&word.y, current.1));
                    let located = Located {
                        from: current,
                        at,
                        incremental,
                    };
                    current = at;
                    located
                }),
            })
            .collect()
    }

    /// Move positional nodes to new absolute endpoints.
    ///
    /// `targets` is indexed like `nodes`; `None` keeps a node where it is.
    /// Incremental deltas are recomputed, and an omitted axis is written out
    /// when the modal value it relied on no longer matches.
    /// Tool paths are never moved; the nodes after them continue from
    /// their unchanged end point.
    pub fn reposition(&mut self, targets: &[Option<Position>]) {
        let located = self.walk();
        let mut previous: Position = (0, 0);

        for (index, node) in self.nodes.iter_mut().enumerate() {
            let Some(loc) = located[index] else {
                continue;
            };
            let target = match node.command {
                Command::ToolPath { .. } => loc.at,
                _ => targets.get(index).copied().flatten().unwrap_or(loc.at),
            };
            if let Some(word) = node.command.word_mut() {
                let donor = word.x.clone().or_else(|| word.y.clone());
                update_axis(&mut word.x, target.0, previous.0, loc.incremental, donor.as_ref());
                update_axis(&mut word.y, target.1, previous.1, loc.incremental, donor.as_ref());
            }
            previous = target;
        }
    }

    /// Number of nodes whose coordinates differ from the source
    pub fn modified_nodes(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.command.word().is_some_and(CoordWord::is_modified))
            .count()
    }
}

fn update_axis(
    slot: &mut Option<Coord>,
    target: i64,
    previous: i64,
    incremental: bool,
    donor: Option<&Coord>,
) {
    let wanted = if incremental { target - previous } else { target };
    match slot {
        Some(coord) => coord.set_value(wanted),
        None => {
            let implied = if incremental { 0 } else { previous };
            if wanted != implied {
                *slot = Some(Coord::synthesize(wanted, donor));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(integer: u8, decimal: u8, zeros: ZeroSuppression) -> CoordinateFormat {
        CoordinateFormat {
            integer,
            decimal,
            zeros,
            notation: Notation::Absolute,
        }
    }

    #[test]
    fn test_leading_suppressed_coordinates() {
        let f = fmt(4, 6, ZeroSuppression::Leading);
        let c = Coord::parse("-12500000", &f).unwrap();
        assert_eq!(c.value(), -12_500_000);
        assert_eq!(c.render(&f), "-12500000");

        let mut c = Coord::parse("1000", &fmt(2, 4, ZeroSuppression::Leading)).unwrap();
        assert_eq!(c.value(), 100_000);
        c.set_value(100_300);
        assert_eq!(c.render(&fmt(2, 4, ZeroSuppression::Leading)), "1003");
    }

    #[test]
    fn test_trailing_suppressed_coordinates() {
        let f = fmt(2, 4, ZeroSuppression::Trailing);
        // "0125" means 01.25 inch
        let mut c = Coord::parse("0125", &f).unwrap();
        assert_eq!(c.value(), 1_250_000);
        c.set_value(1_250_300);
        assert_eq!(c.render(&f), "012503");
        c.set_value(1_000_000);
        assert_eq!(c.render(&f), "01");
    }

    #[test]
    fn test_decimal_coordinates_keep_their_spelling() {
        let f = CoordinateFormat::excellon_default(Unit::Millimeters);
        let mut c = Coord::parse("25.24994", &f).unwrap();
        assert_eq!(c.value(), 25_249_940);
        assert_eq!(c.render(&f), "25.24994");

        c.set_value(25_259_940);
        assert_eq!(c.render(&f), "25.25994");

        let mut c = Coord::parse("8.763", &f).unwrap();
        c.set_value(8_750_000);
        assert_eq!(c.render(&f), "8.750");
    }

    #[test]
    fn test_padded_leading_zeros_survive_edits() {
        let f = fmt(3, 3, ZeroSuppression::Leading);
        let mut c = Coord::parse("012345", &f).unwrap();
        c.set_value(c.value() + 1000);
        assert_eq!(c.render(&f), "012346");
    }

    #[test]
    fn test_malformed_coordinates() {
        let f = CoordinateFormat::gerber_default();
        assert!(Coord::parse("", &f).is_none());
        assert!(Coord::parse("-", &f).is_none());
        assert!(Coord::parse("12a4", &f).is_none());
        assert!(Coord::parse("1.2.3", &f).is_none());
    }

    #[test]
    fn test_synthesized_coordinate_is_always_rendered() {
        let f = fmt(2, 4, ZeroSuppression::Leading);
        let c = Coord::synthesize(50_000, None);
        assert!(c.is_modified());
        assert_eq!(c.render(&f), "500");
    }

    #[test]
    fn test_synthesized_decimal_keeps_integer_digit() {
        let f = CoordinateFormat::excellon_default(Unit::Millimeters);
        let donor = Coord::parse("1.000", &f).unwrap();
        let c = Coord::synthesize(997_000, Some(&donor));
        assert_eq!(c.render(&f), "0.997");

        let donor = Coord::parse("012.50", &f).unwrap();
        let c = Coord::synthesize(3_250_000, Some(&donor));
        assert_eq!(c.render(&f), "003.25");
    }
}
