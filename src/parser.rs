//! Format detection and tokenizing of Gerber and Excellon members
//!
//! Gerber is split into `%...%` extended blocks and `*`-terminated words,
//! Excellon into lines. Whatever sits between two statements (spaces, line
//! breaks) is kept as the trailer of the earlier node. Statements the model
//! has no type for become [`Command::Passthrough`] nodes so that nothing is
//! dropped on the way back out.

use crate::cam::{
    Command, Coord, CoordWord, CoordinateFormat, DrawOp, FileFormat, Interpolation, LayerFile,
    Node, Notation, QuadrantMode, Unit, ZeroSuppression, INTERNAL_DECIMALS,
};
use crate::error::{GhostPcbError, Result};
use crate::patterns::PatternMatcher;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

/// What a member of the input archive holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Gerber,
    Excellon,
    /// Not CAM data; copied verbatim into every variant
    Other,
}

impl MemberKind {
    pub fn format(self) -> Option<FileFormat> {
        match self {
            MemberKind::Gerber => Some(FileFormat::Gerber),
            MemberKind::Excellon => Some(FileFormat::Excellon),
            MemberKind::Other => None,
        }
    }
}

const DRILL_EXTENSIONS: [&str; 6] = ["drl", "drd", "xln", "exc", "txt", "nc"];

lazy_static! {
    static ref EXCELLON_HINT: Regex =
        Regex::new(r"(?m)^\s*(?:M48\s*$|T\d+(?:[A-Z][\d.]+)*C[\d.]+)").expect("valid regex");
    static ref GERBER_HINT: Regex = Regex::new(
        r"%FS[LTD]?[AI]|%MO(?:MM|IN)|%ADD\d+|X[+-]?\d+Y[+-]?\d+D0?[123]\*|G04[^*\n]*\*"
    )
    .expect("valid regex");
    static ref BARE_HIT: Regex = Regex::new(r"(?m)^\s*X[+-]?[\d.]+Y[+-]?[\d.]+\s*$").expect("valid regex");

    static ref TOOL_SELECT: Regex = Regex::new(r"^(?:G54)?D0*(\d+)$").expect("valid regex");
    static ref OPERATION: Regex = Regex::new(
        r"^(?P<prefix>G0?[123]|G5[45])?(?:X(?P<x>[^XYIJD]*))?(?:Y(?P<y>[^XYIJD]*))?(?:I(?P<i>[^XYIJD]*))?(?:J(?P<j>[^XYIJD]*))?(?P<d>D0*[123])?$"
    )
    .expect("valid regex");
    static ref COORDINATE_LIKE: Regex = Regex::new(r"^(?:G0?[123])?[XYIJ]").expect("valid regex");
    static ref FORMAT_SPEC: Regex =
        Regex::new(r"^FS([LTD]?)([AI])X(\d)(\d)Y(\d)(\d)\*").expect("valid regex");
    static ref APERTURE: Regex =
        Regex::new(r"^ADD(\d+)([^,*]+)(?:,([^*]*))?\*").expect("valid regex");
    static ref FILE_ATTRIBUTE: Regex = Regex::new(r"^TF(\.?[^,*]*)(?:,([^*]*))?\*").expect("valid regex");

    static ref EXCELLON_UNITS: Regex =
        Regex::new(r"^(METRIC|INCH)(?:,(LZ|TZ))?(?:,(0*)\.(0*))?$").expect("valid regex");
    static ref FILE_FORMAT_HINT: Regex = Regex::new(r"FILE_FORMAT=(\d+):(\d+)").expect("valid regex");
    static ref EXCELLON_TOOL: Regex = Regex::new(r"^T(\d+)(.*)$").expect("valid regex");
    static ref TOOL_DIAMETER: Regex = Regex::new(r"C([^A-Z]*)").expect("valid regex");
    static ref DRILL_HIT: Regex =
        Regex::new(r"^(?:X(?P<x>[^XY]+))?(?:Y(?P<y>[^XY]+))?$").expect("valid regex");
    static ref ROUT_MODE: Regex = Regex::new(r"^G0[0-3]").expect("valid regex");
    static ref PATH_X: Regex = Regex::new(r"X([+-]?[\d.]+)").expect("valid regex");
    static ref PATH_Y: Regex = Regex::new(r"Y([+-]?[\d.]+)").expect("valid regex");
    static ref REPEAT: Regex =
        Regex::new(r"^R(\d+)(?:X(?P<x>[+-]?[\d.]+))?(?:Y(?P<y>[+-]?[\d.]+))?$").expect("valid regex");
}

/// Decide whether a member is Gerber, Excellon or something else
pub fn detect(path: &str, bytes: &[u8]) -> MemberKind {
    let Ok(text) = std::str::from_utf8(bytes) else {
        return MemberKind::Other;
    };

    if EXCELLON_HINT.is_match(text) && !text.contains("%FS") {
        return MemberKind::Excellon;
    }
    if GERBER_HINT.is_match(text) {
        return MemberKind::Gerber;
    }

    let extension = path
        .rsplit('.')
        .next()
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();
    if path.contains('.') && DRILL_EXTENSIONS.contains(&extension.as_str()) && BARE_HIT.is_match(text)
    {
        return MemberKind::Excellon;
    }

    MemberKind::Other
}

/// Parse one member into the CAM model
pub fn parse_layer(path: &str, text: &str, kind: FileFormat) -> Result<LayerFile> {
    let mut layer = match kind {
        FileFormat::Gerber => GerberParser::new(path).parse(text)?,
        FileFormat::Excellon => ExcellonParser::new(path).parse(text)?,
    };
    layer.layer = PatternMatcher::classify(path, text);
    layer.line_ending = if text.contains("\r\n") { "\r\n" } else { "\n" };

    debug!(
        "Parsed {} as {:?} {:?}: {} nodes, {:?}, {}.{} digits",
        path,
        layer.kind,
        layer.layer,
        layer.nodes.len(),
        layer.unit,
        layer.format.integer,
        layer.format.decimal
    );
    Ok(layer)
}

fn parse_error(path: &str, reason: impl Into<String>) -> anyhow::Error {
    GhostPcbError::parse(path, reason).into()
}

fn strip_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

fn parse_coord(
    path: &str,
    text: Option<regex::Match<'_>>,
    format: &CoordinateFormat,
) -> Result<Option<Coord>> {
    match text {
        None => Ok(None),
        Some(m) => Coord::parse(m.as_str(), format)
            .map(Some)
            .ok_or_else(|| parse_error(path, format!("malformed coordinate '{}'", m.as_str()))),
    }
}

fn push_whitespace(nodes: &mut [Node], preamble: &mut String, whitespace: &str) {
    match nodes.last_mut() {
        Some(node) => node.trailer.push_str(whitespace),
        None => preamble.push_str(whitespace),
    }
}

/// Modal state while walking a Gerber file
struct GerberParser<'a> {
    path: &'a str,
    unit: Option<Unit>,
    format: Option<CoordinateFormat>,
    last_op: Option<&'static str>,
    finished: bool,
}

impl<'a> GerberParser<'a> {
    fn new(path: &'a str) -> Self {
        Self {
            path,
            unit: None,
            format: None,
            last_op: None,
            finished: false,
        }
    }

    fn current_format(&self) -> CoordinateFormat {
        self.format.unwrap_or_else(CoordinateFormat::gerber_default)
    }

    fn parse(mut self, text: &str) -> Result<LayerFile> {
        let mut nodes: Vec<Node> = Vec::new();
        let mut preamble = String::new();
        let mut epilogue = String::new();
        let mut rest = text;

        while !rest.is_empty() {
            let trimmed = rest.trim_start();
            if trimmed.len() < rest.len() {
                let (whitespace, tail) = rest.split_at(rest.len() - trimmed.len());
                push_whitespace(&mut nodes, &mut preamble, whitespace);
                rest = tail;
                continue;
            }

            if self.finished {
                epilogue.push_str(rest);
                break;
            }

            let (end, what) = if rest.starts_with('%') {
                (rest[1..].find('%').map(|i| i + 2), "extended block")
            } else {
                (rest.find('*').map(|i| i + 1), "data block")
            };
            let Some(end) = end else {
                return Err(parse_error(
                    self.path,
                    format!("unterminated {} at byte {}", what, text.len() - rest.len()),
                ));
            };

            let (raw, tail) = rest.split_at(end);
            let command = if raw.starts_with('%') {
                self.extended(raw)?
            } else {
                self.word(raw)?
            };
            nodes.push(Node::new(command, raw, ""));
            rest = tail;
        }

        Ok(LayerFile {
            path: self.path.to_string(),
            kind: FileFormat::Gerber,
            layer: crate::patterns::LayerType::Other,
            unit: self.unit.unwrap_or(Unit::Inches),
            format: self.current_format(),
            preamble,
            nodes,
            epilogue,
            line_ending: "\n",
        })
    }

    fn extended(&mut self, raw: &str) -> Result<Command> {
        let body = strip_whitespace(&raw[1..raw.len() - 1]);

        if body.starts_with("FS") {
            let caps = FORMAT_SPEC
                .captures(&body)
                .ok_or_else(|| parse_error(self.path, format!("malformed format spec {}", raw)))?;
            let digit = |i: usize| caps[i].parse::<u8>().unwrap_or(0);
            let (x_int, x_dec, y_int, y_dec) = (digit(3), digit(4), digit(5), digit(6));
            if x_dec as u32 > INTERNAL_DECIMALS || y_dec != x_dec || y_int != x_int {
                return Err(parse_error(
                    self.path,
                    format!("unsupported coordinate format {}", raw),
                ));
            }
            let format = CoordinateFormat {
                integer: x_int,
                decimal: x_dec,
                zeros: match &caps[1] {
                    "T" => ZeroSuppression::Trailing,
                    "D" => ZeroSuppression::None,
                    _ => ZeroSuppression::Leading,
                },
                notation: match &caps[2] {
                    "I" => Notation::Incremental,
                    _ => Notation::Absolute,
                },
            };
            if body.contains("*MOMM*") {
                self.unit = Some(Unit::Millimeters);
            } else if body.contains("*MOIN*") {
                self.unit = Some(Unit::Inches);
            }
            self.format = Some(format);
            return Ok(Command::FormatSpec(format));
        }

        if body.starts_with("MO") {
            let unit = match body.as_str() {
                "MOMM*" => Unit::Millimeters,
                "MOIN*" => Unit::Inches,
                _ => {
                    return Err(parse_error(self.path, format!("malformed unit mode {}", raw)));
                }
            };
            self.unit = Some(unit);
            return Ok(Command::Units(unit));
        }

        if body.starts_with("ADD") {
            let caps = APERTURE
                .captures(&body)
                .ok_or_else(|| parse_error(self.path, format!("malformed aperture {}", raw)))?;
            let code = caps[1]
                .parse::<u32>()
                .map_err(|_| parse_error(self.path, format!("aperture code out of range {}", raw)))?;
            let params = match caps.get(3) {
                Some(m) if !m.as_str().is_empty() => m
                    .as_str()
                    .split('X')
                    .map(|p| p.parse::<f64>())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|_| {
                        parse_error(self.path, format!("malformed aperture parameters {}", raw))
                    })?,
                _ => Vec::new(),
            };
            return Ok(Command::ApertureDefinition {
                code,
                shape: caps[2].to_string(),
                params,
            });
        }

        if body.starts_with("TF") {
            // Attribute values may contain spaces, so match on the raw text
            let inner = raw[1..raw.len() - 1].trim();
            if let Some(caps) = FILE_ATTRIBUTE.captures(inner) {
                return Ok(Command::HeaderDirective {
                    key: caps[1].to_string(),
                    value: caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
                });
            }
        }

        Ok(Command::Passthrough)
    }

    fn word(&mut self, raw: &str) -> Result<Command> {
        let stripped = strip_whitespace(raw);
        let body = stripped.strip_suffix('*').unwrap_or(&stripped);

        if body.starts_with("G04") {
            let text = raw.trim().trim_start_matches("G04").trim_end_matches('*').trim();
            return Ok(Command::Comment(text.to_string()));
        }
        if body.is_empty() {
            return Ok(Command::Passthrough);
        }
        if matches!(body, "M02" | "M2" | "M00" | "M0" | "M30") {
            self.finished = true;
            return Ok(Command::EndOfFile);
        }

        if let Some(caps) = TOOL_SELECT.captures(body) {
            if let Ok(code) = caps[1].parse::<u32>() {
                if code >= 10 {
                    return Ok(Command::ToolSelect(code));
                }
            }
        }

        if let Some(caps) = OPERATION.captures(body) {
            let prefix = caps.name("prefix").map(|m| m.as_str()).unwrap_or("");
            let mode = match prefix {
                "G01" | "G1" => Some(Interpolation::Linear),
                "G02" | "G2" => Some(Interpolation::Clockwise),
                "G03" | "G3" => Some(Interpolation::CounterClockwise),
                _ => None,
            };
            let has_coords = ["x", "y", "i", "j"].iter().any(|n| caps.name(n).is_some());
            let d = caps.name("d").map(|m| m.as_str());

            if !has_coords && d.is_none() {
                return Ok(match mode {
                    Some(mode) => Command::Interpolation(mode),
                    None => Command::Passthrough,
                });
            }

            let format = self.current_format();
            let word = CoordWord {
                prefix: prefix.to_string(),
                x: parse_coord(self.path, caps.name("x"), &format)?,
                y: parse_coord(self.path, caps.name("y"), &format)?,
                i: parse_coord(self.path, caps.name("i"), &format)?,
                j: parse_coord(self.path, caps.name("j"), &format)?,
                suffix: format!("{}*", d.unwrap_or("")),
            };

            let op = match d.map(|d| d.trim_start_matches('D').trim_start_matches('0')) {
                Some("1") => "D01",
                Some("2") => "D02",
                Some("3") => "D03",
                _ => self.last_op.unwrap_or("D01"),
            };
            self.last_op = Some(op);

            return Ok(match op {
                "D02" => Command::Move { word, mode },
                "D03" => Command::FlashOrDraw {
                    word,
                    op: DrawOp::Flash,
                    mode,
                },
                _ => Command::FlashOrDraw {
                    word,
                    op: DrawOp::Draw,
                    mode,
                },
            });
        }

        if COORDINATE_LIKE.is_match(body) {
            return Err(parse_error(self.path, format!("malformed operation {}", raw.trim())));
        }

        Ok(match body {
            "G36" => Command::Region(true),
            "G37" => Command::Region(false),
            "G74" => Command::ArcParams(QuadrantMode::Single),
            "G75" => Command::ArcParams(QuadrantMode::Multi),
            "G90" => Command::Notation(Notation::Absolute),
            "G91" => Command::Notation(Notation::Incremental),
            "G70" => {
                self.unit = Some(Unit::Inches);
                Command::Units(Unit::Inches)
            }
            "G71" => {
                self.unit = Some(Unit::Millimeters);
                Command::Units(Unit::Millimeters)
            }
            _ => Command::Passthrough,
        })
    }
}

/// Modal state while walking an Excellon file
struct ExcellonParser<'a> {
    path: &'a str,
    unit: Option<Unit>,
    zeros: ZeroSuppression,
    digits: Option<(u8, u8)>,
    hint: Option<(u8, u8)>,
    in_header: bool,
    rout: bool,
    tool: Option<u32>,
    finished: bool,
}

impl<'a> ExcellonParser<'a> {
    fn new(path: &'a str) -> Self {
        Self {
            path,
            unit: None,
            zeros: ZeroSuppression::Trailing,
            digits: None,
            hint: None,
            in_header: false,
            rout: false,
            tool: None,
            finished: false,
        }
    }

    fn current_format(&self) -> CoordinateFormat {
        let mut format = CoordinateFormat::excellon_default(self.unit.unwrap_or(Unit::Inches));
        if let Some((integer, decimal)) = self.digits.or(self.hint) {
            format.integer = integer;
            format.decimal = decimal;
        }
        format.zeros = self.zeros;
        format
    }

    fn parse(mut self, text: &str) -> Result<LayerFile> {
        let mut nodes: Vec<Node> = Vec::new();
        let mut preamble = String::new();
        let mut epilogue = String::new();

        for line in text.split_inclusive('\n') {
            if self.finished {
                epilogue.push_str(line);
                continue;
            }

            let content = line.trim_end_matches(['\r', '\n']);
            let ending = &line[content.len()..];
            if content.trim().is_empty() {
                push_whitespace(&mut nodes, &mut preamble, line);
                continue;
            }

            let command = self.line(content)?;
            nodes.push(Node::new(command, content, ending));
        }

        let format = self.current_format();
        Ok(LayerFile {
            path: self.path.to_string(),
            kind: FileFormat::Excellon,
            layer: crate::patterns::LayerType::Other,
            unit: self.unit.unwrap_or(Unit::Inches),
            format,
            preamble,
            nodes,
            epilogue,
            line_ending: "\n",
        })
    }

    fn line(&mut self, content: &str) -> Result<Command> {
        let body = content.trim();

        if let Some(comment) = body.strip_prefix(';') {
            if let Some(caps) = FILE_FORMAT_HINT.captures(comment) {
                let integer = caps[1].parse::<u8>().unwrap_or(2);
                let decimal = caps[2].parse::<u8>().unwrap_or(4);
                if decimal as u32 <= INTERNAL_DECIMALS {
                    self.hint = Some((integer, decimal));
                }
            }
            return Ok(Command::Comment(comment.trim().to_string()));
        }

        if body.starts_with("METRIC") || body.starts_with("INCH") {
            let caps = EXCELLON_UNITS
                .captures(body)
                .ok_or_else(|| parse_error(self.path, format!("malformed unit header {}", body)))?;
            let unit = if &caps[1] == "METRIC" {
                Unit::Millimeters
            } else {
                Unit::Inches
            };
            match caps.get(2).map(|m| m.as_str()) {
                Some("LZ") => self.zeros = ZeroSuppression::Trailing,
                Some("TZ") => self.zeros = ZeroSuppression::Leading,
                _ => {}
            }
            if let (Some(integer), Some(decimal)) = (caps.get(3), caps.get(4)) {
                if decimal.len() as u32 > INTERNAL_DECIMALS {
                    return Err(parse_error(
                        self.path,
                        format!("unsupported coordinate format {}", body),
                    ));
                }
                self.digits = Some((integer.len() as u8, decimal.len() as u8));
            }
            self.unit = Some(unit);
            return Ok(Command::Units(unit));
        }

        match body {
            "M48" => {
                self.in_header = true;
                return Ok(Command::Passthrough);
            }
            "%" | "M95" => {
                self.in_header = false;
                return Ok(Command::Passthrough);
            }
            "M71" => {
                self.unit = Some(Unit::Millimeters);
                return Ok(Command::Units(Unit::Millimeters));
            }
            "M72" => {
                self.unit = Some(Unit::Inches);
                return Ok(Command::Units(Unit::Inches));
            }
            "G90" | "ICI,OFF" => return Ok(Command::Notation(Notation::Absolute)),
            "G91" | "ICI" | "ICI,ON" => return Ok(Command::Notation(Notation::Incremental)),
            "G05" | "G81" => {
                self.rout = false;
                return Ok(Command::Passthrough);
            }
            "M30" | "M00" => {
                self.finished = true;
                return Ok(Command::EndOfFile);
            }
            _ => {}
        }

        if ROUT_MODE.is_match(body) {
            self.rout = true;
            if body.contains('X') || body.contains('Y') {
                return self.tool_path(body);
            }
            return Ok(Command::Passthrough);
        }

        if let Some(caps) = REPEAT.captures(body) {
            let repeat = caps[1]
                .parse::<u32>()
                .map_err(|_| parse_error(self.path, format!("repeat count out of range {}", body)))?;
            let format = self.current_format();
            return Ok(Command::ToolPath {
                x: parse_coord(self.path, caps.name("x"), &format)?.map(|c| c.value()),
                y: parse_coord(self.path, caps.name("y"), &format)?.map(|c| c.value()),
                repeat,
                modal: true,
            });
        }

        if let Some(caps) = EXCELLON_TOOL.captures(body) {
            let code = caps[1]
                .parse::<u32>()
                .map_err(|_| parse_error(self.path, format!("tool code out of range {}", body)))?;
            let rest = &caps[2];
            if rest.is_empty() {
                if !self.in_header {
                    self.tool = Some(code);
                }
                return Ok(Command::ToolSelect(code));
            }
            if let Some(diameter) = TOOL_DIAMETER.captures(rest) {
                let diameter = diameter[1].parse::<f64>().map_err(|_| {
                    parse_error(self.path, format!("malformed tool diameter {}", body))
                })?;
                if !self.in_header {
                    self.tool = Some(code);
                }
                return Ok(Command::ToolDefinition { code, diameter });
            }
            return Ok(Command::Passthrough);
        }

        if body.starts_with('X') || body.starts_with('Y') {
            if body.contains("G85") || self.rout {
                return self.tool_path(body);
            }
            let caps = DRILL_HIT
                .captures(body)
                .ok_or_else(|| parse_error(self.path, format!("malformed drill hit {}", body)))?;
            let format = self.current_format();
            let start = content.len() - content.trim_start().len();
            let word = CoordWord {
                prefix: content[..start].to_string(),
                x: parse_coord(self.path, caps.name("x"), &format)?,
                y: parse_coord(self.path, caps.name("y"), &format)?,
                i: None,
                j: None,
                suffix: content[start + body.len()..].to_string(),
            };
            return Ok(Command::DrillHit {
                word,
                tool: self.tool,
            });
        }

        Ok(Command::Passthrough)
    }

    /// End point of a `G85` slot or a rout move
    fn tool_path(&self, body: &str) -> Result<Command> {
        let format = self.current_format();
        let axis = |text: &str, pattern: &Regex| -> Result<Option<i64>> {
            let digits = pattern.captures(text).and_then(|caps| caps.get(1));
            Ok(parse_coord(self.path, digits, &format)?.map(|c| c.value()))
        };

        let (start, end) = match body.split_once("G85") {
            Some((start, end)) => (Some(start), end),
            None => (None, body),
        };
        let (mut x, mut y) = (axis(end, &*PATH_X)?, axis(end, &*PATH_Y)?);
        let mut modal = x.is_none() || y.is_none();
        // An axis missing from the slot end repeats the slot start
        if let Some(start) = start {
            let (sx, sy) = (axis(start, &*PATH_X)?, axis(start, &*PATH_Y)?);
            modal = sx.is_none() || sy.is_none();
            x = x.or(sx);
            y = y.or(sy);
        }
        Ok(Command::ToolPath {
            x,
            y,
            repeat: 0,
            modal,
        })
    }
}
