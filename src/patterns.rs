//! Layer classification for CAM members
//!
//! Strategies only touch some layers (silkscreen, board outline, drill), so
//! every member is classified by its filename convention first and by hints
//! in its own header second.

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, warn};

/// Represents a layer type in PCB files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerType {
    // Drill layers
    NpthThrough,
    PthThrough,

    // Bottom layers
    BottomSilkscreen,
    BottomSoldermask,
    BottomPasteMask,
    BottomCopper,

    // Top layers
    TopSilkscreen,
    TopSoldermask,
    TopPasteMask,
    TopCopper,

    // Special layers
    BoardOutline,
    InnerLayer(u32),

    // Recognised CAM content with no known role
    Other,
}

impl LayerType {
    pub fn is_silkscreen(&self) -> bool {
        matches!(self, LayerType::TopSilkscreen | LayerType::BottomSilkscreen)
    }

    pub fn is_outline(&self) -> bool {
        matches!(self, LayerType::BoardOutline)
    }
}

/// Filename conventions of one EDA tool
#[derive(Debug, Clone)]
pub struct EdaPatterns {
    pub name: String,
    patterns: Vec<(LayerType, Regex)>,
}

impl EdaPatterns {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            patterns: Vec::new(),
        }
    }

    /// Add a pattern for a specific layer type. Earlier patterns win.
    pub fn add_pattern(&mut self, layer_type: LayerType, pattern: &str) {
        match Regex::new(pattern) {
            Ok(regex) => self.patterns.push((layer_type, regex)),
            Err(e) => warn!("Invalid regex pattern {}: {}", pattern, e),
        }
    }

    /// Match a filename against all patterns and return the layer type
    pub fn match_filename(&self, filename: &str) -> Option<LayerType> {
        for (layer_type, regex) in &self.patterns {
            if let Some(caps) = regex.captures(filename) {
                debug!(
                    "Matched '{}' to {:?} using {} pattern '{}'",
                    filename,
                    layer_type,
                    self.name,
                    regex.as_str()
                );

                if let LayerType::InnerLayer(_) = layer_type {
                    let number = caps
                        .get(1)
                        .and_then(|m| m.as_str().parse::<u32>().ok())
                        .unwrap_or(0);
                    return Some(LayerType::InnerLayer(number));
                }

                return Some(*layer_type);
            }
        }
        None
    }
}

/// Pattern matcher factory for different EDA software types
pub struct PatternMatcher;

impl PatternMatcher {
    /// Create patterns for KiCad
    pub fn create_kicad_patterns() -> EdaPatterns {
        let mut patterns = EdaPatterns::new("KiCad");

        // NPTH before the generic drill fallback
        patterns.add_pattern(LayerType::NpthThrough, r"(?i)-NPTH\.drl$");
        patterns.add_pattern(LayerType::PthThrough, r"(?i)-PTH\.drl$");

        patterns.add_pattern(LayerType::TopCopper, r"-F_Cu\.gbr$");
        patterns.add_pattern(LayerType::BottomCopper, r"-B_Cu\.gbr$");
        patterns.add_pattern(LayerType::InnerLayer(0), r"-In(\d+)_Cu\.gbr$");

        patterns.add_pattern(LayerType::TopSoldermask, r"-F_Mask\.gbr$");
        patterns.add_pattern(LayerType::BottomSoldermask, r"-B_Mask\.gbr$");
        patterns.add_pattern(LayerType::TopPasteMask, r"-F_Paste\.gbr$");
        patterns.add_pattern(LayerType::BottomPasteMask, r"-B_Paste\.gbr$");

        patterns.add_pattern(LayerType::TopSilkscreen, r"-F_(?:Silkscreen|SilkS)\.gbr$");
        patterns.add_pattern(LayerType::BottomSilkscreen, r"-B_(?:Silkscreen|SilkS)\.gbr$");

        patterns.add_pattern(LayerType::BoardOutline, r"-Edge_Cuts\.gbr$");

        patterns
    }

    /// Create patterns for Protel/Altium Designer
    pub fn create_protel_patterns() -> EdaPatterns {
        let mut patterns = EdaPatterns::new("Protel");

        patterns.add_pattern(LayerType::TopCopper, r"(?i)\.gtl$");
        patterns.add_pattern(LayerType::BottomCopper, r"(?i)\.gbl$");

        patterns.add_pattern(LayerType::TopSoldermask, r"(?i)\.gts$");
        patterns.add_pattern(LayerType::BottomSoldermask, r"(?i)\.gbs$");

        patterns.add_pattern(LayerType::TopPasteMask, r"(?i)\.gtp$");
        patterns.add_pattern(LayerType::BottomPasteMask, r"(?i)\.gbp$");

        patterns.add_pattern(LayerType::TopSilkscreen, r"(?i)\.gto$");
        patterns.add_pattern(LayerType::BottomSilkscreen, r"(?i)\.gbo$");

        patterns.add_pattern(LayerType::BoardOutline, r"(?i)\.gko$");
        patterns.add_pattern(LayerType::BoardOutline, r"(?i)\.gm1$");
        patterns.add_pattern(LayerType::BoardOutline, r"(?i)\.outline$");
        patterns.add_pattern(LayerType::BoardOutline, r"(?i)\.oln$");

        patterns.add_pattern(LayerType::InnerLayer(0), r"(?i)\.g(\d+)$");
        patterns.add_pattern(LayerType::InnerLayer(0), r"(?i)\.gp(\d+)$");

        patterns.add_pattern(LayerType::NpthThrough, r"(?i)npth\.(?:drl|txt|xln)$");
        patterns.add_pattern(LayerType::PthThrough, r"(?i)\.(?:drl|xln|exc|drd)$");

        patterns
    }

    /// Create patterns for EasyEDA / JLC exports
    pub fn create_jlc_patterns() -> EdaPatterns {
        let mut patterns = EdaPatterns::new("JLC");

        patterns.add_pattern(LayerType::NpthThrough, r"^Drill_NPTH_Through\.DRL$");
        patterns.add_pattern(LayerType::PthThrough, r"^Drill_PTH_Through(?:_Via)?\.DRL$");

        patterns.add_pattern(LayerType::BottomSilkscreen, r"^Gerber_BottomSilkscreenLayer\.GBO$");
        patterns.add_pattern(LayerType::TopSilkscreen, r"^Gerber_TopSilkscreenLayer\.GTO$");
        patterns.add_pattern(LayerType::BoardOutline, r"^Gerber_BoardOutlineLayer\.GKO$");
        patterns.add_pattern(LayerType::InnerLayer(0), r"^Gerber_InnerLayer(\d+)\.G\d+$");

        patterns
    }

    /// Classify a member by its filename across all known conventions
    pub fn classify_filename(path: &str) -> Option<LayerType> {
        let filename = path.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(path);
        ALL_PATTERNS
            .iter()
            .find_map(|patterns| patterns.match_filename(filename))
    }

    /// Classify a member from hints inside its own header
    pub fn classify_header(content: &str) -> Option<LayerType> {
        if let Some(caps) = FILE_FUNCTION.captures(content) {
            let function = caps[1].to_ascii_lowercase();
            let side = caps.get(2).map(|m| m.as_str().to_ascii_lowercase());
            let bottom = side.as_deref().is_some_and(|s| s.contains("bot"));
            let layer = match function.as_str() {
                "legend" if bottom => Some(LayerType::BottomSilkscreen),
                "legend" => Some(LayerType::TopSilkscreen),
                "profile" => Some(LayerType::BoardOutline),
                "soldermask" if bottom => Some(LayerType::BottomSoldermask),
                "soldermask" => Some(LayerType::TopSoldermask),
                "paste" if bottom => Some(LayerType::BottomPasteMask),
                "paste" => Some(LayerType::TopPasteMask),
                "copper" if bottom => Some(LayerType::BottomCopper),
                "copper" => Some(LayerType::TopCopper),
                "plated" => Some(LayerType::PthThrough),
                "nonplated" => Some(LayerType::NpthThrough),
                _ => None,
            };
            if layer.is_some() {
                return layer;
            }
        }

        let caps = LAYER_COMMENT.captures(content)?;
        let name = caps[1].to_ascii_lowercase();
        if name.contains("silk") || name.contains("legend") || name.contains("overlay") {
            if name.contains("bottom") {
                Some(LayerType::BottomSilkscreen)
            } else {
                Some(LayerType::TopSilkscreen)
            }
        } else if name.contains("outline") || name.contains("edge") || name.contains("profile") {
            Some(LayerType::BoardOutline)
        } else {
            None
        }
    }

    /// Filename first, header hints second
    pub fn classify(path: &str, content: &str) -> LayerType {
        Self::classify_filename(path)
            .or_else(|| Self::classify_header(content))
            .unwrap_or(LayerType::Other)
    }
}

lazy_static! {
    static ref ALL_PATTERNS: Vec<EdaPatterns> = vec![
        PatternMatcher::create_kicad_patterns(),
        PatternMatcher::create_jlc_patterns(),
        PatternMatcher::create_protel_patterns(),
    ];
    static ref FILE_FUNCTION: Regex =
        Regex::new(r"%TF\.FileFunction,([A-Za-z]+)((?:,[^,*]*)*)").expect("valid regex");
    static ref LAYER_COMMENT: Regex =
        Regex::new(r"(?mi)^G04 Layer:\s*([^*]+)\*").expect("valid regex");
}
