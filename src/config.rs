//! Configuration management for GhostPCB
//!
//! This module handles CLI argument parsing, the request contract shared
//! with other front-ends, and logging setup.

use anyhow::{anyhow, bail, Context, Result};
use clap::builder::styling;
use clap::{value_parser, Arg, ArgMatches, ColorChoice, Command};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::info;

use crate::error::ResultExt;

/// Names accepted by `--strategies`
pub const STRATEGY_NAMES: [&str; 5] = ["timestamp", "silkscreen", "geometry", "structure", "physical"];

/// Which strategies a request enables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObfuscateOptions {
    pub timestamp: bool,
    pub silkscreen: bool,
    pub geometry: bool,
    pub structure: bool,
    pub physical: bool,
}

impl Default for ObfuscateOptions {
    fn default() -> Self {
        Self {
            timestamp: true,
            silkscreen: true,
            geometry: true,
            structure: true,
            physical: true,
        }
    }
}

impl ObfuscateOptions {
    pub fn none() -> Self {
        Self {
            timestamp: false,
            silkscreen: false,
            geometry: false,
            structure: false,
            physical: false,
        }
    }

    pub fn any_enabled(&self) -> bool {
        self.timestamp || self.silkscreen || self.geometry || self.structure || self.physical
    }

    /// Parse a comma separated list such as `timestamp,geometry`
    pub fn from_list(list: &str) -> Result<Self> {
        let mut options = Self::none();
        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            match name.to_ascii_lowercase().as_str() {
                "all" => options = Self::default(),
                "timestamp" => options.timestamp = true,
                "silkscreen" => options.silkscreen = true,
                "geometry" => options.geometry = true,
                "structure" => options.structure = true,
                "physical" => options.physical = true,
                other => bail!(
                    "Unknown strategy '{}', expected one of: {}",
                    other,
                    STRATEGY_NAMES.join(", ")
                ),
            }
        }
        Ok(options)
    }
}

/// One obfuscation job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRequest {
    /// Source ZIP
    pub input_path: String,
    /// Destination directory; the input's directory when absent
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default)]
    pub options: ObfuscateOptions,
}

fn default_count() -> u32 {
    1
}

impl ProcessRequest {
    pub fn new(input_path: impl Into<String>, count: u32) -> Self {
        Self {
            input_path: input_path.into(),
            output_dir: None,
            count,
            options: ObfuscateOptions::default(),
        }
    }
}

/// Build the CLI command
pub fn build_cli() -> Command {
    let styles = styling::Styles::styled()
        .header(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .usage(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .literal(styling::AnsiColor::Blue.on_default() | styling::Effects::BOLD)
        .placeholder(styling::AnsiColor::Cyan.on_default());

    Command::new("ghostpcb")
        .about("GhostPCB - Generate byte-distinct but manufacturing-equivalent Gerber packages")
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .help("Input Gerber/Excellon ZIP package")
                .value_parser(value_parser!(String))
                .required_unless_present("request"),
        )
        .arg(
            Arg::new("output_dir")
                .short('o')
                .long("output_dir")
                .help("Directory for the generated variants (default: next to the input)")
                .value_parser(value_parser!(String)),
        )
        .arg(
            Arg::new("count")
                .short('n')
                .long("count")
                .help("Number of variants to generate")
                .value_parser(value_parser!(u32).range(1..))
                .default_value("1"),
        )
        .arg(
            Arg::new("strategies")
                .short('s')
                .long("strategies")
                .help("Comma separated strategies: timestamp,silkscreen,geometry,structure,physical")
                .value_parser(value_parser!(String))
                .default_value("all"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .help("Base seed for reproducible output")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("request")
                .long("request")
                .help("Read the request from a JSON file")
                .value_parser(value_parser!(String))
                .conflicts_with_all(["input", "output_dir", "count", "strategies"]),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print the result as JSON")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging output")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no_progress")
                .long("no-progress")
                .help("Disable progress indicators")
                .action(clap::ArgAction::SetTrue),
        )
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Input ZIP, unless the request comes from a file
    pub input: Option<PathBuf>,

    pub output_dir: Option<PathBuf>,

    pub count: u32,

    pub options: ObfuscateOptions,

    pub seed: Option<u64>,

    /// JSON request file
    pub request: Option<PathBuf>,

    /// Print the result as JSON
    pub json: bool,

    /// Enable verbose logging
    pub verbose: bool,

    /// Disable progress bars
    pub no_progress: bool,
}

impl Config {
    /// Parse arguments and apply initial configuration
    pub fn from_args() -> Result<Self> {
        let matches = build_cli().get_matches();
        let config = Self::from_matches(&matches)?;

        // RUST_LOG takes precedence over the verbose flag
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(if config.verbose { "info" } else { "off" })
        });

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();

        if config.verbose {
            info!("Configuration: {:?}", config);
        }

        Ok(config)
    }

    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let strategies = matches
            .get_one::<String>("strategies")
            .map(String::as_str)
            .unwrap_or("all");

        Ok(Config {
            input: matches.get_one::<String>("input").map(PathBuf::from),
            output_dir: matches.get_one::<String>("output_dir").map(PathBuf::from),
            count: matches.get_one::<u32>("count").copied().unwrap_or(1),
            options: ObfuscateOptions::from_list(strategies)?,
            seed: matches.get_one::<u64>("seed").copied(),
            request: matches.get_one::<String>("request").map(PathBuf::from),
            json: matches.get_flag("json"),
            verbose: matches.get_flag("verbose"),
            no_progress: matches.get_flag("no_progress"),
        })
    }

    /// The request this invocation describes
    pub fn to_request(&self) -> Result<ProcessRequest> {
        if let Some(path) = &self.request {
            let text = fs::read_to_string(path).with_path_context("read request", path)?;
            let request: ProcessRequest = serde_json::from_str(&text)
                .with_context(|| format!("Invalid request JSON in {}", path.display()))?;
            return Ok(request);
        }

        let input = self
            .input
            .as_ref()
            .ok_or_else(|| anyhow!("Input path is required"))?;
        Ok(ProcessRequest {
            input_path: input.display().to_string(),
            output_dir: self.output_dir.as_ref().map(|d| d.display().to_string()),
            count: self.count,
            options: self.options,
        })
    }
}
