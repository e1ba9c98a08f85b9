//! Rewrites generation dates and generator versions in headers and comments

use super::{PerturbationParams, Strategy};
use crate::cam::{Command, LayerFile};
use crate::error::Result;
use lazy_static::lazy_static;
use rand::rngs::StdRng;
use regex::{Captures, Regex};
use std::borrow::Cow;
use tracing::debug;

lazy_static! {
    static ref DATES: Regex = Regex::new(concat!(
        r"(?P<iso>\d{4}-\d{2}-\d{2}(?P<sep>[T ])\d{2}:\d{2}:\d{2})",
        r"|(?P<ymd_slash>\d{4}/\d{1,2}/\d{1,2})(?P<ymd_time> \d{1,2}:\d{2}(?::\d{2})?)?",
        r"|(?P<mdy>\d{1,2}/\d{1,2}/\d{4})(?P<mdy_time> \d{1,2}:\d{2}(?::\d{2})?)?",
        r"|(?P<ymd>\d{4}-\d{2}-\d{2})",
    ))
    .expect("valid regex");
    static ref GENERATOR: Regex = Regex::new(concat!(
        r"(?i)(?P<name>EasyEDA(?: Pro)?|KiCad|Pcbnew|Altium(?: Designer)?|Eagle|DipTrace|",
        r"Gerber Generator|Allegro|PADS|CircuitMaker)",
        r"(?P<gap>[^\d*\n]{0,16}?)(?P<version>\d+(?:\.\d+)+)"
    ))
    .expect("valid regex");
}

pub struct TimestampStrategy;

impl TimestampStrategy {
    /// Replace every recognised date, keeping the spelling of the original
    pub fn rewrite_dates<'t>(text: &'t str, params: &PerturbationParams) -> Cow<'t, str> {
        let ts = params.timestamp;
        DATES.replace_all(text, |caps: &Captures| {
            let time = |shape: Option<regex::Match>| match shape {
                Some(m) if m.as_str().matches(':').count() == 2 => ts.format(" %H:%M:%S").to_string(),
                Some(_) => ts.format(" %H:%M").to_string(),
                None => String::new(),
            };

            if caps.name("iso").is_some() {
                let pattern = format!("%Y-%m-%d{}%H:%M:%S", &caps["sep"]);
                ts.format(&pattern).to_string()
            } else if caps.name("ymd_slash").is_some() {
                format!("{}{}", ts.format("%Y/%m/%d"), time(caps.name("ymd_time")))
            } else if caps.name("mdy").is_some() {
                format!("{}{}", ts.format("%m/%d/%Y"), time(caps.name("mdy_time")))
            } else {
                ts.format("%Y-%m-%d").to_string()
            }
        })
    }

    /// Move the last component of generator versions by the variant's bump
    pub fn rewrite_generator<'t>(text: &'t str, params: &PerturbationParams) -> Cow<'t, str> {
        GENERATOR.replace_all(text, |caps: &Captures| {
            let version = &caps["version"];
            let (head, last) = version.rsplit_once('.').unwrap_or(("", version));
            let bumped = match last.parse::<i64>() {
                Ok(n) if n + params.generator_bump >= 0 => n + params.generator_bump,
                Ok(n) => n + params.generator_bump.abs(),
                Err(_) => return caps[0].to_string(),
            };
            format!("{}{}{}.{}", &caps["name"], &caps["gap"], head, bumped)
        })
    }
}

impl Strategy for TimestampStrategy {
    fn name(&self) -> &'static str {
        "timestamp"
    }

    fn applies_to(&self, layer: &LayerFile) -> bool {
        layer.nodes.iter().any(|n| {
            matches!(
                n.command,
                Command::Comment(_) | Command::HeaderDirective { .. }
            )
        })
    }

    fn apply(
        &self,
        layer: &mut LayerFile,
        params: &PerturbationParams,
        _rng: &mut StdRng,
    ) -> Result<()> {
        let mut rewritten = 0;
        for node in &mut layer.nodes {
            let before = node.raw.clone();
            node.rewrite_text(|text| {
                let dated = Self::rewrite_dates(text, params);
                Self::rewrite_generator(&dated, params).into_owned()
            });
            if node.raw != before {
                rewritten += 1;
            }
        }
        debug!("Rewrote {} header lines in {}", rewritten, layer.path);
        Ok(())
    }
}
