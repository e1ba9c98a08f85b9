//! Error handling for GhostPCB
//!
//! Plumbing code returns `anyhow::Result` and attaches context on the way up.
//! The root causes are [`GhostPcbError`] values, so the engine can still tell
//! a fatal archive problem from a per-member or per-variant failure with
//! `downcast_ref`.

use anyhow::Context;
use std::path::Path;

pub type Result<T> = anyhow::Result<T>;

/// Extension trait for Results to add context with file paths
pub trait ResultExt<T> {
    /// Add context with file path information
    fn with_path_context<P: AsRef<Path>>(self, operation: &str, path: P) -> Result<T>;

    /// Add context naming the archive member being handled
    fn with_member_context(self, member: &str) -> Result<T>;

    /// Add context naming the variant being generated
    fn with_variant_context(self, index: u32) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<anyhow::Error> + Send + Sync + 'static,
{
    fn with_path_context<P: AsRef<Path>>(self, operation: &str, path: P) -> Result<T> {
        self.map_err(|e| e.into())
            .with_context(|| format!("Failed to {} file: {}", operation, path.as_ref().display()))
    }

    fn with_member_context(self, member: &str) -> Result<T> {
        self.map_err(|e| e.into())
            .with_context(|| format!("Error processing member {}", member))
    }

    fn with_variant_context(self, index: u32) -> Result<T> {
        self.map_err(|e| e.into())
            .with_context(|| format!("Error generating variant {}", index))
    }
}

/// Error taxonomy of the obfuscation engine
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GhostPcbError {
    /// Unreadable or invalid input archive. Aborts the whole request.
    #[error("Archive error: {reason}")]
    Archive { reason: String },

    /// One member could not be tokenized. Recovered per member.
    #[error("Parse error in {member}: {reason}")]
    Parse { member: String, reason: String },

    /// A strategy computed a perturbation outside its bound. Fails the variant.
    #[error("Tolerance violation in {strategy}: {value_mm:.4} mm exceeds bound of {bound_mm:.4} mm")]
    ToleranceViolation {
        strategy: &'static str,
        value_mm: f64,
        bound_mm: f64,
    },

    /// Writing one variant failed. Recovered per variant.
    #[error("Write error for {path}: {reason}")]
    Write { path: String, reason: String },

    /// The request itself cannot be served.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl GhostPcbError {
    pub fn archive(reason: impl Into<String>) -> Self {
        Self::Archive {
            reason: reason.into(),
        }
    }

    pub fn parse(member: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            member: member.into(),
            reason: reason.into(),
        }
    }
}

/// Find the taxonomy root of an error chain, if any
pub fn classify(err: &anyhow::Error) -> Option<&GhostPcbError> {
    err.downcast_ref::<GhostPcbError>()
}
