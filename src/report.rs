//! Report builder
//!
//! Folds per-variant outcomes into the [`ProcessResult`] handed back to the
//! caller.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Result of one obfuscation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResult {
    /// True when at least one variant was written
    pub success: bool,
    /// Absolute paths of the written variants, in index order
    pub output_files: Vec<String>,
    pub message: String,
}

impl ProcessResult {
    /// A request that produced nothing
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output_files: Vec::new(),
            message: message.into(),
        }
    }
}

/// What happened to one variant
#[derive(Debug, Clone, PartialEq)]
pub enum VariantOutcome {
    Generated { index: u32, path: PathBuf },
    Failed { index: u32, reason: String },
    Cancelled { index: u32 },
}

impl VariantOutcome {
    pub fn index(&self) -> u32 {
        match self {
            Self::Generated { index, .. } | Self::Failed { index, .. } | Self::Cancelled { index } => {
                *index
            }
        }
    }
}

pub struct ReportBuilder {
    requested: u32,
    outcomes: Vec<VariantOutcome>,
    unparsed_members: Vec<String>,
}

impl ReportBuilder {
    pub fn new(requested: u32) -> Self {
        Self {
            requested,
            outcomes: Vec::with_capacity(requested as usize),
            unparsed_members: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: VariantOutcome) {
        self.outcomes.push(outcome);
    }

    /// Note a member that was copied unmodified because it failed to parse
    pub fn unparsed_member(&mut self, member: impl Into<String>, reason: impl Into<String>) {
        self.unparsed_members
            .push(format!("{} ({})", member.into(), reason.into()));
    }

    pub fn generated(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, VariantOutcome::Generated { .. }))
            .count()
    }

    pub fn build(mut self) -> ProcessResult {
        self.outcomes.sort_by_key(VariantOutcome::index);

        let mut output_files = Vec::new();
        let mut failures = Vec::new();
        let mut cancelled = 0usize;
        for outcome in &self.outcomes {
            match outcome {
                VariantOutcome::Generated { path, .. } => {
                    output_files.push(path.display().to_string())
                }
                VariantOutcome::Failed { reason, .. } => failures.push(reason),
                VariantOutcome::Cancelled { .. } => cancelled += 1,
            }
        }

        let mut message = format!(
            "Generated {} of {} variants",
            output_files.len(),
            self.requested
        );
        if let Some(reason) = failures.first() {
            message.push_str(&format!("; {} failed (first: {})", failures.len(), reason));
        }
        if cancelled > 0 {
            message.push_str(&format!("; {} cancelled", cancelled));
        }
        if !self.unparsed_members.is_empty() {
            message.push_str(&format!(
                "; copied unmodified after parse errors: {}",
                self.unparsed_members.join(", ")
            ));
        }

        ProcessResult {
            success: !output_files.is_empty(),
            output_files,
            message,
        }
    }
}
