// SPDX-FileCopyrightText: 2025 GhostPCB contributors
// SPDX-License-Identifier: Apache-2.0

//! GhostPCB - byte-distinct, manufacturing-equivalent Gerber packages
//!
//! [`process`] takes one fabrication ZIP and writes `count` variants of it
//! next to the input (or into `output_dir`). Each variant parses to the same
//! board within fixed tolerances but differs from the source and from its
//! siblings at the byte level.

#![allow(non_snake_case)]

pub mod archive;
pub mod cam;
pub mod config;
pub mod engine;
pub mod error;
pub mod parser;
pub mod patterns;
pub mod progress;
pub mod report;
pub mod serializer;
pub mod strategies;

pub use config::{ObfuscateOptions, ProcessRequest};
pub use engine::Engine;
pub use error::GhostPcbError;
pub use report::ProcessResult;

/// Run one request with a clock-derived seed and no progress display
pub fn process(request: &ProcessRequest) -> ProcessResult {
    Engine::new().process(request)
}
