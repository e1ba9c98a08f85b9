//! GhostPCB - Generate byte-distinct copies of a Gerber package
//!
//! Command line front-end over the request/result contract.

#![allow(non_snake_case)]

use tracing::{error, info};
use GhostPCB::{config::Config, engine::Engine};

fn main() {
    // Parse configuration and initialize logging
    let config = Config::from_args().unwrap_or_else(|e| {
        eprintln!("Configuration error: {:#}", e);
        std::process::exit(1);
    });

    let request = config.to_request().unwrap_or_else(|e| {
        eprintln!("Configuration error: {:#}", e);
        std::process::exit(1);
    });

    let mut engine = Engine::new().with_progress(!config.no_progress && !config.json);
    if let Some(seed) = config.seed {
        engine = engine.with_seed(seed);
    }

    info!("Processing {} ({} variants)", request.input_path, request.count);
    let result = engine.process(&request);

    if config.json {
        match serde_json::to_string_pretty(&result) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!("Cannot encode result: {}", e);
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    } else if result.success {
        println!("{}", result.message);
        for path in &result.output_files {
            println!("  {}", path);
        }
    } else {
        eprintln!("Error: {}", result.message);
    }

    if !result.success {
        std::process::exit(1);
    }
}
