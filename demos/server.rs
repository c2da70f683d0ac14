//! Relay server
//!
//! Forwards every client's text to all other clients. Connect with the
//! `client` example, or with any raw TCP tool such as `nc`.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example server -- --bind 127.0.0.1:8888 -v
//! ```

use clap::Parser;
use config::Config;
use std::process::ExitCode;
use textrelay::RelayServer;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing for the textrelay crate based on verbosity level
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "info", // Lifecycle lines only
        1 => "debug",
        _ => "trace", // 2 or more
    };

    let filter = format!("textrelay={}", level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Parser)]
#[command(author, version, about = "Text relay server", long_about = None)]
struct Args {
    /// Address to bind server to
    #[arg(short, long, default_value = "127.0.0.1:8888")]
    bind: String,

    /// Increase logging verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path (TOML format)
    #[arg(long)]
    config: Option<String>,
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> ExitCode {
    let args = Args::parse();

    init_tracing(args.verbose);

    // Create config - load from file if specified, otherwise use defaults
    let config = if let Some(config_path) = &args.config {
        match Config::builder()
            .add_source(config::File::with_name(config_path))
            .build()
        {
            Ok(c) => c,
            Err(err) => {
                eprintln!("Failed to load config file '{}': {}", config_path, err);
                return ExitCode::FAILURE;
            }
        }
    } else {
        Config::default()
    };

    let mut server = match RelayServer::bind(&config, &args.bind) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("Failed to listen on {}: {err}", args.bind);
            return ExitCode::FAILURE;
        }
    };
    println!("Relay listening on {}", server.local_addr());

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Fatal relay error: {err}");
            ExitCode::FAILURE
        }
    }
}
