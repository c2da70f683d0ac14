//! Relay client
//!
//! Sends every line typed on stdin to the relay server and prints what the
//! other clients send. Type `quit` to leave.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example client -- --server 127.0.0.1:8888
//! ```

use clap::Parser;
use config::Config;
use std::io::{self, BufReader};
use std::process::ExitCode;
use textrelay::{ClientEvent, CloseReason, RelayClient};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing for the textrelay crate based on verbosity level
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => return, // No tracing, stdout belongs to the conversation
        1 => "info",
        2 => "debug",
        _ => "trace", // 3 or more
    };

    let filter = format!("textrelay={}", level);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(author, version, about = "Text relay client", long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short, long, default_value = "127.0.0.1:8888")]
    server: String,

    /// Increase logging verbosity (-v: info, -vv: debug, -vvv: trace)
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

    let mut client = match RelayClient::connect(&config, &args.server) {
        Ok(client) => client.with_input(BufReader::new(io::stdin())),
        Err(err) => {
            eprintln!("Failed to connect to {}: {err}", args.server);
            return ExitCode::FAILURE;
        }
    };

    // Execute the client event loop
    loop {
        let events = match client.fetch_events() {
            Ok(events) => events,
            Err(err) => {
                eprintln!("Fatal error fetching events: {err}");
                return ExitCode::FAILURE;
            }
        };

        for event in events {
            match event {
                ClientEvent::Connected => println!("Connected to {}", args.server),
                ClientEvent::Message(text) => println!("{text}"),
                ClientEvent::Closed(CloseReason::Quit) => return ExitCode::SUCCESS,
                ClientEvent::Closed(CloseReason::ServerClosed) => {
                    println!("Server closed the connection");
                    return ExitCode::SUCCESS;
                }
                ClientEvent::Closed(reason) => {
                    eprintln!("Connection closed: {reason:?}");
                    return ExitCode::FAILURE;
                }
                ClientEvent::Inactive => return ExitCode::SUCCESS,
            }
        }
    }
}
