//! # BoardSync CLI
//!
//! Command-line utilities for replaying, inspecting and validating
//! operation streams.

use anyhow::{Context, Result};
use boardsync_core::{detect_conflicts, OpKind, Payload, Replica};
use boardsync_proto::{decode_batch, decode_operation, encode_operation};
use std::env;
use std::path::Path;
use tracing_subscriber::EnvFilter;

mod config;
mod script;

use config::SyncConfig;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    let config = SyncConfig::from_env()?;

    match args[1].as_str() {
        "replay" => {
            if args.len() < 3 {
                eprintln!("Usage: boardsync replay <script.json>");
                std::process::exit(1);
            }
            let script = script::load(Path::new(&args[2]))?;
            let report = script::replay(&script, &config)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        "conflicts" => {
            if args.len() < 3 {
                eprintln!("Usage: boardsync conflicts <ops.json>");
                std::process::exit(1);
            }
            let raw = read(&args[2])?;
            let ops = decode_batch(&raw).context("Failed to decode operations")?;
            let found = detect_conflicts(&ops);
            println!("{}", serde_json::to_string_pretty(&found)?);
        }
        "validate" => {
            if args.len() < 3 {
                eprintln!("Usage: boardsync validate <op.json>");
                std::process::exit(1);
            }
            let raw = read(&args[2])?;
            let op = decode_operation(&raw).context("Operation rejected")?;
            println!("valid: {} ({} {})", op.id, op.kind, op.entity_id());
        }
        "new" => {
            if args.len() < 4 {
                eprintln!("Usage: boardsync new <kind> <payload-json>");
                std::process::exit(1);
            }
            let kind: OpKind = args[2].parse()?;
            let payload: Payload =
                serde_json::from_str(&args[3]).context("Invalid payload")?;
            let mut replica = Replica::new(config.site_id);
            let op = replica.create_operation(kind, payload);
            println!("{}", encode_operation(&op)?);
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn read(path: &str) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))
}

fn print_help() {
    println!(
        r#"BoardSync CLI

USAGE:
    boardsync <COMMAND> [OPTIONS]

COMMANDS:
    replay <script.json>        Replay a multi-site script and print converged state
    conflicts <ops.json>        Detect conflicts in a JSON array of operations
    validate <op.json>          Check an operation against the wire format
    new <kind> <payload-json>   Create an operation as BOARDSYNC_SITE_ID
    help                        Show this help message

ENVIRONMENT:
    BOARDSYNC_SITE_ID           Site id for created operations (default: random)
    BOARDSYNC_HISTORY_CAPACITY  Transformer history capacity (default: 100)
    BOARDSYNC_GC_MIN_AGE_MS     Delete-history retention (default: 3600000)
    BOARDSYNC_RESYNC_ON_DROP    Resync on causal gaps during replay (default: true)
    RUST_LOG                    Log filter (default: info)

EXAMPLES:
    boardsync new add '{{"id":"obj1","x":100,"y":100}}'
    boardsync replay demos/concurrent-create.json
"#
    );
}
