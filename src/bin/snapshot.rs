use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use v8_bridge::snapshot::try_create_snapshot;

/// Build a startup snapshot from an initialization script.
#[derive(Parser, Debug)]
#[command(name = "v8-bridge-snapshot", version)]
struct Args {
    /// Initialization script to run before serializing the heap
    input: PathBuf,

    /// Where to write the blob
    #[arg(short, long, default_value = "snapshot.bin")]
    output: PathBuf,

    /// Script name used in stack traces (defaults to the input file name)
    #[arg(long)]
    name: Option<String>,
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    match run(&args) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Failed to create snapshot: {}", err);
            std::process::ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> v8_bridge::Result<()> {
    let source = std::fs::read_to_string(&args.input)?;
    let name = args.name.clone().unwrap_or_else(|| {
        args.input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "init.js".to_string())
    });

    println!("Creating snapshot from {} (engine {})...", name, v8_bridge::engine_version());

    let blob = try_create_snapshot(&name, &source)?;
    blob.write(&args.output)?;

    println!(
        "Snapshot created: {} ({} bytes)",
        args.output.display(),
        blob.len()
    );

    Ok(())
}
