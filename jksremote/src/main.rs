use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

use jksremote_core::config::{AppConfig, default_config_path};
use jksremote_store::jobs::{DiscoveryJob, InventoryJob, JobResult, JobRunner, ManagementJob};

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the job result; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let (config_path, args) = split_config_flag(std::env::args().skip(1).collect())?;
    let cmd = args.first().map(String::as_str).unwrap_or("help");

    let (result, items) = match cmd {
        "discover" | "discovery" => {
            let job: DiscoveryJob = read_job(&args)?;
            let runner = runner(config_path)?;
            let mut items: Vec<Value> = Vec::new();
            let result = runner
                .discovery(&job, |found| {
                    items = found.into_iter().map(Value::String).collect();
                    Ok(())
                })
                .await;
            (result, items)
        }
        "inventory" => {
            let job: InventoryJob = read_job(&args)?;
            let runner = runner(config_path)?;
            let mut items: Vec<Value> = Vec::new();
            let result = runner
                .inventory(&job, |entries| {
                    items = entries
                        .iter()
                        .map(serde_json::to_value)
                        .collect::<Result<_, serde_json::Error>>()?;
                    Ok(())
                })
                .await;
            (result, items)
        }
        "manage" | "management" => {
            let job: ManagementJob = read_job(&args)?;
            let runner = runner(config_path)?;
            (runner.management(&job).await, Vec::new())
        }
        "help" | "--help" | "-h" => {
            print_help();
            return Ok(());
        }
        other => {
            eprintln!("unknown command: {other}");
            print_help();
            std::process::exit(2);
        }
    };

    print_result(&result, items)?;
    if !result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_help() {
    println!(
        "\
jksremote - remote Java keystore discovery, inventory and management

USAGE:
    jksremote [--config <path>] <command> <job.json>

COMMANDS:
    discover <job.json>                 Search a host for keystore files
    inventory <job.json>                List every certificate entry in a keystore
    manage <job.json>                   Add, remove or create (operation field)
    help                                Show this help

OPTIONS:
    --config <path>                     Settings file (default: ~/.config/jksremote/config.toml)

The job result is printed to stdout as JSON; the exit status is non-zero
when the job fails. Set RUST_LOG (e.g. RUST_LOG=debug) for more detail."
    );
}

/// Pull `--config <path>` / `--config=<path>` out of the argument list.
fn split_config_flag(args: Vec<String>) -> Result<(Option<PathBuf>, Vec<String>)> {
    let mut config = None;
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" || arg == "-c" {
            let Some(path) = iter.next() else {
                bail!("--config requires a path");
            };
            config = Some(PathBuf::from(path));
        } else if let Some(path) = arg.strip_prefix("--config=") {
            config = Some(PathBuf::from(path));
        } else {
            rest.push(arg);
        }
    }
    Ok((config, rest))
}

fn runner(config_path: Option<PathBuf>) -> Result<JobRunner> {
    let path = config_path.unwrap_or_else(default_config_path);
    let config = AppConfig::load(&path).with_context(|| format!("loading config from {}", path.display()))?;
    tracing::debug!(path = %path.display(), ?config, "loaded config");
    Ok(JobRunner::new(Arc::new(config)))
}

fn read_job<T: DeserializeOwned>(args: &[String]) -> Result<T> {
    let Some(path) = args.get(1) else {
        bail!("missing job file; see `jksremote help`");
    };
    let path = Path::new(path);
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading job file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing job file {}", path.display()))
}

fn print_result(result: &JobResult, items: Vec<Value>) -> Result<()> {
    let out = json!({ "result": result, "items": items });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
