//! Agentless configuration runner.
//!
//! Loads an inventory and a deploy file, then converges every selected host
//! to the declared operations over ssh (or the local shell with `--local`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::warn;

use converge::core::facts::{FactKey, FactKind};
use converge::core::inventory::Host;
use converge::core::registry::Registry;
use converge::core::types::{OutputStream, RunReport, Status};
use converge::events::{self, RunEvent};
use converge::exit_codes;
use converge::io::config::{EngineConfig, load_config, write_config};
use converge::io::connector::Connector;
use converge::io::deploy::load_deploy;
use converge::io::inventory::load_inventory;
use converge::io::local::LocalConnector;
use converge::io::report::write_report;
use converge::io::ssh::SshConnector;
use converge::logging;
use converge::pipeline::Pipeline;

#[derive(Parser)]
#[command(
    name = "converge",
    version,
    about = "Converge a fleet of hosts to declared state"
)]
struct Cli {
    /// Inventory file describing hosts and groups.
    #[arg(long, global = true, default_value = "inventory.toml")]
    inventory: PathBuf,

    /// Engine configuration file; defaults apply when it is missing.
    #[arg(long, global = true, default_value = "converge.toml")]
    config: PathBuf,

    /// Restrict targets to these hosts or groups (repeatable).
    #[arg(long, global = true)]
    limit: Vec<String>,

    /// Run every command on this machine instead of over ssh.
    #[arg(long, global = true)]
    local: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply the operations of a deploy file.
    Run {
        deploy: PathBuf,
        /// Write the full run report as JSON.
        #[arg(long)]
        report: Option<PathBuf>,
        /// Print command output lines as they arrive.
        #[arg(short, long)]
        verbose: bool,
    },
    /// Gather one fact on every target and print it as JSON.
    Facts { kind: String, args: Vec<String> },
    /// Print the resolved target hosts as JSON.
    Inventory,
    /// Write a config file with every default spelled out.
    Init {
        /// Replace an existing config file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    logging::init();
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            ref deploy,
            ref report,
            verbose,
        } => {
            let config = load_config(&cli.config)?;
            let hosts = targets(&cli)?;
            cmd_run(&cli, config, hosts, deploy, report.as_deref(), verbose).await
        }
        Command::Facts { ref kind, ref args } => {
            let config = load_config(&cli.config)?;
            let hosts = targets(&cli)?;
            cmd_facts(&cli, config, hosts, kind, args).await
        }
        Command::Inventory => {
            let hosts = targets(&cli)?;
            println!("{}", serde_json::to_string_pretty(&hosts)?);
            Ok(exit_codes::OK)
        }
        Command::Init { force } => cmd_init(&cli.config, force),
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists; pass --force to overwrite", path.display());
    }
    write_config(path, &EngineConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

/// Resolve target hosts; `--local` without an inventory file targets `localhost`.
fn targets(cli: &Cli) -> Result<Vec<Host>> {
    if cli.local && !cli.inventory.exists() {
        return Ok(vec![Host::named("localhost")]);
    }
    let inventory = load_inventory(&cli.inventory)?;
    let hosts = inventory
        .select(&cli.limit)
        .map_err(anyhow::Error::msg)
        .context("apply --limit")?;
    if hosts.is_empty() {
        bail!("no target hosts selected");
    }
    Ok(hosts)
}

fn connector(cli: &Cli, config: &EngineConfig) -> Arc<dyn Connector> {
    if cli.local {
        Arc::new(LocalConnector)
    } else {
        Arc::new(SshConnector::new(config.ssh.clone(), config.connect_timeout()))
    }
}

async fn cmd_run(
    cli: &Cli,
    config: EngineConfig,
    hosts: Vec<Host>,
    deploy_path: &Path,
    report_path: Option<&Path>,
    verbose: bool,
) -> Result<i32> {
    let deploy = load_deploy(deploy_path)?;
    let (tx, rx) = events::channel();
    let printer = tokio::spawn(print_events(rx, verbose));

    let connector = connector(cli, &config);
    let pipeline = Pipeline::new(
        config,
        Arc::new(Registry::builtin()),
        connector,
        hosts,
        Some(tx),
    );
    let report = pipeline.run(&deploy.operations).await;
    drop(pipeline);
    let dropped = printer.await.context("event printer")?;

    print_summary(&report);
    if dropped > 0 {
        eprintln!("{dropped} progress events were not displayed; see the summary above");
    }
    if let Some(path) = report_path {
        write_report(path, &report)?;
    }
    Ok(report.exit_code)
}

async fn cmd_facts(
    cli: &Cli,
    config: EngineConfig,
    hosts: Vec<Host>,
    kind: &str,
    args: &[String],
) -> Result<i32> {
    let kind: FactKind = kind.parse().map_err(anyhow::Error::msg)?;
    let key = FactKey::with_args(kind, args.to_vec());
    let connector = connector(cli, &config);
    let pipeline = Pipeline::new(config, Arc::new(Registry::builtin()), connector, hosts, None);

    let mut out = serde_json::Map::new();
    let mut failures = 0;
    for (host, result) in pipeline.gather(&key).await {
        let entry = match result {
            Ok(value) => json!({ "value": *value }),
            Err(err) => {
                failures += 1;
                json!({ "error": err.report() })
            }
        };
        out.insert(host, entry);
    }
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(if failures == 0 {
        exit_codes::OK
    } else {
        exit_codes::INVALID
    })
}

/// Print events until the run finishes; returns how many were dropped.
async fn print_events(mut rx: broadcast::Receiver<RunEvent>, verbose: bool) -> u64 {
    let mut dropped = 0;
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "event printer fell behind; events dropped");
                dropped += missed;
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            RunEvent::OperationStarted { index, name, hosts } => {
                println!("==> [{index}] {name} ({hosts} hosts)");
            }
            RunEvent::HostFinished { host, status, .. } => {
                println!("    {host}: {}", status.label());
            }
            RunEvent::Output {
                host, stream, line, ..
            } if verbose => {
                let tag = match stream {
                    OutputStream::Stdout => "out",
                    OutputStream::Stderr => "err",
                };
                println!("    {host} {tag}| {line}");
            }
            RunEvent::Aborted {
                index,
                ratio,
                threshold,
            } => {
                println!("!! aborted after [{index}]: failure ratio {ratio:.2} > {threshold:.2}");
            }
            RunEvent::RunFinished { .. } => break,
            _ => {}
        }
    }
    dropped
}

fn print_summary(report: &RunReport) {
    let count = |status: Status| report.results.iter().filter(|r| r.status == status).count();
    println!(
        "changed={} no-change={} success={} failed={} timeout={} unreachable={} skipped={}",
        count(Status::Changed),
        count(Status::NoChange),
        count(Status::Success),
        count(Status::Failed),
        count(Status::Timeout),
        count(Status::Unreachable),
        count(Status::Skipped),
    );
    for result in report.results.iter().filter(|r| r.status.is_failure()) {
        if let Some(error) = &result.error {
            eprintln!("{} [{}] {}: {}", result.host, result.op_index, result.op_name, error.message);
        }
    }
}
