//! CLI front door wiring spec.md §6's external interfaces together: a
//! `send` side that packages built configurations into a shipfile, and a
//! `receive` side that applies one to the local store and activates it.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::Command as Subprocess;

use clap::{Args, Parser, Subcommand};
use nixrs::path_info::NarInfo;
use nixrs::store_path::StorePath;
use thiserror::Error;
use tracing::{info, warn, Level};

use nixos_ship::collaborators::{
    ActivationCollaborator, CollaboratorError, ProfileCollaborator, SwitchToConfigurationCollaborator,
    SystemProfileCollaborator,
};
use nixos_ship::planner::{self, PlannerError};
use nixos_ship::shipfile::format::Compression;
use nixos_ship::shipfile::version_info::VersionInfo;
use nixos_ship::shipfile::{ConfigInfo, ReaderError, ShipfileWriter, WriterError};
use nixos_ship::store_client::{self, StoreClient};
use nixos_ship::workdir::Workdir;

#[derive(Debug, Error)]
enum ShipError {
    #[error(transparent)]
    StoreClient(#[from] store_client::Error),
    #[error(transparent)]
    Writer(#[from] WriterError),
    #[error(transparent)]
    Reader(#[from] ReaderError),
    #[error(transparent)]
    Planner(#[from] PlannerError),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("--config must be NAME=STOREPATH, got {0:?}")]
    MalformedConfig(String),
    #[error("could not determine the local hostname; pass --config explicitly")]
    NoHostname,
}

#[derive(Parser)]
#[command(name = "nixos-ship", version, about = "Package and ship NixOS configuration closures")]
struct App {
    /// Increase log verbosity; repeat for more (-v, -vv, -vvv).
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a shipfile out of one or more already-built configurations.
    Send(SendArgs),
    /// Apply a shipfile to the local store and activate a configuration from it.
    Receive(ReceiveArgs),
}

#[derive(Args)]
struct SendArgs {
    /// Path to the `<store-tool> --serve` binary (e.g. `nix-store`).
    #[arg(long, default_value = "nix-store")]
    store_tool: String,
    /// Where to write the shipfile.
    #[arg(long)]
    dest: PathBuf,
    #[arg(long, default_value = "normal")]
    compression: Compression,
    /// Split the output every N bytes, producing `dest`, `dest.1`, `dest.2`, ...
    #[arg(long)]
    split_size: Option<u64>,
    /// `NAME=STOREPATH`, repeatable. The top-level of each configuration to ship.
    #[arg(long = "config", required = true)]
    configs: Vec<String>,
    /// `NAME=STOREPATH`, repeatable. Delta baseline for the matching `--config` name.
    #[arg(long = "baseline")]
    baselines: Vec<String>,
}

#[derive(Args)]
struct ReceiveArgs {
    #[arg(long, default_value = "nix-store")]
    store_tool: String,
    /// Path to the shipfile (or its first part, if split).
    shipfile: PathBuf,
    /// Configuration name to install; defaults to the local hostname.
    #[arg(long)]
    config: Option<String>,
    /// Alternate root to install into, instead of `/`.
    #[arg(long)]
    root: Option<PathBuf>,
}

fn main() {
    let app = App::parse();
    init_logger(app.verbose);

    let result = match app.command {
        Command::Send(args) => run_send(args),
        Command::Receive(args) => run_receive(args),
    };

    if let Err(err) = result {
        eprintln!("nixos-ship: error: {err}");
        std::process::exit(1);
    }
}

fn init_logger(verbosity: u8) {
    let default_level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn parse_kv(pairs: &[String]) -> Result<BTreeMap<String, StorePath>, ShipError> {
    pairs
        .iter()
        .map(|pair| {
            let (name, path) = pair
                .split_once('=')
                .ok_or_else(|| ShipError::MalformedConfig(pair.clone()))?;
            let path: StorePath = path
                .parse()
                .map_err(|_| ShipError::MalformedConfig(pair.clone()))?;
            Ok((name.to_owned(), path))
        })
        .collect()
}

fn run_send(args: SendArgs) -> Result<(), ShipError> {
    let configs = parse_kv(&args.configs)?;
    let baselines = parse_kv(&args.baselines)?;

    let mut client = StoreClient::connect(&args.store_tool, false)?;
    let plan = planner::plan_send(&mut client, &configs, &baselines)?;
    info!(
        configs = configs.len(),
        narinfos = plan.narinfos.len(),
        shipped = plan.shipped_paths().len(),
        "planned shipment"
    );

    let mut writer = ShipfileWriter::create(&args.dest, args.compression, args.split_size)?;
    writer.write_version_info(VersionInfo::new())?;
    writer.write_config_info(&configs)?;
    writer.write_cache_info()?;

    for narinfo in &plan.narinfos {
        writer.write_narinfo(narinfo)?;
        if narinfo.in_file {
            let hash = narinfo.path_info.nar_hash.encode_base32();
            let body = client.dump_store_path_reader(&narinfo.path_info.path, narinfo.path_info.nar_size)?;
            writer.write_nar(&hash, narinfo.path_info.nar_size, body)?;
        }
    }
    writer.close()?;
    info!(dest = %args.dest.display(), "shipfile written");
    Ok(())
}

fn run_receive(args: ReceiveArgs) -> Result<(), ShipError> {
    let config_name = match args.config {
        Some(name) => name,
        None => hostname()?,
    };
    let install_bootloader = std::env::var("NIXOS_INSTALL_BOOTLOADER").as_deref() == Ok("1");

    let _workdir = Workdir::new()?;

    let mut reader = nixos_ship::shipfile::reader::open(&args.shipfile)?;
    let warnings = reader.read_version_info()?;
    for warning in warnings {
        warn!(feature = %warning, "shipfile requests an unrecognized optional feature");
    }
    let config_info: ConfigInfo = reader.read_config_info()?;
    let narinfos: Vec<NarInfo> = reader.read_store_metadata()?;

    let mut client = StoreClient::connect(&args.store_tool, true)?;
    let needed = planner::compute_needed(&mut client, &config_info, &narinfos, &config_name)?;
    let needed_set = needed.iter().cloned().collect();
    info!(needed = needed.len(), config = %config_name, "computed minimal import");

    planner::import(&mut client, &mut reader, &narinfos, &needed_set)?;
    reader.close()?;

    let target = config_info
        .get(&config_name)
        .expect("compute_needed already validated config_name is present");

    SystemProfileCollaborator.set_profile(args.root.as_deref(), target)?;
    SwitchToConfigurationCollaborator.activate(target, args.root.as_deref(), install_bootloader)?;
    info!(config = %config_name, target = %target, "activated");
    Ok(())
}

/// A pure query of the host environment, per spec.md §9's "Global hostname
/// default" design note — kept out of the core entirely.
fn hostname() -> Result<String, ShipError> {
    let output = Subprocess::new("hostname").output().map_err(|_| ShipError::NoHostname)?;
    if !output.status.success() {
        return Err(ShipError::NoHostname);
    }
    String::from_utf8(output.stdout)
        .map(|s| s.trim().to_owned())
        .map_err(|_| ShipError::NoHostname)
}
