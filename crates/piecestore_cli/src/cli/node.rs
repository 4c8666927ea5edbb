use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use expanduser::expanduser;
use piecestore_core::{Identity, NodeId};
use piecestore_protocol::chores::{ExpirationCollector, TrashChore};
use piecestore_protocol::{
    server, Endpoint, EndpointConfig, RetainConfig, RetainService, RetainStatus, SessionContext,
    Verifier,
};
use piecestore_storage::{ExpirationDb, LocalStorage};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::get_config_value;

/// Everything needed to run a storage node.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub store_dir: PathBuf,
    pub identity_file: PathBuf,
    pub expiration_db: PathBuf,
    pub external_ip: String,
    pub quic_port: u16,
    pub trusted_satellites: Vec<NodeId>,
    pub max_time_skew: chrono::Duration,
    pub endpoint: EndpointConfig,
    pub retain: RetainConfig,
    pub expiration_interval: Duration,
    pub expiration_batch_size: usize,
    pub trash_interval: Duration,
    pub trash_expiry: chrono::Duration,
}

pub fn cli() -> Command {
    Command::new("node")
        .about("Run a piecestore storage node")
        .args([
            Arg::new("store_dir")
                .long("store-dir")
                .value_name("directory")
                .help("Directory for stored pieces")
                .action(ArgAction::Set),
            Arg::new("identity_file")
                .long("identity-file")
                .value_name("file")
                .help("Node identity key, created if missing")
                .action(ArgAction::Set),
            Arg::new("external_ip")
                .long("external-ip")
                .value_name("ip")
                .help("External IP put in the TLS certificate")
                .action(ArgAction::Set),
            Arg::new("quic_port")
                .long("quic-port")
                .value_name("port")
                .value_parser(value_parser!(u16))
                .help("QUIC port to listen on")
                .action(ArgAction::Set),
            Arg::new("retain_status")
                .long("retain-status")
                .value_name("status")
                .value_parser(value_parser!(RetainStatus))
                .help("Garbage collection mode: enabled, debug or disabled")
                .action(ArgAction::Set),
            Arg::new("trusted_satellite")
                .long("trusted-satellite")
                .value_name("node id")
                .help("Hex node ID of a trusted satellite, may be repeated")
                .action(ArgAction::Append),
        ])
}

pub fn exec(args: &ArgMatches, settings: &Settings) -> Result<()> {
    let config = node_config(args, settings)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(config))
}

/// Merge CLI flags over the settings file.
fn node_config(args: &ArgMatches, settings: &Settings) -> Result<NodeConfig> {
    let store_dir = expanduser(get_config_value!(
        args,
        "store_dir",
        String,
        settings.node.store_dir
    ))?;
    let identity_file = expanduser(get_config_value!(
        args,
        "identity_file",
        String,
        settings.node.identity_file
    ))?;
    let expiration_db = expanduser(&settings.node.expiration_db)?;
    let external_ip = get_config_value!(args, "external_ip", String, settings.external_ip).clone();
    let quic_port = *get_config_value!(args, "quic_port", u16, settings.quic_port);

    let retain_status = match args.try_get_one::<RetainStatus>("retain_status") {
        Ok(Some(status)) => *status,
        _ => settings
            .retain
            .status
            .parse()
            .map_err(|err: String| anyhow::anyhow!(err))?,
    };

    let satellites: Vec<String> = match args.get_many::<String>("trusted_satellite") {
        Some(values) => values.cloned().collect(),
        None => settings.node.trusted_satellites.clone(),
    };
    let trusted_satellites = satellites
        .iter()
        .map(|s| {
            s.parse::<NodeId>()
                .with_context(|| format!("Invalid trusted satellite `{s}`"))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(NodeConfig {
        store_dir,
        identity_file,
        expiration_db,
        external_ip,
        quic_port,
        trusted_satellites,
        max_time_skew: chrono::Duration::seconds(settings.node.max_time_skew as i64),
        endpoint: EndpointConfig {
            stream_timeout: Duration::from_secs(settings.node.stream_timeout),
            max_chunk_size: settings.node.max_chunk_size,
        },
        retain: RetainConfig {
            status: retain_status,
            max_time_skew: chrono::Duration::hours(settings.retain.max_time_skew as i64),
            queue_capacity: settings.retain.queue_capacity,
        },
        expiration_interval: Duration::from_secs(settings.chores.expiration_interval),
        expiration_batch_size: settings.chores.expiration_batch_size,
        trash_interval: Duration::from_secs(settings.chores.trash_interval),
        trash_expiry: chrono::Duration::hours(settings.chores.trash_expiry as i64),
    })
}

/// Load the identity at `path`, generating and saving a new one if the file
/// does not exist.
fn load_or_create_identity(path: &Path) -> Result<Identity> {
    if path.exists() {
        return Identity::load(path)
            .with_context(|| format!("Failed to load identity from {}", path.display()));
    }

    let identity = Identity::generate();
    identity
        .save(path)
        .with_context(|| format!("Failed to save identity to {}", path.display()))?;
    info!("Created new identity at {}", path.display());
    Ok(identity)
}

async fn run(config: NodeConfig) -> Result<()> {
    let identity = Arc::new(load_or_create_identity(&config.identity_file)?);
    info!("Node ID: {}", identity.node_id());

    let storage = Arc::new(LocalStorage::new(&config.store_dir)?);
    info!("Storing pieces in {}", config.store_dir.display());

    if config.trusted_satellites.is_empty() {
        warn!("No trusted satellites configured; every order limit will be refused");
    }
    let verifier = Arc::new(Verifier::new(
        identity.node_id(),
        config.trusted_satellites.iter().copied(),
        config.max_time_skew,
    ));

    let ctx = SessionContext::new(Arc::clone(&storage), Arc::clone(&verifier), identity);

    let expirations = ExpirationDb::open(&config.expiration_db)?;

    let (retain_service, retain_queue) = RetainService::new(
        config.retain.clone(),
        Arc::clone(&storage),
        Arc::clone(&ctx.in_flight),
    );
    let endpoint = Arc::new(
        Endpoint::new(ctx, config.endpoint.clone(), retain_queue)
            .with_expirations(expirations.clone()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.quic_port));
    let quic = server::bind(addr, &config.external_ip)?;

    let server_handle = tokio::spawn(server::serve(quic, endpoint, shutdown_rx.clone()));
    let retain_handle = tokio::spawn(retain_service.run(shutdown_rx.clone()));

    let collector = ExpirationCollector::new(
        Arc::clone(&storage),
        expirations,
        verifier,
        config.expiration_batch_size,
    );
    let collector_handle =
        tokio::spawn(collector.run(config.expiration_interval, shutdown_rx.clone()));

    let trash = TrashChore::new(storage, config.trash_expiry);
    let trash_handle = tokio::spawn(trash.run(config.trash_interval, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    if shutdown_tx.send(true).is_err() {
        warn!("All tasks already stopped");
    }

    for (name, handle) in [
        ("server", server_handle),
        ("retain", retain_handle),
        ("expiration collector", collector_handle),
        ("trash", trash_handle),
    ] {
        if let Err(err) = handle.await {
            error!("The {name} task failed: {err}");
        }
    }

    Ok(())
}
