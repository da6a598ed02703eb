//! The Bastion validator process.
//!
//! Loads the identity keypair and YAML configuration, reopens consensus
//! storage, then wires the transport, router, consensus thread and network
//! bridge together and runs until interrupted.

mod config;

use {
    crate::config::{ValidatorConfig, ValidatorConfigError},
    bastion_consensus_bft::{CommitteeManager, ConsensusError, InMemoryLedger, Mempool},
    bastion_consensus_net::{
        Cache, ConsensusNetError, PeerManager, Router, SyncClient, TransportListener,
    },
    bastion_core::{
        AdapterError, BftAdapter, ConsensusEvent, ConsensusService, NetworkBridge, SledStorage,
        StorageError,
    },
    clap::{crate_version, App, Arg, ArgMatches},
    log::*,
    parking_lot::{Mutex, RwLock},
    solana_signer::Signer,
    std::{
        io,
        path::{Path, PathBuf},
        process::exit,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    },
    thiserror::Error,
    tokio::sync::Mutex as AsyncMutex,
};

#[derive(Error, Debug)]
enum ValidatorError {
    #[error("failed to read identity keypair {path}: {reason}")]
    Identity { path: String, reason: String },

    #[error(transparent)]
    Config(#[from] ValidatorConfigError),

    #[error("consensus: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("network: {0}")]
    Net(#[from] ConsensusNetError),

    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error("adapter: {0}")]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{0} thread panicked")]
    Panicked(&'static str),
}

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("bastion-validator")
        .about("Bastion BFT validator")
        .version(crate_version!())
        .arg(
            Arg::with_name("identity")
                .long("identity")
                .value_name("KEYPAIR")
                .takes_value(true)
                .required(true)
                .help("Validator identity keypair file"),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("FILE")
                .takes_value(true)
                .required(true)
                .help("Validator configuration (YAML)"),
        )
        .arg(
            Arg::with_name("ledger")
                .long("ledger")
                .value_name("DIR")
                .takes_value(true)
                .required(true)
                .help("Directory holding consensus storage"),
        )
        .arg(
            Arg::with_name("log")
                .long("log")
                .value_name("FILTER")
                .takes_value(true)
                .default_value("info")
                .help("Log filter used when RUST_LOG is unset"),
        )
        .arg(
            Arg::with_name("log_file")
                .long("log-file")
                .value_name("FILE")
                .takes_value(true)
                .help("Append logs to this file instead of stderr"),
        )
}

fn main() {
    let matches = app().get_matches();
    if let Err(err) = run(&matches) {
        error!("validator stopped: {err}");
        eprintln!("bastion-validator: {err}");
        exit(1);
    }
}

fn run(matches: &ArgMatches) -> Result<(), ValidatorError> {
    let filter = matches.value_of("log").unwrap_or("info");
    match matches.value_of("log_file") {
        Some(logfile) => bastion_logger::setup_file_with_default(Path::new(logfile), filter)?,
        None => bastion_logger::setup_with_default(filter),
    }

    let identity_path = matches.value_of("identity").unwrap_or_default();
    let keypair = Arc::new(solana_keypair::read_keypair_file(identity_path).map_err(|e| {
        ValidatorError::Identity {
            path: identity_path.to_string(),
            reason: e.to_string(),
        }
    })?);
    let identity = keypair.pubkey();

    let config = ValidatorConfig::load(Path::new(matches.value_of("config").unwrap_or_default()))?;
    config.validate(&identity)?;
    let ledger_path = PathBuf::from(matches.value_of("ledger").unwrap_or_default());
    info!(
        "starting validator {identity} with {} genesis members, ledger at {}",
        config.peers.len(),
        ledger_path.display()
    );

    let committees = Arc::new(RwLock::new(CommitteeManager::new(
        config.genesis()?,
        &config.bft,
    )?));
    let mempool = Arc::new(Mempool::new(config.mempool.clone()));
    let storage = SledStorage::open(&ledger_path)?;
    let adapter = BftAdapter::new(
        config.bft.clone(),
        keypair.clone(),
        committees,
        mempool,
        storage,
        InMemoryLedger::new(),
    )?;
    info!(
        "consensus resumes at round {} (frontier {})",
        adapter.round(),
        adapter.frontier()
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("bstNet")
        .enable_all()
        .build()?;
    let cache = Arc::new(Cache::new());
    let transport = runtime.block_on(
        TransportListener::new(config.net.clone(), cache.clone()).start(),
    )?;
    info!("consensus transport bound to {}", transport.local_addr);

    let peer_manager = Arc::new(Mutex::new(PeerManager::with_peers(
        config.net.clone(),
        &identity,
        config.peer_infos()?,
    )?));
    let sync = Arc::new(AsyncMutex::new(SyncClient::new(
        keypair.clone(),
        peer_manager.clone(),
        cache.clone(),
        config.net.clone(),
    )));

    let (event_sender, event_receiver) = crossbeam_channel::unbounded();
    let (outbound_sender, outbound_receiver) = crossbeam_channel::unbounded();
    let router = Router::<ConsensusEvent>::new(
        config.net.clone(),
        peer_manager.clone(),
        cache.clone(),
        event_sender,
    )
    .with_sync_client(sync.clone());
    runtime.spawn(router.run(transport.inbound_rx));

    let exit = Arc::new(AtomicBool::new(false));
    let service = ConsensusService::new(
        adapter,
        config.net.sync_batch_limit as usize,
        event_receiver,
        outbound_sender,
        exit.clone(),
    )?;
    let bridge = NetworkBridge::new(
        keypair,
        peer_manager,
        sync,
        cache,
        config.net.clone(),
        runtime.handle().clone(),
        outbound_receiver,
        exit.clone(),
    )?;

    if let Err(e) = runtime.block_on(tokio::signal::ctrl_c()) {
        warn!("failed to wait for ctrl-c: {e}");
    }
    info!("shutting down");
    exit.store(true, Ordering::Relaxed);

    let adapter = service
        .join()
        .map_err(|_| ValidatorError::Panicked("consensus"))?;
    bridge
        .join()
        .map_err(|_| ValidatorError::Panicked("network bridge"))?;
    adapter.storage().flush()?;
    info!(
        "stopped at round {} with frontier {} ({} transactions applied)",
        adapter.round(),
        adapter.frontier(),
        adapter.ledger().total_transactions()
    );
    runtime.shutdown_background();
    Ok(())
}
