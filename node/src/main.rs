// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # PoD Node
//!
//! Entry point for the `pod-node` binary. Parses CLI arguments, merges them
//! over the JSON config, initializes logging, then runs one subcommand:
//!
//! - `init`         - create the data directory, key and config
//! - `seller`       - accept PoD sessions, serve the API and metrics
//! - `buy`          - run or resume one purchase
//! - `publish`      - publish configured bulletins on the escrow contract
//! - `unpublish`    - close a bulletin or withdraw its stake
//! - `bulletin-key` - print a dataset's bulletin and escrow key
//! - `deposit`      - manage the buyer deposit for a seller
//! - `version`      - print build version information

mod api;
mod cli;
mod config;
mod logging;
mod metrics;
mod rpc_ledger;
mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, U256};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::watch;

use pod_contracts::Devnet;
use pod_protocol::buyer::{Buyer, PurchaseOutcome, PurchaseRequest, Settlement};
use pod_protocol::config::PROTOCOL_VERSION;
use pod_protocol::crypto::hash::{parse_u256_dec, parse_u256_hex};
use pod_protocol::crypto::keys::{address_hex, generate_wallet, wallet_to_hex};
use pod_protocol::engine::KeystreamEngine;
use pod_protocol::escrow::Escrow;
use pod_protocol::seller::Seller;
use pod_protocol::transaction::RecordStore;

use cli::{Commands, DepositAction, GlobalArgs, PodNodeCli};
use config::{NodeConfig, CONFIG_FILE};
use logging::{LogFormat, DEFAULT_DIRECTIVE, VERBOSE_DIRECTIVE};
use metrics::NodeMetrics;
use rpc_ledger::RpcLedger;

/// How often the JSON-RPC provider polls for transaction receipts.
const PROVIDER_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = PodNodeCli::parse();

    if let Commands::Version = cli.command {
        print_version();
        return Ok(());
    }

    let (config_path, cfg) = load_config(&cli.global)?;
    let format = LogFormat::from_str_lossy(&cfg.log_format);
    let directive = if cli.global.verbose {
        VERBOSE_DIRECTIVE
    } else {
        DEFAULT_DIRECTIVE
    };
    logging::init_logging(directive, format);

    match cli.command {
        Commands::Init(args) => init_node(cfg, &config_path, args),
        Commands::Seller(args) => run_seller(cfg, args).await,
        Commands::Buy(args) => buy(cfg, args).await,
        Commands::Publish(args) => publish(cfg, args).await,
        Commands::Unpublish(args) => unpublish(cfg, args).await,
        Commands::BulletinKey(args) => bulletin_key(args),
        Commands::Deposit(args) => deposit(cfg, args.action).await,
        Commands::Version => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

/// Read the config file and apply the global flag overrides.
fn load_config(global: &GlobalArgs) -> Result<(PathBuf, NodeConfig)> {
    let data_dir = global
        .data_dir
        .clone()
        .unwrap_or_else(|| NodeConfig::default().data_dir);
    let path = global
        .config
        .clone()
        .unwrap_or_else(|| data_dir.join(CONFIG_FILE));
    let mut cfg = NodeConfig::load_or_default(&path)?;

    if let Some(dir) = &global.data_dir {
        cfg.data_dir = dir.clone();
    }
    if let Some(key) = &global.key {
        cfg.key_hex = Some(key.clone());
    }
    if let Some(url) = &global.rpc_url {
        cfg.chain.rpc_url = Some(url.clone());
    }
    if let Some(contract) = &global.contract {
        cfg.chain.contract_address = Some(contract.clone());
    }
    if let Some(id) = global.chain_id {
        cfg.chain.chain_id = id;
    }
    if let Some(format) = &global.log_format {
        cfg.log_format = format.clone();
    }
    Ok((path, cfg))
}

/// Escrow over the configured chain, or over an in-process devnet when no
/// chain is configured.
fn open_escrow(cfg: &NodeConfig, wallet: &LocalWallet) -> Result<Escrow> {
    match (&cfg.chain.rpc_url, &cfg.chain.contract_address) {
        (Some(url), Some(contract)) => {
            let contract: Address = contract
                .parse()
                .with_context(|| format!("invalid contract address {contract}"))?;
            let ledger = RpcLedger::connect(
                url,
                contract,
                wallet.clone(),
                cfg.chain.chain_id,
                PROVIDER_POLL_INTERVAL,
            )
            .with_context(|| format!("failed to connect to {url}"))?;
            tracing::info!(rpc = %url, contract = ?contract, "escrow ledger connected");
            Ok(Escrow::new(Arc::new(ledger)))
        }
        _ => {
            tracing::warn!("no chain configured, settling on an in-process devnet");
            Ok(Escrow::new(Arc::new(Devnet::new().ledger(wallet.address()))))
        }
    }
}

fn open_store(cfg: &NodeConfig) -> Result<RecordStore> {
    let path = cfg.data_dir.join("records");
    std::fs::create_dir_all(&path)
        .with_context(|| format!("failed to create record directory {}", path.display()))?;
    RecordStore::open(&path)
        .with_context(|| format!("failed to open record store at {}", path.display()))
}

fn parse_address(s: &str) -> Result<Address> {
    s.parse()
        .with_context(|| format!("invalid address {s:?}"))
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

fn init_node(cfg: NodeConfig, config_path: &std::path::Path, args: cli::InitArgs) -> Result<()> {
    let data_dir = &cfg.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let key_path = cfg.key_path();
    if key_path.exists() && !args.force {
        bail!(
            "{} already exists; pass --force to replace it",
            key_path.display()
        );
    }
    let wallet = generate_wallet();
    std::fs::write(&key_path, wallet_to_hex(&wallet))
        .with_context(|| format!("failed to write key to {}", key_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    if !config_path.exists() || args.force {
        // The key lives in its file, not in the config.
        let saved = NodeConfig {
            key_hex: None,
            ..cfg.clone()
        };
        saved.save(config_path)?;
    }

    let address = address_hex(&wallet);
    tracing::info!(%address, key_path = %key_path.display(), "node key generated");

    println!("Node initialized.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Config         : {}", config_path.display());
    println!("  Key file       : {}", key_path.display());
    println!("  Address        : {}", address);
    Ok(())
}

// ---------------------------------------------------------------------------
// seller
// ---------------------------------------------------------------------------

async fn run_seller(mut cfg: NodeConfig, args: cli::SellerArgs) -> Result<()> {
    if let Some(listen) = args.listen {
        cfg.listen_addr = listen.to_string();
    }
    if let Some(port) = args.api_port {
        cfg.api_port = port;
    }
    if let Some(port) = args.metrics_port {
        cfg.metrics_port = port;
    }

    let wallet = cfg.wallet()?;
    let escrow = open_escrow(&cfg, &wallet)?;
    let store = open_store(&cfg)?;
    let catalog = Arc::new(cfg.catalog()?);
    if catalog.is_empty() {
        tracing::warn!("no bulletins configured; every session request will be refused");
    }

    let seller = Arc::new(
        Seller::new(
            escrow.clone(),
            store.clone(),
            Arc::new(KeystreamEngine::new()),
            cfg.data_dir.clone(),
        )?
        .with_catalog(Arc::clone(&catalog)),
    );
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);

    tracing::info!(
        address = %address_hex(&wallet),
        listen = %cfg.listen_addr,
        api_port = cfg.api_port,
        metrics_port = cfg.metrics_port,
        bulletins = catalog.len(),
        data_dir = %cfg.data_dir.display(),
        "starting pod-node seller"
    );

    // --- API server ---
    let app_state = api::AppState {
        version: format!("{} (protocol {})", env!("CARGO_PKG_VERSION"), PROTOCOL_VERSION),
        address: address_hex(&wallet),
        store,
        registry: Arc::clone(seller.registry()),
        catalog,
        escrow,
        metrics: Arc::clone(&node_metrics),
    };
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", cfg.api_port);
    let api_listener = TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", cfg.metrics_port);
    let metrics_listener = TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Session listener ---
    let session_listener = TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("failed to bind session listener on {}", cfg.listen_addr))?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sessions = tokio::spawn(server::serve_sessions(
        Arc::clone(&seller),
        session_listener,
        Arc::clone(&node_metrics),
        shutdown_rx,
    ));

    // --- Reconcile loop ---
    let reconciler = Arc::clone(&seller);
    let every = Duration::from_secs(args.reconcile_interval.max(1));
    let reconcile_loop = tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match reconciler.reconcile_all().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(closed = n, "paid sessions closed"),
                Err(e) => tracing::warn!(error = %e, "reconcile pass failed"),
            }
        }
    });

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, no longer accepting sessions");
        }
    }

    let _ = shutdown_tx.send(true);
    reconcile_loop.abort();
    if let Err(e) = sessions.await {
        tracing::warn!("session listener task failed: {}", e);
    }
    tracing::info!("pod-node stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// buy
// ---------------------------------------------------------------------------

async fn buy(cfg: NodeConfig, args: cli::BuyArgs) -> Result<()> {
    let wallet = cfg.wallet()?;
    let escrow = open_escrow(&cfg, &wallet)?;
    let store = open_store(&cfg)?;
    let buyer = Buyer::new(
        escrow,
        store,
        Arc::new(KeystreamEngine::new()),
        wallet,
        cfg.data_dir.clone(),
    )
    .with_policy(cfg.poll.clone());

    let outcome = match args.resume {
        Some(key) => {
            let (seller, session_id) = key
                .split_once('/')
                .with_context(|| format!("resume key {key:?} is not <seller>/<session-id>"))?;
            buyer.resume(seller, session_id).await?
        }
        None => {
            let path = args.request.context("--request is required")?;
            let bytes = std::fs::read(&path)
                .with_context(|| format!("failed to read request {}", path.display()))?;
            let request: PurchaseRequest = serde_json::from_slice(&bytes)
                .with_context(|| format!("invalid request {}", path.display()))?;
            let endpoint = args
                .connect
                .context("--connect is required for a new purchase")?;
            let stream = TcpStream::connect(&endpoint)
                .await
                .with_context(|| format!("failed to connect to seller at {endpoint}"))?;
            stream.set_nodelay(true)?;
            buyer.purchase(stream, &request).await?
        }
    };
    report(&outcome);
    Ok(())
}

fn report(outcome: &PurchaseOutcome) {
    let record = &outcome.record;
    let key = RecordStore::key_of(record);
    match &outcome.settlement {
        Settlement::Delivered { output, items } => {
            println!("Delivered {} item(s) to {}", items, output.display());
        }
        Settlement::Pending { attempts } => {
            println!("Secret not on chain after {} poll(s).", attempts);
            println!("Resume with: pod-node buy --resume {}", key);
        }
        Settlement::Disputed { index } => {
            println!("Item {} failed verification; complaint filed on chain.", index);
        }
    }
    println!("  Session : {}", key);
    println!("  Status  : {}", record.status);
    if let Some(price) = record.price {
        println!("  Price   : {} wei", price);
    }
}

// ---------------------------------------------------------------------------
// Bulletins
// ---------------------------------------------------------------------------

async fn publish(cfg: NodeConfig, args: cli::PublishArgs) -> Result<()> {
    let vrf_digest = match args.vrf_digest.as_deref() {
        None => U256::zero(),
        Some(s) if s.starts_with("0x") => parse_u256_hex(s)?,
        Some(s) => parse_u256_dec(s)?,
    };
    let catalog = cfg.catalog()?;
    if catalog.is_empty() {
        bail!("no bulletins configured");
    }
    let wallet = cfg.wallet()?;
    let escrow = open_escrow(&cfg, &wallet)?;
    for listing in catalog.list() {
        let key = listing.bulletin.key()?;
        let tx = escrow
            .publish(&listing.bulletin, listing.mode, vrf_digest, U256::from(args.stake))
            .await?;
        println!(
            "published {} key={:#x} tx={:#x}",
            listing.data_path.display(),
            key,
            tx
        );
    }
    Ok(())
}

async fn unpublish(cfg: NodeConfig, args: cli::UnpublishArgs) -> Result<()> {
    let catalog = cfg.catalog()?;
    let listing = catalog
        .get(&args.merkle_root)
        .with_context(|| format!("no configured bulletin with root {}", args.merkle_root))?;
    let key = listing.bulletin.key()?;
    let wallet = cfg.wallet()?;
    let escrow = open_escrow(&cfg, &wallet)?;
    if args.withdraw {
        let tx = escrow.withdraw_publisher_stake(key).await?;
        println!("stake withdrawn key={:#x} tx={:#x}", key, tx);
    } else {
        let (tx, ok) = escrow.close(key).await?;
        let status = escrow.read_status(key).await?;
        println!("unpublish requested key={:#x} tx={:#x} status={:?} ok={}", key, tx, status, ok);
    }
    Ok(())
}

fn bulletin_key(args: cli::BulletinKeyArgs) -> Result<()> {
    let data = std::fs::read(&args.path)
        .with_context(|| format!("failed to read dataset {}", args.path.display()))?;
    let bulletin = KeystreamEngine::bulletin(&data, args.mode, args.chunk_size)?;
    let key = bulletin.key()?;
    let out = serde_json::json!({
        "bulletin": bulletin,
        "mode": args.mode,
        "key": format!("{key:#x}"),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// deposit
// ---------------------------------------------------------------------------

async fn deposit(cfg: NodeConfig, action: DepositAction) -> Result<()> {
    let wallet = cfg.wallet()?;
    let me = wallet.address();
    let escrow = open_escrow(&cfg, &wallet)?;
    match action {
        DepositAction::Add { seller, amount } => {
            let seller = parse_address(&seller)?;
            let tx = escrow.deposit_buyer_stake(U256::from(amount), seller).await?;
            println!("deposited {} wei for {:#x} tx={:#x}", amount, seller, tx);
        }
        DepositAction::Remove { seller } => {
            let seller = parse_address(&seller)?;
            let tx = escrow.undeposit_buyer_stake(seller).await?;
            println!("withdrawal cooldown started for {:#x} tx={:#x}", seller, tx);
        }
        DepositAction::Withdraw { seller } => {
            let seller = parse_address(&seller)?;
            let (tx, emptied) = escrow.withdraw_buyer_stake(seller).await?;
            println!("withdrawn from {:#x} tx={:#x} emptied={}", seller, tx, emptied);
        }
        DepositAction::Show { seller } => {
            let seller = parse_address(&seller)?;
            let info = escrow.deposit_of(me, seller).await?;
            let balance = escrow.balance(me).await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "buyer": format!("{me:#x}"),
                "seller": format!("{seller:#x}"),
                "deposit": info,
                "balance": balance.to_string(),
            }))?);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Misc
// ---------------------------------------------------------------------------

fn print_version() {
    println!("pod-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol {}", PROTOCOL_VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// If a handler cannot be installed, that branch never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
