//! HTLC Coordinator Node
//!
//! Runs the swap coordinator behind an HTTP API. Swaps are gated on 2-of-3
//! chain consensus before a claim is accepted, and fall back to refund once
//! their timelock passes.
//!
//! # Tasks
//!
//! 1. API server (`/swaps`, `/attestations`, `/breaker`, health, metrics)
//! 2. Attestation ingestor draining adapter results into the coordinator
//! 3. Polling dispatcher, one poll per configured chain adapter per swap
//! 4. Breaker monitor for auto-recovery and policy evaluation
//!
//! SIGINT/SIGTERM flips a watch channel that all four observe.

use std::sync::Arc;

use coordinator::config::Config;
use coordinator::http_source::HttpAttestationSource;
use coordinator::ingest::{AttestationIngestor, BreakerMonitor, PollingDispatcher};
use coordinator::metrics::Metrics;
use coordinator::server::{start_server, AppState};
use eyre::WrapErr;
use htlc_core::{
    AttestationSink, AttestationSource, CircuitBreaker, MemorySwapStore, PollSchedule,
    SwapCoordinator, SwapStatus, SwapStore, SystemClock,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Buffered attestation events between adapters and the ingestor
const ATTESTATION_CHANNEL_CAPACITY: usize = 1024;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    info!("Starting HTLC Coordinator");

    let config = Config::load()?;
    info!(
        instance_id = %config.instance_id,
        port = config.api_port,
        consensus_chains = ?config.coordinator.consensus_chains,
        durable = config.database_url.is_some(),
        adapters = config.adapter_urls.len(),
        "Configuration loaded"
    );

    let store = open_store(&config).await?;
    let breaker = Arc::new(CircuitBreaker::new(
        config.breaker.clone(),
        config.council()?,
    ));
    let coordinator = Arc::new(
        SwapCoordinator::new(
            config.coordinator.clone(),
            store,
            breaker,
            Arc::new(SystemClock),
        )
        .wrap_err("Invalid coordinator configuration")?,
    );
    let metrics = Arc::new(Metrics::new());

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (sink, events) = AttestationSink::channel(ATTESTATION_CHANNEL_CAPACITY);
    let mut sources: Vec<Arc<dyn AttestationSource>> = Vec::new();
    for (chain, url) in &config.adapter_urls {
        info!(chain = %chain, url = %url, "Polling adapter configured");
        sources.push(Arc::new(HttpAttestationSource::new(chain.clone(), url)?));
    }
    let dispatcher = if sources.is_empty() {
        warn!("No ADAPTER_URL_<CHAIN> configured; attestations arrive via POST /attestations only");
        None
    } else {
        Some(Arc::new(PollingDispatcher::new(
            sources,
            sink,
            PollSchedule::default(),
            config.attestation_timeout(),
            metrics.clone(),
            shutdown_rx.clone(),
        )))
    };

    let state = AppState::new(
        coordinator.clone(),
        metrics.clone(),
        dispatcher.clone(),
        config.instance_id.clone(),
    );

    let ingestor = AttestationIngestor::new(coordinator.clone(), metrics.clone());
    let monitor = BreakerMonitor::new(coordinator.clone(), metrics.clone(), config.breaker_tick());

    let mut tasks = vec![
        tokio::spawn(ingestor.run(events, shutdown_rx.clone())),
        tokio::spawn(monitor.run(shutdown_rx.clone())),
    ];

    let server_state = state.clone();
    let bind_address = config.bind_address.clone();
    let port = config.api_port;
    let server_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = start_server(&bind_address, port, server_state, server_shutdown).await {
            error!(error = %e, "API server failed");
        }
    }));

    recover_open_swaps(&coordinator, dispatcher.as_deref()).await?;
    state.mark_ready();

    // Handle signals
    wait_for_shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            error!(error = %e, "Task panicked during shutdown");
        }
    }

    info!("HTLC Coordinator stopped");
    Ok(())
}

#[cfg(feature = "postgres")]
async fn open_store(config: &Config) -> eyre::Result<Arc<dyn SwapStore>> {
    match &config.database_url {
        Some(url) => {
            let store =
                htlc_core::store::PgSwapStore::connect(url, config.database_max_connections)
                    .await
                    .wrap_err("Failed to open PostgreSQL swap store")?;
            info!("Using PostgreSQL swap store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; swaps are kept in memory only");
            Ok(Arc::new(MemorySwapStore::new()))
        }
    }
}

#[cfg(not(feature = "postgres"))]
async fn open_store(config: &Config) -> eyre::Result<Arc<dyn SwapStore>> {
    if config.database_url.is_some() {
        return Err(eyre::eyre!(
            "DATABASE_URL is set but this build has no postgres feature"
        ));
    }
    warn!("Swaps are kept in memory only");
    Ok(Arc::new(MemorySwapStore::new()))
}

/// Re-register consensus records and resume polling for swaps still
/// awaiting attestations
async fn recover_open_swaps(
    coordinator: &SwapCoordinator,
    dispatcher: Option<&PollingDispatcher>,
) -> eyre::Result<()> {
    let recovered = coordinator
        .recover()
        .await
        .wrap_err("Failed to recover open swaps")?;

    let Some(dispatcher) = dispatcher else {
        return Ok(());
    };
    let open = coordinator
        .store()
        .non_terminal()
        .await
        .wrap_err("Failed to list open swaps")?;
    let now = coordinator.now();
    let mut resumed = 0;
    for swap in open.iter().filter(|s| {
        matches!(s.status, SwapStatus::Pending | SwapStatus::ConsensusPending)
    }) {
        if dispatcher.dispatch(swap.operation_id, swap.timelock_deadline, now) > 0 {
            resumed += 1;
        }
    }
    info!(recovered, resumed, "Startup recovery complete");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,htlc_coordinator=debug,coordinator=debug,htlc_core=debug")
    });

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(filter)
            .init();
    }
}

async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
