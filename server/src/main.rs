//! Task scheduler server
//!
//! The central service of the task execution system: accepts task requests,
//! matches them to polling bots, tracks execution, recovers from dead bots
//! and maintains the leased machine population. This entry point wires the
//! components together, starts the background maintenance loops and runs
//! the REST API until a shutdown signal arrives.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod api;
mod cache;
mod clock;
mod config;
mod dispatch;
mod lease;
mod lifecycle;
mod notify;
mod output;
mod provider;
mod store;
mod submission;

#[cfg(test)]
mod tests;

use cache::NegativeCache;
use config::ConfigManager;
use dispatch::DispatchEngine;
use lease::LeaseManager;
use lifecycle::LifecycleManager;
use notify::LogNotifier;
use provider::HttpMachineProvider;
use store::ServerStore;
use submission::SubmissionService;

/// Command-line arguments for the scheduler server
#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(about = "Central scheduler for the task execution service", long_about = None)]
struct CliArgs {
    /// Path to the server configuration file (server.toml)
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Override the listen address from config file
    #[arg(long = "listen-address", value_name = "ADDRESS")]
    listen_address: Option<String>,

    /// Override the API key from config file
    #[arg(long = "api-key", value_name = "KEY")]
    api_key: Option<String>,

    /// Override the data directory from config file
    #[arg(long = "data-dir", value_name = "DIR")]
    data_dir: Option<String>,
}

/// The main application structure for the scheduler server.
pub struct Server {
    config_manager: Arc<Mutex<ConfigManager>>,
    listen_address: SocketAddr,
    store: Option<Arc<Mutex<ServerStore>>>,
    /// Named handles of the background loops, joined at shutdown.
    background_tasks: Vec<(&'static str, JoinHandle<()>)>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl Server {
    pub fn new(config_path: PathBuf) -> Result<Self> {
        let config_manager = ConfigManager::new(&config_path)?;
        let listen_address: SocketAddr =
            config_manager.server_config.listen_address.parse().map_err(|e| {
                anyhow::anyhow!(
                    "Invalid listen address '{}': {}",
                    config_manager.server_config.listen_address,
                    e
                )
            })?;

        Ok(Self {
            config_manager: Arc::new(Mutex::new(config_manager)),
            listen_address,
            store: None,
            background_tasks: Vec::new(),
            shutdown_tx: None,
        })
    }

    /// Starts the scheduler and runs until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting task scheduler server");

        let scheduler_config = {
            let manager = self.config_manager.lock().await;
            Arc::new(manager.server_config.clone())
        };
        info!(
            listen_address = %self.listen_address,
            data_dir = %scheduler_config.data_dir,
            bot_ping_tolerance_secs = scheduler_config.bot_ping_tolerance_secs,
            "Scheduler configuration loaded"
        );

        info!("Initializing database");
        let mut store = ServerStore::new(&scheduler_config.data_dir)
            .context("Failed to create store manager")?;
        store.initialize().context("Failed to initialize database")?;
        let store = Arc::new(Mutex::new(store));
        self.store = Some(Arc::clone(&store));

        let clock = clock::system_clock();
        let cache = Arc::new(NegativeCache::new(
            scheduler_config.negative_cache_ttl_secs,
            scheduler_config.negative_cache_capacity,
            Arc::clone(&clock),
        ));
        let notifier: Arc<dyn notify::Notifier> = Arc::new(LogNotifier);

        let submission = Arc::new(SubmissionService::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&scheduler_config),
            Arc::clone(&notifier),
        ));
        let dispatch = Arc::new(DispatchEngine::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&clock),
            Arc::clone(&scheduler_config),
            Arc::clone(&notifier),
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&clock),
            Arc::clone(&scheduler_config),
            Arc::clone(&notifier),
        ));

        // Lease management only runs with a provider and machine types.
        let lease = match (
            &scheduler_config.machine_provider_url,
            &scheduler_config.machine_types_file,
        ) {
            (Some(provider_url), Some(_)) => {
                let provider: Arc<dyn provider::MachineProvider> =
                    Arc::new(HttpMachineProvider::new(provider_url.clone())?);
                let server_url = scheduler_config
                    .server_url
                    .clone()
                    .unwrap_or_else(|| format!("http://{}", self.listen_address));
                info!(provider_url = %provider_url, "Lease management enabled");
                Some(Arc::new(LeaseManager::new(
                    Arc::clone(&store),
                    Arc::clone(&clock),
                    Arc::clone(&scheduler_config),
                    Arc::clone(&self.config_manager),
                    provider,
                    Arc::clone(&submission),
                    server_url,
                )))
            }
            _ => {
                info!("Lease management disabled");
                None
            }
        };

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        self.spawn_background_loops(
            &scheduler_config,
            &store,
            &cache,
            &notifier,
            &lifecycle,
            &lease,
            &shutdown_tx,
        );

        let app_state = api::AppState::new(
            Arc::clone(&scheduler_config),
            clock,
            submission,
            dispatch,
            lifecycle,
            lease,
        );
        let app = api::create_router(app_state.clone());

        // Periodic cleanup of the poll rate limiter.
        let rate_limiter = app_state.rate_limiter.clone();
        let window_secs = scheduler_config.rate_limit_window_secs as u64;
        let mut rate_shutdown_rx = shutdown_tx.subscribe();
        let rate_task = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(window_secs.max(1) * 2));
            loop {
                tokio::select! {
                    _ = interval.tick() => rate_limiter.cleanup_stale_entries().await,
                    _ = rate_shutdown_rx.recv() => break,
                }
            }
        });
        self.background_tasks.push(("rate-limiter-cleanup", rate_task));

        info!("Starting HTTP server on {}", self.listen_address);
        let listener = tokio::net::TcpListener::bind(self.listen_address)
            .await
            .with_context(|| {
                format!(
                    "Failed to bind TCP listener to {}. \
                     Check if the port is already in use (EADDRINUSE) or requires elevated permissions (EACCES).",
                    self.listen_address
                )
            })?;

        let shutdown_signal = {
            let mut rx = shutdown_tx.subscribe();
            async move {
                let _ = rx.recv().await;
                info!("HTTP server received shutdown signal");
            }
        };

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_background_loops(
        &mut self,
        config: &Arc<shared::config::SchedulerConfig>,
        store: &Arc<Mutex<ServerStore>>,
        cache: &Arc<NegativeCache>,
        notifier: &Arc<dyn notify::Notifier>,
        lifecycle: &Arc<LifecycleManager>,
        lease: &Option<Arc<LeaseManager>>,
        shutdown_tx: &broadcast::Sender<()>,
    ) {
        // Sweep 1: expire queued entries past their slice deadline.
        {
            let lifecycle = Arc::clone(lifecycle);
            self.background_tasks.push((
                "expire-sweep",
                spawn_loop(
                    "expire-sweep",
                    config.expire_sweep_interval_secs,
                    shutdown_tx,
                    move || {
                        let lifecycle = Arc::clone(&lifecycle);
                        async move { lifecycle.sweep_expired_queue().await }
                    },
                ),
            ));
        }
        // Sweep 2: detect dead bots.
        {
            let lifecycle = Arc::clone(lifecycle);
            self.background_tasks.push((
                "dead-bot-sweep",
                spawn_loop(
                    "dead-bot-sweep",
                    config.dead_bot_sweep_interval_secs,
                    shutdown_tx,
                    move || {
                        let lifecycle = Arc::clone(&lifecycle);
                        async move { lifecycle.sweep_dead_bots().await }
                    },
                ),
            ));
        }
        // Sweep 3: refresh the dedup index.
        {
            let lifecycle = Arc::clone(lifecycle);
            self.background_tasks.push((
                "dedup-index-sweep",
                spawn_loop(
                    "dedup-index-sweep",
                    config.dedup_sweep_interval_secs,
                    shutdown_tx,
                    move || {
                        let lifecycle = Arc::clone(&lifecycle);
                        async move { lifecycle.sweep_dedup_index().await }
                    },
                ),
            ));
        }
        // Outbox drain: re-deliver notifications the replay missed.
        {
            let store = Arc::clone(store);
            let notifier = Arc::clone(notifier);
            self.background_tasks.push((
                "outbox-drain",
                spawn_loop(
                    "outbox-drain",
                    config.outbox_drain_interval_secs,
                    shutdown_tx,
                    move || {
                        let store = Arc::clone(&store);
                        let notifier = Arc::clone(&notifier);
                        async move { notify::drain_outbox(&store, &notifier, 100).await }
                    },
                ),
            ));
        }
        // Negative cache cleanup.
        {
            let cache = Arc::clone(cache);
            self.background_tasks.push((
                "cache-cleanup",
                spawn_loop(
                    "cache-cleanup",
                    (config.negative_cache_ttl_secs as u64).max(5) * 4,
                    shutdown_tx,
                    move || {
                        let cache = Arc::clone(&cache);
                        async move {
                            cache.cleanup();
                            Ok(0)
                        }
                    },
                ),
            ));
        }
        // WAL checkpoint.
        {
            let store = Arc::clone(store);
            self.background_tasks.push((
                "wal-checkpoint",
                spawn_loop(
                    "wal-checkpoint",
                    config.wal_checkpoint_interval_secs,
                    shutdown_tx,
                    move || {
                        let store = Arc::clone(&store);
                        async move {
                            let mut store = store.lock().await;
                            let frames = store.checkpoint_wal()?;
                            Ok(frames.max(0) as usize)
                        }
                    },
                ),
            ));
        }
        // Lease tick and utilization refresh.
        if let Some(lease) = lease {
            {
                let lease = Arc::clone(lease);
                self.background_tasks.push((
                    "lease-tick",
                    spawn_loop(
                        "lease-tick",
                        config.lease_tick_interval_secs,
                        shutdown_tx,
                        move || {
                            let lease = Arc::clone(&lease);
                            async move { lease.tick().await }
                        },
                    ),
                ));
            }
            {
                let lease = Arc::clone(lease);
                self.background_tasks.push((
                    "utilization-sweep",
                    spawn_loop(
                        "utilization-sweep",
                        config.utilization_interval_secs,
                        shutdown_tx,
                        move || {
                            let lease = Arc::clone(&lease);
                            async move { lease.compute_utilization().await }
                        },
                    ),
                ));
            }
        }
    }

    /// Performs a graceful shutdown: signal every background loop, join
    /// them with a timeout, then close the database.
    pub async fn shutdown(&mut self) {
        info!("Shutting down task scheduler server gracefully");

        let shutdown_timeout_secs = {
            let manager = self.config_manager.lock().await;
            manager.server_config.graceful_shutdown_timeout_secs
        };

        if let Some(shutdown_tx) = &self.shutdown_tx {
            if let Err(e) = shutdown_tx.send(()) {
                warn!("Failed to send shutdown signal: {}", e);
            }
        }

        for (name, handle) in self.background_tasks.drain(..) {
            match tokio::time::timeout(
                std::time::Duration::from_secs(shutdown_timeout_secs),
                handle,
            )
            .await
            {
                Ok(Ok(())) => info!(task = name, "Background task completed"),
                Ok(Err(e)) => warn!(task = name, "Background task panicked: {}", e),
                Err(_) => warn!(task = name, "Background task shutdown timeout reached"),
            }
        }

        if let Some(store) = &self.store {
            info!("Closing database connection");
            let mut store = store.lock().await;
            store.close();
        }

        info!("Server shutdown complete");
    }
}

/// Spawns one periodic background loop with shutdown support.
fn spawn_loop<F, Fut>(
    name: &'static str,
    interval_secs: u64,
    shutdown_tx: &broadcast::Sender<()>,
    f: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<usize>> + Send + 'static,
{
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
        // The first tick fires immediately; skip it so loops start one
        // period after boot.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match f().await {
                        Ok(acted) if acted > 0 => {
                            info!(task = name, acted, "Background pass complete");
                        }
                        Ok(_) => {}
                        Err(e) => error!(task = name, "Background pass failed: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!(task = name, "Background task received shutdown signal");
                    break;
                }
            }
        }
    })
}

/// Waits for a shutdown signal.
///
/// On Unix systems, handles SIGTERM and SIGINT. Elsewhere, Ctrl+C.
async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());

        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to register signal handlers: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to wait for Ctrl+C: {}", e);
                } else {
                    info!("Received Ctrl+C");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to receive Ctrl+C signal: {}", e);
        } else {
            info!("Received Ctrl+C");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging.
    let file_appender = tracing_appender::rolling::daily("./logs", "server.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("server=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let cli_args = CliArgs::parse();

    info!("Task scheduler server starting up");
    info!("Configuration file: {}", cli_args.config_file.display());

    let mut server = match Server::new(cli_args.config_file) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to initialize server: {}", e);
            std::process::exit(1);
        }
    };

    if cli_args.listen_address.is_some() || cli_args.api_key.is_some() || cli_args.data_dir.is_some()
    {
        let listen_override = cli_args.listen_address.clone();
        let result = {
            let mut manager = server.config_manager.lock().await;
            manager.apply_overrides(cli_args.listen_address, cli_args.api_key, cli_args.data_dir)
        };
        if let Err(e) = result {
            error!("Failed to apply configuration overrides: {}", e);
            std::process::exit(1);
        }
        if let Some(listen) = listen_override {
            server.listen_address = match listen.parse() {
                Ok(address) => address,
                Err(e) => {
                    error!("Invalid listen address override '{}': {}", listen, e);
                    std::process::exit(1);
                }
            };
        }
        info!("Configuration overrides applied");
    }

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        _ = setup_shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown");
        }
    }

    server.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}
