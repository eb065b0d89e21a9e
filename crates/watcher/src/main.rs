mod api;
mod classifier;
mod config;
mod correlator;
mod dexscreener;
mod feed;
mod helius;
mod metrics;
mod notify;
mod pipeline;
mod recorder;
mod registry;
mod scheduler;

use anyhow::Result;
use common::db::AsyncDb;
use common::observability::LogCategory;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::correlator::SignalCorrelator;
use crate::dexscreener::{DexScreenerClient, MetadataSource, TokenMetadataResolver};
use crate::feed::{ConnectionManager, FeedSettings, WsTransport};
use crate::helius::{HeliusClient, TransactionFetcher};
use crate::notify::NotificationDispatcher;
use crate::pipeline::{IngestPipeline, PipelineContext};
use crate::recorder::TradeRecorder;
use crate::registry::WalletRegistry;

/// Names accepted by the config-change webhook's `log_categories`.
const LOG_CATEGORIES: &[LogCategory] = &[
    LogCategory {
        name: "connection",
        target: "watcher::feed",
    },
    LogCategory {
        name: "classifier",
        target: "watcher::classifier",
    },
    LogCategory {
        name: "recorder",
        target: "watcher::recorder",
    },
    LogCategory {
        name: "correlator",
        target: "watcher::correlator",
    },
    LogCategory {
        name: "notifier",
        target: "watcher::notify",
    },
    LogCategory {
        name: "registry",
        target: "watcher::registry",
    },
    LogCategory {
        name: "api",
        target: "watcher::api",
    },
];

#[allow(clippy::too_many_lines)] // component wiring and shutdown ordering
#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(config::WatcherConfig::default_config_path);
    let cfg = config::WatcherConfig::load(&config_path)?.with_env_overrides();

    let (dispatch, log_control, _otel_guard) =
        common::observability::build_dispatch("watcher", &cfg.observability.log_level);
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;
    let log_control = log_control.with_categories(LOG_CATEGORIES);

    info!(path = %config_path, "whale watcher starting");

    metrics::install_prometheus(cfg.observability.prometheus_port)?;
    metrics::describe();

    if let Some(parent) = std::path::Path::new(&cfg.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = AsyncDb::open(&cfg.database.path).await?;

    let registry = Arc::new(WalletRegistry::new());
    let initial = registry.reload(&db).await?;
    info!(
        tracked = initial.len(),
        active = initial.active_addresses().len(),
        "loaded tracked wallets"
    );
    if initial.is_empty() {
        warn!("no tracked wallets in store, feed stays disconnected until one is added");
    } else if initial.active_addresses().is_empty() {
        warn!("no active wallets, feed stays disconnected until one is activated");
    }

    let recorder = TradeRecorder::new(db.clone());
    let correlator = Arc::new(SignalCorrelator::new(cfg.signal_rule.clone()));
    let dispatcher = Arc::new(NotificationDispatcher::from_config(&cfg.notifications));
    info!(channels = ?dispatcher.channel_names(), "notification channels configured");

    let http_timeout = Duration::from_secs(cfg.helius.request_timeout_secs);
    let metadata_source: Option<Arc<dyn MetadataSource>> = if cfg.metadata.enabled {
        Some(Arc::new(DexScreenerClient::new(
            &cfg.metadata.dexscreener_url,
            http_timeout,
        )))
    } else {
        None
    };
    let fetcher: Arc<dyn TransactionFetcher> = Arc::new(HeliusClient::new(
        &cfg.helius.api_url,
        &cfg.helius.api_key,
        http_timeout,
    ));

    let (queue_tx, queue_rx) = mpsc::channel(cfg.feed.queue_capacity);
    let (manager, connection) = ConnectionManager::new(
        WsTransport::new(cfg.feed.ws_url.clone()),
        FeedSettings::from(&cfg.feed),
        registry.subscribe(),
        queue_tx,
    );

    let pipeline = IngestPipeline::new(
        PipelineContext {
            fetcher,
            registry: Arc::clone(&registry),
            recorder: recorder.clone(),
            correlator: Arc::clone(&correlator),
            resolver: Arc::new(TokenMetadataResolver::new(
                recorder.clone(),
                metadata_source,
            )),
            dispatcher,
            fetch_attempts: cfg.helius.fetch_attempts,
            fetch_retry_delay: Duration::from_millis(cfg.helius.fetch_retry_delay_ms),
        },
        cfg.pipeline.max_concurrent_tasks,
        Duration::from_secs(cfg.pipeline.drain_timeout_secs),
    );

    let cancel = CancellationToken::new();
    let pipeline_task = tokio::spawn(pipeline.run(queue_rx, cancel.clone()));
    let mut feed_task = tokio::spawn(manager.run());

    // ── Periodic jobs: registry reload and open-signal resync ──
    let (reload_tx, mut reload_rx) = mpsc::channel::<()>(1);
    let (resync_tx, mut resync_rx) = mpsc::channel::<()>(1);
    let reload_interval = Duration::from_secs(cfg.registry.reload_interval_secs);
    let _tickers = scheduler::start(
        vec![
            scheduler::JobSpec {
                name: "registry_reload",
                interval: reload_interval,
                tick: reload_tx,
            },
            scheduler::JobSpec {
                name: "signal_resync",
                interval: reload_interval,
                tick: resync_tx,
            },
        ],
        &cancel,
    );

    {
        let registry = Arc::clone(&registry);
        let db = db.clone();
        tokio::spawn(async move {
            while reload_rx.recv().await.is_some() {
                if let Err(e) = registry.reload(&db).await {
                    warn!(error = %e, "registry reload failed, keeping previous snapshot");
                }
            }
        });
    }
    {
        let correlator = Arc::clone(&correlator);
        let recorder = recorder.clone();
        tokio::spawn(async move {
            while resync_rx.recv().await.is_some() {
                match recorder.open_signal_ids().await {
                    Ok(open) => {
                        let rearmed = correlator.retain_open(&open);
                        if rearmed > 0 {
                            info!(rearmed, "signals closed in store, tokens re-armed");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to read open signals"),
                }
            }
        });
    }

    // ── HTTP: health, status and inbound webhooks ──
    let state = Arc::new(api::AppState {
        db,
        registry,
        correlator,
        connection: connection.watch_state(),
        log_control,
        started_at: chrono::Utc::now(),
    });
    let app = api::router(state);

    let bind_addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    info!(addr = %bind_addr, "starting watcher HTTP server");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "failed to listen for shutdown signal");
            }
            info!(connection = connection.state().as_str(), "shutdown requested");
            None
        }
        result = &mut feed_task => Some(result),
    };

    connection.shutdown();
    let feed_result = match finished {
        Some(result) => result,
        None => feed_task.await,
    };

    // Feed is closed: stop admitting work and drain what is in flight.
    cancel.cancel();
    if let Err(e) = pipeline_task.await {
        error!(error = %e, "pipeline task failed");
    }
    match server.await {
        Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
        Err(e) => error!(error = %e, "HTTP server task failed"),
        Ok(Ok(())) => {}
    }

    match feed_result {
        Ok(Ok(())) => {
            info!("whale watcher stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "feed connection gave up");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}
