use crate::classifier;
use crate::correlator::SignalCorrelator;
use crate::dexscreener::TokenMetadataResolver;
use crate::feed::LogNotification;
use crate::helius::{fetch_with_retry, TransactionFetcher};
use crate::notify::format::Alert;
use crate::notify::NotificationDispatcher;
use crate::recorder::TradeRecorder;
use crate::registry::WalletRegistry;
use chrono::Utc;
use common::types::InsertOutcome;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Everything one notification needs on its way from signature to alert.
pub struct PipelineContext {
    pub fetcher: Arc<dyn TransactionFetcher>,
    pub registry: Arc<WalletRegistry>,
    pub recorder: TradeRecorder,
    pub correlator: Arc<SignalCorrelator>,
    pub resolver: Arc<TokenMetadataResolver>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub fetch_attempts: u32,
    pub fetch_retry_delay: Duration,
}

/// Bounded worker pool over the notification queue.
pub struct IngestPipeline {
    ctx: Arc<PipelineContext>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    drain_timeout: Duration,
}

impl IngestPipeline {
    pub fn new(ctx: PipelineContext, max_concurrent: usize, drain_timeout: Duration) -> Self {
        Self {
            ctx: Arc::new(ctx),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            tracker: TaskTracker::new(),
            drain_timeout,
        }
    }

    /// Consume the queue until it closes or `cancel` fires, then wait for
    /// in-flight work up to the drain timeout.
    pub async fn run(self, mut queue: mpsc::Receiver<LogNotification>, cancel: CancellationToken) {
        loop {
            let notification = tokio::select! {
                () = cancel.cancelled() => break,
                next = queue.recv() => match next {
                    Some(n) => n,
                    None => break,
                },
            };
            let permit = tokio::select! {
                () = cancel.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let ctx = Arc::clone(&self.ctx);
            self.tracker.spawn(async move {
                let _permit = permit;
                process(&ctx, notification).await;
            });
        }

        queue.close();
        self.tracker.close();
        info!(in_flight = self.tracker.len(), "pipeline stopped admitting work, draining");
        if tokio::time::timeout(self.drain_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.tracker.len(),
                "drain timed out, abandoning in-flight work"
            );
        } else {
            info!("pipeline drained");
        }
    }
}

/// fetch → classify → record → correlate → dispatch for one signature.
pub async fn process(ctx: &PipelineContext, notification: LogNotification) {
    let signature = notification.signature;
    let Some(tx) = fetch_with_retry(
        ctx.fetcher.as_ref(),
        &signature,
        ctx.fetch_attempts,
        ctx.fetch_retry_delay,
    )
    .await
    else {
        error!(signature = %signature, "transaction detail unavailable, dropping notification");
        return;
    };

    let snapshot = ctx.registry.snapshot();
    let trades = classifier::classify(&tx, &snapshot);
    debug!(signature = %signature, trades = trades.len(), "classified transaction");

    for trade in trades {
        match ctx.recorder.record_trade(&trade).await {
            Some(InsertOutcome::Inserted) => {}
            Some(InsertOutcome::Duplicate) | None => continue,
        }

        let Some(mut signal) = ctx.correlator.evaluate(&trade, Utc::now()) else {
            continue;
        };
        if let Some(id) = ctx.recorder.record_signal(&signal).await {
            signal.id = Some(id);
            ctx.correlator.bind_signal_id(&signal, id);
        }

        let metadata = ctx.resolver.resolve(&signal.token_address).await;
        let alert = Alert::new(&signal, &metadata, &snapshot);
        let report = ctx.dispatcher.dispatch(&alert).await;
        info!(
            token = %signal.token_address,
            signal_id = ?signal.id,
            delivered = ?report.delivered,
            failed = ?report.failed,
            "signal dispatched"
        );
    }
}
