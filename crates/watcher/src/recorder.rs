use anyhow::Result;
use common::db::AsyncDb;
use common::types::{ClassifiedTrade, InsertOutcome, TokenMetadata, TradeSignal};
use std::collections::HashSet;
use tracing::{debug, error};

/// Persists trades and signals. Store failures are logged and swallowed:
/// callers get `None` and drop the event.
#[derive(Clone)]
pub struct TradeRecorder {
    db: AsyncDb,
}

impl TradeRecorder {
    pub fn new(db: AsyncDb) -> Self {
        Self { db }
    }

    /// Ensure the token row exists, then insert the trade idempotently.
    pub async fn record_trade(&self, trade: &ClassifiedTrade) -> Option<InsertOutcome> {
        if let Err(e) = self.db.upsert_token(&trade.token_address, None, None).await {
            error!(
                token = %trade.token_address,
                signature = %trade.signature,
                error = %e,
                "failed to upsert token, dropping trade"
            );
            return None;
        }

        match self.db.insert_trade(trade).await {
            Ok(outcome) => {
                metrics::counter!("watcher_trades_recorded_total", "outcome" => outcome.as_str())
                    .increment(1);
                debug!(
                    signature = %trade.signature,
                    wallet = %trade.wallet_address,
                    kind = %trade.kind,
                    outcome = outcome.as_str(),
                    "trade recorded"
                );
                Some(outcome)
            }
            Err(e) => {
                metrics::counter!("watcher_trades_recorded_total", "outcome" => "error")
                    .increment(1);
                error!(
                    signature = %trade.signature,
                    wallet = %trade.wallet_address,
                    error = %e,
                    "failed to persist trade, dropping"
                );
                None
            }
        }
    }

    pub async fn record_signal(&self, signal: &TradeSignal) -> Option<i64> {
        match self.db.insert_signal(signal).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!(token = %signal.token_address, error = %e, "failed to persist signal");
                None
            }
        }
    }

    pub async fn open_signal_ids(&self) -> Result<HashSet<i64>> {
        self.db.open_signal_ids().await
    }

    /// Stored metadata for a token, if any row exists.
    pub async fn token_metadata(&self, address: &str) -> Option<TokenMetadata> {
        match self.db.token_metadata(address).await {
            Ok(meta) => meta,
            Err(e) => {
                error!(token = %address, error = %e, "failed to read token metadata");
                None
            }
        }
    }

    pub async fn store_metadata(&self, meta: &TokenMetadata) {
        if let Err(e) = self
            .db
            .upsert_token(&meta.address, meta.symbol.as_deref(), meta.name.as_deref())
            .await
        {
            error!(token = %meta.address, error = %e, "failed to store token metadata");
        }
    }
}
