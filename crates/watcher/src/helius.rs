use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Parsed transaction detail from the enhanced transactions API.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransaction {
    pub signature: String,
    /// Unix seconds.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub fee_payer: String,
    #[serde(default)]
    pub native_transfers: Vec<NativeTransfer>,
    #[serde(default)]
    pub token_transfers: Vec<TokenTransfer>,
}

impl RawTransaction {
    /// Block time, falling back to `now` when the provider omitted it.
    pub fn timestamp_utc(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.timestamp, 0)
            .filter(|_| self.timestamp > 0)
            .unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeTransfer {
    #[serde(default)]
    pub from_user_account: Option<String>,
    #[serde(default)]
    pub to_user_account: Option<String>,
    /// Lamports.
    #[serde(default)]
    pub amount: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTransfer {
    #[serde(default)]
    pub from_user_account: Option<String>,
    #[serde(default)]
    pub to_user_account: Option<String>,
    pub mint: String,
    /// UI units (already divided by decimals).
    #[serde(default)]
    pub token_amount: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(String),
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("transaction not indexed yet")]
    NotFound,
}

#[async_trait]
pub trait TransactionFetcher: Send + Sync {
    async fn fetch(&self, signature: &str) -> Result<RawTransaction, FetchError>;
}

pub struct HeliusClient {
    api_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HeliusClient {
    pub fn new(api_url: &str, api_key: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");

        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
        }
    }

    pub fn transactions_url(&self) -> String {
        format!(
            "{}/v0/transactions?api-key={}",
            self.api_url,
            urlencoding::encode(&self.api_key)
        )
    }
}

#[async_trait]
impl TransactionFetcher for HeliusClient {
    async fn fetch(&self, signature: &str) -> Result<RawTransaction, FetchError> {
        let body = serde_json::json!({ "transactions": [signature] });
        let resp = self
            .client
            .post(self.transactions_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| FetchError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut txs: Vec<RawTransaction> = resp
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;
        debug!(signature, count = txs.len(), "fetched transaction detail");
        txs.retain(|tx| tx.signature == signature);
        txs.pop().ok_or(FetchError::NotFound)
    }
}

/// Bounded fixed-delay retry. `None` means every attempt failed; the caller drops the event.
pub async fn fetch_with_retry(
    fetcher: &dyn TransactionFetcher,
    signature: &str,
    attempts: u32,
    delay: Duration,
) -> Option<RawTransaction> {
    for attempt in 1..=attempts {
        match fetcher.fetch(signature).await {
            Ok(tx) => return Some(tx),
            Err(e) => {
                warn!(signature, attempt, attempts, error = %e, "transaction fetch failed");
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    metrics::counter!("watcher_fetch_failures_total").increment(1);
    None
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{FetchError, RawTransaction, TransactionFetcher};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Serves canned transactions; unknown signatures are "not indexed".
    /// The first `fail_first` calls fail regardless.
    #[derive(Default)]
    pub struct StaticFetcher {
        txs: Mutex<HashMap<String, RawTransaction>>,
        pub fail_first: u32,
        pub calls: AtomicU32,
    }

    impl StaticFetcher {
        pub fn with(txs: Vec<RawTransaction>) -> Self {
            let fetcher = Self::default();
            for tx in txs {
                fetcher.insert(tx);
            }
            fetcher
        }

        pub fn insert(&self, tx: RawTransaction) {
            self.txs.lock().unwrap().insert(tx.signature.clone(), tx);
        }
    }

    #[async_trait]
    impl TransactionFetcher for StaticFetcher {
        async fn fetch(&self, signature: &str) -> Result<RawTransaction, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(FetchError::Http("connection reset".to_string()));
            }
            self.txs
                .lock()
                .unwrap()
                .get(signature)
                .cloned()
                .ok_or(FetchError::NotFound)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::StaticFetcher;
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_deserialize_enhanced_transaction() {
        let json = r#"[{
            "signature": "sig1",
            "timestamp": 1700000000,
            "feePayer": "Whale1",
            "type": "SWAP",
            "nativeTransfers": [
                {"fromUserAccount": "Whale1", "toUserAccount": "Pool", "amount": 2500000000}
            ],
            "tokenTransfers": [
                {"fromUserAccount": "Pool", "toUserAccount": "Whale1", "mint": "MintX",
                 "tokenAmount": 50.0, "tokenStandard": "Fungible"}
            ]
        }]"#;
        let txs: Vec<RawTransaction> = serde_json::from_str(json).unwrap();
        let tx = &txs[0];
        assert_eq!(tx.fee_payer, "Whale1");
        assert_eq!(tx.native_transfers[0].amount, 2_500_000_000);
        assert_eq!(tx.token_transfers[0].mint, "MintX");
        assert_eq!(tx.timestamp_utc().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_missing_timestamp_falls_back_to_now() {
        let tx = RawTransaction::default();
        let age = Utc::now() - tx.timestamp_utc();
        assert!(age.num_seconds() < 5);
    }

    #[test]
    fn test_transactions_url_encodes_key() {
        let client = HeliusClient::new("https://api.helius.xyz/", "k y", Duration::from_secs(5));
        assert_eq!(
            client.transactions_url(),
            "https://api.helius.xyz/v0/transactions?api-key=k%20y"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_after_transient_failures() {
        let mut fetcher = StaticFetcher::with(vec![RawTransaction {
            signature: "sig".to_string(),
            ..Default::default()
        }]);
        fetcher.fail_first = 2;

        let tx = fetch_with_retry(&fetcher, "sig", 3, Duration::from_secs(1)).await;
        assert!(tx.is_some());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_indexed_counts_as_failure_and_gives_up() {
        let fetcher = StaticFetcher::default();
        let started = tokio::time::Instant::now();
        let tx = fetch_with_retry(&fetcher, "missing", 3, Duration::from_secs(1)).await;
        assert!(tx.is_none());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        // Two waits between three attempts.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(3));
    }
}
