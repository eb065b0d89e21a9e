use crate::recorder::TradeRecorder;
use async_trait::async_trait;
use common::types::TokenMetadata;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct TokensResponse {
    #[serde(default)]
    pairs: Option<Vec<Pair>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pair {
    base_token: PairToken,
}

#[derive(Debug, Deserialize)]
struct PairToken {
    address: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    symbol: Option<String>,
}

/// Source of token symbol/name for tokens the store has no name for.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn lookup(&self, address: &str) -> Option<TokenMetadata>;
}

pub struct DexScreenerClient {
    base_url: String,
    client: reqwest::Client,
}

impl DexScreenerClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn tokens_url(&self, address: &str) -> String {
        format!(
            "{}/latest/dex/tokens/{}",
            self.base_url,
            urlencoding::encode(address)
        )
    }
}

fn metadata_from(response: TokensResponse, address: &str) -> Option<TokenMetadata> {
    response
        .pairs
        .unwrap_or_default()
        .into_iter()
        .map(|p| p.base_token)
        .find(|t| t.address == address)
        .map(|t| TokenMetadata {
            address: t.address,
            symbol: t.symbol.filter(|s| !s.is_empty()),
            name: t.name.filter(|n| !n.is_empty()),
        })
}

#[async_trait]
impl MetadataSource for DexScreenerClient {
    async fn lookup(&self, address: &str) -> Option<TokenMetadata> {
        let resp = match self.client.get(self.tokens_url(address)).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(token = %address, error = %e, "dexscreener lookup failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            warn!(token = %address, status = resp.status().as_u16(), "dexscreener lookup rejected");
            return None;
        }
        match resp.json::<TokensResponse>().await {
            Ok(body) => metadata_from(body, address),
            Err(e) => {
                warn!(token = %address, error = %e, "failed to decode dexscreener response");
                None
            }
        }
    }
}

/// Fills token symbol/name before an alert goes out. Never blocks dispatch:
/// any failure yields metadata with only the address.
pub struct TokenMetadataResolver {
    recorder: TradeRecorder,
    source: Option<Arc<dyn MetadataSource>>,
}

impl TokenMetadataResolver {
    pub fn new(recorder: TradeRecorder, source: Option<Arc<dyn MetadataSource>>) -> Self {
        Self { recorder, source }
    }

    pub async fn resolve(&self, address: &str) -> TokenMetadata {
        if let Some(stored) = self.recorder.token_metadata(address).await {
            if stored.symbol.is_some() {
                return stored;
            }
        }

        let Some(source) = &self.source else {
            return TokenMetadata::unknown(address);
        };
        match source.lookup(address).await {
            Some(found) => {
                debug!(token = %address, symbol = ?found.symbol, "resolved token metadata");
                self.recorder.store_metadata(&found).await;
                found
            }
            None => TokenMetadata::unknown(address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::db::AsyncDb;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSource {
        calls: AtomicU32,
    }

    #[async_trait]
    impl MetadataSource for CountingSource {
        async fn lookup(&self, address: &str) -> Option<TokenMetadata> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(TokenMetadata {
                address: address.to_string(),
                symbol: Some("WIF".to_string()),
                name: Some("dogwifhat".to_string()),
            })
        }
    }

    #[test]
    fn test_parse_tokens_response() {
        let body: TokensResponse = serde_json::from_str(
            r#"{"schemaVersion":"1.0.0","pairs":[
                {"chainId":"solana","baseToken":{"address":"Other","name":"X","symbol":"X"}},
                {"chainId":"solana","baseToken":{"address":"MintW","name":"dogwifhat","symbol":"WIF"},
                 "quoteToken":{"address":"So11111111111111111111111111111111111111112"}}
            ]}"#,
        )
        .unwrap();
        let meta = metadata_from(body, "MintW").unwrap();
        assert_eq!(meta.symbol.as_deref(), Some("WIF"));
        assert_eq!(meta.name.as_deref(), Some("dogwifhat"));
    }

    #[test]
    fn test_null_pairs_is_none() {
        let body: TokensResponse = serde_json::from_str(r#"{"pairs":null}"#).unwrap();
        assert!(metadata_from(body, "MintW").is_none());
    }

    #[tokio::test]
    async fn test_resolver_caches_through_store() {
        let db = AsyncDb::open_memory().await.unwrap();
        let source = Arc::new(CountingSource {
            calls: AtomicU32::new(0),
        });
        let resolver =
            TokenMetadataResolver::new(TradeRecorder::new(db), Some(source.clone()));

        assert_eq!(resolver.resolve("MintW").await.symbol.as_deref(), Some("WIF"));
        assert_eq!(resolver.resolve("MintW").await.symbol.as_deref(), Some("WIF"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolver_without_source_returns_address_only() {
        let db = AsyncDb::open_memory().await.unwrap();
        let resolver = TokenMetadataResolver::new(TradeRecorder::new(db), None);
        let meta = resolver.resolve("MintW").await;
        assert_eq!(meta, TokenMetadata::unknown("MintW"));
    }
}
