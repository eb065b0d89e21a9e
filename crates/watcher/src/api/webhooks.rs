use axum::{extract::State, http::StatusCode, Json};
use common::types::{ChangeType, TrackedWallet};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use super::AppState;

const WALLETS_TABLE: &str = "tracked_wallets";

type ApiError = (StatusCode, Json<Value>);

fn bad_request(message: impl Into<String>) -> ApiError {
    let message = message.into();
    warn!(error = %message, "rejected webhook payload");
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

#[derive(Debug, Deserialize)]
pub struct WalletChange {
    #[serde(default)]
    pub table: Option<String>,
    #[serde(rename = "type")]
    pub change: ChangeType,
    #[serde(default)]
    pub record: Option<WalletRecord>,
    #[serde(default)]
    pub old_record: Option<WalletRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletRecord {
    #[serde(alias = "wallet_address")]
    pub address: String,
    #[serde(default, alias = "name")]
    pub alias: Option<String>,
    #[serde(default = "default_active", alias = "active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl From<WalletRecord> for TrackedWallet {
    fn from(record: WalletRecord) -> Self {
        Self {
            address: record.address,
            alias: record.alias.filter(|a| !a.is_empty()),
            active: record.is_active,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WalletChangeResponse {
    pub address: String,
    pub active_set_changed: bool,
    pub active_wallets: usize,
}

/// Row change on `tracked_wallets`. The change is mirrored into the store so
/// the periodic reload agrees with it, then applied to the live registry.
pub async fn wallet_changes(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<WalletChange>,
) -> Result<Json<WalletChangeResponse>, ApiError> {
    if let Some(table) = payload.table.as_deref() {
        if table != WALLETS_TABLE {
            return Err(bad_request(format!("unexpected table: {table}")));
        }
    }

    let record = match payload.change {
        ChangeType::Delete => payload.old_record.or(payload.record),
        ChangeType::Insert | ChangeType::Update => payload.record,
    };
    let Some(record) = record else {
        return Err(bad_request("missing wallet record"));
    };
    if record.address.trim().is_empty() {
        return Err(bad_request("wallet address is empty"));
    }
    let wallet = TrackedWallet::from(record);

    let stored = match payload.change {
        ChangeType::Insert | ChangeType::Update => state.db.upsert_tracked_wallet(&wallet).await,
        ChangeType::Delete => state.db.delete_tracked_wallet(&wallet.address).await,
    };
    if let Err(e) = stored {
        warn!(wallet = %wallet.address, error = %e, "failed to mirror wallet change into store");
    }

    let address = wallet.address.clone();
    let changed = state.registry.apply_change(payload.change, wallet).await;
    Ok(Json(WalletChangeResponse {
        address,
        active_set_changed: changed,
        active_wallets: state.registry.active_addresses().len(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ConfigChange {
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default, rename = "type")]
    pub change: Option<ChangeType>,
    pub record: ConfigRecord,
}

#[derive(Debug, Deserialize)]
pub struct ConfigRecord {
    pub log_level: String,
    #[serde(default)]
    pub log_categories: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct ConfigChangeResponse {
    pub directive: String,
}

/// Runtime log verbosity. Nothing else in the process is reconfigurable here.
pub async fn config_changes(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ConfigChange>,
) -> Result<Json<ConfigChangeResponse>, ApiError> {
    let categories = payload
        .record
        .log_categories
        .filter(|c| !c.is_empty());

    let directive = state
        .log_control
        .apply(&payload.record.log_level, categories.as_deref())
        .map_err(|e| bad_request(e.to_string()))?;

    info!(
        table = ?payload.table,
        change = ?payload.change,
        directive = %directive,
        "log filter updated"
    );
    Ok(Json(ConfigChangeResponse { directive }))
}

#[cfg(test)]
mod tests {
    use super::super::tests::{body_json, test_app};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_wallet_insert_extends_active_set_and_store() {
        let (app, state, _conn) = test_app().await;
        let mut wallets = state.registry.subscribe();

        let response = app
            .oneshot(post(
                "/webhooks/wallet-changes",
                r#"{"table":"tracked_wallets","type":"INSERT",
                    "record":{"wallet_address":"W2","alias":"smart money","is_active":true}}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["active_set_changed"], true);
        assert_eq!(json["active_wallets"], 2);
        assert!(wallets.has_changed().unwrap());
        assert_eq!(
            state.registry.snapshot().alias_for("W2"),
            Some("smart money")
        );
        assert_eq!(state.db.load_tracked_wallets().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_alias_only_update_does_not_touch_active_set() {
        let (app, state, _conn) = test_app().await;
        let mut wallets = state.registry.subscribe();

        let response = app
            .oneshot(post(
                "/webhooks/wallet-changes",
                r#"{"table":"tracked_wallets","type":"UPDATE",
                    "record":{"address":"W1","alias":"renamed"}}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["active_set_changed"], false);
        assert!(!wallets.has_changed().unwrap());
        assert_eq!(state.registry.snapshot().alias_for("W1"), Some("renamed"));
    }

    #[tokio::test]
    async fn test_delete_with_only_old_record() {
        let (app, state, _conn) = test_app().await;

        let response = app
            .oneshot(post(
                "/webhooks/wallet-changes",
                r#"{"table":"tracked_wallets","type":"DELETE","record":null,
                    "old_record":{"wallet_address":"W1"}}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(!state.registry.is_tracked("W1"));
        assert!(state.db.load_tracked_wallets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wallet_change_rejects_other_tables_and_missing_record() {
        let (app, _state, _conn) = test_app().await;
        let response = app
            .clone()
            .oneshot(post(
                "/webhooks/wallet-changes",
                r#"{"table":"signals","type":"INSERT","record":{"address":"W9"}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(post(
                "/webhooks/wallet-changes",
                r#"{"table":"tracked_wallets","type":"UPDATE"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_config_change_narrows_to_categories() {
        let (app, _state, _conn) = test_app().await;
        let response = app
            .oneshot(post(
                "/webhooks/config-changes",
                r#"{"table":"app_config","type":"UPDATE",
                    "record":{"log_level":"DEBUG","log_categories":["connection"]}}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["directive"], "warn,watcher::feed=debug");
    }

    #[tokio::test]
    async fn test_config_change_rejects_unknown_level() {
        let (app, _state, _conn) = test_app().await;
        let response = app
            .oneshot(post(
                "/webhooks/config-changes",
                r#"{"record":{"log_level":"loud"}}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("loud"));
    }
}
