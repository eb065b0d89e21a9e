pub mod webhooks;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use common::db::AsyncDb;
use common::observability::LogControl;
use common::types::SignalRule;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::correlator::SignalCorrelator;
use crate::feed::ConnectionState;
use crate::registry::WalletRegistry;

/// Shared application state available to all handlers.
pub struct AppState {
    pub db: AsyncDb,
    pub registry: Arc<WalletRegistry>,
    pub correlator: Arc<SignalCorrelator>,
    pub connection: watch::Receiver<ConnectionState>,
    pub log_control: LogControl,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/webhooks/wallet-changes", post(webhooks::wallet_changes))
        .route("/webhooks/config-changes", post(webhooks::config_changes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = chrono::Utc::now()
        .signed_duration_since(state.started_at)
        .num_seconds();

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: uptime,
    })
}

#[derive(Serialize)]
struct StatusResponse {
    connection_state: &'static str,
    tracked_wallets: usize,
    active_wallets: usize,
    open_signals: usize,
    trades_recorded: i64,
    signal_rule: SignalRule,
    uptime_secs: i64,
}

async fn status(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, StatusCode> {
    let uptime = chrono::Utc::now()
        .signed_duration_since(state.started_at)
        .num_seconds();
    let snapshot = state.registry.snapshot();
    let connection_state = state.connection.borrow().as_str();

    let trades = state
        .db
        .count_trades()
        .await
        .map_err(|_db_err| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(StatusResponse {
        connection_state,
        tracked_wallets: snapshot.len(),
        active_wallets: snapshot.active_addresses().len(),
        open_signals: state.correlator.open_signal_count(),
        trades_recorded: trades,
        signal_rule: state.correlator.rule().clone(),
        uptime_secs: uptime,
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use common::observability::LogCategory;
    use common::types::TrackedWallet;
    use tower::ServiceExt;

    pub(crate) const CATEGORIES: &[LogCategory] = &[
        LogCategory {
            name: "connection",
            target: "watcher::feed",
        },
        LogCategory {
            name: "correlator",
            target: "watcher::correlator",
        },
    ];

    pub(crate) async fn test_app() -> (Router, Arc<AppState>, watch::Sender<ConnectionState>) {
        let db = AsyncDb::open_memory().await.unwrap();
        db.upsert_tracked_wallet(&TrackedWallet::new("W1"))
            .await
            .unwrap();
        let registry = Arc::new(WalletRegistry::new());
        registry.reload(&db).await.unwrap();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Active);

        let state = Arc::new(AppState {
            db,
            registry,
            correlator: Arc::new(SignalCorrelator::new(SignalRule {
                min_whales: 3,
                time_window_hours: 1.0,
                min_total_sol: 10.0,
                active: true,
            })),
            connection: state_rx,
            log_control: LogControl::detached().with_categories(CATEGORIES),
            started_at: chrono::Utc::now(),
        });
        let app = router(Arc::clone(&state));
        (app, state, state_tx)
    }

    pub(crate) async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 4096)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (app, _state, _conn) = test_app().await;
        let req = Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert!(json["uptime_secs"].as_i64().unwrap() >= 0);
    }

    #[tokio::test]
    async fn test_status_reports_connection_and_wallets() {
        let (app, _state, conn) = test_app().await;
        conn.send_replace(ConnectionState::Reconnecting);
        let req = Request::builder()
            .uri("/api/status")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["connection_state"], "RECONNECTING");
        assert_eq!(json["tracked_wallets"], 1);
        assert_eq!(json["active_wallets"], 1);
        assert_eq!(json["open_signals"], 0);
        assert_eq!(json["trades_recorded"], 0);
        assert_eq!(json["signal_rule"]["min_whales"], 3);
    }
}
