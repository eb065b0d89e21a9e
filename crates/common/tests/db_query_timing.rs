use chrono::Utc;
use common::db::AsyncDb;
use common::types::{ClassifiedTrade, InsertOutcome, SignalStatus, TradeKind, TradeSignal};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::collections::BTreeSet;

fn trade(signature: &str) -> ClassifiedTrade {
    ClassifiedTrade {
        wallet_address: "Whale1".to_string(),
        token_address: "MintA".to_string(),
        kind: TradeKind::Buy,
        sol_amount: 4.0,
        token_amount: 1_000.0,
        signature: signature.to_string(),
        timestamp: Utc::now(),
    }
}

fn lines_for<'a>(rendered: &'a str, metric: &str, op: &str) -> Vec<&'a str> {
    let label = format!("op=\"{op}\"");
    rendered
        .lines()
        .filter(|l| l.starts_with(metric) && l.contains(&label))
        .collect()
}

#[test]
fn store_operations_record_latency_and_errors_per_op() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    let rt = tokio::runtime::Runtime::new().unwrap();
    metrics::with_local_recorder(&recorder, || {
        rt.block_on(async {
            let tmp = tempfile::NamedTempFile::new().unwrap();
            let db = AsyncDb::open(tmp.path().to_str().unwrap()).await.unwrap();

            assert_eq!(
                db.insert_trade(&trade("sig-1")).await.unwrap(),
                InsertOutcome::Inserted
            );
            assert_eq!(
                db.insert_trade(&trade("sig-1")).await.unwrap(),
                InsertOutcome::Duplicate
            );

            let id = db
                .insert_signal(&TradeSignal {
                    id: None,
                    token_address: "MintA".to_string(),
                    triggering_wallets: BTreeSet::from(["Whale1".to_string()]),
                    total_sol_amount: 4.0,
                    reason: "1 whale bought within 1h".to_string(),
                    created_at: Utc::now(),
                    status: SignalStatus::Open,
                })
                .await
                .unwrap();
            assert!(db.open_signal_ids().await.unwrap().contains(&id));

            // Losing the table turns the next insert into a failed query.
            db.call(|conn| {
                conn.execute_batch("DROP TABLE trades")?;
                Ok(())
            })
            .await
            .unwrap();
            assert!(db.insert_trade(&trade("sig-2")).await.is_err());
        });
    });

    let rendered = handle.render();
    let latency = "watcher_db_query_latency_ms";
    let errors = "watcher_db_query_errors_total";

    let insert_latency = lines_for(&rendered, latency, "trades.insert");
    assert!(
        insert_latency.iter().any(|l| l.contains("status=\"ok\"")),
        "expected ok latency for trades.insert, got:\n{rendered}"
    );
    assert!(
        insert_latency.iter().any(|l| l.contains("status=\"err\"")),
        "expected err latency for trades.insert, got:\n{rendered}"
    );
    assert!(
        !lines_for(&rendered, latency, "signals.open_ids").is_empty(),
        "expected latency for signals.open_ids, got:\n{rendered}"
    );

    assert_eq!(lines_for(&rendered, errors, "trades.insert").len(), 1);
    assert!(lines_for(&rendered, errors, "signals.open_ids").is_empty());
    assert!(lines_for(&rendered, errors, "signals.insert").is_empty());
}
