//! Turns fetched transaction detail into per-wallet trades.
//!
//! A transaction is attributed to every tracked wallet that pays its fee or
//! appears on either side of one of its transfers. Each attributed wallet is
//! classified from its own SOL and token legs:
//!
//! 1. SOL out + token in: `BUY`
//! 2. token out + SOL in: `SELL`
//! 3. token in only: `TRANSFER_IN`, token out only: `TRANSFER_OUT`
//! 4. anything else: `OTHER` (dropped)
//!
//! Wrapped SOL moves are SOL legs. When several mints move the same way the
//! largest one is the trade subject.

use crate::helius::RawTransaction;
use crate::registry::WalletSnapshot;
use common::types::{ClassifiedTrade, TradeKind, LAMPORTS_PER_SOL, WRAPPED_SOL_MINT};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// SOL and token movement of one wallet inside one transaction.
#[derive(Debug, Default)]
struct WalletFlows {
    sol_sent: f64,
    sol_received: f64,
    tokens_sent: BTreeMap<String, f64>,
    tokens_received: BTreeMap<String, f64>,
}

impl WalletFlows {
    fn collect(tx: &RawTransaction, wallet: &str) -> Self {
        let mut flows = Self::default();

        for transfer in &tx.native_transfers {
            let from = transfer.from_user_account.as_deref() == Some(wallet);
            let to = transfer.to_user_account.as_deref() == Some(wallet);
            let sol = transfer.amount as f64 / LAMPORTS_PER_SOL;
            match (from, to) {
                (true, false) => flows.sol_sent += sol,
                (false, true) => flows.sol_received += sol,
                _ => {}
            }
        }

        for transfer in &tx.token_transfers {
            let from = transfer.from_user_account.as_deref() == Some(wallet);
            let to = transfer.to_user_account.as_deref() == Some(wallet);
            let amount = transfer.token_amount;
            let wsol = transfer.mint == WRAPPED_SOL_MINT;
            match (from, to, wsol) {
                (true, false, true) => flows.sol_sent += amount,
                (false, true, true) => flows.sol_received += amount,
                (true, false, false) => {
                    *flows.tokens_sent.entry(transfer.mint.clone()).or_default() += amount;
                }
                (false, true, false) => {
                    *flows
                        .tokens_received
                        .entry(transfer.mint.clone())
                        .or_default() += amount;
                }
                _ => {}
            }
        }

        flows
    }
}

fn largest(legs: &BTreeMap<String, f64>) -> Option<(&str, f64)> {
    legs.iter()
        .filter(|(_, amount)| **amount > 0.0)
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(mint, amount)| (mint.as_str(), *amount))
}

/// Every tracked wallet this transaction touches.
pub fn attributable_wallets(tx: &RawTransaction, wallets: &WalletSnapshot) -> BTreeSet<String> {
    let native = tx
        .native_transfers
        .iter()
        .flat_map(|t| [t.from_user_account.as_deref(), t.to_user_account.as_deref()]);
    let token = tx
        .token_transfers
        .iter()
        .flat_map(|t| [t.from_user_account.as_deref(), t.to_user_account.as_deref()]);

    std::iter::once(Some(tx.fee_payer.as_str()))
        .chain(native)
        .chain(token)
        .flatten()
        .filter(|address| wallets.is_tracked(address))
        .map(str::to_string)
        .collect()
}

/// Classify one transaction for one wallet. May return `OTHER`.
pub fn classify_for_wallet(tx: &RawTransaction, wallet: &str) -> ClassifiedTrade {
    let flows = WalletFlows::collect(tx, wallet);

    let bought = largest(&flows.tokens_received);
    let sold = largest(&flows.tokens_sent);

    let (kind, token, sol_amount, token_amount) = match (bought, sold) {
        (Some((mint, amount)), _) if flows.sol_sent > 0.0 => {
            (TradeKind::Buy, mint, flows.sol_sent, amount)
        }
        (_, Some((mint, amount))) if flows.sol_received > 0.0 => {
            (TradeKind::Sell, mint, flows.sol_received, amount)
        }
        (Some((mint, amount)), _) => (TradeKind::TransferIn, mint, 0.0, amount),
        (None, Some((mint, amount))) => (TradeKind::TransferOut, mint, 0.0, amount),
        (None, None) => (TradeKind::Other, "", 0.0, 0.0),
    };

    ClassifiedTrade {
        wallet_address: wallet.to_string(),
        token_address: token.to_string(),
        kind,
        sol_amount,
        token_amount,
        signature: tx.signature.clone(),
        timestamp: tx.timestamp_utc(),
    }
}

/// All persistable trades in a transaction: one per attributed wallet, `OTHER` dropped.
pub fn classify(tx: &RawTransaction, wallets: &WalletSnapshot) -> Vec<ClassifiedTrade> {
    let attributed = attributable_wallets(tx, wallets);
    if attributed.is_empty() {
        debug!(signature = %tx.signature, "no tracked wallet in transaction");
        return Vec::new();
    }

    attributed
        .iter()
        .map(|wallet| classify_for_wallet(tx, wallet))
        .filter(|trade| {
            metrics::counter!("watcher_trades_classified_total", "kind" => trade.kind.as_str())
                .increment(1);
            if trade.kind == TradeKind::Other {
                debug!(
                    signature = %trade.signature,
                    wallet = %trade.wallet_address,
                    "unclassifiable transaction for wallet"
                );
                return false;
            }
            true
        })
        .collect()
}
