use chrono::{DateTime, Utc};
use common::types::{ClassifiedTrade, SignalRule, SignalStatus, TradeKind, TradeSignal};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

struct WindowEntry {
    wallet: String,
    timestamp: DateTime<Utc>,
    sol_amount: f64,
}

/// An emitted signal still OPEN, with the wallet set that fired it.
struct OpenSignal {
    id: Option<i64>,
    wallets: BTreeSet<String>,
}

#[derive(Default)]
struct TokenWindow {
    entries: Vec<WindowEntry>,
    open: Vec<OpenSignal>,
}

impl TokenWindow {
    fn is_idle(&self) -> bool {
        self.entries.is_empty() && self.open.is_empty()
    }
}

/// Sliding-window multi-wallet buy correlation.
///
/// Each token has its own lock, so evaluations for one token are serialized
/// while different tokens proceed in parallel. A signal fires when the
/// window holds at least `min_whales` distinct wallets and `min_total_sol`,
/// unless an OPEN signal for the token already covers the same wallets.
pub struct SignalCorrelator {
    rule: SignalRule,
    windows: Mutex<HashMap<String, Arc<Mutex<TokenWindow>>>>,
}

impl SignalCorrelator {
    pub fn new(rule: SignalRule) -> Self {
        Self {
            rule,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn rule(&self) -> &SignalRule {
        &self.rule
    }

    fn window_for(&self, token: &str) -> Arc<Mutex<TokenWindow>> {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(windows.entry(token.to_string()).or_default())
    }

    /// Feed one newly persisted trade. Only BUYs participate.
    pub fn evaluate(&self, trade: &ClassifiedTrade, now: DateTime<Utc>) -> Option<TradeSignal> {
        if !self.rule.active || trade.kind != TradeKind::Buy {
            return None;
        }

        let window = self.window_for(&trade.token_address);
        let mut window = window.lock().unwrap_or_else(PoisonError::into_inner);

        window.entries.push(WindowEntry {
            wallet: trade.wallet_address.clone(),
            timestamp: trade.timestamp,
            sol_amount: trade.sol_amount,
        });
        let cutoff = now - self.rule.window();
        window.entries.retain(|e| e.timestamp >= cutoff);

        let wallets: BTreeSet<String> = window.entries.iter().map(|e| e.wallet.clone()).collect();
        let total_sol: f64 = window.entries.iter().map(|e| e.sol_amount).sum();

        debug!(
            token = %trade.token_address,
            wallets = wallets.len(),
            total_sol,
            "correlation window updated"
        );

        if wallets.len() < self.rule.min_whales || total_sol < self.rule.min_total_sol {
            return None;
        }
        if window.open.iter().any(|s| s.wallets.is_superset(&wallets)) {
            debug!(token = %trade.token_address, "open signal already covers these wallets");
            return None;
        }

        window.open.push(OpenSignal {
            id: None,
            wallets: wallets.clone(),
        });

        let reason = format!(
            "{} whales bought within {} ({total_sol:.2} SOL total)",
            wallets.len(),
            window_label(self.rule.time_window_hours)
        );
        info!(token = %trade.token_address, whales = wallets.len(), total_sol, "signal fired");
        metrics::counter!("watcher_signals_emitted_total").increment(1);

        Some(TradeSignal {
            id: None,
            token_address: trade.token_address.clone(),
            triggering_wallets: wallets,
            total_sol_amount: total_sol,
            reason,
            created_at: now,
            status: SignalStatus::Open,
        })
    }

    /// Attach the store id to the open entry created for `signal`.
    pub fn bind_signal_id(&self, signal: &TradeSignal, id: i64) {
        let window = self.window_for(&signal.token_address);
        let mut window = window.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(open) = window
            .open
            .iter_mut()
            .find(|s| s.id.is_none() && s.wallets == signal.triggering_wallets)
        {
            open.id = Some(id);
        }
    }

    /// Forget open signals that are no longer OPEN in the store. Entries not
    /// yet bound to a store id are kept. Returns how many were released.
    ///
    /// Idle windows are dropped only when no evaluation holds them; the map's
    /// reference is then the only one.
    pub fn retain_open(&self, open_ids: &HashSet<i64>) -> usize {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let mut released = 0;
        windows.retain(|_, shared| {
            let mut window = shared.lock().unwrap_or_else(PoisonError::into_inner);
            let before = window.open.len();
            window
                .open
                .retain(|s| s.id.is_none_or(|id| open_ids.contains(&id)));
            released += before - window.open.len();
            !window.is_idle() || Arc::strong_count(shared) > 1
        });
        if released > 0 {
            info!(released, "released signals no longer open");
        }
        released
    }

    pub fn open_signal_count(&self) -> usize {
        let windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows
            .values()
            .map(|w| w.lock().unwrap_or_else(PoisonError::into_inner).open.len())
            .sum()
    }
}

fn window_label(hours: f64) -> String {
    if hours.fract().abs() < f64::EPSILON {
        format!("{hours:.0}h")
    } else {
        format!("{:.0}m", hours * 60.0)
    }
}
