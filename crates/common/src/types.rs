use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Lamports per SOL.
pub const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

/// Wrapped SOL mint. Transfers of this mint are SOL legs, never a trade subject.
pub const WRAPPED_SOL_MINT: &str = "So11111111111111111111111111111111111111112";

/// A wallet explicitly tracked for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedWallet {
    pub address: String,
    pub alias: Option<String>,
    pub active: bool,
}

impl TrackedWallet {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            alias: None,
            active: true,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeKind {
    Buy,
    Sell,
    TransferIn,
    TransferOut,
    Other,
}

impl TradeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::TransferIn => "TRANSFER_IN",
            Self::TransferOut => "TRANSFER_OUT",
            Self::Other => "OTHER",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            "TRANSFER_IN" => Some(Self::TransferIn),
            "TRANSFER_OUT" => Some(Self::TransferOut),
            "OTHER" => Some(Self::Other),
            _ => None,
        }
    }
}

impl fmt::Display for TradeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One transaction leg attributed to one tracked wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedTrade {
    pub wallet_address: String,
    pub token_address: String,
    pub kind: TradeKind,
    pub sol_amount: f64,
    pub token_amount: f64,
    pub signature: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of an idempotent trade insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

impl InsertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalStatus {
    Open,
    Executed,
    Expired,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Executed => "EXECUTED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "OPEN" => Some(Self::Open),
            "EXECUTED" => Some(Self::Executed),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert raised when enough distinct whales bought one token inside the window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    /// Store row id, set once the signal has been recorded.
    pub id: Option<i64>,
    pub token_address: String,
    pub triggering_wallets: BTreeSet<String>,
    pub total_sol_amount: f64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub status: SignalStatus,
}

impl TradeSignal {
    pub fn whale_count(&self) -> usize {
        self.triggering_wallets.len()
    }
}

/// Correlation thresholds; read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRule {
    pub min_whales: usize,
    pub time_window_hours: f64,
    pub min_total_sol: f64,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl SignalRule {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.time_window_hours * 3_600_000.0) as i64)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub address: String,
    pub symbol: Option<String>,
    pub name: Option<String>,
}

impl TokenMetadata {
    pub fn unknown(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            symbol: None,
            name: None,
        }
    }

    /// Symbol if known, otherwise a shortened address.
    pub fn display_symbol(&self) -> String {
        self.symbol
            .clone()
            .unwrap_or_else(|| short_address(&self.address))
    }
}

/// Row change kind carried by datastore webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// `AbcD…wxyZ` form of a base58 address.
pub fn short_address(address: &str) -> String {
    let chars: Vec<char> = address.chars().collect();
    if chars.len() <= 10 {
        return address.to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}
