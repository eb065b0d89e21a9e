//! Per-channel rendering of a signal alert.

use crate::registry::WalletSnapshot;
use common::types::{short_address, TokenMetadata, TradeSignal};

/// Everything a channel needs to render one signal.
#[derive(Debug, Clone)]
pub struct Alert {
    pub token_address: String,
    pub symbol: String,
    pub name: Option<String>,
    pub whales: Vec<String>,
    pub total_sol: f64,
    pub reason: String,
}

impl Alert {
    pub fn new(signal: &TradeSignal, metadata: &TokenMetadata, wallets: &WalletSnapshot) -> Self {
        let whales = signal
            .triggering_wallets
            .iter()
            .map(|address| {
                wallets
                    .alias_for(address)
                    .map_or_else(|| short_address(address), str::to_string)
            })
            .collect();

        Self {
            token_address: signal.token_address.clone(),
            symbol: metadata.display_symbol(),
            name: metadata.name.clone(),
            whales,
            total_sol: signal.total_sol_amount,
            reason: signal.reason.clone(),
        }
    }

    pub fn solscan_url(&self) -> String {
        format!("https://solscan.io/token/{}", self.token_address)
    }

    pub fn dexscreener_url(&self) -> String {
        format!("https://dexscreener.com/solana/{}", self.token_address)
    }

    pub fn birdeye_url(&self) -> String {
        format!("https://birdeye.so/token/{}?chain=solana", self.token_address)
    }

    fn title(&self) -> String {
        match &self.name {
            Some(name) => format!("{} ({name})", self.symbol),
            None => self.symbol.clone(),
        }
    }

    /// Telegram `parse_mode=HTML`.
    pub fn to_html(&self) -> String {
        format!(
            "🐋 <b>Whale signal: {title}</b>\n\
             {count} whales: {whales}\n\
             Total: {sol:.2} SOL\n\
             {reason}\n\
             <code>{addr}</code>\n\
             <a href=\"{solscan}\">Solscan</a> | <a href=\"{dex}\">DexScreener</a> | <a href=\"{birdeye}\">Birdeye</a>",
            title = escape_html(&self.title()),
            count = self.whales.len(),
            whales = escape_html(&self.whales.join(", ")),
            sol = self.total_sol,
            reason = escape_html(&self.reason),
            addr = self.token_address,
            solscan = self.solscan_url(),
            dex = self.dexscreener_url(),
            birdeye = self.birdeye_url(),
        )
    }

    /// Discord webhook `content` (markdown).
    pub fn to_markdown(&self) -> String {
        format!(
            "🐋 **Whale signal: {title}**\n\
             {count} whales: {whales}\n\
             Total: {sol:.2} SOL\n\
             {reason}\n\
             `{addr}`\n\
             [Solscan](<{solscan}>) | [DexScreener](<{dex}>) | [Birdeye](<{birdeye}>)",
            title = escape_markdown(&self.title()),
            count = self.whales.len(),
            whales = escape_markdown(&self.whales.join(", ")),
            sol = self.total_sol,
            reason = escape_markdown(&self.reason),
            addr = self.token_address,
            solscan = self.solscan_url(),
            dex = self.dexscreener_url(),
            birdeye = self.birdeye_url(),
        )
    }

    pub fn to_plain(&self) -> String {
        format!(
            "WHALE SIGNAL {title}: {count} whales ({whales}), {sol:.2} SOL. {reason}. {addr} {dex}",
            title = self.title(),
            count = self.whales.len(),
            whales = self.whales.join(", "),
            sol = self.total_sol,
            reason = self.reason,
            addr = self.token_address,
            dex = self.dexscreener_url(),
        )
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '_' | '~' | '`' | '|' | '>' | '[' | ']') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::WalletRegistry;
    use chrono::Utc;
    use common::types::{SignalStatus, TrackedWallet};
    use std::collections::BTreeSet;

    const TOKEN: &str = "DezXAZ8z7PnrnRJjz3wXBoRgixCa6xjnB7YaB1pPB263";

    fn alert() -> Alert {
        let registry = WalletRegistry::from_wallets(vec![
            TrackedWallet::new("7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU").with_alias("big_fish"),
            TrackedWallet::new("9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM"),
        ]);
        let signal = TradeSignal {
            id: Some(1),
            token_address: TOKEN.to_string(),
            triggering_wallets: BTreeSet::from([
                "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU".to_string(),
                "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM".to_string(),
            ]),
            total_sol_amount: 12.5,
            reason: "2 whales bought within 1h (12.50 SOL total)".to_string(),
            created_at: Utc::now(),
            status: SignalStatus::Open,
        };
        let meta = TokenMetadata {
            address: TOKEN.to_string(),
            symbol: Some("BONK".to_string()),
            name: Some("Bonk <Inu>".to_string()),
        };
        Alert::new(&signal, &meta, &registry.snapshot())
    }

    #[test]
    fn test_display_names_prefer_alias() {
        let a = alert();
        assert_eq!(a.whales, vec!["big_fish".to_string(), "9WzD…AWWM".to_string()]);
    }

    #[test]
    fn test_html_escapes_and_links() {
        let html = alert().to_html();
        assert!(html.contains("<b>Whale signal: BONK (Bonk &lt;Inu&gt;)</b>"));
        assert!(html.contains(&format!("https://solscan.io/token/{TOKEN}")));
        assert!(html.contains(&format!("https://dexscreener.com/solana/{TOKEN}")));
        assert!(html.contains("birdeye.so/token/"));
        assert!(html.contains("12.50 SOL"));
    }

    #[test]
    fn test_markdown_escapes_alias_underscores() {
        let md = alert().to_markdown();
        assert!(md.contains("big\\_fish"));
        assert!(md.contains("**Whale signal: BONK"));
    }

    #[test]
    fn test_unknown_symbol_uses_short_address() {
        let registry = WalletRegistry::new();
        let signal = TradeSignal {
            id: None,
            token_address: TOKEN.to_string(),
            triggering_wallets: BTreeSet::new(),
            total_sol_amount: 0.0,
            reason: String::new(),
            created_at: Utc::now(),
            status: SignalStatus::Open,
        };
        let a = Alert::new(&signal, &TokenMetadata::unknown(TOKEN), &registry.snapshot());
        assert_eq!(a.symbol, "DezX…B263");
        assert!(a.to_plain().starts_with("WHALE SIGNAL DezX…B263"));
    }
}
