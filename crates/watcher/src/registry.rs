use anyhow::Result;
use common::db::AsyncDb;
use common::types::{ChangeType, TrackedWallet};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

/// Immutable view of the tracked wallets at one instant.
#[derive(Debug, Default)]
pub struct WalletSnapshot {
    wallets: HashMap<String, TrackedWallet>,
    active: BTreeSet<String>,
}

impl WalletSnapshot {
    fn from_map(wallets: HashMap<String, TrackedWallet>) -> Self {
        let active = wallets
            .values()
            .filter(|w| w.active)
            .map(|w| w.address.clone())
            .collect();
        Self { wallets, active }
    }

    pub fn active_addresses(&self) -> &BTreeSet<String> {
        &self.active
    }

    /// Tracked and active.
    pub fn is_tracked(&self, address: &str) -> bool {
        self.active.contains(address)
    }

    pub fn alias_for(&self, address: &str) -> Option<&str> {
        self.wallets.get(address).and_then(|w| w.alias.as_deref())
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }
}

/// Holds the tracked wallet set and publishes every new snapshot.
///
/// Readers always see a whole snapshot (`Arc` swap under the watch lock).
/// Subscribers are only woken when the *active* address set changes, so a
/// no-op reload or an alias edit does not cause a resubscribe.
///
/// Writers (reload and row changes) are serialized by `writes`; a reload holds
/// it from the store read until its snapshot is published.
pub struct WalletRegistry {
    tx: watch::Sender<Arc<WalletSnapshot>>,
    writes: Mutex<()>,
}

impl Default for WalletRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WalletRegistry {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(WalletSnapshot::default()));
        Self {
            tx,
            writes: Mutex::new(()),
        }
    }

    #[cfg(test)]
    pub fn from_wallets(wallets: Vec<TrackedWallet>) -> Self {
        let registry = Self::new();
        registry.replace(wallets);
        registry
    }

    pub fn snapshot(&self) -> Arc<WalletSnapshot> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<WalletSnapshot>> {
        self.tx.subscribe()
    }

    #[cfg(test)]
    pub fn is_tracked(&self, address: &str) -> bool {
        self.tx.borrow().is_tracked(address)
    }

    pub fn active_addresses(&self) -> BTreeSet<String> {
        self.tx.borrow().active_addresses().clone()
    }

    /// Replace the whole set. Returns whether the active address set changed.
    fn replace(&self, wallets: Vec<TrackedWallet>) -> bool {
        let map: HashMap<String, TrackedWallet> = wallets
            .into_iter()
            .map(|w| (w.address.clone(), w))
            .collect();
        self.update(|current| *current = map)
    }

    /// Full refresh from the store.
    pub async fn reload(&self, db: &AsyncDb) -> Result<Arc<WalletSnapshot>> {
        let _writer = self.writes.lock().await;
        let wallets = db.load_tracked_wallets().await?;
        let changed = self.replace(wallets);
        let snapshot = self.snapshot();
        if changed {
            info!(
                tracked = snapshot.len(),
                active = snapshot.active_addresses().len(),
                "wallet registry reloaded with changes"
            );
        } else {
            debug!(tracked = snapshot.len(), "wallet registry reload: no change");
        }
        Ok(snapshot)
    }

    /// Apply one row change from the datastore webhook.
    /// Returns whether the active address set changed.
    pub async fn apply_change(&self, change: ChangeType, wallet: TrackedWallet) -> bool {
        let _writer = self.writes.lock().await;
        let address = wallet.address.clone();
        let changed = self.update(|map| match change {
            ChangeType::Insert | ChangeType::Update => {
                map.insert(wallet.address.clone(), wallet);
            }
            ChangeType::Delete => {
                map.remove(&wallet.address);
            }
        });
        info!(
            wallet = %address,
            change = ?change,
            active_set_changed = changed,
            "applied wallet change"
        );
        changed
    }

    /// Edit the current map and publish the result, all under the watch lock.
    fn update(&self, edit: impl FnOnce(&mut HashMap<String, TrackedWallet>)) -> bool {
        self.tx.send_if_modified(|current| {
            let mut wallets = current.wallets.clone();
            edit(&mut wallets);
            let next = WalletSnapshot::from_map(wallets);
            let changed = current.active != next.active;
            *current = Arc::new(next);
            changed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> WalletRegistry {
        WalletRegistry::from_wallets(vec![
            TrackedWallet::new("A").with_alias("alpha"),
            TrackedWallet::new("B"),
            TrackedWallet::new("C").inactive(),
        ])
    }

    #[test]
    fn test_active_addresses_exclude_inactive() {
        let reg = registry();
        let active: Vec<String> = reg.active_addresses().into_iter().collect();
        assert_eq!(active, vec!["A".to_string(), "B".to_string()]);
        assert!(reg.is_tracked("A"));
        assert!(!reg.is_tracked("C"));
        assert_eq!(reg.snapshot().alias_for("A"), Some("alpha"));
    }

    #[tokio::test]
    async fn test_delete_stops_tracking_immediately() {
        let reg = registry();
        assert!(reg.apply_change(ChangeType::Delete, TrackedWallet::new("A")).await);
        assert!(!reg.is_tracked("A"));
    }

    #[tokio::test]
    async fn test_update_to_inactive_stops_tracking() {
        let reg = registry();
        assert!(
            reg.apply_change(ChangeType::Update, TrackedWallet::new("B").inactive())
                .await
        );
        assert!(!reg.is_tracked("B"));
        assert_eq!(reg.snapshot().len(), 3);
    }

    #[tokio::test]
    async fn test_subscribers_woken_only_on_active_set_change() {
        let reg = registry();
        let mut rx = reg.subscribe();
        rx.borrow_and_update();

        // Alias-only edit: no wake-up.
        assert!(
            !reg.apply_change(
                ChangeType::Update,
                TrackedWallet::new("A").with_alias("renamed")
            )
            .await
        );
        assert!(!rx.has_changed().unwrap());
        assert_eq!(reg.snapshot().alias_for("A"), Some("renamed"));

        assert!(reg.apply_change(ChangeType::Insert, TrackedWallet::new("D")).await);
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_tracked("D"));
    }

    #[tokio::test]
    async fn test_reload_replaces_set_from_store() {
        let db = AsyncDb::open_memory().await.unwrap();
        db.upsert_tracked_wallet(&TrackedWallet::new("X"))
            .await
            .unwrap();
        db.upsert_tracked_wallet(&TrackedWallet::new("Y").inactive())
            .await
            .unwrap();

        let reg = registry();
        let snapshot = reg.reload(&db).await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(reg.is_tracked("X"));
        assert!(!reg.is_tracked("A"));

        // Idempotent: a second reload with the same rows changes nothing.
        let mut rx = reg.subscribe();
        rx.borrow_and_update();
        reg.reload(&db).await.unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_changes_are_not_lost() {
        let reg = Arc::new(WalletRegistry::new());
        let tasks: Vec<_> = (0..8)
            .map(|t| {
                let reg = Arc::clone(&reg);
                tokio::spawn(async move {
                    for i in 0..200 {
                        reg.apply_change(ChangeType::Insert, TrackedWallet::new(format!("W{t}-{i}")))
                            .await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(reg.active_addresses().len(), 1600);

        let deletes: Vec<_> = (0..8)
            .map(|t| {
                let reg = Arc::clone(&reg);
                tokio::spawn(async move {
                    for i in 0..200 {
                        reg.apply_change(ChangeType::Delete, TrackedWallet::new(format!("W{t}-{i}")))
                            .await;
                    }
                })
            })
            .collect();
        for task in deletes {
            task.await.unwrap();
        }
        assert!(reg.snapshot().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_change_during_reload_survives() {
        let db = AsyncDb::open_memory().await.unwrap();
        let reg = Arc::new(WalletRegistry::new());

        // Each change is written to the store before it is applied, as the
        // webhook does; reloads racing with it must never resurrect the old set.
        let reloader = {
            let reg = Arc::clone(&reg);
            let db = db.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    reg.reload(&db).await.unwrap();
                }
            })
        };
        for i in 0..50 {
            let wallet = TrackedWallet::new(format!("R{i}"));
            db.upsert_tracked_wallet(&wallet).await.unwrap();
            reg.apply_change(ChangeType::Insert, wallet).await;
        }
        reloader.await.unwrap();
        assert_eq!(reg.active_addresses().len(), 50);
    }
}
