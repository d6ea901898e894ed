//! Persistent agent settings.
//!
//! A small key/value tree holding the state that must survive process
//! death and reboot: the broker endpoint, the tracking-enabled flag the
//! boot hook reads, and the current operator registration. Endpoint
//! changes are additionally pushed on a watch channel so the supervisor
//! reacts without polling (a polling fallback re-reads the store in
//! case the notification misfires).

use super::StorageError;
use crate::mqtt::Endpoint;
use tokio::sync::watch;
use tracing::{debug, info};

const KEY_ENDPOINT: &str = "mqtt_endpoint";
const KEY_TRACKING_ENABLED: &str = "tracking_enabled";
const KEY_OPERATOR: &str = "operator";

pub struct SettingsStore {
    tree: sled::Tree,
    endpoint_tx: watch::Sender<Option<Endpoint>>,
}

impl SettingsStore {
    pub fn open(db: &sled::Db) -> Result<Self, StorageError> {
        let tree = db.open_tree("settings")?;

        let current = read_endpoint(&tree)?;
        let (endpoint_tx, _) = watch::channel(current);

        Ok(Self { tree, endpoint_tx })
    }

    // ------------------------------------------------------------------
    // Endpoint
    // ------------------------------------------------------------------

    pub fn endpoint(&self) -> Result<Option<Endpoint>, StorageError> {
        read_endpoint(&self.tree)
    }

    /// Persist a new endpoint and notify watchers. Writing the same
    /// endpoint again is a no-op and does not notify.
    pub fn set_endpoint(&self, endpoint: Endpoint) -> Result<(), StorageError> {
        if self.endpoint()?.as_ref() == Some(&endpoint) {
            return Ok(());
        }

        self.tree
            .insert(KEY_ENDPOINT, serde_json::to_vec(&endpoint)?)?;
        self.tree.flush()?;
        info!(endpoint = %endpoint, "Endpoint persisted");

        let _ = self.endpoint_tx.send(Some(endpoint));
        Ok(())
    }

    /// Seed the endpoint from static config on first boot only.
    pub fn seed_endpoint_if_missing(&self, endpoint: Endpoint) -> Result<(), StorageError> {
        if self.endpoint()?.is_none() {
            debug!(endpoint = %endpoint, "Seeding endpoint from config");
            self.set_endpoint(endpoint)?;
        }
        Ok(())
    }

    /// Subscribe to endpoint changes. The receiver's current value is
    /// the bootstrap state; only subsequent sends are changes.
    pub fn watch_endpoint(&self) -> watch::Receiver<Option<Endpoint>> {
        self.endpoint_tx.subscribe()
    }

    // ------------------------------------------------------------------
    // Tracking flag
    // ------------------------------------------------------------------

    /// Whether the pipeline should be resurrected at boot.
    pub fn tracking_enabled(&self) -> bool {
        matches!(self.tree.get(KEY_TRACKING_ENABLED), Ok(Some(v)) if v.as_ref() == b"1")
    }

    pub fn set_tracking_enabled(&self, enabled: bool) -> Result<(), StorageError> {
        self.tree
            .insert(KEY_TRACKING_ENABLED, if enabled { &b"1"[..] } else { &b"0"[..] })?;
        self.tree.flush()?;
        debug!(enabled, "Tracking flag persisted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Operator
    // ------------------------------------------------------------------

    /// The logged-in operator's registration, if any.
    pub fn operator(&self) -> Option<String> {
        self.tree
            .get(KEY_OPERATOR)
            .ok()
            .flatten()
            .map(|v| String::from_utf8_lossy(&v).to_string())
    }

    pub fn set_operator(&self, registration: Option<&str>) -> Result<(), StorageError> {
        match registration {
            Some(registration) => {
                self.tree.insert(KEY_OPERATOR, registration.as_bytes())?;
            }
            None => {
                self.tree.remove(KEY_OPERATOR)?;
            }
        }
        self.tree.flush()?;
        Ok(())
    }
}

fn read_endpoint(tree: &sled::Tree) -> Result<Option<Endpoint>, StorageError> {
    match tree.get(KEY_ENDPOINT)? {
        Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &std::path::Path) -> (sled::Db, SettingsStore) {
        let db = sled::open(dir.join("s.db")).unwrap();
        let store = SettingsStore::open(&db).unwrap();
        (db, store)
    }

    #[test]
    fn test_endpoint_roundtrip_and_seed() {
        let tmp = tempfile::tempdir().unwrap();
        let (_db, store) = open_store(tmp.path());

        assert!(store.endpoint().unwrap().is_none());

        store
            .seed_endpoint_if_missing(Endpoint::new("broker-a", 1883))
            .unwrap();
        assert_eq!(store.endpoint().unwrap().unwrap().host, "broker-a");

        // Seeding never overwrites an existing endpoint
        store
            .seed_endpoint_if_missing(Endpoint::new("broker-b", 1883))
            .unwrap();
        assert_eq!(store.endpoint().unwrap().unwrap().host, "broker-a");
    }

    #[test]
    fn test_watch_sees_changes_but_not_rewrites() {
        let tmp = tempfile::tempdir().unwrap();
        let (_db, store) = open_store(tmp.path());

        let mut rx = store.watch_endpoint();
        assert!(rx.borrow().is_none());

        store.set_endpoint(Endpoint::new("broker-a", 1883)).unwrap();
        assert!(rx.has_changed().unwrap());
        rx.mark_unchanged();

        // Same value again: no notification
        store.set_endpoint(Endpoint::new("broker-a", 1883)).unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_tracking_flag_persists_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();

        {
            let (db, store) = open_store(tmp.path());
            assert!(!store.tracking_enabled());
            store.set_tracking_enabled(true).unwrap();
            db.flush().unwrap();
        }

        {
            let (_db, store) = open_store(tmp.path());
            assert!(store.tracking_enabled());
        }
    }

    #[test]
    fn test_operator_set_and_clear() {
        let tmp = tempfile::tempdir().unwrap();
        let (_db, store) = open_store(tmp.path());

        assert!(store.operator().is_none());
        store.set_operator(Some("4471")).unwrap();
        assert_eq!(store.operator().as_deref(), Some("4471"));
        store.set_operator(None).unwrap();
        assert!(store.operator().is_none());
    }
}
