//! Peers manager: the node-facing face of the address manager.
//!
//! The address manager itself is a plain single-threaded structure; this
//! module owns one behind an async mutex and exposes its operations as
//! async methods, so every task of the node shares one serialized view.
//! Critical sections never await, which keeps the state consistent even if
//! a caller is cancelled while queued for the lock. File I/O happens outside
//! the lock, on a snapshot.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::sync::Mutex;

use kelp_config::{config::Config, resolver::PeerStoreResolver};
use kelp_p2p::peers::{
    store, AddressManager, PeerRecord, PeersFileError, TimestampedAddress,
};
use kelp_util::{files::write_file_atomic, timestamp::get_timestamp};

/// Serialized access to the address manager, plus its persistence loop.
pub struct PeersManager {
    manager: Mutex<AddressManager>,
    peers_file_path: PathBuf,
}

impl PeersManager {
    /// Wrap an already built address manager.
    pub fn new(manager: AddressManager, peers_file_path: PathBuf) -> Self {
        PeersManager {
            manager: Mutex::new(manager),
            peers_file_path,
        }
    }

    /// Load the address manager from the peers file (or any legacy store
    /// found in its place), starting empty when nothing can be read.
    pub fn open(
        peers_file_path: PathBuf,
        legacy_db_path: Option<PathBuf>,
        allow_private_subnets: bool,
    ) -> Self {
        let mut manager = store::load_or_create(&peers_file_path, legacy_db_path.as_deref());
        manager.set_allow_private_subnets(allow_private_subnets);

        Self::new(manager, peers_file_path)
    }

    /// Resolve the peers file location out of the configuration (recording
    /// it back into the configuration) and load from there.
    pub fn from_config(config: &mut Config) -> Self {
        let resolver = PeerStoreResolver::new(config.storage.db_path.clone(), config.network.clone());
        let peers_file_path = resolver.resolve(&mut config.connections);
        let legacy_db_path = config
            .connections
            .legacy_peer_db_path
            .as_ref()
            .map(|path| config.storage.db_path.join(path));

        Self::open(
            peers_file_path,
            legacy_db_path,
            config.connections.allow_private_subnets,
        )
    }

    /// Where the peers file lives.
    pub fn peers_file_path(&self) -> &Path {
        &self.peers_file_path
    }

    /// Number of known addresses, over both tables.
    pub async fn size(&self) -> usize {
        self.manager.lock().await.size()
    }

    /// Feed a batch of gossiped addresses into the new table. Returns true
    /// if at least one address was not known before.
    pub async fn add_to_new_table(
        &self,
        addresses: Vec<TimestampedAddress>,
        source: Option<SocketAddr>,
        penalty: i64,
    ) -> bool {
        let now = get_timestamp();

        self.manager
            .lock()
            .await
            .add_to_new_table(&addresses, source, penalty, now)
    }

    /// Mark an address as reachable, promoting it towards the tried table.
    pub async fn mark_good(
        &self,
        address: SocketAddr,
        test_before_evict: bool,
        timestamp: Option<i64>,
    ) {
        let now = timestamp.unwrap_or_else(get_timestamp);

        self.manager
            .lock()
            .await
            .mark_good(&address, test_before_evict, now);
    }

    /// Record a connection attempt to an address.
    pub async fn attempt(&self, address: SocketAddr, count_failures: bool, timestamp: Option<i64>) {
        let now = timestamp.unwrap_or_else(get_timestamp);

        self.manager
            .lock()
            .await
            .attempt(&address, count_failures, now);
    }

    /// Work through the pending tried table collisions.
    pub async fn resolve_tried_collisions(&self) {
        let now = get_timestamp();

        self.manager.lock().await.resolve_tried_collisions(now);
    }

    /// An incumbent tried entry that a pending promotion wants to evict, so
    /// the discovery loop can test whether it is still alive.
    pub async fn select_tried_collision(&self) -> Option<PeerRecord> {
        self.manager.lock().await.select_tried_collision()
    }

    /// Choose an address to connect to.
    pub async fn select_peer(&self, new_only: bool) -> Option<PeerRecord> {
        let now = get_timestamp();

        self.manager.lock().await.select_peer(new_only, now)
    }

    /// A random sample of known good addresses, for relaying to other nodes.
    pub async fn get_peers(&self) -> Vec<TimestampedAddress> {
        let now = get_timestamp();

        self.manager.lock().await.get_peers(now)
    }

    /// Note that we are talking to an address.
    pub async fn connect(&self, address: SocketAddr, timestamp: Option<i64>) {
        let now = timestamp.unwrap_or_else(get_timestamp);

        self.manager.lock().await.connect(&address, now);
    }

    /// Drop new table references to addresses that went stale and kept
    /// failing.
    pub async fn cleanup(&self, max_timestamp_difference: i64, max_consecutive_failures: u32) {
        let now = get_timestamp();

        self.manager
            .lock()
            .await
            .cleanup(max_timestamp_difference, max_consecutive_failures, now);
    }

    /// Write the current state to the peers file. The state is snapshotted
    /// under the lock and written to disk after releasing it.
    pub async fn persist(&self) -> Result<(), PeersFileError> {
        let data = {
            let manager = self.manager.lock().await;
            store::serialize(&manager)
        };
        write_file_atomic(&self.peers_file_path, &data)?;

        log::debug!("Persisted peers to {}", self.peers_file_path.display());

        Ok(())
    }

    /// Keep writing the state to the peers file every `period`, forever.
    /// Meant to be spawned as a background task; persistence failures are
    /// logged and retried at the next tick.
    pub async fn run_periodic_persist(&self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        // the first tick fires immediately, skip it
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = self.persist().await {
                log::error!("Failed to persist peers to storage: {e}");
            }
        }
    }
}
