//! Resolve the location of the peers file out of the configuration.
//!
//! Older releases kept their peer store in a database and only recorded that
//! database's path. The resolver derives the peers file location from
//! whatever the configuration holds and records the result back into the
//! configuration, so subsequent runs resolve to the same file.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

use crate::config::Connections;

/// Relative location of the peers file when the configuration names neither a
/// peers file nor a legacy peer database.
pub const DEFAULT_PEERS_FILE_PATH: &str = "peers/peers.dat";

/// Network name that keeps the unqualified peers file name.
const MAIN_NETWORK: &str = "mainnet";

/// Derives the peers file path from the configured paths, the node root path
/// and the selected network.
#[derive(Debug, Clone)]
pub struct PeerStoreResolver {
    root_path: PathBuf,
    network: String,
}

impl PeerStoreResolver {
    /// Create a resolver for a node rooted at `root_path` on `network`.
    pub fn new<P: Into<PathBuf>, S: Into<String>>(root_path: P, network: S) -> Self {
        PeerStoreResolver {
            root_path: root_path.into(),
            network: network.into(),
        }
    }

    /// Resolve the peers file path, updating the configuration if necessary.
    /// The legacy peer db path is left in the configuration to support
    /// downgrading.
    ///
    /// If `connections.peers_file_path` is unset, the path is derived from
    /// the legacy peer db directory, or from [`DEFAULT_PEERS_FILE_PATH`], and
    /// written back into `connections.peers_file_path`.
    pub fn resolve(&self, connections: &mut Connections) -> PathBuf {
        let relative = match &connections.peers_file_path {
            Some(path) => path.clone(),
            None => {
                let dir = match &connections.legacy_peer_db_path {
                    // Use the legacy path's directory with the new peers file name
                    Some(legacy_path) => parent_dir(legacy_path),
                    // Neither value is present in the config, use the default
                    None => parent_dir(Path::new(DEFAULT_PEERS_FILE_PATH)),
                };
                let relative = dir.join(self.peers_file_name());

                log::info!("Resolved peers file location: {}", relative.display());
                connections.peers_file_path = Some(relative.clone());
                relative
            }
        };

        self.root_path.join(relative)
    }

    /// The peers file name, qualified with the network name outside of
    /// `mainnet`, e.g. `peers_testnet.dat`.
    fn peers_file_name(&self) -> PathBuf {
        let default = Path::new(DEFAULT_PEERS_FILE_PATH);
        let name = default.file_name().unwrap_or_else(|| OsStr::new("peers.dat"));

        if self.network == MAIN_NETWORK {
            PathBuf::from(name)
        } else {
            let stem = default.file_stem().unwrap_or_else(|| OsStr::new("peers"));
            let extension = default.extension().map(|ext| ext.to_string_lossy());
            match extension {
                Some(ext) => PathBuf::from(format!(
                    "{}_{}.{}",
                    stem.to_string_lossy(),
                    self.network,
                    ext
                )),
                None => PathBuf::from(format!("{}_{}", stem.to_string_lossy(), self.network)),
            }
        }
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent().unwrap_or_else(|| Path::new("")).to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connections() -> Connections {
        Connections::default()
    }

    #[test]
    fn resolve_from_legacy_peer_db_path() {
        let mut connections = connections();
        connections.legacy_peer_db_path = Some(PathBuf::from("db/peer_table_node.sqlite"));
        let resolver = PeerStoreResolver::new("/root_path", "mainnet");

        let resolved = resolver.resolve(&mut connections);

        // The peers file shares the legacy db's directory
        assert_eq!(resolved, Path::new("/root_path/db/peers.dat"));
        // The config is updated with the new value
        assert_eq!(
            connections.peers_file_path.as_deref(),
            Some(Path::new("db/peers.dat"))
        );
        // The config retains the legacy peer db path value
        assert_eq!(
            connections.legacy_peer_db_path.as_deref(),
            Some(Path::new("db/peer_table_node.sqlite"))
        );
    }

    #[test]
    fn resolve_from_modified_legacy_peer_db_path() {
        let mut connections = connections();
        connections.legacy_peer_db_path =
            Some(PathBuf::from("some/modified/db/path/peer_table_node.sqlite"));
        let resolver = PeerStoreResolver::new("/root_path", "mainnet");

        let resolved = resolver.resolve(&mut connections);

        assert_eq!(resolved, Path::new("/root_path/some/modified/db/path/peers.dat"));
        assert_eq!(
            connections.peers_file_path.as_deref(),
            Some(Path::new("some/modified/db/path/peers.dat"))
        );
    }

    #[test]
    fn resolve_from_configured_peers_file_path() {
        let mut connections = connections();
        connections.peers_file_path = Some(PathBuf::from("db/peers.dat"));
        let resolver = PeerStoreResolver::new("/root_path", "mainnet");

        let resolved = resolver.resolve(&mut connections);

        assert_eq!(resolved, Path::new("/root_path/db/peers.dat"));
        assert_eq!(
            connections.peers_file_path.as_deref(),
            Some(Path::new("db/peers.dat"))
        );
        // No legacy peer db path gets invented
        assert_eq!(connections.legacy_peer_db_path, None);
    }

    #[test]
    fn configured_peers_file_path_wins_over_legacy() {
        let mut connections = connections();
        connections.peers_file_path = Some(PathBuf::from("db/peers.dat"));
        connections.legacy_peer_db_path = Some(PathBuf::from("db/peer_table_node.sqlite"));
        let resolver = PeerStoreResolver::new("/root_path", "mainnet");

        let resolved = resolver.resolve(&mut connections);

        assert_eq!(resolved, Path::new("/root_path/db/peers.dat"));
    }

    #[test]
    fn resolve_from_defaults() {
        let mut connections = connections();
        let resolver = PeerStoreResolver::new("/root_path", "mainnet");

        let resolved = resolver.resolve(&mut connections);

        assert_eq!(resolved, Path::new("/root_path/peers/peers.dat"));
        assert_eq!(
            connections.peers_file_path.as_deref(),
            Some(Path::new("peers/peers.dat"))
        );
    }

    #[test]
    fn resolve_qualifies_name_outside_mainnet() {
        let mut connections = connections();
        let resolver = PeerStoreResolver::new("/root_path", "testnet");

        let resolved = resolver.resolve(&mut connections);

        assert_eq!(resolved, Path::new("/root_path/peers/peers_testnet.dat"));
        assert_eq!(
            connections.peers_file_path.as_deref(),
            Some(Path::new("peers/peers_testnet.dat"))
        );
    }

    #[test]
    fn resolution_is_stable_across_runs() {
        let mut connections = connections();
        let resolver = PeerStoreResolver::new("/root_path", "testnet");

        let first = resolver.resolve(&mut connections);
        let second = resolver.resolve(&mut connections);

        assert_eq!(first, second);
    }
}
