//! The `Config` struct holds all the configuration params for a Kelp node.
//! Every field carries a default so a configuration file only needs to name
//! the values it wants to override.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::dirs;

/// The entire configuration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    /// The network this node runs on, e.g. `mainnet` or `testnet`. Selects
    /// the per-network variant of the peers file name.
    #[serde(default = "Config::default_network")]
    pub network: String,

    /// Connections-specific configuration
    #[serde(default)]
    pub connections: Connections,

    /// Storage-specific configuration
    #[serde(default)]
    pub storage: Storage,
}

/// Connections-specific configuration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Connections {
    /// Peer addresses to feed into the address manager on startup
    #[serde(default = "Connections::default_known_peers")]
    pub known_peers: Vec<SocketAddr>,

    /// Accept peers in private, loopback and link-local ranges. Off outside
    /// of test networks.
    #[serde(default = "Connections::default_allow_private_subnets")]
    pub allow_private_subnets: bool,

    /// Period between writes of the address manager state to the peers file
    #[serde(
        default = "Connections::default_storage_peers_period",
        deserialize_with = "duration_from_secs",
        serialize_with = "duration_to_secs"
    )]
    pub storage_peers_period: Duration,

    /// Location of the peers file, relative to the node root path. Filled in
    /// by the peer store resolver on first run.
    #[serde(default)]
    pub peers_file_path: Option<PathBuf>,

    /// Location of the peer database used by older releases, relative to the
    /// node root path. Kept so a downgrade still finds its database.
    #[serde(default)]
    pub legacy_peer_db_path: Option<PathBuf>,
}

/// Storage-specific configuration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Storage {
    /// Root directory holding everything this node persists
    #[serde(default = "Storage::default_db_path")]
    pub db_path: PathBuf,
}

impl Config {
    fn default_network() -> String {
        "mainnet".to_string()
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            network: Self::default_network(),
            connections: Connections::default(),
            storage: Storage::default(),
        }
    }
}

impl Connections {
    fn default_known_peers() -> Vec<SocketAddr> {
        Vec::default()
    }

    fn default_allow_private_subnets() -> bool {
        false
    }

    fn default_storage_peers_period() -> Duration {
        Duration::from_secs(1000)
    }
}

impl Default for Connections {
    fn default() -> Connections {
        Connections {
            known_peers: Self::default_known_peers(),
            allow_private_subnets: Self::default_allow_private_subnets(),
            storage_peers_period: Self::default_storage_peers_period(),
            peers_file_path: None,
            legacy_peer_db_path: None,
        }
    }
}

impl Storage {
    fn default_db_path() -> PathBuf {
        dirs::data_dir()
    }
}

impl Default for Storage {
    fn default() -> Storage {
        Storage {
            db_path: Self::default_db_path(),
        }
    }
}

fn duration_from_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}

fn duration_to_secs<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_secs())
}
