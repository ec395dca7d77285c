//! Load the configuration from a file or a `String` written in [Toml format](https://en.wikipedia.org/wiki/TOML)

use std::{fs::File, io, io::Read, path::Path};

use crate::config::Config;

/// `toml::de::Error`, but loading that configuration from a file might also
/// fail with a `std::io::Error`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// There was an error when trying to load configuration from a file.
    #[error("Error reading config file: {0}")]
    Io(#[from] io::Error),
    /// Indicates there was an error when trying to build a
    /// `kelp_config::config::Config` instance out of the Toml string given.
    #[error("Error parsing config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Load configuration from a file written in Toml format.
pub fn from_file<S: AsRef<Path>>(file: S) -> Result<Config, Error> {
    let f = file.as_ref();
    let mut contents = String::new();

    log::debug!("Loading config from `{}`", f.to_string_lossy());

    let mut file = File::open(f)?;
    file.read_to_string(&mut contents)?;

    Ok(from_str(&contents)?)
}

/// Load configuration from a string written in Toml format.
pub fn from_str(contents: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(contents)
}

#[cfg(test)]
mod tests {
    use std::{io::Write, time::Duration};

    use super::*;

    #[test]
    fn load_empty_config() {
        let config = from_str("").unwrap();

        assert_eq!(config, Config::default());
    }

    #[test]
    fn load_config_overriding_defaults() {
        let config = from_str(
            r#"
            network = "testnet"

            [connections]
            known_peers = ["192.168.1.12:8444"]
            allow_private_subnets = true
            storage_peers_period = 60
            peers_file_path = "db/peers.dat"
            "#,
        )
        .unwrap();

        assert_eq!(config.network, "testnet");
        assert_eq!(config.connections.known_peers.len(), 1);
        assert!(config.connections.allow_private_subnets);
        assert_eq!(config.connections.storage_peers_period, Duration::from_secs(60));
        assert_eq!(
            config.connections.peers_file_path.as_deref(),
            Some(Path::new("db/peers.dat"))
        );
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kelp.toml");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "network = \"testnet\"").unwrap();

        let config = from_file(&path).unwrap();

        assert_eq!(config.network, "testnet");
    }

    #[test]
    fn load_config_from_missing_file() {
        let result = from_file("does/not/exist/kelp.toml");

        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn load_config_with_bad_syntax() {
        let result = from_str("this is not toml");

        assert!(result.is_err());
    }
}
