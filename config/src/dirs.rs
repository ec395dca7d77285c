//! Platform-specific application paths.

use std::env;
use std::path::PathBuf;

/// Returns a platform-specific path for storing application data.
///
/// In GNU/Linux:
///     $XDG_DATA_HOME/kelp
///
/// In MacOS:
///     $HOME/Library/Application Support/kelp
///
/// In Windows:
///     C:\Users\Alice\AppData\Local\kelp
///
/// Defaults to current directory.
pub fn data_dir() -> PathBuf {
    directories_next::ProjectDirs::from("", "kelp", "kelp")
        .map(|dir| dir.data_local_dir().into())
        .unwrap_or_else(|| env::current_dir().expect("Unable to resolve the current directory"))
}
