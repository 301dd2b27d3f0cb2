//! Compiled build metadata.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// An identified, immutable compiled artifact produced by the external
/// compile pipeline. Owned by the build registry once installed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Build {
    /// Stable identifier; derived from the build manifest when the
    /// compiler does not supply one.
    pub id: String,
    /// Directory the build was deployed into.
    pub directory: PathBuf,
    /// Entrypoint artifact the server executable is pointed at.
    pub entrypoint: PathBuf,
    /// When the registry took ownership of the build.
    pub installed_at: DateTime<Utc>,
}

impl Build {
    /// Construct a build record for a deployed directory.
    #[must_use]
    pub fn new(id: String, directory: PathBuf, entrypoint: PathBuf) -> Self {
        Self {
            id,
            directory,
            entrypoint,
            installed_at: Utc::now(),
        }
    }

    /// Derive a build identifier from manifest bytes.
    ///
    /// Used when the compile pipeline drops a build without naming it; the
    /// identifier is the hex sha256 of the manifest, truncated to 16 chars.
    #[must_use]
    pub fn derive_id(manifest: &[u8]) -> String {
        let digest = Sha256::digest(manifest);
        let mut id = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            // Writing to a String cannot fail.
            let _ = write!(id, "{byte:02x}");
        }
        id
    }

    /// Absolute path of the entrypoint artifact.
    #[must_use]
    pub fn entrypoint_path(&self) -> PathBuf {
        if self.entrypoint.is_absolute() {
            self.entrypoint.clone()
        } else {
            self.directory.join(&self.entrypoint)
        }
    }

    /// Whether the deployed directory still exists on disk.
    #[must_use]
    pub fn exists(&self) -> bool {
        Path::new(&self.directory).is_dir()
    }
}
