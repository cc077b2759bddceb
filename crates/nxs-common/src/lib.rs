//! On-disk layout of the NXS client and small JSON file helpers.
//!
//! ```text
//! nxs_data/
//! ├── local/           # session.json, settings.json
//! ├── logs/            # rolling client logs
//! └── cache/           # downloaded attachments
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable overriding the data root.
pub const ROOT_ENV: &str = "NXS_ROOT";

#[derive(Serialize, Deserialize, Debug, Default)]
struct RootConfig {
    nxs_root: Option<PathBuf>,
}

/// `<config_dir>/nxs/config.json`, remembering a chosen data root.
pub fn root_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("nxs").join("config.json"))
}

/// Root saved by [`save_persistent_root`], if any.
pub fn load_persistent_root() -> Option<PathBuf> {
    let path = root_config_path()?;
    read_json::<RootConfig>(&path)
        .unwrap_or_else(|e| {
            warn!("[Layout] ignoring {:?}: {}", path, e);
            None
        })
        .and_then(|c| c.nxs_root)
}

pub fn save_persistent_root(root: &Path) -> anyhow::Result<PathBuf> {
    let path = root_config_path().ok_or_else(|| anyhow::anyhow!("no config directory"))?;
    let config = RootConfig {
        nxs_root: Some(root.to_path_buf()),
    };
    write_json(&path, &config)?;
    Ok(path)
}

/// Data root: `NXS_ROOT`, then the saved root, then `<data_local_dir>/nxs`.
pub fn nxs_root() -> PathBuf {
    match std::env::var_os(ROOT_ENV) {
        Some(val) if !val.is_empty() => PathBuf::from(val),
        _ => load_persistent_root().unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|d| d.join("nxs"))
                .unwrap_or_else(|| PathBuf::from("nxs_data"))
        }),
    }
}

/// Paths of every file and directory the client writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Layout rooted at [`nxs_root`].
    pub fn from_env() -> Self {
        Self::new(nxs_root())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn local_dir(&self) -> PathBuf {
        self.root.join("local")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Persisted auth session
    pub fn session_file(&self) -> PathBuf {
        self.local_dir().join("session.json")
    }

    /// Persisted system settings
    pub fn settings_file(&self) -> PathBuf {
        self.local_dir().join("settings.json")
    }

    /// Create every directory; returns the canonical root.
    pub fn init(&self) -> anyhow::Result<PathBuf> {
        ensure_dir(&self.root)?;
        ensure_dir(&self.local_dir())?;
        ensure_dir(&self.logs_dir())?;
        ensure_dir(&self.cache_dir())?;

        let canonical = fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());
        debug!("[Layout] ready at {:?}", canonical);
        Ok(canonical)
    }
}

pub fn ensure_dir(path: &Path) -> anyhow::Result<()> {
    if !path.is_dir() {
        fs::create_dir_all(path)
            .map_err(|e| anyhow::anyhow!("cannot create {:?}: {}", path, e))?;
    }
    Ok(())
}

/// Read a JSON file, returning `None` when it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value = serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse {:?}: {}", path, e))?;
    Ok(Some(value))
}

/// Write a JSON file atomically (temp file + rename).
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let temp_path = path.with_extension("tmp");
    let json = serde_json::to_string_pretty(value)?;
    fs::write(&temp_path, json)?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Remove a file if present.
pub fn remove_file(path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_layout_paths() {
        let layout = DataLayout::new("/tmp/nxs-test");
        assert!(layout.session_file().ends_with("local/session.json"));
        assert!(layout.settings_file().ends_with("local/settings.json"));
        assert!(layout.logs_dir().ends_with("logs"));
    }

    #[test]
    fn test_init_creates_dirs() {
        let dir = TempDir::new().unwrap();
        let layout = DataLayout::new(dir.path().join("root"));
        layout.init().unwrap();
        assert!(layout.local_dir().is_dir());
        assert!(layout.logs_dir().is_dir());
        assert!(layout.cache_dir().is_dir());
    }

    #[test]
    fn test_json_roundtrip_and_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("sample.json");

        let missing: Option<Sample> = read_json(&path).unwrap();
        assert!(missing.is_none());

        let sample = Sample {
            name: "alpha".into(),
            count: 3,
        };
        write_json(&path, &sample).unwrap();
        assert!(!path.with_extension("tmp").exists());

        let loaded: Option<Sample> = read_json(&path).unwrap();
        assert_eq!(loaded, Some(sample));

        remove_file(&path).unwrap();
        remove_file(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_malformed_json_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ malformed json ...").unwrap();
        assert!(read_json::<Sample>(&path).is_err());
    }
}
