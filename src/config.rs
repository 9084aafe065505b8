//! On-disk JSON configuration for both sides.
//!
//! Missing keys are filled from defaults; a missing file means all defaults.
//!
//! Default location: `$XDG_CONFIG_HOME/lanthrow/{send,recv}.json`
//! (or the platform equivalent), overridable with `--config`.

use crate::error::{Error, Result};
use crate::util::parse_size;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Sender settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendConfig {
    /// Also write logs to a file under the data directory.
    pub save_logs: bool,
    /// Number of parallel data connections.
    pub thread_count: usize,
    /// Block size for split files, e.g. "16MB".
    pub split_limit: String,
    /// Locale table. None = built-in English.
    pub lang_file: Option<PathBuf>,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            save_logs: false,
            thread_count: 20,
            split_limit: "16MB".to_string(),
            lang_file: None,
        }
    }
}

impl SendConfig {
    pub fn split_limit_bytes(&self) -> Result<u64> {
        let limit = parse_size(&self.split_limit)?;
        if limit == 0 {
            return Err(Error::Config("split_limit must be greater than zero".into()));
        }
        Ok(limit)
    }
}

/// Receiver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecvConfig {
    pub save_logs: bool,
    pub lang_file: Option<PathBuf>,
    /// Directory holding `{sid}_{index}.block` files during a transfer.
    pub block_cache: PathBuf,
}

impl Default for RecvConfig {
    fn default() -> Self {
        Self {
            save_logs: false,
            lang_file: None,
            block_cache: data_dir().join("cache"),
        }
    }
}

/// Load/save for any serde config with defaults.
pub trait JsonConfig: Serialize + DeserializeOwned + Default {
    /// Read `path`, falling back to defaults when it does not exist.
    fn load_or_default(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        fs::write(path, text)?;
        Ok(())
    }
}

impl JsonConfig for SendConfig {}
impl JsonConfig for RecvConfig {}

/// `$XDG_CONFIG_HOME/lanthrow` or `./lanthrow` when unknown.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lanthrow")
}

/// `$XDG_DATA_HOME/lanthrow` or `./lanthrow` when unknown.
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lanthrow")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let cfg = SendConfig::load_or_default(&tmp.path().join("nope.json")).unwrap();
        assert_eq!(cfg, SendConfig::default());
        assert_eq!(cfg.thread_count, 20);
        assert_eq!(cfg.split_limit_bytes().unwrap(), 16 * 1024 * 1024);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("send.json");
        fs::write(&path, r#"{"thread_count": 4}"#).unwrap();

        let cfg = SendConfig::load_or_default(&path).unwrap();
        assert_eq!(cfg.thread_count, 4);
        assert_eq!(cfg.split_limit, "16MB");
        assert!(!cfg.save_logs);
    }

    #[test]
    fn test_save_then_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("recv.json");
        let cfg = RecvConfig {
            save_logs: true,
            lang_file: Some(PathBuf::from("zh_CN.json")),
            block_cache: tmp.path().join("cache"),
        };
        cfg.save(&path).unwrap();
        assert_eq!(RecvConfig::load_or_default(&path).unwrap(), cfg);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("send.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            SendConfig::load_or_default(&path),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_zero_split_limit_rejected() {
        let cfg = SendConfig {
            split_limit: "0MB".into(),
            ..Default::default()
        };
        assert!(cfg.split_limit_bytes().is_err());
    }
}
