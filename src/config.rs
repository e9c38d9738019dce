// ⚙️ Configuration - JSON file + environment overrides
//
// Every field has a default, so an empty (or missing) file is a valid config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cache::DEFAULT_PURCHASED_ITEMS_KEY;

pub const CONFIG_PATH_ENV: &str = "ENTITLEMENTS_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Shared container (SQLite file) opened by the app and its widgets
    pub database_path: PathBuf,

    /// Premium catalog (.csv or .json); built-in defaults when unset
    pub catalog_path: Option<PathBuf>,

    /// Key of the purchased-items array inside the container
    pub purchased_items_key: String,

    /// Listen address for the API server
    pub server_addr: String,

    /// Key the sandbox store signs transactions with
    pub sandbox_signing_key: String,

    /// tracing-subscriber filter directive
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("entitlements.db"),
            catalog_path: None,
            purchased_items_key: DEFAULT_PURCHASED_ITEMS_KEY.to_string(),
            server_addr: "0.0.0.0:3000".to_string(),
            sandbox_signing_key: "sandbox-signing-key".to_string(),
            log_filter: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        serde_json::from_str(&content).context("Failed to parse config JSON")
    }

    /// `$ENTITLEMENTS_CONFIG` (if set) with environment overrides applied
    pub fn load() -> Result<Self> {
        let mut config = match env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(PathBuf::from(path))?,
            None => Self::default(),
        };
        config.apply_overrides(|name| env::var(name).ok());
        Ok(config)
    }

    /// Override fields from a variable lookup (the process environment in `load`)
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("ENTITLEMENTS_DB") {
            self.database_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("ENTITLEMENTS_CATALOG") {
            self.catalog_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("ENTITLEMENTS_KEY") {
            self.purchased_items_key = value;
        }
        if let Some(value) = lookup("ENTITLEMENTS_ADDR") {
            self.server_addr = value;
        }
        if let Some(value) = lookup("ENTITLEMENTS_SIGNING_KEY") {
            self.sandbox_signing_key = value;
        }
        if let Some(value) = lookup("ENTITLEMENTS_LOG") {
            self.log_filter = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_file_is_all_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{}").unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.purchased_items_key, DEFAULT_PURCHASED_ITEMS_KEY);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"database_path": "/tmp/shared.db", "catalog_path": "catalog.csv"}"#,
        )
        .unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/shared.db"));
        assert_eq!(config.catalog_path, Some(PathBuf::from("catalog.csv")));
        assert_eq!(config.server_addr, "0.0.0.0:3000");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(AppConfig::from_file("/nonexistent/config.json").is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ENTITLEMENTS_DB", "/data/group/entitlements.db"),
            ("ENTITLEMENTS_KEY", "group.widgets.purchased"),
            ("ENTITLEMENTS_LOG", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(
            config.database_path,
            PathBuf::from("/data/group/entitlements.db")
        );
        assert_eq!(config.purchased_items_key, "group.widgets.purchased");
        assert_eq!(config.log_filter, "debug");
        assert_eq!(config.catalog_path, None);
    }
}
