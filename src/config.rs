//! Configuration file handling
//!
//! Reads `walshadow.toml`. A `.env` file next to it is loaded first, then
//! `$VAR` and `${VAR}` references anywhere in the file are replaced with
//! environment values before parsing. Unset variables expand to an empty
//! string.
//!
//! ```toml
//! [[dbs]]
//! path = "/var/lib/app/app.db"
//!
//! [[dbs.replicas]]
//! name = "backup"
//! type = "file"
//! path = "${BACKUP_ROOT}/app"
//! retention = { keep_last = 7 }
//! ```
//!
//! Relative paths are resolved against the directory holding the file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::client::{FileReplicaClient, ReplicaClient};
use crate::db::DbOptions;
use crate::error::{ShadowError, ShadowResult};
use crate::replica::retention::{KeepAll, KeepLast, MaxAge, RetentionPolicy};
use crate::replica::ReplicaOptions;

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "walshadow.toml";

/// Environment variable pointing at the configuration file
pub const ENV_CONFIG: &str = "WALSHADOW_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dbs: Vec<DbConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    #[serde(default = "default_min_checkpoint_page_count")]
    pub min_checkpoint_page_count: u64,
    #[serde(default = "default_max_checkpoint_page_count")]
    pub max_checkpoint_page_count: u64,
    #[serde(default)]
    pub replicas: Vec<ReplicaConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default = "default_replica_type")]
    pub kind: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    #[serde(default)]
    pub snapshot_interval_secs: Option<u64>,
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub retention: Option<RetentionConfig>,
}

/// Exactly one of the two fields must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default)]
    pub keep_last: Option<usize>,
    #[serde(default)]
    pub max_age_hours: Option<u64>,
}

fn default_monitor_interval_ms() -> u64 {
    1000
}

fn default_min_checkpoint_page_count() -> u64 {
    crate::db::DEFAULT_MIN_CHECKPOINT_PAGE_COUNT
}

fn default_max_checkpoint_page_count() -> u64 {
    crate::db::DEFAULT_MAX_CHECKPOINT_PAGE_COUNT
}

fn default_replica_type() -> String {
    "file".to_string()
}

fn default_sync_interval_ms() -> u64 {
    1000
}

fn default_min_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Config {
    /// Load a configuration file, reading a sibling `.env` first.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));

        // Load env file if present (ignore errors)
        let env_path = dir.join(".env");
        if env_path.exists() {
            let _ = dotenvy::from_path(&env_path);
        }

        if !path.exists() {
            anyhow::bail!("Configuration file not found: {}", path.display());
        }

        let content = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&content)?;
        config.resolve_paths(dir);
        Ok(config)
    }

    /// Parse configuration text after environment expansion.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let expanded = expand_env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for db in &mut self.dbs {
            if db.path.is_relative() {
                db.path = base.join(&db.path);
            }
            for replica in &mut db.replicas {
                if let Some(path) = replica.path.as_mut() {
                    if path.is_relative() {
                        *path = base.join(&*path);
                    }
                }
            }
        }
    }

    /// Database entry whose path matches `path`.
    pub fn find_db(&self, path: &Path) -> Option<&DbConfig> {
        let wanted = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.dbs.iter().find(|db| {
            let candidate = std::fs::canonicalize(&db.path).unwrap_or_else(|_| db.path.clone());
            candidate == wanted
        })
    }
}

/// Replace `$VAR` and `${VAR}` with environment values.
pub fn expand_env(content: &str) -> anyhow::Result<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")?;
    let expanded = re.replace_all(content, |caps: &Captures| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        std::env::var(name).unwrap_or_default()
    });
    Ok(expanded.into_owned())
}

impl DbConfig {
    pub fn options(&self) -> DbOptions {
        DbOptions {
            monitor_interval: Duration::from_millis(self.monitor_interval_ms),
            min_checkpoint_page_count: self.min_checkpoint_page_count,
            max_checkpoint_page_count: self.max_checkpoint_page_count,
            ..DbOptions::default()
        }
    }
}

impl ReplicaConfig {
    /// Display name: the configured name, else the backend type.
    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.kind.clone())
    }

    pub fn build_client(&self) -> ShadowResult<Arc<dyn ReplicaClient>> {
        match self.kind.as_str() {
            "file" => {
                let path = self.path.as_ref().ok_or_else(|| {
                    ShadowError::Configuration(format!("replica {}: missing path", self.name()))
                })?;
                Ok(Arc::new(FileReplicaClient::new(path)))
            }
            other => Err(ShadowError::Configuration(format!(
                "replica {}: unknown type {:?}",
                self.name(),
                other
            ))),
        }
    }

    pub fn retention_policy(&self) -> ShadowResult<Arc<dyn RetentionPolicy>> {
        let Some(retention) = &self.retention else {
            return Ok(Arc::new(KeepAll));
        };
        match (retention.keep_last, retention.max_age_hours) {
            (Some(n), None) if n > 0 => Ok(Arc::new(KeepLast(n))),
            (None, Some(hours)) if hours > 0 => Ok(Arc::new(MaxAge(chrono::Duration::hours(
                hours as i64,
            )))),
            _ => Err(ShadowError::Configuration(format!(
                "replica {}: retention needs exactly one positive keep_last or max_age_hours",
                self.name()
            ))),
        }
    }

    pub fn options(&self) -> ShadowResult<ReplicaOptions> {
        if self.min_backoff_ms > self.max_backoff_ms {
            return Err(ShadowError::Configuration(format!(
                "replica {}: min_backoff_ms is larger than max_backoff_ms",
                self.name()
            )));
        }
        Ok(ReplicaOptions {
            sync_interval: Duration::from_millis(self.sync_interval_ms),
            snapshot_interval: self.snapshot_interval_secs.map(Duration::from_secs),
            min_backoff: Duration::from_millis(self.min_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            retention: self.retention_policy()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[dbs]]
path = "/var/lib/app/app.db"
monitor_interval_ms = 250

[[dbs.replicas]]
name = "backup"
type = "file"
path = "/mnt/backup/app"
snapshot_interval_secs = 3600
retention = { keep_last = 7 }

[[dbs.replicas]]
path = "/mnt/other"
"#;

    #[test]
    fn test_parse_with_defaults() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.dbs.len(), 1);
        let db = &config.dbs[0];
        assert_eq!(db.options().monitor_interval, Duration::from_millis(250));
        assert_eq!(db.max_checkpoint_page_count, 10_000);

        let backup = &db.replicas[0];
        assert_eq!(backup.name(), "backup");
        let opts = backup.options().unwrap();
        assert_eq!(opts.snapshot_interval, Some(Duration::from_secs(3600)));
        assert_eq!(opts.max_backoff, Duration::from_secs(30));

        let other = &db.replicas[1];
        assert_eq!(other.name(), "file");
        assert!(other.options().unwrap().snapshot_interval.is_none());
        assert_eq!(other.build_client().unwrap().kind(), "file");
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("WALSHADOW_TEST_ROOT", "/srv/backups");
        let expanded =
            expand_env("path = \"${WALSHADOW_TEST_ROOT}/a\"\nother = \"$WALSHADOW_TEST_ROOT\"")
                .unwrap();
        assert_eq!(expanded, "path = \"/srv/backups/a\"\nother = \"/srv/backups\"");

        let expanded = expand_env("x = \"${WALSHADOW_TEST_UNSET_VAR}\"").unwrap();
        assert_eq!(expanded, "x = \"\"");
    }

    #[test]
    fn test_replica_configuration_errors() {
        let mut replica = Config::parse(SAMPLE).unwrap().dbs[0].replicas[0].clone();

        replica.retention = Some(RetentionConfig {
            keep_last: Some(2),
            max_age_hours: Some(24),
        });
        assert!(matches!(replica.options(), Err(ShadowError::Configuration(_))));

        replica.retention = Some(RetentionConfig::default());
        assert!(replica.options().is_err());

        replica.retention = Some(RetentionConfig {
            keep_last: None,
            max_age_hours: Some(24),
        });
        assert!(replica.options().is_ok());

        replica.kind = "s3".to_string();
        assert!(replica.build_client().unwrap_err().is_fatal_for_replica());

        replica.kind = "file".to_string();
        replica.path = None;
        assert!(replica.build_client().is_err());
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            "[[dbs]]\npath = \"app.db\"\n[[dbs.replicas]]\npath = \"replica\"\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.dbs[0].path, tmp.path().join("app.db"));
        assert_eq!(
            config.dbs[0].replicas[0].path.as_deref(),
            Some(tmp.path().join("replica").as_path())
        );
        assert!(config.find_db(&tmp.path().join("app.db")).is_some());
        assert!(Config::load(&tmp.path().join("missing.toml")).is_err());
    }
}
