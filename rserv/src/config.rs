//! Runtime configuration.
//!
//! Sources layer in precedence order: defaults, then an `.env`-style file,
//! then `RSERV_*` environment variables, then explicit flag overrides.
//! Unknown keys are skipped; bad values for known keys are errors.

use crate::{Error, Result};
use rserv_storage::graph::GraphMode;
use rserv_storage::store::PatchNull;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheType {
    TtlCache,
    Redis,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Base directory holding `data/` and `schema/`.
    pub data_dir: PathBuf,
    pub patch_null: PatchNull,
    /// Result/read cache TTL in seconds.
    pub cache_ttl: u64,
    pub default_page_size: usize,
    pub schema: String,
    pub cascading_delete: bool,
    pub graph_enabled: bool,
    pub rserv_graph: GraphMode,
    pub fulltext_enabled: bool,
    pub cache_type: CacheType,
    pub redis_host: String,
    pub redis_port: u16,
    pub max_query_depth: u32,
    pub query_worker_count: usize,
    /// Per-query wall clock in seconds.
    pub query_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            data_dir: PathBuf::from("."),
            patch_null: PatchNull::Store,
            cache_ttl: 300,
            default_page_size: 20,
            schema: "default".to_string(),
            cascading_delete: false,
            graph_enabled: true,
            rserv_graph: GraphMode::Memory,
            fulltext_enabled: false,
            cache_type: CacheType::TtlCache,
            redis_host: "127.0.0.1".to_string(),
            redis_port: 6379,
            max_query_depth: 10,
            query_worker_count: 2,
            query_timeout: 30,
        }
    }
}

const KEYS: &[&str] = &[
    "host",
    "port",
    "data_dir",
    "patch_null",
    "cache_ttl",
    "default_page_size",
    "schema",
    "cascading_delete",
    "graph_enabled",
    "rserv_graph",
    "fulltext_enabled",
    "cache_type",
    "redis_host",
    "redis_port",
    "max_query_depth",
    "query_worker_count",
    "query_timeout",
];

impl Config {
    /// Loads with full precedence: file, then environment, then flags.
    pub fn load(
        file: Option<&Path>,
        overrides: &[(String, String)],
    ) -> Result<Self> {
        let mut config = Config::default();
        if let Some(path) = file {
            config.apply_file(path)?;
        }
        config.apply_env()?;
        for (key, value) in overrides {
            config.apply_kv(key, value)?;
        }
        Ok(config)
    }

    /// `KEY=value` lines; `#` starts a comment.
    pub fn apply_file(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::validation("config", format!("cannot read {}: {e}", path.display())))?;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim().to_lowercase();
            let value = value.trim().trim_matches('"');
            if KEYS.contains(&key.as_str()) {
                self.apply_kv(&key, value)?;
            } else {
                debug!(key, "ignoring unknown config key");
            }
        }
        Ok(())
    }

    /// `RSERV_<KEY>` environment variables.
    pub fn apply_env(&mut self) -> Result<()> {
        for key in KEYS {
            let env_key = format!("RSERV_{}", key.to_uppercase());
            if let Ok(value) = std::env::var(&env_key) {
                self.apply_kv(key, &value)?;
            }
        }
        Ok(())
    }

    pub fn apply_kv(&mut self, key: &str, value: &str) -> Result<()> {
        let bad = |expected: &str| {
            Error::validation(key, format!("bad value {value:?}, expected {expected}"))
        };
        match key {
            "host" => self.host = value.to_string(),
            "port" => self.port = value.parse().map_err(|_| bad("a port number"))?,
            "data_dir" => self.data_dir = PathBuf::from(value),
            "patch_null" => {
                self.patch_null = match value.to_lowercase().as_str() {
                    "store" => PatchNull::Store,
                    "delete" => PatchNull::Delete,
                    _ => return Err(bad("store or delete")),
                }
            }
            "cache_ttl" => self.cache_ttl = value.parse().map_err(|_| bad("seconds"))?,
            "default_page_size" => {
                self.default_page_size = value.parse().map_err(|_| bad("a count"))?
            }
            "schema" => self.schema = value.to_string(),
            "cascading_delete" => self.cascading_delete = parse_bool(value).ok_or_else(|| bad("a boolean"))?,
            "graph_enabled" => self.graph_enabled = parse_bool(value).ok_or_else(|| bad("a boolean"))?,
            "rserv_graph" => {
                self.rserv_graph = match value.to_lowercase().as_str() {
                    "memory" => GraphMode::Memory,
                    "indexed" => GraphMode::Indexed,
                    _ => return Err(bad("memory or indexed")),
                }
            }
            "fulltext_enabled" => self.fulltext_enabled = parse_bool(value).ok_or_else(|| bad("a boolean"))?,
            "cache_type" => {
                self.cache_type = match value.to_lowercase().as_str() {
                    "ttlcache" => CacheType::TtlCache,
                    "redis" => CacheType::Redis,
                    _ => return Err(bad("ttlcache or redis")),
                }
            }
            "redis_host" => self.redis_host = value.to_string(),
            "redis_port" => self.redis_port = value.parse().map_err(|_| bad("a port number"))?,
            "max_query_depth" => {
                self.max_query_depth = value.parse().map_err(|_| bad("a depth"))?
            }
            "query_worker_count" => {
                self.query_worker_count = value.parse().map_err(|_| bad("a count"))?
            }
            "query_timeout" => self.query_timeout = value.parse().map_err(|_| bad("seconds"))?,
            other => debug!(key = other, "ignoring unknown config key"),
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.cache_ttl, 300);
        assert_eq!(config.max_query_depth, 10);
        assert_eq!(config.patch_null, PatchNull::Store);
        assert!(!config.cascading_delete);
    }

    #[test]
    fn file_then_flag_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rserv.env");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "PORT=9000").unwrap();
        writeln!(file, "patch_null=delete").unwrap();
        writeln!(file, "mystery_key=ignored").unwrap();
        drop(file);

        let overrides = vec![("port".to_string(), "9001".to_string())];
        let config = Config::load(Some(&path), &overrides).unwrap();
        assert_eq!(config.port, 9001);
        assert_eq!(config.patch_null, PatchNull::Delete);
    }

    #[test]
    fn bad_values_for_known_keys_are_errors() {
        let mut config = Config::default();
        assert!(config.apply_kv("port", "not-a-port").is_err());
        assert!(config.apply_kv("rserv_graph", "quantum").is_err());
        assert!(config.apply_kv("cascading_delete", "maybe").is_err());
    }
}
