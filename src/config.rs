//! Configuration loading.
//!
//! A [`Settings`] struct assembled from the JSON sync-descriptor file
//! (parsed into [`crate::schema::SchemaTree`] separately) and a handful
//! of recognized environment variables, with environment variables
//! taking precedence for connection secrets. The CLI layer (`pgsync-cli`)
//! is responsible for locating the config file and constructing
//! `Settings`; this module only knows how to parse one once handed the
//! pieces.

use std::time::Duration;

use serde::Deserialize;

/// Default chunk size for one `logical_slot_changes` peek.
pub const DEFAULT_LOGICAL_SLOT_CHUNK_SIZE: i64 = 5_000;
const DEFAULT_BATCH_SIZE: usize = 1_000;
const DEFAULT_CHECKPOINT_INTERVAL_MS: u64 = 5_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Connection settings for the source PostgreSQL database.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub name: String,
}

fn default_pg_port() -> u16 {
    5432
}

/// Connection settings for the Elasticsearch-style bulk-indexing sink.
#[derive(Debug, Clone, Deserialize)]
pub struct IndexSettings {
    pub endpoint: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Operational knobs, all independently overridable by environment
/// variables or CLI flags.
#[derive(Debug, Clone)]
pub struct OperationalSettings {
    pub log_level: String,
    pub logical_slot_chunk_size: i64,
    pub batch_size: usize,
    pub checkpoint_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for OperationalSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            logical_slot_chunk_size: DEFAULT_LOGICAL_SLOT_CHUNK_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            checkpoint_interval: Duration::from_millis(DEFAULT_CHECKPOINT_INTERVAL_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

/// Assembled settings for one sync run: connection info plus operational
/// knobs. The sync-descriptor document itself (index/nodes/plugins) is
/// parsed separately into a [`crate::schema::SchemaTree`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub index: IndexSettings,
    pub operational: OperationalSettings,
}

impl Settings {
    /// Overlay environment variables onto settings parsed from the
    /// config file, with environment variables winning for connection
    /// secrets.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PGSYNC_PG_HOST") {
            self.database.host = v;
        }
        if let Ok(v) = std::env::var("PGSYNC_PG_PORT") {
            if let Ok(port) = v.parse() {
                self.database.port = port;
            }
        }
        if let Ok(v) = std::env::var("PGSYNC_PG_USER") {
            self.database.user = v;
        }
        if let Ok(v) = std::env::var("PGSYNC_PG_PASSWORD") {
            self.database.password = v;
        }
        if let Ok(v) = std::env::var("PGSYNC_PG_NAME") {
            self.database.name = v;
        }
        if let Ok(v) = std::env::var("PGSYNC_ELASTICSEARCH_ENDPOINT") {
            self.index.endpoint = v;
        }
        if let Ok(v) = std::env::var("PGSYNC_ELASTICSEARCH_USER") {
            self.index.user = Some(v);
        }
        if let Ok(v) = std::env::var("PGSYNC_ELASTICSEARCH_PASSWORD") {
            self.index.password = Some(v);
        }
        if let Ok(v) = std::env::var("PGSYNC_LOG_LEVEL") {
            self.operational.log_level = v;
        }
        if let Ok(v) = std::env::var("PGSYNC_LOGICAL_SLOT_CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.operational.logical_slot_chunk_size = n;
            }
        }
        if let Ok(v) = std::env::var("PGSYNC_BATCH_SIZE") {
            if let Ok(n) = v.parse() {
                self.operational.batch_size = n;
            }
        }
        if let Ok(v) = std::env::var("PGSYNC_CHECKPOINT_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                self.operational.checkpoint_interval = Duration::from_millis(n);
            }
        }
        if let Ok(v) = std::env::var("PGSYNC_POLL_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                self.operational.poll_interval = Duration::from_millis(n);
            }
        }
    }

    /// The `postgresql://` connection string for `tokio-postgres`.
    pub fn database_url(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.database.user, self.database.password, self.database.host, self.database.port, self.database.name
        )
    }
}

/// Top-level shape of the file `pgsync-cli` loads with `-c`: connection
/// settings plus the embedded sync-descriptor document. The descriptor's
/// own `index` key (an Elasticsearch index name) lives nested under
/// `sync` so it never collides with this file's `elasticsearch`
/// connection block.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSettings,
    #[serde(rename = "elasticsearch")]
    pub index: IndexSettings,
    pub sync: serde_json::Value,
}

impl ConfigFile {
    pub fn into_settings(self) -> Settings {
        Settings { database: self.database, index: self.index, operational: OperationalSettings::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_win_over_file_values() {
        // SAFETY in tests: single-threaded env mutation scoped to this test.
        unsafe { std::env::set_var("PGSYNC_PG_HOST", "override-host") };
        let mut settings = Settings {
            database: DatabaseSettings {
                host: "file-host".to_string(),
                port: 5432,
                user: "u".to_string(),
                password: String::new(),
                name: "testdb".to_string(),
            },
            index: IndexSettings { endpoint: "http://localhost:9200".to_string(), user: None, password: None },
            operational: OperationalSettings::default(),
        };
        settings.apply_env_overrides();
        assert_eq!(settings.database.host, "override-host");
        unsafe { std::env::remove_var("PGSYNC_PG_HOST") };
    }
}
