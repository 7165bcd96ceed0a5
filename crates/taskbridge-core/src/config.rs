//! Environment-driven configuration.
//!
//! Loaded once at startup into immutable values and injected into the
//! components; nothing reads the environment after that. Secrets live in
//! [`SecretString`] and never reach logs.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;

use crate::model::{FieldMap, SheetTableRef};

/// Default path of the embedded database.
pub const DEFAULT_DB_PATH: &str = "data/taskbridge.db";

/// Configuration errors. Surfacing one of these at startup is fatal.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Forge (issue tracker) connection settings.
#[derive(Debug, Clone)]
pub struct ForgeConfig {
    pub token: SecretString,
    pub owner: String,
    pub repo: String,
    pub api_base_url: String,
    /// Per-call deadline.
    pub deadline: Duration,
}

impl ForgeConfig {
    /// The `owner/repo` slug.
    #[must_use]
    pub fn repo_slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

/// Sheet (spreadsheet-database) connection settings.
#[derive(Debug, Clone)]
pub struct SheetConfig {
    pub app_id: String,
    pub app_secret: SecretString,
    pub domain: String,
    /// Whether the broker authenticates as the OAuth user rather than the
    /// tenant app.
    pub use_oauth: bool,
    /// The table new tasks sync to unless an intent names another.
    pub default_table: Option<SheetTableRef>,
    /// Chat that receives operator notifications.
    pub notify_chat_id: Option<String>,
    /// Column names of the default table.
    pub fields: FieldMap,
    /// Per-call deadline.
    pub deadline: Duration,
}

/// Dispatcher and reconciler tuning.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Reconciler polling interval.
    pub interval: Duration,
    /// Attempts before an outbox event is dead-lettered.
    pub max_attempts: u32,
    /// Base of the exponential backoff.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_cap: Duration,
    /// Events claimed per dispatcher pass.
    pub batch_size: usize,
    /// Dispatcher worker count.
    pub workers: usize,
    /// Age after which an in-flight claim is considered abandoned.
    pub reclaim_after: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(900),
            batch_size: 16,
            workers: 2,
            reclaim_after: Duration::from_secs(120),
        }
    }
}

impl SyncConfig {
    /// Loads only the sync tuning keys from the process environment.
    ///
    /// Intent-only surfaces use this so operator tuning like
    /// `SYNC_MAX_ATTEMPTS` applies without requiring gateway credentials.
    ///
    /// # Errors
    ///
    /// Returns the first unparseable key.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the sync tuning keys through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let defaults = Self::default();
        Ok(Self {
            interval: Duration::from_secs(
                env.parse_u64("SYNC_INTERVAL_SECS", defaults.interval.as_secs())?,
            ),
            max_attempts: u32::try_from(env.parse_u64("SYNC_MAX_ATTEMPTS", 5)?).map_err(|_| {
                ConfigError::Invalid {
                    key: "SYNC_MAX_ATTEMPTS",
                    reason: "out of range".to_owned(),
                }
            })?,
            backoff_base: Duration::from_millis(env.parse_u64("SYNC_BACKOFF_BASE_MS", 1000)?),
            backoff_cap: Duration::from_secs(
                env.parse_u64("SYNC_BACKOFF_CAP_SECS", defaults.backoff_cap.as_secs())?,
            ),
            batch_size: usize::try_from(env.parse_u64("SYNC_BATCH_SIZE", 16)?).unwrap_or(16),
            workers: usize::try_from(env.parse_u64("SYNC_WORKERS", 2)?).unwrap_or(2).max(1),
            reclaim_after: Duration::from_secs(env.parse_u64("SYNC_RECLAIM_SECS", 120)?),
        })
    }
}

/// Whole-process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub forge: ForgeConfig,
    pub sheet: SheetConfig,
    pub sync: SyncConfig,
    pub db_path: PathBuf,
}

impl Config {
    /// Loads configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns the first missing or unparseable key.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let deadline = Duration::from_secs(env.parse_u64("SYNC_GATEWAY_TIMEOUT_SECS", 30)?);

        let forge = ForgeConfig {
            token: SecretString::new(env.required("GITHUB_TOKEN")?),
            owner: env.required("GITHUB_OWNER")?,
            repo: env.required("GITHUB_REPO")?,
            api_base_url: env
                .optional("GITHUB_API_BASE")
                .unwrap_or_else(|| "https://api.github.com".to_owned()),
            deadline,
        };

        let default_table = match (env.optional("LARK_APP_TOKEN"), env.optional("LARK_TABLE_ID")) {
            (Some(app_token), Some(table_id)) => Some(SheetTableRef::new(app_token, table_id)),
            _ => None,
        };

        let defaults = FieldMap::default();
        let fields = FieldMap {
            title: env.optional("LARK_FIELD_TITLE").unwrap_or(defaults.title),
            status: env.optional("LARK_FIELD_STATUS").unwrap_or(defaults.status),
            assignee: env
                .optional("LARK_FIELD_ASSIGNEE")
                .unwrap_or(defaults.assignee),
            github_issue: env
                .optional("LARK_FIELD_GITHUB_ISSUE")
                .unwrap_or(defaults.github_issue),
            last_sync: env
                .optional("LARK_FIELD_LAST_SYNC")
                .unwrap_or(defaults.last_sync),
            priority: env.optional("LARK_FIELD_PRIORITY").or(defaults.priority),
            description: env
                .optional("LARK_FIELD_DESCRIPTION")
                .or(defaults.description),
            last_modified: env.optional("LARK_FIELD_LAST_MODIFIED"),
        };

        let sheet = SheetConfig {
            app_id: env.required("LARK_APP_ID")?,
            app_secret: SecretString::new(env.required("LARK_APP_SECRET")?),
            domain: env
                .optional("LARK_DOMAIN")
                .unwrap_or_else(|| "https://open.larksuite.com/".to_owned()),
            use_oauth: env.parse_bool("LARK_USE_OAUTH", true)?,
            default_table,
            notify_chat_id: env.optional("LARK_NOTIFY_CHAT_ID"),
            fields,
            deadline,
        };

        Ok(Self {
            forge,
            sheet,
            sync: SyncConfig::from_lookup(&lookup)?,
            db_path: db_path_from_lookup(&lookup),
        })
    }
}

/// Resolves the database path without requiring the full configuration.
///
/// Intent-only commands use this so they work without gateway credentials.
#[must_use]
pub fn db_path_from_env() -> PathBuf {
    db_path_from_lookup(&|key: &str| std::env::var(key).ok())
}

fn db_path_from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    lookup("TASKBRIDGE_DB_PATH")
        .map_or_else(|| PathBuf::from(DEFAULT_DB_PATH), PathBuf::from)
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.optional(key).ok_or(ConfigError::Missing(key))
    }

    fn parse_u64(&self, key: &'static str, default: u64) -> Result<u64, ConfigError> {
        self.optional(key).map_or(Ok(default), |raw| {
            raw.parse().map_err(|_| ConfigError::Invalid {
                key,
                reason: format!("expected an integer, got {raw:?}"),
            })
        })
    }

    fn parse_bool(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        self.optional(key).map_or(Ok(default), |raw| {
            match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => Ok(true),
                "0" | "false" | "no" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    key,
                    reason: format!("expected a boolean, got {raw:?}"),
                }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("GITHUB_TOKEN", "ghp_test"),
            ("GITHUB_OWNER", "acme"),
            ("GITHUB_REPO", "widgets"),
            ("LARK_APP_ID", "cli_x"),
            ("LARK_APP_SECRET", "s3cret"),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<Config, ConfigError> {
        Config::from_lookup(|key| env.get(key).map(ToString::to_string))
    }

    #[test]
    fn minimal_environment_loads_with_defaults() {
        let cfg = load(&base_env()).unwrap();
        assert_eq!(cfg.forge.repo_slug(), "acme/widgets");
        assert_eq!(cfg.sync.interval, Duration::from_secs(300));
        assert_eq!(cfg.sync.max_attempts, 5);
        assert!(cfg.sheet.use_oauth);
        assert!(cfg.sheet.default_table.is_none());
        assert_eq!(cfg.sheet.fields.title, "Task Name");
        assert_eq!(cfg.db_path, PathBuf::from(DEFAULT_DB_PATH));
    }

    #[test]
    fn missing_token_is_reported_by_key() {
        let mut env = base_env();
        env.remove("GITHUB_TOKEN");
        assert!(matches!(
            load(&env),
            Err(ConfigError::Missing("GITHUB_TOKEN"))
        ));
    }

    #[test]
    fn field_overrides_and_default_table_apply() {
        let mut env = base_env();
        env.insert("LARK_APP_TOKEN", "bascn123");
        env.insert("LARK_TABLE_ID", "tblabc");
        env.insert("LARK_FIELD_TITLE", "Name");
        env.insert("SYNC_INTERVAL_SECS", "30");
        let cfg = load(&env).unwrap();
        assert_eq!(
            cfg.sheet.default_table,
            Some(SheetTableRef::new("bascn123", "tblabc"))
        );
        assert_eq!(cfg.sheet.fields.title, "Name");
        assert_eq!(cfg.sync.interval, Duration::from_secs(30));
    }

    #[test]
    fn sync_tuning_loads_without_gateway_keys() {
        let env = HashMap::from([("SYNC_MAX_ATTEMPTS", "7")]);
        let sync =
            SyncConfig::from_lookup(|key| env.get(key).map(ToString::to_string)).unwrap();
        assert_eq!(sync.max_attempts, 7);
        assert_eq!(sync.interval, Duration::from_secs(300));
    }

    #[test]
    fn malformed_number_is_rejected() {
        let mut env = base_env();
        env.insert("SYNC_MAX_ATTEMPTS", "many");
        assert!(matches!(
            load(&env),
            Err(ConfigError::Invalid {
                key: "SYNC_MAX_ATTEMPTS",
                ..
            })
        ));
    }
}
