//! Change tracker configuration.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;
use crate::store::ReadPreference;

/// Name of the datastore used when none is configured.
pub const DEFAULT_PRIMARY_DATASTORE: &str = "primary";

/// Default connection URI of the primary datastore.
pub const DEFAULT_URI: &str = "mongodb://localhost:27017";

/// Default database of the primary datastore.
pub const DEFAULT_DATABASE: &str = "changefeed";

/// Default maximum wait per change stream poll (1 minute).
pub const DEFAULT_MAX_AWAIT_MS: u64 = 60_000;

/// Tag key value that disables tagged secondary reads.
pub const READ_PREFERENCE_TAG_NONE: &str = "none";

fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(4)
        .max(1)
}

fn deserialize_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Connection settings for one datastore deployment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatastoreConfig {
    /// Connection URI.
    pub uri: String,
    /// Default database for collections of this datastore.
    pub database: String,
}

impl DatastoreConfig {
    /// Create a datastore configuration.
    pub fn new(uri: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            database: database.into(),
        }
    }
}

/// Replica-set tag used to pin change stream reads to tagged secondaries.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReadPreferenceTag {
    /// Tag key; `"none"` disables tagging.
    pub key: String,
    /// Tag value.
    pub value: String,
}

impl ReadPreferenceTag {
    /// Create a tag.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Whether the tag selects secondaries at all.
    pub fn is_enabled(&self) -> bool {
        !self.key.is_empty() && !self.key.eq_ignore_ascii_case(READ_PREFERENCE_TAG_NONE)
    }
}

/// Change tracker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Datastore used for entities whose datastore is unmapped.
    pub primary_datastore: String,

    /// Known datastores by name.
    pub datastores: HashMap<String, DatastoreConfig>,

    /// Replica-set tag for change stream reads.
    pub read_preference_tag: Option<ReadPreferenceTag>,

    /// Number of worker threads; bounds how many streams run at once.
    pub pool_size: usize,

    /// Maximum wait per change stream poll.
    #[serde(rename = "max_await_ms", deserialize_with = "deserialize_millis")]
    pub max_await: Duration,
}

impl TrackerConfig {
    /// Create a configuration with a single primary datastore.
    pub fn new(primary: DatastoreConfig) -> Self {
        let mut datastores = HashMap::new();
        datastores.insert(DEFAULT_PRIMARY_DATASTORE.to_string(), primary);
        Self {
            primary_datastore: DEFAULT_PRIMARY_DATASTORE.to_string(),
            datastores,
            read_preference_tag: None,
            pool_size: default_pool_size(),
            max_await: Duration::from_millis(DEFAULT_MAX_AWAIT_MS),
        }
    }

    /// Parse a TOML configuration.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Add or replace a named datastore.
    pub fn with_datastore(mut self, name: impl Into<String>, datastore: DatastoreConfig) -> Self {
        self.datastores.insert(name.into(), datastore);
        self
    }

    /// Set the replica-set tag for reads.
    pub fn with_read_preference_tag(mut self, tag: ReadPreferenceTag) -> Self {
        self.read_preference_tag = Some(tag);
        self
    }

    /// Set the worker pool size.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    /// Set the maximum wait per poll.
    pub fn with_max_await(mut self, max_await: Duration) -> Self {
        self.max_await = max_await;
        self
    }

    /// Check the configuration for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("pool_size must be at least 1".into()));
        }
        if self.max_await.is_zero() {
            return Err(ConfigError::Invalid("max_await_ms must be positive".into()));
        }
        if !self.datastores.contains_key(&self.primary_datastore) {
            return Err(ConfigError::Invalid(format!(
                "primary datastore {} is not configured",
                self.primary_datastore
            )));
        }
        Ok(())
    }

    /// Resolve a datastore by name, falling back to the primary datastore.
    ///
    /// Returns the name the datastore resolved to together with its settings.
    pub fn resolve_datastore(
        &self,
        name: Option<&str>,
    ) -> Result<(&str, &DatastoreConfig), ConfigError> {
        if let Some(name) = name {
            if let Some((key, datastore)) = self.datastores.get_key_value(name) {
                return Ok((key.as_str(), datastore));
            }
        }
        self.datastores
            .get_key_value(&self.primary_datastore)
            .map(|(key, datastore)| (key.as_str(), datastore))
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "primary datastore {} is not configured",
                    self.primary_datastore
                ))
            })
    }

    /// Read preference for change stream reads.
    pub fn read_preference(&self) -> ReadPreference {
        match &self.read_preference_tag {
            Some(tag) if tag.is_enabled() => ReadPreference::tagged_secondary(&tag.key, &tag.value),
            _ => ReadPreference::SecondaryPreferred,
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::new(DatastoreConfig::new(DEFAULT_URI, DEFAULT_DATABASE))
    }
}
