//! Configuration APIs for cspp-trie
//!
//! Every tunable of a trie instance lives in an explicit configuration value that is
//! constructed once and handed to [`crate::PatriciaTrie::new`]. Nothing is read from
//! the process environment unless a caller asks for it through [`Config::from_env`].
//!
//! # Example Usage
//!
//! ```rust
//! use cspp_trie::config::{Config, PatriciaTrieConfig};
//! use cspp_trie::ConcurrencyLevel;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PatriciaTrieConfig::builder()
//!     .value_size(8)
//!     .max_mem(64 << 20)
//!     .concurrency_level(ConcurrencyLevel::MultiWriteMultiRead)
//!     .build()?;
//! assert_eq!(config.value_size, 8);
//!
//! let fast = PatriciaTrieConfig::performance_preset();
//! assert!(fast.validate().is_ok());
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use std::env;
use std::fmt;
use std::path::Path;

pub mod patricia_trie;

pub use patricia_trie::{HugePageMode, PatriciaTrieConfig, PatriciaTrieConfigBuilder};

/// Common configuration trait providing validation, environment initialization,
/// presets and JSON persistence.
pub trait Config: Clone + fmt::Debug {
    /// Validate the configuration for correctness and consistency.
    fn validate(&self) -> Result<()>;

    /// Initialize configuration from environment variables using the `CSPP_` prefix.
    fn from_env() -> Result<Self>
    where
        Self: Default,
    {
        Self::from_env_with_prefix("CSPP_")
    }

    /// Initialize configuration from environment variables with a custom prefix.
    fn from_env_with_prefix(prefix: &str) -> Result<Self>
    where
        Self: Default;

    /// Preset tuned for write throughput.
    fn performance_preset() -> Self;

    /// Preset tuned for a small footprint.
    fn memory_preset() -> Self;

    /// Preset tuned for predictable latency.
    fn realtime_preset() -> Self;

    /// Balanced preset, identical to the default.
    fn balanced_preset() -> Self
    where
        Self: Default,
    {
        Self::default()
    }

    /// Save configuration to a JSON file.
    fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()>;

    /// Load and validate configuration from a JSON file.
    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self>;
}

/// Configuration validation error details.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field that failed validation
    pub field: String,
    /// The invalid value
    pub value: String,
    /// Description of why the value is invalid
    pub reason: String,
    /// Suggested valid values or ranges
    pub suggestion: Option<String>,
}

impl ValidationError {
    /// Create a new validation error.
    pub fn new(field: &str, value: &str, reason: &str) -> Self {
        Self {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
            suggestion: None,
        }
    }

    /// Add a suggestion for valid values.
    pub fn with_suggestion(mut self, suggestion: &str) -> Self {
        self.suggestion = Some(suggestion.to_string());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "field '{}' = '{}': {}",
            self.field, self.value, self.reason
        )?;
        if let Some(ref suggestion) = self.suggestion {
            write!(f, " (try {})", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Parse an environment variable, falling back to `default` when unset or unparsable.
pub fn parse_env_var<T>(var_name: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    env::var(var_name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Parse a boolean environment variable.
///
/// Accepts "true", "1", "yes", "on" and "false", "0", "no", "off" (case-insensitive);
/// anything else falls back to `default`.
pub fn parse_env_bool(var_name: &str, default: bool) -> bool {
    env::var(var_name)
        .ok()
        .and_then(|s| parse_bool_str(&s))
        .unwrap_or(default)
}

pub(crate) fn parse_bool_str(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
