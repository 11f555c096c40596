//! Service configuration.

use serde::Deserialize;
use std::path::Path;

use z_entitle_core::Catalog;

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Path to `RocksDB` data directory (default: "/data/z-entitle").
    pub data_dir: String,

    /// Attempts per processor call before giving up (default: 3).
    pub processor_max_retries: u32,

    /// First retry delay in milliseconds, doubled per attempt (default: 100).
    pub processor_initial_backoff_ms: u64,

    /// Cap on the retry delay in milliseconds (default: 5000).
    pub processor_max_backoff_ms: u64,

    /// Seconds between reconciliation sweeps (default: 300).
    pub reconcile_interval_seconds: u64,

    /// Lifetime of balance cache entries (default: 60).
    pub cache_ttl_seconds: u64,

    /// Days a past-due instance stays live before it expires (default: 7).
    pub past_due_grace_days: i64,

    /// Slack when deciding whether a requested anchor lines up with the
    /// processor's natural cycle (default: 60).
    pub alignment_tolerance_seconds: i64,

    /// JSON file with the plan catalog (optional).
    pub catalog_path: Option<String>,

    /// Payment processor API key (optional).
    pub processor_api_key: Option<String>,
}

/// Processor secrets file structure.
#[derive(Debug, Deserialize)]
struct ProcessorSecrets {
    api_key: String,
}

impl ServiceConfig {
    /// Load configuration from environment variables and secrets files.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("DATA_DIR").unwrap_or(defaults.data_dir),
            processor_max_retries: env_or("PROCESSOR_MAX_RETRIES", defaults.processor_max_retries),
            processor_initial_backoff_ms: env_or(
                "PROCESSOR_INITIAL_BACKOFF_MS",
                defaults.processor_initial_backoff_ms,
            ),
            processor_max_backoff_ms: env_or(
                "PROCESSOR_MAX_BACKOFF_MS",
                defaults.processor_max_backoff_ms,
            ),
            reconcile_interval_seconds: env_or(
                "RECONCILE_INTERVAL_SECONDS",
                defaults.reconcile_interval_seconds,
            ),
            cache_ttl_seconds: env_or("CACHE_TTL_SECONDS", defaults.cache_ttl_seconds),
            past_due_grace_days: env_or("PAST_DUE_GRACE_DAYS", defaults.past_due_grace_days),
            alignment_tolerance_seconds: env_or(
                "ALIGNMENT_TOLERANCE_SECONDS",
                defaults.alignment_tolerance_seconds,
            ),
            catalog_path: std::env::var("CATALOG_PATH").ok(),
            processor_api_key: load_processor_secrets(),
        }
    }

    /// Load the plan catalog from `catalog_path`, empty when unset.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_catalog(&self) -> Result<Catalog, std::io::Error> {
        match &self.catalog_path {
            Some(path) => load_json_file(path),
            None => Ok(Catalog::default()),
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Load the processor API key from file or environment.
fn load_processor_secrets() -> Option<String> {
    let secret_paths = [
        ".secrets/processor.json",
        "z-entitle/.secrets/processor.json",
        "../.secrets/processor.json",
    ];

    for path in &secret_paths {
        if let Ok(secrets) = load_json_file::<ProcessorSecrets>(path) {
            tracing::info!(path = %path, "Loaded processor secrets from file");
            return Some(secrets.api_key);
        }
    }

    tracing::debug!("Processor secrets file not found, using environment variables");
    std::env::var("PROCESSOR_API_KEY").ok()
}

/// Load a JSON file.
fn load_json_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "File not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: "/data/z-entitle".into(),
            processor_max_retries: 3,
            processor_initial_backoff_ms: 100,
            processor_max_backoff_ms: 5000,
            reconcile_interval_seconds: 300,
            cache_ttl_seconds: 60,
            past_due_grace_days: 7,
            alignment_tolerance_seconds: 60,
            catalog_path: None,
            processor_api_key: None,
        }
    }
}
