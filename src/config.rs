//! Runtime settings assembled from defaults and environment variables.
//!
//! Credentials come from `ANALYSIS_API_KEYS` (comma separated), with
//! `GEMINI_API_KEY` accepted as a single-key fallback. Tuning knobs use
//! `ANALYSIS_*` variables, each applied by the owning module's `from_env`.

use crate::credentials::{Credential, PoolConfig};
use crate::dispatch::DispatchConfig;
use crate::service::gemini::GeminiConfig;

/// Aggregated runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub pool: PoolConfig,
    pub dispatch: DispatchConfig,
    pub gemini: GeminiConfig,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            pool: PoolConfig::from_env(),
            dispatch: DispatchConfig::from_env(),
            gemini: GeminiConfig::from_env(),
        }
    }
}

/// Parse a comma-separated key list into credentials with log-safe tags.
pub fn credentials_from_keys(raw: &str) -> Vec<Credential> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .enumerate()
        .map(|(i, key)| Credential::new(i, key))
        .collect()
}

/// Read credentials from the environment.
pub fn credentials_from_env() -> Vec<Credential> {
    let raw = std::env::var("ANALYSIS_API_KEYS")
        .or_else(|_| std::env::var("GEMINI_API_KEYS"))
        .or_else(|_| std::env::var("GEMINI_API_KEY"))
        .unwrap_or_default();
    credentials_from_keys(&raw)
}
