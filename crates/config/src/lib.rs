use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const APP_NAME: &str = "emecef-pos";
const KEYCHAIN_SERVICE: &str = "bj.dgi.emecef.credentials";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: String, // "mock" | "dgi"
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
        }
    }
}

fn default_provider_kind() -> String {
    "mock".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_terminal_id")]
    pub terminal_id: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_ms: default_api_timeout_ms(),
            terminal_id: default_terminal_id(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_api_timeout_ms() -> u64 {
    30_000
}

fn default_terminal_id() -> String {
    "FP9900_001".to_string()
}

/// Offline-sync tunables. Defaults match the behavior the terminals have
/// always shipped with; they are knobs, not new behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,
    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,
    #[serde(default = "default_duplicate_window_ms")]
    pub duplicate_window_ms: u64,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_sync_interval_ms(),
            retry_ceiling: default_retry_ceiling(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
            duplicate_window_ms: default_duplicate_window_ms(),
            max_pending: default_max_pending(),
        }
    }
}

fn default_sync_interval_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_retry_ceiling() -> u32 {
    3
}

fn default_base_retry_delay_ms() -> u64 {
    1_000
}

fn default_duplicate_window_ms() -> u64 {
    60_000
}

fn default_max_pending() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_queue_path")]
    pub queue_path: String,
    #[serde(default = "default_audit_log")]
    pub audit_log: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            queue_path: default_queue_path(),
            audit_log: default_audit_log(),
        }
    }
}

fn default_queue_path() -> String {
    ".emecef_queue".to_string()
}

fn default_audit_log() -> String {
    "audit.jsonl".to_string()
}

pub fn load() -> Result<AppConfig> {
    let cfg: AppConfig = confy::load(APP_NAME, None).context("Failed to load app config")?;
    Ok(cfg)
}

pub fn store(cfg: &AppConfig) -> Result<()> {
    confy::store(APP_NAME, None, cfg).context("Failed to store app config")?;
    Ok(())
}

/// Store a secret in the OS keychain
pub fn store_secret(key: &str, value: &str) -> Result<()> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)?;
    entry.set_password(value)?;
    Ok(())
}

/// Retrieve a secret from the OS keychain
pub fn get_secret(key: &str) -> Result<String> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)?;
    let password = entry.get_password()?;
    Ok(password)
}

/// Delete a secret from the OS keychain
pub fn delete_secret(key: &str) -> Result<()> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)?;
    entry.delete_password()?;
    Ok(())
}
