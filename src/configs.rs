use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Minimum number of leaf chain files always kept per directory, newest
/// first, regardless of expiry. Safeguard against a poorly set clock.
pub const DEFAULT_MINIMUM_CERTIFICATE_ENTRIES: usize = 10;
/// 50 MB default limit for filesystem usage.
pub const DEFAULT_MAX_FILESYSTEM_SIZE: u64 = 1024 * 1024 * 50;
/// Default maximum number of tracked certificate/key files.
pub const DEFAULT_MAX_CERTIFICATE_ENTRIES: u64 = 2000;
/// Expiry for CSR private keys that never received a certificate, 60 minutes.
pub const DEFAULT_CSR_EXPIRY: Duration = Duration::from_secs(3600);
/// Default garbage collect interval, 20 minutes.
pub const DEFAULT_GARBAGE_COLLECT_INTERVAL: Duration = Duration::from_secs(20 * 60);

/// Directories holding the leaf certificates and their private keys, one
/// pair per role.
#[derive(Debug, Deserialize, Clone)]
pub struct LeafDirectories {
    pub csms_leaf_cert_directory: PathBuf,
    pub csms_leaf_key_directory: PathBuf,
    pub secc_leaf_cert_directory: PathBuf,
    pub secc_leaf_key_directory: PathBuf,
}

/// Optional symlinks exposing the currently selected V2G material to
/// consumers that expect fixed paths.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LinkPaths {
    #[serde(default)]
    pub secc_leaf_cert_link: Option<PathBuf>,
    #[serde(default)]
    pub secc_leaf_key_link: Option<PathBuf>,
    #[serde(default)]
    pub cpo_cert_chain_link: Option<PathBuf>,
}

/// All filesystem locations managed by the store. CA bundles may be
/// single PEM files or directories of certificate files; the leaf
/// locations must be directories.
#[derive(Debug, Deserialize, Clone)]
pub struct StorePaths {
    pub csms_ca_bundle: PathBuf,
    pub mf_ca_bundle: PathBuf,
    pub mo_ca_bundle: PathBuf,
    pub v2g_ca_bundle: PathBuf,
    pub directories: LeafDirectories,
    #[serde(default)]
    pub links: LinkPaths,
}

/// Store construction parameters: paths plus resource caps and timers.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub paths: StorePaths,
    #[serde(default = "default_max_fs_usage_bytes")]
    pub max_fs_usage_bytes: u64,
    #[serde(default = "default_max_fs_certificate_store_entries")]
    pub max_fs_certificate_store_entries: u64,
    #[serde(default = "default_csr_expiry_seconds")]
    pub csr_expiry_seconds: u64,
    #[serde(default = "default_garbage_collect_interval_seconds")]
    pub garbage_collect_interval_seconds: u64,
}

fn default_max_fs_usage_bytes() -> u64 {
    DEFAULT_MAX_FILESYSTEM_SIZE
}

fn default_max_fs_certificate_store_entries() -> u64 {
    DEFAULT_MAX_CERTIFICATE_ENTRIES
}

fn default_csr_expiry_seconds() -> u64 {
    DEFAULT_CSR_EXPIRY.as_secs()
}

fn default_garbage_collect_interval_seconds() -> u64 {
    DEFAULT_GARBAGE_COLLECT_INTERVAL.as_secs()
}

impl StoreConfig {
    /// Build a configuration from paths, keeping every cap and timer at
    /// its default.
    pub fn new(paths: StorePaths) -> Self {
        Self {
            paths,
            max_fs_usage_bytes: default_max_fs_usage_bytes(),
            max_fs_certificate_store_entries: default_max_fs_certificate_store_entries(),
            csr_expiry_seconds: default_csr_expiry_seconds(),
            garbage_collect_interval_seconds: default_garbage_collect_interval_seconds(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let config_str =
            fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;

        let config: StoreConfig =
            toml::from_str(&config_str).context("Failed to parse config file")?;

        Ok(config)
    }

    pub fn csr_expiry(&self) -> Duration {
        Duration::from_secs(self.csr_expiry_seconds)
    }

    pub fn garbage_collect_interval(&self) -> Duration {
        Duration::from_secs(self.garbage_collect_interval_seconds)
    }
}
