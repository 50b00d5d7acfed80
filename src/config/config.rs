//! Configuration structures and loading

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Main daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// Worker pool settings
    #[serde(default)]
    pub worker: WorkerConfiguration,

    /// Per-build defaults and caps
    #[serde(default)]
    pub build: BuildConfiguration,

    /// Artifact and log storage
    #[serde(default)]
    pub storage: StorageConfiguration,

    /// Working-tree checkout root
    #[serde(default)]
    pub repos: ReposConfiguration,

    /// Container engine settings
    #[serde(default)]
    pub docker: DockerConfiguration,

    /// Work-queue settings
    #[serde(default)]
    pub queue: QueueConfiguration,

    /// Retention sweeper settings
    #[serde(default)]
    pub retention: RetentionConfiguration,

    /// Commit-status provider endpoint
    #[serde(default)]
    pub provider: ProviderConfiguration,

    /// Secret vault settings
    #[serde(default)]
    pub vault: VaultConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self> {
        let config_path = std::path::Path::new(path);
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config: Configuration =
            toml::from_str(&content).with_context(|| "Failed to parse configuration")?;

        // Resolve relative paths against the config file's parent directory
        let base_dir = config_path
            .parent()
            .and_then(|p| if p.as_os_str().is_empty() { None } else { Some(p) })
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        config.storage.resolve_paths(&base_dir);
        config.repos.resolve_paths(&base_dir);

        config.validate()?;

        // Ensure directories exist
        std::fs::create_dir_all(&config.storage.artifacts_root)?;
        std::fs::create_dir_all(&config.repos.root)?;
        if let Some(parent) = config.storage.database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(config)
    }

    /// Cross-field validation
    pub fn validate(&self) -> Result<()> {
        if self.worker.count == 0 {
            bail!("worker.count must be at least 1");
        }
        if self.build.default_timeout_min > self.build.max_timeout_min {
            bail!(
                "build.default_timeout_min ({}) exceeds build.max_timeout_min ({})",
                self.build.default_timeout_min,
                self.build.max_timeout_min
            );
        }
        // Redelivery must never race a build that is still within its deadline
        if self.queue.visibility_timeout_secs <= self.build.max_timeout_min * 60 {
            bail!(
                "queue.visibility_timeout_secs ({}) must exceed build.max_timeout_min ({} min)",
                self.queue.visibility_timeout_secs,
                self.build.max_timeout_min
            );
        }
        Ok(())
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfiguration {
    /// Number of parallel workers; bounds in-flight builds
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// How long to wait for in-flight builds when shutting down
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl Default for WorkerConfiguration {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

fn default_worker_count() -> usize {
    2
}

fn default_drain_timeout() -> u64 {
    30
}

/// Per-build deadline defaults and image fallback
#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfiguration {
    /// Deadline applied when a project does not set one, in minutes
    #[serde(default = "default_build_timeout")]
    pub default_timeout_min: u64,

    /// System-wide cap on any build deadline, in minutes
    #[serde(default = "default_max_timeout")]
    pub max_timeout_min: u64,

    /// Container image used when a project has no override
    #[serde(default = "default_image")]
    pub default_image: String,
}

impl Default for BuildConfiguration {
    fn default() -> Self {
        Self {
            default_timeout_min: default_build_timeout(),
            max_timeout_min: default_max_timeout(),
            default_image: default_image(),
        }
    }
}

impl BuildConfiguration {
    /// Effective deadline for a project: min(project, system cap)
    pub fn deadline_for(&self, project_max_secs: u64) -> Duration {
        let cap = self.max_timeout_min * 60;
        let effective = if project_max_secs == 0 {
            self.default_timeout_min * 60
        } else {
            project_max_secs.min(cap)
        };
        Duration::from_secs(effective)
    }
}

fn default_build_timeout() -> u64 {
    30
}

fn default_max_timeout() -> u64 {
    120
}

fn default_image() -> String {
    "ubuntu:24.04".into()
}

/// Artifact and log storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfiguration {
    /// Artifact store root
    #[serde(default = "default_artifacts_root")]
    pub artifacts_root: PathBuf,

    /// SQLite database location
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default = "default_artifact_retention")]
    pub artifact_retention_days: u64,

    #[serde(default = "default_log_retention")]
    pub log_retention_days: u64,
}

impl Default for StorageConfiguration {
    fn default() -> Self {
        Self {
            artifacts_root: default_artifacts_root(),
            database_path: default_database_path(),
            artifact_retention_days: default_artifact_retention(),
            log_retention_days: default_log_retention(),
        }
    }
}

impl StorageConfiguration {
    fn resolve_paths(&mut self, base: &std::path::Path) {
        if self.artifacts_root.is_relative() {
            self.artifacts_root = base.join(&self.artifacts_root);
        }
        if self.database_path.is_relative() {
            self.database_path = base.join(&self.database_path);
        }
    }
}

fn default_artifacts_root() -> PathBuf {
    PathBuf::from("data/artifacts")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/anvil.db")
}

fn default_artifact_retention() -> u64 {
    14
}

fn default_log_retention() -> u64 {
    30
}

/// Working-tree checkout configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ReposConfiguration {
    /// Root under which working trees are materialised
    /// (`<root>/<project-id>/<commit>/`)
    #[serde(default = "default_repos_root")]
    pub root: PathBuf,

    /// Base URL for clone operations, e.g. "https://github.com"
    #[serde(default = "default_clone_base")]
    pub clone_base: String,
}

impl Default for ReposConfiguration {
    fn default() -> Self {
        Self {
            root: default_repos_root(),
            clone_base: default_clone_base(),
        }
    }
}

impl ReposConfiguration {
    fn resolve_paths(&mut self, base: &std::path::Path) {
        if self.root.is_relative() {
            self.root = base.join(&self.root);
        }
    }
}

fn default_repos_root() -> PathBuf {
    PathBuf::from("data/repos")
}

fn default_clone_base() -> String {
    "https://github.com".into()
}

/// Container engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfiguration {
    /// Engine socket; works against root or rootless daemons
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Cap on concurrent engine API calls issued by the adapter
    #[serde(default = "default_engine_concurrency")]
    pub engine_concurrency: usize,
}

impl Default for DockerConfiguration {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            engine_concurrency: default_engine_concurrency(),
        }
    }
}

fn default_socket_path() -> String {
    "/var/run/docker.sock".into()
}

fn default_engine_concurrency() -> usize {
    8
}

/// Work-queue configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfiguration {
    /// Redelivery window for dispatched builds; must exceed the max
    /// build timeout
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
}

impl Default for QueueConfiguration {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: default_visibility_timeout(),
        }
    }
}

fn default_visibility_timeout() -> u64 {
    // 2x the default max build timeout
    2 * default_max_timeout() * 60
}

/// Retention sweeper configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfiguration {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfiguration {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    300
}

/// Commit-status provider endpoint configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderConfiguration {
    /// Base URL of the commit-status API; empty disables reporting
    #[serde(default)]
    pub url: String,

    /// Bearer token for the provider API
    #[serde(default)]
    pub token: String,

    /// Public base URL used to build target links in statuses
    #[serde(default)]
    pub dashboard_url: String,

    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn default_provider_timeout() -> u64 {
    15
}

impl ProviderConfiguration {
    pub fn enabled(&self) -> bool {
        !self.url.is_empty()
    }
}

/// Secret vault configuration
#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfiguration {
    /// Environment variable holding the vault passphrase
    #[serde(default = "default_passphrase_env")]
    pub passphrase_env: String,
}

impl Default for VaultConfiguration {
    fn default() -> Self {
        Self {
            passphrase_env: default_passphrase_env(),
        }
    }
}

fn default_passphrase_env() -> String {
    "ANVIL_VAULT_PASSPHRASE".into()
}
