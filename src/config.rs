use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub clustering: ClusteringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the blob store.
    #[serde(default = "default_blob_root")]
    pub root: PathBuf,
}

fn default_blob_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photosift")
        .join("blobs")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_blob_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of concurrent stage workers.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Retry ceiling per (media, stage) job.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,

    /// Execution budget for a claimed job. A started job whose lease expires
    /// is presumed abandoned and requeued.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: i64,

    /// Worker sleep between empty dequeue polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Lease-expiry sweep interval.
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

fn default_worker_count() -> usize {
    4
}

fn default_max_attempts() -> i64 {
    3
}

fn default_lease_secs() -> i64 {
    600 // model inference dominates; matches a 10-minute job timeout
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_reap_interval_secs() -> u64 {
    30
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            max_attempts: default_max_attempts(),
            lease_secs: default_lease_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Minimum members for a group; smaller neighborhoods stay noise.
    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: usize,

    /// Cosine-distance neighborhood radius for density clustering.
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,

    /// Upper bound on representative members stored per cluster.
    #[serde(default = "default_max_representatives")]
    pub max_representatives: usize,

    /// If set, the daemon triggers a clustering run on this interval.
    #[serde(default)]
    pub auto_interval_secs: Option<u64>,
}

fn default_min_cluster_size() -> usize {
    2
}

fn default_epsilon() -> f32 {
    0.25
}

fn default_max_representatives() -> usize {
    8
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            min_cluster_size: default_min_cluster_size(),
            epsilon: default_epsilon(),
            max_representatives: default_max_representatives(),
            auto_interval_secs: None,
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photosift")
        .join("photosift.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            storage: StorageConfig::default(),
            pipeline: PipelineConfig::default(),
            clustering: ClusteringConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Create default config
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("photosift")
            .join("config.toml")
    }
}
