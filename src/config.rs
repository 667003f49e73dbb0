use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    /// Entities accumulated before a persistence flush.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Progress updates between durable ImportRun writes.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u32,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}
fn default_flush_interval() -> u32 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay before the first retry of a transient failure.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,

    /// Upper bound on the exponential backoff delay.
    #[serde(default = "default_retry_backoff_max_secs")]
    pub retry_backoff_max_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_secs: default_retry_backoff_secs(),
            retry_backoff_max_secs: default_retry_backoff_max_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_secs() -> u64 {
    60
}
fn default_retry_backoff_max_secs() -> u64 {
    600
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.ingestion.batch_size == 0 {
        anyhow::bail!("ingestion.batch_size must be > 0");
    }

    if config.ingestion.flush_interval == 0 {
        anyhow::bail!("ingestion.flush_interval must be > 0");
    }

    if config.jobs.retry_backoff_max_secs < config.jobs.retry_backoff_secs {
        anyhow::bail!("jobs.retry_backoff_max_secs must be >= jobs.retry_backoff_secs");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("shoebox.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn defaults_applied() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(&dir, "[db]\npath = \"./shoebox.db\"\n");
        let config = load_config(&path).unwrap();
        assert_eq!(config.ingestion.batch_size, 100);
        assert_eq!(config.ingestion.flush_interval, 100);
        assert_eq!(config.jobs.max_retries, 3);
    }

    #[test]
    fn zero_batch_size_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "[db]\npath = \"./shoebox.db\"\n[ingestion]\nbatch_size = 0\n",
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn inverted_backoff_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "[db]\npath = \"./shoebox.db\"\n[jobs]\nretry_backoff_secs = 120\nretry_backoff_max_secs = 60\n",
        );
        assert!(load_config(&path).is_err());
    }
}
