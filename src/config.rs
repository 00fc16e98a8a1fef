use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub docsplit: DocsplitConfig,
    #[serde(default)]
    pub splitting: SplittingConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub janitor: JanitorConfig,
    #[serde(default)]
    pub converter: Option<ConverterConfig>,
}

/// Paths and logging
#[derive(Debug, Clone, Deserialize)]
pub struct DocsplitConfig {
    /// Folder holding uploaded files; working areas are created beneath it.
    pub upload_folder: PathBuf,
    pub db_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Thresholds and chunk sizes used by the classifier, planner and writer
#[derive(Debug, Clone, Deserialize)]
pub struct SplittingConfig {
    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: u64,
    /// Pages per part; also the page-count threshold for splitting.
    #[serde(default = "default_page_chunk_size")]
    pub page_chunk_size: usize,
    /// Characters per part; also the estimated-character threshold for splitting.
    #[serde(default = "default_char_chunk_size")]
    pub char_chunk_size: usize,
    #[serde(default = "default_byte_chunk_size")]
    pub byte_chunk_size: u64,
    /// Prefix sampled to estimate the character count of text files
    #[serde(default = "default_text_sample_bytes")]
    pub text_sample_bytes: usize,
    #[serde(default = "default_read_buffer_bytes")]
    pub read_buffer_bytes: usize,
}

/// Worker pool and reconciliation policy
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_part_timeout_secs")]
    pub part_timeout_secs: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Parent becomes ERROR when the share of failed parts exceeds this ratio.
    #[serde(default = "default_error_ratio_threshold")]
    pub error_ratio_threshold: f64,
    /// Release the working area as soon as the parent is finalized.
    #[serde(default = "default_cleanup_on_completion")]
    pub cleanup_on_completion: bool,
}

/// Working-area retention and sweep cadence
#[derive(Debug, Clone, Deserialize)]
pub struct JanitorConfig {
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Remote converter endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ConverterConfig {
    pub endpoint: String,
    #[serde(default = "default_converter_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_converter_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_file_size_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_page_chunk_size() -> usize {
    10
}

fn default_char_chunk_size() -> usize {
    50_000
}

fn default_byte_chunk_size() -> u64 {
    10 * 1024 * 1024
}

fn default_text_sample_bytes() -> usize {
    64 * 1024
}

fn default_read_buffer_bytes() -> usize {
    64 * 1024
}

fn default_worker_concurrency() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores * 2
}

fn default_part_timeout_secs() -> u64 {
    300
}

fn default_retry_count() -> u32 {
    1
}

fn default_error_ratio_threshold() -> f64 {
    0.5
}

fn default_cleanup_on_completion() -> bool {
    true
}

fn default_retention_hours() -> u64 {
    24
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_converter_api_key_env() -> String {
    "DOCSPLIT_CONVERTER_KEY".to_string()
}

fn default_converter_timeout_secs() -> u64 {
    120
}

impl Default for SplittingConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: default_max_file_size_bytes(),
            page_chunk_size: default_page_chunk_size(),
            char_chunk_size: default_char_chunk_size(),
            byte_chunk_size: default_byte_chunk_size(),
            text_sample_bytes: default_text_sample_bytes(),
            read_buffer_bytes: default_read_buffer_bytes(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: default_worker_concurrency(),
            part_timeout_secs: default_part_timeout_secs(),
            retry_count: default_retry_count(),
            error_ratio_threshold: default_error_ratio_threshold(),
            cleanup_on_completion: default_cleanup_on_completion(),
        }
    }
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            retention_hours: default_retention_hours(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl ProcessingConfig {
    pub fn part_timeout(&self) -> Duration {
        Duration::from_secs(self.part_timeout_secs)
    }
}

impl JanitorConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in DOCSPLIT_CONFIG environment variable
    /// 2. ./config.toml in current directory
    pub fn load() -> Result<Self> {
        // .env is optional
        let _ = dotenv::dotenv();

        let config_path = std::env::var("DOCSPLIT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        Self::load_from(&config_path)
    }

    /// Load and validate configuration from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Config = toml::from_str(&config_str)
            .context("Failed to parse config.toml")?;

        config.validate()?;

        Ok(config)
    }

    /// Configuration with default tuning for the given folders
    pub fn with_paths(upload_folder: impl Into<PathBuf>, db_path: impl Into<PathBuf>) -> Self {
        Self {
            docsplit: DocsplitConfig {
                upload_folder: upload_folder.into(),
                db_path: db_path.into(),
                log_level: default_log_level(),
            },
            splitting: SplittingConfig::default(),
            processing: ProcessingConfig::default(),
            janitor: JanitorConfig::default(),
            converter: None,
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let folder = &self.docsplit.upload_folder;
        if folder.exists() && !folder.is_dir() {
            anyhow::bail!(
                "upload_folder must be a directory, not a file: {}",
                folder.display()
            );
        }
        std::fs::create_dir_all(folder)
            .with_context(|| format!("Failed to create upload_folder: {}", folder.display()))?;

        let s = &self.splitting;
        if s.max_file_size_bytes == 0 {
            anyhow::bail!("splitting.max_file_size_bytes must be greater than 0");
        }
        if s.page_chunk_size == 0 {
            anyhow::bail!("splitting.page_chunk_size must be greater than 0");
        }
        if s.char_chunk_size == 0 {
            anyhow::bail!("splitting.char_chunk_size must be greater than 0");
        }
        if s.byte_chunk_size == 0 {
            anyhow::bail!("splitting.byte_chunk_size must be greater than 0");
        }
        if s.text_sample_bytes == 0 || s.read_buffer_bytes == 0 {
            anyhow::bail!("splitting.text_sample_bytes and read_buffer_bytes must be greater than 0");
        }

        let p = &self.processing;
        if p.worker_concurrency == 0 {
            anyhow::bail!("processing.worker_concurrency must be greater than 0");
        }
        if p.part_timeout_secs == 0 {
            anyhow::bail!("processing.part_timeout_secs must be greater than 0");
        }
        if !(0.0..=1.0).contains(&p.error_ratio_threshold) {
            anyhow::bail!("processing.error_ratio_threshold must be between 0.0 and 1.0");
        }

        if self.janitor.sweep_interval_secs == 0 {
            anyhow::bail!("janitor.sweep_interval_secs must be greater than 0");
        }

        if let Some(converter) = &self.converter {
            if converter.endpoint.trim().is_empty() {
                anyhow::bail!("converter.endpoint must not be empty");
            }
        }

        Ok(())
    }

    /// Get database path
    pub fn db_path(&self) -> &Path {
        &self.docsplit.db_path
    }

    /// Get the upload folder
    pub fn upload_folder(&self) -> &Path {
        &self.docsplit.upload_folder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serialize config tests that mutate process-wide env so they don't race.
    static CONFIG_TEST_LOCK: Mutex<()> = Mutex::new(());

    fn create_test_config(temp_dir: &TempDir) -> String {
        let uploads = temp_dir.path().join("uploads");
        let uploads_str = uploads.to_str().unwrap().replace('\\', "\\\\");
        format!(
            r#"
[docsplit]
upload_folder = "{}"
db_path = "./test.db"
log_level = "debug"

[splitting]
page_chunk_size = 5
char_chunk_size = 1000

[processing]
worker_concurrency = 3
retry_count = 2

[janitor]
retention_hours = 6
"#,
            uploads_str
        )
    }

    #[test]
    fn test_config_load_success() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, create_test_config(&temp_dir)).unwrap();

        let config = Config::load_from(&config_path).unwrap();
        assert_eq!(config.docsplit.log_level, "debug");
        assert_eq!(config.splitting.page_chunk_size, 5);
        assert_eq!(config.splitting.char_chunk_size, 1000);
        assert_eq!(config.splitting.max_file_size_bytes, 50 * 1024 * 1024);
        assert_eq!(config.splitting.byte_chunk_size, 10 * 1024 * 1024);
        assert_eq!(config.processing.worker_concurrency, 3);
        assert_eq!(config.processing.retry_count, 2);
        assert_eq!(config.janitor.retention_hours, 6);
        assert_eq!(config.janitor.sweep_interval_secs, 3600);
        assert!(config.converter.is_none());
        assert!(config.upload_folder().is_dir());
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::with_paths("/tmp/uploads", "/tmp/docsplit.db");
        assert_eq!(config.splitting.page_chunk_size, 10);
        assert_eq!(config.splitting.char_chunk_size, 50_000);
        assert_eq!(config.processing.retry_count, 1);
        assert_eq!(config.processing.error_ratio_threshold, 0.5);
        assert_eq!(config.janitor.retention(), chrono::Duration::hours(24));
        assert!(config.processing.worker_concurrency >= 2);
    }

    #[test]
    fn test_config_rejects_bad_threshold() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        let content = format!(
            "{}\n[processing]\nerror_ratio_threshold = 1.5\n",
            create_test_config(&temp_dir).replace("[processing]\nworker_concurrency = 3\nretry_count = 2\n", "")
        );
        fs::write(&config_path, content).unwrap();

        let err = Config::load_from(&config_path).unwrap_err();
        assert!(err.to_string().contains("error_ratio_threshold"));
    }

    #[test]
    fn test_config_env_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("custom.toml");
        fs::write(&config_path, create_test_config(&temp_dir)).unwrap();

        let original = std::env::var("DOCSPLIT_CONFIG").ok();
        std::env::set_var("DOCSPLIT_CONFIG", config_path.to_str().unwrap());
        let config = Config::load();
        std::env::remove_var("DOCSPLIT_CONFIG");
        if let Some(v) = original {
            std::env::set_var("DOCSPLIT_CONFIG", v);
        }
        assert!(config.is_ok(), "Config::load() failed: {:?}", config.err());
    }

    #[test]
    fn test_config_invalid_path() {
        let _lock = CONFIG_TEST_LOCK.lock().unwrap();
        let original = std::env::var("DOCSPLIT_CONFIG").ok();
        std::env::set_var("DOCSPLIT_CONFIG", "nonexistent.toml");
        let config = Config::load();
        assert!(config.is_err());
        std::env::remove_var("DOCSPLIT_CONFIG");
        if let Some(v) = original {
            std::env::set_var("DOCSPLIT_CONFIG", v);
        }
    }
}
