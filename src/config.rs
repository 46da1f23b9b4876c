use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::AppError;

/// Default public feed for the programme, newest episodes first.
const DEFAULT_FEED_URL: &str =
    "https://api.3cat.cat/audios?programaradio_id=944&ordre=-data_publicacio";

const DEFAULT_CLASSIFIER_URL: &str = "https://api.openai.com/v1";
const DEFAULT_BATCH_SIZE: usize = 50;

/// Application configuration, loaded from a YAML file when one is given
/// and falling back to sensible defaults otherwise.
///
/// The LLM API key is deliberately not part of the file; it is read from
/// the `OPENAI_API_KEY` environment variable at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub database_path: PathBuf,
    pub feed: FeedConfig,
    pub classifier: ClassifierConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeedConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifierConfig {
    pub base_url: String,
    pub model: String,
    pub batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            feed: FeedConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_FEED_URL.to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_CLASSIFIER_URL.to_string(),
            model: crate::classifier::DEFAULT_MODEL.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl Config {
    /// Load configuration from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_yaml::from_str(&raw).map_err(|e| {
            AppError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        Ok(config)
    }
}

fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("guardia-catalog").join("catalog.db"))
        .unwrap_or_else(|| PathBuf::from("catalog.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.feed.base_url, DEFAULT_FEED_URL);
        assert_eq!(config.classifier.batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn test_partial_file_keeps_defaults_for_the_rest() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "database_path: /tmp/guardia.db").unwrap();
        writeln!(file, "classifier:").unwrap();
        writeln!(file, "  model: gpt-4o").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/guardia.db"));
        assert_eq!(config.classifier.model, "gpt-4o");
        assert_eq!(config.classifier.base_url, DEFAULT_CLASSIFIER_URL);
        assert_eq!(config.feed.base_url, DEFAULT_FEED_URL);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        std::fs::write(&path, "api_key: sk-secret\n").unwrap();

        assert!(Config::load(Some(&path)).is_err());
    }
}
