use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub feed_base_url: Option<String>,
    pub feed_token: Option<String>,
    pub originating_system: Option<String>,
    pub database_url: Option<String>,
    pub database_pool_size: Option<u32>,

    // Feature configs
    pub object_store: Option<ObjectStoreConfig>,
    pub media: Option<MediaConfig>,
    pub cadence: Option<CadenceConfig>,
    pub retention: Option<RetentionConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ObjectStoreConfig {
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub public_domain: Option<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct MediaConfig {
    pub concurrency: Option<usize>,
    pub inline_concurrency: Option<usize>,
    pub max_retries: Option<i32>,
    pub bandwidth_soft_cap_gib: Option<f64>,
    pub bandwidth_hard_cap_gib: Option<f64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct CadenceConfig {
    pub listing_secs: Option<u64>,
    pub member_secs: Option<u64>,
    pub office_secs: Option<u64>,
    pub open_house_secs: Option<u64>,
    pub lookup_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RetentionConfig {
    pub request_log_days: Option<u64>,
    pub hidden_purge_days: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path:?}"))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {path:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_full_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
feed_base_url = "https://api.example.test/v2"
originating_system = "abc"
database_url = "postgres://localhost/mirror"

[object_store]
bucket = "listing-media"
region = "us-west-2"
public_domain = "media.example.com"

[media]
concurrency = 20
bandwidth_hard_cap_gib = 8.0

[cadence]
listing_secs = 30
"#
        )
        .unwrap();

        let config = FileConfig::load(file.path()).unwrap();
        assert_eq!(
            config.feed_base_url.as_deref(),
            Some("https://api.example.test/v2")
        );
        assert_eq!(
            config.object_store.as_ref().unwrap().bucket.as_deref(),
            Some("listing-media")
        );
        let media = config.media.unwrap();
        assert_eq!(media.concurrency, Some(20));
        assert_eq!(media.bandwidth_hard_cap_gib, Some(8.0));
        // Unspecified fields stay None so defaults apply downstream.
        assert!(media.bandwidth_soft_cap_gib.is_none());
        assert_eq!(config.cadence.unwrap().listing_secs, Some(30));
        assert!(config.retention.is_none());
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "feed_base_url = [not valid").unwrap();
        assert!(FileConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = FileConfig::load(Path::new("/nonexistent/gridmirror.toml"));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Failed to read"));
    }
}
