//! Worker configuration.
//!
//! Resolution order per field: TOML file overrides CLI, environment fills
//! remaining secrets. Validation fails fast at startup; a worker that
//! cannot reach its feed or stores should never enter the scheduler.

mod file_config;

pub use file_config::{
    CadenceConfig, FileConfig, MediaConfig, ObjectStoreConfig, RetentionConfig,
};

use std::time::Duration;

use anyhow::{bail, Result};

use crate::model::ResourceKind;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// CLI arguments eligible for config resolution; mirrors the clap surface
/// in `main.rs`.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub feed_base_url: Option<String>,
    pub originating_system: Option<String>,
    pub database_url: Option<String>,
    pub database_pool_size: Option<u32>,
}

/// Remote feed access.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub base_url: String,
    pub token: String,
    pub originating_system: String,
}

/// Relational store access.
#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: String,
    pub pool_size: u32,
}

/// S3-compatible object store access plus the public CDN domain.
#[derive(Debug, Clone)]
pub struct ObjectStoreSettings {
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint_url: Option<String>,
    pub public_domain: String,
}

/// Media download behavior.
#[derive(Debug, Clone)]
pub struct MediaSettings {
    /// Background downloader in-flight ceiling.
    pub concurrency: usize,
    /// Per-record ceiling for inline refresh downloads.
    pub inline_concurrency: usize,
    /// Background downloader retry budget before `failed`.
    pub max_retries: i32,
    pub bandwidth_soft_cap_gib: f64,
    pub bandwidth_hard_cap_gib: f64,
}

impl MediaSettings {
    pub fn soft_cap_bytes(&self) -> u64 {
        (self.bandwidth_soft_cap_gib * GIB) as u64
    }

    pub fn hard_cap_bytes(&self) -> u64 {
        (self.bandwidth_hard_cap_gib * GIB) as u64
    }
}

impl Default for MediaSettings {
    fn default() -> Self {
        Self {
            concurrency: 15,
            inline_concurrency: 4,
            max_retries: 5,
            bandwidth_soft_cap_gib: 3.5,
            bandwidth_hard_cap_gib: 4.0,
        }
    }
}

/// Per-resource loop cadences, in seconds.
#[derive(Debug, Clone)]
pub struct CadenceSettings {
    pub listing_secs: u64,
    pub member_secs: u64,
    pub office_secs: u64,
    pub open_house_secs: u64,
    pub lookup_secs: u64,
}

impl CadenceSettings {
    pub fn for_resource(&self, resource: ResourceKind) -> Duration {
        let secs = match resource {
            ResourceKind::Listing => self.listing_secs,
            ResourceKind::Member => self.member_secs,
            ResourceKind::Office => self.office_secs,
            ResourceKind::OpenHouse => self.open_house_secs,
            ResourceKind::Lookup => self.lookup_secs,
        };
        Duration::from_secs(secs)
    }
}

impl Default for CadenceSettings {
    fn default() -> Self {
        Self {
            listing_secs: 60,
            member_secs: 300,
            office_secs: 300,
            open_house_secs: 300,
            lookup_secs: 86_400,
        }
    }
}

/// Retention windows for the daily maintenance pass.
#[derive(Debug, Clone)]
pub struct RetentionSettings {
    /// Request-log and media-audit rows older than this are pruned.
    pub request_log_days: u64,
    /// Soft-hidden listings older than this are hard-deleted.
    pub hidden_purge_days: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            request_log_days: 90,
            hidden_purge_days: 30,
        }
    }
}

/// Fully-resolved worker configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub feed: FeedSettings,
    pub database: DatabaseSettings,
    pub object_store: ObjectStoreSettings,
    pub media: MediaSettings,
    pub cadence: CadenceSettings,
    pub retention: RetentionSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML config.
    /// TOML values override CLI values where present; secrets may also come
    /// from `FEED_TOKEN`, `DATABASE_URL`, `AWS_ACCESS_KEY_ID` and
    /// `AWS_SECRET_ACCESS_KEY`.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let base_url = file
            .feed_base_url
            .or_else(|| cli.feed_base_url.clone())
            .unwrap_or_default();
        if base_url.is_empty() {
            bail!("feed_base_url must be set via --feed-base-url or the config file");
        }

        let token = file
            .feed_token
            .or_else(|| std::env::var("FEED_TOKEN").ok())
            .unwrap_or_default();
        if token.is_empty() {
            bail!("feed_token must be set in the config file or via FEED_TOKEN");
        }

        let originating_system = file
            .originating_system
            .or_else(|| cli.originating_system.clone())
            .unwrap_or_default();
        if originating_system.is_empty() {
            bail!("originating_system must be set via --originating-system or the config file");
        }

        let database_url = file
            .database_url
            .or_else(|| cli.database_url.clone())
            .or_else(|| std::env::var("DATABASE_URL").ok())
            .unwrap_or_default();
        if database_url.is_empty() {
            bail!("database_url must be set via --database-url, the config file, or DATABASE_URL");
        }
        let pool_size = file
            .database_pool_size
            .or(cli.database_pool_size)
            .unwrap_or(10);
        if pool_size == 0 {
            bail!("database_pool_size must be at least 1");
        }

        let os_file = file.object_store.unwrap_or_default();
        let bucket = os_file.bucket.unwrap_or_default();
        if bucket.is_empty() {
            bail!("object_store.bucket must be set in the config file");
        }
        let public_domain = os_file.public_domain.unwrap_or_default();
        if public_domain.is_empty() {
            bail!("object_store.public_domain must be set in the config file");
        }
        let access_key_id = os_file
            .access_key_id
            .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok())
            .unwrap_or_default();
        let secret_access_key = os_file
            .secret_access_key
            .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok())
            .unwrap_or_default();
        if access_key_id.is_empty() || secret_access_key.is_empty() {
            bail!("object store credentials must be set in the config file or AWS_* variables");
        }

        let media_file = file.media.unwrap_or_default();
        let media_defaults = MediaSettings::default();
        let media = MediaSettings {
            concurrency: media_file.concurrency.unwrap_or(media_defaults.concurrency),
            inline_concurrency: media_file
                .inline_concurrency
                .unwrap_or(media_defaults.inline_concurrency),
            max_retries: media_file.max_retries.unwrap_or(media_defaults.max_retries),
            bandwidth_soft_cap_gib: media_file
                .bandwidth_soft_cap_gib
                .unwrap_or(media_defaults.bandwidth_soft_cap_gib),
            bandwidth_hard_cap_gib: media_file
                .bandwidth_hard_cap_gib
                .unwrap_or(media_defaults.bandwidth_hard_cap_gib),
        };
        if media.concurrency == 0 || media.inline_concurrency == 0 {
            bail!("media concurrency settings must be at least 1");
        }
        if media.bandwidth_soft_cap_gib > media.bandwidth_hard_cap_gib {
            bail!(
                "media bandwidth soft cap ({} GiB) exceeds hard cap ({} GiB)",
                media.bandwidth_soft_cap_gib,
                media.bandwidth_hard_cap_gib
            );
        }

        let cadence_file = file.cadence.unwrap_or_default();
        let cadence_defaults = CadenceSettings::default();
        let cadence = CadenceSettings {
            listing_secs: cadence_file.listing_secs.unwrap_or(cadence_defaults.listing_secs),
            member_secs: cadence_file.member_secs.unwrap_or(cadence_defaults.member_secs),
            office_secs: cadence_file.office_secs.unwrap_or(cadence_defaults.office_secs),
            open_house_secs: cadence_file
                .open_house_secs
                .unwrap_or(cadence_defaults.open_house_secs),
            lookup_secs: cadence_file.lookup_secs.unwrap_or(cadence_defaults.lookup_secs),
        };
        for resource in ResourceKind::ALL {
            if cadence.for_resource(resource).is_zero() {
                bail!("cadence for {resource} must be at least 1 second");
            }
        }

        let retention_file = file.retention.unwrap_or_default();
        let retention_defaults = RetentionSettings::default();
        let retention = RetentionSettings {
            request_log_days: retention_file
                .request_log_days
                .unwrap_or(retention_defaults.request_log_days),
            hidden_purge_days: retention_file
                .hidden_purge_days
                .unwrap_or(retention_defaults.hidden_purge_days),
        };

        Ok(Self {
            feed: FeedSettings {
                base_url,
                token,
                originating_system,
            },
            database: DatabaseSettings {
                url: database_url,
                pool_size,
            },
            object_store: ObjectStoreSettings {
                bucket,
                region: os_file.region.unwrap_or_else(|| "us-east-1".to_string()),
                access_key_id,
                secret_access_key,
                endpoint_url: os_file.endpoint_url,
                public_domain,
            },
            media,
            cadence,
            retention,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_file_config() -> FileConfig {
        FileConfig {
            feed_base_url: Some("https://api.example.test/v2".into()),
            feed_token: Some("tok".into()),
            originating_system: Some("abc".into()),
            database_url: Some("postgres://localhost/mirror".into()),
            database_pool_size: Some(8),
            object_store: Some(ObjectStoreConfig {
                bucket: Some("listing-media".into()),
                region: Some("us-west-2".into()),
                access_key_id: Some("AKIA".into()),
                secret_access_key: Some("secret".into()),
                endpoint_url: None,
                public_domain: Some("media.example.com".into()),
            }),
            media: None,
            cadence: None,
            retention: None,
        }
    }

    #[test]
    fn test_resolve_from_file() {
        let config = AppConfig::resolve(&CliConfig::default(), Some(full_file_config())).unwrap();
        assert_eq!(config.feed.base_url, "https://api.example.test/v2");
        assert_eq!(config.database.pool_size, 8);
        assert_eq!(config.object_store.region, "us-west-2");
        assert_eq!(config.media.concurrency, 15);
        assert_eq!(config.cadence.listing_secs, 60);
        assert_eq!(config.retention.hidden_purge_days, 30);
    }

    #[test]
    fn test_file_overrides_cli() {
        let cli = CliConfig {
            feed_base_url: Some("https://cli.example.test".into()),
            originating_system: Some("cli".into()),
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli, Some(full_file_config())).unwrap();
        assert_eq!(config.feed.base_url, "https://api.example.test/v2");
        assert_eq!(config.feed.originating_system, "abc");
    }

    #[test]
    fn test_missing_feed_url_fails_fast() {
        let mut file = full_file_config();
        file.feed_base_url = None;
        let result = AppConfig::resolve(&CliConfig::default(), Some(file));
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("feed_base_url"));
    }

    #[test]
    fn test_soft_cap_above_hard_cap_rejected() {
        let mut file = full_file_config();
        file.media = Some(MediaConfig {
            bandwidth_soft_cap_gib: Some(5.0),
            bandwidth_hard_cap_gib: Some(4.0),
            ..Default::default()
        });
        let result = AppConfig::resolve(&CliConfig::default(), Some(file));
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_cadence_rejected() {
        let mut file = full_file_config();
        file.cadence = Some(CadenceConfig {
            listing_secs: Some(0),
            ..Default::default()
        });
        assert!(AppConfig::resolve(&CliConfig::default(), Some(file)).is_err());
    }

    #[test]
    fn test_gib_conversion() {
        let media = MediaSettings::default();
        assert_eq!(media.hard_cap_bytes(), 4 * 1024 * 1024 * 1024);
        assert_eq!(media.soft_cap_bytes(), 3_758_096_384);
    }

    #[test]
    fn test_cadence_lookup() {
        let cadence = CadenceSettings::default();
        assert_eq!(
            cadence.for_resource(ResourceKind::Listing),
            Duration::from_secs(60)
        );
        assert_eq!(
            cadence.for_resource(ResourceKind::Lookup),
            Duration::from_secs(86_400)
        );
    }
}
