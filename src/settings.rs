use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder};
use serde::Deserialize;

use crate::spider::SpiderOptions;

pub const CONFIG_FILE: &str = "acts_scraper";
pub const ENV_PREFIX: &str = "ACTS";

/// Runtime settings: built-in defaults, then `acts_scraper.toml` if present,
/// then `ACTS_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub db_path: PathBuf,
    pub blob_root: PathBuf,
    pub seed_url: String,
    pub topic: String,
    pub subscription: String,
    pub ack_deadline_secs: u64,
    pub max_messages: usize,
    pub poll_interval_ms: u64,
    pub pull_timeout_secs: u64,
    /// 0 turns the staleness check off.
    pub max_age_hours: i64,
    pub fetch_timeout_secs: u64,
    pub user_agent: String,
}

impl Settings {
    pub fn load() -> Result<Self> {
        Self::defaults()?
            .add_source(config::File::with_name(CONFIG_FILE).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()
            .and_then(Config::try_deserialize)
            .context("Invalid configuration")
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        Ok(Config::builder()
            .set_default("db_path", "data/acts.sqlite")?
            .set_default("blob_root", "data/blobs")?
            .set_default("seed_url", "http://laws-lois.justice.gc.ca/eng/acts/")?
            .set_default("topic", "acts_requests")?
            .set_default("subscription", "acts_scraper")?
            .set_default("ack_deadline_secs", 60)?
            .set_default("max_messages", 1)?
            .set_default("poll_interval_ms", 500)?
            .set_default("pull_timeout_secs", 30)?
            .set_default("max_age_hours", 24)?
            .set_default("fetch_timeout_secs", 30)?
            .set_default("user_agent", concat!("acts_scraper/", env!("CARGO_PKG_VERSION")))?)
    }

    pub fn max_age(&self) -> Option<chrono::Duration> {
        (self.max_age_hours > 0).then(|| chrono::Duration::hours(self.max_age_hours))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn spider_options(&self) -> SpiderOptions {
        SpiderOptions {
            topic: self.topic.clone(),
            subscription: self.subscription.clone(),
            ack_deadline_secs: self.ack_deadline_secs,
            max_messages: self.max_messages.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            pull_timeout: Duration::from_secs(self.pull_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s: Settings = Settings::defaults().unwrap().build().unwrap().try_deserialize().unwrap();
        assert_eq!(s.db_path, PathBuf::from("data/acts.sqlite"));
        assert_eq!(s.seed_url, "http://laws-lois.justice.gc.ca/eng/acts/");
        assert_eq!(s.topic, "acts_requests");
        assert_eq!(s.subscription, "acts_scraper");
        assert_eq!(s.max_age(), Some(chrono::Duration::hours(24)));
        assert!(s.user_agent.starts_with("acts_scraper/"));

        let opts = s.spider_options();
        assert_eq!(opts.ack_deadline_secs, 60);
        assert_eq!(opts.poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn sources_override_defaults() {
        let s: Settings = Settings::defaults()
            .unwrap()
            .set_override("max_age_hours", 0)
            .unwrap()
            .set_override("topic", "acts_requests_test")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(s.max_age(), None);
        assert_eq!(s.topic, "acts_requests_test");
        assert_eq!(s.subscription, "acts_scraper");
    }
}
