use chrono::{Duration, Utc};
use tracing::{debug, info};

use crate::breadcrumb::{Breadcrumb, ScrapeResult, TIMESTAMP};
use crate::error::Result;
use crate::fetch::Fetcher;
use crate::parser;

/// Follows one breadcrumb: staleness check, fetch, stage parser.
pub struct ActsScraper {
    fetcher: Fetcher,
    max_age: Option<Duration>,
}

impl ActsScraper {
    /// `max_age` of `None` processes every breadcrumb regardless of age.
    pub fn new(fetcher: Fetcher, max_age: Option<Duration>) -> Self {
        Self { fetcher, max_age }
    }

    pub async fn scrape(&self, crumb: &Breadcrumb) -> Result<ScrapeResult> {
        let stage = crumb.stage()?;

        if let (Some(max_age), Some(stamped)) = (self.max_age, crumb.attrs.timestamp()?) {
            if Utc::now() - stamped > max_age {
                debug!(url = %crumb.url, %stage, timestamp = %stamped, "Skipping stale breadcrumb");
                return Ok(ScrapeResult::empty());
            }
        }

        info!(url = %crumb.url, %stage, "Following breadcrumb");
        let page = self.fetcher.fetch(&crumb.url).await?;
        let attrs = crumb.attrs.with(TIMESTAMP, page.fetched_at.to_rfc3339());
        parser::parse(stage, &page, &attrs)
    }
}
