use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use url::Url;

use crate::error::{Result, ScrapeError};

/// A fetched page, addressed by the URL it was finally served from.
pub struct FetchedPage {
    pub url: Url,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

/// Loads pages over http(s), or straight from disk for `file://` URLs.
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        let url = Url::parse(url)?;
        let fetched_at = Utc::now();

        match url.scheme() {
            "http" | "https" => {
                let response = self.client.get(url).send().await?.error_for_status()?;
                let final_url = response.url().clone();
                let body = response.text().await?;
                debug!(url = %final_url, bytes = body.len(), "Fetched page");
                Ok(FetchedPage {
                    url: final_url,
                    body,
                    fetched_at,
                })
            }
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| ScrapeError::UnsupportedScheme(url.to_string()))?;
                let bytes = tokio::fs::read(&path).await?;
                let body = String::from_utf8_lossy(&bytes).into_owned();
                debug!(path = %path.display(), bytes = body.len(), "Read page from disk");
                Ok(FetchedPage {
                    url,
                    body,
                    fetched_at,
                })
            }
            other => Err(ScrapeError::UnsupportedScheme(other.to_string())),
        }
    }
}
