use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::blob::BlobStore;
use crate::breadcrumb::{ActItem, Attrs, Breadcrumb, Stage, CODE, START, TIMESTAMP};
use crate::queue::{Queue, ReceivedMessage};
use crate::scrape::ActsScraper;
use crate::storage::ActsStorage;

#[derive(Debug, Clone)]
pub struct SpiderOptions {
    pub topic: String,
    pub subscription: String,
    pub ack_deadline_secs: u64,
    pub max_messages: usize,
    pub poll_interval: Duration,
    pub pull_timeout: Duration,
}

impl Default for SpiderOptions {
    fn default() -> Self {
        Self {
            topic: "acts_requests".to_string(),
            subscription: "acts_scraper".to_string(),
            ack_deadline_secs: 60,
            max_messages: 1,
            poll_interval: Duration::from_millis(500),
            pull_timeout: Duration::from_secs(30),
        }
    }
}

/// Queue consumer: breadcrumb in, child breadcrumbs and items out.
///
/// A message is acknowledged only after its children are published and its
/// items stored, so a crash anywhere before that means redelivery.
pub struct ActsSpider<B: BlobStore> {
    queue: Queue,
    scraper: ActsScraper,
    storage: ActsStorage<B>,
    opts: SpiderOptions,
}

impl<B: BlobStore> ActsSpider<B> {
    pub fn new(queue: Queue, scraper: ActsScraper, storage: ActsStorage<B>, opts: SpiderOptions) -> Result<Self> {
        if queue.create_topic(&opts.topic)? {
            info!(topic = %opts.topic, "Created topic");
        }
        if queue.create_subscription(&opts.subscription, &opts.topic, opts.ack_deadline_secs)? {
            info!(subscription = %opts.subscription, "Created subscription");
        }
        Ok(Self {
            queue,
            scraper,
            storage,
            opts,
        })
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    #[cfg(test)]
    pub fn storage(&self) -> &ActsStorage<B> {
        &self.storage
    }

    /// Publish the catalog page as the first breadcrumb of a crawl.
    pub fn seed(&self, url: &str) -> Result<()> {
        let attrs = Attrs::new()
            .with_stage(Stage::MainPage)
            .with(TIMESTAMP, Utc::now().to_rfc3339());
        self.store_breadcrumbs(&[Breadcrumb::new(url, attrs)])?;
        info!(url, "Seeded crawl");
        Ok(())
    }

    fn store_breadcrumbs(&self, breadcrumbs: &[Breadcrumb]) -> Result<()> {
        if breadcrumbs.is_empty() {
            return Ok(());
        }
        let batch: Vec<_> = breadcrumbs
            .iter()
            .map(|b| (b.url.as_bytes().to_vec(), b.attrs.as_map().clone()))
            .collect();
        self.queue.publish_batch(&self.opts.topic, &batch)?;
        Ok(())
    }

    fn store_items(&self, items: &[ActItem]) -> Result<()> {
        for item in items {
            self.storage.store(item)?;
        }
        Ok(())
    }

    async fn pull(&self, wait: bool) -> Result<Vec<ReceivedMessage>> {
        let deadline = Instant::now() + self.opts.pull_timeout;
        loop {
            let messages = self.queue.pull(&self.opts.subscription, self.opts.max_messages)?;
            if !messages.is_empty() || !wait || Instant::now() >= deadline {
                return Ok(messages);
            }
            tokio::time::sleep(self.opts.poll_interval).await;
        }
    }

    async fn handle(&self, msg: &ReceivedMessage) -> Result<()> {
        let url = std::str::from_utf8(&msg.data).context("Message data is not a UTF-8 URL")?;
        let crumb = Breadcrumb::new(url, Attrs::from(msg.attrs.clone()));

        if self.already_stored(&crumb)? {
            debug!(url = %crumb.url, "Version already stored; not fetching");
            return Ok(());
        }

        let result = self
            .scraper
            .scrape(&crumb)
            .await
            .with_context(|| format!("Failed to scrape {}", crumb.url))?;

        self.store_breadcrumbs(&result.breadcrumbs)?;
        self.store_items(&result.items)?;
        Ok(())
    }

    /// A version page whose `(code, start)` already has a body needs no fetch.
    fn already_stored(&self, crumb: &Breadcrumb) -> Result<bool> {
        if !matches!(crumb.stage(), Ok(Stage::ActItem)) {
            return Ok(false);
        }
        match (crumb.attrs.get(CODE), crumb.attrs.get(START)) {
            (Some(code), Some(start)) => self.storage.has_version(code, start),
            _ => Ok(false),
        }
    }

    /// Process one pull's worth of messages. Returns how many arrived.
    pub async fn listen(&self, wait: bool) -> Result<usize> {
        let messages = self.pull(wait).await?;
        for msg in &messages {
            if msg.delivery_attempt > 1 {
                warn!(ack_id = %msg.ack_id, attempt = msg.delivery_attempt, "Redelivered message");
            }
            match self.handle(msg).await {
                Ok(()) => {
                    self.queue
                        .acknowledge(&self.opts.subscription, std::slice::from_ref(&msg.ack_id))?;
                }
                Err(e) => {
                    error!(ack_id = %msg.ack_id, error = %format!("{:#}", e), "Leaving message for redelivery");
                }
            }
        }
        Ok(messages.len())
    }

    /// Listen until the queue runs dry. Returns messages received.
    pub async fn drain(&self, wait: bool) -> Result<usize> {
        let mut received = 0;
        loop {
            match self.listen(wait).await? {
                0 => return Ok(received),
                n => received += n,
            }
        }
    }

    /// Listen until Ctrl-C. Queue errors are logged and retried after
    /// `poll_interval`.
    pub async fn keep_listening(&self, wait: bool) -> Result<()> {
        self.listen_until(wait, tokio::signal::ctrl_c()).await
    }

    async fn listen_until(&self, wait: bool, shutdown: impl Future<Output = std::io::Result<()>>) -> Result<()> {
        info!(subscription = %self.opts.subscription, "Starting queue listener");
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                res = &mut shutdown => {
                    res?;
                    info!("Stopping queue listener");
                    return Ok(());
                }
                received = self.listen(wait) => match received {
                    Ok(0) => tokio::time::sleep(self.opts.poll_interval).await,
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %format!("{:#}", e), "Queue listener failed; retrying");
                        tokio::time::sleep(self.opts.poll_interval).await;
                    }
                },
            }
        }
    }
}
