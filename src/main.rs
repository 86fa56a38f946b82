mod blob;
mod breadcrumb;
mod db;
mod error;
mod fetch;
mod parser;
mod queue;
mod scrape;
mod settings;
mod spider;
mod storage;

use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::blob::FsBlobStore;
use crate::db::Datastore;
use crate::fetch::Fetcher;
use crate::queue::Queue;
use crate::scrape::ActsScraper;
use crate::settings::Settings;
use crate::spider::ActsSpider;
use crate::storage::ActsStorage;

#[derive(Parser)]
#[command(name = "acts_scraper", about = "Crawler for the Justice Laws consolidated Acts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the queue topic/subscription and the datastore schema
    Init,
    /// Publish the catalog page to start a crawl
    Trigger {
        /// Seed URL (default: configured seed_url)
        #[arg(long)]
        url: Option<String>,
    },
    /// Consume breadcrumbs from the queue
    Run {
        /// Stop once the queue is empty instead of listening until Ctrl-C
        #[arg(long)]
        drain: bool,
        /// Return from each pull immediately when nothing is available
        #[arg(long)]
        no_wait: bool,
    },
    /// Show stored act and version counts
    Stats,
    /// List the stored versions of one act
    Show {
        /// Act code, e.g. A-1
        code: String,
        /// Print the raw body of the current version
        #[arg(long)]
        body: bool,
    },
}

fn open_spider(settings: &Settings) -> anyhow::Result<ActsSpider<FsBlobStore>> {
    let fetcher = Fetcher::new(&settings.user_agent, settings.fetch_timeout())?;
    let scraper = ActsScraper::new(fetcher, settings.max_age());
    ActsSpider::new(
        Queue::open(&settings.db_path)?,
        scraper,
        open_storage(settings)?,
        settings.spider_options(),
    )
}

fn open_storage(settings: &Settings) -> anyhow::Result<ActsStorage<FsBlobStore>> {
    Ok(ActsStorage::new(
        Datastore::open(&settings.db_path)?,
        FsBlobStore::new(&settings.blob_root),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load()?;

    let result = match cli.command {
        Commands::Init => {
            open_spider(&settings)?;
            println!(
                "Ready: topic {} / subscription {} in {}",
                settings.topic,
                settings.subscription,
                settings.db_path.display()
            );
            Ok(())
        }
        Commands::Trigger { url } => {
            let spider = open_spider(&settings)?;
            let url = url.unwrap_or_else(|| settings.seed_url.clone());
            spider.seed(&url)?;
            println!("Published seed {}", url);
            Ok(())
        }
        Commands::Run { drain, no_wait } => {
            let spider = open_spider(&settings)?;
            let wait = !no_wait;
            if drain {
                let received = drain_with_spinner(&spider, wait).await?;
                let pending = spider.queue().pending(&settings.subscription)?;
                println!("Processed {} messages ({} left unacknowledged).", received, pending);
            } else {
                spider.keep_listening(wait).await?;
            }
            Ok(())
        }
        Commands::Stats => {
            let s = open_storage(&settings)?.stats()?;
            let pending = Queue::open(&settings.db_path)?.pending(&settings.subscription)?;
            println!("Acts:          {}", s.acts);
            println!("Versions:      {}", s.versions);
            println!("Open-ended:    {}", s.open_versions);
            println!("Missing blobs: {}", s.missing_blobs);
            println!("Pending:       {}", pending);
            Ok(())
        }
        Commands::Show { code, body } => show(&open_storage(&settings)?, &code, body),
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn drain_with_spinner(spider: &ActsSpider<FsBlobStore>, wait: bool) -> anyhow::Result<usize> {
    use indicatif::{ProgressBar, ProgressStyle};

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap(),
    );
    pb.set_message("Draining queue...");
    pb.enable_steady_tick(Duration::from_millis(120));

    let received = spider.drain(wait).await;
    pb.finish_and_clear();
    received
}

fn show(storage: &ActsStorage<FsBlobStore>, code: &str, body: bool) -> anyhow::Result<()> {
    let act = storage
        .act(code)?
        .with_context(|| format!("No act with code {}", code))?;
    println!("{} | {}", act.code, act.title);

    let versions = storage.versions(code)?;
    println!("{:<10} | {:<10} | {}", "Start", "End", "Blob");
    println!("{}", "-".repeat(50));
    for v in &versions {
        let end = if v.end.is_empty() { "current" } else { v.end.as_str() };
        println!("{:<10} | {:<10} | {}", v.start, end, v.raw_blob.as_deref().unwrap_or("-"));
    }

    if body {
        match versions.first() {
            Some(latest) => match storage.raw_body(latest)? {
                Some(raw) => println!("\n{}", raw),
                None => println!("\nNo body stored for {} {}", code, latest.start),
            },
            None => println!("\nNo versions stored."),
        }
    }
    Ok(())
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
