use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tidings::config::Config;
use tidings::feed::FeedFetcher;
use tidings::service::{AddFeedRequest, FeedService, PullFeedsRequest};
use tidings::storage::{Database, EntryEditOp, PullResult};

#[derive(Parser)]
#[command(name = "tidings", version, about = "Feed aggregation service")]
struct Cli {
    /// Path to the SQLite database (overrides the config file).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Subscribe to a feed URL.
    Add {
        url: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// May be given multiple times.
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        star: bool,
    },
    /// List subscribed feeds.
    List,
    /// Pull feeds and report per-feed results as they complete.
    Pull {
        /// Feed ids to pull; pulls everything when omitted.
        ids: Vec<i64>,
        /// Overall deadline in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Delete feeds by id.
    Delete { ids: Vec<i64> },
    /// List a feed's entries.
    Entries { feed_id: i64 },
    /// Mark entries as read.
    MarkRead { ids: Vec<i64> },
    /// Import subscriptions from an OPML file.
    Import { path: PathBuf },
    /// Export subscriptions as OPML to stdout.
    Export {
        #[arg(long)]
        title: Option<String>,
    },
    /// Show subscription statistics.
    Stats,
    /// Show build information.
    Info,
}

fn config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("tidings"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let dir = config_dir()?;
    let config = Config::load(&dir.join("config.toml")).context("Failed to load config")?;

    let db_path = match (&cli.db, config.db_path.as_str()) {
        (Some(path), _) => path.clone(),
        (None, "") => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            dir.join("tidings.db")
        }
        (None, path) => PathBuf::from(path),
    };
    let db_path = db_path
        .to_str()
        .context("Database path is not valid UTF-8")?;

    let db = Database::open(db_path)
        .await
        .with_context(|| format!("Failed to open database at {db_path}"))?;
    let fetcher = Arc::new(FeedFetcher::new(
        Duration::from_secs(config.fetch_timeout_secs),
        config.max_feed_size_bytes as usize,
    ));
    let service = FeedService::new(db, fetcher);

    match cli.command {
        Command::Add {
            url,
            title,
            description,
            tags,
            star,
        } => {
            let feed = service
                .add_feed(AddFeedRequest {
                    url,
                    title,
                    description,
                    tags,
                    is_starred: star,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&feed)?);
        }
        Command::List => {
            let feeds = service.list_feeds().await?;
            println!("{}", serde_json::to_string_pretty(&feeds)?);
        }
        Command::Pull { ids, timeout } => {
            let feed_ids = if ids.is_empty() { None } else { Some(ids) };
            let mut rx = service.pull_feeds(PullFeedsRequest {
                feed_ids,
                timeout_secs: timeout,
            });
            let mut failures = 0usize;
            while let Some(result) = rx.recv().await {
                match result {
                    PullResult::Success(feed) => {
                        println!(
                            "pulled {} ({} changed entries)",
                            feed.feed_url,
                            feed.entries.len()
                        );
                    }
                    PullResult::Failure { url, error, .. } => {
                        failures += 1;
                        eprintln!("failed {url}: {error}");
                    }
                    PullResult::Aborted(error) => {
                        anyhow::bail!("pull aborted: {error}");
                    }
                }
            }
            if failures > 0 {
                anyhow::bail!("{failures} feed(s) failed to pull");
            }
        }
        Command::Delete { ids } => {
            service.delete_feeds(&ids).await?;
        }
        Command::Entries { feed_id } => {
            let entries = service.list_entries(feed_id).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Command::MarkRead { ids } => {
            let ops: Vec<EntryEditOp> = ids
                .into_iter()
                .map(|id| EntryEditOp {
                    id,
                    is_read: Some(true),
                })
                .collect();
            service.edit_entries(&ops).await?;
        }
        Command::Import { path } => {
            let payload = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let outcome = service.import_opml(&payload).await?;
            println!(
                "imported {} of {} feeds",
                outcome.num_imported, outcome.num_processed
            );
        }
        Command::Export { title } => {
            let opml = service.export_opml(title.as_deref()).await?;
            println!("{opml}");
        }
        Command::Stats => {
            let stats = service.get_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Info => {
            let info = service.get_info();
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }

    Ok(())
}
