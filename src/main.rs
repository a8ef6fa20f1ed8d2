use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use feedharvest::config::Config;
use feedharvest::feed::{import_feeds, load_manifest, parse_manifest};
use feedharvest::storage::Database;
use feedharvest::tasks::{
    cleanup_old_logs, discover_new_feeds_for_all_websites, queue_active_feeds, run_worker_pool,
    Harvester, Task, TaskQueue,
};
use feedharvest::util::normalize_site_url;

const DATABASE_ENV: &str = "FEEDHARVEST_DATABASE";

/// Get the config directory path (~/.config/feedharvest/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedharvest"))
}

#[derive(Parser, Debug)]
#[command(
    name = "feedharvest",
    about = "Discover website feeds, poll them for articles and backfill article text"
)]
struct Args {
    /// Config file (default: ~/.config/feedharvest/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// SQLite database path (overrides config and FEEDHARVEST_DATABASE)
    #[arg(long, global = true, value_name = "FILE")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a website
    AddWebsite {
        url: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Register several feeds for one website from a JSON list
    AddFeeds {
        #[arg(long)]
        website_url: String,
        #[arg(long)]
        website_name: String,
        /// Inline JSON: [{"url": .., "name": .., "type": ..}]
        #[arg(long, conflicts_with = "feeds_file", required_unless_present = "feeds_file")]
        feeds_json: Option<String>,
        #[arg(long, value_name = "FILE")]
        feeds_file: Option<PathBuf>,
        /// Fetch every active feed afterwards and report whether it parses
        #[arg(long)]
        validate: bool,
    },
    /// Discover feeds and sitemaps for one website, or all active ones
    Discover {
        #[arg(conflicts_with = "all", required_unless_present = "all")]
        website_id: Option<i64>,
        #[arg(long)]
        all: bool,
    },
    /// Poll one feed, all active feeds, or the feeds of matching websites
    Fetch {
        #[arg(conflicts_with_all = ["all", "website"], required_unless_present_any = ["all", "website"])]
        feed_id: Option<i64>,
        #[arg(long, conflicts_with = "website")]
        all: bool,
        /// Website name or URL substring
        #[arg(long)]
        website: Option<String>,
    },
    /// Fetch full text for one article, or a batch of articles without content
    Backfill {
        #[arg(conflicts_with = "missing", required_unless_present = "missing")]
        article_id: Option<i64>,
        #[arg(long)]
        missing: bool,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long)]
        website: Option<String>,
    },
    /// Delete old fetch logs
    Cleanup {
        /// Days to keep (default from config)
        #[arg(long)]
        days: Option<i64>,
    },
    /// Show per-feed new-article counts
    Stats {
        #[arg(long, default_value_t = 24)]
        hours: i64,
        #[arg(long)]
        website: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("feedharvest=info")),
        )
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = match (&args.database, std::env::var_os(DATABASE_ENV)) {
        (Some(path), _) => path.clone(),
        (None, Some(env)) => PathBuf::from(env),
        (None, None) => {
            ensure_config_dir(&config_dir)?;
            config.database_path_in(&config_dir)
        }
    };
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = Database::open(db_path_str)
        .await
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

    let harvester = Harvester::new(db.clone(), &config).context("Failed to build HTTP client")?;
    let concurrency = config.pipeline.concurrency;

    match args.command {
        Command::AddWebsite { url, name } => {
            let url = normalize_site_url(&url);
            let name = name.unwrap_or_else(|| default_site_name(&url));
            let (website, created) = db.get_or_create_website(&url, &name).await?;
            if created {
                println!("Created website: {} (id {})", website.name, website.id);
            } else {
                println!("Website already exists: {} (id {})", website.name, website.id);
            }
        }

        Command::AddFeeds {
            website_url,
            website_name,
            feeds_json,
            feeds_file,
            validate,
        } => {
            let entries = match (feeds_json, feeds_file) {
                (Some(json), _) => parse_manifest(&json)?,
                (None, Some(path)) => load_manifest(&path)?,
                (None, None) => bail!("Either --feeds-json or --feeds-file must be provided"),
            };
            let report = import_feeds(&db, &website_url, &website_name, &entries).await?;
            if report.website_created {
                println!("Created new website: {}", report.website.name);
            } else {
                println!("Website already exists: {}", report.website.name);
            }
            println!("{}", report.summary());

            if validate {
                println!("Validating feeds...");
                for (feed, valid) in harvester.validate_website_feeds(report.website.id).await? {
                    let mark = if valid { "Valid" } else { "Invalid" };
                    println!("  {}: {}", mark, feed.display_name());
                }
            }
        }

        Command::Discover { website_id, all } => {
            if all {
                let (tx, rx) = mpsc::unbounded_channel();
                println!("{}", discover_new_feeds_for_all_websites(&db, &tx).await);
                drop(tx);
                print_results(run_worker_pool(harvester, rx, concurrency).await);
            } else if let Some(id) = website_id {
                println!("{}", harvester.discover_feeds_for_website(id).await);
            }
        }

        Command::Fetch {
            feed_id,
            all,
            website,
        } => {
            if let Some(id) = feed_id {
                println!("{}", harvester.fetch_feed_content(id).await);
            } else {
                let filter = if all { None } else { website.as_deref() };
                let (tx, rx) = mpsc::unbounded_channel();
                println!("{}", queue_active_feeds(&db, &tx, filter).await);
                drop(tx);
                print_results(run_worker_pool(harvester, rx, concurrency).await);
            }
        }

        Command::Backfill {
            article_id,
            missing,
            limit,
            website,
        } => {
            if missing {
                let summary = harvester
                    .backfill_missing_content(limit, website.as_deref())
                    .await?;
                println!("{}", summary.summary());
            } else if let Some(id) = article_id {
                let (tx, rx) = mpsc::unbounded_channel();
                tx.enqueue(Task::FetchArticle(id))?;
                drop(tx);
                print_results(run_worker_pool(harvester, rx, 1).await);
            }
        }

        Command::Cleanup { days } => {
            let days = days.unwrap_or(config.pipeline.log_retention_days);
            println!("{}", cleanup_old_logs(&db, days).await);
        }

        Command::Stats { hours, website } => {
            let since = chrono::Utc::now().timestamp() - hours.max(0).saturating_mul(3600);
            let counts = db.recent_article_counts(since, website.as_deref()).await?;
            if counts.is_empty() {
                println!("No new articles in the last {} hours", hours);
            }
            let total: i64 = counts.iter().map(|c| c.count).sum();
            for c in &counts {
                println!(
                    "{:>6}  {} / {}",
                    c.count,
                    c.website_name,
                    c.feed_title.as_deref().unwrap_or(&c.feed_url)
                );
            }
            if !counts.is_empty() {
                println!("{:>6}  total across {} feeds", total, counts.len());
            }
        }
    }

    Ok(())
}

fn print_results(results: Vec<(Task, String)>) {
    for (task, summary) in results {
        println!("{:?}: {}", task, summary);
    }
}

/// Host of the URL, used when no website name is given.
fn default_site_name(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_owned()))
        .unwrap_or_else(|| url.to_owned())
}

fn ensure_config_dir(config_dir: &Path) -> Result<()> {
    if config_dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(config_dir).context("Failed to create config directory")?;

    // SEC-007: Set directory permissions on Unix (user-only access)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(config_dir, std::fs::Permissions::from_mode(0o700))
        {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }
    Ok(())
}
