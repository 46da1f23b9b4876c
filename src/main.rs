use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use guardia_catalog::classifier::LlmClassifier;
use guardia_catalog::classify::ClassificationRunner;
use guardia_catalog::config::Config;
use guardia_catalog::database::{CategoryKind, Database, EpisodeWithCategories};
use guardia_catalog::error::AppError;
use guardia_catalog::feed::FeedClient;
use guardia_catalog::ingest::IngestionSyncer;

#[derive(Parser)]
#[command(name = "guardia-catalog", version, about = "Episode catalog and classification pipelines")]
struct Cli {
    /// Path to a YAML config file (defaults are used when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch new episodes from the feed down to the stored watermark
    Ingest,
    /// Classify unclassified episodes with the configured LLM
    Classify {
        /// Episodes per batch (defaults to the configured batch size)
        #[arg(long)]
        batch_size: Option<usize>,
        /// Stop after roughly this many episodes
        #[arg(long)]
        max_total: Option<usize>,
    },
    /// Ingest, then classify whatever is pending
    Run {
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        max_total: Option<usize>,
    },
    /// List episodes from the local catalog
    Episodes {
        /// Substring match against episode titles
        #[arg(long)]
        search: Option<String>,
        /// Publication order: desc (default) or asc
        #[arg(long, default_value = "desc")]
        order: String,
        /// Only episodes linked to any of these category ids
        #[arg(long, value_delimiter = ',')]
        categories: Vec<i64>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Show one episode with its categories
    Episode { id: i64 },
    /// List categories, optionally restricted to one kind
    Categories {
        /// topic, era, character or location
        #[arg(long)]
        kind: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let config = Config::load(cli.config.as_deref())?;

    if let Some(parent) = config.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AppError::Config(format!("Failed to create {}: {}", parent.display(), e)))?;
        }
    }
    let db = Arc::new(Database::new(&config.database_path)?);

    match cli.command {
        Command::Ingest => {
            ingest(&config, db).await?;
        }
        Command::Classify { batch_size, max_total } => {
            classify(&config, db, batch_size, max_total).await?;
        }
        Command::Run { batch_size, max_total } => {
            ingest(&config, Arc::clone(&db)).await?;
            classify(&config, db, batch_size, max_total).await?;
        }
        Command::Episodes { search, order, categories, limit, offset } => {
            let order_desc = match order.as_str() {
                "desc" => true,
                "asc" => false,
                other => {
                    return Err(AppError::Config(format!(
                        "Unknown order '{}' (expected asc or desc)",
                        other
                    )))
                }
            };
            let (episodes, total) =
                db.get_episodes(search.as_deref(), order_desc, &categories, limit, offset)?;
            for ep in &episodes {
                print_episode_line(ep);
            }
            println!("-- {} of {} episodes", episodes.len(), total);
        }
        Command::Episode { id } => {
            let ep = db
                .get_episode_by_id(id)?
                .ok_or_else(|| AppError::NotFound(format!("Episode {} not found", id)))?;
            print_episode_line(&ep);
            if let Some(description) = &ep.episode.description {
                println!("{}", description);
            }
        }
        Command::Categories { kind, limit, offset } => {
            let kind = kind
                .as_deref()
                .map(|k| {
                    k.parse::<CategoryKind>()
                        .map_err(|_| AppError::Config(format!("Unknown category kind '{}'", k)))
                })
                .transpose()?;
            let (categories, total) = db.get_categories(kind, limit, offset)?;
            for cat in &categories {
                println!("{:>5}  {:<10} {}", cat.id, cat.kind.to_string(), cat.name);
            }
            println!("-- {} of {} categories", categories.len(), total);
        }
    }

    Ok(())
}

async fn ingest(config: &Config, db: Arc<Database>) -> Result<(), AppError> {
    let feed = Arc::new(FeedClient::new(
        &config.feed.base_url,
        Duration::from_secs(config.feed.timeout_secs),
    ));
    let report = IngestionSyncer::new(db, feed).run().await?;
    println!(
        "Ingested {} episode(s) over {} page(s); watermark {}",
        report.ingested,
        report.pages_fetched,
        report
            .watermark
            .map(|id| id.to_string())
            .unwrap_or_else(|| "unset".to_string()),
    );
    Ok(())
}

async fn classify(
    config: &Config,
    db: Arc<Database>,
    batch_size: Option<usize>,
    max_total: Option<usize>,
) -> Result<(), AppError> {
    let api_key = std::env::var("OPENAI_API_KEY").ok();
    if api_key.is_none() {
        log::warn!("OPENAI_API_KEY is not set; requests will be unauthenticated");
    }
    let classifier = Arc::new(LlmClassifier::new(
        &config.classifier.base_url,
        Some(&config.classifier.model),
        api_key,
    ));
    let batch_size = batch_size.unwrap_or(config.classifier.batch_size).max(1);

    let report = ClassificationRunner::new(db, classifier)
        .run(batch_size, max_total)
        .await?;
    println!(
        "Classified {} episode(s): {} linked, {} failed, {} unparsed",
        report.processed, report.successful, report.failed, report.unparsed,
    );
    Ok(())
}

fn print_episode_line(ep: &EpisodeWithCategories) {
    let date = ep
        .episode
        .published_at
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "????-??-??".to_string());
    let categories: Vec<&str> = ep.categories.iter().map(|c| c.name.as_str()).collect();
    println!(
        "{:>7}  {}  {}  [{}]",
        ep.episode.id,
        date,
        ep.episode.title,
        categories.join(", "),
    );
}
