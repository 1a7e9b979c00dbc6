use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

use dfip::api::{AlertFilters, CachedApiClient, DEFAULT_CAMERA_PEOPLE_LIMIT, DEFAULT_DAYS};
use dfip::config::Config;
use dfip::freshness::FreshnessMonitor;
use dfip::logging;

#[derive(Parser, Debug)]
#[command(name = "dfip")]
#[command(about = "Query the DFIP alert dashboard API through a local cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./dfip.yaml or $XDG_CONFIG_HOME/dfip/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// API base URL, overriding the config file
  #[arg(long)]
  url: Option<String>,

  /// Do not read or write the persisted cache
  #[arg(long)]
  no_persist: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Headline counters
  Stats,
  /// Daily alert counts
  OverTime {
    #[arg(long, default_value_t = DEFAULT_DAYS)]
    days: u32,
  },
  /// List alerts, newest first
  Alerts {
    #[arg(long)]
    level: Option<String>,
    #[arg(long)]
    camera: Option<String>,
    #[arg(long)]
    person: Option<String>,
    /// Match against the alert message
    #[arg(long)]
    search: Option<String>,
    /// ISO 8601 lower bound
    #[arg(long)]
    start: Option<String>,
    /// ISO 8601 upper bound
    #[arg(long)]
    end: Option<String>,
    /// Number of pages to load
    #[arg(long, default_value_t = 1)]
    pages: u32,
  },
  /// List people
  People,
  /// One person with the cameras and levels they were seen with
  Person { id: String },
  /// Images of one person
  PersonImages { id: String },
  /// List cameras
  Cameras,
  /// People seen by one camera
  CameraPeople {
    id: String,
    #[arg(long, default_value_t = DEFAULT_CAMERA_PEOPLE_LIMIT)]
    limit: u32,
  },
  /// Metadata and URLs for an image
  Image { image_id: String },
  /// Poll for new data until interrupted
  Watch,
  /// Show or clear the local cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// List cached entries
  Status,
  /// Drop every cached entry, in memory and on disk
  Clear,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageOutput<T> {
  #[serde(flatten)]
  metadata: T,
  bytes_url: String,
  thumb_url: String,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let out =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to encode output: {}", e))?;
  println!("{}", out);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Logging is best-effort; the CLI works without a writable data dir
  let _guard = logging::init().ok();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(url) = args.url {
    config.api.url = url;
  }
  if args.no_persist {
    config.cache.persist = false;
  }

  let client = CachedApiClient::from_config(&config)?;
  info!(url = %config.api.url, command = ?args.command, "starting");

  match args.command {
    Command::Stats => print_json(&client.stats().await?)?,
    Command::OverTime { days } => print_json(&client.stats_over_time(days).await?)?,
    Command::Alerts {
      level,
      camera,
      person,
      search,
      start,
      end,
      pages,
    } => {
      let filters = AlertFilters {
        level,
        camera_id: camera,
        person_id: person,
        message_search: search,
        start_time: start,
        end_time: end,
      };
      let paginator = client.alerts(&filters);
      paginator.ensure_fresh().await?;
      for _ in 1..pages {
        if !paginator.fetch_more().await? {
          break;
        }
      }
      print_json(&paginator.items())?;
    }
    Command::People => print_json(&client.people().await?)?,
    Command::Person { id } => print_json(&client.person(&id).await?)?,
    Command::PersonImages { id } => print_json(&client.person_images(&id).await?)?,
    Command::Cameras => print_json(&client.cameras().await?)?,
    Command::CameraPeople { id, limit } => print_json(&client.camera_people(&id, limit).await?)?,
    Command::Image { image_id } => {
      let metadata = client
        .image_metadata(Some(image_id.as_str()))
        .await?
        .ok_or_else(|| eyre!("Image id is empty"))?;
      let output = ImageOutput {
        bytes_url: client.api().image_bytes_url(&metadata.id)?.to_string(),
        thumb_url: client.api().image_thumb_url(&metadata.id)?.to_string(),
        metadata,
      };
      print_json(&output)?;
    }
    Command::Watch => watch(&client, &config).await?,
    Command::Cache { action } => match action {
      CacheAction::Status => {
        let now = client.cache().now();
        let mut entries = client.cache().entries();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        for entry in entries {
          let age = entry
            .age(now)
            .map(|a| format!("{}s", a.num_seconds()))
            .unwrap_or_else(|| "-".to_string());
          let freshness = if entry.is_stale(now) { "stale" } else { "fresh" };
          println!(
            "{:<60} {:<8} {:<6} {}",
            entry.key.description(),
            format!("{:?}", entry.status).to_lowercase(),
            freshness,
            age
          );
        }
      }
      CacheAction::Clear => {
        let count = client.cache().len();
        client.cache().clear();
        println!("Cleared {} cached entries", count);
      }
    },
  }

  Ok(())
}

/// Keep the headline resources loaded and report whenever newer data is
/// likely available, refreshing on each signal.
async fn watch(client: &CachedApiClient, config: &Config) -> Result<()> {
  load_headlines(client).await?;

  let gc_period = config.cache.cache_config().gc_time.to_std().unwrap_or_default();
  let gc = client.cache().spawn_gc(gc_period);
  let mut monitor =
    FreshnessMonitor::spawn(client.cache().clone(), config.freshness.freshness_config());
  let mut signal = monitor.subscribe();
  println!("Watching {} (Ctrl-C to stop)", config.api.url);

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      changed = signal.changed() => {
        if changed.is_err() {
          break;
        }
        if !*signal.borrow_and_update() {
          continue;
        }
        println!("New data available, refreshing");
        monitor.refresh().await;
        monitor.acknowledge();
        load_headlines(client).await?;
      }
    }
  }

  monitor.stop().await;
  gc.stop().await;
  Ok(())
}

async fn load_headlines(client: &CachedApiClient) -> Result<()> {
  let stats = client.stats().await?;
  let cameras = client.cameras().await?;
  let people = client.people().await?;
  let alerts = client.alerts(&AlertFilters::default());
  alerts.ensure_fresh().await?;

  println!(
    "{} alerts ({} in 24h), {} people, {} cameras",
    stats.total_alerts,
    stats.alerts_24h,
    people.len(),
    cameras.len()
  );
  Ok(())
}
