use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use post_upload_service::config::{self, Config};
use post_upload_service::database::SqliteStore;
use post_upload_service::uploader::{Coordinator, HttpTransport, LogNotifier};
use post_upload_service::{MediaItem, MediaStore, PlaceholderRewriter, Post, PostStore};

/// Upload the posts and media listed in a manifest, then exit.
#[derive(Parser, Debug)]
#[command(name = "post-upload-service")]
#[command(version)]
struct Args {
    /// Path to the configuration file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite database URL (defaults to the user data directory)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// JSON manifest: {"posts": [...], "media": [...]}
    manifest: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Manifest {
    posts: Vec<Post>,
    media: Vec<MediaItem>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => config::get_config_path()?,
    };
    let migrated = config::migrate_config_at(&config_path);
    let config = config::load_config_from(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    init_logging(&config);
    log::info!("Starting post upload service");
    if let Err(e) = migrated {
        log::error!("Failed to migrate configuration: {}", e);
    }

    let manifest_text = std::fs::read_to_string(&args.manifest)
        .with_context(|| format!("reading manifest {}", args.manifest.display()))?;
    let manifest: Manifest =
        serde_json::from_str(&manifest_text).context("parsing upload manifest")?;

    let store = match &args.database_url {
        Some(url) => SqliteStore::open(url).await?,
        None => SqliteStore::open_default().await?,
    };

    let leftovers = store.unfinished_media().await?;
    if !leftovers.is_empty() {
        log::warn!(
            "{} media were left queued or uploading by a previous run",
            leftovers.len()
        );
    }

    for post in &manifest.posts {
        if store.get_post(post.id).await?.is_none() {
            store.update_post(post).await?;
        }
    }
    for media in &manifest.media {
        store.update_media(media).await?;
    }

    let transport = HttpTransport::new(&config.api_base_url, config.request_timeout())?;
    let rewriter = Arc::new(PlaceholderRewriter::new()?);
    let store = Arc::new(store);

    let coordinator = Coordinator::start(
        config.coordinator_settings(),
        Arc::new(transport),
        store.clone(),
        rewriter.clone(),
        Arc::new(LogNotifier),
    );

    log::info!(
        "Enqueuing {} media and {} posts",
        manifest.media.len(),
        manifest.posts.len()
    );
    let post_ids: Vec<_> = manifest.posts.iter().map(|post| post.id).collect();
    coordinator.enqueue_media(manifest.media);
    for post in manifest.posts {
        coordinator.enqueue_post(post);
    }

    tokio::select! {
        result = coordinator.wait_until_idle() => {
            result?;
            log::info!("All uploads finished");
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted, shutting down");
        }
    }

    let snapshot = coordinator.snapshot();
    coordinator.shutdown().await?;
    log::info!("Stopped with {:?}", snapshot);

    for post_id in post_ids {
        let Some(post) = store.get_post(post_id).await? else {
            continue;
        };
        let unresolved = rewriter.unresolved_media_ids(&post.content);
        if !unresolved.is_empty() {
            log::warn!(
                "Post {} still references local media {:?}",
                post_id,
                unresolved
            );
        }
    }
    Ok(())
}

fn init_logging(config: &Config) {
    let level = log::LevelFilter::from_str(&config.log_level).unwrap_or(log::LevelFilter::Info);
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}
