use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use gallery_zip::bot::Bot;
use gallery_zip::cli::Args;
use gallery_zip::config::Settings;
use gallery_zip::downloader::{Downloader, HttpImageFetcher};
use gallery_zip::extractor::GalleryExtractor;
use gallery_zip::http::HttpClients;
use gallery_zip::orchestrator::Orchestrator;
use gallery_zip::packager::{Packager, ZipPackager};
use gallery_zip::registry::StrategyRegistry;
use gallery_zip::session::SessionStore;
use gallery_zip::state::ArchiveStore;
use gallery_zip::transport::ConsoleTransport;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,gallery_zip=debug".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let settings = Settings::from(&args);

    if !args.strategies.exists() {
        return Err(anyhow!("Strategy file not found: {}", args.strategies.display()));
    }
    let registry = StrategyRegistry::new();
    registry
        .load_file(&args.strategies)
        .context("Failed to load strategies")?;
    let registry = Arc::new(registry);

    let clients = HttpClients::new(settings.proxy.as_deref()).context("Failed to build HTTP client")?;
    let extractor = GalleryExtractor::new(clients.clone());
    let downloader = Downloader::new(Arc::new(HttpImageFetcher::new(clients)), settings.concurrency);
    let packager: Arc<dyn Packager> = Arc::new(ZipPackager);
    let store = ArchiveStore::new(&settings.archives_dir, packager.extension())
        .context("Failed to open archive directory")?;

    info!(
        domains = registry.list_domains()?.len(),
        concurrency = settings.concurrency,
        archives = %settings.archives_dir.display(),
        "ready"
    );

    let sessions = Arc::new(SessionStore::new());
    let orchestrator = Arc::new(Orchestrator::new(
        registry,
        extractor,
        downloader,
        packager,
        store,
        sessions,
        settings,
    ));
    let bot = Bot::new(orchestrator, Arc::new(ConsoleTransport::new()));

    bot.handle(&args.user, "/start").await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read input")? {
        bot.handle(&args.user, &line).await;
    }

    // input closed: let a running job report before exiting
    bot.drain().await;

    Ok(())
}
