use anyhow::Context as AnyhowContext;
use clap::{Parser, ValueEnum};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use zol_crawler::browser::HttpBrowser;
use zol_crawler::config::{load_retailers_config, RetailerSelector};
use zol_crawler::core::run_all;
use zol_crawler::credentials::CredentialStore;
use zol_crawler::db::{PostgresPriceStore, PriceStore};
use zol_crawler::manifest::{write_manifest, RunManifest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CrawlKind {
    /// Every enabled retailer
    All,
    /// Retailers whose portals need no login
    Public,
    /// Retailers behind credentialed portals
    Auth,
}

#[derive(Parser, Debug)]
#[command(
    name = "zol-crawler",
    about = "Scheduled price-transparency crawler for Israeli grocery retailers"
)]
struct Cli {
    /// Crawl one retailer by its slug (overrides --kind)
    #[arg(long)]
    retailer: Option<String>,

    /// Which retailers to crawl
    #[arg(long, value_enum, default_value_t = CrawlKind::All)]
    kind: CrawlKind,

    /// Bound on concurrently crawled retailers (one browser context each)
    #[arg(long, env = "CRAWL_CONCURRENCY", default_value_t = 3)]
    concurrency: usize,

    /// Overall run deadline, e.g. "5h" or "90m"
    #[arg(long, env = "RUN_DEADLINE", default_value = "5h")]
    deadline: String,

    /// Directory run manifests are spooled to
    #[arg(long, env = "MANIFEST_DIR", default_value = "manifests")]
    manifest_dir: PathBuf,
}

/// Mirror the selected retailers into the database so the downstream
/// reader sees them even before their first snapshot lands. Failures
/// here are logged and the crawl continues.
async fn sync_retailers(
    store: &dyn PriceStore,
    retailers: &[zol_crawler::config::RetailerConfig],
) {
    let mut synced = 0usize;
    for retailer in retailers {
        match store
            .upsert_retailer(
                &retailer.id,
                &retailer.name,
                Some(retailer.requires_credentials()),
            )
            .await
        {
            Ok(_) => synced += 1,
            Err(err) => log::warn!("retailer sync failed slug={}: {err}", retailer.id),
        }
    }
    log::info!("synced {synced}/{} retailers to database", retailers.len());
}

#[tokio::main]
async fn main() -> Result<ExitCode, anyhow::Error> {
    if let Err(env::VarError::NotPresent) = env::var("RUST_LOG") {
        env::set_var("RUST_LOG", "INFO");
    }
    pretty_env_logger::formatted_timed_builder()
        .parse_default_env()
        .init();

    if std::fs::File::open(".env").is_ok() {
        envmnt::load_file(".env")?;
    }

    let cli = Cli::parse();
    let deadline = duration_str::parse(&cli.deadline)
        .map_err(|err| anyhow::anyhow!("invalid --deadline {}: {err}", cli.deadline))?;

    let cfg = load_retailers_config()?;
    let selector = match (&cli.retailer, cli.kind) {
        (Some(slug), _) => RetailerSelector::Single(slug.clone()),
        (None, CrawlKind::All) => RetailerSelector::All,
        (None, CrawlKind::Public) => RetailerSelector::PublicOnly,
        (None, CrawlKind::Auth) => RetailerSelector::CredentialedOnly,
    };
    let retailers = selector.select(&cfg);
    if retailers.is_empty() {
        log::warn!("no retailers matched selector {selector:?}");
        return Ok(ExitCode::SUCCESS);
    }
    log::info!("selected {} retailers", retailers.len());

    let creds = Arc::new(CredentialStore::load(&cfg)?);

    let database_url: String = env::var("DATABASE_URL")
        .context("DATABASE_URL is required; the crawler persists to the shared database")?;

    // Migrations run on a dedicated connection before the pool opens.
    let (mut client, connection) = tokio_postgres::connect(&database_url, tokio_postgres::NoTls)
        .await
        .context("unable to connect to postgres")?;
    let driver = tokio::spawn(async move {
        if let Err(err) = connection.await {
            log::error!("migration connection error: {err}");
        }
    });
    zol_crawler::migrations::runner()
        .run_async(&mut client)
        .await
        .context("database migrations failed")?;
    drop(client);
    driver.abort();

    let store: Arc<dyn PriceStore> = Arc::new(PostgresPriceStore::connect(&database_url)?);
    sync_retailers(store.as_ref(), &retailers).await;

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(_) => {
                    log::warn!("interrupt received, finishing with partial results");
                    token.cancel();
                }
                Err(err) => log::error!("unable to listen for shutdown: {err}"),
            }
        });
    }

    let browser = Arc::new(HttpBrowser::new());
    let outcome = run_all(
        browser,
        store,
        creds,
        retailers,
        cli.concurrency,
        Duration::from_secs(deadline.as_secs().max(1)),
        token,
    )
    .await;

    let manifest = RunManifest::from(&outcome);
    write_manifest(&manifest, &cli.manifest_dir).await;

    let total_downloads: usize = outcome.results.iter().map(|r| r.files_downloaded).sum();
    log::info!(
        "run complete run_id={} downloads={total_downloads} failed_retailers={:?}",
        outcome.run_id,
        outcome.failed_retailers
    );

    if !outcome.timed_out && !outcome.failed_retailers.is_empty() {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
