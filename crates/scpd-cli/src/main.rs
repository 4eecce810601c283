use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scpd_sync::enrich::{enrich_weights, write_unmatched_report, UnmatchedPair};
use scpd_sync::fetch::MarsClient;
use scpd_sync::{load_slug_registry, maybe_build_scheduler, PipelineConfig, SyncPipeline};
use scpd_weights::{guess_weight, WeightTable};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "scpd-cli")]
#[command(about = "Specialty Crop Price Dashboard pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull recent report data from the USDA MARS API
    Fetch,
    /// Normalize report files and overwrite the destination collections
    Sync,
    /// Resolve package weights for the persisted unified collection
    Enrich,
    /// Fetch, sync, and enrich in one pass (the daily update)
    Update,
    /// Generate weight guesses for unmatched commodity/package pairs
    Guess {
        /// Unmatched-pairs report to read (defaults to the one the enrich
        /// step writes under the reports directory)
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long, default_value = "package_guess.json")]
        output: PathBuf,
    },
    /// Serve the dashboard query API
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder().with_env_filter(env).init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Fetch => {
            run_fetch(&config).await?;
        }
        Commands::Sync => {
            run_sync(&config).await?;
        }
        Commands::Enrich => {
            run_enrich(&config).await?;
        }
        Commands::Update => {
            info!("step 1/3: fetching recent report data");
            run_fetch(&config).await?;
            info!("step 2/3: normalizing and uploading");
            run_sync(&config).await?;
            info!("step 3/3: enriching package weights");
            run_enrich(&config).await?;
        }
        Commands::Guess { input, output } => {
            run_guess(&config, input, output)?;
        }
        Commands::Serve => {
            if let Some(scheduler) = maybe_build_scheduler(&config).await? {
                scheduler.start().await.context("starting scheduler")?;
                info!("daily sync scheduler started");
            }
            scpd_web::serve_from_env().await?;
        }
    }

    Ok(())
}

async fn run_fetch(config: &PipelineConfig) -> Result<()> {
    let registry = load_slug_registry(&config.slug_registry_path)?;
    let client = MarsClient::new(
        config.usda_api_key.clone(),
        Duration::from_secs(config.http_timeout_secs),
    )?;
    let summary = client
        .fetch_recent(&registry.slugs, config.fetch_days, &config.data_dir)
        .await?;
    println!(
        "fetch complete: slugs={}/{} rows={} dir={}",
        summary.slugs_fetched,
        summary.slugs_requested,
        summary.rows_total,
        config.data_dir.display()
    );
    Ok(())
}

async fn run_sync(config: &PipelineConfig) -> Result<()> {
    let store = config.build_store()?;
    let pipeline = SyncPipeline::new(config.clone(), &store);
    let summary = pipeline.run_once().await?;
    println!(
        "sync complete: run_id={} files={} rows_read={} crop_prices={} unified={} uploaded={}+{} reports={}",
        summary.run_id,
        summary.files_found,
        summary.rows_read,
        summary.crop_price_rows,
        summary.unified_rows,
        summary.crop_price_rows_uploaded,
        summary.unified_rows_uploaded,
        summary.reports_dir
    );
    Ok(())
}

async fn run_enrich(config: &PipelineConfig) -> Result<()> {
    let store = config.build_store()?;
    let table = WeightTable::load(&config.weight_table_path)?;
    let summary = enrich_weights(&store, &table).await?;
    write_unmatched_report(&config.reports_dir, &summary)?;
    println!(
        "enrich complete: scanned={} matched={} updated={} unmatched={}",
        summary.rows_scanned,
        summary.rows_matched,
        summary.rows_updated,
        summary.unmatched.len()
    );
    Ok(())
}

fn run_guess(config: &PipelineConfig, input: Option<PathBuf>, output: PathBuf) -> Result<()> {
    let input = input.unwrap_or_else(|| config.reports_dir.join("unmatched_packages.json"));
    let text = std::fs::read_to_string(&input)
        .with_context(|| format!("reading {}", input.display()))?;
    let pairs: Vec<UnmatchedPair> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", input.display()))?;

    let mut source_counts: BTreeMap<&str, usize> = BTreeMap::new();
    let entries: Vec<_> = pairs
        .iter()
        .map(|pair| {
            let guess = guess_weight(&pair.commodity, &pair.package);
            *source_counts.entry(guess.source).or_default() += 1;
            guess.into_entry(&pair.commodity, &pair.package)
        })
        .collect();

    let bytes = serde_json::to_vec_pretty(&entries).context("serializing weight guesses")?;
    std::fs::write(&output, bytes).with_context(|| format!("writing {}", output.display()))?;

    println!("generated {} weight guesses -> {}", entries.len(), output.display());
    for (source, count) in source_counts {
        println!("  {source}: {count}");
    }
    Ok(())
}
