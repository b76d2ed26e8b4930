mod config;
mod crawler;
mod extract;
mod models;
mod portal;
mod report;
mod robots;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::AppConfig;
use crate::crawler::Crawler;
use crate::portal::PortalBrowser;

#[derive(Parser)]
#[command(name = "evsub", about = "EV subsidy portal crawler", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Crawl per-region model prices through the popup pipeline
    Prices {
        /// Crawl even when robots.txt disallows the page
        #[arg(long)]
        ignore_robots: bool,
    },

    /// Crawl the application-status schedule table
    Status {
        /// Crawl even when robots.txt disallows the page
        #[arg(long)]
        ignore_robots: bool,
    },

    /// Render the Markdown change report against the previous snapshots
    Report,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "ev_subsidy_crawler=info,warn",
        1 => "ev_subsidy_crawler=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    let config = AppConfig::load()?;

    match cli.command {
        Command::Prices { ignore_robots } => crawl_prices(config, ignore_robots).await?,
        Command::Status { ignore_robots } => crawl_status(config, ignore_robots).await?,
        Command::Report => {
            let content = report::render_change_report(
                &config.output.status_path(),
                &config.output.prices_path(),
            )?;
            let path = report::save_report(&config.output.reports_dir, &content)?;
            println!("Report written to {}", path.display());
        }
    }

    Ok(())
}

async fn ensure_allowed(config: &AppConfig, path: &str, ignore_robots: bool) -> Result<()> {
    if robots::preflight(&config.portal, path).await? || ignore_robots {
        return Ok(());
    }
    anyhow::bail!("robots.txt disallows {} (pass --ignore-robots to override)", path)
}

async fn crawl_prices(config: AppConfig, ignore_robots: bool) -> Result<()> {
    let _t = utils::Timer::start("model-price crawl");
    ensure_allowed(&config, &config.portal.price_page_path, ignore_robots).await?;

    let portal =
        PortalBrowser::launch(&config.portal, &config.crawl, &config.portal.price_page_url())
            .await?;
    let crawler = Crawler::new(portal, config.crawl.clone());

    let outcome = crawler.run(&config.portal.year, &config.crawl.categories).await;
    crawler.into_portal().shutdown().await;
    let run = outcome?;

    let prices_path = config.output.prices_path();
    report::rotate_snapshot(&prices_path)?;
    report::write_price_snapshot(&prices_path, &run.records)?;
    report::write_run_log(&config.output.run_log_path(), &run)?;

    info!(
        "Done: {} records | {} regions ok | {} skipped or failed → {}",
        run.records.len(),
        run.success_count(),
        run.failure_count(),
        prices_path.display()
    );
    Ok(())
}

async fn crawl_status(config: AppConfig, ignore_robots: bool) -> Result<()> {
    let _t = utils::Timer::start("schedule crawl");
    ensure_allowed(&config, &config.portal.status_page_path, ignore_robots).await?;

    let portal =
        PortalBrowser::launch(&config.portal, &config.crawl, &config.portal.status_page_url())
            .await?;
    if let Err(e) = portal.save_screenshot(&config.output.screenshot_path()).await {
        warn!("screenshot failed: {}", e);
    }
    let crawler = Crawler::new(portal, config.crawl.clone());

    let outcome = crawler.run_schedule(&config.crawl.categories).await;
    crawler.into_portal().shutdown().await;
    let rows = outcome?;

    let status_path = config.output.status_path();
    report::rotate_snapshot(&status_path)?;
    report::write_schedule_snapshot(&status_path, &rows, &config.output.source_note)?;

    let mut per_category: BTreeMap<&str, usize> = BTreeMap::new();
    for row in &rows {
        *per_category.entry(row.vehicle_category.as_str()).or_default() += 1;
    }
    for (category, count) in &per_category {
        info!("  {}: {} rows", category, count);
    }
    info!("Done: {} rows → {}", rows.len(), status_path.display());
    Ok(())
}
