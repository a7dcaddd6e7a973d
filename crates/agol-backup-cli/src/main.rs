use anyhow::Context;
use chrono::Local;
use clap::Parser;
use dotenvy::dotenv;
use std::time::Instant;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use agol_backup_cli::{Config, RunSummary, Settings};
use agol_backup_client::ArcGisClient;
use agol_backup_core::{load_config, AppError, BackupContext, BackupRunner, HttpConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    // Parse command line arguments
    let config = Config::parse();

    // Setup logging (stderr, stdout carries the report)
    let level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let file_config = load_config(config.config.as_deref()).map_err(report_error)?;
    let settings = Settings::resolve(config, file_config).map_err(report_error)?;

    let started = Instant::now();

    info!("Connecting to {}...", settings.portal_url);
    let client = ArcGisClient::connect(
        &settings.portal_url,
        &settings.username,
        &settings.password,
        HttpConfig::default(),
    )
    .await
    .map_err(report_error)?;

    let ctx = BackupContext {
        output_dir: settings.output_dir,
        run_date: Local::now().date_naive(),
        wait: settings.wait,
        keep_going: settings.keep_going,
    };
    info!(
        "Backing up to {} (run date {})",
        ctx.output_dir.display(),
        ctx.date_stamp()
    );

    let report = BackupRunner::new(&client, &ctx)
        .run()
        .await
        .map_err(report_error)?;

    print!("{}", RunSummary::new(&report, started.elapsed()));

    if !report.is_success() {
        anyhow::bail!("{} item(s) failed to back up", report.failures.len());
    }
    Ok(())
}

/// Logs the user-facing explanation of a fatal error before it ends the run.
fn report_error(e: AppError) -> anyhow::Error {
    error!("{}", e.user_message());
    e.into()
}
