//! One-shot status reconciliation.
//!
//! Exits non-zero when any candidate order failed to reconcile.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use fulfillment_engine::{
    config, db,
    events::{self, EventSender},
    services::reconciliation::{ReconcileOptions, ReconciliationReport, ReconciliationService},
};

#[derive(Parser)]
#[command(
    name = "reconcile",
    about = "Move order statuses that run ahead of their lines back in line",
    version
)]
struct Cli {
    #[arg(long, action = ArgAction::SetTrue, help = "Report drift without writing corrections")]
    dry_run: bool,
    #[arg(long, help = "Orders fetched per page (defaults to the configured batch size)")]
    batch_size: Option<u64>,
    #[arg(long, help = "Stop after scanning this many candidate orders")]
    limit: Option<u64>,
    #[arg(long, env = "APP__DATABASE_URL", help = "Override the configured database URL")]
    database_url: Option<String>,
    #[arg(long, action = ArgAction::SetTrue, help = "Run pending migrations first")]
    migrate: bool,
    #[arg(long, action = ArgAction::SetTrue, help = "Print the full report as pretty JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = config::load_config().context("failed to load application config")?;
    config::init_tracing(cfg.log_level(), cfg.log_json);
    if let Some(url) = cli.database_url.clone() {
        cfg.database_url = url;
    }

    let db_pool = db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to database")?;
    if cli.migrate {
        db::run_migrations(&db_pool)
            .await
            .context("failed to run migrations")?;
    }

    let (sender, rx) = events::channel(cfg.event_channel_capacity);
    let audit = tokio::spawn(events::process_events(rx));
    let sender: Arc<EventSender> = Arc::new(sender);

    let service = ReconciliationService::new(Arc::new(db_pool), Some(sender.clone()));
    let options = ReconcileOptions {
        dry_run: cli.dry_run,
        batch_size: cli.batch_size.unwrap_or(cfg.reconcile_batch_size),
        limit: cli.limit,
    };
    let report = service
        .run(options)
        .await
        .context("reconciliation failed")?;

    // Close the channel so the audit loop drains and exits
    drop(service);
    drop(sender);
    let _ = audit.await;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        render_report(&report);
    }

    if report.failed > 0 {
        bail!("{} order(s) could not be reconciled", report.failed);
    }
    Ok(())
}

fn render_report(report: &ReconciliationReport) {
    let mode = if report.dry_run { "dry run" } else { "applied" };
    println!(
        "Scanned {} order(s): {} drifted ({}), {} ahead, {} failed",
        report.scanned,
        report.corrections.len(),
        mode,
        report.ahead,
        report.failed
    );
    for correction in &report.corrections {
        println!(
            "  {} ({}): {} -> {}",
            correction.order_number, correction.order_id, correction.from, correction.to
        );
    }
}
