use anyhow::Context;
use bridge_geo::{logging::init_logger, HttpTransport, Pipeline, Result, Settings};
use clap::Parser;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let settings = Settings::parse();

    init_logger(settings.log_level.clone().into()).context("failed to initialize logger")?;

    let config = settings.into_config()?;
    let cancel = CancellationToken::new();

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, cancelling run");
            ctrl_c.cancel();
        }
    });

    if let Some(timeout) = config.run_timeout {
        let deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    log::warn!("Run timeout of {}s reached, cancelling run", timeout.as_secs());
                    deadline.cancel();
                }
                _ = deadline.cancelled() => {}
            }
        });
    }

    log::info!(
        "Analyzing {} bridge lists with {} workers",
        config.bridge_urls.len(),
        config.resolver.effective_concurrency()
    );

    let transport = HttpTransport::new(&config.fetch)?;
    let output = config.output.clone();
    let pipeline = Pipeline::new(config, transport, cancel.clone());
    let report = pipeline.run().await;
    cancel.cancel();
    let report = report?;

    println!(
        "Results: {} bridges, {} resolved, {} unmapped, {} lookup errors, {} unparseable lines",
        report.total_bridges,
        report.resolved,
        report.unmapped.count,
        report.failure_summary.lookup_errors,
        report.failure_summary.parse_failures
    );

    println!("\nTop countries:");
    for stat in report.country_stats.iter().take(10) {
        println!("  {} {}", stat.country_code, stat.count);
    }

    println!("\nTop autonomous systems:");
    for stat in report.as_stats.iter().take(10) {
        println!(
            "  AS{} {} {}",
            stat.asn,
            stat.organization.as_deref().unwrap_or("-"),
            stat.count
        );
    }

    if !report.org_keyword_bridges.is_empty() {
        println!("\nBridges on watched networks: {}", report.org_keyword_bridges.len());
    }
    println!("\nSaved report to {:?}", output);

    Ok(())
}
