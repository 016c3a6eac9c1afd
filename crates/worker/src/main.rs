//! Xainik Background Worker
//!
//! Scheduled jobs:
//! - Reconcile payment events left `pending` by a failed delivery (every 10 minutes)
//! - Billing invariant checks (daily at 03:00 UTC)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use xainik_billing::{
    AlertWebhookReporter, DocumentPipeline, ErrorReporter, InvariantCheckSummary,
    InvariantChecker, PipelineConfig, ReconcileResult, TracingReporter,
};
use xainik_shared::create_pool;

const DEFAULT_RECONCILE_AFTER_MINUTES: i64 = 10;
const RECONCILE_BATCH: i64 = 100;

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

fn reconcile_after() -> time::Duration {
    let minutes = match std::env::var("RECONCILE_AFTER_MINUTES") {
        Ok(raw) => raw.trim().parse::<i64>().unwrap_or_else(|_| {
            warn!(value = %raw, "Invalid RECONCILE_AFTER_MINUTES, using default");
            DEFAULT_RECONCILE_AFTER_MINUTES
        }),
        Err(_) => DEFAULT_RECONCILE_AFTER_MINUTES,
    };
    time::Duration::minutes(minutes.max(0))
}

fn build_reporter() -> anyhow::Result<Arc<dyn ErrorReporter>> {
    match std::env::var("ALERT_WEBHOOK_URL").ok().filter(|u| !u.trim().is_empty()) {
        Some(url) => {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()?;
            Ok(Arc::new(AlertWebhookReporter::new(client, url)))
        }
        None => {
            warn!("Error reporting to tracing only (missing ALERT_WEBHOOK_URL)");
            Ok(Arc::new(TracingReporter))
        }
    }
}

/// Log results of a reconciliation pass
fn log_reconcile_results(results: &[ReconcileResult]) {
    let resolved = results
        .iter()
        .filter(|r| r.success && r.new_status != r.previous_status)
        .count();
    let failed = results.iter().filter(|r| !r.success).count();

    info!(
        examined = results.len(),
        resolved = resolved,
        failed = failed,
        "Payment reconciliation cycle complete"
    );

    for result in results.iter().filter(|r| !r.success) {
        error!(
            event_id = %result.provider_event_id,
            error = result.error.as_deref().unwrap_or("unknown"),
            "Payment event still pending after reconciliation"
        );
    }
}

fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(checks_run = summary.checks_run, "Billing invariants hold");
        return;
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        worst = ?summary.worst_severity(),
        "Billing invariant violations found"
    );
    for violation in &summary.violations {
        warn!(
            invariant = %violation.invariant,
            severity = ?violation.severity,
            affected = violation.payment_event_ids.len(),
            "{}",
            violation.description
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Xainik Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url, 5).await?;

    let pipeline = Arc::new(DocumentPipeline::postgres(
        pool.clone(),
        build_reporter()?,
        PipelineConfig {
            require_order_match: env_flag("REQUIRE_ORDER_MATCH"),
        },
    ));
    let invariants = Arc::new(InvariantChecker::new(pool));
    let older_than = reconcile_after();

    let scheduler = JobScheduler::new().await?;

    // Job 1: Re-drive stuck payment events
    let reconcile_pipeline = pipeline.clone();
    scheduler
        .add(Job::new_async("0 */10 * * * *", move |_uuid, _l| {
            let pipeline = reconcile_pipeline.clone();
            Box::pin(async move {
                match pipeline.reconcile_pending(older_than, RECONCILE_BATCH).await {
                    Ok(results) if results.is_empty() => {}
                    Ok(results) => log_reconcile_results(&results),
                    Err(e) => error!(error = %e, "Failed to list pending payment events"),
                }
            })
        })?)
        .await?;
    info!(
        after_minutes = older_than.whole_minutes(),
        "Scheduled: Payment reconciliation (every 10 minutes)"
    );

    // Job 2: Billing invariants
    let checker = invariants.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let checker = checker.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Billing invariant checks failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (03:00 UTC)");

    // Job 3: Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;

    scheduler.start().await?;
    info!("Xainik Worker started with 3 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
