use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tokio::time::{Duration as TokioDuration, sleep};
use tracing::{error, info};

use crate::AppState;
use crate::web::status::ExportStatus;

const CLEANUP_INTERVAL_MINUTES: u64 = 15;
const STALLED_EXPORT_HOURS: i64 = 2;

pub fn spawn(state: AppState) {
    tokio::spawn(async move {
        let interval = TokioDuration::from_secs(CLEANUP_INTERVAL_MINUTES * 60);
        loop {
            if let Err(err) = run_cleanup_cycle(&state).await {
                error!(?err, "maintenance cycle failed");
            }
            sleep(interval).await;
        }
    });
}

async fn run_cleanup_cycle(state: &AppState) -> Result<()> {
    let pool = state.pool();
    let cutoff = Utc::now() - Duration::hours(STALLED_EXPORT_HOURS);

    let stalled_exports = reap_stalled_exports(&pool, cutoff).await?;
    let expired_sessions = purge_expired_sessions(&pool).await?;

    if stalled_exports > 0 || expired_sessions > 0 {
        info!(stalled_exports, expired_sessions, "maintenance cycle completed");
    }

    Ok(())
}

/// Marks exports failed whose worker died without touching the record again.
/// Live workers update `updated_at` on completion and on failure, so a
/// non-terminal status past the cutoff means the process is gone.
async fn reap_stalled_exports(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE exports SET status = $1, updated_at = NOW() \
         WHERE status IN ('created', 'in_progress') AND updated_at < $2",
    )
    .bind(ExportStatus::Failed.as_str())
    .bind(cutoff)
    .execute(pool)
    .await
    .context("failed to reap stalled exports")?;

    Ok(result.rows_affected())
}

async fn purge_expired_sessions(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at < NOW()")
        .execute(pool)
        .await
        .context("failed to purge expired sessions")?;

    Ok(result.rows_affected())
}
