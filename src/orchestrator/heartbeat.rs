//! Liveness heartbeat and stale-run detection.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use steward_common::WorkflowRun;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::DbHandle;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(120);

/// Background task that refreshes `last_heartbeat` for one live run.
///
/// On every tick it also reads the persisted cancel flag and trips the run's
/// token, so `steward cancel` from another process reaches the live run. A run
/// that is no longer running in the store (for example superseded by a resume
/// in another process) has its token tripped too.
pub struct Heartbeat {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    pub fn spawn(
        db: DbHandle,
        run_id: i64,
        interval: Duration,
        run_cancel: CancellationToken,
    ) -> Self {
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately; the run was just marked running.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let beat = db
                    .call(move |db| {
                        let live = db.touch_heartbeat(run_id)?;
                        let cancel = db.cancel_requested(run_id)?;
                        Ok((live, cancel))
                    })
                    .await;
                match beat {
                    Ok((_, true)) if !run_cancel.is_cancelled() => {
                        info!(run_id, "Cancel requested through the store");
                        run_cancel.cancel();
                    }
                    Ok((false, _)) => {
                        // Finished or superseded elsewhere; stop at the next boundary.
                        debug!(run_id, "Run no longer live; heartbeat stopping");
                        run_cancel.cancel();
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(run_id, error = %e, "Heartbeat update failed"),
                }
            }
        });
        Self { stop, handle }
    }

    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Heartbeat task panicked");
        }
    }
}

/// Running runs whose heartbeat is older than `stale_after`.
///
/// Reports only: each stale run is logged, none is modified.
pub async fn report_stale(db: &DbHandle, stale_after: Duration) -> Result<Vec<WorkflowRun>> {
    let window = chrono::Duration::from_std(stale_after)?;
    let stale = db.call(move |db| db.stale_runs(window, Utc::now())).await?;
    for run in &stale {
        let last_seen = run.last_heartbeat.or(run.started_at).unwrap_or(run.created_at);
        warn!(
            run_id = run.id,
            work_item = %run.work_item.id,
            last_seen = %last_seen,
            "Run looks stale: no heartbeat for over {}s",
            stale_after.as_secs()
        );
    }
    Ok(stale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::runs::tests::{sample_item, sample_plan};
    use steward_common::RunStatus;

    async fn running_run(db: &DbHandle) -> i64 {
        db.call(|db| {
            let run = db.create_run(&sample_item(), &sample_plan(), None)?;
            db.transition_run(run.id, RunStatus::Running, None)?;
            Ok(run.id)
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_heartbeat_propagates_store_cancel() {
        let db = DbHandle::in_memory().unwrap();
        let run_id = running_run(&db).await;
        let token = CancellationToken::new();
        let heartbeat = Heartbeat::spawn(db.clone(), run_id, Duration::from_millis(20), token.clone());

        db.call(move |db| db.request_cancel(run_id)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .expect("heartbeat should trip the run token");
        heartbeat.stop().await;
    }

    #[tokio::test]
    async fn test_heartbeat_trips_token_when_run_finished_elsewhere() {
        let db = DbHandle::in_memory().unwrap();
        let run_id = running_run(&db).await;
        let token = CancellationToken::new();
        let heartbeat = Heartbeat::spawn(db.clone(), run_id, Duration::from_millis(20), token.clone());

        db.call(move |db| db.transition_run(run_id, RunStatus::TerminatedError, Some("superseded")))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .expect("heartbeat should trip the run token");
        heartbeat.stop().await;
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_timestamp() {
        let db = DbHandle::in_memory().unwrap();
        let run_id = running_run(&db).await;
        let before = db
            .call(move |db| db.get_run(run_id))
            .await
            .unwrap()
            .unwrap()
            .last_heartbeat
            .unwrap();

        let heartbeat = Heartbeat::spawn(
            db.clone(),
            run_id,
            Duration::from_millis(20),
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_millis(120)).await;
        heartbeat.stop().await;

        let after = db
            .call(move |db| db.get_run(run_id))
            .await
            .unwrap()
            .unwrap()
            .last_heartbeat
            .unwrap();
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_report_stale_does_not_modify_runs() {
        let db = DbHandle::in_memory().unwrap();
        let run_id = running_run(&db).await;

        let stale = report_stale(&db, Duration::from_secs(3600)).await.unwrap();
        assert!(stale.is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let stale = report_stale(&db, Duration::from_millis(1)).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, run_id);

        let run = db.call(move |db| db.get_run(run_id)).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }
}
