//! Per-job schedule lock.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::error::Error;
use crate::store::Database;

/// Run `pass` while holding the schedule lock of `job_id`.
///
/// Returns `Ok(None)` without running `pass` when another pass holds the
/// lock. The lock is released however `pass` ends, including by panic; the
/// panic is resumed after the release.
pub async fn with_schedule_lock<F, T>(
    db: &dyn Database,
    job_id: &str,
    lease: Duration,
    pass: F,
) -> Result<Option<T>, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    let Some(owner) = db.acquire_schedule_lock(job_id, lease).await? else {
        debug!(job_id, "Schedule lock held elsewhere, skipping");
        return Ok(None);
    };

    let outcome = AssertUnwindSafe(pass).catch_unwind().await;

    match db.release_schedule_lock(job_id, &owner).await {
        Ok(true) => {}
        Ok(false) => warn!(job_id, "Schedule lock expired before the pass ended"),
        Err(e) => error!(job_id, error = %e, "Failed to release schedule lock"),
    }
    match outcome {
        Ok(result) => result.map(Some),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::dag::{DagSchema, PartyRef};
    use crate::error::JobError;
    use crate::store::{Job, LibSqlBackend};

    async fn db_with_job() -> Arc<LibSqlBackend> {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let dag = DagSchema::from_json(
            r#"{"parties": [{"role": "guest", "party_id": ["9999"]}], "tasks": {"a": {"component_ref": "a"}}}"#,
        )
        .unwrap();
        let job = Job::new("j1", &PartyRef::new("guest", "9999"), dag, "9999", "9999");
        db.create_job(&job).await.unwrap();
        db
    }

    #[tokio::test]
    async fn lock_is_released_after_pass() {
        let db = db_with_job().await;
        let lease = Duration::from_secs(60);

        let ran = with_schedule_lock(db.as_ref(), "j1", lease, async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(ran, Some(7));

        let failed: Result<Option<()>, Error> = with_schedule_lock(db.as_ref(), "j1", lease, async {
            Err(JobError::NotFound { id: "j1".into() }.into())
        })
        .await;
        assert!(failed.is_err());
        // Released even though the pass failed.
        assert!(db.acquire_schedule_lock("j1", lease).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn held_lock_skips_pass() {
        let db = db_with_job().await;
        let lease = Duration::from_secs(60);
        assert!(db.acquire_schedule_lock("j1", lease).await.unwrap().is_some());

        let ran = with_schedule_lock(db.as_ref(), "j1", lease, async { Ok(1) })
            .await
            .unwrap();
        assert_eq!(ran, None);
    }

    #[tokio::test]
    async fn lock_is_released_on_panic() {
        let db = db_with_job().await;
        let lease = Duration::from_secs(60);

        let inner = Arc::clone(&db);
        let handle = tokio::spawn(async move {
            let _ = with_schedule_lock(inner.as_ref(), "j1", lease, async {
                if true {
                    panic!("pass blew up");
                }
                Ok(())
            })
            .await;
        });
        assert!(handle.await.is_err());
        assert!(db.acquire_schedule_lock("j1", lease).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_pass_keeps_successor_lock() {
        let db = db_with_job().await;

        let ran = with_schedule_lock(db.as_ref(), "j1", Duration::from_millis(1), async {
            // Lease runs out mid-pass; another pass takes over.
            let later = chrono::Utc::now() + chrono::Duration::seconds(1);
            db.clear_expired_schedule_locks(later).await.unwrap();
            let successor = db.acquire_schedule_lock("j1", Duration::from_secs(60)).await.unwrap();
            assert!(successor.is_some());
            Ok::<_, Error>(())
        })
        .await
        .unwrap();
        assert_eq!(ran, Some(()));

        // The successor still holds the lock, so a third pass is skipped.
        let third = with_schedule_lock(db.as_ref(), "j1", Duration::from_secs(60), async { Ok(3) })
            .await
            .unwrap();
        assert_eq!(third, None);
    }
}
