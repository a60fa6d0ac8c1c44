//! Postgres control store tests.
//!
//! Run only when `MARKETFLOW_TEST_DATABASE_URL` points at a disposable database;
//! otherwise every test returns early.

use std::time::Duration as StdDuration;

use chrono::{Duration, NaiveDate, Utc};

use marketflow_core::{AuditTag, JobId, JobRecord, JobStatus, NewJob};
use marketflow_infra::collaborators::{
    Dataset, DatasetKind, StagingPayload, StagingSink, WarehouseDatabase,
};
use marketflow_infra::{ClaimRequest, ControlStore, PostgresControlStore, StoreError, Transition};

async fn store() -> Option<PostgresControlStore> {
    let url = std::env::var("MARKETFLOW_TEST_DATABASE_URL").ok()?;
    let store = PostgresControlStore::connect(&url, 8, StdDuration::from_secs(5))
        .await
        .expect("connect to test database");
    store.migrate().await.expect("apply schema");
    Some(store)
}

async fn new_job(store: &PostgresControlStore) -> JobRecord {
    let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
    store
        .create_job(NewJob::new(day, day, "/tmp/marketflow-test", vec!["VCB".into()]))
        .await
        .unwrap()
}

fn claim(job: &JobRecord, lease: chrono::DateTime<Utc>) -> ClaimRequest {
    ClaimRequest {
        job_id: job.id,
        precondition: JobStatus::Ready,
        in_progress: JobStatus::Crawling,
        lease_expiry: lease,
        description: "test claim".into(),
    }
}

#[tokio::test]
async fn create_and_read_back() {
    let Some(store) = store().await else { return };
    let job = new_job(&store).await;

    assert_eq!(job.status, JobStatus::Ready);
    assert!(job.retry_eligible);
    assert!(!job.locked);
    let fetched = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(fetched.symbols, vec!["VCB".to_string()]);
    assert_eq!(fetched.window_end, job.window_end);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_admit_one_winner() {
    let Some(store) = store().await else { return };
    let job = new_job(&store).await;
    let request = claim(&job, Utc::now() + Duration::minutes(30));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            let request = request.clone();
            tokio::spawn(async move { store.claim(&request).await.unwrap() })
        })
        .collect();
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let log = store.audit_log(job.id).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status_tag, AuditTag::Claimed);
}

#[tokio::test]
async fn finalize_is_guarded() {
    let Some(store) = store().await else { return };
    let job = new_job(&store).await;

    let done = Transition {
        from: JobStatus::Crawling,
        to: JobStatus::Crawled,
        retry_eligible: Some(true),
        tag: AuditTag::Success,
        description: "done".into(),
    };
    // Not claimed yet.
    let err = store.finalize(job.id, &done).await.unwrap_err();
    assert!(matches!(err, StoreError::OwnershipLost { .. }));

    assert!(store.claim(&claim(&job, Utc::now() + Duration::minutes(5))).await.unwrap());
    store.finalize(job.id, &done).await.unwrap();

    let stored = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Crawled);
    assert!(!stored.locked);
    assert!(stored.lease_expiry.is_none());

    let tags: Vec<AuditTag> = store
        .audit_log(job.id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.status_tag)
        .collect();
    assert_eq!(tags, vec![AuditTag::Claimed, AuditTag::Success]);
}

#[tokio::test]
async fn expired_leases_are_reported() {
    let Some(store) = store().await else { return };
    let job = new_job(&store).await;
    let t = Utc::now();
    assert!(store.claim(&claim(&job, t + Duration::minutes(5))).await.unwrap());

    let early = store.expired_leases(t + Duration::minutes(4)).await.unwrap();
    assert!(early.iter().all(|j| j.id != job.id));

    let late = store.expired_leases(t + Duration::minutes(6)).await.unwrap();
    assert!(late.iter().any(|j| j.id == job.id));
}

#[tokio::test]
async fn audit_rows_are_immutable() {
    let Some(store) = store().await else { return };
    let job = new_job(&store).await;
    store
        .append_audit(job.id, AuditTag::Warn, "VCB: timeout")
        .await
        .unwrap();

    let result = sqlx::query("DELETE FROM pipeline_audit WHERE job_id = $1")
        .bind(job.id.get())
        .execute(store.pool())
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn reset_requires_error_status() {
    let Some(store) = store().await else { return };
    let job = new_job(&store).await;
    let transition = Transition {
        from: JobStatus::ErrCrawl,
        to: JobStatus::Ready,
        retry_eligible: Some(true),
        tag: AuditTag::Reset,
        description: "operator reset".into(),
    };
    let err = store.reset(job.id, &transition).await.unwrap_err();
    assert!(matches!(err, StoreError::StatusMismatch { .. }));
}

#[tokio::test]
async fn staging_lives_on_its_own_pool() {
    let Ok(url) = std::env::var("MARKETFLOW_TEST_DATABASE_URL") else { return };
    let warehouse = WarehouseDatabase::connect(&url, 2, StdDuration::from_secs(5))
        .await
        .expect("connect to test warehouse");
    warehouse.migrate().await.unwrap();

    let mut payload = StagingPayload::default();
    payload.insert(
        DatasetKind::PriceHistory,
        &Dataset::new(
            vec!["symbol".into(), "close".into()],
            vec![vec!["VCB".into(), "91.2".into()]],
        ),
    );
    let sink = warehouse.staging_sink();
    sink.replace(JobId::new(1), &payload).await.unwrap();
    sink.replace(JobId::new(2), &payload).await.unwrap();

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM staging_raw_data")
        .fetch_one(warehouse.pool())
        .await
        .unwrap();
    assert_eq!(rows, 1);
}
