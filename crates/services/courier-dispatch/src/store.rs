use crate::error::{DispatchError, Result};
use crate::metrics;
use courier_types::{Job, JobId, MerchantId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// A job behind its own lock. Every chain and lifecycle step holds it for
/// the whole read-check-write sequence.
pub type JobHandle = Arc<Mutex<Job>>;

#[derive(Default)]
struct Records {
    jobs: HashMap<JobId, JobHandle>,
    /// Jobs that are neither completed nor canceled.
    open: HashSet<JobId>,
    /// Each merchant's jobs in creation order.
    by_merchant: HashMap<MerchantId, Vec<JobId>>,
}

/// In-memory job records with one lock per job.
///
/// The map lock is only held to look up or update entries, never while a job
/// lock is awaited, so operations on different jobs never wait on each other.
/// Scans that only care about live jobs go through the open index and never
/// touch settled ones.
#[derive(Default)]
pub struct JobStore {
    records: RwLock<Records>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, job: Job) -> JobHandle {
        let id = job.id;
        let merchant_id = job.merchant_id;
        let open = !job.status.is_terminal();
        let handle = Arc::new(Mutex::new(job));

        let mut records = self.records.write().await;
        records.jobs.insert(id, handle.clone());
        records.by_merchant.entry(merchant_id).or_default().push(id);
        if open {
            records.open.insert(id);
        }
        metrics::update_open_jobs(records.open.len());
        tracing::debug!("Stored job {} (open: {})", id, open);
        handle
    }

    pub async fn handle(&self, job_id: JobId) -> Result<JobHandle> {
        self.records
            .read()
            .await
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| DispatchError::NotFound(format!("job {} not found", job_id)))
    }

    /// A copy of the job as of now.
    pub async fn snapshot(&self, job_id: JobId) -> Result<Job> {
        let handle = self.handle(job_id).await?;
        let job = handle.lock().await;
        Ok(job.clone())
    }

    /// Handles of every job still in play.
    pub async fn open_handles(&self) -> Vec<JobHandle> {
        let records = self.records.read().await;
        records
            .open
            .iter()
            .filter_map(|id| records.jobs.get(id).cloned())
            .collect()
    }

    /// Drops a settled job from the open index. Call with the job's lock held
    /// after any step that may have completed or canceled it.
    pub async fn retire_if_settled(&self, job: &Job) {
        if !job.status.is_terminal() {
            return;
        }
        let mut records = self.records.write().await;
        if records.open.remove(&job.id) {
            metrics::update_open_jobs(records.open.len());
            tracing::debug!("Job {} settled as {}", job.id, job.status);
        }
    }

    /// Up to `limit` of the merchant's jobs, newest first.
    pub async fn merchant_jobs(&self, merchant_id: MerchantId, limit: usize) -> Vec<Job> {
        let handles: Vec<JobHandle> = {
            let records = self.records.read().await;
            records
                .by_merchant
                .get(&merchant_id)
                .map(|ids| {
                    ids.iter()
                        .rev()
                        .take(limit)
                        .filter_map(|id| records.jobs.get(id).cloned())
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut jobs = Vec::with_capacity(handles.len());
        for handle in handles {
            jobs.push(handle.lock().await.clone());
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use courier_types::{FareQuote, GeoPoint, JobStatus, WeatherCondition};

    fn job(merchant_id: MerchantId) -> Job {
        let point = GeoPoint::new(41.0, 29.0);
        let fare = FareQuote {
            distance_km: 0.0,
            base_fare: 0.0,
            weather_multiplier: 1.0,
            weather_condition: WeatherCondition::Unknown,
            night_surcharge: 0.0,
            total_fare: 20.0,
            computed_at: Utc::now(),
        };
        Job::new(merchant_id, None, point, point, "door", None, fare, Utc::now())
    }

    #[tokio::test]
    async fn handles_share_the_same_job() {
        let store = JobStore::new();
        let job = job(MerchantId::new());
        let id = job.id;
        let inserted = store.insert(job).await;

        inserted.lock().await.status = JobStatus::Pending;
        assert_eq!(store.snapshot(id).await.unwrap().status, JobStatus::Pending);
        assert_eq!(store.open_handles().await.len(), 1);
    }

    #[tokio::test]
    async fn settled_jobs_leave_the_open_index() {
        let store = JobStore::new();
        let merchant = MerchantId::new();

        let mut canceled = job(merchant);
        canceled.status = JobStatus::Canceled;
        store.insert(canceled).await;
        assert!(store.open_handles().await.is_empty());

        let handle = store.insert(job(merchant)).await;
        assert_eq!(store.open_handles().await.len(), 1);

        let mut live = handle.lock().await;
        store.retire_if_settled(&live).await;
        assert_eq!(store.open_handles().await.len(), 1);
        live.status = JobStatus::Completed;
        store.retire_if_settled(&live).await;
        drop(live);
        assert!(store.open_handles().await.is_empty());

        // Settled jobs stay readable
        assert_eq!(store.merchant_jobs(merchant, 50).await.len(), 2);
    }

    #[tokio::test]
    async fn merchant_history_is_newest_first_and_limited() {
        let store = JobStore::new();
        let merchant = MerchantId::new();
        let start = Utc::now();
        let mut ids = Vec::new();
        for minutes in 0..4 {
            let mut job = job(merchant);
            job.created_at = start + Duration::minutes(minutes);
            ids.push(job.id);
            store.insert(job).await;
        }
        store.insert(job(MerchantId::new())).await;

        let history = store.merchant_jobs(merchant, 3).await;
        let got: Vec<JobId> = history.iter().map(|j| j.id).collect();
        assert_eq!(got, vec![ids[3], ids[2], ids[1]]);
        assert!(store.merchant_jobs(MerchantId::new(), 50).await.is_empty());
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let store = JobStore::new();
        assert!(matches!(store.handle(JobId::new()).await, Err(DispatchError::NotFound(_))));
    }
}
