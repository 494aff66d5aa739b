#![deny(warnings)]

//! Queue operations against persisted cities.
//!
//! [`QueueCanceller`] removes a job from a city queue, refunds it and
//! re-chains the remaining jobs inside a single store transaction. Retrying
//! on conflicts is left to callers, see [`retry_on_conflict`]. [`TtlCache`]
//! backs cheap repeated reads such as [`CityDirectory`].

use chrono::{DateTime, Utc};
use persistence::{with_transaction, CityStore, StoreError};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use realm_core::{City, CityId, Job, JobId, QueueKind, RealmConfig, UnitCatalog, UnitId};
use realm_econ::{apply_refund, city_capacity, rechain, refund_for, EconError, Stock};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

/// What a cancel could not find.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Missing {
    City(CityId),
    Job { queue: QueueKind, job: JobId },
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Missing::City(id) => write!(f, "city {id}"),
            Missing::Job { queue, job } => write!(f, "job {job} in {queue} queue"),
        }
    }
}

/// Errors returned by queue operations. None of them leave a partial write.
#[derive(Debug, Error)]
pub enum CancelError {
    /// City or job absent at transaction time, e.g. already completed or
    /// cancelled concurrently.
    #[error("not found: {0}")]
    NotFound(Missing),
    /// Job references a unit the catalog does not know.
    #[error("invalid unit reference: {0}")]
    InvalidReference(UnitId),
    /// Another writer committed first; the whole call may be retried.
    #[error("write conflict on city {city}: expected version {expected}, found {found}")]
    Conflict {
        city: CityId,
        expected: u64,
        found: u64,
    },
    /// Stored timeline cannot be re-chained.
    #[error("queue integrity: {0}")]
    Integrity(EconError),
    #[error("storage: {0}")]
    Storage(StoreError),
}

impl CancelError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CancelError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CancelError::NotFound(_))
    }
}

impl From<StoreError> for CancelError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => CancelError::NotFound(Missing::City(id)),
            StoreError::Conflict {
                id,
                expected,
                found,
            } => CancelError::Conflict {
                city: id,
                expected,
                found,
            },
            other => CancelError::Storage(other),
        }
    }
}

impl From<EconError> for CancelError {
    fn from(e: EconError) -> Self {
        match e {
            EconError::UnknownUnit(unit) => CancelError::InvalidReference(unit),
            other => CancelError::Integrity(other),
        }
    }
}

/// Outcome of a committed cancellation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CancelReceipt {
    pub city: CityId,
    pub queue: QueueKind,
    /// The job as it was stored before removal.
    pub job: Job,
    /// Full refund owed for the job.
    pub refund: Stock,
    /// Net amounts added after clamping to storage capacity.
    pub credited: Stock,
    /// Wounded units handed back (heal queue only).
    pub restored_wounded: u64,
    /// Jobs whose end time was recomputed.
    pub rechained: usize,
}

/// Remove `job` from `queue` of an already loaded city, refund it and
/// re-chain its successors. This is the body of the cancel transaction and
/// mutates `city` in place; callers hand it a scratch copy.
pub fn cancel_in_city(
    city: &mut City,
    queue: QueueKind,
    job: &JobId,
    now: DateTime<Utc>,
    catalog: &UnitCatalog,
    storage_building: &str,
) -> Result<CancelReceipt, CancelError> {
    let index = city
        .position(queue, job)
        .ok_or_else(|| CancelError::NotFound(Missing::Job {
            queue,
            job: job.clone(),
        }))?;
    let removed = city.queue_mut(queue).remove(index);
    let stats = catalog
        .get(&removed.unit)
        .ok_or_else(|| CancelError::InvalidReference(removed.unit.clone()))?;

    let rechained = rechain(city.queue_mut(queue), index, now, catalog, queue)?;

    let refund = refund_for(stats, queue, removed.amount);
    let capacity = city_capacity(city, storage_building);
    if capacity == 0 && !refund.is_empty() {
        tracing::warn!(
            city = %city.id,
            building = storage_building,
            "storage building missing, refund clamped to zero"
        );
    }
    let credited = apply_refund(&mut city.resources, &refund, capacity);

    let mut restored_wounded = 0;
    if queue == QueueKind::Heal {
        restored_wounded = u64::from(removed.amount);
        let pool = city.wounded.entry(removed.unit.clone()).or_insert(0);
        *pool = pool.saturating_add(restored_wounded);
    }

    Ok(CancelReceipt {
        city: city.id.clone(),
        queue,
        job: removed,
        refund,
        credited,
        restored_wounded,
        rechained,
    })
}

/// Cancels queued jobs with refund and re-chaining, one transaction per call.
pub struct QueueCanceller<S> {
    store: Arc<S>,
    catalog: Arc<UnitCatalog>,
    storage_building: String,
}

impl<S: CityStore> QueueCanceller<S> {
    pub fn new(store: Arc<S>, catalog: Arc<UnitCatalog>) -> Self {
        Self {
            store,
            catalog,
            storage_building: RealmConfig::default().storage_building,
        }
    }

    /// Building whose level sets the refund ceiling.
    pub fn with_storage_building(mut self, building: impl Into<String>) -> Self {
        self.storage_building = building.into();
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn catalog(&self) -> &UnitCatalog {
        &self.catalog
    }

    /// Cancel `job` as of the current wall clock.
    pub async fn cancel(
        &self,
        city: &CityId,
        queue: QueueKind,
        job: &JobId,
    ) -> Result<CancelReceipt, CancelError> {
        self.cancel_at(city, queue, job, Utc::now()).await
    }

    /// Cancel `job`, re-chaining a new queue head from `now`.
    ///
    /// State is re-read inside the transaction; nothing captured by the
    /// caller beforehand is trusted.
    pub async fn cancel_at(
        &self,
        city: &CityId,
        queue: QueueKind,
        job: &JobId,
        now: DateTime<Utc>,
    ) -> Result<CancelReceipt, CancelError> {
        let result = with_transaction(self.store.as_ref(), city, |c| {
            cancel_in_city(c, queue, job, now, &self.catalog, &self.storage_building)
        })
        .await;
        match &result {
            Ok(receipt) => tracing::info!(
                city = %city,
                queue = %queue,
                job = %job,
                unit = %receipt.job.unit,
                amount = receipt.job.amount,
                rechained = receipt.rechained,
                "job cancelled"
            ),
            Err(e @ (CancelError::InvalidReference(_) | CancelError::Integrity(_))) => {
                tracing::error!(city = %city, queue = %queue, job = %job, error = %e, "corrupt queue record")
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(city = %city, job = %job, error = %e, "cancel lost a write race")
            }
            Err(e) => tracing::debug!(city = %city, job = %job, error = %e, "cancel rejected"),
        }
        result
    }
}

/// Backoff settings for [`retry_on_conflict`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first (>= 1).
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Seed for jitter so runs are reproducible.
    pub seed: u64,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RealmConfig) -> Self {
        Self {
            max_attempts: cfg.retry_max_attempts,
            base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
            seed: cfg.retry_seed,
        }
    }

    /// Delay before retry number `attempt` (1-based): exponential in the
    /// attempt plus up to one base delay of jitter.
    pub fn delay_for(&self, attempt: u32, rng: &mut ChaCha8Rng) -> Duration {
        let shift = attempt.saturating_sub(1).min(10);
        let exp = self.base_delay.saturating_mul(1u32 << shift);
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let jitter = if base_ms == 0 {
            0
        } else {
            rng.gen_range(0..=base_ms)
        };
        exp.saturating_add(Duration::from_millis(jitter))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RealmConfig::default())
    }
}

/// Re-run `op` while it fails with a retryable conflict, up to the policy's
/// attempt budget. Other errors and the final conflict are returned as is.
pub async fn retry_on_conflict<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, CancelError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CancelError>>,
{
    let mut rng = ChaCha8Rng::seed_from_u64(policy.seed);
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < attempts => {
                let delay = policy.delay_for(attempt, &mut rng);
                tracing::warn!(attempt, ?delay, error = %e, "retrying after conflict");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Read-through cache holding one value for a fixed time.
///
/// Concurrent callers share one fetch: the slot stays locked while a refill
/// is in flight. Failed fetches are not cached.
pub struct TtlCache<T> {
    ttl: Duration,
    slot: Mutex<Option<(Instant, Arc<T>)>>,
}

impl<T> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    pub async fn get_or_fetch<F, Fut, E>(&self, fetch: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some((fetched_at, value)) = slot.as_ref() {
            if fetched_at.elapsed() < self.ttl {
                return Ok(Arc::clone(value));
            }
        }
        let value = Arc::new(fetch().await?);
        *slot = Some((Instant::now(), Arc::clone(&value)));
        Ok(value)
    }

    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }
}

/// Cached list of city ids.
pub struct CityDirectory<S> {
    store: Arc<S>,
    cache: TtlCache<Vec<CityId>>,
}

impl<S: CityStore> CityDirectory<S> {
    pub fn new(store: Arc<S>, ttl: Duration) -> Self {
        Self {
            store,
            cache: TtlCache::new(ttl),
        }
    }

    pub async fn ids(&self) -> Result<Arc<Vec<CityId>>, StoreError> {
        self.cache.get_or_fetch(|| self.store.list()).await
    }

    /// Drop the cached list, e.g. after inserting a city.
    pub async fn invalidate(&self) {
        self.cache.invalidate().await;
    }
}
