#![deny(warnings)]

//! Economy and timeline arithmetic for city queues.
//!
//! This module provides validated utilities for:
//! - Storage capacity per warehouse level
//! - Refund computation and capacity-clamped crediting
//! - Job durations and re-chaining queue end times after a removal

use chrono::{DateTime, TimeDelta, Utc};
use realm_core::{City, Job, QueueKind, ResourceKind, UnitCatalog, UnitId, UnitStats};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use thiserror::Error;

/// Resource amounts keyed by kind.
pub type Stock = BTreeMap<ResourceKind, u64>;

/// Capacity of a level 1 storage building.
pub const BASE_CAPACITY: u64 = 1500;

/// Errors produced by queue arithmetic.
#[derive(Debug, Error, PartialEq)]
pub enum EconError {
    /// A job references a unit missing from the catalog.
    #[error("unit not in catalog: {0}")]
    UnknownUnit(UnitId),
    /// Duration or end time does not fit the timeline.
    #[error("job duration overflows the timeline")]
    DurationOverflow,
    /// `end(i) != end(i-1) + duration(i)` at the given index.
    #[error("queue chain broken at index {0}")]
    BrokenChain(usize),
}

/// Per-resource ceiling for a storage building level.
///
/// `floor(1500 * 1.4^(level-1))`, or 0 when the building is missing. Computed
/// in decimal so that e.g. level 3 yields exactly 2940.
///
/// Example:
/// assert_eq!(storage_capacity(2), 2100);
pub fn storage_capacity(level: u32) -> u64 {
    if level == 0 {
        return 0;
    }
    let growth = Decimal::new(14, 1);
    let mut cap = Decimal::from(BASE_CAPACITY);
    for _ in 1..level {
        match cap.checked_mul(growth) {
            Some(next) => cap = next,
            None => return u64::MAX,
        }
    }
    cap.floor().to_u64().unwrap_or(u64::MAX)
}

/// Storage ceiling of a city, read from the named storage building.
pub fn city_capacity(city: &City, storage_building: &str) -> u64 {
    storage_capacity(city.building_level(storage_building))
}

/// Full refund for `amount` units queued in `kind`.
///
/// Heal jobs are priced from `heal_cost`, everything else from `cost`.
/// Resources without a cost are omitted.
pub fn refund_for(stats: &UnitStats, kind: QueueKind, amount: u32) -> Stock {
    stats
        .unit_cost(kind)
        .iter()
        .filter(|(_, per_unit)| **per_unit > 0)
        .map(|(res, per_unit)| (res.clone(), per_unit.saturating_mul(u64::from(amount))))
        .collect()
}

/// Credit `refund` into `stock`, setting each touched resource to
/// `min(capacity, before + refund)`. Returns the net change per resource,
/// which is zero when the stock already sat at or above the ceiling.
pub fn apply_refund(stock: &mut Stock, refund: &Stock, capacity: u64) -> Stock {
    let mut credited = Stock::new();
    for (res, amount) in refund {
        let slot = stock.entry(res.clone()).or_insert(0);
        let before = *slot;
        *slot = before.saturating_add(*amount).min(capacity);
        credited.insert(res.clone(), slot.saturating_sub(before));
    }
    credited
}

/// Time `amount` units of `stats` occupy in a `kind` queue.
pub fn job_duration(stats: &UnitStats, kind: QueueKind, amount: u32) -> Result<TimeDelta, EconError> {
    let secs = stats
        .unit_time(kind)
        .checked_mul(u64::from(amount))
        .ok_or(EconError::DurationOverflow)?;
    let secs = i64::try_from(secs).map_err(|_| EconError::DurationOverflow)?;
    TimeDelta::try_seconds(secs).ok_or(EconError::DurationOverflow)
}

/// Duration of a queued job, resolved through the catalog.
pub fn queued_duration(
    catalog: &UnitCatalog,
    kind: QueueKind,
    job: &Job,
) -> Result<TimeDelta, EconError> {
    let stats = catalog
        .get(&job.unit)
        .ok_or_else(|| EconError::UnknownUnit(job.unit.clone()))?;
    job_duration(stats, kind, job.amount)
}

/// End time for a job appended to `queue`: the tail's end (or `now` for an
/// empty queue) plus the job's duration.
pub fn next_end_time(
    queue: &[Job],
    now: DateTime<Utc>,
    duration: TimeDelta,
) -> Result<DateTime<Utc>, EconError> {
    let start = queue.last().map(|j| j.end_time).unwrap_or(now);
    start
        .checked_add_signed(duration)
        .ok_or(EconError::DurationOverflow)
}

/// Recompute end times for every job from index `from` onwards.
///
/// The job at `from` starts at `now` when it is the head of the queue,
/// otherwise at its predecessor's (unchanged) end time; each later job starts
/// where the previous one ends. Jobs before `from` are untouched. The queue
/// is only written once every new end time has been computed, so an error
/// leaves it as it was. Returns the number of jobs re-timed.
pub fn rechain(
    queue: &mut [Job],
    from: usize,
    now: DateTime<Utc>,
    catalog: &UnitCatalog,
    kind: QueueKind,
) -> Result<usize, EconError> {
    if from >= queue.len() {
        return Ok(0);
    }
    let mut prev = if from == 0 {
        now
    } else {
        queue[from - 1].end_time
    };
    let mut ends = Vec::with_capacity(queue.len() - from);
    for job in &queue[from..] {
        prev = prev
            .checked_add_signed(queued_duration(catalog, kind, job)?)
            .ok_or(EconError::DurationOverflow)?;
        ends.push(prev);
    }
    for (job, end) in queue[from..].iter_mut().zip(&ends) {
        job.end_time = *end;
    }
    tracing::debug!(queue = %kind, from, retimed = ends.len(), "queue re-chained");
    Ok(ends.len())
}

/// Check `end(i) == end(i-1) + duration(i)` for every `i >= 1`.
pub fn verify_chain(queue: &[Job], catalog: &UnitCatalog, kind: QueueKind) -> Result<(), EconError> {
    for (i, pair) in queue.windows(2).enumerate() {
        let expected = pair[0]
            .end_time
            .checked_add_signed(queued_duration(catalog, kind, &pair[1])?)
            .ok_or(EconError::DurationOverflow)?;
        if pair[1].end_time != expected {
            return Err(EconError::BrokenChain(i + 1));
        }
    }
    Ok(())
}
