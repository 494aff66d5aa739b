#![deny(warnings)]

//! Core domain models for the realm: cities, their job queues and the unit
//! catalog those queues reference.
//!
//! This crate only holds serializable data and validation helpers. Queue
//! arithmetic lives in `realm-econ`; transactional operations in
//! `realm-runtime`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier of a persisted city record.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CityId(pub String);

impl fmt::Display for CityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a job, unique within its queue.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Key into the unit catalog, e.g. "archer".
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub String);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A stockpiled resource, e.g. "wood" or "iron".
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKind(pub String);

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKind {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The named queues a city runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    /// Unit training; priced from `cost`.
    Build,
    /// Healing wounded units; priced from `heal_cost`/`heal_time`.
    Heal,
}

impl QueueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueKind::Build => "build",
            QueueKind::Heal => "heal",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "build" => Ok(QueueKind::Build),
            "heal" => Ok(QueueKind::Heal),
            other => Err(ValidationError::UnknownQueue(other.to_string())),
        }
    }
}

/// One time-boxed entry in a city queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Unique within the owning queue.
    pub id: JobId,
    /// Catalog entry the job trains or heals.
    pub unit: UnitId,
    /// Number of units (> 0).
    pub amount: u32,
    /// Absolute completion time.
    pub end_time: DateTime<Utc>,
}

/// A city record as persisted by the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct City {
    pub id: CityId,
    pub name: String,
    pub owner: String,
    /// Current stockpile per resource.
    #[serde(default)]
    pub resources: BTreeMap<ResourceKind, u64>,
    /// Building name to level.
    #[serde(default)]
    pub buildings: BTreeMap<String, u32>,
    /// Stationed units.
    #[serde(default)]
    pub units: BTreeMap<UnitId, u64>,
    /// Wounded units waiting to be healed.
    #[serde(default)]
    pub wounded: BTreeMap<UnitId, u64>,
    #[serde(default)]
    pub build_queue: Vec<Job>,
    #[serde(default)]
    pub heal_queue: Vec<Job>,
}

impl City {
    /// An empty city with no resources, buildings or queued work.
    pub fn new(id: CityId, name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            owner: owner.into(),
            resources: BTreeMap::new(),
            buildings: BTreeMap::new(),
            units: BTreeMap::new(),
            wounded: BTreeMap::new(),
            build_queue: Vec::new(),
            heal_queue: Vec::new(),
        }
    }

    /// Level of a building, 0 when it was never built.
    pub fn building_level(&self, building: &str) -> u32 {
        self.buildings.get(building).copied().unwrap_or(0)
    }

    pub fn queue(&self, kind: QueueKind) -> &[Job] {
        match kind {
            QueueKind::Build => &self.build_queue,
            QueueKind::Heal => &self.heal_queue,
        }
    }

    pub fn queue_mut(&mut self, kind: QueueKind) -> &mut Vec<Job> {
        match kind {
            QueueKind::Build => &mut self.build_queue,
            QueueKind::Heal => &mut self.heal_queue,
        }
    }

    /// Index of a job in the given queue.
    pub fn position(&self, kind: QueueKind, job: &JobId) -> Option<usize> {
        self.queue(kind).iter().position(|j| &j.id == job)
    }
}

/// Per-unit training cost. Resource amounts sit next to `time` in the
/// catalog file, e.g. `{ wood: 60, iron: 40, time: 90 }`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cost {
    /// Seconds per unit.
    pub time: u64,
    #[serde(flatten)]
    pub resources: BTreeMap<ResourceKind, u64>,
}

/// Static reference data for one unit type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStats {
    #[serde(default)]
    pub attack: u32,
    #[serde(default)]
    pub defense: u32,
    #[serde(default)]
    pub speed: u32,
    pub cost: Cost,
    /// Per-unit healing cost.
    #[serde(default)]
    pub heal_cost: BTreeMap<ResourceKind, u64>,
    /// Seconds per unit healed.
    #[serde(default)]
    pub heal_time: u64,
}

impl UnitStats {
    /// Per-unit resource cost charged by the given queue.
    pub fn unit_cost(&self, kind: QueueKind) -> &BTreeMap<ResourceKind, u64> {
        match kind {
            QueueKind::Build => &self.cost.resources,
            QueueKind::Heal => &self.heal_cost,
        }
    }

    /// Seconds per unit in the given queue.
    pub fn unit_time(&self, kind: QueueKind) -> u64 {
        match kind {
            QueueKind::Build => self.cost.time,
            QueueKind::Heal => self.heal_time,
        }
    }
}

/// Read-only unit catalog keyed by [`UnitId`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitCatalog {
    pub units: BTreeMap<UnitId, UnitStats>,
}

impl UnitCatalog {
    /// Parse and validate a catalog document.
    pub fn from_yaml_str(text: &str) -> Result<Self, CatalogError> {
        let catalog: UnitCatalog =
            serde_yaml::from_str(text).map_err(|e| CatalogError::Parse(e.to_string()))?;
        validate_catalog(&catalog)?;
        Ok(catalog)
    }

    pub fn get(&self, unit: &UnitId) -> Option<&UnitStats> {
        self.units.get(unit)
    }

    pub fn insert(&mut self, unit: UnitId, stats: UnitStats) {
        self.units.insert(unit, stats);
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Default save database.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://./saves/realm.db";

/// Runtime configuration shared by the CLI and services.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealmConfig {
    /// SQLite URL, e.g. "sqlite://./saves/realm.db".
    pub database_url: String,
    /// Path of the unit catalog YAML.
    pub catalog_path: String,
    /// Building whose level sets the per-resource storage ceiling.
    pub storage_building: String,
    /// Total attempts for conflict retries (>= 1).
    pub retry_max_attempts: u32,
    /// Base backoff between conflict retries.
    pub retry_base_delay_ms: u64,
    /// Seed for retry jitter.
    pub retry_seed: u64,
    /// Lifetime of cached reads.
    pub cache_ttl_secs: u64,
}

impl Default for RealmConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            catalog_path: "assets/catalog/units.yaml".to_string(),
            storage_building: "warehouse".to_string(),
            retry_max_attempts: 3,
            retry_base_delay_ms: 25,
            retry_seed: 42,
            cache_ttl_secs: 30,
        }
    }
}

impl RealmConfig {
    /// Parse a YAML config; missing keys fall back to defaults.
    pub fn from_yaml_str(text: &str) -> Result<Self, ValidationError> {
        let cfg: RealmConfig =
            serde_yaml::from_str(text).map_err(|e| ValidationError::InvalidConfig(e.to_string()))?;
        validate_config(&cfg)?;
        Ok(cfg)
    }
}

/// Operations a caller can request. Payloads are fixed per variant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Create or migrate the database schema.
    Migrate,
    /// Insert a demo city.
    Seed { city: CityId },
    /// List known city ids.
    List,
    /// Print one city.
    Show { city: CityId },
    /// Cancel a queued job.
    Cancel {
        city: CityId,
        queue: QueueKind,
        job: JobId,
    },
}

impl Action {
    /// Decode a JSON payload such as `{"type":"show","city":"c1"}`.
    pub fn from_json(text: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(text).map_err(|e| ValidationError::InvalidAction(e.to_string()))
    }

    /// Decode positional words such as `cancel c1 heal j7`.
    pub fn from_words<I>(words: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = String>,
    {
        let words: Vec<String> = words.into_iter().collect();
        let arg = |i: usize| word_at(&words, i);
        let action = match arg(0)? {
            "migrate" => Action::Migrate,
            "list" => Action::List,
            "seed" => Action::Seed {
                city: CityId::from(arg(1)?),
            },
            "show" => Action::Show {
                city: CityId::from(arg(1)?),
            },
            "cancel" => Action::Cancel {
                city: CityId::from(arg(1)?),
                queue: arg(2)?.parse()?,
                job: JobId::from(arg(3)?),
            },
            other => {
                return Err(ValidationError::InvalidAction(format!(
                    "unknown action: {other}"
                )))
            }
        };
        Ok(action)
    }
}

fn word_at(words: &[String], i: usize) -> Result<&str, ValidationError> {
    words
        .get(i)
        .map(String::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ValidationError::InvalidAction(format!("missing argument {i}")))
}

/// Validation errors for domain invariants.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    /// Identifiers must be non-empty.
    #[error("empty {0} identifier")]
    EmptyId(&'static str),
    /// Jobs must queue at least one unit.
    #[error("job {0} has a zero amount")]
    ZeroAmount(JobId),
    /// Job ids must be unique within a queue.
    #[error("duplicate job {job} in {queue} queue")]
    DuplicateJob { queue: QueueKind, job: JobId },
    /// Units must take time to train.
    #[error("unit {0} has zero training time")]
    ZeroTrainingTime(UnitId),
    /// Queue name not recognised.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    /// Configuration could not be parsed or is out of range.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// Action payload could not be decoded.
    #[error("invalid action: {0}")]
    InvalidAction(String),
}

/// Errors raised while loading the unit catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog parse error: {0}")]
    Parse(String),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Validate a single catalog entry.
pub fn validate_unit(unit: &UnitId, stats: &UnitStats) -> Result<(), ValidationError> {
    if unit.0.trim().is_empty() {
        return Err(ValidationError::EmptyId("unit"));
    }
    if stats.cost.time == 0 {
        return Err(ValidationError::ZeroTrainingTime(unit.clone()));
    }
    Ok(())
}

/// Validate every catalog entry.
pub fn validate_catalog(catalog: &UnitCatalog) -> Result<(), ValidationError> {
    for (unit, stats) in &catalog.units {
        validate_unit(unit, stats)?;
    }
    Ok(())
}

/// Validate a city record: non-empty ids, positive job amounts and unique job
/// ids per queue. Timing is checked against the catalog in `realm-econ`.
pub fn validate_city(city: &City) -> Result<(), ValidationError> {
    if city.id.0.trim().is_empty() {
        return Err(ValidationError::EmptyId("city"));
    }
    for kind in [QueueKind::Build, QueueKind::Heal] {
        let mut seen: BTreeSet<&JobId> = BTreeSet::new();
        for job in city.queue(kind) {
            if job.id.0.trim().is_empty() {
                return Err(ValidationError::EmptyId("job"));
            }
            if job.amount == 0 {
                return Err(ValidationError::ZeroAmount(job.id.clone()));
            }
            if !seen.insert(&job.id) {
                return Err(ValidationError::DuplicateJob {
                    queue: kind,
                    job: job.id.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Validate configuration ranges.
pub fn validate_config(cfg: &RealmConfig) -> Result<(), ValidationError> {
    if cfg.database_url.trim().is_empty() {
        return Err(ValidationError::InvalidConfig("database_url is empty".into()));
    }
    if cfg.catalog_path.trim().is_empty() {
        return Err(ValidationError::InvalidConfig("catalog_path is empty".into()));
    }
    if cfg.storage_building.trim().is_empty() {
        return Err(ValidationError::InvalidConfig(
            "storage_building is empty".into(),
        ));
    }
    if cfg.retry_max_attempts == 0 {
        return Err(ValidationError::InvalidConfig(
            "retry_max_attempts must be >= 1".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    const CATALOG: &str = r#"
units:
  archer:
    attack: 25
    defense: 10
    speed: 6
    cost: { wood: 60, iron: 40, time: 90 }
    heal_cost: { food: 20 }
    heal_time: 30
  scout:
    speed: 12
    cost: { wood: 30, time: 45 }
"#;

    fn job(id: &str, amount: u32) -> Job {
        Job {
            id: JobId::from(id),
            unit: UnitId::from("archer"),
            amount,
            end_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn catalog_parses_inline_costs() {
        let catalog = UnitCatalog::from_yaml_str(CATALOG).unwrap();
        assert_eq!(catalog.len(), 2);
        let archer = catalog.get(&UnitId::from("archer")).unwrap();
        assert_eq!(archer.cost.time, 90);
        assert_eq!(archer.cost.resources[&ResourceKind::from("wood")], 60);
        assert_eq!(archer.cost.resources[&ResourceKind::from("iron")], 40);
        assert!(!archer.cost.resources.contains_key(&ResourceKind::from("time")));
        assert_eq!(archer.unit_time(QueueKind::Heal), 30);
        assert_eq!(
            archer.unit_cost(QueueKind::Heal)[&ResourceKind::from("food")],
            20
        );
        let scout = catalog.get(&UnitId::from("scout")).unwrap();
        assert!(scout.heal_cost.is_empty());
        assert_eq!(scout.attack, 0);
    }

    #[test]
    fn catalog_rejects_zero_training_time() {
        let text = "units:\n  ghost:\n    cost: { wood: 1, time: 0 }\n";
        let err = UnitCatalog::from_yaml_str(text).unwrap_err();
        assert!(matches!(
            err,
            CatalogError::Invalid(ValidationError::ZeroTrainingTime(_))
        ));
    }

    #[test]
    fn catalog_reports_parse_errors() {
        let err = UnitCatalog::from_yaml_str("units: [1, 2").unwrap_err();
        assert!(matches!(err, CatalogError::Parse(_)));
    }

    #[test]
    fn city_json_roundtrip() {
        let mut city = City::new(CityId::from("c1"), "Harbor", "alice");
        city.resources.insert(ResourceKind::from("wood"), 900);
        city.buildings.insert("warehouse".into(), 3);
        city.build_queue.push(job("j1", 5));
        city.heal_queue.push(job("h1", 2));
        let s = serde_json::to_string(&city).unwrap();
        let back: City = serde_json::from_str(&s).unwrap();
        assert_eq!(back, city);
        assert_eq!(back.building_level("warehouse"), 3);
        assert_eq!(back.building_level("barracks"), 0);
    }

    #[test]
    fn city_missing_collections_default_to_empty() {
        let city: City = serde_json::from_str(r#"{"id":"c2","name":"N","owner":"o"}"#).unwrap();
        assert!(city.resources.is_empty());
        assert!(city.queue(QueueKind::Build).is_empty());
    }

    #[test]
    fn queue_accessors_and_position() {
        let mut city = City::new(CityId::from("c1"), "Harbor", "alice");
        city.queue_mut(QueueKind::Heal).push(job("h1", 1));
        city.queue_mut(QueueKind::Heal).push(job("h2", 1));
        assert_eq!(city.position(QueueKind::Heal, &JobId::from("h2")), Some(1));
        assert_eq!(city.position(QueueKind::Build, &JobId::from("h2")), None);
    }

    #[test]
    fn city_validation() {
        let mut city = City::new(CityId::from("c1"), "Harbor", "alice");
        city.build_queue.push(job("j1", 1));
        assert!(validate_city(&city).is_ok());

        city.build_queue.push(job("j1", 2));
        assert_eq!(
            validate_city(&city),
            Err(ValidationError::DuplicateJob {
                queue: QueueKind::Build,
                job: JobId::from("j1"),
            })
        );

        city.build_queue.pop();
        city.heal_queue.push(job("h1", 0));
        assert_eq!(
            validate_city(&city),
            Err(ValidationError::ZeroAmount(JobId::from("h1")))
        );

        // Same id in different queues is fine.
        city.heal_queue[0] = job("j1", 1);
        assert!(validate_city(&city).is_ok());
    }

    #[test]
    fn queue_kind_parses_case_insensitively() {
        assert_eq!("Heal".parse::<QueueKind>(), Ok(QueueKind::Heal));
        assert_eq!(" build ".parse::<QueueKind>(), Ok(QueueKind::Build));
        assert!("barracks".parse::<QueueKind>().is_err());
        assert_eq!(QueueKind::Heal.to_string(), "heal");
    }

    #[test]
    fn actions_decode_from_json() {
        let a = Action::from_json(r#"{"type":"cancel","city":"c1","queue":"heal","job":"h7"}"#)
            .unwrap();
        assert_eq!(
            a,
            Action::Cancel {
                city: CityId::from("c1"),
                queue: QueueKind::Heal,
                job: JobId::from("h7"),
            }
        );
        assert_eq!(Action::from_json(r#"{"type":"list"}"#).unwrap(), Action::List);
        assert!(Action::from_json(r#"{"type":"attack","city":"c1"}"#).is_err());
        // Payload shape is fixed per variant.
        assert!(Action::from_json(r#"{"type":"show"}"#).is_err());
    }

    #[test]
    fn actions_decode_from_words() {
        let words = |s: &str| s.split_whitespace().map(String::from).collect::<Vec<_>>();
        assert_eq!(
            Action::from_words(words("show c9")).unwrap(),
            Action::Show {
                city: CityId::from("c9")
            }
        );
        assert_eq!(
            Action::from_words(words("cancel c1 build j2")).unwrap(),
            Action::Cancel {
                city: CityId::from("c1"),
                queue: QueueKind::Build,
                job: JobId::from("j2"),
            }
        );
        assert!(Action::from_words(words("cancel c1 build")).is_err());
        assert!(Action::from_words(words("cancel c1 forge j2")).is_err());
        assert!(Action::from_words(Vec::new()).is_err());
    }

    #[test]
    fn config_defaults_and_overrides() {
        let cfg = RealmConfig::from_yaml_str("storage_building: granary\nretry_seed: 7\n").unwrap();
        assert_eq!(cfg.storage_building, "granary");
        assert_eq!(cfg.retry_seed, 7);
        assert_eq!(cfg.retry_max_attempts, 3);
        assert!(RealmConfig::from_yaml_str("retry_max_attempts: 0\n").is_err());
        assert!(validate_config(&RealmConfig::default()).is_ok());
    }

    proptest! {
        #[test]
        fn positive_unique_jobs_validate(amounts in proptest::collection::vec(1u32..10_000, 0..20)) {
            let mut city = City::new(CityId::from("c"), "N", "o");
            for (i, amount) in amounts.iter().enumerate() {
                city.build_queue.push(job(&format!("j{i}"), *amount));
            }
            prop_assert!(validate_city(&city).is_ok());
        }
    }
}
