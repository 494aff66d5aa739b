#![deny(warnings)]

//! Operator CLI: migrate and seed a save database, inspect cities and cancel
//! queued jobs.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use persistence::{init_db, CityStore, SqliteStore, Versioned};
use realm_core::{
    validate_city, Action, City, CityId, Job, JobId, QueueKind, RealmConfig, ResourceKind,
    UnitCatalog, UnitId,
};
use realm_econ::{next_end_time, queued_duration};
use realm_runtime::{retry_on_conflict, CityDirectory, QueueCanceller, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: cli [--config <path>] [--version] \
(--action '<json>' | migrate | seed <city> | list | show <city> | cancel <city> <build|heal> <job>)";

#[derive(Debug, Default)]
struct Args {
    config: Option<String>,
    action_json: Option<String>,
    version: bool,
    words: Vec<String>,
}

fn parse_args() -> Args {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => args.config = it.next(),
            "--action" => args.action_json = it.next(),
            "--version" => args.version = true,
            _ => args.words.push(arg),
        }
    }
    args
}

async fn load_config(path: Option<&str>) -> Result<RealmConfig> {
    let mut cfg = match path {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading config {path}"))?;
            RealmConfig::from_yaml_str(&text)?
        }
        None => RealmConfig::default(),
    };
    if let Ok(url) = std::env::var("REALM_DATABASE_URL") {
        cfg.database_url = url;
    }
    Ok(cfg)
}

async fn load_catalog(path: &str) -> Result<UnitCatalog> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading unit catalog {path}"))?;
    Ok(UnitCatalog::from_yaml_str(&text)?)
}

async fn open_store(url: &str) -> Result<SqliteStore> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"));
    if let Some(path) = path {
        if let Some(parent) = std::path::Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    Ok(SqliteStore::new(init_db(url).await?))
}

/// A small city with both queues populated, chained from `now`.
fn demo_city(id: CityId, catalog: &UnitCatalog, now: DateTime<Utc>) -> Result<City> {
    let mut city = City::new(id, "Demo", "operator");
    city.buildings.insert("warehouse".into(), 2);
    city.buildings.insert("barracks".into(), 1);
    for (res, amount) in [("wood", 800), ("iron", 300), ("food", 200)] {
        city.resources.insert(ResourceKind::from(res), amount);
    }
    city.wounded.insert(UnitId::from("archer"), 4);

    let jobs = [
        (QueueKind::Build, "b1", "archer", 2),
        (QueueKind::Build, "b2", "scout", 3),
        (QueueKind::Build, "b3", "spearman", 1),
        (QueueKind::Heal, "h1", "archer", 2),
    ];
    for (kind, id, unit, amount) in jobs {
        let mut job = Job {
            id: JobId::from(id),
            unit: UnitId::from(unit),
            amount,
            end_time: now,
        };
        let duration = queued_duration(catalog, kind, &job)?;
        job.end_time = next_end_time(city.queue(kind), now, duration)?;
        city.queue_mut(kind).push(job);
    }
    validate_city(&city)?;
    Ok(city)
}

/// `show` output: the stored record with its version.
fn show_json(record: &Versioned<City>) -> serde_json::Result<serde_json::Value> {
    let city = serde_json::to_value(&record.value)?;
    Ok(serde_json::json!({ "version": record.version, "city": city }))
}

async fn run(action: Action, cfg: &RealmConfig, store: Arc<SqliteStore>) -> Result<()> {
    match action {
        Action::Migrate => {
            let count = store.list().await?.len();
            println!("DB migrated at {} ({} cities)", cfg.database_url, count);
        }
        Action::Seed { city } => {
            let catalog = load_catalog(&cfg.catalog_path).await?;
            let demo = demo_city(city, &catalog, Utc::now())?;
            store.insert(&demo).await?;
            info!(city = %demo.id, "seeded demo city");
            println!("{}", serde_json::to_string_pretty(&demo)?);
        }
        Action::List => {
            let directory =
                CityDirectory::new(Arc::clone(&store), Duration::from_secs(cfg.cache_ttl_secs));
            for id in directory.ids().await?.iter() {
                println!("{id}");
            }
        }
        Action::Show { city } => match store.load(&city).await? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&show_json(&record)?)?),
            None => bail!("city not found: {city}"),
        },
        Action::Cancel { city, queue, job } => {
            let catalog = Arc::new(load_catalog(&cfg.catalog_path).await?);
            let canceller = QueueCanceller::new(store, catalog)
                .with_storage_building(cfg.storage_building.as_str());
            let policy = RetryPolicy::from_config(cfg);
            let receipt =
                retry_on_conflict(&policy, || canceller.cancel(&city, queue, &job)).await?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = parse_args();
    if args.version {
        println!(
            "realm cli {} ({} built {})",
            env!("CARGO_PKG_VERSION"),
            env!("GIT_SHA"),
            env!("BUILD_DATE")
        );
        return Ok(());
    }

    let action = match (&args.action_json, args.words.is_empty()) {
        (Some(json), true) => Action::from_json(json)?,
        (None, false) => Action::from_words(args.words.clone())?,
        _ => bail!("{USAGE}"),
    };
    let cfg = load_config(args.config.as_deref()).await?;
    info!(?action, db = %cfg.database_url, "starting CLI");

    let store = Arc::new(open_store(&cfg.database_url).await?);
    run(action, &cfg, store).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn show_output_is_one_json_document() {
        let mut city = City::new(CityId::from("c1"), "Harbor", "alice");
        city.resources.insert(ResourceKind::from("wood"), 900);
        let record = Versioned {
            version: 4,
            value: city.clone(),
        };
        let text = serde_json::to_string_pretty(&show_json(&record).unwrap()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["version"], 4);
        let back: City = serde_json::from_value(parsed["city"].clone()).unwrap();
        assert_eq!(back, city);
    }
}
