use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use realm_core::{City, CityId, Job, JobId, QueueKind, ResourceKind, UnitCatalog, UnitId};
use realm_econ::{next_end_time, queued_duration};

const CATALOG: &str = r#"
units:
  spear:
    cost: { wood: 40, iron: 10, time: 20 }
  scout:
    cost: { wood: 30, time: 45 }
"#;

fn long_queue_city(catalog: &UnitCatalog, jobs: usize) -> City {
    let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let mut city = City::new(CityId::from("bench"), "Bench", "nobody");
    city.buildings.insert("warehouse".into(), 3);
    city.resources.insert(ResourceKind::from("wood"), 1_000);
    for i in 0..jobs {
        let unit = if i % 3 == 0 { "scout" } else { "spear" };
        let mut job = Job {
            id: JobId(format!("j{i}")),
            unit: UnitId::from(unit),
            amount: 1 + (i % 5) as u32,
            end_time: start,
        };
        let d = queued_duration(catalog, QueueKind::Build, &job).unwrap();
        job.end_time = next_end_time(&city.build_queue, start, d).unwrap();
        city.build_queue.push(job);
    }
    city
}

fn bench_cancel(c: &mut Criterion) {
    let catalog = UnitCatalog::from_yaml_str(CATALOG).unwrap();
    let city = long_queue_city(&catalog, 1_000);
    let now = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
    let head = JobId::from("j0");

    c.bench_function("cancel_head_of_1000", |b| {
        b.iter_batched(
            || city.clone(),
            |mut city| {
                let receipt = realm_runtime::cancel_in_city(
                    &mut city,
                    QueueKind::Build,
                    &head,
                    now,
                    &catalog,
                    "warehouse",
                )
                .unwrap();
                black_box(receipt.rechained)
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_cancel);
criterion_main!(benches);
