//! Population scheduler benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use gmfsim_core::{ModuleCatalog, ModuleDefinition};
use gmfsim_runner::{Config, DiscardSink, PopulationScheduler};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn setup_catalog() -> (Arc<ModuleCatalog>, Vec<Arc<ModuleDefinition>>) {
    let catalog = ModuleCatalog::new();
    let definition = json!({
        "name": "Flu",
        "states": {
            "Initial": {"type": "Initial", "direct_transition": "Wait"},
            "Wait": {
                "type": "Delay",
                "range": {"low": 1, "high": 5, "unit": "years"},
                "distributed_transition": [
                    {"distribution": 0.2, "transition": "Flu"},
                    {"distribution": 0.8, "transition": "Wait"}
                ]
            },
            "Flu": {
                "type": "ConditionOnset",
                "codes": [{"system": "SNOMED-CT", "code": "6142004", "display": "Influenza"}],
                "direct_transition": "Recover"
            },
            "Recover": {
                "type": "Delay",
                "exact": {"quantity": 10, "unit": "days"},
                "direct_transition": "Recovered"
            },
            "Recovered": {
                "type": "ConditionEnd",
                "condition_onset": "Flu",
                "direct_transition": "Wait"
            }
        }
    });
    let module = catalog
        .put_module(ModuleDefinition::from_json("flu", &definition).unwrap())
        .unwrap();
    (Arc::new(catalog), vec![module])
}

fn config(size: usize, threads: usize) -> Config {
    let mut config = Config::default();
    config.population.size = size;
    config.population.threads = threads;
    config.simulation.start_year = 1950;
    config.simulation.stop_year = 2000;
    config
}

fn bench_population(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let (catalog, modules) = setup_catalog();

    let mut group = c.benchmark_group("population");
    group.sample_size(10);

    for threads in [1usize, 4] {
        let size = 50;
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("threads", threads), &threads, |b, &threads| {
            b.to_async(&rt).iter(|| {
                let scheduler = PopulationScheduler::with_modules(
                    &config(size, threads),
                    catalog.clone(),
                    modules.clone(),
                )
                .unwrap();
                async move { black_box(scheduler.run(Arc::new(DiscardSink)).await) }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_population);
criterion_main!(benches);
