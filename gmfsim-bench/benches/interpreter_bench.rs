//! Interpreter benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use gmfsim_core::time::{DAY, YEAR};
use gmfsim_core::{Interpreter, ModuleCatalog, ModuleDefinition, Person};
use serde_json::json;
use std::sync::Arc;

fn chain_module(length: usize) -> serde_json::Value {
    let mut states = serde_json::Map::new();
    states.insert(
        "Initial".to_string(),
        json!({"type": "Initial", "direct_transition": "Step_0"}),
    );
    for i in 0..length {
        let next = if i + 1 == length {
            "Terminal".to_string()
        } else {
            format!("Step_{}", i + 1)
        };
        states.insert(
            format!("Step_{}", i),
            json!({
                "type": "Counter",
                "attribute": "steps",
                "action": "increment",
                "direct_transition": next
            }),
        );
    }
    states.insert("Terminal".to_string(), json!({"type": "Terminal"}));
    json!({"name": "Chain", "states": states})
}

fn chronic_module() -> serde_json::Value {
    json!({
        "name": "Chronic",
        "states": {
            "Initial": {"type": "Initial", "direct_transition": "Onset_Age"},
            "Onset_Age": {
                "type": "Delay",
                "range": {"low": 20, "high": 50, "unit": "years"},
                "direct_transition": "Onset"
            },
            "Onset": {
                "type": "ConditionOnset",
                "codes": [{"system": "SNOMED-CT", "code": "44054006", "display": "Diabetes"}],
                "assign_to_attribute": "diabetes",
                "direct_transition": "Checkup"
            },
            "Checkup": {
                "type": "Delay",
                "exact": {"quantity": 6, "unit": "months"},
                "complex_transition": [
                    {
                        "condition": {"condition_type": "Attribute", "attribute": "visits", "operator": ">", "value": 40},
                        "transition": "Terminal"
                    },
                    {
                        "distributions": [
                            {"distribution": 0.9, "transition": "Visit"},
                            {"distribution": 0.1, "transition": "Checkup"}
                        ]
                    }
                ]
            },
            "Visit": {
                "type": "Counter",
                "attribute": "visits",
                "action": "increment",
                "direct_transition": "Checkup"
            },
            "Terminal": {"type": "Terminal"}
        }
    })
}

fn load(catalog: &ModuleCatalog, key: &str, json: serde_json::Value) -> Arc<ModuleDefinition> {
    catalog
        .put_module(ModuleDefinition::from_json(key, &json).unwrap())
        .unwrap()
}

fn bench_single_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("interpreter_chain");

    for length in [10usize, 100, 1000] {
        let catalog = ModuleCatalog::new();
        let module = load(&catalog, "chain", chain_module(length));
        let interpreter = Interpreter::new(&catalog);

        group.throughput(Throughput::Elements(length as u64));
        group.bench_with_input(BenchmarkId::from_parameter(length), &module, |b, module| {
            b.iter(|| {
                let mut person = Person::new(1);
                person.birth(0);
                black_box(interpreter.process(module, &mut person, DAY).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_weekly_lifetime(c: &mut Criterion) {
    let mut group = c.benchmark_group("interpreter_lifetime");
    group.sample_size(20);

    let catalog = ModuleCatalog::new();
    let module = load(&catalog, "chronic", chronic_module());
    let interpreter = Interpreter::new(&catalog);
    let mut seed = 0u64;

    group.bench_function("chronic_80_years", |b| {
        b.iter(|| {
            seed += 1;
            let mut person = Person::new(seed);
            person.birth(0);
            let mut time = 0;
            while time < 80 * YEAR {
                if interpreter.process(&module, &mut person, time).unwrap() {
                    break;
                }
                time += 7 * DAY;
            }
            black_box(person)
        });
    });

    group.finish();
}

criterion_group!(benches, bench_single_step, bench_weekly_lifetime);
criterion_main!(benches);
