use criterion::{black_box, criterion_group, criterion_main, Criterion};
use robust_pickle::{
    dumps, loads, value_from_slice, value_to_vec, ClassRef, DeOptions, FailureLedger,
    HashableValue, Instance, LoadOptions, Method, Registry, SaveMethod, SaveOptions, SerOptions,
    Value,
};

fn records(n: usize) -> Value {
    Value::List((0..n).map(|i| {
        let mut instance = Instance::new(ClassRef::new("bench.models", "Record"));
        instance.state = Some(Value::Dict(vec![
            (HashableValue::String("id".into()), Value::I64(i as i64)),
            (HashableValue::String("name".into()), Value::String(format!("record {}", i))),
            (HashableValue::String("score".into()), Value::F64(i as f64 / 3.0)),
        ].into_iter().collect()));
        Value::Object(Box::new(instance))
    }).collect())
}

fn bench_codec(c: &mut Criterion) {
    let value = Value::List((0..10_000).map(|i| Value::String(format!("item {}", i))).collect());
    let bytes = value_to_vec(&value, SerOptions::new()).unwrap();
    c.bench_function("encode strings", |b| {
        b.iter(|| value_to_vec(black_box(&value), SerOptions::new()).unwrap())
    });
    c.bench_function("decode strings", |b| {
        b.iter(|| value_from_slice(black_box(&bytes), DeOptions::new()).unwrap())
    });
}

fn bench_chain(c: &mut Criterion) {
    let value = records(1_000);
    let options = SaveOptions::new().method(SaveMethod::Secondary);
    let bytes = dumps(&value, &options).unwrap();

    let mut registry = Registry::new();
    registry.register_generic("bench.models", "Record");
    let resolved = LoadOptions::new().method(Method::Auto).registry(registry);
    c.bench_function("load resolved", |b| {
        b.iter(|| loads(black_box(&bytes), &resolved).unwrap())
    });

    // Every instance becomes a placeholder.
    let degraded = LoadOptions::new().method(Method::Auto).ledger(FailureLedger::new());
    c.bench_function("load degraded", |b| {
        b.iter(|| loads(black_box(&bytes), &degraded).unwrap())
    });
}

criterion_group!(benches, bench_codec, bench_chain);
criterion_main!(benches);
