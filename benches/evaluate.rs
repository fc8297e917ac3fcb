use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use karl::sync::MergeStats;
use karl::{
    process_message, EvalSettings, KnowledgeRecord, KnowledgeUpdateSettings, ThreadSafeContext, TransportSettings,
    UpdateMessage,
};

const RULES: &str = "sensor.temp > 30 => (alarm = 1; fan.speed = fan.speed + 1) ;> \
                     i[0 -> 8)(readings[i] = sensor.temp * i) ;> total = #size(readings)";

fn bench_compile(c: &mut Criterion) {
    c.bench_function("karl/compile_rules", |b| {
        let ctx = ThreadSafeContext::new();
        b.iter(|| ctx.compile(RULES).unwrap());
    });
}

fn bench_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate");
    group.throughput(Throughput::Elements(1));

    group.bench_function("rules_local", |b| {
        let ctx = ThreadSafeContext::new();
        let _ = ctx.set("sensor.temp", 35i64, &KnowledgeUpdateSettings::default());
        let expr = ctx.compile(RULES).unwrap();
        let settings = EvalSettings {
            update: KnowledgeUpdateSettings::local(),
            ..EvalSettings::default()
        };
        b.iter(|| expr.evaluate(&ctx, &settings).unwrap());
    });

    group.bench_function("arith_folded", |b| {
        let ctx = ThreadSafeContext::new();
        let expr = ctx.compile("x = (3 + 4) * 2 - #pow(2, 3)").unwrap();
        b.iter(|| expr.evaluate(&ctx, &EvalSettings::default()).unwrap());
    });
    group.finish();
}

fn bench_merge_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    group.throughput(Throughput::Elements(64));

    group.bench_function("process_64_updates", |b| {
        b.iter_custom(|iters| {
            // Fresh context per sample so clocks keep every update accepted.
            let ctx = ThreadSafeContext::new();
            let stats = MergeStats::new();
            let settings = TransportSettings::new("bench", "karl");
            let start = Instant::now();
            for round in 0..iters {
                let updates = (0..64)
                    .map(|k| {
                        let mut r = KnowledgeRecord::from(i64::from(k));
                        r.clock = round + 1;
                        (format!("key.{k}"), r)
                    })
                    .collect();
                let msg = UpdateMessage::new("peer", "karl", 0, updates);
                let _ = process_message(&ctx, &msg, &settings, None, &stats);
            }
            start.elapsed()
        })
    });
    group.finish();
}

fn bench_wire(c: &mut Criterion) {
    let updates: Vec<(String, KnowledgeRecord)> = (0..32)
        .map(|k| (format!("agent.{k}.pos"), KnowledgeRecord::from(vec![1.0, 2.0, f64::from(k)])))
        .collect();
    let msg = UpdateMessage::new("peer", "karl", 1, updates);
    let frame = msg.encode(64 * 1024).unwrap();

    c.bench_function("wire/encode_32", |b| b.iter(|| msg.encode(64 * 1024).unwrap()));
    c.bench_function("wire/decode_32", |b| b.iter(|| UpdateMessage::decode(&frame).unwrap()));
}

criterion_group!(karl_benches, bench_compile, bench_evaluate, bench_merge_batch, bench_wire);
criterion_main!(karl_benches);
