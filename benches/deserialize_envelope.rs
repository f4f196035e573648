//! Benchmarks for inbound push-channel frames.
//!
//! Every frame goes through envelope parsing before dispatch, and the busiest
//! stream by far is `run_log`, so both stages are measured separately.

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use runboard_live::live::types::response::{LogEntry, RunLogEvent, TaskUpdate};
use runboard_live::ws::{Envelope, JsonEnvelopeParser, MessageParser as _};

const RUN_LOG: &str = r#"{
    "type": "run_log",
    "run_id": "6f1c2a9e-3b7d-4e0f-9a51-2c8d7e6b4f10",
    "log": {
        "id": "log_000123",
        "seq": 123,
        "stream": "stdout",
        "message": "Running cargo test --workspace (412 tests)",
        "created_at": "2026-01-01T12:00:00.000Z"
    }
}"#;

const TASK_UPDATE: &str = r#"{
    "type": "task_update",
    "project_id": "9b0e6d52-1f4a-4c33-8d27-5e6f7a8b9c0d",
    "task": {
        "id": "task_42",
        "title": "Wire the run log panel",
        "status": "in_progress",
        "assignee": "coder-agent",
        "updated_at": "2026-01-01T12:00:00.000Z"
    }
}"#;

fn bench_envelope(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope/parse");
    let parser = JsonEnvelopeParser;

    for (name, frame) in [("run_log", RUN_LOG), ("task_update", TASK_UPDATE)] {
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_function(name, |b| {
            b.iter(|| {
                let _: Envelope = parser
                    .parse(std::hint::black_box(frame.as_bytes()))
                    .expect("Parsing should succeed");
            });
        });
    }

    group.finish();
}

fn bench_typed_bodies(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope/typed");

    let (_, run_log) = JsonEnvelopeParser
        .parse(RUN_LOG.as_bytes())
        .expect("Parsing should succeed")
        .into_parts();
    group.bench_function("RunLogEvent", |b| {
        b.iter(|| {
            let _: RunLogEvent = serde_json::from_value(std::hint::black_box(run_log.clone()))
                .expect("Deserialization should succeed");
        });
    });

    let (_, task_update) = JsonEnvelopeParser
        .parse(TASK_UPDATE.as_bytes())
        .expect("Parsing should succeed")
        .into_parts();
    group.bench_function("TaskUpdate", |b| {
        b.iter(|| {
            let _: TaskUpdate = serde_json::from_value(std::hint::black_box(task_update.clone()))
                .expect("Deserialization should succeed");
        });
    });

    let entry = r#"{"seq": 1, "stream": "stderr", "message": "warning: unused import"}"#;
    group.throughput(Throughput::Bytes(entry.len() as u64));
    group.bench_function("LogEntry", |b| {
        b.iter(|| {
            let _: LogEntry = serde_json::from_str(std::hint::black_box(entry))
                .expect("Deserialization should succeed");
        });
    });

    group.finish();
}

criterion_group!(envelope_benches, bench_envelope, bench_typed_bodies);
criterion_main!(envelope_benches);
