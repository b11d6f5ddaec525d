use criterion::{black_box, criterion_group, criterion_main, Criterion};

use taskgrind::config::DetectorConfig;
use taskgrind::detector;
use taskgrind::trace::{OpPayload, TraceStore};

/// Two threads: a producer enqueueing `tasks` same-priority tasks and an
/// event-loop consumer that allocates, writes and frees in each task.
fn synthetic_store(tasks: usize) -> TraceStore {
    let mut s = TraceStore::new();
    s.record_op(0, OpPayload::ThreadInit);
    for i in 0..tasks {
        s.record_op(
            0,
            OpPayload::Enq {
                task: format!("{:#x}", 0x1000 + i),
                target: 1,
                priority: 0,
            },
        );
    }
    s.record_op(0, OpPayload::Fork { child: 1 });
    s.record_op(1, OpPayload::ThreadInit);
    s.record_op(1, OpPayload::EnterLoop);
    for i in 0..tasks {
        let name = format!("{:#x}", 0x1000 + i);
        let addr = 0x10_0000 + (i as u64) * 64;
        s.record_op(1, OpPayload::Deq { task: name.clone() });
        s.record_op(1, OpPayload::Alloc { addr, size: 32 });
        s.record_op(1, OpPayload::Write { addr });
        s.record_op(1, OpPayload::Free { addr, size: 32 });
        s.record_op(1, OpPayload::End { task: name });
    }
    s.record_op(1, OpPayload::ExitLoop);
    s.record_op(1, OpPayload::ThreadExit);
    s.record_op(0, OpPayload::Join { child: 1 });
    s.record_op(0, OpPayload::ThreadExit);
    s.finalize();
    s
}

fn bench_analyze(c: &mut Criterion) {
    let mut group = c.benchmark_group("analyze");
    for tasks in [10usize, 50, 100] {
        let store = synthetic_store(tasks);
        group.bench_function(format!("tasks_{tasks}"), |b| {
            b.iter(|| {
                detector::analyze(black_box(&store), &DetectorConfig::default()).unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_analyze);
criterion_main!(benches);
