use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tcp_x::types::OperationContext;
use tcp_x::{CompletionResult, CompletionStatus, ConnectionId, IoProvider, MemoryProvider};

fn bench_completion_drain(c: &mut Criterion) {
    let provider = MemoryProvider::new();
    let cq = provider.create_completion_queue(4096).unwrap();
    let mut batch = vec![CompletionResult::EMPTY; 256];

    c.bench_function("drain_1024_in_batches_of_256", |b| {
        b.iter(|| {
            for i in 0..1024 {
                provider.inject(
                    cq,
                    CompletionResult {
                        connection: ConnectionId(1),
                        context: OperationContext(i),
                        bytes_transferred: 64,
                        status: CompletionStatus::Success,
                    },
                );
            }
            let mut drained = 0;
            loop {
                let n = provider.dequeue(cq, &mut batch).unwrap();
                drained += n;
                if n < batch.len() {
                    break;
                }
            }
            black_box(drained)
        })
    });
}

criterion_group!(benches, bench_completion_drain);
criterion_main!(benches);
