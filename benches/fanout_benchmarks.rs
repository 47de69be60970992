use std::{hint::black_box, sync::Arc};

use busline::{callback, EnvelopeIn, FanOut, Headers};
use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Runtime;

fn envelope() -> EnvelopeIn {
    EnvelopeIn::new("orders", Bytes::from_static(b"{\"id\":1}"))
        .with_headers(Headers::from_iter([("trace", "abc")]))
}

fn bench_add_remove(c: &mut Criterion) {
    let fanout: FanOut<EnvelopeIn> = FanOut::new();
    c.bench_function("fanout_add_remove", |b| {
        b.iter(|| {
            let handle = fanout.add(callback(|_e: EnvelopeIn| async { Ok(()) }));
            black_box(fanout.remove(handle));
        })
    });
}

fn bench_put_wait(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("fanout_put_wait");
    for subscribers in [1usize, 10, 100] {
        let fanout = Arc::new(FanOut::new());
        let _registrations: Vec<_> = (0..subscribers)
            .map(|_| fanout.register(callback(|_e: EnvelopeIn| async { Ok(()) })))
            .collect();
        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &subscribers,
            |b, _| {
                b.to_async(&rt).iter(|| async {
                    fanout.put(black_box(envelope())).wait().await.unwrap();
                })
            },
        );
    }
    group.finish();
}

fn bench_header_normalization(c: &mut Criterion) {
    let headers = Headers::from_iter([
        ("content-encoding", "gzip"),
        ("trace", "abc"),
        ("tenant", "acme"),
    ]);
    c.bench_function("headers_round_trip", |b| {
        b.iter(|| {
            let pairs = black_box(&headers).to_byte_pairs();
            black_box(Headers::from_byte_pairs(pairs));
        })
    });
}

criterion_group!(
    benches,
    bench_add_remove,
    bench_put_wait,
    bench_header_normalization
);
criterion_main!(benches);
