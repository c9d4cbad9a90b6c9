use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;

use bytepump::prelude::*;

const TOTAL: usize = 1 << 20;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn source() -> LimitSource<RepeatSource> {
    LimitSource::new(RepeatSource::forever(vec![7u8; 4096]), TOTAL)
}

fn bench_pump(c: &mut Criterion) {
    let mut group = c.benchmark_group("pump");
    group.throughput(Throughput::Bytes(TOTAL as u64));
    let rt = runtime();

    for max in [1usize, 2, 8].iter() {
        group.bench_with_input(BenchmarkId::new("max_buffers", max), max, |b, &max| {
            b.iter(|| {
                rt.block_on(async {
                    let config = PumpConfig::default().max_buffers(max).buffer_size(4096);
                    let mut pump = Pump::new(source(), config).unwrap();
                    let mut total = 0;
                    while let Some(chunk) = pump.next().await.unwrap() {
                        total += black_box(chunk).len();
                    }
                    assert_eq!(total, TOTAL);
                })
            });
        });
    }

    group.finish();
}

fn bench_transform(c: &mut Criterion) {
    let mut group = c.benchmark_group("transform");
    group.throughput(Throughput::Bytes(TOTAL as u64));
    let rt = runtime();

    for size in [512usize, 4096, 16384].iter() {
        group.bench_with_input(BenchmarkId::new("passthrough", size), size, |b, &size| {
            b.iter(|| {
                rt.block_on(async {
                    let mut session =
                        TransformSession::from_source(source(), PumpConfig::default(), Passthrough).unwrap();
                    let mut buffer = Buffer::new(size);
                    loop {
                        buffer.clear();
                        if !session.pull(&mut buffer).await.unwrap() {
                            break;
                        }
                        black_box(&buffer);
                    }
                })
            });
        });
    }

    group.finish();
}

fn bench_pipe_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipe_fan_out");
    group.throughput(Throughput::Bytes(TOTAL as u64));
    let rt = runtime();

    for sinks in [1usize, 2, 4].iter() {
        group.bench_with_input(BenchmarkId::new("sinks", sinks), sinks, |b, &sinks| {
            b.iter(|| {
                rt.block_on(async {
                    let pipe = Pipe::new(source(), PipeConfig::default()).unwrap();
                    for _ in 0..sinks {
                        pipe.connect(Arc::new(CountSink::new()), true);
                    }
                    pipe.start().await.unwrap();
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_pump, bench_transform, bench_pipe_fan_out);
criterion_main!(benches);
