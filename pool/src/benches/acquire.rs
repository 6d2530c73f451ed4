use bytepool::{PoolConfig, PoolManager};
use criterion::{criterion_group, Criterion};

fn bench_acquire(c: &mut Criterion) {
    let manager = PoolManager::new(PoolConfig::default()).unwrap();
    for size in [0, 4 * 1024, 256 * 1024, 2 * 1024 * 1024] {
        for contiguous in [false, true] {
            c.bench_function(
                &format!(
                    "{}/size={} contiguous={}",
                    module_path!(),
                    size,
                    contiguous
                ),
                |b| {
                    b.iter(|| {
                        let stream = manager
                            .get_stream_with(None, None, size, contiguous)
                            .unwrap();
                        stream.dispose();
                    });
                },
            );
        }
    }
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(100);
    targets = bench_acquire
}
