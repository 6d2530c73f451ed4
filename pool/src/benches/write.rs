use bytepool::{PoolConfig, PoolManager};
use criterion::{criterion_group, Criterion};
use rand::{rngs::StdRng, RngCore, SeedableRng};

const CHUNK: usize = 4 * 1024;

fn bench_write(c: &mut Criterion) {
    let manager = PoolManager::new(PoolConfig::default()).unwrap();
    let mut chunk = vec![0u8; CHUNK];
    StdRng::seed_from_u64(0).fill_bytes(&mut chunk);
    for total in [256 * 1024, 1024 * 1024, 8 * 1024 * 1024] {
        for promote in [false, true] {
            c.bench_function(
                &format!("{}/total={} promote={}", module_path!(), total, promote),
                |b| {
                    b.iter(|| {
                        let mut stream = manager.get_stream();
                        let mut written = 0;
                        while written < total {
                            stream.write(&chunk).unwrap();
                            written += CHUNK;
                        }
                        if promote {
                            std::hint::black_box(stream.get_contiguous_buffer());
                        }
                        stream.dispose();
                    });
                },
            );
        }
    }
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(50);
    targets = bench_write
}
