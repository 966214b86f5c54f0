use config::Options;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use engine::{Engine, Entry};
use tempfile::tempdir;

const N_KEYS: usize = 10_000;

fn fill(engine: &Engine) {
    for i in 0..N_KEYS {
        engine
            .set(Entry::new(format!("key{i:06}"), vec![b'x'; 100]))
            .unwrap();
    }
}

fn engine_set_benchmark(c: &mut Criterion) {
    c.bench_function("engine_set_10k", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let opts = Options {
                    memtable_size: 256 << 10,
                    ..Options::with_dir(dir.path())
                };
                let engine = Engine::open(opts).unwrap();
                (engine, dir)
            },
            |(engine, _dir)| fill(&engine),
            BatchSize::PerIteration,
        );
    });
}

fn engine_get_benchmark(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let opts = Options {
        memtable_size: 256 << 10,
        ..Options::with_dir(dir.path())
    };
    let engine = Engine::open(opts).unwrap();
    fill(&engine);

    c.bench_function("engine_get_10k", |b| {
        b.iter(|| {
            for i in 0..N_KEYS {
                assert!(engine.get(format!("key{i:06}").as_bytes()).unwrap().is_some());
            }
        });
    });
}

criterion_group!(benches, engine_set_benchmark, engine_get_benchmark);
criterion_main!(benches);
