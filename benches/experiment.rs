use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use simopt::{Curve, Experiment, ExperimentConfig, Factors, PostRepSettings};

fn make_experiment(workers: usize) -> Experiment {
    Experiment::from_names(
        "RNDSRCH",
        "QUADRATIC-1",
        &Factors::new().with("sample_size", 10_i64),
        &Factors::new().with("budget", 500_i64),
        ExperimentConfig::default().with_workers(workers),
    )
    .unwrap()
}

fn bench_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("experiment_run");
    group.throughput(Throughput::Elements(8));

    for workers in [1, 4] {
        group.bench_function(format!("macroreps_8_workers_{workers}"), |b| {
            b.iter_custom(|iters| {
                let mut total = std::time::Duration::ZERO;
                for _ in 0..iters {
                    // Fresh experiment per iteration; a run is one-shot.
                    let mut exp = make_experiment(workers);
                    let start = Instant::now();
                    exp.run(8).unwrap();
                    total += start.elapsed();
                }
                total
            })
        });
    }
    group.finish();
}

fn bench_post_replicate(c: &mut Criterion) {
    let mut group = c.benchmark_group("experiment_post_replicate");
    group.throughput(Throughput::Elements(8));

    let mut exp = make_experiment(4);
    exp.run(8).unwrap();
    group.bench_function("postreps_50", |b| {
        b.iter(|| exp.post_replicate(PostRepSettings::new(50, 50)).unwrap());
    });
    group.finish();
}

fn bench_curve_statistics(c: &mut Criterion) {
    let curves: Vec<Curve> = (0..64u32)
        .map(|k| {
            Curve::new(
                (0..100u32)
                    .map(|i| (f64::from(i) / 100.0, 1.0 / (1.0 + f64::from(i * (k + 1)))))
                    .collect(),
            )
        })
        .collect();

    c.bench_function("curve/mean_of_64", |b| b.iter(|| Curve::mean_of(&curves).unwrap()));
    c.bench_function("curve/quantile_of_64", |b| b.iter(|| Curve::quantile_of(&curves, 0.9).unwrap()));
}

criterion_group!(experiment, bench_run, bench_post_replicate, bench_curve_statistics);
criterion_main!(experiment);
