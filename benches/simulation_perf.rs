
use chrono::Duration;
use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use demo_matrix::cluster::Cluster;
use demo_matrix::config::{ProductKind, TimeWindow};
use demo_matrix::effects::{EffectQueue, Target};
use demo_matrix::matrix::Matrix;
use demo_matrix::products::hedgebox::HedgeboxPerson;
use demo_matrix::products::pulse::PulsePerson;
use demo_matrix::types::{ClusterIndex, GridPos};

use fixtures::{LARGE, MEDIUM, SMALL, bench_now, config};

// ── Group 1: cluster, one cluster over a growing window ─────────────────────

fn bench_cluster(c: &mut Criterion) {
    let mut group = c.benchmark_group("cluster");
    for &days in &[7i64, 30, 120] {
        group.bench_with_input(BenchmarkId::new("pulse", days), &days, |b, &d| {
            let window = TimeWindow::new(bench_now(), d, 0);
            b.iter_batched(
                || Cluster::<PulsePerson>::new(ClusterIndex(0), "bench", &window, None),
                |mut cluster| cluster.simulate(),
                BatchSize::LargeInput,
            )
        });
        group.bench_with_input(BenchmarkId::new("hedgebox", days), &days, |b, &d| {
            let window = TimeWindow::new(bench_now(), d, 0);
            b.iter_batched(
                || Cluster::<HedgeboxPerson>::new(ClusterIndex(0), "bench", &window, Some(3)),
                |mut cluster| cluster.simulate(),
                BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

// ── Group 2: matrix, end-to-end and parallel across clusters ──────────────────

fn bench_matrix(c: &mut Criterion) {
    let mut group = c.benchmark_group("matrix");
    for (name, scenario) in [("small", &SMALL), ("medium", &MEDIUM), ("large", &LARGE)] {
        if name == "large" {
            group.sample_size(10);
        }
        group.throughput(Throughput::Elements(scenario.clusters as u64));
        let hedgebox = config(scenario, ProductKind::Hedgebox, "bench");
        group.bench_function(BenchmarkId::new("hedgebox", name), |b| {
            b.iter_batched(
                || Matrix::<HedgeboxPerson>::new(&hedgebox).unwrap(),
                |mut matrix| matrix.simulate().unwrap(),
                BatchSize::LargeInput,
            )
        });
        let pulse = config(scenario, ProductKind::Pulse, "bench");
        group.bench_function(BenchmarkId::new("pulse", name), |b| {
            b.iter_batched(
                || Matrix::<PulsePerson>::new(&pulse).unwrap(),
                |mut matrix| matrix.simulate().unwrap(),
                BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

// ── Group 3: effect_queue, scheduling and draining in isolation ─────────────

fn bench_effect_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("effect_queue");
    for &count in &[1_000usize, 10_000, 100_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &n| {
            b.iter(|| {
                let mut queue: EffectQueue<u32, ()> = EffectQueue::new();
                let t0 = bench_now();
                for i in 0..n {
                    let offset = if i % 2 == 0 { i as i64 } else { (n - i) as i64 };
                    queue.schedule(t0 + Duration::seconds(offset), GridPos::new(0, 0), Target::SelfTarget, None, i as u32);
                }
                while let Some(effect) = queue.pop_due(t0 + Duration::seconds(n as i64)) {
                    std::hint::black_box(effect);
                }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_cluster, bench_matrix, bench_effect_queue);
criterion_main!(benches);
