// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dynamo_booking::{
    AdmissionConfig, AdmissionController, GatingPolicy, Request, RequestClass, RoundingPolicy,
    SegmentPlanner,
};

const CLASS_COUNTS: &[usize] = &[2, 8, 32, 128];
const ROUNDS: &[usize] = &[100, 1_000];

fn classes(count: usize) -> Vec<RequestClass> {
    (0..count)
        .map(|i| RequestClass::new(format!("class-{i}"), 1, 8 * (i + 1), 1.0 / (i + 1) as f64))
        .collect()
}

/// Planning cost as the number of distinct decode lengths grows.
fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan");

    for &count in CLASS_COUNTS {
        let table = classes(count);
        let planner = SegmentPlanner::new(4_096, RoundingPolicy::Floor);
        group.bench_with_input(BenchmarkId::new("classes", count), &table, |b, table| {
            b.iter(|| black_box(planner.plan(black_box(table))));
        });
    }
    group.finish();
}

/// Steady arrivals of two classes, one round per tick, through to the end.
fn bench_ticks(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick");

    for gating_policy in [GatingPolicy::StrictCascade, GatingPolicy::AnyClassReady] {
        for &rounds in ROUNDS {
            group.throughput(Throughput::Elements(rounds as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("{gating_policy:?}"), rounds),
                &rounds,
                |b, &rounds| {
                    b.iter(|| {
                        let config = AdmissionConfig::builder()
                            .class(RequestClass::new("short", 1, 16, 2.0))
                            .class(RequestClass::new("long", 1, 64, 1.0))
                            .total_limit(256)
                            .total_expected_requests(3 * rounds)
                            .num_blocks(1 << 16)
                            .gating_policy(gating_policy)
                            .build()
                            .expect("valid bench config");
                        let mut controller =
                            AdmissionController::new(config).expect("valid controller");

                        let mut id = 0;
                        for _ in 0..rounds {
                            for (class, decode) in [("short", 16), ("short", 16), ("long", 64)] {
                                let _ = controller.add_request(Request::new(id, class, 128, decode));
                                id += 1;
                            }
                            if let Some(mut batch) = controller.get_next_batch() {
                                batch.execute();
                                controller.on_batch_end(batch);
                            }
                        }
                        black_box(controller.stats().admitted_stages)
                    });
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_plan, bench_ticks);
criterion_main!(benches);
