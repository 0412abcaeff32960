// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use criterion::{criterion_group, criterion_main, Criterion};


#[cfg(all(unix, feature = "collector"))]
fn active_benches(c: &mut Criterion) {
    collector_bench::collector_benches(c);
}

#[cfg(not(all(unix, feature = "collector")))]
fn active_benches(_: &mut Criterion) {
    println!("Benchmarks are disabled.");
}

criterion_group!(benches, active_benches);
criterion_main!(benches);
