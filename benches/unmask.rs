use criterion::{black_box, criterion_group, criterion_main, Criterion};
use wsserverd::mask::unmask;

fn bench_unmask(c: &mut Criterion) {
  let mask = [0x37, 0xfa, 0x21, 0x3d];
  let mut group = c.benchmark_group("unmask");
  for size in [64usize, 4096, 65536] {
    let payload = vec![0xABu8; size];
    group.bench_function(format!("{size}B"), |b| {
      b.iter_batched(
        || payload.clone(),
        |mut data| unmask(black_box(&mut data), mask),
        criterion::BatchSize::SmallInput,
      )
    });
  }
  group.finish();
}

criterion_group!(benches, bench_unmask);
criterion_main!(benches);
