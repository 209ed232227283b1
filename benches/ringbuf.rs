use criterion::{black_box, criterion_group, criterion_main, Criterion};
use wsserverd::ringbuf::RingBuffer;

fn bench_acquire_produce_consume(c: &mut Criterion) {
  let mut group = c.benchmark_group("ringbuf");
  for len in [16usize, 256, 4096] {
    group.bench_function(format!("acquire_produce_consume_{len}B"), |b| {
      let ring = RingBuffer::new(1 << 20, 1, 0);
      let worker = ring.register(0).unwrap();
      b.iter(|| {
        let (offset, worker) = ring.acquire(Some(worker), len).unwrap();
        black_box(offset);
        ring.produce(worker);
        let (ready_off, ready_len) = ring.consume();
        black_box((ready_off, ready_len));
        ring.release(ready_len);
      });
    });
  }
  group.finish();
}

criterion_group!(benches, bench_acquire_produce_consume);
criterion_main!(benches);
