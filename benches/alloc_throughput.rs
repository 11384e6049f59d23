use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use harena::Arena;

const OPS: u64 = 100_000;

/// harena alloc/free throughput.
fn arena_alloc_free(arena: &mut Arena, size: usize) {
  for _ in 0..OPS {
    let ptr = arena.alloc(size);
    black_box(ptr);
    unsafe { arena.free_block(ptr) };
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

/// Mixed-size churn that forces free-list reuse, splitting and coalescing
/// instead of pure tail bumping.
fn arena_churn(arena: &mut Arena) {
  let mut ptrs = Vec::with_capacity(256);
  for i in 0..256usize {
    ptrs.push(arena.alloc(16 + (i % 7) * 48));
  }
  for ptr in ptrs.iter().step_by(2) {
    unsafe { arena.free_block(*ptr) };
  }
  for i in (0..256usize).step_by(2) {
    ptrs[i] = arena.alloc(16 + (i % 5) * 32);
  }
  for ptr in ptrs {
    unsafe { arena.free_block(ptr) };
  }
}

fn benchmark_alloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("alloc_throughput");

  let arena = Arena::new_dynamic(64 << 20);
  assert!(!arena.is_null());
  let arena = unsafe { &mut *arena };

  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("harena", size), &size, |b, &size| {
      b.iter(|| arena_alloc_free(arena, size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.bench_function("harena_churn", |b| b.iter(|| arena_churn(arena)));

  group.finish();
}

criterion_group!(benches, benchmark_alloc_throughput);
criterion_main!(benches);
