//! Throughput benchmark for the wait-free MPMC queue that backs every semaphore's
//! waiter list and the scheduler's inbound command queue (spec §4.1). `harness = false`
//! because the producer/consumer thread pools need to be built and joined once per
//! measured iteration rather than per-call, which `#[bench]`-style auto-harnessing does
//! not give control over.

use std::sync::Arc;
use std::thread;

use criterion::{black_box, Criterion};

use boson_rt::queue::WfQueue;

fn single_thread_push_pop(c: &mut Criterion) {
    c.bench_function("wfqueue/single_thread_push_pop", |b| {
        let queue: WfQueue<u64> = WfQueue::new(1);
        b.iter(|| {
            queue.push(black_box(42));
            black_box(queue.try_pop());
        });
    });
}

fn producers_then_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("wfqueue/producers_then_drain");
    for producers in [1usize, 4, 16] {
        group.bench_function(format!("{producers}_producers_x_1000"), |b| {
            b.iter(|| {
                let queue = Arc::new(WfQueue::<u64>::new(producers));
                let handles: Vec<_> = (0..producers)
                    .map(|t| {
                        let queue = Arc::clone(&queue);
                        thread::spawn(move || {
                            for i in 0..1000u64 {
                                queue.push(t as u64 * 1000 + i);
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
                let mut drained = 0u64;
                while queue.try_pop().is_some() {
                    drained += 1;
                }
                black_box(drained);
            });
        });
    }
    group.finish();
}

fn concurrent_producers_and_consumers(c: &mut Criterion) {
    let mut group = c.benchmark_group("wfqueue/concurrent_producers_and_consumers");
    for pairs in [1usize, 4, 8] {
        group.bench_function(format!("{pairs}_producers_{pairs}_consumers_x_2000"), |b| {
            b.iter(|| {
                let queue = Arc::new(WfQueue::<u64>::new(pairs * 2));
                let producers: Vec<_> = (0..pairs)
                    .map(|t| {
                        let queue = Arc::clone(&queue);
                        thread::spawn(move || {
                            for i in 0..2000u64 {
                                queue.push(t as u64 * 2000 + i);
                            }
                        })
                    })
                    .collect();
                let consumed = Arc::new(std::sync::atomic::AtomicU64::new(0));
                let consumers: Vec<_> = (0..pairs)
                    .map(|_| {
                        let queue = Arc::clone(&queue);
                        let consumed = Arc::clone(&consumed);
                        thread::spawn(move || {
                            let mut local = 0u64;
                            while local < 2000 {
                                if queue.try_pop().is_some() {
                                    local += 1;
                                } else {
                                    std::hint::spin_loop();
                                }
                            }
                            consumed.fetch_add(local, std::sync::atomic::Ordering::Relaxed);
                        })
                    })
                    .collect();
                for h in producers {
                    h.join().unwrap();
                }
                for h in consumers {
                    h.join().unwrap();
                }
                black_box(consumed.load(std::sync::atomic::Ordering::Relaxed));
            });
        });
    }
    group.finish();
}

fn main() {
    let mut criterion = Criterion::default().configure_from_args();
    single_thread_push_pop(&mut criterion);
    producers_then_drain(&mut criterion);
    concurrent_producers_and_consumers(&mut criterion);
    criterion.final_summary();
}
