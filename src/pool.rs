//! Bounded worker pool (spec.md §4.D `pool_connect`/`pool_io`), grounded
//! on the channel-plus-thread shape in
//! `examples/other_examples/b74c2448_ryanseipp-rask-old__src-worker.rs.rs`'s
//! `Worker::run`, and on `examples/original_source/include/worker.h`'s
//! fixed-size thread array for the "reject rather than grow" sizing
//! policy (spec.md §7).

use crate::error::ServerError;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::thread::JoinHandle;

/// A fixed set of OS threads draining a bounded task queue. Submission
/// never blocks: a full queue is a `PoolOverflow`, which the dispatcher
/// treats as fatal (spec.md §7: "the design explicitly chooses to reject
/// rather than grow").
pub struct Pool<T: Send + 'static> {
  name: &'static str,
  capacity: usize,
  sender: Sender<T>,
  handles: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> Pool<T> {
  /// Spawns `workers` threads, each running `task(item)` in a loop pulled
  /// from a channel of capacity `capacity`.
  pub fn new<F>(name: &'static str, workers: usize, capacity: usize, task: F) -> Self
  where
    F: Fn(T) + Send + Clone + 'static,
  {
    let (sender, receiver): (Sender<T>, Receiver<T>) = crossbeam_channel::bounded(capacity);
    let mut handles = Vec::with_capacity(workers);
    for i in 0..workers {
      let receiver = receiver.clone();
      let task = task.clone();
      let handle = std::thread::Builder::new()
        .name(format!("{name}-{i}"))
        .spawn(move || {
          while let Ok(item) = receiver.recv() {
            task(item);
          }
        })
        .expect("failed to spawn pool worker thread");
      handles.push(handle);
    }
    Pool {
      name,
      capacity,
      sender,
      handles,
    }
  }

  /// Enqueues `item`, failing fast with `PoolOverflow` instead of
  /// blocking the caller (which would be the single listener thread).
  pub fn submit(&self, item: T) -> Result<(), ServerError> {
    match self.sender.try_send(item) {
      Ok(()) => Ok(()),
      Err(TrySendError::Full(_)) => Err(ServerError::PoolOverflow {
        pool: self.name,
        capacity: self.capacity,
      }),
      Err(TrySendError::Disconnected(_)) => unreachable!("pool workers outlive their sender"),
    }
  }

  /// Drops the sender (unblocking every worker's `recv`) and joins all
  /// threads; used for graceful shutdown.
  pub fn shutdown(self) {
    drop(self.sender);
    for handle in self.handles {
      let _ = handle.join();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  #[test]
  fn submitted_tasks_run_on_worker_threads() {
    let counter = Arc::new(AtomicUsize::new(0));
    let worker_counter = counter.clone();
    let pool = Pool::new("test", 2, 16, move |n: usize| {
      worker_counter.fetch_add(n, Ordering::SeqCst);
    });
    for i in 0..10 {
      pool.submit(i).unwrap();
    }
    pool.shutdown();
    assert_eq!(counter.load(Ordering::SeqCst), (0..10).sum());
  }

  #[test]
  fn full_queue_overflows_instead_of_blocking() {
    let pool: Pool<()> = Pool::new("blocked", 0, 1, |_| {});
    pool.submit(()).unwrap();
    let err = pool.submit(()).unwrap_err();
    assert!(matches!(err, ServerError::PoolOverflow { pool: "blocked", capacity: 1 }));
  }
}
