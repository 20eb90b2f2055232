//! Best-effort concurrent collection with a bounded worker pool.
//!
//! Fan-out points in the generation pipeline (initial candidates, improvement
//! rounds, critique and rating passes, parallel branches) all share the same
//! shape: spawn independent tasks, collect whatever completes within a
//! per-result deadline, and drop stragglers without blocking on them. The
//! dropped subset is implicit in the returned vector, so callers can log and
//! move on.

use std::collections::VecDeque;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, instrument, warn};

/// A unit of fan-out work.
pub type Task<T> = Box<dyn FnOnce() -> T + Send>;

/// Run `tasks` on at most `max_workers` worker threads and collect results
/// in completion order.
///
/// Each result retrieval waits at most `per_task_timeout`; once a wait
/// expires, remaining in-flight tasks are abandoned (their worker threads are
/// detached, not killed — any subprocess they drive is reaped by its own
/// execution timeout). Returns only the results that arrived in time.
#[instrument(skip_all, fields(tasks = tasks.len(), max_workers))]
pub fn run<T: Send + 'static>(
    tasks: Vec<Task<T>>,
    per_task_timeout: Duration,
    max_workers: usize,
) -> Vec<T> {
    let total = tasks.len();
    if total == 0 {
        return Vec::new();
    }

    let queue: Arc<Mutex<VecDeque<Task<T>>>> = Arc::new(Mutex::new(tasks.into_iter().collect()));
    let (tx, rx) = mpsc::channel::<T>();

    let workers = max_workers.max(1).min(total);
    for _ in 0..workers {
        let queue = Arc::clone(&queue);
        let tx = tx.clone();
        thread::spawn(move || {
            loop {
                let task = {
                    let mut queue = queue.lock().expect("task queue poisoned");
                    queue.pop_front()
                };
                let Some(task) = task else {
                    break;
                };
                // A dropped receiver means the collector gave up; drain the
                // queue anyway so detached work finishes quietly.
                let _ = tx.send(task());
            }
        });
    }
    drop(tx);

    let mut collected = Vec::with_capacity(total);
    while collected.len() < total {
        match rx.recv_timeout(per_task_timeout) {
            Ok(result) => collected.push(result),
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    collected = collected.len(),
                    total, "collection deadline passed, dropping stragglers"
                );
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(collected = collected.len(), total, "gather finished");
    collected
}
