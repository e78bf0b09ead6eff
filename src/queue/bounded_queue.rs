use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::types::QueueState;

/// Minimum `drain` deadline regardless of what the caller asks for.
const MIN_DRAIN_DEADLINE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error, Clone, Copy)]
pub enum EnqueueError {
    #[error("queue is not accepting new items")]
    QueueClosed,
    #[error("queue is full (max {max_queue})")]
    QueueFull { max_queue: usize },
}

type Processor<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

struct Shared<T> {
    items: Mutex<VecDeque<T>>,
    in_flight: AtomicUsize,
    accepting: AtomicBool,
    max_queue: usize,
    item_available: Notify,
    drained: Notify,
}

/// A bounded FIFO backed by a fixed worker pool. `accepting` gates `enqueue`
/// independently of the queue's contents: flipping it and checking it race-free
/// requires the same mutex that protects the FIFO itself.
pub struct BoundedQueue<T> {
    shared: Arc<Shared<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> BoundedQueue<T> {
    pub fn start<F, Fut>(concurrency: usize, max_queue: usize, processor: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let processor: Processor<T> = Arc::new(move |item| Box::pin(processor(item)));
        let shared = Arc::new(Shared {
            items: Mutex::new(VecDeque::new()),
            in_flight: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            max_queue,
            item_available: Notify::new(),
            drained: Notify::new(),
        });

        let workers = (0..concurrency)
            .map(|_| {
                let shared = Arc::clone(&shared);
                let processor = Arc::clone(&processor);
                tokio::spawn(worker_loop(shared, processor))
            })
            .collect();

        Self { shared, workers }
    }

    pub fn enqueue(&self, item: T) -> Result<(), EnqueueError> {
        let mut items = self.shared.items.lock().expect("queue mutex poisoned");
        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err(EnqueueError::QueueClosed);
        }
        if items.len() >= self.shared.max_queue {
            return Err(EnqueueError::QueueFull { max_queue: self.shared.max_queue });
        }
        items.push_back(item);
        drop(items);
        self.shared.item_available.notify_one();
        Ok(())
    }

    pub fn stop_accepting(&self) {
        self.shared.accepting.store(false, Ordering::Release);
    }

    /// Returns `true` once `queueLength == 0 && inFlight == 0`, else `false` after the
    /// deadline. The deadline is never allowed below 1s.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout.max(MIN_DRAIN_DEADLINE);
        loop {
            if self.is_drained() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.is_drained();
            }
            tokio::select! {
                _ = self.shared.drained.notified() => {}
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }

    fn is_drained(&self) -> bool {
        let queue_length = self.shared.items.lock().expect("queue mutex poisoned").len();
        queue_length == 0 && self.shared.in_flight.load(Ordering::Acquire) == 0
    }

    pub fn get_state(&self) -> QueueState {
        let queue_length = self.shared.items.lock().expect("queue mutex poisoned").len();
        QueueState {
            queue_length,
            in_flight: self.shared.in_flight.load(Ordering::Acquire),
            accepting: self.shared.accepting.load(Ordering::Acquire),
            max_queue: self.shared.max_queue,
        }
    }
}

impl<T> Drop for BoundedQueue<T> {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

async fn worker_loop<T: Send + 'static>(shared: Arc<Shared<T>>, processor: Processor<T>) {
    loop {
        let item = loop {
            let popped = shared.items.lock().expect("queue mutex poisoned").pop_front();
            match popped {
                Some(item) => break item,
                None => shared.item_available.notified().await,
            }
        };

        shared.in_flight.fetch_add(1, Ordering::AcqRel);
        // A panicking processor must not take the worker down with it.
        let result = std::panic::AssertUnwindSafe(processor(item)).catch_unwind().await;
        if let Err(panic) = result {
            tracing::error!(?panic, "queue processor panicked; worker slot recovered");
        }
        shared.in_flight.fetch_sub(1, Ordering::AcqRel);
        shared.drained.notify_waiters();
    }
}
