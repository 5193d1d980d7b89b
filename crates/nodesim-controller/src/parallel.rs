//! Bounded fan-out over independent items

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::error;

/// Apply `op` to every item with at most `workers` operations in flight
///
/// Items are pushed into a closed channel up front and drained by the
/// workers, so each item is handled exactly once. Returns after every item
/// has been processed. A worker count of 0 is treated as 1. An operation that
/// panics is logged and the worker moves on to the next item.
pub async fn parallelize<T, F, Fut>(items: Vec<T>, workers: usize, op: F)
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if items.is_empty() {
        return;
    }
    let workers = workers.max(1).min(items.len());

    let (tx, rx) = mpsc::unbounded_channel();
    for item in items {
        // The receiver is alive until the end of this function
        let _ = tx.send(item);
    }
    drop(tx);

    let rx = Arc::new(Mutex::new(rx));
    let op = Arc::new(op);
    let mut tasks = JoinSet::new();

    for _ in 0..workers {
        let rx = rx.clone();
        let op = op.clone();
        tasks.spawn(async move {
            loop {
                let item = rx.lock().await.recv().await;
                let Some(item) = item else {
                    break;
                };
                if let Err(e) = tokio::spawn(op(item)).await {
                    error!("Fan-out operation failed: {}", e);
                }
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("Fan-out worker failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_every_item_processed_once() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        parallelize((0..100).collect(), 5, move |i: usize| {
            let sink = sink.clone();
            async move {
                sink.lock().push(i);
            }
        })
        .await;

        let mut seen = seen.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (current, max) = (in_flight.clone(), peak.clone());
        parallelize((0..20).collect(), 3, move |_: usize| {
            let current = current.clone();
            let max = max.clone();
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;

        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_zero_workers_still_runs() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        parallelize(vec![(); 4], 0, move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_panicking_item_does_not_stop_others() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        parallelize((0..10).collect(), 1, move |i: usize| {
            let counter = counter.clone();
            async move {
                if i == 3 {
                    panic!("boom");
                }
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;
        assert_eq!(count.load(Ordering::SeqCst), 9);
    }

    #[tokio::test]
    async fn test_empty_input() {
        parallelize(Vec::<usize>::new(), 5, |_| async {}).await;
    }
}
