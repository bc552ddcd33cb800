use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use telemetry::Sample;
use tokio::sync::Notify;

/// A fixed-capacity many-writer / single-reader queue of Samples with
/// drop-oldest overflow semantics.
///
/// `publish` never blocks and never fails while the queue is open: when the
/// queue is full it evicts the oldest resident sample to make room for the
/// new arrival. Eviction and the dropped counter share one critical section,
/// so the counter is exact. Acquisition handlers call `publish` directly and
/// must never be exposed to storage latency through it.
pub struct SampleQueue {
    // Guards the ring and the closed flag. Never held across an await.
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    depth: AtomicUsize,
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

struct Inner {
    ring: VecDeque<Sample>,
    closed: bool,
}

impl SampleQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                ring: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            depth: AtomicUsize::new(0),
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueues `sample`, evicting the oldest resident sample when full.
    /// Returns false iff the queue has been closed, in which case the sample
    /// is discarded silently.
    pub fn publish(&self, sample: Sample) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return false;
            }
            if inner.ring.len() == self.capacity {
                inner.ring.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            inner.ring.push_back(sample);
            self.depth.store(inner.ring.len(), Ordering::Relaxed);
        }
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        true
    }

    /// Pops the oldest sample, if any. Non-blocking; serves the single consumer.
    pub fn try_pop(&self) -> Option<Sample> {
        let mut inner = self.inner.lock().unwrap();
        let sample = inner.ring.pop_front();
        self.depth.store(inner.ring.len(), Ordering::Relaxed);
        sample
    }

    /// Waits until the queue is non-empty, returning true, or until it is
    /// closed-and-empty or `timeout` elapses, returning false.
    pub async fn wait_non_empty(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Arm the waiter before inspecting state, so a publish that
            // lands in between is not missed.
            let notified = self.notify.notified();
            {
                let inner = self.inner.lock().unwrap();
                if !inner.ring.is_empty() {
                    return true;
                }
                if inner.closed {
                    return false;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.depth() > 0;
            }
        }
    }

    /// Closes the queue: pending and future waiters return, and subsequent
    /// publishes fail silently. Already-queued samples remain poppable.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current queue depth. Readable without blocking publishers.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Total samples accepted by `publish` over the queue's lifetime.
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Total samples evicted by drop-oldest overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    fn sample(node: &str, seq: i64) -> Sample {
        serde_json::from_value(serde_json::json!({
            "serverId": "plc-1",
            "serverName": "PLC 1",
            "timestampUtc": "2024-05-17T09:30:00Z",
            "nodeId": node,
            "displayName": node,
            "browsePath": format!("Plant/{node}"),
            "dataType": "Int64",
            "value": {"type": "int", "value": seq},
            "statusCode": 0,
            "quality": "Good",
        }))
        .unwrap()
    }

    fn seq_of(sample: &Sample) -> i64 {
        match sample.value {
            telemetry::SampleValue::Int(seq) => seq,
            _ => panic!("unexpected value"),
        }
    }

    #[test]
    fn overflow_evicts_oldest_and_counts() {
        let queue = SampleQueue::new(3);
        for seq in 0..5 {
            assert!(queue.publish(sample("n", seq)));
        }
        assert_eq!(queue.depth(), 3);
        assert_eq!(queue.enqueued(), 5);
        assert_eq!(queue.dropped(), 2);

        // The surviving tail is the newest three, in publish order.
        let survived: Vec<i64> = std::iter::from_fn(|| queue.try_pop())
            .map(|sample| seq_of(&sample))
            .collect();
        assert_eq!(survived, vec![2, 3, 4]);
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn wait_returns_when_published() {
        let queue = Arc::new(SampleQueue::new(8));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_non_empty(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        queue.publish(sample("n", 1));
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_on_empty_queue() {
        let queue = SampleQueue::new(8);
        assert!(!queue.wait_non_empty(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn close_wakes_waiters_and_rejects_publishes() {
        let queue = Arc::new(SampleQueue::new(8));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_non_empty(Duration::from_secs(60)).await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert!(!waiter.await.unwrap());
        assert!(!queue.publish(sample("n", 1)));
        assert_eq!(queue.enqueued(), 0);
    }

    #[tokio::test]
    async fn queued_samples_survive_close() {
        let queue = SampleQueue::new(8);
        queue.publish(sample("n", 1));
        queue.close();
        assert!(queue.try_pop().is_some());
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_publishers_never_exceed_capacity() {
        let queue = Arc::new(SampleQueue::new(16));
        let mut tasks = Vec::new();
        for writer in 0..4 {
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move {
                for seq in 0..250 {
                    queue.publish(sample(&format!("w{writer}"), seq));
                    assert!(queue.depth() <= queue.capacity());
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(queue.enqueued(), 1_000);
        assert_eq!(queue.dropped() as usize, 1_000 - queue.depth());
    }
}
