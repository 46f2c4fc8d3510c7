use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::batch::{deadline, Batch};
use crate::lines::lines_count;

/// Invoked with `(lines, remaining_retries, expires)` for every item dropped
/// from the retry buffer to stay within its limit.
pub type RetrySkippedCallback = Arc<dyn Fn(&Bytes, u32, Instant) + Send + Sync>;

/// A batch waiting for its next attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryItem {
    pub lines: Bytes,
    pub line_count: usize,
    pub retry_count: u32,
    pub retry_time: Instant,
    pub expires: Instant,
}

impl From<RetryItem> for Batch {
    fn from(item: RetryItem) -> Self {
        Batch {
            lines: item.lines,
            remaining_attempts: item.retry_count,
            expires_at: item.expires,
        }
    }
}

struct State {
    items: VecDeque<RetryItem>,
    size: usize,
    closed: bool,
    timer: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<State>,
    max_size: usize,
    dispatch: mpsc::UnboundedSender<Batch>,
    on_remove: Option<RetrySkippedCallback>,
}

/// Bounded holding area for batches awaiting a scheduled retry.
///
/// Items are kept sorted by retry time. A single timer task always targets
/// the earliest item; when it fires, every due item is sent back to the
/// sending loop through the dispatch channel. The total line count never
/// exceeds `max_size`: on overflow the items closest to expiry are evicted.
#[derive(Clone)]
pub struct RetryBuffer {
    shared: Arc<Shared>,
}

impl RetryBuffer {
    /// Create a buffer holding at most `max_size` lines.
    pub fn new(
        max_size: usize,
        dispatch: mpsc::UnboundedSender<Batch>,
        on_remove: Option<RetrySkippedCallback>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    items: VecDeque::new(),
                    size: 0,
                    closed: false,
                    timer: None,
                }),
                max_size,
                dispatch,
                on_remove,
            }),
        }
    }

    /// Schedule `lines` for another attempt after `delay`.
    ///
    /// The retry time is clamped to `expires`. Empty input and calls after
    /// [`close`](Self::close) are ignored.
    pub async fn add_lines(
        &self,
        lines: Bytes,
        retry_count: u32,
        delay: Duration,
        expires: Instant,
    ) {
        if lines.is_empty() {
            return;
        }

        let mut state = self.shared.state.lock().await;
        if state.closed {
            return;
        }

        let retry_time = deadline(Instant::now(), delay).min(expires);
        let item = RetryItem {
            line_count: lines_count(&lines),
            lines,
            retry_count,
            retry_time,
            expires,
        };

        if item.line_count > self.shared.max_size {
            self.shared.report_removed(&item);
            return;
        }

        let mut reschedule = false;
        if state.size + item.line_count > self.shared.max_size {
            reschedule = self.shared.evict(&mut state, item.line_count);
        }

        let index = state
            .items
            .partition_point(|held| held.retry_time <= item.retry_time);
        state.size += item.line_count;
        debug!(
            lines = item.line_count,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            "Scheduled batch for retry"
        );
        state.items.insert(index, item);

        if reschedule || index == 0 {
            Shared::schedule(&self.shared, &mut state);
        }
    }

    /// Dispatch every held item immediately, ignoring retry times.
    ///
    /// Returns the number of batches dispatched.
    pub async fn flush(&self) -> usize {
        let mut state = self.shared.state.lock().await;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        let items: Vec<RetryItem> = state.items.drain(..).collect();
        state.size = 0;
        let count = items.len();
        for item in items {
            self.shared.send(item);
        }
        count
    }

    /// Stop the timer and refuse further items.
    ///
    /// Returns the number of lines still held, which are never sent.
    pub async fn close(&self) -> usize {
        let mut state = self.shared.state.lock().await;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.closed = true;
        state.size
    }

    /// Total number of lines held.
    pub async fn len(&self) -> usize {
        self.shared.state.lock().await.size
    }

    /// Check if the buffer is empty.
    pub async fn is_empty(&self) -> bool {
        self.shared.state.lock().await.items.is_empty()
    }

    /// Get all held items, earliest retry first, without removing them.
    pub async fn peek_all(&self) -> Vec<RetryItem> {
        self.shared.state.lock().await.items.iter().cloned().collect()
    }
}

impl Shared {
    /// Drop items closest to expiry until the size is at most 70% of what it
    /// was and `incoming` lines fit. Returns true if the head was removed.
    fn evict(&self, state: &mut State, incoming: usize) -> bool {
        let target = state.size * 7 / 10;
        let mut head_removed = false;

        while state.size > target || state.size + incoming > self.max_size {
            let Some(index) = earliest_expiry(&state.items) else {
                break;
            };
            let Some(item) = state.items.remove(index) else {
                break;
            };
            head_removed |= index == 0;
            state.size -= item.line_count;
            self.report_removed(&item);
        }
        head_removed
    }

    fn report_removed(&self, item: &RetryItem) {
        if let Some(on_remove) = &self.on_remove {
            on_remove(&item.lines, item.retry_count, item.expires);
        }
        warn!(
            lines = item.line_count,
            limit = self.max_size,
            "Retry buffer full, dropped lines"
        );
    }

    fn send(&self, item: RetryItem) {
        if self.dispatch.send(item.into()).is_err() {
            debug!("Sending loop is gone, discarding retry");
        }
    }

    /// Point the single timer at the current head, replacing any previous one.
    fn schedule(shared: &Arc<Self>, state: &mut State) {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if let Some(head) = state.items.front() {
            let at = head.retry_time;
            let weak = Arc::downgrade(shared);
            state.timer = Some(tokio::spawn(Self::fire_at(weak, at)));
        }
    }

    async fn fire_at(shared: Weak<Self>, at: Instant) {
        tokio::time::sleep_until(at).await;
        let Some(shared) = shared.upgrade() else {
            return;
        };

        let mut state = shared.state.lock().await;
        if state.closed {
            return;
        }
        // This task is the current timer; let it finish instead of aborting it.
        state.timer.take();

        let now = Instant::now();
        while state.items.front().is_some_and(|head| head.retry_time <= now) {
            if let Some(item) = state.items.pop_front() {
                state.size -= item.line_count;
                shared.send(item);
            }
        }
        Self::schedule(&shared, &mut state);
    }
}

fn earliest_expiry(items: &VecDeque<RetryItem>) -> Option<usize> {
    items
        .iter()
        .enumerate()
        .min_by_key(|(_, item)| item.expires)
        .map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn lines(n: usize) -> Bytes {
        Bytes::from("m v=1\n".repeat(n))
    }

    fn buffer(max_size: usize) -> (RetryBuffer, mpsc::UnboundedReceiver<Batch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RetryBuffer::new(max_size, tx, None), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_items_sorted_by_retry_time() {
        let (buffer, _rx) = buffer(100);
        let expires = Instant::now() + Duration::from_secs(60);

        buffer.add_lines(lines(1), 3, Duration::from_secs(3), expires).await;
        buffer.add_lines(lines(2), 3, Duration::from_secs(1), expires).await;
        buffer.add_lines(lines(3), 3, Duration::from_secs(2), expires).await;

        let counts: Vec<usize> = buffer
            .peek_all()
            .await
            .iter()
            .map(|item| item.line_count)
            .collect();
        assert_eq!(counts, vec![2, 3, 1]);
        assert_eq!(buffer.len().await, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_time_clamped_to_expiry() {
        let (buffer, _rx) = buffer(100);
        let expires = Instant::now() + Duration::from_millis(500);

        buffer.add_lines(lines(1), 3, Duration::from_secs(10), expires).await;

        let items = buffer.peek_all().await;
        assert_eq!(items[0].retry_time, expires);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_dispatches_in_retry_order() {
        let (buffer, mut rx) = buffer(100);
        let expires = Instant::now() + Duration::from_secs(60);

        buffer.add_lines(lines(1), 4, Duration::from_secs(2), expires).await;
        buffer.add_lines(lines(2), 2, Duration::from_secs(1), expires).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.lines, lines(2));
        assert_eq!(first.remaining_attempts, 2);
        assert_eq!(first.expires_at, expires);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.lines, lines(1));
        assert_eq!(second.remaining_attempts, 4);

        assert!(buffer.is_empty().await);
        assert_eq!(buffer.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_head_reschedules_timer() {
        let (buffer, mut rx) = buffer(100);
        let expires = Instant::now() + Duration::from_secs(60);
        let start = Instant::now();

        buffer.add_lines(lines(1), 1, Duration::from_secs(10), expires).await;
        buffer.add_lines(lines(2), 1, Duration::from_secs(1), expires).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.lines, lines(2));
        assert!(Instant::now() - start < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_keeps_latest_expiries() {
        let removed = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&removed);
        let (tx, _rx) = mpsc::unbounded_channel();
        let buffer = RetryBuffer::new(
            10,
            tx,
            Some(Arc::new(move |lines: &Bytes, retries: u32, _expires: Instant| {
                sink.lock().unwrap().push((lines_count(lines), retries));
            })),
        );
        let now = Instant::now();

        // Expiry order differs from retry order.
        buffer
            .add_lines(lines(3), 1, Duration::from_secs(1), now + Duration::from_secs(50))
            .await;
        buffer
            .add_lines(lines(3), 2, Duration::from_secs(2), now + Duration::from_secs(10))
            .await;
        buffer
            .add_lines(lines(3), 3, Duration::from_secs(3), now + Duration::from_secs(30))
            .await;
        assert_eq!(buffer.len().await, 9);

        buffer
            .add_lines(lines(5), 4, Duration::from_secs(4), now + Duration::from_secs(40))
            .await;

        // Dropping the 10s item reaches the 70% mark, but the new item only
        // fits once the 30s item is gone as well.
        assert_eq!(*removed.lock().unwrap(), vec![(3, 2), (3, 3)]);
        let kept: Vec<u32> = buffer
            .peek_all()
            .await
            .iter()
            .map(|item| item.retry_count)
            .collect();
        assert_eq!(kept, vec![1, 4]);
        assert_eq!(buffer.len().await, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_item_is_skipped() {
        let removed = Arc::new(StdMutex::new(0usize));
        let sink = Arc::clone(&removed);
        let (tx, _rx) = mpsc::unbounded_channel();
        let buffer = RetryBuffer::new(
            4,
            tx,
            Some(Arc::new(move |lines: &Bytes, _retries: u32, _expires: Instant| {
                *sink.lock().unwrap() += lines_count(lines);
            })),
        );
        let expires = Instant::now() + Duration::from_secs(60);

        buffer.add_lines(lines(2), 1, Duration::from_secs(1), expires).await;
        buffer.add_lines(lines(5), 1, Duration::from_secs(1), expires).await;

        assert_eq!(*removed.lock().unwrap(), 5);
        assert_eq!(buffer.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_dispatches_everything_now() {
        let (buffer, mut rx) = buffer(100);
        let expires = Instant::now() + Duration::from_secs(600);

        buffer.add_lines(lines(1), 1, Duration::from_secs(100), expires).await;
        buffer.add_lines(lines(2), 1, Duration::from_secs(200), expires).await;

        assert_eq!(buffer.flush().await, 2);
        assert_eq!(rx.try_recv().unwrap().lines, lines(1));
        assert_eq!(rx.try_recv().unwrap().lines, lines(2));
        assert!(buffer.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_timer_and_rejects_items() {
        let (buffer, mut rx) = buffer(100);
        let expires = Instant::now() + Duration::from_secs(60);

        buffer.add_lines(lines(2), 1, Duration::from_secs(1), expires).await;
        assert_eq!(buffer.close().await, 2);

        buffer.add_lines(lines(1), 1, Duration::from_secs(1), expires).await;
        assert_eq!(buffer.len().await, 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_lines_ignored() {
        let (buffer, _rx) = buffer(100);
        buffer
            .add_lines(Bytes::new(), 1, Duration::from_secs(1), Instant::now())
            .await;
        assert!(buffer.is_empty().await);
    }
}
