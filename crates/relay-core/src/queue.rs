//! Bounded async producer/consumer queue (§4.1, C1).
//!
//! A FIFO queue shared between writers (control pump, rendezvous engine)
//! and readers (the application calling `Listener::accept_connection`,
//! and internally `wait_for_item`). State transitions `Open -> Shutdown ->
//! Closed` are one-way. Callbacks registered on an item (`on_dequeue`) run
//! outside the internal lock, exactly once per item, whether the item is
//! delivered to a reader or disposed at shutdown/close.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;

/// A callback invoked exactly once when an item leaves the queue, whether by
/// delivery to a reader or disposal at close.
pub type OnDequeue = Box<dyn FnOnce() + Send>;

/// A disposer invoked for `Value` items that are dropped at `close()` without
/// ever being delivered, to release whatever resource they hold (e.g. an
/// unaccepted duplex stream's socket).
pub type ItemDisposer<T> = Box<dyn Fn(&T) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Shutdown,
    Closed,
}

enum Payload<T> {
    Value(T),
    Error(RelayError),
}

struct Entry<T> {
    payload: Payload<T>,
    on_dequeue: Option<OnDequeue>,
}

impl<T> Entry<T> {
    fn value(value: T, on_dequeue: Option<OnDequeue>) -> Self {
        Self { payload: Payload::Value(value), on_dequeue }
    }

    fn error(err: RelayError, on_dequeue: Option<OnDequeue>) -> Self {
        Self { payload: Payload::Error(err), on_dequeue }
    }
}

enum WaiterSignal<T> {
    Entry(Entry<T>),
    Closed,
    Error(RelayError),
}

struct Inner<T> {
    state: State,
    available: VecDeque<Entry<T>>,
    pending: VecDeque<Entry<T>>,
    waiters: VecDeque<oneshot::Sender<WaiterSignal<T>>>,
}

/// What a `dequeue()` call resolves to.
pub enum QueueOutcome<T> {
    /// A value was delivered.
    Item(T),
    /// An enqueued error was delivered in place of a value.
    Error(RelayError),
    /// The queue is shut down/closed and has nothing left to deliver.
    Closed,
    /// The caller's cancellation token fired before an item arrived.
    Cancelled,
}

pub struct BoundedAsyncQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    item_disposer: Option<ItemDisposer<T>>,
}

impl<T: Send + 'static> BoundedAsyncQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Open,
                available: VecDeque::new(),
                pending: VecDeque::new(),
                waiters: VecDeque::new(),
            }),
            notify: Notify::new(),
            item_disposer: None,
        }
    }

    /// Installs a disposer invoked on any `Value` entry discarded at
    /// `close()` without ever reaching a reader.
    pub fn with_item_disposer(mut self, disposer: ItemDisposer<T>) -> Self {
        self.item_disposer = Some(disposer);
        self
    }

    /// Number of items immediately deliverable to the next `dequeue()`.
    pub fn available_len(&self) -> usize {
        self.inner.lock().available.len()
    }

    /// Number of items buffered but not yet promoted by `dispatch()`.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// `available_len() + pending_len()`; always `>= pending_len()` (§4.1
    /// invariant i).
    pub fn total_len(&self) -> usize {
        let g = self.inner.lock();
        g.available.len() + g.pending.len()
    }

    /// Accepts a value; if the queue is `Open` and a reader is waiting, the
    /// value is delivered to that reader immediately; otherwise it is stored
    /// as *available*. After `shutdown`/`close`, the value is disposed.
    pub fn enqueue_and_dispatch(&self, value: T, on_dequeue: Option<OnDequeue>) {
        self.deliver_or_store(Entry::value(value, on_dequeue));
    }

    /// Same as `enqueue_and_dispatch` but carrying an error in place of a
    /// value, per §3: a queue item is "either a value of type T or an
    /// exception".
    pub fn enqueue_error_and_dispatch(&self, err: RelayError, on_dequeue: Option<OnDequeue>) {
        self.deliver_or_store(Entry::error(err, on_dequeue));
    }

    /// Buffers a value as *pending* (not yet visible to readers). Returns
    /// `true` if a later `dispatch()` call is required to make it visible.
    pub fn enqueue_without_dispatch(&self, value: T, on_dequeue: Option<OnDequeue>) -> bool {
        let entry = Entry::value(value, on_dequeue);
        let mut g = self.inner.lock();
        match g.state {
            State::Open => {
                g.pending.push_back(entry);
                true
            }
            State::Shutdown => {
                drop(g);
                self.dispose_off_thread(entry);
                false
            }
            State::Closed => {
                drop(g);
                self.dispose_inline(entry);
                false
            }
        }
    }

    /// Promotes the oldest *pending* item to *available*, delivering it
    /// immediately if a reader is waiting.
    pub fn dispatch(&self) {
        let popped = {
            let mut g = self.inner.lock();
            g.pending.pop_front()
        };
        if let Some(entry) = popped {
            self.deliver_or_store(entry);
        }
    }

    /// Returns the oldest available item, suspending until one arrives, the
    /// queue is shut down/closed, or `cancel` fires.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> QueueOutcome<T> {
        loop {
            enum Next<T> {
                Return(QueueOutcome<T>),
                Wait(oneshot::Receiver<WaiterSignal<T>>),
            }

            let next = {
                let mut g = self.inner.lock();
                if let Some(entry) = g.available.pop_front() {
                    Next::Return(self.finish(entry))
                } else {
                    match g.state {
                        State::Open => {
                            let (tx, rx) = oneshot::channel();
                            g.waiters.push_back(tx);
                            Next::Wait(rx)
                        }
                        State::Shutdown | State::Closed => Next::Return(QueueOutcome::Closed),
                    }
                }
            };

            match next {
                Next::Return(outcome) => return outcome,
                Next::Wait(mut rx) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            // `deliver_or_store` may already have sent an entry into
                            // `rx` concurrently with our cancellation; a `biased`
                            // select always favors the cancel branch, so check for
                            // that race explicitly and put the entry back rather
                            // than dropping it (§8 invariant 2: exactly-once
                            // on_dequeue, never silently discarded).
                            if let Ok(WaiterSignal::Entry(entry)) = rx.try_recv() {
                                self.deliver_or_store(entry);
                            }
                            return QueueOutcome::Cancelled;
                        }
                        signal = &mut rx => {
                            match signal {
                                Ok(WaiterSignal::Entry(entry)) => return self.finish(entry),
                                Ok(WaiterSignal::Closed) => return QueueOutcome::Closed,
                                Ok(WaiterSignal::Error(e)) => return QueueOutcome::Error(e),
                                // Sender dropped without sending: can only happen if we
                                // raced a shutdown that drained waiters without signalling
                                // this one; retry against current state.
                                Err(_) => continue,
                            }
                        }
                    }
                }
            }
        }
    }

    /// Completes `true` once an item is available, `false` if the queue is
    /// shut down/closed with nothing left. Does not consume the item.
    pub async fn wait_for_item(&self, cancel: &CancellationToken) -> bool {
        loop {
            let notified = {
                let g = self.inner.lock();
                if !g.available.is_empty() {
                    return true;
                }
                match g.state {
                    State::Open => self.notify.notified(),
                    State::Shutdown | State::Closed => return false,
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = notified => continue,
            }
        }
    }

    /// `Open -> Shutdown`: no further writes are accepted (they are
    /// disposed); items already buffered may still be dequeued. Readers
    /// currently blocked (no item was available at their `dequeue()` call)
    /// are completed with `pending_error` if supplied, else with `Closed`.
    pub fn shutdown(&self, pending_error: Option<RelayError>) {
        let waiters = {
            let mut g = self.inner.lock();
            if g.state == State::Closed {
                return;
            }
            g.state = State::Shutdown;
            std::mem::take(&mut g.waiters)
        };
        for w in waiters {
            let signal = match &pending_error {
                Some(e) => WaiterSignal::Error(e.clone()),
                None => WaiterSignal::Closed,
            };
            let _ = w.send(signal);
        }
        self.notify.notify_waiters();
    }

    /// Transitions to `Closed`: completes all waiting readers with `Closed`,
    /// and disposes every remaining buffered item via `on_dequeue` and the
    /// item disposer.
    pub fn close(&self) {
        let (waiters, available, pending) = {
            let mut g = self.inner.lock();
            g.state = State::Closed;
            (
                std::mem::take(&mut g.waiters),
                std::mem::take(&mut g.available),
                std::mem::take(&mut g.pending),
            )
        };
        for w in waiters {
            let _ = w.send(WaiterSignal::Closed);
        }
        self.notify.notify_waiters();
        for entry in available.into_iter().chain(pending) {
            self.dispose_inline(entry);
        }
    }

    fn finish(&self, entry: Entry<T>) -> QueueOutcome<T> {
        if let Some(cb) = entry.on_dequeue {
            cb();
        }
        match entry.payload {
            Payload::Value(v) => QueueOutcome::Item(v),
            Payload::Error(e) => QueueOutcome::Error(e),
        }
    }

    fn dispose_inline(&self, entry: Entry<T>) {
        if let Payload::Value(v) = &entry.payload {
            if let Some(disposer) = &self.item_disposer {
                disposer(v);
            }
        }
        if let Some(cb) = entry.on_dequeue {
            cb();
        }
    }

    fn dispose_off_thread(&self, entry: Entry<T>)
    where
        T: 'static,
    {
        // `item_disposer` is not `'static`-safe to move across a spawn in
        // the general case, so off-thread disposal only runs the item's own
        // callback; the disposer itself still runs inline, mirroring the
        // common case where `on_dequeue` is what actually matters for
        // resource cleanup (closing a socket), and `item_disposer` is a
        // queue-wide fallback hook used by `close()`.
        if let Payload::Value(v) = &entry.payload {
            if let Some(disposer) = &self.item_disposer {
                disposer(v);
            }
        }
        if let Some(cb) = entry.on_dequeue {
            tokio::spawn(async move { cb() });
        }
    }

    fn deliver_or_store(&self, entry: Entry<T>) {
        let mut current = Some(entry);
        loop {
            let waiter = {
                let mut g = self.inner.lock();
                match g.state {
                    State::Open => match g.waiters.pop_front() {
                        Some(w) => Some(w),
                        None => {
                            g.available.push_back(current.take().expect("entry present"));
                            None
                        }
                    },
                    State::Shutdown | State::Closed => {
                        let is_closed = g.state == State::Closed;
                        drop(g);
                        let entry = current.take().expect("entry present");
                        if is_closed {
                            self.dispose_inline(entry);
                        } else {
                            self.dispose_off_thread(entry);
                        }
                        return;
                    }
                }
            };

            match waiter {
                None => return,
                Some(w) => {
                    let entry = current.take().expect("entry present");
                    match w.send(WaiterSignal::Entry(entry)) {
                        Ok(()) => return,
                        Err(WaiterSignal::Entry(returned)) => {
                            current = Some(returned);
                            continue;
                        }
                        Err(_) => return,
                    }
                }
            }
        }
    }
}

impl<T: Send + 'static> Default for BoundedAsyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::TrackingContext;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_error() -> RelayError {
        RelayError::new(crate::error::RelayErrorKind::Relay, "boom", TrackingContext::new(None))
    }

    #[tokio::test]
    async fn dequeue_returns_values_in_fifo_order() {
        let q: BoundedAsyncQueue<u32> = BoundedAsyncQueue::new();
        q.enqueue_and_dispatch(1, None);
        q.enqueue_and_dispatch(2, None);
        q.enqueue_and_dispatch(3, None);

        let cancel = CancellationToken::new();
        for expected in [1, 2, 3] {
            match q.dequeue(&cancel).await {
                QueueOutcome::Item(v) => assert_eq!(v, expected),
                _ => panic!("expected item"),
            }
        }
    }

    #[tokio::test]
    async fn dequeue_completes_inline_for_a_waiting_reader() {
        let q: Arc<BoundedAsyncQueue<u32>> = Arc::new(BoundedAsyncQueue::new());
        let cancel = CancellationToken::new();
        let reader = {
            let q = q.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { q.dequeue(&cancel).await })
        };
        tokio::task::yield_now().await;
        q.enqueue_and_dispatch(42, None);

        match reader.await.unwrap() {
            QueueOutcome::Item(v) => assert_eq!(v, 42),
            _ => panic!("expected item"),
        }
    }

    #[tokio::test]
    async fn dequeue_redelivers_an_entry_that_races_with_cancellation() {
        let q: Arc<BoundedAsyncQueue<u32>> = Arc::new(BoundedAsyncQueue::new());
        let cancel = CancellationToken::new();
        let reader = {
            let q = q.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { q.dequeue(&cancel).await })
        };
        tokio::task::yield_now().await; // let the reader register as a waiter

        // Cancel and deliver in the same tick so the reader's select sees
        // both its cancellation and the already-sent entry ready at once.
        cancel.cancel();
        q.enqueue_and_dispatch(7, None);

        match reader.await.unwrap() {
            QueueOutcome::Cancelled => {}
            _ => panic!("expected cancelled"),
        }

        let cancel2 = CancellationToken::new();
        match q.dequeue(&cancel2).await {
            QueueOutcome::Item(v) => assert_eq!(v, 7, "raced entry must be redelivered, not dropped"),
            _ => panic!("expected the raced item to be redelivered"),
        }
    }

    #[tokio::test]
    async fn on_dequeue_callback_runs_exactly_once_on_delivery() {
        let q: BoundedAsyncQueue<u32> = BoundedAsyncQueue::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        q.enqueue_and_dispatch(1, Some(Box::new(move || { count2.fetch_add(1, Ordering::SeqCst); })));

        let cancel = CancellationToken::new();
        let _ = q.dequeue(&cancel).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn on_dequeue_callback_runs_exactly_once_on_close_disposal() {
        let q: BoundedAsyncQueue<u32> = BoundedAsyncQueue::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        q.enqueue_and_dispatch(1, Some(Box::new(move || { count2.fetch_add(1, Ordering::SeqCst); })));
        q.close();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dequeue_after_close_returns_closed() {
        let q: BoundedAsyncQueue<u32> = BoundedAsyncQueue::new();
        q.close();
        let cancel = CancellationToken::new();
        assert!(matches!(q.dequeue(&cancel).await, QueueOutcome::Closed));
    }

    #[tokio::test]
    async fn shutdown_then_dequeue_of_buffered_item_still_succeeds() {
        let q: BoundedAsyncQueue<u32> = BoundedAsyncQueue::new();
        q.enqueue_and_dispatch(7, None);
        q.shutdown(None);
        let cancel = CancellationToken::new();
        assert!(matches!(q.dequeue(&cancel).await, QueueOutcome::Item(7)));
    }

    #[tokio::test]
    async fn shutdown_completes_blocked_reader_with_pending_error() {
        let q: Arc<BoundedAsyncQueue<u32>> = Arc::new(BoundedAsyncQueue::new());
        let cancel = CancellationToken::new();
        let reader = {
            let q = q.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { q.dequeue(&cancel).await })
        };
        tokio::task::yield_now().await;
        q.shutdown(Some(test_error()));
        assert!(matches!(reader.await.unwrap(), QueueOutcome::Error(_)));
    }

    #[tokio::test]
    async fn dequeue_cancellation_redelivers_to_another_reader() {
        let q: Arc<BoundedAsyncQueue<u32>> = Arc::new(BoundedAsyncQueue::new());
        let cancelled_token = CancellationToken::new();
        let q1 = q.clone();
        let t1 = cancelled_token.clone();
        let reader1 = tokio::spawn(async move { q1.dequeue(&t1).await });
        tokio::task::yield_now().await;

        // Cancel the first reader before any item arrives.
        cancelled_token.cancel();
        assert!(matches!(reader1.await.unwrap(), QueueOutcome::Cancelled));

        let never = CancellationToken::new();
        let q2 = q.clone();
        let reader2 = tokio::spawn(async move { q2.dequeue(&never).await });
        tokio::task::yield_now().await;
        q.enqueue_and_dispatch(99, None);
        assert!(matches!(reader2.await.unwrap(), QueueOutcome::Item(99)));
    }

    #[tokio::test]
    async fn enqueue_without_dispatch_requires_explicit_dispatch() {
        let q: BoundedAsyncQueue<u32> = BoundedAsyncQueue::new();
        let needs_dispatch = q.enqueue_without_dispatch(5, None);
        assert!(needs_dispatch);
        assert_eq!(q.available_len(), 0);
        assert_eq!(q.pending_len(), 1);

        q.dispatch();
        assert_eq!(q.available_len(), 1);
        assert_eq!(q.pending_len(), 0);
    }

    #[tokio::test]
    async fn wait_for_item_resolves_true_once_item_enqueued() {
        let q: Arc<BoundedAsyncQueue<u32>> = Arc::new(BoundedAsyncQueue::new());
        let cancel = CancellationToken::new();
        let waiter = {
            let q = q.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { q.wait_for_item(&cancel).await })
        };
        tokio::task::yield_now().await;
        q.enqueue_and_dispatch(1, None);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_item_resolves_false_on_close_with_nothing_buffered() {
        let q: Arc<BoundedAsyncQueue<u32>> = Arc::new(BoundedAsyncQueue::new());
        let cancel = CancellationToken::new();
        let waiter = {
            let q = q.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { q.wait_for_item(&cancel).await })
        };
        tokio::task::yield_now().await;
        q.close();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn total_len_is_never_less_than_pending_len() {
        let q: BoundedAsyncQueue<u32> = BoundedAsyncQueue::new();
        q.enqueue_without_dispatch(1, None);
        q.enqueue_and_dispatch(2, None);
        assert!(q.total_len() >= q.pending_len());
    }
}
