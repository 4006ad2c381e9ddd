//! A bounded queue that drops the *oldest* pending item on overflow rather
//! than rejecting or blocking the pusher (§4.6: "bound queue length to
//! `maxPending`, dropping oldest on overflow"). `tokio::sync::mpsc` only
//! offers backpressure-by-blocking or reject-on-full, neither of which
//! matches that policy, so the node's request/reply dispatchers use this
//! small ring buffer instead.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::Notify;

struct Inner<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
}

/// The producer half. Cheap to clone; many transports/callers may push into
/// the same mailbox concurrently.
#[derive(Clone)]
pub struct MailboxSender<T> {
    inner: Arc<Inner<T>>,
}

pub struct MailboxReceiver<T> {
    inner: Arc<Inner<T>>,
}

pub fn bounded<T>(capacity: usize) -> (MailboxSender<T>, MailboxReceiver<T>) {
    let inner = Arc::new(Inner {
        queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        notify: Notify::new(),
        capacity: capacity.max(1),
    });
    (
        MailboxSender { inner: inner.clone() },
        MailboxReceiver { inner },
    )
}

impl<T> MailboxSender<T> {
    /// Push an item, dropping the oldest queued item if already at
    /// capacity. Never blocks.
    pub fn push(&self, item: T) {
        let mut queue = self.inner.queue.lock().unwrap();
        if queue.len() >= self.inner.capacity {
            queue.pop_front();
        }
        queue.push_back(item);
        drop(queue);
        self.inner.notify.notify_one();
    }
}

impl<T> MailboxReceiver<T> {
    pub async fn recv(&mut self) -> T {
        loop {
            {
                let mut queue = self.inner.queue.lock().unwrap();
                if let Some(item) = queue.pop_front() {
                    return item;
                }
            }
            self.inner.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drops_oldest_on_overflow() {
        let (tx, mut rx) = bounded(2);
        tx.push(1);
        tx.push(2);
        tx.push(3); // 1 is dropped
        assert_eq!(rx.recv().await, 2);
        assert_eq!(rx.recv().await, 3);
    }

    #[tokio::test]
    async fn recv_waits_for_push() {
        let (tx, mut rx) = bounded::<u32>(4);
        let handle = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        tx.push(42);
        assert_eq!(handle.await.unwrap(), 42);
    }
}
