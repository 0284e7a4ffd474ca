//! Selection Keys
//!
//! Every connection has a [`SelectionKey`] holding the readiness it is
//! interested in. The key is read by the connection's channel driver, a
//! task on the IO runtime that waits for exactly the readiness the key asks
//! for.
//!
//! Only the IO thread changes a key. Worker threads that want read or write
//! interest toggled queue a [`ServerTask`](super::ServerTask) instead, which
//! the event loop runs on the IO thread; when the caller already is the IO
//! thread the change happens inline.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio::sync::Notify;

/// Interest in read readiness.
pub(crate) const OP_READ: u8 = 0b01;

/// Interest in write readiness.
pub(crate) const OP_WRITE: u8 = 0b10;

#[derive(Debug, Default)]
pub(crate) struct SelectionKey {
    interest: AtomicU8,
    cancelled: AtomicBool,
    changed: Notify,
}

impl SelectionKey {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn interest(&self) -> u8 {
        self.interest.load(Ordering::Acquire)
    }

    pub(crate) fn add(&self, op: u8) {
        let before = self.interest.fetch_or(op, Ordering::AcqRel);
        if before & op == 0 {
            self.changed.notify_one();
        }
    }

    pub(crate) fn remove(&self, op: u8) {
        let before = self.interest.fetch_and(!op, Ordering::AcqRel);
        if before & op != 0 {
            self.changed.notify_one();
        }
    }

    /// Stops the channel driver for good.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.interest.store(0, Ordering::Release);
        self.changed.notify_one();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Completes after the next interest change or cancellation.
    pub(crate) async fn changed(&self) {
        self.changed.notified().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_interest_bits() {
        let key = SelectionKey::new();
        assert_eq!(key.interest(), 0);

        key.add(OP_READ);
        key.add(OP_WRITE);
        assert!(key.interest() & OP_READ != 0);
        assert!(key.interest() & OP_WRITE != 0);

        key.remove(OP_READ);
        assert_eq!(key.interest() & OP_READ, 0);
        assert_eq!(key.interest(), OP_WRITE);
    }

    #[test]
    fn test_cancel_clears_interest() {
        let key = SelectionKey::new();
        key.add(OP_READ);
        key.cancel();
        assert!(key.is_cancelled());
        assert_eq!(key.interest(), 0);
    }

    #[tokio::test]
    async fn test_change_wakes_waiter() {
        let key = SelectionKey::new();
        key.add(OP_READ);

        // The change stored a permit, so this completes at once
        tokio::time::timeout(Duration::from_secs(1), key.changed())
            .await
            .expect("interest change should wake the driver");
    }

    #[tokio::test]
    async fn test_no_op_change_does_not_wake() {
        let key = SelectionKey::new();
        key.remove(OP_WRITE);

        let waited = tokio::time::timeout(Duration::from_millis(50), key.changed()).await;
        assert!(waited.is_err());
    }
}
