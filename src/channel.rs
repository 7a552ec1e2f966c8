//! FIFO hand-off queue shared by producer and consumer tasks.
//!
//! A bounded channel blocks `put` while full and `get` while empty. Unlike a
//! plain `mpsc` pair, any holder of the channel can `try_drain` it, which the
//! receiver uses to discard stale playback audio at the end of a reply burst.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;

/// The channel was closed while waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("channel closed")]
pub struct Closed;

/// Error returned by [`Channel::try_put`].
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TryPutError<T> {
    #[error("channel full")]
    Full(T),
    #[error("channel closed")]
    Closed(T),
}

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    /// Free slots; `None` when unbounded.
    slots: Option<Semaphore>,
    /// One permit per queued item.
    items: Semaphore,
    capacity: Option<usize>,
}

/// Cloning yields another handle to the same queue.
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &self.shared.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl<T> Channel<T> {
    /// A channel holding at most `capacity` items (minimum 1).
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    pub fn with_capacity(capacity: Option<usize>) -> Self {
        let capacity = capacity.map(|c| c.max(1));
        let initial = capacity.unwrap_or(16);
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::with_capacity(initial)),
                slots: capacity.map(Semaphore::new),
                items: Semaphore::new(0),
                capacity,
            }),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.shared.capacity
    }

    /// Enqueue `msg`, waiting for a free slot while the channel is full.
    pub async fn put(&self, msg: T) -> Result<(), Closed> {
        match &self.shared.slots {
            Some(slots) => slots.acquire().await.map_err(|_| Closed)?.forget(),
            None if self.shared.items.is_closed() => return Err(Closed),
            None => {}
        }
        self.push(msg);
        Ok(())
    }

    /// Enqueue without waiting.
    pub fn try_put(&self, msg: T) -> Result<(), TryPutError<T>> {
        if self.shared.items.is_closed() {
            return Err(TryPutError::Closed(msg));
        }
        if let Some(slots) = &self.shared.slots {
            match slots.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(tokio::sync::TryAcquireError::NoPermits) => return Err(TryPutError::Full(msg)),
                Err(tokio::sync::TryAcquireError::Closed) => return Err(TryPutError::Closed(msg)),
            }
        }
        self.push(msg);
        Ok(())
    }

    /// Dequeue the oldest item, waiting while the channel is empty.
    /// Returns `None` once the channel is closed.
    pub async fn get(&self) -> Option<T> {
        self.shared.items.acquire().await.ok()?.forget();
        self.pop()
    }

    /// Remove and discard everything queued right now. Never waits.
    pub fn try_drain(&self) -> usize {
        let mut drained = 0;
        while let Ok(permit) = self.shared.items.try_acquire() {
            permit.forget();
            if self.pop().is_some() {
                drained += 1;
            }
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake every waiter; later `put`/`get` calls fail.
    pub fn close(&self) {
        self.shared.items.close();
        if let Some(slots) = &self.shared.slots {
            slots.close();
        }
    }

    fn push(&self, msg: T) {
        self.queue().push_back(msg);
        self.shared.items.add_permits(1);
    }

    fn pop(&self) -> Option<T> {
        let msg = self.queue().pop_front();
        if let Some(slots) = &self.shared.slots {
            slots.add_permits(1);
        }
        msg
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::task::yield_now;

    #[tokio::test]
    async fn delivers_in_insertion_order() {
        let ch = Channel::bounded(5);
        for i in 0..5 {
            ch.put(i).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(ch.get().await, Some(i));
        }
    }

    #[tokio::test]
    async fn full_channel_blocks_producer_until_one_get() {
        let ch = Channel::bounded(3);
        let producer = {
            let ch = ch.clone();
            tokio::spawn(async move {
                for i in 0..5 {
                    ch.put(i).await.unwrap();
                }
            })
        };

        for _ in 0..10 {
            yield_now().await;
        }
        assert_eq!(ch.len(), 3);
        assert!(!producer.is_finished());

        // Each get frees exactly one slot.
        assert_eq!(ch.get().await, Some(0));
        for _ in 0..10 {
            yield_now().await;
        }
        assert_eq!(ch.len(), 3);
        assert!(!producer.is_finished());

        assert_eq!(ch.get().await, Some(1));
        producer.await.unwrap();
        assert_eq!(ch.len(), 3);
    }

    #[tokio::test]
    async fn try_drain_removes_everything_then_get_blocks() {
        let ch = Channel::bounded(5);
        for i in 0..4 {
            ch.put(i).await.unwrap();
        }
        assert_eq!(ch.try_drain(), 4);
        assert!(ch.is_empty());
        assert_eq!(ch.try_drain(), 0);

        let pending = tokio::time::timeout(Duration::from_millis(20), ch.get()).await;
        assert!(pending.is_err(), "get should block on an empty channel");

        ch.put(9).await.unwrap();
        assert_eq!(ch.get().await, Some(9));
    }

    #[tokio::test]
    async fn drain_frees_slots_for_blocked_producer() {
        let ch = Channel::bounded(2);
        ch.put(1).await.unwrap();
        ch.put(2).await.unwrap();
        assert!(matches!(ch.try_put(3), Err(TryPutError::Full(3))));
        assert_eq!(ch.try_drain(), 2);
        ch.try_put(3).unwrap();
        assert_eq!(ch.get().await, Some(3));
    }

    #[tokio::test]
    async fn unbounded_put_never_blocks() {
        let ch = Channel::unbounded();
        for i in 0..1000 {
            ch.try_put(i).unwrap();
        }
        assert_eq!(ch.len(), 1000);
        assert_eq!(ch.capacity(), None);
    }

    #[tokio::test]
    async fn close_wakes_waiting_consumer() {
        let ch: Channel<u8> = Channel::bounded(1);
        let consumer = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.get().await })
        };
        yield_now().await;
        ch.close();
        assert_eq!(consumer.await.unwrap(), None);
        assert_eq!(ch.put(1).await, Err(Closed));
    }
}
