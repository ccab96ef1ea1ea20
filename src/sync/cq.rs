//! Completion queue: the event channel both the server loop and the client
//! drain loop block on. This is how it works:
//!
//! 1. We create a new [`CompletionQueue`] and obtain a [`CqHandle`].
//! 2. Whoever performs an asynchronous operation keeps a clone of the handle
//!    and remembers the [`Tag`] the operation was submitted with.
//! 3. When the operation finishes, the handle posts `(tag, success)`.
//! 4. The single consumer pulls events with [`CompletionQueue::next`] and maps
//!    each tag back to whatever state owns it.
//!
//! Shutdown is the absence of further events: once every handle is dropped or
//! [`CompletionQueue::close`] is called, `next` drains what is already queued
//! and then yields `None`. Posting never blocks, so the submission path of an
//! operation is always fire-and-forget.

use std::fmt::{self, Display};

use tokio::sync::mpsc;

/// Opaque token that correlates a completion event with the operation that
/// produced it. The value is the key of the owning entry in a [`slab::Slab`],
/// so resolving a tag back to its owner is a plain table lookup. Exactly one
/// live operation owns a given tag at any time; the key is only reused after
/// the owning entry has been removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Tag(usize);

impl Tag {
    /// Mints a tag from a slab key.
    pub fn from_key(key: usize) -> Self {
        Self(key)
    }

    /// The slab key this tag was minted from.
    pub fn key(self) -> usize {
        self.0
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One completed asynchronous operation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
    /// Tag the operation was submitted with.
    pub tag: Tag,

    /// Whether the operation succeeded. A request-wait fails when the queue
    /// is shutting down, a reply-send fails when the peer is gone.
    pub ok: bool,
}

/// Consumer half of the queue. Events are delivered exactly once, in the
/// order they were posted.
pub(crate) struct CompletionQueue {
    events: mpsc::UnboundedReceiver<Event>,
}

/// Producer half. Cloned into every task that completes operations.
#[derive(Clone)]
pub(crate) struct CqHandle {
    events: mpsc::UnboundedSender<Event>,
}

impl CompletionQueue {
    /// Creates the queue and its first producer handle.
    pub fn new() -> (Self, CqHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();

        (Self { events: receiver }, CqHandle { events: sender })
    }

    /// Blocks until the next event is available. `None` means shutdown: no
    /// event will ever arrive again.
    pub async fn next(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Shuts the queue down. Events already posted are still delivered by
    /// [`CompletionQueue::next`] before it starts returning `None`.
    pub fn close(&mut self) {
        self.events.close();
    }
}

impl CqHandle {
    /// Posts a completion event. Never blocks; if the consumer is gone the
    /// event is dropped, since nobody can dispatch it anymore.
    pub fn post(&self, tag: Tag, ok: bool) {
        let _ = self.events.send(Event { tag, ok });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_are_delivered_in_post_order() {
        let (mut cq, handle) = CompletionQueue::new();

        handle.post(Tag::from_key(0), true);
        handle.post(Tag::from_key(1), false);
        handle.post(Tag::from_key(2), true);

        for (key, ok) in [(0, true), (1, false), (2, true)] {
            let event = cq.next().await.unwrap();
            assert_eq!(event.tag, Tag::from_key(key));
            assert_eq!(event.ok, ok);
        }
    }

    #[tokio::test]
    async fn dropping_all_handles_shuts_the_queue_down() {
        let (mut cq, handle) = CompletionQueue::new();

        let clone = handle.clone();
        clone.post(Tag::from_key(3), true);

        drop(handle);
        drop(clone);

        // The buffered event is drained first, then shutdown.
        assert!(cq.next().await.is_some());
        assert!(cq.next().await.is_none());
    }

    #[tokio::test]
    async fn close_drains_pending_events_first() {
        let (mut cq, handle) = CompletionQueue::new();

        handle.post(Tag::from_key(0), true);
        cq.close();
        handle.post(Tag::from_key(1), true);

        let event = cq.next().await.unwrap();
        assert_eq!(event.tag, Tag::from_key(0));
        assert!(cq.next().await.is_none());
    }
}
