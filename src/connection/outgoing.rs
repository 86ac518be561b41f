use std::collections::VecDeque;
use std::io;

use bytes::{Buf, Bytes};

/// Completion callback of one outbound message, invoked exactly once with
/// the final result for that message.
pub type WriteCallback = Box<dyn FnOnce(io::Result<()>) + Send + 'static>;

/// One logical outbound message: an ordered sequence of byte ranges plus an
/// optional completion callback.
///
/// The ranges are `Bytes` handles, so caller-owned memory outlives the
/// write without copying; empty ranges are discarded on construction.
pub struct BufferInfo {
    buffers: VecDeque<Bytes>,
    callback: Option<WriteCallback>,
}

impl BufferInfo {
    pub fn new(buffers: impl IntoIterator<Item = Bytes>, callback: Option<WriteCallback>) -> Self {
        Self { buffers: buffers.into_iter().filter(|b| !b.is_empty()).collect(), callback }
    }

    pub fn single(data: Bytes, callback: Option<WriteCallback>) -> Self {
        Self::new([data], callback)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub(crate) fn take_callback(&mut self) -> Option<WriteCallback> {
        self.callback.take()
    }
}

/// Upper bound on byte ranges gathered into one vectorized write.
pub(crate) const GATHER_LIMIT: usize = 32;

/// FIFO of pending outbound messages plus the sending latch.
///
/// Shared across threads behind the connection's mutex: handlers append
/// from wherever they run, while only the connection task consumes the
/// front. Callbacks are returned to the caller rather than invoked here, so
/// they always run with the mutex released.
#[derive(Default)]
pub(crate) struct OutgoingQueue {
    entries: VecDeque<BufferInfo>,
    pub(crate) sending: bool,
    pub(crate) closed: bool,
}

impl OutgoingQueue {
    /// Appends a message. Returns true when the caller must arm the writer
    /// (no write was in flight).
    pub fn push(&mut self, info: BufferInfo) -> bool {
        self.entries.push_back(info);
        if self.sending {
            false
        } else {
            self.sending = true;
            true
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clones up to [`GATHER_LIMIT`] byte ranges from the queue front into
    /// `dst` for one vectorized write. The clones are refcounted handles,
    /// not copies.
    pub fn gather(&self, dst: &mut Vec<Bytes>) {
        for entry in &self.entries {
            for buffer in &entry.buffers {
                if dst.len() == GATHER_LIMIT {
                    return;
                }
                dst.push(buffer.clone());
            }
        }
    }

    /// Consumes `written` bytes front-to-back. Fully written ranges are
    /// removed and partially written ranges shrunk in place; each entry
    /// whose ranges are exhausted is popped and its callback pushed onto
    /// `fired` in enqueue order. Returns the number of bytes that could not
    /// be accounted for (more written than queued).
    pub fn consume(&mut self, mut written: usize, fired: &mut Vec<WriteCallback>) -> usize {
        while written > 0 {
            let front = match self.entries.front_mut() {
                Some(front) => front,
                None => return written,
            };

            while let Some(buffer) = front.buffers.front_mut() {
                if buffer.len() <= written {
                    written -= buffer.len();
                    front.buffers.pop_front();
                } else {
                    buffer.advance(written);
                    written = 0;
                    break;
                }
            }

            if front.is_empty() {
                let callback = front.take_callback();
                self.entries.pop_front();
                if let Some(callback) = callback {
                    fired.push(callback);
                }
            }
        }
        0
    }

    /// Removes every pending entry, returning the callbacks for
    /// exactly-once failure delivery outside the lock.
    pub fn drain(&mut self) -> Vec<WriteCallback> {
        self.sending = false;
        self.entries.drain(..).filter_map(|mut entry| entry.take_callback()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_callback(counter: &Arc<AtomicUsize>) -> WriteCallback {
        let counter = counter.clone();
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn push_arms_the_writer_once() {
        let mut queue = OutgoingQueue::default();
        assert!(queue.push(BufferInfo::single(Bytes::from_static(b"one"), None)));
        assert!(!queue.push(BufferInfo::single(Bytes::from_static(b"two"), None)));
    }

    #[test]
    fn gather_caps_the_slice_count() {
        let mut queue = OutgoingQueue::default();
        for _ in 0..GATHER_LIMIT {
            queue.push(BufferInfo::new([Bytes::from_static(b"a"), Bytes::from_static(b"b")], None));
        }

        let mut gathered = Vec::new();
        queue.gather(&mut gathered);
        assert_eq!(gathered.len(), GATHER_LIMIT);
    }

    #[test]
    fn partial_write_shrinks_the_front_range_in_place() {
        let mut queue = OutgoingQueue::default();
        queue.push(BufferInfo::single(Bytes::from_static(b"abcdef"), None));

        let mut fired = Vec::new();
        assert_eq!(queue.consume(2, &mut fired), 0);
        assert!(fired.is_empty());

        let mut gathered = Vec::new();
        queue.gather(&mut gathered);
        assert_eq!(&gathered[0][..], b"cdef");
    }

    #[test]
    fn callbacks_fire_in_enqueue_order_exactly_once() {
        let mut queue = OutgoingQueue::default();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = order.clone();
            queue.push(BufferInfo::single(
                Bytes::from_static(b"1234"),
                Some(Box::new(move |result| {
                    assert!(result.is_ok());
                    order.lock().unwrap().push(tag);
                })),
            ));
        }

        let mut fired = Vec::new();
        assert_eq!(queue.consume(8, &mut fired), 0);
        assert_eq!(fired.len(), 2);
        for callback in fired {
            callback(Ok(()));
        }
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn entry_spanning_multiple_ranges_completes_as_one() {
        let mut queue = OutgoingQueue::default();
        let fired_count = Arc::new(AtomicUsize::new(0));
        queue.push(BufferInfo::new(
            [Bytes::from_static(b"head"), Bytes::from_static(b"body")],
            Some(counting_callback(&fired_count)),
        ));

        let mut fired = Vec::new();
        queue.consume(4, &mut fired);
        assert!(fired.is_empty());

        queue.consume(4, &mut fired);
        assert_eq!(fired.len(), 1);
        for callback in fired {
            callback(Ok(()));
        }
        assert_eq!(fired_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn extra_written_bytes_are_reported_not_lost() {
        let mut queue = OutgoingQueue::default();
        queue.push(BufferInfo::single(Bytes::from_static(b"ab"), None));

        let mut fired = Vec::new();
        assert_eq!(queue.consume(5, &mut fired), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_returns_every_pending_callback() {
        let mut queue = OutgoingQueue::default();
        let fired_count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            queue.push(BufferInfo::single(Bytes::from_static(b"x"), Some(counting_callback(&fired_count))));
        }
        queue.push(BufferInfo::single(Bytes::from_static(b"y"), None));

        let callbacks = queue.drain();
        assert_eq!(callbacks.len(), 3);
        assert!(queue.is_empty());
        assert!(!queue.sending);
        for callback in callbacks {
            callback(Err(io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed")));
        }
        assert_eq!(fired_count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn empty_ranges_are_discarded_on_construction() {
        let info = BufferInfo::new([Bytes::new(), Bytes::from_static(b"z"), Bytes::new()], None);
        assert!(!info.is_empty());

        let all_empty = BufferInfo::new([Bytes::new()], None);
        assert!(all_empty.is_empty());
    }
}
