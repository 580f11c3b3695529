//! Scatter/gather descriptors for reassembled inner packets.
//!
//! An inner packet extracted from the tunnel may span several outer frames.
//! Rather than copying the pieces together, an `IovPacket` collects
//! read-only `Buf` views onto the outer buffers; each view holds a
//! reference on its backing buffer, so the interface writer can `writev`
//! the packet and only then let the outer buffers return to their pool.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::trace;

use crate::buf::{Buf, BufQueue};

/// How many leading payload bytes to keep around for length discovery when
/// an IP header is split across outer frames.
const HEAD_BYTES: usize = 6;

/// A reassembled inner packet: a bounded list of buffer views plus
/// reassembly state.
pub struct IovPacket {
    segs: Vec<Buf>,
    maxiov: usize,
    len: usize,
    /// Bytes still missing before the packet is complete. `None` while the
    /// IP header seen so far is too short to tell.
    pub left: Option<usize>,
    head: [u8; HEAD_BYTES],
    head_len: usize,
}

impl IovPacket {
    fn with_capacity(maxiov: usize) -> Self {
        Self {
            segs: Vec::with_capacity(maxiov),
            maxiov,
            len: 0,
            left: None,
            head: [0; HEAD_BYTES],
            head_len: 0,
        }
    }

    /// Total payload length collected so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append one view. The view carries its own reference on the backing
    /// buffer (see [`Buf::share_range`]).
    pub fn append(&mut self, seg: Buf) {
        assert!(self.segs.len() < self.maxiov, "iovec overflow");
        if self.head_len < HEAD_BYTES {
            let take = (HEAD_BYTES - self.head_len).min(seg.len());
            self.head[self.head_len..self.head_len + take].copy_from_slice(&seg.data()[..take]);
            self.head_len += take;
        }
        self.len += seg.len();
        self.segs.push(seg);
    }

    /// Leading payload bytes collected so far (at most six).
    pub fn head_bytes(&self) -> &[u8] {
        &self.head[..self.head_len]
    }

    /// The collected views, in order.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        self.segs.iter().map(|s| s.data())
    }

    /// Copy the packet into one contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for seg in self.segments() {
            out.extend_from_slice(seg);
        }
        out
    }

    /// Release every backing buffer to `freeq` and zero the descriptor.
    pub fn clear(&mut self, freeq: &BufQueue) {
        for seg in self.segs.drain(..) {
            seg.release(freeq);
        }
        self.len = 0;
        self.left = None;
        self.head_len = 0;
    }
}

/// Bounded blocking queue of `IovPacket` descriptors.
///
/// Same bounded-channel discipline as `BufQueue`. A free queue is bound to
/// the backing buffer pool: pushing a descriptor into it first releases all
/// of its buffer views, which is what finally lets a multiply-referenced
/// outer buffer go home.
pub struct IovQueue {
    name: &'static str,
    tx: Sender<IovPacket>,
    rx: Receiver<IovPacket>,
    backing: Option<Arc<BufQueue>>,
}

impl IovQueue {
    /// An empty queue for handing completed packets to the interface writer.
    pub fn new(name: &'static str, capacity: usize) -> Arc<Self> {
        let (tx, rx) = bounded(capacity);
        Arc::new(Self {
            name,
            tx,
            rx,
            backing: None,
        })
    }

    /// A free queue pre-populated with `capacity` descriptors of `maxiov`
    /// segments each, releasing segment references into `backing` on push.
    pub fn free_pool(
        name: &'static str,
        capacity: usize,
        maxiov: usize,
        backing: Arc<BufQueue>,
    ) -> Arc<Self> {
        let (tx, rx) = bounded(capacity);
        let queue = Arc::new(Self {
            name,
            tx,
            rx,
            backing: Some(backing),
        });
        for _ in 0..capacity {
            queue.push(IovPacket::with_capacity(maxiov));
        }
        queue
    }

    /// Pop a descriptor, blocking while the queue is empty.
    pub fn pop(&self) -> IovPacket {
        if self.rx.is_empty() {
            trace!(name = self.name, "queue empty");
        }
        // The queue owns both channel halves, so the channel never
        // disconnects.
        self.rx.recv().unwrap()
    }

    /// Pop a descriptor if one is immediately available.
    pub fn try_pop(&self) -> Option<IovPacket> {
        self.rx.try_recv().ok()
    }

    /// Push a descriptor, blocking while the queue is full. Returns the new
    /// depth.
    pub fn push(&self, mut msg: IovPacket) -> usize {
        if let Some(backing) = &self.backing {
            msg.clear(backing);
        }
        if self.tx.is_full() {
            trace!(name = self.name, "queue full");
        }
        self.tx.send(msg).unwrap();
        self.rx.len()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The buffer pool this queue releases segments into on clear/push, if
    /// any.
    pub fn backing(&self) -> Option<&BufQueue> {
        self.backing.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::HDR_SPACE;

    fn outer_with(data: &[u8]) -> (Arc<BufQueue>, Buf) {
        let q = BufQueue::free_pool("test-outer", 2, 4096, HDR_SPACE).unwrap();
        let mut b = q.pop();
        b.space_mut()[..data.len()].copy_from_slice(data);
        b.extend(data.len());
        b.set_refs(1);
        (q, b)
    }

    #[test]
    fn test_append_tracks_len_and_head() {
        let (_q, b) = outer_with(&[0x45, 0, 0, 100, 9, 9, 9, 9, 9, 9]);
        let freeq = IovQueue::free_pool("test-iov", 2, 8, BufQueue::new("unused", 1));
        let mut m = freeq.pop();

        m.append(b.share_range(0, 3));
        assert_eq!(m.len(), 3);
        assert_eq!(m.head_bytes(), &[0x45, 0, 0]);

        m.append(b.share_range(3, 5));
        assert_eq!(m.len(), 8);
        // Head stops filling at six bytes.
        assert_eq!(m.head_bytes(), &[0x45, 0, 0, 100, 9, 9]);

        let flat = m.to_vec();
        assert_eq!(flat, &[0x45, 0, 0, 100, 9, 9, 9, 9]);
    }

    #[test]
    fn test_clear_releases_backing_bufs() {
        let (q, b) = outer_with(&[1, 2, 3, 4]);
        let freeq = IovQueue::free_pool("test-iov-release", 2, 8, Arc::clone(&q));
        let mut m = freeq.pop();

        m.append(b.share_range(0, 2));
        m.append(b.share_range(2, 2));
        assert_eq!(b.ref_count(), 3);

        m.clear(&q);
        assert_eq!(b.ref_count(), 1);
        assert!(m.is_empty());
        assert_eq!(m.left, None);
    }

    #[test]
    fn test_free_queue_push_releases() {
        let (q, b) = outer_with(&[1, 2, 3, 4]);
        let freeq = IovQueue::free_pool("test-iov-free", 1, 8, Arc::clone(&q));
        let mut m = freeq.pop();

        m.append(b.share_range(0, 4));
        m.left = Some(0);
        assert_eq!(b.ref_count(), 2);

        freeq.push(m);
        assert_eq!(b.ref_count(), 1);
        let m = freeq.pop();
        assert!(m.is_empty());
        assert_eq!(m.left, None);
    }
}
