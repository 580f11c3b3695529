//! Fixed-capacity buffer pool and blocking queues for the packet hot path.
//!
//! All packet memory is allocated up front in one mapped slab carved into
//! equal-size buffers. A `Buf` is a cheap handle onto one of those buffers:
//! pool reference, slot index and a pair of cursors. Buffers travel between
//! tasks through `BufQueue`, a bounded blocking channel; blocking on an
//! empty free queue or a full output queue is the only back-pressure in the
//! system.
//!
//! One outer tunnel frame can back several reassembled inner packets at
//! once, so each slot carries an atomic reference count. The last holder to
//! release a buffer returns it to its free queue.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, bounded};
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};
use tracing::trace;

/// Header room reserved at the front of every buffer on reset.
pub const HDR_SPACE: usize = 24;

/// Receive-window accumulator for the ACK channel.
///
/// `start == 0` is the sentinel for "nothing seen since the last drain".
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AckInfo {
    /// First sequence number observed in this window.
    pub start: u32,
    /// Highest sequence number accepted so far.
    pub last: u32,
    /// Outer frames considered lost or rejected in this window.
    pub ndrop: u32,
}

/// One mapped slab carved into `count` buffers of `bufsize` bytes, with a
/// reference count per buffer.
///
/// Attempts 2MB hugepages for the mapping and falls back to regular pages.
pub struct BufPool {
    base: NonNull<u8>,
    size: usize,
    bufsize: usize,
    count: usize,
    refcnts: Box<[AtomicU32]>,
}

// SAFETY: the mapping is process-global and never moves; slot ownership is
// handed between threads through BufQueue, whose channel provides the
// necessary ordering. Concurrent access to one slot's bytes only happens
// read-only through shared range views.
unsafe impl Send for BufPool {}
unsafe impl Sync for BufPool {}

impl BufPool {
    fn new(count: usize, bufsize: usize) -> io::Result<Arc<Self>> {
        let size = count * bufsize;
        let base = Self::try_map_hugepages(size)
            .or_else(|_| Self::map_regular(size))
            .inspect_err(|e| tracing::error!(size, error = %e, "buffer pool mapping failed"))?;

        let refcnts: Box<[AtomicU32]> = (0..count).map(|_| AtomicU32::new(0)).collect();

        Ok(Arc::new(Self {
            base,
            size,
            bufsize,
            count,
            refcnts,
        }))
    }

    fn try_map_hugepages(size: usize) -> io::Result<NonNull<u8>> {
        let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_HUGETLB;
        Self::map(size, flags)
    }

    fn map_regular(size: usize) -> io::Result<NonNull<u8>> {
        Self::map(size, MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS)
    }

    fn map(size: usize, flags: MapFlags) -> io::Result<NonNull<u8>> {
        let len = size
            .try_into()
            .map_err(|_| io::Error::other("zero-size buffer pool"))?;
        let ptr = unsafe {
            mmap_anonymous(None, len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, flags)?
        };
        Ok(ptr.cast())
    }

    /// Raw pointer to the start of slot `index`.
    #[inline]
    fn slot_ptr(&self, index: u32) -> *mut u8 {
        debug_assert!((index as usize) < self.count);
        // SAFETY: index is bounded by the pool size at construction.
        unsafe { self.base.as_ptr().add(index as usize * self.bufsize) }
    }

    #[inline]
    fn refcnt(&self, index: u32) -> &AtomicU32 {
        &self.refcnts[index as usize]
    }
}

impl Drop for BufPool {
    fn drop(&mut self) {
        // SAFETY: base/size came from mmap in new().
        unsafe {
            let _ = munmap(self.base.cast(), self.size);
        }
    }
}

/// Handle onto one pool buffer.
///
/// `start..end` is the live payload; everything before `start` is header
/// room, everything after `end` is writable tail space. The cursors belong
/// to the handle, so a range view shared with another task keeps its own
/// window onto the same bytes.
pub struct Buf {
    pool: Arc<BufPool>,
    index: u32,
    start: usize,
    end: usize,
}

impl Buf {
    /// Bytes of live payload.
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Writable bytes remaining after the payload.
    #[inline]
    pub fn avail(&self) -> usize {
        self.pool.bufsize - self.end
    }

    /// The live payload.
    #[inline]
    pub fn data(&self) -> &[u8] {
        // SAFETY: start..end stays within the slot and only this handle's
        // owner writes to the region.
        unsafe {
            std::slice::from_raw_parts(self.pool.slot_ptr(self.index).add(self.start), self.len())
        }
    }

    /// Writable tail region, for reading a packet into the buffer.
    #[inline]
    pub fn space_mut(&mut self) -> &mut [u8] {
        debug_assert!(self.ref_count() <= 1);
        // SAFETY: end..bufsize is within the slot; the caller holds the only
        // writing handle (shared views are read-only and never overlap the
        // tail space).
        unsafe {
            std::slice::from_raw_parts_mut(self.pool.slot_ptr(self.index).add(self.end), self.avail())
        }
    }

    /// Extend the payload by `n` bytes just written into `space_mut`.
    #[inline]
    pub fn extend(&mut self, n: usize) {
        assert!(self.end + n <= self.pool.bufsize);
        self.end += n;
    }

    /// Consume `n` bytes from the front of the payload.
    #[inline]
    pub fn advance(&mut self, n: usize) {
        assert!(self.start + n <= self.end);
        self.start += n;
    }

    /// Consume the whole remaining payload.
    #[inline]
    pub fn consume_all(&mut self) {
        self.start = self.end;
    }

    /// Reset the cursors to an empty payload after `hdrspace` bytes of room.
    pub fn reset(&mut self, hdrspace: usize) {
        debug_assert_eq!(self.ref_count(), 0);
        self.start = hdrspace;
        self.end = hdrspace;
    }

    /// A read-only view of `len` bytes at `off` within the payload, holding
    /// its own reference on the backing buffer.
    pub fn share_range(&self, off: usize, len: usize) -> Buf {
        assert!(self.start + off + len <= self.end);
        self.pool.refcnt(self.index).fetch_add(1, Ordering::AcqRel);
        Buf {
            pool: Arc::clone(&self.pool),
            index: self.index,
            start: self.start + off,
            end: self.start + off + len,
        }
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.pool.refcnt(self.index).load(Ordering::Acquire)
    }

    /// Overwrite the reference count. Only meaningful for the receive path,
    /// which claims a freshly popped buffer before sharing it out.
    #[inline]
    pub fn set_refs(&self, n: u32) {
        self.pool.refcnt(self.index).store(n, Ordering::Release);
    }

    /// Drop one reference; true when this was the last one.
    #[inline]
    pub fn drop_ref(&self) -> bool {
        self.pool.refcnt(self.index).fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Drop one reference and return the buffer to `freeq` if it was the
    /// last one.
    pub fn release(self, freeq: &BufQueue) {
        if self.drop_ref() {
            freeq.push(self, true);
        }
    }
}

/// Bounded blocking queue of buffer handles.
///
/// A bounded channel carries the handles: pop blocks while empty, push
/// blocks while full. Alongside the channel sits the receive window's
/// `AckInfo` in its own small critical section, mutated inline by the
/// reassembler and drained by the ACK emitter.
pub struct BufQueue {
    name: &'static str,
    hdrspace: usize,
    tx: Sender<Buf>,
    rx: Receiver<Buf>,
    ack: Mutex<AckInfo>,
}

impl BufQueue {
    /// An empty queue for handing buffers between tasks.
    pub fn new(name: &'static str, capacity: usize) -> Arc<Self> {
        let (tx, rx) = bounded(capacity);
        Arc::new(Self {
            name,
            hdrspace: HDR_SPACE,
            tx,
            rx,
            ack: Mutex::new(AckInfo::default()),
        })
    }

    /// A free pool: allocates `capacity` buffers of `bufsize` bytes and
    /// pre-populates the queue with all of them.
    pub fn free_pool(
        name: &'static str,
        capacity: usize,
        bufsize: usize,
        hdrspace: usize,
    ) -> io::Result<Arc<Self>> {
        let pool = BufPool::new(capacity, bufsize)?;
        let (tx, rx) = bounded(capacity);
        let queue = Arc::new(Self {
            name,
            hdrspace,
            tx,
            rx,
            ack: Mutex::new(AckInfo::default()),
        });
        for i in 0..capacity {
            queue.push(
                Buf {
                    pool: Arc::clone(&pool),
                    index: i as u32,
                    start: hdrspace,
                    end: hdrspace,
                },
                false,
            );
        }
        Ok(queue)
    }

    /// Pop a buffer, blocking while the queue is empty.
    pub fn pop(&self) -> Buf {
        if self.rx.is_empty() {
            trace!(name = self.name, "queue empty");
        }
        // The queue owns both channel halves, so the channel never
        // disconnects.
        self.rx.recv().unwrap()
    }

    /// Pop a buffer if one is immediately available.
    pub fn try_pop(&self) -> Option<Buf> {
        self.rx.try_recv().ok()
    }

    /// Push a buffer, blocking while the queue is full. Returns the new
    /// depth. With `reset` the cursors are rewound to this queue's header
    /// room first, which is how buffers re-enter a free pool.
    pub fn push(&self, mut buf: Buf, reset: bool) -> usize {
        if reset {
            buf.reset(self.hdrspace);
        }
        if self.tx.is_full() {
            trace!(name = self.name, "queue full");
        }
        self.tx.send(buf).unwrap();
        self.rx.len()
    }

    /// Run `f` on the ACK accumulator inside its critical section.
    pub fn update_ack<R>(&self, f: impl FnOnce(&mut AckInfo) -> R) -> R {
        let mut ack = self.ack.lock().unwrap();
        f(&mut *ack)
    }

    /// Drain the ACK accumulator. `None` when nothing has been received
    /// since the last drain.
    pub fn take_ackinfo(&self) -> Option<AckInfo> {
        let mut ack = self.ack.lock().unwrap();
        if ack.start == 0 {
            return None;
        }
        Some(std::mem::take(&mut *ack))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_free_pool_populated() {
        let q = BufQueue::free_pool("test-free", 4, 256, HDR_SPACE).unwrap();
        let mut bufs = Vec::new();
        for _ in 0..4 {
            let b = q.pop();
            assert_eq!(b.len(), 0);
            assert_eq!(b.avail(), 256 - HDR_SPACE);
            assert_eq!(b.ref_count(), 0);
            bufs.push(b);
        }
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn test_cursors_and_reset() {
        let q = BufQueue::free_pool("test-cursors", 1, 128, HDR_SPACE).unwrap();
        let mut b = q.pop();

        b.space_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
        b.extend(4);
        assert_eq!(b.data(), &[1, 2, 3, 4]);

        b.advance(1);
        assert_eq!(b.data(), &[2, 3, 4]);
        b.consume_all();
        assert!(b.is_empty());

        let depth = q.push(b, true);
        assert_eq!(depth, 1);
        let b = q.pop();
        assert_eq!(b.len(), 0);
        assert_eq!(b.avail(), 128 - HDR_SPACE);
    }

    #[test]
    fn test_share_range_refcounts() {
        let q = BufQueue::free_pool("test-share", 2, 128, HDR_SPACE).unwrap();
        let mut b = q.pop();
        b.space_mut()[..6].copy_from_slice(b"abcdef");
        b.extend(6);
        b.set_refs(1);

        let view = b.share_range(2, 3);
        assert_eq!(view.data(), b"cde");
        assert_eq!(b.ref_count(), 2);

        // Reader's reference goes first; the view still holds the buffer.
        assert!(!b.drop_ref());
        view.release(&q);

        // The view was last out, so the buffer is back in the queue, reset.
        let b2 = q.pop();
        let b3 = q.pop();
        assert!(q.try_pop().is_none());
        assert_eq!(b2.len() + b3.len(), 0);
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let q = BufQueue::free_pool("test-block", 1, 64, HDR_SPACE).unwrap();
        let held = q.pop();

        let q2 = Arc::clone(&q);
        let waiter = thread::spawn(move || q2.pop());

        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        q.push(held, true);
        waiter.join().unwrap();
    }

    #[test]
    fn test_push_blocks_when_full() {
        let q = BufQueue::free_pool("test-full", 1, 64, HDR_SPACE).unwrap();
        let held = q.pop();
        q.push(held, true);

        // Queue is at capacity again; a second pusher must wait for a pop.
        let extra = BufQueue::free_pool("test-full-extra", 1, 64, HDR_SPACE)
            .unwrap()
            .pop();
        let q2 = Arc::clone(&q);
        let pusher = thread::spawn(move || {
            q2.push(extra, true);
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!pusher.is_finished());

        let _ = q.pop();
        pusher.join().unwrap();
    }

    #[test]
    fn test_ackinfo_take_and_clear() {
        let q = BufQueue::new("test-ack", 4);
        assert_eq!(q.take_ackinfo(), None);

        q.update_ack(|a| {
            a.start = 5;
            a.last = 9;
            a.ndrop = 2;
        });
        let ack = q.take_ackinfo().unwrap();
        assert_eq!(ack, AckInfo { start: 5, last: 9, ndrop: 2 });
        assert_eq!(q.take_ackinfo(), None);
    }
}
