//! Egress path: tunnel frames in, reassembled inner packets out.
//!
//! The reassembler owns the receive loop. Each accepted frame's payload is
//! walked with `add_to_inner_packet`, which peels inner packets off the
//! front: the header's offset field locates the first packet boundary,
//! IP headers supply each packet's length, and whatever does not parse as
//! an IP version nibble is pad. A packet cut short by the MTU continues in
//! the next frame; a gap in the outer sequence numbers discards whatever
//! was in progress, since its tail is gone.
//!
//! Completed packets travel to the interface writer as scatter/gather
//! descriptors over the outer buffers; the receive buffer is only reused
//! once its reference count shows no descriptor still points into it.

use std::io;
use std::net::UdpSocket;
use std::sync::Arc;

use nix::libc;
use tracing::{debug, trace, warn};

use crate::buf::{Buf, BufQueue, HDR_SPACE};
use crate::congest::RateController;
use crate::iov::{IovPacket, IovQueue};
use crate::rate::RateLimit;
use crate::tun::PacketIo;
use crate::wire::{self, FrameKind, HDR_LEN, InnerLen};

/// Outcome of the sequence check, computed inside the free queue's ACK
/// accumulator critical section.
enum SeqVerdict {
    Dup,
    Accept { gap: u32 },
}

/// Receives outer frames and extracts inner packets.
pub struct Reassembler {
    sock: UdpSocket,
    freeq: Arc<BufQueue>,
    iov_freeq: Arc<IovQueue>,
    outq: Arc<IovQueue>,
    limiter: Option<RateLimit>,
    ctrl: RateController,
    tbuf: Buf,
    cur: Option<IovPacket>,
}

impl Reassembler {
    pub fn new(
        sock: UdpSocket,
        freeq: Arc<BufQueue>,
        iov_freeq: Arc<IovQueue>,
        outq: Arc<IovQueue>,
        limiter: Option<RateLimit>,
        ctrl: RateController,
    ) -> Self {
        let tbuf = freeq.pop();
        tbuf.set_refs(1);
        Self {
            sock,
            freeq,
            iov_freeq,
            outq,
            limiter,
            ctrl,
            tbuf,
            cur: None,
        }
    }

    pub fn run(mut self) {
        debug!("reassembler started");
        loop {
            if let Err(e) = self.process_one() {
                warn!(error = %e, "tunnel receive failed");
            }
        }
    }

    /// Receive and process one datagram.
    pub fn process_one(&mut self) -> io::Result<()> {
        // If nothing else references the receive buffer, reuse it;
        // otherwise it stays alive under its remaining references and a
        // fresh one is taken.
        if self.tbuf.drop_ref() {
            self.tbuf.reset(HDR_SPACE);
        } else {
            self.tbuf = self.freeq.pop();
        }
        self.tbuf.set_refs(1);

        let n = self.sock.recv(self.tbuf.space_mut())?;
        if n == 0 {
            warn!("zero-length tunnel read");
            return Ok(());
        }
        if n < HDR_LEN {
            warn!(len = n, "runt tunnel frame");
            self.freeq.update_ack(|a| a.ndrop += 1);
            return Ok(());
        }
        if let Some(rl) = self.limiter.as_mut() {
            if rl.check(n as u64) {
                trace!(len = n, drops = rl.drops(), "over receive rate cap");
                self.freeq.update_ack(|a| a.ndrop += 1);
                return Ok(());
            }
        }
        self.tbuf.extend(n);

        match wire::frame_kind(self.tbuf.data()) {
            FrameKind::Ack => {
                self.ctrl.on_ack(self.tbuf.data());
                return Ok(());
            }
            FrameKind::Invalid => {
                warn!("unknown frame version");
                self.freeq.update_ack(|a| a.ndrop += 1);
                return Ok(());
            }
            FrameKind::Data => {}
        }

        let seq = wire::frame_seq(self.tbuf.data());
        let verdict = self.freeq.update_ack(|ack| {
            if ack.start == 0 {
                ack.start = seq;
            }
            if seq <= ack.last {
                return SeqVerdict::Dup;
            }
            let mut gap = 0;
            if ack.last != 0 && seq != ack.last + 1 {
                gap = seq - ack.last - 1;
                ack.ndrop += gap;
            }
            ack.last = seq;
            SeqVerdict::Accept { gap }
        });

        match verdict {
            SeqVerdict::Dup => {
                debug!(seq, "duplicate or reordered frame");
                return Ok(());
            }
            SeqVerdict::Accept { gap } if gap > 0 => {
                debug!(seq, gap, "sequence gap");
                // The tail of any in-progress packet was in the lost
                // frames; throw away what we had.
                if let Some(m) = self.cur.as_mut() {
                    m.clear(&self.freeq);
                }
            }
            SeqVerdict::Accept { .. } => {}
        }

        self.cur = add_to_inner_packet(
            &mut self.tbuf,
            true,
            self.cur.take(),
            &self.iov_freeq,
            &self.outq,
            seq,
        );
        Ok(())
    }
}

/// Resolve the total length of the packet being assembled in `m` once
/// enough of its IP header is visible, combining the bytes already
/// collected with the front of the current frame. The result is the count
/// of bytes still to come.
fn resolve_left(m: &IovPacket, tbuf: &Buf) -> Option<usize> {
    let head = m.head_bytes();
    let mut first = [0u8; 6];
    first[..head.len()].copy_from_slice(head);
    let take = (6 - head.len()).min(tbuf.len());
    first[head.len()..head.len() + take].copy_from_slice(&tbuf.data()[..take]);

    match wire::inner_packet_len(&first[..head.len() + take]) {
        InnerLen::Len(total) => total.checked_sub(m.len()),
        _ => None,
    }
}

/// Walk one outer frame's payload, appending to (and completing) inner
/// packets. Returns the packet still in progress, if any.
///
/// `tbuf`'s start cursor advances as bytes are claimed; every claimed range
/// becomes a counted view held by the descriptor, so the frame buffer
/// outlives the packets built from it.
pub fn add_to_inner_packet(
    tbuf: &mut Buf,
    is_new: bool,
    m: Option<IovPacket>,
    freeq: &IovQueue,
    outq: &IovQueue,
    seq: u32,
) -> Option<IovPacket> {
    if tbuf.is_empty() {
        warn!(seq, is_new, "no payload left in frame");
        return m;
    }

    let mut offset = 0usize;
    if is_new {
        if tbuf.len() <= HDR_LEN {
            warn!(seq, len = tbuf.len(), "frame too short for any payload");
            tbuf.consume_all();
            return m;
        }
        offset = wire::frame_offset(tbuf.data()) as usize;
        tbuf.advance(HDR_LEN);
    }

    let mut tlen = tbuf.len();
    let mut m = m.unwrap_or_else(|| freeq.pop());

    if m.is_empty() {
        // Starting a new inner packet.
        if offset >= tlen {
            // The first boundary lies beyond this frame: all of it belongs
            // to a packet we never saw the start of.
            trace!(seq, offset, tlen, "frame is unclaimed continuation");
            tbuf.consume_all();
            return Some(m);
        }
        tbuf.advance(offset);
        tlen -= offset;

        match wire::inner_packet_len(tbuf.data()) {
            InnerLen::Pad => {
                trace!(seq, tlen, "pad to end of frame");
                tbuf.consume_all();
                return Some(m);
            }
            InnerLen::Short => {
                // Too few bytes to know the length yet; take them all and
                // resolve against the next frame.
                trace!(seq, tlen, "length field split across frames");
                let seg = tbuf.share_range(0, tlen);
                m.append(seg);
                m.left = None;
                tbuf.advance(tlen);
                return Some(m);
            }
            InnerLen::Len(iplen) => {
                trace!(seq, offset, iplen, "inner packet start");
                m.left = Some(iplen);
            }
        }
    } else if offset > tlen {
        // Mid-packet, and the next boundary is in some later frame.
        if m.left.is_none() {
            m.left = resolve_left(&m, tbuf);
        }
        match m.left {
            None => {
                // Still not enough header; keep collecting.
                let seg = tbuf.share_range(0, tlen);
                m.append(seg);
                tbuf.advance(tlen);
                return Some(m);
            }
            Some(left) if left > tlen => {
                trace!(seq, left, tlen, "continuation consumes frame");
                let seg = tbuf.share_range(0, tlen);
                m.append(seg);
                m.left = Some(left - tlen);
                tbuf.advance(tlen);
                return Some(m);
            }
            Some(left) => {
                // The boundary pointed past this frame yet the packet ends
                // inside it; deliver the packet and treat the slop as pad.
                warn!(seq, offset, left, tlen, "packet ends before advertised boundary");
                let seg = tbuf.share_range(0, left);
                m.append(seg);
                m.left = Some(0);
                outq.push(m);
                tbuf.consume_all();
                return None;
            }
        }
    } else {
        // Mid-packet and completing within this frame: the next `offset`
        // bytes are ours.
        if m.left.is_none() {
            m.left = resolve_left(&m, tbuf);
        }
        match m.left {
            Some(left) if left == offset => {
                tlen = offset;
            }
            other => {
                warn!(seq, offset, left = ?other, "boundary disagrees with inner length");
                // The advertised boundary is the only thing left to trust:
                // drop the partial packet and resynchronize there.
                if let Some(backing) = freeq.backing() {
                    m.clear(backing);
                }
                tbuf.advance(offset);
                if tbuf.is_empty() {
                    return Some(m);
                }
                return add_to_inner_packet(tbuf, false, Some(m), freeq, outq, seq);
            }
        }
    }

    let left = m.left.unwrap_or(0);
    if left > tlen {
        let seg = tbuf.share_range(0, tlen);
        m.append(seg);
        m.left = Some(left - tlen);
        tbuf.advance(tlen);
        debug_assert!(tbuf.is_empty());
        return Some(m);
    }

    let seg = tbuf.share_range(0, left);
    m.append(seg);
    m.left = Some(0);
    tbuf.advance(left);
    trace!(seq, len = m.len(), "inner packet complete");
    outq.push(m);

    if tbuf.is_empty() {
        return None;
    }
    // More payload in this frame: the next inner packet starts here.
    add_to_inner_packet(tbuf, false, None, freeq, outq, seq)
}

/// Writes completed inner packets to the interface.
pub struct TunWriter<T: PacketIo> {
    dev: Arc<T>,
    outq: Arc<IovQueue>,
    freeq: Arc<IovQueue>,
}

impl<T: PacketIo> TunWriter<T> {
    pub fn new(dev: Arc<T>, outq: Arc<IovQueue>, freeq: Arc<IovQueue>) -> Self {
        Self { dev, outq, freeq }
    }

    pub fn run(self) {
        let mut iov: Vec<libc::iovec> = Vec::new();
        loop {
            let m = self.outq.pop();
            iov.clear();
            for seg in m.segments() {
                iov.push(libc::iovec {
                    iov_base: seg.as_ptr() as *mut libc::c_void,
                    iov_len: seg.len(),
                });
            }
            match self.dev.send_packet(&iov) {
                Ok(n) if n == m.len() => trace!(len = n, "inner packet written"),
                Ok(n) => warn!(wrote = n, expected = m.len(), "short interface write"),
                Err(e) => warn!(error = %e, "interface write failed"),
            }
            // Returning the descriptor releases its holds on the outer
            // buffers.
            self.freeq.push(m);
        }
    }
}
