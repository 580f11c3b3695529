//! Ingress path: interface packets in, paced tunnel frames out.
//!
//! Two tasks share a free pool and an inner-packet queue. The reader pulls
//! one IP packet per read off the TUN device. The packetizer wakes once per
//! frame slot and greedily concatenates queued inner packets into a frame
//! of exactly MTU bytes: whole packets back to back, one trailing partial
//! packet carried over to the next frame as "leftover", pad when the queue
//! runs dry. An idle slot still emits a full-size frame of pad, so the
//! outer stream reveals nothing about the inner traffic.

use std::io;
use std::net::UdpSocket;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use nix::libc;
use tracing::{debug, trace, warn};

use crate::buf::{Buf, BufQueue};
use crate::rate::{IntervalTimer, Pps};
use crate::tun::PacketIo;
use crate::wire::{self, HDR_LEN};

/// Linux UIO_MAXIOV.
const MAX_IOV: usize = 1024;

/// Anything shorter cannot hold the next inner packet's length field, so a
/// tail this small is pad.
const MIN_TAIL: usize = 6;

/// Reads inner packets from the interface into the packetizer's queue.
///
/// Back-pressure is the free pool running empty: the read simply waits
/// until the packetizer returns buffers.
pub struct TunReader<T: PacketIo> {
    dev: Arc<T>,
    freeq: Arc<BufQueue>,
    inq: Arc<BufQueue>,
}

impl<T: PacketIo> TunReader<T> {
    pub fn new(dev: Arc<T>, freeq: Arc<BufQueue>, inq: Arc<BufQueue>) -> Self {
        Self { dev, freeq, inq }
    }

    pub fn run(self) {
        let mut zeros = 0u32;
        loop {
            let mut buf = self.freeq.pop();
            let n = match self.dev.recv_packet(buf.space_mut()) {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "interface read failed");
                    self.freeq.push(buf, true);
                    continue;
                }
            };
            if n == 0 {
                zeros += 1;
                self.freeq.push(buf, true);
                continue;
            }
            buf.extend(n);
            let depth = self.inq.push(buf, false);
            trace!(len = n, depth, zeros, "inner packet queued");
            zeros = 0;
        }
    }
}

/// Builds and sends one outer frame per pace tick.
pub struct Packetizer {
    sock: UdpSocket,
    inq: Arc<BufQueue>,
    freeq: Arc<BufQueue>,
    pps: Arc<Pps>,
    mtu: usize,
    seq: u32,
    leftover: Option<Buf>,
    hdr: [u8; HDR_LEN],
    pad: Box<[u8]>,
    empty: Box<[u8]>,
    iov: Vec<libc::iovec>,
    to_free: Vec<Buf>,
    stats: IntervalTimer,
    frames: u64,
    empties: u64,
}

// SAFETY: the iovec scratch holds raw pointers only transiently within
// emit_frame; between calls it is cleared, so the pointers never outlive
// the buffers they reference.
unsafe impl Send for Packetizer {}

impl Packetizer {
    pub fn new(
        sock: UdpSocket,
        inq: Arc<BufQueue>,
        freeq: Arc<BufQueue>,
        pps: Arc<Pps>,
        mtu: usize,
    ) -> Self {
        // Worst case is a frame of back-to-back minimum IP packets, plus
        // the header entry and a pad entry.
        let maxiov = (mtu / 20 + 2).min(MAX_IOV);
        Self {
            sock,
            inq,
            freeq,
            pps,
            mtu,
            seq: 1,
            leftover: None,
            hdr: [0; HDR_LEN],
            pad: vec![0; mtu].into_boxed_slice(),
            empty: vec![0; mtu].into_boxed_slice(),
            iov: Vec::with_capacity(maxiov),
            to_free: Vec::with_capacity(maxiov),
            stats: IntervalTimer::new(Duration::from_secs(1)),
            frames: 0,
            empties: 0,
        }
    }

    pub fn run(mut self) {
        debug!(
            pps = self.pps.current(),
            mtu = self.mtu,
            "packetizer started"
        );
        loop {
            self.pps.wait();
            if let Err(e) = self.emit_frame() {
                warn!(error = %e, "tunnel send failed");
            }
        }
    }

    /// Assemble and send exactly one MTU-sized frame.
    pub fn emit_frame(&mut self) -> io::Result<()> {
        let (mut cur, offset) = match self.leftover.take() {
            Some(m) => {
                let off = m.len();
                trace!(seq = self.seq, leftover = off, "carrying leftover");
                (Some(m), off)
            }
            None => (self.inq.try_pop(), 0),
        };

        self.frames += 1;
        if self.stats.check() {
            debug!(
                empty = self.empties,
                total = self.frames,
                used = self.frames - self.empties,
                "frames in last interval"
            );
            self.frames = 0;
            self.empties = 0;
        } else if cur.is_none() {
            self.empties += 1;
        }

        if cur.is_none() {
            return self.send_empty();
        }

        wire::put_header(&mut self.hdr, self.seq, offset as u16);
        self.iov.clear();
        self.iov.push(libc::iovec {
            iov_base: self.hdr.as_ptr() as *mut libc::c_void,
            iov_len: HDR_LEN,
        });
        debug_assert!(self.to_free.is_empty());

        let mut rem = self.mtu - HDR_LEN;
        while rem > 0 {
            if rem <= MIN_TAIL || cur.is_none() {
                // No room for another packet start, or no more data: pad.
                trace!(seq = self.seq, pad = rem, "padding frame tail");
                self.iov.push(libc::iovec {
                    iov_base: self.pad.as_ptr() as *mut libc::c_void,
                    iov_len: rem,
                });
                break;
            }

            let mut m = cur.take().unwrap();
            let mlen = m.len();
            if mlen > rem {
                // Partial fit: the rest carries into the next frame.
                trace!(seq = self.seq, take = rem, of = mlen, "splitting inner packet");
                self.iov.push(libc::iovec {
                    iov_base: m.data().as_ptr() as *mut libc::c_void,
                    iov_len: rem,
                });
                m.advance(rem);
                self.leftover = Some(m);
                break;
            }

            trace!(seq = self.seq, len = mlen, rem, "appending inner packet");
            self.iov.push(libc::iovec {
                iov_base: m.data().as_ptr() as *mut libc::c_void,
                iov_len: mlen,
            });
            self.to_free.push(m);
            rem -= mlen;

            if rem > MIN_TAIL {
                cur = self.inq.try_pop();
            }
        }

        let total: usize = self.iov.iter().map(|v| v.iov_len).sum();
        assert_eq!(total, self.mtu, "assembled frame length mismatch");

        // SAFETY: msghdr points at the scratch iovec array, whose entries
        // reference the header, the pad block and buffers held in
        // leftover/to_free until after the call.
        let n = unsafe {
            let mut msg: libc::msghdr = std::mem::zeroed();
            msg.msg_iov = self.iov.as_mut_ptr();
            msg.msg_iovlen = self.iov.len() as _;
            libc::sendmsg(self.sock.as_raw_fd(), &msg, 0)
        };
        self.seq = self.seq.wrapping_add(1);

        let mut result = Ok(());
        if n < 0 {
            result = Err(io::Error::last_os_error());
        } else if n as usize != self.mtu {
            warn!(sent = n, mtu = self.mtu, "short tunnel send");
        }
        if result.is_err() || n as usize != self.mtu {
            // A partial frame already went out; retrying the leftover would
            // reorder bytes within its inner packet, so abandon it.
            if let Some(m) = self.leftover.take() {
                self.to_free.push(m);
            }
        }

        for m in self.to_free.drain(..) {
            self.freeq.push(m, true);
        }
        result
    }

    /// Header plus pad, sent when no inner data is waiting.
    fn send_empty(&mut self) -> io::Result<()> {
        self.empty[0..4].copy_from_slice(&self.seq.to_be_bytes());
        let res = self.sock.send(&self.empty);
        self.seq = self.seq.wrapping_add(1);
        let n = res?;
        if n != self.mtu {
            warn!(sent = n, mtu = self.mtu, "short empty-frame send");
        }
        Ok(())
    }

    #[cfg(test)]
    fn seq(&self) -> u32 {
        self.seq
    }
}
