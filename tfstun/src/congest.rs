//! Congestion feedback: ACK emission on the receive side, rate adjustment
//! on the send side.
//!
//! The reassembler accumulates a window summary (first/last sequence seen,
//! frames lost) inside its free queue's `AckInfo`. The emitter drains that
//! summary on a fixed period and sends it back to the peer as a 20-byte
//! ACK frame. On the other end the controller folds each ACK into a pair
//! of running averages and nudges the paced clock: up one frame per second
//! per clean window, down by the average drop count when windows degrade.

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::buf::BufQueue;
use crate::rate::{Periodic, Pps, RunAvg};
use crate::wire::AckFrame;

/// How many ACK windows the rate controller averages over.
const AVG_WINDOW: usize = 5;

/// Periodically reports the receive window back to the peer.
pub struct AckEmitter {
    sock: UdpSocket,
    freeq: Arc<BufQueue>,
    tick: Periodic,
    epoch: Instant,
}

impl AckEmitter {
    pub fn new(sock: UdpSocket, freeq: Arc<BufQueue>, interval_ms: u64) -> Self {
        Self {
            sock,
            freeq,
            tick: Periodic::new(interval_ms * 1_000_000),
            epoch: Instant::now(),
        }
    }

    pub fn run(self) {
        debug!("ack emitter started");
        loop {
            self.tick.wait();
            self.emit();
        }
    }

    /// Drain the accumulator and send one ACK, if there is anything to say.
    pub fn emit(&self) {
        let Some(ack) = self.freeq.take_ackinfo() else {
            return;
        };
        let frame = AckFrame {
            ndrop: ack.ndrop,
            timestamp_ms: self.epoch.elapsed().as_millis() as u32,
            start: ack.start,
            last: ack.last,
        }
        .encode();
        match self.sock.send(&frame) {
            Ok(n) if n == frame.len() => {
                trace!(start = ack.start, last = ack.last, ndrop = ack.ndrop, "ack sent")
            }
            Ok(n) => warn!(sent = n, "short ack send"),
            Err(e) => warn!(error = %e, "ack send failed"),
        }
    }
}

/// Consumes the peer's ACKs and adjusts the paced clock.
pub struct RateController {
    pps: Arc<Pps>,
    avg_cover: RunAvg,
    avg_drops: RunAvg,
    frame_bits: u64,
}

impl RateController {
    pub fn new(pps: Arc<Pps>, mtu: usize) -> Self {
        Self {
            pps,
            avg_cover: RunAvg::new(AVG_WINDOW, 1),
            avg_drops: RunAvg::new(AVG_WINDOW, 1),
            // Goodput estimate per frame, for the log lines.
            frame_bits: ((mtu - 32) * 8) as u64,
        }
    }

    /// Fold one received ACK frame into the averages; adjust the rate each
    /// time the averaging window completes.
    pub fn on_ack(&mut self, frame: &[u8]) {
        let ack = match AckFrame::decode(frame) {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "ignoring bad ack");
                return;
            }
        };
        let coverage = ack.last - ack.start;

        self.avg_cover.add(coverage as u64);
        if !self.avg_drops.add(ack.ndrop as u64) {
            // Not enough windows yet to react.
            trace!(ndrop = ack.ndrop, coverage, "ack noted");
            return;
        }

        let drops = self.avg_drops.average();
        if drops == 0 {
            let pps = self.pps.change(1);
            debug!(
                coverage,
                pps,
                mbps = pps as u64 * self.frame_bits / 1_000_000,
                "clean window, rate up"
            );
        } else {
            let pps = self.pps.change(-(drops as i64));
            debug!(
                ndrop = ack.ndrop,
                avg_drops = drops,
                coverage,
                pps,
                mbps = pps as u64 * self.frame_bits / 1_000_000,
                "degraded window, rate down"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack_bytes(ndrop: u32, start: u32, last: u32) -> [u8; crate::wire::ACK_LEN] {
        AckFrame {
            ndrop,
            timestamp_ms: 0,
            start,
            last,
        }
        .encode()
    }

    #[test]
    fn test_slowdown_after_full_window() {
        let pps = Arc::new(Pps::new(10_000));
        let mut ctrl = RateController::new(Arc::clone(&pps), 1500);

        // Four ACKs reporting drops: window not complete, no change yet.
        for i in 0..4 {
            ctrl.on_ack(&ack_bytes(50, 1 + i * 1000, 1001 + i * 1000));
            assert_eq!(pps.current(), 10_000);
        }

        // Fifth completes the window: mean drop count is 50.
        ctrl.on_ack(&ack_bytes(50, 4001, 5001));
        assert_eq!(pps.current(), 9_950);
    }

    #[test]
    fn test_recovery_ramps_by_one() {
        let pps = Arc::new(Pps::new(10_000));
        let mut ctrl = RateController::new(Arc::clone(&pps), 1500);

        for _ in 0..5 {
            ctrl.on_ack(&ack_bytes(50, 1, 1001));
        }
        assert_eq!(pps.current(), 9_950);

        // Five clean windows flush the drop history; the completed window
        // then steps the rate up by one.
        for _ in 0..5 {
            ctrl.on_ack(&ack_bytes(0, 1, 1001));
        }
        assert_eq!(pps.current(), 9_951);
    }

    #[test]
    fn test_rate_never_exceeds_target() {
        let pps = Arc::new(Pps::new(100));
        let mut ctrl = RateController::new(Arc::clone(&pps), 1500);

        for _ in 0..50 {
            ctrl.on_ack(&ack_bytes(0, 1, 101));
        }
        assert_eq!(pps.current(), 100);
    }

    #[test]
    fn test_malformed_ack_ignored() {
        let pps = Arc::new(Pps::new(100));
        let mut ctrl = RateController::new(Arc::clone(&pps), 1500);

        // Wrong length.
        ctrl.on_ack(&[0xFF; 10]);
        // Inverted range.
        ctrl.on_ack(&ack_bytes(0, 50, 40));
        assert_eq!(pps.current(), 100);
    }

    #[test]
    fn test_emitter_skips_empty_window() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.connect(peer.local_addr().unwrap()).unwrap();
        peer.set_nonblocking(true).unwrap();

        let freeq = BufQueue::new("test-ack-src", 4);
        let emitter = AckEmitter::new(sock, Arc::clone(&freeq), 1000);

        // Nothing accumulated: nothing sent.
        emitter.emit();
        let mut buf = [0u8; 64];
        assert!(peer.recv(&mut buf).is_err());

        // Accumulate a window and emit.
        freeq.update_ack(|a| {
            a.start = 3;
            a.last = 12;
            a.ndrop = 2;
        });
        emitter.emit();
        std::thread::sleep(std::time::Duration::from_millis(50));
        let n = peer.recv(&mut buf).unwrap();
        let ack = AckFrame::decode(&buf[..n]).unwrap();
        assert_eq!((ack.start, ack.last, ack.ndrop), (3, 12, 2));

        // The accumulator was cleared by the drain.
        emitter.emit();
        assert!(peer.recv(&mut buf).is_err());
    }
}
