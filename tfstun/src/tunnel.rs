//! Tunnel assembly: sizing, validated configuration, task spawning.
//!
//! A tunnel runs five long-lived threads. Ingress: an interface reader and
//! the packetizer. Egress: the reassembler, the interface writer and the
//! ACK emitter. Each task owns its queues, sockets and pacing state by
//! move at spawn time; the only state shared across the two directions is
//! the paced clock, which the egress-side rate controller adjusts.

use std::io;
use std::net::UdpSocket;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::info;

use crate::buf::{BufQueue, HDR_SPACE};
use crate::congest::{AckEmitter, RateController};
use crate::egress::{Reassembler, TunWriter};
use crate::ingress::{Packetizer, TunReader};
use crate::iov::IovQueue;
use crate::rate::{Pps, RateLimit};
use crate::tun::PacketIo;
use crate::wire::HDR_LEN;

/// Depth of the inner-packet queues (ingress direction).
pub const INNER_QUEUE_DEPTH: usize = 256;

/// Depth of the outer-frame queues (egress direction).
pub const OUTER_QUEUE_DEPTH: usize = 256;

/// Size of every pooled buffer; bounds both inner packets and outer frames.
pub const MAX_BUF: usize = 8192 + 1024;

/// How often the receive window is reported back to the peer.
pub const ACK_INTERVAL_MS: u64 = 1000;

/// Per-frame overhead assumed when converting a bit rate to a frame rate
/// (outer IP + UDP headers, roughly).
const FRAME_OVERHEAD: usize = 32;

/// Samples kept by the simulated-congestion rate limiter.
const CONGEST_WINDOW: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("mtu {0} cannot fit an outer header and an IP packet")]
    MtuTooSmall(usize),
    #[error("mtu {0} exceeds the {max} bytes a pooled buffer can hold", max = MAX_BUF - HDR_SPACE)]
    MtuTooLarge(usize),
    #[error("transmit rate must be nonzero")]
    ZeroRate,
}

/// Validated tunnel parameters.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Outer frame size, header included.
    pub mtu: usize,
    /// Transmit rate in bits per second.
    pub tx_rate: u64,
    /// Simulated receive-side cap in bits per second; zero disables it.
    pub congest_rate: u64,
    /// ACK reporting period.
    pub ack_interval_ms: u64,
}

impl TunnelConfig {
    pub fn new(mtu: usize, tx_rate: u64, congest_rate: u64) -> Result<Self, ConfigError> {
        // Smallest useful frame: header plus a minimum IPv4 packet.
        if mtu < HDR_LEN + 20 {
            return Err(ConfigError::MtuTooSmall(mtu));
        }
        if mtu > MAX_BUF - HDR_SPACE {
            return Err(ConfigError::MtuTooLarge(mtu));
        }
        if tx_rate == 0 {
            return Err(ConfigError::ZeroRate);
        }
        Ok(Self {
            mtu,
            tx_rate,
            congest_rate,
            ack_interval_ms: ACK_INTERVAL_MS,
        })
    }

    /// The frame rate that fills `tx_rate` with MTU-sized frames.
    pub fn target_pps(&self) -> u32 {
        let frame_bits = ((self.mtu - FRAME_OVERHEAD) * 8) as u64;
        (self.tx_rate / frame_bits).max(1) as u32
    }
}

/// Spawn the ingress direction: interface reader and packetizer.
pub fn spawn_ingress<T: PacketIo + 'static>(
    dev: Arc<T>,
    sock: UdpSocket,
    cfg: &TunnelConfig,
    pps: Arc<Pps>,
) -> io::Result<Vec<JoinHandle<()>>> {
    let freeq = BufQueue::free_pool("ingress-free", INNER_QUEUE_DEPTH, MAX_BUF, HDR_SPACE)?;
    let inq = BufQueue::new("ingress-inner", INNER_QUEUE_DEPTH);

    info!(
        pps = pps.current(),
        mbps = cfg.tx_rate / 1_000_000,
        mtu = cfg.mtu,
        "starting ingress"
    );

    let reader = TunReader::new(dev, Arc::clone(&freeq), Arc::clone(&inq));
    let packetizer = Packetizer::new(sock, inq, freeq, pps, cfg.mtu);

    let handles = vec![
        thread::Builder::new()
            .name("tfs-intf-rx".into())
            .spawn(move || reader.run())?,
        thread::Builder::new()
            .name("tfs-tun-tx".into())
            .spawn(move || packetizer.run())?,
    ];
    Ok(handles)
}

/// Spawn the egress direction: reassembler, interface writer, ACK emitter.
pub fn spawn_egress<T: PacketIo + 'static>(
    dev: Arc<T>,
    sock: UdpSocket,
    cfg: &TunnelConfig,
    pps: Arc<Pps>,
) -> io::Result<Vec<JoinHandle<()>>> {
    let freeq = BufQueue::free_pool("egress-free", OUTER_QUEUE_DEPTH, MAX_BUF, HDR_SPACE)?;
    // An inner packet spans at most this many outer frames.
    let maxiov = MAX_BUF / (cfg.mtu - HDR_LEN) + 2;
    let iov_freeq = IovQueue::free_pool(
        "egress-iov-free",
        OUTER_QUEUE_DEPTH,
        maxiov,
        Arc::clone(&freeq),
    );
    let outq = IovQueue::new("egress-iov-out", OUTER_QUEUE_DEPTH);

    let limiter = (cfg.congest_rate > 0)
        .then(|| RateLimit::new(cfg.congest_rate, 0, CONGEST_WINDOW));
    let ctrl = RateController::new(pps, cfg.mtu);

    info!(congest = cfg.congest_rate, mtu = cfg.mtu, "starting egress");

    let ack_sock = sock.try_clone()?;
    let reassembler = Reassembler::new(
        sock,
        Arc::clone(&freeq),
        Arc::clone(&iov_freeq),
        Arc::clone(&outq),
        limiter,
        ctrl,
    );
    let writer = TunWriter::new(dev, outq, iov_freeq);
    let emitter = AckEmitter::new(ack_sock, freeq, cfg.ack_interval_ms);

    let handles = vec![
        thread::Builder::new()
            .name("tfs-tun-rx".into())
            .spawn(move || reassembler.run())?,
        thread::Builder::new()
            .name("tfs-intf-tx".into())
            .spawn(move || writer.run())?,
        thread::Builder::new()
            .name("tfs-ack".into())
            .spawn(move || emitter.run())?,
    ];
    Ok(handles)
}
