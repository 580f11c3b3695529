//! User-space IP-TFS tunnel.
//!
//! Carries IP packets from a TUN interface to a single UDP peer as a
//! constant-rate stream of fixed-size frames, hiding inner packet sizes
//! and timing; reassembles the peer's stream back onto the interface. A
//! reverse ACK channel reports losses and drives the sending rate.

pub mod buf;
pub mod congest;
pub mod egress;
pub mod ingress;
pub mod iov;
pub mod rate;
pub mod tun;
pub mod tunnel;
pub mod udp;
pub mod wire;
