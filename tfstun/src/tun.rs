//! TUN device access.
//!
//! The tunnel moves raw IP packets across a Layer 3 TUN device: one packet
//! per read, one packet per write, no packet-information header
//! (`IFF_NO_PI`). The device name may be a template like `vtun%d`, which
//! the kernel expands to the first free index.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use nix::libc;

/// TUN flags from linux/if_tun.h
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// ioctl request code for TUNSETIFF
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// ifreq structure for TUN device configuration
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22], // padding to match kernel struct size
}

/// Packet-granular I/O, as a TUN device provides it.
///
/// The data-plane tasks only need this much of the device, which keeps them
/// runnable against any datagram-preserving file descriptor; a connected
/// `UnixDatagram` pair is a faithful stand-in in tests.
pub trait PacketIo: Send + Sync {
    /// Read one whole packet. Blocks until a packet is available.
    fn recv_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one whole packet gathered from `iov`.
    fn send_packet(&self, iov: &[libc::iovec]) -> io::Result<usize>;
}

/// A Layer 3 TUN device open for blocking packet I/O.
pub struct TunDevice {
    name: String,
    file: File,
}

impl TunDevice {
    /// Open `/dev/net/tun` and attach to (or create) the named interface.
    pub fn open(name: &str) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")?;

        let mut ifr = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 22],
        };

        let name_bytes = name.as_bytes();
        if name_bytes.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "TUN device name too long",
            ));
        }
        for (i, &b) in name_bytes.iter().enumerate() {
            ifr.ifr_name[i] = b as libc::c_char;
        }

        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        // The kernel may have expanded a %d template; read the name back.
        let assigned: Vec<u8> = ifr
            .ifr_name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        let name = String::from_utf8_lossy(&assigned).into_owned();

        Ok(Self { name, file })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            name: self.name.clone(),
            file: self.file.try_clone()?,
        })
    }
}

impl AsRawFd for TunDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl PacketIo for TunDevice {
    fn recv_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        read_fd(self.file.as_raw_fd(), buf)
    }

    fn send_packet(&self, iov: &[libc::iovec]) -> io::Result<usize> {
        writev_fd(self.file.as_raw_fd(), iov)
    }
}

impl PacketIo for std::os::unix::net::UnixDatagram {
    fn recv_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        read_fd(self.as_raw_fd(), buf)
    }

    fn send_packet(&self, iov: &[libc::iovec]) -> io::Result<usize> {
        writev_fd(self.as_raw_fd(), iov)
    }
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: the pointer and length describe a valid writable region.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn writev_fd(fd: RawFd, iov: &[libc::iovec]) -> io::Result<usize> {
    // SAFETY: every iovec points at memory kept alive by the caller for the
    // duration of the call.
    let n = unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as libc::c_int) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram;

    #[test]
    fn test_datagram_pair_packet_io() {
        let (a, b) = UnixDatagram::pair().unwrap();

        let part1 = *b"hello ";
        let part2 = *b"tunnel";
        let iov = [
            libc::iovec {
                iov_base: part1.as_ptr() as *mut libc::c_void,
                iov_len: part1.len(),
            },
            libc::iovec {
                iov_base: part2.as_ptr() as *mut libc::c_void,
                iov_len: part2.len(),
            },
        ];
        let n = a.send_packet(&iov).unwrap();
        assert_eq!(n, 12);

        let mut buf = [0u8; 64];
        let n = b.recv_packet(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello tunnel");
    }

    // TUN creation needs CAP_NET_ADMIN; exercised via the binary, not here.
}
