// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TCP MD5 signature option (RFC 2385).
//!
//! The option is passed to `setsockopt(IPPROTO_TCP, TCP_MD5SIG)` as the Linux
//! `struct tcp_md5sig`. The layout is serialized byte by byte so it can be
//! built and checked on any host, but only applied on Linux.
//!
//! ```text
//! offset  size  field
//!      0     2  address family (host order)
//!      2     2  peer port (network order)
//!      4     4  IPv4 address (network order)
//!      8   120  sockaddr_storage padding
//!    128     1  flags
//!    129     1  prefix length
//!    130     2  key length (host order)
//!    132     4  ifindex
//!    136    80  key, zero padded
//! ```

use crate::error::Error;
use std::net::{IpAddr, Ipv4Addr};

/// Size of `struct sockaddr_storage`.
const SOCKADDR_STORAGE_SIZE: usize = 128;

/// Longest key the kernel accepts.
pub const TCP_MD5SIG_MAXKEYLEN: usize = 80;

const FAMILY_OFFSET: usize = 0;
const PORT_OFFSET: usize = 2;
const ADDR_OFFSET: usize = 4;
const KEYLEN_OFFSET: usize = SOCKADDR_STORAGE_SIZE + 2;
const KEY_OFFSET: usize = SOCKADDR_STORAGE_SIZE + 8;

/// `AF_INET` as the kernel stores it in `sa_family_t`.
const AF_INET: u16 = libc::AF_INET as u16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Md5SigOption {
    pub addr: Ipv4Addr,
    pub port: u16,
    key: Vec<u8>,
}

impl Md5SigOption {
    pub const WIRE_SIZE: usize = KEY_OFFSET + TCP_MD5SIG_MAXKEYLEN;

    /// Build an option for `addr`. Only IPv4 peers are supported.
    pub fn new(addr: IpAddr, port: u16, key: &[u8]) -> Result<Self, Error> {
        let addr = match addr {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(_) => return Err(Error::Md5UnsupportedAddress(addr)),
        };
        if key.len() > TCP_MD5SIG_MAXKEYLEN {
            return Err(Error::Md5KeyTooLong(key.len(), TCP_MD5SIG_MAXKEYLEN));
        }
        Ok(Self {
            addr,
            port,
            key: key.to_vec(),
        })
    }

    /// Build the option a session to `addr` will apply to its socket. Fails
    /// on platforms where the option cannot be applied.
    pub fn for_peer(addr: IpAddr, port: u16, key: &str) -> Result<Self, Error> {
        if !cfg!(target_os = "linux") {
            return Err(Error::Md5UnsupportedPlatform);
        }
        Self::new(addr, port, key.as_bytes())
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[FAMILY_OFFSET..FAMILY_OFFSET + 2]
            .copy_from_slice(&AF_INET.to_ne_bytes());
        buf[PORT_OFFSET..PORT_OFFSET + 2]
            .copy_from_slice(&self.port.to_be_bytes());
        buf[ADDR_OFFSET..ADDR_OFFSET + 4].copy_from_slice(&self.addr.octets());
        // Key length fits: it was checked against the 80 byte maximum.
        buf[KEYLEN_OFFSET..KEYLEN_OFFSET + 2]
            .copy_from_slice(&(self.key.len() as u16).to_ne_bytes());
        buf[KEY_OFFSET..KEY_OFFSET + self.key.len()].copy_from_slice(&self.key);
        buf
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != Self::WIRE_SIZE {
            return Err(Error::Md5Malformed(format!(
                "expected {} bytes, got {}",
                Self::WIRE_SIZE,
                buf.len()
            )));
        }
        let family =
            u16::from_ne_bytes([buf[FAMILY_OFFSET], buf[FAMILY_OFFSET + 1]]);
        if family != AF_INET {
            return Err(Error::Md5Malformed(format!(
                "unsupported address family {family}"
            )));
        }
        let port =
            u16::from_be_bytes([buf[PORT_OFFSET], buf[PORT_OFFSET + 1]]);
        let addr = Ipv4Addr::new(
            buf[ADDR_OFFSET],
            buf[ADDR_OFFSET + 1],
            buf[ADDR_OFFSET + 2],
            buf[ADDR_OFFSET + 3],
        );
        let keylen = usize::from(u16::from_ne_bytes([
            buf[KEYLEN_OFFSET],
            buf[KEYLEN_OFFSET + 1],
        ]));
        if keylen > TCP_MD5SIG_MAXKEYLEN {
            return Err(Error::Md5KeyTooLong(keylen, TCP_MD5SIG_MAXKEYLEN));
        }
        Self::new(
            IpAddr::V4(addr),
            port,
            &buf[KEY_OFFSET..KEY_OFFSET + keylen],
        )
    }

    /// Install the option on a socket that has not connected yet.
    #[cfg(target_os = "linux")]
    pub fn apply(&self, socket: &socket2::Socket) -> Result<(), Error> {
        use std::os::fd::AsRawFd;

        let buf = self.to_wire();
        // SAFETY: buf is a fully initialized tcp_md5sig image and outlives
        // the call.
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_MD5SIG,
                buf.as_ptr() as *const libc::c_void,
                buf.len() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(Error::Md5Apply(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn apply(&self, _socket: &socket2::Socket) -> Result<(), Error> {
        Err(Error::Md5UnsupportedPlatform)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn layout_round_trip() {
        let opt = Md5SigOption::new("10.0.0.1".parse().unwrap(), 179, b"abc123")
            .expect("build option");
        let buf = opt.to_wire();

        assert_eq!(buf.len(), 216);
        assert_eq!(u16::from_ne_bytes([buf[0], buf[1]]), AF_INET);
        assert_eq!(&buf[2..4], &[0x00, 0xb3]);
        assert_eq!(&buf[4..8], &[10, 0, 0, 1]);
        assert!(buf[8..130].iter().all(|b| *b == 0));
        assert_eq!(u16::from_ne_bytes([buf[130], buf[131]]), 6);
        assert_eq!(&buf[136..142], b"abc123");
        assert!(buf[142..].iter().all(|b| *b == 0));

        let parsed = Md5SigOption::from_wire(&buf).expect("parse option");
        assert_eq!(parsed.addr, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(parsed.port, 179);
        assert_eq!(parsed.key(), b"abc123");
    }

    #[test]
    fn key_too_long() {
        let key = [b'k'; TCP_MD5SIG_MAXKEYLEN + 1];
        assert!(matches!(
            Md5SigOption::new("10.0.0.1".parse().unwrap(), 179, &key),
            Err(Error::Md5KeyTooLong(81, 80))
        ));

        let key = [b'k'; TCP_MD5SIG_MAXKEYLEN];
        let opt = Md5SigOption::new("10.0.0.1".parse().unwrap(), 179, &key)
            .expect("max length key");
        assert_eq!(&opt.to_wire()[KEY_OFFSET..], &key[..]);
    }

    #[test]
    fn ipv6_rejected() {
        let addr: IpAddr = "fd00::1".parse().unwrap();
        assert!(matches!(
            Md5SigOption::new(addr, 179, b"abc123"),
            Err(Error::Md5UnsupportedAddress(a)) if a == addr
        ));
    }

    #[test]
    fn truncated_buffer() {
        let opt = Md5SigOption::new("10.0.0.1".parse().unwrap(), 179, b"abc")
            .expect("build option");
        let buf = opt.to_wire();
        assert!(matches!(
            Md5SigOption::from_wire(&buf[..100]),
            Err(Error::Md5Malformed(_))
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn matches_kernel_struct() {
        assert_eq!(
            std::mem::size_of::<libc::sockaddr_storage>(),
            SOCKADDR_STORAGE_SIZE
        );
        assert_eq!(libc::TCP_MD5SIG, 14);
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn unsupported_platform() {
        assert!(matches!(
            Md5SigOption::for_peer("10.0.0.1".parse().unwrap(), 179, "abc123"),
            Err(Error::Md5UnsupportedPlatform)
        ));
    }
}
