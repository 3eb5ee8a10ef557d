use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Socket-address storage the kernel can read from (`connect`) or write
/// into (`accept`).
///
/// Wraps a `sockaddr_storage` large enough for any address family the host
/// supports, plus the length field accept-style syscalls overwrite.
pub struct SockAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl SockAddr {
    /// Zeroed storage with the length primed to the full capacity, ready
    /// for the kernel to fill in.
    pub fn new() -> Self {
        Self {
            // sockaddr_storage is plain data; all-zeroes is AF_UNSPEC.
            storage: unsafe { mem::zeroed() },
            len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }
    }

    /// Encodes a standard-library address into kernel representation.
    pub fn from_std(addr: SocketAddr) -> Self {
        let mut out = Self::new();

        match addr {
            SocketAddr::V4(v4) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: v4.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(v4.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                // SAFETY: sockaddr_storage is sized and aligned to hold any
                // concrete sockaddr type.
                unsafe {
                    std::ptr::write((&mut out.storage as *mut libc::sockaddr_storage).cast(), sin);
                }
                out.len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            }
            SocketAddr::V6(v6) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: v6.port().to_be(),
                    sin6_flowinfo: v6.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: v6.ip().octets(),
                    },
                    sin6_scope_id: v6.scope_id(),
                };
                unsafe {
                    std::ptr::write((&mut out.storage as *mut libc::sockaddr_storage).cast(), sin6);
                }
                out.len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
            }
        }

        out
    }

    /// Decodes whatever the kernel left in the storage back into a
    /// standard-library address.
    pub fn to_std(&self) -> io::Result<SocketAddr> {
        match self.storage.ss_family as libc::c_int {
            libc::AF_INET => {
                if (self.len as usize) < mem::size_of::<libc::sockaddr_in>() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "invalid length for sockaddr_in",
                    ));
                }
                // SAFETY: family and length checked above.
                let sin = unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
                let port = u16::from_be(sin.sin_port);
                Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
            }
            libc::AF_INET6 => {
                if (self.len as usize) < mem::size_of::<libc::sockaddr_in6>() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "invalid length for sockaddr_in6",
                    ));
                }
                // SAFETY: family and length checked above.
                let sin6 = unsafe { &*(&self.storage as *const _ as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                let port = u16::from_be(sin6.sin6_port);
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    ip,
                    port,
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unsupported address family",
            )),
        }
    }

    /// Re-primes the length to full capacity before the kernel writes an
    /// accepted peer's address.
    pub(crate) fn reset_for_accept(&mut self) {
        self.len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    }

    pub(crate) fn as_sockaddr_ptr(&self) -> *const libc::sockaddr {
        (&self.storage as *const libc::sockaddr_storage).cast()
    }

    pub(crate) fn as_sockaddr_mut_ptr(&mut self) -> *mut libc::sockaddr {
        (&mut self.storage as *mut libc::sockaddr_storage).cast()
    }

    pub(crate) fn len(&self) -> libc::socklen_t {
        self.len
    }

    pub(crate) fn len_mut_ptr(&mut self) -> *mut libc::socklen_t {
        &mut self.len
    }
}

impl Default for SockAddr {
    fn default() -> Self {
        Self::new()
    }
}

impl From<SocketAddr> for SockAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::from_std(addr)
    }
}

impl std::fmt::Debug for SockAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_std() {
            Ok(addr) => write!(f, "SockAddr({addr})"),
            Err(_) => write!(f, "SockAddr(family {})", self.storage.ss_family),
        }
    }
}
