//! Original destination recovery for redirected connections
//!
//! Connections arrive here through an iptables/nftables REDIRECT rule; the
//! address the client actually wanted is kept by the kernel's NAT state and
//! read back with the `SO_ORIGINAL_DST` socket option.

use std::io;
use std::net::SocketAddr;

use tokio::net::TcpStream;

/// Recover the pre-redirect `host:port` of an intercepted connection
#[cfg(target_os = "linux")]
pub fn original_destination(stream: &TcpStream) -> io::Result<SocketAddr> {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
    use std::os::unix::io::AsRawFd;

    const SO_ORIGINAL_DST: libc::c_int = 80;

    let fd = stream.as_raw_fd();

    // IPv4 first; a v6 socket answers on SOL_IPV6 with the same optname.
    unsafe {
        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        if libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        ) == 0
        {
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);
            return Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)));
        }

        let mut addr6: libc::sockaddr_in6 = std::mem::zeroed();
        let mut len6 = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        if libc::getsockopt(
            fd,
            libc::SOL_IPV6,
            SO_ORIGINAL_DST,
            &mut addr6 as *mut _ as *mut libc::c_void,
            &mut len6,
        ) == 0
        {
            let ip = Ipv6Addr::from(addr6.sin6_addr.s6_addr);
            let port = u16::from_be(addr6.sin6_port);
            return Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                0,
                addr6.sin6_scope_id,
            )));
        }

        Err(io::Error::last_os_error())
    }
}

/// Without NAT state to consult, the best stand-in for the intended target
/// is the address the client dialed.
#[cfg(not(target_os = "linux"))]
pub fn original_destination(stream: &TcpStream) -> io::Result<SocketAddr> {
    stream.local_addr()
}
