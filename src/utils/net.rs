//! Networking helpers for the proxy listener and interface lookups.

use std::fs;
use std::io;
use std::net::{SocketAddrV4, TcpListener};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};

use nix::sys::socket::{
    self, sockopt, AddressFamily, Backlog, SockFlag, SockProtocol, SockType, SockaddrIn,
};

/// Pending connection queue length of the proxy listener
pub const PROXY_BACKLOG: i32 = 3;

/// Bind a blocking IPv4 TCP listener with `SO_REUSEADDR` and `SO_REUSEPORT`.
///
/// The listener is recreated every cycle, so both options are needed to
/// rebind the port while the previous cycle's socket lingers in TIME_WAIT.
pub fn bind_tcp_listener(addr: SocketAddrV4, backlog: i32) -> io::Result<TcpListener> {
    let fd = socket::socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::Tcp,
    )
    .map_err(io::Error::from)?;

    socket::setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(io::Error::from)?;
    socket::setsockopt(&fd, sockopt::ReusePort, &true).map_err(io::Error::from)?;

    let sockaddr = SockaddrIn::from(addr);
    socket::bind(fd.as_raw_fd(), &sockaddr).map_err(io::Error::from)?;

    let backlog = Backlog::new(backlog).map_err(io::Error::from)?;
    socket::listen(&fd, backlog).map_err(io::Error::from)?;

    let listener = unsafe { TcpListener::from_raw_fd(fd.into_raw_fd()) };
    Ok(listener)
}

/// Read the MAC address of a network interface from sysfs
pub fn interface_mac_address(interface: &str) -> Option<String> {
    let path = format!("/sys/class/net/{}/address", interface);
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
