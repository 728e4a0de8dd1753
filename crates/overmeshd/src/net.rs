//! Socket setup and endpoint strings.
//!
//! Endpoints are written `udp://<socket-addr>`, e.g. `udp://[fe80::1%2]:9700`
//! or `udp://192.0.2.7:9700`.

use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};

use overmesh_core::wire::MULTICAST_ADDR;

pub const UDP_SCHEME: &str = "udp://";

pub fn parse_endpoint(endpoint: &str) -> Option<SocketAddr> {
    endpoint.strip_prefix(UDP_SCHEME)?.parse().ok()
}

pub fn format_endpoint(addr: SocketAddr) -> String {
    format!("{UDP_SCHEME}{addr}")
}

/// Get the OS interface index for a named network interface.
pub fn if_index(name: &str) -> Result<u32> {
    let name_cstr = std::ffi::CString::new(name).context("interface name contains null byte")?;
    let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
    if index == 0 {
        anyhow::bail!("interface '{}' not found", name);
    }
    Ok(index)
}

/// The link-local multicast group on `interface_index`, at `port`.
pub fn multicast_dest(interface_index: u32, port: u16) -> Result<SocketAddr> {
    let group: Ipv6Addr = MULTICAST_ADDR.parse().context("bad multicast address")?;
    Ok(SocketAddr::V6(SocketAddrV6::new(group, port, 0, interface_index)))
}

/// Our link-local address on `interface_index`, found by connecting a probe
/// socket towards the multicast group.
pub fn link_local_addr(interface_index: u32) -> Result<Ipv6Addr> {
    let probe = std::net::UdpSocket::bind("[::]:0")?;
    probe.connect(multicast_dest(interface_index, 9)?)?;
    match probe.local_addr()? {
        SocketAddr::V6(v6) => Ok(*v6.ip()),
        _ => anyhow::bail!("expected IPv6 local address"),
    }
}

/// Bind the overlay socket. With an interface it also joins the link-local
/// multicast group used for the neighbor flood.
pub fn bind_socket(bind: SocketAddr, interface_index: Option<u32>) -> Result<std::net::UdpSocket> {
    let domain = match bind.ip() {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    if domain == Domain::IPV6 {
        socket.set_only_v6(true).context("IPV6_V6ONLY")?;
    }
    socket.bind(&bind.into()).context("bind()")?;

    if let Some(index) = interface_index {
        if domain != Domain::IPV6 {
            anyhow::bail!("local flood needs an IPv6 bind address");
        }
        let group: Ipv6Addr = MULTICAST_ADDR.parse().context("bad multicast address")?;
        socket
            .join_multicast_v6(&group, index)
            .context("IPV6_JOIN_GROUP")?;
        socket.set_multicast_if_v6(index).context("IPV6_MULTICAST_IF")?;
        socket.set_multicast_hops_v6(1).context("IPV6_MULTICAST_HOPS")?;
    }

    Ok(socket.into())
}
