//! Interface enumeration and UDP socket setup for broadcast probes.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use local_ip_address::list_afinet_netifas;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use super::types::DiscoveryError;
use crate::utils::is_virtual_interface;

/// A usable IPv4 network interface.
#[derive(Debug, Clone)]
pub(crate) struct InterfaceInfo {
    pub name: String,
    pub ip: Ipv4Addr,
    /// Directed broadcast address, assuming a /24.
    pub broadcast: Ipv4Addr,
}

/// Lists non-virtual, non-loopback IPv4 interfaces.
pub(crate) fn get_interfaces() -> Vec<InterfaceInfo> {
    list_afinet_netifas()
        .unwrap_or_else(|e| {
            log::warn!("[Discovery] Failed to list network interfaces: {}", e);
            Vec::new()
        })
        .into_iter()
        .filter_map(|(name, addr)| {
            if is_virtual_interface(&name) {
                log::trace!("[Discovery] Skipping virtual interface: {}", name);
                return None;
            }
            match addr {
                IpAddr::V4(ipv4) if !ipv4.is_loopback() => {
                    let [a, b, c, _] = ipv4.octets();
                    Some(InterfaceInfo {
                        name,
                        ip: ipv4,
                        broadcast: Ipv4Addr::new(a, b, c, 255),
                    })
                }
                _ => None,
            }
        })
        .collect()
}

/// Creates a UDP socket bound to `iface_ip` on an ephemeral port.
///
/// Replies come back unicast to the sending port, so the same socket is used
/// for sending and receiving.
pub(crate) fn create_socket(
    iface_ip: Ipv4Addr,
    enable_broadcast: bool,
) -> Result<UdpSocket, DiscoveryError> {
    let bind_addr = SocketAddr::new(IpAddr::V4(iface_ip), 0);

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(DiscoveryError::SocketBind)?;

    if let Err(e) = socket.set_reuse_address(true) {
        log::warn!("[Discovery] Failed to set SO_REUSEADDR on {}: {}", iface_ip, e);
    }

    #[cfg(unix)]
    if let Err(e) = socket.set_reuse_port(true) {
        log::warn!("[Discovery] Failed to set SO_REUSEPORT on {}: {}", iface_ip, e);
    }

    if enable_broadcast {
        if let Err(e) = socket.set_broadcast(true) {
            log::warn!("[Discovery] Failed to set SO_BROADCAST on {}: {}", iface_ip, e);
        }
    }

    socket
        .set_nonblocking(true)
        .map_err(DiscoveryError::SocketBind)?;
    socket
        .bind(&bind_addr.into())
        .map_err(DiscoveryError::SocketBind)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(DiscoveryError::SocketBind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_socket_sends_and_receives() {
        let a = create_socket(Ipv4Addr::LOCALHOST, false).unwrap();
        let b = create_socket(Ipv4Addr::LOCALHOST, true).unwrap();

        a.send_to(b"hello", b.local_addr().unwrap()).await.unwrap();
        let mut buf = [0u8; 16];
        let (len, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[test]
    fn interfaces_exclude_loopback() {
        assert!(get_interfaces().iter().all(|iface| !iface.ip.is_loopback()));
    }
}
