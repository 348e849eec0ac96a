//! Local channel setup — permission probe and listener port reservation.
//!
//! Some platforms gate local-network access behind a user permission that
//! can only be observed indirectly: a datagram sent to a multicast group
//! either loops back to us or silently vanishes. The probe sends one and
//! waits for it. On platforms without such a model the probe is disabled in
//! config and permission is assumed.
//!
//! The transfer listener binds a random port in the ephemeral range and
//! keeps the socket. The reserved socket becomes the tokio listener
//! directly, so no other process can grab the port in between.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::ops::RangeInclusive;
use std::time::Duration;

use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};

use shuttle_core::config::NetworkConfig;

/// Administratively scoped group used only for the loopback probe.
pub const PROBE_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 77, 77);

const PROBE_MAGIC: &[u8; 8] = b"SHUTTLE?";

const LISTEN_BACKLOG: i32 = 16;

// ── Permission probe ──────────────────────────────────────────────────────────

/// Whether this process may talk to the local network.
pub async fn check_permission(network: &NetworkConfig) -> Result<bool, SetupError> {
    if !network.probe_permission {
        tracing::debug!("local network probe disabled, assuming permission");
        return Ok(true);
    }
    probe_local_network(network.probe_timeout()).await
}

/// Send a nonce to the probe group and wait for it to loop back.
///
/// `PermissionDenied` from the OS, or silence until `timeout`, both mean no.
pub async fn probe_local_network(timeout: Duration) -> Result<bool, SetupError> {
    let socket = match make_probe_socket() {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => return Ok(false),
        Err(e) => return Err(SetupError::Probe(e)),
    };
    let socket = UdpSocket::from_std(socket).map_err(SetupError::Probe)?;
    let port = socket.local_addr().map_err(SetupError::Probe)?.port();

    let nonce: [u8; 16] = rand::thread_rng().gen();
    let datagram = probe_datagram(&nonce);
    let target = SocketAddr::V4(SocketAddrV4::new(PROBE_GROUP, port));

    if let Err(e) = socket.send_to(&datagram, target).await {
        return match e.kind() {
            io::ErrorKind::PermissionDenied => Ok(false),
            _ => Err(SetupError::Probe(e)),
        };
    }

    let mut buf = [0u8; 64];
    let received = tokio::time::timeout(timeout, async {
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, _)) if is_probe_reply(&buf[..len], &nonce) => return Ok(true),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => return Ok(false),
                Err(e) => return Err(SetupError::Probe(e)),
            }
        }
    })
    .await;

    match received {
        Ok(result) => {
            tracing::debug!(granted = ?result.as_ref().ok(), "local network probe finished");
            result
        }
        Err(_) => {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "local network probe timed out");
            Ok(false)
        }
    }
}

fn make_probe_socket() -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
    socket.join_multicast_v4(&PROBE_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(1)?;
    Ok(socket.into())
}

fn probe_datagram(nonce: &[u8; 16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PROBE_MAGIC.len() + nonce.len());
    out.extend_from_slice(PROBE_MAGIC);
    out.extend_from_slice(nonce);
    out
}

fn is_probe_reply(data: &[u8], nonce: &[u8; 16]) -> bool {
    data.len() == PROBE_MAGIC.len() + nonce.len()
        && data.starts_with(PROBE_MAGIC)
        && &data[PROBE_MAGIC.len()..] == nonce
}

// ── Port reservation ──────────────────────────────────────────────────────────

/// A bound, listening TCP socket on a randomly chosen port.
#[derive(Debug)]
pub struct ReservedPort {
    socket: Socket,
    port: u16,
}

impl ReservedPort {
    /// Try up to `attempts` random ports in `range` on `ip`.
    pub fn allocate(
        ip: IpAddr,
        range: RangeInclusive<u16>,
        attempts: u32,
    ) -> Result<Self, SetupError> {
        if range.is_empty() {
            return Err(SetupError::PortExhausted { attempts: 0 });
        }
        let mut rng = rand::thread_rng();
        for attempt in 0..attempts {
            let port = rng.gen_range(range.clone());
            match bind_listener(SocketAddr::new(ip, port)) {
                Ok(socket) => {
                    tracing::debug!(port, attempt, "reserved listener port");
                    return Ok(Self { socket, port });
                }
                Err(e) => {
                    tracing::debug!(port, attempt, error = %e, "port unavailable");
                }
            }
        }
        Err(SetupError::PortExhausted { attempts })
    }

    /// Reserve a port using the configured address, range and attempt count.
    pub fn from_config(network: &NetworkConfig) -> Result<Self, SetupError> {
        Self::allocate(
            network.bind_address,
            network.port_range_start..=network.port_range_end,
            network.max_port_attempts,
        )
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Hand the socket to tokio. Must be called inside a runtime.
    pub fn into_listener(self) -> Result<TcpListener, SetupError> {
        let std_listener: std::net::TcpListener = self.socket.into();
        TcpListener::from_std(std_listener).map_err(SetupError::Listen)
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("no free port after {attempts} attempts")]
    PortExhausted { attempts: u32 },

    #[error("local network probe failed: {0}")]
    Probe(io::Error),

    #[error("failed to create listener: {0}")]
    Listen(io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
