//! Socket plumbing for every supported transport.
//!
//! The address family comes from the textual shape of the host (the engine
//! does no name resolution): a `/` anywhere means a UNIX path, a `.` means
//! IPv4, a `:` means IPv6, and anything else falls back to a UNIX path.
//! `localhost` is rewritten to `127.0.0.1` before those checks. The socket
//! type comes from the transport, so `udp` against a UNIX path is a datagram
//! socket in the UNIX family.
//!
//! A [`FuzzSocket`] lives for exactly one run and is closed when dropped, so
//! every exit path of a run releases the connection.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{Read, Write};
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::time::Duration;

use crate::script::FuzzScript;
use crate::signals::RunError;
use crate::transport::{Transport, PROTO_RAW};

/// Receive chunk size; reads loop in chunks of this many bytes.
const READ_CHUNK: usize = 4096;

/// Where the conversation is headed, resolved from the host's textual shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Unix(PathBuf),
}

/// Apply the host-shape rules. The port is carried into IP targets and
/// ignored for UNIX paths.
pub fn resolve_target(host: &str, port: u16) -> Result<TargetAddr, RunError> {
    let host = if host == "localhost" { "127.0.0.1" } else { host };
    if host.contains('/') {
        return Ok(TargetAddr::Unix(PathBuf::from(host)));
    }
    if host.contains('.') {
        let ip: Ipv4Addr = host
            .parse()
            .map_err(|_| RunError::Setup(format!("'{host}' is not an IPv4 literal")))?;
        return Ok(TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port)));
    }
    if host.contains(':') {
        let ip: Ipv6Addr = host
            .parse()
            .map_err(|_| RunError::Setup(format!("'{host}' is not an IPv6 literal")))?;
        return Ok(TargetAddr::Ip(SocketAddr::new(IpAddr::V6(ip), port)));
    }
    Ok(TargetAddr::Unix(PathBuf::from(host)))
}

#[derive(Debug)]
enum SocketKind {
    /// Connected stream: tcp over IP or a UNIX path.
    Stream(Socket),
    Tls(native_tls::TlsStream<TcpStream>),
    Datagram(Socket),
    /// Raw L3; sends with `send_to`.
    Raw(Socket),
    /// Link-layer raw, bound to an interface; sends on the binding.
    Link(Socket),
}

#[derive(Debug)]
pub struct FuzzSocket {
    kind: SocketKind,
    /// `send_to` destination for connectionless kinds.
    peer: Option<SockAddr>,
    timeout: Duration,
}

impl FuzzSocket {
    /// Create, bind, and (for stream transports) connect a socket for one run.
    pub fn open(script: &FuzzScript, host: &str) -> Result<Self, RunError> {
        let target = resolve_target(host, script.port)?;
        let timeout = script.receive_timeout;
        let domain = match &target {
            TargetAddr::Ip(sa) if sa.is_ipv4() => Domain::IPV4,
            TargetAddr::Ip(_) => Domain::IPV6,
            TargetAddr::Unix(_) => Domain::UNIX,
        };

        match script.transport {
            Transport::Tcp | Transport::Unix => {
                let sock = Socket::new(domain, Type::STREAM, None)?;
                bind_source(&sock, script, &target)?;
                sock.connect(&peer_sockaddr(&target)?)?;
                Ok(Self { kind: SocketKind::Stream(sock), peer: None, timeout })
            }
            Transport::Tls => {
                let sa = match &target {
                    TargetAddr::Ip(sa) => *sa,
                    TargetAddr::Unix(_) => {
                        return Err(RunError::Setup(
                            "tls requires an IPv4/IPv6 target".into(),
                        ))
                    }
                };
                let sock = Socket::new(domain, Type::STREAM, None)?;
                bind_source(&sock, script, &target)?;
                sock.connect(&SockAddr::from(sa))?;
                let stream: TcpStream = sock.into();
                // Fuzzing targets are not expected to present valid
                // certificates.
                let connector = native_tls::TlsConnector::builder()
                    .danger_accept_invalid_certs(true)
                    .danger_accept_invalid_hostnames(true)
                    .build()
                    .map_err(|e| RunError::Tls(e.to_string()))?;
                let tls = connector
                    .connect(&sa.ip().to_string(), stream)
                    .map_err(|e| RunError::Tls(e.to_string()))?;
                Ok(Self { kind: SocketKind::Tls(tls), peer: None, timeout })
            }
            Transport::Udp => {
                let sock = Socket::new(domain, Type::DGRAM, None)?;
                bind_source(&sock, script, &target)?;
                let peer = peer_sockaddr(&target)?;
                Ok(Self { kind: SocketKind::Datagram(sock), peer: Some(peer), timeout })
            }
            Transport::RawL3(proto) => {
                let sa = match &target {
                    TargetAddr::Ip(sa) => *sa,
                    TargetAddr::Unix(_) => {
                        return Err(RunError::Setup(
                            "raw-l3 requires an IPv4/IPv6 target".into(),
                        ))
                    }
                };
                let sock = Socket::new(domain, Type::RAW, Some(Protocol::from(proto as i32)))?;
                if proto != PROTO_RAW && sa.is_ipv4() {
                    // Kernel writes the IP header.
                    sock.set_header_included(false)?;
                }
                // Raw sends carry no port.
                let peer = SockAddr::from(SocketAddr::new(sa.ip(), 0));
                Ok(Self { kind: SocketKind::Raw(sock), peer: Some(peer), timeout })
            }
            Transport::RawL2 => {
                let interface = script.interface.as_deref().ok_or_else(|| {
                    RunError::Setup("raw-l2 transport requires an interface".into())
                })?;
                let sock = open_packet_socket(interface)?;
                Ok(Self { kind: SocketKind::Link(sock), peer: None, timeout })
            }
        }
    }

    pub fn send(&mut self, payload: &[u8]) -> Result<usize, RunError> {
        let n = match &mut self.kind {
            SocketKind::Stream(s) | SocketKind::Link(s) => s.send(payload)?,
            SocketKind::Tls(s) => {
                s.write_all(payload)?;
                payload.len()
            }
            SocketKind::Datagram(s) | SocketKind::Raw(s) => {
                let peer = self
                    .peer
                    .as_ref()
                    .ok_or_else(|| RunError::Setup("no destination address".into()))?;
                s.send_to(payload, peer)?
            }
        };
        tracing::debug!("sent {n} byte packet");
        Ok(n)
    }

    /// Read the target's response. `hint` is the scripted response length: a
    /// first chunk is always read (zero bytes means the peer closed). Only
    /// when `hint` exceeds the chunk size are further chunks read, until the
    /// total covers `hint` or the peer closes. No exact-`hint` guarantee —
    /// the caller gets whatever arrived; a timeout surfaces as an I/O error.
    pub fn receive(&mut self, hint: usize) -> Result<Vec<u8>, RunError> {
        self.set_read_timeout(self.timeout)?;

        let mut data = self.recv_chunk()?;
        if data.is_empty() {
            return Err(RunError::ConnectionClosed);
        }
        if hint > READ_CHUNK {
            while data.len() < hint {
                let chunk = self.recv_chunk()?;
                if chunk.is_empty() {
                    break;
                }
                data.extend_from_slice(&chunk);
            }
        }
        tracing::debug!("received {} bytes", data.len());
        Ok(data)
    }

    fn recv_chunk(&mut self) -> Result<Vec<u8>, RunError> {
        let mut buf = vec![0u8; READ_CHUNK];
        let n = match &mut self.kind {
            SocketKind::Tls(s) => s.read(&mut buf)?,
            SocketKind::Stream(s) | SocketKind::Datagram(s) => s.recv(as_uninit(&mut buf))?,
            SocketKind::Raw(s) | SocketKind::Link(s) => {
                let (n, _addr) = s.recv_from(as_uninit(&mut buf))?;
                n
            }
        };
        buf.truncate(n);
        Ok(buf)
    }

    fn set_read_timeout(&self, timeout: Duration) -> Result<(), RunError> {
        match &self.kind {
            SocketKind::Tls(s) => s.get_ref().set_read_timeout(Some(timeout))?,
            SocketKind::Stream(s)
            | SocketKind::Datagram(s)
            | SocketKind::Raw(s)
            | SocketKind::Link(s) => s.set_read_timeout(Some(timeout))?,
        }
        Ok(())
    }
}

fn as_uninit(buf: &mut [u8]) -> &mut [MaybeUninit<u8>] {
    // SAFETY: u8 and MaybeUninit<u8> have identical layout, and recv only
    // writes into the slice.
    unsafe { std::slice::from_raw_parts_mut(buf.as_mut_ptr() as _, buf.len()) }
}

fn peer_sockaddr(target: &TargetAddr) -> Result<SockAddr, RunError> {
    match target {
        TargetAddr::Ip(sa) => Ok(SockAddr::from(*sa)),
        TargetAddr::Unix(path) => Ok(SockAddr::unix(path)?),
    }
}

/// Bind the local side for tcp/tls/udp when the script asks for a specific
/// source. Never attempted for UNIX-path targets.
fn bind_source(sock: &Socket, script: &FuzzScript, target: &TargetAddr) -> Result<(), RunError> {
    if !matches!(target, TargetAddr::Ip(_)) {
        return Ok(());
    }
    let parse_ip = |text: &str| -> Result<IpAddr, RunError> {
        text.parse()
            .map_err(|_| RunError::Setup(format!("'{text}' is not an IP literal")))
    };
    if let Some(port) = script.source_port {
        let ip = match script.source_ip.as_deref() {
            Some(text) => parse_ip(text)?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        sock.bind(&SockAddr::from(SocketAddr::new(ip, port)))?;
    } else if let Some(text) = script.source_ip.as_deref() {
        // Port 0 lets the kernel pick.
        sock.bind(&SockAddr::from(SocketAddr::new(parse_ip(text)?, 0)))?;
    }
    Ok(())
}

/// AF_PACKET socket capturing/sending every ethertype, bound to `interface`.
#[cfg(target_os = "linux")]
fn open_packet_socket(interface: &str) -> Result<Socket, RunError> {
    use std::os::unix::io::AsRawFd;

    let protocol = (libc::ETH_P_ALL as u16).to_be();
    let sock = Socket::new(Domain::PACKET, Type::RAW, Some(Protocol::from(protocol as i32)))?;

    let name = std::ffi::CString::new(interface)
        .map_err(|_| RunError::Setup(format!("bad interface name '{interface}'")))?;
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(RunError::Setup(format!("interface '{interface}' not found")));
    }

    let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    sll.sll_family = libc::AF_PACKET as libc::sa_family_t;
    sll.sll_protocol = protocol;
    sll.sll_ifindex = index as libc::c_int;
    let rc = unsafe {
        libc::bind(
            sock.as_raw_fd(),
            &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(RunError::Io(std::io::Error::last_os_error()));
    }
    Ok(sock)
}

#[cfg(not(target_os = "linux"))]
fn open_packet_socket(_interface: &str) -> Result<Socket, RunError> {
    Err(RunError::Setup("raw-l2 is only supported on linux".into()))
}
