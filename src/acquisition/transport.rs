//! Byte transports the acquisition worker reads from
//!
//! Every transport is opened with a short read timeout so a blocked read
//! always returns control to the worker loop.

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use crate::error::TransportError;

/// Handshake prefix a UDP client sends to register with a simulation server
pub const UDP_CONNECT_PREFIX: &str = "CONNECT:";

/// A bidirectional byte link
pub trait Transport: Send {
    /// Read whatever arrived, waiting at most the link's read timeout
    ///
    /// `Ok(0)` means nothing arrived. A closed link is reported as an error.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Discard buffered input
    fn clear_input(&mut self) -> io::Result<()> {
        let mut scratch = [0u8; 256];
        for _ in 0..64 {
            if self.read(&mut scratch)? == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Human-readable endpoint for logs
    fn describe(&self) -> String;
}

/// Transport shared between the worker and the device command path
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Wrap a transport for sharing
pub fn share(transport: Box<dyn Transport>) -> SharedTransport {
    Arc::new(Mutex::new(transport))
}

fn no_data_on_timeout(result: io::Result<usize>) -> io::Result<usize> {
    match result {
        Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => Ok(0),
        other => other,
    }
}

fn resolve(address: &str) -> Result<SocketAddr, TransportError> {
    address
        .to_socket_addrs()
        .map_err(|e| TransportError::Resolve(format!("{}: {}", address, e)))?
        .next()
        .ok_or_else(|| TransportError::Resolve(format!("{}: no address", address)))
}

/// Serial port transport
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    path: String,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32, read_timeout: Duration) -> Result<Self, TransportError> {
        let port = serialport::new(path, baud_rate)
            .timeout(read_timeout)
            .open()?;
        tracing::info!("Opened serial port {} at {} baud", path, baud_rate);
        Ok(Self {
            port,
            path: path.to_string(),
        })
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        no_data_on_timeout(self.port.read(buf))
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

/// UDP client of a simulation server
///
/// On open the client announces its own address with
/// `CONNECT:<ip>:<port>`; the server then streams datagrams to it.
pub struct UdpTransport {
    socket: UdpSocket,
    server: SocketAddr,
}

impl UdpTransport {
    pub fn open(address: &str, read_timeout: Duration) -> Result<Self, TransportError> {
        let server = resolve(address)?;
        let socket = Socket::new(Domain::for_address(server), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_recv_buffer_size(1 << 20)?;

        let bind_addr: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        socket.bind(&bind_addr.into())?;

        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(read_timeout.max(Duration::from_millis(1))))?;
        socket.connect(server)?;

        let local = socket.local_addr()?;
        let hello = format!("{}{}:{}", UDP_CONNECT_PREFIX, local.ip(), local.port());
        socket.send(hello.as_bytes())?;
        tracing::info!("Sent UDP handshake to {} from {}", server, local);

        Ok(Self { socket, server })
    }
}

impl Transport for UdpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        no_data_on_timeout(self.socket.recv(buf))
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.socket.send(data).map(|_| ())
    }

    fn describe(&self) -> String {
        format!("udp://{}", self.server)
    }
}

/// TCP client of a simulation server
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpTransport {
    pub fn open(
        address: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let peer = resolve(address)?;
        let socket = Socket::new(Domain::for_address(peer), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nodelay(true)?;
        socket.connect_timeout(&peer.into(), connect_timeout)?;

        let stream: TcpStream = socket.into();
        stream.set_read_timeout(Some(read_timeout.max(Duration::from_millis(1))))?;
        tracing::info!("Connected TCP stream to {}", peer);

        Ok(Self { stream, peer })
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buf) {
            Ok(0) if !buf.is_empty() => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed stream",
            )),
            other => no_data_on_timeout(other),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.peer)
    }
}
