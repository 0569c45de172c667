use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

use fanout_api::BatchedWriter;
use fanout_pipeline::{Acknowledge, DeliveryError, SinkFactory, Validator};

use crate::endpoint::Endpoint;

// ════════════════════════════════════════════════════════════════
//  SocketWriter
// ════════════════════════════════════════════════════════════════

enum Conn {
    Tcp(TcpStream),
    Udp(UdpSocket),
    #[cfg(unix)]
    Unix(UnixStream),
}

/// One open connection. Every `write` on a UDP sink is one datagram.
pub struct SocketWriter {
    conn: Conn,
    name: String,
    written: u64,
    broken: bool,
}

impl SocketWriter {
    fn track<T>(&mut self, res: io::Result<T>) -> io::Result<T> {
        if res.is_err() {
            self.broken = true;
        }
        res
    }
}

impl Write for SocketWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res = match &mut self.conn {
            Conn::Tcp(s) => s.write(buf),
            Conn::Udp(s) => s.send(buf),
            #[cfg(unix)]
            Conn::Unix(s) => s.write(buf),
        };
        let n = self.track(res)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let res = match &mut self.conn {
            Conn::Tcp(s) => s.flush(),
            Conn::Udp(_) => Ok(()),
            #[cfg(unix)]
            Conn::Unix(s) => s.flush(),
        };
        self.track(res)
    }
}

impl BatchedWriter for SocketWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.written
    }

    fn is_accessible(&self) -> bool {
        !self.broken
    }

    fn read_response(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let res = match &mut self.conn {
            Conn::Tcp(s) => s.read_exact(buf),
            Conn::Udp(_) => Err(io::Error::new(io::ErrorKind::Unsupported, "udp sink has no response channel")),
            #[cfg(unix)]
            Conn::Unix(s) => s.read_exact(buf),
        };
        self.track(res)
    }

    fn close(&mut self) -> io::Result<()> {
        self.flush()?;
        match &self.conn {
            Conn::Tcp(s) => shutdown_quietly(s.shutdown(std::net::Shutdown::Both)),
            Conn::Udp(_) => Ok(()),
            #[cfg(unix)]
            Conn::Unix(s) => shutdown_quietly(s.shutdown(std::net::Shutdown::Both)),
        }
    }
}

/// The peer may already be gone; that is not a close failure.
fn shutdown_quietly(res: io::Result<()>) -> io::Result<()> {
    match res {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

// ════════════════════════════════════════════════════════════════
//  SocketSink
// ════════════════════════════════════════════════════════════════

/// Connects to the configured endpoint on every (re)open.
pub struct SocketSink {
    endpoint: Endpoint,
    acknowledge: Option<Acknowledge>,
    io_timeout: Duration,
}

impl SocketSink {
    pub fn new(endpoint: Endpoint, acknowledge: Option<Acknowledge>, io_timeout: Duration) -> Self {
        Self { endpoint, acknowledge, io_timeout }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn resolve(addr: &str) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("{addr} resolved to nothing")));
        }
        Ok(addrs)
    }

    fn connect(&self) -> io::Result<Conn> {
        let timeout = Some(self.io_timeout);
        match &self.endpoint {
            Endpoint::Tcp(addr) => {
                let mut last = None;
                for sa in Self::resolve(addr)? {
                    match TcpStream::connect_timeout(&sa, self.io_timeout) {
                        Ok(stream) => {
                            stream.set_read_timeout(timeout)?;
                            stream.set_write_timeout(timeout)?;
                            return Ok(Conn::Tcp(stream));
                        }
                        Err(e) => last = Some(e),
                    }
                }
                Err(last.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotFound)))
            }
            Endpoint::Udp(addr) => {
                let target = Self::resolve(addr)?[0];
                let local: SocketAddr = match target {
                    SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
                    SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
                };
                let socket = UdpSocket::bind(local)?;
                socket.connect(target)?;
                Ok(Conn::Udp(socket))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path)?;
                stream.set_read_timeout(timeout)?;
                stream.set_write_timeout(timeout)?;
                Ok(Conn::Unix(stream))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(io::Error::new(io::ErrorKind::Unsupported, "unix sockets are not available")),
        }
    }
}

impl SinkFactory for SocketSink {
    fn open(&mut self) -> Result<Box<dyn BatchedWriter>, DeliveryError> {
        let conn = self
            .connect()
            .map_err(|e| DeliveryError::ResourceUnavailable(format!("connect {}: {e}", self.endpoint)))?;
        Ok(Box::new(SocketWriter { conn, name: self.endpoint.to_string(), written: 0, broken: false }))
    }

    fn validator(&self) -> Option<Box<dyn Validator>> {
        self.acknowledge.clone().map(|ack| Box::new(ack) as Box<dyn Validator>)
    }
}
