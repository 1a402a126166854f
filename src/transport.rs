//! Byte-stream transport used by the session.
//!
//! A [`Connector`] opens one fresh bidirectional stream per round. End of
//! stream (`read` returning 0) is the server's "response complete" signal.
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

pub trait Connector {
    type Stream: Read + Write;

    /// Human-readable endpoint, used in logs and errors.
    fn endpoint(&self) -> String;

    fn connect(&mut self) -> io::Result<Self::Stream>;
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    read_timeout: Option<Duration>,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, read_timeout: None }
    }

    /// Fail a read that sees no data for this long. `None` waits forever.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn connect(&mut self) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in (self.host.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(self.read_timeout)?;
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "host resolved to no addresses")
        }))
    }
}
