use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::protocol::error::{Result, RpcError};
use crate::protocol::{Request, Response};
use crate::transport::codec::{Codec, WireOptions};
use crate::transport::uri::RpcUri;
use crate::transport::MAX_MESSAGE_SIZE;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Synchronous TCP transport for blocking request/response round trips.
///
/// The timeout applies to connecting and to every read and write on streams
/// created by [`TcpTransport::connect`]. A read or write that times out maps to
/// [`RpcError::Timeout`]; a broken connection maps to [`RpcError::Connection`].
#[derive(Debug, Clone)]
pub struct TcpTransport {
    codec: Codec,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(options: WireOptions, timeout: Duration) -> Self {
        Self {
            codec: Codec::new(options),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Connects to a server.
    ///
    /// Every resolved address is tried in turn until one accepts.
    pub fn connect(&self, uri: &RpcUri) -> Result<TcpStream> {
        let addr = uri.socket_addr();
        let socket_addrs = addr
            .to_socket_addrs()
            .map_err(|e| RpcError::Connection(format!("Invalid address '{}': {}", addr, e)))?;

        let mut last_err = None;
        for socket_addr in socket_addrs {
            match TcpStream::connect_timeout(&socket_addr, self.timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.timeout)).map_err(|e| {
                        RpcError::Connection(format!("Failed to set read timeout: {}", e))
                    })?;
                    stream.set_write_timeout(Some(self.timeout)).map_err(|e| {
                        RpcError::Connection(format!("Failed to set write timeout: {}", e))
                    })?;
                    stream.set_nodelay(true).ok();

                    return Ok(stream);
                }
                Err(e) => {
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                Err(RpcError::Timeout(self.timeout.as_millis() as u64))
            }
            Some(e) => Err(RpcError::Connection(format!("Failed to connect to {}: {}", uri, e))),
            None => Err(RpcError::Connection(format!(
                "Failed to connect to {}: no address resolved",
                uri
            ))),
        }
    }

    /// Sends a request and blocks until its response arrives.
    pub fn send_request(&self, stream: &mut TcpStream, request: &Request) -> Result<Response> {
        let frame = self.codec.encode_request(request)?;
        self.send_frame(stream, &frame)?;

        let response_frame = self.receive_frame(stream)?;
        let response = self.codec.decode_response(&response_frame)?;

        if response.id != request.id && response.id != 0 {
            return Err(RpcError::InvalidResponse(format!(
                "Response id {} does not match request id {}",
                response.id, request.id
            )));
        }

        Ok(response)
    }

    pub fn send_frame(&self, stream: &mut TcpStream, frame: &[u8]) -> Result<()> {
        if frame.len() > MAX_MESSAGE_SIZE {
            return Err(RpcError::InvalidRequest(format!(
                "Message too large: {} bytes (max {} bytes)",
                frame.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let len = frame.len() as u32;

        stream
            .write_all(&len.to_be_bytes())
            .map_err(|e| self.map_io_error(e, "writing length prefix"))?;
        stream
            .write_all(frame)
            .map_err(|e| self.map_io_error(e, "writing data"))?;
        stream
            .flush()
            .map_err(|e| self.map_io_error(e, "flushing stream"))?;

        Ok(())
    }

    pub fn receive_frame(&self, stream: &mut TcpStream) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .map_err(|e| self.map_io_error(e, "reading length prefix"))?;

        let len = u32::from_be_bytes(len_buf) as usize;

        if len > MAX_MESSAGE_SIZE {
            return Err(RpcError::InvalidResponse(format!(
                "Message too large: {} bytes (max {} bytes)",
                len, MAX_MESSAGE_SIZE
            )));
        }

        let mut buf = vec![0u8; len];
        stream
            .read_exact(&mut buf)
            .map_err(|e| self.map_io_error(e, "reading data"))?;

        Ok(buf)
    }

    fn map_io_error(&self, err: std::io::Error, context: &str) -> RpcError {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                RpcError::Timeout(self.timeout.as_millis() as u64)
            }
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::NotConnected => {
                RpcError::Connection(format!("{}: Connection lost", context))
            }
            _ => RpcError::Io(err),
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(WireOptions::default(), DEFAULT_TIMEOUT)
    }
}
