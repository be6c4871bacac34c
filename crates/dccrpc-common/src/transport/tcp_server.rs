use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::protocol::error::{Result, RpcError};
use crate::protocol::{Request, Response};
use crate::serialization::SerializationFormat;
use crate::transport::codec::{Codec, WireOptions};
use crate::transport::MAX_MESSAGE_SIZE;

/// Async TCP server speaking the framed protocol.
///
/// Each accepted connection gets its own task; requests on one connection are
/// answered in order. Responses use the serialization format of the request
/// they answer.
pub struct TcpServer {
    listener: TcpListener,
    codec: Codec,
}

impl TcpServer {
    pub async fn bind(bind_addr: &str, options: WireOptions) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| RpcError::Connection(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        Ok(Self {
            listener,
            codec: Codec::new(options),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| RpcError::Connection(format!("Failed to get local addr: {}", e)))
    }

    /// Serves connections until `shutdown` turns `true`.
    ///
    /// Open connections are closed on shutdown as well.
    pub async fn run_until<F, Fut>(&self, handler: F, mut shutdown: watch::Receiver<bool>) -> Result<()>
    where
        F: Fn(Request, SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        let handler = Arc::new(handler);

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let (stream, peer_addr) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
                _ = shutdown.changed() => return Ok(()),
            };

            tracing::debug!(peer = %peer_addr, "Connection established");

            let handler = handler.clone();
            let codec = self.codec;
            let mut conn_shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    result = handle_connection(stream, peer_addr, codec, handler) => {
                        if let Err(e) = result {
                            tracing::debug!(peer = %peer_addr, error = %e, "Connection error");
                        }
                    }
                    _ = conn_shutdown.changed() => {}
                }
            });
        }
    }
}

async fn handle_connection<F, Fut>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    codec: Codec,
    handler: Arc<F>,
) -> Result<()>
where
    F: Fn(Request, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    stream.set_nodelay(true).ok();

    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::debug!(peer = %peer_addr, "Connection closed by peer");
                return Ok(());
            }
            Err(e) => {
                return Err(RpcError::Connection(format!("Failed to read length: {}", e)));
            }
        }

        let len = u32::from_be_bytes(len_buf) as usize;

        if len > MAX_MESSAGE_SIZE {
            return Err(RpcError::InvalidRequest(format!(
                "Message too large: {} bytes (max {} bytes)",
                len, MAX_MESSAGE_SIZE
            )));
        }

        let mut buf = vec![0u8; len];
        stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| RpcError::Connection(format!("Failed to read data: {}", e)))?;

        let (request, format) = match codec.decode_request(&buf) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(peer = %peer_addr, error = %e, "Failed to decode request");
                let error_response = Response::from_error(0, &e);
                send_response(&mut stream, &codec, &error_response, SerializationFormat::Json).await?;
                continue;
            }
        };

        let response = handler(request, peer_addr).await;

        send_response(&mut stream, &codec, &response, format).await?;
    }
}

async fn send_response(
    stream: &mut TcpStream,
    codec: &Codec,
    response: &Response,
    format: SerializationFormat,
) -> Result<()> {
    let frame = match codec.encode_response(response, format) {
        Ok(frame) => frame,
        Err(e) => {
            // Results that cannot be encoded are reported instead of dropping the connection
            tracing::warn!(error = %e, "Failed to encode response");
            codec.encode_response(&Response::from_error(response.id, &e), format)?
        }
    };

    let len = frame.len() as u32;
    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| RpcError::Connection(format!("Failed to send response length: {}", e)))?;
    stream
        .write_all(&frame)
        .await
        .map_err(|e| RpcError::Connection(format!("Failed to send response data: {}", e)))?;

    Ok(())
}
