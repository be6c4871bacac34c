use std::time::Duration;

use dccrpc_common::protocol::error::{Result, RpcError};
use dccrpc_common::protocol::{Request, ServiceMethod};
use dccrpc_common::transport::{RpcUri, TcpTransport, WireOptions};

/// Checks whether a server URI answers.
///
/// A transient error means the server is unreachable. Any other error means
/// something answered, just not successfully.
pub trait Probe {
    fn probe(&self, uri: &str) -> Result<()>;
}

impl<F> Probe for F
where
    F: Fn(&str) -> Result<()>,
{
    fn probe(&self, uri: &str) -> Result<()> {
        self(uri)
    }
}

/// Probes by connecting with a short timeout and calling `list_methods`.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    transport: TcpTransport,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            transport: TcpTransport::new(WireOptions::default(), timeout),
        }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl Probe for TcpProbe {
    fn probe(&self, uri: &str) -> Result<()> {
        // An unparseable URI can never be reached
        let uri: RpcUri = uri
            .parse()
            .map_err(|e: RpcError| RpcError::Connection(e.to_string()))?;

        let mut stream = self.transport.connect(&uri)?;
        let request = Request::new(ServiceMethod::ListMethods.as_str(), serde_json::Value::Null)
            .with_timeout(self.transport.timeout().as_millis() as u64);
        let response = self.transport.send_request(&mut stream, &request)?;

        response.into_result().map(|_| ())
    }
}
