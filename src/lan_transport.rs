use std::{net::Shutdown, time::Duration};

use async_std::{net::TcpStream, prelude::*};

use async_trait::async_trait;

use log::{debug, info};

use crate::{
    error::{Error, Result},
    tcp_client_handshake::TcpClientHandshake,
    transport::{DisconnectHandle, Transport, TransportKind},
};

/// Default TCP port of VBus-over-TCP services.
pub const DEFAULT_PORT: u16 = 7053;

/// Default VBus-over-TCP password.
pub const DEFAULT_PASSWORD: &str = "vbus";

const READ_BUFFER_LEN: usize = 1024;

/// Receives VBus data from a VBus-over-TCP service (DL2, DL3, VBus/LAN adapter).
///
/// # Examples
///
/// ```no_run
/// # fn main() -> vbus_bridge::Result<()> { async_std::task::block_on(async {
/// #
/// use std::time::Duration;
///
/// use vbus_bridge::{LanTransport, Transport};
///
/// let mut transport = LanTransport::new("192.168.5.217", 7053, "vbus");
/// transport.connect().await?;
/// let chunk = transport.read_chunk(Duration::from_secs(5)).await?;
/// transport.disconnect().await;
/// #
/// # Ok(()) }) }
/// ```
#[derive(Debug)]
pub struct LanTransport {
    host: String,
    port: u16,
    password: String,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    handle: DisconnectHandle,
}

impl LanTransport {
    /// Create a transport for `host:port` authenticating with `password`.
    pub fn new(host: &str, port: u16, password: &str) -> LanTransport {
        LanTransport {
            host: host.to_string(),
            port,
            password: password.to_string(),
            connect_timeout: Duration::from_secs(10),
            stream: None,
            handle: DisconnectHandle::new(),
        }
    }

    /// Set the timeout for establishing the connection including the handshake.
    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = timeout;
    }

    /// The `host:port` this transport connects to.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn open(host: String, port: u16, password: String) -> Result<TcpStream> {
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|err| Error::Connect(format!("{}:{}: {}", host, port, err)))?;

        let mut hs = TcpClientHandshake::start(stream).await?;
        hs.send_pass_command(&password).await?;
        hs.send_data_command().await
    }
}

#[async_trait]
impl Transport for LanTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Lan
    }

    fn disconnect_handle(&self) -> DisconnectHandle {
        self.handle.clone()
    }

    async fn connect(&mut self) -> Result<()> {
        self.disconnect().await;

        debug!("Connecting to {}...", self.endpoint());

        let opening = LanTransport::open(self.host.clone(), self.port, self.password.clone());
        match self.handle.run(self.connect_timeout, opening).await? {
            Some(stream) => {
                info!("Connected to {}", self.endpoint());
                self.stream = Some(stream);
                Ok(())
            }
            None => Err(Error::Connect(format!(
                "Timed out connecting to {}",
                self.endpoint()
            ))),
        }
    }

    async fn read_chunk(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let mut stream = match self.stream {
            Some(ref stream) => stream.clone(),
            None => return Err(Error::Read("Not connected".into())),
        };

        let reading = async move {
            let mut buf = vec![0u8; READ_BUFFER_LEN];
            let len = stream.read(&mut buf).await?;
            if len == 0 {
                return Err(Error::Read("Connection closed by peer".into()));
            }
            buf.truncate(len);
            Ok(buf)
        };

        match self.handle.run(timeout, reading).await {
            Ok(Some(chunk)) => Ok(chunk),
            Ok(None) => Ok(Vec::new()),
            Err(err) => {
                self.disconnect().await;
                Err(err)
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            debug!("Disconnecting from {}", self.endpoint());
            drop(stream.shutdown(Shutdown::Both));
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}
