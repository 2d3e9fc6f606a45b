use async_std::{net::TcpStream, prelude::*};

use log::trace;

use resol_vbus::BlobBuffer;

use crate::error::{Error, Result};

enum Reply {
    Positive,
    Negative(String),
}

/// Handles the client-side of the [VBus-over-TCP][1] handshake.
///
/// Failures are classified for the receiver's error handling: a rejected
/// `PASS` command is `Error::Auth`, everything else (no greeting, EOF,
/// unexpected replies) is `Error::Connect`.
///
/// [1]: http://danielwippermann.github.io/resol-vbus/vbus-over-tcp.html
#[derive(Debug)]
pub struct TcpClientHandshake {
    stream: TcpStream,
    buf: BlobBuffer,
}

impl TcpClientHandshake {
    /// Start the handshake by waiting for the initial greeting reply from the service.
    pub async fn start(stream: TcpStream) -> Result<TcpClientHandshake> {
        let mut hs = TcpClientHandshake {
            stream,
            buf: BlobBuffer::new(),
        };

        match hs.read_reply().await? {
            Reply::Positive => Ok(hs),
            Reply::Negative(line) => Err(Error::Connect(format!("Greeting rejected: {}", line))),
        }
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let line = loop {
            if let Some(idx) = self.buf.iter().position(|b| *b == 10) {
                let line = String::from_utf8_lossy(&self.buf[0..idx]).trim().to_string();
                self.buf.consume(idx + 1);

                break line;
            }

            let mut buf = [0u8; 256];
            let len = self
                .stream
                .read(&mut buf)
                .await
                .map_err(|err| Error::Connect(err.to_string()))?;
            if len == 0 {
                return Err(Error::Connect("Reached EOF during handshake".into()));
            }

            self.buf.extend_from_slice(&buf[0..len]);
        };

        trace!("Handshake reply: {}", line);

        if line.starts_with('+') {
            Ok(Reply::Positive)
        } else if line.starts_with('-') {
            Ok(Reply::Negative(line))
        } else {
            Err(Error::Connect(format!("Unexpected reply: {}", line)))
        }
    }

    async fn send_command(&mut self, cmd: &str, args: Option<&str>) -> Result<Reply> {
        let cmd = match args {
            Some(args) => format!("{} {}\r\n", cmd, args),
            None => format!("{}\r\n", cmd),
        };

        self.stream
            .write_all(cmd.as_bytes())
            .await
            .map_err(|err| Error::Connect(err.to_string()))?;

        self.read_reply().await
    }

    /// Send the `PASS` command and wait for the reply.
    pub async fn send_pass_command(&mut self, password: &str) -> Result<()> {
        match self.send_command("PASS", Some(password)).await? {
            Reply::Positive => Ok(()),
            Reply::Negative(line) => Err(Error::Auth(line)),
        }
    }

    /// Send the `DATA` command and wait for the reply.
    ///
    /// This function returns the underlying `TcpStream` since the handshake is complete
    /// after sending this command.
    pub async fn send_data_command(mut self) -> Result<TcpStream> {
        match self.send_command("DATA", None).await? {
            Reply::Positive => Ok(self.stream),
            Reply::Negative(line) => Err(Error::Connect(format!("DATA rejected: {}", line))),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_std::{net::TcpListener, task};

    use crate::test_utils::{serve_handshake, HandshakeOutcome};

    use super::*;

    async fn client(addr: std::net::SocketAddr, password: &str) -> Result<TcpStream> {
        let stream = TcpStream::connect(addr).await?;

        let mut hs = TcpClientHandshake::start(stream).await?;
        hs.send_pass_command(password).await?;
        hs.send_data_command().await
    }

    #[test]
    fn test_handshake() -> Result<()> {
        task::block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let addr = listener.local_addr()?;

            let server = task::spawn(async move {
                let (stream, _) = listener.accept().await?;
                serve_handshake(stream, "vbus").await
            });

            let stream = client(addr, "vbus").await?;
            drop(stream);

            match server.await? {
                HandshakeOutcome::Streaming(_) => {}
                HandshakeOutcome::Rejected => panic!("Expected accepted handshake"),
            }

            Ok(())
        })
    }

    #[test]
    fn test_handshake_wrong_password() -> Result<()> {
        task::block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let addr = listener.local_addr()?;

            let server = task::spawn(async move {
                let (stream, _) = listener.accept().await?;
                serve_handshake(stream, "secret").await
            });

            match client(addr, "vbus").await {
                Err(Error::Auth(line)) => assert!(line.starts_with("-ERROR")),
                other => panic!("Unexpected result {:?}", other),
            }

            drop(server.await?);

            Ok(())
        })
    }

    #[test]
    fn test_handshake_without_greeting() -> Result<()> {
        task::block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let addr = listener.local_addr()?;

            let server = task::spawn(async move {
                let (stream, _) = listener.accept().await?;
                drop(stream);
                Result::Ok(())
            });

            match client(addr, "vbus").await {
                Err(Error::Connect(_)) => {}
                other => panic!("Unexpected result {:?}", other),
            }

            server.await?;

            Ok(())
        })
    }
}
