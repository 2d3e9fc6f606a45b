use std::{
    cmp::min,
    io::{ErrorKind, Read},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use async_std::{
    future,
    task::{self, JoinHandle},
};

use async_trait::async_trait;

use log::{debug, info, warn};

use serialport::SerialPort;

use crate::{
    error::{Error, Result},
    transport::{DisconnectHandle, Transport, TransportKind},
};

/// Bit rate of the VBus serial interface.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

const READ_BUFFER_LEN: usize = 1024;

/// Longest single blocking read, bounds how long closing the port can take.
const READ_SLICE: Duration = Duration::from_millis(100);

/// How long `disconnect` waits for a blocking read that ignores its timeout.
const STUCK_READ_GRACE: Duration = Duration::from_secs(1);

type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

/// Receives VBus data from a serial line, e.g. a VBus/USB adapter.
///
/// Port I/O is blocking, so it runs on `async_std`'s blocking thread pool in
/// short slices. A read interrupted by the `DisconnectHandle` returns
/// `Error::Cancelled` right away, and `disconnect` waits for the in-flight
/// slice so the port is closed once it returns.
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    port: Option<SharedPort>,
    reading: Option<JoinHandle<Result<Vec<u8>>>>,
    closing: Arc<AtomicBool>,
    handle: DisconnectHandle,
}

impl SerialTransport {
    /// Create a transport for the serial port at `path`.
    pub fn new(path: &str, baud_rate: u32) -> SerialTransport {
        SerialTransport {
            path: path.to_string(),
            baud_rate,
            port: None,
            reading: None,
            closing: Arc::new(AtomicBool::new(false)),
            handle: DisconnectHandle::new(),
        }
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("path", &self.path)
            .field("baud_rate", &self.baud_rate)
            .field("connected", &self.port.is_some())
            .finish()
    }
}

fn read_port(port: &SharedPort, closing: &AtomicBool, timeout: Duration) -> Result<Vec<u8>> {
    let mut port = match port.lock() {
        Ok(port) => port,
        Err(poisoned) => poisoned.into_inner(),
    };

    let deadline = Instant::now() + timeout;
    let mut buf = vec![0u8; READ_BUFFER_LEN];
    loop {
        if closing.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(Vec::new());
        }

        port.set_timeout(min(deadline - now, READ_SLICE))
            .map_err(|err| Error::Read(err.to_string()))?;

        match port.read(&mut buf) {
            Ok(len) => {
                buf.truncate(len);
                return Ok(buf);
            }
            Err(ref err) if err.kind() == ErrorKind::TimedOut => {}
            Err(err) => return Err(Error::Read(err.to_string())),
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn disconnect_handle(&self) -> DisconnectHandle {
        self.handle.clone()
    }

    async fn connect(&mut self) -> Result<()> {
        self.disconnect().await;

        if self.handle.is_disconnected() {
            return Err(Error::Cancelled);
        }

        debug!("Opening serial port {} at {} baud...", self.path, self.baud_rate);

        let path = self.path.clone();
        let baud_rate = self.baud_rate;
        let port = task::spawn_blocking(move || {
            serialport::new(&path, baud_rate)
                .timeout(Duration::from_millis(500))
                .open()
        })
        .await
        .map_err(|err| Error::Connect(format!("{}: {}", self.path, err)))?;

        info!("Opened serial port {}", self.path);
        self.port = Some(Arc::new(Mutex::new(port)));
        Ok(())
    }

    async fn read_chunk(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        // A read left over from an elapsed timeout is picked up again.
        let mut reading = match self.reading.take() {
            Some(reading) => reading,
            None => {
                let port = match self.port {
                    Some(ref port) => port.clone(),
                    None => return Err(Error::Read("Not connected".into())),
                };
                let closing = self.closing.clone();
                task::spawn_blocking(move || read_port(&port, &closing, timeout))
            }
        };

        // The blocking read honours `timeout` itself, the extra second only catches a stuck driver.
        let result = self
            .handle
            .run(timeout + Duration::from_secs(1), async {
                Ok::<_, Error>((&mut reading).await)
            })
            .await;

        match result {
            Ok(Some(Ok(chunk))) => Ok(chunk),
            Ok(Some(Err(err))) => {
                self.disconnect().await;
                Err(err)
            }
            Ok(None) => {
                self.reading = Some(reading);
                Ok(Vec::new())
            }
            Err(err) => {
                self.reading = Some(reading);
                self.disconnect().await;
                Err(err)
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(reading) = self.reading.take() {
            self.closing.store(true, Ordering::SeqCst);
            if future::timeout(STUCK_READ_GRACE, reading).await.is_err() {
                warn!("Serial read on {} did not finish, closing anyway", self.path);
            }
            self.closing.store(false, Ordering::SeqCst);
        }

        if self.port.take().is_some() {
            debug!("Closing serial port {}", self.path);
        }
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }
}
