use std::{
    cmp::min,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use async_std::task::{self, JoinHandle};

use futures::future;

use log::{debug, info, trace, warn};

use crate::{
    error::{Error, Result},
    frame_decoder::FrameDecoder,
    transport::{DisconnectHandle, Transport, TransportKind},
    update_dispatcher::PacketListener,
};

/// Timeouts and backoff limits of a `Receiver`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverOptions {
    /// Upper bound for a single `read_chunk` call.
    pub read_timeout: Duration,

    /// Upper bound for a whole one-shot cycle after connecting.
    pub one_shot_timeout: Duration,

    /// First reconnect delay in continuous mode.
    pub min_backoff: Duration,

    /// The reconnect delay doubles up to this value.
    pub max_backoff: Duration,
}

impl Default for ReceiverOptions {
    fn default() -> ReceiverOptions {
        ReceiverOptions {
            read_timeout: Duration::from_secs(5),
            one_shot_timeout: Duration::from_secs(20),
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Reads from a `Transport`, decodes the bytes and hands every packet to a
/// `PacketListener`.
///
/// A receiver either runs one-shot cycles (`run_once`) or is moved into a
/// background task that keeps the link open (`spawn`).
pub struct Receiver {
    transport: Box<dyn Transport>,
    listener: Arc<dyn PacketListener>,
    options: ReceiverOptions,
    decoder: FrameDecoder,
}

impl Receiver {
    /// Create a new receiver.
    pub fn new(
        transport: Box<dyn Transport>,
        listener: Arc<dyn PacketListener>,
        options: ReceiverOptions,
    ) -> Receiver {
        Receiver {
            transport,
            listener,
            options,
            decoder: FrameDecoder::new(),
        }
    }

    /// The kind of the underlying transport.
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// A handle to interrupt the receiver's transport from another task.
    pub fn disconnect_handle(&self) -> DisconnectHandle {
        self.transport.disconnect_handle()
    }

    fn feed(&mut self, chunk: &[u8]) -> usize {
        self.decoder.extend_from_slice(chunk);

        let packets = self.decoder.drain_packets();
        for packet in &packets {
            trace!("Received packet {}", packet.id_string());
            self.listener.on_packet(packet);
        }
        packets.len()
    }

    /// Connect, wait for the first read that yields packets, disconnect.
    ///
    /// Returns the number of packets handed to the listener, `0` if none
    /// arrived within the one-shot timeout.
    pub async fn run_once(&mut self) -> Result<usize> {
        self.decoder.clear();

        self.transport.connect().await?;

        let result = self.collect_once().await;

        self.transport.disconnect().await;
        self.decoder.clear();

        result
    }

    async fn collect_once(&mut self) -> Result<usize> {
        let deadline = Instant::now() + self.options.one_shot_timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                debug!("No packets received within {:?}", self.options.one_shot_timeout);
                return Ok(0);
            }

            let timeout = min(deadline - now, self.options.read_timeout);
            let chunk = self.transport.read_chunk(timeout).await?;
            if chunk.is_empty() {
                continue;
            }

            let count = self.feed(&chunk);
            if count > 0 {
                return Ok(count);
            }
        }
    }

    async fn read_until_error(&mut self) -> Error {
        loop {
            match self.transport.read_chunk(self.options.read_timeout).await {
                Ok(chunk) => {
                    if !chunk.is_empty() {
                        self.feed(&chunk);
                    }
                }
                Err(err) => break err,
            }
        }
    }

    async fn run_continuous(&mut self) {
        let handle = self.transport.disconnect_handle();
        let mut backoff = self.options.min_backoff;

        while !handle.is_disconnected() {
            match self.transport.connect().await {
                Ok(()) => {
                    backoff = self.options.min_backoff;

                    let err = self.read_until_error().await;
                    self.transport.disconnect().await;
                    self.decoder.clear();

                    if !err.is_transport_error() {
                        debug!("Receiver stopping: {}", err);
                        break;
                    }
                    warn!("Connection lost: {}", err);
                }
                Err(err) if err.is_transport_error() => warn!("Unable to connect: {}", err),
                Err(err) => {
                    debug!("Receiver stopping: {}", err);
                    break;
                }
            }

            debug!("Reconnecting in {:?}", backoff);

            // Waits for the backoff unless the handle fires first.
            let waited = handle
                .run(backoff, future::pending::<Result<()>>())
                .await;
            if waited.is_err() {
                break;
            }

            backoff = min(backoff * 2, self.options.max_backoff);
        }

        self.transport.disconnect().await;
        self.decoder.clear();
    }

    /// Move the receiver into a background task running in continuous mode.
    pub fn spawn(mut self) -> ReceiverHandle {
        let disconnect = self.transport.disconnect_handle();

        info!("Starting continuous receiver on {:?} transport", self.kind());

        let task = task::spawn(async move {
            self.run_continuous().await;
            debug!("Continuous receiver finished");
        });

        ReceiverHandle {
            disconnect,
            task: Some(task),
        }
    }
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("transport", &self.transport)
            .field("options", &self.options)
            .field("decoder", &self.decoder)
            .finish()
    }
}

/// Controls a receiver running in continuous mode.
///
/// Dropping the handle interrupts the receiver without waiting for it.
#[derive(Debug)]
pub struct ReceiverHandle {
    disconnect: DisconnectHandle,
    task: Option<JoinHandle<()>>,
}

impl ReceiverHandle {
    /// Whether the receiver has not been stopped yet.
    pub fn is_running(&self) -> bool {
        self.task.is_some() && !self.disconnect.is_disconnected()
    }

    /// Stop the receiver and wait until its transport is disconnected.
    ///
    /// Stopping an already stopped receiver does nothing.
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            self.disconnect.disconnect();
            task.await;
            info!("Stopped continuous receiver");
        }
    }
}

impl Drop for ReceiverHandle {
    fn drop(&mut self) {
        self.disconnect.disconnect();
    }
}
