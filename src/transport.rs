use std::{fmt::Debug, future::Future, time::Duration};

use async_std::channel::{self, Receiver, Sender};

use async_trait::async_trait;

use futures::{
    future::{select, Either},
    pin_mut,
};

use crate::error::{Error, Result};

/// Which kind of link a transport uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// VBus-over-TCP, e.g. a DL2 / DL3 datalogger or a VBus/LAN adapter.
    Lan,

    /// A serial line, e.g. a VBus/USB adapter.
    Serial,
}

/// A cloneable handle that interrupts a transport from another task.
///
/// Interrupting is final: every pending and future operation of the
/// transport owning this handle fails with `Error::Cancelled`.
#[derive(Debug, Clone)]
pub struct DisconnectHandle {
    sender: Sender<()>,
    receiver: Receiver<()>,
}

impl DisconnectHandle {
    /// Create a new, not yet triggered handle.
    pub fn new() -> DisconnectHandle {
        let (sender, receiver) = channel::bounded(1);
        DisconnectHandle { sender, receiver }
    }

    /// Interrupt the transport. Calling this more than once is harmless.
    pub fn disconnect(&self) {
        self.sender.close();
    }

    /// Whether `disconnect` has been called.
    pub fn is_disconnected(&self) -> bool {
        self.sender.is_closed()
    }

    /// Resolve once `disconnect` has been called.
    pub async fn disconnected(&self) {
        // Nothing is ever sent, so this only returns once the channel is closed.
        while self.receiver.recv().await.is_ok() {}
    }

    /// Run `future` bounded by `timeout`, aborting with `Error::Cancelled`
    /// when `disconnect` is called in the meantime.
    ///
    /// Returns `Ok(None)` if the timeout elapsed.
    pub async fn run<F, T>(&self, timeout: Duration, future: F) -> Result<Option<T>>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_disconnected() {
            return Err(Error::Cancelled);
        }

        let bounded = async_std::future::timeout(timeout, future);
        let cancelled = self.disconnected();
        pin_mut!(bounded, cancelled);

        match select(bounded, cancelled).await {
            Either::Left((Ok(result), _)) => result.map(Some),
            Either::Left((Err(_), _)) => Ok(None),
            Either::Right(_) => Err(Error::Cancelled),
        }
    }
}

impl Default for DisconnectHandle {
    fn default() -> DisconnectHandle {
        DisconnectHandle::new()
    }
}

/// A source of raw VBus bytes.
///
/// Implementations exist for VBus-over-TCP (`LanTransport`) and serial lines
/// (`SerialTransport`). All blocking operations are bounded by timeouts and
/// return `Error::Cancelled` promptly once the `DisconnectHandle` fires.
#[async_trait]
pub trait Transport: Debug + Send {
    /// The kind of link.
    fn kind(&self) -> TransportKind;

    /// A handle to interrupt this transport from another task.
    fn disconnect_handle(&self) -> DisconnectHandle;

    /// Establish the link.
    async fn connect(&mut self) -> Result<()>;

    /// Wait up to `timeout` for bytes. An elapsed timeout returns an empty chunk.
    async fn read_chunk(&mut self, timeout: Duration) -> Result<Vec<u8>>;

    /// Close the link. Does nothing if not connected.
    async fn disconnect(&mut self);

    /// Whether the link is currently established.
    fn is_connected(&self) -> bool;
}
