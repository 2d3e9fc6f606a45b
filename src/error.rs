use thiserror::Error as ThisError;

/// A common error type.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The transport could not be established, e.g. an unreachable host or a busy port.
    #[error("unable to connect: {0}")]
    Connect(String),

    /// The VBus-over-TCP service rejected the password.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The transport dropped while reading.
    #[error("read failed: {0}")]
    Read(String),

    /// A pending operation was interrupted by a disconnect request.
    #[error("operation cancelled by disconnect")]
    Cancelled,

    /// The device definition could not be resolved or parsed.
    #[error("unable to load device definition: {0}")]
    ConfigLoad(String),

    /// The host configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No packet specification matches the packet's addresses.
    #[error("no packet specification for source 0x{source_address:04X} / destination 0x{destination_address:04X}")]
    NoMatchingPacketSpec {
        /// Source address of the unmatched packet.
        source_address: u16,
        /// Destination address of the unmatched packet.
        destination_address: u16,
    },

    /// A binding references a field name the packet specification does not know.
    #[error("no field named {0:?} in packet specification")]
    UnknownField(String),

    /// The operation is not allowed in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// A common result type.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(other: std::io::Error) -> Error {
        Error::Read(other.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(other: std::net::AddrParseError) -> Error {
        Error::Config(other.to_string())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(other: std::str::Utf8Error) -> Error {
        Error::Read(other.to_string())
    }
}

impl From<async_std::future::TimeoutError> for Error {
    fn from(other: async_std::future::TimeoutError) -> Error {
        Error::Read(other.to_string())
    }
}

impl From<serialport::Error> for Error {
    fn from(other: serialport::Error) -> Error {
        Error::Connect(other.to_string())
    }
}

impl From<quick_xml::DeError> for Error {
    fn from(other: quick_xml::DeError) -> Error {
        Error::ConfigLoad(other.to_string())
    }
}

impl Error {
    /// Whether this error stems from the transport layer and warrants a reconnect.
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Error::Connect(_) | Error::Auth(_) | Error::Read(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::NoMatchingPacketSpec {
            source_address: 0x7321,
            destination_address: 0x0010,
        };
        assert_eq!(
            "no packet specification for source 0x7321 / destination 0x0010",
            err.to_string()
        );

        let err: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(err.is_transport_error());
        assert!(!Error::Cancelled.is_transport_error());
    }
}
