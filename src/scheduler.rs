use std::time::Duration;

use crate::transport::TransportKind;

/// LAN poll intervals below this keep the connection open.
pub const CONTINUOUS_THRESHOLD: Duration = Duration::from_secs(30);

/// How the receiver is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// A background task keeps the transport connected.
    Continuous,

    /// The host timer runs one-shot cycles.
    Periodic,
}

/// The outcome of the scheduling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// The receiver mode.
    pub mode: RunMode,

    /// Interval the host should call `execute` at.
    pub interval: Duration,
}

/// Decide how to drive the receiver.
///
/// Serial links always run continuously. LAN links run continuously if the
/// device poll interval is below `CONTINUOUS_THRESHOLD` and periodically at
/// that interval otherwise. In continuous mode the host tick falls back to
/// the refresh interval, the ticks are no-ops then.
pub fn schedule(kind: TransportKind, update_interval: Duration, refresh: Duration) -> Schedule {
    match kind {
        TransportKind::Lan if update_interval >= CONTINUOUS_THRESHOLD => Schedule {
            mode: RunMode::Periodic,
            interval: update_interval,
        },
        _ => Schedule {
            mode: RunMode::Continuous,
            interval: refresh,
        },
    }
}
