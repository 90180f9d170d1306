use std::io;

use rdma::fabric::{CmEventKind, WcOpcode, WcStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{op} failed: {source}")]
    Provider {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("Invalid address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: String },
    #[error("Unexpected event {event} in state {state}")]
    UnexpectedEvent {
        state: &'static str,
        event: CmEventKind,
    },
    #[error("Connection ended in state {0} without being established")]
    NotConnected(&'static str),
    #[error("Next completion should be {expected}, got {opcode:?} for wr_id {wr_id}")]
    UnexpectedCompletion {
        expected: &'static str,
        opcode: WcOpcode,
        wr_id: u64,
    },
    #[error("Expected 1 send and 1 receive completion, got {sends} send(s) and {recvs} receive(s)")]
    CompletionTally { sends: usize, recvs: usize },
    #[error("Failed status {status} for wr_id {wr_id}")]
    CompletionFailed { status: WcStatus, wr_id: u64 },
    #[error("Can't handle more than one device context")]
    ContextConflict,
    #[error("{0} requires the shared context to be set up")]
    NoContext(&'static str),
    #[error("{0} requires a queue pair")]
    NoQueuePair(&'static str),
    #[error("The endpoint already has a queue pair")]
    QueuePairExists,
    #[error("The endpoint has been destroyed")]
    Destroyed,
    #[error("Size {size} exceeds the capacity {capacity}")]
    SizeOverflow { size: usize, capacity: usize },
    #[error("{0} signaled work request(s) still in flight")]
    InFlight(usize),
    #[error("Malformed remote region descriptor ({0} bytes)")]
    MalformedRegion(usize),
    #[error("Invalid config: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The operating system error behind this error, if any.
    pub fn os_error(&self) -> Option<&io::Error> {
        match self {
            Error::Provider { source, .. } => Some(source),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

pub(crate) trait ProviderResultExt<T> {
    /// Names the provider call a failure comes from.
    fn op(self, op: &'static str) -> Result<T>;
}

impl<T> ProviderResultExt<T> for io::Result<T> {
    #[inline]
    fn op(self, op: &'static str) -> Result<T> {
        self.map_err(|source| Error::Provider { op, source })
    }
}
