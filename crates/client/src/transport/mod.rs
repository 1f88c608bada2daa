//! The two ways of hearing about a job: polling and the push channel.
//!
//! Transports never touch job state. They normalise what they receive and
//! hand it to an [`EventSink`]; the sink answers whether they should keep
//! going.

use std::fmt;
use std::ops::ControlFlow;

use jobwatch_types::ProgressUpdate;
use tokio::sync::mpsc;

use crate::error::TrackError;

pub mod poll;
pub mod stream;

pub use poll::{HttpStatusSource, PollTransport, StatusSource};
pub use stream::StreamTransport;

/// What a transport reports upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Update(ProgressUpdate),
    /// Push channel opened.
    Connected,
    /// Transient failure; the transport is retrying on its own.
    Interrupted(TrackError),
    /// The transport gave up and has stopped.
    Fatal(TrackError),
}

/// Receiver of transport events.
///
/// Returning [`ControlFlow::Break`] tells the transport to stop: the job is
/// terminal or the owner no longer listens.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: TransportEvent) -> ControlFlow<()>;
}

impl EventSink for mpsc::UnboundedSender<TransportEvent> {
    fn emit(&self, event: TransportEvent) -> ControlFlow<()> {
        match self.send(event) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Poll,
    Stream,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Poll => "poll",
            Self::Stream => "stream",
        })
    }
}
