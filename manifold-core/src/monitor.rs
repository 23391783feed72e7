//! Socket event monitoring.
//!
//! Provides event streams for tracking socket lifecycle events like
//! listening, dialing, pipe attachment and close.

use crate::endpoint::EndpointId;
use crate::pipe::PipeId;
use parking_lot::Mutex;
use std::fmt;

/// Socket lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Listener is bound and accepting.
    Listening { endpoint: EndpointId, url: String },

    /// Dialer established a connection.
    Dialed { endpoint: EndpointId, url: String },

    /// Connection attempt failed; the dialer will retry.
    ConnectFailed {
        endpoint: EndpointId,
        url: String,
        reason: String,
    },

    /// Listener accepted an incoming connection.
    Accepted { endpoint: EndpointId, url: String },

    /// Pipe was attached to the socket and handed to its protocol.
    PipeAdded {
        pipe: PipeId,
        endpoint: Option<EndpointId>,
    },

    /// Pipe was detached from the socket.
    PipeRemoved { pipe: PipeId },

    /// Socket finished closing. Always the last event.
    Closed,
}

impl fmt::Display for SocketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listening { url, .. } => write!(f, "Listening on {url}"),
            Self::Dialed { url, .. } => write!(f, "Connected to {url}"),
            Self::ConnectFailed { url, reason, .. } => {
                write!(f, "Connect failed for {url}: {reason}")
            }
            Self::Accepted { url, .. } => write!(f, "Accepted connection on {url}"),
            Self::PipeAdded { pipe, .. } => write!(f, "Pipe {pipe} added"),
            Self::PipeRemoved { pipe } => write!(f, "Pipe {pipe} removed"),
            Self::Closed => write!(f, "Socket closed"),
        }
    }
}

/// Handle for receiving socket events.
pub type SocketMonitor = flume::Receiver<SocketEvent>;

/// Sender half of a monitor channel.
pub type SocketEventSender = flume::Sender<SocketEvent>;

/// Creates a new monitoring channel pair.
#[must_use]
pub fn create_monitor() -> (SocketEventSender, SocketMonitor) {
    flume::unbounded()
}

/// Fan-out of socket events to every live monitor.
#[derive(Default)]
pub(crate) struct MonitorHub {
    senders: Mutex<Vec<SocketEventSender>>,
}

impl MonitorHub {
    pub(crate) fn subscribe(&self) -> SocketMonitor {
        let (tx, rx) = create_monitor();
        self.senders.lock().push(tx);
        rx
    }

    /// Deliver `event`; monitors whose receiver was dropped are forgotten.
    pub(crate) fn emit(&self, event: SocketEvent) {
        let mut senders = self.senders.lock();
        if senders.is_empty() {
            return;
        }
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Drop every sender so receivers observe disconnection.
    pub(crate) fn shutdown(&self) {
        self.senders.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_event_display() {
        let event = SocketEvent::Dialed {
            endpoint: EndpointId::from_raw(1),
            url: "tcp://127.0.0.1:5555".into(),
        };
        assert_eq!(event.to_string(), "Connected to tcp://127.0.0.1:5555");
    }

    #[test]
    fn test_hub_drops_dead_monitors() {
        let hub = MonitorHub::default();
        let live = hub.subscribe();
        drop(hub.subscribe());
        hub.emit(SocketEvent::Closed);
        assert_eq!(live.recv().unwrap(), SocketEvent::Closed);
        assert_eq!(hub.senders.lock().len(), 1);
        hub.shutdown();
        assert!(live.recv().is_err());
    }
}
