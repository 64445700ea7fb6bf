//! Categorised error/debug reporting.
//!
//! The core performs no I/O of its own when something goes wrong; every
//! recoverable condition is surfaced through the handlers registered here
//! and the node keeps running. Handlers are observational only.

/// Everything the protocol can report, errors and notable events alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    CrcError,
    FrameError,
    BufferOverflow,
    UnknownNode,
    NodeAdded,
    NodeRemoved,
    NodeTimeout,
    NetworkTimeout,
    InvalidRequest,
    ProtocolViolation,
    ProtocolError,
    OperationError,
    OperationTimeout,
    InvalidFunction,
    InvalidAddress,
    SlaveDeviceFailure,
    TokenPass,
    TokenReclaim,
    StateChange,
}

/// Coarse grouping used for debug-sink routing and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    Communication,
    Membership,
    Protocol,
    Token,
    State,
}

impl ErrorKind {
    pub fn category(&self) -> EventCategory {
        match self {
            Self::Timeout | Self::CrcError | Self::FrameError | Self::BufferOverflow => {
                EventCategory::Communication
            }
            Self::UnknownNode
            | Self::NodeAdded
            | Self::NodeRemoved
            | Self::NodeTimeout
            | Self::NetworkTimeout => EventCategory::Membership,
            Self::InvalidRequest
            | Self::ProtocolViolation
            | Self::ProtocolError
            | Self::OperationError
            | Self::OperationTimeout
            | Self::InvalidFunction
            | Self::InvalidAddress
            | Self::SlaveDeviceFailure => EventCategory::Protocol,
            Self::TokenPass | Self::TokenReclaim => EventCategory::Token,
            Self::StateChange => EventCategory::State,
        }
    }

    /// Membership notifications, token movement and state changes are
    /// informational; everything else counts against the error statistics.
    pub fn is_error(&self) -> bool {
        !matches!(
            self,
            Self::NodeAdded
                | Self::NodeRemoved
                | Self::TokenPass
                | Self::TokenReclaim
                | Self::StateChange
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Timeout => "TIMEOUT",
            Self::CrcError => "CRC_ERROR",
            Self::FrameError => "FRAME_ERROR",
            Self::BufferOverflow => "BUFFER_OVERFLOW",
            Self::UnknownNode => "UNKNOWN_NODE",
            Self::NodeAdded => "NODE_ADDED",
            Self::NodeRemoved => "NODE_REMOVED",
            Self::NodeTimeout => "NODE_TIMEOUT",
            Self::NetworkTimeout => "NETWORK_TIMEOUT",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::ProtocolViolation => "PROTOCOL_VIOLATION",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::OperationError => "OPERATION_ERROR",
            Self::OperationTimeout => "OPERATION_TIMEOUT",
            Self::InvalidFunction => "INVALID_FUNCTION",
            Self::InvalidAddress => "INVALID_ADDRESS",
            Self::SlaveDeviceFailure => "SLAVE_DEVICE_FAILURE",
            Self::TokenPass => "TOKEN_PASS",
            Self::TokenReclaim => "TOKEN_RECLAIM",
            Self::StateChange => "STATE_CHANGE",
        };
        write!(f, "{}", name)
    }
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Communication => "communication",
            Self::Membership => "membership",
            Self::Protocol => "protocol",
            Self::Token => "token",
            Self::State => "state",
        };
        write!(f, "{}", name)
    }
}

pub type ErrorHandler = Box<dyn FnMut(ErrorKind, &str) + Send>;
pub type DebugHandler = Box<dyn FnMut(EventCategory, &str) + Send>;

/// Running traffic and error counters, readable by the host.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EventStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
}

/// Fan-out point for everything the core wants the host to see.
#[derive(Default)]
pub struct EventSink {
    error_handler: Option<ErrorHandler>,
    debug_handler: Option<DebugHandler>,
    stats: EventStats,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_error(&mut self, handler: ErrorHandler) {
        self.error_handler = Some(handler);
    }

    pub fn on_debug(&mut self, handler: DebugHandler) {
        self.debug_handler = Some(handler);
    }

    pub fn report(&mut self, kind: ErrorKind, message: &str) {
        if kind.is_error() {
            self.stats.errors += 1;
        }
        if let Some(handler) = self.error_handler.as_mut() {
            handler(kind, message);
        }
    }

    pub fn debug(&mut self, category: EventCategory, message: &str) {
        if let Some(handler) = self.debug_handler.as_mut() {
            handler(category, message);
        }
    }

    pub fn count_frame_sent(&mut self) {
        self.stats.frames_sent += 1;
    }

    pub fn count_frame_received(&mut self) {
        self.stats.frames_received += 1;
    }

    pub fn count_request_sent(&mut self) {
        self.stats.requests_sent += 1;
    }

    pub fn count_response_received(&mut self) {
        self.stats.responses_received += 1;
    }

    pub fn stats(&self) -> EventStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = EventStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn categories_cover_all_kinds() {
        assert_eq!(ErrorKind::CrcError.category(), EventCategory::Communication);
        assert_eq!(ErrorKind::NodeRemoved.category(), EventCategory::Membership);
        assert_eq!(
            ErrorKind::InvalidAddress.category(),
            EventCategory::Protocol
        );
        assert_eq!(ErrorKind::TokenReclaim.category(), EventCategory::Token);
        assert_eq!(ErrorKind::StateChange.category(), EventCategory::State);
    }

    #[test]
    fn only_true_errors_bump_the_counter() {
        let mut sink = EventSink::new();
        sink.report(ErrorKind::NodeAdded, "node 4");
        sink.report(ErrorKind::StateChange, "IDLE");
        assert_eq!(sink.stats().errors, 0);

        sink.report(ErrorKind::CrcError, "bad frame");
        assert_eq!(sink.stats().errors, 1);
    }

    #[test]
    fn handlers_receive_reports() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);

        let mut sink = EventSink::new();
        sink.on_error(Box::new(move |kind, _| {
            if kind == ErrorKind::Timeout {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }
        }));

        sink.report(ErrorKind::Timeout, "op 3");
        sink.report(ErrorKind::NodeAdded, "node 9");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
