//! Error types for connection setup and the message channel.

use std::fmt;
use std::io;

/// Errors surfaced to the host by establishment and `send`.
#[derive(Debug)]
pub enum ChatError {
    /// Role string was neither a listener nor an initiator role.
    InvalidRole(String),
    /// Listener wait aborted by the cancellation hook.
    Cancelled,
    /// Initiator could not resolve or connect to the peer.
    UnreachablePeer {
        addr: String,
        port: u16,
        reason: String,
    },
    /// Operation attempted while the channel is not active.
    NotConnected,
    /// Unexpected I/O failure.
    Socket(io::Error),
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::InvalidRole(role) => write!(
                f,
                "Invalid role '{}': use listener (server) or initiator (client)",
                role
            ),
            ChatError::Cancelled => write!(f, "Waiting for a connection was cancelled"),
            ChatError::UnreachablePeer { addr, port, reason } => write!(
                f,
                "Unable to find or connect to remote computer {}:{}: {}",
                addr, port, reason
            ),
            ChatError::NotConnected => write!(f, "Channel is not connected"),
            ChatError::Socket(e) => write!(f, "Socket error: {}", e),
        }
    }
}

impl std::error::Error for ChatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChatError::Socket(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ChatError {
    fn from(e: io::Error) -> Self {
        ChatError::Socket(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_display_has_context() {
        let err = ChatError::UnreachablePeer {
            addr: "10.0.0.1".to_string(),
            port: 5001,
            reason: "timed out".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("10.0.0.1:5001"));
        assert!(text.contains("timed out"));
    }

    #[test]
    fn test_io_error_converts_to_socket() {
        let err: ChatError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, ChatError::Socket(_)));
        assert!(std::error::Error::source(&err).is_some());
    }
}
