//! Messages and the shared, append-only message logs.
//!
//! A `MessageLog` is a cloneable handle around a lock-guarded vector, so a
//! host can hold one end while the channel appends to the other.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Where a message came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Sent by this endpoint.
    Local,
    /// Received from the given remote address.
    Remote(String),
}

impl Origin {
    pub fn is_local(&self) -> bool {
        matches!(self, Origin::Local)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Local => write!(f, "local"),
            Origin::Remote(addr) => write!(f, "{}", addr),
        }
    }
}

/// A single chunk of text exchanged over the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Raw bytes as written or as returned by one read.
    pub payload: Bytes,
    pub origin: Origin,
    /// When the message was sent or received.
    pub at: DateTime<Utc>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>, origin: Origin) -> Self {
        Self {
            payload: payload.into(),
            origin,
            at: Utc::now(),
        }
    }

    /// Payload decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Shared, append-only sequence of messages in arrival order.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    inner: Arc<Mutex<Vec<Message>>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Message>> {
        // A panic while holding the lock cannot leave a Vec half-pushed.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, message: Message) {
        self.lock().push(message);
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<Message> {
        self.lock().clone()
    }

    /// Swap the contents for an empty vector and return what was there.
    pub fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Append to `self` and to `combined` so both observe the same order.
    ///
    /// The combined lock is taken first and held across both pushes; every
    /// caller uses that order.
    pub(crate) fn push_with(&self, combined: &MessageLog, message: Message) {
        let mut all = combined.lock();
        self.lock().push(message.clone());
        all.push(message);
    }
}

/// The pair of logs a host may share with a channel.
#[derive(Debug, Clone, Default)]
pub struct Logs {
    pub received: MessageLog,
    pub sent: MessageLog,
}

impl Logs {
    /// Fresh, unshared logs.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_snapshot() {
        let log = MessageLog::new();
        log.push(Message::new("a", Origin::Local));
        log.push(Message::new("b", Origin::Remote("10.0.0.2".into())));

        let items = log.snapshot();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].text(), "a");
        assert_eq!(items[1].origin.to_string(), "10.0.0.2");
    }

    #[test]
    fn test_take_leaves_empty_log() {
        let log = MessageLog::new();
        log.push(Message::new("one", Origin::Local));

        let old = log.take();
        assert_eq!(old.len(), 1);
        assert!(log.is_empty());
        assert!(log.take().is_empty());
    }

    #[test]
    fn test_clones_share_storage() {
        let log = MessageLog::new();
        let handle = log.clone();
        log.push(Message::new("x", Origin::Local));
        assert_eq!(handle.len(), 1);
    }

    #[test]
    fn test_default_logs_are_not_shared() {
        let a = Logs::new();
        let b = Logs::new();
        a.received.push(Message::new("x", Origin::Local));
        assert!(b.received.is_empty());
    }

    #[test]
    fn test_push_with_keeps_combined_in_sync() {
        let combined = MessageLog::new();
        let sent = MessageLog::new();
        let received = MessageLog::new();

        sent.push_with(&combined, Message::new("s1", Origin::Local));
        received.push_with(&combined, Message::new("r1", Origin::Remote("peer".into())));
        sent.push_with(&combined, Message::new("s2", Origin::Local));

        let texts: Vec<String> = combined.snapshot().iter().map(Message::text).collect();
        assert_eq!(texts, vec!["s1", "r1", "s2"]);
        assert_eq!(sent.len(), 2);

        received.take();
        assert_eq!(combined.len(), 3);
    }

    #[test]
    fn test_lossy_text() {
        let msg = Message::new(vec![b'h', 0xff, b'i'], Origin::Local);
        assert_eq!(msg.text(), "h\u{fffd}i");
        assert_eq!(Origin::Local.to_string(), "local");
    }
}
