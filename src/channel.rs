//! The message channel: one established connection, a background receive
//! thread, and the sent/received/combined logs.
//!
//! ## Lifecycle
//!
//! ```text
//! Connecting ──establish──▶ Active ──stop / EOF / "/exit" / error──▶ Closed
//! ```
//!
//! The receive thread waits on mio readiness for the stream and for a
//! `Waker` used by `stop()`. It owns the read side and is the only place the
//! connection is shut down. `send` writes on the caller's thread through a
//! second handle to the same socket.

use crate::config::Settings;
use crate::error::ChatError;
use crate::establish::{establish, CancelHook, Role};
use crate::message::{Logs, Message, MessageLog, Origin};
use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Largest chunk returned by a single read; one read is one message.
pub const READ_CHUNK: usize = 1024;

/// Payload a peer sends to ask for the connection to be closed.
pub const EXIT_SENTINEL: &[u8] = b"/exit";

const STREAM_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Where the channel is in its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Connecting = 0,
    Active = 1,
    Closed = 2,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ChannelState::Connecting,
            1 => ChannelState::Active,
            _ => ChannelState::Closed,
        }
    }
}

/// Why the receive thread ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `stop()` was called, or a send failed.
    Stopped,
    /// The peer closed its end (zero-length read).
    PeerClosed,
    /// The peer sent the exit sentinel.
    PeerExit,
    /// A read or poll failed.
    SocketError,
}

/// State shared between the handle and the receive thread.
struct Shared {
    state: AtomicU8,
    stop: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    waker: Waker,
    /// Write half; `None` once the receive thread has closed the connection.
    writer: Mutex<Option<Writer>>,
    received: MessageLog,
    sent: MessageLog,
    combined: MessageLog,
}

impl Shared {
    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn request_stop(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.waker.wake() {
            debug!(error = %e, "Failed to wake receive thread");
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Write half: the caller's handle to the socket plus a poll used to wait
/// for writability when the send buffer is full.
struct Writer {
    stream: TcpStream,
    poll: Poll,
    events: Events,
}

impl Writer {
    fn new(mut stream: TcpStream) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut stream, STREAM_TOKEN, Interest::WRITABLE)?;
        Ok(Self {
            stream,
            poll,
            events: Events::with_capacity(4),
        })
    }

    /// Blocking write of the whole buffer over a non-blocking socket.
    fn write_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.stream.write(buf) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => buf = &buf[n..],
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => self.wait_writable()?,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn wait_writable(&mut self) -> io::Result<()> {
        loop {
            match self.poll.poll(&mut self.events, None) {
                Ok(()) if !self.events.is_empty() => return Ok(()),
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

/// A connected chat endpoint.
///
/// Created already `Active`; the receive thread starts inside the
/// constructor. Single use: once `Closed` it never reconnects.
pub struct Chatbox {
    role: Role,
    addr: String,
    port: u16,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Chatbox {
    /// Establish the connection described by `settings` and start receiving.
    ///
    /// Blocks until connected. A listener consults `cancel` each time an
    /// accept attempt times out.
    pub fn open(
        settings: &Settings,
        logs: Logs,
        cancel: Option<CancelHook>,
    ) -> Result<Self, ChatError> {
        let (stream, _) = establish(settings, cancel)?;
        Self::from_stream(settings, stream, logs)
    }

    /// Take ownership of an already connected stream and start receiving.
    pub fn from_stream(
        settings: &Settings,
        stream: std::net::TcpStream,
        logs: Logs,
    ) -> Result<Self, ChatError> {
        stream.set_nonblocking(true)?;
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;

        let mut reader = TcpStream::from_std(stream.try_clone()?);
        let writer = Writer::new(TcpStream::from_std(stream))?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut reader, STREAM_TOKEN, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let shared = Arc::new(Shared {
            state: AtomicU8::new(ChannelState::Connecting as u8),
            stop: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            waker,
            writer: Mutex::new(Some(writer)),
            received: logs.received,
            sent: logs.sent,
            combined: MessageLog::new(),
        });

        let receiver = Receiver {
            stream: reader,
            poll,
            shared: Arc::clone(&shared),
            origin: Origin::Remote(peer_addr.ip().to_string()),
        };

        shared.set_state(ChannelState::Active);
        let handle = thread::Builder::new()
            .name(settings.role.thread_name().to_string())
            .spawn(move || receiver.run())?;

        info!(
            role = %settings.role,
            peer = %peer_addr,
            local = %local_addr,
            "Listening for messages"
        );

        Ok(Self {
            role: settings.role,
            addr: settings.addr.clone(),
            port: settings.port,
            peer_addr,
            local_addr,
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Write `message` to the peer and record it as sent.
    ///
    /// Blocks until the bytes are handed to the kernel. A write error stops
    /// the channel.
    pub fn send(&self, message: impl AsRef<[u8]>) -> Result<(), ChatError> {
        if !self.is_active() {
            return Err(ChatError::NotConnected);
        }

        let payload = Bytes::copy_from_slice(message.as_ref());
        let mut guard = lock(&self.shared.writer);
        let writer = match guard.as_mut() {
            Some(writer) if self.is_active() => writer,
            _ => return Err(ChatError::NotConnected),
        };

        if let Err(e) = writer.write_all(&payload) {
            warn!(error = %e, "Send failed, closing connection");
            self.shared.request_stop();
            return Err(ChatError::Socket(e));
        }

        debug!(bytes = payload.len(), "Sent message");
        self.shared
            .sent
            .push_with(&self.shared.combined, Message::new(payload, Origin::Local));
        Ok(())
    }

    /// Ask the receive thread to end. Returns immediately; safe to repeat.
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    /// Wait for the receive thread to end and return why it ended.
    pub fn join(&self) -> Option<CloseReason> {
        let handle = lock(&self.handle).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Receive thread panicked");
            }
        }
        self.close_reason()
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ChannelState::Active
    }

    /// Set once the channel is `Closed`.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *lock(&self.shared.close_reason)
    }

    /// Every sent and received message in arrival order.
    pub fn messages(&self) -> Vec<Message> {
        self.shared.combined.snapshot()
    }

    pub fn received_messages(&self) -> Vec<Message> {
        self.shared.received.snapshot()
    }

    pub fn sent_messages(&self) -> Vec<Message> {
        self.shared.sent.snapshot()
    }

    /// Return the received messages and leave the received log empty.
    ///
    /// Serialized with the receive thread's appends, so no message is lost
    /// or returned twice across calls. The combined log is untouched.
    pub fn take_received_messages(&self) -> Vec<Message> {
        self.shared.received.take()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Configured address: bind address for a listener, peer for an initiator.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for Chatbox {
    fn drop(&mut self) {
        self.shared.request_stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Background receive loop. Owns the read side of the connection.
struct Receiver {
    stream: TcpStream,
    poll: Poll,
    shared: Arc<Shared>,
    origin: Origin,
}

impl Receiver {
    fn run(mut self) {
        let reason = self.receive();

        self.shared.set_state(ChannelState::Closed);
        *lock(&self.shared.close_reason) = Some(reason);

        info!(reason = ?reason, "Closing connection");
        if let Err(e) = self.poll.registry().deregister(&mut self.stream) {
            debug!(error = %e, "Deregister failed");
        }
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!(error = %e, "Shutdown failed");
        }

        // The shutdown wakes a send blocked on writability, which then
        // releases the lock; dropping the write half closes its descriptor.
        drop(lock(&self.shared.writer).take());
    }

    fn receive(&mut self) -> CloseReason {
        let mut events = Events::with_capacity(8);
        let mut buf = [0u8; READ_CHUNK];

        loop {
            if self.shared.stop_requested() {
                return CloseReason::Stopped;
            }

            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Poll failed");
                    return CloseReason::SocketError;
                }
            }

            for event in events.iter() {
                if event.token() == STREAM_TOKEN {
                    if let Some(reason) = self.drain(&mut buf) {
                        return reason;
                    }
                }
            }
        }
    }

    /// Read until the socket would block. Each read becomes one message.
    fn drain(&mut self, buf: &mut [u8]) -> Option<CloseReason> {
        loop {
            if self.shared.stop_requested() {
                return Some(CloseReason::Stopped);
            }

            match self.stream.read(buf) {
                Ok(0) => {
                    info!("The other side closed the connection");
                    return Some(CloseReason::PeerClosed);
                }
                Ok(n) if &buf[..n] == EXIT_SENTINEL => {
                    info!("The other side asked to close the connection");
                    return Some(CloseReason::PeerExit);
                }
                Ok(n) => {
                    debug!(bytes = n, origin = %self.origin, "Received message");
                    let message = Message::new(Bytes::copy_from_slice(&buf[..n]), self.origin.clone());
                    self.shared
                        .received
                        .push_with(&self.shared.combined, message);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "Socket error");
                    return Some(CloseReason::SocketError);
                }
            }
        }
    }
}
