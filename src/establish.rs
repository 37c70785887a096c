//! Connection setup for both ends of a chat.
//!
//! The listener binds, then waits for exactly one peer in a loop bounded by
//! the accept timeout so a host-supplied hook can cancel the wait. The
//! initiator connects once, falling back to host name resolution when the
//! address is not a literal IP.

use crate::config::Settings;
use crate::error::ChatError;
use mio::{Events, Interest, Poll, Token};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, trace};

const LISTENER_TOKEN: Token = Token(0);

/// Polled while the listener waits; returning `true` cancels the wait.
pub type CancelHook = Box<dyn FnMut() -> bool + Send>;

/// Which side of the connection this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Waits for the peer to connect.
    Listener,
    /// Connects to a waiting peer.
    Initiator,
}

impl Role {
    /// Name given to the background receive thread.
    pub fn thread_name(&self) -> &'static str {
        match self {
            Role::Listener => "chat-listener",
            Role::Initiator => "chat-initiator",
        }
    }
}

impl FromStr for Role {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "listener" | "server" => Ok(Role::Listener),
            "initiator" | "client" => Ok(Role::Initiator),
            _ => Err(ChatError::InvalidRole(s.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Listener => write!(f, "listener"),
            Role::Initiator => write!(f, "initiator"),
        }
    }
}

/// Produce a connected stream for the configured role.
///
/// The hook is only consulted by the listener.
pub fn establish(
    settings: &Settings,
    cancel: Option<CancelHook>,
) -> Result<(TcpStream, SocketAddr), ChatError> {
    match settings.role {
        Role::Listener => {
            let listener = Listener::bind(&settings.addr, settings.port)?;
            listener.accept(settings.accept_timeout, cancel)
        }
        Role::Initiator => connect(&settings.addr, settings.port, settings.connect_timeout),
    }
}

/// A bound listening socket waiting for a single peer.
pub struct Listener {
    inner: mio::net::TcpListener,
    poll: Poll,
}

impl Listener {
    /// Bind to `addr:port`. An empty address binds every interface.
    pub fn bind(addr: &str, port: u16) -> Result<Self, ChatError> {
        let bind_addr = bind_address(addr, port)?;
        let mut inner = mio::net::TcpListener::from_std(create_listener(bind_addr)?);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut inner, LISTENER_TOKEN, Interest::READABLE)?;

        info!(addr = %bind_addr, "Waiting for connections");
        Ok(Self { inner, poll })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Wait for one peer, consulting `cancel` every time `timeout` elapses
    /// without a connection.
    ///
    /// The listening socket is closed when this returns, whatever the outcome.
    pub fn accept(
        mut self,
        timeout: Duration,
        mut cancel: Option<CancelHook>,
    ) -> Result<(TcpStream, SocketAddr), ChatError> {
        let mut events = Events::with_capacity(4);

        loop {
            match self.inner.accept() {
                Ok((stream, peer)) => {
                    info!(peer = %peer, "Connection established");
                    return Ok((stream.into(), peer));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            if events.is_empty() {
                trace!("Still waiting");
                if let Some(hook) = cancel.as_mut() {
                    if hook() {
                        info!("Waiting for connections cancelled");
                        return Err(ChatError::Cancelled);
                    }
                }
            }
        }
    }
}

fn bind_address(addr: &str, port: u16) -> Result<SocketAddr, ChatError> {
    if addr.is_empty() {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    (addr, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            ChatError::Socket(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address found for {}", addr),
            ))
        })
}

/// Create a non-blocking listening socket with a backlog of one.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1)?;

    Ok(socket.into())
}

/// Connect to `addr:port`.
///
/// A literal IP is tried directly; anything else goes through host name
/// resolution first. Exactly one connect attempt is made.
pub fn connect(
    addr: &str,
    port: u16,
    timeout: Duration,
) -> Result<(TcpStream, SocketAddr), ChatError> {
    let unreachable = |reason: String| ChatError::UnreachablePeer {
        addr: addr.to_string(),
        port,
        reason,
    };

    let target = match addr.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port),
        Err(_) => {
            debug!(addr, "Not a literal address, resolving host name");
            resolve_host(addr, port).map_err(|e| unreachable(e.to_string()))?
        }
    };

    let attempt = if timeout.is_zero() {
        TcpStream::connect(target)
    } else {
        TcpStream::connect_timeout(&target, timeout)
    };
    let stream = attempt.map_err(|e| unreachable(e.to_string()))?;

    info!(addr, port, peer = %target, "Connected");
    Ok((stream, target))
}

/// Resolve a host name, preferring IPv4 results.
fn resolve_host(host: &str, port: u16) -> io::Result<SocketAddr> {
    if host.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty host name"));
    }
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host name has no addresses"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_role_parsing() {
        assert_eq!("server".parse::<Role>().unwrap(), Role::Listener);
        assert_eq!("Listener".parse::<Role>().unwrap(), Role::Listener);
        assert_eq!("client".parse::<Role>().unwrap(), Role::Initiator);
        assert_eq!(" initiator ".parse::<Role>().unwrap(), Role::Initiator);

        let err = "relay".parse::<Role>().unwrap_err();
        assert!(matches!(err, ChatError::InvalidRole(ref r) if r == "relay"));
    }

    #[test]
    fn test_empty_bind_address_is_any() {
        let addr = bind_address("", 5001).unwrap();
        assert_eq!(addr, "0.0.0.0:5001".parse().unwrap());
    }

    #[test]
    fn test_listener_accepts_one_peer() {
        let listener = Listener::bind("127.0.0.1", 0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = thread::spawn(move || TcpStream::connect(("127.0.0.1", port)).unwrap());

        let (stream, peer) = listener
            .accept(Duration::from_millis(100), None)
            .unwrap();
        let client = client.join().unwrap();

        assert_eq!(peer, client.local_addr().unwrap());
        assert_eq!(stream.peer_addr().unwrap(), client.local_addr().unwrap());
    }

    #[test]
    fn test_listener_cancelled_by_hook() {
        let listener = Listener::bind("127.0.0.1", 0).unwrap();
        let addr = listener.local_addr().unwrap();

        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        let started = Instant::now();
        let hook: CancelHook = Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            started.elapsed() >= Duration::from_millis(300)
        });

        let result = listener.accept(Duration::from_millis(100), Some(hook));
        assert!(matches!(result, Err(ChatError::Cancelled)));
        assert!(polls.load(Ordering::SeqCst) >= 2);

        // Listening socket is gone: connecting is refused.
        assert!(TcpStream::connect_timeout(&addr, Duration::from_millis(500)).is_err());
    }

    #[test]
    fn test_connect_refused_is_unreachable() {
        // Reserve a port, then free it so nothing listens there.
        let port = {
            let probe = TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        let err = connect("127.0.0.1", port, Duration::from_secs(1)).unwrap_err();
        match err {
            ChatError::UnreachablePeer { addr, port: p, .. } => {
                assert_eq!(addr, "127.0.0.1");
                assert_eq!(p, port);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_connect_unroutable_times_out() {
        let started = Instant::now();
        let err = connect("10.255.255.1", 5001, Duration::from_millis(200)).unwrap_err();

        // Either the deadline expires or the host has no route at all.
        assert!(started.elapsed() < Duration::from_secs(5));
        match err {
            ChatError::UnreachablePeer { addr, port, .. } => {
                assert_eq!(addr, "10.255.255.1");
                assert_eq!(port, 5001);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_connect_unresolvable_is_unreachable() {
        let err = connect("no-such-host.invalid", 5001, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(
            err,
            ChatError::UnreachablePeer { ref addr, port: 5001, .. } if addr == "no-such-host.invalid"
        ));
    }

    #[test]
    fn test_connect_by_host_name() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let (_stream, peer) = connect("localhost", port, Duration::from_secs(1)).unwrap();
        assert_eq!(peer.port(), port);
        assert!(peer.ip().is_loopback());
    }
}
