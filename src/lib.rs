//! chatline: a point-to-point TCP message channel.
//!
//! One endpoint listens, the other connects. Once connected, a background
//! thread drains the socket into a shared received log while the caller
//! sends on its own thread. Sent and received messages are also merged into
//! a single log in arrival order.
//!
//! ```no_run
//! use chatline::{Chatbox, Logs, Settings};
//!
//! let chat = Chatbox::open(&Settings::initiator("192.168.1.20", 5001), Logs::new(), None)?;
//! chat.send("hello")?;
//! for message in chat.take_received_messages() {
//!     println!("{}: {}", message.origin, message.text());
//! }
//! chat.stop();
//! # Ok::<(), chatline::ChatError>(())
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod establish;
pub mod message;

pub use channel::{ChannelState, Chatbox, CloseReason};
pub use config::Settings;
pub use error::ChatError;
pub use establish::{CancelHook, Role};
pub use message::{Logs, Message, MessageLog, Origin};
