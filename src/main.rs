//! chatline: exchange text messages with one peer over TCP
//!
//! Run one side as a listener and the other as an initiator:
//! - `chatline --role listener --port 5001`
//! - `chatline --role initiator --addr 192.168.1.20 --port 5001`
//!
//! Each line typed on stdin is sent to the peer. `/quit` stops locally,
//! `/exit` asks the peer to close.

use chatline::config::Config;
use chatline::{CancelHook, Chatbox, Logs};
use std::io::{self, BufRead};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const PRINT_INTERVAL: Duration = Duration::from_millis(100);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        role = %config.settings.role,
        addr = %config.settings.addr,
        port = config.settings.port,
        wait_deadline = ?config.wait_deadline,
        "Starting chatline"
    );

    let cancel = config.wait_deadline.map(|deadline| {
        let started = Instant::now();
        Box::new(move || started.elapsed() >= deadline) as CancelHook
    });

    let chat = Arc::new(Chatbox::open(&config.settings, Logs::new(), cancel)?);
    let printer = {
        let chat = Arc::clone(&chat);
        thread::Builder::new()
            .name("chat-printer".to_string())
            .spawn(move || print_received(&chat))?
    };

    for line in io::stdin().lock().lines() {
        let line = line?;
        if line == "/quit" {
            break;
        }
        if let Err(e) = chat.send(&line) {
            error!(error = %e, "Send failed");
            break;
        }
    }

    chat.stop();
    let reason = chat.join();
    if printer.join().is_err() {
        error!("Printer thread panicked");
    }

    info!(
        reason = ?reason,
        sent = chat.sent_messages().len(),
        total = chat.messages().len(),
        "Connection closed"
    );
    Ok(())
}

/// Print received messages until the channel closes.
fn print_received(chat: &Chatbox) {
    loop {
        let active = chat.is_active();
        for message in chat.take_received_messages() {
            println!(
                "[{}] {}: {}",
                message.at.format("%H:%M:%S"),
                message.origin,
                message.text()
            );
        }
        if !active {
            break;
        }
        thread::sleep(PRINT_INTERVAL);
    }
}
