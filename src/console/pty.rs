//! PTY-backed console connection
//!
//! Runs the device's console client (conmux, telnet, ser2net...) inside a
//! pseudoterminal so it behaves exactly as it would for a human, and bridges
//! the blocking PTY I/O to async code with two background threads.

use async_trait::async_trait;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use regex::Regex;
use std::io::{Read, Write};
use std::sync::mpsc::{channel, Sender};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::time::Instant;

use super::{describe, search, Connection, ExpectOutcome, Transcript};
use crate::error::{Error, Result};

/// Unread output kept for matching; older text is discarded
const SEARCH_WINDOW: usize = 64 * 1024;

/// Console connection spawned from a shell command line
pub struct PtyConnection {
    name: String,
    output_rx: UnboundedReceiver<Vec<u8>>,
    input_tx: Sender<Vec<u8>>,
    buffer: String,
    // Tail of a UTF-8 sequence split across reads
    partial: Vec<u8>,
    transcript: Transcript,
    eof: bool,
    child: Box<dyn Child + Send + Sync>,
    // Dropping the master side hangs up the console client
    _master: Box<dyn MasterPty + Send>,
}

impl PtyConnection {
    /// Spawn `command` through `sh -c` and attach to its terminal
    pub fn spawn(name: &str, command: &str) -> Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 200,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| Error::ConsoleIo {
                reason: format!("failed to open PTY for '{}': {}", command, e),
            })?;

        let mut cmd_builder = CommandBuilder::new("sh");
        cmd_builder.args(["-c", command]);
        cmd_builder.env("TERM", "dumb");

        let child = pair
            .slave
            .spawn_command(cmd_builder)
            .map_err(|e| Error::ConsoleIo {
                reason: format!("failed to spawn '{}': {}", command, e),
            })?;
        info!(
            "Attached to console of {} (pid {:?}): {}",
            name,
            child.process_id(),
            command
        );

        let mut reader = pair.master.try_clone_reader().map_err(|e| Error::ConsoleIo {
            reason: format!("failed to clone PTY reader: {}", e),
        })?;
        let mut writer = pair.master.take_writer().map_err(|e| Error::ConsoleIo {
            reason: format!("failed to take PTY writer: {}", e),
        })?;

        let (tx_out, output_rx) = unbounded_channel::<Vec<u8>>();
        let (input_tx, rx_in) = channel::<Vec<u8>>();

        // Reader thread: PTY master -> async channel; exits on EOF
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx_out.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(e) => {
                        debug!("console read error: {}", e);
                        break;
                    }
                }
            }
            debug!("console reader thread exiting");
        });

        // Writer thread: lines from send_line -> PTY master
        thread::spawn(move || {
            while let Ok(data) = rx_in.recv() {
                if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                    warn!("console write failed: {}", e);
                    break;
                }
            }
            debug!("console writer thread exiting");
        });

        Ok(Self {
            name: name.to_string(),
            output_rx,
            input_tx,
            buffer: String::new(),
            partial: Vec::new(),
            transcript: Transcript::new(),
            eof: false,
            child,
            _master: pair.master,
        })
    }

    fn absorb(&mut self, bytes: &[u8]) {
        for line in self.transcript.feed(bytes) {
            debug!(target: "lava_deploy::console", "[{}] {}", self.name, line);
        }

        let text = decode_utf8(&mut self.partial, bytes);
        self.buffer.push_str(&text);
        if self.buffer.len() > SEARCH_WINDOW {
            let mut cut = self.buffer.len() - SEARCH_WINDOW;
            while !self.buffer.is_char_boundary(cut) {
                cut += 1;
            }
            self.buffer.drain(..cut);
        }
    }
}

#[async_trait]
impl Connection for PtyConnection {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        let mut data = line.as_bytes().to_vec();
        data.push(b'\n');
        self.input_tx.send(data).map_err(|e| Error::ConsoleIo {
            reason: format!("console writer gone: {}", e),
        })
    }

    async fn expect(&mut self, patterns: &[Regex], timeout: Duration) -> Result<ExpectOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((found, end)) = search(&self.buffer, patterns) {
                self.buffer.drain(..end);
                return Ok(ExpectOutcome::Matched(found));
            }
            if self.eof {
                debug!("[{}] EOF while waiting for {}", self.name, describe(patterns));
                return Ok(ExpectOutcome::Eof);
            }

            match tokio::time::timeout_at(deadline, self.output_rx.recv()).await {
                Ok(Some(bytes)) => self.absorb(&bytes),
                Ok(None) => self.eof = true,
                Err(_) => {
                    debug!(
                        "[{}] timeout after {:?} waiting for {}",
                        self.name,
                        timeout,
                        describe(patterns)
                    );
                    return Ok(ExpectOutcome::Timeout);
                }
            }
        }
    }
}

impl Drop for PtyConnection {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!("console client for {} already gone: {}", self.name, e);
        }
    }
}

/// Decode `bytes` after whatever was left in `partial`
///
/// An incomplete sequence at the end stays in `partial` for the next read;
/// invalid bytes become U+FFFD.
fn decode_utf8(partial: &mut Vec<u8>, bytes: &[u8]) -> String {
    partial.extend_from_slice(bytes);
    let mut text = String::new();
    loop {
        match std::str::from_utf8(partial) {
            Ok(valid) => {
                text.push_str(valid);
                partial.clear();
                return text;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&partial[..valid]));
                match e.error_len() {
                    Some(bad) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        partial.drain(..valid + bad);
                    }
                    None => {
                        partial.drain(..valid);
                        return text;
                    }
                }
            }
        }
    }
}
