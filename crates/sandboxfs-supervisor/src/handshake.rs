//! Line-oriented channel to a sandbox filesystem process.
//!
//! The outbound half writes newline-terminated control lines. The inbound
//! half is drained by a background thread into an mpsc channel so every read
//! can be bounded with `recv_timeout`. The channel is agnostic to the
//! underlying streams, which lets tests drive it with in-memory pipes.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::Duration;

use tracing::trace;

use crate::error::HandshakeError;

const HANDSHAKE_TARGET: &str = "sandboxfs_supervisor::handshake";

/// Result of reading from the inbound side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A complete line, without its terminator.
    Line(String),
    /// The peer closed its output.
    EndOfStream,
}

/// Bidirectional line channel over a writer and a reader.
pub struct HandshakeChannel {
    writer: Option<Box<dyn Write + Send>>,
    lines: Receiver<io::Result<String>>,
    exhausted: bool,
}

impl HandshakeChannel {
    /// Wraps the given streams and starts draining `reader`.
    pub fn new<R, W>(reader: R, writer: W) -> Result<Self, HandshakeError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (sender, lines) = mpsc::channel();
        thread::Builder::new()
            .name(String::from("sandboxfs-handshake"))
            .spawn(move || pump_lines(reader, &sender))
            .map_err(|source| HandshakeError::Reader {
                source: Arc::new(source),
            })?;

        Ok(Self {
            writer: Some(Box::new(io::BufWriter::new(writer))),
            lines,
            exhausted: false,
        })
    }

    /// Writes `text` followed by a newline and flushes it.
    ///
    /// An empty `text` marks the end of an input batch.
    pub fn send_line(&mut self, text: &str) -> Result<(), HandshakeError> {
        let writer = self.writer.as_mut().ok_or(HandshakeError::InputClosed)?;
        trace!(target: HANDSHAKE_TARGET, line = text, "sending control line");
        writer
            .write_all(text.as_bytes())
            .and_then(|()| writer.write_all(b"\n"))
            .and_then(|()| writer.flush())
            .map_err(|source| HandshakeError::Write {
                source: Arc::new(source),
            })
    }

    /// Waits up to `timeout` for the next inbound line.
    ///
    /// Once [`Inbound::EndOfStream`] has been observed every later call
    /// returns it immediately.
    pub fn read_line(&mut self, timeout: Duration) -> Result<Inbound, HandshakeError> {
        if self.exhausted {
            return Ok(Inbound::EndOfStream);
        }

        match self.lines.recv_timeout(timeout) {
            Ok(Ok(line)) => {
                trace!(target: HANDSHAKE_TARGET, line = %line, "received line");
                Ok(Inbound::Line(line))
            }
            Ok(Err(source)) => {
                self.exhausted = true;
                Err(HandshakeError::Read {
                    source: Arc::new(source),
                })
            }
            Err(RecvTimeoutError::Timeout) => Err(HandshakeError::Timeout {
                timeout_ms: timeout.as_millis(),
            }),
            Err(RecvTimeoutError::Disconnected) => {
                self.exhausted = true;
                Ok(Inbound::EndOfStream)
            }
        }
    }

    /// Drops every line already received but not yet read and returns how
    /// many were dropped.
    ///
    /// A read failure or end-of-stream found while draining is kept: later
    /// reads report [`Inbound::EndOfStream`].
    pub fn discard_pending(&mut self) -> usize {
        let mut discarded = 0;
        while !self.exhausted {
            match self.lines.try_recv() {
                Ok(Ok(line)) => {
                    trace!(target: HANDSHAKE_TARGET, line = %line, "discarding stale line");
                    discarded += 1;
                }
                Ok(Err(_)) | Err(TryRecvError::Disconnected) => self.exhausted = true,
                Err(TryRecvError::Empty) => break,
            }
        }
        discarded
    }

    /// Closes the outbound side. The peer sees end-of-file on its input.
    pub fn close_input(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            // The peer may already be gone; a failed flush changes nothing.
            if let Err(error) = writer.flush() {
                trace!(target: HANDSHAKE_TARGET, error = %error, "flush on close failed");
            }
        }
    }

    /// Whether the inbound side has reached end-of-stream.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

impl std::fmt::Debug for HandshakeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeChannel")
            .field("input_open", &self.writer.is_some())
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

fn pump_lines<R: Read>(reader: R, sender: &Sender<io::Result<String>>) {
    for line in BufReader::new(reader).lines() {
        let failed = line.is_err();
        if sender.send(line).is_err() || failed {
            break;
        }
    }
}
