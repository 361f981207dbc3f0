//! Request loop driven by a single event channel.

use std::io::{self, BufRead, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::executor::ActionExecutor;
use crate::request::BuildReport;
use crate::shutdown::{ShutdownError, ShutdownSignal};

use super::{BuildServer, SERVER_TARGET, StopReason};

/// Errors that end the request loop early.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A helper thread could not be spawned.
    #[error("failed to spawn {name} thread: {source}")]
    Thread {
        /// Thread name.
        name: &'static str,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Reading the request stream failed.
    #[error("failed to read build requests: {source}")]
    Input {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Writing a report failed.
    #[error("failed to write build report: {source}")]
    Output {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Encoding a report failed.
    #[error("failed to encode build report: {source}")]
    Encode {
        /// Underlying serialisation error.
        #[from]
        source: serde_json::Error,
    },
}

/// What a completed request loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeSummary {
    /// Requests answered, including rejected ones.
    pub requests: u64,
    /// Why the loop ended.
    pub reason: StopReason,
}

enum ServerEvent {
    Line(String),
    InputClosed,
    InputFailed(io::Error),
    Shutdown,
    SignalFailed(ShutdownError),
}

/// Answers requests from `input` on `output` until end of input or shutdown.
///
/// Every request line gets exactly one report line. Requests still queued
/// when a shutdown signal arrives are dropped. The sandbox is torn down
/// before returning on every path, including errors.
pub fn serve<R, W, S>(
    mut server: BuildServer,
    input: R,
    mut output: W,
    signal: S,
    executor: &dyn ActionExecutor,
) -> Result<ServeSummary, ServerError>
where
    R: BufRead + Send + 'static,
    W: Write,
    S: ShutdownSignal + 'static,
{
    let result = spawn_sources(input, signal)
        .and_then(|events| drive(&mut server, &events, &mut output, executor));

    let reason = result
        .as_ref()
        .map_or(StopReason::Failed, |summary| summary.reason);
    server.reporter().shutdown_starting(reason);
    let warnings = server.shutdown();
    server.reporter().shutdown_completed();
    info!(
        target: SERVER_TARGET,
        warnings = warnings.len(),
        "build server stopped"
    );
    result
}

fn spawn_sources<R, S>(input: R, signal: S) -> Result<Receiver<ServerEvent>, ServerError>
where
    R: BufRead + Send + 'static,
    S: ShutdownSignal + 'static,
{
    let (sender, receiver) = mpsc::channel();

    let lines = sender.clone();
    spawn("sandboxd-input", move || pump_requests(input, &lines))?;
    spawn("sandboxd-signals", move || {
        let event = match signal.wait() {
            Ok(()) => ServerEvent::Shutdown,
            Err(error) => ServerEvent::SignalFailed(error),
        };
        // The loop may already have finished.
        drop(sender.send(event));
    })?;
    Ok(receiver)
}

fn spawn<F>(name: &'static str, body: F) -> Result<(), ServerError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_owned())
        .spawn(body)
        .map(drop)
        .map_err(|source| ServerError::Thread { name, source })
}

fn pump_requests<R: BufRead>(input: R, events: &Sender<ServerEvent>) {
    for line in input.lines() {
        let event = match line {
            Ok(line) => ServerEvent::Line(line),
            Err(error) => {
                drop(events.send(ServerEvent::InputFailed(error)));
                return;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
    drop(events.send(ServerEvent::InputClosed));
}

fn drive<W: Write>(
    server: &mut BuildServer,
    events: &Receiver<ServerEvent>,
    output: &mut W,
    executor: &dyn ActionExecutor,
) -> Result<ServeSummary, ServerError> {
    let mut requests = 0_u64;
    loop {
        // Both senders gone means input ended and the signal thread exited.
        let event = events.recv().unwrap_or(ServerEvent::InputClosed);
        match event {
            ServerEvent::Line(line) if line.trim().is_empty() => {}
            ServerEvent::Line(line) => {
                let report = server.handle_line(&line, executor);
                write_report(output, &report)?;
                requests = requests.saturating_add(1);
            }
            ServerEvent::InputClosed => {
                debug!(target: SERVER_TARGET, "request stream closed");
                return Ok(ServeSummary {
                    requests,
                    reason: StopReason::InputClosed,
                });
            }
            ServerEvent::Shutdown => {
                return Ok(ServeSummary {
                    requests,
                    reason: StopReason::Signal,
                });
            }
            ServerEvent::InputFailed(source) => return Err(ServerError::Input { source }),
            ServerEvent::SignalFailed(error) => {
                warn!(
                    target: SERVER_TARGET,
                    error = %error,
                    "shutdown signals unavailable; serving until input closes"
                );
            }
        }
    }
}

fn write_report<W: Write>(output: &mut W, report: &BuildReport) -> Result<(), ServerError> {
    serde_json::to_writer(&mut *output, report)?;
    output
        .write_all(b"\n")
        .and_then(|()| output.flush())
        .map_err(|source| ServerError::Output { source })
}
