//! Cooperative scheduling between the reader, the writer, and the worker.
//!
//! Three contexts. The *reader* task decodes frames and pushes them onto an
//! unbounded queue, setting the interrupt flag after every push so an
//! in-flight prover slice unwinds promptly. The *writer* task owns the
//! output stream and serializes every outgoing frame. The *worker* runs on
//! a blocking thread: it drains the queue, and only when the queue is empty
//! does it give the prover one bounded slice. With no messages and no
//! active document it parks in `blocking_recv`, woken by the next push.

use serde_json::Value;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use qed_core::{Diagnostic, InterruptFlag, Prover};
use url::Url;

use crate::protocol::{self, Message, MessageType, RequestId, RpcError};
use crate::server::Server;
use crate::settings::TraceValue;
use crate::wire::{WireError, WireReader, WireWriter};

/// One queue entry. `Eof` covers clean EOF and terminal read errors alike;
/// the worker decides the exit code.
#[derive(Debug)]
pub enum Inbound {
    Message(Message),
    Eof,
}

/// Handle for producing outgoing frames from the worker. Cloneable; all
/// frames funnel through the single writer task, which is what serializes
/// responses on the wire.
#[derive(Clone)]
pub struct Outgoing {
    tx: mpsc::UnboundedSender<Value>,
    trace: Arc<AtomicU8>,
}

impl Outgoing {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<Value>) -> Self {
        Self {
            tx,
            trace: Arc::new(AtomicU8::new(TraceValue::Off as u8)),
        }
    }

    fn send(&self, frame: Value) {
        if self.tx.send(frame).is_err() {
            tracing::debug!("writer gone, dropping outgoing frame");
        }
    }

    pub fn respond(&self, id: &RequestId, result: Value) {
        self.send(protocol::response_ok(id, result));
    }

    pub fn respond_err(&self, id: &RequestId, error: &RpcError) {
        self.send(protocol::response_err(id, error));
    }

    pub fn respond_result(&self, id: &RequestId, result: Result<Value, RpcError>) {
        match result {
            Ok(value) => self.respond(id, value),
            Err(error) => self.respond_err(id, &error),
        }
    }

    pub fn notify(&self, method: &str, params: Value) {
        self.send(protocol::notification(method, params));
    }

    pub fn publish_diagnostics(&self, uri: &Url, version: i32, diagnostics: &[Diagnostic]) {
        self.send(protocol::publish_diagnostics(uri, version, diagnostics));
    }

    pub fn log(&self, level: MessageType, message: &str) {
        self.send(protocol::log_message(level, message));
    }

    pub fn set_trace(&self, value: TraceValue) {
        self.trace.store(value as u8, Ordering::Relaxed);
    }

    #[must_use]
    pub fn trace_value(&self) -> TraceValue {
        TraceValue::from_u8(self.trace.load(Ordering::Relaxed))
    }

    /// Free-form trace line, dropped unless the client asked for traces.
    pub fn trace(&self, message: impl FnOnce() -> String) {
        if self.trace_value() != TraceValue::Off {
            self.send(protocol::log_trace(&message()));
        }
    }

    /// Trace emitted only at `verbose`.
    pub fn trace_verbose(&self, message: impl FnOnce() -> String) {
        if self.trace_value() == TraceValue::Verbose {
            self.send(protocol::log_trace(&message()));
        }
    }
}

/// Decode frames until EOF or a framing error, pushing each message and
/// nudging the interrupt flag. Malformed JSON-RPC shapes are dropped;
/// malformed *framing* is terminal, per the wire contract.
pub(crate) fn spawn_reader<R>(
    input: R,
    tx: mpsc::UnboundedSender<Inbound>,
    interrupt: InterruptFlag,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut frames = WireReader::new(input);
        loop {
            match frames.read().await {
                Ok(frame) => match protocol::classify(frame) {
                    Some(message) => {
                        if tx.send(Inbound::Message(message)).is_err() {
                            break;
                        }
                        interrupt.set();
                    }
                    None => tracing::warn!("dropping frame with no JSON-RPC shape"),
                },
                Err(WireError::Closed) => {
                    tracing::debug!("client closed the input stream");
                    let _ = tx.send(Inbound::Eof);
                    interrupt.set();
                    break;
                }
                Err(err) => {
                    tracing::error!(%err, "unreadable frame, treating stream as dead");
                    let _ = tx.send(Inbound::Eof);
                    interrupt.set();
                    break;
                }
            }
        }
    })
}

/// Drain the outgoing channel onto the output stream. Ends when every
/// `Outgoing` clone is dropped, which flushes the final responses.
pub(crate) fn spawn_writer<W>(output: W, mut rx: mpsc::UnboundedReceiver<Value>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut frames = WireWriter::new(output);
        while let Some(frame) = rx.recv().await {
            if let Err(err) = frames.write(&frame).await {
                tracing::error!(%err, "write failed, discarding remaining output");
                break;
            }
        }
    })
}

/// The worker: drain messages first; give the prover a slice only when the
/// queue is empty; park when there is nothing to do at all.
pub(crate) fn worker_loop<P>(mut server: Server<P>, mut rx: mpsc::UnboundedReceiver<Inbound>) -> i32
where
    P: Prover,
{
    loop {
        if server.exited() {
            break;
        }
        let next = if server.wants_step() {
            match rx.try_recv() {
                Ok(inbound) => Some(inbound),
                Err(mpsc::error::TryRecvError::Empty) => None,
                Err(mpsc::error::TryRecvError::Disconnected) => Some(Inbound::Eof),
            }
        } else {
            // Parked until the reader pushes or goes away.
            Some(rx.blocking_recv().unwrap_or(Inbound::Eof))
        };
        match next {
            Some(Inbound::Message(message)) => server.handle_message(message),
            Some(Inbound::Eof) => server.on_client_gone(),
            None => server.step_once(),
        }
    }
    server.exit_code()
}
