//! The prover capability consumed by the coordinator.
//!
//! The prover is sequential and non-reentrant: all calls happen on the
//! worker context. Cancellation is cooperative — the prover polls
//! [`InterruptFlag`] at its own checkpoints and unwinds with
//! [`ProverError::Interrupted`], which the document stepper turns into a
//! suspended step. Every prover call is made through [`protect`], so panics
//! inside the prover become diagnostics instead of taking down the worker.

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use url::Url;

use crate::span::Span;
use crate::workspace::{CmdLine, Workspace};

/// Single-writer, many-reader cooperative interruption bit.
///
/// The reader context sets it whenever a message arrives; the prover polls
/// it at checkpoints; the worker clears it before each prover slice.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProverError {
    /// The interrupt flag was observed at a checkpoint; the current slice
    /// unwound without producing a result.
    #[error("interrupted")]
    Interrupted,
    /// A prover-level failure. Surfaced as a diagnostic on the offending
    /// span, never as an RPC error.
    #[error("{0}")]
    Failure(String),
}

impl ProverError {
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(message.into())
    }
}

/// A message emitted while interpreting one sentence. `span` is relative to
/// the document; `None` means "attach to the whole sentence".
#[derive(Debug, Clone)]
pub struct ProverMessage {
    pub severity: crate::diagnostic::Severity,
    pub text: String,
    pub span: Option<Span>,
}

/// One parsed top-level unit.
#[derive(Debug)]
pub struct Parsed<A> {
    pub ast: A,
    pub span: Span,
    pub next_offset: usize,
}

/// Result of successfully interpreting one unit.
#[derive(Debug)]
pub struct Interpreted<S> {
    pub state: S,
    pub messages: Vec<ProverMessage>,
}

/// Goal rendering format requested by `proof/goals`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum PpFormat {
    #[default]
    Pp,
    Str,
}

/// Symbol kind reported by [`Prover::outline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutlineKind {
    Definition,
    Theorem,
}

/// One outline entry: what a checked unit binds, if anything.
#[derive(Debug, Clone)]
pub struct OutlineEntry {
    pub name: String,
    pub kind: OutlineKind,
    pub detail: Option<String>,
}

/// The narrow prover interface the coordinator drives.
///
/// `State` is the prover's document state after some prefix of units; it is
/// cloned into every checked node. `Ast` is opaque to the coordinator.
pub trait Prover {
    type State: Clone;
    type Ast;

    /// Snapshot taken at prover initialization, before any workspace or
    /// document is applied. Seeds every fresh check continuation.
    fn root_state(&self) -> Self::State;

    /// Probe a workspace root and build an immutable description of it.
    fn workspace_guess(&self, root: &Path, cmdline: &CmdLine) -> Result<Workspace, ProverError>;

    /// Prepare the prover for checking a file under the given workspace.
    fn workspace_apply(&self, uri: &Url, workspace: &Workspace) -> Result<(), ProverError>;

    /// Parse the next top-level unit starting at `offset`. `None` means the
    /// text is exhausted.
    fn parse_next(
        &self,
        text: &str,
        offset: usize,
        state: &Self::State,
    ) -> Result<Option<Parsed<Self::Ast>>, ProverError>;

    /// Evaluate one unit against `state`. A `Failure` here is an ordinary
    /// proof error: the caller records it and keeps checking.
    fn interpret(
        &self,
        state: &Self::State,
        ast: &Self::Ast,
    ) -> Result<Interpreted<Self::State>, ProverError>;

    /// The shared interruption bit this prover polls.
    fn interrupt_flag(&self) -> &InterruptFlag;

    /// What the unit binds, for `documentSymbol` and `definition`.
    fn outline(&self, _ast: &Self::Ast) -> Option<OutlineEntry> {
        None
    }

    /// Names in scope, for `completion`.
    fn names(&self, _state: &Self::State) -> Vec<String> {
        Vec::new()
    }

    /// Render the open goals, if any, for `proof/goals` and hover.
    fn goals(&self, _state: &Self::State, _format: PpFormat) -> Option<String> {
        None
    }

    /// Persist a checked document's compiled form (`coq/saveVo`).
    fn save_artifact(&self, _uri: &Url, _state: &Self::State) -> Result<(), ProverError> {
        Ok(())
    }

    /// Best-effort cache flush on `didSave`.
    fn flush_cache(&self) {}
}

/// Outcome of a protected prover call.
#[derive(Debug)]
pub enum Protected<T> {
    Value(T),
    Interrupted,
    /// Prover failure or panic, reduced to a message for a diagnostic.
    Failed(String),
}

/// Run a prover thunk, converting panics and failures into data.
///
/// Nothing escapes: a panic inside the prover unwinds to here and comes out
/// as `Failed` with the panic payload as the message.
pub fn protect<T>(f: impl FnOnce() -> Result<T, ProverError>) -> Protected<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Protected::Value(value),
        Ok(Err(ProverError::Interrupted)) => Protected::Interrupted,
        Ok(Err(ProverError::Failure(message))) => Protected::Failed(message),
        Err(payload) => Protected::Failed(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "prover panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_flag_roundtrip() {
        let flag = InterruptFlag::new();
        assert!(!flag.is_set());
        flag.set();
        assert!(flag.is_set());
        let shared = flag.clone();
        shared.clear();
        assert!(!flag.is_set());
    }

    #[test]
    fn test_protect_value() {
        match protect(|| Ok::<_, ProverError>(41 + 1)) {
            Protected::Value(v) => assert_eq!(v, 42),
            other => panic!("expected Value, got {other:?}"),
        }
    }

    #[test]
    fn test_protect_interrupted() {
        match protect(|| Err::<(), _>(ProverError::Interrupted)) {
            Protected::Interrupted => {}
            other => panic!("expected Interrupted, got {other:?}"),
        }
    }

    #[test]
    fn test_protect_failure() {
        match protect(|| Err::<(), _>(ProverError::failure("bad term"))) {
            Protected::Failed(msg) => assert_eq!(msg, "bad term"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn test_protect_catches_panic() {
        match protect(|| -> Result<(), ProverError> { panic!("kernel invariant violated") }) {
            Protected::Failed(msg) => assert_eq!(msg, "kernel invariant violated"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn test_protect_catches_string_panic() {
        match protect(|| -> Result<(), ProverError> { panic!("{} goals left", 3) }) {
            Protected::Failed(msg) => assert_eq!(msg, "3 goals left"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn test_pp_format_deserializes() {
        let fmt: PpFormat = serde_json::from_value(serde_json::json!("Str")).unwrap();
        assert_eq!(fmt, PpFormat::Str);
        let fmt: PpFormat = serde_json::from_value(serde_json::json!("Pp")).unwrap();
        assert_eq!(fmt, PpFormat::Pp);
    }
}
