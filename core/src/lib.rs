//! Prover-facing data model for qed-ls.
//!
//! Everything here is I/O-free: documents, workspaces, diagnostics, and the
//! [`Prover`] capability the coordinator drives. The `qed-lsp` crate owns
//! the transport and scheduling; `qed-prover` provides the reference
//! [`Prover`] implementation.

pub mod diagnostic;
pub mod document;
pub mod prover;
pub mod span;
pub mod store;
pub mod workspace;

pub use diagnostic::{Diagnostic, Severity};
pub use document::{Completion, Document, Node, StepOutcome, StepReport};
pub use prover::{
    protect, Interpreted, InterruptFlag, OutlineEntry, OutlineKind, Parsed, PpFormat, Protected,
    Prover, ProverError, ProverMessage,
};
pub use span::{LineIndex, Position, Range, Span};
pub use store::{ChangeOutcome, DocumentStore};
pub use workspace::{CmdLine, LoadPath, ProverFlags, Workspace, WorkspaceRegistry};
