//! Request and document coordinator for qed-ls.
//!
//! Multiplexes a sequential, non-cancellable prover against a concurrent
//! LSP message stream: wire framing, the initialize handshake, document
//! lifecycle, request postponement and cancellation, and the cooperative
//! interrupt-driven scheduler.

pub mod protocol;
pub mod settings;
pub mod wire;

pub mod handlers;
pub mod requests;
pub mod scheduler;
pub mod server;

pub use protocol::{Message, RequestId, RpcError};
pub use scheduler::Outgoing;
pub use server::{run, Lifecycle, Server};
pub use settings::{ServerSettings, TraceValue};
pub use wire::{WireError, WireReader, WireWriter};
