//! Message-loop lifecycle: the initialize handshake, dispatch of
//! notifications and requests, document mutations, and shutdown.
//!
//! Everything here runs on the worker context. The only shared state is
//! the inbound queue, the interrupt flag, and the outgoing channel; the
//! store, the registry, and the request table are worker-exclusive.

use std::panic::{self, AssertUnwindSafe};

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use url::Url;

use qed_core::{
    ChangeOutcome, CmdLine, Document, DocumentStore, InterruptFlag, Prover, StepOutcome,
    WorkspaceRegistry,
};

use crate::handlers::{self, Dispatch, HandlerCx};
use crate::protocol::{Message, MessageType, RpcError};
use crate::requests::{Admit, PendingRequest, RequestTable};
use crate::scheduler::{self, Outgoing};
use crate::settings::{ServerSettings, TraceValue};

const SERVER_NAME: &str = "qed-ls";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    PreInit,
    Running,
    ShuttingDown,
    Exited,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams {
    #[serde(default)]
    initialization_options: Option<Value>,
    #[serde(default)]
    workspace_folders: Option<Vec<WorkspaceFolder>>,
    #[serde(default)]
    root_uri: Option<Url>,
    #[serde(default)]
    trace: Option<TraceValue>,
}

#[derive(Debug, Deserialize)]
struct WorkspaceFolder {
    uri: Url,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DidOpenParams {
    text_document: TextDocumentItem,
}

#[derive(Debug, Deserialize)]
struct TextDocumentItem {
    uri: Url,
    version: i32,
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DidChangeParams {
    text_document: VersionedTextDocumentId,
    content_changes: Vec<ContentChange>,
}

#[derive(Debug, Deserialize)]
struct VersionedTextDocumentId {
    uri: Url,
    version: i32,
}

#[derive(Debug, Deserialize)]
struct ContentChange {
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentIdParams {
    text_document: UriOnly,
}

#[derive(Debug, Deserialize)]
struct UriOnly {
    uri: Url,
}

#[derive(Debug, Deserialize)]
struct CancelParams {
    id: crate::protocol::RequestId,
}

#[derive(Debug, Deserialize)]
struct SetTraceParams {
    value: TraceValue,
}

#[derive(Debug, Deserialize)]
struct DidChangeWorkspaceFoldersParams {
    event: WorkspaceFoldersChangeEvent,
}

#[derive(Debug, Deserialize)]
struct WorkspaceFoldersChangeEvent {
    #[serde(default)]
    added: Vec<WorkspaceFolder>,
    #[serde(default)]
    removed: Vec<WorkspaceFolder>,
}

/// Worker-side server state: one per connection.
pub struct Server<P: Prover> {
    lifecycle: Lifecycle,
    saw_shutdown: bool,
    prover: P,
    settings: ServerSettings,
    registry: WorkspaceRegistry<P::State>,
    store: DocumentStore<P>,
    table: RequestTable<P>,
    outgoing: Outgoing,
    interrupt: InterruptFlag,
}

impl<P: Prover> Server<P> {
    #[must_use]
    pub fn new(prover: P, cmdline: CmdLine, outgoing: Outgoing, interrupt: InterruptFlag) -> Self {
        let registry = WorkspaceRegistry::new(cmdline, prover.root_state());
        Self {
            lifecycle: Lifecycle::PreInit,
            saw_shutdown: false,
            prover,
            settings: ServerSettings::default(),
            registry,
            store: DocumentStore::new(),
            table: RequestTable::new(),
            outgoing,
            interrupt,
        }
    }

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub(crate) fn exited(&self) -> bool {
        self.lifecycle == Lifecycle::Exited
    }

    pub(crate) fn exit_code(&self) -> i32 {
        i32::from(!self.saw_shutdown)
    }

    /// Whether the worker should poll the queue instead of parking: only a
    /// running server with an unfinished document has prover work to do.
    pub(crate) fn wants_step(&self) -> bool {
        self.lifecycle == Lifecycle::Running && self.store.any_active().is_some()
    }

    /// The reader vanished (EOF or framing error).
    pub(crate) fn on_client_gone(&mut self) {
        if self.lifecycle != Lifecycle::Exited {
            tracing::info!("input stream ended, exiting");
            self.lifecycle = Lifecycle::Exited;
        }
    }

    pub fn handle_message(&mut self, message: Message) {
        self.outgoing.trace(|| match &message {
            Message::Request { id, method, .. } => format!("--> {method} #{id}"),
            Message::Notification { method, .. } => format!("--> {method}"),
            Message::Response { id } => format!("--> response #{id}"),
        });
        match self.lifecycle {
            Lifecycle::PreInit => self.handle_pre_init(message),
            Lifecycle::Running => self.handle_running(message),
            Lifecycle::ShuttingDown => self.handle_shutting_down(message),
            Lifecycle::Exited => {
                tracing::debug!("message after exit ignored");
            }
        }
    }

    fn handle_pre_init(&mut self, message: Message) {
        match message {
            Message::Request { id, method, params } if method == "initialize" => {
                self.on_initialize(&id, params);
            }
            Message::Request { id, method, .. } => {
                tracing::warn!(%method, "request before initialize");
                self.outgoing.respond_err(&id, &RpcError::not_initialized());
            }
            Message::Notification { method, .. } if method == "exit" => self.on_exit(),
            Message::Notification { method, .. } => {
                tracing::debug!(%method, "notification before initialize dropped");
            }
            Message::Response { id } => {
                tracing::debug!(%id, "unexpected response dropped");
            }
        }
    }

    fn handle_running(&mut self, message: Message) {
        match message {
            Message::Request { id, method, params } => match method.as_str() {
                "initialize" => {
                    self.outgoing.respond_err(
                        &id,
                        &RpcError::invalid_request("initialize may only be sent once"),
                    );
                }
                "shutdown" => self.on_shutdown(&id),
                _ => self.on_request(id, method, params),
            },
            Message::Notification { method, params } => self.on_notification(&method, params),
            Message::Response { id } => {
                tracing::debug!(%id, "unexpected response dropped");
            }
        }
    }

    fn handle_shutting_down(&mut self, message: Message) {
        match message {
            Message::Request { id, .. } => {
                self.outgoing
                    .respond_err(&id, &RpcError::invalid_request("server is shutting down"));
            }
            Message::Notification { method, .. } if method == "exit" => self.on_exit(),
            Message::Notification { method, .. } => {
                tracing::debug!(%method, "notification during shutdown ignored");
            }
            Message::Response { id } => {
                tracing::debug!(%id, "unexpected response dropped");
            }
        }
    }

    // ── lifecycle requests ─────────────────────────────────────────────

    fn on_initialize(&mut self, id: &crate::protocol::RequestId, params: Value) {
        let parsed: InitializeParams = match serde_json::from_value(params) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(%err, "malformed initialize params, using defaults");
                InitializeParams::default()
            }
        };

        self.settings =
            ServerSettings::from_initialization_options(parsed.initialization_options.as_ref());
        let trace = parsed.trace.unwrap_or(self.settings.trace);
        self.outgoing.set_trace(trace);

        let mut roots: Vec<Url> = parsed
            .workspace_folders
            .unwrap_or_default()
            .into_iter()
            .map(|folder| folder.uri)
            .collect();
        if roots.is_empty() {
            if let Some(root_uri) = parsed.root_uri {
                roots.push(root_uri);
            }
        }
        if roots.is_empty() {
            match std::env::current_dir().map(|cwd| Url::from_directory_path(&cwd)) {
                Ok(Ok(cwd)) => roots.push(cwd),
                _ => tracing::warn!("no workspace folder and no usable cwd"),
            }
        }
        for root in roots {
            self.add_workspace(&root);
        }

        self.outgoing.respond(
            id,
            json!({
                "capabilities": {
                    "textDocumentSync": 1,
                    "hoverProvider": true,
                    "completionProvider": {},
                    "definitionProvider": true,
                    "documentSymbolProvider": true,
                    "codeActionProvider": false,
                    "codeLensProvider": {},
                },
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        );
        self.lifecycle = Lifecycle::Running;
        self.outgoing
            .log(MessageType::Info, concat!("qed-ls ", env!("CARGO_PKG_VERSION"), " initialized"));
    }

    fn on_shutdown(&mut self, id: &crate::protocol::RequestId) {
        self.outgoing.respond(id, Value::Null);
        for req in self.table.take_all() {
            self.outgoing
                .respond_err(&req.id, &RpcError::shutting_down());
        }
        self.saw_shutdown = true;
        self.lifecycle = Lifecycle::ShuttingDown;
    }

    fn on_exit(&mut self) {
        tracing::info!("exit notification received");
        self.lifecycle = Lifecycle::Exited;
    }

    // ── notifications ──────────────────────────────────────────────────

    fn on_notification(&mut self, method: &str, params: Value) {
        match method {
            "initialized" => {}
            "exit" => self.on_exit(),
            "$/setTrace" => match serde_json::from_value::<SetTraceParams>(params) {
                Ok(parsed) => self.outgoing.set_trace(parsed.value),
                Err(err) => tracing::warn!(%err, "malformed $/setTrace"),
            },
            "$/cancelRequest" => match serde_json::from_value::<CancelParams>(params) {
                Ok(parsed) => {
                    if let Some(req) = self.table.cancel(&parsed.id) {
                        self.outgoing
                            .respond_err(&req.id, &RpcError::cancelled_by_client());
                    }
                }
                Err(err) => tracing::warn!(%err, "malformed $/cancelRequest"),
            },
            "workspace/didChangeWorkspaceFolders" => {
                match serde_json::from_value::<DidChangeWorkspaceFoldersParams>(params) {
                    Ok(parsed) => self.on_workspace_folders_changed(parsed.event),
                    Err(err) => tracing::warn!(%err, "malformed didChangeWorkspaceFolders"),
                }
            }
            "textDocument/didOpen" => match serde_json::from_value::<DidOpenParams>(params) {
                Ok(parsed) => self.on_did_open(parsed.text_document),
                Err(err) => tracing::warn!(%err, "malformed didOpen"),
            },
            "textDocument/didChange" => match serde_json::from_value::<DidChangeParams>(params) {
                Ok(parsed) => self.on_did_change(parsed),
                Err(err) => tracing::warn!(%err, "malformed didChange"),
            },
            "textDocument/didClose" => match serde_json::from_value::<DocumentIdParams>(params) {
                Ok(parsed) => self.on_did_close(&parsed.text_document.uri),
                Err(err) => tracing::warn!(%err, "malformed didClose"),
            },
            "textDocument/didSave" => self.prover.flush_cache(),
            other => {
                tracing::debug!(method = %other, "unhandled notification");
            }
        }
    }

    fn add_workspace(&mut self, root_uri: &Url) {
        let Ok(root) = root_uri.to_file_path() else {
            tracing::warn!(uri = %root_uri, "workspace folder is not a file URI");
            return;
        };
        match self.prover.workspace_guess(&root, self.registry.cmdline()) {
            Ok(mut workspace) => {
                workspace.debug = workspace.debug || self.settings.debug;
                self.registry.add(root, workspace);
            }
            Err(err) => {
                tracing::warn!(root = %root.display(), %err, "workspace probe failed");
                self.outgoing.log(
                    MessageType::Warning,
                    &format!("workspace probe failed for {}: {err}", root.display()),
                );
            }
        }
    }

    fn on_workspace_folders_changed(&mut self, event: WorkspaceFoldersChangeEvent) {
        // Added first, then removed, so a root move never leaves the
        // registry empty in between.
        for folder in &event.added {
            self.add_workspace(&folder.uri);
        }
        for folder in &event.removed {
            match folder.uri.to_file_path() {
                Ok(root) => self.registry.remove(&root),
                Err(()) => tracing::warn!(uri = %folder.uri, "removed folder is not a file URI"),
            }
        }
    }

    fn on_did_open(&mut self, item: TextDocumentItem) {
        let Some((root_state, workspace)) = self.registry.resolve(&item.uri) else {
            tracing::error!(uri = %item.uri, "no workspace registered, dropping didOpen");
            return;
        };
        if let Err(err) = self.prover.workspace_apply(&item.uri, &workspace) {
            tracing::warn!(uri = %item.uri, %err, "workspace apply failed");
        }
        let doc = Document::new(item.uri, item.version, item.text, workspace, root_state);
        self.store.create(doc);
    }

    fn on_did_change(&mut self, params: DidChangeParams) {
        let uri = params.text_document.uri;
        let version = params.text_document.version;
        let mut changes = params.content_changes;
        if changes.len() > 1 {
            // Full sync is advertised; some clients batch anyway.
            tracing::warn!(
                uri = %uri,
                count = changes.len(),
                "multiple content changes with full sync, using the first"
            );
        }
        let Some(first) = changes.drain(..).next() else {
            tracing::warn!(uri = %uri, "didChange without content changes");
            return;
        };

        if self.store.change(&uri, version, first.text) == ChangeOutcome::Applied {
            for req in self.table.invalidate_on_change(&uri, version) {
                self.outgoing
                    .respond_err(&req.id, &RpcError::request_got_old());
            }
        }
    }

    fn on_did_close(&mut self, uri: &Url) {
        let last_version = self.store.get(uri).map(Document::version);
        if !self.store.close(uri) {
            return;
        }
        if let Some(version) = last_version {
            // Clear stale squiggles client-side.
            self.outgoing.publish_diagnostics(uri, version, &[]);
        }
        for req in self.table.invalidate_on_close(uri) {
            self.outgoing
                .respond_err(&req.id, &RpcError::request_got_old());
        }
    }

    // ── requests ───────────────────────────────────────────────────────

    fn on_request(&mut self, id: crate::protocol::RequestId, method: String, params: Value) {
        match handlers::dispatch::<P>(&method, &params) {
            Dispatch::Immediate(result) => self.outgoing.respond_result(&id, result),
            Dispatch::Data(descriptor) => {
                let req = PendingRequest {
                    id,
                    method,
                    uri: descriptor.uri,
                    scope: descriptor.scope,
                    handler: descriptor.handler,
                    params: descriptor.params,
                };
                let doc = self.store.get(&req.uri);
                match self.table.admit(req, doc) {
                    Admit::Now(req) => self.serve(req),
                    Admit::Postponed => {}
                    Admit::Reject(req, error) => self.outgoing.respond_err(&req.id, &error),
                }
            }
        }
    }

    /// Run a handler against the current document snapshot and reply. A
    /// panicking handler is an internal error, never a dead worker.
    fn serve(&mut self, req: PendingRequest<P>) {
        let result = {
            let Some(doc) = self.store.get(&req.uri) else {
                self.outgoing
                    .respond_err(&req.id, &RpcError::document_not_ready());
                return;
            };
            let cx = HandlerCx {
                prover: &self.prover,
                doc,
                params: &req.params,
            };
            match panic::catch_unwind(AssertUnwindSafe(|| (req.handler)(&cx))) {
                Ok(result) => result,
                Err(_) => {
                    tracing::error!(method = %req.method, id = %req.id, "handler panicked");
                    Err(RpcError::internal("internal error"))
                }
            }
        };
        self.outgoing.respond_result(&req.id, result);
        self.store.touch(&req.uri);
    }

    // ── prover slices ──────────────────────────────────────────────────

    /// Give the prover one bounded slice on the most relevant document.
    /// Runs only when the queue is empty; clears the interrupt flag so the
    /// slice starts fresh.
    pub(crate) fn step_once(&mut self) {
        self.interrupt.clear();
        let Some(uri) = self.store.any_active() else {
            return;
        };
        let report = {
            let Some(doc) = self.store.get_mut(&uri) else {
                return;
            };
            doc.step(&self.prover)
        };
        match report.outcome {
            StepOutcome::Suspended => {}
            StepOutcome::Progressed => {
                if self.settings.eager_diagnostics && !report.fresh.is_empty() {
                    self.publish_current_diagnostics(&uri);
                }
            }
            StepOutcome::Completed => {
                self.publish_current_diagnostics(&uri);
                self.drain_ready(&uri);
            }
        }
    }

    fn publish_current_diagnostics(&self, uri: &Url) {
        if let Some(doc) = self.store.get(uri) {
            self.outgoing
                .publish_diagnostics(uri, doc.version(), &doc.diagnostics());
        }
    }

    /// After a document stops wanting slices, settle every postponed
    /// request that targets it. Diagnostics for the version were published
    /// before this runs, so replies never precede them.
    fn drain_ready(&mut self, uri: &Url) {
        let (serve, cancel) = {
            let Some(doc) = self.store.get(uri) else {
                return;
            };
            self.table.drain_ready(uri, doc)
        };
        for (req, error) in cancel {
            self.outgoing.respond_err(&req.id, &error);
        }
        for req in serve {
            self.serve(req);
        }
    }
}

/// Run a server over the given byte streams until `exit` or EOF. Returns
/// the process exit code (0 iff `shutdown` preceded the end).
pub async fn run<P, R, W>(prover: P, cmdline: CmdLine, input: R, output: W) -> anyhow::Result<i32>
where
    P: Prover + Send + 'static,
    P::State: Send,
    P::Ast: Send,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let interrupt = prover.interrupt_flag().clone();
    let reader = scheduler::spawn_reader(input, inbound_tx, interrupt.clone());
    let writer = scheduler::spawn_writer(output, outbound_rx);
    let outgoing = Outgoing::new(outbound_tx);

    let server = Server::new(prover, cmdline, outgoing, interrupt);
    let code = tokio::task::spawn_blocking(move || scheduler::worker_loop(server, inbound_rx)).await?;

    // The worker is done; stop reading and let the writer drain the final
    // responses before reporting the exit code.
    reader.abort();
    let _ = writer.await;
    Ok(code)
}
