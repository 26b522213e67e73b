//! In-flight request tracking: admission, postponement, cancellation.
//!
//! A request that cannot be served yet (its document is still being
//! checked) parks in the postponement table keyed by id. It leaves the
//! table in exactly one of three ways — served after the document
//! completes, cancelled by the client, or invalidated by an edit/close —
//! and each exit produces exactly one reply. Requests are never coupled to
//! document lifetimes by ownership; invalidation enumerates ids and drives
//! them through the same cancel path as everything else.

use std::collections::HashMap;

use serde_json::Value;
use url::Url;

use qed_core::{Completion, Document, Position, Prover};

use crate::handlers::HandlerFn;
use crate::protocol::{RequestId, RpcError};

/// What a request targets within its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// A point in the document, optionally pinned to a version. With
    /// `postpone: false` the handler tolerates a partially checked
    /// document and is served immediately.
    Position {
        point: Position,
        version: Option<i32>,
        postpone: bool,
    },
    /// The whole document; requires `Completion::Done`.
    Document,
}

/// An admitted request, either being served now or parked.
pub struct PendingRequest<P: Prover> {
    pub id: RequestId,
    pub method: String,
    pub uri: Url,
    pub scope: Scope,
    pub handler: HandlerFn<P>,
    pub params: Value,
}

impl<P: Prover> std::fmt::Debug for PendingRequest<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("uri", &self.uri.as_str())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Admission verdict.
#[derive(Debug)]
pub enum Admit<P: Prover> {
    /// Serve against the current document state.
    Now(PendingRequest<P>),
    /// Parked in the table until the document progresses.
    Postponed,
    /// Cannot be served, now or later.
    Reject(PendingRequest<P>, RpcError),
}

#[derive(Debug, Default)]
pub struct RequestTable<P: Prover> {
    postponed: HashMap<RequestId, PendingRequest<P>>,
}

impl<P: Prover> RequestTable<P> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            postponed: HashMap::new(),
        }
    }

    #[must_use]
    pub fn postponed_len(&self) -> usize {
        self.postponed.len()
    }

    #[must_use]
    pub fn is_postponed(&self, id: &RequestId) -> bool {
        self.postponed.contains_key(id)
    }

    /// Classify a request against its document.
    pub fn admit(&mut self, req: PendingRequest<P>, doc: Option<&Document<P>>) -> Admit<P> {
        let Some(doc) = doc else {
            return Admit::Reject(req, RpcError::document_not_ready());
        };
        match req.scope {
            Scope::Position { postpone: false, .. } => Admit::Now(req),
            Scope::Position {
                version: Some(v), ..
            } if v < doc.version() => Admit::Reject(req, RpcError::request_got_old()),
            Scope::Position {
                version: Some(v), ..
            } if v > doc.version() => self.park(req),
            // Document scope, or a position request naming the current (or
            // no) version: ready iff the check finished.
            _ => match doc.completion() {
                Completion::Done => Admit::Now(req),
                Completion::Stopped { .. } => Admit::Reject(req, RpcError::document_not_ready()),
                Completion::Yet { .. } => self.park(req),
            },
        }
    }

    fn park(&mut self, req: PendingRequest<P>) -> Admit<P> {
        tracing::debug!(id = %req.id, method = %req.method, "request postponed");
        self.postponed.insert(req.id.clone(), req);
        Admit::Postponed
    }

    /// Remove a postponed request (client `$/cancelRequest`). `None` means
    /// the id is unknown here — already served, or never postponed — and
    /// cancellation is a no-op.
    pub fn cancel(&mut self, id: &RequestId) -> Option<PendingRequest<P>> {
        let removed = self.postponed.remove(id);
        if removed.is_none() {
            tracing::debug!(%id, "cancel for id not in postponement table");
        }
        removed
    }

    /// Requests invalidated by an edit to `uri` at `new_version`: position
    /// requests pinned to an older (or unpinned, hence older) version.
    /// Document-scoped requests stay parked; they will be served against
    /// the new version once it completes.
    pub fn invalidate_on_change(&mut self, uri: &Url, new_version: i32) -> Vec<PendingRequest<P>> {
        self.extract(|req| {
            req.uri == *uri
                && match req.scope {
                    Scope::Position { version, .. } => version.map_or(true, |v| v < new_version),
                    Scope::Document => false,
                }
        })
    }

    /// All postponed requests for a closed document.
    pub fn invalidate_on_close(&mut self, uri: &Url) -> Vec<PendingRequest<P>> {
        self.extract(|req| req.uri == *uri)
    }

    /// All postponed requests, for the shutdown flush.
    pub fn take_all(&mut self) -> Vec<PendingRequest<P>> {
        self.postponed.drain().map(|(_, req)| req).collect()
    }

    /// Judge every parked request for `uri` after its document stopped
    /// wanting prover slices. Returns requests to serve and requests to
    /// cancel; requests pinned to a version the document has not reached
    /// stay parked.
    pub fn drain_ready(
        &mut self,
        uri: &Url,
        doc: &Document<P>,
    ) -> (Vec<PendingRequest<P>>, Vec<(PendingRequest<P>, RpcError)>) {
        let mut serve = Vec::new();
        let mut cancel = Vec::new();
        if doc.completion().is_done() {
            for req in self.extract(|req| {
                req.uri == *uri
                    && match req.scope {
                        Scope::Position { version, .. } => version.map_or(true, |v| v <= doc.version()),
                        Scope::Document => true,
                    }
            }) {
                match req.scope {
                    Scope::Position {
                        version: Some(v), ..
                    } if v < doc.version() => cancel.push((req, RpcError::request_got_old())),
                    _ => serve.push(req),
                }
            }
        } else {
            // Stopped: nothing parked here can ever be served.
            for req in self.extract(|req| req.uri == *uri) {
                cancel.push((req, RpcError::document_not_ready()));
            }
        }
        (serve, cancel)
    }

    fn extract(&mut self, mut pred: impl FnMut(&PendingRequest<P>) -> bool) -> Vec<PendingRequest<P>> {
        let ids: Vec<RequestId> = self
            .postponed
            .iter()
            .filter(|(_, req)| pred(req))
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.postponed.remove(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qed_core::Workspace;
    use qed_prover::BasicProver;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn null_handler(
        _cx: &crate::handlers::HandlerCx<'_, BasicProver>,
    ) -> Result<Value, RpcError> {
        Ok(Value::Null)
    }

    fn request(id: i64, uri: &str, scope: Scope) -> PendingRequest<BasicProver> {
        PendingRequest {
            id: RequestId::Number(id),
            method: "test/request".to_string(),
            uri: Url::parse(uri).unwrap(),
            scope,
            handler: null_handler,
            params: json!({}),
        }
    }

    fn position_scope(version: Option<i32>, postpone: bool) -> Scope {
        Scope::Position {
            point: Position::new(0, 0),
            version,
            postpone,
        }
    }

    fn document(text: &str, version: i32, checked: bool) -> (BasicProver, Document<BasicProver>) {
        let prover = BasicProver::new();
        let workspace = Arc::new(Workspace {
            root: PathBuf::from("/proj"),
            load_paths: Vec::new(),
            ml_includes: Vec::new(),
            preload: Vec::new(),
            flags: Default::default(),
            debug: false,
        });
        let mut doc = Document::new(
            Url::parse("file:///proj/a.v").unwrap(),
            version,
            text.to_string(),
            workspace,
            prover.root_state(),
        );
        if checked {
            doc.check_to_end(&prover);
        }
        (prover, doc)
    }

    #[test]
    fn test_admit_rejects_missing_document() {
        let mut table = RequestTable::new();
        let admit = table.admit(request(1, "file:///proj/a.v", Scope::Document), None);
        match admit {
            Admit::Reject(_, err) => assert_eq!(err, RpcError::document_not_ready()),
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[test]
    fn test_document_request_waits_for_done() {
        let mut table = RequestTable::new();
        let (_, unchecked) = document("Definition x := 1.", 1, false);
        match table.admit(request(1, "file:///proj/a.v", Scope::Document), Some(&unchecked)) {
            Admit::Postponed => {}
            other => panic!("expected postpone, got {other:?}"),
        }
        assert!(table.is_postponed(&RequestId::Number(1)));

        let (_, checked) = document("Definition x := 1.", 1, true);
        match table.admit(request(2, "file:///proj/a.v", Scope::Document), Some(&checked)) {
            Admit::Now(req) => assert_eq!(req.id, RequestId::Number(2)),
            other => panic!("expected now, got {other:?}"),
        }
    }

    #[test]
    fn test_non_postponing_position_served_on_partial_document() {
        let mut table = RequestTable::new();
        let (_, unchecked) = document("Definition x := 1.", 1, false);
        let admit = table.admit(
            request(1, "file:///proj/a.v", position_scope(Some(1), false)),
            Some(&unchecked),
        );
        assert!(matches!(admit, Admit::Now(_)));
    }

    #[test]
    fn test_stale_version_rejected() {
        let mut table = RequestTable::new();
        let (_, doc) = document("Definition x := 1.", 5, true);
        match table.admit(
            request(1, "file:///proj/a.v", position_scope(Some(4), true)),
            Some(&doc),
        ) {
            Admit::Reject(_, err) => assert_eq!(err, RpcError::request_got_old()),
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[test]
    fn test_future_version_parks() {
        let mut table = RequestTable::new();
        let (_, doc) = document("Definition x := 1.", 5, true);
        let admit = table.admit(
            request(1, "file:///proj/a.v", position_scope(Some(6), true)),
            Some(&doc),
        );
        assert!(matches!(admit, Admit::Postponed));
    }

    #[test]
    fn test_cancel_removes_once() {
        let mut table = RequestTable::new();
        let (_, unchecked) = document("Definition x := 1.", 1, false);
        let _ = table.admit(
            request(1, "file:///proj/a.v", position_scope(Some(1), true)),
            Some(&unchecked),
        );
        assert!(table.cancel(&RequestId::Number(1)).is_some());
        assert!(table.cancel(&RequestId::Number(1)).is_none());
        assert_eq!(table.postponed_len(), 0);
    }

    #[test]
    fn test_invalidate_on_change_cancels_older_positions_only() {
        let mut table = RequestTable::new();
        let (_, unchecked) = document("Definition x := 1.", 1, false);
        let uri = Url::parse("file:///proj/a.v").unwrap();
        let _ = table.admit(
            request(1, "file:///proj/a.v", position_scope(Some(1), true)),
            Some(&unchecked),
        );
        let _ = table.admit(
            request(2, "file:///proj/a.v", position_scope(None, true)),
            Some(&unchecked),
        );
        let _ = table.admit(
            request(3, "file:///proj/a.v", Scope::Document),
            Some(&unchecked),
        );
        let _ = table.admit(
            request(4, "file:///proj/a.v", position_scope(Some(2), true)),
            Some(&unchecked),
        );

        let stale = table.invalidate_on_change(&uri, 2);
        let mut ids: Vec<String> = stale.iter().map(|r| r.id.to_string()).collect();
        ids.sort();
        assert_eq!(ids, vec!["1", "2"]);
        // The document request and the version-2 request remain parked.
        assert_eq!(table.postponed_len(), 2);
    }

    #[test]
    fn test_invalidate_on_close_cancels_everything() {
        let mut table = RequestTable::new();
        let (_, unchecked) = document("Definition x := 1.", 1, false);
        let uri = Url::parse("file:///proj/a.v").unwrap();
        let _ = table.admit(
            request(1, "file:///proj/a.v", position_scope(Some(1), true)),
            Some(&unchecked),
        );
        let _ = table.admit(
            request(2, "file:///proj/a.v", Scope::Document),
            Some(&unchecked),
        );
        assert_eq!(table.invalidate_on_close(&uri).len(), 2);
        assert_eq!(table.postponed_len(), 0);
    }

    #[test]
    fn test_drain_ready_serves_current_and_cancels_stale() {
        let mut table = RequestTable::new();
        let uri = Url::parse("file:///proj/a.v").unwrap();
        let (_, unchecked) = document("Definition x := 1.", 2, false);
        let _ = table.admit(
            request(1, "file:///proj/a.v", position_scope(Some(2), true)),
            Some(&unchecked),
        );
        let _ = table.admit(
            request(2, "file:///proj/a.v", Scope::Document),
            Some(&unchecked),
        );
        let _ = table.admit(
            request(3, "file:///proj/a.v", position_scope(Some(3), true)),
            Some(&unchecked),
        );

        let (_, done) = document("Definition x := 1.", 2, true);
        let (serve, cancel) = table.drain_ready(&uri, &done);
        let mut served: Vec<String> = serve.iter().map(|r| r.id.to_string()).collect();
        served.sort();
        assert_eq!(served, vec!["1", "2"]);
        assert!(cancel.is_empty());
        // Request pinned to version 3 stays parked.
        assert_eq!(table.postponed_len(), 1);
    }

    #[test]
    fn test_drain_ready_on_stopped_document_cancels() {
        let mut table = RequestTable::new();
        let uri = Url::parse("file:///proj/a.v").unwrap();
        let (_, unchecked) = document("Lemma incomplete", 1, false);
        let _ = table.admit(
            request(1, "file:///proj/a.v", position_scope(Some(1), true)),
            Some(&unchecked),
        );

        // "Lemma incomplete" has no terminating dot: checking stops.
        let (_, stopped) = document("Lemma incomplete", 1, true);
        assert!(matches!(
            stopped.completion(),
            Completion::Stopped { .. }
        ));
        let (serve, cancel) = table.drain_ready(&uri, &stopped);
        assert!(serve.is_empty());
        assert_eq!(cancel.len(), 1);
        assert_eq!(cancel[0].1, RpcError::document_not_ready());
    }

    #[test]
    fn test_take_all() {
        let mut table = RequestTable::new();
        let (_, unchecked) = document("Definition x := 1.", 1, false);
        for id in 1..=3 {
            let _ = table.admit(
                request(id, "file:///proj/a.v", position_scope(None, true)),
                Some(&unchecked),
            );
        }
        assert_eq!(table.take_all().len(), 3);
        assert_eq!(table.postponed_len(), 0);
    }
}
