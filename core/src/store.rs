//! URI → document map with a most-recently-touched scheduling order.

use std::collections::HashMap;

use url::Url;

use crate::document::Document;
use crate::prover::Prover;

/// Result of applying a `didChange` to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    Applied,
    /// Version at or below the current one; nothing happened.
    Ignored,
    /// No document is open at that URI.
    Unknown,
}

/// Owns every open document. `any_active` prefers the most recently
/// touched document so prover time follows user focus.
pub struct DocumentStore<P: Prover> {
    docs: HashMap<Url, Document<P>>,
    /// Most recently touched first.
    order: Vec<Url>,
}

impl<P: Prover> Default for DocumentStore<P> {
    fn default() -> Self {
        Self {
            docs: HashMap::new(),
            order: Vec::new(),
        }
    }
}

impl<P: Prover> DocumentStore<P> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, uri: &Url) -> Option<&Document<P>> {
        self.docs.get(uri)
    }

    #[must_use]
    pub fn get_mut(&mut self, uri: &Url) -> Option<&mut Document<P>> {
        self.docs.get_mut(uri)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Insert a fresh document, discarding any previous one at the URI.
    pub fn create(&mut self, doc: Document<P>) {
        let uri = doc.uri().clone();
        if self.docs.insert(uri.clone(), doc).is_some() {
            // didOpen over an already-open document is a client bug.
            tracing::warn!(%uri, "didOpen replaced an already-open document");
        }
        self.touch(&uri);
    }

    pub fn change(&mut self, uri: &Url, new_version: i32, new_text: String) -> ChangeOutcome {
        let Some(doc) = self.docs.get_mut(uri) else {
            tracing::warn!(%uri, "didChange for unknown document");
            return ChangeOutcome::Unknown;
        };
        if !doc.change(new_version, new_text) {
            return ChangeOutcome::Ignored;
        }
        self.touch(uri);
        ChangeOutcome::Applied
    }

    pub fn close(&mut self, uri: &Url) -> bool {
        self.order.retain(|u| u != uri);
        if self.docs.remove(uri).is_none() {
            tracing::warn!(%uri, "didClose for unknown document");
            return false;
        }
        true
    }

    /// Move a URI to the front of the scheduling order.
    pub fn touch(&mut self, uri: &Url) {
        self.order.retain(|u| u != uri);
        self.order.insert(0, uri.clone());
    }

    /// A URI whose document still wants prover slices, most recently
    /// touched first.
    #[must_use]
    pub fn any_active(&self) -> Option<Url> {
        self.order
            .iter()
            .find(|uri| {
                self.docs
                    .get(uri)
                    .is_some_and(|doc| doc.completion().is_active())
            })
            .cloned()
    }
}
