//! Per-URI document state and the incremental check stepper.
//!
//! A document owns the client text at one version plus the prefix of it the
//! prover has checked so far. The check continuation is the pair (resume
//! offset, state after the last node): [`Document::step`] consumes one
//! top-level unit, appends a [`Node`], and reports what to publish. All
//! prover calls go through [`protect`], so a prover panic lands in the
//! node's diagnostics and an interrupt suspends the step without losing the
//! offset.

use std::sync::Arc;

use url::Url;

use crate::diagnostic::Diagnostic;
use crate::prover::{protect, Protected, Prover};
use crate::span::{LineIndex, Position, Range, Span};
use crate::workspace::Workspace;

/// How much of the document the checked prefix covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Checking continues from `offset`.
    Yet { offset: usize },
    /// Checking cannot proceed past `offset`; terminal until the next edit.
    Stopped { offset: usize, reason: String },
    /// The checked prefix covers the whole text.
    Done,
}

impl Completion {
    /// Whether the document still wants prover slices.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Yet { .. })
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// One checked unit: its span, the opaque AST, the prover state after it,
/// and whatever diagnostics checking it produced.
pub struct Node<P: Prover> {
    pub span: Span,
    pub ast: P::Ast,
    pub state: P::State,
    pub diagnostics: Vec<Diagnostic>,
}

/// Outcome of one check slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A node was appended; the document is still `Yet`.
    Progressed,
    /// The interrupt flag was observed; offset unchanged.
    Suspended,
    /// No further stepping: the document is `Done` or `Stopped`.
    Completed,
}

/// What a step produced, for the caller to publish.
#[derive(Debug)]
pub struct StepReport {
    pub outcome: StepOutcome,
    /// Diagnostics appended by this step (not the cumulative set).
    pub fresh: Vec<Diagnostic>,
}

impl StepReport {
    fn completed() -> Self {
        Self {
            outcome: StepOutcome::Completed,
            fresh: Vec::new(),
        }
    }
}

pub struct Document<P: Prover> {
    uri: Url,
    version: i32,
    text: String,
    line_index: LineIndex,
    workspace: Arc<Workspace>,
    /// State the continuation was seeded from (the workspace root state).
    base: P::State,
    nodes: Vec<Node<P>>,
    completion: Completion,
}

impl<P: Prover> Document<P> {
    #[must_use]
    pub fn new(
        uri: Url,
        version: i32,
        text: String,
        workspace: Arc<Workspace>,
        base: P::State,
    ) -> Self {
        let line_index = LineIndex::new(&text);
        Self {
            uri,
            version,
            text,
            line_index,
            workspace,
            base,
            nodes: Vec::new(),
            completion: Completion::Yet { offset: 0 },
        }
    }

    #[must_use]
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    #[must_use]
    pub fn version(&self) -> i32 {
        self.version
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    #[must_use]
    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    #[must_use]
    pub fn nodes(&self) -> &[Node<P>] {
        &self.nodes
    }

    /// Replace text and version. A version at or below the current one is
    /// ignored (client bug or reordered delivery) and reported as such.
    pub fn change(&mut self, new_version: i32, new_text: String) -> bool {
        if new_version <= self.version {
            tracing::warn!(
                uri = %self.uri,
                current = self.version,
                proposed = new_version,
                "ignoring non-monotone didChange"
            );
            return false;
        }
        self.version = new_version;
        self.line_index = LineIndex::new(&new_text);
        self.text = new_text;
        self.nodes.clear();
        self.completion = Completion::Yet { offset: 0 };
        true
    }

    /// Prover state after the checked prefix.
    #[must_use]
    pub fn current_state(&self) -> &P::State {
        self.nodes.last().map_or(&self.base, |node| &node.state)
    }

    /// Prover state in effect at `offset`: the post-state of the last node
    /// that ends at or before it.
    #[must_use]
    pub fn state_at(&self, offset: usize) -> &P::State {
        self.nodes
            .iter()
            .rev()
            .find(|node| node.span.end <= offset)
            .map_or(&self.base, |node| &node.state)
    }

    /// The node whose span contains `offset`.
    #[must_use]
    pub fn node_at(&self, offset: usize) -> Option<&Node<P>> {
        self.nodes.iter().find(|node| node.span.contains(offset))
    }

    #[must_use]
    pub fn position_to_offset(&self, pos: Position) -> usize {
        self.line_index.offset(&self.text, pos)
    }

    #[must_use]
    pub fn range_of(&self, span: Span) -> Range {
        self.line_index.range(&self.text, span)
    }

    /// The cumulative diagnostic set for publication, including the stop
    /// reason when checking could not finish.
    #[must_use]
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        let mut all: Vec<Diagnostic> = self
            .nodes
            .iter()
            .flat_map(|node| node.diagnostics.iter().cloned())
            .collect();
        if let Completion::Stopped { offset, reason } = &self.completion {
            let span = Span::new(*offset, self.text.len());
            all.push(Diagnostic::error(self.range_of(span), reason.clone()));
        }
        all
    }

    /// Execute one bounded slice of the check continuation.
    pub fn step(&mut self, prover: &P) -> StepReport {
        let offset = match self.completion {
            Completion::Yet { offset } => offset,
            Completion::Stopped { .. } | Completion::Done => return StepReport::completed(),
        };

        let parsed = match protect(|| prover.parse_next(&self.text, offset, self.current_state())) {
            Protected::Interrupted => {
                return StepReport {
                    outcome: StepOutcome::Suspended,
                    fresh: Vec::new(),
                }
            }
            Protected::Failed(reason) => {
                tracing::debug!(uri = %self.uri, offset, %reason, "check stopped");
                self.completion = Completion::Stopped { offset, reason };
                return StepReport::completed();
            }
            Protected::Value(None) => {
                self.completion = Completion::Done;
                return StepReport::completed();
            }
            Protected::Value(Some(parsed)) => parsed,
        };

        if parsed.next_offset <= offset {
            // A stalled parser would spin the worker forever.
            self.completion = Completion::Stopped {
                offset,
                reason: "parser made no progress".into(),
            };
            return StepReport::completed();
        }

        let sentence_range = self.range_of(parsed.span);
        let (state, diagnostics) =
            match protect(|| prover.interpret(self.current_state(), &parsed.ast)) {
                Protected::Interrupted => {
                    // Discard the parse; the same unit is re-parsed on resume.
                    return StepReport {
                        outcome: StepOutcome::Suspended,
                        fresh: Vec::new(),
                    };
                }
                Protected::Failed(message) => (
                    self.current_state().clone(),
                    vec![Diagnostic::error(sentence_range, message)],
                ),
                Protected::Value(interpreted) => {
                    let diagnostics = interpreted
                        .messages
                        .into_iter()
                        .map(|msg| {
                            let range = msg.span.map_or(sentence_range, |s| self.range_of(s));
                            Diagnostic::new(range, msg.severity, msg.text)
                        })
                        .collect();
                    (interpreted.state, diagnostics)
                }
            };

        self.nodes.push(Node {
            span: parsed.span,
            ast: parsed.ast,
            state,
            diagnostics: diagnostics.clone(),
        });
        self.completion = Completion::Yet {
            offset: parsed.next_offset,
        };
        StepReport {
            outcome: StepOutcome::Progressed,
            fresh: diagnostics,
        }
    }

    /// Step until the document is no longer `Yet`. Test and batch helper;
    /// the scheduler steps one slice at a time.
    pub fn check_to_end(&mut self, prover: &P) {
        while self.completion.is_active() {
            if self.step(prover).outcome == StepOutcome::Suspended {
                break;
            }
        }
    }
}

/// Word-at-a-time test prover shared by the core unit tests.
#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::diagnostic::Severity;
    use crate::prover::{Interpreted, InterruptFlag, Parsed, ProverError, ProverMessage};
    use crate::workspace::ProverFlags;
    use std::path::PathBuf;

    /// Every whitespace-separated word is a unit; words starting with `bad`
    /// fail; `boom` panics; words starting with `warn` emit a warning.
    pub(crate) struct TrivialProver {
        pub(crate) flag: InterruptFlag,
    }

    impl TrivialProver {
        pub(crate) fn new() -> Self {
            Self {
                flag: InterruptFlag::new(),
            }
        }
    }

    impl Prover for TrivialProver {
        type State = usize;
        type Ast = String;

        fn root_state(&self) -> usize {
            0
        }

        fn workspace_guess(
            &self,
            root: &std::path::Path,
            _cmdline: &crate::workspace::CmdLine,
        ) -> Result<Workspace, ProverError> {
            Ok(plain_workspace(root.to_path_buf()))
        }

        fn workspace_apply(&self, _uri: &Url, _workspace: &Workspace) -> Result<(), ProverError> {
            Ok(())
        }

        fn parse_next(
            &self,
            text: &str,
            offset: usize,
            _state: &usize,
        ) -> Result<Option<Parsed<String>>, ProverError> {
            if self.flag.is_set() {
                return Err(ProverError::Interrupted);
            }
            let rest = &text[offset..];
            let skip = rest.len() - rest.trim_start().len();
            let start = offset + skip;
            if start == text.len() {
                return Ok(None);
            }
            let word: String = text[start..]
                .chars()
                .take_while(|c| !c.is_whitespace())
                .collect();
            let end = start + word.len();
            Ok(Some(Parsed {
                ast: word,
                span: Span::new(start, end),
                next_offset: end,
            }))
        }

        fn interpret(&self, state: &usize, ast: &String) -> Result<Interpreted<usize>, ProverError> {
            if ast == "boom" {
                panic!("boom");
            }
            if ast.starts_with("bad") {
                return Err(ProverError::failure(format!("cannot check {ast}")));
            }
            let messages = if ast.starts_with("warn") {
                vec![ProverMessage {
                    severity: Severity::Warning,
                    text: format!("{ast} is suspicious"),
                    span: None,
                }]
            } else {
                Vec::new()
            };
            Ok(Interpreted {
                state: state + 1,
                messages,
            })
        }

        fn interrupt_flag(&self) -> &InterruptFlag {
            &self.flag
        }
    }

    pub(crate) fn plain_workspace(root: PathBuf) -> Workspace {
        Workspace {
            root,
            load_paths: Vec::new(),
            ml_includes: Vec::new(),
            preload: Vec::new(),
            flags: ProverFlags::default(),
            debug: false,
        }
    }

    pub(crate) fn doc_with_text(uri: &str, version: i32, text: &str) -> Document<TrivialProver> {
        let workspace = Arc::new(plain_workspace(PathBuf::from("/proj")));
        Document::new(
            Url::parse(uri).unwrap(),
            version,
            text.to_string(),
            workspace,
            0,
        )
    }
}
