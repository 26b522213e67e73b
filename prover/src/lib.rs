//! Reference prover for qed-ls.
//!
//! A deliberately small vernacular checker: enough real behavior (an
//! environment of named constants, an open-proof stack, failure recovery,
//! `Fail` expectations) to exercise every coordinator path without
//! pretending to be a kernel. It polls the interrupt flag at sentence
//! granularity, which is the cooperative-checkpoint contract the scheduler
//! relies on.

pub mod parse;

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use url::Url;

use qed_core::{
    CmdLine, Interpreted, InterruptFlag, LoadPath, OutlineEntry, OutlineKind, Parsed, PpFormat,
    Prover, ProverError, ProverMessage, Severity, Workspace,
};

use crate::parse::scan_sentence;

/// Project file probed by `workspace_guess`, same line syntax as the
/// `-R`/`-Q`/`-I` command-line options.
const PROJECT_FILE: &str = "_QedProject";

/// Artifact extension written by `save_artifact`.
const OBJECT_EXT: &str = "vo";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DefKind {
    Definition,
    Theorem,
}

/// One entry on the open-proof stack.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OpenProof {
    name: String,
    statement: String,
}

/// Prover document state: cheap to clone, one snapshot per checked node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProofState {
    env: BTreeMap<String, DefKind>,
    proofs: Vec<OpenProof>,
}

impl ProofState {
    #[must_use]
    pub fn defined(&self, name: &str) -> bool {
        self.env.contains_key(name)
    }

    #[must_use]
    pub fn open_proofs(&self) -> usize {
        self.proofs.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closer {
    Qed,
    Admitted,
    Defined,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum VernacKind {
    Definition { name: String },
    Theorem { name: String, statement: String },
    ProofStart,
    ProofEnd { closer: Closer },
    Require { modules: Vec<String> },
    Fail { inner: Box<VernacKind> },
    Tactic,
}

/// One classified sentence. Opaque to the coordinator.
#[derive(Debug, Clone)]
pub struct Vernac {
    kind: VernacKind,
    text: String,
}

impl Vernac {
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }
}

fn ident(token: &str) -> String {
    token
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '\'')
        .collect()
}

fn classify(sentence: &str) -> VernacKind {
    let body = sentence.trim().trim_end_matches('.').trim();
    let mut words = body.split_whitespace();
    let Some(head) = words.next() else {
        return VernacKind::Tactic;
    };
    match head {
        "Definition" | "Fixpoint" | "Notation" => {
            let name = words.next().map(ident).unwrap_or_default();
            VernacKind::Definition { name }
        }
        "Lemma" | "Theorem" | "Example" | "Corollary" | "Fact" | "Remark" => {
            let name = words.next().map(ident).unwrap_or_default();
            let statement = body
                .split_once(':')
                .map_or_else(String::new, |(_, stmt)| stmt.trim().to_string());
            VernacKind::Theorem { name, statement }
        }
        "Proof" => VernacKind::ProofStart,
        "Qed" => VernacKind::ProofEnd {
            closer: Closer::Qed,
        },
        "Admitted" => VernacKind::ProofEnd {
            closer: Closer::Admitted,
        },
        "Defined" => VernacKind::ProofEnd {
            closer: Closer::Defined,
        },
        "Require" => {
            let modules = words
                .filter(|w| *w != "Import" && *w != "Export")
                .map(str::to_string)
                .collect();
            VernacKind::Require { modules }
        }
        "Fail" => {
            let rest = body["Fail".len()..].trim();
            VernacKind::Fail {
                inner: Box::new(classify(rest)),
            }
        }
        _ => VernacKind::Tactic,
    }
}

/// The reference prover. One instance per server; not reentrant, driven
/// only from the worker context.
#[derive(Debug, Default)]
pub struct BasicProver {
    interrupt: InterruptFlag,
}

impl BasicProver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn check_interrupt(&self) -> Result<(), ProverError> {
        if self.interrupt.is_set() {
            return Err(ProverError::Interrupted);
        }
        Ok(())
    }

    fn eval(&self, state: &ProofState, kind: &VernacKind, text: &str) -> EvalResult {
        match kind {
            VernacKind::Definition { name } => {
                if name.is_empty() {
                    return EvalResult::fail("expected a name after the keyword");
                }
                if state.defined(name) {
                    return EvalResult::fail(format!("{name} already exists"));
                }
                let mut next = state.clone();
                next.env.insert(name.clone(), DefKind::Definition);
                EvalResult::ok(next)
            }
            VernacKind::Theorem { name, statement } => {
                if name.is_empty() {
                    return EvalResult::fail("expected a name after the keyword");
                }
                if state.defined(name) {
                    return EvalResult::fail(format!("{name} already exists"));
                }
                let mut next = state.clone();
                next.env.insert(name.clone(), DefKind::Theorem);
                next.proofs.push(OpenProof {
                    name: name.clone(),
                    statement: statement.clone(),
                });
                EvalResult::ok(next)
            }
            VernacKind::ProofStart => {
                if state.proofs.is_empty() {
                    EvalResult::fail("no statement to prove")
                } else {
                    EvalResult::ok(state.clone())
                }
            }
            VernacKind::ProofEnd { closer } => {
                let mut next = state.clone();
                if next.proofs.pop().is_none() {
                    return EvalResult::fail("no proof in progress");
                }
                let mut result = EvalResult::ok(next);
                if *closer == Closer::Admitted {
                    result.messages.push(ProverMessage {
                        severity: Severity::Warning,
                        text: "declared admitted, not proved".to_string(),
                        span: None,
                    });
                }
                result
            }
            VernacKind::Require { modules } => {
                let mut result = EvalResult::ok(state.clone());
                result.messages.push(ProverMessage {
                    severity: Severity::Information,
                    text: format!("required: {}", modules.join(", ")),
                    span: None,
                });
                result
            }
            VernacKind::Fail { inner } => match self.eval(state, inner, text) {
                EvalResult {
                    error: Some(_), ..
                } => {
                    let mut result = EvalResult::ok(state.clone());
                    result.messages.push(ProverMessage {
                        severity: Severity::Information,
                        text: "the command has indeed failed".to_string(),
                        span: None,
                    });
                    result
                }
                _ => EvalResult::fail("the command succeeded, but was expected to fail"),
            },
            VernacKind::Tactic => {
                if state.proofs.is_empty() {
                    let head = text.split_whitespace().next().unwrap_or("<empty>");
                    EvalResult::fail(format!("unknown vernacular: {head}"))
                } else {
                    EvalResult::ok(state.clone())
                }
            }
        }
    }
}

/// Evaluation result before it is shaped into the trait's types: either a
/// next state or an error message, plus side messages.
struct EvalResult {
    state: Option<ProofState>,
    error: Option<String>,
    messages: Vec<ProverMessage>,
}

impl EvalResult {
    fn ok(state: ProofState) -> Self {
        Self {
            state: Some(state),
            error: None,
            messages: Vec::new(),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            state: None,
            error: Some(message.into()),
            messages: Vec::new(),
        }
    }
}

impl Prover for BasicProver {
    type State = ProofState;
    type Ast = Vernac;

    fn root_state(&self) -> ProofState {
        ProofState::default()
    }

    fn workspace_guess(&self, root: &Path, cmdline: &CmdLine) -> Result<Workspace, ProverError> {
        let mut load_paths = cmdline.load_paths.clone();
        let mut ml_includes = cmdline.ml_includes.clone();

        match read_project_file(&root.join(PROJECT_FILE)) {
            Ok(Some(lines)) => {
                for line in lines {
                    apply_project_line(root, &line, &mut load_paths, &mut ml_includes);
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(root = %root.display(), %err, "unreadable project file, using defaults");
            }
        }

        // The root itself is always reachable without a logical prefix.
        load_paths.push(LoadPath {
            logical: String::new(),
            dir: root.to_path_buf(),
            implicit: true,
            recursive: true,
        });

        Ok(Workspace {
            root: root.to_path_buf(),
            load_paths,
            ml_includes,
            preload: cmdline.preload.clone(),
            flags: cmdline.flags,
            debug: cmdline.debug,
        })
    }

    fn workspace_apply(&self, uri: &Url, workspace: &Workspace) -> Result<(), ProverError> {
        tracing::debug!(%uri, digest = workspace.digest(), "workspace applied");
        Ok(())
    }

    fn parse_next(
        &self,
        text: &str,
        offset: usize,
        _state: &ProofState,
    ) -> Result<Option<Parsed<Vernac>>, ProverError> {
        self.check_interrupt()?;
        let Some(sentence) = scan_sentence(text, offset).map_err(|e| ProverError::failure(e.to_string()))?
        else {
            return Ok(None);
        };
        let raw = &text[sentence.span.start..sentence.span.end];
        Ok(Some(Parsed {
            ast: Vernac {
                kind: classify(raw),
                text: raw.to_string(),
            },
            span: sentence.span,
            next_offset: sentence.next_offset,
        }))
    }

    fn interpret(
        &self,
        state: &ProofState,
        ast: &Vernac,
    ) -> Result<Interpreted<ProofState>, ProverError> {
        self.check_interrupt()?;
        let result = self.eval(state, &ast.kind, &ast.text);
        match (result.state, result.error) {
            (Some(next), None) => Ok(Interpreted {
                state: next,
                messages: result.messages,
            }),
            (_, Some(error)) => Err(ProverError::Failure(error)),
            (None, None) => Err(ProverError::failure("evaluation produced no result")),
        }
    }

    fn interrupt_flag(&self) -> &InterruptFlag {
        &self.interrupt
    }

    fn outline(&self, ast: &Vernac) -> Option<OutlineEntry> {
        match &ast.kind {
            VernacKind::Definition { name } if !name.is_empty() => Some(OutlineEntry {
                name: name.clone(),
                kind: OutlineKind::Definition,
                detail: None,
            }),
            VernacKind::Theorem { name, statement } if !name.is_empty() => Some(OutlineEntry {
                name: name.clone(),
                kind: OutlineKind::Theorem,
                detail: (!statement.is_empty()).then(|| statement.clone()),
            }),
            _ => None,
        }
    }

    fn names(&self, state: &ProofState) -> Vec<String> {
        state.env.keys().cloned().collect()
    }

    fn goals(&self, state: &ProofState, format: PpFormat) -> Option<String> {
        if state.proofs.is_empty() {
            return None;
        }
        let rendered = match format {
            PpFormat::Pp => state
                .proofs
                .iter()
                .rev()
                .enumerate()
                .map(|(i, proof)| format!("Goal {} ({}):\n  {}", i + 1, proof.name, proof.statement))
                .collect::<Vec<_>>()
                .join("\n\n"),
            PpFormat::Str => state
                .proofs
                .iter()
                .rev()
                .map(|proof| proof.statement.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        };
        Some(rendered)
    }

    fn save_artifact(&self, uri: &Url, state: &ProofState) -> Result<(), ProverError> {
        if !state.proofs.is_empty() {
            return Err(ProverError::failure(format!(
                "cannot save: {} proof(s) still open",
                state.proofs.len()
            )));
        }
        let path = uri
            .to_file_path()
            .map_err(|()| ProverError::failure(format!("not a file URI: {uri}")))?;
        let object = path.with_extension(OBJECT_EXT);
        let body = format!(
            "qed object v1\nsource: {}\nconstants: {}\n",
            path.display(),
            state.env.len()
        );
        fs::write(&object, body)
            .map_err(|e| ProverError::failure(format!("writing {}: {e}", object.display())))?;
        tracing::debug!(object = %object.display(), "artifact saved");
        Ok(())
    }

    fn flush_cache(&self) {
        tracing::debug!("cache flush requested (nothing to flush)");
    }
}

fn read_project_file(path: &Path) -> std::io::Result<Option<Vec<String>>> {
    let mut file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    Ok(Some(contents.lines().map(str::to_string).collect()))
}

fn apply_project_line(
    root: &Path,
    line: &str,
    load_paths: &mut Vec<LoadPath>,
    ml_includes: &mut Vec<std::path::PathBuf>,
) {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return;
    }
    let mut words = line.split_whitespace();
    match words.next() {
        Some("-R" | "-Q") => {
            let recursive = line.starts_with("-R");
            let (Some(dir), Some(logical)) = (words.next(), words.next()) else {
                tracing::warn!(%line, "malformed load path line in project file");
                return;
            };
            load_paths.push(LoadPath {
                logical: logical.to_string(),
                dir: root.join(dir),
                implicit: false,
                recursive,
            });
        }
        Some("-I") => {
            if let Some(dir) = words.next() {
                ml_includes.push(root.join(dir));
            }
        }
        Some(other) => {
            tracing::debug!(option = other, "ignoring project file option");
        }
        None => {}
    }
}
