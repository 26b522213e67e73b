//! Workspace descriptions and the root → workspace registry.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use url::Url;

/// One logical ↔ filesystem load path binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoadPath {
    pub logical: String,
    pub dir: PathBuf,
    /// Bindings reachable without naming the logical prefix.
    pub implicit: bool,
    pub recursive: bool,
}

/// Kernel flags fixed per workspace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ProverFlags {
    pub indices_matter: bool,
    pub impredicative_set: bool,
}

/// Template the server was started with; `workspace_guess` merges it with
/// whatever it finds under a root.
#[derive(Debug, Clone, Default)]
pub struct CmdLine {
    pub load_paths: Vec<LoadPath>,
    pub ml_includes: Vec<PathBuf>,
    pub preload: Vec<String>,
    pub flags: ProverFlags,
    pub debug: bool,
}

/// Immutable description of how to prepare the prover for files under one
/// root directory. Created once by `workspace_guess`, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Workspace {
    pub root: PathBuf,
    pub load_paths: Vec<LoadPath>,
    pub ml_includes: Vec<PathBuf>,
    pub preload: Vec<String>,
    pub flags: ProverFlags,
    pub debug: bool,
}

impl Workspace {
    /// 64-bit digest of the structural content, for cache keys and logs.
    #[must_use]
    pub fn digest(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Insertion-ordered mapping from workspace root to [`Workspace`], plus the
/// command-line template and the prover's root state snapshot.
///
/// `add` prepends, so the most recently added root wins a prefix tie.
#[derive(Debug)]
pub struct WorkspaceRegistry<S> {
    entries: Vec<(PathBuf, Arc<Workspace>)>,
    cmdline: CmdLine,
    root_state: S,
}

impl<S: Clone> WorkspaceRegistry<S> {
    #[must_use]
    pub fn new(cmdline: CmdLine, root_state: S) -> Self {
        Self {
            entries: Vec::new(),
            cmdline,
            root_state,
        }
    }

    #[must_use]
    pub fn cmdline(&self) -> &CmdLine {
        &self.cmdline
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn roots(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(|(root, _)| root.as_path())
    }

    pub fn add(&mut self, root: PathBuf, workspace: Workspace) {
        tracing::debug!(root = %root.display(), digest = workspace.digest(), "workspace added");
        self.entries.retain(|(existing, _)| *existing != root);
        self.entries.insert(0, (root, Arc::new(workspace)));
    }

    pub fn remove(&mut self, root: &Path) {
        let before = self.entries.len();
        self.entries.retain(|(existing, _)| existing != root);
        if self.entries.len() == before {
            tracing::debug!(root = %root.display(), "remove of unknown workspace root");
        }
    }

    /// First entry whose root is a path prefix of the file; on a miss, the
    /// first entry with a warning. `None` only when the registry is empty.
    pub fn resolve(&self, uri: &Url) -> Option<(S, Arc<Workspace>)> {
        let path = uri.to_file_path().ok();
        if let Some(path) = &path {
            for (root, workspace) in &self.entries {
                if path.starts_with(root) {
                    return Some((self.root_state.clone(), Arc::clone(workspace)));
                }
            }
        }
        let (root, workspace) = self.entries.first()?;
        tracing::warn!(
            uri = %uri,
            fallback = %root.display(),
            "file outside every workspace root, using first registered workspace"
        );
        Some((self.root_state.clone(), Arc::clone(workspace)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace(root: &str) -> Workspace {
        Workspace {
            root: PathBuf::from(root),
            load_paths: vec![LoadPath {
                logical: "Top".into(),
                dir: PathBuf::from(root),
                implicit: true,
                recursive: true,
            }],
            ml_includes: Vec::new(),
            preload: Vec::new(),
            flags: ProverFlags::default(),
            debug: false,
        }
    }

    fn registry() -> WorkspaceRegistry<u32> {
        WorkspaceRegistry::new(CmdLine::default(), 7)
    }

    #[test]
    fn test_digest_is_structural() {
        let a = workspace("/proj");
        let b = workspace("/proj");
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
        let mut c = workspace("/proj");
        c.flags.indices_matter = true;
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_resolve_prefix_match() {
        let mut reg = registry();
        reg.add(PathBuf::from("/proj"), workspace("/proj"));
        let uri = Url::parse("file:///proj/theories/a.v").unwrap();
        let (state, ws) = reg.resolve(&uri).unwrap();
        assert_eq!(state, 7);
        assert_eq!(ws.root, PathBuf::from("/proj"));
    }

    #[test]
    fn test_resolve_most_recent_wins_nested_roots() {
        let mut reg = registry();
        reg.add(PathBuf::from("/proj"), workspace("/proj"));
        reg.add(PathBuf::from("/proj/vendored"), workspace("/proj/vendored"));
        let uri = Url::parse("file:///proj/vendored/lib.v").unwrap();
        let (_, ws) = reg.resolve(&uri).unwrap();
        assert_eq!(ws.root, PathBuf::from("/proj/vendored"));
    }

    #[test]
    fn test_resolve_falls_back_to_first_entry() {
        let mut reg = registry();
        reg.add(PathBuf::from("/a"), workspace("/a"));
        reg.add(PathBuf::from("/b"), workspace("/b"));
        let uri = Url::parse("file:///elsewhere/x.v").unwrap();
        let (_, ws) = reg.resolve(&uri).unwrap();
        // add() prepends: /b is the first entry.
        assert_eq!(ws.root, PathBuf::from("/b"));
    }

    #[test]
    fn test_resolve_empty_registry() {
        let reg = registry();
        let uri = Url::parse("file:///x.v").unwrap();
        assert!(reg.resolve(&uri).is_none());
    }

    #[test]
    fn test_remove_drops_root() {
        let mut reg = registry();
        reg.add(PathBuf::from("/a"), workspace("/a"));
        reg.add(PathBuf::from("/b"), workspace("/b"));
        reg.remove(Path::new("/b"));
        let uri = Url::parse("file:///b/x.v").unwrap();
        let (_, ws) = reg.resolve(&uri).unwrap();
        assert_eq!(ws.root, PathBuf::from("/a"));
    }

    #[test]
    fn test_re_add_replaces_entry() {
        let mut reg = registry();
        reg.add(PathBuf::from("/a"), workspace("/a"));
        let mut changed = workspace("/a");
        changed.debug = true;
        reg.add(PathBuf::from("/a"), changed);
        assert_eq!(reg.roots().count(), 1);
        let uri = Url::parse("file:///a/x.v").unwrap();
        let (_, ws) = reg.resolve(&uri).unwrap();
        assert!(ws.debug);
    }
}
