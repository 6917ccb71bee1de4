use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::Error;

use crate::ctfile::MatchMode;

/// User-visible intent of a scheduled workflow, carried through resolver
/// ops so the right final operation is dispatched once prerequisites are
/// in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Archive,
    Extract,
    List,
    JustDl,
}

/// What runs when an operation is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// Upload `local_name` as remote ctfile `remote_name`.
    CtfileArchive,
    /// Download remote ctfile `remote_name` into `local_name`.
    CtfileExtract,
    /// Ask the server for the full remote listing.
    CtfileList,
    /// Delete remote ctfile `remote_name`.
    CtfileDelete,
    /// Data-plane operations, dispatched to the [DataOps] collaborator.
    ArchiveData,
    ExtractData,
    ListData,
    CullCollect,
    CullSetup,
    CullShas,
    CullComplete,
    /// Drain and stop the loop.
    Shutdown,
}

/// Continuation invoked when an operation completes. May enqueue more
/// work; prerequisites are spliced in directly after the current op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    None,
    /// A listing for tag resolution finished; pick the newest match.
    FindForExtract,
    /// A chain element landed in the cache; keep walking, then dispatch
    /// the user-visible action.
    ExtractNextop,
    /// Walk the `previous` pointer of the file just downloaded.
    DownloadNext,
    /// Stash filtered listing results for the embedder.
    StoreList,
    SecretsCheck,
    SecretsUnlock,
    CullFetchAll,
    CullDone,
}

/// Cooperative producer state of the current operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Running,
    /// Transaction pool exhausted; rewoken on release.
    WaitingTrans,
    /// Stream drained; nothing further to submit.
    Finished,
}

/// A scheduled workflow step.
#[derive(Debug)]
pub struct Op {
    pub entry: Entry,
    pub complete: Completion,
    pub action: Action,
    /// The user's tag, before date-prefixing.
    pub tag: Option<String>,
    pub local_name: Option<PathBuf>,
    pub remote_name: Option<String>,
    pub filelist: Vec<String>,
    pub excludelist: Vec<String>,
    pub matchmode: MatchMode,
    /// Prior ctfile (or fallback path) for differentials and secrets sync.
    pub basis: Option<PathBuf>,
    /// Patterns a `CtfileList` entry filters the listing with.
    pub search: Vec<String>,
    pub search_mode: MatchMode,
}

impl Op {
    pub fn new(entry: Entry) -> Self {
        Self {
            entry,
            complete: Completion::None,
            action: Action::None,
            tag: None,
            local_name: None,
            remote_name: None,
            filelist: Vec::new(),
            excludelist: Vec::new(),
            matchmode: MatchMode::Glob,
            basis: None,
            search: Vec::new(),
            search_mode: MatchMode::Glob,
        }
    }

    pub fn complete(mut self, complete: Completion) -> Self {
        self.complete = complete;
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    pub fn tag(mut self, tag: String) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn local_name(mut self, path: PathBuf) -> Self {
        self.local_name = Some(path);
        self
    }

    pub fn remote_name(mut self, name: String) -> Self {
        self.remote_name = Some(name);
        self
    }

    pub fn filelist(mut self, filelist: Vec<String>) -> Self {
        self.filelist = filelist;
        self
    }

    pub fn excludelist(mut self, excludelist: Vec<String>) -> Self {
        self.excludelist = excludelist;
        self
    }

    pub fn matchmode(mut self, matchmode: MatchMode) -> Self {
        self.matchmode = matchmode;
        self
    }

    pub fn basis(mut self, basis: PathBuf) -> Self {
        self.basis = Some(basis);
        self
    }

    pub fn search(mut self, patterns: Vec<String>, mode: MatchMode) -> Self {
        self.search = patterns;
        self.search_mode = mode;
        self
    }
}

/// FIFO of operations. The running op is popped out; prerequisites
/// spliced with [OpQueue::enqueue_next] therefore land at the head, which
/// preserves the relative order of everything queued later.
#[derive(Debug, Default)]
pub struct OpQueue {
    queue: VecDeque<Op>,
}

impl OpQueue {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// Append to the tail.
    pub fn enqueue(&mut self, op: Op) {
        self.queue.push_back(op);
    }

    /// Insert directly after the current (already popped) op. Successive
    /// calls end up in reverse call order, like the intrusive insert-after
    /// this replaces.
    pub fn enqueue_next(&mut self, op: Op) {
        self.queue.push_front(op);
    }

    pub fn pop(&mut self) -> Option<Op> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// The data plane: chunking file trees into catalogue files and back.
/// Out of the engine's scope; embedders supply an implementation.
pub trait DataOps {
    /// Produce the catalogue file `ctfile` from the local tree,
    /// differential against `basis` when given.
    fn archive(
        &mut self,
        ctfile: &Path,
        filelist: &[String],
        excludelist: &[String],
        basis: Option<&Path>,
    ) -> Result<(), Error>;

    /// Rehydrate the tree described by the (cached) catalogue file.
    fn extract(
        &mut self,
        ctfile: &Path,
        filelist: &[String],
        excludelist: &[String],
    ) -> Result<(), Error>;

    /// Print the contents of the (cached) catalogue file.
    fn list(
        &mut self,
        ctfile: &Path,
        filelist: &[String],
        excludelist: &[String],
        matchmode: MatchMode,
    ) -> Result<(), Error>;
}
