//! The procfs-equivalent seam.
//!
//! The platform exposes pseudo-files whose reads and writes are dispatched to a
//! [`ControlFile`]. Entries are created through [`ProcEntry`] guards, which remove
//! the entry again when dropped unless they have been committed, so a partially
//! built tree unwinds itself.

use alloc::string::String;
use alloc::sync::Arc;

use crate::UserMemory;

/// Handle of a node in the control tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

impl NodeId {
    /// Creates a node handle (platform side).
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Returns the platform's raw handle.
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

/// Access mode of a control file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl FileMode {
    /// Returns the permission bits the file is created with.
    pub const fn bits(self) -> u16 {
        match self {
            FileMode::ReadOnly => 0o444,
            FileMode::WriteOnly => 0o222,
            FileMode::ReadWrite => 0o666,
        }
    }

    pub const fn readable(self) -> bool {
        matches!(self, FileMode::ReadOnly | FileMode::ReadWrite)
    }

    pub const fn writable(self) -> bool {
        matches!(self, FileMode::WriteOnly | FileMode::ReadWrite)
    }
}

/// Read/write handlers of a control file.
///
/// Handlers run synchronously on the calling thread. Failures are never reported
/// separately; they show up only in the returned byte count.
pub trait ControlFile: Send + Sync {
    /// Renders the file's contents.
    fn read(&self, _out: &mut String) {}

    /// Handles a write of `input`. Returns the number of bytes consumed; zero means
    /// the write was ignored.
    fn write(&self, _input: &[u8], _user: &dyn UserMemory) -> usize {
        0
    }
}

/// Errors from node creation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcError {
    /// The platform refused to create the node.
    #[error("failed to create proc entry {0}")]
    CreateFailed(String),
    /// A sibling with the same name exists.
    #[error("proc entry {0} already exists")]
    Exists(String),
    /// The parent node is gone.
    #[error("parent of proc entry {0} does not exist")]
    NoParent(String),
}

/// The platform's pseudo-file registry.
pub trait ProcFs: Send + Sync {
    /// Creates a directory under `parent`, or at the top level.
    fn mkdir(&self, parent: Option<NodeId>, name: &str) -> Result<NodeId, ProcError>;

    /// Creates a file under `parent` dispatching to `handler`.
    fn create_file(
        &self,
        parent: NodeId,
        name: &str,
        mode: FileMode,
        handler: Arc<dyn ControlFile>,
    ) -> Result<NodeId, ProcError>;

    /// Removes a node and anything below it.
    fn remove(&self, node: NodeId);
}

/// A created node that is removed on drop unless committed.
pub struct ProcEntry<'a, F: ProcFs + ?Sized> {
    fs: &'a F,
    node: NodeId,
    armed: bool,
}

impl<'a, F: ProcFs + ?Sized> ProcEntry<'a, F> {
    /// Creates a directory.
    pub fn mkdir(fs: &'a F, parent: Option<NodeId>, name: &str) -> Result<Self, ProcError> {
        let node = fs.mkdir(parent, name)?;
        Ok(Self {
            fs,
            node,
            armed: true,
        })
    }

    /// Creates a file.
    pub fn file(
        fs: &'a F,
        parent: NodeId,
        name: &str,
        mode: FileMode,
        handler: Arc<dyn ControlFile>,
    ) -> Result<Self, ProcError> {
        let node = fs.create_file(parent, name, mode, handler)?;
        Ok(Self {
            fs,
            node,
            armed: true,
        })
    }

    /// Returns the node this guard owns.
    pub fn id(&self) -> NodeId {
        self.node
    }

    /// Keeps the node alive past the guard and returns its handle.
    pub fn commit(mut self) -> NodeId {
        self.armed = false;
        self.node
    }
}

impl<F: ProcFs + ?Sized> Drop for ProcEntry<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            log::debug!("rolling back proc entry {:?}", self.node);
            self.fs.remove(self.node);
        }
    }
}
