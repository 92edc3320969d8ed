//! Emulated control tree.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{ControlFile, FileMode, NodeId, ProcError, ProcFs, UserMemory};

enum NodeKind {
    Dir,
    File {
        mode: FileMode,
        handler: Arc<dyn ControlFile>,
    },
}

struct Node {
    name: String,
    parent: Option<NodeId>,
    kind: NodeKind,
}

/// An in-memory pseudo-filesystem.
///
/// Paths are `/`-separated and relative to the top of the tree (`"pagealloc/low_mem"`).
/// Handlers are invoked with the tree unlocked, so a handler may create and remove
/// entries.
pub struct EmulatedProcFs {
    nodes: spin::Mutex<BTreeMap<NodeId, Node>>,
    next_id: AtomicUsize,
    failing: spin::Mutex<Vec<String>>,
}

impl EmulatedProcFs {
    pub fn new() -> Self {
        Self {
            nodes: spin::Mutex::new(BTreeMap::new()),
            next_id: AtomicUsize::new(1),
            failing: spin::Mutex::new(Vec::new()),
        }
    }

    /// Makes every later attempt to create a matching entry fail. `target` is either
    /// a bare name, matching that name anywhere in the tree, or a full path such as
    /// `"pagealloc/free_pages"`.
    pub fn fail_on_create(&self, target: &str) {
        self.failing.lock().push(target.to_string());
    }

    /// Clears all injected creation failures.
    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    /// Reads the file at `path`. Returns `None` if there is no readable file there.
    pub fn read(&self, path: &str) -> Option<String> {
        let handler = self.handler(path, FileMode::readable)?;
        let mut out = String::new();
        handler.read(&mut out);
        Some(out)
    }

    /// Writes `input` to the file at `path` on behalf of a caller whose address space
    /// is `user`. Returns the handler's result, or `None` if there is no writable
    /// file there.
    pub fn write(&self, path: &str, input: &[u8], user: &dyn UserMemory) -> Option<usize> {
        let handler = self.handler(path, FileMode::writable)?;
        Some(handler.write(input, user))
    }

    /// Returns true if anything exists at `path`.
    pub fn exists(&self, path: &str) -> bool {
        let nodes = self.nodes.lock();
        lookup(&nodes, path).is_some()
    }

    /// Returns the mode of the file at `path`.
    pub fn mode(&self, path: &str) -> Option<FileMode> {
        let nodes = self.nodes.lock();
        let id = lookup(&nodes, path)?;
        match &nodes.get(&id)?.kind {
            NodeKind::File { mode, .. } => Some(*mode),
            NodeKind::Dir => None,
        }
    }

    /// Lists the names directly below `path`, sorted.
    pub fn list(&self, path: &str) -> Vec<String> {
        let nodes = self.nodes.lock();
        let Some(dir) = lookup(&nodes, path) else {
            return Vec::new();
        };
        let mut names: Vec<String> = nodes
            .values()
            .filter(|node| node.parent == Some(dir))
            .map(|node| node.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Returns the path of every node, sorted.
    pub fn paths(&self) -> Vec<String> {
        let nodes = self.nodes.lock();
        let mut paths: Vec<String> = nodes.keys().map(|&id| path_of(&nodes, id)).collect();
        paths.sort();
        paths
    }

    fn handler(&self, path: &str, allowed: fn(FileMode) -> bool) -> Option<Arc<dyn ControlFile>> {
        let nodes = self.nodes.lock();
        let id = lookup(&nodes, path)?;
        match &nodes.get(&id)?.kind {
            NodeKind::File { mode, handler } if allowed(*mode) => Some(Arc::clone(handler)),
            _ => None,
        }
    }

    fn insert(&self, parent: Option<NodeId>, name: &str, kind: NodeKind) -> Result<NodeId, ProcError> {
        let mut nodes = self.nodes.lock();
        {
            let failing = self.failing.lock();
            if !failing.is_empty() {
                let path = match parent {
                    Some(parent) => format!("{}/{name}", path_of(&nodes, parent)),
                    None => name.to_string(),
                };
                if failing.iter().any(|target| *target == name || *target == path) {
                    return Err(ProcError::CreateFailed(name.to_string()));
                }
            }
        }

        if let Some(parent) = parent {
            match nodes.get(&parent) {
                Some(Node {
                    kind: NodeKind::Dir,
                    ..
                }) => {}
                _ => return Err(ProcError::NoParent(name.to_string())),
            }
        }
        if child(&nodes, parent, name).is_some() {
            return Err(ProcError::Exists(name.to_string()));
        }

        let id = NodeId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        nodes.insert(
            id,
            Node {
                name: name.to_string(),
                parent,
                kind,
            },
        );
        Ok(id)
    }
}

impl Default for EmulatedProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcFs for EmulatedProcFs {
    fn mkdir(&self, parent: Option<NodeId>, name: &str) -> Result<NodeId, ProcError> {
        self.insert(parent, name, NodeKind::Dir)
    }

    fn create_file(
        &self,
        parent: NodeId,
        name: &str,
        mode: FileMode,
        handler: Arc<dyn ControlFile>,
    ) -> Result<NodeId, ProcError> {
        self.insert(Some(parent), name, NodeKind::File { mode, handler })
    }

    fn remove(&self, node: NodeId) {
        let removed: Vec<Node> = {
            let mut nodes = self.nodes.lock();
            let mut doomed = alloc::vec![node];
            let mut cursor = 0;
            while cursor < doomed.len() {
                let current = doomed[cursor];
                doomed.extend(
                    nodes
                        .iter()
                        .filter(|(_, candidate)| candidate.parent == Some(current))
                        .map(|(&id, _)| id),
                );
                cursor += 1;
            }
            doomed.iter().filter_map(|id| nodes.remove(id)).collect()
        };
        // Handlers are dropped with the tree unlocked.
        drop(removed);
    }
}

fn child(nodes: &BTreeMap<NodeId, Node>, parent: Option<NodeId>, name: &str) -> Option<NodeId> {
    nodes
        .iter()
        .find(|(_, node)| node.parent == parent && node.name == name)
        .map(|(&id, _)| id)
}

fn lookup(nodes: &BTreeMap<NodeId, Node>, path: &str) -> Option<NodeId> {
    let mut current = None;
    for part in path.split('/').filter(|part| !part.is_empty()) {
        current = Some(child(nodes, current, part)?);
    }
    current
}

fn path_of(nodes: &BTreeMap<NodeId, Node>, id: NodeId) -> String {
    let mut parts = Vec::new();
    let mut cursor = Some(id);
    while let Some(node) = cursor.and_then(|id| nodes.get(&id)) {
        parts.push(node.name.as_str());
        cursor = node.parent;
    }
    parts.reverse();
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::UserArena;

    struct Echo;

    impl ControlFile for Echo {
        fn read(&self, out: &mut String) {
            out.push_str("echo\n");
        }

        fn write(&self, input: &[u8], _user: &dyn UserMemory) -> usize {
            input.len()
        }
    }

    #[test]
    fn builds_and_walks_a_tree() {
        let fs = EmulatedProcFs::new();
        let root = fs.mkdir(None, "root").unwrap();
        let dir = fs.mkdir(Some(root), "dir").unwrap();
        fs.create_file(dir, "rw", FileMode::ReadWrite, Arc::new(Echo))
            .unwrap();
        fs.create_file(root, "ro", FileMode::ReadOnly, Arc::new(Echo))
            .unwrap();

        assert_eq!(fs.paths(), ["root", "root/dir", "root/dir/rw", "root/ro"]);
        assert_eq!(fs.list("root"), ["dir", "ro"]);
        assert!(fs.exists("root/dir/rw"));
        assert_eq!(fs.mode("root/ro"), Some(FileMode::ReadOnly));
        assert_eq!(fs.mode("root/dir"), None);
    }

    #[test]
    fn dispatches_by_mode() {
        let fs = EmulatedProcFs::new();
        let user = UserArena::new(16);
        let root = fs.mkdir(None, "root").unwrap();
        fs.create_file(root, "ro", FileMode::ReadOnly, Arc::new(Echo))
            .unwrap();
        fs.create_file(root, "wo", FileMode::WriteOnly, Arc::new(Echo))
            .unwrap();

        assert_eq!(fs.read("root/ro").as_deref(), Some("echo\n"));
        assert_eq!(fs.write("root/ro", b"abc", &user), None);
        assert_eq!(fs.read("root/wo"), None);
        assert_eq!(fs.write("root/wo", b"abc", &user), Some(3));
        assert_eq!(fs.read("root"), None);
        assert_eq!(fs.read("missing"), None);
    }

    #[test]
    fn rejects_duplicates_and_orphans() {
        let fs = EmulatedProcFs::new();
        let root = fs.mkdir(None, "root").unwrap();
        assert_eq!(
            fs.mkdir(None, "root"),
            Err(ProcError::Exists("root".to_string()))
        );

        let file = fs
            .create_file(root, "file", FileMode::ReadOnly, Arc::new(Echo))
            .unwrap();
        assert_eq!(
            fs.mkdir(Some(file), "below"),
            Err(ProcError::NoParent("below".to_string()))
        );

        fs.remove(root);
        assert_eq!(
            fs.mkdir(Some(root), "orphan"),
            Err(ProcError::NoParent("orphan".to_string()))
        );
    }

    #[test]
    fn remove_takes_descendants() {
        let fs = EmulatedProcFs::new();
        let root = fs.mkdir(None, "root").unwrap();
        let dir = fs.mkdir(Some(root), "dir").unwrap();
        fs.create_file(dir, "file", FileMode::ReadOnly, Arc::new(Echo))
            .unwrap();
        let keep = fs.mkdir(None, "keep").unwrap();

        fs.remove(root);
        assert_eq!(fs.paths(), ["keep"]);

        fs.remove(root);
        fs.remove(keep);
        assert!(fs.paths().is_empty());
    }

    #[test]
    fn injected_creation_failure() {
        let fs = EmulatedProcFs::new();
        fs.fail_on_create("root");
        assert_eq!(
            fs.mkdir(None, "root"),
            Err(ProcError::CreateFailed("root".to_string()))
        );

        fs.clear_failures();
        assert!(fs.mkdir(None, "root").is_ok());
    }

    #[test]
    fn injected_failure_by_path() {
        let fs = EmulatedProcFs::new();
        fs.fail_on_create("root/file");
        let root = fs.mkdir(None, "root").unwrap();
        let dir = fs.mkdir(Some(root), "dir").unwrap();

        assert!(fs.create_file(dir, "file", FileMode::ReadOnly, Arc::new(Echo)).is_ok());
        assert_eq!(
            fs.create_file(root, "file", FileMode::ReadOnly, Arc::new(Echo)),
            Err(ProcError::CreateFailed("file".to_string()))
        );
        assert_eq!(fs.paths(), ["root", "root/dir", "root/dir/file"]);
    }
}
