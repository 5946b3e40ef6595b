//! File Tree Management
//!
//! The final product of the pipeline: one `FileNode` per recovered file or
//! directory, stored ancestors-first so that every node's parent appears
//! before it. Supports path resolution, listing, copying data out of the
//! device and small edits (move, create directory, remove subtree).

use crate::error::{Result, SalvageError};
use crate::logging;
use crate::ntfs::physical::DiskReader;
use crate::ntfs::structs::{FileReference, CLUSTER_SIZE};
use crate::store::{Record, RecordStore, RecordWriter, StoreKind};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Name of the per-table node collecting unplaceable files
pub const LOST_FOUND_NAME: &str = "Lost+Found";

/// Chunk size when copying file data out of the device
const COPY_CHUNK: usize = 1024 * 1024;

// ============================================================================
// File Node
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// A recovered file or directory
    Regular,
    /// Root directory of one table (record 5, found or synthesized)
    Root,
    /// The table's Lost+Found
    LostFound,
    /// Directory created with `mkdir`
    Created,
}

/// One run of file data, already translated to device bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    /// Absolute device offset; meaningless for sparse extents
    pub offset: u64,
    pub clusters: u64,
    pub sparse: bool,
}

impl Extent {
    /// Byte length, saturating for damaged cluster counts
    pub fn len(&self) -> u64 {
        self.clusters.saturating_mul(CLUSTER_SIZE)
    }

    pub fn is_empty(&self) -> bool {
        self.clusters == 0
    }
}

/// A node in the file tree (file or directory)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    /// Synthetic identifier, unique within a file list
    pub id: u64,
    /// None for roots
    pub parent_id: Option<u64>,
    pub mft_id: u32,
    pub reference: FileReference,
    pub parent_ref: FileReference,
    pub name: String,
    /// Logical data size in bytes
    pub size: u64,
    pub extents: Vec<Extent>,
    /// Data of small files stored inside the record
    pub resident_data: Option<Vec<u8>>,
    pub is_directory: bool,
    pub kind: NodeKind,
    /// Last modification (FILETIME), 0 when unknown
    pub modified: u64,
    /// Position in the ordered list
    pub tree_index: usize,
    /// Position of the parent; None for roots
    pub parent_index: Option<usize>,
}

impl FileNode {
    pub fn is_root(&self) -> bool {
        self.kind == NodeKind::Root
    }
}

// ============================================================================
// Ordering
// ============================================================================

/// Order nodes ancestors-first: breadth-first from every root, roots in
/// table order. Nodes no root reaches (parent cycles, dangling parents) are
/// moved under their table's Lost+Found. Returns the ordered nodes with
/// `tree_index` / `parent_index` filled in, and the number of nodes moved.
pub fn order_topologically(mut nodes: Vec<FileNode>) -> (Vec<FileNode>, usize) {
    let mut reparented = 0;

    let mut order = breadth_first(&nodes);
    if order.len() < nodes.len() {
        let reached: HashSet<usize> = order.iter().copied().collect();
        let lost_found: HashMap<u32, u64> = nodes
            .iter()
            .filter(|n| n.kind == NodeKind::LostFound)
            .map(|n| (n.mft_id, n.id))
            .collect();
        let roots: HashMap<u32, u64> = nodes
            .iter()
            .filter(|n| n.is_root())
            .map(|n| (n.mft_id, n.id))
            .collect();

        for (i, node) in nodes.iter_mut().enumerate() {
            if reached.contains(&i) {
                continue;
            }
            match lost_found.get(&node.mft_id).or_else(|| roots.get(&node.mft_id)) {
                Some(&target) => {
                    logging::warn(
                        "TREE",
                        &format!("Node {} '{}' unreachable from its root, moved to {}", node.id, node.name, LOST_FOUND_NAME),
                    );
                    node.parent_id = Some(target);
                    reparented += 1;
                }
                None => logging::warn(
                    "TREE",
                    &format!("Node {} '{}' has no root in table {}, dropped", node.id, node.name, node.mft_id),
                ),
            }
        }
        order = breadth_first(&nodes);
    }

    let mut slots: Vec<Option<FileNode>> = nodes.into_iter().map(Some).collect();
    let mut ordered: Vec<FileNode> = order.into_iter().filter_map(|i| slots[i].take()).collect();

    // Second pass: parent indices through the id map built after ordering
    let position: HashMap<u64, usize> = ordered.iter().enumerate().map(|(i, n)| (n.id, i)).collect();
    for (i, node) in ordered.iter_mut().enumerate() {
        node.tree_index = i;
        node.parent_index = node.parent_id.and_then(|p| position.get(&p).copied());
    }

    (ordered, reparented)
}

fn breadth_first(nodes: &[FileNode]) -> Vec<usize> {
    let mut children: HashMap<u64, Vec<usize>> = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
        if let Some(parent) = node.parent_id {
            children.entry(parent).or_default().push(i);
        }
    }

    let mut roots: Vec<usize> = (0..nodes.len())
        .filter(|&i| nodes[i].parent_id.is_none() && nodes[i].is_root())
        .collect();
    roots.sort_by_key(|&i| (nodes[i].mft_id, nodes[i].id));

    let mut seen = vec![false; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());
    let mut queue: VecDeque<usize> = VecDeque::new();

    for root in roots {
        seen[root] = true;
        queue.push_back(root);
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &child in children.get(&nodes[i].id).map(Vec::as_slice).unwrap_or(&[]) {
                if !seen[child] {
                    seen[child] = true;
                    queue.push_back(child);
                }
            }
        }
    }

    order
}

// ============================================================================
// File Tree
// ============================================================================

/// Statistics about the tree
#[derive(Debug, Clone, Default)]
pub struct TreeStats {
    pub total_files: u64,
    pub total_directories: u64,
    pub total_size: u64,
    pub tables: u64,
    pub lost_found_entries: u64,
}

/// Outcome of `copy_out`
#[derive(Debug, Clone, Default)]
pub struct CopyStats {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
    pub sparse_bytes: u64,
}

/// A loaded file list
pub struct FileTree {
    nodes: Vec<FileNode>,
    by_id: HashMap<u64, usize>,
    children: HashMap<u64, Vec<usize>>,
    roots: Vec<usize>,
}

impl FileTree {
    /// Build a tree from nodes in any order
    pub fn from_nodes(nodes: Vec<FileNode>) -> Self {
        let (nodes, _) = order_topologically(nodes);
        let mut tree = Self {
            nodes,
            by_id: HashMap::new(),
            children: HashMap::new(),
            roots: Vec::new(),
        };
        tree.reindex();
        tree
    }

    /// Load a file list store
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let store = RecordStore::open_kind(path.as_ref(), StoreKind::FileList)?;
        let mut nodes = Vec::with_capacity(store.len());
        for item in store.stream_from(0) {
            match item?.record {
                Record::Node(node) => nodes.push(node),
                other => {
                    return Err(SalvageError::FormatMismatch(format!(
                        "unexpected {} record in a file list",
                        other.kind_name()
                    )))
                }
            }
        }

        logging::info(
            "TREE",
            &format!("Loaded {} nodes from {}", nodes.len(), path.as_ref().display()),
        );
        Ok(Self::from_nodes(nodes))
    }

    /// Re-order and write the tree as a new file list store
    pub fn save(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let (nodes, reparented) = order_topologically(std::mem::take(&mut self.nodes));
        if reparented > 0 {
            logging::warn("TREE", &format!("{} nodes reparented while saving", reparented));
        }
        self.nodes = nodes;
        self.reindex();

        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        let mut writer = RecordWriter::create(&tmp, StoreKind::FileList)?;
        for node in &self.nodes {
            writer.append(&Record::Node(node.clone()))?;
        }
        let count = writer.close()?;
        fs::rename(&tmp, path)?;
        Ok(count)
    }

    fn reindex(&mut self) {
        self.by_id = self.nodes.iter().enumerate().map(|(i, n)| (n.id, i)).collect();
        self.children.clear();
        self.roots.clear();
        for (i, node) in self.nodes.iter().enumerate() {
            match node.parent_id {
                Some(parent) => self.children.entry(parent).or_default().push(i),
                None => self.roots.push(i),
            }
        }
    }

    pub fn nodes(&self) -> &[FileNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &FileNode {
        &self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn stats(&self) -> TreeStats {
        let mut stats = TreeStats::default();
        for node in &self.nodes {
            match node.kind {
                NodeKind::Root => stats.tables += 1,
                NodeKind::LostFound => {
                    stats.lost_found_entries += self.children.get(&node.id).map_or(0, |c| c.len() as u64)
                }
                _ if node.is_directory => stats.total_directories += 1,
                _ => {
                    stats.total_files += 1;
                    stats.total_size += node.size;
                }
            }
        }
        stats
    }

    /// Children of a node, or the roots for `None`, sorted by name
    pub fn children(&self, parent: Option<usize>) -> Vec<usize> {
        let mut list = match parent {
            None => self.roots.clone(),
            Some(i) => self.children.get(&self.nodes[i].id).cloned().unwrap_or_default(),
        };
        list.sort_by(|&a, &b| {
            let (a, b) = (&self.nodes[a], &self.nodes[b]);
            b.is_directory
                .cmp(&a.is_directory)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        list
    }

    /// Resolve `/mft0/dir/file`. `/` resolves to `None` (the list of roots).
    pub fn resolve(&self, path: &str) -> Result<Option<usize>> {
        let mut current: Option<usize> = None;
        for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
            if part == ".." {
                current = current.and_then(|i| self.nodes[i].parent_index);
                continue;
            }
            current = Some(
                self.find_child(current, part)
                    .ok_or_else(|| SalvageError::PathNotFound(path.to_string()))?,
            );
        }
        Ok(current)
    }

    /// Child by name: exact match first, then case-insensitive as NTFS does
    fn find_child(&self, parent: Option<usize>, name: &str) -> Option<usize> {
        let candidates = match parent {
            None => self.roots.clone(),
            Some(i) => self.children.get(&self.nodes[i].id).cloned().unwrap_or_default(),
        };
        candidates
            .iter()
            .copied()
            .find(|&c| self.nodes[c].name == name)
            .or_else(|| {
                let lower = name.to_lowercase();
                candidates.into_iter().find(|&c| self.nodes[c].name.to_lowercase() == lower)
            })
    }

    /// Absolute path of a node
    pub fn path_of(&self, index: usize) -> String {
        let mut parts = Vec::new();
        let mut current = Some(index);
        let mut guard = 0;
        while let Some(i) = current {
            parts.push(self.nodes[i].name.as_str());
            current = self.nodes[i].parent_index;
            guard += 1;
            if guard > self.nodes.len() {
                break;
            }
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    /// Nodes under `parent`, depth-first, each with its depth below `parent`
    pub fn walk(&self, parent: Option<usize>, recursive: bool) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        let mut stack: Vec<(usize, usize)> = self.children(parent).into_iter().rev().map(|c| (c, 0)).collect();
        while let Some((i, depth)) = stack.pop() {
            out.push((i, depth));
            if recursive {
                stack.extend(self.children(Some(i)).into_iter().rev().map(|c| (c, depth + 1)));
            }
        }
        out
    }

    // ------------------------------------------------------------------------
    // Copy out
    // ------------------------------------------------------------------------

    /// Copy a file or a whole subtree into `dest_dir` on the host
    pub fn copy_out(&self, disk: &DiskReader, path: &str, dest_dir: &Path) -> Result<CopyStats> {
        let mut stats = CopyStats::default();
        match self.resolve(path)? {
            Some(index) => self.copy_node(disk, index, dest_dir, &mut stats)?,
            None => {
                for root in self.children(None) {
                    self.copy_node(disk, root, dest_dir, &mut stats)?;
                }
            }
        }

        logging::info(
            "COPY",
            &format!(
                "Copied {} to {}: {} files, {} dirs, {} bytes",
                path,
                dest_dir.display(),
                stats.files,
                stats.directories,
                stats.bytes
            ),
        );
        Ok(stats)
    }

    fn copy_node(&self, disk: &DiskReader, index: usize, dest_dir: &Path, stats: &mut CopyStats) -> Result<()> {
        let node = &self.nodes[index];
        let target = dest_dir.join(host_name(&node.name));

        if node.is_directory {
            fs::create_dir_all(&target)?;
            stats.directories += 1;
            for child in self.children(Some(index)) {
                self.copy_node(disk, child, &target, stats)?;
            }
            return Ok(());
        }

        let mut out = fs::File::create(&target)?;
        copy_data(disk, node, &mut out, stats)?;
        out.flush()?;
        stats.files += 1;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Edits
    // ------------------------------------------------------------------------

    /// Move `source` into the directory `dest`, or to `dest` as a new name
    pub fn move_node(&mut self, source: &str, dest: &str) -> Result<()> {
        let src = self
            .resolve(source)?
            .ok_or_else(|| SalvageError::InvalidArgument("cannot move the top level".into()))?;
        if self.nodes[src].kind != NodeKind::Regular && self.nodes[src].kind != NodeKind::Created {
            return Err(SalvageError::InvalidArgument(format!("cannot move {}", source)));
        }

        let (target, new_name) = match self.resolve(dest) {
            Ok(Some(t)) if self.nodes[t].is_directory => (t, None),
            Ok(Some(_)) => {
                return Err(SalvageError::InvalidArgument(format!("{} already exists", dest)));
            }
            Ok(None) => return Err(SalvageError::InvalidArgument("cannot move to the top level".into())),
            Err(_) => {
                let (parent, name) = split_parent(dest)?;
                match self.resolve(parent)? {
                    Some(p) if self.nodes[p].is_directory => (p, Some(name.to_string())),
                    _ => return Err(SalvageError::PathNotFound(parent.to_string())),
                }
            }
        };

        if self.is_ancestor(src, target) {
            return Err(SalvageError::InvalidArgument(format!(
                "cannot move {} into itself",
                source
            )));
        }

        let (parent_id, parent_ref, mft_id) = {
            let t = &self.nodes[target];
            (t.id, t.reference, t.mft_id)
        };
        let node = &mut self.nodes[src];
        logging::info("TREE", &format!("Move node {} '{}' under node {}", node.id, node.name, parent_id));
        node.parent_id = Some(parent_id);
        node.parent_ref = parent_ref;
        if node.mft_id != mft_id {
            logging::debug("TREE", &format!("Node {} now listed under table {}", node.id, mft_id));
        }
        if let Some(name) = new_name {
            node.name = name;
        }

        self.reindex();
        Ok(())
    }

    /// Create an empty directory
    pub fn make_directory(&mut self, path: &str) -> Result<u64> {
        if self.resolve(path).is_ok() {
            return Err(SalvageError::InvalidArgument(format!("{} already exists", path)));
        }
        let (parent_path, name) = split_parent(path)?;
        let parent = match self.resolve(parent_path)? {
            Some(p) if self.nodes[p].is_directory => p,
            _ => return Err(SalvageError::PathNotFound(parent_path.to_string())),
        };

        let id = self.nodes.iter().map(|n| n.id).max().unwrap_or(0) + 1;
        let parent_node = &self.nodes[parent];
        let node = FileNode {
            id,
            parent_id: Some(parent_node.id),
            mft_id: parent_node.mft_id,
            reference: FileReference::NULL,
            parent_ref: parent_node.reference,
            name: name.to_string(),
            size: 0,
            extents: Vec::new(),
            resident_data: None,
            is_directory: true,
            kind: NodeKind::Created,
            modified: 0,
            tree_index: self.nodes.len(),
            parent_index: Some(parent),
        };

        logging::info("TREE", &format!("Create directory {} as node {}", path, id));
        self.nodes.push(node);
        self.reindex();
        Ok(id)
    }

    /// Remove a node and everything below it. Returns the number of nodes removed.
    pub fn remove(&mut self, path: &str) -> Result<usize> {
        let index = self
            .resolve(path)?
            .ok_or_else(|| SalvageError::InvalidArgument("cannot remove the top level".into()))?;
        if matches!(self.nodes[index].kind, NodeKind::Root | NodeKind::LostFound) {
            return Err(SalvageError::InvalidArgument(format!("cannot remove {}", path)));
        }

        let doomed: HashSet<u64> = std::iter::once(index)
            .chain(self.walk(Some(index), true).into_iter().map(|(i, _)| i))
            .map(|i| self.nodes[i].id)
            .collect();

        self.nodes.retain(|n| !doomed.contains(&n.id));
        self.reindex();

        logging::info("TREE", &format!("Removed {} ({} nodes)", path, doomed.len()));
        Ok(doomed.len())
    }

    fn is_ancestor(&self, ancestor: usize, mut node: usize) -> bool {
        let target = self.nodes[ancestor].id;
        for _ in 0..=self.nodes.len() {
            if self.nodes[node].id == target {
                return true;
            }
            match self.nodes[node].parent_id.and_then(|p| self.by_id.get(&p)) {
                Some(&parent) => node = parent,
                None => return false,
            }
        }
        false
    }
}

/// Write a file node's data: resident bytes, or extents read from the device
/// with sparse extents zero-filled, truncated to the declared size.
pub fn copy_data<W: Write>(disk: &DiskReader, node: &FileNode, out: &mut W, stats: &mut CopyStats) -> Result<()> {
    if let Some(data) = &node.resident_data {
        let len = data.len().min(node.size as usize);
        out.write_all(&data[..len])?;
        stats.bytes += len as u64;
        return Ok(());
    }

    let mut remaining = node.size;
    let mut buffer = vec![0u8; COPY_CHUNK];

    for extent in &node.extents {
        let mut extent_left = extent.len().min(remaining);
        let mut offset = extent.offset;

        while extent_left > 0 {
            let chunk = extent_left.min(COPY_CHUNK as u64) as usize;
            if extent.sparse {
                buffer[..chunk].fill(0);
                stats.sparse_bytes += chunk as u64;
            } else {
                disk.read_at(offset, &mut buffer[..chunk])?;
            }
            out.write_all(&buffer[..chunk])?;
            offset += chunk as u64;
            extent_left -= chunk as u64;
            remaining -= chunk as u64;
            stats.bytes += chunk as u64;
        }

        if remaining == 0 {
            break;
        }
    }

    if remaining > 0 {
        logging::warn(
            "COPY",
            &format!("'{}' is {} bytes short of its declared size", node.name, remaining),
        );
    }
    Ok(())
}

fn split_parent(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, name)) if !name.is_empty() => Ok((if parent.is_empty() { "/" } else { parent }, name)),
        _ => Err(SalvageError::InvalidArgument(format!("{} has no parent directory", path))),
    }
}

/// Host-safe file name
fn host_name(name: &str) -> PathBuf {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\0' { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => PathBuf::from(format!("_{}", cleaned)),
        _ => PathBuf::from(cleaned),
    }
}
