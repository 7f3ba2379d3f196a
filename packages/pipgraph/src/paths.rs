//! Hierarchical path table issuing dense path identifiers.
//!
//! Every in-memory structure in the engine carries [`PathId`]s, never path
//! strings. The table interns parent/child relationships, so an id's chain
//! of parents spells out the absolute path. Identifiers from different
//! tables must never be mixed; use [`PathRemapper`] to translate ids when
//! a reloaded table replaces a live one.
//!
//! Component names compare case-insensitively but preserve their
//! first-seen spelling, matching how the rest of the engine treats paths.

use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use serde::{Deserialize, Serialize};

use crate::{
    case,
    wire::{WireReader, WireWriter},
};

/// Identifier for an interned absolute path.
///
/// `PathId::ROOT` is the virtual filesystem root shared by every chain.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
)]
pub struct PathId(pub u32);

impl PathId {
    pub const ROOT: PathId = PathId(0);
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Node {
    parent: PathId,
    name: String,
}

/// Hierarchical name table interning absolute paths.
///
/// Append-only within an invocation; once ownership of the surrounding
/// context transfers (see the state carry), the table is invalidated and
/// further interning fails.
#[derive(Debug, Default)]
pub struct PathTable {
    nodes: Vec<Node>,
    index: HashMap<(u32, String), u32>,
    invalidated: AtomicBool,
}

impl PathTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of interned path components (excluding the virtual root).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Approximate retained bytes, for historic size accounting.
    pub fn size_in_bytes(&self) -> u64 {
        self.nodes
            .iter()
            .map(|n| n.name.len() as u64 + 12)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Mark the table invalid. New allocations against it fail afterwards;
    /// lookups of already-interned ids keep working so late readers can
    /// still render diagnostics.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    /// Intern an absolute path, returning its identifier.
    pub fn intern(&mut self, path: &Path) -> Result<PathId> {
        if self.is_invalidated() {
            bail!("path table has been invalidated; context ownership was transferred");
        }
        if !path.is_absolute() {
            bail!("only absolute paths may be interned: {path:?}");
        }

        let mut current = PathId::ROOT;
        for component in path.components() {
            let name = match component {
                Component::RootDir => continue,
                Component::Prefix(prefix) => prefix.as_os_str().to_string_lossy().into_owned(),
                Component::Normal(name) => name.to_string_lossy().into_owned(),
                Component::CurDir | Component::ParentDir => {
                    bail!("path must be normalized before interning: {path:?}");
                }
            };
            current = self.child(current, &name);
        }
        Ok(current)
    }

    fn child(&mut self, parent: PathId, name: &str) -> PathId {
        let key = (parent.0, case::fold(name));
        if let Some(&existing) = self.index.get(&key) {
            return PathId(existing);
        }
        let id = (self.nodes.len() + 1) as u32;
        self.nodes.push(Node {
            parent,
            name: name.to_owned(),
        });
        self.index.insert(key, id);
        PathId(id)
    }

    /// Look up a path without interning it.
    pub fn find(&self, path: &Path) -> Option<PathId> {
        let mut current = PathId::ROOT;
        for component in path.components() {
            let name = match component {
                Component::RootDir => continue,
                Component::Prefix(prefix) => prefix.as_os_str().to_string_lossy().into_owned(),
                Component::Normal(name) => name.to_string_lossy().into_owned(),
                _ => return None,
            };
            let key = (current.0, case::fold(&name));
            current = PathId(*self.index.get(&key)?);
        }
        Some(current)
    }

    fn node(&self, id: PathId) -> Option<&Node> {
        if id == PathId::ROOT {
            return None;
        }
        self.nodes.get(id.0 as usize - 1)
    }

    /// The final component name of the path, or `None` for the root.
    pub fn name(&self, id: PathId) -> Option<&str> {
        self.node(id).map(|n| n.name.as_str())
    }

    /// The parent of the path, or `None` for the root.
    pub fn parent(&self, id: PathId) -> Option<PathId> {
        self.node(id).map(|n| n.parent)
    }

    /// Component names from the root down to `id`.
    pub fn chain(&self, id: PathId) -> Vec<&str> {
        let mut names = Vec::new();
        let mut current = id;
        while let Some(node) = self.node(current) {
            names.push(node.name.as_str());
            current = node.parent;
        }
        names.reverse();
        names
    }

    /// Reconstruct the absolute path for an identifier.
    pub fn to_path_buf(&self, id: PathId) -> PathBuf {
        let names = self.chain(id);
        let mut path = PathBuf::new();
        for (i, name) in names.iter().enumerate() {
            if i == 0 {
                if name.ends_with(':') {
                    // Windows drive prefix; re-anchor with its separator.
                    path.push(format!("{name}\\"));
                } else {
                    path.push(std::path::MAIN_SEPARATOR_STR);
                    path.push(name);
                }
            } else {
                path.push(name);
            }
        }
        if path.as_os_str().is_empty() {
            path.push(std::path::MAIN_SEPARATOR_STR);
        }
        path
    }

    /// Whether `ancestor` lies on `id`'s parent chain (or equals it).
    pub fn is_within(&self, id: PathId, ancestor: PathId) -> bool {
        let mut current = id;
        loop {
            if current == ancestor {
                return true;
            }
            match self.parent(current) {
                Some(parent) => current = parent,
                None => return ancestor == PathId::ROOT,
            }
        }
    }

    /// Serialize the table, nodes in issue order.
    pub fn to_wire(&self, writer: &mut WireWriter) {
        writer.put_u32(self.nodes.len() as u32);
        for node in &self.nodes {
            writer.put_u32(node.parent.0);
            writer.put_str(&node.name);
        }
    }

    /// Reconstruct a table serialized by [`PathTable::to_wire`].
    pub fn from_wire(reader: &mut WireReader<'_>) -> Result<Self> {
        let count = reader.get_u32()? as usize;
        let mut table = PathTable::new();
        for i in 0..count {
            let parent = reader.get_u32()?;
            let name = reader.get_str().with_context(|| format!("node {i}"))?;
            if parent as usize > i {
                bail!("node {i} references unissued parent {parent}");
            }
            let id = (table.nodes.len() + 1) as u32;
            table
                .index
                .insert((parent, case::fold(&name)), id);
            table.nodes.push(Node {
                parent: PathId(parent),
                name,
            });
        }
        Ok(table)
    }
}

/// A flat interning table for strings, symbols, and qualifiers.
///
/// Unlike [`PathTable`] there is no hierarchy; ids are dense and
/// issue-ordered. Comparison is case-sensitive: symbols and qualifier
/// texts are spelled exactly.
#[derive(Debug, Default)]
pub struct NameTable {
    items: Vec<String>,
    index: HashMap<String, u32>,
}

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Approximate retained bytes, for historic size accounting.
    pub fn size_in_bytes(&self) -> u64 {
        self.items.iter().map(|s| s.len() as u64 + 8).sum()
    }

    pub fn intern(&mut self, value: &str) -> u32 {
        if let Some(&id) = self.index.get(value) {
            return id;
        }
        let id = self.items.len() as u32;
        self.items.push(value.to_owned());
        self.index.insert(value.to_owned(), id);
        id
    }

    pub fn get(&self, id: u32) -> Option<&str> {
        self.items.get(id as usize).map(String::as_str)
    }

    pub fn to_wire(&self, writer: &mut WireWriter) {
        writer.put_u32(self.items.len() as u32);
        for item in &self.items {
            writer.put_str(item);
        }
    }

    pub fn from_wire(reader: &mut WireReader<'_>) -> Result<Self> {
        let count = reader.get_u32()? as usize;
        let mut table = NameTable::new();
        for _ in 0..count {
            let value = reader.get_str()?;
            table.intern(&value);
        }
        Ok(table)
    }
}

/// Translates identifiers between an old table and a new one.
///
/// Used when a reloaded table replaces a live one: ids recorded against
/// the old table are re-interned into the new table by name chain.
pub struct PathRemapper<'a> {
    old: &'a PathTable,
    cache: HashMap<PathId, PathId>,
}

impl<'a> PathRemapper<'a> {
    pub fn new(old: &'a PathTable) -> Self {
        Self {
            old,
            cache: HashMap::new(),
        }
    }

    /// Translate `id` from the old table into `new`.
    pub fn remap(&mut self, id: PathId, new: &mut PathTable) -> Result<PathId> {
        if let Some(&mapped) = self.cache.get(&id) {
            return Ok(mapped);
        }
        if id == PathId::ROOT {
            return Ok(PathId::ROOT);
        }
        let Some(parent) = self.old.parent(id) else {
            bail!("path id {id:?} is not present in the source table");
        };
        let mapped_parent = self.remap(parent, new)?;
        let name = self
            .old
            .name(id)
            .expect("non-root id with a parent has a name");
        let mapped = new.child(mapped_parent, name);
        self.cache.insert(id, mapped);
        Ok(mapped)
    }
}
