//! Mount expansion: bi-directional mapping between semantic mount names
//! and absolute paths.
//!
//! Fingerprints and serialized records must be machine-independent, so
//! paths under a mount are tokenized as `%MountName%` plus the relative
//! remainder. The expander supports a global scope shared by all modules
//! and per-module scopes that delegate to the global one on miss.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    case,
    paths::{PathId, PathTable},
    wire::{WireReader, WireWriter},
};

/// A named, policy-bearing root path.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Mount {
    pub name: String,
    pub root: PathId,
    pub writable: bool,
    pub readable: bool,
    pub system: bool,
    pub scrubbable: bool,
    pub allow_create_directory: bool,
    pub track_source_file_changes: bool,
}

impl Mount {
    /// A readable, non-writable mount with tracking enabled; the common
    /// shape for source roots.
    pub fn readonly(name: impl Into<String>, root: PathId) -> Self {
        Self {
            name: name.into(),
            root,
            writable: false,
            readable: true,
            system: false,
            scrubbable: false,
            allow_create_directory: false,
            track_source_file_changes: true,
        }
    }

    /// A writable mount; the common shape for output roots.
    pub fn writable(name: impl Into<String>, root: PathId) -> Self {
        Self {
            name: name.into(),
            root,
            writable: true,
            readable: true,
            system: false,
            scrubbable: true,
            allow_create_directory: true,
            track_source_file_changes: false,
        }
    }
}

/// One scope's worth of mounts: the global scope, or one module's scope.
#[derive(Default, Debug, Clone)]
pub struct MountScope {
    /// Declaration order, preserved for serialization.
    mounts: Vec<Mount>,
    /// Name-indexed lookup (first declaration wins; alternates are
    /// excluded).
    by_name: HashMap<String, usize>,
    /// Root-indexed lookup. Alternates do participate here, since they
    /// exist solely so their subtrees tokenize.
    by_root: HashMap<PathId, usize>,
}

impl MountScope {
    /// Add a mount to the scope.
    ///
    /// Fails if the name is already taken in this scope, if the root is
    /// already a mount root, or if the root is an ancestor or descendant
    /// of an existing root in this scope.
    pub fn add(&mut self, table: &PathTable, mount: Mount) -> Result<()> {
        let key = case::fold(&mount.name);
        if self.by_name.contains_key(&key) {
            bail!("mount name already defined in scope: {:?}", mount.name);
        }
        if self.by_root.contains_key(&mount.root) {
            bail!(
                "path is already a mount root: {:?}",
                table.to_path_buf(mount.root)
            );
        }
        for existing in &self.mounts {
            if table.is_within(mount.root, existing.root)
                || table.is_within(existing.root, mount.root)
            {
                bail!(
                    "mount roots may not nest within one scope: {:?} overlaps {:?}",
                    table.to_path_buf(mount.root),
                    table.to_path_buf(existing.root),
                );
            }
        }

        trace!(name = %mount.name, root = ?mount.root, "add mount");
        self.by_name.insert(key, self.mounts.len());
        self.by_root.insert(mount.root, self.mounts.len());
        self.mounts.push(mount);
        Ok(())
    }

    /// Add an alternative root under an existing name.
    ///
    /// The alternate is used solely for tokenization: paths beneath it
    /// render as `%name%`, but name lookup keeps resolving to the original
    /// root. The ancestor-overlap invariant is not enforced for
    /// alternates.
    pub fn add_alternate_root(&mut self, mount: Mount) -> Result<()> {
        let key = case::fold(&mount.name);
        if !self.by_name.contains_key(&key) {
            bail!(
                "alternative root requires an existing mount name: {:?}",
                mount.name
            );
        }
        if self.by_root.contains_key(&mount.root) {
            bail!("path is already a mount root: {:?}", mount.root);
        }
        self.by_root.insert(mount.root, self.mounts.len());
        self.mounts.push(mount);
        Ok(())
    }

    fn find_by_name(&self, name: &str) -> Option<&Mount> {
        self.by_name
            .get(&case::fold(name))
            .map(|&idx| &self.mounts[idx])
    }

    fn find_by_root(&self, root: PathId) -> Option<&Mount> {
        self.by_root.get(&root).map(|&idx| &self.mounts[idx])
    }

    /// Mounts in declaration order.
    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }
}

/// The full mount expander: the global scope plus per-module scopes.
#[derive(Default, Debug, Clone)]
pub struct MountExpander {
    global: MountScope,
    modules: HashMap<String, MountScope>,
}

/// A borrow-on-read view of one module's effective mounts: the module's
/// own scope layered over the global scope.
#[derive(Copy, Clone, Debug)]
pub struct ScopedExpander<'a> {
    expander: &'a MountExpander,
    module: Option<&'a MountScope>,
}

impl MountExpander {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global_mut(&mut self) -> &mut MountScope {
        &mut self.global
    }

    pub fn global(&self) -> &MountScope {
        &self.global
    }

    /// Create (or fetch) a module scope for later population.
    pub fn module_scope_mut(&mut self, module: &str) -> &mut MountScope {
        self.modules.entry(case::fold(module)).or_default()
    }

    /// Borrow the effective view for a module (or the global view when
    /// `module` is `None`).
    pub fn scope(&self, module: Option<&str>) -> ScopedExpander<'_> {
        ScopedExpander {
            expander: self,
            module: module.and_then(|m| self.modules.get(&case::fold(m))),
        }
    }

    /// Module names with their own scopes, in no particular order.
    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Serialize: global scope first in declaration order, then module
    /// scopes sorted by name.
    pub fn to_wire(&self, writer: &mut WireWriter) {
        fn write_scope(writer: &mut WireWriter, scope: &MountScope) {
            writer.put_u32(scope.mounts.len() as u32);
            for mount in &scope.mounts {
                writer.put_str(&mount.name);
                writer.put_u32(mount.root.0);
                writer.put_bool(mount.writable);
                writer.put_bool(mount.readable);
                writer.put_bool(mount.system);
                writer.put_bool(mount.scrubbable);
                writer.put_bool(mount.allow_create_directory);
                writer.put_bool(mount.track_source_file_changes);
            }
        }

        write_scope(writer, &self.global);
        let mut names: Vec<&String> = self.modules.keys().collect();
        names.sort();
        writer.put_u32(names.len() as u32);
        for name in names {
            writer.put_str(name);
            write_scope(writer, &self.modules[name]);
        }
    }

    /// Reconstruct the global scope first, then module scopes.
    ///
    /// Alternates are not distinguishable on the wire from primary
    /// declarations; a repeated name deserializes as an alternate, which
    /// matches how it behaved in the writing process.
    pub fn from_wire(reader: &mut WireReader<'_>, table: &PathTable) -> Result<Self> {
        fn read_scope(reader: &mut WireReader<'_>, table: &PathTable) -> Result<MountScope> {
            let count = reader.get_u32()? as usize;
            let mut scope = MountScope::default();
            for i in 0..count {
                let name = reader.get_str().with_context(|| format!("mount {i}"))?;
                let root = PathId(reader.get_u32()?);
                let mount = Mount {
                    name,
                    root,
                    writable: reader.get_bool()?,
                    readable: reader.get_bool()?,
                    system: reader.get_bool()?,
                    scrubbable: reader.get_bool()?,
                    allow_create_directory: reader.get_bool()?,
                    track_source_file_changes: reader.get_bool()?,
                };
                if scope.by_name.contains_key(&case::fold(&mount.name)) {
                    scope.add_alternate_root(mount)?;
                } else {
                    scope.add(table, mount)?;
                }
            }
            Ok(scope)
        }

        let global = read_scope(reader, table).context("global scope")?;
        let module_count = reader.get_u32()? as usize;
        let mut modules = HashMap::new();
        for _ in 0..module_count {
            let name = reader.get_str()?;
            let scope = read_scope(reader, table).with_context(|| format!("module {name:?}"))?;
            modules.insert(name, scope);
        }
        Ok(Self { global, modules })
    }
}

impl<'a> ScopedExpander<'a> {
    /// Resolve a mount by name: module scope first, global on miss.
    pub fn resolve(&self, name: &str) -> Option<&'a Mount> {
        self.module
            .and_then(|scope| scope.find_by_name(name))
            .or_else(|| self.expander.global.find_by_name(name))
    }

    fn mount_at_root(&self, root: PathId) -> Option<&'a Mount> {
        self.module
            .and_then(|scope| scope.find_by_root(root))
            .or_else(|| self.expander.global.find_by_root(root))
    }

    /// Render a path id as a string, substituting `%MountName%` for the
    /// nearest enclosing mount root.
    pub fn tokenize(&self, table: &PathTable, id: PathId) -> String {
        // Walk from the leaf up; the first id carrying the root flag wins.
        let mut suffix: Vec<&str> = Vec::new();
        let mut current = id;
        loop {
            if let Some(mount) = self.mount_at_root(current) {
                let mut out = format!("%{}%", mount.name);
                for part in suffix.iter().rev() {
                    out.push(std::path::MAIN_SEPARATOR);
                    out.push_str(part);
                }
                return out;
            }
            match table.parent(current) {
                Some(parent) => {
                    if let Some(name) = table.name(current) {
                        suffix.push(name);
                    }
                    current = parent;
                }
                None => break,
            }
        }
        table.to_path_buf(id).to_string_lossy().into_owned()
    }

    /// Parse a possibly-tokenized string back into a path id, interning
    /// into the provided table.
    pub fn expand(&self, table: &mut PathTable, value: &str) -> Result<PathId> {
        let Some(rest) = value.strip_prefix('%') else {
            return table
                .intern(Path::new(value))
                .with_context(|| format!("expand plain path: {value:?}"));
        };
        let Some((name, remainder)) = rest.split_once('%') else {
            bail!("unterminated mount token: {value:?}");
        };
        let Some(mount) = self.resolve(name) else {
            bail!("unknown mount name: {name:?}");
        };

        let mut path = table.to_path_buf(mount.root);
        let remainder = remainder.trim_start_matches(['/', '\\']);
        if !remainder.is_empty() {
            path.push(PathBuf::from(remainder));
        }
        table
            .intern(&path)
            .with_context(|| format!("expand tokenized path: {value:?}"))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq as pretty_assert_eq;

    use super::*;

    fn setup() -> (PathTable, MountExpander) {
        let mut table = PathTable::new();
        let src = table.intern(Path::new("/repo/src")).unwrap();
        let out = table.intern(Path::new("/repo/out")).unwrap();
        let mut expander = MountExpander::new();
        expander
            .global_mut()
            .add(&table, Mount::readonly("SourceRoot", src))
            .unwrap();
        expander
            .global_mut()
            .add(&table, Mount::writable("ObjectRoot", out))
            .unwrap();
        (table, expander)
    }

    #[test]
    fn duplicate_name_in_scope_fails() {
        let (mut table, mut expander) = setup();
        let elsewhere = table.intern(Path::new("/elsewhere")).unwrap();
        let err = expander
            .global_mut()
            .add(&table, Mount::readonly("sourceroot", elsewhere))
            .unwrap_err();
        assert!(err.to_string().contains("already defined"));
    }

    #[test]
    fn nested_roots_in_scope_fail() {
        let (mut table, mut expander) = setup();
        let nested = table.intern(Path::new("/repo/src/nested")).unwrap();
        let err = expander
            .global_mut()
            .add(&table, Mount::readonly("Nested", nested))
            .unwrap_err();
        assert!(err.to_string().contains("may not nest"));
    }

    #[test]
    fn existing_root_fails() {
        let (table, mut expander) = setup();
        let src = table.find(Path::new("/repo/src")).unwrap();
        let err = expander
            .global_mut()
            .add(&table, Mount::readonly("Another", src))
            .unwrap_err();
        assert!(err.to_string().contains("already a mount root"));
    }

    #[test]
    fn tokenize_substitutes_nearest_mount() {
        let (mut table, expander) = setup();
        let file = table.intern(Path::new("/repo/src/module/a.dsc")).unwrap();
        let scope = expander.scope(None);
        pretty_assert_eq!(scope.tokenize(&table, file), "%SourceRoot%/module/a.dsc");
    }

    #[test]
    fn tokenize_outside_any_mount_is_absolute() {
        let (mut table, expander) = setup();
        let file = table.intern(Path::new("/etc/hosts")).unwrap();
        let scope = expander.scope(None);
        pretty_assert_eq!(scope.tokenize(&table, file), "/etc/hosts");
    }

    #[test]
    fn expand_round_trips_tokenized_paths() {
        let (mut table, expander) = setup();
        let file = table.intern(Path::new("/repo/src/module/a.dsc")).unwrap();
        let scope = expander.scope(None);
        let tokenized = scope.tokenize(&table, file);
        let expanded = scope.expand(&mut table, &tokenized).unwrap();
        pretty_assert_eq!(expanded, file);
    }

    #[test]
    fn expand_rejects_unknown_mounts() {
        let (mut table, expander) = setup();
        let scope = expander.scope(None);
        assert!(scope.expand(&mut table, "%NoSuchMount%/x").is_err());
    }

    #[test]
    fn module_scope_shadows_global() {
        let (mut table, mut expander) = setup();
        let module_src = table.intern(Path::new("/repo/modules/m1")).unwrap();
        expander
            .module_scope_mut("M1")
            .add(&table, Mount::readonly("SourceRoot", module_src))
            .unwrap();

        let scoped = expander.scope(Some("m1"));
        pretty_assert_eq!(scoped.resolve("SourceRoot").unwrap().root, module_src);

        // Global names still resolve through the module scope.
        assert!(scoped.resolve("ObjectRoot").is_some());

        // Other modules see the global mount.
        let global = expander.scope(Some("other"));
        let src = table.find(Path::new("/repo/src")).unwrap();
        pretty_assert_eq!(global.resolve("SourceRoot").unwrap().root, src);
    }

    #[test]
    fn alternate_root_tokenizes_but_does_not_resolve() {
        let (mut table, mut expander) = setup();
        let alt = table.intern(Path::new("/mirror/src")).unwrap();
        expander
            .global_mut()
            .add_alternate_root(Mount::readonly("SourceRoot", alt))
            .unwrap();

        let scope = expander.scope(None);
        let under_alt = table.intern(Path::new("/mirror/src/b.dsc")).unwrap();
        pretty_assert_eq!(scope.tokenize(&table, under_alt), "%SourceRoot%/b.dsc");

        // Resolution keeps pointing at the original root.
        let src = table.find(Path::new("/repo/src")).unwrap();
        pretty_assert_eq!(scope.resolve("SourceRoot").unwrap().root, src);
    }

    #[test]
    fn wire_round_trip() {
        let (mut table, mut expander) = setup();
        let module_src = table.intern(Path::new("/repo/modules/m1")).unwrap();
        expander
            .module_scope_mut("M1")
            .add(&table, Mount::readonly("ModuleRoot", module_src))
            .unwrap();

        let mut writer = WireWriter::new();
        expander.to_wire(&mut writer);
        let bytes = writer.into_bytes();

        let restored = MountExpander::from_wire(&mut WireReader::new(&bytes), &table).unwrap();
        pretty_assert_eq!(
            restored.global().mounts().len(),
            expander.global().mounts().len()
        );
        let scope = restored.scope(Some("m1"));
        pretty_assert_eq!(scope.resolve("ModuleRoot").unwrap().root, module_src);
    }
}
