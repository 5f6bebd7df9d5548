//! Builder tree: the storage-agnostic intermediate representation.
//!
//! Builders live in a [`Builders`] arena and are addressed by [`BuilderId`].
//! Parent links are indices, so a child never owns its parent. Groups hold
//! ordered sub-groups, datasets and links whose names are unique across the
//! three kinds.
//!
//! # Example
//!
//! ```rust
//! use hdmf::model::builder::Builders;
//!
//! let mut builders = Builders::new();
//! let root = builders
//!     .group("root", |g| g
//!         .attribute("data_type", "Library")
//!         .group("shelf", |s| s.dataset("books", vec![1i32, 2, 3], |d| d))
//!     )
//!     .unwrap();
//! let books = builders.resolve_path(root, "/shelf/books").unwrap();
//! assert_eq!(builders.path(books), "root/shelf/books");
//! ```

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::BuilderError;
use crate::model::value::{DType, Value};

/// Attribute holding the data type of a typed builder.
pub const TYPE_ATTR: &str = "data_type";
/// Attribute holding the namespace of a typed builder.
pub const NAMESPACE_ATTR: &str = "namespace";
/// Attribute holding the object id of a typed builder.
pub const OBJECT_ID_ATTR: &str = "object_id";

/// Handle of a builder inside a [`Builders`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuilderId(u32);

impl BuilderId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A payload whose references point at builders.
pub type BuilderValue = Value<BuilderId>;

/// What a link builder points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LinkTarget {
    /// A builder in the same arena.
    Builder(BuilderId),
    /// An object in another source, addressed by its root-relative path.
    External { source: Option<String>, path: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Group,
    Dataset,
    Link,
}

#[derive(Debug, Clone)]
enum Body {
    Group {
        groups: Vec<BuilderId>,
        datasets: Vec<BuilderId>,
        links: Vec<BuilderId>,
        names: FxHashMap<String, BuilderId>,
    },
    Dataset {
        data: Option<BuilderValue>,
        dtype: Option<DType>,
    },
    Link {
        target: LinkTarget,
    },
}

/// One node of the builder tree.
#[derive(Debug, Clone)]
pub struct BuilderNode {
    name: String,
    parent: Option<BuilderId>,
    source: Option<String>,
    attributes: Vec<(String, BuilderValue)>,
    body: Body,
}

impl BuilderNode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<BuilderId> {
        self.parent
    }

    /// The storage location this builder belongs to.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn kind(&self) -> NodeKind {
        match self.body {
            Body::Group { .. } => NodeKind::Group,
            Body::Dataset { .. } => NodeKind::Dataset,
            Body::Link { .. } => NodeKind::Link,
        }
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &BuilderValue)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn attribute(&self, name: &str) -> Option<&BuilderValue> {
        self.attributes.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// The `data_type` attribute, if this builder is typed.
    pub fn data_type(&self) -> Option<&str> {
        self.attribute(TYPE_ATTR).and_then(Value::as_text)
    }

    /// The `namespace` attribute, if present.
    pub fn namespace(&self) -> Option<&str> {
        self.attribute(NAMESPACE_ATTR).and_then(Value::as_text)
    }

    pub fn data(&self) -> Option<&BuilderValue> {
        match &self.body {
            Body::Dataset { data, .. } => data.as_ref(),
            _ => None,
        }
    }

    pub fn dtype(&self) -> Option<&DType> {
        match &self.body {
            Body::Dataset { dtype, .. } => dtype.as_ref(),
            _ => None,
        }
    }

    pub fn link_target(&self) -> Option<&LinkTarget> {
        match &self.body {
            Body::Link { target } => Some(target),
            _ => None,
        }
    }

    pub fn groups(&self) -> &[BuilderId] {
        match &self.body {
            Body::Group { groups, .. } => groups,
            _ => &[],
        }
    }

    pub fn datasets(&self) -> &[BuilderId] {
        match &self.body {
            Body::Group { datasets, .. } => datasets,
            _ => &[],
        }
    }

    pub fn links(&self) -> &[BuilderId] {
        match &self.body {
            Body::Group { links, .. } => links,
            _ => &[],
        }
    }

    /// Sub-groups, datasets and links in that order.
    pub fn children(&self) -> impl Iterator<Item = BuilderId> + '_ {
        self.groups()
            .iter()
            .chain(self.datasets())
            .chain(self.links())
            .copied()
    }
}

/// Arena of builders.
#[derive(Debug, Clone, Default)]
pub struct Builders {
    nodes: Vec<BuilderNode>,
    stale: FxHashSet<BuilderId>,
    /// Released untyped nodes, reused by the next allocations.
    free: Vec<BuilderId>,
}

impl Builders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn alloc(&mut self, name: String, body: Body) -> BuilderId {
        let node = BuilderNode {
            name,
            parent: None,
            source: None,
            attributes: Vec::new(),
            body,
        };
        if let Some(id) = self.free.pop() {
            self.stale.remove(&id);
            self.nodes[id.index()] = node;
            return id;
        }
        let id = BuilderId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// Allocates an empty, detached group.
    pub fn new_group(&mut self, name: impl Into<String>) -> BuilderId {
        self.alloc(
            name.into(),
            Body::Group {
                groups: Vec::new(),
                datasets: Vec::new(),
                links: Vec::new(),
                names: FxHashMap::default(),
            },
        )
    }

    /// Allocates a detached dataset.
    pub fn new_dataset(&mut self, name: impl Into<String>, data: Option<BuilderValue>, dtype: Option<DType>) -> BuilderId {
        self.alloc(name.into(), Body::Dataset { data, dtype })
    }

    /// Allocates a detached link.
    pub fn new_link(&mut self, name: impl Into<String>, target: LinkTarget) -> BuilderId {
        self.alloc(name.into(), Body::Link { target })
    }

    pub fn get(&self, id: BuilderId) -> Option<&BuilderNode> {
        self.nodes.get(id.index())
    }

    /// Returns the node for `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not allocated by this arena.
    pub fn node(&self, id: BuilderId) -> &BuilderNode {
        &self.nodes[id.index()]
    }

    fn node_mut(&mut self, id: BuilderId) -> &mut BuilderNode {
        &mut self.nodes[id.index()]
    }

    pub fn name(&self, id: BuilderId) -> &str {
        &self.node(id).name
    }

    pub fn parent(&self, id: BuilderId) -> Option<BuilderId> {
        self.node(id).parent
    }

    /// Slash-joined names from the root down to `id` (e.g. "root/a/b").
    pub fn path(&self, id: BuilderId) -> String {
        let mut names = vec![self.name(id)];
        let mut current = self.parent(id);
        while let Some(p) = current {
            names.push(self.name(p));
            current = self.parent(p);
        }
        names.reverse();
        names.join("/")
    }

    /// Path of `id` below `root` ("/a/b"), or `None` if it is not a descendant.
    pub fn relative_path(&self, root: BuilderId, id: BuilderId) -> Option<String> {
        let mut names = Vec::new();
        let mut current = id;
        while current != root {
            names.push(self.name(current));
            current = self.parent(current)?;
        }
        names.reverse();
        Some(format!("/{}", names.join("/")))
    }

    pub fn root_of(&self, id: BuilderId) -> BuilderId {
        let mut current = id;
        while let Some(p) = self.parent(current) {
            current = p;
        }
        current
    }

    /// Named child of a group.
    pub fn child(&self, parent: BuilderId, name: &str) -> Option<BuilderId> {
        match &self.node(parent).body {
            Body::Group { names, .. } => names.get(name).copied(),
            _ => None,
        }
    }

    /// Walks a root-relative path ("/a/b" or "a/b") without following links.
    pub fn resolve_path(&self, root: BuilderId, path: &str) -> Option<BuilderId> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(root, |current, name| self.child(current, name))
    }

    /// Finds the builder at `path` below a root whose source is `source`.
    pub fn resolve_external(&self, source: Option<&str>, path: &str) -> Option<BuilderId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(i, n)| n.parent.is_none() && n.source.as_deref() == source && !self.is_stale(BuilderId(*i as u32)))
            .find_map(|(i, _)| self.resolve_path(BuilderId(i as u32), path))
    }

    /// Follows link builders until a non-link builder (or an external target) is reached.
    pub fn follow_links(&self, id: BuilderId) -> Result<BuilderId, LinkTarget> {
        let mut current = id;
        let mut hops = 0usize;
        while let Some(target) = self.node(current).link_target() {
            match target {
                LinkTarget::Builder(b) if hops < self.nodes.len() => {
                    current = *b;
                    hops += 1;
                }
                other => return Err(other.clone()),
            }
        }
        Ok(current)
    }

    pub fn source(&self, id: BuilderId) -> Option<&str> {
        self.node(id).source.as_deref()
    }

    /// Sets the source of `id` and of every owned descendant that has none.
    pub fn set_source(&mut self, id: BuilderId, source: &str) {
        self.stamp(id, source, false);
    }

    /// Sets the source of `id` and all owned descendants, replacing existing values.
    pub fn restamp_source(&mut self, id: BuilderId, source: &str) {
        self.stamp(id, source, true);
    }

    fn stamp(&mut self, id: BuilderId, source: &str, overwrite: bool) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = self.node_mut(current);
            if node.source.is_some() && !overwrite {
                continue;
            }
            node.source = Some(source.to_string());
            stack.extend(node.children());
        }
    }

    /// Sets or replaces an attribute.
    pub fn set_attribute(&mut self, id: BuilderId, name: impl Into<String>, value: BuilderValue) -> Result<(), BuilderError> {
        if self.node(id).kind() == NodeKind::Link {
            return Err(BuilderError::AttributeOnLink { path: self.path(id) });
        }
        let name = name.into();
        let node = self.node_mut(id);
        match node.attributes.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => node.attributes.push((name, value)),
        }
        Ok(())
    }

    /// Replaces the payload of a dataset. Ignored for groups and links.
    pub fn set_data(&mut self, id: BuilderId, value: Option<BuilderValue>) {
        if let Body::Dataset { data, .. } = &mut self.node_mut(id).body {
            *data = value;
        }
    }

    pub fn set_dtype(&mut self, id: BuilderId, value: Option<DType>) {
        if let Body::Dataset { dtype, .. } = &mut self.node_mut(id).body {
            *dtype = value;
        }
    }

    /// Attaches `child` under the group `parent`.
    ///
    /// Re-attaching a child to its current parent is a no-op. Attaching a
    /// builder that belongs to another (non-stale) parent fails with
    /// [`BuilderError::OrphanBuilder`]; a different builder already using the
    /// child's name fails with [`BuilderError::NameCollision`].
    pub fn set_child(&mut self, parent: BuilderId, child: BuilderId) -> Result<(), BuilderError> {
        if self.node(parent).kind() != NodeKind::Group {
            return Err(BuilderError::NotAGroup { path: self.path(parent) });
        }
        if let Some(existing) = self.parent(child) {
            if existing == parent {
                return Ok(());
            }
            if !self.is_stale(existing) {
                return Err(BuilderError::OrphanBuilder {
                    child: self.name(child).to_string(),
                    parent: self.path(parent),
                    existing: self.path(existing),
                });
            }
            self.detach(child);
        }
        let name = self.name(child).to_string();
        if let Some(&other) = self.child_names(parent).and_then(|names| names.get(&name)) {
            if other != child {
                return Err(BuilderError::NameCollision {
                    parent: self.path(parent),
                    name,
                });
            }
        }
        let kind = self.node(child).kind();
        if let Body::Group {
            groups,
            datasets,
            links,
            names,
        } = &mut self.node_mut(parent).body
        {
            match kind {
                NodeKind::Group => groups.push(child),
                NodeKind::Dataset => datasets.push(child),
                NodeKind::Link => links.push(child),
            }
            names.insert(name, child);
        }
        self.node_mut(child).parent = Some(parent);
        if let Some(source) = self.node(parent).source.clone() {
            self.set_source(child, &source);
        }
        Ok(())
    }

    fn child_names(&self, parent: BuilderId) -> Option<&FxHashMap<String, BuilderId>> {
        match &self.node(parent).body {
            Body::Group { names, .. } => Some(names),
            _ => None,
        }
    }

    /// Creates a link to `target` named `name` under `parent`.
    pub fn add_link(&mut self, parent: BuilderId, name: impl Into<String>, target: BuilderId) -> Result<BuilderId, BuilderError> {
        let link = self.new_link(name, LinkTarget::Builder(target));
        self.set_child(parent, link)?;
        Ok(link)
    }

    /// Removes `child` from its parent's children.
    pub fn detach(&mut self, child: BuilderId) {
        let Some(parent) = self.parent(child) else {
            return;
        };
        if let Body::Group {
            groups,
            datasets,
            links,
            names,
        } = &mut self.node_mut(parent).body
        {
            groups.retain(|&c| c != child);
            datasets.retain(|&c| c != child);
            links.retain(|&c| c != child);
            names.retain(|_, &mut c| c != child);
        }
        self.node_mut(child).parent = None;
    }

    /// Empties a builder so it can be rebuilt in place.
    ///
    /// Children are detached, attributes dropped and dataset payloads cleared.
    /// The builder keeps its id, name, parent and source. Typed descendants
    /// (those with a `data_type` attribute) are only detached, so they can be
    /// attached again; untyped groups, datasets and links below the builder
    /// are released and their slots reused.
    pub fn clear_contents(&mut self, id: BuilderId) {
        let children: Vec<BuilderId> = self.node(id).children().collect();
        for child in children {
            self.release(child);
        }
        let node = self.node_mut(id);
        node.attributes.clear();
        match &mut node.body {
            Body::Group {
                groups,
                datasets,
                links,
                names,
            } => {
                groups.clear();
                datasets.clear();
                links.clear();
                names.clear();
            }
            Body::Dataset { data, .. } => *data = None,
            Body::Link { .. } => {}
        }
        self.stale.remove(&id);
    }

    /// Detaches `id`; untyped builders in its subtree are freed for reuse.
    pub(crate) fn release(&mut self, id: BuilderId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            self.node_mut(current).parent = None;
            if self.node(current).data_type().is_some() {
                continue;
            }
            stack.extend(self.node(current).children());
            let node = self.node_mut(current);
            node.attributes.clear();
            node.source = None;
            node.body = Body::Dataset { data: None, dtype: None };
            self.stale.insert(current);
            self.free.push(current);
        }
    }

    /// Number of allocated slots currently holding a live builder.
    pub fn live_len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Marks a builder as outdated so its children may be adopted elsewhere.
    pub fn mark_stale(&mut self, id: BuilderId) {
        self.stale.insert(id);
    }

    pub fn is_stale(&self, id: BuilderId) -> bool {
        self.stale.contains(&id)
    }

    /// True if a group has no attributes and no children, or a dataset has
    /// neither attributes nor data.
    pub fn is_empty_node(&self, id: BuilderId) -> bool {
        let node = self.node(id);
        if !node.attributes.is_empty() {
            return false;
        }
        match &node.body {
            Body::Group { names, .. } => names.is_empty(),
            Body::Dataset { data, .. } => data.is_none(),
            Body::Link { .. } => false,
        }
    }

    /// Nearest strict ancestor carrying a `data_type` attribute.
    pub fn typed_ancestor(&self, id: BuilderId) -> Option<BuilderId> {
        let mut current = self.parent(id);
        while let Some(p) = current {
            if self.node(p).data_type().is_some() {
                return Some(p);
            }
            current = self.parent(p);
        }
        None
    }

    /// `root` and every builder it owns, in pre-order. Links are included
    /// but not followed.
    pub fn descendants(&self, root: BuilderId) -> Vec<BuilderId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(current) = stack.pop() {
            out.push(current);
            let children: Vec<BuilderId> = self.node(current).children().collect();
            stack.extend(children.into_iter().rev());
        }
        out
    }

    /// Builds a detached group through a fluent scope.
    pub fn group<F>(&mut self, name: impl Into<String>, f: F) -> Result<BuilderId, BuilderError>
    where
        F: for<'c> FnOnce(GroupScope<'c>) -> GroupScope<'c>,
    {
        let id = self.new_group(name);
        f(GroupScope::new(self, id)).finish()
    }
}

// =============================================================================
// Fluent construction
// =============================================================================

/// Fluent scope for filling a group. Errors are collected and reported by
/// [`finish`](GroupScope::finish).
#[derive(Debug)]
pub struct GroupScope<'b> {
    builders: &'b mut Builders,
    id: BuilderId,
    error: Option<BuilderError>,
}

impl<'b> GroupScope<'b> {
    fn new(builders: &'b mut Builders, id: BuilderId) -> Self {
        Self {
            builders,
            id,
            error: None,
        }
    }

    pub fn id(&self) -> BuilderId {
        self.id
    }

    fn record(&mut self, result: Result<(), BuilderError>) {
        if let Err(e) = result {
            self.error.get_or_insert(e);
        }
    }

    pub fn attribute(mut self, name: &str, value: impl Into<BuilderValue>) -> Self {
        let result = self.builders.set_attribute(self.id, name, value.into());
        self.record(result);
        self
    }

    /// Adds a sub-group filled by `f`.
    pub fn group<F>(mut self, name: &str, f: F) -> Self
    where
        F: for<'c> FnOnce(GroupScope<'c>) -> GroupScope<'c>,
    {
        let child = self.builders.new_group(name);
        let inner = f(GroupScope::new(&mut *self.builders, child)).error;
        if let Some(e) = inner {
            self.error.get_or_insert(e);
        }
        let result = self.builders.set_child(self.id, child);
        self.record(result);
        self
    }

    /// Adds a dataset holding `data`, with attributes set by `f`.
    pub fn dataset<F>(mut self, name: &str, data: impl Into<BuilderValue>, f: F) -> Self
    where
        F: for<'c> FnOnce(DatasetScope<'c>) -> DatasetScope<'c>,
    {
        let child = self.builders.new_dataset(name, Some(data.into()), None);
        let inner = f(DatasetScope {
            builders: &mut *self.builders,
            id: child,
            error: None,
        })
        .error;
        if let Some(e) = inner {
            self.error.get_or_insert(e);
        }
        let result = self.builders.set_child(self.id, child);
        self.record(result);
        self
    }

    /// Adds a link to a builder of the same arena.
    pub fn link(mut self, name: &str, target: BuilderId) -> Self {
        let result = self.builders.add_link(self.id, name, target).map(|_| ());
        self.record(result);
        self
    }

    /// Adds a link to an object in another source.
    pub fn external_link(mut self, name: &str, source: &str, path: &str) -> Self {
        let link = self.builders.new_link(
            name,
            LinkTarget::External {
                source: Some(source.to_string()),
                path: path.to_string(),
            },
        );
        let result = self.builders.set_child(self.id, link);
        self.record(result);
        self
    }

    pub fn finish(self) -> Result<BuilderId, BuilderError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.id),
        }
    }
}

/// Fluent scope for a dataset's attributes and dtype.
#[derive(Debug)]
pub struct DatasetScope<'b> {
    builders: &'b mut Builders,
    id: BuilderId,
    error: Option<BuilderError>,
}

impl<'b> DatasetScope<'b> {
    pub fn id(&self) -> BuilderId {
        self.id
    }

    pub fn attribute(mut self, name: &str, value: impl Into<BuilderValue>) -> Self {
        if let Err(e) = self.builders.set_attribute(self.id, name, value.into()) {
            self.error.get_or_insert(e);
        }
        self
    }

    pub fn dtype(self, dtype: impl Into<DType>) -> Self {
        self.builders.set_dtype(self.id, Some(dtype.into()));
        self
    }
}
