//! Build manager: drives the object mappers in both directions.
//!
//! A manager owns a builder arena and the memo pairing containers with the
//! builders made from (or read into) them. The memo lives as long as the
//! manager; everything else a top-level call needs (the set of containers
//! visited, references waiting for their targets, the rollback journal) is
//! reset per call.
//!
//! # Build
//!
//! ```text
//! build(root)
//!   purge_outdated          drop memo entries of removed containers,
//!                           mark builders of modified ones stale
//!   build_container(root)   memo hit + unmodified -> cached builder
//!                           memo hit + modified   -> refill in place
//!                           miss                  -> new builder, memo first
//!   resolve pending refs    references to containers built later in the pass
//! ```

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::build::type_map::TypeMap;
use crate::error::{AlreadyWrittenError, BackendError, BuilderError, ContainerError, Error, Result};
use crate::limits::MAX_BUILD_DEPTH;
use crate::model::builder::{BuilderId, BuilderValue, Builders, LinkTarget};
use crate::model::class::ClassKind;
use crate::model::container::{ContainerId, ContainerValue, Containers};
use crate::spec::TypeKey;

/// Where a converted value lands on a builder.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Slot {
    Data,
    Attribute(String),
}

/// A value whose references point at containers without builders yet.
#[derive(Debug)]
struct PendingRef {
    builder: BuilderId,
    slot: Slot,
    value: ContainerValue,
    path: String,
}

/// State of one top-level build or construct call.
#[derive(Debug, Default)]
struct Session {
    root: Option<ContainerId>,
    source: Option<String>,
    active: FxHashSet<ContainerId>,
    in_progress: FxHashSet<ContainerId>,
    pending: Vec<PendingRef>,
    journal: Vec<ContainerId>,
    refilled: Vec<BuilderId>,
    constructed: Vec<(BuilderId, ContainerId)>,
    export: bool,
    depth: usize,
}

/// Converts container graphs to builder trees and back.
#[derive(Debug)]
pub struct BuildManager<'a> {
    type_map: &'a TypeMap,
    builders: Builders,
    by_container: FxHashMap<ContainerId, BuilderId>,
    by_builder: FxHashMap<BuilderId, ContainerId>,
    session: Session,
}

impl<'a> BuildManager<'a> {
    pub fn new(type_map: &'a TypeMap) -> Self {
        Self {
            type_map,
            builders: Builders::new(),
            by_container: FxHashMap::default(),
            by_builder: FxHashMap::default(),
            session: Session::default(),
        }
    }

    pub fn type_map(&self) -> &'a TypeMap {
        self.type_map
    }

    pub fn builders(&self) -> &Builders {
        &self.builders
    }

    pub fn builders_mut(&mut self) -> &mut Builders {
        &mut self.builders
    }

    /// Builder last built from (or read into) `container`.
    pub fn get_builder(&self, container: ContainerId) -> Option<BuilderId> {
        self.by_container.get(&container).copied()
    }

    /// Container constructed from (or built into) `builder`.
    pub fn get_container(&self, builder: BuilderId) -> Option<ContainerId> {
        self.by_builder.get(&builder).copied()
    }

    pub(crate) fn is_export(&self) -> bool {
        self.session.export
    }

    // =========================================================================
    // Build
    // =========================================================================

    /// Builds the container graph under `root` into builders.
    ///
    /// `source` is where the tree is going to be written. A container that
    /// was read from, or written to, another source cannot be built for it.
    pub fn build(&mut self, cs: &mut Containers, root: ContainerId, source: Option<&str>) -> Result<BuilderId> {
        self.purge_outdated(cs);
        let container = cs.get(root).ok_or(ContainerError::NotFound)?;
        if !self.session.export {
            if let (Some(existing), Some(requested)) = (container.container_source(), source) {
                if existing != requested {
                    return Err(AlreadyWrittenError::SourceMismatch {
                        container: container.name().to_string(),
                        existing: existing.to_string(),
                        requested: requested.to_string(),
                    }
                    .into());
                }
            }
        }

        self.session = Session {
            root: Some(cs.root_of(root)),
            source: source.map(str::to_string),
            export: self.session.export,
            ..Session::default()
        };
        debug!(container = container.name(), source, "build started");

        let result = self.build_pass(cs, root);
        let session = std::mem::take(&mut self.session);
        match result {
            Ok(builder) => {
                if let Some(source) = source {
                    self.builders.set_source(builder, source);
                    if !session.export {
                        for c in cs.descendants(root) {
                            let unbound = cs.get(c).is_some_and(|x| x.container_source().is_none());
                            if unbound && self.by_container.contains_key(&c) {
                                cs.set_container_source(c, Some(source.to_string()));
                            }
                        }
                    }
                }
                debug!(builders = self.builders.len(), "build finished");
                Ok(builder)
            }
            Err(err) => {
                for c in &session.journal {
                    if let Some(b) = self.by_container.remove(c) {
                        self.by_builder.remove(&b);
                        self.builders.detach(b);
                    }
                }
                for &b in &session.refilled {
                    self.builders.mark_stale(b);
                }
                debug!(error = %err, rolled_back = session.journal.len(), "build failed");
                Err(err)
            }
        }
    }

    fn build_pass(&mut self, cs: &Containers, root: ContainerId) -> Result<BuilderId> {
        let builder = self.build_container(cs, root)?;
        self.resolve_pending(cs)?;
        Ok(builder)
    }

    /// Builds one container, or returns its builder if the memo holds an
    /// up-to-date one.
    pub(crate) fn build_container(&mut self, cs: &Containers, id: ContainerId) -> Result<BuilderId> {
        let cached = self.by_container.get(&id).copied();
        if let Some(b) = cached {
            if self.session.in_progress.contains(&id) || self.session.active.contains(&id) {
                return Ok(b);
            }
        }
        let container = cs.get(id).ok_or(ContainerError::NotFound)?;
        if let Some(b) = cached {
            if !container.is_modified() && !self.builders.is_stale(b) {
                self.session.active.insert(id);
                return Ok(b);
            }
        }

        if !self.session.export {
            if let (Some(existing), Some(requested)) = (container.container_source(), self.session.source.as_deref()) {
                if existing != requested {
                    return Err(AlreadyWrittenError::SourceMismatch {
                        container: container.name().to_string(),
                        existing: existing.to_string(),
                        requested: requested.to_string(),
                    }
                    .into());
                }
            }
        }
        if self.session.depth >= MAX_BUILD_DEPTH {
            return Err(Error::DepthExceeded {
                path: container.name().to_string(),
                max: MAX_BUILD_DEPTH,
            });
        }

        let class = container.class().clone();
        let mapper = self.type_map.get_map(&class)?;
        let builder = match cached {
            Some(b) => {
                self.builders.clear_contents(b);
                self.session.refilled.push(b);
                b
            }
            None => {
                let b = match class.kind() {
                    ClassKind::Container => self.builders.new_group(container.name()),
                    ClassKind::Data => self.builders.new_dataset(container.name(), None, None),
                };
                self.by_container.insert(id, b);
                self.by_builder.insert(b, id);
                self.session.journal.push(id);
                b
            }
        };

        self.session.in_progress.insert(id);
        self.session.depth += 1;
        let result = mapper.build_fields(self, cs, id, builder);
        self.session.depth -= 1;
        self.session.in_progress.remove(&id);
        result?;
        self.session.active.insert(id);
        Ok(builder)
    }

    /// Builder a link to `id` should point at.
    ///
    /// Containers in the graph being built are built (or reused); anything
    /// else has to have an up-to-date builder already.
    pub(crate) fn link_target(&mut self, cs: &Containers, id: ContainerId, path: &str) -> Result<BuilderId> {
        if Some(cs.root_of(id)) == self.session.root {
            return self.build_container(cs, id);
        }
        if let Some(&b) = self.by_container.get(&id) {
            if cs.get(id).is_some_and(|c| !c.is_modified()) && !self.builders.is_stale(b) {
                return Ok(b);
            }
        }
        Err(Error::OrphanContainerBuild {
            path: path.to_string(),
            container: cs.get(id).map(|c| c.name().to_string()).unwrap_or_default(),
        })
    }

    /// Writes `value` into `slot` of `builder`, deferring it to the end of
    /// the pass if a referenced container has no builder yet.
    pub(crate) fn store_value(
        &mut self,
        cs: &Containers,
        builder: BuilderId,
        slot: Slot,
        value: &ContainerValue,
        path: &str,
    ) -> Result<()> {
        let mut deferred = false;
        for &target in value.refs() {
            let in_graph = cs.get(target).is_some() && Some(cs.root_of(target)) == self.session.root;
            if !in_graph {
                return Err(Error::OrphanContainerBuild {
                    path: path.to_string(),
                    container: cs.get(target).map(|c| c.name().to_string()).unwrap_or_default(),
                });
            }
            if !self.by_container.contains_key(&target) {
                deferred = true;
            }
        }
        if deferred {
            debug!(path, "deferring reference until its target is built");
            self.session.pending.push(PendingRef {
                builder,
                slot,
                value: value.clone(),
                path: path.to_string(),
            });
            return Ok(());
        }
        let mapped: BuilderValue = value.try_map_refs(&mut |c| self.by_container.get(c).copied().ok_or(()))
            .map_err(|_| Error::OrphanContainerBuild {
                path: path.to_string(),
                container: String::new(),
            })?;
        self.write_slot(builder, slot, mapped)
    }

    fn write_slot(&mut self, builder: BuilderId, slot: Slot, value: BuilderValue) -> Result<()> {
        match slot {
            Slot::Data => self.builders.set_data(builder, Some(value)),
            Slot::Attribute(name) => self.builders.set_attribute(builder, name, value)?,
        }
        Ok(())
    }

    fn resolve_pending(&mut self, cs: &Containers) -> Result<()> {
        let pending = std::mem::take(&mut self.session.pending);
        for p in pending {
            let mapped = p
                .value
                .try_map_refs(&mut |c| self.by_container.get(c).copied().ok_or(*c));
            match mapped {
                Ok(value) => self.write_slot(p.builder, p.slot, value)?,
                Err(missing) => {
                    return Err(Error::OrphanContainerBuild {
                        path: p.path,
                        container: cs.get(missing).map(|c| c.name().to_string()).unwrap_or_default(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Drops memo entries of containers that no longer exist and marks the
    /// builders of modified containers stale.
    ///
    /// Stale builders keep their memo entry: the next build refills the same
    /// builder, so references held by reused builders stay valid.
    pub fn purge_outdated(&mut self, cs: &Containers) {
        let removed: Vec<ContainerId> = self
            .by_container
            .keys()
            .filter(|&&c| cs.get(c).is_none())
            .copied()
            .collect();
        for c in removed {
            if let Some(b) = self.by_container.remove(&c) {
                self.by_builder.remove(&b);
            }
        }
        let modified: Vec<BuilderId> = self
            .by_container
            .iter()
            .filter(|&(&c, _)| cs.get(c).is_some_and(|x| x.is_modified()))
            .map(|(_, &b)| b)
            .collect();
        for b in modified {
            self.builders.mark_stale(b);
        }
    }

    // =========================================================================
    // Export
    // =========================================================================

    /// Prepares `root`, previously read through `src`, for writing to
    /// `destination`.
    ///
    /// The returned manager works on a copy of `src`'s builders: unmodified
    /// containers reuse their builders, modified ones are rebuilt, and the
    /// exported tree is restamped with the new source. Neither `src` nor the
    /// containers' source bindings change.
    pub fn export(
        src: &BuildManager<'a>,
        cs: &mut Containers,
        root: ContainerId,
        destination: &str,
    ) -> Result<(BuildManager<'a>, BuilderId)> {
        let container = cs.get(root).ok_or(ContainerError::NotFound)?;
        let never_read = || AlreadyWrittenError::NeverRead {
            container: container.name().to_string(),
        };
        if container.container_source().is_none() {
            return Err(never_read().into());
        }
        let Some(&existing) = src.by_container.get(&root) else {
            return Err(never_read().into());
        };
        if src.builders.parent(existing).is_some() {
            return Err(AlreadyWrittenError::NotRoot {
                container: container.name().to_string(),
            }
            .into());
        }

        let mut mgr = BuildManager {
            type_map: src.type_map,
            builders: src.builders.clone(),
            by_container: src.by_container.clone(),
            by_builder: src.by_builder.clone(),
            session: Session {
                export: true,
                ..Session::default()
            },
        };
        let result = mgr.build(cs, root, Some(destination));
        mgr.session.export = false;
        let builder = result?;
        mgr.builders.restamp_source(builder, destination);
        debug!(destination, "export prepared");
        Ok((mgr, builder))
    }

    // =========================================================================
    // Construct
    // =========================================================================

    /// Constructs the container graph stored under `builder`.
    ///
    /// Builders already constructed (or built) by this manager map back to
    /// the same containers. On failure every container created by the call
    /// is discarded.
    pub fn construct(&mut self, cs: &mut Containers, builder: BuilderId) -> Result<ContainerId> {
        if self.builders.get(builder).is_none() {
            return Err(BuilderError::NotFound { index: builder.index() }.into());
        }
        self.session = Session::default();
        let result = self.construct_builder(cs, builder);
        let constructed = std::mem::take(&mut self.session.constructed);
        match result {
            Ok(id) => {
                for &(b, c) in &constructed {
                    let parent = self
                        .builders
                        .typed_ancestor(b)
                        .and_then(|p| self.by_builder.get(&p).copied());
                    if let Some(parent) = parent {
                        cs.adopt_restored(c, parent);
                    }
                }
                debug!(containers = constructed.len(), "construct finished");
                Ok(id)
            }
            Err(err) => {
                for (b, c) in constructed {
                    self.by_builder.remove(&b);
                    self.by_container.remove(&c);
                    cs.release_slot(c);
                }
                Err(err)
            }
        }
    }

    pub(crate) fn construct_builder(&mut self, cs: &mut Containers, builder: BuilderId) -> Result<ContainerId> {
        if let Some(&c) = self.by_builder.get(&builder) {
            return Ok(c);
        }
        let path = self.builders.path(builder);
        if self.session.depth >= MAX_BUILD_DEPTH {
            return Err(Error::DepthExceeded {
                path,
                max: MAX_BUILD_DEPTH,
            });
        }
        let key = self.builder_type(builder).map_err(|e| e.in_construct(&path))?;
        let class = self
            .type_map
            .get_class(&key.data_type, &key.namespace)
            .map_err(|e| e.in_construct(&path))?;
        let mapper = self.type_map.get_map(&class)?;

        let id = cs.reserve();
        self.by_builder.insert(builder, id);
        self.by_container.insert(id, builder);
        self.session.constructed.push((builder, id));

        self.session.depth += 1;
        let restored = mapper.construct_fields(self, cs, &class, builder);
        self.session.depth -= 1;
        let restored = restored.map_err(|e| e.in_construct(&path))?;
        debug!(path = %path, data_type = %key, "constructed container");
        cs.fill(id, restored);
        Ok(id)
    }

    /// Type key recorded on a builder. Builders without a namespace are
    /// looked up in every registered namespace.
    pub(crate) fn builder_type(&self, builder: BuilderId) -> Result<TypeKey> {
        let node = self.builders.node(builder);
        let Some(data_type) = node.data_type() else {
            return Err(Error::Untyped {
                path: self.builders.path(builder),
            });
        };
        match node.namespace() {
            Some(ns) => Ok(self.type_map.catalog().canonical(ns, data_type)?),
            None => {
                warn!(path = %self.builders.path(builder), data_type, "builder has no namespace");
                Ok(self.type_map.find_namespace(data_type)?)
            }
        }
    }

    /// Follows a link builder to its target, across sources if needed.
    pub(crate) fn resolve_link(&self, link: BuilderId) -> Result<BuilderId> {
        match self.builders.follow_links(link) {
            Ok(b) => Ok(b),
            Err(LinkTarget::External { source, path }) => self
                .builders
                .resolve_external(source.as_deref(), &path)
                .ok_or_else(|| {
                    BackendError::UnresolvedPath {
                        source_name: source.unwrap_or_default(),
                        path,
                    }
                    .into()
                }),
            Err(LinkTarget::Builder(_)) => Err(BackendError::UnresolvedPath {
                source_name: self.builders.source(link).unwrap_or_default().to_string(),
                path: self.builders.path(link),
            }
            .into()),
        }
    }

    /// Maps the references of a builder value to constructed containers.
    pub(crate) fn container_value(&mut self, cs: &mut Containers, value: &BuilderValue) -> Result<ContainerValue> {
        value.try_map_refs(&mut |&b| {
            let target = self.resolve_link(b)?;
            self.construct_builder(cs, target)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AlreadyWrittenError;
    use crate::model::container::FieldValue;
    use crate::model::value::Value;
    use crate::spec::{Namespace, NamespaceCatalog, TypeSpec};
    use serde_json::json;

    fn type_map() -> TypeMap {
        let specs = vec![
            TypeSpec::group_from_json(&json!({
                "data_type_def": "Node", "doc": "a node",
                "attributes": [
                    {"name": "weight", "dtype": "float64", "doc": "w", "required": false},
                    {"name": "peer", "dtype": {"target_type": "Node", "reftype": "object"}, "doc": "r", "required": false}
                ],
                "groups": [{"data_type_inc": "Node", "doc": "children", "quantity": "*"}],
                "links": [{"name": "alias", "target_type": "Node", "doc": "l", "quantity": "?"}]
            }))
            .unwrap(),
        ];
        let mut catalog = NamespaceCatalog::new();
        catalog
            .register(Namespace::new("graph", Some("0.1")).unwrap().specs("graph.json", specs))
            .unwrap();
        TypeMap::new(catalog)
    }

    fn node(tm: &TypeMap, cs: &mut Containers, name: &str, fields: Vec<(&str, FieldValue)>) -> ContainerId {
        let class = tm.get_class("Node", "graph").unwrap();
        cs.create(&class, name, fields).unwrap()
    }

    #[test]
    fn test_build_tree() {
        let tm = type_map();
        let mut cs = Containers::new();
        let a = node(&tm, &mut cs, "a", vec![("weight", FieldValue::value(1.5f64))]);
        let b = node(&tm, &mut cs, "b", vec![]);
        let root = node(&tm, &mut cs, "root", vec![("nodes", FieldValue::Children(vec![a, b]))]);

        let mut mgr = BuildManager::new(&tm);
        let rb = mgr.build(&mut cs, root, None).unwrap();
        let builders = mgr.builders();
        assert_eq!(builders.node(rb).data_type(), Some("Node"));
        let ab = builders.child(rb, "a").unwrap();
        assert_eq!(builders.node(ab).attribute("weight"), Some(&Value::Float64(1.5)));
        assert_eq!(mgr.get_builder(a), Some(ab));
        assert_eq!(mgr.get_container(ab), Some(a));
    }

    #[test]
    fn test_memo_reuse_and_refill() {
        let tm = type_map();
        let mut cs = Containers::new();
        let a = node(&tm, &mut cs, "a", vec![]);
        let root = node(&tm, &mut cs, "root", vec![("nodes", FieldValue::Children(vec![a]))]);

        let mut mgr = BuildManager::new(&tm);
        let first = mgr.build(&mut cs, root, Some("one.json")).unwrap();
        let ab = mgr.get_builder(a).unwrap();
        cs.mark_clean(root);
        assert_eq!(mgr.build(&mut cs, root, Some("one.json")).unwrap(), first);
        let count = mgr.builders().len();

        cs.set_field(a, "weight", FieldValue::value(2.0f64)).unwrap();
        let again = mgr.build(&mut cs, root, Some("one.json")).unwrap();
        assert_eq!(again, first);
        assert_eq!(mgr.get_builder(a), Some(ab));
        assert_eq!(mgr.builders().len(), count);
        assert_eq!(
            mgr.builders().node(ab).attribute("weight"),
            Some(&Value::Float64(2.0))
        );
        assert_eq!(mgr.builders().parent(ab), Some(first));
    }

    #[test]
    fn test_forward_reference_and_link() {
        let tm = type_map();
        let mut cs = Containers::new();
        let target = node(&tm, &mut cs, "target", vec![]);
        // "early" refers to "target", which is built after it
        let early = node(&tm, &mut cs, "early", vec![("peer", FieldValue::value(Value::Ref(target)))]);
        let root = node(
            &tm,
            &mut cs,
            "root",
            vec![
                ("nodes", FieldValue::Children(vec![early, target])),
                ("alias", FieldValue::Child(target)),
            ],
        );

        let mut mgr = BuildManager::new(&tm);
        let rb = mgr.build(&mut cs, root, None).unwrap();
        let builders = mgr.builders();
        let tb = builders.child(rb, "target").unwrap();
        let eb = builders.child(rb, "early").unwrap();
        assert_eq!(builders.node(eb).attribute("peer"), Some(&Value::Ref(tb)));
        let alias = builders.child(rb, "alias").unwrap();
        assert_eq!(builders.node(alias).link_target(), Some(&LinkTarget::Builder(tb)));
        assert_eq!(builders.node(rb).links(), &[alias]);
    }

    #[test]
    fn test_reference_outside_graph() {
        let tm = type_map();
        let mut cs = Containers::new();
        let stranger = node(&tm, &mut cs, "stranger", vec![]);
        let root = node(&tm, &mut cs, "root", vec![("peer", FieldValue::value(Value::Ref(stranger)))]);

        let mut mgr = BuildManager::new(&tm);
        match mgr.build(&mut cs, root, None) {
            Err(Error::OrphanContainerBuild { container, .. }) => assert_eq!(container, "stranger"),
            other => panic!("Expected OrphanContainerBuild, got {:?}", other),
        }
        // rolled back
        assert_eq!(mgr.get_builder(root), None);
    }

    #[test]
    fn test_source_mismatch() {
        let tm = type_map();
        let mut cs = Containers::new();
        let root = node(&tm, &mut cs, "root", vec![]);
        let mut mgr = BuildManager::new(&tm);
        mgr.build(&mut cs, root, Some("first.json")).unwrap();
        assert_eq!(cs.get(root).unwrap().container_source(), Some("first.json"));

        match mgr.build(&mut cs, root, Some("second.json")) {
            Err(Error::AlreadyWritten(AlreadyWrittenError::SourceMismatch { existing, requested, .. })) => {
                assert_eq!(existing, "first.json");
                assert_eq!(requested, "second.json");
            }
            other => panic!("Expected SourceMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_export_requires_read_root() {
        let tm = type_map();
        let mut cs = Containers::new();
        let root = node(&tm, &mut cs, "root", vec![]);
        let mgr = BuildManager::new(&tm);
        match BuildManager::export(&mgr, &mut cs, root, "copy.json") {
            Err(Error::AlreadyWritten(AlreadyWrittenError::NeverRead { container })) => assert_eq!(container, "root"),
            other => panic!("Expected NeverRead, got {:?}", other.map(|(_, b)| b)),
        }
    }

    #[test]
    fn test_construct_back() {
        let tm = type_map();
        let mut cs = Containers::new();
        let a = node(&tm, &mut cs, "a", vec![("weight", FieldValue::value(0.25f64))]);
        let root = node(
            &tm,
            &mut cs,
            "root",
            vec![("nodes", FieldValue::Children(vec![a])), ("alias", FieldValue::Child(a))],
        );
        let mut mgr = BuildManager::new(&tm);
        let rb = mgr.build(&mut cs, root, Some("mem")).unwrap();

        let mut reader = BuildManager::new(&tm);
        *reader.builders_mut() = mgr.builders().clone();
        let mut read = Containers::new();
        let back = reader.construct(&mut read, rb).unwrap();
        assert!(cs.same_content(root, &read, back));

        let restored = read.get(back).unwrap();
        assert!(!restored.is_modified());
        assert_eq!(restored.container_source(), Some("mem"));
        let children = restored.field("nodes").unwrap().containers().to_vec();
        assert_eq!(read.get(children[0]).unwrap().parent(), Some(back));
        assert_eq!(restored.field("alias"), Some(&FieldValue::Child(children[0])));
    }

    #[test]
    fn test_construct_untyped_fails_cleanly() {
        let tm = type_map();
        let mut mgr = BuildManager::new(&tm);
        let g = mgr.builders_mut().new_group("plain");
        let mut cs = Containers::new();
        match mgr.construct(&mut cs, g) {
            Err(Error::Construct { path, source }) => {
                assert_eq!(path, "plain");
                assert!(matches!(*source, Error::Untyped { .. }));
            }
            other => panic!("Expected Construct, got {:?}", other),
        }
        assert!(cs.is_empty());
    }
}
