//! Containers: the in-memory domain objects.
//!
//! Containers live in a [`Containers`] arena. Each has a single parent
//! (assigned at most once), exclusively owns the containers in its child
//! fields, and tracks whether it changed since it was last read.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::error::ContainerError;
use crate::model::class::{ClassKind, ContainerClass, FieldKind};
use crate::model::id::{ObjectId, new_object_id};
use crate::model::index::RaggedColumn;
use crate::model::value::Value;

/// Handle of a container inside a [`Containers`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(u32);

impl ContainerId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A payload whose references point at containers.
pub type ContainerValue = Value<ContainerId>;

/// Contents of one container field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Value(ContainerValue),
    Ragged(RaggedColumn<ContainerId>),
    Child(ContainerId),
    Children(Vec<ContainerId>),
}

impl FieldValue {
    /// Wraps anything convertible to a value.
    pub fn value(v: impl Into<ContainerValue>) -> Self {
        FieldValue::Value(v.into())
    }

    pub fn describe(&self) -> &'static str {
        match self {
            FieldValue::Value(_) => "a value",
            FieldValue::Ragged(_) => "a ragged column",
            FieldValue::Child(_) => "a container",
            FieldValue::Children(_) => "a list of containers",
        }
    }

    /// Containers held directly by this field.
    pub fn containers(&self) -> &[ContainerId] {
        match self {
            FieldValue::Child(c) => std::slice::from_ref(c),
            FieldValue::Children(v) => v,
            FieldValue::Value(_) | FieldValue::Ragged(_) => &[],
        }
    }

    pub fn as_value(&self) -> Option<&ContainerValue> {
        match self {
            FieldValue::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl From<ContainerValue> for FieldValue {
    fn from(v: ContainerValue) -> Self {
        FieldValue::Value(v)
    }
}

impl From<ContainerId> for FieldValue {
    fn from(c: ContainerId) -> Self {
        FieldValue::Child(c)
    }
}

impl From<Vec<ContainerId>> for FieldValue {
    fn from(v: Vec<ContainerId>) -> Self {
        FieldValue::Children(v)
    }
}

impl From<RaggedColumn<ContainerId>> for FieldValue {
    fn from(r: RaggedColumn<ContainerId>) -> Self {
        FieldValue::Ragged(r)
    }
}

/// An in-memory domain object.
#[derive(Debug, Clone)]
pub struct Container {
    object_id: ObjectId,
    name: String,
    class: Arc<ContainerClass>,
    parent: Option<ContainerId>,
    children: Vec<ContainerId>,
    modified: bool,
    container_source: Option<String>,
    fields: BTreeMap<String, FieldValue>,
    data: Option<ContainerValue>,
}

impl Container {
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> &Arc<ContainerClass> {
        &self.class
    }

    pub fn data_type(&self) -> &str {
        self.class.data_type()
    }

    pub fn namespace(&self) -> &str {
        self.class.namespace()
    }

    pub fn parent(&self) -> Option<ContainerId> {
        self.parent
    }

    /// Owned children, in adoption order.
    pub fn children(&self) -> &[ContainerId] {
        &self.children
    }

    /// True if created or changed since it was last read or written.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Where this container was read from or first written to.
    pub fn container_source(&self) -> Option<&str> {
        self.container_source.as_deref()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Payload of a data container.
    pub fn data(&self) -> Option<&ContainerValue> {
        self.data.as_ref()
    }
}

/// Field values and metadata of a container read back from storage.
#[derive(Debug)]
pub(crate) struct Restored {
    pub object_id: ObjectId,
    pub name: String,
    pub class: Arc<ContainerClass>,
    pub fields: BTreeMap<String, FieldValue>,
    pub data: Option<ContainerValue>,
    pub source: Option<String>,
}

/// Arena of containers.
#[derive(Debug, Default)]
pub struct Containers {
    slots: Vec<Option<Container>>,
}

impl Containers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live containers.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: ContainerId) -> Option<&Container> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ContainerId, &Container)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|c| (ContainerId(i as u32), c)))
    }

    fn node(&self, id: ContainerId) -> Result<&Container, ContainerError> {
        self.get(id).ok_or(ContainerError::NotFound)
    }

    fn node_mut(&mut self, id: ContainerId) -> Result<&mut Container, ContainerError> {
        self.slots
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(ContainerError::NotFound)
    }

    /// Creates a group-like container.
    ///
    /// Fields are checked against the class: unknown names, missing required
    /// fields and values of the wrong kind are rejected. Parentless containers
    /// placed in child fields are adopted; containers that already have a
    /// parent stay where they are and are shared (written as links).
    pub fn create<I, K>(&mut self, class: &Arc<ContainerClass>, name: &str, fields: I) -> Result<ContainerId, ContainerError>
    where
        I: IntoIterator<Item = (K, FieldValue)>,
        K: Into<String>,
    {
        if class.kind() == ClassKind::Data {
            return Err(ContainerError::DataRequired {
                data_type: class.data_type().to_string(),
            });
        }
        self.insert_new(class, name, None, fields)
    }

    /// Creates a dataset-like container holding `data`.
    pub fn create_data<I, K>(
        &mut self,
        class: &Arc<ContainerClass>,
        name: &str,
        data: impl Into<ContainerValue>,
        fields: I,
    ) -> Result<ContainerId, ContainerError>
    where
        I: IntoIterator<Item = (K, FieldValue)>,
        K: Into<String>,
    {
        self.insert_new(class, name, Some(data.into()), fields)
    }

    fn insert_new<I, K>(
        &mut self,
        class: &Arc<ContainerClass>,
        name: &str,
        data: Option<ContainerValue>,
        fields: I,
    ) -> Result<ContainerId, ContainerError>
    where
        I: IntoIterator<Item = (K, FieldValue)>,
        K: Into<String>,
    {
        if name.contains('/') {
            return Err(ContainerError::InvalidName { name: name.to_string() });
        }
        let fields = normalize(class, fields.into_iter().map(|(k, v)| (k.into(), v)).collect());
        self.check_fields(class, name, &fields)?;

        for c in fields.values().flat_map(|v| v.containers().iter().copied()) {
            self.node(c)?;
        }
        let owned: Vec<ContainerId> = owned_children(class, &fields)
            .into_iter()
            .filter(|&c| self.get(c).is_some_and(|n| n.parent.is_none()))
            .collect();

        let id = ContainerId(self.slots.len() as u32);
        self.slots.push(Some(Container {
            object_id: new_object_id(),
            name: name.to_string(),
            class: class.clone(),
            parent: None,
            children: Vec::new(),
            modified: true,
            container_source: None,
            fields,
            data,
        }));
        for child in owned {
            self.attach(child, id);
        }

        let rejection = self
            .get(id)
            .and_then(|c| class.validators().find_map(|v| v(c).err()));
        if let Some(message) = rejection {
            let children: Vec<ContainerId> = self.get(id).map(|c| c.children.clone()).unwrap_or_default();
            for child in children {
                if let Ok(c) = self.node_mut(child) {
                    c.parent = None;
                }
            }
            self.slots[id.index()] = None;
            return Err(ContainerError::Rejected {
                container: name.to_string(),
                message,
            });
        }
        Ok(id)
    }

    /// Checks `fields` against `class`: no unknown fields, every required
    /// field present, every value of the right kind and type.
    pub fn check_fields(
        &self,
        class: &ContainerClass,
        name: &str,
        fields: &BTreeMap<String, FieldValue>,
    ) -> Result<(), ContainerError> {
        for (field, value) in fields {
            let Some(desc) = class.field(field) else {
                return Err(ContainerError::UnknownField {
                    container: name.to_string(),
                    data_type: class.data_type().to_string(),
                    field: field.clone(),
                });
            };
            self.check_kind(name, field, &desc.kind, value)?;
        }
        for desc in class.fields() {
            if desc.required && !fields.contains_key(&desc.name) {
                return Err(ContainerError::MissingRequiredField {
                    container: name.to_string(),
                    data_type: class.data_type().to_string(),
                    field: desc.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn check_kind(&self, name: &str, field: &str, kind: &FieldKind, value: &FieldValue) -> Result<(), ContainerError> {
        let mismatch = |expected: String| ContainerError::FieldKindMismatch {
            container: name.to_string(),
            field: field.to_string(),
            expected,
        };
        match (kind, value) {
            (FieldKind::Attribute { .. }, FieldValue::Value(_)) => Ok(()),
            (FieldKind::Dataset { .. }, FieldValue::Value(_) | FieldValue::Ragged(_)) => Ok(()),
            (FieldKind::Child { data_type, many } | FieldKind::Link { target_type: data_type, many }, v) => {
                match (*many, v) {
                    (false, FieldValue::Child(_)) | (true, FieldValue::Children(_)) => {}
                    (false, _) => return Err(mismatch(format!("one {} container", data_type))),
                    (true, _) => return Err(mismatch(format!("a list of {} containers", data_type))),
                }
                for &c in v.containers() {
                    let target = self.node(c)?;
                    if !target.class.is_a(data_type) {
                        return Err(mismatch(format!(
                            "{} containers, got {}",
                            data_type,
                            target.class.data_type()
                        )));
                    }
                }
                Ok(())
            }
            (FieldKind::Attribute { .. }, _) => Err(mismatch("a value".to_string())),
            (FieldKind::Dataset { .. }, _) => Err(mismatch("a value or ragged column".to_string())),
        }
    }

    fn attach(&mut self, child: ContainerId, parent: ContainerId) {
        if let Ok(c) = self.node_mut(child) {
            c.parent = Some(parent);
        }
        if let Ok(p) = self.node_mut(parent) {
            if !p.children.contains(&child) {
                p.children.push(child);
            }
        }
    }

    /// Sets the parent of `child`.
    ///
    /// A parent can be assigned once; assigning the same parent again is a
    /// no-op, assigning another fails.
    pub fn set_parent(&mut self, child: ContainerId, parent: ContainerId) -> Result<(), ContainerError> {
        let node = self.node(child)?;
        match node.parent {
            Some(p) if p == parent => return Ok(()),
            Some(p) => {
                return Err(ContainerError::ParentAlreadySet {
                    child: node.name.clone(),
                    parent: self.get(p).map(|c| c.name.clone()).unwrap_or_default(),
                });
            }
            None => {}
        }
        self.node(parent)?;
        if parent == child || self.ancestors(parent).contains(&child) {
            return Err(ContainerError::ParentCycle {
                child: node.name.clone(),
                parent: self.node(parent)?.name.clone(),
            });
        }
        self.attach(child, parent);
        Ok(())
    }

    /// Replaces a field. Parentless containers placed in a child field are
    /// adopted; owned containers dropped from it are released.
    pub fn set_field(&mut self, id: ContainerId, field: &str, value: FieldValue) -> Result<(), ContainerError> {
        let node = self.node(id)?;
        let class = node.class.clone();
        let name = node.name.clone();
        let Some(desc) = class.field(field) else {
            return Err(ContainerError::UnknownField {
                container: name,
                data_type: class.data_type().to_string(),
                field: field.to_string(),
            });
        };
        let value = normalize_one(&desc.kind, value);
        self.check_kind(&name, field, &desc.kind, &value)?;

        if matches!(desc.kind, FieldKind::Child { .. }) {
            let previous: Vec<ContainerId> = node_field(self.node(id)?, field);
            for old in previous {
                if !value.containers().contains(&old) {
                    self.release(id, old);
                }
            }
            for &c in value.containers() {
                if self.get(c).is_some_and(|n| n.parent.is_none()) {
                    self.attach(c, id);
                }
            }
        }
        self.node_mut(id)?.fields.insert(field.to_string(), value);
        self.set_modified(id, true);
        Ok(())
    }

    /// Removes an optional field.
    pub fn remove_field(&mut self, id: ContainerId, field: &str) -> Result<Option<FieldValue>, ContainerError> {
        let node = self.node(id)?;
        if let Some(desc) = node.class.field(field) {
            if desc.required {
                return Err(ContainerError::MissingRequiredField {
                    container: node.name.clone(),
                    data_type: node.class.data_type().to_string(),
                    field: field.to_string(),
                });
            }
            if matches!(desc.kind, FieldKind::Child { .. }) {
                for old in node_field(node, field) {
                    self.release(id, old);
                }
            }
        }
        let removed = self.node_mut(id)?.fields.remove(field);
        if removed.is_some() {
            self.set_modified(id, true);
        }
        Ok(removed)
    }

    /// Appends `child` to a many-valued field.
    pub fn push_child(&mut self, id: ContainerId, field: &str, child: ContainerId) -> Result<(), ContainerError> {
        let mut items = match self.node(id)?.fields.get(field) {
            Some(FieldValue::Children(v)) => v.clone(),
            Some(FieldValue::Child(c)) => vec![*c],
            _ => Vec::new(),
        };
        items.push(child);
        self.set_field(id, field, FieldValue::Children(items))
    }

    /// Detaches `child` from `parent`, removing it from every field that
    /// holds it.
    pub fn remove_child(&mut self, parent: ContainerId, child: ContainerId) -> Result<(), ContainerError> {
        let node = self.node_mut(parent)?;
        node.fields.retain(|_, v| match v {
            FieldValue::Child(c) => *c != child,
            _ => true,
        });
        for v in node.fields.values_mut() {
            if let FieldValue::Children(items) = v {
                items.retain(|&c| c != child);
            }
        }
        self.release(parent, child);
        self.set_modified(parent, true);
        Ok(())
    }

    fn release(&mut self, parent: ContainerId, child: ContainerId) {
        if let Ok(p) = self.node_mut(parent) {
            p.children.retain(|&c| c != child);
        }
        if let Ok(c) = self.node_mut(child) {
            if c.parent == Some(parent) {
                c.parent = None;
            }
        }
    }

    /// Replaces the payload of a data container.
    pub fn set_data(&mut self, id: ContainerId, data: impl Into<ContainerValue>) -> Result<(), ContainerError> {
        self.node_mut(id)?.data = Some(data.into());
        self.set_modified(id, true);
        Ok(())
    }

    /// Sets the modified flag. Marking a container modified marks its
    /// ancestors too.
    pub fn set_modified(&mut self, id: ContainerId, modified: bool) {
        if !modified {
            if let Ok(c) = self.node_mut(id) {
                c.modified = false;
            }
            return;
        }
        let mut current = Some(id);
        while let Some(c) = current {
            match self.node_mut(c) {
                Ok(node) => {
                    node.modified = true;
                    current = node.parent;
                }
                Err(_) => break,
            }
        }
    }

    /// Clears the modified flag on `root` and every container it owns.
    pub fn mark_clean(&mut self, root: ContainerId) {
        for id in self.descendants(root) {
            self.set_modified(id, false);
        }
    }

    pub(crate) fn set_container_source(&mut self, id: ContainerId, source: Option<String>) {
        if let Ok(c) = self.node_mut(id) {
            c.container_source = source;
        }
    }

    /// Gives `id` and every container it owns a fresh object id.
    pub fn generate_new_id(&mut self, id: ContainerId) -> Result<(), ContainerError> {
        self.node(id)?;
        for c in self.descendants(id) {
            if let Ok(node) = self.node_mut(c) {
                node.object_id = new_object_id();
            }
        }
        self.set_modified(id, true);
        Ok(())
    }

    /// `root` and every container it owns, in pre-order.
    pub fn descendants(&self, root: ContainerId) -> Vec<ContainerId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(current) = stack.pop() {
            if let Some(c) = self.get(current) {
                out.push(current);
                stack.extend(c.children.iter().rev().copied());
            }
        }
        out
    }

    /// Removes `id` and its owned subtree from the arena.
    pub fn remove(&mut self, id: ContainerId) -> Result<(), ContainerError> {
        if let Some(parent) = self.node(id)?.parent {
            self.remove_child(parent, id)?;
        }
        for c in self.descendants(id) {
            self.slots[c.index()] = None;
        }
        Ok(())
    }

    /// Parents of `id`, nearest first.
    pub fn ancestors(&self, id: ContainerId) -> Vec<ContainerId> {
        let mut out = Vec::new();
        let mut current = self.get(id).and_then(|c| c.parent);
        while let Some(p) = current {
            if out.contains(&p) {
                break;
            }
            out.push(p);
            current = self.get(p).and_then(|c| c.parent);
        }
        out
    }

    /// Nearest ancestor of `id` that is `data_type` (or any ancestor when `None`).
    pub fn get_ancestor(&self, id: ContainerId, data_type: Option<&str>) -> Option<ContainerId> {
        self.ancestors(id).into_iter().find(|&a| match data_type {
            None => true,
            Some(t) => self.get(a).is_some_and(|c| c.class.is_a(t)),
        })
    }

    pub fn root_of(&self, id: ContainerId) -> ContainerId {
        self.ancestors(id).last().copied().unwrap_or(id)
    }

    // =========================================================================
    // Read path
    // =========================================================================

    pub(crate) fn reserve(&mut self) -> ContainerId {
        let id = ContainerId(self.slots.len() as u32);
        self.slots.push(None);
        id
    }

    pub(crate) fn fill(&mut self, id: ContainerId, restored: Restored) {
        if let Some(slot) = self.slots.get_mut(id.index()) {
            *slot = Some(Container {
                object_id: restored.object_id,
                name: restored.name,
                class: restored.class,
                parent: None,
                children: Vec::new(),
                modified: false,
                container_source: restored.source,
                fields: restored.fields,
                data: restored.data,
            });
        }
    }

    pub(crate) fn release_slot(&mut self, id: ContainerId) {
        if let Some(slot) = self.slots.get_mut(id.index()) {
            *slot = None;
        }
    }

    /// Links a constructed container to its parent without re-validating.
    pub(crate) fn adopt_restored(&mut self, child: ContainerId, parent: ContainerId) {
        let orphan = self.get(child).is_some_and(|c| c.parent.is_none());
        if orphan && child != parent && !self.ancestors(parent).contains(&child) {
            self.attach(child, parent);
        }
    }

    // =========================================================================
    // Comparison
    // =========================================================================

    /// Compares two container graphs by content: names, types, object ids,
    /// field values and data. References and links compare by object id.
    pub fn same_content(&self, a: ContainerId, other: &Containers, b: ContainerId) -> bool {
        let mut visited = FxHashSet::default();
        self.same_content_inner(a, other, b, &mut visited)
    }

    fn same_content_inner(
        &self,
        a: ContainerId,
        other: &Containers,
        b: ContainerId,
        visited: &mut FxHashSet<(ContainerId, ContainerId)>,
    ) -> bool {
        if !visited.insert((a, b)) {
            return true;
        }
        let (Some(x), Some(y)) = (self.get(a), other.get(b)) else {
            return false;
        };
        if x.object_id != y.object_id
            || x.name != y.name
            || x.class.key() != y.class.key()
            || x.fields.len() != y.fields.len()
        {
            return false;
        }
        let same_value = |v: &ContainerValue, w: &ContainerValue| {
            let v = v.try_map_refs(&mut |c| self.get(*c).map(|c| c.object_id).ok_or(()));
            let w = w.try_map_refs(&mut |c| other.get(*c).map(|c| c.object_id).ok_or(()));
            matches!((v, w), (Ok(v), Ok(w)) if v == w)
        };
        match (&x.data, &y.data) {
            (None, None) => {}
            (Some(v), Some(w)) if same_value(v, w) => {}
            _ => return false,
        }
        for (name, fx) in &x.fields {
            let Some(fy) = y.fields.get(name) else {
                return false;
            };
            let equal = match (fx, fy) {
                (FieldValue::Value(v), FieldValue::Value(w)) => same_value(v, w),
                (FieldValue::Ragged(v), FieldValue::Ragged(w)) => {
                    v.index() == w.index()
                        && v.data().len() == w.data().len()
                        && v.data().iter().zip(w.data()).all(|(p, q)| same_value(p, q))
                }
                (FieldValue::Child(_), FieldValue::Child(_)) | (FieldValue::Children(_), FieldValue::Children(_)) => {
                    let (cx, cy) = (fx.containers(), fy.containers());
                    cx.len() == cy.len()
                        && cx.iter().zip(cy).all(|(&p, &q)| {
                            let owned = self.get(p).is_some_and(|c| c.parent == Some(a));
                            if owned {
                                self.same_content_inner(p, other, q, visited)
                            } else {
                                self.get(p).map(|c| c.object_id) == other.get(q).map(|c| c.object_id)
                            }
                        })
                }
                _ => false,
            };
            if !equal {
                return false;
            }
        }
        true
    }
}

/// Wraps single containers given for many-valued fields in a list and
/// fills absent fields that have a default.
fn normalize(class: &ContainerClass, mut fields: BTreeMap<String, FieldValue>) -> BTreeMap<String, FieldValue> {
    for (name, value) in fields.iter_mut() {
        if let Some(desc) = class.field(name) {
            let taken = std::mem::replace(value, FieldValue::Children(Vec::new()));
            *value = normalize_one(&desc.kind, taken);
        }
    }
    for desc in class.fields() {
        if fields.contains_key(&desc.name) {
            continue;
        }
        if let Some(default) = desc.default.as_ref().and_then(|d| d.without_refs()) {
            fields.insert(desc.name.clone(), FieldValue::Value(default));
        }
    }
    fields
}

fn normalize_one(kind: &FieldKind, value: FieldValue) -> FieldValue {
    match value {
        FieldValue::Child(c) if kind.is_many() => FieldValue::Children(vec![c]),
        other => other,
    }
}

fn owned_children(class: &ContainerClass, fields: &BTreeMap<String, FieldValue>) -> Vec<ContainerId> {
    fields
        .iter()
        .filter(|(name, _)| matches!(class.field(name).map(|d| &d.kind), Some(FieldKind::Child { .. })))
        .flat_map(|(_, v)| v.containers().iter().copied())
        .collect()
}

fn node_field(node: &Container, field: &str) -> Vec<ContainerId> {
    node.fields.get(field).map(|v| v.containers().to_vec()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::class::FieldDescriptor;
    use crate::model::value::{DType, Primitive};
    use crate::spec::TypeKey;

    fn classes() -> (Arc<ContainerClass>, Arc<ContainerClass>) {
        let item = Arc::new(ContainerClass::new(
            TypeKey::new("test", "Item"),
            ClassKind::Container,
            None,
            vec![FieldDescriptor {
                name: "label".into(),
                doc: String::new(),
                required: false,
                kind: FieldKind::Attribute {
                    dtype: DType::Primitive(Primitive::Text),
                },
                inherited: false,
                default: None,
            }],
            true,
            None,
        ));
        let holder = Arc::new(ContainerClass::new(
            TypeKey::new("test", "Holder"),
            ClassKind::Container,
            None,
            vec![
                FieldDescriptor {
                    name: "items".into(),
                    doc: String::new(),
                    required: false,
                    kind: FieldKind::Child {
                        data_type: "Item".into(),
                        many: true,
                    },
                    inherited: false,
                default: None,
                },
                FieldDescriptor {
                    name: "favorite".into(),
                    doc: String::new(),
                    required: false,
                    kind: FieldKind::Link {
                        target_type: "Item".into(),
                        many: false,
                    },
                    inherited: false,
                default: None,
                },
                FieldDescriptor {
                    name: "count".into(),
                    doc: String::new(),
                    required: true,
                    kind: FieldKind::Attribute {
                        dtype: DType::Primitive(Primitive::Int32),
                    },
                    inherited: false,
                default: None,
                },
            ],
            true,
            None,
        ));
        (item, holder)
    }

    #[test]
    fn test_create_adopts_children() {
        let (item, holder) = classes();
        let mut cs = Containers::new();
        let a = cs.create(&item, "a", [("label", FieldValue::value("first"))]).unwrap();
        let b = cs.create(&item, "b", Vec::<(&str, FieldValue)>::new()).unwrap();
        let h = cs
            .create(
                &holder,
                "h",
                [("items", FieldValue::from(a)), ("count", FieldValue::value(1i32))],
            )
            .unwrap();
        assert_eq!(cs.get(a).unwrap().parent(), Some(h));
        assert_eq!(cs.get(h).unwrap().field("items"), Some(&FieldValue::Children(vec![a])));
        assert!(cs.get(h).unwrap().is_modified());

        // links do not adopt
        cs.set_field(h, "favorite", FieldValue::Child(b)).unwrap();
        assert_eq!(cs.get(b).unwrap().parent(), None);

        // a second holder shares the child without taking ownership
        let h2 = cs
            .create(&holder, "h2", [("items", FieldValue::from(vec![a])), ("count", FieldValue::value(2i32))])
            .unwrap();
        assert_eq!(cs.get(a).unwrap().parent(), Some(h));
        assert!(cs.get(h2).unwrap().children().is_empty());
    }

    #[test]
    fn test_field_checks() {
        let (item, holder) = classes();
        let mut cs = Containers::new();
        let missing = cs.create(&holder, "h", Vec::<(&str, FieldValue)>::new());
        assert!(matches!(missing, Err(ContainerError::MissingRequiredField { .. })));
        let unknown = cs.create(&item, "i", [("nope", FieldValue::value(1i32))]);
        assert!(matches!(unknown, Err(ContainerError::UnknownField { .. })));
        let bad_name = cs.create(&item, "a/b", Vec::<(&str, FieldValue)>::new());
        assert!(matches!(bad_name, Err(ContainerError::InvalidName { .. })));

        let h = cs.create(&holder, "h", [("count", FieldValue::value(1i32))]).unwrap();
        let wrong_type = cs.create(&holder, "h2", [("count", FieldValue::value(1i32)), ("items", FieldValue::from(h))]);
        assert!(matches!(wrong_type, Err(ContainerError::FieldKindMismatch { .. })));
    }

    #[test]
    fn test_parent_rules() {
        let (item, holder) = classes();
        let mut cs = Containers::new();
        let a = cs.create(&item, "a", Vec::<(&str, FieldValue)>::new()).unwrap();
        let p = cs.create(&holder, "p", [("count", FieldValue::value(0i32))]).unwrap();
        let q = cs.create(&holder, "q", [("count", FieldValue::value(0i32))]).unwrap();
        cs.set_parent(a, p).unwrap();
        cs.set_parent(a, p).unwrap();
        assert!(matches!(cs.set_parent(a, q), Err(ContainerError::ParentAlreadySet { .. })));
        cs.set_parent(q, p).unwrap();
        assert!(matches!(cs.set_parent(p, q), Err(ContainerError::ParentCycle { .. })));
        assert_eq!(cs.root_of(a), p);
        assert_eq!(cs.get_ancestor(a, Some("Holder")), Some(p));
    }

    #[test]
    fn test_modified_propagates_up() {
        let (item, holder) = classes();
        let mut cs = Containers::new();
        let a = cs.create(&item, "a", Vec::<(&str, FieldValue)>::new()).unwrap();
        let h = cs.create(&holder, "h", [("items", FieldValue::from(a)), ("count", FieldValue::value(1i32))]).unwrap();
        cs.mark_clean(h);
        assert!(!cs.get(h).unwrap().is_modified());
        assert!(!cs.get(a).unwrap().is_modified());

        cs.set_field(a, "label", FieldValue::value("changed")).unwrap();
        assert!(cs.get(a).unwrap().is_modified());
        assert!(cs.get(h).unwrap().is_modified());
    }

    #[test]
    fn test_generate_new_id_and_remove() {
        let (item, holder) = classes();
        let mut cs = Containers::new();
        let a = cs.create(&item, "a", Vec::<(&str, FieldValue)>::new()).unwrap();
        let h = cs.create(&holder, "h", [("items", FieldValue::from(a)), ("count", FieldValue::value(1i32))]).unwrap();
        let (old_h, old_a) = (cs.get(h).unwrap().object_id(), cs.get(a).unwrap().object_id());
        cs.generate_new_id(h).unwrap();
        assert_ne!(cs.get(h).unwrap().object_id(), old_h);
        assert_ne!(cs.get(a).unwrap().object_id(), old_a);

        cs.remove_child(h, a).unwrap();
        assert_eq!(cs.get(a).unwrap().parent(), None);
        assert_eq!(cs.get(h).unwrap().field("items"), Some(&FieldValue::Children(vec![])));
        cs.remove(h).unwrap();
        assert!(cs.get(h).is_none());
        assert_eq!(cs.len(), 1);
    }

    #[test]
    fn test_validator_rejects() {
        let (item, _) = classes();
        let strict = Arc::new(ContainerClass::new(
            TypeKey::new("test", "Strict"),
            ClassKind::Container,
            Some(item),
            vec![],
            false,
            Some(Arc::new(|c: &Container| {
                if c.name().starts_with('x') {
                    Err("names must not start with x".to_string())
                } else {
                    Ok(())
                }
            })),
        ));
        let mut cs = Containers::new();
        assert!(cs.create(&strict, "fine", Vec::<(&str, FieldValue)>::new()).is_ok());
        let rejected = cs.create(&strict, "xray", Vec::<(&str, FieldValue)>::new());
        assert!(matches!(rejected, Err(ContainerError::Rejected { .. })));
        assert_eq!(cs.len(), 1);
    }
}
