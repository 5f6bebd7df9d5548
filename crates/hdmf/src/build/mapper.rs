//! Object mapper: translation between containers of one type and builders.
//!
//! The mapper walks the resolved spec of its type in declaration order
//! (attributes, datasets, groups, links) and dispatches on the spec kind.
//! Every mapped spec element has a path ("values", "values/unit",
//! "meta/Series") and a container field name ("values", "values__unit",
//! "meta__series"). The default naming can be changed per type with a
//! [`CustomMapper`].
//!
//! ```text
//! spec element                         field
//! attribute "Label"                    label
//! untyped dataset "values"             values
//! attribute "unit" of dataset "values" values__unit
//! typed group, data type "Series", *   seriess
//! typed group named "origin"           origin
//! members of untyped group "meta"      meta__<member>
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::build::convert::check_shape;
use crate::build::manager::{BuildManager, Slot};
use crate::error::{ConversionError, Error, Result};
use crate::limits::{INDEX_SUFFIX, INDEX_TARGET_ATTR};
use crate::model::builder::{BuilderId, Builders, LinkTarget, NAMESPACE_ATTR, NodeKind, OBJECT_ID_ATTR, TYPE_ATTR};
use crate::model::class::{ClassKind, ContainerClass, FieldDescriptor, FieldKind};
use crate::model::container::{Container, ContainerId, ContainerValue, Containers, FieldValue, Restored};
use crate::model::id::{format_object_id, new_object_id, parse_object_id};
use crate::model::index::{RaggedColumn, decode_offsets};
use crate::model::value::{DType, PlainValue, Value};
use crate::spec::{AttributeSpec, DatasetSpec, GroupSpec, Inheritance, SpecKind, SpecRef, TypeKey, TypeSpec};

// =============================================================================
// Field mapping
// =============================================================================

/// Hooks for changing how one type (and its subtypes) is mapped.
///
/// Every method has a default that keeps the generated behavior.
pub trait CustomMapper {
    /// Renames or unmaps spec elements before the class is generated.
    fn configure(&self, _mapping: &mut FieldMapping) {}

    /// Supplies the value written for `field` instead of the container's own.
    fn object_attr(&self, _field: &str, _container: &Container, _containers: &Containers) -> Option<FieldValue> {
        None
    }

    /// Supplies the value of `field` for a container read from `builder`.
    fn constructor_arg(&self, _field: &str, _builders: &Builders, _builder: BuilderId) -> Option<FieldValue> {
        None
    }
}

/// Spec path to field name table of one type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMapping {
    paths: Vec<String>,
    fields: BTreeMap<String, String>,
}

impl FieldMapping {
    fn insert(&mut self, path: String, field: String) {
        if !self.paths.contains(&path) {
            self.paths.push(path.clone());
        }
        self.fields.insert(path, field);
    }

    /// Maps the spec element at `path` to `field`.
    ///
    /// Returns false (and changes nothing) if the type has no such element.
    pub fn map_spec(&mut self, path: &str, field: &str) -> bool {
        if !self.paths.iter().any(|p| p == path) {
            return false;
        }
        self.fields.insert(path.to_string(), field.to_string());
        true
    }

    /// Stops mapping the spec element at `path`. It is neither written nor read.
    pub fn unmap(&mut self, path: &str) -> Option<String> {
        self.fields.remove(path)
    }

    pub fn field_for(&self, path: &str) -> Option<&str> {
        self.fields.get(path).map(String::as_str)
    }

    /// The spec path mapped to `field`, if any.
    pub fn path_for(&self, field: &str) -> Option<&str> {
        self.fields.iter().find(|(_, f)| *f == field).map(|(p, _)| p.as_str())
    }

    /// Every mappable spec path in declaration order, unmapped ones included.
    pub fn spec_paths(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }
}

/// Converts a type name to snake case ("SeriesGroup" -> "series_group").
pub fn snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_uppercase() => next.is_some_and(char::is_lowercase),
                _ => false,
            };
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", prefix, key)
    }
}

fn join_field(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}__{}", prefix, name)
    }
}

/// Path key of a child spec: its name, else its data (or target) type.
fn spec_key<'s>(spec: &SpecRef<'s>) -> &'s str {
    spec.name().or(spec.data_type()).unwrap_or_default()
}

fn default_field_name(spec: &SpecRef<'_>) -> String {
    match spec.name() {
        Some(name) => name.to_lowercase(),
        None => {
            let base = snake_case(spec.data_type().unwrap_or_default());
            if spec.is_many() { format!("{}s", base) } else { base }
        }
    }
}

/// One mappable spec element.
#[derive(Debug, Clone)]
struct SpecEntry {
    path: String,
    field: String,
    doc: String,
    kind: FieldKind,
    required: bool,
    inherited: bool,
    default: Option<PlainValue>,
}

fn walk_attributes(attrs: &[AttributeSpec], path: &str, field: &str, present: bool, out: &mut Vec<SpecEntry>) {
    for a in attrs.iter().filter(|a| a.value.is_none()) {
        out.push(SpecEntry {
            path: join_path(path, &a.name),
            field: join_field(field, &a.name.to_lowercase()),
            doc: a.doc.clone(),
            kind: FieldKind::Attribute { dtype: a.dtype.clone() },
            required: present && a.required && a.default_value.is_none(),
            inherited: a.inheritance != Inheritance::New,
            default: if present { a.default_value.clone() } else { None },
        });
    }
}

fn typed_entry(spec: SpecRef<'_>, path: &str, field: &str, present: bool) -> SpecEntry {
    let data_type = spec.data_type().unwrap_or_default().to_string();
    let many = spec.is_many();
    let kind = match spec.kind() {
        SpecKind::Link => FieldKind::Link {
            target_type: data_type,
            many,
        },
        _ => FieldKind::Child { data_type, many },
    };
    SpecEntry {
        path: join_path(path, spec_key(&spec)),
        field: join_field(field, &default_field_name(&spec)),
        doc: spec.doc().to_string(),
        kind,
        required: present && spec.quantity().is_required(),
        inherited: spec.inheritance() != Inheritance::New,
        default: None,
    }
}

fn walk_group(g: &GroupSpec, path: &str, field: &str, present: bool, out: &mut Vec<SpecEntry>) {
    walk_attributes(&g.attributes, path, field, present, out);
    for d in &g.datasets {
        if d.is_typed() {
            out.push(typed_entry(SpecRef::Dataset(d), path, field, present));
            continue;
        }
        let name = d.name.as_deref().unwrap_or_default();
        let d_path = join_path(path, name);
        let d_field = join_field(field, &name.to_lowercase());
        let d_present = present && d.quantity.is_required();
        if d.value.is_none() {
            out.push(SpecEntry {
                path: d_path.clone(),
                field: d_field.clone(),
                doc: d.doc.clone(),
                kind: FieldKind::Dataset { dtype: d.dtype.clone() },
                required: d_present && d.default_value.is_none(),
                inherited: d.inheritance != Inheritance::New,
                default: if d_present { d.default_value.clone() } else { None },
            });
        }
        walk_attributes(&d.attributes, &d_path, &d_field, d_present, out);
    }
    for sub in &g.groups {
        if sub.is_typed() {
            out.push(typed_entry(SpecRef::Group(sub), path, field, present));
            continue;
        }
        let name = sub.name.as_deref().unwrap_or_default();
        walk_group(
            sub,
            &join_path(path, name),
            &join_field(field, &name.to_lowercase()),
            present && sub.quantity.is_required(),
            out,
        );
    }
    for l in &g.links {
        out.push(typed_entry(SpecRef::Link(l), path, field, present));
    }
}

// =============================================================================
// Object mapper
// =============================================================================

/// Translator between containers of one type and their builders.
pub struct ObjectMapper {
    key: TypeKey,
    spec: Arc<TypeSpec>,
    entries: Vec<SpecEntry>,
    mapping: FieldMapping,
    custom: Option<Rc<dyn CustomMapper>>,
}

impl fmt::Debug for ObjectMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectMapper")
            .field("key", &self.key)
            .field("mapping", &self.mapping)
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

impl ObjectMapper {
    /// Creates the mapper of `key` from its resolved spec.
    pub fn new(key: TypeKey, spec: Arc<TypeSpec>, custom: Option<Rc<dyn CustomMapper>>) -> Self {
        let mut entries = Vec::new();
        match spec.as_ref() {
            TypeSpec::Group(g) => walk_group(g, "", "", true, &mut entries),
            TypeSpec::Dataset(d) => walk_attributes(&d.attributes, "", "", true, &mut entries),
        }
        let mut mapping = FieldMapping::default();
        for e in &entries {
            mapping.insert(e.path.clone(), e.field.clone());
        }
        if let Some(custom) = &custom {
            custom.configure(&mut mapping);
        }
        Self {
            key,
            spec,
            entries,
            mapping,
            custom,
        }
    }

    pub fn key(&self) -> &TypeKey {
        &self.key
    }

    pub fn spec(&self) -> &Arc<TypeSpec> {
        &self.spec
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    /// One descriptor per mapped spec element, in declaration order.
    pub fn descriptors(&self) -> Vec<FieldDescriptor> {
        self.entries
            .iter()
            .filter_map(|e| {
                let name = self.mapping.field_for(&e.path)?;
                Some(FieldDescriptor {
                    name: name.to_string(),
                    doc: e.doc.clone(),
                    required: e.required,
                    kind: e.kind.clone(),
                    inherited: e.inherited,
                    default: e.default.clone(),
                })
            })
            .collect()
    }

    fn field_value(&self, scope: &BuildScope<'_>, path: &str) -> Option<FieldValue> {
        let field = self.mapping.field_for(path)?;
        if let Some(v) = self
            .custom
            .as_ref()
            .and_then(|c| c.object_attr(field, scope.container, scope.cs))
        {
            return Some(v);
        }
        scope.container.field(field).cloned()
    }

    // =========================================================================
    // Build direction
    // =========================================================================

    /// Fills `builder` from the container `id`.
    pub(crate) fn build_fields(
        &self,
        mgr: &mut BuildManager<'_>,
        cs: &Containers,
        id: ContainerId,
        builder: BuilderId,
    ) -> Result<()> {
        let container = cs.get(id).ok_or(crate::error::ContainerError::NotFound)?;
        let scope = BuildScope { cs, id, container };
        debug!(
            container = container.name(),
            data_type = %self.key,
            "building container"
        );

        let builders = mgr.builders_mut();
        builders.set_attribute(builder, TYPE_ATTR, Value::Text(self.key.data_type.clone()))?;
        builders.set_attribute(builder, NAMESPACE_ATTR, Value::Text(self.key.namespace.clone()))?;
        builders.set_attribute(builder, OBJECT_ID_ATTR, Value::Text(format_object_id(&container.object_id())))?;

        match self.spec.as_ref() {
            TypeSpec::Group(g) => self.build_group(mgr, &scope, g, builder, "", true),
            TypeSpec::Dataset(d) => {
                if container.class().kind() == ClassKind::Data {
                    self.build_data(mgr, &scope, d, builder)?;
                }
                self.build_attributes(mgr, &scope, &d.attributes, builder, "", true)
            }
        }
    }

    fn build_data(
        &self,
        mgr: &mut BuildManager<'_>,
        scope: &BuildScope<'_>,
        spec: &DatasetSpec,
        builder: BuilderId,
    ) -> Result<()> {
        let path = mgr.builders().path(builder);
        let Some(data) = scope.container.data() else {
            warn!(path = %path, "data container has no data");
            return Ok(());
        };
        let converted = mgr.type_map().policy().convert(data, spec.dtype.as_ref(), &path)?;
        check_shape(&converted, spec.shape.as_ref(), &path)?;
        mgr.builders_mut()
            .set_dtype(builder, stored_dtype(spec.dtype.as_ref(), &converted));
        mgr.store_value(scope.cs, builder, Slot::Data, &converted, &path)
    }

    fn build_attributes(
        &self,
        mgr: &mut BuildManager<'_>,
        scope: &BuildScope<'_>,
        attrs: &[AttributeSpec],
        builder: BuilderId,
        prefix: &str,
        present: bool,
    ) -> Result<()> {
        for a in attrs {
            let path = join_path(prefix, &a.name);
            let value = match &a.value {
                Some(fixed) => fixed.without_refs(),
                None => self
                    .field_value(scope, &path)
                    .and_then(|f| f.as_value().cloned())
                    .or_else(|| a.default_value.as_ref().and_then(|d| d.without_refs())),
            };
            let attr_path = format!("{}@{}", mgr.builders().path(builder), a.name);
            let Some(value) = value else {
                if a.required && present {
                    warn!(path = %attr_path, "required attribute has no value");
                }
                continue;
            };
            let converted = mgr.type_map().policy().convert(&value, Some(&a.dtype), &attr_path)?;
            check_shape(&converted, a.shape.as_ref(), &attr_path)?;
            mgr.store_value(scope.cs, builder, Slot::Attribute(a.name.clone()), &converted, &attr_path)?;
        }
        Ok(())
    }

    fn build_group(
        &self,
        mgr: &mut BuildManager<'_>,
        scope: &BuildScope<'_>,
        g: &GroupSpec,
        builder: BuilderId,
        prefix: &str,
        present: bool,
    ) -> Result<()> {
        self.build_attributes(mgr, scope, &g.attributes, builder, prefix, present)?;
        for d in &g.datasets {
            if d.is_typed() {
                self.build_typed(mgr, scope, SpecRef::Dataset(d), builder, prefix)?;
            } else {
                self.build_untyped_dataset(mgr, scope, d, builder, prefix, present)?;
            }
        }
        for sub in &g.groups {
            if sub.is_typed() {
                self.build_typed(mgr, scope, SpecRef::Group(sub), builder, prefix)?;
                continue;
            }
            let name = sub.name.as_deref().unwrap_or_default();
            let required = present && sub.quantity.is_required();
            let group = mgr.builders_mut().new_group(name);
            self.build_group(mgr, scope, sub, group, &join_path(prefix, name), required)?;
            if required || !mgr.builders().is_empty_node(group) {
                mgr.builders_mut().set_child(builder, group)?;
            } else {
                mgr.builders_mut().release(group);
            }
        }
        for l in &g.links {
            self.build_typed(mgr, scope, SpecRef::Link(l), builder, prefix)?;
        }
        Ok(())
    }

    fn build_untyped_dataset(
        &self,
        mgr: &mut BuildManager<'_>,
        scope: &BuildScope<'_>,
        d: &DatasetSpec,
        parent: BuilderId,
        prefix: &str,
        present: bool,
    ) -> Result<()> {
        let name = d.name.as_deref().unwrap_or_default();
        let path = join_path(prefix, name);
        let required = present && d.quantity.is_required();
        let fixed = d
            .value
            .as_ref()
            .or(d.default_value.as_ref())
            .and_then(|v| v.without_refs::<ContainerId>());
        let value = match self.field_value(scope, &path) {
            Some(FieldValue::Value(v)) if d.value.is_none() => FieldValue::Value(v),
            Some(FieldValue::Ragged(r)) if d.value.is_none() => FieldValue::Ragged(r),
            _ => match fixed {
                Some(v) => FieldValue::Value(v),
                None => {
                    if required {
                        warn!(path = %format!("{}/{}", mgr.builders().path(parent), name), "required dataset has no value");
                    }
                    return Ok(());
                }
            },
        };

        let data_path = format!("{}/{}", mgr.builders().path(parent), name);
        let dataset = mgr.builders_mut().new_dataset(name, None, None);
        mgr.builders_mut().set_child(parent, dataset)?;
        match value {
            FieldValue::Ragged(column) => {
                let flat: ContainerValue = Value::List(column.data().to_vec());
                let converted = mgr.type_map().policy().convert(&flat, d.dtype.as_ref(), &data_path)?;
                mgr.builders_mut()
                    .set_dtype(dataset, stored_dtype(d.dtype.as_ref(), &converted));
                mgr.store_value(scope.cs, dataset, Slot::Data, &converted, &data_path)?;

                let index_name = format!("{}{}", name, INDEX_SUFFIX);
                let builders = mgr.builders_mut();
                let index = builders.new_dataset(
                    index_name,
                    Some(column.index_value()),
                    Some(DType::Primitive(column.index_primitive())),
                );
                builders.set_attribute(index, INDEX_TARGET_ATTR, Value::Ref(dataset))?;
                builders.set_child(parent, index)?;
            }
            FieldValue::Value(v) => {
                let converted = mgr.type_map().policy().convert(&v, d.dtype.as_ref(), &data_path)?;
                check_shape(&converted, d.shape.as_ref(), &data_path)?;
                mgr.builders_mut()
                    .set_dtype(dataset, stored_dtype(d.dtype.as_ref(), &converted));
                mgr.store_value(scope.cs, dataset, Slot::Data, &converted, &data_path)?;
            }
            FieldValue::Child(_) | FieldValue::Children(_) => {}
        }
        self.build_attributes(mgr, scope, &d.attributes, dataset, &path, required)
    }

    fn build_typed(
        &self,
        mgr: &mut BuildManager<'_>,
        scope: &BuildScope<'_>,
        spec: SpecRef<'_>,
        parent: BuilderId,
        prefix: &str,
    ) -> Result<()> {
        let path = join_path(prefix, spec_key(&spec));
        let children: Vec<ContainerId> = self
            .field_value(scope, &path)
            .map(|v| v.containers().to_vec())
            .unwrap_or_default();
        let quantity = spec.quantity();
        if children.is_empty() {
            if quantity.is_required() {
                warn!(
                    path = %format!("{}/{}", mgr.builders().path(parent), path),
                    "required {} is missing",
                    spec.kind().name()
                );
            }
            return Ok(());
        }
        if !quantity.admits(children.len()) {
            warn!(
                path = %format!("{}/{}", mgr.builders().path(parent), path),
                count = children.len(),
                expected = ?quantity,
                "quantity does not match the spec"
            );
        }

        let is_link = spec.kind() == SpecKind::Link;
        for c in children {
            let child = scope.cs.get(c).ok_or(crate::error::ContainerError::NotFound)?;
            let owned = child.parent() == Some(scope.id);
            let foreign = !mgr.is_export()
                && !child.is_modified()
                && child.container_source().is_some()
                && child.container_source() != scope.container.container_source();
            let b = if owned && !is_link && !foreign {
                mgr.build_container(scope.cs, c)?
            } else {
                let link_name = spec.name().unwrap_or(child.name());
                let link_path = format!("{}/{}", mgr.builders().path(parent), link_name);
                let target = mgr.link_target(scope.cs, c, &link_path)?;
                mgr.builders_mut().new_link(link_name, LinkTarget::Builder(target))
            };
            mgr.builders_mut().set_child(parent, b)?;
        }
        Ok(())
    }

    // =========================================================================
    // Construct direction
    // =========================================================================

    /// Reads the fields of a container from `builder`.
    pub(crate) fn construct_fields(
        &self,
        mgr: &mut BuildManager<'_>,
        cs: &mut Containers,
        class: &Arc<ContainerClass>,
        builder: BuilderId,
    ) -> Result<Restored> {
        let mut fields = BTreeMap::new();
        match self.spec.as_ref() {
            TypeSpec::Group(g) => self.construct_group(mgr, cs, g, builder, "", &mut fields)?,
            TypeSpec::Dataset(d) => self.construct_attributes(mgr, cs, &d.attributes, builder, "", &mut fields)?,
        }

        let data = match (class.kind(), mgr.builders().node(builder).data().cloned()) {
            (ClassKind::Data, Some(v)) => Some(mgr.container_value(cs, &v)?),
            _ => None,
        };

        if let Some(custom) = &self.custom {
            for path in self.mapping.spec_paths() {
                let Some(field) = self.mapping.field_for(path) else {
                    continue;
                };
                if let Some(v) = custom.constructor_arg(field, mgr.builders(), builder) {
                    fields.insert(field.to_string(), v);
                }
            }
        }

        let node = mgr.builders().node(builder);
        for desc in class.fields() {
            if desc.required && !fields.contains_key(&desc.name) {
                return Err(Error::MissingRequired {
                    path: mgr.builders().path(builder),
                    field: desc.name.clone(),
                });
            }
        }
        let object_id = match node
            .attribute(OBJECT_ID_ATTR)
            .and_then(Value::as_text)
            .and_then(parse_object_id)
        {
            Some(id) => id,
            None => {
                debug!(path = %mgr.builders().path(builder), "builder has no object id, generating one");
                new_object_id()
            }
        };
        Ok(Restored {
            object_id,
            name: node.name().to_string(),
            class: class.clone(),
            fields,
            data,
            source: node.source().map(str::to_string),
        })
    }

    fn construct_attributes(
        &self,
        mgr: &mut BuildManager<'_>,
        cs: &mut Containers,
        attrs: &[AttributeSpec],
        builder: BuilderId,
        prefix: &str,
        fields: &mut BTreeMap<String, FieldValue>,
    ) -> Result<()> {
        for a in attrs.iter().filter(|a| a.value.is_none()) {
            let Some(field) = self.mapping.field_for(&join_path(prefix, &a.name)) else {
                continue;
            };
            let Some(v) = mgr.builders().node(builder).attribute(&a.name).cloned() else {
                continue;
            };
            let v = mgr.container_value(cs, &v)?;
            fields.insert(field.to_string(), FieldValue::Value(v));
        }
        Ok(())
    }

    fn construct_group(
        &self,
        mgr: &mut BuildManager<'_>,
        cs: &mut Containers,
        g: &GroupSpec,
        builder: BuilderId,
        prefix: &str,
        fields: &mut BTreeMap<String, FieldValue>,
    ) -> Result<()> {
        self.construct_attributes(mgr, cs, &g.attributes, builder, prefix, fields)?;
        let mut typed = Vec::new();
        for d in &g.datasets {
            if d.is_typed() {
                typed.push(SpecRef::Dataset(d));
                continue;
            }
            let name = d.name.as_deref().unwrap_or_default();
            let path = join_path(prefix, name);
            let Some(dataset) = mgr.builders().child(builder, name) else {
                continue;
            };
            if d.value.is_none() {
                if let Some(field) = self.mapping.field_for(&path) {
                    if let Some(value) = self.dataset_field(mgr, cs, builder, dataset, name)? {
                        fields.insert(field.to_string(), value);
                    }
                }
            }
            self.construct_attributes(mgr, cs, &d.attributes, dataset, &path, fields)?;
        }
        for sub in &g.groups {
            if sub.is_typed() {
                typed.push(SpecRef::Group(sub));
                continue;
            }
            let name = sub.name.as_deref().unwrap_or_default();
            if let Some(group) = mgr.builders().child(builder, name) {
                self.construct_group(mgr, cs, sub, group, &join_path(prefix, name), fields)?;
            }
        }
        typed.extend(g.links.iter().map(SpecRef::Link));
        if typed.is_empty() {
            return Ok(());
        }
        self.construct_typed(mgr, cs, &typed, builder, prefix, fields)
    }

    /// Reads an untyped dataset, decoding it with its index dataset if one exists.
    fn dataset_field(
        &self,
        mgr: &mut BuildManager<'_>,
        cs: &mut Containers,
        parent: BuilderId,
        dataset: BuilderId,
        name: &str,
    ) -> Result<Option<FieldValue>> {
        let Some(data) = mgr.builders().node(dataset).data().cloned() else {
            return Ok(None);
        };
        let index = mgr.builders().child(parent, &format!("{}{}", name, INDEX_SUFFIX));
        let Some(index) = index else {
            return Ok(Some(FieldValue::Value(mgr.container_value(cs, &data)?)));
        };

        let path = mgr.builders().path(dataset);
        let offsets = mgr
            .builders()
            .node(index)
            .data()
            .and_then(decode_offsets)
            .ok_or_else(|| ConversionError::RaggedIndex {
                path: path.clone(),
                reason: "index is not a list of offsets".to_string(),
            })?;
        let items = match mgr.container_value(cs, &data)? {
            Value::List(items) => items,
            other => vec![other],
        };
        let column =
            RaggedColumn::from_parts(items, offsets).map_err(|reason| ConversionError::RaggedIndex { path, reason })?;
        Ok(Some(FieldValue::Ragged(column)))
    }

    /// Assigns typed sub-builders (and link targets) of `builder` to the
    /// typed specs of this scope, most specific type first.
    fn construct_typed(
        &self,
        mgr: &mut BuildManager<'_>,
        cs: &mut Containers,
        typed: &[SpecRef<'_>],
        builder: BuilderId,
        prefix: &str,
        fields: &mut BTreeMap<String, FieldValue>,
    ) -> Result<()> {
        let children: Vec<BuilderId> = mgr.builders().node(builder).children().collect();
        for child in children {
            let is_link = mgr.builders().node(child).kind() == NodeKind::Link;
            let target = if is_link { mgr.resolve_link(child)? } else { child };
            if mgr.builders().node(target).data_type().is_none() {
                continue;
            }
            let key = mgr.builder_type(target)?;
            let hierarchy = mgr.type_map().catalog().hierarchy(&key.namespace, &key.data_type)?;
            let child_name = mgr.builders().name(child);

            let best = typed
                .iter()
                .filter_map(|spec| {
                    let distance = hierarchy
                        .iter()
                        .position(|k| Some(k.data_type.as_str()) == spec.data_type())?;
                    let named = match spec.name() {
                        Some(n) if n == child_name => 0u8,
                        Some(_) => return None,
                        None => 1,
                    };
                    let kind_mismatch = u8::from((spec.kind() == SpecKind::Link) != is_link);
                    Some(((kind_mismatch, named, distance), *spec))
                })
                .min_by_key(|(rank, _)| *rank)
                .map(|(_, spec)| spec);
            let Some(spec) = best else {
                debug!(path = %mgr.builders().path(child), "no spec claims this child");
                continue;
            };
            let Some(field) = self.mapping.field_for(&join_path(prefix, spec_key(&spec))) else {
                continue;
            };
            let field = field.to_string();

            let c = mgr.construct_builder(cs, target)?;
            match fields.get_mut(&field) {
                Some(FieldValue::Children(items)) => items.push(c),
                Some(_) => {
                    warn!(path = %mgr.builders().path(child), field, "more than one child for a single-valued field");
                }
                None if spec.is_many() => {
                    fields.insert(field, FieldValue::Children(vec![c]));
                }
                None => {
                    fields.insert(field, FieldValue::Child(c));
                }
            }
        }
        Ok(())
    }
}

/// Borrowed state of the container being built.
struct BuildScope<'c> {
    cs: &'c Containers,
    id: ContainerId,
    container: &'c Container,
}

/// The dtype recorded on a dataset builder: the converted value's primitive
/// for primitive specs (it may be wider than the spec's), the spec's otherwise.
fn stored_dtype<R>(spec: Option<&DType>, value: &Value<R>) -> Option<DType> {
    match spec {
        None | Some(DType::Primitive(_)) | Some(DType::Numeric) => {
            value.primitive().map(DType::Primitive).or_else(|| spec.cloned())
        }
        Some(other) => Some(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::value::Primitive;
    use crate::spec::Quantity;
    use serde_json::json;

    fn bucket_spec() -> Arc<TypeSpec> {
        Arc::new(
            TypeSpec::group_from_json(&json!({
                "data_type_def": "Bucket", "doc": "a bucket",
                "attributes": [
                    {"name": "Label", "dtype": "text", "doc": "label", "required": false},
                    {"name": "kind", "dtype": "text", "doc": "fixed", "value": "bucket"}
                ],
                "datasets": [
                    {"name": "values", "dtype": "int32", "doc": "values", "quantity": "?",
                     "attributes": [{"name": "unit", "dtype": "text", "doc": "unit", "default_value": "m"}]},
                    {"data_type_inc": "Series", "doc": "series", "quantity": "*"}
                ],
                "groups": [
                    {"name": "meta", "doc": "untyped", "quantity": "?",
                     "groups": [{"data_type_inc": "Series", "doc": "s", "quantity": "?"}]}
                ],
                "links": [{"name": "source_series", "target_type": "Series", "doc": "l", "quantity": "?"}]
            }))
            .unwrap(),
        )
    }

    #[test]
    fn test_snake_case() {
        assert_eq!(snake_case("Series"), "series");
        assert_eq!(snake_case("SeriesGroup"), "series_group");
        assert_eq!(snake_case("ABCThing"), "abc_thing");
        assert_eq!(snake_case("Data2D"), "data2_d");
        assert_eq!(snake_case("already_snake"), "already_snake");
    }

    #[test]
    fn test_default_mapping() {
        let mapper = ObjectMapper::new(TypeKey::new("test", "Bucket"), bucket_spec(), None);
        let m = mapper.mapping();
        assert_eq!(m.field_for("Label"), Some("label"));
        assert_eq!(m.field_for("kind"), None);
        assert_eq!(m.field_for("values"), Some("values"));
        assert_eq!(m.field_for("values/unit"), Some("values__unit"));
        assert_eq!(m.field_for("Series"), Some("seriess"));
        assert_eq!(m.field_for("meta/Series"), Some("meta__series"));
        assert_eq!(m.field_for("source_series"), Some("source_series"));
        assert_eq!(m.path_for("values__unit"), Some("values/unit"));

        let descriptors = mapper.descriptors();
        let names: Vec<&str> = descriptors.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["label", "values", "values__unit", "seriess", "meta__series", "source_series"]
        );
        // optional dataset: its attribute default is not filled in
        let unit = &descriptors[2];
        assert!(!unit.required);
        assert_eq!(unit.default, None);
        match &descriptors[3].kind {
            FieldKind::Child { data_type, many } => {
                assert_eq!(data_type, "Series");
                assert!(*many);
            }
            other => panic!("Expected Child, got {:?}", other),
        }
        assert!(matches!(descriptors[5].kind, FieldKind::Link { many: false, .. }));
        assert_eq!(
            descriptors[1].kind,
            FieldKind::Dataset {
                dtype: Some(DType::Primitive(Primitive::Int32))
            }
        );
    }

    struct Renamer;

    impl CustomMapper for Renamer {
        fn configure(&self, mapping: &mut FieldMapping) {
            assert!(mapping.map_spec("Series", "series_list"));
            assert!(!mapping.map_spec("nope", "x"));
            mapping.unmap("meta/Series");
        }
    }

    #[test]
    fn test_custom_configure() {
        let mapper = ObjectMapper::new(TypeKey::new("test", "Bucket"), bucket_spec(), Some(Rc::new(Renamer)));
        let names: Vec<String> = mapper.descriptors().into_iter().map(|d| d.name).collect();
        assert!(names.contains(&"series_list".to_string()));
        assert!(!names.contains(&"meta__series".to_string()));
        assert_eq!(mapper.mapping().spec_paths().count(), 6);
    }

    #[test]
    fn test_required_rules() {
        let spec = Arc::new(
            TypeSpec::group_from_json(&json!({
                "data_type_def": "Strict", "doc": "d",
                "attributes": [
                    {"name": "a", "dtype": "int32", "doc": "required"},
                    {"name": "b", "dtype": "int32", "doc": "defaulted", "default_value": 1}
                ],
                "datasets": [{"name": "d", "dtype": "float64", "doc": "required dataset"}],
                "groups": [{"data_type_inc": "Strict", "doc": "one or more", "quantity": "+"}]
            }))
            .unwrap(),
        );
        let mapper = ObjectMapper::new(TypeKey::new("test", "Strict"), spec, None);
        let required: Vec<(String, bool)> = mapper.descriptors().into_iter().map(|d| (d.name, d.required)).collect();
        assert_eq!(
            required,
            vec![
                ("a".to_string(), true),
                ("b".to_string(), false),
                ("d".to_string(), true),
                ("stricts".to_string(), true),
            ]
        );
        assert!(Quantity::OneOrMany.is_required());
    }

    #[test]
    fn test_stored_dtype() {
        let spec = DType::Primitive(Primitive::Int32);
        assert_eq!(
            stored_dtype(Some(&spec), &Value::<()>::Int64(1)),
            Some(DType::Primitive(Primitive::Int64))
        );
        assert_eq!(stored_dtype(Some(&spec), &Value::<()>::List(vec![])), Some(spec.clone()));
        assert_eq!(stored_dtype::<()>(None, &Value::Text("x".into())), Some(DType::Primitive(Primitive::Text)));
    }
}
