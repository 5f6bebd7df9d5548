//! Validation of builder trees against resolved specs.
//!
//! Validation is a separate pass over an already built (or read) tree. It
//! never fails early: every typed builder is checked against the spec of its
//! `data_type` and all findings are collected.
//!
//! What is checked:
//! - required attributes, datasets and groups are present
//! - attribute and dataset values fit their dtype under the type map's
//!   conversion policy, references point at builders of the target type
//! - values have one of the allowed shapes
//! - typed children and links occur as often as their quantity allows
//! - every `data_type` resolves in the catalog
//!
//! Untyped members are checked as part of their nearest typed ancestor.
//! Members without a spec are ignored.

use tracing::debug;

use crate::build::convert::check_shape;
use crate::build::type_map::TypeMap;
use crate::error::{ConversionError, ValidationError};
use crate::limits::INDEX_SUFFIX;
use crate::model::builder::{BuilderId, BuilderValue, Builders, NodeKind};
use crate::model::value::{DType, PrimitiveClass, Value};
use crate::spec::{AttributeSpec, DatasetSpec, GroupSpec, Quantity, ShapeSpec, TypeKey, TypeSpec};

/// Validates the tree under `root`, returning every finding in tree order.
pub fn validate_tree(type_map: &TypeMap, builders: &Builders, root: BuilderId) -> Vec<ValidationError> {
    let mut validator = Validator {
        type_map,
        builders,
        errors: Vec::new(),
    };
    for id in builders.descendants(root) {
        let node = builders.node(id);
        if node.kind() != NodeKind::Link && node.data_type().is_some() {
            validator.check_typed(id);
        }
    }
    debug!(findings = validator.errors.len(), "validation finished");
    validator.errors
}

struct Validator<'a> {
    type_map: &'a TypeMap,
    builders: &'a Builders,
    errors: Vec<ValidationError>,
}

impl Validator<'_> {
    fn type_of(&self, id: BuilderId) -> Option<TypeKey> {
        let node = self.builders.node(id);
        let data_type = node.data_type()?;
        match node.namespace() {
            Some(ns) => self.type_map.catalog().canonical(ns, data_type).ok(),
            None => self.type_map.find_namespace(data_type).ok(),
        }
    }

    fn is_a(&self, id: BuilderId, data_type: &str) -> bool {
        self.type_of(id)
            .is_some_and(|key| self.type_map.catalog().is_sub_data_type(&key.namespace, &key.data_type, data_type))
    }

    fn check_typed(&mut self, id: BuilderId) {
        let node = self.builders.node(id);
        let data_type = node.data_type().unwrap_or_default();
        let resolved = self
            .type_of(id)
            .and_then(|key| self.type_map.catalog().resolve(&key.namespace, &key.data_type).ok());
        let Some(spec) = resolved else {
            self.errors.push(ValidationError::UnknownType {
                path: self.builders.path(id),
                namespace: node.namespace().unwrap_or_default().to_string(),
                data_type: data_type.to_string(),
            });
            return;
        };
        match &*spec {
            TypeSpec::Group(g) => {
                self.check_attributes(id, &g.attributes);
                self.check_group_members(id, g);
            }
            TypeSpec::Dataset(d) => self.check_dataset(id, d),
        }
    }

    fn check_attributes(&mut self, id: BuilderId, specs: &[AttributeSpec]) {
        let node = self.builders.node(id);
        for spec in specs {
            let path = format!("{}/{}", self.builders.path(id), spec.name);
            match node.attribute(&spec.name) {
                Some(value) => self.check_value(value, Some(&spec.dtype), spec.shape.as_ref(), path),
                None if spec.required => self.errors.push(ValidationError::MissingAttribute {
                    path: self.builders.path(id),
                    name: spec.name.clone(),
                }),
                None => {}
            }
        }
    }

    fn check_dataset(&mut self, id: BuilderId, spec: &DatasetSpec) {
        self.check_attributes(id, &spec.attributes);
        let node = self.builders.node(id);
        let Some(data) = node.data() else {
            return;
        };
        // a ragged column stores flattened rows, only its dtype is comparable
        let ragged = node.parent().is_some_and(|parent| {
            self.builders
                .child(parent, &format!("{}{}", node.name(), INDEX_SUFFIX))
                .is_some()
        });
        let shape = if ragged { None } else { spec.shape.as_ref() };
        self.check_value(data, spec.dtype.as_ref(), shape, self.builders.path(id));
    }

    fn check_group_members(&mut self, id: BuilderId, spec: &GroupSpec) {
        let path = self.builders.path(id);
        for d in &spec.datasets {
            match (d.data_type(), d.name.as_deref()) {
                (Some(data_type), name) => {
                    let found = self.count_typed(id, NodeKind::Dataset, data_type, name);
                    self.check_quantity(&path, data_type, d.quantity, found);
                }
                (None, Some(name)) => match self.builders.child(id, name) {
                    Some(child) if self.builders.node(child).kind() == NodeKind::Dataset => {
                        self.check_dataset(child, d)
                    }
                    Some(_) => {}
                    None if d.quantity.is_required() => self.errors.push(ValidationError::MissingDataset {
                        path: path.clone(),
                        name: name.to_string(),
                    }),
                    None => {}
                },
                (None, None) => {}
            }
        }
        for g in &spec.groups {
            match (g.data_type(), g.name.as_deref()) {
                (Some(data_type), name) => {
                    let found = self.count_typed(id, NodeKind::Group, data_type, name);
                    self.check_quantity(&path, data_type, g.quantity, found);
                }
                (None, Some(name)) => match self.builders.child(id, name) {
                    Some(child) if self.builders.node(child).kind() == NodeKind::Group => {
                        self.check_attributes(child, &g.attributes);
                        self.check_group_members(child, g);
                    }
                    Some(_) => {}
                    None if g.quantity.is_required() => self.errors.push(ValidationError::MissingGroup {
                        path: path.clone(),
                        name: name.to_string(),
                    }),
                    None => {}
                },
                (None, None) => {}
            }
        }
        for l in &spec.links {
            let node = self.builders.node(id);
            let found = node
                .links()
                .iter()
                .filter(|&&link| l.name.as_deref().is_none_or(|n| n == self.builders.name(link)))
                .filter(|&&link| {
                    self.builders
                        .follow_links(link)
                        .is_ok_and(|target| self.is_a(target, &l.target_type))
                })
                .count();
            self.check_quantity(&path, &l.target_type, l.quantity, found);
        }
    }

    /// Counts the children of `parent` of `kind` that are (or link to) a
    /// `data_type`, restricted to `name` when the spec names the child.
    fn count_typed(&self, parent: BuilderId, kind: NodeKind, data_type: &str, name: Option<&str>) -> usize {
        let node = self.builders.node(parent);
        let direct = match kind {
            NodeKind::Group => node.groups(),
            _ => node.datasets(),
        };
        let linked = node.links().iter().filter_map(|&link| {
            self.builders
                .follow_links(link)
                .ok()
                .filter(|&target| self.builders.node(target).kind() == kind)
                .map(|_| link)
        });
        direct
            .iter()
            .copied()
            .chain(linked)
            .filter(|&child| name.is_none_or(|n| n == self.builders.name(child)))
            .filter(|&child| {
                let target = self.builders.follow_links(child).unwrap_or(child);
                self.is_a(target, data_type)
            })
            .count()
    }

    fn check_quantity(&mut self, path: &str, data_type: &str, quantity: Quantity, found: usize) {
        if !quantity.admits(found) {
            self.errors.push(ValidationError::QuantityMismatch {
                path: path.to_string(),
                data_type: data_type.to_string(),
                expected: quantity.to_string(),
                found,
            });
        }
    }

    fn check_value(&mut self, value: &BuilderValue, dtype: Option<&DType>, shape: Option<&ShapeSpec>, path: String) {
        if let Some(dtype) = dtype {
            if !self.fits(value, dtype) {
                self.errors.push(ValidationError::DtypeMismatch {
                    path: path.clone(),
                    expected: dtype.to_string(),
                    found: value.type_name(),
                });
                return;
            }
        }
        if let Err(ConversionError::ShapeMismatch { expected, actual, .. }) = check_shape(value, shape, &path) {
            self.errors.push(ValidationError::ShapeMismatch {
                path,
                expected,
                found: actual,
            });
        }
    }

    fn fits(&self, value: &BuilderValue, dtype: &DType) -> bool {
        let policy = self.type_map.policy();
        match (value, dtype) {
            (Value::List(items), _) => items.iter().all(|v| self.fits(v, dtype)),
            (Value::Compound(values), DType::Compound(fields)) => {
                values.len() == fields.len() && values.iter().zip(fields).all(|(v, f)| self.fits(v, &f.dtype))
            }
            (Value::Ref(target) | Value::Region { target, .. }, DType::Reference { target_type, .. }) => {
                // targets in other sources cannot be checked here
                match self.builders.follow_links(*target) {
                    Ok(t) => self.is_a(t, target_type),
                    Err(_) => true,
                }
            }
            (Value::Compound(_) | Value::Ref(_) | Value::Region { .. }, _) => false,
            (scalar, DType::Numeric) => scalar.primitive().is_some_and(|p| p.is_numeric()),
            (scalar, DType::Primitive(spec)) => scalar.primitive().is_some_and(|given| {
                policy.resolve(given, *spec).is_some()
                    || (policy.allows_narrowing()
                        && given.class() == PrimitiveClass::Float
                        && matches!(spec.class(), PrimitiveClass::Signed | PrimitiveClass::Unsigned))
            }),
            (_, DType::Reference { .. } | DType::Compound(_)) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::value::Primitive;
    use crate::spec::{Namespace, NamespaceCatalog};
    use serde_json::json;

    fn type_map() -> TypeMap {
        let specs = vec![
            TypeSpec::group_from_json(&json!({
                "data_type_def": "Shelf", "doc": "a shelf",
                "attributes": [{"name": "label", "dtype": "text", "doc": "l"}],
                "datasets": [
                    {"name": "weights", "dtype": "float32", "shape": [null], "doc": "w"},
                    {"name": "notes", "dtype": "text", "doc": "n", "quantity": "?"}
                ],
                "groups": [
                    {"name": "meta", "doc": "m", "attributes": [{"name": "owner", "dtype": "text", "doc": "o"}]},
                    {"data_type_inc": "Book", "doc": "books", "quantity": "+"}
                ],
                "links": [{"name": "favorite", "target_type": "Book", "doc": "f", "quantity": "?"}]
            }))
            .unwrap(),
            TypeSpec::group_from_json(&json!({
                "data_type_def": "Book", "doc": "a book",
                "attributes": [
                    {"name": "pages", "dtype": "int32", "doc": "p"},
                    {"name": "shelf", "dtype": {"target_type": "Shelf", "reftype": "object"}, "doc": "s", "required": false}
                ]
            }))
            .unwrap(),
        ];
        let mut catalog = NamespaceCatalog::new();
        catalog
            .register(Namespace::new("library", Some("1.0")).unwrap().specs("library.json", specs))
            .unwrap();
        TypeMap::new(catalog)
    }

    fn book(b: &mut Builders, name: &str, pages: i32) -> BuilderId {
        b.group(name, |g| {
            g.attribute("data_type", "Book")
                .attribute("namespace", "library")
                .attribute("pages", pages)
        })
        .unwrap()
    }

    fn valid_shelf(b: &mut Builders) -> BuilderId {
        let first = book(b, "first", 120);
        let shelf = b
            .group("shelf", |g| {
                g.attribute("data_type", "Shelf")
                    .attribute("namespace", "library")
                    .attribute("label", "fiction")
                    .dataset("weights", vec![1.5f32, 2.0], |d| d.dtype(Primitive::Float32))
                    .group("meta", |m| m.attribute("owner", "ana"))
            })
            .unwrap();
        b.set_child(shelf, first).unwrap();
        b.add_link(shelf, "favorite", first).unwrap();
        shelf
    }

    #[test]
    fn test_valid_tree() {
        let tm = type_map();
        let mut b = Builders::new();
        let shelf = valid_shelf(&mut b);
        assert_eq!(validate_tree(&tm, &b, shelf), vec![]);
    }

    #[test]
    fn test_missing_members() {
        let tm = type_map();
        let mut b = Builders::new();
        let shelf = b
            .group("shelf", |g| g.attribute("data_type", "Shelf").attribute("namespace", "library"))
            .unwrap();
        let errors = validate_tree(&tm, &b, shelf);
        assert!(errors.contains(&ValidationError::MissingAttribute {
            path: "shelf".into(),
            name: "label".into(),
        }));
        assert!(errors.contains(&ValidationError::MissingDataset {
            path: "shelf".into(),
            name: "weights".into(),
        }));
        assert!(errors.contains(&ValidationError::MissingGroup {
            path: "shelf".into(),
            name: "meta".into(),
        }));
        assert!(errors.contains(&ValidationError::QuantityMismatch {
            path: "shelf".into(),
            data_type: "Book".into(),
            expected: "+".into(),
            found: 0,
        }));
        // optional members are not reported
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_dtype_and_shape() {
        let tm = type_map();
        let mut b = Builders::new();
        let shelf = valid_shelf(&mut b);
        let weights = b.child(shelf, "weights").unwrap();
        b.set_data(weights, Some(Value::from(vec![vec![1.0f32], vec![2.0]])));
        let first = b.child(shelf, "first").unwrap();
        b.set_attribute(first, "pages", Value::Text("many".into())).unwrap();

        let errors = validate_tree(&tm, &b, shelf);
        match &errors[..] {
            [ValidationError::ShapeMismatch { path, found, .. }, ValidationError::DtypeMismatch { path: dpath, expected, .. }] =>
            {
                assert_eq!(path, "shelf/weights");
                assert_eq!(found, &vec![2, 1]);
                assert_eq!(dpath, "shelf/first/pages");
                assert_eq!(expected, "int32");
            }
            other => panic!("Expected shape and dtype findings, got {:?}", other),
        }
    }

    #[test]
    fn test_reference_target_type() {
        let tm = type_map();
        let mut b = Builders::new();
        let shelf = valid_shelf(&mut b);
        let first = b.child(shelf, "first").unwrap();
        b.set_attribute(first, "shelf", Value::Ref(shelf)).unwrap();
        assert_eq!(validate_tree(&tm, &b, shelf), vec![]);

        // a book is not a shelf
        b.set_attribute(first, "shelf", Value::Ref(first)).unwrap();
        match &validate_tree(&tm, &b, shelf)[..] {
            [ValidationError::DtypeMismatch { path, found, .. }] => {
                assert_eq!(path, "shelf/first/shelf");
                assert_eq!(found, "reference");
            }
            other => panic!("Expected DtypeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type() {
        let tm = type_map();
        let mut b = Builders::new();
        let root = b
            .group("root", |g| g.attribute("data_type", "Magazine").attribute("namespace", "library"))
            .unwrap();
        match &validate_tree(&tm, &b, root)[..] {
            [ValidationError::UnknownType { data_type, namespace, .. }] => {
                assert_eq!(data_type, "Magazine");
                assert_eq!(namespace, "library");
            }
            other => panic!("Expected UnknownType, got {:?}", other),
        }
    }

    #[test]
    fn test_narrowing_policy() {
        use crate::build::convert::ConversionPolicy;

        let mut tm = type_map();
        let mut b = Builders::new();
        let first = book(&mut b, "first", 0);
        b.set_attribute(first, "pages", Value::Float64(12.0)).unwrap();
        assert_eq!(validate_tree(&tm, &b, first).len(), 1);

        tm.set_policy(ConversionPolicy::new().with_narrowing(true));
        assert_eq!(validate_tree(&tm, &b, first), vec![]);
    }
}
