//! Namespace catalog: registration, type lookup and inheritance resolution.
//!
//! A type is always resolved in the namespace that defines it, so a type
//! reached through several dependent namespaces maps to one canonical
//! [`TypeKey`]. Resolved specs and hierarchies are memoized.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::error::{CatalogError, SpecError};
use crate::spec::namespace::{Namespace, SchemaEntry};
use crate::spec::types::TypeSpec;

/// Canonical identity of a type: its defining namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeKey {
    pub namespace: String,
    pub data_type: String,
}

impl TypeKey {
    pub fn new(namespace: &str, data_type: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            data_type: data_type.to_string(),
        }
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.data_type)
    }
}

#[derive(Debug)]
struct Loaded {
    namespace: Namespace,
    digest: [u8; 32],
    /// Types defined here, unresolved, in registration order.
    types: FxHashMap<String, Arc<TypeSpec>>,
    type_order: Vec<String>,
    sources: FxHashMap<String, String>,
    includes: Vec<(String, Option<Vec<String>>)>,
}

/// Registry of loaded namespaces.
#[derive(Debug, Default)]
pub struct NamespaceCatalog {
    namespaces: FxHashMap<String, Loaded>,
    order: Vec<String>,
    resolved: RefCell<FxHashMap<TypeKey, Arc<TypeSpec>>>,
    hierarchies: RefCell<FxHashMap<TypeKey, Arc<[TypeKey]>>>,
}

impl NamespaceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a namespace.
    ///
    /// Registering identical content again is a no-op. The same name and
    /// version with different content fails with
    /// [`CatalogError::DuplicateNamespace`]; a different version of a loaded
    /// namespace is ignored with a warning. Dependencies must already be
    /// registered and every referenced type must resolve, otherwise nothing
    /// is registered.
    pub fn register(&mut self, namespace: Namespace) -> Result<(), CatalogError> {
        let digest = namespace.digest();
        if let Some(existing) = self.namespaces.get(&namespace.name) {
            if existing.digest == digest {
                debug!(namespace = %namespace.name, "namespace already registered");
                return Ok(());
            }
            if existing.namespace.version == namespace.version {
                return Err(CatalogError::DuplicateNamespace {
                    name: namespace.name.clone(),
                    version: namespace.version.clone(),
                });
            }
            warn!(
                namespace = %namespace.name,
                loaded = ?existing.namespace.version,
                ignored = ?namespace.version,
                "namespace already loaded with a different version, keeping the loaded one"
            );
            return Ok(());
        }

        let name = namespace.name.clone();
        let mut loaded = Loaded {
            namespace,
            digest,
            types: FxHashMap::default(),
            type_order: Vec::new(),
            sources: FxHashMap::default(),
            includes: Vec::new(),
        };

        for entry in &loaded.namespace.schema {
            match entry {
                SchemaEntry::Include { namespace: dep, data_types } => {
                    if !self.namespaces.contains_key(dep) {
                        return Err(CatalogError::UnresolvedDependency {
                            namespace: name.clone(),
                            dependency: dep.clone(),
                        });
                    }
                    for t in data_types.iter().flatten() {
                        if self.find(dep, t).is_none() {
                            return Err(CatalogError::TypeDoesNotExist {
                                namespace: dep.clone(),
                                data_type: t.clone(),
                            });
                        }
                    }
                    loaded.includes.push((dep.clone(), data_types.clone()));
                }
                SchemaEntry::Specs { source, specs } => {
                    for spec in specs {
                        let defs = spec.type_definitions();
                        if defs.is_empty() {
                            return Err(CatalogError::Spec(SpecError::MissingKey {
                                path: spec.name().unwrap_or(source).to_string(),
                                key: "data_type_def",
                            }));
                        }
                        for def in defs {
                            let Some(type_name) = def.data_type_def().map(str::to_string) else {
                                continue;
                            };
                            if loaded.types.contains_key(&type_name) {
                                return Err(CatalogError::DuplicateType {
                                    namespace: name.clone(),
                                    data_type: type_name,
                                });
                            }
                            loaded.sources.insert(type_name.clone(), source.clone());
                            loaded.type_order.push(type_name.clone());
                            loaded.types.insert(type_name, Arc::new(def));
                        }
                    }
                }
            }
        }

        self.namespaces.insert(name.clone(), loaded);
        if let Err(e) = self.check_references(&name) {
            self.namespaces.remove(&name);
            return Err(e);
        }
        self.order.push(name.clone());
        debug!(
            namespace = %name,
            types = self.namespaces.get(&name).map_or(0, |l| l.types.len()),
            "registered namespace"
        );
        Ok(())
    }

    fn check_references(&self, name: &str) -> Result<(), CatalogError> {
        let Some(loaded) = self.namespaces.get(name) else {
            return Ok(());
        };
        for type_name in &loaded.type_order {
            let Some(spec) = loaded.types.get(type_name) else {
                continue;
            };
            for referenced in spec.referenced_types() {
                if self.find(name, referenced).is_none() {
                    return Err(CatalogError::TypeDoesNotExist {
                        namespace: name.to_string(),
                        data_type: referenced.to_string(),
                    });
                }
            }
            // walk the include chain to catch cycles
            let mut seen: Vec<TypeKey> = Vec::new();
            let mut current = TypeKey::new(name, type_name);
            loop {
                if seen.contains(&current) {
                    return Err(CatalogError::InheritanceCycle {
                        namespace: name.to_string(),
                        data_type: type_name.clone(),
                    });
                }
                let Some((dns, raw)) = self.find(&current.namespace, &current.data_type) else {
                    break;
                };
                let next = raw.data_type_inc().map(|inc| TypeKey::new(dns, inc));
                seen.push(current);
                match next {
                    Some(n) => current = n,
                    None => break,
                }
            }
        }
        Ok(())
    }

    /// Finds the raw spec of `data_type` visible from `namespace`, together
    /// with the namespace that defines it.
    fn find<'s>(&'s self, namespace: &str, data_type: &str) -> Option<(&'s str, &'s Arc<TypeSpec>)> {
        let mut visited = Vec::new();
        self.find_in(namespace, data_type, &mut visited)
    }

    fn find_in<'s>(
        &'s self,
        namespace: &str,
        data_type: &str,
        visited: &mut Vec<String>,
    ) -> Option<(&'s str, &'s Arc<TypeSpec>)> {
        let loaded = self.namespaces.get(namespace)?;
        if let Some(spec) = loaded.types.get(data_type) {
            return Some((loaded.namespace.name.as_str(), spec));
        }
        visited.push(namespace.to_string());
        for (dep, types) in &loaded.includes {
            if types.as_ref().is_some_and(|t| !t.iter().any(|x| x == data_type)) {
                continue;
            }
            if visited.contains(dep) {
                continue;
            }
            if let Some(found) = self.find_in(dep, data_type, visited) {
                return Some(found);
            }
        }
        None
    }

    fn not_found(namespace: &str, data_type: &str) -> CatalogError {
        CatalogError::TypeDoesNotExist {
            namespace: namespace.to_string(),
            data_type: data_type.to_string(),
        }
    }

    /// True if a namespace with this name is registered.
    pub fn has_namespace(&self, name: &str) -> bool {
        self.namespaces.contains_key(name)
    }

    pub fn get_namespace(&self, name: &str) -> Option<&Namespace> {
        self.namespaces.get(name).map(|l| &l.namespace)
    }

    /// Registered namespace names, in registration order.
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Types defined by `namespace`, in registration order.
    pub fn registered_types(&self, namespace: &str) -> Result<Vec<&str>, CatalogError> {
        self.namespaces
            .get(namespace)
            .map(|l| l.type_order.iter().map(String::as_str).collect())
            .ok_or_else(|| CatalogError::NamespaceNotFound {
                namespace: namespace.to_string(),
            })
    }

    /// The spec source a type was loaded from.
    pub fn source_of(&self, namespace: &str, data_type: &str) -> Option<&str> {
        let (dns, _) = self.find(namespace, data_type)?;
        self.namespaces.get(dns)?.sources.get(data_type).map(String::as_str)
    }

    /// Canonical key of `data_type` as seen from `namespace`.
    pub fn canonical(&self, namespace: &str, data_type: &str) -> Result<TypeKey, CatalogError> {
        if !self.namespaces.contains_key(namespace) {
            return Err(CatalogError::NamespaceNotFound {
                namespace: namespace.to_string(),
            });
        }
        self.find(namespace, data_type)
            .map(|(dns, _)| TypeKey::new(dns, data_type))
            .ok_or_else(|| Self::not_found(namespace, data_type))
    }

    /// The type's own spec, without inherited content.
    pub fn raw_spec(&self, namespace: &str, data_type: &str) -> Result<Arc<TypeSpec>, CatalogError> {
        self.find(namespace, data_type)
            .map(|(_, spec)| spec.clone())
            .ok_or_else(|| Self::not_found(namespace, data_type))
    }

    /// Returns the flattened spec of a type: everything it inherits merged
    /// with its own refinements.
    pub fn resolve(&self, namespace: &str, data_type: &str) -> Result<Arc<TypeSpec>, CatalogError> {
        let (dns, raw) = self
            .find(namespace, data_type)
            .ok_or_else(|| Self::not_found(namespace, data_type))?;
        let key = TypeKey::new(dns, data_type);
        if let Some(spec) = self.resolved.borrow().get(&key) {
            return Ok(spec.clone());
        }

        let resolved = match raw.data_type_inc() {
            Some(base) => {
                let base_spec = self.resolve(dns, base)?;
                match (raw.as_ref(), base_spec.as_ref()) {
                    (TypeSpec::Group(g), TypeSpec::Group(b)) => TypeSpec::Group(g.inherit(b)),
                    (TypeSpec::Dataset(d), TypeSpec::Dataset(b)) => TypeSpec::Dataset(d.inherit(b)),
                    _ => {
                        return Err(CatalogError::Spec(SpecError::InvalidValue {
                            path: data_type.to_string(),
                            key: "data_type_inc",
                            reason: format!("'{}' is a different kind of spec", base),
                        }));
                    }
                }
            }
            None => raw.as_ref().clone(),
        };
        let resolved = Arc::new(resolved);
        self.resolved.borrow_mut().insert(key, resolved.clone());
        Ok(resolved)
    }

    /// Canonical keys of a type and its bases, most derived first.
    pub fn hierarchy(&self, namespace: &str, data_type: &str) -> Result<Arc<[TypeKey]>, CatalogError> {
        let (dns, raw) = self
            .find(namespace, data_type)
            .ok_or_else(|| Self::not_found(namespace, data_type))?;
        let key = TypeKey::new(dns, data_type);
        if let Some(h) = self.hierarchies.borrow().get(&key) {
            return Ok(h.clone());
        }
        let mut chain = vec![key.clone()];
        if let Some(base) = raw.data_type_inc() {
            chain.extend(self.hierarchy(dns, base)?.iter().cloned());
        }
        let chain: Arc<[TypeKey]> = chain.into();
        self.hierarchies.borrow_mut().insert(key, chain.clone());
        Ok(chain)
    }

    /// Type names of `data_type` and its bases, most derived first.
    pub fn get_hierarchy(&self, namespace: &str, data_type: &str) -> Result<Vec<String>, CatalogError> {
        Ok(self
            .hierarchy(namespace, data_type)?
            .iter()
            .map(|k| k.data_type.clone())
            .collect())
    }

    /// True if `data_type` is `parent_type` or inherits from it.
    pub fn is_sub_data_type(&self, namespace: &str, data_type: &str, parent_type: &str) -> bool {
        self.hierarchy(namespace, data_type)
            .map(|h| h.iter().any(|k| k.data_type == parent_type))
            .unwrap_or(false)
    }

    /// Every registered type that inherits from `data_type` (itself excluded).
    pub fn subtypes(&self, namespace: &str, data_type: &str) -> Result<Vec<TypeKey>, CatalogError> {
        let base = self.canonical(namespace, data_type)?;
        let mut out = Vec::new();
        for ns in &self.order {
            let Some(loaded) = self.namespaces.get(ns) else {
                continue;
            };
            for t in &loaded.type_order {
                let h = self.hierarchy(ns, t)?;
                if h.len() > 1 && h[1..].contains(&base) {
                    out.push(TypeKey::new(ns, t));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::value::PlainValue;
    use crate::spec::types::Inheritance;
    use serde_json::json;

    fn core() -> Namespace {
        let specs = vec![
            TypeSpec::group_from_json(&json!({
                "data_type_def": "Base", "doc": "base",
                "attributes": [{"name": "unit", "dtype": "text", "doc": "u", "default_value": "m"}]
            }))
            .unwrap(),
            TypeSpec::group_from_json(&json!({
                "data_type_def": "Derived", "data_type_inc": "Base", "doc": "derived",
                "attributes": [{"name": "unit", "dtype": "text", "doc": "u", "default_value": "cm"}],
                "groups": [{"data_type_def": "Inner", "doc": "nested def", "quantity": "?"}]
            }))
            .unwrap(),
        ];
        Namespace::new("core", Some("1.0")).unwrap().specs("core.base", specs)
    }

    #[test]
    fn test_register_and_resolve_override() {
        let mut catalog = NamespaceCatalog::new();
        catalog.register(core()).unwrap();

        let derived = catalog.resolve("core", "Derived").unwrap();
        let unit = &derived.attributes()[0];
        assert_eq!(unit.default_value, Some(PlainValue::Text("cm".into())));
        assert_eq!(unit.inheritance, Inheritance::Overridden);
        assert_eq!(catalog.get_hierarchy("core", "Derived").unwrap(), vec!["Derived", "Base"]);
        assert!(catalog.is_sub_data_type("core", "Derived", "Base"));
        assert!(!catalog.is_sub_data_type("core", "Base", "Derived"));

        // nested definitions are registered as their own types
        assert_eq!(catalog.registered_types("core").unwrap(), vec!["Base", "Derived", "Inner"]);
        assert_eq!(catalog.source_of("core", "Inner"), Some("core.base"));

        // memoized: same allocation on the second lookup
        let again = catalog.resolve("core", "Derived").unwrap();
        assert!(Arc::ptr_eq(&derived, &again));
    }

    #[test]
    fn test_reregister_and_duplicates() {
        let mut catalog = NamespaceCatalog::new();
        catalog.register(core()).unwrap();
        catalog.register(core()).unwrap();

        let changed = core().doc("different");
        match catalog.register(changed) {
            Err(CatalogError::DuplicateNamespace { name, .. }) => assert_eq!(name, "core"),
            other => panic!("Expected DuplicateNamespace, got {:?}", other),
        }

        // another version is ignored, the loaded one stays
        let mut newer = core().doc("newer");
        newer.version = Some("2.0".into());
        catalog.register(newer).unwrap();
        assert_eq!(catalog.get_namespace("core").unwrap().version.as_deref(), Some("1.0"));
    }

    #[test]
    fn test_dependencies() {
        let mut catalog = NamespaceCatalog::new();
        let ext_spec = TypeSpec::group_from_json(&json!({
            "data_type_def": "Special", "data_type_inc": "Derived", "doc": "special"
        }))
        .unwrap();
        let ext = Namespace::new("ext", None)
            .unwrap()
            .include("core", None)
            .specs("ext.types", vec![ext_spec]);

        match catalog.register(ext.clone()) {
            Err(CatalogError::UnresolvedDependency { dependency, .. }) => assert_eq!(dependency, "core"),
            other => panic!("Expected UnresolvedDependency, got {:?}", other),
        }
        assert!(!catalog.has_namespace("ext"));

        catalog.register(core()).unwrap();
        catalog.register(ext).unwrap();

        assert_eq!(catalog.get_hierarchy("ext", "Special").unwrap(), vec!["Special", "Derived", "Base"]);
        assert_eq!(catalog.canonical("ext", "Base").unwrap(), TypeKey::new("core", "Base"));
        let special = catalog.resolve("ext", "Special").unwrap();
        assert_eq!(special.attributes()[0].inheritance, Inheritance::Inherited);
        let subs = catalog.subtypes("core", "Base").unwrap();
        assert_eq!(subs, vec![TypeKey::new("core", "Derived"), TypeKey::new("ext", "Special")]);
    }

    #[test]
    fn test_missing_type_fails_registration() {
        let mut catalog = NamespaceCatalog::new();
        let spec = TypeSpec::group_from_json(&json!({
            "data_type_def": "Orphan", "data_type_inc": "Nowhere", "doc": "x"
        }))
        .unwrap();
        let ns = Namespace::new("broken", None).unwrap().specs("b", vec![spec]);
        match catalog.register(ns) {
            Err(CatalogError::TypeDoesNotExist { data_type, .. }) => assert_eq!(data_type, "Nowhere"),
            other => panic!("Expected TypeDoesNotExist, got {:?}", other),
        }
        assert!(!catalog.has_namespace("broken"));
        assert!(matches!(
            catalog.resolve("broken", "Orphan"),
            Err(CatalogError::TypeDoesNotExist { .. })
        ));
    }

    #[test]
    fn test_restricted_include() {
        let mut catalog = NamespaceCatalog::new();
        catalog.register(core()).unwrap();
        let ns = Namespace::new("narrow", None)
            .unwrap()
            .include("core", Some(vec!["Derived".into()]));
        catalog.register(ns).unwrap();
        assert!(catalog.resolve("narrow", "Derived").is_ok());
        assert!(catalog.resolve("narrow", "Base").is_err());

        let bad = Namespace::new("bad", None)
            .unwrap()
            .include("core", Some(vec!["Missing".into()]));
        assert!(matches!(catalog.register(bad), Err(CatalogError::TypeDoesNotExist { .. })));
    }

    #[test]
    fn test_inheritance_cycle() {
        let mut catalog = NamespaceCatalog::new();
        let a = TypeSpec::group_from_json(&json!({"data_type_def": "A", "data_type_inc": "B", "doc": "a"})).unwrap();
        let b = TypeSpec::group_from_json(&json!({"data_type_def": "B", "data_type_inc": "A", "doc": "b"})).unwrap();
        let ns = Namespace::new("loop", None).unwrap().specs("l", vec![a, b]);
        assert!(matches!(catalog.register(ns), Err(CatalogError::InheritanceCycle { .. })));
    }
}
