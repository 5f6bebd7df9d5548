//! Type map: data type to container class and object mapper.
//!
//! Classes are produced on first request. A registered [`ClassDef`] supplies
//! the kind and the validator; without one the class is generated from the
//! spec. Either way its fields come from the type's [`ObjectMapper`], and
//! its base class is the class of the parent type.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::build::convert::ConversionPolicy;
use crate::build::mapper::{CustomMapper, ObjectMapper};
use crate::error::{CatalogError, Result, TypeMapError};
use crate::model::class::{ClassDef, ClassKind, ContainerClass};
use crate::spec::{Namespace, NamespaceCatalog, SpecKind, TypeKey};

/// Registry of container classes and object mappers over a namespace catalog.
pub struct TypeMap {
    catalog: NamespaceCatalog,
    policy: ConversionPolicy,
    defs: FxHashMap<TypeKey, ClassDef>,
    custom: FxHashMap<TypeKey, Rc<dyn CustomMapper>>,
    classes: RefCell<FxHashMap<TypeKey, Arc<ContainerClass>>>,
    mappers: RefCell<FxHashMap<TypeKey, Rc<ObjectMapper>>>,
}

impl std::fmt::Debug for TypeMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeMap")
            .field("namespaces", &self.catalog.namespaces().collect::<Vec<_>>())
            .field("classes", &self.classes.borrow().len())
            .field("custom_mappers", &self.custom.len())
            .finish()
    }
}

impl TypeMap {
    pub fn new(catalog: NamespaceCatalog) -> Self {
        Self {
            catalog,
            policy: ConversionPolicy::default(),
            defs: FxHashMap::default(),
            custom: FxHashMap::default(),
            classes: RefCell::new(FxHashMap::default()),
            mappers: RefCell::new(FxHashMap::default()),
        }
    }

    pub fn with_policy(mut self, policy: ConversionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn set_policy(&mut self, policy: ConversionPolicy) {
        self.policy = policy;
    }

    pub fn policy(&self) -> &ConversionPolicy {
        &self.policy
    }

    pub fn catalog(&self) -> &NamespaceCatalog {
        &self.catalog
    }

    /// Registers a namespace with the underlying catalog.
    pub fn register_namespace(&mut self, namespace: Namespace) -> Result<()> {
        self.catalog.register(namespace)?;
        Ok(())
    }

    /// Registers a class definition for `data_type` in `namespace`.
    ///
    /// The class kind has to agree with the spec kind (groups map to
    /// container classes, datasets to data classes), and the type must not
    /// have been materialized yet.
    pub fn register_container_type(&mut self, namespace: &str, data_type: &str, def: ClassDef) -> Result<()> {
        let key = self.catalog.canonical(namespace, data_type)?;
        let spec_kind = self.catalog.raw_spec(&key.namespace, &key.data_type)?.kind();
        let expected = match spec_kind {
            SpecKind::Dataset => ClassKind::Data,
            _ => ClassKind::Container,
        };
        if def.kind() != expected {
            return Err(TypeMapError::KindMismatch {
                data_type: key.data_type,
                spec_kind: spec_kind.name(),
                class_kind: def.kind().name(),
            }
            .into());
        }
        if self.classes.borrow().contains_key(&key) {
            return Err(TypeMapError::AlreadyMaterialized { data_type: key.data_type }.into());
        }
        debug!(data_type = %key, kind = def.kind().name(), "registered container class");
        self.defs.insert(key, def);
        Ok(())
    }

    /// Same as [`register_container_type`](Self::register_container_type)
    /// with the arguments in class-first order.
    pub fn register_class(&mut self, data_type: &str, namespace: &str, def: ClassDef) -> Result<()> {
        self.register_container_type(namespace, data_type, def)
    }

    /// Registers a custom mapper for `data_type` and its subtypes.
    ///
    /// Fails once any class or mapper depending on the type was produced.
    pub fn register_map<M>(&mut self, namespace: &str, data_type: &str, mapper: M) -> Result<()>
    where
        M: CustomMapper + 'static,
    {
        let key = self.catalog.canonical(namespace, data_type)?;
        let in_use = self.classes.borrow().values().any(|c| c.ancestry().any(|a| *a.key() == key))
            || self.mappers.borrow().keys().any(|k| {
                self.catalog
                    .hierarchy(&k.namespace, &k.data_type)
                    .is_ok_and(|h| h.contains(&key))
            });
        if in_use {
            return Err(TypeMapError::AlreadyMaterialized { data_type: key.data_type }.into());
        }
        debug!(data_type = %key, "registered custom mapper");
        self.custom.insert(key, Rc::new(mapper));
        Ok(())
    }

    /// Container class of `data_type`, produced on first use.
    pub fn get_class(&self, data_type: &str, namespace: &str) -> Result<Arc<ContainerClass>> {
        let key = self.catalog.canonical(namespace, data_type)?;
        self.class_for_key(&key)
    }

    /// Same as [`get_class`](Self::get_class) with namespace-first arguments.
    pub fn get_container_cls(&self, namespace: &str, data_type: &str) -> Result<Arc<ContainerClass>> {
        self.get_class(data_type, namespace)
    }

    fn class_for_key(&self, key: &TypeKey) -> Result<Arc<ContainerClass>> {
        if let Some(class) = self.classes.borrow().get(key) {
            return Ok(class.clone());
        }
        let hierarchy = self.catalog.hierarchy(&key.namespace, &key.data_type)?;
        let base = match hierarchy.get(1) {
            Some(parent) => Some(self.class_for_key(parent)?),
            None => None,
        };
        let mapper = self.mapper_for_key(key)?;
        let def = self.defs.get(key);
        let kind = match def {
            Some(def) => def.kind(),
            None => match mapper.spec().kind() {
                SpecKind::Dataset => ClassKind::Data,
                _ => ClassKind::Container,
            },
        };
        let class = Arc::new(ContainerClass::new(
            key.clone(),
            kind,
            base,
            mapper.descriptors(),
            def.is_none(),
            def.and_then(|d| d.validator().cloned()),
        ));
        debug!(data_type = %key, generated = def.is_none(), "materialized container class");
        self.classes.borrow_mut().insert(key.clone(), class.clone());
        Ok(class)
    }

    fn mapper_for_key(&self, key: &TypeKey) -> Result<Rc<ObjectMapper>> {
        if let Some(mapper) = self.mappers.borrow().get(key) {
            return Ok(mapper.clone());
        }
        let spec = self.catalog.resolve(&key.namespace, &key.data_type)?;
        let hierarchy = self.catalog.hierarchy(&key.namespace, &key.data_type)?;
        let custom = hierarchy.iter().find_map(|k| self.custom.get(k).cloned());
        let mapper = Rc::new(ObjectMapper::new(key.clone(), spec, custom));
        self.mappers.borrow_mut().insert(key.clone(), mapper.clone());
        Ok(mapper)
    }

    /// Object mapper of a container class.
    pub fn get_map(&self, class: &ContainerClass) -> Result<Rc<ObjectMapper>> {
        self.mapper_for_key(class.key())
    }

    /// Object mapper of `data_type` in `namespace`.
    pub fn get_map_for(&self, namespace: &str, data_type: &str) -> Result<Rc<ObjectMapper>> {
        let key = self.catalog.canonical(namespace, data_type)?;
        self.mapper_for_key(&key)
    }

    /// Finds the namespace of `data_type` when a builder does not record it:
    /// the first registered namespace that knows the type.
    pub(crate) fn find_namespace(&self, data_type: &str) -> std::result::Result<TypeKey, CatalogError> {
        self.catalog
            .namespaces()
            .find_map(|ns| self.catalog.canonical(ns, data_type).ok())
            .ok_or_else(|| CatalogError::TypeDoesNotExist {
                namespace: "*".to_string(),
                data_type: data_type.to_string(),
            })
    }
}
