//! Container classes: table-driven descriptions of a data type's fields.
//!
//! A [`ContainerClass`] is the runtime stand-in for a domain class. The type
//! map generates one per data type, either from a user [`ClassDef`] or
//! automatically, with one [`FieldDescriptor`] per mapped spec element.

use std::fmt;
use std::sync::Arc;

use crate::model::container::Container;
use crate::model::value::{DType, PlainValue};
use crate::spec::TypeKey;

/// Whether containers of a class own children or carry a data payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassKind {
    /// Group-like container.
    Container,
    /// Dataset-like container holding `data`.
    Data,
}

impl ClassKind {
    pub fn name(self) -> &'static str {
        match self {
            ClassKind::Container => "Container",
            ClassKind::Data => "Data",
        }
    }
}

/// What a field holds.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// A value stored as a builder attribute.
    Attribute { dtype: DType },
    /// A value (or ragged column) stored as an untyped dataset.
    Dataset { dtype: Option<DType> },
    /// Owned sub-container(s) of the given type.
    Child { data_type: String, many: bool },
    /// Linked container(s) of the given type, not owned.
    Link { target_type: String, many: bool },
}

impl FieldKind {
    /// True for fields holding a sequence of containers.
    pub fn is_many(&self) -> bool {
        match self {
            FieldKind::Child { many, .. } | FieldKind::Link { many, .. } => *many,
            FieldKind::Attribute { .. } | FieldKind::Dataset { .. } => false,
        }
    }

    /// Data type required of the containers in this field, if it holds containers.
    pub fn container_type(&self) -> Option<&str> {
        match self {
            FieldKind::Child { data_type, .. } => Some(data_type),
            FieldKind::Link { target_type, .. } => Some(target_type),
            FieldKind::Attribute { .. } | FieldKind::Dataset { .. } => None,
        }
    }
}

/// One named field of a class.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub doc: String,
    pub required: bool,
    pub kind: FieldKind,
    /// Declared by a base type.
    pub inherited: bool,
    /// Value filled in when a container is created without this field.
    pub default: Option<PlainValue>,
}

/// Hook run when a container is created by user code.
pub type Validator = Arc<dyn Fn(&Container) -> Result<(), String>>;

/// A user-supplied class registered for a data type.
#[derive(Clone)]
pub struct ClassDef {
    kind: ClassKind,
    validator: Option<Validator>,
}

impl ClassDef {
    /// A group-like class.
    pub fn container() -> Self {
        Self {
            kind: ClassKind::Container,
            validator: None,
        }
    }

    /// A dataset-like class.
    pub fn data() -> Self {
        Self {
            kind: ClassKind::Data,
            validator: None,
        }
    }

    /// Adds a check run on every container created through [`Containers::create`].
    ///
    /// It is not run when containers are read back from storage.
    ///
    /// [`Containers::create`]: crate::model::container::Containers::create
    pub fn with_validator<F>(mut self, f: F) -> Self
    where
        F: Fn(&Container) -> Result<(), String> + 'static,
    {
        self.validator = Some(Arc::new(f));
        self
    }

    pub fn kind(&self) -> ClassKind {
        self.kind
    }

    pub(crate) fn validator(&self) -> Option<&Validator> {
        self.validator.as_ref()
    }
}

impl fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDef")
            .field("kind", &self.kind)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

/// Runtime class of a container.
pub struct ContainerClass {
    key: TypeKey,
    kind: ClassKind,
    base: Option<Arc<ContainerClass>>,
    fields: Vec<FieldDescriptor>,
    generated: bool,
    validator: Option<Validator>,
}

impl ContainerClass {
    pub(crate) fn new(
        key: TypeKey,
        kind: ClassKind,
        base: Option<Arc<ContainerClass>>,
        fields: Vec<FieldDescriptor>,
        generated: bool,
        validator: Option<Validator>,
    ) -> Self {
        Self {
            key,
            kind,
            base,
            fields,
            generated,
            validator,
        }
    }

    pub fn key(&self) -> &TypeKey {
        &self.key
    }

    pub fn data_type(&self) -> &str {
        &self.key.data_type
    }

    pub fn namespace(&self) -> &str {
        &self.key.namespace
    }

    pub fn kind(&self) -> ClassKind {
        self.kind
    }

    pub fn base(&self) -> Option<&Arc<ContainerClass>> {
        self.base.as_ref()
    }

    /// All fields, inherited ones included.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// True if the class was generated rather than registered by the user.
    pub fn is_generated(&self) -> bool {
        self.generated
    }

    /// This class followed by its bases.
    pub fn ancestry(&self) -> impl Iterator<Item = &ContainerClass> {
        std::iter::successors(Some(self), |c| c.base.as_deref())
    }

    /// True if this class is `data_type` or inherits from it.
    pub fn is_a(&self, data_type: &str) -> bool {
        self.ancestry().any(|c| c.data_type() == data_type)
    }

    pub(crate) fn validators(&self) -> impl Iterator<Item = &Validator> {
        self.ancestry().filter_map(|c| c.validator.as_ref())
    }
}

impl fmt::Debug for ContainerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerClass")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("base", &self.base.as_ref().map(|b| b.key.clone()))
            .field("fields", &self.fields)
            .field("generated", &self.generated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::value::Primitive;

    #[test]
    fn test_ancestry() {
        let base = Arc::new(ContainerClass::new(
            TypeKey::new("core", "Base"),
            ClassKind::Container,
            None,
            vec![FieldDescriptor {
                name: "unit".into(),
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
        let derived = ContainerClass::new(
            TypeKey::new("ext", "Derived"),
            ClassKind::Container,
            Some(base.clone()),
            base.fields().to_vec(),
            false,
            Some(Arc::new(|_: &Container| Ok::<(), String>(()))),
        );
        assert!(derived.is_a("Base"));
        assert!(derived.is_a("Derived"));
        assert!(!base.is_a("Derived"));
        assert_eq!(derived.ancestry().count(), 2);
        assert_eq!(derived.validators().count(), 1);
        assert!(derived.field("unit").is_some());
        assert!(!FieldKind::Child { data_type: "X".into(), many: false }.is_many());
    }
}
