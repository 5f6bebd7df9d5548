//! Declarative type specifications and the namespace catalog.

pub mod catalog;
pub mod namespace;
pub mod types;

pub use catalog::{NamespaceCatalog, TypeKey};
pub use namespace::{Namespace, SchemaEntry};
pub use types::{
    AttributeSpec, DatasetSpec, GroupSpec, Inheritance, LinkSpec, Quantity, ShapeSpec, SpecKind, SpecRef, TypeSpec,
    parse_dtype, parse_spec_source,
};
