//! Data model types.
//!
//! - Values and dtypes carried by attributes and datasets
//! - Object identifiers
//! - Ragged (one-to-many) columns
//! - Builders (the storage-agnostic tree)
//! - Container classes and containers (the in-memory objects)

pub mod builder;
pub mod class;
pub mod container;
pub mod id;
pub mod index;
pub mod value;

pub use builder::{
    BuilderId, BuilderNode, BuilderValue, Builders, DatasetScope, GroupScope, LinkTarget, NAMESPACE_ATTR, NodeKind,
    OBJECT_ID_ATTR, TYPE_ATTR,
};
pub use class::{ClassDef, ClassKind, ContainerClass, FieldDescriptor, FieldKind, Validator};
pub use container::{Container, ContainerId, ContainerValue, Containers, FieldValue};
pub use id::{ObjectId, format_object_id, new_object_id, parse_object_id};
pub use index::{RaggedColumn, decode_offsets, index_primitive_for};
pub use value::{CompoundField, DType, PlainValue, Primitive, PrimitiveClass, RefKind, Region, Timestamp, Value};
