//! HDMF: spec-driven hierarchical data modeling.
//!
//! This crate translates between in-memory domain objects (containers) and a
//! storage-agnostic tree of groups, datasets, attributes and links
//! (builders), driven by declarative type specifications organized in
//! versioned namespaces.
//!
//! # Overview
//!
//! - **Specs** describe the layout of every data type: attributes, datasets,
//!   sub-groups and links, with dtype, shape and quantity constraints
//! - **Namespaces** group specs and declare dependencies on other namespaces
//! - **Containers** are the in-memory objects, with single-parent ownership
//! - **Builders** are the on-storage tree handed to a backend
//!
//! # Quick Start
//!
//! ```rust
//! use hdmf::{
//!     BuildManager, Containers, FieldValue, HdmfIo, JsonOptions, MemoryBackend, MemoryStore, Namespace,
//!     NamespaceCatalog, TypeMap, TypeSpec,
//! };
//! use serde_json::json;
//!
//! let spec = TypeSpec::group_from_json(&json!({
//!     "data_type_def": "Shelf", "doc": "a shelf",
//!     "attributes": [{"name": "label", "dtype": "text", "doc": "shelf label"}]
//! }))
//! .unwrap();
//! let mut catalog = NamespaceCatalog::new();
//! catalog
//!     .register(Namespace::new("library", Some("1.0")).unwrap().specs("library.json", vec![spec]))
//!     .unwrap();
//! let type_map = TypeMap::new(catalog);
//!
//! // Classes are generated from the spec
//! let class = type_map.get_class("Shelf", "library").unwrap();
//! let mut containers = Containers::new();
//! let shelf = containers
//!     .create(&class, "shelf", vec![("label", FieldValue::value("fiction"))])
//!     .unwrap();
//!
//! let store = MemoryStore::new();
//! let mut io = HdmfIo::new(MemoryBackend::new(store, "shelf.json", JsonOptions::default()));
//! let mut manager = BuildManager::new(&type_map);
//! io.write(&mut manager, &mut containers, shelf).unwrap();
//!
//! // Read it back with a fresh manager
//! let mut manager = BuildManager::new(&type_map);
//! let mut read = Containers::new();
//! let copy = io.read(&mut manager, &mut read).unwrap();
//! assert_eq!(
//!     read.get(copy).unwrap().field("label"),
//!     Some(&FieldValue::value("fiction"))
//! );
//! ```
//!
//! # Modules
//!
//! - [`spec`]: Specs, namespaces and the namespace catalog
//! - [`model`]: Values, builders, container classes and containers
//! - [`build`]: Type map, object mappers and the build manager
//! - [`backend`]: Storage backends (JSON, in-memory, file) and [`HdmfIo`]
//! - [`validate`]: Builder tree validation against specs
//! - [`config`]: Options loaded from JSON
//! - [`error`]: Error types
//! - [`limits`]: Fixed limits and format constants
//!
//! # Storage Format
//!
//! The reference backend stores one JSON document per source:
//! - Uncompressed: a plain JSON document
//! - Compressed: `HDMFZ` magic + uncompressed size + zstd data
//!
//! Both forms are detected automatically on read.

pub mod backend;
pub mod build;
pub mod config;
pub mod error;
pub mod limits;
pub mod model;
pub mod spec;
pub mod util;
pub mod validate;

// Re-export commonly used types at crate root
pub use backend::{HdmfIo, JsonFileBackend, JsonOptions, MemoryBackend, MemoryStore, StorageBackend};
pub use build::{BuildManager, ConversionPolicy, CustomMapper, FieldMapping, ObjectMapper, TypeMap};
pub use config::Config;
pub use error::{Error, ErrorKind, Result, ValidationError};
pub use model::{
    BuilderId, Builders, ClassDef, ClassKind, ContainerClass, ContainerId, ContainerValue, Containers, DType,
    FieldValue, LinkTarget, Primitive, RaggedColumn, Value,
};
pub use spec::{Namespace, NamespaceCatalog, Quantity, TypeKey, TypeSpec};
pub use validate::validate_tree;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
