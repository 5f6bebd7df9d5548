//! Translation between containers and builders.
//!
//! - [`convert`]: dtype conversion rules and shape checks
//! - [`type_map`]: data type to class and mapper registry
//! - [`mapper`]: per-type field mapping and the two translation walks
//! - [`manager`]: memo, reference resolution and export

pub mod convert;
pub mod manager;
pub mod mapper;
pub mod type_map;

pub use convert::{ConversionPolicy, check_shape, default_rule};
pub use manager::BuildManager;
pub use mapper::{CustomMapper, FieldMapping, ObjectMapper, snake_case};
pub use type_map::TypeMap;
