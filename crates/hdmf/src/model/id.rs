//! Object identifiers.
//!
//! Every container carries a UUID object id that is written to its builder
//! as the `object_id` attribute and restored when the container is read back.

use uuid::Uuid;

/// Globally unique identifier of a container.
pub type ObjectId = Uuid;

/// Generates a fresh random (version 4) object id.
pub fn new_object_id() -> ObjectId {
    Uuid::new_v4()
}

/// Formats an object id in the hyphenated lowercase form used on disk.
pub fn format_object_id(id: &ObjectId) -> String {
    id.hyphenated().to_string()
}

/// Parses an object id, accepting hyphenated or simple hex forms.
pub fn parse_object_id(s: &str) -> Option<ObjectId> {
    Uuid::parse_str(s).ok()
}
