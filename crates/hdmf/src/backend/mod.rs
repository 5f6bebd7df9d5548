//! Storage backends.
//!
//! A backend stores one builder tree per source. [`HdmfIo`] pairs a backend
//! with a [`BuildManager`](crate::build::BuildManager) to write and read
//! container graphs.

pub mod file;
pub mod io;
pub mod json;
pub mod memory;

pub use file::JsonFileBackend;
pub use io::HdmfIo;
pub use json::{Document, JsonOptions, decode_document, decode_tree, encode_document, encode_tree};
pub use memory::{MemoryBackend, MemoryStore};

use crate::error::BackendError;
use crate::model::builder::{BuilderId, Builders};

/// Persistent storage for builder trees.
pub trait StorageBackend {
    /// Name of the source this backend reads and writes.
    fn source(&self) -> &str;

    /// Stores the tree under `root`, replacing whatever the source held.
    fn write_builder(&mut self, builders: &Builders, root: BuilderId) -> Result<(), BackendError>;

    /// Loads the stored tree into `builders` and returns its root.
    fn read_builder(&mut self, builders: &mut Builders) -> Result<BuilderId, BackendError>;
}
