//! In-memory backend.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::backend::StorageBackend;
use crate::backend::json::{JsonOptions, decode_document, decode_tree, encode_document, encode_tree};
use crate::error::BackendError;
use crate::model::builder::{BuilderId, Builders};

/// Named documents shared between backends. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    documents: Rc<RefCell<FxHashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.documents.borrow().get(name).cloned()
    }

    pub fn put(&self, name: &str, bytes: Vec<u8>) {
        self.documents.borrow_mut().insert(name.to_string(), bytes);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.documents.borrow().contains_key(name)
    }

    /// Stored document names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.documents.borrow().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Backend storing JSON documents in a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    store: MemoryStore,
    source: String,
    options: JsonOptions,
}

impl MemoryBackend {
    pub fn new(store: MemoryStore, source: &str, options: JsonOptions) -> Self {
        Self {
            store,
            source: source.to_string(),
            options,
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

impl StorageBackend for MemoryBackend {
    fn source(&self) -> &str {
        &self.source
    }

    fn write_builder(&mut self, builders: &Builders, root: BuilderId) -> Result<(), BackendError> {
        let doc = encode_tree(builders, root, &self.source)?;
        let bytes = encode_document(&doc, &self.options, &self.source)?;
        debug!(source = %self.source, bytes = bytes.len(), "stored document");
        self.store.put(&self.source, bytes);
        Ok(())
    }

    fn read_builder(&mut self, builders: &mut Builders) -> Result<BuilderId, BackendError> {
        let bytes = self.store.get(&self.source).ok_or_else(|| BackendError::Empty {
            source_name: self.source.clone(),
        })?;
        let doc = decode_document(&bytes, &self.source)?;
        decode_tree(builders, doc, &self.source)
    }
}
