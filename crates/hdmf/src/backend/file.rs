//! JSON documents on disk.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::backend::StorageBackend;
use crate::backend::json::{JsonOptions, decode_document, decode_tree, encode_document, encode_tree};
use crate::error::BackendError;
use crate::model::builder::{BuilderId, Builders};

/// Backend storing one JSON document in a file. The source name is the path.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
    source: String,
    options: JsonOptions,
}

impl JsonFileBackend {
    pub fn new(path: impl AsRef<Path>, options: JsonOptions) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            source: path.display().to_string(),
            path,
            options,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, err: std::io::Error) -> BackendError {
        BackendError::Io {
            source_name: self.source.clone(),
            message: err.to_string(),
        }
    }
}

impl StorageBackend for JsonFileBackend {
    fn source(&self) -> &str {
        &self.source
    }

    fn write_builder(&mut self, builders: &Builders, root: BuilderId) -> Result<(), BackendError> {
        let doc = encode_tree(builders, root, &self.source)?;
        let bytes = encode_document(&doc, &self.options, &self.source)?;
        fs::write(&self.path, &bytes).map_err(|e| self.io_error(e))?;
        debug!(path = %self.source, bytes = bytes.len(), "wrote document");
        Ok(())
    }

    fn read_builder(&mut self, builders: &mut Builders) -> Result<BuilderId, BackendError> {
        let bytes = fs::read(&self.path).map_err(|e| self.io_error(e))?;
        if bytes.is_empty() {
            return Err(BackendError::Empty {
                source_name: self.source.clone(),
            });
        }
        let doc = decode_document(&bytes, &self.source)?;
        decode_tree(builders, doc, &self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_round_trip() {
        let dir = std::env::temp_dir().join(format!("hdmf-file-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tree.json");

        let mut builders = Builders::new();
        let root = builders
            .group("root", |g| g.dataset("values", vec![1.5f64, 2.5], |d| d))
            .unwrap();
        let mut backend = JsonFileBackend::new(&path, JsonOptions::compressed());
        backend.write_builder(&builders, root).unwrap();

        let mut other = Builders::new();
        let back = backend.read_builder(&mut other).unwrap();
        let values = other.child(back, "values").unwrap();
        assert_eq!(other.node(values).data().map(|v| v.shape()), Some(vec![2]));

        fs::write(&path, b"").unwrap();
        assert!(matches!(backend.read_builder(&mut other), Err(BackendError::Empty { .. })));
        let _ = fs::remove_dir_all(&dir);

        let mut missing = JsonFileBackend::new(dir.join("nope.json"), JsonOptions::default());
        assert!(matches!(missing.read_builder(&mut other), Err(BackendError::Io { .. })));
    }
}
