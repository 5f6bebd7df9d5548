//! Reading and writing container graphs through a backend.

use tracing::{debug, info_span};

use crate::backend::StorageBackend;
use crate::build::manager::BuildManager;
use crate::error::{BackendError, Result};
use crate::model::builder::{BuilderId, Builders};
use crate::model::container::{ContainerId, Containers};

/// A storage backend driven through a build manager.
#[derive(Debug)]
pub struct HdmfIo<B> {
    backend: B,
}

impl<B: StorageBackend> HdmfIo<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_inner(self) -> B {
        self.backend
    }

    pub fn source(&self) -> &str {
        self.backend.source()
    }

    /// Builds `root` for this source and stores it.
    ///
    /// The written containers are marked clean, so writing again without
    /// changes reuses every builder.
    pub fn write(&mut self, mgr: &mut BuildManager<'_>, cs: &mut Containers, root: ContainerId) -> Result<BuilderId> {
        let source = self.backend.source().to_string();
        let _span = info_span!("write", source = %source).entered();
        let builder = mgr.build(cs, root, Some(&source))?;
        self.backend.write_builder(mgr.builders(), builder)?;
        cs.mark_clean(root);
        debug!(builders = mgr.builders().len(), "write finished");
        Ok(builder)
    }

    /// Loads the stored tree into the manager's arena without constructing it.
    ///
    /// Read every source a tree links into this way before constructing it.
    pub fn read_builder(&mut self, mgr: &mut BuildManager<'_>) -> Result<BuilderId> {
        let root = self.backend.read_builder(mgr.builders_mut())?;
        if mgr.builders().is_empty_node(root) {
            return Err(BackendError::Empty {
                source_name: self.backend.source().to_string(),
            }
            .into());
        }
        Ok(root)
    }

    /// Reads the stored tree and constructs its containers.
    pub fn read(&mut self, mgr: &mut BuildManager<'_>, cs: &mut Containers) -> Result<ContainerId> {
        let _span = info_span!("read", source = %self.backend.source()).entered();
        let root = self.read_builder(mgr)?;
        mgr.construct(cs, root)
    }

    /// Writes the contents of `src` into this source.
    ///
    /// Without a container the stored tree of `src` is copied as is. With
    /// one, which must be the root of a graph read through `mgr`, the graph
    /// is rebuilt for this source: unchanged parts reuse the builders read
    /// from `src`, changed parts are rebuilt. Neither `src` nor the
    /// containers are modified.
    pub fn export<S: StorageBackend>(
        &mut self,
        src: &mut HdmfIo<S>,
        mgr: &BuildManager<'_>,
        cs: &mut Containers,
        container: Option<ContainerId>,
    ) -> Result<BuilderId> {
        let destination = self.backend.source().to_string();
        let _span = info_span!("export", from = %src.source(), to = %destination).entered();
        match container {
            None => {
                let mut builders = Builders::new();
                let root = src.backend.read_builder(&mut builders)?;
                builders.restamp_source(root, &destination);
                self.backend.write_builder(&builders, root)?;
                Ok(root)
            }
            Some(root) => {
                let (exported, builder) = BuildManager::export(mgr, cs, root, &destination)?;
                self.backend.write_builder(exported.builders(), builder)?;
                Ok(builder)
            }
        }
    }
}
