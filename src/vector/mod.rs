mod collection;

pub use collection::{BatchOutcome, Collection, CollectionStats, Hit, VectorPayload};

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use crate::{
    state::{AppError, AppResult},
    store::Modality,
};

/// The set of per-modality collections under `data/vectors/`. Collections
/// are opened at startup with the dimension the loaded model advertises
/// and are addressed by modality from then on.
pub struct VectorStore {
    root: PathBuf,
    collections: RwLock<HashMap<Modality, Arc<Collection>>>,
}

impl VectorStore {
    pub fn open(root: &Path) -> AppResult<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            collections: RwLock::new(HashMap::new()),
        })
    }

    pub fn open_collection(&self, modality: Modality, dim: usize) -> AppResult<Arc<Collection>> {
        let mut collections = self.collections.write().expect("vector store lock poisoned");
        if let Some(existing) = collections.get(&modality) {
            if existing.dimension() != dim {
                return Err(AppError::Integrity(format!(
                    "collection {} already open with dimension {}, requested {}",
                    modality.name(),
                    existing.dimension(),
                    dim
                )));
            }
            return Ok(existing.clone());
        }

        let collection = Arc::new(Collection::open(
            &self.root.join(modality.name()),
            modality,
            dim,
        )?);
        collections.insert(modality, collection.clone());
        Ok(collection)
    }

    pub fn collection(&self, modality: Modality) -> AppResult<Arc<Collection>> {
        self.collections
            .read()
            .expect("vector store lock poisoned")
            .get(&modality)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("vector collection {}", modality.name())))
    }

    pub fn is_open(&self, modality: Modality) -> bool {
        self.collections
            .read()
            .expect("vector store lock poisoned")
            .contains_key(&modality)
    }

    pub fn open_collections(&self) -> Vec<Arc<Collection>> {
        self.collections
            .read()
            .expect("vector store lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Final snapshot flush, part of ordered teardown.
    pub fn flush_all(&self) -> AppResult<()> {
        for collection in self.open_collections() {
            collection.save()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> Vec<(Modality, CollectionStats)> {
        self.open_collections()
            .into_iter()
            .map(|c| (c.modality(), c.stats()))
            .collect()
    }
}
