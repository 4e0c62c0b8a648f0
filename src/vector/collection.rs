use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::RwLock,
};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    state::{AppError, AppResult},
    store::{Digest, Modality, SegmentKind},
    utils::now_secs,
};

/// Payload carried next to every vector; enough to filter hits without a
/// metadata-store roundtrip. The segment reference is the span index
/// within the file (the vector is written before the segment row exists);
/// the metadata binding holds the authoritative row id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPayload {
    pub digest: Digest,
    pub file_id: i64,
    pub segment: Option<(SegmentKind, i64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: i64,
    pub vector: Vec<f32>,
    pub payload: VectorPayload,
    pub created: u64,
}

#[derive(Debug, Clone)]
pub struct Hit {
    pub id: i64,
    pub score: f32,
    pub payload: VectorPayload,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub written: usize,
    pub failed: Vec<(i64, String)>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CollectionStats {
    pub vectors: usize,
    pub dimension: usize,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    modality: Modality,
    dim: usize,
    next_id: i64,
    records: Vec<VectorRecord>,
}

struct Inner {
    next_id: i64,
    records: Vec<VectorRecord>,
    by_id: HashMap<i64, usize>,
}

/// One logical collection: all vectors of a modality, sharing one
/// dimension. The full set lives in memory and is snapshotted to disk with
/// MessagePack on every mutation batch; reads work against a consistent
/// in-memory state under the lock.
pub struct Collection {
    modality: Modality,
    dim: usize,
    path: PathBuf,
    inner: RwLock<Inner>,
}

impl Collection {
    /// Loads the persisted snapshot or starts empty. The stored dimension
    /// is authoritative: opening with a different model dimension fails
    /// instead of silently mixing spaces.
    pub fn open(dir: &Path, modality: Modality, dim: usize) -> AppResult<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("vectors.bin");

        let inner = match std::fs::read(&path) {
            Ok(bytes) => {
                let snapshot: Snapshot = rmp_serde::from_slice(&bytes).map_err(|e| {
                    AppError::Integrity(format!(
                        "corrupt vector snapshot for {}: {e}",
                        modality.name()
                    ))
                })?;
                if snapshot.dim != dim {
                    return Err(AppError::Integrity(format!(
                        "collection {} holds {}-dimensional vectors, model produces {}",
                        modality.name(),
                        snapshot.dim,
                        dim
                    )));
                }
                let by_id = snapshot
                    .records
                    .iter()
                    .enumerate()
                    .map(|(i, r)| (r.id, i))
                    .collect();
                info!(
                    "Opened vector collection {} with {} vectors",
                    modality.name(),
                    snapshot.records.len()
                );
                Inner {
                    next_id: snapshot.next_id,
                    records: snapshot.records,
                    by_id,
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Inner {
                next_id: 1,
                records: Vec::new(),
                by_id: HashMap::new(),
            },
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            modality,
            dim,
            path,
            inner: RwLock::new(inner),
        })
    }

    pub fn modality(&self) -> Modality {
        self.modality
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    /// Hands out the next vector id. The id becomes durable together with
    /// the vector itself; an id that never got its vector is simply reused
    /// after a restart, which is harmless because its binding was never
    /// written either.
    pub fn allocate_id(&self) -> i64 {
        let mut inner = self.inner.write().expect("vector collection lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        id
    }

    /// Idempotent on id: an existing record is replaced. Vectors are
    /// L2-normalized on the way in so search reduces to a dot product.
    pub fn upsert(&self, batch: Vec<(i64, Vec<f32>, VectorPayload)>) -> AppResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        {
            let mut inner = self.inner.write().expect("vector collection lock poisoned");
            for (id, mut vector, payload) in batch {
                if vector.len() != self.dim {
                    outcome.failed.push((
                        id,
                        format!("dimension {} does not match collection {}", vector.len(), self.dim),
                    ));
                    continue;
                }
                normalize(&mut vector);
                let record = VectorRecord {
                    id,
                    vector,
                    payload,
                    created: now_secs(),
                };
                match inner.by_id.get(&id).copied() {
                    Some(index) => inner.records[index] = record,
                    None => {
                        let index = inner.records.len();
                        inner.by_id.insert(id, index);
                        inner.records.push(record);
                    }
                }
                outcome.written += 1;
            }
        }
        self.save()?;
        Ok(outcome)
    }

    pub fn delete(&self, ids: &[i64]) -> AppResult<usize> {
        let removed = {
            let mut inner = self.inner.write().expect("vector collection lock poisoned");
            let mut removed = 0;
            for id in ids {
                if let Some(index) = inner.by_id.remove(id) {
                    inner.records.swap_remove(index);
                    let moved_id = inner.records.get(index).map(|r| r.id);
                    if let Some(moved_id) = moved_id {
                        inner.by_id.insert(moved_id, index);
                    }
                    removed += 1;
                }
            }
            removed
        };
        if removed > 0 {
            self.save()?;
        }
        Ok(removed)
    }

    /// Cosine top-k over the whole collection. Scores are normalized into
    /// [0, 1]. The read lock pins a consistent snapshot for the scan; a
    /// search never observes a half-applied batch.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&(dyn Fn(&VectorPayload) -> bool + Sync)>,
    ) -> AppResult<Vec<Hit>> {
        if query.len() != self.dim {
            return Err(AppError::Integrity(format!(
                "query dimension {} does not match collection {} ({})",
                query.len(),
                self.modality.name(),
                self.dim
            )));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut query = query.to_vec();
        normalize(&mut query);

        let inner = self.inner.read().expect("vector collection lock poisoned");
        let mut scored: Vec<Hit> = inner
            .records
            .par_iter()
            .filter(|record| filter.map_or(true, |f| f(&record.payload)))
            .map(|record| Hit {
                id: record.id,
                score: (dot(&record.vector, &query) + 1.0) / 2.0,
                payload: record.payload.clone(),
            })
            .collect();
        drop(inner);

        scored.sort_unstable_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        scored.truncate(k);
        for hit in &mut scored {
            hit.score = hit.score.clamp(0.0, 1.0);
        }
        Ok(scored)
    }

    /// Id and creation time of every vector, for the orphan sweeper.
    pub fn list_created(&self) -> Vec<(i64, u64)> {
        let inner = self.inner.read().expect("vector collection lock poisoned");
        inner.records.iter().map(|r| (r.id, r.created)).collect()
    }

    pub fn contains(&self, id: i64) -> bool {
        let inner = self.inner.read().expect("vector collection lock poisoned");
        inner.by_id.contains_key(&id)
    }

    pub fn stats(&self) -> CollectionStats {
        let inner = self.inner.read().expect("vector collection lock poisoned");
        CollectionStats {
            vectors: inner.records.len(),
            dimension: self.dim,
        }
    }

    /// Rewrites the snapshot; also the explicit `compact` surface.
    pub fn save(&self) -> AppResult<()> {
        let bytes = {
            let inner = self.inner.read().expect("vector collection lock poisoned");
            let snapshot = Snapshot {
                modality: self.modality,
                dim: self.dim,
                next_id: inner.next_id,
                records: inner.records.clone(),
            };
            rmp_serde::to_vec(&snapshot)
                .map_err(|e| AppError::Integrity(format!("vector snapshot encode failed: {e}")))?
        };

        let temp = self.path.with_extension("bin.tmp");
        std::fs::write(&temp, &bytes)?;
        std::fs::rename(&temp, &self.path)?;
        debug!(
            "Saved vector collection {} ({} bytes)",
            self.modality.name(),
            bytes.len()
        );
        Ok(())
    }
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
