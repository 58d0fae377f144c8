use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::vector_store::{
    CollectionInfo, Distance, Payload, ScoredChunk, StoredPoint, VectorStore,
};
use crate::error::{GatewayError, GatewayResult};

struct Collection {
    vector_size: usize,
    distance: Distance,
    // Insertion order is kept so equal scores rank stably.
    points: Vec<StoredPoint>,
}

/// Brute-force in-process vector store, for development and tests.
#[derive(Default)]
pub struct MemoryVectorStore {
    collections: Mutex<HashMap<String, Collection>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> GatewayResult<MutexGuard<'_, HashMap<String, Collection>>> {
        self.collections
            .lock()
            .map_err(|_| GatewayError::Internal("vector store lock poisoned".to_string()))
    }
}

fn score(distance: Distance, a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    match distance {
        Distance::Dot => dot,
        Distance::Cosine => {
            let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm_a == 0.0 || norm_b == 0.0 {
                0.0
            } else {
                dot / (norm_a * norm_b)
            }
        }
        // Negated so that a higher score is always better.
        Distance::Euclid => -a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
    }
}

fn matches_filter(payload: &Payload, filter: &Payload) -> bool {
    filter
        .iter()
        .all(|(key, expected)| payload.get(key) == Some(expected))
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn has_collection(&self, name: &str) -> GatewayResult<bool> {
        Ok(self.lock()?.contains_key(name))
    }

    async fn create_collection(
        &self,
        name: &str,
        vector_size: u64,
        distance: Distance,
        force_recreate: bool,
    ) -> GatewayResult<bool> {
        let mut collections = self.lock()?;
        if collections.contains_key(name) && !force_recreate {
            return Ok(false);
        }
        collections.insert(
            name.to_string(),
            Collection {
                vector_size: vector_size as usize,
                distance,
                points: Vec::new(),
            },
        );
        tracing::info!("Created in-memory collection {} (size {})", name, vector_size);
        Ok(true)
    }

    async fn list_collections(&self) -> GatewayResult<Vec<CollectionInfo>> {
        let collections = self.lock()?;
        let mut infos: Vec<CollectionInfo> = collections
            .iter()
            .map(|(name, collection)| CollectionInfo {
                name: name.clone(),
                vectors_count: collection.points.len() as u64,
                points_count: collection.points.len() as u64,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    async fn delete_collection(&self, name: &str) -> GatewayResult<bool> {
        Ok(self.lock()?.remove(name).is_some())
    }

    async fn upsert(&self, collection: &str, points: Vec<StoredPoint>) -> GatewayResult<()> {
        let mut collections = self.lock()?;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| GatewayError::NotFound(format!("Collection '{}' not found", collection)))?;

        if let Some(bad) = points.iter().find(|p| p.vector.len() != target.vector_size) {
            return Err(GatewayError::InvalidInput(format!(
                "Vector dimension {} does not match collection dimension {}",
                bad.vector.len(),
                target.vector_size
            )));
        }

        for point in points {
            match target.points.iter_mut().find(|p| p.id == point.id) {
                Some(existing) => *existing = point,
                None => target.points.push(point),
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        top_k: u64,
        score_threshold: Option<f32>,
        metadata_filter: Option<&Payload>,
    ) -> GatewayResult<Vec<ScoredChunk>> {
        let collections = self.lock()?;
        let target = collections
            .get(collection)
            .ok_or_else(|| GatewayError::NotFound(format!("Collection '{}' not found", collection)))?;

        if vector.len() != target.vector_size {
            return Err(GatewayError::InvalidInput(format!(
                "Query dimension {} does not match collection dimension {}",
                vector.len(),
                target.vector_size
            )));
        }

        let mut scored: Vec<(f32, &StoredPoint)> = target
            .points
            .iter()
            .filter(|p| metadata_filter.map_or(true, |f| matches_filter(&p.payload, f)))
            .map(|p| (score(target.distance, &vector, &p.vector), p))
            .filter(|(s, _)| score_threshold.map_or(true, |t| *s >= t))
            .collect();

        // Stable sort keeps insertion order among ties.
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(top_k as usize);

        Ok(scored
            .into_iter()
            .map(|(s, p)| ScoredChunk::from_payload(p.id.clone(), s, p.payload.clone()))
            .collect())
    }
}
