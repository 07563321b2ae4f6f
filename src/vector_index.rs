//! In-memory inner-product vector index
//!
//! A flat index over L2-normalised vectors; with normalised inputs the
//! inner product equals cosine similarity. Vectors are stored row-major
//! next to a positional id-mapping list: the id at position `i` names the
//! chunk whose vector was inserted `i`-th. Persistence writes the vector
//! file and the id sidecar to temporary names and renames both into place,
//! so a reload sees either the complete new index or none of it.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{Result, StoreError};
use crate::models::DocumentChunk;

/// Magic tag at the start of the index file
const INDEX_MAGIC: &[u8; 4] = b"NSIX";

/// Flat inner-product index with a positional chunk-id mapping
#[derive(Debug)]
pub struct VectorIndex {
    dimension: usize,
    /// Row-major normalised vectors, `len = count * dimension`
    vectors: Vec<f32>,
    chunk_ids: Vec<String>,
}

impl VectorIndex {
    /// Create an empty index of the given dimension
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: Vec::new(),
            chunk_ids: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of indexed vectors; always equals the id-mapping length
    pub fn len(&self) -> usize {
        self.chunk_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_ids.is_empty()
    }

    /// Add chunk vectors, L2-normalising each, and extend the id mapping in
    /// the same order. Chunks without an embedding or with a wrong
    /// dimension are an error; nothing is partially inserted.
    pub fn add(&mut self, chunks: &[DocumentChunk]) -> Result<()> {
        let mut new_vectors = Vec::with_capacity(chunks.len() * self.dimension);
        let mut new_ids = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let embedding = chunk.embedding.as_ref().ok_or_else(|| {
                StoreError::StorageFailed(format!("chunk {} has no embedding", chunk.chunk_id))
            })?;

            if embedding.len() != self.dimension {
                return Err(StoreError::InvalidDimension {
                    expected: self.dimension,
                    actual: embedding.len(),
                }
                .into());
            }

            let mut normalised = embedding.clone();
            normalize(&mut normalised);
            new_vectors.extend_from_slice(&normalised);
            new_ids.push(chunk.chunk_id.clone());
        }

        self.vectors.extend_from_slice(&new_vectors);
        self.chunk_ids.extend(new_ids);

        info!("Added {} vectors to index (total {})", chunks.len(), self.len());
        Ok(())
    }

    /// Nearest-neighbour search. The query is L2-normalised, scored by dot
    /// product against every row, and the top `k` results are returned as
    /// `(chunk_id, score)` in descending score order.
    pub fn search(&self, query_vector: &[f32], top_k: usize) -> Vec<(String, f32)> {
        if self.is_empty() {
            warn!("Vector index is empty, nothing to search");
            return Vec::new();
        }
        if query_vector.len() != self.dimension || top_k == 0 {
            return Vec::new();
        }

        let mut query = query_vector.to_vec();
        normalize(&mut query);

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(i, row)| (i, dot(row, &query)))
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k.min(self.len()));

        scored
            .into_iter()
            .map(|(i, score)| (self.chunk_ids[i].clone(), score))
            .collect()
    }

    /// Persist the index and the id mapping side by side.
    ///
    /// Index file layout: magic, dimension (u32 LE), count (u64 LE), then
    /// the row-major f32 data in little-endian order. The id mapping goes
    /// to `path.with_extension("ids")` as a JSON string array. Both files
    /// are written under temporary names and renamed into place.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let ids_path = ids_path(path);
        let tmp_index = path.with_extension("index.tmp");
        let tmp_ids = ids_path.with_extension("ids.tmp");

        {
            let mut file = fs::File::create(&tmp_index)?;
            file.write_all(INDEX_MAGIC)?;
            file.write_all(&(self.dimension as u32).to_le_bytes())?;
            file.write_all(&(self.len() as u64).to_le_bytes())?;
            let mut buf = Vec::with_capacity(self.vectors.len() * 4);
            for v in &self.vectors {
                buf.extend_from_slice(&v.to_le_bytes());
            }
            file.write_all(&buf)?;
            file.sync_all()?;
        }

        {
            let mut file = fs::File::create(&tmp_ids)?;
            file.write_all(serde_json::to_vec(&self.chunk_ids)?.as_slice())?;
            file.sync_all()?;
        }

        fs::rename(&tmp_ids, &ids_path)?;
        fs::rename(&tmp_index, path)?;

        info!(
            "Saved vector index: {} vectors to {}",
            self.len(),
            path.display()
        );
        Ok(())
    }

    /// Load a persisted index; both the vector file and the id sidecar must
    /// be present and agree on the vector count.
    pub fn load(path: &Path) -> Result<Self> {
        let ids_path = ids_path(path);

        if !path.exists() || !ids_path.exists() {
            return Err(StoreError::IndexMissing(path.display().to_string()).into());
        }

        let mut file = fs::File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)
            .map_err(|_| StoreError::Corrupt("index file truncated".into()))?;
        if &magic != INDEX_MAGIC {
            return Err(StoreError::Corrupt("bad index file magic".into()).into());
        }

        let mut dim_bytes = [0u8; 4];
        file.read_exact(&mut dim_bytes)
            .map_err(|_| StoreError::Corrupt("index file truncated".into()))?;
        let dimension = u32::from_le_bytes(dim_bytes) as usize;

        let mut count_bytes = [0u8; 8];
        file.read_exact(&mut count_bytes)
            .map_err(|_| StoreError::Corrupt("index file truncated".into()))?;
        let count = u64::from_le_bytes(count_bytes) as usize;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        if data.len() != count * dimension * 4 {
            return Err(StoreError::Corrupt(format!(
                "index data length {} does not match {} vectors of dimension {}",
                data.len(),
                count,
                dimension
            ))
            .into());
        }

        let vectors: Vec<f32> = data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let ids_json = fs::read(&ids_path)?;
        let chunk_ids: Vec<String> = serde_json::from_slice(&ids_json)?;

        if chunk_ids.len() != count {
            return Err(StoreError::Corrupt(format!(
                "id mapping has {} entries for {} vectors",
                chunk_ids.len(),
                count
            ))
            .into());
        }

        info!(
            "Loaded vector index: {} vectors from {}",
            count,
            path.display()
        );

        Ok(Self {
            dimension,
            vectors,
            chunk_ids,
        })
    }

    /// True when both persisted files are present
    pub fn exists(path: &Path) -> bool {
        path.exists() && ids_path(path).exists()
    }
}

fn ids_path(index_path: &Path) -> PathBuf {
    index_path.with_extension("ids")
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_with_embedding(id: &str, embedding: Vec<f32>) -> DocumentChunk {
        DocumentChunk {
            chunk_id: id.to_string(),
            doc_id: "doc".to_string(),
            content: String::new(),
            chunk_index: 0,
            start_pos: 0,
            end_pos: 0,
            embedding: Some(embedding),
            file_path: String::new(),
            title: String::new(),
            tags: vec![],
            backlinks: vec![],
            created_at: None,
            modified_at: None,
        }
    }

    #[test]
    fn test_add_normalises_and_extends_mapping() {
        let mut index = VectorIndex::new(3);
        index
            .add(&[
                chunk_with_embedding("c0", vec![3.0, 0.0, 0.0]),
                chunk_with_embedding("c1", vec![0.0, 5.0, 0.0]),
            ])
            .unwrap();

        assert_eq!(index.len(), 2);
        // Vector count always equals the id-mapping length
        assert_eq!(index.vectors.len() / index.dimension(), index.chunk_ids.len());

        for row in index.vectors.chunks_exact(3) {
            let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_add_rejects_missing_embedding() {
        let mut index = VectorIndex::new(3);
        let mut chunk = chunk_with_embedding("c0", vec![1.0, 0.0, 0.0]);
        chunk.embedding = None;
        assert!(index.add(&[chunk]).is_err());
        assert!(index.is_empty());
    }

    #[test]
    fn test_add_rejects_wrong_dimension() {
        let mut index = VectorIndex::new(3);
        let chunk = chunk_with_embedding("c0", vec![1.0, 0.0]);
        assert!(index.add(&[chunk]).is_err());
    }

    #[test]
    fn test_search_orders_by_similarity() {
        let mut index = VectorIndex::new(3);
        index
            .add(&[
                chunk_with_embedding("exact", vec![1.0, 0.0, 0.0]),
                chunk_with_embedding("close", vec![1.0, 0.4, 0.0]),
                chunk_with_embedding("orthogonal", vec![0.0, 0.0, 1.0]),
            ])
            .unwrap();

        let results = index.search(&[1.0, 0.0, 0.0], 3);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, "exact");
        assert_eq!(results[1].0, "close");
        assert_eq!(results[2].0, "orthogonal");

        assert!((results[0].1 - 1.0).abs() < 1e-5);
        for pair in results.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
        // Cosine-equivalent scores stay within [-1, 1]
        for (_, score) in &results {
            assert!((-1.0..=1.0).contains(&(*score - 1e-6)));
        }
    }

    #[test]
    fn test_search_empty_index() {
        let index = VectorIndex::new(3);
        assert!(index.search(&[1.0, 0.0, 0.0], 5).is_empty());
    }

    #[test]
    fn test_search_caps_at_index_size() {
        let mut index = VectorIndex::new(2);
        index
            .add(&[chunk_with_embedding("only", vec![1.0, 0.0])])
            .unwrap();
        let results = index.search(&[1.0, 0.0], 10);
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.index");

        let mut index = VectorIndex::new(3);
        index
            .add(&[
                chunk_with_embedding("c0", vec![1.0, 2.0, 3.0]),
                chunk_with_embedding("c1", vec![-1.0, 0.5, 0.0]),
            ])
            .unwrap();
        index.save(&path).unwrap();

        assert!(VectorIndex::exists(&path));

        let loaded = VectorIndex::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.dimension(), 3);
        assert_eq!(loaded.chunk_ids, index.chunk_ids);
        assert_eq!(loaded.vectors, index.vectors);
    }

    #[test]
    fn test_load_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.index");
        let err = VectorIndex::load(&path).unwrap_err();
        assert_eq!(err.category(), "store");
    }

    #[test]
    fn test_load_requires_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.index");

        let mut index = VectorIndex::new(2);
        index
            .add(&[chunk_with_embedding("c0", vec![1.0, 0.0])])
            .unwrap();
        index.save(&path).unwrap();

        // Dropping the sidecar must make the pair unusable
        std::fs::remove_file(ids_path(&path)).unwrap();
        assert!(!VectorIndex::exists(&path));
        assert!(VectorIndex::load(&path).is_err());
    }
}
