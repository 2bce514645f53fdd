use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

const INDEX_MAGIC: &[u8; 4] = b"GRIX";
const INDEX_VERSION: u32 = 1;

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for i in 0..a.len().min(b.len()) {
        let x = a[i];
        let y = b[i];
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Similarity index keyed by fact id. The index is a derived projection of the
/// record store and can always be rebuilt from it.
pub trait VectorIndex: Send {
    fn dim(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn add(&mut self, id: u64, vector: &[f32]) -> Result<()>;

    fn remove(&mut self, id: u64) -> bool;

    /// Nearest `k` ids, most similar first.
    fn search(&self, query: &[f32], k: usize) -> Vec<(u64, f32)>;

    fn ids(&self) -> Vec<u64>;

    /// Drop every vector.
    fn reset(&mut self);

    fn persist(&self, path: &Path) -> Result<()>;
}

/// Exhaustive cosine index, the flat-L2 equivalent for normalized vectors.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    dim: usize,
    vectors: BTreeMap<u64, Box<[f32]>>,
}

impl FlatIndex {
    pub fn new(dim: usize) -> Self {
        Self { dim, vectors: BTreeMap::new() }
    }

    /// Layout: magic, version u32, dim u32, count u64, then `count` records of
    /// (id u64, `dim` f32), all little-endian.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let corrupt = |what: &str| Error::Storage(format!("index file {}: {}", path.display(), what));
        if bytes.len() < 20 || &bytes[0..4] != INDEX_MAGIC {
            return Err(corrupt("bad header"));
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().map_err(|_| corrupt("bad header"))?);
        if version != INDEX_VERSION {
            return Err(corrupt("unsupported version"));
        }
        let dim = u32::from_le_bytes(bytes[8..12].try_into().map_err(|_| corrupt("bad header"))?) as usize;
        let count = u64::from_le_bytes(bytes[12..20].try_into().map_err(|_| corrupt("bad header"))?) as usize;
        let record_len = 8 + dim * 4;
        let expected = count.checked_mul(record_len).and_then(|n| n.checked_add(20));
        if dim == 0 || expected != Some(bytes.len()) {
            return Err(corrupt("truncated"));
        }
        let mut index = Self::new(dim);
        for rec in bytes[20..].chunks_exact(record_len) {
            let id = u64::from_le_bytes(rec[0..8].try_into().map_err(|_| corrupt("bad record"))?);
            let floats: Vec<f32> = rec[8..]
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            index.vectors.insert(id, floats.into_boxed_slice());
        }
        Ok(index)
    }
}

impl VectorIndex for FlatIndex {
    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn add(&mut self, id: u64, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dim {
            return Err(Error::Storage(format!(
                "vector dimension {} does not match index dimension {}",
                vector.len(),
                self.dim
            )));
        }
        self.vectors.insert(id, vector.to_vec().into_boxed_slice());
        Ok(())
    }

    fn remove(&mut self, id: u64) -> bool {
        self.vectors.remove(&id).is_some()
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<(u64, f32)> {
        if k == 0 || query.len() != self.dim {
            return Vec::new();
        }
        let mut hits: Vec<(u64, f32)> = self
            .vectors
            .iter()
            .map(|(id, v)| (*id, cosine_similarity(query, v)))
            .collect();
        // ties resolve to the newer id
        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(b.0.cmp(&a.0)));
        hits.truncate(k);
        hits
    }

    fn ids(&self) -> Vec<u64> {
        self.vectors.keys().copied().collect()
    }

    fn reset(&mut self) {
        self.vectors.clear();
    }

    fn persist(&self, path: &Path) -> Result<()> {
        let mut buf: Vec<u8> = Vec::with_capacity(20 + self.vectors.len() * (8 + self.dim * 4));
        buf.extend_from_slice(INDEX_MAGIC);
        buf.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.dim as u32).to_le_bytes());
        buf.extend_from_slice(&(self.vectors.len() as u64).to_le_bytes());
        for (id, v) in &self.vectors {
            buf.extend_from_slice(&id.to_le_bytes());
            if cfg!(target_endian = "little") {
                buf.extend_from_slice(bytemuck::cast_slice::<f32, u8>(&v[..]));
            } else {
                for x in v.iter() {
                    buf.extend_from_slice(&x.to_le_bytes());
                }
            }
        }
        let tmp = path.with_extension("index.tmp");
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&buf)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn search_orders_by_similarity() {
        let mut idx = FlatIndex::new(4);
        idx.add(1, &unit(4, 0)).unwrap();
        idx.add(2, &[0.7, 0.7, 0.0, 0.0]).unwrap();
        idx.add(3, &unit(4, 3)).unwrap();
        let hits = idx.search(&unit(4, 0), 2);
        assert_eq!(hits.iter().map(|h| h.0).collect::<Vec<_>>(), vec![1, 2]);
        assert!(idx.search(&unit(4, 0), 0).is_empty());
    }

    #[test]
    fn rejects_wrong_dimension() {
        let mut idx = FlatIndex::new(4);
        assert!(matches!(idx.add(1, &[1.0, 0.0]), Err(Error::Storage(_))));
        assert!(idx.is_empty());
    }

    #[test]
    fn persist_and_load_preserve_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facts.index");
        let mut idx = FlatIndex::new(3);
        idx.add(7, &[0.1, 0.2, 0.3]).unwrap();
        idx.add(9, &[0.3, 0.2, 0.1]).unwrap();
        idx.persist(&path).unwrap();

        let loaded = FlatIndex::load(&path).unwrap();
        assert_eq!(loaded.dim(), 3);
        assert_eq!(loaded.ids(), vec![7, 9]);
        assert_eq!(loaded.search(&[0.1, 0.2, 0.3], 1)[0].0, 7);
    }

    #[test]
    fn load_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facts.index");
        let mut idx = FlatIndex::new(3);
        idx.add(1, &[1.0, 0.0, 0.0]).unwrap();
        idx.persist(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();
        assert!(FlatIndex::load(&path).is_err());
    }
}
