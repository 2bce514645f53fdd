use rayon::prelude::*;
use regex::Regex;
use std::sync::OnceLock;

pub const EMBED_DIM: usize = 384;

/// Text to fixed-width vector. Implementations must be deterministic: persisted
/// indexes are only meaningful if the same text always maps to the same vector.
pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;

    fn embed_batch(&self, texts: &[&str]) -> Vec<Vec<f32>>;

    fn embed(&self, text: &str) -> Vec<f32> {
        self.embed_batch(&[text]).pop().unwrap_or_else(|| vec![0.0; self.dim()])
    }
}

/// Feature-hashing embedder over word character trigrams.
///
/// Words are padded with spaces before splitting so that "hunt" and "hunting"
/// share their leading grams. Output vectors are L2-normalized.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self { dim: EMBED_DIM }
    }
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        let lowered = text.to_lowercase();
        for word in word_regex().find_iter(&lowered) {
            let padded: Vec<char> = format!(" {} ", word.as_str()).chars().collect();
            for gram in padded.windows(3) {
                let h = fnv1a(gram);
                let slot = (h % self.dim as u64) as usize;
                // sign bit decorrelates collisions
                let sign = if (h >> 63) & 1 == 1 { -1.0 } else { 1.0 };
                v[slot] += sign;
            }
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        v
    }
}

impl Embedder for HashingEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed_batch(&self, texts: &[&str]) -> Vec<Vec<f32>> {
        texts.par_iter().map(|t| self.embed_one(t)).collect()
    }
}

fn word_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\p{L}\p{N}']+").expect("static regex"))
}

// FNV-1a: stable across builds, unlike the std hasher.
fn fnv1a(chars: &[char]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for c in chars {
        let mut buf = [0u8; 4];
        for b in c.encode_utf8(&mut buf).as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_index::cosine_similarity;

    #[test]
    fn deterministic_and_normalized() {
        let e = HashingEmbedder::default();
        let a = e.embed("Grug hunt mammoth.");
        let b = e.embed("Grug hunt mammoth.");
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBED_DIM);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn related_words_score_higher_than_unrelated() {
        let e = HashingEmbedder::default();
        let fact = e.embed("Grug hunt mammoth.");
        let related = e.embed("hunting");
        let unrelated = e.embed("sky blue today");
        assert!(cosine_similarity(&fact, &related) > cosine_similarity(&fact, &unrelated));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let e = HashingEmbedder::new(16);
        assert!(e.embed("  ...  ").iter().all(|x| *x == 0.0));
    }
}
