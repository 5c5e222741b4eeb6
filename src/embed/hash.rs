use crate::tokenize::tokenize;

use super::l2_normalize;

/// Deterministic content-addressable pseudo-embedding. Each token lands on
/// three hashed indices with signed contributions; the result is
/// L2-normalized. Never fails, never leaves the process.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            for seed in 0..3u64 {
                let h = fnv1a(token.as_bytes(), seed);
                let idx = (h % self.dimension as u64) as usize;
                let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
                vector[idx] += sign;
            }
        }
        l2_normalize(&mut vector);
        vector
    }
}

/// FNV-1a, seeded so the three probes of one token are independent.
fn fnv1a(bytes: &[u8], seed: u64) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET ^ seed.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::cosine;

    #[test]
    fn deterministic() {
        let e = HashEmbedder::new(64);
        assert_eq!(e.embed("connection pool"), e.embed("connection pool"));
    }

    #[test]
    fn normalized_unit_length() {
        let e = HashEmbedder::new(64);
        let v = e.embed("some text to embed");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn empty_input_still_dimension_d() {
        let e = HashEmbedder::new(384);
        let v = e.embed("");
        assert_eq!(v.len(), 384);
        assert!(v.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn overlapping_text_more_similar_than_disjoint() {
        let e = HashEmbedder::new(256);
        let a = e.embed("database connection pool settings");
        let b = e.embed("database connection pool configuration");
        let c = e.embed("weather forecast sunny tomorrow");
        assert!(cosine(&a, &b) > cosine(&a, &c));
    }
}
