//! Offline sentence embedding: signed feature hashing over lowercased tokens.
//!
//! Token slots come from SHA-256, so vectors (and any policy trained on
//! them) stay identical across toolchains and platforms. Used when no
//! embedding endpoint is configured, and in tests.

use sha2::{Digest, Sha256};

use rapport_llm::embedding::{EmbedFuture, EmbeddingProvider};

#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    /// L2-normalised hashed bag of words; the empty string maps to zeros.
    pub fn generate(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0_f32; self.dim];
        if self.dim == 0 {
            return v;
        }
        let lower = text.to_lowercase();
        for token in lower.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let h = token_hash(token);
            let slot = (h % self.dim as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            v[slot] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

/// First eight digest bytes, little-endian.
fn token_hash(token: &str) -> u64 {
    let digest = Sha256::digest(token.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

impl EmbeddingProvider for HashEmbedder {
    fn name(&self) -> &str {
        "hash"
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn embed<'a>(&'a self, text: &'a str) -> EmbedFuture<'a, Vec<f32>> {
        let v = self.generate(text);
        Box::pin(async move { Ok(v) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let e = HashEmbedder::new(64);
        assert_eq!(e.generate("hello world"), e.generate("hello world"));
    }

    #[test]
    fn correct_dimension_and_unit_norm() {
        let v = HashEmbedder::new(32).generate("test");
        assert_eq!(v.len(), 32);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn case_and_punctuation_are_ignored() {
        let e = HashEmbedder::new(64);
        assert_eq!(e.generate("Hello, World!"), e.generate("hello world"));
        let wide = HashEmbedder::new(1024);
        assert_ne!(wide.generate("hello"), wide.generate("goodbye"));
    }

    #[test]
    fn slots_are_pinned() {
        let e = HashEmbedder::new(64);
        let mut hello = vec![0.0; 64];
        hello[44] = 1.0;
        assert_eq!(e.generate("hello"), hello);

        let both = e.generate("hello world");
        let half = std::f32::consts::FRAC_1_SQRT_2;
        assert!((both[44] - half).abs() < 1e-6);
        assert!((both[8] - half).abs() < 1e-6);
    }

    #[test]
    fn empty_input_is_zero() {
        assert_eq!(HashEmbedder::new(8).generate(""), vec![0.0; 8]);
    }

    #[tokio::test]
    async fn provider_matches_generate() {
        let e = HashEmbedder::new(16);
        assert_eq!(e.embed("안녕 친구").await.unwrap(), e.generate("안녕 친구"));
    }
}
