//! Deterministic local hash embeddings for knowledge-base chunks.
//!
//! Features are significant words plus adjacent word pairs, hashed with SHA-256 into a fixed
//! number of signed buckets and L2-normalized. Identical text always embeds identically, across
//! builds and platforms.

use sha2::{Digest, Sha256};

use crate::text::significant_words;

pub const DEFAULT_MODEL_ID: &str = "grantgate-hash-v1";
pub const DEFAULT_DIMENSIONS: usize = 384;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingModel {
    pub model_id: String,
    pub dimensions: usize,
}

impl Default for EmbeddingModel {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            dimensions: DEFAULT_DIMENSIONS,
        }
    }
}

impl EmbeddingModel {
    pub fn embed(&self, payload: &str) -> Vec<f32> {
        let dims = self.dimensions.max(8);
        let mut vector = vec![0_f32; dims];

        for feature in features(payload) {
            let hash = feature_hash(&feature);
            let index = (hash % dims as u64) as usize;
            let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            let weight = if feature.starts_with("p:") { 0.5 } else { 1.0 };
            vector[index] += sign * weight;
        }

        normalize(&mut vector);
        vector
    }
}

/// Dot product of two L2-normalized vectors; 0 for mismatched or empty input.
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }
    left.iter()
        .zip(right)
        .map(|(left_value, right_value)| f64::from(*left_value) * f64::from(*right_value))
        .sum()
}

pub fn encode_blob(values: &[f32]) -> Vec<u8> {
    values
        .iter()
        .flat_map(|value| value.to_le_bytes())
        .collect()
}

pub fn decode_blob(blob: &[u8], expected_dim: usize) -> Option<Vec<f32>> {
    if expected_dim == 0 || blob.len() != expected_dim.saturating_mul(4) {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            .collect(),
    )
}

fn features(payload: &str) -> Vec<String> {
    let words = significant_words(payload);
    let mut out = Vec::with_capacity(words.len() * 2);
    for (index, word) in words.iter().enumerate() {
        out.push(format!("w:{word}"));
        if let Some(next) = words.get(index + 1) {
            out.push(format!("p:{word}_{next}"));
        }
    }
    out
}

fn feature_hash(feature: &str) -> u64 {
    let digest = Sha256::digest(feature.as_bytes());
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

fn normalize(values: &mut [f32]) {
    let norm = values
        .iter()
        .map(|value| f64::from(*value) * f64::from(*value))
        .sum::<f64>()
        .sqrt();
    if norm <= 0.0 {
        return;
    }
    for value in values {
        *value = (f64::from(*value) / norm) as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_embeds_identically() {
        let model = EmbeddingModel::default();
        let left = model.embed("Youth mentoring program in Dayton");
        let right = model.embed("Youth mentoring program in Dayton");
        assert_eq!(left, right);
        assert!((cosine_similarity(&left, &right) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn related_text_scores_above_unrelated_text() {
        let model = EmbeddingModel::default();
        let query = model.embed("youth mentoring outcomes");
        let related = model.embed("Our youth mentoring program improved outcomes for students");
        let unrelated = model.embed("Quarterly facilities maintenance invoice schedule");
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[test]
    fn blob_round_trip_checks_dimensions() {
        let values = vec![0.25_f32, -0.5, 1.0];
        let blob = encode_blob(&values);
        assert_eq!(decode_blob(&blob, 3), Some(values));
        assert_eq!(decode_blob(&blob, 4), None);
    }

    #[test]
    fn empty_payload_is_zero_vector() {
        let model = EmbeddingModel::default();
        let vector = model.embed("a an of");
        assert!(vector.iter().all(|value| *value == 0.0));
    }
}
