use serde::{Deserialize, Serialize};

/// Face descriptor produced by the embedding model for exactly one face
/// (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    values: Vec<f32>,
    /// Model version that produced this descriptor (e.g., "w600k_r50").
    model_version: Option<String>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn with_model_version(values: Vec<f32>, model_version: impl Into<String>) -> Self {
        Self {
            values,
            model_version: Some(model_version.into()),
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }

    /// Cosine similarity between two descriptors.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Descriptors of
    /// different length, or a zero-norm descriptor, compare as 0.0.
    pub fn similarity(&self, other: &Descriptor) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }

    /// Scale to unit L2 norm. A zero vector is returned unchanged.
    pub fn normalized(mut self) -> Self {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in self.values.iter_mut() {
                *v /= norm;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_similarity_identical() {
        let a = Descriptor::new(vec![1.0, 0.0, 0.0]);
        let b = Descriptor::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_orthogonal() {
        let a = Descriptor::new(vec![1.0, 0.0]);
        let b = Descriptor::new(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_opposite() {
        let a = Descriptor::new(vec![1.0, 0.0]);
        let b = Descriptor::new(vec![-1.0, 0.0]);
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_scale_invariant() {
        let a = Descriptor::new(vec![1.0, 2.0, 3.0]);
        let b = Descriptor::new(vec![10.0, 20.0, 30.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_zero_vector() {
        let a = Descriptor::new(vec![0.0, 0.0]);
        let b = Descriptor::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_similarity_length_mismatch() {
        let a = Descriptor::new(vec![1.0, 0.0, 0.0]);
        let b = Descriptor::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_normalized_unit_norm() {
        let d = Descriptor::new(vec![3.0, 4.0]).normalized();
        assert!((d.values()[0] - 0.6).abs() < 1e-6);
        assert!((d.values()[1] - 0.8).abs() < 1e-6);

        let zero = Descriptor::new(vec![0.0, 0.0]).normalized();
        assert_eq!(zero.values(), &[0.0, 0.0]);
    }
}
