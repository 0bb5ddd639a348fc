use serde::{Deserialize, Serialize};

/// Label reported for a face that matched no enrolled identity.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Face embedding vector produced by the encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "facenet").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Return a unit-length copy. A zero vector is returned unchanged.
    pub fn l2_normalized(mut self) -> Self {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in self.values.iter_mut() {
                *v /= norm;
            }
        }
        self
    }

    /// Cosine similarity in [-1, 1]. Zero-norm inputs yield 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Cosine distance in [0, 2]: `1 - similarity`. Lower = more similar.
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        (1.0 - self.similarity(other)).max(0.0)
    }
}

/// An enrolled identity's reference vector. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceEmbedding {
    pub label: String,
    pub embedding: Embedding,
}

/// Outcome of matching one query embedding against the identity store.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Matched identity, `None` when nothing fell under the threshold.
    pub label: Option<String>,
    /// Cosine distance of the accepted match, `f32::INFINITY` otherwise.
    pub distance: f32,
}

impl MatchResult {
    pub fn unknown() -> Self {
        Self { label: None, distance: f32::INFINITY }
    }

    pub fn is_match(&self) -> bool {
        self.label.is_some()
    }

    /// Label for display, `"unknown"` when unmatched.
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(UNKNOWN_LABEL)
    }
}

/// Strategy for comparing a query embedding against enrolled references.
pub trait Matcher {
    fn compare(
        &self,
        query: &Embedding,
        references: &[ReferenceEmbedding],
        threshold: f32,
    ) -> MatchResult;
}

/// Nearest-neighbour matcher over cosine distance.
///
/// A reference is accepted only when its distance is strictly below the
/// threshold. On exact ties the earliest reference in `references` wins.
/// References whose dimensionality differs from the query are skipped.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(
        &self,
        query: &Embedding,
        references: &[ReferenceEmbedding],
        threshold: f32,
    ) -> MatchResult {
        let mut best = MatchResult::unknown();

        for reference in references {
            if reference.embedding.dim() != query.dim() {
                tracing::debug!(
                    label = %reference.label,
                    expected = query.dim(),
                    got = reference.embedding.dim(),
                    "skipping reference with mismatched dimension"
                );
                continue;
            }

            let distance = query.cosine_distance(&reference.embedding);
            if distance < threshold && distance < best.distance {
                best = MatchResult {
                    label: Some(reference.label.clone()),
                    distance,
                };
            }
        }

        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(label: &str, values: Vec<f32>) -> ReferenceEmbedding {
        ReferenceEmbedding {
            label: label.into(),
            embedding: Embedding::new(values),
        }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
        assert!(a.cosine_distance(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_distance_orthogonal_and_opposite() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        let c = Embedding::new(vec![-1.0, 0.0]);
        assert!((a.cosine_distance(&b) - 1.0).abs() < 1e-6);
        assert!((a.cosine_distance(&c) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
        assert_eq!(a.cosine_distance(&b), 1.0);
    }

    #[test]
    fn test_l2_normalized() {
        let e = Embedding::new(vec![3.0, 4.0]).l2_normalized();
        assert!((e.values[0] - 0.6).abs() < 1e-6);
        assert!((e.values[1] - 0.8).abs() < 1e-6);

        let zero = Embedding::new(vec![0.0, 0.0]).l2_normalized();
        assert_eq!(zero.values, vec![0.0, 0.0]);
    }

    #[test]
    fn test_exact_query_matches_with_zero_distance() {
        let v = vec![0.6, 0.8, 0.0];
        let refs = vec![reference("A001", v.clone())];
        let result = CosineMatcher.compare(&Embedding::new(v), &refs, 0.2);
        assert_eq!(result.label.as_deref(), Some("A001"));
        assert!(result.distance.abs() < 1e-6);
    }

    #[test]
    fn test_best_match_is_not_first() {
        let query = Embedding::new(vec![1.0, 0.0, 0.0]);
        let refs = vec![
            reference("decoy1", vec![0.9, 0.43, 0.0]),
            reference("decoy2", vec![0.0, 0.0, 1.0]),
            reference("match", vec![1.0, 0.01, 0.0]),
        ];
        let result = CosineMatcher.compare(&query, &refs, 0.2);
        assert_eq!(result.label.as_deref(), Some("match"));
    }

    #[test]
    fn test_no_reference_within_threshold_is_unknown() {
        let query = Embedding::new(vec![1.0, 0.0]);
        let refs = vec![reference("other", vec![0.0, 1.0])];
        let result = CosineMatcher.compare(&query, &refs, 0.2);
        assert!(!result.is_match());
        assert_eq!(result.display_label(), UNKNOWN_LABEL);
        assert!(result.distance.is_infinite());
    }

    #[test]
    fn test_distance_equal_to_threshold_is_rejected() {
        // Orthogonal vectors are exactly distance 1.0 apart.
        let query = Embedding::new(vec![1.0, 0.0]);
        let refs = vec![reference("edge", vec![0.0, 1.0])];
        let result = CosineMatcher.compare(&query, &refs, 1.0);
        assert!(!result.is_match());
    }

    #[test]
    fn test_returned_distance_always_below_threshold() {
        let query = Embedding::new(vec![1.0, 0.2, -0.3, 0.5]);
        let refs: Vec<_> = (0..20)
            .map(|i| {
                let t = i as f32 * 0.3;
                reference(&format!("id{i}"), vec![t.cos(), t.sin(), 0.1 * t, 0.5])
            })
            .collect();
        for threshold in [0.0f32, 0.05, 0.1, 0.3, 0.7, 1.5] {
            let result = CosineMatcher.compare(&query, &refs, threshold);
            if result.is_match() {
                assert!(result.distance < threshold);
            } else {
                assert!(result.distance.is_infinite());
            }
        }
    }

    #[test]
    fn test_tie_prefers_earlier_reference() {
        let query = Embedding::new(vec![1.0, 0.0]);
        let refs = vec![
            reference("first", vec![1.0, 0.0]),
            reference("second", vec![2.0, 0.0]),
        ];
        let result = CosineMatcher.compare(&query, &refs, 0.5);
        assert_eq!(result.label.as_deref(), Some("first"));
    }

    #[test]
    fn test_mismatched_dimension_is_skipped() {
        let query = Embedding::new(vec![1.0, 0.0]);
        let refs = vec![
            reference("wrong_dim", vec![1.0, 0.0, 0.0]),
            reference("right_dim", vec![0.99, 0.05]),
        ];
        let result = CosineMatcher.compare(&query, &refs, 0.2);
        assert_eq!(result.label.as_deref(), Some("right_dim"));
    }

    #[test]
    fn test_empty_references() {
        let query = Embedding::new(vec![1.0, 0.0]);
        let result = CosineMatcher.compare(&query, &[], 0.5);
        assert_eq!(result, MatchResult::unknown());
    }
}
