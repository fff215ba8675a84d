use serde::{Deserialize, Serialize};

const EPSILON: f32 = 1e-9;

/// Metric a collection is built with. Scores are always "higher is closer".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    DotProduct,
    Euclidean,
}

impl SimilarityMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimilarityMetric::Cosine => "cosine",
            SimilarityMetric::DotProduct => "dot_product",
            SimilarityMetric::Euclidean => "euclidean",
        }
    }

    /// Qdrant's name for the same distance.
    pub fn qdrant_distance(&self) -> &'static str {
        match self {
            SimilarityMetric::Cosine => "Cosine",
            SimilarityMetric::DotProduct => "Dot",
            SimilarityMetric::Euclidean => "Euclid",
        }
    }

    /// Returns `None` when the vectors differ in length.
    pub fn score(&self, a: &[f32], b: &[f32]) -> Option<f32> {
        if a.len() != b.len() {
            return None;
        }

        match self {
            SimilarityMetric::Cosine => {
                let (mut dot, mut mag_a, mut mag_b) = (0f32, 0f32, 0f32);
                for (x, y) in a.iter().zip(b) {
                    dot += x * y;
                    mag_a += x * x;
                    mag_b += y * y;
                }
                let denominator = (mag_a * mag_b).sqrt();
                if denominator < EPSILON {
                    Some(0.0)
                } else {
                    Some((dot / denominator).clamp(-1.0, 1.0))
                }
            }
            SimilarityMetric::DotProduct => Some(a.iter().zip(b).map(|(x, y)| x * y).sum()),
            SimilarityMetric::Euclidean => {
                let distance = a
                    .iter()
                    .zip(b)
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum::<f32>()
                    .sqrt();
                Some(1.0 / (1.0 + distance))
            }
        }
    }
}

impl std::str::FromStr for SimilarityMetric {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(SimilarityMetric::Cosine),
            "dot" | "dot_product" => Ok(SimilarityMetric::DotProduct),
            "euclidean" | "l2" => Ok(SimilarityMetric::Euclidean),
            other => Err(format!("unknown similarity metric: {other}")),
        }
    }
}

/// Orders by descending score, then ascending insertion sequence, and
/// keeps at most `top_k`.
pub fn rank<T>(mut scored: Vec<(f32, u64, T)>, top_k: usize) -> Vec<(f32, u64, T)> {
    // NaN has no place in a ranking
    scored.retain(|(score, _, _)| !score.is_nan());
    scored.sort_by(|left, right| right.0.total_cmp(&left.0).then_with(|| left.1.cmp(&right.1)));
    scored.truncate(top_k);
    scored
}
