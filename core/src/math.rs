//! Vector math used by bi-encoder reranking and diversity selection

const EPS: f32 = 1e-8;

/// Cosine similarity of two vectors, `None` when the lengths differ or a vector is empty
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();

    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt() + EPS;
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt() + EPS;

    let similarity = dot_product / (norm_a * norm_b);
    if !similarity.is_finite() {
        return None;
    }

    // Clamp to valid range (numerical stability)
    Some(similarity.clamp(-1.0, 1.0))
}

/// `1 - cosine_similarity`, in `[0, 2]`
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    cosine_similarity(a, b).map(|s| 1.0 - s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&a, &a).unwrap();
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let sim = cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap();
        assert!(sim.abs() < 1e-6);
        let dist = cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]).unwrap();
        assert!((dist - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_incompatible() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), None);
        assert_eq!(cosine_similarity(&[], &[]), None);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let sim = cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).unwrap();
        assert_eq!(sim, 0.0);
    }
}
