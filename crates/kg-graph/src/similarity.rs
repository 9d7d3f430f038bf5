/// Cosine similarity between two equal-length vectors. Returns `0.0` if
/// either vector is zero (rather than dividing by zero). Vectors coming out
/// of the embedding adapter are already L2-normalized, so this degenerates to
/// a dot product in the common case; left general so callers passing through
/// unnormalized vectors still get a sane answer.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| *x as f64 * *y as f64).sum();
    let norm_a: f64 = a.iter().map(|x| *x as f64 * *x as f64).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| *x as f64 * *x as f64).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Rank candidates against a query vector, keeping only those at or above
/// `min_score`, sorted by descending similarity, truncated to `top_k`.
pub fn top_k_by_similarity<T: Clone>(
    query_vector: &[f32],
    candidates: &[(T, Vec<f32>)],
    top_k: usize,
    min_score: f64,
) -> Vec<(T, f64)> {
    let mut scored: Vec<(T, f64)> = candidates
        .iter()
        .map(|(item, emb)| (item.clone(), cosine_similarity(query_vector, emb)))
        .filter(|(_, score)| *score >= min_score)
        .collect();
    scored.sort_by(|(_, a), (_, b)| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(top_k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_have_similarity_one() {
        let v = vec![0.3, 0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn orthogonal_vectors_have_similarity_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-9);
    }

    #[test]
    fn zero_vector_yields_zero_rather_than_nan() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn top_k_respects_threshold_and_ordering() {
        let query = vec![1.0, 0.0];
        let candidates = vec![
            ("a".to_string(), vec![1.0, 0.0]),
            ("b".to_string(), vec![0.0, 1.0]),
            ("c".to_string(), vec![0.9, 0.1]),
        ];
        let ranked = top_k_by_similarity(&query, &candidates, 2, 0.5);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].0, "a");
    }
}
