// Scoring primitives: cosine similarity, lexical overlap, fused ranking.

use chrono::{DateTime, Utc};

/// Cosine similarity between two vectors, clamped to 0.0–1.0.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = f64::from(*x);
        let y = f64::from(*y);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if !denom.is_finite() || denom < f64::EPSILON {
        return 0.0;
    }

    let raw = dot / denom;
    if !raw.is_finite() {
        return 0.0;
    }

    #[allow(clippy::cast_possible_truncation)]
    let sim = raw.clamp(0.0, 1.0) as f32;
    sim
}

/// Normalized token overlap between a query and a document: matched query
/// tokens over total query tokens, in 0.0–1.0. Tokens are lowercased
/// alphanumeric runs; CJK text falls back to per-character containment.
#[must_use]
pub fn lexical_overlap(query: &str, content: &str) -> f32 {
    let query_tokens = tokenize(query);
    if query_tokens.is_empty() {
        return 0.0;
    }

    let content_lower = content.to_lowercase();
    let content_tokens: std::collections::HashSet<String> =
        tokenize(&content_lower).into_iter().collect();

    let mut matched = 0usize;
    for token in &query_tokens {
        let hit = if token.chars().any(crate::llm::is_cjk) {
            content_lower.contains(token.as_str())
        } else {
            content_tokens.contains(token)
        };
        if hit {
            matched += 1;
        }
    }

    #[allow(clippy::cast_precision_loss)]
    let score = matched as f32 / query_tokens.len() as f32;
    score
}

fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_alphanumeric() {
            if crate::llm::is_cjk(c) {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                tokens.push(c.to_lowercase().collect());
            } else {
                current.extend(c.to_lowercase());
            }
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// One ranked search hit before fusion.
#[derive(Debug, Clone)]
pub struct ScoredId {
    pub id: String,
    pub lexical: Option<f32>,
    pub vector: Option<f32>,
    pub updated_at: DateTime<Utc>,
}

/// Fuse lexical and vector scores: `0.5·lexical + 0.5·vector`, missing
/// halves contribute zero. Ties break by `updated_at` descending.
#[must_use]
pub fn fuse_ranked(mut hits: Vec<ScoredId>, k: usize) -> Vec<(ScoredId, f32)> {
    let mut scored: Vec<(ScoredId, f32)> = hits
        .drain(..)
        .map(|hit| {
            let lexical = hit.lexical.unwrap_or(0.0);
            let vector = hit.vector.unwrap_or(0.0);
            let fused = 0.5 * lexical + 0.5 * vector;
            (hit, fused)
        })
        .collect();

    scored.sort_by(|(a, score_a), (b, score_b)| {
        score_b
            .partial_cmp(score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.updated_at.cmp(&a.updated_at))
    });
    scored.truncate(k);
    scored
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical_vectors() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 0.001);
    }

    #[test]
    fn cosine_orthogonal_vectors() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 0.001);
    }

    #[test]
    fn cosine_mismatched_or_empty_is_zero() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn lexical_full_and_partial_overlap() {
        assert_eq!(lexical_overlap("lin feng", "Lin Feng walked in"), 1.0);
        assert_eq!(lexical_overlap("lin feng detective", "Lin Feng"), 2.0 / 3.0);
        assert_eq!(lexical_overlap("dragon", "no such thing"), 0.0);
    }

    #[test]
    fn lexical_handles_cjk_per_character() {
        let score = lexical_overlap("上海", "故事发生在上海的夜晚");
        assert_eq!(score, 1.0);
    }

    #[test]
    fn lexical_empty_query_is_zero() {
        assert_eq!(lexical_overlap("", "anything"), 0.0);
        assert_eq!(lexical_overlap("  ,.!", "anything"), 0.0);
    }

    #[test]
    fn fuse_weights_equally_and_breaks_ties_by_recency() {
        let old = Utc::now() - chrono::Duration::hours(1);
        let new = Utc::now();
        let hits = vec![
            ScoredId {
                id: "older".into(),
                lexical: Some(0.6),
                vector: Some(0.4),
                updated_at: old,
            },
            ScoredId {
                id: "newer".into(),
                lexical: Some(0.4),
                vector: Some(0.6),
                updated_at: new,
            },
        ];
        let ranked = fuse_ranked(hits, 10);
        // Equal fused scores: the newer item wins the tie.
        assert_eq!(ranked[0].0.id, "newer");
        assert_eq!(ranked[0].1, 0.5);
    }

    #[test]
    fn fuse_truncates_to_k() {
        let hits: Vec<ScoredId> = (0..10)
            .map(|i| ScoredId {
                id: format!("item-{i}"),
                lexical: Some(0.1),
                vector: None,
                updated_at: Utc::now(),
            })
            .collect();
        assert_eq!(fuse_ranked(hits, 3).len(), 3);
    }

    #[test]
    fn missing_halves_contribute_zero() {
        let hits = vec![ScoredId {
            id: "lexical-only".into(),
            lexical: Some(0.8),
            vector: None,
            updated_at: Utc::now(),
        }];
        let ranked = fuse_ranked(hits, 1);
        assert_eq!(ranked[0].1, 0.4);
    }
}
