//! Term-frequency cosine similarity used by the in-memory long-term store.

use std::collections::HashMap;

/// Lowercased alphanumeric tokens of length ≥ 2
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(|t| t.to_lowercase())
        .collect()
}

fn term_frequencies(text: &str) -> HashMap<String, f64> {
    let mut tf = HashMap::new();
    for token in tokenize(text) {
        *tf.entry(token).or_insert(0.0) += 1.0;
    }
    tf
}

/// Cosine similarity of the term-frequency vectors of `a` and `b`, in [0, 1].
pub fn cosine(a: &str, b: &str) -> f64 {
    let ta = term_frequencies(a);
    let tb = term_frequencies(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }

    let dot: f64 = ta
        .iter()
        .filter_map(|(term, wa)| tb.get(term).map(|wb| wa * wb))
        .sum();
    let norm_a: f64 = ta.values().map(|w| w * w).sum::<f64>().sqrt();
    let norm_b: f64 = tb.values().map(|w| w * w).sum::<f64>().sqrt();

    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_drops_punctuation_and_short_tokens() {
        assert_eq!(
            tokenize("Fetch https://example.com, a SUMMARY!"),
            vec!["fetch", "https", "example", "com", "summary"]
        );
    }

    #[test]
    fn test_cosine_bounds() {
        assert!((cosine("rust async runtime", "rust async runtime") - 1.0).abs() < 1e-9);
        assert_eq!(cosine("rust", "python"), 0.0);
        assert_eq!(cosine("", "python"), 0.0);

        let partial = cosine("rust async runtime", "tokio async runtime");
        assert!(partial > 0.0 && partial < 1.0);
    }
}
