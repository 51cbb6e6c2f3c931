//! Token-set string similarity
//!
//! Scores two strings on a 0-100 scale after tokenizing, lowercasing and
//! de-duplicating words, so word order and repeated words do not matter.
//! Edit distance comes from `strsim::normalized_levenshtein`.

use std::collections::BTreeSet;

/// Lowercased alphanumeric tokens, de-duplicated and sorted
pub fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn ratio(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(a, b)
}

fn join(parts: &[&String]) -> String {
    parts
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Token-set similarity in [0, 100]
///
/// Compares the shared tokens against each side's full token set and keeps
/// the best of the three ratios. Returns 0 when either side has no tokens.
pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    let left = tokens(a);
    let right = tokens(b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let shared: Vec<&String> = left.intersection(&right).collect();
    let only_left: Vec<&String> = left.difference(&right).collect();
    let only_right: Vec<&String> = right.difference(&left).collect();

    let shared_text = join(&shared);
    let combined_left = format!("{} {}", shared_text, join(&only_left))
        .trim()
        .to_string();
    let combined_right = format!("{} {}", shared_text, join(&only_right))
        .trim()
        .to_string();

    // An empty intersection compared with itself would score a perfect ratio
    if shared.is_empty() {
        return (ratio(&combined_left, &combined_right) * 100.0).round();
    }

    let best = [
        ratio(&shared_text, &combined_left),
        ratio(&shared_text, &combined_right),
        ratio(&combined_left, &combined_right),
    ]
    .into_iter()
    .fold(0.0_f64, f64::max);

    (best * 100.0).round()
}
