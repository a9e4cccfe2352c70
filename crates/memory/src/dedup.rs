//! Near-duplicate detection over one persona's memories.
//!
//! Pure functions — the maintenance worker feeds them store contents and
//! exported vectors and persists whatever comes back. Exact-content
//! duplicates are caught by fingerprint without touching the vectors;
//! everything else goes through pairwise cosine with complete linkage
//! (every member of a cluster must clear the threshold against every
//! other member, so chains of merely-adjacent memories do not collapse
//! into one blob).

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::schema::{CleanupPriority, CleanupSuggestion};
use crate::vector::cosine::cosine_similarity;

/// One memory as seen by the duplicate scan.
#[derive(Debug, Clone)]
pub struct ScanItem {
    pub key: String,
    pub content_hash: String,
    pub vector: Option<Vec<f32>>,
}

/// Whitespace-collapsed, case-folded content fingerprint.
pub fn content_fingerprint(content: &str) -> String {
    let normalised = content.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalised.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Detect duplicate groups.
///
/// * identical fingerprints → one suggestion per group, similarity 1.0;
/// * vector pairs at or above `min_report` → pair suggestions;
/// * pairs are greedily merged into larger clusters while every pairwise
///   similarity stays at or above `duplicate_threshold`.
///
/// Output is sorted by score descending and capped at `max_suggestions`.
pub fn find_duplicate_clusters(
    items: &[ScanItem],
    duplicate_threshold: f32,
    min_report: f32,
    max_suggestions: usize,
) -> Vec<CleanupSuggestion> {
    let mut suggestions = Vec::new();
    let mut consumed: HashSet<&str> = HashSet::new();

    // Exact-content groups first; no embedding comparison needed.
    let mut by_hash: std::collections::BTreeMap<&str, Vec<&str>> = std::collections::BTreeMap::new();
    for item in items {
        by_hash.entry(item.content_hash.as_str()).or_default().push(item.key.as_str());
    }
    for (_, mut keys) in by_hash {
        if keys.len() < 2 {
            continue;
        }
        keys.sort_unstable();
        for key in &keys {
            consumed.insert(key);
        }
        suggestions.push(CleanupSuggestion {
            keys: keys.into_iter().map(String::from).collect(),
            score: 1.0,
            priority: CleanupPriority::from_score(1.0),
        });
    }

    // Pairwise cosine over whatever still has a vector.
    let candidates: Vec<&ScanItem> = items
        .iter()
        .filter(|item| item.vector.is_some() && !consumed.contains(item.key.as_str()))
        .collect();

    let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
    for i in 0..candidates.len() {
        for j in (i + 1)..candidates.len() {
            let sim = cosine_similarity(
                candidates[i].vector.as_deref().unwrap_or(&[]),
                candidates[j].vector.as_deref().unwrap_or(&[]),
            );
            if sim >= min_report {
                pairs.push((i, j, sim));
            }
        }
    }
    pairs.sort_by(|a, b| b.2.total_cmp(&a.2));

    let mut clusters: Vec<(Vec<usize>, f32)> = Vec::new();
    let mut clustered: HashSet<usize> = HashSet::new();
    for (i, j, sim) in pairs {
        match (clustered.contains(&i), clustered.contains(&j)) {
            (false, false) => {
                clusters.push((vec![i, j], sim));
                clustered.insert(i);
                clustered.insert(j);
            }
            (true, false) | (false, true) => {
                let (member, joiner) = if clustered.contains(&i) { (i, j) } else { (j, i) };
                let Some((cluster, score)) =
                    clusters.iter_mut().find(|(members, _)| members.contains(&member))
                else {
                    continue;
                };
                // Complete linkage: the joiner must clear the threshold
                // against every existing member.
                let min_sim = cluster
                    .iter()
                    .map(|&m| {
                        cosine_similarity(
                            candidates[m].vector.as_deref().unwrap_or(&[]),
                            candidates[joiner].vector.as_deref().unwrap_or(&[]),
                        )
                    })
                    .fold(f32::INFINITY, f32::min);
                if min_sim >= duplicate_threshold {
                    cluster.push(joiner);
                    *score = score.min(min_sim);
                    clustered.insert(joiner);
                }
            }
            (true, true) => {}
        }
    }

    for (members, score) in clusters {
        let mut keys: Vec<String> = members
            .into_iter()
            .map(|m| candidates[m].key.clone())
            .collect();
        keys.sort_unstable();
        suggestions.push(CleanupSuggestion {
            keys,
            score,
            priority: CleanupPriority::from_score(score),
        });
    }

    suggestions.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.keys.cmp(&b.keys)));
    suggestions.truncate(max_suggestions);
    suggestions
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn item(key: &str, content: &str, vector: Option<Vec<f32>>) -> ScanItem {
        ScanItem {
            key: key.to_string(),
            content_hash: content_fingerprint(content),
            vector,
        }
    }

    #[test]
    fn fingerprint_normalises_whitespace_and_case() {
        assert_eq!(
            content_fingerprint("Likes  Strawberries"),
            content_fingerprint("likes strawberries")
        );
        assert_ne!(
            content_fingerprint("likes strawberries"),
            content_fingerprint("likes bananas")
        );
    }

    #[test]
    fn exact_duplicates_group_with_score_one() {
        let items = vec![
            item("memory_a", "likes strawberries", None),
            item("memory_b", "Likes Strawberries", None),
            item("memory_c", "something else", None),
        ];
        let suggestions = find_duplicate_clusters(&items, 0.90, 0.85, 20);
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].keys, vec!["memory_a", "memory_b"]);
        assert_eq!(suggestions[0].score, 1.0);
        assert_eq!(suggestions[0].priority, CleanupPriority::High);
    }

    #[test]
    fn near_pairs_bucket_by_similarity() {
        // cos([1,0], [0.92, 0.392]) ≈ 0.92 — medium.
        let items = vec![
            item("memory_a", "a", Some(vec![1.0, 0.0])),
            item("memory_b", "b", Some(vec![0.92, 0.392])),
        ];
        let suggestions = find_duplicate_clusters(&items, 0.90, 0.85, 20);
        assert_eq!(suggestions.len(), 1);
        assert!(suggestions[0].score > 0.90 && suggestions[0].score < 0.95);
        assert_eq!(suggestions[0].priority, CleanupPriority::Medium);
    }

    #[test]
    fn pairs_below_min_report_never_surface() {
        // cos ≈ 0.80 — below the 0.85 report floor.
        let items = vec![
            item("memory_a", "a", Some(vec![1.0, 0.0])),
            item("memory_b", "b", Some(vec![0.8, 0.6])),
        ];
        assert!(find_duplicate_clusters(&items, 0.90, 0.85, 20).is_empty());
    }

    #[test]
    fn complete_linkage_blocks_chained_merges() {
        // a–b and b–c are close, a–c is not: c must not join {a, b}.
        let items = vec![
            item("memory_a", "a", Some(vec![1.0, 0.0, 0.0])),
            item("memory_b", "b", Some(vec![0.96, 0.28, 0.0])),
            item("memory_c", "c", Some(vec![0.85, 0.52678, 0.0])),
        ];
        let suggestions = find_duplicate_clusters(&items, 0.95, 0.85, 20);
        assert!(!suggestions.is_empty());
        assert_eq!(suggestions[0].keys.len(), 2);
    }

    #[test]
    fn tight_triples_cluster_together() {
        let items = vec![
            item("memory_a", "a", Some(vec![1.0, 0.0])),
            item("memory_b", "b", Some(vec![0.999, 0.0447])),
            item("memory_c", "c", Some(vec![0.998, 0.0632])),
        ];
        let suggestions = find_duplicate_clusters(&items, 0.95, 0.85, 20);
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].keys.len(), 3);
        assert_eq!(suggestions[0].priority, CleanupPriority::High);
    }

    #[test]
    fn output_is_capped() {
        let mut items = Vec::new();
        for i in 0..10 {
            // Five disjoint exact-duplicate pairs.
            items.push(item(&format!("memory_{i}a"), &format!("content {i}"), None));
            items.push(item(&format!("memory_{i}b"), &format!("content {i}"), None));
        }
        let suggestions = find_duplicate_clusters(&items, 0.90, 0.85, 3);
        assert_eq!(suggestions.len(), 3);
    }
}
