//! Shard router (C8): rendezvous hashing over the live EG set. Deterministic
//! given (cache_key, healthy set); no rebalance traffic on membership change
//! (§4.7). Hashing reuses xxhash-rust the way C2 does, keeping the crate's
//! hashing story to one library.

use xxhash_rust::xxh64::xxh64;

/// Ordered owner list for `cache_key` over `healthy_eg_ids` (already sorted,
/// per C7). The first `replication_factor` entries by descending rendezvous
/// score are owners; `[0]` is primary. Ties break lexicographically by id —
/// guaranteed here by stable-sorting on `(score desc, id asc)`.
pub fn owners(cache_key: &str, healthy_eg_ids: &[String], replication_factor: usize) -> Vec<String> {
    let mut scored: Vec<(u64, &str)> = healthy_eg_ids
        .iter()
        .map(|id| (score(id, cache_key), id.as_str()))
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

    scored
        .into_iter()
        .take(replication_factor.max(1))
        .map(|(_, id)| id.to_string())
        .collect()
}

fn score(eg_id: &str, cache_key: &str) -> u64 {
    let combined = format!("{eg_id}\u{0}{cache_key}");
    xxh64(combined.as_bytes(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_list_is_deterministic_for_fixed_input() {
        let egs = vec!["eg-a".to_string(), "eg-b".to_string(), "eg-c".to_string()];
        let o1 = owners("cache:1:1:abc", &egs, 2);
        let o2 = owners("cache:1:1:abc", &egs, 2);
        assert_eq!(o1, o2);
        assert_eq!(o1.len(), 2);
    }

    #[test]
    fn adding_an_eg_displaces_at_most_one_owner() {
        let before = vec!["eg-a".to_string(), "eg-b".to_string(), "eg-c".to_string()];
        let after = vec![
            "eg-a".to_string(),
            "eg-b".to_string(),
            "eg-c".to_string(),
            "eg-d".to_string(),
        ];

        for key in ["cache:1:1:aaa", "cache:1:1:bbb", "cache:1:1:ccc", "cache:1:1:ddd"] {
            let owners_before = owners(key, &before, 2);
            let owners_after = owners(key, &after, 2);
            let displaced = owners_before
                .iter()
                .filter(|id| !owners_after.contains(id))
                .count();
            assert!(displaced <= 1, "key {key} displaced {displaced} owners");
        }
    }

    #[test]
    fn replication_factor_is_clamped_to_available_egs() {
        let egs = vec!["eg-a".to_string()];
        let o = owners("cache:1:1:abc", &egs, 3);
        assert_eq!(o, vec!["eg-a".to_string()]);
    }
}
