//! Variant allocation: fixed bucket sizes and a stable member → variant map.
//!
//! Bucket sizes depend only on `(total_audience, variant_count)`. Members are
//! placed by MurmurHash3 of `"{experiment_id}:{member_id}"`, so re-running the
//! allocation for an audit reproduces the same split.

use std::collections::HashSet;

use super::config::{Allocation, MemberMap, MAX_VARIANTS, MIN_VARIANTS};
use crate::error::{ExperimentError, Result};

/// Splits `total_audience` into `variant_count` buckets, as even as integer
/// division allows. The remainder goes one extra member each to the lowest
/// indices.
pub fn allocate(total_audience: u64, variant_count: usize) -> Result<Vec<u64>> {
    if !(MIN_VARIANTS..=MAX_VARIANTS).contains(&variant_count) {
        return Err(ExperimentError::InvalidVariantCount(variant_count));
    }
    let count = variant_count as u64;
    if total_audience < count {
        return Err(ExperimentError::AudienceTooSmall {
            audience: total_audience,
            variants: variant_count,
        });
    }
    let base = total_audience / count;
    let remainder = total_audience % count;
    Ok((0..count).map(|i| base + u64::from(i < remainder)).collect())
}

/// Builds the frozen allocation for an experiment that is being started.
/// When `members` is given it must be exactly the resolved audience; the
/// returned map is empty otherwise.
pub fn build_allocation(
    experiment_id: &str,
    total_audience: u64,
    variant_count: usize,
    members: Option<&[String]>,
) -> Result<(Allocation, MemberMap)> {
    let buckets = allocate(total_audience, variant_count)?;
    let members = match members {
        Some(members) if !members.is_empty() => {
            partition_members(experiment_id, &buckets, members)?
        }
        _ => MemberMap::new(),
    };
    let allocation = Allocation {
        buckets,
        frozen_members: members.len() as u64,
    };
    Ok((allocation, members))
}

/// Cuts a resolved member batch into the bucket sizes exactly. Members are
/// ranked by hash, so the outcome does not depend on input order.
pub fn partition_members(
    experiment_id: &str,
    buckets: &[u64],
    members: &[String],
) -> Result<MemberMap> {
    let total: u64 = buckets.iter().sum();
    if members.len() as u64 != total {
        return Err(ExperimentError::Validation(format!(
            "member list has {} entries but totalAudience is {}",
            members.len(),
            total
        )));
    }
    let mut seen = HashSet::with_capacity(members.len());
    for member in members {
        if member.is_empty() {
            return Err(ExperimentError::Validation(
                "member ids must not be empty".to_string(),
            ));
        }
        if !seen.insert(member.as_str()) {
            return Err(ExperimentError::Validation(format!(
                "duplicate member id '{member}'"
            )));
        }
    }

    let mut ranked: Vec<(u64, &str)> = members
        .iter()
        .map(|m| (member_hash(experiment_id, m), m.as_str()))
        .collect();
    ranked.sort_unstable();

    let mut assignments = MemberMap::new();
    let mut ranked = ranked.into_iter();
    for (variant_index, &size) in buckets.iter().enumerate() {
        for (_, member) in ranked.by_ref().take(size as usize) {
            assignments.insert(member.to_string(), variant_index);
        }
    }
    Ok(assignments)
}

/// Maps a member onto the cumulative bucket boundaries by hash. Used when no
/// explicit member batch was frozen at start.
pub fn variant_for_member(experiment_id: &str, member_id: &str, buckets: &[u64]) -> usize {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }
    let slot = member_hash(experiment_id, member_id) % total;
    let mut upper = 0;
    for (index, &size) in buckets.iter().enumerate() {
        upper += size;
        if slot < upper {
            return index;
        }
    }
    buckets.len().saturating_sub(1)
}

impl Allocation {
    pub fn has_member_map(&self) -> bool {
        self.frozen_members > 0
    }

    /// Hash-slot variant for `member_id`. Only meaningful when no member map
    /// was frozen at start.
    pub fn slot_for(&self, experiment_id: &str, member_id: &str) -> usize {
        variant_for_member(experiment_id, member_id, &self.buckets)
    }
}

fn member_hash(experiment_id: &str, member_id: &str) -> u64 {
    let key = format!("{experiment_id}:{member_id}");
    murmurhash3_128(key.as_bytes(), 0).0
}

/// MurmurHash3_x64_128. Returns (h1, h2); h1 is used for placement.
pub(crate) fn murmurhash3_128(data: &[u8], seed: u64) -> (u64, u64) {
    const C1: u64 = 0x87c37b91114253d5;
    const C2: u64 = 0x4cf5ad432745937f;

    let mut h1 = seed;
    let mut h2 = seed;

    let mut blocks = data.chunks_exact(16);
    for block in blocks.by_ref() {
        let k1 = read_u64_le(&block[..8])
            .wrapping_mul(C1)
            .rotate_left(31)
            .wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1
            .rotate_left(27)
            .wrapping_add(h2)
            .wrapping_mul(5)
            .wrapping_add(0x52dce729);

        let k2 = read_u64_le(&block[8..])
            .wrapping_mul(C2)
            .rotate_left(33)
            .wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2
            .rotate_left(31)
            .wrapping_add(h1)
            .wrapping_mul(5)
            .wrapping_add(0x38495ab5);
    }

    let tail = blocks.remainder();
    if tail.len() > 8 {
        let k2 = read_u64_le(&tail[8..])
            .wrapping_mul(C2)
            .rotate_left(33)
            .wrapping_mul(C1);
        h2 ^= k2;
    }
    if !tail.is_empty() {
        let k1 = read_u64_le(&tail[..tail.len().min(8)])
            .wrapping_mul(C1)
            .rotate_left(31)
            .wrapping_mul(C2);
        h1 ^= k1;
    }

    let len = data.len() as u64;
    h1 ^= len;
    h2 ^= len;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix64(h1);
    h2 = fmix64(h2);
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    (h1, h2)
}

/// Little-endian read of up to 8 bytes, zero-padded.
fn read_u64_le(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, &b)| acc | (b as u64) << (8 * i))
}

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51afd7ed558ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ceb9fe1a85ec53);
    k ^= k >> 33;
    k
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("member-{i}")).collect()
    }

    #[test]
    fn allocate_1000_into_two_is_even() {
        assert_eq!(allocate(1000, 2).unwrap(), vec![500, 500]);
    }

    #[test]
    fn allocate_gives_remainder_to_first_variants() {
        assert_eq!(allocate(10, 3).unwrap(), vec![4, 3, 3]);
        assert_eq!(allocate(11, 4).unwrap(), vec![3, 3, 3, 2]);
    }

    #[test]
    fn allocate_sums_exactly_and_stays_within_one_for_all_inputs() {
        for variant_count in 2..=4usize {
            for total in variant_count as u64..=500 {
                let buckets = allocate(total, variant_count).unwrap();
                assert_eq!(buckets.len(), variant_count);
                assert_eq!(buckets.iter().sum::<u64>(), total);
                let floor = total / variant_count as u64;
                assert!(
                    buckets.iter().all(|&b| b == floor || b == floor + 1),
                    "total={total} count={variant_count} buckets={buckets:?}"
                );
                assert_eq!(buckets, allocate(total, variant_count).unwrap());
            }
        }
    }

    #[test]
    fn allocate_rejects_bad_variant_counts() {
        for count in [0usize, 1, 5, 9] {
            assert!(matches!(
                allocate(1000, count),
                Err(ExperimentError::InvalidVariantCount(c)) if c == count
            ));
        }
    }

    #[test]
    fn allocate_rejects_audience_smaller_than_variant_count() {
        assert!(matches!(
            allocate(2, 3),
            Err(ExperimentError::AudienceTooSmall {
                audience: 2,
                variants: 3
            })
        ));
        assert!(allocate(3, 3).is_ok());
    }

    #[test]
    fn partition_matches_bucket_sizes_exactly() {
        let buckets = allocate(101, 3).unwrap();
        let assignments = partition_members("exp-1", &buckets, &members(101)).unwrap();
        assert_eq!(assignments.len(), 101);
        for (index, &size) in buckets.iter().enumerate() {
            let count = assignments.values().filter(|&&v| v == index).count() as u64;
            assert_eq!(count, size, "variant {index}");
        }
    }

    #[test]
    fn partition_is_independent_of_input_order() {
        let buckets = allocate(50, 2).unwrap();
        let forward = members(50);
        let mut reversed = forward.clone();
        reversed.reverse();
        assert_eq!(
            partition_members("exp-1", &buckets, &forward).unwrap(),
            partition_members("exp-1", &buckets, &reversed).unwrap()
        );
    }

    #[test]
    fn partition_rejects_size_mismatch_and_duplicates() {
        let buckets = allocate(4, 2).unwrap();
        assert!(partition_members("e", &buckets, &members(3)).is_err());
        let dup = vec!["a".to_string(), "b".to_string(), "a".to_string(), "c".to_string()];
        assert!(matches!(
            partition_members("e", &buckets, &dup),
            Err(ExperimentError::Validation(_))
        ));
    }

    #[test]
    fn variant_for_member_is_stable_and_roughly_proportional() {
        let buckets = allocate(30_000, 3).unwrap();
        let mut counts = [0u64; 3];
        for i in 0..30_000 {
            let member = format!("u{i}");
            let first = variant_for_member("exp-x", &member, &buckets);
            assert_eq!(first, variant_for_member("exp-x", &member, &buckets));
            counts[first] += 1;
        }
        for count in counts {
            let share = count as f64 / 30_000.0;
            assert!((share - 1.0 / 3.0).abs() < 0.02, "share was {share}");
        }
    }

    #[test]
    fn allocation_with_members_records_map_size_only() {
        let (allocation, map) = build_allocation("exp-1", 4, 2, Some(&members(4))).unwrap();
        assert_eq!(allocation.frozen_members, 4);
        assert!(allocation.has_member_map());
        assert_eq!(map.len(), 4);
        let json = serde_json::to_string(&allocation).unwrap();
        assert!(!json.contains("member-"), "{json}");
    }

    #[test]
    fn allocation_without_members_uses_hash_slots() {
        let (allocation, map) = build_allocation("exp-1", 1000, 4, None).unwrap();
        assert!(map.is_empty());
        assert!(!allocation.has_member_map());
        assert!(allocation.slot_for("exp-1", "anyone") < 4);
    }

    #[test]
    fn murmurhash3_128_known_vector_empty() {
        assert_eq!(murmurhash3_128(b"", 0), (0, 0));
    }

    #[test]
    fn murmurhash3_128_matches_reference_implementation() {
        // Python mmh3.hash_bytes(b"Hello, world!", seed=0) as two little-endian u64s
        let (h1, h2) = murmurhash3_128(b"Hello, world!", 0);
        assert_eq!(h1, 0xf1512dd1d2d665df);
        assert_eq!(h2, 0x2c326650a8f3c564);
    }

    #[test]
    fn murmurhash3_128_handles_block_and_tail_lengths() {
        let data: Vec<u8> = (0u8..40).collect();
        for len in 0..data.len() {
            assert_eq!(
                murmurhash3_128(&data[..len], 7),
                murmurhash3_128(&data[..len], 7)
            );
        }
        assert_ne!(murmurhash3_128(&data[..17], 0), murmurhash3_128(&data[..18], 0));
    }

    #[test]
    fn murmurhash3_128_different_seeds_differ() {
        assert_ne!(
            murmurhash3_128(b"same-input", 0).0,
            murmurhash3_128(b"same-input", 42).0
        );
    }
}
