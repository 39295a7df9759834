//! Search over context-table sizes.
//!
//! The runtime counter table is loaded by the depacker, so a bigger
//! table is free at run time but a smaller one costs bits to collision
//! noise. Starting from the configured size, candidates are generated
//! by repeatedly halving to the previous prime (doubled back to an even
//! byte count), each candidate is compressed once against the cached
//! hash bits, and the best is kept. Trials are independent and run on a
//! worker pool; every worker owns its scratch tables and only the
//! progress counter is shared.

use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;

use crate::compress::{self, HashBits};
use crate::progress::Progress;

/// Returns the largest prime strictly below `n`, or 1 when there is
/// none.
pub fn previous_prime(n: u32) -> u32 {
    let mut candidate = match n {
        0..=2 => return 1,
        3 => return 2,
        _ => (n - 1) | 1,
    };
    // n-1 may equal n-1|1 == n when n is even; start below n.
    if candidate >= n {
        candidate -= 2;
    }
    loop {
        let mut divisor = 3;
        let mut composite = candidate % 2 == 0;
        while !composite && divisor * divisor <= candidate {
            composite = candidate % divisor == 0;
            divisor += 2;
        }
        if !composite {
            return candidate;
        }
        if candidate < 3 {
            return 1;
        }
        candidate -= 2;
    }
}

/// Runs `tries` trials and returns the winning table size in bytes
/// together with its coded size. Ties go to the smaller table. With
/// zero tries the starting size is returned unchallenged.
pub fn optimize_hash_size(
    hash_bits: &[HashBits],
    start_hashsize: u32,
    tries: u32,
    saturate: bool,
    baseprob: u32,
    progress: &dyn Progress,
) -> (u32, Option<u64>) {
    if tries == 0 {
        return (start_hashsize, None);
    }
    progress.begin_task("Optimizing hash table size");
    let mut candidates = Vec::with_capacity(tries as usize);
    let mut hashsize = start_hashsize;
    for _ in 0..tries {
        hashsize = previous_prime(hashsize / 2).saturating_mul(2).max(4);
        candidates.push(hashsize);
    }
    let done = AtomicUsize::new(0);
    let sizes: Vec<u64> = candidates
        .par_iter()
        .map_init(
            || compress::make_scratch(hash_bits),
            |scratch, &hashsize| {
                let size = compress::compress_from_hash_bits(
                    hash_bits, scratch, saturate, baseprob, hashsize,
                );
                let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                progress.update(n, tries as usize);
                size
            },
        )
        .collect();
    // Merge serially in candidate order; `<=` keeps the later (and
    // therefore smaller) table on ties.
    let mut best_hashsize = start_hashsize;
    let mut best_size = u64::MAX;
    for (&hashsize, &size) in candidates.iter().zip(&sizes) {
        if size <= best_size {
            best_size = size;
            best_hashsize = hashsize;
        }
    }
    progress.end_task();
    (best_hashsize, Some(best_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::BASE_PROB;
    use crate::modelsearch::instant_models_4k;
    use crate::progress::NullProgress;

    #[test]
    fn test_previous_prime() {
        assert_eq!(previous_prime(10), 7);
        assert_eq!(previous_prime(8), 7);
        assert_eq!(previous_prime(7), 5);
        assert_eq!(previous_prime(3), 2);
        assert_eq!(previous_prime(2), 1);
        assert_eq!(previous_prime(0), 1);
        assert_eq!(previous_prime(1000), 997);
        assert_eq!(previous_prime(997), 991);
        assert_eq!(previous_prime(1 << 20), 1048573);
    }

    fn sample_hash_bits() -> Vec<crate::compress::HashBits> {
        let mut data = Vec::new();
        for i in 0..128u8 {
            data.extend_from_slice(&[0x89, 0x45, i, 0x8b, 0x45, i]);
        }
        let list = instant_models_4k();
        compress::compute_hash_bits(&data, &[data.len()], &[&list])
    }

    #[test]
    fn test_zero_tries_keeps_start() {
        let hb = sample_hash_bits();
        let (best, size) = optimize_hash_size(&hb, 1 << 16, 0, false, BASE_PROB, &NullProgress);
        assert_eq!(best, 1 << 16);
        assert!(size.is_none());
    }

    #[test]
    fn test_determinism() {
        // Repeated runs over the same input pick the same size.
        let hb = sample_hash_bits();
        let a = optimize_hash_size(&hb, 1 << 16, 8, false, BASE_PROB, &NullProgress);
        let b = optimize_hash_size(&hb, 1 << 16, 8, false, BASE_PROB, &NullProgress);
        assert_eq!(a, b);
    }

    #[test]
    fn test_choice_is_monotone() {
        // The winner's coded size is no larger than any candidate's.
        let hb = sample_hash_bits();
        let tries = 6;
        let (best, best_size) =
            optimize_hash_size(&hb, 1 << 16, tries, false, BASE_PROB, &NullProgress);
        let best_size = best_size.unwrap();
        let mut scratch = compress::make_scratch(&hb);
        let mut hashsize: u32 = 1 << 16;
        let mut seen_best = false;
        for _ in 0..tries {
            hashsize = previous_prime(hashsize / 2).saturating_mul(2).max(4);
            let size =
                compress::compress_from_hash_bits(&hb, &mut scratch, false, BASE_PROB, hashsize);
            assert!(size >= best_size, "candidate {} beats winner", hashsize);
            if hashsize == best {
                assert_eq!(size, best_size);
                seen_best = true;
            }
        }
        assert!(seen_best);
    }
}
