//! Hunk ordering strategies.
//!
//! The first hunk carries the import machinery and the continuation
//! chain into the entry point, so every sorter leaves it pinned in
//! place and permutes the rest.
//!
//! The heuristic sorter is deterministic: code before data before
//! uninitialised, then coarser alignment first, then larger first,
//! then by name. The explicit sorter replays an order recorded in a
//! reuse file, with unknown hunks falling to a heuristic tail. The
//! empirical sorter measures actual coded sizes under the current
//! model lists and keeps any permutation that helps; it is seeded from
//! a fixed constant and therefore repeatable.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::compress;
use crate::hunklist::HunkList;
use crate::hunk::{Hunk, HUNK_IS_CODE};
use crate::modellist::{ModelList1k, ModelList4k};
use crate::progress::Progress;
use crate::reuse::Reuse;
use crate::transform::CallTransform;

/// Seed of the empirical search; fixed so results are reproducible.
const EMPIRICAL_SEED: u64 = 0x7065_7061_636b_0001;

/// Hard ceiling on empirical attempts, as a multiple of `tries`.
const EMPIRICAL_CAP_FACTOR: usize = 16;

fn class_rank(hunk: &Hunk) -> u32 {
    if hunk.raw_size() == 0 {
        2
    } else if hunk.flags & HUNK_IS_CODE != 0 {
        0
    } else {
        1
    }
}

fn heuristic_key(hunk: &Hunk) -> (u32, std::cmp::Reverse<u32>, std::cmp::Reverse<usize>, String) {
    (
        class_rank(hunk),
        std::cmp::Reverse(hunk.alignment_bits()),
        std::cmp::Reverse(hunk.virtual_size()),
        hunk.name().to_string(),
    )
}

/// Deterministic flag-driven order.
pub fn heuristic_sort(pool: &mut HunkList) {
    if pool.len() < 3 {
        return;
    }
    let mut order: Vec<usize> = (1..pool.len()).collect();
    order.sort_by_key(|&i| heuristic_key(&pool[i]));
    let mut full = vec![0];
    full.extend(order);
    pool.reorder(&full);
}

/// Replays the hunk order recorded in a reuse file. Hunks the record
/// does not mention keep their heuristic order at the tail.
pub fn explicit_sort(pool: &mut HunkList, reuse: &Reuse) {
    heuristic_sort(pool);
    if pool.len() < 3 {
        return;
    }
    let mut order: Vec<usize> = Vec::with_capacity(pool.len());
    order.push(0);
    let mut used = vec![false; pool.len()];
    used[0] = true;
    for name in reuse.hunk_order() {
        if let Some(i) = pool.position(name) {
            if !used[i] {
                used[i] = true;
                order.push(i);
            }
        }
    }
    for i in 1..pool.len() {
        if !used[i] {
            order.push(i);
        }
    }
    pool.reorder(&order);
}

/// Everything the empirical sorter needs to price one candidate order.
pub struct EmpiricalContext<'a> {
    pub transform: &'a CallTransform,
    pub models_code: &'a ModelList4k,
    pub models_data: &'a ModelList4k,
    pub models_1k: &'a ModelList1k,
    pub baseprob: u32,
    pub saturate: bool,
    pub tiny_mode: bool,
}

/// Coded size of the pool in its current order, in 1/4096 bits, plus
/// the per-segment sizes for the caller to use as search targets.
fn measure(pool: &HunkList, ctx: &EmpiricalContext) -> (u64, u64, u64) {
    let (mut flat, placements) = pool.flatten("ordered");
    let split = HunkList::split_point(&placements);
    // Resolve what resolves; unresolved references keep their addends,
    // which prices every candidate order the same way.
    crate::hunklist::relocate_lenient(&mut flat, crate::CODE_BASE);
    ctx.transform.transform_only(&mut flat, split);
    if ctx.tiny_mode {
        let size = compress::evaluate_size_1k(flat.data(), ctx.models_1k);
        (size, size, 0)
    } else {
        let sizes = [split, flat.raw_size() - split];
        let (total, per_segment) = compress::evaluate_size_4k(
            flat.data(),
            &sizes,
            &[ctx.models_code, ctx.models_data],
            ctx.baseprob,
            ctx.saturate,
            None,
        );
        (total, per_segment[0], per_segment[1])
    }
}

/// Random swap-and-keep-if-better descent over the hunk order. Stops
/// after `tries` attempts in a row without improvement, or after a
/// global cap. Returns the coded sizes of the code and data segments
/// under the final order.
pub fn empirical_sort(
    pool: &mut HunkList,
    ctx: &EmpiricalContext,
    tries: u32,
    progress: &dyn Progress,
) -> (u64, u64) {
    let (_, mut best_code, mut best_data) = measure(pool, ctx);
    if tries == 0 || pool.len() < 3 {
        return (best_code, best_data);
    }
    progress.begin_task("Reordering sections");
    let mut best_total = best_code + best_data;
    let mut rng = StdRng::seed_from_u64(EMPIRICAL_SEED);
    let mut failures = 0u32;
    let cap = tries as usize * EMPIRICAL_CAP_FACTOR;
    let mut attempts = 0;
    while failures < tries && attempts < cap {
        attempts += 1;
        progress.update(attempts, cap);
        let order = random_permutation_step(pool.len(), &mut rng);
        pool.reorder(&order);
        let (total, code, data) = measure(pool, ctx);
        if total < best_total {
            best_total = total;
            best_code = code;
            best_data = data;
            failures = 0;
        } else {
            // Revert: the step is its own inverse for swaps; moves need
            // the recorded inverse.
            pool.reorder(&invert_permutation(&order));
            failures += 1;
        }
    }
    progress.end_task();
    (best_code, best_data)
}

/// Either swaps two hunks or moves one hunk to another position, never
/// touching index 0.
fn random_permutation_step(len: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    if rng.gen_bool(0.5) {
        let a = rng.gen_range(1..len);
        let b = rng.gen_range(1..len);
        order.swap(a, b);
    } else {
        let from = rng.gen_range(1..len);
        let to = rng.gen_range(1..len);
        let hunk = order.remove(from);
        order.insert(to, hunk);
    }
    order
}

fn invert_permutation(order: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0; order.len()];
    for (i, &o) in order.iter().enumerate() {
        inverse[o] = i;
    }
    inverse
}
