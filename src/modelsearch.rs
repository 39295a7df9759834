//! Search for good model sets.
//!
//! The multi-model search starts from a built-in eight-model list and
//! greedily tries mask additions, removals and weight perturbations,
//! keeping any change that lowers the exact coded size of the segment.
//! The effort tier bounds the number of improvement rounds. The
//! single-model search is a coordinate descent over the four scalars of
//! the tiny coder.

use crate::compress;
use crate::modellist::{CompressionTier, Model, ModelList1k, ModelList4k};
use crate::progress::Progress;

/// The built-in starter list: the contiguous-history models of order
/// zero through seven, weighted by order.
pub fn instant_models_4k() -> ModelList4k {
    let mut list = ModelList4k::new();
    for order in 0..8u8 {
        list.push(Model {
            weight: order,
            mask: (1u16 << order) as u8 - 1,
        });
    }
    list
}

fn rounds_for_tier(tier: CompressionTier) -> usize {
    match tier {
        CompressionTier::Instant => 0,
        CompressionTier::Fast => 1,
        CompressionTier::Slow => 3,
        CompressionTier::VerySlow => 8,
    }
}

/// Evaluates one candidate list over a segment embedded in `data` at
/// `[start, start + len)`; preceding bytes provide the context seed.
fn evaluate(
    data: &[u8],
    start: usize,
    len: usize,
    list: &ModelList4k,
    saturate: bool,
    baseprob: u32,
) -> u64 {
    // A data segment is measured behind the code segment so its
    // context seed is the real preceding bytes. The leading bytes are
    // coded under the fixed starter list and their cost discarded, so
    // every candidate sees the identical warmed-up state.
    if start == 0 {
        let (_, sizes) = compress::evaluate_size_4k(
            &data[..len],
            &[len],
            &[list],
            baseprob,
            saturate,
            None,
        );
        sizes[0]
    } else {
        let leading = instant_models_4k();
        let (_, sizes) = compress::evaluate_size_4k(
            &data[..start + len],
            &[start, len],
            &[&leading, list],
            baseprob,
            saturate,
            None,
        );
        sizes[1]
    }
}

/// Returns true when `candidate` beats `best`: smaller size, or equal
/// size with fewer models, or equal on both with lexicographically
/// smaller masks.
fn better(candidate: (u64, &ModelList4k), best: (u64, &ModelList4k)) -> bool {
    let (c_size, c_list) = candidate;
    let (b_size, b_list) = best;
    if c_size != b_size {
        return c_size < b_size;
    }
    if c_list.len() != b_list.len() {
        return c_list.len() < b_list.len();
    }
    let c_masks: Vec<u8> = c_list.models().iter().map(|m| m.mask).collect();
    let b_masks: Vec<u8> = b_list.models().iter().map(|m| m.mask).collect();
    c_masks < b_masks
}

/// Searches for a model list minimising the coded size of the segment
/// `data[start..start + len]`. Returns the list and its size.
pub fn approximate_models_4k(
    data: &[u8],
    start: usize,
    len: usize,
    tier: CompressionTier,
    saturate: bool,
    baseprob: u32,
    progress: &dyn Progress,
) -> (ModelList4k, u64) {
    let mut best = instant_models_4k();
    if len == 0 {
        best.size = 0;
        return (best, 0);
    }
    let mut best_size = evaluate(data, start, len, &best, saturate, baseprob);
    let rounds = rounds_for_tier(tier);
    // Additions sweep all 256 masks; tweaks visit each model three
    // times (weight up, weight down, removal).
    let total_steps = rounds * (256 + 3 * 32) + 1;
    let mut step = 0;
    progress.update(step, total_steps);
    for _ in 0..rounds {
        // Addition sweep: try every unused mask at every viable weight
        // next to the current maximum.
        let mut improved = false;
        for mask in 0..=255u8 {
            step += 1;
            progress.update(step.min(total_steps), total_steps);
            if best.contains_mask(mask) {
                continue;
            }
            let mut weight_candidates = vec![0u8];
            let max = best.max_weight();
            if max > 0 {
                weight_candidates.push(max / 2);
                weight_candidates.push(max);
            }
            for &weight in &weight_candidates {
                let mut candidate = best.clone();
                candidate.push(Model { weight, mask });
                if !candidate.fits_weight_mask() {
                    continue;
                }
                let size = evaluate(data, start, len, &candidate, saturate, baseprob);
                if better((size, &candidate), (best_size, &best)) {
                    best = candidate;
                    best_size = size;
                    improved = true;
                }
            }
        }
        // Tweak sweep: per model, nudge the weight and try dropping it.
        let mut index = 0;
        while index < best.len() {
            step += 3;
            progress.update(step.min(total_steps), total_steps);
            let model = best[index];
            let mut candidates = Vec::new();
            if model.weight < 31 {
                let mut up = best.clone();
                up[index].weight += 1;
                if up.fits_weight_mask() {
                    candidates.push(up);
                }
            }
            if model.weight > 0 {
                let mut down = best.clone();
                down[index].weight -= 1;
                candidates.push(down);
            }
            {
                let mut dropped = best.clone();
                dropped.remove(index);
                if !dropped.is_empty() {
                    candidates.push(dropped);
                }
            }
            let mut replaced = false;
            for candidate in candidates {
                let size = evaluate(data, start, len, &candidate, saturate, baseprob);
                if better((size, &candidate), (best_size, &best)) {
                    best = candidate;
                    best_size = size;
                    improved = true;
                    replaced = true;
                    break;
                }
            }
            if !replaced {
                index += 1;
            }
        }
        if !improved {
            break;
        }
    }
    progress.update(total_steps, total_steps);
    best.size = best_size;
    (best, best_size)
}

/// Coordinate descent over the scalars of the tiny coder.
pub fn approximate_models_1k(
    data: &[u8],
    progress: &dyn Progress,
) -> (ModelList1k, u64) {
    let mut best = ModelList1k::new();
    let mut best_size = compress::evaluate_size_1k(data, &best);
    const BOOSTS: [u32; 6] = [2, 4, 6, 8, 12, 16];
    const BASEPROBS: [u32; 7] = [1, 2, 4, 6, 8, 16, 32];
    let total_steps = 2 * (32 + BOOSTS.len() + 2 * BASEPROBS.len()) + 1;
    let mut step = 0;
    progress.update(step, total_steps);
    for _ in 0..2 {
        let mut improved = false;
        for bit in 0..32 {
            step += 1;
            progress.update(step.min(total_steps), total_steps);
            let candidate = ModelList1k {
                modelmask: best.modelmask ^ (1 << bit),
                ..best
            };
            if candidate.modelmask == 0 {
                continue;
            }
            let size = compress::evaluate_size_1k(data, &candidate);
            if size < best_size {
                best = candidate;
                best_size = size;
                improved = true;
            }
        }
        for &boost in &BOOSTS {
            step += 1;
            progress.update(step.min(total_steps), total_steps);
            let candidate = ModelList1k { boost, ..best };
            let size = compress::evaluate_size_1k(data, &candidate);
            if size < best_size {
                best = candidate;
                best_size = size;
                improved = true;
            }
        }
        for &baseprob in &BASEPROBS {
            step += 2;
            progress.update(step.min(total_steps), total_steps);
            for candidate in [
                ModelList1k { baseprob0: baseprob, ..best },
                ModelList1k { baseprob1: baseprob, ..best },
            ] {
                let size = compress::evaluate_size_1k(data, &candidate);
                if size < best_size {
                    best = candidate;
                    best_size = size;
                    improved = true;
                }
            }
        }
        if !improved {
            break;
        }
    }
    progress.update(total_steps, total_steps);
    (best, best_size)
}
