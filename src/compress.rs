//! Context-mixing compression of a flat image.
//!
//! Every bit of the data is coded under a probability mixed from a set
//! of context models. A model is a bitmask selecting which of the
//! previous eight bytes participate in its context; the context key for
//! a bit is the masked history combined with the already-coded high
//! bits of the current byte. Each key owns a pair of saturating
//! occurrence counters, and a model with counters `(n0, n1)` and weight
//! `w` contributes `(n0 + baseprob) << w` to the zero side of the mix
//! and `(n1 + baseprob) << w` to the one side.
//!
//! The multi-model coder stores counters in a fixed-size table indexed
//! by hash modulo the table size, with no key verification: colliding
//! contexts share counters, which costs bits. That is the same table
//! the runtime depacker uses, so the compile-time simulation and the
//! runtime agree. Exact (collision-free) counting is used for size
//! estimation during the model search, where no runtime table exists
//! yet.
//!
//! The single-model variant used with the tiny header mixes a fixed
//! family of sparse contexts over the previous five bytes, selected by
//! a 32-bit model mask; see `ModelList1k`.

use crate::aritcode::{self, AritCoder, AritDecoder};
use crate::modellist::{ModelList1k, ModelList4k, MAX_CONTEXT_LENGTH};

/// Additive floor applied to every counter in the multi-model mix.
pub const BASE_PROB: u32 = 1;

/// Hashes a masked history window. The mask takes part in the hash so
/// that models with different masks address different counters even
/// when the selected bytes agree.
#[inline]
fn hash_context(history: &[u8; MAX_CONTEXT_LENGTH], mask: u8) -> u32 {
    let mut h = (u32::from(mask) + 1).wrapping_mul(0x9e37_79b9);
    let mut m = mask;
    while m != 0 {
        let i = m.trailing_zeros() as usize;
        m &= m - 1;
        h = (h ^ u32::from(history[i])).wrapping_mul(0x0100_0193);
        h ^= h >> 15;
    }
    h
}

/// Mixes the per-position hash with the bit path inside the current
/// byte. `partial` carries the already-coded high bits plus a marker
/// bit, so every (bit index, bit prefix) pair is distinct.
#[inline]
fn combine(h: u32, partial: u32) -> u32 {
    h ^ partial.wrapping_mul(0x9e37_79b9)
}

#[inline]
fn bump(counts: &mut [u8; 2], bit: usize, saturate: bool) {
    if saturate {
        if counts[bit] < 255 {
            counts[bit] += 1;
        }
    } else {
        // Keep the ratio when a counter tops out.
        if counts[bit] == 255 {
            counts[0] >>= 1;
            counts[1] >>= 1;
        }
        counts[bit] += 1;
    }
}

#[inline]
fn push_history(history: &mut [u8; MAX_CONTEXT_LENGTH], byte: u8) {
    for i in (1..MAX_CONTEXT_LENGTH).rev() {
        history[i] = history[i - 1];
    }
    history[0] = byte;
}

/// Open-addressed exact-match counter table, used where collision-free
/// counting is wanted. Keys are 32-bit context hashes; the rare 32-bit
/// hash collision merges two counters, which is harmless.
struct CounterTable {
    keys: Vec<u32>,
    counts: Vec<[u8; 2]>,
    used: usize,
}

impl CounterTable {
    fn new(expected: usize) -> Self {
        // Start modestly and grow on demand; a pathological guess must
        // not allocate gigabytes up front.
        let cap = (2 * expected.max(512)).next_power_of_two().min(1 << 22);
        Self {
            keys: vec![0; cap],
            counts: vec![[0, 0]; cap],
            used: 0,
        }
    }

    #[inline]
    fn slot(&self, key: u32) -> usize {
        let mask = self.keys.len() - 1;
        let mut i = key as usize & mask;
        loop {
            let k = self.keys[i];
            if k == key || k == 0 {
                return i;
            }
            i = (i + 1) & mask;
        }
    }

    #[inline]
    fn get(&self, key: u32) -> [u8; 2] {
        let key = key.max(1);
        self.counts[self.slot(key)]
    }

    #[inline]
    fn bump(&mut self, key: u32, bit: usize, saturate: bool) {
        let key = key.max(1);
        let i = self.slot(key);
        if self.keys[i] == 0 {
            self.keys[i] = key;
            self.used += 1;
            if self.used * 4 > self.keys.len() * 3 {
                self.grow();
                return self.bump(key, bit, saturate);
            }
        }
        bump(&mut self.counts[i], bit, saturate);
    }

    fn grow(&mut self) {
        let old_keys = std::mem::take(&mut self.keys);
        let old_counts = std::mem::take(&mut self.counts);
        self.keys = vec![0; old_keys.len() * 2];
        self.counts = vec![[0, 0]; old_keys.len() * 2];
        for (key, counts) in old_keys.into_iter().zip(old_counts) {
            if key != 0 {
                let i = self.slot(key);
                self.keys[i] = key;
                self.counts[i] = counts;
            }
        }
    }
}

/// Mixes the probability pair for one bit of the multi-model coder.
#[inline]
fn mix_4k<F: FnMut(usize) -> [u8; 2]>(
    list: &ModelList4k,
    baseprob: u32,
    mut lookup: F,
) -> (u32, u32) {
    let mut p0: u64 = 0;
    let mut p1: u64 = 0;
    for (mi, model) in list.models().iter().enumerate() {
        let [n0, n1] = lookup(mi);
        p0 += (u64::from(n0) + u64::from(baseprob)) << model.weight;
        p1 += (u64::from(n1) + u64::from(baseprob)) << model.weight;
    }
    aritcode::scale_probs(p0.max(1), p1.max(1))
}

fn segment_of(pos: usize, segment_sizes: &[usize]) -> usize {
    let mut end = 0;
    for (i, &size) in segment_sizes.iter().enumerate() {
        end += size;
        if pos < end {
            return i;
        }
    }
    segment_sizes.len() - 1
}

/// Estimates the coded size of `data` split into segments, each coded
/// with its own model list, using exact context counting. Returns the
/// total and the per-segment sizes, in 1/4096 bits. When `sizefill` is
/// given it receives `data.len() + 1` cumulative positions.
pub fn evaluate_size_4k(
    data: &[u8],
    segment_sizes: &[usize],
    lists: &[&ModelList4k],
    baseprob: u32,
    saturate: bool,
    mut sizefill: Option<&mut Vec<u32>>,
) -> (u64, Vec<u64>) {
    assert_eq!(segment_sizes.iter().sum::<usize>(), data.len());
    assert_eq!(segment_sizes.len(), lists.len());
    let max_models = lists.iter().map(|l| l.len()).max().unwrap_or(0);
    let mut table = CounterTable::new(data.len() * 8);
    let mut history = [0u8; MAX_CONTEXT_LENGTH];
    let mut per_segment = vec![0u64; lists.len()];
    let mut total: u64 = 0;
    if let Some(fill) = sizefill.as_deref_mut() {
        fill.clear();
        fill.push(0);
    }
    let mut model_hashes = vec![0u32; max_models];
    for (pos, &byte) in data.iter().enumerate() {
        let seg = segment_of(pos, segment_sizes);
        let list = lists[seg];
        for (mi, model) in list.models().iter().enumerate() {
            model_hashes[mi] = hash_context(&history, model.mask);
        }
        for bitidx in 0..8 {
            let bit = u32::from(byte >> (7 - bitidx)) & 1;
            let partial = (u32::from(byte) >> (8 - bitidx)) | (1 << bitidx);
            let (p0, p1) = mix_4k(list, baseprob, |mi| {
                table.get(combine(model_hashes[mi], partial))
            });
            let (right, wrong) = if bit != 0 { (p1, p0) } else { (p0, p1) };
            let cost = u64::from(aritcode::coded_size(right, wrong));
            per_segment[seg] += cost;
            total += cost;
            for mi in 0..list.len() {
                table.bump(combine(model_hashes[mi], partial), bit as usize, saturate);
            }
        }
        push_history(&mut history, byte);
        if let Some(fill) = sizefill.as_deref_mut() {
            fill.push(total.min(u64::from(u32::MAX)) as u32);
        }
    }
    (total, per_segment)
}

/// Runtime-style counter table: direct-indexed, colliding contexts
/// share counters.
struct RuntimeTable {
    counts: Vec<[u8; 2]>,
}

impl RuntimeTable {
    fn new(hashsize: u32) -> Self {
        Self {
            counts: vec![[0, 0]; (hashsize as usize / 2).max(2)],
        }
    }

    #[inline]
    fn index(&self, key: u32) -> usize {
        key as usize % self.counts.len()
    }
}

/// Compresses `data` with the multi-model coder against a table of
/// `hashsize` bytes. Returns the packed stream; `sizefill`, when given,
/// receives cumulative coded positions per input byte.
pub fn compress_4k(
    data: &[u8],
    segment_sizes: &[usize],
    lists: &[&ModelList4k],
    saturate: bool,
    baseprob: u32,
    hashsize: u32,
    mut sizefill: Option<&mut Vec<u32>>,
) -> Vec<u8> {
    assert_eq!(segment_sizes.iter().sum::<usize>(), data.len());
    let max_models = lists.iter().map(|l| l.len()).max().unwrap_or(0);
    let mut table = RuntimeTable::new(hashsize);
    let mut coder = AritCoder::new();
    let mut history = [0u8; MAX_CONTEXT_LENGTH];
    let mut model_hashes = vec![0u32; max_models];
    let mut estimate: u64 = 0;
    if let Some(fill) = sizefill.as_deref_mut() {
        fill.clear();
        fill.push(0);
    }
    for (pos, &byte) in data.iter().enumerate() {
        let seg = segment_of(pos, segment_sizes);
        let list = lists[seg];
        for (mi, model) in list.models().iter().enumerate() {
            model_hashes[mi] = hash_context(&history, model.mask);
        }
        for bitidx in 0..8 {
            let bit = u32::from(byte >> (7 - bitidx)) & 1;
            let partial = (u32::from(byte) >> (8 - bitidx)) | (1 << bitidx);
            let (p0, p1) = mix_4k(list, baseprob, |mi| {
                let i = table.index(combine(model_hashes[mi], partial));
                table.counts[i]
            });
            coder.code(p0, p1, bit);
            let (right, wrong) = if bit != 0 { (p1, p0) } else { (p0, p1) };
            estimate += u64::from(aritcode::coded_size(right, wrong));
            for mi in 0..list.len() {
                let i = table.index(combine(model_hashes[mi], partial));
                bump(&mut table.counts[i], bit as usize, saturate);
            }
        }
        push_history(&mut history, byte);
        if let Some(fill) = sizefill.as_deref_mut() {
            fill.push(estimate.min(u64::from(u32::MAX)) as u32);
        }
    }
    let (packed, _) = coder.finish();
    packed
}

/// Inverse of `compress_4k`; reconstructs the original data from the
/// packed stream, the segment sizes and the same coding parameters.
pub fn decompress_4k(
    packed: &[u8],
    segment_sizes: &[usize],
    lists: &[&ModelList4k],
    saturate: bool,
    baseprob: u32,
    hashsize: u32,
) -> Vec<u8> {
    let total_len: usize = segment_sizes.iter().sum();
    let max_models = lists.iter().map(|l| l.len()).max().unwrap_or(0);
    let mut table = RuntimeTable::new(hashsize);
    let mut dec = AritDecoder::new(packed);
    let mut history = [0u8; MAX_CONTEXT_LENGTH];
    let mut model_hashes = vec![0u32; max_models];
    let mut data = Vec::with_capacity(total_len);
    for pos in 0..total_len {
        let seg = segment_of(pos, segment_sizes);
        let list = lists[seg];
        for (mi, model) in list.models().iter().enumerate() {
            model_hashes[mi] = hash_context(&history, model.mask);
        }
        let mut byte = 0u8;
        for bitidx in 0..8 {
            // The bits decoded so far sit in the low end of `byte`, so
            // they already form the partial value the encoder used.
            let partial = u32::from(byte) | (1 << bitidx);
            let (p0, p1) = mix_4k(list, baseprob, |mi| {
                let i = table.index(combine(model_hashes[mi], partial));
                table.counts[i]
            });
            let bit = dec.decode(p0, p1);
            for mi in 0..list.len() {
                let i = table.index(combine(model_hashes[mi], partial));
                bump(&mut table.counts[i], bit as usize, saturate);
            }
            byte = (byte << 1) | bit as u8;
        }
        data.push(byte);
        push_history(&mut history, byte);
    }
    data
}

/// Cached per-bit hashing for one segment, shared by the repeated
/// trials of the hash-size optimizer. The cache is a pure function of
/// the segment bytes, the preceding context and the model masks.
pub struct HashBits {
    data: Vec<u8>,
    weights: Vec<u8>,
    /// Position-major: `hashes[pos * weights.len() + model]`.
    hashes: Vec<u32>,
    tiny_size: usize,
}

/// One slot of the optimizer's scratch table: a reduced context key
/// (offset by one so zero means empty) and its counters.
#[derive(Clone, Copy, Default)]
pub struct TinyHashEntry {
    key: u32,
    counts: [u8; 2],
}

/// Precomputes context hashes for every (position, model) pair of each
/// segment.
pub fn compute_hash_bits(
    data: &[u8],
    segment_sizes: &[usize],
    lists: &[&ModelList4k],
) -> Vec<HashBits> {
    assert_eq!(segment_sizes.iter().sum::<usize>(), data.len());
    let mut out = Vec::with_capacity(segment_sizes.len());
    let mut history = [0u8; MAX_CONTEXT_LENGTH];
    let mut start = 0;
    for (seg, &size) in segment_sizes.iter().enumerate() {
        let list = lists[seg];
        let nmodels = list.len();
        let mut hashes = Vec::with_capacity(size * nmodels);
        let segment = &data[start..start + size];
        for &byte in segment {
            for model in list.models() {
                hashes.push(hash_context(&history, model.mask));
            }
            push_history(&mut history, byte);
        }
        let tiny_size = (2 * size * 8 * nmodels.max(1))
            .next_power_of_two()
            .clamp(1 << 10, 1 << 23);
        out.push(HashBits {
            data: segment.to_vec(),
            weights: list.models().iter().map(|m| m.weight).collect(),
            hashes,
            tiny_size,
        });
        start += size;
    }
    out
}

/// Allocates per-thread scratch tables matching `hash_bits`.
pub fn make_scratch(hash_bits: &[HashBits]) -> Vec<Vec<TinyHashEntry>> {
    hash_bits
        .iter()
        .map(|hb| vec![TinyHashEntry::default(); hb.tiny_size])
        .collect()
}

/// Replays the cached hashes against a hypothetical runtime table of
/// `hashsize` bytes and returns the coded size in 1/4096 bits. Contexts
/// whose reduced keys collide share counters, exactly as they would in
/// the runtime table; the scratch tables only exist so the replay does
/// not have to allocate `hashsize` bytes per trial.
pub fn compress_from_hash_bits(
    hash_bits: &[HashBits],
    scratch: &mut [Vec<TinyHashEntry>],
    saturate: bool,
    baseprob: u32,
    hashsize: u32,
) -> u64 {
    let nslots = (hashsize as usize / 2).max(2) as u32;
    let mut total: u64 = 0;
    for (hb, tiny) in hash_bits.iter().zip(scratch.iter_mut()) {
        for entry in tiny.iter_mut() {
            *entry = TinyHashEntry::default();
        }
        let mask = tiny.len() - 1;
        let nmodels = hb.weights.len();
        let mut slots = vec![0usize; nmodels];
        for (pos, &byte) in hb.data.iter().enumerate() {
            let hashes = &hb.hashes[pos * nmodels..(pos + 1) * nmodels];
            for bitidx in 0..8 {
                let bit = u32::from(byte >> (7 - bitidx)) & 1;
                let partial = (u32::from(byte) >> (8 - bitidx)) | (1 << bitidx);
                let mut p0: u64 = 0;
                let mut p1: u64 = 0;
                for mi in 0..nmodels {
                    let reduced = combine(hashes[mi], partial) % nslots;
                    let stored = reduced + 1;
                    let mut i = reduced as usize & mask;
                    loop {
                        let k = tiny[i].key;
                        if k == stored || k == 0 {
                            break;
                        }
                        i = (i + 1) & mask;
                    }
                    slots[mi] = i;
                    tiny[i].key = stored;
                    let [n0, n1] = tiny[i].counts;
                    p0 += (u64::from(n0) + u64::from(baseprob)) << hb.weights[mi];
                    p1 += (u64::from(n1) + u64::from(baseprob)) << hb.weights[mi];
                }
                let (s0, s1) = aritcode::scale_probs(p0.max(1), p1.max(1));
                let (right, wrong) = if bit != 0 { (s1, s0) } else { (s0, s1) };
                total += u64::from(aritcode::coded_size(right, wrong));
                for &slot in &slots {
                    bump(&mut tiny[slot].counts, bit as usize, saturate);
                }
            }
        }
    }
    total
}

/// Enabled context indices of a 1k model mask. Context `i` selects the
/// previous bytes given by the low five bits of `i`.
#[inline]
fn contexts_1k(modelmask: u32) -> impl Iterator<Item = u32> {
    (0..32).filter(move |i| modelmask & (1 << i) != 0)
}

/// Mixes the probability pair for one bit of the single-model coder.
#[inline]
fn mix_1k<F: FnMut(u32) -> [u8; 2]>(models: &ModelList1k, mut lookup: F) -> (u32, u32) {
    let mut p0 = u64::from(models.baseprob0);
    let mut p1 = u64::from(models.baseprob1);
    for i in contexts_1k(models.modelmask) {
        let [c0, c1] = lookup(i);
        let w = i.count_ones();
        let mut a0 = u64::from(c0) << w;
        let mut a1 = u64::from(c1) << w;
        // A context that has only ever seen one bit value is a strong
        // predictor; amplify it.
        if c0 == 0 && c1 != 0 {
            a1 *= u64::from(models.boost);
        }
        if c1 == 0 && c0 != 0 {
            a0 *= u64::from(models.boost);
        }
        p0 += a0;
        p1 += a1;
    }
    aritcode::scale_probs(p0.max(1), p1.max(1))
}

/// Estimates the coded size of `data` under the single-model coder, in
/// 1/4096 bits.
pub fn evaluate_size_1k(data: &[u8], models: &ModelList1k) -> u64 {
    let mut table = CounterTable::new(data.len() * 8);
    let mut history = [0u8; MAX_CONTEXT_LENGTH];
    let mut total: u64 = 0;
    for &byte in data {
        for bitidx in 0..8 {
            let bit = u32::from(byte >> (7 - bitidx)) & 1;
            let partial = (u32::from(byte) >> (8 - bitidx)) | (1 << bitidx);
            let (p0, p1) = mix_1k(models, |i| {
                table.get(combine(hash_context(&history, i as u8), partial))
            });
            let (right, wrong) = if bit != 0 { (p1, p0) } else { (p0, p1) };
            total += u64::from(aritcode::coded_size(right, wrong));
            for i in contexts_1k(models.modelmask) {
                table.bump(
                    combine(hash_context(&history, i as u8), partial),
                    bit as usize,
                    false,
                );
            }
        }
        push_history(&mut history, byte);
    }
    total
}

/// Compresses `data` with the single-model coder.
pub fn compress_1k(
    data: &[u8],
    models: &ModelList1k,
    mut sizefill: Option<&mut Vec<u32>>,
) -> Vec<u8> {
    let mut table = CounterTable::new(data.len() * 8);
    let mut coder = AritCoder::new();
    let mut history = [0u8; MAX_CONTEXT_LENGTH];
    let mut estimate: u64 = 0;
    if let Some(fill) = sizefill.as_deref_mut() {
        fill.clear();
        fill.push(0);
    }
    for &byte in data {
        for bitidx in 0..8 {
            let bit = u32::from(byte >> (7 - bitidx)) & 1;
            let partial = (u32::from(byte) >> (8 - bitidx)) | (1 << bitidx);
            let (p0, p1) = mix_1k(models, |i| {
                table.get(combine(hash_context(&history, i as u8), partial))
            });
            coder.code(p0, p1, bit);
            let (right, wrong) = if bit != 0 { (p1, p0) } else { (p0, p1) };
            estimate += u64::from(aritcode::coded_size(right, wrong));
            for i in contexts_1k(models.modelmask) {
                table.bump(
                    combine(hash_context(&history, i as u8), partial),
                    bit as usize,
                    false,
                );
            }
        }
        push_history(&mut history, byte);
        if let Some(fill) = sizefill.as_deref_mut() {
            fill.push(estimate.min(u64::from(u32::MAX)) as u32);
        }
    }
    let (packed, _) = coder.finish();
    packed
}

/// Inverse of `compress_1k`.
pub fn decompress_1k(packed: &[u8], len: usize, models: &ModelList1k) -> Vec<u8> {
    let mut table = CounterTable::new(len * 8);
    let mut dec = AritDecoder::new(packed);
    let mut history = [0u8; MAX_CONTEXT_LENGTH];
    let mut data = Vec::with_capacity(len);
    for _ in 0..len {
        let mut byte = 0u8;
        for bitidx in 0..8 {
            let partial = u32::from(byte) | (1 << bitidx);
            let (p0, p1) = mix_1k(models, |i| {
                table.get(combine(hash_context(&history, i as u8), partial))
            });
            let bit = dec.decode(p0, p1);
            for i in contexts_1k(models.modelmask) {
                table.bump(
                    combine(hash_context(&history, i as u8), partial),
                    bit as usize,
                    false,
                );
            }
            byte = (byte << 1) | bit as u8;
        }
        data.push(byte);
        push_history(&mut history, byte);
    }
    data
}
