//! Ordered, owning sequences of hunks.
//!
//! The list supports symbol lookup across all members, reachability
//! pruning from a set of roots, and concatenation into a single flat
//! hunk with addresses assigned sequentially under per-hunk alignment.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::Error;
use crate::hunk::{
    Hunk, RelocKind, Relocation, Symbol, HUNK_IS_CODE, HUNK_IS_IMPORT, SYMBOL_IS_RELOCATABLE,
    SYMBOL_IS_SECTION,
};

/// Where each input hunk landed in a flattened image.
#[derive(Debug, Clone)]
pub struct Placement {
    pub name: String,
    pub flags: u32,
    /// Offset from the flat hunk's base address.
    pub offset: usize,
    pub raw_size: usize,
    pub virtual_size: usize,
}

#[derive(Debug, Default, Clone)]
pub struct HunkList {
    hunks: Vec<Hunk>,
}

fn round_up(n: usize, alignment_bits: u32) -> usize {
    let m = 1usize << alignment_bits;
    (n + m - 1) & !(m - 1)
}

/// Strips decoration from a symbol name for fuzzy entry-point lookup:
/// a leading underscore or at-sign, and a trailing `@n` stdcall byte
/// count.
fn undecorate(name: &str) -> &str {
    let name = name.strip_prefix(['_', '@']).unwrap_or(name);
    match name.rfind('@') {
        Some(pos) if name[pos + 1..].chars().all(|c| c.is_ascii_digit()) && pos > 0 => {
            &name[..pos]
        }
        _ => name,
    }
}

impl HunkList {
    pub fn new() -> Self {
        Self { hunks: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.hunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Hunk> {
        self.hunks.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Hunk> {
        self.hunks.iter_mut()
    }

    pub fn push_back(&mut self, hunk: Hunk) {
        self.hunks.push(hunk);
    }

    pub fn push_front(&mut self, hunk: Hunk) {
        self.hunks.insert(0, hunk);
    }

    /// Moves every hunk of `other` to the back of this list.
    pub fn append(&mut self, other: &mut HunkList) {
        self.hunks.append(&mut other.hunks);
    }

    pub fn remove(&mut self, index: usize) -> Hunk {
        self.hunks.remove(index)
    }

    /// Removes the first hunk with the given name, if any.
    pub fn remove_named(&mut self, name: &str) -> Option<Hunk> {
        let index = self.hunks.iter().position(|h| h.name() == name)?;
        Some(self.hunks.remove(index))
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.hunks.iter().position(|h| h.name() == name)
    }

    /// Reorders the list according to `order`, a permutation of
    /// indices.
    pub fn reorder(&mut self, order: &[usize]) {
        debug_assert_eq!(order.len(), self.hunks.len());
        let mut taken: Vec<Option<Hunk>> = self.hunks.drain(..).map(Some).collect();
        self.hunks = order
            .iter()
            .map(|&i| taken[i].take().expect("index used twice in reorder"))
            .collect();
    }

    pub fn mark_as_library(&mut self) {
        for hunk in &mut self.hunks {
            hunk.flags |= crate::hunk::HUNK_FROM_LIBRARY;
            for symbol in &mut hunk.symbols {
                symbol.from_library = true;
            }
        }
    }

    /// First definition of `name` across all member hunks.
    pub fn find_symbol(&self, name: &str) -> Option<(usize, &Symbol)> {
        for (i, hunk) in self.hunks.iter().enumerate() {
            if let Some(symbol) = hunk.find_symbol(name) {
                return Some((i, symbol));
            }
        }
        None
    }

    /// Like `find_symbol`, but falls back to comparing undecorated
    /// names; used for entry-point lookup where the configured name
    /// may or may not carry its decoration.
    pub fn find_undecorated_symbol(&self, name: &str) -> Option<(usize, &Symbol)> {
        if let Some(found) = self.find_symbol(name) {
            return Some(found);
        }
        let wanted = undecorate(name);
        for (i, hunk) in self.hunks.iter().enumerate() {
            for symbol in &hunk.symbols {
                if undecorate(&symbol.name) == wanted {
                    return Some((i, symbol));
                }
            }
        }
        None
    }

    /// Keeps only hunks reachable from `roots` through relocations and
    /// continuations.
    pub fn remove_unreferenced_hunks(&mut self, roots: &[usize]) {
        let mut owner: HashMap<&str, usize> = HashMap::new();
        for (i, hunk) in self.hunks.iter().enumerate() {
            for symbol in &hunk.symbols {
                owner.entry(&symbol.name).or_insert(i);
            }
        }
        let mut keep: HashSet<usize> = HashSet::new();
        let mut queue: VecDeque<usize> = roots.iter().cloned().collect();
        while let Some(i) = queue.pop_front() {
            if !keep.insert(i) {
                continue;
            }
            let hunk = &self.hunks[i];
            let targets = hunk
                .relocations
                .iter()
                .map(|r| r.symbol.as_str())
                .chain(hunk.continuation.as_deref());
            for name in targets {
                if let Some(&target) = owner.get(name) {
                    if !keep.contains(&target) {
                        queue.push_back(target);
                    }
                }
            }
        }
        let mut index = 0;
        self.hunks.retain(|_| {
            let kept = keep.contains(&index);
            index += 1;
            kept
        });
    }

    /// Drops the import thunks; called after the import machinery has
    /// been synthesised from them.
    pub fn remove_import_hunks(&mut self) {
        self.hunks.retain(|h| h.flags & HUNK_IS_IMPORT == 0);
    }

    /// Rounds 8-byte floats in eligible hunks; returns lanes rounded.
    pub fn round_floats(&mut self, bits: u32) -> usize {
        self.hunks.iter_mut().map(|h| h.truncate_floats(bits)).sum()
    }

    /// Concatenates the list into one flat hunk. Per-hunk alignment is
    /// honoured; a hunk with a continuation gets a relative jump
    /// appended unless control falls through to the continuation symbol
    /// anyway. Relocatable symbols are rebased onto the flat hunk and
    /// every hunk start is recorded as a section symbol.
    pub fn flatten(&self, name: &str) -> (Hunk, Vec<Placement>) {
        let mut placements = Vec::with_capacity(self.hunks.len());
        let mut data: Vec<u8> = Vec::new();
        let mut symbols: Vec<Symbol> = Vec::new();
        let mut relocations: Vec<Relocation> = Vec::new();
        let mut virtual_end = 0usize;
        let mut raw_end = 0usize;
        let mut offset = 0usize;
        for (i, hunk) in self.hunks.iter().enumerate() {
            offset = round_up(offset, hunk.alignment_bits());
            // A continuation jump is unnecessary when the target is the
            // very next byte.
            let fallthrough = match (&hunk.continuation, self.hunks.get(i + 1)) {
                (Some(target), Some(next)) => {
                    round_up(offset + hunk.raw_size(), next.alignment_bits())
                        == offset + hunk.raw_size()
                        && next
                            .find_symbol(target)
                            .map_or(false, |s| s.value == 0 && s.flags & SYMBOL_IS_RELOCATABLE != 0)
                }
                _ => false,
            };
            if data.len() < offset {
                data.resize(offset, 0);
            }
            data.extend_from_slice(hunk.data());
            let mut extra = 0;
            if hunk.continuation.is_some() && !fallthrough {
                let target = hunk.continuation.clone().unwrap();
                data.push(0xe9);
                data.extend_from_slice(&[0, 0, 0, 0]);
                relocations.push(Relocation {
                    offset: offset + hunk.raw_size() + 1,
                    symbol: target,
                    kind: RelocKind::Rel32,
                });
                extra = 5;
            }
            for symbol in &hunk.symbols {
                let mut moved = symbol.clone();
                if moved.flags & SYMBOL_IS_RELOCATABLE != 0 {
                    moved.value = moved.value.wrapping_add(offset as u32);
                }
                symbols.push(moved);
            }
            symbols.push(Symbol::new(
                hunk.name(),
                offset as u32,
                SYMBOL_IS_RELOCATABLE | SYMBOL_IS_SECTION,
            ));
            for relocation in &hunk.relocations {
                let mut moved = relocation.clone();
                moved.offset += offset;
                relocations.push(moved);
            }
            let span = hunk.virtual_size().max(hunk.raw_size() + extra);
            placements.push(Placement {
                name: hunk.name().to_string(),
                flags: hunk.flags,
                offset,
                raw_size: hunk.raw_size() + extra,
                virtual_size: span,
            });
            if hunk.raw_size() + extra > 0 {
                raw_end = offset + hunk.raw_size() + extra;
            }
            virtual_end = virtual_end.max(offset + span);
            offset += span;
        }
        data.resize(raw_end, 0);
        let mut flat = Hunk::new(
            name,
            HUNK_IS_CODE | crate::hunk::HUNK_IS_WRITEABLE,
            0,
            data,
            virtual_end,
        );
        flat.symbols = symbols;
        flat.relocations = relocations;
        (flat, placements)
    }

    /// Offset of the first non-code byte in a flattened image, given
    /// the placements `flatten` returned: the split between the code
    /// model list and the data model list.
    pub fn split_point(placements: &[Placement]) -> usize {
        let mut split = 0;
        for p in placements {
            if p.flags & HUNK_IS_CODE != 0 && p.raw_size > 0 {
                split = p.offset + p.raw_size;
            }
        }
        split
    }
}

impl std::ops::Index<usize> for HunkList {
    type Output = Hunk;
    fn index(&self, index: usize) -> &Hunk {
        &self.hunks[index]
    }
}

impl std::ops::IndexMut<usize> for HunkList {
    fn index_mut(&mut self, index: usize) -> &mut Hunk {
        &mut self.hunks[index]
    }
}

/// Applies the relocations recorded in a flat hunk. Every 32-bit slot
/// gets the target address added (absolute) or the displacement to the
/// target added (relative), so pre-set addends survive.
pub fn relocate(hunk: &mut Hunk, base_address: u32) -> Result<(), Error> {
    relocate_with(hunk, base_address, true).map(|_| ())
}

/// Best-effort variant for order measurement: unresolved symbols and
/// out-of-range sites are skipped, and their count returned.
pub fn relocate_lenient(hunk: &mut Hunk, base_address: u32) -> usize {
    relocate_with(hunk, base_address, false).unwrap_or(0)
}

fn relocate_with(hunk: &mut Hunk, base_address: u32, strict: bool) -> Result<usize, Error> {
    let relocations = hunk.relocations.clone();
    let mut skipped = 0;
    for relocation in &relocations {
        let target = match hunk.find_symbol(&relocation.symbol) {
            Some(symbol) if symbol.flags & SYMBOL_IS_RELOCATABLE != 0 => {
                base_address.wrapping_add(symbol.value)
            }
            Some(symbol) => symbol.value,
            None if strict => {
                return Err(Error::SymbolNotFound { name: relocation.symbol.clone() });
            }
            None => {
                skipped += 1;
                continue;
            }
        };
        if relocation.offset + 4 > hunk.raw_size() {
            if strict {
                return Err(Error::PatchOutOfRange {
                    symbol: relocation.symbol.clone(),
                    offset: relocation.offset,
                    len: hunk.raw_size(),
                });
            }
            skipped += 1;
            continue;
        }
        let site = base_address.wrapping_add(relocation.offset as u32);
        let old = hunk.read_u32(relocation.offset);
        let new = match relocation.kind {
            RelocKind::Abs32 => old.wrapping_add(target),
            RelocKind::Rel32 => old.wrapping_add(target.wrapping_sub(site.wrapping_add(4))),
        };
        hunk.patch_u32(relocation.offset, new)?;
    }
    Ok(skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hunk::{HUNK_IS_DATA, HUNK_IS_WRITEABLE};

    fn code_hunk(name: &str, data: Vec<u8>) -> Hunk {
        Hunk::new(name, HUNK_IS_CODE, 0, data, 0)
    }

    #[test]
    fn test_find_symbol_first_definition_wins() {
        let mut list = HunkList::new();
        let mut a = code_hunk("a", vec![0x90]);
        a.add_symbol(Symbol::new("dup", 1, 0));
        let mut b = code_hunk("b", vec![0x90]);
        b.add_symbol(Symbol::new("dup", 2, 0));
        list.push_back(a);
        list.push_back(b);
        let (index, symbol) = list.find_symbol("dup").unwrap();
        assert_eq!(index, 0);
        assert_eq!(symbol.value, 1);
    }

    #[test]
    fn test_find_undecorated() {
        let mut list = HunkList::new();
        let mut a = code_hunk("a", vec![0x90]);
        a.add_symbol(Symbol::new("_main@16", 0, SYMBOL_IS_RELOCATABLE));
        list.push_back(a);
        assert!(list.find_undecorated_symbol("main").is_some());
        assert!(list.find_undecorated_symbol("_main@16").is_some());
        assert!(list.find_undecorated_symbol("other").is_none());
    }

    #[test]
    fn test_remove_unreferenced() {
        let mut list = HunkList::new();
        let mut entry = code_hunk("entry", vec![0xe8, 0, 0, 0, 0]);
        entry.add_symbol(Symbol::new("start", 0, SYMBOL_IS_RELOCATABLE));
        entry.add_relocation(Relocation { offset: 1, symbol: "helper".into(), kind: RelocKind::Rel32 });
        let mut helper = code_hunk("helper_hunk", vec![0xc3]);
        helper.add_symbol(Symbol::new("helper", 0, SYMBOL_IS_RELOCATABLE));
        let mut unused = code_hunk("unused", vec![0xcc]);
        unused.add_symbol(Symbol::new("dead", 0, SYMBOL_IS_RELOCATABLE));
        list.push_back(entry);
        list.push_back(helper);
        list.push_back(unused);
        list.remove_unreferenced_hunks(&[0]);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name(), "entry");
        assert_eq!(list[1].name(), "helper_hunk");
    }

    #[test]
    fn test_flatten_alignment_and_addresses() {
        let mut list = HunkList::new();
        list.push_back(code_hunk("a", vec![0x90; 3]));
        let mut b = Hunk::new("b", HUNK_IS_DATA, 4, vec![0xaa; 4], 0);
        b.add_symbol(Symbol::new("bsym", 2, SYMBOL_IS_RELOCATABLE));
        list.push_back(b);
        let (flat, placements) = list.flatten("flat");
        assert_eq!(placements[0].offset, 0);
        assert_eq!(placements[1].offset, 16);
        assert_eq!(flat.raw_size(), 20);
        assert_eq!(flat.find_symbol("bsym").unwrap().value, 18);
        // Padding between hunks is zeroed.
        assert!(flat.data()[3..16].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_flatten_bss_tail_stays_virtual() {
        let mut list = HunkList::new();
        list.push_back(code_hunk("code", vec![0xc3]));
        list.push_back(Hunk::new_bss("bss", HUNK_IS_WRITEABLE, 0, 100));
        let (flat, _) = list.flatten("flat");
        assert_eq!(flat.raw_size(), 1);
        assert_eq!(flat.virtual_size(), 101);
    }

    #[test]
    fn test_flatten_continuation_jump() {
        let mut list = HunkList::new();
        let mut first = code_hunk("first", vec![0x90, 0x90]);
        first.continuation = Some("entry".into());
        list.push_back(first);
        let mut far = Hunk::new("far", HUNK_IS_CODE, 0, vec![0xcc; 7], 0);
        far.add_symbol(Symbol::new("other", 0, SYMBOL_IS_RELOCATABLE));
        list.push_back(far);
        let mut target = code_hunk("target", vec![0xc3]);
        target.add_symbol(Symbol::new("entry", 0, SYMBOL_IS_RELOCATABLE));
        list.push_back(target);
        let (mut flat, placements) = list.flatten("flat");
        // A 5-byte jump was appended to the first hunk.
        assert_eq!(placements[0].raw_size, 7);
        assert_eq!(flat.data()[2], 0xe9);
        relocate(&mut flat, 0x400000).unwrap();
        let disp = i32::from_le_bytes(flat.data()[3..7].try_into().unwrap());
        // Jump from end of instruction (offset 7) to `entry` at 14.
        assert_eq!(disp, 14 - 7);
    }

    #[test]
    fn test_flatten_continuation_fallthrough() {
        let mut list = HunkList::new();
        let mut first = code_hunk("first", vec![0x90, 0x90]);
        first.continuation = Some("entry".into());
        list.push_back(first);
        let mut target = code_hunk("target", vec![0xc3]);
        target.add_symbol(Symbol::new("entry", 0, SYMBOL_IS_RELOCATABLE));
        list.push_back(target);
        let (flat, placements) = list.flatten("flat");
        // Control falls through; no jump appended.
        assert_eq!(placements[0].raw_size, 2);
        assert_eq!(flat.raw_size(), 3);
    }

    #[test]
    fn test_relocate_absolute_and_relative() {
        let mut list = HunkList::new();
        let mut code = code_hunk("code", vec![0xb8, 0, 0, 0, 0, 0xe8, 0, 0, 0, 0]);
        code.add_relocation(Relocation { offset: 1, symbol: "data".into(), kind: RelocKind::Abs32 });
        code.add_relocation(Relocation { offset: 6, symbol: "data".into(), kind: RelocKind::Rel32 });
        list.push_back(code);
        let mut data = Hunk::new("datahunk", HUNK_IS_DATA, 0, vec![0x11; 4], 0);
        data.add_symbol(Symbol::new("data", 0, SYMBOL_IS_RELOCATABLE));
        list.push_back(data);
        let (mut flat, _) = list.flatten("flat");
        relocate(&mut flat, 0x410000).unwrap();
        // Absolute: image base + offset of the data hunk.
        assert_eq!(flat.read_u32(1), 0x41000a);
        // Relative: the call at 6 lands exactly on the data hunk, so
        // the displacement from the end of the slot is zero.
        assert_eq!(flat.read_u32(6), 0);
    }

    #[test]
    fn test_relocate_unresolved_symbol() {
        let mut list = HunkList::new();
        let mut code = code_hunk("code", vec![0, 0, 0, 0]);
        code.add_relocation(Relocation { offset: 0, symbol: "missing".into(), kind: RelocKind::Abs32 });
        list.push_back(code);
        let (mut flat, _) = list.flatten("flat");
        match relocate(&mut flat, 0) {
            Err(Error::SymbolNotFound { name }) => assert_eq!(name, "missing"),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_split_point() {
        let mut list = HunkList::new();
        list.push_back(code_hunk("c1", vec![0x90; 10]));
        list.push_back(code_hunk("c2", vec![0x90; 6]));
        list.push_back(Hunk::new("d", HUNK_IS_DATA, 0, vec![1, 2, 3], 0));
        let (_, placements) = list.flatten("flat");
        assert_eq!(HunkList::split_point(&placements), 16);
    }

    #[test]
    fn test_reorder() {
        let mut list = HunkList::new();
        list.push_back(code_hunk("a", vec![1]));
        list.push_back(code_hunk("b", vec![2]));
        list.push_back(code_hunk("c", vec![3]));
        list.reorder(&[2, 0, 1]);
        let names: Vec<_> = list.iter().map(|h| h.name().to_string()).collect();
        assert_eq!(names, ["c", "a", "b"]);
    }
}
