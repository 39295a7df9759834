//! Export records and the PE export directory.
//!
//! An export is `name=value` (an integer exported verbatim as an RVA),
//! `name=symbol` (a symbol exported under another name) or a bare
//! `name` (a symbol exported as itself). The export directory hunk is
//! appended to the image; its internal references carry a negative
//! image-base addend so the relocated dwords come out as RVAs.

use std::collections::BTreeSet;
use std::fmt;

use crate::hunk::{Hunk, RelocKind, Relocation, Symbol, SYMBOL_IS_EXPORT, SYMBOL_IS_RELOCATABLE};

/// Symbol naming the start of the export directory in the flat image.
pub const SYM_EXPORT_TABLE: &str = "_ExportTable";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Export {
    name: String,
    /// Symbol to export, when the export is not an integer.
    symbol: Option<String>,
    /// Verbatim RVA, when it is.
    value: Option<u32>,
}

impl Export {
    pub fn from_symbol(name: &str, symbol: &str) -> Self {
        Self {
            name: name.to_string(),
            symbol: Some(symbol.to_string()),
            value: None,
        }
    }

    pub fn from_value(name: &str, value: u32) -> Self {
        Self {
            name: name.to_string(),
            symbol: None,
            value: Some(value),
        }
    }

    /// Parses the option syntax: `name`, `name=symbol` or
    /// `name=0x12345678`.
    pub fn parse(spec: &str) -> Self {
        match spec.split_once('=') {
            None => Self::from_symbol(spec, spec),
            Some((name, rest)) => {
                let value = if let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
                    u32::from_str_radix(hex, 16).ok()
                } else if rest.chars().all(|c| c.is_ascii_digit()) && !rest.is_empty() {
                    rest.parse().ok()
                } else {
                    None
                };
                match value {
                    Some(value) => Self::from_value(name, value),
                    None => Self::from_symbol(name, rest),
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn symbol(&self) -> Option<&str> {
        self.symbol.as_deref()
    }

    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub fn value(&self) -> Option<u32> {
        self.value
    }
}

impl fmt::Display for Export {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.symbol, self.value) {
            (_, Some(value)) => write!(f, "{}=0x{:08X}", self.name, value),
            (Some(symbol), _) if *symbol != self.name => {
                write!(f, "{}={}", self.name, symbol)
            }
            _ => write!(f, "{}", self.name),
        }
    }
}

/// Size of the export directory proper.
const DIRECTORY_SIZE: usize = 40;

/// Builds the export directory hunk. Entries are emitted in
/// lexicographic name order, as the PE loader's binary search requires.
/// Symbol exports are relocations against the exported symbol with a
/// `-image_base` addend; integer exports are stored verbatim.
pub fn create_export_table(exports: &BTreeSet<Export>, image_base: u32) -> Hunk {
    let n = exports.len();
    let addresses_offset = DIRECTORY_SIZE;
    let name_pointers_offset = addresses_offset + 4 * n;
    let ordinals_offset = name_pointers_offset + 4 * n;
    let strings_offset = ordinals_offset + 2 * n;
    let mut strings = Vec::new();
    let mut string_offsets = Vec::with_capacity(n);
    for export in exports {
        string_offsets.push(strings_offset + strings.len());
        strings.extend_from_slice(export.name().as_bytes());
        strings.push(0);
    }
    let total = strings_offset + strings.len();
    let mut hunk = Hunk::new("exports", 0, 2, vec![0; total], 0);
    hunk.add_symbol(Symbol::new(
        SYM_EXPORT_TABLE,
        0,
        SYMBOL_IS_RELOCATABLE | SYMBOL_IS_EXPORT,
    ));
    let neg_base = image_base.wrapping_neg();

    // Directory: ordinal base 1, parallel function and name counts,
    // table RVAs resolved through self-relocations.
    hunk.patch_u32(16, 1).unwrap();
    hunk.patch_u32(20, n as u32).unwrap();
    hunk.patch_u32(24, n as u32).unwrap();
    for (offset, target) in [
        (28, addresses_offset),
        (32, name_pointers_offset),
        (36, ordinals_offset),
    ] {
        hunk.patch_u32(offset, neg_base.wrapping_add(target as u32)).unwrap();
        hunk.add_relocation(Relocation {
            offset,
            symbol: SYM_EXPORT_TABLE.to_string(),
            kind: RelocKind::Abs32,
        });
    }
    for (i, export) in exports.iter().enumerate() {
        let address_slot = addresses_offset + 4 * i;
        match (export.value(), export.symbol()) {
            (Some(value), _) => {
                hunk.patch_u32(address_slot, value).unwrap();
            }
            (None, Some(symbol)) => {
                hunk.patch_u32(address_slot, neg_base).unwrap();
                hunk.add_relocation(Relocation {
                    offset: address_slot,
                    symbol: symbol.to_string(),
                    kind: RelocKind::Abs32,
                });
            }
            (None, None) => unreachable!("export without symbol or value"),
        }
        let name_slot = name_pointers_offset + 4 * i;
        hunk.patch_u32(name_slot, neg_base.wrapping_add(string_offsets[i] as u32))
            .unwrap();
        hunk.add_relocation(Relocation {
            offset: name_slot,
            symbol: SYM_EXPORT_TABLE.to_string(),
            kind: RelocKind::Abs32,
        });
        let ordinal_slot = ordinals_offset + 2 * i;
        hunk.data_mut()[ordinal_slot..ordinal_slot + 2]
            .copy_from_slice(&(i as u16).to_le_bytes());
    }
    hunk.data_mut()[strings_offset..].copy_from_slice(&strings);
    hunk
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hunklist::{relocate, HunkList};

    #[test]
    fn test_parse_forms() {
        assert_eq!(Export::parse("frame"), Export::from_symbol("frame", "frame"));
        assert_eq!(Export::parse("frame=_render"), Export::from_symbol("frame", "_render"));
        assert_eq!(
            Export::parse("val=0x12345678"),
            Export::from_value("val", 0x12345678)
        );
        assert_eq!(Export::parse("val=42"), Export::from_value("val", 42));
    }

    #[test]
    fn test_display_roundtrip() {
        for spec in ["frame", "frame=_render", "val=0x12345678"] {
            assert_eq!(Export::parse(spec).to_string(), spec);
        }
    }

    #[test]
    fn test_table_layout_and_rvas() {
        let image_base = 0x400000u32;
        let code_base = 0x410000u32;
        let mut exports = BTreeSet::new();
        exports.insert(Export::from_symbol("render", "_render"));
        exports.insert(Export::from_value("magic", 0x12345678));
        let table = create_export_table(&exports, image_base);

        // Embed the table after a code hunk and relocate at the code
        // base, as the linker does.
        let mut pool = HunkList::new();
        let mut code = Hunk::new("code", crate::hunk::HUNK_IS_CODE, 0, vec![0x90; 8], 0);
        code.add_symbol(Symbol::new("_render", 4, SYMBOL_IS_RELOCATABLE));
        pool.push_back(code);
        pool.push_back(table);
        let (mut flat, placements) = pool.flatten("flat");
        relocate(&mut flat, code_base).unwrap();

        let table_offset = placements[1].offset;
        // Ordinal base and counts.
        assert_eq!(flat.read_u32(table_offset + 16), 1);
        assert_eq!(flat.read_u32(table_offset + 20), 2);
        // Directory table pointers are RVAs into the table itself.
        let addresses_rva = flat.read_u32(table_offset + 28);
        assert_eq!(
            addresses_rva,
            (code_base - image_base) + (table_offset + DIRECTORY_SIZE) as u32
        );
        // Exports sort by name: "magic" first, then "render".
        let magic_rva = flat.read_u32(table_offset + DIRECTORY_SIZE);
        assert_eq!(magic_rva, 0x12345678);
        let render_rva = flat.read_u32(table_offset + DIRECTORY_SIZE + 4);
        assert_eq!(render_rva, (code_base - image_base) + 4);
        // Name strings are NUL-terminated in order.
        let names_rva = flat.read_u32(table_offset + 32);
        let name_pointers_offset = (names_rva - (code_base - image_base)) as usize;
        let first_name_rva = flat.read_u32(name_pointers_offset);
        let first_name_offset = (first_name_rva - (code_base - image_base)) as usize;
        let bytes = &flat.data()[first_name_offset..first_name_offset + 6];
        assert_eq!(bytes, b"magic\0");
    }
}
