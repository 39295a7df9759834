//! Post-compression size attribution.
//!
//! From the per-byte coded-size array the report builds a tree of
//! spans: the whole image, the code/data/uninitialised sections, the
//! original hunks inside them, and the symbols inside those. Each
//! span carries its uncompressed position and size plus its compressed
//! position and size in fractional bits.

use std::io::{self, Write};

use crate::aritcode::BIT_PRECISION;
use crate::hunk::{Hunk, SYMBOL_IS_RELOCATABLE, SYMBOL_IS_SECTION};

pub const RECORD_ROOT: u32 = 1 << 0;
pub const RECORD_SECTION: u32 = 1 << 1;
pub const RECORD_OLD_SECTION: u32 = 1 << 2;
pub const RECORD_PUBLIC: u32 = 1 << 3;
pub const RECORD_PRIVATE: u32 = 1 << 4;

#[derive(Debug)]
pub struct ReportRecord {
    pub name: String,
    pub kind: u32,
    /// Uncompressed position and size.
    pub pos: usize,
    pub size: usize,
    /// Compressed position and size in 1/4096 bits; `None` for spans
    /// beyond the initialised image.
    pub compressed_pos: Option<u64>,
    pub compressed_size: Option<u64>,
    pub children: Vec<ReportRecord>,
}

impl ReportRecord {
    fn new(name: &str, kind: u32, pos: usize, size: usize, sizefill: &[u32]) -> Self {
        let compressed = if pos + size <= sizefill.len().saturating_sub(1) {
            let start = u64::from(sizefill[pos]);
            let end = u64::from(sizefill[pos + size]);
            Some((start, end - start))
        } else {
            None
        };
        Self {
            name: name.to_string(),
            kind,
            pos,
            size,
            compressed_pos: compressed.map(|c| c.0),
            compressed_size: compressed.map(|c| c.1),
            children: Vec::new(),
        }
    }
}

/// Symbols of the flat image sorted by address, filtered to a span.
fn symbols_in(flat: &Hunk, start: usize, end: usize, sections: bool) -> Vec<(usize, String)> {
    let mut symbols: Vec<(usize, String)> = flat
        .symbols
        .iter()
        .filter(|s| s.flags & SYMBOL_IS_RELOCATABLE != 0)
        .filter(|s| (s.flags & SYMBOL_IS_SECTION != 0) == sections)
        .map(|s| (s.value as usize, s.name.clone()))
        .filter(|&(value, _)| value >= start && value < end)
        .collect();
    symbols.sort();
    symbols.dedup();
    symbols
}

/// Builds the report tree for a flat image whose per-byte coded sizes
/// are in `sizefill` (length `raw + 1`, cumulative).
pub fn compression_report(flat: &Hunk, sizefill: &[u32], split_point: usize) -> ReportRecord {
    let raw = flat.raw_size();
    let mut root = ReportRecord::new(flat.name(), RECORD_ROOT, 0, raw, sizefill);
    let sections = [
        ("code", 0, split_point),
        ("data", split_point, raw),
        ("uninitialized", raw, flat.virtual_size()),
    ];
    for (name, start, end) in sections {
        if start >= end {
            continue;
        }
        let mut section =
            ReportRecord::new(name, RECORD_SECTION, start, end - start, sizefill);
        let hunk_starts = symbols_in(flat, start, end, true);
        for (i, (hunk_start, hunk_name)) in hunk_starts.iter().enumerate() {
            let hunk_end = hunk_starts.get(i + 1).map_or(end, |next| next.0);
            let mut old_section = ReportRecord::new(
                hunk_name,
                RECORD_OLD_SECTION,
                *hunk_start,
                hunk_end - hunk_start,
                sizefill,
            );
            let symbols = symbols_in(flat, *hunk_start, hunk_end, false);
            for (j, (sym_start, sym_name)) in symbols.iter().enumerate() {
                let sym_end = symbols.get(j + 1).map_or(hunk_end, |next| next.0);
                let kind = if sym_name.starts_with('.') || sym_name.starts_with('$') {
                    RECORD_PRIVATE
                } else {
                    RECORD_PUBLIC
                };
                old_section.children.push(ReportRecord::new(
                    sym_name,
                    kind,
                    *sym_start,
                    sym_end - sym_start,
                    sizefill,
                ));
            }
            section.children.push(old_section);
        }
        root.children.push(section);
    }
    root
}

fn print_record<W: Write>(w: &mut W, record: &ReportRecord) -> io::Result<()> {
    if record.kind & RECORD_ROOT != 0 {
        writeln!(
            w,
            "\nlabel name                                   pos comp-pos      size compsize"
        )?;
    } else {
        let indent = match record.kind {
            k if k & RECORD_SECTION != 0 => 0,
            k if k & RECORD_OLD_SECTION != 0 => 2,
            k if k & RECORD_PUBLIC != 0 => 4,
            _ => 6,
        };
        let name = format!("{:indent$}{}", "", record.name, indent = indent);
        match (record.compressed_pos, record.compressed_size) {
            (Some(cpos), Some(csize)) => writeln!(
                w,
                "{:<38.38} {:9} {:8.2} {:9} {:8.2}",
                name,
                record.pos,
                cpos as f64 / (f64::from(BIT_PRECISION) * 8.0),
                record.size,
                csize as f64 / (f64::from(BIT_PRECISION) * 8.0),
            )?,
            _ => writeln!(w, "{:<38.38} {:9}          {:9}", name, record.pos, record.size)?,
        }
    }
    for child in &record.children {
        print_record(w, child)?;
    }
    Ok(())
}

/// Prints the report as an aligned table.
pub fn print_report<W: Write>(w: &mut W, root: &ReportRecord) -> io::Result<()> {
    print_record(w, root)
}
