//! Synthesis of the import machinery from import thunks.
//!
//! The loaders receive each function as an import hunk: a zero-sized
//! hunk naming a DLL and a function. Those thunks are replaced here by
//! the data the runtime import loader walks: a DLL-name block and a
//! block of one hash per function. The loader resolves each hash
//! against the export table of its DLL and writes the resolved address
//! over the hash, so the hash block doubles as the import address
//! table. It is placed in the header region of the final image, and
//! the `__imp_*` symbols become absolute addresses into it.
//!
//! Hash values are computed by the import discovery machinery; the
//! function used here mirrors it and is otherwise opaque to the rest
//! of the linker.

use std::collections::BTreeMap;

use crate::error::Error;
use crate::hunk::{Hunk, Symbol, HUNK_IS_IMPORT};
use crate::hunklist::HunkList;
use crate::log::Logger;

/// Name-block terminator.
const DLL_NAMES_END: u8 = 0xff;
/// Prefix-byte flag: ordinal-range import enabled for this DLL.
const DLL_FLAG_RANGE: u8 = 0x80;
/// Prefix-byte flag: a fallback DLL name follows the primary name.
const DLL_FLAG_FALLBACK: u8 = 0x40;

/// Patch points of the tiny import loader stub.
pub const SYM_HASH_SHIFT: &str = "_HashShiftPtr";
pub const SYM_MAX_NAME_LENGTH: &str = "_MaxNameLengthPtr";

/// Hash of an imported function name, as resolved by the runtime
/// loader.
pub fn import_hash(name: &str) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for byte in name.bytes() {
        h = (h ^ u32::from(byte)).wrapping_mul(0x0100_0193);
    }
    h
}

/// The synthesised import machinery.
pub struct ImportHunks {
    /// Replaces the import thunks in the pool; owns the DLL-name block
    /// and the absolute `__imp_*` symbols.
    pub import_list: HunkList,
    /// One dword of hash per import, overwritten with addresses at run
    /// time. Placed between header and models by the finalizer.
    pub hash_hunk: Hunk,
    /// Whether any DLL uses ordinal-range importing.
    pub uses_range_import: bool,
}

struct DllGroup {
    name: String,
    fallback: Option<String>,
    range: bool,
    functions: Vec<(String, String)>, // (__imp symbol, function name)
}

fn group_imports(
    pool: &HunkList,
    range_dlls: &[String],
    fallback_dlls: &BTreeMap<String, String>,
) -> Vec<DllGroup> {
    let mut groups: Vec<DllGroup> = Vec::new();
    for hunk in pool.iter() {
        if hunk.flags & HUNK_IS_IMPORT == 0 {
            continue;
        }
        let dll = hunk.import_dll.to_ascii_lowercase();
        let index = match groups.iter().position(|g| g.name == dll) {
            Some(index) => index,
            None => {
                groups.push(DllGroup {
                    fallback: fallback_dlls.get(&dll).cloned(),
                    range: range_dlls.iter().any(|r| r.eq_ignore_ascii_case(&dll)),
                    name: dll,
                    functions: Vec::new(),
                });
                groups.len() - 1
            }
        };
        groups[index]
            .functions
            .push((hunk.name().to_string(), hunk.import_name.clone()));
    }
    groups
}

/// Builds the import machinery for the ordinary loaders. The hash
/// block will live at `hashes_address` in the final image.
pub fn create_import_hunks(
    pool: &HunkList,
    hashes_address: u32,
    range_dlls: &[String],
    fallback_dlls: &BTreeMap<String, String>,
    logger: &mut Logger,
) -> Result<ImportHunks, Error> {
    let groups = group_imports(pool, range_dlls, fallback_dlls);
    let mut names = Vec::new();
    let mut hashes = Vec::new();
    let mut symbols = Vec::new();
    let mut uses_range_import = false;
    for group in &groups {
        let mut prefix = group.functions.len() as u8;
        if group.range {
            prefix |= DLL_FLAG_RANGE;
            uses_range_import = true;
        }
        if group.fallback.is_some() {
            prefix |= DLL_FLAG_FALLBACK;
        }
        names.push(prefix);
        names.extend_from_slice(group.name.as_bytes());
        names.push(0);
        if let Some(fallback) = &group.fallback {
            names.extend_from_slice(fallback.as_bytes());
            names.push(0);
        }
        for (symbol_name, function) in &group.functions {
            // The loader writes the resolved address over this slot;
            // until then it holds the hash to resolve.
            let slot = hashes_address + hashes.len() as u32;
            hashes.extend_from_slice(&import_hash(function).to_le_bytes());
            let mut symbol = Symbol::new(symbol_name, slot, 0);
            symbol.misc = function.clone();
            symbols.push(symbol);
        }
    }
    names.push(DLL_NAMES_END);
    let total = groups.iter().map(|g| g.functions.len()).sum::<usize>();
    logger.info(
        "",
        &format!("Imported {} functions from {} DLLs", total, groups.len()),
    );
    let mut name_hunk = Hunk::new("import names", 0, 0, names, 0);
    name_hunk.add_symbol(Symbol::new(
        "_DLLNames",
        0,
        crate::hunk::SYMBOL_IS_RELOCATABLE,
    ));
    for symbol in symbols {
        name_hunk.add_symbol(symbol);
    }
    let mut hash_hunk = Hunk::new("import hashes", 0, 0, hashes, 0);
    hash_hunk.add_symbol(Symbol::new(
        "_ImportHashes",
        0,
        crate::hunk::SYMBOL_IS_RELOCATABLE,
    ));
    let mut import_list = HunkList::new();
    import_list.push_back(name_hunk);
    Ok(ImportHunks {
        import_list,
        hash_hunk,
        uses_range_import,
    })
}

/// The tiny-import variant: one flat list of DLL and function names,
/// resolved by truncated name hashes. Returns the machinery plus the
/// number of significant hash bits and the longest DLL name, which the
/// tiny loader stub needs patched in.
pub struct TinyImportHunks {
    pub import_list: HunkList,
    pub hash_bits: u32,
    pub max_dll_name_length: usize,
}

pub fn create_import_hunks_1k(
    pool: &HunkList,
    logger: &mut Logger,
) -> Result<TinyImportHunks, Error> {
    let groups = group_imports(pool, &[], &BTreeMap::new());
    let mut names = Vec::new();
    let mut function_hashes: Vec<u32> = Vec::new();
    let mut symbols = Vec::new();
    let mut max_dll_name_length = 0;
    for group in &groups {
        max_dll_name_length = max_dll_name_length.max(group.name.len() + 1);
        names.push(group.functions.len() as u8);
        names.extend_from_slice(group.name.as_bytes());
        names.push(0);
        for (symbol_name, function) in &group.functions {
            let hash = import_hash(function);
            function_hashes.push(hash);
            // The tiny loader stores resolved addresses in place of the
            // hash words appended after the names.
            symbols.push((symbol_name.clone(), function.clone()));
        }
    }
    names.push(DLL_NAMES_END);
    // Find how many leading hash bits distinguish all imports.
    let mut hash_bits = 8;
    while hash_bits < 32 {
        let mut seen: Vec<u32> = function_hashes
            .iter()
            .map(|h| h >> (32 - hash_bits))
            .collect();
        seen.sort_unstable();
        seen.dedup();
        if seen.len() == function_hashes.len() {
            break;
        }
        hash_bits += 1;
    }
    let hash_base = names.len();
    for hash in &function_hashes {
        names.extend_from_slice(&(hash >> (32 - hash_bits) << (32 - hash_bits)).to_le_bytes());
    }
    let mut hunk = Hunk::new("import names", 0, 0, names, 0);
    hunk.add_symbol(Symbol::new(
        "_DLLNames",
        0,
        crate::hunk::SYMBOL_IS_RELOCATABLE,
    ));
    for (i, (symbol_name, function)) in symbols.into_iter().enumerate() {
        let mut symbol = Symbol::new(
            &symbol_name,
            (hash_base + 4 * i) as u32,
            crate::hunk::SYMBOL_IS_RELOCATABLE,
        );
        symbol.misc = function;
        hunk.add_symbol(symbol);
    }
    logger.info(
        "",
        &format!(
            "Tiny import: {} hash bits, longest DLL name {}",
            hash_bits, max_dll_name_length
        ),
    );
    let mut import_list = HunkList::new();
    import_list.push_back(hunk);
    Ok(TinyImportHunks {
        import_list,
        hash_bits,
        max_dll_name_length,
    })
}

/// Applies the replace-DLL map to the import thunks and warns about
/// map entries that matched nothing.
pub fn replace_dlls(
    pool: &mut HunkList,
    replacements: &BTreeMap<String, String>,
    logger: &mut Logger,
) {
    let mut used: Vec<&String> = Vec::new();
    for hunk in pool.iter_mut() {
        if hunk.flags & HUNK_IS_IMPORT == 0 {
            continue;
        }
        let key = hunk.import_dll.to_ascii_lowercase();
        if let Some((from, to)) = replacements.get_key_value(&key) {
            hunk.import_dll = to.clone();
            if !used.contains(&from) {
                used.push(from);
            }
        }
    }
    for from in replacements.keys() {
        if !used.contains(&from) {
            logger.warning(
                "",
                &format!("No functions were imported from replaced dll '{}'", from),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{Logger, MemorySink};

    fn import_pool() -> HunkList {
        let mut pool = HunkList::new();
        pool.push_back(Hunk::new_import("__imp__ExitProcess@4", "ExitProcess", "kernel32"));
        pool.push_back(Hunk::new_import("__imp__LoadLibraryA@4", "LoadLibraryA", "kernel32"));
        pool.push_back(Hunk::new_import("__imp__MessageBoxA@16", "MessageBoxA", "user32"));
        pool
    }

    #[test]
    fn test_group_and_name_block() {
        let mut logger = Logger::new(Box::new(MemorySink::default()));
        let imports = create_import_hunks(
            &import_pool(),
            0x400200,
            &[],
            &BTreeMap::new(),
            &mut logger,
        )
        .unwrap();
        assert!(!imports.uses_range_import);
        let names = &imports.import_list[0];
        // Two DLLs: kernel32 with two functions, user32 with one.
        let data = names.data();
        assert_eq!(data[0], 2);
        assert_eq!(&data[1..9], b"kernel32");
        assert_eq!(*data.last().unwrap(), DLL_NAMES_END);
        // Three hash dwords.
        assert_eq!(imports.hash_hunk.raw_size(), 12);
        // Slot symbols are absolute and consecutive.
        let a = names.find_symbol("__imp__ExitProcess@4").unwrap();
        let b = names.find_symbol("__imp__LoadLibraryA@4").unwrap();
        assert_eq!(a.value, 0x400200);
        assert_eq!(b.value, 0x400204);
        assert_eq!(a.flags & crate::hunk::SYMBOL_IS_RELOCATABLE, 0);
    }

    #[test]
    fn test_range_flag() {
        let mut logger = Logger::new(Box::new(MemorySink::default()));
        let imports = create_import_hunks(
            &import_pool(),
            0x400200,
            &["kernel32".to_string()],
            &BTreeMap::new(),
            &mut logger,
        )
        .unwrap();
        assert!(imports.uses_range_import);
        assert_eq!(imports.import_list[0].data()[0], DLL_FLAG_RANGE | 2);
    }

    #[test]
    fn test_fallback_name_follows() {
        let mut logger = Logger::new(Box::new(MemorySink::default()));
        let mut fallbacks = BTreeMap::new();
        fallbacks.insert("user32".to_string(), "user32_legacy".to_string());
        let imports = create_import_hunks(
            &import_pool(),
            0x400200,
            &[],
            &fallbacks,
            &mut logger,
        )
        .unwrap();
        let data = imports.import_list[0].data().to_vec();
        let pos = data
            .windows(6)
            .position(|w| w == b"user32")
            .unwrap();
        assert_eq!(data[pos - 1], DLL_FLAG_FALLBACK | 1);
        let tail = &data[pos + 7..];
        assert!(tail.starts_with(b"user32_legacy"));
    }

    #[test]
    fn test_replace_dlls_warns_unused() {
        let mut pool = import_pool();
        let mut logger = Logger::new(Box::new(MemorySink::default()));
        let mut map = BTreeMap::new();
        map.insert("user32".to_string(), "custom32".to_string());
        map.insert("opengl32".to_string(), "other".to_string());
        replace_dlls(&mut pool, &map, &mut logger);
        assert_eq!(pool[2].import_dll, "custom32");
        assert_eq!(logger.warning_count(), 1);
    }

    #[test]
    fn test_tiny_import_hash_bits() {
        let mut logger = Logger::new(Box::new(MemorySink::default()));
        let tiny = create_import_hunks_1k(&import_pool(), &mut logger).unwrap();
        assert!(tiny.hash_bits >= 8 && tiny.hash_bits <= 32);
        assert_eq!(tiny.max_dll_name_length, "kernel32".len() + 1);
        // Truncated hashes are unique.
        let hunk = &tiny.import_list[0];
        let a = hunk.find_symbol("__imp__ExitProcess@4").unwrap().value;
        let b = hunk.find_symbol("__imp__MessageBoxA@16").unwrap().value;
        assert_ne!(hunk.read_u32(a as usize), hunk.read_u32(b as usize));
    }

    #[test]
    fn test_import_hash_is_stable() {
        assert_eq!(import_hash("ExitProcess"), import_hash("ExitProcess"));
        assert_ne!(import_hash("ExitProcess"), import_hash("ExitThread"));
    }
}
