mod common;

use common::{entry_hunk, exit_42, test_linker};
use pepack::error::{Error, ErrorKind};
use pepack::exports::Export;
use pepack::hunk::{Hunk, Relocation, RelocKind, Symbol, HUNK_IS_CODE, SYMBOL_IS_RELOCATABLE};

#[test]
fn test_minimal_program_links() {
    let mut linker = test_linker();
    linker.add_hunks(entry_hunk(&exit_42()));
    let image = linker.link().unwrap();

    // A structurally valid output: MZ magic, version digits, PE header
    // pointer at 0x3C.
    assert_eq!(&image[0..2], b"MZ");
    assert_eq!(&image[2..4], b"22");
    assert_eq!(u32::from_le_bytes(image[0x3c..0x40].try_into().unwrap()), 4);
    assert_eq!(&image[4..8], b"PE\0\0");
    // Console subsystem byte.
    assert_eq!(image[0x60], 3);
    // Tens of kilobytes this is not.
    assert!(image.len() <= 400, "{} bytes", image.len());
}

#[test]
fn test_link_is_deterministic() {
    let make = || {
        let mut linker = test_linker();
        linker.add_hunks(entry_hunk(&exit_42()));
        linker.link().unwrap()
    };
    assert_eq!(make(), make());
}

#[test]
fn test_missing_entry() {
    let mut linker = test_linker();
    let mut hunk = Hunk::new("code", HUNK_IS_CODE, 0, exit_42(), 0);
    hunk.add_symbol(Symbol::new("not_the_entry", 0, SYMBOL_IS_RELOCATABLE));
    let mut list = pepack::hunklist::HunkList::new();
    list.push_back(hunk);
    linker.add_hunks(list);
    match linker.link() {
        Err(err @ Error::EntryNotFound { .. }) => {
            assert_eq!(err.kind(), ErrorKind::SymbolUnresolved);
        }
        other => panic!("{:?}", other.map(|v| v.len())),
    }
}

#[test]
fn test_integer_export_is_verbatim() {
    let mut linker = test_linker();
    linker.add_hunks(entry_hunk(&exit_42()));
    linker.add_export(Export::parse("val=0x12345678"));
    let image = linker.link().unwrap();
    // One data directory, pointing at the export table.
    assert_eq!(u32::from_le_bytes(image[0x78..0x7c].try_into().unwrap()), 1);
    let exports_rva = u32::from_le_bytes(image[0x7c..0x80].try_into().unwrap());
    // The export directory lives in the unpacked region above the code
    // base; the verbatim value inside it is covered by the export-table
    // unit tests.
    assert!(exports_rva >= 0x10000, "{:#x}", exports_rva);
}

#[test]
fn test_integer_export_collision() {
    let mut linker = test_linker();
    let mut list = entry_hunk(&exit_42());
    list[0].add_symbol(Symbol::new("val", 2, SYMBOL_IS_RELOCATABLE));
    linker.add_hunks(list);
    linker.add_export(Export::parse("val=0x12345678"));
    match linker.link() {
        Err(err @ Error::ExportCollision { .. }) => {
            assert_eq!(err.kind(), ErrorKind::ConstraintViolated);
        }
        other => panic!("{:?}", other.map(|v| v.len())),
    }
}

#[test]
fn test_symbol_export_missing_target() {
    let mut linker = test_linker();
    linker.add_hunks(entry_hunk(&exit_42()));
    linker.add_export(Export::parse("frame=_no_such_symbol"));
    match linker.link() {
        Err(Error::ExportSymbolNotFound { .. }) => (),
        other => panic!("{:?}", other.map(|v| v.len())),
    }
}

#[test]
fn test_size_cap() {
    // Incompressible input beyond the cap must fail, not truncate.
    let mut state = 0x12345678u64;
    let mut noise = Vec::with_capacity(132 * 1024);
    for _ in 0..132 * 1024 {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        noise.push((state >> 33) as u8);
    }
    let mut linker = test_linker();
    linker.add_hunks(entry_hunk(&noise));
    match linker.link() {
        Err(err @ Error::OutputTooLarge { .. }) => {
            assert_eq!(err.kind(), ErrorKind::ConstraintViolated);
        }
        other => panic!("{:?}", other.map(|v| v.len())),
    }
}

#[test]
fn test_fallback_requires_safe_import() {
    let mut linker = test_linker();
    linker.add_hunks(entry_hunk(&exit_42()));
    linker.safe_importing = false;
    linker
        .fallback_dlls
        .insert("opengl32".to_string(), "mesa32".to_string());
    match linker.link() {
        Err(Error::FallbackWithoutSafeImport) => (),
        other => panic!("{:?}", other.map(|v| v.len())),
    }
}

#[test]
fn test_unreferenced_hunks_are_dropped() {
    // A dead data hunk must not enlarge the output.
    let with_dead = {
        let mut linker = test_linker();
        let mut list = entry_hunk(&exit_42());
        list.push_back(common::data_hunk("dead", "_dead", &[0x55; 64]));
        linker.add_hunks(list);
        linker.link().unwrap()
    };
    let without = {
        let mut linker = test_linker();
        linker.add_hunks(entry_hunk(&exit_42()));
        linker.link().unwrap()
    };
    assert_eq!(with_dead.len(), without.len());
}

#[test]
fn test_referenced_data_is_kept_and_relocated() {
    let mut linker = test_linker();
    let mut list = entry_hunk(&[
        0xa1, 0x00, 0x00, 0x00, 0x00, // mov eax, [answer]
        0xc3,
    ]);
    list[0].add_relocation(Relocation {
        offset: 1,
        symbol: "_answer".into(),
        kind: RelocKind::Abs32,
    });
    list.push_back(common::data_hunk("answers", "_answer", &42u32.to_le_bytes()));
    linker.add_hunks(list);
    let image = linker.link().unwrap();
    let plain = {
        let mut linker = test_linker();
        linker.add_hunks(entry_hunk(&exit_42()));
        linker.link().unwrap()
    };
    // The data hunk survived pruning; the image grew.
    assert!(image.len() > plain.len());
}

#[test]
fn test_tiny_header_output() {
    let mut linker = test_linker();
    linker.tiny_header = true;
    linker.tiny_import = true;
    linker.add_hunks(entry_hunk(&exit_42()));
    let image = linker.link().unwrap();
    // Tiny marker in the timestamp field.
    assert_eq!(&image[0x0c..0x0f], &[0x0f, 0xa3, 0x2d]);
    assert!(image.len() <= 400, "{} bytes", image.len());
}

#[test]
fn test_option_echo() {
    let mut linker = test_linker();
    linker.entry = "start".into();
    linker.hunk_tries = 7;
    linker.compression_tier = pepack::modellist::CompressionTier::Slow;
    linker.add_export(Export::parse("val=0x1000"));
    let mut out = Vec::new();
    linker.print_options(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("/SUBSYSTEM:CONSOLE"));
    assert!(text.contains("/ENTRY:start"));
    assert!(text.contains("/COMPMODE:SLOW"));
    assert!(text.contains("/ORDERTRIES:7"));
    assert!(text.contains("/EXPORT:val=0x00001000"));
}

#[test]
fn test_fast_tier_not_larger_than_instant() {
    // The model search must never lose to the starter models.
    let payload: Vec<u8> = exit_42()
        .iter()
        .cloned()
        .cycle()
        .take(120)
        .collect();
    let instant = {
        let mut linker = test_linker();
        linker.add_hunks(entry_hunk(&payload));
        linker.link().unwrap()
    };
    let fast = {
        let mut linker = test_linker();
        linker.compression_tier = pepack::modellist::CompressionTier::Fast;
        linker.add_hunks(entry_hunk(&payload));
        linker.link().unwrap()
    };
    // Model descriptors differ in size, so compare with headroom.
    assert!(fast.len() <= instant.len() + 24, "{} vs {}", fast.len(), instant.len());
}
