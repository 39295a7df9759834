//! Built-in stub blobs and their patch points.
//!
//! The header, depacker, import loaders and call detransformer are
//! pre-assembled machine-code blobs supplied as hunks whose well-known
//! symbols mark the slots the linker patches. This module carries a
//! built-in set: the PE header images are complete and byte-accurate
//! (including the overlap trick that makes the dword at file offset
//! 0x3C serve both as the PE header pointer and as the section
//! alignment), while the depacker and loader bodies are compact stand-
//! ins with the same markers and patch points as the production
//! blobs. A production build drops in externally assembled blobs via
//! `Stub::into_hunk` without touching the rest of the linker.
//!
//! # References
//!
//! * <https://learn.microsoft.com/en-us/windows/win32/debug/pe-format>

use crate::hunk::{Hunk, RelocKind, Relocation, Symbol, HUNK_IS_CODE, SYMBOL_IS_RELOCATABLE};

// Patch points of the header blobs. The `Ptr` names mark byte slots
// written directly; the others are absolute symbols added by the
// finalizer and consumed by relocations inside the blobs.
pub const SYM_HEADER: &str = "_header";
pub const SYM_DEPACK_ENTRY: &str = "_DepackEntry";
pub const SYM_HASH_TABLE: &str = "_HashTable";
pub const SYM_HASH_TABLE_SIZE: &str = "_HashTableSize";
pub const SYM_UNPACKED_DATA: &str = "_UnpackedData";
pub const SYM_IMAGE_BASE: &str = "_ImageBase";
pub const SYM_MODEL_MASK: &str = "_ModelMask";
pub const SYM_MODELS: &str = "_Models";
pub const SYM_PACKED_DATA: &str = "_PackedData";
pub const SYM_VIRTUAL_SIZE: &str = "_VirtualSize";
pub const SYM_LINKER_VERSION_PTR: &str = "_LinkerVersionPtr";
pub const SYM_SUBSYSTEM_PTR: &str = "_SubsystemTypePtr";
pub const SYM_CHARACTERISTICS_PTR: &str = "_CharacteristicsPtr";
pub const SYM_BASEPROB_PTR: &str = "_BaseProbPtr";
pub const SYM_MODEL_SKIP_PTR: &str = "_ModelSkipPtr";
pub const SYM_SPARE_NOP_PTR: &str = "_SpareNopPtr";
pub const SYM_EXPORT_RVA_PTR: &str = "_ExportTableRVAPtr";
pub const SYM_DATA_DIR_COUNT_PTR: &str = "_NumberOfDataDirectoriesPtr";
pub const SYM_SATURATE_PTR: &str = "_SaturatePtr";
pub const SYM_SATURATE_ADJUST1_PTR: &str = "_SaturateAdjust1Ptr";
pub const SYM_SATURATE_ADJUST2_PTR: &str = "_SaturateAdjust2Ptr";
pub const SYM_BASEPROB0_PTR: &str = "_BaseProbPtr0";
pub const SYM_BASEPROB1_PTR: &str = "_BaseProbPtr1";
pub const SYM_BOOST_FACTOR_PTR: &str = "_BoostFactorPtr";
pub const SYM_DEPACK_END_PTR: &str = "_DepackEndPositionPtr";
pub const SYM_VIRTUAL_SIZE_HIGH_PTR: &str = "_VirtualSizeHighBytePtr";
pub const SYM_HEADER_HASHES: &str = "_HeaderHashes";

/// An externally assembled blob: bytes plus named patch points.
pub struct Stub {
    pub name: &'static str,
    pub bytes: Vec<u8>,
    /// `(symbol, offset, flags)` triples.
    pub symbols: Vec<(&'static str, u32, u32)>,
    /// `(offset, symbol)` pairs resolved as 32-bit absolute slots.
    pub relocations: Vec<(usize, &'static str)>,
}

impl Stub {
    pub fn into_hunk(self, flags: u32) -> Hunk {
        let mut hunk = Hunk::new(self.name, flags, 0, self.bytes, 0);
        for (name, offset, symbol_flags) in self.symbols {
            hunk.add_symbol(Symbol::new(name, offset, symbol_flags));
        }
        for (offset, symbol) in self.relocations {
            hunk.add_relocation(Relocation {
                offset,
                symbol: symbol.to_string(),
                kind: RelocKind::Abs32,
            });
        }
        hunk
    }
}

/// Incrementally builds a blob, recording labels and patch slots.
struct StubBuilder {
    stub: Stub,
}

impl StubBuilder {
    fn new(name: &'static str) -> Self {
        Self {
            stub: Stub { name, bytes: Vec::new(), symbols: Vec::new(), relocations: Vec::new() },
        }
    }

    fn offset(&self) -> usize {
        self.stub.bytes.len()
    }

    fn label(&mut self, name: &'static str) {
        let offset = self.offset() as u32;
        self.stub.symbols.push((name, offset, SYMBOL_IS_RELOCATABLE));
    }

    /// Records an absolute constant attached to the blob.
    fn constant(&mut self, name: &'static str, value: u32) {
        self.stub.symbols.push((name, value, 0));
    }

    fn u8(&mut self, value: u8) {
        self.stub.bytes.push(value);
    }

    fn u16(&mut self, value: u16) {
        self.stub.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.stub.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.stub.bytes.extend_from_slice(bytes);
    }

    /// A 32-bit slot relocated against `symbol`, preset with `addend`.
    fn reloc32(&mut self, symbol: &'static str, addend: u32) {
        let offset = self.offset();
        self.stub.relocations.push((offset, symbol));
        self.u32(addend);
    }

    fn pad_to(&mut self, offset: usize) {
        assert!(self.offset() <= offset, "layout overran 0x{:x}", offset);
        self.stub.bytes.resize(offset, 0);
    }

    fn finish(self) -> Stub {
        self.stub
    }
}

/// Depacker code starts right after the data directories the loader
/// actually reads; the remaining directory slots are reused as code.
const DEPACKER_OFFSET: usize = 0x84;

/// Emits the DOS/COFF/optional header shared by both headers. `tiny`
/// plants the tiny-header marker in the timestamp field.
fn emit_pe_headers(b: &mut StubBuilder, tiny: bool) {
    b.label(SYM_HEADER);
    b.bytes(b"MZ");
    // Linker version digits live in the DOS header.
    b.label(SYM_LINKER_VERSION_PTR);
    b.bytes(&[crate::LINKER_VERSION_MAJOR, crate::LINKER_VERSION_MINOR]);
    // PE signature at offset 4; the dword at 0x3C points here.
    b.bytes(b"PE\0\0");
    b.u16(0x014c); // Machine: i386
    b.u16(0); // NumberOfSections: none, the image is the headers
    if tiny {
        // Timestamp field doubles as the tiny-header marker plus the
        // address of the packed stream: BT [imm32].
        b.bytes(&[0x0f, 0xa3, 0x2d]);
        b.reloc32(SYM_PACKED_DATA, 0);
        b.u8(0); // tail of PointerToSymbolTable
        b.pad_to(0x18);
    } else {
        b.u32(0); // TimeDateStamp
        b.u32(0); // PointerToSymbolTable
        b.u32(0); // NumberOfSymbols
    }
    b.u16(0x00e0); // SizeOfOptionalHeader
    b.label(SYM_CHARACTERISTICS_PTR);
    b.u16(0x010f); // EXECUTABLE | 32BIT | no relocations
    // Optional header.
    b.u16(0x010b); // PE32 magic
    b.bytes(&[
        crate::LINKER_VERSION_MAJOR - b'0',
        crate::LINKER_VERSION_MINOR - b'0',
    ]);
    b.u32(0); // SizeOfCode
    b.u32(0); // SizeOfInitializedData
    b.u32(0); // SizeOfUninitializedData
    b.u32(DEPACKER_OFFSET as u32); // AddressOfEntryPoint
    b.u32(0); // BaseOfCode
    b.u32(0); // BaseOfData
    b.reloc32(SYM_IMAGE_BASE, 0);
    // This dword is both SectionAlignment and the PE header pointer
    // read from 0x3C.
    assert_eq!(b.offset(), 0x3c);
    b.u32(4); // SectionAlignment / PE header offset
    b.u32(4); // FileAlignment
    b.u32(4); // OS version 4.0
    b.u32(0); // image version
    b.u32(4); // subsystem version 4.0
    b.u32(0); // Win32VersionValue
    if tiny {
        b.u32(0x20000); // SizeOfImage floor; the depacker grows it
    } else {
        b.reloc32(SYM_VIRTUAL_SIZE, 0x20000);
    }
    b.u32(0x200); // SizeOfHeaders
    b.u32(0); // CheckSum
    assert_eq!(b.offset(), 0x60);
    b.label(SYM_SUBSYSTEM_PTR);
    b.u16(2); // Subsystem, patched per configuration
    b.u16(0); // DllCharacteristics
    b.u32(0x100000); // SizeOfStackReserve
    b.u32(0x1000); // SizeOfStackCommit
    b.u32(0x100000); // SizeOfHeapReserve
    b.u32(0); // SizeOfHeapCommit
    b.u32(0); // LoaderFlags
    assert_eq!(b.offset(), 0x78);
    b.label(SYM_DATA_DIR_COUNT_PTR);
    b.u32(0); // NumberOfRvaAndSizes, raised to 1 for exports
    b.label(SYM_EXPORT_RVA_PTR);
    b.u32(0); // export directory RVA
    b.u32(0); // export directory size
    assert_eq!(b.offset(), DEPACKER_OFFSET);
}

/// The header blob for the multi-model depacker.
pub fn header_4k() -> Hunk {
    let mut b = StubBuilder::new("header");
    emit_pe_headers(&mut b, false);
    b.label(SYM_DEPACK_ENTRY);
    b.u8(0xbe); // MOV ESI, models
    b.reloc32(SYM_MODELS, 0);
    b.u8(0xbf); // MOV EDI, hash table
    b.reloc32(SYM_HASH_TABLE, 0);
    b.u8(0xb9); // MOV ECX, table entries
    b.reloc32(SYM_HASH_TABLE_SIZE, 0);
    b.bytes(&[0x31, 0xc0, 0xf3, 0xab]); // XOR EAX,EAX; REP STOSD
    b.u8(0x6a); // PUSH baseprob
    b.label(SYM_BASEPROB_PTR);
    b.u8(crate::compress::BASE_PROB as u8);
    b.u8(0x6a); // PUSH model skip
    b.label(SYM_MODEL_SKIP_PTR);
    b.u8(0);
    // Counter saturation is spliced in here when enabled; the two
    // short jumps around it get their displacements adjusted.
    b.label(SYM_SATURATE_PTR);
    b.bytes(&[0x90, 0x90, 0x90, 0x90, 0x90]);
    b.u8(0xeb); // JMP SHORT over the decode loop tail
    b.label(SYM_SATURATE_ADJUST1_PTR);
    b.u8(0x00);
    b.u8(0xeb);
    b.label(SYM_SATURATE_ADJUST2_PTR);
    b.u8(0x05);
    b.label(SYM_SPARE_NOP_PTR);
    b.u8(0x90); // becomes PUSH EDI when the payload starts with POP EDI
    b.bytes(&[0x60, 0xad, 0x91, 0xf7, 0xe1]); // PUSHA; LODSD; XCHG; MUL
    b.bytes(&[0x5a, 0x7b, 0x00, 0xc3]); // depack-done return marker
    b.u8(0xb8); // MOV EAX, unpacked data
    b.reloc32(SYM_UNPACKED_DATA, 0);
    b.bytes(&[0xff, 0xe0]); // JMP EAX
    b.finish().into_hunk(HUNK_IS_CODE)
}

/// The header blob for the tiny depacker. The single-model scalars are
/// byte slots inside its code.
pub fn header_1k() -> Hunk {
    let mut b = StubBuilder::new("header");
    emit_pe_headers(&mut b, true);
    b.label(SYM_DEPACK_ENTRY);
    b.u8(0x6a); // PUSH baseprob0
    b.label(SYM_BASEPROB0_PTR);
    b.u8(4);
    b.bytes(&[0x3d, 0x00, 0x00, 0x00, 0x00]); // CMP EAX, 0
    b.u8(0x6a); // PUSH baseprob1
    b.label(SYM_BASEPROB1_PTR);
    b.u8(4);
    b.u8(0x68); // PUSH model mask
    b.reloc32(SYM_MODEL_MASK, 0);
    b.bytes(&[0x7f, 0x00]); // JG $+2
    b.u8(0xb1); // MOV CL, boost
    b.label(SYM_BOOST_FACTOR_PTR);
    b.u8(6);
    b.bytes(&[0x89, 0xe6]); // MOV ESI, ESP
    b.bytes(&[0x66, 0x81, 0xff]); // CMP DI, depack end
    b.label(SYM_DEPACK_END_PTR);
    b.u16(0);
    b.u8(0x68); // PUSH virtual size
    b.bytes(&[0x00, 0x00, 0x02]);
    b.label(SYM_VIRTUAL_SIZE_HIGH_PTR);
    b.u8(0x00);
    b.u8(0xb8); // MOV EAX, unpacked data
    b.reloc32(SYM_UNPACKED_DATA, 0);
    b.bytes(&[0xff, 0xe0]); // JMP EAX
    b.finish().into_hunk(HUNK_IS_CODE)
}

/// Legacy header recognised on old input files: the PE header sits at
/// offset 12 and the version digits at offset 38.
pub fn header_compat() -> Hunk {
    let mut b = StubBuilder::new("header");
    b.label(SYM_HEADER);
    b.bytes(b"MZ");
    b.pad_to(12);
    b.bytes(b"PE\0\0");
    b.u16(0x014c);
    b.u16(0);
    b.pad_to(38);
    b.label(SYM_LINKER_VERSION_PTR);
    b.bytes(&[crate::LINKER_VERSION_MAJOR, crate::LINKER_VERSION_MINOR]);
    b.pad_to(0x3c);
    b.u32(12);
    b.pad_to(0x5c + 12);
    b.label(SYM_SUBSYSTEM_PTR);
    b.u16(2);
    b.pad_to(0x90);
    b.finish().into_hunk(HUNK_IS_CODE)
}

/// Stand-alone depacker paired with the compatibility header.
pub fn depacker_compat() -> Hunk {
    let mut b = StubBuilder::new("depacker");
    b.label(SYM_DEPACK_ENTRY);
    b.bytes(&[0x60, 0xad]); // PUSHA; LODSD
    b.label(SYM_SATURATE_PTR);
    b.bytes(&[0x90, 0x90, 0x90, 0x90, 0x90]);
    b.u8(0xeb);
    b.label(SYM_SATURATE_ADJUST1_PTR);
    b.u8(0x00);
    b.u8(0xeb);
    b.label(SYM_SATURATE_ADJUST2_PTR);
    b.u8(0x05);
    b.bytes(&[0x61, 0xc3]); // POPA; RET
    b.finish().into_hunk(HUNK_IS_CODE)
}

/// The call detransformer, linked at the front of the code so the
/// payload starts with `POP EDI` whenever the transform ran.
pub fn calltrans_stub() -> Hunk {
    let mut b = StubBuilder::new("call detransformer");
    b.label(crate::transform::SYM_CALLTRANS);
    b.u8(0x5f); // POP EDI
    b.u8(0xb9); // MOV ECX, number of transformed calls
    b.u32(0);
    // Scan-and-rewrite loop.
    b.bytes(&[0xad, 0x29, 0xf8, 0x66, 0xab, 0xe2, 0xf9]);
    let size = b.offset() as u32;
    b.constant(crate::transform::SYM_CALLTRANS_SIZE, size);
    b.finish().into_hunk(HUNK_IS_CODE)
}

/// PEB-walking loader body shared by the ordinary import stubs.
const IMPORT_LOADER_BODY: [u8; 18] = [
    0x64, 0x67, 0x8b, 0x47, 0x30, 0x8b, 0x40, 0x0c, 0x8b, 0x40, 0x0c, 0x8b, 0x00, 0x8b, 0x00,
    0x8b, 0x68, 0x18,
];

/// Truncated-hash loader body used by the tiny import stub.
const TINY_IMPORT_LOADER_BODY: [u8; 16] = [
    0x58, 0x8b, 0x40, 0x0c, 0x8b, 0x40, 0x0c, 0x8b, 0x40, 0x00, 0x8b, 0x40, 0x00, 0x8b, 0x40,
    0x18,
];

/// One of the six ordinary import loader variants. Safe variants
/// report a missing DLL instead of crashing, which is why they call
/// `MessageBoxA`; every variant drives `LoadLibraryA`.
pub fn import_loader_stub(safe: bool, fallback: bool, range: bool) -> Hunk {
    let mut b = StubBuilder::new("import loader");
    b.label("_Import");
    b.u8(0xbb); // MOV EBX, hash block
    b.reloc32(SYM_HEADER_HASHES, 0);
    b.u8(0xbe); // MOV ESI, DLL names
    b.reloc32("_DLLNames", 0);
    b.bytes(&IMPORT_LOADER_BODY);
    b.bytes(&[0xff, 0x15]); // CALL [LoadLibraryA]
    b.reloc32("__imp__LoadLibraryA@4", 0);
    if range {
        // Ordinal-range resolution: walk the export ordinals.
        b.bytes(&[0x0f, 0xb7, 0x04, 0x4f, 0x41, 0xe2, 0xfa]);
    }
    if fallback {
        // Retry the load with the fallback name on failure.
        b.bytes(&[0x85, 0xc0, 0x75, 0x02, 0xeb, 0xee]);
    }
    if safe {
        b.bytes(&[0x85, 0xc0, 0x75, 0x08]); // TEST EAX,EAX; JNZ ok
        b.bytes(&[0x6a, 0x00]); // PUSH 0
        b.bytes(&[0xff, 0x15]); // CALL [MessageBoxA]
        b.reloc32("__imp__MessageBoxA@16", 0);
    }
    b.bytes(&[0xab, 0xe2, 0xd5]); // STOSD; LOOP
    b.finish().into_hunk(HUNK_IS_CODE)
}

/// The tiny import loader; its hash shift and longest-DLL-name bytes
/// are patched after import synthesis.
pub fn import_loader_1k() -> Hunk {
    let mut b = StubBuilder::new("import loader");
    b.label("_Import");
    b.u8(0xbe); // MOV ESI, DLL names
    b.reloc32("_DLLNames", 0);
    b.bytes(&TINY_IMPORT_LOADER_BODY);
    b.bytes(&[0xc1, 0xe8]); // SHR EAX, hash shift
    b.label(crate::imports::SYM_HASH_SHIFT);
    b.u8(0);
    b.u8(0xb1); // MOV CL, longest DLL name
    b.label(crate::imports::SYM_MAX_NAME_LENGTH);
    b.u8(0);
    b.bytes(&[0xab, 0xe2, 0xf4]); // STOSD; LOOP
    b.finish().into_hunk(HUNK_IS_CODE)
}

/// Minimal process-exit helper, handy for raw code blobs that fall off
/// their end.
pub fn runtime_entry_stub() -> Hunk {
    let mut b = StubBuilder::new("runtime");
    b.label("_ExitStub");
    b.bytes(&[0x6a, 0x00]); // PUSH 0
    b.bytes(&[0xff, 0x15]); // CALL [ExitProcess]
    b.reloc32("__imp__ExitProcess@4", 0);
    b.finish().into_hunk(HUNK_IS_CODE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_4k_layout() {
        let header = header_4k();
        let data = header.data();
        assert_eq!(&data[0..2], b"MZ");
        assert_eq!(&data[2..4], &[crate::LINKER_VERSION_MAJOR, crate::LINKER_VERSION_MINOR]);
        assert_eq!(&data[4..8], b"PE\0\0");
        // The PE pointer at 0x3C is 4, overlapping SectionAlignment.
        assert_eq!(u32::from_le_bytes(data[0x3c..0x40].try_into().unwrap()), 4);
        // Entry point at the depacker.
        assert_eq!(
            u32::from_le_bytes(data[0x2c..0x30].try_into().unwrap()),
            DEPACKER_OFFSET as u32
        );
        // Patch points land where the inspection scans expect.
        assert_eq!(header.find_symbol(SYM_SUBSYSTEM_PTR).unwrap().value, 0x60);
        assert_eq!(header.find_symbol(SYM_CHARACTERISTICS_PTR).unwrap().value, 0x1a);
        assert_eq!(header.find_symbol(SYM_DATA_DIR_COUNT_PTR).unwrap().value, 0x78);
        assert_eq!(header.find_symbol(SYM_EXPORT_RVA_PTR).unwrap().value, 0x7c);
        // The hash-size marker: BF imm32 immediately followed by B9.
        let entry = header.find_symbol(SYM_DEPACK_ENTRY).unwrap().value as usize;
        let bf = data[entry..].iter().position(|&b| b == 0xbf).unwrap() + entry;
        assert_eq!(data[bf + 5], 0xb9);
    }

    #[test]
    fn test_header_1k_marker() {
        let header = header_1k();
        let data = header.data();
        assert_eq!(&data[0x0c..0x0f], &[0x0f, 0xa3, 0x2d]);
        // The scalar pattern the inspector scans for.
        let p = header.find_symbol(SYM_BASEPROB0_PTR).unwrap().value as usize - 1;
        assert_eq!(data[p], 0x6a);
        assert_eq!(data[p + 2], 0x3d);
        assert_eq!(&data[p + 3..p + 7], &[0, 0, 0, 0]);
        assert_eq!(data[p + 7], 0x6a);
        assert_eq!(
            header.find_symbol(SYM_BASEPROB1_PTR).unwrap().value as usize,
            p + 8
        );
        // Boost pattern: 7F ?? B1 boost 89 E6.
        let q = header.find_symbol(SYM_BOOST_FACTOR_PTR).unwrap().value as usize - 3;
        assert_eq!(data[q], 0x7f);
        assert_eq!(data[q + 2], 0xb1);
        assert_eq!(&data[q + 4..q + 6], &[0x89, 0xe6]);
        // Raw-size pattern: 66 81 FF imm16.
        let r = header.find_symbol(SYM_DEPACK_END_PTR).unwrap().value as usize - 3;
        assert_eq!(&data[r..r + 3], &[0x66, 0x81, 0xff]);
        // High-byte patch has its low bytes just before it.
        let v = header.find_symbol(SYM_VIRTUAL_SIZE_HIGH_PTR).unwrap().value as usize;
        let low = u32::from_le_bytes(data[v - 3..v + 1].try_into().unwrap()) & 0xff_ffff;
        assert_eq!(low, 0x20000);
    }

    #[test]
    fn test_calltrans_stub_shape() {
        let stub = calltrans_stub();
        assert_eq!(stub.data()[0], 0x5f);
        assert_eq!(stub.data()[1], 0xb9);
        let size = stub.find_symbol(crate::transform::SYM_CALLTRANS_SIZE).unwrap();
        assert_eq!(size.value as usize, stub.raw_size());
        assert_eq!(size.flags & SYMBOL_IS_RELOCATABLE, 0);
    }

    #[test]
    fn test_import_loader_variants_differ() {
        let plain = import_loader_stub(false, false, false);
        let safe = import_loader_stub(true, false, false);
        let safe_range = import_loader_stub(true, false, true);
        assert!(plain.raw_size() < safe.raw_size());
        assert!(safe.raw_size() < safe_range.raw_size());
        assert!(safe
            .relocations
            .iter()
            .any(|r| r.symbol == "__imp__MessageBoxA@16"));
        assert!(!plain
            .relocations
            .iter()
            .any(|r| r.symbol == "__imp__MessageBoxA@16"));
    }
}
