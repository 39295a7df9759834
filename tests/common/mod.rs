use pepack::hunk::{Hunk, Symbol, HUNK_IS_CODE, HUNK_IS_DATA, HUNK_IS_WRITEABLE, SYMBOL_IS_RELOCATABLE};
use pepack::hunklist::HunkList;
use pepack::linker::{Linker, Subsystem};
use pepack::log::{Logger, MemorySink};
use pepack::modellist::CompressionTier;

/// A linker with quiet logging and a small context-table budget, so
/// tests stay fast.
pub fn test_linker() -> Linker {
    let mut linker = Linker::new(Logger::new(Box::new(MemorySink::default())));
    linker.subsystem = Subsystem::Console;
    linker.compression_tier = CompressionTier::Instant;
    linker.hash_size = 1 << 20;
    linker
}

/// A single code hunk defining the console entry point at offset 0.
pub fn entry_hunk(code: &[u8]) -> HunkList {
    let mut hunk = Hunk::new("entry", HUNK_IS_CODE, 0, code.to_vec(), 0);
    hunk.add_symbol(Symbol::new("mainCRTStartup", 0, SYMBOL_IS_RELOCATABLE));
    let mut list = HunkList::new();
    list.push_back(hunk);
    list
}

/// `mov eax, 42; ret`.
pub fn exit_42() -> Vec<u8> {
    vec![0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3]
}

/// A data hunk with a named symbol, for relocation targets.
#[allow(dead_code)]
pub fn data_hunk(name: &str, symbol: &str, data: &[u8]) -> Hunk {
    let mut hunk = Hunk::new(name, HUNK_IS_DATA | HUNK_IS_WRITEABLE, 0, data.to_vec(), 0);
    hunk.add_symbol(Symbol::new(symbol, 0, SYMBOL_IS_RELOCATABLE));
    hunk
}
