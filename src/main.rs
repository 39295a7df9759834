//! pepack links raw 32-bit x86 code blobs into a tiny self-extracting
//! Windows executable.
//!
//! # Linking
//!
//! ```sh
//! pepack -o packed.exe intro.bin
//! ```
//!
//! # Inspecting a previous output
//!
//! ```sh
//! pepack --inspect packed.exe
//! ```
//!
//! # Exit status
//!
//! Exit status is 0 if there was no error, or 1 if there was any kind
//! of error (I/O error, unresolved symbol, or a violated size
//! constraint).
//!
//! Object and library parsing lives in the external loader; the
//! built-in input format here is a flat binary that becomes a single
//! code hunk with the entry point at offset 0.

use std::env;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

use pepack::exports::Export;
use pepack::hunk::{Hunk, Symbol, HUNK_IS_CODE, SYMBOL_IS_RELOCATABLE};
use pepack::hunklist::HunkList;
use pepack::inspect;
use pepack::linker::{Linker, Subsystem};
use pepack::log::Logger;
use pepack::modellist::CompressionTier;
use pepack::progress::ConsoleProgress;
use pepack::reuse::ReuseType;

/// An error annotated with the path it concerns.
#[derive(Debug)]
struct PathError {
    path: Option<PathBuf>,
    err: pepack::Error,
}

impl PathError {
    fn new<P: AsRef<Path>>(path: P, err: pepack::Error) -> Self {
        Self { path: Some(path.as_ref().to_owned()), err }
    }
}

impl std::error::Error for PathError {}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PathError { path: None, err } => err.fmt(f),
            PathError { path: Some(path), err } => write!(f, "{}: {}", path.display(), err),
        }
    }
}

/// Loads a flat binary as one code hunk. The file stem and the
/// conventional entry names all resolve to offset 0.
fn load_flat_binary(path: &str, entry: &str) -> Result<HunkList, PathError> {
    let data = fs::read(path).map_err(|err| PathError::new(path, err.into()))?;
    let stem = Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string());
    let mut hunk = Hunk::new(&stem, HUNK_IS_CODE, 0, data, 0);
    for name in [entry, "mainCRTStartup", "WinMainCRTStartup", stem.as_str()] {
        if !name.is_empty() && hunk.find_symbol(name).is_none() {
            hunk.add_symbol(Symbol::new(name, 0, SYMBOL_IS_RELOCATABLE));
        }
    }
    let mut list = HunkList::new();
    list.push_back(hunk);
    Ok(list)
}

fn print_inspection(info: &inspect::ImageInfo) {
    println!("Header: {:?}", info.kind);
    println!("Linker version: {}.{}", info.version / 10, info.version % 10);
    println!(
        "Subsystem type: {}",
        if info.subsystem == 3 { "CONSOLE" } else { "WINDOWS" }
    );
    println!("Large address aware: {}", if info.large_address_aware { "YES" } else { "NO" });
    println!("Virtual size: {}", info.virtual_size);
    match info.kind {
        inspect::HeaderKind::Tiny => {
            println!("Total size: {}", info.raw_size);
            if let Some(models) = &info.models_1k {
                println!("Models: {}", models);
            }
        }
        _ => {
            println!("Saturate counters: {}", if info.saturate { "YES" } else { "NO" });
            if let Some(tier) = info.compression_tier {
                println!("Compression mode: {}", tier.name());
            }
            if let Some(size) = info.hashtable_size {
                println!("Hash size: {}", size);
            }
            println!("Code size: {}", info.split_point);
            println!("Data size: {}", info.raw_size.saturating_sub(info.split_point));
            if let Some(models) = &info.models_code {
                println!("Code models: {}", models);
            }
            if let Some(models) = &info.models_data {
                println!("Data models: {}", models);
            }
        }
    }
}

fn parse_tier(name: &str) -> Option<CompressionTier> {
    match name.to_ascii_uppercase().as_str() {
        "INSTANT" => Some(CompressionTier::Instant),
        "FAST" => Some(CompressionTier::Fast),
        "SLOW" => Some(CompressionTier::Slow),
        "VERYSLOW" => Some(CompressionTier::VerySlow),
        _ => None,
    }
}

fn parse_pair(spec: &str) -> Option<(String, String)> {
    let (from, to) = spec.split_once('=')?;
    Some((from.to_ascii_lowercase(), to.to_string()))
}

/// Prints a usage message to `w`.
fn print_usage<W: Write + ?Sized>(w: &mut W, opts: getopts::Options) -> io::Result<()> {
    let brief = format!(
        "\
Usage: {} [OPTION]... -o OUTPUT.EXE INPUT...\n\
Link flat code blobs into a compressed Windows executable.",
        env::args().next().unwrap()
    );
    write!(w, "{}", opts.usage(&brief))
}

fn run(matches: &getopts::Matches) -> Result<(), PathError> {
    if matches.opt_present("inspect") {
        for path in &matches.free {
            let data = fs::read(path).map_err(|err| PathError::new(path, err.into()))?;
            let info = inspect::inspect(&data).map_err(|err| PathError::new(path, err))?;
            print_inspection(&info);
        }
        return Ok(());
    }

    let mut linker = Linker::new(Logger::stderr());
    if let Some(subsystem) = matches.opt_str("subsystem") {
        linker.subsystem = match subsystem.to_ascii_uppercase().as_str() {
            "CONSOLE" => Subsystem::Console,
            _ => Subsystem::Windows,
        };
    }
    if let Some(entry) = matches.opt_str("entry") {
        linker.entry = entry;
    }
    if let Some(tier) = matches.opt_str("compmode") {
        match parse_tier(&tier) {
            Some(tier) => linker.compression_tier = tier,
            None => {
                return Err(PathError {
                    path: None,
                    err: pepack::Error::Unsupported { what: format!("compression mode '{}'", tier) },
                });
            }
        }
    }
    if let Some(mb) = matches.opt_str("hashsize").and_then(|s| s.parse::<u32>().ok()) {
        linker.hash_size = mb.saturating_mul(1024 * 1024).max(1024);
    }
    if let Some(tries) = matches.opt_str("hashtries").and_then(|s| s.parse().ok()) {
        linker.hash_tries = tries;
    }
    if let Some(tries) = matches.opt_str("ordertries").and_then(|s| s.parse().ok()) {
        linker.hunk_tries = tries;
    }
    if let Some(bits) = matches.opt_str("truncatefloats").and_then(|s| s.parse().ok()) {
        linker.truncate_floats = Some(bits);
    }
    if matches.opt_present("overridealignments") {
        let bits = matches
            .opt_str("overridealignments")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        linker.override_alignments = Some(bits);
    }
    linker.tiny_header = matches.opt_present("tinyheader");
    linker.tiny_import = matches.opt_present("tinyimport");
    linker.unalign_code = matches.opt_present("unaligncode");
    linker.run_initializers = !matches.opt_present("noinitializers");
    linker.safe_importing = !matches.opt_present("unsafeimport");
    linker.call_transform = !matches.opt_present("notransform");
    linker.print_report = matches.opt_present("verbose");
    if matches.opt_present("saturate") {
        linker.saturate = Some(true);
    }
    if matches.opt_present("largeaddressaware") {
        linker.large_address_aware = Some(true);
    }
    for dll in matches.opt_strs("range") {
        linker.range_dlls.push(dll.to_ascii_lowercase());
    }
    for spec in matches.opt_strs("replacedll") {
        if let Some((from, to)) = parse_pair(&spec) {
            linker.replace_dlls.insert(from, to);
        }
    }
    for spec in matches.opt_strs("fallbackdll") {
        if let Some((from, to)) = parse_pair(&spec) {
            linker.fallback_dlls.insert(from, to);
        }
    }
    for spec in matches.opt_strs("export") {
        linker.add_export(Export::parse(&spec));
    }
    if let Some(path) = matches.opt_str("reuse") {
        linker.reuse_path = path;
        linker.reuse_type = match matches.opt_str("reusemode").as_deref() {
            Some("write") => ReuseType::Write,
            Some("stable") => ReuseType::Stable,
            _ => ReuseType::Improve,
        };
    }
    if matches.opt_present("progress") {
        linker.set_progress(Box::new(ConsoleProgress::new()));
    }

    let output_path = matches.opt_str("o").unwrap_or_else(|| "out.exe".to_string());
    let entry = linker.entry.clone();
    for path in &matches.free {
        linker.add_hunks(load_flat_binary(path, &entry)?);
    }

    {
        let mut options = Vec::new();
        let _ = linker.print_options(&mut options);
        println!("Options:{}", String::from_utf8_lossy(&options));
    }

    let image = linker
        .link()
        .map_err(|err| PathError::new(&output_path, err))?;
    fs::write(&output_path, &image).map_err(|err| PathError::new(&output_path, err.into()))?;
    println!("Output file: {}", output_path);
    println!("Final file size: {}", image.len());
    Ok(())
}

fn main() {
    let mut opts = getopts::Options::new();
    opts.optopt("o", "output", "output executable", "FILE");
    opts.optflag("", "inspect", "describe an existing output file instead of linking");
    opts.optopt("", "subsystem", "CONSOLE or WINDOWS", "NAME");
    opts.optopt("", "entry", "entry point symbol", "SYMBOL");
    opts.optopt("", "compmode", "INSTANT, FAST, SLOW or VERYSLOW", "MODE");
    opts.optopt("", "hashsize", "context table budget in MiB", "N");
    opts.optopt("", "hashtries", "context table sizes to try", "N");
    opts.optopt("", "ordertries", "section orderings to try", "N");
    opts.optflag("", "tinyheader", "use the minimal header and coder");
    opts.optflag("", "tinyimport", "use the truncated-hash import loader");
    opts.optflag("", "saturate", "saturate context counters");
    opts.optflag("", "largeaddressaware", "set the large-address-aware bit");
    opts.optflag("", "unsafeimport", "skip the import failure report");
    opts.optflag("", "notransform", "disable the call transform");
    opts.optopt("", "truncatefloats", "round 8-byte floats to this many bits", "BITS");
    opts.optflagopt("", "overridealignments", "override section alignments", "BITS");
    opts.optflag("", "unaligncode", "drop alignment of code sections");
    opts.optflag("", "noinitializers", "do not run dynamic initializers");
    opts.optmulti("", "range", "use ordinal-range importing for this DLL", "DLL");
    opts.optmulti("", "replacedll", "import from another DLL", "FROM=TO");
    opts.optmulti("", "fallbackdll", "fall back to another DLL at load time", "FROM=TO");
    opts.optmulti("", "export", "export a symbol or value", "NAME[=SYMBOL|=VALUE]");
    opts.optopt("", "reuse", "reuse file path", "FILE");
    opts.optopt("", "reusemode", "write, stable or improve", "MODE");
    opts.optflag("", "progress", "show search progress");
    opts.optflag("", "verbose", "print the per-label compression report");
    opts.optflag("h", "help", "show this help");

    let matches = match opts.parse(env::args().skip(1)) {
        Ok(matches) => matches,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    };
    if matches.opt_present("h") {
        print_usage(&mut io::stdout(), opts).unwrap();
        return;
    }
    if matches.free.is_empty() {
        print_usage(&mut io::stderr(), opts).unwrap();
        eprintln!("\nNeed at least one input file");
        process::exit(1);
    }

    if let Err(err) = run(&matches) {
        eprintln!("{}", err);
        process::exit(1);
    }
}
