//! Linker and compressing packer for tiny 32-bit Windows executables.
//!
//! The library links relocatable hunks into one flat image at a fixed
//! base and wraps it, compressed by a context-mixing arithmetic coder,
//! in a self-extracting PE header. The point is the smallest runnable
//! file, bought with compile-time search: context models, the context
//! table size and even the order of the input hunks are all optimised
//! against the actual coded size.
//!
//! # Linking
//!
//! Feed parsed hunks to a [`linker::Linker`], configure it, and call
//! `link()` for the finished executable bytes. Object and library
//! parsing is the loader's job; the built-in stub blobs in [`stubs`]
//! stand in for externally assembled ones.
//!
//! # Inspection
//!
//! [`inspect::inspect`] classifies an existing output file and
//! recovers its coding parameters from the documented byte offsets.
//!
//! # References
//!
//! * <https://learn.microsoft.com/en-us/windows/win32/debug/pe-format>
//! * Context mixing follows the PAQ family of compressors; see
//!   <http://mattmahoney.net/dc/dce.html>.

pub mod aritcode;
pub mod compress;
pub mod error;
pub mod exports;
pub mod finalize;
pub mod hashopt;
pub mod hunk;
pub mod hunklist;
pub mod imports;
pub mod inspect;
pub mod linker;
pub mod log;
pub mod modellist;
pub mod modelsearch;
pub mod progress;
pub mod report;
pub mod reuse;
pub mod sorters;
pub mod stubs;
pub mod transform;

pub use error::{Error, ErrorKind};

/// Load address of the final image.
pub const IMAGE_BASE: u32 = 0x400000;
/// Address the payload is unpacked to.
pub const CODE_BASE: u32 = 0x410000;
/// Section granularity separating header, unpacked image and table.
pub const SECTION_SIZE: u32 = 0x10000;

/// Version digits stored in the DOS header.
pub const LINKER_VERSION_MAJOR: u8 = b'2';
pub const LINKER_VERSION_MINOR: u8 = b'2';
