//! Error types for linking and packing.

use std::fmt;
use std::io;

/// Broad categories of failure, used when a caller only cares about the
/// class of problem rather than the specific condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An input could not be understood (unrecognised object, not a
    /// compressed executable, malformed reuse file).
    InputMalformed,
    /// A symbol lookup failed (entry point, export target, patch point).
    SymbolUnresolved,
    /// A hard limit or consistency rule was violated.
    ConstraintViolated,
    /// The operation is not supported in this configuration.
    Unsupported,
    /// An underlying I/O operation failed.
    Io,
}

/// An error that may occur while linking or packing.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    /// The input file is not of a supported type.
    UnknownInput { file: String },
    /// The entry point symbol was not found in any loaded hunk.
    EntryNotFound { name: String },
    /// A symbol referenced by a relocation or an export does not exist.
    SymbolNotFound { name: String },
    /// An exported symbol could not be resolved.
    ExportSymbolNotFound { name: String, export: String },
    /// An integer export collides with an existing symbol.
    ExportCollision { name: String },
    /// The finished executable exceeds the maximum supported size.
    OutputTooLarge { size: usize, max: usize },
    /// A DLL fallback was configured together with unsafe importing.
    FallbackWithoutSafeImport,
    /// The input file is not a compressed executable we produced.
    NotCompressedExecutable,
    /// A named patch point is missing from a stub blob.
    PatchPointMissing { symbol: String },
    /// A patch or relocation site lies outside its hunk's buffer.
    PatchOutOfRange { symbol: String, offset: usize, len: usize },
    /// A model list cannot be encoded into the 32-bit weight mask.
    ModelBudgetExceeded { models: usize, max_weight: u8 },
    /// The operation only works on output files, or on a different host.
    Unsupported { what: String },
    /// A reuse file could not be parsed.
    ReuseFormat { line: usize, message: String },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::UnknownInput { .. }
            | Error::NotCompressedExecutable
            | Error::ReuseFormat { .. } => ErrorKind::InputMalformed,
            Error::EntryNotFound { .. }
            | Error::SymbolNotFound { .. }
            | Error::ExportSymbolNotFound { .. }
            | Error::PatchPointMissing { .. } => ErrorKind::SymbolUnresolved,
            Error::ExportCollision { .. }
            | Error::OutputTooLarge { .. }
            | Error::FallbackWithoutSafeImport
            | Error::PatchOutOfRange { .. }
            | Error::ModelBudgetExceeded { .. } => ErrorKind::ConstraintViolated,
            Error::Unsupported { .. } => ErrorKind::Unsupported,
        }
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(err) => err.fmt(f),
            Error::UnknownInput { file } =>
                write!(f, "{}: unsupported file type", file),
            Error::EntryNotFound { name } =>
                write!(f, "cannot find entry point '{}'", name),
            Error::SymbolNotFound { name } =>
                write!(f, "cannot find symbol '{}'", name),
            Error::ExportSymbolNotFound { name, export } =>
                write!(f, "cannot find symbol '{}' to be exported under name '{}'", name, export),
            Error::ExportCollision { name } =>
                write!(f, "cannot create integer symbol '{}' for export: symbol already exists", name),
            Error::OutputTooLarge { size, max } =>
                write!(f, "output file of {} bytes exceeds the maximum supported size of {} bytes", size, max),
            Error::FallbackWithoutSafeImport =>
                write!(f, "DLL fallback cannot be used with unsafe importing"),
            Error::NotCompressedExecutable =>
                write!(f, "input file is not a compressed executable"),
            Error::PatchPointMissing { symbol } =>
                write!(f, "stub has no patch point '{}'", symbol),
            Error::PatchOutOfRange { symbol, offset, len } =>
                write!(f, "patch '{}' at offset {} does not fit in a hunk of {} bytes", symbol, offset, len),
            Error::ModelBudgetExceeded { models, max_weight } =>
                write!(f, "{} models with maximum weight {} cannot be encoded in a 32-bit weight mask", models, max_weight),
            Error::Unsupported { what } =>
                write!(f, "{} is not supported", what),
            Error::ReuseFormat { line, message } =>
                write!(f, "reuse file line {}: {}", line, message),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}
