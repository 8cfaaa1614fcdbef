use thiserror::Error;

use crate::HeapTag;

/// Recoverable conditions surfaced to the immediate caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("buffer was mutated after it was frozen")]
    UseAfterFreeze,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Broken heap or root-stack discipline. These are programmer errors and
/// are never recovered from at runtime, see [`fatal`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("heap used before init")]
    NotInitialized,
    #[error("heap initialized twice")]
    AlreadyInitialized,
    #[error("invalid heap settings: {0}")]
    InvalidSettings(&'static str),
    #[error("root frame {found} closed while {expected} is still open above it")]
    FrameOutOfOrder { expected: u64, found: u64 },
    #[error("root frame {0} is not open")]
    FrameNotOpen(u64),
    #[error("no root frame is open")]
    NoOpenFrame,
    #[error("heap shut down with {open} root frame(s) still open")]
    FramesOpenAtShutdown { open: usize },
    #[error("shape {shape}: pointer field at offset {offset} is not word aligned")]
    MisalignedField { shape: &'static str, offset: usize },
    #[error("shape {shape}: pointer field at offset {offset} lies outside the {size} byte payload")]
    FieldOutOfBounds {
        shape: &'static str,
        offset: usize,
        size: usize,
    },
    #[error("shape {shape}: pointer word {word} does not fit in the field mask")]
    MaskOverflow { shape: &'static str, word: usize },
    #[error("shape {shape}: payload alignment {align} exceeds the word size")]
    OverAligned { shape: &'static str, align: usize },
    #[error("shape {shape}: payload type needs drop glue")]
    NeedsDrop { shape: &'static str },
    #[error("shape {shape}: derived payload is smaller than its base {base}")]
    BaseLargerThanDerived {
        shape: &'static str,
        base: &'static str,
    },
    #[error("too many registered shapes")]
    TooManyShapes,
    #[error("{tag:?} object of {size} bytes cannot carry field mask {mask:#x}")]
    MaskBeyondPayload { tag: HeapTag, mask: u32, size: usize },
    #[error("scanned object size {size} is not a multiple of the word size")]
    UnalignedScannedSize { size: usize },
}

/// Conditions that terminate execution.
#[derive(Debug, Error)]
pub enum Fatal {
    #[error(
        "out of memory: requested {requested} bytes with {live} bytes live"
    )]
    OutOfMemory { requested: usize, live: usize },
    #[error("invariant violation: {0}")]
    Invariant(#[from] Violation),
}

/// Report a fatal condition and terminate the current thread of control.
#[cold]
#[track_caller]
pub fn fatal(kind: impl Into<Fatal>) -> ! {
    let kind = kind.into();
    log::error!("{kind}");
    panic!("{kind}")
}
