//! Error taxonomy.
//!
//! Two families exist. [`LoaderError`] can only occur while a module is
//! being read from a byte stream; it is never catchable from bytecode and is
//! always returned directly to the caller of [`crate::host::Runtime::load_module`].
//! Everything else is a [`Fault`], which the interpreter turns into a thrown
//! value so that `PUSHXH`/`LEXCEPT` can catch it like any other exception.

use std::fmt;

use crate::reference::Reference;
use crate::value::ValueId;

/// Failure modes of the module loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderError {
    BadMagic,
    UnsupportedVersion(u8),
    UnknownTag(u32),
    PrematureEof,
    /// `no-conflict` was requested and a value already exists at the path.
    Conflict(String),
    /// `no-reload` was requested and the module is already installed.
    AlreadyLoaded(String),
    /// The host locator returned nothing for a required import.
    ImportNotFound(Reference),
    /// A deferred type (parent class, implemented interface) could not be
    /// resolved on first use.
    UnresolvedDeferredType(Reference),
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "not an SLX module: bad magic bytes"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported SLX format version {v}"),
            Self::UnknownTag(t) => write!(f, "unknown value tag {t} in module stream"),
            Self::PrematureEof => write!(f, "module stream ended before expected"),
            Self::Conflict(path) => write!(f, "a value already exists at module path `{path}`"),
            Self::AlreadyLoaded(path) => write!(f, "module `{path}` is already loaded"),
            Self::ImportNotFound(r) => write!(f, "locator could not resolve import `{r}`"),
            Self::UnresolvedDeferredType(r) => write!(f, "could not resolve deferred type `{r}`"),
        }
    }
}

impl std::error::Error for LoaderError {}

/// Every interpreter-level failure that can occur while executing a fiber.
///
/// A `Fault` is raised by an opcode handler and immediately wrapped into a
/// thrown exception value by [`crate::vm::Interpreter`] — from that point on
/// it is indistinguishable from a bytecode-issued `THROW` and unwinds through
/// `PUSHXH` handlers exactly the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Fault {
    NotFound,
    MismatchedType,
    IncompatibleType,
    InvalidOpcode,
    InvalidOperands,
    InvalidArguments,
    AccessViolation,
    /// A container index (`AT`) was out of bounds or otherwise malformed,
    /// distinct from `AccessViolation`'s visibility-rule meaning.
    InvalidSubscript,
    NullReference,
    FrameBoundary,
    StackOverflow,
    /// `THROW` unwound past the bottom of the fiber's major frame stack.
    UncaughtException,
    Aborted,
}

impl Fault {
    /// Whether this fault ends the fiber unconditionally rather than being
    /// catchable by a handler already on the minor frame stack.
    ///
    /// Only true once the unwind has already run out of frames (the
    /// interpreter sets this when it converts `UncaughtException`/`Aborted`
    /// into the fiber's terminal state); as a raw `Fault` returned by an
    /// opcode it is always catchable like any other throwable.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::UncaughtException | Self::Aborted)
    }
}

/// A [`Fault`] paired with a human-readable message, as produced by opcode
/// handlers before the interpreter wraps it into a thrown value.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub fault: Fault,
    pub message: String,
    /// The thrown value itself, for a `THROW`-originated error — what
    /// `LEXCEPT`/`RXCPT` ultimately expose to a handler.
    pub payload: Option<ValueId>,
}

impl RuntimeError {
    pub fn new(fault: Fault, message: impl Into<String>) -> Self {
        Self { fault, message: message.into(), payload: None }
    }

    #[must_use]
    pub fn with_payload(mut self, value: ValueId) -> Self {
        self.payload = Some(value);
        self
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.fault, self.message)
    }
}

impl std::error::Error for RuntimeError {}

pub type RunResult<T> = Result<T, RuntimeError>;
