//! Symbolic references: the unresolved `ref` value kind.
//!
//! A reference is a dotted path of `(name, generic-args)` entries, e.g.
//! `Outer.Inner<i32>.member`. It is produced by the loader wherever the
//! source language named something without the loader being able to look it
//! up yet (an import target, a class's parent, an operand naming a member)
//! and consumed by [`crate::resolver::resolve`].

use std::fmt;

use crate::intern::StringId;
use crate::types::Type;

/// One segment of a [`Reference`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefEntry {
    pub name: StringId,
    pub generic_args: Vec<Type>,
}

impl RefEntry {
    #[must_use]
    pub fn simple(name: StringId) -> Self {
        Self { name, generic_args: Vec::new() }
    }
}

/// An ordered, possibly-generic dotted path awaiting resolution.
///
/// Per the data model invariant, a fully resolved reference is never itself
/// a `ref` value again — [`crate::resolver::resolve`] always returns either a
/// concrete value or a structured not-found naming the deepest resolved
/// prefix of `self`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reference {
    pub entries: Vec<RefEntry>,
}

impl Reference {
    #[must_use]
    pub fn new(entries: Vec<RefEntry>) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn single(name: StringId) -> Self {
        Self { entries: vec![RefEntry::simple(name)] }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Renders a reference using an interner, for diagnostics and tracebacks.
pub struct DisplayRef<'a> {
    pub ref_: &'a Reference,
    pub interns: &'a crate::intern::Interner,
}

impl fmt::Display for DisplayRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.ref_.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", self.interns.resolve(entry.name))?;
            if !entry.generic_args.is_empty() {
                write!(f, "<...>")?;
            }
        }
        Ok(())
    }
}

// `Display` without an interner falls back to raw ids; used by errors that
// may outlive the interner they were raised against (e.g. serialized
// tracebacks). Prefer `DisplayRef` when an interner is in hand.
impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "#{}", entry.name.index())?;
        }
        Ok(())
    }
}
