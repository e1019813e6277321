//! Accumulating diagnostics for storage operations.
//!
//! Operations on spans and stripes report through an [`Errata`] chain rather
//! than failing on the first problem: a chain carries zero or more notes,
//! most recent first, and a chain without an [`Severity::Error`] note still
//! counts as success. This lets dry-run writes and partially damaged spans
//! surface their story without aborting a whole `list` or `alloc` pass.

#[cfg(test)]
mod errata_tests;

use std::error::Error as StdError;
use std::fmt;

/// How serious a note is. Ordering matters: `Error` outranks `Warn`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Stable numeric identifiers for the failure kinds the core can surface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Code {
    None = 0,
    Open = 1,
    DeviceGeometry = 2,
    IoRead = 3,
    IoWrite = 4,
    AlignmentTooLarge = 5,
    HeaderANotFound = 6,
    FooterANotFound = 7,
    StripeSyncInvalid = 8,
    NoSpace = 9,
    ConfigParse = 10,
    InvalidValue = 11,
    PercentExceeds100 = 12,
}

/// One entry in a chain.
#[derive(Clone, Debug)]
pub struct Note {
    pub severity: Severity,
    pub code: Code,
    pub text: String,
}

/// A chain of notes, most recent first.
#[derive(Clone, Debug, Default)]
pub struct Errata {
    notes: Vec<Note>,
}

impl Errata {
    #[must_use]
    pub const fn new() -> Self {
        Self { notes: Vec::new() }
    }

    /// A chain holding a single error note.
    #[must_use]
    pub fn error(code: Code, text: impl Into<String>) -> Self {
        let mut zret = Self::new();
        zret.push(Severity::Error, code, text);
        zret
    }

    /// Prepend a note; the chain reads newest to oldest.
    pub fn push(&mut self, severity: Severity, code: Code, text: impl Into<String>) -> &mut Self {
        self.notes.insert(
            0,
            Note {
                severity,
                code,
                text: text.into(),
            },
        );
        self
    }

    pub fn info(&mut self, text: impl Into<String>) -> &mut Self {
        self.push(Severity::Info, Code::None, text)
    }

    pub fn warn(&mut self, code: Code, text: impl Into<String>) -> &mut Self {
        self.push(Severity::Warn, code, text)
    }

    /// Fold another chain into this one, newest notes staying in front.
    pub fn absorb(&mut self, other: Self) -> &mut Self {
        let tail = std::mem::take(&mut self.notes);
        self.notes = other.notes;
        self.notes.extend(tail);
        self
    }

    /// True when no note has `Error` severity. Info and warn notes (for
    /// example a dry-run "no write performed") do not fail an operation.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        !self.notes.iter().any(|n| n.severity == Severity::Error)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.notes.len()
    }

    /// Most recent note, if any.
    #[must_use]
    pub fn top(&self) -> Option<&Note> {
        self.notes.first()
    }

    pub fn notes(&self) -> impl Iterator<Item = &Note> {
        self.notes.iter()
    }

    #[must_use]
    pub fn has_code(&self, code: Code) -> bool {
        self.notes.iter().any(|n| n.code == code)
    }
}

impl fmt::Display for Errata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for note in &self.notes {
            writeln!(f, "{} [{}]: {}", note.severity, note.code as u32, note.text)?;
        }
        Ok(())
    }
}

impl StdError for Errata {}
