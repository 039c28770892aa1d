use std::error::Error as StdError;
use std::fmt;

/// Formats an error and its full `source()` chain on a single line
/// (`"error: cause: root cause"`), instead of `Debug`'s multi-line dump.
/// Used at every `tracing` call site that logs an error rather than
/// propagating it, so logs stay grep-able.
pub struct FmtCompactError<'e>(&'e (dyn StdError + 'static));

impl fmt::Display for FmtCompactError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }
        Ok(())
    }
}

pub trait FmtCompact {
    fn fmt_compact(&self) -> FmtCompactError<'_>;
}

impl<E> FmtCompact for E
where
    E: StdError + 'static,
{
    fn fmt_compact(&self) -> FmtCompactError<'_> {
        FmtCompactError(self)
    }
}

pub type WhateverResult<T> = std::result::Result<T, snafu::Whatever>;
