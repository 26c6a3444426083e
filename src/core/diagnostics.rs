//! Diagnostic sink.
//!
//! Warnings and errors raised while finalizing fragments are written to
//! standard error as one line each (`warning: ...`, `error: ...`) and kept so
//! callers can inspect them after a failed finalize.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => f.write_str("warning"),
            Severity::Error => f.write_str("error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)
    }
}

#[derive(Debug)]
pub struct Diagnostics {
    /// Echo each diagnostic to standard error.
    echo: bool,
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new(echo: bool) -> Self {
        Self { echo, entries: Vec::new() }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.push(Severity::Warning, message.into());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(Severity::Error, message.into());
    }

    fn push(&mut self, severity: Severity, message: String) {
        match severity {
            Severity::Warning => log::warn!("{}", message),
            Severity::Error => log::error!("{}", message),
        }
        let diagnostic = Diagnostic { severity, message };
        if self.echo {
            eprintln!("{}", diagnostic);
        }
        self.entries.push(diagnostic);
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.entries.iter().filter(|d| d.severity == severity).count()
    }

    pub fn last(&self) -> Option<&Diagnostic> {
        self.entries.last()
    }

    /// Hand over everything recorded so far and start empty.
    pub fn take_entries(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.entries)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
