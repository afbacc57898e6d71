//! Script backtraces and error reports.

use std::fmt;

use pawn_core::{ErrorCode, Image};

/// One frame of a script backtrace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Bytecode offset: the faulting instruction for the innermost frame,
    /// the call site for the others.
    pub cip: u32,
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let function = self.function.as_deref().unwrap_or("<unknown>");
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{function} ({file}:{line})"),
            (Some(file), None) => write!(f, "{function} ({file})"),
            _ => write!(f, "{function} (cip {:#x})", self.cip),
        }
    }
}

/// Frames of a failed invocation, innermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backtrace {
    frames: Vec<StackFrame>,
}

impl Backtrace {
    /// Resolve code offsets, innermost first, against an image's symbols.
    pub fn resolve(image: &Image, cips: impl IntoIterator<Item = u32>) -> Self {
        let debug = image.debug();
        let frames = cips
            .into_iter()
            .map(|cip| StackFrame {
                cip,
                function: image.function_name_at(cip).map(str::to_owned),
                file: debug.and_then(|d| d.lookup_file(cip)).map(str::to_owned),
                line: debug.and_then(|d| d.lookup_line(cip)),
            })
            .collect();
        Backtrace { frames }
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl fmt::Display for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (depth, frame) in self.frames.iter().enumerate() {
            writeln!(f, "  [{depth}] {frame}")?;
        }
        Ok(())
    }
}

/// What the error listener receives for every failed invocation.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    /// Name of the runtime the error happened in.
    pub runtime: String,
    pub code: ErrorCode,
    pub message: String,
    /// Empty for errors detected after the script returned (leaks).
    pub backtrace: Backtrace,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{}] error {}: {}", self.runtime, self.code.as_i32(), self.message)?;
        if !self.backtrace.is_empty() {
            write!(f, "{}", self.backtrace)?;
        }
        Ok(())
    }
}

/// Receives script error reports.
pub trait ErrorListener: Send + Sync {
    fn on_error(&self, report: &ErrorReport);
}

impl<F> ErrorListener for F
where
    F: Fn(&ErrorReport) + Send + Sync,
{
    fn on_error(&self, report: &ErrorReport) {
        self(report)
    }
}
