//! Severity-coded console output.
//!
//! Progress goes to stderr so stdout stays clean for `schema` and
//! `completions`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Ok,
    Warn,
    Fail,
}

impl Severity {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Info => "[INFO]",
            Self::Ok => "[ OK ]",
            Self::Warn => "[WARN]",
            Self::Fail => "[FAIL]",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

/// Format a line with its severity prefix.
pub fn line(severity: Severity, msg: &str) -> String {
    format!("{} {}", severity.prefix(), msg)
}

pub fn emit(severity: Severity, msg: &str) {
    eprintln!("{}", line(severity, msg));
}

pub fn info(msg: &str) {
    emit(Severity::Info, msg);
}

pub fn ok(msg: &str) {
    emit(Severity::Ok, msg);
}

pub fn warn(msg: &str) {
    emit(Severity::Warn, msg);
}

pub fn fail(msg: &str) {
    emit(Severity::Fail, msg);
}
