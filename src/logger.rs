//! The gateway's own logger.
//!
//! Every line this crate ever writes has the exact shape `[RCL] [<SEVERITY>]
//! <message>\n`; nothing downstream should have to guess at a format or
//! parse structured fields out of it. That literal contract is why this is
//! a small bespoke writer rather than a `tracing`/`log` subscriber: neither
//! facade lets a caller pin the wire format this precisely, and a consumer
//! piping this gateway's stderr into another tool depends on it not
//! changing out from under them.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Severity of a single log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Verbose, request-by-request tracing. Only written when the logger
    /// was constructed with `verbose = true`.
    Debug,
    /// One line per transition worth knowing about even in production:
    /// hits, misses, stores.
    Info,
    /// Something unexpected but recoverable: a digest mismatch, a malformed
    /// stored entry, falling back to forwarding a request the gateway would
    /// normally have cached.
    Warn,
    /// The origin failed, or a store/read call returned an error.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// One argument to a log message template: substituted for `%s` (by its
/// `Display` form) or `%p` (by its `Debug` form), in the order they appear
/// in the template.
pub enum LogArg<'a> {
    /// Rendered with `Display`, for `%s`.
    Str(&'a dyn fmt::Display),
    /// Rendered with `Debug`, for `%p`.
    Debug(&'a dyn fmt::Debug),
}

impl<'a> From<&'a str> for LogArg<'a> {
    fn from(s: &'a str) -> Self {
        LogArg::Str(s)
    }
}

fn render_template(template: &str, args: &[LogArg<'_>]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut args = args.iter();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '%' {
            match chars.peek() {
                Some('s') => {
                    chars.next();
                    match args.next() {
                        Some(LogArg::Str(v)) => out.push_str(&v.to_string()),
                        Some(LogArg::Debug(v)) => out.push_str(&format!("{v:?}")),
                        None => out.push_str("%s"),
                    }
                }
                Some('p') => {
                    chars.next();
                    match args.next() {
                        Some(LogArg::Debug(v)) => out.push_str(&format!("{v:?}")),
                        Some(LogArg::Str(v)) => out.push_str(&v.to_string()),
                        None => out.push_str("%p"),
                    }
                }
                _ => out.push('%'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Writes `[RCL] [<SEVERITY>] <message>\n` lines to a shared sink.
///
/// Cheap to clone: the underlying writer is shared, so every clone of a
/// `Logger` writes to the same place (and the same mutex serializes their
/// writes, since a sink shared across concurrent requests would otherwise
/// interleave partial lines).
#[derive(Clone)]
pub struct Logger {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
    verbose: bool,
}

impl Logger {
    /// Build a logger writing to an arbitrary sink.
    pub fn new(sink: impl Write + Send + 'static, verbose: bool) -> Self {
        Self { sink: Arc::new(Mutex::new(Box::new(sink))), verbose }
    }

    /// A logger writing to stderr, the default for a gateway not otherwise
    /// configured.
    pub fn stderr(verbose: bool) -> Self {
        Self::new(io::stderr(), verbose)
    }

    /// Whether debug-level lines are written.
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Write one log line at `severity`, substituting `args` into
    /// `template`'s `%s`/`%p` placeholders in order.
    ///
    /// A `Debug`-severity call is silently dropped unless this logger was
    /// built with `verbose = true`.
    pub fn log(&self, severity: Severity, template: &str, args: &[LogArg<'_>]) {
        if severity == Severity::Debug && !self.verbose {
            return;
        }
        let message = render_template(template, args);
        let line = format!("[RCL] [{severity}] {message}\n");
        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.write_all(line.as_bytes());
        }
    }

    /// Shorthand for `log(Severity::Debug, ...)`.
    pub fn debug(&self, template: &str, args: &[LogArg<'_>]) {
        self.log(Severity::Debug, template, args);
    }

    /// Shorthand for `log(Severity::Info, ...)`.
    pub fn info(&self, template: &str, args: &[LogArg<'_>]) {
        self.log(Severity::Info, template, args);
    }

    /// Shorthand for `log(Severity::Warn, ...)`.
    pub fn warn(&self, template: &str, args: &[LogArg<'_>]) {
        self.log(Severity::Warn, template, args);
    }

    /// Shorthand for `log(Severity::Error, ...)`.
    pub fn error(&self, template: &str, args: &[LogArg<'_>]) {
        self.log(Severity::Error, template, args);
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::stderr(false)
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").field("verbose", &self.verbose).finish()
    }
}

/// A sink that buffers lines in memory, for tests that assert on exactly
/// what was logged.
#[derive(Clone, Default)]
pub struct MemorySink(Arc<Mutex<Vec<u8>>>);

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// The lines written so far, as UTF-8.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_matches_the_literal_contract() {
        let sink = MemorySink::new();
        let logger = Logger::new(sink.clone(), false);
        logger.info("cache miss for %s", &["GET /widgets/1".into()]);
        assert_eq!(sink.contents(), "[RCL] [INFO] cache miss for GET /widgets/1\n");
    }

    #[test]
    fn debug_lines_are_dropped_when_not_verbose() {
        let sink = MemorySink::new();
        let logger = Logger::new(sink.clone(), false);
        logger.debug("entered lookup", &[]);
        assert_eq!(sink.contents(), "");
    }

    #[test]
    fn debug_lines_are_written_when_verbose() {
        let sink = MemorySink::new();
        let logger = Logger::new(sink.clone(), true);
        logger.debug("entered lookup", &[]);
        assert_eq!(sink.contents(), "[RCL] [DEBUG] entered lookup\n");
    }

    #[test]
    fn percent_p_uses_debug_formatting() {
        let sink = MemorySink::new();
        let logger = Logger::new(sink.clone(), false);
        let status = 404u16;
        logger.warn("unexpected status %p", &[LogArg::Debug(&status)]);
        assert_eq!(sink.contents(), "[RCL] [WARN] unexpected status 404\n");
    }
}
