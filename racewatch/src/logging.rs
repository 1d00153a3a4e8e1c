//! Diagnostic tracing for the supervisor and probes.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Signal failures, reaper anomalies and timer errors are logged here.
//!
//! - **Product output (`console`)**: status lines, listings and probe reports.
//!   Always written, unaffected by `RUST_LOG`.

use std::io::{self, Write};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber for development logging.
///
/// Reads `RUST_LOG` env var. Defaults to `warn` if unset.
/// Output: stderr, compact format, bare `\n` widened to `\r\n` for raw terminals.
///
/// # Example
/// ```bash
/// RUST_LOG=racewatch=debug racewatch --probe-dir target/debug
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(|| RawModeWriter::new(io::stderr()))
                .compact(),
        )
        .init();
}

/// Writer that inserts a carriage return before every bare line feed.
///
/// With `OPOST` cleared the terminal no longer maps `\n` to `\r\n`, so log
/// lines would otherwise drift to the right.
pub struct RawModeWriter<W> {
    inner: W,
    /// Last byte written, carried across calls so a `\r\n` split between
    /// two writes is left alone.
    prev: Option<u8>,
}

impl<W: Write> RawModeWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, prev: None }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for RawModeWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut translated = Vec::with_capacity(buf.len() + 2);
        let mut prev = self.prev;
        for &byte in buf {
            if byte == b'\n' && prev != Some(b'\r') {
                translated.push(b'\r');
            }
            translated.push(byte);
            prev = Some(byte);
        }
        self.inner.write_all(&translated)?;
        self.prev = prev;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
