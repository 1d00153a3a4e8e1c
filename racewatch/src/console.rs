//! Product output written directly to stdout/stderr.
//!
//! The supervisor keeps the terminal in raw mode, so output post-processing is
//! off and every line must carry its own carriage return. Each line is built in
//! memory and handed to the writer in one call so concurrent probe output
//! cannot land in the middle of it.

use std::io::{self, Write};

/// Line terminator used for every product line.
pub const LINE_END: &str = "\r\n";

/// Write `line` plus [`LINE_END`] as a single buffered write, then flush.
pub fn write_line<W: Write + ?Sized>(out: &mut W, line: &str) -> io::Result<()> {
    let mut buf = String::with_capacity(line.len() + LINE_END.len());
    buf.push_str(line);
    buf.push_str(LINE_END);
    write_block(out, &buf)
}

/// Write a preformatted block (already terminated) in one call, then flush.
pub fn write_block<W: Write + ?Sized>(out: &mut W, block: &str) -> io::Result<()> {
    out.write_all(block.as_bytes())?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_line_appends_crlf() {
        let mut out = Vec::new();
        write_line(&mut out, "hello").expect("write");
        assert_eq!(out, b"hello\r\n");
    }
}
