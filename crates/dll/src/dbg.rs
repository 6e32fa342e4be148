//! Debugger output for the injected dll.
//!
//! Host applications rarely have a console, so logs go to `OutputDebugStringW`, one message
//! per line. View them with [DebugView](https://docs.microsoft.com/en-us/sysinternals/downloads/debugview).

use std::io::{self, Write};

use tracing_subscriber::fmt::MakeWriter;
use windows::{Win32::System::Diagnostics::Debug::OutputDebugStringW, core::PCWSTR};

type Sink = fn(&[u16]);

fn output_debug_string(message: &[u16]) {
    unsafe { OutputDebugStringW(PCWSTR(message.as_ptr())) };
}

/// [`MakeWriter`] tagging every line with `prefix`.
#[derive(Debug, Clone, Copy)]
pub struct DebuggerOutput {
    prefix: &'static str,
}

impl DebuggerOutput {
    pub const fn new(prefix: &'static str) -> Self {
        Self { prefix }
    }
}

impl MakeWriter<'_> for DebuggerOutput {
    type Writer = LineWriter<Sink>;

    fn make_writer(&self) -> Self::Writer {
        LineWriter::new(self.prefix, output_debug_string)
    }
}

/// Writer passing each complete line to `sink` as a nul terminated wide string.
///
/// A trailing partial line is passed on drop.
pub struct LineWriter<F: FnMut(&[u16])> {
    prefix: &'static str,
    pending: Vec<u8>,
    sink: F,
}

impl<F: FnMut(&[u16])> LineWriter<F> {
    fn new(prefix: &'static str, sink: F) -> Self {
        Self {
            prefix,
            pending: Vec::new(),
            sink,
        }
    }

    fn emit(&mut self, line: &[u8]) {
        let mut wide: Vec<u16> = self.prefix.encode_utf16().collect();
        wide.extend(String::from_utf8_lossy(line).encode_utf16());
        wide.push(0);
        (self.sink)(&wide);
    }
}

impl<F: FnMut(&[u16])> Write for LineWriter<F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            self.emit(&line);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<F: FnMut(&[u16])> Drop for LineWriter<F> {
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let rest = std::mem::take(&mut self.pending);
        self.emit(&rest);
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, io::Write};

    use super::LineWriter;

    fn collect(writes: &[&[u8]]) -> Vec<String> {
        let messages = RefCell::new(Vec::new());
        {
            let mut writer = LineWriter::new("asdf: ", |wide: &[u16]| {
                let (&nul, text) = wide.split_last().unwrap();
                assert_eq!(nul, 0);
                messages.borrow_mut().push(String::from_utf16(text).unwrap());
            });
            for buf in writes {
                writer.write_all(buf).unwrap();
            }
        }

        messages.into_inner()
    }

    #[test]
    fn one_message_per_line() {
        assert_eq!(
            collect(&[b"first\nsec", b"ond\n"]),
            ["asdf: first\n", "asdf: second\n"]
        );
    }

    #[test]
    fn partial_line_is_sent_on_drop() {
        assert_eq!(collect(&[b"done\ntail"]), ["asdf: done\n", "asdf: tail"]);
        assert!(collect(&[]).is_empty());
    }
}
