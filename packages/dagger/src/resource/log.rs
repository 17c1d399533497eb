//! Line-oriented log sink.

use std::io::{self, Write};

use chrono::Local;

use super::stream::{lock, SharedWriter};
use super::{unsupported, Resource};

const TIMESTAMP_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

/// A write-only sink that emits `<prefix><timestamp> <line>` for every
/// complete line written to it.
///
/// Partial lines are held until a newline arrives or the sink is flushed.
pub struct LogSink {
    prefix: String,
    output: SharedWriter,
    pending: Vec<u8>,
}

impl LogSink {
    pub fn new(output: SharedWriter, prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            output,
            pending: Vec::new(),
        }
    }

    fn emit(&self, line: &[u8]) -> io::Result<()> {
        let timestamp = Local::now().format(TIMESTAMP_FORMAT);
        let mut output = lock(&self.output);
        write!(output, "{}{} ", self.prefix, timestamp)?;
        output.write_all(line)?;
        output.write_all(b"\n")
    }
}

impl Resource for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(unsupported("log", "read"))
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(data);
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            self.emit(&line[..end])?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.emit(&line)?;
        }
        lock(&self.output).flush()
    }

    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}
