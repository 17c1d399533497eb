//! Host-side I/O objects reachable from a guest through `open`.
//!
//! Every backend implements the same four operations. A backend that cannot
//! support an operation (reading a log sink, writing stdin) fails it with an
//! [`io::ErrorKind::Unsupported`] error.

use std::io;

use bitflags::bitflags;

pub mod file;
pub mod host;
pub mod http;
pub mod log;
pub mod stream;

pub use file::{DirJail, Jail, JailedFile, NoJail};
pub use host::HostDescriptor;
pub use http::HttpResource;
pub use log::LogSink;
pub use stream::{shared_reader, shared_writer, SharedBuffer, SharedReader, SharedWriter, StreamProxy};

bitflags! {
    /// Flags accepted by `open`. Only `file` URLs look at them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        /// Create the file if it does not exist.
        const CREATE = 0x1;
        /// Truncate an existing file to zero length.
        const TRUNCATE = 0x2;
        /// Position every write at the end of the file.
        const APPEND = 0x4;
    }
}

/// A uniform read/write/flush/close capability.
pub trait Resource: Send {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Read up to `buf.len()` bytes. `Ok(0)` means end of stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write bytes, returning how many were accepted.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Push buffered state through to the backend.
    fn flush(&mut self) -> io::Result<()>;

    /// Release the backend. Further operations fail.
    fn close(&mut self) -> io::Result<()>;
}

pub(crate) fn unsupported(resource: &str, op: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{} does not support {}", resource, op),
    )
}

pub(crate) fn closed(resource: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("{} is closed", resource),
    )
}
