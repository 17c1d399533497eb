//! Proxies onto a process's standard streams.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{unsupported, Resource};

/// A readable stream shared between a process and its descriptors.
///
/// The inner reader can be swapped out (a new event payload) without
/// invalidating descriptors already bound to it.
pub type SharedReader = Arc<Mutex<Box<dyn Read + Send>>>;

/// A writable stream shared between a process and its descriptors.
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Wrap a reader so it can be shared.
pub fn shared_reader(reader: impl Read + Send + 'static) -> SharedReader {
    Arc::new(Mutex::new(Box::new(reader)))
}

/// Wrap a writer so it can be shared.
pub fn shared_writer(writer: impl Write + Send + 'static) -> SharedWriter {
    Arc::new(Mutex::new(Box::new(writer)))
}

pub(crate) fn lock<T: ?Sized>(stream: &Mutex<T>) -> MutexGuard<'_, T> {
    stream.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An in-memory writer whose contents can be inspected from the host.
///
/// Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        lock(&self.0).clone()
    }

    /// Everything written so far, lossily decoded as UTF-8.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&lock(&self.0)).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A descriptor bound to `stdin`, `stdout` or `stderr`.
pub enum StreamProxy {
    Input { name: String, stream: SharedReader },
    Output { name: String, stream: SharedWriter },
}

impl StreamProxy {
    pub fn reader(name: impl Into<String>, stream: SharedReader) -> Self {
        StreamProxy::Input {
            name: name.into(),
            stream,
        }
    }

    pub fn writer(name: impl Into<String>, stream: SharedWriter) -> Self {
        StreamProxy::Output {
            name: name.into(),
            stream,
        }
    }
}

impl Resource for StreamProxy {
    fn name(&self) -> &str {
        match self {
            StreamProxy::Input { name, .. } | StreamProxy::Output { name, .. } => name,
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            StreamProxy::Input { stream, .. } => lock(stream).read(buf),
            StreamProxy::Output { name, .. } => Err(unsupported(name, "read")),
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            StreamProxy::Output { stream, .. } => lock(stream).write(data),
            StreamProxy::Input { name, .. } => Err(unsupported(name, "write")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            StreamProxy::Output { stream, .. } => lock(stream).flush(),
            StreamProxy::Input { .. } => Ok(()),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        // The underlying stream belongs to the process, not the descriptor.
        Ok(())
    }
}
