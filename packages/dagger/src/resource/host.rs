//! Raw host descriptors (`fd://N`).
//!
//! Legacy escape hatch that lets a guest reach a descriptor the host already
//! holds. The descriptor is re-opened through `/dev/fd`, so the guest works on
//! its own handle and closing it never closes the host's.

use std::fs::File;
use std::io::{self, Read, Write};

use super::{closed, Resource};

pub struct HostDescriptor {
    name: String,
    file: Option<File>,
}

impl HostDescriptor {
    /// Open an independent handle onto host descriptor `fd`.
    pub fn open(fd: u32) -> io::Result<Self> {
        let file = reopen(fd)?;
        Ok(Self {
            name: format!("fd://{}", fd),
            file: Some(file),
        })
    }

    fn file(&mut self) -> io::Result<&mut File> {
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(closed(&self.name)),
        }
    }
}

#[cfg(unix)]
fn reopen(fd: u32) -> io::Result<File> {
    use std::fs::OpenOptions;

    let path = format!("/dev/fd/{}", fd);
    // Descriptors may be read-only or write-only; take the widest access the
    // host allows.
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .or_else(|_| OpenOptions::new().write(true).open(&path))
        .or_else(|_| OpenOptions::new().read(true).open(&path))
}

#[cfg(not(unix))]
fn reopen(fd: u32) -> io::Result<File> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("host descriptor {} cannot be opened on this platform", fd),
    ))
}

impl Resource for HostDescriptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file()?.read(buf)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.file()?.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file()?.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(_) => Ok(()),
            None => Err(closed(&self.name)),
        }
    }
}
