//! Files confined to a jail directory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use super::{closed, OpenFlags, Resource};

/// A confined filesystem that guests reach through `file://` URLs.
///
/// Implementations must reject any path that resolves outside their root,
/// including through symlinks.
pub trait Jail: Send + Sync {
    fn open(&self, path: &str, flags: OpenFlags) -> io::Result<File>;
}

/// A jail rooted at a host directory.
#[derive(Debug, Clone)]
pub struct DirJail {
    root: PathBuf,
}

impl DirJail {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a guest path onto the host, refusing to climb above the root.
    ///
    /// Guest paths are always relative to the jail; a leading `/` is the
    /// jail root.
    pub fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let mut relative = PathBuf::new();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::ParentDir => {
                    if !relative.pop() {
                        return Err(io::Error::new(
                            io::ErrorKind::PermissionDenied,
                            format!("{} escapes the jail", path),
                        ));
                    }
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }
        if relative.as_os_str().is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "path names the jail root",
            ));
        }
        Ok(self.root.join(relative))
    }

    /// Follow symlinks on `host_path` and refuse targets outside the root.
    ///
    /// A missing file is checked through its parent directory, so creating
    /// it cannot land outside the jail either. A dangling symlink fails.
    fn confine(&self, host_path: &Path) -> io::Result<()> {
        let root = self.root.canonicalize()?;
        let target = match fs::symlink_metadata(host_path) {
            Ok(_) => host_path.canonicalize()?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => match host_path.parent() {
                Some(parent) => parent.canonicalize()?,
                None => return Err(e),
            },
            Err(e) => return Err(e),
        };
        if !target.starts_with(&root) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} escapes the jail", host_path.display()),
            ));
        }
        Ok(())
    }
}

impl Jail for DirJail {
    fn open(&self, path: &str, flags: OpenFlags) -> io::Result<File> {
        let host_path = self.resolve(path)?;
        self.confine(&host_path)?;
        let mut options = OpenOptions::new();
        options.read(true);
        if flags.contains(OpenFlags::APPEND) {
            options.append(true);
        } else {
            options.write(true);
        }
        options
            .create(flags.contains(OpenFlags::CREATE))
            .truncate(flags.contains(OpenFlags::TRUNCATE));
        options.open(host_path)
    }
}

/// A jail with nothing in it. Every open fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoJail;

impl Jail for NoJail {
    fn open(&self, path: &str, _flags: OpenFlags) -> io::Result<File> {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{}: no filesystem is mounted", path),
        ))
    }
}

/// An open file inside a jail.
pub struct JailedFile {
    path: String,
    file: Option<File>,
}

impl JailedFile {
    pub fn new(path: impl Into<String>, file: File) -> Self {
        Self {
            path: path.into(),
            file: Some(file),
        }
    }

    fn file(&mut self) -> io::Result<&mut File> {
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(closed(&self.path)),
        }
    }
}

impl Resource for JailedFile {
    fn name(&self) -> &str {
        &self.path
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file()?.read(buf)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.file()?.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        let file = self.file()?;
        file.flush()?;
        file.sync_data()
    }

    fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(file) => file.sync_all(),
            None => Err(closed(&self.path)),
        }
    }
}
