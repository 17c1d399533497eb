//! Per-guest process state.
//!
//! A [`Process`] owns the descriptor table of exactly one guest instance and
//! turns `open` URLs into [`Resource`]s. Its `*_fd` methods are the syscall
//! entry points used by the ABI: they log failures and encode them as
//! negative integers instead of returning errors.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::sync::Arc;

use tracing::{debug, warn};
use url::Url;

use crate::error::{DaggerError, Result};
use crate::resource::stream::lock;
use crate::resource::{
    shared_reader, shared_writer, HostDescriptor, HttpResource, Jail, JailedFile, LogSink,
    NoJail, OpenFlags, Resource, SharedReader, SharedWriter, StreamProxy,
};
use crate::table::{Descriptor, DescriptorTable};

/// Tunables for a process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Whether `fd://N` may reach raw host descriptors.
    pub allow_host_descriptors: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            allow_host_descriptors: true,
        }
    }
}

/// The host side of one guest instance.
pub struct Process {
    name: String,
    table: DescriptorTable,
    jail: Arc<dyn Jail>,
    config: ProcessConfig,

    stdin: SharedReader,
    stdout: SharedWriter,
    stderr: SharedWriter,
    log_output: SharedWriter,

    env: BTreeMap<String, String>,

    /// Number of `(module, field)` import lookups made while linking this
    /// guest. This counts link-time resolutions, not calls.
    import_resolutions: usize,
    /// Number of ABI calls the guest has made.
    syscalls: u64,
}

impl Process {
    /// Create a process with an empty jail, empty stdin and the host's
    /// stdout/stderr.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: DescriptorTable::new(),
            jail: Arc::new(NoJail),
            config: ProcessConfig::default(),
            stdin: shared_reader(io::empty()),
            stdout: shared_writer(io::stdout()),
            stderr: shared_writer(io::stderr()),
            log_output: shared_writer(io::stdout()),
            env: BTreeMap::new(),
            import_resolutions: 0,
            syscalls: 0,
        }
    }

    pub fn with_jail(mut self, jail: Arc<dyn Jail>) -> Self {
        self.jail = jail;
        self
    }

    pub fn with_config(mut self, config: ProcessConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_stdout(mut self, stdout: impl Write + Send + 'static) -> Self {
        self.stdout = shared_writer(stdout);
        self
    }

    pub fn with_stderr(mut self, stderr: impl Write + Send + 'static) -> Self {
        self.stderr = shared_writer(stderr);
        self
    }

    /// Where `log://` sinks write their lines.
    pub fn with_log_output(mut self, output: impl Write + Send + 'static) -> Self {
        self.log_output = shared_writer(output);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the input stream. Descriptors already bound to `stdin` see
    /// the new input.
    pub fn set_stdin(&mut self, stdin: impl Read + Send + 'static) {
        *lock(&self.stdin) = Box::new(stdin);
    }

    /// Replace the run-scoped environment.
    pub fn set_env(&mut self, env: BTreeMap<String, String>) {
        self.env = env;
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn getenv(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn descriptors(&self) -> &DescriptorTable {
        &self.table
    }

    /// How many imports were resolved against this process at link time.
    pub fn import_resolutions(&self) -> usize {
        self.import_resolutions
    }

    pub(crate) fn record_import_resolution(&mut self) {
        self.import_resolutions += 1;
    }

    /// How many ABI calls the guest has made.
    pub fn syscalls(&self) -> u64 {
        self.syscalls
    }

    pub(crate) fn record_syscall(&mut self) {
        self.syscalls += 1;
    }

    /// Track a host-provided resource, returning its descriptor.
    pub fn track(&mut self, resource: Box<dyn Resource>) -> Descriptor {
        self.table.insert(resource)
    }

    /// Resolve `url` to a resource and give it a descriptor.
    pub fn open(&mut self, url: &str, flags: u32) -> Result<Descriptor> {
        let resource = self.resolve(url, OpenFlags::from_bits_truncate(flags))?;
        let fd = self.table.insert(resource);
        debug!(process = %self.name, url, fd, "opened descriptor");
        Ok(fd)
    }

    fn resolve(&self, raw: &str, flags: OpenFlags) -> Result<Box<dyn Resource>> {
        let url = Url::parse(raw).map_err(|source| DaggerError::BadUrl {
            url: raw.to_string(),
            source,
        })?;

        let resource: Box<dyn Resource> = match url.scheme() {
            "log" => {
                let prefix = url
                    .query_pairs()
                    .find(|(key, _)| key == "prefix")
                    .map(|(_, value)| value.into_owned())
                    .unwrap_or_default();
                Box::new(LogSink::new(self.log_output.clone(), prefix))
            }
            "file" => {
                let path = urlencoding::decode(url.path())
                    .map_err(|e| DaggerError::bad_input("file", e))?;
                let file = self
                    .jail
                    .open(&path, flags)
                    .map_err(|e| DaggerError::bad_input("file", e))?;
                Box::new(JailedFile::new(path.into_owned(), file))
            }
            "fd" => {
                if !self.config.allow_host_descriptors {
                    return Err(DaggerError::bad_input("fd", "host descriptors are disabled"));
                }
                let host = url.host_str().unwrap_or_default();
                let fd: u32 = host
                    .parse()
                    .map_err(|_| DaggerError::bad_input("fd", format!("{:?} is not a descriptor", host)))?;
                Box::new(HostDescriptor::open(fd).map_err(|e| DaggerError::bad_input("fd", e))?)
            }
            "stdin" => Box::new(StreamProxy::reader("stdin", self.stdin.clone())),
            "stdout" => Box::new(StreamProxy::writer("stdout", self.stdout.clone())),
            "stderr" => Box::new(StreamProxy::writer("stderr", self.stderr.clone())),
            "http" | "https" => Box::new(HttpResource::new(url)),
            other => return Err(DaggerError::UnknownScheme(other.to_string())),
        };
        Ok(resource)
    }

    fn resource(&mut self, fd: i64) -> Result<(Descriptor, &mut Box<dyn Resource>)> {
        let index = Descriptor::try_from(fd).map_err(|_| DaggerError::BadDescriptor(fd))?;
        let resource = self
            .table
            .get_mut(index)
            .ok_or(DaggerError::BadDescriptor(fd))?;
        Ok((index, resource))
    }

    /// Close a descriptor.
    ///
    /// If the resource fails to close, the descriptor stays allocated and
    /// the close may be retried. Closing a free descriptor is an error and
    /// never affects another slot.
    pub fn close(&mut self, fd: i64) -> Result<()> {
        let (index, resource) = self.resource(fd)?;
        resource.close().map_err(|source| DaggerError::Io {
            op: "close",
            fd: index,
            source,
        })?;
        self.table.remove(index);
        Ok(())
    }

    pub fn write(&mut self, fd: i64, data: &[u8]) -> Result<usize> {
        let (index, resource) = self.resource(fd)?;
        resource.write(data).map_err(|source| DaggerError::Io {
            op: "write",
            fd: index,
            source,
        })
    }

    pub fn read(&mut self, fd: i64, buf: &mut [u8]) -> Result<usize> {
        let (index, resource) = self.resource(fd)?;
        resource.read(buf).map_err(|source| DaggerError::Io {
            op: "read",
            fd: index,
            source,
        })
    }

    pub fn flush(&mut self, fd: i64) -> Result<()> {
        let (index, resource) = self.resource(fd)?;
        resource.flush().map_err(|source| DaggerError::Io {
            op: "flush",
            fd: index,
            source,
        })
    }

    /// `open` syscall: a descriptor, or the negated errno of the failure.
    pub fn open_fd(&mut self, url: &str, flags: u32) -> i64 {
        match self.open(url, flags) {
            Ok(fd) => fd as i64,
            Err(e) => {
                warn!(process = %self.name, url, flags, error = %e, "open failed");
                e.code()
            }
        }
    }

    /// `close` syscall: 0 or -1.
    pub fn close_fd(&mut self, fd: i64) -> i64 {
        match self.close(fd) {
            Ok(()) => 0,
            Err(e) => {
                warn!(process = %self.name, fd, error = %e, "close failed");
                -1
            }
        }
    }

    /// `write` syscall: bytes written or -1.
    pub fn write_fd(&mut self, fd: i64, data: &[u8]) -> i64 {
        match self.write(fd, data) {
            Ok(n) => n as i64,
            Err(e) => {
                warn!(process = %self.name, fd, len = data.len(), error = %e, "write failed");
                -1
            }
        }
    }

    /// `read` syscall: bytes read or -1.
    pub fn read_fd(&mut self, fd: i64, buf: &mut [u8]) -> i64 {
        match self.read(fd, buf) {
            Ok(n) => n as i64,
            Err(e) => {
                warn!(process = %self.name, fd, len = buf.len(), error = %e, "read failed");
                -1
            }
        }
    }

    /// `flush` syscall: 0 or -1.
    pub fn flush_fd(&mut self, fd: i64) -> i64 {
        match self.flush(fd) {
            Ok(()) => 0,
            Err(e) => {
                warn!(process = %self.name, fd, error = %e, "flush failed");
                -1
            }
        }
    }

    /// Close every open descriptor. Failures are logged and the resource is
    /// dropped anyway.
    pub fn close_all(&mut self) {
        for (fd, mut resource) in self.table.drain() {
            if let Err(e) = resource.close() {
                warn!(process = %self.name, fd, resource = resource.name(), error = %e, "close on teardown failed");
            }
        }
    }
}
