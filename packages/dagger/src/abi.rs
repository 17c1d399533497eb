//! Host functions imported by dagger guests.
//!
//! Guests import these under the `dagger` (or `env`) module:
//!
//! | name      | signature                                       | result                  |
//! |-----------|-------------------------------------------------|-------------------------|
//! | `open`    | `(url_ptr: i32, url_len: i32, flags: i32)`      | descriptor or `-errno`  |
//! | `close`   | `(fd: i32)`                                     | `0` or `-1`             |
//! | `write`   | `(fd: i32, ptr: i32, len: i32)`                 | bytes written or `-1`   |
//! | `read`    | `(fd: i32, ptr: i32, len: i32)`                 | bytes read or `-1`      |
//! | `flush`   | `(fd: i32)`                                     | `0` or `-1`             |
//! | `env_get` | `(key_ptr: i32, key_len: i32, val_ptr: i32, val_len: i32)` | value length or `-errno` |
//!
//! All results are `i64`. Any pointer range that leaves guest memory fails
//! with `-5` (out of bounds) before the host touches a byte.

use thiserror::Error;
use tracing::{debug, warn};
use wasmtime::{Caller, Extern, ExternType, Func, Global, Module, Store, Val, ValType};

use crate::error::ErrorKind;
use crate::memory::{GuestMemory, OutOfBounds};
use crate::process::Process;

/// Import module names the resolver answers for.
pub const IMPORT_MODULES: [&str; 2] = ["dagger", "env"];

/// Access to the [`Process`] inside a wasmtime store's data.
pub trait ProcessHost {
    fn process(&self) -> &Process;
    fn process_mut(&mut self) -> &mut Process;
}

impl ProcessHost for Process {
    fn process(&self) -> &Process {
        self
    }

    fn process_mut(&mut self) -> &mut Process {
        self
    }
}

/// An import the resolver could not satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unresolved import {module}::{name} ({kind})")]
pub struct UnresolvedImport {
    pub module: String,
    pub name: String,
    pub kind: &'static str,
}

fn fault(process: &Process, op: &str, error: OutOfBounds) -> i64 {
    warn!(process = %process.name(), op, error = %error, "guest memory fault");
    ErrorKind::OutOfBounds.code()
}

pub fn sys_open(
    process: &mut Process,
    memory: &GuestMemory<'_>,
    ptr: u32,
    len: u32,
    flags: u32,
) -> i64 {
    process.record_syscall();
    let bytes = match memory.slice(ptr, len) {
        Ok(bytes) => bytes,
        Err(e) => return fault(process, "open", e),
    };
    match std::str::from_utf8(bytes) {
        Ok(url) => process.open_fd(url, flags),
        Err(e) => {
            warn!(process = %process.name(), error = %e, "open url is not utf-8");
            ErrorKind::BadUrl.code()
        }
    }
}

pub fn sys_close(process: &mut Process, fd: i32) -> i64 {
    process.record_syscall();
    process.close_fd(fd.into())
}

pub fn sys_write(
    process: &mut Process,
    memory: &GuestMemory<'_>,
    fd: i32,
    ptr: u32,
    len: u32,
) -> i64 {
    process.record_syscall();
    match memory.slice(ptr, len) {
        Ok(data) => process.write_fd(fd.into(), data),
        Err(e) => fault(process, "write", e),
    }
}

pub fn sys_read(
    process: &mut Process,
    memory: &mut GuestMemory<'_>,
    fd: i32,
    ptr: u32,
    len: u32,
) -> i64 {
    process.record_syscall();
    match memory.slice_mut(ptr, len) {
        Ok(buf) => process.read_fd(fd.into(), buf),
        Err(e) => fault(process, "read", e),
    }
}

pub fn sys_flush(process: &mut Process, fd: i32) -> i64 {
    process.record_syscall();
    process.flush_fd(fd.into())
}

/// Copy an environment value into guest memory.
///
/// Returns the full length of the value; only the first `val_len` bytes are
/// copied, so a guest can size its buffer with a zero-length probe.
pub fn sys_env_get(
    process: &mut Process,
    memory: &mut GuestMemory<'_>,
    key_ptr: u32,
    key_len: u32,
    val_ptr: u32,
    val_len: u32,
) -> i64 {
    process.record_syscall();
    let key = match memory.slice(key_ptr, key_len) {
        Ok(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        Err(e) => return fault(process, "env_get", e),
    };
    let dest = match memory.slice_mut(val_ptr, val_len) {
        Ok(dest) => dest,
        Err(e) => return fault(process, "env_get", e),
    };
    match process.getenv(&key) {
        Some(value) => {
            let n = value.len().min(dest.len());
            dest[..n].copy_from_slice(&value.as_bytes()[..n]);
            value.len() as i64
        }
        None => ErrorKind::BadUrlInput.code(),
    }
}

/// Run `call` with the calling guest's process and memory.
///
/// A guest that exports no `memory` gets an empty region, so every pointer
/// it passes is out of bounds.
fn with_guest<T: ProcessHost + 'static>(
    caller: &mut Caller<'_, T>,
    call: impl FnOnce(&mut Process, &mut GuestMemory<'_>) -> i64,
) -> i64 {
    match caller.get_export("memory").and_then(Extern::into_memory) {
        Some(memory) => {
            let (data, state) = memory.data_and_store_mut(&mut *caller);
            call(state.process_mut(), &mut GuestMemory::new(data))
        }
        None => call(caller.data_mut().process_mut(), &mut GuestMemory::empty()),
    }
}

/// Resolve one `(module, field)` import to a host function.
///
/// Every call counts as one import resolution on the store's process,
/// whether or not the name is recognized.
pub fn resolve_func<T: ProcessHost + 'static>(
    store: &mut Store<T>,
    module: &str,
    field: &str,
) -> Option<Func> {
    store.data_mut().process_mut().record_import_resolution();
    if !IMPORT_MODULES.contains(&module) {
        return None;
    }

    let func = match field {
        "open" => Func::wrap(
            &mut *store,
            |mut caller: Caller<'_, T>, ptr: u32, len: u32, flags: u32| -> i64 {
                with_guest(&mut caller, |process, memory| {
                    sys_open(process, memory, ptr, len, flags)
                })
            },
        ),
        "close" => Func::wrap(&mut *store, |mut caller: Caller<'_, T>, fd: i32| -> i64 {
            sys_close(caller.data_mut().process_mut(), fd)
        }),
        "write" => Func::wrap(
            &mut *store,
            |mut caller: Caller<'_, T>, fd: i32, ptr: u32, len: u32| -> i64 {
                with_guest(&mut caller, |process, memory| {
                    sys_write(process, memory, fd, ptr, len)
                })
            },
        ),
        "read" => Func::wrap(
            &mut *store,
            |mut caller: Caller<'_, T>, fd: i32, ptr: u32, len: u32| -> i64 {
                with_guest(&mut caller, |process, memory| {
                    sys_read(process, memory, fd, ptr, len)
                })
            },
        ),
        "flush" => Func::wrap(&mut *store, |mut caller: Caller<'_, T>, fd: i32| -> i64 {
            sys_flush(caller.data_mut().process_mut(), fd)
        }),
        "env_get" => Func::wrap(
            &mut *store,
            |mut caller: Caller<'_, T>,
             key_ptr: u32,
             key_len: u32,
             val_ptr: u32,
             val_len: u32|
             -> i64 {
                with_guest(&mut caller, |process, memory| {
                    sys_env_get(process, memory, key_ptr, key_len, val_ptr, val_len)
                })
            },
        ),
        _ => return None,
    };

    debug!(module, field, "resolved import");
    Some(func)
}

/// Resolve every import of `module`, in declaration order.
///
/// Functions come from [`resolve_func`]. Numeric global imports are
/// satisfied with a zero of their type and are not counted as import
/// resolutions. Memories, tables and reference-typed globals are
/// unresolved.
pub fn resolve_imports<T: ProcessHost + 'static>(
    store: &mut Store<T>,
    module: &Module,
) -> Result<Vec<Extern>, UnresolvedImport> {
    let mut externs = Vec::new();
    for import in module.imports() {
        let unresolved = |kind| UnresolvedImport {
            module: import.module().to_string(),
            name: import.name().to_string(),
            kind,
        };
        match import.ty() {
            ExternType::Func(_) => {
                let func = resolve_func(store, import.module(), import.name())
                    .ok_or_else(|| unresolved("func"))?;
                externs.push(Extern::Func(func));
            }
            ExternType::Global(ty) => {
                let zero = match ty.content() {
                    ValType::I32 => Val::I32(0),
                    ValType::I64 => Val::I64(0),
                    ValType::F32 => Val::F32(0),
                    ValType::F64 => Val::F64(0),
                    _ => return Err(unresolved("global")),
                };
                let global = Global::new(&mut *store, ty, zero).map_err(|_| unresolved("global"))?;
                debug!(module = import.module(), field = import.name(), "zeroed global import");
                externs.push(Extern::Global(global));
            }
            ExternType::Memory(_) => return Err(unresolved("memory")),
            ExternType::Table(_) => return Err(unresolved("table")),
            _ => return Err(unresolved("other")),
        }
    }
    Ok(externs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::SharedBuffer;
    use collection_literals::btree;

    fn guest_memory(size: usize) -> Vec<u8> {
        vec![0u8; size]
    }

    #[test]
    fn open_reads_url_from_memory() {
        let buffer = SharedBuffer::new();
        let mut process = Process::new("abi").with_stdout(buffer);
        let mut data = guest_memory(64);
        data[8..17].copy_from_slice(b"stdout://");
        let memory = GuestMemory::new(&mut data);

        assert_eq!(sys_open(&mut process, &memory, 8, 9, 0), 0);
        assert_eq!(process.syscalls(), 1);
    }

    #[test]
    fn open_with_bad_range_is_out_of_bounds() {
        let mut process = Process::new("abi");
        let mut data = guest_memory(16);
        let memory = GuestMemory::new(&mut data);
        assert_eq!(
            sys_open(&mut process, &memory, 10, 10, 0),
            ErrorKind::OutOfBounds.code()
        );
        assert!(process.descriptors().is_empty());
    }

    #[test]
    fn open_with_invalid_utf8_is_bad_url() {
        let mut process = Process::new("abi");
        let mut data = vec![0xff, 0xfe, 0xfd];
        let memory = GuestMemory::new(&mut data);
        assert_eq!(sys_open(&mut process, &memory, 0, 3, 0), ErrorKind::BadUrl.code());
    }

    #[test]
    fn write_past_end_never_reaches_resource() {
        let buffer = SharedBuffer::new();
        let mut process = Process::new("abi").with_stdout(buffer.clone());
        let fd = process.open_fd("stdout://", 0) as i32;

        let mut data = guest_memory(32);
        let memory = GuestMemory::new(&mut data);
        assert_eq!(
            sys_write(&mut process, &memory, fd, 30, 4),
            ErrorKind::OutOfBounds.code()
        );
        assert_eq!(
            sys_write(&mut process, &memory, fd, u32::MAX, 2),
            ErrorKind::OutOfBounds.code()
        );
        assert!(buffer.contents().is_empty());

        assert_eq!(sys_write(&mut process, &memory, fd, 28, 4), 4);
        assert_eq!(buffer.contents(), vec![0u8; 4]);
    }

    #[test]
    fn read_fills_guest_memory() {
        let mut process = Process::new("abi");
        process.set_stdin(std::io::Cursor::new(b"payload".to_vec()));
        let fd = process.open_fd("stdin://", 0) as i32;

        let mut data = guest_memory(32);
        {
            let mut memory = GuestMemory::new(&mut data);
            assert_eq!(sys_read(&mut process, &mut memory, fd, 4, 16), 7);
            assert_eq!(
                sys_read(&mut process, &mut memory, fd, 20, 16),
                ErrorKind::OutOfBounds.code()
            );
        }
        assert_eq!(&data[4..11], b"payload");
    }

    #[test]
    fn close_and_flush_go_through_process() {
        let mut process = Process::new("abi").with_stdout(SharedBuffer::new());
        let fd = process.open_fd("stdout://", 0) as i32;
        assert_eq!(sys_flush(&mut process, fd), 0);
        assert_eq!(sys_close(&mut process, fd), 0);
        assert_eq!(sys_close(&mut process, fd), -1);
        assert_eq!(sys_flush(&mut process, -1), -1);
        assert_eq!(process.syscalls(), 4);
    }

    #[test]
    fn env_get_copies_and_reports_length() {
        let mut process = Process::new("abi");
        process.set_env(btree! {
            "TOPIC".to_string() => "orders".to_string(),
        });

        let mut data = guest_memory(32);
        data[..5].copy_from_slice(b"TOPIC");
        {
            let mut memory = GuestMemory::new(&mut data);
            assert_eq!(sys_env_get(&mut process, &mut memory, 0, 5, 16, 3), 6);
        }
        assert_eq!(&data[16..19], b"ord");
        assert_eq!(data[19], 0);

        data[..5].copy_from_slice(b"NOPE!");
        let mut memory = GuestMemory::new(&mut data);
        assert_eq!(
            sys_env_get(&mut process, &mut memory, 0, 5, 16, 8),
            ErrorKind::BadUrlInput.code()
        );
        assert_eq!(
            sys_env_get(&mut process, &mut memory, 0, 5, 30, 8),
            ErrorKind::OutOfBounds.code()
        );
    }

    #[test]
    fn resolver_counts_every_lookup() {
        let engine = wasmtime::Engine::default();
        let mut store = Store::new(&engine, Process::new("abi"));

        assert!(resolve_func(&mut store, "dagger", "open").is_some());
        assert!(resolve_func(&mut store, "env", "write").is_some());
        assert!(resolve_func(&mut store, "dagger", "socket").is_none());
        assert!(resolve_func(&mut store, "wasi", "read").is_none());

        assert_eq!(store.data().import_resolutions(), 4);
        assert_eq!(store.data().syscalls(), 0);
    }
}
