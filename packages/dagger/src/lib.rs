//! # archway-dagger
//!
//! The host side of the dagger ABI: what a sandboxed guest sees when it
//! asks the host for I/O.
//!
//! A guest never holds host objects. It holds small integers
//! ([descriptors](Descriptor)) handed out by its [`Process`], and it names
//! the things it wants to open with URLs:
//!
//! | URL                      | Resource                                  |
//! |--------------------------|-------------------------------------------|
//! | `log://?prefix=app:`     | timestamped, prefixed log lines           |
//! | `file:///path`           | a file inside the process's [`Jail`]      |
//! | `fd://3`                 | a raw host descriptor (legacy)            |
//! | `stdin://`, `stdout://`, `stderr://` | the process's standard streams |
//! | `http://…`, `https://…`  | an HTTP request/response                  |
//!
//! ## Layers
//!
//! - [`resource`]: the [`Resource`] trait and its backends.
//! - [`table`]: the sparse [`DescriptorTable`], reusing the lowest free
//!   descriptor first.
//! - [`process`]: URL resolution plus the syscall entry points, which log
//!   failures and encode them as negative integers.
//! - [`memory`]: [`GuestMemory`], the single bounds check between guest
//!   pointers and host memory.
//! - [`abi`]: the wasmtime host functions and import resolver.
//!
//! ## Example
//!
//! ```ignore
//! use archway_dagger::Process;
//!
//! let mut process = Process::new("orders+1");
//! let fd = process.open_fd("stdout://", 0);
//! process.write_fd(fd, b"hello\n");
//! assert_eq!(process.open_fd("bogus://x", 0), -3);
//! ```

pub mod abi;
pub mod error;
pub mod memory;
pub mod process;
pub mod resource;
pub mod table;

pub use abi::{resolve_func, resolve_imports, ProcessHost, UnresolvedImport, IMPORT_MODULES};
pub use error::{DaggerError, ErrorKind, Result};
pub use memory::{GuestMemory, OutOfBounds};
pub use process::{Process, ProcessConfig};
pub use resource::{DirJail, Jail, NoJail, OpenFlags, Resource, SharedBuffer};
pub use table::{Descriptor, DescriptorTable};
