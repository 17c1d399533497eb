use archway_dagger::{resolve_imports, ErrorKind, Process, SharedBuffer, UnresolvedImport};
use wasmtime::{Engine, Instance, Module, Store};

const GUEST: &str = r#"
(module
  (import "dagger" "open" (func $open (param i32 i32 i32) (result i64)))
  (import "dagger" "write" (func $write (param i32 i32 i32) (result i64)))
  (import "env" "close" (func $close (param i32) (result i64)))
  (memory (export "memory") 1)
  (data (i32.const 0) "stdout://")
  (func (export "open_stdout") (result i64)
    (call $open (i32.const 0) (i32.const 9) (i32.const 0)))
  (func (export "write") (param $fd i32) (param $ptr i32) (param $len i32) (result i64)
    (call $write (local.get $fd) (local.get $ptr) (local.get $len)))
  (func (export "close") (param $fd i32) (result i64)
    (call $close (local.get $fd))))
"#;

const NO_MEMORY: &str = r#"
(module
  (import "dagger" "write" (func $write (param i32 i32 i32) (result i64)))
  (func (export "write") (param $fd i32) (param $ptr i32) (param $len i32) (result i64)
    (call $write (local.get $fd) (local.get $ptr) (local.get $len))))
"#;

fn instantiate(source: &str, process: Process) -> (Store<Process>, Instance) {
    let engine = Engine::default();
    let module = Module::new(&engine, wat::parse_str(source).unwrap()).unwrap();
    let mut store = Store::new(&engine, process);
    let imports = resolve_imports(&mut store, &module).unwrap();
    let instance = Instance::new(&mut store, &module, &imports).unwrap();
    (store, instance)
}

fn call_write(store: &mut Store<Process>, instance: &Instance, fd: i32, ptr: i32, len: i32) -> i64 {
    instance
        .get_typed_func::<(i32, i32, i32), i64>(&mut *store, "write")
        .unwrap()
        .call(&mut *store, (fd, ptr, len))
        .unwrap()
}

#[test]
fn guest_opens_and_writes_through_memory() {
    let stdout = SharedBuffer::new();
    let (mut store, instance) = instantiate(GUEST, Process::new("abi").with_stdout(stdout.clone()));

    let fd = instance
        .get_typed_func::<(), i64>(&mut store, "open_stdout")
        .unwrap()
        .call(&mut store, ())
        .unwrap();
    assert_eq!(fd, 0);

    assert_eq!(call_write(&mut store, &instance, fd as i32, 0, 9), 9);
    assert_eq!(stdout.to_string_lossy(), "stdout://");
    assert_eq!(store.data().syscalls(), 2);
}

#[test]
fn out_of_bounds_write_is_rejected() {
    let stdout = SharedBuffer::new();
    let (mut store, instance) = instantiate(GUEST, Process::new("abi").with_stdout(stdout.clone()));
    let fd = store.data_mut().open_fd("stdout://", 0) as i32;

    // One page is 65536 bytes.
    let oob = ErrorKind::OutOfBounds.code();
    assert_eq!(call_write(&mut store, &instance, fd, 65530, 10), oob);
    assert_eq!(call_write(&mut store, &instance, fd, 65536, 1), oob);
    assert_eq!(call_write(&mut store, &instance, fd, -1, 2), oob);
    assert!(stdout.contents().is_empty());

    assert_eq!(call_write(&mut store, &instance, fd, 65532, 4), 4);
}

#[test]
fn guest_without_memory_only_passes_empty_ranges() {
    let stdout = SharedBuffer::new();
    let (mut store, instance) =
        instantiate(NO_MEMORY, Process::new("abi").with_stdout(stdout.clone()));
    let fd = store.data_mut().open_fd("stdout://", 0) as i32;

    assert_eq!(call_write(&mut store, &instance, fd, 0, 0), 0);
    assert_eq!(
        call_write(&mut store, &instance, fd, 0, 1),
        ErrorKind::OutOfBounds.code()
    );
}

#[test]
fn close_through_env_module() {
    let (mut store, instance) = instantiate(GUEST, Process::new("abi").with_stdout(SharedBuffer::new()));
    let fd = store.data_mut().open_fd("stdout://", 0) as i32;
    let close = instance
        .get_typed_func::<i32, i64>(&mut store, "close")
        .unwrap();

    assert_eq!(close.call(&mut store, fd).unwrap(), 0);
    assert_eq!(close.call(&mut store, fd).unwrap(), -1);
    assert!(store.data().descriptors().is_empty());
}

#[test]
fn link_counts_import_resolutions_not_calls() {
    let (mut store, instance) = instantiate(GUEST, Process::new("abi").with_stdout(SharedBuffer::new()));
    assert_eq!(store.data().import_resolutions(), 3);

    let fd = store.data_mut().open_fd("stdout://", 0) as i32;
    for _ in 0..5 {
        call_write(&mut store, &instance, fd, 0, 1);
    }
    assert_eq!(store.data().import_resolutions(), 3);
    assert_eq!(store.data().syscalls(), 5);
}

#[test]
fn unknown_import_fails_to_link() {
    let source = r#"
(module
  (import "dagger" "open" (func (param i32 i32 i32) (result i64)))
  (import "dagger" "socket" (func (param i32) (result i64))))
"#;
    let engine = Engine::default();
    let module = Module::new(&engine, wat::parse_str(source).unwrap()).unwrap();
    let mut store = Store::new(&engine, Process::new("abi"));

    let err = resolve_imports(&mut store, &module).unwrap_err();
    assert_eq!(
        err,
        UnresolvedImport {
            module: "dagger".to_string(),
            name: "socket".to_string(),
            kind: "func",
        }
    );
    assert_eq!(store.data().import_resolutions(), 2);
}

#[test]
fn imported_memory_is_not_resolved() {
    let source = r#"(module (import "env" "memory" (memory 1)))"#;
    let engine = Engine::default();
    let module = Module::new(&engine, wat::parse_str(source).unwrap()).unwrap();
    let mut store = Store::new(&engine, Process::new("abi"));

    let err = resolve_imports(&mut store, &module).unwrap_err();
    assert_eq!(err.kind, "memory");
}

#[test]
fn numeric_global_imports_read_as_zero() {
    let source = r#"
(module
  (import "env" "base" (global $base i32))
  (import "env" "scale" (global $scale (mut f64)))
  (import "dagger" "flush" (func $flush (param i32) (result i64)))
  (func (export "base") (result i32) (global.get $base))
  (func (export "scale") (result f64) (global.get $scale)))
"#;
    let (mut store, instance) = instantiate(source, Process::new("abi"));

    let base = instance
        .get_typed_func::<(), i32>(&mut store, "base")
        .unwrap()
        .call(&mut store, ())
        .unwrap();
    let scale = instance
        .get_typed_func::<(), f64>(&mut store, "scale")
        .unwrap()
        .call(&mut store, ())
        .unwrap();
    assert_eq!(base, 0);
    assert_eq!(scale, 0.0);
    assert_eq!(store.data().import_resolutions(), 1);
}

#[test]
fn reference_global_import_is_not_resolved() {
    let source = r#"(module (import "env" "handle" (global externref)))"#;
    let engine = Engine::default();
    let module = Module::new(&engine, wat::parse_str(source).unwrap()).unwrap();
    let mut store = Store::new(&engine, Process::new("abi"));

    let err = resolve_imports(&mut store, &module).unwrap_err();
    assert_eq!(err.kind, "global");
    assert_eq!(err.name, "handle");
}
