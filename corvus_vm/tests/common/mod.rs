//! Shared helpers for runtime integration tests.

#![allow(dead_code)]

use corvus_bytecode::{CodeBody, CodeBuilder, MethodDef, MethodFlags};
use corvus_gc::GcConfig;
use corvus_vm::{Runtime, RuntimeConfig, Thread, VmError, logging};
use std::sync::Arc;

pub fn runtime() -> Arc<Runtime> {
    runtime_with(RuntimeConfig::default())
}

pub fn runtime_with(config: RuntimeConfig) -> Arc<Runtime> {
    logging::try_init().ok();
    Runtime::new(config).unwrap()
}

/// Small stacks, so deep recursion overflows quickly.
pub fn small_stack() -> RuntimeConfig {
    RuntimeConfig {
        stack_words: 16 * 1024,
        stack_reserve: 256,
        ..Default::default()
    }
}

/// Collect every few hundred allocations and verify roots.
pub fn stress() -> RuntimeConfig {
    RuntimeConfig {
        gc: GcConfig::stress(),
        ..Default::default()
    }
}

pub fn body(max_locals: u16, build: impl FnOnce(&mut CodeBuilder)) -> CodeBody {
    let mut builder = CodeBuilder::new(max_locals);
    build(&mut builder);
    builder.finish().unwrap()
}

pub fn static_method(
    name: &str,
    descriptor: &str,
    max_locals: u16,
    build: impl FnOnce(&mut CodeBuilder),
) -> MethodDef {
    method(name, descriptor, MethodFlags::STATIC, max_locals, build)
}

pub fn method(
    name: &str,
    descriptor: &str,
    flags: MethodFlags,
    max_locals: u16,
    build: impl FnOnce(&mut CodeBuilder),
) -> MethodDef {
    MethodDef::new(name, descriptor, flags, Some(body(max_locals, build)))
}

/// Look up and invoke `class.name(descriptor)`.
pub fn call(
    rt: &Runtime,
    thread: &Thread,
    class: &str,
    name: &str,
    descriptor: &str,
    args: &[u64],
) -> Result<u64, VmError> {
    let method = rt.find_method(class, name, descriptor)?;
    rt.invoke(thread, &method, args)
}

/// Argument word for an int.
pub fn int(value: i32) -> u64 {
    i64::from(value) as u64
}

/// Int result of an invocation.
pub fn as_int(word: u64) -> i32 {
    word as i64 as i32
}
