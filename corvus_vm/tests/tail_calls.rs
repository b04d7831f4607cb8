//! Calls in return position replace the caller's frame.

mod common;

use common::*;
use corvus_bytecode::{ClassDef, Condition, Instruction as I, MethodRef};
use corvus_jit::JitOptions;
use corvus_vm::{RuntimeConfig, names};

/// `count(n)` recurses in tail position down to zero, then reports how
/// many compiled frames are live.
fn counter() -> ClassDef {
    ClassDef::new("app/Count").method(static_method("count", "(I)I", 1, |b| {
        let recurse = b.create_label();
        b.emit(I::ILoad(0));
        b.emit_if(Condition::Gt, recurse);
        b.emit_all([
            I::InvokeStatic(MethodRef::new(names::RUNTIME, "stackDepth", "()I")),
            I::IConst(0),
            I::IAdd,
            I::IReturn,
        ]);
        b.bind_label(recurse);
        b.emit_all([
            I::ILoad(0),
            I::IConst(1),
            I::ISub,
            I::InvokeStatic(MethodRef::new("app/Count", "count", "(I)I")),
            I::IReturn,
        ]);
    }))
}

#[test]
fn test_tail_recursion_reuses_frame() {
    let rt = runtime();
    rt.define_class(&counter()).unwrap();
    let thread = rt.attach_thread();
    let depth = call(&rt, &thread, "app/Count", "count", "(I)I", &[int(50)]).unwrap();
    assert_eq!(as_int(depth), 1);
}

#[test]
fn test_disabled_tail_calls_push_frames() {
    let rt = runtime_with(RuntimeConfig {
        jit: JitOptions {
            tail_calls: false,
            ..Default::default()
        },
        ..Default::default()
    });
    rt.define_class(&counter()).unwrap();
    let thread = rt.attach_thread();
    let depth = call(&rt, &thread, "app/Count", "count", "(I)I", &[int(50)]).unwrap();
    assert_eq!(as_int(depth), 51);
}

#[test]
fn test_deep_tail_recursion_fits_small_stack() {
    let rt = runtime_with(small_stack());
    rt.define_class(&counter()).unwrap();
    let thread = rt.attach_thread();
    let depth = call(&rt, &thread, "app/Count", "count", "(I)I", &[int(100_000)]).unwrap();
    assert_eq!(as_int(depth), 1);
}

#[test]
fn test_tail_call_to_wider_callee() {
    let rt = runtime_with(small_stack());
    rt.define_class(
        &ClassDef::new("app/Spread")
            .method(static_method("sum3", "(III)I", 3, |b| {
                b.emit_all([I::ILoad(0), I::ILoad(1), I::IAdd, I::ILoad(2), I::IAdd, I::IReturn]);
            }))
            .method(static_method("spread", "(I)I", 1, |b| {
                b.emit_all([
                    I::ILoad(0),
                    I::ILoad(0),
                    I::IConst(1),
                    I::IAdd,
                    I::ILoad(0),
                    I::IConst(2),
                    I::IAdd,
                    I::InvokeStatic(MethodRef::new("app/Spread", "sum3", "(III)I")),
                    I::IReturn,
                ]);
            }))
            .method(static_method("outer", "(I)I", 1, |b| {
                b.emit_all([
                    I::ILoad(0),
                    I::InvokeStatic(MethodRef::new("app/Spread", "spread", "(I)I")),
                    I::IConst(100),
                    I::IAdd,
                    I::IReturn,
                ]);
            })),
    )
    .unwrap();
    let thread = rt.attach_thread();
    let direct = call(&rt, &thread, "app/Spread", "spread", "(I)I", &[int(10)]).unwrap();
    assert_eq!(as_int(direct), 33);
    // The caller's frame survives the callee's wider argument area.
    let nested = call(&rt, &thread, "app/Spread", "outer", "(I)I", &[int(10)]).unwrap();
    assert_eq!(as_int(nested), 133);
}

#[test]
fn test_mutual_tail_recursion() {
    let rt = runtime_with(small_stack());
    let parity = |name: &str, other: &'static str, base: i32| {
        static_method(name, "(I)I", 1, move |b| {
            let recurse = b.create_label();
            b.emit(I::ILoad(0));
            b.emit_if(Condition::Ne, recurse);
            b.emit_all([I::IConst(base), I::IReturn]);
            b.bind_label(recurse);
            b.emit_all([
                I::ILoad(0),
                I::IConst(1),
                I::ISub,
                I::InvokeStatic(MethodRef::new("app/Parity", other, "(I)I")),
                I::IReturn,
            ]);
        })
    };
    rt.define_class(
        &ClassDef::new("app/Parity")
            .method(parity("isEven", "isOdd", 1))
            .method(parity("isOdd", "isEven", 0)),
    )
    .unwrap();
    let thread = rt.attach_thread();
    let even = |n| as_int(call(&rt, &thread, "app/Parity", "isEven", "(I)I", &[int(n)]).unwrap());
    assert_eq!(even(50_001), 0);
    assert_eq!(even(50_000), 1);
}
