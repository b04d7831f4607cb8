//! Capturing compiled frames and resuming them later.

mod common;

use common::*;
use corvus_bytecode::{
    ClassDef, ClassRef, Condition, FieldDef, FieldRef, Instruction as I, MethodRef, TypeKind,
};
use corvus_vm::names;

fn capture() -> I {
    I::InvokeStatic(MethodRef::new(names::CONTINUATIONS, "capture", "()I"))
}

/// `run() = inner() + 10` where `inner` returns the capture result.
fn generator() -> ClassDef {
    ClassDef::new("app/Gen")
        .method(static_method("inner", "()I", 0, |b| {
            b.emit_all([capture(), I::IConst(0), I::IAdd, I::IReturn]);
        }))
        .method(static_method("run", "()I", 0, |b| {
            b.emit_all([
                I::InvokeStatic(MethodRef::new("app/Gen", "inner", "()I")),
                I::IConst(10),
                I::IAdd,
                I::IReturn,
            ]);
        }))
}

#[test]
fn test_resume_returns_value_from_capture() {
    let rt = runtime();
    rt.define_class(&generator()).unwrap();
    let thread = rt.attach_thread();
    assert!(thread.take_continuation().is_none());

    let first = call(&rt, &thread, "app/Gen", "run", "()I", &[]).unwrap();
    assert_eq!(as_int(first), 10);

    let continuation = thread.take_continuation().unwrap();
    assert_eq!(continuation.depth(), 2);
    assert_eq!(continuation.method().name(), "inner");

    // A continuation can be resumed any number of times.
    assert_eq!(rt.resume(&thread, &continuation, int(5)).map(as_int), Ok(15));
    assert_eq!(rt.resume(&thread, &continuation, int(7)).map(as_int), Ok(17));
}

#[test]
fn test_resume_on_another_thread() {
    let rt = runtime();
    rt.define_class(&generator()).unwrap();
    let first = rt.attach_thread();
    call(&rt, &first, "app/Gen", "run", "()I", &[]).unwrap();
    let continuation = first.take_continuation().unwrap();

    std::thread::scope(|s| {
        s.spawn(|| {
            let second = rt.attach_thread();
            assert_eq!(rt.resume(&second, &continuation, int(-3)).map(as_int), Ok(7));
        });
    });
    assert_eq!(rt.resume(&first, &continuation, int(1)).map(as_int), Ok(11));
}

#[test]
fn test_captured_frames_keep_objects_alive() {
    let rt = runtime_with(stress());
    let value = FieldRef::new("app/Box", "value", TypeKind::Int);
    rt.define_class(
        &ClassDef::new("app/Box")
            .field(FieldDef::instance("value", TypeKind::Int))
            .method(static_method("hold", "()I", 2, {
                let value = value.clone();
                move |b| {
                    b.emit_all([
                        I::New(ClassRef::new("app/Box")),
                        I::Dup,
                        I::IConst(41),
                        I::PutField(value.clone()),
                        I::AStore(0),
                        capture(),
                        I::IStore(1),
                        I::ALoad(0),
                        I::GetField(value),
                        I::ILoad(1),
                        I::IAdd,
                        I::IReturn,
                    ]);
                }
            }))
            .method(static_method("churn", "(I)V", 1, move |b| {
                let top = b.create_label();
                let done = b.create_label();
                b.bind_label(top);
                b.emit(I::ILoad(0));
                b.emit_if(Condition::Le, done);
                b.emit_all([
                    I::New(ClassRef::new("app/Box")),
                    I::Dup,
                    I::IConst(-1),
                    I::PutField(value.clone()),
                    I::Pop,
                    I::IInc(0, -1),
                ]);
                b.emit_goto(top);
                b.bind_label(done);
                b.emit(I::Return);
            })),
    )
    .unwrap();
    let thread = rt.attach_thread();
    let first = call(&rt, &thread, "app/Box", "hold", "()I", &[]).unwrap();
    assert_eq!(as_int(first), 41);
    let continuation = thread.take_continuation().unwrap();

    call(&rt, &thread, "app/Box", "churn", "(I)V", &[int(5_000)]).unwrap();
    rt.collect_garbage();
    assert!(rt.stats().gc.collections > 0);

    assert_eq!(rt.resume(&thread, &continuation, int(1)).map(as_int), Ok(42));
}

#[test]
fn test_capture_outside_compiled_code_fails() {
    let rt = runtime();
    let thread = rt.attach_thread();
    let err = call(&rt, &thread, names::CONTINUATIONS, "capture", "()I", &[]).unwrap_err();
    assert_eq!(err.exception_class(), Some(names::INTERNAL_ERROR));
    assert!(thread.take_continuation().is_none());
}
